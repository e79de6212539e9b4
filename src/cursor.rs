use alloc::{string::String, vec, vec::Vec};

use hashbrown::HashMap;

use crate::{
  entry::{Entry, EntryKind},
  errors::{DecodeError, OptionsError, TarError, TruncatedContext},
  header,
  io::Read,
  options::ReaderOptions,
  pax::{self, keys},
  record::RecordReader,
  sparse::{self, SparseReader},
  text::{TextDecoder, Utf8Decoder},
};

/// Streaming cursor over the entries of a tar byte stream.
///
/// The cursor owns the underlying byte source. `next_entry` advances from
/// member to member, stitching long-name, long-link and PAX continuations
/// into the entry it returns; the payload of the current entry is then
/// available through `read`/`skip` until the next advance invalidates it.
///
/// The cursor is single-threaded and not reentrant: one in-flight
/// operation at a time.
pub struct EntryCursor<R: Read, D: TextDecoder = Utf8Decoder> {
  records: RecordReader<R>,
  decoder: D,
  lenient: bool,
  /// Latches once the end-of-archive marker has been observed.
  at_eof: bool,
  current: Option<Entry>,
  /// Logical payload bytes already delivered to the caller.
  entry_offset: u64,
  /// On-disk payload size of the current entry, for padding math.
  entry_declared_size: u64,
  /// Telemetry snapshot taken where the on-disk payload starts.
  payload_start: u64,
  sparse: Option<SparseReader>,
  /// Keywords from the most recent global extended header. Replaced
  /// wholesale by each new global header, never mutated in place.
  global_pax: HashMap<String, String>,
  record_buffer: Vec<u8>,
}

impl<R: Read> EntryCursor<R> {
  #[must_use]
  pub fn new(source: R) -> Self {
    Self::with_options(source, ReaderOptions::default())
      .expect("BUG: default reader options are always valid")
  }
}

impl<R: Read, D: TextDecoder> EntryCursor<R, D> {
  pub fn with_options(source: R, options: ReaderOptions<D>) -> Result<Self, OptionsError> {
    options.validate()?;
    Ok(Self {
      records: RecordReader::new(source, options.record_size, options.block_size),
      decoder: options.text_decoder,
      lenient: options.lenient,
      at_eof: false,
      current: None,
      entry_offset: 0,
      entry_declared_size: 0,
      payload_start: 0,
      sparse: None,
      global_pax: HashMap::new(),
      record_buffer: vec![0; options.record_size],
    })
  }

  /// The entry produced by the most recent `next_entry` call.
  #[must_use]
  pub fn current_entry(&self) -> Option<&Entry> {
    self.current.as_ref()
  }

  /// Monotone count of bytes consumed from the underlying source.
  #[must_use]
  pub fn bytes_consumed(&self) -> u64 {
    self.records.bytes_consumed()
  }

  /// The currently active global extended PAX keywords.
  #[must_use]
  pub fn global_pax_headers(&self) -> &HashMap<String, String> {
    &self.global_pax
  }

  /// Releases the cursor and hands the underlying source back.
  #[must_use]
  pub fn into_inner(self) -> R {
    self.records.into_source()
  }

  /// Advances to the next archive member.
  ///
  /// Any payload of the current entry that the caller did not read is
  /// drained first. Returns `None` once the end-of-archive marker has been
  /// seen; the EOF state latches.
  pub fn next_entry(&mut self) -> Result<Option<&Entry>, TarError<R::ReadError>> {
    if self.at_eof {
      return Ok(None);
    }
    if self.current.is_some() {
      self.drain_current()?;
      // the previous entry is invalid from here on, even if the fetch
      // below fails and the caller decides to retry
      self.current = None;
    }

    let Some(mut entry) = self.fetch_entry(true)? else {
      return Ok(None);
    };

    // The on-disk payload of the stitched entry starts here.
    self.entry_offset = 0;
    self.entry_declared_size = entry.size;
    self.payload_start = self.records.bytes_consumed();

    if entry.is_pax_gnu_1x_sparse() {
      // 1.x keeps its sparse map at the front of the payload
      entry.sparse_spans = sparse::read_gnu_1x_map(&mut self.records)?;
    }
    if entry.is_sparse() {
      let spans = core::mem::take(&mut entry.sparse_spans);
      entry.sparse_spans = sparse::normalize_spans(spans, entry.real_size)?;
      self.sparse = Some(SparseReader::new(&entry.sparse_spans));
    } else {
      self.sparse = None;
    }

    Ok(Some(&*self.current.insert(entry)))
  }

  /// Reads payload bytes of the current entry, bounded by the caller's
  /// request and the remaining logical bytes.
  ///
  /// Returns 0 at the logical end of the payload, for directories, and
  /// once the archive is exhausted. Reading with no entry ever produced is
  /// a state error.
  pub fn read(&mut self, output_buffer: &mut [u8]) -> Result<usize, TarError<R::ReadError>> {
    if output_buffer.is_empty() {
      return Ok(0);
    }
    if self.at_eof || self.current.as_ref().is_some_and(Entry::is_directory) {
      return Ok(0);
    }
    if self.current.is_none() {
      return Err(DecodeError::StateError.into());
    }

    let remaining = self.remaining_logical();
    if remaining == 0 {
      return Ok(0);
    }
    let chunk = remaining.min(output_buffer.len() as u64) as usize;
    let read_bytes = match &mut self.sparse {
      Some(sparse) => sparse.read(&mut self.records, &mut output_buffer[..chunk])?,
      None => {
        let read_bytes = self.records.read(&mut output_buffer[..chunk])?;
        if read_bytes == 0 {
          return Err(TarError::truncated(TruncatedContext::Payload));
        }
        read_bytes
      },
    };
    self.entry_offset += read_bytes as u64;
    Ok(read_bytes)
  }

  /// Skips up to `count` logical payload bytes of the current entry,
  /// honoring sparse segmentation. Returns the count actually advanced;
  /// 0 for directories.
  pub fn skip(&mut self, count: u64) -> Result<u64, TarError<R::ReadError>> {
    if count == 0 {
      return Ok(0);
    }
    if self.at_eof || self.current.as_ref().is_some_and(Entry::is_directory) {
      return Ok(0);
    }
    if self.current.is_none() {
      return Err(DecodeError::StateError.into());
    }
    let amount = self.remaining_logical().min(count);
    self.skip_payload(amount)
  }

  /// Remaining logical payload bytes of the current entry; 0 for
  /// directories.
  #[must_use]
  pub fn available(&self) -> u64 {
    self.remaining_logical()
  }

  fn remaining_logical(&self) -> u64 {
    match &self.current {
      None => 0,
      Some(entry) if entry.is_directory() => 0,
      Some(entry) => {
        // sparse payloads are measured in dense bytes
        let limit = if self.sparse.is_some() {
          entry.real_size
        } else {
          self.entry_declared_size
        };
        limit.saturating_sub(self.entry_offset)
      },
    }
  }

  fn skip_payload(&mut self, amount: u64) -> Result<u64, TarError<R::ReadError>> {
    if amount == 0 {
      return Ok(0);
    }
    let skipped = match &mut self.sparse {
      Some(sparse) => sparse.skip(&mut self.records, amount)?,
      None => self.records.skip(amount)?,
    };
    self.entry_offset += skipped;
    Ok(skipped)
  }

  /// Discards whatever is left of the current entry: the unread logical
  /// payload (through the same read path callers use, so sparse
  /// bookkeeping stays accurate), any on-disk bytes the logical drain did
  /// not touch, and the record padding after the payload.
  fn drain_current(&mut self) -> Result<(), TarError<R::ReadError>> {
    loop {
      let remaining = self.remaining_logical();
      if remaining == 0 || self.skip_payload(remaining)? == 0 {
        break;
      }
    }
    let consumed = self.records.bytes_consumed() - self.payload_start;
    if consumed < self.entry_declared_size {
      self.records.skip(self.entry_declared_size - consumed)?;
    }
    self.records.consume_entry_tail(self.entry_declared_size)?;
    self.sparse = None;
    self.entry_offset = 0;
    Ok(())
  }

  /// Reads the payload of a pseudo-entry (long name, PAX block) plus its
  /// record padding.
  fn read_pseudo_payload(
    &mut self,
    size: u64,
    context: TruncatedContext,
  ) -> Result<Vec<u8>, TarError<R::ReadError>> {
    // size is attacker-controlled; grow as data actually arrives
    let mut payload = Vec::new();
    let mut remaining = size;
    while remaining > 0 {
      let chunk = remaining.min(self.record_buffer.len() as u64) as usize;
      let read_bytes = self.records.read(&mut self.record_buffer[..chunk])?;
      if read_bytes == 0 {
        return Err(TarError::truncated(context));
      }
      payload.extend_from_slice(&self.record_buffer[..read_bytes]);
      remaining -= read_bytes as u64;
    }
    self.records.consume_entry_tail(size)?;
    Ok(payload)
  }

  /// Produces the next stitched entry: reads a header record, resolves
  /// long-name/long-link carriers and PAX blocks by recursing to the
  /// member they describe, and consumes old-GNU sparse continuations.
  ///
  /// `apply_globals` is false when the caller already holds a merged PAX
  /// map it will apply itself: the nested fetch must not pre-apply the raw
  /// global state then, or a keyword the local block deleted would leak
  /// back into the entry.
  fn fetch_entry(&mut self, apply_globals: bool) -> Result<Option<Entry>, TarError<R::ReadError>> {
    if !self.records.read_record(&mut self.record_buffer)? {
      // short record at the tail: treated as the end-of-archive marker
      self.at_eof = true;
      self.records.consume_block_tail()?;
      return Ok(None);
    }
    if RecordReader::<R>::is_eof_record(&self.record_buffer) {
      self.at_eof = true;
      self
        .records
        .try_consume_second_eof_record(&mut self.record_buffer)?;
      self.records.consume_block_tail()?;
      return Ok(None);
    }

    let mut entry = header::decode(&self.record_buffer, &self.decoder, self.lenient)?;

    if entry.is_long_name() || entry.is_long_link() {
      let payload = self.read_pseudo_payload(entry.size, TruncatedContext::LongNamePayload)?;
      let text = self.decoder.decode(header::trim_nul(&payload));
      let is_name = entry.is_long_name();
      let Some(mut real) = self.fetch_entry(apply_globals)? else {
        // tolerated as end-of-archive, matching prevailing implementations
        log::warn!("long-name carrier at the end of the archive names no member");
        return Ok(None);
      };
      if is_name {
        real.name = text;
        if real.kind == EntryKind::Directory && !real.name.ends_with('/') {
          real.name.push('/');
        }
      } else {
        real.link_name = text;
      }
      return Ok(Some(real));
    }

    if entry.is_pax_global() {
      let payload = self.read_pseudo_payload(entry.size, TruncatedContext::PaxHeader)?;
      let mut spans = Vec::new();
      let replacement = pax::parse(&payload, &HashMap::new(), &mut spans, &self.decoder)?;
      if !spans.is_empty() {
        log::debug!("ignoring sparse spans carried by a global PAX header");
      }
      self.global_pax = replacement;
      return self.fetch_entry(apply_globals);
    }

    if entry.is_pax_local() {
      let payload = self.read_pseudo_payload(entry.size, TruncatedContext::PaxHeader)?;
      let mut spans = Vec::new();
      let merged = pax::parse(&payload, &self.global_pax, &mut spans, &self.decoder)?;
      if let Some(map_value) = merged.get(keys::gnu::SPARSE_MAP) {
        spans = sparse::parse_map_0_1(map_value)?;
      }
      // the merged map already carries the global layer, deletions applied
      let Some(mut real) = self.fetch_entry(false)? else {
        return Err(TarError::truncated(TruncatedContext::Record));
      };
      pax::apply_to_entry(&merged, &mut real);
      if !spans.is_empty() {
        real.sparse_spans = spans;
      }
      return Ok(Some(real));
    }

    if apply_globals && !self.global_pax.is_empty() {
      pax::apply_to_entry(&self.global_pax, &mut entry);
    }

    if entry.is_old_gnu_sparse() && entry.is_extended {
      let mut spans = core::mem::take(&mut entry.sparse_spans);
      sparse::read_old_gnu_continuations(&mut self.records, &mut self.record_buffer, &mut spans)?;
      entry.sparse_spans = spans;
    }

    Ok(Some(entry))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::SliceSource;

  #[test]
  fn test_read_before_first_entry_is_a_state_error() {
    let data = [0_u8; 1024];
    let mut cursor = EntryCursor::new(SliceSource::new(&data));
    let mut buffer = [0_u8; 4];
    assert!(matches!(
      cursor.read(&mut buffer),
      Err(TarError::Decode(DecodeError::StateError))
    ));
    assert!(matches!(
      cursor.skip(4),
      Err(TarError::Decode(DecodeError::StateError))
    ));
  }

  #[test]
  fn test_empty_archive_latches_eof() {
    let data = [0_u8; 10240];
    let mut cursor = EntryCursor::new(SliceSource::new(&data));
    assert!(cursor.next_entry().unwrap().is_none());
    assert!(cursor.next_entry().unwrap().is_none());
    // once EOF has latched, reads report exhaustion instead of state errors
    let mut buffer = [0_u8; 4];
    assert_eq!(cursor.read(&mut buffer).unwrap(), 0);
    assert_eq!(cursor.bytes_consumed() % 10240, 0);
  }

  #[test]
  fn test_empty_source_is_end_of_archive() {
    let mut cursor = EntryCursor::new(SliceSource::new(b""));
    assert!(cursor.next_entry().unwrap().is_none());
  }

  #[test]
  fn test_invalid_options_are_rejected() {
    let options = ReaderOptions {
      record_size: 100,
      ..ReaderOptions::default()
    };
    assert!(EntryCursor::with_options(SliceSource::new(b""), options).is_err());
  }
}
