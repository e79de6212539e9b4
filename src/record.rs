use crate::{
  errors::{TarError, TruncatedContext},
  io::Read,
};

/// Reads fixed-size records from the underlying byte source and accounts
/// for every byte consumed.
///
/// The count it keeps is the telemetry channel used for block-alignment
/// accounting; rewinding the one-record EOF lookahead credits the count
/// back.
pub struct RecordReader<R> {
  source: R,
  record_size: usize,
  block_size: usize,
  bytes_consumed: u64,
}

impl<R: Read> RecordReader<R> {
  #[must_use]
  pub fn new(source: R, record_size: usize, block_size: usize) -> Self {
    Self {
      source,
      record_size,
      block_size,
      bytes_consumed: 0,
    }
  }

  /// Total bytes consumed from the underlying source so far.
  #[must_use]
  pub fn bytes_consumed(&self) -> u64 {
    self.bytes_consumed
  }

  #[must_use]
  pub fn record_size(&self) -> usize {
    self.record_size
  }

  pub(crate) fn into_source(self) -> R {
    self.source
  }

  /// Read bytes straight through from the source.
  pub(crate) fn read(&mut self, output_buffer: &mut [u8]) -> Result<usize, TarError<R::ReadError>> {
    let read_bytes = self.source.read(output_buffer).map_err(TarError::Source)?;
    self.bytes_consumed += read_bytes as u64;
    Ok(read_bytes)
  }

  /// Skip forward, best effort. Returns the number of bytes skipped.
  pub(crate) fn skip(&mut self, count: u64) -> Result<u64, TarError<R::ReadError>> {
    let skipped = self.source.skip(count).map_err(TarError::Source)?;
    self.bytes_consumed += skipped;
    Ok(skipped)
  }

  /// Fills `record` (one record long) from the source.
  ///
  /// Returns false when the source could not supply a full record; a short
  /// read at the tail is treated as end of archive, not an error.
  pub(crate) fn read_record(&mut self, record: &mut [u8]) -> Result<bool, TarError<R::ReadError>> {
    debug_assert_eq!(record.len(), self.record_size);
    let mut filled = 0_usize;
    while filled < record.len() {
      let read_bytes = self.read(&mut record[filled..])?;
      if read_bytes == 0 {
        return Ok(false);
      }
      filled += read_bytes;
    }
    Ok(true)
  }

  /// True iff every byte of the record is zero. An absent record (short
  /// read at the tail) also counts as the end-of-archive marker.
  #[must_use]
  pub fn is_eof_record(record: &[u8]) -> bool {
    record.iter().all(|&byte| byte == 0)
  }

  /// Consume the second record of the end-of-archive marker.
  ///
  /// When the source can rewind, the record is peeked and pushed back if it
  /// is not all zeros. Otherwise it is consumed unconditionally, matching
  /// prevailing tar implementations that over-read one record past the
  /// archive.
  pub(crate) fn try_consume_second_eof_record(
    &mut self,
    record: &mut [u8],
  ) -> Result<(), TarError<R::ReadError>> {
    if self.source.rewindable() {
      self.source.mark();
      let before = self.bytes_consumed;
      let complete = self.read_record(record)?;
      if !complete || !Self::is_eof_record(record) {
        self.source.reset();
        self.bytes_consumed = before;
      }
    } else {
      log::debug!("source cannot rewind; consuming one lookahead record unconditionally");
      self.read_record(record)?;
    }
    Ok(())
  }

  /// Skip the padding that aligns an entry payload to a record boundary.
  pub(crate) fn consume_entry_tail(
    &mut self,
    declared_size: u64,
  ) -> Result<(), TarError<R::ReadError>> {
    let record_size = self.record_size as u64;
    let padding = (record_size - declared_size % record_size) % record_size;
    if padding > 0 {
      self.skip(padding)?;
    }
    Ok(())
  }

  /// Skip forward to the next block boundary. Short skips at EOF are
  /// silently accepted.
  pub(crate) fn consume_block_tail(&mut self) -> Result<(), TarError<R::ReadError>> {
    let block_size = self.block_size as u64;
    let padding = (block_size - self.bytes_consumed % block_size) % block_size;
    if padding > 0 {
      self.skip(padding)?;
    }
    Ok(())
  }

  /// Read exactly `buffer.len()` bytes or fail with `Truncated`.
  pub(crate) fn read_exact(
    &mut self,
    buffer: &mut [u8],
    context: TruncatedContext,
  ) -> Result<(), TarError<R::ReadError>> {
    let mut filled = 0_usize;
    while filled < buffer.len() {
      let read_bytes = self.read(&mut buffer[filled..])?;
      if read_bytes == 0 {
        return Err(TarError::truncated(context));
      }
      filled += read_bytes;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use alloc::{vec, vec::Vec};

  use super::*;
  use crate::io::SliceSource;

  fn reader(data: &[u8]) -> RecordReader<SliceSource<'_>> {
    RecordReader::new(SliceSource::new(data), 512, 5120)
  }

  #[test]
  fn test_read_record_counts_bytes() {
    let data = vec![1_u8; 1024];
    let mut records = reader(&data);
    let mut record = vec![0_u8; 512];
    assert!(records.read_record(&mut record).unwrap());
    assert_eq!(records.bytes_consumed(), 512);
    assert!(records.read_record(&mut record).unwrap());
    assert_eq!(records.bytes_consumed(), 1024);
    assert!(!records.read_record(&mut record).unwrap());
  }

  #[test]
  fn test_short_tail_record_is_eof() {
    let data = vec![1_u8; 100];
    let mut records = reader(&data);
    let mut record = vec![0_u8; 512];
    assert!(!records.read_record(&mut record).unwrap());
  }

  #[test]
  fn test_is_eof_record() {
    assert!(RecordReader::<SliceSource<'_>>::is_eof_record(&[0_u8; 512]));
    let mut record = [0_u8; 512];
    record[511] = 1;
    assert!(!RecordReader::<SliceSource<'_>>::is_eof_record(&record));
  }

  #[test]
  fn test_second_eof_lookahead_rewinds_data_record() {
    let mut data = vec![0_u8; 512];
    data.extend_from_slice(&[7_u8; 512]);
    let mut records = reader(&data);
    let mut record = vec![0_u8; 512];
    records.read_record(&mut record).unwrap();
    records.try_consume_second_eof_record(&mut record).unwrap();
    // the non-zero record was pushed back and the count credited
    assert_eq!(records.bytes_consumed(), 512);
    assert!(records.read_record(&mut record).unwrap());
    assert_eq!(record, vec![7_u8; 512]);
  }

  #[test]
  fn test_second_eof_lookahead_consumes_zero_record() {
    let data = vec![0_u8; 1024];
    let mut records = reader(&data);
    let mut record = vec![0_u8; 512];
    records.read_record(&mut record).unwrap();
    records.try_consume_second_eof_record(&mut record).unwrap();
    assert_eq!(records.bytes_consumed(), 1024);
  }

  #[test]
  fn test_forward_only_source_consumes_unconditionally() {
    let mut data = vec![0_u8; 512];
    data.extend_from_slice(&[7_u8; 512]);
    let mut slice: &[u8] = &data;
    let mut records = RecordReader::new(&mut slice, 512, 5120);
    let mut record = vec![0_u8; 512];
    records.read_record(&mut record).unwrap();
    records.try_consume_second_eof_record(&mut record).unwrap();
    assert_eq!(records.bytes_consumed(), 1024);
  }

  #[test]
  fn test_block_tail_alignment() {
    let data: Vec<u8> = (0..5120).map(|i| i as u8).collect();
    let mut records = reader(&data);
    let mut record = vec![0_u8; 512];
    records.read_record(&mut record).unwrap();
    records.consume_block_tail().unwrap();
    assert_eq!(records.bytes_consumed(), 5120);
    // already aligned: a second call consumes nothing
    records.consume_block_tail().unwrap();
    assert_eq!(records.bytes_consumed(), 5120);
  }

  #[test]
  fn test_entry_tail_padding() {
    let data = vec![9_u8; 2048];
    let mut records = reader(&data);
    let mut payload = vec![0_u8; 520];
    records
      .read_exact(&mut payload, TruncatedContext::Payload)
      .unwrap();
    records.consume_entry_tail(520).unwrap();
    assert_eq!(records.bytes_consumed(), 1024);
    records.consume_entry_tail(512).unwrap();
    assert_eq!(records.bytes_consumed(), 1024); // aligned size needs no tail
  }
}
