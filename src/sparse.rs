use core::convert::Infallible;

use alloc::vec::Vec;

use zerocopy::FromBytes as _;

use crate::{
  entry::SparseSpan,
  errors::{SparseError, TarError, TruncatedContext},
  header::{SparseContinuation, HEADER_LEN},
  io::{Read, UnwrapInfallible as _},
  record::RecordReader,
};

/// Brings a raw span list into canonical form: drops a trailing `(0, 0)`
/// terminator, stable-sorts by offset and validates that spans neither
/// overlap nor extend past the dense size.
pub(crate) fn normalize_spans(
  mut spans: Vec<SparseSpan>,
  real_size: u64,
) -> Result<Vec<SparseSpan>, SparseError> {
  if spans.last().is_some_and(SparseSpan::is_terminator) {
    spans.pop();
  }
  spans.sort_by_key(|span| span.offset);

  let mut previous_end = 0_u64;
  for span in &spans {
    if span.offset < previous_end {
      return Err(SparseError::Overlap {
        offset: span.offset,
      });
    }
    previous_end = span
      .offset
      .checked_add(span.length)
      .ok_or(SparseError::SpanPastRealSize {
        end: u64::MAX,
        real_size,
      })?;
    if previous_end > real_size {
      return Err(SparseError::SpanPastRealSize {
        end: previous_end,
        real_size,
      });
    }
  }
  Ok(spans)
}

/// Parses a PAX 0.1 `GNU.sparse.map` value: comma-separated decimal
/// numbers read as `offset,length` pairs.
pub(crate) fn parse_map_0_1(value: &str) -> Result<Vec<SparseSpan>, SparseError> {
  let elements: Vec<&str> = value.split(',').collect();
  if elements.len() % 2 != 0 {
    return Err(SparseError::OddMapElements {
      count: elements.len(),
    });
  }
  let mut spans = Vec::new();
  for pair in elements.chunks_exact(2) {
    let offset = pair[0]
      .parse::<u64>()
      .map_err(|_| SparseError::BadMapNumber)?;
    let length = pair[1]
      .parse::<u64>()
      .map_err(|_| SparseError::BadMapNumber)?;
    spans.push(SparseSpan { offset, length });
  }
  Ok(spans)
}

/// Consumes old-GNU sparse continuation records and appends their spans.
///
/// Records follow the entry header directly; each carries its own
/// `is_extended` bit announcing another continuation.
pub(crate) fn read_old_gnu_continuations<R: Read>(
  records: &mut RecordReader<R>,
  record: &mut [u8],
  spans: &mut Vec<SparseSpan>,
) -> Result<(), TarError<R::ReadError>> {
  loop {
    if !records.read_record(record)? {
      return Err(TarError::truncated(TruncatedContext::SparseContinuation));
    }
    let continuation = SparseContinuation::ref_from_bytes(&record[..HEADER_LEN])
      .expect("BUG: continuation slice is exactly one header long");
    for descriptor in &continuation.sparse {
      if descriptor.is_empty() {
        break;
      }
      match descriptor.to_span() {
        Some(span) => spans.push(span),
        None => log::warn!("skipping unreadable sparse descriptor in continuation record"),
      }
    }
    if !continuation.is_extended() {
      return Ok(());
    }
  }
}

/// Reads one decimal number terminated by a newline, byte by byte.
fn read_decimal_line<R: Read>(
  records: &mut RecordReader<R>,
  bytes_read: &mut u64,
) -> Result<u64, TarError<R::ReadError>> {
  let mut value = 0_u64;
  loop {
    let mut byte = [0_u8; 1];
    if records.read(&mut byte)? == 0 {
      return Err(TarError::truncated(TruncatedContext::SparseMap));
    }
    *bytes_read += 1;
    match byte[0] {
      b'\n' => return Ok(value),
      digit @ b'0'..=b'9' => {
        value = value
          .checked_mul(10)
          .and_then(|v| v.checked_add(u64::from(digit - b'0')))
          .ok_or(SparseError::BadMapNumber)?;
      },
      other => return Err(SparseError::BadMapDigit { byte: other }.into()),
    }
  }
}

/// Parses the GNU sparse 1.x map that opens the entry payload: a span
/// count, then `2 × count` decimal numbers, newline-delimited, followed by
/// padding up to a record boundary.
pub(crate) fn read_gnu_1x_map<R: Read>(
  records: &mut RecordReader<R>,
) -> Result<Vec<SparseSpan>, TarError<R::ReadError>> {
  let mut bytes_read = 0_u64;
  let count = read_decimal_line(records, &mut bytes_read)?;
  let mut spans = Vec::new();
  for _ in 0..count {
    let offset = read_decimal_line(records, &mut bytes_read)?;
    let length = read_decimal_line(records, &mut bytes_read)?;
    spans.push(SparseSpan { offset, length });
  }

  // Skip to the record boundary. The formula skips a whole record when the
  // map is already aligned, matching the on-wire convention this format
  // inherited.
  let record_size = records.record_size() as u64;
  let padding = record_size - bytes_read % record_size;
  if records.skip(padding)? < padding {
    return Err(TarError::truncated(TruncatedContext::SparseMap));
  }
  Ok(spans)
}

/// The stateless all-zeros source behind sparse holes.
struct ZeroSource;

impl Read for ZeroSource {
  type ReadError = Infallible;

  fn read(&mut self, output_buffer: &mut [u8]) -> Result<usize, Self::ReadError> {
    output_buffer.fill(0);
    Ok(output_buffer.len())
  }

  fn skip(&mut self, count: u64) -> Result<u64, Self::ReadError> {
    Ok(count)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SegmentKind {
  Zero,
  Data,
}

#[derive(Debug)]
struct Segment {
  kind: SegmentKind,
  remaining: u64,
}

/// Recomposes the dense payload of a sparse entry: zero-fill segments
/// synthesized for the holes, data segments drawn from the underlying
/// source.
///
/// After the last segment, reads keep synthesizing zeros; the cursor
/// bounds every operation by the entry's dense size, so no tail segment is
/// materialized here.
pub(crate) struct SparseReader {
  segments: Vec<Segment>,
  index: usize,
}

impl SparseReader {
  pub(crate) fn new(spans: &[SparseSpan]) -> Self {
    let mut segments = Vec::new();
    let mut offset = 0_u64;
    for span in spans {
      // canonical spans are sorted and disjoint
      let hole = span.offset - offset;
      if hole > 0 {
        segments.push(Segment {
          kind: SegmentKind::Zero,
          remaining: hole,
        });
      }
      if span.length > 0 {
        segments.push(Segment {
          kind: SegmentKind::Data,
          remaining: span.length,
        });
      }
      offset = span.end();
    }
    Self { segments, index: 0 }
  }

  pub(crate) fn read<R: Read>(
    &mut self,
    records: &mut RecordReader<R>,
    output_buffer: &mut [u8],
  ) -> Result<usize, TarError<R::ReadError>> {
    let mut filled = 0_usize;
    while filled < output_buffer.len() {
      let Some(segment) = self.segments.get_mut(self.index) else {
        // past the last span: the rest of the dense file is one hole
        filled += ZeroSource
          .read(&mut output_buffer[filled..])
          .unwrap_infallible();
        break;
      };
      if segment.remaining == 0 {
        self.index += 1;
        continue;
      }
      let chunk = segment
        .remaining
        .min((output_buffer.len() - filled) as u64) as usize;
      let read_bytes = match segment.kind {
        SegmentKind::Zero => ZeroSource
          .read(&mut output_buffer[filled..filled + chunk])
          .unwrap_infallible(),
        SegmentKind::Data => {
          let read_bytes = records.read(&mut output_buffer[filled..filled + chunk])?;
          if read_bytes == 0 {
            return Err(TarError::truncated(TruncatedContext::Payload));
          }
          read_bytes
        },
      };
      segment.remaining -= read_bytes as u64;
      filled += read_bytes;
    }
    Ok(filled)
  }

  pub(crate) fn skip<R: Read>(
    &mut self,
    records: &mut RecordReader<R>,
    count: u64,
  ) -> Result<u64, TarError<R::ReadError>> {
    let mut skipped = 0_u64;
    while skipped < count {
      let Some(segment) = self.segments.get_mut(self.index) else {
        skipped += ZeroSource.skip(count - skipped).unwrap_infallible();
        break;
      };
      if segment.remaining == 0 {
        self.index += 1;
        continue;
      }
      let chunk = segment.remaining.min(count - skipped);
      let advanced = match segment.kind {
        SegmentKind::Zero => ZeroSource.skip(chunk).unwrap_infallible(),
        SegmentKind::Data => {
          let advanced = records.skip(chunk)?;
          if advanced == 0 {
            // source ran dry; report what was covered
            break;
          }
          advanced
        },
      };
      segment.remaining -= advanced;
      skipped += advanced;
    }
    Ok(skipped)
  }
}

#[cfg(test)]
mod tests {
  use alloc::vec;

  use super::*;
  use crate::io::SliceSource;

  fn span(offset: u64, length: u64) -> SparseSpan {
    SparseSpan { offset, length }
  }

  #[test]
  fn test_normalize_strips_terminator_and_sorts() {
    let spans = vec![span(12, 4), span(0, 4), span(0, 0)];
    let normalized = normalize_spans(spans, 20).unwrap();
    assert_eq!(normalized, vec![span(0, 4), span(12, 4)]);
  }

  #[test]
  fn test_normalize_rejects_overlap() {
    let spans = vec![span(0, 8), span(4, 4)];
    assert!(matches!(
      normalize_spans(spans, 20),
      Err(SparseError::Overlap { offset: 4 })
    ));
  }

  #[test]
  fn test_normalize_rejects_span_past_real_size() {
    let spans = vec![span(0, 4), span(12, 4)];
    assert!(matches!(
      normalize_spans(spans, 10),
      Err(SparseError::SpanPastRealSize {
        end: 16,
        real_size: 10
      })
    ));
  }

  #[test]
  fn test_parse_map_0_1() {
    assert_eq!(
      parse_map_0_1("1024,512,8192,2048").unwrap(),
      vec![span(1024, 512), span(8192, 2048)]
    );
    assert!(matches!(
      parse_map_0_1("1024,512,8192"),
      Err(SparseError::OddMapElements { count: 3 })
    ));
    assert!(matches!(
      parse_map_0_1("1024,abc"),
      Err(SparseError::BadMapNumber)
    ));
  }

  #[test]
  fn test_read_gnu_1x_map() {
    let mut data = b"2\n0\n4\n12\n4\n".to_vec();
    data.resize(512, 0); // padding to the record boundary
    data.extend_from_slice(b"AAAABBBB");
    let mut records = RecordReader::new(SliceSource::new(&data), 512, 5120);

    let spans = read_gnu_1x_map(&mut records).unwrap();
    assert_eq!(spans, vec![span(0, 4), span(12, 4)]);
    assert_eq!(records.bytes_consumed(), 512);

    let mut tail = [0_u8; 8];
    records
      .read_exact(&mut tail, TruncatedContext::Payload)
      .unwrap();
    assert_eq!(&tail, b"AAAABBBB");
  }

  #[test]
  fn test_read_gnu_1x_map_rejects_garbage() {
    let mut data = b"2\n0\nxx\n".to_vec();
    data.resize(512, 0);
    let mut records = RecordReader::new(SliceSource::new(&data), 512, 5120);
    assert!(matches!(
      read_gnu_1x_map(&mut records),
      Err(TarError::Decode(crate::DecodeError::SparseMalformed(
        SparseError::BadMapDigit { byte: b'x' }
      )))
    ));
  }

  #[test]
  fn test_sparse_reader_recomposes_dense_payload() {
    let data = b"AAAABBBB";
    let mut records = RecordReader::new(SliceSource::new(data), 512, 5120);
    let spans = vec![span(0, 4), span(12, 4)];
    let mut sparse = SparseReader::new(&spans);

    // real size 20: four bytes of tail hole past the last span
    let mut dense = [0xff_u8; 20];
    let read_bytes = sparse.read(&mut records, &mut dense).unwrap();
    assert_eq!(read_bytes, 20);
    assert_eq!(&dense, b"AAAA\0\0\0\0\0\0\0\0BBBB\0\0\0\0");
  }

  #[test]
  fn test_sparse_reader_skip_only_consumes_data_segments() {
    let data = b"AAAABBBB";
    let mut records = RecordReader::new(SliceSource::new(data), 512, 5120);
    let spans = vec![span(0, 4), span(12, 4)];
    let mut sparse = SparseReader::new(&spans);

    // skip across the first data segment and the hole
    let skipped = sparse.skip(&mut records, 14).unwrap();
    assert_eq!(skipped, 14);
    assert_eq!(records.bytes_consumed(), 6); // 4 data + 2 of the second span

    let mut rest = [0_u8; 6];
    let read_bytes = sparse.read(&mut records, &mut rest).unwrap();
    assert_eq!(read_bytes, 6);
    assert_eq!(&rest, b"BB\0\0\0\0");
  }

  #[test]
  fn test_sparse_reader_truncated_data_segment() {
    let data = b"AA"; // span wants 4 bytes
    let mut records = RecordReader::new(SliceSource::new(data), 512, 5120);
    let spans = vec![span(0, 4)];
    let mut sparse = SparseReader::new(&spans);
    let mut dense = [0_u8; 4];
    assert!(matches!(
      sparse.read(&mut records, &mut dense),
      Err(TarError::Decode(crate::DecodeError::Truncated(
        TruncatedContext::Payload
      )))
    ));
  }
}
