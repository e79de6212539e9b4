use core::fmt::Display;

use thiserror::Error;

/// Names the header field a decode failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
  Name,
  Mode,
  Uid,
  Gid,
  Size,
  Mtime,
  Checksum,
  LinkName,
  Uname,
  Gname,
  DevMajor,
  DevMinor,
  Atime,
  Ctime,
  RealSize,
  Prefix,
}

impl Display for HeaderField {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      HeaderField::Name => write!(f, "header.name"),
      HeaderField::Mode => write!(f, "header.mode"),
      HeaderField::Uid => write!(f, "header.uid"),
      HeaderField::Gid => write!(f, "header.gid"),
      HeaderField::Size => write!(f, "header.size"),
      HeaderField::Mtime => write!(f, "header.mtime"),
      HeaderField::Checksum => write!(f, "header.checksum"),
      HeaderField::LinkName => write!(f, "header.linkname"),
      HeaderField::Uname => write!(f, "header.uname"),
      HeaderField::Gname => write!(f, "header.gname"),
      HeaderField::DevMajor => write!(f, "header.dev_major"),
      HeaderField::DevMinor => write!(f, "header.dev_minor"),
      HeaderField::Atime => write!(f, "header.atime"),
      HeaderField::Ctime => write!(f, "header.ctime"),
      HeaderField::RealSize => write!(f, "header.real_size"),
      HeaderField::Prefix => write!(f, "header.prefix"),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
  #[error("unknown magic+version: {magic:?}+{version:?}")]
  UnknownMagicVersion { magic: [u8; 6], version: [u8; 2] },
  #[error("checksum mismatch: header says {expected} but the record sums to {actual}")]
  ChecksumMismatch { expected: u64, actual: u64 },
  #[error("field {field} is not a valid tar number")]
  BadNumericField { field: HeaderField },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaxError {
  #[error("length field contains byte {byte:#04x} before the space")]
  BadLengthDigit { byte: u8 },
  #[error("record ended before the `=` separating keyword and value")]
  MissingSeparator,
  #[error("declared record length {declared} disagrees with the bytes present")]
  LengthMismatch { declared: usize },
  #[error("record does not end in a newline")]
  MissingNewline,
  #[error("keyword is not valid UTF-8")]
  BadKeyword,
  #[error("GNU.sparse.numbytes without a preceding GNU.sparse.offset")]
  NumbytesWithoutOffset,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SparseError {
  #[error("sparse span at offset {offset} overlaps the previous span")]
  Overlap { offset: u64 },
  #[error("GNU.sparse.map has an odd number of elements ({count})")]
  OddMapElements { count: usize },
  #[error("GNU.sparse.map entry is not a decimal number")]
  BadMapNumber,
  #[error("sparse map contains byte {byte:#04x} where a digit was expected")]
  BadMapDigit { byte: u8 },
  #[error("sparse span ends at {end}, past the real size {real_size}")]
  SpanPastRealSize { end: u64, real_size: u64 },
}

/// What the cursor was consuming when the source ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncatedContext {
  Record,
  Payload,
  PaxHeader,
  LongNamePayload,
  SparseContinuation,
  SparseMap,
}

impl Display for TruncatedContext {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      TruncatedContext::Record => write!(f, "a header record"),
      TruncatedContext::Payload => write!(f, "an entry payload"),
      TruncatedContext::PaxHeader => write!(f, "a PAX extended header"),
      TruncatedContext::LongNamePayload => write!(f, "a long-name payload"),
      TruncatedContext::SparseContinuation => write!(f, "a sparse continuation record"),
      TruncatedContext::SparseMap => write!(f, "an in-payload sparse map"),
    }
  }
}

/// A failure to decode the archive itself, independent of the byte source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("archive truncated while reading {0}")]
  Truncated(TruncatedContext),
  #[error("malformed header: {0}")]
  HeaderMalformed(#[from] HeaderError),
  #[error("malformed PAX extended header: {0}")]
  PaxMalformed(#[from] PaxError),
  #[error("malformed sparse map: {0}")]
  SparseMalformed(#[from] SparseError),
  #[error("no current entry")]
  StateError,
}

/// Top-level error: a decode failure or an error from the underlying
/// byte source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TarError<E> {
  #[error("decode error: {0}")]
  Decode(#[from] DecodeError),
  #[error("source error: {0}")]
  Source(E),
}

impl<E> From<HeaderError> for TarError<E> {
  fn from(error: HeaderError) -> Self {
    TarError::Decode(DecodeError::HeaderMalformed(error))
  }
}

impl<E> From<PaxError> for TarError<E> {
  fn from(error: PaxError) -> Self {
    TarError::Decode(DecodeError::PaxMalformed(error))
  }
}

impl<E> From<SparseError> for TarError<E> {
  fn from(error: SparseError) -> Self {
    TarError::Decode(DecodeError::SparseMalformed(error))
  }
}

impl<E> TarError<E> {
  pub(crate) fn truncated(context: TruncatedContext) -> Self {
    TarError::Decode(DecodeError::Truncated(context))
  }
}

/// Rejected reader configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
  #[error("record size {record_size} is smaller than a tar header ({minimum} bytes)")]
  RecordSizeTooSmall { record_size: usize, minimum: usize },
  #[error("block size {block_size} is not a positive multiple of the record size {record_size}")]
  BadBlockSize {
    block_size: usize,
    record_size: usize,
  },
}
