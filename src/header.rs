use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
  entry::{Entry, EntryKind, SparseSpan, TimeStamp},
  errors::{HeaderError, HeaderField},
  text::TextDecoder,
};

/// Footprint of the fixed header at the start of every entry record.
pub(crate) const HEADER_LEN: usize = 512;

/// Byte offset of `magic_version` inside a header record.
const MAGIC_VERSION_OFFSET: usize = 257;

/// Used by the old `v7` format, which predates the magic field.
const MAGIC_VERSION_V7: &[u8; 8] = b"\0\0\0\0\0\0\0\0";
/// Shared by `ustar`, `pax` and `posix` formats: magic "ustar\0", version "00".
const MAGIC_VERSION_USTAR: &[u8; 8] = b"ustar\000";
/// Written by Ant: magic "ustar\0", version "\0\0".
const MAGIC_VERSION_ANT: &[u8; 8] = b"ustar\0\0\0";
/// Used by the GNU format: magic "ustar ", version " \0".
const MAGIC_VERSION_GNU: &[u8; 8] = b"ustar  \0";
/// GNU with a zeroed version field, seen in the wild.
const MAGIC_VERSION_GNU_ZERO: &[u8; 8] = b"ustar \0\0";

/// Recognizes the ustar/GNU/Ant magic+version footprint of a tar header.
/// `signature` holds the leading bytes of a candidate archive; anything
/// shorter than a full header cannot match.
#[must_use]
pub fn signature_matches(signature: &[u8]) -> bool {
  if signature.len() < MAGIC_VERSION_OFFSET + 8 {
    return false;
  }
  let magic_version = &signature[MAGIC_VERSION_OFFSET..MAGIC_VERSION_OFFSET + 8];
  magic_version == MAGIC_VERSION_USTAR
    || magic_version == MAGIC_VERSION_ANT
    || magic_version == MAGIC_VERSION_GNU
    || magic_version == MAGIC_VERSION_GNU_ZERO
}

pub(crate) fn trim_nul(bytes: &[u8]) -> &[u8] {
  let end = bytes.iter().position(|&b| b == b'\0').unwrap_or(bytes.len());
  &bytes[..end]
}

/// Parses a tar numeric field: octal ASCII with leading/trailing space or
/// NUL padding, or GNU base-256 (high bit of the first byte set) stored as
/// a big-endian binary number in the remaining bits.
///
/// Returns `None` for garbage or overflow; an all-padding field reads as 0.
pub(crate) fn parse_numeric(bytes: &[u8]) -> Option<u64> {
  let first = *bytes.first()?;
  if first & 0x80 != 0 {
    let mut value = u64::from(first & 0x7f);
    for &byte in &bytes[1..] {
      value = value.checked_mul(256)?.checked_add(u64::from(byte))?;
    }
    return Some(value);
  }
  let text = core::str::from_utf8(bytes).ok()?;
  let trimmed = text.trim_matches(|c| c == ' ' || c == '\0');
  if trimmed.is_empty() {
    return Some(0);
  }
  u64::from_str_radix(trimmed, 8).ok()
}

/// The 512-byte header common to every dialect. Also known as `v7`.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct RawHeader {
  /// File name, null-terminated
  pub name: [u8; 100],
  /// File mode (octal), stored as ASCII bytes
  pub mode: [u8; 8],
  /// User ID of file owner (octal), stored as ASCII bytes
  pub uid: [u8; 8],
  /// Group ID of file owner (octal), stored as ASCII bytes
  pub gid: [u8; 8],
  /// Payload size in bytes following the header (octal or base-256)
  pub size: [u8; 12],
  /// Modification time (epoch seconds, octal), stored as ASCII bytes
  pub mtime: [u8; 12],
  /// Header checksum (space-padded), stored as ASCII bytes
  pub checksum: [u8; 8],
  /// Entry flavor byte
  pub typeflag: u8,
  /// Target name of a link, null-terminated
  pub link_name: [u8; 100],
  /// Six magic bytes plus two version bytes, matched as one unit.
  /// All zeros for `v7`.
  pub magic_version: [u8; 8],
  /// [`PosixFields`] when the magic identifies ustar or GNU, zeros otherwise.
  pub tail: [u8; 247],
}

/// Fields shared by the ustar and GNU dialects, carried in the tail of
/// [`RawHeader`].
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct PosixFields {
  /// User name, null-terminated
  pub uname: [u8; 32],
  /// Group name, null-terminated
  pub gname: [u8; 32],
  /// Major device number (octal), stored as ASCII bytes
  pub dev_major: [u8; 8],
  /// Minor device number (octal), stored as ASCII bytes
  pub dev_minor: [u8; 8],
  /// [`UstarFields`] or [`GnuFields`].
  pub tail: [u8; 167],
}

/// ustar-only tail of [`PosixFields`].
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct UstarFields {
  /// Path prefix used when the name exceeds 100 bytes, null-terminated
  pub prefix: [u8; 155],
  pub pad: [u8; 12],
}

/// GNU-only tail of [`PosixFields`].
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct GnuFields {
  /// Access time in octal ASCII (12 bytes)
  pub atime: [u8; 12],
  /// Creation time in octal ASCII (12 bytes)
  pub ctime: [u8; 12],
  /// Multi-volume offset, unused here (12 bytes)
  pub offset: [u8; 12],
  /// Long-name offset, obsolete (4 bytes)
  pub long_names: [u8; 4],
  pub unused: [u8; 1],
  /// Up to 4 sparse spans carried in the main header
  pub sparse: [SparseDescriptor; 4],
  /// Non-zero when sparse continuation records follow the header
  pub is_extended: [u8; 1],
  /// Dense size of a sparse file, in octal ASCII (12 bytes)
  pub real_size: [u8; 12],
  pub pad: [u8; 17],
}

/// One on-wire `(offset, numbytes)` pair of an old-GNU sparse map.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct SparseDescriptor {
  pub offset: [u8; 12],
  pub num_bytes: [u8; 12],
}

impl SparseDescriptor {
  const ZERO: SparseDescriptor = SparseDescriptor {
    offset: [0; 12],
    num_bytes: [0; 12],
  };

  /// An all-zero descriptor terminates the raw span list.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self == &Self::ZERO
  }

  #[must_use]
  pub fn to_span(&self) -> Option<SparseSpan> {
    Some(SparseSpan {
      offset: parse_numeric(&self.offset)?,
      length: parse_numeric(&self.num_bytes)?,
    })
  }
}

/// A 512-byte old-GNU sparse continuation record.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub(crate) struct SparseContinuation {
  pub sparse: [SparseDescriptor; 21],
  pub is_extended: [u8; 1],
  pub pad: [u8; 7],
}

impl SparseContinuation {
  #[must_use]
  pub fn is_extended(&self) -> bool {
    self.is_extended[0] != 0
  }
}

/// Computes the checksum of a header record per the ustar spec: the sum of
/// all bytes with the checksum field itself read as ASCII spaces.
pub(crate) fn compute_checksum(record: &[u8]) -> u64 {
  const CHECKSUM_START: usize = 148;
  const CHECKSUM_END: usize = 156;

  record[..HEADER_LEN]
    .iter()
    .enumerate()
    .map(|(i, &byte)| {
      if (CHECKSUM_START..CHECKSUM_END).contains(&i) {
        0x20_u64
      } else {
        u64::from(byte)
      }
    })
    .sum()
}

fn verify_checksum(raw: &RawHeader) -> Result<(), HeaderError> {
  let expected = parse_numeric(&raw.checksum).ok_or(HeaderError::BadNumericField {
    field: HeaderField::Checksum,
  })?;
  let actual = compute_checksum(raw.as_bytes());
  if expected == actual {
    Ok(())
  } else {
    Err(HeaderError::ChecksumMismatch { expected, actual })
  }
}

/// Parses a numeric field, decaying to `None` in lenient mode and failing
/// otherwise.
fn numeric_field(
  bytes: &[u8],
  field: HeaderField,
  lenient: bool,
) -> Result<Option<u64>, HeaderError> {
  match parse_numeric(bytes) {
    Some(value) => Ok(Some(value)),
    None if lenient => Ok(None),
    None => Err(HeaderError::BadNumericField { field }),
  }
}

fn narrow_u32(value: Option<u64>, field: HeaderField, lenient: bool) -> Result<Option<u32>, HeaderError> {
  match value {
    None => Ok(None),
    Some(wide) => match u32::try_from(wide) {
      Ok(narrow) => Ok(Some(narrow)),
      Err(_) if lenient => Ok(None),
      Err(_) => Err(HeaderError::BadNumericField { field }),
    },
  }
}

fn timestamp(value: Option<u64>) -> Option<TimeStamp> {
  value.map(|seconds| TimeStamp {
    seconds_since_epoch: seconds,
    nanoseconds: 0,
  })
}

/// Decodes one header record into an [`Entry`].
///
/// `record` must hold at least [`HEADER_LEN`] bytes; callers hand in a full
/// record and only the header footprint is inspected.
pub(crate) fn decode<D: TextDecoder>(
  record: &[u8],
  decoder: &D,
  lenient: bool,
) -> Result<Entry, HeaderError> {
  let raw = RawHeader::ref_from_bytes(&record[..HEADER_LEN])
    .expect("BUG: header slice is exactly HEADER_LEN bytes");

  let dialect = match &raw.magic_version {
    MAGIC_VERSION_V7 => Dialect::V7,
    MAGIC_VERSION_USTAR | MAGIC_VERSION_ANT => Dialect::Ustar,
    MAGIC_VERSION_GNU | MAGIC_VERSION_GNU_ZERO => Dialect::Gnu,
    unknown => {
      return Err(HeaderError::UnknownMagicVersion {
        magic: unknown[..6].try_into().expect("BUG: magic is 6 bytes"),
        version: unknown[6..].try_into().expect("BUG: version is 2 bytes"),
      });
    },
  };

  verify_checksum(raw)?;

  let mut entry = Entry {
    name: decoder.decode(trim_nul(&raw.name)),
    link_name: decoder.decode(trim_nul(&raw.link_name)),
    kind: EntryKind::from(raw.typeflag),
    mode: narrow_u32(
      numeric_field(&raw.mode, HeaderField::Mode, lenient)?,
      HeaderField::Mode,
      lenient,
    )?,
    uid: numeric_field(&raw.uid, HeaderField::Uid, lenient)?,
    gid: numeric_field(&raw.gid, HeaderField::Gid, lenient)?,
    mtime: timestamp(numeric_field(&raw.mtime, HeaderField::Mtime, lenient)?),
    ..Entry::default()
  };

  // The size must always be readable: it frames the rest of the stream.
  entry.size = parse_numeric(&raw.size).ok_or(HeaderError::BadNumericField {
    field: HeaderField::Size,
  })?;
  entry.real_size = entry.size;

  match dialect {
    Dialect::V7 => {},
    Dialect::Ustar => {
      let posix = PosixFields::ref_from_bytes(&raw.tail)
        .expect("BUG: ustar tail is exactly PosixFields bytes");
      decode_posix_fields(&mut entry, posix, decoder, lenient)?;

      let ustar = UstarFields::ref_from_bytes(&posix.tail)
        .expect("BUG: posix tail is exactly UstarFields bytes");
      let prefix = trim_nul(&ustar.prefix);
      if !prefix.is_empty() {
        let mut joined = decoder.decode(prefix);
        joined.push('/');
        joined.push_str(&entry.name);
        entry.name = joined;
      }
    },
    Dialect::Gnu => {
      let posix = PosixFields::ref_from_bytes(&raw.tail)
        .expect("BUG: GNU tail is exactly PosixFields bytes");
      decode_posix_fields(&mut entry, posix, decoder, lenient)?;

      let gnu =
        GnuFields::ref_from_bytes(&posix.tail).expect("BUG: posix tail is exactly GnuFields bytes");
      entry.atime = timestamp(numeric_field(&gnu.atime, HeaderField::Atime, lenient)?);
      entry.ctime = timestamp(numeric_field(&gnu.ctime, HeaderField::Ctime, lenient)?);

      if entry.kind == EntryKind::OldGnuSparse {
        for descriptor in &gnu.sparse {
          if descriptor.is_empty() {
            break;
          }
          match descriptor.to_span() {
            Some(span) => entry.sparse_spans.push(span),
            None => log::warn!("skipping unreadable sparse descriptor in header"),
          }
        }
        entry.is_extended = gnu.is_extended[0] != 0;
        entry.real_size = match parse_numeric(&gnu.real_size) {
          Some(real_size) => real_size,
          None if lenient => entry.size,
          None => {
            return Err(HeaderError::BadNumericField {
              field: HeaderField::RealSize,
            })
          },
        };
      }
    },
  }

  if entry.kind == EntryKind::Directory && !entry.name.ends_with('/') {
    entry.name.push('/');
  }

  Ok(entry)
}

enum Dialect {
  V7,
  Ustar,
  Gnu,
}

fn decode_posix_fields<D: TextDecoder>(
  entry: &mut Entry,
  posix: &PosixFields,
  decoder: &D,
  lenient: bool,
) -> Result<(), HeaderError> {
  entry.uname = decoder.decode(trim_nul(&posix.uname));
  entry.gname = decoder.decode(trim_nul(&posix.gname));
  entry.dev_major = narrow_u32(
    numeric_field(&posix.dev_major, HeaderField::DevMajor, lenient)?,
    HeaderField::DevMajor,
    lenient,
  )?;
  entry.dev_minor = narrow_u32(
    numeric_field(&posix.dev_minor, HeaderField::DevMinor, lenient)?,
    HeaderField::DevMinor,
    lenient,
  )?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use alloc::{format, vec};

  use super::*;
  use crate::text::Utf8Decoder;

  fn write_octal(dest: &mut [u8], value: u64) {
    let text = format!("{value:0width$o}\0", width = dest.len() - 1);
    dest.copy_from_slice(text.as_bytes());
  }

  fn test_header(name: &str, size: u64, typeflag: u8, magic_version: &[u8; 8]) -> [u8; HEADER_LEN] {
    let mut record = [0_u8; HEADER_LEN];
    record[..name.len()].copy_from_slice(name.as_bytes());
    write_octal(&mut record[100..108], 0o644);
    write_octal(&mut record[108..116], 123);
    write_octal(&mut record[116..124], 456);
    write_octal(&mut record[124..136], size);
    write_octal(&mut record[136..148], 1_700_000_000);
    record[156] = typeflag;
    record[MAGIC_VERSION_OFFSET..MAGIC_VERSION_OFFSET + 8].copy_from_slice(magic_version);
    let checksum = compute_checksum(&record);
    write_octal(&mut record[148..155], checksum);
    record[155] = b' ';
    record
  }

  #[test]
  fn test_parse_numeric_octal() {
    assert_eq!(parse_numeric(b"0000644\0"), Some(0o644));
    assert_eq!(parse_numeric(b"   644 \0"), Some(0o644));
    assert_eq!(parse_numeric(b"\0\0\0\0"), Some(0));
    assert_eq!(parse_numeric(b"abc\0"), None);
    assert_eq!(parse_numeric(b"6 4\0"), None);
  }

  #[test]
  fn test_parse_numeric_base_256() {
    // 0x80 marker, then big-endian binary
    let field = [0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0x00];
    assert_eq!(parse_numeric(&field), Some(256));
    let field = [0x80, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
    assert_eq!(parse_numeric(&field), None); // overflows u64
  }

  #[test]
  fn test_decode_ustar_regular_file() {
    let record = test_header("hello.txt", 5, b'0', MAGIC_VERSION_USTAR);
    let entry = decode(&record, &Utf8Decoder, false).unwrap();
    assert_eq!(entry.name, "hello.txt");
    assert_eq!(entry.kind, EntryKind::Regular);
    assert_eq!(entry.size, 5);
    assert_eq!(entry.real_size, 5);
    assert_eq!(entry.mode, Some(0o644));
    assert_eq!(entry.uid, Some(123));
    assert_eq!(entry.gid, Some(456));
    assert_eq!(
      entry.mtime,
      Some(TimeStamp {
        seconds_since_epoch: 1_700_000_000,
        nanoseconds: 0
      })
    );
  }

  #[test]
  fn test_decode_directory_gets_trailing_slash() {
    let record = test_header("subdir", 0, b'5', MAGIC_VERSION_USTAR);
    let entry = decode(&record, &Utf8Decoder, false).unwrap();
    assert_eq!(entry.name, "subdir/");
    assert!(entry.is_directory());
  }

  #[test]
  fn test_decode_ustar_prefix_is_joined() {
    let mut record = test_header("leaf.txt", 0, b'0', MAGIC_VERSION_USTAR);
    let prefix_start = MAGIC_VERSION_OFFSET + 8 + 80;
    record[prefix_start..prefix_start + 4].copy_from_slice(b"some");
    let checksum = compute_checksum(&record);
    write_octal(&mut record[148..155], checksum);
    record[155] = b' ';
    let entry = decode(&record, &Utf8Decoder, false).unwrap();
    assert_eq!(entry.name, "some/leaf.txt");
  }

  #[test]
  fn test_decode_rejects_bad_checksum() {
    let mut record = test_header("hello.txt", 5, b'0', MAGIC_VERSION_USTAR);
    record[0] ^= 0xff;
    assert!(matches!(
      decode(&record, &Utf8Decoder, false),
      Err(HeaderError::ChecksumMismatch { .. })
    ));
  }

  #[test]
  fn test_decode_rejects_unknown_magic() {
    let mut record = test_header("hello.txt", 5, b'0', MAGIC_VERSION_USTAR);
    record[MAGIC_VERSION_OFFSET..MAGIC_VERSION_OFFSET + 8].copy_from_slice(b"wat?\0\0\0\0");
    assert!(matches!(
      decode(&record, &Utf8Decoder, false),
      Err(HeaderError::UnknownMagicVersion { .. })
    ));
  }

  #[test]
  fn test_lenient_decays_garbage_mode() {
    let mut record = test_header("hello.txt", 5, b'0', MAGIC_VERSION_USTAR);
    record[100..108].copy_from_slice(b"garbage\0");
    let checksum = compute_checksum(&record);
    write_octal(&mut record[148..155], checksum);
    record[155] = b' ';

    assert!(matches!(
      decode(&record, &Utf8Decoder, false),
      Err(HeaderError::BadNumericField {
        field: HeaderField::Mode
      })
    ));
    let entry = decode(&record, &Utf8Decoder, true).unwrap();
    assert_eq!(entry.mode, None);
    assert_eq!(entry.uid, Some(123));
  }

  #[test]
  fn test_decode_old_gnu_sparse_header() {
    let mut record = test_header("sparse.bin", 8, b'S', MAGIC_VERSION_GNU);
    let gnu_start = MAGIC_VERSION_OFFSET + 8 + 80;
    let sparse_start = gnu_start + 12 + 12 + 12 + 4 + 1;
    write_octal(&mut record[sparse_start..sparse_start + 12], 0);
    write_octal(&mut record[sparse_start + 12..sparse_start + 24], 4);
    write_octal(&mut record[sparse_start + 24..sparse_start + 36], 12);
    write_octal(&mut record[sparse_start + 36..sparse_start + 48], 4);
    let real_size_start = sparse_start + 4 * 24 + 1;
    write_octal(&mut record[real_size_start..real_size_start + 12], 20);
    let checksum = compute_checksum(&record);
    write_octal(&mut record[148..155], checksum);
    record[155] = b' ';

    let entry = decode(&record, &Utf8Decoder, false).unwrap();
    assert!(entry.is_old_gnu_sparse());
    assert!(!entry.is_extended);
    assert_eq!(entry.real_size, 20);
    assert_eq!(
      entry.sparse_spans,
      vec![
        SparseSpan {
          offset: 0,
          length: 4
        },
        SparseSpan {
          offset: 12,
          length: 4
        },
      ]
    );
  }

  #[test]
  fn test_signature_matches() {
    let posix = test_header("x", 0, b'0', MAGIC_VERSION_USTAR);
    let gnu = test_header("x", 0, b'0', MAGIC_VERSION_GNU);
    let ant = test_header("x", 0, b'0', MAGIC_VERSION_ANT);
    assert!(signature_matches(&posix));
    assert!(signature_matches(&gnu));
    assert!(signature_matches(&ant));

    assert!(!signature_matches(&posix[..200]));
    let v7 = test_header("x", 0, b'0', MAGIC_VERSION_V7);
    assert!(!signature_matches(&v7));
  }
}
