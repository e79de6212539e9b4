use alloc::{
  string::{String, ToString as _},
  vec::Vec,
};

use hashbrown::HashMap;

use crate::{
  entry::{Entry, EntryKind, SparseSpan, TimeStamp},
  errors::PaxError,
  text::TextDecoder,
};

/// https://www.open-std.org/jtc1/sc22/open/n4217.pdf
///
/// Record format: `"%d %s=%s\n", <length>, <keyword>, <value>` where
/// `<length>` counts the whole record including itself and the newline.
pub(crate) mod keys {
  /// GNU sparse: https://www.gnu.org/software/tar/manual/html_section/Sparse-Formats.html
  pub mod gnu {
    /// Overrides the `name` field of the header. (0.0, 0.1, 1.0)
    pub const SPARSE_NAME: &str = "GNU.sparse.name";
    /// Dense size of the file. (1.0)
    pub const SPARSE_REALSIZE: &str = "GNU.sparse.realsize";
    /// Major version of the sparse format in use.
    pub const SPARSE_MAJOR: &str = "GNU.sparse.major";
    /// Minor version of the sparse format in use.
    pub const SPARSE_MINOR: &str = "GNU.sparse.minor";
    /// Dense size of the file. (0.0, 0.1)
    pub const SPARSE_SIZE: &str = "GNU.sparse.size";
    /// Number of spans in the sparse map. (0.0, 0.1)
    pub const SPARSE_NUMBLOCKS: &str = "GNU.sparse.numblocks";
    /// Offset of one data span; paired with the following numbytes. (0.0)
    pub const SPARSE_OFFSET: &str = "GNU.sparse.offset";
    /// Length of one data span. (0.0)
    pub const SPARSE_NUMBYTES: &str = "GNU.sparse.numbytes";
    /// Comma-separated `offset,length[,offset,length,...]` map. (0.1)
    pub const SPARSE_MAP: &str = "GNU.sparse.map";
  }

  pub const ATIME: &str = "atime";
  /// Ignored: charset of the file content.
  pub const CHARSET: &str = "charset";
  /// Ignored.
  pub const COMMENT: &str = "comment";
  /// Non-standard GNU extension.
  pub const CTIME: &str = "ctime";
  /// Decimal override for ids beyond the octal field range.
  pub const GID: &str = "gid";
  pub const GNAME: &str = "gname";
  /// Ignored: charset used for names inside the extended header.
  pub const HDRCHARSET: &str = "hdrcharset";
  pub const LINKPATH: &str = "linkpath";
  pub const MTIME: &str = "mtime";
  /// Overrides the `name` and `prefix` fields of the header.
  pub const PATH: &str = "path";
  /// Decimal payload size override for files beyond the octal field range.
  pub const SIZE: &str = "size";
  pub const UID: &str = "uid";
  pub const UNAME: &str = "uname";
  /// Solaris/star device number overrides.
  pub const SCHILY_DEV_MAJOR: &str = "SCHILY.devmajor";
  pub const SCHILY_DEV_MINOR: &str = "SCHILY.devminor";
}

/// Keywords consumed into decoded [`Entry`] fields; everything else lands
/// in `pax_extras`.
const APPLIED_KEYS: &[&str] = &[
  keys::ATIME,
  keys::CHARSET,
  keys::COMMENT,
  keys::CTIME,
  keys::GID,
  keys::GNAME,
  keys::HDRCHARSET,
  keys::LINKPATH,
  keys::MTIME,
  keys::PATH,
  keys::SIZE,
  keys::UID,
  keys::UNAME,
  keys::SCHILY_DEV_MAJOR,
  keys::SCHILY_DEV_MINOR,
  keys::gnu::SPARSE_NAME,
  keys::gnu::SPARSE_REALSIZE,
  keys::gnu::SPARSE_MAJOR,
  keys::gnu::SPARSE_MINOR,
  keys::gnu::SPARSE_SIZE,
  keys::gnu::SPARSE_NUMBLOCKS,
  keys::gnu::SPARSE_MAP,
];

/// Parses a PAX extended-header payload into a keyword map.
///
/// The returned map starts from `seed` (the persistent global headers when
/// parsing a local block); a record whose value part is empty removes its
/// keyword instead of inserting it. `GNU.sparse.offset`/`numbytes` pairs
/// are routed into `sparse_spans` instead of the map.
pub(crate) fn parse<D: TextDecoder>(
  data: &[u8],
  seed: &HashMap<String, String>,
  sparse_spans: &mut Vec<SparseSpan>,
  decoder: &D,
) -> Result<HashMap<String, String>, PaxError> {
  let mut merged = seed.clone();
  let mut pending_offset: Option<u64> = None;
  let mut position = 0_usize;

  'records: while position < data.len() {
    let record_start = position;

    // length: ASCII decimal digits up to a space
    let mut length = 0_usize;
    loop {
      let Some(&byte) = data.get(position) else {
        return Err(PaxError::LengthMismatch { declared: length });
      };
      position += 1;
      match byte {
        b'0'..=b'9' => {
          length = length
            .checked_mul(10)
            .and_then(|v| v.checked_add(usize::from(byte - b'0')))
            .ok_or(PaxError::LengthMismatch { declared: length })?;
        },
        b' ' => break,
        // blank record terminates parsing
        b'\n' => break 'records,
        other => return Err(PaxError::BadLengthDigit { byte: other }),
      }
    }

    let record_end = record_start
      .checked_add(length)
      .filter(|&end| end <= data.len() && end > position)
      .ok_or(PaxError::LengthMismatch { declared: length })?;
    if data[record_end - 1] != b'\n' {
      return Err(PaxError::MissingNewline);
    }

    // keyword: bytes up to the `=`
    let keyword_start = position;
    while data[position] != b'=' {
      position += 1;
      if position >= record_end {
        return Err(PaxError::MissingSeparator);
      }
    }
    let keyword = core::str::from_utf8(&data[keyword_start..position])
      .map_err(|_| PaxError::BadKeyword)?
      .to_string();
    position += 1; // consume the `=`

    // the rest of the record is the value plus the trailing newline
    let value_bytes = &data[position..record_end - 1];
    position = record_end;

    if value_bytes.is_empty() {
      // a keyword with no value removes an inherited keyword
      merged.remove(&keyword);
      continue;
    }
    let value = decoder.decode(value_bytes);

    match keyword.as_str() {
      keys::gnu::SPARSE_OFFSET => {
        if let Some(previous) = pending_offset.take() {
          // offset with no matching numbytes reads as an empty span
          sparse_spans.push(SparseSpan {
            offset: previous,
            length: 0,
          });
        }
        match value.parse::<u64>() {
          Ok(offset) => pending_offset = Some(offset),
          Err(_) => log::warn!("ignoring unparseable GNU.sparse.offset value"),
        }
      },
      keys::gnu::SPARSE_NUMBYTES => {
        let offset = pending_offset
          .take()
          .ok_or(PaxError::NumbytesWithoutOffset)?;
        match value.parse::<u64>() {
          Ok(length) => sparse_spans.push(SparseSpan { offset, length }),
          Err(_) => log::warn!("ignoring unparseable GNU.sparse.numbytes value"),
        }
      },
      _ => {
        merged.insert(keyword, value);
      },
    }
  }

  if let Some(offset) = pending_offset {
    sparse_spans.push(SparseSpan { offset, length: 0 });
  }

  Ok(merged)
}

fn parse_time(value: &str) -> Option<TimeStamp> {
  let (seconds, fraction) = match value.split_once('.') {
    Some((seconds, fraction)) => (seconds, Some(fraction)),
    None => (value, None),
  };
  let seconds = seconds.parse::<u64>().ok()?;
  let nanoseconds = match fraction {
    None | Some("") => 0,
    Some(fraction) => {
      // scale the fraction to nine digits
      let digits: String = fraction.chars().take(9).collect();
      let scale = 10_u32.pow(9 - digits.len() as u32);
      digits.parse::<u32>().ok()? * scale
    },
  };
  Some(TimeStamp {
    seconds_since_epoch: seconds,
    nanoseconds,
  })
}

fn set_time(slot: &mut Option<TimeStamp>, keyword: &str, value: &str) {
  match parse_time(value) {
    Some(stamp) => *slot = Some(stamp),
    None => log::warn!("ignoring unparseable PAX {keyword} value"),
  }
}

/// Applies a merged PAX keyword map to a decoded entry, overriding header
/// fields and marking the GNU sparse dialect in use.
pub(crate) fn apply_to_entry(headers: &HashMap<String, String>, entry: &mut Entry) {
  if let Some(value) = headers.get(keys::PATH) {
    entry.name = value.clone();
  }
  if let Some(value) = headers.get(keys::LINKPATH) {
    entry.link_name = value.clone();
  }
  if let Some(value) = headers.get(keys::SIZE) {
    match value.parse::<u64>() {
      Ok(size) => {
        entry.size = size;
        if !entry.is_sparse() {
          entry.real_size = size;
        }
      },
      Err(_) => log::warn!("ignoring unparseable PAX size value"),
    }
  }
  if let Some(value) = headers.get(keys::UID) {
    match value.parse::<u64>() {
      Ok(uid) => entry.uid = Some(uid),
      Err(_) => log::warn!("ignoring unparseable PAX uid value"),
    }
  }
  if let Some(value) = headers.get(keys::GID) {
    match value.parse::<u64>() {
      Ok(gid) => entry.gid = Some(gid),
      Err(_) => log::warn!("ignoring unparseable PAX gid value"),
    }
  }
  if let Some(value) = headers.get(keys::MTIME) {
    set_time(&mut entry.mtime, keys::MTIME, value);
  }
  if let Some(value) = headers.get(keys::ATIME) {
    set_time(&mut entry.atime, keys::ATIME, value);
  }
  if let Some(value) = headers.get(keys::CTIME) {
    set_time(&mut entry.ctime, keys::CTIME, value);
  }
  if let Some(value) = headers.get(keys::UNAME) {
    entry.uname = value.clone();
  }
  if let Some(value) = headers.get(keys::GNAME) {
    entry.gname = value.clone();
  }
  if let Some(value) = headers.get(keys::SCHILY_DEV_MAJOR) {
    match value.parse::<u32>() {
      Ok(major) => entry.dev_major = Some(major),
      Err(_) => log::warn!("ignoring unparseable SCHILY.devmajor value"),
    }
  }
  if let Some(value) = headers.get(keys::SCHILY_DEV_MINOR) {
    match value.parse::<u32>() {
      Ok(minor) => entry.dev_minor = Some(minor),
      Err(_) => log::warn!("ignoring unparseable SCHILY.devminor value"),
    }
  }

  // GNU sparse dialect markers. 0.x carries the dense size in
  // GNU.sparse.size, 1.x in GNU.sparse.realsize.
  if let Some(value) = headers.get(keys::gnu::SPARSE_SIZE) {
    match value.parse::<u64>() {
      Ok(real_size) => {
        entry.real_size = real_size;
        entry.pax_sparse = true;
      },
      Err(_) => log::warn!("ignoring unparseable GNU.sparse.size value"),
    }
  }
  if headers.contains_key(keys::gnu::SPARSE_MAP) {
    entry.pax_sparse = true;
  }
  let major = headers
    .get(keys::gnu::SPARSE_MAJOR)
    .and_then(|v| v.parse::<u32>().ok());
  let minor = headers
    .get(keys::gnu::SPARSE_MINOR)
    .and_then(|v| v.parse::<u32>().ok());
  match (major, minor) {
    (Some(0), _) | (None, Some(1)) => entry.pax_sparse = true,
    (Some(1), _) => entry.pax_gnu_1x_sparse = true,
    (Some(major), Some(minor)) => {
      log::warn!("unknown GNU sparse format {major}.{minor}");
    },
    _ => {},
  }
  if let Some(value) = headers.get(keys::gnu::SPARSE_REALSIZE) {
    match value.parse::<u64>() {
      Ok(real_size) => {
        entry.real_size = real_size;
        entry.pax_gnu_1x_sparse = true;
      },
      Err(_) => log::warn!("ignoring unparseable GNU.sparse.realsize value"),
    }
  }
  if let Some(value) = headers.get(keys::gnu::SPARSE_NAME) {
    entry.name = value.clone();
  }

  if entry.kind == EntryKind::Directory && !entry.name.ends_with('/') {
    entry.name.push('/');
  }

  for (keyword, value) in headers {
    if !APPLIED_KEYS.contains(&keyword.as_str()) {
      entry.pax_extras.insert(keyword.clone(), value.clone());
    }
  }
}
