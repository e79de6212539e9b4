use alloc::{string::String, vec::Vec};

use hashbrown::HashMap;

/// Seconds-and-nanoseconds timestamp as carried by tar headers and PAX
/// records.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeStamp {
  pub seconds_since_epoch: u64,
  pub nanoseconds: u32,
}

/// One contiguous data region of a sparse file: `length` on-disk bytes that
/// belong at `offset` in the dense file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseSpan {
  pub offset: u64,
  pub length: u64,
}

impl SparseSpan {
  /// First dense offset past this span.
  #[must_use]
  pub fn end(&self) -> u64 {
    self.offset + self.length
  }

  /// A `(0, 0)` span terminates a raw sparse map.
  #[must_use]
  pub fn is_terminator(&self) -> bool {
    self.offset == 0 && self.length == 0
  }
}

/// Entry flavor as identified by the typeflag byte.
///
/// `GnuLongName`, `GnuLongLink`, `PaxLocal` and `PaxGlobal` are
/// pseudo-entries: their payload is metadata for the next real member and
/// the cursor consumes them internally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
  Regular,
  HardLink,
  SymLink,
  CharDevice,
  BlockDevice,
  Directory,
  Fifo,
  /// GNU extension - long file name carrier (typeflag `L`)
  GnuLongName,
  /// GNU extension - long link name carrier (typeflag `K`)
  GnuLongLink,
  /// GNU extension - sparse file in the old format (typeflag `S`)
  OldGnuSparse,
  /// PAX extended header for the next member (typeflag `x`)
  PaxLocal,
  /// PAX global extended header (typeflag `g`)
  PaxGlobal,
  Other(u8),
}

impl From<u8> for EntryKind {
  fn from(value: u8) -> Self {
    match value {
      b'\0' | b'0' => EntryKind::Regular,
      b'1' => EntryKind::HardLink,
      b'2' => EntryKind::SymLink,
      b'3' => EntryKind::CharDevice,
      b'4' => EntryKind::BlockDevice,
      b'5' => EntryKind::Directory,
      b'6' => EntryKind::Fifo,
      b'x' => EntryKind::PaxLocal,
      b'g' => EntryKind::PaxGlobal,
      b'L' => EntryKind::GnuLongName,
      b'K' => EntryKind::GnuLongLink,
      b'S' => EntryKind::OldGnuSparse,
      other => EntryKind::Other(other),
    }
  }
}

/// One logical archive member.
///
/// Numeric fields are `None` when the header carried a value the decoder
/// could not represent and the reader runs in lenient mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
  pub name: String,
  pub link_name: String,
  pub kind: EntryKind,
  /// On-disk byte count of the payload following the header.
  pub size: u64,
  /// Logical dense size of the payload; differs from `size` only for
  /// sparse entries.
  pub real_size: u64,
  pub mode: Option<u32>,
  pub uid: Option<u64>,
  pub gid: Option<u64>,
  pub mtime: Option<TimeStamp>,
  pub atime: Option<TimeStamp>,
  pub ctime: Option<TimeStamp>,
  pub uname: String,
  pub gname: String,
  pub dev_major: Option<u32>,
  pub dev_minor: Option<u32>,
  /// Old-GNU bit: sparse continuation records follow the header.
  pub is_extended: bool,
  /// Canonical sparse spans, sorted by offset. Empty for dense entries.
  pub sparse_spans: Vec<SparseSpan>,
  /// PAX keywords that override no decoded field.
  pub pax_extras: HashMap<String, String>,
  pub(crate) pax_sparse: bool,
  pub(crate) pax_gnu_1x_sparse: bool,
}

impl Default for Entry {
  fn default() -> Self {
    Self {
      name: String::new(),
      link_name: String::new(),
      kind: EntryKind::Regular,
      size: 0,
      real_size: 0,
      mode: None,
      uid: None,
      gid: None,
      mtime: None,
      atime: None,
      ctime: None,
      uname: String::new(),
      gname: String::new(),
      dev_major: None,
      dev_minor: None,
      is_extended: false,
      sparse_spans: Vec::new(),
      pax_extras: HashMap::new(),
      pax_sparse: false,
      pax_gnu_1x_sparse: false,
    }
  }
}

impl Entry {
  #[must_use]
  pub fn is_directory(&self) -> bool {
    self.kind == EntryKind::Directory || self.name.ends_with('/')
  }

  #[must_use]
  pub fn is_long_name(&self) -> bool {
    self.kind == EntryKind::GnuLongName
  }

  #[must_use]
  pub fn is_long_link(&self) -> bool {
    self.kind == EntryKind::GnuLongLink
  }

  #[must_use]
  pub fn is_old_gnu_sparse(&self) -> bool {
    self.kind == EntryKind::OldGnuSparse
  }

  #[must_use]
  pub fn is_pax_local(&self) -> bool {
    self.kind == EntryKind::PaxLocal
  }

  #[must_use]
  pub fn is_pax_global(&self) -> bool {
    self.kind == EntryKind::PaxGlobal
  }

  /// Whether the applied PAX headers marked this entry as GNU sparse 1.x,
  /// meaning its payload starts with a decimal sparse map.
  #[must_use]
  pub fn is_pax_gnu_1x_sparse(&self) -> bool {
    self.pax_gnu_1x_sparse
  }

  /// Whether the payload must be reconstructed through a sparse map.
  #[must_use]
  pub fn is_sparse(&self) -> bool {
    self.is_old_gnu_sparse()
      || self.pax_sparse
      || self.pax_gnu_1x_sparse
      || !self.sparse_spans.is_empty()
  }
}
