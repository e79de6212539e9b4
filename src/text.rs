use alloc::string::String;

/// Capability for turning raw name, link-target and PAX value bytes into
/// strings. The cursor never fails on decode problems the decoder chooses
/// to absorb.
pub trait TextDecoder {
  fn decode(&self, bytes: &[u8]) -> String;
}

/// Lossy UTF-8 decoding; invalid sequences become U+FFFD.
#[derive(Default, Clone, Copy, Debug)]
pub struct Utf8Decoder;

impl TextDecoder for Utf8Decoder {
  fn decode(&self, bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
  }
}
