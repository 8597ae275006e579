//! Byte transform applied to frame payloads around the codec.
//!
//! The server runs `transform` on each frame payload before it is wrapped in
//! a `ServerFrame`; clients run `inverse` on the payload after decoding.

/// A reversible byte-to-byte transform, e.g. compression.
pub trait FrameTransform: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn transform(&self, bytes: Vec<u8>) -> Vec<u8>;

    fn inverse(&self, bytes: Vec<u8>) -> Vec<u8>;

    /// True when `transform` returns its input unchanged. Lets the server
    /// write field data straight into the encoded frame.
    fn is_identity(&self) -> bool {
        false
    }
}

/// Passes payloads through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl FrameTransform for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn transform(&self, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn inverse(&self, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn is_identity(&self) -> bool {
        true
    }
}
