//! Message authentication primitive.
//!
//! The engine only needs a pure function from (key, message) to a 32-byte
//! tag. [`MacFunction`] is that seam; [`HmacSha256`] is the production
//! implementation backed by the RustCrypto `hmac` and `sha2` crates.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::DigestError;

/// Length in bytes of a digest produced by a [`MacFunction`].
pub const DIGEST_LEN: usize = 32;

/// A keyed message authentication function.
pub trait MacFunction: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Compute the tag of `message` under `key`.
    fn mac(&self, key: &[u8], message: &[u8]) -> Result<[u8; DIGEST_LEN], DigestError>;
}

/// HMAC-SHA256.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha256;

impl MacFunction for HmacSha256 {
    fn name(&self) -> &'static str {
        "hmac-sha256"
    }

    fn mac(&self, key: &[u8], message: &[u8]) -> Result<[u8; DIGEST_LEN], DigestError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
            .map_err(|e| DigestError::new(format!("invalid key: {e}")))?;
        mac.update(message);

        let tag = mac.finalize().into_bytes();
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&tag);
        Ok(out)
    }
}

/// Encode a digest as standard, padded Base64.
pub fn encode_digest(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}
