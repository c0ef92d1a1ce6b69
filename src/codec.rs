//! Reversible obfuscation codec for job artifacts.
//!
//! An encoded artifact (`*.a` file) is the job JSON gzip-compressed,
//! stripped of the two fixed gzip magic bytes, run through a keyed
//! chained-XOR transform and base64-encoded. The chain feeds every
//! output byte into the next one, so the transform is key-, position-
//! and history-dependent. It is an obfuscation layer, not a cipher;
//! nothing confidential may rely on it.

use std::io::{Read, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha512};
use thiserror::Error;

/// XOR mask derived from the configured password, one SHA-512 wide.
pub type Mask = [u8; 64];

const SALT_PREFIX: &str = "-<f!-";
const SALT_SUFFIX: &str = "<8z.";

/// The gzip magic bytes stripped on encode and restored on decode.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Failures while decoding an artifact.
///
/// Encoding itself cannot fail. Decoding fails on anything that is not
/// a well-formed artifact for the given mask; a wrong password usually
/// surfaces as [`Gzip`](CodecError::Gzip) or
/// [`Utf8`](CodecError::Utf8) rather than a panic.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The artifact is not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The unmasked stream is not a valid gzip body.
    #[error("corrupt compressed stream: {0}")]
    Gzip(#[from] std::io::Error),

    /// The decompressed bytes are not UTF-8.
    #[error("decoded text is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Derives the XOR mask for `password`.
pub fn make_mask(password: &str) -> Mask {
    let mut hasher = Sha512::new();
    hasher.update(SALT_PREFIX.as_bytes());
    hasher.update(password.as_bytes());
    hasher.update(SALT_SUFFIX.as_bytes());
    hasher.finalize().into()
}

/// Encodes `text` into an opaque transport string.
pub fn encode(mask: &Mask, text: &str) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;

    // The dropped magic bytes are re-prepended by decode.
    let mut body = compressed[GZIP_MAGIC.len()..].to_vec();
    let mut last = 0u8;
    for (i, byte) in body.iter_mut().enumerate() {
        *byte ^= mask[i % mask.len()];
        *byte ^= last;
        last = *byte;
    }
    Ok(STANDARD.encode(body))
}

/// Decodes a string produced by [`encode`] with the same mask.
pub fn decode(mask: &Mask, encoded: &str) -> Result<String, CodecError> {
    let mut body = STANDARD.decode(encoded)?;
    let mut last = 0u8;
    for (i, byte) in body.iter_mut().enumerate() {
        let chained = *byte;
        *byte ^= last;
        *byte ^= mask[i % mask.len()];
        last = chained;
    }

    let mut stream = Vec::with_capacity(GZIP_MAGIC.len() + body.len());
    stream.extend_from_slice(&GZIP_MAGIC);
    stream.extend_from_slice(&body);

    let mut decompressed = Vec::new();
    GzDecoder::new(stream.as_slice()).read_to_end(&mut decompressed)?;
    Ok(String::from_utf8(decompressed)?)
}
