//! # matchdb Codec
//!
//! Blob serialization for matchdb payloads.
//!
//! The cache and store layers treat payloads as opaque values; this crate is
//! the single place where they are converted to and from the byte blobs the
//! storage engines hold. Any `serde`-serializable type round-trips.
//!
//! ## Usage
//!
//! ```
//! use matchdb_codec::{to_bytes, from_bytes};
//!
//! let bytes = to_bytes(&vec![1u32, 2, 3]).unwrap();
//! let back: Vec<u32> = from_bytes(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a payload to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a payload from CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}

/// Serializes a payload to a CBOR blob.
///
/// # Errors
///
/// Returns [`CodecError::EncodingFailed`] if the value cannot be represented
/// in CBOR (for example a map with non-string keys under `serde_json`
/// semantics, or a serializer error raised by the payload type itself).
pub fn to_bytes<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

/// Deserializes a payload from a CBOR blob.
///
/// # Errors
///
/// Returns [`CodecError::DecodingFailed`] if the bytes are not valid CBOR or
/// do not match the expected shape of `T`.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}
