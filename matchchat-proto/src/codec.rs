//! Serialization and deserialization for push-channel frames.
//!
//! Frames are UTF-8 JSON text. Both directions go through [`encode`] and
//! [`decode`] so client and server agree on one error type.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Actual frame size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Maximum accepted frame size (64 KB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encodes an event into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode<T: Serialize>(event: &T) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes an event from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` for frames above [`MAX_FRAME_SIZE`],
/// or `CodecError::Serialization` if the text is not a valid event.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    serde_json::from_str(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}
