#![forbid(unsafe_code)]

//! Error types shared by the codec and storage layers.

use std::fmt;

/// Errors from encoding or decoding a stored value.
///
/// Decode failures are ordinary `Err` values: the engine catches them and
/// falls back to the next source in the resolution order instead of
/// surfacing them to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A value could not be turned into its string form.
    Encode { detail: String },
    /// A persisted string could not be parsed back into a value.
    Decode { detail: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { detail } => write!(f, "encode failed: {detail}"),
            Self::Decode { detail } => write!(f, "decode failed: {detail}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors from the durable key-value medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend could not produce the stored string for a key.
    Read { detail: String },
    /// The backend could not durably record a change (e.g. quota, I/O).
    Write { detail: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { detail } => write!(f, "storage read failed: {detail}"),
            Self::Write { detail } => write!(f, "storage write failed: {detail}"),
        }
    }
}

impl std::error::Error for StorageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_display() {
        let err = CodecError::Decode {
            detail: "unexpected end of input".into(),
        };
        assert_eq!(err.to_string(), "decode failed: unexpected end of input");
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::Write {
            detail: "disk full".into(),
        };
        assert_eq!(err.to_string(), "storage write failed: disk full");
    }
}
