//! Error types for the vdisk core library.

use std::path::PathBuf;

/// The main error type for vdisk operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Malformed descriptor text or a corrupt extent header.
    #[error("format error: {message}")]
    Format { message: String },

    /// Operation or image variant this engine does not implement.
    #[error("not supported: {message}")]
    NotSupported { message: String },

    /// Write attempted against an extent whose declared access forbids it.
    #[error("access denied: {message}")]
    AccessDenied { message: String },
}

/// A specialized Result type for vdisk operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    /// Create an access-denied error.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Create an I/O error for an access outside the logical address space.
    pub fn out_of_range(offset: u64, len: usize, capacity: u64) -> Self {
        Self::io_simple(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "access of {} bytes at offset {} exceeds capacity {}",
                len, offset, capacity
            ),
        ))
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
