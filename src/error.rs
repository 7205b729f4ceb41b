//! # Error Types
//!
//! This module provides the error types used throughout the tivodec library.
//! It defines a central error type `TivoError` that encapsulates all possible
//! errors that can occur while unwrapping and decrypting a recording.
//!
//! ## Example Usage
//!
//! ```rust
//! use tivodec::error::{Result, TivoError};
//!
//! fn check_envelope_tag(data: &[u8]) -> Result<()> {
//!     if !data.starts_with(b"TiVo") {
//!         return Err(TivoError::BadMagic);
//!     }
//!
//!     // Continue with the chunk table...
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for the tivodec library
#[derive(Error, Debug)]
pub enum TivoError {
    /// I/O errors that occur while reading the recording or writing MPEG output
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The outer envelope does not start with the "TiVo" tag
    #[error("bad magic: envelope tag is not \"TiVo\"")]
    BadMagic,

    /// Structural problems in the outer envelope (short reads, bad chunk kinds)
    #[error("envelope malformed: {0}")]
    Envelope(String),

    /// A transport packet carries an adaptation field with private data,
    /// which this decoder does not support
    #[error("private adaptation field data is not supported")]
    PrivateAdaptation,

    /// PAT/PMT sections that fail structural validation
    #[error("malformed table: {0}")]
    MalformedTable(String),

    /// Errors that occur during parsing of PES/PS/TS structures
    #[error("parser error: {0}")]
    Parser(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// A specialized Result type for tivodec operations.
///
/// This type is used throughout the tivodec library to handle operations
/// that can produce a `TivoError`.
///
/// ## Example
///
/// ```rust
/// use tivodec::error::{Result, TivoError};
///
/// fn validate_chunk_kind(kind: u16) -> Result<()> {
///     match kind {
///         0 | 1 => Ok(()),
///         other => Err(TivoError::Envelope(format!("unknown chunk kind {}", other))),
///     }
/// }
/// ```
pub type Result<T> = std::result::Result<T, TivoError>;
