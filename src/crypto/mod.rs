//! # Cipher Primitives
//!
//! This module provides the cryptography a recording is wrapped in:
//!
//! - **Turing**: the QUALCOMM Turing stream cipher, generating keystream
//!   frames that are XORed against encrypted payload bytes
//! - **CipherPool**: per-stream cipher instances with block-based rekeying
//! - **Key derivation**: composition of the media and metadata cipher keys
//!   from the owner's Media Access Key
//!
//! ## Example
//!
//! ```rust
//! use tivodec::crypto::{derive_media_key, CipherPool};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = derive_media_key("0123456789", b"per-recording chunk data");
//! let mut pool = CipherPool::new(&key);
//!
//! let mut payload = vec![0x47u8; 16];
//! pool.prepare_frame(0xE0, 0x0001)?.decrypt(&mut payload);
//! # Ok(())
//! # }
//! ```

mod tables;

/// Turing stream cipher core
pub mod turing;

/// Per-stream cipher pool with block rekeying
pub mod stream;

/// MAK-based key derivation
pub mod keys;

pub use keys::{derive_media_key, derive_metadata_key};
pub use stream::{CipherPool, TuringStream};
pub use turing::{Turing, MAX_STREAM_LENGTH};
