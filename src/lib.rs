#![doc(html_root_url = "https://docs.rs/tivodec/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tivodec - TiVo Recording Decoder
//!
//! `tivodec` decrypts proprietary TiVo recording containers back into
//! standard MPEG streams. A recording wraps an MPEG Program Stream or
//! Transport Stream in a small outer envelope naming the encryption
//! parameters; the payload is encrypted with the Turing stream cipher
//! under keys derived from the owner's Media Access Key (MAK).
//!
//! ## Features
//!
//! ### Container support
//! - Outer envelope parsing with encrypted metadata chunks
//! - MPEG Program Stream (PS) payloads
//! - MPEG Transport Stream (TS) payloads with PAT/PMT tracking
//!
//! ### Decryption
//! - Bit-exact Turing stream cipher keystream generation
//! - Per-stream cipher pool with block-based rekeying
//! - MAK-based media and metadata key derivation (SHA-1/MD5)
//!
//! ### Robustness
//! - Transport resynchronization after corrupted packets
//! - PES headers straddling packet boundaries
//! - Optional byte-exact compatibility mode matching a reference filter
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tivodec = "0.1.0"
//! ```
//!
//! ### Decoding a recording
//!
//! ```rust,no_run
//! use tivodec::{decode, DecodeOptions};
//! use tokio::fs::File;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let input = File::open("show.TiVo").await?;
//!     let output = File::create("show.mpg").await?;
//!
//!     decode(input, output, "0123456789", DecodeOptions::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Reading metadata without touching the payload
//!
//! ```rust,no_run
//! use tivodec::decode_metadata;
//! use tokio::fs::File;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let input = File::open("show.TiVo").await?;
//!     let documents = decode_metadata(input, "0123456789").await?;
//!     println!("{} metadata chunks", documents.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `crypto`: Turing cipher, per-stream cipher pool, key derivation
//! - `format`: envelope, PES scanning, PS/TS decoders, pipeline driver
//! - `error`: error types and the crate-wide `Result`
//! - `utils`: bit cursor and the background input prefetcher
//! - `config`: MAK lookup for the bundled demos

/// Cipher primitives: Turing, the stream pool, key derivation
pub mod crypto;

/// Error types and utilities
pub mod error;

/// Recording format implementations (envelope, PS, TS)
pub mod format;

/// Common utilities and helper functions
pub mod utils;

/// Configuration module
pub mod config;

pub use error::{Result, TivoError};
pub use format::{decode, decode_metadata, DecodeOptions};
