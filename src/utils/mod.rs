//! # Utility Functions and Types
//!
//! This module provides common utility functions and types used throughout the tivodec library.
//! It includes implementations for:
//!
//! - Bit-level operations and manipulation
//! - Asynchronous input prefetching for slow pipe producers
//!
//! ## Bit Operations
//!
//! The bits module provides utilities for working with bit-level data:
//!
//! ```rust
//! use tivodec::utils::BitReader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = vec![0b10110011u8];
//! let mut reader = BitReader::new(&data);
//!
//! // Read specific number of bits
//! let value = reader.read_bits(3)?; // Reads first 3 bits (101)
//! assert_eq!(value, 0b101);
//! # Ok(())
//! # }
//! ```
//!
//! ## Input Prefetching
//!
//! The prefetch module wraps a sequential byte source in a bounded buffer
//! filled by a background task, so a pipe producer is never blocked behind
//! the decoder:
//!
//! ```rust,no_run
//! use tivodec::utils::PrefetchReader;
//! use tokio::io::{stdin, AsyncReadExt};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut reader = PrefetchReader::spawn(stdin());
//! let mut buf = [0u8; 188];
//! reader.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

/// Bit manipulation and bitstream reading utilities
pub mod bits;

/// Background input prefetching
pub mod prefetch;

// Re-export commonly used types
pub use bits::*;
pub use prefetch::PrefetchReader;
