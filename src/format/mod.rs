//! # Recording Format Implementations
//!
//! This module provides the container-level pieces of the decoder:
//!
//! - **envelope**: the outer recording header, chunk table and key material
//! - **pes**: start-code scanning for unencrypted PES/ES header regions
//! - **ps**: the MPEG Program Stream decoder
//! - **ts**: the MPEG Transport Stream decoder
//! - **decoder**: the driver composing envelope → stream decoder → output
//!
//! ## Decoding a recording
//!
//! ```rust,no_run
//! use tivodec::{decode, DecodeOptions};
//! use tokio::fs::File;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let input = File::open("recording.TiVo").await?;
//! let output = File::create("recording.mpg").await?;
//!
//! decode(input, output, "0123456789", DecodeOptions::default()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Extracting metadata only
//!
//! ```rust,no_run
//! use tivodec::decode_metadata;
//! use tokio::fs::File;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let input = File::open("recording.TiVo").await?;
//! for document in decode_metadata(input, "0123456789").await? {
//!     println!("chunk: {} bytes", document.len());
//! }
//! # Ok(())
//! # }
//! ```

/// Outer envelope parsing and metadata decryption
pub mod envelope;

/// Start-code scanner for PES/ES header regions
pub mod pes;

/// MPEG Program Stream decoder
pub mod ps;

/// MPEG Transport Stream decoder
pub mod ts;

/// Pipeline driver and public entry points
pub mod decoder;

/// Decoder behaviour switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Reproduce the byte-exact output of the reference filter, including
    /// pass-through of resync-skipped bytes, NULL packets and the
    /// interval masking quirk. When false the output is a strictly
    /// cleaner stream.
    pub compatibility_mode: bool,
}

/// Recovers the Turing block number scattered across a 16-byte stream key.
pub(crate) fn stream_block_number(key: &[u8; 16]) -> u32 {
    ((key[1] as u32 & 0x3F) << 18)
        | ((key[2] as u32 & 0xFF) << 10)
        | ((key[3] as u32 & 0xC0) << 2)
        | ((key[3] as u32 & 0x1F) << 3)
        | ((key[4] as u32 & 0xE0) >> 5)
}

/// Checks the six bits of a stream key that the scheme requires to be set.
pub(crate) fn stream_key_valid(key: &[u8; 16]) -> bool {
    key[0] & 0x80 != 0
        && key[1] & 0x40 != 0
        && key[3] & 0x20 != 0
        && key[4] & 0x10 != 0
        && key[13] & 0x02 != 0
        && key[15] & 0x01 != 0
}

/// The 32-bit sentinel embedded in a stream key; decrypting it advances
/// the keystream to where the payload begins.
pub(crate) fn stream_key_sentinel(key: &[u8; 16]) -> u32 {
    u32::from_be_bytes([key[11], key[12], key[13], key[14]])
}

// Re-export commonly used types
pub use self::decoder::{decode, decode_metadata};
pub use self::envelope::{read_envelope, Chunk, ChunkKind, Envelope, StreamFormat, TivoHeader};
pub use self::pes::{HeaderScan, PesScanner};
pub use self::ps::PsDecoder;
pub use self::ts::TsDecoder;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_number_scatter() {
        let mut key = [0u8; 16];
        key[1] = 0x3F;
        key[2] = 0xFF;
        key[3] = 0xDF;
        key[4] = 0xE0;
        // all scatter source bits set: the 24-bit block is fully populated
        assert_eq!(stream_block_number(&key), 0x00FF_FFFF);

        let mut key = [0u8; 16];
        key[2] = 0x01;
        assert_eq!(stream_block_number(&key), 1 << 10);
    }

    #[test]
    fn test_key_validation_bits() {
        let mut key = [0u8; 16];
        key[0] = 0x80;
        key[1] = 0x40;
        key[3] = 0x20;
        key[4] = 0x10;
        key[13] = 0x02;
        key[15] = 0x01;
        assert!(stream_key_valid(&key));

        for (index, bit) in [(0usize, 0x80u8), (1, 0x40), (3, 0x20), (4, 0x10), (13, 0x02), (15, 0x01)] {
            let mut broken = key;
            broken[index] &= !bit;
            assert!(!stream_key_valid(&broken), "bit {:#04x} of byte {}", bit, index);
        }
    }

    #[test]
    fn test_sentinel_extraction() {
        let mut key = [0u8; 16];
        key[11] = 0xDE;
        key[12] = 0xAD;
        key[13] = 0xBE;
        key[14] = 0xEF;
        assert_eq!(stream_key_sentinel(&key), 0xDEAD_BEEF);
    }
}
