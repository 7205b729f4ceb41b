//! # Per-Stream Cipher Pool
//!
//! Each elementary stream in a recording is decrypted with its own Turing
//! instance, rekeyed whenever the stream's block number changes. The pool
//! owns every [`TuringStream`]; packet decryption borrows one mutably for
//! the duration of a single decrypt call.
//!
//! Rekeying follows the recording scheme exactly: a 20-byte working key is
//! formed from the derived cipher key with the stream id at byte 16 and the
//! big-endian block number in bytes 17..19. The Turing round key is the
//! SHA-1 of the first 17 bytes only; the IV is the SHA-1 of all 20. The
//! 17-byte truncation is part of the scheme, not an accident, and must not
//! be "fixed".

use super::turing::{Turing, MAX_STREAM_LENGTH};
use crate::error::Result;
use sha1::{Digest, Sha1};

/// Keystream state for one (stream id, block id) pair.
pub struct TuringStream {
    stream_id: u8,
    block_id: u32,
    cipher: Turing,
    buffer: [u8; MAX_STREAM_LENGTH + 8],
    cursor: usize,
    available: usize,
}

impl TuringStream {
    fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            block_id: 0,
            cipher: Turing::new(),
            buffer: [0; MAX_STREAM_LENGTH + 8],
            cursor: 0,
            available: 0,
        }
    }

    /// Advances the keystream cursor by `count` bytes, regenerating whole
    /// frames as they are consumed.
    pub fn skip(&mut self, mut count: usize) {
        loop {
            let left = self.available - self.cursor;
            if count < left {
                self.cursor += count;
                return;
            }
            count -= left;
            self.regenerate();
        }
    }

    /// XORs `buf` in place with the next keystream bytes.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            if self.cursor >= self.available {
                self.regenerate();
            }
            *byte ^= self.buffer[self.cursor];
            self.cursor += 1;
        }
    }

    /// The stream id this keystream belongs to.
    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    /// The block id the cipher is currently keyed for.
    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    fn regenerate(&mut self) {
        self.available = self.cipher.generate(&mut self.buffer);
        self.cursor = 0;
    }

    fn rekey(&mut self, working_key: &[u8; 20], block_id: u32) -> Result<()> {
        self.block_id = block_id;

        let mut sha = Sha1::new();
        sha.update(&working_key[..17]);
        let round_key: [u8; 20] = sha.finalize().into();

        let mut sha = Sha1::new();
        sha.update(&working_key[..]);
        let iv: [u8; 20] = sha.finalize().into();

        self.cipher.set_key(&round_key)?;
        self.cipher.set_iv(&iv)?;
        self.buffer.fill(0);
        self.regenerate();
        Ok(())
    }
}

/// Owns the per-stream Turing instances for one decode.
///
/// Stream ids are single bytes, so the pool is a flat 256-slot array
/// rather than a map; entries are created on first sight and never
/// removed during a decode.
pub struct CipherPool {
    /// Derived cipher key; bytes 16..19 are scratch space for the
    /// per-frame (stream, block) overwrite.
    working_key: [u8; 20],
    streams: Vec<Option<TuringStream>>,
}

impl CipherPool {
    /// Creates a pool around a derived 20-byte cipher key (media or
    /// metadata, depending on what is being decrypted).
    pub fn new(key: &[u8; 20]) -> Self {
        let mut streams = Vec::with_capacity(256);
        streams.resize_with(256, || None);
        Self {
            working_key: *key,
            streams,
        }
    }

    /// Locates (or creates) the stream for `stream_id` and makes sure its
    /// cipher is keyed for `block_id`. A stream already on the requested
    /// block keeps its keystream position; a block change forces a full
    /// rekey from the start of the block.
    pub fn prepare_frame(&mut self, stream_id: u8, block_id: u32) -> Result<&mut TuringStream> {
        let slot = &mut self.streams[stream_id as usize];
        let needs_key = match slot {
            Some(stream) => stream.block_id != block_id,
            None => {
                *slot = Some(TuringStream::new(stream_id));
                true
            }
        };

        let stream = slot.as_mut().unwrap();
        if needs_key {
            self.working_key[16] = stream_id;
            self.working_key[17] = ((block_id >> 16) & 0xFF) as u8;
            self.working_key[18] = ((block_id >> 8) & 0xFF) as u8;
            self.working_key[19] = (block_id & 0xFF) as u8;
            stream.rekey(&self.working_key, block_id)?;
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::turing::MAX_STREAM_LENGTH;
    use quickcheck_macros::quickcheck;

    const KEY: [u8; 20] = [
        0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99,
        0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
    ];

    fn keystream(pool: &mut CipherPool, stream_id: u8, block_id: u32, len: usize) -> Vec<u8> {
        let stream = pool.prepare_frame(stream_id, block_id).unwrap();
        let mut buf = vec![0u8; len];
        stream.decrypt(&mut buf);
        buf
    }

    #[test]
    fn test_prepare_frame_matches_manual_derivation() {
        use sha1::{Digest, Sha1};

        let mut pool = CipherPool::new(&KEY);
        let from_pool = keystream(&mut pool, 0xE0, 0x1234, 32);

        let mut working = KEY;
        working[16] = 0xE0;
        working[17] = 0x00;
        working[18] = 0x12;
        working[19] = 0x34;

        let round_key: [u8; 20] = Sha1::digest(&working[..17]).into();
        let iv: [u8; 20] = Sha1::digest(&working[..]).into();

        let mut cipher = Turing::new();
        cipher.set_key(&round_key).unwrap();
        cipher.set_iv(&iv).unwrap();
        let mut frame = [0u8; MAX_STREAM_LENGTH + 8];
        cipher.generate(&mut frame);

        assert_eq!(from_pool[..], frame[..32]);
    }

    #[test]
    fn test_block_change_rekeys_same_block_continues() {
        let mut pool = CipherPool::new(&KEY);

        let first = keystream(&mut pool, 1, 7, 16);
        // same block: the cursor keeps moving
        let continued = keystream(&mut pool, 1, 7, 16);
        assert_ne!(first, continued);

        // block change and back: the keystream restarts
        let _ = keystream(&mut pool, 1, 8, 16);
        let restarted = keystream(&mut pool, 1, 7, 16);
        assert_eq!(first, restarted);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut pool = CipherPool::new(&KEY);
        let a = keystream(&mut pool, 1, 0, 24);
        let b = keystream(&mut pool, 2, 0, 24);
        assert_ne!(a, b);

        let stream = pool.prepare_frame(1, 0).unwrap();
        assert_eq!(stream.stream_id(), 1);
        assert_eq!(stream.block_id(), 0);
    }

    #[test]
    fn test_skip_is_equivalent_to_discarding() {
        let mut pool = CipherPool::new(&KEY);
        // read a long stretch in one go, crossing a frame boundary
        let long = keystream(&mut pool, 3, 1, MAX_STREAM_LENGTH + 64);

        let mut other = CipherPool::new(&KEY);
        let stream = other.prepare_frame(3, 1).unwrap();
        stream.skip(MAX_STREAM_LENGTH + 16);
        let mut tail = vec![0u8; 48];
        stream.decrypt(&mut tail);

        assert_eq!(long[MAX_STREAM_LENGTH + 16..], tail[..]);
    }

    #[quickcheck]
    fn prop_decrypt_reverses_itself(data: Vec<u8>, stream_id: u8, block: u32) -> bool {
        let block = block & 0x00FF_FFFF;
        let mut pool = CipherPool::new(&KEY);

        let mut buf = data.clone();
        pool.prepare_frame(stream_id, block).unwrap().decrypt(&mut buf);
        // rekey away and back to restart the keystream
        pool.prepare_frame(stream_id, block ^ 1).unwrap();
        pool.prepare_frame(stream_id, block).unwrap().decrypt(&mut buf);
        buf == data
    }

    #[test]
    fn test_decrypt_is_an_involution() {
        let plaintext = b"packetized elementary stream payload".to_vec();

        let mut pool = CipherPool::new(&KEY);
        let mut buf = plaintext.clone();
        pool.prepare_frame(9, 42).unwrap().decrypt(&mut buf);
        assert_ne!(buf, plaintext);

        // force a rekey away and back so the keystream restarts
        pool.prepare_frame(9, 43).unwrap();
        pool.prepare_frame(9, 42).unwrap().decrypt(&mut buf);
        assert_eq!(buf, plaintext);
    }
}
