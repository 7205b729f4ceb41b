//! Outer recording envelope: fixed header, chunk table, key material.
//!
//! A recording starts with a 16-byte header carrying the "TiVo" tag, a
//! flags word that picks Program vs Transport Stream, the absolute offset
//! of the first MPEG byte, and a count of metadata chunks. The chunks
//! follow immediately; the first must be plaintext and seeds both cipher
//! keys, later ones may be encrypted with the metadata key.

use crate::crypto::{derive_media_key, derive_metadata_key, CipherPool};
use crate::error::{Result, TivoError};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Magic tag every envelope starts with.
pub const ENVELOPE_TAG: &[u8; 4] = b"TiVo";

/// Flags-word bit distinguishing Transport Stream (set) from Program
/// Stream (cleared) payloads.
pub const FLAG_TRANSPORT_STREAM: u16 = 0x20;

/// Size of the fixed envelope header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of the per-chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 12;

/// Payload stream format declared by the envelope flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// MPEG Program Stream
    Program,
    /// MPEG Transport Stream
    Transport,
}

/// Whether a metadata chunk was stored in the clear or encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Chunk payload is stored as-is
    Plaintext,
    /// Chunk payload is Turing-encrypted under the metadata key
    Encrypted,
}

/// One metadata chunk, payload already decrypted where necessary.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk identifier from the chunk header
    pub id: u16,
    /// Storage kind the chunk arrived with
    pub kind: ChunkKind,
    /// Chunk payload (decrypted for [`ChunkKind::Encrypted`] chunks)
    pub data: Bytes,
}

/// The fixed envelope header.
#[derive(Debug, Clone, Copy)]
pub struct TivoHeader {
    /// Raw flags word; bit 0x20 selects Transport Stream
    pub flags: u16,
    /// Absolute byte offset at which MPEG payload begins
    pub mpeg_offset: u32,
    /// Number of metadata chunks following the header
    pub chunk_count: u16,
}

impl TivoHeader {
    /// Stream format selected by the flags word.
    pub fn format(&self) -> StreamFormat {
        if self.flags & FLAG_TRANSPORT_STREAM != 0 {
            StreamFormat::Transport
        } else {
            StreamFormat::Program
        }
    }
}

/// Everything the envelope yields to the stream decoders.
#[derive(Debug)]
pub struct Envelope {
    /// The fixed header
    pub header: TivoHeader,
    /// Derived media cipher key (SHA-1 of MAK + first chunk payload)
    pub media_key: [u8; 20],
    /// Metadata chunks in file order, decrypted
    pub chunks: Vec<Chunk>,
    /// Bytes of input consumed by the envelope
    pub consumed: u64,
}

impl Envelope {
    /// Stream format declared by the envelope.
    pub fn format(&self) -> StreamFormat {
        self.header.format()
    }
}

async fn read_exact_envelope<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TivoError::Envelope("short read in envelope".into())
        } else {
            TivoError::Io(e)
        }
    })?;
    Ok(())
}

/// Reads the envelope from the head of `reader`, decrypting encrypted
/// metadata chunks along the way.
///
/// On return the reader is positioned just past the last chunk; the
/// caller is responsible for advancing to `header.mpeg_offset` before
/// handing the stream to a decoder.
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R, mak: &str) -> Result<Envelope> {
    let mut head = [0u8; HEADER_SIZE];
    read_exact_envelope(reader, &mut head).await?;

    if &head[0..4] != ENVELOPE_TAG {
        return Err(TivoError::BadMagic);
    }

    let header = TivoHeader {
        flags: u16::from_be_bytes([head[6], head[7]]),
        mpeg_offset: u32::from_be_bytes([head[10], head[11], head[12], head[13]]),
        chunk_count: u16::from_be_bytes([head[14], head[15]]),
    };

    let mut consumed = HEADER_SIZE as u64;
    let mut chunks = Vec::with_capacity(header.chunk_count as usize);
    let mut media_key: Option<[u8; 20]> = None;
    let mut metadata_pool: Option<CipherPool> = None;
    // absolute offset the metadata keystream is aligned to
    let mut metadata_cursor = 0u64;

    for _ in 0..header.chunk_count {
        let mut chunk_head = [0u8; CHUNK_HEADER_SIZE];
        read_exact_envelope(reader, &mut chunk_head).await?;
        consumed += CHUNK_HEADER_SIZE as u64;

        let chunk_size = u32::from_be_bytes([chunk_head[0], chunk_head[1], chunk_head[2], chunk_head[3]]);
        let data_size = u32::from_be_bytes([chunk_head[4], chunk_head[5], chunk_head[6], chunk_head[7]]);
        let id = u16::from_be_bytes([chunk_head[8], chunk_head[9]]);
        let kind = u16::from_be_bytes([chunk_head[10], chunk_head[11]]);

        if (chunk_size as u64) < data_size as u64 + CHUNK_HEADER_SIZE as u64 {
            return Err(TivoError::Envelope(format!(
                "chunk size {} too small for {} data bytes",
                chunk_size, data_size
            )));
        }

        let payload_start = consumed;
        let mut data = vec![0u8; data_size as usize];
        read_exact_envelope(reader, &mut data).await?;
        consumed += data_size as u64;

        let kind = match kind {
            0 => ChunkKind::Plaintext,
            1 => ChunkKind::Encrypted,
            other => {
                return Err(TivoError::Envelope(format!(
                    "unknown chunk kind {}",
                    other
                )))
            }
        };

        match kind {
            ChunkKind::Plaintext => {
                if media_key.is_none() {
                    media_key = Some(derive_media_key(mak, &data));
                    metadata_pool = Some(CipherPool::new(&derive_metadata_key(mak)));
                    metadata_cursor = consumed;
                }
            }
            ChunkKind::Encrypted => {
                let pool = metadata_pool.as_mut().ok_or_else(|| {
                    TivoError::Envelope("encrypted chunk before any plaintext chunk".into())
                })?;
                let offset = payload_start - metadata_cursor;
                let stream = pool.prepare_frame(0, 0)?;
                stream.skip(offset as usize);
                stream.decrypt(&mut data);
                metadata_cursor = consumed;
            }
        }

        chunks.push(Chunk {
            id,
            kind,
            data: Bytes::from(data),
        });

        // discard padding up to the declared chunk size
        let padding = chunk_size as u64 - data_size as u64 - CHUNK_HEADER_SIZE as u64;
        if padding > 0 {
            let mut pad = vec![0u8; padding as usize];
            read_exact_envelope(reader, &mut pad).await?;
            consumed += padding;
        }
    }

    let media_key = media_key
        .ok_or_else(|| TivoError::Envelope("no plaintext chunk carrying key material".into()))?;

    Ok(Envelope {
        header,
        media_key,
        chunks,
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_metadata_key;
    use std::io::Cursor;
    use tokio::runtime::Runtime;

    fn build_header(flags: u16, mpeg_offset: u32, chunk_count: u16) -> Vec<u8> {
        let mut head = Vec::new();
        head.extend_from_slice(ENVELOPE_TAG);
        head.extend_from_slice(&[0u8; 2]); // reserved
        head.extend_from_slice(&flags.to_be_bytes());
        head.extend_from_slice(&[0u8; 2]); // reserved
        head.extend_from_slice(&mpeg_offset.to_be_bytes());
        head.extend_from_slice(&chunk_count.to_be_bytes());
        head
    }

    fn build_chunk(id: u16, kind: u16, data: &[u8], padding: usize) -> Vec<u8> {
        let chunk_size = (CHUNK_HEADER_SIZE + data.len() + padding) as u32;
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&chunk_size.to_be_bytes());
        chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
        chunk.extend_from_slice(&id.to_be_bytes());
        chunk.extend_from_slice(&kind.to_be_bytes());
        chunk.extend_from_slice(data);
        chunk.extend(std::iter::repeat(0u8).take(padding));
        chunk
    }

    #[test]
    fn test_rejects_bad_magic() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut data = build_header(0, 0x100, 0);
            data[0] = b'X';
            let err = read_envelope(&mut Cursor::new(data), "0123456789")
                .await
                .unwrap_err();
            assert!(matches!(err, TivoError::BadMagic));
        });
    }

    #[test]
    fn test_reads_plaintext_chunk_and_derives_key() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let chunk_data = vec![0xAB; 64];
            let mut input = build_header(0, 0x200, 1);
            input.extend_from_slice(&build_chunk(1, 0, &chunk_data, 4));

            let envelope = read_envelope(&mut Cursor::new(&input), "0123456789")
                .await
                .unwrap();
            assert_eq!(envelope.format(), StreamFormat::Program);
            assert_eq!(envelope.header.mpeg_offset, 0x200);
            assert_eq!(envelope.chunks.len(), 1);
            assert_eq!(envelope.chunks[0].kind, ChunkKind::Plaintext);
            assert_eq!(&envelope.chunks[0].data[..], &chunk_data[..]);
            assert_eq!(envelope.media_key, derive_media_key("0123456789", &chunk_data));
            assert_eq!(envelope.consumed, input.len() as u64);
        });
    }

    #[test]
    fn test_transport_flag_selects_ts() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut input = build_header(FLAG_TRANSPORT_STREAM, 0x100, 1);
            input.extend_from_slice(&build_chunk(1, 0, &[0u8; 8], 0));
            let envelope = read_envelope(&mut Cursor::new(input), "0123456789")
                .await
                .unwrap();
            assert_eq!(envelope.format(), StreamFormat::Transport);
        });
    }

    #[test]
    fn test_decrypts_encrypted_chunk() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mak = "0123456789";
            let first = vec![0x11; 64];
            let secret = b"<metadata>document body</metadata>".to_vec();

            // lay the file out first so the keystream offset is known
            let header = build_header(0, 0x400, 2);
            let chunk1 = build_chunk(1, 0, &first, 0);
            // encrypted chunk payload starts after its 12-byte header
            let gap = CHUNK_HEADER_SIZE;

            let mut pool = CipherPool::new(&derive_metadata_key(mak));
            let stream = pool.prepare_frame(0, 0).unwrap();
            stream.skip(gap);
            let mut encrypted = secret.clone();
            stream.decrypt(&mut encrypted); // XOR: encrypt == decrypt

            let chunk2 = build_chunk(2, 1, &encrypted, 0);

            let mut input = header;
            input.extend_from_slice(&chunk1);
            input.extend_from_slice(&chunk2);

            let envelope = read_envelope(&mut Cursor::new(input), mak).await.unwrap();
            assert_eq!(envelope.chunks.len(), 2);
            assert_eq!(envelope.chunks[1].kind, ChunkKind::Encrypted);
            assert_eq!(&envelope.chunks[1].data[..], &secret[..]);
        });
    }

    #[test]
    fn test_rejects_unknown_chunk_kind() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut input = build_header(0, 0x100, 1);
            input.extend_from_slice(&build_chunk(1, 2, &[0u8; 4], 0));
            let err = read_envelope(&mut Cursor::new(input), "0123456789")
                .await
                .unwrap_err();
            assert!(matches!(err, TivoError::Envelope(_)));
        });
    }

    #[test]
    fn test_short_read_is_envelope_error() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut input = build_header(0, 0x100, 1);
            input.extend_from_slice(&build_chunk(1, 0, &[0u8; 64], 0)[..20]);
            let err = read_envelope(&mut Cursor::new(input), "0123456789")
                .await
                .unwrap_err();
            assert!(matches!(err, TivoError::Envelope(_)));
        });
    }
}
