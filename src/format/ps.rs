//! MPEG Program Stream decoder.
//!
//! The PS path scans the input a byte at a time, keeping a rolling 32-bit
//! marker of the last four bytes. Whenever the top 24 bits equal 0x000001
//! the low byte is a start-code selector: pack/system codes pass straight
//! through, PES packets are reassembled, their private-data extension is
//! walked for the per-stream Turing key, and scrambled payloads are
//! decrypted in place before being written out.

use crate::crypto::CipherPool;
use crate::error::{Result, TivoError};
use crate::format::{stream_block_number, stream_key_sentinel, stream_key_valid};
use bytes::BytesMut;
use log::{debug, warn};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const OUT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// How a start-code selector is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartCodeClass {
    /// Pack/system/video codes that pass through untouched
    Special,
    /// PES packets with only a length field
    PesSimple,
    /// PES packets with flags, header data and possibly a cipher key
    PesComplex,
    /// Not a recognised selector
    None,
}

fn classify(code: u8) -> StartCodeClass {
    match code {
        0x00..=0xBA => StartCodeClass::Special,
        0xBB | 0xBC | 0xBE | 0xBF | 0xF0..=0xF2 | 0xF8 | 0xFA..=0xFF => StartCodeClass::PesSimple,
        0xBD | 0xC0..=0xEF | 0xF3..=0xF7 | 0xF9 => StartCodeClass::PesComplex,
        #[allow(unreachable_patterns)]
        _ => StartCodeClass::None,
    }
}

/// Per-selector key state recovered from PES private data.
#[derive(Debug, Clone, Copy)]
struct PsStream {
    block_number: u32,
}

/// Program Stream decoder for one recording.
pub struct PsDecoder<R, W> {
    reader: BufReader<R>,
    writer: W,
    pool: CipherPool,
    /// Key state per start-code selector; flat because selectors are bytes.
    streams: Vec<Option<PsStream>>,
    out: BytesMut,
}

impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> PsDecoder<R, W> {
    /// Creates a decoder over the MPEG portion of a recording.
    pub fn new(reader: R, writer: W, media_key: &[u8; 20]) -> Self {
        let mut streams = Vec::with_capacity(256);
        streams.resize_with(256, || None);
        Self {
            reader: BufReader::new(reader),
            writer,
            pool: CipherPool::new(media_key),
            streams,
            out: BytesMut::new(),
        }
    }

    /// Consumes the input to its end, writing the decrypted Program Stream.
    pub async fn process(&mut self) -> Result<()> {
        let mut marker = 0xFFFF_FFFFu32;

        loop {
            let byte = match self.reader.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            marker = (marker << 8) | byte as u32;

            if marker >> 8 != 0x0000_0001 {
                self.emit(&[byte]).await?;
                continue;
            }

            let class = classify(byte);
            match class {
                StartCodeClass::Special => {
                    self.emit(&[byte]).await?;
                }
                StartCodeClass::PesSimple | StartCodeClass::PesComplex => {
                    let complex = class == StartCodeClass::PesComplex;
                    match self.handle_pes(byte, complex).await {
                        Ok(()) => {}
                        Err(TivoError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                            warn!("input ended inside a PES packet for stream 0x{:02x}", byte);
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                    marker = 0xFFFF_FFFF;
                }
                StartCodeClass::None => {
                    return Err(TivoError::Parser(format!(
                        "unhandled start code 0x{:02x} in program stream",
                        byte
                    )));
                }
            }
        }

        self.writer.write_all(&self.out).await?;
        self.out.clear();
        self.writer.flush().await?;
        Ok(())
    }

    async fn handle_pes(&mut self, code: u8, complex: bool) -> Result<()> {
        if !complex {
            let mut length_field = [0u8; 2];
            self.reader.read_exact(&mut length_field).await?;
            let length = u16::from_be_bytes(length_field) as usize;

            let mut packet = vec![0u8; 2 + length];
            packet[0..2].copy_from_slice(&length_field);
            self.reader.read_exact(&mut packet[2..]).await?;

            // the program stream map carries a single flag to clear
            if code == 0xBC && packet.len() > 2 {
                packet[2] &= !0x20;
            }

            self.emit(&[code]).await?;
            self.emit(&packet).await?;
            return Ok(());
        }

        let mut header = [0u8; 5];
        self.reader.read_exact(&mut header).await?;
        if header[2] & 0xC0 != 0x80 {
            return Err(TivoError::Parser(format!(
                "PES marker bits missing for stream 0x{:02x}",
                code
            )));
        }

        let mut scramble = (header[2] >> 4) & 0x03;
        let pes_header_len = header[4] as usize;
        let length = u16::from_be_bytes([header[0], header[1]]) as usize;

        if scramble == 1 || scramble == 2 {
            warn!(
                "unexpected scramble control {} for stream 0x{:02x}, treating as clear",
                scramble, code
            );
            scramble = 0;
        }

        let mut packet = Vec::with_capacity(2 + length);
        packet.extend_from_slice(&header);

        if scramble == 3 {
            if header[3] & 0x01 != 0 {
                // the extension area carries the refreshed stream key
                let mut extension = vec![0u8; pes_header_len];
                self.reader.read_exact(&mut extension).await?;
                self.process_scrambled_packet(code, &extension)?;
                packet.extend_from_slice(&extension);
            }

            let remaining = (2 + length).checked_sub(packet.len()).ok_or_else(|| {
                TivoError::Parser(format!(
                    "PES length {} shorter than its header for stream 0x{:02x}",
                    length, code
                ))
            })?;
            let start = packet.len();
            packet.resize(start + remaining, 0);
            self.reader.read_exact(&mut packet[start..]).await?;

            let header_end = 5 + pes_header_len;
            if header_end < packet.len() {
                match self.streams[code as usize] {
                    Some(stream) => {
                        let turing = self.pool.prepare_frame(code, stream.block_number)?;
                        turing.decrypt(&mut packet[header_end..]);
                        packet[2] &= !0x30;
                    }
                    None => {
                        warn!(
                            "scrambled packet on stream 0x{:02x} before any key, leaving as-is",
                            code
                        );
                    }
                }
            } else {
                packet[2] &= !0x30;
            }
        } else {
            let remaining = (2 + length).checked_sub(packet.len()).ok_or_else(|| {
                TivoError::Parser(format!(
                    "PES length {} shorter than its header for stream 0x{:02x}",
                    length, code
                ))
            })?;
            let start = packet.len();
            packet.resize(start + remaining, 0);
            self.reader.read_exact(&mut packet[start..]).await?;
        }

        self.emit(&[code]).await?;
        self.emit(&packet).await?;
        Ok(())
    }

    /// Walks the chained PES extension flags inside the header-data area,
    /// picking up the 16-byte Turing key when the private-data flag is set.
    fn process_scrambled_packet(&mut self, code: u8, extension: &[u8]) -> Result<()> {
        let mut offset = 0usize;

        loop {
            if offset >= extension.len() {
                break;
            }
            let flags = extension[offset];
            offset += 1;

            if flags & 0x10 != 0 {
                // P-STD buffer field
                offset += 2;
            }
            if flags & 0x80 != 0 {
                offset += 4;
                let end = offset.checked_add(16).filter(|&e| e <= extension.len());
                let Some(end) = end else {
                    return Err(TivoError::Parser(format!(
                        "PES private data truncated for stream 0x{:02x}",
                        code
                    )));
                };
                let mut key = [0u8; 16];
                key.copy_from_slice(&extension[offset..end]);
                self.process_private_data(code, &key)?;
                offset = end;
            }
            if flags & 0x01 != 0 {
                // PES extension 2: another flags byte follows
                continue;
            }
            break;
        }
        Ok(())
    }

    fn process_private_data(&mut self, code: u8, key: &[u8; 16]) -> Result<()> {
        if !stream_key_valid(key) {
            return Err(TivoError::Parser(format!(
                "stream key failed its validation bits for stream 0x{:02x}",
                code
            )));
        }

        let block_number = stream_block_number(key);
        let sentinel = stream_key_sentinel(key);
        debug!(
            "stream 0x{:02x}: key refresh, block {:#08x}",
            code, block_number
        );

        self.streams[code as usize] = Some(PsStream { block_number });

        // decrypting the sentinel advances the keystream past it, which is
        // where the payload's keystream starts
        let turing = self.pool.prepare_frame(code, block_number)?;
        let mut scratch = sentinel.to_be_bytes();
        turing.decrypt(&mut scratch);
        Ok(())
    }

    async fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.extend_from_slice(bytes);
        if self.out.len() >= OUT_FLUSH_THRESHOLD {
            self.writer.write_all(&self.out).await?;
            self.out.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::runtime::Runtime;

    fn decode_ps(input: &[u8], key: &[u8; 20]) -> Result<Vec<u8>> {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut output = Vec::new();
            let mut decoder = PsDecoder::new(Cursor::new(input.to_vec()), &mut output, key);
            decoder.process().await?;
            Ok(output)
        })
    }

    #[test]
    fn test_classify_covers_every_selector() {
        for code in 0u8..=255 {
            assert_ne!(classify(code), StartCodeClass::None, "code {:#04x}", code);
        }
    }

    #[test]
    fn test_clear_pes_packet_passes_through() {
        // unscrambled video PES: header + 10 payload bytes
        let mut input = vec![0x00, 0x00, 0x01, 0xE0];
        input.extend_from_slice(&[0x00, 0x0A]); // length = 10
        input.extend_from_slice(&[0x80, 0x00, 0x02]); // flags, 2 header bytes
        input.extend_from_slice(&[0x11, 0x22]); // header data
        input.extend_from_slice(&[0xA0, 0xA1, 0xA2, 0xA3, 0xA4]); // payload

        let output = decode_ps(&input, &[0u8; 20]).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_special_codes_pass_through() {
        let input = vec![0x00, 0x00, 0x01, 0xB7];
        let output = decode_ps(&input, &[0u8; 20]).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_bad_pes_marker_is_fatal() {
        let mut input = vec![0x00, 0x00, 0x01, 0xE0];
        input.extend_from_slice(&[0x00, 0x03]);
        input.extend_from_slice(&[0x00, 0x00, 0x00]); // top bits not '10'

        let err = decode_ps(&input, &[0u8; 20]).unwrap_err();
        assert!(matches!(err, TivoError::Parser(_)));
    }

    #[test]
    fn test_program_stream_map_flag_cleared() {
        let mut input = vec![0x00, 0x00, 0x01, 0xBC];
        input.extend_from_slice(&[0x00, 0x04]);
        input.extend_from_slice(&[0xFF, 0x21, 0x33, 0x44]);

        let output = decode_ps(&input, &[0u8; 20]).unwrap();
        let mut expected = input.clone();
        expected[6] &= !0x20; // byte 2 of the reconstructed packet
        assert_eq!(output, expected);
    }
}
