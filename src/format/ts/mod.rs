//! MPEG Transport Stream decoder.
//!
//! The TS path reads 188-byte frames, follows PAT/PMT to find the
//! program's elementary streams, installs per-PID Turing keys from the
//! private-data stream, and decrypts scrambled payloads in place. Sync
//! loss is recovered by scanning forward for a run of aligned sync bytes;
//! until the next key update (and interval boundary) decryption stays
//! paused.
//!
//! In compatibility mode the output reproduces a known reference filter
//! byte for byte: resync-skipped bytes and NULL packets pass through, and
//! the packet straddling each 0x100000-byte output boundary has the high
//! bits of its fourth byte masked. Outside compatibility mode the output
//! is a strictly cleaner stream.

/// TS constants and table/header types
pub mod types;

/// TS header, PAT/PMT and key-payload parsing
pub mod parser;

/// Per-PID stream state
pub mod stream;

use crate::crypto::CipherPool;
use crate::error::{Result, TivoError};
use crate::format::{stream_block_number, stream_key_valid};
use bytes::{Buf, BytesMut};
use log::{debug, warn};
use parser::TsPacketParser;
use stream::TransportStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use types::*;

const OUT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Number of periodically spaced sync bytes required to re-lock after
/// sync loss.
const RESYNC_ANCHORS: usize = 5;

/// Transport Stream decoder for one recording.
pub struct TsDecoder<R, W> {
    reader: R,
    writer: W,
    parser: TsPacketParser,
    pool: CipherPool,
    /// Flat per-PID stream table (13-bit PID space).
    streams: Vec<Option<TransportStream>>,
    pmt_pid: Option<u16>,
    compatibility_mode: bool,
    /// Output bytes emitted, counting resync skips even when dropped.
    bytes_written: u64,
    /// While set, key updates are ignored and decryption stays suspended.
    resume_decryption_at: Option<u64>,
    mask_next_frame: bool,
    /// Bytes recovered during resync, consumed before reading more input.
    lookahead: BytesMut,
    out: BytesMut,
}

impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> TsDecoder<R, W> {
    /// Creates a decoder over the MPEG portion of a recording.
    pub fn new(reader: R, writer: W, media_key: &[u8; 20], compatibility_mode: bool) -> Self {
        let mut streams = Vec::with_capacity(PID_COUNT);
        streams.resize_with(PID_COUNT, || None);
        Self {
            reader,
            writer,
            parser: TsPacketParser::new(),
            pool: CipherPool::new(media_key),
            streams,
            pmt_pid: None,
            compatibility_mode,
            bytes_written: 0,
            resume_decryption_at: None,
            mask_next_frame: false,
            lookahead: BytesMut::new(),
            out: BytesMut::new(),
        }
    }

    /// Consumes the input to its end, writing the decrypted Transport
    /// Stream.
    pub async fn process(&mut self) -> Result<()> {
        loop {
            if let Some(at) = self.resume_decryption_at {
                if self.bytes_written >= at {
                    debug!("resuming decryption at output offset {:#x}", self.bytes_written);
                    self.resume_decryption_at = None;
                }
            }

            let mut packet = [0u8; TS_PACKET_SIZE];
            if !self.fill_packet(&mut packet).await? {
                break;
            }

            let header = match self.parser.parse_header(&packet) {
                Ok(h) if !h.transport_error => h,
                _ => {
                    if !self.resync(&packet).await? {
                        break;
                    }
                    continue;
                }
            };

            self.handle_packet(header, &mut packet).await?;
        }

        self.writer.write_all(&self.out).await?;
        self.out.clear();
        self.writer.flush().await?;
        Ok(())
    }

    async fn handle_packet(&mut self, header: TsHeader, packet: &mut [u8; TS_PACKET_SIZE]) -> Result<()> {
        let header_len = self.parser.parse_header_length(packet, &header)?;

        match header.pid {
            PID_PAT => {
                if header.payload_unit_start && header.contains_payload && header_len < TS_PACKET_SIZE {
                    let payload = &packet[header_len..];
                    let table_offset = payload[0] as usize + 1;
                    if table_offset >= payload.len() {
                        return Err(TivoError::MalformedTable(
                            "PAT pointer beyond packet".into(),
                        ));
                    }
                    let pat = self.parser.parse_pat(&payload[table_offset..])?;
                    if let Some(pid) = pat.program_map_pid() {
                        if self.pmt_pid != Some(pid) {
                            debug!("program map pid {:#06x}", pid);
                        }
                        self.pmt_pid = Some(pid);
                    }
                }
                self.emit_frame(packet).await
            }
            pid if Some(pid) == self.pmt_pid => {
                if header.payload_unit_start && header.contains_payload && header_len < TS_PACKET_SIZE {
                    let payload = &packet[header_len..];
                    let table_offset = payload[0] as usize + 1;
                    if table_offset >= payload.len() {
                        return Err(TivoError::MalformedTable(
                            "PMT pointer beyond packet".into(),
                        ));
                    }
                    let pmt = self.parser.parse_pmt(&payload[table_offset..])?;
                    self.apply_pmt(&pmt);
                }
                self.emit_frame(packet).await
            }
            PID_NULL => {
                if self.compatibility_mode {
                    self.emit_frame(packet).await
                } else {
                    Ok(())
                }
            }
            pid => {
                let is_key_stream = self.streams[pid as usize]
                    .as_ref()
                    .map(|s| s.stream_type() == StreamType::PrivateData)
                    .unwrap_or(false);
                if is_key_stream {
                    let payload = packet[header_len..].to_vec();
                    self.handle_key_packet(&payload)?;
                    if self.compatibility_mode {
                        self.emit_frame(packet).await
                    } else {
                        Ok(())
                    }
                } else {
                    self.handle_stream_packet(&header, packet, header_len).await
                }
            }
        }
    }

    fn apply_pmt(&mut self, pmt: &Pmt) {
        for declared in &pmt.streams {
            let stream_type = StreamType::from_type_id(declared.stream_type_id);
            match &mut self.streams[declared.pid as usize] {
                Some(existing) => existing.set_stream_type(stream_type),
                slot @ None => {
                    debug!(
                        "pid {:#06x}: declared as {:?} (type id 0x{:02x})",
                        declared.pid, stream_type, declared.stream_type_id
                    );
                    *slot = Some(TransportStream::new(declared.pid, stream_type));
                }
            }
        }
    }

    /// Installs the key entries from a private-data packet. During the
    /// window after sync loss, updates are ignored wholesale; once the
    /// output crosses the resume boundary, the next update re-activates
    /// each stream.
    fn handle_key_packet(&mut self, payload: &[u8]) -> Result<()> {
        let entries = self.parser.parse_key_payload(payload)?;
        if self.resume_decryption_at.is_some() {
            debug!(
                "ignoring {} key entries while decryption is suspended",
                entries.len()
            );
            return Ok(());
        }
        for entry in entries {
            let slot = &mut self.streams[entry.packet_id as usize];
            let stream = slot.get_or_insert_with(|| {
                TransportStream::new(entry.packet_id, StreamType::NotInPmt)
            });
            stream.install_key(entry.stream_id, entry.key);
        }
        Ok(())
    }

    async fn handle_stream_packet(
        &mut self,
        header: &TsHeader,
        packet: &mut [u8; TS_PACKET_SIZE],
        header_len: usize,
    ) -> Result<()> {
        let pid = header.pid as usize;
        if self.streams[pid].is_none() {
            warn!("pid {:#06x}: packet for a stream the PMT never declared", header.pid);
            self.streams[pid] = Some(TransportStream::new(header.pid, StreamType::NotInPmt));
        }

        let payload_len = TS_PACKET_SIZE - header_len;
        let stream = self.streams[pid].as_mut().unwrap();

        if header.payload_unit_start {
            stream.scanner.reset();
        }
        let scan = if header.payload_unit_start || stream.scanner.in_progress() {
            Some(stream.scanner.scan(&packet[header_len..]))
        } else {
            None
        };
        let pes_header_offset = match scan {
            Some(scan) if scan.complete => scan.len.min(payload_len),
            Some(_) => payload_len,
            None => 0,
        };

        if header.scrambling_control != 0 && pes_header_offset < payload_len {
            if stream.is_paused() {
                debug!("pid {:#06x}: decryption paused, passing through", header.pid);
            } else {
                match stream.key() {
                    None => {
                        warn!(
                            "pid {:#06x}: scrambled packet before any key, passing through",
                            header.pid
                        );
                    }
                    Some(key) => {
                        if !stream_key_valid(key) {
                            return Err(TivoError::Parser(format!(
                                "pid {:#06x}: stream key failed its validation bits",
                                header.pid
                            )));
                        }
                        let block = stream_block_number(key);
                        let stream_id = stream.stream_id();
                        let turing = self.pool.prepare_frame(stream_id, block)?;
                        packet[3] &= !0xC0;
                        turing.decrypt(&mut packet[header_len + pes_header_offset..]);
                    }
                }
            }
        }

        self.emit_frame(packet).await
    }

    /// Reads one packet, draining resync lookahead first. Returns false at
    /// end of input.
    async fn fill_packet(&mut self, packet: &mut [u8; TS_PACKET_SIZE]) -> Result<bool> {
        let mut have = 0usize;
        if !self.lookahead.is_empty() {
            let n = self.lookahead.len().min(TS_PACKET_SIZE);
            packet[..n].copy_from_slice(&self.lookahead[..n]);
            self.lookahead.advance(n);
            have = n;
        }
        while have < TS_PACKET_SIZE {
            let n = self.reader.read(&mut packet[have..]).await?;
            if n == 0 {
                if have > 0 {
                    debug!("input ended mid-packet ({} trailing bytes)", have);
                    if self.compatibility_mode {
                        let tail = packet[..have].to_vec();
                        self.emit_raw(&tail).await?;
                    }
                }
                return Ok(false);
            }
            have += n;
        }
        Ok(true)
    }

    /// Scans forward for a position where sync bytes repeat at the packet
    /// period, then pauses decryption until the next interval boundary.
    /// Returns false when the input ends before sync is regained.
    async fn resync(&mut self, bad: &[u8]) -> Result<bool> {
        warn!("transport sync lost at output offset {}", self.bytes_written);

        let mut window = BytesMut::new();
        window.extend_from_slice(bad);
        let carried = self.lookahead.split();
        window.extend_from_slice(&carried);

        let mut search_from = 1usize;
        let found = loop {
            let needed = search_from + (RESYNC_ANCHORS - 1) * TS_PACKET_SIZE + 1;
            if window.len() < needed {
                let mut chunk = [0u8; TS_PACKET_SIZE];
                let n = self.reader.read(&mut chunk).await?;
                if n == 0 {
                    break None;
                }
                window.extend_from_slice(&chunk[..n]);
                continue;
            }

            let limit = window.len() - (RESYNC_ANCHORS - 1) * TS_PACKET_SIZE;
            let mut hit = None;
            for p in search_from..limit {
                if (0..RESYNC_ANCHORS).all(|k| window[p + k * TS_PACKET_SIZE] == 0x47) {
                    hit = Some(p);
                    break;
                }
            }
            match hit {
                Some(p) => break Some(p),
                None => search_from = limit,
            }
        };

        match found {
            None => {
                debug!("input ended during resync after {} bytes", window.len());
                if self.compatibility_mode {
                    let tail = window.to_vec();
                    self.emit_raw(&tail).await?;
                } else {
                    self.bytes_written += window.len() as u64;
                }
                Ok(false)
            }
            Some(p) => {
                if self.compatibility_mode {
                    let skipped = window[..p].to_vec();
                    self.emit_raw(&skipped).await?;
                } else {
                    self.bytes_written += p as u64;
                }

                for slot in self.streams.iter_mut().flatten() {
                    slot.pause();
                }
                let at = self.bytes_written.div_ceil(RESUME_INTERVAL) * RESUME_INTERVAL;
                debug!(
                    "sync regained after skipping {} bytes; decryption suspended until {:#x}",
                    p, at
                );
                self.resume_decryption_at = Some(at);

                self.lookahead.extend_from_slice(&window[p..]);
                Ok(true)
            }
        }
    }

    async fn emit_frame(&mut self, packet: &mut [u8; TS_PACKET_SIZE]) -> Result<()> {
        if self.compatibility_mode {
            if self.mask_next_frame {
                packet[3] &= 0x3F;
                self.mask_next_frame = false;
            }
            let boundary = if self.bytes_written == 0 {
                RESUME_INTERVAL
            } else {
                self.bytes_written.div_ceil(RESUME_INTERVAL) * RESUME_INTERVAL
            };
            if boundary < self.bytes_written + TS_PACKET_SIZE as u64 {
                packet[3] &= 0x3F;
                if packet[0] == 0x47 && packet[3] & 0x30 != 0 {
                    self.mask_next_frame = true;
                }
            }
        }
        self.emit_raw(&packet[..]).await
    }

    async fn emit_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.extend_from_slice(bytes);
        self.bytes_written += bytes.len() as u64;
        if self.out.len() >= OUT_FLUSH_THRESHOLD {
            self.writer.write_all(&self.out).await?;
            self.out.clear();
        }
        Ok(())
    }
}
