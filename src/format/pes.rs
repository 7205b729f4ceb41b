//! Start-code scanner for unencrypted MPEG header regions.
//!
//! Inside a recording only the elementary-stream payload proper is
//! encrypted; PES headers and the video headers that follow them
//! (sequence, GOP, picture, extensions) are in the clear. Before a packet
//! can be decrypted the decoder has to measure how many leading bytes
//! belong to that header region. The scanner walks start codes and their
//! bodies bit by bit and reports the byte length of header material, or
//! that the header continues into the next packet.
//!
//! Transport packets are only 184 payload bytes, so headers straddle
//! packet boundaries routinely. The scanner therefore keeps its parse
//! state between calls: the start code in progress, pending skip counts,
//! and the tail bytes of an unfinished syntactic unit.

use crate::utils::BitReader;
use log::{debug, warn};

/// Result of scanning one payload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderScan {
    /// Bytes of header material inside the scanned buffer, rounded up to
    /// a whole byte.
    pub len: usize,
    /// True when the header region ended inside this buffer. False means
    /// every byte of the buffer is header and the scan resumes with the
    /// next buffer.
    pub complete: bool,
    /// The PES scramble-control flag was set. `len` is reported as 0 and
    /// the caller must decrypt from the very start of the payload.
    pub scrambled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Byte-aligned search for the 0x000001 prefix; only stuffing zeros
    /// are tolerated in between.
    Scan { zeros: u8 },
    /// Inside a user-data body: arbitrary bytes until the next prefix.
    UserData { zeros: u8 },
    /// Prefix seen; the next byte selects the code.
    Selector,
    /// Collecting the fixed-size region of `code`.
    Fixed { code: u8 },
    /// Discarding a known number of bits.
    SkipBits { bits: usize, then: Then },
    /// Sequence header: the non-intra matrix flag follows the skipped
    /// intra matrix.
    SeqNonIntra,
    /// Picture-header stuffing groups (a 1-bit marker plus 8 bits each).
    Stuffing,
    /// The header region has ended; everything that follows is payload.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Then {
    NextCode,
    UserData,
    SeqNonIntra,
}

enum Step {
    Continue,
    Incomplete { resume_bits: usize },
    Complete { stop_bits: usize, scrambled: bool },
}

/// Resumable scanner over the header region of one elementary stream.
pub struct PesScanner {
    state: State,
    /// Tail bytes of the unfinished unit from the previous buffer.
    carry: Vec<u8>,
    /// Bits of `carry` that were already consumed.
    carry_bits: usize,
}

impl PesScanner {
    /// Creates a scanner with no header in progress.
    pub fn new() -> Self {
        Self {
            state: State::Done,
            carry: Vec::new(),
            carry_bits: 0,
        }
    }

    /// Starts a fresh header region, discarding any straddle state. Called
    /// when a payload-unit-start packet arrives.
    pub fn reset(&mut self) {
        self.state = State::Scan { zeros: 0 };
        self.carry.clear();
        self.carry_bits = 0;
    }

    /// Whether a header region is still being parsed.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, State::Done)
    }

    /// Scans `buf` for the end of the current header region.
    pub fn scan(&mut self, buf: &[u8]) -> HeaderScan {
        if let State::Done = self.state {
            return HeaderScan {
                len: 0,
                complete: true,
                scrambled: false,
            };
        }

        let owned;
        let work: &[u8] = if self.carry.is_empty() {
            buf
        } else {
            let mut joined = Vec::with_capacity(self.carry.len() + buf.len());
            joined.extend_from_slice(&self.carry);
            joined.extend_from_slice(buf);
            owned = joined;
            &owned
        };
        let base_bits = (work.len() - buf.len()) * 8;

        let mut reader = BitReader::new(work);
        if self.carry_bits > 0 {
            reader
                .skip_bits(self.carry_bits as u32)
                .expect("carry cursor inside carried byte");
        }

        let step = loop {
            let step = match self.state.clone() {
                State::Done => Step::Complete {
                    stop_bits: reader.bits_consumed(),
                    scrambled: false,
                },
                State::Scan { zeros } => self.step_scan(&mut reader, zeros, true),
                State::UserData { zeros } => self.step_scan(&mut reader, zeros, false),
                State::Selector => self.step_selector(&mut reader),
                State::Fixed { code } => self.step_fixed(&mut reader, code),
                State::SkipBits { bits, then } => self.step_skip(&mut reader, bits, then),
                State::SeqNonIntra => self.step_seq_non_intra(&mut reader),
                State::Stuffing => self.step_stuffing(&mut reader),
            };
            match step {
                Step::Continue => continue,
                other => break other,
            }
        };

        match step {
            Step::Incomplete { resume_bits } => {
                // every byte of this buffer is header; keep the tail of the
                // unfinished unit for the next call
                let keep_from = resume_bits / 8;
                self.carry = work[keep_from..].to_vec();
                self.carry_bits = resume_bits % 8;
                HeaderScan {
                    len: buf.len(),
                    complete: false,
                    scrambled: false,
                }
            }
            Step::Complete {
                stop_bits,
                scrambled,
            } => {
                self.state = State::Done;
                self.carry.clear();
                self.carry_bits = 0;
                if scrambled {
                    return HeaderScan {
                        len: 0,
                        complete: true,
                        scrambled: true,
                    };
                }
                let in_buf_bits = stop_bits.saturating_sub(base_bits);
                let len = (in_buf_bits + 7) / 8;
                if stop_bits < base_bits {
                    debug!("header region ended inside the previous packet");
                }
                HeaderScan {
                    len: len.min(buf.len()),
                    complete: true,
                    scrambled: false,
                }
            }
            Step::Continue => unreachable!(),
        }
    }

    /// Prefix search. In the inter-code gap (`strict`) only zero stuffing
    /// bytes may precede the prefix; inside user data anything goes.
    fn step_scan(&mut self, reader: &mut BitReader<'_>, mut zeros: u8, strict: bool) -> Step {
        // byte-align, abandoning the region if a 1 bit is discarded
        if !reader.is_byte_aligned() {
            let rem = (8 - reader.bits_consumed() % 8) as u8;
            let discarded = reader.read_bits(rem).expect("aligning inside current byte");
            if strict && discarded != 0 {
                return Step::Complete {
                    stop_bits: reader.bits_consumed(),
                    scrambled: false,
                };
            }
        }

        loop {
            let byte = match reader.read_bits(8) {
                Ok(b) => b as u8,
                Err(_) => {
                    self.state = if strict {
                        State::Scan { zeros }
                    } else {
                        State::UserData { zeros }
                    };
                    return Step::Incomplete {
                        resume_bits: reader.bits_consumed(),
                    };
                }
            };
            if byte == 0x00 {
                zeros = zeros.saturating_add(1);
            } else if byte == 0x01 && zeros >= 2 {
                self.state = State::Selector;
                return Step::Continue;
            } else if strict {
                // not stuffing and not a prefix: header region ends here
                reader.rewind_bits(8).expect("rewinding the byte just read");
                return Step::Complete {
                    stop_bits: reader.bits_consumed(),
                    scrambled: false,
                };
            } else {
                zeros = 0;
            }
        }
    }

    fn step_selector(&mut self, reader: &mut BitReader<'_>) -> Step {
        let code = match reader.read_bits(8) {
            Ok(c) => c as u8,
            Err(_) => {
                self.state = State::Selector;
                return Step::Incomplete {
                    resume_bits: reader.bits_consumed(),
                };
            }
        };

        match code {
            // slices begin the encrypted payload
            0x01..=0xAF => Step::Complete {
                stop_bits: reader.bits_consumed().saturating_sub(32),
                scrambled: false,
            },
            0x00 => {
                self.state = State::Fixed { code };
                Step::Continue
            }
            0xB2 => {
                self.state = State::SkipBits {
                    bits: 8,
                    then: Then::UserData,
                };
                Step::Continue
            }
            0xB3 | 0xB5 => {
                self.state = State::Fixed { code };
                Step::Continue
            }
            0xB7 | 0xF9 => {
                self.state = State::Scan { zeros: 0 };
                Step::Continue
            }
            0xB8 => {
                self.state = State::SkipBits {
                    bits: 27,
                    then: Then::NextCode,
                };
                Step::Continue
            }
            0xBD | 0xC0..=0xEF => {
                self.state = State::Fixed { code };
                Step::Continue
            }
            other => {
                warn!("unknown start code 0x{:02x} in header region", other);
                Step::Complete {
                    stop_bits: reader.bits_consumed().saturating_sub(32),
                    scrambled: false,
                }
            }
        }
    }

    fn step_fixed(&mut self, reader: &mut BitReader<'_>, code: u8) -> Step {
        let need = match code {
            0x00 | 0xBD | 0xC0..=0xEF => 5,
            _ => 8,
        };
        if reader.bits_remaining() < need * 8 {
            self.state = State::Fixed { code };
            return Step::Incomplete {
                resume_bits: reader.bits_consumed(),
            };
        }

        // enough bytes are present; none of the reads below can fail
        match code {
            0x00 => {
                reader.skip_bits(10).unwrap();
                let frame_type = reader.read_bits(3).unwrap();
                reader.skip_bits(16).unwrap();
                if frame_type == 2 || frame_type == 3 {
                    reader.skip_bits(4).unwrap();
                }
                if frame_type == 3 {
                    reader.skip_bits(4).unwrap();
                }
                self.state = State::Stuffing;
            }
            0xB3 => {
                reader.skip_bits(62).unwrap();
                if reader.read_bits(1).unwrap() == 1 {
                    self.state = State::SkipBits {
                        bits: 64 * 8,
                        then: Then::SeqNonIntra,
                    };
                } else if reader.read_bits(1).unwrap() == 1 {
                    self.state = State::SkipBits {
                        bits: 64 * 8,
                        then: Then::NextCode,
                    };
                } else {
                    self.state = State::Scan { zeros: 0 };
                }
            }
            0xB5 => {
                let subtype = reader.read_bits(4).unwrap();
                match subtype {
                    1 => {
                        reader.skip_bits(44).unwrap();
                        self.state = State::Scan { zeros: 0 };
                    }
                    2 => {
                        reader.skip_bits(3).unwrap();
                        let colour_description = reader.read_bits(1).unwrap();
                        reader.skip_bits(29).unwrap();
                        if colour_description == 1 {
                            reader.skip_bits(24).unwrap();
                        }
                        self.state = State::Scan { zeros: 0 };
                    }
                    8 => {
                        reader.skip_bits(29).unwrap();
                        let composite_display = reader.read_bits(1).unwrap();
                        if composite_display == 1 {
                            reader.skip_bits(20).unwrap();
                        }
                        self.state = State::Scan { zeros: 0 };
                    }
                    other => {
                        warn!("unknown extension subtype {} in header region", other);
                        // 36 bits are consumed here: the prefix, the
                        // selector, and the subtype nibble just read
                        return Step::Complete {
                            stop_bits: reader.bits_consumed().saturating_sub(36),
                            scrambled: false,
                        };
                    }
                }
            }
            _ => {
                // PES header: packet length, marker, scramble control,
                // remaining flags, then the header-data region
                reader.skip_bits(16).unwrap();
                reader.skip_bits(2).unwrap();
                let scramble = reader.read_bits(2).unwrap();
                if scramble != 0 {
                    return Step::Complete {
                        stop_bits: reader.bits_consumed(),
                        scrambled: true,
                    };
                }
                reader.skip_bits(12).unwrap();
                let header_data_len = reader.read_bits(8).unwrap() as usize;
                self.state = State::SkipBits {
                    bits: header_data_len * 8,
                    then: Then::NextCode,
                };
            }
        }
        Step::Continue
    }

    fn step_skip(&mut self, reader: &mut BitReader<'_>, bits: usize, then: Then) -> Step {
        let available = reader.bits_remaining();
        if available < bits {
            reader.skip_bits(available as u32).unwrap();
            self.state = State::SkipBits {
                bits: bits - available,
                then,
            };
            return Step::Incomplete {
                resume_bits: reader.bits_consumed(),
            };
        }
        reader.skip_bits(bits as u32).unwrap();
        self.state = match then {
            Then::NextCode => State::Scan { zeros: 0 },
            Then::UserData => State::UserData { zeros: 0 },
            Then::SeqNonIntra => State::SeqNonIntra,
        };
        Step::Continue
    }

    fn step_seq_non_intra(&mut self, reader: &mut BitReader<'_>) -> Step {
        match reader.read_bits(1) {
            Ok(1) => {
                self.state = State::SkipBits {
                    bits: 64 * 8,
                    then: Then::NextCode,
                };
                Step::Continue
            }
            Ok(_) => {
                self.state = State::Scan { zeros: 0 };
                Step::Continue
            }
            Err(_) => {
                self.state = State::SeqNonIntra;
                Step::Incomplete {
                    resume_bits: reader.bits_consumed(),
                }
            }
        }
    }

    fn step_stuffing(&mut self, reader: &mut BitReader<'_>) -> Step {
        loop {
            match reader.read_bits(1) {
                Ok(1) => {
                    if reader.bits_remaining() < 8 {
                        // resume from the start of this stuffing group
                        reader.rewind_bits(1).unwrap();
                        self.state = State::Stuffing;
                        return Step::Incomplete {
                            resume_bits: reader.bits_consumed(),
                        };
                    }
                    reader.skip_bits(8).unwrap();
                }
                Ok(_) => {
                    self.state = State::Scan { zeros: 0 };
                    return Step::Continue;
                }
                Err(_) => {
                    self.state = State::Stuffing;
                    return Step::Incomplete {
                        resume_bits: reader.bits_consumed(),
                    };
                }
            }
        }
    }
}

impl Default for PesScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PES header for stream `id` with the given scramble bits and
    /// header-data bytes.
    fn pes_header(id: u8, scramble: u8, header_data: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, id];
        out.extend_from_slice(&[0x00, 0x00]); // packet length, unused here
        out.push(0x80 | (scramble << 4)); // '10' marker + scramble control
        out.push(0x00);
        out.push(header_data.len() as u8);
        out.extend_from_slice(header_data);
        out
    }

    /// Sequence header with both quantiser-matrix flags clear.
    fn sequence_header() -> Vec<u8> {
        vec![
            0x00, 0x00, 0x01, 0xB3, //
            0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0,
        ]
    }

    #[test]
    fn test_pes_header_then_slice() {
        let mut payload = pes_header(0xE0, 0, &[0u8; 5]);
        payload.extend_from_slice(&sequence_header());
        let header_len = payload.len();
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]); // slice
        payload.extend_from_slice(&[0xAA; 16]);

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(&payload);
        assert!(scan.complete);
        assert!(!scan.scrambled);
        // the slice start code itself belongs to the encrypted payload
        assert_eq!(scan.len, header_len);
    }

    #[test]
    fn test_scrambled_pes_reports_zero_length() {
        let payload = pes_header(0xE0, 0x3, &[0u8; 4]);

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(&payload);
        assert!(scan.complete);
        assert!(scan.scrambled);
        assert_eq!(scan.len, 0);
    }

    #[test]
    fn test_audio_payload_stops_after_pes_header() {
        let mut payload = pes_header(0xC0, 0, &[0u8; 7]);
        let header_len = payload.len();
        payload.extend_from_slice(&[0xFF, 0xFB, 0x92, 0x64]); // audio frame sync

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(&payload);
        assert!(scan.complete);
        assert_eq!(scan.len, header_len);
    }

    #[test]
    fn test_unknown_extension_subtype_stops_at_prefix() {
        let mut payload = pes_header(0xE0, 0, &[]);
        let header_len = payload.len();
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0xB5]);
        payload.push(0x30); // subtype 3: picture spatial scalable extension
        payload.extend_from_slice(&[0x77; 8]);

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(&payload);
        assert!(scan.complete);
        // the whole extension start code belongs to the payload, with no
        // partial subtype bits rounded into the header
        assert_eq!(scan.len, header_len);
    }

    #[test]
    fn test_user_data_consumes_until_next_prefix() {
        let mut payload = pes_header(0xE0, 0, &[]);
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0xB2]); // user data
        payload.push(0x00);
        payload.extend_from_slice(b"arbitrary user bytes..");
        let header_len = payload.len();
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]); // slice
        payload.extend_from_slice(&[0xAA; 8]);

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(&payload);
        assert!(scan.complete);
        assert_eq!(scan.len, header_len);
    }

    #[test]
    fn test_unknown_code_rewinds_to_prefix() {
        let mut payload = pes_header(0xE0, 0, &[]);
        let header_len = payload.len();
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0xB4]); // unknown
        payload.extend_from_slice(&[0x55; 8]);

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(&payload);
        assert!(scan.complete);
        assert_eq!(scan.len, header_len);
    }

    #[test]
    fn test_header_straddles_two_buffers() {
        let mut payload = pes_header(0xE0, 0, &[0u8; 10]);
        let header_len = payload.len();
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]);
        payload.extend_from_slice(&[0xAA; 8]);

        // split inside the PES header-data region
        let split = 9;
        let (first, second) = payload.split_at(split);

        let mut scanner = PesScanner::new();
        scanner.reset();

        let scan = scanner.scan(first);
        assert!(!scan.complete);
        assert_eq!(scan.len, first.len());
        assert!(scanner.in_progress());

        let scan = scanner.scan(second);
        assert!(scan.complete);
        assert_eq!(scan.len, header_len - split);
        assert!(!scanner.in_progress());
    }

    #[test]
    fn test_straddle_inside_start_code_prefix() {
        let mut payload = pes_header(0xE0, 0, &[]);
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]);
        let header_len = pes_header(0xE0, 0, &[]).len();

        // split between the prefix zeros of the slice code
        let split = header_len + 2;
        let (first, second) = payload.split_at(split);

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(first);
        assert!(!scan.complete);

        let scan = scanner.scan(second);
        assert!(scan.complete);
        // the slice prefix started in the previous buffer; nothing of this
        // buffer is header
        assert_eq!(scan.len, 0);
    }

    #[test]
    fn test_picture_header_with_stuffing() {
        let mut payload = pes_header(0xE0, 0, &[]);
        // picture header: temporal ref (10 bits), type 1, vbv delay (16),
        // then one stuffing group and the terminating zero bit
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        // 29 fixed bits: 0000000000 001 0000000000000000, then stuffing
        // '1 00000000', terminator '0', padding to the byte boundary
        payload.extend_from_slice(&[0b0000_0000, 0b0000_1000, 0b0000_0000, 0b0000_0100,
            0b0000_0000]);
        let header_len = payload.len();
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]);
        payload.extend_from_slice(&[0xAA; 4]);

        let mut scanner = PesScanner::new();
        scanner.reset();
        let scan = scanner.scan(&payload);
        assert!(scan.complete);
        assert_eq!(scan.len, header_len);
    }

    #[test]
    fn test_scan_before_reset_reports_no_header() {
        let mut scanner = PesScanner::new();
        let scan = scanner.scan(&[0xAA; 32]);
        assert!(scan.complete);
        assert_eq!(scan.len, 0);
    }
}
