use super::types::StreamType;
use crate::format::pes::PesScanner;
use log::debug;

/// Per-PID decoder state.
///
/// Each elementary stream tracks its declared type, the 16-byte Turing key
/// delivered by the private-data stream, whether decryption is currently
/// paused, and the start-code scanner that measures unencrypted PES
/// headers across packet boundaries.
pub struct TransportStream {
    pid: u16,
    stream_type: StreamType,
    stream_id: u8,
    key: Option<[u8; 16]>,
    paused: bool,
    /// Header-region scanner; survives across packets so PES headers can
    /// straddle frame boundaries.
    pub scanner: PesScanner,
}

impl TransportStream {
    /// Creates the state for a PID with its PMT-declared type.
    pub fn new(pid: u16, stream_type: StreamType) -> Self {
        Self {
            pid,
            stream_type,
            stream_id: 0,
            key: None,
            paused: false,
            scanner: PesScanner::new(),
        }
    }

    /// The PID this state belongs to.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// The stream's declared type.
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Re-declares the stream type (PMT updates).
    pub fn set_stream_type(&mut self, stream_type: StreamType) {
        self.stream_type = stream_type;
    }

    /// Turing stream selector installed by the last key update.
    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    /// The current 16-byte key, if one has been delivered.
    pub fn key(&self) -> Option<&[u8; 16]> {
        self.key.as_ref()
    }

    /// Installs a fresh key from a private-data packet. A new key makes
    /// decryption safe again, so a paused stream resumes.
    pub fn install_key(&mut self, stream_id: u8, key: [u8; 16]) {
        if self.paused {
            debug!("pid {:#06x}: key update resumes decryption", self.pid);
        }
        self.stream_id = stream_id;
        self.key = Some(key);
        self.paused = false;
    }

    /// Suspends decryption until the next key update arrives.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Whether decryption is currently suspended.
    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_until_key_update() {
        let mut stream = TransportStream::new(0x100, StreamType::Video);
        assert_eq!(stream.pid(), 0x100);
        assert_eq!(stream.stream_type(), StreamType::Video);
        assert!(!stream.is_paused());
        assert!(stream.key().is_none());

        stream.pause();
        assert!(stream.is_paused());

        stream.install_key(0xE0, [0x55; 16]);
        assert!(!stream.is_paused());
        assert_eq!(stream.stream_id(), 0xE0);
        assert_eq!(stream.key(), Some(&[0x55; 16]));
    }
}
