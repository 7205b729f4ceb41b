use crate::error::Result;
use bytes::{BufMut, BytesMut};

// PIDs
/// PID for Program Association Table (PAT)
pub const PID_PAT: u16 = 0x0000;
/// PID for NULL (constant-bit-rate padding) packets
pub const PID_NULL: u16 = 0x1FFF;

// Table IDs
/// Table ID for Program Association Table (PAT)
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table ID for Program Map Table (PMT)
pub const TABLE_ID_PMT: u8 = 0x02;

// Elementary Stream Types
/// Stream type carrying the per-stream Turing keys
pub const STREAM_TYPE_PRIVATE_DATA: u8 = 0x97;

// Constants
/// Size of a Transport Stream packet in bytes
pub const TS_PACKET_SIZE: usize = 188;
/// Size of a Transport Stream header in bytes
pub const TS_HEADER_SIZE: usize = 4;
/// Number of possible PIDs (13-bit field)
pub const PID_COUNT: usize = 0x2000;

/// Magic leading a private-data key payload ("TiVo" in ASCII)
pub const TIVO_FILE_TYPE: u32 = 0x5469_566F;
/// Fixed validator word following the file type
pub const TIVO_VALIDATOR: u16 = 0x8103;

/// Output interval at which decryption resumes after sync loss and at
/// which compatibility-mode masking applies
pub const RESUME_INTERVAL: u64 = 0x10_0000;

/// Broad class of an elementary stream, as declared by the PMT.
///
/// The decoder only needs enough classification to find the private-data
/// stream and to know which PIDs carry decryptable payload; everything
/// else is passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Audio elementary stream
    Audio,
    /// Video elementary stream
    Video,
    /// Private data stream carrying Turing keys
    PrivateData,
    /// Recognised but uninteresting stream type
    Other,
    /// Stream type id 0 (reserved)
    None,
    /// PID seen in the stream but never declared by a PMT
    NotInPmt,
}

impl StreamType {
    /// Maps a PMT stream-type id onto the decoder's classification.
    pub fn from_type_id(id: u8) -> Self {
        match id {
            0x00 => StreamType::None,
            0x01 | 0x02 | 0x10 | 0x1B | 0x24 | 0x80 => StreamType::Video,
            0x03 | 0x04 | 0x0F | 0x11 | 0x81 | 0x8A => StreamType::Audio,
            STREAM_TYPE_PRIVATE_DATA => StreamType::PrivateData,
            _ => StreamType::Other,
        }
    }
}

/// Represents an entry in the Program Association Table (PAT)
#[derive(Debug, Clone)]
pub struct PatEntry {
    /// Program number (16-bit); 0 is reserved for the network PID
    pub program_number: u16,
    /// PID of the Program Map Table for this program (13-bit)
    pub program_map_pid: u16,
}

/// Program Association Table contents relevant to the decoder.
#[derive(Debug, Clone, Default)]
pub struct Pat {
    /// Program entries in section order
    pub entries: Vec<PatEntry>,
}

impl Pat {
    /// PID of the first real program's PMT, if any.
    pub fn program_map_pid(&self) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.program_number != 0)
            .map(|e| e.program_map_pid)
    }
}

/// One elementary stream declared by a PMT.
#[derive(Debug, Clone)]
pub struct PmtStream {
    /// Raw stream-type id from the section
    pub stream_type_id: u8,
    /// Elementary PID (13-bit)
    pub pid: u16,
}

/// Program Map Table contents relevant to the decoder.
#[derive(Debug, Clone, Default)]
pub struct Pmt {
    /// Table version, used only to notice updates
    pub version: u8,
    /// PID carrying the Program Clock Reference
    pub pcr_pid: u16,
    /// Declared elementary streams
    pub streams: Vec<PmtStream>,
}

/// One key entry from a private-data packet.
#[derive(Debug, Clone)]
pub struct TivoKeyEntry {
    /// Target PID
    pub packet_id: u16,
    /// Turing stream selector for that PID
    pub stream_id: u8,
    /// Per-stream key material
    pub key: [u8; 16],
}

/// Represents a Transport Stream (TS) packet header
///
/// The TS header is the fixed 4-byte prefix of each TS packet, providing
/// essential packet identification and control information.
#[derive(Debug)]
pub struct TsHeader {
    /// Sync byte (8-bit), always 0x47 to identify start of a TS packet
    pub sync_byte: u8,
    /// Transport error indicator (1-bit)
    pub transport_error: bool,
    /// Payload unit start indicator (1-bit)
    ///
    /// Set to 1 if a PES packet or PSI section starts at the beginning of
    /// the payload.
    pub payload_unit_start: bool,
    /// Transport priority (1-bit)
    pub transport_priority: bool,
    /// PID (13-bit)
    ///
    /// Packet Identifier, used to demultiplex packets of different
    /// elementary streams and PSI tables.
    pub pid: u16,
    /// Transport scrambling control (2-bit); nonzero means the payload is
    /// encrypted
    pub scrambling_control: u8,
    /// Adaptation field presence (1-bit)
    pub adaptation_field_exists: bool,
    /// Payload presence indicator (1-bit)
    pub contains_payload: bool,
    /// Continuity counter (4-bit)
    pub continuity_counter: u8,
}

impl Default for TsHeader {
    fn default() -> Self {
        Self {
            sync_byte: 0x47,
            transport_error: false,
            payload_unit_start: false,
            transport_priority: false,
            pid: 0,
            scrambling_control: 0,
            adaptation_field_exists: false,
            contains_payload: true,
            continuity_counter: 0,
        }
    }
}

impl TsHeader {
    /// Writes the TS header to a BytesMut buffer
    ///
    /// Packs the fields into the 4-byte header layout. Used by the test
    /// fixtures that assemble synthetic streams.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.sync_byte);
        buf.put_u8(
            (u8::from(self.transport_error) << 7)
                | (u8::from(self.payload_unit_start) << 6)
                | (u8::from(self.transport_priority) << 5)
                | ((self.pid >> 8) & 0x1F) as u8,
        );
        buf.put_u8((self.pid & 0xFF) as u8);
        buf.put_u8(
            (self.scrambling_control << 6)
                | (u8::from(self.adaptation_field_exists) << 5)
                | (u8::from(self.contains_payload) << 4)
                | (self.continuity_counter & 0x0F),
        );
        Ok(())
    }
}
