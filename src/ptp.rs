//! IEEE 1588-2019 value types and wire codec.
//!
//! Covers the three message types a grandmaster emits (Announce, Sync,
//! Follow_Up) plus the common header. All multi-byte fields are big-endian.
//! Layouts are bit-exact against the standard; offsets below are relative to
//! the start of the PTP payload (after UDP).

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;
pub const PTP_MULTICAST_ADDR: &str = "224.0.1.129";

pub const HEADER_SIZE: usize = 34;
pub const SYNC_SIZE: usize = 44;
pub const FOLLOW_UP_SIZE: usize = 44;
pub const ANNOUNCE_SIZE: usize = 64;

const VERSION_PTP: u8 = 2;

// flagField bits (read as a big-endian u16)
pub const FLAG_TWO_STEP: u16 = 0x0200;
pub const FLAG_UTC_OFFSET_VALID: u16 = 0x0004;
pub const FLAG_PTP_TIMESCALE: u16 = 0x0008;
pub const FLAG_TIME_TRACEABLE: u16 = 0x0010;
pub const FLAG_FREQ_TRACEABLE: u16 = 0x0020;

/// timeSource enumeration (IEEE 1588-2019 Table 6)
pub const TIME_SOURCE_GPS: u8 = 0x20;
pub const TIME_SOURCE_INTERNAL_OSCILLATOR: u8 = 0xA0;

const NS_PER_SEC: i64 = 1_000_000_000;

// ============================================================================
// TIMESTAMP
// ============================================================================

/// PTP timestamp: 48-bit seconds + 32-bit nanoseconds on the wire.
///
/// Invariant: `nanoseconds < 10^9`. Arithmetic goes through a signed 64-bit
/// nanosecond count, which covers ±292 years and is plenty for offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub const WIRE_SIZE: usize = 10;

    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        debug_assert!(nanoseconds < NS_PER_SEC as u32);
        Timestamp {
            seconds,
            nanoseconds,
        }
    }

    pub fn from_nanos(ns: i64) -> Self {
        debug_assert!(ns >= 0, "negative time has no wire representation");
        Timestamp {
            seconds: (ns / NS_PER_SEC) as u64,
            nanoseconds: (ns % NS_PER_SEC) as u32,
        }
    }

    pub fn to_nanos(&self) -> i64 {
        self.seconds as i64 * NS_PER_SEC + self.nanoseconds as i64
    }

    pub fn total_seconds(&self) -> u64 {
        self.seconds
    }

    /// Add a signed nanosecond delta with carry propagation.
    pub fn add_nanos(&self, delta_ns: i64) -> Self {
        Timestamp::from_nanos(self.to_nanos() + delta_ns)
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[0..2], (self.seconds >> 32) as u16);
        BigEndian::write_u32(&mut buf[2..6], (self.seconds & 0xFFFF_FFFF) as u32);
        BigEndian::write_u32(&mut buf[6..10], self.nanoseconds);
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(anyhow!("timestamp truncated"));
        }
        let hi = BigEndian::read_u16(&buf[0..2]) as u64;
        let lo = BigEndian::read_u32(&buf[2..6]) as u64;
        let ns = BigEndian::read_u32(&buf[6..10]);
        if ns >= NS_PER_SEC as u32 {
            return Err(anyhow!("timestamp nanoseconds field out of range: {}", ns));
        }
        Ok(Timestamp {
            seconds: (hi << 32) | lo,
            nanoseconds: ns,
        })
    }
}

// ============================================================================
// IDENTITIES AND QUALITY
// ============================================================================

/// 8-byte EUI-64 clock identity, derived once from the primary interface MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// EUI-48 to EUI-64 expansion: insert FF:FE between the OUI and the
    /// device bits.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([
            mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5],
        ])
    }
}

impl std::fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl PortIdentity {
    pub const WIRE_SIZE: usize = 10;

    pub fn serialize(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.clock_identity.0);
        BigEndian::write_u16(&mut buf[8..10], self.port_number);
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(anyhow!("port identity truncated"));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        Ok(PortIdentity {
            clock_identity: ClockIdentity(id),
            port_number: BigEndian::read_u16(&buf[8..10]),
        })
    }
}

/// grandmasterClockQuality, interpreted per IEEE 1588-2019 Tables 5-6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

impl ClockQuality {
    pub const WIRE_SIZE: usize = 4;

    pub fn serialize(&self, buf: &mut [u8]) {
        buf[0] = self.clock_class;
        buf[1] = self.clock_accuracy;
        BigEndian::write_u16(&mut buf[2..4], self.offset_scaled_log_variance);
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(anyhow!("clock quality truncated"));
        }
        Ok(ClockQuality {
            clock_class: buf[0],
            clock_accuracy: buf[1],
            offset_scaled_log_variance: BigEndian::read_u16(&buf[2..4]),
        })
    }
}

impl Default for ClockQuality {
    /// The "never locked" quality: class 248, accuracy unknown.
    fn default() -> Self {
        ClockQuality {
            clock_class: 248,
            clock_accuracy: 0xFE,
            offset_scaled_log_variance: 0xFFFF,
        }
    }
}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync,
    FollowUp,
    Announce,
}

impl MessageType {
    fn nibble(&self) -> u8 {
        match self {
            MessageType::Sync => 0x0,
            MessageType::FollowUp => 0x8,
            MessageType::Announce => 0xB,
        }
    }

    fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0x0 => Some(MessageType::Sync),
            0x8 => Some(MessageType::FollowUp),
            0xB => Some(MessageType::Announce),
            _ => None,
        }
    }

    /// controlField kept for v1 hardware compatibility.
    fn control_field(&self) -> u8 {
        match self {
            MessageType::Sync => 0x00,
            MessageType::FollowUp => 0x02,
            MessageType::Announce => 0x05,
        }
    }
}

/// 34-byte common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub message_length: u16,
    pub domain_number: u8,
    pub flag_field: u16,
    pub correction_field: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub log_message_interval: i8,
}

impl Header {
    pub fn serialize(&self, buf: &mut [u8]) {
        buf[0..HEADER_SIZE].fill(0);
        buf[0] = self.message_type.nibble();
        buf[1] = VERSION_PTP;
        BigEndian::write_u16(&mut buf[2..4], self.message_length);
        buf[4] = self.domain_number;
        BigEndian::write_u16(&mut buf[6..8], self.flag_field);
        BigEndian::write_i64(&mut buf[8..16], self.correction_field);
        self.source_port_identity.serialize(&mut buf[20..30]);
        BigEndian::write_u16(&mut buf[30..32], self.sequence_id);
        buf[32] = self.message_type.control_field();
        buf[33] = self.log_message_interval as u8;
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(anyhow!("header truncated: {} bytes", buf.len()));
        }
        let version = buf[1] & 0x0F;
        if version != VERSION_PTP {
            return Err(anyhow!("unsupported PTP version {}", version));
        }
        let message_type = MessageType::from_nibble(buf[0] & 0x0F)
            .ok_or_else(|| anyhow!("unhandled message type 0x{:x}", buf[0] & 0x0F))?;
        let message_length = BigEndian::read_u16(&buf[2..4]);
        if (message_length as usize) > buf.len() {
            return Err(anyhow!(
                "messageLength {} exceeds datagram of {} bytes",
                message_length,
                buf.len()
            ));
        }
        Ok(Header {
            message_type,
            message_length,
            domain_number: buf[4],
            flag_field: BigEndian::read_u16(&buf[6..8]),
            correction_field: BigEndian::read_i64(&buf[8..16]),
            source_port_identity: PortIdentity::parse(&buf[20..30])?,
            sequence_id: BigEndian::read_u16(&buf[30..32]),
            log_message_interval: buf[33] as i8,
        })
    }
}

/// Announce body: 30 bytes after the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceBody {
    pub origin_timestamp: Timestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

impl AnnounceBody {
    pub fn serialize(&self, buf: &mut [u8]) {
        buf[0..30].fill(0);
        self.origin_timestamp.serialize(&mut buf[0..10]);
        BigEndian::write_i16(&mut buf[10..12], self.current_utc_offset);
        buf[13] = self.grandmaster_priority1;
        self.grandmaster_clock_quality.serialize(&mut buf[14..18]);
        buf[18] = self.grandmaster_priority2;
        buf[19..27].copy_from_slice(&self.grandmaster_identity.0);
        BigEndian::write_u16(&mut buf[27..29], self.steps_removed);
        buf[29] = self.time_source;
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 30 {
            return Err(anyhow!("announce body truncated"));
        }
        let mut gm = [0u8; 8];
        gm.copy_from_slice(&buf[19..27]);
        Ok(AnnounceBody {
            origin_timestamp: Timestamp::parse(&buf[0..10])?,
            current_utc_offset: BigEndian::read_i16(&buf[10..12]),
            grandmaster_priority1: buf[13],
            grandmaster_clock_quality: ClockQuality::parse(&buf[14..18])?,
            grandmaster_priority2: buf[18],
            grandmaster_identity: ClockIdentity(gm),
            steps_removed: BigEndian::read_u16(&buf[27..29]),
            time_source: buf[29],
        })
    }
}

/// Sync and Follow_Up share a body: one originTimestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBody {
    pub origin_timestamp: Timestamp,
}

impl SyncBody {
    pub fn serialize(&self, buf: &mut [u8]) {
        self.origin_timestamp.serialize(&mut buf[0..10]);
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        Ok(SyncBody {
            origin_timestamp: Timestamp::parse(buf)?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
