//! HAL contracts consumed by the core.
//!
//! Each trait is provided by the platform (see `hal/`) and mocked in tests.
//! The core never talks to a device directly.

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;

use crate::ptp::Timestamp;

/// One observed PPS edge, produced by the edge thread.
///
/// `jitter_ns` is the measured latency from the reported edge time to the
/// moment the PHC was read. The UTC second label is NOT part of the edge;
/// the ReferenceBinder derives it from `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsEdge {
    pub seq: u32,
    pub t_mono_ns: i64,
    pub t_phc_ns: i64,
    pub jitter_ns: i64,
}

/// A parsed time-of-day report from the GNSS serial stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TodReading {
    pub utc_sec: u64,
    pub fix_quality: u8,
    pub sat_count: u8,
    pub arrival_mono_ns: i64,
}

/// A received PTP datagram with its kernel receive timestamp.
#[derive(Debug, Clone)]
pub struct RecvPacket {
    pub data: Vec<u8>,
    pub src: SocketAddr,
    pub rx_ts_ns: i64,
}

#[cfg_attr(test, mockall::automock)]
pub trait PpsSource {
    /// Block until the next PPS edge or the timeout expires.
    /// `Ok(None)` means timeout; `seq` is monotonic across edges.
    fn wait_edge(&mut self, timeout: Duration) -> Result<Option<PpsEdge>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait TodSource {
    /// Non-blocking poll for the latest parsed ToD report.
    fn try_read(&mut self) -> Result<Option<TodReading>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait Phc {
    fn read(&self) -> Result<i64>;
    fn adjust_frequency(&mut self, ppb: i32) -> Result<()>;
    fn step(&mut self, target: Timestamp) -> Result<()>;
    fn max_freq_ppb(&self) -> i32;
}

#[cfg_attr(test, mockall::automock)]
pub trait Rtc {
    fn read(&mut self) -> Result<Timestamp>;
    fn write(&mut self, t: Timestamp) -> Result<()>;
    fn read_aging(&mut self) -> Result<i8>;
    fn write_aging(&mut self, value: i8) -> Result<()>;
    fn read_temperature(&mut self) -> Option<f32>;
}

#[cfg_attr(test, mockall::automock)]
pub trait PtpNet {
    fn send_event(&mut self, buf: &[u8]) -> Result<()>;
    fn send_general(&mut self, buf: &[u8]) -> Result<()>;
    /// Non-blocking receive across both PTP sockets.
    fn recv(&mut self) -> Result<Option<RecvPacket>>;
    /// Hardware/driver transmit timestamp for an event packet previously
    /// sent with `sequence_id == seq`, if the stack captured one.
    fn tx_timestamp(&mut self, seq: u16) -> Result<Option<i64>>;
}
