//! Platform implementations of the HAL contracts.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::{interface_ipv4_and_mac, monotonic_ns, LinuxPhc, LinuxPps, LinuxRtc, SerialTod, UdpPtpNet};
