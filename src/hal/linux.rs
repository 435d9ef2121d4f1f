//! Linux implementations of the HAL contracts.
//!
//! PHC access goes through `clock_adjtime` on the dynamic posix clock of the
//! opened `/dev/ptpN` (or CLOCK_REALTIME when no PHC device is given), PPS
//! through the kernel PPS API, the RTC through `/dev/rtcN` plus its sysfs
//! attributes, and PTP networking through two multicast UDP sockets with
//! kernel receive timestamping.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use log::{debug, info, warn};
use nix::ioctl_read;
use nix::ioctl_readwrite;
use nix::ioctl_write_ptr;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrStorage};
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, IoSliceMut, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use crate::ptp::{Timestamp, PTP_EVENT_PORT, PTP_GENERAL_PORT, PTP_MULTICAST_ADDR};
use crate::traits::{Phc, PpsEdge, PpsSource, PtpNet, RecvPacket, Rtc, TodReading, TodSource};

const NS_PER_SEC: i64 = 1_000_000_000;

fn clock_ns(clock_id: libc::clockid_t) -> Result<i64> {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } < 0 {
        return Err(anyhow!(
            "clock_gettime({}) failed: {}",
            clock_id,
            std::io::Error::last_os_error()
        ));
    }
    Ok(ts.tv_sec as i64 * NS_PER_SEC + ts.tv_nsec as i64)
}

pub fn monotonic_ns() -> i64 {
    clock_ns(libc::CLOCK_MONOTONIC).unwrap_or(0)
}

// ============================================================================
// PHC
// ============================================================================

pub struct LinuxPhc {
    _device: Option<File>,
    clock_id: libc::clockid_t,
    original_freq: i64,
    max_ppb: i32,
}

impl LinuxPhc {
    /// Open a PTP hardware clock, or fall back to CLOCK_REALTIME when the
    /// platform has none.
    pub fn open(device: Option<&str>) -> Result<Self> {
        let (file, clock_id) = match device {
            Some(path) => {
                let f = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| anyhow!("cannot open PHC {}: {}", path, e))?;
                // Dynamic posix clock id from the fd.
                let fd = f.as_raw_fd() as libc::clockid_t;
                let id = (!fd << 3) | 3;
                (Some(f), id)
            }
            None => (None, libc::CLOCK_REALTIME),
        };

        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::clock_adjtime(clock_id, &mut tx) };
        if ret < 0 {
            return Err(anyhow!(
                "clock_adjtime query failed (are you root?): {}",
                std::io::Error::last_os_error()
            ));
        }

        info!(
            "PHC {} initialized (freq {:+})",
            device.unwrap_or("CLOCK_REALTIME"),
            tx.freq
        );
        Ok(LinuxPhc {
            _device: file,
            clock_id,
            original_freq: tx.freq,
            max_ppb: 500_000,
        })
    }

    pub fn clock_id(&self) -> libc::clockid_t {
        self.clock_id
    }

    fn set_kernel_freq(&self, freq: i64) -> Result<()> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY;
        tx.freq = freq;
        if unsafe { libc::clock_adjtime(self.clock_id, &mut tx) } < 0 {
            return Err(anyhow!(
                "clock_adjtime(ADJ_FREQUENCY) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }
}

impl Phc for LinuxPhc {
    fn read(&self) -> Result<i64> {
        clock_ns(self.clock_id)
    }

    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> {
        // Kernel scaled-ppm: ppm in 16-bit fixed point.
        let freq = (ppb as f64 / 1000.0 * 65536.0) as i64;
        self.set_kernel_freq(freq)
    }

    fn step(&mut self, target: Timestamp) -> Result<()> {
        let delta = target.to_nanos() - self.read()?;
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_SETOFFSET | libc::ADJ_NANO;
        tx.time.tv_sec = delta.div_euclid(NS_PER_SEC);
        // With ADJ_NANO the tv_usec field carries nanoseconds.
        tx.time.tv_usec = delta.rem_euclid(NS_PER_SEC);
        if unsafe { libc::clock_adjtime(self.clock_id, &mut tx) } < 0 {
            return Err(anyhow!(
                "clock_adjtime(ADJ_SETOFFSET) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    fn max_freq_ppb(&self) -> i32 {
        self.max_ppb
    }
}

impl Drop for LinuxPhc {
    fn drop(&mut self) {
        let _ = self.set_kernel_freq(self.original_freq);
    }
}

// ============================================================================
// PPS
// ============================================================================

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsKtime {
    pub sec: i64,
    pub nsec: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsKinfo {
    pub assert_sequence: u32,
    pub clear_sequence: u32,
    pub assert_tu: PpsKtime,
    pub clear_tu: PpsKtime,
    pub current_mode: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsFdata {
    pub info: PpsKinfo,
    pub timeout: PpsKtime,
}

const PPS_MAGIC: u8 = b'p';
ioctl_readwrite!(pps_fetch, PPS_MAGIC, 0xa4, PpsFdata);

pub struct LinuxPps {
    file: File,
    phc_clock_id: libc::clockid_t,
    last_seq: Option<u32>,
    seq: u32,
}

impl LinuxPps {
    pub fn open(device: &str, phc_clock_id: libc::clockid_t) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(device)
            .map_err(|e| anyhow!("cannot open PPS {}: {}", device, e))?;
        info!("PPS source {} opened", device);
        Ok(LinuxPps {
            file,
            phc_clock_id,
            last_seq: None,
            seq: 0,
        })
    }
}

impl PpsSource for LinuxPps {
    fn wait_edge(&mut self, timeout: Duration) -> Result<Option<PpsEdge>> {
        let mut data = PpsFdata::default();
        data.timeout.sec = timeout.as_secs() as i64;
        data.timeout.nsec = timeout.subsec_nanos() as i32;

        match unsafe { pps_fetch(self.file.as_raw_fd(), &mut data) } {
            Ok(_) => {}
            Err(nix::errno::Errno::ETIMEDOUT) => return Ok(None),
            Err(e) => return Err(anyhow!("PPS_FETCH failed: {}", e)),
        }

        let kernel_seq = data.info.assert_sequence;
        if self.last_seq == Some(kernel_seq) {
            return Ok(None); // no new edge inside the timeout
        }
        self.last_seq = Some(kernel_seq);
        self.seq = self.seq.wrapping_add(1);

        // Capture order matters: PHC first, it is the value being
        // disciplined; the wall clock only bounds the capture latency.
        let t_phc_ns = clock_ns(self.phc_clock_id)?;
        let t_mono_ns = clock_ns(libc::CLOCK_MONOTONIC)?;
        let wall_ns = clock_ns(libc::CLOCK_REALTIME)?;
        let assert_ns = data.info.assert_tu.sec * NS_PER_SEC + data.info.assert_tu.nsec as i64;

        Ok(Some(PpsEdge {
            seq: self.seq,
            t_mono_ns,
            t_phc_ns,
            jitter_ns: (wall_ns - assert_ns).abs(),
        }))
    }
}

// ============================================================================
// TOD (GNSS serial adapter)
// ============================================================================

/// Thin adapter from an NMEA serial stream to integer-second ToD readings.
/// Only the fields the binder needs are extracted: UTC second (RMC), fix
/// quality and satellite count (GGA).
pub struct SerialTod {
    file: File,
    buf: Vec<u8>,
    fix_quality: u8,
    sat_count: u8,
}

impl SerialTod {
    pub fn open(device: &str) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(device)
            .map_err(|e| anyhow!("cannot open GNSS serial {}: {}", device, e))?;
        info!("GNSS serial {} opened", device);
        Ok(SerialTod {
            file,
            buf: Vec::with_capacity(512),
            fix_quality: 0,
            sat_count: 0,
        })
    }
}

fn nmea_checksum_ok(line: &str) -> bool {
    let Some(rest) = line.strip_prefix('$') else {
        return false;
    };
    let Some((payload, sum)) = rest.rsplit_once('*') else {
        return false;
    };
    let Ok(expected) = u8::from_str_radix(sum.trim(), 16) else {
        return false;
    };
    payload.bytes().fold(0u8, |acc, b| acc ^ b) == expected
}

/// hhmmss(.sss) + ddmmyy to a unix second.
fn rmc_to_unix(time_field: &str, date_field: &str) -> Option<u64> {
    if time_field.len() < 6 || date_field.len() != 6 {
        return None;
    }
    let h: u32 = time_field[0..2].parse().ok()?;
    let m: u32 = time_field[2..4].parse().ok()?;
    let s: u32 = time_field[4..6].parse().ok()?;
    let day: u32 = date_field[0..2].parse().ok()?;
    let mon: u32 = date_field[2..4].parse().ok()?;
    let year: i32 = date_field[4..6].parse::<i32>().ok()? + 2000;
    let date = NaiveDate::from_ymd_opt(year, mon, day)?;
    let dt = date.and_hms_opt(h, m, s)?;
    Some(dt.and_utc().timestamp() as u64)
}

impl TodSource for SerialTod {
    fn try_read(&mut self) -> Result<Option<TodReading>> {
        let mut chunk = [0u8; 256];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(anyhow!("GNSS serial read failed: {}", e)),
            }
        }

        let mut reading = None;
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let Ok(line) = std::str::from_utf8(&line) else {
                continue;
            };
            let line = line.trim();
            if !nmea_checksum_ok(line) {
                continue;
            }
            let body = &line[1..line.rfind('*').unwrap_or(line.len())];
            let fields: Vec<&str> = body.split(',').collect();
            match fields.first() {
                Some(tag) if tag.ends_with("GGA") && fields.len() > 7 => {
                    self.fix_quality = fields[6].parse().unwrap_or(0);
                    self.sat_count = fields[7].parse().unwrap_or(0);
                }
                Some(tag) if tag.ends_with("RMC") && fields.len() > 9 => {
                    if fields[2] != "A" {
                        self.fix_quality = 0;
                        continue;
                    }
                    if let Some(utc_sec) = rmc_to_unix(fields[1], fields[9]) {
                        reading = Some(TodReading {
                            utc_sec,
                            fix_quality: self.fix_quality.max(1),
                            sat_count: self.sat_count,
                            arrival_mono_ns: monotonic_ns(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(reading)
    }
}

// ============================================================================
// RTC
// ============================================================================

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTime {
    pub tm_sec: i32,
    pub tm_min: i32,
    pub tm_hour: i32,
    pub tm_mday: i32,
    pub tm_mon: i32,
    pub tm_year: i32,
    pub tm_wday: i32,
    pub tm_yday: i32,
    pub tm_isdst: i32,
}

const RTC_MAGIC: u8 = b'p';
ioctl_read!(rtc_rd_time, RTC_MAGIC, 0x09, RtcTime);
ioctl_write_ptr!(rtc_set_time, RTC_MAGIC, 0x0a, RtcTime);

// The sysfs `offset` attribute is in ppb; the aging register moves the
// oscillator 0.1 ppm per LSB.
const PPB_PER_AGING_LSB: i64 = 100;

pub struct LinuxRtc {
    file: File,
    sysfs: PathBuf,
}

impl LinuxRtc {
    pub fn open(device: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| anyhow!("cannot open RTC {}: {}", device, e))?;
        let name = device.rsplit('/').next().unwrap_or("rtc0");
        Ok(LinuxRtc {
            file,
            sysfs: PathBuf::from(format!("/sys/class/rtc/{}", name)),
        })
    }
}

impl Rtc for LinuxRtc {
    fn read(&mut self) -> Result<Timestamp> {
        let mut t = RtcTime::default();
        unsafe { rtc_rd_time(self.file.as_raw_fd(), &mut t) }
            .map_err(|e| anyhow!("RTC_RD_TIME failed: {}", e))?;
        let date = NaiveDate::from_ymd_opt(t.tm_year + 1900, t.tm_mon as u32 + 1, t.tm_mday as u32)
            .ok_or_else(|| anyhow!("RTC returned invalid date"))?;
        let dt = date
            .and_hms_opt(t.tm_hour as u32, t.tm_min as u32, t.tm_sec as u32)
            .ok_or_else(|| anyhow!("RTC returned invalid time"))?;
        Ok(Timestamp::new(dt.and_utc().timestamp() as u64, 0))
    }

    fn write(&mut self, ts: Timestamp) -> Result<()> {
        let dt: DateTime<Utc> = DateTime::from_timestamp(ts.seconds as i64, 0)
            .ok_or_else(|| anyhow!("timestamp out of RTC range"))?;
        let val = RtcTime {
            tm_sec: dt.second() as i32,
            tm_min: dt.minute() as i32,
            tm_hour: dt.hour() as i32,
            tm_mday: dt.day() as i32,
            tm_mon: dt.month0() as i32,
            tm_year: dt.year() - 1900,
            tm_wday: 0,
            tm_yday: 0,
            tm_isdst: 0,
        };
        unsafe { rtc_set_time(self.file.as_raw_fd(), &val) }
            .map_err(|e| anyhow!("RTC_SET_TIME failed: {}", e))?;
        Ok(())
    }

    fn read_aging(&mut self) -> Result<i8> {
        let raw = std::fs::read_to_string(self.sysfs.join("offset"))
            .map_err(|e| anyhow!("RTC offset attribute unreadable: {}", e))?;
        let ppb: i64 = raw.trim().parse()?;
        Ok((ppb / PPB_PER_AGING_LSB).clamp(i8::MIN as i64, i8::MAX as i64) as i8)
    }

    fn write_aging(&mut self, value: i8) -> Result<()> {
        std::fs::write(
            self.sysfs.join("offset"),
            format!("{}\n", value as i64 * PPB_PER_AGING_LSB),
        )
        .map_err(|e| anyhow!("RTC offset attribute unwritable: {}", e))
    }

    fn read_temperature(&mut self) -> Option<f32> {
        let hwmon = std::fs::read_dir(self.sysfs.join("device/hwmon")).ok()?;
        for entry in hwmon.flatten() {
            let path = entry.path().join("temp1_input");
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(milli) = raw.trim().parse::<i32>() {
                    return Some(milli as f32 / 1000.0);
                }
            }
        }
        None
    }
}

// ============================================================================
// NETWORK
// ============================================================================

fn create_multicast_socket(port: u16, interface_ip: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;

    let multi_addr: Ipv4Addr = PTP_MULTICAST_ADDR.parse()?;
    socket.join_multicast_v4(&multi_addr, &interface_ip)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_multicast_if_v4(&interface_ip)?;
    socket.set_nonblocking(true)?;

    let udp_socket: UdpSocket = socket.into();

    // Kernel receive timestamping (SO_TIMESTAMPNS).
    match setsockopt(&udp_socket, sockopt::ReceiveTimestampns, &true) {
        Ok(_) => debug!("kernel timestamping enabled on port {}", port),
        Err(e) => warn!("failed to enable kernel timestamping: {}", e),
    }

    Ok(udp_socket)
}

fn recv_with_timestamp(sock: &UdpSocket) -> Result<Option<RecvPacket>> {
    let mut buf = [0u8; 2048];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg = nix::cmsg_space!(nix::sys::time::TimeSpec);

    let (len, src, rx_ts_ns) = {
        let msg = match recvmsg::<SockaddrStorage>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(m) => m,
            Err(nix::errno::Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(anyhow!("recvmsg failed: {}", e)),
        };

        let mut rx_ts_ns = clock_ns(libc::CLOCK_REALTIME)?;
        for c in msg.cmsgs() {
            if let ControlMessageOwned::ScmTimestampns(ts) = c {
                rx_ts_ns = ts.tv_sec() * NS_PER_SEC + ts.tv_nsec();
            }
        }

        let src: SocketAddr = msg
            .address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|sin| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(sin.ip()), sin.port())))
            .ok_or_else(|| anyhow!("packet without source address"))?;

        (msg.bytes, src, rx_ts_ns)
    };

    Ok(Some(RecvPacket {
        data: iov[0][..len].to_vec(),
        src,
        rx_ts_ns,
    }))
}

pub struct UdpPtpNet {
    event: UdpSocket,
    general: UdpSocket,
    event_dst: SocketAddrV4,
    general_dst: SocketAddrV4,
    last_event_tx_ns: Option<i64>,
}

impl UdpPtpNet {
    pub fn open(interface_ip: Ipv4Addr) -> Result<Self> {
        let event = create_multicast_socket(PTP_EVENT_PORT, interface_ip)?;
        let general = create_multicast_socket(PTP_GENERAL_PORT, interface_ip)?;
        let multi: Ipv4Addr = PTP_MULTICAST_ADDR.parse()?;
        info!("joined {} on {} (event/general)", multi, interface_ip);
        Ok(UdpPtpNet {
            event,
            general,
            event_dst: SocketAddrV4::new(multi, PTP_EVENT_PORT),
            general_dst: SocketAddrV4::new(multi, PTP_GENERAL_PORT),
            last_event_tx_ns: None,
        })
    }
}

impl PtpNet for UdpPtpNet {
    fn send_event(&mut self, buf: &[u8]) -> Result<()> {
        self.event.send_to(buf, self.event_dst)?;
        // Software transmit stamp, captured as close to the send as we can.
        self.last_event_tx_ns = Some(clock_ns(libc::CLOCK_REALTIME)?);
        Ok(())
    }

    fn send_general(&mut self, buf: &[u8]) -> Result<()> {
        self.general.send_to(buf, self.general_dst)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<RecvPacket>> {
        if let Some(pkt) = recv_with_timestamp(&self.event)? {
            return Ok(Some(pkt));
        }
        recv_with_timestamp(&self.general)
    }

    fn tx_timestamp(&mut self, _seq: u16) -> Result<Option<i64>> {
        Ok(self.last_event_tx_ns.take())
    }
}

// ============================================================================
// INTERFACE DISCOVERY
// ============================================================================

/// IPv4 address and MAC of the named interface, or of the first usable
/// interface when no name is given.
pub fn interface_ipv4_and_mac(name: Option<&str>) -> Result<(String, Ipv4Addr, [u8; 6])> {
    use nix::net::if_::InterfaceFlags;

    let addrs = nix::ifaddrs::getifaddrs()?;
    let mut ips: Vec<(String, Ipv4Addr)> = Vec::new();
    let mut macs: Vec<(String, [u8; 6])> = Vec::new();

    for ifa in addrs {
        if !ifa.flags.contains(InterfaceFlags::IFF_UP)
            || ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        if let Some(name_filter) = name {
            if ifa.interface_name != name_filter {
                continue;
            }
        }
        if let Some(addr) = ifa.address {
            if let Some(sin) = addr.as_sockaddr_in() {
                ips.push((ifa.interface_name.clone(), Ipv4Addr::from(sin.ip())));
            } else if let Some(link) = addr.as_link_addr() {
                if let Some(mac) = link.addr() {
                    macs.push((ifa.interface_name.clone(), mac));
                }
            }
        }
    }

    for (ifname, ip) in &ips {
        if let Some((_, mac)) = macs.iter().find(|(n, _)| n == ifname) {
            return Ok((ifname.clone(), *ip, *mac));
        }
    }
    Err(anyhow!(
        "no usable interface{}",
        name.map(|n| format!(" named {}", n)).unwrap_or_default()
    ))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ppb_to_kernel_freq_conversion() {
        fn to_freq(ppb: i32) -> i64 {
            (ppb as f64 / 1000.0 * 65536.0) as i64
        }
        assert_eq!(to_freq(0), 0);
        // 100 ppm = 100_000 ppb -> 6553600
        assert_eq!(to_freq(100_000), 6_553_600);
        assert_eq!(to_freq(-100_000), -6_553_600);
        // The PHC limit.
        assert_eq!(to_freq(500_000), 32_768_000);
    }

    #[test]
    fn test_step_delta_split() {
        // ADJ_SETOFFSET requires euclidean split so the nanosecond part is
        // never negative.
        let delta: i64 = -1_500_000_000;
        assert_eq!(delta.div_euclid(NS_PER_SEC), -2);
        assert_eq!(delta.rem_euclid(NS_PER_SEC), 500_000_000);

        let delta: i64 = 1_500_000_000;
        assert_eq!(delta.div_euclid(NS_PER_SEC), 1);
        assert_eq!(delta.rem_euclid(NS_PER_SEC), 500_000_000);
    }

    #[test]
    fn test_nmea_checksum() {
        assert!(nmea_checksum_ok(
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A"
        ));
        assert!(!nmea_checksum_ok(
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6B"
        ));
        assert!(!nmea_checksum_ok("GPRMC,missing,dollar*00"));
        assert!(!nmea_checksum_ok("$GPRMC,no,checksum"));
    }

    #[test]
    fn test_rmc_time_conversion() {
        // 1994-03-23 12:35:19 UTC
        let unix = rmc_to_unix("123519", "230394").unwrap();
        assert_eq!(unix, 764_426_119);

        // Fractional seconds are truncated to the labeled second.
        assert_eq!(rmc_to_unix("123519.00", "230394").unwrap(), unix);

        assert!(rmc_to_unix("1235", "230394").is_none());
        assert!(rmc_to_unix("123519", "2303").is_none());
        assert!(rmc_to_unix("123519", "320394").is_none(), "day 32 invalid");
    }
}
