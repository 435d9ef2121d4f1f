use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};

use gpsgm::config::{ServoKind, SystemConfig};
use gpsgm::controller::Grandmaster;
use gpsgm::hal::{
    interface_ipv4_and_mac, monotonic_ns, LinuxPhc, LinuxPps, LinuxRtc, SerialTod, UdpPtpNet,
};
use gpsgm::ptp::ClockIdentity;
use gpsgm::status::GrandmasterStatus;
use gpsgm::traits::PpsSource;

const CONFIG_PATH: &str = "/etc/gpsgm/config.json";
const LOCK_PATH: &str = "/var/run/gpsgm.lock";

// Exit codes per the operational contract.
const EXIT_CONFIG: i32 = 1;
const EXIT_HAL: i32 = 2;
const EXIT_NO_REFERENCE: i32 = 3;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "GPS-disciplined PTP grandmaster", long_about = None)]
struct Args {
    /// Network interface for PTP (default: first usable)
    #[arg(short, long)]
    interface: Option<String>,

    /// PTP hardware clock device (default: CLOCK_REALTIME)
    #[arg(long)]
    phc: Option<String>,

    /// GNSS serial device carrying the NMEA stream
    #[arg(long, default_value = "/dev/ttyS0")]
    gps: String,

    /// PPS device
    #[arg(long, default_value = "/dev/pps0")]
    pps: String,

    /// RTC device for holdover and aging discipline
    #[arg(long)]
    rtc: Option<String>,

    #[arg(long)]
    domain: Option<u8>,

    #[arg(long)]
    priority1: Option<u8>,

    #[arg(long)]
    priority2: Option<u8>,

    /// Servo variant: pi | three-phase
    #[arg(long)]
    servo: Option<String>,

    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Config file override
    #[arg(long)]
    config: Option<PathBuf>,

    /// Holdover anchor file written at shutdown
    #[arg(long, default_value = "/var/lib/gpsgm/anchor.json")]
    anchor_file: PathBuf,
}

/// Optional persisted state: not required for correctness, only to shorten
/// cold-start recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HoldoverAnchor {
    last_phc_ns: i64,
    last_wall_ns: i64,
    last_freq_ppb: i32,
}

fn load_config(path: &Path) -> Result<SystemConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            serde_json::from_str(&content).map_err(|e| anyhow!("config {}: {}", path.display(), e))
        }
        Err(_) => {
            // First start: write the defaults so the operator has a template.
            let cfg = SystemConfig::default();
            if let Ok(json) = serde_json::to_string_pretty(&cfg) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                let _ = std::fs::write(path, json);
            }
            Ok(cfg)
        }
    }
}

fn apply_cli_overrides(cfg: &mut SystemConfig, args: &Args) -> Result<()> {
    if let Some(domain) = args.domain {
        cfg.ptp.domain = domain;
    }
    if let Some(p1) = args.priority1 {
        cfg.ptp.priority1 = p1;
    }
    if let Some(p2) = args.priority2 {
        cfg.ptp.priority2 = p2;
    }
    if let Some(servo) = args.servo.as_deref() {
        cfg.servo.kind = match servo {
            "pi" => ServoKind::Pi,
            "three-phase" => ServoKind::ThreePhase,
            other => return Err(anyhow!("unknown servo variant '{}'", other)),
        };
    }
    Ok(())
}

fn acquire_singleton_lock() -> Result<File> {
    let file = File::create(LOCK_PATH)
        .map_err(|e| anyhow!("failed to create lock file {}: {}", LOCK_PATH, e))?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(file),
        Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
            "another instance is already running (lockfile: {})",
            LOCK_PATH
        )),
        Err(e) => Err(e.into()),
    }
}

fn enable_realtime_priority() {
    unsafe {
        let param = libc::sched_param { sched_priority: 50 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
            info!("realtime priority (SCHED_FIFO, 50) enabled for edge thread");
        } else {
            warn!(
                "failed to set realtime priority: {}. Edge latency might suffer.",
                std::io::Error::last_os_error()
            );
        }
    }
}

fn load_anchor(path: &Path) -> Option<HoldoverAnchor> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn save_anchor(path: &Path, anchor: &HoldoverAnchor) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match serde_json::to_string_pretty(anchor) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("failed to write anchor file {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("failed to serialize anchor: {}", e),
    }
}

fn wall_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn run(args: Args, running: Arc<AtomicBool>) -> std::result::Result<(), i32> {
    let _ = sd_notify::notify(
        false,
        &[sd_notify::NotifyState::Status(
            format!("v{} | starting...", env!("CARGO_PKG_VERSION")).as_str(),
        )],
    );

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let mut config = load_config(&config_path).map_err(|e| {
        error!("{}", e);
        EXIT_CONFIG
    })?;
    apply_cli_overrides(&mut config, &args).map_err(|e| {
        error!("{}", e);
        EXIT_CONFIG
    })?;

    // --- HAL bring-up: any failure here names the device and exits 2.
    let (iface, iface_ip, mac) =
        interface_ipv4_and_mac(args.interface.as_deref()).map_err(|e| {
            error!("interface: {}", e);
            EXIT_HAL
        })?;
    let identity = ClockIdentity::from_mac(mac);
    info!("using interface {} ({}), identity {}", iface, iface_ip, identity);

    let phc = LinuxPhc::open(args.phc.as_deref()).map_err(|e| {
        error!("phc: {}", e);
        EXIT_HAL
    })?;
    let phc_clock_id = phc.clock_id();

    let mut pps = LinuxPps::open(&args.pps, phc_clock_id).map_err(|e| {
        error!("pps: {}", e);
        EXIT_HAL
    })?;

    let tod = SerialTod::open(&args.gps).map_err(|e| {
        error!("gps: {}", e);
        EXIT_HAL
    })?;

    let rtc = match args.rtc.as_deref() {
        Some(dev) => Some(LinuxRtc::open(dev).map_err(|e| {
            error!("rtc: {}", e);
            EXIT_HAL
        })?),
        None => None,
    };

    let net = UdpPtpNet::open(iface_ip).map_err(|e| {
        error!("network: {}", e);
        EXIT_HAL
    })?;

    let status_shared = Arc::new(RwLock::new(GrandmasterStatus::default()));
    let startup_grace = Duration::from_secs(config.edge.startup_grace_secs);
    let queue_depth = config.edge.queue_depth;

    let mut gm = Grandmaster::new(phc, tod, net, rtc, identity, status_shared, config);

    if let Some(anchor) = load_anchor(&args.anchor_file) {
        info!(
            "anchor file: restoring {:+}ppb from previous run",
            anchor.last_freq_ppb
        );
        if let Err(e) = gm.set_initial_frequency(anchor.last_freq_ppb) {
            warn!("failed to apply anchor frequency: {}", e);
        }
    }

    // --- Edge thread: blocks on the PPS device only, pushes raw edges into
    // a bounded queue. No allocation, no logging, no locks on this path.
    let (edge_tx, edge_rx) = mpsc::sync_channel(queue_depth);
    let edge_running = running.clone();
    let edge_errors = Arc::new(AtomicU64::new(0));
    let edge_errors_rt = edge_errors.clone();
    let edge_thread = thread::spawn(move || {
        enable_realtime_priority();
        while edge_running.load(Ordering::SeqCst) {
            match pps.wait_edge(Duration::from_secs(1)) {
                Ok(Some(edge)) => {
                    // A full queue means the worker stalled; dropping the
                    // edge is the only bounded option here.
                    let _ = edge_tx.try_send(edge);
                }
                Ok(None) => {}
                Err(_) => {
                    edge_errors_rt.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    });

    // --- Startup grace: a grandmaster with no PPS is not a grandmaster.
    let deadline = Instant::now() + startup_grace;
    let first_edge = loop {
        if !running.load(Ordering::SeqCst) {
            break None;
        }
        match edge_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(edge) => break Some(edge),
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() >= deadline {
                    error!(
                        "no PPS edge within {}s startup grace",
                        startup_grace.as_secs()
                    );
                    running.store(false, Ordering::SeqCst);
                    let _ = edge_thread.join();
                    return Err(EXIT_NO_REFERENCE);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break None,
        }
    };

    if let Some(edge) = first_edge {
        if let Err(e) = gm.process_edge(edge) {
            warn!("edge processing error: {}", e);
        }
    }

    let _ = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Ready,
            sd_notify::NotifyState::Status(
                format!("v{} | disciplining", env!("CARGO_PKG_VERSION")).as_str(),
            ),
        ],
    );

    // --- Worker loop.
    let mut last_notify = Instant::now();
    while running.load(Ordering::SeqCst) {
        match edge_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(edge) => {
                if let Err(e) = gm.process_edge(edge) {
                    warn!("edge processing error: {}", e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Err(e) = gm.on_tick(monotonic_ns()) {
            warn!("housekeeping error: {}", e);
        }

        if last_notify.elapsed() >= Duration::from_secs(10) {
            last_notify = Instant::now();
            let errors = edge_errors.load(Ordering::Relaxed);
            if errors > 0 {
                warn!("{} PPS fetch errors so far", errors);
            }
            let status = gm.status_shared();
            let status_line = status.read().ok().map(|s| {
                format!(
                    "v{} | {} | class {} | offset {:+} ns",
                    env!("CARGO_PKG_VERSION"),
                    s.state,
                    s.clock_class,
                    s.offset_ns
                )
            });
            if let Some(line) = status_line {
                let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Status(line.as_str())]);
            }
        }
    }

    info!("shutting down");
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);

    // Persist the holdover anchor for the next cold start.
    if let Ok(phc_ns) = gm.phc_now() {
        save_anchor(
            &args.anchor_file,
            &HoldoverAnchor {
                last_phc_ns: phc_ns,
                last_wall_ns: wall_ns(),
                last_freq_ppb: gm.applied_frequency_ppb(),
            },
        );
    }

    let _ = edge_thread.join();
    Ok(())
}

fn main() {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp_millis()
        .format_target(false)
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("gpsgm v{}", env!("CARGO_PKG_VERSION"));

    let _lock_file = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        error!("failed to install signal handler: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    match run(args, running) {
        Ok(()) => {}
        Err(code) => std::process::exit(code),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args::parse_from(["gpsgm"])
    }

    #[test]
    fn test_anchor_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchor.json");

        assert!(load_anchor(&path).is_none(), "missing file yields no anchor");

        let anchor = HoldoverAnchor {
            last_phc_ns: 1_700_000_000_000_000_000,
            last_wall_ns: 1_700_000_000_123_000_000,
            last_freq_ppb: -48_250,
        };
        save_anchor(&path, &anchor);

        let restored = load_anchor(&path).expect("anchor must load back");
        assert_eq!(restored.last_phc_ns, anchor.last_phc_ns);
        assert_eq!(restored.last_wall_ns, anchor.last_wall_ns);
        assert_eq!(restored.last_freq_ppb, -48_250);
    }

    #[test]
    fn test_anchor_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/deep/anchor.json");
        save_anchor(
            &path,
            &HoldoverAnchor {
                last_phc_ns: 1,
                last_wall_ns: 2,
                last_freq_ppb: 3,
            },
        );
        assert!(load_anchor(&path).is_some());
    }

    #[test]
    fn test_corrupt_anchor_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchor.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_anchor(&path).is_none());
    }

    #[test]
    fn test_config_written_with_defaults_on_first_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.ptp.domain, 0);
        // The template landed on disk and parses back.
        let reread = load_config(&path).unwrap();
        assert_eq!(reread.observer.capacity, cfg.observer.capacity);
    }

    #[test]
    fn test_cli_overrides() {
        let mut cfg = SystemConfig::default();
        let mut a = args();
        a.domain = Some(44);
        a.priority1 = Some(10);
        a.servo = Some("three-phase".to_string());

        apply_cli_overrides(&mut cfg, &a).unwrap();
        assert_eq!(cfg.ptp.domain, 44);
        assert_eq!(cfg.ptp.priority1, 10);
        assert_eq!(cfg.servo.kind, ServoKind::ThreePhase);

        a.servo = Some("bogus".to_string());
        assert!(apply_cli_overrides(&mut cfg, &a).is_err());
    }
}
