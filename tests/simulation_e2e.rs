use anyhow::Result;
use gpsgm::config::SystemConfig;
use gpsgm::controller::Grandmaster;
use gpsgm::ptp::{
    AnnounceBody, ClockIdentity, ClockQuality, Header, MessageType, PortIdentity, Timestamp,
    ANNOUNCE_SIZE, HEADER_SIZE, TIME_SOURCE_GPS,
};
use gpsgm::status::GrandmasterStatus;
use gpsgm::traits::{Phc, PpsEdge, PtpNet, RecvPacket, Rtc, TodReading, TodSource};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

// ============================================================================
// END-TO-END SCENARIOS
// ============================================================================
// The whole pipeline runs against a physics engine: a PHC with a natural
// frequency error, a PPS source ticking exact reference seconds, a serial
// ToD stream arriving a quarter second late, and an in-memory PTP network.
// Each test drives simulated seconds through the grandmaster exactly the way
// the worker loop does (edge at the top of the second, housekeeping tick
// half a second later) and asserts on externally observable state.
// ============================================================================

const NS: i64 = 1_000_000_000;
const UTC0: u64 = 1_700_000_000;

// --- Physics engine ---

struct World {
    /// Simulated monotonic time, visible to the ToD source.
    now_ns: i64,
    /// Reference time at the most recent PPS edge.
    ref_ns: i64,
    /// PHC error against the reference. Kept separate from the absolute
    /// count so f64 rounding at 1e18 ns cannot masquerade as phase noise.
    offset_ns: f64,
    natural_ppb: f64,
    applied_ppb: f64,
    /// Gaussian edge-capture noise (sigma, ns).
    jitter_sigma_ns: f64,

    pending_tod: VecDeque<TodReading>,
    inbox: VecDeque<RecvPacket>,
    event_sent: usize,
    general_sent: usize,
}

impl World {
    fn phc_ns(&self) -> i64 {
        self.ref_ns + self.offset_ns as i64
    }
}

impl World {
    fn gauss(&self) -> f64 {
        if self.jitter_sigma_ns == 0.0 {
            return 0.0;
        }
        let u1: f64 = rand::random::<f64>().max(1e-12);
        let u2: f64 = rand::random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * self.jitter_sigma_ns
    }
}

type SharedWorld = Rc<RefCell<World>>;

struct SimPhc(SharedWorld);

impl Phc for SimPhc {
    fn read(&self) -> Result<i64> {
        Ok(self.0.borrow().phc_ns())
    }

    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> {
        self.0.borrow_mut().applied_ppb = ppb as f64;
        Ok(())
    }

    fn step(&mut self, target: Timestamp) -> Result<()> {
        let mut w = self.0.borrow_mut();
        w.offset_ns = (target.to_nanos() - w.ref_ns) as f64;
        Ok(())
    }

    fn max_freq_ppb(&self) -> i32 {
        500_000
    }
}

struct SimTod(SharedWorld);

impl TodSource for SimTod {
    fn try_read(&mut self) -> Result<Option<TodReading>> {
        let mut w = self.0.borrow_mut();
        let now = w.now_ns;
        match w.pending_tod.front() {
            Some(r) if r.arrival_mono_ns <= now => Ok(w.pending_tod.pop_front()),
            _ => Ok(None),
        }
    }
}

struct SimNet(SharedWorld);

impl PtpNet for SimNet {
    fn send_event(&mut self, _buf: &[u8]) -> Result<()> {
        self.0.borrow_mut().event_sent += 1;
        Ok(())
    }

    fn send_general(&mut self, _buf: &[u8]) -> Result<()> {
        self.0.borrow_mut().general_sent += 1;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<RecvPacket>> {
        Ok(self.0.borrow_mut().inbox.pop_front())
    }

    fn tx_timestamp(&mut self, _seq: u16) -> Result<Option<i64>> {
        Ok(Some(self.0.borrow().phc_ns()))
    }
}

/// The RTC plays no part in these scenarios; its discipline has its own
/// unit coverage.
struct SimRtc;

impl Rtc for SimRtc {
    fn read(&mut self) -> Result<Timestamp> {
        Ok(Timestamp::default())
    }
    fn write(&mut self, _t: Timestamp) -> Result<()> {
        Ok(())
    }
    fn read_aging(&mut self) -> Result<i8> {
        Ok(0)
    }
    fn write_aging(&mut self, _value: i8) -> Result<()> {
        Ok(())
    }
    fn read_temperature(&mut self) -> Option<f32> {
        None
    }
}

// --- Harness ---

struct Sim {
    world: SharedWorld,
    gm: Grandmaster<SimPhc, SimTod, SimNet, SimRtc>,
    sec: i64,
    seq: u32,
    pps_enabled: bool,
    tod_enabled: bool,
    /// Overrides the next ToD labels (for the ±1 s ambiguity scenario).
    label_skew: VecDeque<i64>,
}

impl Sim {
    fn new(natural_ppb: f64, initial_offset_ns: f64, jitter_sigma_ns: f64) -> Self {
        let world = Rc::new(RefCell::new(World {
            now_ns: 0,
            ref_ns: UTC0 as i64 * NS,
            offset_ns: initial_offset_ns,
            natural_ppb,
            applied_ppb: 0.0,
            jitter_sigma_ns,
            pending_tod: VecDeque::new(),
            inbox: VecDeque::new(),
            event_sent: 0,
            general_sent: 0,
        }));

        let status = Arc::new(RwLock::new(GrandmasterStatus::default()));
        let gm = Grandmaster::new(
            SimPhc(world.clone()),
            SimTod(world.clone()),
            SimNet(world.clone()),
            None,
            ClockIdentity::from_mac([0xAA, 0xBB, 0xCC, 0x11, 0x22, 0x33]),
            status,
            SystemConfig::default(),
        );

        Sim {
            world,
            gm,
            sec: 0,
            seq: 0,
            pps_enabled: true,
            tod_enabled: true,
            label_skew: VecDeque::new(),
        }
    }

    /// One simulated second: physics advance, PPS edge, ToD sentence,
    /// housekeeping tick.
    fn second(&mut self) {
        self.sec += 1;
        self.seq += 1;
        let t_mono = self.sec * NS;

        {
            let mut w = self.world.borrow_mut();
            let rate = w.natural_ppb + w.applied_ppb;
            w.ref_ns += NS;
            w.offset_ns += rate;
            w.now_ns = t_mono;
        }

        if self.pps_enabled {
            let (t_phc, noise) = {
                let w = self.world.borrow();
                (w.phc_ns(), w.gauss())
            };
            let edge = PpsEdge {
                seq: self.seq,
                t_mono_ns: t_mono,
                t_phc_ns: t_phc + noise as i64,
                jitter_ns: 2_000,
            };

            if self.tod_enabled {
                let skew = self.label_skew.pop_front().unwrap_or(0);
                let utc = (UTC0 as i64 + self.sec + skew) as u64;
                self.world.borrow_mut().pending_tod.push_back(TodReading {
                    utc_sec: utc,
                    fix_quality: 1,
                    sat_count: 8,
                    arrival_mono_ns: t_mono + 250_000_000,
                });
            }

            self.gm.process_edge(edge).unwrap();
        }

        self.world.borrow_mut().now_ns = t_mono + 500_000_000;
        self.gm.on_tick(t_mono + 500_000_000).unwrap();
    }

    fn run(&mut self, seconds: usize) {
        for _ in 0..seconds {
            self.second();
        }
    }

    fn status(&self) -> GrandmasterStatus {
        self.gm.status_shared().read().unwrap().clone()
    }

    fn offset_ns(&self) -> f64 {
        self.world.borrow().offset_ns
    }

    fn inject_announce(&mut self, id: u8, class: u8, accuracy: u8, variance: u16, seq: u16) {
        let identity = ClockIdentity([id; 8]);
        let header = Header {
            message_type: MessageType::Announce,
            message_length: ANNOUNCE_SIZE as u16,
            domain_number: 0,
            flag_field: 0,
            correction_field: 0,
            source_port_identity: PortIdentity {
                clock_identity: identity,
                port_number: 1,
            },
            sequence_id: seq,
            log_message_interval: 0,
        };
        let body = AnnounceBody {
            origin_timestamp: Timestamp::default(),
            current_utc_offset: 37,
            grandmaster_priority1: 128,
            grandmaster_clock_quality: ClockQuality {
                clock_class: class,
                clock_accuracy: accuracy,
                offset_scaled_log_variance: variance,
            },
            grandmaster_priority2: 128,
            grandmaster_identity: identity,
            steps_removed: 0,
            time_source: TIME_SOURCE_GPS,
        };
        let mut buf = vec![0u8; ANNOUNCE_SIZE];
        header.serialize(&mut buf);
        body.serialize(&mut buf[HEADER_SIZE..]);
        self.world.borrow_mut().inbox.push_back(RecvPacket {
            data: buf,
            src: "192.168.1.50:320".parse().unwrap(),
            rx_ts_ns: self.sec * NS,
        });
    }
}

// ============================================================================
// SCENARIO 1: cold start, clean lock
// ============================================================================

#[test]
fn cold_start_clean_lock() {
    // 50 ppm-fast clock, 50 us initial phase error, no capture noise.
    let mut sim = Sim::new(50_000.0, 50_000.0, 0.0);

    sim.run(40);
    // Binder locked and calibration removed the bulk of the 50 ppm.
    let applied = sim.world.borrow().applied_ppb;
    assert!(
        (applied + 50_000.0).abs() < 5_000.0,
        "calibration applied {applied} ppb, expected about -50000"
    );

    sim.run(260);
    let s = sim.status();
    assert_eq!(s.state, "LOCKED");
    assert!(s.trustworthy, "estimator must be trustworthy once locked");
    assert_eq!(
        (s.clock_class, s.clock_accuracy),
        (6, 0x21),
        "full GPS lock advertises class 6 / 25 ns"
    );
    assert!(
        sim.offset_ns().abs() < 1_000.0,
        "disciplined offset {} ns should be sub-microsecond",
        sim.offset_ns()
    );
    assert_eq!(s.port_state, "MASTER");
    assert!(s.announce_sent > 0);
}

// ============================================================================
// SCENARIO 2: phase step while locked
// ============================================================================

#[test]
fn step_during_locked_recovers_without_relock() {
    let mut sim = Sim::new(50_000.0, 50_000.0, 0.0);
    sim.run(300);
    assert_eq!(sim.status().state, "LOCKED");
    let epoch_before = sim.status().epoch;

    // The PHC jumps +2 ms (beyond the 1 ms step gate).
    sim.world.borrow_mut().offset_ns += 2_000_000.0;
    sim.second();

    let s = sim.status();
    assert!(s.epoch > epoch_before, "offset spike must open a new epoch");
    assert!(!s.trustworthy);
    assert_eq!(s.state, "LOCKED", "state is retained through an excursion");

    // The servo slews the step away and trust returns in the new epoch
    // (the residual drains slowly through the integrator, so only a loose
    // phase bound applies here).
    sim.run(200);
    let s = sim.status();
    assert_eq!(s.state, "LOCKED");
    assert!(s.trustworthy, "trust must rebuild after the step is absorbed");
    assert!(
        sim.offset_ns().abs() < 100_000.0,
        "2 ms excursion not absorbed, offset {}",
        sim.offset_ns()
    );
}

// ============================================================================
// SCENARIO 3: ±1 s ToD ambiguity at startup
// ============================================================================

#[test]
fn startup_label_ambiguity_never_reaches_observer() {
    let mut sim = Sim::new(10_000.0, 10_000.0, 0.0);
    // First four sentences race the edge and flap between T and T+1.
    sim.label_skew = VecDeque::from(vec![1, 0, 1, 0]);

    sim.run(6);
    let s = sim.status();
    assert_eq!(s.valid_samples, 0, "no samples may flow before binder lock");

    // Five consistent sentences later the binder locks with the true base;
    // the flap never produced an offset spike. The only epoch bump allowed
    // is the servo's one startup phase step.
    sim.run(200);
    let s = sim.status();
    assert_eq!(s.state, "LOCKED");
    assert!(s.epoch <= 1, "label flap contaminated the window: epoch {}", s.epoch);
    assert!(
        sim.offset_ns().abs() < 1_000.0,
        "lock converged on the correct second, offset {}",
        sim.offset_ns()
    );
}

// ============================================================================
// SCENARIO 4: GPS loss, holdover aging, recovery
// ============================================================================

#[test]
fn gps_loss_holdover_and_recovery() {
    let mut sim = Sim::new(50_000.0, 50_000.0, 0.0);
    sim.run(300);
    assert_eq!(sim.status().state, "LOCKED");

    // The antenna goes away.
    sim.pps_enabled = false;
    sim.tod_enabled = false;
    sim.run(10);
    assert_eq!(sim.status().state, "HOLDOVER");

    // Ten minutes in: still class 7 (fresh holdover).
    sim.run(590);
    let s = sim.status();
    assert_eq!(s.state, "HOLDOVER");
    assert_eq!((s.clock_class, s.clock_accuracy), (7, 0x31));

    // Beyond one hour: degraded to class 187.
    sim.run(3010);
    let s = sim.status();
    assert_eq!((s.clock_class, s.clock_accuracy), (187, 0x32));

    // Signal returns: RECOVERY first, LOCKED after the qualification run.
    sim.pps_enabled = true;
    sim.tod_enabled = true;
    sim.second();
    assert_eq!(sim.status().state, "RECOVERY");

    sim.run(60);
    let s = sim.status();
    assert_eq!(s.state, "LOCKED");
    assert_eq!((s.clock_class, s.clock_accuracy), (6, 0x21));
}

// ============================================================================
// SCENARIO 5: better foreign master wins BMCA
// ============================================================================

#[test]
fn better_foreign_master_silences_announce() {
    let mut sim = Sim::new(20_000.0, 20_000.0, 0.0);
    sim.run(300);
    let s = sim.status();
    assert_eq!(s.state, "LOCKED");
    assert_eq!(s.port_state, "MASTER");
    assert!(sim.world.borrow().event_sent > 0);

    // A class-6 master with tighter accuracy and a lower identity appears.
    sim.inject_announce(0x01, 6, 0x20, 0x4E00, 1);
    sim.second();

    let s = sim.status();
    assert_eq!(s.port_state, "SLAVE");
    assert_eq!(
        s.selected_master.as_deref(),
        Some("01:01:01:01:01:01:01:01")
    );

    // Emission stops within an announce interval.
    let sent_at_switch = {
        let w = sim.world.borrow();
        (w.event_sent, w.general_sent)
    };
    for seq in 2..10u16 {
        sim.inject_announce(0x01, 6, 0x20, 0x4E00, seq);
        sim.second();
    }
    let w = sim.world.borrow();
    assert_eq!(
        (w.event_sent, w.general_sent),
        sent_at_switch,
        "a slave port must be silent"
    );
}

// ============================================================================
// SCENARIO: worse foreign master is ignored
// ============================================================================

#[test]
fn worse_foreign_master_is_ignored() {
    let mut sim = Sim::new(20_000.0, 20_000.0, 0.0);
    sim.run(300);
    assert_eq!(sim.status().port_state, "MASTER");

    // A holdover-grade master cannot displace a locked GPS clock.
    sim.inject_announce(0x01, 187, 0x32, 0x8000, 1);
    sim.second();
    assert_eq!(sim.status().port_state, "MASTER");
}

// ============================================================================
// SCENARIO: discipline quality under capture noise
// ============================================================================

#[test]
fn noisy_capture_still_converges() {
    // 30 ns RMS of capture noise on a 30 ppm clock.
    let mut sim = Sim::new(30_000.0, 20_000.0, 30.0);
    sim.run(400);

    let s = sim.status();
    assert_eq!(s.state, "LOCKED");
    assert!(
        sim.offset_ns().abs() < 5_000.0,
        "offset {} ns should stay bounded under noise",
        sim.offset_ns()
    );
}
