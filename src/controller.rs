//! Grandmaster controller - binds every subsystem into the worker loop.
//!
//! The edge thread hands over raw `PpsEdge`s; everything else happens here:
//! label derivation, calibration, drift observation, servo corrections,
//! holdover transitions, BMCA, and Announce/Sync emission. The controller is
//! generic over the HAL traits so the whole pipeline runs against simulated
//! hardware in tests.

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::binder::ReferenceBinder;
use crate::bmca::{run_bmca, BmcaDecision, ForeignMasterTable, LocalDataset, PortState, PtpPort};
use crate::calibrator::{CalibrationOutcome, PhcCalibrator};
use crate::config::SystemConfig;
use crate::emitter::{AnnounceSyncEmitter, QualitySnapshot};
use crate::holdover::{ControllerState, HoldoverController, Transition};
use crate::observer::{DriftObserver, ObserverEvent};
use crate::ptp::{
    self, AnnounceBody, ClockIdentity, Header, MessageType, PortIdentity, SyncBody, Timestamp,
    FLAG_TWO_STEP, HEADER_SIZE,
};
use crate::quality::{map_clock_quality, ReferenceInfo};
use crate::servo::{make_servo, Correction, Servo};
use crate::status::GrandmasterStatus;
use crate::traits::{Phc, PpsEdge, PtpNet, Rtc, TodReading, TodSource};

const NS_PER_SEC: i64 = 1_000_000_000;

// The PPS source is persistently gone after this much edge silence.
const PPS_TIMEOUT_NS: i64 = 3 * NS_PER_SEC;
// BMCA re-evaluation cadence.
const BMCA_TICK_NS: i64 = 2 * NS_PER_SEC;
// A servo slew larger than this counts as an external frequency step and
// opens an observer holdoff.
const FREQ_STEP_PPB: i32 = 50_000;
// Pending two-step Syncs are garbage collected past this count.
const MAX_PENDING_SYNCS: usize = 64;

struct PendingSync {
    rx_ts_ns: i64,
    correction_ns: i64,
    source: PortIdentity,
}

pub struct Grandmaster<P, T, N, R>
where
    P: Phc,
    T: TodSource,
    N: PtpNet,
    R: Rtc,
{
    phc: P,
    tod: T,
    net: N,
    rtc: Option<R>,
    config: SystemConfig,

    binder: ReferenceBinder,
    observer: DriftObserver,
    calibrator: PhcCalibrator,
    servo: Box<dyn Servo>,
    holdover: HoldoverController,
    port: PtpPort,
    emitter: AnnounceSyncEmitter,
    foreign: ForeignMasterTable,

    identity: ClockIdentity,
    status_shared: Arc<RwLock<GrandmasterStatus>>,

    calibrated: bool,
    applied_ppb: i32,
    last_tod: Option<TodReading>,
    last_edge_mono_ns: Option<i64>,
    last_bmca_ns: i64,
    last_rtc_ns: i64,
    last_offset_ns: i64,
    now_ns: i64,
    pps_timed_out: bool,

    pending_syncs: HashMap<u16, PendingSync>,
    packets_dropped: u64,
    late_edges: u64,
}

impl<P, T, N, R> Grandmaster<P, T, N, R>
where
    P: Phc,
    T: TodSource,
    N: PtpNet,
    R: Rtc,
{
    pub fn new(
        phc: P,
        tod: T,
        net: N,
        rtc: Option<R>,
        identity: ClockIdentity,
        status_shared: Arc<RwLock<GrandmasterStatus>>,
        config: SystemConfig,
    ) -> Self {
        info!("=== Grandmaster initialization ===");
        info!("Clock identity: {}", identity);
        info!(
            "Domain {}, priority1 {}, priority2 {}, servo {:?}",
            config.ptp.domain, config.ptp.priority1, config.ptp.priority2, config.servo.kind
        );

        let port_identity = PortIdentity {
            clock_identity: identity,
            port_number: 1,
        };
        let mut port = PtpPort::new();
        port.enable();

        Grandmaster {
            binder: ReferenceBinder::new(config.binder.clone()),
            observer: DriftObserver::new(config.observer.clone()),
            calibrator: PhcCalibrator::new(config.calibrator.clone()),
            servo: make_servo(&config.servo),
            holdover: HoldoverController::new(config.holdover.clone()),
            port,
            emitter: AnnounceSyncEmitter::new(config.ptp.clone(), port_identity),
            foreign: ForeignMasterTable::new(
                config.ptp.foreign_capacity,
                config.ptp.domain,
                config.ptp.announce_interval_ms,
                config.ptp.announce_timeout_multiplier,
            ),
            phc,
            tod,
            net,
            rtc,
            identity,
            status_shared,
            calibrated: false,
            applied_ppb: 0,
            last_tod: None,
            last_edge_mono_ns: None,
            last_bmca_ns: 0,
            last_rtc_ns: 0,
            last_offset_ns: 0,
            now_ns: 0,
            pps_timed_out: false,
            pending_syncs: HashMap::new(),
            packets_dropped: 0,
            late_edges: 0,
            config,
        }
    }

    pub fn status_shared(&self) -> Arc<RwLock<GrandmasterStatus>> {
        self.status_shared.clone()
    }

    pub fn state(&self) -> ControllerState {
        self.holdover.state()
    }

    pub fn port_state(&self) -> PortState {
        self.port.state()
    }

    /// Seed the PHC with a saved frequency (holdover anchor) before the
    /// calibrator runs; the calibration then measures only the residual.
    pub fn set_initial_frequency(&mut self, ppb: i32) -> Result<()> {
        let ppb = ppb.clamp(-self.phc.max_freq_ppb(), self.phc.max_freq_ppb());
        self.phc.adjust_frequency(ppb)?;
        self.applied_ppb = ppb;
        self.servo.prime(ppb as f64);
        info!("[Grandmaster] anchor frequency {:+}ppb restored", ppb);
        Ok(())
    }

    pub fn applied_frequency_ppb(&self) -> i32 {
        self.applied_ppb
    }

    pub fn phc_now(&self) -> Result<i64> {
        self.phc.read()
    }

    // ========================================================================
    // EDGE PATH
    // ========================================================================

    /// One PPS edge from the RT thread.
    pub fn process_edge(&mut self, edge: PpsEdge) -> Result<()> {
        let now = edge.t_mono_ns;
        self.now_ns = now;
        self.last_edge_mono_ns = Some(now);
        self.pps_timed_out = false;

        self.drain_tod()?;
        self.binder.observe_pps(edge.seq, edge.t_mono_ns);
        self.binder.tick(now);
        self.observer.set_reference_bad(self.binder.reference_bad());

        if edge.jitter_ns > self.config.edge.max_sampling_latency_ns {
            // Flagged, never dropped: the phase data is still usable, only
            // less sharp.
            self.late_edges += 1;
            debug!(
                "[Edge] capture latency {}us past bound (#{})",
                edge.jitter_ns / 1000,
                self.late_edges
            );
        }

        let label = self.binder.label_for(edge.seq);
        let tod_valid = self.tod_valid();

        let Some(label_sec) = label else {
            // No UTC anchor yet; the edge still advances holdover state.
            let t = self
                .holdover
                .on_reference_sample(true, false, 0, f64::MAX, None, now);
            self.react(t, now)?;
            self.update_status();
            return Ok(());
        };
        let t_ref_ns = label_sec as i64 * NS_PER_SEC;
        let offset_ns = edge.t_phc_ns - t_ref_ns;
        self.last_offset_ns = offset_ns;

        // Pre-run calibration: loop stays open until the raw error is known.
        if !self.calibrated {
            match self.calibrator.feed(t_ref_ns, edge.t_phc_ns) {
                CalibrationOutcome::Pending => {
                    self.update_status();
                    return Ok(());
                }
                CalibrationOutcome::Measured(ppm) => {
                    // Relative to whatever is already applied (anchor file).
                    let ppb = (self.applied_ppb as f64 - ppm * 1000.0)
                        .clamp(-self.phc.max_freq_ppb() as f64, self.phc.max_freq_ppb() as f64)
                        .round() as i32;
                    self.phc.adjust_frequency(ppb)?;
                    self.applied_ppb = ppb;
                    self.servo.prime(ppb as f64);
                    self.observer.handle_event(ObserverEvent::FrequencyAdjusted);
                    self.calibrated = true;
                    info!("[Grandmaster] pre-compensated {:+}ppb", ppb);
                }
                CalibrationOutcome::Failed => {
                    warn!("[Grandmaster] calibration failed, starting uncompensated");
                    self.calibrated = true;
                }
            }
        }

        // The first samples after a fresh lock are transients; keep them out
        // of the statistics.
        if !self.holdover.take_skip() {
            self.observer.update(t_ref_ns, edge.t_phc_ns);
        }
        let est = self.observer.estimate();
        let freq_err_ppb = if est.ready {
            est.drift_ppm * 1000.0
        } else {
            f64::MAX
        };

        let transition =
            self.holdover
                .on_reference_sample(true, tod_valid, offset_ns, freq_err_ppb, label, now);
        self.react(transition, now)?;

        if self.holdover.state() != ControllerState::Holdover {
            self.run_servo(offset_ns, edge.t_phc_ns)?;
        }

        self.update_status();
        Ok(())
    }

    fn run_servo(&mut self, offset_ns: i64, phc_now_ns: i64) -> Result<()> {
        match self.servo.sample(offset_ns, phc_now_ns) {
            Correction::Slew(ppb) => {
                let ppb = ppb.clamp(-self.phc.max_freq_ppb(), self.phc.max_freq_ppb());
                if ppb != self.applied_ppb {
                    self.phc.adjust_frequency(ppb)?;
                    // Ordinary servo slews are part of the discipline; only a
                    // step-sized change contaminates the statistics.
                    if (ppb - self.applied_ppb).abs() > FREQ_STEP_PPB {
                        self.observer.handle_event(ObserverEvent::FrequencyAdjusted);
                    }
                    self.applied_ppb = ppb;
                }
            }
            Correction::Step(target) => {
                warn!("[Grandmaster] stepping PHC to {}s", target.seconds);
                self.phc.step(target)?;
                // A step is observed by the observer strictly before the
                // next update, and voids the PPS/UTC anchor.
                self.observer.handle_event(ObserverEvent::ClockStepped);
                self.binder.on_step();
                let t = self.holdover.reset();
                self.react(t, 0)?;
            }
            Correction::Hold => {}
        }
        Ok(())
    }

    fn react(&mut self, transition: Transition, _now: i64) -> Result<()> {
        match transition {
            Transition::None => {}
            Transition::EnteredLocked => {
                self.servo.reset();
                self.servo.prime(self.applied_ppb as f64);
                self.observer.handle_event(ObserverEvent::ClockSlewed);
            }
            Transition::EnteredHoldover => {
                self.servo.freeze(true);
            }
            Transition::EnteredRecovery => {
                self.servo.freeze(false);
            }
        }
        Ok(())
    }

    fn drain_tod(&mut self) -> Result<()> {
        while let Some(reading) = self.tod.try_read()? {
            if reading.fix_quality > 0 {
                self.binder
                    .observe_tod(reading.utc_sec, reading.arrival_mono_ns);
            }
            self.last_tod = Some(reading);
        }
        Ok(())
    }

    fn tod_valid(&self) -> bool {
        self.binder.is_locked()
            && !self.binder.reference_bad()
            && self.last_tod.is_some_and(|t| t.fix_quality > 0)
    }

    // ========================================================================
    // HOUSEKEEPING PATH (no-edge work)
    // ========================================================================

    /// Periodic worker tick: reference-timeout detection, packet intake,
    /// BMCA, emission, RTC work. Safe to call at any cadence at or under the
    /// sync interval.
    pub fn on_tick(&mut self, now_mono_ns: i64) -> Result<()> {
        self.now_ns = now_mono_ns;
        self.drain_tod()?;
        self.binder.tick(now_mono_ns);

        // Edge silence is the one reference failure the edge path cannot
        // see. One transition per outage, not one per tick.
        if let Some(last) = self.last_edge_mono_ns {
            if now_mono_ns - last > PPS_TIMEOUT_NS && !self.pps_timed_out {
                warn!(
                    "[Grandmaster] no PPS edge for {}s",
                    (now_mono_ns - last) / NS_PER_SEC
                );
                self.pps_timed_out = true;
                self.observer.handle_event(ObserverEvent::ReferenceLost);
                let t = self.holdover.on_reference_sample(
                    false,
                    self.tod_valid(),
                    0,
                    f64::MAX,
                    None,
                    now_mono_ns,
                );
                self.react(t, now_mono_ns)?;
            }
        }

        self.process_net(now_mono_ns)?;

        if now_mono_ns - self.last_bmca_ns >= BMCA_TICK_NS {
            self.last_bmca_ns = now_mono_ns;
            self.run_bmca_round(now_mono_ns);
        }

        if self.port.state() == PortState::Master {
            let disciplined = Timestamp::from_nanos(self.phc.read()?);
            let snapshot = self.quality_snapshot(now_mono_ns);
            self.emitter
                .poll(&mut self.net, now_mono_ns, disciplined, &snapshot)?;
        }

        if now_mono_ns - self.last_rtc_ns >= NS_PER_SEC {
            self.last_rtc_ns = now_mono_ns;
            self.rtc_round(now_mono_ns)?;
        }

        self.update_status();
        Ok(())
    }

    fn rtc_round(&mut self, now_mono_ns: i64) -> Result<()> {
        let Some(rtc) = self.rtc.as_mut() else {
            return Ok(());
        };
        let rtc_ns = match rtc.read() {
            Ok(t) => t.to_nanos(),
            Err(e) => {
                // Transient bus failure; the next round retries.
                debug!("[RTC] read failed: {}", e);
                return Ok(());
            }
        };
        let phc_ns = self.phc.read()?;

        if self.holdover.state() == ControllerState::Holdover {
            // Secondary reference: trim the held frequency, very slowly.
            if let Some(trim_ppb) = self.holdover.on_rtc_sample(phc_ns, rtc_ns) {
                let ppb = (self.applied_ppb as f64 - trim_ppb)
                    .clamp(-self.phc.max_freq_ppb() as f64, self.phc.max_freq_ppb() as f64)
                    .round() as i32;
                if ppb != self.applied_ppb {
                    self.phc.adjust_frequency(ppb)?;
                    self.applied_ppb = ppb;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // PACKET PATH
    // ========================================================================

    fn process_net(&mut self, now_mono_ns: i64) -> Result<()> {
        while let Some(pkt) = self.net.recv()? {
            let header = match Header::parse(&pkt.data) {
                Ok(h) => h,
                Err(e) => {
                    debug!("[Net] dropped packet from {}: {}", pkt.src, e);
                    self.packets_dropped += 1;
                    continue;
                }
            };
            if header.domain_number != self.config.ptp.domain {
                self.packets_dropped += 1;
                continue;
            }
            // Our own multicast loopback is not a foreign master.
            if header.source_port_identity.clock_identity == self.identity {
                continue;
            }

            match header.message_type {
                MessageType::Announce => {
                    self.handle_announce(&header, &pkt.data, pkt.src, now_mono_ns)
                }
                MessageType::Sync => self.handle_sync(&header, pkt.rx_ts_ns),
                MessageType::FollowUp => self.handle_follow_up(&header, &pkt.data),
            }
        }
        Ok(())
    }

    fn handle_announce(
        &mut self,
        header: &Header,
        data: &[u8],
        src: std::net::SocketAddr,
        now_mono_ns: i64,
    ) {
        let body = match AnnounceBody::parse(&data[HEADER_SIZE..]) {
            Ok(b) => b,
            Err(e) => {
                debug!("[Net] bad announce: {}", e);
                self.packets_dropped += 1;
                return;
            }
        };
        if self.foreign.observe(header, &body, src, now_mono_ns).is_err() {
            self.packets_dropped += 1;
            return;
        }
        // BMCA runs on every received Announce.
        self.run_bmca_round(now_mono_ns);
    }

    fn handle_sync(&mut self, header: &Header, rx_ts_ns: i64) {
        if self.port.state() != PortState::Slave {
            return;
        }
        if header.flag_field & FLAG_TWO_STEP == 0 {
            // One-step masters carry the precise time in the Sync itself;
            // nothing further to wait for, but our upstreams are two-step.
            return;
        }
        if self.pending_syncs.len() >= MAX_PENDING_SYNCS {
            self.pending_syncs.clear();
        }
        self.pending_syncs.insert(
            header.sequence_id,
            PendingSync {
                rx_ts_ns,
                correction_ns: header.correction_field >> 16,
                source: header.source_port_identity,
            },
        );
    }

    fn handle_follow_up(&mut self, header: &Header, data: &[u8]) {
        if self.port.state() != PortState::Slave {
            return;
        }
        let Some(pending) = self.pending_syncs.remove(&header.sequence_id) else {
            return;
        };
        if pending.source != header.source_port_identity {
            self.packets_dropped += 1;
            return;
        }
        let Some(selected) = self.port.selected_master() else {
            return;
        };
        if header.source_port_identity.clock_identity != selected {
            return;
        }
        let body = match SyncBody::parse(&data[HEADER_SIZE..]) {
            Ok(b) => b,
            Err(_) => {
                self.packets_dropped += 1;
                return;
            }
        };
        // Slave path reuses the observer: remote origin is the reference,
        // our receive stamp the local clock.
        let t_ref = body.origin_timestamp.to_nanos()
            + pending.correction_ns
            + (header.correction_field >> 16);
        self.observer.update(t_ref, pending.rx_ts_ns);
    }

    fn run_bmca_round(&mut self, now_mono_ns: i64) {
        self.foreign.age_out(now_mono_ns);
        let local = LocalDataset {
            priority1: self.config.ptp.priority1,
            clock_quality: self.local_quality(now_mono_ns),
            priority2: self.config.ptp.priority2,
            clock_identity: self.identity,
        };
        let decision = run_bmca(&local, &self.foreign);
        let was_master = self.port.state() == PortState::Master;
        if self.port.apply(decision) {
            if was_master && self.port.state() != PortState::Master {
                // Announce emission stops within one interval of losing BMCA.
                self.emitter.stop();
            }
            if let BmcaDecision::ForeignBest(id) = decision {
                self.observer.handle_event(ObserverEvent::ReferenceChanged);
                info!("[Grandmaster] tracking remote master {}", id);
            }
        }
    }

    fn local_quality(&self, now_mono_ns: i64) -> ptp::ClockQuality {
        map_clock_quality(
            self.holdover.state(),
            self.holdover.holdover_elapsed_s(now_mono_ns),
            self.config.holdover.degrade_secs,
            ReferenceInfo {
                pps_present: !self.pps_timed_out && self.last_edge_mono_ns.is_some(),
                sat_count: self.last_tod.map_or(0, |t| t.sat_count),
            },
        )
    }

    fn quality_snapshot(&self, now_mono_ns: i64) -> QualitySnapshot {
        QualitySnapshot {
            clock_quality: self.local_quality(now_mono_ns),
            grandmaster_identity: self.identity,
            time_source: ptp::TIME_SOURCE_GPS,
        }
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    fn update_status(&self) {
        if let Ok(mut status) = self.status_shared.write() {
            let est = self.observer.estimate();
            status.state = self.holdover.state().as_str().to_string();
            status.port_state = self.port.state().as_str().to_string();
            status.offset_ns = self.last_offset_ns;
            status.drift_ppm = est.drift_ppm;
            status.applied_freq_ppb = self.applied_ppb;
            status.servo_locked = self.servo.is_locked();
            status.trustworthy = est.trustworthy;
            status.epoch = est.current_epoch;
            status.valid_samples = est.valid_samples;
            status.holdover_elapsed_s = self.holdover.holdover_elapsed_s(self.now_ns);
            let q = self.local_quality(self.now_ns);
            status.clock_class = q.clock_class;
            status.clock_accuracy = q.clock_accuracy;
            status.sat_count = self.last_tod.map_or(0, |t| t.sat_count);
            status.selected_master = self.port.selected_master().map(|id| id.to_string());
            status.announce_sent = self.emitter.announce_sent;
            status.sync_sent = self.emitter.sync_sent;
            status.packets_dropped = self.packets_dropped;
            status.updated_ts = SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
