//! Statistical drift observer.
//!
//! Converts the stream of (reference, local-clock) timestamp pairs from the
//! PPS edge loop into a frequency estimate the servo can trust.
//!
//! ## The problem
//! Raw per-second drift measurements are contaminated by:
//! - phase steps (servo corrections, ±1 s label races)
//! - missed or doubled PPS periods
//! - scheduler and bus latency spikes
//!
//! A single 1 ms phase step read as "drift" is a 1000 ppm excursion that a
//! naive averager drags around for the whole window.
//!
//! ## The approach
//! 1. Every contamination event opens a new *epoch*; statistics never mix
//!    samples across epochs.
//! 2. A spike pipeline (step gate, reference-interval gate, drift bound,
//!    MAD outlier) invalidates samples before they reach the estimator.
//! 3. A *holdoff* tick counter suppresses trust for a bounded number of
//!    samples after any disturbance, so the servo never acts on transients.
//!
//! An offset spike bumps the epoch permanently, like every other
//! contamination event: readiness rebuilds from zero in the new epoch even
//! when the excursion turns out to be a one-sample glitch. When the new
//! level persists it is adopted as the comparison baseline, so a real step
//! costs exactly one bump rather than one per sample.

use log::{debug, info};
use std::collections::VecDeque;

use crate::config::{EstimationMethod, ObserverConfig};

const NS_PER_SEC: i64 = 1_000_000_000;

// Noise bounds for the advisory health flags. Software timestamping on a
// loaded host sits well under these; exceeding them means the transport, not
// the crystal, dominates the measurement.
const MAX_JITTER_NS_RMS: f64 = 100_000.0;
const MAX_OFFSET_STDDEV_NS: f64 = 500_000.0;
// Fraction of invalid samples in the window above which it is contaminated.
const CONTAMINATION_RATIO: f64 = 0.2;

// ============================================================================
// SAMPLE AND ESTIMATE TYPES
// ============================================================================

/// Per-sample condition flags.
pub mod sample_flags {
    pub const OFFSET_SPIKE: u16 = 1 << 0;
    pub const DRIFT_SPIKE: u16 = 1 << 1;
    pub const DT_REF_INVALID: u16 = 1 << 2;
    pub const DT_CLK_INVALID: u16 = 1 << 3;
    pub const EPOCH_BOUNDARY: u16 = 1 << 4;
    pub const IN_HOLDOFF: u16 = 1 << 5;
}

/// Estimate health flags.
pub mod health {
    pub const NOT_READY: u16 = 1 << 0;
    pub const IN_HOLDOFF: u16 = 1 << 1;
    pub const REFERENCE_BAD: u16 = 1 << 2;
    pub const MISSING_TICKS: u16 = 1 << 3;
    pub const STEP_DETECTED: u16 = 1 << 4;
    pub const WINDOW_CONTAMINATED: u16 = 1 << 5;
    pub const JITTER_TOO_HIGH: u16 = 1 << 6;
    pub const OFFSET_UNSTABLE: u16 = 1 << 7;
}

/// One ring-buffer entry. Immutable once pushed.
#[derive(Debug, Clone, Copy)]
pub struct DriftSample {
    pub seq: u64,
    pub epoch_id: u64,
    pub t_ref_ns: i64,
    pub t_clk_ns: i64,
    pub offset_ns: i64,
    pub dt_ref_ns: i64,
    pub dt_clk_ns: i64,
    pub drift_ns_per_s: f64,
    pub valid: bool,
    pub flags: u16,
}

/// Observer output. `trustworthy` is the only field the servo path may act
/// on; everything else is diagnostic.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Estimate {
    pub ready: bool,
    pub trustworthy: bool,
    pub offset_mean_ns: f64,
    pub offset_stddev_ns: f64,
    pub offset_median_ns: i64,
    pub drift_ppm: f64,
    pub drift_stddev_ppm: f64,
    pub jitter_ns_rms: f64,
    pub health_flags: u16,
    pub current_epoch: u64,
    pub ticks_in_epoch: u64,
    pub ticks_in_holdoff: u64,
    pub total_samples: u64,
    pub valid_samples: u64,
}

/// Disturbance notifications from the rest of the system. Non-blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverEvent {
    ReferenceChanged,
    ReferenceLost,
    ReferenceRecovered,
    ClockStepped,
    ClockSlewed,
    FrequencyAdjusted,
    ServoModeChanged,
    WarmStartRequested,
}

#[derive(Debug, Clone, Copy)]
struct SuspectStep {
    spike_offset_ns: i64,
}

// ============================================================================
// OBSERVER
// ============================================================================

#[derive(Debug)]
pub struct DriftObserver {
    cfg: ObserverConfig,
    ring: VecDeque<DriftSample>,

    seq: u64,
    current_epoch: u64,
    ticks_in_epoch: u64,
    holdoff: u32,
    total_samples: u64,

    /// Last valid sample's (t_ref, t_clk, offset); spike comparisons and
    /// deltas run against this, never against an invalid sample.
    last_valid: Option<(i64, i64, i64)>,

    suspect: Option<SuspectStep>,
    step_latched: bool,
    reference_bad: bool,
}

impl DriftObserver {
    pub fn new(cfg: ObserverConfig) -> Self {
        let capacity = cfg.capacity;
        DriftObserver {
            cfg,
            ring: VecDeque::with_capacity(capacity),
            seq: 0,
            current_epoch: 0,
            ticks_in_epoch: 0,
            holdoff: 0,
            total_samples: 0,
            last_valid: None,
            suspect: None,
            step_latched: false,
            reference_bad: false,
        }
    }

    /// Push one (reference, local clock) timestamp pair.
    pub fn update(&mut self, t_ref_ns: i64, t_clk_ns: i64) {
        self.seq += 1;
        self.total_samples += 1;
        self.ticks_in_epoch += 1;

        let offset_ns = t_clk_ns - t_ref_ns;
        let mut flags: u16 = 0;
        let mut valid = true;
        let mut dt_ref_ns = 0i64;
        let mut dt_clk_ns = 0i64;
        let mut drift_ns_per_s = 0.0f64;

        match self.last_valid {
            None => {
                // First sample after an epoch boundary carries an offset but
                // no usable rate.
                flags |= sample_flags::EPOCH_BOUNDARY;
            }
            Some((prev_ref, prev_clk, prev_offset)) => {
                // 1. Step gate, before anything else: a phase jump poisons
                //    every statistic downstream.
                let jump = offset_ns - prev_offset;
                if jump.abs() > self.cfg.max_offset_step_ns {
                    self.on_offset_spike(t_ref_ns, t_clk_ns, offset_ns, jump);
                    return;
                }

                // The level came back to the old baseline: the excursion was
                // a glitch. The epoch it cost stands; only the suspicion
                // ends.
                if let Some(s) = self.suspect.take() {
                    debug!(
                        "[Observer] spike at {:+}ns did not persist, continuing in epoch {}",
                        s.spike_offset_ns, self.current_epoch
                    );
                }

                dt_ref_ns = t_ref_ns - prev_ref;
                dt_clk_ns = t_clk_ns - prev_clk;

                // 2. Reference-interval gate: the PPS period is 1 s by
                //    construction. The delta runs against the last VALID
                //    sample, which may be several edges back, so the gate
                //    accepts whole multiples of the period.
                let periods = ((dt_ref_ns + NS_PER_SEC / 2) / NS_PER_SEC).max(0);
                if periods < 1
                    || (dt_ref_ns - periods * NS_PER_SEC).abs() > self.cfg.max_dt_ref_deviation_ns
                {
                    flags |= sample_flags::DT_REF_INVALID;
                    valid = false;
                }
                if dt_clk_ns <= 0 {
                    flags |= sample_flags::DT_CLK_INVALID;
                    valid = false;
                }

                if valid {
                    drift_ns_per_s =
                        (dt_clk_ns - dt_ref_ns) as f64 / (dt_ref_ns as f64 / NS_PER_SEC as f64);

                    // 3. Physical drift bound.
                    if drift_ns_per_s.abs() / 1000.0 > self.cfg.max_drift_ppm {
                        flags |= sample_flags::DRIFT_SPIKE;
                        valid = false;
                    }
                }

                // 4. MAD outlier rejection, once the window is populated.
                if valid && !self.mad_accepts(drift_ns_per_s) {
                    flags |= sample_flags::DRIFT_SPIKE;
                    valid = false;
                }
            }
        }

        if self.holdoff > 0 {
            flags |= sample_flags::IN_HOLDOFF;
        }

        self.push(DriftSample {
            seq: self.seq,
            epoch_id: self.current_epoch,
            t_ref_ns,
            t_clk_ns,
            offset_ns,
            dt_ref_ns,
            dt_clk_ns,
            drift_ns_per_s,
            valid,
            flags,
        });

        if valid {
            self.last_valid = Some((t_ref_ns, t_clk_ns, offset_ns));
            if self.holdoff > 0 {
                self.holdoff -= 1;
                if self.holdoff == 0 {
                    self.step_latched = false;
                }
            }
        }
    }

    /// Snapshot of the current-epoch statistics.
    pub fn estimate(&self) -> Estimate {
        let in_epoch: Vec<&DriftSample> = self
            .ring
            .iter()
            .filter(|s| s.epoch_id == self.current_epoch)
            .collect();
        let valid: Vec<&DriftSample> = in_epoch.iter().copied().filter(|s| s.valid).collect();

        let mut est = Estimate {
            current_epoch: self.current_epoch,
            ticks_in_epoch: self.ticks_in_epoch,
            ticks_in_holdoff: self.holdoff as u64,
            total_samples: self.total_samples,
            valid_samples: valid.len() as u64,
            ..Default::default()
        };

        est.ready = valid.len() >= self.cfg.min_valid_samples;

        if !valid.is_empty() {
            let offsets: Vec<f64> = valid.iter().map(|s| s.offset_ns as f64).collect();
            est.offset_mean_ns = mean(&offsets);
            est.offset_stddev_ns = stddev(&offsets, est.offset_mean_ns);
            est.offset_median_ns = {
                let mut v: Vec<i64> = valid.iter().map(|s| s.offset_ns).collect();
                v.sort_unstable();
                v[v.len() / 2]
            };

            // Rate samples: only entries that carried a usable dt.
            let rated: Vec<&&DriftSample> = valid
                .iter()
                .filter(|s| s.flags & sample_flags::EPOCH_BOUNDARY == 0)
                .collect();

            let (drift_ppm, jitter) = match self.cfg.estimation {
                EstimationMethod::Regression => self.regress(&valid),
                EstimationMethod::MeanOfDeltas => {
                    let rates: Vec<f64> =
                        rated.iter().map(|s| s.drift_ns_per_s / 1000.0).collect();
                    let d = if rates.is_empty() { 0.0 } else { mean(&rates) };
                    (d, est.offset_stddev_ns)
                }
            };
            est.drift_ppm = drift_ppm;
            est.jitter_ns_rms = jitter;

            if !rated.is_empty() {
                let rates: Vec<f64> = rated.iter().map(|s| s.drift_ns_per_s / 1000.0).collect();
                let m = mean(&rates);
                est.drift_stddev_ppm = stddev(&rates, m);
            }
        }

        est.health_flags = self.health_flags(&est, in_epoch.len(), valid.len());
        est.trustworthy = est.ready
            && self.holdoff == 0
            && est.drift_stddev_ppm < self.cfg.max_drift_stddev_ppm;
        est
    }

    /// Disturbance intake. `ReferenceChanged` and `ClockStepped` contaminate
    /// the window (epoch bump); the rest only start or extend a holdoff.
    pub fn handle_event(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::ClockStepped => {
                self.bump_epoch("clock stepped");
                self.holdoff = self.holdoff.max(self.cfg.holdoff_after_step_ticks);
                self.step_latched = true;
            }
            ObserverEvent::ReferenceChanged => {
                self.bump_epoch("reference changed");
                self.holdoff = self.holdoff.max(self.cfg.holdoff_after_ref_ticks);
            }
            ObserverEvent::ClockSlewed
            | ObserverEvent::FrequencyAdjusted
            | ObserverEvent::ServoModeChanged => {
                self.holdoff = self.holdoff.max(self.cfg.holdoff_after_freq_ticks);
            }
            ObserverEvent::ReferenceLost | ObserverEvent::ReferenceRecovered => {
                // Informational; trust is unaffected.
                debug!("[Observer] {:?}", event);
            }
            ObserverEvent::WarmStartRequested => {
                // Drop history without a holdoff: the caller asserts the
                // clock is already near its old discipline point.
                self.ring.clear();
                self.last_valid = None;
                self.suspect = None;
                self.ticks_in_epoch = 0;
                self.current_epoch += 1;
                info!("[Observer] warm start, epoch {}", self.current_epoch);
            }
        }
    }

    /// Explicit reset: contamination by definition.
    pub fn reset(&mut self) {
        self.bump_epoch("explicit reset");
        self.holdoff = self.holdoff.max(self.cfg.holdoff_after_ref_ticks);
    }

    pub fn set_reference_bad(&mut self, bad: bool) {
        self.reference_bad = bad;
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    // ------------------------------------------------------------------

    fn on_offset_spike(&mut self, t_ref_ns: i64, t_clk_ns: i64, offset_ns: i64, jump: i64) {
        let already_suspect = self.suspect.is_some();
        if !already_suspect {
            self.current_epoch += 1;
            self.ticks_in_epoch = 0;
            self.suspect = Some(SuspectStep {
                spike_offset_ns: offset_ns,
            });
            info!(
                "[Observer] offset spike {:+}ns, epoch {}, holdoff {}",
                jump,
                self.current_epoch,
                self.cfg.holdoff_after_step_ticks
            );
        } else if let Some(s) = self.suspect.as_mut() {
            // Follow-up samples at the new level confirm a real step: adopt
            // the level as the comparison baseline so the window can rebuild.
            if (offset_ns - s.spike_offset_ns).abs() <= self.cfg.max_offset_step_ns {
                debug!("[Observer] spike level persisted, step confirmed");
                self.suspect = None;
                self.last_valid = Some((t_ref_ns, t_clk_ns, offset_ns));
            } else {
                s.spike_offset_ns = offset_ns;
            }
        }
        self.holdoff = self.holdoff.max(self.cfg.holdoff_after_step_ticks);

        self.push(DriftSample {
            seq: self.seq,
            epoch_id: self.current_epoch,
            t_ref_ns,
            t_clk_ns,
            offset_ns,
            dt_ref_ns: 0,
            dt_clk_ns: 0,
            drift_ns_per_s: 0.0,
            valid: false,
            flags: sample_flags::OFFSET_SPIKE | sample_flags::IN_HOLDOFF,
        });
    }

    fn bump_epoch(&mut self, why: &str) {
        self.current_epoch += 1;
        self.ticks_in_epoch = 0;
        self.last_valid = None;
        self.suspect = None;
        info!("[Observer] epoch {} ({})", self.current_epoch, why);
    }

    fn push(&mut self, sample: DriftSample) {
        if self.ring.len() == self.cfg.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(sample);
    }

    /// MAD gate over the current epoch's drift values.
    fn mad_accepts(&self, drift_ns_per_s: f64) -> bool {
        let mut rates: Vec<f64> = self
            .ring
            .iter()
            .filter(|s| {
                s.epoch_id == self.current_epoch
                    && s.valid
                    && s.flags & sample_flags::EPOCH_BOUNDARY == 0
            })
            .map(|s| s.drift_ns_per_s)
            .collect();
        if rates.len() < self.cfg.min_valid_samples {
            return true;
        }
        rates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = rates[rates.len() / 2];
        let mut deviations: Vec<f64> = rates.iter().map(|r| (r - median).abs()).collect();
        deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        // MAD floor (0.5 us/s) keeps an ultra-quiet window from rejecting
        // ordinary samples.
        let mad = deviations[deviations.len() / 2].max(500.0);
        (drift_ns_per_s - median).abs() <= self.cfg.outlier_mad_sigma * mad
    }

    /// Least-squares slope of offset against reference time. Returns
    /// (drift ppm, residual RMS).
    fn regress(&self, valid: &[&DriftSample]) -> (f64, f64) {
        if valid.len() < 2 {
            return (0.0, 0.0);
        }
        // Re-origin to the first sample: absolute nanosecond counts exceed
        // f64's integer range.
        let x0 = valid[0].t_ref_ns;
        let xs: Vec<f64> = valid.iter().map(|s| (s.t_ref_ns - x0) as f64).collect();
        let ys: Vec<f64> = valid.iter().map(|s| s.offset_ns as f64).collect();
        let mx = mean(&xs);
        let my = mean(&ys);
        let mut cov = 0.0;
        let mut var = 0.0;
        for (x, y) in xs.iter().zip(ys.iter()) {
            cov += (x - mx) * (y - my);
            var += (x - mx) * (x - mx);
        }
        if var == 0.0 {
            return (0.0, 0.0);
        }
        let slope = cov / var; // ns of offset per ns of reference time
        let mut sq = 0.0;
        for (x, y) in xs.iter().zip(ys.iter()) {
            let fit = my + slope * (x - mx);
            sq += (y - fit) * (y - fit);
        }
        (slope * 1e6, (sq / xs.len() as f64).sqrt())
    }

    fn health_flags(&self, est: &Estimate, in_epoch: usize, valid: usize) -> u16 {
        let mut h = 0u16;
        if !est.ready {
            h |= health::NOT_READY;
        }
        if self.holdoff > 0 {
            h |= health::IN_HOLDOFF;
        }
        if self.reference_bad {
            h |= health::REFERENCE_BAD;
        }
        if self.step_latched {
            h |= health::STEP_DETECTED;
        }
        if self
            .ring
            .back()
            .is_some_and(|s| s.dt_ref_ns > NS_PER_SEC + self.cfg.max_dt_ref_deviation_ns)
        {
            h |= health::MISSING_TICKS;
        }
        if in_epoch > 0 {
            let invalid = in_epoch - valid;
            if (invalid as f64 / in_epoch as f64) > CONTAMINATION_RATIO {
                h |= health::WINDOW_CONTAMINATED;
            }
        }
        if est.jitter_ns_rms > MAX_JITTER_NS_RMS {
            h |= health::JITTER_TOO_HIGH;
        }
        if est.offset_stddev_ns > MAX_OFFSET_STDDEV_NS {
            h |= health::OFFSET_UNSTABLE;
        }
        h
    }
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().sum::<f64>() / v.len() as f64
}

fn stddev(v: &[f64], m: f64) -> f64 {
    if v.len() < 2 {
        return 0.0;
    }
    let var = v.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / v.len() as f64;
    var.sqrt()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn observer() -> DriftObserver {
        DriftObserver::new(ObserverConfig::default())
    }

    /// Feed `n` clean one-second samples of a clock running `ppm` fast,
    /// starting at second `start` with base offset `offset0`.
    fn feed_clean(obs: &mut DriftObserver, start: i64, n: i64, offset0: i64, ppm: f64) -> i64 {
        for k in 0..n {
            let t_ref = (start + k) * NS_PER_SEC;
            let t_clk = t_ref + offset0 + ((start + k) as f64 * ppm * 1000.0) as i64;
            obs.update(t_ref, t_clk);
        }
        start + n
    }

    #[test]
    fn test_ready_after_min_valid_samples() {
        let mut obs = observer();
        let mut t = 0;
        for i in 0..30 {
            assert!(!obs.estimate().ready, "not ready at sample {}", i);
            t = feed_clean(&mut obs, t, 1, 50_000, 100.0);
        }
        let est = obs.estimate();
        assert!(est.ready);
        assert!(est.trustworthy);
        assert_eq!(est.valid_samples, 30);
    }

    #[test]
    fn test_regression_recovers_drift() {
        let mut obs = observer();
        // 100 ppm fast clock: offset grows 100 us per second.
        feed_clean(&mut obs, 0, 60, 50_000, 100.0);
        let est = obs.estimate();
        assert!(
            (est.drift_ppm - 100.0).abs() < 1.0,
            "regression drift {} not near 100 ppm",
            est.drift_ppm
        );
        assert!(est.trustworthy);
    }

    #[test]
    fn test_mean_of_deltas_recovers_drift() {
        let mut cfg = ObserverConfig::default();
        cfg.estimation = EstimationMethod::MeanOfDeltas;
        let mut obs = DriftObserver::new(cfg);
        feed_clean(&mut obs, 0, 60, 0, 50.0);
        let est = obs.estimate();
        assert!(
            (est.drift_ppm - 50.0).abs() < 1.0,
            "mean-of-deltas drift {} not near 50 ppm",
            est.drift_ppm
        );
    }

    #[test]
    fn test_offset_spike_bumps_epoch_and_holds_off() {
        let mut obs = observer();
        let t = feed_clean(&mut obs, 0, 35, 50_000, 0.0);
        assert!(obs.estimate().trustworthy);
        let epoch_before = obs.current_epoch();

        // +2 ms excursion, well past the 1 ms step gate.
        obs.update(t * NS_PER_SEC, t * NS_PER_SEC + 2_050_000);

        let est = obs.estimate();
        assert_eq!(est.current_epoch, epoch_before + 1);
        assert_eq!(est.ticks_in_holdoff, 5);
        assert!(!est.trustworthy);

        let spike = obs.ring.back().unwrap();
        assert!(!spike.valid);
        assert_ne!(spike.flags & sample_flags::OFFSET_SPIKE, 0);
    }

    #[test]
    fn test_transient_spike_still_costs_a_fresh_epoch() {
        let mut obs = observer();
        let t = feed_clean(&mut obs, 0, 35, 50_000, 0.0);
        let epoch_before = obs.current_epoch();

        obs.update(t * NS_PER_SEC, t * NS_PER_SEC + 2_050_000);
        assert_eq!(obs.current_epoch(), epoch_before + 1);

        // Five clean samples back at the old baseline drain the holdoff,
        // but the bump stands: readiness rebuilds from zero like any other
        // contamination.
        feed_clean(&mut obs, t + 1, 5, 50_000, 0.0);
        let est = obs.estimate();
        assert_eq!(est.current_epoch, epoch_before + 1, "the bump is permanent");
        assert_eq!(est.ticks_in_holdoff, 0);
        assert!(!est.ready, "5 samples cannot re-qualify a fresh epoch");
        assert!(!est.trustworthy);

        // A full window later, trust returns in the same (new) epoch.
        feed_clean(&mut obs, t + 6, 30, 50_000, 0.0);
        let est = obs.estimate();
        assert_eq!(est.current_epoch, epoch_before + 1, "no further bumps");
        assert!(est.ready);
        assert!(est.trustworthy);
    }

    #[test]
    fn test_persistent_level_confirms_step() {
        let mut obs = observer();
        let t = feed_clean(&mut obs, 0, 35, 0, 0.0);
        let epoch_before = obs.current_epoch();

        // The offset moves to +5 ms and stays there: a real step.
        feed_clean(&mut obs, t, 10, 5_000_000, 0.0);
        let est = obs.estimate();
        assert_eq!(est.current_epoch, epoch_before + 1);
        assert!(!est.ready, "new epoch must rebuild readiness");
        // Samples at the new level are accepted as valid again.
        assert!(est.valid_samples >= 8);
    }

    #[test]
    fn test_clock_stepped_event_increments_epoch() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 35, 0, 0.0);
        let before = obs.current_epoch();
        obs.handle_event(ObserverEvent::ClockStepped);
        assert_eq!(obs.current_epoch(), before + 1);
        let est = obs.estimate();
        assert_eq!(est.ticks_in_holdoff, 5);
        assert!(!est.trustworthy);
        assert_ne!(est.health_flags & health::STEP_DETECTED, 0);
    }

    #[test]
    fn test_holdoff_implies_untrustworthy() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 0.0);
        assert!(obs.estimate().trustworthy);

        obs.handle_event(ObserverEvent::FrequencyAdjusted);
        let est = obs.estimate();
        assert_eq!(est.ticks_in_holdoff, 2);
        assert!(est.ready, "freq holdoff does not reset the window");
        assert!(!est.trustworthy);

        // Two valid updates drain the holdoff.
        feed_clean(&mut obs, 40, 2, 0, 0.0);
        assert!(obs.estimate().trustworthy);
    }

    #[test]
    fn test_reference_changed_resets_window() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 0.0);
        obs.handle_event(ObserverEvent::ReferenceChanged);
        let est = obs.estimate();
        assert!(!est.ready);
        assert_eq!(est.ticks_in_holdoff, 10);
        assert_eq!(est.valid_samples, 0);
    }

    #[test]
    fn test_reference_lost_is_informational() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 0.0);
        obs.handle_event(ObserverEvent::ReferenceLost);
        assert!(obs.estimate().trustworthy);
        obs.handle_event(ObserverEvent::ReferenceRecovered);
        assert!(obs.estimate().trustworthy);
    }

    #[test]
    fn test_dt_ref_gate() {
        let mut obs = observer();
        let t = feed_clean(&mut obs, 0, 10, 0, 0.0);
        // A 1.3 s reference interval: edge was missed, sample invalid.
        obs.update((t as f64 * 1e9 + 1.3e9) as i64, (t as f64 * 1e9 + 1.3e9) as i64);
        let s = obs.ring.back().unwrap();
        assert!(!s.valid);
        assert_ne!(s.flags & sample_flags::DT_REF_INVALID, 0);
        assert_ne!(obs.estimate().health_flags & health::MISSING_TICKS, 0);
    }

    #[test]
    fn test_drift_bound_gate() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 5, 0, 0.0);
        // 600 us of clock advance over one reference second: 600 ppm.
        obs.update(5 * NS_PER_SEC, 5 * NS_PER_SEC + 600_000);
        let s = obs.ring.back().unwrap();
        assert!(!s.valid);
        assert_ne!(s.flags & sample_flags::DRIFT_SPIKE, 0);
    }

    #[test]
    fn test_mad_rejects_outlier_rate() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 10.0);
        // One sample whose rate is ~200 ppm off the 10 ppm population but
        // under the absolute 500 ppm bound: only MAD can catch it.
        let t = 40 * NS_PER_SEC;
        let baseline = (40.0 * 10.0 * 1000.0) as i64;
        obs.update(t, t + baseline + 200_000);
        let s = obs.ring.back().unwrap();
        assert!(!s.valid, "MAD gate should reject a 200 ppm excursion");
        assert_ne!(s.flags & sample_flags::DRIFT_SPIKE, 0);
    }

    #[test]
    fn test_no_cross_epoch_statistics() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 100.0);
        obs.handle_event(ObserverEvent::ReferenceChanged);
        // New reference with a very different rate; old samples are still in
        // the ring but must not leak into the estimate.
        feed_clean(&mut obs, 100, 15, 0, -50.0);
        let est = obs.estimate();
        assert_eq!(est.valid_samples, 15);
        assert!(
            (est.drift_ppm + 50.0).abs() < 2.0,
            "estimate {} contaminated by previous epoch",
            est.drift_ppm
        );
    }

    #[test]
    fn test_ready_monotonic_within_epoch() {
        let mut obs = observer();
        let mut t = feed_clean(&mut obs, 0, 30, 0, 0.0);
        assert!(obs.estimate().ready);
        for _ in 0..200 {
            t = feed_clean(&mut obs, t, 1, 0, 0.0);
            assert!(obs.estimate().ready, "ready must not flap within an epoch");
        }
    }

    #[test]
    fn test_servo_mode_change_starts_short_holdoff() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 0.0);
        obs.handle_event(ObserverEvent::ServoModeChanged);
        let est = obs.estimate();
        assert_eq!(est.ticks_in_holdoff, 2);
        assert!(est.ready, "mode change keeps the window");
        assert!(!est.trustworthy);
    }

    #[test]
    fn test_explicit_reset_contaminates() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 0.0);
        let before = obs.current_epoch();
        obs.reset();
        assert_eq!(obs.current_epoch(), before + 1);
        assert_eq!(obs.estimate().ticks_in_holdoff, 10);
        assert!(!obs.estimate().ready);
    }

    #[test]
    fn test_warm_start_clears_without_holdoff() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 40, 0, 0.0);
        obs.handle_event(ObserverEvent::WarmStartRequested);
        let est = obs.estimate();
        assert!(!est.ready);
        assert_eq!(est.ticks_in_holdoff, 0);
        assert_eq!(est.valid_samples, 0);
    }

    #[test]
    fn test_reference_bad_flag_propagates() {
        let mut obs = observer();
        feed_clean(&mut obs, 0, 5, 0, 0.0);
        obs.set_reference_bad(true);
        assert_ne!(obs.estimate().health_flags & health::REFERENCE_BAD, 0);
        obs.set_reference_bad(false);
        assert_eq!(obs.estimate().health_flags & health::REFERENCE_BAD, 0);
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut cfg = ObserverConfig::default();
        cfg.capacity = 50;
        let mut obs = DriftObserver::new(cfg);
        feed_clean(&mut obs, 0, 200, 0, 0.0);
        assert_eq!(obs.ring.len(), 50);
        assert_eq!(obs.estimate().total_samples, 200);
    }
}
