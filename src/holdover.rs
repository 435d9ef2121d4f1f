//! Reference-loss state machine.
//!
//! Three operating states plus the never-locked start state:
//!
//! - RECOVERY: reference present, discipline converging. Lock requires
//!   sub-100 ns phase and sub-5 ppb frequency error held for K samples.
//! - LOCKED: full discipline. A single invalid PPS or ToD sample drops to
//!   HOLDOVER. Instantaneous threshold excursions clear `is_locked()` but
//!   keep the state.
//! - HOLDOVER: frequency-only flywheel. The PPS/UTC anchor is never re-bound
//!   here; the RTC (if present) trims frequency through a minutes-scale
//!   low-pass, and a 100 ms phase guardrail demotes to pure free-run.

use log::{info, warn};

use crate::config::HoldoverConfig;

const NS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    None,
    Recovery,
    Locked,
    Holdover,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::None => "NONE",
            ControllerState::Recovery => "RECOVERY",
            ControllerState::Locked => "LOCKED",
            ControllerState::Holdover => "HOLDOVER",
        }
    }
}

/// Transition the caller must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Reset the servo, notify the observer with `ClockSlewed`, skip the
    /// first N samples from averaging.
    EnteredLocked,
    /// Freeze the servo integrator; frequency-only from here.
    EnteredHoldover,
    EnteredRecovery,
}

#[derive(Debug)]
pub struct HoldoverController {
    cfg: HoldoverConfig,
    state: ControllerState,

    consecutive_good: u32,
    stability_ok: bool,
    skip_remaining: u32,

    holdover_entered_mono_ns: Option<i64>,
    last_sync_label_sec: u64,

    // RTC secondary reference (holdover only)
    rtc_prev: Option<(i64, i64)>,
    rtc_trim_ppb: f64,
    rtc_demoted: bool,
}

impl HoldoverController {
    pub fn new(cfg: HoldoverConfig) -> Self {
        HoldoverController {
            cfg,
            state: ControllerState::None,
            consecutive_good: 0,
            stability_ok: false,
            skip_remaining: 0,
            holdover_entered_mono_ns: None,
            last_sync_label_sec: 0,
            rtc_prev: None,
            rtc_trim_ppb: 0.0,
            rtc_demoted: false,
        }
    }

    /// Feed one reference sample. `offset_ns`/`freq_err_ppb` are the current
    /// phase and frequency errors against the reference; they only matter
    /// when both validity flags hold.
    pub fn on_reference_sample(
        &mut self,
        pps_valid: bool,
        tod_valid: bool,
        offset_ns: i64,
        freq_err_ppb: f64,
        label_sec: Option<u64>,
        now_mono_ns: i64,
    ) -> Transition {
        let reference_ok = pps_valid && tod_valid;
        if reference_ok {
            if let Some(sec) = label_sec {
                self.last_sync_label_sec = sec;
            }
        }

        match self.state {
            ControllerState::None | ControllerState::Recovery => {
                if self.state == ControllerState::None && reference_ok {
                    self.state = ControllerState::Recovery;
                }
                if !reference_ok {
                    self.consecutive_good = 0;
                    return Transition::None;
                }
                if offset_ns.abs() < self.cfg.lock_offset_ns
                    && freq_err_ppb.abs() < self.cfg.lock_freq_err_ppb
                {
                    self.consecutive_good += 1;
                    if self.consecutive_good >= self.cfg.lock_count {
                        self.enter_locked();
                        return Transition::EnteredLocked;
                    }
                } else {
                    self.consecutive_good = 0;
                }
                Transition::None
            }

            ControllerState::Locked => {
                if !reference_ok {
                    self.enter_holdover(now_mono_ns, pps_valid, tod_valid);
                    return Transition::EnteredHoldover;
                }
                // Instantaneous stability; excursions do not change state.
                self.stability_ok = offset_ns.abs() < self.cfg.lock_offset_ns
                    && freq_err_ppb.abs() < self.cfg.lock_freq_err_ppb;
                Transition::None
            }

            ControllerState::Holdover => {
                if reference_ok {
                    info!("[Holdover] reference returned, re-entering recovery");
                    self.state = ControllerState::Recovery;
                    self.consecutive_good = 0;
                    self.holdover_entered_mono_ns = None;
                    self.rtc_prev = None;
                    self.rtc_demoted = false;
                    return Transition::EnteredRecovery;
                }
                Transition::None
            }
        }
    }

    /// Explicit reset: back to RECOVERY from anywhere.
    pub fn reset(&mut self) -> Transition {
        info!("[Holdover] explicit reset to recovery");
        self.state = ControllerState::Recovery;
        self.consecutive_good = 0;
        self.stability_ok = false;
        self.skip_remaining = 0;
        self.holdover_entered_mono_ns = None;
        self.rtc_prev = None;
        self.rtc_trim_ppb = 0.0;
        self.rtc_demoted = false;
        Transition::EnteredRecovery
    }

    /// RTC-vs-PHC comparison while in HOLDOVER. Returns the low-passed
    /// frequency trim (ppb, to subtract from the held frequency), or `None`
    /// once the guardrail has demoted to free-run.
    pub fn on_rtc_sample(&mut self, phc_ns: i64, rtc_ns: i64) -> Option<f64> {
        if self.state != ControllerState::Holdover || self.rtc_demoted {
            return None;
        }

        let phase_ns = phc_ns - rtc_ns;
        if phase_ns.abs() > self.cfg.rtc_guardrail_ns {
            warn!(
                "[Holdover] PHC-RTC phase {:+}ms beyond guardrail, free-running",
                phase_ns / 1_000_000
            );
            self.rtc_demoted = true;
            return None;
        }

        if let Some((prev_phc, prev_rtc)) = self.rtc_prev {
            let dt_s = (phc_ns - prev_phc) as f64 / NS_PER_SEC as f64;
            if dt_s > 0.0 {
                let raw_ppb = ((phc_ns - prev_phc) - (rtc_ns - prev_rtc)) as f64 / dt_s;
                // Very low bandwidth: the RTC is a flywheel, not a servo
                // reference.
                let alpha = (dt_s / self.cfg.rtc_filter_tau_s).min(1.0);
                self.rtc_trim_ppb += alpha * (raw_ppb - self.rtc_trim_ppb);
            }
        }
        self.rtc_prev = Some((phc_ns, rtc_ns));
        Some(self.rtc_trim_ppb)
    }

    /// True only in LOCKED with the instantaneous thresholds satisfied.
    pub fn is_locked(&self) -> bool {
        self.state == ControllerState::Locked && self.stability_ok
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn holdover_elapsed_s(&self, now_mono_ns: i64) -> u64 {
        match (self.state, self.holdover_entered_mono_ns) {
            (ControllerState::Holdover, Some(t0)) => {
                ((now_mono_ns - t0).max(0) / NS_PER_SEC) as u64
            }
            _ => 0,
        }
    }

    pub fn last_sync_label_sec(&self) -> u64 {
        self.last_sync_label_sec
    }

    /// Consume one post-lock skip credit; the first N samples after a lock
    /// are excluded from averaging.
    pub fn take_skip(&mut self) -> bool {
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------

    fn enter_locked(&mut self) {
        info!(
            "[Holdover] locked after {} qualifying samples",
            self.consecutive_good
        );
        self.state = ControllerState::Locked;
        self.stability_ok = true;
        self.skip_remaining = self.cfg.skip_after_lock;
        self.holdover_entered_mono_ns = None;
    }

    fn enter_holdover(&mut self, now_mono_ns: i64, pps_valid: bool, tod_valid: bool) {
        warn!(
            "[Holdover] reference lost (pps={} tod={}), holding frequency",
            pps_valid, tod_valid
        );
        self.state = ControllerState::Holdover;
        self.stability_ok = false;
        self.consecutive_good = 0;
        self.holdover_entered_mono_ns = Some(now_mono_ns);
        self.rtc_prev = None;
        self.rtc_trim_ppb = 0.0;
        self.rtc_demoted = false;
    }
}

// ============================================================================
// TESTS
// ============================================================================
