//! Disciplining servo variants.
//!
//! Both servos share one contract: feed them the instantaneous phase error
//! and the current PHC reading, get back a `Correction`. The controller owns
//! applying the correction to the hardware and telling the observer about it.

use log::{debug, info};

use crate::config::{ServoConfig, ServoKind};
use crate::ptp::Timestamp;

/// Output of one servo iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Adjust PHC frequency to this absolute value (ppb).
    Slew(i32),
    /// Phase-step the PHC to the given time. Always bumps the observer epoch.
    Step(Timestamp),
    /// Leave the clock alone this iteration.
    Hold,
}

pub trait Servo: Send {
    /// One iteration: `offset_ns` is local minus reference (positive when the
    /// local clock is ahead), `phc_now_ns` the PHC reading at the same edge.
    fn sample(&mut self, offset_ns: i64, phc_now_ns: i64) -> Correction;

    fn reset(&mut self);

    /// Phase lock indication, per-variant criteria.
    fn is_locked(&self) -> bool;

    /// Seed the frequency accumulator with a pre-measured correction (ppb),
    /// so the first iterations start from the calibrated frequency instead
    /// of zero.
    fn prime(&mut self, freq_ppb: f64);

    /// Stop integrating while still reporting corrections; used in holdover
    /// so a stale phase error cannot wind the accumulator up.
    fn freeze(&mut self, frozen: bool);

    /// Last frequency output (ppb), for status reporting.
    fn current_ppb(&self) -> i32;
}

pub fn make_servo(cfg: &ServoConfig) -> Box<dyn Servo> {
    match cfg.kind {
        ServoKind::Pi => Box::new(PiServo::new(cfg.clone())),
        ServoKind::ThreePhase => Box::new(ThreePhaseServo::new(cfg.clone())),
    }
}

// ============================================================================
// PI SERVO
// ============================================================================

/// Classic proportional-integral servo with anti-windup.
///
/// `integral` accumulates the (negated) offset in nanoseconds; the output is
/// an absolute frequency correction `Kp*err + Ki*integral` in ppb. Priming
/// sets the integral so the zero-error output equals the calibrated
/// frequency.
pub struct PiServo {
    cfg: ServoConfig,
    integral_ns: f64,
    lock_run: u32,
    locked: bool,
    frozen: bool,
    awaiting_first: bool,
    last_ppb: i32,
}

impl PiServo {
    pub fn new(cfg: ServoConfig) -> Self {
        PiServo {
            cfg,
            integral_ns: 0.0,
            lock_run: 0,
            locked: false,
            frozen: false,
            awaiting_first: true,
            last_ppb: 0,
        }
    }
}

impl Servo for PiServo {
    fn sample(&mut self, offset_ns: i64, phc_now_ns: i64) -> Correction {
        // Startup phase error is stepped away, not slewed: draining it
        // through the integrator would take hours at these gains.
        if std::mem::take(&mut self.awaiting_first)
            && offset_ns.abs() > self.cfg.first_step_ns
        {
            info!(
                "[Servo] initial offset {:+}us, stepping",
                offset_ns / 1000
            );
            return Correction::Step(Timestamp::from_nanos(phc_now_ns - offset_ns));
        }

        // A phase error past the step threshold is not something to slew
        // away either; jump and start over.
        if offset_ns.abs() > self.cfg.step_threshold_ns {
            info!(
                "[Servo] offset {:+}us exceeds slew range, stepping",
                offset_ns / 1000
            );
            self.lock_run = 0;
            self.locked = false;
            return Correction::Step(Timestamp::from_nanos(phc_now_ns - offset_ns));
        }

        let error = -(offset_ns as f64);

        // Conditional integration: winding the accumulator while the output
        // saturates only buys a long unwind later.
        let saturated = (self.cfg.kp * error + self.cfg.ki * self.integral_ns).abs()
            >= self.cfg.max_freq_ppb as f64;
        if !self.frozen && !saturated {
            self.integral_ns = (self.integral_ns + error)
                .clamp(-self.cfg.integral_clamp_ns, self.cfg.integral_clamp_ns);
        }

        let raw = self.cfg.kp * error + self.cfg.ki * self.integral_ns;
        let max = self.cfg.max_freq_ppb as f64;
        let ppb = raw.clamp(-max, max).round() as i32;
        self.last_ppb = ppb;

        if offset_ns.abs() <= self.cfg.lock_threshold_ns {
            self.lock_run += 1;
            if self.lock_run >= self.cfg.lock_count && !self.locked {
                self.locked = true;
                info!("[Servo] phase locked at {:+}ppb", ppb);
            }
        } else {
            self.lock_run = 0;
            if self.locked {
                self.locked = false;
                info!("[Servo] phase lock lost (offset {:+}ns)", offset_ns);
            }
        }

        debug!(
            "[Servo] off={:+}ns P={:+.1} I={:+.1} out={:+}ppb",
            offset_ns,
            self.cfg.kp * error,
            self.cfg.ki * self.integral_ns,
            ppb
        );
        Correction::Slew(ppb)
    }

    fn reset(&mut self) {
        self.integral_ns = 0.0;
        self.lock_run = 0;
        self.locked = false;
        self.frozen = false;
        self.awaiting_first = true;
        self.last_ppb = 0;
    }

    fn is_locked(&self) -> bool {
        self.locked
    }

    fn prime(&mut self, freq_ppb: f64) {
        if self.cfg.ki > 0.0 {
            self.integral_ns = (freq_ppb / self.cfg.ki)
                .clamp(-self.cfg.integral_clamp_ns, self.cfg.integral_clamp_ns);
        }
        info!("[Servo] primed with {:+.1}ppb", freq_ppb);
    }

    fn freeze(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    fn current_ppb(&self) -> i32 {
        self.last_ppb
    }
}

// ============================================================================
// THREE-PHASE SERVO
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// A: absorb the startup phase error (step or proportional slew).
    OffsetCorrection,
    /// B: corrections frozen, measure the raw drift baseline.
    DriftBaseline,
    /// C: slew-only steady state with EMA frequency feedback.
    DriftEvaluation,
}

/// Experimental staged servo: correct phase, measure the residual drift with
/// the loop open, then run closed-loop on EMA-filtered frequency error.
pub struct ThreePhaseServo {
    cfg: ServoConfig,
    phase: Phase,
    freq_ppb: f64,
    freq_ema_ppb: f64,
    prev_offset_ns: Option<i64>,
    baseline_first: Option<i64>,
    baseline_count: u32,
    converge_run: u32,
    frozen: bool,
    last_ppb: i32,
}

// Phase A gain: ns of error to ppb of slew per second.
const PHASE_A_GAIN: f64 = 0.7;
// Consecutive in-threshold samples to leave phase A.
const PHASE_A_CONVERGE: u32 = 3;
// Gentle phase pull in phase C so residual offset drains to zero.
const PHASE_C_GAIN: f64 = 0.05;

impl ThreePhaseServo {
    pub fn new(cfg: ServoConfig) -> Self {
        ThreePhaseServo {
            cfg,
            phase: Phase::OffsetCorrection,
            freq_ppb: 0.0,
            freq_ema_ppb: 0.0,
            prev_offset_ns: None,
            baseline_first: None,
            baseline_count: 0,
            converge_run: 0,
            frozen: false,
            last_ppb: 0,
        }
    }

    fn clamp_out(&mut self, ppb: f64) -> Correction {
        let max = self.cfg.max_freq_ppb as f64;
        let out = ppb.clamp(-max, max).round() as i32;
        self.last_ppb = out;
        Correction::Slew(out)
    }
}

impl Servo for ThreePhaseServo {
    fn sample(&mut self, offset_ns: i64, phc_now_ns: i64) -> Correction {
        match self.phase {
            Phase::OffsetCorrection => {
                if offset_ns.abs() > self.cfg.step_threshold_ns {
                    info!(
                        "[Servo] A: offset {:+}ms, stepping",
                        offset_ns / 1_000_000
                    );
                    self.prev_offset_ns = None;
                    self.converge_run = 0;
                    return Correction::Step(Timestamp::from_nanos(phc_now_ns - offset_ns));
                }

                if offset_ns.abs() <= self.cfg.lock_threshold_ns {
                    self.converge_run += 1;
                    if self.converge_run >= PHASE_A_CONVERGE {
                        info!("[Servo] A -> B: phase absorbed, opening loop for baseline");
                        self.phase = Phase::DriftBaseline;
                        self.baseline_first = None;
                        self.baseline_count = 0;
                        self.prev_offset_ns = None;
                        return Correction::Hold;
                    }
                } else {
                    self.converge_run = 0;
                }

                self.prev_offset_ns = Some(offset_ns);
                self.clamp_out(self.freq_ppb - PHASE_A_GAIN * offset_ns as f64)
            }

            Phase::DriftBaseline => {
                // Loop is open: no corrections while the baseline accumulates.
                if self.baseline_first.is_none() {
                    self.baseline_first = Some(offset_ns);
                }
                self.baseline_count += 1;
                if self.baseline_count >= self.cfg.baseline_pulses {
                    let first = self.baseline_first.unwrap_or(offset_ns);
                    // ns of offset growth per pulse second = ppb
                    let baseline =
                        (offset_ns - first) as f64 / (self.baseline_count.max(1) as f64);
                    self.freq_ppb -= baseline;
                    self.freq_ema_ppb = 0.0;
                    self.prev_offset_ns = Some(offset_ns);
                    self.phase = Phase::DriftEvaluation;
                    info!(
                        "[Servo] B -> C: baseline {:+.1}ppb over {} pulses",
                        baseline, self.baseline_count
                    );
                    return self.clamp_out(self.freq_ppb);
                }
                Correction::Hold
            }

            Phase::DriftEvaluation => {
                if offset_ns.abs() > self.cfg.emergency_step_ns {
                    info!(
                        "[Servo] C: emergency step, offset {:+}ms",
                        offset_ns / 1_000_000
                    );
                    self.prev_offset_ns = None;
                    return Correction::Step(Timestamp::from_nanos(phc_now_ns - offset_ns));
                }

                if let Some(prev) = self.prev_offset_ns {
                    let df = (offset_ns - prev) as f64; // ns/s residual = ppb
                    let alpha = self.cfg.freq_ema_alpha;
                    self.freq_ema_ppb = alpha * df + (1.0 - alpha) * self.freq_ema_ppb;
                    if !self.frozen {
                        self.freq_ppb -= self.freq_ema_ppb * alpha;
                    }
                }
                self.prev_offset_ns = Some(offset_ns);

                let phase_pull = if self.frozen {
                    0.0
                } else {
                    PHASE_C_GAIN * offset_ns as f64
                };
                self.clamp_out(self.freq_ppb - phase_pull)
            }
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::OffsetCorrection;
        self.freq_ppb = 0.0;
        self.freq_ema_ppb = 0.0;
        self.prev_offset_ns = None;
        self.baseline_first = None;
        self.baseline_count = 0;
        self.converge_run = 0;
        self.frozen = false;
        self.last_ppb = 0;
    }

    fn is_locked(&self) -> bool {
        self.phase == Phase::DriftEvaluation
    }

    fn prime(&mut self, freq_ppb: f64) {
        self.freq_ppb = freq_ppb;
        info!("[Servo] primed with {:+.1}ppb", freq_ppb);
    }

    fn freeze(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    fn current_ppb(&self) -> i32 {
        self.last_ppb
    }
}

// ============================================================================
// TESTS
// ============================================================================
