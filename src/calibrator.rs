//! One-shot pre-run measurement of the raw PHC frequency error.
//!
//! Runs once at startup, before the servo closes the loop: two capture
//! points N pulses apart give the uncorrected drift, which is then applied
//! as the initial frequency offset so the servo starts from a nearly-true
//! clock instead of fighting the full crystal error.

use log::{info, warn};

use crate::config::CalibratorConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationOutcome {
    /// Still accumulating pulses.
    Pending,
    /// Measured raw drift in ppm (positive = local clock fast).
    Measured(f64),
    /// Every attempt produced an implausible value.
    Failed,
}

#[derive(Debug)]
pub struct PhcCalibrator {
    cfg: CalibratorConfig,
    first: Option<(i64, i64)>,
    pulses: u32,
    attempts: u32,
    done: Option<CalibrationOutcome>,
}

impl PhcCalibrator {
    pub fn new(cfg: CalibratorConfig) -> Self {
        PhcCalibrator {
            cfg,
            first: None,
            pulses: 0,
            attempts: 0,
            done: None,
        }
    }

    /// Feed one (reference, local clock) pair captured at a PPS edge.
    pub fn feed(&mut self, t_ref_ns: i64, t_clk_ns: i64) -> CalibrationOutcome {
        if let Some(done) = self.done {
            return done;
        }

        let (ref0, clk0) = match self.first {
            None => {
                self.first = Some((t_ref_ns, t_clk_ns));
                self.pulses = 0;
                return CalibrationOutcome::Pending;
            }
            Some(p) => p,
        };

        self.pulses += 1;
        if self.pulses < self.cfg.pulses {
            return CalibrationOutcome::Pending;
        }

        let d_ref = t_ref_ns - ref0;
        let d_clk = t_clk_ns - clk0;
        if d_ref <= 0 {
            return self.retry("non-positive reference interval");
        }
        let drift_ppm = (d_clk - d_ref) as f64 / d_ref as f64 * 1e6;

        if drift_ppm.abs() > self.cfg.max_ppm {
            return self.retry(&format!("{:+.0} ppm is a sampling error", drift_ppm));
        }

        info!(
            "[Calibrator] raw clock error {:+.2} ppm over {} pulses",
            drift_ppm, self.pulses
        );
        self.done = Some(CalibrationOutcome::Measured(drift_ppm));
        CalibrationOutcome::Measured(drift_ppm)
    }

    pub fn outcome(&self) -> CalibrationOutcome {
        self.done.unwrap_or(CalibrationOutcome::Pending)
    }

    fn retry(&mut self, why: &str) -> CalibrationOutcome {
        self.attempts += 1;
        self.first = None;
        if self.attempts >= self.cfg.max_retries {
            warn!(
                "[Calibrator] giving up after {} attempts ({})",
                self.attempts, why
            );
            self.done = Some(CalibrationOutcome::Failed);
            CalibrationOutcome::Failed
        } else {
            warn!(
                "[Calibrator] measurement rejected ({}), attempt {}/{}",
                why, self.attempts, self.cfg.max_retries
            );
            CalibrationOutcome::Pending
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
