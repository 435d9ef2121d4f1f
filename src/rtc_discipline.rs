//! Long-window RTC aging discipline.
//!
//! Orthogonal to the main servo: while the PHC is disciplined by GPS, the
//! RTC's own crystal slowly reveals its aging error against it. This module
//! integrates that error over tens of minutes and, when the measurement is
//! quiet enough, writes a one-shot trim to the RTC's aging-offset register
//! so the next holdover starts from a better flywheel.
//!
//! Aging polarity: a positive register delta slows the oscillator, so a
//! measured positive drift (RTC fast) maps to a positive LSB delta. Boards
//! with the opposite response flip the sign in `lsb_delta`.

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::VecDeque;

use crate::config::RtcConfig;
use crate::traits::Rtc;

const NS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug)]
pub struct RtcDiscipline {
    cfg: RtcConfig,
    samples: VecDeque<f64>,
    prev: Option<(i64, i64)>,
    last_sample_mono_ns: Option<i64>,
    last_adjust_mono_ns: Option<i64>,
}

impl RtcDiscipline {
    pub fn new(cfg: RtcConfig) -> Self {
        let capacity = cfg.capacity;
        RtcDiscipline {
            cfg,
            samples: VecDeque::with_capacity(capacity),
            prev: None,
            last_sample_mono_ns: None,
            last_adjust_mono_ns: None,
        }
    }

    /// Compare RTC and disciplined PHC. Rate-limited to the configured
    /// cadence; a phase step of a second or more between the two wipes the
    /// window.
    pub fn sample(&mut self, rtc_ns: i64, phc_ns: i64, now_mono_ns: i64) {
        if let Some(last) = self.last_sample_mono_ns {
            if now_mono_ns - last < self.cfg.sample_interval_s as i64 * NS_PER_SEC {
                return;
            }
        }
        self.last_sample_mono_ns = Some(now_mono_ns);

        if (rtc_ns - phc_ns).abs() >= NS_PER_SEC {
            warn!(
                "[RTC] step of {:+}s against reference, resetting window",
                (rtc_ns - phc_ns) / NS_PER_SEC
            );
            self.samples.clear();
            self.prev = None;
            return;
        }

        if let Some((prev_rtc, prev_phc)) = self.prev {
            let d_phc = phc_ns - prev_phc;
            if d_phc > 0 {
                let drift_ppm = ((rtc_ns - prev_rtc) - d_phc) as f64 / d_phc as f64 * 1e6;
                if self.samples.len() == self.cfg.capacity {
                    self.samples.pop_front();
                }
                self.samples.push_back(drift_ppm);
                debug!(
                    "[RTC] drift {:+.3} ppm ({} samples)",
                    drift_ppm,
                    self.samples.len()
                );
            }
        }
        self.prev = Some((rtc_ns, phc_ns));
    }

    /// All three gates: enough samples, enough time since the last write,
    /// quiet enough measurement.
    pub fn should_adjust(&self, now_mono_ns: i64) -> bool {
        if self.samples.len() < self.cfg.min_samples {
            return false;
        }
        if let Some(last) = self.last_adjust_mono_ns {
            if now_mono_ns - last < self.cfg.min_adjust_interval_s as i64 * NS_PER_SEC {
                return false;
            }
        }
        self.stddev() < self.cfg.max_drift_stddev_ppm
    }

    /// Quantized register delta for the measured mean drift.
    pub fn lsb_delta(&self) -> i8 {
        let steps = (self.mean() / self.cfg.ppm_per_lsb).round();
        let max = self.cfg.max_lsb_step as f64;
        steps.clamp(-max, max) as i8
    }

    /// Write the trim and reset the window. A saturating add keeps the
    /// register inside its i8 range.
    pub fn apply<R: Rtc>(&mut self, rtc: &mut R, now_mono_ns: i64) -> Result<()> {
        let delta = self.lsb_delta();
        if delta != 0 {
            let current = rtc.read_aging()?;
            let new = current.saturating_add(delta);
            rtc.write_aging(new)?;
            info!(
                "[RTC] aging trim {:+} LSB ({} -> {}), mean drift {:+.2} ppm",
                delta,
                current,
                new,
                self.mean()
            );
        }
        self.samples.clear();
        self.prev = None;
        self.last_adjust_mono_ns = Some(now_mono_ns);
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    fn stddev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let m = self.mean();
        let var = self.samples.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / n as f64;
        var.sqrt()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockRtc;
    use mockall::predicate::eq;

    fn discipline() -> RtcDiscipline {
        RtcDiscipline::new(RtcConfig::default())
    }

    /// Push `n` pre-cooked drift samples straight into the window.
    fn seed(d: &mut RtcDiscipline, values: &[f64]) {
        for v in values {
            d.samples.push_back(*v);
        }
    }

    /// Alternating values around `mean` with spread `amp` (stddev == amp).
    fn alternating(n: usize, mean: f64, amp: f64) -> Vec<f64> {
        (0..n)
            .map(|i| if i % 2 == 0 { mean + amp } else { mean - amp })
            .collect()
    }

    #[test]
    fn test_sampling_computes_drift() {
        let mut d = discipline();
        // RTC gains 5 us per 10 s interval: 0.5 ppm.
        for i in 0..10i64 {
            let phc = i * 10 * NS_PER_SEC;
            let rtc = phc + i * 5_000;
            d.sample(rtc, phc, i * 10 * NS_PER_SEC);
        }
        assert_eq!(d.sample_count(), 9);
        assert!((d.mean() - 0.5).abs() < 0.01, "mean {} ppm", d.mean());
    }

    #[test]
    fn test_rate_limiting() {
        let mut d = discipline();
        d.sample(0, 0, 0);
        // 3 s later: ignored, the cadence is 10 s.
        d.sample(3 * NS_PER_SEC, 3 * NS_PER_SEC, 3 * NS_PER_SEC);
        assert_eq!(d.sample_count(), 0);
        assert_eq!(d.prev, Some((0, 0)));
    }

    #[test]
    fn test_threshold_gates() {
        let mut d = discipline();

        // 59 samples: below min_samples regardless of quality.
        seed(&mut d, &alternating(59, 0.5, 0.2));
        assert!(!d.should_adjust(0));

        // The 60th opens the gate (stddev 0.2 < 0.3, no prior adjustment).
        d.samples.push_back(0.5);
        assert!(d.should_adjust(0));
        assert_eq!(d.lsb_delta(), 3, "0.5 ppm / 0.1 ppm per LSB clamps to +3");
    }

    #[test]
    fn test_noisy_window_blocks_adjustment() {
        let mut d = discipline();
        seed(&mut d, &alternating(60, 0.5, 0.6));
        assert!(!d.should_adjust(0), "stddev 0.6 must block the write");
    }

    #[test]
    fn test_adjust_interval_enforced() {
        let mut d = discipline();
        seed(&mut d, &alternating(60, 0.2, 0.1));
        let mut rtc = MockRtc::new();
        rtc.expect_read_aging().returning(|| Ok(0));
        rtc.expect_write_aging().with(eq(2)).returning(|_| Ok(()));
        d.apply(&mut rtc, 0).unwrap();
        assert_eq!(d.sample_count(), 0, "window cleared after write");

        seed(&mut d, &alternating(60, 0.2, 0.1));
        assert!(!d.should_adjust(600 * NS_PER_SEC), "1200 s not yet elapsed");
        assert!(d.should_adjust(1200 * NS_PER_SEC));
    }

    #[test]
    fn test_lsb_clamp_and_sign() {
        let mut d = discipline();
        seed(&mut d, &alternating(60, -1.5, 0.1));
        assert_eq!(d.lsb_delta(), -3, "-15 steps clamps to -3");

        d.samples.clear();
        seed(&mut d, &alternating(60, 0.17, 0.05));
        assert_eq!(d.lsb_delta(), 2, "0.17 ppm rounds to +2 LSB");
    }

    #[test]
    fn test_step_resets_window() {
        let mut d = discipline();
        for i in 0..5i64 {
            let t = i * 10 * NS_PER_SEC;
            d.sample(t, t, t);
        }
        assert!(d.sample_count() > 0);

        // RTC jumps 2 s relative to the reference.
        d.sample(
            52 * NS_PER_SEC,
            50 * NS_PER_SEC,
            50 * NS_PER_SEC,
        );
        assert_eq!(d.sample_count(), 0);
    }

    #[test]
    fn test_apply_writes_saturating_register() {
        let mut d = discipline();
        seed(&mut d, &alternating(60, 0.3, 0.05));
        let mut rtc = MockRtc::new();
        rtc.expect_read_aging().returning(|| Ok(126));
        // 126 + 3 saturates at 127.
        rtc.expect_write_aging().with(eq(127)).returning(|_| Ok(()));
        d.apply(&mut rtc, 0).unwrap();
    }

    #[test]
    fn test_apply_skips_write_for_zero_delta() {
        let mut d = discipline();
        seed(&mut d, &alternating(60, 0.01, 0.005));
        assert_eq!(d.lsb_delta(), 0);
        let mut rtc = MockRtc::new();
        // No expectations: any register access would panic the mock.
        d.apply(&mut rtc, 0).unwrap();
        assert_eq!(d.sample_count(), 0);
    }
}
