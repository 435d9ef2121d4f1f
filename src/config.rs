use serde::{Deserialize, Serialize};

/// Full tuning surface. Every section has auto-optimized defaults; the JSON
/// config file only needs the fields the operator wants to override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub binder: BinderConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub calibrator: CalibratorConfig,
    #[serde(default)]
    pub servo: ServoConfig,
    #[serde(default)]
    pub holdover: HoldoverConfig,
    #[serde(default)]
    pub ptp: PtpConfig,
    #[serde(default)]
    pub rtc: RtcConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinderConfig {
    /// Consecutive consistent ToD observations required to latch the base pair.
    pub lock_observations: u32,
    /// A ToD arrival inconsistent with the latched policy by more than this
    /// invalidates one observation.
    pub policy_tolerance_ms: i64,
    /// Consecutive inconsistent observations before the lock is dropped.
    pub bad_streak_limit: u32,
    /// ToD silence beyond this raises REFERENCE_LOST (informational).
    pub tod_gap_secs: u64,
}

impl Default for BinderConfig {
    fn default() -> Self {
        BinderConfig {
            lock_observations: 5,
            policy_tolerance_ms: 400,
            bad_streak_limit: 3,
            tod_gap_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimationMethod {
    /// Linear regression of offset against reference time (preferred).
    Regression,
    /// Arithmetic mean of per-sample drift values (lower latency).
    MeanOfDeltas,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub capacity: usize,
    pub min_valid_samples: usize,
    /// Offset jump beyond this is a step, not noise: flag, invalidate,
    /// bump the epoch.
    pub max_offset_step_ns: i64,
    /// Acceptable deviation of dt_ref from the nominal 1 s PPS period.
    pub max_dt_ref_deviation_ns: i64,
    /// Instantaneous drift beyond this is physically implausible.
    pub max_drift_ppm: f64,
    pub outlier_mad_sigma: f64,
    /// Trust gate: estimate stddev must stay under this.
    pub max_drift_stddev_ppm: f64,
    pub holdoff_after_step_ticks: u32,
    pub holdoff_after_freq_ticks: u32,
    pub holdoff_after_ref_ticks: u32,
    pub estimation: EstimationMethod,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            capacity: 120,
            min_valid_samples: 30,
            max_offset_step_ns: 1_000_000,
            max_dt_ref_deviation_ns: 2_000_000,
            max_drift_ppm: 500.0,
            outlier_mad_sigma: 4.5,
            max_drift_stddev_ppm: 5.0,
            holdoff_after_step_ticks: 5,
            holdoff_after_freq_ticks: 2,
            holdoff_after_ref_ticks: 10,
            estimation: EstimationMethod::Regression,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibratorConfig {
    /// Pulses between the two capture points.
    pub pulses: u32,
    /// Measurements beyond this are sampling errors, not crystal error.
    pub max_ppm: f64,
    pub max_retries: u32,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        CalibratorConfig {
            pulses: 20,
            max_ppm: 2000.0,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServoKind {
    Pi,
    ThreePhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoConfig {
    pub kind: ServoKind,
    pub kp: f64,
    pub ki: f64,
    /// Anti-windup clamp on the integral term (ns).
    pub integral_clamp_ns: f64,
    pub max_freq_ppb: i32,
    /// Phase-lock: |offset| at or under this...
    pub lock_threshold_ns: i64,
    /// ...for this many consecutive samples.
    pub lock_count: u32,
    /// First sample after a reset: step instead of slewing past this offset.
    /// Slewing a large phase error leaves a residual the integrator takes
    /// hours to drain.
    pub first_step_ns: i64,
    /// Step instead of slewing when the offset exceeds this.
    pub step_threshold_ns: i64,
    /// Three-phase: emergency step bound during drift evaluation.
    pub emergency_step_ns: i64,
    /// Three-phase: pulses accumulated for the drift baseline.
    pub baseline_pulses: u32,
    /// Three-phase: EMA weight for frequency-error feedback.
    pub freq_ema_alpha: f64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kind: ServoKind::Pi,
            kp: 0.7,
            ki: 3e-5,
            integral_clamp_ns: 1e10,
            max_freq_ppb: 500_000,
            lock_threshold_ns: 1_000,
            lock_count: 10,
            first_step_ns: 20_000,
            step_threshold_ns: 100_000_000,
            emergency_step_ns: 500_000_000,
            baseline_pulses: 20,
            freq_ema_alpha: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldoverConfig {
    /// RECOVERY -> LOCKED: |offset| under this...
    pub lock_offset_ns: i64,
    /// ...and |freq error| under this...
    pub lock_freq_err_ppb: f64,
    /// ...for this many consecutive samples.
    pub lock_count: u32,
    /// Samples excluded from averaging right after reaching LOCKED.
    pub skip_after_lock: u32,
    /// Holdover age at which clockClass degrades from 7 to 187.
    pub degrade_secs: u64,
    /// PHC vs RTC phase error beyond this demotes to free-run hold.
    pub rtc_guardrail_ns: i64,
    /// Time constant of the RTC secondary-reference low-pass (seconds).
    pub rtc_filter_tau_s: f64,
}

impl Default for HoldoverConfig {
    fn default() -> Self {
        HoldoverConfig {
            lock_offset_ns: 100,
            lock_freq_err_ppb: 5.0,
            lock_count: 10,
            skip_after_lock: 5,
            degrade_secs: 3600,
            rtc_guardrail_ns: 100_000_000,
            rtc_filter_tau_s: 600.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtpConfig {
    pub domain: u8,
    pub priority1: u8,
    pub priority2: u8,
    pub announce_interval_ms: u64,
    pub sync_interval_ms: u64,
    /// logMessageInterval carried in Announce.
    pub announce_log_interval: i8,
    /// logMessageInterval carried in Sync.
    pub sync_log_interval: i8,
    pub current_utc_offset: i16,
    pub foreign_capacity: usize,
    /// Foreign masters age out after this many announce intervals.
    pub announce_timeout_multiplier: u32,
}

impl Default for PtpConfig {
    fn default() -> Self {
        PtpConfig {
            domain: 0,
            priority1: 128,
            priority2: 128,
            announce_interval_ms: 1000,
            sync_interval_ms: 125,
            announce_log_interval: 0,
            sync_log_interval: -3,
            current_utc_offset: 37,
            foreign_capacity: 4,
            announce_timeout_multiplier: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    pub sample_interval_s: u64,
    pub capacity: usize,
    pub min_samples: usize,
    pub min_adjust_interval_s: u64,
    pub max_drift_stddev_ppm: f64,
    /// Aging register granularity.
    pub ppm_per_lsb: f64,
    pub max_lsb_step: i8,
}

impl Default for RtcConfig {
    fn default() -> Self {
        RtcConfig {
            sample_interval_s: 10,
            capacity: 120,
            min_samples: 60,
            min_adjust_interval_s: 1200,
            max_drift_stddev_ppm: 0.3,
            ppm_per_lsb: 0.1,
            max_lsb_step: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// No PPS within this window at startup is fatal (exit code 3).
    pub startup_grace_secs: u64,
    /// Edge-to-PHC-read latency beyond this flags the sample.
    pub max_sampling_latency_ns: i64,
    pub queue_depth: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        EdgeConfig {
            startup_grace_secs: 30,
            max_sampling_latency_ns: 10_000_000,
            queue_depth: 8,
        }
    }
}
