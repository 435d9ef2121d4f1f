use serde::{Deserialize, Serialize};

/// Snapshot of the grandmaster's health, readable out-of-band.
///
/// The worker refreshes this after every processed edge and every state
/// transition; readers clone it under the lock and never see a torn update.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GrandmasterStatus {
    /// Discipline state: "RECOVERY", "LOCKED", "HOLDOVER", "NONE"
    pub state: String,

    /// PTP port state: "INITIALIZING", "LISTENING", "MASTER", "SLAVE"
    pub port_state: String,

    /// Last measured phase offset against the reference (nanoseconds)
    pub offset_ns: i64,

    /// Current drift estimate (ppm)
    pub drift_ppm: f64,

    /// Frequency correction currently applied to the PHC (ppb)
    pub applied_freq_ppb: i32,

    /// True when the servo reports phase lock
    pub servo_locked: bool,

    /// True when the drift estimate may drive frequency discipline
    pub trustworthy: bool,

    /// Observer epoch and fill level
    pub epoch: u64,
    pub valid_samples: u64,

    /// Seconds spent in HOLDOVER (0 outside it)
    pub holdover_elapsed_s: u64,

    /// Advertised clock quality
    pub clock_class: u8,
    pub clock_accuracy: u8,

    /// Satellites backing the current fix
    pub sat_count: u8,

    /// Selected remote master when the port is SLAVE
    pub selected_master: Option<String>,

    /// Emission counters
    pub announce_sent: u64,
    pub sync_sent: u64,

    /// Protocol-validation drops (domain mismatch, regression, truncation)
    pub packets_dropped: u64,

    /// Unix timestamp of last status update
    pub updated_ts: u64,
}

impl Default for GrandmasterStatus {
    fn default() -> Self {
        GrandmasterStatus {
            state: "NONE".to_string(),
            port_state: "INITIALIZING".to_string(),
            offset_ns: 0,
            drift_ppm: 0.0,
            applied_freq_ppb: 0,
            servo_locked: false,
            trustworthy: false,
            epoch: 0,
            valid_samples: 0,
            holdover_elapsed_s: 0,
            clock_class: 248,
            clock_accuracy: 0xFE,
            sat_count: 0,
            selected_master: None,
            announce_sent: 0,
            sync_sent: 0,
            packets_dropped: 0,
            updated_ts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default() {
        let status = GrandmasterStatus::default();
        assert_eq!(status.state, "NONE");
        assert_eq!(status.clock_class, 248);
        assert!(!status.trustworthy);
    }

    #[test]
    fn test_status_serde_roundtrip() {
        let mut status = GrandmasterStatus::default();
        status.state = "LOCKED".to_string();
        status.clock_class = 6;
        status.clock_accuracy = 0x21;
        status.drift_ppm = -12.25;
        status.selected_master = Some("aa:bb:cc:ff:fe:11:22:33".to_string());

        let json = serde_json::to_string(&status).expect("serialize failed");
        let restored: GrandmasterStatus = serde_json::from_str(&json).expect("deserialize failed");

        assert_eq!(restored.state, "LOCKED");
        assert_eq!(restored.clock_class, 6);
        assert!((restored.drift_ppm + 12.25).abs() < f64::EPSILON);
        assert_eq!(
            restored.selected_master.as_deref(),
            Some("aa:bb:cc:ff:fe:11:22:33")
        );
    }
}
