//! Controller state to advertised clock quality.
//!
//! Pure mapping per IEEE 1588-2019 Tables 5-6. The emitter consumes the
//! result as a snapshot; nothing here mutates state, so an Announce can never
//! advertise a reference better than the controller's current state.

use crate::holdover::ControllerState;
use crate::ptp::ClockQuality;

// clockAccuracy codes
const ACC_25NS: u8 = 0x21;
const ACC_1MS: u8 = 0x27;
const ACC_250MS: u8 = 0x31;
const ACC_1S: u8 = 0x32;
const ACC_UNKNOWN: u8 = 0xFE;

/// Reference conditions backing a LOCKED state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceInfo {
    pub pps_present: bool,
    pub sat_count: u8,
}

pub fn map_clock_quality(
    state: ControllerState,
    holdover_elapsed_s: u64,
    degrade_secs: u64,
    reference: ReferenceInfo,
) -> ClockQuality {
    match state {
        ControllerState::Locked => {
            if reference.pps_present && reference.sat_count >= 4 {
                ClockQuality {
                    clock_class: 6,
                    clock_accuracy: ACC_25NS,
                    offset_scaled_log_variance: 0x4E00,
                }
            } else if reference.sat_count >= 3 {
                // ToD only: second labels are good, edge phase is not.
                ClockQuality {
                    clock_class: 6,
                    clock_accuracy: ACC_1MS,
                    offset_scaled_log_variance: 0x5A00,
                }
            } else {
                // Locked on a fix too thin to license either class-6 row.
                ClockQuality {
                    clock_class: 248,
                    clock_accuracy: ACC_UNKNOWN,
                    offset_scaled_log_variance: 0xFFFF,
                }
            }
        }
        ControllerState::Holdover => {
            if holdover_elapsed_s < degrade_secs {
                ClockQuality {
                    clock_class: 7,
                    clock_accuracy: ACC_250MS,
                    offset_scaled_log_variance: 0x7000,
                }
            } else {
                ClockQuality {
                    clock_class: 187,
                    clock_accuracy: ACC_1S,
                    offset_scaled_log_variance: 0x8000,
                }
            }
        }
        ControllerState::None | ControllerState::Recovery => ClockQuality {
            clock_class: 248,
            clock_accuracy: ACC_UNKNOWN,
            offset_scaled_log_variance: 0xFFFF,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gps_fix() -> ReferenceInfo {
        ReferenceInfo {
            pps_present: true,
            sat_count: 8,
        }
    }

    #[test]
    fn test_locked_with_pps_and_sats() {
        let q = map_clock_quality(ControllerState::Locked, 0, 3600, gps_fix());
        assert_eq!(q.clock_class, 6);
        assert_eq!(q.clock_accuracy, 0x21);
        assert_eq!(q.offset_scaled_log_variance, 0x4E00);
    }

    #[test]
    fn test_locked_tod_only() {
        let reference = ReferenceInfo {
            pps_present: false,
            sat_count: 3,
        };
        let q = map_clock_quality(ControllerState::Locked, 0, 3600, reference);
        assert_eq!(q.clock_class, 6);
        assert_eq!(q.clock_accuracy, 0x27);
        assert_eq!(q.offset_scaled_log_variance, 0x5A00);
    }

    #[test]
    fn test_locked_with_too_few_satellites_claims_nothing() {
        // Neither class-6 row is licensed below 3 satellites, with or
        // without a PPS edge stream.
        for (pps, sats) in [(false, 0), (false, 2), (true, 2), (true, 0)] {
            let reference = ReferenceInfo {
                pps_present: pps,
                sat_count: sats,
            };
            let q = map_clock_quality(ControllerState::Locked, 0, 3600, reference);
            assert_eq!(
                (q.clock_class, q.clock_accuracy, q.offset_scaled_log_variance),
                (248, 0xFE, 0xFFFF),
                "pps={} sats={}",
                pps,
                sats
            );
        }
    }

    #[test]
    fn test_holdover_fresh_and_degraded() {
        let q = map_clock_quality(ControllerState::Holdover, 600, 3600, gps_fix());
        assert_eq!((q.clock_class, q.clock_accuracy), (7, 0x31));
        assert_eq!(q.offset_scaled_log_variance, 0x7000);

        let q = map_clock_quality(ControllerState::Holdover, 3601, 3600, gps_fix());
        assert_eq!((q.clock_class, q.clock_accuracy), (187, 0x32));
        assert_eq!(q.offset_scaled_log_variance, 0x8000);
    }

    #[test]
    fn test_boundary_at_degrade_threshold() {
        let q = map_clock_quality(ControllerState::Holdover, 3599, 3600, gps_fix());
        assert_eq!(q.clock_class, 7);
        let q = map_clock_quality(ControllerState::Holdover, 3600, 3600, gps_fix());
        assert_eq!(q.clock_class, 187);
    }

    #[test]
    fn test_never_locked() {
        for state in [ControllerState::None, ControllerState::Recovery] {
            let q = map_clock_quality(state, 0, 3600, ReferenceInfo::default());
            assert_eq!(q.clock_class, 248);
            assert_eq!(q.clock_accuracy, 0xFE);
            assert_eq!(q.offset_scaled_log_variance, 0xFFFF);
        }
    }
}
