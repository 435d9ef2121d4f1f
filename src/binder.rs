//! PPS / time-of-day association.
//!
//! The serial ToD stream reports an integer UTC second with tens to hundreds
//! of milliseconds of latency after the PPS edge it describes. Reading "the
//! latest ToD" at each edge therefore races the serial arrival and produces
//! ±1 s labels. The binder resolves the ambiguity ONCE, by watching the
//! arrival latency settle into a stable half-second bucket, and from then on
//! derives every label arithmetically from a latched `(base_seq,
//! base_utc_sec)` pair. Seconds keep getting synthesized through ToD gaps;
//! only a step correction or a sustained policy violation forces a re-lock.

use log::{debug, info, warn};

use crate::config::BinderConfig;

const NS_PER_SEC: i64 = 1_000_000_000;
const HALF_SEC_NS: i64 = 500_000_000;

/// Which edge a ToD sentence describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelPolicy {
    /// Typical: the sentence arrives 100-700 ms after the edge it labels.
    LabelsLastPps,
    /// The sentence precedes its edge (arrives late in the prior second).
    LabelsNextPps,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    policy: LabelPolicy,
    base_seq: u32,
    base_utc_sec: u64,
    dt_ns: i64,
    streak: u32,
}

#[derive(Debug)]
pub struct ReferenceBinder {
    cfg: BinderConfig,

    /// Most recent edge seen, (seq, monotonic ns).
    last_pps: Option<(u32, i64)>,

    /// Latched base pair; labels are synthesized from this.
    base: Option<(u32, u64)>,
    policy: Option<LabelPolicy>,
    latched_dt_ns: i64,

    candidate: Option<Candidate>,
    bad_streak: u32,

    last_tod_mono_ns: Option<i64>,
    reference_bad: bool,
    reference_lost: bool,
}

impl ReferenceBinder {
    pub fn new(cfg: BinderConfig) -> Self {
        ReferenceBinder {
            cfg,
            last_pps: None,
            base: None,
            policy: None,
            latched_dt_ns: 0,
            candidate: None,
            bad_streak: 0,
            last_tod_mono_ns: None,
            reference_bad: false,
            reference_lost: false,
        }
    }

    /// Record the monotonic timestamp of the Nth edge.
    pub fn observe_pps(&mut self, seq: u32, t_mono_ns: i64) {
        if let Some((prev_seq, _)) = self.last_pps {
            debug_assert!(seq > prev_seq, "PPS sequence must be monotonic");
        }
        self.last_pps = Some((seq, t_mono_ns));
    }

    /// Record a parsed ToD sentence and its arrival time.
    pub fn observe_tod(&mut self, utc_sec: u64, t_mono_ns: i64) {
        self.last_tod_mono_ns = Some(t_mono_ns);
        self.reference_lost = false;

        let (pps_seq, pps_mono) = match self.last_pps {
            Some(p) => p,
            None => return, // nothing to classify against yet
        };

        let dt = t_mono_ns - pps_mono;
        if dt < 0 || dt >= NS_PER_SEC {
            // Arrival does not fall inside the current PPS period: either the
            // edge stream stalled or the serial line is backed up.
            debug!("[Binder] ToD arrival dt={}ms outside period", dt / 1_000_000);
            self.note_inconsistent();
            return;
        }

        let policy = if dt < HALF_SEC_NS {
            LabelPolicy::LabelsLastPps
        } else {
            LabelPolicy::LabelsNextPps
        };
        let labeled_seq = match policy {
            LabelPolicy::LabelsLastPps => pps_seq,
            LabelPolicy::LabelsNextPps => pps_seq + 1,
        };

        if self.base.is_some() {
            self.check_locked(policy, labeled_seq, utc_sec, dt);
        } else {
            self.advance_candidate(policy, labeled_seq, utc_sec, dt);
        }
    }

    /// `base_utc_sec + (seq - base_seq)` once locked.
    pub fn label_for(&self, seq: u32) -> Option<u64> {
        let (base_seq, base_utc) = self.base?;
        let label = base_utc as i64 + (seq as i64 - base_seq as i64);
        if label < 0 {
            return None;
        }
        Some(label as u64)
    }

    /// A step correction moved the local timescale: the anchor is void.
    pub fn on_step(&mut self) {
        if self.base.is_some() {
            info!("[Binder] step applied, base pair invalidated");
        }
        self.base = None;
        self.policy = None;
        self.candidate = None;
        self.bad_streak = 0;
    }

    /// Periodic housekeeping; detects ToD stream gaps.
    pub fn tick(&mut self, now_mono_ns: i64) {
        if let Some(last) = self.last_tod_mono_ns {
            let gap = now_mono_ns - last;
            if gap > self.cfg.tod_gap_secs as i64 * NS_PER_SEC && !self.reference_lost {
                // Informational: labels continue from the base pair.
                warn!("[Binder] ToD silent for {}s, synthesizing seconds", gap / NS_PER_SEC);
                self.reference_lost = true;
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.base.is_some()
    }

    pub fn reference_bad(&self) -> bool {
        self.reference_bad
    }

    pub fn reference_lost(&self) -> bool {
        self.reference_lost
    }

    // ------------------------------------------------------------------

    fn check_locked(&mut self, policy: LabelPolicy, labeled_seq: u32, utc_sec: u64, dt: i64) {
        let tolerance = self.cfg.policy_tolerance_ms * 1_000_000;
        let dt_ok = (dt - self.latched_dt_ns).abs() <= tolerance;
        let label_ok = self.label_for(labeled_seq) == Some(utc_sec);

        if dt_ok && label_ok && Some(policy) == self.policy {
            self.bad_streak = 0;
            self.reference_bad = false;
            return;
        }

        self.note_inconsistent();
        debug!(
            "[Binder] inconsistent ToD: dt={}ms (latched {}ms), label {} expected {:?}, streak {}",
            dt / 1_000_000,
            self.latched_dt_ns / 1_000_000,
            utc_sec,
            self.label_for(labeled_seq),
            self.bad_streak
        );
    }

    fn note_inconsistent(&mut self) {
        self.bad_streak += 1;
        if self.base.is_some() && self.bad_streak >= self.cfg.bad_streak_limit {
            warn!(
                "[Binder] {} consecutive inconsistent ToD observations, dropping lock",
                self.bad_streak
            );
            self.base = None;
            self.policy = None;
            self.candidate = None;
            self.bad_streak = 0;
            self.reference_bad = true;
        }
    }

    fn advance_candidate(&mut self, policy: LabelPolicy, labeled_seq: u32, utc_sec: u64, dt: i64) {
        let continues = self.candidate.is_some_and(|c| {
            policy == c.policy
                && (dt - c.dt_ns).abs() < HALF_SEC_NS
                && c.base_utc_sec as i64 + (labeled_seq as i64 - c.base_seq as i64)
                    == utc_sec as i64
        });

        match self.candidate.as_mut() {
            Some(c) if continues => {
                c.streak += 1;
                c.dt_ns = dt;
                if c.streak >= self.cfg.lock_observations {
                    let c = *c;
                    self.base = Some((c.base_seq, c.base_utc_sec));
                    self.policy = Some(c.policy);
                    self.latched_dt_ns = c.dt_ns;
                    self.candidate = None;
                    self.bad_streak = 0;
                    self.reference_bad = false;
                    info!(
                        "[Binder] locked: seq {} = UTC {} ({:?}, dt {}ms)",
                        c.base_seq,
                        c.base_utc_sec,
                        c.policy,
                        c.dt_ns / 1_000_000
                    );
                }
            }
            _ => {
                self.candidate = Some(Candidate {
                    policy,
                    base_seq: labeled_seq,
                    base_utc_sec: utc_sec,
                    dt_ns: dt,
                    streak: 1,
                });
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn binder() -> ReferenceBinder {
        ReferenceBinder::new(BinderConfig::default())
    }

    /// Feed one PPS-then-ToD second with the given serial latency.
    fn feed_second(b: &mut ReferenceBinder, seq: u32, utc: u64, dt_ms: i64) {
        let edge_mono = seq as i64 * 1_000_000_000;
        b.observe_pps(seq, edge_mono);
        b.observe_tod(utc, edge_mono + dt_ms * 1_000_000);
    }

    #[test]
    fn test_locks_after_n_consistent_observations() {
        let mut b = binder();
        for i in 0..5u32 {
            assert!(!b.is_locked(), "must not lock before {} observations", 5);
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }
        assert!(b.is_locked());
        assert_eq!(b.label_for(0), Some(1_700_000_000));
        assert_eq!(b.label_for(10), Some(1_700_000_010));
    }

    #[test]
    fn test_label_arithmetic_law() {
        let mut b = binder();
        for i in 0..5u32 {
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }
        // label(e_j) - label(e_i) == e_j.seq - e_i.seq
        for (i, j) in [(2u32, 7u32), (0, 100), (50, 51)] {
            let li = b.label_for(i).unwrap();
            let lj = b.label_for(j).unwrap();
            assert_eq!(lj - li, (j - i) as u64);
        }
    }

    #[test]
    fn test_alternating_labels_do_not_lock() {
        let mut b = binder();
        // First four ToDs flip between T and T+1 (the startup race).
        for i in 0..4u32 {
            let utc = 1_700_000_000 + i as u64 + (i % 2) as u64;
            feed_second(&mut b, i, utc, 250);
            assert!(!b.is_locked(), "ambiguous labels must not lock");
        }
        // Then five consistent observations lock with the correct base.
        for i in 4..9u32 {
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }
        assert!(b.is_locked());
        assert_eq!(b.label_for(9), Some(1_700_000_009));
    }

    #[test]
    fn test_next_pps_policy() {
        let mut b = binder();
        // Sentence arrives 800 ms after the edge: it describes the NEXT edge.
        for i in 0..5u32 {
            feed_second(&mut b, i, 1_700_000_001 + i as u64, 800);
        }
        assert!(b.is_locked());
        // seq i+1 carries label 1_700_000_001 + i
        assert_eq!(b.label_for(1), Some(1_700_000_001));
        assert_eq!(b.label_for(5), Some(1_700_000_005));
    }

    #[test]
    fn test_step_forces_relock() {
        let mut b = binder();
        for i in 0..5u32 {
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }
        assert!(b.is_locked());

        b.on_step();
        assert!(!b.is_locked());
        assert_eq!(b.label_for(5), None);

        for i in 5..10u32 {
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }
        assert!(b.is_locked());
        assert_eq!(b.label_for(10), Some(1_700_000_010));
    }

    #[test]
    fn test_policy_violation_streak_drops_lock() {
        let mut b = binder();
        for i in 0..5u32 {
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }
        assert!(b.is_locked());

        // dt jumps by 450 ms (past the 400 ms tolerance) and the labels no
        // longer line up: after bad_streak_limit observations the lock drops.
        for i in 5..8u32 {
            feed_second(&mut b, i, 1_700_000_005 + i as u64, 700);
        }
        assert!(!b.is_locked());
        assert!(b.reference_bad());
    }

    #[test]
    fn test_single_glitch_does_not_drop_lock() {
        let mut b = binder();
        for i in 0..5u32 {
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }

        // One delayed sentence, then back to normal.
        feed_second(&mut b, 5, 1_700_000_006, 700);
        assert!(b.is_locked());
        feed_second(&mut b, 6, 1_700_000_006, 250);
        assert!(b.is_locked());
        assert!(!b.reference_bad());
    }

    #[test]
    fn test_tod_gap_raises_reference_lost_but_keeps_base() {
        let mut b = binder();
        for i in 0..5u32 {
            feed_second(&mut b, i, 1_700_000_000 + i as u64, 250);
        }

        // 12 s with no ToD sentence.
        let now = 4 * 1_000_000_000 + 12_000_000_000;
        b.tick(now);
        assert!(b.reference_lost());
        assert!(b.is_locked(), "base pair survives a ToD gap");
        assert_eq!(b.label_for(16), Some(1_700_000_016));

        // Next sentence clears the flag.
        b.observe_pps(17, 17_000_000_000);
        b.observe_tod(1_700_000_017, 17_000_000_000 + 250_000_000);
        assert!(!b.reference_lost());
    }
}
