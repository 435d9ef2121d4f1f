//! Best Master Clock Algorithm and foreign master bookkeeping.
//!
//! The comparator is a plain lexicographic ordering over
//! `(priority1, clockClass, clockAccuracy, offsetScaledLogVariance,
//! priority2, clockIdentity)`, lower wins. It runs on every received
//! Announce and on the periodic tick; unchanged winners produce no state
//! change, so transitions are idempotent.

use log::{debug, info};
use std::net::SocketAddr;

use crate::ptp::{AnnounceBody, ClockIdentity, ClockQuality, Header};

// ============================================================================
// FOREIGN MASTER TABLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignMaster {
    pub clock_identity: ClockIdentity,
    pub source_address: SocketAddr,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_quality: ClockQuality,
    pub steps_removed: u16,
    pub time_source: u8,
    pub last_announce_time_ns: i64,
    pub last_sequence_id: u16,
    pub valid: bool,
}

/// Why an Announce was not taken into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceDrop {
    DomainMismatch,
    SequenceRegression,
}

/// Bounded set of observed remote masters. On overflow the slot with the
/// oldest Announce is reused; entries age out at N announce intervals.
#[derive(Debug)]
pub struct ForeignMasterTable {
    slots: Vec<Option<ForeignMaster>>,
    timeout_ns: i64,
    domain: u8,
    pub dropped: u64,
}

impl ForeignMasterTable {
    pub fn new(capacity: usize, domain: u8, announce_interval_ms: u64, multiplier: u32) -> Self {
        ForeignMasterTable {
            slots: vec![None; capacity],
            timeout_ns: announce_interval_ms as i64 * 1_000_000 * multiplier as i64,
            domain,
            dropped: 0,
        }
    }

    /// Fold one received Announce into the table.
    pub fn observe(
        &mut self,
        header: &Header,
        body: &AnnounceBody,
        src: SocketAddr,
        now_ns: i64,
    ) -> Result<(), AnnounceDrop> {
        if header.domain_number != self.domain {
            self.dropped += 1;
            return Err(AnnounceDrop::DomainMismatch);
        }

        let id = body.grandmaster_identity;

        if let Some(slot) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|m| m.clock_identity == id)
        {
            // Wrapping compare: a replayed or reordered Announce is dropped.
            let delta = header.sequence_id.wrapping_sub(slot.last_sequence_id);
            if slot.valid && (delta == 0 || delta >= 0x8000) {
                self.dropped += 1;
                return Err(AnnounceDrop::SequenceRegression);
            }
            slot.source_address = src;
            slot.priority1 = body.grandmaster_priority1;
            slot.priority2 = body.grandmaster_priority2;
            slot.clock_quality = body.grandmaster_clock_quality;
            slot.steps_removed = body.steps_removed;
            slot.time_source = body.time_source;
            slot.last_announce_time_ns = now_ns;
            slot.last_sequence_id = header.sequence_id;
            slot.valid = true;
            return Ok(());
        }

        let entry = ForeignMaster {
            clock_identity: id,
            source_address: src,
            priority1: body.grandmaster_priority1,
            priority2: body.grandmaster_priority2,
            clock_quality: body.grandmaster_clock_quality,
            steps_removed: body.steps_removed,
            time_source: body.time_source,
            last_announce_time_ns: now_ns,
            last_sequence_id: header.sequence_id,
            valid: true,
        };

        // Prefer an empty or invalid slot, else evict the stalest.
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
        } else if let Some(slot) = self
            .slots
            .iter_mut()
            .min_by_key(|s| s.as_ref().map_or(i64::MIN, |m| m.last_announce_time_ns))
        {
            if let Some(evicted) = slot.as_ref() {
                debug!("[BMCA] table full, reusing slot of {}", evicted.clock_identity);
            }
            *slot = Some(entry);
        }
        Ok(())
    }

    /// Invalidate entries whose Announce stream went quiet.
    pub fn age_out(&mut self, now_ns: i64) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.valid && now_ns - slot.last_announce_time_ns > self.timeout_ns {
                info!("[BMCA] foreign master {} aged out", slot.clock_identity);
                slot.valid = false;
            }
        }
    }

    pub fn valid_masters(&self) -> impl Iterator<Item = &ForeignMaster> {
        self.slots.iter().flatten().filter(|m| m.valid)
    }

    pub fn get(&self, id: ClockIdentity) -> Option<&ForeignMaster> {
        self.slots
            .iter()
            .flatten()
            .find(|m| m.valid && m.clock_identity == id)
    }
}

// ============================================================================
// COMPARATOR
// ============================================================================

/// The local clock's dataset as fed to the comparator.
#[derive(Debug, Clone, Copy)]
pub struct LocalDataset {
    pub priority1: u8,
    pub clock_quality: ClockQuality,
    pub priority2: u8,
    pub clock_identity: ClockIdentity,
}

fn comparison_key(
    priority1: u8,
    quality: ClockQuality,
    priority2: u8,
    identity: ClockIdentity,
) -> (u8, u8, u8, u16, u8, [u8; 8]) {
    (
        priority1,
        quality.clock_class,
        quality.clock_accuracy,
        quality.offset_scaled_log_variance,
        priority2,
        identity.0,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmcaDecision {
    LocalBest,
    ForeignBest(ClockIdentity),
}

/// Pick the best master from the local dataset plus every valid foreign
/// entry. Lower key wins; the clock identity is the final tie break, so the
/// outcome is total and deterministic.
pub fn run_bmca(local: &LocalDataset, table: &ForeignMasterTable) -> BmcaDecision {
    let local_key = comparison_key(
        local.priority1,
        local.clock_quality,
        local.priority2,
        local.clock_identity,
    );

    let best_foreign = table.valid_masters().min_by_key(|m| {
        comparison_key(m.priority1, m.clock_quality, m.priority2, m.clock_identity)
    });

    match best_foreign {
        Some(m)
            if comparison_key(m.priority1, m.clock_quality, m.priority2, m.clock_identity)
                < local_key =>
        {
            BmcaDecision::ForeignBest(m.clock_identity)
        }
        _ => BmcaDecision::LocalBest,
    }
}

// ============================================================================
// PORT STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initializing,
    Listening,
    Master,
    Slave,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Initializing => "INITIALIZING",
            PortState::Listening => "LISTENING",
            PortState::Master => "MASTER",
            PortState::Slave => "SLAVE",
        }
    }
}

/// PTP port whose transitions are driven solely by BMCA outcomes.
#[derive(Debug)]
pub struct PtpPort {
    state: PortState,
    selected_master: Option<ClockIdentity>,
}

impl PtpPort {
    pub fn new() -> Self {
        PtpPort {
            state: PortState::Initializing,
            selected_master: None,
        }
    }

    /// Startup complete; begin qualifying masters.
    pub fn enable(&mut self) {
        if self.state == PortState::Initializing {
            self.state = PortState::Listening;
        }
    }

    /// Apply a BMCA outcome. Returns true when the port state changed.
    pub fn apply(&mut self, decision: BmcaDecision) -> bool {
        if self.state == PortState::Initializing {
            return false;
        }
        let (new_state, new_master) = match decision {
            BmcaDecision::LocalBest => (PortState::Master, None),
            BmcaDecision::ForeignBest(id) => (PortState::Slave, Some(id)),
        };
        if new_state == self.state && new_master == self.selected_master {
            return false;
        }
        info!(
            "[BMCA] port {} -> {}{}",
            self.state.as_str(),
            new_state.as_str(),
            new_master
                .map(|id| format!(" (master {})", id))
                .unwrap_or_default()
        );
        self.state = new_state;
        self.selected_master = new_master;
        true
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn selected_master(&self) -> Option<ClockIdentity> {
        self.selected_master
    }
}

impl Default for PtpPort {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
