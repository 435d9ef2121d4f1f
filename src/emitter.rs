//! Announce / Sync / Follow_Up emission.
//!
//! Pure packet assembly plus interval bookkeeping. All clock-quality
//! decisions arrive as a snapshot from the quality mapper; the emitter never
//! reaches back into the controller.

use anyhow::Result;
use log::{debug, warn};

use crate::config::PtpConfig;
use crate::ptp::{
    AnnounceBody, ClockIdentity, ClockQuality, Header, MessageType, PortIdentity, SyncBody,
    Timestamp, ANNOUNCE_SIZE, FLAG_PTP_TIMESCALE, FLAG_TWO_STEP, FLAG_UTC_OFFSET_VALID,
    FOLLOW_UP_SIZE, HEADER_SIZE, SYNC_SIZE,
};
use crate::traits::PtpNet;

/// Everything an Announce advertises, produced by the controller on every
/// state change.
#[derive(Debug, Clone, Copy)]
pub struct QualitySnapshot {
    pub clock_quality: ClockQuality,
    pub grandmaster_identity: ClockIdentity,
    pub time_source: u8,
}

#[derive(Debug)]
pub struct AnnounceSyncEmitter {
    cfg: PtpConfig,
    port_identity: PortIdentity,

    announce_seq: u16,
    sync_seq: u16,

    next_announce_ns: Option<i64>,
    next_sync_ns: Option<i64>,

    pub announce_sent: u64,
    pub sync_sent: u64,
}

impl AnnounceSyncEmitter {
    pub fn new(cfg: PtpConfig, port_identity: PortIdentity) -> Self {
        AnnounceSyncEmitter {
            cfg,
            port_identity,
            announce_seq: 0,
            sync_seq: 0,
            next_announce_ns: None,
            next_sync_ns: None,
            announce_sent: 0,
            sync_sent: 0,
        }
    }

    /// Drive the transmit schedule. `now_mono_ns` paces the intervals;
    /// `disciplined_now` is the PHC reading taken just before the call so
    /// the Sync origin is as close to the wire as software allows.
    pub fn poll<N: PtpNet>(
        &mut self,
        net: &mut N,
        now_mono_ns: i64,
        disciplined_now: Timestamp,
        snapshot: &QualitySnapshot,
    ) -> Result<()> {
        let announce_interval = self.cfg.announce_interval_ms as i64 * 1_000_000;
        let sync_interval = self.cfg.sync_interval_ms as i64 * 1_000_000;

        match self.next_announce_ns {
            Some(next) if now_mono_ns < next => {}
            prev => {
                self.send_announce(net, disciplined_now, snapshot)?;
                // Anchor the schedule; skip missed slots instead of bursting.
                let base = prev.unwrap_or(now_mono_ns);
                let mut next = base + announce_interval;
                if next <= now_mono_ns {
                    next = now_mono_ns + announce_interval;
                }
                self.next_announce_ns = Some(next);
            }
        }

        match self.next_sync_ns {
            Some(next) if now_mono_ns < next => {}
            prev => {
                self.send_sync_pair(net, disciplined_now)?;
                let base = prev.unwrap_or(now_mono_ns);
                let mut next = base + sync_interval;
                if next <= now_mono_ns {
                    next = now_mono_ns + sync_interval;
                }
                self.next_sync_ns = Some(next);
            }
        }

        Ok(())
    }

    /// Leaving MASTER state: forget the schedule so a later return starts
    /// immediately rather than from a stale deadline.
    pub fn stop(&mut self) {
        self.next_announce_ns = None;
        self.next_sync_ns = None;
    }

    fn header(&self, message_type: MessageType, length: usize, seq: u16, flags: u16, log_interval: i8) -> Header {
        Header {
            message_type,
            message_length: length as u16,
            domain_number: self.cfg.domain,
            flag_field: flags,
            correction_field: 0,
            source_port_identity: self.port_identity,
            sequence_id: seq,
            log_message_interval: log_interval,
        }
    }

    fn send_announce<N: PtpNet>(
        &mut self,
        net: &mut N,
        now: Timestamp,
        snapshot: &QualitySnapshot,
    ) -> Result<()> {
        let seq = self.announce_seq;
        self.announce_seq = self.announce_seq.wrapping_add(1);

        let header = self.header(
            MessageType::Announce,
            ANNOUNCE_SIZE,
            seq,
            FLAG_PTP_TIMESCALE | FLAG_UTC_OFFSET_VALID,
            self.cfg.announce_log_interval,
        );
        let body = AnnounceBody {
            origin_timestamp: now,
            current_utc_offset: self.cfg.current_utc_offset,
            grandmaster_priority1: self.cfg.priority1,
            grandmaster_clock_quality: snapshot.clock_quality,
            grandmaster_priority2: self.cfg.priority2,
            grandmaster_identity: snapshot.grandmaster_identity,
            steps_removed: 0,
            time_source: snapshot.time_source,
        };

        let mut buf = [0u8; ANNOUNCE_SIZE];
        header.serialize(&mut buf);
        body.serialize(&mut buf[HEADER_SIZE..]);
        net.send_general(&buf)?;
        self.announce_sent += 1;
        debug!(
            "[Emitter] announce #{} class {}",
            seq, snapshot.clock_quality.clock_class
        );
        Ok(())
    }

    fn send_sync_pair<N: PtpNet>(&mut self, net: &mut N, now: Timestamp) -> Result<()> {
        let seq = self.sync_seq;
        self.sync_seq = self.sync_seq.wrapping_add(1);

        let header = self.header(
            MessageType::Sync,
            SYNC_SIZE,
            seq,
            FLAG_TWO_STEP | FLAG_PTP_TIMESCALE,
            self.cfg.sync_log_interval,
        );
        let mut buf = [0u8; SYNC_SIZE];
        header.serialize(&mut buf);
        SyncBody {
            origin_timestamp: now,
        }
        .serialize(&mut buf[HEADER_SIZE..]);
        net.send_event(&buf)?;
        self.sync_sent += 1;

        // Two-step: the Follow_Up carries the precise transmit time. Fall
        // back to the origin estimate when the stack gave us nothing.
        let tx_ts = match net.tx_timestamp(seq) {
            Ok(Some(ns)) => Timestamp::from_nanos(ns),
            Ok(None) => now,
            Err(e) => {
                warn!("[Emitter] tx timestamp for #{} failed: {}", seq, e);
                now
            }
        };

        let header = self.header(
            MessageType::FollowUp,
            FOLLOW_UP_SIZE,
            seq,
            FLAG_PTP_TIMESCALE,
            self.cfg.sync_log_interval,
        );
        let mut buf = [0u8; FOLLOW_UP_SIZE];
        header.serialize(&mut buf);
        SyncBody {
            origin_timestamp: tx_ts,
        }
        .serialize(&mut buf[HEADER_SIZE..]);
        net.send_general(&buf)?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
