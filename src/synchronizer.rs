//! Per-neighbor wake-up-time estimation.
//!
//! Before every transmission the synchronizer fixes four things: when the
//! wake-up sequence starts, how many wake-up frames it contains, when the
//! payload frame starts, and (POTR) which wake-up counter value the
//! receiver will have by then. The sequence must span the whole window in
//! which the receiver's wake-up may fall; how small that window is depends
//! on how much we know about the receiver's clock.
//!
//! [`Splo`] ("sample phase-lock onto") learns each neighbor's long-term
//! clock drift: once two syncs lie far enough apart, the ppm offset
//! between the clocks is computed and compensated, which shrinks the
//! uncertainty growth rate from the raw crystal tolerance (~15 ppm) to
//! the compensation tolerance (~3 ppm). [`Compliant`] only ever uses the
//! raw tolerance and falls back to sweeping a full wake-up interval when
//! no sync data exists.

use log::error;

use crate::akes;
use crate::config::{NBR_MAX, NBR_MAX_TENTATIVES};
use crate::csl::{self, LinkCtx, TransmitState};
use crate::framer::{wake_up_sequence_length, Subtype};
use crate::nbr::{NbrHandle, CHALLENGE_LEN};
use crate::packet::Packet;
use crate::time::Ticks;
use crate::wake_up_counter::WakeUpCounter;
use crate::TxStatus;

/// A neighbor's wake-up time as last observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncData {
    /// Local instant of one of the neighbor's wake-ups.
    pub t: Ticks,
    pub his_wake_up_counter_at_t: WakeUpCounter,
}

/// CSL metadata of one (tentative or permanent) neighbor, kept in an
/// arena parallel to the neighbor table and addressed by slot index.
#[derive(Debug, Clone, Copy, Default)]
pub struct CslNbr {
    pub sync: Option<SyncData>,
    pub drift: Option<i32>,
    /// Older sync snapshot the drift estimate is computed against.
    pub historical_sync: SyncData,
}

/// CSL metadata of a responder-side tentative neighbor, parallel to the
/// tentative metadata arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct CslNbrTentative {
    /// Our HELLOACK challenge, repeated back by the handshake ACK.
    pub q: [u8; CHALLENGE_LEN],
    pub helloack_sfd_timestamp: Ticks,
    pub predicted_wake_up_counter: WakeUpCounter,
}

pub struct SyncArena {
    nbrs: [CslNbr; NBR_MAX],
    tentatives: [CslNbrTentative; NBR_MAX_TENTATIVES],
}

impl Default for SyncArena {
    fn default() -> Self {
        SyncArena {
            nbrs: [CslNbr::default(); NBR_MAX],
            tentatives: [CslNbrTentative::default(); NBR_MAX_TENTATIVES],
        }
    }
}

impl SyncArena {
    pub fn of(&self, handle: NbrHandle) -> &CslNbr {
        &self.nbrs[handle.index() as usize]
    }

    pub fn of_mut(&mut self, handle: NbrHandle) -> &mut CslNbr {
        &mut self.nbrs[handle.index() as usize]
    }

    pub fn reset(&mut self, handle: NbrHandle) {
        self.nbrs[handle.index() as usize] = CslNbr::default();
    }

    pub fn tentative(&self, meta_index: u8) -> &CslNbrTentative {
        &self.tentatives[meta_index as usize]
    }

    pub fn tentative_mut(&mut self, meta_index: u8) -> &mut CslNbrTentative {
        &mut self.tentatives[meta_index as usize]
    }
}

/// The synchronizer could not place the transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleError;

pub trait Synchronizer {
    /// Computes `wake_up_sequence_start`, `remaining_wake_up_frames`,
    /// `payload_frame_start`, and (POTR) `receivers_wake_up_counter`
    /// into `tx`.
    fn schedule(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        pkt: &Packet,
    ) -> Result<(), ScheduleError>;

    /// Folds the acknowledgement's CSL phase into the receiver's sync
    /// data after a completed unicast.
    fn on_unicast_transmitted(&mut self, ctx: &mut LinkCtx<'_>, tx: &TransmitState, pkt: &Packet);
}

fn uncertainty(ctx: &LinkCtx<'_>, seconds_since_last_sync: u32, tolerance_ppm: u32) -> u32 {
    ((seconds_since_last_sync as u64 * tolerance_ppm as u64
        * ctx.timing.ticks_per_second as u64)
        / 1_000_000) as u32
        + 1
}

fn payload_frame_start(ctx: &LinkCtx<'_>, tx: &TransmitState) -> Ticks {
    tx.wake_up_sequence_start
        + ctx.timing.time_to_transmit(
            tx.remaining_wake_up_frames as u32
                * tx.wake_up_frame_len as u32
                * ctx.timing.symbols_per_byte,
        )
}

/// Drift-learning synchronizer for the POTR variant.
#[derive(Default)]
pub struct Splo;

const SPLO_FRAME_CREATION_US: u32 = 1000;

impl Synchronizer for Splo {
    fn schedule(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        pkt: &Packet,
    ) -> Result<(), ScheduleError> {
        let timing = ctx.timing;
        let interval = ctx.clock.timebase.interval();
        let frame_creation = timing.us_to_ticks(SPLO_FRAME_CREATION_US);
        let guard = csl::wake_up_sequence_guard_time(timing);

        if tx.subtype == Subtype::Hello {
            // a HELLO's SHR has to coincide with one of our own wake-ups,
            // and its sequence sweeps every channel
            tx.remaining_wake_up_frames =
                crate::framer::potr::hello_wake_up_sequence_length(ctx.cfg, timing, interval)
                    as u16;
            let tx_time =
                crate::framer::potr::hello_wake_up_sequence_tx_time(ctx.cfg, timing, interval);
            let mut start =
                ctx.clock.last_wake_up_time - timing.shr_time() + interval / 2;
            loop {
                start += interval;
                tx.wake_up_sequence_start = start - tx_time;
                if !(tx.wake_up_sequence_start - frame_creation - guard).has_timed_out(ctx.now) {
                    break;
                }
            }
            tx.payload_frame_start = start;
            return Ok(());
        }

        let entry = ctx.nbr.entry_of(&pkt.receiver);
        let (handle, drift) = match tx.subtype {
            Subtype::Helloack => {
                let Some(handle) = entry.tentative else {
                    error!("tentative neighbor not present");
                    return Err(ScheduleError);
                };
                (handle, None)
            }
            _ => {
                let Some(handle) = entry.permanent else {
                    error!("permanent neighbor not present");
                    return Err(ScheduleError);
                };
                (handle, ctx.sync.of(handle).drift)
            }
        };
        let Some(sync) = ctx.sync.of(handle).sync else {
            error!("neighbor was never synchronized");
            return Err(ScheduleError);
        };

        let seconds_since_last_sync =
            timing.ticks_to_s(ctx.now.diff(sync.t).max(0) as u32);
        let tolerance = match drift {
            Some(_) => ctx.cfg.compensation_tolerance_ppm,
            None => ctx.cfg.clock_tolerance_ppm,
        };
        let u = uncertainty(ctx, seconds_since_last_sync, tolerance);
        let negative_uncertainty = u + csl::negative_sync_guard_time(timing);
        let positive_uncertainty = u + csl::positive_sync_guard_time();

        let compensation = match drift {
            Some(drift) => {
                ((drift as i64 * seconds_since_last_sync as i64) / 1_000_000) as i32
            }
            None => 0,
        };

        let target = Ticks(
            sync.t
                .0
                .wrapping_add(compensation as u32)
                .wrapping_sub(negative_uncertainty),
        );
        tx.wake_up_sequence_start = ctx.clock.timebase.shift_to_future(target, ctx.now);
        while (tx.wake_up_sequence_start - frame_creation - guard).has_timed_out(ctx.now) {
            tx.wake_up_sequence_start += interval;
        }
        tx.remaining_wake_up_frames = wake_up_sequence_length(
            timing,
            negative_uncertainty + positive_uncertainty,
            tx.wake_up_frame_len as u32,
        ) as u16;
        tx.payload_frame_start = payload_frame_start(ctx, tx);
        let elapsed = Ticks(
            tx.wake_up_sequence_start
                .0
                .wrapping_sub(compensation as u32)
                .wrapping_add(negative_uncertainty),
        )
        .diff(sync.t)
        .max(0) as u32;
        tx.receivers_wake_up_counter = WakeUpCounter(
            sync.his_wake_up_counter_at_t
                .0
                .wrapping_add(ctx.clock.timebase.round_increments(elapsed)),
        );
        Ok(())
    }

    fn on_unicast_transmitted(&mut self, ctx: &mut LinkCtx<'_>, tx: &TransmitState, pkt: &Packet) {
        if tx.result[0] != Some(TxStatus::Ok) {
            return;
        }
        if !matches!(tx.subtype, Subtype::Ack | Subtype::Normal) {
            return;
        }
        let entry = ctx.nbr.entry_of(&pkt.receiver);
        let Some(handle) = entry.permanent else {
            error!("receiver not found");
            return;
        };
        let interval = ctx.clock.timebase.interval();
        let new_sync = SyncData {
            t: tx.acknowledgement_sfd_timestamp - (interval - tx.acknowledgement_phase as u32),
            his_wake_up_counter_at_t: tx.receivers_wake_up_counter,
        };

        let csl_nbr = ctx.sync.of_mut(handle);
        if tx.subtype == Subtype::Ack {
            csl_nbr.historical_sync = new_sync;
        } else {
            let seconds_since_historical_sync = ctx
                .timing
                .ticks_to_s(new_sync.t.diff(csl_nbr.historical_sync.t).max(0) as u32);
            if seconds_since_historical_sync >= ctx.cfg.min_time_between_drift_updates_s {
                let expected_diff = interval as u64
                    * new_sync
                        .his_wake_up_counter_at_t
                        .0
                        .wrapping_sub(csl_nbr.historical_sync.his_wake_up_counter_at_t.0)
                        as u64;
                let actual_diff = new_sync.t.0.wrapping_sub(csl_nbr.historical_sync.t.0) as u64;
                csl_nbr.drift = Some(
                    (((actual_diff as i64 - expected_diff as i64) * 1_000_000)
                        / seconds_since_historical_sync as i64) as i32,
                );
                if let Some(sync) = csl_nbr.sync {
                    csl_nbr.historical_sync = sync;
                }
            }
        }
        csl_nbr.sync = Some(new_sync);
    }
}

/// Tolerance-only synchronizer for the compliant variant.
#[derive(Default)]
pub struct Compliant;

const COMPLIANT_FRAME_CREATION_US: u32 = 4000;

impl Synchronizer for Compliant {
    fn schedule(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        pkt: &Packet,
    ) -> Result<(), ScheduleError> {
        let timing = ctx.timing;
        let interval = ctx.clock.timebase.interval();
        let frame_creation = timing.us_to_ticks(COMPLIANT_FRAME_CREATION_US);
        let guard = csl::wake_up_sequence_guard_time(timing);

        // handshake unicasts go out unsynchronized: the peer's phase is
        // unknown (HELLOACK) or about to change (ACK)
        let sync = if akes::is_helloack_cmd(pkt) || akes::is_ack_cmd(pkt) {
            None
        } else {
            ctx.nbr
                .entry_of(&pkt.receiver)
                .permanent
                .and_then(|h| ctx.sync.of(h).sync)
        };

        match sync {
            Some(sync) => {
                let seconds_since_last_sync =
                    timing.ticks_to_s(ctx.now.diff(sync.t).max(0) as u32);
                let u = uncertainty(ctx, seconds_since_last_sync, ctx.cfg.clock_tolerance_ppm);
                let negative_uncertainty = u + csl::negative_sync_guard_time(timing);
                let positive_uncertainty = u + csl::positive_sync_guard_time();
                tx.wake_up_sequence_start = ctx
                    .clock
                    .timebase
                    .shift_to_future(sync.t - negative_uncertainty, ctx.now);
                while (tx.wake_up_sequence_start - frame_creation - guard).has_timed_out(ctx.now)
                {
                    tx.wake_up_sequence_start += interval;
                }
                tx.remaining_wake_up_frames = wake_up_sequence_length(
                    timing,
                    negative_uncertainty + positive_uncertainty,
                    tx.wake_up_frame_len as u32,
                ) as u16;
            }
            None => {
                tx.wake_up_sequence_start = ctx.now + frame_creation + guard;
                tx.remaining_wake_up_frames =
                    wake_up_sequence_length(timing, interval, tx.wake_up_frame_len as u32) as u16;
            }
        }
        tx.payload_frame_start = payload_frame_start(ctx, tx);
        Ok(())
    }

    fn on_unicast_transmitted(&mut self, ctx: &mut LinkCtx<'_>, tx: &TransmitState, pkt: &Packet) {
        if tx.result[0] != Some(TxStatus::Ok) {
            return;
        }
        let entry = ctx.nbr.entry_of(&pkt.receiver);
        let Some(handle) = entry.permanent else {
            error!("sync data unavailable");
            return;
        };
        let interval = ctx.clock.timebase.interval();
        ctx.sync.of_mut(handle).sync = Some(SyncData {
            t: tx.acknowledgement_sfd_timestamp - (interval - tx.acknowledgement_phase as u32),
            his_wake_up_counter_at_t: WakeUpCounter(0),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbr::NbrStatus;
    use crate::packet::Packet;
    use crate::testutil::TestNode;

    fn node_with_permanent_peer() -> (TestNode, NbrHandle) {
        let mut a = TestNode::new(1);
        let handle = a
            .nbr
            .new_nbr(crate::LinkAddr([2; 8]), NbrStatus::Permanent)
            .unwrap();
        (a, handle)
    }

    fn tx_for(subtype: Subtype) -> TransmitState {
        let mut tx = TransmitState::default();
        tx.subtype = subtype;
        tx.receiver = crate::LinkAddr([2; 8]);
        tx.wake_up_frame_len = 12;
        tx.result[0] = Some(TxStatus::Ok);
        tx
    }

    #[test]
    fn drift_is_learned_from_two_spaced_syncs() {
        let (mut a, handle) = node_with_permanent_peer();
        let mut splo = Splo;
        let mut pkt = Packet::new();
        pkt.receiver = crate::LinkAddr([2; 8]);
        let interval = 4096u32;

        // handshake ACK seeds the historical snapshot at t = 0
        let mut tx = tx_for(Subtype::Ack);
        tx.receivers_wake_up_counter = WakeUpCounter(0);
        tx.acknowledgement_sfd_timestamp = Ticks(interval);
        tx.acknowledgement_phase = 0;
        {
            let mut ctx = a.ctx(Ticks(interval));
            splo.on_unicast_transmitted(&mut ctx, &tx, &pkt);
        }
        assert_eq!(a.sync.of(handle).historical_sync.t, Ticks(0));
        assert!(a.sync.of(handle).drift.is_none());

        // sixty seconds later the peer woke 59 ticks later than its
        // counter says it should have
        let mut tx = tx_for(Subtype::Normal);
        tx.receivers_wake_up_counter = WakeUpCounter(480);
        let t2 = 480 * interval + 59;
        tx.acknowledgement_sfd_timestamp = Ticks(t2 + interval);
        tx.acknowledgement_phase = 0;
        {
            let mut ctx = a.ctx(Ticks(t2 + interval));
            splo.on_unicast_transmitted(&mut ctx, &tx, &pkt);
        }
        assert_eq!(a.sync.of(handle).drift, Some(59 * 1_000_000 / 60));
        assert_eq!(a.sync.of(handle).sync.unwrap().t, Ticks(t2));
    }

    #[test]
    fn learned_drift_shrinks_the_wake_up_sequence() {
        let (mut a, handle) = node_with_permanent_peer();
        let mut splo = Splo;
        let mut pkt = Packet::new();
        pkt.receiver = crate::LinkAddr([2; 8]);
        a.sync.of_mut(handle).sync = Some(SyncData {
            t: Ticks(0),
            his_wake_up_counter_at_t: WakeUpCounter(0),
        });
        let now = Ticks(100 * 32768);

        a.sync.of_mut(handle).drift = Some(0);
        let mut tx = tx_for(Subtype::Normal);
        {
            let mut ctx = a.ctx(now);
            splo.schedule(&mut ctx, &mut tx, &pkt).unwrap();
        }
        let with_drift = tx.remaining_wake_up_frames;

        a.sync.of_mut(handle).drift = None;
        let mut tx = tx_for(Subtype::Normal);
        {
            let mut ctx = a.ctx(now);
            splo.schedule(&mut ctx, &mut tx, &pkt).unwrap();
        }
        let without_drift = tx.remaining_wake_up_frames;
        assert!(
            with_drift < without_drift,
            "{} !< {}",
            with_drift,
            without_drift
        );
    }

    #[test]
    fn unsynchronized_transmissions_sweep_a_full_interval() {
        let mut a = TestNode::new(1);
        let mut compliant = Compliant;
        let mut pkt = Packet::new();
        pkt.receiver = crate::LinkAddr([9; 8]);
        let mut tx = tx_for(Subtype::Normal);
        tx.wake_up_frame_len = 18;
        {
            let mut ctx = a.ctx(Ticks(50_000));
            compliant.schedule(&mut ctx, &mut tx, &pkt).unwrap();
        }
        let expected = wake_up_sequence_length(&a.timing, 4096, 18) as u16;
        assert_eq!(tx.remaining_wake_up_frames, expected);
        assert!(tx.remaining_wake_up_frames > 100);
        assert!(tx.wake_up_sequence_start.diff(Ticks(50_000)) > 0);
    }
}
