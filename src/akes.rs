//! The Adaptive Key Establishment Scheme (AKES).
//!
//! A three-way handshake bootstraps pairwise AES-128 session keys:
//!
//! ```norust
//! A                                   B
//! |-- HELLO (challenge a) --------->> |   broadcast
//! | <-------- HELLOACK (challenge b)-|   unicast, delayed randomly
//! |-- ACK -------------------------> |   unicast
//! ```
//!
//! Both sides derive `K = AES128(shared_secret, a || b)`; the HELLOACK's
//! MIC under `K` proves B knew `a`, the ACK completes the pairing. Four
//! leaky buckets bound the rate of HELLOs, incoming HELLOs, HELLOACKs,
//! and incoming HELLOACKs so that spurious handshakes cannot drain the
//! neighbor table or the battery.
//!
//! Session maintenance sends an UPDATE command to any permanent neighbor
//! whose freshness lapsed and deletes it if the UPDATE goes
//! unacknowledged.

use log::{error, info, warn};
use rand_core::RngCore;

use crate::csl::{link_ctx, CslMac, LinkCtx, Variant};
use crate::leaky_bucket::LeakyBucket;
use crate::nbr::{NbrHandle, NbrStatus, NbrTable, TentativeSecret, CHALLENGE_LEN};
use crate::packet::{FrameType, Packet};
use crate::queue::SentAction;
use crate::radio::Radio;
use crate::security::{self, derive_pairwise_key, KEY_LEN, MIC_LEN, SEC_LVL};
use crate::strategy::{Strategy, Verify};
use crate::time::Ticks;
use crate::trickle::Trickle;
use crate::{Config, Fatal, KeyScheme, LinkAddr, MacClient, TxStatus};

/// Command frame identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdId {
    Hello = 0x0a,
    Helloack = 0x0b,
    /// HELLOACK from a responder that already has us as permanent.
    HelloackP = 0x1b,
    Ack = 0x0c,
    Update = 0x0e,
}

impl CmdId {
    pub fn from_byte(b: u8) -> Option<CmdId> {
        match b {
            0x0a => Some(CmdId::Hello),
            0x0b => Some(CmdId::Helloack),
            0x1b => Some(CmdId::HelloackP),
            0x0c => Some(CmdId::Ack),
            0x0e => Some(CmdId::Update),
            _ => None,
        }
    }
}

fn cmd_of(pkt: &Packet) -> Option<CmdId> {
    if pkt.frame_type != FrameType::Command {
        return None;
    }
    CmdId::from_byte(pkt.data().first().copied()?)
}

pub fn is_hello_cmd(pkt: &Packet) -> bool {
    cmd_of(pkt) == Some(CmdId::Hello)
}

pub fn is_helloack_cmd(pkt: &Packet) -> bool {
    matches!(cmd_of(pkt), Some(CmdId::Helloack | CmdId::HelloackP))
}

pub fn is_ack_cmd(pkt: &Packet) -> bool {
    cmd_of(pkt) == Some(CmdId::Ack)
}

/// Command payload lengths, headers and piggybacks excluded.
pub const HELLO_DATALEN: usize = 1 + CHALLENGE_LEN;
/// HELLOACK: identifier, fresh challenge, our index for the peer, the
/// transported group key, and the MIC.
pub const HELLOACK_DATALEN: usize = 1 + CHALLENGE_LEN + 1 + KEY_LEN + MIC_LEN;
/// ACK: identifier, our index for the peer, group key, MIC.
pub const ACK_DATALEN: usize = 1 + 1 + KEY_LEN + MIC_LEN;

/// Grace period a responder keeps its tentative alive beyond the
/// HELLOACK delay, covering the ACK round trip.
const ACK_DELAY_S: u32 = 5;

/// Retransmissions are delayed by at most this long, so it pads the
/// freshness thresholds below.
const MAX_RETRANSMISSION_DELAY_S: u32 = 15;

/// How permanent-neighbor freshness is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Wall-clock lifetime stamped into the neighbor (compliant).
    WallClock,
    /// Derived from synchronization staleness: once the uncertainty
    /// window would outgrow the wake-up sequence budget, the neighbor
    /// needs an UPDATE (POTR).
    SyncBased,
}

/// Process-wide AKES state; the handshake logic itself lives in the
/// `CslMac` impl below.
pub struct AkesState {
    pub hello_challenge: [u8; CHALLENGE_LEN],
    pub is_awaiting_helloacks: bool,
    pub hello_done_at: Option<Ticks>,
    pub hello_bucket: LeakyBucket,
    pub helloack_bucket: LeakyBucket,
    pub ack_bucket: LeakyBucket,
    pub inc_hello_bucket: LeakyBucket,
    pub inc_helloack_bucket: LeakyBucket,
    pub group_key: [u8; KEY_LEN],
    pub trickle: Trickle,
    pub next_update_check: Ticks,
    pub waiting_for_update_ack: bool,
    pub with_pairwise_keys: bool,
    pub expiry: ExpiryPolicy,
}

impl AkesState {
    pub fn new(cfg: &Config, with_pairwise_keys: bool, expiry: ExpiryPolicy) -> AkesState {
        AkesState {
            hello_challenge: [0; CHALLENGE_LEN],
            is_awaiting_helloacks: false,
            hello_done_at: None,
            hello_bucket: LeakyBucket::new(cfg.max_consecutive_hellos, cfg.max_hello_rate_s),
            helloack_bucket: LeakyBucket::new(
                cfg.max_consecutive_helloacks,
                cfg.max_helloack_rate_s,
            ),
            ack_bucket: LeakyBucket::new(cfg.max_consecutive_acks, cfg.max_ack_rate_s),
            inc_hello_bucket: LeakyBucket::new(
                cfg.max_consecutive_inc_hellos,
                cfg.max_inc_hello_rate_s,
            ),
            inc_helloack_bucket: LeakyBucket::new(
                cfg.max_consecutive_inc_helloacks,
                cfg.max_inc_helloack_rate_s,
            ),
            group_key: [0; KEY_LEN],
            trickle: Trickle::default(),
            next_update_check: Ticks(0),
            waiting_for_update_ack: false,
            with_pairwise_keys,
            expiry,
        }
    }
}

/// Which key slot of the receiver secures the frame in `pkt`.
pub fn receiver_status(akes: &AkesState, pkt: &Packet) -> NbrStatus {
    match cmd_of(pkt) {
        Some(CmdId::Helloack | CmdId::HelloackP) => NbrStatus::Tentative,
        Some(CmdId::Ack) if !akes.with_pairwise_keys => NbrStatus::Tentative,
        _ => NbrStatus::Permanent,
    }
}

/// Freshness thresholds of the sync-based expiry policy, in seconds.
fn initial_update_threshold_s(ctx: &LinkCtx<'_>) -> u32 {
    let timing = ctx.timing;
    let budget = crate::csl::max_overall_uncertainty(timing)
        - crate::csl::negative_sync_guard_time(timing)
        - crate::csl::positive_sync_guard_time();
    let s = (budget as u64 * 1_000_000
        / (2 * ctx.cfg.clock_tolerance_ppm as u64)
        / timing.ticks_per_second as u64) as u32;
    s.saturating_sub(MAX_RETRANSMISSION_DELAY_S)
}

fn subsequent_update_threshold_s(ctx: &LinkCtx<'_>) -> u32 {
    let timing = ctx.timing;
    let budget = crate::csl::max_overall_uncertainty(timing)
        - crate::csl::negative_sync_guard_time(timing)
        - crate::csl::positive_sync_guard_time();
    let s = (budget as u64 * 1_000_000
        / ctx.cfg.compensation_tolerance_ppm as u64
        / timing.ticks_per_second as u64) as u32;
    s.saturating_sub(MAX_RETRANSMISSION_DELAY_S).min(300)
}

pub fn is_nbr_expired(ctx: &mut LinkCtx<'_>, handle: NbrHandle, status: NbrStatus) -> bool {
    match ctx.akes.expiry {
        ExpiryPolicy::WallClock => ctx
            .nbr
            .get(handle)
            .is_some_and(|n| n.expiration_time_s < ctx.now_s),
        ExpiryPolicy::SyncBased => {
            let Some(sync) = ctx.sync.of(handle).sync else {
                return true;
            };
            let stale_s = ctx.timing.ticks_to_s(ctx.now.diff(sync.t).max(0) as u32);
            let threshold = match status {
                NbrStatus::Tentative => ctx.cfg.max_waiting_period_s + 1,
                NbrStatus::Permanent => {
                    if ctx.sync.of(handle).drift.is_some() {
                        subsequent_update_threshold_s(ctx)
                    } else {
                        initial_update_threshold_s(ctx)
                    }
                }
            };
            stale_s > threshold
        }
    }
}

pub fn prolong_tentative(ctx: &mut LinkCtx<'_>, handle: NbrHandle, seconds: u32) {
    if ctx.akes.expiry == ExpiryPolicy::WallClock {
        if let Some(nbr) = ctx.nbr.get_mut(handle) {
            nbr.expiration_time_s = ctx.now_s + seconds;
        }
    }
}

pub fn prolong_permanent(ctx: &mut LinkCtx<'_>, handle: NbrHandle) {
    if ctx.akes.expiry == ExpiryPolicy::WallClock {
        let lifetime = ctx.cfg.nbr_lifetime_s;
        if let Some(nbr) = ctx.nbr.get_mut(handle) {
            nbr.expiration_time_s = ctx.now_s + lifetime;
        }
    }
}

pub fn delete_expired_tentatives(ctx: &mut LinkCtx<'_>) {
    for handle in ctx.nbr.handles() {
        let is_tentative = ctx
            .nbr
            .get(handle)
            .is_some_and(|n| n.status() == NbrStatus::Tentative);
        if is_tentative && is_nbr_expired(ctx, handle, NbrStatus::Tentative) {
            ctx.nbr.delete(handle);
        }
    }
}

/// A HELLO is worth answering if its sender is an established neighbor,
/// or if we have room (and rate budget) for a new tentative one.
pub fn is_acceptable_hello(ctx: &mut LinkCtx<'_>, sender: &LinkAddr) -> bool {
    delete_expired_tentatives(ctx);
    let entry = ctx.nbr.entry_of(sender);
    entry.permanent.is_some()
        || (entry.tentative.is_none()
            && !ctx.akes.helloack_bucket.is_full(ctx.now_s)
            && ctx.nbr.count(NbrStatus::Tentative) < crate::config::NBR_MAX_TENTATIVES
            && ctx.nbr.free_slots() > 0)
}

pub fn is_acceptable_helloack(ctx: &mut LinkCtx<'_>) -> bool {
    if !ctx.akes.is_awaiting_helloacks || ctx.akes.ack_bucket.is_full(ctx.now_s) {
        return false;
    }
    true
}

/// A handshake ACK is expected only from a tentative neighbor we already
/// answered with a HELLOACK.
pub fn is_acceptable_ack(nbr: &NbrTable, handle: NbrHandle) -> bool {
    nbr.get(handle)
        .filter(|n| n.status() == NbrStatus::Tentative)
        .and_then(|n| nbr.meta(n))
        .is_some_and(|meta| meta.was_helloack_sent)
}

impl<R, K, G, V> CslMac<R, K, G, V>
where
    R: Radio,
    K: KeyScheme,
    G: RngCore,
    V: Variant,
{
    pub(crate) fn akes_init(&mut self, now: Ticks) {
        self.rng.fill_bytes(&mut self.akes.group_key);
        self.change_hello_challenge();
        let now_s = self.uptime_seconds(now);
        self.akes.trickle.start(now_s, &mut self.rng);
        self.akes.next_update_check =
            now + self.cfg.update_check_interval_s * self.timing.ticks_per_second;
    }

    fn change_hello_challenge(&mut self) {
        let mut challenge = [0; CHALLENGE_LEN];
        self.rng.fill_bytes(&mut challenge);
        self.akes.hello_challenge = challenge;
    }

    /// Runs AKES' timers: pending HELLOACKs, the HELLO round, and the
    /// UPDATE sweep. Called from `post_process`.
    pub(crate) fn akes_poll(&mut self, now: Ticks) -> Result<(), Fatal> {
        // randomly delayed HELLOACKs whose wait elapsed
        for handle in self.nbr.handles() {
            let due = self
                .nbr
                .get(handle)
                .filter(|n| n.status() == NbrStatus::Tentative)
                .and_then(|n| self.nbr.meta(n))
                .and_then(|meta| meta.helloack_wait)
                .is_some_and(|deadline| deadline.has_timed_out(now));
            if due {
                if let Some(meta) = self.nbr.meta_mut_of(handle) {
                    meta.helloack_wait = None;
                }
                self.send_helloack(handle, now)?;
            }
        }

        if let Some(done) = self.akes.hello_done_at {
            if done.has_timed_out(now) {
                self.akes.hello_done_at = None;
                self.akes.is_awaiting_helloacks = false;
                self.change_hello_challenge();
            }
        }

        let now_s = self.uptime_seconds(now);
        if self.akes.trickle.poll(now_s, &mut self.rng) {
            self.broadcast_hello(now)?;
        }

        if self.akes.next_update_check.has_timed_out(now) {
            // randomize the next check to avoid synchronized UPDATE storms
            let interval = self.cfg.update_check_interval_s * self.timing.ticks_per_second;
            let jitter = self.rng.next_u32() % self.timing.ticks_per_second;
            self.akes.next_update_check =
                now + interval - self.timing.ticks_per_second / 2 + jitter;
            self.update_check(now)?;
        }
        Ok(())
    }

    fn update_check(&mut self, now: Ticks) -> Result<(), Fatal> {
        if self.akes.waiting_for_update_ack {
            return Ok(());
        }
        for handle in self.nbr.handles() {
            let mut ctx = link_ctx!(self, now);
            let is_candidate = ctx
                .nbr
                .get(handle)
                .and_then(|n| n.permanent())
                .is_some_and(|p| !p.is_receiving_update);
            if !is_candidate || !is_nbr_expired(&mut ctx, handle, NbrStatus::Permanent) {
                continue;
            }
            let addr = self.nbr.get(handle).map(|n| n.addr);
            if let Some(addr) = addr {
                if self.send_update(&addr, now)? {
                    if let Some(p) = self.nbr.get_mut(handle).and_then(|n| n.permanent_mut()) {
                        p.is_receiving_update = true;
                    }
                    self.akes.waiting_for_update_ack = true;
                }
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn broadcast_hello(&mut self, now: Ticks) -> Result<(), Fatal> {
        if self.akes.is_awaiting_helloacks {
            warn!("still waiting for helloacks");
            return Ok(());
        }
        let now_s = self.uptime_seconds(now);
        if self.akes.hello_bucket.is_full(now_s) {
            warn!("hello bucket is full");
            return Ok(());
        }
        self.akes.hello_bucket.pour(now_s);

        let mut pkt = Packet::new();
        pkt.receiver = LinkAddr::NULL;
        pkt.frame_type = FrameType::Command;
        pkt.sec_lvl = SEC_LVL & 3;
        let challenge = self.akes.hello_challenge;
        let mut payload = [0u8; HELLO_DATALEN];
        payload[0] = CmdId::Hello as u8;
        payload[1..].copy_from_slice(&challenge);
        if pkt.set_data(&payload).is_err() {
            return Ok(());
        }
        {
            let data_len = pkt.data_len();
            let mut ctx = link_ctx!(self, now);
            let piggyback = self.strategy.write_piggyback(&mut ctx, CmdId::Hello, &mut []);
            let _ = pkt.set_data_len(data_len + piggyback);
        }
        self.set_numbers(None, &mut pkt)?;

        info!("broadcasting hello");
        self.enqueue_frame(pkt, SentAction::AkesHello, now);
        Ok(())
    }

    pub(crate) fn akes_on_hello_sent(&mut self, now: Ticks) {
        self.akes.is_awaiting_helloacks = true;
        self.akes.hello_done_at =
            Some(now + self.cfg.max_waiting_period_s * self.timing.ticks_per_second);
    }

    /// Builds a HELLOACK, ACK, or UPDATE command towards `entry`.
    fn prepare_update_command(
        &mut self,
        cmd: CmdId,
        receiver: &LinkAddr,
        status: NbrStatus,
        now: Ticks,
    ) -> Result<Option<Packet>, Fatal> {
        let entry = self.nbr.entry_of(receiver);
        let Some(handle) = entry.of(status) else {
            return Ok(None);
        };

        let mut pkt = Packet::new();
        pkt.receiver = *receiver;
        pkt.frame_type = FrameType::Command;
        pkt.sec_lvl = SEC_LVL;
        if !matches!(cmd, CmdId::Update) {
            pkt.max_transmissions = self.cfg.max_retransmissions_of_helloacks_and_acks + 1;
        }

        let mut payload = [0u8; crate::config::MAX_FRAME_LEN];
        payload[0] = cmd as u8;
        let mut at = 1;
        if status == NbrStatus::Tentative {
            let challenge = match self
                .nbr
                .get(handle)
                .and_then(|n| n.tentative())
                .map(|t| &t.secret)
            {
                Some(TentativeSecret::Challenge(c)) => *c,
                _ => return Ok(None),
            };
            payload[at..at + CHALLENGE_LEN].copy_from_slice(&challenge);
            at += CHALLENGE_LEN;
        }
        if V::WITH_INDICES {
            payload[at] = handle.index();
            at += 1;
        }
        pkt.set_data(&payload[..at]).ok();
        {
            let mut ctx = link_ctx!(self, now);
            let mut piggyback = [0u8; 32];
            let n = self.strategy.write_piggyback(&mut ctx, cmd, &mut piggyback);
            let _ = pkt.rx_extend(n).map(|dst| {
                dst.copy_from_slice(&piggyback[..n]);
            });
            at += n;
        }
        if matches!(cmd, CmdId::Helloack | CmdId::HelloackP | CmdId::Ack) {
            // the group key travels encrypted; everything before it stays
            // readable for pre-session receivers
            pkt.unencrypted = at as u8;
            let group_key = self.akes.group_key;
            let _ = pkt.rx_extend(KEY_LEN).map(|dst| {
                dst.copy_from_slice(&group_key);
            });
        }
        self.set_numbers(Some(handle), &mut pkt)?;
        Ok(Some(pkt))
    }

    /// Stamps duplicate-detection and security numbers onto an outgoing
    /// frame.
    pub(crate) fn set_numbers(
        &mut self,
        receiver: Option<NbrHandle>,
        pkt: &mut Packet,
    ) -> Result<(), Fatal> {
        if V::WITH_SEQNOS {
            if let Some(handle) = receiver {
                if cmd_of(pkt).is_none() || cmd_of(pkt) == Some(CmdId::Update) {
                    if let Some(p) = self.nbr.get_mut(handle).and_then(|n| n.permanent_mut()) {
                        p.my_unicast_seqno = p.my_unicast_seqno.wrapping_add(1);
                        pkt.seqno = p.my_unicast_seqno;
                    }
                }
            }
        } else {
            pkt.frame_counter = self
                .counter
                .next()
                .map_err(|_| Fatal::FrameCounterExhausted)?;
        }
        Ok(())
    }

    fn send_helloack(&mut self, handle: NbrHandle, now: Ticks) -> Result<(), Fatal> {
        info!("sending helloack");
        let Some(nbr) = self.nbr.get(handle) else {
            return Ok(());
        };
        let addr = nbr.addr;
        let old_challenge = match nbr.tentative().map(|t| &t.secret) {
            Some(TentativeSecret::Challenge(c)) => *c,
            _ => return Ok(()),
        };

        let mut challenges = [0u8; 2 * CHALLENGE_LEN];
        challenges[..CHALLENGE_LEN].copy_from_slice(&old_challenge);
        let mut fresh = [0u8; CHALLENGE_LEN];
        self.rng.fill_bytes(&mut fresh);
        challenges[CHALLENGE_LEN..].copy_from_slice(&fresh);
        if let Some(t) = self.nbr.get_mut(handle).and_then(|n| n.tentative_mut()) {
            t.secret = TentativeSecret::Challenge(fresh);
        }

        let entry = self.nbr.entry_of(&addr);
        let cmd = if entry.permanent.is_some() {
            CmdId::HelloackP
        } else {
            CmdId::Helloack
        };
        let Some(pkt) = self.prepare_update_command(cmd, &addr, NbrStatus::Tentative, now)? else {
            return Ok(());
        };

        let Some(secret) = self.key_scheme.secret_with_hello_sender(&addr) else {
            error!("no secret with hello sender");
            return Ok(());
        };
        let key = derive_pairwise_key(&secret, &challenges);
        if let Some(t) = self.nbr.get_mut(handle).and_then(|n| n.tentative_mut()) {
            t.secret = TentativeSecret::PairwiseKey(key);
        }
        self.enqueue_frame(pkt, SentAction::AkesHelloack, now);
        Ok(())
    }

    pub(crate) fn akes_on_helloack_sent(&mut self, receiver: &LinkAddr, status: TxStatus) {
        let entry = self.nbr.entry_of(receiver);
        let Some(handle) = entry.tentative else {
            error!("did not find tentative neighbor");
            return;
        };
        if status != TxStatus::Ok {
            error!("helloack transmission failed");
            return;
        }
        if let Some(meta) = self.nbr.meta_mut_of(handle) {
            meta.was_helloack_sent = true;
        }
    }

    fn send_ack(&mut self, receiver: &LinkAddr, is_new: bool, now: Ticks) -> Result<(), Fatal> {
        info!("sending ack");
        let now_s = self.uptime_seconds(now);
        self.akes.ack_bucket.pour(now_s);
        if let Some(pkt) =
            self.prepare_update_command(CmdId::Ack, receiver, NbrStatus::Permanent, now)?
        {
            self.enqueue_frame(pkt, SentAction::AkesAck { is_new }, now);
        }
        Ok(())
    }

    pub(crate) fn akes_on_ack_sent(&mut self, receiver: &LinkAddr, status: TxStatus, is_new: bool, now: Ticks) {
        let entry = self.nbr.entry_of(receiver);
        if entry.permanent.is_none() || (!self.akes.with_pairwise_keys && entry.tentative.is_none())
        {
            error!("this should never happen");
            return;
        }
        if !self.akes.with_pairwise_keys {
            if let Some(tentative) = entry.tentative {
                self.nbr.delete(tentative);
            }
        }
        if status != TxStatus::Ok {
            error!("ack was not acknowledged");
            if let Some(permanent) = entry.permanent {
                self.nbr.delete(permanent);
            }
            return;
        }
        if is_new {
            let now_s = self.uptime_seconds(now);
            self.akes.trickle.on_new_nbr(now_s, &mut self.rng);
        }
    }

    fn send_update(&mut self, receiver: &LinkAddr, now: Ticks) -> Result<bool, Fatal> {
        if let Some(pkt) =
            self.prepare_update_command(CmdId::Update, receiver, NbrStatus::Permanent, now)?
        {
            self.enqueue_frame(pkt, SentAction::AkesUpdate, now);
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn akes_on_update_sent(&mut self, receiver: &LinkAddr, now: Ticks) {
        self.akes.waiting_for_update_ack = false;
        let entry = self.nbr.entry_of(receiver);
        let Some(handle) = entry.permanent else {
            error!("neighbor has gone");
            return;
        };
        let mut ctx = link_ctx!(self, now);
        if is_nbr_expired(&mut ctx, handle, NbrStatus::Permanent) {
            info!("deleting neighbor");
            self.nbr.delete(handle);
            self.sync.reset(handle);
        } else if let Some(p) = self.nbr.get_mut(handle).and_then(|n| n.permanent_mut()) {
            p.is_receiving_update = false;
        }
    }

    /// Entry point for verified (or to-be-verified) received frames.
    pub(crate) fn akes_input(
        &mut self,
        pkt: &mut Packet,
        now: Ticks,
        client: &mut dyn MacClient,
    ) -> Result<(), Fatal> {
        match pkt.frame_type {
            FrameType::Command => self.akes_on_command(pkt, now),
            FrameType::Data => {
                let entry = self.nbr.entry_of(&pkt.sender);
                let Some(handle) = entry.permanent else {
                    error!("ignored incoming frame");
                    return Ok(());
                };
                if pkt.holds_broadcast() || V::VERIFY_ON_INPUT {
                    let mut ctx = link_ctx!(self, now);
                    if self.strategy.verify(&mut ctx, pkt, handle) != Verify::Success {
                        return Ok(());
                    }
                }
                if self.received_duplicate(handle, pkt) {
                    error!("received duplicate");
                    return Ok(());
                }
                let mut ctx = link_ctx!(self, now);
                prolong_permanent(&mut ctx, handle);
                client.input(pkt);
                Ok(())
            }
        }
    }

    fn received_duplicate(&mut self, sender: NbrHandle, pkt: &Packet) -> bool {
        if !V::WITH_SEQNOS || pkt.holds_broadcast() {
            return false;
        }
        match cmd_of(pkt) {
            None | Some(CmdId::Update) => {}
            _ => return false,
        }
        let Some(p) = self.nbr.get_mut(sender).and_then(|n| n.permanent_mut()) else {
            return false;
        };
        if p.his_unicast_seqno == pkt.seqno {
            return true;
        }
        p.his_unicast_seqno = pkt.seqno;
        false
    }

    fn akes_on_command(&mut self, pkt: &mut Packet, now: Ticks) -> Result<(), Fatal> {
        let Some(cmd) = cmd_of(pkt) else {
            return Ok(());
        };
        let min_len = match cmd {
            CmdId::Hello => {
                HELLO_DATALEN
                    + if V::COMPLIANT {
                        0
                    } else {
                        crate::framer::potr::HELLO_PIGGYBACK_LEN
                    }
            }
            CmdId::Helloack | CmdId::HelloackP => 1 + CHALLENGE_LEN + KEY_LEN + MIC_LEN,
            CmdId::Ack => 1 + KEY_LEN + MIC_LEN,
            CmdId::Update => 1,
        };
        if pkt.data_len() < min_len {
            warn!("truncated command frame");
            return Ok(());
        }
        // the group key at the payload's tail is the only encrypted part
        if matches!(cmd, CmdId::Helloack | CmdId::HelloackP | CmdId::Ack) {
            let tail = KEY_LEN + security::mic_len(pkt.sec_lvl);
            pkt.unencrypted = pkt.data_len().saturating_sub(tail) as u8;
        }
        match cmd {
            CmdId::Hello => self.akes_on_hello(pkt, now),
            CmdId::Helloack => self.akes_on_helloack(pkt, false, now),
            CmdId::HelloackP => self.akes_on_helloack(pkt, true, now),
            CmdId::Ack => self.akes_on_ack(pkt, now),
            CmdId::Update => self.akes_on_update(pkt, now),
        }
    }

    fn akes_on_hello(&mut self, pkt: &mut Packet, now: Ticks) -> Result<(), Fatal> {
        info!("received hello");
        {
            let mut ctx = link_ctx!(self, now);
            delete_expired_tentatives(&mut ctx);
        }
        let sender = pkt.sender;
        let entry = self.nbr.entry_of(&sender);

        if let Some(handle) = entry.permanent {
            let mut ctx = link_ctx!(self, now);
            match self.strategy.verify(&mut ctx, pkt, handle) {
                Verify::Success => {
                    self.strategy.on_fresh_authentic_hello(&mut ctx);
                    prolong_permanent(&mut ctx, handle);
                    self.akes.trickle.on_fresh_authentic_hello();
                    return Ok(());
                }
                Verify::Inauthentic => {
                    info!("starting new session with permanent neighbor");
                }
                Verify::Replayed => {
                    error!("replayed hello");
                    return Ok(());
                }
            }
        }

        let now_s = self.uptime_seconds(now);
        if self.akes.helloack_bucket.is_full(now_s) {
            warn!("helloack bucket is full");
            return Ok(());
        }
        if entry.tentative.is_some() {
            warn!("received hello from tentative neighbor");
            return Ok(());
        }

        let Some(handle) = self.nbr.new_nbr(sender, NbrStatus::Tentative) else {
            warn!("hello flood?");
            return Ok(());
        };
        self.sync.reset(handle);
        self.akes.helloack_bucket.pour(now_s);

        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(&pkt.data()[1..1 + CHALLENGE_LEN]);
        if let Some(t) = self.nbr.get_mut(handle).and_then(|n| n.tentative_mut()) {
            t.secret = TentativeSecret::Challenge(challenge);
        }

        let max_delay = (self.cfg.max_waiting_period_s - self.cfg.max_retransmission_back_off_s)
            * self.timing.ticks_per_second;
        let waiting_period = self.rng.next_u32() % max_delay;
        {
            let entry = self.nbr.entry_of(&sender);
            let mut ctx = link_ctx!(self, now);
            self.strategy.read_piggyback(
                &mut ctx,
                CmdId::Hello,
                &pkt.data()[1 + CHALLENGE_LEN..],
                entry,
                None,
            );
            prolong_tentative(
                &mut ctx,
                handle,
                waiting_period / self.timing.ticks_per_second + ACK_DELAY_S,
            );
        }
        if let Some(meta) = self.nbr.meta_mut_of(handle) {
            meta.helloack_wait = Some(now + waiting_period);
            meta.has_wait_timer = true;
            meta.was_helloack_sent = false;
        }
        info!(
            "will send helloack in {}ms",
            waiting_period / (self.timing.ticks_per_second / 1000).max(1)
        );
        Ok(())
    }

    fn akes_on_helloack(&mut self, pkt: &mut Packet, p_flag: bool, now: Ticks) -> Result<(), Fatal> {
        info!("received helloack");
        {
            let mut ctx = link_ctx!(self, now);
            if !is_acceptable_helloack(&mut ctx) {
                error!("unacceptable helloack");
                return Ok(());
            }
            delete_expired_tentatives(&mut ctx);
        }
        let sender = pkt.sender;
        let entry = self.nbr.entry_of(&sender);
        if entry.permanent.is_some() && p_flag {
            info!("no need to start a new session");
            return Ok(());
        }

        let Some(secret) = self.key_scheme.secret_with_helloack_sender(&sender) else {
            error!("no secret with helloack sender");
            return Ok(());
        };
        let mut challenges = [0u8; 2 * CHALLENGE_LEN];
        challenges[..CHALLENGE_LEN].copy_from_slice(&self.akes.hello_challenge);
        challenges[CHALLENGE_LEN..].copy_from_slice(&pkt.data()[1..1 + CHALLENGE_LEN]);
        let key = derive_pairwise_key(&secret, &challenges);

        {
            let mut ctx = link_ctx!(self, now);
            if self.strategy.unsecure_with_key(&mut ctx, pkt, &key).is_err() {
                error!("invalid helloack");
                return Ok(());
            }
        }

        let mut is_new = true;
        if let Some(permanent) = entry.permanent {
            let replayed = if self.akes.with_pairwise_keys {
                self.nbr
                    .get(permanent)
                    .and_then(|n| n.permanent())
                    .is_some_and(|p| p.pairwise_key == key)
            } else {
                self.nbr
                    .get(permanent)
                    .and_then(|n| n.permanent())
                    .is_some_and(|p| {
                        p.helloack_challenge[..] == pkt.data()[1..1 + p.helloack_challenge.len()]
                    })
            };
            if replayed {
                error!("replayed helloack");
                return Ok(());
            }
            self.nbr.delete(permanent);
            self.sync.reset(permanent);
            is_new = false;
        }

        if let Some(tentative) = entry.tentative {
            let meta_state = self
                .nbr
                .get(tentative)
                .and_then(|n| self.nbr.meta(n))
                .map(|m| (m.has_wait_timer, m.helloack_wait.is_some()));
            match meta_state {
                Some((false, _)) => {
                    warn!("awaiting acknowledgement of ack");
                    return Ok(());
                }
                Some((true, false)) => {
                    warn!("awaiting ack");
                    let mut ctx = link_ctx!(self, now);
                    self.strategy.on_fresh_authentic_helloack(&mut ctx);
                    return Ok(());
                }
                _ => {
                    info!("skipping helloack");
                    self.nbr.delete(tentative);
                }
            }
        }
        {
            let mut ctx = link_ctx!(self, now);
            self.strategy.on_fresh_authentic_helloack(&mut ctx);
        }

        let Some(permanent) = self.nbr.new_nbr(sender, NbrStatus::Permanent) else {
            return Ok(());
        };
        self.sync.reset(permanent);
        if self.akes.with_pairwise_keys {
            if let Some(p) = self.nbr.get_mut(permanent).and_then(|n| n.permanent_mut()) {
                p.pairwise_key = key;
            }
        } else {
            if let Some(p) = self.nbr.get_mut(permanent).and_then(|n| n.permanent_mut()) {
                let cached_len = p.helloack_challenge.len();
                p.helloack_challenge
                    .copy_from_slice(&pkt.data()[1..1 + cached_len]);
            }
            // a side tentative carries the key until our ACK is through
            let Some(tentative) = self.nbr.new_nbr(sender, NbrStatus::Tentative) else {
                self.nbr.delete(permanent);
                return Ok(());
            };
            if let Some(t) = self.nbr.get_mut(tentative).and_then(|n| n.tentative_mut()) {
                t.secret = TentativeSecret::PairwiseKey(key);
            }
            if let Some(meta) = self.nbr.meta_mut_of(tentative) {
                meta.has_wait_timer = false;
                meta.was_helloack_sent = false;
            }
            let grace = self.cfg.max_waiting_period_s + 1;
            let mut ctx = link_ctx!(self, now);
            prolong_tentative(&mut ctx, tentative, grace);
        }

        self.process_update_command(&sender, pkt, 1 + CHALLENGE_LEN, CmdId::Helloack, None, now);
        self.send_ack(&sender, is_new, now)?;
        Ok(())
    }

    fn akes_on_ack(&mut self, pkt: &mut Packet, now: Ticks) -> Result<(), Fatal> {
        info!("received ack");
        let sender = pkt.sender;
        let entry = self.nbr.entry_of(&sender);
        let Some(tentative) = entry.tentative else {
            error!("invalid ack");
            return Ok(());
        };
        if V::VERIFY_ON_INPUT {
            if !is_acceptable_ack(&self.nbr, tentative) {
                error!("invalid ack");
                return Ok(());
            }
            let key = match self
                .nbr
                .get(tentative)
                .and_then(|n| n.tentative())
                .map(|t| &t.secret)
            {
                Some(TentativeSecret::PairwiseKey(k)) => *k,
                _ => {
                    error!("invalid ack");
                    return Ok(());
                }
            };
            let mut ctx = link_ctx!(self, now);
            if self.strategy.unsecure_with_key(&mut ctx, pkt, &key).is_err() {
                error!("invalid ack");
                return Ok(());
            }
        }

        let mut is_new = true;
        if let Some(permanent) = entry.permanent {
            self.nbr.delete(permanent);
            self.sync.reset(permanent);
            is_new = false;
        }
        let meta_index = self.nbr.meta_index_of(tentative);
        if !self.nbr.promote(tentative) {
            error!("could not promote neighbor");
            return Ok(());
        }
        self.process_update_command(&sender, pkt, 1, CmdId::Ack, meta_index, now);
        if is_new {
            let now_s = self.uptime_seconds(now);
            self.akes.trickle.on_new_nbr(now_s, &mut self.rng);
        }
        Ok(())
    }

    fn akes_on_update(&mut self, pkt: &mut Packet, now: Ticks) -> Result<(), Fatal> {
        info!("received update");
        let sender = pkt.sender;
        let entry = self.nbr.entry_of(&sender);
        let Some(handle) = entry.permanent else {
            error!("invalid update");
            return Ok(());
        };
        if V::VERIFY_ON_INPUT {
            let mut ctx = link_ctx!(self, now);
            if self.strategy.verify(&mut ctx, pkt, handle) != Verify::Success {
                error!("inauthentic update");
                return Ok(());
            }
        }
        if self.received_duplicate(handle, pkt) {
            error!("received duplicated update");
            return Ok(());
        }
        self.process_update_command(&sender, pkt, 1, CmdId::Update, None, now);
        Ok(())
    }

    /// Applies the session data carried by a HELLOACK, ACK, or UPDATE:
    /// foreign index, piggybacked sync material, and the group key.
    fn process_update_command(
        &mut self,
        sender: &LinkAddr,
        pkt: &Packet,
        mut at: usize,
        cmd: CmdId,
        tentative_meta: Option<u8>,
        now: Ticks,
    ) {
        let entry = self.nbr.entry_of(sender);
        let Some(handle) = entry.permanent else {
            return;
        };

        if let Some(p) = self.nbr.get_mut(handle).and_then(|n| n.permanent_mut()) {
            match cmd {
                CmdId::Ack => p.sent_authentic_hello = true,
                CmdId::Helloack | CmdId::HelloackP => p.sent_authentic_hello = false,
                _ => {}
            }
            if matches!(cmd, CmdId::Helloack | CmdId::HelloackP | CmdId::Ack) {
                p.my_unicast_seqno = 0;
                p.his_unicast_seqno = 0;
            }
        }
        if !V::WITH_SEQNOS {
            // record the counter of this very frame against replays
            if let Some(nbr) = self.nbr.get_mut(handle) {
                let kind = if pkt.holds_broadcast() {
                    crate::anti_replay::CounterKind::Broadcast
                } else {
                    crate::anti_replay::CounterKind::Unicast
                };
                nbr.anti_replay.was_replayed(kind, pkt.frame_counter);
            }
        }
        {
            let mut ctx = link_ctx!(self, now);
            prolong_permanent(&mut ctx, handle);
        }

        if V::WITH_INDICES {
            if pkt.data_len() <= at {
                warn!("truncated command frame");
                return;
            }
            if let Some(p) = self.nbr.get_mut(handle).and_then(|n| n.permanent_mut()) {
                p.foreign_index = pkt.data()[at];
            }
            at += 1;
        }

        {
            let entry = self.nbr.entry_of(sender);
            let mut ctx = link_ctx!(self, now);
            at += self.strategy.read_piggyback(
                &mut ctx,
                cmd,
                &pkt.data()[at..],
                entry,
                tentative_meta,
            );
        }

        if matches!(cmd, CmdId::Helloack | CmdId::HelloackP | CmdId::Ack) {
            if pkt.data_len() < at + KEY_LEN {
                warn!("truncated command frame");
                return;
            }
            if let Some(p) = self.nbr.get_mut(handle).and_then(|n| n.permanent_mut()) {
                p.group_key.copy_from_slice(&pkt.data()[at..at + KEY_LEN]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csl::{CslMac, Potr, TransmitState};
    use crate::nbr::NbrState;
    use crate::packet::Packet;
    use crate::testutil::{MockRadio, SeqRng, SingleSecret};
    use crate::{PacketToken, Timing};

    type Mac = CslMac<MockRadio, SingleSecret, SeqRng, Potr>;

    struct Sink;

    impl crate::MacClient for Sink {
        fn input(&mut self, _packet: &Packet) {}
        fn sent(&mut self, _token: PacketToken, _status: TxStatus, _transmissions: u8) {}
    }

    fn node(addr: u8) -> Mac {
        CslMac::new(
            MockRadio::new(),
            Timing::default(),
            Config::default(),
            SingleSecret([0x42; 16]),
            SeqRng(addr as u32),
            LinkAddr([addr; 8]),
            0xabcd,
            Ticks(0),
        )
    }

    fn pairwise_key_of(mac: &Mac, peer: &LinkAddr) -> Option<[u8; KEY_LEN]> {
        let entry = mac.nbr.entry_of(peer);
        let handle = entry.permanent?;
        Some(*mac.nbr.get(handle)?.pairwise_key())
    }

    /// The full three-way handshake, radio replaced by hand-carrying the
    /// queued command frames: both sides end up permanent with the same
    /// pairwise key.
    #[test]
    fn three_way_handshake_agrees_on_a_pairwise_key() {
        let mut sink = Sink;
        let mut a = node(1);
        let mut b = node(2);
        let a_addr = LinkAddr([1; 8]);
        let b_addr = LinkAddr([2; 8]);
        let now = Ticks(0);

        // A broadcasts its HELLO
        a.broadcast_hello(now).unwrap();
        let id = a.queue.select_next(now).unwrap();
        let hello = a.queue.remove(id).unwrap().packet;
        a.akes_on_hello_sent(now);
        assert!(a.akes.is_awaiting_helloacks);

        // B hears it and becomes tentative
        let mut hello_rx = hello.clone();
        hello_rx.sender = a_addr;
        b.akes_input(&mut hello_rx, now, &mut sink).unwrap();
        let entry = b.nbr.entry_of(&a_addr);
        assert!(entry.tentative.is_some());
        assert!(entry.permanent.is_none());

        // B's randomly delayed HELLOACK fires
        let later = Ticks(4 * 32768);
        b.akes_poll(later).unwrap();
        let id = b.queue.select_next(later).unwrap();
        let mut helloack = b.queue.remove(id).unwrap().packet;
        assert!(is_helloack_cmd(&helloack));

        // secure it the way the transmit path would, then deliver
        {
            let tx = TransmitState::default();
            let mut ctx = link_ctx!(b, later);
            b.strategy.before_create(&mut ctx, &tx, &mut helloack).unwrap();
            b.strategy.secure(&mut ctx, &tx, &mut helloack).unwrap();
        }
        b.akes_on_helloack_sent(&helloack.receiver, TxStatus::Ok);
        let mut helloack_rx = helloack.clone();
        helloack_rx.sender = b_addr;
        a.akes_input(&mut helloack_rx, later, &mut sink).unwrap();

        // A is now permanent and has queued its ACK
        let key_a = pairwise_key_of(&a, &b_addr).expect("a has no permanent entry for b");
        let b_tentative_key = {
            let entry = b.nbr.entry_of(&a_addr);
            match &b.nbr.get(entry.tentative.unwrap()).unwrap().state {
                NbrState::Tentative(t) => match &t.secret {
                    TentativeSecret::PairwiseKey(k) => *k,
                    _ => panic!("tentative still holds a challenge"),
                },
                _ => panic!("not tentative"),
            }
        };
        assert_eq!(key_a, b_tentative_key);

        let id = a.queue.select_next(later).unwrap();
        let ack = a.queue.remove(id).unwrap().packet;
        assert!(is_ack_cmd(&ack));
        a.akes_on_ack_sent(&ack.receiver, TxStatus::Ok, true, later);

        // B receives the ACK and promotes the tentative in place
        let index_before = b.nbr.entry_of(&a_addr).tentative.unwrap().index();
        let mut ack_rx = ack.clone();
        ack_rx.sender = a_addr;
        b.akes_input(&mut ack_rx, later, &mut sink).unwrap();
        let entry = b.nbr.entry_of(&a_addr);
        assert!(entry.tentative.is_none());
        let promoted = entry.permanent.expect("b has no permanent entry for a");
        assert_eq!(promoted.index(), index_before);
        assert_eq!(pairwise_key_of(&b, &a_addr), Some(key_a));

        // the foreign indices point back at each other
        let a_entry = a.nbr.entry_of(&b_addr).permanent.unwrap();
        let foreign = a
            .nbr
            .get(a_entry)
            .unwrap()
            .permanent()
            .unwrap()
            .foreign_index;
        assert_eq!(foreign, promoted.index());
    }

    /// Repeating a HELLO from a sender that is already tentative yields
    /// no second HELLOACK schedule.
    #[test]
    fn repeated_hello_is_idempotent() {
        let mut sink = Sink;
        let mut a = node(1);
        let mut b = node(2);
        let a_addr = LinkAddr([1; 8]);
        let now = Ticks(0);

        a.broadcast_hello(now).unwrap();
        let id = a.queue.select_next(now).unwrap();
        let hello = a.queue.remove(id).unwrap().packet;

        let mut rx = hello.clone();
        rx.sender = a_addr;
        b.akes_input(&mut rx, now, &mut sink).unwrap();
        assert_eq!(b.nbr.count(NbrStatus::Tentative), 1);

        let mut rx = hello.clone();
        rx.sender = a_addr;
        b.akes_input(&mut rx, now, &mut sink).unwrap();
        assert_eq!(b.nbr.count(NbrStatus::Tentative), 1);

        // exactly one HELLOACK goes out
        let later = Ticks(4 * 32768);
        b.akes_poll(later).unwrap();
        let id = b.queue.select_next(later).unwrap();
        let first = b.queue.remove(id).unwrap();
        assert!(matches!(first.action, SentAction::AkesHelloack));
        if let Some(id) = b.queue.select_next(later) {
            let second = b.queue.get(id).unwrap();
            assert!(!matches!(second.action, SentAction::AkesHelloack));
        }
    }

    /// A flood of HELLOs from distinct rogues stops allocating tentative
    /// entries once the incoming bucket and the tentative cap are hit.
    #[test]
    fn hello_flood_is_rate_limited() {
        let mut sink = Sink;
        let mut b = node(2);
        let now = Ticks(0);

        for i in 10..40u8 {
            let mut a = node(i);
            a.broadcast_hello(now).unwrap();
            let id = a.queue.select_next(now).unwrap();
            let mut hello = a.queue.remove(id).unwrap().packet;
            hello.sender = LinkAddr([i; 8]);
            b.akes_input(&mut hello, now, &mut sink).unwrap();
        }
        // the tentative cap bounds the damage
        assert!(b.nbr.count(NbrStatus::Tentative) <= crate::config::NBR_MAX_TENTATIVES);
    }
}
