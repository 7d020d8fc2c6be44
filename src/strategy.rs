//! Per-frame-class security and scheduling policy.
//!
//! Two strategies exist, paired with the wire-format variants:
//!
//!  - [`Csl`] (POTR): unicasts are secured under the receiver's pairwise
//!    key; a broadcast HELLO carries one MIC per permanent neighbor, each
//!    under that neighbor's pairwise key, indexed by the foreign index;
//!    every other broadcast is decomposed into per-neighbor unicasts by
//!    the scheduler. Handshake commands piggyback the CSL phase, wake-up
//!    counter, and challenge material this variant needs for
//!    synchronization.
//!  - [`Noncoresec`] (compliant): everything is secured under the
//!    sender's group key, and anti-replay runs on frame counters. No
//!    piggybacks; synchronization relies on acknowledgement IEs alone.

use log::error;

use crate::akes::{self, CmdId};
use crate::ccm_inputs::{self, Alpha};
use crate::csl::{LinkCtx, TransmitState};
use crate::framer::potr::{
    parse_phase, write_phase, ACK_PIGGYBACK_LEN, HELLOACK_PIGGYBACK_LEN, HELLO_PIGGYBACK_LEN,
    PHASE_LEN,
};
use crate::framer::FramerError;
use crate::nbr::{Entry, NbrHandle, NbrStatus, CHALLENGE_LEN};
use crate::packet::Packet;
use crate::security::{self, KEY_LEN, MIC_LEN, NONCE_LEN};
use crate::synchronizer::SyncData;
use crate::wake_up_counter::{WakeUpCounter, WAKE_UP_COUNTER_LEN};

/// Verdict on a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verify {
    Success,
    Inauthentic,
    Replayed,
}

pub trait Strategy {
    /// Whether broadcasts are fanned out as per-neighbor unicasts.
    const FAN_OUT_BROADCASTS: bool;

    /// Security overhead appended to the frame in `pkt`.
    fn overhead(&self, pkt: &Packet) -> usize;

    /// Fills piggybacked fields that depend on the transmission schedule.
    /// Runs right before the payload frame header is created.
    fn before_create(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &TransmitState,
        pkt: &mut Packet,
    ) -> Result<(), FramerError>;

    /// Secures the created frame (encrypts and appends MICs).
    fn secure(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &TransmitState,
        pkt: &mut Packet,
    ) -> Result<(), FramerError>;

    /// Unsecures and authenticates a received frame from `sender`.
    fn verify(&mut self, ctx: &mut LinkCtx<'_>, pkt: &mut Packet, sender: NbrHandle) -> Verify;

    /// Unsecures a received frame under an explicitly supplied key, for
    /// handshake messages whose key is derived rather than stored.
    fn unsecure_with_key(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        pkt: &mut Packet,
        key: &[u8; KEY_LEN],
    ) -> Result<(), ()>;

    /// Reserves or writes the command's piggybacked fields; returns the
    /// number of bytes the piggyback occupies.
    fn write_piggyback(&mut self, ctx: &mut LinkCtx<'_>, cmd: CmdId, dst: &mut [u8]) -> usize;

    /// Reads the command's piggybacked fields; returns bytes consumed.
    fn read_piggyback(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        cmd: CmdId,
        src: &[u8],
        entry: Entry,
        tentative_meta: Option<u8>,
    ) -> usize;

    fn on_fresh_authentic_hello(&mut self, ctx: &mut LinkCtx<'_>);
    fn on_fresh_authentic_helloack(&mut self, ctx: &mut LinkCtx<'_>);
}

/// Strips the trailing MIC, optionally decrypts, and authenticates the
/// frame in `pkt` under `key` and `nonce`.
fn unsecure(pkt: &mut Packet, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Result<(), ()> {
    let mic_len = security::mic_len(pkt.sec_lvl);
    let data_len = pkt.data_len();
    if data_len < mic_len {
        return Err(());
    }
    let mut mic = [0u8; MIC_LEN];
    mic.copy_from_slice(&pkt.data()[data_len - mic_len..]);
    pkt.set_data_len(data_len - mic_len).map_err(|_| ())?;

    if security::has_encryption(pkt.sec_lvl) {
        let unencrypted = pkt.unencrypted as usize;
        let (hdr, data) = pkt.hdr_and_data_mut();
        // associated data covers the header and any cleartext prefix
        let (clear, m) = data.split_at_mut(unencrypted);
        let mut a = [0u8; crate::config::MAX_FRAME_LEN];
        let a_len = hdr.len() + clear.len();
        a[..hdr.len()].copy_from_slice(hdr);
        a[hdr.len()..a_len].copy_from_slice(clear);
        security::decrypt(key, nonce, &a[..a_len], m, &mic).map_err(|_| ())
    } else {
        security::verify_auth_tag(key, nonce, pkt.frame(), &mic).map_err(|_| ())
    }
}

/// Encrypts (as the security level demands) and returns the MIC.
fn secure_in_place(
    pkt: &mut Packet,
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> [u8; MIC_LEN] {
    if security::has_encryption(pkt.sec_lvl) {
        let unencrypted = pkt.unencrypted as usize;
        let (hdr, data) = pkt.hdr_and_data_mut();
        let (clear, m) = data.split_at_mut(unencrypted);
        let mut a = [0u8; crate::config::MAX_FRAME_LEN];
        let a_len = hdr.len() + clear.len();
        a[..hdr.len()].copy_from_slice(hdr);
        a[hdr.len()..a_len].copy_from_slice(clear);
        security::encrypt(key, nonce, &a[..a_len], m)
    } else {
        security::auth_tag(key, nonce, pkt.frame())
    }
}

/// Reconstructs the wake-up counter a POTR HELLO sender had when the
/// HELLO's SHR left its radio, from our sync data about that sender.
fn restore_wake_up_counter(ctx: &LinkCtx<'_>, sender: NbrHandle) -> WakeUpCounter {
    let csl_nbr = ctx.sync.of(sender);
    let Some(sync) = csl_nbr.sync else {
        error!("could not restore wake-up counter");
        return WakeUpCounter(0);
    };
    let compensation = match csl_nbr.drift {
        Some(drift) => {
            let seconds = ctx
                .timing
                .ticks_to_s(ctx.clock.last_payload_sfd.diff(sync.t).max(0) as u32);
            ((drift as i64 * seconds as i64) / 1_000_000) as i32
        }
        None => 0,
    };
    let interval = ctx.clock.timebase.interval();
    let delta = ctx
        .clock
        .last_payload_sfd
        .0
        .wrapping_sub(sync.t.0)
        .wrapping_add(compensation as u32)
        .wrapping_sub(interval / 2);
    WakeUpCounter(
        sync.his_wake_up_counter_at_t
            .0
            .wrapping_add(ctx.clock.timebase.round_increments(delta)),
    )
}

const HELLO_PIGGYBACK_OFFSET: usize = 1 + CHALLENGE_LEN;
const HELLOACK_PIGGYBACK_OFFSET: usize = 1 + CHALLENGE_LEN + 1;

/// The POTR-mode strategy: pairwise keys everywhere.
#[derive(Default)]
pub struct Csl {
    /// Our pending HELLOACK challenge, echoed back inside the ACK.
    q: [u8; CHALLENGE_LEN],
    /// CSL phase of the HELLOACK we answered, piggybacked on the ACK.
    phi_2: u16,
}

impl Csl {
    fn unicast_nonce(
        &self,
        ctx: &LinkCtx<'_>,
        tx: Option<&TransmitState>,
        pkt: &Packet,
    ) -> [u8; NONCE_LEN] {
        match tx {
            Some(tx) => ccm_inputs::potr_nonce(
                &ctx.node_addr,
                Alpha::Unicast,
                pkt.burst_index,
                tx.receivers_wake_up_counter,
            ),
            None => ccm_inputs::potr_nonce(
                &pkt.sender,
                Alpha::Unicast,
                pkt.burst_index,
                ctx.clock.wake_up_counter,
            ),
        }
    }
}

impl Strategy for Csl {
    const FAN_OUT_BROADCASTS: bool = true;

    fn overhead(&self, _pkt: &Packet) -> usize {
        MIC_LEN
    }

    fn before_create(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &TransmitState,
        pkt: &mut Packet,
    ) -> Result<(), FramerError> {
        let shr_end = tx.payload_frames_shr_end(ctx.timing);
        if akes::is_hello_cmd(pkt) {
            let wuc = ctx.clock.wake_up_counter_at(shr_end);
            wuc.write(&mut pkt.data_mut()[HELLO_PIGGYBACK_OFFSET..]);
        } else if akes::is_helloack_cmd(pkt) {
            let entry = ctx.nbr.entry_of(&pkt.receiver);
            let Some(handle) = entry.tentative else {
                return Err(FramerError::MissingNeighbor);
            };
            let Some(meta_index) = ctx.nbr.meta_index_of(handle) else {
                return Err(FramerError::MissingNeighbor);
            };
            let mut q = [0u8; CHALLENGE_LEN];
            ctx.rng.fill_bytes(&mut q);
            let predicted = tx.receivers_wake_up_counter;
            let tentative = ctx.sync.tentative_mut(meta_index);
            tentative.helloack_sfd_timestamp = shr_end;
            tentative.q = q;
            tentative.predicted_wake_up_counter = predicted;

            let phase = ctx.clock.phase(shr_end);
            let wuc = ctx.clock.wake_up_counter_at(shr_end);
            let data = &mut pkt.data_mut()[HELLOACK_PIGGYBACK_OFFSET..];
            write_phase(&mut data[..PHASE_LEN], phase);
            wuc.write(&mut data[PHASE_LEN..]);
            data[PHASE_LEN + WAKE_UP_COUNTER_LEN..PHASE_LEN + WAKE_UP_COUNTER_LEN + CHALLENGE_LEN]
                .copy_from_slice(&q);
        }
        Ok(())
    }

    fn secure(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &TransmitState,
        pkt: &mut Packet,
    ) -> Result<(), FramerError> {
        if akes::is_hello_cmd(pkt) {
            // one MIC per permanent neighbor, positioned by our index in
            // its table so each receiver finds its own
            let shr_end = tx.payload_frames_shr_end(ctx.timing);
            let wuc = ctx.clock.wake_up_counter_at(shr_end);
            let nonce = ccm_inputs::potr_nonce(&ctx.node_addr, Alpha::Hello, 0, wuc);
            let datalen = pkt.data_len();
            let mut max_index: Option<u8> = None;
            for handle in ctx.nbr.handles() {
                let Some(permanent) = ctx.nbr.get(handle).and_then(|n| n.permanent()) else {
                    continue;
                };
                let key = permanent.pairwise_key;
                let local_index = handle.index();
                let mic = security::auth_tag(&key, &nonce, pkt.frame());
                let at = datalen + local_index as usize * MIC_LEN;
                pkt.set_data_len(at + MIC_LEN)?;
                pkt.data_mut()[at..at + MIC_LEN].copy_from_slice(&mic);
                pkt.set_data_len(datalen)?;
                max_index = Some(max_index.map_or(local_index, |m| m.max(local_index)));
            }
            if let Some(max_index) = max_index {
                pkt.set_data_len(datalen + (max_index as usize + 1) * MIC_LEN)?;
            }
            Ok(())
        } else {
            let status = akes::receiver_status(ctx.akes, pkt);
            let entry = ctx.nbr.entry_of(&pkt.receiver);
            let Some(nbr) = entry.of(status).and_then(|h| ctx.nbr.get(h)) else {
                return Err(FramerError::MissingNeighbor);
            };
            let key = *nbr.pairwise_key();
            let nonce = self.unicast_nonce(ctx, Some(tx), pkt);
            let mic = secure_in_place(pkt, &key, &nonce);
            let datalen = pkt.data_len();
            pkt.set_data_len(datalen + MIC_LEN)?;
            pkt.data_mut()[datalen..datalen + MIC_LEN].copy_from_slice(&mic);
            Ok(())
        }
    }

    fn verify(&mut self, ctx: &mut LinkCtx<'_>, pkt: &mut Packet, sender: NbrHandle) -> Verify {
        if akes::is_hello_cmd(pkt) {
            let Some(nbr) = ctx.nbr.get(sender) else {
                return Verify::Inauthentic;
            };
            let Some(permanent) = nbr.permanent() else {
                return Verify::Inauthentic;
            };
            let key = permanent.pairwise_key;
            let foreign_index = permanent.foreign_index;
            let payload_len = akes::HELLO_DATALEN + HELLO_PIGGYBACK_LEN;
            let mic_at = payload_len + foreign_index as usize * MIC_LEN;
            if pkt.data_len() < mic_at + MIC_LEN {
                error!("inauthentic hello");
                return Verify::Inauthentic;
            }
            let mut mic = [0u8; MIC_LEN];
            mic.copy_from_slice(&pkt.data()[mic_at..mic_at + MIC_LEN]);
            if pkt.set_data_len(payload_len).is_err() {
                return Verify::Inauthentic;
            }
            let wuc = restore_wake_up_counter(ctx, sender);
            let nonce = ccm_inputs::potr_nonce(&pkt.sender, Alpha::Hello, 0, wuc);
            match security::verify_auth_tag(&key, &nonce, pkt.frame(), &mic) {
                Ok(()) => Verify::Success,
                Err(_) => {
                    error!("inauthentic hello");
                    Verify::Inauthentic
                }
            }
        } else {
            let Some(nbr) = ctx.nbr.get(sender) else {
                return Verify::Inauthentic;
            };
            let key = *nbr.pairwise_key();
            let nonce = self.unicast_nonce(ctx, None, pkt);
            match unsecure(pkt, &key, &nonce) {
                Ok(()) => Verify::Success,
                Err(()) => {
                    error!("inauthentic unicast");
                    Verify::Inauthentic
                }
            }
        }
    }

    fn unsecure_with_key(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        pkt: &mut Packet,
        key: &[u8; KEY_LEN],
    ) -> Result<(), ()> {
        let nonce = self.unicast_nonce(ctx, None, pkt);
        unsecure(pkt, key, &nonce)
    }

    fn write_piggyback(&mut self, _ctx: &mut LinkCtx<'_>, cmd: CmdId, dst: &mut [u8]) -> usize {
        match cmd {
            // the wake-up counter is filled in once the schedule is known
            CmdId::Hello => HELLO_PIGGYBACK_LEN,
            CmdId::Helloack | CmdId::HelloackP => HELLOACK_PIGGYBACK_LEN,
            CmdId::Ack => {
                write_phase(&mut dst[..PHASE_LEN], self.phi_2);
                dst[PHASE_LEN..PHASE_LEN + CHALLENGE_LEN].copy_from_slice(&self.q);
                ACK_PIGGYBACK_LEN
            }
            CmdId::Update => 0,
        }
    }

    fn read_piggyback(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        cmd: CmdId,
        src: &[u8],
        entry: Entry,
        tentative_meta: Option<u8>,
    ) -> usize {
        let interval = ctx.clock.timebase.interval();
        match cmd {
            CmdId::Hello => {
                if let Some(handle) = entry.tentative {
                    let csl_nbr = ctx.sync.of_mut(handle);
                    csl_nbr.sync = Some(SyncData {
                        t: ctx.clock.last_payload_sfd - interval / 2,
                        his_wake_up_counter_at_t: WakeUpCounter::parse(src),
                    });
                }
                HELLO_PIGGYBACK_LEN
            }
            CmdId::Helloack | CmdId::HelloackP => {
                let phase = parse_phase(&src[..PHASE_LEN]);
                let wuc = WakeUpCounter::parse(&src[PHASE_LEN..]);
                self.q
                    .copy_from_slice(&src[PHASE_LEN + WAKE_UP_COUNTER_LEN..HELLOACK_PIGGYBACK_LEN]);
                self.phi_2 = ctx.clock.phase(ctx.clock.last_payload_sfd);
                if let Some(handle) = entry.permanent {
                    let last_payload_sfd = ctx.clock.last_payload_sfd;
                    let csl_nbr = ctx.sync.of_mut(handle);
                    csl_nbr.sync = Some(SyncData {
                        t: last_payload_sfd - (interval - phase as u32),
                        his_wake_up_counter_at_t: wuc,
                    });
                    csl_nbr.drift = None;
                }
                HELLOACK_PIGGYBACK_LEN
            }
            CmdId::Ack => {
                let phase = parse_phase(&src[..PHASE_LEN]);
                if let (Some(handle), Some(meta)) = (entry.permanent, tentative_meta) {
                    let tentative = *ctx.sync.tentative(meta);
                    let csl_nbr = ctx.sync.of_mut(handle);
                    let sync = SyncData {
                        t: tentative.helloack_sfd_timestamp - (interval - phase as u32),
                        his_wake_up_counter_at_t: tentative.predicted_wake_up_counter,
                    };
                    csl_nbr.sync = Some(sync);
                    csl_nbr.drift = None;
                    csl_nbr.historical_sync = sync;
                }
                ACK_PIGGYBACK_LEN
            }
            CmdId::Update => 0,
        }
    }

    fn on_fresh_authentic_hello(&mut self, ctx: &mut LinkCtx<'_>) {
        ctx.akes.inc_hello_bucket.effuse();
    }

    fn on_fresh_authentic_helloack(&mut self, ctx: &mut LinkCtx<'_>) {
        ctx.akes.inc_helloack_bucket.effuse();
    }
}

/// The compliant-mode strategy: group keys and frame counters.
#[derive(Default)]
pub struct Noncoresec;

impl Strategy for Noncoresec {
    const FAN_OUT_BROADCASTS: bool = false;

    fn overhead(&self, pkt: &Packet) -> usize {
        security::mic_len(pkt.sec_lvl)
    }

    fn before_create(
        &mut self,
        _ctx: &mut LinkCtx<'_>,
        _tx: &TransmitState,
        _pkt: &mut Packet,
    ) -> Result<(), FramerError> {
        Ok(())
    }

    fn secure(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        _tx: &TransmitState,
        pkt: &mut Packet,
    ) -> Result<(), FramerError> {
        if pkt.sec_lvl == 0 {
            return Ok(());
        }
        let key = if akes::receiver_status(ctx.akes, pkt) == NbrStatus::Tentative {
            let entry = ctx.nbr.entry_of(&pkt.receiver);
            let Some(nbr) = entry.tentative.and_then(|h| ctx.nbr.get(h)) else {
                error!("receiver is not tentative");
                return Err(FramerError::MissingNeighbor);
            };
            *nbr.pairwise_key()
        } else {
            ctx.akes.group_key
        };
        let nonce = ccm_inputs::compliant_nonce(&ctx.node_addr, pkt.frame_counter, pkt.sec_lvl);
        let mic = secure_in_place(pkt, &key, &nonce);
        let mic_len = security::mic_len(pkt.sec_lvl);
        let datalen = pkt.data_len();
        pkt.set_data_len(datalen + mic_len)?;
        pkt.data_mut()[datalen..datalen + mic_len].copy_from_slice(&mic[..mic_len]);
        Ok(())
    }

    fn verify(&mut self, ctx: &mut LinkCtx<'_>, pkt: &mut Packet, sender: NbrHandle) -> Verify {
        let Some(nbr) = ctx.nbr.get(sender) else {
            return Verify::Inauthentic;
        };
        let Some(permanent) = nbr.permanent() else {
            return Verify::Inauthentic;
        };
        let key = permanent.group_key;
        let nonce = ccm_inputs::compliant_nonce(&pkt.sender, pkt.frame_counter, pkt.sec_lvl);
        if unsecure(pkt, &key, &nonce).is_err() {
            error!("inauthentic frame");
            return Verify::Inauthentic;
        }
        let kind = if pkt.holds_broadcast() {
            crate::anti_replay::CounterKind::Broadcast
        } else {
            crate::anti_replay::CounterKind::Unicast
        };
        let counter = pkt.frame_counter;
        let Some(nbr) = ctx.nbr.get_mut(sender) else {
            return Verify::Inauthentic;
        };
        if nbr.anti_replay.was_replayed(kind, counter) {
            error!("replayed");
            return Verify::Replayed;
        }
        Verify::Success
    }

    fn unsecure_with_key(
        &mut self,
        _ctx: &mut LinkCtx<'_>,
        pkt: &mut Packet,
        key: &[u8; KEY_LEN],
    ) -> Result<(), ()> {
        let nonce = ccm_inputs::compliant_nonce(&pkt.sender, pkt.frame_counter, pkt.sec_lvl);
        unsecure(pkt, key, &nonce)
    }

    fn write_piggyback(&mut self, _ctx: &mut LinkCtx<'_>, _cmd: CmdId, _dst: &mut [u8]) -> usize {
        0
    }

    fn read_piggyback(
        &mut self,
        _ctx: &mut LinkCtx<'_>,
        _cmd: CmdId,
        _src: &[u8],
        _entry: Entry,
        _tentative_meta: Option<u8>,
    ) -> usize {
        0
    }

    fn on_fresh_authentic_hello(&mut self, _ctx: &mut LinkCtx<'_>) {}

    fn on_fresh_authentic_helloack(&mut self, _ctx: &mut LinkCtx<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csl::TransmitState;
    use crate::packet::{FrameType, Packet};
    use crate::testutil::TestNode;
    use crate::time::Ticks;

    /// a broadcasts a HELLO with one MIC per permanent neighbor; each
    /// receiver locates and checks its own via the foreign index.
    #[test]
    fn hello_carries_one_mic_per_permanent_neighbor() {
        let mut a = TestNode::new(1);
        let mut b = TestNode::new(2);
        let mut c = TestNode::new(3);
        let key_ab = [0xab; 16];
        let key_ac = [0xac; 16];

        let b_in_a = a.nbr.new_nbr(b.addr, NbrStatus::Permanent).unwrap();
        let c_in_a = a.nbr.new_nbr(c.addr, NbrStatus::Permanent).unwrap();
        a.nbr
            .get_mut(b_in_a)
            .unwrap()
            .permanent_mut()
            .unwrap()
            .pairwise_key = key_ab;
        a.nbr
            .get_mut(c_in_a)
            .unwrap()
            .permanent_mut()
            .unwrap()
            .pairwise_key = key_ac;

        let interval = 4096u32;
        for (node, key, a_index) in [(&mut b, key_ab, b_in_a), (&mut c, key_ac, c_in_a)] {
            let a_in_node = node.nbr.new_nbr(a.addr, NbrStatus::Permanent).unwrap();
            let p = node.nbr.get_mut(a_in_node).unwrap().permanent_mut().unwrap();
            p.pairwise_key = key;
            p.foreign_index = a_index.index();
            node.last_payload_sfd = Ticks(10_000);
            node.sync.of_mut(a_in_node).sync = Some(SyncData {
                t: Ticks(10_000 - interval / 2),
                his_wake_up_counter_at_t: WakeUpCounter(0),
            });
        }

        let mut strategy = Csl::default();
        let tx = TransmitState::default();
        let mut pkt = Packet::new();
        let mut payload = [0u8; 13];
        payload[0] = CmdId::Hello as u8;
        payload[1..9].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        pkt.set_data(&payload).unwrap();
        pkt.receiver = crate::LinkAddr::NULL;
        pkt.frame_type = FrameType::Command;
        pkt.sec_lvl = crate::security::SEC_LVL & 3;
        {
            let mut ctx = a.ctx(Ticks(0));
            strategy.before_create(&mut ctx, &tx, &mut pkt).unwrap();
            strategy.secure(&mut ctx, &tx, &mut pkt).unwrap();
        }
        assert_eq!(pkt.data_len(), 13 + 2 * MIC_LEN);

        for node in [&mut b, &mut c] {
            let mut strategy = Csl::default();
            let mut rx = pkt.clone();
            rx.sender = a.addr;
            let a_in_node = node.nbr.entry_of(&a.addr).permanent.unwrap();
            let mut ctx = node.ctx(Ticks(10_000));
            assert_eq!(strategy.verify(&mut ctx, &mut rx, a_in_node), Verify::Success);
            assert_eq!(rx.data_len(), 13);
        }

        // a flipped challenge bit kills the MIC
        let mut strategy_b = Csl::default();
        let mut rx = pkt.clone();
        rx.sender = a.addr;
        {
            let data = rx.data_mut();
            data[1] ^= 1;
        }
        let a_in_b = b.nbr.entry_of(&a.addr).permanent.unwrap();
        let mut ctx = b.ctx(Ticks(10_000));
        assert_eq!(
            strategy_b.verify(&mut ctx, &mut rx, a_in_b),
            Verify::Inauthentic
        );
    }
}
