//! Practical on-the-fly rejection (POTR): the compressed wire format.
//!
//! Wake-up frame (body; a 6-byte PHY header precedes it on air):
//!
//! ```norust
//!  1                    | 0/2     | 0/1       | 0/1          | 0/2 | 1/2
//! subtype<<6 | 0x37     | dst PAN | src index | payload len  | OTP | rendezvous time
//! ```
//!
//! HELLO and HELLOACK carry the destination PAN ID (byte 0 XORed with the
//! current channel, binding the frame to it); ACK and NORMAL instead carry
//! the source index, the payload frame's length, and an OTP: a truncated
//! CCM* MIC over that length byte under the pairwise key. A receiver that
//! cannot verify the OTP turns its radio off without waiting for the
//! payload; that is the rejection that gives the format its name.
//!
//! Payload frame:
//!
//! ```norust
//!  1                      | 0/8      | 0/1   | 0/1         | n       | 8
//! flags | subtype | 0x37  | src addr | seqno | pending len | payload | MIC
//! ```
//!
//! Acknowledgement frame:
//!
//! ```norust
//!  1    | 0/2       | 8
//! 0x37  | CSL phase | MIC
//! ```
//!
//! A HELLOACK is acknowledged with the bare type byte: no key is
//! confirmed yet at that point, so a MIC would prove nothing.

use log::{error, info, warn};

use crate::akes;
use crate::ccm_inputs::{self, Alpha};
use crate::config::Config;
use crate::csl::{DutyCycleState, LinkCtx, TransmitState};
use crate::framer::{wake_up_sequence_length, Framer, FramerError, Subtype};
use crate::packet::{FrameType, Packet};
use crate::radio::{Radio, Timing};
use crate::security::{self, MIC_LEN};
use crate::LinkAddr;

/// Low six bits of every POTR frame type byte: the short-frame prefix
/// `111` plus the unused extended frame type `110`.
pub const EXTENDED_FRAME_TYPE: u8 = 0x7 | (0x6 << 3);

pub const EXTENDED_FRAME_TYPE_LEN: usize = 1;
pub const PAN_ID_LEN: usize = 2;
pub const SOURCE_INDEX_LEN: usize = 1;
pub const PAYLOAD_FRAMES_LEN_LEN: usize = 1;
pub const OTP_LEN: usize = 2;
pub const SEQUENCE_NUMBER_LEN: usize = 1;
pub const LONG_RENDEZVOUS_TIME_LEN: usize = 2;
pub const SHORT_RENDEZVOUS_TIME_LEN: usize = 1;
pub const PHASE_LEN: usize = 2;

/// Piggybacked handshake payloads (see [`crate::strategy`]).
pub const HELLO_PIGGYBACK_LEN: usize = 4;
pub const HELLOACK_PIGGYBACK_LEN: usize = PHASE_LEN + 4 + 8;
pub const ACK_PIGGYBACK_LEN: usize = PHASE_LEN + 8;

/// Wake-up frame body lengths by subtype.
const HELLO_BODY_LEN: usize = EXTENDED_FRAME_TYPE_LEN + PAN_ID_LEN + LONG_RENDEZVOUS_TIME_LEN;
const HELLOACK_BODY_LEN: usize = EXTENDED_FRAME_TYPE_LEN + PAN_ID_LEN + SHORT_RENDEZVOUS_TIME_LEN;
const ACK_BODY_LEN: usize = EXTENDED_FRAME_TYPE_LEN
    + SOURCE_INDEX_LEN
    + PAYLOAD_FRAMES_LEN_LEN
    + OTP_LEN
    + SHORT_RENDEZVOUS_TIME_LEN;
const NORMAL_BODY_LEN: usize = ACK_BODY_LEN;
const MIN_BODY_LEN: usize = HELLOACK_BODY_LEN;
const MAX_BODY_LEN: usize = ACK_BODY_LEN;

const MIN_NORMAL_PAYLOAD_FRAME_LEN: usize =
    EXTENDED_FRAME_TYPE_LEN + SEQUENCE_NUMBER_LEN + MIC_LEN;

/// Total length of an ACK command payload frame, which is fixed.
pub const ACK_PAYLOAD_FRAME_LEN: usize =
    EXTENDED_FRAME_TYPE_LEN + akes::ACK_DATALEN + ACK_PIGGYBACK_LEN;

pub const MAX_ACKNOWLEDGEMENT_LEN: usize = EXTENDED_FRAME_TYPE_LEN + PHASE_LEN + MIC_LEN;

/// Number of wake-up frames preceding a HELLO. The sequence spans one
/// full wake-up interval per channel so that every neighbor samples it,
/// whatever channel its counter put it on.
pub fn hello_wake_up_sequence_length(cfg: &Config, timing: &Timing, interval: u32) -> u32 {
    wake_up_sequence_length(
        timing,
        interval * cfg.channels.len() as u32,
        HELLO_BODY_LEN as u32 + timing.phy_header_len,
    )
}

/// Air time of the wake-up sequence preceding a HELLO, in ticks.
pub fn hello_wake_up_sequence_tx_time(cfg: &Config, timing: &Timing, interval: u32) -> u32 {
    timing.time_to_transmit(
        hello_wake_up_sequence_length(cfg, timing, interval)
            * (HELLO_BODY_LEN as u32 + timing.phy_header_len)
            * timing.symbols_per_byte,
    )
}

pub fn write_phase(dst: &mut [u8], phase: u16) {
    dst[0] = (phase >> 8) as u8;
    dst[1] = phase as u8;
}

pub fn parse_phase(src: &[u8]) -> u16 {
    (src[0] as u16) << 8 | src[1] as u16
}

fn rendezvous_time_len(subtype: Subtype) -> usize {
    match subtype {
        // a HELLO's wake-up sequence spans all channels, so its frame
        // countdown does not fit one byte
        Subtype::Hello => LONG_RENDEZVOUS_TIME_LEN,
        _ => SHORT_RENDEZVOUS_TIME_LEN,
    }
}

fn has_destination_pan_id(subtype: Subtype) -> bool {
    matches!(subtype, Subtype::Hello | Subtype::Helloack)
}

fn has_otp_etc(subtype: Subtype) -> bool {
    matches!(subtype, Subtype::Ack | Subtype::Normal)
}

fn has_source_address(subtype: Subtype) -> bool {
    matches!(subtype, Subtype::Hello | Subtype::Helloack)
}

fn has_seqno(subtype: Subtype) -> bool {
    matches!(subtype, Subtype::Normal)
}

fn payload_frame_header_len(subtype: Subtype, frame_pending: bool) -> usize {
    EXTENDED_FRAME_TYPE_LEN
        + if has_source_address(subtype) { LinkAddr::LEN } else { 0 }
        + if has_seqno(subtype) { SEQUENCE_NUMBER_LEN } else { 0 }
        + if frame_pending { PAYLOAD_FRAMES_LEN_LEN } else { 0 }
}

fn body_len(subtype: Subtype) -> usize {
    match subtype {
        Subtype::Hello => HELLO_BODY_LEN,
        Subtype::Helloack => HELLOACK_BODY_LEN,
        Subtype::Ack => ACK_BODY_LEN,
        Subtype::Normal => NORMAL_BODY_LEN,
    }
}

/// Reads `n` bytes of the frame under reception into the packet, keeping
/// `dc.bytes_read` in step with the radio FIFO.
fn read_into(
    radio: &mut impl Radio,
    dc: &mut DutyCycleState,
    n: usize,
) -> Result<(), FramerError> {
    let burst = dc.last_burst_index as usize;
    let pos = dc.bytes_read as usize;
    let pkt = &mut dc.packets[burst];
    radio.read_payload(&mut pkt.data_mut()[pos..pos + n])?;
    dc.bytes_read += n as u8;
    Ok(())
}

#[derive(Default)]
pub struct PotrFramer;

impl Framer for PotrFramer {
    fn init(&mut self, _cfg: &Config) {}

    fn max_header_len(&self) -> usize {
        payload_frame_header_len(Subtype::Normal, true)
    }

    fn create_payload_header(
        &self,
        ctx: &mut LinkCtx<'_>,
        pkt: &mut Packet,
        subtype: Subtype,
    ) -> Result<usize, FramerError> {
        let pending_frames_len = pkt.pending;
        let len = payload_frame_header_len(subtype, pending_frames_len != 0);
        pkt.hdralloc(len)?;

        let is_command = subtype == Subtype::Normal && pkt.frame_type == FrameType::Command;
        let node_addr = ctx.node_addr;
        let seqno = pkt.seqno;
        let hdr = pkt.hdr_mut();
        hdr[0] = EXTENDED_FRAME_TYPE
            | if is_command { 1 << 6 } else { 0 }
            | if pending_frames_len != 0 { 1 << 7 } else { 0 };
        let mut at = EXTENDED_FRAME_TYPE_LEN;

        if has_source_address(subtype) {
            hdr[at..at + LinkAddr::LEN].copy_from_slice(node_addr.as_bytes());
            at += LinkAddr::LEN;
        }
        if has_seqno(subtype) {
            hdr[at] = seqno;
            at += SEQUENCE_NUMBER_LEN;
        }
        if pending_frames_len != 0 {
            hdr[at] = pending_frames_len;
        }
        Ok(len)
    }

    fn parse_payload_header(
        &self,
        pkt: &mut Packet,
        subtype: Subtype,
    ) -> Result<usize, FramerError> {
        let len = payload_frame_header_len(subtype, pkt.pending != 0);
        pkt.hdrreduce(len)?;

        // the announced subtype must match the command inside
        let cmd = akes::CmdId::from_byte(pkt.data().first().copied().unwrap_or(0));
        let consistent = match subtype {
            Subtype::Hello => matches!(cmd, Some(akes::CmdId::Hello)),
            Subtype::Helloack => {
                matches!(cmd, Some(akes::CmdId::Helloack | akes::CmdId::HelloackP))
            }
            Subtype::Ack => matches!(cmd, Some(akes::CmdId::Ack)),
            Subtype::Normal => true,
        };
        if pkt.frame_type == FrameType::Command && !consistent {
            error!("mismatching subtype and command id");
            return Err(FramerError::Type);
        }
        Ok(len)
    }

    fn wake_up_frame_body_len(&self, _timing: &Timing, subtype: Subtype) -> u8 {
        body_len(subtype) as u8
    }

    fn create_wake_up_frame(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        dst: &mut [u8],
    ) -> Result<(), FramerError> {
        let subtype = tx.subtype;
        dst[0] = body_len(subtype) as u8;
        dst[1] = EXTENDED_FRAME_TYPE | ((subtype as u8) << 6);
        let mut at = 1 + EXTENDED_FRAME_TYPE_LEN;

        if has_destination_pan_id(subtype) {
            dst[at] = (ctx.pan_id as u8) ^ ctx.channel;
            dst[at + 1] = (ctx.pan_id >> 8) as u8;
            at += PAN_ID_LEN;
        }

        if has_otp_etc(subtype) {
            let entry = ctx.nbr.entry_of(&tx.receiver);
            let Some(handle) = entry.permanent else {
                return Err(FramerError::MissingNeighbor);
            };
            let Some(permanent) = ctx.nbr.get(handle).and_then(|n| n.permanent()) else {
                return Err(FramerError::MissingNeighbor);
            };
            dst[at] = permanent.foreign_index;
            at += SOURCE_INDEX_LEN;

            let payload_frames_length = tx.payload_frame[0][0];
            dst[at] = payload_frames_length;
            at += PAYLOAD_FRAMES_LEN_LEN;

            let nonce = ccm_inputs::otp_nonce(&ctx.node_addr, tx.receivers_wake_up_counter);
            let otp =
                security::auth_tag(&permanent.pairwise_key, &nonce, &[payload_frames_length]);
            dst[at..at + OTP_LEN].copy_from_slice(&otp[..OTP_LEN]);
        }

        // the rendezvous time is patched per copy while streaming
        tx.rendezvous_time_len = rendezvous_time_len(subtype) as u8;
        Ok(())
    }

    fn update_rendezvous_time(
        &self,
        remaining_wake_up_frames: u16,
        rendezvous_time_len: u8,
        frame: &mut [u8],
    ) {
        let body = frame[0] as usize;
        let len = rendezvous_time_len as usize;
        let bytes = remaining_wake_up_frames.to_le_bytes();
        frame[1 + body - len..1 + body].copy_from_slice(&bytes[..len]);
    }

    fn parse_wake_up_frame(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        dc: &mut DutyCycleState,
    ) -> Result<(), FramerError> {
        let datalen = radio.read_phy_header()? as usize;
        if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&datalen) {
            warn!("invalid wake-up frame");
            return Err(FramerError::Length { have: datalen });
        }
        dc.packets[0].set_data_len(datalen)?;
        dc.bytes_read = 0;

        read_into(radio, dc, EXTENDED_FRAME_TYPE_LEN)?;
        let type_byte = dc.packets[0].data()[0];
        if type_byte & 0x3f != EXTENDED_FRAME_TYPE {
            warn!("invalid frame type");
            return Err(FramerError::Type);
        }
        let subtype = Subtype::from_bits(type_byte >> 6);
        dc.subtype = subtype;
        if datalen != body_len(subtype) {
            warn!("invalid length");
            return Err(FramerError::Length { have: datalen });
        }
        let mut at = EXTENDED_FRAME_TYPE_LEN;

        if has_destination_pan_id(subtype) {
            read_into(radio, dc, PAN_ID_LEN)?;
            let data = dc.packets[0].data();
            let dst_pid = (data[at] ^ ctx.channel) as u16 | (data[at + 1] as u16) << 8;
            if dst_pid != ctx.pan_id && dst_pid != crate::ieee802154::PAN_ID_BROADCAST {
                info!("for another pan {:04x}", dst_pid);
                return Err(FramerError::Pan { pan: dst_pid });
            }
            at += PAN_ID_LEN;
        }

        match subtype {
            Subtype::Hello => {
                if ctx.akes.inc_hello_bucket.is_full(ctx.now_s) {
                    warn!("hello bucket is full");
                    return Err(FramerError::BucketFull);
                }
            }
            Subtype::Helloack => {
                if !akes::is_acceptable_helloack(ctx) {
                    error!("unacceptable helloack");
                    return Err(FramerError::Unacceptable);
                }
                if ctx.akes.inc_helloack_bucket.is_full(ctx.now_s) {
                    warn!("helloack bucket is full");
                    return Err(FramerError::BucketFull);
                }
            }
            _ => {}
        }

        if has_otp_etc(subtype) {
            read_into(radio, dc, SOURCE_INDEX_LEN)?;
            let index = dc.packets[0].data()[at];
            at += SOURCE_INDEX_LEN;
            let Some(handle) = ctx.nbr.by_index(index) else {
                warn!("invalid index");
                return Err(FramerError::UnknownIndex);
            };
            if subtype == Subtype::Ack && !akes::is_acceptable_ack(ctx.nbr, handle) {
                error!("unacceptable ack");
                return Err(FramerError::Unacceptable);
            }
            let nbr = ctx.nbr.get(handle).ok_or(FramerError::UnknownIndex)?;
            let sender = nbr.addr;
            let key = *nbr.pairwise_key();
            dc.packets[0].sender = sender;
            dc.sender = sender;

            read_into(radio, dc, PAYLOAD_FRAMES_LEN_LEN)?;
            let next_frames_len = dc.packets[0].data()[at];
            at += PAYLOAD_FRAMES_LEN_LEN;
            dc.next_frames_len = next_frames_len;
            match subtype {
                Subtype::Ack => {
                    if next_frames_len as usize != ACK_PAYLOAD_FRAME_LEN {
                        error!("ack has invalid length");
                        return Err(FramerError::Length {
                            have: next_frames_len as usize,
                        });
                    }
                }
                Subtype::Normal => {
                    if (next_frames_len as usize) <= MIN_NORMAL_PAYLOAD_FRAME_LEN {
                        error!("payload frame is too short");
                        return Err(FramerError::Length {
                            have: next_frames_len as usize,
                        });
                    }
                }
                _ => {}
            }

            let nonce = ccm_inputs::otp_nonce(&sender, ctx.clock.wake_up_counter);
            let otp = security::auth_tag(&key, &nonce, &[next_frames_len]);
            read_into(radio, dc, OTP_LEN)?;
            if dc.packets[0].data()[at..at + OTP_LEN] != otp[..OTP_LEN] {
                warn!("invalid otp");
                return Err(FramerError::Otp);
            }
            at += OTP_LEN;
        }

        let rendezvous_len = rendezvous_time_len(subtype);
        read_into(radio, dc, rendezvous_len)?;
        let data = dc.packets[0].data();
        let mut remaining = [0u8; 2];
        remaining[..rendezvous_len].copy_from_slice(&data[at..at + rendezvous_len]);
        let remaining = u16::from_le_bytes(remaining);
        dc.remaining_wake_up_frames = remaining;

        let timing = ctx.timing;
        let on_air_len = datalen as u32 + timing.phy_header_len;
        let symbol_periods = timing.symbols_per_byte * remaining as u32 * on_air_len
            + timing.symbols_per_byte * (on_air_len - timing.shr_len);
        dc.rendezvous_time =
            dc.wake_up_frame_sfd_timestamp + timing.time_to_transmit(symbol_periods) - 1;

        let too_late = match subtype {
            Subtype::Hello => {
                let hello_len = hello_wake_up_sequence_length(
                    ctx.cfg,
                    timing,
                    ctx.clock.timebase.interval(),
                );
                remaining as u32 >= hello_len
            }
            // upper bound maintained by the splo synchronizer
            _ => {
                remaining as u32
                    >= wake_up_sequence_length(
                        timing,
                        crate::csl::max_overall_uncertainty(timing),
                        on_air_len,
                    )
            }
        };
        if too_late {
            error!("rendezvous time is too late");
            return Err(FramerError::RendezvousTooLate);
        }

        match subtype {
            Subtype::Hello => ctx.akes.inc_hello_bucket.pour(ctx.now_s),
            Subtype::Helloack => ctx.akes.inc_helloack_bucket.pour(ctx.now_s),
            _ => {}
        }
        Ok(())
    }

    fn min_bytes_for_filtering(&self, dc: &DutyCycleState) -> u8 {
        payload_frame_header_len(dc.subtype, false) as u8
    }

    fn filter(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        dc: &mut DutyCycleState,
    ) -> Result<(), FramerError> {
        let burst = dc.last_burst_index as usize;
        let subtype = dc.subtype;

        // frame length, frame type, flags
        let totlen = dc.packets[burst].data_len();
        if has_otp_etc(subtype) && dc.next_frames_len as usize != totlen {
            error!("unexpected frame length");
            return Err(FramerError::Length { have: totlen });
        }
        let type_byte = dc.packets[burst].data()[0];
        if type_byte & 0x3f != EXTENDED_FRAME_TYPE {
            error!("unwanted frame type");
            return Err(FramerError::Type);
        }
        let (frame_pending, is_command) = if subtype == Subtype::Normal {
            (type_byte & (1 << 7) != 0, type_byte & (1 << 6) != 0)
        } else {
            (false, true)
        };
        dc.packets[burst].frame_type = if is_command {
            FrameType::Command
        } else {
            FrameType::Data
        };
        let len = payload_frame_header_len(subtype, frame_pending);
        match subtype {
            Subtype::Hello => {
                if totlen < len + akes::HELLO_DATALEN + HELLO_PIGGYBACK_LEN {
                    error!("hello has invalid length");
                    return Err(FramerError::Length { have: totlen });
                }
                dc.packets[burst].receiver = LinkAddr::NULL;
            }
            Subtype::Helloack => {
                if totlen != len + akes::HELLOACK_DATALEN + HELLOACK_PIGGYBACK_LEN {
                    error!("helloack has invalid length");
                    return Err(FramerError::Length { have: totlen });
                }
                dc.packets[burst].receiver = ctx.node_addr;
            }
            _ => {
                if totlen <= len + MIC_LEN {
                    error!("frame has invalid length");
                    return Err(FramerError::Length { have: totlen });
                }
                dc.packets[burst].receiver = ctx.node_addr;
            }
        }
        let mut at = EXTENDED_FRAME_TYPE_LEN;

        if has_source_address(subtype) {
            let mut addr = [0u8; LinkAddr::LEN];
            addr.copy_from_slice(&dc.packets[burst].data()[at..at + LinkAddr::LEN]);
            let addr = LinkAddr(addr);
            if addr == ctx.node_addr {
                error!("frame from ourselves");
                return Err(FramerError::FromOurselves);
            }
            dc.packets[burst].sender = addr;
            at += LinkAddr::LEN;
        }
        if subtype == Subtype::Hello {
            let sender = dc.packets[burst].sender;
            if !akes::is_acceptable_hello(ctx, &sender) {
                error!("unacceptable hello");
                return Err(FramerError::Unacceptable);
            }
        }

        if has_seqno(subtype) {
            dc.packets[burst].seqno = dc.packets[burst].data()[at];
            at += SEQUENCE_NUMBER_LEN;
        }

        if frame_pending {
            read_into(radio, dc, PAYLOAD_FRAMES_LEN_LEN)?;
            let pending = dc.packets[burst].data()[at];
            if pending == 0 {
                error!("pending frame has no length");
                return Err(FramerError::Length { have: 0 });
            }
            dc.packets[burst].pending = pending;
            dc.next_frames_len = pending;
        } else {
            dc.packets[burst].pending = 0;
        }

        if !dc.packets[burst].holds_broadcast() {
            // render the acknowledgement for the radio to fire right after
            // the payload frame completes
            let phase_len = if dc.last_burst_index == 0 { PHASE_LEN } else { 0 };
            dc.acknowledgement[1] = EXTENDED_FRAME_TYPE;
            if subtype == Subtype::Helloack {
                dc.acknowledgement[0] = EXTENDED_FRAME_TYPE_LEN as u8;
            } else {
                dc.acknowledgement[0] = (EXTENDED_FRAME_TYPE_LEN + phase_len + MIC_LEN) as u8;
                if phase_len != 0 {
                    let timing = ctx.timing;
                    let acknowledgement_sfd_timestamp = ctx.clock.last_payload_sfd
                        + timing.time_to_transmit(
                            timing.symbols_per_byte * (1 + totlen as u32 + timing.shr_len),
                        )
                        + timing.transmit_calibration;
                    let phase = ctx.clock.phase(acknowledgement_sfd_timestamp);
                    write_phase(&mut dc.acknowledgement[2..4], phase);
                }
                let mut nonce = ccm_inputs::potr_nonce(
                    &ctx.node_addr,
                    Alpha::Acknowledgement,
                    dc.packets[burst].burst_index,
                    ctx.clock.wake_up_counter,
                );
                nonce[LinkAddr::LEN] =
                    (nonce[LinkAddr::LEN] & !0x3f) | dc.packets[burst].burst_index;
                let sender = dc.packets[burst].sender;
                let entry = ctx.nbr.entry_of(&sender);
                let handle = if subtype == Subtype::Ack {
                    entry.tentative
                } else {
                    entry.permanent
                };
                let Some(nbr) = handle.and_then(|h| ctx.nbr.get(h)) else {
                    error!("sender not found");
                    return Err(FramerError::MissingNeighbor);
                };
                let key = *nbr.pairwise_key();
                let mic = security::auth_tag(
                    &key,
                    &nonce,
                    &dc.acknowledgement[1..1 + EXTENDED_FRAME_TYPE_LEN + phase_len],
                );
                let mic_at = 1 + EXTENDED_FRAME_TYPE_LEN + phase_len;
                dc.acknowledgement[mic_at..mic_at + MIC_LEN].copy_from_slice(&mic);
            }
        }
        Ok(())
    }

    fn prepare_acknowledgement_parsing(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        pkt: &Packet,
    ) -> Result<(), FramerError> {
        if !matches!(tx.subtype, Subtype::Ack | Subtype::Normal) {
            return Ok(());
        }
        let entry = ctx.nbr.entry_of(&pkt.receiver);
        let permanent = entry
            .permanent
            .and_then(|h| ctx.nbr.get(h))
            .and_then(|n| n.permanent())
            .ok_or(FramerError::MissingNeighbor)?;
        tx.acknowledgement_key = permanent.pairwise_key;
        tx.acknowledgement_nonce = ccm_inputs::potr_nonce(
            &pkt.receiver,
            Alpha::Acknowledgement,
            0,
            tx.receivers_wake_up_counter,
        );
        Ok(())
    }

    fn parse_acknowledgement(
        &mut self,
        radio: &mut impl Radio,
        _ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
    ) -> Result<(), FramerError> {
        let phase_len = if tx.burst_index == 0 { PHASE_LEN } else { 0 };
        let expected_len = if tx.subtype == Subtype::Helloack {
            EXTENDED_FRAME_TYPE_LEN
        } else {
            EXTENDED_FRAME_TYPE_LEN + phase_len + MIC_LEN
        };

        let len = radio.read_phy_header()? as usize;
        if len != expected_len {
            error!("acknowledgement frame has invalid length");
            return Err(FramerError::Length { have: len });
        }

        let mut acknowledgement = [0u8; MAX_ACKNOWLEDGEMENT_LEN];
        radio.read_payload(&mut acknowledgement[..1])?;
        if acknowledgement[0] != EXTENDED_FRAME_TYPE {
            return Err(FramerError::Type);
        }
        if tx.subtype != Subtype::Helloack {
            if phase_len != 0 {
                radio.read_payload(&mut acknowledgement[1..1 + PHASE_LEN])?;
                tx.acknowledgement_phase = parse_phase(&acknowledgement[1..3]);
            }
            let mut nonce = tx.acknowledgement_nonce;
            nonce[LinkAddr::LEN] = (nonce[LinkAddr::LEN] & !0x3f) | tx.burst_index;
            let expected_mic = security::auth_tag(
                &tx.acknowledgement_key,
                &nonce,
                &acknowledgement[..1 + phase_len],
            );
            radio.read_payload(&mut acknowledgement[1 + phase_len..1 + phase_len + MIC_LEN])?;
            if acknowledgement[1 + phase_len..1 + phase_len + MIC_LEN] != expected_mic {
                error!("inauthentic acknowledgement frame");
                return Err(FramerError::Mic);
            }
        }
        Ok(())
    }

    fn on_unicast_transmitted(
        &mut self,
        _ctx: &mut LinkCtx<'_>,
        _tx: &TransmitState,
        _pkt: &Packet,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csl::TransmitState;
    use crate::nbr::NbrStatus;
    use crate::strategy::{Strategy, Verify};
    use crate::testutil::{MockRadio, TestNode};
    use crate::time::Ticks;
    use crate::wake_up_counter::WakeUpCounter;

    const KEY: [u8; 16] = [0x11; 16];

    /// A knows B as permanent (and vice versa), with our index at the
    /// peer recorded on both sides.
    fn paired_nodes() -> (TestNode, TestNode) {
        let mut a = TestNode::new(1);
        let mut b = TestNode::new(2);
        let b_in_a = a.nbr.new_nbr(b.addr, NbrStatus::Permanent).unwrap();
        let a_in_b = b.nbr.new_nbr(a.addr, NbrStatus::Permanent).unwrap();
        {
            let p = a.nbr.get_mut(b_in_a).unwrap().permanent_mut().unwrap();
            p.pairwise_key = KEY;
            p.foreign_index = a_in_b.index();
        }
        {
            let p = b.nbr.get_mut(a_in_b).unwrap().permanent_mut().unwrap();
            p.pairwise_key = KEY;
            p.foreign_index = b_in_a.index();
        }
        (a, b)
    }

    fn wake_up_frame_from(a: &mut TestNode, payload_len: u8, remaining: u16) -> [u8; 16] {
        let mut framer = PotrFramer;
        let mut tx = TransmitState::default();
        tx.subtype = Subtype::Normal;
        tx.receiver = LinkAddr([2; 8]);
        tx.receivers_wake_up_counter = WakeUpCounter(7);
        tx.payload_frame[0][0] = payload_len;
        tx.remaining_wake_up_frames = remaining;
        let mut template = [0u8; 16];
        {
            let mut ctx = a.ctx(Ticks(0));
            framer
                .create_wake_up_frame(&mut ctx, &mut tx, &mut template)
                .unwrap();
        }
        framer.update_rendezvous_time(
            tx.remaining_wake_up_frames,
            tx.rendezvous_time_len,
            &mut template,
        );
        template
    }

    #[test]
    fn wake_up_frame_roundtrip_with_valid_otp() {
        let (mut a, mut b) = paired_nodes();
        let template = wake_up_frame_from(&mut a, 42, 3);
        assert_eq!(template[0] as usize, NORMAL_BODY_LEN);

        b.wake_up_counter = WakeUpCounter(7);
        let mut radio = MockRadio::new();
        radio.load_frame(&template[..1 + NORMAL_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        dc.wake_up_frame_sfd_timestamp = Ticks(1000);
        let mut framer = PotrFramer;
        {
            let mut ctx = b.ctx(Ticks(1000));
            framer
                .parse_wake_up_frame(&mut radio, &mut ctx, &mut dc)
                .unwrap();
        }
        assert_eq!(dc.subtype, Subtype::Normal);
        assert_eq!(dc.next_frames_len, 42);
        assert_eq!(dc.remaining_wake_up_frames, 3);
        assert_eq!(dc.sender, LinkAddr([1; 8]));
        assert!(dc.rendezvous_time.diff(Ticks(1000)) > 0);
    }

    #[test]
    fn tampered_otp_is_rejected_on_the_fly() {
        let (mut a, mut b) = paired_nodes();
        let mut template = wake_up_frame_from(&mut a, 42, 3);
        // flip one OTP bit
        template[1 + EXTENDED_FRAME_TYPE_LEN + SOURCE_INDEX_LEN + PAYLOAD_FRAMES_LEN_LEN] ^= 1;

        b.wake_up_counter = WakeUpCounter(7);
        let mut radio = MockRadio::new();
        radio.load_frame(&template[..1 + NORMAL_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        dc.wake_up_frame_sfd_timestamp = Ticks(1000);
        let mut framer = PotrFramer;
        let mut ctx = b.ctx(Ticks(1000));
        assert_eq!(
            framer.parse_wake_up_frame(&mut radio, &mut ctx, &mut dc),
            Err(FramerError::Otp)
        );
    }

    #[test]
    fn stale_wake_up_counter_invalidates_the_otp() {
        let (mut a, mut b) = paired_nodes();
        let template = wake_up_frame_from(&mut a, 42, 3);
        b.wake_up_counter = WakeUpCounter(8);
        let mut radio = MockRadio::new();
        radio.load_frame(&template[..1 + NORMAL_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        let mut framer = PotrFramer;
        let mut ctx = b.ctx(Ticks(1000));
        assert_eq!(
            framer.parse_wake_up_frame(&mut radio, &mut ctx, &mut dc),
            Err(FramerError::Otp)
        );
    }

    #[test]
    fn hello_wake_up_frame_is_bound_to_its_channel() {
        let mut a = TestNode::new(1);
        let mut b = TestNode::new(2);
        let mut framer = PotrFramer;
        let mut tx = TransmitState::default();
        tx.subtype = Subtype::Hello;
        let mut template = [0u8; 16];
        {
            let mut ctx = a.ctx(Ticks(0));
            framer
                .create_wake_up_frame(&mut ctx, &mut tx, &mut template)
                .unwrap();
        }
        framer.update_rendezvous_time(5, tx.rendezvous_time_len, &mut template);

        let mut radio = MockRadio::new();
        radio.load_frame(&template[..1 + HELLO_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        dc.wake_up_frame_sfd_timestamp = Ticks(500);
        {
            let mut ctx = b.ctx(Ticks(500));
            framer
                .parse_wake_up_frame(&mut radio, &mut ctx, &mut dc)
                .unwrap();
        }
        assert_eq!(dc.subtype, Subtype::Hello);
        assert_eq!(dc.remaining_wake_up_frames, 5);

        // the same frame heard on another channel is for another PAN
        radio.load_frame(&template[..1 + HELLO_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        b.channel = 16;
        let mut ctx = b.ctx(Ticks(500));
        assert!(matches!(
            framer.parse_wake_up_frame(&mut radio, &mut ctx, &mut dc),
            Err(FramerError::Pan { .. })
        ));
    }

    /// A secured unicast accepted by `filter` yields an acknowledgement
    /// the sender consumes without failure, with matching CSL phase.
    #[test]
    fn payload_frame_and_acknowledgement_roundtrip() {
        let (mut a, mut b) = paired_nodes();
        let mut framer = PotrFramer;
        let mut strategy_a = crate::strategy::Csl::default();
        let mut strategy_b = crate::strategy::Csl::default();

        let mut tx = TransmitState::default();
        tx.subtype = Subtype::Normal;
        tx.receiver = LinkAddr([2; 8]);
        tx.receivers_wake_up_counter = WakeUpCounter(7);

        let mut pkt = Packet::new();
        pkt.set_data(b"hello world").unwrap();
        pkt.receiver = LinkAddr([2; 8]);
        pkt.frame_type = FrameType::Data;
        pkt.sec_lvl = crate::security::SEC_LVL;
        pkt.seqno = 1;
        {
            let mut ctx = a.ctx(Ticks(0));
            framer
                .create_payload_header(&mut ctx, &mut pkt, Subtype::Normal)
                .unwrap();
            strategy_a.secure(&mut ctx, &tx, &mut pkt).unwrap();
        }
        let frame_len = pkt.total_len();
        let mut on_air = std::vec::Vec::new();
        on_air.push(frame_len as u8);
        on_air.extend_from_slice(pkt.frame());

        // receiver side: filter after the minimum prefix, then the rest
        b.wake_up_counter = WakeUpCounter(7);
        let mut radio = MockRadio::new();
        radio.load_frame(&on_air);
        let mut dc = crate::csl::DutyCycleState::default();
        dc.subtype = Subtype::Normal;
        dc.next_frames_len = frame_len as u8;
        let min = framer.min_bytes_for_filtering(&dc) as usize;
        dc.packets[0].set_data_len(frame_len).unwrap();
        radio
            .read_payload(&mut dc.packets[0].data_mut()[..min])
            .unwrap();
        dc.bytes_read = min as u8;
        {
            let mut ctx = b.ctx(Ticks(2000));
            framer.filter(&mut radio, &mut ctx, &mut dc).unwrap();
        }
        assert!(!dc.packets[0].holds_broadcast());
        assert_eq!(dc.packets[0].sender, LinkAddr([1; 8]));
        let ack_len = dc.acknowledgement[0] as usize;
        assert_eq!(
            ack_len,
            EXTENDED_FRAME_TYPE_LEN + PHASE_LEN + MIC_LEN
        );

        // drain the rest and authenticate
        let pos = dc.bytes_read as usize;
        let rest = radio.remaining_payload_bytes() as usize;
        radio
            .read_payload(&mut dc.packets[0].data_mut()[pos..pos + rest])
            .unwrap();
        framer
            .parse_payload_header(&mut dc.packets[0], Subtype::Normal)
            .unwrap();
        let a_in_b = b.nbr.entry_of(&LinkAddr([1; 8])).permanent.unwrap();
        {
            let mut ctx = b.ctx(Ticks(2000));
            assert_eq!(
                strategy_b.verify(&mut ctx, &mut dc.packets[0], a_in_b),
                Verify::Success
            );
        }
        assert_eq!(dc.packets[0].data(), b"hello world");

        // sender side: the acknowledgement checks out
        {
            let mut ctx = a.ctx(Ticks(0));
            framer
                .prepare_acknowledgement_parsing(&mut ctx, &mut tx, &pkt)
                .unwrap();
        }
        radio.load_frame(&dc.acknowledgement[..1 + ack_len]);
        {
            let mut ctx = a.ctx(Ticks(0));
            framer
                .parse_acknowledgement(&mut radio, &mut ctx, &mut tx)
                .unwrap();
        }
        let written_phase = parse_phase(&dc.acknowledgement[2..4]);
        assert_eq!(tx.acknowledgement_phase, written_phase);
    }
}
