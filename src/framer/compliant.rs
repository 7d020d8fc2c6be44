//! The standards-compliant wire format.
//!
//! Wake-up frame (12-byte body behind the PHY header):
//!
//! ```norust
//!  2      | 2       | 2         | 4                  | 2
//! MP FCF  | dst PAN | dst short | Rendezvous Time IE | FCS
//! ```
//!
//! Payload frames are IEEE 802.15.4-2015 data or command frames with
//! sequence-number suppression, PAN ID compression, an extended source
//! address, and an auxiliary security header carrying the frame counter.
//! Their FCS is appended by the radio hardware; only the frames this
//! framer emits as raw byte sequences (wake-up frames and enhanced
//! acknowledgements) carry an explicit FCS.
//!
//! Enhanced acknowledgement:
//!
//! ```norust
//!  2   | 2         | 0/5 | 6                      | 0/8 | 2
//! FCF  | dst short | aux | CSL IE (phase, period) | MIC | FCS
//! ```

use log::{error, info, warn};

use crate::akes::{self, CmdId};
use crate::ccm_inputs;
use crate::config::Config;
use crate::csl::{DutyCycleState, LinkCtx, TransmitState};
use crate::framer::{Framer, FramerError, Subtype};
use crate::ieee802154::{
    self, append_fcs, check_fcs, AddrMode, Fcf, FrameKind, MpFcf, AUX_SECURITY_HEADER_LEN,
    CSL_IE_LEN, FCS_LEN, FRAME_VERSION_2015, IE_ID_CSL, IE_ID_RENDEZVOUS_TIME,
    RENDEZVOUS_TIME_IE_LEN, SHORT_ADDR_BROADCAST,
};
use crate::packet::{FrameType, Packet};
use crate::radio::{Radio, Timing};
use crate::security::{self, MIC_LEN};
use crate::LinkAddr;

/// MIC-64 without encryption; acknowledgements carry no payload.
pub const ACKNOWLEDGEMENT_SEC_LVL: u8 = 2;

const WAKE_UP_FRAME_BODY_LEN: usize = 2 + 2 + 2 + RENDEZVOUS_TIME_IE_LEN + FCS_LEN;

/// FCF + extended source address + auxiliary security header.
const PAYLOAD_HEADER_LEN: usize = 2 + LinkAddr::LEN + AUX_SECURITY_HEADER_LEN;

const ACK_HEADER_LEN: usize = 2 + 2;
pub const MAX_ACKNOWLEDGEMENT_LEN: usize =
    ACK_HEADER_LEN + AUX_SECURITY_HEADER_LEN + CSL_IE_LEN + MIC_LEN + FCS_LEN;

#[derive(Default)]
pub struct CompliantFramer;

impl Framer for CompliantFramer {
    fn init(&mut self, _cfg: &Config) {}

    fn max_header_len(&self) -> usize {
        PAYLOAD_HEADER_LEN
    }

    fn create_payload_header(
        &self,
        ctx: &mut LinkCtx<'_>,
        pkt: &mut Packet,
        _subtype: Subtype,
    ) -> Result<usize, FramerError> {
        pkt.hdralloc(PAYLOAD_HEADER_LEN)?;
        let fcf = Fcf::new()
            .with_frame_type(match pkt.frame_type {
                FrameType::Data => FrameKind::Data,
                FrameType::Command => FrameKind::Command,
            })
            .with_security_enabled(pkt.sec_lvl != 0)
            .with_frame_pending(pkt.pending != 0)
            .with_ack_required(!pkt.holds_broadcast())
            .with_panid_compression(true)
            .with_sequence_number_suppression(true)
            .with_frame_version(FRAME_VERSION_2015)
            .with_src_addr_mode(AddrMode::Extended);
        let node_addr = ctx.node_addr;
        let sec_lvl = pkt.sec_lvl;
        let frame_counter = pkt.frame_counter;
        let hdr = pkt.hdr_mut();
        hdr[..2].copy_from_slice(&fcf.into_bytes());
        hdr[2..2 + LinkAddr::LEN].copy_from_slice(node_addr.as_bytes());
        ieee802154::write_aux_security_header(
            &mut hdr[2 + LinkAddr::LEN..],
            sec_lvl,
            frame_counter,
        );
        Ok(PAYLOAD_HEADER_LEN)
    }

    fn parse_payload_header(
        &self,
        pkt: &mut Packet,
        _subtype: Subtype,
    ) -> Result<usize, FramerError> {
        pkt.hdrreduce(PAYLOAD_HEADER_LEN)?;
        Ok(PAYLOAD_HEADER_LEN)
    }

    fn wake_up_frame_body_len(&self, _timing: &Timing, _subtype: Subtype) -> u8 {
        WAKE_UP_FRAME_BODY_LEN as u8
    }

    fn create_wake_up_frame(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        dst: &mut [u8],
    ) -> Result<(), FramerError> {
        dst[0] = WAKE_UP_FRAME_BODY_LEN as u8;
        let fcf = MpFcf::new()
            .with_frame_type(FrameKind::Multipurpose)
            .with_long_frame_control(true)
            .with_dest_addr_mode(AddrMode::Short)
            .with_panid_present(true)
            .with_sequence_number_suppression(true)
            .with_ie_present(true);
        dst[1..3].copy_from_slice(&fcf.into_bytes());
        dst[3..5].copy_from_slice(&ctx.pan_id.to_le_bytes());
        let dst_short = if tx.is_broadcast {
            SHORT_ADDR_BROADCAST
        } else {
            tx.receiver.short()
        };
        dst[5..7].copy_from_slice(&dst_short.to_le_bytes());
        // rendezvous time is patched per copy; the FCS follows it
        ieee802154::write_rendezvous_time_ie(&mut dst[7..11], 0);
        tx.rendezvous_time_len = 2;
        append_fcs(&mut dst[1..1 + WAKE_UP_FRAME_BODY_LEN]);
        Ok(())
    }

    fn update_rendezvous_time(
        &self,
        remaining_wake_up_frames: u16,
        _rendezvous_time_len: u8,
        frame: &mut [u8],
    ) {
        let body = frame[0] as usize;
        let at = 1 + body - FCS_LEN - 2;
        frame[at..at + 2].copy_from_slice(&remaining_wake_up_frames.to_le_bytes());
        append_fcs(&mut frame[1..1 + body]);
    }

    fn parse_wake_up_frame(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        dc: &mut DutyCycleState,
    ) -> Result<(), FramerError> {
        let datalen = radio.read_phy_header()? as usize;
        if datalen != WAKE_UP_FRAME_BODY_LEN {
            warn!("unexpected frame length");
            return Err(FramerError::Length { have: datalen });
        }
        dc.subtype = Subtype::Normal;
        dc.packets[0].set_data_len(datalen)?;
        dc.bytes_read = 0;

        {
            let pkt = &mut dc.packets[0];
            radio.read_payload(&mut pkt.data_mut()[..datalen - FCS_LEN])?;
        }
        dc.bytes_read = (datalen - FCS_LEN) as u8;
        let data = dc.packets[0].data();
        let fcf = MpFcf::from_bytes([data[0], data[1]]);
        if fcf.frame_type() != FrameKind::Multipurpose || !fcf.long_frame_control() {
            error!("invalid frame type");
            return Err(FramerError::Type);
        }
        if fcf.dest_addr_mode() != AddrMode::Short {
            error!("invalid destination addressing mode");
            return Err(FramerError::AddressingMode);
        }
        if !fcf.ie_present() {
            error!("no ie list");
            return Err(FramerError::Type);
        }
        if !fcf.panid_present() {
            warn!("wake-up frames without pan ids are not yet handled");
            return Err(FramerError::AddressingMode);
        }
        if fcf.src_addr_mode() != AddrMode::Absent {
            warn!("wake-up frames with source addresses are not yet handled");
            return Err(FramerError::AddressingMode);
        }
        let dst_pid = u16::from_le_bytes([data[2], data[3]]);
        if dst_pid != ctx.pan_id && dst_pid != ieee802154::PAN_ID_BROADCAST {
            info!("for another pan {:04x}", dst_pid);
            return Err(FramerError::Pan { pan: dst_pid });
        }
        let dst_short = u16::from_le_bytes([data[4], data[5]]);
        if dst_short == ctx.node_addr.short() {
            dc.receiver = ctx.node_addr;
        } else if dst_short == SHORT_ADDR_BROADCAST {
            dc.receiver = LinkAddr::NULL;
        } else {
            info!("for another node");
            return Err(FramerError::NotForUs);
        }

        let (ie_id, ie_len) = ieee802154::parse_ie_header(&data[6..8]);
        if ie_id != IE_ID_RENDEZVOUS_TIME || ie_len != 2 {
            error!("unexpected ie");
            return Err(FramerError::Type);
        }
        let remaining = u16::from_le_bytes([data[8], data[9]]);
        dc.remaining_wake_up_frames = remaining;

        let timing = ctx.timing;
        let on_air_len = datalen as u32 + timing.phy_header_len;
        let symbol_periods = timing.symbols_per_byte * remaining as u32 * on_air_len
            + timing.symbols_per_byte * (on_air_len - timing.shr_len);
        dc.rendezvous_time =
            dc.wake_up_frame_sfd_timestamp + timing.time_to_transmit(symbol_periods) - 1;

        read_fcs_and_check(radio, dc)?;
        Ok(())
    }

    fn min_bytes_for_filtering(&self, _dc: &DutyCycleState) -> u8 {
        PAYLOAD_HEADER_LEN as u8
    }

    fn filter(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        dc: &mut DutyCycleState,
    ) -> Result<(), FramerError> {
        let burst = dc.last_burst_index as usize;
        let (fcf, src, control, frame_counter) = {
            let data = dc.packets[burst].data();
            let fcf = Fcf::from_bytes([data[0], data[1]]);
            let mut src = [0u8; LinkAddr::LEN];
            src.copy_from_slice(&data[2..2 + LinkAddr::LEN]);
            let (control, frame_counter) =
                ieee802154::parse_aux_security_header(&data[2 + LinkAddr::LEN..]);
            (fcf, LinkAddr(src), control, frame_counter)
        };
        match fcf.frame_type() {
            FrameKind::Data => dc.packets[burst].frame_type = FrameType::Data,
            FrameKind::Command => dc.packets[burst].frame_type = FrameType::Command,
            _ => {
                warn!("unexpected frame type");
                return Err(FramerError::Type);
            }
        }
        if fcf.dest_addr_mode() != AddrMode::Absent {
            warn!("payload frames with destination addresses are not yet handled");
            return Err(FramerError::AddressingMode);
        }
        if fcf.src_addr_mode() != AddrMode::Extended {
            warn!("invalid source addressing mode");
            return Err(FramerError::AddressingMode);
        }
        if !fcf.sequence_number_suppression() {
            error!("payload frames with sequence numbers are not yet handled");
            return Err(FramerError::Type);
        }
        if src == ctx.node_addr {
            error!("frame from ourselves");
            return Err(FramerError::FromOurselves);
        }
        if !fcf.security_enabled() {
            error!("unsecured payload frame");
            return Err(FramerError::Type);
        }

        {
            let pkt = &mut dc.packets[burst];
            pkt.sender = src;
            pkt.receiver = dc.receiver;
            pkt.pending = fcf.frame_pending() as u8;
            pkt.sec_lvl = control.security_level();
            pkt.frame_counter = frame_counter;
        }

        if !dc.packets[burst].holds_broadcast() {
            let is_helloack;
            if dc.packets[burst].frame_type == FrameType::Command {
                // peek at the command identifier to learn whether a key
                // exists for securing the acknowledgement
                let pos = dc.bytes_read as usize;
                let pkt = &mut dc.packets[burst];
                radio.read_payload(&mut pkt.data_mut()[pos..pos + 1])?;
                dc.bytes_read += 1;
                let cmd = CmdId::from_byte(dc.packets[burst].data()[PAYLOAD_HEADER_LEN]);
                is_helloack = matches!(cmd, Some(CmdId::Helloack | CmdId::HelloackP));
            } else {
                is_helloack = false;
            }

            let totlen = dc.packets[burst].data_len();
            let secured = !is_helloack;
            let fcf = Fcf::new()
                .with_frame_type(FrameKind::Ack)
                .with_security_enabled(secured)
                .with_panid_compression(true)
                .with_sequence_number_suppression(true)
                .with_ie_present(true)
                .with_frame_version(FRAME_VERSION_2015)
                .with_dest_addr_mode(AddrMode::Short);
            dc.acknowledgement[1..3].copy_from_slice(&fcf.into_bytes());
            dc.acknowledgement[3..5].copy_from_slice(&src.short().to_le_bytes());
            let mut at = 1 + ACK_HEADER_LEN;
            let mut counter = 0;
            if secured {
                counter = ctx
                    .counter
                    .next()
                    .map_err(|_| FramerError::CounterExhausted)?;
                ieee802154::write_aux_security_header(
                    &mut dc.acknowledgement[at..],
                    ACKNOWLEDGEMENT_SEC_LVL,
                    counter,
                );
                at += AUX_SECURITY_HEADER_LEN;
            }

            let timing = ctx.timing;
            let acknowledgement_sfd_timestamp = ctx.clock.last_payload_sfd
                + timing
                    .time_to_transmit(timing.symbols_per_byte * (1 + totlen as u32 + timing.shr_len))
                + timing.transmit_calibration;
            let phase = ctx.clock.phase(acknowledgement_sfd_timestamp);
            ieee802154::write_csl_ie(
                &mut dc.acknowledgement[at..],
                phase,
                ctx.clock.timebase.interval() as u16,
            );
            at += CSL_IE_LEN;

            if secured {
                // acknowledgements are secured under our own group key,
                // which every permanent neighbor of ours holds
                let nonce =
                    ccm_inputs::compliant_nonce(&ctx.node_addr, counter, ACKNOWLEDGEMENT_SEC_LVL);
                let mic = security::auth_tag(
                    &ctx.akes.group_key,
                    &nonce,
                    &dc.acknowledgement[1..at],
                );
                dc.acknowledgement[at..at + MIC_LEN].copy_from_slice(&mic);
                at += MIC_LEN;
            }

            dc.acknowledgement[0] = (at - 1 + FCS_LEN) as u8;
            append_fcs(&mut dc.acknowledgement[1..at + FCS_LEN]);
        }
        Ok(())
    }

    fn prepare_acknowledgement_parsing(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        pkt: &Packet,
    ) -> Result<(), FramerError> {
        tx.expected_mic_len = 0;
        if tx.is_broadcast || akes::is_helloack_cmd(pkt) {
            return Ok(());
        }
        let entry = ctx.nbr.entry_of(&pkt.receiver);
        let Some(nbr) = entry.permanent.and_then(|h| ctx.nbr.get(h)) else {
            warn!("receiver is not permanent");
            return Err(FramerError::MissingNeighbor);
        };
        let Some(permanent) = nbr.permanent() else {
            warn!("receiver is not permanent");
            return Err(FramerError::MissingNeighbor);
        };
        tx.expected_mic_len = MIC_LEN as u8;
        tx.acknowledgement_key = permanent.group_key;
        tx.his_unicast_counter = nbr
            .anti_replay
            .last_accepted(crate::anti_replay::CounterKind::Unicast);
        Ok(())
    }

    fn parse_acknowledgement(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
    ) -> Result<(), FramerError> {
        let frame_length = radio.read_phy_header()? as usize;
        if frame_length > MAX_ACKNOWLEDGEMENT_LEN {
            error!("acknowledgement frame has invalid length");
            return Err(FramerError::Length { have: frame_length });
        }
        let mic_len = tx.expected_mic_len as usize;
        if frame_length < ACK_HEADER_LEN + CSL_IE_LEN + mic_len + FCS_LEN {
            error!("acknowledgement frame is too short");
            return Err(FramerError::Length { have: frame_length });
        }
        let mut ack = [0u8; MAX_ACKNOWLEDGEMENT_LEN];
        let unread = mic_len + FCS_LEN;
        radio.read_payload(&mut ack[..frame_length - unread])?;

        let fcf = Fcf::from_bytes([ack[0], ack[1]]);
        if fcf.frame_type() != FrameKind::Ack {
            error!("unexpected frame type");
            return Err(FramerError::Type);
        }
        if fcf.dest_addr_mode() != AddrMode::Short {
            error!("unexpected destination addressing mode");
            return Err(FramerError::AddressingMode);
        }
        if !fcf.ie_present() {
            error!("no ie list");
            return Err(FramerError::Type);
        }
        let dst_short = u16::from_le_bytes([ack[2], ack[3]]);
        if dst_short != ctx.node_addr.short() {
            info!("for another node");
            return Err(FramerError::NotForUs);
        }
        if (mic_len != 0) != fcf.security_enabled() {
            error!("unexpected security level");
            return Err(FramerError::Type);
        }
        let mut at = ACK_HEADER_LEN;
        let mut counter = 0;
        if fcf.security_enabled() {
            let (control, parsed_counter) = ieee802154::parse_aux_security_header(&ack[at..]);
            if control.security_level() != ACKNOWLEDGEMENT_SEC_LVL {
                error!("unexpected security level");
                return Err(FramerError::Type);
            }
            counter = parsed_counter;
            at += AUX_SECURITY_HEADER_LEN;
        }

        let (ie_id, ie_len) = ieee802154::parse_ie_header(&ack[at..at + 2]);
        if ie_id != IE_ID_CSL || ie_len != 4 {
            error!("failed to read csl ie");
            return Err(FramerError::Type);
        }
        if tx.burst_index == 0 {
            tx.acknowledgement_phase = u16::from_le_bytes([ack[at + 2], ack[at + 3]]);
        }
        at += CSL_IE_LEN;
        if at + mic_len + FCS_LEN != frame_length {
            error!("acknowledgement has payload");
            return Err(FramerError::Length { have: frame_length });
        }

        if mic_len != 0 {
            let nonce =
                ccm_inputs::compliant_nonce(&tx.receiver, counter, ACKNOWLEDGEMENT_SEC_LVL);
            let expected_mic = security::auth_tag(&tx.acknowledgement_key, &nonce, &ack[..at]);
            radio.read_payload(&mut ack[at..at + mic_len])?;
            if ack[at..at + mic_len] != expected_mic[..mic_len] {
                error!("inauthentic mic");
                return Err(FramerError::Mic);
            }
            at += mic_len;
            if counter <= tx.his_unicast_counter {
                error!("replayed acknowledgement");
                return Err(FramerError::Mic);
            }
            tx.his_unicast_counter = counter;
        }

        radio.read_payload(&mut ack[at..at + FCS_LEN])?;
        if !check_fcs(&ack[..at + FCS_LEN]) {
            error!("acknowledgement frame has invalid checksum");
            return Err(FramerError::Checksum);
        }
        Ok(())
    }

    fn on_unicast_transmitted(&mut self, ctx: &mut LinkCtx<'_>, tx: &TransmitState, pkt: &Packet) {
        if akes::is_helloack_cmd(pkt) {
            return;
        }
        let entry = ctx.nbr.entry_of(&pkt.receiver);
        let Some(handle) = entry.permanent else {
            warn!("receiver is no longer permanent");
            return;
        };
        let mut changed = false;
        if let Some(nbr) = ctx.nbr.get_mut(handle) {
            let last = nbr
                .anti_replay
                .last_accepted(crate::anti_replay::CounterKind::Unicast);
            if last != tx.his_unicast_counter {
                nbr.anti_replay.set_last_accepted(
                    crate::anti_replay::CounterKind::Unicast,
                    tx.his_unicast_counter,
                );
                changed = true;
            }
        }
        if changed {
            akes::prolong_permanent(ctx, handle);
        }
    }
}

fn read_fcs_and_check(radio: &mut impl Radio, dc: &mut DutyCycleState) -> Result<(), FramerError> {
    let pos = dc.bytes_read as usize;
    {
        let pkt = &mut dc.packets[0];
        radio.read_payload(&mut pkt.data_mut()[pos..pos + FCS_LEN])?;
    }
    dc.bytes_read += FCS_LEN as u8;
    if !check_fcs(&dc.packets[0].data()[..pos + FCS_LEN]) {
        error!("wake-up frame has invalid checksum");
        return Err(FramerError::Checksum);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csl::TransmitState;
    use crate::nbr::NbrStatus;
    use crate::strategy::{Noncoresec, Strategy, Verify};
    use crate::testutil::{MockRadio, TestNode};
    use crate::time::Ticks;

    #[test]
    fn wake_up_frame_roundtrip() {
        let mut a = TestNode::new(1);
        let mut b = TestNode::new(2);
        let mut framer = CompliantFramer;
        let mut tx = TransmitState::default();
        tx.receiver = LinkAddr([2; 8]);
        let mut template = [0u8; 16];
        {
            let mut ctx = a.ctx(Ticks(0));
            framer
                .create_wake_up_frame(&mut ctx, &mut tx, &mut template)
                .unwrap();
        }
        framer.update_rendezvous_time(2, 2, &mut template);

        let mut radio = MockRadio::new();
        radio.load_frame(&template[..1 + WAKE_UP_FRAME_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        dc.wake_up_frame_sfd_timestamp = Ticks(100);
        {
            let mut ctx = b.ctx(Ticks(100));
            framer
                .parse_wake_up_frame(&mut radio, &mut ctx, &mut dc)
                .unwrap();
        }
        assert_eq!(dc.remaining_wake_up_frames, 2);
        assert_eq!(dc.receiver, LinkAddr([2; 8]));

        // corrupting the rendezvous field breaks the checksum
        let mut bad = template;
        bad[9] ^= 0x55;
        radio.load_frame(&bad[..1 + WAKE_UP_FRAME_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        let mut ctx = b.ctx(Ticks(100));
        assert_eq!(
            framer.parse_wake_up_frame(&mut radio, &mut ctx, &mut dc),
            Err(FramerError::Checksum)
        );

        // another node ignores it
        let mut c = TestNode::new(3);
        radio.load_frame(&template[..1 + WAKE_UP_FRAME_BODY_LEN]);
        let mut dc = crate::csl::DutyCycleState::default();
        let mut ctx = c.ctx(Ticks(100));
        assert_eq!(
            framer.parse_wake_up_frame(&mut radio, &mut ctx, &mut dc),
            Err(FramerError::NotForUs)
        );
    }

    /// A secured data frame passes the filter, the enhanced ack carries a
    /// MIC under the acknowledger's group key, and a replayed ack is
    /// refused by its frame counter.
    #[test]
    fn filter_builds_an_authentic_acknowledgement() {
        let group_a = [0xaa; 16];
        let group_b = [0xbb; 16];
        let mut a = TestNode::new(1);
        let mut b = TestNode::new(2);
        a.akes.group_key = group_a;
        b.akes.group_key = group_b;
        let b_in_a = a.nbr.new_nbr(b.addr, NbrStatus::Permanent).unwrap();
        a.nbr
            .get_mut(b_in_a)
            .unwrap()
            .permanent_mut()
            .unwrap()
            .group_key = group_b;
        let a_in_b = b.nbr.new_nbr(a.addr, NbrStatus::Permanent).unwrap();
        b.nbr
            .get_mut(a_in_b)
            .unwrap()
            .permanent_mut()
            .unwrap()
            .group_key = group_a;

        let mut framer = CompliantFramer;
        let mut strategy = Noncoresec;
        let mut tx = TransmitState::default();
        tx.receiver = b.addr;

        let mut pkt = Packet::new();
        pkt.set_data(b"ping").unwrap();
        pkt.receiver = b.addr;
        pkt.frame_type = FrameType::Data;
        pkt.sec_lvl = crate::security::SEC_LVL;
        pkt.frame_counter = a.counter.next().unwrap();
        {
            let mut ctx = a.ctx(Ticks(0));
            framer
                .create_payload_header(&mut ctx, &mut pkt, Subtype::Normal)
                .unwrap();
            strategy.secure(&mut ctx, &tx, &mut pkt).unwrap();
        }
        let frame_len = pkt.total_len();
        let mut on_air = std::vec::Vec::new();
        on_air.push(frame_len as u8);
        on_air.extend_from_slice(pkt.frame());

        let mut radio = MockRadio::new();
        radio.load_frame(&on_air);
        let mut dc = crate::csl::DutyCycleState::default();
        dc.receiver = b.addr;
        let min = framer.min_bytes_for_filtering(&dc) as usize;
        dc.packets[0].set_data_len(frame_len).unwrap();
        radio
            .read_payload(&mut dc.packets[0].data_mut()[..min])
            .unwrap();
        dc.bytes_read = min as u8;
        {
            let mut ctx = b.ctx(Ticks(5000));
            framer.filter(&mut radio, &mut ctx, &mut dc).unwrap();
        }
        let ack_len = dc.acknowledgement[0] as usize;
        assert_eq!(
            ack_len,
            ACK_HEADER_LEN + AUX_SECURITY_HEADER_LEN + CSL_IE_LEN + MIC_LEN + FCS_LEN
        );

        // the upper layer verifies and decrypts later
        let pos = dc.bytes_read as usize;
        let rest = radio.remaining_payload_bytes() as usize;
        radio
            .read_payload(&mut dc.packets[0].data_mut()[pos..pos + rest])
            .unwrap();
        framer
            .parse_payload_header(&mut dc.packets[0], Subtype::Normal)
            .unwrap();
        {
            let mut ctx = b.ctx(Ticks(5000));
            assert_eq!(
                strategy.verify(&mut ctx, &mut dc.packets[0], a_in_b),
                Verify::Success
            );
        }
        assert_eq!(dc.packets[0].data(), b"ping");

        // sender consumes the acknowledgement exactly once
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
        radio.load_frame(&dc.acknowledgement[..1 + ack_len]);
        {
            let mut ctx = a.ctx(Ticks(0));
            assert!(framer
                .parse_acknowledgement(&mut radio, &mut ctx, &mut tx)
                .is_err());
        }
    }
}
