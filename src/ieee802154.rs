//! IEEE 802.15.4-2015 header building blocks used by the compliant framer:
//! frame control fields, the auxiliary security header, header information
//! elements, and the frame check sequence.
//!
//! All multi-byte fields are little-endian on the wire.

use crc::{Crc, CRC_16_KERMIT};
use modular_bitfield::prelude::*;

pub const PAN_ID_BROADCAST: u16 = 0xffff;
pub const SHORT_ADDR_BROADCAST: u16 = 0xffff;
pub const FCS_LEN: usize = 2;

/// General frame control field.
///
/// ```norust
/// 0..=2 | 3   | 4       | 5  | 6        | 7   | 8        | 9  | 10..=11 | 12..=13 | 14..=15
/// type  | sec | pending | ar | pan comp | rfu | seq supp | ie | dst am  | version | src am
/// ```
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fcf {
    #[bits = 3]
    pub frame_type: FrameKind,
    pub security_enabled: bool,
    pub frame_pending: bool,
    pub ack_required: bool,
    pub panid_compression: bool,
    pub reserved: bool,
    pub sequence_number_suppression: bool,
    pub ie_present: bool,
    #[bits = 2]
    pub dest_addr_mode: AddrMode,
    pub frame_version: B2,
    #[bits = 2]
    pub src_addr_mode: AddrMode,
}

/// Multipurpose frame control field (long form).
///
/// ```norust
/// 0..=2 | 3       | 4..=5  | 6..=7  | 8   | 9   | 10       | 11      | 12..=13 | 14 | 15
/// type  | long fc | dst am | src am | pan | sec | seq supp | pending | version | ar | ie
/// ```
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpFcf {
    #[bits = 3]
    pub frame_type: FrameKind,
    pub long_frame_control: bool,
    #[bits = 2]
    pub dest_addr_mode: AddrMode,
    #[bits = 2]
    pub src_addr_mode: AddrMode,
    pub panid_present: bool,
    pub security_enabled: bool,
    pub sequence_number_suppression: bool,
    pub frame_pending: bool,
    pub frame_version: B2,
    pub ack_request: bool,
    pub ie_present: bool,
}

/// FType, 3 bits
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Specifier)]
pub enum FrameKind {
    Beacon = 0b000,
    Data = 0b001,
    Ack = 0b010,
    Command = 0b011,
    Reserved = 0b100,
    Multipurpose = 0b101,
    Fragment = 0b110,
    Extended = 0b111,
}

/// Addressing mode, 2 bits
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Specifier)]
pub enum AddrMode {
    Absent = 0b00,
    Rfu = 0b01,
    Short = 0b10,
    Extended = 0b11,
}

pub const FRAME_VERSION_2015: u8 = 0b10;

/// Security control byte of the auxiliary security header.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityControl {
    pub security_level: B3,
    pub key_id_mode: B2,
    pub frame_counter_suppression: bool,
    pub asn_in_nonce: bool,
    pub reserved: bool,
}

/// Auxiliary security header with an implicit key (key id mode 0):
/// security control byte plus a 4-byte frame counter.
pub const AUX_SECURITY_HEADER_LEN: usize = 5;

pub fn write_aux_security_header(dst: &mut [u8], sec_lvl: u8, frame_counter: u32) {
    dst[0] = SecurityControl::new()
        .with_security_level(sec_lvl)
        .into_bytes()[0];
    dst[1..5].copy_from_slice(&frame_counter.to_le_bytes());
}

pub fn parse_aux_security_header(src: &[u8]) -> (SecurityControl, u32) {
    let control = SecurityControl::from_bytes([src[0]]);
    let counter = u32::from_le_bytes([src[1], src[2], src[3], src[4]]);
    (control, counter)
}

/// Header information elements. An IE descriptor packs content length
/// (bits 0..=6), element id (7..=14), and type 0 (bit 15).
pub const IE_HEADER_LEN: usize = 2;
pub const IE_ID_CSL: u16 = 0x1a;
pub const IE_ID_RENDEZVOUS_TIME: u16 = 0x1d;

/// CSL IE content: phase and period, ticks, little-endian.
pub const CSL_IE_CONTENT_LEN: usize = 4;
pub const CSL_IE_LEN: usize = IE_HEADER_LEN + CSL_IE_CONTENT_LEN;

/// Rendezvous Time IE content: remaining wake-up frames, little-endian.
pub const RENDEZVOUS_TIME_IE_CONTENT_LEN: usize = 2;
pub const RENDEZVOUS_TIME_IE_LEN: usize = IE_HEADER_LEN + RENDEZVOUS_TIME_IE_CONTENT_LEN;

pub fn write_ie_header(dst: &mut [u8], element_id: u16, content_len: usize) {
    let descriptor = (content_len as u16 & 0x7f) | (element_id << 7);
    dst[..IE_HEADER_LEN].copy_from_slice(&descriptor.to_le_bytes());
}

/// Splits an IE descriptor into `(element_id, content_len)`.
pub fn parse_ie_header(src: &[u8]) -> (u16, usize) {
    let descriptor = u16::from_le_bytes([src[0], src[1]]);
    ((descriptor >> 7) & 0xff, (descriptor & 0x7f) as usize)
}

pub fn write_csl_ie(dst: &mut [u8], phase: u16, period: u16) {
    write_ie_header(dst, IE_ID_CSL, CSL_IE_CONTENT_LEN);
    dst[2..4].copy_from_slice(&phase.to_le_bytes());
    dst[4..6].copy_from_slice(&period.to_le_bytes());
}

pub fn write_rendezvous_time_ie(dst: &mut [u8], remaining_wake_up_frames: u16) {
    write_ie_header(dst, IE_ID_RENDEZVOUS_TIME, RENDEZVOUS_TIME_IE_CONTENT_LEN);
    dst[2..4].copy_from_slice(&remaining_wake_up_frames.to_le_bytes());
}

/// The 802.15.4 FCS: CRC-16 with polynomial x^16 + x^12 + x^5 + 1,
/// LSB-first, zero init, transmitted little-endian.
const FCS: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// Appends the FCS over `frame[..len - 2]` into the last two bytes.
pub fn append_fcs(frame: &mut [u8]) {
    let split = frame.len() - FCS_LEN;
    let crc = FCS.checksum(&frame[..split]);
    frame[split..].copy_from_slice(&crc.to_le_bytes());
}

pub fn check_fcs(frame: &[u8]) -> bool {
    if frame.len() < FCS_LEN {
        return false;
    }
    let split = frame.len() - FCS_LEN;
    let expected = FCS.checksum(&frame[..split]);
    frame[split..] == expected.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcf_wire_layout() {
        let fcf = Fcf::new()
            .with_frame_type(FrameKind::Data)
            .with_security_enabled(true)
            .with_panid_compression(true)
            .with_sequence_number_suppression(true)
            .with_frame_version(FRAME_VERSION_2015)
            .with_src_addr_mode(AddrMode::Short);
        let bytes = fcf.into_bytes();
        // type=1, sec bit 3, pan comp bit 6
        assert_eq!(bytes[0], 0b0100_1001);
        // seq supp bit 8, version bits 12..13 = 10, src am bits 14..15 = 10
        assert_eq!(bytes[1], 0b1010_0001);
        assert_eq!(Fcf::from_bytes(bytes), fcf);
    }

    #[test]
    fn ie_header_roundtrip() {
        let mut buf = [0u8; 6];
        write_csl_ie(&mut buf, 0x1234, 4096);
        let (id, len) = parse_ie_header(&buf);
        assert_eq!(id, IE_ID_CSL);
        assert_eq!(len, CSL_IE_CONTENT_LEN);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x1234);
    }

    #[test]
    fn fcs_detects_corruption() {
        let mut frame = [1u8, 2, 3, 4, 0, 0];
        append_fcs(&mut frame);
        assert!(check_fcs(&frame));
        frame[1] ^= 0x10;
        assert!(!check_fcs(&frame));
    }
}
