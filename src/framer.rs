//! Marshaling and parsing of wake-up, payload, and acknowledgement frames.
//!
//! The [`Framer`] capability set is fixed at construction time: the
//! standards-compliant implementation lives in [`compliant`], the
//! compressed POTR implementation in [`potr`]. The scheduler calls into
//! whichever one the selected variant names; there is no dispatch at run
//! time.

pub mod compliant;
pub mod potr;

use crate::csl::{DutyCycleState, LinkCtx, TransmitState};
use crate::packet::{BufferFull, Packet};
use crate::radio::{Radio, RadioError, Timing};

/// What kind of payload frame a wake-up sequence announces. On the wire
/// this is the top two bits of the POTR extended frame type; the
/// compliant format transports everything as `Normal` and relies on the
/// command identifier inside the payload instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtype {
    Hello = 0,
    Helloack = 1,
    Ack = 2,
    Normal = 3,
}

impl Subtype {
    pub fn from_bits(bits: u8) -> Subtype {
        match bits & 3 {
            0 => Subtype::Hello,
            1 => Subtype::Helloack,
            2 => Subtype::Ack,
            _ => Subtype::Normal,
        }
    }
}

/// Why a frame was refused. The scheduler reacts identically to all of
/// these (radio off, frame skipped); the distinction feeds the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerError {
    /// A length field or the frame length itself is out of bounds.
    Length { have: usize },
    Type,
    AddressingMode,
    /// Destined to a foreign PAN.
    Pan { pan: u16 },
    NotForUs,
    FromOurselves,
    /// The embedded one-time password did not check out.
    Otp,
    Mic,
    Checksum,
    /// A rate-limiting bucket is full.
    BucketFull,
    /// An AKES acceptability check said no.
    Unacceptable,
    /// A wire index named no live neighbor.
    UnknownIndex,
    /// The rendezvous time lies beyond what any honest sender produces.
    RendezvousTooLate,
    /// The radio FIFO did not yield the bytes it promised.
    Radio,
    Buffer,
    /// The neighbor required for this operation is gone.
    MissingNeighbor,
    /// The outgoing frame counter is exhausted; fatal upstream.
    CounterExhausted,
}

impl From<RadioError> for FramerError {
    fn from(_: RadioError) -> Self {
        FramerError::Radio
    }
}

impl From<BufferFull> for FramerError {
    fn from(_: BufferFull) -> Self {
        FramerError::Buffer
    }
}

/// Number of wake-up frames needed to cover an uncertainty window.
///
/// One extra frame rounds the division up and a second one covers the
/// frame in flight while the receiver turns its radio on.
pub fn wake_up_sequence_length(timing: &Timing, uncertainty: u32, wake_up_frame_len: u32) -> u32 {
    ((uncertainty as u64 * 1_000_000 / timing.ticks_per_second as u64)
        / (timing.byte_period_us as u64 * wake_up_frame_len as u64)) as u32
        + 1
        + 1
}

/// Strategy for creating and parsing IEEE 802.15.4 frames.
pub trait Framer {
    fn init(&mut self, cfg: &crate::config::Config);

    /// Worst-case payload frame header length, for payload sizing.
    fn max_header_len(&self) -> usize;

    /// Prepends the payload frame header to `pkt`.
    fn create_payload_header(
        &self,
        ctx: &mut LinkCtx<'_>,
        pkt: &mut Packet,
        subtype: Subtype,
    ) -> Result<usize, FramerError>;

    /// Strips the (already filtered) header off a received payload frame.
    fn parse_payload_header(&self, pkt: &mut Packet, subtype: Subtype)
        -> Result<usize, FramerError>;

    /// Length-byte value of a wake-up frame: its body, excluding the PHY
    /// header.
    fn wake_up_frame_body_len(&self, timing: &Timing, subtype: Subtype) -> u8;

    /// Builds the wake-up frame template into `dst` (`dst[0]` is the
    /// length byte). The rendezvous-time field stays blank; it is patched
    /// per copy while the sequence streams out.
    fn create_wake_up_frame(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        dst: &mut [u8],
    ) -> Result<(), FramerError>;

    /// Patches the rendezvous-time field (and any checksum) of one queued
    /// wake-up frame so it reflects the number of wake-up frames that
    /// still follow it. `frame[0]` is the length byte.
    fn update_rendezvous_time(
        &self,
        remaining_wake_up_frames: u16,
        rendezvous_time_len: u8,
        frame: &mut [u8],
    );

    /// Parses an incoming wake-up frame out of the radio FIFO; on success
    /// the rendezvous data is in `dc`. Interrupt-safe and allocation-free.
    fn parse_wake_up_frame(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        dc: &mut DutyCycleState,
    ) -> Result<(), FramerError>;

    /// Bytes of a payload frame needed before [`Framer::filter`] can run.
    fn min_bytes_for_filtering(&self, dc: &DutyCycleState) -> u8;

    /// Validates the head of an incoming payload frame and, for unicasts,
    /// renders the acknowledgement into `dc.acknowledgement`.
    /// Interrupt-safe and allocation-free.
    fn filter(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        dc: &mut DutyCycleState,
    ) -> Result<(), FramerError>;

    /// Captures key and nonce material before a unicast goes out, so the
    /// acknowledgement can be checked from interrupt context.
    fn prepare_acknowledgement_parsing(
        &mut self,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
        pkt: &Packet,
    ) -> Result<(), FramerError>;

    /// Parses and authenticates the incoming acknowledgement frame.
    fn parse_acknowledgement(
        &mut self,
        radio: &mut impl Radio,
        ctx: &mut LinkCtx<'_>,
        tx: &mut TransmitState,
    ) -> Result<(), FramerError>;

    /// Bookkeeping after a unicast completed (either way).
    fn on_unicast_transmitted(&mut self, ctx: &mut LinkCtx<'_>, tx: &TransmitState, pkt: &Packet);
}
