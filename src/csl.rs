//! The CSL scheduler: duty cycling, wake-up sequence transmission, and
//! everything that ties the other modules together.
//!
//! Two state machines share the single radio and the single real-time
//! timer, and at most one of them is active at any moment:
//!
//!  - the *duty-cycle* machine samples the channel once per wake-up
//!    interval, parses wake-up frames, sleeps until the rendezvous time,
//!    receives payload frames, and fires prepared acknowledgements;
//!  - the *transmit* machine performs a clear-channel assessment, streams
//!    the wake-up sequence (payload frame appended at its tail), and
//!    collects acknowledgements, bursting follow-up frames when both
//!    sides have more to exchange.
//!
//! The platform drives both by forwarding radio interrupts to
//! [`CslMac::on_sfd`] / [`CslMac::on_fifop`] / [`CslMac::on_txdone`],
//! firing [`CslMac::on_timer`] at [`CslMac::next_timeout`], and calling
//! [`CslMac::post_process`] from task context whenever one of those
//! entry points returns `true`. The entry points themselves do bounded,
//! allocation-free work and are safe to run in interrupt context;
//! `post_process` delivers received frames upward and launches queued
//! transmissions.

use core::mem;

use log::{error, info, warn};
use rand_core::RngCore;

use crate::akes::{self, AkesState, ExpiryPolicy};
use crate::anti_replay::FrameCounter;
use crate::config::{
    Config, LATE_RENDEZVOUS_CAP, MAX_BURST_INDEX, MAX_FRAME_LEN, MAX_SEQUENCE_LEN, QUEUE_CAP,
};
use crate::framer::{Framer, FramerError, Subtype};
use crate::nbr::{NbrStatus, NbrTable};
use crate::packet::{FrameType, Packet};
use crate::queue::{FrameId, FrameQueue, SentAction};
use crate::radio::{Radio, Timing, SHR};
use crate::security::{KEY_LEN, MIC_LEN, NONCE_LEN, SEC_LVL};
use crate::strategy::{Strategy, Verify};
use crate::synchronizer::{SyncArena, Synchronizer};
use crate::time::Ticks;
use crate::wake_up_counter::{WakeUpCounter, WakeUpTimebase};
use crate::{Fatal, KeyScheme, LinkAddr, MacClient, PacketToken, TxStatus};

/// Fits the acknowledgements of both wire formats.
pub const MAX_ACK_LEN: usize = 32;

const LPM_SWITCHING: u32 = 2;
const LPM_DEEP_SWITCHING: u32 = 2;
const NEGATIVE_RENDEZVOUS_TIME_ACCURACY: u32 = 2;
const POSITIVE_RENDEZVOUS_TIME_ACCURACY: u32 = 2;
const MIN_BACK_OFF_EXPONENT: u8 = 2;
const MAX_BACK_OFF_EXPONENT: u8 = 5;
const MIN_PREPARE_LEAD_OVER_LOOP: u32 = 10;
const LATE_RENDEZVOUS_THRESHOLD_US: u32 = 20_000;
const LATE_WAKE_UP_GUARD_US: u32 = 10_000;
/// Coarse upper bound on the air time of one payload frame exchange.
const PAYLOAD_EXCHANGE_US: u32 = 6_000;

pub fn acknowledgement_window_min(timing: &Timing) -> u32 {
    timing.receive_calibration - 1 + timing.shr_time() - 1
}

pub fn acknowledgement_window_max(timing: &Timing) -> u32 {
    timing.receive_calibration + timing.shr_time() + 1
}

pub fn acknowledgement_window(timing: &Timing) -> u32 {
    acknowledgement_window_max(timing) - acknowledgement_window_min(timing) + 1
}

pub fn collision_avoidance_duration(timing: &Timing) -> u32 {
    timing.receive_calibration + timing.cca_time - 2
}

pub fn wake_up_sequence_guard_time(timing: &Timing) -> u32 {
    LPM_SWITCHING + collision_avoidance_duration(timing) + timing.transmit_calibration - 1
}

/// Two ticks of jitter on each side, plus the acknowledgement window to
/// keep pulse-delay attacks from shifting sync data.
pub fn negative_sync_guard_time(timing: &Timing) -> u32 {
    2 + 2 + acknowledgement_window(timing)
}

pub fn positive_sync_guard_time() -> u32 {
    2 + 2
}

/// Largest sync uncertainty an honest sender produces; wake-up frames
/// claiming a rendezvous beyond it are bogus.
pub fn max_overall_uncertainty(timing: &Timing) -> u32 {
    timing.us_to_ticks(2000) + negative_sync_guard_time(timing) + positive_sync_guard_time()
}

fn rendezvous_guard_time(timing: &Timing) -> u32 {
    LPM_SWITCHING + NEGATIVE_RENDEZVOUS_TIME_ACCURACY + timing.receive_calibration
}

fn cca_sleep_duration(timing: &Timing) -> u32 {
    timing.receive_calibration + timing.cca_time - 3
}

fn scan_duration(timing: &Timing, max_wake_up_frame_len: u32) -> u32 {
    timing.time_to_transmit(timing.symbols_per_byte * (max_wake_up_frame_len + timing.shr_len)) + 2
}

/// Snapshot of the local timeline, passed into framers and strategies.
#[derive(Debug, Clone, Copy)]
pub struct CslClock {
    pub timebase: WakeUpTimebase,
    pub wake_up_counter: WakeUpCounter,
    /// Instant `wake_up_counter` was last advanced.
    pub last_increment: Ticks,
    pub last_wake_up_time: Ticks,
    pub last_payload_sfd: Ticks,
}

impl CslClock {
    /// Extrapolates our wake-up counter to instant `t`.
    pub fn wake_up_counter_at(&self, t: Ticks) -> WakeUpCounter {
        let delta = t.diff(self.last_increment).max(0) as u32;
        WakeUpCounter(
            self.wake_up_counter
                .0
                .wrapping_add(self.timebase.increments(delta).0),
        )
    }

    /// Ticks from `t` until our next channel sample.
    pub fn phase(&self, t: Ticks) -> u16 {
        let interval = self.timebase.interval();
        let delta = t.0.wrapping_sub(self.last_wake_up_time.0) & (interval - 1);
        (interval - delta) as u16
    }
}

/// Everything the framer, synchronizer, and strategy implementations need
/// besides their own state, borrowed for one operation.
pub struct LinkCtx<'a> {
    pub cfg: &'a Config,
    pub timing: &'a Timing,
    pub nbr: &'a mut NbrTable,
    pub sync: &'a mut SyncArena,
    pub akes: &'a mut AkesState,
    pub counter: &'a mut FrameCounter,
    pub key_scheme: &'a dyn KeyScheme,
    pub rng: &'a mut dyn RngCore,
    pub clock: CslClock,
    pub node_addr: LinkAddr,
    pub pan_id: u16,
    pub channel: u8,
    pub now: Ticks,
    pub now_s: u32,
}

macro_rules! link_ctx {
    ($mac:expr, $now:expr) => {{
        let clock = $mac.clock();
        let now_s = $mac.uptime_seconds($now);
        let channel = $mac.radio.channel();
        $crate::csl::LinkCtx {
            cfg: &$mac.cfg,
            timing: &$mac.timing,
            nbr: &mut $mac.nbr,
            sync: &mut $mac.sync,
            akes: &mut $mac.akes,
            counter: &mut $mac.counter,
            key_scheme: &$mac.key_scheme,
            rng: &mut $mac.rng,
            clock,
            node_addr: $mac.node_addr,
            pan_id: $mac.pan_id,
            channel,
            now: $now,
            now_s,
        }
    }};
}
pub(crate) use link_ctx;

/// Where the duty-cycle machine is parked; each variant is one of the
/// explicit wait states the interrupt handlers resume it from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyCycleStep {
    /// Scheduled, waiting for the wake-up instant.
    PendingStart,
    /// Radio on, scanning for a wake-up frame's SFD.
    Scanning,
    /// Got the SFD, waiting for enough bytes to parse the wake-up frame.
    AwaitingWakeUpFifop,
    /// Radio off until shortly before the rendezvous.
    AwaitingRendezvousTimer,
    /// Radio on around the rendezvous, expecting the payload SFD.
    AwaitingPayloadShr,
    /// Got the payload SFD, waiting for the filtering prefix.
    AwaitingPayloadFifop,
    /// Filter passed, waiting for the rest of the frame.
    AwaitingFinalFifop,
    /// Acknowledgement transmitting.
    AwaitingAckTxDone,
    Done,
}

pub struct DutyCycleState {
    pub step: DutyCycleStep,
    pub subtype: Subtype,
    /// Receiver of the announced payload frame (the compliant variant
    /// parses it from the wake-up frame).
    pub receiver: LinkAddr,
    pub next_frames_len: u8,
    pub min_bytes_for_filtering: u8,
    pub frame_pending: bool,
    pub remaining_wake_up_frames: u16,
    pub rendezvous_time: Ticks,
    pub got_wake_up_frames_shr: bool,
    pub waiting_for_wake_up_frames_shr: bool,
    pub left_radio_on: bool,
    pub waiting_for_unwanted_shr: bool,
    pub got_rendezvous_time: bool,
    pub skip_to_rendezvous: bool,
    pub waiting_for_payload_frames_shr: bool,
    pub got_payload_frames_shr: bool,
    pub rejected_payload_frame: bool,
    pub wake_up_frame_sfd_timestamp: Ticks,
    pub sender: LinkAddr,
    pub shall_send_acknowledgement: bool,
    pub received_frame: bool,
    pub last_burst_index: u8,
    /// Read cursor into the frame under reception.
    pub bytes_read: u8,
    /// Prepared acknowledgement; `[0]` is the PHY length byte.
    pub acknowledgement: [u8; 1 + MAX_ACK_LEN],
    /// One owned buffer per burst position.
    pub packets: [Packet; MAX_BURST_INDEX + 1],
}

impl Default for DutyCycleState {
    fn default() -> Self {
        DutyCycleState {
            step: DutyCycleStep::PendingStart,
            subtype: Subtype::Normal,
            receiver: LinkAddr::NULL,
            next_frames_len: 0,
            min_bytes_for_filtering: 0,
            frame_pending: false,
            remaining_wake_up_frames: 0,
            rendezvous_time: Ticks(0),
            got_wake_up_frames_shr: false,
            waiting_for_wake_up_frames_shr: false,
            left_radio_on: false,
            waiting_for_unwanted_shr: false,
            got_rendezvous_time: false,
            skip_to_rendezvous: false,
            waiting_for_payload_frames_shr: false,
            got_payload_frames_shr: false,
            rejected_payload_frame: false,
            wake_up_frame_sfd_timestamp: Ticks(0),
            sender: LinkAddr::NULL,
            shall_send_acknowledgement: false,
            received_frame: false,
            last_burst_index: 0,
            bytes_read: 0,
            acknowledgement: [0; 1 + MAX_ACK_LEN],
            packets: core::array::from_fn(|_| Packet::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStep {
    /// Waiting for the transmission window to open.
    AwaitingTxWindow,
    /// Radio listening for the clear-channel assessment.
    AwaitingCca,
    /// Wake-up sequence streaming; more copies get appended as it drains.
    Streaming,
    /// All bytes queued; waiting for the drain point to close the
    /// sequence.
    FinishingSequence,
    /// Listening for the acknowledgement.
    AwaitingAck,
    /// A bursted payload frame is leaving the radio.
    AwaitingBurstTxDone,
    Done,
}

pub struct TransmitState {
    pub step: TransmitStep,
    pub subtype: Subtype,
    pub is_broadcast: bool,
    pub receiver: LinkAddr,
    pub bf: [Option<FrameId>; MAX_BURST_INDEX + 1],
    pub result: [Option<TxStatus>; MAX_BURST_INDEX + 1],
    pub last_burst_index: u8,
    pub burst_index: u8,
    /// Wake-up frame length on air, PHY header included.
    pub wake_up_frame_len: u8,
    pub rendezvous_time_len: u8,
    pub wake_up_sequence_start: Ticks,
    pub remaining_wake_up_frames: u16,
    pub payload_frame_start: Ticks,
    pub receivers_wake_up_counter: WakeUpCounter,
    pub acknowledgement_key: [u8; KEY_LEN],
    pub acknowledgement_nonce: [u8; NONCE_LEN],
    pub expected_mic_len: u8,
    pub his_unicast_counter: u32,
    pub acknowledgement_sfd_timestamp: Ticks,
    pub acknowledgement_phase: u16,
    pub waiting_for_acknowledgement_shr: bool,
    pub got_acknowledgement_shr: bool,
    pub is_waiting_for_txdone: bool,
    pub next_rendezvous_time_update: Ticks,
    pub wake_up_sequence_pos: u32,
    pub wrote_payload_frames_phy_header: bool,
    pub remaining_payload_frame_bytes: u8,
    /// Staging buffer handed to the radio's sequence engine.
    pub next_wake_up_frames: [u8; MAX_SEQUENCE_LEN],
    /// Serialized payload frames, `[i][0]` being the PHY length byte.
    pub payload_frame: [[u8; 1 + MAX_FRAME_LEN]; MAX_BURST_INDEX + 1],
}

impl Default for TransmitState {
    fn default() -> Self {
        TransmitState {
            step: TransmitStep::AwaitingTxWindow,
            subtype: Subtype::Normal,
            is_broadcast: false,
            receiver: LinkAddr::NULL,
            bf: [None; MAX_BURST_INDEX + 1],
            result: [None; MAX_BURST_INDEX + 1],
            last_burst_index: 0,
            burst_index: 0,
            wake_up_frame_len: 0,
            rendezvous_time_len: 0,
            wake_up_sequence_start: Ticks(0),
            remaining_wake_up_frames: 0,
            payload_frame_start: Ticks(0),
            receivers_wake_up_counter: WakeUpCounter(0),
            acknowledgement_key: [0; KEY_LEN],
            acknowledgement_nonce: [0; NONCE_LEN],
            expected_mic_len: 0,
            his_unicast_counter: 0,
            acknowledgement_sfd_timestamp: Ticks(0),
            acknowledgement_phase: 0,
            waiting_for_acknowledgement_shr: false,
            got_acknowledgement_shr: false,
            is_waiting_for_txdone: false,
            next_rendezvous_time_update: Ticks(0),
            wake_up_sequence_pos: 0,
            wrote_payload_frames_phy_header: false,
            remaining_payload_frame_bytes: 0,
            next_wake_up_frames: [0; MAX_SEQUENCE_LEN],
            payload_frame: [[0; 1 + MAX_FRAME_LEN]; MAX_BURST_INDEX + 1],
        }
    }
}

impl TransmitState {
    /// Instant the payload frame's SHR finishes transmitting.
    pub fn payload_frames_shr_end(&self, timing: &Timing) -> Ticks {
        self.payload_frame_start + timing.shr_time()
    }
}

/// Cached wake-up frame whose rendezvous lies far enough ahead that other
/// work can run first.
#[derive(Debug, Clone, Copy)]
struct LateRendezvous {
    time: Ticks,
    subtype: Subtype,
    channel: u8,
}

/// A broadcast being fanned out as per-neighbor unicasts.
struct OngoingBroadcast {
    packet: Packet,
    token: PacketToken,
    /// Neighbor indices already reached.
    bitmap: u32,
    transmissions: u8,
}

/// Duty cycling and transmitting are mutually exclusive.
enum CslState {
    Idle,
    DutyCycle(DutyCycleState),
    Transmit(TransmitState),
}

/// Couples a wire format with its synchronizer and security strategy;
/// fixed by type parameter so no dispatch remains on hot paths.
pub trait Variant {
    const COMPLIANT: bool;
    /// Peers address each other by table index on the wire.
    const WITH_INDICES: bool;
    /// Duplicate detection via per-neighbor sequence numbers (otherwise
    /// frame counters cover it).
    const WITH_SEQNOS: bool;
    /// Unicasts are verified in task context rather than on the fly.
    const VERIFY_ON_INPUT: bool;
    /// FIFO bytes needed before wake-up frame parsing may start.
    const MIN_BYTES_FOR_PARSING_WAKE_UP_FRAMES: u8;
    type Framer: Framer + Default;
    type Synchronizer: Synchronizer + Default;
    type Strategy: Strategy + Default;
}

/// The POTR variant: compressed frames, OTPs, pairwise keys, channel
/// hopping, drift learning.
pub struct Potr;

impl Variant for Potr {
    const COMPLIANT: bool = false;
    const WITH_INDICES: bool = true;
    const WITH_SEQNOS: bool = true;
    const VERIFY_ON_INPUT: bool = false;
    const MIN_BYTES_FOR_PARSING_WAKE_UP_FRAMES: u8 = 1;
    type Framer = crate::framer::potr::PotrFramer;
    type Synchronizer = crate::synchronizer::Splo;
    type Strategy = crate::strategy::Csl;
}

/// The standards-compliant variant: single channel, group keys, frame
/// counters.
pub struct Compliant;

impl Variant for Compliant {
    const COMPLIANT: bool = true;
    const WITH_INDICES: bool = false;
    const WITH_SEQNOS: bool = false;
    const VERIFY_ON_INPUT: bool = true;
    const MIN_BYTES_FOR_PARSING_WAKE_UP_FRAMES: u8 = 10;
    type Framer = crate::framer::compliant::CompliantFramer;
    type Synchronizer = crate::synchronizer::Compliant;
    type Strategy = crate::strategy::Noncoresec;
}

pub type PotrMac<R, K, G> = CslMac<R, K, G, Potr>;
pub type CompliantMac<R, K, G> = CslMac<R, K, G, Compliant>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    TooLong,
    /// No permanent neighbor to carry the frame.
    NoNeighbors,
    QueueFull,
    Fatal(Fatal),
}

enum Launch {
    Started,
    Failed(TxStatus),
    Deferred,
}

pub struct CslMac<R, K, G, V: Variant> {
    pub(crate) radio: R,
    pub(crate) timing: Timing,
    pub(crate) cfg: Config,
    pub(crate) key_scheme: K,
    pub(crate) rng: G,
    pub(crate) framer: V::Framer,
    pub(crate) synchronizer: V::Synchronizer,
    pub(crate) strategy: V::Strategy,
    pub(crate) nbr: NbrTable,
    pub(crate) sync: SyncArena,
    pub(crate) akes: AkesState,
    pub(crate) queue: FrameQueue,
    pub(crate) counter: FrameCounter,
    pub(crate) node_addr: LinkAddr,
    pub(crate) pan_id: u16,
    pub(crate) timebase: WakeUpTimebase,
    state: CslState,
    late_rendezvous: heapless::Vec<LateRendezvous, LATE_RENDEZVOUS_CAP>,
    ongoing_broadcasts: [Option<OngoingBroadcast>; QUEUE_CAP],
    wake_up_counter: WakeUpCounter,
    wake_up_counter_last_increment: Ticks,
    last_wake_up_time: Ticks,
    duty_cycle_next: Ticks,
    last_payload_sfd: Ticks,
    timer: Option<Ticks>,
    can_skip: bool,
    skipped: bool,
    sent_once: bool,
}

impl<R, K, G, V> CslMac<R, K, G, V>
where
    R: Radio,
    K: KeyScheme,
    G: RngCore,
    V: Variant,
{
    pub fn new(
        mut radio: R,
        timing: Timing,
        cfg: Config,
        key_scheme: K,
        rng: G,
        node_addr: LinkAddr,
        pan_id: u16,
        now: Ticks,
    ) -> Self {
        radio.enter_async_mode();
        radio.set_tx_power(cfg.output_power_dbm);
        radio.set_channel(cfg.channels[0]);
        if !V::COMPLIANT {
            assert!(cfg.channels.len().is_power_of_two());
        }
        let timebase = WakeUpTimebase::new(timing.ticks_per_second, cfg.wake_up_counter_rate);
        let akes = AkesState::new(
            &cfg,
            !V::COMPLIANT,
            if V::COMPLIANT {
                ExpiryPolicy::WallClock
            } else {
                ExpiryPolicy::SyncBased
            },
        );
        let duty_cycle_next = now + timebase.interval();
        let mut mac: CslMac<R, K, G, V> = CslMac {
            radio,
            timing,
            cfg,
            key_scheme,
            rng,
            framer: V::Framer::default(),
            synchronizer: V::Synchronizer::default(),
            strategy: V::Strategy::default(),
            nbr: NbrTable::new(),
            sync: SyncArena::default(),
            akes,
            queue: FrameQueue::new(),
            counter: FrameCounter::new(),
            node_addr,
            pan_id,
            timebase,
            state: CslState::DutyCycle(DutyCycleState::default()),
            late_rendezvous: heapless::Vec::new(),
            ongoing_broadcasts: core::array::from_fn(|_| None),
            wake_up_counter: WakeUpCounter(0),
            wake_up_counter_last_increment: now,
            last_wake_up_time: now,
            duty_cycle_next,
            last_payload_sfd: now,
            timer: Some(duty_cycle_next - LPM_DEEP_SWITCHING),
            can_skip: true,
            skipped: false,
            sent_once: false,
        };
        mac.framer.init(&mac.cfg);
        mac.akes_init(now);
        mac
    }

    pub(crate) fn clock(&self) -> CslClock {
        CslClock {
            timebase: self.timebase,
            wake_up_counter: self.wake_up_counter,
            last_increment: self.wake_up_counter_last_increment,
            last_wake_up_time: self.last_wake_up_time,
            last_payload_sfd: self.last_payload_sfd,
        }
    }

    /// A monotonic seconds clock derived from the wake-up counter.
    pub(crate) fn uptime_seconds(&self, now: Ticks) -> u32 {
        self.clock().wake_up_counter_at(now).0 / self.cfg.wake_up_counter_rate
    }

    /// When the platform must call [`CslMac::on_timer`] next.
    pub fn next_timeout(&self) -> Option<Ticks> {
        self.timer
    }

    pub fn max_payload(&self) -> usize {
        MAX_FRAME_LEN - self.framer.max_header_len() - MIC_LEN
    }

    /// Duty cycling runs from construction on; `on` and `off` exist for
    /// interface completeness only.
    pub fn on(&mut self) -> bool {
        true
    }

    pub fn off(&mut self) -> bool {
        true
    }

    /// Queues an outgoing data frame. `Ok(true)` asks the platform to run
    /// `post_process` soon.
    pub fn send(
        &mut self,
        payload: &[u8],
        receiver: LinkAddr,
        token: PacketToken,
        now: Ticks,
    ) -> Result<bool, SendError> {
        if payload.len() > self.max_payload() {
            return Err(SendError::TooLong);
        }
        let mut pkt = Packet::new();
        pkt.set_data(payload).map_err(|_| SendError::TooLong)?;
        pkt.receiver = receiver;
        pkt.frame_type = FrameType::Data;
        pkt.sec_lvl = SEC_LVL;

        if pkt.holds_broadcast() {
            if self.nbr.count(NbrStatus::Permanent) == 0 {
                return Err(SendError::NoNeighbors);
            }
            if <V::Strategy as Strategy>::FAN_OUT_BROADCASTS {
                let Some(slot) = self.ongoing_broadcasts.iter().position(|o| o.is_none())
                else {
                    error!("ongoing broadcasts are exhausted");
                    return Err(SendError::QueueFull);
                };
                self.ongoing_broadcasts[slot] = Some(OngoingBroadcast {
                    packet: pkt,
                    token,
                    bitmap: 0,
                    transmissions: 0,
                });
                if !self.send_broadcast_leg(slot as u8, now) {
                    self.ongoing_broadcasts[slot] = None;
                    return Err(SendError::QueueFull);
                }
                return Ok(self.try_skip_to_send());
            }
            self.set_numbers(None, &mut pkt).map_err(SendError::Fatal)?;
        } else {
            let entry = self.nbr.entry_of(&receiver);
            let Some(handle) = entry.permanent else {
                return Err(SendError::NoNeighbors);
            };
            self.set_numbers(Some(handle), &mut pkt)
                .map_err(SendError::Fatal)?;
        }
        if !self.enqueue_frame(pkt, SentAction::Upper(token), now) {
            return Err(SendError::QueueFull);
        }
        Ok(self.try_skip_to_send())
    }

    /// Enqueues the next leg of a fanned-out broadcast; false when the
    /// queue refused it.
    fn send_broadcast_leg(&mut self, ob_index: u8, now: Ticks) -> bool {
        let (bitmap, mut pkt) = {
            let Some(ob) = self.ongoing_broadcasts[ob_index as usize].as_ref() else {
                return false;
            };
            (ob.bitmap, ob.packet.clone())
        };
        let next = self.nbr.handles().into_iter().find(|h| {
            self.nbr.get(*h).is_some_and(|n| n.permanent().is_some())
                && bitmap & (1 << h.index()) == 0
        });
        let Some(handle) = next else {
            // nothing left; completion is detected in broadcast_leg_done
            return true;
        };
        let Some(addr) = self.nbr.get(handle).map(|n| n.addr) else {
            return false;
        };
        pkt.receiver = addr;
        pkt.max_transmissions = self.cfg.broadcast_max_retransmissions + 1;
        if self.set_numbers(Some(handle), &mut pkt).is_err() {
            return false;
        }
        if let Some(ob) = self.ongoing_broadcasts[ob_index as usize].as_mut() {
            ob.bitmap |= 1 << handle.index();
        }
        self.enqueue_frame(pkt, SentAction::Broadcast { ob: ob_index }, now)
    }

    fn broadcast_leg_done(
        &mut self,
        ob_index: u8,
        status: TxStatus,
        transmissions: u8,
        now: Ticks,
        client: &mut dyn MacClient,
    ) {
        if status == TxStatus::Deferred {
            return;
        }
        let bitmap = {
            let Some(ob) = self.ongoing_broadcasts[ob_index as usize].as_mut() else {
                return;
            };
            ob.transmissions = ob.transmissions.saturating_add(transmissions);
            ob.bitmap
        };
        let more = self.nbr.handles().into_iter().any(|h| {
            self.nbr.get(h).is_some_and(|n| n.permanent().is_some())
                && bitmap & (1 << h.index()) == 0
        });
        if more {
            self.send_broadcast_leg(ob_index, now);
            return;
        }
        if let Some(ob) = self.ongoing_broadcasts[ob_index as usize].take() {
            client.sent(ob.token, TxStatus::Ok, ob.transmissions);
        }
    }

    /// Buffers an outgoing frame; false (with a log) when the queue is
    /// full.
    pub(crate) fn enqueue_frame(
        &mut self,
        mut pkt: Packet,
        action: SentAction,
        now: Ticks,
    ) -> bool {
        if pkt.max_transmissions == 0 {
            pkt.max_transmissions = self.cfg.max_retransmissions + 1;
        }
        self.queue.enqueue(pkt, action, now).is_ok()
    }

    /// Jumps straight to post-processing when the scheduler sits in a
    /// skippable wait for the next wake-up.
    fn try_skip_to_send(&mut self) -> bool {
        if self.skipped || !self.can_skip {
            return false;
        }
        if let CslState::DutyCycle(dc) = &self.state {
            if dc.step == DutyCycleStep::PendingStart && self.timer.is_some() {
                self.timer = None;
                self.skipped = true;
                return true;
            }
        }
        false
    }

    /// POTR channel hash: wake-up counter low byte XOR address bytes.
    fn channel_for(cfg: &Config, wuc: WakeUpCounter, addr: &LinkAddr) -> u8 {
        let mut xored = wuc.low_byte();
        for b in addr.as_bytes() {
            xored ^= *b;
        }
        cfg.channels[(xored as usize) & (cfg.channels.len() - 1)]
    }

    fn clear_missed_late_rendezvous(&mut self, now: Ticks) {
        let guard = rendezvous_guard_time(&self.timing) + (LPM_DEEP_SWITCHING - LPM_SWITCHING);
        self.late_rendezvous.retain(|lr| {
            let keep = !(lr.time - guard).has_timed_out(now);
            if !keep {
                error!("forgot late rendezvous");
            }
            keep
        });
    }

    fn nearest_late_rendezvous(&mut self, now: Ticks) -> Option<LateRendezvous> {
        self.clear_missed_late_rendezvous(now);
        self.late_rendezvous
            .iter()
            .copied()
            .min_by_key(|lr| lr.time.diff(now))
    }

    fn has_late_rendezvous_on_channel(&mut self, now: Ticks, channel: u8) -> bool {
        self.clear_missed_late_rendezvous(now);
        self.late_rendezvous.iter().any(|lr| lr.channel == channel)
    }

    /// Start-of-frame-delimiter interrupt.
    pub fn on_sfd(&mut self, now: Ticks) -> bool {
        let drain_straggler = match &mut self.state {
            CslState::DutyCycle(dc) => {
                if dc.waiting_for_unwanted_shr {
                    dc.waiting_for_unwanted_shr = false;
                    false
                } else if dc.waiting_for_wake_up_frames_shr {
                    dc.got_wake_up_frames_shr = true;
                    dc.wake_up_frame_sfd_timestamp = now;
                    dc.step = DutyCycleStep::AwaitingWakeUpFifop;
                    self.timer = None;
                    false
                } else if dc.waiting_for_payload_frames_shr {
                    let drain = dc.left_radio_on && dc.remaining_wake_up_frames > 0;
                    if !drain {
                        dc.got_payload_frames_shr = true;
                        self.last_payload_sfd = now;
                    }
                    drain
                } else {
                    false
                }
            }
            CslState::Transmit(tx) => {
                if tx.waiting_for_acknowledgement_shr {
                    tx.got_acknowledgement_shr = true;
                    if tx.burst_index == 0 {
                        tx.acknowledgement_sfd_timestamp = now;
                    }
                }
                false
            }
            CslState::Idle => false,
        };
        if drain_straggler {
            // a straggler wake-up frame sits in the FIFO in front of the
            // payload; drain it so the payload lines up
            let mut scratch = [0u8; MAX_ACK_LEN];
            let drained = match self.radio.read_phy_header() {
                Ok(len) if (len as usize) <= scratch.len() => self
                    .radio
                    .read_payload(&mut scratch[..len as usize])
                    .is_ok(),
                _ => false,
            };
            if !drained {
                warn!("something went wrong while scanning for the payload frame");
                return false;
            }
            if let CslState::DutyCycle(dc) = &mut self.state {
                dc.got_payload_frames_shr = true;
                self.last_payload_sfd = now;
            }
        }
        false
    }

    /// FIFO-threshold interrupt.
    pub fn on_fifop(&mut self, now: Ticks) -> bool {
        let step = match &self.state {
            CslState::DutyCycle(dc) => dc.step,
            _ => return false,
        };
        match step {
            DutyCycleStep::AwaitingWakeUpFifop => self.on_wake_up_frame_fifop(now),
            DutyCycleStep::AwaitingPayloadFifop => self.on_payload_frame_fifop(now),
            DutyCycleStep::AwaitingFinalFifop => self.on_final_payload_frame_fifop(now),
            _ => false,
        }
    }

    fn on_wake_up_frame_fifop(&mut self, now: Ticks) -> bool {
        {
            let CslState::DutyCycle(dc) = &mut self.state else {
                return false;
            };
            if !dc.got_wake_up_frames_shr {
                return false;
            }
            dc.packets[0].clear();
        }
        self.radio.clear_fifop();
        let parsed = {
            let mut ctx = link_ctx!(self, now);
            let CslState::DutyCycle(dc) = &mut self.state else {
                return false;
            };
            self.framer
                .parse_wake_up_frame(&mut self.radio, &mut ctx, dc)
        };

        let late_threshold = self.timing.us_to_ticks(LATE_RENDEZVOUS_THRESHOLD_US);
        let channel = self.radio.channel();
        let CslState::DutyCycle(dc) = &mut self.state else {
            return false;
        };
        dc.got_rendezvous_time = parsed.is_ok();
        if parsed.is_err() || dc.remaining_wake_up_frames >= 2 {
            self.radio.off();
        } else {
            dc.left_radio_on = true;
            if dc.remaining_wake_up_frames == 1 {
                dc.waiting_for_unwanted_shr = true;
            }
        }

        if !dc.got_rendezvous_time {
            dc.step = DutyCycleStep::Done;
            return true;
        }

        // cache rendezvous times far enough away to let other work run
        // first
        if !V::COMPLIANT
            && !dc.left_radio_on
            && !dc.skip_to_rendezvous
            && !dc.rendezvous_time.is_at_or_before(now + late_threshold)
        {
            let lr = LateRendezvous {
                time: dc.rendezvous_time,
                subtype: dc.subtype,
                channel,
            };
            if self.late_rendezvous.push(lr).is_err() {
                error!("late rendezvous cache is full");
            }
            dc.step = DutyCycleStep::Done;
            return true;
        }

        dc.min_bytes_for_filtering = self.framer.min_bytes_for_filtering(dc);
        self.radio
            .set_fifop_threshold(1 + dc.min_bytes_for_filtering);
        let rendezvous_guard = rendezvous_guard_time(&self.timing);
        if !dc.left_radio_on && !(dc.rendezvous_time - rendezvous_guard).has_timed_out(now) {
            self.timer = Some(dc.rendezvous_time - rendezvous_guard);
            dc.step = DutyCycleStep::AwaitingRendezvousTimer;
        } else {
            if !dc.left_radio_on {
                self.radio.on();
            }
            dc.waiting_for_payload_frames_shr = true;
            self.timer = Some(
                dc.rendezvous_time + self.timing.shr_time() + POSITIVE_RENDEZVOUS_TIME_ACCURACY,
            );
            dc.step = DutyCycleStep::AwaitingPayloadShr;
        }
        false
    }

    fn on_payload_frame_fifop(&mut self, now: Ticks) -> bool {
        {
            let CslState::DutyCycle(dc) = &self.state else {
                return false;
            };
            if !dc.got_payload_frames_shr {
                return false;
            }
        }
        self.radio.clear_fifop();
        let filtered = self.do_payload_filter(now);

        let CslState::DutyCycle(dc) = &mut self.state else {
            return false;
        };
        let burst = dc.last_burst_index as usize;
        match filtered {
            Err(_) => {
                self.radio.off();
                info!(
                    "rejected payload frame of length {}",
                    dc.packets[burst].data_len()
                );
                dc.rejected_payload_frame = true;
                dc.last_burst_index = dc.last_burst_index.saturating_sub(1);
                dc.step = DutyCycleStep::Done;
                true
            }
            Ok(()) => {
                dc.frame_pending = dc.packets[burst].pending != 0 && burst < MAX_BURST_INDEX;
                dc.sender = dc.packets[burst].sender;
                dc.shall_send_acknowledgement = !dc.packets[burst].holds_broadcast();
                if dc.shall_send_acknowledgement {
                    let ack_len = 1 + dc.acknowledgement[0] as usize;
                    self.radio.prepare(&dc.acknowledgement[..ack_len]);
                }
                self.radio
                    .set_fifop_threshold(self.radio.remaining_payload_bytes());
                dc.step = DutyCycleStep::AwaitingFinalFifop;
                false
            }
        }
    }

    /// Reads the filtering prefix and runs the framer's filter.
    fn do_payload_filter(&mut self, now: Ticks) -> Result<(), FramerError> {
        let rssi = self.radio.rssi();
        let len = self.radio.read_phy_header()?;
        {
            let CslState::DutyCycle(dc) = &mut self.state else {
                return Err(FramerError::Buffer);
            };
            let burst = dc.last_burst_index as usize;
            let sender = dc.sender;
            let min = dc.min_bytes_for_filtering as usize;
            if (len as usize) < min {
                return Err(FramerError::Length { have: len as usize });
            }
            let pkt = &mut dc.packets[burst];
            pkt.clear();
            pkt.rssi = rssi;
            pkt.burst_index = burst as u8;
            if burst > 0 {
                pkt.sender = sender;
            }
            pkt.set_data_len(len as usize)?;
            self.radio.read_payload(&mut pkt.data_mut()[..min])?;
            dc.bytes_read = min as u8;
        }
        let mut ctx = link_ctx!(self, now);
        let CslState::DutyCycle(dc) = &mut self.state else {
            return Err(FramerError::Buffer);
        };
        self.framer.filter(&mut self.radio, &mut ctx, dc)
    }

    fn on_final_payload_frame_fifop(&mut self, now: Ticks) -> bool {
        self.radio.clear_fifop();
        {
            let CslState::DutyCycle(dc) = &self.state else {
                return false;
            };
            if dc.shall_send_acknowledgement {
                self.radio.transmit(dc.frame_pending);
            } else if !dc.frame_pending {
                self.radio.off();
            }
        }

        let successful = self.read_and_verify_payload(now);

        let CslState::DutyCycle(dc) = &mut self.state else {
            return false;
        };
        if successful {
            dc.received_frame = true;
        } else if dc.shall_send_acknowledgement {
            // abort the acknowledgement going out for an inauthentic frame
            self.radio.off();
            dc.frame_pending = false;
            info!("flushing unicast frame");
        }

        if !successful {
            dc.last_burst_index = dc.last_burst_index.saturating_sub(1);
            dc.step = DutyCycleStep::Done;
            return true;
        }
        if dc.frame_pending {
            // stay up for the next frame of the burst
            dc.last_burst_index += 1;
            dc.min_bytes_for_filtering = self.framer.min_bytes_for_filtering(dc);
            self.radio
                .set_fifop_threshold(1 + dc.min_bytes_for_filtering);
            dc.got_payload_frames_shr = false;
            dc.waiting_for_payload_frames_shr = true;
            dc.left_radio_on = false;
            dc.remaining_wake_up_frames = 0;
            self.timer = Some(now + acknowledgement_window_max(&self.timing));
            dc.step = DutyCycleStep::AwaitingPayloadShr;
            return false;
        }
        if dc.shall_send_acknowledgement {
            dc.step = DutyCycleStep::AwaitingAckTxDone;
            false
        } else {
            dc.step = DutyCycleStep::Done;
            true
        }
    }

    /// Reads the rest of the payload frame, strips its header, and runs
    /// the variant's on-the-fly verification.
    fn read_and_verify_payload(&mut self, now: Ticks) -> bool {
        let remaining = self.radio.remaining_payload_bytes() as usize;
        let read_ok = {
            let CslState::DutyCycle(dc) = &mut self.state else {
                return false;
            };
            let burst = dc.last_burst_index as usize;
            let pos = dc.bytes_read as usize;
            let pkt = &mut dc.packets[burst];
            pos + remaining <= pkt.data_len()
                && self
                    .radio
                    .read_payload(&mut pkt.data_mut()[pos..pos + remaining])
                    .is_ok()
        };
        if !read_ok {
            error!("could not read payload frame");
            return false;
        }

        let (subtype, sender, shall_ack, burst) = {
            let CslState::DutyCycle(dc) = &mut self.state else {
                return false;
            };
            let burst = dc.last_burst_index as usize;
            let subtype = dc.subtype;
            if self
                .framer
                .parse_payload_header(&mut dc.packets[burst], subtype)
                .is_err()
            {
                error!("parse failed");
                return false;
            }
            (subtype, dc.sender, dc.shall_send_acknowledgement, burst)
        };

        if V::VERIFY_ON_INPUT {
            // the compliant variant verifies from task context
            return true;
        }
        if subtype == Subtype::Helloack || !shall_ack {
            return true;
        }

        let entry = self.nbr.entry_of(&sender);
        let handle = match subtype {
            Subtype::Ack => {
                let Some(handle) = entry.tentative else {
                    error!("sender not found");
                    return false;
                };
                let Some(meta_index) = self.nbr.meta_index_of(handle) else {
                    return false;
                };
                let expected_q = self.sync.tentative(meta_index).q;
                let at = 1 + 1 + crate::framer::potr::PHASE_LEN;
                let CslState::DutyCycle(dc) = &mut self.state else {
                    return false;
                };
                let data = dc.packets[burst].data();
                if data.len() < at + crate::nbr::CHALLENGE_LEN
                    || data[at..at + crate::nbr::CHALLENGE_LEN] != expected_q
                {
                    error!("wrong challenge");
                    return false;
                }
                let tail = KEY_LEN + MIC_LEN;
                let unencrypted = dc.packets[burst].data_len().saturating_sub(tail);
                dc.packets[burst].unencrypted = unencrypted as u8;
                handle
            }
            _ => {
                let Some(handle) = entry.permanent else {
                    error!("sender not found");
                    return false;
                };
                handle
            }
        };
        let mut ctx = link_ctx!(self, now);
        let CslState::DutyCycle(dc) = &mut self.state else {
            return false;
        };
        self.strategy.verify(&mut ctx, &mut dc.packets[burst], handle) == Verify::Success
    }

    /// Transmission-done interrupt.
    pub fn on_txdone(&mut self, now: Ticks) -> bool {
        enum After {
            Nothing,
            DutyCycleDone,
            NextBroadcastBurst,
            AwaitAck,
        }
        let after = match &mut self.state {
            CslState::DutyCycle(dc) if dc.step == DutyCycleStep::AwaitingAckTxDone => {
                dc.step = DutyCycleStep::Done;
                After::DutyCycleDone
            }
            CslState::Transmit(tx)
                if tx.step == TransmitStep::AwaitingBurstTxDone && tx.is_waiting_for_txdone =>
            {
                tx.is_waiting_for_txdone = false;
                if tx.is_broadcast {
                    tx.result[tx.burst_index as usize] = Some(TxStatus::Ok);
                    After::NextBroadcastBurst
                } else {
                    After::AwaitAck
                }
            }
            _ => After::Nothing,
        };
        match after {
            After::DutyCycleDone => true,
            After::NextBroadcastBurst => self.advance_burst(now),
            After::AwaitAck => {
                self.arm_acknowledgement_window(now);
                false
            }
            After::Nothing => false,
        }
    }

    fn arm_acknowledgement_window(&mut self, now: Ticks) {
        self.radio.on();
        self.timer = Some(now + acknowledgement_window_max(&self.timing));
        if let CslState::Transmit(tx) = &mut self.state {
            tx.waiting_for_acknowledgement_shr = true;
            tx.got_acknowledgement_shr = false;
            tx.step = TransmitStep::AwaitingAck;
        }
    }

    /// Timer expiry; dispatches on whichever machine is waiting.
    pub fn on_timer(&mut self, now: Ticks) -> bool {
        self.timer = None;
        enum Which {
            Dc(DutyCycleStep),
            Tx(TransmitStep),
        }
        let which = match &self.state {
            CslState::DutyCycle(dc) => Which::Dc(dc.step),
            CslState::Transmit(tx) => Which::Tx(tx.step),
            CslState::Idle => return false,
        };
        match which {
            Which::Dc(DutyCycleStep::PendingStart) => self.start_duty_cycle(now),
            Which::Dc(DutyCycleStep::Scanning) => self.on_scan_timeout(),
            Which::Dc(DutyCycleStep::AwaitingRendezvousTimer) => self.on_rendezvous_timer(),
            Which::Dc(DutyCycleStep::AwaitingPayloadShr) => self.on_payload_shr_timeout(),
            Which::Tx(TransmitStep::AwaitingTxWindow) => self.on_tx_window(now),
            Which::Tx(TransmitStep::AwaitingCca) => self.on_cca(now),
            Which::Tx(TransmitStep::Streaming) => self.on_stream_append(now),
            Which::Tx(TransmitStep::FinishingSequence) => self.on_finish_sequence(now),
            Which::Tx(TransmitStep::AwaitingAck) => self.on_acknowledgement_window(now),
            _ => false,
        }
    }

    fn on_scan_timeout(&mut self) -> bool {
        let got = matches!(&self.state, CslState::DutyCycle(dc) if dc.got_wake_up_frames_shr);
        if got {
            // the SFD beat the timeout; the FIFO interrupt takes it from
            // here
            return false;
        }
        self.radio.off();
        if let CslState::DutyCycle(dc) = &mut self.state {
            dc.waiting_for_wake_up_frames_shr = false;
            dc.step = DutyCycleStep::Done;
        }
        true
    }

    fn on_rendezvous_timer(&mut self) -> bool {
        self.radio.on();
        let timing = self.timing;
        if let CslState::DutyCycle(dc) = &mut self.state {
            dc.waiting_for_payload_frames_shr = true;
            self.timer =
                Some(dc.rendezvous_time + timing.shr_time() + POSITIVE_RENDEZVOUS_TIME_ACCURACY);
            dc.step = DutyCycleStep::AwaitingPayloadShr;
        }
        false
    }

    fn on_payload_shr_timeout(&mut self) -> bool {
        let got = {
            let CslState::DutyCycle(dc) = &mut self.state else {
                return false;
            };
            dc.waiting_for_payload_frames_shr = false;
            dc.got_payload_frames_shr
        };
        if !got {
            self.radio.off();
            let CslState::DutyCycle(dc) = &mut self.state else {
                return false;
            };
            error!("missed payload frame {}", dc.remaining_wake_up_frames);
            dc.last_burst_index = dc.last_burst_index.saturating_sub(1);
            dc.step = DutyCycleStep::Done;
            return true;
        }
        if let CslState::DutyCycle(dc) = &mut self.state {
            dc.step = DutyCycleStep::AwaitingPayloadFifop;
        }
        false
    }

    fn on_tx_window(&mut self, now: Ticks) -> bool {
        self.radio.on();
        self.timer = Some(now + cca_sleep_duration(&self.timing));
        if let CslState::Transmit(tx) = &mut self.state {
            tx.step = TransmitStep::AwaitingCca;
        }
        false
    }

    fn on_cca(&mut self, now: Ticks) -> bool {
        if self.radio.rssi() >= self.cfg.cca_threshold_dbm {
            self.radio.off();
            info!("collision");
            if let CslState::Transmit(tx) = &mut self.state {
                tx.result[0] = Some(TxStatus::Collision);
                tx.step = TransmitStep::Done;
            }
            return true;
        }
        self.radio.transmit_sequence();
        if let CslState::Transmit(tx) = &mut self.state {
            tx.step = TransmitStep::Streaming;
        }
        self.continue_streaming(now)
    }

    fn on_stream_append(&mut self, now: Ticks) -> bool {
        let prepared = {
            let CslState::Transmit(tx) = &mut self.state else {
                return false;
            };
            Self::prepare_next_wake_up_frames(
                &self.framer,
                tx,
                MAX_SEQUENCE_LEN - MIN_PREPARE_LEAD_OVER_LOOP as usize,
            )
        };
        {
            let CslState::Transmit(tx) = &self.state else {
                return false;
            };
            self.radio
                .append_to_sequence(&tx.next_wake_up_frames[..prepared]);
        }
        self.continue_streaming(now)
    }

    fn on_finish_sequence(&mut self, now: Ticks) -> bool {
        self.radio.finish_sequence();
        let is_broadcast = match &self.state {
            CslState::Transmit(tx) => tx.is_broadcast,
            _ => return false,
        };
        if is_broadcast {
            if let CslState::Transmit(tx) = &mut self.state {
                tx.result[tx.burst_index as usize] = Some(TxStatus::Ok);
            }
            return self.advance_burst(now);
        }
        self.arm_acknowledgement_window(now);
        false
    }

    fn on_acknowledgement_window(&mut self, now: Ticks) -> bool {
        let got = {
            let CslState::Transmit(tx) = &mut self.state else {
                return false;
            };
            tx.waiting_for_acknowledgement_shr = false;
            tx.got_acknowledgement_shr
        };
        if !got {
            self.radio.off();
            error!("received no acknowledgement");
            if let CslState::Transmit(tx) = &mut self.state {
                tx.result[tx.burst_index as usize] = Some(TxStatus::Noack);
                tx.step = TransmitStep::Done;
            }
            return true;
        }
        let parsed = {
            let mut ctx = link_ctx!(self, now);
            let CslState::Transmit(tx) = &mut self.state else {
                return false;
            };
            self.framer
                .parse_acknowledgement(&mut self.radio, &mut ctx, tx)
        };
        self.radio.off();
        let CslState::Transmit(tx) = &mut self.state else {
            return false;
        };
        if parsed.is_err() {
            tx.result[tx.burst_index as usize] = Some(TxStatus::Collision);
            tx.step = TransmitStep::Done;
            return true;
        }
        tx.result[tx.burst_index as usize] = Some(TxStatus::Ok);
        self.advance_burst(now)
    }

    /// Moves to the next frame of the burst, or ends the transmission.
    fn advance_burst(&mut self, _now: Ticks) -> bool {
        let (burst, done) = {
            let CslState::Transmit(tx) = &mut self.state else {
                return false;
            };
            tx.burst_index += 1;
            let done = tx.burst_index > tx.last_burst_index;
            if done {
                tx.step = TransmitStep::Done;
            }
            (tx.burst_index as usize, done)
        };
        if done {
            return true;
        }
        {
            let CslState::Transmit(tx) = &self.state else {
                return false;
            };
            let len = 1 + tx.payload_frame[burst][0] as usize;
            self.radio.prepare(&tx.payload_frame[burst][..len]);
            self.radio.transmit(!tx.is_broadcast);
        }
        let id = {
            let CslState::Transmit(tx) = &mut self.state else {
                return false;
            };
            tx.is_waiting_for_txdone = true;
            tx.step = TransmitStep::AwaitingBurstTxDone;
            tx.bf[burst]
        };
        if let Some(id) = id {
            if let Some(bf) = self.queue.get_mut(id) {
                bf.transmissions = bf.transmissions.saturating_add(1);
            }
        }
        false
    }

    /// Schedules the next rendezvous-time update, or the sequence finish.
    fn continue_streaming(&mut self, now: Ticks) -> bool {
        let timing = self.timing;
        let (next_update, exhausted) = {
            let CslState::Transmit(tx) = &mut self.state else {
                return false;
            };
            tx.next_rendezvous_time_update = tx.wake_up_sequence_start
                + timing.time_to_transmit(
                    timing.symbols_per_byte
                        * tx.wake_up_sequence_pos
                            .saturating_sub(MIN_PREPARE_LEAD_OVER_LOOP / 2),
                );
            (
                tx.next_rendezvous_time_update,
                tx.remaining_wake_up_frames == 0 && tx.remaining_payload_frame_bytes == 0,
            )
        };
        if exhausted {
            if let CslState::Transmit(tx) = &mut self.state {
                tx.step = TransmitStep::FinishingSequence;
            }
        }
        self.timer = Some(if next_update.has_timed_out(now) {
            now
        } else {
            next_update
        });
        false
    }

    /// Fills the staging buffer with patched wake-up frames and, once the
    /// countdown hits zero, the payload frame itself.
    fn prepare_next_wake_up_frames(
        framer: &V::Framer,
        tx: &mut TransmitState,
        space: usize,
    ) -> usize {
        let wuf_len = tx.wake_up_frame_len as usize;
        let shr_len = SHR.len();
        let number_of_wake_up_frames = (tx.remaining_wake_up_frames as usize).min(space / wuf_len);
        for i in 0..number_of_wake_up_frames {
            tx.remaining_wake_up_frames -= 1;
            let remaining = tx.remaining_wake_up_frames;
            let rendezvous_len = tx.rendezvous_time_len;
            let at = i * wuf_len + shr_len;
            framer.update_rendezvous_time(
                remaining,
                rendezvous_len,
                &mut tx.next_wake_up_frames[at..],
            );
        }
        let mut prepared = number_of_wake_up_frames * wuf_len;
        let mut space = space - prepared;
        tx.wake_up_sequence_pos += prepared as u32;

        // the first payload frame rides right behind the last wake-up
        // frame
        let phy_header_len = shr_len + 1;
        if tx.remaining_wake_up_frames == 0 && space >= phy_header_len {
            let TransmitState {
                payload_frame,
                next_wake_up_frames,
                wrote_payload_frames_phy_header,
                remaining_payload_frame_bytes,
                wake_up_sequence_pos,
                ..
            } = tx;
            if !*wrote_payload_frames_phy_header {
                next_wake_up_frames[prepared..prepared + shr_len].copy_from_slice(&SHR);
                prepared += shr_len;
                next_wake_up_frames[prepared] = payload_frame[0][0];
                prepared += 1;
                space -= phy_header_len;
                *wake_up_sequence_pos += phy_header_len as u32;
                *wrote_payload_frames_phy_header = true;
            }
            let bytes = space.min(*remaining_payload_frame_bytes as usize);
            let off = 1 + payload_frame[0][0] as usize - *remaining_payload_frame_bytes as usize;
            next_wake_up_frames[prepared..prepared + bytes]
                .copy_from_slice(&payload_frame[0][off..off + bytes]);
            *remaining_payload_frame_bytes -= bytes as u8;
            prepared += bytes;
            *wake_up_sequence_pos += bytes as u32;
        }
        prepared
    }

    fn start_duty_cycle(&mut self, now: Ticks) -> bool {
        self.can_skip = false;
        self.sent_once = false;
        if self.skipped {
            self.skipped = false;
            self.state = CslState::Idle;
            return true;
        }
        let channel = self.radio.channel();
        let skip_to_rendezvous = match &self.state {
            CslState::DutyCycle(dc) => dc.skip_to_rendezvous,
            _ => return false,
        };
        if !V::COMPLIANT && !skip_to_rendezvous && self.has_late_rendezvous_on_channel(now, channel)
        {
            // sampling another channel now could make us miss the cached
            // rendezvous
            if let CslState::DutyCycle(dc) = &mut self.state {
                dc.step = DutyCycleStep::Done;
            }
            return true;
        }

        if skip_to_rendezvous {
            // a cached late rendezvous: go straight to the payload wait
            let min_bytes = {
                let CslState::DutyCycle(dc) = &self.state else {
                    return false;
                };
                self.framer.min_bytes_for_filtering(dc)
            };
            self.radio.set_fifop_threshold(1 + min_bytes);
            self.radio.on();
            let timing = self.timing;
            let CslState::DutyCycle(dc) = &mut self.state else {
                return false;
            };
            dc.min_bytes_for_filtering = min_bytes;
            dc.waiting_for_payload_frames_shr = true;
            self.timer =
                Some(dc.rendezvous_time + timing.shr_time() + POSITIVE_RENDEZVOUS_TIME_ACCURACY);
            dc.step = DutyCycleStep::AwaitingPayloadShr;
            return false;
        }

        self.last_wake_up_time = self.duty_cycle_next;
        let clock = self.clock();
        self.wake_up_counter = clock.wake_up_counter_at(self.duty_cycle_next);
        self.wake_up_counter_last_increment = self.duty_cycle_next;
        if !V::COMPLIANT {
            let channel = Self::channel_for(&self.cfg, self.wake_up_counter, &self.node_addr);
            self.radio.set_channel(channel);
        }
        self.radio
            .set_fifop_threshold(1 + V::MIN_BYTES_FOR_PARSING_WAKE_UP_FRAMES);
        self.radio.on();
        let max_wuf_len = self.framer.wake_up_frame_body_len(&self.timing, Subtype::Normal) as u32
            + self.timing.phy_header_len;
        let timeout =
            now + self.timing.receive_calibration + scan_duration(&self.timing, max_wuf_len);
        if let CslState::DutyCycle(dc) = &mut self.state {
            dc.waiting_for_wake_up_frames_shr = true;
            dc.step = DutyCycleStep::Scanning;
        }
        self.timer = Some(timeout);
        false
    }

    /// The post-processing task: delivers received frames, runs AKES,
    /// launches transmissions, and schedules the next wake-up.
    pub fn post_process(&mut self, now: Ticks, client: &mut dyn MacClient) -> Result<(), Fatal> {
        enum DoneKind {
            Transmit,
            DutyCycle,
            Skipped,
            Nothing,
        }
        let done = match &self.state {
            CslState::Transmit(tx) if tx.step == TransmitStep::Done => DoneKind::Transmit,
            CslState::DutyCycle(dc) if dc.step == DutyCycleStep::Done => DoneKind::DutyCycle,
            // a queued frame canceled the pending wake-up (skip-to-send)
            CslState::DutyCycle(dc)
                if dc.step == DutyCycleStep::PendingStart && self.skipped =>
            {
                DoneKind::Skipped
            }
            CslState::Idle => DoneKind::Nothing,
            // a machine is mid-flight; nothing to do yet
            _ => return Ok(()),
        };
        match done {
            DoneKind::Transmit => {
                let CslState::Transmit(tx) = mem::replace(&mut self.state, CslState::Idle) else {
                    return Ok(());
                };
                self.on_transmitted(tx, now, client);
            }
            DoneKind::DutyCycle => {
                let CslState::DutyCycle(dc) = mem::replace(&mut self.state, CslState::Idle) else {
                    return Ok(());
                };
                self.deliver(dc, now, client)?;
            }
            DoneKind::Skipped => {
                self.skipped = false;
                self.state = CslState::Idle;
            }
            DoneKind::Nothing => {}
        }

        self.akes_poll(now)?;

        if matches!(self.state, CslState::Idle) {
            self.try_launch_transmission(now, client)?;
        }
        if matches!(self.state, CslState::Idle) {
            self.schedule_next_duty_cycle(now);
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        mut dc: DutyCycleState,
        now: Ticks,
        client: &mut dyn MacClient,
    ) -> Result<(), Fatal> {
        if !dc.received_frame {
            return Ok(());
        }
        for i in 0..=dc.last_burst_index as usize {
            let mut pkt = mem::take(&mut dc.packets[i]);
            self.akes_input(&mut pkt, now, client)?;
        }
        Ok(())
    }

    fn try_launch_transmission(
        &mut self,
        now: Ticks,
        client: &mut dyn MacClient,
    ) -> Result<(), Fatal> {
        loop {
            let Some(id) = self.queue.select_next(now) else {
                return Ok(());
            };
            match self.setup_transmission(id, now)? {
                Launch::Started => return Ok(()),
                Launch::Deferred => return Ok(()),
                Launch::Failed(status) => {
                    let mut tx = TransmitState::default();
                    tx.bf[0] = Some(id);
                    tx.result[0] = Some(status);
                    if let Some(bf) = self.queue.get(id) {
                        tx.receiver = bf.packet.receiver;
                        tx.is_broadcast = bf.packet.holds_broadcast();
                    }
                    self.on_transmitted(tx, now, client);
                    if self.queue.get(id).is_some() {
                        // kept for retry; try again at the next pass
                        return Ok(());
                    }
                }
            }
        }
    }

    fn setup_transmission(&mut self, id: FrameId, now: Ticks) -> Result<Launch, Fatal> {
        let pkt0 = match self.queue.get(id) {
            Some(bf) => bf.packet.clone(),
            None => return Ok(Launch::Deferred),
        };
        let mut tx = TransmitState::default();
        tx.bf[0] = Some(id);
        tx.is_broadcast = pkt0.holds_broadcast();
        tx.receiver = pkt0.receiver;
        tx.subtype = if V::COMPLIANT {
            Subtype::Normal
        } else if akes::is_hello_cmd(&pkt0) {
            Subtype::Hello
        } else if akes::is_helloack_cmd(&pkt0) {
            Subtype::Helloack
        } else if akes::is_ack_cmd(&pkt0) {
            Subtype::Ack
        } else {
            Subtype::Normal
        };
        tx.wake_up_frame_len = self.framer.wake_up_frame_body_len(&self.timing, tx.subtype)
            + self.timing.phy_header_len as u8;

        {
            let mut ctx = link_ctx!(self, now);
            if self
                .synchronizer
                .schedule(&mut ctx, &mut tx, &pkt0)
                .is_err()
            {
                error!("synchronizer.schedule failed");
                return Ok(Launch::Failed(TxStatus::ErrFatal));
            }
        }

        let payload_exchange = self.timing.us_to_ticks(PAYLOAD_EXCHANGE_US);
        let end_of_transmission = tx.payload_frame_start + payload_exchange;
        let next_wake_up = self.timebase.shift_to_future(self.duty_cycle_next, now);
        if self.sent_once && !end_of_transmission.is_at_or_before(next_wake_up) {
            // do not skip over the next wake-up
            return Ok(Launch::Deferred);
        }

        let mut nearest = None;
        if !V::COMPLIANT {
            let channel = if tx.subtype == Subtype::Hello {
                let shr_end = tx.payload_frames_shr_end(&self.timing);
                Self::channel_for(
                    &self.cfg,
                    self.clock().wake_up_counter_at(shr_end),
                    &self.node_addr,
                )
            } else {
                Self::channel_for(&self.cfg, tx.receivers_wake_up_counter, &tx.receiver)
            };
            self.radio.set_channel(channel);

            nearest = self.nearest_late_rendezvous(now);
            let conflict = self.has_late_rendezvous_on_channel(now, channel)
                || (nearest.is_some() && tx.subtype == Subtype::Hello)
                || nearest.is_some_and(|lr| !end_of_transmission.is_at_or_before(lr.time));
            if conflict {
                if tx.subtype == Subtype::Hello {
                    let delay = crate::framer::potr::hello_wake_up_sequence_tx_time(
                        &self.cfg,
                        &self.timing,
                        self.timebase.interval(),
                    );
                    if let Some(bf) = self.queue.get_mut(id) {
                        bf.next_attempt = now + delay;
                    }
                } else {
                    self.queue
                        .delay_all_to(&tx.receiver, now + self.timebase.interval());
                }
                return Ok(Launch::Deferred);
            }
        }

        {
            let mut ctx = link_ctx!(self, now);
            if self
                .framer
                .prepare_acknowledgement_parsing(&mut ctx, &mut tx, &pkt0)
                .is_err()
            {
                error!("prepare_acknowledgement_parsing failed");
                return Ok(Launch::Failed(TxStatus::ErrFatal));
            }
        }

        // pick up more frames towards the same receiver to burst
        if tx.subtype == Subtype::Normal {
            while (tx.last_burst_index as usize) < MAX_BURST_INDEX {
                let end =
                    tx.payload_frame_start + (tx.last_burst_index as u32 + 2) * payload_exchange;
                if nearest.is_some_and(|lr| !end.is_at_or_before(lr.time)) {
                    break;
                }
                if self.sent_once && !end.is_at_or_before(next_wake_up) {
                    break;
                }
                let Some(last) = tx.bf[tx.last_burst_index as usize] else {
                    break;
                };
                let Some(next) = self.queue.select_next_burst(last, now) else {
                    break;
                };
                tx.last_burst_index += 1;
                tx.bf[tx.last_burst_index as usize] = Some(next);
            }
        }

        // create payload frames bottom-up: each header carries the length
        // of the frame that follows it
        let mut i = tx.last_burst_index as usize;
        loop {
            let Some(frame_id) = tx.bf[i] else {
                return Ok(Launch::Failed(TxStatus::ErrFatal));
            };
            let mut pkt = match self.queue.get(frame_id) {
                Some(bf) => bf.packet.clone(),
                None => return Ok(Launch::Failed(TxStatus::ErrFatal)),
            };
            pkt.burst_index = i as u8;
            pkt.pending = if i < MAX_BURST_INDEX && tx.bf[i + 1].is_some() {
                tx.payload_frame[i + 1][0]
            } else {
                0
            };
            let created = {
                let mut ctx = link_ctx!(self, now);
                self.strategy
                    .before_create(&mut ctx, &tx, &mut pkt)
                    .and_then(|()| {
                        self.framer
                            .create_payload_header(&mut ctx, &mut pkt, tx.subtype)
                            .map(|_| ())
                    })
                    .and_then(|()| self.strategy.secure(&mut ctx, &tx, &mut pkt))
            };
            if created.is_err() {
                error!("payload frame creation failed");
                return Ok(Launch::Failed(TxStatus::ErrFatal));
            }
            let frame = pkt.frame();
            tx.payload_frame[i][0] = frame.len() as u8;
            tx.payload_frame[i][1..1 + frame.len()].copy_from_slice(frame);
            if i == 0 {
                break;
            }
            i -= 1;
        }
        tx.remaining_payload_frame_bytes = tx.payload_frame[0][0];

        // template wake-up frame, replicated across the sequence buffer
        let mut template = [0u8; MAX_ACK_LEN];
        let wuf_len = tx.wake_up_frame_len as usize;
        template[..SHR.len()].copy_from_slice(&SHR);
        {
            let mut ctx = link_ctx!(self, now);
            if self
                .framer
                .create_wake_up_frame(&mut ctx, &mut tx, &mut template[SHR.len()..])
                .is_err()
            {
                error!("wake-up frame creation failed");
                return Ok(Launch::Failed(TxStatus::ErrFatal));
            }
        }
        let mut at = 0;
        while at + wuf_len <= MAX_SEQUENCE_LEN {
            tx.next_wake_up_frames[at..at + wuf_len].copy_from_slice(&template[..wuf_len]);
            at += wuf_len;
        }
        let prepared = Self::prepare_next_wake_up_frames(&self.framer, &mut tx, MAX_SEQUENCE_LEN);
        self.radio
            .prepare_sequence(&tx.next_wake_up_frames[..prepared]);

        let start = tx.wake_up_sequence_start - wake_up_sequence_guard_time(&self.timing);
        if start.has_timed_out(now) {
            error!("transmission is not schedulable");
            return Ok(Launch::Failed(TxStatus::Err));
        }
        if let Some(bf) = self.queue.get_mut(id) {
            bf.transmissions = bf.transmissions.saturating_add(1);
        }
        tx.step = TransmitStep::AwaitingTxWindow;
        self.timer = Some(start);
        self.state = CslState::Transmit(tx);
        Ok(Launch::Started)
    }

    /// Classifies each frame of the finished burst, applies back-off, and
    /// dispatches completion callbacks.
    fn on_transmitted(&mut self, tx: TransmitState, now: Ticks, client: &mut dyn MacClient) {
        self.sent_once = true;
        let mut i = 0usize;
        loop {
            let Some(id) = tx.bf[i] else {
                break;
            };
            let Some(pkt) = self.queue.get(id).map(|bf| bf.packet.clone()) else {
                break;
            };
            if i == 0 && !tx.is_broadcast {
                let mut ctx = link_ctx!(self, now);
                self.framer.on_unicast_transmitted(&mut ctx, &tx, &pkt);
                self.synchronizer.on_unicast_transmitted(&mut ctx, &tx, &pkt);
            }
            let result = tx.result[i].unwrap_or(TxStatus::ErrFatal);
            let (transmissions, max_transmissions) = match self.queue.get(id) {
                Some(bf) => (bf.transmissions, bf.packet.max_transmissions),
                None => break,
            };
            let retry = matches!(result, TxStatus::Collision | TxStatus::Noack | TxStatus::Err)
                && transmissions < max_transmissions;
            if retry {
                let exponent = (transmissions + MIN_BACK_OFF_EXPONENT).min(MAX_BACK_OFF_EXPONENT);
                let periods = ((1u32 << exponent) - 1) & self.rng.next_u32();
                let next_attempt = now + self.timebase.interval() * periods;
                self.queue.delay_all_to(&pkt.receiver, next_attempt);
            } else {
                let action = self
                    .queue
                    .remove(id)
                    .map(|bf| bf.action)
                    .unwrap_or(SentAction::None);
                match action {
                    SentAction::Upper(token) => client.sent(token, result, transmissions),
                    SentAction::AkesHello => self.akes_on_hello_sent(now),
                    SentAction::AkesHelloack => self.akes_on_helloack_sent(&pkt.receiver, result),
                    SentAction::AkesAck { is_new } => {
                        self.akes_on_ack_sent(&pkt.receiver, result, is_new, now)
                    }
                    SentAction::AkesUpdate => self.akes_on_update_sent(&pkt.receiver, now),
                    SentAction::Broadcast { ob } => {
                        self.broadcast_leg_done(ob, result, transmissions, now, client)
                    }
                    SentAction::None => {}
                }
            }
            if result != TxStatus::Ok {
                break;
            }
            i += 1;
            if i > tx.last_burst_index as usize {
                break;
            }
        }
    }

    fn schedule_next_duty_cycle(&mut self, now: Ticks) {
        self.duty_cycle_next = self.timebase.shift_to_future(self.duty_cycle_next, now);
        let late_guard = self.timing.us_to_ticks(LATE_WAKE_UP_GUARD_US);
        let mut pending_late_rendezvous = false;
        loop {
            let mut dc = DutyCycleState::default();
            let lr = if V::COMPLIANT {
                None
            } else {
                self.nearest_late_rendezvous(now)
            };
            pending_late_rendezvous = lr.is_some();
            match lr {
                Some(lr) if !(self.duty_cycle_next + late_guard).is_at_or_before(lr.time) => {
                    // the cached rendezvous comes before our own wake-up
                    dc.rendezvous_time = lr.time;
                    dc.got_rendezvous_time = true;
                    dc.subtype = lr.subtype;
                    dc.skip_to_rendezvous = true;
                    let target = lr.time
                        - rendezvous_guard_time(&self.timing)
                        - (LPM_DEEP_SWITCHING - LPM_SWITCHING);
                    self.late_rendezvous.retain(|c| c.time != lr.time);
                    if target.has_timed_out(now) {
                        error!("missed late rendezvous");
                        continue;
                    }
                    self.radio.set_channel(lr.channel);
                    self.timer = Some(target);
                    self.state = CslState::DutyCycle(dc);
                }
                _ => {
                    let target = self.duty_cycle_next - LPM_DEEP_SWITCHING;
                    if target.has_timed_out(now) {
                        self.duty_cycle_next += self.timebase.interval();
                        continue;
                    }
                    self.timer = Some(target);
                    self.state = CslState::DutyCycle(dc);
                }
            }
            break;
        }
        self.can_skip = !pending_late_rendezvous;
        self.skipped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockRadio, SeqRng, SingleSecret};

    type Mac = CslMac<MockRadio, SingleSecret, SeqRng, Potr>;

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

    #[test]
    fn channel_hash_mixes_counter_and_address() {
        let cfg = Config::default();
        let addr = LinkAddr([0x02; 8]); // even byte count, xor of address is 0
        for wuc in 0..32u32 {
            let channel = Mac::channel_for(&cfg, WakeUpCounter(wuc), &addr);
            assert_eq!(channel, cfg.channels[(wuc as usize) & 15]);
        }
        // a different address lands elsewhere for the same counter
        let other = LinkAddr([1, 0, 0, 0, 0, 0, 0, 0]);
        assert_ne!(
            Mac::channel_for(&cfg, WakeUpCounter(0), &other),
            Mac::channel_for(&cfg, WakeUpCounter(0), &addr),
        );
    }

    #[test]
    fn a_fresh_node_schedules_its_first_wake_up() {
        let mac = node(1);
        let deadline = mac.next_timeout().expect("no wake-up scheduled");
        assert!(deadline.diff(Ticks(0)) > 0);
        assert!(deadline.diff(Ticks(0)) <= 4096);
    }

    #[test]
    fn send_without_neighbors_is_refused() {
        let mut mac = node(1);
        let err = mac
            .send(b"payload", LinkAddr::NULL, PacketToken(1), Ticks(0))
            .unwrap_err();
        assert_eq!(err, SendError::NoNeighbors);
        let err = mac
            .send(b"payload", LinkAddr([9; 8]), PacketToken(2), Ticks(0))
            .unwrap_err();
        assert_eq!(err, SendError::NoNeighbors);
    }

    #[test]
    fn max_payload_leaves_room_for_header_and_mic() {
        // type byte, sequence number, pending length, MIC
        let mac = node(1);
        assert_eq!(mac.max_payload(), MAX_FRAME_LEN - 3 - MIC_LEN);
    }

    #[test]
    fn back_off_delays_every_frame_to_the_receiver() {
        let mut mac = node(1);
        let b_addr = LinkAddr([2; 8]);
        let handle = mac.nbr.new_nbr(b_addr, NbrStatus::Permanent).unwrap();
        let _ = handle;
        mac.send(b"one", b_addr, PacketToken(1), Ticks(0)).unwrap();
        mac.send(b"two", b_addr, PacketToken(2), Ticks(0)).unwrap();

        let id = mac.queue.select_next(Ticks(0)).unwrap();
        let mut tx = TransmitState::default();
        tx.bf[0] = Some(id);
        tx.result[0] = Some(TxStatus::Noack);
        tx.receiver = b_addr;
        tx.is_broadcast = false;
        struct Sink;
        impl crate::MacClient for Sink {
            fn input(&mut self, _packet: &Packet) {}
            fn sent(&mut self, _t: crate::PacketToken, _s: TxStatus, _n: u8) {}
        }
        mac.on_transmitted(tx, Ticks(0), &mut Sink);

        // both frames towards the receiver share the delayed next attempt
        let first = mac.queue.get(id).expect("frame was dropped").next_attempt;
        for other in [id.wrapping_add(1)] {
            if let Some(bf) = mac.queue.get(other) {
                assert_eq!(bf.next_attempt, first);
            }
        }
    }
}
