//! The outgoing frame queue.
//!
//! Frames keep their insertion order. A frame enqueued towards a receiver
//! that already has frames waiting inherits their `next_attempt`, so
//! back-off applied to one frame never lets a later frame overtake it.

use heapless::Vec;
use log::{error, info};

use crate::config::QUEUE_CAP;
use crate::packet::Packet;
use crate::time::Ticks;
use crate::{LinkAddr, PacketToken};

/// Identifies a queued frame across reorderings of the backing storage.
pub type FrameId = u16;

/// Who to tell about the fate of a queued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentAction {
    /// Report to the upper layer with this token.
    Upper(PacketToken),
    /// AKES sent this HELLO broadcast.
    AkesHello,
    /// AKES sent this HELLOACK.
    AkesHelloack,
    /// AKES sent this handshake ACK; `is_new` marks a first-time neighbor.
    AkesAck { is_new: bool },
    /// AKES sent this UPDATE.
    AkesUpdate,
    /// One leg of a fanned-out broadcast.
    Broadcast { ob: u8 },
    /// Nobody; drop silently.
    None,
}

pub struct BufferedFrame {
    pub id: FrameId,
    pub packet: Packet,
    pub action: SentAction,
    pub transmissions: u8,
    pub next_attempt: Ticks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

#[derive(Default)]
pub struct FrameQueue {
    frames: Vec<BufferedFrame, QUEUE_CAP>,
    next_id: FrameId,
}

impl FrameQueue {
    pub fn new() -> FrameQueue {
        FrameQueue {
            frames: Vec::new(),
            next_id: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn enqueue(
        &mut self,
        packet: Packet,
        action: SentAction,
        now: Ticks,
    ) -> Result<FrameId, QueueFull> {
        let mut next_attempt = now;
        // do not send earlier than other frames for that receiver
        for frame in &self.frames {
            if frame.packet.receiver == packet.receiver {
                next_attempt = frame.next_attempt;
                break;
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.frames
            .push(BufferedFrame {
                id,
                packet,
                action,
                transmissions: 0,
                next_attempt,
            })
            .map_err(|_| {
                error!("buffer is full");
                QueueFull
            })?;
        Ok(id)
    }

    pub fn get(&self, id: FrameId) -> Option<&BufferedFrame> {
        self.frames.iter().find(|f| f.id == id)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut BufferedFrame> {
        self.frames.iter_mut().find(|f| f.id == id)
    }

    pub fn remove(&mut self, id: FrameId) -> Option<BufferedFrame> {
        let at = self.frames.iter().position(|f| f.id == id)?;
        // Vec::remove keeps the insertion order of the rest
        Some(self.frames.remove(at))
    }

    /// First frame whose next attempt is due.
    pub fn select_next(&self, now: Ticks) -> Option<FrameId> {
        for frame in &self.frames {
            if frame.next_attempt.is_at_or_before(now) {
                if frame.transmissions > 0 {
                    info!("retransmission {}", frame.transmissions);
                }
                return Some(frame.id);
            }
        }
        None
    }

    /// The next frame to the same receiver as `after`, provided it is due;
    /// used to extend a burst.
    pub fn select_next_burst(&self, after: FrameId, now: Ticks) -> Option<FrameId> {
        let at = self.frames.iter().position(|f| f.id == after)?;
        let receiver = self.frames[at].packet.receiver;
        for frame in &self.frames[at + 1..] {
            if frame.packet.receiver == receiver {
                return frame.next_attempt.is_at_or_before(now).then_some(frame.id);
            }
        }
        None
    }

    /// Delays every frame towards `receiver`, e.g. after a collision.
    pub fn delay_all_to(&mut self, receiver: &LinkAddr, next_attempt: Ticks) {
        for frame in &mut self.frames {
            if frame.packet.receiver == *receiver {
                frame.next_attempt = next_attempt;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_to(receiver: LinkAddr) -> Packet {
        let mut p = Packet::new();
        p.receiver = receiver;
        p
    }

    #[test]
    fn per_receiver_ordering_survives_backoff() {
        let mut q = FrameQueue::new();
        let b = LinkAddr([2; 8]);
        let now = Ticks(0);
        let first = q.enqueue(packet_to(b), SentAction::None, now).unwrap();
        q.delay_all_to(&b, Ticks(5000));
        // a frame enqueued afterwards inherits the back-off
        let second = q.enqueue(packet_to(b), SentAction::None, now).unwrap();
        assert_eq!(q.select_next(Ticks(0)), None);
        assert_eq!(q.select_next(Ticks(5000)), Some(first));
        assert_eq!(q.get(second).unwrap().next_attempt, Ticks(5000));
    }

    #[test]
    fn burst_selection_takes_same_receiver_in_order() {
        let mut q = FrameQueue::new();
        let b = LinkAddr([2; 8]);
        let c = LinkAddr([3; 8]);
        let now = Ticks(0);
        let f1 = q.enqueue(packet_to(b), SentAction::None, now).unwrap();
        let _other = q.enqueue(packet_to(c), SentAction::None, now).unwrap();
        let f2 = q.enqueue(packet_to(b), SentAction::None, now).unwrap();
        assert_eq!(q.select_next_burst(f1, now), Some(f2));
        assert_eq!(q.select_next_burst(f2, now), None);
    }

    #[test]
    fn delayed_burst_candidates_are_skipped() {
        let mut q = FrameQueue::new();
        let b = LinkAddr([2; 8]);
        let now = Ticks(0);
        let f1 = q.enqueue(packet_to(b), SentAction::None, now).unwrap();
        let f2 = q.enqueue(packet_to(b), SentAction::None, now).unwrap();
        q.get_mut(f2).unwrap().next_attempt = Ticks(100);
        assert_eq!(q.select_next_burst(f1, Ticks(0)), None);
        assert_eq!(q.select_next_burst(f1, Ticks(100)), Some(f2));
    }
}
