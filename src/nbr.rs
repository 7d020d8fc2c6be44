//! The neighbor table.
//!
//! Neighbors live in a fixed pool of index-stable slots; the slot index is
//! what peers exchange on the wire (one byte, table capacity is capped at
//! 32). A neighbor is either *tentative* (mid-handshake) or *permanent*
//! (session established). Promotion rewrites the slot in place so the
//! index peers learned stays valid.
//!
//! Handles carry a generation besides the index, so a handle (or a wire
//! index checked against the current generation) held across a deletion is
//! detected as stale instead of silently addressing a reused slot.
//!
//! Tentative neighbors additionally own an entry in a small metadata arena
//! (wait deadline and handshake flags); keeping it parallel to the slot
//! pool avoids any reference cycle between neighbor and timer state.

use crate::anti_replay::AntiReplayInfo;
use crate::config::{NBR_MAX, NBR_MAX_TENTATIVES};
use crate::security::KEY_LEN;
use crate::time::Ticks;
use crate::LinkAddr;

pub const CHALLENGE_LEN: usize = 8;

/// How many bytes of the last HELLOACK challenge a permanent neighbor
/// caches to recognize replays of that HELLOACK.
pub const CACHED_HELLOACK_CHALLENGE_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbrStatus {
    Permanent,
    Tentative,
}

/// Session state of a permanent neighbor.
#[derive(Debug, Clone, Default)]
pub struct Permanent {
    pub pairwise_key: [u8; KEY_LEN],
    pub group_key: [u8; KEY_LEN],
    /// The index our neighbor uses for us in *its* table.
    pub foreign_index: u8,
    pub sent_authentic_hello: bool,
    pub is_receiving_update: bool,
    pub my_unicast_seqno: u8,
    pub his_unicast_seqno: u8,
    pub helloack_challenge: [u8; CACHED_HELLOACK_CHALLENGE_LEN],
}

/// What a tentative neighbor holds depends on which side of the handshake
/// we are on: the responder stores the HELLO challenge until its HELLOACK
/// goes out, the initiator stores the derived-but-unconfirmed key.
#[derive(Debug, Clone)]
pub enum TentativeSecret {
    Challenge([u8; CHALLENGE_LEN]),
    PairwiseKey([u8; KEY_LEN]),
}

#[derive(Debug, Clone)]
pub struct Tentative {
    pub secret: TentativeSecret,
    pub meta: u8,
}

#[derive(Debug, Clone)]
pub enum NbrState {
    Tentative(Tentative),
    Permanent(Permanent),
}

#[derive(Debug, Clone)]
pub struct Nbr {
    pub addr: LinkAddr,
    pub anti_replay: AntiReplayInfo,
    pub expiration_time_s: u32,
    pub state: NbrState,
}

impl Nbr {
    pub fn status(&self) -> NbrStatus {
        match self.state {
            NbrState::Tentative(_) => NbrStatus::Tentative,
            NbrState::Permanent(_) => NbrStatus::Permanent,
        }
    }

    pub fn permanent(&self) -> Option<&Permanent> {
        match &self.state {
            NbrState::Permanent(p) => Some(p),
            _ => None,
        }
    }

    pub fn permanent_mut(&mut self) -> Option<&mut Permanent> {
        match &mut self.state {
            NbrState::Permanent(p) => Some(p),
            _ => None,
        }
    }

    pub fn tentative(&self) -> Option<&Tentative> {
        match &self.state {
            NbrState::Tentative(t) => Some(t),
            _ => None,
        }
    }

    pub fn tentative_mut(&mut self) -> Option<&mut Tentative> {
        match &mut self.state {
            NbrState::Tentative(t) => Some(t),
            _ => None,
        }
    }

    /// The key this neighbor's unicasts are secured with, regardless of
    /// handshake stage.
    pub fn pairwise_key(&self) -> &[u8; KEY_LEN] {
        match &self.state {
            NbrState::Permanent(p) => &p.pairwise_key,
            NbrState::Tentative(t) => match &t.secret {
                TentativeSecret::PairwiseKey(k) => k,
                // a challenge is never used as a key; the zero block is a
                // placeholder that fails verification
                TentativeSecret::Challenge(_) => &ZERO_KEY,
            },
        }
    }
}

static ZERO_KEY: [u8; KEY_LEN] = [0; KEY_LEN];

/// Scheduling state of a responder-side (or ACK-awaiting) tentative.
#[derive(Debug, Clone, Default)]
pub struct TentativeMeta {
    /// `Some` while the randomly delayed HELLOACK is still pending.
    pub helloack_wait: Option<Ticks>,
    /// Distinguishes a responder tentative (waits to send HELLOACK) from
    /// an initiator tentative (awaits acknowledgement of its ACK).
    pub has_wait_timer: bool,
    pub was_helloack_sent: bool,
}

/// A generation-checked reference to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbrHandle {
    index: u8,
    generation: u8,
}

impl NbrHandle {
    pub fn index(&self) -> u8 {
        self.index
    }
}

/// The two slots an address may occupy. Both are present only in the short
/// window between receiving the handshake ACK and tentative cleanup.
#[derive(Debug, Clone, Copy, Default)]
pub struct Entry {
    pub permanent: Option<NbrHandle>,
    pub tentative: Option<NbrHandle>,
}

impl Entry {
    pub fn of(&self, status: NbrStatus) -> Option<NbrHandle> {
        match status {
            NbrStatus::Permanent => self.permanent,
            NbrStatus::Tentative => self.tentative,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u8,
    nbr: Option<Nbr>,
}

pub struct NbrTable {
    slots: [Slot; NBR_MAX],
    metas: [Option<TentativeMeta>; NBR_MAX_TENTATIVES],
}

impl Default for NbrTable {
    fn default() -> Self {
        NbrTable::new()
    }
}

impl NbrTable {
    pub fn new() -> NbrTable {
        NbrTable {
            slots: core::array::from_fn(|_| Slot::default()),
            metas: core::array::from_fn(|_| None),
        }
    }

    pub fn entry_of(&self, addr: &LinkAddr) -> Entry {
        let mut entry = Entry::default();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(nbr) = &slot.nbr {
                if nbr.addr == *addr {
                    let handle = NbrHandle {
                        index: i as u8,
                        generation: slot.generation,
                    };
                    match nbr.status() {
                        NbrStatus::Permanent => entry.permanent = Some(handle),
                        NbrStatus::Tentative => entry.tentative = Some(handle),
                    }
                }
            }
        }
        entry
    }

    pub fn get(&self, handle: NbrHandle) -> Option<&Nbr> {
        let slot = &self.slots[handle.index as usize];
        if slot.generation != handle.generation {
            return None;
        }
        slot.nbr.as_ref()
    }

    pub fn get_mut(&mut self, handle: NbrHandle) -> Option<&mut Nbr> {
        let slot = &mut self.slots[handle.index as usize];
        if slot.generation != handle.generation {
            return None;
        }
        slot.nbr.as_mut()
    }

    /// Resolves a wire index to a handle, if the slot is live.
    pub fn by_index(&self, index: u8) -> Option<NbrHandle> {
        let slot = self.slots.get(index as usize)?;
        slot.nbr.as_ref()?;
        Some(NbrHandle {
            index,
            generation: slot.generation,
        })
    }

    pub fn count(&self, status: NbrStatus) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.nbr.as_ref())
            .filter(|n| n.status() == status)
            .count()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.nbr.is_none()).count()
    }

    /// Live handles, collected so callers can mutate while iterating.
    pub fn handles(&self) -> heapless::Vec<NbrHandle, NBR_MAX> {
        let mut out = heapless::Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.nbr.is_some() {
                // capacity equals the slot count
                let _ = out.push(NbrHandle {
                    index: i as u8,
                    generation: slot.generation,
                });
            }
        }
        out
    }

    /// Allocates a slot (and, for tentatives, a metadata entry). Callers
    /// enforce the policy checks (free slots, tentative cap, rate limits).
    pub fn new_nbr(&mut self, addr: LinkAddr, status: NbrStatus) -> Option<NbrHandle> {
        let state = match status {
            NbrStatus::Permanent => NbrState::Permanent(Permanent::default()),
            NbrStatus::Tentative => {
                if self.count(NbrStatus::Tentative) >= NBR_MAX_TENTATIVES {
                    return None;
                }
                let meta = self.metas.iter().position(|m| m.is_none())?;
                self.metas[meta] = Some(TentativeMeta::default());
                NbrState::Tentative(Tentative {
                    secret: TentativeSecret::Challenge([0; CHALLENGE_LEN]),
                    meta: meta as u8,
                })
            }
        };
        let index = self.slots.iter().position(|s| s.nbr.is_none())?;
        self.slots[index].nbr = Some(Nbr {
            addr,
            anti_replay: AntiReplayInfo::default(),
            expiration_time_s: 0,
            state,
        });
        Some(NbrHandle {
            index: index as u8,
            generation: self.slots[index].generation,
        })
    }

    pub fn delete(&mut self, handle: NbrHandle) {
        let slot = &mut self.slots[handle.index as usize];
        if slot.generation != handle.generation {
            return;
        }
        if let Some(nbr) = slot.nbr.take() {
            if let NbrState::Tentative(t) = nbr.state {
                self.metas[t.meta as usize] = None;
            }
        }
        slot.generation = slot.generation.wrapping_add(1);
    }

    /// Turns a tentative slot into a permanent one in place; the index
    /// stays stable for peers that learned it. The tentative must already
    /// hold a derived pairwise key.
    pub fn promote(&mut self, handle: NbrHandle) -> bool {
        let slot = &mut self.slots[handle.index as usize];
        if slot.generation != handle.generation {
            return false;
        }
        let Some(nbr) = slot.nbr.as_mut() else {
            return false;
        };
        let (key, meta_index) = match &nbr.state {
            NbrState::Tentative(t) => match &t.secret {
                TentativeSecret::PairwiseKey(k) => (*k, t.meta as usize),
                TentativeSecret::Challenge(_) => return false,
            },
            NbrState::Permanent(_) => return false,
        };
        self.metas[meta_index] = None;
        nbr.state = NbrState::Permanent(Permanent {
            pairwise_key: key,
            ..Permanent::default()
        });
        true
    }

    pub fn meta(&self, nbr: &Nbr) -> Option<&TentativeMeta> {
        let t = nbr.tentative()?;
        self.metas[t.meta as usize].as_ref()
    }

    pub fn meta_mut_of(&mut self, handle: NbrHandle) -> Option<&mut TentativeMeta> {
        let slot = &self.slots[handle.index as usize];
        if slot.generation != handle.generation {
            return None;
        }
        let meta = slot.nbr.as_ref()?.tentative()?.meta as usize;
        self.metas[meta].as_mut()
    }

    /// Index of the tentative metadata entry, for parallel CSL state.
    pub fn meta_index_of(&self, handle: NbrHandle) -> Option<u8> {
        Some(self.get(handle)?.tentative()?.meta)
    }

    /// Highest live permanent index, for sizing HELLO MIC lists.
    pub fn max_permanent_index(&self) -> Option<u8> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.nbr.as_ref().is_some_and(|n| n.permanent().is_some()))
            .map(|(i, _)| i as u8)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> LinkAddr {
        LinkAddr([b; 8])
    }

    #[test]
    fn promotion_keeps_the_index_stable() {
        let mut table = NbrTable::new();
        let h = table.new_nbr(addr(1), NbrStatus::Tentative).unwrap();
        table.get_mut(h).unwrap().tentative_mut().unwrap().secret =
            TentativeSecret::PairwiseKey([9; 16]);
        let index = h.index();
        assert!(table.promote(h));
        let h2 = table.by_index(index).unwrap();
        assert_eq!(h2.index(), index);
        let nbr = table.get(h2).unwrap();
        assert_eq!(nbr.permanent().unwrap().pairwise_key, [9; 16]);
        // the metadata entry was released
        assert_eq!(table.count(NbrStatus::Tentative), 0);
    }

    #[test]
    fn stale_handles_are_detected() {
        let mut table = NbrTable::new();
        let h = table.new_nbr(addr(1), NbrStatus::Permanent).unwrap();
        table.delete(h);
        assert!(table.get(h).is_none());
        let h2 = table.new_nbr(addr(2), NbrStatus::Permanent).unwrap();
        assert_eq!(h2.index(), h.index());
        assert!(table.get(h).is_none());
        assert!(table.get(h2).is_some());
    }

    #[test]
    fn tentative_cap_is_enforced() {
        let mut table = NbrTable::new();
        for i in 0..NBR_MAX_TENTATIVES {
            assert!(table.new_nbr(addr(i as u8), NbrStatus::Tentative).is_some());
        }
        assert!(table.new_nbr(addr(99), NbrStatus::Tentative).is_none());
        assert!(table.new_nbr(addr(99), NbrStatus::Permanent).is_some());
    }

    #[test]
    fn permanent_and_tentative_may_coexist() {
        let mut table = NbrTable::new();
        let p = table.new_nbr(addr(1), NbrStatus::Permanent).unwrap();
        let t = table.new_nbr(addr(1), NbrStatus::Tentative).unwrap();
        let entry = table.entry_of(&addr(1));
        assert_eq!(entry.permanent, Some(p));
        assert_eq!(entry.tentative, Some(t));
    }
}
