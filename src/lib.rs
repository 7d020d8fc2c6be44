//! Secure Coordinated Sampled Listening (CSL) for IEEE 802.15.4 radios.
//!
//! Supports `no_std`.
//!
//! CSL is a low-power MAC: receivers sample the channel briefly once per
//! wake-up interval (default 125 ms), and a sender precedes each payload
//! frame with a back-to-back sequence of wake-up frames so that whichever
//! one the receiver catches tells it exactly when the payload starts (the
//! rendezvous time). On top of that, AKES (Adaptive Key Establishment
//! Scheme) bootstraps pairwise AES-128 session keys between one-hop
//! neighbors through a HELLO / HELLOACK / ACK exchange.
//!
//! Two wire formats are provided and selected at construction time:
//!
//!  - the standards-compliant format: IEEE 802.15.4-2015 multipurpose
//!    wake-up frames, data frames with an auxiliary security header, and
//!    enhanced acknowledgements carrying a CSL information element;
//!  - the POTR format ("practical on-the-fly rejection"): compressed
//!    frames whose wake-up frames embed a one-time password, letting a
//!    receiver drop spoofed wake-up sequences before committing energy.
//!
//! The crate is sans-IO. Platform code implements [`radio::Radio`], routes
//! radio interrupts into [`csl::CslMac`]'s `on_sfd` / `on_fifop` /
//! `on_txdone` entry points, runs `post_process` from its task context
//! whenever an entry point requests it, and keeps one real-time timer
//! armed to `next_timeout`.

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(test)]
pub(crate) mod testutil;

pub mod config;
pub mod time;

pub mod radio;

pub mod packet;
pub mod wake_up_counter;

pub mod anti_replay;
pub mod leaky_bucket;

pub mod ccm_inputs;
pub mod security;

pub mod ieee802154;
pub mod nbr;

pub mod framer;
pub mod strategy;
pub mod synchronizer;

pub mod queue;

pub mod akes;
pub mod csl;
pub mod trickle;

pub use config::Config;
pub use csl::{CompliantMac, CslMac, PotrMac};
pub use radio::{Radio, Timing};

/// A link-layer address. EUI-64 sized; the compliant wire format
/// additionally derives its 16-bit short form from the low two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkAddr(pub [u8; LinkAddr::LEN]);

impl LinkAddr {
    pub const LEN: usize = 8;

    /// The null address doubles as the broadcast receiver.
    pub const NULL: LinkAddr = LinkAddr([0; LinkAddr::LEN]);

    pub const fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        *self == LinkAddr::NULL
    }

    /// 16-bit short address for compliant headers, low two bytes.
    pub fn short(&self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]])
    }
}

/// Outcome of a transmission attempt, reported per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    /// No acknowledgement within the acknowledgement window.
    Noack,
    /// The channel was busy, or an acknowledgement failed to parse.
    Collision,
    /// Transient error; retried like a collision.
    Err,
    /// Unrecoverable for this frame; dropped without retry.
    ErrFatal,
    /// Still queued; a later callback will report the final outcome.
    Deferred,
}

/// Raised when the outgoing frame counter would wrap. Reusing a counter
/// value under the same key breaks CCM*, so the platform must reboot
/// rather than continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    FrameCounterExhausted,
}

/// Token chosen by the upper layer to correlate `send` with its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketToken(pub u32);

/// Upper-layer hooks invoked from `post_process`.
pub trait MacClient {
    /// A verified frame arrived; one call per frame of a burst, in order.
    fn input(&mut self, packet: &packet::Packet);

    /// The fate of a previously queued frame.
    fn sent(&mut self, token: PacketToken, status: TxStatus, transmissions: u8);
}

/// Supplies the long-term secrets shared with prospective neighbors, from
/// which AKES derives pairwise session keys. Typically backed by a key
/// predistribution scheme; external to this crate.
pub trait KeyScheme {
    fn secret_with_hello_sender(&self, addr: &LinkAddr) -> Option<[u8; 16]>;
    fn secret_with_helloack_sender(&self, addr: &LinkAddr) -> Option<[u8; 16]>;
}
