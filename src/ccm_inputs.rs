//! Deterministic CCM* nonce construction for each frame class.
//!
//! All nonces are 13 bytes. The POTR format replaces frame counters with
//! the sender's wake-up counter, qualified by a frame-class tag `alpha`
//! and the position within a burst:
//!
//! ```norust
//!  8        | 1                        | 4
//! src_addr  | alpha << 6 | burst_index | wake-up counter (BE)
//! ```
//!
//! The compliant format keeps the standard frame-counter nonce:
//!
//! ```norust
//!  8        | 4                  | 1
//! src_addr  | frame counter (LE) | security level
//! ```

use crate::security::NONCE_LEN;
use crate::wake_up_counter::WakeUpCounter;
use crate::LinkAddr;

/// Frame-class tag mixed into POTR nonces. Keeps the one-time passwords
/// of wake-up frames, HELLOs, unicasts, and acknowledgements in disjoint
/// nonce spaces even when they share a wake-up counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpha {
    Otp = 0,
    Hello = 1,
    Unicast = 2,
    Acknowledgement = 3,
}

pub fn potr_nonce(
    source_addr: &LinkAddr,
    alpha: Alpha,
    burst_index: u8,
    wuc: WakeUpCounter,
) -> [u8; NONCE_LEN] {
    debug_assert!(burst_index < (1 << 6));
    let mut nonce = [0; NONCE_LEN];
    nonce[..LinkAddr::LEN].copy_from_slice(source_addr.as_bytes());
    nonce[LinkAddr::LEN] = ((alpha as u8) << 6) | burst_index;
    wuc.write(&mut nonce[LinkAddr::LEN + 1..]);
    nonce
}

/// One-time-password nonce of a wake-up frame (`alpha = 0`, burst 0).
pub fn otp_nonce(source_addr: &LinkAddr, wuc: WakeUpCounter) -> [u8; NONCE_LEN] {
    potr_nonce(source_addr, Alpha::Otp, 0, wuc)
}

/// Standards-compliant payload nonce.
pub fn compliant_nonce(
    source_addr: &LinkAddr,
    frame_counter: u32,
    sec_lvl: u8,
) -> [u8; NONCE_LEN] {
    let mut nonce = [0; NONCE_LEN];
    nonce[..LinkAddr::LEN].copy_from_slice(source_addr.as_bytes());
    nonce[LinkAddr::LEN..LinkAddr::LEN + 4].copy_from_slice(&frame_counter.to_le_bytes());
    nonce[12] = sec_lvl;
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn potr_nonce_layout() {
        let addr = LinkAddr([1, 2, 3, 4, 5, 6, 7, 8]);
        let n = potr_nonce(&addr, Alpha::Acknowledgement, 2, WakeUpCounter(0x0a0b0c0d));
        assert_eq!(&n[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(n[8], (3 << 6) | 2);
        assert_eq!(&n[9..], &[0x0a, 0x0b, 0x0c, 0x0d]);
    }

    #[test]
    fn frame_classes_never_collide() {
        let addr = LinkAddr([1; 8]);
        let wuc = WakeUpCounter(77);
        let otp = potr_nonce(&addr, Alpha::Otp, 0, wuc);
        let uni = potr_nonce(&addr, Alpha::Unicast, 0, wuc);
        let ack = potr_nonce(&addr, Alpha::Acknowledgement, 0, wuc);
        assert_ne!(otp, uni);
        assert_ne!(uni, ack);
        assert_ne!(otp, ack);
    }
}
