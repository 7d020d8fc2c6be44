//! CCM* over AES-128, plus the pairwise-key derivation function.
//!
//! Security levels follow IEEE 802.15.4: the low two bits select the MIC
//! length (1 → 4, 2 → 8, 3 → 16 bytes), bit 2 turns on encryption. This
//! implementation runs everything with 8-byte MICs; the one-time passwords
//! of the POTR framer are the leading bytes of such a MIC.
//!
//! Authentication-only operation feeds all bytes as associated data with
//! an empty message, which collapses CCM* to its CBC-MAC half.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U8};
use ccm::Ccm;
use cipher::BlockEncrypt;

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 13;
pub const MIC_LEN: usize = 8;

/// Security level of unicasts, broadcasts, and handshake commands:
/// encryption plus a 64-bit MIC.
pub const SEC_LVL: u8 = 6;

type Ccm8 = Ccm<Aes128, U8, U13>;

/// MIC length selected by a security level.
pub fn mic_len(sec_lvl: u8) -> usize {
    match sec_lvl & 3 {
        1 => 4,
        2 => 8,
        3 => 16,
        _ => 0,
    }
}

pub fn has_encryption(sec_lvl: u8) -> bool {
    sec_lvl & (1 << 2) != 0
}

/// A MIC or OTP failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inauthentic;

/// MIC over `a` alone; nothing is encrypted.
pub fn auth_tag(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], a: &[u8]) -> [u8; MIC_LEN] {
    let ccm = Ccm8::new(GenericArray::from_slice(key));
    let tag = ccm
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), a, &mut [])
        .unwrap();
    tag.into()
}

/// Encrypts `m` in place and returns the MIC over `a || m`.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    a: &[u8],
    m: &mut [u8],
) -> [u8; MIC_LEN] {
    let ccm = Ccm8::new(GenericArray::from_slice(key));
    let tag = ccm
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), a, m)
        .unwrap();
    tag.into()
}

/// Decrypts `m` in place after verifying `mic` over `a || m`.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    a: &[u8],
    m: &mut [u8],
    mic: &[u8; MIC_LEN],
) -> Result<(), Inauthentic> {
    let ccm = Ccm8::new(GenericArray::from_slice(key));
    ccm.decrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        a,
        m,
        GenericArray::from_slice(mic),
    )
    .map_err(|_| Inauthentic)
}

/// Verifies `mic` over `a` without decrypting anything.
pub fn verify_auth_tag(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    a: &[u8],
    mic: &[u8],
) -> Result<(), Inauthentic> {
    let expected = auth_tag(key, nonce, a);
    if expected[..mic.len().min(MIC_LEN)] == *mic {
        Ok(())
    } else {
        Err(Inauthentic)
    }
}

/// Derives a pairwise session key from a predistributed secret and the two
/// handshake challenges.
///
/// AES-128 serves as the key derivation function. In terms of the
/// extract-then-expand paradigm of RFC 5869, extraction can be skipped
/// because the predistributed secret is already uniformly distributed;
/// a single AES permutation of the concatenated challenges implements the
/// expansion step.
pub fn derive_pairwise_key(shared_secret: &[u8; KEY_LEN], challenges: &[u8; 16]) -> [u8; KEY_LEN] {
    let aes = Aes128::new(GenericArray::from_slice(shared_secret));
    let mut block = GenericArray::clone_from_slice(challenges);
    aes.encrypt_block(&mut block);
    block.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x2b; 16];
    const NONCE: [u8; 13] = [7; 13];

    #[test]
    fn roundtrip_and_tamper_detection() {
        let a = [1u8, 2, 3];
        let mut m = *b"payload bytes";
        let plain = m;
        let mic = encrypt(&KEY, &NONCE, &a, &mut m);
        assert_ne!(m, plain);
        assert!(decrypt(&KEY, &NONCE, &a, &mut m, &mic).is_ok());
        assert_eq!(m, plain);

        // flip one ciphertext bit
        let mut mic2 = encrypt(&KEY, &NONCE, &a, &mut m);
        m[0] ^= 1;
        assert!(decrypt(&KEY, &NONCE, &a, &mut m, &mic2).is_err());
        m[0] ^= 1;
        // flip one bit of associated data
        let a2 = [1u8, 2, 2];
        assert!(decrypt(&KEY, &NONCE, &a2, &mut m, &mic2).is_err());
        // flip one MIC bit
        mic2[7] ^= 0x80;
        assert!(decrypt(&KEY, &NONCE, &a, &mut m, &mic2).is_err());
    }

    #[test]
    fn auth_only_matches_encrypt_with_empty_message() {
        let a = [9u8; 40];
        let tag = auth_tag(&KEY, &NONCE, &a);
        assert!(verify_auth_tag(&KEY, &NONCE, &a, &tag).is_ok());
        assert!(verify_auth_tag(&KEY, &NONCE, &a, &tag[..2]).is_ok());
        assert!(verify_auth_tag(&KEY, &NONCE, &a[..39], &tag).is_err());
    }

    #[test]
    fn kdf_is_aes_of_challenges() {
        let secret = [0x42u8; 16];
        let mut challenges = [0u8; 16];
        challenges[..8].copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        challenges[8..].copy_from_slice(&[0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]);
        let k1 = derive_pairwise_key(&secret, &challenges);
        let k2 = derive_pairwise_key(&secret, &challenges);
        assert_eq!(k1, k2);
        challenges[0] ^= 1;
        assert_ne!(k1, derive_pairwise_key(&secret, &challenges));
    }
}
