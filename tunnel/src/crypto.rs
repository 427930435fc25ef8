//! Session-key agreement and the covert AEAD.
//!
//! The session key is a per-connection X25519 agreement against the server's
//! long-term key. The AEAD nonce is derived from the key and a wall-clock
//! bucket, so a sealed session id is only openable while the bucket lasts.

use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::consts::U8;
use aes_gcm::aead::Aead;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret};

use crate::common::{CIPHERTEXT_LEN, NONCE_LEN, PLAINTEXT_LEN, PREFIX};

/// AES-256-GCM keyed with the raw 32-byte agreement, with the shortened
/// 8-byte nonce the session-id layout requires.
pub(crate) type CovertAead = AesGcm<Aes256, U8>;

pub(crate) type SessionKey = [u8; 32];

pub(crate) fn session_key(shared: SharedSecret) -> SessionKey {
    *shared.as_bytes()
}

pub(crate) fn covert_aead(key: &SessionKey) -> CovertAead {
    CovertAead::new(Key::<Aes256>::from_slice(key))
}

/// Nonce for time bucket `t mod expire_second`:
/// `HKDF-SHA256(salt = "REALITY", ikm = session_key, info = u64_be(bucket))[..8]`.
///
/// Deterministic within a bucket; peers whose clocks sit in the same bucket
/// derive the same nonce. Re-sealing within one bucket is fine because the
/// session key is per-connection ephemeral.
pub(crate) fn derive_nonce(key: &SessionKey, expire_second: u32, unix_time: u64) -> [u8; NONCE_LEN] {
    let bucket = (unix_time % u64::from(expire_second)).to_be_bytes();
    let hk = Hkdf::<Sha256>::new(Some(PREFIX), key);
    let mut nonce = [0u8; NONCE_LEN];
    hk.expand(&bucket, &mut nonce)
        .expect("8 bytes is a valid HKDF-SHA256 output length");
    nonce
}

pub(crate) fn current_nonce(key: &SessionKey, expire_second: u32) -> [u8; NONCE_LEN] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs();
    derive_nonce(key, expire_second, now)
}

/// Seal the 16-byte authenticated plaintext into the 32-byte session id.
pub(crate) fn seal_session_id(
    aead: &CovertAead,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8; PLAINTEXT_LEN],
) -> [u8; CIPHERTEXT_LEN] {
    let ct = aead
        .encrypt(Nonce::<U8>::from_slice(nonce), plaintext.as_slice())
        .expect("aes-gcm seal is infallible for in-range lengths");
    debug_assert_eq!(ct.len(), CIPHERTEXT_LEN);
    let mut out = [0u8; CIPHERTEXT_LEN];
    out.copy_from_slice(&ct);
    out
}

/// Open a 32-byte session id back into the authenticated plaintext.
/// `None` covers both forgery and a stale time bucket.
pub(crate) fn open_session_id(
    aead: &CovertAead,
    nonce: &[u8; NONCE_LEN],
    session_id: &[u8],
) -> Option<[u8; PLAINTEXT_LEN]> {
    let pt = aead
        .decrypt(Nonce::<U8>::from_slice(nonce), session_id)
        .ok()?;
    if pt.len() != PLAINTEXT_LEN {
        return None;
    }
    let mut out = [0u8; PLAINTEXT_LEN];
    out.copy_from_slice(&pt);
    Some(out)
}

/// Fresh authenticated plaintext: the magic prefix plus 9 random bytes.
pub(crate) fn fresh_plaintext() -> [u8; PLAINTEXT_LEN] {
    use rand::RngCore;
    let mut pt = [0u8; PLAINTEXT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut pt);
    pt[..PREFIX.len()].copy_from_slice(PREFIX);
    pt
}

pub(crate) fn x25519_public(bytes: &[u8]) -> Option<PublicKey> {
    let raw: [u8; 32] = bytes.try_into().ok()?;
    Some(PublicKey::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        [0x42; 32]
    }

    #[test]
    fn nonce_is_deterministic_within_bucket() {
        let a = derive_nonce(&key(), 30, 1_700_000_007);
        let b = derive_nonce(&key(), 30, 1_700_000_007);
        assert_eq!(a, b);
        // same bucket, different absolute time
        let c = derive_nonce(&key(), 30, 1_700_000_007 + 30);
        assert_eq!(a, c);
    }

    #[test]
    fn nonce_differs_across_buckets() {
        let a = derive_nonce(&key(), 30, 1_700_000_007);
        let b = derive_nonce(&key(), 30, 1_700_000_008);
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_round_trip() {
        let aead = covert_aead(&key());
        let nonce = derive_nonce(&key(), 30, 12);
        let pt = fresh_plaintext();
        assert_eq!(&pt[..7], PREFIX);
        let sealed = seal_session_id(&aead, &nonce, &pt);
        assert_eq!(open_session_id(&aead, &nonce, &sealed), Some(pt));
    }

    #[test]
    fn stale_bucket_fails_open() {
        let aead = covert_aead(&key());
        let pt = fresh_plaintext();
        let sealed = seal_session_id(&aead, &derive_nonce(&key(), 30, 0), &pt);
        assert_eq!(
            open_session_id(&aead, &derive_nonce(&key(), 30, 1), &sealed),
            None
        );
    }

    #[test]
    fn tampered_session_id_fails_open() {
        let aead = covert_aead(&key());
        let nonce = derive_nonce(&key(), 30, 0);
        let mut sealed = seal_session_id(&aead, &nonce, &fresh_plaintext());
        sealed[0] ^= 1;
        assert_eq!(open_session_id(&aead, &nonce, &sealed), None);
    }
}
