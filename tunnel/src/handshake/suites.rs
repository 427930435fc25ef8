//! The ECDHE-AEAD cipher suites the engine can complete, and the TLS 1.2
//! record protection for each (RFC 5288 GCM, RFC 7905 ChaCha20-Poly1305).
//! Only the two Finished messages ever pass through this cipher; the covert
//! layers bypass TLS record protection entirely after the handshake.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;

use super::prf::HashAlg;
use crate::record::VERSION_TLS12;

const GCM_TAG_LEN: usize = 16;
const GCM_EXPLICIT_NONCE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AeadKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CipherSuite {
    pub id: u16,
    pub hash: HashAlg,
    pub aead: AeadKind,
}

impl CipherSuite {
    pub fn key_len(&self) -> usize {
        match self.aead {
            AeadKind::Aes128Gcm => 16,
            AeadKind::Aes256Gcm | AeadKind::ChaCha20 => 32,
        }
    }

    pub fn fixed_iv_len(&self) -> usize {
        match self.aead {
            AeadKind::Aes128Gcm | AeadKind::Aes256Gcm => 4,
            AeadKind::ChaCha20 => 12,
        }
    }
}

pub(crate) const SUPPORTED_SUITES: &[CipherSuite] = &[
    // ECDHE_ECDSA / ECDHE_RSA with AES-128-GCM
    CipherSuite { id: 0xc02b, hash: HashAlg::Sha256, aead: AeadKind::Aes128Gcm },
    CipherSuite { id: 0xc02f, hash: HashAlg::Sha256, aead: AeadKind::Aes128Gcm },
    // .. with AES-256-GCM
    CipherSuite { id: 0xc02c, hash: HashAlg::Sha384, aead: AeadKind::Aes256Gcm },
    CipherSuite { id: 0xc030, hash: HashAlg::Sha384, aead: AeadKind::Aes256Gcm },
    // .. with ChaCha20-Poly1305
    CipherSuite { id: 0xcca9, hash: HashAlg::Sha256, aead: AeadKind::ChaCha20 },
    CipherSuite { id: 0xcca8, hash: HashAlg::Sha256, aead: AeadKind::ChaCha20 },
];

pub(crate) fn lookup(id: u16) -> Option<&'static CipherSuite> {
    SUPPORTED_SUITES.iter().find(|s| s.id == id)
}

/// One direction of TLS 1.2 record protection.
pub(crate) enum RecordCipher {
    Gcm128 { aead: Aes128Gcm, iv: [u8; 4] },
    Gcm256 { aead: Aes256Gcm, iv: [u8; 4] },
    ChaCha { aead: ChaCha20Poly1305, iv: [u8; 12] },
}

impl RecordCipher {
    pub fn new(suite: &CipherSuite, key: &[u8], iv: &[u8]) -> RecordCipher {
        match suite.aead {
            AeadKind::Aes128Gcm => RecordCipher::Gcm128 {
                aead: Aes128Gcm::new_from_slice(key).expect("key length from suite table"),
                iv: iv.try_into().expect("iv length from suite table"),
            },
            AeadKind::Aes256Gcm => RecordCipher::Gcm256 {
                aead: Aes256Gcm::new_from_slice(key).expect("key length from suite table"),
                iv: iv.try_into().expect("iv length from suite table"),
            },
            AeadKind::ChaCha20 => RecordCipher::ChaCha {
                aead: ChaCha20Poly1305::new_from_slice(key).expect("key length from suite table"),
                iv: iv.try_into().expect("iv length from suite table"),
            },
        }
    }

    fn aad(seq: u64, content_type: u8, len: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&seq.to_be_bytes());
        aad[8] = content_type;
        aad[9..11].copy_from_slice(&VERSION_TLS12.to_be_bytes());
        aad[11..13].copy_from_slice(&(len as u16).to_be_bytes());
        aad
    }

    /// Protect one record fragment; returns the wire payload.
    pub fn encrypt(&self, seq: u64, content_type: u8, plaintext: &[u8]) -> Vec<u8> {
        let aad = Self::aad(seq, content_type, plaintext.len());
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };
        match self {
            RecordCipher::Gcm128 { aead, iv } => {
                let explicit = seq.to_be_bytes();
                let mut nonce = [0u8; 12];
                nonce[..4].copy_from_slice(iv);
                nonce[4..].copy_from_slice(&explicit);
                let ct = aead
                    .encrypt(&nonce.into(), payload)
                    .expect("gcm seal is infallible for in-range lengths");
                let mut out = Vec::with_capacity(8 + ct.len());
                out.extend_from_slice(&explicit);
                out.extend_from_slice(&ct);
                out
            }
            RecordCipher::Gcm256 { aead, iv } => {
                let explicit = seq.to_be_bytes();
                let mut nonce = [0u8; 12];
                nonce[..4].copy_from_slice(iv);
                nonce[4..].copy_from_slice(&explicit);
                let ct = aead
                    .encrypt(&nonce.into(), payload)
                    .expect("gcm seal is infallible for in-range lengths");
                let mut out = Vec::with_capacity(8 + ct.len());
                out.extend_from_slice(&explicit);
                out.extend_from_slice(&ct);
                out
            }
            RecordCipher::ChaCha { aead, iv } => {
                let mut nonce = *iv;
                for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
                    *n ^= s;
                }
                aead.encrypt(&nonce.into(), payload)
                    .expect("chacha seal is infallible for in-range lengths")
            }
        }
    }

    /// Unprotect one record payload; `None` on a bad tag or short payload.
    pub fn decrypt(&self, seq: u64, content_type: u8, payload: &[u8]) -> Option<Vec<u8>> {
        match self {
            RecordCipher::Gcm128 { aead, iv } => {
                Self::open_gcm(|n, p| aead.decrypt(&n.into(), p).ok(), iv, seq, content_type, payload)
            }
            RecordCipher::Gcm256 { aead, iv } => {
                Self::open_gcm(|n, p| aead.decrypt(&n.into(), p).ok(), iv, seq, content_type, payload)
            }
            RecordCipher::ChaCha { aead, iv } => {
                if payload.len() < GCM_TAG_LEN {
                    return None;
                }
                let aad = Self::aad(seq, content_type, payload.len() - GCM_TAG_LEN);
                let mut nonce = *iv;
                for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
                    *n ^= s;
                }
                aead.decrypt(
                    &nonce.into(),
                    Payload {
                        msg: payload,
                        aad: &aad,
                    },
                )
                .ok()
            }
        }
    }

    fn open_gcm<F>(open: F, iv: &[u8; 4], seq: u64, content_type: u8, payload: &[u8]) -> Option<Vec<u8>>
    where
        F: Fn([u8; 12], Payload<'_, '_>) -> Option<Vec<u8>>,
    {
        if payload.len() < GCM_EXPLICIT_NONCE_LEN + GCM_TAG_LEN {
            return None;
        }
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(iv);
        nonce[4..].copy_from_slice(&payload[..GCM_EXPLICIT_NONCE_LEN]);
        let ct = &payload[GCM_EXPLICIT_NONCE_LEN..];
        let aad = Self::aad(seq, content_type, ct.len() - GCM_TAG_LEN);
        open(nonce, Payload { msg: ct, aad: &aad })
    }
}

/// Split the RFC 5246 key block into the two directional ciphers.
/// AEAD suites carry no MAC keys: `client_key || server_key || client_iv ||
/// server_iv`.
pub(crate) fn derive_record_ciphers(
    suite: &'static CipherSuite,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> (RecordCipher, RecordCipher) {
    let key_len = suite.key_len();
    let iv_len = suite.fixed_iv_len();
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);
    let mut block = vec![0u8; 2 * key_len + 2 * iv_len];
    super::prf::prf(suite.hash, master, b"key expansion", &seed, &mut block);
    let (client_key, rest) = block.split_at(key_len);
    let (server_key, rest) = rest.split_at(key_len);
    let (client_iv, server_iv) = rest.split_at(iv_len);
    (
        RecordCipher::new(suite, client_key, client_iv),
        RecordCipher::new(suite, server_key, server_iv),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::content_type;

    #[test]
    fn gcm_record_round_trip() {
        let suite = lookup(0xc02f).unwrap();
        let cipher = RecordCipher::new(suite, &[7u8; 16], &[1, 2, 3, 4]);
        let payload = cipher.encrypt(3, content_type::HANDSHAKE, b"finished!");
        assert_eq!(payload.len(), 8 + 9 + 16);
        assert_eq!(&payload[..8], &3u64.to_be_bytes());
        let pt = cipher.decrypt(3, content_type::HANDSHAKE, &payload).unwrap();
        assert_eq!(pt, b"finished!");
        // wrong sequence number breaks the AAD
        assert!(cipher.decrypt(4, content_type::HANDSHAKE, &payload).is_none());
    }

    #[test]
    fn chacha_record_round_trip() {
        let suite = lookup(0xcca8).unwrap();
        let cipher = RecordCipher::new(suite, &[9u8; 32], &[5u8; 12]);
        let payload = cipher.encrypt(1, content_type::HANDSHAKE, b"fin");
        assert_eq!(payload.len(), 3 + 16);
        let pt = cipher.decrypt(1, content_type::HANDSHAKE, &payload).unwrap();
        assert_eq!(pt, b"fin");
    }

    #[test]
    fn unknown_suite_is_rejected() {
        assert!(lookup(0x002f).is_none()); // RSA key exchange, no ECDHE
        assert!(lookup(0x1301).is_none()); // TLS 1.3 suite
    }
}
