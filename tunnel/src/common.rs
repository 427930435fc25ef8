use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

/// Magic prefix authenticated inside the covert Client Hello session id.
pub const PREFIX: &[u8] = b"REALITY";

/// Authenticated plaintext carried by the session id: prefix + 9 random bytes.
pub const PLAINTEXT_LEN: usize = 16;

/// Sealed plaintext + GCM tag; must fit a legal 32-byte TLS session id.
pub const CIPHERTEXT_LEN: usize = 32;

/// The covert AEAD runs with a shortened 8-byte nonce so the session id
/// layout works out; the time bucket in the derivation compensates.
pub const NONCE_LEN: usize = 8;

pub const SEQ_LEN: usize = 8;
pub const SIGNATURE_LEN: usize = 64;

pub const DEFAULT_EXPIRE_SECOND: u32 = 30;

/// Wire seq of the client's signaling record.
pub const SEQ_ONE: [u8; SEQ_LEN] = [0, 0, 0, 0, 0, 0, 0, 1];

const MIN_PAD_LEN: usize = 900;
const MAX_PAD_LEN: usize = 1400;

/// Capability of accepted connections: the routing tag carried through the
/// signaling exchange, opaque to the tunnel itself.
pub trait Overlay {
    fn overlay(&self) -> u8;
}

// Length oracle only, deliberately not a CSPRNG; seeded once per process so
// draws are independent across connections.
static PAD_RNG: Lazy<Mutex<SmallRng>> = Lazy::new(|| Mutex::new(SmallRng::from_entropy()));

/// Random buffer of `[900, 1400)` bytes shaped like application data, with
/// `prefix` laid over its head.
pub(crate) fn padded_random(prefix: &[u8]) -> Vec<u8> {
    let mut rng = PAD_RNG.lock().unwrap();
    let len = rng.gen_range(MIN_PAD_LEN..MAX_PAD_LEN);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data[..prefix.len()].copy_from_slice(prefix);
    data
}

/// Big-endian increment, wrapping at 2^64.
pub(crate) fn inc_seq(seq: &mut [u8; SEQ_LEN]) {
    for b in seq.iter_mut().rev() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_increments_big_endian() {
        let mut seq = [0u8; 8];
        inc_seq(&mut seq);
        assert_eq!(seq, SEQ_ONE);
        let mut seq = [0, 0, 0, 0, 0, 0, 0, 0xff];
        inc_seq(&mut seq);
        assert_eq!(seq, [0, 0, 0, 0, 0, 0, 1, 0]);
        let mut seq = [0xff; 8];
        inc_seq(&mut seq);
        assert_eq!(seq, [0; 8]);
    }

    #[test]
    fn padding_in_range_with_prefix() {
        for _ in 0..64 {
            let data = padded_random(&SEQ_ONE);
            assert!((MIN_PAD_LEN..MAX_PAD_LEN).contains(&data.len()));
            assert_eq!(&data[..8], &SEQ_ONE);
        }
    }
}
