//! TLS 1.2 pseudo-random function (RFC 5246 §5) for the two hashes the
//! supported suites use.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashAlg {
    Sha256,
    Sha384,
}

impl HashAlg {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => Sha384::digest(data).to_vec(),
        }
    }
}

macro_rules! p_hash_impl {
    ($name:ident, $digest:ty) => {
        fn $name(secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) {
            let mut label_seed = Vec::with_capacity(label.len() + seed.len());
            label_seed.extend_from_slice(label);
            label_seed.extend_from_slice(seed);

            let hmac = |parts: &[&[u8]]| {
                let mut mac = <Hmac<$digest>>::new_from_slice(secret)
                    .expect("hmac accepts any key length");
                for p in parts {
                    mac.update(p);
                }
                mac.finalize().into_bytes()
            };

            // P_hash: out = HMAC(A(1) || seed) || HMAC(A(2) || seed) || ..
            let mut a = hmac(&[&label_seed]);
            let mut filled = 0;
            while filled < out.len() {
                let block = hmac(&[&a, &label_seed]);
                let n = (out.len() - filled).min(block.len());
                out[filled..filled + n].copy_from_slice(&block[..n]);
                filled += n;
                a = hmac(&[&a]);
            }
        }
    };
}

p_hash_impl!(p_hash_sha256, Sha256);
p_hash_impl!(p_hash_sha384, Sha384);

pub(crate) fn prf(alg: HashAlg, secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) {
    match alg {
        HashAlg::Sha256 => p_hash_sha256(secret, label, seed, out),
        HashAlg::Sha384 => p_hash_sha384(secret, label, seed, out),
    }
}

pub(crate) const MASTER_SECRET_LEN: usize = 48;
pub(crate) const VERIFY_DATA_LEN: usize = 12;

pub(crate) fn master_secret(
    alg: HashAlg,
    pre_master: &[u8],
    label: &[u8],
    seed: &[u8],
) -> [u8; MASTER_SECRET_LEN] {
    let mut out = [0u8; MASTER_SECRET_LEN];
    prf(alg, pre_master, label, seed, &mut out);
    out
}

pub(crate) fn verify_data(
    alg: HashAlg,
    master: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
) -> [u8; VERIFY_DATA_LEN] {
    let mut out = [0u8; VERIFY_DATA_LEN];
    prf(alg, master, label, transcript_hash, &mut out);
    out
}
