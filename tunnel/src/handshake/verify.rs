//! Certificate-chain and signature verification, delegated to webpki with
//! the Mozilla root program (the same components rustls builds on).

use std::time::{SystemTime, UNIX_EPOCH};

use rustls_pki_types::{CertificateDer, ServerName, SignatureVerificationAlgorithm, UnixTime};
use tracing::debug;
use webpki::{ring as ring_algs, EndEntityCert, KeyUsage};

use crate::error::Error;

static CHAIN_ALGS: &[&dyn SignatureVerificationAlgorithm] = &[
    ring_algs::ECDSA_P256_SHA256,
    ring_algs::ECDSA_P256_SHA384,
    ring_algs::ECDSA_P384_SHA256,
    ring_algs::ECDSA_P384_SHA384,
    ring_algs::ED25519,
    ring_algs::RSA_PKCS1_2048_8192_SHA256,
    ring_algs::RSA_PKCS1_2048_8192_SHA384,
    ring_algs::RSA_PKCS1_2048_8192_SHA512,
    ring_algs::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
    ring_algs::RSA_PSS_2048_8192_SHA384_LEGACY_KEY,
    ring_algs::RSA_PSS_2048_8192_SHA512_LEGACY_KEY,
];

/// TLS SignatureScheme → webpki algorithm, for the schemes the profiles
/// advertise.
fn alg_for_scheme(scheme: u16) -> Option<&'static dyn SignatureVerificationAlgorithm> {
    Some(match scheme {
        0x0401 => ring_algs::RSA_PKCS1_2048_8192_SHA256,
        0x0501 => ring_algs::RSA_PKCS1_2048_8192_SHA384,
        0x0601 => ring_algs::RSA_PKCS1_2048_8192_SHA512,
        0x0403 => ring_algs::ECDSA_P256_SHA256,
        0x0503 => ring_algs::ECDSA_P384_SHA384,
        0x0804 => ring_algs::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
        0x0805 => ring_algs::RSA_PSS_2048_8192_SHA384_LEGACY_KEY,
        0x0806 => ring_algs::RSA_PSS_2048_8192_SHA512_LEGACY_KEY,
        0x0807 => ring_algs::ED25519,
        _ => return None,
    })
}

/// Verify the camouflage site's chain and hostname. With `skip_verify` only
/// this step is bypassed; the ServerKeyExchange signature is always checked
/// against the leaf.
pub(crate) fn verify_server_identity(
    certs: &[Vec<u8>],
    server_name: &str,
    skip_verify: bool,
) -> Result<(), Error> {
    let leaf = certs.first().ok_or(Error::VerifyFailed)?;
    let leaf = CertificateDer::from(leaf.as_slice());
    let end_entity = EndEntityCert::try_from(&leaf).map_err(|e| {
        debug!("bad end-entity certificate: {e:?}");
        Error::VerifyFailed
    })?;

    if skip_verify {
        return Ok(());
    }

    let intermediates: Vec<CertificateDer<'_>> = certs[1..]
        .iter()
        .map(|c| CertificateDer::from(c.as_slice()))
        .collect();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch");
    end_entity
        .verify_for_usage(
            CHAIN_ALGS,
            webpki_roots::TLS_SERVER_ROOTS,
            &intermediates,
            UnixTime::since_unix_epoch(now),
            KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| {
            debug!("certificate chain rejected: {e:?}");
            Error::VerifyFailed
        })?;

    let name = ServerName::try_from(server_name).map_err(|_| Error::VerifyFailed)?;
    end_entity
        .verify_is_valid_for_subject_name(&name)
        .map_err(|e| {
            debug!("certificate does not cover {server_name}: {e:?}");
            Error::VerifyFailed
        })?;
    Ok(())
}

/// Verify the ServerKeyExchange signature against the leaf certificate.
/// `message` is `client_random || server_random || params`.
pub(crate) fn verify_key_exchange_signature(
    leaf: &[u8],
    scheme: u16,
    message: &[u8],
    signature: &[u8],
) -> Result<(), Error> {
    let alg = alg_for_scheme(scheme).ok_or_else(|| {
        debug!("unsupported signature scheme {scheme:#06x}");
        Error::VerifyFailed
    })?;
    let leaf = CertificateDer::from(leaf);
    let end_entity = EndEntityCert::try_from(&leaf).map_err(|_| Error::VerifyFailed)?;
    end_entity
        .verify_signature(alg, message, signature)
        .map_err(|e| {
            debug!("key exchange signature rejected: {e:?}");
            Error::VerifyFailed
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(alg_for_scheme(0x0201).is_none()); // rsa_pkcs1_sha1
        assert!(alg_for_scheme(0x0403).is_some());
    }

    #[test]
    fn garbage_certificate_fails_closed() {
        let err = verify_server_identity(&[vec![0xde, 0xad]], "example.com", true).unwrap_err();
        assert!(matches!(err, Error::VerifyFailed));
    }

    #[test]
    fn empty_chain_fails() {
        assert!(matches!(
            verify_server_identity(&[], "example.com", false),
            Err(Error::VerifyFailed)
        ));
    }
}
