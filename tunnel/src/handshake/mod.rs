//! Just enough of a TLS 1.2 client to carry the cover handshake.
//!
//! The Client Hello bytes come from the mimic profiles; this module drives
//! the rest of the exchange against the camouflage site (bridged by the
//! server): ECDHE on x25519 / secp256r1 / secp384r1, the GCM and ChaCha20
//! AEAD suites, extended master secret, and standard webpki verification.
//! Exactly two records ever pass through the negotiated record protection,
//! the two Finished messages; everything after the handshake bypasses TLS.

mod messages;
mod prf;
mod suites;
mod verify;

use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use messages::{Flight, MessageReader};
use suites::CipherSuite;

use crate::error::Error;
use crate::record::{content_type, handshake_type, TlsRecord, VERSION_TLS10, VERSION_TLS12};

/// Caller-supplied parameters for one cover handshake.
pub(crate) struct HandshakeParams<'a> {
    pub server_name: &'a str,
    /// The covert session id; a server echoing it back would mean session
    /// resumption, which the cover flow cannot complete.
    pub session_id: &'a [u8; 32],
    pub skip_verify: bool,
}

enum KeyShare {
    X25519(x25519_dalek::EphemeralSecret),
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
}

impl KeyShare {
    fn generate(curve: u16) -> Option<(KeyShare, Vec<u8>)> {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        match curve {
            0x001d => {
                let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                Some((KeyShare::X25519(secret), public.as_bytes().to_vec()))
            }
            0x0017 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                Some((KeyShare::P256(secret), public))
            }
            0x0018 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                Some((KeyShare::P384(secret), public))
            }
            _ => None,
        }
    }

    fn agree(self, peer: &[u8]) -> Option<Vec<u8>> {
        match self {
            KeyShare::X25519(secret) => {
                let raw: [u8; 32] = peer.try_into().ok()?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(raw));
                Some(shared.as_bytes().to_vec())
            }
            KeyShare::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer).ok()?;
                Some(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            KeyShare::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer).ok()?;
                Some(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

/// Drive the TLS 1.2 handshake opened by `hello_msg` to completion over
/// `io`. On return the socket is positioned exactly after the server's
/// Finished record.
pub(crate) async fn run_client_handshake<S>(
    io: &mut S,
    hello_msg: Vec<u8>,
    client_random: &[u8; 32],
    params: HandshakeParams<'_>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut transcript: Vec<u8> = Vec::with_capacity(8 * 1024);
    transcript.extend_from_slice(&hello_msg);

    // Browsers emit the first record with the legacy TLS 1.0 version.
    TlsRecord::new(content_type::HANDSHAKE, VERSION_TLS10, hello_msg)
        .write_to(io)
        .await?;

    let mut reader = MessageReader::new();

    // --- server flight one ---
    let sh_msg = reader.next(io).await?;
    if sh_msg.typ != handshake_type::SERVER_HELLO {
        return Err(Error::VerifyFailed);
    }
    let sh = messages::parse_server_hello(sh_msg.body()).ok_or(Error::VerifyFailed)?;
    transcript.extend_from_slice(&sh_msg.raw);

    // the cover session is pinned to TLS 1.2
    if sh.version != VERSION_TLS12 || matches!(sh.selected_version, Some(v) if v != VERSION_TLS12)
    {
        debug!(version = sh.version, "cover handshake did not settle on TLS 1.2");
        return Err(Error::VerifyFailed);
    }
    if sh.session_id.as_slice() == params.session_id {
        // resumption against a session we never held
        return Err(Error::VerifyFailed);
    }
    let suite: &'static CipherSuite =
        suites::lookup(sh.cipher_suite).ok_or(Error::VerifyFailed)?;
    trace!("cover suite negotiated: {:#06x}", suite.id);

    let mut certs: Option<Vec<Vec<u8>>> = None;
    let mut skx: Option<messages::ServerKeyExchange> = None;
    loop {
        let msg = reader.next(io).await?;
        transcript.extend_from_slice(&msg.raw);
        match msg.typ {
            handshake_type::CERTIFICATE => {
                certs = Some(messages::parse_certificates(msg.body()).ok_or(Error::VerifyFailed)?);
            }
            handshake_type::CERTIFICATE_STATUS => {
                // stapled OCSP; transcript-relevant, otherwise ignored
            }
            handshake_type::SERVER_KEY_EXCHANGE => {
                skx = Some(
                    messages::parse_server_key_exchange(msg.body()).ok_or(Error::VerifyFailed)?,
                );
            }
            handshake_type::CERTIFICATE_REQUEST => {
                // the cover flow has no client certificate to offer
                return Err(Error::VerifyFailed);
            }
            handshake_type::SERVER_HELLO_DONE => break,
            other => {
                debug!(msg = other, "unexpected handshake message");
                return Err(Error::VerifyFailed);
            }
        }
    }
    let certs = certs.ok_or(Error::VerifyFailed)?;
    let skx = skx.ok_or(Error::VerifyFailed)?;

    verify::verify_server_identity(&certs, params.server_name, params.skip_verify)?;
    let mut signed = Vec::with_capacity(64 + skx.params.len());
    signed.extend_from_slice(client_random);
    signed.extend_from_slice(&sh.random);
    signed.extend_from_slice(&skx.params);
    verify::verify_key_exchange_signature(&certs[0], skx.scheme, &signed, &skx.signature)?;

    // --- client flight two ---
    let (share, public) = KeyShare::generate(skx.curve).ok_or(Error::VerifyFailed)?;
    let pre_master = share.agree(&skx.public).ok_or(Error::VerifyFailed)?;

    let ckx = messages::client_key_exchange(&public);
    transcript.extend_from_slice(&ckx);

    let master = if sh.extended_master_secret {
        let session_hash = suite.hash.digest(&transcript);
        prf::master_secret(suite.hash, &pre_master, b"extended master secret", &session_hash)
    } else {
        let mut seed = [0u8; 64];
        seed[..32].copy_from_slice(client_random);
        seed[32..].copy_from_slice(&sh.random);
        prf::master_secret(suite.hash, &pre_master, b"master secret", &seed)
    };
    let (client_cipher, server_cipher) =
        suites::derive_record_ciphers(suite, &master, client_random, &sh.random);

    TlsRecord::new(content_type::HANDSHAKE, VERSION_TLS12, ckx)
        .write_to(io)
        .await?;
    TlsRecord::new(content_type::CHANGE_CIPHER_SPEC, VERSION_TLS12, vec![1])
        .write_to(io)
        .await?;

    let vd = prf::verify_data(
        suite.hash,
        &master,
        b"client finished",
        &suite.hash.digest(&transcript),
    );
    let fin = messages::finished(&vd);
    transcript.extend_from_slice(&fin);
    let sealed = client_cipher.encrypt(0, content_type::HANDSHAKE, &fin);
    TlsRecord::new(content_type::HANDSHAKE, VERSION_TLS12, sealed)
        .write_to(io)
        .await?;
    io.flush().await?;

    // --- server flight three ---
    loop {
        match reader.next_allowing_ccs(io).await? {
            Flight::Msg(msg) => {
                if msg.typ != handshake_type::NEW_SESSION_TICKET {
                    return Err(Error::VerifyFailed);
                }
                transcript.extend_from_slice(&msg.raw);
            }
            Flight::ChangeCipherSpec => break,
        }
    }

    let record = TlsRecord::read_from(io).await?;
    if record.content_type != content_type::HANDSHAKE {
        return Err(Error::VerifyFailed);
    }
    let fin = server_cipher
        .decrypt(0, content_type::HANDSHAKE, &record.payload)
        .ok_or(Error::VerifyFailed)?;
    let expected = prf::verify_data(
        suite.hash,
        &master,
        b"server finished",
        &suite.hash.digest(&transcript),
    );
    if !server_finished_matches(&fin, &expected) {
        debug!("server Finished verify_data mismatch");
        return Err(Error::VerifyFailed);
    }
    trace!("cover handshake finished");
    Ok(())
}

fn server_finished_matches(msg: &[u8], expected: &[u8; prf::VERIFY_DATA_LEN]) -> bool {
    msg.len() == 4 + prf::VERIFY_DATA_LEN
        && msg[0] == handshake_type::FINISHED
        && msg[4..] == expected[..]
}
