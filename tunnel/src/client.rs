//! Client side of the covert handshake.
//!
//! A connect runs in three acts: seal the authentication material into the
//! Client Hello, complete a genuine TLS 1.2 handshake with the camouflage
//! site through the server's bridge, then trade one signaling record each
//! way on the raw socket and switch to the sealed stream. Dropping the
//! future at any await point cancels the attempt and closes the socket.

use derivative::Derivative;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use x25519_dalek::PublicKey;

use crate::common::{padded_random, SEQ_ONE, SIGNATURE_LEN};
use crate::config::{decode_verifying_key, decode_x25519_public, ClientConfig};
use crate::crypto;
use crate::error::{Error, Result};
use crate::fingerprint::{build_client_hello, Fingerprint};
use crate::handshake::{run_client_handshake, HandshakeParams};
use crate::record::{content_type, TlsRecord, VERSION_TLS12};
use crate::sealed::SealedStream;

/// Validated client identity, reusable across connects.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Client {
    pub server_addr: String,
    pub sni_name: String,
    #[derivative(Debug = "ignore")]
    public_key_ecdh: PublicKey,
    #[derivative(Debug = "ignore")]
    public_key_verify: VerifyingKey,
    pub fingerprint: Fingerprint,
    pub expire_second: u32,
    pub skip_verify: bool,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Result<Client> {
        config.validate()?;
        Ok(Client {
            server_addr: config.server_addr.clone(),
            sni_name: config.sni_name.clone(),
            public_key_ecdh: decode_x25519_public(&config.public_key_ecdh)?,
            public_key_verify: decode_verifying_key(&config.public_key_verify)?,
            fingerprint: config.fingerprint(),
            expire_second: config.effective_expire_second(),
            skip_verify: config.skip_verify,
        })
    }

    /// Dial the server and authenticate; returns the sealed stream tagged
    /// with `overlay`.
    pub async fn connect(&self, overlay: u8) -> Result<SealedStream> {
        let stream = TcpStream::connect(&self.server_addr).await?;
        self.connect_over(stream, overlay).await
    }

    /// Authenticate over an already-dialed socket.
    pub async fn connect_over(&self, mut stream: TcpStream, overlay: u8) -> Result<SealedStream> {
        // per-connection ephemeral key, agreed against the server's static key
        let e_priv = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let e_pub = PublicKey::from(&e_priv);
        let session_key = crypto::session_key(e_priv.diffie_hellman(&self.public_key_ecdh));
        let aead = crypto::covert_aead(&session_key);
        let nonce = crypto::current_nonce(&session_key, self.expire_second);
        let plaintext = crypto::fresh_plaintext();
        let session_id = crypto::seal_session_id(&aead, &nonce, &plaintext);

        trace!(
            random = ?e_pub.as_bytes(),
            "covert fields sealed into client hello"
        );
        let hello = build_client_hello(
            self.fingerprint,
            &self.sni_name,
            e_pub.as_bytes(),
            &session_id,
        );
        run_client_handshake(
            &mut stream,
            hello,
            e_pub.as_bytes(),
            HandshakeParams {
                server_name: &self.sni_name,
                session_id: &session_id,
                skip_verify: self.skip_verify,
            },
        )
        .await?;
        debug!("cover handshake complete, signaling");

        // signaling record: raw on the socket, shaped like application data,
        // seq-one prefix and the overlay tag in the last byte
        let mut data = padded_random(&SEQ_ONE);
        *data.last_mut().expect("padded buffer is never empty") = overlay;
        TlsRecord::new(content_type::APPLICATION_DATA, VERSION_TLS12, data)
            .write_to(&mut stream)
            .await?;

        let reply = TlsRecord::read_from(&mut stream).await?;
        if reply.content_type != content_type::APPLICATION_DATA
            || reply.version != VERSION_TLS12
            || reply.payload.len() < 8 + SIGNATURE_LEN
        {
            debug!("signaling reply malformed");
            return Err(Error::VerifyFailed);
        }
        let signature = Signature::from_slice(&reply.payload[8..8 + SIGNATURE_LEN])
            .map_err(|_| Error::VerifyFailed)?;
        self.public_key_verify
            .verify(&plaintext, &signature)
            .map_err(|_| Error::VerifyFailed)?;
        debug!("server signature verified");

        Ok(SealedStream::new(stream, aead, overlay, SEQ_ONE))
    }
}
