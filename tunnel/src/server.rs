//! Server side: unmask covert clients or become an invisible relay.
//!
//! Every accepted socket gets a connection to the camouflage site before the
//! Client Hello is even read, and every record read during the handshake is
//! forwarded to the opposite socket, so the TLS transcript both ends observe
//! is genuine whether or not the covert authentication succeeds. Probers and
//! browsers get the camouflage site, byte for byte; nothing about a failed
//! unmask is ever written to the wire.

use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use x25519_dalek::StaticSecret;

use crate::common::{inc_seq, padded_random, CIPHERTEXT_LEN, PLAINTEXT_LEN, PREFIX, SEQ_LEN, SEQ_ONE};
use crate::config::{decode_signing_key, decode_x25519_secret, ServerConfig};
use crate::crypto::{self, CovertAead};
use crate::error::{Error, Result};
use crate::fingerprint::parse_client_hello;
use crate::order::{
    wait_for_order_relaying, CLIENT_REPLY_ORDER, SERVER_FINISH_ORDER, SERVER_HELLO_ORDER,
};
use crate::record::{content_type, TlsRecord, VERSION_TLS12};
use crate::sealed::SealedStream;

/// Bounds the cost of a stalled covert handshake; the decoy relay spawned on
/// fallthrough is not covered by it.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Reaps decoy relays that have gone quiet, so failed probes do not pin
/// sockets forever.
const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const REPLAY_FILTER_SIZE: usize = 1024;
const ACCEPT_BACKLOG: usize = 64;

/// Per-connection covert handshaker. Shared by all listener tasks.
pub struct Server {
    sni_addr: String,
    private_key_ecdh: StaticSecret,
    private_key_sign: SigningKey,
    expire_second: u32,
    replay_filter: Mutex<LruCache<[u8; 32], SocketAddr>>,
}

struct Unmasked {
    aead: CovertAead,
    plaintext: [u8; PLAINTEXT_LEN],
    client_public: [u8; 32],
}

impl Server {
    pub fn new(config: &ServerConfig) -> Result<Server> {
        config.validate()?;
        Ok(Server {
            sni_addr: config.sni_addr.clone(),
            private_key_ecdh: decode_x25519_secret(&config.private_key_ecdh)?,
            private_key_sign: decode_signing_key(&config.private_key_sign)?,
            expire_second: config.effective_expire_second(),
            replay_filter: Mutex::new(LruCache::new(
                NonZeroUsize::new(REPLAY_FILTER_SIZE).unwrap(),
            )),
        })
    }

    /// Authenticate one inbound socket. On any covert failure the socket is
    /// handed to a transparent relay against the camouflage site and the
    /// error is only meaningful for logging; nothing reaches the peer.
    pub async fn accept(&self, mut inbound: TcpStream) -> Result<SealedStream> {
        let peer = inbound.peer_addr()?;
        let mut outbound = TcpStream::connect(&self.sni_addr)
            .await
            .map_err(Error::ProxyDie)?;

        // Client Hello: forward first, then try to unmask it
        let hello = TlsRecord::read_from(&mut inbound).await?;
        outbound.write_all(&hello.marshal()).await?;
        let unmasked = match self.unmask(&hello) {
            Some(u) => u,
            None => {
                debug!(%peer, "not a covert client, relaying");
                spawn_relay(inbound, outbound);
                return Err(Error::VerifyFailed);
            }
        };
        if self.seen_before(unmasked.client_public, peer) {
            debug!(%peer, "client hello replayed, relaying");
            spawn_relay(inbound, outbound);
            return Err(Error::VerifyFailed);
        }
        debug!(%peer, "covert client authenticated, bridging handshake");

        // bridge the real handshake; record-granular tee keeps both ends'
        // transcripts byte-exact
        let records = match async {
            wait_for_order_relaying(&mut outbound, &mut inbound, SERVER_HELLO_ORDER).await?;
            wait_for_order_relaying(&mut inbound, &mut outbound, CLIENT_REPLY_ORDER).await?;
            wait_for_order_relaying(&mut outbound, &mut inbound, SERVER_FINISH_ORDER).await
        }
        .await
        {
            Ok(records) => records,
            Err(e) => {
                debug!(%peer, error = %e, "handshake diverged, relaying");
                spawn_relay(inbound, outbound);
                return Err(Error::VerifyFailed);
            }
        };
        // handshake finished; the camouflage site has served its purpose
        drop(outbound);

        // mimic the upstream's record seq so the signaling record blends in
        let mut seq = SEQ_ONE;
        if let Some(last) = records.last() {
            if last.payload.len() >= SEQ_LEN {
                seq.copy_from_slice(&last.payload[..SEQ_LEN]);
            }
        }
        inc_seq(&mut seq);

        // client's signaling record carries the overlay tag in its last byte
        let signal = TlsRecord::read_from(&mut inbound).await?;
        let overlay = *signal.payload.last().ok_or(Error::VerifyFailed)?;
        trace!(%peer, overlay, "overlay received");

        let signature = self.private_key_sign.sign(&unmasked.plaintext);
        let mut prefix = Vec::with_capacity(SEQ_LEN + signature.to_bytes().len());
        prefix.extend_from_slice(&seq);
        prefix.extend_from_slice(&signature.to_bytes());
        TlsRecord::new(content_type::APPLICATION_DATA, VERSION_TLS12, padded_random(&prefix))
            .write_to(&mut inbound)
            .await?;
        debug!(%peer, "signaling complete, connection sealed");

        Ok(SealedStream::new(inbound, unmasked.aead, overlay, seq))
    }

    /// Try to decrypt the covert fields out of a Client Hello record.
    /// `None` is indistinguishable from an ordinary browser hello.
    fn unmask(&self, hello: &TlsRecord) -> Option<Unmasked> {
        if hello.content_type != content_type::HANDSHAKE {
            return None;
        }
        let fields = parse_client_hello(&hello.payload)?;
        if fields.session_id.len() != CIPHERTEXT_LEN {
            return None;
        }
        let client_public = crypto::x25519_public(&fields.random)?;
        let session_key =
            crypto::session_key(self.private_key_ecdh.diffie_hellman(&client_public));
        let aead = crypto::covert_aead(&session_key);
        let nonce = crypto::current_nonce(&session_key, self.expire_second);
        let plaintext = crypto::open_session_id(&aead, &nonce, &fields.session_id)?;
        if !plaintext.starts_with(PREFIX) {
            return None;
        }
        Some(Unmasked {
            aead,
            plaintext,
            client_public: fields.random,
        })
    }

    fn seen_before(&self, client_public: [u8; 32], peer: SocketAddr) -> bool {
        let mut filter = self.replay_filter.lock().unwrap();
        if let Some(first) = filter.get(&client_public) {
            warn!(%peer, first_from = %first, "ephemeral key reuse detected");
            return true;
        }
        filter.put(client_public, peer);
        false
    }
}

/// Listening side of the tunnel: owns the accept loop and delivers sealed
/// connections through a queue, the way a plain TCP listener would.
pub struct Listener {
    conns: mpsc::Receiver<SealedStream>,
    errors: mpsc::Receiver<io::Error>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

/// Bind `addr` and start accepting. Covert handshakes run in their own
/// tasks; only successfully unmasked connections surface from
/// [`Listener::accept`].
pub async fn listen<A: ToSocketAddrs>(addr: A, config: &ServerConfig) -> Result<Listener> {
    let server = Arc::new(Server::new(config)?);
    let tcp = TcpListener::bind(addr).await?;
    let local_addr = tcp.local_addr()?;
    let (conn_tx, conns) = mpsc::channel(ACCEPT_BACKLOG);
    let (err_tx, errors) = mpsc::channel(1);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(accept_loop(tcp, server, conn_tx, err_tx, token));
    Ok(Listener {
        conns,
        errors,
        local_addr,
        shutdown,
    })
}

async fn accept_loop(
    tcp: TcpListener,
    server: Arc<Server>,
    conn_tx: mpsc::Sender<SealedStream>,
    err_tx: mpsc::Sender<io::Error>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("listener shut down");
                return;
            }
            accepted = tcp.accept() => match accepted {
                Ok((stream, peer)) => {
                    let server = server.clone();
                    let conn_tx = conn_tx.clone();
                    let task_token = token.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = task_token.cancelled() => {}
                            done = time::timeout(HANDSHAKE_TIMEOUT, server.accept(stream)) => {
                                match done {
                                    Ok(Ok(conn)) => {
                                        let _ = conn_tx.send(conn).await;
                                    }
                                    // covert failures stay invisible; debug only
                                    Ok(Err(e)) => debug!(%peer, error = %e, "handshake not surfaced"),
                                    Err(_) => debug!(%peer, "handshake deadline exceeded"),
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept loop terminating");
                    let _ = err_tx.send(e).await;
                    return;
                }
            }
        }
    }
}

impl Listener {
    /// Next authenticated connection. Fatal listener errors are delivered
    /// here once the queue drains.
    pub async fn accept(&mut self) -> Result<SealedStream> {
        match self.conns.recv().await {
            Some(conn) => Ok(conn),
            None => match self.errors.recv().await {
                Some(e) => Err(Error::Io(e)),
                None => Err(Error::ListenerClosed),
            },
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and abort in-flight covert handshakes. Established
    /// sealed streams are unaffected.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_relay(client: TcpStream, target: TcpStream) {
    tokio::spawn(async move {
        if let Err(e) = relay(client, target).await {
            trace!(error = %e, "relay ended");
        }
    });
}

/// Dumb bidirectional copy with an idle timeout.
async fn relay(mut a: TcpStream, mut b: TcpStream) -> io::Result<()> {
    let (mut ar, mut aw) = a.split();
    let (mut br, mut bw) = b.split();
    let mut abuf = vec![0u8; 8192];
    let mut bbuf = vec![0u8; 8192];
    loop {
        tokio::select! {
            n = ar.read(&mut abuf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                bw.write_all(&abuf[..n]).await?;
            }
            n = br.read(&mut bbuf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                aw.write_all(&bbuf[..n]).await?;
            }
            _ = time::sleep(RELAY_IDLE_TIMEOUT) => {
                debug!("idle relay reaped");
                break;
            }
        }
    }
    Ok(())
}
