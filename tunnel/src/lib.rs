//! A covert transport dressed as ordinary TLS 1.2 sessions to a third-party
//! website.
//!
//! A client embeds an ephemeral X25519 public key and an authenticated
//! ciphertext inside a genuine-looking Client Hello (the `random` and
//! `session_id` fields), then completes a real TLS 1.2 handshake with the
//! camouflage site, transparently bridged by the server. Connections that
//! fail the covert check are relayed to the camouflage site for their whole
//! lifetime, so probers see nothing but the real website. Authenticated
//! connections switch to an AEAD-framed stream indistinguishable on the wire
//! from TLS application data.
//!
//! ```no_run
//! # async fn run() -> Result<(), mirage_tunnel::Error> {
//! use mirage_tunnel::{listen, Client, ServerConfig};
//!
//! // server
//! let config = ServerConfig::new("www.example.com:443", "203.0.113.5:443")?;
//! let mut listener = listen("0.0.0.0:443", &config).await?;
//!
//! // client, built from the bundle the server side hands out
//! let client = Client::new(&config.to_client_config(0x17)?)?;
//! let conn = client.connect(0x17).await?;
//! # let _ = (listener.accept().await?, conn);
//! # Ok(())
//! # }
//! ```

mod client;
mod common;
mod config;
mod crypto;
mod error;
pub mod fingerprint;
mod handshake;
pub mod order;
pub mod record;
mod sealed;
mod server;
mod utils;

pub use client::Client;
pub use common::{Overlay, DEFAULT_EXPIRE_SECOND, PREFIX};
pub use config::{ClientConfig, ServerConfig, CONFIG_DATA_LEN};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use sealed::SealedStream;
pub use server::{listen, Listener, Server};
