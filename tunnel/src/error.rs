use std::io;

use thiserror::Error;

/// Errors surfaced across the tunnel boundary.
///
/// Server-side covert failures are never returned to peers; they are logged
/// at debug level and the connection is relayed to the camouflage site
/// instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic, parse or protocol mismatch on the authenticated path.
    #[error("verify failed")]
    VerifyFailed,

    /// AEAD failure on a sealed-stream record.
    #[error("decrypt failed")]
    DecryptFailed,

    /// The camouflage site could not be reached during a server handshake.
    #[error("proxy die: {0}")]
    ProxyDie(#[source] io::Error),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    /// Malformed config bundle, bad base64, wrong key length.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// The listener's accept loop terminated.
    #[error("listener closed")]
    ListenerClosed,
}

impl Error {
    /// Wrap into an `io::Error` for surfaces constrained to `io::Result`
    /// (the sealed stream's `AsyncRead`/`AsyncWrite` impls). The original
    /// kind is recoverable via `io::Error::get_ref` + downcast.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
