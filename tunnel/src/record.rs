//! TLS record codec. One logical read or write is exactly one wire record;
//! fragmentation policy belongs to the layers above.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::utils::u16_from_be_slice;

pub const RECORD_HEADER_LEN: usize = 5;

pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
}

pub mod handshake_type {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const NEW_SESSION_TICKET: u8 = 4;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const CERTIFICATE_REQUEST: u8 = 13;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CERTIFICATE_VERIFY: u8 = 15;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
    pub const CERTIFICATE_STATUS: u8 = 22;
}

pub const VERSION_TLS10: u16 = 0x0301;
pub const VERSION_TLS12: u16 = 0x0303;
pub const VERSION_TLS13: u16 = 0x0304;

/// A plaintext-framed TLS record: `{type, version, length, payload}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRecord {
    pub content_type: u8,
    pub version: u16,
    pub payload: Vec<u8>,
}

impl TlsRecord {
    pub fn new(content_type: u8, version: u16, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= u16::MAX as usize);
        TlsRecord {
            content_type,
            version,
            payload,
        }
    }

    /// Validate a 5-byte record header, returning `(type, version, length)`.
    pub fn parse_header(hdr: &[u8; RECORD_HEADER_LEN]) -> io::Result<(u8, u16, usize)> {
        let content_type = hdr[0];
        if !(content_type::CHANGE_CIPHER_SPEC..=content_type::APPLICATION_DATA)
            .contains(&content_type)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "tls: unknown record type",
            ));
        }
        let version = u16_from_be_slice(&hdr[1..3]);
        if !(VERSION_TLS10..=VERSION_TLS13).contains(&version) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "tls: unknown record version",
            ));
        }
        Ok((content_type, version, u16_from_be_slice(&hdr[3..5]) as usize))
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(RECORD_HEADER_LEN + self.payload.len());
        data.push(self.content_type);
        data.extend_from_slice(&self.version.to_be_bytes());
        data.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        data.extend_from_slice(&self.payload);
        data
    }

    /// Consume exactly `5 + length` bytes from `reader`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<TlsRecord> {
        let mut hdr = [0u8; RECORD_HEADER_LEN];
        reader.read_exact(&mut hdr).await?;
        let (content_type, version, len) = Self::parse_header(&hdr)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(TlsRecord {
            content_type,
            version,
            payload,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.marshal()).await
    }

    /// First payload byte, i.e. the handshake message type of an unencrypted
    /// handshake record.
    pub fn handshake_type(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}
