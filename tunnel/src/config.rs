//! Long-term identity and the compact client bundle.
//!
//! A server config owns the X25519 and Ed25519 private keys, the camouflage
//! address and the expiry window; `to_client_config` derives the public
//! bundle a client needs. Client bundles serialize to a fixed 1024-byte
//! blob: pretty JSON, zlib, a 2-byte big-endian length, zero padding.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use derivative::Derivative;
use ed25519_dalek::{SigningKey, VerifyingKey};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::common::DEFAULT_EXPIRE_SECOND;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

pub const CONFIG_DATA_LEN: usize = 1024;
const MAX_COMPRESSED_LEN: usize = CONFIG_DATA_LEN - 2;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u8(v: &u8) -> bool {
    *v == 0
}

/// Everything a client needs to reach a server: the rendezvous address, the
/// camouflage name, and the server's public keys.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct ClientConfig {
    pub server_addr: String,
    pub sni_name: String,
    #[derivative(Debug = "ignore")]
    pub public_key_ecdh: String,
    #[derivative(Debug = "ignore")]
    pub public_key_verify: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finger_print: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub expire_second: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_verify: bool,
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub overlay_data: u8,
}

impl ClientConfig {
    /// Check field shapes and key encodings. The same checks run inside
    /// [`crate::Client::new`]; this is for callers that want early errors.
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(Error::ConfigInvalid("server address is empty".into()));
        }
        if self.sni_name.is_empty() {
            return Err(Error::ConfigInvalid("server name is empty".into()));
        }
        decode_x25519_public(&self.public_key_ecdh)?;
        decode_verifying_key(&self.public_key_verify)?;
        Ok(())
    }

    /// Effective expiry window: an absent/zero value means the default.
    pub fn effective_expire_second(&self) -> u32 {
        if self.expire_second == 0 {
            DEFAULT_EXPIRE_SECOND
        } else {
            self.expire_second
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_name(&self.finger_print)
    }

    /// Serialize to the fixed 1024-byte bundle.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&json)
            .and_then(|_| enc.finish())
            .map_err(|e| Error::ConfigInvalid(e.to_string()))
            .and_then(|zipped| {
                if zipped.len() > MAX_COMPRESSED_LEN {
                    return Err(Error::ConfigInvalid("config data too large".into()));
                }
                let mut out = vec![0u8; CONFIG_DATA_LEN];
                out[..2].copy_from_slice(&(zipped.len() as u16).to_be_bytes());
                out[2..2 + zipped.len()].copy_from_slice(&zipped);
                Ok(out)
            })
    }

    /// Inverse of [`marshal`](Self::marshal); validates the result.
    pub fn unmarshal(data: &[u8]) -> Result<ClientConfig> {
        if data.len() < 2 {
            return Err(Error::ConfigInvalid("config data truncated".into()));
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if len == 0 || len > MAX_COMPRESSED_LEN || 2 + len > data.len() {
            return Err(Error::ConfigInvalid("invalid config length".into()));
        }
        let mut json = Vec::new();
        ZlibDecoder::new(&data[2..2 + len])
            .read_to_end(&mut json)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let config: ClientConfig =
            serde_json::from_slice(&json).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Server-side identity and camouflage parameters.
#[derive(Serialize, Deserialize, Clone, Derivative)]
#[derivative(Debug)]
pub struct ServerConfig {
    /// The public site whose TLS handshake is mirrored, `host:port`.
    pub sni_addr: String,
    /// Where the tunnel itself is reachable, `host:port`.
    pub server_addr: String,
    #[derivative(Debug = "ignore")]
    pub private_key_ecdh: String,
    #[derivative(Debug = "ignore")]
    pub private_key_sign: String,
    #[serde(default)]
    pub expire_second: u32,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finger_print: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_verify: bool,
}

impl ServerConfig {
    /// Fresh identity for `sni_addr`/`server_addr`.
    pub fn new(sni_addr: impl Into<String>, server_addr: impl Into<String>) -> Result<ServerConfig> {
        let sni_addr = sni_addr.into();
        split_host_port(&sni_addr)?;
        let ecdh = StaticSecret::random_from_rng(OsRng);
        let sign = SigningKey::generate(&mut OsRng);
        Ok(ServerConfig {
            sni_addr,
            server_addr: server_addr.into(),
            private_key_ecdh: BASE64.encode(ecdh.to_bytes()),
            private_key_sign: BASE64.encode(sign.to_bytes()),
            expire_second: DEFAULT_EXPIRE_SECOND,
            debug: false,
            finger_print: "chrome".into(),
            skip_verify: false,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.sni_addr.is_empty() {
            return Err(Error::ConfigInvalid("SNI address is required".into()));
        }
        split_host_port(&self.sni_addr)?;
        if self.server_addr.is_empty() {
            return Err(Error::ConfigInvalid("server address is required".into()));
        }
        decode_x25519_secret(&self.private_key_ecdh)?;
        decode_signing_key(&self.private_key_sign)?;
        Ok(())
    }

    pub fn sni_host(&self) -> Result<String> {
        split_host_port(&self.sni_addr).map(|(host, _)| host.to_string())
    }

    pub fn effective_expire_second(&self) -> u32 {
        if self.expire_second == 0 {
            DEFAULT_EXPIRE_SECOND
        } else {
            self.expire_second
        }
    }

    /// The public counterpart handed to clients, tagged with `overlay`.
    pub fn to_client_config(&self, overlay: u8) -> Result<ClientConfig> {
        let ecdh = decode_x25519_secret(&self.private_key_ecdh)?;
        let sign = decode_signing_key(&self.private_key_sign)?;
        Ok(ClientConfig {
            server_addr: self.server_addr.clone(),
            sni_name: self.sni_host()?,
            public_key_ecdh: BASE64.encode(PublicKey::from(&ecdh).as_bytes()),
            public_key_verify: BASE64.encode(sign.verifying_key().as_bytes()),
            finger_print: if self.finger_print.is_empty() {
                "chrome".into()
            } else {
                self.finger_print.clone()
            },
            expire_second: self.effective_expire_second(),
            debug: self.debug,
            skip_verify: self.skip_verify,
            overlay_data: overlay,
        })
    }
}

fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::ConfigInvalid(format!("missing port in address {addr}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("bad port in address {addr}")))?;
    if host.is_empty() {
        return Err(Error::ConfigInvalid(format!("missing host in address {addr}")));
    }
    Ok((host, port))
}

fn decode_32(b64: &str, what: &str) -> Result<[u8; 32]> {
    let raw = BASE64
        .decode(b64)
        .map_err(|e| Error::ConfigInvalid(format!("{what}: {e}")))?;
    raw.try_into()
        .map_err(|_| Error::ConfigInvalid(format!("{what} length error")))
}

pub(crate) fn decode_x25519_public(b64: &str) -> Result<PublicKey> {
    if b64.is_empty() {
        return Err(Error::ConfigInvalid("public key ecdh is empty".into()));
    }
    decode_32(b64, "public key ecdh").map(PublicKey::from)
}

pub(crate) fn decode_verifying_key(b64: &str) -> Result<VerifyingKey> {
    let raw = decode_32(b64, "public key verify")?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|_| Error::ConfigInvalid("public key verify is not a valid point".into()))
}

pub(crate) fn decode_x25519_secret(b64: &str) -> Result<StaticSecret> {
    decode_32(b64, "private key ecdh").map(StaticSecret::from)
}

pub(crate) fn decode_signing_key(b64: &str) -> Result<SigningKey> {
    decode_32(b64, "private key sign").map(|raw| SigningKey::from_bytes(&raw))
}
