//! Client Hello synthesis for a chosen browser profile, plus the parser the
//! server uses to pull the covert fields back out.
//!
//! A profile is a byte-level template: cipher-suite list, extension order,
//! groups, ALPN and padding behavior. The builder exposes the two mutation
//! points the covert handshake needs, `random` and `session_id`, as plain
//! arguments. The cover session is pinned to TLS 1.2, so no 1.3-only
//! extensions (supported_versions, key_share) are emitted and session
//! tickets are not offered.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::record::handshake_type;
use crate::utils::{with_u16_len, with_u24_len, with_u8_len, ByteReader, PutExt};

/// Browser profiles with distinct observable fingerprints. Unknown names
/// fall back to Chrome, the most common cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Fingerprint::Chrome
    }
}

impl Fingerprint {
    pub fn from_name(name: &str) -> Fingerprint {
        match name {
            "firefox" => Fingerprint::Firefox,
            "safari" | "ios" => Fingerprint::Safari,
            "edge" => Fingerprint::Edge,
            // "chrome", "android", "360", "qq" and anything unknown
            _ => Fingerprint::Chrome,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Fingerprint::Chrome => "chrome",
            Fingerprint::Firefox => "firefox",
            Fingerprint::Safari => "safari",
            Fingerprint::Edge => "edge",
        }
    }

    fn profile(&self) -> &'static ProfileSpec {
        match self {
            // Edge is Chromium; its hello is byte-identical to Chrome's.
            Fingerprint::Chrome | Fingerprint::Edge => &CHROME,
            Fingerprint::Firefox => &FIREFOX,
            Fingerprint::Safari => &SAFARI,
        }
    }
}

mod ext {
    pub const SERVER_NAME: u16 = 0x0000;
    pub const STATUS_REQUEST: u16 = 0x0005;
    pub const SUPPORTED_GROUPS: u16 = 0x000a;
    pub const EC_POINT_FORMATS: u16 = 0x000b;
    pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
    pub const ALPN: u16 = 0x0010;
    pub const SCT: u16 = 0x0012;
    pub const PADDING: u16 = 0x0015;
    pub const EXTENDED_MASTER_SECRET: u16 = 0x0017;
    pub const SESSION_TICKET: u16 = 0x0023;
    pub const RENEGOTIATION_INFO: u16 = 0xff01;
}

/// Placeholder resolved to a per-hello GREASE value at build time.
const GREASE: u16 = 0x0a0a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extension {
    Grease,
    ServerName,
    ExtendedMasterSecret,
    RenegotiationInfo,
    SupportedGroups,
    EcPointFormats,
    SessionTicket,
    Alpn,
    StatusRequest,
    SignatureAlgorithms,
    Sct,
    /// Trailing GREASE, one zero byte of body.
    GreaseLast,
    /// Pad the handshake message out to 512 bytes.
    Padding,
}

struct ProfileSpec {
    cipher_suites: &'static [u16],
    groups: &'static [u16],
    signature_algorithms: &'static [u16],
    alpn: &'static [&'static str],
    extensions: &'static [Extension],
}

static CHROME: ProfileSpec = ProfileSpec {
    cipher_suites: &[
        GREASE, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014, 0x009c, 0x009d,
        0x002f, 0x0035,
    ],
    groups: &[GREASE, 0x001d, 0x0017, 0x0018],
    signature_algorithms: &[
        0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
    ],
    alpn: &["h2", "http/1.1"],
    extensions: &[
        Extension::Grease,
        Extension::ServerName,
        Extension::ExtendedMasterSecret,
        Extension::RenegotiationInfo,
        Extension::SupportedGroups,
        Extension::EcPointFormats,
        Extension::SessionTicket,
        Extension::Alpn,
        Extension::StatusRequest,
        Extension::SignatureAlgorithms,
        Extension::Sct,
        Extension::GreaseLast,
        Extension::Padding,
    ],
};

static FIREFOX: ProfileSpec = ProfileSpec {
    cipher_suites: &[
        0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f,
        0x0035,
    ],
    groups: &[0x001d, 0x0017, 0x0018, 0x0019],
    signature_algorithms: &[
        0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601,
    ],
    alpn: &["h2", "http/1.1"],
    extensions: &[
        Extension::ServerName,
        Extension::ExtendedMasterSecret,
        Extension::RenegotiationInfo,
        Extension::SupportedGroups,
        Extension::EcPointFormats,
        Extension::SessionTicket,
        Extension::Alpn,
        Extension::StatusRequest,
        Extension::SignatureAlgorithms,
    ],
};

static SAFARI: ProfileSpec = ProfileSpec {
    cipher_suites: &[
        GREASE, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc024, 0xc023, 0xc028, 0xc027,
        0xc014, 0xc013, 0x009d, 0x009c, 0x003d, 0x003c, 0x0035, 0x002f,
    ],
    groups: &[GREASE, 0x001d, 0x0017, 0x0018, 0x0019],
    signature_algorithms: &[
        0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
    ],
    alpn: &["h2", "http/1.1"],
    extensions: &[
        Extension::Grease,
        Extension::ServerName,
        Extension::ExtendedMasterSecret,
        Extension::RenegotiationInfo,
        Extension::SupportedGroups,
        Extension::EcPointFormats,
        Extension::Alpn,
        Extension::StatusRequest,
        Extension::SignatureAlgorithms,
        Extension::Sct,
        Extension::GreaseLast,
    ],
};

const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// Per-hello GREASE draws; cipher-list and extension values differ, the way
/// BoringSSL rolls them.
struct GreaseDraw {
    cipher: u16,
    ext_first: u16,
    ext_last: u16,
}

impl GreaseDraw {
    fn roll<R: Rng>(rng: &mut R) -> Self {
        let cipher = *GREASE_VALUES.choose(rng).unwrap();
        let i = rng.gen_range(0..GREASE_VALUES.len());
        let j = (i + rng.gen_range(1..GREASE_VALUES.len())) % GREASE_VALUES.len();
        GreaseDraw {
            cipher,
            ext_first: GREASE_VALUES[i],
            ext_last: GREASE_VALUES[j],
        }
    }
}

/// Build the full ClientHello handshake message (4-byte handshake header
/// included) for `fingerprint`, with the covert `random` and `session_id`
/// already in place.
pub fn build_client_hello(
    fingerprint: Fingerprint,
    sni: &str,
    random: &[u8; 32],
    session_id: &[u8; 32],
) -> Vec<u8> {
    let profile = fingerprint.profile();
    let grease = GreaseDraw::roll(&mut rand::thread_rng());

    let mut msg = Vec::with_capacity(512 + 4);
    msg.put_u8(handshake_type::CLIENT_HELLO);
    with_u24_len(&mut msg, |body| {
        body.put_u16(crate::record::VERSION_TLS12);
        body.extend_from_slice(random);
        with_u8_len(body, |b| b.extend_from_slice(session_id));
        with_u16_len(body, |b| {
            for &suite in profile.cipher_suites {
                b.put_u16(if suite == GREASE { grease.cipher } else { suite });
            }
        });
        // null compression only
        with_u8_len(body, |b| b.put_u8(0));
        with_u16_len(body, |exts| {
            for &e in profile.extensions {
                write_extension(exts, e, profile, sni, &grease);
            }
        });
    });
    msg
}

fn write_extension(
    out: &mut Vec<u8>,
    extension: Extension,
    profile: &ProfileSpec,
    sni: &str,
    grease: &GreaseDraw,
) {
    match extension {
        Extension::Grease => {
            out.put_u16(grease.ext_first);
            out.put_u16(0);
        }
        Extension::GreaseLast => {
            out.put_u16(grease.ext_last);
            out.put_u16(1);
            out.put_u8(0);
        }
        Extension::ServerName => {
            out.put_u16(ext::SERVER_NAME);
            with_u16_len(out, |b| {
                with_u16_len(b, |list| {
                    list.put_u8(0); // host_name
                    with_u16_len(list, |n| n.extend_from_slice(sni.as_bytes()));
                });
            });
        }
        Extension::ExtendedMasterSecret => {
            out.put_u16(ext::EXTENDED_MASTER_SECRET);
            out.put_u16(0);
        }
        Extension::RenegotiationInfo => {
            out.put_u16(ext::RENEGOTIATION_INFO);
            out.put_u16(1);
            out.put_u8(0);
        }
        Extension::SupportedGroups => {
            out.put_u16(ext::SUPPORTED_GROUPS);
            with_u16_len(out, |b| {
                with_u16_len(b, |list| {
                    for &group in profile.groups {
                        list.put_u16(if group == GREASE { grease.ext_first } else { group });
                    }
                });
            });
        }
        Extension::EcPointFormats => {
            out.put_u16(ext::EC_POINT_FORMATS);
            out.put_u16(2);
            out.put_u8(1);
            out.put_u8(0); // uncompressed
        }
        Extension::SessionTicket => {
            // offered empty; tickets themselves are disabled
            out.put_u16(ext::SESSION_TICKET);
            out.put_u16(0);
        }
        Extension::Alpn => {
            out.put_u16(ext::ALPN);
            with_u16_len(out, |b| {
                with_u16_len(b, |list| {
                    for proto in profile.alpn {
                        with_u8_len(list, |p| p.extend_from_slice(proto.as_bytes()));
                    }
                });
            });
        }
        Extension::StatusRequest => {
            out.put_u16(ext::STATUS_REQUEST);
            out.put_u16(5);
            out.put_u8(1); // ocsp
            out.put_u16(0); // responder ids
            out.put_u16(0); // request extensions
        }
        Extension::SignatureAlgorithms => {
            out.put_u16(ext::SIGNATURE_ALGORITHMS);
            with_u16_len(out, |b| {
                with_u16_len(b, |list| {
                    for &alg in profile.signature_algorithms {
                        list.put_u16(alg);
                    }
                });
            });
        }
        Extension::Sct => {
            out.put_u16(ext::SCT);
            out.put_u16(0);
        }
        Extension::Padding => {
            // BoringSSL style: grow the handshake message to 512 bytes. At
            // this point `out` holds every other extension; the message is
            // out.len() + fixed fields, and the padding extension adds 4
            // bytes of header before its body.
            let fixed = 4 + 2 + 32 + 1 + 32; // hs header, version, random, session id
            let current = fixed
                + 2 + profile.cipher_suites.len() * 2
                + 2 // compression
                + 2 // extensions length
                + out.len()
                + 4; // padding extension header
            let pad = 512usize.saturating_sub(current).min(u16::MAX as usize);
            out.put_u16(ext::PADDING);
            out.put_u16(pad as u16);
            out.extend(std::iter::repeat(0u8).take(pad));
        }
    }
}

/// The two covert fields of an observed Client Hello. The server does not
/// run any further TLS logic on this path; the handshake itself is
/// byte-forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloFields {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
}

/// Extract `random` and `session_id` from a handshake-record payload
/// carrying a Client Hello. `None` for anything that does not parse that
/// far; callers treat that the same as a failed unmask.
pub fn parse_client_hello(payload: &[u8]) -> Option<ClientHelloFields> {
    let mut r = ByteReader::new(payload);
    if r.read_u8()? != handshake_type::CLIENT_HELLO {
        return None;
    }
    r.skip(3)?; // handshake length
    r.skip(2)?; // legacy version
    let random: [u8; 32] = r.take(32)?.try_into().ok()?;
    let session_id = r.read_u8_prefixed()?.to_vec();
    Some(ClientHelloFields { random, session_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> ([u8; 32], [u8; 32]) {
        let mut random = [0u8; 32];
        let mut session_id = [0u8; 32];
        for i in 0..32 {
            random[i] = i as u8;
            session_id[i] = 0xff - i as u8;
        }
        (random, session_id)
    }

    #[test]
    fn built_hello_round_trips_covert_fields() {
        let (random, session_id) = fields();
        for fp in [
            Fingerprint::Chrome,
            Fingerprint::Firefox,
            Fingerprint::Safari,
        ] {
            let hello = build_client_hello(fp, "www.example.com", &random, &session_id);
            let parsed = parse_client_hello(&hello).unwrap();
            assert_eq!(parsed.random, random);
            assert_eq!(parsed.session_id, session_id);
        }
    }

    #[test]
    fn handshake_length_field_is_consistent() {
        let (random, session_id) = fields();
        let hello = build_client_hello(Fingerprint::Chrome, "example.com", &random, &session_id);
        let len = ((hello[1] as usize) << 16) | ((hello[2] as usize) << 8) | hello[3] as usize;
        assert_eq!(hello.len(), 4 + len);
    }

    #[test]
    fn chrome_hello_is_padded_to_512() {
        let (random, session_id) = fields();
        let hello = build_client_hello(Fingerprint::Chrome, "a.example", &random, &session_id);
        assert_eq!(hello.len(), 512);
    }

    #[test]
    fn firefox_offers_no_grease() {
        let (random, session_id) = fields();
        let hello = build_client_hello(Fingerprint::Firefox, "example.com", &random, &session_id);
        // cipher list starts right after session id
        let ciphers_at = 4 + 2 + 32 + 1 + 32;
        let n = u16::from_be_bytes([hello[ciphers_at], hello[ciphers_at + 1]]) as usize;
        assert_eq!(n / 2, FIREFOX.cipher_suites.len());
        for c in hello[ciphers_at + 2..ciphers_at + 2 + n].chunks(2) {
            let suite = u16::from_be_bytes([c[0], c[1]]);
            assert_ne!(suite & 0x0f0f, 0x0a0a, "unexpected GREASE suite");
        }
    }

    #[test]
    fn unknown_names_fall_back_to_chrome() {
        assert_eq!(Fingerprint::from_name("qq"), Fingerprint::Chrome);
        assert_eq!(Fingerprint::from_name("netscape"), Fingerprint::Chrome);
        assert_eq!(Fingerprint::from_name("ios"), Fingerprint::Safari);
    }

    #[test]
    fn parse_rejects_non_client_hello() {
        let payload = [handshake_type::SERVER_HELLO, 0, 0, 2, 3, 3];
        assert!(parse_client_hello(&payload).is_none());
    }
}
