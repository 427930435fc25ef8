//! Handshake-message framing: reassembly of messages that span or share
//! records, and the writers for the client's second flight.

use std::io;

use tokio::io::AsyncRead;

use crate::record::{content_type, handshake_type, TlsRecord};
use crate::utils::{with_u24_len, with_u8_len, ByteReader, PutExt};

const HANDSHAKE_HEADER_LEN: usize = 4;

/// One handshake message, 4-byte header included (the transcript hash runs
/// over exactly these bytes).
pub(crate) struct HandshakeMsg {
    pub typ: u8,
    pub raw: Vec<u8>,
}

impl HandshakeMsg {
    pub fn body(&self) -> &[u8] {
        &self.raw[HANDSHAKE_HEADER_LEN..]
    }
}

pub(crate) enum Flight {
    Msg(HandshakeMsg),
    ChangeCipherSpec,
}

/// Reassembles handshake messages out of handshake records; a message may
/// span several records and a record may carry several messages.
pub(crate) struct MessageReader {
    buf: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        MessageReader { buf: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_msg(&mut self) -> Option<HandshakeMsg> {
        if self.buf.len() < HANDSHAKE_HEADER_LEN {
            return None;
        }
        let len = ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
        let total = HANDSHAKE_HEADER_LEN + len;
        if self.buf.len() < total {
            return None;
        }
        let raw: Vec<u8> = self.buf.drain(..total).collect();
        Some(HandshakeMsg { typ: raw[0], raw })
    }

    pub async fn next<S: AsyncRead + Unpin>(&mut self, io: &mut S) -> io::Result<HandshakeMsg> {
        match self.next_allowing_ccs(io).await? {
            Flight::Msg(msg) => Ok(msg),
            Flight::ChangeCipherSpec => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "tls: unexpected change_cipher_spec",
            )),
        }
    }

    pub async fn next_allowing_ccs<S: AsyncRead + Unpin>(
        &mut self,
        io: &mut S,
    ) -> io::Result<Flight> {
        loop {
            if let Some(msg) = self.take_msg() {
                return Ok(Flight::Msg(msg));
            }
            let record = TlsRecord::read_from(io).await?;
            match record.content_type {
                content_type::HANDSHAKE => self.buf.extend_from_slice(&record.payload),
                content_type::CHANGE_CIPHER_SPEC => {
                    if !self.buf.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "tls: change_cipher_spec inside a handshake message",
                        ));
                    }
                    return Ok(Flight::ChangeCipherSpec);
                }
                content_type::ALERT => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("tls: alert {:?}", &record.payload),
                    ));
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("tls: unexpected record type {other} during handshake"),
                    ));
                }
            }
        }
    }
}

pub(crate) struct ServerHello {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub extended_master_secret: bool,
    pub selected_version: Option<u16>,
}

pub(crate) fn parse_server_hello(body: &[u8]) -> Option<ServerHello> {
    let mut r = ByteReader::new(body);
    let version = r.read_u16()?;
    let random: [u8; 32] = r.take(32)?.try_into().ok()?;
    let session_id = r.read_u8_prefixed()?.to_vec();
    let cipher_suite = r.read_u16()?;
    let _compression = r.read_u8()?;

    let mut extended_master_secret = false;
    let mut selected_version = None;
    if !r.is_empty() {
        let mut exts = ByteReader::new(r.read_u16_prefixed()?);
        while !exts.is_empty() {
            let typ = exts.read_u16()?;
            let data = exts.read_u16_prefixed()?;
            match typ {
                0x0017 => extended_master_secret = true,
                // supported_versions: the server's selected version
                0x002b if data.len() == 2 => {
                    selected_version = Some(u16::from_be_bytes([data[0], data[1]]))
                }
                _ => {}
            }
        }
    }
    Some(ServerHello {
        version,
        random,
        session_id,
        cipher_suite,
        extended_master_secret,
        selected_version,
    })
}

/// DER certificates, leaf first.
pub(crate) fn parse_certificates(body: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut r = ByteReader::new(body);
    let total = r.read_u24()?;
    let mut list = ByteReader::new(r.take(total)?);
    let mut certs = Vec::new();
    while !list.is_empty() {
        let len = list.read_u24()?;
        certs.push(list.take(len)?.to_vec());
    }
    Some(certs)
}

pub(crate) struct ServerKeyExchange {
    pub curve: u16,
    pub public: Vec<u8>,
    pub scheme: u16,
    pub signature: Vec<u8>,
    /// The signed ECDHE params: curve type, named curve, public point.
    pub params: Vec<u8>,
}

pub(crate) fn parse_server_key_exchange(body: &[u8]) -> Option<ServerKeyExchange> {
    let mut r = ByteReader::new(body);
    if r.read_u8()? != 3 {
        // only named_curve params are signed in a form we accept
        return None;
    }
    let curve = r.read_u16()?;
    let public = r.read_u8_prefixed()?.to_vec();
    let params_len = 1 + 2 + 1 + public.len();
    let params = body.get(..params_len)?.to_vec();
    let scheme = r.read_u16()?;
    let signature = r.read_u16_prefixed()?.to_vec();
    Some(ServerKeyExchange {
        curve,
        public,
        scheme,
        signature,
        params,
    })
}

/// ClientKeyExchange carrying an ECDHE public point.
pub(crate) fn client_key_exchange(point: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HANDSHAKE_HEADER_LEN + 1 + point.len());
    msg.put_u8(handshake_type::CLIENT_KEY_EXCHANGE);
    with_u24_len(&mut msg, |body| {
        with_u8_len(body, |b| b.extend_from_slice(point));
    });
    msg
}

pub(crate) fn finished(verify_data: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HANDSHAKE_HEADER_LEN + verify_data.len());
    msg.put_u8(handshake_type::FINISHED);
    with_u24_len(&mut msg, |body| body.extend_from_slice(verify_data));
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VERSION_TLS12;

    fn msg(typ: u8, body: &[u8]) -> Vec<u8> {
        let mut m = vec![typ];
        with_u24_len(&mut m, |b| b.extend_from_slice(body));
        m
    }

    #[tokio::test]
    async fn messages_coalesced_in_one_record() {
        let mut payload = msg(handshake_type::SERVER_HELLO, &[0; 40]);
        payload.extend_from_slice(&msg(handshake_type::SERVER_HELLO_DONE, &[]));
        let wire = TlsRecord::new(content_type::HANDSHAKE, VERSION_TLS12, payload).marshal();
        let mut reader = MessageReader::new();
        let mut io = &wire[..];
        let first = reader.next(&mut io).await.unwrap();
        assert_eq!(first.typ, handshake_type::SERVER_HELLO);
        let second = reader.next(&mut io).await.unwrap();
        assert_eq!(second.typ, handshake_type::SERVER_HELLO_DONE);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn message_split_across_records() {
        let whole = msg(handshake_type::CERTIFICATE, &[0xaa; 100]);
        let mut wire = TlsRecord::new(
            content_type::HANDSHAKE,
            VERSION_TLS12,
            whole[..30].to_vec(),
        )
        .marshal();
        wire.extend_from_slice(
            &TlsRecord::new(content_type::HANDSHAKE, VERSION_TLS12, whole[30..].to_vec())
                .marshal(),
        );
        let mut reader = MessageReader::new();
        let mut io = &wire[..];
        let got = reader.next(&mut io).await.unwrap();
        assert_eq!(got.raw, whole);
    }

    #[test]
    fn server_hello_extensions() {
        let mut body = Vec::new();
        body.put_u16(VERSION_TLS12);
        body.extend_from_slice(&[7u8; 32]);
        with_u8_len(&mut body, |b| b.extend_from_slice(&[9u8; 32]));
        body.put_u16(0xc02f);
        body.put_u8(0);
        crate::utils::with_u16_len(&mut body, |exts| {
            exts.put_u16(0xff01);
            exts.put_u16(1);
            exts.put_u8(0);
            exts.put_u16(0x0017);
            exts.put_u16(0);
        });
        let sh = parse_server_hello(&body).unwrap();
        assert_eq!(sh.version, VERSION_TLS12);
        assert_eq!(sh.cipher_suite, 0xc02f);
        assert!(sh.extended_master_secret);
        assert_eq!(sh.selected_version, None);
        assert_eq!(sh.session_id.len(), 32);
    }

    #[test]
    fn server_key_exchange_params_cover_point() {
        let mut body = vec![3u8];
        body.put_u16(0x001d);
        with_u8_len(&mut body, |b| b.extend_from_slice(&[0x11; 32]));
        body.put_u16(0x0403);
        crate::utils::with_u16_len(&mut body, |b| b.extend_from_slice(&[0x22; 70]));
        let skx = parse_server_key_exchange(&body).unwrap();
        assert_eq!(skx.curve, 0x001d);
        assert_eq!(skx.public.len(), 32);
        assert_eq!(skx.scheme, 0x0403);
        assert_eq!(skx.signature.len(), 70);
        assert_eq!(skx.params.len(), 1 + 2 + 1 + 32);
        assert_eq!(&skx.params[4..], &skx.public[..]);
    }

    #[test]
    fn certificate_list_parses() {
        let mut body = Vec::new();
        with_u24_len(&mut body, |list| {
            with_u24_len(list, |c| c.extend_from_slice(b"leaf"));
            with_u24_len(list, |c| c.extend_from_slice(b"intermediate"));
        });
        let certs = parse_certificates(&body).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0], b"leaf");
    }
}
