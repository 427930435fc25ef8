//! Post-handshake transport: a byte stream framed as TLS 1.2 application
//! data. Each record carries `seq(8) || AEAD(ciphertext, tag)` with the seq
//! doubling as the AEAD nonce, mirroring TLS 1.2's own explicit-nonce
//! layout. Read and write state are disjoint, so the halves of
//! `tokio::io::split` can run concurrently, one reader and one writer.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes_gcm::aead::consts::U8;
use aes_gcm::aead::Aead;
use aes_gcm::Nonce;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::common::{inc_seq, Overlay, SEQ_LEN};
use crate::crypto::CovertAead;
use crate::error::Error;
use crate::record::{content_type, TlsRecord, RECORD_HEADER_LEN, VERSION_TLS12};

const TAG_LEN: usize = 16;
/// Largest plaintext chunk per record: the record length field must hold
/// `seq + ciphertext + tag`.
pub(crate) const MAX_CHUNK: usize = 0xFFFF - SEQ_LEN - TAG_LEN - RECORD_HEADER_LEN;

enum ReadState {
    Header { filled: usize },
    Payload { buf: Vec<u8>, filled: usize },
}

/// An authenticated, encrypted duplex stream dressed as TLS application
/// data.
pub struct SealedStream<S = TcpStream> {
    io: S,
    aead: CovertAead,
    overlay: u8,
    write_seq: [u8; SEQ_LEN],
    header: [u8; RECORD_HEADER_LEN],
    read_state: ReadState,
    plaintext: Vec<u8>,
    plaintext_off: usize,
    wire: Vec<u8>,
    wire_off: usize,
}

impl<S> SealedStream<S> {
    /// Wrap `io` after a completed covert handshake. `handshake_seq` is the
    /// seq consumed by the signaling exchange; the first sealed record uses
    /// its increment.
    pub(crate) fn new(io: S, aead: CovertAead, overlay: u8, handshake_seq: [u8; SEQ_LEN]) -> Self {
        let mut write_seq = handshake_seq;
        inc_seq(&mut write_seq);
        SealedStream {
            io,
            aead,
            overlay,
            write_seq,
            header: [0u8; RECORD_HEADER_LEN],
            read_state: ReadState::Header { filled: 0 },
            plaintext: Vec::new(),
            plaintext_off: 0,
            wire: Vec::new(),
            wire_off: 0,
        }
    }

    pub fn overlay(&self) -> u8 {
        self.overlay
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }
}

impl SealedStream<TcpStream> {
    pub fn remote_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.io.peer_addr()
    }
}

impl<S> Overlay for SealedStream<S> {
    fn overlay(&self) -> u8 {
        self.overlay
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SealedStream<S> {
    /// Drive the buffered wire bytes into the socket.
    fn poll_flush_wire(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.wire_off < self.wire.len() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.wire[self.wire_off..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wire_off += n;
        }
        self.wire.clear();
        self.wire_off = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SealedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        ready!(me.poll_flush_wire(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_CHUNK)];
        let ct = me
            .aead
            .encrypt(Nonce::<U8>::from_slice(&me.write_seq), chunk)
            .map_err(|_| Error::VerifyFailed.into_io())?;
        let mut payload = Vec::with_capacity(SEQ_LEN + ct.len());
        payload.extend_from_slice(&me.write_seq);
        payload.extend_from_slice(&ct);
        inc_seq(&mut me.write_seq);
        me.wire = TlsRecord::new(content_type::APPLICATION_DATA, VERSION_TLS12, payload).marshal();
        me.wire_off = 0;

        // opportunistic: the chunk is committed either way
        if let Poll::Ready(Err(e)) = me.poll_flush_wire(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_flush_wire(cx))?;
        Pin::new(&mut me.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_flush_wire(cx))?;
        Pin::new(&mut me.io).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SealedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            // serve buffered plaintext first; it stays deliverable even if a
            // later record fails to open
            if me.plaintext_off < me.plaintext.len() {
                let n = (me.plaintext.len() - me.plaintext_off).min(out.remaining());
                out.put_slice(&me.plaintext[me.plaintext_off..me.plaintext_off + n]);
                me.plaintext_off += n;
                if me.plaintext_off == me.plaintext.len() {
                    me.plaintext.clear();
                    me.plaintext_off = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut me.read_state {
                ReadState::Header { filled } => {
                    while *filled < RECORD_HEADER_LEN {
                        let mut rb = ReadBuf::new(&mut me.header[*filled..]);
                        ready!(Pin::new(&mut me.io).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            if *filled == 0 {
                                // clean EOF on a record boundary
                                return Poll::Ready(Ok(()));
                            }
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    let (content_type, version, len) = TlsRecord::parse_header(&me.header)?;
                    if content_type != content_type::APPLICATION_DATA || version != VERSION_TLS12 {
                        return Poll::Ready(Err(Error::VerifyFailed.into_io()));
                    }
                    if len < SEQ_LEN + TAG_LEN {
                        return Poll::Ready(Err(Error::DecryptFailed.into_io()));
                    }
                    me.read_state = ReadState::Payload {
                        buf: vec![0u8; len],
                        filled: 0,
                    };
                }
                ReadState::Payload { buf, filled } => {
                    while *filled < buf.len() {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut me.io).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    // the transmitted seq is the nonce; self-describing records
                    let pt = me
                        .aead
                        .decrypt(Nonce::<U8>::from_slice(&buf[..SEQ_LEN]), &buf[SEQ_LEN..])
                        .map_err(|_| Error::DecryptFailed.into_io())?;
                    me.plaintext = pt;
                    me.plaintext_off = 0;
                    me.read_state = ReadState::Header { filled: 0 };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SEQ_ONE;
    use crate::crypto::covert_aead;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair() -> (SealedStream<DuplexStream>, SealedStream<DuplexStream>) {
        let key = [0x33u8; 32];
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            SealedStream::new(a, covert_aead(&key), 0x17, SEQ_ONE),
            SealedStream::new(b, covert_aead(&key), 0x17, [0, 0, 0, 0, 0, 0, 0, 9]),
        )
    }

    #[tokio::test]
    async fn round_trips_bytes_across_chunked_reads() {
        let (mut a, mut b) = pair();
        a.write_all(b"ping").await.unwrap();
        a.flush().await.unwrap();
        let mut got = [0u8; 4];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        // reply, read in two pieces
        b.write_all(b"pong!").await.unwrap();
        b.flush().await.unwrap();
        let mut head = [0u8; 2];
        a.read_exact(&mut head).await.unwrap();
        let mut tail = [0u8; 3];
        a.read_exact(&mut tail).await.unwrap();
        assert_eq!(&head, b"po");
        assert_eq!(&tail, b"ng!");
    }

    #[tokio::test]
    async fn large_writes_split_into_max_chunks() {
        let (mut a, mut b) = pair();
        let data: Vec<u8> = (0..MAX_CHUNK + 1234).map(|i| i as u8).collect();

        let writer = tokio::spawn(async move {
            a.write_all(&data).await.unwrap();
            a.flush().await.unwrap();
            (a, data)
        });
        let mut got = vec![0u8; MAX_CHUNK + 1234];
        b.read_exact(&mut got).await.unwrap();
        let (_a, data) = writer.await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn wire_records_have_monotonic_seq() {
        let key = [0x44u8; 32];
        let (a, mut raw) = tokio::io::duplex(256 * 1024);
        let mut sealed = SealedStream::new(a, covert_aead(&key), 0, SEQ_ONE);

        for _ in 0..3 {
            sealed.write_all(b"x").await.unwrap();
        }
        sealed.flush().await.unwrap();

        // handshake seq 1, so sealed records start at 2
        for expect in 2u64..5 {
            let record = TlsRecord::read_from(&mut raw).await.unwrap();
            assert_eq!(record.content_type, content_type::APPLICATION_DATA);
            assert_eq!(record.version, VERSION_TLS12);
            assert_eq!(&record.payload[..8], &expect.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn tampered_record_is_decrypt_failed_but_buffer_drains() {
        let key = [0x55u8; 32];
        let aead = covert_aead(&key);
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let mut sealed = SealedStream::new(a, covert_aead(&key), 0, SEQ_ONE);

        // one good record arriving from the peer
        let good = {
            let seq = [0, 0, 0, 0, 0, 0, 0, 2u8];
            let ct = aead
                .encrypt(Nonce::<U8>::from_slice(&seq), b"alpha".as_slice())
                .unwrap();
            let mut payload = seq.to_vec();
            payload.extend_from_slice(&ct);
            TlsRecord::new(content_type::APPLICATION_DATA, VERSION_TLS12, payload)
        };
        raw.write_all(&good.marshal()).await.unwrap();
        // and one corrupted one
        let mut bad = good.marshal();
        let at = bad.len() - 1;
        bad[at] ^= 0xff;
        raw.write_all(&bad).await.unwrap();

        let mut got = [0u8; 2];
        sealed.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"al");

        let mut rest = [0u8; 3];
        sealed.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"pha");

        let err = sealed.read_exact(&mut [0u8; 1]).await.unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<Error>());
        assert!(matches!(inner, Some(Error::DecryptFailed)));
    }

    #[tokio::test]
    async fn non_application_data_record_fails_verify() {
        let key = [0x66u8; 32];
        let (a, mut raw) = tokio::io::duplex(4096);
        let mut sealed = SealedStream::new(a, covert_aead(&key), 0, SEQ_ONE);
        raw.write_all(
            &TlsRecord::new(content_type::HANDSHAKE, VERSION_TLS12, vec![0; 32]).marshal(),
        )
        .await
        .unwrap();
        let err = sealed.read_exact(&mut [0u8; 1]).await.unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<Error>());
        assert!(matches!(inner, Some(Error::VerifyFailed)));
    }

    #[tokio::test]
    async fn overlay_accessor() {
        let (a, _b) = pair();
        assert_eq!(Overlay::overlay(&a), 0x17);
    }
}
