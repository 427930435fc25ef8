//! Handshake-order matcher: validates that a stream of records follows a
//! required sequence of `{record type, optional handshake type, optional}`
//! positions. Used by the server while it bridges the TLS 1.2 exchange
//! between a covert client and the camouflage site.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::record::{content_type, handshake_type, TlsRecord};

#[derive(Debug, Clone, Copy)]
pub struct RecordRule {
    pub content_type: u8,
    /// For unencrypted handshake records, the required first payload byte.
    pub handshake_type: Option<u8>,
    /// Skipped (not consumed) when a later non-optional position matches.
    pub optional: bool,
}

impl RecordRule {
    const fn of(content_type: u8) -> Self {
        RecordRule {
            content_type,
            handshake_type: None,
            optional: false,
        }
    }

    const fn handshake(ht: u8) -> Self {
        RecordRule {
            content_type: content_type::HANDSHAKE,
            handshake_type: Some(ht),
            optional: false,
        }
    }

    const fn opt(mut self) -> Self {
        self.optional = true;
        self
    }

    fn matches(&self, record: &TlsRecord) -> bool {
        if record.content_type != self.content_type {
            return false;
        }
        match self.handshake_type {
            Some(ht) => record.handshake_type() == Some(ht),
            None => true,
        }
    }
}

/// Server flight one: ServerHello .. ServerHelloDone.
pub const SERVER_HELLO_ORDER: &[RecordRule] = &[
    RecordRule::handshake(handshake_type::SERVER_HELLO),
    RecordRule::handshake(handshake_type::CERTIFICATE),
    RecordRule::handshake(handshake_type::SERVER_KEY_EXCHANGE),
    RecordRule::handshake(handshake_type::SERVER_HELLO_DONE),
];

/// Client flight two: optional client auth, key exchange, cipher switch,
/// then the encrypted Finished (opaque, so no handshake type to test).
pub const CLIENT_REPLY_ORDER: &[RecordRule] = &[
    RecordRule::handshake(handshake_type::CERTIFICATE).opt(),
    RecordRule::handshake(handshake_type::CLIENT_KEY_EXCHANGE),
    RecordRule::handshake(handshake_type::CERTIFICATE_VERIFY).opt(),
    RecordRule::of(content_type::CHANGE_CIPHER_SPEC),
    RecordRule::of(content_type::HANDSHAKE),
];

/// Server flight three: optional ticket, cipher switch, encrypted Finished.
pub const SERVER_FINISH_ORDER: &[RecordRule] = &[
    RecordRule::handshake(handshake_type::NEW_SESSION_TICKET).opt(),
    RecordRule::of(content_type::CHANGE_CIPHER_SPEC),
    RecordRule::of(content_type::HANDSHAKE),
];

/// Position tracker over one order. Feed records as they arrive; `advance`
/// reports completion or mismatch.
pub(crate) struct OrderTracker<'a> {
    order: &'a [RecordRule],
    pos: usize,
}

impl<'a> OrderTracker<'a> {
    pub fn new(order: &'a [RecordRule]) -> Self {
        OrderTracker { order, pos: 0 }
    }

    /// `Ok(true)` once the whole order is satisfied, `Ok(false)` when more
    /// records are needed, `Err` on a non-optional mismatch.
    pub fn advance(&mut self, record: &TlsRecord) -> io::Result<bool> {
        let mut pos = self.pos;
        loop {
            if pos == self.order.len() {
                // trailing optionals all skipped by this record
                self.pos = pos;
                break;
            }
            let rule = self.order[pos];
            if rule.matches(record) {
                self.pos = pos + 1;
                break;
            }
            if rule.optional {
                trace!(?rule, "skipping optional record position");
                pos += 1;
                continue;
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected record: want {:?}, got type {} len {}",
                    rule,
                    record.content_type,
                    record.payload.len()
                ),
            ));
        }
        Ok(self.pos == self.order.len())
    }
}

/// Consume records from `reader` until `order` is satisfied; returns every
/// record read, matched or skipped-over.
pub async fn wait_for_order<R: AsyncRead + Unpin>(
    reader: &mut R,
    order: &[RecordRule],
) -> io::Result<Vec<TlsRecord>> {
    let mut tracker = OrderTracker::new(order);
    let mut records = Vec::with_capacity(order.len());
    loop {
        let record = TlsRecord::read_from(reader).await?;
        let done = tracker.advance(&record)?;
        records.push(record);
        if done {
            return Ok(records);
        }
    }
}

/// Like [`wait_for_order`], but forwards every record to `relay` before
/// matching it, so the two ends of a bridged handshake observe the exact
/// transcript whether or not the match succeeds.
pub(crate) async fn wait_for_order_relaying<R, W>(
    reader: &mut R,
    relay: &mut W,
    order: &[RecordRule],
) -> io::Result<Vec<TlsRecord>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tracker = OrderTracker::new(order);
    let mut records = Vec::with_capacity(order.len());
    loop {
        let record = TlsRecord::read_from(reader).await?;
        relay.write_all(&record.marshal()).await?;
        let done = tracker.advance(&record)?;
        records.push(record);
        if done {
            return Ok(records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VERSION_TLS12;

    fn hs(ht: u8) -> TlsRecord {
        TlsRecord::new(content_type::HANDSHAKE, VERSION_TLS12, vec![ht, 0, 0, 0])
    }

    fn ccs() -> TlsRecord {
        TlsRecord::new(content_type::CHANGE_CIPHER_SPEC, VERSION_TLS12, vec![1])
    }

    fn wire(records: &[TlsRecord]) -> Vec<u8> {
        records.iter().flat_map(|r| r.marshal()).collect()
    }

    #[tokio::test]
    async fn server_hello_order_matches_strict_sequence() {
        let stream = wire(&[
            hs(handshake_type::SERVER_HELLO),
            hs(handshake_type::CERTIFICATE),
            hs(handshake_type::SERVER_KEY_EXCHANGE),
            hs(handshake_type::SERVER_HELLO_DONE),
        ]);
        let records = wait_for_order(&mut &stream[..], SERVER_HELLO_ORDER)
            .await
            .unwrap();
        assert_eq!(records.len(), 4);
    }

    #[tokio::test]
    async fn optional_positions_are_skipped_not_consumed() {
        // no client Certificate, no CertificateVerify
        let stream = wire(&[hs(handshake_type::CLIENT_KEY_EXCHANGE), ccs(), hs(20)]);
        let records = wait_for_order(&mut &stream[..], CLIENT_REPLY_ORDER)
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn optional_positions_match_when_present() {
        let stream = wire(&[
            hs(handshake_type::CERTIFICATE),
            hs(handshake_type::CLIENT_KEY_EXCHANGE),
            hs(handshake_type::CERTIFICATE_VERIFY),
            ccs(),
            hs(20),
        ]);
        let records = wait_for_order(&mut &stream[..], CLIENT_REPLY_ORDER)
            .await
            .unwrap();
        assert_eq!(records.len(), 5);
    }

    #[tokio::test]
    async fn non_optional_mismatch_fails() {
        let stream = wire(&[
            hs(handshake_type::SERVER_HELLO),
            hs(handshake_type::SERVER_KEY_EXCHANGE),
        ]);
        let err = wait_for_order(&mut &stream[..], SERVER_HELLO_ORDER)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn handshake_rule_requires_handshake_content_type() {
        // right first byte, wrong content type
        let fake = TlsRecord::new(
            content_type::APPLICATION_DATA,
            VERSION_TLS12,
            vec![handshake_type::SERVER_HELLO, 0, 0, 0],
        );
        let stream = wire(&[fake]);
        assert!(wait_for_order(&mut &stream[..], SERVER_HELLO_ORDER)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn ticket_then_finish_sequence() {
        let stream = wire(&[hs(handshake_type::NEW_SESSION_TICKET), ccs(), hs(20)]);
        let records = wait_for_order(&mut &stream[..], SERVER_FINISH_ORDER)
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        // without the ticket
        let stream = wire(&[ccs(), hs(20)]);
        let records = wait_for_order(&mut &stream[..], SERVER_FINISH_ORDER)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn relaying_variant_forwards_all_records() {
        let records = vec![ccs(), hs(20)];
        let stream = wire(&records);
        let mut relayed = Vec::new();
        let got = wait_for_order_relaying(&mut &stream[..], &mut relayed, SERVER_FINISH_ORDER)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(relayed, stream);
    }
}
