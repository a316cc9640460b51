//! Message id assignment and correlation of broker outcomes.
//!
//! Every publish attempt gets a message id, either the one supplied by the
//! caller (retries keep their id) or a fresh UUID v4. The same id is used as
//! the [`CorrelationToken`] handed to the transport, so asynchronous
//! confirmations can be joined back to the send that produced them.

use crate::{
    Envelope,
    envelope::{HeaderMap, PublishHeaders},
};

/// Identifier linking an asynchronous broker outcome to its originating send.
///
/// The token always equals the message id. When the broker hands an
/// undeliverable message back, the transport attaches the returned detail to
/// the token before reporting the negative confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationToken {
    message_id: String,
    returned: Option<Box<ReturnedMessage>>,
}

impl CorrelationToken {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            returned: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Detail of the message the broker returned, if any.
    pub fn returned(&self) -> Option<&ReturnedMessage> {
        self.returned.as_deref()
    }

    /// Attach the returned message detail to this token.
    pub fn with_returned(mut self, returned: ReturnedMessage) -> Self {
        self.returned = Some(Box::new(returned));
        self
    }
}

/// A message the broker accepted but could not route to any queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the broker received.
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    /// Per-message TTL, when one was set.
    pub expiration: Option<String>,
    /// Custom headers as the broker handed them back.
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Resolve the message id and build the envelope and token of one attempt.
///
/// An absent or empty `message_id` is replaced by a random UUID v4; anything
/// else is reused verbatim. The attempt count is written to the `num` header.
pub fn prepare_send<M>(
    message_id: Option<&str>,
    exchange: &str,
    routing_key: &str,
    body: M,
    attempt: i64,
) -> (Envelope<PublishHeaders, M>, CorrelationToken) {
    let message_id = match message_id {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    let token = CorrelationToken::new(message_id.clone());
    let envelope = Envelope {
        headers: PublishHeaders::new(message_id, exchange, routing_key, attempt),
        message: body,
    };

    (envelope, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_message_id_is_reused_verbatim() {
        let (envelope, token) = prepare_send(Some("m1"), "ex", "rk", "{\"a\":1}", 2);

        assert_eq!(envelope.headers.message_id(), "m1");
        assert_eq!(token.message_id(), "m1");
        assert_eq!(envelope.headers.exchange(), "ex");
        assert_eq!(envelope.headers.routing_key(), "rk");
        assert_eq!(envelope.headers.attempt(), Some(2));
        assert_eq!(envelope.message, "{\"a\":1}");
        assert!(token.returned().is_none());
    }

    #[test]
    fn missing_message_id_generates_distinct_uuids() {
        let (first, first_token) = prepare_send(None, "ex", "rk", (), 0);
        let (second, _) = prepare_send(Some(""), "ex", "rk", (), 0);

        let first_id = uuid::Uuid::parse_str(first.headers.message_id()).unwrap();
        let second_id = uuid::Uuid::parse_str(second.headers.message_id()).unwrap();

        assert_eq!(first_id.get_version_num(), 4);
        assert_ne!(first_id, second_id);
        assert_eq!(first_token.message_id(), first.headers.message_id());
    }

    #[test]
    fn returned_detail_rides_on_the_token() {
        let returned = ReturnedMessage {
            exchange: "ex".into(),
            routing_key: "rk".into(),
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            expiration: None,
            headers: HeaderMap::new(),
            body: b"{}".to_vec(),
        };

        let token = CorrelationToken::new("m1").with_returned(returned.clone());

        assert_eq!(token.returned(), Some(&returned));
    }
}
