use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content encoding stamped on every published message.
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Header carrying the retry attempt count of a publish.
pub const ATTEMPT_HEADER: &str = "num";

/// Message container used by the delivery pipeline.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is transport-agnostic: the publish path uses it with [`PublishHeaders`],
/// but any header type works.
///
/// ## Example
///
/// ```rust
/// use courier::Envelope;
///
/// let envelope = Envelope {
///     headers: "orders.created",
///     message: r#"{"id":1}"#,
/// };
///
/// // or, equivalently
/// let envelope: Envelope<_, _> = ("orders.created", r#"{"id":1}"#).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Value of a custom message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl HeaderValue {
    /// Integer view of the value. Text holding a decimal integer is accepted
    /// because some brokers hand numeric headers back as strings.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(n) => Some(*n),
            HeaderValue::Text(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_owned())
    }
}

/// Custom headers attached to a message, keyed by name.
pub type HeaderMap = BTreeMap<String, HeaderValue>;

/// Broker-facing metadata of a single publish attempt.
///
/// Built once per attempt by [`prepare_send`](crate::correlation::prepare_send)
/// and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishHeaders {
    message_id: String,
    exchange: String,
    routing_key: String,
    attributes: HeaderMap,
}

impl PublishHeaders {
    pub(crate) fn new(message_id: String, exchange: &str, routing_key: &str, attempt: i64) -> Self {
        let mut attributes = HeaderMap::new();
        attributes.insert(ATTEMPT_HEADER.to_owned(), HeaderValue::Int(attempt));
        Self {
            message_id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            attributes,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Always [`CONTENT_TYPE_JSON`].
    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    /// Always [`CONTENT_ENCODING_UTF8`].
    pub fn content_encoding(&self) -> &'static str {
        CONTENT_ENCODING_UTF8
    }

    /// Custom headers, including the attempt count under [`ATTEMPT_HEADER`].
    pub fn attributes(&self) -> &HeaderMap {
        &self.attributes
    }

    pub fn attempt(&self) -> Option<i64> {
        self.attributes.get(ATTEMPT_HEADER).and_then(HeaderValue::as_int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_headers_carry_fixed_content_metadata() {
        let headers = PublishHeaders::new("m1".into(), "ex", "rk", 3);

        assert_eq!(headers.content_type(), "application/json");
        assert_eq!(headers.content_encoding(), "utf-8");
        assert_eq!(headers.attempt(), Some(3));
        assert_eq!(
            headers.attributes().get(ATTEMPT_HEADER),
            Some(&HeaderValue::Int(3))
        );
    }

    #[test]
    fn header_value_reads_numeric_text() {
        assert_eq!(HeaderValue::from("7").as_int(), Some(7));
        assert_eq!(HeaderValue::from("seven").as_int(), None);
        assert_eq!(HeaderValue::Bool(true).as_int(), None);
    }
}
