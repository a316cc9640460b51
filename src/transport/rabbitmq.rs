use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties,
    message::BasicReturnMessage,
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;

use crate::{
    correlation::{CorrelationToken, ReturnedMessage},
    envelope::{HeaderMap, HeaderValue},
    transport::{CallbackRegistry, Confirms, Publication, Sender, ToBytes},
};

/// RabbitMQ publisher backend.
///
/// Publishes through a shared `lapin::Channel` in publisher-confirm mode with
/// the `mandatory` flag set, so the broker reports both whether it took the
/// message and whether any queue received it.
///
/// ## Design
///
/// - Exchange and routing key come from the envelope headers
/// - Content type, encoding, message id and custom headers map onto AMQP
///   message properties
/// - `send` returns once the broker has the frame; the confirmation is awaited
///   on a spawned task and reported through the [`CallbackRegistry`]
///
/// The channel is wrapped in `Arc<Mutex<_>>` so concurrent publishes are
/// serialised and confirmation sequence numbers stay in publish order.
#[derive(Clone)]
pub struct RabbitMq {
    channel: Arc<Mutex<lapin::Channel>>,
    callbacks: CallbackRegistry,
}

impl RabbitMq {
    /// Switch the channel to confirm mode and wrap it.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(channel: lapin::Channel) -> Result<Self, lapin::Error> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
            callbacks: CallbackRegistry::default(),
        })
    }
}

impl Confirms for RabbitMq {
    fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }
}

#[async_trait]
impl<M> Sender<M> for RabbitMq
where
    M: ToBytes + Send + Sync + 'static,
{
    type Error = lapin::Error;

    /// Publish a message to RabbitMQ.
    ///
    /// An error here means the channel refused the publish. Everything the
    /// broker says afterwards goes to the callbacks.
    #[tracing::instrument(skip_all, fields(message_id = %publication.token.message_id()))]
    async fn send(&mut self, publication: Publication<M>) -> Result<(), Self::Error> {
        let Publication { envelope, token } = publication;
        let headers = &envelope.headers;

        let mut amqp_headers = FieldTable::default();
        for (k, v) in headers.attributes() {
            amqp_headers.insert(ShortString::from(k.clone()), to_amqp(v));
        }

        let properties = BasicProperties::default()
            .with_content_type(headers.content_type().into())
            .with_content_encoding(headers.content_encoding().into())
            .with_message_id(headers.message_id().into())
            .with_headers(amqp_headers);

        let confirm = {
            let channel = self.channel.lock().await;
            channel
                .basic_publish(
                    headers.exchange(),
                    headers.routing_key(),
                    BasicPublishOptions {
                        mandatory: true,
                        ..BasicPublishOptions::default()
                    },
                    envelope.message.to_bytes(),
                    properties,
                )
                .await?
        };

        let callbacks = self.callbacks.clone();
        tokio::spawn(report_confirmation(callbacks, token, confirm));

        Ok(())
    }
}

/// Await the broker's verdict on one publish and hand it to the callbacks.
async fn report_confirmation(
    callbacks: CallbackRegistry,
    token: CorrelationToken,
    confirm: PublisherConfirm,
) {
    dispatch_confirmation(&callbacks, token, confirm.await).await;
}

/// Map a publisher confirmation onto the callbacks.
///
/// A returned message always ends in a negative confirm carrying it, whether
/// the broker acked or nacked afterwards.
async fn dispatch_confirmation(
    callbacks: &CallbackRegistry,
    token: CorrelationToken,
    outcome: Result<Confirmation, lapin::Error>,
) {
    match outcome {
        Ok(Confirmation::Ack(None)) => callbacks.confirm(Some(token), true, None).await,
        Ok(Confirmation::Ack(Some(message))) => {
            // Unroutable mandatory publishes are acked after the return.
            bounced(callbacks, token, *message).await;
        }
        Ok(Confirmation::Nack(Some(message))) => bounced(callbacks, token, *message).await,
        Ok(Confirmation::Nack(None)) => {
            callbacks
                .confirm(Some(token), false, Some("nack".to_owned()))
                .await
        }
        Ok(Confirmation::NotRequested) => {
            tracing::warn!(
                message_id = %token.message_id(),
                "Channel is not in confirm mode, delivery outcome unknown"
            );
        }
        Err(error) => {
            callbacks
                .confirm(Some(token), false, Some(error.to_string()))
                .await
        }
    }
}

async fn bounced(
    callbacks: &CallbackRegistry,
    token: CorrelationToken,
    message: BasicReturnMessage,
) {
    let cause = message.reply_text.as_str().to_owned();
    let returned = returned_message(message);
    callbacks.returned(returned.clone()).await;
    callbacks
        .confirm(Some(token.with_returned(returned)), false, Some(cause))
        .await;
}

fn returned_message(message: BasicReturnMessage) -> ReturnedMessage {
    let properties = &message.delivery.properties;
    let headers = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| from_amqp(v).map(|v| (k.as_str().to_owned(), v)))
                .collect()
        })
        .unwrap_or_else(HeaderMap::new);

    ReturnedMessage {
        exchange: message.delivery.exchange.as_str().to_owned(),
        routing_key: message.delivery.routing_key.as_str().to_owned(),
        reply_code: message.reply_code,
        reply_text: message.reply_text.as_str().to_owned(),
        expiration: properties.expiration().as_ref().map(|e| e.as_str().to_owned()),
        headers,
        body: message.delivery.data.clone(),
    }
}

fn to_amqp(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Text(s) => AMQPValue::LongString(LongString::from(s.clone())),
    }
}

/// Header types without a [`HeaderValue`] counterpart are dropped.
fn from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(n) => Some(HeaderValue::Int((*n).into())),
        AMQPValue::ShortShortUInt(n) => Some(HeaderValue::Int((*n).into())),
        AMQPValue::ShortInt(n) => Some(HeaderValue::Int((*n).into())),
        AMQPValue::ShortUInt(n) => Some(HeaderValue::Int((*n).into())),
        AMQPValue::LongInt(n) => Some(HeaderValue::Int((*n).into())),
        AMQPValue::LongUInt(n) => Some(HeaderValue::Int((*n).into())),
        AMQPValue::LongLongInt(n) => Some(HeaderValue::Int(*n)),
        AMQPValue::ShortString(s) => Some(HeaderValue::Text(s.as_str().to_owned())),
        AMQPValue::LongString(s) => Some(HeaderValue::Text(
            String::from_utf8_lossy(s.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}
