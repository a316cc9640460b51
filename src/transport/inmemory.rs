use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Mutex;

use crate::{
    correlation::{CorrelationToken, ReturnedMessage},
    transport::{CallbackRegistry, Confirms, Publication, Sender, ToBytes},
};

/// In-memory broker for testing or local pipelines.
///
/// Accepted publications are kept in a shared list. Nothing is confirmed on
/// its own: the broker outcome of each publication is driven explicitly with
/// [`confirm`](InMemory::confirm), [`nack`](InMemory::nack) or
/// [`bounce`](InMemory::bounce), which makes asynchronous delivery scenarios
/// reproducible in tests.
///
/// ## Type Parameters
///
/// - `M`: type of the message payload
pub struct InMemory<M> {
    published: Arc<Mutex<Vec<Publication<M>>>>,
    available: Arc<AtomicBool>,
    callbacks: CallbackRegistry,
}

impl<M> InMemory<M> {
    /// Snapshot of every accepted publication, oldest first.
    pub async fn published(&self) -> Vec<Publication<M>>
    where
        M: Clone,
    {
        self.published.lock().await.clone()
    }

    /// Toggle whether the simulated channel accepts publishes.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Broker acknowledges the message.
    pub async fn confirm(&self, message_id: &str) {
        self.callbacks
            .confirm(Some(CorrelationToken::new(message_id)), true, None)
            .await;
    }

    /// Broker rejects the message without handing it back.
    pub async fn nack(&self, message_id: &str, cause: &str) {
        self.callbacks
            .confirm(
                Some(CorrelationToken::new(message_id)),
                false,
                Some(cause.to_owned()),
            )
            .await;
    }

    /// Broker reports an outcome that cannot be attributed to any send.
    pub async fn confirm_uncorrelated(&self, ack: bool, cause: Option<&str>) {
        self.callbacks
            .confirm(None, ack, cause.map(str::to_owned))
            .await;
    }

    /// Broker finds no queue for the latest publication with `message_id`.
    ///
    /// Fires the return callback, then a negative confirmation whose token
    /// carries the returned message. Returns `false` when no such
    /// publication was accepted.
    pub async fn bounce(&self, message_id: &str, reply_code: u16, reply_text: &str) -> bool
    where
        M: ToBytes,
    {
        let returned = {
            let published = self.published.lock().await;
            let Some(publication) = published
                .iter()
                .rev()
                .find(|p| p.token.message_id() == message_id)
            else {
                return false;
            };
            let headers = &publication.envelope.headers;
            ReturnedMessage {
                exchange: headers.exchange().to_owned(),
                routing_key: headers.routing_key().to_owned(),
                reply_code,
                reply_text: reply_text.to_owned(),
                expiration: None,
                headers: headers.attributes().clone(),
                body: publication.envelope.message.to_bytes().to_vec(),
            }
        };

        self.callbacks.returned(returned.clone()).await;
        self.callbacks
            .confirm(
                Some(CorrelationToken::new(message_id).with_returned(returned)),
                false,
                Some(reply_text.to_owned()),
            )
            .await;
        true
    }
}

impl<M> Clone for InMemory<M> {
    fn clone(&self) -> Self {
        Self {
            published: Arc::clone(&self.published),
            available: Arc::clone(&self.available),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<M> Default for InMemory<M> {
    fn default() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(AtomicBool::new(true)),
            callbacks: CallbackRegistry::default(),
        }
    }
}

impl<M> Confirms for InMemory<M> {
    fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }
}

#[async_trait::async_trait]
impl<M> Sender<M> for InMemory<M>
where
    M: std::fmt::Debug + Send,
{
    type Error = std::io::Error;

    /// Accept a publication by appending it to the in-memory list, or refuse
    /// it when the channel is marked unavailable.
    #[tracing::instrument(skip_all, fields(message_id = %publication.token.message_id()))]
    async fn send(&mut self, publication: Publication<M>) -> Result<(), Self::Error> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "in-memory channel unavailable",
            ));
        }

        tracing::debug!(
            headers = ?publication.envelope.headers,
            msg = ?publication.envelope.message,
            "Message accepted by in-memory broker",
        );
        self.published.lock().await.push(publication);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::prepare_send;

    #[tokio::test]
    async fn bounce_of_unknown_message_reports_false() {
        let broker: InMemory<String> = InMemory::default();

        assert!(!broker.bounce("missing", 312, "NO_ROUTE").await);
    }

    #[tokio::test]
    async fn accepted_publications_are_kept_in_order() {
        let mut broker: InMemory<String> = InMemory::default();

        for id in ["a", "b"] {
            let (envelope, token) = prepare_send(Some(id), "ex", "rk", "{}".to_owned(), 0);
            broker.send(Publication::new(envelope, token)).await.unwrap();
        }

        let ids: Vec<_> = broker
            .published()
            .await
            .into_iter()
            .map(|p| p.token.message_id().to_owned())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
