//! Public send API.
//!
//! A [`Producer`] ties a [`Transport`] to the confirm and return callbacks
//! that reconcile its outcomes:
//!
//! - [`send`](Producer::send) resolves the message id, publishes, and returns
//!   as soon as the transport has accepted the message
//! - [`send_async`](Producer::send_async) does the same on a spawned task
//!
//! Neither waits for the broker's acknowledgement. Outcomes only ever reach
//! the installed callbacks; the only error a caller sees is an immediate
//! refusal by the transport.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    correlation::prepare_send,
    transport::{ConfirmCallback, Publication, ReturnCallback, Transport, TransportError},
};

/// Publishes messages through a transport whose callbacks it installed.
///
/// A transport reports to one set of callbacks. Building a second producer
/// over the same transport hands every later outcome to the second
/// producer's callbacks; clones of a producer share its registration.
///
/// Generic parameters:
/// - `T`: Transport service stack
#[derive(Clone)]
pub struct Producer<T> {
    transport: Transport<T>,
}

impl<T> Producer<T> {
    /// Create a producer and install `callbacks` on the transport as both the
    /// confirm and the return callback.
    pub fn new<C>(transport: Transport<T>, callbacks: Arc<C>) -> Self
    where
        C: ConfirmCallback + ReturnCallback + 'static,
    {
        let confirm = transport.register_confirm_callback(callbacks.clone());
        let returns = transport.register_return_callback(callbacks);
        if confirm || returns {
            tracing::debug!(confirm, returns, "Installed delivery callbacks");
        }
        Self { transport }
    }

    /// Publish `message` and return the message id it will be reconciled
    /// under.
    ///
    /// An absent or empty `message_id` gets a fresh UUID. `attempt` is written
    /// to the `num` header. The call returns once the transport has accepted
    /// the publish.
    #[tracing::instrument(
        skip(self, message_id, message),
        fields(message_id = tracing::field::Empty)
    )]
    pub async fn send<M>(
        &self,
        message_id: Option<&str>,
        exchange: &str,
        routing_key: &str,
        message: M,
        attempt: i64,
    ) -> Result<String, SendError>
    where
        M: std::fmt::Debug,
        T: Service<Publication<M>> + Clone + Send + Sync,
        T::Error: Into<tower::BoxError>,
        T::Future: Send,
    {
        let (envelope, token) = prepare_send(message_id, exchange, routing_key, message, attempt);
        let message_id = token.message_id().to_owned();
        tracing::Span::current().record("message_id", message_id.as_str());
        let msg = format!("{:?}", envelope.message);

        self.transport
            .publish(Publication::new(envelope, token))
            .await
            .map_err(|e| SendError::new(message_id.clone(), e))?;

        tracing::info!(
            exchange,
            routing_key,
            msg = %msg,
            message_id = %message_id,
            "Message published"
        );
        Ok(message_id)
    }

    /// Publish `message` on a spawned task with a fresh id and attempt `0`.
    ///
    /// Returns immediately. Dropping the handle does not cancel the publish;
    /// a refusal by the transport is logged.
    pub fn send_async<M>(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message: M,
    ) -> JoinHandle<()>
    where
        M: std::fmt::Debug + Send + 'static,
        T: Service<Publication<M>> + Clone + Send + Sync + 'static,
        T::Error: Into<tower::BoxError>,
        T::Future: Send,
    {
        let producer = self.clone();
        let exchange = exchange.into();
        let routing_key = routing_key.into();

        tokio::spawn(async move {
            if let Err(error) = producer.send(None, &exchange, &routing_key, message, 0).await {
                tracing::error!(
                    message_id = %error.message_id(),
                    %error,
                    "Asynchronous publish failed"
                );
            }
        })
    }
}

/// Error returned when the transport refuses a publish.
///
/// Carries the message id the publish would have been correlated under.
#[derive(Debug)]
pub struct SendError {
    context: SpanTrace,
    message_id: String,
    source: TransportError,
}

impl SendError {
    fn new(message_id: String, source: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            message_id,
            source,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn transport_error(&self) -> &TransportError {
        &self.source
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Publish of message {} refused: {}", self.message_id, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        correlation::{CorrelationToken, ReturnedMessage},
        environment::StaticEnvironment,
        pending::{PendingDeliveries, inmemory::InMemoryStore},
        reconciler::Reconciler,
        transport::{InMemory, SenderService},
    };

    type Broker = InMemory<String>;

    fn setup() -> (
        Producer<SenderService<Broker>>,
        Broker,
        PendingDeliveries<InMemoryStore>,
    ) {
        let broker = Broker::default();
        let deliveries = PendingDeliveries::new(InMemoryStore::default());
        let reconciler = Arc::new(Reconciler::new(
            deliveries.clone(),
            StaticEnvironment::new("dev"),
        ));
        let producer = Producer::new(Transport::new(broker.clone()), reconciler);
        (producer, broker, deliveries)
    }

    #[tokio::test]
    async fn confirmed_send_leaves_no_record() {
        let (producer, broker, deliveries) = setup();

        let id = producer
            .send(Some("m1"), "ex", "rk", "{\"a\":1}".to_owned(), 0)
            .await
            .unwrap();
        broker.confirm(&id).await;

        assert_eq!(id, "m1");
        assert!(deliveries.lookup("dev", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirm_clears_a_record_left_by_an_earlier_attempt() {
        let (producer, broker, deliveries) = setup();

        producer
            .send(Some("m1"), "ex", "rk", "{\"a\":1}".to_owned(), 0)
            .await
            .unwrap();
        assert!(broker.bounce("m1", 312, "NO_ROUTE").await);
        assert!(deliveries.lookup("dev", "m1").await.unwrap().is_some());

        producer
            .send(Some("m1"), "ex", "rk", "{\"a\":1}".to_owned(), 1)
            .await
            .unwrap();
        broker.confirm("m1").await;

        assert!(deliveries.lookup("dev", "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn returned_send_is_recorded_with_its_routing_detail() {
        let (producer, broker, deliveries) = setup();

        producer
            .send(Some("m1"), "ex", "rk", "{\"a\":1}".to_owned(), 0)
            .await
            .unwrap();
        broker.bounce("m1", 312, "NO_ROUTE").await;

        let record = deliveries.lookup("dev", "m1").await.unwrap().unwrap();
        assert_eq!(record.routing_key, "rk");
        assert_eq!(record.exchange, "ex");
        assert_eq!(record.attempt_num, 0);
        assert_eq!(record.payload, b"{\"a\":1}");
        assert_eq!(deliveries.records("dev").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_reuses_the_id_and_carries_the_attempt() {
        let (producer, broker, _) = setup();

        producer
            .send(Some("m1"), "ex", "rk", "{}".to_owned(), 0)
            .await
            .unwrap();
        producer
            .send(Some("m1"), "ex", "rk", "{}".to_owned(), 1)
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 2);
        for (attempt, publication) in published.iter().enumerate() {
            assert_eq!(publication.envelope.headers.message_id(), "m1");
            assert_eq!(publication.token.message_id(), "m1");
            assert_eq!(publication.envelope.headers.attempt(), Some(attempt as i64));
            assert_eq!(publication.envelope.headers.content_type(), "application/json");
        }
    }

    #[tokio::test]
    async fn uncorrelated_failure_touches_nothing() {
        let (_producer, broker, deliveries) = setup();

        broker.confirm_uncorrelated(false, None).await;

        assert!(deliveries.records("dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_publish_is_returned_to_the_caller() {
        let (producer, broker, deliveries) = setup();
        broker.set_available(false);

        let err = producer
            .send(Some("m1"), "ex", "rk", "{}".to_owned(), 0)
            .await
            .unwrap_err();

        assert_eq!(err.message_id(), "m1");
        assert!(broker.published().await.is_empty());
        assert!(deliveries.records("dev").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_async_publishes_with_a_fresh_id() {
        let (producer, broker, _) = setup();

        producer
            .send_async("ex", "rk", "{}".to_owned())
            .await
            .unwrap();
        producer
            .send_async("ex", "rk", "{}".to_owned())
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 2);
        let first = uuid::Uuid::parse_str(published[0].token.message_id()).unwrap();
        let second = uuid::Uuid::parse_str(published[1].token.message_id()).unwrap();
        assert_ne!(first, second);
        assert_eq!(published[0].envelope.headers.attempt(), Some(0));
    }

    #[tokio::test]
    async fn send_async_swallows_refusals() {
        let (producer, broker, _) = setup();
        broker.set_available(false);

        producer
            .send_async("ex", "rk", "{}".to_owned())
            .await
            .unwrap();

        assert!(broker.published().await.is_empty());
    }

    #[derive(Default)]
    struct Counting {
        confirms: AtomicUsize,
        returns: AtomicUsize,
    }

    #[async_trait]
    impl ConfirmCallback for Counting {
        async fn on_confirm(
            &self,
            _token: Option<CorrelationToken>,
            _ack: bool,
            _cause: Option<String>,
        ) {
            self.confirms.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ReturnCallback for Counting {
        async fn on_return(&self, _returned: ReturnedMessage) {
            self.returns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn repeated_sends_install_callbacks_once() {
        let broker = Broker::default();
        let counting = Arc::new(Counting::default());
        let producer = Producer::new(Transport::new(broker.clone()), counting.clone());
        let clone = producer.clone();

        producer
            .send(Some("m1"), "ex", "rk", "{}".to_owned(), 0)
            .await
            .unwrap();
        clone
            .send(Some("m1"), "ex", "rk", "{}".to_owned(), 0)
            .await
            .unwrap();
        broker.bounce("m1", 312, "NO_ROUTE").await;

        assert_eq!(counting.confirms.load(Ordering::SeqCst), 1);
        assert_eq!(counting.returns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sending_does_not_reclaim_a_shared_transport() {
        let broker = Broker::default();
        let transport = Transport::new(broker.clone());
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let earlier = Producer::new(transport.clone(), first.clone());
        let _later = Producer::new(transport, second.clone());

        earlier
            .send(Some("m1"), "ex", "rk", "{}".to_owned(), 0)
            .await
            .unwrap();
        broker.confirm("m1").await;

        assert_eq!(first.confirms.load(Ordering::SeqCst), 0);
        assert_eq!(second.confirms.load(Ordering::SeqCst), 1);
    }
}
