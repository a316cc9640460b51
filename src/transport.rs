//! Transport abstractions and publisher backends.
//!
//! This module defines a Tower-compatible transport layer used to publish
//! [`Publication`]s through different backends (in-memory, RabbitMQ).
//!
//! Publishing is split in two halves:
//!
//! - The synchronous half: a backend accepts or rejects the publish. Rejection
//!   surfaces as a [`TransportError`] to the caller.
//! - The asynchronous half: the broker's confirm and return signals, which a
//!   backend reports through its [`CallbackRegistry`].
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper around a Tower service stack
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete publisher backends
//! - [`Confirms`]: Access to a backend's callback slots
//! - [`TransportError`]: Unified error type with tracing context

pub mod callbacks;
mod inmemory;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt};
use tracing_error::SpanTrace;

use crate::{Envelope, correlation::CorrelationToken, envelope::PublishHeaders};

pub use callbacks::{CallbackRegistry, ConfirmCallback, ReturnCallback};
pub use inmemory::InMemory;

/// One publish request: the envelope to send and the token its outcome will be
/// reported under.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication<M> {
    pub envelope: Envelope<PublishHeaders, M>,
    pub token: CorrelationToken,
}

impl<M> Publication<M> {
    pub fn new(envelope: Envelope<PublishHeaders, M>, token: CorrelationToken) -> Self {
        Self { envelope, token }
    }

    /// Swap the payload, keeping headers and token.
    pub fn map_message<N>(self, f: impl FnOnce(M) -> N) -> Publication<N> {
        Publication {
            envelope: Envelope {
                headers: self.envelope.headers,
                message: f(self.envelope.message),
            },
            token: self.token,
        }
    }
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for publishing. It wraps a Tower
/// `Service` stack and keeps a handle on the backend's callback slots, so
/// confirm and return callbacks can be installed after middleware has been
/// layered on top.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
    callbacks: CallbackRegistry,
}

impl<D> Transport<SenderService<D>>
where
    D: Confirms,
{
    /// Create a new transport from a concrete publisher backend.
    pub fn new(driver: D) -> Self {
        let callbacks = driver.callbacks().clone();
        Self {
            service: SenderService::new(driver),
            callbacks,
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    ///
    /// This enables composition with middleware such as JSON serialisation,
    /// timeouts or concurrency limits.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
            callbacks: self.callbacks,
        }
    }

    /// Install the confirm callback. Installing the same instance again is a
    /// no-op; see [`CallbackRegistry::set_confirm_callback`].
    pub fn register_confirm_callback(&self, callback: Arc<dyn ConfirmCallback>) -> bool {
        self.callbacks.set_confirm_callback(callback)
    }

    /// Install the return callback. Installing the same instance again is a
    /// no-op; see [`CallbackRegistry::set_return_callback`].
    pub fn register_return_callback(&self, callback: Arc<dyn ReturnCallback>) -> bool {
        self.callbacks.set_return_callback(callback)
    }

    /// Hand a publication to the backend.
    ///
    /// Resolves once the backend has accepted the publish; the broker outcome
    /// arrives later through the registered callbacks.
    pub async fn publish<M>(&self, publication: Publication<M>) -> Result<(), TransportError>
    where
        S: Service<Publication<M>> + Clone + Send + Sync,
        S::Error: Into<tower::BoxError>,
        S::Future: Send,
    {
        let mut service = self.service.clone();
        ServiceExt::<Publication<M>>::ready(&mut service)
            .await
            .map_err(|e| TransportError::sender(e.into()))?
            .call(publication)
            .await
            .map_err(|e| TransportError::classify(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The backend refused the publish (e.g. channel unavailable).
    Sender(tower::BoxError),
    /// The payload could not be serialized.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    /// Serialization failures raised inside the service stack keep their
    /// kind; anything else is a sender error.
    fn classify(err: tower::BoxError) -> Self {
        if err.is::<serde_json::Error>() {
            Self::serde(err)
        } else {
            Self::sender(err)
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

impl<M, D> Service<Publication<M>> for SenderService<D>
where
    M: Send + 'static,
    D: Sender<M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Publication<M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete publisher backends.
///
/// `send` only reports whether the backend accepted the publish. Broker
/// confirmations and returns are reported through the backend's
/// [`CallbackRegistry`] once they arrive.
#[async_trait::async_trait]
pub trait Sender<M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    async fn send(&mut self, publication: Publication<M>) -> Result<(), Self::Error>;
}

/// Gives access to the callback slots a backend dispatches outcomes to.
pub trait Confirms {
    fn callbacks(&self) -> &CallbackRegistry;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload(pub(crate) Vec<u8>);

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Trait for values that can be viewed as raw bytes.
pub trait ToBytes {
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for [u8] {
    fn to_bytes(&self) -> &[u8] {
        self
    }
}

impl ToBytes for str {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for String {
    fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<T: ToBytes + ?Sized> ToBytes for &T {
    fn to_bytes(&self) -> &[u8] {
        (*self).to_bytes()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::prepare_send;

    #[tokio::test]
    async fn publish_reaches_the_backend() {
        let backend: InMemory<String> = InMemory::default();
        let transport = Transport::new(backend.clone());

        let (envelope, token) = prepare_send(Some("m1"), "ex", "rk", "{}".to_owned(), 0);
        transport
            .publish(Publication::new(envelope, token))
            .await
            .unwrap();

        let published = backend.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].token.message_id(), "m1");
    }

    #[tokio::test]
    async fn rejected_publish_surfaces_a_sender_error() {
        let backend: InMemory<String> = InMemory::default();
        backend.set_available(false);
        let transport = Transport::new(backend.clone());

        let (envelope, token) = prepare_send(None, "ex", "rk", "{}".to_owned(), 0);
        let err = transport
            .publish(Publication::new(envelope, token))
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), TransportErrorKind::Sender(_)));
        assert!(backend.published().await.is_empty());
    }

    #[test]
    fn publication_map_message_keeps_headers_and_token() {
        let (envelope, token) = prepare_send(Some("m1"), "ex", "rk", "{}", 1);
        let mapped = Publication::new(envelope, token).map_message(|m| m.len());

        assert_eq!(mapped.envelope.message, 2);
        assert_eq!(mapped.envelope.headers.message_id(), "m1");
        assert_eq!(mapped.token.message_id(), "m1");
    }
}
