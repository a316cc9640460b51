//! Reconciliation of asynchronous broker outcomes with the pending store.
//!
//! The [`Reconciler`] is the single writer of pending-delivery records. It is
//! installed once as both the confirm and the return callback of a transport:
//!
//! - A positive confirmation clears any record of the message.
//! - A negative confirmation whose token carries the returned message is
//!   recorded, keyed by the environment resolved at callback time.
//! - Negative confirmations without detail, and confirmations that cannot be
//!   attributed to a send, are only reported.
//! - Returns are only reported; the negative confirmation that follows them
//!   is what gets persisted.
//!
//! Nothing here propagates an error to the transport: every failure ends in a
//! [`ReconcilerHook`] call.

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    correlation::{CorrelationToken, ReturnedMessage},
    envelope::ATTEMPT_HEADER,
    environment::EnvironmentProvider,
    pending::{DeliveryRecord, KeyValueStore, PendingDeliveries},
    transport::{ConfirmCallback, ReturnCallback},
};

/// Confirm and return callback backed by a pending-delivery store.
///
/// Generic parameters:
/// - `D`: Store backend
/// - `E`: Environment provider, queried on every callback
/// - `HK`: Hook implementation for reconciliation events
pub struct Reconciler<D, E, HK = DefaultReconcilerHook> {
    deliveries: PendingDeliveries<D>,
    environment: E,
    hook: HK,
}

impl<D, E> Reconciler<D, E, DefaultReconcilerHook>
where
    D: KeyValueStore,
    E: EnvironmentProvider,
{
    /// Create a reconciler with the default hook implementation.
    pub fn new(deliveries: PendingDeliveries<D>, environment: E) -> Self {
        Self {
            deliveries,
            environment,
            hook: DefaultReconcilerHook,
        }
    }
}

impl<D, E, HK> Reconciler<D, E, HK>
where
    D: KeyValueStore,
    E: EnvironmentProvider,
    HK: ReconcilerHook,
{
    /// Replace the hook while keeping the store and environment.
    pub fn with_hook<HK2: ReconcilerHook>(self, hook: HK2) -> Reconciler<D, E, HK2> {
        Reconciler {
            deliveries: self.deliveries,
            environment: self.environment,
            hook,
        }
    }

    async fn delivered(&self, token: &CorrelationToken) {
        let environment = self.environment.active_environment();
        match self.deliveries.clear(&environment, token.message_id()).await {
            Ok(()) => self.hook.on_delivered(token.message_id()),
            Err(e) => self.hook.on_store_error(token.message_id(), &e),
        }
    }

    async fn failed(&self, token: &CorrelationToken, cause: Option<String>) {
        let Some(returned) = token.returned() else {
            self.hook.on_rejected(token.message_id(), cause.as_deref());
            return;
        };

        let attempt_num = match returned.headers.get(ATTEMPT_HEADER).map(|v| v.as_int()) {
            Some(Some(n)) => n,
            Some(None) => {
                self.hook
                    .on_malformed_return(token.message_id(), "attempt header is not an integer");
                0
            }
            None => {
                self.hook
                    .on_malformed_return(token.message_id(), "attempt header is missing");
                0
            }
        };

        let record = DeliveryRecord::from_returned(
            token.message_id(),
            returned,
            attempt_num,
            cause,
            Utc::now(),
        );

        // Resolved now rather than at send time.
        let environment = self.environment.active_environment();
        match self.deliveries.record(&environment, record.clone()).await {
            Ok(()) => self.hook.on_recorded(&environment, &record),
            Err(e) => self.hook.on_store_error(token.message_id(), &e),
        }
    }
}

#[async_trait]
impl<D, E, HK> ConfirmCallback for Reconciler<D, E, HK>
where
    D: KeyValueStore,
    E: EnvironmentProvider,
    HK: ReconcilerHook,
{
    async fn on_confirm(&self, token: Option<CorrelationToken>, ack: bool, cause: Option<String>) {
        match (token, ack) {
            (Some(token), true) => self.delivered(&token).await,
            (Some(token), false) => self.failed(&token, cause).await,
            (None, ack) => self.hook.on_unattributable(ack, cause.as_deref()),
        }
    }
}

#[async_trait]
impl<D, E, HK> ReturnCallback for Reconciler<D, E, HK>
where
    D: KeyValueStore,
    E: EnvironmentProvider,
    HK: ReconcilerHook,
{
    async fn on_return(&self, returned: ReturnedMessage) {
        self.hook.on_returned(&returned);
    }
}

/// Hook trait for observing reconciliation events.
///
/// Hooks are invoked synchronously on the callback task and should avoid
/// heavy or blocking work.
pub trait ReconcilerHook: Send + Sync {
    fn on_delivered(&self, message_id: &str);
    fn on_recorded(&self, environment: &str, record: &DeliveryRecord);
    fn on_rejected(&self, message_id: &str, cause: Option<&str>);
    fn on_unattributable(&self, ack: bool, cause: Option<&str>);
    fn on_returned(&self, returned: &ReturnedMessage);
    fn on_malformed_return(&self, message_id: &str, problem: &str);
    fn on_store_error(&self, message_id: &str, error: &dyn std::error::Error);
}

/// Default reconciler hook implementation.
///
/// Logs every event using `tracing`.
pub struct DefaultReconcilerHook;

impl ReconcilerHook for DefaultReconcilerHook {
    fn on_delivered(&self, message_id: &str) {
        tracing::info!(message_id, "Message delivered");
    }

    fn on_recorded(&self, environment: &str, record: &DeliveryRecord) {
        tracing::error!(
            message_id = %record.message_id,
            environment,
            routing_key = %record.routing_key,
            exchange = %record.exchange,
            num = record.attempt_num,
            "Message delivery failed, recorded for retry"
        );
    }

    fn on_rejected(&self, message_id: &str, cause: Option<&str>) {
        tracing::error!(message_id, cause, "Message delivery failed without returned message");
    }

    fn on_unattributable(&self, ack: bool, cause: Option<&str>) {
        tracing::error!(ack, cause, "Message delivery failed, no correlation data");
    }

    fn on_returned(&self, returned: &ReturnedMessage) {
        tracing::error!(
            msg = %String::from_utf8_lossy(&returned.body),
            reply_code = returned.reply_code,
            reply_text = %returned.reply_text,
            exchange = %returned.exchange,
            routing_key = %returned.routing_key,
            "Message returned as unroutable"
        );
    }

    fn on_malformed_return(&self, message_id: &str, problem: &str) {
        tracing::warn!(message_id, problem, "Returned message detail is malformed");
    }

    fn on_store_error(&self, message_id: &str, error: &dyn std::error::Error) {
        tracing::error!(message_id, %error, "Pending delivery store failed");
    }
}
