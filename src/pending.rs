//! Pending-delivery records and their key-value backends.
//!
//! A [`DeliveryRecord`] is durable evidence of a publish whose outcome was
//! negative. Records are keyed by message id inside a per-environment
//! namespace (`<environment>MQMSG`), at most one per id. They are written only
//! by the reconciler; a retry or audit layer reads them back later.
//!
//! ## Components
//!
//! - [`PendingDeliveries`]: Facade deriving namespaces and normalising errors
//! - [`KeyValueStore`]: Trait implemented by storage backends
//! - [`sweep`]: Periodic stream of records older than a threshold
//!
//! Concrete backends live in [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;
pub mod sweep;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::correlation::ReturnedMessage;

/// Suffix appended to the environment name to form the store namespace.
pub const NAMESPACE_SUFFIX: &str = "MQMSG";

/// Namespace holding the pending deliveries of `environment`.
pub fn pending_namespace(environment: &str) -> String {
    format!("{environment}{NAMESPACE_SUFFIX}")
}

/// Persisted detail of a publish the broker handed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub routing_key: String,
    /// Exchange the broker returned the message from.
    pub exchange: String,
    pub expiration: Option<String>,
    /// Body exactly as returned by the broker.
    pub payload: Vec<u8>,
    pub reply_code: Option<u16>,
    pub reply_text: Option<String>,
    /// Reason given with the negative confirmation.
    pub cause: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// Value of the `num` header of the failed attempt.
    pub attempt_num: i64,
}

impl DeliveryRecord {
    /// Build a record from the message the broker returned.
    pub fn from_returned(
        message_id: &str,
        returned: &ReturnedMessage,
        attempt_num: i64,
        cause: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.to_owned(),
            routing_key: returned.routing_key.clone(),
            exchange: returned.exchange.clone(),
            expiration: returned.expiration.clone(),
            payload: returned.body.clone(),
            reply_code: Some(returned.reply_code),
            reply_text: Some(returned.reply_text.clone()),
            cause,
            recorded_at,
            attempt_num,
        }
    }

    /// Attempt number a resend of this record should carry.
    pub fn next_attempt(&self) -> i64 {
        self.attempt_num.saturating_add(1)
    }

    pub fn is_older_than(&self, age: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.recorded_at) > age
    }
}

/// Error returned by pending-delivery operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct PendingStoreError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl PendingStoreError {
    fn backend(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for PendingStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PendingStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Keyed storage for delivery records.
///
/// Implementations must make each call atomic per key. `remove` of a missing
/// key succeeds.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Insert or replace the record stored under `key`.
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        record: DeliveryRecord,
    ) -> Result<(), Self::Error>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), Self::Error>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<DeliveryRecord>, Self::Error>;

    /// Every record of the namespace, oldest first.
    async fn list(&self, namespace: &str) -> Result<Vec<DeliveryRecord>, Self::Error>;
}

/// High-level facade over a [`KeyValueStore`].
///
/// Callers address records by environment and message id; the facade derives
/// the namespace and maps backend errors into [`PendingStoreError`].
#[derive(Clone)]
pub struct PendingDeliveries<D>(D);

impl<D> PendingDeliveries<D>
where
    D: KeyValueStore,
{
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Store `record` under its message id, replacing any earlier record.
    #[instrument(skip(self, record), fields(message_id = %record.message_id))]
    pub async fn record(
        &self,
        environment: &str,
        record: DeliveryRecord,
    ) -> Result<(), PendingStoreError> {
        let key = record.message_id.clone();
        self.0
            .put(&pending_namespace(environment), &key, record)
            .await
            .map_err(|e| PendingStoreError::backend(e.into()))
    }

    /// Drop the record of `message_id`, if there is one.
    #[instrument(skip(self))]
    pub async fn clear(
        &self,
        environment: &str,
        message_id: &str,
    ) -> Result<(), PendingStoreError> {
        self.0
            .remove(&pending_namespace(environment), message_id)
            .await
            .map_err(|e| PendingStoreError::backend(e.into()))
    }

    #[instrument(skip(self))]
    pub async fn lookup(
        &self,
        environment: &str,
        message_id: &str,
    ) -> Result<Option<DeliveryRecord>, PendingStoreError> {
        self.0
            .get(&pending_namespace(environment), message_id)
            .await
            .map_err(|e| PendingStoreError::backend(e.into()))
    }

    #[instrument(skip(self))]
    pub async fn records(
        &self,
        environment: &str,
    ) -> Result<Vec<DeliveryRecord>, PendingStoreError> {
        self.0
            .list(&pending_namespace(environment))
            .await
            .map_err(|e| PendingStoreError::backend(e.into()))
    }

    /// Records of `environment` recorded more than `age` before now.
    pub async fn stale(
        &self,
        environment: &str,
        age: chrono::Duration,
    ) -> Result<Vec<DeliveryRecord>, PendingStoreError> {
        let now = Utc::now();
        let mut records = self.records(environment).await?;
        records.retain(|r| r.is_older_than(age, now));
        Ok(records)
    }
}
