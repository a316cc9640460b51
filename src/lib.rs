#![doc = include_str!("../README.md")]

pub mod correlation;
pub mod envelope;
pub mod environment;
pub mod pending;
mod producer;
pub mod reconciler;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, PublishHeaders};

#[doc(inline)]
pub use correlation::{CorrelationToken, ReturnedMessage};

#[doc(inline)]
pub use pending::{DeliveryRecord, PendingDeliveries, PendingStoreError};

#[doc(inline)]
pub use reconciler::{DefaultReconcilerHook, Reconciler, ReconcilerHook};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use producer::{Producer, SendError};
