//! Periodic discovery of stale pending deliveries.
//!
//! A publish that was never confirmed leaves no record, and a record that
//! nobody acts on stays forever. The sweeper surfaces records that have sat in
//! the store longer than a threshold so a retry or audit layer can pick them
//! up. It never resends or deletes anything itself.

use std::time::Duration;

use futures_core::stream::BoxStream;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    environment::EnvironmentProvider,
    pending::{DeliveryRecord, KeyValueStore, PendingDeliveries, PendingStoreError},
};

/// A running sweep.
///
/// Every tick re-emits all records that are still stale, so consumers should
/// clear or resend what they handle. Dropping the receiver stops the task.
pub struct Sweeper {
    /// Stale records, or the error of a failed scan.
    pub receiver: mpsc::Receiver<Result<DeliveryRecord, PendingStoreError>>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Turn the sweep into a stream. The background task keeps running
    /// until cancellation or until the stream is dropped.
    pub fn into_stream(self) -> BoxStream<'static, Result<DeliveryRecord, PendingStoreError>> {
        Box::pin(ReceiverStream::new(self.receiver))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Builder for a [`Sweeper`].
pub struct SweeperBuilder {
    interval: Duration,
    older_than: chrono::Duration,
    channel_size: usize,
}

impl SweeperBuilder {
    /// Scan every `interval` for records recorded more than `older_than` ago.
    pub fn new(interval: Duration, older_than: chrono::Duration) -> Self {
        Self {
            interval,
            older_than,
            channel_size: 100,
        }
    }

    /// Capacity of the channel between the scan task and the consumer.
    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }

    /// Spawn the scan task.
    ///
    /// The environment is resolved again on every tick.
    pub fn start<D, E>(
        self,
        deliveries: PendingDeliveries<D>,
        environment: E,
        cancel: CancellationToken,
    ) -> Sweeper
    where
        D: KeyValueStore + 'static,
        E: EnvironmentProvider + 'static,
    {
        let (tx, receiver) = mpsc::channel(self.channel_size.max(1));
        let Self {
            interval,
            older_than,
            ..
        } = self;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let env = environment.active_environment();
                        let items = match deliveries.stale(&env, older_than).await {
                            Ok(records) => {
                                tracing::debug!(
                                    environment = %env,
                                    count = records.len(),
                                    "Swept stale deliveries"
                                );
                                records.into_iter().map(Ok).collect()
                            }
                            Err(err) => {
                                tracing::error!(
                                    environment = %env,
                                    error = %err,
                                    "Pending delivery scan failed"
                                );
                                vec![Err(err)]
                            }
                        };

                        // A full channel must not hold the task past cancellation.
                        for item in items {
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return,
                                sent = tx.send(item) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        Sweeper { receiver, handle }
    }
}
