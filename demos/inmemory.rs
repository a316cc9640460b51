use std::{sync::Arc, time::Duration};

use courier::{
    PendingDeliveries, Producer, Reconciler, Transport,
    environment::{EnvironmentProvider, ProcessEnvironment},
    pending::{inmemory::InMemoryStore, sweep::SweeperBuilder},
    transport::{InMemory, RawPayload, layers::JsonLayer},
};
use serde::Serialize;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Serialize)]
struct OrderPlaced {
    id: u32,
    sku: String,
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine; the process environment still applies.
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let environment = ProcessEnvironment::default();
    let deliveries = PendingDeliveries::new(InMemoryStore::default());
    let reconciler = Arc::new(Reconciler::new(deliveries.clone(), environment.clone()));

    let broker: InMemory<RawPayload> = InMemory::default();
    let transport = Transport::new(broker.clone()).layer(JsonLayer);
    let producer = Producer::new(transport, reconciler);

    let cancel = CancellationToken::new();
    let mut stale = SweeperBuilder::new(Duration::from_millis(200), chrono::Duration::zero())
        .start(deliveries.clone(), environment.clone(), cancel.clone())
        .into_stream();

    for id in 0..4u32 {
        let order = OrderPlaced {
            id,
            sku: format!("sku-{id}"),
        };
        let message_id = producer
            .send(None, "orders", "orders.placed", order, 0)
            .await
            .expect("in-memory broker accepts publishes");

        // Every other order is unroutable.
        if id % 2 == 0 {
            broker.confirm(&message_id).await;
        } else {
            broker.bounce(&message_id, 312, "NO_ROUTE").await;
        }
    }

    producer
        .send_async(
            "orders",
            "orders.placed",
            OrderPlaced {
                id: 99,
                sku: "sku-async".into(),
            },
        )
        .await
        .expect("publish task completes");

    let env = environment.active_environment();
    let pending = deliveries.records(&env).await.expect("in-memory store");
    tracing::info!(environment = %env, count = pending.len(), "Pending deliveries");

    for _ in 0..pending.len() {
        match stale.next().await {
            Some(Ok(record)) => tracing::info!(
                message_id = %record.message_id,
                next_attempt = record.next_attempt(),
                "Would retry"
            ),
            Some(Err(error)) => tracing::error!(%error, "Sweep failed"),
            None => break,
        }
    }

    cancel.cancel();
}
