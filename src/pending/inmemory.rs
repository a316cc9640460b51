use async_trait::async_trait;
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tokio::sync::Mutex;

use crate::pending::{DeliveryRecord, KeyValueStore};

/// An in-memory key-value store for testing or local usage.
///
/// Holds one `HashMap` per namespace behind a single lock, which makes every
/// operation atomic per key.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    namespaces: Arc<Mutex<HashMap<String, HashMap<String, DeliveryRecord>>>>,
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    type Error = Infallible;

    async fn put(
        &self,
        namespace: &str,
        key: &str,
        record: DeliveryRecord,
    ) -> Result<(), Infallible> {
        self.namespaces
            .lock()
            .await
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), record);
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), Infallible> {
        let mut namespaces = self.namespaces.lock().await;
        if let Some(records) = namespaces.get_mut(namespace) {
            records.remove(key);
            if records.is_empty() {
                namespaces.remove(namespace);
            }
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<DeliveryRecord>, Infallible> {
        Ok(self
            .namespaces
            .lock()
            .await
            .get(namespace)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<DeliveryRecord>, Infallible> {
        let namespaces = self.namespaces.lock().await;
        let mut records: Vec<_> = namespaces
            .get(namespace)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(records)
    }
}
