use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{touch, ChangeEvent, ChangeOp, Fields, Record};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Record>, StoreError>;

    async fn create(&self, collection: &str, fields: Fields) -> Result<Uuid, StoreError>;

    /// Shallow-merges `fields` into the stored document and stamps `updatedAt`.
    async fn update(&self, collection: &str, id: Uuid, fields: Fields) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: Uuid) -> Result<(), StoreError>;

    /// Change feed for one collection; dropping the handle unsubscribes.
    async fn subscribe(&self, collection: &str) -> Result<Subscription, StoreError>;

    async fn disabled_units(&self) -> Result<BTreeSet<String>, StoreError>;

    async fn set_disabled_units(&self, units: &BTreeSet<String>) -> Result<(), StoreError>;
}

pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    pump: JoinHandle<()>,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>, pump: JoinHandle<()>) -> Self {
        Self { events, pump }
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Fans one store-wide change feed out to per-collection subscriptions.
/// The upstream feed is started at most once, on first subscribe.
pub struct ChangeHub {
    changes: broadcast::Sender<ChangeEvent>,
    feed: OnceCell<JoinHandle<()>>,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            changes,
            feed: OnceCell::new(),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No receivers is fine.
        let _ = self.changes.send(event);
    }

    /// Subscribes to `collection`, running `start` first if no feed is up yet.
    /// `start` receives the sender its feed task should publish into.
    pub async fn subscribe_with<F, Fut>(
        &self,
        collection: &str,
        start: F,
    ) -> Result<Subscription, StoreError>
    where
        F: FnOnce(broadcast::Sender<ChangeEvent>) -> Fut,
        Fut: Future<Output = Result<JoinHandle<()>, StoreError>>,
    {
        self.feed
            .get_or_try_init(|| start(self.changes.clone()))
            .await?;
        Ok(self.subscribe(collection))
    }

    pub fn subscribe(&self, collection: &str) -> Subscription {
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let wanted = collection.to_string();

        let pump = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) if event.collection == wanted => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(collection = %wanted, skipped, "change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(rx, pump)
    }
}

impl Drop for ChangeHub {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.get() {
            feed.abort();
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Record>>>,
    disabled: RwLock<BTreeSet<String>>,
    unavailable: RwLock<HashSet<String>>,
    hub: ChangeHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully formed record without emitting a change.
    pub async fn insert(&self, collection: &str, record: Record) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(record);
    }

    #[cfg(test)]
    pub async fn mark_unavailable(&self, collection: &str) {
        self.unavailable
            .write()
            .await
            .insert(collection.to_string());
    }

    async fn check_available(&self, collection: &str) -> Result<(), StoreError> {
        if self.unavailable.read().await.contains(collection) {
            return Err(StoreError::Unavailable {
                collection: collection.to_string(),
                reason: "collection offline".to_string(),
            });
        }
        Ok(())
    }

    fn emit(&self, collection: &str, id: Option<Uuid>, op: ChangeOp) {
        self.hub.publish(ChangeEvent {
            collection: collection.to_string(),
            id,
            op,
        });
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
        self.check_available(collection).await?;
        let collections = self.collections.read().await;
        Ok(collections.get(collection).cloned().unwrap_or_default())
    }

    async fn create(&self, collection: &str, fields: Fields) -> Result<Uuid, StoreError> {
        self.check_available(collection).await?;
        let record = Record::new(fields);
        let id = record.id;
        self.insert(collection, record).await;
        self.emit(collection, Some(id), ChangeOp::Insert);
        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        id: Uuid,
        mut fields: Fields,
    ) -> Result<(), StoreError> {
        self.check_available(collection).await?;
        {
            let mut collections = self.collections.write().await;
            let record = collections
                .get_mut(collection)
                .and_then(|records| records.iter_mut().find(|record| record.id == id))
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id,
                })?;
            touch(&mut fields);
            record.fields.extend(fields);
        }
        self.emit(collection, Some(id), ChangeOp::Update);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<(), StoreError> {
        self.check_available(collection).await?;
        {
            let mut collections = self.collections.write().await;
            let removed = match collections.get_mut(collection) {
                Some(records) => {
                    let before = records.len();
                    records.retain(|record| record.id != id);
                    records.len() != before
                }
                None => false,
            };
            if !removed {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id,
                });
            }
        }
        self.emit(collection, Some(id), ChangeOp::Delete);
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription, StoreError> {
        Ok(self.hub.subscribe(collection))
    }

    async fn disabled_units(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.disabled.read().await.clone())
    }

    async fn set_disabled_units(&self, units: &BTreeSet<String>) -> Result<(), StoreError> {
        *self.disabled.write().await = units.clone();
        Ok(())
    }
}
