//! Distributed adapter — the reference implementation on a document store.
//!
//! State lives in a single collection keyed by `name`; one document per
//! name holds an ordered `queue` array (insertion order = FIFO). The
//! document-store driver itself is treated as an external collaborator
//! (per the spec's Non-goals — "connection pool, BSON, indexes beyond
//! what we specify"), so this module is a thin, fully-specified client of
//! the official `mongodb` driver rather than a hand-rolled wire protocol.

use std::time::Duration;

use async_trait::async_trait;
use bson::doc;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOneOptions, IndexOptions, ReadPreference, ReturnDocument,
    SelectionCriteria, UpdateOptions,
};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::adapter::{now_ms, Adapter, GcInput, GcOutcome, SetupInput};
use crate::error::AdapterError;
use crate::lock::{Lock, LockId, LockStatus, LockType};

const DEFAULT_COLLECTION_NAME: &str = "locks";
/// MongoDB write error code for a duplicate key violation.
const DUPLICATE_KEY_CODE: i32 = 11000;
/// Racing upserts on the same `{name}` may both attempt an insert; retry
/// up to this many additional times before giving up.
const ENQUEUE_RETRIES: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntryDoc {
    id: String,
    #[serde(rename = "type")]
    kind: QueueEntryKind,
    at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum QueueEntryKind {
    Reader,
    Writer,
}

impl From<LockType> for QueueEntryKind {
    fn from(kind: LockType) -> Self {
        match kind {
            LockType::Reader => QueueEntryKind::Reader,
            LockType::Writer => QueueEntryKind::Writer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueDoc {
    name: String,
    at: i64,
    queue: Vec<QueueEntryDoc>,
}

/// Configuration for the distributed adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoAdapterConfig {
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    #[serde(default)]
    pub server_version: Option<String>,
}

fn default_collection_name() -> String {
    DEFAULT_COLLECTION_NAME.to_string()
}

impl Default for MongoAdapterConfig {
    fn default() -> Self {
        Self {
            collection_name: DEFAULT_COLLECTION_NAME.to_string(),
            server_version: None,
        }
    }
}

/// Distributed adapter backed by a MongoDB-compatible document store.
pub struct MongoAdapter {
    db: Database,
    collection: Collection<QueueDoc>,
    collection_name: String,
}

impl MongoAdapter {
    pub fn new(db: &Database, config: MongoAdapterConfig) -> Self {
        Self {
            db: db.clone(),
            collection: db.collection::<QueueDoc>(&config.collection_name),
            collection_name: config.collection_name,
        }
    }

    fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY_CODE,
            ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY_CODE,
            _ => false,
        }
    }

    fn is_index_conflict(err: &mongodb::error::Error) -> bool {
        matches!(
            err.kind.as_ref(),
            ErrorKind::Command(ce) if ce.code_name == "IndexOptionsConflict" || ce.code_name == "IndexKeySpecsConflict"
        )
    }

    /// Create `index` if absent; on an options/key conflict with an
    /// existing index of the same name, drop and recreate it.
    async fn ensure_index(&self, name: &str, index: IndexModel) -> Result<(), AdapterError> {
        match self.collection.create_index(index.clone(), None).await {
            Ok(_) => Ok(()),
            Err(err) if Self::is_index_conflict(&err) => {
                self.collection
                    .drop_index(name, None)
                    .await
                    .map_err(AdapterError::Mongo)?;
                self.collection
                    .create_index(index, None)
                    .await
                    .map_err(AdapterError::Mongo)?;
                Ok(())
            }
            Err(err) => Err(AdapterError::Mongo(err)),
        }
    }

    async fn enqueue(&self, lock: &Lock) -> Result<QueueDoc, AdapterError> {
        let at = now_ms();
        let entry = QueueEntryDoc {
            id: lock.id.as_str().to_string(),
            kind: lock.kind.into(),
            at,
        };
        let entry_doc = bson::to_bson(&entry).map_err(|e| AdapterError::Store(e.to_string()))?;

        let update = doc! {
            "$setOnInsert": { "name": &lock.name },
            "$max": { "at": at },
            "$push": { "queue": entry_doc },
        };

        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let mut attempts = 0;
        loop {
            match self
                .collection
                .find_one_and_update(doc! { "name": &lock.name }, update.clone(), options.clone())
                .await
            {
                Ok(Some(doc)) => return Ok(doc),
                Ok(None) => {
                    return Err(AdapterError::Store(format!(
                        "enqueue for \"{}\" returned no document",
                        lock.name
                    )))
                }
                Err(err) if Self::is_duplicate_key(&err) && attempts < ENQUEUE_RETRIES => {
                    attempts += 1;
                    tracing::debug!(name = %lock.name, attempts, "enqueue retrying after duplicate key");
                    continue;
                }
                Err(err) => return Err(AdapterError::Mongo(err)),
            }
        }
    }

    fn admitted(queue: &[QueueEntryDoc], id: &str, kind: LockType) -> bool {
        for entry in queue {
            if entry.id == id {
                return true;
            }
            if matches!(kind, LockType::Reader) && entry.kind == QueueEntryKind::Writer {
                return false;
            }
            if matches!(kind, LockType::Writer) {
                return false;
            }
        }
        false
    }

    async fn fetch_by_queue_id(&self, lock_id: &LockId) -> Result<Option<QueueDoc>, AdapterError> {
        let options = FindOneOptions::builder()
            .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .build();
        self.collection
            .find_one(doc! { "queue.id": lock_id.as_str() }, options)
            .await
            .map_err(AdapterError::Mongo)
    }

    async fn best_effort_dequeue(&self, lock: &Lock) {
        let _ = self
            .collection
            .update_one(
                doc! { "name": &lock.name },
                doc! { "$pull": { "queue": { "id": lock.id.as_str() } } },
                None,
            )
            .await;
    }
}

#[async_trait]
impl Adapter for MongoAdapter {
    async fn setup(&self, input: SetupInput) -> Result<(), AdapterError> {
        tracing::info!(collection = %self.collection_name, "mongo adapter setup");
        // Idempotent: create the collection, tolerating "already exists".
        if let Err(err) = self.db.create_collection(&self.collection_name, None).await {
            let already_exists = matches!(
                err.kind.as_ref(),
                ErrorKind::Command(ce) if ce.code_name == "NamespaceExists"
            );
            if !already_exists {
                return Err(AdapterError::Mongo(err));
            }
        }

        // Drop any stray non-primary index before (re)creating the ones we own.
        let wanted = ["idx_name", "idx_queue_id", "idx_at"];
        if let Ok(names) = self.collection.list_index_names().await {
            for name in names {
                if name != "_id_" && !wanted.contains(&name.as_str()) {
                    let _ = self.collection.drop_index(name, None).await;
                }
            }
        }

        let name_index = IndexModel::builder()
            .keys(doc! { "name": 1 })
            .options(IndexOptions::builder().unique(true).name("idx_name".to_string()).build())
            .build();
        self.ensure_index("idx_name", name_index).await?;

        let queue_id_index = IndexModel::builder()
            .keys(doc! { "queue.id": 1 })
            .options(IndexOptions::builder().name("idx_queue_id".to_string()).build())
            .build();
        self.ensure_index("idx_queue_id", queue_id_index).await?;

        if let Some(gc_interval_ms) = input.gc_interval_ms {
            let expire_after_secs = ((gc_interval_ms as f64 * 3.0) / 1000.0).ceil() as u64;
            let at_index = IndexModel::builder()
                .keys(doc! { "at": 1 })
                .options(
                    IndexOptions::builder()
                        .name("idx_at".to_string())
                        .expire_after(Duration::from_secs(expire_after_secs))
                        .build(),
                )
                .build();
            self.ensure_index("idx_at", at_index).await?;
        }

        Ok(())
    }

    async fn acquire(&self, lock: &Lock) -> Result<(), AdapterError> {
        let mut doc = self.enqueue(lock).await?;

        loop {
            if lock.status() != LockStatus::Acquiring {
                self.best_effort_dequeue(lock).await;
                return Ok(());
            }

            if Self::admitted(&doc.queue, lock.id.as_str(), lock.kind) {
                // transition() may fail if a concurrent timeout already
                // rejected the lock; if so this entry is now a zombie that
                // would otherwise block admission for `name` forever, so
                // pull it before returning.
                if lock.transition(LockStatus::Acquired).is_err() {
                    self.best_effort_dequeue(lock).await;
                }
                return Ok(());
            }

            tokio::time::sleep(Duration::from_millis(lock.options.pull_interval_ms())).await;

            match self.fetch_by_queue_id(&lock.id).await? {
                Some(next) => doc = next,
                None => {
                    // Entry vanished (e.g. collected by GC); the lock itself
                    // is still sitting in Acquiring unless we settle it.
                    let _ = lock.reject("entry no longer present in queue");
                    return Ok(());
                }
            }
        }
    }

    async fn release(&self, lock: &Lock) -> Result<(), AdapterError> {
        let result = self
            .collection
            .update_one(
                doc! { "name": &lock.name },
                doc! { "$pull": { "queue": { "id": lock.id.as_str() } } },
                None,
            )
            .await
            .map_err(AdapterError::Mongo)?;

        if result.modified_count == 0 {
            return Err(AdapterError::NotInQueue {
                name: lock.name.clone(),
            });
        }

        lock.transition(LockStatus::Released)
            .map_err(|e| AdapterError::Store(e.to_string()))?;
        Ok(())
    }

    async fn release_all(&self) -> Result<(), AdapterError> {
        self.collection
            .delete_many(doc! {}, None)
            .await
            .map_err(AdapterError::Mongo)?;
        Ok(())
    }

    fn supports_gc(&self) -> bool {
        true
    }

    async fn gc(&self, input: GcInput<'_>) -> Result<GcOutcome, AdapterError> {
        let collect = self
            .collection
            .update_many(
                doc! {},
                doc! { "$pull": { "queue": { "at": { "$lt": input.stale_at_ms } } } },
                None,
            )
            .await
            .map_err(AdapterError::Mongo)?;

        let mut refreshed_count = 0u64;
        for lock in input.registry.all() {
            let result = self
                .collection
                .update_one(
                    doc! { "queue.id": lock.id.as_str() },
                    doc! {
                        "$max": {
                            "queue.$.at": input.at_ms,
                            "at": input.at_ms,
                        }
                    },
                    UpdateOptions::builder().build(),
                )
                .await
                .map_err(AdapterError::Mongo)?;
            if result.modified_count > 0 {
                refreshed_count += 1;
            }
        }

        tracing::trace!(
            collected_count = collect.modified_count,
            refreshed_count,
            "mongo gc pass"
        );
        Ok(GcOutcome {
            collected_count: collect.modified_count,
            refreshed_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, kind: QueueEntryKind) -> QueueEntryDoc {
        QueueEntryDoc {
            id: id.to_string(),
            kind,
            at: 0,
        }
    }

    #[test]
    fn writer_admitted_only_at_head() {
        let queue = vec![entry("a", QueueEntryKind::Writer), entry("b", QueueEntryKind::Reader)];
        assert!(MongoAdapter::admitted(&queue, "a", LockType::Writer));
        assert!(!MongoAdapter::admitted(&queue, "b", LockType::Writer));
    }

    #[test]
    fn reader_admitted_unless_writer_precedes() {
        let queue = vec![entry("a", QueueEntryKind::Reader), entry("b", QueueEntryKind::Reader)];
        assert!(MongoAdapter::admitted(&queue, "b", LockType::Reader));

        let queue = vec![entry("a", QueueEntryKind::Writer), entry("b", QueueEntryKind::Reader)];
        assert!(!MongoAdapter::admitted(&queue, "b", LockType::Reader));
    }

    #[test]
    fn absent_entry_is_never_admitted() {
        let queue = vec![entry("a", QueueEntryKind::Reader)];
        assert!(!MongoAdapter::admitted(&queue, "missing", LockType::Reader));
    }

    #[test]
    fn config_defaults_collection_name_when_omitted() {
        let parsed: MongoAdapterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.collection_name, "locks");
        assert_eq!(parsed.server_version, None);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = MongoAdapterConfig {
            collection_name: "custom_locks".to_string(),
            server_version: Some("6.0".to_string()),
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: MongoAdapterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.collection_name, "custom_locks");
        assert_eq!(parsed.server_version.as_deref(), Some("6.0"));
    }
}
