use crate::error::{Error, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One raw change record read from a source shard, not yet translated
/// into the canonical event shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub shard_id: String,
    /// The source-level position token to checkpoint once this event has
    /// been applied. Opaque; already merged across shards where the
    /// mechanism is sharded.
    pub position: String,
    /// The store's native event payload, as JSON.
    pub payload: Value,
}

/// A single-threaded reader over one partition or shard of a change
/// stream. The replication manager runs one worker task per reader.
#[async_trait::async_trait]
pub trait ShardReader: Send {
    fn shard_id(&self) -> &str;

    /// Reposition the reader to resume after `position`. Called before
    /// the first `next_batch` when a source holds a position token.
    async fn seek(&mut self, position: &str) -> Result<()>;

    /// Read the next batch of raw events, blocking up to the adapter's
    /// poll interval. An empty batch means no events arrived in time.
    async fn next_batch(&mut self, max_events: usize) -> Result<Vec<RawEvent>>;

    /// Acknowledge that everything up to `position` is durably applied,
    /// for mechanisms with upstream acknowledgement (replication slots,
    /// consumer offsets). A no-op elsewhere.
    async fn ack(&mut self, position: &str) -> Result<()>;

    /// Release the shard's scoped resource (iterator, slot stream).
    async fn close(&mut self) -> Result<()>;
}

/// A running change stream tied to one source connection and a set of
/// tables. Owned by the replication manager; the underlying connection
/// outlives it.
pub struct ReplicationSource {
    replication_id: String,
    database_id: String,
    tables: Vec<String>,
    // `active` and `last_position` transition only under this source's
    // own synchronization; position never moves backward except by an
    // explicit `set_position` before start.
    active: AtomicBool,
    last_position: RwLock<Option<String>>,
    stop: CancellationToken,
    readers: Mutex<Option<Vec<Box<dyn ShardReader>>>>,
}

impl ReplicationSource {
    pub fn new(
        replication_id: impl Into<String>,
        database_id: impl Into<String>,
        tables: Vec<String>,
        start_position: Option<String>,
        readers: Vec<Box<dyn ShardReader>>,
    ) -> Self {
        Self {
            replication_id: replication_id.into(),
            database_id: database_id.into(),
            tables,
            active: AtomicBool::new(false),
            last_position: RwLock::new(start_position),
            stop: CancellationToken::new(),
            readers: Mutex::new(Some(readers)),
        }
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Explicitly reposition the source. Only legal while stopped.
    pub fn set_position(&self, position: impl Into<String>) -> Result<()> {
        if self.is_active() {
            return Err(Error::configuration(
                "set_position",
                format!(
                    "replication source '{}' is active; stop it before repositioning",
                    self.replication_id,
                ),
            ));
        }
        *self.last_position.write().expect("position lock poisoned") = Some(position.into());
        Ok(())
    }

    pub fn position(&self) -> Option<String> {
        self.last_position
            .read()
            .expect("position lock poisoned")
            .clone()
    }

    /// Advance the stored position after an event handler succeeds.
    pub fn record_position(&self, position: &str) {
        let mut guard = self.last_position.write().expect("position lock poisoned");
        *guard = Some(position.to_string());
    }

    /// Flip inactive -> active. False when the source was already
    /// active, making `start` idempotent for callers.
    pub fn activate(&self) -> bool {
        !self.active.swap(true, Ordering::SeqCst)
    }

    /// Flip active -> inactive and fire the stop signal. False when the
    /// source was already stopped.
    pub fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            self.stop.cancel();
        }
        was_active
    }

    /// The stop signal observed by every worker loop at each suspension
    /// point.
    pub fn stop_signal(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Take the shard readers to spawn workers over them. Present
    /// exactly once per `connect_source`; a restarted source is
    /// reconnected by the manager.
    pub async fn take_readers(&self) -> Option<Vec<Box<dyn ShardReader>>> {
        self.readers.lock().await.take()
    }

    /// Whether readers are still waiting to be taken.
    pub async fn has_readers(&self) -> bool {
        self.readers.lock().await.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn activation_is_idempotent() {
        let source = ReplicationSource::new("rep-1", "db-1", vec![], None, vec![]);

        assert!(source.activate());
        assert!(!source.activate());
        assert!(source.is_active());

        assert!(source.deactivate());
        assert!(!source.deactivate());
        assert!(source.stop_signal().is_cancelled());
    }

    #[tokio::test]
    async fn set_position_requires_a_stopped_source() {
        let source = ReplicationSource::new("rep-1", "db-1", vec![], None, vec![]);
        source.set_position("LSN/1").unwrap();
        assert_eq!(source.position(), Some("LSN/1".to_string()));

        source.activate();
        let err = source.set_position("LSN/2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(source.position(), Some("LSN/1".to_string()));

        source.record_position("LSN/3");
        assert_eq!(source.position(), Some("LSN/3".to_string()));
    }
}
