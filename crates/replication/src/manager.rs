use crate::router::EventRouter;
use crate::worker::{self, WorkerContext};
use adapters::{Error, ReplicationOperator, ReplicationSource, Result};
use catalog::{Checkpoint, CheckpointStore, ReplicationRepository, ReplicationSourceRecord, StreamStatus};
use models::ReplicationConfig;
use ops::{EventStats, StatsSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use transform::{MutationClient, TransformRule};

/// Anything a stream endpoint hangs off: a registry connection or the
/// in-memory store. Gives workers long-lived access to the replication
/// operator facet.
pub trait EndpointHandle: Send + Sync + 'static {
    fn replication(&self) -> Result<&dyn ReplicationOperator>;
}

impl EndpointHandle for adapters::Connection {
    fn replication(&self) -> Result<&dyn ReplicationOperator> {
        adapters::Connection::replication(self)
    }
}

impl EndpointHandle for adapters::memory::MemoryStore {
    fn replication(&self) -> Result<&dyn ReplicationOperator> {
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Bound on waiting for workers to observe a stop.
    pub stop_deadline: Duration,
    /// Idle wait between empty reads.
    pub poll_interval: Duration,
    /// Events fetched per read.
    pub batch_size: usize,
    /// Persist the position every N applied events...
    pub checkpoint_every_events: u64,
    /// ...or after this long, whichever comes first.
    pub checkpoint_interval: Duration,
    /// Apply retries before a stream fails.
    pub max_apply_retries: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            stop_deadline: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            checkpoint_every_events: 100,
            checkpoint_interval: Duration::from_secs(10),
            max_apply_retries: 5,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Everything needed to (re)connect one stream.
#[derive(Clone)]
pub struct StreamSpec {
    pub replication: ReplicationConfig,
    /// Relationship whose status mirrors this stream's, when set.
    pub relationship_id: Option<String>,
    pub rules: Vec<TransformRule>,
}

pub(crate) struct StreamHandle {
    spec: StreamSpec,
    source_endpoint: Arc<dyn EndpointHandle>,
    target_endpoint: Arc<dyn EndpointHandle>,
    router: Arc<EventRouter>,
    stats: Arc<EventStats>,
    source: Mutex<Option<Arc<ReplicationSource>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) failed: AtomicBool,
}

/// The per-process owner of running change streams: start, stop,
/// resume, checkpoint and shutdown. Constructed at the engine root.
pub struct ReplicationManager {
    repository: Arc<dyn ReplicationRepository>,
    /// Unset means no persistent checkpointing: streams restart from
    /// their last in-memory position only.
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    options: ManagerOptions,
    streams: RwLock<HashMap<String, Arc<StreamHandle>>>,
}

impl ReplicationManager {
    pub fn new(
        repository: Arc<dyn ReplicationRepository>,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            repository,
            checkpoints,
            options,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Register and start a stream. Starting an already-active stream
    /// is a no-op.
    pub async fn start_stream(
        &self,
        spec: StreamSpec,
        source_endpoint: Arc<dyn EndpointHandle>,
        target_endpoint: Arc<dyn EndpointHandle>,
        mutation: Option<Arc<dyn MutationClient>>,
    ) -> Result<()> {
        let replication_id = spec.replication.replication_id.clone();

        if let Some(handle) = self.handle(&replication_id).await {
            if self.is_active(&replication_id).await {
                return Ok(());
            }
            // A stopped stream restarts from its last known position.
            let position = match &*handle.source.lock().await {
                Some(source) => source.position(),
                None => handle.spec.replication.start_position.clone(),
            };
            return self.spin_up(&handle, position).await;
        }

        self.ensure_record(&spec).await?;

        let stats = Arc::new(EventStats::default());
        let handle = Arc::new(StreamHandle {
            router: Arc::new(EventRouter::new(spec.rules.clone(), mutation, stats.clone())),
            stats,
            spec,
            source_endpoint,
            target_endpoint,
            source: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
        });

        let position = handle.spec.replication.start_position.clone();
        self.streams
            .write()
            .await
            .insert(replication_id, handle.clone());
        self.spin_up(&handle, position).await
    }

    /// Stop a stream: flip it inactive, wait for its workers within the
    /// stop deadline, persist the final position. Idempotent.
    pub async fn stop_stream(&self, replication_id: &str) -> Result<()> {
        let handle = self.handle(replication_id).await.ok_or_else(|| {
            Error::not_found("stop_stream", format!("stream '{replication_id}' is not registered"))
        })?;
        self.stop_handle(replication_id, &handle).await;
        self.repository
            .update_replication_source_status(replication_id, StreamStatus::Stopped, "stopped")
            .await
            .map_err(into_adapter_err)?;
        self.update_relationship(&handle, StreamStatus::Stopped, "stopped")
            .await;
        Ok(())
    }

    /// Resume from the most recent persisted checkpoint. Without one,
    /// the stream starts from the mechanism's tail.
    pub async fn resume_stream(&self, replication_id: &str) -> Result<()> {
        let handle = self.handle(replication_id).await.ok_or_else(|| {
            Error::not_found(
                "resume_stream",
                format!("stream '{replication_id}' is not registered"),
            )
        })?;
        if self.is_active(replication_id).await {
            return Ok(());
        }

        let position = match &self.checkpoints {
            Some(store) => store
                .latest(replication_id)
                .await
                .map_err(into_adapter_err)?
                .map(|checkpoint| checkpoint.token),
            None => None,
        };
        self.spin_up(&handle, position).await
    }

    /// Stop, release and forget a stream, removing its catalog record.
    pub async fn remove_stream(&self, replication_id: &str) -> Result<()> {
        let handle = self.streams.write().await.remove(replication_id);
        if let Some(handle) = handle {
            self.stop_handle(replication_id, &handle).await;
        }
        self.repository
            .remove_replication_source(replication_id)
            .await
            .map_err(into_adapter_err)?;
        Ok(())
    }

    pub async fn is_active(&self, replication_id: &str) -> bool {
        match self.handle(replication_id).await {
            Some(handle) => match &*handle.source.lock().await {
                Some(source) => source.is_active(),
                None => false,
            },
            None => false,
        }
    }

    pub async fn stream_stats(&self, replication_id: &str) -> Option<StatsSnapshot> {
        self.handle(replication_id)
            .await
            .map(|handle| handle.stats.snapshot())
    }

    pub async fn stream_position(&self, replication_id: &str) -> Option<String> {
        let handle = self.handle(replication_id).await?;
        let source = handle.source.lock().await;
        source.as_ref().and_then(|source| source.position())
    }

    /// Graceful engine shutdown: persist every stream's state, mark the
    /// records STOPPED so nothing auto-restarts, then stop and close,
    /// all bounded by `deadline`. Streams still running at the deadline
    /// are force-closed.
    pub async fn shutdown(&self, deadline: Duration) {
        let handles: Vec<(String, Arc<StreamHandle>)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let orderly = async {
            for (replication_id, handle) in &handles {
                self.persist_position(replication_id, handle).await;
                if let Err(err) = self
                    .repository
                    .update_replication_source_status(
                        replication_id,
                        StreamStatus::Stopped,
                        "engine shutdown",
                    )
                    .await
                {
                    tracing::warn!(replication_id = %replication_id, error = %err, "failed to record shutdown status");
                }
                self.update_relationship(handle, StreamStatus::Stopped, "engine shutdown")
                    .await;
                self.stop_handle(replication_id, handle).await;
            }
        };
        if tokio::time::timeout(deadline, orderly).await.is_err() {
            tracing::warn!("shutdown deadline exceeded; force-closing remaining streams");
            for (_, handle) in &handles {
                if let Some(source) = &*handle.source.lock().await {
                    source.deactivate();
                }
                for worker in handle.workers.lock().await.drain(..) {
                    worker.abort();
                }
            }
        }
    }

    async fn handle(&self, replication_id: &str) -> Option<Arc<StreamHandle>> {
        self.streams.read().await.get(replication_id).cloned()
    }

    async fn ensure_record(&self, spec: &StreamSpec) -> Result<()> {
        let replication_id = &spec.replication.replication_id;
        if self
            .repository
            .get_replication_source(replication_id)
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.repository
            .create_replication_source(ReplicationSourceRecord {
                replication_id: replication_id.clone(),
                database_id: spec.replication.database_id.clone(),
                tables: spec.replication.tables.clone(),
                status: StreamStatus::Created,
                status_message: String::new(),
            })
            .await
            .map_err(into_adapter_err)
    }

    // Connect the source and launch one worker per shard reader.
    async fn spin_up(&self, handle: &Arc<StreamHandle>, position: Option<String>) -> Result<()> {
        let mut config = handle.spec.replication.clone();
        config.start_position = position;

        let operator = handle.source_endpoint.replication()?;
        let source = Arc::new(operator.connect_source(config).await?);
        source.activate();
        handle.failed.store(false, Ordering::SeqCst);

        let readers = source.take_readers().await.unwrap_or_default();
        let replication_id = handle.spec.replication.replication_id.clone();
        tracing::info!(
            replication_id = %replication_id,
            shards = readers.len(),
            "starting replication stream",
        );

        let mut workers = handle.workers.lock().await;
        workers.clear();
        for reader in readers {
            let context = WorkerContext {
                replication_id: replication_id.clone(),
                shard_id: reader.shard_id().to_string(),
                source: source.clone(),
                source_endpoint: handle.source_endpoint.clone(),
                target_endpoint: handle.target_endpoint.clone(),
                router: handle.router.clone(),
                repository: self.repository.clone(),
                checkpoints: self.checkpoints.clone(),
                options: self.options.clone(),
                handle: handle.clone(),
            };
            workers.push(tokio::spawn(worker::run(context, reader)));
        }
        drop(workers);

        *handle.source.lock().await = Some(source);
        self.repository
            .update_replication_source_status(&replication_id, StreamStatus::Active, "streaming")
            .await
            .map_err(into_adapter_err)?;
        self.update_relationship(handle, StreamStatus::Active, "streaming")
            .await;
        Ok(())
    }

    async fn stop_handle(&self, replication_id: &str, handle: &Arc<StreamHandle>) {
        let source = handle.source.lock().await.clone();
        let Some(source) = source else {
            return;
        };
        if source.deactivate() {
            tracing::info!(replication_id = %replication_id, "stopping replication stream");
        }

        let workers: Vec<JoinHandle<()>> = handle.workers.lock().await.drain(..).collect();
        let wait_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.options.stop_deadline, wait_all)
            .await
            .is_err()
        {
            // Workers are abandoned; their resources are reclaimed
            // best-effort when the tasks are dropped.
            tracing::warn!(replication_id = %replication_id, "stop deadline exceeded; abandoning workers");
        }
        self.persist_position(replication_id, handle).await;
    }

    async fn persist_position(&self, replication_id: &str, handle: &Arc<StreamHandle>) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let position = {
            let source = handle.source.lock().await;
            source.as_ref().and_then(|source| source.position())
        };
        let Some(token) = position else {
            return;
        };
        if let Err(err) = store
            .save(Checkpoint {
                replication_id: replication_id.to_string(),
                token,
                saved_at: chrono::Utc::now().timestamp(),
            })
            .await
        {
            tracing::warn!(replication_id = %replication_id, error = %err, "failed to persist checkpoint");
        }
    }

    async fn update_relationship(
        &self,
        handle: &Arc<StreamHandle>,
        status: StreamStatus,
        message: &str,
    ) {
        let Some(relationship_id) = &handle.spec.relationship_id else {
            return;
        };
        if let Err(err) = self
            .repository
            .update_relationship_status(relationship_id, status, message)
            .await
        {
            tracing::warn!(relationship_id = %relationship_id, error = %err, "failed to record relationship status");
        }
    }
}

pub(crate) fn into_adapter_err(err: catalog::Error) -> Error {
    let kind = match err {
        catalog::Error::NotFound { .. } => adapters::ErrorKind::NotFound,
        catalog::Error::Conflict { .. } => adapters::ErrorKind::Configuration,
        catalog::Error::Storage(_) => adapters::ErrorKind::Transient,
    };
    Error::new(kind, "catalog", err.to_string()).with_source(err)
}
