use crate::manager::{EndpointHandle, ManagerOptions, StreamHandle};
use crate::router::EventRouter;
use adapters::{ErrorKind, RawEvent, ReplicationSource, ShardReader};
use catalog::{Checkpoint, CheckpointStore, ReplicationRepository, StreamStatus};
use exponential_backoff::Backoff;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerContext {
    pub replication_id: String,
    pub shard_id: String,
    pub source: Arc<ReplicationSource>,
    pub source_endpoint: Arc<dyn EndpointHandle>,
    pub target_endpoint: Arc<dyn EndpointHandle>,
    pub router: Arc<EventRouter>,
    pub repository: Arc<dyn ReplicationRepository>,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub options: ManagerOptions,
    pub handle: Arc<StreamHandle>,
}

enum ApplyOutcome {
    /// Handler succeeded; the position may advance.
    Applied,
    /// Event-level data problem; logged, counted, and skipped so the
    /// stream continues.
    Skipped,
    /// Retries exhausted or a permanent failure; the stream stops.
    Fatal,
    /// Stop was signalled mid-retry.
    Stopped,
}

/// One worker task per source shard. Workers share nothing but the
/// source's atomic active flag, its position lock and the stop signal;
/// within a worker, parse -> apply -> position-advance is totally
/// ordered.
pub(crate) async fn run(ctx: WorkerContext, mut reader: Box<dyn ShardReader>) {
    let stop = ctx.source.stop_signal();

    if let Some(position) = ctx.source.position() {
        if let Err(err) = reader.seek(&position).await {
            tracing::warn!(
                replication_id = %ctx.replication_id,
                shard = %ctx.shard_id,
                error = %err,
                "failed to seek shard reader; starting from its default position",
            );
        }
    }

    let mut events_since_checkpoint: u64 = 0;
    let mut last_checkpoint = Instant::now();
    let mut read_failures: u32 = 0;

    'run: while ctx.source.is_active() {
        let batch = tokio::select! {
            _ = stop.cancelled() => break 'run,
            batch = reader.next_batch(ctx.options.batch_size) => batch,
        };

        let events = match batch {
            Err(err) if err.is_transient() => {
                // Bounded doubling backoff; the position stays put.
                let delay = read_backoff(&ctx.options, read_failures);
                read_failures = read_failures.saturating_add(1);
                tracing::warn!(
                    replication_id = %ctx.replication_id,
                    shard = %ctx.shard_id,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "transient read failure; backing off",
                );
                if sleep_or_stop(&stop, delay).await {
                    break 'run;
                }
                continue;
            }
            Err(err) => {
                tracing::error!(
                    replication_id = %ctx.replication_id,
                    shard = %ctx.shard_id,
                    error = %err,
                    "permanent read failure; stopping stream",
                );
                fail_stream(&ctx, &err.to_string()).await;
                break 'run;
            }
            Ok(events) => events,
        };
        read_failures = 0;

        if events.is_empty() {
            if sleep_or_stop(&stop, ctx.options.poll_interval).await {
                break 'run;
            }
            continue;
        }

        for raw in events {
            if !ctx.source.is_active() {
                break 'run;
            }
            ctx.router.stats().record_received(
                raw.payload.to_string().len() as u64,
                chrono::Utc::now().timestamp(),
            );

            match apply_with_retry(&ctx, &stop, &raw).await {
                ApplyOutcome::Applied => {
                    ctx.source.record_position(&raw.position);
                    events_since_checkpoint += 1;
                }
                ApplyOutcome::Skipped => {
                    // Advance past the poisoned event so a restart does
                    // not replay it forever.
                    ctx.source.record_position(&raw.position);
                    events_since_checkpoint += 1;
                }
                ApplyOutcome::Fatal => {
                    fail_stream(&ctx, "event apply failed permanently").await;
                    break 'run;
                }
                ApplyOutcome::Stopped => break 'run,
            }

            let due = events_since_checkpoint >= ctx.options.checkpoint_every_events
                || last_checkpoint.elapsed() >= ctx.options.checkpoint_interval;
            if due {
                checkpoint(&ctx, reader.as_mut()).await;
                events_since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }
        }
    }

    // Final checkpoint before release, so `stop` persists the position.
    checkpoint(&ctx, reader.as_mut()).await;
    if let Err(err) = reader.close().await {
        tracing::warn!(
            replication_id = %ctx.replication_id,
            shard = %ctx.shard_id,
            error = %err,
            "failed to close shard reader",
        );
    }
    tracing::info!(
        replication_id = %ctx.replication_id,
        shard = %ctx.shard_id,
        "worker exited",
    );
}

async fn apply_with_retry(
    ctx: &WorkerContext,
    stop: &CancellationToken,
    raw: &RawEvent,
) -> ApplyOutcome {
    let backoff = Backoff::new(
        ctx.options.max_apply_retries,
        ctx.options.backoff_min,
        ctx.options.backoff_max,
    );
    let mut delays = backoff.iter();

    loop {
        let outcome = async {
            let source = ctx.source_endpoint.replication()?;
            let target = ctx.target_endpoint.replication()?;
            ctx.router.route(source, target, raw).await
        }
        .await;

        let err = match outcome {
            Ok(_) => return ApplyOutcome::Applied,
            Err(err) => err,
        };

        match err.kind {
            // Data problems are event-scoped: count and move on.
            ErrorKind::InvalidData | ErrorKind::MissingKey | ErrorKind::Transformation => {
                tracing::warn!(
                    replication_id = %ctx.replication_id,
                    shard = %ctx.shard_id,
                    error = %err,
                    "skipping undeliverable event",
                );
                ctx.router.stats().record_failed();
                return ApplyOutcome::Skipped;
            }
            _ if err.is_transient() => match delays.next() {
                Some(delay) => {
                    tracing::warn!(
                        replication_id = %ctx.replication_id,
                        shard = %ctx.shard_id,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient apply failure; retrying",
                    );
                    if sleep_or_stop(stop, delay).await {
                        return ApplyOutcome::Stopped;
                    }
                }
                None => {
                    tracing::error!(
                        replication_id = %ctx.replication_id,
                        error = %err,
                        "apply retries exhausted",
                    );
                    ctx.router.stats().record_failed();
                    return ApplyOutcome::Fatal;
                }
            },
            _ => {
                tracing::error!(
                    replication_id = %ctx.replication_id,
                    error = %err,
                    "permanent apply failure",
                );
                ctx.router.stats().record_failed();
                return ApplyOutcome::Fatal;
            }
        }
    }
}

async fn checkpoint(ctx: &WorkerContext, reader: &mut dyn ShardReader) {
    let Some(position) = ctx.source.position() else {
        return;
    };
    if let Some(store) = &ctx.checkpoints {
        let saved = store
            .save(Checkpoint {
                replication_id: ctx.replication_id.clone(),
                token: position.clone(),
                saved_at: chrono::Utc::now().timestamp(),
            })
            .await;
        if let Err(err) = saved {
            // Checkpoint failures never stop the stream.
            tracing::warn!(
                replication_id = %ctx.replication_id,
                error = %err,
                "failed to persist checkpoint",
            );
        }
    }
    if let Err(err) = reader.ack(&position).await {
        tracing::warn!(
            replication_id = %ctx.replication_id,
            shard = %ctx.shard_id,
            error = %err,
            "failed to acknowledge position upstream",
        );
    }
}

// Marks the stream failed exactly once and halts its other workers.
async fn fail_stream(ctx: &WorkerContext, message: &str) {
    if ctx.handle.failed.swap(true, Ordering::SeqCst) {
        return;
    }
    ctx.source.deactivate();
    if let Err(err) = ctx
        .repository
        .update_replication_source_status(&ctx.replication_id, StreamStatus::Failed, message)
        .await
    {
        tracing::warn!(
            replication_id = %ctx.replication_id,
            error = %err,
            "failed to record stream failure",
        );
    }
}

fn read_backoff(options: &ManagerOptions, failures: u32) -> Duration {
    let doubled = options
        .backoff_min
        .saturating_mul(2u32.saturating_pow(failures.min(16)));
    doubled.min(options.backoff_max)
}

/// True when stop fired before the delay elapsed.
async fn sleep_or_stop(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
