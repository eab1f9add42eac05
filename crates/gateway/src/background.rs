//! Long-lived background workers: session sweeper, impression flusher,
//! and the API-key usage writer.
//!
//! Each worker is an independent scheduled task holding a shutdown watch
//! receiver. On graceful shutdown the flusher and usage writer drain their
//! queues, bounded by the shutdown deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use tunetrail_core::ApiKeyId;
use tunetrail_repo::Repository;

use crate::impressions::ImpressionBuffer;
use crate::metrics::GatewayMetrics;
use crate::sessions::SessionManager;

/// Configuration for the background workers.
#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    /// How often the session sweeper runs (default: 60 seconds).
    pub sweep_interval: Duration,
    /// How often the impression flusher runs (default: 1 second).
    pub impression_flush_interval: Duration,
    /// Largest batch handed to the repository per flush.
    pub flush_batch_size: usize,
    /// Capacity of the usage-event channel.
    pub usage_channel_capacity: usize,
    /// Budget for draining queues at shutdown (default: 10 seconds).
    pub shutdown_deadline: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            impression_flush_interval: Duration::from_secs(1),
            flush_batch_size: 500,
            usage_channel_capacity: 4_096,
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

/// One authenticated API-key request, recorded out of the request path.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub key_id: ApiKeyId,
    pub endpoint: String,
    pub status: u16,
    pub occurred_at: DateTime<Utc>,
    /// Refresh the key's `last_used_at` alongside the log append.
    pub touch_last_used: bool,
}

/// Handle over the spawned workers.
pub struct BackgroundHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    deadline: Duration,
}

impl BackgroundHandle {
    /// Signal shutdown and wait for the workers to drain, bounded by the
    /// shutdown deadline.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if tokio::time::timeout(self.deadline, handle).await.is_err() {
                warn!("background worker did not drain before the shutdown deadline");
            }
        }
        info!("background workers stopped");
    }
}

/// Spawns and wires the background workers.
pub struct BackgroundWorkers;

impl BackgroundWorkers {
    /// Create the usage-event channel with the configured capacity.
    #[must_use]
    pub fn usage_channel(
        config: &BackgroundConfig,
    ) -> (mpsc::Sender<UsageEvent>, mpsc::Receiver<UsageEvent>) {
        mpsc::channel(config.usage_channel_capacity)
    }

    /// Spawn the sweeper, flusher, and usage writer.
    #[must_use]
    pub fn spawn(
        sessions: Arc<SessionManager>,
        repo: Arc<dyn Repository>,
        buffer: Arc<ImpressionBuffer>,
        metrics: Arc<GatewayMetrics>,
        usage_rx: mpsc::Receiver<UsageEvent>,
        config: BackgroundConfig,
    ) -> BackgroundHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = vec![
            tokio::spawn(run_sweeper(
                sessions,
                config.sweep_interval,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_flusher(
                Arc::clone(&repo),
                buffer,
                metrics,
                config.impression_flush_interval,
                config.flush_batch_size,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_usage_writer(repo, usage_rx, shutdown_rx)),
        ];

        info!("background workers started");
        BackgroundHandle {
            shutdown_tx,
            handles,
            deadline: config.shutdown_deadline,
        }
    }
}

/// Periodically expire idle sessions and finalize their summaries.
async fn run_sweeper(
    sessions: Arc<SessionManager>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut timer = interval(every);
    // The first tick completes immediately; skip it so the sweep doesn't
    // run at startup.
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match sessions.sweep().await {
                    Ok(0) => {}
                    Ok(n) => debug!(expired = n, "session sweep pass complete"),
                    Err(e) => warn!(error = %e, "session sweep failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Periodically persist buffered impressions; drain everything on
/// shutdown.
async fn run_flusher(
    repo: Arc<dyn Repository>,
    buffer: Arc<ImpressionBuffer>,
    metrics: Arc<GatewayMetrics>,
    every: Duration,
    batch_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut timer = interval(every);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                flush_once(&repo, &buffer, &metrics, batch_size).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Final drain so accepted impressions survive a graceful shutdown.
    // Stops early when the repository is down rather than spinning.
    while !buffer.is_empty() {
        if !flush_once(&repo, &buffer, &metrics, batch_size).await {
            break;
        }
    }
}

/// Flush buffered impressions in batches. Returns `false` when a batch
/// failed to persist.
async fn flush_once(
    repo: &Arc<dyn Repository>,
    buffer: &ImpressionBuffer,
    metrics: &GatewayMetrics,
    batch_size: usize,
) -> bool {
    loop {
        let batch = buffer.drain(batch_size);
        if batch.is_empty() {
            return true;
        }
        let count = batch.len() as u64;
        match repo.insert_impressions(&batch).await {
            Ok(()) => GatewayMetrics::add(&metrics.impressions_flushed, count),
            Err(e) => {
                // Impressions are telemetry; losing a batch is logged, not
                // retried into a pile-up.
                warn!(error = %e, count, "failed to flush impression batch");
                return false;
            }
        }
    }
}

/// Consume usage events: append to the usage log and refresh
/// `last_used_at`. Both writes are fire-and-forget from the request path.
async fn run_usage_writer(
    repo: Arc<dyn Repository>,
    mut usage_rx: mpsc::Receiver<UsageEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = usage_rx.recv() => {
                match event {
                    Some(event) => write_usage(&repo, event).await,
                    None => break,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Drain anything already queued.
    while let Ok(event) = usage_rx.try_recv() {
        write_usage(&repo, event).await;
    }
}

async fn write_usage(repo: &Arc<dyn Repository>, event: UsageEvent) {
    let record = tunetrail_core::ApiKeyUsageRecord {
        key_id: event.key_id.clone(),
        endpoint: event.endpoint,
        status: event.status,
        occurred_at: event.occurred_at,
    };
    if let Err(e) = repo.append_key_usage(&record).await {
        warn!(error = %e, key_id = %event.key_id, "failed to append key usage");
    }
    if event.touch_last_used
        && let Err(e) = repo
            .touch_api_key_last_used(&event.key_id, event.occurred_at)
            .await
    {
        warn!(error = %e, key_id = %event.key_id, "failed to touch last_used_at");
    }
}
