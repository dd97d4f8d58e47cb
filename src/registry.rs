// Session registry: process-wide index of capture workers and snapshot
// pipelines, keyed by device serial. Owns their lifecycle from creation
// to shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::adb::bridge::BridgeDriver;
use crate::config::{CaptureConfig, Config};
use crate::error::Result;
use crate::snapshot::pipeline::{DecoderState, SnapshotPipeline};
use crate::stream::hub::SubscriberStats;
use crate::stream::worker::{CaptureWorker, WorkerState};

/// Read-only per-device observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub serial: String,
    pub worker_state: WorkerState,
    pub stream_subscribers: usize,
    pub snapshot_channels: usize,
    pub bytes_ingested: u64,
    pub units_broadcast: u64,
    pub subscribers: Vec<SubscriberStats>,
    pub decoder_state: DecoderState,
    pub last_idr_age_ms: Option<u64>,
}

struct SessionEntry {
    worker: Arc<CaptureWorker>,
    snapshot: Option<Arc<SnapshotPipeline>>,
}

pub struct SessionRegistry {
    bridge: BridgeDriver,
    settings: Arc<Config>,
    inner: tokio::sync::Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(bridge: BridgeDriver, settings: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            settings,
            inner: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Worker for `serial`, created and started on first use. An
    /// existing worker is returned as-is; its config is not touched
    /// (use `update_config` on the worker for that).
    pub async fn get_or_create_worker(
        &self,
        serial: &str,
        config: CaptureConfig,
    ) -> Result<Arc<CaptureWorker>> {
        let worker = self.entry_worker(serial, config).await;

        // Start outside the registry lock; per-entry operations must not
        // serialize against unrelated devices.
        if let Err(e) = worker.start().await {
            warn!(serial, error = %e, "worker start failed, removing session");
            self.inner.lock().await.remove(serial);
            return Err(e);
        }
        Ok(worker)
    }

    /// Snapshot pipeline for `serial`, created on first use. The worker
    /// entry is created alongside; `attach` starts it when needed.
    pub async fn get_or_create_snapshot(&self, serial: &str) -> Arc<SnapshotPipeline> {
        let mut inner = self.inner.lock().await;
        let entry = self.entry_locked(&mut inner, serial, CaptureConfig::default());
        if entry.snapshot.is_none() {
            entry.snapshot = Some(SnapshotPipeline::new(
                serial.to_string(),
                Arc::clone(&entry.worker),
                Arc::clone(&self.settings),
            ));
        }
        Arc::clone(entry.snapshot.as_ref().unwrap())
    }

    async fn entry_worker(&self, serial: &str, config: CaptureConfig) -> Arc<CaptureWorker> {
        let mut inner = self.inner.lock().await;
        Arc::clone(&self.entry_locked(&mut inner, serial, config).worker)
    }

    fn entry_locked<'a>(
        &self,
        inner: &'a mut HashMap<String, SessionEntry>,
        serial: &str,
        config: CaptureConfig,
    ) -> &'a mut SessionEntry {
        inner.entry(serial.to_string()).or_insert_with(|| {
            info!(serial, "creating capture session");
            SessionEntry {
                worker: CaptureWorker::new(
                    serial.to_string(),
                    self.bridge.clone(),
                    Arc::clone(&self.settings),
                    config,
                ),
                snapshot: None,
            }
        })
    }

    /// Stop and forget everything for one device.
    pub async fn stop(&self, serial: &str) {
        let entry = self.inner.lock().await.remove(serial);
        if let Some(entry) = entry {
            if let Some(snapshot) = entry.snapshot {
                snapshot.shutdown().await;
            }
            entry.worker.stop().await;
            info!(serial, "capture session removed");
        }
    }

    /// Process-shutdown path: stop every session within the configured
    /// deadline. Subprocesses are killed rather than awaited on expiry.
    pub async fn stop_all(&self) {
        let entries: Vec<(String, SessionEntry)> =
            self.inner.lock().await.drain().collect();
        if entries.is_empty() {
            return;
        }
        info!(sessions = entries.len(), "stopping all capture sessions");

        let shutdowns = entries.into_iter().map(|(serial, entry)| async move {
            if let Some(snapshot) = entry.snapshot {
                snapshot.shutdown().await;
            }
            entry.worker.stop().await;
            serial
        });

        let all = futures_util::future::join_all(shutdowns);
        match tokio::time::timeout(self.settings.shutdown_deadline, all).await {
            Ok(serials) => info!(count = serials.len(), "all sessions stopped"),
            // kill_on_drop reaps whatever is still alive once the
            // pending futures are dropped here.
            Err(_) => warn!(
                "shutdown deadline of {:?} expired, remaining subprocesses killed",
                self.settings.shutdown_deadline
            ),
        }
    }

    /// Metrics for every live session.
    pub async fn metrics(&self) -> Vec<SessionMetrics> {
        let inner = self.inner.lock().await;
        let mut out: Vec<SessionMetrics> = inner
            .iter()
            .map(|(serial, entry)| {
                let hub_stats = entry.worker.hub().stats();
                SessionMetrics {
                    serial: serial.clone(),
                    worker_state: entry.worker.state(),
                    stream_subscribers: hub_stats.subscriber_count,
                    snapshot_channels: entry
                        .snapshot
                        .as_ref()
                        .map(|s| s.channel_count())
                        .unwrap_or(0),
                    bytes_ingested: entry.worker.bytes_ingested(),
                    units_broadcast: hub_stats.units_broadcast,
                    subscribers: hub_stats.subscribers,
                    decoder_state: entry
                        .snapshot
                        .as_ref()
                        .map(|s| s.decoder_state())
                        .unwrap_or(DecoderState::Idle),
                    last_idr_age_ms: hub_stats
                        .last_idr_at
                        .map(|t| t.elapsed().as_millis() as u64),
                }
            })
            .collect();
        out.sort_by(|a, b| a.serial.cmp(&b.serial));
        out
    }
}
