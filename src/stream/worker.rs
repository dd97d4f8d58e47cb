// Capture worker: one per device. Drives the device-side encoder agent
// through the bridge, reads its TCP stream, and feeds the broadcast hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adb::bridge::{BridgeDriver, DeviceProcessHandle};
use crate::config::{CaptureConfig, Config};
use crate::error::{Error, Result};
use crate::stream::hub::{BroadcastHub, Subscription};
use crate::stream::nal::UnitExtractor;

/// Where the agent jar lands on the device.
const REMOTE_AGENT_PATH: &str = "/data/local/tmp/screen-agent.jar";
const AGENT_MAIN_CLASS: &str = "com.droidcast.agent.Server";

const READ_CHUNK_BYTES: usize = 64 * 1024;
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct ActiveSession {
    host_port: u16,
    cancel: CancellationToken,
    read_task: JoinHandle<()>,
    watchdog_task: JoinHandle<()>,
    process: DeviceProcessHandle,
}

pub struct CaptureWorker {
    serial: String,
    bridge: BridgeDriver,
    settings: Arc<Config>,
    hub: Arc<BroadcastHub>,
    state: Mutex<WorkerState>,
    config: Mutex<CaptureConfig>,
    fatal: Mutex<Option<String>>,
    bytes_ingested: AtomicU64,
    /// Guards session transitions; `start`/`stop` serialize on this.
    session: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl CaptureWorker {
    pub fn new(
        serial: String,
        bridge: BridgeDriver,
        settings: Arc<Config>,
        config: CaptureConfig,
    ) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new(
            settings.subscriber_queue_depth,
            settings.gop_cap_bytes,
        ));
        Arc::new(Self {
            serial,
            bridge,
            settings,
            hub,
            state: Mutex::new(WorkerState::Stopped),
            config: Mutex::new(config),
            fatal: Mutex::new(None),
            bytes_ingested: AtomicU64::new(0),
            session: tokio::sync::Mutex::new(None),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn config(&self) -> CaptureConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn bytes_ingested(&self) -> u64 {
        self.bytes_ingested.load(Ordering::Relaxed)
    }

    /// The reason the last session died, if it died on its own.
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().unwrap().clone()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_fatal(&self, reason: &str) {
        *self.fatal.lock().unwrap() = Some(reason.to_string());
    }

    /// Bring the capture session up. Idempotent: a running worker
    /// returns Ok immediately.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        self.set_state(WorkerState::Starting);
        *self.fatal.lock().unwrap() = None;

        match self.start_session().await {
            Ok(s) => {
                info!(serial = %self.serial, host_port = s.host_port, "capture running");
                *session = Some(s);
                self.set_state(WorkerState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Stopped);
                self.set_fatal(&e.to_string());
                Err(e)
            }
        }
    }

    async fn start_session(self: &Arc<Self>) -> Result<ActiveSession> {
        let config = self.config();
        self.ensure_agent_pushed().await?;

        let socket_name = abstract_socket_name(&self.serial);
        let host_port = self.bridge.forward_port(&self.serial, 0, &socket_name).await?;

        let args = agent_args(&config, &socket_name);
        let mut process = self
            .bridge
            .spawn_device_process(&self.serial, REMOTE_AGENT_PATH, AGENT_MAIN_CLASS, &args)
            .await?;

        let stream = match self.connect_with_retry(host_port).await {
            Ok(stream) => stream,
            Err(e) => {
                process.kill().await;
                self.bridge.unforward_port(&self.serial, host_port).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let read_task = tokio::spawn(read_loop(Arc::clone(self), stream, cancel.clone()));
        let watchdog_task = tokio::spawn(idle_watchdog(Arc::clone(self), cancel.clone()));

        Ok(ActiveSession {
            host_port,
            cancel,
            read_task,
            watchdog_task,
            process,
        })
    }

    /// Push the agent jar unless the device already has this exact build.
    async fn ensure_agent_pushed(&self) -> Result<()> {
        let local_path = &self.settings.encoder_agent_path;
        let jar = tokio::fs::read(local_path).await.map_err(|e| {
            Error::EncoderSpawn(format!(
                "agent jar unreadable at {}: {e}",
                local_path.display()
            ))
        })?;
        let local_hash = hex_sha256(&jar);

        if let Some(device_hash) = self
            .bridge
            .device_file_sha256(&self.serial, REMOTE_AGENT_PATH)
            .await
        {
            if device_hash == local_hash {
                debug!(serial = %self.serial, "agent jar already on device");
                return Ok(());
            }
        }

        let local = local_path.to_string_lossy();
        self.bridge
            .push_file(&self.serial, &local, REMOTE_AGENT_PATH)
            .await
    }

    async fn connect_with_retry(&self, host_port: u16) -> Result<TcpStream> {
        let addr = format!("127.0.0.1:{host_port}");
        let mut last_err = String::from("no attempts");
        for attempt in 1..=CONNECT_ATTEMPTS {
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "connect timed out".to_string(),
            }
            debug!(serial = %self.serial, attempt, error = %last_err, "agent socket not ready");
        }
        Err(Error::TcpConnect(format!(
            "{addr}: {last_err} after {CONNECT_ATTEMPTS} attempts"
        )))
    }

    /// Tear the session down and drain all subscribers. Idempotent;
    /// cleanup failures are logged, never propagated.
    pub async fn stop(self: &Arc<Self>) {
        self.shutdown_session(true).await;
    }

    async fn shutdown_session(self: &Arc<Self>, close_subscribers: bool) {
        let mut session_guard = self.session.lock().await;
        let Some(mut session) = session_guard.take() else {
            if close_subscribers {
                self.hub.close_all();
            }
            self.set_state(WorkerState::Stopped);
            return;
        };

        self.set_state(WorkerState::Stopping);
        session.cancel.cancel();
        session.process.kill().await;
        // Killing the local adb child does not always take the remote
        // app_process with it.
        self.bridge.pkill(&self.serial, AGENT_MAIN_CLASS).await;
        if tokio::time::timeout(Duration::from_secs(2), session.read_task)
            .await
            .is_err()
        {
            warn!(serial = %self.serial, "read loop did not exit in time");
        }
        session.watchdog_task.abort();
        self.bridge.unforward_port(&self.serial, session.host_port).await;
        if close_subscribers {
            self.hub.close_all();
        }
        self.set_state(WorkerState::Stopped);
        info!(serial = %self.serial, "capture stopped");
    }

    /// Restart the encoder without disconnecting subscribers. They see a
    /// fresh GOP at the next IDR (a visible glitch is accepted).
    async fn restart_encoder(self: &Arc<Self>) -> Result<()> {
        self.shutdown_session(false).await;
        self.hub.reset_gop();
        self.start().await
    }

    /// Swap in a new capture config; restarts the encoder when running.
    pub async fn update_config(self: &Arc<Self>, new_config: CaptureConfig) -> Result<()> {
        let was_running = self.session.lock().await.is_some();
        *self.config.lock().unwrap() = new_config;
        if was_running {
            self.restart_encoder().await?;
        }
        Ok(())
    }

    /// Join the broadcast. When the first subscriber arrives and the GOP
    /// cache has been empty for a while, the encoder is restarted so the
    /// joiner gets parameter sets and an IDR promptly instead of waiting
    /// out the natural key-frame period.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let sub = self.hub.subscribe();
        if sub.was_first && sub.prefill_len == 0 && self.is_running() {
            let stale = self
                .hub
                .gop_empty_for()
                .map(|d| d >= self.settings.min_restart_wait)
                .unwrap_or(false);
            if stale && self.hub.subscriber_count() == 1 {
                info!(serial = %self.serial, "first subscriber with stale GOP, restarting encoder");
                let worker = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = worker.restart_encoder().await {
                        warn!(serial = %worker.serial, error = %e, "encoder restart failed");
                    }
                });
            }
        }
        sub
    }

    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id);
    }
}

async fn read_loop(worker: Arc<CaptureWorker>, mut stream: TcpStream, cancel: CancellationToken) {
    let mut extractor = UnitExtractor::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    let reason: Option<String> = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            read = stream.read(&mut buf) => match read {
                Ok(0) => break Some("agent stream closed".to_string()),
                Ok(n) => {
                    worker.bytes_ingested.fetch_add(n as u64, Ordering::Relaxed);
                    for unit in extractor.push(&buf[..n]) {
                        worker.hub.publish(unit);
                    }
                }
                Err(e) => break Some(format!("agent read failed: {e}")),
            },
        }
    };

    if let Some(reason) = reason {
        warn!(serial = %worker.serial, reason = %reason, "capture transport ended");
        worker.set_fatal(&reason);
        // stop() joins this task, so run it from a fresh one.
        let w = Arc::clone(&worker);
        tokio::spawn(async move { w.stop().await });
    }
}

/// Stops the worker once the subscriber count has been zero for the
/// configured idle timeout. The timer resets on every count > 0 tick.
async fn idle_watchdog(worker: Arc<CaptureWorker>, cancel: CancellationToken) {
    let idle_timeout = worker.settings.stream_idle_timeout;
    let mut last_active = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if worker.hub.subscriber_count() > 0 {
                    last_active = Instant::now();
                } else if last_active.elapsed() >= idle_timeout {
                    info!(serial = %worker.serial, "idle timeout, stopping capture");
                    let w = Arc::clone(&worker);
                    tokio::spawn(async move { w.stop().await });
                    return;
                }
            }
        }
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Abstract socket name for one device's video stream. adb serials can
/// contain `.` and `:` (TCP devices); keep the name shell-safe.
fn abstract_socket_name(serial: &str) -> String {
    let sanitized: String = serial
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("droidcast_{sanitized}")
}

/// key=value arguments handed to the agent's app_process invocation.
fn agent_args(config: &CaptureConfig, socket_name: &str) -> Vec<String> {
    vec![
        format!("socket={socket_name}"),
        format!("max_size={}", config.max_edge_pixels),
        format!("max_fps={}", config.max_fps),
        format!("video_bit_rate={}", config.bit_rate_bps),
        format!("video_codec={}", config.codec.as_str()),
        format!("idr_interval={}", config.idr_interval_seconds),
        format!("repeat_headers={}", config.prepend_headers_on_sync),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::client::AdbClient;

    fn test_worker() -> Arc<CaptureWorker> {
        let bridge = BridgeDriver::new(AdbClient::with_path("/nonexistent/adb"));
        CaptureWorker::new(
            "emulator-5554".to_string(),
            bridge,
            Arc::new(Config::default()),
            CaptureConfig::default(),
        )
    }

    #[test]
    fn socket_name_is_sanitized() {
        assert_eq!(
            abstract_socket_name("192.168.0.7:5555"),
            "droidcast_192_168_0_7_5555"
        );
        assert_eq!(abstract_socket_name("emulator-5554"), "droidcast_emulator_5554");
    }

    #[test]
    fn agent_args_reflect_config() {
        let config = CaptureConfig::low_bandwidth();
        let args = agent_args(&config, "droidcast_x");
        assert!(args.contains(&"socket=droidcast_x".to_string()));
        assert!(args.contains(&"max_size=480".to_string()));
        assert!(args.contains(&"max_fps=15".to_string()));
        assert!(args.contains(&"video_bit_rate=800000".to_string()));
        assert!(args.contains(&"video_codec=h264".to_string()));
        assert!(args.contains(&"repeat_headers=true".to_string()));
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_never_started() {
        // Property 8: repeated stop equals one stop.
        let worker = test_worker();
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.stop().await;
        worker.stop().await;
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_on_stopped_worker_does_not_restart() {
        let worker = test_worker();
        let sub = worker.subscribe();
        assert!(sub.was_first);
        assert_eq!(sub.prefill_len, 0);
        assert_eq!(worker.subscriber_count(), 1);
        // Not running: no restart task was spawned, state unchanged.
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.unsubscribe(sub.id);
        assert_eq!(worker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn update_config_when_stopped_only_replaces_record() {
        let worker = test_worker();
        worker
            .update_config(CaptureConfig::high_quality())
            .await
            .unwrap();
        assert_eq!(worker.config(), CaptureConfig::high_quality());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}
