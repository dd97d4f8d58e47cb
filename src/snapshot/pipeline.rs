// Snapshot pipeline: keeps a decoded latest-frame for a device while at
// least one snapshot channel is attached, and turns it into JPEGs on
// demand. Exactly one decoder subprocess per device, whatever the
// channel count.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::snapshot::decoder::{spawn_decoder, DecoderProcess, Y4mParser};
use crate::snapshot::yuv::yuv420_to_rgb;
use crate::stream::nal::H264Unit;
use crate::stream::worker::CaptureWorker;

/// Produces the decoder subprocess for this pipeline. The default spawns
/// the configured external tool; tests substitute a trivial child.
pub type DecoderSpawner = Box<dyn Fn(&Path) -> Result<DecoderProcess> + Send + Sync>;

/// The single-slot decoded frame buffer.
#[derive(Debug, Clone)]
pub struct LatestFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub decoded_at: DateTime<Utc>,
    pub decoded_at_mono: Instant,
}

/// A finished capture, JPEG bytes included.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub capture_id: String,
    pub serial: String,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
    pub path: Option<String>,
    pub jpeg: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderState {
    Idle,
    Running,
}

/// Proof of a successful attach; hand it back to `detach`.
pub struct SnapshotHandle {
    _priv: (),
}

struct DecoderSession {
    cancel: CancellationToken,
    feed_task: JoinHandle<()>,
    output_task: JoinHandle<()>,
    stall_task: JoinHandle<()>,
    child: Arc<tokio::sync::Mutex<tokio::process::Child>>,
    sub_id: u64,
}

struct AttachState {
    refcount: usize,
    session: Option<DecoderSession>,
    /// Bumped per decoder start; stale stall watchdogs check it before
    /// restarting.
    epoch: u64,
}

pub struct SnapshotPipeline {
    serial: String,
    worker: Arc<CaptureWorker>,
    settings: Arc<Config>,
    latest: Arc<Mutex<Option<LatestFrame>>>,
    frame_notify: Arc<Notify>,
    /// Protects the 0->1 and 1->0 refcount transitions.
    attach_state: tokio::sync::Mutex<AttachState>,
    /// Serializes JPEG encoding for this device.
    jpeg_sem: Semaphore,
    channels: AtomicUsize,
    decoder_running: AtomicBool,
    spawner: DecoderSpawner,
}

impl SnapshotPipeline {
    pub fn new(serial: String, worker: Arc<CaptureWorker>, settings: Arc<Config>) -> Arc<Self> {
        Self::with_spawner(serial, worker, settings, Box::new(spawn_decoder))
    }

    /// Build a pipeline with a custom decoder spawner. Everything else
    /// behaves identically; the production constructor routes here.
    pub fn with_spawner(
        serial: String,
        worker: Arc<CaptureWorker>,
        settings: Arc<Config>,
        spawner: DecoderSpawner,
    ) -> Arc<Self> {
        Arc::new(Self {
            serial,
            worker,
            settings,
            latest: Arc::new(Mutex::new(None)),
            frame_notify: Arc::new(Notify::new()),
            attach_state: tokio::sync::Mutex::new(AttachState {
                refcount: 0,
                session: None,
                epoch: 0,
            }),
            jpeg_sem: Semaphore::new(1),
            channels: AtomicUsize::new(0),
            decoder_running: AtomicBool::new(false),
            spawner,
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn channel_count(&self) -> usize {
        self.channels.load(Ordering::Relaxed)
    }

    pub fn decoder_state(&self) -> DecoderState {
        if self.decoder_running.load(Ordering::Relaxed) {
            DecoderState::Running
        } else {
            DecoderState::Idle
        }
    }

    #[cfg(test)]
    fn set_channels_for_test(&self, n: usize) {
        self.channels.store(n, Ordering::Relaxed);
    }

    /// Open one snapshot channel. The decoder starts on the 0->1
    /// transition; the worker is started first if it is not running.
    pub async fn attach(self: &Arc<Self>) -> Result<SnapshotHandle> {
        let mut state = self.attach_state.lock().await;
        if state.refcount == 0 {
            self.start_decoder(&mut state).await?;
        }
        state.refcount += 1;
        self.channels.store(state.refcount, Ordering::Relaxed);
        debug!(serial = %self.serial, channels = state.refcount, "snapshot channel attached");
        Ok(SnapshotHandle { _priv: () })
    }

    /// Close one snapshot channel. The decoder is torn down on 1->0.
    pub async fn detach(self: &Arc<Self>, handle: SnapshotHandle) {
        let _ = handle;
        let mut state = self.attach_state.lock().await;
        state.refcount = state.refcount.saturating_sub(1);
        self.channels.store(state.refcount, Ordering::Relaxed);
        debug!(serial = %self.serial, channels = state.refcount, "snapshot channel detached");
        if state.refcount == 0 {
            self.stop_decoder(&mut state).await;
        }
    }

    /// Force everything down regardless of attached channels (registry
    /// shutdown path).
    pub async fn shutdown(self: &Arc<Self>) {
        let mut state = self.attach_state.lock().await;
        state.refcount = 0;
        self.channels.store(0, Ordering::Relaxed);
        self.stop_decoder(&mut state).await;
    }

    fn start_decoder<'a>(
        self: &'a Arc<Self>,
        state: &'a mut AttachState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.start_decoder_inner(state))
    }

    async fn start_decoder_inner(self: &Arc<Self>, state: &mut AttachState) -> Result<()> {
        // Decoding needs the live unit stream; bring the worker up first.
        self.worker.start().await?;
        let sub = self.worker.subscribe();
        let sub_id = sub.id;

        let mut process = match (self.spawner)(&self.settings.decoder_path) {
            Ok(p) => p,
            Err(e) => {
                self.worker.unsubscribe(sub_id);
                return Err(e);
            }
        };
        let stdin = process.stdin.take().ok_or_else(|| {
            Error::DecoderSpawn("decoder child has no stdin".into())
        })?;
        let stdout = process.stdout.take().ok_or_else(|| {
            Error::DecoderSpawn("decoder child has no stdout".into())
        })?;

        let cancel = CancellationToken::new();
        let child = Arc::new(tokio::sync::Mutex::new(process.child));

        let feed_task = tokio::spawn(feed_decoder(sub.rx, stdin, cancel.clone()));
        let output_task = tokio::spawn(read_frames(
            stdout,
            Arc::clone(&self.latest),
            Arc::clone(&self.frame_notify),
            cancel.clone(),
            self.serial.clone(),
        ));

        state.epoch += 1;
        let stall_task = tokio::spawn(stall_watchdog(Arc::clone(self), cancel.clone(), state.epoch));

        state.session = Some(DecoderSession {
            cancel,
            feed_task,
            output_task,
            stall_task,
            child,
            sub_id,
        });
        self.decoder_running.store(true, Ordering::Relaxed);
        info!(serial = %self.serial, "decoder started");
        Ok(())
    }

    async fn stop_decoder(self: &Arc<Self>, state: &mut AttachState) {
        let Some(session) = state.session.take() else {
            return;
        };
        self.decoder_running.store(false, Ordering::Relaxed);

        // Cancelling the feed task drops decoder stdin, which asks the
        // child to finish on its own.
        session.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_millis(200), session.feed_task).await;

        let grace = self.settings.decoder_shutdown_grace;
        let exited = {
            let mut child = session.child.lock().await;
            tokio::time::timeout(grace, child.wait()).await.is_ok()
        };
        if !exited {
            warn!(serial = %self.serial, "decoder did not exit within grace, killing");
            let mut child = session.child.lock().await;
            let _ = child.kill().await;
        }

        let _ = tokio::time::timeout(Duration::from_millis(200), session.output_task).await;
        session.stall_task.abort();
        self.worker.unsubscribe(session.sub_id);

        // A frame surviving across decoder generations would make the
        // next attach look warm; clear it.
        *self.latest.lock().unwrap() = None;
        info!(serial = %self.serial, "decoder stopped");
    }

    /// Tear down and restart the decoder if `epoch` still names the
    /// active session (stall recovery).
    async fn restart_decoder(self: &Arc<Self>, epoch: u64) {
        let mut state = self.attach_state.lock().await;
        if state.epoch != epoch || state.refcount == 0 {
            return;
        }
        warn!(serial = %self.serial, "decoder stalled, restarting");
        self.stop_decoder(&mut state).await;
        if let Err(e) = self.start_decoder(&mut state).await {
            warn!(serial = %self.serial, error = %e, "decoder restart failed");
        }
    }

    /// Produce one JPEG from the freshest decoded frame. Cold attaches
    /// get a long wait (decoder warmup); once a frame exists only a
    /// freshness wait applies.
    pub async fn capture(&self, quality: u8, save_to_disk: bool) -> Result<CaptureOutcome> {
        if self.channel_count() == 0 {
            return Err(Error::NoFrame);
        }

        let frame_present = self.latest.lock().unwrap().is_some();
        let wait = capture_wait(frame_present, &self.settings);
        let frame = self.wait_for_fresh_frame(wait).await?;

        // Depth-1: one JPEG encode per device at a time.
        let _permit = self
            .jpeg_sem
            .acquire()
            .await
            .map_err(|_| Error::Internal("jpeg semaphore closed".into()))?;

        let quality = quality.clamp(1, 100);
        let width = frame.width;
        let height = frame.height;
        let captured_at = frame.decoded_at;

        let jpeg = tokio::task::spawn_blocking(move || encode_frame_jpeg(&frame, quality))
            .await
            .map_err(|e| Error::Internal(format!("jpeg encode task failed: {e}")))??;

        let capture_id = uuid::Uuid::new_v4().to_string();
        let path = if save_to_disk {
            Some(
                self.write_capture_file(&capture_id, captured_at, &jpeg)
                    .await?,
            )
        } else {
            None
        };

        Ok(CaptureOutcome {
            capture_id,
            serial: self.serial.clone(),
            width,
            height,
            captured_at,
            path,
            jpeg,
        })
    }

    async fn wait_for_fresh_frame(&self, wait: Duration) -> Result<LatestFrame> {
        let deadline = Instant::now() + wait;
        loop {
            // Copy out under the lock; encoding happens lock-free.
            let fresh = {
                let latest = self.latest.lock().unwrap();
                latest
                    .as_ref()
                    .filter(|f| f.decoded_at_mono.elapsed() <= self.settings.max_frame_age)
                    .cloned()
            };
            if let Some(frame) = fresh {
                return Ok(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::CaptureTimeout(wait));
            }
            let _ = tokio::time::timeout(remaining, self.frame_notify.notified()).await;
        }
    }

    /// Atomic save: write to a temp name, then rename into place.
    async fn write_capture_file(
        &self,
        capture_id: &str,
        captured_at: DateTime<Utc>,
        jpeg: &[u8],
    ) -> Result<String> {
        let dir = self.settings.capture_output_dir.join(&self.serial);
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = capture_file_name(captured_at, capture_id);
        let final_path = dir.join(&file_name);
        let tmp_path = dir.join(format!(".{file_name}.tmp"));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(jpeg).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(final_path.to_string_lossy().into_owned())
    }
}

/// Cold attaches pay the decoder warmup; once a frame exists only a
/// freshness wait applies.
fn capture_wait(frame_present: bool, settings: &Config) -> Duration {
    if frame_present {
        settings.capture_wait_warm
    } else {
        settings.capture_wait_cold
    }
}

fn capture_file_name(captured_at: DateTime<Utc>, capture_id: &str) -> String {
    format!(
        "{}_{capture_id}.jpg",
        captured_at.format("%Y%m%dT%H%M%SZ")
    )
}

fn encode_frame_jpeg(frame: &LatestFrame, quality: u8) -> Result<Vec<u8>> {
    let raw = crate::snapshot::decoder::RawFrame {
        width: frame.width,
        height: frame.height,
        data: frame.data.clone(),
    };
    let rgb = yuv420_to_rgb(&raw);

    let mut out = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    image::ImageEncoder::write_image(
        encoder,
        &rgb,
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )
    .map_err(|e| Error::Internal(format!("jpeg encode failed: {e}")))?;
    Ok(out.into_inner())
}

async fn feed_decoder(
    mut rx: mpsc::Receiver<H264Unit>,
    mut stdin: tokio::process::ChildStdin,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            unit = rx.recv() => match unit {
                Some(unit) => {
                    if stdin.write_all(&unit.bytes).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
                None => break,
            },
        }
    }
    // Dropping stdin closes the decoder's input stream.
}

async fn read_frames(
    mut stdout: tokio::process::ChildStdout,
    latest: Arc<Mutex<Option<LatestFrame>>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    serial: String,
) {
    let mut parser = Y4mParser::new();
    let mut chunk = vec![0u8; 32 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stdout.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => match parser.push(&chunk[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            let entry = LatestFrame {
                                width: frame.width,
                                height: frame.height,
                                data: frame.data,
                                decoded_at: Utc::now(),
                                decoded_at_mono: Instant::now(),
                            };
                            *latest.lock().unwrap() = Some(entry);
                            notify.notify_waiters();
                        }
                    }
                    Err(e) => {
                        warn!(serial = %serial, error = %e, "decoder output unparseable");
                        break;
                    }
                },
            },
        }
    }
}

/// Restarts the decoder when it has produced nothing for the configured
/// stall window while the worker keeps supplying units.
async fn stall_watchdog(pipeline: Arc<SnapshotPipeline>, cancel: CancellationToken, epoch: u64) {
    let stall = pipeline.settings.decoder_stall;
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if !pipeline.worker.is_running() {
                    continue;
                }
                let last_output = pipeline
                    .latest
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|f| f.decoded_at_mono)
                    .unwrap_or(started);
                if last_output.elapsed() >= stall {
                    // restart_decoder joins this session's tasks; run it
                    // from a fresh task and let this one end.
                    let p = Arc::clone(&pipeline);
                    tokio::spawn(async move { p.restart_decoder(epoch).await });
                    return;
                }
            }
        }
    }
}
