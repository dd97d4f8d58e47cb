// Service configuration, read once from the environment at startup.
// Capture settings (CaptureConfig) are immutable records; changing one
// means restarting the worker with a new record.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide configuration. Defaults match the documented options;
/// every field can be overridden by an environment variable of the same
/// name in uppercase (e.g. `CAPTURE_OUTPUT_DIR`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory where saved JPEGs go.
    pub capture_output_dir: PathBuf,
    /// Default JPEG quality when the client omits it (1..=100).
    pub capture_jpeg_quality_default: u8,
    /// Worker idle shutdown after this long with zero subscribers.
    pub stream_idle_timeout: Duration,
    /// GOP cache byte cap; exceeding it drops the cached GOP.
    pub gop_cap_bytes: usize,
    /// Bounded queue depth per stream subscriber, in units.
    pub subscriber_queue_depth: usize,
    /// Decoder restart threshold: no decoded frames for this long while
    /// the worker is running.
    pub decoder_stall: Duration,
    /// stop_all() must finish within this; escalates to kill on expiry.
    pub shutdown_deadline: Duration,
    /// Host path of the prebuilt device-side encoder agent jar.
    pub encoder_agent_path: PathBuf,
    /// Minimum continuous GOP-empty time before a 0->1 subscriber
    /// transition may restart the encoder.
    pub min_restart_wait: Duration,
    /// Capture wait when no frame has been decoded yet this attach.
    pub capture_wait_cold: Duration,
    /// Capture wait when a frame is already present.
    pub capture_wait_warm: Duration,
    /// A cached frame older than this is considered stale for capture.
    pub max_frame_age: Duration,
    /// Grace period between closing decoder stdin and killing it.
    pub decoder_shutdown_grace: Duration,
    /// Path of the external decoder binary.
    pub decoder_path: PathBuf,
    /// Optional explicit adb path; discovered when unset.
    pub adb_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_output_dir: PathBuf::from("./captures"),
            capture_jpeg_quality_default: 80,
            stream_idle_timeout: Duration::from_secs(5),
            gop_cap_bytes: 4 * 1024 * 1024,
            subscriber_queue_depth: 256,
            decoder_stall: Duration::from_millis(5000),
            shutdown_deadline: Duration::from_secs(10),
            encoder_agent_path: PathBuf::from("./agent/screen-agent.jar"),
            min_restart_wait: Duration::from_secs(2),
            capture_wait_cold: Duration::from_millis(6000),
            capture_wait_warm: Duration::from_millis(300),
            max_frame_age: Duration::from_millis(1000),
            decoder_shutdown_grace: Duration::from_millis(500),
            decoder_path: PathBuf::from("ffmpeg"),
            adb_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_var("CAPTURE_OUTPUT_DIR") {
            cfg.capture_output_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u8>("CAPTURE_JPEG_QUALITY_DEFAULT") {
            cfg.capture_jpeg_quality_default = v.clamp(1, 100);
        }
        if let Some(v) = env_parse::<u64>("STREAM_IDLE_TIMEOUT_SECONDS") {
            cfg.stream_idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("GOP_CAP_BYTES") {
            cfg.gop_cap_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("SUBSCRIBER_QUEUE_DEPTH") {
            cfg.subscriber_queue_depth = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("DECODER_STALL_MS") {
            cfg.decoder_stall = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("SHUTDOWN_DEADLINE_SECONDS") {
            cfg.shutdown_deadline = Duration::from_secs(v);
        }
        if let Some(v) = env_var("ENCODER_AGENT_PATH") {
            cfg.encoder_agent_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u64>("MIN_RESTART_WAIT_SECONDS") {
            cfg.min_restart_wait = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("CAPTURE_WAIT_COLD_MS") {
            cfg.capture_wait_cold = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("CAPTURE_WAIT_WARM_MS") {
            cfg.capture_wait_warm = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("MAX_FRAME_AGE_MS") {
            cfg.max_frame_age = Duration::from_millis(v);
        }
        if let Some(v) = env_var("DECODER_PATH") {
            cfg.decoder_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("ADB_PATH") {
            cfg.adb_path = Some(PathBuf::from(v));
        }
        cfg
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.trim().parse().ok())
}

/// Video codec requested from the encoder agent. Only H.264 is parsed by
/// the extractor; other values are passed through to the agent untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Av1,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Av1 => "av1",
        }
    }
}

/// Immutable encoder settings for one capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Cap on the short edge of the encoded video, in pixels.
    pub max_edge_pixels: u32,
    pub max_fps: u32,
    pub bit_rate_bps: u32,
    pub codec: Codec,
    /// Requested key-frame period.
    pub idr_interval_seconds: u32,
    /// Ask the encoder to repeat SPS/PPS at every IDR.
    pub prepend_headers_on_sync: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_edge_pixels: 720,
            max_fps: 30,
            bit_rate_bps: 4_000_000,
            codec: Codec::H264,
            idr_interval_seconds: 2,
            prepend_headers_on_sync: true,
        }
    }
}

impl CaptureConfig {
    pub fn low_bandwidth() -> Self {
        Self {
            max_edge_pixels: 480,
            max_fps: 15,
            bit_rate_bps: 800_000,
            ..Self::default()
        }
    }

    pub fn balanced() -> Self {
        Self {
            max_edge_pixels: 720,
            max_fps: 30,
            bit_rate_bps: 2_000_000,
            ..Self::default()
        }
    }

    pub fn high_quality() -> Self {
        Self {
            max_edge_pixels: 1080,
            max_fps: 60,
            bit_rate_bps: 8_000_000,
            ..Self::default()
        }
    }

    /// Resolve a preset by name; `None` for an unknown name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "low_bandwidth" => Some(Self::low_bandwidth()),
            "balanced" => Some(Self::balanced()),
            "default" => Some(Self::default()),
            "high_quality" => Some(Self::high_quality()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.capture_output_dir, PathBuf::from("./captures"));
        assert_eq!(cfg.capture_jpeg_quality_default, 80);
        assert_eq!(cfg.stream_idle_timeout, Duration::from_secs(5));
        assert_eq!(cfg.gop_cap_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.subscriber_queue_depth, 256);
        assert_eq!(cfg.decoder_stall, Duration::from_millis(5000));
        assert_eq!(cfg.shutdown_deadline, Duration::from_secs(10));
    }

    #[test]
    fn presets_resolve_by_name() {
        assert_eq!(
            CaptureConfig::preset("low_bandwidth"),
            Some(CaptureConfig::low_bandwidth())
        );
        assert_eq!(
            CaptureConfig::preset("default"),
            Some(CaptureConfig::default())
        );
        assert!(CaptureConfig::preset("ultra").is_none());
    }

    #[test]
    fn presets_scale_sensibly() {
        let low = CaptureConfig::low_bandwidth();
        let high = CaptureConfig::high_quality();
        assert!(low.bit_rate_bps < high.bit_rate_bps);
        assert!(low.max_edge_pixels < high.max_edge_pixels);
        assert_eq!(low.codec, Codec::H264);
    }
}
