// Error types shared across the service.
// Every variant maps to a stable snake_case code used on the wire
// (snapshot WS error payloads, stream WS close reasons).

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("debug bridge unreachable: {0}")]
    BridgeUnreachable(String),

    #[error("device {0} is not online")]
    DeviceOffline(String),

    #[error("host port {0} already in use")]
    PortInUse(u16),

    #[error("encoder agent failed to start: {0}")]
    EncoderSpawn(String),

    #[error("could not connect to forwarded port: {0}")]
    TcpConnect(String),

    #[error("decoder failed to start: {0}")]
    DecoderSpawn(String),

    #[error("no decoded frame within {}ms", .0.as_millis())]
    CaptureTimeout(Duration),

    #[error("no frame available")]
    NoFrame,

    #[error("failed to parse adb output: {0}")]
    Parse(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Stable code for JSON error payloads and close frames.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Error::BridgeUnreachable(_) => "bridge_unreachable",
            Error::DeviceOffline(_) => "device_offline",
            Error::PortInUse(_) => "port_in_use",
            Error::EncoderSpawn(_) => "encoder_spawn_failed",
            Error::TcpConnect(_) => "tcp_connect_failed",
            Error::DecoderSpawn(_) => "decoder_spawn_failed",
            Error::CaptureTimeout(_) => "capture_timeout",
            Error::NoFrame => "no_frame",
            Error::Parse(_) | Error::Io(_) | Error::Internal(_) => "internal_error",
        }
    }
}
