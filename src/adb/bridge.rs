// Debug-Bridge Driver - the only module that talks to the adb tool.
// Exposes file push, port forwarding, remote process spawn and the
// device-change event stream; every other component goes through here.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adb::client::{AdbClient, ExecutionConfig};
use crate::adb::command_builder::{AdbCommand, AdbCommandBuilder};
use crate::command_utils::hidden_command;
use crate::error::{Error, Result};

/// Connection state as reported by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Unknown,
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Unknown,
        }
    }
}

/// One full `(serial, state)` set as reported by `adb track-devices`.
pub type DeviceSetSnapshot = Vec<(String, DeviceState)>;

/// Handle to a process spawned on the device via `app_process`. The
/// underlying adb child inherits no host stdio; its output is drained
/// line-buffered into the log.
pub struct DeviceProcessHandle {
    serial: String,
    child: tokio::process::Child,
}

impl DeviceProcessHandle {
    /// Wait for the device process to exit.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.map_err(Error::Io)
    }

    /// Kill the adb transport for the device process. Best-effort.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(serial = %self.serial, error = %e, "device process already gone");
        }
    }
}

/// Thin wrapper over the adb control plane.
#[derive(Debug, Clone)]
pub struct BridgeDriver {
    client: AdbClient,
}

impl BridgeDriver {
    pub fn new(client: AdbClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &AdbClient {
        &self.client
    }

    /// Push a local file to the device. Surfaces the first error; no retry.
    pub async fn push_file(&self, serial: &str, local_path: &str, remote_path: &str) -> Result<()> {
        let args = AdbCommandBuilder::new().target(serial).build(AdbCommand::Push {
            local: local_path.to_string(),
            remote: remote_path.to_string(),
        });
        let output = self.execute_once(&args, Duration::from_secs(30)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_device_error(
                serial,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    /// Forward a host TCP port to a device-local abstract socket.
    /// `host_port == 0` asks adb for an ephemeral port; the chosen port
    /// is returned either way. Re-binding an existing forward replaces it.
    pub async fn forward_port(
        &self,
        serial: &str,
        host_port: u16,
        device_abstract_socket: &str,
    ) -> Result<u16> {
        let args = AdbCommandBuilder::new().target(serial).build(AdbCommand::Forward {
            host_port,
            abstract_socket: device_abstract_socket.to_string(),
        });
        let output = self.execute_once(&args, Duration::from_secs(10)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("cannot bind") || stderr.contains("Address already in use") {
                return Err(Error::PortInUse(host_port));
            }
            return Err(classify_device_error(serial, &stderr));
        }

        if host_port != 0 {
            return Ok(host_port);
        }
        // adb prints the allocated port on stdout for tcp:0
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::Parse(format!("unexpected forward output: {stdout:?}")))
    }

    /// Remove a port forward. Best-effort: a missing forward is not an error.
    pub async fn unforward_port(&self, serial: &str, host_port: u16) {
        let args = AdbCommandBuilder::new()
            .target(serial)
            .build(AdbCommand::ForwardRemove { host_port });
        match self.execute_once(&args, Duration::from_secs(5)).await {
            Ok(output) if !output.status.success() => {
                debug!(
                    serial,
                    host_port,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "unforward reported failure"
                );
            }
            Err(e) => debug!(serial, host_port, error = %e, "unforward failed"),
            _ => {}
        }
    }

    /// Spawn a detached process on the device via `app_process`. The
    /// returned handle exposes `wait` and `kill`; stdout/stderr are
    /// drained line-buffered into the log.
    pub async fn spawn_device_process(
        &self,
        serial: &str,
        classpath: &str,
        main_class: &str,
        args: &[String],
    ) -> Result<DeviceProcessHandle> {
        let argv = AdbCommandBuilder::new().target(serial).build(AdbCommand::AppProcess {
            classpath: classpath.to_string(),
            main_class: main_class.to_string(),
            args: args.to_vec(),
        });

        let mut cmd = hidden_command(self.client.adb_path());
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::EncoderSpawn(format!("app_process spawn failed: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_logger(serial.to_string(), "agent-stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_logger(serial.to_string(), "agent-stderr", stderr);
        }

        Ok(DeviceProcessHandle {
            serial: serial.to_string(),
            child,
        })
    }

    /// Subscribe to device-change snapshots. The underlying
    /// `adb track-devices` process is restarted internally with
    /// exponential backoff on bridge disconnect; the stream only ends
    /// when the receiver is dropped.
    pub fn track_devices(&self) -> mpsc::Receiver<DeviceSetSnapshot> {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        tokio::spawn(async move {
            track_devices_loop(client, tx).await;
        });
        rx
    }

    /// Read a device property via getprop. Empty values map to `None`.
    pub async fn get_prop(&self, serial: &str, prop: &str) -> Option<String> {
        let args = AdbCommandBuilder::new()
            .target(serial)
            .build(AdbCommand::GetProp(prop.to_string()));
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.client
            .execute(&arg_refs)
            .await
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// SHA-256 of a file on the device, or `None` if it does not exist
    /// or the device lacks sha256sum.
    pub async fn device_file_sha256(&self, serial: &str, remote_path: &str) -> Option<String> {
        let args = AdbCommandBuilder::new().target(serial).build(AdbCommand::Shell(vec![
            "sha256sum".into(),
            remote_path.to_string(),
        ]));
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.client.execute(&arg_refs).await.ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .split_whitespace()
            .next()
            .filter(|h| h.len() == 64)
            .map(|h| h.to_lowercase())
    }

    /// Run a device shell command, killing any process matching `pattern`.
    /// Used as cleanup after the agent transport dies. Best-effort.
    pub async fn pkill(&self, serial: &str, pattern: &str) {
        let args = AdbCommandBuilder::new().target(serial).build(AdbCommand::Shell(vec![
            "pkill".into(),
            "-f".into(),
            pattern.to_string(),
        ]));
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let _ = self.client.execute(&arg_refs).await;
    }

    async fn execute_once(&self, args: &[String], timeout: Duration) -> Result<std::process::Output> {
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.client
            .execute_with_config(&arg_refs, &ExecutionConfig { timeout, retries: 0 })
            .await
    }
}

fn classify_device_error(serial: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("offline") || lower.contains("not found") || lower.contains("no devices") {
        Error::DeviceOffline(serial.to_string())
    } else {
        Error::BridgeUnreachable(stderr.trim().to_string())
    }
}

fn spawn_line_logger(
    serial: String,
    label: &'static str,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(serial = %serial, "[{label}] {line}");
        }
    });
}

async fn track_devices_loop(client: AdbClient, tx: mpsc::Sender<DeviceSetSnapshot>) {
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    loop {
        let mut cmd = hidden_command(client.adb_path());
        cmd.args(AdbCommand::TrackDevices.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => {
                let Some(stdout) = child.stdout.take() else {
                    warn!("track-devices child had no stdout");
                    return;
                };
                info!("device tracking connected");
                let mut reader = BufReader::new(stdout);
                let mut parser = TrackFrameParser::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            for snapshot in parser.push(&chunk[..n]) {
                                if tx.send(snapshot).await.is_err() {
                                    // receiver gone: stop tracking entirely
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                            backoff = Duration::from_secs(1);
                        }
                    }
                }
                let _ = child.kill().await;
                warn!("track-devices stream ended, reconnecting in {:?}", backoff);
            }
            Err(e) => {
                warn!(error = %e, "failed to start track-devices, retrying in {:?}", backoff);
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// Incremental parser for the track-devices wire protocol: each message
/// is a 4-hex-digit payload length followed by the full device list,
/// one `serial\tstate` per line.
pub struct TrackFrameParser {
    buf: Vec<u8>,
}

impl TrackFrameParser {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<DeviceSetSnapshot> {
        self.buf.extend_from_slice(chunk);
        let mut snapshots = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let header = match std::str::from_utf8(&self.buf[..4]) {
                Ok(h) => h,
                Err(_) => {
                    // Unparseable header: resync by dropping a byte.
                    self.buf.drain(..1);
                    continue;
                }
            };
            let len = match usize::from_str_radix(header, 16) {
                Ok(l) => l,
                Err(_) => {
                    self.buf.drain(..1);
                    continue;
                }
            };
            if self.buf.len() < 4 + len {
                break;
            }
            let payload = self.buf[4..4 + len].to_vec();
            self.buf.drain(..4 + len);
            snapshots.push(parse_device_lines(&String::from_utf8_lossy(&payload)));
        }

        snapshots
    }
}

impl Default for TrackFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_device_lines(payload: &str) -> DeviceSetSnapshot {
    payload
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut parts = line.split_whitespace();
            let serial = parts.next()?.to_string();
            let state = DeviceState::from(parts.next().unwrap_or("unknown"));
            Some((serial, state))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_state_from_str() {
        assert_eq!(DeviceState::from("device"), DeviceState::Online);
        assert_eq!(DeviceState::from("offline"), DeviceState::Offline);
        assert_eq!(DeviceState::from("unauthorized"), DeviceState::Unauthorized);
        assert_eq!(DeviceState::from("recovery"), DeviceState::Unknown);
    }

    #[test]
    fn track_parser_single_frame() {
        let mut parser = TrackFrameParser::new();
        let payload = "emulator-5554\tdevice\n";
        let frame = format!("{:04x}{}", payload.len(), payload);
        let snapshots = parser.push(frame.as_bytes());
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0],
            vec![("emulator-5554".to_string(), DeviceState::Online)]
        );
    }

    #[test]
    fn track_parser_split_across_chunks() {
        let mut parser = TrackFrameParser::new();
        let payload = "abc123\tunauthorized\nemulator-5554\tdevice\n";
        let frame = format!("{:04x}{}", payload.len(), payload);
        let (a, b) = frame.as_bytes().split_at(7);
        assert!(parser.push(a).is_empty());
        let snapshots = parser.push(b);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].len(), 2);
        assert_eq!(snapshots[0][0].1, DeviceState::Unauthorized);
    }

    #[test]
    fn track_parser_empty_payload_means_no_devices() {
        let mut parser = TrackFrameParser::new();
        let snapshots = parser.push(b"0000");
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].is_empty());
    }

    #[test]
    fn track_parser_multiple_frames_in_one_chunk() {
        let mut parser = TrackFrameParser::new();
        let p1 = "a\tdevice\n";
        let p2 = "a\toffline\n";
        let data = format!("{:04x}{}{:04x}{}", p1.len(), p1, p2.len(), p2);
        let snapshots = parser.push(data.as_bytes());
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0][0].1, DeviceState::Online);
        assert_eq!(snapshots[1][0].1, DeviceState::Offline);
    }
}
