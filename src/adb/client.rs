// ADB Client - Low-level ADB process execution
// Handles finding the ADB path and running commands with timeouts and
// retries.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use crate::command_utils::hidden_command;
use crate::error::{Error, Result};

/// Default timeout for standard ADB commands
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default retry attempts for transient failures
const DEFAULT_RETRIES: u32 = 1;

/// Configuration for ADB command execution
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }
}

/// A low-level client for executing ADB commands. Responsible for the
/// ADB executable path and safe cross-platform invocation; everything
/// above it works in terms of argument lists.
#[derive(Debug, Clone)]
pub struct AdbClient {
    adb_path: PathBuf,
}

impl AdbClient {
    /// Initialize a new ADB client, automatically discovering the ADB path.
    pub fn new() -> Self {
        Self {
            adb_path: Self::discover_adb(),
        }
    }

    /// Initialize an ADB client with a specific path.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            adb_path: path.as_ref().to_path_buf(),
        }
    }

    /// Get the path to the ADB executable being used.
    pub fn adb_path(&self) -> &PathBuf {
        &self.adb_path
    }

    /// Run an ADB command with default configuration.
    pub async fn execute(&self, args: &[&str]) -> Result<Output> {
        self.execute_with_config(args, &ExecutionConfig::default())
            .await
    }

    /// Run an ADB command with a specific configuration.
    pub async fn execute_with_config(
        &self,
        args: &[&str],
        config: &ExecutionConfig,
    ) -> Result<Output> {
        let mut last_error = Error::BridgeUnreachable("no attempts made".into());

        for attempt in 0..=config.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }

            match self.run_once(args, config.timeout).await {
                Ok(output) => return Ok(output),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    /// Run a command once, capturing output, bounded by `timeout`.
    async fn run_once(&self, args: &[&str], timeout: Duration) -> Result<Output> {
        let mut cmd = hidden_command(&self.adb_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::BridgeUnreachable(format!("failed to spawn adb: {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::BridgeUnreachable(format!("adb wait failed: {e}"))),
            // kill_on_drop reaps the child when the future is dropped
            Err(_) => Err(Error::BridgeUnreachable(format!(
                "adb {} timed out after {}ms",
                args.first().copied().unwrap_or(""),
                timeout.as_millis()
            ))),
        }
    }

    /// Check that adb responds; returns the version banner's first line.
    pub async fn check_available(&self) -> Result<String> {
        let output = self.execute(&["version"]).await?;
        if output.status.success() {
            let version = String::from_utf8_lossy(&output.stdout);
            Ok(version.lines().next().unwrap_or("unknown version").to_string())
        } else {
            Err(Error::BridgeUnreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Discover the ADB path by checking bundled locations and the system path.
    fn discover_adb() -> PathBuf {
        Self::find_bundled_adb().unwrap_or_else(|| PathBuf::from("adb"))
    }

    /// Check for an adb binary shipped next to the service binary.
    fn find_bundled_adb() -> Option<PathBuf> {
        let exe_path = std::env::current_exe().ok()?;
        let exe_dir = exe_path.parent()?;
        let exe_name = if cfg!(target_os = "windows") {
            "adb.exe"
        } else {
            "adb"
        };

        let possible_paths = [
            Some(exe_dir.join("binaries").join(exe_name)),
            Some(exe_dir.join(exe_name)),
            Some(PathBuf::from("binaries").join(exe_name)),
        ];

        possible_paths.into_iter().flatten().find(|p| p.exists())
    }
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new()
    }
}
