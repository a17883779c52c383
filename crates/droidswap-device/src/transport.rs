//! Device transport: command execution, file push and raw streams over adb

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use droidswap_core::prelude::*;

/// Default timeout for a single adb invocation (push of large APKs included)
const ADB_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// adb stderr fragments meaning the device is gone; retrying will not help.
const DISCONNECT_MARKERS: &[&str] = &[
    "device offline",
    "no devices/emulators found",
    "device unauthorized",
    "not found",
];

/// adb stderr fragments for failures worth one more attempt.
const TRANSIENT_MARKERS: &[&str] = &[
    "protocol fault",
    "connection reset",
    "broken pipe",
    "failed to connect to adb server",
    "cannot connect to daemon",
];

/// Bidirectional byte stream to a process started on the device.
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceIo for T {}

pub type DeviceStream = Box<dyn DeviceIo>;

/// Output of a shell command run on the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ShellOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for messages shown to the user
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

/// Connection to a single device.
///
/// Implementations must map device loss to a non-transient
/// [`Error::Transport`] so callers stop instead of retrying.
#[trait_variant::make(DeviceTransport: Send)]
pub trait LocalDeviceTransport {
    /// Serial number of the device this transport talks to
    fn serial(&self) -> &str;

    /// Run a shell command on the device and wait for it to finish
    async fn shell(&self, args: &[&str]) -> Result<ShellOutput>;

    /// Copy a local file to the device
    async fn push(&self, local: &Path, remote: &str) -> Result<()>;

    /// Start a process on the device and connect to its stdin/stdout
    async fn open_stream(&self, args: &[&str]) -> Result<DeviceStream>;
}

/// Run `op`, retrying it exactly once if it fails with a transient error.
pub async fn with_retry_once<T, F, Fut>(description: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!("{} failed ({}), retrying once", description, e);
            op().await
        }
        other => other,
    }
}

/// Classify adb's own stderr. `None` means adb ran the command and any
/// failure belongs to the remote command itself.
pub fn classify_adb_failure(stderr: &str) -> Option<Error> {
    let lower = stderr.to_lowercase();
    let first_line = stderr.lines().next().unwrap_or_default().trim().to_string();

    if lower.starts_with("error:") || lower.starts_with("adb: error:") {
        if DISCONNECT_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Error::disconnected(first_line));
        }
        if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Error::transport(first_line));
        }
        return Some(Error::transport_failed(first_line));
    }

    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(Error::transport(first_line));
    }

    None
}

/// Transport backed by the `adb` executable
#[derive(Debug, Clone)]
pub struct AdbTransport {
    adb: PathBuf,
    serial: String,
    command_timeout: Duration,
}

impl AdbTransport {
    pub fn new(adb: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            adb: adb.into(),
            serial: serial.into(),
            command_timeout: ADB_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.adb);
        cmd.arg("-s").arg(&self.serial).args(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_adb(&self, args: &[&str]) -> Result<Output> {
        trace!("adb -s {} {}", self.serial, args.join(" "));

        let output = timeout(self.command_timeout, self.command(args).output())
            .await
            .map_err(|_| {
                Error::transport(format!(
                    "adb {} timed out after {:?}",
                    args.first().unwrap_or(&""),
                    self.command_timeout
                ))
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::AdbNotFound
                } else {
                    Error::transport(format!("Failed to run adb: {}", e))
                }
            })?;

        Ok(output)
    }

    async fn shell_once(&self, args: &[&str]) -> Result<ShellOutput> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);

        let output = self.run_adb(&full).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            if let Some(err) = classify_adb_failure(&stderr) {
                return Err(err);
            }
        }

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.status.code(),
        })
    }

    async fn push_once(&self, local: &Path, remote: &str) -> Result<()> {
        let local_str = local.to_string_lossy();
        let output = self.run_adb(&["push", &local_str, remote]).await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(classify_adb_failure(&stderr).unwrap_or_else(|| {
            Error::transport_failed(format!(
                "adb push {} failed: {}",
                local.display(),
                stderr.trim()
            ))
        }))
    }
}

impl DeviceTransport for AdbTransport {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, args: &[&str]) -> Result<ShellOutput> {
        with_retry_once("adb shell", || self.shell_once(args)).await
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        if !local.exists() {
            return Err(Error::ApkNotFound {
                path: local.to_path_buf(),
            });
        }
        debug!("Pushing {} -> {}:{}", local.display(), self.serial, remote);
        with_retry_once("adb push", || self.push_once(local, remote)).await
    }

    async fn open_stream(&self, args: &[&str]) -> Result<DeviceStream> {
        // -T: no pty, the stream carries binary frames
        let mut cmd = Command::new(&self.adb);
        cmd.arg("-s")
            .arg(&self.serial)
            .arg("shell")
            .arg("-T")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AdbNotFound
            } else {
                Error::transport(format!("Failed to open device stream: {}", e))
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport_failed("device stream has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport_failed("device stream has no stdout"))?;

        info!(
            "Opened device stream on {}: {} (pid {:?})",
            self.serial,
            args.join(" "),
            child.id()
        );

        Ok(Box::new(ProcessStream {
            _child: child,
            stdin,
            stdout,
        }))
    }
}

/// stdin/stdout of an `adb shell` child joined into one stream.
/// Dropping it kills the child.
struct ProcessStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProcessStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_classify_disconnect() {
        let err = classify_adb_failure("error: device 'emulator-5554' not found\n").unwrap();
        assert!(matches!(
            err,
            Error::Transport {
                transient: false,
                ..
            }
        ));

        let err = classify_adb_failure("adb: error: device offline").unwrap();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_transient() {
        let err = classify_adb_failure("error: protocol fault (couldn't read status)").unwrap();
        assert!(err.is_transient());

        let err = classify_adb_failure("* failed to connect to adb server").unwrap();
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_remote_command_failure() {
        // A failing remote command is not an adb failure
        assert!(classify_adb_failure("ls: /nope: No such file or directory").is_none());
        assert!(classify_adb_failure("").is_none());
    }

    #[test]
    fn test_shell_output_combined() {
        let out = ShellOutput {
            stdout: "Failure [INSTALL_FAILED_INVALID_APK]\n".to_string(),
            stderr: "extra\n".to_string(),
            exit_code: Some(1),
        };
        assert_eq!(out.combined(), "Failure [INSTALL_FAILED_INVALID_APK]\nextra");
        assert!(!out.success());
        assert!(ShellOutput::ok("x").success());
    }

    #[tokio::test]
    async fn test_retry_once_on_transient() {
        let calls = AtomicUsize::new(0);
        let result = with_retry_once("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::transport("broken pipe"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_surfaces_second_failure() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry_once("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::transport("broken pipe")) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_on_disconnect() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry_once("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::disconnected("device offline")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_adb_is_reported() {
        let transport = AdbTransport::new("/definitely/not/adb", "emulator-5554");
        let err = transport.shell_once(&["true"]).await.unwrap_err();
        assert!(matches!(err, Error::AdbNotFound));
    }
}
