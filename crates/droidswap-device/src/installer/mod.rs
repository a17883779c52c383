//! Client for the long-lived on-device installer process
//!
//! The installer is a helper binary pushed to the device and kept running
//! for the duration of a device session. It answers framed JSON requests
//! (see [`codec`]) over the stdin/stdout of an `adb shell` stream.
//!
//! State machine:
//!
//! ```text
//! NotStarted ──ensure_running──▶ Starting ──handshake ok──▶ Ready
//!                                   │                         │
//!                                   └──push/spawn failed──▶ Failed ◀──protocol violation / timeout
//! ```
//!
//! Only `Ready` serves requests. `Failed` requires a fresh `ensure_running()`.

pub mod codec;
pub mod protocol;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;

use crate::transport::{DeviceStream, DeviceTransport};
use codec::{read_frame, write_frame, Frame, Opcode};
use droidswap_core::prelude::*;
use protocol::{HandshakeRequest, HandshakeResponse, InstallerResponse};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Default number of bootstrap attempts per `ensure_running()` call
pub const DEFAULT_BOOTSTRAP_ATTEMPTS: u32 = 2;

/// Version the on-device binary must report
pub const INSTALLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lifecycle of the on-device installer process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerState {
    NotStarted,
    Starting,
    Ready,
    Failed,
}

impl std::fmt::Display for InstallerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallerState::NotStarted => write!(f, "not started"),
            InstallerState::Starting => write!(f, "starting"),
            InstallerState::Ready => write!(f, "ready"),
            InstallerState::Failed => write!(f, "failed"),
        }
    }
}

/// Where the installer binary lives locally and on the device
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Directory holding `<abi>/installer` binaries (or a single `installer`)
    pub local_dir: PathBuf,
    /// Device directory the binary is pushed to
    pub remote_dir: String,
    /// Version string expected from `installer -version`
    pub version: String,
    /// Timeout of a single request
    pub request_timeout: Duration,
    /// Bootstrap attempts per `ensure_running()` call (at least one)
    pub bootstrap_attempts: u32,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("installer"),
            remote_dir: "/data/local/tmp/.droidswap".to_string(),
            version: INSTALLER_VERSION.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bootstrap_attempts: DEFAULT_BOOTSTRAP_ATTEMPTS,
        }
    }
}

impl InstallerConfig {
    pub fn remote_binary(&self) -> String {
        format!("{}/installer", self.remote_dir.trim_end_matches('/'))
    }

    /// Staging directory on the device for pushed APKs
    pub fn staging_dir(&self, package: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), package)
    }

    /// Local binary for `abi`, falling back to an ABI-less `installer`
    pub fn local_binary(&self, abi: Option<&str>) -> PathBuf {
        if let Some(abi) = abi {
            let candidate = self.local_dir.join(abi).join("installer");
            if candidate.is_file() {
                return candidate;
            }
        }
        self.local_dir.join("installer")
    }
}

/// Client side of the installer channel for one device
pub struct InstallerClient {
    config: InstallerConfig,
    abi: Option<String>,
    state: InstallerState,
    stream: Option<DeviceStream>,
    next_request_id: u32,
}

impl std::fmt::Debug for InstallerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallerClient")
            .field("state", &self.state)
            .field("abi", &self.abi)
            .field("stream", &self.stream.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

impl InstallerClient {
    pub fn new(config: InstallerConfig, abi: Option<String>) -> Self {
        Self {
            config,
            abi,
            state: InstallerState::NotStarted,
            stream: None,
            next_request_id: 1,
        }
    }

    pub fn state(&self) -> InstallerState {
        self.state
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Make sure the installer is running. Idempotent once `Ready`.
    pub async fn ensure_running<T: DeviceTransport>(&mut self, transport: &T) -> Result<()> {
        if self.state == InstallerState::Ready {
            return Ok(());
        }

        let attempts = self.config.bootstrap_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            self.state = InstallerState::Starting;
            self.stream = None;

            match self.bootstrap(transport).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.state = InstallerState::Ready;
                    info!("Installer ready on {}", transport.serial());
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Installer bootstrap attempt {}/{} on {} failed: {}",
                        attempt,
                        attempts,
                        transport.serial(),
                        e
                    );
                    self.state = InstallerState::Failed;
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        Err(Error::installer_bootstrap(format!(
            "{} (after {} attempt{})",
            reason,
            attempts,
            if attempts == 1 { "" } else { "s" }
        )))
    }

    async fn bootstrap<T: DeviceTransport>(&mut self, transport: &T) -> Result<DeviceStream> {
        let remote = self.config.remote_binary();

        let version_check = transport.shell(&[&remote, "-version"]).await?;
        let installed_version = version_check.stdout.trim();
        if !version_check.success() || installed_version != self.config.version {
            debug!(
                "Installer on device is {:?}, expected {}; pushing",
                installed_version, self.config.version
            );
            self.push_binary(transport, &remote).await?;
        }

        let mut stream = transport.open_stream(&[&remote, "-daemon"]).await?;

        let id = self.take_request_id();
        let payload = serde_json::to_vec(&HandshakeRequest {
            version: self.config.version.clone(),
        })?;
        let response = exchange(
            &mut stream,
            Opcode::Handshake,
            id,
            payload,
            self.config.request_timeout,
        )
        .await?;

        if !response.ok {
            return Err(Error::installer_bootstrap(response.error_message()));
        }
        let handshake: HandshakeResponse = response.parse()?;
        if handshake.version != self.config.version {
            return Err(Error::installer_bootstrap(format!(
                "installer reports version {}, expected {}",
                handshake.version, self.config.version
            )));
        }

        Ok(stream)
    }

    async fn push_binary<T: DeviceTransport>(&self, transport: &T, remote: &str) -> Result<()> {
        let local = self.config.local_binary(self.abi.as_deref());
        if !local.is_file() {
            return Err(Error::installer_bootstrap(format!(
                "local installer binary not found at {}",
                local.display()
            )));
        }

        let mkdir = transport
            .shell(&["mkdir", "-p", &self.config.remote_dir])
            .await?;
        if !mkdir.success() {
            return Err(Error::installer_bootstrap(format!(
                "cannot create {}: {}",
                self.config.remote_dir,
                mkdir.combined()
            )));
        }

        transport.push(&local, remote).await?;

        let chmod = transport.shell(&["chmod", "755", remote]).await?;
        if !chmod.success() {
            return Err(Error::installer_bootstrap(format!(
                "cannot make {} executable: {}",
                remote,
                chmod.combined()
            )));
        }

        info!("Pushed installer {} to {}", local.display(), remote);
        Ok(())
    }

    fn take_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    fn fail(&mut self) {
        self.state = InstallerState::Failed;
        self.stream = None;
    }

    /// Send a request and wait for its response.
    ///
    /// A protocol violation or timeout moves the client to `Failed`.
    pub async fn request<P: Serialize>(
        &mut self,
        opcode: Opcode,
        payload: &P,
    ) -> Result<InstallerResponse> {
        if self.state != InstallerState::Ready {
            return Err(Error::InstallerNotReady {
                state: self.state.to_string(),
            });
        }

        let bytes = serde_json::to_vec(payload)?;
        let id = self.take_request_id();
        let request_timeout = self.config.request_timeout;

        let Some(stream) = self.stream.as_mut() else {
            self.fail();
            return Err(Error::InstallerNotReady {
                state: InstallerState::Failed.to_string(),
            });
        };

        debug!("Installer request #{}: {}", id, opcode.name());
        match exchange(stream, opcode, id, bytes, request_timeout).await {
            Ok(response) => {
                debug!("Installer request #{} completed: ok={}", id, response.ok);
                Ok(response)
            }
            Err(e) => {
                error!("Installer request #{} ({}) failed: {}", id, opcode.name(), e);
                self.fail();
                Err(e)
            }
        }
    }

    /// Ask the installer to exit and drop the stream. Best effort.
    pub async fn shutdown(&mut self) {
        if self.state == InstallerState::Ready {
            if let Err(e) = self.request(Opcode::Shutdown, &serde_json::json!({})).await {
                debug!("Installer shutdown request failed: {}", e);
            }
        }
        self.stream = None;
        self.state = InstallerState::NotStarted;
    }
}

/// Write one request frame and read the matching response, under `limit`.
async fn exchange(
    stream: &mut DeviceStream,
    opcode: Opcode,
    request_id: u32,
    payload: Vec<u8>,
    limit: Duration,
) -> Result<InstallerResponse> {
    let frame = Frame::new(opcode, request_id, payload);

    let response = timeout(limit, async {
        write_frame(stream, &frame).await?;
        read_frame(stream).await
    })
    .await
    .map_err(|_| Error::InstallerTimeout {
        request: opcode.name().to_string(),
        timeout_ms: limit.as_millis() as u64,
    })??;

    if response.opcode != opcode || response.request_id != request_id {
        return Err(Error::installer_protocol(format!(
            "response {:?}#{} does not answer request {:?}#{}",
            response.opcode, response.request_id, opcode, request_id
        )));
    }

    InstallerResponse::from_payload(&response.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeInstaller, FakeReply, ScriptedTransport};
    use crate::transport::ShellOutput;
    use serde_json::json;

    fn config_with_binary(dir: &std::path::Path) -> InstallerConfig {
        std::fs::write(dir.join("installer"), b"\x7fELF").unwrap();
        InstallerConfig {
            local_dir: dir.to_path_buf(),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_running_skips_push_when_current() {
        let config = InstallerConfig::default();
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&config.remote_binary(), ShellOutput::ok(INSTALLER_VERSION))
            .with_installer(FakeInstaller::echo_ok());
        let mut client = InstallerClient::new(config, None);

        client.ensure_running(&transport).await.unwrap();
        assert_eq!(client.state(), InstallerState::Ready);
        assert!(transport.pushes().is_empty());

        // idempotent: no second stream
        client.ensure_running(&transport).await.unwrap();
        assert_eq!(transport.streams_opened(), 1);
    }

    #[tokio::test]
    async fn test_ensure_running_pushes_stale_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_binary(dir.path());
        let remote = config.remote_binary();
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&remote, ShellOutput::ok("0.0.1"))
            .with_installer(FakeInstaller::echo_ok());
        let mut client = InstallerClient::new(config, Some("x86_64".to_string()));

        client.ensure_running(&transport).await.unwrap();

        let pushes = transport.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, remote);
        assert!(transport
            .shell_log()
            .iter()
            .any(|cmd| cmd == &format!("chmod 755 {}", remote)));
    }

    #[tokio::test]
    async fn test_bootstrap_fails_without_local_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallerConfig {
            local_dir: dir.path().to_path_buf(),
            bootstrap_attempts: 3,
            ..Default::default()
        };
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&config.remote_binary(), ShellOutput::failed(127, "not found"));
        let mut client = InstallerClient::new(config, None);

        let err = client.ensure_running(&transport).await.unwrap_err();
        assert!(matches!(err, Error::InstallerBootstrap { .. }));
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(client.state(), InstallerState::Failed);
        assert_eq!(transport.streams_opened(), 0);
    }

    #[tokio::test]
    async fn test_request_before_ready_is_rejected() {
        let mut client = InstallerClient::new(InstallerConfig::default(), None);
        let err = client
            .request(Opcode::Dump, &json!({"package": "com.example"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstallerNotReady { .. }));
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let config = InstallerConfig::default();
        let installer = FakeInstaller::new(|opcode, _payload| match opcode {
            Opcode::Dump => FakeReply::Ok(json!({"installed": true, "apks": [], "pids": [42]})),
            _ => FakeReply::Ok(json!({"version": INSTALLER_VERSION})),
        });
        let requests = installer.requests();
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&config.remote_binary(), ShellOutput::ok(INSTALLER_VERSION))
            .with_installer(installer);
        let mut client = InstallerClient::new(config, None);
        client.ensure_running(&transport).await.unwrap();

        let response = client
            .request(Opcode::Dump, &json!({"package": "com.example"}))
            .await
            .unwrap();
        let dump: protocol::DumpResponse = response.parse().unwrap();
        assert_eq!(dump.pids, vec![42]);

        let seen = requests.lock().unwrap();
        assert_eq!(seen.last().unwrap().0, Opcode::Dump);
        assert_eq!(seen.last().unwrap().1["package"], "com.example");
    }

    #[tokio::test]
    async fn test_malformed_response_fails_client() {
        let config = InstallerConfig::default();
        let installer = FakeInstaller::new(|opcode, _| match opcode {
            Opcode::Handshake => FakeReply::Ok(json!({"version": INSTALLER_VERSION})),
            _ => FakeReply::Garbage,
        });
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&config.remote_binary(), ShellOutput::ok(INSTALLER_VERSION))
            .with_installer(installer);
        let mut client = InstallerClient::new(config, None);
        client.ensure_running(&transport).await.unwrap();

        let err = client
            .request(Opcode::Swap, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstallerProtocol { .. }));
        assert_eq!(client.state(), InstallerState::Failed);

        // a fresh ensure_running restarts the helper
        client.ensure_running(&transport).await.unwrap();
        assert_eq!(client.state(), InstallerState::Ready);
        assert_eq!(transport.streams_opened(), 2);
    }

    #[tokio::test]
    async fn test_timeout_fails_client() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_binary(dir.path());
        let installer = FakeInstaller::new(|opcode, _| match opcode {
            Opcode::Handshake => FakeReply::Ok(json!({"version": INSTALLER_VERSION})),
            _ => FakeReply::Hang,
        });
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&config.remote_binary(), ShellOutput::ok(INSTALLER_VERSION))
            .with_installer(installer);
        let mut client = InstallerClient::new(config, None);
        client.ensure_running(&transport).await.unwrap();

        let err = client
            .request(Opcode::Dump, &json!({"package": "com.example"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstallerTimeout { .. }));
        assert_eq!(client.state(), InstallerState::Failed);

        client.ensure_running(&transport).await.unwrap();
        assert_eq!(client.state(), InstallerState::Ready);
        assert_eq!(transport.streams_opened(), 2);
        assert!(transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_installer_error_is_not_protocol_violation() {
        let config = InstallerConfig::default();
        let installer = FakeInstaller::new(|opcode, _| match opcode {
            Opcode::Handshake => FakeReply::Ok(json!({"version": INSTALLER_VERSION})),
            _ => FakeReply::Error("redefinition failed".to_string()),
        });
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&config.remote_binary(), ShellOutput::ok(INSTALLER_VERSION))
            .with_installer(installer);
        let mut client = InstallerClient::new(config, None);
        client.ensure_running(&transport).await.unwrap();

        let response = client.request(Opcode::Swap, &json!({})).await.unwrap();
        assert!(!response.ok);
        assert_eq!(response.error_message(), "redefinition failed");
        assert_eq!(client.state(), InstallerState::Ready);
    }

    #[tokio::test]
    async fn test_shutdown_resets_state() {
        let config = InstallerConfig::default();
        let installer = FakeInstaller::echo_ok();
        let requests = installer.requests();
        let transport = ScriptedTransport::new("emulator-5554")
            .on_shell(&config.remote_binary(), ShellOutput::ok(INSTALLER_VERSION))
            .with_installer(installer);
        let mut client = InstallerClient::new(config, None);
        client.ensure_running(&transport).await.unwrap();

        client.shutdown().await;
        assert_eq!(client.state(), InstallerState::NotStarted);
        assert!(requests
            .lock()
            .unwrap()
            .iter()
            .any(|(op, _)| *op == Opcode::Shutdown));
    }

    #[test]
    fn test_config_paths() {
        let config = InstallerConfig {
            remote_dir: "/data/local/tmp/.droidswap/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.remote_binary(), "/data/local/tmp/.droidswap/installer");
        assert_eq!(
            config.staging_dir("com.example"),
            "/data/local/tmp/.droidswap/com.example"
        );
    }
}
