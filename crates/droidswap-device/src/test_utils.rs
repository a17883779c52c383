//! Test utilities for device types
//!
//! Provides a scripted [`DeviceTransport`] and an in-process fake of the
//! on-device installer, so deploy logic can run without a device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::devices::DeviceInfo;
use crate::installer::codec::{read_frame, write_frame, Frame, Opcode};
use crate::installer::protocol::{error_payload, ok_payload};
use crate::installer::INSTALLER_VERSION;
use crate::transport::{DeviceStream, DeviceTransport, ShellOutput};
use droidswap_core::prelude::*;
use droidswap_core::DeviceState;

/// Creates an online device with the given API level.
///
/// # Arguments
/// * `serial` - adb serial
/// * `api_level` - `ro.build.version.sdk`
pub fn test_device_info(serial: &str, api_level: u32) -> DeviceInfo {
    DeviceInfo {
        serial: serial.to_string(),
        state: DeviceState::Online,
        model: Some("Pixel_7".to_string()),
        api_level: Some(api_level),
        fingerprint: Some(format!("google/test/{}:{}/TEST/1:userdebug", serial, api_level)),
        abi: Some("x86_64".to_string()),
        emulator: serial.starts_with("emulator-"),
        ..Default::default()
    }
}

/// What the fake installer does with a request
#[derive(Debug, Clone)]
pub enum FakeReply {
    /// `{"status":"ok", ..body}`
    Ok(Value),
    /// `{"status":"error","message":..}`
    Error(String),
    /// A frame whose payload is not JSON
    Garbage,
    /// Never answer
    Hang,
}

type Handler = dyn Fn(Opcode, &Value) -> FakeReply + Send + Sync;

/// In-process installer served over a duplex pipe
#[derive(Clone)]
pub struct FakeInstaller {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<(Opcode, Value)>>>,
}

impl FakeInstaller {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Opcode, &Value) -> FakeReply + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers the handshake with the current version and everything else with `{}`
    pub fn echo_ok() -> Self {
        Self::new(|opcode, _| match opcode {
            Opcode::Handshake => FakeReply::Ok(json!({ "version": INSTALLER_VERSION })),
            _ => FakeReply::Ok(json!({})),
        })
    }

    /// Requests received so far, shared with every stream this fake serves
    pub fn requests(&self) -> Arc<Mutex<Vec<(Opcode, Value)>>> {
        Arc::clone(&self.requests)
    }

    /// Start serving one installer session and return the client end
    pub fn spawn(&self) -> DeviceStream {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let handler = Arc::clone(&self.handler);
        let requests = Arc::clone(&self.requests);

        tokio::spawn(async move {
            while let Ok(frame) = read_frame(&mut server).await {
                let body: Value = serde_json::from_slice(&frame.payload).unwrap_or(Value::Null);
                if let Ok(mut seen) = requests.lock() {
                    seen.push((frame.opcode, body.clone()));
                }

                let payload = match handler(frame.opcode, &body) {
                    FakeReply::Ok(value) => ok_payload(&value),
                    FakeReply::Error(message) => error_payload(&message),
                    FakeReply::Garbage => b"\xffnot json".to_vec(),
                    FakeReply::Hang => {
                        std::future::pending::<()>().await;
                        return;
                    }
                };

                let reply = Frame::new(frame.opcode, frame.request_id, payload);
                if write_frame(&mut server, &reply).await.is_err() {
                    break;
                }
                if frame.opcode == Opcode::Shutdown {
                    break;
                }
            }
        });

        Box::new(client)
    }
}

#[derive(Debug, Clone)]
enum ScriptedReply {
    Output(ShellOutput),
    Disconnect(String),
}

/// A transport answering shell commands from prefix rules.
///
/// Unmatched commands succeed with empty output. Later rules win.
pub struct ScriptedTransport {
    serial: String,
    rules: Vec<(String, ScriptedReply)>,
    installer: Option<FakeInstaller>,
    shell_log: Mutex<Vec<String>>,
    pushes: Mutex<Vec<(PathBuf, String)>>,
    streams_opened: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            rules: Vec::new(),
            installer: None,
            shell_log: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            streams_opened: AtomicUsize::new(0),
        }
    }

    /// Reply with `output` to commands starting with `prefix`
    pub fn on_shell(mut self, prefix: &str, output: ShellOutput) -> Self {
        self.rules
            .push((prefix.to_string(), ScriptedReply::Output(output)));
        self
    }

    /// Fail commands starting with `prefix` as if the device went away
    pub fn disconnect_on(mut self, prefix: &str, message: &str) -> Self {
        self.rules.push((
            prefix.to_string(),
            ScriptedReply::Disconnect(message.to_string()),
        ));
        self
    }

    pub fn with_installer(mut self, installer: FakeInstaller) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn shell_log(&self) -> Vec<String> {
        self.shell_log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn pushes(&self) -> Vec<(PathBuf, String)> {
        self.pushes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }
}

impl DeviceTransport for ScriptedTransport {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, args: &[&str]) -> Result<ShellOutput> {
        let command = args.join(" ");
        if let Ok(mut log) = self.shell_log.lock() {
            log.push(command.clone());
        }

        let reply = self
            .rules
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(ScriptedReply::Output(output)) => Ok(output),
            Some(ScriptedReply::Disconnect(message)) => Err(Error::disconnected(message)),
            None => Ok(ShellOutput::ok("")),
        }
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        if let Ok(mut pushes) = self.pushes.lock() {
            pushes.push((local.to_path_buf(), remote.to_string()));
        }
        Ok(())
    }

    async fn open_stream(&self, args: &[&str]) -> Result<DeviceStream> {
        let installer = self
            .installer
            .as_ref()
            .ok_or_else(|| Error::transport_failed(format!("cannot start {}", args.join(" "))))?;
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(installer.spawn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info_defaults() {
        let info = test_device_info("emulator-5554", 30);
        assert!(info.is_online());
        assert!(info.emulator);
        assert_eq!(info.api(), 30);
    }

    #[tokio::test]
    async fn test_scripted_rules_latest_wins() {
        let transport = ScriptedTransport::new("serial")
            .on_shell("pm", ShellOutput::ok("first"))
            .on_shell("pm list", ShellOutput::ok("second"));

        assert_eq!(transport.shell(&["pm", "list"]).await.unwrap().stdout, "second");
        assert_eq!(transport.shell(&["pm", "path"]).await.unwrap().stdout, "first");
        assert_eq!(transport.shell(&["true"]).await.unwrap().stdout, "");
        assert_eq!(transport.shell_log().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_disconnect() {
        let transport = ScriptedTransport::new("serial").disconnect_on("getprop", "device offline");
        let err = transport.shell(&["getprop"]).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
