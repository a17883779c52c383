//! Typed request/response payloads carried in installer frames

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use droidswap_core::prelude::*;

/// Decoded response envelope: `{"status":"ok", ...}` or
/// `{"status":"error","message":"..."}`
#[derive(Debug, Clone, PartialEq)]
pub struct InstallerResponse {
    pub ok: bool,
    pub message: Option<String>,
    pub body: Value,
}

impl InstallerResponse {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let body: Value = serde_json::from_slice(payload).map_err(|e| {
            Error::installer_protocol(format!("response is not valid JSON: {}", e))
        })?;

        let ok = match body.get("status").and_then(Value::as_str) {
            Some("ok") => true,
            Some("error") => false,
            other => {
                return Err(Error::installer_protocol(format!(
                    "response has invalid status {:?}",
                    other
                )))
            }
        };

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self { ok, message, body })
    }

    /// Deserialize the response body into a typed struct
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            Error::installer_protocol(format!("unexpected response body: {}", e))
        })
    }

    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "installer reported an unknown error".to_string())
    }
}

/// Build an `ok` response payload from a serializable body
pub fn ok_payload<T: Serialize>(body: &T) -> Vec<u8> {
    let mut value = serde_json::to_value(body).unwrap_or(Value::Null);
    if !value.is_object() {
        value = Value::Object(Default::default());
    }
    if let Value::Object(map) = &mut value {
        map.insert("status".to_string(), Value::String("ok".to_string()));
    }
    value.to_string().into_bytes()
}

/// Build an `error` response payload
pub fn error_payload(message: &str) -> Vec<u8> {
    serde_json::json!({ "status": "error", "message": message })
        .to_string()
        .into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRequest {
    pub package: String,
}

/// An APK currently installed for a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApk {
    /// Split name, e.g. `base.apk` or `split_config.arm64_v8a.apk`
    pub name: String,
    /// sha256 of the installed file, lowercase hex
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpResponse {
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub apks: Vec<InstalledApk>,
    /// Running processes of the package
    #[serde(default)]
    pub pids: Vec<u32>,
}

/// Where the installer takes an APK from during a delta install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DeltaSource {
    /// Reuse the currently installed split
    Installed,
    /// Use the file pushed to `remote_path`
    Pushed { remote_path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaApk {
    pub name: String,
    #[serde(flatten)]
    pub source: DeltaSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaInstallRequest {
    pub package: String,
    pub apks: Vec<DeltaApk>,
    /// `pm install` flags
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub package: String,
    /// Staged APKs holding the new code/resources
    pub staged_apks: Vec<String>,
    /// Class descriptors to redefine
    pub classes: Vec<String>,
    /// Also swap resources (full swap)
    pub resources: bool,
    /// Processes already handled by an attached debugger
    #[serde(default)]
    pub skip_pids: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapResponse {
    #[serde(default)]
    pub swapped_pids: Vec<u32>,
}
