//! Device discovery using `adb devices -l` and `getprop`

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use crate::transport::DeviceTransport;
use droidswap_core::prelude::*;
use droidswap_core::DeviceState;

/// Default timeout for `adb devices`
const DEVICES_TIMEOUT: Duration = Duration::from_secs(15);

/// `[ro.build.version.sdk]: [33]`
static GETPROP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\]:\s*\[(.*)\]$").expect("Invalid getprop regex")
});

/// A device listed by adb, enriched with build properties once its properties are read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: DeviceState,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub api_level: Option<u32>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub abi: Option<String>,
    /// `ro.build.characteristics`, e.g. `["nosdcard", "embedded"]`
    #[serde(default)]
    pub characteristics: Vec<String>,
    #[serde(default)]
    pub emulator: bool,
}

impl DeviceInfo {
    pub fn display_name(&self) -> String {
        match &self.model {
            Some(model) => format!("{} ({})", model.replace('_', " "), self.serial),
            None => self.serial.clone(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    /// Embedded (Android Things) devices have no UI for runtime permission prompts
    pub fn is_embedded(&self) -> bool {
        self.characteristics.iter().any(|c| c == "embedded")
    }

    /// API level, treating an unknown level as the oldest supported one
    pub fn api(&self) -> u32 {
        self.api_level.unwrap_or(0)
    }

    /// Key for the dex archive database. Falls back to the serial when the
    /// build fingerprint could not be read.
    pub fn fingerprint_key(&self) -> String {
        self.fingerprint
            .clone()
            .unwrap_or_else(|| format!("serial:{}", self.serial))
    }

    /// Check if this device matches a user-supplied specifier
    /// (exact serial, or case-insensitive model substring)
    pub fn matches(&self, specifier: &str) -> bool {
        let spec = specifier.to_lowercase();
        if self.serial.to_lowercase() == spec {
            return true;
        }
        self.model
            .as_ref()
            .map(|m| m.to_lowercase().contains(&spec))
            .unwrap_or(false)
    }

    /// Fill in build properties from `getprop` output
    pub fn apply_properties(&mut self, props: &HashMap<String, String>) {
        if let Some(sdk) = props.get("ro.build.version.sdk") {
            self.api_level = sdk.trim().parse().ok();
        }
        if let Some(fp) = props.get("ro.build.fingerprint").filter(|v| !v.is_empty()) {
            self.fingerprint = Some(fp.clone());
        }
        if let Some(model) = props.get("ro.product.model").filter(|v| !v.is_empty()) {
            self.model = Some(model.clone());
        }
        if let Some(abi) = props.get("ro.product.cpu.abi").filter(|v| !v.is_empty()) {
            self.abi = Some(abi.clone());
        }
        if let Some(chars) = props.get("ro.build.characteristics") {
            self.characteristics = chars
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if props.get("ro.kernel.qemu").map(|v| v == "1").unwrap_or(false) {
            self.emulator = true;
        }
    }
}

/// Parse `getprop` output into a key/value map
pub fn parse_getprop(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| GETPROP_LINE.captures(line.trim()))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Parse the output of `adb devices -l`
///
/// ```text
/// List of devices attached
/// emulator-5554          device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1
/// 0A041FDD400327         unauthorized usb:1-1 transport_id:3
/// ```
pub fn parse_adb_devices(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?.to_string();
            let state = DeviceState::parse(parts.next()?);

            let mut info = DeviceInfo {
                emulator: serial.starts_with("emulator-"),
                serial,
                state,
                ..Default::default()
            };

            for attr in parts {
                match attr.split_once(':') {
                    Some(("model", value)) => info.model = Some(value.to_string()),
                    Some(("product", value)) => info.product = Some(value.to_string()),
                    _ => {}
                }
            }

            Some(info)
        })
        .collect()
}

/// List devices known to the adb server
pub async fn discover_devices(adb: &Path) -> Result<Vec<DeviceInfo>> {
    let start = std::time::Instant::now();

    let output = timeout(
        DEVICES_TIMEOUT,
        Command::new(adb)
            .args(["devices", "-l"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| Error::transport("adb devices timed out"))?
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::AdbNotFound
        } else {
            Error::transport(format!("Failed to run adb devices: {}", e))
        }
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let devices = parse_adb_devices(&stdout);

    info!("Discovered {} devices in {:?}", devices.len(), start.elapsed());
    Ok(devices)
}

/// Read build properties of the device behind `transport` into `info`
pub async fn read_device_properties<T: DeviceTransport>(
    transport: &T,
    info: &mut DeviceInfo,
) -> Result<()> {
    let output = transport.shell(&["getprop"]).await?;
    if !output.success() {
        return Err(Error::transport_failed(format!(
            "getprop failed on {}: {}",
            transport.serial(),
            output.combined()
        )));
    }

    let props = parse_getprop(&output.stdout);
    info.apply_properties(&props);

    debug!(
        "Read properties of {}: api={:?} abi={:?} fingerprint={:?}",
        info.serial, info.api_level, info.abi, info.fingerprint
    );
    Ok(())
}

/// Pick the target device.
///
/// Without a specifier, the only online device is chosen; with several
/// online devices a specifier is required.
pub fn select_device(devices: &[DeviceInfo], specifier: Option<&str>) -> Result<DeviceInfo> {
    let online: Vec<&DeviceInfo> = devices.iter().filter(|d| d.is_online()).collect();

    match specifier {
        Some(spec) => online
            .into_iter()
            .find(|d| d.matches(spec))
            .cloned()
            .ok_or_else(|| Error::device_not_found(spec)),
        None => match online.as_slice() {
            [] => Err(Error::device_not_found("any online device")),
            [only] => Ok((*only).clone()),
            many => Err(Error::device_not_found(format!(
                "a unique device ({} online, pass --serial)",
                many.len()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES_OUTPUT: &str = "List of devices attached\n\
        emulator-5554          device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1\n\
        0A041FDD400327         unauthorized usb:1-1 transport_id:3\n\
        R58M123ABC             device usb:1-2 product:beyond1 model:SM_G973F device:beyond1 transport_id:4\n\n";

    #[test]
    fn test_parse_adb_devices() {
        let devices = parse_adb_devices(DEVICES_OUTPUT);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].serial, "emulator-5554");
        assert!(devices[0].emulator);
        assert!(devices[0].is_online());
        assert_eq!(devices[0].model.as_deref(), Some("sdk_gphone64_x86_64"));

        assert_eq!(devices[1].state, DeviceState::Unauthorized);
        assert!(devices[1].model.is_none());

        assert_eq!(devices[2].model.as_deref(), Some("SM_G973F"));
        assert!(!devices[2].emulator);
    }

    #[test]
    fn test_parse_adb_devices_skips_daemon_banner() {
        let output = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\n";
        assert!(parse_adb_devices(output).is_empty());
    }

    #[test]
    fn test_parse_getprop() {
        let props = parse_getprop(
            "[ro.build.version.sdk]: [33]\n[ro.build.fingerprint]: [google/sdk/emu64x:13/TE1A/123:userdebug/dev-keys]\n[ro.build.characteristics]: [nosdcard,embedded]\n[ro.kernel.qemu]: [1]\ngarbage\n",
        );
        assert_eq!(props.get("ro.build.version.sdk").unwrap(), "33");

        let mut info = DeviceInfo::default();
        info.apply_properties(&props);
        assert_eq!(info.api_level, Some(33));
        assert!(info.fingerprint.as_deref().unwrap().starts_with("google/sdk"));
        assert!(info.is_embedded());
        assert!(info.emulator);
    }

    #[test]
    fn test_fingerprint_key_fallback() {
        let info = DeviceInfo {
            serial: "abc".to_string(),
            ..Default::default()
        };
        assert_eq!(info.fingerprint_key(), "serial:abc");
    }

    #[test]
    fn test_select_device_single() {
        let devices = parse_adb_devices(DEVICES_OUTPUT);
        let only_one = vec![devices[0].clone(), devices[1].clone()];
        let selected = select_device(&only_one, None).unwrap();
        assert_eq!(selected.serial, "emulator-5554");
    }

    #[test]
    fn test_select_device_requires_specifier_when_ambiguous() {
        let devices = parse_adb_devices(DEVICES_OUTPUT);
        assert!(select_device(&devices, None).is_err());

        let selected = select_device(&devices, Some("sm_g973")).unwrap();
        assert_eq!(selected.serial, "R58M123ABC");
    }

    #[test]
    fn test_select_device_ignores_unauthorized() {
        let devices = parse_adb_devices(DEVICES_OUTPUT);
        let err = select_device(&devices, Some("0A041FDD400327")).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
    }

    #[test]
    fn test_display_name() {
        let devices = parse_adb_devices(DEVICES_OUTPUT);
        assert_eq!(devices[2].display_name(), "SM G973F (R58M123ABC)");
    }
}
