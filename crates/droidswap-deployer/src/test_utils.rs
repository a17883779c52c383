//! Test utilities for deploy logic
//!
//! - [`DexBuilder`] / [`ApkBuilder`] write small but well-formed dex files and APKs.
//! - [`FakeDevice`] simulates a device: `getprop`, `pm` install sessions and an
//!   installer process that tracks installed APK digests and swaps.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};

use crate::apk::sha256_hex;
use crate::dex::{
    CLASS_DEF_SIZE, CODE_ITEM_HEADER, HEADER_SIZE, MEMBER_ID_SIZE, NO_INDEX, PROTO_ID_SIZE,
};
use droidswap_core::prelude::*;
use droidswap_device::test_utils::{test_device_info, FakeInstaller, FakeReply};
use droidswap_device::{
    DeltaInstallRequest, DeltaSource, DeviceInfo, DeviceStream, DeviceTransport, InstalledApk,
    Opcode, ShellOutput, SwapRequest, INSTALLER_VERSION,
};

// ─────────────────────────────────────────────────────────────────
// Dex / APK builders
// ─────────────────────────────────────────────────────────────────

fn put_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn put_u32_at(out: &mut [u8], off: usize, value: u32) {
    out[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u16_at(out: &mut [u8], off: usize, value: u16) {
    out[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn align4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// String and type tables, interned in first-use order
#[derive(Default)]
struct DexTables {
    strings: Vec<String>,
    types: Vec<u32>,
}

impl DexTables {
    fn string(&mut self, value: &str) -> u32 {
        match self.strings.iter().position(|s| s == value) {
            Some(idx) => idx as u32,
            None => {
                self.strings.push(value.to_string());
                (self.strings.len() - 1) as u32
            }
        }
    }

    fn ty(&mut self, descriptor: &str) -> u32 {
        let string_idx = self.string(descriptor);
        match self.types.iter().position(|s| *s == string_idx) {
            Some(idx) => idx as u32,
            None => {
                self.types.push(string_idx);
                (self.types.len() - 1) as u32
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DexClass {
    descriptor: String,
    methods: Vec<Vec<u16>>,
    interfaces: Vec<String>,
    static_fields: Vec<(String, String)>,
    static_values: Vec<u8>,
    annotations: Vec<String>,
}

/// Offsets of one class's items in the data section
#[derive(Debug, Default)]
struct ClassOffsets {
    code: Vec<u32>,
    interfaces: u32,
    static_values: u32,
    annotations: u32,
    class_data: u32,
}

/// Writes a dex file with one direct method per instruction list.
///
/// `interface`, `static_field`, `static_values` and `annotation` apply to
/// the class added last.
#[derive(Debug, Clone, Default)]
pub struct DexBuilder {
    classes: Vec<DexClass>,
}

impl DexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, descriptor: &str, methods: &[&[u16]]) -> Self {
        self.classes.push(DexClass {
            descriptor: descriptor.to_string(),
            methods: methods.iter().map(|m| m.to_vec()).collect(),
            ..DexClass::default()
        });
        self
    }

    fn last(&mut self) -> &mut DexClass {
        self.classes.last_mut().expect("add a class first")
    }

    pub fn interface(mut self, descriptor: &str) -> Self {
        self.last().interfaces.push(descriptor.to_string());
        self
    }

    /// Declare a `public static final` field
    pub fn static_field(mut self, name: &str, descriptor: &str) -> Self {
        self.last()
            .static_fields
            .push((name.to_string(), descriptor.to_string()));
        self
    }

    /// Raw `encoded_array` holding the initial values of the static fields
    pub fn static_values(mut self, encoded: &[u8]) -> Self {
        self.last().static_values = encoded.to_vec();
        self
    }

    /// Runtime-visible class annotation without elements
    pub fn annotation(mut self, descriptor: &str) -> Self {
        self.last().annotations.push(descriptor.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut tables = DexTables::default();
        let object_idx = tables.ty("Ljava/lang/Object;");
        let void_idx = tables.ty("V");
        let shorty_idx = tables.string("V");

        // (class type, member type or proto, name)
        let mut field_ids: Vec<(u32, u32, u32)> = Vec::new();
        let mut method_ids: Vec<(u32, u32, u32)> = Vec::new();
        let mut class_types = Vec::with_capacity(self.classes.len());
        let mut field_bases = Vec::with_capacity(self.classes.len());
        let mut method_bases = Vec::with_capacity(self.classes.len());
        let mut interface_types: Vec<Vec<u32>> = Vec::with_capacity(self.classes.len());
        let mut annotation_types: Vec<Vec<u32>> = Vec::with_capacity(self.classes.len());

        for class in &self.classes {
            let class_idx = tables.ty(&class.descriptor);
            class_types.push(class_idx);
            interface_types.push(class.interfaces.iter().map(|d| tables.ty(d)).collect());
            annotation_types.push(class.annotations.iter().map(|d| tables.ty(d)).collect());

            field_bases.push(field_ids.len() as u32);
            for (name, descriptor) in &class.static_fields {
                field_ids.push((class_idx, tables.ty(descriptor), tables.string(name)));
            }

            method_bases.push(method_ids.len() as u32);
            for j in 0..class.methods.len() {
                method_ids.push((class_idx, 0, tables.string(&format!("m{}", j))));
            }
        }

        let class_count = self.classes.len();
        let string_ids_off = HEADER_SIZE;
        let type_ids_off = string_ids_off + 4 * tables.strings.len();
        let proto_ids_off = type_ids_off + 4 * tables.types.len();
        let field_ids_off = proto_ids_off + PROTO_ID_SIZE;
        let method_ids_off = field_ids_off + MEMBER_ID_SIZE * field_ids.len();
        let class_defs_off = method_ids_off + MEMBER_ID_SIZE * method_ids.len();
        let data_off = class_defs_off + CLASS_DEF_SIZE * class_count;

        let mut out = vec![0u8; data_off];

        let mut string_offsets = Vec::with_capacity(tables.strings.len());
        for s in &tables.strings {
            string_offsets.push(out.len() as u32);
            put_uleb128(&mut out, s.len() as u32);
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }

        let mut offsets: Vec<ClassOffsets> = Vec::with_capacity(class_count);
        for (i, class) in self.classes.iter().enumerate() {
            let mut class_offsets = ClassOffsets::default();

            for insns in &class.methods {
                align4(&mut out);
                class_offsets.code.push(out.len() as u32);
                let mut header = [0u8; CODE_ITEM_HEADER];
                header[0..2].copy_from_slice(&1u16.to_le_bytes());
                header[12..16].copy_from_slice(&(insns.len() as u32).to_le_bytes());
                out.extend_from_slice(&header);
                for unit in insns {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
            }

            if !interface_types[i].is_empty() {
                align4(&mut out);
                class_offsets.interfaces = out.len() as u32;
                out.extend_from_slice(&(interface_types[i].len() as u32).to_le_bytes());
                for idx in &interface_types[i] {
                    out.extend_from_slice(&(*idx as u16).to_le_bytes());
                }
            }

            if !class.static_values.is_empty() {
                class_offsets.static_values = out.len() as u32;
                out.extend_from_slice(&class.static_values);
            }

            if !annotation_types[i].is_empty() {
                let mut items = Vec::new();
                for idx in &annotation_types[i] {
                    items.push(out.len() as u32);
                    out.push(0x01); // VISIBILITY_RUNTIME
                    put_uleb128(&mut out, *idx);
                    put_uleb128(&mut out, 0);
                }
                align4(&mut out);
                let set_off = out.len() as u32;
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    out.extend_from_slice(&item.to_le_bytes());
                }
                class_offsets.annotations = out.len() as u32;
                out.extend_from_slice(&set_off.to_le_bytes());
                out.extend_from_slice(&[0u8; 12]);
            }

            class_offsets.class_data = out.len() as u32;
            put_uleb128(&mut out, class.static_fields.len() as u32);
            put_uleb128(&mut out, 0);
            put_uleb128(&mut out, class.methods.len() as u32);
            put_uleb128(&mut out, 0);
            for j in 0..class.static_fields.len() {
                put_uleb128(&mut out, if j == 0 { field_bases[i] } else { 1 });
                put_uleb128(&mut out, 0x19);
            }
            for (j, code_off) in class_offsets.code.iter().enumerate() {
                put_uleb128(&mut out, if j == 0 { method_bases[i] } else { 1 });
                put_uleb128(&mut out, 0x1);
                put_uleb128(&mut out, *code_off);
            }

            offsets.push(class_offsets);
        }

        for (i, off) in string_offsets.iter().enumerate() {
            put_u32_at(&mut out, string_ids_off + 4 * i, *off);
        }
        for (i, string_idx) in tables.types.iter().enumerate() {
            put_u32_at(&mut out, type_ids_off + 4 * i, *string_idx);
        }

        put_u32_at(&mut out, proto_ids_off, shorty_idx);
        put_u32_at(&mut out, proto_ids_off + 4, void_idx);

        for (table_off, ids) in [(field_ids_off, &field_ids), (method_ids_off, &method_ids)] {
            for (i, (class_idx, ty, name)) in ids.iter().enumerate() {
                let off = table_off + MEMBER_ID_SIZE * i;
                put_u16_at(&mut out, off, *class_idx as u16);
                put_u16_at(&mut out, off + 2, *ty as u16);
                put_u32_at(&mut out, off + 4, *name);
            }
        }

        for (i, class_offsets) in offsets.iter().enumerate() {
            let def = class_defs_off + CLASS_DEF_SIZE * i;
            put_u32_at(&mut out, def, class_types[i]);
            put_u32_at(&mut out, def + 4, 0x1);
            put_u32_at(&mut out, def + 8, object_idx);
            put_u32_at(&mut out, def + 12, class_offsets.interfaces);
            put_u32_at(&mut out, def + 16, NO_INDEX);
            put_u32_at(&mut out, def + 20, class_offsets.annotations);
            put_u32_at(&mut out, def + 24, class_offsets.class_data);
            put_u32_at(&mut out, def + 28, class_offsets.static_values);
        }

        let file_size = out.len() as u32;
        out[0..8].copy_from_slice(b"dex\n035\0");
        put_u32_at(&mut out, 0x20, file_size);
        put_u32_at(&mut out, 0x24, HEADER_SIZE as u32);
        put_u32_at(&mut out, 0x28, 0x1234_5678);
        put_u32_at(&mut out, 0x38, tables.strings.len() as u32);
        put_u32_at(&mut out, 0x3c, string_ids_off as u32);
        put_u32_at(&mut out, 0x40, tables.types.len() as u32);
        put_u32_at(&mut out, 0x44, type_ids_off as u32);
        put_u32_at(&mut out, 0x48, 1);
        put_u32_at(&mut out, 0x4c, proto_ids_off as u32);
        put_u32_at(&mut out, 0x50, field_ids.len() as u32);
        put_u32_at(&mut out, 0x54, field_ids_off as u32);
        put_u32_at(&mut out, 0x58, method_ids.len() as u32);
        put_u32_at(&mut out, 0x5c, method_ids_off as u32);
        put_u32_at(&mut out, 0x60, class_count as u32);
        put_u32_at(&mut out, 0x64, class_defs_off as u32);
        put_u32_at(&mut out, 0x68, file_size - data_off as u32);
        put_u32_at(&mut out, 0x6c, data_off as u32);
        out
    }
}

/// Writes an APK (a zip) with a manifest, dex files and resources
#[derive(Debug, Clone)]
pub struct ApkBuilder {
    manifest: Vec<u8>,
    entries: Vec<(String, Vec<u8>)>,
}

impl Default for ApkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ApkBuilder {
    pub fn new() -> Self {
        Self {
            manifest: b"<manifest package=\"com.example\"/>".to_vec(),
            entries: Vec::new(),
        }
    }

    pub fn manifest(mut self, content: &[u8]) -> Self {
        self.manifest = content.to_vec();
        self
    }

    pub fn dex(mut self, name: &str, dex: DexBuilder) -> Self {
        self.entries.push((name.to_string(), dex.build()));
        self
    }

    pub fn resource(mut self, name: &str, content: &[u8]) -> Self {
        self.entries.push((name.to_string(), content.to_vec()));
        self
    }

    /// Write the APK as `dir/file_name` and return its path
    pub fn write(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        let file = std::fs::File::create(&path).expect("create apk");
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default());

        zip.start_file("AndroidManifest.xml", options)
            .expect("start manifest");
        zip.write_all(&self.manifest).expect("write manifest");
        for (name, content) in &self.entries {
            zip.start_file(name.as_str(), options).expect("start entry");
            zip.write_all(content).expect("write entry");
        }
        zip.finish().expect("finish apk");
        path
    }
}

// ─────────────────────────────────────────────────────────────────
// Fake device
// ─────────────────────────────────────────────────────────────────

/// Mutable state behind a [`FakeDevice`]
#[derive(Debug, Default)]
pub struct FakeDeviceState {
    /// Installed APKs per package
    pub installed: BTreeMap<String, Vec<InstalledApk>>,
    /// Running processes per package
    pub running: HashMap<String, Vec<u32>>,
    /// Remote path -> (file name, digest)
    pub pushed: HashMap<String, (String, String)>,
    /// Session id -> (file name, digest, staged remote path)
    sessions: HashMap<u32, Vec<(String, String, String)>>,
    next_session: u32,
    /// Completed installs (session commits and delta installs)
    pub installs: usize,
    pub swaps: Vec<SwapRequest>,
    pub requests: Vec<(Opcode, Value)>,
    pub shell_log: Vec<String>,
    pub started_activities: Vec<String>,
    pub install_failure: Option<String>,
    /// Installs of these packages always fail with the given reason
    pub package_failures: HashMap<String, String>,
    pub swap_failure: Option<String>,
    /// Pushes fail with this message
    pub push_failure: Option<String>,
}

/// Package a staged APK belongs to, from `<staging>/<package>/<file>`
fn package_of_remote(remote: &str) -> Option<String> {
    remote.rsplit('/').nth(1).map(str::to_string)
}

fn handle_installer(state: &Mutex<FakeDeviceState>, opcode: Opcode, body: &Value) -> FakeReply {
    let Ok(mut state) = state.lock() else {
        return FakeReply::Error("state poisoned".to_string());
    };
    state.requests.push((opcode, body.clone()));

    let package = body
        .get("package")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match opcode {
        Opcode::Handshake => FakeReply::Ok(json!({ "version": INSTALLER_VERSION })),
        Opcode::Dump => {
            let apks = state.installed.get(&package).cloned();
            let pids = state.running.get(&package).cloned().unwrap_or_default();
            FakeReply::Ok(json!({
                "installed": apks.is_some(),
                "apks": apks.unwrap_or_default(),
                "pids": pids,
            }))
        }
        Opcode::DeltaInstall => {
            let Ok(request) = serde_json::from_value::<DeltaInstallRequest>(body.clone()) else {
                return FakeReply::Error("bad delta install request".to_string());
            };
            let failure = state
                .install_failure
                .take()
                .or_else(|| state.package_failures.get(&package).cloned());
            if let Some(reason) = failure {
                return FakeReply::Error(reason);
            }
            let current = state.installed.get(&package).cloned().unwrap_or_default();
            let mut next = Vec::new();
            for apk in request.apks {
                let digest = match apk.source {
                    DeltaSource::Installed => current
                        .iter()
                        .find(|a| a.name == apk.name)
                        .map(|a| a.digest.clone()),
                    DeltaSource::Pushed { remote_path } => {
                        state.pushed.get(&remote_path).map(|(_, d)| d.clone())
                    }
                };
                let Some(digest) = digest else {
                    return FakeReply::Error(format!("no source for {}", apk.name));
                };
                next.push(InstalledApk {
                    name: apk.name,
                    digest,
                });
            }
            state.installed.insert(package, next);
            state.installs += 1;
            FakeReply::Ok(json!({}))
        }
        Opcode::Swap => {
            let Ok(request) = serde_json::from_value::<SwapRequest>(body.clone()) else {
                return FakeReply::Error("bad swap request".to_string());
            };
            if let Some(reason) = state.swap_failure.clone() {
                return FakeReply::Error(reason);
            }
            // the swap also persists the staged APKs
            for remote in &request.staged_apks {
                if let Some((name, digest)) = state.pushed.get(remote).cloned() {
                    if let Some(apks) = state.installed.get_mut(&package) {
                        if let Some(apk) = apks.iter_mut().find(|a| a.name == name) {
                            apk.digest = digest;
                        }
                    }
                }
            }
            let swapped: Vec<u32> = state
                .running
                .get(&package)
                .map(|pids| {
                    pids.iter()
                        .copied()
                        .filter(|p| !request.skip_pids.contains(p))
                        .collect()
                })
                .unwrap_or_default();
            state.swaps.push(request);
            FakeReply::Ok(json!({ "swapped_pids": swapped }))
        }
        Opcode::Shutdown => FakeReply::Ok(json!({})),
    }
}

/// A simulated device implementing [`DeviceTransport`]. Clones share state.
#[derive(Clone)]
pub struct FakeDevice {
    info: DeviceInfo,
    state: Arc<Mutex<FakeDeviceState>>,
    installer: FakeInstaller,
}

impl FakeDevice {
    pub fn new(serial: &str, api_level: u32) -> Self {
        Self::with_info(test_device_info(serial, api_level))
    }

    pub fn with_info(info: DeviceInfo) -> Self {
        let state = Arc::new(Mutex::new(FakeDeviceState::default()));
        let handler_state = Arc::clone(&state);
        let installer = FakeInstaller::new(move |opcode, body| {
            handle_installer(&handler_state, opcode, body)
        });
        Self {
            info,
            state,
            installer,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> MutexGuard<'_, FakeDeviceState> {
        self.state.lock().expect("fake device state")
    }

    pub fn installs(&self) -> usize {
        self.state().installs
    }

    pub fn pushes(&self) -> Vec<String> {
        self.shell_log_filtered("push ")
    }

    pub fn shell_log(&self) -> Vec<String> {
        self.state()
            .shell_log
            .iter()
            .filter(|c| !c.starts_with("push "))
            .cloned()
            .collect()
    }

    fn shell_log_filtered(&self, prefix: &str) -> Vec<String> {
        self.state()
            .shell_log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn swaps(&self) -> Vec<SwapRequest> {
        self.state().swaps.clone()
    }

    pub fn requests(&self) -> Vec<(Opcode, Value)> {
        self.state().requests.clone()
    }

    pub fn request_count(&self, opcode: Opcode) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|(op, _)| *op == opcode)
            .count()
    }

    pub fn started_activities(&self) -> Vec<String> {
        self.state().started_activities.clone()
    }

    pub fn set_running(&self, package: &str, pids: &[u32]) {
        self.state()
            .running
            .insert(package.to_string(), pids.to_vec());
    }

    pub fn uninstall(&self, package: &str) {
        let mut state = self.state();
        state.installed.remove(package);
        state.running.remove(package);
    }

    pub fn fail_next_install(&self, reason: &str) {
        self.state().install_failure = Some(reason.to_string());
    }

    /// Make every install of `package` fail with `reason`
    pub fn fail_installs_of(&self, package: &str, reason: &str) {
        self.state()
            .package_failures
            .insert(package.to_string(), reason.to_string());
    }

    pub fn fail_swaps(&self, reason: &str) {
        self.state().swap_failure = Some(reason.to_string());
    }

    pub fn fail_pushes(&self, reason: &str) {
        self.state().push_failure = Some(reason.to_string());
    }

    fn getprop(&self) -> String {
        let mut out = String::new();
        if let Some(api) = self.info.api_level {
            out.push_str(&format!("[ro.build.version.sdk]: [{}]\n", api));
        }
        if let Some(fp) = &self.info.fingerprint {
            out.push_str(&format!("[ro.build.fingerprint]: [{}]\n", fp));
        }
        if let Some(model) = &self.info.model {
            out.push_str(&format!("[ro.product.model]: [{}]\n", model));
        }
        if let Some(abi) = &self.info.abi {
            out.push_str(&format!("[ro.product.cpu.abi]: [{}]\n", abi));
        }
        out.push_str(&format!(
            "[ro.build.characteristics]: [{}]\n",
            self.info.characteristics.join(",")
        ));
        out
    }

    fn pm(&self, args: &[&str]) -> ShellOutput {
        let mut state = self.state();
        match args {
            ["install-create", ..] => {
                state.next_session += 1;
                let id = state.next_session;
                state.sessions.insert(id, Vec::new());
                ShellOutput::ok(format!("Success: created install session [{}]\n", id))
            }
            ["install-write", "-S", _size, session, name, remote] => {
                let Some(id) = session.parse::<u32>().ok() else {
                    return ShellOutput::failed(1, "Error: invalid session");
                };
                let Some((_, digest)) = state.pushed.get(*remote).cloned() else {
                    return ShellOutput::failed(1, format!("Error: {} not found", remote));
                };
                match state.sessions.get_mut(&id) {
                    Some(session) => {
                        session.push((name.to_string(), digest, remote.to_string()));
                        ShellOutput::ok(format!("Success: streamed into {}\n", name))
                    }
                    None => ShellOutput::failed(1, "Error: unknown session"),
                }
            }
            ["install-commit", session] => {
                let id = session.parse::<u32>().unwrap_or_default();
                let Some(apks) = state.sessions.remove(&id) else {
                    return ShellOutput::failed(1, "Error: unknown session");
                };
                let package = apks
                    .first()
                    .and_then(|(_, _, remote)| package_of_remote(remote))
                    .unwrap_or_default();
                let failure = state
                    .install_failure
                    .take()
                    .or_else(|| state.package_failures.get(&package).cloned());
                if let Some(reason) = failure {
                    return ShellOutput {
                        stdout: format!("Failure [{}]\n", reason),
                        stderr: String::new(),
                        exit_code: Some(1),
                    };
                }
                let installed = apks
                    .into_iter()
                    .map(|(name, digest, _)| InstalledApk { name, digest })
                    .collect();
                state.installed.insert(package, installed);
                state.installs += 1;
                ShellOutput::ok("Success\n")
            }
            ["install-abandon", _] => ShellOutput::ok("Success\n"),
            _ => ShellOutput::ok(""),
        }
    }
}

impl DeviceTransport for FakeDevice {
    fn serial(&self) -> &str {
        &self.info.serial
    }

    async fn shell(&self, args: &[&str]) -> Result<ShellOutput> {
        let command = args.join(" ");
        self.state().shell_log.push(command.clone());

        let output = match args {
            ["getprop"] => ShellOutput::ok(self.getprop()),
            ["pm", rest @ ..] => self.pm(rest),
            ["am", "start", ..] | ["monkey", ..] => {
                self.state().started_activities.push(command);
                ShellOutput::ok("Starting: Intent { cmp=com.example/.MainActivity }\n")
            }
            [binary, "-version"] if binary.ends_with("/installer") => {
                ShellOutput::ok(INSTALLER_VERSION)
            }
            _ => ShellOutput::ok(""),
        };
        Ok(output)
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        let bytes = std::fs::read(local)?;
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut state = self.state();
        if let Some(reason) = state.push_failure.clone() {
            return Err(Error::disconnected(reason));
        }
        state.shell_log.push(format!("push {} {}", local.display(), remote));
        state
            .pushed
            .insert(remote.to_string(), (name, sha256_hex(&bytes)));
        Ok(())
    }

    async fn open_stream(&self, _args: &[&str]) -> Result<DeviceStream> {
        Ok(self.installer.spawn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uleb128_encoding() {
        let mut out = Vec::new();
        put_uleb128(&mut out, 624485);
        assert_eq!(out, vec![0xe5, 0x8e, 0x26]);
    }

    #[test]
    fn test_package_of_remote() {
        assert_eq!(
            package_of_remote("/data/local/tmp/.droidswap/com.example/base.apk").as_deref(),
            Some("com.example")
        );
    }

    #[tokio::test]
    async fn test_fake_device_pm_session() {
        let dir = tempfile::tempdir().unwrap();
        let apk = ApkBuilder::new().write(dir.path(), "base.apk");
        let device = FakeDevice::new("emulator-5554", 30);
        let remote = "/data/local/tmp/.droidswap/com.example/base.apk";

        device.push(&apk, remote).await.unwrap();
        let created = device.shell(&["pm", "install-create", "-r"]).await.unwrap();
        assert!(created.stdout.contains("[1]"));
        device
            .shell(&["pm", "install-write", "-S", "10", "1", "base.apk", remote])
            .await
            .unwrap();
        let commit = device.shell(&["pm", "install-commit", "1"]).await.unwrap();
        assert!(commit.success());

        assert_eq!(device.installs(), 1);
        assert!(device.state().installed.contains_key("com.example"));
    }
}
