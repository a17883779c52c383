//! End-to-end runs against a simulated device

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use droidswap::{execute, RunKind, RunRequest};
use droidswap_core::{LaunchEvent, NotificationKind, Package, ResolutionAction};
use droidswap_deployer::test_utils::{ApkBuilder, DexBuilder, FakeDevice};
use droidswap_deployer::DexArchiveDatabase;
use droidswap_device::{InstallerConfig, Opcode};
use droidswap_launch::{DeviceSession, LaunchStatus, Settings};

fn write_apk(dir: &Path, version: u16, strings: &[u8]) -> PathBuf {
    let sub = dir.join(format!("build-{}-{}", version, strings.len()));
    std::fs::create_dir_all(&sub).unwrap();
    ApkBuilder::new()
        .manifest(b"<manifest package=\"com.example\"/>")
        .dex(
            "classes.dex",
            DexBuilder::new()
                .class("Lcom/example/MainActivity;", &[&[0x0e00]])
                .class("Lcom/example/Greeter;", &[&[version, 0x0e00]]),
        )
        .resource("res/values/strings.xml", strings)
        .write(&sub, "app-debug.apk")
}

struct Harness {
    device: FakeDevice,
    session: DeviceSession<FakeDevice>,
    database: DexArchiveDatabase,
    settings: Settings,
}

impl Harness {
    fn new(api: u32) -> Self {
        let device = FakeDevice::new("emulator-5554", api);
        let session = DeviceSession::new(
            device.clone(),
            device.info().clone(),
            InstallerConfig::default(),
        );
        Self {
            device,
            session,
            database: DexArchiveDatabase::in_memory(),
            settings: Settings::default(),
        }
    }

    async fn run(
        &mut self,
        kind: RunKind,
        apk: PathBuf,
        fallback: bool,
    ) -> (droidswap_launch::LaunchStats, Vec<LaunchEvent>) {
        let request = RunRequest {
            kind,
            packages: vec![Package::new("com.example", vec![apk])],
            activity: Some(".MainActivity".to_string()),
            fallback,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stats = execute(
            &mut self.session,
            self.database.clone(),
            &self.settings,
            &request,
            LaunchStatus::new(),
            tx,
        )
        .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (stats, events)
    }
}

fn notifications(events: &[LaunchEvent]) -> Vec<(NotificationKind, String, Option<ResolutionAction>)> {
    events
        .iter()
        .filter_map(|e| match e {
            LaunchEvent::Notification {
                kind,
                text,
                resolution,
                ..
            } => Some((*kind, text.clone(), *resolution)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_run_installs_monitors_and_launches() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(34);

    let (stats, events) = harness
        .run(RunKind::Run, write_apk(dir.path(), 1, b"hello"), false)
        .await;

    assert!(stats.success);
    assert_eq!(
        stats.tasks,
        vec!["DEPLOY", "LIVE_UPDATE_MONITORING", "LAUNCH_ACTIVITY"]
    );
    assert_eq!(harness.device.installs(), 1);
    assert_eq!(harness.device.started_activities().len(), 1);
    assert!(events.contains(&LaunchEvent::stdout(
        "Live update monitoring started for com.example on Pixel 7 (emulator-5554)"
    )));

    harness.session.close().await;
    assert_eq!(harness.device.request_count(Opcode::Shutdown), 1);
}

#[tokio::test]
async fn test_unchanged_rerun_skips_install() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(34);
    let apk = write_apk(dir.path(), 1, b"hello");

    let (first, _) = harness.run(RunKind::Install, apk.clone(), false).await;
    assert!(first.success);

    let (second, events) = harness.run(RunKind::Install, apk, false).await;
    assert!(second.success);
    assert_eq!(harness.device.installs(), 1);

    let notes = notifications(&events);
    assert_eq!(notes.len(), 1);
    assert!(notes[0]
        .1
        .contains("Changes were not detected for com.example, the install was skipped."));
}

#[tokio::test]
async fn test_code_change_is_swapped_into_running_app() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(34);

    let (installed, _) = harness
        .run(RunKind::Install, write_apk(dir.path(), 1, b"hello"), false)
        .await;
    assert!(installed.success);
    harness.device.set_running("com.example", &[1234]);

    let (stats, _) = harness
        .run(
            RunKind::ApplyCodeChanges,
            write_apk(dir.path(), 2, b"hello"),
            false,
        )
        .await;

    assert!(stats.success, "{:?}", stats);
    let swaps = harness.device.swaps();
    assert_eq!(swaps.len(), 1);
    assert_eq!(swaps[0].classes, vec!["Lcom/example/Greeter;"]);
    assert!(stats
        .details
        .iter()
        .any(|d| d.id == "APPLY_CODE_CHANGES.SWAP"));
}

#[tokio::test]
async fn test_resource_change_without_fallback_offers_apply_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(34);

    harness
        .run(RunKind::Install, write_apk(dir.path(), 1, b"hello"), false)
        .await;
    harness.device.set_running("com.example", &[1234]);

    let (stats, events) = harness
        .run(
            RunKind::ApplyCodeChanges,
            write_apk(dir.path(), 2, b"hello, world"),
            false,
        )
        .await;

    assert!(!stats.success);
    assert_eq!(
        stats.error_id.as_deref(),
        Some("RESOURCE_MODIFICATION_NOT_ALLOWED")
    );
    assert!(harness.device.swaps().is_empty());

    let notes = notifications(&events);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].0, NotificationKind::Error);
    assert_eq!(notes[0].2, Some(ResolutionAction::ApplyChanges));
}

#[tokio::test]
async fn test_fallback_applies_changes_after_resource_change() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(34);

    harness
        .run(RunKind::Install, write_apk(dir.path(), 1, b"hello"), false)
        .await;
    harness.device.set_running("com.example", &[1234]);

    let (stats, events) = harness
        .run(
            RunKind::ApplyCodeChanges,
            write_apk(dir.path(), 2, b"hello, world"),
            true,
        )
        .await;

    assert!(stats.success, "{:?}", stats);
    assert_eq!(stats.tasks, vec!["UNIFIED_DEPLOY"]);
    assert_eq!(harness.device.swaps().len(), 1);
    assert!(events.contains(&LaunchEvent::stdout("Falling back to Apply Changes.")));
}

#[tokio::test]
async fn test_fallback_reruns_app_when_nothing_was_installed() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(34);

    let (stats, _) = harness
        .run(
            RunKind::ApplyChanges,
            write_apk(dir.path(), 1, b"hello"),
            true,
        )
        .await;

    assert!(stats.success, "{:?}", stats);
    assert_eq!(harness.device.installs(), 1);
    assert_eq!(harness.device.started_activities().len(), 1);
}

#[tokio::test]
async fn test_swap_unsupported_before_api_26() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(25);

    let (stats, events) = harness
        .run(
            RunKind::ApplyChanges,
            write_apk(dir.path(), 1, b"hello"),
            true,
        )
        .await;

    assert!(!stats.success);
    assert_eq!(stats.error_id.as_deref(), Some("OPERATION_NOT_SUPPORTED"));
    assert!(harness.device.requests().is_empty());

    let notes = notifications(&events);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].2, None);
}
