//! droidswap - incremental APK deploys and live code swap for Android
//!
//! This is the binary entry point. Deploy logic lives in the workspace crates.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use tokio::sync::mpsc;
use tracing::{info, warn};

use droidswap::headless::{emit_launch_event, HeadlessEvent};
use droidswap::runner::resolve_packages;
use droidswap::{execute, PackageArg, RunKind, RunRequest};
use droidswap_core::{ConsoleStream, LaunchEvent, NotificationKind};
use droidswap_deployer::DexArchiveDatabase;
use droidswap_device::{
    discover_devices, locate_adb, read_device_properties, select_device, AdbTransport,
};
use droidswap_launch::{init_config_dir, load_settings, DeviceSession, LaunchStatus};

/// droidswap - incremental APK deploys and live code swap for Android
#[derive(Parser, Debug)]
#[command(name = "droidswap")]
#[command(about = "Incremental APK deploys and live code swap for Android", long_about = None)]
struct Cli {
    /// Project directory holding .droidswap/ (default: current directory)
    #[arg(long, global = true, value_name = "PATH")]
    project: Option<PathBuf>,

    /// Device to use: serial, model or fingerprint
    #[arg(long, short, global = true)]
    serial: Option<String>,

    /// Print NDJSON events instead of text
    #[arg(long, global = true)]
    headless: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected devices
    Devices,
    /// Write a default .droidswap/config.toml
    Init,
    /// Install packages, skipping unchanged ones
    Install(DeployArgs),
    /// Swap changed classes into the running app
    ApplyCodeChanges(DeployArgs),
    /// Swap changed classes and resources into the running app
    ApplyChanges(DeployArgs),
    /// Install and launch the app
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct DeployArgs {
    /// Package as APP_ID=APK[,APK...]; repeat for more packages
    #[arg(short, long = "package", value_name = "APP_ID=APKS", required = true)]
    packages: Vec<PackageArg>,

    /// Apply the suggested fix automatically when the deploy fails
    #[arg(long)]
    fallback: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    deploy: DeployArgs,

    /// Activity to start, e.g. `.MainActivity` (default: launcher activity)
    #[arg(long)]
    activity: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    if let Err(e) = droidswap_core::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let headless = cli.headless;
    let result = dispatch(cli).await;
    if headless {
        if let Err(e) = &result {
            HeadlessEvent::error(format!("{:#}", e), true).emit();
        }
    }
    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    let project = match cli.project {
        Some(path) => path,
        None => std::env::current_dir().wrap_err("Cannot determine the current directory")?,
    };
    let serial = cli.serial.as_deref();

    match cli.command {
        Command::Devices => list_devices(serial, cli.headless).await,
        Command::Init => {
            init_config_dir(&project)?;
            eprintln!("✅ Config written to {}", project.join(".droidswap").display());
            Ok(())
        }
        Command::Install(args) => {
            deploy(RunKind::Install, args, None, &project, serial, cli.headless).await
        }
        Command::ApplyCodeChanges(args) => {
            deploy(RunKind::ApplyCodeChanges, args, None, &project, serial, cli.headless).await
        }
        Command::ApplyChanges(args) => {
            deploy(RunKind::ApplyChanges, args, None, &project, serial, cli.headless).await
        }
        Command::Run(args) => {
            deploy(
                RunKind::Run,
                args.deploy,
                args.activity,
                &project,
                serial,
                cli.headless,
            )
            .await
        }
    }
}

async fn list_devices(serial: Option<&str>, headless: bool) -> Result<()> {
    let adb = locate_adb(None)?;
    let devices = discover_devices(&adb).await?;
    let devices: Vec<_> = devices
        .into_iter()
        .filter(|d| serial.map_or(true, |s| d.matches(s)))
        .collect();

    if devices.is_empty() && !headless {
        eprintln!("No devices found.");
    }

    for device in &devices {
        if headless {
            HeadlessEvent::device_detected(device).emit();
        } else {
            let api = device
                .api_level
                .map(|api| format!("API {}", api))
                .unwrap_or_default();
            println!(
                "{:<24} {:<14} {:<8} {}",
                device.serial,
                format!("{:?}", device.state).to_lowercase(),
                api,
                device.display_name()
            );
        }
    }
    Ok(())
}

async fn deploy(
    kind: RunKind,
    args: DeployArgs,
    activity: Option<String>,
    project: &Path,
    serial: Option<&str>,
    headless: bool,
) -> Result<()> {
    info!("droidswap {} in {}", kind, project.display());
    let settings = load_settings(project);

    let adb = locate_adb(None)?;
    let devices = discover_devices(&adb).await?;
    let mut device = select_device(&devices, serial)?;
    let transport = AdbTransport::new(adb.clone(), device.serial.clone());
    read_device_properties(&transport, &mut device)
        .await
        .wrap_err_with(|| format!("Cannot read properties of {}", device.serial))?;

    let database = match settings.database_path(project) {
        Some(path) => DexArchiveDatabase::open(&path).unwrap_or_else(|e| {
            warn!("Failed to open {:?}, starting empty: {}", path, e);
            DexArchiveDatabase::in_memory()
        }),
        None => DexArchiveDatabase::in_memory(),
    };

    let packages = args.packages.into_iter().map(|p| p.0).collect();
    let request = RunRequest {
        kind,
        packages: resolve_packages(project, packages),
        activity,
        fallback: args.fallback,
    };

    let installer_config = settings.installer_config(project);
    let mut session = DeviceSession::new(transport, device, installer_config);

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx, headless));

    let status = LaunchStatus::new();
    let cancel = status.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling launch");
            cancel.cancel();
        }
    });

    let stats = execute(&mut session, database, &settings, &request, status, tx).await;
    session.close().await;
    if let Err(e) = printer.await {
        warn!("Event printer stopped: {}", e);
    }

    if headless {
        HeadlessEvent::launch_finished(&stats).emit();
    }
    if !stats.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<LaunchEvent>, headless: bool) {
    while let Some(event) = rx.recv().await {
        if headless {
            emit_launch_event(&event);
            continue;
        }

        match event {
            LaunchEvent::TaskStarted { description, .. } => eprintln!("▶ {}", description),
            LaunchEvent::Console {
                stream: ConsoleStream::Stdout,
                text,
            } => println!("{}", text),
            LaunchEvent::Console {
                stream: ConsoleStream::Stderr,
                text,
            } => eprintln!("{}", text),
            LaunchEvent::Notification {
                kind: NotificationKind::Info,
                text,
                ..
            } => eprintln!("✅ {}", text),
            LaunchEvent::Notification {
                kind: NotificationKind::Error,
                text,
                ..
            } => eprintln!("❌ {}", text),
            LaunchEvent::Progress { .. } | LaunchEvent::TaskFinished { .. } => {}
        }
    }
}
