use crate::bridge::AccessoryPublisher;
use crate::child::{run_child, signal_name};
use crate::config::HostOptions;
use crate::env::StoragePaths;
use crate::logging;
use crate::plugin::PluginModule;
use crate::server::HostServer;
use crate::supervisor::{ProcessSpawner, SHUTDOWN_GRACE};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hanna")]
#[command(version)]
#[command(about = "Smart-home accessory host with isolated child bridges", long_about = None)]
pub struct Cli {
    /// Force color in logging
    #[arg(short = 'C', long = "color", global = true)]
    pub color: bool,

    /// Turn on debug level logging
    #[arg(short = 'D', long, global = true)]
    pub debug: bool,

    /// Allow unauthenticated requests (for easier hacking)
    #[arg(short = 'I', long, global = true)]
    pub insecure: bool,

    /// Look for plugins installed at this path as well as the default locations
    #[arg(short = 'P', long = "plugin-path", global = true)]
    pub plugin_path: Option<PathBuf>,

    /// Do not issue QR code in the logs
    #[arg(short = 'Q', long = "no-qrcode", global = true)]
    pub no_qrcode: bool,

    /// Keep cached accessories for which the associated plugin is not loaded
    #[arg(short = 'K', long = "keep-orphans", global = true)]
    pub keep_orphans: bool,

    /// Do not issue timestamps in logging
    #[arg(short = 'T', long = "no-timestamp", global = true)]
    pub no_timestamp: bool,

    /// Look for Hanna user files at this path instead of the default location (~/.hanna)
    #[arg(short = 'U', long = "user-storage-path", global = true)]
    pub user_storage_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run as a child bridge process (spawned by the host)
    #[command(name = "child-bridge", hide = true)]
    ChildBridge,
}

impl Cli {
    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            keep_orphaned_cached_accessories: self.keep_orphans,
            hide_qr_code: self.no_qrcode,
            insecure_access: self.insecure,
            custom_plugin_path: self.plugin_path.clone(),
            no_log_timestamps: self.no_timestamp,
            debug_mode_enabled: self.debug,
            force_colour_logging: self.color,
            custom_storage_path: self.user_storage_path.clone(),
        }
    }
}

#[cfg(unix)]
pub async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => tokio::select! {
            _ = sigterm.recv() => libc::SIGTERM,
            _ = sigint.recv() => libc::SIGINT,
        },
        _ => {
            warn!("Failed to install signal handlers");
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    2
}

/// Run the host or, with the hidden subcommand, a child bridge. Returns the
/// process exit code.
pub async fn run(
    cli: Cli,
    modules: Vec<Arc<dyn PluginModule>>,
    publisher: Arc<dyn AccessoryPublisher>,
) -> anyhow::Result<i32> {
    let options = cli.host_options();
    logging::init(&options);

    match cli.command {
        Some(Command::ChildBridge) => Ok(run_child(
            tokio::io::stdin(),
            tokio::io::stdout(),
            modules,
            publisher,
            wait_for_signal(),
        )
        .await),
        None => run_host(options, modules, publisher).await,
    }
}

async fn run_host(
    options: HostOptions,
    modules: Vec<Arc<dyn PluginModule>>,
    publisher: Arc<dyn AccessoryPublisher>,
) -> anyhow::Result<i32> {
    let paths = StoragePaths::resolve(options.custom_storage_path.as_deref());
    let spawner = Arc::new(ProcessSpawner::current()?);
    let server = Arc::new(HostServer::new(options, paths, modules, publisher, spawner)?);

    let signal = wait_for_signal();
    tokio::pin!(signal);
    let signal = tokio::select! {
        started = server.start() => {
            started?;
            (&mut signal).await
        }
        signal = &mut signal => signal,
    };

    info!("Got {}, shutting down Hanna...", signal_name(signal));
    if tokio::time::timeout(SHUTDOWN_GRACE, server.teardown())
        .await
        .is_err()
    {
        warn!(
            "Shutdown did not finish within {} seconds, exiting anyway",
            SHUTDOWN_GRACE.as_secs()
        );
    }
    Ok(128 + signal)
}
