use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use winit::event_loop::{ControlFlow, EventLoop};

use mixer::app::{AppEvent, MixerApp, ProxySink};
use mixer::config::Config;
use mixer::ipc_server::{IpcServer, SharedStatus};
use mixer::OperatorSettings;

#[derive(Parser)]
#[command(name = "vmixd")]
#[command(about = "Live video mixing daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.config/vmix/config.toml)
    #[arg(short, long, env = "VMIX_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// IPC socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    let log_level = cli.log_level.clone().unwrap_or_else(|| {
        config
            .as_ref()
            .map(|c| c.general.log_level.clone())
            .unwrap_or_else(|_| "info".to_string())
    });
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("Starting vmix daemon v{}", env!("CARGO_PKG_VERSION"));
    let config = config?;

    log::info!("✓ Configuration loaded");
    log::info!("  - Outputs: {}", config.general.outputs);
    log::info!(
        "  - Fade: {}ms ({})",
        config.general.fade_time_ms,
        config.general.fade_curve
    );
    log::info!(
        "  - Pool: {} video, {} capture, {} procedural",
        config.pool.video,
        config.pool.capture,
        config.pool.procedural
    );
    log::info!("  - Media slots: {}", config.slot.len());

    let settings = OperatorSettings::from_config(&config)?;

    #[cfg(feature = "video")]
    if let Err(e) = mixer::media::initialize_gstreamer() {
        log::error!("GStreamer unavailable, file and capture slots will fail: {}", e);
    }

    let event_loop = EventLoop::<AppEvent>::with_user_event()
        .build()
        .context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let status: SharedStatus = Arc::new(RwLock::new(Default::default()));
    let should_exit = Arc::new(AtomicBool::new(false));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("vmix-ipc")
        .build()
        .context("Failed to start async runtime")?;

    // IPC server
    let socket_path = cli.socket.unwrap_or_else(common::get_socket_path);
    let server = IpcServer::new(
        socket_path,
        Arc::clone(&status),
        Arc::new(ProxySink::new(event_loop.create_proxy())),
        Arc::clone(&should_exit),
    );
    let ipc_handle = runtime.spawn(async move {
        if let Err(e) = server.run().await {
            log::error!("IPC server error: {}", e);
        }
    });

    // Signal handlers
    let signal_proxy = event_loop.create_proxy();
    runtime.spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Failed to set up signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }

        if signal_proxy.send_event(AppEvent::Shutdown).is_err() {
            log::warn!("Event loop already closed");
        }
    });

    let mut app = MixerApp::new(config, settings, status, Arc::clone(&should_exit));
    let result = event_loop.run_app(&mut app);

    should_exit.store(true, Ordering::Release);
    // Let the accept loop notice the flag and remove the socket
    if let Err(e) = runtime.block_on(ipc_handle) {
        log::warn!("IPC task ended abnormally: {}", e);
    }
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    log::info!("Daemon shutting down");
    result.context("Event loop failed")
}
