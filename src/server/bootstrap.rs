use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen: Option<String>,
}

/// Gateway lifecycle: tracing → config → state → listeners → signals.
///
/// Fatal only at the edges: a config that fails to load at startup and a
/// listener that fails to bind both propagate out of here (and exit
/// non-zero). Everything after that point degrades without exiting.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&args.config_path)?;
    let metrics = Metrics::install();

    let listen = args
        .listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.server.port));
    let dashboard = config.dashboard.clone();

    let state = GatewayState::new(config, metrics)?;
    let shutdown = Arc::new(Notify::new());

    if dashboard.enable {
        start_admin_server(&state, dashboard.port);
    }
    start_reload_listener(&state, args.config_path.clone(), &shutdown);

    tracing::info!("server: starting gateway, listen={}", listen);

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer guard must outlive the process.
    std::mem::forget(guard);
}

fn start_admin_server(state: &GatewayState, port: u16) {
    let state = state.clone();
    let listen = format!("0.0.0.0:{}", port);
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, state).await {
            tracing::error!("server: dashboard failed, error={}", e);
        }
    });
}

/// SIGHUP triggers an atomic reload. In-flight requests keep the previous
/// router; a failing reload is abandoned inside `GatewayState::reload`.
#[cfg(unix)]
fn start_reload_listener(state: &GatewayState, config_path: PathBuf, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!("server: cannot install SIGHUP handler: {}", e);
                    return;
                }
            };

        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                    tracing::info!("server: received SIGHUP, reloading config");
                    state.reload(&config_path);
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

#[cfg(not(unix))]
fn start_reload_listener(_state: &GatewayState, _config_path: PathBuf, _shutdown: &Arc<Notify>) {}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
