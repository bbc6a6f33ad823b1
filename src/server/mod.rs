pub mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::GatewayState;

use crate::proxy;
use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the proxy listener with graceful shutdown.
///
/// Once `shutdown` is notified the accept loop stops — new connections are
/// refused — and in-flight connections get up to `DRAIN_TIMEOUT` to finish.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(conn) => {
                metrics::counter!("gateway_connections_total", "status" => "accepted")
                    .increment(1);
                conn
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("gateway_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let conn_state = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = conn_state.clone();
                async move { Ok::<_, hyper::Error>(serve_request(req, state, peer_addr).await) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: proxy: connection error, peer={}, error={}", peer_addr, e);
                }
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    drain(&active_conns).await;
    Ok(())
}

/// One request through the pipeline, bounded by the configured server
/// deadline when one is set.
async fn serve_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> hyper::Response<proxy::BoxBody> {
    let req = req.map(BodyExt::boxed);
    let deadline_secs = state.config.load().server.timeout;

    if deadline_secs == 0 {
        return proxy::handle_request(req, state, peer_addr).await;
    }

    let deadline = Duration::from_secs(deadline_secs);
    match tokio::time::timeout(deadline, proxy::handle_request(req, state, peer_addr)).await {
        Ok(resp) => resp,
        Err(_) => {
            error!("server: request exceeded server deadline, peer={}", peer_addr);
            crate::proxy::context::error_response(
                http::StatusCode::GATEWAY_TIMEOUT,
                crate::error::ERROR_CODE_INTERNAL,
                "gateway timeout",
                "",
            )
        }
    }
}

async fn drain(active_conns: &Arc<AtomicI64>) {
    let active = active_conns.load(Ordering::Relaxed);
    if active == 0 {
        return;
    }

    info!("server: proxy: waiting for {} active connections to drain", active);
    let wait = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    match tokio::time::timeout(DRAIN_TIMEOUT, wait).await {
        Ok(_) => info!("server: proxy: all connections drained"),
        Err(_) => info!(
            "server: proxy: drain timeout ({}s), {} connections still active",
            DRAIN_TIMEOUT.as_secs(),
            active_conns.load(Ordering::Relaxed)
        ),
    }
}

/// Run the dashboard/admin listener (health, metrics, active config).
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: dashboard listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: dashboard: connection error, error={}", e);
                }
            }
        });
    }
}
