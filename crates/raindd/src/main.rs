//! raindd entry point.

use std::future::IntoFuture;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use raind::{HostSeams, Platform};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use raindd::api::AppState;
use raindd::api::server;
use raindd::api::tls::{self, HookListener, HookPeer};
use raindd::cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    raindd::logging::init(args.log_format)?;

    let config = args.runtime_config();
    let seams = HostSeams::host(&config);
    let platform = Arc::new(Platform::new(config, seams)?);
    platform.bootstrap().await?;

    let cancel = CancellationToken::new();
    let loops = platform.spawn_background(&cancel);
    let state = AppState::new(platform.clone());

    let api_listener = TcpListener::bind(args.listen).await?;
    let hook_tls = tls::server_config(&platform.pki, platform.config.hook_listen)?;
    let hook_listener = HookListener::new(
        TcpListener::bind(platform.config.hook_listen).await?,
        hook_tls,
    )?;
    tracing::info!(api = %args.listen, hooks = %hook_listener.bound_addr(), "raindd listening");

    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let api = axum::serve(api_listener, server::app(state.clone()))
        .with_graceful_shutdown(stopped(cancel.clone()))
        .into_future();
    let hook_app = server::hook_app(state).into_make_service_with_connect_info::<HookPeer>();
    let hooks = axum::serve(hook_listener, hook_app)
        .with_graceful_shutdown(stopped(cancel.clone()))
        .into_future();
    let (api, hooks) = tokio::join!(api, hooks);
    cancel.cancel();
    for handle in loops {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "Background loop ended abnormally");
        }
    }
    api?;
    hooks?;
    tracing::info!("raindd stopped");
    Ok(())
}

async fn stopped(cancel: CancellationToken) {
    cancel.cancelled().await;
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(err), _) | (_, Err(err)) => {
            tracing::error!(error = %err, "Failed to install signal handlers");
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
    }
    cancel.cancel();
}
