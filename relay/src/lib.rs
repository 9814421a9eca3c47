pub mod api;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod upstream;

#[cfg(test)]
mod testutils;

use config::{Config, ConfigError, PROFILE_API_KEY_VAR, STREAM_API_KEY_VAR};
use errors::RelayError;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use upstream::AmperityClient;

/// Serves the relay and its admin listener until shutdown or the first listener failure.
pub async fn run(config: Config) -> Result<(), RelayError> {
    config.validate().map_err(ConfigError::from)?;

    if config.credentials.stream_api_key.is_none() {
        tracing::warn!("{STREAM_API_KEY_VAR} is not set, events will be sent unauthenticated");
    }
    if config.credentials.profile_api_key.is_none() {
        tracing::warn!("{PROFILE_API_KEY_VAR} is not set, lookups will be sent unauthenticated");
    }

    let client = AmperityClient::new(&config.upstream, config.credentials.clone())?;
    let app = api::router(client, config.max_body_bytes);

    let addr = format!("{}:{}", config.listener.host, config.listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, upstream = %config.upstream.base_url, "relay listening");

    let ready = Arc::new(AtomicBool::new(true));
    let is_ready = ready.clone();
    let admin_service = AdminService::<_, RelayError>::new(move || is_ready.load(Ordering::Relaxed));
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let relay_task = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                ready.store(false, Ordering::Relaxed);
                tracing::info!("shutting down, draining in-flight requests");
            })
            .await
            .map_err(RelayError::from)
    };

    tokio::select! {
        res = relay_task => res,
        res = admin_task => res,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
