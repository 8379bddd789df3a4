// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ssebroker: a horizontally-scalable server-sent-events broker backed by
//! Redis for cross-instance routing and shared state.

pub mod auth;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod model;
pub mod redis_store;
pub mod state;
pub mod transport;
pub mod user;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::instance::Instance;
use crate::model::InstanceAddress;
use crate::redis_store::RedisStore;
use crate::state::AppState;
use crate::transport::build_router;

/// Run the broker until shutdown: connect to the bus, reconcile and
/// register this instance, serve HTTP until a shutdown signal, then drain
/// every live connection before deregistering.
pub async fn run(config: BrokerConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let instance_address = InstanceAddress::from(config.resolved_instance_address());
    let shutdown = CancellationToken::new();

    let store = RedisStore::connect(&config).await?;
    let state = Arc::new(AppState::new(config, instance_address.clone(), store.clone(), shutdown.clone()));

    let dispatcher = Dispatcher::new(store.clone());
    let instance = Instance::new(instance_address.clone(), store, dispatcher, shutdown.clone());

    instance.clear().await?;
    instance.start(state.clone()).await?;

    info!(address = %instance_address, %addr, "ssebroker listening");
    let router = build_router(state.clone());
    let listener = TcpListener::bind(&addr).await?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    // `stop_fut` broadcasts INSTANCE_CLOSE and waits for every handler to
    // drain as soon as shutdown is requested; it must run concurrently
    // with (not after) axum's own graceful wait, since that wait only
    // resolves once every `/events` response body ends — which happens
    // only after the INSTANCE_CLOSE broadcast reaches each handler.
    let serve_fut = axum::serve(listener, router).with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let stop_fut = async {
        shutdown.cancelled().await;
        instance.stop(&state).await;
    };
    let (serve_result, ()) = tokio::join!(serve_fut, stop_fut);
    serve_result?;

    instance.dispose().await?;
    info!(address = %instance_address, "ssebroker stopped");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
