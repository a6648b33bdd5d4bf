use std::sync::Arc;

use clap::Parser;
use odata_server::{
    config::ServerConfig,
    errors::ServerError,
    monitoring::{self, MonitoringLayer},
    router, AppState,
};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter.as_str())
        .init();

    if config.monitoring {
        use colored::*;
        tracing::info!("{}", "🚀 OData Server with Monitoring".bold().cyan());
        tracing::info!("{}", "===============================".cyan());
        tracing::info!("");
    }

    let monitoring_layer = if config.monitoring {
        let (tx, rx) = tokio::sync::mpsc::channel(1000);
        monitoring::spawn_monitoring_display(rx).await;
        Some(MonitoringLayer::new(tx))
    } else {
        None
    };

    let addr = config.bind_address.clone();
    let app_state = match AppState::new(config, monitoring_layer) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!(%e, "Failed to initialize service");
            return Err(e);
        }
    };

    tracing::info!(
        "Starting OData server on {} (service root {})",
        addr,
        app_state.service_root
    );

    let app = router(app_state);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%e, addr = %addr);
            return Err(e.into());
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(%e, addr = %addr);
    }

    Ok(())
}
