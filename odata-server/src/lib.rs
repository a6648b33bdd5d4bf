pub mod api;
pub mod batch;
pub mod config;
pub mod errors;
pub mod monitoring;
pub mod pipeline;
pub mod service;
pub mod store;

use std::sync::Arc;

use axum::{routing::get, Router};
use odata_core::WriterSettings;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use url::Url;

use crate::batch::BatchHandler;
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::monitoring::MonitoringLayer;
use crate::service::ODataService;

pub struct AppState {
    pub config: ServerConfig,
    pub service_root: Url,
    pub settings: WriterSettings,
    pub service: Arc<ODataService>,
    pub batch: BatchHandler<ODataService>,
    pub monitoring: Option<MonitoringLayer>,
}

impl AppState {
    pub fn new(config: ServerConfig, monitoring: Option<MonitoringLayer>) -> Result<Self, ServerError> {
        let model = Arc::new(config.load_model()?);
        let service = Arc::new(ODataService::new(model, config.page_size)?);
        let service_root = config.service_root();
        let settings = config.writer_settings();

        let batch = BatchHandler::new(service.clone(), service_root.clone())
            .with_settings(settings.clone())
            .with_quotas(config.quotas())
            .with_monitoring(monitoring.clone());

        Ok(Self {
            config,
            service_root,
            settings,
            service,
            batch,
            monitoring,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .fallback(api::odata)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
