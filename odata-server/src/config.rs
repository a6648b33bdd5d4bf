use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use odata_core::{EdmModel, ODataVersion, WriterSettings};
use url::Url;

use crate::batch::BatchQuotas;
use crate::errors::ServerError;

const BUILTIN_MODEL: &str = include_str!("../models/northwind.json");

#[derive(Parser, Debug, Clone)]
#[command(name = "odata-server", about = "OData service with $batch support")]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: String,

    /// Public service root; must end with '/'
    #[arg(long, env = "SERVICE_ROOT", default_value = "http://localhost:8080/odata/")]
    pub service_root: Url,

    /// JSON model definition; the built-in sample model is used when absent
    #[arg(long, env = "ODATA_MODEL")]
    pub model: Option<PathBuf>,

    /// OData-Version written on responses (4.0 or 4.01)
    #[arg(long, env = "ODATA_VERSION")]
    pub odata_version: Option<ODataVersion>,

    #[arg(long, env = "PAGE_SIZE", default_value_t = 50)]
    pub page_size: usize,

    /// Seconds a batch may run before it is cancelled
    #[arg(long, env = "BATCH_TIMEOUT_SECS", default_value_t = 30)]
    pub batch_timeout_secs: u64,

    #[arg(long, env = "MAX_BATCH_PARTS", default_value_t = 100)]
    pub max_batch_parts: usize,

    #[arg(long, env = "MAX_CHANGESET_OPERATIONS", default_value_t = 100)]
    pub max_changeset_operations: usize,

    /// Print batch activity to the console
    #[arg(long, env = "MONITORING")]
    pub monitoring: bool,

    #[arg(long, env = "LOG_FILTER", default_value = "odata_server=debug,tower_http=debug")]
    pub log_filter: String,
}

impl Default for ServerConfig {
    /// Defaults as declared on the arguments, still honouring the environment.
    fn default() -> Self {
        Self::parse_from(["odata-server"])
    }
}

impl ServerConfig {
    /// The service root with a trailing slash, so relative references join below it.
    pub fn service_root(&self) -> Url {
        let mut root = self.service_root.clone();
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        root
    }

    pub fn load_model(&self) -> Result<EdmModel, ServerError> {
        match &self.model {
            Some(path) => {
                let json = std::fs::read_to_string(path)?;
                Ok(EdmModel::from_json(&json)?)
            }
            None => Ok(EdmModel::from_json(BUILTIN_MODEL)?),
        }
    }

    pub fn quotas(&self) -> BatchQuotas {
        BatchQuotas {
            max_parts: self.max_batch_parts,
            max_changeset_operations: self.max_changeset_operations,
        }
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings::new(self.odata_version)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let config = ServerConfig::try_parse_from([
            "odata-server",
            "--service-root",
            "http://example.com/svc",
            "--odata-version",
            "4.01",
            "--max-batch-parts",
            "5",
        ])
        .unwrap();

        assert_eq!(config.service_root().as_str(), "http://example.com/svc/");
        assert_eq!(config.writer_settings().version(), ODataVersion::V401);
        assert_eq!(config.quotas().max_parts, 5);
        assert_eq!(config.page_size, 50);
    }

    #[test]
    fn test_builtin_model_loads() {
        let model = ServerConfig::default().load_model().unwrap();
        assert!(model.find_entity_set("Customers").is_some());
        assert_eq!(ServerConfig::default().writer_settings().version(), ODataVersion::V4);
    }
}
