//! Configuration for obligationd

use std::sync::Arc;
use std::time::Duration;

use obligation_engine::ollama::{DEFAULT_OLLAMA_ENDPOINT, DEFAULT_OLLAMA_MODEL};
use obligation_engine::{Drafter, EngineConfig, ExternalResult, OllamaDrafter, TemplateDrafter};
use serde::{Deserialize, Serialize};

use crate::error::DaemonResult;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Engine thresholds, intervals and limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Draft backend
    #[serde(default)]
    pub drafter: DrafterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// JSON file of obligations loaded into the in-memory store at startup
    #[serde(default)]
    pub seed: Option<String>,
}

/// Which drafter backs auto-drafted replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrafterKind {
    #[default]
    Template,
    Ollama,
}

/// Drafter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrafterConfig {
    #[serde(default)]
    pub kind: DrafterKind,

    /// Base URL of the model server
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for DrafterConfig {
    fn default() -> Self {
        Self {
            kind: DrafterKind::Template,
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: None,
        }
    }
}

impl DrafterConfig {
    /// Build the configured drafter. HTTP calls use `timeout`.
    pub fn build(&self, timeout: Duration) -> ExternalResult<Arc<dyn Drafter>> {
        match self.kind {
            DrafterKind::Template => Ok(Arc::new(TemplateDrafter)),
            DrafterKind::Ollama => {
                let mut drafter = OllamaDrafter::new(self.endpoint.clone(), self.model.clone(), timeout)?;
                if let Some(temperature) = self.temperature {
                    drafter = drafter.with_temperature(temperature);
                }
                Ok(Arc::new(drafter))
            }
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_endpoint() -> String {
    DEFAULT_OLLAMA_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OLLAMA_MODEL.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file, then `OBLIGATIONS_*` variables.
    ///
    /// Nested keys use a double underscore: `OBLIGATIONS_ENGINE__REMINDER_THRESHOLD_SECS`.
    pub fn load(path: Option<&str>) -> DaemonResult<Self> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("OBLIGATIONS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.auto_draft_enabled_types")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}
