use std::path::PathBuf;

use crate::pipeline::consolidation::ConsolidationConfig;

/// Application-level constants
pub const APP_NAME: &str = "ChartConsolidator";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

const ENV_DB_PATH: &str = "CHART_DB_PATH";
const ENV_OLLAMA_URL: &str = "CHART_OLLAMA_URL";
const ENV_MODEL: &str = "CHART_MODEL";
const ENV_ORACLE_TIMEOUT: &str = "CHART_ORACLE_TIMEOUT_SECS";
const ENV_REVIEW_FLOOR: &str = "CHART_REVIEW_CONFIDENCE_FLOOR";

/// Get the application data directory
/// ~/ChartConsolidator/, or under the temp dir when there is no home.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Default database file
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("chart.db")
}

/// Tracing filter used when RUST_LOG is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "chart_consolidator=debug,warn"
    } else {
        "chart_consolidator=info,warn"
    }
}

/// Runtime settings, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub ollama_url: String,
    pub engine: ConsolidationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            engine: ConsolidationConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = get(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(url) = get(ENV_OLLAMA_URL) {
            config.ollama_url = url;
        }
        if let Some(model) = get(ENV_MODEL) {
            config.engine.model_name = model;
        }
        if let Some(raw) = get(ENV_ORACLE_TIMEOUT) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => config.engine.oracle_timeout_secs = secs,
                _ => tracing::warn!(
                    key = ENV_ORACLE_TIMEOUT,
                    value = %raw,
                    "Ignoring invalid setting"
                ),
            }
        }
        if let Some(raw) = get(ENV_REVIEW_FLOOR) {
            match raw.parse::<f32>() {
                Ok(floor) if (0.0..=1.0).contains(&floor) => {
                    config.engine.review_confidence_floor = Some(floor)
                }
                _ => tracing::warn!(
                    key = ENV_REVIEW_FLOOR,
                    value = %raw,
                    "Ignoring invalid setting"
                ),
            }
        }
        config
    }
}
