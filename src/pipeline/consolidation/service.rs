//! Async entry point: one detached task per batch, serialized per
//! (patient, entity type), blocking work on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::ConsolidationError;
use super::gate::{GateKey, SerializationGate};
use super::orchestrator::Consolidator;
use super::store::SqliteCanonicalStore;
use super::types::{BatchSummary, ConsolidationConfig, ConsolidationRequest};
use crate::config::AppConfig;
use crate::db::sqlite::open_database;
use crate::pipeline::oracle::{ExtractionOracle, LlmExtractionOracle, OllamaClient};

#[derive(Clone)]
pub struct ConsolidationService {
    db_path: PathBuf,
    oracle: Arc<dyn ExtractionOracle>,
    config: Arc<ConsolidationConfig>,
    gate: SerializationGate,
}

impl ConsolidationService {
    /// Open (and migrate) the database once, so concurrent batches only ever
    /// find it at the current schema version.
    pub fn open(
        db_path: impl Into<PathBuf>,
        oracle: Arc<dyn ExtractionOracle>,
        config: ConsolidationConfig,
    ) -> Result<Self, ConsolidationError> {
        let db_path = db_path.into();
        open_database(&db_path)?;
        tracing::info!(
            db = %db_path.display(),
            model = %config.model_name,
            "Consolidation service ready"
        );
        Ok(Self {
            db_path,
            oracle,
            config: Arc::new(config),
            gate: SerializationGate::new(),
        })
    }

    /// Service backed by the Ollama oracle described by `app`.
    pub fn from_app_config(app: &AppConfig) -> Result<Self, ConsolidationError> {
        if let Some(dir) = app.db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let engine = app.engine.clone();
        let client = OllamaClient::new(&app.ollama_url, engine.oracle_timeout_secs);
        let oracle = LlmExtractionOracle::new(client, &engine.model_name, engine.parse_options());
        Self::open(app.db_path.clone(), Arc::new(oracle), engine)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Consolidate one source event. The batch runs to completion even if the
    /// returned future is dropped.
    pub async fn consolidate(
        &self,
        request: ConsolidationRequest,
    ) -> Result<BatchSummary, ConsolidationError> {
        request.validate()?;

        let key = GateKey::new(&request.patient_id, request.entity_type);
        let gate = self.gate.clone();
        let db_path = self.db_path.clone();
        let oracle = self.oracle.clone();
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            gate.run_exclusive(key, async move {
                tokio::task::spawn_blocking(move || {
                    let conn = open_database(&db_path)?;
                    let store = SqliteCanonicalStore::new(&conn);
                    Consolidator::new(&store, &*oracle, &config).run(&request)
                })
                .await
            })
            .await
        });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) | Err(e) => {
                tracing::error!(error = %e, "Consolidation task did not complete");
                Err(ConsolidationError::Task(e.to_string()))
            }
        }
    }
}
