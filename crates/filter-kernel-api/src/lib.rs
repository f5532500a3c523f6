use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use filter_kernel_catalog_sqlite::{
    IntegrityReport, LoadSummary, RowShape, SchemaStatus, SqliteCatalog,
};
use filter_kernel_core::{
    apply, compile_as_of, create_session, process_turn, reset_session, CanonicalVocabulary,
    Delta, EngineConfig, FilterMemory, MonthDay, ProductRecord, QueryParam,
    RenderedQuery, TurnContext, TurnWarning,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnRequest {
    pub memory: FilterMemory,
    pub deltas: Vec<Delta>,
    /// Date that `now` resolves to; defaults to the current UTC date.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnResponse {
    pub contract_version: String,
    pub turn_id: String,
    pub plan_id: String,
    pub explain: Vec<String>,
    pub sql: String,
    pub records: Vec<ProductRecord>,
    pub warnings: Vec<TurnWarning>,
    pub candidate_count: usize,
    pub exhausted: bool,
    /// Memory to send with the next turn.
    pub memory: FilterMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanPreview {
    pub contract_version: String,
    pub plan_id: String,
    pub explain: Vec<String>,
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub warnings: Vec<TurnWarning>,
}

#[derive(Debug, Clone)]
pub struct FilterKernelApi {
    db_path: PathBuf,
    config: EngineConfig,
    vocabulary: Arc<CanonicalVocabulary>,
}

impl FilterKernelApi {
    /// # Errors
    /// Returns an error when the config is invalid or its vocabulary tables are inconsistent.
    pub fn new(db_path: PathBuf, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let vocabulary = config.build_vocabulary().context("failed to build canonical vocabulary")?;
        Ok(Self { db_path, config, vocabulary: Arc::new(vocabulary) })
    }

    /// # Errors
    /// Returns an error when the config file cannot be read or is invalid.
    pub fn from_config_file(db_path: PathBuf, config_path: &Path) -> Result<Self> {
        let config = EngineConfig::from_path(config_path)
            .with_context(|| format!("failed to load engine config {}", config_path.display()))?;
        Self::new(db_path, config)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn vocabulary(&self) -> Arc<CanonicalVocabulary> {
        Arc::clone(&self.vocabulary)
    }

    fn open_catalog(&self) -> Result<SqliteCatalog> {
        let mut catalog = SqliteCatalog::open(&self.db_path)?;
        catalog.migrate()?;
        Ok(catalog)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteCatalog::open(&self.db_path)?.schema_status()
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or a status query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_catalog()?.integrity_check()
    }

    /// Load catalog products, deriving bucket flags from raw color names.
    ///
    /// # Errors
    /// Returns an error when any row fails to write; the load is then rolled back.
    pub fn load_catalog(&self, records: &[ProductRecord], shape: RowShape) -> Result<LoadSummary> {
        let mut catalog = self.open_catalog()?;
        let summary = catalog.load_products(records, &self.vocabulary, shape)?;
        tracing::info!(rows = summary.rows_written, ?shape, "catalog loaded");
        Ok(summary)
    }

    #[must_use]
    pub fn create_session(&self) -> FilterMemory {
        create_session()
    }

    #[must_use]
    pub fn reset_session(&self, memory: &FilterMemory) -> FilterMemory {
        reset_session(memory)
    }

    /// Apply one turn's deltas and return the next sample.
    ///
    /// On error the request memory stays valid; a
    /// [`filter_kernel_core::KernelError`] can be recovered with `downcast_ref`.
    ///
    /// # Errors
    /// Returns an error when constraints cannot be resolved, or the catalog fetch fails or
    /// times out.
    pub fn process_turn(&self, input: TurnRequest) -> Result<TurnResponse> {
        let turn_id = ulid::Ulid::new().to_string();
        let _span = tracing::info_span!("turn", turn_id = %turn_id).entered();

        let catalog = self.open_catalog()?;
        let ctx = TurnContext {
            vocabulary: &self.vocabulary,
            config: &self.config,
            catalog: &catalog,
            today: resolve_today(input.as_of),
        };
        let outcome = process_turn(&ctx, &input.memory, &input.deltas)?;
        let plan_id = compute_plan_id(&outcome.query);
        tracing::info!(
            plan_id = %plan_id,
            candidates = outcome.candidate_count,
            returned = outcome.records.len(),
            exhausted = outcome.exhausted,
            "turn processed"
        );

        Ok(TurnResponse {
            contract_version: API_CONTRACT_VERSION.to_string(),
            turn_id,
            plan_id,
            explain: outcome.plan.explain(),
            sql: outcome.query.sql,
            records: outcome.records,
            warnings: outcome.warnings,
            candidate_count: outcome.candidate_count,
            exhausted: outcome.exhausted,
            memory: outcome.memory,
        })
    }

    /// Compile the memory that `input` would produce without touching the catalog.
    ///
    /// # Errors
    /// Returns an error when the configured catalog view is not a valid identifier.
    pub fn compile_preview(&self, input: &TurnRequest) -> Result<PlanPreview> {
        let transition = apply(&input.memory, &input.deltas, &self.vocabulary);
        let plan = compile_as_of(&transition.memory, resolve_today(input.as_of));
        let query = plan.render(&self.config.catalog_view, SqliteCatalog::PARAM_STYLE)?;

        Ok(PlanPreview {
            contract_version: API_CONTRACT_VERSION.to_string(),
            plan_id: compute_plan_id(&query),
            explain: plan.explain(),
            sql: query.sql,
            params: query.params,
            warnings: transition.warnings,
        })
    }
}

fn resolve_today(as_of: Option<OffsetDateTime>) -> MonthDay {
    MonthDay::from_date(as_of.unwrap_or_else(OffsetDateTime::now_utc).date())
}

fn compute_plan_id(query: &RenderedQuery) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.sql.as_bytes());
    for param in &query.params {
        let encoded = match param {
            QueryParam::Int(value) => format!("i:{value}"),
            QueryParam::Float(value) => format!("f:{value}"),
            QueryParam::Text(value) => format!("t:{value}"),
        };
        hasher.update([0_u8]);
        hasher.update(encoded.as_bytes());
    }
    let digest = hasher.finalize();
    format!("plan_{}", hex::encode(&digest[..8]))
}
