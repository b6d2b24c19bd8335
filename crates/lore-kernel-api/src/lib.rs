use std::path::PathBuf;

use anyhow::{anyhow, Result};
use lore_kernel_core::{
    CorrectionRecord, CorrectionScope, EntityLinkRecord, EntityView, ExtractionKind, FactsView,
    KernelConfig, QuoteRecord, ResolutionReport, SearchHit, SessionRecord, TargetType,
    ThreadView, Utterance, ViewerRole,
};
use lore_kernel_store_sqlite::{
    CampaignRecord, ExtractionRecord, IngestSummary, IntegrityReport, NewCorrection, NewSession,
    PersistReport, RunRecord, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRunRequest {
    pub session_id: String,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordExtractionRequest {
    pub run_id: String,
    pub payload: Value,
}

/// Result of persisting and resolving one run in a single call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRunResult {
    pub persist: PersistReport,
    pub resolve: ResolutionReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppendCorrectionRequest {
    pub campaign_id: String,
    pub session_id: Option<String>,
    pub target_type: TargetType,
    pub target_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    pub created_by: Option<String>,
}

/// Which slice of the campaign a read path projects, and for whom.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewRequest {
    pub campaign_id: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: ViewerRole,
}

impl ViewRequest {
    fn scope(&self) -> CorrectionScope {
        CorrectionScope { campaign_id: self.campaign_id.clone(), session_id: self.session_id.clone() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchRequest {
    #[serde(flatten)]
    pub view: ViewRequest,
    pub query: String,
    pub limit: Option<usize>,
}

/// A read-path result stamped with the ledger state it was projected from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Projection<T> {
    pub campaign_id: String,
    pub session_id: Option<String>,
    pub role: ViewerRole,
    pub ledger_fingerprint: String,
    pub items: T,
}

#[derive(Debug, Clone)]
pub struct LoreKernelApi {
    db_path: PathBuf,
    config: KernelConfig,
}

impl LoreKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, config: KernelConfig::default() }
    }

    /// Build an API handle with explicit tunables.
    ///
    /// # Errors
    /// Returns an error when any tunable is outside its allowed range.
    pub fn with_config(db_path: PathBuf, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { db_path, config })
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn create_campaign(&self, campaign_id: &str, name: &str) -> Result<CampaignRecord> {
        self.open_migrated()?.create_campaign(campaign_id, name)
    }

    /// # Errors
    /// Returns an error when the campaign is unknown or persistence fails.
    pub fn create_session(&self, input: &NewSession) -> Result<SessionRecord> {
        self.open_migrated()?.create_session(input)
    }

    /// # Errors
    /// Returns an error when lookup fails.
    pub fn list_sessions(&self, campaign_id: &str) -> Result<Vec<SessionRecord>> {
        self.open_migrated()?.list_sessions(campaign_id)
    }

    /// # Errors
    /// Returns an error when the session is unknown or persistence fails.
    pub fn create_run(&self, input: &CreateRunRequest) -> Result<RunRecord> {
        self.open_migrated()?.create_run(&input.session_id, input.run_id.as_deref())
    }

    /// # Errors
    /// Returns an error when lookup fails or the run does not exist.
    pub fn show_run(&self, run_id: &str) -> Result<RunRecord> {
        self.open_migrated()?
            .get_run(run_id)?
            .ok_or_else(|| anyhow!("run not found: {run_id}"))
    }

    /// # Errors
    /// Returns an error when a line is invalid or persistence fails.
    pub fn ingest_utterances(&self, utterances: &[Utterance]) -> Result<IngestSummary> {
        self.open_migrated()?.ingest_utterances(utterances)
    }

    /// Record a raw `session_facts` payload for a run.
    ///
    /// # Errors
    /// Returns an error when the run is unknown or the payload does not decode.
    pub fn record_extraction(&self, input: &RecordExtractionRequest) -> Result<ExtractionRecord> {
        self.open_migrated()?.record_extraction(
            &input.run_id,
            ExtractionKind::SessionFacts,
            &input.payload,
        )
    }

    /// # Errors
    /// Returns an error when the run has no payload or utterances, or persistence fails.
    pub fn persist_run(&self, run_id: &str) -> Result<PersistReport> {
        self.open_migrated()?.persist_run(run_id, &self.config.evidence)
    }

    /// # Errors
    /// Returns an error when the run was never persisted or resolution fails.
    pub fn resolve_run(&self, run_id: &str) -> Result<ResolutionReport> {
        self.open_migrated()?.resolve_run(run_id)
    }

    /// Persist then resolve one run.
    ///
    /// # Errors
    /// Returns an error when either step fails.
    pub fn process_run(&self, run_id: &str) -> Result<ProcessRunResult> {
        let mut store = self.open_migrated()?;
        let persist = store.persist_run(run_id, &self.config.evidence)?;
        let resolve = store.resolve_run(run_id)?;
        Ok(ProcessRunResult { persist, resolve })
    }

    /// # Errors
    /// Returns an error when the correction is invalid or persistence fails.
    pub fn append_correction(&self, input: AppendCorrectionRequest) -> Result<CorrectionRecord> {
        let payload = if input.payload.is_null() { Value::Object(serde_json::Map::new()) } else { input.payload };
        self.open_migrated()?.append_correction(&NewCorrection {
            campaign_id: input.campaign_id,
            session_id: input.session_id,
            target_type: input.target_type,
            target_id: input.target_id,
            action: input.action,
            payload,
            created_by: input.created_by,
        })
    }

    /// # Errors
    /// Returns an error when lookup fails.
    pub fn list_corrections(&self, campaign_id: &str, session_id: Option<&str>) -> Result<Vec<CorrectionRecord>> {
        self.open_migrated()?.list_corrections(&CorrectionScope {
            campaign_id: campaign_id.to_string(),
            session_id: session_id.map(str::to_string),
        })
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn entities(&self, input: &ViewRequest) -> Result<Projection<Vec<EntityView>>> {
        let store = self.open_migrated()?;
        let items = store.entity_views(&input.scope(), input.role)?;
        project(&store, input, items)
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn threads(&self, input: &ViewRequest) -> Result<Projection<Vec<ThreadView>>> {
        let store = self.open_migrated()?;
        let items = store.thread_views(&input.scope(), input.role)?;
        project(&store, input, items)
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn quotes(&self, input: &ViewRequest) -> Result<Projection<Vec<QuoteRecord>>> {
        let store = self.open_migrated()?;
        let items = store.quote_views(&input.scope(), input.role)?;
        project(&store, input, items)
    }

    /// One run's facts with every overlay applied in the run's session scope.
    ///
    /// # Errors
    /// Returns an error when the run is unknown or any read fails.
    pub fn facts(&self, run_id: &str, role: ViewerRole) -> Result<Projection<FactsView>> {
        let store = self.open_migrated()?;
        let run = store.get_run(run_id)?.ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        let items = store.facts_view(run_id, role)?;
        let request = ViewRequest { campaign_id: run.campaign_id, session_id: Some(run.session_id), role };
        project(&store, &request, items)
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn entity_links(
        &self,
        input: &ViewRequest,
        run_id: Option<&str>,
    ) -> Result<Projection<Vec<EntityLinkRecord>>> {
        let store = self.open_migrated()?;
        let items = store.entity_link_views(&input.scope(), input.role, run_id)?;
        project(&store, input, items)
    }

    /// # Errors
    /// Returns an error when any read fails.
    pub fn search(&self, input: &SearchRequest) -> Result<Projection<Vec<SearchHit>>> {
        let store = self.open_migrated()?;
        let limit = input.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        let items = store.search(&input.view.scope(), input.view.role, &input.query, limit)?;
        project(&store, &input.view, items)
    }
}

fn project<T>(store: &SqliteStore, request: &ViewRequest, items: T) -> Result<Projection<T>> {
    Ok(Projection {
        campaign_id: request.campaign_id.clone(),
        session_id: request.session_id.clone(),
        role: request.role,
        ledger_fingerprint: store.ledger_fingerprint(&request.scope())?,
        items,
    })
}
