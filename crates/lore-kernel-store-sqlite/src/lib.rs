use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use lore_kernel_core::{
    apply_entity_corrections, apply_entity_spoilers, apply_redactions, ground_session_facts, json_fingerprint,
    load_entity_correction_state, load_redaction_state, load_spoiler_state,
    load_thread_correction_state, normalize_key, plan_resolution, search_utterances,
    spoiler_cutoff, visible_entities, visible_entity_links, visible_quotes, visible_threads,
    CampaignThreadId, CampaignThreadRecord, CorrectionAction, CorrectionId, CorrectionRecord,
    CorrectionScope, EntityAliasRecord, EntityCorrectionState, EntityId, EntityLinkRecord,
    EntityRecord, EntityType, EntityView, EventId, EventRecord, EventType, EvidenceConfig,
    EvidenceReport, ExtractionId, ExtractionKind, FactType, FactsView,
    KernelError, LinkRole, MentionId, MentionRecord, QuoteId, QuoteRecord, RedactionState,
    ResolutionInput, ResolutionReport, RunStatus, SceneId, SceneRecord, SearchHit,
    SessionFacts, SessionRecord, SpoilerState, TargetType, ThreadCorrectionState, ThreadId,
    ThreadKind, ThreadRecord, ThreadStatus, ThreadUpdateId, ThreadUpdateRecord, ThreadView,
    Utterance, ViewerRole,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS campaigns (
  campaign_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
  session_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  session_number INTEGER,
  title TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id)
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('created','persisted','resolved')),
  created_at TEXT NOT NULL,
  finished_at TEXT,
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id),
  FOREIGN KEY (session_id) REFERENCES sessions(session_id)
);

CREATE TABLE IF NOT EXISTS utterances (
  utterance_id TEXT PRIMARY KEY,
  session_id TEXT NOT NULL,
  start_ms INTEGER NOT NULL,
  end_ms INTEGER NOT NULL,
  speaker TEXT,
  text TEXT NOT NULL,
  CHECK (end_ms >= start_ms),
  FOREIGN KEY (session_id) REFERENCES sessions(session_id)
);

CREATE TABLE IF NOT EXISTS session_extractions (
  extraction_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('session_facts','persist_metrics','resolve_metrics')),
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS mentions (
  mention_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  text TEXT NOT NULL,
  entity_type TEXT NOT NULL CHECK (entity_type IN ('character','location','item','faction','monster','deity','organization','other')),
  description TEXT,
  evidence_json TEXT NOT NULL,
  confidence REAL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS scenes (
  scene_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  title TEXT,
  start_ms INTEGER NOT NULL,
  end_ms INTEGER NOT NULL,
  summary TEXT NOT NULL,
  location TEXT,
  participants_json TEXT NOT NULL,
  evidence_json TEXT NOT NULL,
  confidence REAL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('combat','social','travel','discovery','loot','economy','relationship','thread_update','rules','generic')),
  start_ms INTEGER NOT NULL,
  end_ms INTEGER NOT NULL,
  summary TEXT NOT NULL,
  entities_json TEXT NOT NULL,
  evidence_json TEXT NOT NULL,
  confidence REAL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS campaign_threads (
  campaign_thread_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  title_key TEXT NOT NULL,
  title TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('quest','mystery','personal_arc','faction_arc','other')),
  status TEXT NOT NULL CHECK (status IN ('proposed','active','blocked','completed','failed','abandoned')),
  summary TEXT,
  UNIQUE (campaign_id, title_key),
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id)
);

CREATE TABLE IF NOT EXISTS threads (
  thread_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  campaign_thread_id TEXT NOT NULL,
  title TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('quest','mystery','personal_arc','faction_arc','other')),
  status TEXT NOT NULL CHECK (status IN ('proposed','active','blocked','completed','failed','abandoned')),
  summary TEXT,
  entities_json TEXT NOT NULL,
  evidence_json TEXT NOT NULL,
  confidence REAL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (campaign_thread_id) REFERENCES campaign_threads(campaign_thread_id)
);

CREATE TABLE IF NOT EXISTS thread_updates (
  update_id TEXT PRIMARY KEY,
  thread_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  update_type TEXT NOT NULL,
  note TEXT NOT NULL,
  evidence_json TEXT NOT NULL,
  related_event_ids_json TEXT NOT NULL,
  FOREIGN KEY (thread_id) REFERENCES threads(thread_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS quotes (
  quote_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  utterance_id TEXT NOT NULL,
  char_start INTEGER NOT NULL,
  char_end INTEGER NOT NULL,
  speaker TEXT,
  note TEXT,
  clean_text TEXT,
  CHECK (char_start >= 0 AND char_end > char_start),
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (utterance_id) REFERENCES utterances(utterance_id)
);

CREATE TABLE IF NOT EXISTS entities (
  entity_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  entity_type TEXT NOT NULL CHECK (entity_type IN ('character','location','item','faction','monster','deity','organization','other')),
  canonical_name TEXT NOT NULL,
  name_key TEXT NOT NULL,
  description TEXT,
  created_at TEXT NOT NULL,
  UNIQUE (campaign_id, entity_type, name_key),
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id)
);

CREATE TABLE IF NOT EXISTS entity_aliases (
  entity_id TEXT NOT NULL,
  alias TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (entity_id, alias),
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS entity_mentions (
  mention_id TEXT PRIMARY KEY,
  entity_id TEXT NOT NULL,
  run_id TEXT NOT NULL,
  FOREIGN KEY (mention_id) REFERENCES mentions(mention_id) ON DELETE CASCADE,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS event_entities (
  event_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  run_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('evidence','entity_ref','participant')),
  evidence_json TEXT NOT NULL,
  UNIQUE (event_id, entity_id),
  FOREIGN KEY (event_id) REFERENCES events(event_id) ON DELETE CASCADE,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS scene_entities (
  scene_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  run_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('evidence','entity_ref','participant')),
  evidence_json TEXT NOT NULL,
  UNIQUE (scene_id, entity_id),
  FOREIGN KEY (scene_id) REFERENCES scenes(scene_id) ON DELETE CASCADE,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS thread_entities (
  thread_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  run_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('evidence','entity_ref','participant')),
  evidence_json TEXT NOT NULL,
  UNIQUE (thread_id, entity_id),
  FOREIGN KEY (thread_id) REFERENCES threads(thread_id) ON DELETE CASCADE,
  FOREIGN KEY (entity_id) REFERENCES entities(entity_id)
);

CREATE TABLE IF NOT EXISTS corrections (
  correction_id TEXT PRIMARY KEY,
  campaign_id TEXT NOT NULL,
  session_id TEXT,
  target_type TEXT NOT NULL CHECK (target_type IN ('entity','thread','quote','utterance')),
  target_id TEXT NOT NULL,
  action TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  created_by TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (campaign_id) REFERENCES campaigns(campaign_id),
  FOREIGN KEY (session_id) REFERENCES sessions(session_id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_campaign ON sessions(campaign_id);
CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id);
CREATE INDEX IF NOT EXISTS idx_utterances_session_start ON utterances(session_id, start_ms);
CREATE INDEX IF NOT EXISTS idx_extractions_run_kind ON session_extractions(run_id, kind);
CREATE INDEX IF NOT EXISTS idx_mentions_run ON mentions(run_id);
CREATE INDEX IF NOT EXISTS idx_scenes_run ON scenes(run_id);
CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);
CREATE INDEX IF NOT EXISTS idx_threads_run ON threads(run_id);
CREATE INDEX IF NOT EXISTS idx_threads_campaign_thread ON threads(campaign_thread_id);
CREATE INDEX IF NOT EXISTS idx_thread_updates_thread ON thread_updates(thread_id);
CREATE INDEX IF NOT EXISTS idx_quotes_run ON quotes(run_id);
CREATE INDEX IF NOT EXISTS idx_entities_campaign ON entities(campaign_id);
CREATE INDEX IF NOT EXISTS idx_entity_mentions_run ON entity_mentions(run_id);
CREATE INDEX IF NOT EXISTS idx_event_entities_run ON event_entities(run_id);
CREATE INDEX IF NOT EXISTS idx_scene_entities_run ON scene_entities(run_id);
CREATE INDEX IF NOT EXISTS idx_thread_entities_run ON thread_entities(run_id);
CREATE INDEX IF NOT EXISTS idx_corrections_campaign ON corrections(campaign_id, session_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignRecord {
    pub campaign_id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSession {
    pub session_id: String,
    pub campaign_id: String,
    pub session_number: Option<i64>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: String,
    pub campaign_id: String,
    pub session_id: String,
    pub status: RunStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionRecord {
    pub extraction_id: ExtractionId,
    pub run_id: String,
    pub session_id: String,
    pub kind: ExtractionKind,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub skipped_existing: usize,
}

/// Counts from one persistence pass plus the grounding report behind them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistReport {
    pub run_id: String,
    pub session_id: String,
    pub mentions: usize,
    pub scenes: usize,
    pub events: usize,
    pub threads: usize,
    pub thread_updates: usize,
    pub quotes: usize,
    pub threads_skipped: usize,
    pub campaign_threads_created: usize,
    pub evidence: EvidenceReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCorrection {
    pub campaign_id: String,
    pub session_id: Option<String>,
    pub target_type: TargetType,
    pub target_id: String,
    pub action: String,
    pub payload: Value,
    pub created_by: Option<String>,
}

/// Everything a read path needs to fold the ledger for one scope and viewer.
struct OverlayContext {
    corrections: Vec<CorrectionRecord>,
    entities: Vec<EntityRecord>,
    aliases: Vec<EntityAliasRecord>,
    redaction: RedactionState,
    spoilers: SpoilerState,
    cutoff: Option<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed lore store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            if table_exists(&self.conn, "utterances")? {
                // Tables created before migrations were recorded.
                record_schema_version(&self.conn, 1)?;
            } else {
                let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
                tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
                record_schema_version(&tx, 1)?;
                tx.commit().context("failed to commit migration v1")?;
            }
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    // Registration and ingestion.

    /// # Errors
    /// Returns an error when the name is blank or the campaign already exists.
    pub fn create_campaign(&mut self, campaign_id: &str, name: &str) -> Result<CampaignRecord> {
        if campaign_id.trim().is_empty() {
            return Err(anyhow!("campaign_id MUST be provided"));
        }
        if name.trim().is_empty() {
            return Err(anyhow!("campaign name MUST be provided"));
        }
        let created_at = OffsetDateTime::now_utc();
        self.conn
            .execute(
                "INSERT INTO campaigns(campaign_id, name, created_at) VALUES (?1, ?2, ?3)",
                params![campaign_id, name, rfc3339(created_at)?],
            )
            .with_context(|| format!("failed to insert campaign {campaign_id}"))?;
        Ok(CampaignRecord { campaign_id: campaign_id.to_string(), name: name.to_string(), created_at })
    }

    /// # Errors
    /// Returns an error when the campaign is unknown or the session already exists.
    pub fn create_session(&mut self, session: &NewSession) -> Result<SessionRecord> {
        if session.session_id.trim().is_empty() {
            return Err(anyhow!("session_id MUST be provided"));
        }
        self.require_campaign(&session.campaign_id)?;
        let created_at = OffsetDateTime::now_utc();
        self.conn
            .execute(
                "INSERT INTO sessions(session_id, campaign_id, session_number, title, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session.session_id,
                    session.campaign_id,
                    session.session_number,
                    session.title,
                    rfc3339(created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert session {}", session.session_id))?;
        Ok(SessionRecord {
            session_id: session.session_id.clone(),
            campaign_id: session.campaign_id.clone(),
            session_number: session.session_number,
            title: session.title.clone(),
            created_at,
        })
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, campaign_id, session_number, title, created_at
             FROM sessions WHERE session_id = ?1",
        )?;
        let mut rows = stmt.query(params![session_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(SessionRecord {
                session_id: row.get(0)?,
                campaign_id: row.get(1)?,
                session_number: row.get(2)?,
                title: row.get(3)?,
                created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            })),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_sessions(&self, campaign_id: &str) -> Result<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, campaign_id, session_number, title, created_at
             FROM sessions WHERE campaign_id = ?1
             ORDER BY session_number IS NULL, session_number ASC, session_id ASC",
        )?;
        let mut rows = stmt.query(params![campaign_id])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(SessionRecord {
                session_id: row.get(0)?,
                campaign_id: row.get(1)?,
                session_number: row.get(2)?,
                title: row.get(3)?,
                created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            });
        }
        Ok(sessions)
    }

    /// Register a run for a session; a fresh ULID is minted when `run_id` is `None`.
    ///
    /// # Errors
    /// Returns an error when the session is unknown or the run id is taken.
    pub fn create_run(&mut self, session_id: &str, run_id: Option<&str>) -> Result<RunRecord> {
        let session = self
            .get_session(session_id)?
            .ok_or_else(|| anyhow!("unknown session: {session_id}"))?;
        let run_id = run_id.map_or_else(|| Ulid::new().to_string(), str::to_string);
        let created_at = OffsetDateTime::now_utc();
        self.conn
            .execute(
                "INSERT INTO runs(run_id, campaign_id, session_id, status, created_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![
                    run_id,
                    session.campaign_id,
                    session.session_id,
                    RunStatus::Created.as_str(),
                    rfc3339(created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert run {run_id}"))?;
        Ok(RunRecord {
            run_id,
            campaign_id: session.campaign_id,
            session_id: session.session_id,
            status: RunStatus::Created,
            created_at,
            finished_at: None,
        })
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, campaign_id, session_id, status, created_at, finished_at
             FROM runs WHERE run_id = ?1",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_run(row)?)),
            None => Ok(None),
        }
    }

    /// Insert transcript lines; lines whose id already exists are left untouched.
    ///
    /// # Errors
    /// Returns an error when a line references an unknown session or has an invalid range.
    pub fn ingest_utterances(&mut self, utterances: &[Utterance]) -> Result<IngestSummary> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut summary = IngestSummary { inserted: 0, skipped_existing: 0 };
        for utterance in utterances {
            if utterance.utterance_id.trim().is_empty() {
                return Err(anyhow!("utterance_id MUST be provided"));
            }
            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO utterances(utterance_id, session_id, start_ms, end_ms, speaker, text)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        utterance.utterance_id,
                        utterance.session_id,
                        utterance.start_ms,
                        utterance.end_ms,
                        utterance.speaker,
                        utterance.text,
                    ],
                )
                .with_context(|| format!("failed to insert utterance {}", utterance.utterance_id))?;
            if changed == 0 {
                summary.skipped_existing += 1;
            } else {
                summary.inserted += 1;
            }
        }
        tx.commit().context("failed to commit utterance ingestion")?;
        tracing::info!(
            inserted = summary.inserted,
            skipped = summary.skipped_existing,
            "ingested utterances"
        );
        Ok(summary)
    }

    /// Utterances of one session ordered by `(start_ms, utterance_id)`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_utterances(&self, session_id: &str) -> Result<Vec<Utterance>> {
        let mut stmt = self.conn.prepare(
            "SELECT utterance_id, session_id, start_ms, end_ms, speaker, text
             FROM utterances WHERE session_id = ?1
             ORDER BY start_ms ASC, utterance_id ASC",
        )?;
        let mut rows = stmt.query(params![session_id])?;
        let mut utterances = Vec::new();
        while let Some(row) = rows.next()? {
            utterances.push(decode_utterance(row)?);
        }
        Ok(utterances)
    }

    fn list_campaign_utterances(&self, campaign_id: &str) -> Result<Vec<Utterance>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.utterance_id, u.session_id, u.start_ms, u.end_ms, u.speaker, u.text
             FROM utterances u JOIN sessions s ON s.session_id = u.session_id
             WHERE s.campaign_id = ?1
             ORDER BY u.session_id ASC, u.start_ms ASC, u.utterance_id ASC",
        )?;
        let mut rows = stmt.query(params![campaign_id])?;
        let mut utterances = Vec::new();
        while let Some(row) = rows.next()? {
            utterances.push(decode_utterance(row)?);
        }
        Ok(utterances)
    }

    /// Store a raw extraction payload for a run. `session_facts` payloads must decode.
    ///
    /// # Errors
    /// Returns an error when the run is unknown or the payload does not decode.
    pub fn record_extraction(
        &mut self,
        run_id: &str,
        kind: ExtractionKind,
        payload: &Value,
    ) -> Result<ExtractionRecord> {
        let run = self.require_run(run_id)?;
        if kind == ExtractionKind::SessionFacts {
            serde_json::from_value::<SessionFacts>(payload.clone()).map_err(|err| {
                KernelError::Validation(format!("session_facts payload is invalid: {err}"))
            })?;
        }
        insert_extraction(&self.conn, &run, kind, payload)
    }

    /// Most recently recorded extraction of `kind` for a run.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn latest_extraction(
        &self,
        run_id: &str,
        kind: ExtractionKind,
    ) -> Result<Option<ExtractionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT extraction_id, run_id, session_id, kind, payload_json, created_at
             FROM session_extractions WHERE run_id = ?1 AND kind = ?2
             ORDER BY rowid DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![run_id, kind.as_str()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let kind_raw: String = row.get(3)?;
        Ok(Some(ExtractionRecord {
            extraction_id: ExtractionId::parse(&row.get::<_, String>(0)?)?,
            run_id: row.get(1)?,
            session_id: row.get(2)?,
            kind: ExtractionKind::parse(&kind_raw)
                .ok_or_else(|| anyhow!("unknown extraction kind: {kind_raw}"))?,
            payload: parse_json(&row.get::<_, String>(4)?, "extraction payload")?,
            created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        }))
    }

    // Persistence.

    /// Ground the run's latest `session_facts` payload and replace the run's fact rows.
    ///
    /// Everything happens in one transaction: prior facts and links for the run are deleted,
    /// the grounded facts inserted, and the report recorded as `persist_metrics`.
    ///
    /// # Errors
    /// Returns an error when the run is unknown, no payload was recorded, the session has no
    /// utterances, or any write fails.
    pub fn persist_run(&mut self, run_id: &str, config: &EvidenceConfig) -> Result<PersistReport> {
        let run = self.require_run(run_id)?;
        let extraction = self
            .latest_extraction(run_id, ExtractionKind::SessionFacts)?
            .ok_or_else(|| {
                KernelError::MissingInput(format!("no session_facts extraction recorded for run {run_id}"))
            })?;
        let facts: SessionFacts = serde_json::from_value(extraction.payload)
            .context("failed to decode stored session_facts payload")?;
        let utterances = self.list_utterances(&run.session_id)?;
        if utterances.is_empty() {
            return Err(KernelError::MissingInput(format!(
                "no utterances ingested for session {}",
                run.session_id
            ))
            .into());
        }

        let grounded = ground_session_facts(&facts, &utterances, config);
        let mut report = PersistReport {
            run_id: run.run_id.clone(),
            session_id: run.session_id.clone(),
            mentions: grounded.mentions.len(),
            scenes: grounded.scenes.len(),
            events: grounded.events.len(),
            threads: 0,
            thread_updates: 0,
            quotes: grounded.quotes.len(),
            threads_skipped: 0,
            campaign_threads_created: 0,
            evidence: grounded.report,
        };

        let tx = self.conn.transaction().context("failed to start persist transaction")?;
        delete_run_links(&tx, run_id)?;
        delete_run_facts(&tx, run_id)?;

        for (ordinal, mention) in grounded.mentions.iter().enumerate() {
            tx.execute(
                "INSERT INTO mentions(
                    mention_id, run_id, session_id, ordinal, text, entity_type, description,
                    evidence_json, confidence
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    MentionId::new().to_string(),
                    run.run_id,
                    run.session_id,
                    ordinal_value(ordinal),
                    mention.text,
                    mention.entity_type.as_str(),
                    mention.description,
                    to_json(&mention.evidence)?,
                    mention.confidence,
                ],
            )
            .context("failed to insert mention")?;
        }

        for (ordinal, scene) in grounded.scenes.iter().enumerate() {
            tx.execute(
                "INSERT INTO scenes(
                    scene_id, run_id, session_id, ordinal, title, start_ms, end_ms, summary,
                    location, participants_json, evidence_json, confidence
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    SceneId::new().to_string(),
                    run.run_id,
                    run.session_id,
                    ordinal_value(ordinal),
                    scene.title,
                    scene.start_ms,
                    scene.end_ms,
                    scene.summary,
                    scene.location,
                    to_json(&scene.participants)?,
                    to_json(&scene.evidence)?,
                    scene.confidence,
                ],
            )
            .context("failed to insert scene")?;
        }

        let mut event_ids = Vec::with_capacity(grounded.events.len());
        for (ordinal, event) in grounded.events.iter().enumerate() {
            let event_id = EventId::new();
            tx.execute(
                "INSERT INTO events(
                    event_id, run_id, session_id, ordinal, event_type, start_ms, end_ms, summary,
                    entities_json, evidence_json, confidence
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event_id.to_string(),
                    run.run_id,
                    run.session_id,
                    ordinal_value(ordinal),
                    event.event_type.as_str(),
                    event.start_ms,
                    event.end_ms,
                    event.summary,
                    to_json(&event.entities)?,
                    to_json(&event.evidence)?,
                    event.confidence,
                ],
            )
            .context("failed to insert event")?;
            event_ids.push(event_id);
        }

        for (ordinal, thread) in grounded.threads.iter().enumerate() {
            let title_key = normalize_key(&thread.title);
            if title_key.is_empty() {
                tracing::debug!(run_id, ordinal, "skipping thread with blank title");
                report.threads_skipped += 1;
                continue;
            }
            let (campaign_thread_id, created) =
                upsert_campaign_thread(&tx, &run.campaign_id, &title_key, thread)?;
            if created {
                report.campaign_threads_created += 1;
            }

            let thread_id = ThreadId::new();
            tx.execute(
                "INSERT INTO threads(
                    thread_id, run_id, session_id, ordinal, campaign_thread_id, title, kind,
                    status, summary, entities_json, evidence_json, confidence
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    thread_id.to_string(),
                    run.run_id,
                    run.session_id,
                    ordinal_value(ordinal),
                    campaign_thread_id.to_string(),
                    thread.title,
                    thread.kind.as_str(),
                    thread.status.as_str(),
                    thread.summary,
                    to_json(&thread.entities)?,
                    to_json(&thread.evidence)?,
                    thread.confidence,
                ],
            )
            .context("failed to insert thread")?;
            report.threads += 1;

            for (update_ordinal, update) in thread.updates.iter().enumerate() {
                let related = update
                    .related_event_indexes
                    .iter()
                    .filter_map(|index| event_ids.get(*index).copied())
                    .collect::<Vec<_>>();
                tx.execute(
                    "INSERT INTO thread_updates(
                        update_id, thread_id, ordinal, update_type, note, evidence_json,
                        related_event_ids_json
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        ThreadUpdateId::new().to_string(),
                        thread_id.to_string(),
                        ordinal_value(update_ordinal),
                        update.update_type,
                        update.note,
                        to_json(&update.evidence)?,
                        to_json(&related)?,
                    ],
                )
                .context("failed to insert thread update")?;
                report.thread_updates += 1;
            }
        }

        for (ordinal, quote) in grounded.quotes.iter().enumerate() {
            tx.execute(
                "INSERT INTO quotes(
                    quote_id, run_id, session_id, ordinal, utterance_id, char_start, char_end,
                    speaker, note, clean_text
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    QuoteId::new().to_string(),
                    run.run_id,
                    run.session_id,
                    ordinal_value(ordinal),
                    quote.utterance_id,
                    quote.char_start,
                    quote.char_end,
                    quote.speaker,
                    quote.note,
                    quote.clean_text,
                ],
            )
            .context("failed to insert quote")?;
        }

        let metrics = serde_json::to_value(&report).context("failed to serialize persist report")?;
        insert_extraction(&tx, &run, ExtractionKind::PersistMetrics, &metrics)?;
        set_run_status(&tx, run_id, RunStatus::Persisted)?;
        tx.commit().context("failed to commit persist transaction")?;

        tracing::info!(
            run_id,
            mentions = report.mentions,
            scenes = report.scenes,
            events = report.events,
            threads = report.threads,
            quotes = report.quotes,
            spans_dropped = report.evidence.spans_dropped,
            mentions_dropped = report.evidence.mentions_dropped,
            "persisted run facts"
        );
        Ok(report)
    }

    /// Resolve the run's mentions to campaign entities and rebuild its link tables.
    ///
    /// # Errors
    /// Returns an error when the run is unknown or was never persisted, or any write fails.
    pub fn resolve_run(&mut self, run_id: &str) -> Result<ResolutionReport> {
        let run = self.require_run(run_id)?;
        if run.status == RunStatus::Created {
            return Err(KernelError::MissingInput(format!("run {run_id} has not been persisted")).into());
        }
        let facts = self.load_run_facts(run_id)?;
        let entities = self.list_entities(&run.campaign_id)?;
        let aliases = self.list_entity_aliases(&run.campaign_id)?;

        let plan = plan_resolution(&ResolutionInput {
            campaign_id: &run.campaign_id,
            run_id,
            entities: &entities,
            aliases: &aliases,
            mentions: &facts.mentions,
            scenes: &facts.scenes,
            events: &facts.events,
            threads: &facts.threads,
            now: OffsetDateTime::now_utc(),
        });

        let tx = self.conn.transaction().context("failed to start resolve transaction")?;
        delete_run_links(&tx, run_id)?;

        for entity in &plan.new_entities {
            tx.execute(
                "INSERT INTO entities(
                    entity_id, campaign_id, entity_type, canonical_name, name_key, description, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity.entity_id.to_string(),
                    entity.campaign_id,
                    entity.entity_type.as_str(),
                    entity.canonical_name,
                    normalize_key(&entity.canonical_name),
                    entity.description,
                    rfc3339(entity.created_at)?,
                ],
            )
            .context("failed to insert entity")?;
        }
        for alias in &plan.new_aliases {
            tx.execute(
                "INSERT OR IGNORE INTO entity_aliases(entity_id, alias, created_at) VALUES (?1, ?2, ?3)",
                params![alias.entity_id.to_string(), alias.alias, rfc3339(alias.created_at)?],
            )
            .context("failed to insert entity alias")?;
        }
        for (mention_id, entity_id) in &plan.entity_mentions {
            tx.execute(
                "INSERT INTO entity_mentions(mention_id, entity_id, run_id) VALUES (?1, ?2, ?3)",
                params![mention_id.to_string(), entity_id.to_string(), run_id],
            )
            .context("failed to insert entity mention")?;
        }
        for link in &plan.links {
            let (table, column) = link_table(link.fact_type);
            tx.execute(
                &format!(
                    "INSERT INTO {table}({column}, entity_id, run_id, role, evidence_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    link.fact_id,
                    link.entity_id.to_string(),
                    run_id,
                    link.role.as_str(),
                    to_json(&link.evidence)?,
                ],
            )
            .with_context(|| format!("failed to insert {table} link"))?;
        }

        let metrics = serde_json::to_value(plan.report).context("failed to serialize resolution report")?;
        insert_extraction(&tx, &run, ExtractionKind::ResolveMetrics, &metrics)?;
        set_run_status(&tx, run_id, RunStatus::Resolved)?;
        tx.commit().context("failed to commit resolve transaction")?;

        tracing::info!(
            run_id,
            entities_created = plan.report.entities_created,
            mentions_linked = plan.report.mentions_linked,
            aliases_added = plan.report.aliases_added,
            event_links = plan.report.event_links,
            scene_links = plan.report.scene_links,
            thread_links = plan.report.thread_links,
            "resolved run entities"
        );
        Ok(plan.report)
    }

    // Base reads.

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entities(&self, campaign_id: &str) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, campaign_id, entity_type, canonical_name, description, created_at
             FROM entities WHERE campaign_id = ?1
             ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![campaign_id])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            let entity_type_raw: String = row.get(2)?;
            entities.push(EntityRecord {
                entity_id: EntityId::parse(&row.get::<_, String>(0)?)?,
                campaign_id: row.get(1)?,
                entity_type: parse_entity_type(&entity_type_raw)?,
                canonical_name: row.get(3)?,
                description: row.get(4)?,
                created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            });
        }
        Ok(entities)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entity_aliases(&self, campaign_id: &str) -> Result<Vec<EntityAliasRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.entity_id, a.alias, a.created_at
             FROM entity_aliases a JOIN entities e ON e.entity_id = a.entity_id
             WHERE e.campaign_id = ?1
             ORDER BY a.rowid ASC",
        )?;
        let mut rows = stmt.query(params![campaign_id])?;
        let mut aliases = Vec::new();
        while let Some(row) = rows.next()? {
            aliases.push(EntityAliasRecord {
                entity_id: EntityId::parse(&row.get::<_, String>(0)?)?,
                alias: row.get(1)?,
                created_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
            });
        }
        Ok(aliases)
    }

    /// Persisted facts of one run in extraction order, without any overlay applied.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_run_facts(&self, run_id: &str) -> Result<FactsView> {
        Ok(FactsView {
            mentions: self.load_mentions(run_id)?,
            scenes: self.load_scenes(run_id)?,
            events: self.load_events(run_id)?,
            threads: self.load_threads("t.run_id = ?1", run_id)?,
            quotes: self.load_quotes(run_id)?,
        })
    }

    fn load_mentions(&self, run_id: &str) -> Result<Vec<MentionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.mention_id, m.run_id, m.session_id, em.entity_id, m.text, m.entity_type,
                    m.description, m.evidence_json, m.confidence
             FROM mentions m LEFT JOIN entity_mentions em ON em.mention_id = m.mention_id
             WHERE m.run_id = ?1
             ORDER BY m.ordinal ASC",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut mentions = Vec::new();
        while let Some(row) = rows.next()? {
            let entity_id = row
                .get::<_, Option<String>>(3)?
                .map(|raw| EntityId::parse(&raw))
                .transpose()?;
            let entity_type_raw: String = row.get(5)?;
            mentions.push(MentionRecord {
                mention_id: MentionId::parse(&row.get::<_, String>(0)?)?,
                run_id: row.get(1)?,
                session_id: row.get(2)?,
                entity_id,
                text: row.get(4)?,
                entity_type: parse_entity_type(&entity_type_raw)?,
                description: row.get(6)?,
                evidence: parse_json(&row.get::<_, String>(7)?, "mention evidence")?,
                confidence: row.get(8)?,
            });
        }
        Ok(mentions)
    }

    fn load_scenes(&self, run_id: &str) -> Result<Vec<SceneRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT scene_id, run_id, session_id, title, start_ms, end_ms, summary, location,
                    participants_json, evidence_json, confidence
             FROM scenes WHERE run_id = ?1 ORDER BY ordinal ASC",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut scenes = Vec::new();
        while let Some(row) = rows.next()? {
            scenes.push(SceneRecord {
                scene_id: SceneId::parse(&row.get::<_, String>(0)?)?,
                run_id: row.get(1)?,
                session_id: row.get(2)?,
                title: row.get(3)?,
                start_ms: row.get(4)?,
                end_ms: row.get(5)?,
                summary: row.get(6)?,
                location: row.get(7)?,
                participants: parse_json(&row.get::<_, String>(8)?, "scene participants")?,
                evidence: parse_json(&row.get::<_, String>(9)?, "scene evidence")?,
                confidence: row.get(10)?,
            });
        }
        Ok(scenes)
    }

    fn load_events(&self, run_id: &str) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, run_id, session_id, event_type, start_ms, end_ms, summary,
                    entities_json, evidence_json, confidence
             FROM events WHERE run_id = ?1 ORDER BY ordinal ASC",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let event_type_raw: String = row.get(3)?;
            events.push(EventRecord {
                event_id: EventId::parse(&row.get::<_, String>(0)?)?,
                run_id: row.get(1)?,
                session_id: row.get(2)?,
                event_type: EventType::parse(&event_type_raw)
                    .ok_or_else(|| anyhow!("unknown event_type: {event_type_raw}"))?,
                start_ms: row.get(4)?,
                end_ms: row.get(5)?,
                summary: row.get(6)?,
                entities: parse_json(&row.get::<_, String>(7)?, "event entities")?,
                evidence: parse_json(&row.get::<_, String>(8)?, "event evidence")?,
                confidence: row.get(9)?,
            });
        }
        Ok(events)
    }

    /// Thread rows matching `filter` (a predicate over alias `t` bound to `?1`), with updates.
    fn load_threads(&self, filter: &str, value: &str) -> Result<Vec<ThreadRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT t.thread_id, t.run_id, t.session_id, t.campaign_thread_id, t.title, t.kind,
                    t.status, t.summary, t.entities_json, t.evidence_json, t.confidence
             FROM threads t JOIN runs r ON r.run_id = t.run_id
             WHERE {filter}
             ORDER BY r.rowid ASC, t.ordinal ASC"
        ))?;
        let mut rows = stmt.query(params![value])?;
        let mut threads = Vec::new();
        while let Some(row) = rows.next()? {
            let thread_id = ThreadId::parse(&row.get::<_, String>(0)?)?;
            let kind_raw: String = row.get(5)?;
            let status_raw: String = row.get(6)?;
            threads.push(ThreadRecord {
                thread_id,
                run_id: row.get(1)?,
                session_id: row.get(2)?,
                campaign_thread_id: CampaignThreadId::parse(&row.get::<_, String>(3)?)?,
                title: row.get(4)?,
                kind: parse_thread_kind(&kind_raw)?,
                status: parse_thread_status(&status_raw)?,
                summary: row.get(7)?,
                entities: parse_json(&row.get::<_, String>(8)?, "thread entities")?,
                evidence: parse_json(&row.get::<_, String>(9)?, "thread evidence")?,
                confidence: row.get(10)?,
                updates: self.load_thread_updates(thread_id)?,
            });
        }
        Ok(threads)
    }

    fn load_thread_updates(&self, thread_id: ThreadId) -> Result<Vec<ThreadUpdateRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT update_id, update_type, note, evidence_json, related_event_ids_json
             FROM thread_updates WHERE thread_id = ?1 ORDER BY ordinal ASC",
        )?;
        let mut rows = stmt.query(params![thread_id.to_string()])?;
        let mut updates = Vec::new();
        while let Some(row) = rows.next()? {
            updates.push(ThreadUpdateRecord {
                update_id: ThreadUpdateId::parse(&row.get::<_, String>(0)?)?,
                thread_id,
                update_type: row.get(1)?,
                note: row.get(2)?,
                evidence: parse_json(&row.get::<_, String>(3)?, "thread update evidence")?,
                related_event_ids: parse_json(&row.get::<_, String>(4)?, "related event ids")?,
            });
        }
        Ok(updates)
    }

    fn load_quotes(&self, run_id: &str) -> Result<Vec<QuoteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT quote_id, run_id, session_id, utterance_id, char_start, char_end, speaker,
                    note, clean_text
             FROM quotes WHERE run_id = ?1 ORDER BY ordinal ASC",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut quotes = Vec::new();
        while let Some(row) = rows.next()? {
            quotes.push(QuoteRecord {
                quote_id: QuoteId::parse(&row.get::<_, String>(0)?)?,
                run_id: row.get(1)?,
                session_id: row.get(2)?,
                utterance_id: row.get(3)?,
                char_start: row.get(4)?,
                char_end: row.get(5)?,
                speaker: row.get(6)?,
                note: row.get(7)?,
                clean_text: row.get(8)?,
            });
        }
        Ok(quotes)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_campaign_threads(&self, campaign_id: &str) -> Result<Vec<CampaignThreadRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT campaign_thread_id, campaign_id, title_key, title, kind, status, summary
             FROM campaign_threads WHERE campaign_id = ?1 ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![campaign_id])?;
        let mut threads = Vec::new();
        while let Some(row) = rows.next()? {
            let kind_raw: String = row.get(4)?;
            let status_raw: String = row.get(5)?;
            threads.push(CampaignThreadRecord {
                campaign_thread_id: CampaignThreadId::parse(&row.get::<_, String>(0)?)?,
                campaign_id: row.get(1)?,
                title_key: row.get(2)?,
                title: row.get(3)?,
                kind: parse_thread_kind(&kind_raw)?,
                status: parse_thread_status(&status_raw)?,
                summary: row.get(6)?,
            });
        }
        Ok(threads)
    }

    /// Link rows for a campaign, optionally limited to one run, without overlays.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entity_links(
        &self,
        campaign_id: &str,
        run_id: Option<&str>,
    ) -> Result<Vec<EntityLinkRecord>> {
        let mut links = Vec::new();
        for fact_type in [FactType::Event, FactType::Scene, FactType::Thread] {
            let (table, column) = link_table(fact_type);
            let mut stmt = self.conn.prepare(&format!(
                "SELECT l.{column}, l.entity_id, l.run_id, l.role, l.evidence_json
                 FROM {table} l JOIN runs r ON r.run_id = l.run_id
                 WHERE r.campaign_id = ?1 AND (?2 IS NULL OR l.run_id = ?2)
                 ORDER BY l.run_id ASC, l.{column} ASC, l.entity_id ASC"
            ))?;
            let mut rows = stmt.query(params![campaign_id, run_id])?;
            while let Some(row) = rows.next()? {
                let role_raw: String = row.get(3)?;
                links.push(EntityLinkRecord {
                    fact_type,
                    fact_id: row.get(0)?,
                    entity_id: EntityId::parse(&row.get::<_, String>(1)?)?,
                    run_id: row.get(2)?,
                    role: LinkRole::parse(&role_raw)
                        .ok_or_else(|| anyhow!("unknown link role: {role_raw}"))?,
                    evidence: parse_json(&row.get::<_, String>(4)?, "link evidence")?,
                });
            }
        }
        Ok(links)
    }

    // Correction ledger.

    /// Validate and append one ledger row. Rows are never updated or deleted.
    ///
    /// # Errors
    /// Returns an error when the action or payload is invalid for the target type, the
    /// session does not belong to the campaign, or the insert fails.
    pub fn append_correction(&mut self, correction: &NewCorrection) -> Result<CorrectionRecord> {
        if correction.target_id.trim().is_empty() {
            return Err(KernelError::Validation("target_id MUST be provided".to_string()).into());
        }
        let action =
            CorrectionAction::parse(correction.target_type, &correction.action, &correction.payload)?;
        self.require_campaign(&correction.campaign_id)?;
        if let Some(session_id) = &correction.session_id {
            let session = self
                .get_session(session_id)?
                .ok_or_else(|| anyhow!("unknown session: {session_id}"))?;
            if session.campaign_id != correction.campaign_id {
                return Err(KernelError::Validation(format!(
                    "session {session_id} does not belong to campaign {}",
                    correction.campaign_id
                ))
                .into());
            }
        }

        // Read and insert under one write lock: created_at strictly increases in append order.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin correction append")?;
        let mut created_at = OffsetDateTime::now_utc();
        if let Some(latest) = latest_correction_time(&tx, &correction.campaign_id)? {
            if created_at <= latest {
                created_at = latest + time::Duration::microseconds(1);
            }
        }

        let record = CorrectionRecord {
            correction_id: CorrectionId::new(),
            campaign_id: correction.campaign_id.clone(),
            session_id: correction.session_id.clone(),
            target_type: correction.target_type,
            target_id: correction.target_id.trim().to_string(),
            action: correction.action.clone(),
            payload: correction.payload.clone(),
            created_by: correction.created_by.clone(),
            created_at,
        };
        tx.execute(
            "INSERT INTO corrections(
                correction_id, campaign_id, session_id, target_type, target_id, action,
                payload_json, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.correction_id.to_string(),
                record.campaign_id,
                record.session_id,
                record.target_type.as_str(),
                record.target_id,
                record.action,
                to_json(&record.payload)?,
                record.created_by,
                rfc3339(record.created_at)?,
            ],
        )
        .context("failed to append correction")?;
        tx.commit().context("failed to commit correction append")?;
        tracing::info!(
            correction_id = %record.correction_id,
            target_type = %record.target_type,
            action = action.name(),
            "appended correction"
        );
        Ok(record)
    }

    /// Ledger rows in scope, in fold order `(created_at, correction_id)`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_corrections(&self, scope: &CorrectionScope) -> Result<Vec<CorrectionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT correction_id, campaign_id, session_id, target_type, target_id, action,
                    payload_json, created_by, created_at
             FROM corrections
             WHERE campaign_id = ?1 AND (session_id IS NULL OR session_id = ?2)",
        )?;
        let mut rows = stmt.query(params![scope.campaign_id, scope.session_id])?;
        let mut corrections = Vec::new();
        while let Some(row) = rows.next()? {
            let target_type_raw: String = row.get(3)?;
            corrections.push(CorrectionRecord {
                correction_id: CorrectionId::parse(&row.get::<_, String>(0)?)?,
                campaign_id: row.get(1)?,
                session_id: row.get(2)?,
                target_type: TargetType::parse(&target_type_raw)
                    .ok_or_else(|| anyhow!("unknown target_type: {target_type_raw}"))?,
                target_id: row.get(4)?,
                action: row.get(5)?,
                payload: parse_json(&row.get::<_, String>(6)?, "correction payload")?,
                created_by: row.get(7)?,
                created_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
            });
        }
        corrections.retain(|correction| scope.includes(correction));
        corrections.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.correction_id.cmp(&right.correction_id))
        });
        Ok(corrections)
    }

    /// SHA-256 over the scoped ledger rows; changes whenever a projection could change.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or serialized.
    pub fn ledger_fingerprint(&self, scope: &CorrectionScope) -> Result<String> {
        let corrections = self.list_corrections(scope)?;
        Ok(json_fingerprint(&corrections)?)
    }

    // Overlay states.

    /// # Errors
    /// Returns an error when base rows or ledger rows cannot be read.
    pub fn entity_correction_state(&self, scope: &CorrectionScope) -> Result<EntityCorrectionState> {
        let corrections = self.list_corrections(scope)?;
        let entities = self.list_entities(&scope.campaign_id)?;
        let aliases = self.list_entity_aliases(&scope.campaign_id)?;
        Ok(load_entity_correction_state(&entities, &aliases, &corrections))
    }

    /// # Errors
    /// Returns an error when base rows or ledger rows cannot be read.
    pub fn thread_correction_state(&self, scope: &CorrectionScope) -> Result<ThreadCorrectionState> {
        let corrections = self.list_corrections(scope)?;
        let campaign_threads = self.list_campaign_threads(&scope.campaign_id)?;
        let threads = self.load_threads("r.campaign_id = ?1", &scope.campaign_id)?;
        Ok(load_thread_correction_state(&campaign_threads, &threads, &corrections))
    }

    /// # Errors
    /// Returns an error when ledger rows cannot be read.
    pub fn redaction_state(&self, scope: &CorrectionScope) -> Result<RedactionState> {
        Ok(load_redaction_state(&self.list_corrections(scope)?))
    }

    /// # Errors
    /// Returns an error when ledger rows cannot be read.
    pub fn spoiler_state(&self, scope: &CorrectionScope) -> Result<SpoilerState> {
        Ok(load_spoiler_state(&self.list_corrections(scope)?))
    }

    /// Spoiler cutoff for `role`: the scoped session's number, or the campaign's latest.
    ///
    /// # Errors
    /// Returns an error when session rows cannot be read.
    pub fn viewer_cutoff(&self, scope: &CorrectionScope, role: ViewerRole) -> Result<Option<i64>> {
        if role == ViewerRole::Dm {
            return Ok(None);
        }
        let session_number = match &scope.session_id {
            Some(session_id) => self.get_session(session_id)?.and_then(|session| session.session_number),
            None => self
                .conn
                .query_row(
                    "SELECT MAX(session_number) FROM sessions WHERE campaign_id = ?1",
                    params![scope.campaign_id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .context("failed to read latest session number")?,
        };
        Ok(spoiler_cutoff(role, session_number))
    }

    fn overlay_context(&self, scope: &CorrectionScope, role: ViewerRole) -> Result<OverlayContext> {
        let corrections = self.list_corrections(scope)?;
        Ok(OverlayContext {
            entities: self.list_entities(&scope.campaign_id)?,
            aliases: self.list_entity_aliases(&scope.campaign_id)?,
            redaction: load_redaction_state(&corrections),
            spoilers: load_spoiler_state(&corrections),
            cutoff: self.viewer_cutoff(scope, role)?,
            corrections,
        })
    }

    /// Latest persisted run of each session in scope, in run creation order.
    fn active_run_ids(&self, scope: &CorrectionScope) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, session_id FROM runs
             WHERE campaign_id = ?1 AND (?2 IS NULL OR session_id = ?2) AND status != 'created'
             ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query(params![scope.campaign_id, scope.session_id])?;
        let mut latest_by_session: BTreeMap<String, (usize, String)> = BTreeMap::new();
        let mut position = 0_usize;
        while let Some(row) = rows.next()? {
            let run_id: String = row.get(0)?;
            let session_id: String = row.get(1)?;
            latest_by_session.insert(session_id, (position, run_id));
            position += 1;
        }
        let mut runs = latest_by_session.into_values().collect::<Vec<_>>();
        runs.sort();
        Ok(runs.into_iter().map(|(_, run_id)| run_id).collect())
    }

    // Read views.

    /// Entities as `role` sees them in `scope`.
    ///
    /// # Errors
    /// Returns an error when any underlying read fails.
    pub fn entity_views(&self, scope: &CorrectionScope, role: ViewerRole) -> Result<Vec<EntityView>> {
        let context = self.overlay_context(scope, role)?;
        let state = load_entity_correction_state(&context.entities, &context.aliases, &context.corrections);
        Ok(visible_entities(&context.entities, &context.aliases, &state, &context.spoilers, context.cutoff))
    }

    /// Canonical threads with their current session instances, overrides applied.
    ///
    /// # Errors
    /// Returns an error when any underlying read fails.
    pub fn thread_views(&self, scope: &CorrectionScope, role: ViewerRole) -> Result<Vec<ThreadView>> {
        let context = self.overlay_context(scope, role)?;
        let campaign_threads = self.list_campaign_threads(&scope.campaign_id)?;
        let all_threads = self.load_threads("r.campaign_id = ?1", &scope.campaign_id)?;
        let state = load_thread_correction_state(&campaign_threads, &all_threads, &context.corrections);

        let active = self.active_run_ids(scope)?;
        let current = all_threads
            .into_iter()
            .filter(|thread| active.contains(&thread.run_id))
            .collect::<Vec<_>>();
        let mut views =
            visible_threads(&campaign_threads, &current, &state, &context.spoilers, context.cutoff);
        views.retain(|view| !view.thread_ids.is_empty());
        Ok(views)
    }

    /// Quotes from the current run of each session in scope, redaction and spoilers applied.
    ///
    /// # Errors
    /// Returns an error when any underlying read fails.
    pub fn quote_views(&self, scope: &CorrectionScope, role: ViewerRole) -> Result<Vec<QuoteRecord>> {
        let context = self.overlay_context(scope, role)?;
        let mut quotes = Vec::new();
        for run_id in self.active_run_ids(scope)? {
            quotes.extend(self.load_quotes(&run_id)?);
        }
        Ok(visible_quotes(&quotes, &context.redaction, &context.spoilers, context.cutoff))
    }

    /// One run's facts relabeled through every overlay in the run's session scope.
    ///
    /// # Errors
    /// Returns an error when the run is unknown or any underlying read fails.
    pub fn facts_view(&self, run_id: &str, role: ViewerRole) -> Result<FactsView> {
        let run = self.require_run(run_id)?;
        let scope = CorrectionScope { campaign_id: run.campaign_id, session_id: Some(run.session_id) };
        let context = self.overlay_context(&scope, role)?;
        let entity_state =
            load_entity_correction_state(&context.entities, &context.aliases, &context.corrections);
        let campaign_threads = self.list_campaign_threads(&scope.campaign_id)?;
        let all_threads = self.load_threads("r.campaign_id = ?1", &scope.campaign_id)?;
        let thread_state =
            load_thread_correction_state(&campaign_threads, &all_threads, &context.corrections);

        let mut facts = self.load_run_facts(run_id)?;
        apply_entity_spoilers(&mut facts, &entity_state, &context.spoilers, context.cutoff);
        apply_entity_corrections(&mut facts, &entity_state);

        let overrides = campaign_threads
            .iter()
            .map(|record| (record.campaign_thread_id, record))
            .collect::<BTreeMap<_, _>>();
        facts.threads.retain_mut(|thread| {
            let resolved = thread_state.resolve_id(thread.campaign_thread_id);
            if thread_state.hidden.contains(&resolved)
                || context.spoilers.is_hidden(TargetType::Thread, &thread.thread_id.to_string(), context.cutoff)
                || context.spoilers.is_hidden(TargetType::Thread, &resolved.to_string(), context.cutoff)
            {
                return false;
            }
            thread.campaign_thread_id = resolved;
            if let Some(base) = overrides.get(&resolved) {
                thread.title.clone_from(&base.title);
            }
            if let Some(edit) = thread_state.overrides.get(&resolved) {
                if let Some(title) = &edit.title {
                    thread.title.clone_from(title);
                }
                if let Some(status) = edit.status {
                    thread.status = status;
                }
                if let Some(summary) = &edit.summary {
                    thread.summary.clone_from(summary);
                }
            }
            true
        });

        apply_redactions(&mut facts, &context.redaction);
        facts.quotes = visible_quotes(&facts.quotes, &context.redaction, &context.spoilers, context.cutoff);
        Ok(facts)
    }

    /// Entity links relabeled through merges, optionally limited to one run.
    ///
    /// # Errors
    /// Returns an error when any underlying read fails.
    pub fn entity_link_views(
        &self,
        scope: &CorrectionScope,
        role: ViewerRole,
        run_id: Option<&str>,
    ) -> Result<Vec<EntityLinkRecord>> {
        let context = self.overlay_context(scope, role)?;
        let state = load_entity_correction_state(&context.entities, &context.aliases, &context.corrections);
        let links = self.list_entity_links(&scope.campaign_id, run_id)?;
        Ok(visible_entity_links(&links, &state, &context.redaction, &context.spoilers, context.cutoff))
    }

    /// Lexical search over the scope's utterances.
    ///
    /// # Errors
    /// Returns an error when any underlying read fails.
    pub fn search(
        &self,
        scope: &CorrectionScope,
        role: ViewerRole,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let context = self.overlay_context(scope, role)?;
        let utterances = match &scope.session_id {
            Some(session_id) => self.list_utterances(session_id)?,
            None => self.list_campaign_utterances(&scope.campaign_id)?,
        };
        Ok(search_utterances(&utterances, query, &context.redaction, &context.spoilers, context.cutoff, limit))
    }

    fn require_campaign(&self, campaign_id: &str) -> Result<()> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM campaigns WHERE campaign_id = ?1)",
                params![campaign_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to look up campaign")?;
        if exists == 1 {
            Ok(())
        } else {
            Err(anyhow!("unknown campaign: {campaign_id}"))
        }
    }

    fn require_run(&self, run_id: &str) -> Result<RunRecord> {
        self.get_run(run_id)?.ok_or_else(|| anyhow!("unknown run: {run_id}"))
    }
}

fn upsert_campaign_thread(
    tx: &Transaction<'_>,
    campaign_id: &str,
    title_key: &str,
    thread: &lore_kernel_core::ThreadCandidate,
) -> Result<(CampaignThreadId, bool)> {
    let existing = tx
        .query_row(
            "SELECT campaign_thread_id FROM campaign_threads WHERE campaign_id = ?1 AND title_key = ?2",
            params![campaign_id, title_key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to look up campaign thread")?;

    if let Some(raw) = existing {
        let campaign_thread_id = CampaignThreadId::parse(&raw)?;
        tx.execute(
            "UPDATE campaign_threads SET kind = ?1, status = ?2, summary = ?3 WHERE campaign_thread_id = ?4",
            params![thread.kind.as_str(), thread.status.as_str(), thread.summary, raw],
        )
        .context("failed to update campaign thread")?;
        return Ok((campaign_thread_id, false));
    }

    let campaign_thread_id = CampaignThreadId::new();
    tx.execute(
        "INSERT INTO campaign_threads(campaign_thread_id, campaign_id, title_key, title, kind, status, summary)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            campaign_thread_id.to_string(),
            campaign_id,
            title_key,
            thread.title,
            thread.kind.as_str(),
            thread.status.as_str(),
            thread.summary,
        ],
    )
    .context("failed to insert campaign thread")?;
    Ok((campaign_thread_id, true))
}

fn delete_run_links(tx: &Transaction<'_>, run_id: &str) -> Result<()> {
    for table in ["event_entities", "scene_entities", "thread_entities", "entity_mentions"] {
        tx.execute(&format!("DELETE FROM {table} WHERE run_id = ?1"), params![run_id])
            .with_context(|| format!("failed to clear {table} for run {run_id}"))?;
    }
    Ok(())
}

fn delete_run_facts(tx: &Transaction<'_>, run_id: &str) -> Result<()> {
    tx.execute(
        "DELETE FROM thread_updates WHERE thread_id IN (SELECT thread_id FROM threads WHERE run_id = ?1)",
        params![run_id],
    )
    .context("failed to clear thread updates")?;
    for table in ["quotes", "threads", "events", "scenes", "mentions"] {
        tx.execute(&format!("DELETE FROM {table} WHERE run_id = ?1"), params![run_id])
            .with_context(|| format!("failed to clear {table} for run {run_id}"))?;
    }
    Ok(())
}

fn insert_extraction(
    conn: &Connection,
    run: &RunRecord,
    kind: ExtractionKind,
    payload: &Value,
) -> Result<ExtractionRecord> {
    let record = ExtractionRecord {
        extraction_id: ExtractionId::new(),
        run_id: run.run_id.clone(),
        session_id: run.session_id.clone(),
        kind,
        payload: payload.clone(),
        created_at: OffsetDateTime::now_utc(),
    };
    conn.execute(
        "INSERT INTO session_extractions(extraction_id, run_id, session_id, kind, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.extraction_id.to_string(),
            record.run_id,
            record.session_id,
            kind.as_str(),
            to_json(payload)?,
            rfc3339(record.created_at)?,
        ],
    )
    .with_context(|| format!("failed to record {kind} extraction"))?;
    Ok(record)
}

fn set_run_status(conn: &Connection, run_id: &str, status: RunStatus) -> Result<()> {
    conn.execute(
        "UPDATE runs SET status = ?1, finished_at = ?2 WHERE run_id = ?3",
        params![status.as_str(), now_rfc3339()?, run_id],
    )
    .with_context(|| format!("failed to mark run {run_id} {status}"))?;
    Ok(())
}

fn latest_correction_time(conn: &Connection, campaign_id: &str) -> Result<Option<OffsetDateTime>> {
    let mut stmt = conn.prepare("SELECT created_at FROM corrections WHERE campaign_id = ?1")?;
    let mut rows = stmt.query(params![campaign_id])?;
    let mut latest: Option<OffsetDateTime> = None;
    while let Some(row) = rows.next()? {
        let created_at = parse_rfc3339(&row.get::<_, String>(0)?)?;
        latest = Some(latest.map_or(created_at, |current| current.max(created_at)));
    }
    Ok(latest)
}

fn link_table(fact_type: FactType) -> (&'static str, &'static str) {
    match fact_type {
        FactType::Event => ("event_entities", "event_id"),
        FactType::Scene => ("scene_entities", "scene_id"),
        FactType::Thread => ("thread_entities", "thread_id"),
    }
}

fn decode_run(row: &rusqlite::Row<'_>) -> Result<RunRecord> {
    let status_raw: String = row.get(3)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        campaign_id: row.get(1)?,
        session_id: row.get(2)?,
        status: RunStatus::parse(&status_raw).ok_or_else(|| anyhow!("unknown run status: {status_raw}"))?,
        created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        finished_at: row.get::<_, Option<String>>(5)?.map(|raw| parse_rfc3339(&raw)).transpose()?,
    })
}

fn decode_utterance(row: &rusqlite::Row<'_>) -> Result<Utterance> {
    Ok(Utterance {
        utterance_id: row.get(0)?,
        session_id: row.get(1)?,
        start_ms: row.get(2)?,
        end_ms: row.get(3)?,
        speaker: row.get(4)?,
        text: row.get(5)?,
    })
}

fn parse_entity_type(raw: &str) -> Result<EntityType> {
    EntityType::parse(raw).ok_or_else(|| anyhow!("unknown entity_type: {raw}"))
}

fn parse_thread_kind(raw: &str) -> Result<ThreadKind> {
    ThreadKind::parse(raw).ok_or_else(|| anyhow!("unknown thread kind: {raw}"))
}

fn parse_thread_status(raw: &str) -> Result<ThreadStatus> {
    ThreadStatus::parse(raw).ok_or_else(|| anyhow!("unknown thread status: {raw}"))
}

fn ordinal_value(ordinal: usize) -> i64 {
    i64::try_from(ordinal).unwrap_or(i64::MAX)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialize json column")
}

fn parse_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to deserialize {what}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }
    if table_exists(conn, "utterances")? {
        return Ok((1, true));
    }
    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use serde_json::json;

    use super::*;

    fn seeded_store() -> Result<(SqliteStore, RunRecord)> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        store.create_campaign("camp", "Shadows of Emberfall")?;
        store.create_session(&NewSession {
            session_id: "s1".to_string(),
            campaign_id: "camp".to_string(),
            session_number: Some(1),
            title: Some("The Cave".to_string()),
        })?;
        store.ingest_utterances(&[
            utterance("u1", "s1", 0, 4_000, "DM", "A goblin emerges from the cave."),
            utterance("u2", "s1", 4_000, 9_000, "Alyx", "I draw my sword and attack the goblin king!"),
            utterance("u3", "s1", 9_000, 15_000, "DM", "The goblin king drops a silver key."),
        ])?;
        let run = store.create_run("s1", Some("run-1"))?;
        store.record_extraction("run-1", ExtractionKind::SessionFacts, &session_facts())?;
        Ok((store, run))
    }

    fn utterance(id: &str, session_id: &str, start_ms: i64, end_ms: i64, speaker: &str, text: &str) -> Utterance {
        Utterance {
            utterance_id: id.to_string(),
            session_id: session_id.to_string(),
            start_ms,
            end_ms,
            speaker: Some(speaker.to_string()),
            text: text.to_string(),
        }
    }

    fn session_facts() -> Value {
        json!({
            "mentions": [
                {"text": "Goblin King", "entity_type": "character",
                 "evidence": [{"utterance_id": "u2", "char_start": 31, "char_end": 99}]},
                {"text": "goblin king", "entity_type": "character", "evidence": []},
                {"text": "Alyx", "entity_type": "character", "evidence": [{"utterance_id": "u2"}]},
                {"text": "Owlbear", "entity_type": "monster", "evidence": []}
            ],
            "scenes": [
                {"start_ms": 0, "end_ms": 9000, "summary": "Ambush at the cave",
                 "participants": ["Alyx", "Goblin King", "Nobody"], "evidence": []}
            ],
            "events": [
                {"event_type": "combat", "start_ms": 4000, "end_ms": 9000, "summary": "Alyx attacks",
                 "entities": ["goblin  king"],
                 "evidence": [{"utterance_id": "u2", "char_start": 0, "char_end": 15}]},
                {"event_type": "loot", "start_ms": 9000, "end_ms": 15000, "summary": "Key dropped",
                 "evidence": [{"utterance_id": "u3"}]}
            ],
            "threads": [
                {"title": "The Silver Key", "kind": "mystery", "status": "active",
                 "updates": [{"update_type": "clue", "note": "Key dropped",
                              "evidence": [{"utterance_id": "u3", "char_start": 4, "char_end": 15}],
                              "related_event_indexes": [1, 7]}]}
            ],
            "quotes": [
                {"utterance_id": "u2", "char_start": 0, "char_end": 43,
                 "clean_text": "I draw my sword and attack the goblin king!"},
                {"utterance_id": "9000-15000", "clean_text": "drops a silver key"}
            ]
        })
    }

    fn campaign_scope() -> CorrectionScope {
        CorrectionScope { campaign_id: "camp".to_string(), session_id: None }
    }

    fn correction(target_type: TargetType, target_id: &str, action: &str, payload: Value) -> NewCorrection {
        NewCorrection {
            campaign_id: "camp".to_string(),
            session_id: None,
            target_type,
            target_id: target_id.to_string(),
            action: action.to_string(),
            payload,
            created_by: Some("dm".to_string()),
        }
    }

    fn link_rows(store: &SqliteStore) -> Result<Vec<(String, String, String)>> {
        let mut rows = store
            .list_entity_links("camp", Some("run-1"))?
            .into_iter()
            .map(|link| (link.fact_id, link.entity_id.to_string(), link.role.as_str().to_string()))
            .collect::<Vec<_>>();
        rows.sort();
        Ok(rows)
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let (store, _) = seeded_store()?;

        let check_result = store.conn.execute(
            "INSERT INTO corrections(
                correction_id, campaign_id, session_id, target_type, target_id, action,
                payload_json, created_by, created_at
            ) VALUES (?1, 'camp', NULL, 'scene', 'x', 'hide', '{}', NULL, '2026-01-01T00:00:00Z')",
            params![CorrectionId::new().to_string()],
        );
        assert!(check_result.is_err());

        let fk_result = store.conn.execute(
            "INSERT INTO utterances(utterance_id, session_id, start_ms, end_ms, speaker, text)
             VALUES ('orphan', 'missing-session', 0, 1, NULL, 'hello')",
            [],
        );
        assert!(fk_result.is_err());

        let range_result = store.conn.execute(
            "INSERT INTO utterances(utterance_id, session_id, start_ms, end_ms, speaker, text)
             VALUES ('backwards', 's1', 10, 1, NULL, 'hello')",
            [],
        );
        assert!(range_result.is_err());
        Ok(())
    }

    #[test]
    fn schema_status_and_integrity_report_clean_database() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        assert!(report.schema_status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn ingest_skips_existing_utterances() -> Result<()> {
        let (mut store, _) = seeded_store()?;
        let summary = store.ingest_utterances(&[
            utterance("u1", "s1", 0, 4_000, "DM", "changed text is ignored"),
            utterance("u4", "s1", 15_000, 16_000, "DM", "Roll initiative."),
        ])?;
        assert_eq!(summary, IngestSummary { inserted: 1, skipped_existing: 1 });

        let utterances = store.list_utterances("s1")?;
        assert_eq!(utterances.len(), 4);
        assert_eq!(utterances[0].text, "A goblin emerges from the cave.");
        Ok(())
    }

    #[test]
    fn record_extraction_rejects_malformed_session_facts() -> Result<()> {
        let (mut store, _) = seeded_store()?;
        let result = store.record_extraction(
            "run-1",
            ExtractionKind::SessionFacts,
            &json!({"mentions": [{"entity_type": "character"}]}),
        );
        assert!(result.is_err());
        assert!(store.record_extraction("missing", ExtractionKind::SessionFacts, &json!({})).is_err());
        Ok(())
    }

    #[test]
    fn persist_run_grounds_and_replaces_facts() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        let report = store.persist_run(&run.run_id, &EvidenceConfig::default())?;

        assert_eq!(report.mentions, 3);
        assert_eq!(report.evidence.mentions_repaired, 1);
        assert_eq!(report.evidence.mentions_dropped, 1);
        assert_eq!(report.evidence.spans_clamped, 1);
        assert_eq!(report.evidence.fallback_spans, 1);
        assert_eq!(report.evidence.threads_inherited, 1);
        assert_eq!(report.quotes, 2);
        assert_eq!(report.campaign_threads_created, 1);

        let facts = store.load_run_facts(&run.run_id)?;
        assert_eq!(facts.mentions[0].evidence[0].char_start, Some(31));
        assert_eq!(facts.mentions[0].evidence[0].char_end, Some(43));
        assert_eq!(facts.scenes[0].evidence[0].utterance_id, "u2");
        assert_eq!(facts.scenes[0].evidence[0].confidence, Some(0.3));

        let thread = &facts.threads[0];
        assert_eq!(thread.evidence, thread.updates[0].evidence);
        assert_eq!(thread.updates[0].related_event_ids, vec![facts.events[1].event_id]);
        assert_eq!(facts.quotes[1].utterance_id, "u3");

        let metrics = store.latest_extraction(&run.run_id, ExtractionKind::PersistMetrics)?;
        assert_eq!(metrics.map(|record| record.payload["mentions"].clone()), Some(json!(3)));
        assert_eq!(store.get_run(&run.run_id)?.map(|run| run.status), Some(RunStatus::Persisted));

        store.persist_run(&run.run_id, &EvidenceConfig::default())?;
        let again = store.load_run_facts(&run.run_id)?;
        assert_eq!(again.mentions.len(), 3);
        assert_eq!(again.threads.len(), 1);
        assert_eq!(again.threads[0].campaign_thread_id, thread.campaign_thread_id);
        assert_eq!(store.list_campaign_threads("camp")?.len(), 1);
        Ok(())
    }

    #[test]
    fn persist_run_reports_fatal_inputs() -> Result<()> {
        let (mut store, _) = seeded_store()?;
        assert!(store.persist_run("missing", &EvidenceConfig::default()).is_err());

        store.create_session(&NewSession {
            session_id: "s2".to_string(),
            campaign_id: "camp".to_string(),
            session_number: Some(2),
            title: None,
        })?;
        let empty = store.create_run("s2", None)?;
        let Err(err) = store.persist_run(&empty.run_id, &EvidenceConfig::default()) else {
            panic!("persist without an extraction should fail");
        };
        assert!(err.to_string().contains("no session_facts extraction"));

        store.record_extraction(&empty.run_id, ExtractionKind::SessionFacts, &json!({}))?;
        let Err(err) = store.persist_run(&empty.run_id, &EvidenceConfig::default()) else {
            panic!("persist without utterances should fail");
        };
        assert!(err.to_string().contains("no utterances"));
        assert!(store.resolve_run(&empty.run_id).is_err());
        Ok(())
    }

    #[test]
    fn resolve_run_is_idempotent() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.persist_run(&run.run_id, &EvidenceConfig::default())?;

        let first = store.resolve_run(&run.run_id)?;
        assert_eq!(first.entities_created, 2);
        assert_eq!(first.mentions_linked, 3);
        assert_eq!(first.event_links, 2);
        assert_eq!(first.scene_links, 2);
        assert_eq!(first.thread_links, 0);
        let links_before = link_rows(&store)?;

        let second = store.resolve_run(&run.run_id)?;
        assert_eq!(second.entities_created, 0);
        assert_eq!(second.mentions_linked, 3);
        assert_eq!(link_rows(&store)?, links_before);
        assert_eq!(store.list_entities("camp")?.len(), 2);

        let facts = store.load_run_facts(&run.run_id)?;
        assert!(facts.mentions.iter().all(|mention| mention.entity_id.is_some()));
        Ok(())
    }

    #[test]
    fn append_correction_validates_rows() -> Result<()> {
        let (mut store, _) = seeded_store()?;
        assert!(store
            .append_correction(&correction(TargetType::Entity, "x", "entity_rename", json!({})))
            .is_err());
        assert!(store.append_correction(&correction(TargetType::Quote, "x", "merge", json!({}))).is_err());
        assert!(store
            .append_correction(&correction(TargetType::Thread, " ", "thread_hide", json!({})))
            .is_err());

        let mut foreign = correction(TargetType::Utterance, "u1", "redact", json!({}));
        foreign.campaign_id = "other".to_string();
        assert!(store.append_correction(&foreign).is_err());

        let first = store.append_correction(&correction(TargetType::Utterance, "u1", "redact", json!({})))?;
        let second = store.append_correction(&correction(TargetType::Utterance, "u1", "unredact", json!({})))?;
        assert!(second.created_at > first.created_at);

        let scope = campaign_scope();
        let fingerprint = store.ledger_fingerprint(&scope)?;
        assert_eq!(store.ledger_fingerprint(&scope)?, fingerprint);
        assert_eq!(
            store.list_corrections(&scope)?.iter().map(|row| row.correction_id).collect::<Vec<_>>(),
            vec![first.correction_id, second.correction_id]
        );
        Ok(())
    }

    #[test]
    fn session_scoped_corrections_apply_only_in_their_session() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.persist_run(&run.run_id, &EvidenceConfig::default())?;
        store.resolve_run(&run.run_id)?;
        let alyx = store
            .list_entities("camp")?
            .into_iter()
            .find(|entity| entity.canonical_name == "Alyx")
            .ok_or_else(|| anyhow!("missing entity"))?;

        let mut scoped = correction(TargetType::Entity, &alyx.entity_id.to_string(), "rename", json!({"name": "Alyxandra"}));
        scoped.session_id = Some("s1".to_string());
        store.append_correction(&scoped)?;

        let session_scope = CorrectionScope { campaign_id: "camp".to_string(), session_id: Some("s1".to_string()) };
        let in_session = store.entity_correction_state(&session_scope)?;
        let campaign_wide = store.entity_correction_state(&campaign_scope())?;
        assert_eq!(in_session.display_name(alyx.entity_id), Some("Alyxandra"));
        assert_eq!(campaign_wide.display_name(alyx.entity_id), Some("Alyx"));

        let facts = store.facts_view(&run.run_id, ViewerRole::Dm)?;
        assert!(facts.mentions.iter().any(|mention| mention.text == "Alyxandra"));
        assert!(facts.scenes[0].participants.contains(&"Alyxandra".to_string()));
        Ok(())
    }

    #[test]
    fn entity_views_follow_merges_and_hides() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.persist_run(&run.run_id, &EvidenceConfig::default())?;
        store.resolve_run(&run.run_id)?;
        let entities = store.list_entities("camp")?;
        let id_of = |name: &str| {
            entities
                .iter()
                .find(|entity| entity.canonical_name.eq_ignore_ascii_case(name))
                .map(|entity| entity.entity_id)
                .ok_or_else(|| anyhow!("missing entity {name}"))
        };
        let (king, alyx) = (id_of("goblin king")?, id_of("alyx")?);

        store.append_correction(&correction(
            TargetType::Entity,
            &king.to_string(),
            "entity_merge",
            json!({"into_id": alyx.to_string()}),
        ))?;
        let views = store.entity_views(&campaign_scope(), ViewerRole::Dm)?;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].entity_id, alyx);
        assert_eq!(views[0].merged_ids, vec![king]);

        let links = store.entity_link_views(&campaign_scope(), ViewerRole::Dm, Some(&run.run_id))?;
        assert!(links.iter().all(|link| link.entity_id == alyx));

        store.append_correction(&correction(TargetType::Entity, &alyx.to_string(), "entity_hide", json!({})))?;
        assert!(store.entity_views(&campaign_scope(), ViewerRole::Dm)?.is_empty());
        assert!(store.facts_view(&run.run_id, ViewerRole::Dm)?.mentions.is_empty());
        Ok(())
    }

    #[test]
    fn hidden_and_merged_threads_leave_listing() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.record_extraction(
            &run.run_id,
            ExtractionKind::SessionFacts,
            &json!({"threads": [
                {"title": "The Silver Key", "evidence": [{"utterance_id": "u3"}]},
                {"title": "Goblin Debts", "evidence": [{"utterance_id": "u1"}]},
                {"title": "Sword Oath", "evidence": [{"utterance_id": "u2"}]}
            ]}),
        )?;
        store.persist_run(&run.run_id, &EvidenceConfig::default())?;
        let threads = store.load_run_facts(&run.run_id)?.threads;

        store.append_correction(&correction(TargetType::Thread, &threads[0].thread_id.to_string(), "thread_hide", json!({})))?;
        store.append_correction(&correction(
            TargetType::Thread,
            &threads[1].thread_id.to_string(),
            "thread_merge",
            json!({"into_id": threads[0].thread_id.to_string()}),
        ))?;
        store.append_correction(&correction(
            TargetType::Thread,
            &threads[2].campaign_thread_id.to_string(),
            "thread_status",
            json!({"status": "completed"}),
        ))?;

        let views = store.thread_views(&campaign_scope(), ViewerRole::Dm)?;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].title, "Sword Oath");
        assert_eq!(views[0].status, ThreadStatus::Completed);

        let facts = store.facts_view(&run.run_id, ViewerRole::Dm)?;
        assert_eq!(facts.threads.len(), 1);
        assert_eq!(facts.threads[0].status, ThreadStatus::Completed);
        Ok(())
    }

    #[test]
    fn redaction_and_spoilers_shape_player_views() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.persist_run(&run.run_id, &EvidenceConfig::default())?;
        store.resolve_run(&run.run_id)?;

        store.append_correction(&correction(TargetType::Utterance, "u2", "redact", json!({})))?;
        store.append_correction(&correction(
            TargetType::Utterance,
            "u3",
            "spoiler_tag",
            json!({"reveal_session_number": 2}),
        ))?;

        let dm_quotes = store.quote_views(&campaign_scope(), ViewerRole::Dm)?;
        assert_eq!(dm_quotes.iter().map(|q| q.utterance_id.as_str()).collect::<Vec<_>>(), vec!["u3"]);
        assert!(store.quote_views(&campaign_scope(), ViewerRole::Player)?.is_empty());

        let hits = store.search(&campaign_scope(), ViewerRole::Player, "goblin king", 10)?;
        assert_eq!(hits.iter().map(|hit| hit.utterance_id.as_str()).collect::<Vec<_>>(), vec!["u1"]);
        let dm_hits = store.search(&campaign_scope(), ViewerRole::Dm, "goblin king", 10)?;
        assert_eq!(dm_hits[0].utterance_id, "u3");

        let facts = store.facts_view(&run.run_id, ViewerRole::Dm)?;
        assert!(facts.scenes[0].evidence.is_empty());
        assert!(facts.mentions.iter().all(|mention| mention.evidence.iter().all(|span| span.utterance_id != "u2")));

        store.create_session(&NewSession {
            session_id: "s2".to_string(),
            campaign_id: "camp".to_string(),
            session_number: Some(2),
            title: None,
        })?;
        assert_eq!(store.viewer_cutoff(&campaign_scope(), ViewerRole::Player)?, Some(2));
        assert_eq!(store.quote_views(&campaign_scope(), ViewerRole::Player)?.len(), 1);
        Ok(())
    }

    #[test]
    fn persist_run_drops_quotes_on_empty_utterances() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.ingest_utterances(&[utterance("u4", "s1", 15_000, 16_000, "Nix", "")])?;
        store.record_extraction(
            &run.run_id,
            ExtractionKind::SessionFacts,
            &json!({"quotes": [
                {"utterance_id": "u4"},
                {"utterance_id": "15000-16000"},
                {"utterance_id": "u3"}
            ]}),
        )?;

        let report = store.persist_run(&run.run_id, &EvidenceConfig::default())?;

        assert_eq!(report.quotes, 1);
        assert_eq!(report.evidence.quotes_dropped, 2);
        let quotes = store.load_run_facts(&run.run_id)?.quotes;
        assert_eq!(quotes[0].utterance_id, "u3");
        assert_eq!((quotes[0].char_start, quotes[0].char_end), (0, 35));
        Ok(())
    }

    #[test]
    fn spoiler_tagged_participants_are_hidden_from_players_only() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.persist_run(&run.run_id, &EvidenceConfig::default())?;
        store.resolve_run(&run.run_id)?;
        let alyx = store
            .list_entities("camp")?
            .into_iter()
            .find(|entity| entity.canonical_name == "Alyx")
            .ok_or_else(|| anyhow!("missing entity"))?;
        store.append_correction(&correction(
            TargetType::Entity,
            &alyx.entity_id.to_string(),
            "spoiler_tag",
            json!({"reveal_session_number": 2}),
        ))?;

        let player = store.facts_view(&run.run_id, ViewerRole::Player)?;
        assert!(!player.scenes[0].participants.contains(&"Alyx".to_string()));
        assert!(player.scenes[0].participants.contains(&"Nobody".to_string()));
        assert!(player.mentions.iter().all(|mention| mention.entity_id != Some(alyx.entity_id)));

        let dm = store.facts_view(&run.run_id, ViewerRole::Dm)?;
        assert!(dm.scenes[0].participants.contains(&"Alyx".to_string()));
        assert!(dm.mentions.iter().any(|mention| mention.entity_id == Some(alyx.entity_id)));

        let player_links = store.entity_link_views(&campaign_scope(), ViewerRole::Player, Some(&run.run_id))?;
        assert!(player_links.iter().all(|link| link.entity_id != alyx.entity_id));
        Ok(())
    }

    #[test]
    fn session_and_campaign_corrections_fold_in_append_order() -> Result<()> {
        let (mut store, run) = seeded_store()?;
        store.persist_run(&run.run_id, &EvidenceConfig::default())?;
        store.resolve_run(&run.run_id)?;
        let alyx = store
            .list_entities("camp")?
            .into_iter()
            .find(|entity| entity.canonical_name == "Alyx")
            .ok_or_else(|| anyhow!("missing entity"))?;
        let rename = |name: &str, session_id: Option<&str>| {
            let mut row = correction(TargetType::Entity, &alyx.entity_id.to_string(), "entity_rename", json!({"name": name}));
            row.session_id = session_id.map(str::to_string);
            row
        };
        let session_scope = CorrectionScope { campaign_id: "camp".to_string(), session_id: Some("s1".to_string()) };

        store.append_correction(&rename("Alyxandra", Some("s1")))?;
        store.append_correction(&rename("Lady Alyx", None))?;
        assert_eq!(store.entity_correction_state(&session_scope)?.display_name(alyx.entity_id), Some("Lady Alyx"));

        store.append_correction(&rename("Alyx the Bold", Some("s1")))?;
        assert_eq!(store.entity_correction_state(&session_scope)?.display_name(alyx.entity_id), Some("Alyx the Bold"));
        assert_eq!(store.entity_correction_state(&campaign_scope())?.display_name(alyx.entity_id), Some("Lady Alyx"));
        Ok(())
    }

    #[test]
    fn concurrent_appends_and_reads_preserve_integrity() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("lorekernel-concurrency-{}.sqlite3", Ulid::new()));
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            init.create_campaign("camp", "Concurrency")?;
        }

        let writer_threads = 4;
        let writes_per_thread = 15;
        let mut handles = Vec::new();
        for _ in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&writer_path)?;
                for index in 0..writes_per_thread {
                    store.append_correction(&correction(
                        TargetType::Utterance,
                        &format!("u{index}"),
                        "redact",
                        json!({}),
                    ))?;
                }
                Ok(())
            }));
        }
        for _ in 0..2 {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&reader_path)?;
                for _ in 0..20 {
                    let _ = store.redaction_state(&campaign_scope())?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let ledger = store.list_corrections(&campaign_scope())?;
        assert_eq!(ledger.len(), writer_threads * writes_per_thread);
        assert!(ledger.windows(2).all(|pair| pair[0].created_at < pair[1].created_at));
        assert_eq!(store.redaction_state(&campaign_scope())?.utterance_ids.len(), writes_per_thread);
        assert!(store.integrity_check()?.quick_check_ok);

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
