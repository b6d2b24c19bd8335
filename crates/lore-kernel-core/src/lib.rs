use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod evidence;
pub mod overlay;
pub mod resolve;

pub use evidence::{
    clean_evidence, fallback_by_time, find_mention_span, find_quote_span, ground_session_facts,
    repair_mention, token_similarity, CleanOutcome, EvidenceReport, GroundedFacts, GroundedQuote,
    UtteranceIndex,
};
pub use overlay::{
    apply_entity_corrections, apply_entity_spoilers, apply_redactions, load_entity_correction_state,
    load_redaction_state, load_spoiler_state, load_thread_correction_state, scrub_evidence,
    search_utterances, spoiler_cutoff, visible_entities, visible_entity_links, visible_quotes, visible_threads, CorrectionAction,
    EntityCorrectionState, EntityView, RedactionState, SearchHit, SpoilerState,
    ThreadCorrectionState, ThreadOverride, ThreadView,
};
pub use resolve::{plan_resolution, ResolutionInput, ResolutionPlan, ResolutionReport};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("missing input: {0}")]
    MissingInput(String),
    #[error("query error: {0}")]
    Query(String),
}

macro_rules! ulid_id {
    ($($name:ident),+ $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
            pub struct $name(pub Ulid);

            impl $name {
                #[must_use]
                pub fn new() -> Self {
                    Self(Ulid::new())
                }

                /// Parse the canonical ULID text form.
                ///
                /// # Errors
                /// Returns `KernelError::Validation` when `raw` is not a ULID.
                pub fn parse(raw: &str) -> Result<Self, KernelError> {
                    Ulid::from_string(raw).map(Self).map_err(|err| {
                        KernelError::Validation(format!(
                            "invalid {} `{raw}`: {err}",
                            stringify!($name)
                        ))
                    })
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl Display for $name {
                fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

ulid_id!(
    EntityId,
    MentionId,
    SceneId,
    EventId,
    ThreadId,
    ThreadUpdateId,
    QuoteId,
    CampaignThreadId,
    CorrectionId,
    ExtractionId,
);

macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Character,
    Location,
    Item,
    Faction,
    Monster,
    Deity,
    Organization,
    #[serde(other)]
    Other,
}

str_enum!(EntityType {
    Character => "character",
    Location => "location",
    Item => "item",
    Faction => "faction",
    Monster => "monster",
    Deity => "deity",
    Organization => "organization",
    Other => "other",
});

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Quote,
    #[default]
    Support,
    Mention,
    Other,
}

str_enum!(EvidenceKind {
    Quote => "quote",
    Support => "support",
    Mention => "mention",
    Other => "other",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Combat,
    Social,
    Travel,
    Discovery,
    Loot,
    Economy,
    Relationship,
    ThreadUpdate,
    Rules,
    #[serde(other)]
    Generic,
}

str_enum!(EventType {
    Combat => "combat",
    Social => "social",
    Travel => "travel",
    Discovery => "discovery",
    Loot => "loot",
    Economy => "economy",
    Relationship => "relationship",
    ThreadUpdate => "thread_update",
    Rules => "rules",
    Generic => "generic",
});

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Quest,
    Mystery,
    PersonalArc,
    FactionArc,
    #[default]
    #[serde(other)]
    Other,
}

str_enum!(ThreadKind {
    Quest => "quest",
    Mystery => "mystery",
    PersonalArc => "personal_arc",
    FactionArc => "faction_arc",
    Other => "other",
});

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Proposed,
    Active,
    Blocked,
    Completed,
    Failed,
    Abandoned,
}

str_enum!(ThreadStatus {
    Proposed => "proposed",
    Active => "active",
    Blocked => "blocked",
    Completed => "completed",
    Failed => "failed",
    Abandoned => "abandoned",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Entity,
    Thread,
    Quote,
    Utterance,
}

str_enum!(TargetType {
    Entity => "entity",
    Thread => "thread",
    Quote => "quote",
    Utterance => "utterance",
});

/// How an entity came to be linked to a scene, event or thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    Evidence,
    EntityRef,
    Participant,
}

str_enum!(LinkRole {
    Evidence => "evidence",
    EntityRef => "entity_ref",
    Participant => "participant",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Event,
    Scene,
    Thread,
}

str_enum!(FactType {
    Event => "event",
    Scene => "scene",
    Thread => "thread",
});

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ViewerRole {
    #[default]
    Dm,
    Player,
}

str_enum!(ViewerRole {
    Dm => "dm",
    Player => "player",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    SessionFacts,
    PersistMetrics,
    ResolveMetrics,
}

str_enum!(ExtractionKind {
    SessionFacts => "session_facts",
    PersistMetrics => "persist_metrics",
    ResolveMetrics => "resolve_metrics",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Persisted,
    Resolved,
}

str_enum!(RunStatus {
    Created => "created",
    Persisted => "persisted",
    Resolved => "resolved",
});

/// One immutable transcript line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utterance {
    pub utterance_id: String,
    pub session_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub speaker: Option<String>,
    pub text: String,
}

impl Utterance {
    /// Length of `text` in characters, the unit every evidence offset is measured in.
    #[must_use]
    pub fn char_len(&self) -> i64 {
        i64::try_from(self.text.chars().count()).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceSpan {
    pub utterance_id: String,
    #[serde(default)]
    pub char_start: Option<i64>,
    #[serde(default)]
    pub char_end: Option<i64>,
    #[serde(default)]
    pub kind: EvidenceKind,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl EvidenceSpan {
    #[must_use]
    pub fn whole_utterance(utterance_id: &str, kind: EvidenceKind, confidence: f64) -> Self {
        Self {
            utterance_id: utterance_id.to_string(),
            char_start: None,
            char_end: None,
            kind,
            confidence: Some(confidence),
        }
    }
}

// Extraction payload, as produced upstream for one run.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mention {
    pub text: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceSpan>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scene {
    #[serde(default)]
    pub title: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub summary: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceSpan>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AtomicEvent {
    pub event_type: EventType,
    pub start_ms: i64,
    pub end_ms: i64,
    pub summary: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceSpan>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadUpdate {
    pub update_type: String,
    pub note: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceSpan>,
    /// Indexes into the run's event list.
    #[serde(default)]
    pub related_event_indexes: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadCandidate {
    pub title: String,
    #[serde(default)]
    pub kind: ThreadKind,
    #[serde(default)]
    pub status: ThreadStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub updates: Vec<ThreadUpdate>,
    #[serde(default)]
    pub evidence: Vec<EvidenceSpan>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteCandidate {
    pub utterance_id: String,
    #[serde(default)]
    pub char_start: Option<i64>,
    #[serde(default)]
    pub char_end: Option<i64>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub clean_text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionFacts {
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub events: Vec<AtomicEvent>,
    #[serde(default)]
    pub threads: Vec<ThreadCandidate>,
    #[serde(default)]
    pub quotes: Vec<QuoteCandidate>,
}

// Persisted rows.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub campaign_id: String,
    pub session_number: Option<i64>,
    pub title: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub campaign_id: String,
    pub entity_type: EntityType,
    pub canonical_name: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityAliasRecord {
    pub entity_id: EntityId,
    pub alias: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MentionRecord {
    pub mention_id: MentionId,
    pub run_id: String,
    pub session_id: String,
    pub entity_id: Option<EntityId>,
    pub text: String,
    pub entity_type: EntityType,
    pub description: Option<String>,
    pub evidence: Vec<EvidenceSpan>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneRecord {
    pub scene_id: SceneId,
    pub run_id: String,
    pub session_id: String,
    pub title: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub summary: String,
    pub location: Option<String>,
    pub participants: Vec<String>,
    pub evidence: Vec<EvidenceSpan>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: EventId,
    pub run_id: String,
    pub session_id: String,
    pub event_type: EventType,
    pub start_ms: i64,
    pub end_ms: i64,
    pub summary: String,
    pub entities: Vec<String>,
    pub evidence: Vec<EvidenceSpan>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadUpdateRecord {
    pub update_id: ThreadUpdateId,
    pub thread_id: ThreadId,
    pub update_type: String,
    pub note: String,
    pub evidence: Vec<EvidenceSpan>,
    pub related_event_ids: Vec<EventId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadRecord {
    pub thread_id: ThreadId,
    pub run_id: String,
    pub session_id: String,
    pub campaign_thread_id: CampaignThreadId,
    pub title: String,
    pub kind: ThreadKind,
    pub status: ThreadStatus,
    pub summary: Option<String>,
    pub entities: Vec<String>,
    pub evidence: Vec<EvidenceSpan>,
    pub confidence: Option<f64>,
    pub updates: Vec<ThreadUpdateRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignThreadRecord {
    pub campaign_thread_id: CampaignThreadId,
    pub campaign_id: String,
    pub title_key: String,
    pub title: String,
    pub kind: ThreadKind,
    pub status: ThreadStatus,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuoteRecord {
    pub quote_id: QuoteId,
    pub run_id: String,
    pub session_id: String,
    pub utterance_id: String,
    pub char_start: i64,
    pub char_end: i64,
    pub speaker: Option<String>,
    pub note: Option<String>,
    pub clean_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityLinkRecord {
    pub fact_type: FactType,
    pub fact_id: String,
    pub entity_id: EntityId,
    pub run_id: String,
    pub role: LinkRole,
    pub evidence: Vec<EvidenceSpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionRecord {
    pub correction_id: CorrectionId,
    pub campaign_id: String,
    pub session_id: Option<String>,
    pub target_type: TargetType,
    pub target_id: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub created_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Persisted facts for one run, the shape read paths relabel through the overlays.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FactsView {
    pub mentions: Vec<MentionRecord>,
    pub scenes: Vec<SceneRecord>,
    pub events: Vec<EventRecord>,
    pub threads: Vec<ThreadRecord>,
    pub quotes: Vec<QuoteRecord>,
}

/// Which ledger rows apply: campaign-wide rows always, plus one session's rows when given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectionScope {
    pub campaign_id: String,
    pub session_id: Option<String>,
}

impl CorrectionScope {
    #[must_use]
    pub fn includes(&self, correction: &CorrectionRecord) -> bool {
        if correction.campaign_id != self.campaign_id {
            return false;
        }
        match (&correction.session_id, &self.session_id) {
            (None, _) => true,
            (Some(row_session), Some(scope_session)) => row_session == scope_session,
            (Some(_), None) => false,
        }
    }
}

// Configuration.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvidenceConfig {
    pub fallback_by_time: bool,
    pub fallback_confidence: f64,
    pub repair_mentions: bool,
    pub mention_repair_confidence: f64,
    pub quote_similarity_threshold: f64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            fallback_by_time: true,
            fallback_confidence: 0.3,
            repair_mentions: true,
            mention_repair_confidence: 0.6,
            quote_similarity_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub evidence: EvidenceConfig,
}

impl KernelConfig {
    /// Check that every tunable lies in its allowed range.
    ///
    /// # Errors
    /// Returns `KernelError::Validation` naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), KernelError> {
        for (name, value) in [
            ("evidence.fallback_confidence", self.evidence.fallback_confidence),
            ("evidence.mention_repair_confidence", self.evidence.mention_repair_confidence),
            ("evidence.quote_similarity_threshold", self.evidence.quote_similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(KernelError::Validation(format!(
                    "{name} MUST be within [0.0, 1.0], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Identity key used everywhere names are compared: lowercase with whitespace collapsed.
#[must_use]
pub fn normalize_key(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased alphanumeric terms of at least two characters, deduplicated and sorted.
#[must_use]
pub fn tokenize_terms(value: &str) -> Vec<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '-' || *ch == '\'')
            .collect::<String>()
            .to_lowercase();
        let normalized = normalized.trim_matches(|ch| ch == '-' || ch == '\'').to_string();
        if normalized.chars().count() >= 2 {
            terms.insert(normalized);
        }
    }
    terms.into_iter().collect()
}

/// Hex SHA-256 over the JSON encoding of `value`.
///
/// # Errors
/// Returns `KernelError::Query` when `value` cannot be serialized.
pub fn json_fingerprint<T: Serialize>(value: &T) -> Result<String, KernelError> {
    let bytes = serde_json::to_vec(value).map_err(|err| {
        KernelError::Query(format!("failed to serialize fingerprint input: {err}"))
    })?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{digest:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_key_lowercases_and_collapses_whitespace() {
        assert_eq!(normalize_key("  Sir   Galahad\tthe Pure "), "sir galahad the pure");
        assert_eq!(normalize_key("ALYX"), normalize_key("alyx"));
        assert_eq!(normalize_key("   "), "");
    }

    #[test]
    fn tokenize_terms_drops_short_and_punctuation_only_tokens() {
        let terms = tokenize_terms("The goblin's cave, a dark-place! x ?");
        assert_eq!(terms, vec!["cave", "dark-place", "goblin's", "the"]);
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = KernelConfig::default();
        assert!(config.evidence.fallback_by_time);
        assert!(config.evidence.repair_mentions);
        assert!((config.evidence.fallback_confidence - 0.3).abs() < f64::EPSILON);
        assert!((config.evidence.mention_repair_confidence - 0.6).abs() < f64::EPSILON);
        assert!((config.evidence.quote_similarity_threshold - 0.6).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_out_of_range_threshold() {
        let mut config = KernelConfig::default();
        config.evidence.quote_similarity_threshold = 1.5;
        match config.validate() {
            Err(KernelError::Validation(message)) => {
                assert!(message.contains("quote_similarity_threshold"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn session_facts_accept_sparse_payloads_and_unknown_types() {
        let raw = r#"{
            "mentions": [{"text": "Mistral", "entity_type": "dragon"}],
            "threads": [{"title": "Find the relic"}]
        }"#;
        let facts: SessionFacts = match serde_json::from_str(raw) {
            Ok(facts) => facts,
            Err(err) => panic!("payload should parse: {err}"),
        };
        assert_eq!(facts.mentions[0].entity_type, EntityType::Other);
        assert!(facts.mentions[0].evidence.is_empty());
        assert_eq!(facts.threads[0].kind, ThreadKind::Other);
        assert_eq!(facts.threads[0].status, ThreadStatus::Proposed);
        assert!(facts.scenes.is_empty());
    }

    #[test]
    fn scope_includes_campaign_rows_and_matching_session_rows() {
        let mk = |session_id: Option<&str>| CorrectionRecord {
            correction_id: CorrectionId::new(),
            campaign_id: "camp".to_string(),
            session_id: session_id.map(str::to_string),
            target_type: TargetType::Entity,
            target_id: "x".to_string(),
            action: "hide".to_string(),
            payload: serde_json::Value::Null,
            created_by: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let session_scope =
            CorrectionScope { campaign_id: "camp".to_string(), session_id: Some("s1".to_string()) };
        let campaign_scope = CorrectionScope { campaign_id: "camp".to_string(), session_id: None };

        assert!(session_scope.includes(&mk(None)));
        assert!(session_scope.includes(&mk(Some("s1"))));
        assert!(!session_scope.includes(&mk(Some("s2"))));
        assert!(campaign_scope.includes(&mk(None)));
        assert!(!campaign_scope.includes(&mk(Some("s1"))));
    }

    #[test]
    fn enum_text_forms_round_trip() {
        for value in ["quest", "mystery", "personal_arc", "faction_arc", "other"] {
            assert_eq!(ThreadKind::parse(value).map(ThreadKind::as_str), Some(value));
        }
        assert_eq!(ThreadStatus::parse("done"), None);
        assert_eq!(LinkRole::parse("entity_ref"), Some(LinkRole::EntityRef));
    }
}
