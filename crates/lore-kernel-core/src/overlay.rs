//! Read-time folding of the correction ledger.
//!
//! Every state here is derived from base rows plus ledger rows and never written back.
//! Folds visit corrections in `(created_at, correction_id)` order; a row that fails a
//! consistency check is skipped with a warning and the fold carries on.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::{
    json_fingerprint, normalize_key, tokenize_terms, CampaignThreadId, CampaignThreadRecord,
    CorrectionRecord, EntityAliasRecord, EntityId, EntityLinkRecord, EntityRecord, EntityType,
    EvidenceSpan, FactType, FactsView, KernelError, LinkRole, QuoteRecord, TargetType, ThreadId, ThreadKind,
    ThreadRecord, ThreadStatus, Utterance, ViewerRole,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionAction {
    EntityRename { name: String },
    EntityAliasAdd { alias: String },
    EntityAliasRemove { alias: String },
    EntityMerge { into_id: String },
    EntityHide,
    EntityUnhide,
    ThreadTitle { title: String },
    ThreadStatus { status: ThreadStatus },
    ThreadSummary { summary: Option<String> },
    ThreadMerge { into_id: String },
    ThreadHide,
    ThreadUnhide,
    Redact,
    Unredact,
    SpoilerTag { reveal_session_number: Option<i64> },
}

impl CorrectionAction {
    /// Interpret a ledger action and its payload for the given target type.
    ///
    /// Short legacy action names (`rename`, `merge`, `hide`, ...) are accepted alongside the
    /// qualified ones.
    ///
    /// # Errors
    /// Returns `KernelError::Validation` when the action does not apply to `target_type`
    /// or a required payload field is missing or malformed.
    pub fn parse(
        target_type: TargetType,
        action: &str,
        payload: &Value,
    ) -> Result<Self, KernelError> {
        if matches!(action, "spoiler_tag" | "spoiler") {
            let reveal_session_number = match payload.get("reveal_session_number") {
                Some(Value::Null) => None,
                Some(value) => Some(value.as_i64().ok_or_else(|| {
                    KernelError::Validation(
                        "reveal_session_number MUST be an integer or null".to_string(),
                    )
                })?),
                None => {
                    return Err(KernelError::Validation(
                        "spoiler_tag payload MUST include reveal_session_number".to_string(),
                    ))
                }
            };
            return Ok(Self::SpoilerTag { reveal_session_number });
        }

        match (target_type, action) {
            (TargetType::Entity, "entity_rename" | "rename") => {
                Ok(Self::EntityRename { name: required_text(payload, &["name", "canonical_name"], action)? })
            }
            (TargetType::Entity, "entity_alias_add" | "alias_add") => {
                Ok(Self::EntityAliasAdd { alias: required_text(payload, &["alias"], action)? })
            }
            (TargetType::Entity, "entity_alias_remove" | "alias_remove") => {
                Ok(Self::EntityAliasRemove { alias: required_text(payload, &["alias"], action)? })
            }
            (TargetType::Entity, "entity_merge" | "merge") => {
                Ok(Self::EntityMerge { into_id: required_text(payload, &["into_id", "target_id"], action)? })
            }
            (TargetType::Entity, "entity_hide" | "hide") => Ok(Self::EntityHide),
            (TargetType::Entity, "entity_unhide" | "unhide") => Ok(Self::EntityUnhide),
            (TargetType::Thread, "thread_title" | "thread_rename" | "title_update") => {
                Ok(Self::ThreadTitle { title: required_text(payload, &["title", "name"], action)? })
            }
            (TargetType::Thread, "thread_status" | "status_update") => {
                let raw = required_text(payload, &["status"], action)?;
                let status = ThreadStatus::parse(&raw).ok_or_else(|| {
                    KernelError::Validation(format!("unknown thread status `{raw}`"))
                })?;
                Ok(Self::ThreadStatus { status })
            }
            (TargetType::Thread, "thread_summary" | "summary_update") => match payload.get("summary") {
                Some(Value::Null) => Ok(Self::ThreadSummary { summary: None }),
                Some(Value::String(summary)) => Ok(Self::ThreadSummary { summary: Some(summary.clone()) }),
                _ => Err(KernelError::Validation(format!(
                    "{action} payload MUST include summary as a string or null"
                ))),
            },
            (TargetType::Thread, "thread_merge" | "merge") => {
                Ok(Self::ThreadMerge { into_id: required_text(payload, &["into_id", "target_id"], action)? })
            }
            (TargetType::Thread, "thread_hide" | "hide") => Ok(Self::ThreadHide),
            (TargetType::Thread, "thread_unhide" | "unhide") => Ok(Self::ThreadUnhide),
            (TargetType::Quote | TargetType::Utterance, "redact") => Ok(Self::Redact),
            (TargetType::Quote | TargetType::Utterance, "unredact") => Ok(Self::Unredact),
            _ => Err(KernelError::Validation(format!(
                "action `{action}` is not supported for target type `{target_type}`"
            ))),
        }
    }

    /// Qualified action name, used when echoing normalized ledger rows.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::EntityRename { .. } => "entity_rename",
            Self::EntityAliasAdd { .. } => "entity_alias_add",
            Self::EntityAliasRemove { .. } => "entity_alias_remove",
            Self::EntityMerge { .. } => "entity_merge",
            Self::EntityHide => "entity_hide",
            Self::EntityUnhide => "entity_unhide",
            Self::ThreadTitle { .. } => "thread_title",
            Self::ThreadStatus { .. } => "thread_status",
            Self::ThreadSummary { .. } => "thread_summary",
            Self::ThreadMerge { .. } => "thread_merge",
            Self::ThreadHide => "thread_hide",
            Self::ThreadUnhide => "thread_unhide",
            Self::Redact => "redact",
            Self::Unredact => "unredact",
            Self::SpoilerTag { .. } => "spoiler_tag",
        }
    }
}

fn required_text(payload: &Value, keys: &[&str], action: &str) -> Result<String, KernelError> {
    keys.iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            KernelError::Validation(format!("{action} payload MUST include {}", keys.join(" or ")))
        })
}

fn ordered_corrections(
    corrections: &[CorrectionRecord],
    target_type: Option<TargetType>,
) -> Vec<&CorrectionRecord> {
    let mut ordered = corrections
        .iter()
        .filter(|correction| target_type.map_or(true, |wanted| correction.target_type == wanted))
        .collect::<Vec<_>>();
    ordered.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.correction_id.cmp(&right.correction_id))
    });
    ordered
}

fn skip(correction: &CorrectionRecord, reason: &str) {
    tracing::warn!(
        correction_id = %correction.correction_id,
        target_id = %correction.target_id,
        action = %correction.action,
        reason,
        "skipping correction"
    );
}

fn parsed(correction: &CorrectionRecord) -> Option<CorrectionAction> {
    match CorrectionAction::parse(correction.target_type, &correction.action, &correction.payload) {
        Ok(action) => Some(action),
        Err(err) => {
            skip(correction, &err.to_string());
            None
        }
    }
}

fn resolve_chain<T: Ord + Copy>(merge_map: &BTreeMap<T, T>, start: T) -> T {
    let mut seen = BTreeSet::new();
    let mut current = start;
    while let Some(next) = merge_map.get(&current) {
        if !seen.insert(current) {
            break;
        }
        current = *next;
    }
    current
}

/// Effective entity identities after renames, aliases, merges and hides.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EntityCorrectionState {
    pub canonical_name_by_id: BTreeMap<EntityId, String>,
    pub alias_to_id: BTreeMap<String, EntityId>,
    pub hidden_ids: BTreeSet<EntityId>,
    pub merge_map: BTreeMap<EntityId, EntityId>,
    pub name_to_canonical: BTreeMap<String, String>,
    pub hidden_names: BTreeSet<String>,
    #[serde(skip)]
    entity_types: BTreeMap<EntityId, EntityType>,
    #[serde(skip)]
    explicit_hidden: BTreeSet<EntityId>,
    /// Name keys before merges were followed.
    #[serde(skip)]
    direct_alias_to_id: BTreeMap<String, EntityId>,
}

impl EntityCorrectionState {
    /// Terminal identity of a merge chain; a cycle stops at the first revisited id.
    #[must_use]
    pub fn resolve_id(&self, entity_id: EntityId) -> EntityId {
        resolve_chain(&self.merge_map, entity_id)
    }

    #[must_use]
    pub fn is_visible(&self, entity_id: EntityId) -> bool {
        !self.hidden_ids.contains(&self.resolve_id(entity_id))
    }

    /// Live entity a free-text name refers to, if any.
    #[must_use]
    pub fn lookup_name(&self, name: &str) -> Option<EntityId> {
        self.alias_to_id
            .get(&normalize_key(name))
            .copied()
            .filter(|entity_id| self.is_visible(*entity_id))
    }

    #[must_use]
    pub fn display_name(&self, entity_id: EntityId) -> Option<&str> {
        self.canonical_name_by_id.get(&self.resolve_id(entity_id)).map(String::as_str)
    }

    /// Stable digest of the folded state, usable as a cache key.
    ///
    /// # Errors
    /// Returns `KernelError::Query` if the state cannot be serialized.
    pub fn fingerprint(&self) -> Result<String, KernelError> {
        json_fingerprint(self)
    }

    /// Every entity a free-text name refers to, both before and after merges.
    fn name_ids(&self, name: &str) -> BTreeSet<EntityId> {
        let key = normalize_key(name);
        let mut ids = self
            .direct_alias_to_id
            .get(&key)
            .into_iter()
            .chain(self.alias_to_id.get(&key))
            .copied()
            .collect::<BTreeSet<_>>();
        ids.extend(
            self.canonical_name_by_id
                .iter()
                .filter(|(_, canonical)| normalize_key(canonical) == key)
                .map(|(entity_id, _)| *entity_id),
        );
        ids
    }

    fn is_live(&self, entity_id: EntityId) -> bool {
        !self.explicit_hidden.contains(&entity_id) && !self.merge_map.contains_key(&entity_id)
    }

    fn collides(&self, entity_id: EntityId, name: &str) -> bool {
        let key = normalize_key(name);
        let entity_type = self.entity_types.get(&entity_id);
        self.canonical_name_by_id.iter().any(|(other_id, other_name)| {
            *other_id != entity_id
                && self.entity_types.get(other_id) == entity_type
                && self.is_live(*other_id)
                && normalize_key(other_name) == key
        })
    }

    fn apply(&mut self, correction: &CorrectionRecord, action: CorrectionAction) {
        let Ok(target) = EntityId::parse(&correction.target_id) else {
            skip(correction, "target is not an entity id");
            return;
        };
        if !self.canonical_name_by_id.contains_key(&target) {
            skip(correction, "unknown entity");
            return;
        }

        match action {
            CorrectionAction::EntityRename { name } => {
                if self.is_live(target) && self.collides(target, &name) {
                    skip(correction, "rename collides with a live entity of the same type");
                    return;
                }
                let old_key = self
                    .canonical_name_by_id
                    .insert(target, name.clone())
                    .map(|old| normalize_key(&old));
                if let Some(old_key) = old_key {
                    self.alias_to_id.insert(old_key, target);
                }
                self.alias_to_id.insert(normalize_key(&name), target);
            }
            CorrectionAction::EntityAliasAdd { alias } => {
                self.alias_to_id.insert(normalize_key(&alias), target);
            }
            CorrectionAction::EntityAliasRemove { alias } => {
                let key = normalize_key(&alias);
                if self.alias_to_id.get(&key) == Some(&target) {
                    self.alias_to_id.remove(&key);
                }
            }
            CorrectionAction::EntityMerge { into_id } => {
                let Ok(into) = EntityId::parse(&into_id) else {
                    skip(correction, "merge target is not an entity id");
                    return;
                };
                if !self.canonical_name_by_id.contains_key(&into) {
                    skip(correction, "unknown merge target");
                    return;
                }
                if self.resolve_id(into) == target {
                    skip(correction, "merge would create a cycle");
                    return;
                }
                self.merge_map.insert(target, into);
            }
            CorrectionAction::EntityHide => {
                self.explicit_hidden.insert(target);
            }
            CorrectionAction::EntityUnhide => {
                let Some(name) = self.canonical_name_by_id.get(&target).cloned() else {
                    return;
                };
                if self.collides(target, &name) {
                    skip(correction, "unhide collides with a live entity of the same type");
                    return;
                }
                self.explicit_hidden.remove(&target);
            }
            _ => skip(correction, "not an entity action"),
        }
    }
}

/// Fold entity corrections over the campaign's entities and aliases.
#[must_use]
pub fn load_entity_correction_state(
    entities: &[EntityRecord],
    aliases: &[EntityAliasRecord],
    corrections: &[CorrectionRecord],
) -> EntityCorrectionState {
    let mut state = EntityCorrectionState::default();

    let mut ordered_entities = entities.iter().collect::<Vec<_>>();
    ordered_entities.sort_by(|left, right| {
        left.created_at.cmp(&right.created_at).then_with(|| left.entity_id.cmp(&right.entity_id))
    });
    for entity in &ordered_entities {
        state.canonical_name_by_id.insert(entity.entity_id, entity.canonical_name.clone());
        state.entity_types.insert(entity.entity_id, entity.entity_type);
        state.alias_to_id.insert(normalize_key(&entity.canonical_name), entity.entity_id);
    }
    let mut ordered_aliases = aliases
        .iter()
        .filter(|alias| state.canonical_name_by_id.contains_key(&alias.entity_id))
        .collect::<Vec<_>>();
    ordered_aliases.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.entity_id.cmp(&right.entity_id))
            .then_with(|| left.alias.cmp(&right.alias))
    });
    for alias in ordered_aliases {
        state.alias_to_id.insert(normalize_key(&alias.alias), alias.entity_id);
    }

    for correction in ordered_corrections(corrections, Some(TargetType::Entity)) {
        if let Some(action) = parsed(correction) {
            if !matches!(action, CorrectionAction::SpoilerTag { .. }) {
                state.apply(correction, action);
            }
        }
    }

    state.direct_alias_to_id = state.alias_to_id.clone();
    let remapped = state
        .alias_to_id
        .iter()
        .map(|(key, entity_id)| (key.clone(), state.resolve_id(*entity_id)))
        .collect::<BTreeMap<_, _>>();
    state.alias_to_id = remapped;

    state.hidden_ids = state
        .explicit_hidden
        .iter()
        .chain(state.merge_map.keys())
        .copied()
        .collect();

    let mut name_to_canonical = BTreeMap::new();
    let mut hidden_names = BTreeSet::new();
    for (key, entity_id) in &state.alias_to_id {
        if state.hidden_ids.contains(entity_id) {
            hidden_names.insert(key.clone());
        } else if let Some(canonical) = state.canonical_name_by_id.get(entity_id) {
            name_to_canonical.insert(key.clone(), canonical.clone());
        }
    }
    for (entity_id, name) in &state.canonical_name_by_id {
        let key = normalize_key(name);
        let resolved = state.resolve_id(*entity_id);
        if state.hidden_ids.contains(&resolved) {
            hidden_names.insert(key);
        } else if let Some(canonical) = state.canonical_name_by_id.get(&resolved) {
            name_to_canonical.entry(key).or_insert_with(|| canonical.clone());
        }
    }
    hidden_names.retain(|key| !name_to_canonical.contains_key(key));
    state.name_to_canonical = name_to_canonical;
    state.hidden_names = hidden_names;
    state
}

fn relabel_names(names: &[String], state: &EntityCorrectionState) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut relabeled = Vec::new();
    for name in names {
        let key = normalize_key(name);
        if state.hidden_names.contains(&key) {
            continue;
        }
        let display = state.name_to_canonical.get(&key).cloned().unwrap_or_else(|| name.clone());
        if seen.insert(normalize_key(&display)) {
            relabeled.push(display);
        }
    }
    relabeled
}

/// Relabel a facts view through the entity overlay: hidden entities disappear, merged and
/// renamed ones show their effective canonical name.
pub fn apply_entity_corrections(facts: &mut FactsView, state: &EntityCorrectionState) {
    facts.mentions.retain_mut(|mention| {
        if let Some(entity_id) = mention.entity_id {
            let resolved = state.resolve_id(entity_id);
            if state.hidden_ids.contains(&resolved) {
                return false;
            }
            mention.entity_id = Some(resolved);
            if let Some(name) = state.canonical_name_by_id.get(&resolved) {
                mention.text.clone_from(name);
            }
            return true;
        }
        let key = normalize_key(&mention.text);
        if state.hidden_names.contains(&key) {
            return false;
        }
        if let Some(canonical) = state.name_to_canonical.get(&key) {
            mention.text.clone_from(canonical);
        }
        true
    });

    for scene in &mut facts.scenes {
        scene.participants = relabel_names(&scene.participants, state);
    }
    for event in &mut facts.events {
        event.entities = relabel_names(&event.entities, state);
    }
    for thread in &mut facts.threads {
        thread.entities = relabel_names(&thread.entities, state);
    }
}

/// A spoiler tag on an entity, or on the identity it was merged into, hides it.
fn entity_spoiled(
    entity_id: EntityId,
    state: &EntityCorrectionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
) -> bool {
    spoilers.is_hidden(TargetType::Entity, &entity_id.to_string(), cutoff)
        || spoilers.is_hidden(TargetType::Entity, &state.resolve_id(entity_id).to_string(), cutoff)
}

fn name_spoiled(
    name: &str,
    state: &EntityCorrectionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
) -> bool {
    state.name_ids(name).into_iter().any(|entity_id| entity_spoiled(entity_id, state, spoilers, cutoff))
}

/// Drop spoiler-tagged entities from a facts view: linked mentions plus every participant
/// or entity name that refers to one. Runs before [`apply_entity_corrections`] so tags on
/// merge sources still match.
pub fn apply_entity_spoilers(
    facts: &mut FactsView,
    state: &EntityCorrectionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
) {
    if cutoff.is_none() || spoilers.reveal_session_by_target.is_empty() {
        return;
    }
    facts.mentions.retain(|mention| match mention.entity_id {
        Some(entity_id) => !entity_spoiled(entity_id, state, spoilers, cutoff),
        None => !name_spoiled(&mention.text, state, spoilers, cutoff),
    });
    let keep = |names: &mut Vec<String>| {
        names.retain(|name| !name_spoiled(name, state, spoilers, cutoff));
    };
    for scene in &mut facts.scenes {
        keep(&mut scene.participants);
    }
    for event in &mut facts.events {
        keep(&mut event.entities);
    }
    for thread in &mut facts.threads {
        keep(&mut thread.entities);
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ThreadOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ThreadStatus>,
    /// `Some(None)` clears the summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Option<String>>,
}

/// Effective campaign-thread state, keyed by campaign thread so an edit to one session's
/// thread row reaches every session's instance.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ThreadCorrectionState {
    pub overrides: BTreeMap<CampaignThreadId, ThreadOverride>,
    pub hidden: BTreeSet<CampaignThreadId>,
    pub merge_map: BTreeMap<CampaignThreadId, CampaignThreadId>,
    #[serde(skip)]
    explicit_hidden: BTreeSet<CampaignThreadId>,
}

impl ThreadCorrectionState {
    #[must_use]
    pub fn resolve_id(&self, campaign_thread_id: CampaignThreadId) -> CampaignThreadId {
        resolve_chain(&self.merge_map, campaign_thread_id)
    }

    #[must_use]
    pub fn is_visible(&self, campaign_thread_id: CampaignThreadId) -> bool {
        !self.hidden.contains(&self.resolve_id(campaign_thread_id))
    }

    /// # Errors
    /// Returns `KernelError::Query` if the state cannot be serialized.
    pub fn fingerprint(&self) -> Result<String, KernelError> {
        json_fingerprint(self)
    }
}

fn thread_target_map(
    campaign_threads: &[CampaignThreadRecord],
    threads: &[ThreadRecord],
) -> BTreeMap<String, CampaignThreadId> {
    let mut targets = BTreeMap::new();
    for campaign_thread in campaign_threads {
        targets.insert(campaign_thread.campaign_thread_id.to_string(), campaign_thread.campaign_thread_id);
    }
    for thread in threads {
        targets.insert(thread.thread_id.to_string(), thread.campaign_thread_id);
    }
    targets
}

/// Fold thread corrections. Targets may name a thread row (any session) or a campaign thread.
#[must_use]
pub fn load_thread_correction_state(
    campaign_threads: &[CampaignThreadRecord],
    threads: &[ThreadRecord],
    corrections: &[CorrectionRecord],
) -> ThreadCorrectionState {
    let targets = thread_target_map(campaign_threads, threads);
    let mut state = ThreadCorrectionState::default();

    for correction in ordered_corrections(corrections, Some(TargetType::Thread)) {
        let Some(action) = parsed(correction) else {
            continue;
        };
        let Some(target) = targets.get(&correction.target_id).copied() else {
            skip(correction, "unknown thread");
            continue;
        };
        match action {
            CorrectionAction::ThreadTitle { title } => {
                state.overrides.entry(target).or_default().title = Some(title);
            }
            CorrectionAction::ThreadStatus { status } => {
                state.overrides.entry(target).or_default().status = Some(status);
            }
            CorrectionAction::ThreadSummary { summary } => {
                state.overrides.entry(target).or_default().summary = Some(summary);
            }
            CorrectionAction::ThreadHide => {
                state.explicit_hidden.insert(target);
            }
            CorrectionAction::ThreadUnhide => {
                state.explicit_hidden.remove(&target);
            }
            CorrectionAction::ThreadMerge { into_id } => {
                let Some(into) = targets.get(&into_id).copied() else {
                    skip(correction, "unknown merge target");
                    continue;
                };
                if state.resolve_id(into) == target {
                    skip(correction, "merge would create a cycle");
                    continue;
                }
                state.merge_map.insert(target, into);
            }
            CorrectionAction::SpoilerTag { .. } => {}
            _ => skip(correction, "not a thread action"),
        }
    }

    state.hidden = state.explicit_hidden.iter().chain(state.merge_map.keys()).copied().collect();
    state
}

/// Utterances and quotes scrubbed from every response surface.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RedactionState {
    pub utterance_ids: BTreeSet<String>,
    pub quote_ids: BTreeSet<String>,
}

impl RedactionState {
    #[must_use]
    pub fn is_utterance_redacted(&self, utterance_id: &str) -> bool {
        self.utterance_ids.contains(utterance_id)
    }

    #[must_use]
    pub fn is_quote_redacted(&self, quote: &QuoteRecord) -> bool {
        self.quote_ids.contains(&quote.quote_id.to_string())
            || self.utterance_ids.contains(&quote.utterance_id)
    }
}

#[must_use]
pub fn load_redaction_state(corrections: &[CorrectionRecord]) -> RedactionState {
    let mut state = RedactionState::default();
    for correction in ordered_corrections(corrections, None) {
        let set = match correction.target_type {
            TargetType::Utterance => &mut state.utterance_ids,
            TargetType::Quote => &mut state.quote_ids,
            TargetType::Entity | TargetType::Thread => continue,
        };
        match parsed(correction) {
            Some(CorrectionAction::Redact) => {
                set.insert(correction.target_id.clone());
            }
            Some(CorrectionAction::Unredact) => {
                set.remove(&correction.target_id);
            }
            _ => {}
        }
    }
    state
}

/// Session number after which each tagged target is revealed.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SpoilerState {
    pub reveal_session_by_target: BTreeMap<String, i64>,
}

fn spoiler_key(target_type: TargetType, target_id: &str) -> String {
    format!("{}:{target_id}", target_type.as_str())
}

impl SpoilerState {
    #[must_use]
    pub fn reveal_session(&self, target_type: TargetType, target_id: &str) -> Option<i64> {
        self.reveal_session_by_target.get(&spoiler_key(target_type, target_id)).copied()
    }

    /// `cutoff` is `None` for privileged viewers, who see every target.
    #[must_use]
    pub fn is_hidden(&self, target_type: TargetType, target_id: &str, cutoff: Option<i64>) -> bool {
        match (cutoff, self.reveal_session(target_type, target_id)) {
            (Some(cutoff), Some(reveal)) => reveal > cutoff,
            _ => false,
        }
    }
}

#[must_use]
pub fn load_spoiler_state(corrections: &[CorrectionRecord]) -> SpoilerState {
    let mut state = SpoilerState::default();
    for correction in ordered_corrections(corrections, None) {
        if !matches!(correction.action.as_str(), "spoiler_tag" | "spoiler") {
            continue;
        }
        if let Some(CorrectionAction::SpoilerTag { reveal_session_number }) = parsed(correction) {
            let key = spoiler_key(correction.target_type, &correction.target_id);
            match reveal_session_number {
                Some(reveal) => {
                    state.reveal_session_by_target.insert(key, reveal);
                }
                None => {
                    state.reveal_session_by_target.remove(&key);
                }
            }
        }
    }
    state
}

/// Spoiler cutoff for a viewer: privileged viewers have none, players stop at the session
/// being viewed (or the latest numbered session for campaign-wide views).
#[must_use]
pub fn spoiler_cutoff(role: ViewerRole, session_number: Option<i64>) -> Option<i64> {
    match role {
        ViewerRole::Dm => None,
        ViewerRole::Player => Some(session_number.unwrap_or(0)),
    }
}

#[must_use]
pub fn scrub_evidence(evidence: &[EvidenceSpan], redaction: &RedactionState) -> Vec<EvidenceSpan> {
    evidence
        .iter()
        .filter(|span| !redaction.is_utterance_redacted(&span.utterance_id))
        .cloned()
        .collect()
}

/// Remove redacted material from a facts view. Runs after every other overlay.
pub fn apply_redactions(facts: &mut FactsView, redaction: &RedactionState) {
    for mention in &mut facts.mentions {
        mention.evidence = scrub_evidence(&mention.evidence, redaction);
    }
    for scene in &mut facts.scenes {
        scene.evidence = scrub_evidence(&scene.evidence, redaction);
    }
    for event in &mut facts.events {
        event.evidence = scrub_evidence(&event.evidence, redaction);
    }
    for thread in &mut facts.threads {
        thread.evidence = scrub_evidence(&thread.evidence, redaction);
        for update in &mut thread.updates {
            update.evidence = scrub_evidence(&update.evidence, redaction);
        }
    }
    facts.quotes.retain(|quote| !redaction.is_quote_redacted(quote));
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityView {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub canonical_name: String,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    pub merged_ids: Vec<EntityId>,
}

/// Entities as the overlay presents them: renamed, merge sources folded into their target,
/// hidden and spoiler-tagged entities removed.
#[must_use]
pub fn visible_entities(
    entities: &[EntityRecord],
    aliases: &[EntityAliasRecord],
    state: &EntityCorrectionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
) -> Vec<EntityView> {
    let mut literals: BTreeMap<EntityId, BTreeMap<String, String>> = BTreeMap::new();
    let mut merged_ids: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
    let mut remember = |entity_id: EntityId, literal: &str| {
        let key = normalize_key(literal);
        if state.alias_to_id.get(&key) == Some(&entity_id) {
            literals.entry(entity_id).or_default().entry(key).or_insert_with(|| literal.to_string());
        }
    };
    for alias in aliases {
        remember(state.resolve_id(alias.entity_id), &alias.alias);
    }
    for entity in entities {
        let resolved = state.resolve_id(entity.entity_id);
        remember(resolved, &entity.canonical_name);
        if resolved != entity.entity_id {
            merged_ids.entry(resolved).or_default().push(entity.entity_id);
        }
    }
    for (key, entity_id) in &state.alias_to_id {
        literals.entry(*entity_id).or_default().entry(key.clone()).or_insert_with(|| key.clone());
    }

    let mut views = entities
        .iter()
        .filter(|entity| !state.hidden_ids.contains(&entity.entity_id))
        .filter(|entity| !spoilers.is_hidden(TargetType::Entity, &entity.entity_id.to_string(), cutoff))
        .map(|entity| {
            let canonical_name = state
                .canonical_name_by_id
                .get(&entity.entity_id)
                .cloned()
                .unwrap_or_else(|| entity.canonical_name.clone());
            let own_key = normalize_key(&canonical_name);
            let aliases = literals
                .get(&entity.entity_id)
                .map(|by_key| {
                    by_key
                        .iter()
                        .filter(|(key, _)| **key != own_key)
                        .map(|(_, literal)| literal.clone())
                        .collect()
                })
                .unwrap_or_default();
            let mut merged = merged_ids.get(&entity.entity_id).cloned().unwrap_or_default();
            merged.sort();
            EntityView {
                entity_id: entity.entity_id,
                entity_type: entity.entity_type,
                canonical_name,
                description: entity.description.clone(),
                aliases,
                merged_ids: merged,
            }
        })
        .collect::<Vec<_>>();
    views.sort_by(|left, right| {
        left.entity_type
            .cmp(&right.entity_type)
            .then_with(|| normalize_key(&left.canonical_name).cmp(&normalize_key(&right.canonical_name)))
            .then_with(|| left.entity_id.cmp(&right.entity_id))
    });
    views
}

/// Link rows relabeled through merges; hidden or spoiler-tagged entities drop out and
/// duplicate links collapse onto the strongest role.
#[must_use]
pub fn visible_entity_links(
    links: &[EntityLinkRecord],
    state: &EntityCorrectionState,
    redaction: &RedactionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
) -> Vec<EntityLinkRecord> {
    let mut merged: BTreeMap<(FactType, String, EntityId), EntityLinkRecord> = BTreeMap::new();
    for link in links {
        let resolved = state.resolve_id(link.entity_id);
        if state.hidden_ids.contains(&resolved) || entity_spoiled(link.entity_id, state, spoilers, cutoff) {
            continue;
        }
        let candidate = EntityLinkRecord {
            entity_id: resolved,
            evidence: scrub_evidence(&link.evidence, redaction),
            ..link.clone()
        };
        let key = (link.fact_type, link.fact_id.clone(), resolved);
        match merged.get(&key) {
            Some(existing) if existing.role == LinkRole::Evidence || candidate.role != LinkRole::Evidence => {}
            _ => {
                merged.insert(key, candidate);
            }
        }
    }
    merged.into_values().collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ThreadView {
    pub campaign_thread_id: CampaignThreadId,
    pub title: String,
    pub kind: ThreadKind,
    pub status: ThreadStatus,
    pub summary: Option<String>,
    pub merged_ids: Vec<CampaignThreadId>,
    pub thread_ids: Vec<ThreadId>,
    pub session_ids: Vec<String>,
}

/// Campaign threads grouped by their resolved identity with overrides applied. A group
/// whose terminal thread is hidden is excluded entirely.
#[must_use]
pub fn visible_threads(
    campaign_threads: &[CampaignThreadRecord],
    threads: &[ThreadRecord],
    state: &ThreadCorrectionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
) -> Vec<ThreadView> {
    let by_id = campaign_threads
        .iter()
        .map(|record| (record.campaign_thread_id, record))
        .collect::<BTreeMap<_, _>>();

    let mut groups: BTreeMap<CampaignThreadId, ThreadView> = BTreeMap::new();
    for record in campaign_threads {
        let resolved = state.resolve_id(record.campaign_thread_id);
        if state.hidden.contains(&resolved)
            || spoilers.is_hidden(TargetType::Thread, &resolved.to_string(), cutoff)
            || spoilers.is_hidden(TargetType::Thread, &record.campaign_thread_id.to_string(), cutoff)
        {
            continue;
        }
        let Some(base) = by_id.get(&resolved) else {
            continue;
        };
        let view = groups.entry(resolved).or_insert_with(|| {
            let overrides = state.overrides.get(&resolved).cloned().unwrap_or_default();
            ThreadView {
                campaign_thread_id: resolved,
                title: overrides.title.unwrap_or_else(|| base.title.clone()),
                kind: base.kind,
                status: overrides.status.unwrap_or(base.status),
                summary: overrides.summary.unwrap_or_else(|| base.summary.clone()),
                merged_ids: Vec::new(),
                thread_ids: Vec::new(),
                session_ids: Vec::new(),
            }
        });
        if resolved != record.campaign_thread_id {
            view.merged_ids.push(record.campaign_thread_id);
        }
    }

    for thread in threads {
        let resolved = state.resolve_id(thread.campaign_thread_id);
        if spoilers.is_hidden(TargetType::Thread, &thread.thread_id.to_string(), cutoff) {
            continue;
        }
        if let Some(view) = groups.get_mut(&resolved) {
            view.thread_ids.push(thread.thread_id);
            if !view.session_ids.contains(&thread.session_id) {
                view.session_ids.push(thread.session_id.clone());
            }
        }
    }

    let mut views = groups.into_values().collect::<Vec<_>>();
    for view in &mut views {
        view.merged_ids.sort();
        view.thread_ids.sort();
        view.session_ids.sort();
    }
    views.sort_by(|left, right| {
        normalize_key(&left.title)
            .cmp(&normalize_key(&right.title))
            .then_with(|| left.campaign_thread_id.cmp(&right.campaign_thread_id))
    });
    views
}

/// Quotes minus redacted and spoiler-tagged ones.
#[must_use]
pub fn visible_quotes(
    quotes: &[QuoteRecord],
    redaction: &RedactionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
) -> Vec<QuoteRecord> {
    quotes
        .iter()
        .filter(|quote| !redaction.is_quote_redacted(quote))
        .filter(|quote| {
            !spoilers.is_hidden(TargetType::Quote, &quote.quote_id.to_string(), cutoff)
                && !spoilers.is_hidden(TargetType::Utterance, &quote.utterance_id, cutoff)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub utterance_id: String,
    pub session_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub speaker: Option<String>,
    pub text: String,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

/// Lexical search over utterances by normalized term overlap, ranked by the share of query
/// terms matched and then transcript order.
#[must_use]
pub fn search_utterances(
    utterances: &[Utterance],
    query: &str,
    redaction: &RedactionState,
    spoilers: &SpoilerState,
    cutoff: Option<i64>,
    limit: usize,
) -> Vec<SearchHit> {
    let query_terms = tokenize_terms(query);
    if query_terms.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut hits = Vec::new();
    for utterance in utterances {
        if redaction.is_utterance_redacted(&utterance.utterance_id)
            || spoilers.is_hidden(TargetType::Utterance, &utterance.utterance_id, cutoff)
        {
            continue;
        }
        let terms = tokenize_terms(&utterance.text).into_iter().collect::<BTreeSet<_>>();
        let matched_terms =
            query_terms.iter().filter(|term| terms.contains(*term)).cloned().collect::<Vec<_>>();
        if matched_terms.is_empty() {
            continue;
        }
        let score = share(matched_terms.len(), query_terms.len());
        hits.push(SearchHit {
            utterance_id: utterance.utterance_id.clone(),
            session_id: utterance.session_id.clone(),
            start_ms: utterance.start_ms,
            end_ms: utterance.end_ms,
            speaker: utterance.speaker.clone(),
            text: utterance.text.clone(),
            score,
            matched_terms,
        });
    }

    hits.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.session_id.cmp(&right.session_id))
            .then_with(|| left.start_ms.cmp(&right.start_ms))
            .then_with(|| left.utterance_id.cmp(&right.utterance_id))
    });
    hits.truncate(limit);
    hits
}

fn share(matched: usize, total: usize) -> f64 {
    let matched = u32::try_from(matched).map_or(f64::from(u32::MAX), f64::from);
    let total = u32::try_from(total).map_or(f64::from(u32::MAX), f64::from);
    if total == 0.0 {
        0.0
    } else {
        matched / total
    }
}
