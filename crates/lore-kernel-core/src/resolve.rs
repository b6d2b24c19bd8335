//! Mention-to-entity resolution and link materialization for one run.
//!
//! [`plan_resolution`] is pure: it receives the campaign's current identity tables plus the
//! run's persisted facts and returns every row the store must write. Applying the plan
//! after deleting the run's previous links yields the same tables no matter how often it
//! runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    normalize_key, EntityAliasRecord, EntityId, EntityLinkRecord, EntityRecord, EntityType,
    EventRecord, EvidenceSpan, FactType, LinkRole, MentionId, MentionRecord, SceneRecord,
    ThreadRecord,
};

pub struct ResolutionInput<'a> {
    pub campaign_id: &'a str,
    pub run_id: &'a str,
    pub entities: &'a [EntityRecord],
    pub aliases: &'a [EntityAliasRecord],
    pub mentions: &'a [MentionRecord],
    pub scenes: &'a [SceneRecord],
    pub events: &'a [EventRecord],
    pub threads: &'a [ThreadRecord],
    pub now: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionReport {
    pub entities_created: usize,
    pub mentions_linked: usize,
    pub mentions_skipped: usize,
    pub aliases_added: usize,
    pub event_links: usize,
    pub scene_links: usize,
    pub thread_links: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionPlan {
    pub new_entities: Vec<EntityRecord>,
    pub new_aliases: Vec<EntityAliasRecord>,
    pub entity_mentions: Vec<(MentionId, EntityId)>,
    pub links: Vec<EntityLinkRecord>,
    pub report: ResolutionReport,
}

struct IdentityIndex {
    canonical: BTreeMap<(EntityType, String), EntityId>,
    aliases: BTreeMap<(EntityType, String), EntityId>,
    alias_literals: BTreeMap<EntityId, BTreeSet<String>>,
    canonical_literal_by_id: BTreeMap<EntityId, String>,
}

impl IdentityIndex {
    fn build(entities: &[EntityRecord], aliases: &[EntityAliasRecord]) -> Self {
        let mut ordered = entities.iter().collect::<Vec<_>>();
        ordered.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.entity_id.cmp(&right.entity_id))
        });

        let mut index = Self {
            canonical: BTreeMap::new(),
            aliases: BTreeMap::new(),
            alias_literals: BTreeMap::new(),
            canonical_literal_by_id: BTreeMap::new(),
        };
        let mut type_by_id = BTreeMap::new();
        for entity in ordered {
            let key = normalize_key(&entity.canonical_name);
            index.canonical.entry((entity.entity_type, key)).or_insert(entity.entity_id);
            index
                .canonical_literal_by_id
                .insert(entity.entity_id, entity.canonical_name.trim().to_lowercase());
            type_by_id.insert(entity.entity_id, entity.entity_type);
        }
        for alias in sorted_aliases(aliases) {
            let Some(entity_type) = type_by_id.get(&alias.entity_id) else {
                continue;
            };
            let key = normalize_key(&alias.alias);
            index.aliases.entry((*entity_type, key)).or_insert(alias.entity_id);
            index
                .alias_literals
                .entry(alias.entity_id)
                .or_default()
                .insert(alias.alias.trim().to_lowercase());
        }
        index
    }

    fn lookup(&self, entity_type: EntityType, key: &str) -> Option<EntityId> {
        let lookup_key = (entity_type, key.to_string());
        self.canonical.get(&lookup_key).or_else(|| self.aliases.get(&lookup_key)).copied()
    }
}

fn sorted_aliases(aliases: &[EntityAliasRecord]) -> Vec<&EntityAliasRecord> {
    let mut ordered = aliases.iter().collect::<Vec<_>>();
    ordered.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.entity_id.cmp(&right.entity_id))
            .then_with(|| left.alias.cmp(&right.alias))
    });
    ordered
}

/// Campaign-wide name lookup: canonical names first, then aliases, later entries winning.
fn build_name_map(
    entities: &[EntityRecord],
    aliases: &[EntityAliasRecord],
) -> BTreeMap<String, EntityId> {
    let mut ordered = entities.iter().collect::<Vec<_>>();
    ordered.sort_by(|left, right| {
        left.created_at.cmp(&right.created_at).then_with(|| left.entity_id.cmp(&right.entity_id))
    });

    let mut name_map = BTreeMap::new();
    for entity in ordered {
        name_map.insert(normalize_key(&entity.canonical_name), entity.entity_id);
    }
    for alias in sorted_aliases(aliases) {
        name_map.insert(normalize_key(&alias.alias), alias.entity_id);
    }
    name_map
}

fn collect_links(
    evidence_utterances: impl IntoIterator<Item = String>,
    names: &[String],
    name_role: LinkRole,
    utterance_to_entities: &BTreeMap<String, BTreeSet<EntityId>>,
    name_map: &BTreeMap<String, EntityId>,
) -> BTreeMap<EntityId, LinkRole> {
    let mut linked = BTreeMap::new();
    for utterance_id in evidence_utterances {
        if let Some(entity_ids) = utterance_to_entities.get(&utterance_id) {
            for entity_id in entity_ids {
                linked.insert(*entity_id, LinkRole::Evidence);
            }
        }
    }
    for name in names {
        if let Some(entity_id) = name_map.get(&normalize_key(name)) {
            linked.entry(*entity_id).or_insert(name_role);
        }
    }
    linked
}

fn span_utterances(spans: &[EvidenceSpan]) -> impl Iterator<Item = String> + '_ {
    spans.iter().map(|span| span.utterance_id.clone())
}

/// Resolve a run's mentions to entities and derive its scene, event and thread links.
#[must_use]
pub fn plan_resolution(input: &ResolutionInput<'_>) -> ResolutionPlan {
    let mut index = IdentityIndex::build(input.entities, input.aliases);
    let mut plan = ResolutionPlan::default();
    let mut resolved_mentions: Vec<(&MentionRecord, EntityId)> = Vec::new();

    for mention in input.mentions {
        let literal = mention.text.trim();
        let key = normalize_key(literal);
        if key.is_empty() {
            plan.report.mentions_skipped += 1;
            continue;
        }

        let entity_id = if let Some(existing) = index.lookup(mention.entity_type, &key) {
            existing
        } else {
            let entity = EntityRecord {
                entity_id: EntityId::new(),
                campaign_id: input.campaign_id.to_string(),
                entity_type: mention.entity_type,
                canonical_name: literal.to_string(),
                description: mention.description.clone(),
                created_at: input.now,
            };
            index.canonical.insert((entity.entity_type, key.clone()), entity.entity_id);
            index.canonical_literal_by_id.insert(entity.entity_id, literal.to_lowercase());
            plan.report.entities_created += 1;
            let entity_id = entity.entity_id;
            plan.new_entities.push(entity);
            entity_id
        };

        // Literal spellings are compared case-insensitively; whitespace variants count.
        let lowered = literal.to_lowercase();
        let is_canonical = index.canonical_literal_by_id.get(&entity_id) == Some(&lowered);
        let known_alias =
            index.alias_literals.get(&entity_id).is_some_and(|known| known.contains(&lowered));
        if !is_canonical && !known_alias {
            plan.new_aliases.push(EntityAliasRecord {
                entity_id,
                alias: literal.to_string(),
                created_at: input.now,
            });
            index.alias_literals.entry(entity_id).or_default().insert(lowered);
            index.aliases.entry((mention.entity_type, key)).or_insert(entity_id);
            plan.report.aliases_added += 1;
        }

        plan.entity_mentions.push((mention.mention_id, entity_id));
        plan.report.mentions_linked += 1;
        resolved_mentions.push((mention, entity_id));
    }

    let all_entities = input.entities.iter().chain(plan.new_entities.iter()).cloned().collect::<Vec<_>>();
    let all_aliases = input.aliases.iter().chain(plan.new_aliases.iter()).cloned().collect::<Vec<_>>();
    let name_map = build_name_map(&all_entities, &all_aliases);

    let mut utterance_to_entities: BTreeMap<String, BTreeSet<EntityId>> = BTreeMap::new();
    for (mention, entity_id) in &resolved_mentions {
        for span in &mention.evidence {
            utterance_to_entities.entry(span.utterance_id.clone()).or_default().insert(*entity_id);
        }
    }

    for scene in input.scenes {
        let linked = collect_links(
            span_utterances(&scene.evidence),
            &scene.participants,
            LinkRole::Participant,
            &utterance_to_entities,
            &name_map,
        );
        plan.report.scene_links += linked.len();
        push_links(&mut plan.links, FactType::Scene, &scene.scene_id.to_string(), input.run_id, &scene.evidence, linked);
    }

    for event in input.events {
        let linked = collect_links(
            span_utterances(&event.evidence),
            &event.entities,
            LinkRole::EntityRef,
            &utterance_to_entities,
            &name_map,
        );
        plan.report.event_links += linked.len();
        push_links(&mut plan.links, FactType::Event, &event.event_id.to_string(), input.run_id, &event.evidence, linked);
    }

    for thread in input.threads {
        let utterances = span_utterances(&thread.evidence)
            .chain(thread.updates.iter().flat_map(|update| span_utterances(&update.evidence)))
            .collect::<Vec<_>>();
        let linked = collect_links(
            utterances,
            &thread.entities,
            LinkRole::EntityRef,
            &utterance_to_entities,
            &name_map,
        );
        plan.report.thread_links += linked.len();
        push_links(&mut plan.links, FactType::Thread, &thread.thread_id.to_string(), input.run_id, &thread.evidence, linked);
    }

    plan
}

fn push_links(
    links: &mut Vec<EntityLinkRecord>,
    fact_type: FactType,
    fact_id: &str,
    run_id: &str,
    evidence: &[EvidenceSpan],
    linked: BTreeMap<EntityId, LinkRole>,
) {
    for (entity_id, role) in linked {
        links.push(EntityLinkRecord {
            fact_type,
            fact_id: fact_id.to_string(),
            entity_id,
            run_id: run_id.to_string(),
            role,
            evidence: evidence.to_vec(),
        });
    }
}
