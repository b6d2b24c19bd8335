use criterion::{criterion_group, criterion_main, Criterion};
use lore_kernel_core::{
    apply_entity_corrections, load_entity_correction_state, search_utterances, CorrectionId,
    CorrectionRecord, EntityId, EntityRecord, EntityType, FactsView, MentionId, MentionRecord,
    RedactionState, SpoilerState, TargetType, Utterance,
};
use serde_json::json;
use time::{Duration, OffsetDateTime};

fn mk_entity(index: usize) -> EntityRecord {
    EntityRecord {
        entity_id: EntityId::new(),
        campaign_id: "bench".to_string(),
        entity_type: if index % 3 == 0 { EntityType::Location } else { EntityType::Character },
        canonical_name: format!("Entity {index}"),
        description: None,
        created_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn mk_correction(index: usize, entities: &[EntityRecord]) -> CorrectionRecord {
    let target = &entities[index % entities.len()];
    let (action, payload) = match index % 4 {
        0 => ("entity_rename", json!({"name": format!("Renamed {index}")})),
        1 => ("entity_alias_add", json!({"alias": format!("Alias {index}")})),
        2 => (
            "entity_merge",
            json!({"into_id": entities[(index * 7 + 1) % entities.len()].entity_id.to_string()}),
        ),
        _ => ("entity_hide", json!({})),
    };
    CorrectionRecord {
        correction_id: CorrectionId::new(),
        campaign_id: "bench".to_string(),
        session_id: None,
        target_type: TargetType::Entity,
        target_id: target.entity_id.to_string(),
        action: action.to_string(),
        payload,
        created_by: None,
        created_at: OffsetDateTime::UNIX_EPOCH
            + Duration::seconds(i64::try_from(index).unwrap_or(i64::MAX)),
    }
}

fn bench_entity_overlay(c: &mut Criterion) {
    let entities = (0..500).map(mk_entity).collect::<Vec<_>>();
    let corrections = (0..1_000).map(|index| mk_correction(index, &entities)).collect::<Vec<_>>();
    let facts = FactsView {
        mentions: entities
            .iter()
            .map(|entity| MentionRecord {
                mention_id: MentionId::new(),
                run_id: "bench".to_string(),
                session_id: "s1".to_string(),
                entity_id: Some(entity.entity_id),
                text: entity.canonical_name.clone(),
                entity_type: entity.entity_type,
                description: None,
                evidence: Vec::new(),
                confidence: None,
            })
            .collect(),
        ..FactsView::default()
    };

    c.bench_function("entity_overlay_fold_1000_corrections", |b| {
        b.iter(|| {
            let state = load_entity_correction_state(&entities, &[], &corrections);
            let mut view = facts.clone();
            apply_entity_corrections(&mut view, &state);
            if view.mentions.len() > entities.len() {
                panic!("overlay benchmark grew the mention list");
            }
        });
    });
}

fn bench_search(c: &mut Criterion) {
    let utterances = (0..2_000)
        .map(|index: i64| Utterance {
            utterance_id: format!("u{index}"),
            session_id: "s1".to_string(),
            start_ms: index * 1_000,
            end_ms: index * 1_000 + 900,
            speaker: Some("DM".to_string()),
            text: format!("The goblin king guards vault {index} beneath the dark mountain"),
        })
        .collect::<Vec<_>>();
    let redaction = RedactionState::default();
    let spoilers = SpoilerState::default();

    c.bench_function("search_2000_utterances", |b| {
        b.iter(|| {
            let hits =
                search_utterances(&utterances, "goblin vault mountain", &redaction, &spoilers, None, 20);
            if hits.is_empty() {
                panic!("search benchmark returned no hits");
            }
        });
    });
}

criterion_group!(overlay_benches, bench_entity_overlay, bench_search);
criterion_main!(overlay_benches);
