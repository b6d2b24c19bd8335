//! Grounding of extracted claims against transcript text.
//!
//! Offsets are character offsets into [`Utterance::text`]. A span either carries a valid
//! `[char_start, char_end)` pair or no offsets at all, meaning the whole utterance.

use std::collections::{BTreeMap, BTreeSet};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    normalize_key, AtomicEvent, EvidenceConfig, EvidenceKind, EvidenceSpan, Mention,
    QuoteCandidate, Scene, SessionFacts, ThreadCandidate, Utterance,
};

/// Session utterances addressable by id and in transcript order `(start_ms, utterance_id)`.
pub struct UtteranceIndex<'a> {
    by_id: BTreeMap<&'a str, &'a Utterance>,
    ordered: Vec<&'a Utterance>,
}

impl<'a> UtteranceIndex<'a> {
    #[must_use]
    pub fn new(utterances: &'a [Utterance]) -> Self {
        let mut ordered = utterances.iter().collect::<Vec<_>>();
        ordered.sort_by(|left, right| {
            left.start_ms
                .cmp(&right.start_ms)
                .then_with(|| left.utterance_id.cmp(&right.utterance_id))
        });
        let by_id = ordered.iter().map(|utt| (utt.utterance_id.as_str(), *utt)).collect();
        Self { by_id, ordered }
    }

    #[must_use]
    pub fn get(&self, utterance_id: &str) -> Option<&'a Utterance> {
        self.by_id.get(utterance_id).copied()
    }

    #[must_use]
    pub fn ordered(&self) -> &[&'a Utterance] {
        &self.ordered
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanOutcome {
    pub spans: Vec<EvidenceSpan>,
    pub dropped: usize,
    pub clamped: usize,
}

/// Counters describing everything grounding changed for one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceReport {
    pub spans_dropped: usize,
    pub spans_clamped: usize,
    pub fallback_spans: usize,
    pub ungrounded_facts: usize,
    pub threads_inherited: usize,
    pub mentions_repaired: usize,
    pub mentions_dropped: usize,
    pub quotes_dropped: usize,
    pub quotes_clamped: usize,
    pub quote_clean_text_dropped: usize,
    pub quotes_deduped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroundedQuote {
    pub utterance_id: String,
    pub char_start: i64,
    pub char_end: i64,
    pub speaker: Option<String>,
    pub note: Option<String>,
    pub clean_text: Option<String>,
}

/// A run's facts after grounding; ready to be written as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundedFacts {
    pub mentions: Vec<Mention>,
    pub scenes: Vec<Scene>,
    pub events: Vec<AtomicEvent>,
    pub threads: Vec<ThreadCandidate>,
    pub quotes: Vec<GroundedQuote>,
    pub report: EvidenceReport,
}

/// Validate spans against their utterances, clamping overlong ends and dropping the rest.
#[must_use]
pub fn clean_evidence(evidence: &[EvidenceSpan], index: &UtteranceIndex<'_>) -> CleanOutcome {
    let mut outcome = CleanOutcome::default();
    for span in evidence {
        let Some(utterance) = index.get(&span.utterance_id) else {
            outcome.dropped += 1;
            continue;
        };
        match (span.char_start, span.char_end) {
            (Some(start), Some(end)) => match checked_offsets(start, end, utterance.char_len()) {
                Some((start, clamped_end, clamped)) => {
                    if clamped {
                        outcome.clamped += 1;
                    }
                    outcome.spans.push(EvidenceSpan {
                        char_start: Some(start),
                        char_end: Some(clamped_end),
                        ..span.clone()
                    });
                }
                None => outcome.dropped += 1,
            },
            (None, None) => outcome.spans.push(span.clone()),
            // A lone offset cannot describe a slice; keep the utterance as support.
            _ => outcome.spans.push(EvidenceSpan {
                char_start: None,
                char_end: None,
                ..span.clone()
            }),
        }
    }
    outcome
}

fn checked_offsets(start: i64, end: i64, len: i64) -> Option<(i64, i64, bool)> {
    if start < 0 || end <= start || start >= len {
        return None;
    }
    if end > len {
        return (len > start).then_some((start, len, true));
    }
    Some((start, end, false))
}

fn utterance_for_window<'a>(
    ordered: &[&'a Utterance],
    start_ms: i64,
    end_ms: i64,
) -> Option<&'a Utterance> {
    let (lo, hi) = if start_ms <= end_ms { (start_ms, end_ms) } else { (end_ms, start_ms) };
    if let Some(containing) =
        ordered.iter().find(|utt| utt.start_ms <= lo && utt.end_ms >= hi).copied()
    {
        return Some(containing);
    }

    let mut best: Option<(&Utterance, i64)> = None;
    for utterance in ordered {
        let overlap = utterance.end_ms.min(hi) - utterance.start_ms.max(lo);
        if overlap <= 0 {
            continue;
        }
        if best.map_or(true, |(_, best_overlap)| overlap > best_overlap) {
            best = Some((utterance, overlap));
        }
    }
    best.map(|(utterance, _)| utterance)
}

/// Whole-utterance support span for a time window, used when a scene or event lost all
/// of its evidence.
#[must_use]
pub fn fallback_by_time(
    index: &UtteranceIndex<'_>,
    start_ms: i64,
    end_ms: i64,
    confidence: f64,
) -> Option<EvidenceSpan> {
    utterance_for_window(index.ordered(), start_ms, end_ms).map(|utterance| {
        EvidenceSpan::whole_utterance(&utterance.utterance_id, EvidenceKind::Support, confidence)
    })
}

/// Lowercased copy of a text plus the original char index behind every folded char.
///
/// regex-lite case folding and classes are ASCII-only, so matching runs over this copy and
/// maps offsets back.
struct FoldedText {
    text: String,
    origins: Vec<usize>,
}

impl FoldedText {
    /// Lowercase every char. With `words_only`, every non-alphanumeric char becomes a space;
    /// otherwise only whitespace does.
    fn new(raw: &str, words_only: bool) -> Self {
        let mut text = String::with_capacity(raw.len());
        let mut origins = Vec::with_capacity(raw.len());
        for (position, ch) in raw.chars().enumerate() {
            let separator = if words_only { !ch.is_alphanumeric() } else { ch.is_whitespace() };
            if separator {
                text.push(' ');
                origins.push(position);
            } else {
                for lowered in ch.to_lowercase() {
                    text.push(lowered);
                    origins.push(position);
                }
            }
        }
        Self { text, origins }
    }

    fn is_word_start(&self, byte_index: usize) -> bool {
        let before = self.text.get(..byte_index).and_then(|prefix| prefix.chars().next_back());
        before.map_or(true, |ch| ch == ' ')
    }

    fn is_word_end(&self, byte_index: usize) -> bool {
        let after = self.text.get(byte_index..).and_then(|suffix| suffix.chars().next());
        after.map_or(true, |ch| ch == ' ')
    }

    /// Map a folded byte range back to a char range of the raw text.
    fn original_span(&self, start: usize, end: usize) -> Option<(i64, i64)> {
        let first = usize::try_from(char_offset(&self.text, start)).ok()?;
        let last = usize::try_from(char_offset(&self.text, end)).ok()?.checked_sub(1)?;
        let start = *self.origins.get(first)?;
        let end = *self.origins.get(last)? + 1;
        Some((i64::try_from(start).ok()?, i64::try_from(end).ok()?))
    }
}

/// Pattern over folded text matching `text` token by token, tolerating any run of
/// separators between tokens.
fn mention_pattern(text: &str) -> Option<Regex> {
    let folded = FoldedText::new(text, true);
    let body = folded.text.split_whitespace().map(regex_lite::escape).collect::<Vec<_>>().join(" *");
    if body.is_empty() {
        return None;
    }
    Regex::new(&body).ok()
}

/// Character range of the first whole-word, case-insensitive occurrence of a mention in
/// `haystack`. Whitespace and punctuation between tokens are ignored.
#[must_use]
pub fn find_mention_span(haystack: &str, text: &str) -> Option<(i64, i64)> {
    let pattern = mention_pattern(text)?;
    let folded = FoldedText::new(haystack, true);
    let mut from = 0;
    while let Some(found) = pattern.find_at(&folded.text, from) {
        if found.start() < found.end()
            && folded.is_word_start(found.start())
            && folded.is_word_end(found.end())
        {
            return folded.original_span(found.start(), found.end());
        }
        let step = folded.text.get(found.start()..)?.chars().next()?.len_utf8();
        from = found.start() + step;
    }
    None
}

/// Search the session, in transcript order, for the first occurrence of a mention's text.
#[must_use]
pub fn repair_mention(
    text: &str,
    index: &UtteranceIndex<'_>,
    confidence: f64,
) -> Option<EvidenceSpan> {
    index.ordered().iter().find_map(|utterance| {
        find_mention_span(&utterance.text, text).map(|(start, end)| EvidenceSpan {
            utterance_id: utterance.utterance_id.clone(),
            char_start: Some(start),
            char_end: Some(end),
            kind: EvidenceKind::Mention,
            confidence: Some(confidence),
        })
    })
}

/// Character range of the first case-insensitive occurrence of `needle` in `haystack`.
#[must_use]
pub fn find_quote_span(haystack: &str, needle: &str) -> Option<(i64, i64)> {
    let needle = FoldedText::new(needle, false);
    let body = needle
        .text
        .split_whitespace()
        .map(regex_lite::escape)
        .collect::<Vec<_>>()
        .join(" +");
    if body.is_empty() {
        return None;
    }
    let pattern = Regex::new(&body).ok()?;
    let folded = FoldedText::new(haystack, false);
    let found = pattern.find(&folded.text)?;
    folded.original_span(found.start(), found.end())
}

/// Token-level similarity in `[0, 1]`: twice the longest common token subsequence over the
/// total token count.
#[must_use]
pub fn token_similarity(left: &str, right: &str) -> f64 {
    let left = similarity_tokens(left);
    let right = similarity_tokens(right);
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let mut previous = vec![0_usize; right.len() + 1];
    for left_token in &left {
        let mut current = vec![0_usize; right.len() + 1];
        for (column, right_token) in right.iter().enumerate() {
            current[column + 1] = if left_token == right_token {
                previous[column] + 1
            } else {
                current[column].max(previous[column + 1])
            };
        }
        previous = current;
    }
    let common = previous[right.len()];
    ratio(2 * common, left.len() + right.len())
}

fn similarity_tokens(value: &str) -> Vec<String> {
    value
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    let numerator = u32::try_from(numerator).map_or(f64::from(u32::MAX), f64::from);
    let denominator = u32::try_from(denominator).map_or(f64::from(u32::MAX), f64::from);
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}

fn char_offset(text: &str, byte_index: usize) -> i64 {
    let chars = text.get(..byte_index).map_or(0, |prefix| prefix.chars().count());
    i64::try_from(chars).unwrap_or(i64::MAX)
}

fn char_slice(text: &str, start: i64, end: i64) -> String {
    let skip = usize::try_from(start).unwrap_or(0);
    let take = usize::try_from(end - start).unwrap_or(0);
    text.chars().skip(skip).take(take).collect()
}

/// Legacy quote ids encode a time window as `"<start_ms>-<end_ms>"`.
fn parse_legacy_time_id(raw: &str) -> Option<(i64, i64)> {
    let (start, end) = raw.split_once('-')?;
    let start = start.trim().parse::<i64>().ok()?;
    let end = end.trim().parse::<i64>().ok()?;
    (start <= end).then_some((start, end))
}

fn locate_quote(
    candidate: &QuoteCandidate,
    clean_text: Option<&str>,
    index: &UtteranceIndex<'_>,
    report: &mut EvidenceReport,
) -> Option<(String, i64, i64)> {
    if let Some(utterance) = index.get(&candidate.utterance_id) {
        match (candidate.char_start, candidate.char_end) {
            (Some(start), Some(end)) => {
                if let Some((start, end, clamped)) =
                    checked_offsets(start, end, utterance.char_len())
                {
                    if clamped {
                        report.quotes_clamped += 1;
                    }
                    return Some((utterance.utterance_id.clone(), start, end));
                }
            }
            (None, None) if clean_text.is_none() => return whole_utterance_quote(utterance),
            _ => {}
        }
        if let Some((start, end)) = clean_text.and_then(|text| find_quote_span(&utterance.text, text))
        {
            return Some((utterance.utterance_id.clone(), start, end));
        }
    }

    if let Some(text) = clean_text {
        for utterance in index.ordered() {
            if let Some((start, end)) = find_quote_span(&utterance.text, text) {
                return Some((utterance.utterance_id.clone(), start, end));
            }
        }
    }

    let (start_ms, end_ms) = parse_legacy_time_id(&candidate.utterance_id)?;
    let utterance = utterance_for_window(index.ordered(), start_ms, end_ms)?;
    if let (Some(start), Some(end)) = (candidate.char_start, candidate.char_end) {
        if let Some((start, end, clamped)) = checked_offsets(start, end, utterance.char_len()) {
            if clamped {
                report.quotes_clamped += 1;
            }
            return Some((utterance.utterance_id.clone(), start, end));
        }
    }
    if let Some((start, end)) = clean_text.and_then(|text| find_quote_span(&utterance.text, text)) {
        return Some((utterance.utterance_id.clone(), start, end));
    }
    whole_utterance_quote(utterance)
}

/// Quote covering a whole utterance; empty utterances cannot carry one.
fn whole_utterance_quote(utterance: &Utterance) -> Option<(String, i64, i64)> {
    let len = utterance.char_len();
    (len > 0).then(|| (utterance.utterance_id.clone(), 0, len))
}

/// Resolve a quote to concrete offsets, or `None` when nothing in the session grounds it.
///
/// Candidates are tried in order: the referenced utterance with its offsets, `clean_text`
/// inside it, `clean_text` anywhere in the session, then legacy time-window ids.
#[must_use]
pub fn repair_quote(
    candidate: &QuoteCandidate,
    index: &UtteranceIndex<'_>,
    config: &EvidenceConfig,
    report: &mut EvidenceReport,
) -> Option<GroundedQuote> {
    let clean_text =
        candidate.clean_text.as_deref().map(str::trim).filter(|text| !text.is_empty());
    let (utterance_id, char_start, char_end) =
        locate_quote(candidate, clean_text, index, report)?;
    let utterance = index.get(&utterance_id)?;

    let mut kept_clean_text = clean_text.map(str::to_string);
    if let Some(text) = clean_text {
        let raw = char_slice(&utterance.text, char_start, char_end);
        if token_similarity(&raw, text) < config.quote_similarity_threshold {
            tracing::debug!(utterance_id = %utterance_id, "discarding dissimilar quote clean_text");
            report.quote_clean_text_dropped += 1;
            kept_clean_text = None;
        }
    }

    Some(GroundedQuote {
        utterance_id,
        char_start,
        char_end,
        speaker: candidate.speaker.clone().or_else(|| utterance.speaker.clone()),
        note: candidate.note.clone(),
        clean_text: kept_clean_text,
    })
}

fn quote_dedupe_key(quote: &GroundedQuote, index: &UtteranceIndex<'_>) -> (String, String) {
    let text = quote.clean_text.clone().unwrap_or_else(|| {
        index
            .get(&quote.utterance_id)
            .map(|utt| char_slice(&utt.text, quote.char_start, quote.char_end))
            .unwrap_or_default()
    });
    (quote.utterance_id.clone(), normalize_key(&text))
}

fn ground_mention(
    mention: &Mention,
    index: &UtteranceIndex<'_>,
    config: &EvidenceConfig,
    report: &mut EvidenceReport,
) -> Option<Mention> {
    if mention.text.trim().is_empty() {
        report.mentions_dropped += 1;
        return None;
    }
    let cleaned = clean_evidence(&mention.evidence, index);
    report.spans_dropped += cleaned.dropped;
    report.spans_clamped += cleaned.clamped;

    let mut evidence = cleaned.spans;
    if evidence.is_empty() {
        let repaired = if config.repair_mentions {
            repair_mention(&mention.text, index, config.mention_repair_confidence)
        } else {
            None
        };
        if let Some(span) = repaired {
            report.mentions_repaired += 1;
            evidence.push(span);
        } else {
            tracing::debug!(text = %mention.text, "dropping ungrounded mention");
            report.mentions_dropped += 1;
            return None;
        }
    }
    Some(Mention { evidence, ..mention.clone() })
}

fn ground_timed(
    evidence: &[EvidenceSpan],
    start_ms: i64,
    end_ms: i64,
    index: &UtteranceIndex<'_>,
    config: &EvidenceConfig,
    report: &mut EvidenceReport,
) -> Vec<EvidenceSpan> {
    let cleaned = clean_evidence(evidence, index);
    report.spans_dropped += cleaned.dropped;
    report.spans_clamped += cleaned.clamped;
    let mut spans = cleaned.spans;
    if spans.is_empty() && config.fallback_by_time {
        if let Some(span) = fallback_by_time(index, start_ms, end_ms, config.fallback_confidence) {
            report.fallback_spans += 1;
            spans.push(span);
        }
    }
    if spans.is_empty() {
        report.ungrounded_facts += 1;
    }
    spans
}

fn ground_thread(
    thread: &ThreadCandidate,
    index: &UtteranceIndex<'_>,
    report: &mut EvidenceReport,
) -> ThreadCandidate {
    let mut grounded = thread.clone();
    for update in &mut grounded.updates {
        let cleaned = clean_evidence(&update.evidence, index);
        report.spans_dropped += cleaned.dropped;
        report.spans_clamped += cleaned.clamped;
        update.evidence = cleaned.spans;
    }

    let cleaned = clean_evidence(&thread.evidence, index);
    report.spans_dropped += cleaned.dropped;
    report.spans_clamped += cleaned.clamped;
    grounded.evidence = cleaned.spans;

    if grounded.evidence.is_empty() {
        let mut inherited: Vec<EvidenceSpan> = Vec::new();
        for span in grounded.updates.iter().flat_map(|update| update.evidence.iter()) {
            if !inherited.contains(span) {
                inherited.push(span.clone());
            }
        }
        if inherited.is_empty() {
            report.ungrounded_facts += 1;
        } else {
            report.threads_inherited += 1;
        }
        grounded.evidence = inherited;
    }
    grounded
}

/// Ground every fact of one extraction payload against the session's utterances.
#[must_use]
pub fn ground_session_facts(
    facts: &SessionFacts,
    utterances: &[Utterance],
    config: &EvidenceConfig,
) -> GroundedFacts {
    let index = UtteranceIndex::new(utterances);
    let mut report = EvidenceReport::default();

    let mentions = facts
        .mentions
        .iter()
        .filter_map(|mention| ground_mention(mention, &index, config, &mut report))
        .collect();

    let scenes = facts
        .scenes
        .iter()
        .map(|scene| Scene {
            evidence: ground_timed(
                &scene.evidence,
                scene.start_ms,
                scene.end_ms,
                &index,
                config,
                &mut report,
            ),
            ..scene.clone()
        })
        .collect();

    let events = facts
        .events
        .iter()
        .map(|event| AtomicEvent {
            evidence: ground_timed(
                &event.evidence,
                event.start_ms,
                event.end_ms,
                &index,
                config,
                &mut report,
            ),
            ..event.clone()
        })
        .collect();

    let threads =
        facts.threads.iter().map(|thread| ground_thread(thread, &index, &mut report)).collect();

    let mut quotes = Vec::new();
    let mut seen = BTreeSet::new();
    for candidate in &facts.quotes {
        let Some(quote) = repair_quote(candidate, &index, config, &mut report) else {
            tracing::debug!(utterance_id = %candidate.utterance_id, "dropping ungrounded quote");
            report.quotes_dropped += 1;
            continue;
        };
        if seen.insert(quote_dedupe_key(&quote, &index)) {
            quotes.push(quote);
        } else {
            report.quotes_deduped += 1;
        }
    }

    GroundedFacts { mentions, scenes, events, threads, quotes, report }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{EntityType, EventType, ThreadKind, ThreadStatus, ThreadUpdate};

    fn utterance(id: &str, start_ms: i64, end_ms: i64, text: &str) -> Utterance {
        Utterance {
            utterance_id: id.to_string(),
            session_id: "session-1".to_string(),
            start_ms,
            end_ms,
            speaker: Some("DM".to_string()),
            text: text.to_string(),
        }
    }

    fn span(utterance_id: &str, start: Option<i64>, end: Option<i64>) -> EvidenceSpan {
        EvidenceSpan {
            utterance_id: utterance_id.to_string(),
            char_start: start,
            char_end: end,
            kind: EvidenceKind::Support,
            confidence: None,
        }
    }

    fn quote(utterance_id: &str, start: Option<i64>, end: Option<i64>, clean: Option<&str>) -> QuoteCandidate {
        QuoteCandidate {
            utterance_id: utterance_id.to_string(),
            char_start: start,
            char_end: end,
            speaker: None,
            note: None,
            clean_text: clean.map(str::to_string),
        }
    }

    #[test]
    fn clean_evidence_drops_invalid_and_clamps_overlong_spans() {
        let utterances = vec![utterance("u1", 0, 1_000, "hello")];
        let index = UtteranceIndex::new(&utterances);
        let outcome = clean_evidence(
            &[
                span("u1", Some(0), Some(2)),
                span("u1", Some(-1), Some(1)),
                span("missing", Some(0), Some(1)),
                span("u1", Some(0), Some(99)),
            ],
            &index,
        );

        assert_eq!(outcome.spans.len(), 2);
        assert_eq!(outcome.dropped, 2);
        assert_eq!(outcome.clamped, 1);
        assert_eq!(outcome.spans[1].char_end, Some(5));
    }

    #[test]
    fn clean_evidence_clamps_mention_span_to_text_length() {
        let utterances = vec![utterance("u1", 0, 1_000, "Goblin attacks the party.")];
        let index = UtteranceIndex::new(&utterances);
        let mut mention_span = span("u1", Some(0), Some(99));
        mention_span.kind = EvidenceKind::Mention;

        let outcome = clean_evidence(&[mention_span], &index);

        assert_eq!(outcome.clamped, 1);
        assert_eq!(outcome.dropped, 0);
        assert_eq!(outcome.spans[0].char_start, Some(0));
        assert_eq!(outcome.spans[0].char_end, Some(25));
        assert_eq!(outcome.spans[0].kind, EvidenceKind::Mention);
    }

    #[test]
    fn clean_evidence_keeps_whole_utterance_and_normalizes_lone_offsets() {
        let utterances = vec![utterance("u1", 0, 1_000, "hello")];
        let index = UtteranceIndex::new(&utterances);
        let outcome = clean_evidence(
            &[span("u1", None, None), span("u1", Some(1), None), span("u1", Some(5), Some(6))],
            &index,
        );

        assert_eq!(outcome.spans.len(), 2);
        assert!(outcome.spans.iter().all(|s| s.char_start.is_none() && s.char_end.is_none()));
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn clean_evidence_counts_characters_not_bytes() {
        let utterances = vec![utterance("u1", 0, 1_000, "Émile lève l'épée")];
        let index = UtteranceIndex::new(&utterances);
        let outcome = clean_evidence(&[span("u1", Some(0), Some(17))], &index);

        assert_eq!(outcome.clamped, 0);
        assert_eq!(outcome.spans[0].char_end, Some(17));
    }

    #[test]
    fn fallback_prefers_containing_then_largest_overlap() {
        let utterances = vec![
            utterance("u1", 0, 1_000, "first"),
            utterance("u2", 1_000, 5_000, "second"),
            utterance("u3", 5_000, 6_000, "third"),
        ];
        let index = UtteranceIndex::new(&utterances);

        let contained = fallback_by_time(&index, 1_500, 2_000, 0.3);
        assert_eq!(contained.map(|s| s.utterance_id), Some("u2".to_string()));

        let overlapping = fallback_by_time(&index, 4_500, 6_500, 0.3);
        assert_eq!(overlapping.as_ref().map(|s| s.utterance_id.as_str()), Some("u3"));
        assert_eq!(overlapping.as_ref().and_then(|s| s.confidence), Some(0.3));
        assert_eq!(overlapping.map(|s| s.kind), Some(EvidenceKind::Support));

        assert!(fallback_by_time(&index, 10_000, 11_000, 0.3).is_none());
    }

    #[test]
    fn mention_match_tolerates_case_and_punctuation() {
        assert_eq!(find_mention_span("sir galahad", "Sir Galahad"), Some((0, 11)));
        assert_eq!(find_mention_span("hail, Sir-Galahad!", "Sir Galahad"), Some((6, 17)));
        assert_eq!(find_mention_span("sirgalahadx", "Sir Galahad"), None);
        assert_eq!(find_mention_span("anything", " ,. "), None);
    }

    #[test]
    fn mention_match_folds_non_ascii_case_and_respects_word_edges() {
        assert_eq!(find_mention_span("Then élan vital stirs", "Élan"), Some((5, 9)));
        assert_eq!(find_mention_span("ÉLAN", "élan"), Some((0, 4)));
        assert_eq!(find_mention_span("Noélan was here, élan too", "élan"), Some((17, 21)));
        assert_eq!(find_mention_span("Ödön\u{a0}Kovács waves", "ödön kovács"), Some((0, 11)));
    }

    #[test]
    fn repair_mention_finds_first_occurrence_in_transcript_order() {
        let utterances = vec![
            utterance("u2", 2_000, 3_000, "The goblin flees"),
            utterance("u1", 0, 1_000, "A goblin emerges"),
        ];
        let index = UtteranceIndex::new(&utterances);

        let Some(repaired) = repair_mention("Goblin", &index, 0.6) else {
            panic!("goblin should be found");
        };
        assert_eq!(repaired.utterance_id, "u1");
        assert_eq!((repaired.char_start, repaired.char_end), (Some(2), Some(8)));
        assert_eq!(repaired.kind, EvidenceKind::Mention);
        assert_eq!(repaired.confidence, Some(0.6));
    }

    #[test]
    fn repair_mention_reports_character_offsets_after_multibyte_text() {
        let utterances = vec![utterance("u1", 0, 1_000, "Café… then Goblin")];
        let index = UtteranceIndex::new(&utterances);
        let repaired = repair_mention("goblin", &index, 0.6);
        assert_eq!(repaired.and_then(|s| s.char_start), Some(11));
    }

    #[test]
    fn quote_helpers_match_expected_offsets_and_similarity() {
        assert_eq!(find_quote_span("Hello there", "there"), Some((6, 11)));
        assert_eq!(find_quote_span("Hello there", "THERE"), Some((6, 11)));
        assert_eq!(find_quote_span("Hello there", "   "), None);
        assert!(token_similarity("Hello", "hello") >= 0.9);
        assert!(token_similarity("the dragon sleeps", "a merchant sings") < 0.6);
    }

    #[test]
    fn quote_repair_follows_resolution_order() {
        let utterances = vec![
            utterance("u1", 0, 2_000, "We ride at dawn, friends."),
            utterance("u2", 2_000, 4_000, "Nobody leaves this tavern alive."),
        ];
        let index = UtteranceIndex::new(&utterances);
        let config = EvidenceConfig::default();
        let mut report = EvidenceReport::default();

        let exact = repair_quote(&quote("u1", Some(0), Some(15), None), &index, &config, &mut report);
        assert_eq!(exact.map(|q| (q.char_start, q.char_end)), Some((0, 15)));

        let by_text =
            repair_quote(&quote("u1", Some(40), Some(50), Some("ride at dawn")), &index, &config, &mut report);
        assert_eq!(by_text.map(|q| (q.utterance_id, q.char_start, q.char_end)), Some(("u1".to_string(), 3, 15)));

        let elsewhere = repair_quote(
            &quote("u1", None, None, Some("leaves this tavern")),
            &index,
            &config,
            &mut report,
        );
        assert_eq!(elsewhere.map(|q| q.utterance_id), Some("u2".to_string()));

        let legacy = repair_quote(&quote("2500-3000", None, None, None), &index, &config, &mut report);
        assert_eq!(legacy.map(|q| (q.utterance_id, q.char_start, q.char_end)), Some(("u2".to_string(), 0, 32)));

        let missing = repair_quote(&quote("nope", Some(0), Some(3), Some("absent words")), &index, &config, &mut report);
        assert!(missing.is_none());
    }

    #[test]
    fn quote_repair_discards_dissimilar_clean_text_but_keeps_offsets() {
        let utterances = vec![utterance("u1", 0, 2_000, "We ride at dawn, friends.")];
        let index = UtteranceIndex::new(&utterances);
        let mut report = EvidenceReport::default();

        let repaired = repair_quote(
            &quote("u1", Some(0), Some(15), Some("the moon is green")),
            &index,
            &EvidenceConfig::default(),
            &mut report,
        );

        let Some(repaired) = repaired else {
            panic!("quote should be kept on its offsets");
        };
        assert_eq!((repaired.char_start, repaired.char_end), (0, 15));
        assert!(repaired.clean_text.is_none());
        assert_eq!(repaired.speaker.as_deref(), Some("DM"));
        assert_eq!(report.quote_clean_text_dropped, 1);
    }

    #[test]
    fn quote_match_folds_non_ascii_case() {
        assert_eq!(find_quote_span("Über alles, sagt ÖDÖN", "sagt ödön"), Some((12, 21)));
    }

    #[test]
    fn quotes_on_empty_utterances_are_dropped_instead_of_zero_length() {
        let utterances = vec![utterance("u1", 0, 1_000, "")];
        let index = UtteranceIndex::new(&utterances);
        let config = EvidenceConfig::default();
        let mut report = EvidenceReport::default();

        let direct = repair_quote(&quote("u1", None, None, None), &index, &config, &mut report);
        let legacy = repair_quote(&quote("0-1000", None, None, None), &index, &config, &mut report);

        assert!(direct.is_none());
        assert!(legacy.is_none());
    }

    #[test]
    fn grounding_counts_quotes_dropped_on_empty_utterances() {
        let utterances = vec![utterance("u1", 0, 1_000, ""), utterance("u2", 1_000, 2_000, "Onward!")];
        let facts = SessionFacts {
            quotes: vec![quote("u1", None, None, None), quote("u2", None, None, None)],
            ..SessionFacts::default()
        };

        let grounded = ground_session_facts(&facts, &utterances, &EvidenceConfig::default());

        assert_eq!(grounded.quotes.len(), 1);
        assert_eq!((grounded.quotes[0].char_start, grounded.quotes[0].char_end), (0, 7));
        assert_eq!(grounded.report.quotes_dropped, 1);
    }

    fn mention(text: &str, evidence: Vec<EvidenceSpan>) -> Mention {
        Mention {
            text: text.to_string(),
            entity_type: EntityType::Monster,
            description: None,
            evidence,
            confidence: Some(0.9),
        }
    }

    #[test]
    fn grounding_repairs_mentions_and_inherits_thread_evidence() {
        let utterances = vec![
            utterance("u1", 0, 1_000, "A goblin emerges"),
            utterance("u2", 1_000, 2_000, "We swear to find the lost crown."),
        ];
        let update_span = span("u2", Some(0), Some(8));
        let facts = SessionFacts {
            mentions: vec![mention("Goblin", vec![]), mention("Dragon", vec![])],
            scenes: vec![Scene {
                title: Some("Ambush".to_string()),
                start_ms: 100,
                end_ms: 900,
                summary: "Goblins attack".to_string(),
                location: None,
                participants: vec!["Goblin".to_string()],
                evidence: vec![span("gone", None, None)],
                confidence: None,
            }],
            events: vec![AtomicEvent {
                event_type: EventType::Combat,
                start_ms: 50_000,
                end_ms: 60_000,
                summary: "Nothing nearby".to_string(),
                entities: vec![],
                evidence: vec![],
                confidence: None,
            }],
            threads: vec![ThreadCandidate {
                title: "The Lost Crown".to_string(),
                kind: ThreadKind::Quest,
                status: ThreadStatus::Active,
                summary: None,
                entities: vec![],
                updates: vec![ThreadUpdate {
                    update_type: "start".to_string(),
                    note: "The oath is sworn".to_string(),
                    evidence: vec![update_span.clone()],
                    related_event_indexes: vec![],
                }],
                evidence: vec![],
                confidence: None,
            }],
            quotes: vec![
                quote("u2", Some(0), Some(8), None),
                quote("u2", Some(0), Some(8), None),
            ],
        };

        let grounded = ground_session_facts(&facts, &utterances, &EvidenceConfig::default());

        assert_eq!(grounded.mentions.len(), 1);
        assert_eq!(grounded.mentions[0].evidence[0].char_start, Some(2));
        assert_eq!(grounded.report.mentions_repaired, 1);
        assert_eq!(grounded.report.mentions_dropped, 1);

        assert_eq!(grounded.scenes[0].evidence.len(), 1);
        assert_eq!(grounded.scenes[0].evidence[0].utterance_id, "u1");
        assert_eq!(grounded.report.fallback_spans, 1);
        assert!(grounded.events[0].evidence.is_empty());
        assert_eq!(grounded.report.ungrounded_facts, 1);

        assert_eq!(grounded.threads[0].evidence, vec![update_span]);
        assert_eq!(grounded.report.threads_inherited, 1);

        assert_eq!(grounded.quotes.len(), 1);
        assert_eq!(grounded.report.quotes_deduped, 1);
        assert_eq!(grounded.report.spans_dropped, 1);
    }

    #[test]
    fn grounding_respects_disabled_repairs() {
        let utterances = vec![utterance("u1", 0, 1_000, "A goblin emerges")];
        let config = EvidenceConfig { fallback_by_time: false, repair_mentions: false, ..EvidenceConfig::default() };
        let facts = SessionFacts {
            mentions: vec![mention("Goblin", vec![])],
            scenes: vec![Scene {
                title: None,
                start_ms: 0,
                end_ms: 500,
                summary: "Quiet".to_string(),
                location: None,
                participants: vec![],
                evidence: vec![],
                confidence: None,
            }],
            ..SessionFacts::default()
        };

        let grounded = ground_session_facts(&facts, &utterances, &config);

        assert!(grounded.mentions.is_empty());
        assert!(grounded.scenes[0].evidence.is_empty());
        assert_eq!(grounded.report.fallback_spans, 0);
    }

    proptest! {
        #[test]
        fn property_cleaned_spans_lie_inside_their_utterance(
            text in "[a-zA-Zé ]{0,40}",
            offsets in proptest::collection::vec((proptest::option::of(-5_i64..60), proptest::option::of(-5_i64..60)), 0..12),
        ) {
            let utterances = vec![utterance("u1", 0, 1_000, &text)];
            let index = UtteranceIndex::new(&utterances);
            let spans = offsets
                .iter()
                .map(|(start, end)| span("u1", *start, *end))
                .collect::<Vec<_>>();

            let outcome = clean_evidence(&spans, &index);
            let len = utterances[0].char_len();

            prop_assert_eq!(outcome.spans.len() + outcome.dropped, spans.len());
            for cleaned in &outcome.spans {
                match (cleaned.char_start, cleaned.char_end) {
                    (Some(start), Some(end)) => {
                        prop_assert!(0 <= start && start < end && end <= len);
                    }
                    (None, None) => {}
                    other => prop_assert!(false, "half-open span survived: {:?}", other),
                }
            }
        }
    }
}
