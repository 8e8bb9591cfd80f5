//! Ingestion boundary: scraped-record contract, event identity resolution,
//! content identity, and the admission pipeline.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use spicerack_classify::{peer_population, score_spice, ArchetypeClassifier};
use spicerack_core::{parse_card_lines, CardLine, Format, NewDeck};
use spicerack_storage::{ensure_archetype, DateWindow, DeckStore};

pub const CRATE_NAME: &str = "spicerack-ingest";

/// Scheduling drift between sources: the same real-world event may be dated
/// one calendar day apart.
pub const EVENT_DATE_TOLERANCE_DAYS: u64 = 1;

// ---------------------------------------------------------------------------
// Scraped input contract

/// One deck as handed over by the scraping collaborator. Untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedDeck {
    pub player_name: String,
    pub format: Format,
    pub event_name: String,
    pub event_date: NaiveDate,
    #[serde(default)]
    pub rank: u32,
    pub raw_decklist: String,
    #[serde(default)]
    pub sideboard: Option<String>,
    pub source_url: String,
    #[serde(default)]
    pub upstream_archetype_hint: Option<String>,
}

/// Parse a scraped batch file: a JSON array of records.
pub fn parse_scraped_batch(text: &str) -> Result<Vec<ScrapedDeck>> {
    serde_json::from_str(text).context("parsing scraped batch JSON")
}

// ---------------------------------------------------------------------------
// Event name normalization

fn is_iso_date_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

fn is_duplicate_suffix_token(token: &str) -> bool {
    token.len() > 2
        && token.starts_with('(')
        && token.ends_with(')')
        && token[1..token.len() - 1].bytes().all(|b| b.is_ascii_digit())
}

const SOURCE_MARKERS: &[&str] = &["mtgo"];

/// The stored/displayed event name: source markers, ISO dates, and duplicate
/// suffixes stripped, with the format word leading.
///
/// "MTGO League" in Modern becomes "Modern League";
/// "Standard Challenge 32 2026-01-22 (1)" becomes "Standard Challenge 32".
pub fn canonical_event_name(raw: &str, format: Format) -> String {
    let tokens: Vec<&str> = raw
        .split_whitespace()
        .filter(|t| !SOURCE_MARKERS.iter().any(|m| t.eq_ignore_ascii_case(m)))
        .filter(|t| !is_iso_date_token(t))
        .filter(|t| !is_duplicate_suffix_token(t))
        .collect();
    let has_format = tokens
        .iter()
        .any(|t| t.eq_ignore_ascii_case(format.as_str()));
    let mut name = String::new();
    if !has_format {
        name.push_str(format.as_str());
    }
    for token in tokens {
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(token);
    }
    if name.is_empty() {
        name = format.as_str().to_string();
    }
    name
}

/// Event type buckets. Two events from different buckets are never the same
/// real-world event, regardless of name similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventBucket {
    League,
    Challenge,
    Qualifier,
    Showcase,
    Preliminary,
    Championship,
    Other,
}

impl EventBucket {
    /// Substring test over the comparison name, in priority order.
    fn from_comparison_name(name: &str) -> Self {
        const ORDER: &[(&str, EventBucket)] = &[
            ("league", EventBucket::League),
            ("challenge", EventBucket::Challenge),
            ("qualifier", EventBucket::Qualifier),
            ("showcase", EventBucket::Showcase),
            ("preliminary", EventBucket::Preliminary),
            ("championship", EventBucket::Championship),
        ];
        ORDER
            .iter()
            .find(|(needle, _)| name.contains(needle))
            .map(|(_, bucket)| *bucket)
            .unwrap_or(EventBucket::Other)
    }
}

/// Identity key for one event name: type bucket, optional event number, and
/// the remaining name stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub bucket: EventBucket,
    pub number: Option<u64>,
    pub stem: String,
}

impl EventKey {
    pub fn from_raw(raw: &str, format: Format) -> Self {
        let canonical = canonical_event_name(raw, format).to_lowercase();
        let mut tokens: Vec<&str> = canonical
            .split_whitespace()
            .filter(|t| !t.eq_ignore_ascii_case(format.as_str()))
            .filter(|t| *t != "showcase")
            .collect();
        let comparison_name = tokens.join(" ");
        let bucket = EventBucket::from_comparison_name(&comparison_name);

        // A leading or trailing integer is the event number ("Challenge 32").
        let mut number = None;
        if let Some(first) = tokens.first() {
            if let Ok(n) = first.parse::<u64>() {
                number = Some(n);
                tokens.remove(0);
            }
        }
        if number.is_none() {
            if let Some(last) = tokens.last() {
                if let Ok(n) = last.parse::<u64>() {
                    number = Some(n);
                    tokens.pop();
                }
            }
        }

        Self {
            bucket,
            number,
            stem: tokens.join(" "),
        }
    }

    /// Same real-world event series: same bucket, same stem, and event
    /// numbers equal (both present and matching, or both absent).
    pub fn matches(&self, other: &EventKey) -> bool {
        self.bucket == other.bucket && self.number == other.number && self.stem == other.stem
    }

    /// A "league"-bucketed or otherwise featureless label is generic; anything
    /// else is the more specific side of a content-duplicate tie-break.
    pub fn is_generic(&self) -> bool {
        self.bucket == EventBucket::League
            || (self.bucket == EventBucket::Other && self.stem.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Per-pass caches

/// Explicit lookup caches handed into the resolver and pipeline. Scope is one
/// ingest pass; drop it (or `clear`) between passes.
///
/// An event admitted earlier in the same pass is tracked separately from the
/// store-existence memo: later decks of that event still belong to it and must
/// not be rejected as duplicates of themselves.
#[derive(Debug, Default)]
pub struct PassCache {
    store_exists: HashMap<(Format, NaiveDate, EventKey), bool>,
    admitted_events: Vec<(Format, NaiveDate, EventKey)>,
    archetype_ids: HashMap<(Format, String), i64>,
}

impl PassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.store_exists.clear();
        self.admitted_events.clear();
        self.archetype_ids.clear();
    }
}

fn dates_within_tolerance(a: NaiveDate, b: NaiveDate) -> bool {
    (a - b).num_days().abs() <= EVENT_DATE_TOLERANCE_DAYS as i64
}

// ---------------------------------------------------------------------------
// Event identity resolver

/// Decides whether an incoming (format, date, event name) triple refers to an
/// already-stored event.
pub struct EventIdentityResolver<'a> {
    store: &'a dyn DeckStore,
}

impl<'a> EventIdentityResolver<'a> {
    pub fn new(store: &'a dyn DeckStore) -> Self {
        Self { store }
    }

    /// True when a stored event in this format matches by key within ±1 day.
    ///
    /// A storage error is answered "not found": admitting a possible duplicate
    /// beats silently dropping a result.
    pub async fn exists(
        &self,
        cache: &mut PassCache,
        format: Format,
        date: NaiveDate,
        raw_event_name: &str,
    ) -> bool {
        let key = EventKey::from_raw(raw_event_name, format);
        let cache_key = (format, date, key.clone());
        if let Some(hit) = cache.store_exists.get(&cache_key) {
            return *hit;
        }

        let window = DateWindow::around(date, EVENT_DATE_TOLERANCE_DAYS);
        match self.store.find_event_names(format, window).await {
            Ok(events) => {
                let found = events
                    .iter()
                    .any(|event| EventKey::from_raw(&event.event_name, format).matches(&key));
                cache.store_exists.insert(cache_key, found);
                found
            }
            Err(err) => {
                warn!(
                    error = %err,
                    %format,
                    event = raw_event_name,
                    "storage error during event identity check; treating as not found"
                );
                false
            }
        }
    }

    /// Record that an event was just admitted in this pass.
    pub fn mark_admitted(
        &self,
        cache: &mut PassCache,
        format: Format,
        date: NaiveDate,
        raw_event_name: &str,
    ) {
        let key = EventKey::from_raw(raw_event_name, format);
        let already = cache
            .admitted_events
            .iter()
            .any(|(f, d, k)| *f == format && dates_within_tolerance(*d, date) && k.matches(&key));
        if !already {
            cache.admitted_events.push((format, date, key));
        }
    }

    /// True when this pass already admitted the event: later decks of it are
    /// part of the same scrape, not duplicates.
    pub fn admitted_this_pass(
        &self,
        cache: &PassCache,
        format: Format,
        date: NaiveDate,
        raw_event_name: &str,
    ) -> bool {
        let key = EventKey::from_raw(raw_event_name, format);
        cache
            .admitted_events
            .iter()
            .any(|(f, d, k)| *f == format && dates_within_tolerance(*d, date) && k.matches(&key))
    }
}

// ---------------------------------------------------------------------------
// Content identity

/// Digest of the raw decklist text as scraped. Two records with equal digests
/// hold byte-identical lists.
pub fn decklist_digest(raw_decklist: &str, sideboard: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_decklist.as_bytes());
    if let Some(side) = sideboard {
        hasher.update(b"\n--\n");
        hasher.update(side.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepSide {
    Existing,
    Incoming,
}

/// Tie-break for two records carrying the same list: prefer the more specific
/// event label; equally specific keeps the earliest-ingested record.
pub fn resolve_content_duplicate(existing: &EventKey, incoming: &EventKey) -> KeepSide {
    match (existing.is_generic(), incoming.is_generic()) {
        (true, false) => KeepSide::Incoming,
        _ => KeepSide::Existing,
    }
}

// ---------------------------------------------------------------------------
// Admission pipeline

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    MissingDecklist,
    DuplicateEvent,
    DuplicateContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Admitted {
        deck_id: i64,
        archetype: String,
        spice_count: u32,
        replaced: bool,
    },
    Skipped(SkipReason),
}

/// Counters for one ingest batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub admitted: usize,
    pub replaced: usize,
    pub skipped_missing_decklist: usize,
    pub skipped_duplicate_event: usize,
    pub skipped_duplicate_content: usize,
    pub failed: usize,
}

/// Sequences resolver → classifier → spice → store for scraped records.
pub struct IngestPipeline<'a> {
    store: &'a dyn DeckStore,
    classifier: &'a ArchetypeClassifier,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(store: &'a dyn DeckStore, classifier: &'a ArchetypeClassifier) -> Self {
        Self { store, classifier }
    }

    /// Admit one scraped record. Storage failures propagate; everything the
    /// spec treats as a normal outcome comes back as [`IngestOutcome`].
    pub async fn admit(
        &self,
        cache: &mut PassCache,
        scraped: &ScrapedDeck,
    ) -> Result<IngestOutcome> {
        let mainboard = match parse_card_lines(&scraped.raw_decklist) {
            Ok(lines) if !lines.is_empty() => lines,
            Ok(_) => {
                warn!(player = scraped.player_name, "scraped record has no card lines; skipping");
                return Ok(IngestOutcome::Skipped(SkipReason::MissingDecklist));
            }
            Err(err) => {
                warn!(
                    player = scraped.player_name,
                    error = %err,
                    "scraped decklist unparsable; skipping"
                );
                return Ok(IngestOutcome::Skipped(SkipReason::MissingDecklist));
            }
        };
        // Partial data is tolerated: a malformed sideboard degrades to empty.
        let sideboard: Vec<CardLine> = match scraped.sideboard.as_deref() {
            Some(text) => parse_card_lines(text).unwrap_or_else(|err| {
                warn!(player = scraped.player_name, error = %err, "sideboard unparsable; ignoring");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let resolver = EventIdentityResolver::new(self.store);
        let same_event_in_flight = resolver.admitted_this_pass(
            cache,
            scraped.format,
            scraped.event_date,
            &scraped.event_name,
        );
        if !same_event_in_flight
            && resolver
                .exists(cache, scraped.format, scraped.event_date, &scraped.event_name)
                .await
        {
            return Ok(IngestOutcome::Skipped(SkipReason::DuplicateEvent));
        }

        let digest = decklist_digest(&scraped.raw_decklist, scraped.sideboard.as_deref());
        let incoming_key = EventKey::from_raw(&scraped.event_name, scraped.format);
        let near = self
            .store
            .find_decks_by_player(
                &scraped.player_name,
                scraped.format,
                DateWindow::around(scraped.event_date, EVENT_DATE_TOLERANCE_DAYS),
            )
            .await
            .context("querying player decks for content identity")?;
        let mut losers = Vec::new();
        for candidate in near.iter().filter(|c| c.decklist_digest == digest) {
            let existing_key = EventKey::from_raw(&candidate.event_name, scraped.format);
            match resolve_content_duplicate(&existing_key, &incoming_key) {
                KeepSide::Existing => {
                    debug!(
                        deck_id = candidate.id,
                        "byte-identical list already stored under a better label; skipping"
                    );
                    return Ok(IngestOutcome::Skipped(SkipReason::DuplicateContent));
                }
                KeepSide::Incoming => losers.push(candidate.id),
            }
        }
        let replaced = !losers.is_empty();
        for deck_id in losers {
            self.store
                .delete_deck(deck_id)
                .await
                .context("replacing generic-label duplicate")?;
        }

        let haystack = match scraped.sideboard.as_deref() {
            Some(side) => format!("{}\n{}", scraped.raw_decklist, side),
            None => scraped.raw_decklist.clone(),
        };
        let classification = self
            .classifier
            .classify(&haystack, scraped.format, scraped.upstream_archetype_hint.as_deref())
            .await;

        let archetype_id = self
            .ensure_archetype_cached(cache, &classification.archetype, scraped.format)
            .await?;

        let peers = peer_population(self.store, archetype_id, scraped.event_date, None)
            .await
            .context("loading peer population for spice")?;
        let spice = score_spice(&mainboard, &sideboard, &peers);

        let deck_id = self
            .store
            .insert_deck(NewDeck {
                player_name: scraped.player_name.clone(),
                format: scraped.format,
                event_name_raw: scraped.event_name.clone(),
                event_name: canonical_event_name(&scraped.event_name, scraped.format),
                event_date: scraped.event_date,
                rank: scraped.rank,
                archetype_id,
                mainboard,
                sideboard,
                source_url: scraped.source_url.clone(),
                spice_count: spice.count,
                spice_cards: spice.cards.clone(),
                decklist_digest: digest,
            })
            .await
            .context("inserting admitted deck")?;
        resolver.mark_admitted(cache, scraped.format, scraped.event_date, &scraped.event_name);

        debug!(
            deck_id,
            archetype = %classification.archetype,
            method = %classification.method,
            spice = spice.count,
            replaced,
            "admitted deck"
        );
        Ok(IngestOutcome::Admitted {
            deck_id,
            archetype: classification.archetype,
            spice_count: spice.count,
            replaced,
        })
    }

    /// Admit a whole batch with a fresh cache. A failed item is logged and
    /// skipped; the batch keeps going.
    pub async fn admit_all(&self, batch: &[ScrapedDeck]) -> IngestReport {
        let mut cache = PassCache::new();
        let mut report = IngestReport::default();
        for scraped in batch {
            match self.admit(&mut cache, scraped).await {
                Ok(IngestOutcome::Admitted { replaced, .. }) => {
                    report.admitted += 1;
                    if replaced {
                        report.replaced += 1;
                    }
                }
                Ok(IngestOutcome::Skipped(SkipReason::MissingDecklist)) => {
                    report.skipped_missing_decklist += 1;
                }
                Ok(IngestOutcome::Skipped(SkipReason::DuplicateEvent)) => {
                    report.skipped_duplicate_event += 1;
                }
                Ok(IngestOutcome::Skipped(SkipReason::DuplicateContent)) => {
                    report.skipped_duplicate_content += 1;
                }
                Err(err) => {
                    warn!(
                        player = scraped.player_name,
                        error = %err,
                        "ingest item failed; continuing batch"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn ensure_archetype_cached(
        &self,
        cache: &mut PassCache,
        name: &str,
        format: Format,
    ) -> Result<i64> {
        if let Some(id) = cache.archetype_ids.get(&(format, name.to_string())) {
            return Ok(*id);
        }
        let archetype = ensure_archetype(self.store, name, format)
            .await
            .with_context(|| format!("ensuring archetype {name:?}"))?;
        cache
            .archetype_ids
            .insert((format, name.to_string()), archetype.id);
        Ok(archetype.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use spicerack_classify::{ManualRuleSet, StaticSignatureStore};
    use spicerack_core::{Archetype, DeckRecord};
    use spicerack_storage::{MemoryStore, StorageError, StoredEvent};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    #[test]
    fn literal_normalization_cases() {
        let cases = [
            ("Modern League 2026-01-22", Format::Modern, "Modern League"),
            (
                "Standard Challenge 32 2026-01-22 (1)",
                Format::Standard,
                "Standard Challenge 32",
            ),
            (
                "Pioneer Preliminary 12345 2026-01-21",
                Format::Pioneer,
                "Pioneer Preliminary 12345",
            ),
            ("MTGO League", Format::Modern, "Modern League"),
        ];
        for (raw, format, expected) in cases {
            assert_eq!(canonical_event_name(raw, format), expected, "case {raw:?}");
        }
    }

    #[test]
    fn event_keys_match_across_sources() {
        let a = EventKey::from_raw("Modern League 2026-01-22", Format::Modern);
        let b = EventKey::from_raw("MTGO League", Format::Modern);
        assert!(a.matches(&b));
        assert_eq!(a.bucket, EventBucket::League);
    }

    #[test]
    fn buckets_isolate_event_types() {
        let league = EventKey::from_raw("Modern League", Format::Modern);
        let challenge = EventKey::from_raw("Modern Challenge", Format::Modern);
        assert!(!league.matches(&challenge));
    }

    #[test]
    fn event_numbers_must_match_exactly() {
        let c32 = EventKey::from_raw("Standard Challenge 32", Format::Standard);
        let c64 = EventKey::from_raw("Standard Challenge 64", Format::Standard);
        let c32_again = EventKey::from_raw("MTGO Standard Challenge 32 (1)", Format::Standard);
        let unnumbered = EventKey::from_raw("Standard Challenge", Format::Standard);
        assert!(!c32.matches(&c64));
        assert!(c32.matches(&c32_again));
        assert!(!c32.matches(&unnumbered));
        assert!(unnumbered.matches(&unnumbered.clone()));
    }

    #[test]
    fn showcase_is_stripped_for_comparison() {
        let plain = EventKey::from_raw("Modern Challenge", Format::Modern);
        let showcase = EventKey::from_raw("Modern Showcase Challenge", Format::Modern);
        assert!(plain.matches(&showcase));
    }

    fn classifier() -> ArchetypeClassifier {
        ArchetypeClassifier::new(Arc::new(StaticSignatureStore::empty()), ManualRuleSet::empty())
    }

    fn scraped(player: &str, event: &str, day: u32, decklist: &str) -> ScrapedDeck {
        ScrapedDeck {
            player_name: player.to_string(),
            format: Format::Modern,
            event_name: event.to_string(),
            event_date: date(day),
            rank: 0,
            raw_decklist: decklist.to_string(),
            sideboard: None,
            source_url: "https://example.test/deck".into(),
            upstream_archetype_hint: Some("Burn".into()),
        }
    }

    #[tokio::test]
    async fn resolver_tolerates_one_day_of_drift() {
        let store = MemoryStore::new();
        let classifier = classifier();
        let pipeline = IngestPipeline::new(&store, &classifier);
        let mut cache = PassCache::new();

        let outcome = pipeline
            .admit(&mut cache, &scraped("a", "Modern League 2026-01-21", 21, "4 Lightning Bolt"))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Admitted { .. }));

        let resolver = EventIdentityResolver::new(&store);
        let mut fresh = PassCache::new();
        assert!(resolver.exists(&mut fresh, Format::Modern, date(22), "MTGO League").await);
        assert!(!resolver.exists(&mut fresh, Format::Modern, date(23), "MTGO League").await);
        assert!(!resolver.exists(&mut fresh, Format::Legacy, date(21), "MTGO League").await);
        assert!(
            !resolver
                .exists(&mut fresh, Format::Modern, date(21), "Modern Challenge")
                .await
        );
    }

    #[tokio::test]
    async fn one_event_admits_many_decks_but_only_once() {
        let store = MemoryStore::new();
        let classifier = classifier();
        let pipeline = IngestPipeline::new(&store, &classifier);

        // Two players from the same league scrape land together.
        let batch = vec![
            scraped("a", "Modern League 2026-01-22", 22, "4 Lightning Bolt"),
            scraped("b", "MTGO League", 22, "4 Goblin Guide"),
        ];
        let report = pipeline.admit_all(&batch).await;
        assert_eq!(report.admitted, 2);
        assert_eq!(report.skipped_duplicate_event, 0);

        // The same event re-delivered in a later pass is rejected wholesale.
        let report = pipeline.admit_all(&batch).await;
        assert_eq!(report.admitted, 0);
        assert_eq!(report.skipped_duplicate_event, 2);
    }

    #[tokio::test]
    async fn missing_decklist_is_skipped_not_fatal() {
        let store = MemoryStore::new();
        let classifier = classifier();
        let pipeline = IngestPipeline::new(&store, &classifier);

        let batch = vec![
            scraped("a", "Modern League", 22, ""),
            scraped("b", "Modern Challenge", 22, "not a card line"),
        ];
        let report = pipeline.admit_all(&batch).await;
        assert_eq!(report.admitted, 0);
        assert_eq!(report.skipped_missing_decklist, 2);
        assert!(store.snapshot_decks().await.is_empty());
    }

    #[tokio::test]
    async fn content_duplicate_prefers_specific_label() {
        let store = MemoryStore::new();
        let classifier = classifier();
        let pipeline = IngestPipeline::new(&store, &classifier);
        let mut cache = PassCache::new();

        // Same player, same list, one day apart: league label first.
        pipeline
            .admit(&mut cache, &scraped("a", "Modern League", 21, "4 Lightning Bolt"))
            .await
            .unwrap();
        let outcome = pipeline
            .admit(&mut cache, &scraped("a", "Modern Challenge 32", 22, "4 Lightning Bolt"))
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Admitted { .. }));

        let decks = store.snapshot_decks().await;
        assert_eq!(decks.len(), 1);
        assert_eq!(decks[0].event_name, "Modern Challenge 32");

        // Re-delivered under yet another generic label: the specific one stays.
        let outcome = pipeline
            .admit(&mut cache, &scraped("a", "MTGO League", 22, "4 Lightning Bolt"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::DuplicateContent));
        assert_eq!(store.snapshot_decks().await.len(), 1);
    }

    #[tokio::test]
    async fn admitted_decks_are_classified_and_digested() {
        let store = MemoryStore::new();
        let classifier = classifier();
        let pipeline = IngestPipeline::new(&store, &classifier);
        let mut cache = PassCache::new();

        let record = scraped("a", "Modern League 2026-01-22", 22, "4 Lightning Bolt");
        let outcome = pipeline.admit(&mut cache, &record).await.unwrap();
        let IngestOutcome::Admitted { deck_id, archetype, spice_count, .. } = outcome else {
            panic!("expected admission");
        };
        assert_eq!(archetype, "Burn");
        assert_eq!(spice_count, 0); // no peers yet: below the floor
        let deck = store.find_deck(deck_id).await.unwrap().unwrap();
        assert_eq!(deck.event_name, "Modern League");
        assert_eq!(deck.event_name_raw, "Modern League 2026-01-22");
        assert_eq!(
            deck.decklist_digest,
            decklist_digest("4 Lightning Bolt", None)
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl DeckStore for BrokenStore {
        async fn find_archetype(&self, _: &str, _: Format) -> Result<Option<Archetype>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn insert_archetype(&self, _: &str, _: Format) -> Result<i64, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn find_all_archetypes(&self, _: Option<Format>) -> Result<Vec<Archetype>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn count_decks_by_archetype(&self, _: i64) -> Result<u64, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn delete_archetype(&self, _: i64) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn insert_deck(&self, _: NewDeck) -> Result<i64, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn find_deck(&self, _: i64) -> Result<Option<DeckRecord>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn delete_deck(&self, _: i64) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn find_decks_by_archetype(
            &self,
            _: i64,
            _: Option<DateWindow>,
        ) -> Result<Vec<DeckRecord>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn update_deck_classification(
            &self,
            _: i64,
            _: i64,
            _: u32,
            _: Vec<String>,
        ) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn reassign_decks(&self, _: i64, _: i64) -> Result<u64, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn find_event_names(
            &self,
            _: Format,
            _: DateWindow,
        ) -> Result<Vec<StoredEvent>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn find_decks_by_player(
            &self,
            _: &str,
            _: Format,
            _: DateWindow,
        ) -> Result<Vec<DeckRecord>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn list_decks_page(&self, _: usize, _: usize) -> Result<Vec<DeckRecord>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn storage_errors_answer_not_found() {
        // Fail-safe: a storage outage must not cause events to be dropped as
        // presumed duplicates.
        let store = BrokenStore;
        let resolver = EventIdentityResolver::new(&store);
        let mut cache = PassCache::new();
        assert!(
            !resolver
                .exists(&mut cache, Format::Modern, date(22), "Modern League")
                .await
        );
    }
}
