//! Archetype classification, spice scoring, and similarity reclassification.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use spicerack_core::{
    CardLine, ClassificationMethod, ClassificationResult, DeckRecord, Format, UNKNOWN_ARCHETYPE,
};
use spicerack_storage::{DateWindow, DeckStore, StorageError};

pub const CRATE_NAME: &str = "spicerack-classify";

/// Tier 2 signature-match floor. Strong internal evidence clears this bar and
/// beats the curated rules.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.75;

/// Tier 4 last-resort signature floor, tried only after the rules fail.
pub const AGGRESSIVE_THRESHOLD: f64 = 0.50;

/// Peer populations smaller than this produce no spice at all.
pub const SPICE_MIN_POPULATION: usize = 5;

/// A card is spicy when at most floor(this × population) peers play it.
pub const SPICE_FREQUENCY_RATIO: f64 = 0.15;

/// Trailing window, in days, defining a deck's peer population.
pub const PEER_WINDOW_DAYS: u64 = 60;

/// Fingerprints are rebuilt only for archetypes with at least this many decks.
pub const FINGERPRINT_MIN_DECKS: usize = 5;

/// At most this many decks are sampled per archetype when rebuilding.
pub const FINGERPRINT_SAMPLE: usize = 50;

/// Fingerprint size: the top-N most frequent non-land names.
pub const FINGERPRINT_SIZE: usize = 15;

/// Minimum fingerprint overlap for an "Unknown" deck to be reassigned.
pub const SIMILARITY_THRESHOLD: f64 = 0.60;

// ---------------------------------------------------------------------------
// Land detection

/// Names treated as lands when counting spice and building fingerprints.
const STATIC_LANDS: &[&str] = &[
    "Plains",
    "Island",
    "Swamp",
    "Mountain",
    "Forest",
    "Wastes",
    "Snow-Covered Plains",
    "Snow-Covered Island",
    "Snow-Covered Swamp",
    "Snow-Covered Mountain",
    "Snow-Covered Forest",
    "Flooded Strand",
    "Polluted Delta",
    "Bloodstained Mire",
    "Wooded Foothills",
    "Windswept Heath",
    "Scalding Tarn",
    "Misty Rainforest",
    "Verdant Catacombs",
    "Arid Mesa",
    "Marsh Flats",
    "Steam Vents",
    "Sacred Foundry",
    "Blood Crypt",
    "Overgrown Tomb",
    "Hallowed Fountain",
    "Watery Grave",
    "Stomping Ground",
    "Temple Garden",
    "Godless Shrine",
    "Breeding Pool",
    "Urza's Tower",
    "Urza's Mine",
    "Urza's Power Plant",
    "Mutavault",
    "Urborg, Tomb of Yawgmoth",
    "Boseiju, Who Endures",
    "Otawara, Soaring City",
];

/// Static list plus a substring heuristic ("Verge"/"Land") for land cycles
/// the list does not know about.
pub fn is_land_name(name: &str) -> bool {
    STATIC_LANDS.iter().any(|l| l.eq_ignore_ascii_case(name))
        || name.contains("Verge")
        || name.contains("Land")
}

// ---------------------------------------------------------------------------
// Signatures

/// Card-frequency fingerprint for one archetype in one format: 15-60 names
/// considered defining. Derived data, never a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Signature {
    pub archetype: String,
    pub cards: Vec<String>,
}

/// Source of per-format signatures for the classifier tiers.
pub trait SignatureProvider: Send + Sync {
    fn signatures_for(&self, format: Format) -> Vec<Signature>;
}

#[derive(Debug, Clone, Deserialize)]
struct SignatureFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    signatures: Vec<SignatureEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct SignatureEntry {
    format: String,
    archetype: String,
    cards: Vec<String>,
}

/// Signatures loaded once from a versioned YAML file.
#[derive(Debug, Default)]
pub struct StaticSignatureStore {
    by_format: HashMap<Format, Vec<Signature>>,
}

impl StaticSignatureStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, format: Format, signature: Signature) {
        self.by_format.entry(format).or_default().push(signature);
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: SignatureFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut store = Self::empty();
        for entry in file.signatures {
            let format: Format = entry
                .format
                .parse()
                .with_context(|| format!("signature for {:?} in {}", entry.archetype, path.display()))?;
            store.insert(
                format,
                Signature {
                    archetype: entry.archetype,
                    cards: entry.cards,
                },
            );
        }
        Ok(store)
    }
}

impl SignatureProvider for StaticSignatureStore {
    fn signatures_for(&self, format: Format) -> Vec<Signature> {
        self.by_format.get(&format).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Manual rules

/// One curated rule: the archetype applies when every required card is
/// present. Several rules may target the same archetype for different builds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManualRule {
    pub archetype: String,
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleEntry {
    format: String,
    archetype: String,
    requires: Vec<String>,
}

/// Ordered per-format rule lists; evaluation order is file order and the
/// first firing rule wins.
#[derive(Debug, Default)]
pub struct ManualRuleSet {
    by_format: HashMap<Format, Vec<ManualRule>>,
}

impl ManualRuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, format: Format, rule: ManualRule) {
        self.by_format.entry(format).or_default().push(rule);
    }

    pub fn rules_for(&self, format: Format) -> &[ManualRule] {
        self.by_format.get(&format).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: RuleFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut set = Self::empty();
        for entry in file.rules {
            let format: Format = entry
                .format
                .parse()
                .with_context(|| format!("rule for {:?} in {}", entry.archetype, path.display()))?;
            set.push(
                format,
                ManualRule {
                    archetype: entry.archetype,
                    requires: entry.requires,
                },
            );
        }
        Ok(set)
    }
}

// ---------------------------------------------------------------------------
// Optional AI fallback strategy

#[derive(Debug, Error)]
pub enum AiStrategyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unparsable response: {0}")]
    Unparsable(String),
}

/// Capability boundary for the optional generative classifier. Never a hard
/// dependency: any failure degrades to the heuristic tiers.
#[async_trait]
pub trait AiStrategy: Send + Sync {
    async fn classify(
        &self,
        decklist_text: &str,
        format: Format,
    ) -> Result<Option<String>, AiStrategyError>;
}

/// Strategy that never answers. The default, and the test substitute.
#[derive(Debug, Default)]
pub struct NoopAiStrategy;

#[async_trait]
impl AiStrategy for NoopAiStrategy {
    async fn classify(
        &self,
        _decklist_text: &str,
        _format: Format,
    ) -> Result<Option<String>, AiStrategyError> {
        Ok(None)
    }
}

/// HTTP-backed strategy. Sleeps a fixed delay before every call to respect
/// the service's rate limit.
pub struct HttpAiStrategy {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    call_delay: Duration,
}

impl HttpAiStrategy {
    pub fn new(endpoint: String, api_key: String, call_delay: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building AI strategy client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            call_delay,
        })
    }

    /// Build from `SPICERACK_AI_URL` / `SPICERACK_AI_KEY` /
    /// `SPICERACK_AI_DELAY_MS`. Returns None when credentials are absent, in
    /// which case callers fall back to [`NoopAiStrategy`].
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("SPICERACK_AI_URL").ok()?;
        let api_key = std::env::var("SPICERACK_AI_KEY").ok()?;
        let delay_ms = std::env::var("SPICERACK_AI_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000);
        match Self::new(endpoint, api_key, Duration::from_millis(delay_ms)) {
            Ok(strategy) => Some(strategy),
            Err(err) => {
                warn!(error = %err, "AI strategy unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl AiStrategy for HttpAiStrategy {
    async fn classify(
        &self,
        decklist_text: &str,
        format: Format,
    ) -> Result<Option<String>, AiStrategyError> {
        tokio::time::sleep(self.call_delay).await;
        let body = serde_json::json!({
            "format": format.as_str(),
            "decklist": decklist_text,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let value: serde_json::Value = response.json().await?;
        match value.get("archetype") {
            Some(serde_json::Value::String(label)) if !label.trim().is_empty() => {
                Ok(Some(label.trim().to_string()))
            }
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(other) => Err(AiStrategyError::Unparsable(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier

const GUILD_NAMES: &[&str] = &[
    "Azorius", "Dimir", "Rakdos", "Gruul", "Selesnya", "Orzhov", "Izzet", "Golgari", "Boros",
    "Simic",
];

fn is_bare_color_combo(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| matches!(c.to_ascii_uppercase(), 'W' | 'U' | 'B' | 'R' | 'G'))
}

/// An upstream hint too vague to trust verbatim: empty, the Unknown sentinel,
/// a bare color-letter combination ("UB", "WUBRG"), or a bare guild name.
pub fn is_generic_hint(hint: &str) -> bool {
    let trimmed = hint.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case(UNKNOWN_ARCHETYPE)
        || is_bare_color_combo(trimmed)
        || GUILD_NAMES.iter().any(|g| g.eq_ignore_ascii_case(trimmed))
}

/// Tiered archetype classifier. Tier order is load-bearing: trusted external
/// labels, then strong signature evidence, then curated rules, then the
/// aggressive signature pass, then the optional AI strategy, then the default.
pub struct ArchetypeClassifier {
    signatures: Arc<dyn SignatureProvider>,
    rules: ManualRuleSet,
    ai: Arc<dyn AiStrategy>,
}

impl ArchetypeClassifier {
    pub fn new(signatures: Arc<dyn SignatureProvider>, rules: ManualRuleSet) -> Self {
        Self {
            signatures,
            rules,
            ai: Arc::new(NoopAiStrategy),
        }
    }

    pub fn with_ai_strategy(mut self, ai: Arc<dyn AiStrategy>) -> Self {
        self.ai = ai;
        self
    }

    fn best_signature_match(&self, haystack: &str, format: Format) -> Option<(String, f64)> {
        let mut best: Option<(String, f64)> = None;
        for signature in self.signatures.signatures_for(format) {
            if signature.cards.is_empty() {
                continue;
            }
            let present = signature
                .cards
                .iter()
                .filter(|card| haystack.contains(&card.to_lowercase()))
                .count();
            let ratio = present as f64 / signature.cards.len() as f64;
            let beats = best.as_ref().map(|(_, b)| ratio > *b).unwrap_or(true);
            if beats {
                best = Some((signature.archetype, ratio));
            }
        }
        best
    }

    /// Classify one decklist. `decklist_text` is the full main+sideboard text;
    /// card presence is substring containment over it, deliberately permissive.
    pub async fn classify(
        &self,
        decklist_text: &str,
        format: Format,
        upstream_hint: Option<&str>,
    ) -> ClassificationResult {
        // Tier 1: trusted external label, unverified.
        if let Some(hint) = upstream_hint {
            if !is_generic_hint(hint) {
                return ClassificationResult {
                    archetype: hint.trim().to_string(),
                    confidence: 0.0,
                    method: ClassificationMethod::ExternalHint,
                };
            }
        }

        let haystack = decklist_text.to_lowercase();
        let best = self.best_signature_match(&haystack, format);

        // Tier 2: signature evidence above the high bar beats curated rules.
        if let Some((archetype, ratio)) = &best {
            if *ratio >= HIGH_CONFIDENCE_THRESHOLD {
                return ClassificationResult {
                    archetype: archetype.clone(),
                    confidence: *ratio,
                    method: ClassificationMethod::HighConfidence,
                };
            }
        }

        // Tier 3: ordered curated rules, first firing rule wins.
        for rule in self.rules.rules_for(format) {
            let fires = rule
                .requires
                .iter()
                .all(|card| haystack.contains(&card.to_lowercase()));
            if fires {
                return ClassificationResult {
                    archetype: rule.archetype.clone(),
                    confidence: 1.0,
                    method: ClassificationMethod::ManualRule,
                };
            }
        }

        // Tier 4: aggressive signature pass.
        if let Some((archetype, ratio)) = &best {
            if *ratio >= AGGRESSIVE_THRESHOLD {
                return ClassificationResult {
                    archetype: archetype.clone(),
                    confidence: *ratio,
                    method: ClassificationMethod::Aggressive,
                };
            }
        }

        // Tier 5: optional AI strategy; unavailability degrades silently.
        match self.ai.classify(decklist_text, format).await {
            Ok(Some(label)) if !is_generic_hint(&label) => {
                return ClassificationResult {
                    archetype: label,
                    confidence: 0.0,
                    method: ClassificationMethod::AiFallback,
                };
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, %format, "AI strategy failed; using heuristic result");
            }
        }

        // Tier 6: the hint as given (even generic), else Unknown.
        match upstream_hint.map(str::trim).filter(|h| !h.is_empty()) {
            Some(hint) => ClassificationResult {
                archetype: hint.to_string(),
                confidence: 0.0,
                method: ClassificationMethod::Default,
            },
            None => ClassificationResult::unknown(),
        }
    }
}

// ---------------------------------------------------------------------------
// Spice scoring

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpiceScore {
    pub count: u32,
    pub cards: Vec<String>,
}

/// One card of a deck annotated for the read side.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AnnotatedCard {
    pub count: u32,
    pub name: String,
    pub is_spice: bool,
    pub frequency: u32,
}

/// Presence frequency per card name across the peer population: one increment
/// per peer deck that plays the card at all, copies ignored, lands excluded.
pub fn peer_frequencies(peers: &[DeckRecord]) -> HashMap<String, u32> {
    let mut frequencies: HashMap<String, u32> = HashMap::new();
    for peer in peers {
        let mut seen: HashSet<&str> = HashSet::new();
        for name in peer.card_names() {
            if is_land_name(name) || !seen.insert(name) {
                continue;
            }
            *frequencies.entry(name.to_string()).or_default() += 1;
        }
    }
    frequencies
}

fn spice_threshold(population: usize) -> u32 {
    ((population as f64 * SPICE_FREQUENCY_RATIO).floor() as u32).max(1)
}

/// Score one deck's novelty against its peer population (same archetype and
/// format, trailing window, subject excluded). Below the statistical floor
/// the score is empty by design.
pub fn score_spice(
    mainboard: &[CardLine],
    sideboard: &[CardLine],
    peers: &[DeckRecord],
) -> SpiceScore {
    if peers.len() < SPICE_MIN_POPULATION {
        return SpiceScore::default();
    }
    let frequencies = peer_frequencies(peers);
    let threshold = spice_threshold(peers.len());

    let mut cards = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for line in mainboard.iter().chain(sideboard.iter()) {
        let name = line.name.as_str();
        if is_land_name(name) || !seen.insert(name) {
            continue;
        }
        let frequency = frequencies.get(name).copied().unwrap_or(0);
        if frequency <= threshold {
            cards.push(name.to_string());
        }
    }
    SpiceScore {
        count: cards.len() as u32,
        cards,
    }
}

/// Re-derive the per-card annotation consumed by the read side.
pub fn annotate_deck(deck: &DeckRecord, peers: &[DeckRecord]) -> Vec<AnnotatedCard> {
    let frequencies = peer_frequencies(peers);
    let scored = peers.len() >= SPICE_MIN_POPULATION;
    let threshold = spice_threshold(peers.len());
    deck.mainboard
        .iter()
        .chain(deck.sideboard.iter())
        .map(|line| {
            let land = is_land_name(&line.name);
            let frequency = frequencies.get(&line.name).copied().unwrap_or(0);
            AnnotatedCard {
                count: line.count,
                name: line.name.clone(),
                is_spice: scored && !land && frequency <= threshold,
                frequency,
            }
        })
        .collect()
}

/// The peer population for spice: same archetype, trailing window ending at
/// the subject deck's event date, subject itself excluded.
pub async fn peer_population(
    store: &dyn DeckStore,
    archetype_id: i64,
    event_date: NaiveDate,
    exclude_deck: Option<i64>,
) -> Result<Vec<DeckRecord>, StorageError> {
    let window = DateWindow::trailing(event_date, PEER_WINDOW_DAYS);
    let mut peers = store.find_decks_by_archetype(archetype_id, Some(window)).await?;
    if let Some(id) = exclude_deck {
        peers.retain(|d| d.id != id);
    }
    Ok(peers)
}

// ---------------------------------------------------------------------------
// Similarity reclassification

/// A rebuilt archetype fingerprint: the top non-land names of its recent decks.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub archetype_id: i64,
    pub archetype: String,
    pub cards: BTreeSet<String>,
}

impl Fingerprint {
    /// How much of this fingerprint the deck reproduces. Scaled by fingerprint
    /// size, not union size: the question is signature coverage, not general
    /// similarity.
    pub fn overlap(&self, deck_cards: &HashSet<&str>) -> f64 {
        if self.cards.is_empty() {
            return 0.0;
        }
        let shared = self
            .cards
            .iter()
            .filter(|card| deck_cards.contains(card.as_str()))
            .count();
        shared as f64 / self.cards.len() as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SimilaritySweepStats {
    pub fingerprints: usize,
    pub examined: usize,
    pub reassigned: usize,
}

/// Batch nearest-neighbor mop-up for decks the classifier tiers left
/// "Unknown". Fingerprints improve as classified decks accumulate, so decks
/// left behind are retried on every pass.
pub struct SimilarityReclassifier<'a> {
    store: &'a dyn DeckStore,
}

impl<'a> SimilarityReclassifier<'a> {
    pub fn new(store: &'a dyn DeckStore) -> Self {
        Self { store }
    }

    /// Rebuild fingerprints for every sufficiently-populated archetype in the
    /// format, from the most recent [`FINGERPRINT_SAMPLE`] decks each.
    pub async fn build_fingerprints(
        &self,
        format: Format,
    ) -> Result<Vec<Fingerprint>, StorageError> {
        let mut fingerprints = Vec::new();
        for archetype in self.store.find_all_archetypes(Some(format)).await? {
            if archetype.is_unknown() {
                continue;
            }
            if (self.store.count_decks_by_archetype(archetype.id).await? as usize)
                < FINGERPRINT_MIN_DECKS
            {
                continue;
            }
            let mut decks = self.store.find_decks_by_archetype(archetype.id, None).await?;
            decks.sort_by(|a, b| b.event_date.cmp(&a.event_date));
            decks.truncate(FINGERPRINT_SAMPLE);

            let frequencies = peer_frequencies(&decks);
            let mut ranked: Vec<(String, u32)> = frequencies.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            ranked.truncate(FINGERPRINT_SIZE);

            fingerprints.push(Fingerprint {
                archetype_id: archetype.id,
                archetype: archetype.name,
                cards: ranked.into_iter().map(|(name, _)| name).collect(),
            });
        }
        Ok(fingerprints)
    }

    /// Reassign every "Unknown" deck whose best fingerprint overlap clears
    /// [`SIMILARITY_THRESHOLD`], recomputing spice against the new peers.
    pub async fn run(&self, format: Format) -> Result<SimilaritySweepStats, StorageError> {
        let mut stats = SimilaritySweepStats::default();
        let Some(unknown) = self.store.find_archetype(UNKNOWN_ARCHETYPE, format).await? else {
            return Ok(stats);
        };
        let fingerprints = self.build_fingerprints(format).await?;
        stats.fingerprints = fingerprints.len();
        if fingerprints.is_empty() {
            return Ok(stats);
        }

        for deck in self.store.find_decks_by_archetype(unknown.id, None).await? {
            stats.examined += 1;
            let deck_cards: HashSet<&str> = deck.card_names().collect();
            let best = fingerprints
                .iter()
                .map(|fp| (fp, fp.overlap(&deck_cards)))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let Some((fingerprint, overlap)) = best else {
                continue;
            };
            if overlap < SIMILARITY_THRESHOLD {
                continue;
            }

            let peers = peer_population(
                self.store,
                fingerprint.archetype_id,
                deck.event_date,
                Some(deck.id),
            )
            .await?;
            let spice = score_spice(&deck.mainboard, &deck.sideboard, &peers);
            self.store
                .update_deck_classification(
                    deck.id,
                    fingerprint.archetype_id,
                    spice.count,
                    spice.cards,
                )
                .await?;
            debug!(
                deck_id = deck.id,
                archetype = %fingerprint.archetype,
                overlap,
                "similarity sweep reassigned deck"
            );
            stats.reassigned += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use spicerack_core::{parse_card_lines, NewDeck, RANK_UNTIERED};
    use spicerack_storage::{ensure_archetype, MemoryStore};
    use std::io::Write;

    fn sig(archetype: &str, cards: &[&str]) -> Signature {
        Signature {
            archetype: archetype.to_string(),
            cards: cards.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn classifier_with(signatures: Vec<Signature>, rules: Vec<ManualRule>) -> ArchetypeClassifier {
        let mut store = StaticSignatureStore::empty();
        for signature in signatures {
            store.insert(Format::Modern, signature);
        }
        let mut rule_set = ManualRuleSet::empty();
        for rule in rules {
            rule_set.push(Format::Modern, rule);
        }
        ArchetypeClassifier::new(Arc::new(store), rule_set)
    }

    #[tokio::test]
    async fn external_hint_wins_when_specific() {
        let classifier = classifier_with(vec![], vec![]);
        let result = classifier
            .classify("4 Lightning Bolt", Format::Modern, Some("Mono-Red Aggro"))
            .await;
        assert_eq!(result.archetype, "Mono-Red Aggro");
        assert_eq!(result.method, ClassificationMethod::ExternalHint);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn generic_hints_fall_through_to_default() {
        let classifier = classifier_with(vec![], vec![]);
        for hint in ["", "Unknown", "UB", "wubrg", "Izzet"] {
            let result = classifier
                .classify("4 Lightning Bolt", Format::Modern, Some(hint))
                .await;
            assert_eq!(result.method, ClassificationMethod::Default, "hint {hint:?}");
        }
        // The generic hint is still returned verbatim by the default tier.
        let result = classifier
            .classify("4 Lightning Bolt", Format::Modern, Some("UB"))
            .await;
        assert_eq!(result.archetype, "UB");
        let result = classifier.classify("4 Lightning Bolt", Format::Modern, None).await;
        assert_eq!(result.archetype, UNKNOWN_ARCHETYPE);
    }

    #[tokio::test]
    async fn high_confidence_signature_beats_manual_rule() {
        let classifier = classifier_with(
            vec![sig(
                "Burn",
                &["Lightning Bolt", "Monastery Swiftspear", "Lava Spike", "Rift Bolt"],
            )],
            vec![ManualRule {
                archetype: "Prowess".into(),
                requires: vec!["Monastery Swiftspear".into()],
            }],
        );
        let text = "4 Lightning Bolt\n4 Monastery Swiftspear\n4 Lava Spike\n4 Rift Bolt";
        let result = classifier.classify(text, Format::Modern, None).await;
        assert_eq!(result.archetype, "Burn");
        assert_eq!(result.method, ClassificationMethod::HighConfidence);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn manual_rule_beats_aggressive_signature() {
        // 2/4 signature cards = 0.50: clears the aggressive floor only, so the
        // rule fires first.
        let classifier = classifier_with(
            vec![sig(
                "Burn",
                &["Lightning Bolt", "Monastery Swiftspear", "Lava Spike", "Rift Bolt"],
            )],
            vec![ManualRule {
                archetype: "Prowess".into(),
                requires: vec!["Monastery Swiftspear".into(), "Lightning Bolt".into()],
            }],
        );
        let text = "4 Lightning Bolt\n4 Monastery Swiftspear\n4 Sleight of Hand";
        let result = classifier.classify(text, Format::Modern, None).await;
        assert_eq!(result.archetype, "Prowess");
        assert_eq!(result.method, ClassificationMethod::ManualRule);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn aggressive_tier_fires_after_rules_fail() {
        let classifier = classifier_with(
            vec![sig(
                "Burn",
                &["Lightning Bolt", "Monastery Swiftspear", "Lava Spike", "Rift Bolt"],
            )],
            vec![],
        );
        let text = "4 Lightning Bolt\n4 Monastery Swiftspear\n4 Sleight of Hand";
        let result = classifier.classify(text, Format::Modern, None).await;
        assert_eq!(result.archetype, "Burn");
        assert_eq!(result.method, ClassificationMethod::Aggressive);
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn first_firing_rule_wins_in_order() {
        let classifier = classifier_with(
            vec![],
            vec![
                ManualRule {
                    archetype: "Hammer Time".into(),
                    requires: vec!["Colossus Hammer".into(), "Sigarda's Aid".into()],
                },
                ManualRule {
                    archetype: "Affinity".into(),
                    requires: vec!["Colossus Hammer".into()],
                },
            ],
        );
        let text = "4 Colossus Hammer\n4 Sigarda's Aid";
        let result = classifier.classify(text, Format::Modern, None).await;
        assert_eq!(result.archetype, "Hammer Time");
    }

    struct FixedAiStrategy(&'static str);

    #[async_trait]
    impl AiStrategy for FixedAiStrategy {
        async fn classify(
            &self,
            _decklist_text: &str,
            _format: Format,
        ) -> Result<Option<String>, AiStrategyError> {
            Ok(Some(self.0.to_string()))
        }
    }

    struct FailingAiStrategy;

    #[async_trait]
    impl AiStrategy for FailingAiStrategy {
        async fn classify(
            &self,
            _decklist_text: &str,
            _format: Format,
        ) -> Result<Option<String>, AiStrategyError> {
            Err(AiStrategyError::Unparsable("not json".into()))
        }
    }

    #[tokio::test]
    async fn ai_fallback_fires_only_after_heuristics() {
        let classifier = classifier_with(vec![], vec![])
            .with_ai_strategy(Arc::new(FixedAiStrategy("Lantern Control")));
        let result = classifier
            .classify("4 Ensnaring Bridge", Format::Modern, None)
            .await;
        assert_eq!(result.archetype, "Lantern Control");
        assert_eq!(result.method, ClassificationMethod::AiFallback);
    }

    #[tokio::test]
    async fn ai_failure_degrades_to_default() {
        let classifier =
            classifier_with(vec![], vec![]).with_ai_strategy(Arc::new(FailingAiStrategy));
        let result = classifier
            .classify("4 Ensnaring Bridge", Format::Modern, Some("UB"))
            .await;
        assert_eq!(result.archetype, "UB");
        assert_eq!(result.method, ClassificationMethod::Default);
    }

    #[test]
    fn rules_load_from_versioned_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "version: 1\nrules:\n  - format: Modern\n    archetype: Burn\n    requires:\n      - Lava Spike\n      - Rift Bolt\n"
        )
        .unwrap();
        let rules = ManualRuleSet::from_yaml_file(file.path()).unwrap();
        assert_eq!(rules.rules_for(Format::Modern).len(), 1);
        assert_eq!(rules.rules_for(Format::Modern)[0].archetype, "Burn");
        assert!(rules.rules_for(Format::Legacy).is_empty());
    }

    // -- spice --

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn peer(id: i64, cards: &str) -> DeckRecord {
        DeckRecord {
            id,
            player_name: format!("peer{id}"),
            format: Format::Modern,
            event_name_raw: "Modern League".into(),
            event_name: "Modern League".into(),
            event_date: date(1),
            rank: RANK_UNTIERED,
            archetype_id: 1,
            mainboard: parse_card_lines(cards).unwrap(),
            sideboard: vec![],
            source_url: String::new(),
            spice_count: 0,
            spice_cards: vec![],
            decklist_digest: String::new(),
        }
    }

    #[test]
    fn spice_floor_below_five_peers() {
        let peers: Vec<DeckRecord> = (1..=4).map(|i| peer(i, "4 Lightning Bolt")).collect();
        let main = parse_card_lines("4 Weird Inclusion").unwrap();
        assert_eq!(score_spice(&main, &[], &peers), SpiceScore::default());
    }

    #[test]
    fn spice_threshold_arithmetic_at_twenty_peers() {
        // threshold = floor(20 * 0.15) = 3: played-by-3 is spicy, played-by-4 is not.
        let mut peers = Vec::new();
        for i in 1..=20i64 {
            let mut cards = String::from("4 Lightning Bolt");
            if i <= 3 {
                cards.push_str("\n1 Three Copies");
            }
            if i <= 4 {
                cards.push_str("\n1 Four Copies");
            }
            peers.push(peer(i, &cards));
        }
        let main = parse_card_lines("1 Three Copies\n1 Four Copies\n4 Lightning Bolt").unwrap();
        let score = score_spice(&main, &[], &peers);
        assert_eq!(score.cards, vec!["Three Copies".to_string()]);
        assert_eq!(score.count, 1);
    }

    #[test]
    fn lands_never_count_as_spice() {
        let peers: Vec<DeckRecord> = (1..=20).map(|i| peer(i, "4 Lightning Bolt")).collect();
        let main =
            parse_card_lines("4 Mountain\n1 Urza's Tower\n1 Thornspire Verge\n1 Land Tax")
                .unwrap();
        let score = score_spice(&main, &[], &peers);
        assert_eq!(score, SpiceScore::default());
    }

    #[test]
    fn spice_cards_keep_encounter_order_and_dedup() {
        let peers: Vec<DeckRecord> = (1..=10).map(|i| peer(i, "4 Lightning Bolt")).collect();
        let main = parse_card_lines("2 Zada, Hedron Grinder\n4 Lightning Bolt").unwrap();
        let side = parse_card_lines("1 Zada, Hedron Grinder\n1 Pyrite Spellbomb").unwrap();
        let score = score_spice(&main, &side, &peers);
        assert_eq!(
            score.cards,
            vec!["Zada, Hedron Grinder".to_string(), "Pyrite Spellbomb".to_string()]
        );
        assert_eq!(score.count, 2);
    }

    #[test]
    fn annotation_reports_frequency_for_every_card() {
        let peers: Vec<DeckRecord> = (1..=5).map(|i| peer(i, "4 Lightning Bolt")).collect();
        let deck = peer(99, "4 Lightning Bolt\n1 Pyrite Spellbomb\n4 Mountain");
        let annotated = annotate_deck(&deck, &peers);
        assert_eq!(annotated.len(), 3);
        assert_eq!(annotated[0].frequency, 5);
        assert!(!annotated[0].is_spice);
        assert_eq!(annotated[1].frequency, 0);
        assert!(annotated[1].is_spice);
        assert!(!annotated[2].is_spice); // land
    }

    // -- similarity --

    #[test]
    fn overlap_threshold_is_nine_of_fifteen() {
        let cards: BTreeSet<String> = (1..=15).map(|i| format!("Card {i:02}")).collect();
        let fingerprint = Fingerprint {
            archetype_id: 1,
            archetype: "Burn".into(),
            cards,
        };
        let nine: Vec<String> = (1..=9).map(|i| format!("Card {i:02}")).collect();
        let nine_set: HashSet<&str> = nine.iter().map(String::as_str).collect();
        assert!(fingerprint.overlap(&nine_set) >= SIMILARITY_THRESHOLD);

        let eight: Vec<String> = (1..=8).map(|i| format!("Card {i:02}")).collect();
        let eight_set: HashSet<&str> = eight.iter().map(String::as_str).collect();
        assert!(fingerprint.overlap(&eight_set) < SIMILARITY_THRESHOLD);
    }

    async fn seed_archetype_decks(
        store: &MemoryStore,
        name: &str,
        count: i64,
        cards: &str,
    ) -> i64 {
        let archetype = ensure_archetype(store, name, Format::Modern).await.unwrap();
        for i in 0..count {
            store
                .insert_deck(NewDeck {
                    player_name: format!("{name}-{i}"),
                    format: Format::Modern,
                    event_name_raw: "Modern League".into(),
                    event_name: "Modern League".into(),
                    event_date: date(1),
                    rank: RANK_UNTIERED,
                    archetype_id: archetype.id,
                    mainboard: parse_card_lines(cards).unwrap(),
                    sideboard: vec![],
                    source_url: String::new(),
                    spice_count: 0,
                    spice_cards: vec![],
                    decklist_digest: format!("{name}-{i}"),
                })
                .await
                .unwrap();
        }
        archetype.id
    }

    #[tokio::test]
    async fn sweep_reassigns_unknown_decks_above_threshold() {
        let store = MemoryStore::new();
        let burn_cards = "4 Lightning Bolt\n4 Lava Spike\n4 Rift Bolt\n4 Monastery Swiftspear\n4 Goblin Guide\n4 Eidolon of the Great Revel\n4 Boros Charm\n4 Skewer the Critics\n4 Light Up the Stage\n2 Searing Blaze";
        let burn_id = seed_archetype_decks(&store, "Burn", 6, burn_cards).await;
        let unknown_id = seed_archetype_decks(&store, UNKNOWN_ARCHETYPE, 1, burn_cards).await;
        // A second unknown deck that shares nothing stays put.
        let control = ensure_archetype(&store, UNKNOWN_ARCHETYPE, Format::Modern)
            .await
            .unwrap();
        store
            .insert_deck(NewDeck {
                player_name: "driftwood".into(),
                format: Format::Modern,
                event_name_raw: "Modern League".into(),
                event_name: "Modern League".into(),
                event_date: date(1),
                rank: RANK_UNTIERED,
                archetype_id: control.id,
                mainboard: parse_card_lines("4 Counterspell\n4 Brainstorm").unwrap(),
                sideboard: vec![],
                source_url: String::new(),
                spice_count: 0,
                spice_cards: vec![],
                decklist_digest: "driftwood".into(),
            })
            .await
            .unwrap();

        let sweep = SimilarityReclassifier::new(&store);
        let stats = sweep.run(Format::Modern).await.unwrap();
        assert_eq!(stats.fingerprints, 1);
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.reassigned, 1);
        assert_eq!(store.count_decks_by_archetype(burn_id).await.unwrap(), 7);
        assert_eq!(store.count_decks_by_archetype(unknown_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fingerprints_skip_thin_archetypes_and_lands() {
        let store = MemoryStore::new();
        seed_archetype_decks(&store, "Burn", 4, "4 Lightning Bolt").await;
        let sweep = SimilarityReclassifier::new(&store);
        assert!(sweep.build_fingerprints(Format::Modern).await.unwrap().is_empty());

        seed_archetype_decks(&store, "Tron", 5, "4 Karn Liberated\n4 Urza's Tower\n4 Mountain").await;
        let fingerprints = sweep.build_fingerprints(Format::Modern).await.unwrap();
        assert_eq!(fingerprints.len(), 1);
        assert_eq!(
            fingerprints[0].cards,
            BTreeSet::from(["Karn Liberated".to_string()])
        );
    }
}
