//! Periodic convergence pass: reclassify, similarity-sweep, alias merge,
//! orphan cleanup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use spicerack_classify::{
    peer_population, score_spice, ArchetypeClassifier, HttpAiStrategy, ManualRuleSet,
    NoopAiStrategy, SimilarityReclassifier, SimilaritySweepStats, StaticSignatureStore,
};
use spicerack_core::{Archetype, DeckRecord, Format};
use spicerack_storage::{ensure_archetype, DeckStore};

pub const CRATE_NAME: &str = "spicerack-normalize";

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    pub rules_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub page_size: usize,
    pub scheduler_enabled: bool,
    pub normalize_cron_1: String,
    pub normalize_cron_2: String,
}

impl NormalizeConfig {
    pub fn from_env() -> Self {
        Self {
            rules_dir: std::env::var("SPICERACK_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rules")),
            reports_dir: std::env::var("SPICERACK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            page_size: std::env::var("SPICERACK_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
            scheduler_enabled: std::env::var("SPICERACK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            normalize_cron_1: std::env::var("NORMALIZE_CRON_1")
                .unwrap_or_else(|_| "0 6 * * *".to_string()),
            normalize_cron_2: std::env::var("NORMALIZE_CRON_2")
                .unwrap_or_else(|_| "0 18 * * *".to_string()),
        }
    }
}

/// Build the tiered classifier from the versioned rules directory, attaching
/// the HTTP AI strategy only when its environment credentials are present.
pub fn classifier_from_rules(rules_dir: &Path) -> Result<ArchetypeClassifier> {
    let signatures = StaticSignatureStore::from_yaml_file(rules_dir.join("signatures.yaml"))?;
    let rules = ManualRuleSet::from_yaml_file(rules_dir.join("archetype_rules.yaml"))?;
    let classifier = ArchetypeClassifier::new(Arc::new(signatures), rules);
    Ok(match HttpAiStrategy::from_env() {
        Some(strategy) => classifier.with_ai_strategy(Arc::new(strategy)),
        None => classifier.with_ai_strategy(Arc::new(NoopAiStrategy)),
    })
}

// ---------------------------------------------------------------------------
// Alias table

#[derive(Debug, Clone, Deserialize)]
struct AliasFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasEntry {
    canonical: String,
    names: Vec<String>,
}

/// Curated archetype-name aliases, applied within a single format.
#[derive(Debug, Default)]
pub struct AliasTable {
    canonical_by_alias: HashMap<String, String>,
}

impl AliasTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[(&str, &[&str])]) -> Self {
        let mut table = Self::empty();
        for (canonical, names) in entries {
            for name in *names {
                table
                    .canonical_by_alias
                    .insert(name.to_lowercase(), canonical.to_string());
            }
        }
        table
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: AliasFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut table = Self::empty();
        for entry in file.aliases {
            for name in entry.names {
                table
                    .canonical_by_alias
                    .insert(name.to_lowercase(), entry.canonical.clone());
            }
        }
        Ok(table)
    }

    /// The canonical name this alias maps to, if it maps anywhere else.
    pub fn canonical_for(&self, name: &str) -> Option<&str> {
        self.canonical_by_alias
            .get(&name.to_lowercase())
            .map(String::as_str)
            .filter(|canonical| !canonical.eq_ignore_ascii_case(name))
    }
}

// ---------------------------------------------------------------------------
// Pass summary + reports

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub decks_examined: usize,
    pub decks_migrated: usize,
    pub similarity: SimilaritySweepStats,
    pub aliases_merged: usize,
    pub orphans_deleted: usize,
    pub failures: usize,
}

/// Write `pass_brief.md` and `pass_summary.json` under
/// `<reports_dir>/<run_id>/`. Returns the report directory.
pub async fn write_pass_report(reports_dir: &Path, summary: &PassSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let brief = format!(
        "# Normalization Pass\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Decks examined: {}\n- Decks migrated: {}\n- Similarity reassigned: {} (of {} examined, {} fingerprints)\n- Aliases merged: {}\n- Orphans deleted: {}\n- Failures: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.decks_examined,
        summary.decks_migrated,
        summary.similarity.reassigned,
        summary.similarity.examined,
        summary.similarity.fingerprints,
        summary.aliases_merged,
        summary.orphans_deleted,
        summary.failures,
    );
    fs::write(dir.join("pass_brief.md"), brief)
        .await
        .context("writing pass_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing pass summary")?;
    fs::write(dir.join("pass_summary.json"), json)
        .await
        .context("writing pass_summary.json")?;
    Ok(dir)
}

// ---------------------------------------------------------------------------
// Orchestrator

/// Runs the full convergence sequence. Every step is a no-op when its
/// preconditions already hold, so back-to-back passes with no new data leave
/// storage untouched.
pub struct NormalizationOrchestrator {
    store: Arc<dyn DeckStore>,
    classifier: Arc<ArchetypeClassifier>,
    aliases: AliasTable,
    config: NormalizeConfig,
}

impl NormalizationOrchestrator {
    pub fn new(
        store: Arc<dyn DeckStore>,
        classifier: Arc<ArchetypeClassifier>,
        aliases: AliasTable,
        config: NormalizeConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            aliases,
            config,
        }
    }

    pub async fn run_pass(&self) -> PassSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "normalization pass starting");

        let mut summary = PassSummary {
            run_id,
            started_at,
            finished_at: started_at,
            decks_examined: 0,
            decks_migrated: 0,
            similarity: SimilaritySweepStats::default(),
            aliases_merged: 0,
            orphans_deleted: 0,
            failures: 0,
        };

        self.reclassify_step(&mut summary).await;
        self.similarity_step(&mut summary).await;
        self.alias_merge_step(&mut summary).await;
        self.orphan_cleanup_step(&mut summary).await;

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            migrated = summary.decks_migrated,
            similarity = summary.similarity.reassigned,
            aliases = summary.aliases_merged,
            orphans = summary.orphans_deleted,
            failures = summary.failures,
            "normalization pass finished"
        );
        summary
    }

    pub async fn run_and_report(&self) -> Result<PassSummary> {
        let summary = self.run_pass().await;
        write_pass_report(&self.config.reports_dir, &summary).await?;
        Ok(summary)
    }

    /// Step 1: re-run the classifier (no upstream hint) over every deck and
    /// migrate the ones it confidently labels differently. Default-tier
    /// results never demote an existing specific label.
    async fn reclassify_step(&self, summary: &mut PassSummary) {
        let mut archetype_names: HashMap<i64, String> = match self
            .store
            .find_all_archetypes(None)
            .await
        {
            Ok(rows) => rows.into_iter().map(|a| (a.id, a.name)).collect(),
            Err(err) => {
                warn!(error = %err, "cannot list archetypes; skipping reclassify step");
                summary.failures += 1;
                return;
            }
        };

        let mut offset = 0usize;
        loop {
            let page = match self.store.list_decks_page(offset, self.config.page_size).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, offset, "deck page failed; ending reclassify step");
                    summary.failures += 1;
                    return;
                }
            };
            if page.is_empty() {
                return;
            }
            offset += page.len();

            for deck in page {
                summary.decks_examined += 1;
                match self.reclassify_one(&mut archetype_names, &deck).await {
                    Ok(true) => summary.decks_migrated += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(deck_id = deck.id, error = %err, "reclassify failed; continuing");
                        summary.failures += 1;
                    }
                }
            }
        }
    }

    async fn reclassify_one(
        &self,
        archetype_names: &mut HashMap<i64, String>,
        deck: &DeckRecord,
    ) -> Result<bool> {
        let text = deck.decklist_text();
        let result = self.classifier.classify(&text, deck.format, None).await;
        if !result.is_confident() {
            return Ok(false);
        }
        let current = archetype_names.get(&deck.archetype_id).cloned();
        if current.as_deref() == Some(result.archetype.as_str()) {
            return Ok(false);
        }

        let target = ensure_archetype(self.store.as_ref(), &result.archetype, deck.format)
            .await
            .with_context(|| format!("ensuring archetype {:?}", result.archetype))?;
        archetype_names.insert(target.id, target.name.clone());

        let peers =
            peer_population(self.store.as_ref(), target.id, deck.event_date, Some(deck.id))
                .await
                .context("loading new peer population")?;
        let spice = score_spice(&deck.mainboard, &deck.sideboard, &peers);
        self.store
            .update_deck_classification(deck.id, target.id, spice.count, spice.cards)
            .await
            .context("migrating deck")?;
        debug!(
            deck_id = deck.id,
            from = current.as_deref().unwrap_or("?"),
            to = %target.name,
            method = %result.method,
            "reclassified deck"
        );
        Ok(true)
    }

    /// Step 2: similarity sweep over the remaining "Unknown" decks, per format.
    async fn similarity_step(&self, summary: &mut PassSummary) {
        let sweep = SimilarityReclassifier::new(self.store.as_ref());
        for format in Format::ALL {
            match sweep.run(format).await {
                Ok(stats) => {
                    summary.similarity.fingerprints += stats.fingerprints;
                    summary.similarity.examined += stats.examined;
                    summary.similarity.reassigned += stats.reassigned;
                }
                Err(err) => {
                    warn!(%format, error = %err, "similarity sweep failed; continuing");
                    summary.failures += 1;
                }
            }
        }
    }

    /// Step 3: fold alias-named archetypes into their canonical row, then
    /// refresh the moved decks' spice against the merged population.
    async fn alias_merge_step(&self, summary: &mut PassSummary) {
        for format in Format::ALL {
            let rows = match self.store.find_all_archetypes(Some(format)).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(%format, error = %err, "cannot list archetypes; skipping alias merge");
                    summary.failures += 1;
                    continue;
                }
            };
            for row in rows {
                let Some(canonical) = self.aliases.canonical_for(&row.name) else {
                    continue;
                };
                match self.merge_alias(&row, canonical, format).await {
                    Ok(()) => summary.aliases_merged += 1,
                    Err(err) => {
                        warn!(
                            alias = %row.name,
                            canonical,
                            error = %err,
                            "alias merge failed; continuing"
                        );
                        summary.failures += 1;
                    }
                }
            }
        }
    }

    async fn merge_alias(
        &self,
        alias: &Archetype,
        canonical: &str,
        format: Format,
    ) -> Result<()> {
        let target = ensure_archetype(self.store.as_ref(), canonical, format)
            .await
            .with_context(|| format!("ensuring canonical archetype {canonical:?}"))?;
        let moved_ids: Vec<i64> = self
            .store
            .find_decks_by_archetype(alias.id, None)
            .await
            .context("listing alias decks")?
            .into_iter()
            .map(|d| d.id)
            .collect();
        self.store
            .reassign_decks(alias.id, target.id)
            .await
            .context("moving alias decks")?;
        self.store
            .delete_archetype(alias.id)
            .await
            .context("deleting alias row")?;
        info!(alias = %alias.name, canonical = %target.name, %format, moved = moved_ids.len(), "merged alias archetype");

        for deck_id in moved_ids {
            let Some(deck) = self.store.find_deck(deck_id).await? else {
                continue;
            };
            let peers =
                peer_population(self.store.as_ref(), target.id, deck.event_date, Some(deck.id))
                    .await?;
            let spice = score_spice(&deck.mainboard, &deck.sideboard, &peers);
            self.store
                .update_deck_classification(deck.id, target.id, spice.count, spice.cards)
                .await?;
        }
        Ok(())
    }

    /// Step 4: drop archetype rows nothing references anymore.
    async fn orphan_cleanup_step(&self, summary: &mut PassSummary) {
        let rows = match self.store.find_all_archetypes(None).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "cannot list archetypes; skipping orphan cleanup");
                summary.failures += 1;
                return;
            }
        };
        for row in rows {
            let count = match self.store.count_decks_by_archetype(row.id).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(archetype = %row.name, error = %err, "count failed; continuing");
                    summary.failures += 1;
                    continue;
                }
            };
            if count > 0 {
                continue;
            }
            match self.store.delete_archetype(row.id).await {
                Ok(()) => {
                    debug!(archetype = %row.name, format = %row.format, "deleted orphan archetype");
                    summary.orphans_deleted += 1;
                }
                Err(err) => {
                    warn!(archetype = %row.name, error = %err, "orphan delete failed; continuing");
                    summary.failures += 1;
                }
            }
        }
    }

    /// Cron-driven periodic passes, enabled by configuration. The schedule
    /// may overlap a manual trigger; every write is check-then-write, so the
    /// overlap is safe without locking.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.normalize_cron_1, &self.config.normalize_cron_2] {
            let orchestrator = Arc::clone(&self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let orchestrator = Arc::clone(&orchestrator);
                Box::pin(async move {
                    if let Err(err) = orchestrator.run_and_report().await {
                        warn!(error = %err, "scheduled normalization pass failed");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}
