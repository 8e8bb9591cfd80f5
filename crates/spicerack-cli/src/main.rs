use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spicerack_classify::{annotate_deck, peer_population};
use spicerack_ingest::{parse_scraped_batch, IngestPipeline};
use spicerack_normalize::{
    classifier_from_rules, AliasTable, NormalizationOrchestrator, NormalizeConfig,
};
use spicerack_storage::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "spicerack-cli")]
#[command(about = "Spicerack tournament result pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Admit a scraped batch file (JSON array of deck records).
    Ingest { path: PathBuf },
    /// Admit a scraped batch, run a normalization pass, and show spice.
    Run { path: PathBuf },
    /// Run one normalization pass; waits on the cron schedule when enabled.
    Normalize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = NormalizeConfig::from_env();

    match cli.command.unwrap_or(Commands::Normalize) {
        Commands::Ingest { path } => {
            let store = MemoryStore::new();
            let report = ingest_batch(&store, &config, &path).await?;
            println!(
                "ingest complete: admitted={} replaced={} dup_event={} dup_content={} missing={} failed={}",
                report.admitted,
                report.replaced,
                report.skipped_duplicate_event,
                report.skipped_duplicate_content,
                report.skipped_missing_decklist,
                report.failed
            );
        }
        Commands::Run { path } => {
            let store = Arc::new(MemoryStore::new());
            let report = ingest_batch(store.as_ref(), &config, &path).await?;
            println!(
                "ingest complete: admitted={} replaced={} dup_event={} dup_content={} missing={} failed={}",
                report.admitted,
                report.replaced,
                report.skipped_duplicate_event,
                report.skipped_duplicate_content,
                report.skipped_missing_decklist,
                report.failed
            );

            let orchestrator = build_orchestrator(store.clone(), &config)?;
            let summary = orchestrator.run_and_report().await?;
            println!(
                "normalize complete: run_id={} migrated={} similarity={} aliases={} orphans={}",
                summary.run_id,
                summary.decks_migrated,
                summary.similarity.reassigned,
                summary.aliases_merged,
                summary.orphans_deleted
            );
            print_spice(store.as_ref()).await?;
        }
        Commands::Normalize => {
            let store = Arc::new(MemoryStore::new());
            let orchestrator = Arc::new(build_orchestrator(store, &config)?);
            let summary = orchestrator.run_and_report().await?;
            println!(
                "normalize complete: run_id={} examined={} migrated={} failures={}",
                summary.run_id, summary.decks_examined, summary.decks_migrated, summary.failures
            );

            if let Some(scheduler) = orchestrator.clone().maybe_build_scheduler().await? {
                scheduler.start().await.context("starting scheduler")?;
                println!("scheduler running; ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            }
        }
    }

    Ok(())
}

async fn ingest_batch(
    store: &MemoryStore,
    config: &NormalizeConfig,
    path: &PathBuf,
) -> Result<spicerack_ingest::IngestReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let batch = parse_scraped_batch(&text)?;
    let classifier = classifier_from_rules(&config.rules_dir)?;
    let pipeline = IngestPipeline::new(store, &classifier);
    Ok(pipeline.admit_all(&batch).await)
}

fn build_orchestrator(
    store: Arc<MemoryStore>,
    config: &NormalizeConfig,
) -> Result<NormalizationOrchestrator> {
    let classifier = Arc::new(classifier_from_rules(&config.rules_dir)?);
    let aliases = AliasTable::from_yaml_file(config.rules_dir.join("aliases.yaml"))?;
    Ok(NormalizationOrchestrator::new(
        store,
        classifier,
        aliases,
        config.clone(),
    ))
}

/// Print each deck's spice, with the per-card annotation for the spiciest one.
async fn print_spice(store: &MemoryStore) -> Result<()> {
    let mut decks = store.snapshot_decks().await;
    decks.sort_by(|a, b| b.spice_count.cmp(&a.spice_count).then(a.id.cmp(&b.id)));
    for deck in &decks {
        println!(
            "deck {} {} [{}] spice={} {:?}",
            deck.id, deck.player_name, deck.event_name, deck.spice_count, deck.spice_cards
        );
    }
    if let Some(deck) = decks.first().filter(|d| d.spice_count > 0) {
        let peers = peer_population(store, deck.archetype_id, deck.event_date, Some(deck.id)).await?;
        println!("spiciest deck {} card frequencies:", deck.id);
        for card in annotate_deck(deck, &peers) {
            println!(
                "  {:>2}x {} freq={}{}",
                card.count,
                card.name,
                card.frequency,
                if card.is_spice { " *spice*" } else { "" }
            );
        }
    }
    Ok(())
}
