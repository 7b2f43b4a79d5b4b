//! IndexSync CLI - Operator commands for keeping a search index in step
//! with its record store.
//!
//! Rebuilds, clears, orphan scans and consistency checks run against the
//! backends named in a JSON configuration file.

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use indexsync_adapters::KeyStub;
use indexsync_common::{ClassTag, RecordKey};
use indexsync_engine::{OrphanReport, ReindexOptions};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "indexsync")]
#[command(about = "IndexSync - Search index synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = "indexsync.json")]
    config: PathBuf,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the index for a record class.
    Reindex {
        /// Record class to rebuild.
        class: String,

        /// Records per batch.
        #[arg(short, long, conflicts_with = "no_batching", allow_hyphen_values = true)]
        batch_size: Option<i64>,

        /// Index the whole class in a single call.
        #[arg(long)]
        no_batching: bool,

        /// Commit only once at the end.
        #[arg(long)]
        no_commit_per_batch: bool,
    },

    /// Remove every index entry of a class and commit.
    Clear {
        /// Record class to clear.
        class: String,
    },

    /// List index entries whose records no longer exist.
    Orphans {
        /// Record class to scan.
        class: String,
    },

    /// Remove orphaned index entries and commit.
    Repair {
        /// Record class to repair.
        class: String,

        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove a single index entry by key and commit.
    Remove {
        /// Record class of the entry.
        class: String,

        /// Primary key; digits are read as an integer key.
        key: String,
    },

    /// Compare index and record store in both directions.
    Verify {
        /// Record class to verify.
        class: String,
    },

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let json = cli.json;
    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "indexsync", &mut std::io::stdout());
            Ok(())
        }

        Commands::Reindex {
            class,
            batch_size,
            no_batching,
            no_commit_per_batch,
        } => {
            cmd_reindex(
                &cli.config,
                &class,
                batch_size,
                no_batching,
                no_commit_per_batch,
                json,
            )
            .await
        }

        Commands::Clear { class } => cmd_clear(&cli.config, &class, json).await,

        Commands::Orphans { class } => cmd_orphans(&cli.config, &class, json).await,

        Commands::Repair { class, dry_run } => cmd_repair(&cli.config, &class, dry_run, json).await,

        Commands::Remove { class, key } => cmd_remove(&cli.config, &class, &key, json).await,

        Commands::Verify { class } => cmd_verify(&cli.config, &class, json).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Rebuild a class.
async fn cmd_reindex(
    config_path: &Path,
    class: &str,
    batch_size: Option<i64>,
    no_batching: bool,
    no_commit_per_batch: bool,
    json: bool,
) -> Result<()> {
    let config = CliConfig::load(config_path)?;
    let class = config.class(class)?;
    let engine = config.open_engine()?;
    let source = config.open_source()?;

    let mut options = engine.default_reindex_options();
    if no_batching {
        options.batch_size = None;
    } else if let Some(size) = batch_size {
        options = options.with_batch_size(size);
    }
    if no_commit_per_batch {
        options = options.with_commit_per_batch(false);
    }

    // Ctrl-C stops the rebuild at the next batch boundary.
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            flag.store(true, Ordering::SeqCst);
        }
    });
    let options: ReindexOptions = options.with_cancel_flag(cancel);

    info!("Reindexing {} from {}", class, config.store.display());
    let report = engine
        .reindex_class(&source, &class, options)
        .await
        .with_context(|| format!("Failed to reindex {}", class))?;

    if json {
        return print_json(&report);
    }

    println!("Reindexed {}", report.class);
    println!("  Run: {}", report.run_id);
    println!("  Started: {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Records: {}", report.records_indexed);
    if report.batched {
        println!("  Batches: {}", report.batches.len());
        for batch in &report.batches {
            println!(
                "    #{:<4} offset {:<8} {:>6} records  {:>10.1} rec/s{}",
                batch.batch_number,
                batch.offset,
                batch.size,
                batch.records_per_sec,
                if batch.committed { "  committed" } else { "" }
            );
        }
    } else {
        println!("  Batches: unbatched");
    }
    println!("  Commits: {}", report.commits);
    println!("  Elapsed: {:.2}s", report.elapsed.as_secs_f64());

    Ok(())
}

/// Remove every entry of a class.
async fn cmd_clear(config_path: &Path, class: &str, json: bool) -> Result<()> {
    let config = CliConfig::load(config_path)?;
    let class = config.class(class)?;
    let engine = config.open_engine()?;

    engine
        .remove_all_of_class_and_commit(&class)
        .await
        .with_context(|| format!("Failed to clear {}", class))?;

    if json {
        return print_json(&serde_json::json!({ "class": class, "cleared": true }));
    }
    println!("Cleared all {} entries from the {} index", class, engine.index().name());

    Ok(())
}

/// List orphans without touching the index.
async fn cmd_orphans(config_path: &Path, class: &str, json: bool) -> Result<()> {
    let config = CliConfig::load(config_path)?;
    let class = config.class(class)?;
    let engine = config.open_engine()?;
    let source = config.open_source()?;

    let orphans = engine
        .find_orphans(&source, &class)
        .await
        .with_context(|| format!("Failed to scan {} for orphans", class))?;

    if json {
        return print_json(&orphans);
    }
    if orphans.is_empty() {
        println!("No orphans in {}.", class);
    } else {
        println!("{} orphaned {} entries:", orphans.len(), class);
        for key in &orphans {
            println!("  {}", key);
        }
    }

    Ok(())
}

/// Find orphans and, unless dry-running, remove them with a commit.
///
/// Index writes are rolled back when the process exits, so removals are
/// always committed here.
async fn repair(config: &CliConfig, class: &ClassTag, dry_run: bool) -> Result<OrphanReport> {
    let engine = config.open_engine()?;
    let source = config.open_source()?;

    let report = if dry_run {
        let orphans = engine.find_orphans(&source, class).await?;
        OrphanReport {
            class: class.clone(),
            orphans,
            removed: 0,
            committed: false,
        }
    } else {
        engine.repair_orphans_and_commit(&source, class).await?
    };
    Ok(report)
}

async fn cmd_repair(config_path: &Path, class: &str, dry_run: bool, json: bool) -> Result<()> {
    let config = CliConfig::load(config_path)?;
    let class = config.class(class)?;

    let report = repair(&config, &class, dry_run)
        .await
        .with_context(|| format!("Failed to repair {}", class))?;

    if json {
        return print_json(&report);
    }
    if report.is_clean() {
        println!("No orphans in {}.", class);
    } else if dry_run {
        println!("Would remove {} orphaned {} entries:", report.orphans.len(), class);
        for key in &report.orphans {
            println!("  {}", key);
        }
    } else {
        println!("Removed {} orphaned {} entries", report.removed, class);
    }

    Ok(())
}

/// Remove one entry by key.
async fn remove(config: &CliConfig, class: &ClassTag, key: &str) -> Result<RecordKey> {
    let engine = config.open_engine()?;
    let key = RecordKey::parse(key);
    engine
        .remove_record_and_commit(&KeyStub::new(class.clone(), key.clone()))
        .await?;
    Ok(key)
}

async fn cmd_remove(config_path: &Path, class: &str, key: &str, json: bool) -> Result<()> {
    let config = CliConfig::load(config_path)?;
    let class = config.class(class)?;

    let key = remove(&config, &class, key)
        .await
        .with_context(|| format!("Failed to remove {} {}", class, key))?;

    if json {
        return print_json(&serde_json::json!({ "class": class, "key": key, "removed": true }));
    }
    println!("Removed {} {} from the index", class, key);

    Ok(())
}

/// Two-way consistency check. Fails when the class is inconsistent.
async fn cmd_verify(config_path: &Path, class: &str, json: bool) -> Result<()> {
    let config = CliConfig::load(config_path)?;
    let class = config.class(class)?;
    let engine = config.open_engine()?;
    let source = config.open_source()?;

    let report = engine
        .verify_class(&source, &class)
        .await
        .with_context(|| format!("Failed to verify {}", class))?;

    if json {
        print_json(&report)?;
    } else {
        println!("Consistency of {}:", class);
        println!("  Indexed: {}", report.indexed);
        println!("  Stored: {}", report.stored);
        println!("  Orphans: {}", report.orphans.len());
        println!("  Missing: {}", report.missing.len());
        println!("  Duplicates: {}", report.duplicates.len());
    }

    if !report.is_consistent() {
        anyhow::bail!("{} is out of sync; run reindex or repair", class);
    }

    Ok(())
}
