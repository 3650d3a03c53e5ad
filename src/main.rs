use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use pantry_store::db::backup::{self, BackupOutcome, BackupSlotStatus};
use pantry_store::config::resolve_data_dir;
use pantry_store::db::health::{DbHealthReport, DbHealthStatus};
use pantry_store::db::quarantine::{self, QuarantineEntry};
use pantry_store::{Recipe, RecipeRepository, StorageConfig, StorageCore, StorageStatus};

#[derive(Debug, Parser)]
#[command(name = "pantry", about = "Recipe storage maintenance", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance and inspection commands.
    #[command(subcommand)]
    Db(DbCommand),
    /// Read and add recipes.
    #[command(subcommand)]
    Recipes(RecipeCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Run the SQLite health checks and report their status.
    Status {
        /// Emit the raw JSON health report instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Take a backup into the newest slot, rotating the previous one.
    Backup {
        #[arg(long)]
        json: bool,
    },
    /// Show both backup slots and whether each copy is intact.
    Backups {
        #[arg(long)]
        json: bool,
    },
    /// List quarantined database files and what became of them.
    Quarantine {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum RecipeCommand {
    /// List live recipes, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Add a recipe.
    Add {
        title: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // File logging is best effort; stderr alone still works.
    let log_guard = resolve_data_dir()
        .ok()
        .and_then(|dir| pantry_store::init_file_logging(&dir).ok());
    if log_guard.is_none() {
        pantry_store::init_logging();
    }

    let code = match handle_cli(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    drop(log_guard);
    process::exit(code);
}

fn handle_cli(command: Commands) -> Result<i32> {
    match command {
        Commands::Db(db) => handle_db_command(db),
        Commands::Recipes(recipes) => handle_recipe_command(recipes),
    }
}

/// Bring storage up through the full startup protocol, or explain why it is down.
fn open_core() -> Result<Arc<StorageCore>> {
    let config = StorageConfig::from_env().context("determine database location")?;
    let core = StorageCore::open(config).context("start storage")?;
    if let StorageStatus::Unavailable(err) = core.status() {
        anyhow::bail!("database unavailable: {err}");
    }
    Ok(core)
}

fn handle_db_command(command: DbCommand) -> Result<i32> {
    match command {
        DbCommand::Status { json } => {
            let core = open_core()?;
            let report = core.health_report().context("run database health checks")?;
            if json {
                print_json(&report)?;
            } else {
                print_report_table(&report);
            }
            Ok(if report.is_healthy() { 0 } else { 1 })
        }
        DbCommand::Backup { json } => {
            let core = open_core()?;
            let outcome = core
                .backup_now(backup::TAG_MANUAL)
                .context("create database backup")?;
            if json {
                print_json(&outcome)?;
            } else {
                print_backup(&outcome)?;
            }
            Ok(0)
        }
        DbCommand::Backups { json } => {
            let config = StorageConfig::from_env().context("determine database location")?;
            let slots = backup::backup_status(&config.db_path);
            if json {
                print_json(&slots)?;
            } else {
                print_slots(&slots);
            }
            Ok(0)
        }
        DbCommand::Quarantine { json } => {
            let config = StorageConfig::from_env().context("determine database location")?;
            let entries =
                quarantine::list_quarantine(&config.db_path).context("list quarantine files")?;
            if json {
                print_json(&entries)?;
            } else {
                print_quarantine(&entries);
            }
            Ok(0)
        }
    }
}

fn handle_recipe_command(command: RecipeCommand) -> Result<i32> {
    let core = open_core()?;
    let repo = RecipeRepository::new(core);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("start async runtime")?;

    match command {
        RecipeCommand::List { json } => {
            let recipes = runtime.block_on(repo.fetch_all());
            if json {
                print_json(&recipes)?;
            } else if recipes.is_empty() {
                println!("No recipes.");
            } else {
                for recipe in &recipes {
                    println!("{}  {}", recipe.id, recipe.title);
                }
            }
            Ok(0)
        }
        RecipeCommand::Add { title, notes } => {
            let recipe = Recipe::new(title, notes);
            if runtime.block_on(repo.insert(&recipe)) {
                // Let the queued backup finish before the process exits.
                repo.core().run_sync(|_| ());
                println!("{}", recipe.id);
                Ok(0)
            } else {
                eprintln!("Error: recipe was not saved");
                Ok(1)
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn print_backup(outcome: &BackupOutcome) -> Result<()> {
    let payload = json!({
        "tag": outcome.tag,
        "manifest": outcome.manifest,
    });
    let serialized = serde_json::to_string_pretty(&payload).context("serialize backup manifest")?;
    println!("{serialized}");
    println!("Backup stored at {}", outcome.path.display());
    Ok(())
}

fn print_slots(slots: &[BackupSlotStatus]) {
    println!("{:<8} {:<7} {:<6} {:>12}  Tag", "Slot", "Present", "Valid", "Bytes");
    for slot in slots {
        let tag = slot
            .manifest
            .as_ref()
            .map(|manifest| manifest.tag.as_str())
            .unwrap_or("-");
        println!(
            "{:<8} {:<7} {:<6} {:>12}  {}",
            slot.slot,
            yes_no(slot.present),
            yes_no(slot.valid),
            slot.size_bytes,
            tag
        );
    }
}

fn print_quarantine(entries: &[QuarantineEntry]) {
    if entries.is_empty() {
        println!("No quarantined files.");
        return;
    }
    for entry in entries {
        let state = entry
            .disposition
            .map(|d| d.as_str())
            .unwrap_or("Pending");
        println!("{:<10} {}  {}", state, entry.stamp, entry.path.display());
    }
}

fn print_report_table(report: &DbHealthReport) {
    println!("Database health report");
    println!("Status       : {}", status_label(&report.status));
    println!("Schema hash  : {}", report.schema_hash);
    println!("App version  : {}", report.app_version);
    println!("Generated at : {}", report.generated_at);

    println!("\nChecks:");
    println!(
        "{:<20} {:<7} {:>13}  Details",
        "Check", "Passed", "Duration (ms)"
    );
    for check in &report.checks {
        let details = check
            .details
            .as_deref()
            .map(|value| value.replace('\n', " "))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<7} {:>13}  {}",
            check.name,
            yes_no(check.passed),
            check.duration_ms,
            details
        );
    }

    if report.offenders.is_empty() {
        println!("\nOffenders: none");
    } else {
        println!("\nOffenders:");
        println!("{:<20} {:>10}  Message", "Table", "RowID");
        for offender in &report.offenders {
            println!(
                "{:<20} {:>10}  {}",
                offender.table, offender.rowid, offender.message
            );
        }
    }
}

fn status_label(status: &DbHealthStatus) -> &'static str {
    match status {
        DbHealthStatus::Ok => "ok",
        DbHealthStatus::Error => "error",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
