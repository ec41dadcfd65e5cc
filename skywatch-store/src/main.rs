//! skywatch: CLI for the drone encounter store.

use std::io::{self, BufRead};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};

use skywatch_core::config::{self, Config};
use skywatch_core::types::{Encounter, TrustStatus};
use skywatch_store::backup::{format_duration, BackupStatus};
use skywatch_store::db::Database;
use skywatch_store::drain::{self, DrainOutcome};
use skywatch_store::engine::{self, Engine};

#[derive(Parser)]
#[command(name = "skywatch", version, about = "Drone encounter correlation and storage")]
struct Cli {
    /// SQLite database path (overrides the config file)
    #[arg(long, global = true, env = "SKYWATCH_DB")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest JSON-lines detection messages from a file (or `-` for stdin)
    Ingest {
        #[arg(default_value = "-")]
        file: PathBuf,
    },

    /// List stored encounters, most recent first
    List,

    /// Show one encounter in detail
    Show {
        id: String,

        /// Number of most recent flight points to print
        #[arg(long, default_value = "10")]
        points: usize,
    },

    /// Set a display name (empty clears it)
    Rename { id: String, name: String },

    /// Set trust status: unknown, trusted or untrusted
    Trust { id: String, status: String },

    /// Toggle do-not-track for an encounter
    DoNotTrack {
        id: String,
        #[arg(long)]
        off: bool,
    },

    /// Delete one encounter
    Delete { id: String },

    /// Delete every encounter
    DeleteAll {
        #[arg(long)]
        yes: bool,
    },

    /// Show database statistics
    Stats,

    /// Import the legacy JSON store
    Migrate,

    /// Undo a migration (requires the legacy store to still exist)
    Rollback,

    /// Delete the legacy store after a completed migration
    CleanupLegacy,

    /// Write a JSON backup of every encounter
    Backup,

    /// Merge a backup into the store, skipping existing ids
    Restore { path: PathBuf },

    /// Check every backup in the backup directory
    VerifyBackups,

    /// Reclaim free space in the database file
    Compact,

    /// Recompute cached statistics that disagree with stored history
    RepairStats,

    /// Export every encounter as CSV
    ExportCsv { path: PathBuf },

    /// Write the effective configuration to ~/.skywatch/config.yaml
    InitConfig,
}

fn fail(context: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("Error {context}: {e}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("skywatch=info"))
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config();
    if let Some(path) = cli.db_path {
        cfg.storage.db_path = path;
    }
    if let Err(e) = config::validate(&cfg) {
        fail("checking configuration", e);
    }

    match cli.command {
        Commands::Ingest { file } => cmd_ingest(&cfg, file).await,
        Commands::List => cmd_list(&cfg.storage.db_path),
        Commands::Show { id, points } => cmd_show(&cfg.storage.db_path, &id, points),
        Commands::Stats => cmd_stats(&cfg.storage.db_path),
        Commands::InitConfig => match config::save_config(&cfg) {
            Ok(path) => println!("Wrote {}", path.display()),
            Err(e) => fail("writing config", e),
        },
        cmd => cmd_maintenance(&cfg, cmd),
    }
}

fn open_engine(cfg: &Config) -> Engine {
    Engine::open(cfg.storage.clone(), &cfg.engine)
        .unwrap_or_else(|e| fail(&format!("opening database {}", cfg.storage.db_path), e))
}

fn open_db(db_path: &str) -> Database {
    Database::open(db_path).unwrap_or_else(|e| fail(&format!("opening database {db_path}"), e))
}

async fn cmd_ingest(cfg: &Config, file: PathBuf) {
    let reader: Box<dyn BufRead + Send> = if file.to_str() == Some("-") {
        Box::new(io::BufReader::new(io::stdin()))
    } else {
        let f = std::fs::File::open(&file)
            .unwrap_or_else(|e| fail(&format!("opening {}", file.display()), e));
        Box::new(io::BufReader::new(f))
    };

    let (handle, task) = engine::spawn(open_engine(cfg), &cfg.engine);
    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    // Flushes the engine on every path before returning
    let outcome = drain::drain_until(reader, &handle, interrupt).await;
    let _ = task.await;

    match outcome {
        Ok(DrainOutcome::Finished(report)) => {
            println!();
            println!(
                "Messages: {} ingested, {} skipped",
                report.accepted, report.skipped
            );
            println!();
        }
        Ok(DrainOutcome::Interrupted) => {
            eprintln!("Interrupted; pending writes saved");
            // The reader thread may be parked on a read that never returns
            std::process::exit(130);
        }
        Err(e) => fail("ingesting", e),
    }
}

fn format_ts(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or("-".into())
}

fn cmd_list(db_path: &str) {
    let database = open_db(db_path);
    let encounters = database
        .list_encounters()
        .unwrap_or_else(|e| fail("listing encounters", e));

    println!();
    println!("{} encounters", encounters.len());
    println!();
    if encounters.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Name", "Trust", "First seen", "Last seen", "Duration", "Points", "Sigs",
        "Max alt (m)", "Max speed", "RSSI", "MACs",
    ]);
    for enc in &encounters {
        table.add_row(vec![
            Cell::new(&enc.id),
            Cell::new(if enc.custom_name.is_empty() { "-" } else { enc.custom_name.as_str() }),
            Cell::new(enc.trust_status),
            Cell::new(format_ts(enc.first_seen)),
            Cell::new(format_ts(enc.last_seen)),
            Cell::new(format_duration(enc.duration())),
            Cell::new(enc.flight_point_count),
            Cell::new(enc.signature_count),
            Cell::new(format!("{:.1}", enc.max_altitude)),
            Cell::new(format!("{:.1}", enc.max_speed)),
            Cell::new(format!("{:.1}", enc.average_rssi)),
            Cell::new(enc.mac_addresses.len()),
        ]);
    }
    println!("{table}");
}

fn cmd_show(db_path: &str, id: &str, points: usize) {
    let database = open_db(db_path);
    let enc: Encounter = match database.load_encounter(id) {
        Ok(Some(enc)) => enc,
        Ok(None) => fail("loading encounter", format!("no encounter with id {id}")),
        Err(e) => fail("loading encounter", e),
    };

    println!();
    println!("Encounter {}  ({})", enc.id, enc.display_name());
    println!();
    println!("  Trust:       {}", enc.trust_status);
    println!("  First seen:  {}", format_ts(enc.first_seen));
    println!("  Last seen:   {}", format_ts(enc.last_seen));
    println!("  Duration:    {}", format_duration(enc.duration()));
    println!("  Active:      {}", format_duration(enc.active_seconds()));
    println!("  Points:      {} ({} proximity)", enc.flight_point_count, enc.proximity_point_count());
    println!("  Signatures:  {}", enc.signature_count);
    println!("  Max alt:     {:.1} m", enc.max_altitude);
    println!("  Max speed:   {:.1} m/s", enc.max_speed);
    println!("  Avg RSSI:    {:.1} dBm", enc.average_rssi);
    println!("  MACs:        {}", enc.mac_addresses.join(", "));
    println!();

    if !enc.metadata.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Key", "Value"]);
        for (k, v) in &enc.metadata {
            table.add_row(vec![Cell::new(k), Cell::new(v)]);
        }
        println!("{table}");
    }

    let start = enc.flight_points.len().saturating_sub(points);
    let recent = &enc.flight_points[start..];
    if !recent.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Time", "Lat", "Lon", "Alt (m)", "Kind"]);
        for p in recent {
            table.add_row(vec![
                Cell::new(format_ts(p.timestamp)),
                Cell::new(format!("{:.6}", p.latitude)),
                Cell::new(format!("{:.6}", p.longitude)),
                Cell::new(format!("{:.1}", p.altitude)),
                Cell::new(match p.proximity_radius {
                    Some(r) if p.is_proximity_point => format!("proximity ~{r:.0} m"),
                    _ => "gps".to_string(),
                }),
            ]);
        }
        println!("{table}");
    }
}

fn cmd_stats(db_path: &str) {
    let database = open_db(db_path);
    let stats = database.stats();

    println!();
    println!("Database: {db_path}");
    println!();
    println!("  Encounters:        {}", stats.encounters);
    println!("  Flight points:     {}", stats.flight_points);
    println!("  Proximity points:  {}", stats.proximity_points);
    println!("  Signatures:        {}", stats.signatures);
    println!("  MAC addresses:     {}", stats.macs);
    println!();
}

fn cmd_maintenance(cfg: &Config, cmd: Commands) {
    let mut engine = open_engine(cfg);

    match cmd {
        Commands::Rename { id, name } => {
            engine.rename(&id, &name).unwrap_or_else(|e| fail("renaming", e));
            save(&mut engine);
            println!("{id}: renamed");
        }
        Commands::Trust { id, status } => {
            let status = TrustStatus::from_label(&status);
            engine
                .set_trust_status(&id, status)
                .unwrap_or_else(|e| fail("setting trust status", e));
            save(&mut engine);
            println!("{id}: {status}");
        }
        Commands::DoNotTrack { id, off } => {
            engine
                .set_do_not_track(&id, !off)
                .unwrap_or_else(|e| fail("setting do-not-track", e));
            save(&mut engine);
            println!("{id}: do-not-track {}", if off { "off" } else { "on" });
        }
        Commands::Delete { id } => match engine.delete_encounter(&id) {
            Ok(true) => println!("Deleted {id}"),
            Ok(false) => println!("No encounter {id}"),
            Err(e) => fail("deleting", e),
        },
        Commands::DeleteAll { yes } => {
            if !yes {
                fail("deleting", "refusing to delete everything without --yes");
            }
            let n = engine
                .delete_all_encounters()
                .unwrap_or_else(|e| fail("deleting", e));
            println!("Deleted {n} encounters");
        }
        Commands::Migrate => {
            let report = engine.migrate().unwrap_or_else(|e| fail("migrating", e));
            if report.already_done {
                println!("Migration already completed");
            } else {
                println!(
                    "Migration complete: {} imported, {} updated",
                    report.imported, report.updated
                );
            }
        }
        Commands::Rollback => {
            let n = engine.rollback().unwrap_or_else(|e| fail("rolling back", e));
            println!("Rolled back, {n} encounters removed");
        }
        Commands::CleanupLegacy => match engine.cleanup_legacy() {
            Ok(true) => println!("Removed {}", cfg.storage.legacy_path),
            Ok(false) => println!("No legacy store at {}", cfg.storage.legacy_path),
            Err(e) => fail("cleaning up", e),
        },
        Commands::Backup => {
            let path = engine.create_backup().unwrap_or_else(|e| fail("writing backup", e));
            println!("Wrote {}", path.display());
        }
        Commands::Restore { path } => {
            let report = engine
                .restore(&path)
                .unwrap_or_else(|e| fail(&format!("restoring {}", path.display()), e));
            println!(
                "Restored {} encounters, {} already present",
                report.restored, report.skipped
            );
        }
        Commands::VerifyBackups => {
            let results = engine
                .verify_all_backups()
                .unwrap_or_else(|e| fail("verifying backups", e));
            let mut table = Table::new();
            table.set_header(vec!["Backup", "Status"]);
            for (path, status) in &results {
                table.add_row(vec![Cell::new(path.display()), Cell::new(status)]);
            }
            println!("{table}");
            if results.iter().any(|(_, s)| matches!(s, BackupStatus::Corrupted(_))) {
                std::process::exit(2);
            }
        }
        Commands::Compact => {
            engine.compact().unwrap_or_else(|e| fail("compacting", e));
            println!("Compacted {}", cfg.storage.db_path);
        }
        Commands::RepairStats => {
            let n = engine
                .repair_cached_stats()
                .unwrap_or_else(|e| fail("repairing", e));
            println!("Repaired {n} encounters");
        }
        Commands::ExportCsv { path } => {
            let n = engine
                .export_csv(&path)
                .unwrap_or_else(|e| fail("exporting", e));
            println!("Exported {n} encounters to {}", path.display());
        }
        Commands::Ingest { .. }
        | Commands::List
        | Commands::Show { .. }
        | Commands::Stats
        | Commands::InitConfig => unreachable!("handled in main"),
    }

    if let Err(e) = engine.shutdown() {
        fail("saving changes", e);
    }
}

/// Write pending changes now, before reporting success.
fn save(engine: &mut Engine) {
    if let Err(e) = engine.force_flush() {
        fail("saving changes", e);
    }
}
