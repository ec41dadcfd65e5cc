//! JSON backups, restore-by-merge, verification, and CSV export.
//!
//! Backup files are `<dir>/encounters_backup_<YYYYMMDD_HHMMSS>.json` holding
//! `{timestamp, encounters, version}`.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use skywatch_core::aggregate::{self, average_height};
use skywatch_core::types::*;

use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::migration::SCHEMA_VERSION;

/// Records written per transaction during restore.
const RESTORE_BATCH: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub timestamp: f64,
    pub encounters: Vec<Encounter>,
    pub version: i64,
}

pub fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("encounters_backup_{}.json", at.format("%Y%m%d_%H%M%S"))
}

/// Write a backup of `encounters` into `dir`. Returns the file path.
pub fn write_backup(dir: &Path, encounters: Vec<Encounter>, at: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let mut path = dir.join(backup_file_name(at));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!(
            "encounters_backup_{}_{n}.json",
            at.format("%Y%m%d_%H%M%S")
        ));
        n += 1;
    }

    let backup = BackupFile {
        timestamp: at.timestamp_millis() as f64 / 1000.0,
        encounters,
        version: SCHEMA_VERSION,
    };

    // Write to a temp file first so a crash never leaves a truncated backup
    let tmp = path.with_extension("json.tmp");
    {
        let mut out = BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer(&mut out, &backup)?;
        out.flush()?;
    }
    fs::rename(&tmp, &path)?;

    info!(
        "backup of {} encounters written to {}",
        backup.encounters.len(),
        path.display()
    );
    Ok(path)
}

/// Parse a backup file. Any parse failure is reported as corruption.
pub fn read_backup(path: &Path) -> Result<BackupFile> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| StoreError::CorruptedBackup {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BackupStatus {
    Valid(usize),
    Empty,
    Corrupted(String),
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupStatus::Valid(n) => write!(f, "valid ({n} encounters)"),
            BackupStatus::Empty => f.write_str("empty"),
            BackupStatus::Corrupted(reason) => write!(f, "corrupted: {reason}"),
        }
    }
}

pub fn verify_backup(path: &Path) -> BackupStatus {
    match read_backup(path) {
        Ok(b) if b.encounters.is_empty() => BackupStatus::Empty,
        Ok(b) => BackupStatus::Valid(b.encounters.len()),
        Err(StoreError::CorruptedBackup { reason, .. }) => BackupStatus::Corrupted(reason),
        Err(e) => BackupStatus::Corrupted(e.to_string()),
    }
}

/// Classify every `*.json` file in `dir`, sorted by name.
pub fn verify_all_backups(dir: &Path) -> Result<Vec<(PathBuf, BackupStatus)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    Ok(paths
        .into_iter()
        .map(|p| {
            let status = verify_backup(&p);
            (p, status)
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    /// Ids already present (or repeated within the file).
    pub skipped: usize,
}

/// Merge a backup into the database. Existing ids are left untouched, so
/// restoring the same file twice changes nothing the second time.
pub fn restore_backup(db: &mut Database, path: &Path) -> Result<RestoreReport> {
    let backup = read_backup(path)?;
    let mut report = RestoreReport::default();
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();

    for mut enc in backup.encounters {
        enc.id = enc.id.trim().to_string();
        if enc.id.is_empty() || !seen.insert(enc.id.clone()) || db.encounter_exists(&enc.id)? {
            report.skipped += 1;
            continue;
        }
        enc.flight_points.retain(FlightPoint::is_persistable);
        enc.signatures.retain(|s| s.rssi != 0.0);
        aggregate::recompute(&mut enc);
        fresh.push(enc);
    }

    for chunk in fresh.chunks_mut(RESTORE_BATCH) {
        let mut batch: Vec<&mut Encounter> = chunk.iter_mut().collect();
        report.restored += db.save_encounters(&mut batch)?;
    }

    if report.skipped > 0 {
        warn!("restore skipped {} encounters already present", report.skipped);
    }
    info!("restored {} encounters from {}", report.restored, path.display());
    Ok(report)
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

pub const CSV_HEADER: [&str; 22] = [
    "first_seen_lat",
    "first_seen_lon",
    "first_seen_alt",
    "last_seen_lat",
    "last_seen_lon",
    "last_seen_alt",
    "id",
    "caa_registration",
    "primary_mac",
    "flight_path_points",
    "max_altitude",
    "max_speed",
    "average_rssi",
    "flight_duration",
    "average_height",
    "manufacturer",
    "mac_count",
    "mac_history",
    "pilot_lat",
    "pilot_lon",
    "takeoff_lat",
    "takeoff_lon",
];

/// `HH:MM:SS`; hours may exceed 24.
pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn coord(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.6}")).unwrap_or_default()
}

fn csv_row(enc: &Encounter) -> Vec<String> {
    let first = enc.first_gps_point();
    let last = enc.last_gps_point();
    let primary_mac = enc
        .meta(META_MAC)
        .or_else(|| enc.mac_addresses.first().map(String::as_str))
        .unwrap_or("");
    let takeoff = match (enc.meta_f64(META_HOME_LAT), enc.meta_f64(META_HOME_LON)) {
        (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
        _ => first
            .map(|p| (p.home_latitude, p.home_longitude))
            .unwrap_or((None, None)),
    };

    vec![
        coord(first.map(|p| p.latitude)),
        coord(first.map(|p| p.longitude)),
        first.map(|p| format!("{:.1}", p.altitude)).unwrap_or_default(),
        coord(last.map(|p| p.latitude)),
        coord(last.map(|p| p.longitude)),
        last.map(|p| format!("{:.1}", p.altitude)).unwrap_or_default(),
        enc.id.clone(),
        enc.meta(META_CAA_REGISTRATION).unwrap_or("").to_string(),
        primary_mac.to_string(),
        enc.flight_point_count.to_string(),
        format!("{:.1}", enc.max_altitude),
        format!("{:.1}", enc.max_speed),
        format!("{:.1}", enc.average_rssi),
        format_duration(enc.duration()),
        format!("{:.1}", average_height(&enc.signatures)),
        enc.meta(META_MANUFACTURER).unwrap_or("").to_string(),
        enc.mac_addresses.len().to_string(),
        enc.mac_addresses.join(";"),
        coord(enc.meta_f64(META_PILOT_LAT)),
        coord(enc.meta_f64(META_PILOT_LON)),
        coord(takeoff.0),
        coord(takeoff.1),
    ]
}

/// Write a header and one row per encounter. Returns the row count.
pub fn export_csv<W: Write>(encounters: &[Encounter], out: W) -> io::Result<usize> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(CSV_HEADER)?;
    for enc in encounters {
        wtr.write_record(csv_row(enc))?;
    }
    wtr.flush()?;
    Ok(encounters.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
