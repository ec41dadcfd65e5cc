//! Legacy flat-file import and the migration state machine.
//!
//! State lives in `schema_meta` and moves `not_migrated -> migrating ->
//! completed`. An interrupted run stays in `migrating` and is redone from the
//! start on the next call; every write is an upsert, so redoing is harmless.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use skywatch_core::aggregate;
use skywatch_core::message::lenient_f64;
use skywatch_core::types::{Encounter, FlightPoint, Signature, TrustStatus, META_MAC};

use crate::db::Database;
use crate::error::{Result, StoreError};

/// Schema version written once migration completes.
pub const SCHEMA_VERSION: i64 = 1;

/// Legacy records written per transaction.
pub const MIGRATION_BATCH: usize = 50;

const STATE_KEY: &str = "migration_state";
const VERSION_KEY: &str = "schema_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    NotMigrated,
    Migrating,
    Completed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::NotMigrated => "not_migrated",
            MigrationState::Migrating => "migrating",
            MigrationState::Completed => "completed",
        }
    }

    fn from_label(label: &str) -> Self {
        match label {
            "migrating" => MigrationState::Migrating,
            "completed" => MigrationState::Completed,
            _ => MigrationState::NotMigrated,
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Legacy format
// ---------------------------------------------------------------------------

/// One record of the legacy JSON store (`id -> record`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEncounter {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub first_seen: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub last_seen: f64,
    #[serde(default)]
    pub flight_path: Vec<FlightPoint>,
    #[serde(default)]
    pub signatures: Vec<Signature>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub mac_history: Vec<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub trust_status: Option<String>,
}

impl LegacyEncounter {
    /// Convert to the current model. `key` is the map key, used when the
    /// record itself carries no id. Placeholder children are dropped.
    pub fn into_encounter(self, key: &str) -> Encounter {
        let id = if self.id.trim().is_empty() { key } else { self.id.trim() };
        let mut enc = Encounter::new(id, self.first_seen);
        enc.last_seen = self.last_seen.max(self.first_seen);
        enc.custom_name = self.custom_name.unwrap_or_default();
        enc.trust_status = self
            .trust_status
            .as_deref()
            .map(TrustStatus::from_label)
            .unwrap_or_default();

        for (k, v) in self.metadata {
            let value = match v {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            enc.metadata.insert(k, value);
        }

        enc.flight_points = self
            .flight_path
            .into_iter()
            .filter(FlightPoint::is_persistable)
            .collect();
        enc.signatures = self
            .signatures
            .into_iter()
            .filter(|s| s.rssi != 0.0)
            .collect();

        for mac in &self.mac_history {
            enc.add_mac(mac);
        }
        if let Some(mac) = enc.meta(META_MAC).map(str::to_string) {
            enc.add_mac(&mac);
        }

        if enc.first_seen == 0.0 {
            let earliest = enc
                .flight_points
                .iter()
                .map(|p| p.timestamp)
                .chain(enc.signatures.iter().map(|s| s.timestamp))
                .fold(f64::INFINITY, f64::min);
            if earliest.is_finite() {
                enc.first_seen = earliest;
                enc.last_seen = enc.last_seen.max(earliest);
            }
        }

        aggregate::recompute(&mut enc);
        enc
    }
}

/// Read the legacy store as current-model encounters, oldest first.
pub fn load_legacy_encounters(path: &Path) -> Result<Vec<Encounter>> {
    let text = std::fs::read_to_string(path)?;
    let records: BTreeMap<String, LegacyEncounter> = serde_json::from_str(&text)?;
    let mut encounters: Vec<Encounter> = records
        .into_iter()
        .map(|(key, legacy)| legacy.into_encounter(&key))
        .collect();
    encounters.sort_by(|a, b| a.first_seen.total_cmp(&b.first_seen));
    Ok(encounters)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub fn migration_state(db: &Database) -> rusqlite::Result<MigrationState> {
    Ok(db
        .get_meta(STATE_KEY)?
        .map(|s| MigrationState::from_label(&s))
        .unwrap_or(MigrationState::NotMigrated))
}

pub fn schema_version(db: &Database) -> rusqlite::Result<i64> {
    Ok(db
        .get_meta(VERSION_KEY)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

fn set_state(
    db: &mut Database,
    state: MigrationState,
    on_state: &mut impl FnMut(MigrationState),
) -> rusqlite::Result<()> {
    db.set_meta(STATE_KEY, state.as_str())?;
    on_state(state);
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationReport {
    /// New durable records.
    pub imported: usize,
    /// Existing records whose scalars and children were replaced.
    pub updated: usize,
    /// Nothing to do: already completed at the current version.
    pub already_done: bool,
}

/// Import the legacy store. A no-op once completed at the current version.
///
/// A missing legacy file counts as an empty store. The file itself is left
/// in place; see `cleanup_legacy`.
pub fn migrate(
    db: &mut Database,
    legacy_path: &Path,
    mut on_state: impl FnMut(MigrationState),
) -> Result<MigrationReport> {
    if migration_state(db)? == MigrationState::Completed && schema_version(db)? >= SCHEMA_VERSION {
        debug!("migration already completed at version {SCHEMA_VERSION}");
        return Ok(MigrationReport {
            already_done: true,
            ..Default::default()
        });
    }

    set_state(db, MigrationState::Migrating, &mut on_state)?;

    let mut legacy = if legacy_path.exists() {
        match load_legacy_encounters(legacy_path) {
            Ok(v) => v,
            Err(e) => {
                warn!("legacy store {} unreadable: {e}", legacy_path.display());
                set_state(db, MigrationState::NotMigrated, &mut on_state)?;
                return Err(e);
            }
        }
    } else {
        info!("no legacy store at {}, nothing to import", legacy_path.display());
        Vec::new()
    };

    let total = legacy.len();
    let mut report = MigrationReport::default();
    for chunk in legacy.chunks_mut(MIGRATION_BATCH) {
        for enc in chunk.iter() {
            if db.encounter_exists(&enc.id)? {
                report.updated += 1;
            } else {
                report.imported += 1;
            }
        }
        let mut batch: Vec<&mut Encounter> = chunk.iter_mut().collect();
        db.save_encounters(&mut batch)?;
        debug!(
            "migration: committed {} of {} records",
            report.imported + report.updated,
            total
        );
    }

    db.set_meta(VERSION_KEY, &SCHEMA_VERSION.to_string())?;
    set_state(db, MigrationState::Completed, &mut on_state)?;
    info!(
        "migration complete: {} imported, {} updated",
        report.imported, report.updated
    );
    Ok(report)
}

/// Undo a migration: delete every durable record and reset the state.
///
/// Refused when the legacy file is gone, since nothing could be re-imported.
pub fn rollback(
    db: &mut Database,
    legacy_path: &Path,
    mut on_state: impl FnMut(MigrationState),
) -> Result<usize> {
    if !legacy_path.exists() {
        return Err(StoreError::LegacyMissing(legacy_path.to_path_buf()));
    }
    let removed = db.delete_all_encounters()?;
    set_state(db, MigrationState::NotMigrated, &mut on_state)?;
    warn!("migration rolled back, {removed} durable encounters removed");
    Ok(removed)
}

/// Delete the legacy file. Refused until migration has completed.
/// Returns false when there was no file to delete.
pub fn cleanup_legacy(db: &Database, legacy_path: &Path) -> Result<bool> {
    if migration_state(db)? != MigrationState::Completed {
        return Err(StoreError::MigrationIncomplete);
    }
    if !legacy_path.exists() {
        return Ok(false);
    }
    std::fs::remove_file(legacy_path)?;
    info!("removed legacy store {}", legacy_path.display());
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
