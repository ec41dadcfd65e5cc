//! The engine task: single owner of every mutable piece of state.
//!
//! All writes arrive as `Command`s over a bounded channel and run in order on
//! one tokio task. The same `select!` loop drives the write coalescer: every
//! tick flushes the dirty set, and every Nth flush rebuilds the read
//! projection from storage. Listeners get `EngineEvent`s over a broadcast
//! channel and read the projection through an `Arc` snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use log::{debug, error, info};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use skywatch_core::aggregate;
use skywatch_core::config::{EngineConfig, StorageConfig};
use skywatch_core::message::{DetectionMessage, ObserverStatus};
use skywatch_core::types::{Encounter, TrustStatus, META_DO_NOT_TRACK};

use crate::backup::{self, BackupStatus, RestoreReport};
use crate::db::{Database, DbStats};
use crate::error::{Result, StoreError};
use crate::migration::{self, MigrationReport, MigrationState};
use crate::pipeline::{IngestOutcome, Pipeline};
use crate::projection::{LightweightEncounter, ProjectionCache, ProjectionMap};
use crate::repository::Repository;

const EVENT_CAPACITY: usize = 256;

pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Change notification. Carries ids only; fetch data from the projection.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    EncounterUpdated(String),
    EncounterDeleted(String),
    MigrationStatusChanged(MigrationState),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    repo: Repository,
    pipeline: Pipeline,
    projection: Arc<ProjectionCache>,
    events: broadcast::Sender<EngineEvent>,
    storage: StorageConfig,
    rebuild_every: u64,
    flushes: u64,
}

impl Engine {
    pub fn new(db: Database, storage: StorageConfig, config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut engine = Engine {
            repo: Repository::new(db),
            pipeline: Pipeline::new(),
            projection: Arc::new(ProjectionCache::new()),
            events,
            storage,
            rebuild_every: u64::from(config.projection_rebuild_every.max(1)),
            flushes: 0,
        };
        engine.rebuild_projection();
        engine
    }

    /// Open the configured database and build an engine on it.
    pub fn open(storage: StorageConfig, config: &EngineConfig) -> Result<Self> {
        let db = Database::open(&storage.db_path)?;
        Ok(Self::new(db, storage, config))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn projection(&self) -> Arc<ProjectionCache> {
        Arc::clone(&self.projection)
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn legacy_path(&self) -> &Path {
        Path::new(&self.storage.legacy_path)
    }

    fn rebuild_projection(&mut self) {
        if let Err(e) = self.projection.rebuild(self.repo.db(), now()) {
            error!("projection rebuild failed: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Ingestion and coalescing
    // -----------------------------------------------------------------------

    /// Fold one message in. Storage errors are logged and the message dropped.
    pub fn ingest(&mut self, msg: &DetectionMessage, observer: Option<&ObserverStatus>) -> Option<IngestOutcome> {
        let outcome = match self
            .pipeline
            .ingest(&mut self.repo, &self.projection, msg, observer, now())
        {
            Ok(outcome) => outcome?,
            Err(e) => {
                error!("ingest of {} failed: {e}", msg.uid);
                return None;
            }
        };
        if outcome.notify {
            self.emit(EngineEvent::EncounterUpdated(outcome.id.clone()));
        }
        Some(outcome)
    }

    /// Periodic flush. Failures are logged; the dirty set is retried next time.
    pub fn tick(&mut self) -> usize {
        match self.force_flush() {
            Ok(n) => n,
            Err(e) => {
                error!("flush failed, will retry: {e}");
                0
            }
        }
    }

    /// Write every dirty record now.
    pub fn force_flush(&mut self) -> Result<usize> {
        let written = self.repo.flush(now())?;
        if written > 0 {
            self.flushes += 1;
            debug!("flushed {written} encounters");
            if self.flushes % self.rebuild_every == 0 {
                self.rebuild_projection();
            }
        }
        Ok(written)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Flush before the task exits. A failed flush is returned to the caller;
    /// the unwritten records are lost once the engine is dropped.
    pub fn shutdown(&mut self) -> Result<usize> {
        let result = self.force_flush();
        match &result {
            Ok(n) => info!("final flush wrote {n} encounters"),
            Err(e) => error!("final flush failed, {} encounters unsaved: {e}", self.repo.dirty_count()),
        }
        result
    }

    // -----------------------------------------------------------------------
    // User mutations
    // -----------------------------------------------------------------------

    fn mutate(&mut self, id: &str, f: impl FnOnce(&mut Encounter)) -> Result<()> {
        let enc = self
            .repo
            .get_mut(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(enc);
        aggregate::recompute(enc);
        let light = LightweightEncounter::from_encounter(enc, now());
        self.repo.mark_dirty(id);
        self.projection.upsert(light);
        self.emit(EngineEvent::EncounterUpdated(id.to_string()));
        Ok(())
    }

    pub fn rename(&mut self, id: &str, name: &str) -> Result<()> {
        let name = name.trim().to_string();
        self.mutate(id, |enc| enc.custom_name = name)
    }

    pub fn set_trust_status(&mut self, id: &str, status: TrustStatus) -> Result<()> {
        self.mutate(id, |enc| enc.trust_status = status)
    }

    pub fn set_do_not_track(&mut self, id: &str, enabled: bool) -> Result<()> {
        self.mutate(id, |enc| {
            if enabled {
                enc.set_meta(META_DO_NOT_TRACK, "true");
            } else {
                enc.metadata.remove(META_DO_NOT_TRACK);
            }
        })
    }

    pub fn get_encounter(&self, id: &str) -> Result<Option<Encounter>> {
        Ok(self.repo.get(id)?)
    }

    pub fn delete_encounter(&mut self, id: &str) -> Result<bool> {
        let removed = self.repo.remove(id)?;
        self.pipeline.resolver_mut().forget(id);
        self.projection.remove(id);
        if removed {
            info!("deleted encounter {id}");
            self.emit(EngineEvent::EncounterDeleted(id.to_string()));
        }
        Ok(removed)
    }

    pub fn delete_all_encounters(&mut self) -> Result<usize> {
        let mut ids = self.repo.db().encounter_ids()?;
        for id in self.projection.get().keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        let removed = self.repo.remove_all()?;
        self.pipeline.resolver_mut().clear();
        self.projection.clear();
        for id in ids {
            self.emit(EngineEvent::EncounterDeleted(id));
        }
        info!("deleted all {removed} encounters");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Run `f` on the database after a flush, then drop every in-memory view
    /// that could be stale.
    fn with_storage<T>(&mut self, f: impl FnOnce(&mut Database, &broadcast::Sender<EngineEvent>) -> Result<T>) -> Result<T> {
        self.force_flush()?;
        let result = f(self.repo.db_mut(), &self.events);
        self.repo.reset();
        self.pipeline.resolver_mut().clear();
        self.rebuild_projection();
        result
    }

    pub fn migration_state(&self) -> Result<MigrationState> {
        Ok(migration::migration_state(self.repo.db())?)
    }

    pub fn migrate(&mut self) -> Result<MigrationReport> {
        let legacy = self.legacy_path().to_path_buf();
        self.with_storage(|db, events| {
            migration::migrate(db, &legacy, |s| {
                let _ = events.send(EngineEvent::MigrationStatusChanged(s));
            })
        })
    }

    pub fn rollback(&mut self) -> Result<usize> {
        let legacy = self.legacy_path().to_path_buf();
        self.with_storage(|db, events| {
            migration::rollback(db, &legacy, |s| {
                let _ = events.send(EngineEvent::MigrationStatusChanged(s));
            })
        })
    }

    pub fn cleanup_legacy(&mut self) -> Result<bool> {
        migration::cleanup_legacy(self.repo.db(), self.legacy_path())
    }

    /// Back up every durable record, or the legacy store before migration.
    pub fn create_backup(&mut self) -> Result<PathBuf> {
        self.force_flush()?;
        let legacy = self.legacy_path();
        let encounters = if self.migration_state()? != MigrationState::Completed && legacy.exists() {
            migration::load_legacy_encounters(legacy)?
        } else {
            self.repo.db().load_all_encounters()?
        };
        backup::write_backup(Path::new(&self.storage.backup_dir), encounters, Utc::now())
    }

    pub fn restore(&mut self, path: &Path) -> Result<RestoreReport> {
        self.with_storage(|db, _| backup::restore_backup(db, path))
    }

    pub fn verify_all_backups(&self) -> Result<Vec<(PathBuf, BackupStatus)>> {
        backup::verify_all_backups(Path::new(&self.storage.backup_dir))
    }

    pub fn compact(&mut self) -> Result<()> {
        self.force_flush()?;
        self.repo.db_mut().vacuum()?;
        info!("database compacted");
        Ok(())
    }

    pub fn repair_cached_stats(&mut self) -> Result<usize> {
        let repaired = self.repo.repair_cached_stats(now())?;
        self.rebuild_projection();
        Ok(repaired)
    }

    /// Write every durable record as CSV to `path`.
    pub fn export_csv(&mut self, path: &Path) -> Result<usize> {
        self.force_flush()?;
        let encounters = self.repo.db().load_all_encounters()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        Ok(backup::export_csv(&encounters, file)?)
    }

    pub fn stats(&self) -> DbStats {
        self.repo.db().stats()
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Ingest { message, observer } => {
                self.ingest(&message, observer.as_ref());
            }
            Command::Rename { id, name, reply } => {
                let _ = reply.send(self.rename(&id, &name));
            }
            Command::SetTrustStatus { id, status, reply } => {
                let _ = reply.send(self.set_trust_status(&id, status));
            }
            Command::SetDoNotTrack { id, enabled, reply } => {
                let _ = reply.send(self.set_do_not_track(&id, enabled));
            }
            Command::GetEncounter { id, reply } => {
                let _ = reply.send(self.get_encounter(&id));
            }
            Command::DeleteEncounter { id, reply } => {
                let _ = reply.send(self.delete_encounter(&id));
            }
            Command::DeleteAll { reply } => {
                let _ = reply.send(self.delete_all_encounters());
            }
            Command::ForceFlush { reply } => {
                let _ = reply.send(self.force_flush());
            }
            Command::Migrate { reply } => {
                let _ = reply.send(self.migrate());
            }
            Command::Rollback { reply } => {
                let _ = reply.send(self.rollback());
            }
            Command::CleanupLegacy { reply } => {
                let _ = reply.send(self.cleanup_legacy());
            }
            Command::MigrationState { reply } => {
                let _ = reply.send(self.migration_state());
            }
            Command::CreateBackup { reply } => {
                let _ = reply.send(self.create_backup());
            }
            Command::Restore { path, reply } => {
                let _ = reply.send(self.restore(&path));
            }
            Command::VerifyBackups { reply } => {
                let _ = reply.send(self.verify_all_backups());
            }
            Command::Compact { reply } => {
                let _ = reply.send(self.compact());
            }
            Command::RepairStats { reply } => {
                let _ = reply.send(self.repair_cached_stats());
            }
            Command::ExportCsv { path, reply } => {
                let _ = reply.send(self.export_csv(&path));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task and handle
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Ingest {
        message: Box<DetectionMessage>,
        observer: Option<ObserverStatus>,
    },
    Rename { id: String, name: String, reply: Reply<()> },
    SetTrustStatus { id: String, status: TrustStatus, reply: Reply<()> },
    SetDoNotTrack { id: String, enabled: bool, reply: Reply<()> },
    GetEncounter { id: String, reply: Reply<Option<Encounter>> },
    DeleteEncounter { id: String, reply: Reply<bool> },
    DeleteAll { reply: Reply<usize> },
    ForceFlush { reply: Reply<usize> },
    Migrate { reply: Reply<MigrationReport> },
    Rollback { reply: Reply<usize> },
    CleanupLegacy { reply: Reply<bool> },
    MigrationState { reply: Reply<MigrationState> },
    CreateBackup { reply: Reply<PathBuf> },
    Restore { path: PathBuf, reply: Reply<RestoreReport> },
    VerifyBackups { reply: Reply<Vec<(PathBuf, BackupStatus)>> },
    Compact { reply: Reply<()> },
    RepairStats { reply: Reply<usize> },
    ExportCsv { path: PathBuf, reply: Reply<usize> },
    Stats { reply: Reply<DbStats> },
    Shutdown { reply: Reply<usize> },
}

/// Start the engine task. The returned handle is cheap to clone.
pub fn spawn(engine: Engine, config: &EngineConfig) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let handle = EngineHandle {
        tx,
        events: engine.events.clone(),
        projection: engine.projection(),
    };
    let period = Duration::from_secs_f64(config.flush_interval_sec.max(0.01));
    let task = tokio::spawn(run(engine, rx, period));
    (handle, task)
}

async fn run(mut engine: Engine, mut rx: mpsc::Receiver<Command>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd @ Command::Shutdown { .. }) => {
                    engine.handle(cmd);
                    break;
                }
                Some(cmd) => engine.handle(cmd),
                None => {
                    // Every handle is gone; the failure is already logged
                    let _ = engine.shutdown();
                    break;
                }
            },
            _ = ticker.tick() => {
                engine.tick();
            }
        }
    }
    info!("engine stopped");
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    projection: Arc<ProjectionCache>,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Current read projection.
    pub fn snapshot(&self) -> Arc<ProjectionMap> {
        self.projection.get()
    }

    /// Queue a message. Waits while the queue is full.
    pub async fn ingest(&self, message: DetectionMessage, observer: Option<ObserverStatus>) -> Result<()> {
        self.tx
            .send(Command::Ingest {
                message: Box::new(message),
                observer,
            })
            .await
            .map_err(|_| StoreError::EngineStopped)
    }

    /// Queue a message from a non-async thread.
    pub fn blocking_ingest(&self, message: DetectionMessage, observer: Option<ObserverStatus>) -> Result<()> {
        self.tx
            .blocking_send(Command::Ingest {
                message: Box::new(message),
                observer,
            })
            .map_err(|_| StoreError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StoreError::EngineStopped)?;
        rx.await.map_err(|_| StoreError::EngineStopped)?
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| Command::Rename { id, name, reply }).await
    }

    pub async fn set_trust_status(&self, id: &str, status: TrustStatus) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::SetTrustStatus { id, status, reply }).await
    }

    pub async fn set_do_not_track(&self, id: &str, enabled: bool) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::SetDoNotTrack { id, enabled, reply }).await
    }

    pub async fn get_encounter(&self, id: &str) -> Result<Option<Encounter>> {
        let id = id.to_string();
        self.request(|reply| Command::GetEncounter { id, reply }).await
    }

    pub async fn delete_encounter(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteEncounter { id, reply }).await
    }

    pub async fn delete_all_encounters(&self) -> Result<usize> {
        self.request(|reply| Command::DeleteAll { reply }).await
    }

    pub async fn force_flush(&self) -> Result<usize> {
        self.request(|reply| Command::ForceFlush { reply }).await
    }

    pub async fn migrate(&self) -> Result<MigrationReport> {
        self.request(|reply| Command::Migrate { reply }).await
    }

    pub async fn rollback(&self) -> Result<usize> {
        self.request(|reply| Command::Rollback { reply }).await
    }

    pub async fn cleanup_legacy(&self) -> Result<bool> {
        self.request(|reply| Command::CleanupLegacy { reply }).await
    }

    pub async fn migration_state(&self) -> Result<MigrationState> {
        self.request(|reply| Command::MigrationState { reply }).await
    }

    pub async fn create_backup(&self) -> Result<PathBuf> {
        self.request(|reply| Command::CreateBackup { reply }).await
    }

    pub async fn restore(&self, path: &Path) -> Result<RestoreReport> {
        let path = path.to_path_buf();
        self.request(|reply| Command::Restore { path, reply }).await
    }

    pub async fn verify_all_backups(&self) -> Result<Vec<(PathBuf, BackupStatus)>> {
        self.request(|reply| Command::VerifyBackups { reply }).await
    }

    pub async fn compact(&self) -> Result<()> {
        self.request(|reply| Command::Compact { reply }).await
    }

    pub async fn repair_cached_stats(&self) -> Result<usize> {
        self.request(|reply| Command::RepairStats { reply }).await
    }

    pub async fn export_csv(&self, path: &Path) -> Result<usize> {
        let path = path.to_path_buf();
        self.request(|reply| Command::ExportCsv { path, reply }).await
    }

    pub async fn stats(&self) -> Result<DbStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Flush and stop the engine task. Returns the number of records written
    /// by the final flush.
    pub async fn shutdown(&self) -> Result<usize> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn storage(dir: &Path) -> StorageConfig {
        StorageConfig {
            db_path: dir.join("skywatch.db").to_string_lossy().into_owned(),
            legacy_path: dir.join("encounters.json").to_string_lossy().into_owned(),
            backup_dir: dir.join("backups").to_string_lossy().into_owned(),
        }
    }

    fn config(flush_interval_sec: f64) -> EngineConfig {
        EngineConfig {
            flush_interval_sec,
            projection_rebuild_every: 2,
            queue_capacity: 16,
        }
    }

    fn msg(uid: &str, lat: f64, lon: f64) -> DetectionMessage {
        DetectionMessage {
            uid: uid.into(),
            lat,
            lon,
            alt: 50.0,
            rssi: Some(-60.0),
            ..Default::default()
        }
    }

    fn engine(dir: &Path) -> Engine {
        Engine::new(Database::open_memory().unwrap(), storage(dir), &config(3.0))
    }

    #[test]
    fn test_flush_counter_rebuilds_projection() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.ingest(&msg("D1", 35.0, -82.0), None);
        assert_eq!(engine.tick(), 1);
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.flush_count(), 1);

        // Remove behind the projection's back; the next rebuild drops it
        engine.repo.db_mut().delete_encounter("D1").unwrap();
        engine.repo.reset();
        assert!(engine.projection().get().contains_key("D1"));
        engine.ingest(&msg("D2", 35.0, -82.0), None);
        engine.tick();
        assert_eq!(engine.flush_count(), 2);
        let snap = engine.projection().get();
        assert!(!snap.contains_key("D1"));
        assert!(snap.contains_key("D2"));
    }

    #[test]
    fn test_user_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let mut events = engine.subscribe();
        engine.ingest(&msg("D1", 35.0, -82.0), None);
        engine.force_flush().unwrap();

        engine.rename("D1", "  hilltop  ").unwrap();
        engine.set_trust_status("D1", TrustStatus::Trusted).unwrap();
        engine.set_do_not_track("D1", true).unwrap();
        assert!(matches!(engine.rename("nope", "x"), Err(StoreError::NotFound(_))));

        let enc = engine.get_encounter("D1").unwrap().unwrap();
        assert_eq!(enc.custom_name, "hilltop");
        assert_eq!(enc.trust_status, TrustStatus::Trusted);
        assert!(enc.do_not_track());
        assert_eq!(engine.projection().get()["D1"].display_name(), "hilltop");

        let mut updates = 0;
        while let Ok(EngineEvent::EncounterUpdated(id)) = events.try_recv() {
            assert_eq!(id, "D1");
            updates += 1;
        }
        assert_eq!(updates, 4);
    }

    #[test]
    fn test_delete_clears_every_view() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let mut m = msg("D1", 35.0, -82.0);
        m.mac = Some("AA:BB".into());
        engine.ingest(&m, None);
        engine.force_flush().unwrap();
        let mut events = engine.subscribe();

        assert!(engine.delete_encounter("D1").unwrap());
        assert_eq!(events.try_recv().unwrap(), EngineEvent::EncounterDeleted("D1".into()));
        assert!(engine.get_encounter("D1").unwrap().is_none());
        assert!(engine.projection().get().is_empty());
        assert!(engine.pipeline.resolver().cached_mac("AA:BB").is_none());

        // A new emitter can now take the MAC
        let mut m = msg("D9", 35.0, -82.0);
        m.mac = Some("AA:BB".into());
        engine.ingest(&m, None);
        assert_eq!(engine.get_encounter("D9").unwrap().unwrap().mac_addresses, vec!["AA:BB"]);
    }

    #[test]
    fn test_delete_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.ingest(&msg("D1", 35.0, -82.0), None);
        engine.force_flush().unwrap();
        engine.ingest(&msg("D2", 35.0, -82.0), None);
        let mut events = engine.subscribe();

        assert_eq!(engine.delete_all_encounters().unwrap(), 1);
        let mut deleted = vec![];
        while let Ok(EngineEvent::EncounterDeleted(id)) = events.try_recv() {
            deleted.push(id);
        }
        deleted.sort();
        assert_eq!(deleted, vec!["D1", "D2"]);
        assert_eq!(engine.force_flush().unwrap(), 0);
        assert_eq!(engine.stats(), DbStats::default());
    }

    #[test]
    fn test_backup_before_migration_exports_legacy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("encounters.json"),
            r#"{"L1": {"id": "L1", "firstSeen": 10, "lastSeen": 20}}"#,
        )
        .unwrap();
        let mut engine = engine(dir.path());

        let path = engine.create_backup().unwrap();
        let backup = backup::read_backup(&path).unwrap();
        assert_eq!(backup.encounters.len(), 1);
        assert_eq!(backup.encounters[0].id, "L1");

        let mut events = engine.subscribe();
        assert_eq!(engine.migrate().unwrap().imported, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::MigrationStatusChanged(MigrationState::Migrating)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::MigrationStatusChanged(MigrationState::Completed)
        );
        assert!(engine.projection().get().contains_key("L1"));
        assert!(engine.migrate().unwrap().already_done);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_restore_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.migrate().unwrap();
        engine.ingest(&msg("D1", 35.0, -82.0), None);
        let path = engine.create_backup().unwrap();

        engine.delete_all_encounters().unwrap();
        assert_eq!(engine.restore(&path).unwrap().restored, 1);
        assert_eq!(engine.restore(&path).unwrap().skipped, 1);
        assert!(engine.projection().get().contains_key("D1"));

        let csv = dir.path().join("out/encounters.csv");
        assert_eq!(engine.export_csv(&csv).unwrap(), 1);
        let text = std::fs::read_to_string(&csv).unwrap();
        assert_eq!(text.lines().count(), 2);

        let verified = engine.verify_all_backups().unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].1, BackupStatus::Valid(1));
        engine.compact().unwrap();
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(3.0);
        let engine = Engine::new(Database::open_memory().unwrap(), storage(dir.path()), &cfg);
        let (handle, task) = spawn(engine, &cfg);
        let mut events = handle.subscribe();

        // Short-range ping without an observer fix stays silent
        let mut ping = msg("FPV", 0.0, 0.0);
        ping.is_short_range_detection = true;
        handle.ingest(ping, None).await.unwrap();
        handle.ingest(msg("D1", 35.0, -82.0), None).await.unwrap();

        assert_eq!(handle.force_flush().await.unwrap(), 2);
        assert_eq!(events.recv().await.unwrap(), EngineEvent::EncounterUpdated("D1".into()));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        handle.rename("D1", "tower").await.unwrap();
        assert_eq!(handle.snapshot()["D1"].custom_name, "tower");
        assert_eq!(handle.stats().await.unwrap().encounters, 2);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.stats().await, Err(StoreError::EngineStopped)));
    }

    #[tokio::test]
    async fn test_ticker_flushes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(0.05);
        let engine = Engine::open(storage(dir.path()), &cfg).unwrap();
        let (handle, task) = spawn(engine, &cfg);

        handle.ingest(msg("D1", 35.0, -82.0), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Read the file directly: the tick must have written it
        let db = Database::open(&storage(dir.path()).db_path).unwrap();
        assert!(db.encounter_exists("D1").unwrap());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(3600.0);
        let engine = Engine::open(storage(dir.path()), &cfg).unwrap();
        let (handle, task) = spawn(engine, &cfg);

        handle.ingest(msg("D1", 35.0, -82.0), None).await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let db = Database::open(&storage(dir.path()).db_path).unwrap();
        assert_eq!(db.load_encounter("D1").unwrap().unwrap().flight_points.len(), 1);
    }

    const BLOCK_INSERTS: &str = "CREATE TRIGGER block BEFORE INSERT ON encounters
                                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;";

    #[test]
    fn test_shutdown_returns_failed_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        engine.repo.db().conn_for_tests().execute_batch(BLOCK_INSERTS).unwrap();
        engine.ingest(&msg("D1", 35.0, -82.0), None);

        assert!(matches!(engine.shutdown(), Err(StoreError::Sqlite(_))));
        assert!(engine.repo.is_dirty("D1"));
    }

    #[tokio::test]
    async fn test_handle_shutdown_reports_unsaved_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(3600.0);
        let engine = Engine::new(Database::open_memory().unwrap(), storage(dir.path()), &cfg);
        engine.repo.db().conn_for_tests().execute_batch(BLOCK_INSERTS).unwrap();
        let (handle, task) = spawn(engine, &cfg);

        handle.ingest(msg("D1", 35.0, -82.0), None).await.unwrap();
        assert!(matches!(handle.shutdown().await, Err(StoreError::Sqlite(_))));
        task.await.unwrap();
    }
}
