//! SQLite persistence: WAL mode, 5 tables, indexed identity lookups.
//!
//! Schema: encounters, flight_points, signatures, encounter_macs, schema_meta.
//! Child rows carry a `seq` column holding their index in the owning
//! encounter's vector. Deletes fan out explicitly to every child table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use log::warn;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::Serialize;

use skywatch_core::types::{Encounter, FlightPoint, Signature, TrustStatus, META_CAA_REGISTRATION};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS encounters (
    id TEXT PRIMARY KEY,
    first_seen REAL NOT NULL,
    last_seen REAL NOT NULL,
    custom_name TEXT NOT NULL DEFAULT '',
    trust_status TEXT NOT NULL DEFAULT 'unknown',
    registration TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    max_altitude REAL NOT NULL DEFAULT 0,
    max_speed REAL NOT NULL DEFAULT 0,
    average_rssi REAL NOT NULL DEFAULT 0,
    flight_point_count INTEGER NOT NULL DEFAULT 0,
    signature_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS flight_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    encounter_id TEXT NOT NULL REFERENCES encounters(id),
    seq INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude REAL NOT NULL,
    timestamp REAL NOT NULL,
    home_latitude REAL,
    home_longitude REAL,
    is_proximity INTEGER NOT NULL DEFAULT 0,
    proximity_rssi REAL,
    proximity_radius REAL
);

CREATE TABLE IF NOT EXISTS signatures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    encounter_id TEXT NOT NULL REFERENCES encounters(id),
    seq INTEGER NOT NULL,
    timestamp REAL NOT NULL,
    rssi REAL NOT NULL,
    speed REAL NOT NULL DEFAULT 0,
    height REAL NOT NULL DEFAULT 0,
    mac TEXT
);

CREATE TABLE IF NOT EXISTS encounter_macs (
    encounter_id TEXT NOT NULL REFERENCES encounters(id),
    mac TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (encounter_id, mac)
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flight_points_encounter ON flight_points(encounter_id, seq);
CREATE INDEX IF NOT EXISTS idx_signatures_encounter ON signatures(encounter_id, seq);
CREATE INDEX IF NOT EXISTS idx_encounter_macs_mac ON encounter_macs(mac COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_encounters_registration ON encounters(registration COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_encounters_last_seen ON encounters(last_seen);
"#;

const ENCOUNTER_COLUMNS: &str = "id, first_seen, last_seen, custom_name, trust_status, metadata, \
     max_altitude, max_speed, average_rssi, flight_point_count, signature_count";

const CHILD_TABLES: [&str; 3] = ["flight_points", "signatures", "encounter_macs"];

/// SQLite database holding durable encounters.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Database { conn })
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        Self::open(":memory:")
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Write a batch of encounters in one transaction.
    ///
    /// Child rows missing from memory are deleted, new children are inserted
    /// and get their `row_id` once the transaction has committed. On error
    /// nothing is written and the in-memory records are left untouched.
    pub fn save_encounters(&mut self, batch: &mut [&mut Encounter]) -> SqlResult<usize> {
        let tx = self.conn.transaction()?;
        let mut assigned = Vec::with_capacity(batch.len());
        for enc in batch.iter() {
            assigned.push(write_encounter(&tx, enc)?);
        }
        tx.commit()?;

        for (enc, rows) in batch.iter_mut().zip(assigned) {
            rows.apply(enc);
        }
        Ok(batch.len())
    }

    pub fn save_encounter(&mut self, enc: &mut Encounter) -> SqlResult<()> {
        self.save_encounters(&mut [enc]).map(|_| ())
    }

    /// Delete one encounter and all its children. Returns false if absent.
    pub fn delete_encounter(&mut self, id: &str) -> SqlResult<bool> {
        let tx = self.conn.transaction()?;
        for table in CHILD_TABLES {
            tx.execute(
                &format!("DELETE FROM {table} WHERE encounter_id = ?1"),
                params![id],
            )?;
        }
        let n = tx.execute("DELETE FROM encounters WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    /// Delete every encounter. Returns the number removed.
    pub fn delete_all_encounters(&mut self) -> SqlResult<usize> {
        let tx = self.conn.transaction()?;
        for table in CHILD_TABLES {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
        }
        let n = tx.execute("DELETE FROM encounters", [])?;
        tx.commit()?;
        Ok(n)
    }

    /// VACUUM to reclaim disk space.
    pub fn vacuum(&mut self) -> SqlResult<()> {
        self.conn.execute_batch("VACUUM;")
    }

    // -----------------------------------------------------------------------
    // Encounter reads
    // -----------------------------------------------------------------------

    /// Load one encounter with all children.
    pub fn load_encounter(&self, id: &str) -> SqlResult<Option<Encounter>> {
        let sql = format!("SELECT {ENCOUNTER_COLUMNS} FROM encounters WHERE id = ?1");
        let Some(mut enc) = self
            .conn
            .query_row(&sql, params![id], encounter_from_row)
            .optional()?
        else {
            return Ok(None);
        };

        enc.mac_addresses = self.macs_for(id)?;
        enc.flight_points = self.flight_points(id, None)?;
        enc.signatures = self.signatures(id, None)?;
        Ok(Some(enc))
    }

    /// Every encounter with all children, oldest first.
    pub fn load_all_encounters(&self) -> SqlResult<Vec<Encounter>> {
        let mut out = Vec::new();
        for id in self.encounter_ids()? {
            if let Some(enc) = self.load_encounter(&id)? {
                out.push(enc);
            }
        }
        Ok(out)
    }

    /// Scalar fields, metadata and MACs of every encounter, without children.
    /// Most recently seen first.
    pub fn list_encounters(&self) -> SqlResult<Vec<Encounter>> {
        let sql = format!("SELECT {ENCOUNTER_COLUMNS} FROM encounters ORDER BY last_seen DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut encounters: Vec<Encounter> = stmt
            .query_map([], encounter_from_row)?
            .collect::<SqlResult<_>>()?;

        let mut macs: HashMap<String, Vec<String>> = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT encounter_id, mac FROM encounter_macs ORDER BY encounter_id, ordinal")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        for row in rows {
            let (id, mac) = row?;
            macs.entry(id).or_default().push(mac);
        }

        for enc in &mut encounters {
            enc.mac_addresses = macs.remove(&enc.id).unwrap_or_default();
        }
        Ok(encounters)
    }

    pub fn encounter_ids(&self) -> SqlResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM encounters ORDER BY first_seen, id")?;
        let ids = stmt.query_map([], |r| r.get(0))?.collect();
        ids
    }

    pub fn encounter_exists(&self, id: &str) -> SqlResult<bool> {
        self.conn
            .query_row("SELECT 1 FROM encounters WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .map(|r| r.is_some())
    }

    /// Id of an encounter carrying this registration code.
    pub fn find_by_registration(&self, code: &str) -> SqlResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT id FROM encounters WHERE registration = ?1 COLLATE NOCASE
                 ORDER BY last_seen DESC LIMIT 1",
                params![code.trim()],
                |r| r.get(0),
            )
            .optional()
    }

    /// Ids of every encounter whose MAC set contains `mac`.
    pub fn mac_owners(&self, mac: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT encounter_id FROM encounter_macs WHERE mac = ?1 COLLATE NOCASE",
        )?;
        let owners = stmt.query_map(params![mac.trim()], |r| r.get(0))?.collect();
        owners
    }

    fn macs_for(&self, id: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT mac FROM encounter_macs WHERE encounter_id = ?1 ORDER BY ordinal")?;
        let macs = stmt.query_map(params![id], |r| r.get(0))?.collect();
        macs
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// Flight points in path order. With `limit`, only the most recent ones.
    pub fn flight_points(&self, id: &str, limit: Option<usize>) -> SqlResult<Vec<FlightPoint>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, latitude, longitude, altitude, timestamp, home_latitude, home_longitude,
                    is_proximity, proximity_rssi, proximity_radius
             FROM flight_points WHERE encounter_id = ?1
             ORDER BY seq DESC, id DESC LIMIT ?2",
        )?;
        let mut points = stmt
            .query_map(params![id, sql_limit(limit)], |r| {
                Ok(FlightPoint {
                    row_id: Some(r.get(0)?),
                    latitude: r.get(1)?,
                    longitude: r.get(2)?,
                    altitude: r.get(3)?,
                    timestamp: r.get(4)?,
                    home_latitude: r.get(5)?,
                    home_longitude: r.get(6)?,
                    is_proximity_point: r.get::<_, i32>(7)? != 0,
                    proximity_rssi: r.get(8)?,
                    proximity_radius: r.get(9)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        points.reverse();
        Ok(points)
    }

    /// Signatures in arrival order. With `limit`, only the most recent ones.
    pub fn signatures(&self, id: &str, limit: Option<usize>) -> SqlResult<Vec<Signature>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, timestamp, rssi, speed, height, mac
             FROM signatures WHERE encounter_id = ?1
             ORDER BY seq DESC, id DESC LIMIT ?2",
        )?;
        let mut sigs = stmt
            .query_map(params![id, sql_limit(limit)], |r| {
                Ok(Signature {
                    row_id: Some(r.get(0)?),
                    timestamp: r.get(1)?,
                    rssi: r.get(2)?,
                    speed: r.get(3)?,
                    height: r.get(4)?,
                    mac: r.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        sigs.reverse();
        Ok(sigs)
    }

    // -----------------------------------------------------------------------
    // Schema metadata
    // -----------------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> SqlResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn count_encounters(&self) -> i64 {
        self.count("SELECT COUNT(*) FROM encounters")
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            encounters: self.count_encounters(),
            flight_points: self.count("SELECT COUNT(*) FROM flight_points WHERE is_proximity = 0"),
            proximity_points: self.count("SELECT COUNT(*) FROM flight_points WHERE is_proximity = 1"),
            signatures: self.count("SELECT COUNT(*) FROM signatures"),
            macs: self.count("SELECT COUNT(*) FROM encounter_macs"),
        }
    }

    fn count(&self, sql: &str) -> i64 {
        self.conn.query_row(sql, [], |r| r.get(0)).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DbStats {
    pub encounters: i64,
    pub flight_points: i64,
    pub proximity_points: i64,
    pub signatures: i64,
    pub macs: i64,
}

/// Row ids handed out by one encounter write, keyed by vector index.
#[derive(Default)]
struct RowAssignments {
    points: Vec<(usize, i64)>,
    signatures: Vec<(usize, i64)>,
}

impl RowAssignments {
    fn apply(self, enc: &mut Encounter) {
        for (i, id) in self.points {
            if let Some(p) = enc.flight_points.get_mut(i) {
                p.row_id = Some(id);
            }
        }
        for (i, id) in self.signatures {
            if let Some(s) = enc.signatures.get_mut(i) {
                s.row_id = Some(id);
            }
        }
    }
}

fn sql_limit(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as unbounded
    limit.map(|n| n as i64).unwrap_or(-1)
}

fn encounter_from_row(r: &Row<'_>) -> SqlResult<Encounter> {
    let id: String = r.get(0)?;
    let metadata_json: String = r.get(5)?;
    let metadata = serde_json::from_str::<BTreeMap<String, String>>(&metadata_json).unwrap_or_else(|e| {
        warn!("encounter {id}: unreadable metadata ({e}), using empty map");
        BTreeMap::new()
    });
    let mut enc = Encounter::new(&id, r.get(1)?);
    enc.last_seen = r.get(2)?;
    enc.custom_name = r.get(3)?;
    enc.trust_status = TrustStatus::from_label(&r.get::<_, String>(4)?);
    enc.metadata = metadata;
    enc.max_altitude = r.get(6)?;
    enc.max_speed = r.get(7)?;
    enc.average_rssi = r.get(8)?;
    enc.flight_point_count = r.get(9)?;
    enc.signature_count = r.get(10)?;
    Ok(enc)
}

fn child_row_ids(conn: &Connection, table: &str, id: &str) -> SqlResult<HashSet<i64>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT id FROM {table} WHERE encounter_id = ?1"))?;
    let ids = stmt.query_map(params![id], |r| r.get(0))?.collect();
    ids
}

fn delete_rows<'a>(conn: &Connection, table: &str, ids: impl Iterator<Item = &'a i64>) -> SqlResult<()> {
    let mut stmt = conn.prepare_cached(&format!("DELETE FROM {table} WHERE id = ?1"))?;
    for id in ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

/// Upsert one encounter and diff its children against the stored rows.
fn write_encounter(conn: &Connection, enc: &Encounter) -> SqlResult<RowAssignments> {
    let metadata = serde_json::to_string(&enc.metadata).unwrap_or_else(|_| "{}".to_string());
    conn.execute(
        "INSERT INTO encounters (id, first_seen, last_seen, custom_name, trust_status, registration,
                                 metadata, max_altitude, max_speed, average_rssi,
                                 flight_point_count, signature_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
             first_seen = excluded.first_seen,
             last_seen = excluded.last_seen,
             custom_name = excluded.custom_name,
             trust_status = excluded.trust_status,
             registration = excluded.registration,
             metadata = excluded.metadata,
             max_altitude = excluded.max_altitude,
             max_speed = excluded.max_speed,
             average_rssi = excluded.average_rssi,
             flight_point_count = excluded.flight_point_count,
             signature_count = excluded.signature_count",
        params![
            enc.id,
            enc.first_seen,
            enc.last_seen,
            enc.custom_name,
            enc.trust_status.as_str(),
            enc.meta(META_CAA_REGISTRATION),
            metadata,
            enc.max_altitude,
            enc.max_speed,
            enc.average_rssi,
            enc.flight_point_count,
            enc.signature_count,
        ],
    )?;

    let mut assigned = RowAssignments::default();

    // Flight points
    let stored = child_row_ids(conn, "flight_points", &enc.id)?;
    let kept: HashSet<i64> = enc.flight_points.iter().filter_map(|p| p.row_id).collect();
    delete_rows(conn, "flight_points", stored.difference(&kept))?;

    let mut insert = conn.prepare_cached(
        "INSERT INTO flight_points (encounter_id, seq, latitude, longitude, altitude, timestamp,
                                    home_latitude, home_longitude, is_proximity,
                                    proximity_rssi, proximity_radius)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    let mut reseq = conn.prepare_cached("UPDATE flight_points SET seq = ?1 WHERE id = ?2 AND seq != ?1")?;
    for (i, p) in enc.flight_points.iter().enumerate() {
        match p.row_id.filter(|id| stored.contains(id)) {
            Some(row_id) => {
                reseq.execute(params![i as i64, row_id])?;
            }
            None if !p.is_persistable() => {
                warn!("encounter {}: refusing to store (0,0) flight point", enc.id);
            }
            None => {
                insert.execute(params![
                    enc.id,
                    i as i64,
                    p.latitude,
                    p.longitude,
                    p.altitude,
                    p.timestamp,
                    p.home_latitude,
                    p.home_longitude,
                    p.is_proximity_point as i32,
                    p.proximity_rssi,
                    p.proximity_radius,
                ])?;
                assigned.points.push((i, conn.last_insert_rowid()));
            }
        }
    }

    // Signatures
    let stored = child_row_ids(conn, "signatures", &enc.id)?;
    let kept: HashSet<i64> = enc.signatures.iter().filter_map(|s| s.row_id).collect();
    delete_rows(conn, "signatures", stored.difference(&kept))?;

    let mut insert = conn.prepare_cached(
        "INSERT INTO signatures (encounter_id, seq, timestamp, rssi, speed, height, mac)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    let mut reseq = conn.prepare_cached("UPDATE signatures SET seq = ?1 WHERE id = ?2 AND seq != ?1")?;
    for (i, s) in enc.signatures.iter().enumerate() {
        match s.row_id.filter(|id| stored.contains(id)) {
            Some(row_id) => {
                reseq.execute(params![i as i64, row_id])?;
            }
            None => {
                insert.execute(params![enc.id, i as i64, s.timestamp, s.rssi, s.speed, s.height, s.mac])?;
                assigned.signatures.push((i, conn.last_insert_rowid()));
            }
        }
    }

    // MAC set (small, rewritten whole)
    conn.execute("DELETE FROM encounter_macs WHERE encounter_id = ?1", params![enc.id])?;
    let mut insert = conn.prepare_cached(
        "INSERT OR IGNORE INTO encounter_macs (encounter_id, mac, ordinal) VALUES (?1, ?2, ?3)",
    )?;
    for (i, mac) in enc.mac_addresses.iter().enumerate() {
        insert.execute(params![enc.id, mac, i as i64])?;
    }

    Ok(assigned)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_core::aggregate::recompute;
    use skywatch_core::proximity::{estimate_radius_m, insert_proximity};

    fn test_db() -> Database {
        Database::open_memory().unwrap()
    }

    fn sample(id: &str) -> Encounter {
        let mut enc = Encounter::new(id, 100.0);
        enc.last_seen = 160.0;
        enc.custom_name = "north field".into();
        enc.trust_status = TrustStatus::Untrusted;
        enc.set_meta(META_CAA_REGISTRATION, "FA123");
        enc.add_mac("AA:BB:CC:00:11:22");
        enc.add_mac("AA:BB:CC:00:11:23");
        for i in 0..5 {
            let p = FlightPoint::gps(35.0 + i as f64 * 0.001, -82.0, 50.0 + i as f64, 100.0 + i as f64 * 10.0, None)
                .unwrap();
            enc.flight_points.push(p);
            enc.signatures
                .push(Signature::new(100.0 + i as f64 * 10.0, -60.0 - i as f64, 4.0, 30.0, None).unwrap());
        }
        recompute(&mut enc);
        enc
    }

    fn strip_row_ids(mut enc: Encounter) -> Encounter {
        enc.flight_points.iter_mut().for_each(|p| p.row_id = None);
        enc.signatures.iter_mut().for_each(|s| s.row_id = None);
        enc
    }

    #[test]
    fn test_open_memory() {
        let db = test_db();
        assert_eq!(db.count_encounters(), 0);
        assert_eq!(db.stats(), DbStats::default());
    }

    #[test]
    fn test_save_and_load() {
        let mut db = test_db();
        let mut enc = sample("D1");
        db.save_encounter(&mut enc).unwrap();

        assert!(enc.flight_points.iter().all(|p| p.row_id.is_some()));
        assert!(enc.signatures.iter().all(|s| s.row_id.is_some()));

        let loaded = db.load_encounter("D1").unwrap().unwrap();
        assert_eq!(loaded, enc);
        assert_eq!(loaded.trust_status, TrustStatus::Untrusted);
        assert_eq!(loaded.mac_addresses, vec!["AA:BB:CC:00:11:22", "AA:BB:CC:00:11:23"]);
    }

    #[test]
    fn test_missing_encounter() {
        let db = test_db();
        assert!(db.load_encounter("nope").unwrap().is_none());
        assert!(!db.encounter_exists("nope").unwrap());
    }

    #[test]
    fn test_pruned_children_are_deleted() {
        let mut db = test_db();
        let mut enc = sample("D1");
        db.save_encounter(&mut enc).unwrap();

        enc.signatures.drain(..3);
        enc.signatures
            .push(Signature::new(200.0, -40.0, 1.0, 10.0, None).unwrap());
        recompute(&mut enc);
        db.save_encounter(&mut enc).unwrap();

        let loaded = db.load_encounter("D1").unwrap().unwrap();
        assert_eq!(loaded.signatures.len(), 3);
        assert_eq!(loaded.signatures[2].rssi, -40.0);
        assert_eq!(loaded.signatures[0].rssi, -63.0);
        assert_eq!(db.stats().signatures, 3);
    }

    #[test]
    fn test_proximity_replacement_keeps_slot() {
        let mut db = test_db();
        let mut enc = Encounter::new("P1", 1.0);
        for (i, r) in [-80.0, -60.0, -70.0].iter().enumerate() {
            let p = FlightPoint::proximity(35.0, -82.0, *r, estimate_radius_m(*r), i as f64);
            insert_proximity(&mut enc.flight_points, p);
        }
        db.save_encounter(&mut enc).unwrap();

        let p = FlightPoint::proximity(35.0, -82.0, -90.0, estimate_radius_m(-90.0), 9.0);
        insert_proximity(&mut enc.flight_points, p);
        db.save_encounter(&mut enc).unwrap();

        let loaded = db.load_encounter("P1").unwrap().unwrap();
        let rssis: Vec<f64> = loaded
            .flight_points
            .iter()
            .map(|p| p.proximity_rssi.unwrap())
            .collect();
        assert_eq!(rssis, vec![-80.0, -60.0, -90.0]);
        assert_eq!(db.stats().proximity_points, 3);
    }

    #[test]
    fn test_null_island_point_refused() {
        let mut db = test_db();
        let mut enc = sample("D1");
        let mut bad = FlightPoint::gps(1.0, 1.0, 10.0, 500.0, None).unwrap();
        bad.latitude = 0.0;
        bad.longitude = 0.0;
        enc.flight_points.push(bad);
        db.save_encounter(&mut enc).unwrap();

        let loaded = db.load_encounter("D1").unwrap().unwrap();
        assert_eq!(loaded.flight_points.len(), 5);
        assert!(loaded
            .flight_points
            .iter()
            .all(|p| p.latitude != 0.0 || p.longitude != 0.0));
    }

    #[test]
    fn test_failed_batch_assigns_no_row_ids() {
        let mut db = test_db();
        let mut good = sample("D1");
        let mut other = sample("D2");
        db.conn
            .execute_batch("CREATE TRIGGER no_d2 BEFORE INSERT ON encounters WHEN NEW.id = 'D2'
                            BEGIN SELECT RAISE(ABORT, 'blocked'); END;")
            .unwrap();
        assert!(db.save_encounters(&mut [&mut good, &mut other]).is_err());
        assert!(good.flight_points.iter().all(|p| p.row_id.is_none()));
        assert_eq!(db.count_encounters(), 0);
    }

    #[test]
    fn test_identity_queries() {
        let mut db = test_db();
        db.save_encounter(&mut sample("D1")).unwrap();

        assert_eq!(db.find_by_registration("fa123").unwrap().as_deref(), Some("D1"));
        assert!(db.find_by_registration("FA999").unwrap().is_none());
        assert_eq!(db.mac_owners("aa:bb:cc:00:11:22").unwrap(), vec!["D1".to_string()]);
        assert!(db.mac_owners("11:11:11:11:11:11").unwrap().is_empty());
    }

    #[test]
    fn test_delete_fans_out() {
        let mut db = test_db();
        db.save_encounter(&mut sample("D1")).unwrap();
        db.save_encounter(&mut sample("D2")).unwrap();

        assert!(db.delete_encounter("D1").unwrap());
        assert!(!db.delete_encounter("D1").unwrap());

        let stats = db.stats();
        assert_eq!(stats.encounters, 1);
        assert_eq!(stats.flight_points, 5);
        assert_eq!(stats.signatures, 5);
        assert_eq!(stats.macs, 2);

        assert_eq!(db.delete_all_encounters().unwrap(), 1);
        assert_eq!(db.stats(), DbStats::default());
    }

    #[test]
    fn test_recent_children_limit() {
        let mut db = test_db();
        db.save_encounter(&mut sample("D1")).unwrap();

        let points = db.flight_points("D1", Some(2)).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, 130.0);
        assert_eq!(points[1].timestamp, 140.0);
        assert_eq!(db.signatures("D1", None).unwrap().len(), 5);
    }

    #[test]
    fn test_list_encounters_without_children() {
        let mut db = test_db();
        db.save_encounter(&mut sample("D1")).unwrap();
        let mut newer = sample("D2");
        newer.last_seen = 999.0;
        db.save_encounter(&mut newer).unwrap();

        let list = db.list_encounters().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "D2");
        assert!(list[0].flight_points.is_empty());
        assert_eq!(list[0].flight_point_count, 5);
        assert_eq!(list[1].mac_addresses.len(), 2);
    }

    #[test]
    fn test_load_all_roundtrips_content() {
        let mut db = test_db();
        db.save_encounter(&mut sample("D1")).unwrap();
        let all = db.load_all_encounters().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(strip_row_ids(all[0].clone()), strip_row_ids(sample("D1")));
    }

    #[test]
    fn test_schema_meta() {
        let mut db = test_db();
        assert!(db.get_meta("migration_state").unwrap().is_none());
        db.set_meta("migration_state", "migrating").unwrap();
        db.set_meta("migration_state", "completed").unwrap();
        assert_eq!(db.get_meta("migration_state").unwrap().as_deref(), Some("completed"));
    }

    #[test]
    fn test_vacuum() {
        let mut db = test_db();
        db.save_encounter(&mut sample("D1")).unwrap();
        db.delete_all_encounters().unwrap();
        db.vacuum().unwrap();
        assert_eq!(db.count_encounters(), 0);
    }
}
