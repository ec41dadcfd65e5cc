//! In-memory arena of loaded encounters in front of the database.
//!
//! The pipeline mutates records in the arena and marks them dirty; `flush`
//! writes every dirty record in one transaction. Clean records that have gone
//! idle are evicted after a flush and reloaded on demand.

use std::collections::{HashMap, HashSet};

use log::{debug, error, info};
use rusqlite::Result as SqlResult;

use skywatch_core::aggregate;
use skywatch_core::identity::IdentityLookup;
use skywatch_core::types::{Encounter, META_CAA_REGISTRATION};

use crate::db::Database;

/// Clean records not seen for this long leave the arena after a flush.
pub const ARENA_IDLE_SEC: f64 = 600.0;

pub struct Repository {
    db: Database,
    arena: HashMap<String, Encounter>,
    dirty: HashSet<String>,
}

impl Repository {
    pub fn new(db: Database) -> Self {
        Repository {
            db,
            arena: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Direct database access. Callers must `flush` first and `reset` after
    /// writing behind the arena's back.
    pub fn db_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    /// Record by id, loading it into the arena if needed.
    pub fn get_mut(&mut self, id: &str) -> SqlResult<Option<&mut Encounter>> {
        if !self.arena.contains_key(id) {
            if let Some(enc) = self.db.load_encounter(id)? {
                self.arena.insert(id.to_string(), enc);
            }
        }
        Ok(self.arena.get_mut(id))
    }

    /// Current copy of a record: arena first, then storage.
    pub fn get(&self, id: &str) -> SqlResult<Option<Encounter>> {
        match self.arena.get(id) {
            Some(enc) => Ok(Some(enc.clone())),
            None => self.db.load_encounter(id),
        }
    }

    /// Add a freshly created record. It is written on the next flush.
    #[cfg(test)]
    pub(crate) fn insert(&mut self, enc: Encounter) -> &mut Encounter {
        let id = enc.id.clone();
        self.dirty.insert(id.clone());
        self.arena.entry(id).or_insert(enc)
    }

    /// Record by id, creating it with `create` if it exists nowhere.
    /// The flag is true when the record was created.
    pub fn fetch_or_create(
        &mut self,
        id: &str,
        create: impl FnOnce() -> Encounter,
    ) -> SqlResult<(&mut Encounter, bool)> {
        if !self.arena.contains_key(id) {
            if let Some(enc) = self.db.load_encounter(id)? {
                self.arena.insert(id.to_string(), enc);
            }
        }
        let mut created = false;
        let enc = self.arena.entry(id.to_string()).or_insert_with(|| {
            created = true;
            create()
        });
        if created {
            self.dirty.insert(id.to_string());
        }
        Ok((enc, created))
    }

    pub fn mark_dirty(&mut self, id: &str) {
        if self.arena.contains_key(id) {
            self.dirty.insert(id.to_string());
        }
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.dirty.contains(id)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn loaded_count(&self) -> usize {
        self.arena.len()
    }

    /// Write every dirty record in one transaction.
    ///
    /// On failure the dirty set is kept so the next flush retries it.
    pub fn flush(&mut self, now: f64) -> SqlResult<usize> {
        if self.dirty.is_empty() {
            return Ok(0);
        }

        let dirty = &self.dirty;
        let mut batch: Vec<&mut Encounter> = self
            .arena
            .iter_mut()
            .filter(|(id, _)| dirty.contains(*id))
            .map(|(_, enc)| enc)
            .collect();

        let written = match self.db.save_encounters(&mut batch) {
            Ok(n) => n,
            Err(e) => {
                error!("flush of {} encounters failed: {e}", batch.len());
                return Err(e);
            }
        };

        self.dirty.clear();
        let before = self.arena.len();
        self.arena
            .retain(|_, enc| now - enc.last_seen < ARENA_IDLE_SEC);
        let evicted = before - self.arena.len();
        if evicted > 0 {
            debug!("evicted {evicted} idle encounters from memory");
        }
        Ok(written)
    }

    /// Delete one record everywhere. Returns false if it did not exist.
    pub fn remove(&mut self, id: &str) -> SqlResult<bool> {
        let in_memory = self.arena.remove(id).is_some();
        self.dirty.remove(id);
        let stored = self.db.delete_encounter(id)?;
        Ok(in_memory || stored)
    }

    /// Delete every record. Returns how many durable records were removed.
    pub fn remove_all(&mut self) -> SqlResult<usize> {
        self.reset();
        self.db.delete_all_encounters()
    }

    /// Drop the arena and dirty set (after bulk storage changes).
    pub fn reset(&mut self) {
        self.arena.clear();
        self.dirty.clear();
    }

    /// Recompute cached fields of every durable record, fixing any that
    /// disagree with their children. Returns the number repaired.
    pub fn repair_cached_stats(&mut self, now: f64) -> SqlResult<usize> {
        self.flush(now)?;
        self.reset();

        let mut repaired = 0;
        for id in self.db.encounter_ids()? {
            let Some(mut enc) = self.db.load_encounter(&id)? else {
                continue;
            };
            if aggregate::is_stale(&enc) {
                aggregate::recompute(&mut enc);
                self.db.save_encounter(&mut enc)?;
                repaired += 1;
            }
        }
        info!("repaired cached stats on {repaired} encounters");
        Ok(repaired)
    }
}

impl IdentityLookup for Repository {
    fn encounter_exists(&self, id: &str) -> bool {
        self.arena.contains_key(id)
            || self.db.encounter_exists(id).unwrap_or_else(|e| {
                error!("lookup of {id} failed: {e}");
                false
            })
    }

    fn find_by_registration(&self, code: &str) -> Option<String> {
        let code = code.trim();
        let in_memory = self.arena.values().find(|enc| {
            enc.meta(META_CAA_REGISTRATION)
                .is_some_and(|c| c.trim().eq_ignore_ascii_case(code))
        });
        if let Some(enc) = in_memory {
            return Some(enc.id.clone());
        }
        self.db.find_by_registration(code).unwrap_or_else(|e| {
            error!("registration scan for {code} failed: {e}");
            None
        })
    }

    fn mac_owners(&self, mac: &str) -> Vec<String> {
        let mut owners: Vec<String> = self
            .arena
            .values()
            .filter(|enc| enc.has_mac(mac))
            .map(|enc| enc.id.clone())
            .collect();
        let stored = self.db.mac_owners(mac).unwrap_or_else(|e| {
            error!("MAC scan for {mac} failed: {e}");
            Vec::new()
        });
        for id in stored {
            // A loaded record's in-memory MAC set is authoritative
            if !self.arena.contains_key(&id) && !owners.contains(&id) {
                owners.push(id);
            }
        }
        owners
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
