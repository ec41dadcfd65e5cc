//! Identity resolution across unstable identifiers.
//!
//! Maps a message's raw identifiers to the canonical encounter id. Priority:
//! stable serial number, then regulatory registration, then MAC address, then
//! the raw uid itself. MAC and registration lookups go through in-memory
//! caches first and fall back to a scan of the store.
//!
//! Ambiguous evidence never merges: a MAC that already belongs to a different
//! materialized encounter is reported as a conflict and the message stays
//! under its own uid.

use std::collections::HashMap;

use log::{debug, warn};

use crate::message::{DetectionMessage, IdType};

/// Store queries the resolver needs. Implemented by the repository.
pub trait IdentityLookup {
    /// A record exists under `id` (in memory or durable).
    fn encounter_exists(&self, id: &str) -> bool;

    /// Id of a record whose metadata carries `code`.
    fn find_by_registration(&self, code: &str) -> Option<String>;

    /// Ids of every record whose MAC set contains `mac`.
    fn mac_owners(&self, mac: &str) -> Vec<String>;
}

/// The identifiers of one message that take part in resolution.
#[derive(Debug, Clone, Copy)]
pub struct IdentityKeys<'a> {
    pub uid: &'a str,
    pub id_type: IdType,
    pub mac: Option<&'a str>,
    pub registration: Option<&'a str>,
}

impl<'a> IdentityKeys<'a> {
    pub fn from_message(msg: &'a DetectionMessage) -> Self {
        IdentityKeys {
            uid: msg.uid.trim(),
            id_type: msg.id_type,
            mac: msg.mac_str(),
            registration: msg.registration(),
        }
    }
}

/// How the canonical id was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    Serial,
    RegistrationCache,
    RegistrationScan,
    MacCache,
    MacScan,
    RawUid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: String,
    pub resolved_by: ResolvedBy,
    /// MAC already owned by another live encounter; must not be merged.
    pub conflicting_mac: Option<String>,
}

enum MacScan {
    SameUid,
    OwnedElsewhere,
    Unseen,
}

/// MAC→id and registration→id caches plus the resolution rules.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    mac_cache: HashMap<String, String>,
    code_cache: HashMap<String, String>,
}

fn mac_key(mac: &str) -> String {
    mac.trim().to_ascii_uppercase()
}

fn code_key(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, keys: &IdentityKeys<'_>, store: &impl IdentityLookup) -> Resolution {
        let raw = keys.uid;
        let resolved = |id: &str, by: ResolvedBy| Resolution {
            id: id.to_string(),
            resolved_by: by,
            conflicting_mac: None,
        };

        if keys.id_type.is_stable_serial() {
            return resolved(raw, ResolvedBy::Serial);
        }

        if let Some(code) = keys.registration {
            if let Some(id) = self.code_cache.get(&code_key(code)).cloned() {
                if store.encounter_exists(&id) {
                    return resolved(&id, ResolvedBy::RegistrationCache);
                }
                self.code_cache.remove(&code_key(code));
            }
            if let Some(id) = store.find_by_registration(code) {
                debug!("registration {code} resolved to {id} by scan");
                self.code_cache.insert(code_key(code), id.clone());
                return resolved(&id, ResolvedBy::RegistrationScan);
            }
        }

        let mut conflicting_mac = None;
        if let Some(mac) = keys.mac {
            let mut scan = true;
            if let Some(id) = self.mac_cache.get(&mac_key(mac)).cloned() {
                if store.encounter_exists(&id) {
                    if id == raw || !store.encounter_exists(raw) {
                        return resolved(&id, ResolvedBy::MacCache);
                    }
                    warn!("MAC {mac} maps to {id} but {raw} is a separate live encounter; not merging");
                    conflicting_mac = Some(mac.to_string());
                    scan = false;
                } else {
                    self.mac_cache.remove(&mac_key(mac));
                }
            }
            if scan {
                match self.scan_mac(mac, raw, store) {
                    MacScan::SameUid => return resolved(raw, ResolvedBy::MacScan),
                    MacScan::OwnedElsewhere => conflicting_mac = Some(mac.to_string()),
                    MacScan::Unseen => {}
                }
            }
        }

        Resolution {
            id: raw.to_string(),
            resolved_by: ResolvedBy::RawUid,
            conflicting_mac,
        }
    }

    /// Scan the store for the MAC, caching a same-uid match.
    fn scan_mac(&mut self, mac: &str, raw: &str, store: &impl IdentityLookup) -> MacScan {
        let owners = store.mac_owners(mac);
        if owners.iter().any(|o| o == raw) {
            self.mac_cache.insert(mac_key(mac), raw.to_string());
            return MacScan::SameUid;
        }
        match owners.first() {
            Some(other) => {
                warn!("MAC {mac} already belongs to {other}; keeping {raw} separate");
                MacScan::OwnedElsewhere
            }
            None => MacScan::Unseen,
        }
    }

    pub fn remember_mac(&mut self, mac: &str, id: &str) {
        self.mac_cache.insert(mac_key(mac), id.to_string());
    }

    pub fn remember_registration(&mut self, code: &str, id: &str) {
        self.code_cache.insert(code_key(code), id.to_string());
    }

    pub fn cached_mac(&self, mac: &str) -> Option<&str> {
        self.mac_cache.get(&mac_key(mac)).map(|s| s.as_str())
    }

    pub fn cached_registration(&self, code: &str) -> Option<&str> {
        self.code_cache.get(&code_key(code)).map(|s| s.as_str())
    }

    /// Drop every cache entry pointing at `id`.
    pub fn forget(&mut self, id: &str) {
        self.mac_cache.retain(|_, v| v != id);
        self.code_cache.retain(|_, v| v != id);
    }

    pub fn clear(&mut self) {
        self.mac_cache.clear();
        self.code_cache.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
