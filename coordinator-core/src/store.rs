//! Embedded per-session persistent store.
//!
//! Generalizes the teacher's `PersistentStore<V>` (a thin wrapper around
//! `blueprint_sdk::stores::local_database::LocalDatabase<V>`, a single JSON
//! file per table) into a standalone implementation with no Tangle
//! dependency. Each table is one JSON file, rewritten whole on every
//! mutation, guarded by an `RwLock` for in-process concurrent reads — the
//! coordinator is single-threaded per session (§5), so this is about
//! read/write safety within one actor's own background tasks, not
//! cross-actor sharing.
//!
//! §9 explicitly permits either a KV or relational embedded store; this
//! keeps the teacher's KV shape rather than introducing a new dependency
//! the corpus doesn't otherwise reach for.

use crate::error::{CoordinatorError, Result};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Resolve (and create) the directory persisted tables live under.
pub fn state_dir() -> PathBuf {
    let dir = std::env::var("COORDINATOR_STATE_DIR").unwrap_or_else(|_| "./coordinator-state".into());
    let path = PathBuf::from(dir);
    if !path.exists() {
        let _ = fs::create_dir_all(&path);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(&path) {
                let mut perms = meta.permissions();
                perms.set_mode(0o700);
                let _ = fs::set_permissions(&path, perms);
            }
        }
    }
    path
}

/// A JSON-file-backed key-value table, keyed by hex id.
pub struct PersistentStore<V> {
    path: PathBuf,
    data: RwLock<HashMap<String, V>>,
}

impl<V> PersistentStore<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn open(table_name: &str) -> Result<Self> {
        let path = state_dir().join(format!("{table_name}.json"));
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                HashMap::new()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn flush(&self, guard: &HashMap<String, V>) -> Result<()> {
        let bytes = serde_json::to_vec(guard)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        let guard = self
            .data
            .read()
            .map_err(|_| CoordinatorError::Storage("store lock poisoned".into()))?;
        Ok(guard.get(key).cloned())
    }

    pub fn find<F>(&self, predicate: F) -> Result<Option<V>>
    where
        F: Fn(&V) -> bool,
    {
        let guard = self
            .data
            .read()
            .map_err(|_| CoordinatorError::Storage("store lock poisoned".into()))?;
        Ok(guard.values().find(|v| predicate(v)).cloned())
    }

    pub fn filter<F>(&self, predicate: F) -> Result<Vec<V>>
    where
        F: Fn(&V) -> bool,
    {
        let guard = self
            .data
            .read()
            .map_err(|_| CoordinatorError::Storage("store lock poisoned".into()))?;
        Ok(guard.values().filter(|v| predicate(v)).cloned().collect())
    }

    pub fn values(&self) -> Result<Vec<V>> {
        let guard = self
            .data
            .read()
            .map_err(|_| CoordinatorError::Storage("store lock poisoned".into()))?;
        Ok(guard.values().cloned().collect())
    }

    pub fn insert(&self, key: String, value: V) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| CoordinatorError::Storage("store lock poisoned".into()))?;
        guard.insert(key, value);
        self.flush(&guard)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| CoordinatorError::Storage("store lock poisoned".into()))?;
        guard.remove(key);
        self.flush(&guard)
    }

    /// Mutate an existing value in place and persist the result. No-op if absent.
    pub fn update<F>(&self, key: &str, mutator: F) -> Result<Option<V>>
    where
        F: FnOnce(&mut V),
    {
        let mut guard = self
            .data
            .write()
            .map_err(|_| CoordinatorError::Storage("store lock poisoned".into()))?;
        let updated = if let Some(value) = guard.get_mut(key) {
            mutator(value);
            Some(value.clone())
        } else {
            None
        };
        if updated.is_some() {
            self.flush(&guard)?;
        }
        Ok(updated)
    }
}

pub fn table_path_exists(table_name: &str) -> bool {
    Path::new(&state_dir()).join(format!("{table_name}.json")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;

    #[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
    struct Widget {
        id: String,
        count: u32,
    }

    fn with_temp_state_dir<F: FnOnce()>(f: F) {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("COORDINATOR_STATE_DIR", dir.path());
        }
        f();
        unsafe {
            std::env::remove_var("COORDINATOR_STATE_DIR");
        }
    }

    #[test]
    #[serial]
    fn insert_get_update_remove_round_trip() {
        with_temp_state_dir(|| {
            let store: PersistentStore<Widget> = PersistentStore::open("widgets").unwrap();
            store
                .insert("a".into(), Widget { id: "a".into(), count: 1 })
                .unwrap();
            assert_eq!(store.get("a").unwrap().unwrap().count, 1);

            store.update("a", |w| w.count += 1).unwrap();
            assert_eq!(store.get("a").unwrap().unwrap().count, 2);

            store.remove("a").unwrap();
            assert!(store.get("a").unwrap().is_none());
        });
    }

    #[test]
    #[serial]
    fn reopening_loads_persisted_data() {
        with_temp_state_dir(|| {
            {
                let store: PersistentStore<Widget> = PersistentStore::open("widgets2").unwrap();
                store
                    .insert("x".into(), Widget { id: "x".into(), count: 5 })
                    .unwrap();
            }
            let reopened: PersistentStore<Widget> = PersistentStore::open("widgets2").unwrap();
            assert_eq!(reopened.get("x").unwrap().unwrap().count, 5);
        });
    }

    #[test]
    #[serial]
    fn find_and_filter() {
        with_temp_state_dir(|| {
            let store: PersistentStore<Widget> = PersistentStore::open("widgets3").unwrap();
            store.insert("a".into(), Widget { id: "a".into(), count: 1 }).unwrap();
            store.insert("b".into(), Widget { id: "b".into(), count: 2 }).unwrap();
            let found = store.find(|w| w.count == 2).unwrap().unwrap();
            assert_eq!(found.id, "b");
            let filtered = store.filter(|w| w.count >= 1).unwrap();
            assert_eq!(filtered.len(), 2);
        });
    }
}
