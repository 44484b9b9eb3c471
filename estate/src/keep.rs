//! Persistent identity and remote records, split into a plaintext half
//! (address/session-id bookkeeping) and a safe half (key material and
//! acceptance state), per spec §4.3.
//!
//! Persistence itself is an external collaborator (spec §1): both keeps
//! are generic over a [`KeepStore`] key/value dumper, so the same logic
//! backs an in-memory store in tests and a JSON-file-backed store as the
//! reference implementation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::socket::HostAddr;

/// A key/value dumper: stores opaque JSON blobs under string keys.
/// Implementations need not be durable across process restarts to satisfy
/// the contract (the in-memory implementation below is not); only the
/// round-trip law `load(dump(x)) == x` within a process lifetime is
/// required.
pub trait KeepStore {
    /// Stores `value` under `key`, replacing any previous value.
    fn put(&mut self, key: &str, value: Value);
    /// Reads the value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<Value>;
    /// Removes the value stored under `key`, if any.
    fn remove(&mut self, key: &str);
    /// Lists every key currently stored.
    fn keys(&self) -> Vec<String>;
}

/// An in-memory [`KeepStore`], used by unit tests and anywhere durability
/// across restarts is not required.
#[derive(Debug, Default)]
pub struct MemoryKeepStore {
    entries: BTreeMap<String, Value>,
}

impl MemoryKeepStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeepStore for MemoryKeepStore {
    fn put(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// A [`KeepStore`] backed by one JSON file per key under a directory, the
/// reference implementation of the dumper interface for an actual
/// on-disk layout (spec §6: "on-disk layout is implementation-defined").
#[derive(Debug)]
pub struct FileKeepStore {
    dir: PathBuf,
}

impl FileKeepStore {
    /// Opens (creating if needed) a file-backed store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeepStore for FileKeepStore {
    fn put(&mut self, key: &str, value: Value) {
        if let Ok(bytes) = serde_json::to_vec_pretty(&value) {
            let _ = fs::write(self.path_for(key), bytes);
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        let bytes = fs::read(self.path_for(key)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn remove(&mut self, key: &str) {
        let _ = fs::remove_file(self.path_for(key));
    }

    fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect()
    }
}

/// Plaintext identity record for the local estate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainLocalData {
    /// Local estate uid.
    pub uid: u32,
    /// Local estate name.
    pub name: String,
    /// Stack name, preserved separately from the estate name (spec §9).
    pub stack: String,
    /// Whether this local estate plays the rendezvous (`main`) role.
    pub main: bool,
    /// Bound host address.
    pub ha: HostAddr,
    /// Current outbound session id.
    pub sid: u32,
    /// Next estate id to hand out when bootstrapping new remotes.
    pub neid: u32,
}

/// Plaintext identity record for a remote estate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainRemoteData {
    /// Remote estate uid.
    pub uid: u32,
    /// Remote estate name.
    pub name: String,
    /// Remote's host address.
    pub ha: HostAddr,
    /// Last known session id for this remote.
    pub sid: u32,
}

/// Safe (key material + acceptance) record for the local estate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeLocalData {
    /// Hex-encoded signing (verify) key.
    pub sighex: String,
    /// Hex-encoded private (box) key.
    pub prihex: String,
    /// Default acceptance policy for newly seen remotes.
    pub auto: bool,
}

/// Acceptance state of a remote estate, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceptance {
    /// Not yet accepted or rejected.
    Pending,
    /// Accepted; transactions with this remote may proceed.
    Accepted,
    /// Rejected; transactions with this remote are refused.
    Rejected,
}

/// Safe (key material + acceptance) record for a remote estate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeRemoteData {
    /// Hex-encoded verify key of the remote.
    pub verhex: String,
    /// Hex-encoded public (box) key of the remote.
    pub pubhex: String,
    /// Current acceptance state.
    pub acceptance: Acceptance,
}

const LOCAL_KEY: &str = "local";
const REMOTE_PREFIX: &str = "remote:";

fn remote_key(uid: u32) -> String {
    format!("{REMOTE_PREFIX}{uid}")
}

/// The plaintext keep: address and session-id bookkeeping.
pub struct PlainKeep<S: KeepStore> {
    store: S,
}

impl<S: KeepStore> PlainKeep<S> {
    /// Wraps `store` as a plaintext keep.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persists the local estate's plaintext record.
    pub fn dump_local(&mut self, data: &PlainLocalData) {
        if let Ok(v) = serde_json::to_value(data) {
            self.store.put(LOCAL_KEY, v);
        }
    }

    /// Loads the local estate's plaintext record, if any.
    pub fn load_local_data(&self) -> Option<PlainLocalData> {
        let v = self.store.get(LOCAL_KEY)?;
        serde_json::from_value(v).ok()
    }

    /// Checks that a loaded local record is well formed.
    pub fn verify_local_data(&self, data: &PlainLocalData) -> bool {
        !data.name.is_empty() && !data.stack.is_empty()
    }

    /// Deletes the local estate's plaintext record.
    pub fn clear_local_data(&mut self) {
        self.store.remove(LOCAL_KEY);
    }

    /// Persists a remote estate's plaintext record.
    pub fn dump_remote(&mut self, data: &PlainRemoteData) {
        if let Ok(v) = serde_json::to_value(data) {
            self.store.put(&remote_key(data.uid), v);
        }
    }

    /// Loads every remote plaintext record keyed by `uid`.
    pub fn load_all_remote_data(&self) -> BTreeMap<u32, PlainRemoteData> {
        let mut out = BTreeMap::new();
        for key in self.store.keys() {
            let Some(rest) = key.strip_prefix(REMOTE_PREFIX) else {
                continue;
            };
            let Ok(uid) = rest.parse::<u32>() else {
                continue;
            };
            if let Some(v) = self.store.get(&key) {
                if let Ok(data) = serde_json::from_value::<PlainRemoteData>(v) {
                    out.insert(uid, data);
                }
            }
        }
        out
    }

    /// Checks that a loaded remote record is well formed.
    pub fn verify_remote_data(&self, data: &PlainRemoteData) -> bool {
        !data.name.is_empty()
    }

    /// Deletes a single remote's plaintext record.
    pub fn clear_remote_data(&mut self, uid: u32) {
        self.store.remove(&remote_key(uid));
    }

    /// Deletes every remote's plaintext record.
    pub fn clear_all_remote_data(&mut self) {
        for key in self.store.keys() {
            if key.starts_with(REMOTE_PREFIX) {
                self.store.remove(&key);
            }
        }
    }
}

/// The safe keep: cryptographic key material and acceptance state.
pub struct SafeKeep<S: KeepStore> {
    store: S,
}

impl<S: KeepStore> SafeKeep<S> {
    /// Wraps `store` as a safe keep.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persists the local estate's safe record.
    pub fn dump_local(&mut self, data: &SafeLocalData) {
        if let Ok(v) = serde_json::to_value(data) {
            self.store.put(LOCAL_KEY, v);
        }
    }

    /// Loads the local estate's safe record, if any.
    pub fn load_local_data(&self) -> Option<SafeLocalData> {
        let v = self.store.get(LOCAL_KEY)?;
        serde_json::from_value(v).ok()
    }

    /// Checks that a loaded local safe record is well formed.
    pub fn verify_local_data(&self, data: &SafeLocalData) -> bool {
        !data.sighex.is_empty() && !data.prihex.is_empty()
    }

    /// Deletes the local estate's safe record.
    pub fn clear_local_data(&mut self) {
        self.store.remove(LOCAL_KEY);
    }

    /// Persists a remote estate's safe record.
    pub fn dump_remote(&mut self, uid: u32, data: &SafeRemoteData) {
        if let Ok(v) = serde_json::to_value(data) {
            self.store.put(&remote_key(uid), v);
        }
    }

    /// Loads every remote safe record keyed by `uid`.
    pub fn load_all_remote_data(&self) -> BTreeMap<u32, SafeRemoteData> {
        let mut out = BTreeMap::new();
        for key in self.store.keys() {
            let Some(rest) = key.strip_prefix(REMOTE_PREFIX) else {
                continue;
            };
            let Ok(uid) = rest.parse::<u32>() else {
                continue;
            };
            if let Some(v) = self.store.get(&key) {
                if let Ok(data) = serde_json::from_value::<SafeRemoteData>(v) {
                    out.insert(uid, data);
                }
            }
        }
        out
    }

    /// Checks that a loaded remote safe record is well formed.
    pub fn verify_remote_data(&self, data: &SafeRemoteData) -> bool {
        !data.verhex.is_empty() && !data.pubhex.is_empty()
    }

    /// Deletes a single remote's safe record.
    pub fn clear_remote(&mut self, uid: u32) {
        self.store.remove(&remote_key(uid));
    }

    /// Deletes every remote's safe record.
    pub fn clear_all_remote_data(&mut self) {
        for key in self.store.keys() {
            if key.starts_with(REMOTE_PREFIX) {
                self.store.remove(&key);
            }
        }
    }
}

/// Opens a directory-backed plain/safe keep pair, creating `basedir` if
/// needed. Convenience used by `Stack::builder` when `dirpath`/
/// `basedirpath` are set, mirroring `RoadStack`'s default `LotKeep`.
pub fn open_file_keeps(
    dirpath: &Path,
) -> std::io::Result<(PlainKeep<FileKeepStore>, SafeKeep<FileKeepStore>)> {
    let plain = PlainKeep::new(FileKeepStore::new(dirpath.join("plain"))?);
    let safe = SafeKeep::new(FileKeepStore::new(dirpath.join("safe"))?);
    Ok((plain, safe))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_local() -> PlainLocalData {
        PlainLocalData {
            uid: 1,
            name: "alice".into(),
            stack: "alice_stack".into(),
            main: true,
            ha: "127.0.0.1:7530".parse().unwrap(),
            sid: 0,
            neid: 1,
        }
    }

    #[test]
    fn plain_local_round_trips() {
        let mut keep = PlainKeep::new(MemoryKeepStore::new());
        let data = sample_local();
        keep.dump_local(&data);
        let loaded = keep.load_local_data().unwrap();
        assert_eq!(loaded, data);
        assert!(keep.verify_local_data(&loaded));
    }

    #[test]
    fn clearing_local_removes_it() {
        let mut keep = PlainKeep::new(MemoryKeepStore::new());
        keep.dump_local(&sample_local());
        keep.clear_local_data();
        assert!(keep.load_local_data().is_none());
    }

    #[test]
    fn remote_round_trips_and_skips_other_keys() {
        let mut keep = PlainKeep::new(MemoryKeepStore::new());
        keep.dump_local(&sample_local());
        let remote = PlainRemoteData {
            uid: 2,
            name: "bob".into(),
            ha: "127.0.0.1:7531".parse().unwrap(),
            sid: 5,
        };
        keep.dump_remote(&remote);

        let all = keep.load_all_remote_data();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get(&2), Some(&remote));
    }

    #[test]
    fn safe_remote_requires_both_keys_non_empty() {
        let keep = SafeKeep::new(MemoryKeepStore::new());
        let good = SafeRemoteData {
            verhex: "aa".into(),
            pubhex: "bb".into(),
            acceptance: Acceptance::Pending,
        };
        let bad = SafeRemoteData {
            verhex: String::new(),
            pubhex: "bb".into(),
            acceptance: Acceptance::Pending,
        };
        assert!(keep.verify_remote_data(&good));
        assert!(!keep.verify_remote_data(&bad));
    }

    #[test]
    fn file_store_round_trips_across_instances() {
        let dir = std::env::temp_dir().join(format!("estate-keep-test-{}", std::process::id()));
        let (mut plain, _safe) = open_file_keeps(&dir).unwrap();
        plain.dump_local(&sample_local());
        drop(plain);

        let (plain2, _safe2) = open_file_keeps(&dir).unwrap();
        assert_eq!(plain2.load_local_data().unwrap(), sample_local());
        let _ = fs::remove_dir_all(&dir);
    }
}
