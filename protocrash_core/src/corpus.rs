use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// Errors that can arise during corpus operations.
///
/// These cover I/O problems when interacting with a persistent corpus
/// directory and metadata (de)serialization failures. Logical conditions like
/// duplicate inserts are not errors; they are reported through [`AddOutcome`].
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An I/O error occurred while reading or writing corpus files.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A `.meta` sidecar could not be serialized.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// A `.meta` sidecar could not be parsed.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Deserialization(format!("JSON operation error: {}", err))
    }
}

/// Stable identifier for a byte string: the first 16 hex characters of its
/// SHA-256 digest. A pure function of content, so ids survive restarts.
pub fn entry_id(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}

/// A promoted input together with its scheduling metadata.
///
/// Entries form a set keyed by [`CorpusEntry::id`]; re-adding the same bytes
/// is a no-op. Entries are never removed by the core.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub id: String,
    pub data: Vec<u8>,
    /// Input this entry was mutated from; `None` for seeds.
    pub parent_id: Option<String>,
    /// Mutation distance from a seed; 0 for seeds.
    pub depth: u32,
    /// Digest of the bucketed trace that caused admission.
    pub coverage_hash: u64,
    /// Virgin bits cleared when this entry was admitted.
    pub new_edges: u32,
    pub exec_count: u64,
    pub last_selected_at: f64,
    /// Favored entries get double scheduling weight; seeds start favored.
    pub favored: bool,
}

/// On-disk sidecar for an entry, written next to the raw bytes as
/// `<id>.meta`.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct EntryMeta {
    id: String,
    parent_id: Option<String>,
    depth: u32,
    coverage_hash: u64,
    new_edges: u32,
    exec_count: u64,
    last_selected_at: f64,
    favored: bool,
}

impl EntryMeta {
    fn of(entry: &CorpusEntry) -> Self {
        Self {
            id: entry.id.clone(),
            parent_id: entry.parent_id.clone(),
            depth: entry.depth,
            coverage_hash: entry.coverage_hash,
            new_edges: entry.new_edges,
            exec_count: entry.exec_count,
            last_selected_at: entry.last_selected_at,
            favored: entry.favored,
        }
    }
}

/// Result of an insert attempt. Duplicates are silently dropped by design;
/// the id of the existing entry is reported so callers can still reference it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added(String),
    Duplicate(String),
}

impl AddOutcome {
    pub fn id(&self) -> &str {
        match self {
            AddOutcome::Added(id) | AddOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AddOutcome::Duplicate(_))
    }
}

/// Content-addressed store of fuzzing inputs.
///
/// Optionally backed by a directory laid out as `<id>` (raw bytes) plus
/// `<id>.meta` (JSON sidecar); a persistent store reloads both on open, so a
/// campaign can resume where it left off.
pub struct CorpusStore {
    entries: HashMap<String, CorpusEntry>,
    /// Insertion order, for deterministic iteration and tie-breaking.
    order: Vec<String>,
    dir: Option<PathBuf>,
    total_bytes: usize,
}

impl CorpusStore {
    /// A store with no backing directory. Used by tests and by components
    /// (like the minimizer) that need a scratch corpus.
    pub fn in_memory() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            dir: None,
            total_bytes: 0,
        }
    }

    /// Open (or create) a persistent store at `dir`, reloading any entries
    /// already present. Files without a parseable sidecar are skipped with a
    /// warning rather than aborting the campaign.
    pub fn persistent(dir: &Path) -> Result<Self, CorpusError> {
        fs::create_dir_all(dir).map_err(|e| {
            CorpusError::Io(format!("Failed to create corpus directory {:?}: {}", dir, e))
        })?;

        let mut store = Self {
            entries: HashMap::new(),
            order: Vec::new(),
            dir: Some(dir.to_path_buf()),
            total_bytes: 0,
        };
        store.reload()?;
        Ok(store)
    }

    fn reload(&mut self) -> Result<(), CorpusError> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };

        let mut metas: Vec<EntryMeta> = Vec::new();
        for item in fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().map_or(true, |ext| ext != "meta") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<EntryMeta>(&raw) {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(?path, error = %e, "skipping unreadable corpus sidecar"),
            }
        }
        // Restore a stable order; ids are content hashes so any deterministic
        // order works, and sorting keeps reloads reproducible.
        metas.sort_by(|a, b| a.id.cmp(&b.id));

        for meta in metas {
            let data_path = dir.join(&meta.id);
            let data = match fs::read(&data_path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(?data_path, error = %e, "corpus sidecar without data file");
                    continue;
                }
            };
            if entry_id(&data) != meta.id {
                warn!(id = %meta.id, "corpus file content does not match its id, skipping");
                continue;
            }
            self.total_bytes += data.len();
            self.order.push(meta.id.clone());
            self.entries.insert(
                meta.id.clone(),
                CorpusEntry {
                    id: meta.id,
                    data,
                    parent_id: meta.parent_id,
                    depth: meta.depth,
                    coverage_hash: meta.coverage_hash,
                    new_edges: meta.new_edges,
                    exec_count: meta.exec_count,
                    last_selected_at: meta.last_selected_at,
                    favored: meta.favored,
                },
            );
        }
        Ok(())
    }

    /// Insert a mutated input. Depth is derived from the parent; duplicates
    /// leave the store untouched.
    pub fn add(
        &mut self,
        data: Vec<u8>,
        coverage_hash: u64,
        parent_id: Option<String>,
        new_edges: u32,
    ) -> Result<AddOutcome, CorpusError> {
        self.insert(data, coverage_hash, parent_id, new_edges, false)
    }

    /// Insert a seed input. Seeds sit at depth 0 and start favored.
    pub fn add_seed(&mut self, data: Vec<u8>) -> Result<AddOutcome, CorpusError> {
        self.insert(data, 0, None, 0, true)
    }

    fn insert(
        &mut self,
        data: Vec<u8>,
        coverage_hash: u64,
        parent_id: Option<String>,
        new_edges: u32,
        favored: bool,
    ) -> Result<AddOutcome, CorpusError> {
        let id = entry_id(&data);
        if self.entries.contains_key(&id) {
            return Ok(AddOutcome::Duplicate(id));
        }

        let depth = match &parent_id {
            Some(parent) => self.entries.get(parent).map_or(1, |p| p.depth + 1),
            None => 0,
        };
        let entry = CorpusEntry {
            id: id.clone(),
            data,
            parent_id,
            depth,
            coverage_hash,
            new_edges,
            exec_count: 0,
            last_selected_at: 0.0,
            favored,
        };

        self.persist(&entry)?;
        self.total_bytes += entry.data.len();
        self.order.push(id.clone());
        self.entries.insert(id.clone(), entry);
        Ok(AddOutcome::Added(id))
    }

    fn persist(&self, entry: &CorpusEntry) -> Result<(), CorpusError> {
        let dir = match &self.dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        fs::write(dir.join(&entry.id), &entry.data)?;
        let meta = serde_json::to_string_pretty(&EntryMeta::of(entry))
            .map_err(|e| CorpusError::Serialization(e.to_string()))?;
        fs::write(dir.join(format!("{}.meta", entry.id)), meta)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&[u8]> {
        self.entries.get(id).map(|e| e.data.as_slice())
    }

    pub fn entry(&self, id: &str) -> Option<&CorpusEntry> {
        self.entries.get(id)
    }

    /// Pick a uniformly random entry, optionally excluding one id (used by
    /// splice so an input is not spliced with itself).
    pub fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        exclude_id: Option<&str>,
    ) -> Option<&CorpusEntry> {
        if self.order.is_empty() {
            return None;
        }
        let mut index = rng.random_range(0..self.order.len());
        if Some(self.order[index].as_str()) == exclude_id {
            if self.order.len() == 1 {
                return None;
            }
            index = (index + 1) % self.order.len();
        }
        self.entries.get(&self.order[index])
    }

    /// Entries in insertion order. The iterator is finite and restartable.
    pub fn iter_entries(&self) -> impl Iterator<Item = &CorpusEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Note a scheduler pick of `id`, bumping its execution counter.
    pub fn record_selection(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.exec_count += 1;
            entry.last_selected_at = unix_now();
        }
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn byte_size(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    #[test]
    fn ids_are_stable_and_truncated() {
        let first = entry_id(b"test input");
        let second = entry_id(b"test input");
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert_ne!(first, entry_id(b"test inpux"));
    }

    #[test]
    fn adding_duplicate_bytes_is_a_no_op() {
        let mut corpus = CorpusStore::in_memory();
        let first = corpus.add(b"same".to_vec(), 1, None, 3).unwrap();
        let second = corpus.add(b"same".to_vec(), 2, None, 9).unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.id(), second.id());
        assert_eq!(corpus.size(), 1);
        // The original admission metadata survives the duplicate attempt.
        assert_eq!(corpus.entry(first.id()).unwrap().coverage_hash, 1);
    }

    #[test]
    fn depth_tracks_mutation_distance() {
        let mut corpus = CorpusStore::in_memory();
        let seed = corpus.add_seed(b"seed".to_vec()).unwrap();
        let child = corpus
            .add(b"child".to_vec(), 10, Some(seed.id().to_string()), 1)
            .unwrap();
        let grandchild = corpus
            .add(b"grandchild".to_vec(), 11, Some(child.id().to_string()), 1)
            .unwrap();

        assert_eq!(corpus.entry(seed.id()).unwrap().depth, 0);
        assert!(corpus.entry(seed.id()).unwrap().favored);
        assert_eq!(corpus.entry(child.id()).unwrap().depth, 1);
        assert_eq!(corpus.entry(grandchild.id()).unwrap().depth, 2);
        assert!(!corpus.entry(child.id()).unwrap().favored);
    }

    #[test]
    fn random_respects_exclusion() {
        let mut corpus = CorpusStore::in_memory();
        let only = corpus.add_seed(b"only".to_vec()).unwrap();
        let mut rng = ChaCha8Rng::from_seed([7; 32]);

        assert!(corpus.random(&mut rng, Some(only.id())).is_none());

        corpus.add_seed(b"other".to_vec()).unwrap();
        for _ in 0..50 {
            let picked = corpus.random(&mut rng, Some(only.id())).unwrap();
            assert_ne!(picked.id, only.id());
        }
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let mut corpus = CorpusStore::in_memory();
        let a = corpus.add_seed(b"a".to_vec()).unwrap();
        let b = corpus.add_seed(b"b".to_vec()).unwrap();
        let c = corpus.add_seed(b"c".to_vec()).unwrap();

        let ids: Vec<&str> = corpus.iter_entries().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);
        // Restartable: a second pass yields the same sequence.
        let again: Vec<&str> = corpus.iter_entries().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, again);
    }

    #[test]
    fn byte_size_accumulates() {
        let mut corpus = CorpusStore::in_memory();
        corpus.add_seed(vec![b'A'; 100]).unwrap();
        corpus.add_seed(vec![b'B'; 200]).unwrap();
        corpus.add_seed(vec![b'A'; 100]).unwrap(); // duplicate

        assert_eq!(corpus.size(), 2);
        assert_eq!(corpus.byte_size(), 300);
    }

    #[test]
    fn persistent_store_reloads_entries_and_metadata() {
        let dir = tempdir().unwrap();
        let id = {
            let mut corpus = CorpusStore::persistent(dir.path()).unwrap();
            let outcome = corpus.add(b"persisted".to_vec(), 42, None, 7).unwrap();
            outcome.id().to_string()
        };

        let reloaded = CorpusStore::persistent(dir.path()).unwrap();
        assert_eq!(reloaded.size(), 1);
        let entry = reloaded.entry(&id).unwrap();
        assert_eq!(entry.data, b"persisted");
        assert_eq!(entry.coverage_hash, 42);
        assert_eq!(entry.new_edges, 7);
    }

    #[test]
    fn reload_skips_tampered_files() {
        let dir = tempdir().unwrap();
        {
            let mut corpus = CorpusStore::persistent(dir.path()).unwrap();
            corpus.add_seed(b"good".to_vec()).unwrap();
        }
        // Corrupt the data file so it no longer matches its id.
        let id = entry_id(b"good");
        fs::write(dir.path().join(&id), b"tampered").unwrap();

        let reloaded = CorpusStore::persistent(dir.path()).unwrap();
        assert_eq!(reloaded.size(), 0);
    }

    #[test]
    fn record_selection_updates_counters() {
        let mut corpus = CorpusStore::in_memory();
        let outcome = corpus.add_seed(b"seed".to_vec()).unwrap();
        assert_eq!(corpus.entry(outcome.id()).unwrap().exec_count, 0);

        corpus.record_selection(outcome.id());
        let entry = corpus.entry(outcome.id()).unwrap();
        assert_eq!(entry.exec_count, 1);
        assert!(entry.last_selected_at > 0.0);
    }
}
