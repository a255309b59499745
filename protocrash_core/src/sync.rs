use crate::corpus::entry_id;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

/// An input picked up from a peer's queue directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedInput {
    pub data: Vec<u8>,
    /// The 8-hex coverage tag parsed from the filename; empty when the name
    /// carried none.
    pub coverage_hash: String,
    pub source_worker: usize,
    /// Publish time (file mtime) as unix seconds.
    pub ts: f64,
}

/// Shorten a coverage digest to the 8-hex tag used in queue filenames.
pub fn cov8(coverage_hash: u64) -> String {
    format!("{:08x}", (coverage_hash & 0xFFFF_FFFF) as u32)
}

/// Filesystem-backed cross-worker corpus exchange.
///
/// Each worker owns `<sync_root>/worker_<i>/queue/` and only ever writes
/// there; peers only read sibling directories. Publication is atomic via
/// write-then-rename, so a reader never sees a partial file and no lock is
/// needed. Workers are eventually consistent and never block on each other.
pub struct Synchronizer {
    sync_root: PathBuf,
    worker_id: usize,
    queue_dir: PathBuf,
    published: HashSet<String>,
    last_sync: f64,
}

impl Synchronizer {
    pub fn new(sync_root: &Path, worker_id: usize) -> Result<Self, SyncError> {
        let queue_dir = sync_root.join(format!("worker_{worker_id}")).join("queue");
        fs::create_dir_all(&queue_dir).map_err(|e| {
            SyncError::Io(format!("Failed to create queue dir {:?}: {}", queue_dir, e))
        })?;
        Ok(Self {
            sync_root: sync_root.to_path_buf(),
            worker_id,
            queue_dir,
            published: HashSet::new(),
            last_sync: 0.0,
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    /// Publish bytes under `id_<input_hash>_<cov8>`. Returns `false` when
    /// this worker already published the same coverage hash.
    pub fn publish(&mut self, data: &[u8], coverage_hash: &str) -> Result<bool, SyncError> {
        if self.published.contains(coverage_hash) {
            return Ok(false);
        }

        let tag: String = coverage_hash.chars().take(8).collect();
        let name = format!("id_{}_{}", entry_id(data), tag);
        let tmp = self.queue_dir.join(format!(".tmp_{name}"));
        let target = self.queue_dir.join(&name);

        fs::write(&tmp, data)?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(SyncError::Io(format!(
                "Failed to publish {:?}: {}",
                target, e
            )));
        }

        self.published.insert(coverage_hash.to_string());
        debug!(worker = self.worker_id, file = %name, "published corpus entry");
        Ok(true)
    }

    /// Collect peer inputs published strictly after `since_ts` (unix
    /// seconds). With `None`, the time of the previous import is used, so
    /// repeated calls never re-yield the same tick's files.
    pub fn import_new(&mut self, since_ts: Option<f64>) -> Result<Vec<SyncedInput>, SyncError> {
        let since = since_ts.unwrap_or(self.last_sync);
        let mut imported = Vec::new();

        for item in fs::read_dir(&self.sync_root)? {
            let path = match item {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(error = %e, "unreadable sync root entry, skipping");
                    continue;
                }
            };
            let source_worker = match peer_worker_id(&path) {
                Some(id) if id != self.worker_id => id,
                _ => continue,
            };
            let queue = path.join("queue");
            if !queue.is_dir() {
                continue;
            }

            for file in fs::read_dir(&queue)? {
                let file = match file {
                    Ok(file) => file,
                    Err(_) => continue,
                };
                let file_path = file.path();
                let name = match file_path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name,
                    None => continue,
                };
                let coverage_hash = match parse_queue_filename(name) {
                    Some(tag) => tag,
                    None => {
                        debug!(file = %name, "ignoring non-queue file");
                        continue;
                    }
                };
                let ts = match file_mtime(&file_path) {
                    Some(ts) if ts > since => ts,
                    _ => continue,
                };
                match fs::read(&file_path) {
                    Ok(data) => imported.push(SyncedInput {
                        data,
                        coverage_hash,
                        source_worker,
                        ts,
                    }),
                    Err(e) => warn!(?file_path, error = %e, "failed to read peer input"),
                }
            }
        }

        self.last_sync = crate::corpus::unix_now();
        Ok(imported)
    }

    /// Remove this worker's queue directory. Called on shutdown; peers that
    /// already imported keep their copies.
    pub fn cleanup(&mut self) -> Result<(), SyncError> {
        let own_dir = self.sync_root.join(format!("worker_{}", self.worker_id));
        if own_dir.exists() {
            fs::remove_dir_all(&own_dir)?;
        }
        Ok(())
    }
}

fn peer_worker_id(path: &Path) -> Option<usize> {
    if !path.is_dir() {
        return None;
    }
    path.file_name()?
        .to_str()?
        .strip_prefix("worker_")?
        .parse()
        .ok()
}

/// Parse a queue filename of the form `id_<input_hash>_<cov8>`.
///
/// The input-hash segment may itself contain underscores; the coverage tag
/// is always the part after the last underscore. Names with no underscore
/// after the `id_` prefix carry an empty coverage hash. Anything not
/// starting with `id_` is not a queue entry.
fn parse_queue_filename(name: &str) -> Option<String> {
    let rest = name.strip_prefix("id_")?;
    match rest.rsplit_once('_') {
        Some((_, tag)) => Some(tag.to_string()),
        None => Some(String::new()),
    }
}

fn file_mtime(path: &Path) -> Option<f64> {
    let mtime = fs::metadata(path).ok()?.modified().ok()?;
    mtime
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}
