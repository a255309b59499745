use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use crate::corpus::unix_now;

/// Per-worker stats record, exchanged with the supervisor as JSON.
///
/// Snapshots are idempotent and replaceable: losing one is fine, the next
/// one carries the full picture again.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub executions: u64,
    pub crashes: u64,
    pub hangs: u64,
    /// Coverage digests of every admitted entry; the supervisor unions these
    /// across workers.
    pub coverage_edges: HashSet<u64>,
    /// Unix timestamp (seconds) of the snapshot.
    pub last_update: f64,
}

/// Campaign counters owned by one driver.
#[derive(Debug)]
pub struct FuzzStats {
    pub total_execs: u64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub corpus_size: usize,
    pub queue_depth: usize,
    pub total_edges: u64,
    start_time: Instant,
}

impl FuzzStats {
    pub fn new() -> Self {
        Self {
            total_execs: 0,
            unique_crashes: 0,
            unique_hangs: 0,
            corpus_size: 0,
            queue_depth: 0,
            total_edges: 0,
            start_time: Instant::now(),
        }
    }

    pub fn increment_execs(&mut self) {
        self.total_execs += 1;
    }

    pub fn add_crash(&mut self) {
        self.unique_crashes += 1;
    }

    pub fn add_hang(&mut self) {
        self.unique_hangs += 1;
    }

    pub fn update_corpus(&mut self, corpus_size: usize, queue_depth: usize, total_edges: u64) {
        self.corpus_size = corpus_size;
        self.queue_depth = queue_depth;
        self.total_edges = total_edges;
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn execs_per_sec(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_execs as f64 / elapsed
    }

    /// Snapshot for the supervisor.
    pub fn to_worker_stats(&self, worker_id: usize, coverage_edges: &HashSet<u64>) -> WorkerStats {
        WorkerStats {
            worker_id,
            executions: self.total_execs,
            crashes: self.unique_crashes,
            hangs: self.unique_hangs,
            coverage_edges: coverage_edges.clone(),
            last_update: unix_now(),
        }
    }
}

impl Default for FuzzStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a JSON value with write-then-rename, so readers never observe a
/// half-written snapshot.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn counters_accumulate() {
        let mut stats = FuzzStats::new();
        assert_eq!(stats.total_execs, 0);

        for _ in 0..5 {
            stats.increment_execs();
        }
        stats.add_crash();
        stats.add_hang();
        stats.update_corpus(12, 3, 77);

        assert_eq!(stats.total_execs, 5);
        assert_eq!(stats.unique_crashes, 1);
        assert_eq!(stats.unique_hangs, 1);
        assert_eq!(stats.corpus_size, 12);
        assert_eq!(stats.queue_depth, 3);
        assert_eq!(stats.total_edges, 77);
    }

    #[test]
    fn execs_per_sec_is_finite_and_positive() {
        let mut stats = FuzzStats::new();
        for _ in 0..1000 {
            stats.increment_execs();
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
        let rate = stats.execs_per_sec();
        assert!(rate > 0.0);
        assert!(rate.is_finite());
    }

    #[test]
    fn worker_snapshot_carries_the_contract_fields() {
        let mut stats = FuzzStats::new();
        stats.increment_execs();
        stats.add_crash();
        let edges: HashSet<u64> = [1u64, 2, 3].into_iter().collect();

        let snapshot = stats.to_worker_stats(7, &edges);
        assert_eq!(snapshot.worker_id, 7);
        assert_eq!(snapshot.executions, 1);
        assert_eq!(snapshot.crashes, 1);
        assert_eq!(snapshot.coverage_edges.len(), 3);
        assert!(snapshot.last_update > 0.0);

        let value = serde_json::to_value(&snapshot).unwrap();
        for key in [
            "worker_id",
            "executions",
            "crashes",
            "hangs",
            "coverage_edges",
            "last_update",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
    }

    #[test]
    fn atomic_writes_round_trip_and_leave_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let stats = FuzzStats::new().to_worker_stats(0, &HashSet::new());
        write_json_atomic(&path, &stats).unwrap();

        let loaded: WorkerStats = read_json(&path).unwrap();
        assert_eq!(loaded.worker_id, 0);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
