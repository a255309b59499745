use crate::config::FuzzConfig;
use crate::corpus::unix_now;
use crate::driver::{DriverError, FuzzDriver};
use crate::stats::{read_json, write_json_atomic, WorkerStats};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{info, warn};

/// Environment variables through which the supervisor re-invokes the current
/// executable as a worker. The front-end must call [`run_worker_from_env`]
/// before doing anything else.
pub const WORKER_ID_ENV: &str = "PROTOCRASH_WORKER_ID";
pub const WORKER_CONFIG_ENV: &str = "PROTOCRASH_WORKER_CONFIG";

/// Workers silent for longer than this are flagged inactive.
const INACTIVITY_THRESHOLD_S: f64 = 10.0;
/// How long terminated workers get to flush before the force-kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Stats poll cadence.
const COLLECT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Supervisor I/O error: {0}")]
    Io(String),

    #[error("Failed to spawn worker {worker_id}: {reason}")]
    WorkerSpawn { worker_id: usize, reason: String },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        SupervisorError::Io(err.to_string())
    }
}

/// Campaign-wide totals: sums across workers, union of coverage hashes.
#[derive(Serialize, Debug, Clone)]
pub struct AggregateStats {
    pub executions: u64,
    pub crashes: u64,
    pub hangs: u64,
    /// Size of the union of per-worker coverage hash sets.
    pub coverage_edges: usize,
    pub active_workers: usize,
    pub inactive_workers: Vec<usize>,
    pub last_update: f64,
}

/// Fold per-worker snapshots into campaign totals. Workers whose last
/// snapshot is older than the inactivity threshold are flagged, not dropped;
/// their counters still count.
pub fn aggregate(stats: &[WorkerStats], inactivity_threshold_s: f64) -> AggregateStats {
    let now = unix_now();
    let mut union: HashSet<u64> = HashSet::new();
    let mut totals = AggregateStats {
        executions: 0,
        crashes: 0,
        hangs: 0,
        coverage_edges: 0,
        active_workers: 0,
        inactive_workers: Vec::new(),
        last_update: now,
    };
    for worker in stats {
        totals.executions += worker.executions;
        totals.crashes += worker.crashes;
        totals.hangs += worker.hangs;
        union.extend(worker.coverage_edges.iter().copied());
        if now - worker.last_update > inactivity_threshold_s {
            totals.inactive_workers.push(worker.worker_id);
        } else {
            totals.active_workers += 1;
        }
    }
    totals.inactive_workers.sort_unstable();
    totals.coverage_edges = union.len();
    totals
}

/// Spawns and monitors N worker processes sharing one sync directory.
///
/// Workers are full OS processes (a re-invocation of the current executable),
/// so a crashing worker takes down nothing but itself. Stats flow back
/// through per-worker snapshot files, drained on a timer; a lost snapshot is
/// replaced by the next one.
pub struct Supervisor {
    config: FuzzConfig,
}

impl Supervisor {
    pub fn new(config: FuzzConfig) -> Self {
        Self { config }
    }

    /// Run the campaign until `duration` (or the configured maximum) elapses
    /// or a stop signal arrives, then tear the workers down and return the
    /// final aggregate.
    pub fn run(&mut self, duration: Option<Duration>) -> Result<AggregateStats, SupervisorError> {
        #[cfg(unix)]
        install_stop_handler();

        // Resolve the shared sync directory; a temporary one is cleaned up
        // when the campaign ends.
        let temp_root: Option<TempDir>;
        let sync_root: PathBuf = match &self.config.sync_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                temp_root = None;
                root.clone()
            }
            None => {
                let dir = TempDir::new()?;
                let path = dir.path().to_path_buf();
                temp_root = Some(dir);
                path
            }
        };

        let mut worker_config = self.config.clone();
        worker_config.sync_root = Some(sync_root.clone());
        let config_path = sync_root.join("worker_config.json");
        write_json_atomic(&config_path, &worker_config)?;

        let worker_count = self.config.workers.max(1);
        let mut children = self.spawn_workers(worker_count, &config_path)?;
        info!(workers = worker_count, sync_root = %sync_root.display(), "campaign started");

        let deadline = duration
            .or(self.config.max_duration_s.map(Duration::from_secs))
            .map(|d| Instant::now() + d);

        loop {
            std::thread::sleep(COLLECT_INTERVAL);

            if stop_requested() {
                info!("stop signal received, shutting down workers");
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    info!("campaign duration reached");
                    break;
                }
            }

            let mut alive = 0;
            for (worker_id, child) in children.iter_mut().enumerate() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        // A worker death is reported, not fatal; the rest of
                        // the fleet keeps fuzzing.
                        if !status.success() {
                            warn!(worker_id, %status, "worker exited abnormally");
                        }
                    }
                    Ok(None) => alive += 1,
                    Err(e) => warn!(worker_id, error = %e, "failed to poll worker"),
                }
            }
            if alive == 0 {
                info!("all workers have exited");
                break;
            }
        }

        self.shutdown(&mut children);

        let stats = read_worker_stats(&sync_root, worker_count);
        let totals = aggregate(&stats, INACTIVITY_THRESHOLD_S);
        self.write_campaign_snapshot(&totals);
        info!(
            executions = totals.executions,
            crashes = totals.crashes,
            hangs = totals.hangs,
            coverage_edges = totals.coverage_edges,
            "campaign finished"
        );

        drop(temp_root);
        Ok(totals)
    }

    fn spawn_workers(
        &self,
        count: usize,
        config_path: &Path,
    ) -> Result<Vec<Child>, SupervisorError> {
        let exe = std::env::current_exe()?;
        let mut children = Vec::with_capacity(count);
        for worker_id in 0..count {
            let child = Command::new(&exe)
                .env(WORKER_ID_ENV, worker_id.to_string())
                .env(WORKER_CONFIG_ENV, config_path)
                .spawn()
                .map_err(|e| SupervisorError::WorkerSpawn {
                    worker_id,
                    reason: e.to_string(),
                })?;
            children.push(child);
        }
        Ok(children)
    }

    /// Soft-terminate, grant the grace period, then force-kill stragglers.
    fn shutdown(&self, children: &mut [Child]) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            for child in children.iter() {
                let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let still_running = children
                .iter_mut()
                .map(|c| c.try_wait())
                .filter(|r| matches!(r, Ok(None)))
                .count();
            if still_running == 0 {
                break;
            }
            if Instant::now() >= deadline {
                for child in children.iter_mut() {
                    if matches!(child.try_wait(), Ok(None)) {
                        warn!(pid = child.id(), "worker ignored SIGTERM, killing");
                        let _ = child.kill();
                    }
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        for child in children.iter_mut() {
            let _ = child.wait();
        }
    }

    fn write_campaign_snapshot(&self, totals: &AggregateStats) {
        let path = self
            .config
            .corpus_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.join("stats.json"))
            .unwrap_or_else(|| PathBuf::from("stats.json"));
        if let Err(e) = write_json_atomic(&path, totals) {
            warn!(error = %e, "failed to write campaign stats snapshot");
        }
    }
}

fn read_worker_stats(sync_root: &Path, workers: usize) -> Vec<WorkerStats> {
    let mut stats = Vec::new();
    for worker_id in 0..workers {
        let path = sync_root.join(format!("worker_{worker_id}")).join("stats.json");
        match read_json::<WorkerStats>(&path) {
            Ok(snapshot) => stats.push(snapshot),
            // A worker that never completed a sync tick simply has no
            // snapshot yet.
            Err(_) => {}
        }
    }
    stats
}

// --- Worker-side re-entry --------------------------------------------------

/// If this process was spawned by a supervisor, run the worker loop and
/// return its outcome; otherwise return `None` and let the front-end
/// continue as the supervisor.
pub fn run_worker_from_env() -> Option<Result<(), DriverError>> {
    let worker_id: usize = std::env::var(WORKER_ID_ENV).ok()?.parse().ok()?;
    let config_path = PathBuf::from(std::env::var(WORKER_CONFIG_ENV).ok()?);
    Some(run_worker(worker_id, &config_path))
}

fn run_worker(worker_id: usize, config_path: &Path) -> Result<(), DriverError> {
    let config: FuzzConfig = read_json(config_path)
        .map_err(|e| crate::corpus::CorpusError::Io(format!("worker config: {e}")))?;

    let stop = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        install_stop_handler();
        forward_stop_signal(Arc::clone(&stop));
    }

    let mut driver = FuzzDriver::new(config, worker_id, stop)?;
    driver.fuzz()
}

// --- Signal plumbing -------------------------------------------------------

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::Relaxed)
}

#[cfg(unix)]
extern "C" fn on_stop_signal(_: i32) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_stop_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

/// Signal handlers may only touch statics; this forwards the static flag
/// into the driver's shared stop flag.
#[cfg(unix)]
fn forward_stop_signal(flag: Arc<AtomicBool>) {
    std::thread::spawn(move || loop {
        if STOP_REQUESTED.load(Ordering::Relaxed) {
            flag.store(true, Ordering::Relaxed);
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(worker_id: usize, executions: u64, age_s: f64) -> WorkerStats {
        WorkerStats {
            worker_id,
            executions,
            crashes: worker_id as u64,
            hangs: 1,
            coverage_edges: [worker_id as u64 * 10, 999].into_iter().collect(),
            last_update: unix_now() - age_s,
        }
    }

    #[test]
    fn aggregate_sums_counters_and_unions_edges() {
        let stats = vec![snapshot(0, 100, 0.0), snapshot(1, 200, 0.0), snapshot(2, 300, 0.0)];
        let totals = aggregate(&stats, 10.0);

        assert_eq!(totals.executions, 600);
        assert_eq!(totals.crashes, 0 + 1 + 2);
        assert_eq!(totals.hangs, 3);
        // {0, 999} ∪ {10, 999} ∪ {20, 999}
        assert_eq!(totals.coverage_edges, 4);
        assert_eq!(totals.active_workers, 3);
        assert!(totals.inactive_workers.is_empty());
    }

    #[test]
    fn stale_workers_are_flagged_but_still_counted() {
        let stats = vec![snapshot(0, 100, 0.0), snapshot(1, 50, 60.0)];
        let totals = aggregate(&stats, 10.0);

        assert_eq!(totals.executions, 150);
        assert_eq!(totals.active_workers, 1);
        assert_eq!(totals.inactive_workers, vec![1]);
    }

    #[test]
    fn aggregate_of_nothing_is_zero() {
        let totals = aggregate(&[], 10.0);
        assert_eq!(totals.executions, 0);
        assert_eq!(totals.coverage_edges, 0);
        assert_eq!(totals.active_workers, 0);
    }

    #[test]
    fn missing_snapshots_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("worker_0")).unwrap();
        write_json_atomic(
            &dir.path().join("worker_0/stats.json"),
            &snapshot(0, 42, 0.0),
        )
        .unwrap();
        // worker_1 never wrote a snapshot.

        let stats = read_worker_stats(dir.path(), 2);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].executions, 42);
    }

    #[test]
    fn worker_env_absent_means_supervisor_mode() {
        // The test runner itself is not a spawned worker.
        assert!(std::env::var(WORKER_ID_ENV).is_err());
        assert!(run_worker_from_env().is_none());
    }

    #[test]
    fn aggregate_serializes_for_the_campaign_snapshot() {
        let totals = aggregate(&[snapshot(0, 10, 0.0)], 10.0);
        let value = serde_json::to_value(&totals).unwrap();
        for key in [
            "executions",
            "crashes",
            "hangs",
            "coverage_edges",
            "active_workers",
            "inactive_workers",
            "last_update",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
    }
}
