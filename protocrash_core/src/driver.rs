use crate::config::FuzzConfig;
use crate::corpus::{AddOutcome, CorpusError, CorpusStore};
use crate::coverage::{CoverageCapture, CoverageError, CoverageMap, ObservedBehaviorCapture};
use crate::crash::{CrashError, CrashInfo, CrashOutcome, CrashStore, CrashType};
use crate::executor::{CommandExecutor, ExecutorConfig, ExecutorError};
use crate::minimizer::Minimizer;
use crate::mutation::{MutationEngine, StrategyWeights};
use crate::protocol::Protocol;
use crate::scheduler::{QueueScheduler, SchedulerError};
use crate::stats::{write_json_atomic, FuzzStats};
use crate::sync::{cov8, Synchronizer};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DriverError {
    /// No seeds could be loaded; fuzzing cannot start. Entries are never
    /// removed, so this is only reachable before the first iteration.
    #[error("Corpus is empty; load seeds before fuzzing")]
    EmptyCorpus,

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Coverage(#[from] CoverageError),

    #[error(transparent)]
    Crash(#[from] CrashError),
}

impl From<SchedulerError> for DriverError {
    fn from(_: SchedulerError) -> Self {
        DriverError::EmptyCorpus
    }
}

/// The per-worker fuzzing loop.
///
/// Single-threaded by design: the coverage map, corpus, scheduler, and
/// strategy weights are all process-local, so the hot path has no
/// synchronization. The only shared state is the stop flag and the sync
/// directory, touched once per sync interval.
pub struct FuzzDriver {
    worker_id: usize,
    config: FuzzConfig,
    corpus: CorpusStore,
    scheduler: QueueScheduler,
    engine: MutationEngine,
    weights: StrategyWeights,
    coverage: CoverageMap,
    capture: ObservedBehaviorCapture,
    executor: CommandExecutor,
    crash_store: CrashStore,
    synchronizer: Option<Synchronizer>,
    stats: FuzzStats,
    /// Coverage digests of admitted entries, reported to the supervisor.
    coverage_edges: HashSet<u64>,
    /// Entries admitted since the last successful publish round.
    pending_publish: Vec<(String, u64)>,
    stats_path: Option<PathBuf>,
    stop: Arc<AtomicBool>,
    rng: ChaCha8Rng,
    started: Instant,
    last_sync: Instant,
}

impl FuzzDriver {
    pub fn new(
        config: FuzzConfig,
        worker_id: usize,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, DriverError> {
        let mut corpus = CorpusStore::persistent(&config.corpus_dir)?;
        if let Some(seeds_dir) = &config.seeds_dir {
            load_seeds(&mut corpus, seeds_dir)?;
        }

        let mut scheduler = QueueScheduler::new();
        let ids: Vec<String> = corpus.ids().map(str::to_string).collect();
        for id in &ids {
            scheduler.add(id);
        }

        let protocol = config
            .protocol
            .as_deref()
            .and_then(Protocol::from_name);
        let engine = MutationEngine::new(protocol);
        let weights = StrategyWeights::new(engine.protocol_enabled());

        let executor = CommandExecutor::new(ExecutorConfig {
            argv: config.argv.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            memory_limit_bytes: config.memory_limit_bytes,
            sanitizers: config.sanitizers,
        })?;
        let crash_store = CrashStore::new(&config.crash_dir)?;

        let (synchronizer, stats_path) = match &config.sync_root {
            Some(root) => {
                let synchronizer =
                    Synchronizer::new(root, worker_id).map_err(|e| CorpusError::Io(e.to_string()))?;
                let stats_path = root.join(format!("worker_{worker_id}")).join("stats.json");
                (Some(synchronizer), Some(stats_path))
            }
            None => (None, None),
        };

        let seed = crate::corpus::unix_now().to_bits() ^ worker_id as u64;
        Ok(Self {
            worker_id,
            config,
            corpus,
            scheduler,
            engine,
            weights,
            coverage: CoverageMap::new(),
            capture: ObservedBehaviorCapture,
            executor,
            crash_store,
            synchronizer,
            stats: FuzzStats::new(),
            coverage_edges: HashSet::new(),
            pending_publish: Vec::new(),
            stats_path,
            stop,
            rng: ChaCha8Rng::seed_from_u64(seed),
            started: Instant::now(),
            last_sync: Instant::now(),
        })
    }

    /// Add a seed directly, bypassing `seeds_dir`.
    pub fn add_seed(&mut self, data: Vec<u8>) -> Result<(), DriverError> {
        let outcome = self.corpus.add_seed(data)?;
        self.scheduler.add(outcome.id());
        Ok(())
    }

    pub fn stats(&self) -> &FuzzStats {
        &self.stats
    }

    pub fn corpus(&self) -> &CorpusStore {
        &self.corpus
    }

    pub fn crash_store(&self) -> &CrashStore {
        &self.crash_store
    }

    /// Run the fuzzing loop until a stop condition fires.
    ///
    /// On a graceful stop the driver flushes one final sync tick and a final
    /// stats snapshot before returning.
    pub fn fuzz(&mut self) -> Result<(), DriverError> {
        if self.corpus.is_empty() {
            return Err(DriverError::EmptyCorpus);
        }
        self.started = Instant::now();
        info!(
            worker = self.worker_id,
            corpus = self.corpus.size(),
            target = %self.config.argv.join(" "),
            "fuzzing started"
        );

        self.warmup()?;

        while !self.should_stop() {
            self.iteration()?;

            let sync_due = self.last_sync.elapsed()
                >= Duration::from_secs(self.config.sync_interval_s.max(1));
            if sync_due {
                self.sync_tick();
                self.last_sync = Instant::now();
            }
        }

        self.sync_tick();
        info!(
            worker = self.worker_id,
            executions = self.stats.total_execs,
            corpus = self.corpus.size(),
            unique_crashes = self.stats.unique_crashes,
            unique_hangs = self.stats.unique_hangs,
            execs_per_sec = format!("{:.1}", self.stats.execs_per_sec()),
            "fuzzing finished"
        );
        Ok(())
    }

    /// Execute every seed once to establish the baseline virgin map, so the
    /// first real mutants are only admitted for behavior the seeds did not
    /// already exhibit.
    fn warmup(&mut self) -> Result<(), DriverError> {
        let ids: Vec<String> = self.corpus.ids().map(str::to_string).collect();
        for id in ids {
            let input = match self.corpus.get(&id) {
                Some(input) => input.to_vec(),
                None => continue,
            };
            self.coverage.reset();
            let result = self.executor.execute(&input)?;
            self.capture.capture(&input, &result, &mut self.coverage);
            self.stats.increment_execs();
            if self.coverage.has_new_coverage() {
                let digest = self.coverage.digest();
                self.coverage.promote()?;
                self.coverage_edges.insert(digest);
                self.pending_publish.push((id, digest));
            }
        }
        Ok(())
    }

    /// One turn of the canonical loop: schedule, mutate, execute, observe.
    fn iteration(&mut self) -> Result<(), DriverError> {
        let entry_id = self.scheduler.next(&self.corpus, &mut self.rng)?;
        self.corpus.record_selection(&entry_id);
        let input = self
            .corpus
            .get(&entry_id)
            .map(<[u8]>::to_vec)
            .ok_or(DriverError::EmptyCorpus)?;

        let strategy = self.weights.sample(&mut self.rng);
        let mutant = self.engine.mutate(
            strategy,
            &input,
            &mut self.rng,
            &self.corpus,
            Some(&entry_id),
        );

        self.coverage.reset();
        let result = self.executor.execute(&mutant)?;
        self.capture.capture(&mutant, &result, &mut self.coverage);
        let new_coverage = self.coverage.has_new_coverage();

        if let Some(crash) = CrashInfo::from_execution(&result, &mutant) {
            self.handle_crash(crash)?;
        }

        if new_coverage {
            let digest = self.coverage.digest();
            let outcome =
                self.corpus
                    .add(mutant, digest, Some(entry_id), self.coverage.pending_new_edges())?;
            if let AddOutcome::Added(id) = outcome {
                self.coverage.promote()?;
                self.scheduler.add(&id);
                self.coverage_edges.insert(digest);
                self.pending_publish.push((id, digest));
            }
        }

        self.weights.observe(strategy, new_coverage);
        self.stats.increment_execs();
        Ok(())
    }

    fn handle_crash(&mut self, crash: CrashInfo) -> Result<(), DriverError> {
        let is_hang = crash.crash_type == CrashType::Hang;
        let input = crash.input.clone();
        match self.crash_store.observe(&crash)? {
            CrashOutcome::Duplicate(_) => Ok(()),
            CrashOutcome::New(hash) => {
                if is_hang {
                    self.stats.add_hang();
                } else {
                    self.stats.add_crash();
                }

                // Minimizing a hang means waiting out the timeout once per
                // probe; the budget would burn hours.
                if self.config.minimize_crashes && !is_hang {
                    let minimizer = Minimizer::new();
                    match minimizer.minimize(&mut self.executor, &input, &hash) {
                        Ok(outcome) => {
                            if outcome.budget_exhausted {
                                debug!(
                                    crash_hash = %hash,
                                    executions = outcome.executions,
                                    "minimizer budget exhausted, keeping best candidate"
                                );
                            }
                            self.crash_store.attach_minimized(&hash, &outcome.data)?;
                        }
                        Err(e) => {
                            warn!(crash_hash = %hash, error = %e, "crash minimization failed");
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn should_stop(&self) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return true;
        }
        if let Some(max) = self.config.max_executions {
            if self.stats.total_execs >= max {
                return true;
            }
        }
        if let Some(max_s) = self.config.max_duration_s {
            if self.started.elapsed() >= Duration::from_secs(max_s) {
                return true;
            }
        }
        false
    }

    /// Publish local discoveries, ingest peers', refresh the stats snapshot.
    /// Filesystem trouble here is logged and skipped; the loop goes on.
    fn sync_tick(&mut self) {
        if let Some(sync) = &mut self.synchronizer {
            let mut still_pending = Vec::new();
            for (id, digest) in self.pending_publish.drain(..) {
                let data = match self.corpus.get(&id) {
                    Some(data) => data,
                    None => continue,
                };
                match sync.publish(data, &cov8(digest)) {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "publish failed, retrying next tick");
                        still_pending.push((id, digest));
                    }
                }
            }
            self.pending_publish = still_pending;

            match sync.import_new(None) {
                Ok(imported) => {
                    let mut admitted = 0usize;
                    for peer_input in imported {
                        let digest =
                            u64::from_str_radix(&peer_input.coverage_hash, 16).unwrap_or(0);
                        match self.corpus.add(peer_input.data, digest, None, 0) {
                            Ok(AddOutcome::Added(id)) => {
                                self.scheduler.add(&id);
                                admitted += 1;
                            }
                            Ok(AddOutcome::Duplicate(_)) => {}
                            Err(e) => warn!(error = %e, "failed to admit peer input"),
                        }
                    }
                    if admitted > 0 {
                        debug!(worker = self.worker_id, admitted, "imported peer inputs");
                    }
                }
                Err(e) => warn!(error = %e, "peer import failed, skipping this tick"),
            }
        }

        self.stats.update_corpus(
            self.corpus.size(),
            self.scheduler.len(),
            self.coverage.total_edges_found(),
        );
        if let Some(path) = &self.stats_path {
            let snapshot = self.stats.to_worker_stats(self.worker_id, &self.coverage_edges);
            if let Err(e) = write_json_atomic(path, &snapshot) {
                warn!(error = %e, "failed to write stats snapshot");
            }
        }
    }
}

fn load_seeds(corpus: &mut CorpusStore, dir: &std::path::Path) -> Result<(), CorpusError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for item in fs::read_dir(dir).map_err(CorpusError::from)? {
        let path = item.map_err(CorpusError::from)?.path();
        if !path.is_file() {
            continue;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }
        let data = fs::read(&path).map_err(CorpusError::from)?;
        if data.is_empty() {
            continue;
        }
        corpus.add_seed(data)?;
    }
    Ok(())
}
