use crate::crash::CrashInfo;
use crate::executor::{CommandExecutor, ExecutorError};
use thiserror::Error;
use tracing::debug;

/// Default cap on re-executions for one minimization.
pub const DEFAULT_TEST_BUDGET: u32 = 10_000;

#[derive(Error, Debug)]
pub enum MinimizerError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Answer to "does this candidate still crash the same way?".
///
/// A total value instead of control flow: `Preserved` means the crash hash
/// (type, signal, and stack shape together) is unchanged, `Changed` means it
/// crashed differently, `NoCrash` means the candidate is clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Preserved,
    Changed,
    NoCrash,
}

#[derive(Debug, Clone)]
pub struct MinimizeOutcome {
    /// Smallest input observed to reproduce the target crash hash.
    pub data: Vec<u8>,
    pub executions: u32,
    /// The budget ran out; `data` is the best candidate so far, not a fixed
    /// point.
    pub budget_exhausted: bool,
}

/// Delta-debugging crash minimizer with adaptive chunk sizing.
///
/// Starting from two chunks, each round tries dropping one chunk; a
/// successful drop coarsens the partition again (`n = max(2, n-1)`) while a
/// fruitless round refines it (`n = min(len, 2n)`) until single-byte
/// granularity is exhausted. An optional byte pass then tries zeroing each
/// remaining byte.
pub struct Minimizer {
    max_tests: u32,
    byte_pass: bool,
}

impl Minimizer {
    pub fn new() -> Self {
        Self {
            max_tests: DEFAULT_TEST_BUDGET,
            byte_pass: true,
        }
    }

    pub fn with_budget(mut self, max_tests: u32) -> Self {
        self.max_tests = max_tests;
        self
    }

    pub fn with_byte_pass(mut self, enabled: bool) -> Self {
        self.byte_pass = enabled;
        self
    }

    /// Minimize against a live target: re-execute through `executor` and
    /// compare crash hashes against `target_hash`.
    pub fn minimize(
        &self,
        executor: &mut CommandExecutor,
        original: &[u8],
        target_hash: &str,
    ) -> Result<MinimizeOutcome, MinimizerError> {
        self.minimize_with(original, |candidate| {
            let result = executor.execute(candidate)?;
            Ok(match CrashInfo::from_execution(&result, candidate) {
                None => Probe::NoCrash,
                Some(crash) if crash.crash_hash() == target_hash => Probe::Preserved,
                Some(_) => Probe::Changed,
            })
        })
    }

    /// Core algorithm over an arbitrary probe function.
    pub fn minimize_with<F>(
        &self,
        original: &[u8],
        mut probe: F,
    ) -> Result<MinimizeOutcome, MinimizerError>
    where
        F: FnMut(&[u8]) -> Result<Probe, MinimizerError>,
    {
        let mut executions = 0u32;
        let mut budget_exhausted = false;
        let mut candidate = original.to_vec();

        let mut run = |input: &[u8], executions: &mut u32| -> Result<Option<Probe>, MinimizerError> {
            if *executions >= self.max_tests {
                return Ok(None);
            }
            *executions += 1;
            probe(input).map(Some)
        };

        // The empty input first: it settles the trivial cases (including
        // one-byte inputs) without entering the chunk loop.
        if !candidate.is_empty() {
            match run(&[], &mut executions)? {
                Some(Probe::Preserved) => candidate.clear(),
                Some(_) => {}
                None => budget_exhausted = true,
            }
        }

        let mut n = 2usize;
        'outer: while candidate.len() >= 2 && !budget_exhausted {
            let mut removed = false;
            for index in 0..n {
                let reduced = without_chunk(&candidate, n, index);
                if reduced.len() == candidate.len() {
                    continue;
                }
                match run(&reduced, &mut executions)? {
                    Some(Probe::Preserved) => {
                        debug!(
                            from = candidate.len(),
                            to = reduced.len(),
                            chunks = n,
                            "minimizer dropped a chunk"
                        );
                        candidate = reduced;
                        n = n.saturating_sub(1).max(2);
                        removed = true;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        budget_exhausted = true;
                        break 'outer;
                    }
                }
            }
            if !removed {
                if n >= candidate.len() {
                    break;
                }
                n = (n * 2).min(candidate.len());
            }
        }

        if self.byte_pass && !budget_exhausted {
            for index in 0..candidate.len() {
                if candidate[index] == 0 {
                    continue;
                }
                let mut zeroed = candidate.clone();
                zeroed[index] = 0;
                match run(&zeroed, &mut executions)? {
                    Some(Probe::Preserved) => candidate = zeroed,
                    Some(_) => {}
                    None => {
                        budget_exhausted = true;
                        break;
                    }
                }
            }
        }

        Ok(MinimizeOutcome {
            data: candidate,
            executions,
            budget_exhausted,
        })
    }
}

impl Default for Minimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Partition `data` into `n` equal chunks (the last absorbs the remainder)
/// and return the data without chunk `index`.
fn without_chunk(data: &[u8], n: usize, index: usize) -> Vec<u8> {
    let chunk = (data.len() / n).max(1);
    let start = index * chunk;
    if start >= data.len() {
        return data.to_vec();
    }
    let end = if index == n - 1 {
        data.len()
    } else {
        (start + chunk).min(data.len())
    };
    let mut out = Vec::with_capacity(data.len() - (end - start));
    out.extend_from_slice(&data[..start]);
    out.extend_from_slice(&data[end..]);
    out
}
