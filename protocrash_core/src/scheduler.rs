use crate::corpus::{CorpusEntry, CorpusStore};
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The corpus is empty, so no input can be scheduled. This is only
    /// reachable before seeds are loaded; entries are never removed, so a
    /// running campaign cannot hit it.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// A reference to a corpus entry plus scheduler bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub entry_id: String,
    /// How many times `next()` has picked this entry.
    pub selections: u64,
    /// The weight this entry carried at its most recent selection pass.
    pub energy: f64,
}

/// Coverage-weighted input scheduler.
///
/// `next()` draws an entry with probability proportional to
///
/// ```text
/// w(e) = (1 + new_edges) * 1/(1 + len/1024) * 1/(1 + exec_count/10) * favored
/// ```
///
/// preferring inputs that discovered more edges, smaller inputs (cheaper to
/// execute), under-exercised inputs, and favored inputs (doubled). Ties fall
/// to insertion order. `add` is O(1); `next` is O(|queue|), which is fine for
/// the corpus sizes this fuzzer sees in practice.
pub struct QueueScheduler {
    queue: Vec<QueueEntry>,
    known: HashSet<String>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            known: HashSet::new(),
        }
    }

    /// Register a corpus entry with the scheduler. Duplicates are ignored.
    pub fn add(&mut self, entry_id: &str) {
        if self.known.insert(entry_id.to_string()) {
            self.queue.push(QueueEntry {
                entry_id: entry_id.to_string(),
                selections: 0,
                energy: 0.0,
            });
        }
    }

    /// Select the next input id to fuzz.
    pub fn next<R: Rng + ?Sized>(
        &mut self,
        corpus: &CorpusStore,
        rng: &mut R,
    ) -> Result<String, SchedulerError> {
        if self.queue.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }

        let mut total = 0.0f64;
        for item in &mut self.queue {
            item.energy = corpus.entry(&item.entry_id).map_or(0.0, weight);
            total += item.energy;
        }
        if total <= 0.0 {
            // Queue entries without corpus backing carry no weight; fall back
            // to the oldest entry rather than failing the loop.
            let first = &mut self.queue[0];
            first.selections += 1;
            return Ok(first.entry_id.clone());
        }

        let mut draw = rng.random_range(0.0..total);
        for item in &mut self.queue {
            if draw < item.energy {
                item.selections += 1;
                return Ok(item.entry_id.clone());
            }
            draw -= item.energy;
        }

        // Floating-point underflow on the last subtraction; insertion order
        // breaks the tie in favor of the final entry.
        let last = self
            .queue
            .last_mut()
            .ok_or(SchedulerError::CorpusEmpty)?;
        last.selections += 1;
        Ok(last.entry_id.clone())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.queue
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn weight(entry: &CorpusEntry) -> f64 {
    let coverage_factor = 1.0 + f64::from(entry.new_edges);
    let size_factor = 1.0 / (1.0 + entry.data.len() as f64 / 1024.0);
    let freshness_factor = 1.0 / (1.0 + entry.exec_count as f64 / 10.0);
    let favored_factor = if entry.favored { 2.0 } else { 1.0 };
    coverage_factor * size_factor * freshness_factor * favored_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashMap;

    fn seeded_rng() -> ChaCha8Rng {
        ChaCha8Rng::from_seed([21; 32])
    }

    #[test]
    fn empty_queue_is_an_error() {
        let corpus = CorpusStore::in_memory();
        let mut scheduler = QueueScheduler::new();
        let mut rng = seeded_rng();

        assert!(matches!(
            scheduler.next(&corpus, &mut rng),
            Err(SchedulerError::CorpusEmpty)
        ));
    }

    #[test]
    fn add_is_idempotent() {
        let mut scheduler = QueueScheduler::new();
        scheduler.add("abc");
        scheduler.add("abc");
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn selection_never_empties_the_queue() {
        let mut corpus = CorpusStore::in_memory();
        let outcome = corpus.add_seed(b"seed".to_vec()).unwrap();
        let mut scheduler = QueueScheduler::new();
        scheduler.add(outcome.id());
        let mut rng = seeded_rng();

        for _ in 0..100 {
            let id = scheduler.next(&corpus, &mut rng).unwrap();
            assert_eq!(id, outcome.id());
        }
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.entries()[0].selections, 100);
    }

    #[test]
    fn higher_coverage_contribution_wins_more_often() {
        let mut corpus = CorpusStore::in_memory();
        let low = corpus.add(vec![b'a'; 64], 1, None, 0).unwrap();
        let high = corpus.add(vec![b'b'; 64], 2, None, 20).unwrap();

        let mut scheduler = QueueScheduler::new();
        scheduler.add(low.id());
        scheduler.add(high.id());
        let mut rng = seeded_rng();

        let mut picks: HashMap<String, u32> = HashMap::new();
        for _ in 0..2000 {
            *picks
                .entry(scheduler.next(&corpus, &mut rng).unwrap())
                .or_insert(0) += 1;
        }
        assert!(picks[high.id()] > picks[low.id()] * 5);
    }

    #[test]
    fn smaller_inputs_are_preferred() {
        let mut corpus = CorpusStore::in_memory();
        let small = corpus.add(vec![b'a'; 32], 1, None, 1).unwrap();
        let large = corpus.add(vec![b'b'; 8192], 2, None, 1).unwrap();

        let mut scheduler = QueueScheduler::new();
        scheduler.add(small.id());
        scheduler.add(large.id());
        let mut rng = seeded_rng();

        let mut small_picks = 0u32;
        for _ in 0..2000 {
            if scheduler.next(&corpus, &mut rng).unwrap() == small.id() {
                small_picks += 1;
            }
        }
        assert!(small_picks > 1400);
    }

    #[test]
    fn heavily_exercised_inputs_lose_priority() {
        let mut corpus = CorpusStore::in_memory();
        let fresh = corpus.add(vec![b'a'; 64], 1, None, 1).unwrap();
        let tired = corpus.add(vec![b'b'; 64], 2, None, 1).unwrap();
        for _ in 0..100 {
            corpus.record_selection(tired.id());
        }

        let mut scheduler = QueueScheduler::new();
        scheduler.add(fresh.id());
        scheduler.add(tired.id());
        let mut rng = seeded_rng();

        let mut fresh_picks = 0u32;
        for _ in 0..2000 {
            if scheduler.next(&corpus, &mut rng).unwrap() == fresh.id() {
                fresh_picks += 1;
            }
        }
        assert!(fresh_picks > 1600);
    }

    #[test]
    fn favored_entries_take_two_thirds_of_draws() {
        let mut corpus = CorpusStore::in_memory();
        // Identical in every weight input except the favored flag.
        let favored = corpus.add_seed(vec![b'F'; 128]).unwrap();
        let plain = corpus.add(vec![b'P'; 128], 1, None, 0).unwrap();
        assert!(corpus.entry(favored.id()).unwrap().favored);
        assert!(!corpus.entry(plain.id()).unwrap().favored);

        let mut scheduler = QueueScheduler::new();
        scheduler.add(favored.id());
        scheduler.add(plain.id());
        let mut rng = seeded_rng();

        let draws = 10_000u32;
        let mut favored_picks = 0u32;
        for _ in 0..draws {
            if scheduler.next(&corpus, &mut rng).unwrap() == favored.id() {
                favored_picks += 1;
            }
        }
        // 99% binomial interval around 2/3 of 10,000 draws.
        assert!(
            (6545..=6788).contains(&favored_picks),
            "favored picked {favored_picks} times out of {draws}"
        );
    }
}
