use crate::executor::ExecutionResult;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of slots in the edge bitmap. 64 KiB keeps the whole map L2-resident
/// while keeping collision rates acceptable for targets with up to ~10^4
/// unique edges.
pub const MAP_SIZE: usize = 65536;

/// Errors raised by coverage bookkeeping.
///
/// There is exactly one: the virgin map regaining a bit. That can only mean a
/// bug in the fuzzer itself, so callers must treat it as fatal.
#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("virgin map invariant violated: {0}")]
    InvariantViolation(String),
}

/// Map a raw hit count to its class index (0 through 8).
///
/// The nine classes are `{0, 1, 2, 3, 4-7, 8-15, 16-31, 32-127, 128-255}`.
pub fn class_index(count: u8) -> u8 {
    match count {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4..=7 => 4,
        8..=15 => 5,
        16..=31 => 6,
        32..=127 => 7,
        128..=255 => 8,
    }
}

/// Map a raw hit count to its bucket representative, the lower bound of the
/// class. Representatives are fixed points, so bucketing is idempotent, and
/// two counts compare equal exactly when they fall in the same class.
pub fn bucketize(count: u8) -> u8 {
    match count {
        0 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4..=7 => 4,
        8..=15 => 8,
        16..=31 => 16,
        32..=127 => 32,
        128..=255 => 128,
    }
}

/// AFL-style edge coverage map.
///
/// `trace` holds per-run saturating hit counters; `virgin` holds the bits
/// never raised by any promoted run (initially all-ones). A run exhibits new
/// coverage iff the bucketed trace intersects the virgin map.
pub struct CoverageMap {
    trace: Vec<u8>,
    virgin: Vec<u8>,
    prev_block: u16,
    total_edges_found: u64,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self {
            trace: vec![0u8; MAP_SIZE],
            virgin: vec![0xFFu8; MAP_SIZE],
            prev_block: 0,
            total_edges_found: 0,
        }
    }

    /// Clear the per-run trace and reset the edge chain.
    pub fn reset(&mut self) {
        self.trace.fill(0);
        self.prev_block = 0;
    }

    /// Record a transition into `block_id`.
    ///
    /// The edge is `block_id ^ prev_block`; the previous block is then stored
    /// right-shifted by one so that A->B and B->A land on different slots.
    pub fn record(&mut self, block_id: u16) {
        let edge = block_id ^ self.prev_block;
        let slot = &mut self.trace[usize::from(edge) % MAP_SIZE];
        *slot = slot.saturating_add(1);
        self.prev_block = block_id >> 1;
    }

    /// The trace with every counter collapsed to its bucket representative.
    pub fn classify_counts(&self) -> Vec<u8> {
        self.trace.iter().map(|&c| bucketize(c)).collect()
    }

    /// Whether the current run raised any bit still present in the virgin
    /// map. Compared word-wise over u64 chunks; the trailing comparison loop
    /// never runs because MAP_SIZE is a multiple of eight.
    pub fn has_new_coverage(&self) -> bool {
        let bucketed = self.classify_counts();
        let any_new = words(&bucketed)
            .zip(words(&self.virgin))
            .any(|(t, v)| t & v != 0);
        any_new
    }

    /// Virgin bits the current run would clear if promoted. The same number
    /// `promote()` will return, computed without touching the virgin map, so
    /// an entry's metadata can be written before the admission decision.
    pub fn pending_new_edges(&self) -> u32 {
        let bucketed = self.classify_counts();
        bucketed
            .iter()
            .zip(self.virgin.iter())
            .map(|(t, v)| (t & v).count_ones())
            .sum()
    }

    /// Fold the current run into the virgin map, returning how many virgin
    /// bits it cleared.
    pub fn promote(&mut self) -> Result<u32, CoverageError> {
        let bucketed = self.classify_counts();
        let before: u32 = self.virgin.iter().map(|v| v.count_ones()).sum();

        for (v, t) in self.virgin.iter_mut().zip(bucketed.iter()) {
            *v &= !t;
        }

        let after: u32 = self.virgin.iter().map(|v| v.count_ones()).sum();
        if after > before {
            return Err(CoverageError::InvariantViolation(format!(
                "virgin popcount grew from {before} to {after}"
            )));
        }
        let cleared = before - after;
        self.total_edges_found += u64::from(cleared);
        Ok(cleared)
    }

    /// Stable 64-bit digest of the bucketed trace, used as the coverage hash
    /// on corpus entries and in sync filenames.
    pub fn digest(&self) -> u64 {
        let bucketed = self.classify_counts();
        let hash = Sha256::digest(&bucketed);
        let mut first = [0u8; 8];
        first.copy_from_slice(&hash[..8]);
        u64::from_le_bytes(first)
    }

    /// Number of distinct trace slots hit this run.
    pub fn edge_count(&self) -> usize {
        self.trace.iter().filter(|&&c| c > 0).count()
    }

    /// Total virgin bits cleared over the map's lifetime.
    pub fn total_edges_found(&self) -> u64 {
        self.total_edges_found
    }

    #[cfg(test)]
    fn trace_at(&self, index: usize) -> u8 {
        self.trace[index]
    }

    #[cfg(test)]
    fn force_count(&mut self, index: usize, count: u8) {
        self.trace[index] = count;
    }
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

fn words(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes.chunks_exact(8).map(|chunk| {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        u64::from_ne_bytes(word)
    })
}

/// Source of coverage observations for one execution.
///
/// Targets run uninstrumented, so something must translate an execution into
/// `record` calls. The driver only depends on this seam; an instrumented
/// transport can be slotted in without touching the loop.
pub trait CoverageCapture {
    fn capture(&mut self, input: &[u8], result: &ExecutionResult, map: &mut CoverageMap);
}

/// Default capture: derives pseudo-edges from the target's observable
/// behavior. Identical behavior yields an identical trace, so only behavioral
/// change can register as new coverage.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObservedBehaviorCapture;

impl ObservedBehaviorCapture {
    fn fold_block(window: &[u8], salt: u16) -> u16 {
        let mut acc = salt;
        for &byte in window {
            acc = acc.wrapping_mul(31).wrapping_add(u16::from(byte));
        }
        acc
    }
}

impl CoverageCapture for ObservedBehaviorCapture {
    fn capture(&mut self, _input: &[u8], result: &ExecutionResult, map: &mut CoverageMap) {
        for window in result.stdout.chunks(4) {
            map.record(Self::fold_block(window, 0x5151));
        }
        for window in result.stderr.chunks(8) {
            map.record(Self::fold_block(window, 0xA3A3));
        }

        let status_block = match (result.exit_code, result.signal) {
            (_, Some(sig)) => 0xC000 ^ (sig as u16),
            (Some(code), None) => 0x9000 ^ (code as u16),
            (None, None) => 0x9F9F,
        };
        map.record(status_block);
        if result.timed_out {
            map.record(0xDEAD);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_hashing_is_direction_sensitive() {
        let mut map = CoverageMap::new();
        map.record(0x1A2B);
        map.record(0x3C4D);

        // 0x1A2B >> 1 == 0x0D15
        assert_eq!(map.trace_at(0x1A2B ^ 0x0000), 1);
        assert_eq!(map.trace_at(0x3C4D ^ 0x0D15), 1);

        let mut reversed = CoverageMap::new();
        reversed.record(0x3C4D);
        reversed.record(0x1A2B);

        // 0x3C4D >> 1 == 0x1E26
        assert_eq!(reversed.trace_at(0x3C4D ^ 0x0000), 1);
        assert_eq!(reversed.trace_at(0x1A2B ^ 0x1E26), 1);
        assert_eq!(reversed.trace_at(0x3C4D ^ 0x0D15), 0);
    }

    #[test]
    fn class_indexes_match_documented_table() {
        let counts = [0u8, 1, 2, 3, 4, 7, 8, 15, 128];
        let expected = [0u8, 1, 2, 3, 4, 4, 5, 5, 8];
        for (count, class) in counts.iter().zip(expected.iter()) {
            assert_eq!(class_index(*count), *class, "count {count}");
        }
    }

    #[test]
    fn bucketize_is_idempotent_and_class_stable() {
        for count in 0..=255u8 {
            let once = bucketize(count);
            assert_eq!(bucketize(once), once, "count {count}");
            assert_eq!(class_index(once), class_index(count), "count {count}");
        }
        // Two counts in the same class are the same observation.
        assert_eq!(bucketize(5), bucketize(6));
        assert_ne!(bucketize(5), bucketize(10));
    }

    #[test]
    fn hit_counts_saturate() {
        let mut map = CoverageMap::new();
        for _ in 0..300 {
            map.record(0x1234);
            map.prev_block = 0;
        }
        assert_eq!(map.trace_at(0x1234), 255);
    }

    #[test]
    fn first_run_is_new_then_repeat_is_not() {
        let mut map = CoverageMap::new();
        map.record(0x1234);
        assert!(map.has_new_coverage());
        let cleared = map.promote().unwrap();
        assert!(cleared > 0);

        map.reset();
        map.record(0x1234);
        assert!(!map.has_new_coverage());
    }

    #[test]
    fn bucket_transition_4_to_5_is_not_new_but_7_to_8_is() {
        let mut map = CoverageMap::new();
        map.force_count(100, 4);
        map.promote().unwrap();

        map.reset();
        map.force_count(100, 5);
        assert!(!map.has_new_coverage());

        map.reset();
        map.force_count(100, 7);
        assert!(!map.has_new_coverage());

        map.reset();
        map.force_count(100, 8);
        assert!(map.has_new_coverage());
    }

    #[test]
    fn deeper_loops_register_as_new_coverage() {
        let mut map = CoverageMap::new();
        map.record(0x1234);
        map.promote().unwrap();

        map.reset();
        for _ in 0..10 {
            map.record(0x1234);
            map.prev_block = 0;
        }
        assert!(map.has_new_coverage());
    }

    #[test]
    fn virgin_map_is_monotone() {
        let mut map = CoverageMap::new();
        let mut previous: u32 = map.virgin.iter().map(|v| v.count_ones()).sum();
        for block in [0x1111u16, 0x2222, 0x3333, 0x1111, 0x2222] {
            map.reset();
            map.record(block);
            map.promote().unwrap();
            let now: u32 = map.virgin.iter().map(|v| v.count_ones()).sum();
            assert!(now <= previous);
            previous = now;
        }
    }

    #[test]
    fn last_slot_participates_in_new_coverage() {
        let mut map = CoverageMap::new();
        map.force_count(MAP_SIZE - 1, 1);
        assert!(map.has_new_coverage());
        map.promote().unwrap();

        map.reset();
        map.force_count(MAP_SIZE - 1, 1);
        assert!(!map.has_new_coverage());
    }

    #[test]
    fn digest_is_stable_within_a_bucket() {
        let mut map = CoverageMap::new();
        map.force_count(7, 5);
        let first = map.digest();

        map.reset();
        map.force_count(7, 6);
        assert_eq!(map.digest(), first);

        map.reset();
        map.force_count(7, 10);
        assert_ne!(map.digest(), first);
    }

    #[test]
    fn observed_behavior_capture_is_deterministic() {
        let result = ExecutionResult {
            exited_normally: true,
            exit_code: Some(0),
            signal: None,
            timed_out: false,
            stdout: b"hello world".to_vec(),
            stderr: Vec::new(),
            wall_time: std::time::Duration::from_millis(1),
        };

        let mut capture = ObservedBehaviorCapture;
        let mut first = CoverageMap::new();
        capture.capture(b"in", &result, &mut first);
        let mut second = CoverageMap::new();
        capture.capture(b"in", &result, &mut second);
        assert_eq!(first.digest(), second.digest());

        let changed = ExecutionResult {
            stdout: b"hello worle".to_vec(),
            ..result
        };
        let mut third = CoverageMap::new();
        capture.capture(b"in", &changed, &mut third);
        assert_ne!(first.digest(), third.digest());
    }
}
