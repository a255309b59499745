use crate::corpus::CorpusStore;
use crate::dictionary::Dictionary;
use crate::protocol::Protocol;
use rand::Rng;
use std::fmt;
use tracing::trace;

/// Interesting overwrite values per operand width, written little-endian
/// two's-complement. The usual off-by-one and sign-boundary suspects.
pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
pub const INTERESTING_16: [i16; 10] = [
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];
pub const INTERESTING_32: [i32; 8] = [
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

/// Largest magnitude for arithmetic mutations.
pub const ARITH_MAX: i64 = 35;

/// Bounds on the number of stacked havoc operations per call.
const HAVOC_MIN_OPS: u32 = 2;
const HAVOC_MAX_OPS: u32 = 256;
/// Havoc never grows an input beyond this multiple of its original size.
const HAVOC_GROWTH_CAP: usize = 10;

/// Multiplier step for adaptive strategy weights.
const WEIGHT_ALPHA: f64 = 0.1;
/// Weights never drop below this, so no strategy starves permanently.
const WEIGHT_FLOOR: f64 = 0.01;

/// The mutation stages the engine can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Deterministic,
    Havoc,
    Dictionary,
    Splice,
    ProtocolField,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Deterministic,
        Strategy::Havoc,
        Strategy::Dictionary,
        Strategy::Splice,
        Strategy::ProtocolField,
    ];

    fn index(self) -> usize {
        match self {
            Strategy::Deterministic => 0,
            Strategy::Havoc => 1,
            Strategy::Dictionary => 2,
            Strategy::Splice => 3,
            Strategy::ProtocolField => 4,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Deterministic => "deterministic",
            Strategy::Havoc => "havoc",
            Strategy::Dictionary => "dictionary",
            Strategy::Splice => "splice",
            Strategy::ProtocolField => "protocol_field",
        };
        f.write_str(name)
    }
}

/// Adaptive weight table over strategies.
///
/// Initially uniform. After each execution the driver reports whether the
/// strategy found new coverage; successes multiply the weight up by
/// `1 + alpha * success_rate`, failures shrink it by `1 - alpha *
/// (1 - success_rate)`. Weights are floored so a cold streak cannot starve a
/// strategy forever. Worker-local by construction.
pub struct StrategyWeights {
    weights: [f64; 5],
    uses: [u64; 5],
    successes: [u64; 5],
    enabled: [bool; 5],
}

impl StrategyWeights {
    pub fn new(protocol_enabled: bool) -> Self {
        let mut enabled = [true; 5];
        enabled[Strategy::ProtocolField.index()] = protocol_enabled;
        Self {
            weights: [1.0; 5],
            uses: [0; 5],
            successes: [0; 5],
            enabled,
        }
    }

    /// Weighted random draw over the enabled strategies.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Strategy {
        let total: f64 = Strategy::ALL
            .iter()
            .filter(|s| self.enabled[s.index()])
            .map(|s| self.weights[s.index()])
            .sum();
        let mut draw = rng.random_range(0.0..total);
        for strategy in Strategy::ALL {
            if !self.enabled[strategy.index()] {
                continue;
            }
            let weight = self.weights[strategy.index()];
            if draw < weight {
                return strategy;
            }
            draw -= weight;
        }
        Strategy::Havoc
    }

    /// Report the outcome of one execution that used `strategy`.
    pub fn observe(&mut self, strategy: Strategy, found_new_coverage: bool) {
        let i = strategy.index();
        self.uses[i] += 1;
        if found_new_coverage {
            self.successes[i] += 1;
        }
        let success_rate = self.successes[i] as f64 / self.uses[i] as f64;
        let factor = if found_new_coverage {
            1.0 + WEIGHT_ALPHA * success_rate
        } else {
            1.0 - WEIGHT_ALPHA * (1.0 - success_rate)
        };
        self.weights[i] = (self.weights[i] * factor).max(WEIGHT_FLOOR);
        trace!(strategy = %strategy, weight = self.weights[i], "updated strategy weight");
    }

    pub fn weight(&self, strategy: Strategy) -> f64 {
        self.weights[strategy.index()]
    }
}

/// The mutation engine: applies one stage per call.
///
/// `mutate` may return bytes of any length; the empty output arises only
/// from splice and is acceptable downstream. Any stage may degenerate into
/// returning the input unchanged, which is not an error.
pub struct MutationEngine {
    protocol: Option<Protocol>,
}

impl MutationEngine {
    pub fn new(protocol: Option<Protocol>) -> Self {
        Self { protocol }
    }

    pub fn protocol_enabled(&self) -> bool {
        self.protocol.is_some()
    }

    pub fn mutate<R: Rng + ?Sized>(
        &self,
        strategy: Strategy,
        input: &[u8],
        rng: &mut R,
        corpus: &CorpusStore,
        exclude_id: Option<&str>,
    ) -> Vec<u8> {
        match strategy {
            Strategy::Deterministic => deterministic_point(input, rng),
            Strategy::Havoc => havoc(input, rng),
            Strategy::Dictionary => {
                let class = self.protocol.as_ref().map(|p| p.token_class());
                if rng.random_bool(0.5) {
                    Dictionary::inject(input, rng, class)
                } else {
                    Dictionary::overwrite(input, rng, class)
                }
            }
            Strategy::Splice => match corpus.random(rng, exclude_id) {
                Some(other) => splice(input, &other.data, rng),
                None => input.to_vec(),
            },
            Strategy::ProtocolField => match &self.protocol {
                Some(protocol) => protocol.mutate_field(input, rng),
                None => input.to_vec(),
            },
        }
    }
}

// --- Deterministic stage ---------------------------------------------------
//
// The walk generators enumerate every mutation of their kind; the per-call
// entry point draws a single point from one of the walks.

/// Flip runs of `1`, `2`, or `4` consecutive bits at every bit position.
pub fn bit_flips(data: &[u8], flip_counts: &[u32]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let total_bits = data.len() * 8;
    for &count in flip_counts {
        let count = count as usize;
        if count == 0 || count > total_bits {
            continue;
        }
        for start in 0..=(total_bits - count) {
            let mut mutated = data.to_vec();
            for bit in start..start + count {
                mutated[bit / 8] ^= 0x80 >> (bit % 8);
            }
            out.push(mutated);
        }
    }
    out
}

/// XOR runs of `1`, `2`, or `4` consecutive bytes with `0xFF` at every byte
/// position.
pub fn byte_flips(data: &[u8], flip_sizes: &[usize]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for &size in flip_sizes {
        if size == 0 || size > data.len() {
            continue;
        }
        for start in 0..=(data.len() - size) {
            let mut mutated = data.to_vec();
            for byte in &mut mutated[start..start + size] {
                *byte ^= 0xFF;
            }
            out.push(mutated);
        }
    }
    out
}

/// Add each delta to the little-endian integer at every position, wrapping
/// within the operand width.
pub fn arithmetic(data: &[u8], deltas: &[i64], sizes: &[usize]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for &size in sizes {
        if size == 0 || size > data.len() {
            continue;
        }
        for start in 0..=(data.len() - size) {
            for &delta in deltas {
                out.push(apply_arith(data, start, size, delta));
            }
        }
    }
    out
}

fn apply_arith(data: &[u8], start: usize, size: usize, delta: i64) -> Vec<u8> {
    let mut mutated = data.to_vec();
    match size {
        1 => {
            let value = mutated[start].wrapping_add(delta as u8);
            mutated[start] = value;
        }
        2 => {
            let value = u16::from_le_bytes([mutated[start], mutated[start + 1]])
                .wrapping_add(delta as u16);
            mutated[start..start + 2].copy_from_slice(&value.to_le_bytes());
        }
        4 => {
            let value = u32::from_le_bytes([
                mutated[start],
                mutated[start + 1],
                mutated[start + 2],
                mutated[start + 3],
            ])
            .wrapping_add(delta as u32);
            mutated[start..start + 4].copy_from_slice(&value.to_le_bytes());
        }
        _ => {}
    }
    mutated
}

/// Overwrite each position with each width-appropriate interesting value.
pub fn interesting_values(data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for start in 0..data.len() {
        for value in INTERESTING_8 {
            let mut mutated = data.to_vec();
            mutated[start] = value as u8;
            out.push(mutated);
        }
    }
    if data.len() >= 2 {
        for start in 0..=(data.len() - 2) {
            for value in INTERESTING_16 {
                let mut mutated = data.to_vec();
                mutated[start..start + 2].copy_from_slice(&(value as u16).to_le_bytes());
                out.push(mutated);
            }
        }
    }
    if data.len() >= 4 {
        for start in 0..=(data.len() - 4) {
            for value in INTERESTING_32 {
                let mut mutated = data.to_vec();
                mutated[start..start + 4].copy_from_slice(&(value as u32).to_le_bytes());
                out.push(mutated);
            }
        }
    }
    out
}

/// One randomly chosen point mutation from the deterministic walks.
fn deterministic_point<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut mutated = data.to_vec();
    match rng.random_range(0..4u8) {
        0 => {
            let widths: Vec<usize> = [1usize, 2, 4]
                .into_iter()
                .filter(|&w| w <= data.len() * 8)
                .collect();
            let width = widths[rng.random_range(0..widths.len())];
            let bit = rng.random_range(0..=(data.len() * 8 - width));
            for b in bit..bit + width {
                mutated[b / 8] ^= 0x80 >> (b % 8);
            }
        }
        1 => {
            let widths: Vec<usize> = [1usize, 2, 4]
                .into_iter()
                .filter(|&w| w <= data.len())
                .collect();
            let width = widths[rng.random_range(0..widths.len())];
            let start = rng.random_range(0..=(data.len() - width));
            for byte in &mut mutated[start..start + width] {
                *byte ^= 0xFF;
            }
        }
        2 => {
            let widths: Vec<usize> = [1usize, 2, 4]
                .into_iter()
                .filter(|&w| w <= data.len())
                .collect();
            let width = widths[rng.random_range(0..widths.len())];
            let start = rng.random_range(0..=(data.len() - width));
            let mut delta = 0i64;
            while delta == 0 {
                delta = rng.random_range(-ARITH_MAX..=ARITH_MAX);
            }
            mutated = apply_arith(&mutated, start, width, delta);
        }
        _ => {
            let widths: Vec<usize> = [1usize, 2, 4]
                .into_iter()
                .filter(|&w| w <= data.len())
                .collect();
            let width = widths[rng.random_range(0..widths.len())];
            let start = rng.random_range(0..=(data.len() - width));
            match width {
                1 => {
                    mutated[start] =
                        INTERESTING_8[rng.random_range(0..INTERESTING_8.len())] as u8;
                }
                2 => {
                    let value =
                        INTERESTING_16[rng.random_range(0..INTERESTING_16.len())] as u16;
                    mutated[start..start + 2].copy_from_slice(&value.to_le_bytes());
                }
                _ => {
                    let value =
                        INTERESTING_32[rng.random_range(0..INTERESTING_32.len())] as u32;
                    mutated[start..start + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
    mutated
}

// --- Havoc stage -----------------------------------------------------------

/// Stack between 2 and 256 random small mutations on top of each other.
pub fn havoc<R: Rng + ?Sized>(data: &[u8], rng: &mut R) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = data.to_vec();
    let size_cap = data.len().saturating_mul(HAVOC_GROWTH_CAP).max(16);
    let ops = rng.random_range(HAVOC_MIN_OPS..=HAVOC_MAX_OPS);

    for _ in 0..ops {
        if out.is_empty() {
            out.push(rng.random());
            continue;
        }
        match rng.random_range(0..7u8) {
            // Single-bit flip.
            0 => {
                let bit = rng.random_range(0..out.len() * 8);
                out[bit / 8] ^= 0x80 >> (bit % 8);
            }
            // Single-byte flip.
            1 => {
                let pos = rng.random_range(0..out.len());
                out[pos] ^= 0xFF;
            }
            // Byte-level arithmetic.
            2 => {
                let pos = rng.random_range(0..out.len());
                let delta = rng.random_range(-ARITH_MAX..=ARITH_MAX);
                out[pos] = out[pos].wrapping_add(delta as u8);
            }
            // Interesting-value overwrite.
            3 => {
                let pos = rng.random_range(0..out.len());
                out[pos] = INTERESTING_8[rng.random_range(0..INTERESTING_8.len())] as u8;
            }
            // Delete a random chunk.
            4 => {
                if out.len() > 1 {
                    let start = rng.random_range(0..out.len());
                    let len = rng.random_range(1..=(out.len() - start).min(out.len() / 2 + 1));
                    out.drain(start..start + len);
                }
            }
            // Clone a random chunk to a random offset.
            5 => {
                if out.len() < size_cap {
                    let start = rng.random_range(0..out.len());
                    let len = rng.random_range(1..=(out.len() - start));
                    let chunk: Vec<u8> = out[start..start + len].to_vec();
                    let at = rng.random_range(0..=out.len());
                    out.splice(at..at, chunk);
                    if out.len() > size_cap {
                        out.truncate(size_cap);
                    }
                }
            }
            // Overwrite a random chunk with random bytes or a repeated byte.
            _ => {
                let start = rng.random_range(0..out.len());
                let len = rng.random_range(1..=(out.len() - start));
                if rng.random_bool(0.5) {
                    for byte in &mut out[start..start + len] {
                        *byte = rng.random();
                    }
                } else {
                    let fill: u8 = rng.random();
                    for byte in &mut out[start..start + len] {
                        *byte = fill;
                    }
                }
            }
        }
    }
    out
}

// --- Splice stage ----------------------------------------------------------

/// Concatenate a prefix of `input` with a suffix of `other` at random cut
/// points. Either side may contribute nothing, so the result can be shorter
/// than both parents or even empty.
pub fn splice<R: Rng + ?Sized>(input: &[u8], other: &[u8], rng: &mut R) -> Vec<u8> {
    if input.is_empty() || other.is_empty() {
        return input.to_vec();
    }
    if input.len() < 2 && other.len() < 2 {
        return input.to_vec();
    }
    let cut_a = rng.random_range(0..=input.len());
    let cut_b = rng.random_range(0..=other.len());
    let mut out = Vec::with_capacity(cut_a + (other.len() - cut_b));
    out.extend_from_slice(&input[..cut_a]);
    out.extend_from_slice(&other[cut_b..]);
    out
}
