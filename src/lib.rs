//! XOR filter for 64-bit keys that doubles as a perfect-hash index over its key set.
//!
//! The filter stores one fingerprint word per slot of a segmented array. Membership is
//! decided by XOR-ing the slots a key hashes to and comparing the result against the key's
//! own fingerprint. The same construction pass additionally encodes, for every key, the
//! segment it was peeled from; decoding that value at query time yields a slot in
//! `[0, len)` that is unique per key and stable for the lifetime of the index.
//! Construct one from a collection of unique keys with [`XorIndex::build`], or reuse
//! scratch memory across constructions through [`IndexBuilder`].

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::ops::{BitXor, BitXorAssign};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const MAX_SEGMENTS: usize = 8;
const DEFAULT_SEGMENTS: usize = 3;
const DEFAULT_MAX_ATTEMPTS: usize = 32;

const FNV_PRIME: u64 = 1_099_511_628_211;
const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
const LOW_36_MASK: u64 = 0xF_FFFF_FFFF;

/// Fingerprint word stored per slot.
///
/// Implemented for `u8`, `u16` and `u32`; the false-positive rate of a filter is roughly
/// `2^-BITS`. Each width monomorphizes the query path, so there is no dispatch overhead.
pub trait Fingerprint:
    Copy
    + Default
    + PartialEq
    + Eq
    + BitXor<Output = Self>
    + BitXorAssign
    + fmt::Debug
    + std::hash::Hash
    + Send
    + Sync
    + 'static
{
    /// Width of the stored word in bits.
    const BITS: u32;

    /// Narrows a mixed 64-bit hash into a fingerprint word.
    fn from_hash(hash: u64) -> Self;
}

impl Fingerprint for u8 {
    const BITS: u32 = 8;

    #[inline]
    fn from_hash(hash: u64) -> Self {
        (hash ^ (hash >> 32)) as u8
    }
}

impl Fingerprint for u16 {
    const BITS: u32 = 16;

    #[inline]
    fn from_hash(hash: u64) -> Self {
        (hash ^ (hash >> 32)) as u16
    }
}

impl Fingerprint for u32 {
    const BITS: u32 = 32;

    #[inline]
    fn from_hash(hash: u64) -> Self {
        (hash ^ (hash >> 32)) as u32
    }
}

/// Error returned when construction of an index fails.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// The provided configuration values are invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Peeling failed on every permitted attempt. Retrying with a different seed or a
    /// larger attempt budget usually succeeds; a key set with duplicates never will.
    #[error("construction failed after {attempts} peeling attempts")]
    BudgetExceeded {
        /// Number of attempts consumed before giving up.
        attempts: usize,
    },
}

/// Configuration options for building an [`XorIndex`].
#[derive(Clone, Copy, Debug)]
pub struct IndexConfig {
    /// Number of hash segments (between 2 and 8). Three is the studied operating point.
    pub segments: usize,
    /// Seed used for hashing. `None` derives a seed from the system clock.
    pub seed: Option<u64>,
    /// Maximum number of peeling attempts before construction gives up.
    pub max_attempts: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            segments: DEFAULT_SEGMENTS,
            seed: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Output of building an [`XorIndex`].
#[derive(Debug)]
pub struct BuildOutput<F = u8>
where
    F: Fingerprint,
{
    pub index: XorIndex<F>,
    /// Number of peeling attempts consumed, including the successful one.
    pub attempts: usize,
    pub total_slots: usize,
    /// Ratio of slots to keys.
    pub actual_overhead: f64,
}

/// Build output specialized for 8-bit fingerprints.
pub type BuildOutput8 = BuildOutput<u8>;
/// Build output specialized for 16-bit fingerprints.
pub type BuildOutput16 = BuildOutput<u16>;
/// Build output specialized for 32-bit fingerprints.
pub type BuildOutput32 = BuildOutput<u32>;

/// A static XOR filter over 64-bit keys that also assigns each key a unique slot.
///
/// The artifact is immutable after construction and holds only plain arrays, so any number
/// of threads may query it concurrently without synchronization.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug)]
pub struct XorIndex<F = u8>
where
    F: Fingerprint,
{
    seed: u64,
    segments: usize,
    segment_length: usize,
    fingerprints: Vec<F>,
    origin_tags: Vec<u8>,
}

/// Index using 8-bit fingerprints.
pub type XorIndex8 = XorIndex<u8>;
/// Index using 16-bit fingerprints.
pub type XorIndex16 = XorIndex<u16>;
/// Index using 32-bit fingerprints.
pub type XorIndex32 = XorIndex<u32>;

impl<F> XorIndex<F>
where
    F: Fingerprint,
{
    /// Returns true when `key` is (probably) in the set.
    /// Returns false when `key` is definitely not in the set.
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        if self.fingerprints.is_empty() {
            return false;
        }

        let hash = mix64(key ^ self.seed);
        let mut acc = F::from_hash(hash);
        for segment in 0..self.segments {
            let slot = segment * self.segment_length
                + segment_slot(hash, segment, self.segments, self.segment_length);
            acc ^= self.fingerprints[slot];
        }
        acc == F::default()
    }

    /// Returns the slot assigned to `key`, unique across the keys the index was built from.
    ///
    /// `None` means the key is definitely not in the set, or that a non-member failed the
    /// origin decode. A non-member whose fingerprint collides can still resolve to some
    /// member's slot; callers needing certainty must compare the payload stored at the
    /// returned slot against the key.
    #[inline]
    pub fn index_of(&self, key: u64) -> Option<usize> {
        if self.fingerprints.is_empty() {
            return None;
        }

        let hash = mix64(key ^ self.seed);
        let mut acc = F::from_hash(hash);
        let mut tag = 0u8;
        for segment in 0..self.segments {
            let slot = segment * self.segment_length
                + segment_slot(hash, segment, self.segments, self.segment_length);
            acc ^= self.fingerprints[slot];
            tag ^= self.origin_tags[slot];
        }
        if acc != F::default() {
            return None;
        }

        let origin = tag as usize;
        if origin >= self.segments {
            return None;
        }
        Some(origin * self.segment_length
            + segment_slot(hash, origin, self.segments, self.segment_length))
    }

    /// Returns the number of slots in the index.
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    /// Returns true when the index holds no slots.
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Returns the seed the index hashes with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns the number of hash segments.
    pub fn segments(&self) -> usize {
        self.segments
    }

    /// Returns the number of slots per segment.
    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    /// Raw fingerprint words, for external serialization.
    pub fn fingerprints(&self) -> &[F] {
        &self.fingerprints
    }

    /// Raw origin-tag bytes, for external serialization.
    ///
    /// The XOR of the bytes at a member key's slots decodes to the segment the key was
    /// peeled from; individual bytes carry no meaning on their own.
    pub fn origin_tags(&self) -> &[u8] {
        &self.origin_tags
    }

    /// Returns the number of bytes used to store the fingerprints.
    pub fn fingerprint_bytes(&self) -> usize {
        self.fingerprints.len() * mem::size_of::<F>()
    }

    /// Returns the total number of bytes held by the artifact.
    pub fn byte_size(&self) -> usize {
        self.fingerprint_bytes() + self.origin_tags.len()
    }

    fn empty(segments: usize) -> Self {
        Self {
            seed: 0,
            segments,
            segment_length: 0,
            fingerprints: Vec::new(),
            origin_tags: Vec::new(),
        }
    }
}

impl XorIndex {
    /// Builds an 8-bit fingerprint index from the provided set of unique keys.
    ///
    /// The keys must be unique; duplicates are not detected and produce an index that
    /// fails construction or answers queries incorrectly.
    pub fn build(keys: &[u64]) -> Result<BuildOutput8, BuildError> {
        Self::build_with_config(keys, &IndexConfig::default())
    }

    /// Builds an 8-bit fingerprint index using the supplied configuration.
    pub fn build_with_config(
        keys: &[u64],
        config: &IndexConfig,
    ) -> Result<BuildOutput8, BuildError> {
        IndexBuilder::new().build(keys, config)
    }

    /// Builds a 16-bit fingerprint index from the provided set of unique keys.
    pub fn build_16(keys: &[u64]) -> Result<BuildOutput16, BuildError> {
        Self::build_16_with_config(keys, &IndexConfig::default())
    }

    /// Builds a 16-bit fingerprint index using the supplied configuration.
    pub fn build_16_with_config(
        keys: &[u64],
        config: &IndexConfig,
    ) -> Result<BuildOutput16, BuildError> {
        IndexBuilder::new().build(keys, config)
    }

    /// Builds a 32-bit fingerprint index from the provided set of unique keys.
    pub fn build_32(keys: &[u64]) -> Result<BuildOutput32, BuildError> {
        Self::build_32_with_config(keys, &IndexConfig::default())
    }

    /// Builds a 32-bit fingerprint index using the supplied configuration.
    pub fn build_32_with_config(
        keys: &[u64],
        config: &IndexConfig,
    ) -> Result<BuildOutput32, BuildError> {
        IndexBuilder::new().build(keys, config)
    }
}

#[derive(Clone, Copy, Default)]
struct SlotState {
    count: u16,
    mask: u64,
}

#[derive(Clone, Copy)]
struct PeelEntry {
    hash: u64,
    slot: u32,
}

/// Reusable construction state.
///
/// The peeling pass needs scratch proportional to the key count; keeping one builder
/// around amortizes those allocations across constructions. Scratch grows on demand when a
/// build needs more slots than any earlier one and can be released with
/// [`IndexBuilder::clear`].
pub struct IndexBuilder {
    counters: Vec<SlotState>,
    queues: Vec<VecDeque<PeelEntry>>,
    stack: Vec<PeelEntry>,
}

impl IndexBuilder {
    /// Creates a builder with no scratch allocated.
    pub fn new() -> Self {
        Self {
            counters: Vec::new(),
            queues: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Creates a builder with scratch sized for `expected_keys` keys.
    pub fn with_capacity(expected_keys: usize, segments: usize) -> Self {
        let segments = segments.clamp(2, MAX_SEGMENTS);
        let slots = array_length(expected_keys, segments);
        let mut builder = Self::new();
        builder.reserve(segments, slots / segments, expected_keys);
        builder
    }

    /// Releases all scratch memory. The builder stays usable.
    pub fn clear(&mut self) {
        self.counters = Vec::new();
        self.queues = Vec::new();
        self.stack = Vec::new();
    }

    /// Builds an index over `keys` using the supplied configuration.
    ///
    /// The keys must be unique; duplicates are not detected and produce an index that
    /// fails construction or answers queries incorrectly.
    pub fn build<F>(&mut self, keys: &[u64], config: &IndexConfig) -> Result<BuildOutput<F>, BuildError>
    where
        F: Fingerprint,
    {
        validate_config(config)?;
        if keys.is_empty() {
            return Err(BuildError::InvalidConfig("key set must not be empty"));
        }

        let segments = config.segments;
        let total_slots = array_length(keys.len(), segments);
        if total_slots > u32::MAX as usize {
            return Err(BuildError::InvalidConfig(
                "key set too large for 32-bit slot addressing",
            ));
        }
        let segment_length = total_slots / segments;
        self.reserve(segments, segment_length, keys.len());

        let mut seed = config.seed.unwrap_or_else(clock_seed);
        for attempt in 1..=config.max_attempts {
            seed = mix64(seed);
            self.reset(segments, segment_length);

            for &key in keys {
                let hash = mix64(key ^ seed);
                for segment in 0..segments {
                    let slot = segment * segment_length
                        + segment_slot(hash, segment, segments, segment_length);
                    let state = &mut self.counters[slot];
                    state.count = state.count.saturating_add(1);
                    state.mask ^= hash;
                }
            }

            for segment in 0..segments {
                for local in 0..segment_length {
                    let state = self.counters[segment * segment_length + local];
                    if state.count == 1 {
                        self.queues[segment].push_back(PeelEntry {
                            hash: state.mask,
                            slot: local as u32,
                        });
                    }
                }
            }

            while self.queues[..segments].iter().any(|queue| !queue.is_empty()) {
                for segment in 0..segments {
                    while let Some(entry) = self.queues[segment].pop_front() {
                        let local = entry.slot as usize;
                        if self.counters[segment * segment_length + local].count == 0 {
                            continue;
                        }

                        let hash = entry.hash;
                        self.stack.push(PeelEntry {
                            hash,
                            slot: (segment * segment_length + local) as u32,
                        });
                        for other in 0..segments {
                            if other == segment {
                                continue;
                            }
                            let other_local = segment_slot(hash, other, segments, segment_length);
                            let state = &mut self.counters[other * segment_length + other_local];
                            if state.count == 0 {
                                continue;
                            }
                            state.count -= 1;
                            state.mask ^= hash;
                            if state.count == 1 {
                                self.queues[other].push_back(PeelEntry {
                                    hash: state.mask,
                                    slot: other_local as u32,
                                });
                            }
                        }
                    }
                }
            }

            if self.stack.len() == keys.len() {
                debug!(attempt, slots = total_slots, "peeling succeeded");
                let index = self.encode(seed, segments, segment_length, total_slots);
                return Ok(BuildOutput {
                    index,
                    attempts: attempt,
                    total_slots,
                    actual_overhead: total_slots as f64 / keys.len() as f64,
                });
            }
            debug!(
                attempt,
                peeled = self.stack.len(),
                keys = keys.len(),
                "peeling attempt failed; rehashing seed"
            );
        }

        Err(BuildError::BudgetExceeded {
            attempts: config.max_attempts,
        })
    }

    fn encode<F>(
        &mut self,
        seed: u64,
        segments: usize,
        segment_length: usize,
        total_slots: usize,
    ) -> XorIndex<F>
    where
        F: Fingerprint,
    {
        let mut fingerprints = vec![F::default(); total_slots];
        let mut origin_tags = vec![0u8; total_slots];

        // Popping the stack visits keys in reverse peel order: every other slot a key
        // touches either holds its final value already or still holds the XOR-neutral zero.
        while let Some(entry) = self.stack.pop() {
            let hash = entry.hash;
            let primary = entry.slot as usize;
            let origin = primary / segment_length;

            let mut fingerprint = F::from_hash(hash);
            let mut tag = origin as u8;
            for other in 0..segments {
                if other == origin {
                    continue;
                }
                let slot = other * segment_length
                    + segment_slot(hash, other, segments, segment_length);
                fingerprint ^= fingerprints[slot];
                tag ^= origin_tags[slot];
            }
            fingerprints[primary] = fingerprint;
            origin_tags[primary] = tag;
        }

        XorIndex {
            seed,
            segments,
            segment_length,
            fingerprints,
            origin_tags,
        }
    }

    fn reserve(&mut self, segments: usize, segment_length: usize, key_count: usize) {
        let slots = segments * segment_length;
        if self.counters.len() < slots {
            self.counters.resize(slots, SlotState::default());
        }
        if self.queues.len() < segments {
            self.queues.resize_with(segments, VecDeque::new);
        }
        self.stack.reserve(key_count.saturating_sub(self.stack.capacity()));
    }

    fn reset(&mut self, segments: usize, segment_length: usize) {
        for state in &mut self.counters[..segments * segment_length] {
            *state = SlotState::default();
        }
        for queue in &mut self.queues[..segments] {
            queue.clear();
        }
        self.stack.clear();
    }
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for partitioned construction.
#[derive(Clone, Copy, Debug)]
pub struct PartitionConfig {
    /// Base configuration used for each partition.
    pub base: IndexConfig,
    /// Desired average number of keys per partition (must be greater than 0).
    pub target_partition_size: usize,
    /// Seed used to assign keys to partitions.
    pub partition_seed: u64,
    /// Maximum number of worker threads used during construction (0 = auto).
    pub max_threads: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            base: IndexConfig::default(),
            target_partition_size: 100_000,
            partition_seed: 0xD4E9_CB4D_EF64_9B27,
            max_threads: 0,
        }
    }
}

impl PartitionConfig {
    fn partition_count(&self, key_count: usize) -> usize {
        if key_count == 0 {
            1
        } else {
            let count = (key_count + self.target_partition_size - 1) / self.target_partition_size;
            count.max(1)
        }
    }
}

/// Summary statistics for an individual partition.
pub struct PartitionStats {
    pub key_count: usize,
    pub attempts: usize,
    pub total_slots: usize,
    pub actual_overhead: f64,
}

/// Output of building a [`PartitionedXorIndex`].
pub struct PartitionedBuildOutput<F = u8>
where
    F: Fingerprint,
{
    pub index: PartitionedXorIndex<F>,
    pub partition_stats: Vec<PartitionStats>,
    pub total_slots: usize,
    pub total_bytes: usize,
    pub bytes_per_key: f64,
}

/// A collection of independent sub-indexes over a hash partition of the key set.
///
/// Partitioning bounds per-construction scratch and lets partitions build in parallel;
/// slots are offset per partition, so [`PartitionedXorIndex::index_of`] stays globally
/// unique across the whole key set.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug)]
pub struct PartitionedXorIndex<F = u8>
where
    F: Fingerprint,
{
    partition_seed: u64,
    parts: Vec<XorIndex<F>>,
    offsets: Vec<usize>,
    total_slots: usize,
}

impl<F> PartitionedXorIndex<F>
where
    F: Fingerprint,
{
    /// Builds a partitioned index over `keys` using the supplied configuration.
    pub fn build_with_config(
        keys: &[u64],
        config: &PartitionConfig,
    ) -> Result<PartitionedBuildOutput<F>, BuildError> {
        build_partitioned_generic(keys, config)
    }

    /// Returns true when `key` is (probably) in the set.
    /// Returns false when `key` is definitely not in the set.
    pub fn contains(&self, key: u64) -> bool {
        if self.parts.is_empty() {
            return false;
        }
        self.parts[self.route(key)].contains(key)
    }

    /// Returns the globally unique slot assigned to `key`, offset by its partition.
    pub fn index_of(&self, key: u64) -> Option<usize> {
        if self.parts.is_empty() {
            return None;
        }
        let partition = self.route(key);
        self.parts[partition]
            .index_of(key)
            .map(|slot| self.offsets[partition] + slot)
    }

    /// Returns the total number of slots across all partitions.
    pub fn len(&self) -> usize {
        self.total_slots
    }

    /// Returns true when no partition holds any slots.
    pub fn is_empty(&self) -> bool {
        self.total_slots == 0
    }

    /// Returns the number of partitions.
    pub fn partition_count(&self) -> usize {
        self.parts.len()
    }

    /// Returns the seed used for partitioning.
    pub fn partition_seed(&self) -> u64 {
        self.partition_seed
    }

    /// Returns the sub-index for each partition.
    pub fn partitions(&self) -> &[XorIndex<F>] {
        &self.parts
    }

    fn route(&self, key: u64) -> usize {
        if self.parts.len() == 1 {
            0
        } else {
            (mix64(key ^ self.partition_seed) % self.parts.len() as u64) as usize
        }
    }
}

impl PartitionedXorIndex {
    /// Builds a partitioned 8-bit fingerprint index using the default configuration.
    pub fn build(keys: &[u64]) -> Result<PartitionedBuildOutput<u8>, BuildError> {
        Self::build_with_config(keys, &PartitionConfig::default())
    }
}

fn build_partitioned_generic<F>(
    keys: &[u64],
    config: &PartitionConfig,
) -> Result<PartitionedBuildOutput<F>, BuildError>
where
    F: Fingerprint,
{
    validate_config(&config.base)?;
    if config.target_partition_size == 0 {
        return Err(BuildError::InvalidConfig(
            "target_partition_size must be greater than 0",
        ));
    }

    let partition_count = config.partition_count(keys.len());
    let mut raw_partitions: Vec<Vec<u64>> = Vec::with_capacity(partition_count);
    raw_partitions.resize_with(partition_count, Vec::new);

    for &key in keys {
        let idx = if partition_count == 1 {
            0
        } else {
            (mix64(key ^ config.partition_seed) % partition_count as u64) as usize
        };
        raw_partitions[idx].push(key);
    }

    let worker_count = if config.max_threads == 0 {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        config.max_threads
    };

    let base = config.base;
    let process = || -> Result<Vec<(XorIndex<F>, PartitionStats)>, BuildError> {
        raw_partitions
            .into_par_iter()
            .enumerate()
            .map(|(partition, partition_keys)| {
                if partition_keys.is_empty() {
                    return Ok((
                        XorIndex::empty(base.segments),
                        PartitionStats {
                            key_count: 0,
                            attempts: 0,
                            total_slots: 0,
                            actual_overhead: 0.0,
                        },
                    ));
                }
                let part_config = IndexConfig {
                    seed: base
                        .seed
                        .map(|seed| seed ^ (partition as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
                    ..base
                };
                let built = IndexBuilder::new().build::<F>(&partition_keys, &part_config)?;
                let stats = PartitionStats {
                    key_count: partition_keys.len(),
                    attempts: built.attempts,
                    total_slots: built.total_slots,
                    actual_overhead: built.actual_overhead,
                };
                Ok((built.index, stats))
            })
            .collect()
    };

    let results = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count)
        .build()
        .map_err(|_| BuildError::InvalidConfig("failed to create thread pool"))?
        .install(process)?;

    let mut parts = Vec::with_capacity(results.len());
    let mut partition_stats = Vec::with_capacity(results.len());
    let mut offsets = Vec::with_capacity(results.len());
    let mut total_slots = 0usize;
    let mut total_bytes = 0usize;

    for (part, stats) in results {
        offsets.push(total_slots);
        total_slots += part.len();
        total_bytes += part.byte_size();
        parts.push(part);
        partition_stats.push(stats);
    }

    let bytes_per_key = if keys.is_empty() {
        0.0
    } else {
        total_bytes as f64 / keys.len() as f64
    };

    Ok(PartitionedBuildOutput {
        index: PartitionedXorIndex {
            partition_seed: config.partition_seed,
            parts,
            offsets,
            total_slots,
        },
        partition_stats,
        total_slots,
        total_bytes,
        bytes_per_key,
    })
}

fn validate_config(config: &IndexConfig) -> Result<(), BuildError> {
    if !(2..=MAX_SEGMENTS).contains(&config.segments) {
        return Err(BuildError::InvalidConfig(
            "segments must be between 2 and 8",
        ));
    }
    if config.max_attempts == 0 {
        return Err(BuildError::InvalidConfig(
            "max_attempts must be at least 1",
        ));
    }
    Ok(())
}

/// Returns the slot-array length for `key_count` keys over `segments` segments.
///
/// The result is the smallest multiple of `segments` at or above
/// `32 + ceil(1.23 * key_count)`; the factor and floor keep peeling success probability
/// high per attempt.
pub fn array_length(key_count: usize, segments: usize) -> usize {
    let target = 32 + (key_count as f64 * 1.23).ceil() as usize;
    (target + segments - 1) / segments * segments
}

#[inline]
fn segment_slot(hash: u64, segment: usize, segments: usize, segment_length: usize) -> usize {
    let rotation = ((segment * 64 + segments / 2) / segments) as u32;
    fastrange(hash.rotate_left(rotation), segment_length)
}

#[inline]
fn fastrange(hash: u64, len: usize) -> usize {
    (((hash & 0xFFFF_FFFF) * len as u64) >> 32) as usize
}

/// Scrambles a 64-bit value with two XOR-then-multiply rounds over an FNV prime.
///
/// This is the hash the index stores its seed for; external payload layers that persist an
/// index must hash with the same function.
#[inline]
pub fn mix64(value: u64) -> u64 {
    let mut hash = FNV_OFFSET;
    hash = (hash ^ (value & LOW_36_MASK)).wrapping_mul(FNV_PRIME);
    hash = (hash ^ (value >> 32)).wrapping_mul(FNV_PRIME);
    hash
}

fn clock_seed() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    mix64(now as u64 ^ (now >> 32) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn fixed_config(seed: u64) -> IndexConfig {
        IndexConfig {
            seed: Some(seed),
            ..IndexConfig::default()
        }
    }

    fn random_keys(count: usize, rng_seed: u64) -> Vec<u64> {
        let mut rng = SmallRng::seed_from_u64(rng_seed);
        let mut seen = HashSet::with_capacity(count);
        let mut keys = Vec::with_capacity(count);
        while keys.len() < count {
            let key = rng.gen::<u64>();
            if seen.insert(key) {
                keys.push(key);
            }
        }
        keys
    }

    #[test]
    fn members_always_contained() {
        let keys: Vec<u64> = (0..10_000u64).map(|i| i.wrapping_mul(13_791)).collect();
        let built = XorIndex::build_with_config(&keys, &fixed_config(0xA1B2))
            .expect("index should build");
        for &key in &keys {
            assert!(built.index.contains(key), "missing key: {key}");
        }
    }

    #[test]
    fn sequential_keys_index_and_size() {
        let keys: Vec<u64> = (1..=1000).collect();
        let built =
            XorIndex::build_32_with_config(&keys, &fixed_config(0xFEED)).expect("index should build");
        assert_eq!(built.index.len(), 1263);
        assert_eq!(built.total_slots, 1263);

        let mut slots = HashSet::new();
        for &key in &keys {
            assert!(built.index.contains(key), "missing key: {key}");
            let slot = built.index.index_of(key).expect("member key must resolve");
            assert!(slot < built.index.len());
            slots.insert(slot);
        }
        assert_eq!(slots.len(), keys.len());
    }

    #[test]
    fn index_is_injective_over_members() {
        let keys = random_keys(10_000, 7);
        let built =
            XorIndex::build_with_config(&keys, &fixed_config(0xC0DE)).expect("index should build");
        let mut slots = HashSet::with_capacity(keys.len());
        for &key in &keys {
            let slot = built.index.index_of(key).expect("member key must resolve");
            assert!(slot < built.index.len(), "slot {slot} out of range");
            assert!(slots.insert(slot), "slot {slot} assigned twice");
        }
    }

    #[test]
    fn payload_round_trip() {
        let keys = random_keys(4_096, 11);
        let built =
            XorIndex::build_32_with_config(&keys, &fixed_config(0xBEEF)).expect("index should build");
        let index = built.index;

        let mut payloads = vec![0u64; index.len()];
        for &key in &keys {
            payloads[index.index_of(key).expect("member key must resolve")] = key;
        }
        for &key in &keys {
            assert_eq!(
                payloads[index.index_of(key).expect("member key must resolve")],
                key
            );
        }
    }

    #[test]
    fn false_positive_rate_bounded_u8() {
        let keys = random_keys(10_000, 13);
        let members: HashSet<u64> = keys.iter().copied().collect();
        let built =
            XorIndex::build_with_config(&keys, &fixed_config(0xF00D)).expect("index should build");

        let probes = 100_000;
        let mut rng = SmallRng::seed_from_u64(99);
        let mut probed = 0;
        let mut hits = 0;
        while probed < probes {
            let key = rng.gen::<u64>();
            if members.contains(&key) {
                continue;
            }
            probed += 1;
            if built.index.contains(key) {
                hits += 1;
            }
        }

        // Expect about probes / 256; the band is half to quadruple the nominal rate.
        assert!(
            hits >= probes / 512 && hits <= probes / 128,
            "false-positive count {hits} outside expected band"
        );
    }

    #[test]
    fn nonmember_index_lookups_mostly_miss() {
        let keys = random_keys(1_000, 21);
        let members: HashSet<u64> = keys.iter().copied().collect();
        let built =
            XorIndex::build_32_with_config(&keys, &fixed_config(5)).expect("index should build");
        for &key in &keys {
            assert!(built.index.index_of(key).is_some(), "missing key: {key}");
        }

        let mut rng = SmallRng::seed_from_u64(22);
        let mut probed = 0;
        let mut false_hits = 0;
        while probed < 1_000 {
            let key = rng.gen::<u64>();
            if members.contains(&key) {
                continue;
            }
            probed += 1;
            if built.index.index_of(key).is_some() {
                false_hits += 1;
            }
        }
        assert!(false_hits <= 2, "too many colliding lookups: {false_hits}");
    }

    #[test]
    fn deterministic_given_seed() {
        let keys: Vec<u64> = (1..=1000).collect();
        let first = XorIndex::build_32_with_config(&keys, &fixed_config(0x12345))
            .expect("index should build")
            .index;
        let second = XorIndex::build_32_with_config(&keys, &fixed_config(0x12345))
            .expect("index should build")
            .index;

        assert_eq!(first.seed(), second.seed());
        assert_eq!(first.fingerprints(), second.fingerprints());
        assert_eq!(first.origin_tags(), second.origin_tags());
    }

    #[test]
    fn single_key_index() {
        let key = 0xDECAF_u64;
        let built =
            XorIndex::build_32_with_config(&[key], &fixed_config(3)).expect("index should build");
        assert!(built.index.contains(key));
        let slot = built.index.index_of(key).expect("member key must resolve");
        assert!(slot < built.index.len());
        assert!(!built.index.contains(key ^ 1));
        assert!(built.index.index_of(key ^ 1).is_none());
    }

    #[test]
    fn sixteen_bit_index_builds() {
        let keys = random_keys(4_096, 17);
        let built = XorIndex::build_16_with_config(&keys, &fixed_config(0xACE))
            .expect("16-bit index should build");
        let mut slots = HashSet::with_capacity(keys.len());
        for &key in &keys {
            assert!(built.index.contains(key), "missing key: {key}");
            assert!(slots.insert(built.index.index_of(key).expect("member key must resolve")));
        }
    }

    #[test]
    fn sizing_formula() {
        assert_eq!(array_length(1000, 3), 1263);
        for &(count, segments) in &[(1usize, 3usize), (100, 3), (5_000, 3), (1_000, 2), (1_000, 4)] {
            let slots = array_length(count, segments);
            assert_eq!(slots % segments, 0);
            assert!(slots >= 32 + (count as f64 * 1.23).ceil() as usize);
        }
    }

    #[test]
    fn invalid_segment_count_rejected() {
        let config = IndexConfig {
            segments: 1,
            ..IndexConfig::default()
        };
        let err = XorIndex::build_with_config(&[1, 2, 3], &config).unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig(_)));
    }

    #[test]
    fn empty_key_set_rejected() {
        let err = XorIndex::build(&[]).unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig(_)));
    }

    #[test]
    fn zero_attempt_budget_rejected() {
        let config = IndexConfig {
            max_attempts: 0,
            ..IndexConfig::default()
        };
        let err = XorIndex::build_with_config(&[1, 2, 3], &config).unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig(_)));
    }

    #[test]
    fn retry_budget_exhausted() {
        // Identical keys hash to identical slots, so no slot ever becomes a singleton and
        // every peeling attempt stalls.
        let keys = vec![41_u64; 8];
        let config = IndexConfig {
            seed: Some(1),
            max_attempts: 1,
            ..IndexConfig::default()
        };
        let err = XorIndex::build_with_config(&keys, &config).unwrap_err();
        assert_eq!(err, BuildError::BudgetExceeded { attempts: 1 });
    }

    #[test]
    fn builder_reuse_grows_scratch() {
        let mut builder = IndexBuilder::new();

        let small = random_keys(500, 31);
        let first = builder
            .build::<u8>(&small, &fixed_config(1))
            .expect("small index should build");
        for &key in &small {
            assert!(first.index.contains(key), "missing key: {key}");
        }

        let large = random_keys(20_000, 32);
        let second = builder
            .build::<u8>(&large, &fixed_config(2))
            .expect("large index should build");
        let mut slots = HashSet::with_capacity(large.len());
        for &key in &large {
            assert!(second.index.contains(key), "missing key: {key}");
            assert!(slots.insert(second.index.index_of(key).expect("member key must resolve")));
        }

        builder.clear();
        let third = builder
            .build::<u8>(&small, &fixed_config(1))
            .expect("index should build after clear");
        assert_eq!(third.index.fingerprints(), first.index.fingerprints());
    }

    #[test]
    fn partitioned_index_no_false_negatives() {
        let keys = random_keys(20_000, 41);
        let config = PartitionConfig {
            base: fixed_config(9),
            target_partition_size: 3_000,
            partition_seed: 0x8C4E_FB5A_9D21_7C33,
            max_threads: 0,
        };
        let built = PartitionedXorIndex::<u8>::build_with_config(&keys, &config)
            .expect("partitioned index should build");
        assert_eq!(built.partition_stats.len(), 7);
        assert_eq!(
            built.partition_stats.iter().map(|s| s.key_count).sum::<usize>(),
            keys.len()
        );
        for &key in &keys {
            assert!(built.index.contains(key), "missing key: {key}");
        }
    }

    #[test]
    fn partitioned_index_slots_globally_unique() {
        let keys = random_keys(20_000, 43);
        let config = PartitionConfig {
            base: fixed_config(15),
            target_partition_size: 4_000,
            max_threads: 2,
            ..PartitionConfig::default()
        };
        let built = PartitionedXorIndex::<u16>::build_with_config(&keys, &config)
            .expect("partitioned index should build");
        let index = built.index;

        let mut slots = HashSet::with_capacity(keys.len());
        for &key in &keys {
            let slot = index.index_of(key).expect("member key must resolve");
            assert!(slot < index.len(), "slot {slot} out of range");
            assert!(slots.insert(slot), "slot {slot} assigned twice");
        }
    }

    #[test]
    fn sparse_partitions_tolerated() {
        let keys = random_keys(5, 47);
        let config = PartitionConfig {
            base: fixed_config(7),
            target_partition_size: 1,
            ..PartitionConfig::default()
        };
        let built = PartitionedXorIndex::<u8>::build_with_config(&keys, &config)
            .expect("sparse partitioned index should build");
        assert_eq!(built.index.partition_count(), 5);
        for &key in &keys {
            assert!(built.index.contains(key), "missing key: {key}");
            assert!(built.index.index_of(key).is_some());
        }
    }
}
