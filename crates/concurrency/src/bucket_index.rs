//! `BucketIndexedList<T>` — an array of [`AppendAtomicList`]s, each
//! summarized by a Bloom-style filter and a `min`/`max` range over an
//! integer key, so a probe for one key can skip buckets that provably don't
//! contain it (C6).
//!
//! The transaction layer's shadow history uses this to index shadow buffers
//! by address: `bucket = hash(segment, offset / bucket_span) % num_buckets`,
//! `key = FarAddress::raw()`. A conflict probe only has to walk the buckets
//! that region's byte range actually touches.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::append_list::AppendAtomicList;

/// One bucket: a lock-free list plus its admission summary.
struct Bucket<T> {
    list: AppendAtomicList<T>,
    filter: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl<T> Bucket<T> {
    fn new() -> Self {
        Bucket {
            list: AppendAtomicList::new(),
            filter: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    fn admits(&self, key: u64) -> bool {
        let mask = bloom_mask(key);
        if self.filter.load(Ordering::Acquire) & mask != mask {
            return false;
        }
        let min = self.min.load(Ordering::Acquire);
        let max = self.max.load(Ordering::Acquire);
        min <= key && key <= max
    }
}

/// Number of independent hash functions folded into the 64-bit Bloom word.
/// Four keeps the per-bucket false-positive rate low as long as buckets
/// hold a few dozen entries at most — the transaction layer picks
/// `num_buckets` so that holds under realistic region-conflict load.
const BLOOM_HASHES: usize = 4;

fn bloom_mask(key: u64) -> u64 {
    let mut mask = 0u64;
    let mut h = key;
    for i in 0..BLOOM_HASHES {
        h = splitmix64(h ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        mask |= 1u64 << (h % 64);
    }
    mask
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Atomically move `atomic` toward the extremum picked by `less`: if
/// `less(new_value, atomic.load())`, keeps retrying the CAS until either it
/// wins or a concurrent winner already got `atomic` at least as far.
///
/// `less = |a, b| a < b` drives `atomic` toward a running minimum;
/// `less = |a, b| a > b` drives it toward a running maximum.
pub fn cas_extremum(atomic: &AtomicU64, new_value: u64, less: impl Fn(u64, u64) -> bool) {
    let mut current = atomic.load(Ordering::Relaxed);
    while less(new_value, current) {
        match atomic.compare_exchange_weak(current, new_value, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// A fixed array of lock-free lists indexed by bucket, each carrying a
/// Bloom filter and `min`/`max` summary of an integer key so
/// [`Self::indexed_for_each`] can skip buckets that can't possibly contain
/// a given key.
pub struct BucketIndexedList<T> {
    buckets: Vec<Bucket<T>>,
}

impl<T> BucketIndexedList<T> {
    /// Build an index with `num_buckets` buckets, each starting empty.
    pub fn new(num_buckets: usize) -> Self {
        assert!(num_buckets > 0, "a bucket-indexed list needs at least one bucket");
        BucketIndexedList {
            buckets: (0..num_buckets).map(|_| Bucket::new()).collect(),
        }
    }

    /// Number of buckets this index was built with.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Append `payload` into `bucket`, indexed under `key` for future
    /// [`Self::indexed_for_each`] probes.
    pub fn insert(&self, bucket: usize, key: u64, payload: T) {
        let b = &self.buckets[bucket];
        b.list.append(payload);
        b.filter.fetch_or(bloom_mask(key), Ordering::AcqRel);
        cas_extremum(&b.min, key, |new, cur| new < cur);
        cas_extremum(&b.max, key, |new, cur| new > cur);
    }

    /// Call `f` with every live payload in every bucket whose summary
    /// admits `key`. Buckets that provably cannot contain `key` are
    /// skipped without touching their list.
    pub fn indexed_for_each<F: FnMut(&T)>(&self, key: u64, mut f: F) {
        for bucket in &self.buckets {
            if bucket.admits(key) {
                for item in bucket.list.iter() {
                    f(item);
                }
            }
        }
    }

    /// Like [`Self::indexed_for_each`] but scoped to one explicit bucket,
    /// bypassing the admission check — used when the caller already knows
    /// which bucket a region landed in (the transaction layer's conflict
    /// probe computes this from the region's address directly).
    pub fn for_each_in_bucket<F: FnMut(&T)>(&self, bucket: usize, mut f: F) {
        for item in self.buckets[bucket].list.iter() {
            f(item);
        }
    }

    /// Mark the first live payload in `bucket` matching `pred` as logically
    /// deleted.
    pub fn soft_remove_if_first<P: Fn(&T) -> bool>(&self, bucket: usize, pred: P) -> bool {
        self.buckets[bucket].list.soft_remove_if_first(pred)
    }

    /// Physically reclaim every soft-deleted node in `bucket`. Requires
    /// exclusive access, same as [`AppendAtomicList::clean`].
    pub fn clean(&mut self, bucket: usize) {
        self.buckets[bucket].list.clean();
    }

    /// Fraction of buckets, out of the total, that admit `key` — exposed
    /// for false-positive-rate testing.
    pub fn admission_rate(&self, key: u64) -> f64 {
        let admitted = self.buckets.iter().filter(|b| b.admits(key)).count();
        admitted as f64 / self.buckets.len() as f64
    }
}
