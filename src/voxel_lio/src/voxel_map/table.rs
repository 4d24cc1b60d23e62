//! Chained bucket table keyed by [`VoxelKey`].
//!
//! The bucket comes from the configured [`HashStrategy`]; the chain inside a
//! bucket is searched by full key equality. With a bounded strategy many keys
//! share a bucket by construction, so the equality check is what keeps cells
//! apart.

use super::hash::HashStrategy;
use super::types::VoxelKey;

/// Initial bucket count for growable tables.
const INITIAL_BUCKETS: usize = 64;

#[derive(Debug)]
pub(crate) struct BucketTable<V> {
    strategy: HashStrategy,
    buckets: Vec<Vec<(VoxelKey, V)>>,
    len: usize,
}

impl<V> BucketTable<V> {
    pub fn new(strategy: HashStrategy) -> Self {
        let bucket_count = strategy.fixed_bucket_count().unwrap_or(INITIAL_BUCKETS);
        Self {
            strategy,
            buckets: empty_buckets(bucket_count),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket_index(&self, key: &VoxelKey) -> usize {
        (self.strategy.hash(key) % self.buckets.len() as u64) as usize
    }

    pub fn get(&self, key: &VoxelKey) -> Option<&V> {
        self.buckets[self.bucket_index(key)]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Find the value for `key`, inserting `make()` when absent.
    pub fn get_or_insert_with(&mut self, key: VoxelKey, make: impl FnOnce() -> V) -> &mut V {
        if self.strategy.fixed_bucket_count().is_none() && self.len >= self.buckets.len() {
            self.grow();
        }

        let index = self.bucket_index(&key);
        let chain = &mut self.buckets[index];
        let position = match chain.iter().position(|(k, _)| *k == key) {
            Some(position) => position,
            None => {
                chain.push((key, make()));
                self.len += 1;
                chain.len() - 1
            }
        };
        &mut chain[position].1
    }

    pub fn remove(&mut self, key: &VoxelKey) -> Option<V> {
        let index = self.bucket_index(key);
        let chain = &mut self.buckets[index];
        let position = chain.iter().position(|(k, _)| k == key)?;
        self.len -= 1;
        Some(chain.swap_remove(position).1)
    }

    /// Iterate entries in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (&VoxelKey, &V)> {
        self.buckets
            .iter()
            .flat_map(|chain| chain.iter().map(|(k, v)| (k, v)))
    }

    /// Longest chain, for diagnostics.
    pub fn max_chain_len(&self) -> usize {
        self.buckets.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Double the bucket count and redistribute all entries.
    fn grow(&mut self) {
        let new_count = self.buckets.len() * 2;
        let old = std::mem::replace(&mut self.buckets, empty_buckets(new_count));
        for (key, value) in old.into_iter().flatten() {
            let index = self.bucket_index(&key);
            self.buckets[index].push((key, value));
        }
    }
}

fn empty_buckets<V>(count: usize) -> Vec<Vec<(VoxelKey, V)>> {
    std::iter::repeat_with(Vec::new).take(count).collect()
}
