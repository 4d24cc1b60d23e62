//! Voxel-hashed spatial map.
//!
//! The map aggregates points into fixed-size cubic cells. Each cell keeps a
//! running sum (centroid), optionally the outer-product sum (covariance and
//! surface normal) and a capped list of raw points. Aggregation is an implicit
//! voxel-grid downsampling: memory grows with occupied cells, not with points.
//!
//! # Architecture
//!
//! - [`hash`]: bucket hashing strategies selected from configuration
//! - `table`: chained bucket table with full-key equality
//! - [`types`]: keys, cells and configuration
//!
//! Reads (`query`, `query_neighborhood`) take `&self`; inserts and eviction take
//! `&mut self`. A cell reference returned by a query therefore cannot outlive
//! an eviction pass.

pub mod hash;
mod table;
pub mod types;

pub use hash::HashStrategy;
pub use types::{CellSnapshot, EvictionPolicy, VoxelCell, VoxelKey, VoxelMapConfig};

use nalgebra::Point3;
use tracing::{debug, warn};

use crate::error::{LioError, Result};
use table::BucketTable;

/// A hash map of voxel cells with a resident-cell ceiling.
#[derive(Debug)]
pub struct VoxelMap {
    /// Configuration used to build this map.
    config: VoxelMapConfig,
    /// Cells indexed by their key.
    cells: BucketTable<VoxelCell>,
    /// Step counter used as the recency clock.
    stamp: u64,
}

impl VoxelMap {
    /// Create a new empty map with the given configuration.
    pub fn new(config: VoxelMapConfig) -> Result<Self> {
        if !(config.voxel_size.is_finite() && config.voxel_size > 0.0) {
            return Err(LioError::Input(format!(
                "voxel size must be positive, got {}",
                config.voxel_size
            )));
        }
        if config.max_resident_cells == 0 {
            return Err(LioError::Input(
                "max_resident_cells must be at least 1".to_string(),
            ));
        }
        config.hash_strategy.validate().map_err(LioError::Input)?;

        Ok(Self {
            cells: BucketTable::new(config.hash_strategy),
            config,
            stamp: 0,
        })
    }

    /// Build a map from a point cloud.
    pub fn from_points(points: &[Point3<f64>], config: VoxelMapConfig) -> Result<Self> {
        let mut map = Self::new(config)?;
        map.insert_points(points.iter());
        Ok(map)
    }

    /// Get the number of resident cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.len() == 0
    }

    /// Get the configuration.
    pub fn config(&self) -> &VoxelMapConfig {
        &self.config
    }

    /// Get the voxel size.
    pub fn voxel_size(&self) -> f64 {
        self.config.voxel_size
    }

    /// Number of hash buckets currently allocated.
    pub fn bucket_count(&self) -> usize {
        self.cells.bucket_count()
    }

    /// Longest collision chain.
    pub fn max_chain_len(&self) -> usize {
        self.cells.max_chain_len()
    }

    /// Current recency stamp.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Advance the recency clock. Called once per pipeline step.
    pub fn advance_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Key of the cell containing `point`.
    ///
    /// `None` for non-finite points and points outside the representable grid.
    pub fn key_of(&self, point: &Point3<f64>) -> Option<VoxelKey> {
        VoxelKey::from_point(point, self.config.voxel_size)
    }

    /// Accumulate a point into its cell, creating the cell on first use.
    ///
    /// Returns `false`, leaving the map untouched, if the point has no key.
    pub fn insert(&mut self, point: &Point3<f64>) -> bool {
        let Some(key) = self.key_of(point) else {
            return false;
        };
        let track_covariance = self.config.track_covariance;
        let max_points = self.config.max_points_per_cell;
        let stamp = self.stamp;
        self.cells
            .get_or_insert_with(key, || VoxelCell::new(track_covariance, stamp))
            .add_point(point, max_points, stamp);
        true
    }

    /// Insert many points. Returns how many were accepted.
    pub fn insert_points<'a>(
        &mut self,
        points: impl IntoIterator<Item = &'a Point3<f64>>,
    ) -> usize {
        let mut inserted = 0;
        let mut skipped = 0;
        for point in points {
            if self.insert(point) {
                inserted += 1;
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(skipped, "skipped points outside the voxel grid");
        }
        inserted
    }

    /// Get a cell by key without touching it.
    pub fn get(&self, key: &VoxelKey) -> Option<&VoxelCell> {
        self.cells.get(key)
    }

    /// Get the cell containing `point`.
    pub fn query(&self, point: &Point3<f64>) -> Option<&VoxelCell> {
        let cell = self.cells.get(&self.key_of(point)?)?;
        cell.touch(self.stamp);
        Some(cell)
    }

    /// Get all populated cells in the `(2 * radius + 1)^3` block around `point`.
    ///
    /// Cells are returned in ascending (x, y, z) key order. An empty result is
    /// a normal outcome. Neighbours past the edge of the grid are skipped.
    pub fn query_neighborhood(
        &self,
        point: &Point3<f64>,
        radius: u32,
    ) -> Vec<(VoxelKey, &VoxelCell)> {
        let Some(center) = self.key_of(point) else {
            return Vec::new();
        };
        let r = radius.min(i32::MAX as u32) as i32;
        let mut found = Vec::new();
        for dx in -r..=r {
            for dy in -r..=r {
                for dz in -r..=r {
                    let Some(key) = center.offset(dx, dy, dz) else {
                        continue;
                    };
                    if let Some(cell) = self.cells.get(&key) {
                        cell.touch(self.stamp);
                        found.push((key, cell));
                    }
                }
            }
        }
        found
    }

    /// Remove a cell.
    pub fn remove(&mut self, key: &VoxelKey) -> Option<VoxelCell> {
        self.cells.remove(key)
    }

    /// Iterate over all cells in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (&VoxelKey, &VoxelCell)> {
        self.cells.iter()
    }

    /// Evict cells until the resident count is back at the ceiling.
    ///
    /// `position` is only used by [`EvictionPolicy::FarthestFromPosition`].
    /// Ties are broken by key order. Returns the number of evicted cells.
    pub fn evict(&mut self, position: &Point3<f64>) -> usize {
        let ceiling = self.config.max_resident_cells;
        if self.len() <= ceiling {
            return 0;
        }
        let excess = self.len() - ceiling;

        let victims: Vec<VoxelKey> = match self.config.eviction_policy {
            EvictionPolicy::LeastRecentlyTouched => {
                let mut order: Vec<(u64, VoxelKey)> = self
                    .cells
                    .iter()
                    .map(|(key, cell)| (cell.last_touched(), *key))
                    .collect();
                order.sort_unstable();
                order.into_iter().take(excess).map(|(_, key)| key).collect()
            }
            EvictionPolicy::FarthestFromPosition => {
                let mut order: Vec<(f64, VoxelKey)> = self
                    .cells
                    .iter()
                    .map(|(key, cell)| ((cell.centroid() - position).norm_squared(), *key))
                    .collect();
                order.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
                order.into_iter().take(excess).map(|(_, key)| key).collect()
            }
        };

        for key in &victims {
            self.cells.remove(key);
        }

        debug!(
            evicted = victims.len(),
            resident = self.len(),
            policy = ?self.config.eviction_policy,
            "voxel map eviction"
        );
        victims.len()
    }

    /// Owned copy of every cell's key, centroid and count, sorted by key.
    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        let mut cells: Vec<CellSnapshot> = self
            .cells
            .iter()
            .map(|(key, cell)| CellSnapshot {
                key: *key,
                centroid: cell.centroid(),
                count: cell.count(),
            })
            .collect();
        cells.sort_unstable_by_key(|c| c.key);
        cells
    }
}

impl<'a> Extend<&'a Point3<f64>> for VoxelMap {
    fn extend<I: IntoIterator<Item = &'a Point3<f64>>>(&mut self, iter: I) {
        self.insert_points(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::prelude::*;
    use rand::rngs::StdRng;
    use rand_distr::Normal;

    fn generate_test_points(seed: u64) -> Vec<Point3<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        // Very small spread keeps each cluster inside one voxel (size 2.0)
        let dist = Normal::new(0.0, 0.1).unwrap();
        let centers = [[1.0, 1.0, 1.0], [11.0, 1.0, 1.0], [1.0, 11.0, 1.0]];
        let mut points = Vec::new();
        for center in &centers {
            for _ in 0..50 {
                points.push(Point3::new(
                    center[0] + dist.sample(&mut rng),
                    center[1] + dist.sample(&mut rng),
                    center[2] + dist.sample(&mut rng),
                ));
            }
        }
        points
    }

    fn config(voxel_size: f64, strategy: HashStrategy) -> VoxelMapConfig {
        VoxelMapConfig {
            voxel_size,
            hash_strategy: strategy,
            ..Default::default()
        }
    }

    #[test]
    fn test_map_from_points() {
        let points = generate_test_points(7);
        let map = VoxelMap::from_points(&points, VoxelMapConfig::with_voxel_size(2.0)).unwrap();

        // One cell per cluster
        assert_eq!(map.len(), 3, "Expected 3 cells but got {}", map.len());
        assert_eq!(map.voxel_size(), 2.0);
        let total: usize = map.iter().map(|(_, c)| c.count()).sum();
        assert_eq!(total, points.len());
    }

    #[test]
    fn test_invalid_config() {
        assert!(VoxelMap::new(VoxelMapConfig::with_voxel_size(0.0)).is_err());
        assert!(VoxelMap::new(VoxelMapConfig::with_voxel_size(f64::NAN)).is_err());
        assert!(VoxelMap::new(config(1.0, HashStrategy::Bounded { bits: 40 })).is_err());
        let zero_cap = VoxelMapConfig {
            max_resident_cells: 0,
            ..Default::default()
        };
        assert!(VoxelMap::new(zero_cap).is_err());
    }

    #[test]
    fn test_single_insert_query_returns_point() {
        let mut rng = StdRng::seed_from_u64(3);
        for strategy in [
            HashStrategy::Wide,
            HashStrategy::bounded(),
            HashStrategy::BoundedUnsigned { bits: 10 },
        ] {
            for _ in 0..100 {
                let p = Point3::new(
                    rng.gen_range(-100.0..100.0),
                    rng.gen_range(-100.0..100.0),
                    rng.gen_range(-100.0..100.0),
                );
                let mut map = VoxelMap::new(config(0.3, strategy)).unwrap();
                map.insert(&p);
                let cell = map.query(&p).unwrap();
                assert_eq!(cell.count(), 1);
                assert_relative_eq!(cell.centroid(), p, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_duplicate_inserts_only_move_centroid() {
        let mut map = VoxelMap::new(VoxelMapConfig::with_voxel_size(1.0)).unwrap();
        let p = Point3::new(0.2, 0.2, 0.2);
        map.insert(&p);
        map.insert(&p);
        map.insert(&Point3::new(0.4, 0.2, 0.2));
        assert_eq!(map.len(), 1);
        let cell = map.query(&p).unwrap();
        assert_eq!(cell.count(), 3);
        assert_relative_eq!(cell.centroid().x, 0.8 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_strategies_agree_on_cell_identity() {
        let mut rng = StdRng::seed_from_u64(11);
        let points: Vec<Point3<f64>> = (0..2000)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-20.0..20.0),
                    rng.gen_range(-20.0..20.0),
                    rng.gen_range(-5.0..5.0),
                )
            })
            .collect();

        let wide = VoxelMap::from_points(&points, config(1.0, HashStrategy::Wide)).unwrap();
        // A tiny bounded table forces long collision chains
        let bounded =
            VoxelMap::from_points(&points, config(1.0, HashStrategy::Bounded { bits: 4 }))
                .unwrap();
        let unsigned = VoxelMap::from_points(
            &points,
            config(1.0, HashStrategy::BoundedUnsigned { bits: 6 }),
        )
        .unwrap();

        assert!(bounded.max_chain_len() > 1);
        assert_eq!(wide.snapshot(), bounded.snapshot());
        assert_eq!(wide.snapshot(), unsigned.snapshot());

        for p in &points {
            let a = wide.query(p).unwrap();
            let b = bounded.query(p).unwrap();
            assert_eq!(a.count(), b.count());
            assert_eq!(a.centroid(), b.centroid());
        }
    }

    #[test]
    fn test_non_finite_points_are_not_inserted() {
        let mut map = VoxelMap::new(VoxelMapConfig::with_voxel_size(1.0)).unwrap();
        let p = Point3::new(0.5, 0.5, 0.5);
        assert!(map.insert(&p));
        assert!(!map.insert(&Point3::new(f64::NAN, 0.0, 0.0)));
        assert!(!map.insert(&Point3::new(0.2, f64::NEG_INFINITY, 0.2)));

        assert_eq!(map.len(), 1);
        let cell = map.query(&p).unwrap();
        assert_eq!(cell.count(), 1);
        assert_relative_eq!(cell.centroid(), p, epsilon = 1e-12);
        assert!(map.query(&Point3::new(f64::NAN, 0.0, 0.0)).is_none());

        let batch = [Point3::new(0.4, 0.4, 0.4), Point3::new(f64::NAN, 1.0, 1.0)];
        assert_eq!(map.insert_points(&batch), 1);
        assert_eq!(map.query(&p).unwrap().count(), 2);
    }

    #[test]
    fn test_points_beyond_grid_are_rejected() {
        let mut map = VoxelMap::new(VoxelMapConfig::with_voxel_size(0.5)).unwrap();
        assert!(!map.insert(&Point3::new(2.0e9, 0.0, 0.0)));
        assert!(!map.insert(&Point3::new(3.0e9, 0.0, 0.0)));
        assert!(map.is_empty());
        assert!(map.query_neighborhood(&Point3::new(2.0e9, 0.0, 0.0), 1).is_empty());
    }

    #[test]
    fn test_neighborhood_at_grid_edge() {
        let mut map = VoxelMap::new(VoxelMapConfig::with_voxel_size(0.5)).unwrap();
        // Last representable cell along x and its inner neighbour
        let edge = Point3::new(i32::MAX as f64 * 0.5 + 0.25, 0.25, 0.25);
        let inner = Point3::new(edge.x - 0.5, 0.25, 0.25);
        assert!(map.insert(&edge));
        assert!(map.insert(&inner));

        let found = map.query_neighborhood(&edge, 1);
        let xs: Vec<i32> = found.iter().map(|(k, _)| k.x).collect();
        assert_eq!(xs, vec![i32::MAX - 1, i32::MAX]);
    }

    #[test]
    fn test_query_empty_region() {
        let points = generate_test_points(1);
        let map = VoxelMap::from_points(&points, VoxelMapConfig::with_voxel_size(2.0)).unwrap();
        assert!(map.query(&Point3::new(100.0, 100.0, 100.0)).is_none());
        assert!(map
            .query_neighborhood(&Point3::new(100.0, 100.0, 100.0), 1)
            .is_empty());
    }

    #[test]
    fn test_query_neighborhood() {
        let mut map = VoxelMap::new(VoxelMapConfig::with_voxel_size(1.0)).unwrap();
        for x in -3..=3 {
            for y in -3..=3 {
                for z in -3..=3 {
                    map.insert(&Point3::new(x as f64 + 0.5, y as f64 + 0.5, z as f64 + 0.5));
                }
            }
        }
        let center = Point3::new(0.5, 0.5, 0.5);
        assert_eq!(map.query_neighborhood(&center, 0).len(), 1);
        assert_eq!(map.query_neighborhood(&center, 1).len(), 27);
        assert_eq!(map.query_neighborhood(&center, 2).len(), 125);

        // Fixed ascending key order
        let keys: Vec<VoxelKey> = map
            .query_neighborhood(&center, 1)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_eviction_respects_ceiling() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut map = VoxelMap::new(VoxelMapConfig {
            voxel_size: 0.5,
            max_resident_cells: 50,
            ..Default::default()
        })
        .unwrap();

        for _ in 0..20 {
            for _ in 0..40 {
                map.insert(&Point3::new(
                    rng.gen_range(-30.0..30.0),
                    rng.gen_range(-30.0..30.0),
                    rng.gen_range(-30.0..30.0),
                ));
            }
            map.evict(&Point3::origin());
            map.advance_stamp();
            assert!(map.len() <= 50, "resident cells {}", map.len());
        }
    }

    #[test]
    fn test_lru_eviction_keeps_recent_cells() {
        let mut map = VoxelMap::new(VoxelMapConfig {
            voxel_size: 1.0,
            max_resident_cells: 2,
            eviction_policy: EvictionPolicy::LeastRecentlyTouched,
            ..Default::default()
        })
        .unwrap();

        let old = Point3::new(0.5, 0.5, 0.5);
        let queried = Point3::new(5.5, 0.5, 0.5);
        let fresh = Point3::new(10.5, 0.5, 0.5);

        map.insert(&old);
        map.insert(&queried);
        map.advance_stamp();
        assert!(map.query(&queried).is_some());
        map.advance_stamp();
        map.insert(&fresh);

        assert_eq!(map.evict(&Point3::origin()), 1);
        assert!(map.query(&old).is_none());
        assert!(map.query(&queried).is_some());
        assert!(map.query(&fresh).is_some());
    }

    #[test]
    fn test_farthest_eviction() {
        let mut map = VoxelMap::new(VoxelMapConfig {
            voxel_size: 1.0,
            max_resident_cells: 3,
            eviction_policy: EvictionPolicy::FarthestFromPosition,
            ..Default::default()
        })
        .unwrap();
        for x in 0..6 {
            map.insert(&Point3::new(x as f64 * 10.0 + 0.5, 0.5, 0.5));
        }
        assert_eq!(map.evict(&Point3::new(0.0, 0.0, 0.0)), 3);
        let remaining: Vec<i32> = map.snapshot().iter().map(|c| c.key.x).collect();
        assert_eq!(remaining, vec![0, 10, 20]);

        // Already within the ceiling
        assert_eq!(map.evict(&Point3::origin()), 0);
    }

    #[test]
    fn test_snapshot_sorted() {
        let points = generate_test_points(2);
        let map = VoxelMap::from_points(&points, VoxelMapConfig::with_voxel_size(2.0)).unwrap();
        let snapshot = map.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.windows(2).all(|w| w[0].key < w[1].key));
    }

    #[test]
    fn test_remove_cell() {
        let mut map = VoxelMap::new(VoxelMapConfig::with_voxel_size(1.0)).unwrap();
        let p = Point3::new(0.5, 0.5, 0.5);
        map.insert(&p);
        let key = map.key_of(&p).unwrap();
        assert!(map.remove(&key).is_some());
        assert!(map.is_empty());
        assert!(map.query(&p).is_none());
    }
}
