//! Sparse voxel grid
//!
//! Maps integer voxel coordinates to fixed-width feature vectors. Only occupied
//! voxels are stored; an absent voxel reads as the zero vector.
//!
//! Storage layout:
//! - `index`: packed coordinate → slot number (lookup only, never iterated)
//! - `coords`: slot number → coordinate, in insertion order
//! - `features`: flat `[slot0_ch0, slot0_ch1, ..., slot1_ch0, ...]`
//!
//! Iteration always walks `coords`, so every traversal is deterministic and
//! independent of the hash map's internal order.

use crate::Float;
use std::collections::HashMap;

/// Bits used per axis when packing a coordinate
const AXIS_BITS: u32 = 21;

/// Bias added before packing so negative coordinates fit in an unsigned field
const AXIS_BIAS: i64 = 1 << (AXIS_BITS - 1);

const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;

/// Largest absolute coordinate accepted from a crop file
///
/// Each conv layer moves voxels by at most its filter size, so inputs are kept
/// well inside the packable range [-2^20, 2^20).
pub const MAX_INPUT_COORD: i32 = 1 << 19;

/// Integer voxel coordinate (ix, iy, iz)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelCoord {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Coordinate shifted by (dx, dy, dz)
    #[inline]
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }

    /// Pack into a single u64 key (21 bits per axis)
    ///
    /// Each axis must lie in [-2^20, 2^20).
    #[inline]
    pub fn pack(self) -> u64 {
        debug_assert!(Self::in_packable_range(self.x));
        debug_assert!(Self::in_packable_range(self.y));
        debug_assert!(Self::in_packable_range(self.z));
        let x = (self.x as i64 + AXIS_BIAS) as u64 & AXIS_MASK;
        let y = (self.y as i64 + AXIS_BIAS) as u64 & AXIS_MASK;
        let z = (self.z as i64 + AXIS_BIAS) as u64 & AXIS_MASK;
        (x << (2 * AXIS_BITS)) | (y << AXIS_BITS) | z
    }

    /// Inverse of [`VoxelCoord::pack`]
    #[inline]
    pub fn unpack(key: u64) -> Self {
        let x = ((key >> (2 * AXIS_BITS)) & AXIS_MASK) as i64 - AXIS_BIAS;
        let y = ((key >> AXIS_BITS) & AXIS_MASK) as i64 - AXIS_BIAS;
        let z = (key & AXIS_MASK) as i64 - AXIS_BIAS;
        Self::new(x as i32, y as i32, z as i32)
    }

    #[inline]
    fn in_packable_range(v: i32) -> bool {
        (v as i64) >= -AXIS_BIAS && (v as i64) < AXIS_BIAS
    }
}

impl From<(i32, i32, i32)> for VoxelCoord {
    fn from((x, y, z): (i32, i32, i32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Sparse grid of C-channel feature vectors
#[derive(Debug, Clone)]
pub struct SparseGrid {
    /// Feature width of every stored voxel
    channels: usize,
    /// Packed coordinate → slot
    index: HashMap<u64, usize>,
    /// Slot → coordinate (insertion order)
    coords: Vec<VoxelCoord>,
    /// Flat feature storage, `channels` values per slot
    features: Vec<Float>,
    /// Returned by `get` for unoccupied voxels
    zero: Vec<Float>,
}

impl SparseGrid {
    /// Create an empty grid with the given channel width
    pub fn new(channels: usize) -> Self {
        assert!(channels >= 1, "SparseGrid needs at least one channel");
        Self {
            channels,
            index: HashMap::new(),
            coords: Vec::new(),
            features: Vec::new(),
            zero: vec![0.0; channels],
        }
    }

    /// Create an empty grid with room for `capacity` voxels
    pub fn with_capacity(channels: usize, capacity: usize) -> Self {
        let mut grid = Self::new(channels);
        grid.index.reserve(capacity);
        grid.coords.reserve(capacity);
        grid.features.reserve(capacity * channels);
        grid
    }

    /// Build from (coordinate, features) pairs; later duplicates overwrite earlier ones
    pub fn from_entries<I, V>(channels: usize, entries: I) -> Self
    where
        I: IntoIterator<Item = (VoxelCoord, V)>,
        V: AsRef<[Float]>,
    {
        let mut grid = Self::new(channels);
        for (coord, values) in entries {
            grid.set(coord, values.as_ref());
        }
        grid
    }

    /// Feature width
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of occupied voxels
    #[inline]
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    #[inline]
    pub fn contains(&self, coord: VoxelCoord) -> bool {
        self.index.contains_key(&coord.pack())
    }

    #[inline]
    fn slot(&self, coord: VoxelCoord) -> Option<usize> {
        self.index.get(&coord.pack()).copied()
    }

    #[inline]
    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = slot * self.channels;
        start..start + self.channels
    }

    /// Features at `coord`, or the zero vector if unoccupied
    #[inline]
    pub fn get(&self, coord: VoxelCoord) -> &[Float] {
        self.feature(coord).unwrap_or(&self.zero)
    }

    /// Features at `coord` if occupied
    #[inline]
    pub fn feature(&self, coord: VoxelCoord) -> Option<&[Float]> {
        self.slot(coord).map(|slot| &self.features[self.slot_range(slot)])
    }

    /// Insert or overwrite the features at `coord`
    pub fn set(&mut self, coord: VoxelCoord, values: &[Float]) {
        assert_eq!(values.len(), self.channels, "Feature width mismatch");
        let slot = self.slot_or_insert(coord);
        let range = self.slot_range(slot);
        self.features[range].copy_from_slice(values);
    }

    /// Element-wise add `values` into `coord`, occupying it if needed
    pub fn add(&mut self, coord: VoxelCoord, values: &[Float]) {
        assert_eq!(values.len(), self.channels, "Feature width mismatch");
        let slot = self.slot_or_insert(coord);
        let range = self.slot_range(slot);
        for (dst, &v) in self.features[range].iter_mut().zip(values) {
            *dst += v;
        }
    }

    /// Mutable features at `coord`, occupying it with zeros if needed
    pub fn entry_mut(&mut self, coord: VoxelCoord) -> &mut [Float] {
        let slot = self.slot_or_insert(coord);
        let range = self.slot_range(slot);
        &mut self.features[range]
    }

    fn slot_or_insert(&mut self, coord: VoxelCoord) -> usize {
        let next = self.coords.len();
        let slot = *self.index.entry(coord.pack()).or_insert(next);
        if slot == next {
            self.coords.push(coord);
            self.features.extend(std::iter::repeat(0.0).take(self.channels));
        }
        slot
    }

    /// Occupied coordinates in insertion order
    ///
    /// The iterator is cloneable, so it can be restarted.
    pub fn occupied_coords(&self) -> OccupiedCoords<'_> {
        OccupiedCoords {
            inner: self.coords.iter(),
        }
    }

    /// (coordinate, features) pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (VoxelCoord, &[Float])> + Clone + '_ {
        self.coords
            .iter()
            .copied()
            .zip(self.features.chunks_exact(self.channels))
    }

    /// Apply `f` to every stored feature value
    pub fn map_features(&self, f: impl Fn(Float) -> Float) -> SparseGrid {
        let mut out = self.clone();
        for v in out.features.iter_mut() {
            *v = f(*v);
        }
        out
    }

    /// Sum of all stored values
    pub fn sum(&self) -> Float {
        self.features.iter().sum()
    }
}

/// Restartable iterator over occupied coordinates
#[derive(Debug, Clone)]
pub struct OccupiedCoords<'a> {
    inner: std::slice::Iter<'a, VoxelCoord>,
}

impl Iterator for OccupiedCoords<'_> {
    type Item = VoxelCoord;

    #[inline]
    fn next(&mut self) -> Option<VoxelCoord> {
        self.inner.next().copied()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for OccupiedCoords<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pack_roundtrip_extremes() {
        let coords = [
            VoxelCoord::new(0, 0, 0),
            VoxelCoord::new(-1, -1, -1),
            VoxelCoord::new(400, -200, 12),
            VoxelCoord::new((1 << 20) - 1, -(1 << 20), 7),
        ];
        for c in coords {
            assert_eq!(VoxelCoord::unpack(c.pack()), c);
        }
    }

    #[test]
    fn test_pack_distinguishes_axes() {
        let a = VoxelCoord::new(1, 0, 0).pack();
        let b = VoxelCoord::new(0, 1, 0).pack();
        let c = VoxelCoord::new(0, 0, 1).pack();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_get_unoccupied_is_zero() {
        let grid = SparseGrid::new(6);
        let v = grid.get(VoxelCoord::new(3, 4, 5));
        assert_eq!(v.len(), 6);
        assert!(v.iter().all(|&x| x == 0.0));
        assert!(grid.feature(VoxelCoord::new(3, 4, 5)).is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let mut grid = SparseGrid::new(2);
        let c = VoxelCoord::new(1, 2, 3);
        grid.set(c, &[1.0, 2.0]);
        grid.set(c, &[5.0, 6.0]);
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.get(c), &[5.0, 6.0]);
    }

    #[test]
    fn test_add_accumulates() {
        let mut grid = SparseGrid::new(2);
        let c = VoxelCoord::new(-1, 0, 1);
        grid.add(c, &[0.5, 1.0]);
        grid.add(c, &[0.25, -1.0]);
        assert_relative_eq!(grid.get(c)[0], 0.75);
        assert_relative_eq!(grid.get(c)[1], 0.0);
        assert!(grid.contains(c));
    }

    #[test]
    fn test_occupied_coords_insertion_order_and_restartable() {
        let mut grid = SparseGrid::new(1);
        let order = [
            VoxelCoord::new(9, 9, 9),
            VoxelCoord::new(0, 0, 0),
            VoxelCoord::new(4, -2, 1),
        ];
        for (i, &c) in order.iter().enumerate() {
            grid.set(c, &[i as Float]);
        }
        // Overwriting keeps the original position
        grid.set(order[0], &[7.0]);

        let iter = grid.occupied_coords();
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, order);
        assert_eq!(first, second);
    }

    #[test]
    fn test_iter_pairs_features() {
        let grid = SparseGrid::from_entries(
            2,
            vec![
                (VoxelCoord::new(0, 0, 0), vec![1.0, 2.0]),
                (VoxelCoord::new(1, 0, 0), vec![3.0, 4.0]),
            ],
        );
        let pairs: Vec<_> = grid.iter().map(|(c, f)| (c, f.to_vec())).collect();
        assert_eq!(pairs[1], (VoxelCoord::new(1, 0, 0), vec![3.0, 4.0]));
        assert_relative_eq!(grid.sum(), 10.0);
    }

    #[test]
    fn test_map_features() {
        let grid = SparseGrid::from_entries(1, vec![(VoxelCoord::new(0, 0, 0), [-2.0])]);
        let abs = grid.map_features(Float::abs);
        assert_relative_eq!(abs.get(VoxelCoord::new(0, 0, 0))[0], 2.0);
    }

    #[test]
    #[should_panic(expected = "Feature width mismatch")]
    fn test_set_wrong_width_panics() {
        let mut grid = SparseGrid::new(3);
        grid.set(VoxelCoord::new(0, 0, 0), &[1.0]);
    }
}
