//! Crop corpora
//!
//! A crop is one voxelized window around an object (positive) or around
//! background (negative). The label is implied by the corpus it belongs to.
//!
//! On-disk format read by [`NpyCropLoader`]: a 2-D `.npy` array of shape
//! `(N, 3 + C)`, one row per occupied voxel, columns `ix, iy, iz, f0 .. f(C-1)`.

use crate::error::{Result, Vote3DeepError};
use crate::grid::{SparseGrid, VoxelCoord, MAX_INPUT_COORD};
use crate::Float;
use ndarray::Array2;
use ndarray_npy::read_npy;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Turns a crop file into a sparse grid
pub trait CropLoader: Sync {
    fn load(&self, path: &Path) -> Result<SparseGrid>;
}

/// Loader for `(N, 3 + C)` `.npy` crops
///
/// A file with a different feature width is a `ChannelMismatch`, not a bad
/// crop: it means the corpus was built for another network.
#[derive(Debug, Clone, Copy)]
pub struct NpyCropLoader {
    channels: usize,
}

impl NpyCropLoader {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl CropLoader for NpyCropLoader {
    fn load(&self, path: &Path) -> Result<SparseGrid> {
        let rows: Array2<Float> = read_npy(path).map_err(|e| Vote3DeepError::crop(path, e))?;
        if rows.ncols() != 3 + self.channels {
            return Err(Vote3DeepError::ChannelMismatch {
                context: format!("crop {}", path.display()),
                expected: self.channels,
                got: rows.ncols().saturating_sub(3),
            });
        }

        let mut grid = SparseGrid::with_capacity(self.channels, rows.nrows());
        let mut features = vec![0.0; self.channels];
        for (r, row) in rows.outer_iter().enumerate() {
            let mut index = [0i32; 3];
            for axis in 0..3 {
                let v = row[axis];
                if !v.is_finite() || v.fract() != 0.0 || v.abs() >= MAX_INPUT_COORD as Float {
                    return Err(Vote3DeepError::crop(path, format!("row {r}: bad voxel index {v}")));
                }
                index[axis] = v as i32;
            }
            for (dst, &v) in features.iter_mut().zip(row.iter().skip(3)) {
                *dst = v;
            }
            grid.set(VoxelCoord::new(index[0], index[1], index[2]), &features);
        }
        Ok(grid)
    }
}

/// Indexed collection of crops
pub trait CropSource: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize crop `index`
    fn load(&self, index: usize) -> Result<SparseGrid>;

    /// Human-readable identifier, used in logs and the mined pool
    fn describe(&self, index: usize) -> String;
}

/// Crops backed by files, ordered by path
#[derive(Debug, Clone)]
pub struct CropCorpus<L> {
    paths: Vec<PathBuf>,
    loader: L,
}

impl<L: CropLoader> CropCorpus<L> {
    pub fn new(paths: Vec<PathBuf>, loader: L) -> Self {
        Self { paths, loader }
    }

    /// Every file in `dir` with the given extension, sorted by path
    ///
    /// A missing directory yields an empty corpus.
    pub fn from_dir(dir: &Path, extension: &str, loader: L) -> Result<Self> {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "crop directory not found, corpus is empty");
            return Ok(Self::new(Vec::new(), loader));
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(Self::new(paths, loader))
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl<L: CropLoader> CropSource for CropCorpus<L> {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn load(&self, index: usize) -> Result<SparseGrid> {
        self.loader.load(&self.paths[index])
    }

    fn describe(&self, index: usize) -> String {
        self.paths[index].display().to_string()
    }
}

/// Crops already in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    crops: Vec<SparseGrid>,
}

impl InMemoryCorpus {
    pub fn new(crops: Vec<SparseGrid>) -> Self {
        Self { crops }
    }
}

impl CropSource for InMemoryCorpus {
    fn len(&self) -> usize {
        self.crops.len()
    }

    fn load(&self, index: usize) -> Result<SparseGrid> {
        Ok(self.crops[index].clone())
    }

    fn describe(&self, index: usize) -> String {
        format!("crop#{index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use ndarray_npy::write_npy;
    use tempfile::tempdir;

    #[test]
    fn test_npy_loader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crop.npy");
        let rows = array![[0.0, 1.0, 2.0, 0.5, 0.25], [3.0, -1.0, 0.0, 1.0, 0.0]];
        write_npy(&path, &rows).unwrap();

        let grid = NpyCropLoader::new(2).load(&path).unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.channels(), 2);
        assert_relative_eq!(grid.get(VoxelCoord::new(0, 1, 2))[0], 0.5);
        assert_relative_eq!(grid.get(VoxelCoord::new(3, -1, 0))[0], 1.0);
    }

    #[test]
    fn test_npy_loader_wrong_width() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crop.npy");
        write_npy(&path, &array![[0.0, 0.0, 0.0, 1.0]]).unwrap();
        let err = NpyCropLoader::new(6).load(&path).unwrap_err();
        assert!(matches!(
            err,
            Vote3DeepError::ChannelMismatch {
                expected: 6,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_npy_loader_coordinate_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crop.npy");
        let limit = MAX_INPUT_COORD as Float;

        write_npy(&path, &array![[limit - 1.0, -(limit - 1.0), 0.0, 1.0]]).unwrap();
        assert_eq!(NpyCropLoader::new(1).load(&path).unwrap().len(), 1);

        write_npy(&path, &array![[limit, 0.0, 0.0, 1.0]]).unwrap();
        let err = NpyCropLoader::new(1).load(&path).unwrap_err();
        assert!(matches!(err, Vote3DeepError::Crop { .. }));
    }

    #[test]
    fn test_npy_loader_fractional_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crop.npy");
        write_npy(&path, &array![[0.5, 0.0, 0.0, 1.0]]).unwrap();
        assert!(NpyCropLoader::new(1).load(&path).is_err());
    }

    #[test]
    fn test_npy_loader_missing_file() {
        let dir = tempdir().unwrap();
        let err = NpyCropLoader::new(6).load(&dir.path().join("nope.npy")).unwrap_err();
        assert!(matches!(err, Vote3DeepError::Crop { .. }));
    }

    #[test]
    fn test_from_dir_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for name in ["b.npy", "a.npy", "c.npy"] {
            write_npy(dir.path().join(name), &array![[0.0, 0.0, 0.0, 1.0]]).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let corpus = CropCorpus::from_dir(dir.path(), "npy", NpyCropLoader::new(1)).unwrap();
        assert_eq!(corpus.len(), 3);
        let names: Vec<_> = corpus
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["a.npy", "b.npy", "c.npy"]);
        assert!(corpus.describe(0).ends_with("a.npy"));
        assert_eq!(corpus.load(1).unwrap().len(), 1);
    }

    #[test]
    fn test_from_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let corpus = CropCorpus::from_dir(&dir.path().join("absent"), "npy", NpyCropLoader::new(6)).unwrap();
        assert!(corpus.is_empty());
    }

    #[test]
    fn test_in_memory_corpus() {
        let crop = SparseGrid::from_entries(1, vec![(VoxelCoord::new(0, 0, 0), [2.0])]);
        let corpus = InMemoryCorpus::new(vec![crop]);
        assert_eq!(corpus.len(), 1);
        assert!(!corpus.is_empty());
        assert_eq!(corpus.describe(0), "crop#0");
        assert_relative_eq!(corpus.load(0).unwrap().sum(), 2.0);
    }
}
