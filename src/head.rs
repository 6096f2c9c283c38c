//! Linear scoring head
//!
//! Reads the layer-2 activations inside the window `[0, rx) × [0, ry) × [0, rz)`
//! as a dense vector and scores it with one weight vector plus bias. Voxels
//! outside the window are ignored; absent voxels contribute zero.
//!
//! Flattening order: `((x · ry + y) · rz + z) · F + f`.

use crate::error::{Result, Vote3DeepError};
use crate::grid::{SparseGrid, VoxelCoord};
use crate::Float;
use ndarray::Array1;

/// Dense linear layer over the scoring window
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringHead {
    pub weights: Array1<Float>,
    pub bias: Float,
    receptive_field: [usize; 3],
    channels: usize,
}

/// Gradients produced by [`ScoringHead::backward`]
#[derive(Debug, Clone)]
pub struct HeadGradients {
    pub weights: Array1<Float>,
    pub bias: Float,
    /// dL/dactivation for occupied voxels inside the window
    pub input: SparseGrid,
}

impl ScoringHead {
    pub fn new(
        weights: Array1<Float>,
        bias: Float,
        receptive_field: [usize; 3],
        channels: usize,
    ) -> Result<Self> {
        let expected = receptive_field.iter().product::<usize>() * channels;
        if weights.len() != expected {
            return Err(Vote3DeepError::ShapeMismatch {
                name: "w3".into(),
                expected: vec![expected],
                got: weights.shape().to_vec(),
            });
        }
        Ok(Self {
            weights,
            bias,
            receptive_field,
            channels,
        })
    }

    #[inline]
    pub fn receptive_field(&self) -> [usize; 3] {
        self.receptive_field
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Offset of voxel `coord` in the flattened window, if it lies inside
    #[inline]
    fn flat_offset(&self, coord: VoxelCoord) -> Option<usize> {
        let [rx, ry, rz] = self.receptive_field;
        let inside = |v: i32, r: usize| v >= 0 && (v as usize) < r;
        if !(inside(coord.x, rx) && inside(coord.y, ry) && inside(coord.z, rz)) {
            return None;
        }
        let (x, y, z) = (coord.x as usize, coord.y as usize, coord.z as usize);
        Some(((x * ry + y) * rz + z) * self.channels)
    }

    /// Dense window vector, zero where no voxel is stored
    pub fn flatten(&self, grid: &SparseGrid) -> Array1<Float> {
        assert_eq!(grid.channels(), self.channels, "Head channel mismatch");
        let mut flat = Array1::zeros(self.weights.len());
        for (coord, features) in grid.iter() {
            if let Some(offset) = self.flat_offset(coord) {
                for (f, &v) in features.iter().enumerate() {
                    flat[offset + f] = v;
                }
            }
        }
        flat
    }

    /// `w3 · flatten(grid) + b3`, summed over the occupied voxels only
    pub fn forward(&self, grid: &SparseGrid) -> Float {
        assert_eq!(grid.channels(), self.channels, "Head channel mismatch");
        let mut score = self.bias;
        for (coord, features) in grid.iter() {
            if let Some(offset) = self.flat_offset(coord) {
                for (f, &v) in features.iter().enumerate() {
                    score += self.weights[offset + f] * v;
                }
            }
        }
        score
    }

    /// Gradients for upstream `grad_score` = dL/dscore
    pub fn backward(&self, grid: &SparseGrid, grad_score: Float) -> HeadGradients {
        let mut weights = Array1::zeros(self.weights.len());
        let mut input = SparseGrid::with_capacity(self.channels, grid.len());
        let mut grad = vec![0.0; self.channels];

        for (coord, features) in grid.iter() {
            let Some(offset) = self.flat_offset(coord) else {
                continue;
            };
            for f in 0..self.channels {
                weights[offset + f] = grad_score * features[f];
                grad[f] = grad_score * self.weights[offset + f];
            }
            input.set(coord, &grad);
        }

        HeadGradients {
            weights,
            bias: grad_score,
            input,
        }
    }
}
