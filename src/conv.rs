//! Sparse 3D convolution
//!
//! A filter bank applied by scattering from occupied input voxels rather than by
//! sliding over a dense volume. Every occupied input voxel `i` and kernel tap `k`
//! contributes `W[:, :, k] · input[i]` to output voxel `o = i - (k - pad)`, which
//! is the usual stride-1 cross-correlation `out[o] = Σ_k W[k] · input[o + k - pad]`.
//!
//! Cost is O(occupied voxels × filter volume × in × out); empty space is never
//! visited. Outputs are ReLU'd and only voxels with a positive activation are
//! kept, so sparsity compounds layer over layer.

use crate::error::{Result, Vote3DeepError};
use crate::grid::{SparseGrid, VoxelCoord};
use crate::Float;
use ndarray::{Array1, Array5};

/// Weights (out, in, kx, ky, kz) and bias (out)
#[derive(Debug, Clone, PartialEq)]
pub struct FilterBank {
    pub weights: Array5<Float>,
    pub bias: Array1<Float>,
}

impl FilterBank {
    /// All-zero bank
    pub fn zeros(out_channels: usize, in_channels: usize, filter_size: [usize; 3]) -> Self {
        let [kx, ky, kz] = filter_size;
        Self {
            weights: Array5::zeros((out_channels, in_channels, kx, ky, kz)),
            bias: Array1::zeros(out_channels),
        }
    }

    pub fn new(weights: Array5<Float>, bias: Array1<Float>) -> Self {
        Self { weights, bias }
    }

    #[inline]
    pub fn out_channels(&self) -> usize {
        self.weights.shape()[0]
    }

    #[inline]
    pub fn in_channels(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn filter_size(&self) -> [usize; 3] {
        let s = self.weights.shape();
        [s[2], s[3], s[4]]
    }
}

/// One kernel position: tensor index and the input→output displacement
#[derive(Debug, Clone, Copy)]
struct Tap {
    index: [usize; 3],
    /// `k - pad`; output = input - shift
    shift: [i32; 3],
}

impl Tap {
    #[inline]
    fn output_for(&self, input: VoxelCoord) -> VoxelCoord {
        input.offset(-self.shift[0], -self.shift[1], -self.shift[2])
    }
}

/// Gradients produced by [`SparseConvLayer::backward`]
#[derive(Debug, Clone)]
pub struct ConvGradients {
    pub weights: Array5<Float>,
    pub bias: Array1<Float>,
    /// dL/dinput on the occupied input voxels
    pub input: SparseGrid,
}

/// Sparse convolution + ReLU
#[derive(Debug, Clone)]
pub struct SparseConvLayer {
    bank: FilterBank,
    pad: usize,
    taps: Vec<Tap>,
}

impl SparseConvLayer {
    /// Wrap a filter bank, checking it against the expected input width
    ///
    /// A mismatch here is a configuration error and is fatal for the run.
    pub fn new(bank: FilterBank, expected_in_channels: usize, pad: usize) -> Result<Self> {
        if bank.in_channels() != expected_in_channels {
            return Err(Vote3DeepError::ChannelMismatch {
                context: "filter bank input".into(),
                expected: expected_in_channels,
                got: bank.in_channels(),
            });
        }
        if bank.bias.len() != bank.out_channels() {
            return Err(Vote3DeepError::ShapeMismatch {
                name: "bias".into(),
                expected: vec![bank.out_channels()],
                got: bank.bias.shape().to_vec(),
            });
        }
        let filter_size = bank.filter_size();
        if filter_size.iter().any(|&k| pad >= k) {
            return Err(Vote3DeepError::invalid_config(format!(
                "padding {pad} must be smaller than filter size {filter_size:?}"
            )));
        }

        let pad_i = pad as i32;
        let mut taps = Vec::with_capacity(filter_size.iter().product());
        for a in 0..filter_size[0] {
            for b in 0..filter_size[1] {
                for c in 0..filter_size[2] {
                    taps.push(Tap {
                        index: [a, b, c],
                        shift: [a as i32 - pad_i, b as i32 - pad_i, c as i32 - pad_i],
                    });
                }
            }
        }

        Ok(Self { bank, pad, taps })
    }

    #[inline]
    pub fn bank(&self) -> &FilterBank {
        &self.bank
    }

    /// Mutable access for the optimizer; the bank's shape must not change
    #[inline]
    pub fn bank_mut(&mut self) -> &mut FilterBank {
        &mut self.bank
    }

    #[inline]
    pub fn in_channels(&self) -> usize {
        self.bank.in_channels()
    }

    #[inline]
    pub fn out_channels(&self) -> usize {
        self.bank.out_channels()
    }

    #[inline]
    pub fn pad(&self) -> usize {
        self.pad
    }

    /// Number of kernel taps
    #[inline]
    pub fn filter_volume(&self) -> usize {
        self.taps.len()
    }

    /// Weights re-laid out as `[tap][out][in]` so each tap is one contiguous block
    fn tap_major(&self) -> Vec<Float> {
        let (f_n, c_n) = (self.out_channels(), self.in_channels());
        let mut flat = Vec::with_capacity(self.taps.len() * f_n * c_n);
        for tap in &self.taps {
            let [a, b, c] = tap.index;
            for f in 0..f_n {
                for ch in 0..c_n {
                    flat.push(self.bank.weights[[f, ch, a, b, c]]);
                }
            }
        }
        flat
    }

    /// Forward pass: sparse scatter, bias, ReLU
    pub fn forward(&self, input: &SparseGrid) -> SparseGrid {
        assert_eq!(input.channels(), self.in_channels(), "Input channel mismatch");
        let (f_n, c_n) = (self.out_channels(), self.in_channels());
        let block = f_n * c_n;
        let weights = self.tap_major();

        // Pre-activation sums over the footprint of occupied inputs
        let mut sums = SparseGrid::with_capacity(f_n, input.len() * 4);
        for (coord, features) in input.iter() {
            for (t, tap) in self.taps.iter().enumerate() {
                let w = &weights[t * block..(t + 1) * block];
                let acc = sums.entry_mut(tap.output_for(coord));
                for (f, row) in w.chunks_exact(c_n).enumerate() {
                    acc[f] += dot(row, features);
                }
            }
        }

        let bias = &self.bank.bias;
        let mut output = SparseGrid::with_capacity(f_n, sums.len());
        let mut activation = vec![0.0; f_n];
        for (coord, pre) in sums.iter() {
            let mut any_active = false;
            for f in 0..f_n {
                let v = (pre[f] + bias[f]).max(0.0);
                activation[f] = v;
                any_active |= v > 0.0;
            }
            if any_active {
                output.set(coord, &activation);
            }
        }
        output
    }

    /// Backward pass
    ///
    /// `input` and `output` are the grids from the matching forward call;
    /// `grad_output` holds dL/doutput. Gradient only flows through activations
    /// that were positive in the forward pass.
    pub fn backward(
        &self,
        input: &SparseGrid,
        output: &SparseGrid,
        grad_output: &SparseGrid,
    ) -> ConvGradients {
        let (f_n, c_n) = (self.out_channels(), self.in_channels());
        let block = f_n * c_n;
        assert_eq!(grad_output.channels(), f_n, "Gradient channel mismatch");

        // ReLU mask applied to the upstream gradient
        let mut bias_grad = Array1::<Float>::zeros(f_n);
        let mut delta = SparseGrid::with_capacity(f_n, grad_output.len());
        let mut masked = vec![0.0; f_n];
        for (coord, grad) in grad_output.iter() {
            let Some(activation) = output.feature(coord) else {
                continue;
            };
            for f in 0..f_n {
                masked[f] = if activation[f] > 0.0 { grad[f] } else { 0.0 };
                bias_grad[f] += masked[f];
            }
            delta.set(coord, &masked);
        }

        let weights = self.tap_major();
        let mut weight_grad_taps = vec![0.0; self.taps.len() * block];
        let mut input_grad = SparseGrid::with_capacity(c_n, input.len());
        let mut grad_in = vec![0.0; c_n];

        for (coord, features) in input.iter() {
            grad_in.iter_mut().for_each(|g| *g = 0.0);
            for (t, tap) in self.taps.iter().enumerate() {
                let Some(d) = delta.feature(tap.output_for(coord)) else {
                    continue;
                };
                let w = &weights[t * block..(t + 1) * block];
                let gw = &mut weight_grad_taps[t * block..(t + 1) * block];
                for f in 0..f_n {
                    let df = d[f];
                    if df == 0.0 {
                        continue;
                    }
                    let row = f * c_n;
                    for ch in 0..c_n {
                        gw[row + ch] += df * features[ch];
                        grad_in[ch] += df * w[row + ch];
                    }
                }
            }
            input_grad.set(coord, &grad_in);
        }

        let [kx, ky, kz] = self.bank.filter_size();
        let mut weight_grad = Array5::<Float>::zeros((f_n, c_n, kx, ky, kz));
        for (t, tap) in self.taps.iter().enumerate() {
            let [a, b, c] = tap.index;
            for f in 0..f_n {
                for ch in 0..c_n {
                    weight_grad[[f, ch, a, b, c]] = weight_grad_taps[t * block + f * c_n + ch];
                }
            }
        }

        ConvGradients {
            weights: weight_grad,
            bias: bias_grad,
            input: input_grad,
        }
    }
}

#[inline]
fn dot(a: &[Float], b: &[Float]) -> Float {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn bank_from_fn(
        out: usize,
        inp: usize,
        bias: Vec<Float>,
        f: impl Fn((usize, usize, usize, usize, usize)) -> Float,
    ) -> FilterBank {
        FilterBank::new(Array5::from_shape_fn((out, inp, 3, 3, 3), f), Array1::from(bias))
    }

    fn random_bank(rng: &mut StdRng, out: usize, inp: usize) -> FilterBank {
        let bias: Vec<Float> = (0..out).map(|_| rng.random_range(-0.2..0.2)).collect();
        let weights: Vec<Float> = (0..out * inp * 27).map(|_| rng.random_range(-1.0..1.0)).collect();
        FilterBank::new(
            Array5::from_shape_vec((out, inp, 3, 3, 3), weights).unwrap(),
            Array1::from(bias),
        )
    }

    fn random_grid(rng: &mut StdRng, channels: usize, voxels: usize, extent: i32) -> SparseGrid {
        let mut grid = SparseGrid::new(channels);
        while grid.len() < voxels {
            let c = VoxelCoord::new(
                rng.random_range(0..extent),
                rng.random_range(0..extent),
                rng.random_range(0..extent),
            );
            let f: Vec<Float> = (0..channels).map(|_| rng.random_range(0.0..1.0)).collect();
            grid.set(c, &f);
        }
        grid
    }

    // ==================== Construction ====================

    #[test]
    fn test_channel_mismatch_rejected() {
        let bank = FilterBank::zeros(8, 6, [3, 3, 3]);
        let err = SparseConvLayer::new(bank, 8, 1).unwrap_err();
        assert!(matches!(
            err,
            Vote3DeepError::ChannelMismatch { expected: 8, got: 6, .. }
        ));
    }

    #[test]
    fn test_bias_shape_rejected() {
        let mut bank = FilterBank::zeros(4, 2, [3, 3, 3]);
        bank.bias = Array1::zeros(3);
        assert!(matches!(
            SparseConvLayer::new(bank, 2, 1),
            Err(Vote3DeepError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_tap_count() {
        let layer = SparseConvLayer::new(FilterBank::zeros(2, 2, [3, 3, 3]), 2, 1).unwrap();
        assert_eq!(layer.filter_volume(), 27);
    }

    // ==================== Forward ====================

    #[test]
    fn test_forward_matches_dense_reference() {
        let mut rng = StdRng::seed_from_u64(7);
        let bank = random_bank(&mut rng, 3, 2);
        let layer = SparseConvLayer::new(bank.clone(), 2, 1).unwrap();
        let input = random_grid(&mut rng, 2, 6, 5);
        let output = layer.forward(&input);

        // Every voxel within one step of an occupied input, computed densely
        for x in -2..7 {
            for y in -2..7 {
                for z in -2..7 {
                    let o = VoxelCoord::new(x, y, z);
                    let mut touched = false;
                    let mut pre = bank.bias.to_vec();
                    for a in 0..3 {
                        for b in 0..3 {
                            for c in 0..3 {
                                let i = o.offset(a as i32 - 1, b as i32 - 1, c as i32 - 1);
                                if let Some(feat) = input.feature(i) {
                                    touched = true;
                                    for f in 0..3 {
                                        for ch in 0..2 {
                                            pre[f] += bank.weights[[f, ch, a, b, c]] * feat[ch];
                                        }
                                    }
                                }
                            }
                        }
                    }
                    let relu: Vec<Float> = pre.iter().map(|v| v.max(0.0)).collect();
                    let any = relu.iter().any(|&v| v > 0.0);
                    if touched && any {
                        let got = output.feature(o).expect("active voxel missing");
                        for f in 0..3 {
                            assert_relative_eq!(got[f], relu[f], epsilon = 1e-12);
                        }
                    } else {
                        assert!(!output.contains(o), "inactive voxel {o:?} stored");
                    }
                }
            }
        }
    }

    #[test]
    fn test_sparsity_bound() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..5 {
            let layer = SparseConvLayer::new(random_bank(&mut rng, 4, 3), 3, 1).unwrap();
            let input = random_grid(&mut rng, 3, 10, 8);
            let output = layer.forward(&input);
            assert!(output.len() <= input.len() * layer.filter_volume());
            for (_, act) in output.iter() {
                assert!(act.iter().all(|&v| v >= 0.0));
                assert!(act.iter().any(|&v| v > 0.0));
            }
        }
    }

    #[test]
    fn test_non_positive_preactivation_not_stored() {
        // All-negative weights on a positive input: nothing survives the ReLU
        let bank = bank_from_fn(2, 1, vec![0.0, 0.0], |_| -0.5);
        let layer = SparseConvLayer::new(bank, 1, 1).unwrap();
        let input = SparseGrid::from_entries(1, vec![(VoxelCoord::new(0, 0, 0), [1.0])]);
        assert!(layer.forward(&input).is_empty());

        // Zero weights and zero bias: pre-activation exactly 0 is not stored either
        let layer = SparseConvLayer::new(FilterBank::zeros(2, 1, [3, 3, 3]), 1, 1).unwrap();
        assert!(layer.forward(&input).is_empty());
    }

    #[test]
    fn test_single_voxel_footprint() {
        let bank = bank_from_fn(1, 1, vec![0.0], |_| 1.0);
        let layer = SparseConvLayer::new(bank, 1, 1).unwrap();
        let input = SparseGrid::from_entries(1, vec![(VoxelCoord::new(5, 5, 5), [2.0])]);
        let output = layer.forward(&input);
        assert_eq!(output.len(), 27);
        assert_relative_eq!(output.get(VoxelCoord::new(4, 6, 5))[0], 2.0);
        assert!(!output.contains(VoxelCoord::new(3, 5, 5)));
    }

    // ==================== Gradients ====================

    fn upstream(coord: VoxelCoord, f: usize) -> Float {
        0.2 + 0.1 * ((coord.x * 7 + coord.y * 3 + coord.z * 5 + f as i32).rem_euclid(5)) as Float
    }

    /// J = Σ_o Σ_f upstream(o, f) · out[o][f]
    fn objective(layer: &SparseConvLayer, input: &SparseGrid) -> Float {
        layer
            .forward(input)
            .iter()
            .map(|(c, act)| act.iter().enumerate().map(|(f, a)| upstream(c, f) * a).sum::<Float>())
            .sum()
    }

    fn grad_grid(output: &SparseGrid) -> SparseGrid {
        let mut g = SparseGrid::new(output.channels());
        for c in output.occupied_coords() {
            let v: Vec<Float> = (0..output.channels()).map(|f| upstream(c, f)).collect();
            g.set(c, &v);
        }
        g
    }

    #[test]
    fn test_numerical_gradient_small_grid() {
        // 3×3×3 grid, 2 occupied voxels, 2 input channels, 1 filter.
        // Weights are multiples of 0.05 and the bias is chosen so no
        // pre-activation sits near the ReLU kink.
        let bank = bank_from_fn(1, 2, vec![-0.4321], |(_, ch, a, b, c)| {
            0.1 + 0.05 * ((ch + a * 3 + b * 5 + c * 2) % 7) as Float
        });
        let layer = SparseConvLayer::new(bank, 2, 1).unwrap();
        let input = SparseGrid::from_entries(
            2,
            vec![
                (VoxelCoord::new(1, 1, 1), vec![1.0, 0.5]),
                (VoxelCoord::new(2, 1, 1), vec![0.3, 0.8]),
            ],
        );

        let output = layer.forward(&input);
        assert!(!output.is_empty());
        let grads = layer.backward(&input, &output, &grad_grid(&output));
        let eps = 1e-6;

        // Weights
        for (idx, &analytic) in grads.weights.indexed_iter() {
            let mut plus = layer.clone();
            plus.bank_mut().weights[idx] += eps;
            let mut minus = layer.clone();
            minus.bank_mut().weights[idx] -= eps;
            let numeric = (objective(&plus, &input) - objective(&minus, &input)) / (2.0 * eps);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-6, max_relative = 1e-3);
        }

        // Bias
        let mut plus = layer.clone();
        plus.bank_mut().bias[0] += eps;
        let mut minus = layer.clone();
        minus.bank_mut().bias[0] -= eps;
        let numeric = (objective(&plus, &input) - objective(&minus, &input)) / (2.0 * eps);
        assert_relative_eq!(grads.bias[0], numeric, epsilon = 1e-6, max_relative = 1e-3);

        // Input features
        for coord in input.occupied_coords() {
            for ch in 0..2 {
                let mut plus = input.clone();
                plus.entry_mut(coord)[ch] += eps;
                let mut minus = input.clone();
                minus.entry_mut(coord)[ch] -= eps;
                let numeric = (objective(&layer, &plus) - objective(&layer, &minus)) / (2.0 * eps);
                assert_relative_eq!(
                    grads.input.get(coord)[ch],
                    numeric,
                    epsilon = 1e-6,
                    max_relative = 1e-3
                );
            }
        }
    }

    #[test]
    fn test_backward_ignores_inactive_outputs() {
        let bank = bank_from_fn(1, 1, vec![0.0], |_| -1.0);
        let layer = SparseConvLayer::new(bank, 1, 1).unwrap();
        let input = SparseGrid::from_entries(1, vec![(VoxelCoord::new(0, 0, 0), [1.0])]);
        let output = layer.forward(&input);

        // Upstream gradient on voxels that were never active
        let grad = SparseGrid::from_entries(1, vec![(VoxelCoord::new(0, 0, 0), [5.0])]);
        let grads = layer.backward(&input, &output, &grad);
        assert!(grads.weights.iter().all(|&g| g == 0.0));
        assert_eq!(grads.bias[0], 0.0);
        assert_eq!(grads.input.get(VoxelCoord::new(0, 0, 0))[0], 0.0);
    }

    #[test]
    fn test_bias_gradient_sums_active_outputs() {
        let bank = bank_from_fn(1, 1, vec![0.1], |_| 1.0);
        let layer = SparseConvLayer::new(bank, 1, 1).unwrap();
        let input = SparseGrid::from_entries(1, vec![(VoxelCoord::new(0, 0, 0), [1.0])]);
        let output = layer.forward(&input);
        let ones = output.map_features(|_| 1.0);
        let grads = layer.backward(&input, &output, &ones);
        assert_relative_eq!(grads.bias[0], output.len() as Float);
    }
}
