//! Two-layer sparse convolutional detector
//!
//! Architecture:
//! - Layer 1: sparse conv, `channels1 → num_filters1`, ReLU
//! - Layer 2: sparse conv, `num_filters1 → num_filters2`, ReLU
//! - Head: linear score over the receptive-field window
//!
//! Backward applies an L1 sub-gradient on both hidden activations so the
//! optimizer sees `d/dθ [grad_score · s + l1 · (Σ|h1| + Σ|h2|)]`.

use crate::checkpoint::Checkpoint;
use crate::config::NetworkConfig;
use crate::conv::{FilterBank, SparseConvLayer};
use crate::error::{Result, Vote3DeepError};
use crate::grid::SparseGrid;
use crate::head::ScoringHead;
use crate::Float;
use ndarray::{Array1, Array5};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Anything that can score a crop; the miner only needs this
pub trait Scorer: Sync {
    fn score(&self, grid: &SparseGrid) -> Result<Float>;
}

/// How to obtain the initial parameters
#[derive(Debug, Clone)]
pub enum InitStrategy {
    /// Kaiming-normal weights, zero biases
    Fresh { seed: u64 },
    /// Parameters taken verbatim from a checkpoint
    Resume(Checkpoint),
}

/// The six learnable tensors
///
/// Also used for gradients and optimizer velocity, which share the shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParams {
    pub w1: Array5<Float>,
    pub b1: Array1<Float>,
    pub w2: Array5<Float>,
    pub b2: Array1<Float>,
    pub w3: Array1<Float>,
    pub b3: Float,
}

/// Gradients with respect to [`NetworkParams`]
pub type Gradients = NetworkParams;

impl NetworkParams {
    pub fn zeros(config: &NetworkConfig) -> Self {
        Self {
            w1: Array5::zeros(config.w1_shape()),
            b1: Array1::zeros(config.num_filters1),
            w2: Array5::zeros(config.w2_shape()),
            b2: Array1::zeros(config.num_filters2),
            w3: Array1::zeros(config.head_len()),
            b3: 0.0,
        }
    }

    /// Kaiming-normal (fan_in, ReLU gain) weights and zero biases
    ///
    /// `std = sqrt(2 / fan_in)` where fan_in is `in · kx · ky · kz` for the
    /// filter banks and the window length for the head.
    pub fn kaiming(config: &NetworkConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = Self::zeros(config);

        let kv = config.kernel_volume();
        // The head is one linear unit over the flattened window, so fan_in is its full length
        let fan_ins = [
            config.channels1 * kv,
            config.channels2() * kv,
            config.head_len(),
        ];
        let [d1, d2, d3] = fan_ins.map(|fan_in| Normal::new(0.0, (2.0 / fan_in as Float).sqrt()));
        let d1 = d1.map_err(|e| Vote3DeepError::invalid_config(e.to_string()))?;
        let d2 = d2.map_err(|e| Vote3DeepError::invalid_config(e.to_string()))?;
        let d3 = d3.map_err(|e| Vote3DeepError::invalid_config(e.to_string()))?;

        params.w1.mapv_inplace(|_| d1.sample(&mut rng));
        params.w2.mapv_inplace(|_| d2.sample(&mut rng));
        params.w3.mapv_inplace(|_| d3.sample(&mut rng));
        Ok(params)
    }

    /// Check every tensor against the shapes `config` requires
    pub fn check_shapes(&self, config: &NetworkConfig) -> Result<()> {
        let expected: [(&str, Vec<usize>, &[usize]); 5] = [
            ("w1", config.w1_shape().to_vec(), self.w1.shape()),
            ("b1", vec![config.num_filters1], self.b1.shape()),
            ("w2", config.w2_shape().to_vec(), self.w2.shape()),
            ("b2", vec![config.num_filters2], self.b2.shape()),
            ("w3", vec![config.head_len()], self.w3.shape()),
        ];
        for (name, want, got) in expected {
            if want.as_slice() != got {
                return Err(Vote3DeepError::ShapeMismatch {
                    name: name.into(),
                    expected: want,
                    got: got.to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Total number of scalars
    pub fn num_params(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len() + self.w3.len() + 1
    }

    /// Element-wise `self += other`
    pub fn add_assign(&mut self, other: &Self) {
        self.w1 += &other.w1;
        self.b1 += &other.b1;
        self.w2 += &other.w2;
        self.b2 += &other.b2;
        self.w3 += &other.w3;
        self.b3 += other.b3;
    }

    /// Multiply every value by `factor`
    pub fn scale(&mut self, factor: Float) {
        self.w1 *= factor;
        self.b1 *= factor;
        self.w2 *= factor;
        self.b2 *= factor;
        self.w3 *= factor;
        self.b3 *= factor;
    }

    pub fn is_finite(&self) -> bool {
        self.w1.iter().all(|v| v.is_finite())
            && self.b1.iter().all(|v| v.is_finite())
            && self.w2.iter().all(|v| v.is_finite())
            && self.b2.iter().all(|v| v.is_finite())
            && self.w3.iter().all(|v| v.is_finite())
            && self.b3.is_finite()
    }

    /// Global L2 norm, for logging
    pub fn norm(&self) -> Float {
        let sq = |a: Float, v: &Float| a + v * v;
        let total = self.w1.iter().fold(0.0, sq)
            + self.b1.iter().fold(0.0, sq)
            + self.w2.iter().fold(0.0, sq)
            + self.b2.iter().fold(0.0, sq)
            + self.w3.iter().fold(0.0, sq)
            + self.b3 * self.b3;
        total.sqrt()
    }
}

/// Mutable views of the parameters, handed to the optimizer
pub struct ParamsMut<'a> {
    pub w1: &'a mut Array5<Float>,
    pub b1: &'a mut Array1<Float>,
    pub w2: &'a mut Array5<Float>,
    pub b2: &'a mut Array1<Float>,
    pub w3: &'a mut Array1<Float>,
    pub b3: &'a mut Float,
}

/// Intermediate activations of one forward pass
#[derive(Debug, Clone)]
pub struct ForwardTrace<'a> {
    pub input: &'a SparseGrid,
    pub hidden1: SparseGrid,
    pub hidden2: SparseGrid,
    pub score: Float,
}

impl ForwardTrace<'_> {
    /// Σ|h1| + Σ|h2|; activations are post-ReLU so this is a plain sum
    pub fn activation_sum(&self) -> Float {
        self.hidden1.sum() + self.hidden2.sum()
    }
}

/// Sparse conv → sparse conv → linear score
#[derive(Debug, Clone)]
pub struct Vote3DeepNetwork {
    config: NetworkConfig,
    conv1: SparseConvLayer,
    conv2: SparseConvLayer,
    head: ScoringHead,
}

impl Vote3DeepNetwork {
    pub fn new(config: &NetworkConfig, init: InitStrategy) -> Result<Self> {
        config.validate()?;
        match init {
            InitStrategy::Fresh { seed } => Self::from_params(config, NetworkParams::kaiming(config, seed)?),
            InitStrategy::Resume(checkpoint) => {
                let name = Checkpoint::file_name(checkpoint.epoch);
                checkpoint
                    .params
                    .check_shapes(config)
                    .map_err(|e| Vote3DeepError::corrupt_checkpoint(name, e))?;
                Self::from_params(config, checkpoint.params)
            }
        }
    }

    /// Build directly from parameters
    pub fn from_params(config: &NetworkConfig, params: NetworkParams) -> Result<Self> {
        params.check_shapes(config)?;
        let NetworkParams { w1, b1, w2, b2, w3, b3 } = params;
        let conv1 = SparseConvLayer::new(FilterBank::new(w1, b1), config.channels1, config.pad)?;
        let conv2 = SparseConvLayer::new(FilterBank::new(w2, b2), config.channels2(), config.pad)?;
        let head = ScoringHead::new(w3, b3, config.receptive_field, config.num_filters2)?;
        Ok(Self {
            config: config.clone(),
            conv1,
            conv2,
            head,
        })
    }

    #[inline]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Snapshot of the current parameters
    pub fn params(&self) -> NetworkParams {
        NetworkParams {
            w1: self.conv1.bank().weights.clone(),
            b1: self.conv1.bank().bias.clone(),
            w2: self.conv2.bank().weights.clone(),
            b2: self.conv2.bank().bias.clone(),
            w3: self.head.weights.clone(),
            b3: self.head.bias,
        }
    }

    pub fn params_mut(&mut self) -> ParamsMut<'_> {
        let FilterBank { weights: w1, bias: b1 } = self.conv1.bank_mut();
        let FilterBank { weights: w2, bias: b2 } = self.conv2.bank_mut();
        ParamsMut {
            w1,
            b1,
            w2,
            b2,
            w3: &mut self.head.weights,
            b3: &mut self.head.bias,
        }
    }

    /// Snapshot as a checkpoint for `epoch`
    pub fn to_checkpoint(&self, epoch: usize) -> Checkpoint {
        Checkpoint {
            epoch,
            params: self.params(),
        }
    }

    /// Reject grids whose channel width differs from layer 1's input
    pub fn check_input(&self, grid: &SparseGrid) -> Result<()> {
        if grid.channels() != self.config.channels1 {
            return Err(Vote3DeepError::ChannelMismatch {
                context: "network input".into(),
                expected: self.config.channels1,
                got: grid.channels(),
            });
        }
        Ok(())
    }

    /// Score only
    pub fn forward(&self, grid: &SparseGrid) -> Result<Float> {
        Ok(self.trace(grid)?.score)
    }

    /// Forward pass keeping the hidden activations for backward
    pub fn trace<'a>(&self, input: &'a SparseGrid) -> Result<ForwardTrace<'a>> {
        self.check_input(input)?;
        let hidden1 = self.conv1.forward(input);
        let hidden2 = self.conv2.forward(&hidden1);
        let score = self.head.forward(&hidden2);
        Ok(ForwardTrace {
            input,
            hidden1,
            hidden2,
            score,
        })
    }

    /// Gradients of `grad_score · s + l1 · Σ activations`
    pub fn backward(&self, trace: &ForwardTrace<'_>, grad_score: Float, l1: Float) -> Gradients {
        let head = self.head.backward(&trace.hidden2, grad_score);

        let mut grad_h2 = head.input;
        add_l1_subgradient(&mut grad_h2, &trace.hidden2, l1);
        let g2 = self.conv2.backward(&trace.hidden1, &trace.hidden2, &grad_h2);

        let mut grad_h1 = g2.input;
        add_l1_subgradient(&mut grad_h1, &trace.hidden1, l1);
        let g1 = self.conv1.backward(trace.input, &trace.hidden1, &grad_h1);

        NetworkParams {
            w1: g1.weights,
            b1: g1.bias,
            w2: g2.weights,
            b2: g2.bias,
            w3: head.weights,
            b3: head.bias,
        }
    }
}

impl Scorer for Vote3DeepNetwork {
    fn score(&self, grid: &SparseGrid) -> Result<Float> {
        self.forward(grid)
    }
}

/// grad += l1 · sign(activation)
fn add_l1_subgradient(grad: &mut SparseGrid, activations: &SparseGrid, l1: Float) {
    if l1 == 0.0 {
        return;
    }
    let mut sign = vec![0.0; activations.channels()];
    for (coord, act) in activations.iter() {
        for (s, &a) in sign.iter_mut().zip(act) {
            *s = if a > 0.0 { l1 } else { 0.0 };
        }
        grad.add(coord, &sign);
    }
}
