//! Engine configuration
//!
//! Every hyperparameter lives in one immutable [`EngineConfig`] built at startup
//! and threaded through the network, optimizer, miner and engine. Defaults are
//! the constants of the Vote3Deep architecture (section V C of the paper).

use crate::error::{Result, Vote3DeepError};
use crate::Float;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Samples per optimizer step (fixed by the paper)
pub const BATCH_SIZE: usize = 16;

/// SGD momentum
pub const SGD_MOMENTUM: Float = 0.9;

/// L2 weight decay, weights only
pub const L2_WEIGHT_DECAY: Float = 0.0001;

/// Learning rate
pub const LEARNING_RATE: Float = 0.001;

/// Default L1 activation penalty coefficient
pub const L1_PENALTY: Float = 0.0001;

/// Default hinge margin
pub const HINGE_MARGIN: Float = 1.0;

/// Default number of epochs
pub const EPOCHS: usize = 100;

/// Default voxel edge length in metres
pub const DEFAULT_RESOLUTION: Float = 0.2;

/// Angular bins used by the voxelization collaborator (360 / 45)
pub const ANGULAR_BINS: usize = 8;

/// Object class being trained; names the crop and run directories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    Car,
    Pedestrian,
    Cyclist,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 3] = [ObjectClass::Car, ObjectClass::Pedestrian, ObjectClass::Cyclist];

    /// Directory name, matching the KITTI label spelling
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Car => "Car",
            ObjectClass::Pedestrian => "Pedestrian",
            ObjectClass::Cyclist => "Cyclist",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectClass {
    type Err = Vote3DeepError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                Vote3DeepError::invalid_config(format!(
                    "unknown object class '{s}', expected one of Car, Pedestrian, Cyclist"
                ))
            })
    }
}

/// Shape of the two sparse convolution stages and the scoring window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Input feature channels (default: 6)
    pub channels1: usize,
    /// Filters in layer 1, also the input width of layer 2 (default: 8)
    pub num_filters1: usize,
    /// Filters in layer 2 (default: 8)
    pub num_filters2: usize,
    /// Kernel extent per axis (default: 3×3×3)
    pub filter_size: [usize; 3],
    /// Symmetric padding per axis (default: 1)
    pub pad: usize,
    /// Scoring window in voxels (default: 2.0m × 1.0m × 2.0m at 0.2m = 10×5×10)
    pub receptive_field: [usize; 3],
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channels1: 6,
            num_filters1: 8,
            num_filters2: 8,
            filter_size: [3, 3, 3],
            pad: 1,
            receptive_field: Self::receptive_field_for([2.0, 1.0, 2.0], DEFAULT_RESOLUTION),
        }
    }
}

impl NetworkConfig {
    /// Window size in voxels for a physical extent (metres) at `resolution`
    ///
    /// Uses the 95th percentile object extent; pedestrians and cyclists share
    /// 2.0 × 1.0 × 2.0.
    pub fn receptive_field_for(extent: [Float; 3], resolution: Float) -> [usize; 3] {
        extent.map(|e| (e / resolution).round().max(1.0) as usize)
    }

    /// Input width of layer 2
    #[inline]
    pub fn channels2(&self) -> usize {
        self.num_filters1
    }

    /// Number of taps in one filter
    #[inline]
    pub fn kernel_volume(&self) -> usize {
        self.filter_size.iter().product()
    }

    /// Number of cells in the scoring window
    #[inline]
    pub fn window_volume(&self) -> usize {
        self.receptive_field.iter().product()
    }

    /// Length of the dense scoring weight vector
    #[inline]
    pub fn head_len(&self) -> usize {
        self.window_volume() * self.num_filters2
    }

    /// (out, in, kx, ky, kz) for layer 1
    pub fn w1_shape(&self) -> [usize; 5] {
        let [kx, ky, kz] = self.filter_size;
        [self.num_filters1, self.channels1, kx, ky, kz]
    }

    /// (out, in, kx, ky, kz) for layer 2
    pub fn w2_shape(&self) -> [usize; 5] {
        let [kx, ky, kz] = self.filter_size;
        [self.num_filters2, self.channels2(), kx, ky, kz]
    }

    /// Sets the receptive field.
    pub fn with_receptive_field(mut self, receptive_field: [usize; 3]) -> Self {
        self.receptive_field = receptive_field;
        self
    }

    /// Sets channel and filter counts.
    pub fn with_channels(mut self, channels1: usize, num_filters1: usize, num_filters2: usize) -> Self {
        self.channels1 = channels1;
        self.num_filters1 = num_filters1;
        self.num_filters2 = num_filters2;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels1 == 0 || self.num_filters1 == 0 || self.num_filters2 == 0 {
            return Err(Vote3DeepError::invalid_config("channel and filter counts must be > 0"));
        }
        if self.filter_size.iter().any(|&k| k == 0) {
            return Err(Vote3DeepError::invalid_config("filter size must be > 0 on every axis"));
        }
        if self.filter_size.iter().any(|&k| self.pad >= k) {
            return Err(Vote3DeepError::invalid_config(format!(
                "padding {} must be smaller than filter size {:?}",
                self.pad, self.filter_size
            )));
        }
        if self.receptive_field.iter().any(|&r| r == 0) {
            return Err(Vote3DeepError::invalid_config("receptive field must be > 0 on every axis"));
        }
        Ok(())
    }
}

/// SGD hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Learning rate (default: 0.001)
    pub learning_rate: Float,
    /// Momentum (default: 0.9)
    pub momentum: Float,
    /// L2 weight decay on weights, not biases (default: 0.0001)
    pub weight_decay: Float,
    /// L1 penalty coefficient on hidden activations (default: 0.0001)
    pub l1_penalty: Float,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: LEARNING_RATE,
            momentum: SGD_MOMENTUM,
            weight_decay: L2_WEIGHT_DECAY,
            l1_penalty: L1_PENALTY,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        let ok = self.learning_rate > 0.0
            && (0.0..1.0).contains(&self.momentum)
            && self.weight_decay >= 0.0
            && self.l1_penalty >= 0.0;
        if ok {
            Ok(())
        } else {
            Err(Vote3DeepError::invalid_config(format!("invalid optimizer settings: {self:?}")))
        }
    }
}

/// Hinge loss settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Margin in `max(0, margin - y·s)` (default: 1.0)
    pub margin: Float,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { margin: HINGE_MARGIN }
    }
}

/// Scene parameters handed to the voxelization collaborator
///
/// Not read by the training core; recorded with the run so crops can be
/// regenerated consistently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Angular bins for rotation augmentation (default: 8)
    pub angular_bins: usize,
    /// Forward range in metres (default: 0..80)
    pub x_range: (Float, Float),
    /// Lateral half-ranges in metres (default: 40, 40)
    pub y_range: (Float, Float),
    /// Vertical range below/above sensor in metres (default: 2.5, 1.5)
    pub z_range: (Float, Float),
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            angular_bins: ANGULAR_BINS,
            x_range: (0.0, 80.0),
            y_range: (40.0, 40.0),
            z_range: (2.5, 1.5),
        }
    }
}

/// Full configuration for a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum points per voxel for a feature vector
    pub fv_thresh: u32,
    /// Minimum feature vectors per window
    pub wd_thresh: u32,
    /// Voxel edge length in metres (default: 0.2)
    pub resolution: Float,
    /// Size of the mined negative pool; close to the core count works well
    pub batchsize_hnm: usize,
    /// Target object class (default: Pedestrian)
    pub object: ObjectClass,
    /// Samples per optimizer step (default: 16)
    pub batch_size: usize,
    /// Total epochs (default: 100)
    pub epochs: usize,
    /// Epochs between mining rounds (default: 1)
    pub mining_interval: usize,
    /// Seed for initialization, shuffling and the first random pool
    pub seed: u64,
    pub network: NetworkConfig,
    pub optimizer: OptimizerConfig,
    pub loss: LossConfig,
    pub scene: SceneConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fv_thresh: 0,
            wd_thresh: 0,
            resolution: DEFAULT_RESOLUTION,
            batchsize_hnm: 16,
            object: ObjectClass::Pedestrian,
            batch_size: BATCH_SIZE,
            epochs: EPOCHS,
            mining_interval: 1,
            seed: 42,
            network: NetworkConfig::default(),
            optimizer: OptimizerConfig::default(),
            loss: LossConfig::default(),
            scene: SceneConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Config for the given thresholds with every other value at its default
    pub fn new(fv_thresh: u32, wd_thresh: u32, batchsize_hnm: usize) -> Self {
        Self {
            fv_thresh,
            wd_thresh,
            batchsize_hnm,
            ..Self::default()
        }
    }

    /// Sets the voxel resolution and rescales the scoring window to match.
    pub fn with_resolution(mut self, resolution: Float) -> Self {
        let extent = self.network.receptive_field.map(|r| r as Float * self.resolution);
        self.resolution = resolution;
        self.network.receptive_field = NetworkConfig::receptive_field_for(extent, resolution);
        self
    }

    pub fn with_object(mut self, object: ObjectClass) -> Self {
        self.object = object;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_mining_interval(mut self, interval: usize) -> Self {
        self.mining_interval = interval;
        self
    }

    /// Threshold-specific run folder name, e.g. `fv=2, wd=50` → `"250"`
    pub fn threshold_tag(&self) -> String {
        format!("{}{}", self.fv_thresh, self.wd_thresh)
    }

    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.optimizer.validate()?;
        if !(self.resolution > 0.0) {
            return Err(Vote3DeepError::invalid_config("resolution must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(Vote3DeepError::invalid_config("batch size must be > 0"));
        }
        if self.batchsize_hnm == 0 {
            return Err(Vote3DeepError::invalid_config("hard negative mining batch size must be > 0"));
        }
        if self.mining_interval == 0 {
            return Err(Vote3DeepError::invalid_config("mining interval must be > 0"));
        }
        if !(self.loss.margin > 0.0) {
            return Err(Vote3DeepError::invalid_config("hinge margin must be > 0"));
        }
        Ok(())
    }
}
