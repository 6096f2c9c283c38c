//! Vote3Deep: sparse 3D convolutional object detector training
//!
//! Trains a two-layer sparse convolutional network on voxelized LiDAR crops
//! with a hinge loss, L1 activation sparsity and hard-negative mining.
//!
//! Modules:
//! - `grid`: sparse voxel grid
//! - `conv`, `head`, `network`: the detector and its gradients
//! - `loss`, `optimizer`: hinge loss and SGD with momentum
//! - `corpus`, `mining`: crop sources and hard-negative selection
//! - `checkpoint`, `log`, `layout`: on-disk run state
//! - `engine`: the epoch loop
//! - `config`, `error`: hyperparameters and the error type

pub mod checkpoint;
pub mod config;
pub mod conv;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod grid;
pub mod head;
pub mod layout;
pub mod log;
pub mod loss;
pub mod mining;
pub mod network;
pub mod optimizer;

/// Floating point type used for features, weights and gradients
pub type Float = f64;

pub use checkpoint::{load_momentum, save_momentum, Checkpoint};
pub use config::{EngineConfig, LossConfig, NetworkConfig, ObjectClass, OptimizerConfig, SceneConfig};
pub use conv::{ConvGradients, FilterBank, SparseConvLayer};
pub use corpus::{CropCorpus, CropLoader, CropSource, InMemoryCorpus, NpyCropLoader};
pub use engine::{EngineState, StopHandle, TrainingEngine, TrainingSummary};
pub use error::{Result, Vote3DeepError};
pub use grid::{OccupiedCoords, SparseGrid, VoxelCoord};
pub use head::{HeadGradients, ScoringHead};
pub use layout::RunLayout;
pub use log::{ScoreErrorLog, ScoreErrorRecord};
pub use loss::{HingeLoss, Label};
pub use mining::{random_pool, HardNegativeMiner, MinedNegative, MinedPool};
pub use network::{ForwardTrace, Gradients, InitStrategy, NetworkParams, Scorer, Vote3DeepNetwork};
pub use optimizer::Sgd;
