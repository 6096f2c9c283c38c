//! Optimizer for the sparse detector

use crate::config::{NetworkConfig, OptimizerConfig};
use crate::error::Result;
use crate::network::{ForwardTrace, Gradients, NetworkParams, Vote3DeepNetwork};
use crate::Float;
use ndarray::{Array, Dimension, Zip};

/// SGD with momentum, L2 weight decay on weights and an L1 activation penalty
///
/// The L1 term reaches the gradients through [`Vote3DeepNetwork::backward`];
/// this struct only holds its coefficient so the engine can report it.
#[derive(Debug, Clone)]
pub struct Sgd {
    /// Learning rate
    pub lr: Float,
    /// Momentum
    pub momentum: Float,
    /// L2 weight decay (weights only, biases are not decayed)
    pub weight_decay: Float,
    /// L1 penalty coefficient on hidden activations
    pub l1_penalty: Float,
    /// Velocity, same shapes as the parameters
    velocity: NetworkParams,
    /// Steps taken
    t: usize,
}

impl Sgd {
    /// Create with zero velocity
    pub fn new(config: &OptimizerConfig, network: &NetworkConfig) -> Self {
        Self {
            lr: config.learning_rate,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
            l1_penalty: config.l1_penalty,
            velocity: NetworkParams::zeros(network),
            t: 0,
        }
    }

    /// Restore a saved velocity
    pub fn restore_velocity(&mut self, velocity: NetworkParams, network: &NetworkConfig) -> Result<()> {
        velocity.check_shapes(network)?;
        self.velocity = velocity;
        Ok(())
    }

    pub fn velocity(&self) -> &NetworkParams {
        &self.velocity
    }

    /// Number of updates applied
    pub fn steps(&self) -> usize {
        self.t
    }

    /// L1 penalty value for one forward pass
    pub fn penalty(&self, trace: &ForwardTrace<'_>) -> Float {
        self.l1_penalty * trace.activation_sum()
    }

    /// Apply one update
    ///
    /// `v ← momentum·v − lr·(g + decay·p)` for weights, `v ← momentum·v − lr·g`
    /// for biases, then `p ← p + v`.
    pub fn step(&mut self, network: &mut Vote3DeepNetwork, grads: &Gradients) {
        self.t += 1;
        let (lr, m, decay) = (self.lr, self.momentum, self.weight_decay);
        let params = network.params_mut();
        let v = &mut self.velocity;

        update(params.w1, &mut v.w1, &grads.w1, lr, m, decay);
        update(params.b1, &mut v.b1, &grads.b1, lr, m, 0.0);
        update(params.w2, &mut v.w2, &grads.w2, lr, m, decay);
        update(params.b2, &mut v.b2, &grads.b2, lr, m, 0.0);
        update(params.w3, &mut v.w3, &grads.w3, lr, m, decay);

        v.b3 = m * v.b3 - lr * grads.b3;
        *params.b3 += v.b3;
    }
}

fn update<D: Dimension>(
    param: &mut Array<Float, D>,
    velocity: &mut Array<Float, D>,
    grad: &Array<Float, D>,
    lr: Float,
    momentum: Float,
    decay: Float,
) {
    Zip::from(param)
        .and(velocity)
        .and(grad)
        .for_each(|p, v, &g| {
            *v = momentum * *v - lr * (g + decay * *p);
            *p += *v;
        });
}
