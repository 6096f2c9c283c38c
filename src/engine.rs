//! Training engine
//!
//! Drives the epoch loop:
//! - Mining: pick the negatives for this epoch (random on the first epoch of a
//!   fresh run, hard-negative mining afterwards)
//! - BatchTraining: interleave shuffled positives with the pool, batches of
//!   `batch_size`, per-sample forward/backward in parallel, ordered gradient
//!   reduction, one optimizer step per batch
//! - Checkpointing: weights, momentum, score-error row
//!
//! A [`StopHandle`] ends the run at the next epoch boundary; the last written
//! checkpoint is always complete.

use crate::checkpoint::{load_momentum, save_momentum, write_atomically, Checkpoint};
use crate::config::EngineConfig;
use crate::corpus::CropSource;
use crate::error::{Result, Vote3DeepError};
use crate::grid::SparseGrid;
use crate::layout::RunLayout;
use crate::log::{ScoreErrorLog, ScoreErrorRecord};
use crate::loss::{HingeLoss, Label};
use crate::mining::{random_pool, HardNegativeMiner, MinedPool};
use crate::network::{Gradients, InitStrategy, Vote3DeepNetwork};
use crate::optimizer::Sgd;
use crate::Float;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the engine is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Mining,
    BatchTraining,
    Checkpointing,
    Completed,
    Interrupted,
}

/// Cloneable flag for requesting a stop from another thread
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of [`TrainingEngine::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Epoch the run started at
    pub start_epoch: usize,
    /// One record per completed epoch
    pub records: Vec<ScoreErrorRecord>,
    /// `Completed` or `Interrupted`
    pub state: EngineState,
}

impl TrainingSummary {
    pub fn last_epoch(&self) -> Option<usize> {
        self.records.last().map(|r| r.epoch)
    }
}

/// Reference to one training sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleRef {
    Positive(usize),
    Negative(usize),
}

impl SampleRef {
    fn label(self) -> Label {
        match self {
            SampleRef::Positive(_) => Label::Positive,
            SampleRef::Negative(_) => Label::Negative,
        }
    }
}

/// Per-sample forward/backward output
struct SampleOutcome {
    loss: Float,
    error: bool,
    grads: Gradients,
}

/// Running totals for an epoch
#[derive(Debug, Default)]
struct EpochTotals {
    loss: Float,
    errors: usize,
    samples: usize,
}

/// Trains a [`Vote3DeepNetwork`] on a positive and a negative corpus
pub struct TrainingEngine<P, N> {
    config: EngineConfig,
    layout: RunLayout,
    positives: P,
    negatives: N,
    network: Vote3DeepNetwork,
    optimizer: Sgd,
    loss: HingeLoss,
    miner: HardNegativeMiner,
    log: ScoreErrorLog,
    start_epoch: usize,
    resumed: bool,
    pool: Option<MinedPool>,
    state: EngineState,
    stop: StopHandle,
}

impl<P: CropSource, N: CropSource> TrainingEngine<P, N> {
    /// Set up a fresh run (`resume = None`) or continue after checkpoint `k`
    pub fn new(
        config: EngineConfig,
        layout: RunLayout,
        positives: P,
        negatives: N,
        resume: Option<usize>,
    ) -> Result<Self> {
        config.validate()?;
        layout.ensure_dirs()?;

        let (network, optimizer, start_epoch, log) = match resume {
            None => {
                write_config(&layout, &config)?;
                let network = Vote3DeepNetwork::new(&config.network, InitStrategy::Fresh { seed: config.seed })?;
                let optimizer = Sgd::new(&config.optimizer, &config.network);
                let log = ScoreErrorLog::create_fresh(&layout.score_log())?;
                info!(
                    params = network.params().num_params(),
                    run_dir = %layout.run_dir.display(),
                    "starting fresh run"
                );
                (network, optimizer, 0, log)
            }
            Some(epoch) => {
                check_stored_config(&layout, &config)?;
                let checkpoint = Checkpoint::load(&layout.weights_dir, epoch, &config.network)?;
                let network = Vote3DeepNetwork::new(&config.network, InitStrategy::Resume(checkpoint))?;
                let mut optimizer = Sgd::new(&config.optimizer, &config.network);
                match load_momentum(&layout.weights_dir, epoch, &config.network)? {
                    Some(velocity) => optimizer.restore_velocity(velocity, &config.network)?,
                    None => warn!(epoch, "no momentum saved with checkpoint, starting from zero velocity"),
                }
                write_config(&layout, &config)?;
                let log = ScoreErrorLog::open_append(&layout.score_log())?;
                info!(from = epoch, next = epoch + 1, "resuming run");
                (network, optimizer, epoch + 1, log)
            }
        };

        Ok(Self {
            loss: HingeLoss::from(&config.loss),
            miner: HardNegativeMiner::new(config.batchsize_hnm),
            config,
            layout,
            positives,
            negatives,
            network,
            optimizer,
            log,
            start_epoch,
            resumed: resume.is_some(),
            pool: None,
            state: EngineState::Initializing,
            stop: StopHandle::new(),
        })
    }

    /// Replace the stop handle, e.g. with one wired to Ctrl-C
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn network(&self) -> &Vote3DeepNetwork {
        &self.network
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run until `config.epochs` or a stop request
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let mut records = Vec::new();
        info!(
            start = self.start_epoch,
            epochs = self.config.epochs,
            positives = self.positives.len(),
            negatives = self.negatives.len(),
            "training"
        );

        for epoch in self.start_epoch..self.config.epochs {
            if self.stop.is_stop_requested() {
                info!(epoch, "stop requested, leaving before epoch");
                self.state = EngineState::Interrupted;
                break;
            }

            self.state = EngineState::Mining;
            let negatives = self.select_negatives(epoch)?;

            self.state = EngineState::BatchTraining;
            let record = self.train_epoch(epoch, &negatives)?;

            self.state = EngineState::Checkpointing;
            self.checkpoint(record)?;
            records.push(record);
        }

        if self.state != EngineState::Interrupted {
            self.state = EngineState::Completed;
        }
        Ok(TrainingSummary {
            start_epoch: self.start_epoch,
            records,
            state: self.state,
        })
    }

    /// Corpus indices of the negatives to train on this epoch
    fn select_negatives(&mut self, epoch: usize) -> Result<Vec<usize>> {
        let fresh_start = epoch == 0 && !self.resumed;
        let due = self.pool.is_none() || epoch % self.config.mining_interval == 0;
        if !due {
            return Ok(self.pool.as_ref().map(MinedPool::indices).unwrap_or_default());
        }

        let pool = if fresh_start {
            random_pool(&self.negatives, self.config.batchsize_hnm, self.config.seed, epoch)
        } else {
            self.miner.mine(&self.network, &self.negatives, epoch)?
        };
        pool.save(&self.layout.hnm_dir)?;
        let indices = pool.indices();
        self.pool = Some(pool);
        Ok(indices)
    }

    /// Positives shuffled with a per-epoch seed, negatives spread evenly between them
    fn epoch_samples(&self, epoch: usize, negatives: &[usize]) -> Vec<SampleRef> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
        let mut positives: Vec<usize> = (0..self.positives.len()).collect();
        positives.shuffle(&mut rng);
        interleave(&positives, negatives)
    }

    fn train_epoch(&mut self, epoch: usize, negatives: &[usize]) -> Result<ScoreErrorRecord> {
        let samples = self.epoch_samples(epoch, negatives);
        let mut totals = EpochTotals::default();

        for (batch_index, batch) in samples.chunks(self.config.batch_size).enumerate() {
            self.train_batch(epoch, batch_index, batch, &mut totals)?;
        }

        // NaN marks an epoch that trained on nothing
        let record = if totals.samples == 0 {
            warn!(epoch, "no usable samples this epoch");
            ScoreErrorRecord {
                epoch,
                loss: Float::NAN,
                error: Float::NAN,
            }
        } else {
            ScoreErrorRecord {
                epoch,
                loss: totals.loss / totals.samples as Float,
                error: totals.errors as Float / totals.samples as Float,
            }
        };
        info!(
            epoch,
            loss = record.loss,
            error = record.error,
            samples = totals.samples,
            negatives = negatives.len(),
            "epoch complete"
        );
        Ok(record)
    }

    fn train_batch(
        &mut self,
        epoch: usize,
        batch_index: usize,
        batch: &[SampleRef],
        totals: &mut EpochTotals,
    ) -> Result<()> {
        let (network, loss, l1) = (&self.network, self.loss, self.optimizer.l1_penalty);
        let (positives, negatives) = (&self.positives, &self.negatives);

        let outcomes: Vec<Option<SampleOutcome>> = batch
            .par_iter()
            .map(|&sample| -> Result<Option<SampleOutcome>> {
                let loaded = match sample {
                    SampleRef::Positive(i) => positives.load(i).map_err(|e| (positives.describe(i), e)),
                    SampleRef::Negative(i) => negatives.load(i).map_err(|e| (negatives.describe(i), e)),
                };
                let grid: SparseGrid = match loaded {
                    Ok(grid) => grid,
                    Err((crop, e)) if e.is_skippable_crop() => {
                        warn!(%crop, error = %e, "skipping crop");
                        return Ok(None);
                    }
                    Err((_, e)) => return Err(e),
                };

                let trace = network.trace(&grid)?;
                let label = sample.label();
                let grads = network.backward(&trace, loss.grad(trace.score, label), l1);
                Ok(Some(SampleOutcome {
                    loss: loss.value(trace.score, label) + l1 * trace.activation_sum(),
                    error: loss.is_error(trace.score, label),
                    grads,
                }))
            })
            .collect::<Result<_>>()?;

        // Ordered reduction keeps the sum independent of thread scheduling
        let mut grads = Gradients::zeros(&self.config.network);
        let (mut batch_loss, mut batch_errors, mut count) = (0.0, 0usize, 0usize);
        for outcome in outcomes.into_iter().flatten() {
            grads.add_assign(&outcome.grads);
            batch_loss += outcome.loss;
            batch_errors += usize::from(outcome.error);
            count += 1;
        }
        if count == 0 {
            warn!(epoch, batch = batch_index, "batch has no usable samples");
            return Ok(());
        }
        grads.scale(1.0 / count as Float);

        if !batch_loss.is_finite() {
            return Err(Vote3DeepError::NumericalInstability {
                epoch,
                batch: batch_index,
                what: "loss".into(),
            });
        }
        if !grads.is_finite() {
            return Err(Vote3DeepError::NumericalInstability {
                epoch,
                batch: batch_index,
                what: "gradients".into(),
            });
        }

        self.optimizer.step(&mut self.network, &grads);
        debug!(
            epoch,
            batch = batch_index,
            samples = count,
            loss = batch_loss / count as Float,
            grad_norm = grads.norm(),
            "batch"
        );

        totals.loss += batch_loss;
        totals.errors += batch_errors;
        totals.samples += count;
        Ok(())
    }

    fn checkpoint(&mut self, record: ScoreErrorRecord) -> Result<()> {
        let epoch = record.epoch;
        let path = self.network.to_checkpoint(epoch).save(&self.layout.weights_dir)?;
        save_momentum(&self.layout.weights_dir, epoch, self.optimizer.velocity())?;
        self.log.append(record)?;
        info!(epoch, path = %path.display(), "checkpoint written");
        Ok(())
    }
}

/// Spread `negatives` evenly through `positives`, keeping both orders
fn interleave(positives: &[usize], negatives: &[usize]) -> Vec<SampleRef> {
    let total = positives.len() + negatives.len();
    let mut out = Vec::with_capacity(total);
    let (mut p, mut n) = (0, 0);
    for t in 0..total {
        let negative_due = n < negatives.len() && (n + 1) * total <= (t + 1) * negatives.len();
        if negative_due || p == positives.len() {
            out.push(SampleRef::Negative(negatives[n]));
            n += 1;
        } else {
            out.push(SampleRef::Positive(positives[p]));
            p += 1;
        }
    }
    out
}

fn write_config(layout: &RunLayout, config: &EngineConfig) -> Result<()> {
    write_atomically(&layout.config_file(), |file| {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, config)?;
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error().into())
    })
}

/// A resumed run must use the network it was started with
fn check_stored_config(layout: &RunLayout, config: &EngineConfig) -> Result<()> {
    let path = layout.config_file();
    if !path.exists() {
        warn!(path = %path.display(), "no stored run config, cannot verify resume compatibility");
        return Ok(());
    }
    let stored: EngineConfig = serde_json::from_reader(BufReader::new(File::open(&path)?))?;
    if stored.network != config.network {
        return Err(Vote3DeepError::invalid_config(format!(
            "network in {} does not match the requested network",
            path.display()
        )));
    }
    if stored != *config {
        warn!("run config differs from the stored one in non-network settings");
    }
    Ok(())
}
