//! Train a Vote3Deep detector on pre-voxelized crops
//!
//! Reads `.npy` crops from `<input>/crops/train/{positive,negative}/<Object>/`
//! and writes weights, mined pools and the score-error log under
//! `<input>/train_data/<Object>/2layer/<fv><wd>/`.
//!
//! Usage:
//!   train_vote3deep --fvthresh 2 --wdthresh 50 --batchsize-hnm 12 --input-path data
//!   train_vote3deep ... --resume --epoch 17

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use vote3deep::{
    Checkpoint, CropCorpus, CropSource, EngineConfig, EngineState, NpyCropLoader, ObjectClass,
    RunLayout, StopHandle, TrainingEngine,
};

#[derive(Parser, Debug)]
#[command(name = "train_vote3deep", about = "Train the Vote3Deep sparse 3D detector")]
struct Cli {
    /// Minimum points per voxel for a feature vector
    #[arg(long)]
    fvthresh: u32,

    /// Minimum feature vectors per window
    #[arg(long)]
    wdthresh: u32,

    /// Voxel edge length in metres
    #[arg(long, default_value_t = 0.2)]
    resolution: f64,

    /// Hard negatives kept per mining round; about the core count works well
    #[arg(long)]
    batchsize_hnm: usize,

    /// Dataset root containing `crops/` and `train_data/`
    #[arg(long)]
    input_path: PathBuf,

    /// Continue from a saved checkpoint
    #[arg(long)]
    resume: bool,

    /// Checkpoint epoch to resume from (default: latest)
    #[arg(long, requires = "resume")]
    epoch: Option<usize>,

    /// Object class: Car, Pedestrian or Cyclist
    #[arg(long, default_value = "Pedestrian", value_parser = parse_object)]
    object: ObjectClass,

    /// Total epochs
    #[arg(long, default_value_t = vote3deep::config::EPOCHS)]
    epochs: usize,

    /// Seed for initialization and shuffling
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn parse_object(s: &str) -> std::result::Result<ObjectClass, String> {
    s.parse::<ObjectClass>().map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = EngineConfig::new(cli.fvthresh, cli.wdthresh, cli.batchsize_hnm)
        .with_resolution(cli.resolution)
        .with_object(cli.object)
        .with_epochs(cli.epochs)
        .with_seed(cli.seed);
    config.validate().context("invalid training configuration")?;

    let layout = RunLayout::for_config(&cli.input_path, &config);

    let resume = if cli.resume {
        let epoch = match cli.epoch {
            Some(epoch) => epoch,
            None => Checkpoint::latest_epoch(&layout.weights_dir)
                .context("failed to scan weights directory")?
                .with_context(|| format!("no checkpoint to resume from in {}", layout.weights_dir.display()))?,
        };
        Some(epoch)
    } else {
        None
    };

    let loader = NpyCropLoader::new(config.network.channels1);
    let positives = CropCorpus::from_dir(&layout.positive_crops, "npy", loader)
        .with_context(|| format!("failed to list {}", layout.positive_crops.display()))?;
    let negatives = CropCorpus::from_dir(&layout.negative_crops, "npy", loader)
        .with_context(|| format!("failed to list {}", layout.negative_crops.display()))?;
    if positives.is_empty() {
        bail!("no positive crops found in {}", layout.positive_crops.display());
    }
    if negatives.is_empty() {
        warn!(dir = %layout.negative_crops.display(), "no negative crops, training on positives only");
    }

    info!(
        object = %config.object,
        fv = config.fv_thresh,
        wd = config.wd_thresh,
        resolution = config.resolution,
        window = ?config.network.receptive_field,
        positives = positives.len(),
        negatives = negatives.len(),
        "configured"
    );

    let stop = StopHandle::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current epoch");
        handler_stop.request_stop();
    })
    .context("failed to set Ctrl-C handler")?;

    let mut engine = TrainingEngine::new(config, layout, positives, negatives, resume)
        .context("failed to set up training")?
        .with_stop_handle(stop);
    let summary = engine.run().context("training failed")?;

    match (summary.state, summary.last_epoch()) {
        (EngineState::Interrupted, Some(epoch)) => info!(epoch, "interrupted; resume with --resume --epoch {epoch}"),
        (EngineState::Interrupted, None) => info!("interrupted before completing an epoch"),
        (_, Some(epoch)) => info!(epoch, "training complete"),
        (_, None) => info!("nothing to do, all epochs already trained"),
    }
    Ok(())
}
