//! Run directory layout
//!
//! ```text
//! <root>/crops/train/positive/<Object>/
//! <root>/crops/train/negative/<Object>/
//! <root>/train_data/<Object>/2layer/<fv><wd>/hnm_data/
//! <root>/train_data/<Object>/2layer/<fv><wd>/lossvalues/scoreserror.txt
//! <root>/train_data/<Object>/2layer/<fv><wd>/weights/config.json
//! ```

use crate::config::{EngineConfig, ObjectClass};
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Every path a training run reads or writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub positive_crops: PathBuf,
    pub negative_crops: PathBuf,
    pub run_dir: PathBuf,
    pub hnm_dir: PathBuf,
    pub loss_dir: PathBuf,
    pub weights_dir: PathBuf,
}

impl RunLayout {
    pub fn new(root: &Path, object: ObjectClass, config: &EngineConfig) -> Self {
        let crops = root.join("crops").join("train");
        let run_dir = root
            .join("train_data")
            .join(object.as_str())
            .join("2layer")
            .join(config.threshold_tag());
        Self {
            positive_crops: crops.join("positive").join(object.as_str()),
            negative_crops: crops.join("negative").join(object.as_str()),
            hnm_dir: run_dir.join("hnm_data"),
            loss_dir: run_dir.join("lossvalues"),
            weights_dir: run_dir.join("weights"),
            run_dir,
        }
    }

    /// Layout for `config.object`
    pub fn for_config(root: &Path, config: &EngineConfig) -> Self {
        Self::new(root, config.object, config)
    }

    /// Everything lives under `dir` directly; handy for tests and ad-hoc runs
    pub fn flat(dir: &Path) -> Self {
        Self {
            positive_crops: dir.join("positive"),
            negative_crops: dir.join("negative"),
            run_dir: dir.to_path_buf(),
            hnm_dir: dir.join("hnm_data"),
            loss_dir: dir.join("lossvalues"),
            weights_dir: dir.join("weights"),
        }
    }

    pub fn score_log(&self) -> PathBuf {
        self.loss_dir.join("scoreserror.txt")
    }

    pub fn config_file(&self) -> PathBuf {
        self.weights_dir.join("config.json")
    }

    /// Create the output directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.hnm_dir, &self.loss_dir, &self.weights_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
