//! Per-epoch checkpoints
//!
//! - `epoch_<n>.weights.npz`: `w1, w2, w3, b1, b2, b3`
//! - `epoch_<n>.momentum.npz`: `v_w1, v_w2, v_w3, v_b1, v_b2, v_b3`
//!
//! Both are written to a temporary file, synced and renamed into place, so a
//! reader never observes a half-written archive.

use crate::config::NetworkConfig;
use crate::error::{Result, Vote3DeepError};
use crate::network::NetworkParams;
use crate::Float;
use ndarray::{arr1, ArrayD, Ix1, Ix5};
use ndarray_npy::{NpzReader, NpzWriter};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Parameters saved at the end of an epoch
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    pub params: NetworkParams,
}

impl Checkpoint {
    pub fn file_name(epoch: usize) -> String {
        format!("epoch_{epoch}.weights.npz")
    }

    pub fn momentum_file_name(epoch: usize) -> String {
        format!("epoch_{epoch}.momentum.npz")
    }

    /// Write `epoch_<n>.weights.npz` into `dir`
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(self.epoch));
        write_params(&path, "", &self.params)?;
        Ok(path)
    }

    /// Load and validate against `config`
    pub fn load(dir: &Path, epoch: usize, config: &NetworkConfig) -> Result<Self> {
        let path = dir.join(Self::file_name(epoch));
        let params = read_params(&path, "", config)?;
        Ok(Self { epoch, params })
    }

    /// Highest epoch with a weights file in `dir`, if any
    pub fn latest_epoch(dir: &Path) -> Result<Option<usize>> {
        if !dir.exists() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let epoch = name
                .to_str()
                .and_then(|n| n.strip_prefix("epoch_"))
                .and_then(|n| n.strip_suffix(".weights.npz"))
                .and_then(|n| n.parse::<usize>().ok());
            latest = latest.max(epoch);
        }
        Ok(latest)
    }
}

/// Write the optimizer velocity for `epoch`
pub fn save_momentum(dir: &Path, epoch: usize, velocity: &NetworkParams) -> Result<PathBuf> {
    let path = dir.join(Checkpoint::momentum_file_name(epoch));
    write_params(&path, "v_", velocity)?;
    Ok(path)
}

/// Read the optimizer velocity for `epoch`; `None` when no sidecar exists
pub fn load_momentum(dir: &Path, epoch: usize, config: &NetworkConfig) -> Result<Option<NetworkParams>> {
    let path = dir.join(Checkpoint::momentum_file_name(epoch));
    if !path.exists() {
        return Ok(None);
    }
    read_params(&path, "v_", config).map(Some)
}

/// Write through `<path>.tmp`, fsync, then rename over `path`
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(File) -> Result<File>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = File::create(&tmp)
        .map_err(Vote3DeepError::from)
        .and_then(write)
        .and_then(|file| file.sync_all().map_err(Vote3DeepError::from))
        .and_then(|()| fs::rename(&tmp, path).map_err(Vote3DeepError::from));

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_params(path: &Path, prefix: &str, params: &NetworkParams) -> Result<()> {
    write_atomically(path, |file| {
        let mut npz = NpzWriter::new(file);
        npz.add_array(format!("{prefix}w1"), &params.w1)?;
        npz.add_array(format!("{prefix}w2"), &params.w2)?;
        npz.add_array(format!("{prefix}w3"), &params.w3)?;
        npz.add_array(format!("{prefix}b1"), &params.b1)?;
        npz.add_array(format!("{prefix}b2"), &params.b2)?;
        npz.add_array(format!("{prefix}b3"), &arr1(&[params.b3]))?;
        Ok(npz.finish()?)
    })
}

fn read_params(path: &Path, prefix: &str, config: &NetworkConfig) -> Result<NetworkParams> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Vote3DeepError::MissingCheckpoint {
            path: path.to_path_buf(),
        },
        _ => Vote3DeepError::Io(e),
    })?;
    let corrupt = |reason: String| Vote3DeepError::corrupt_checkpoint(path, reason);

    let mut npz = NpzReader::new(file).map_err(|e| corrupt(e.to_string()))?;
    let names = npz.names().map_err(|e| corrupt(e.to_string()))?;

    let mut read = |key: &str| -> Result<ArrayD<Float>> {
        let key = format!("{prefix}{key}");
        let name = names
            .iter()
            .find(|n| **n == key || n.strip_suffix(".npy") == Some(key.as_str()))
            .ok_or_else(|| corrupt(format!("missing entry '{key}'")))?;
        npz.by_name(name).map_err(|e| corrupt(format!("{key}: {e}")))
    };

    let w1 = read("w1")?
        .into_dimensionality::<Ix5>()
        .map_err(|e| corrupt(format!("w1: {e}")))?;
    let w2 = read("w2")?
        .into_dimensionality::<Ix5>()
        .map_err(|e| corrupt(format!("w2: {e}")))?;
    let w3 = read("w3")?
        .into_dimensionality::<Ix1>()
        .map_err(|e| corrupt(format!("w3: {e}")))?;
    let b1 = read("b1")?
        .into_dimensionality::<Ix1>()
        .map_err(|e| corrupt(format!("b1: {e}")))?;
    let b2 = read("b2")?
        .into_dimensionality::<Ix1>()
        .map_err(|e| corrupt(format!("b2: {e}")))?;
    let b3 = read("b3")?;
    if b3.len() != 1 {
        return Err(corrupt(format!("b3 must hold one value, found shape {:?}", b3.shape())));
    }
    let b3 = b3.iter().copied().next().unwrap_or_default();

    let params = NetworkParams { w1, b1, w2, b2, w3, b3 };
    params.check_shapes(config).map_err(|e| corrupt(e.to_string()))?;
    Ok(params)
}
