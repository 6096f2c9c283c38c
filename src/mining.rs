//! Hard-negative mining
//!
//! Scores the whole negative corpus with the current (frozen) network and
//! keeps the highest-scoring crops: the background the detector is most sure
//! is an object. Scoring runs in parallel; selection is serial and stable so
//! the pool does not depend on thread scheduling.

use crate::checkpoint::write_atomically;
use crate::corpus::CropSource;
use crate::error::Result;
use crate::network::Scorer;
use crate::Float;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One selected negative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinedNegative {
    /// Position in the negative corpus
    pub index: usize,
    /// Corpus description of the crop
    pub crop: String,
    /// Score at mining time; `None` for a random pool
    pub score: Option<Float>,
}

/// Negatives chosen for one epoch, best first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinedPool {
    pub epoch: usize,
    pub entries: Vec<MinedNegative>,
}

impl MinedPool {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Corpus indices in pool order
    pub fn indices(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.index).collect()
    }

    pub fn file_name(epoch: usize) -> String {
        format!("hnm_epoch_{epoch}.json")
    }

    /// Write `hnm_epoch_<n>.json` into `dir`
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(self.epoch));
        write_atomically(&path, |file| {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
            writer.into_inner().map_err(|e| e.into_error().into())
        })?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Selects hard negatives by score
#[derive(Debug, Clone, Copy)]
pub struct HardNegativeMiner {
    pool_size: usize,
}

impl HardNegativeMiner {
    pub fn new(pool_size: usize) -> Self {
        Self { pool_size }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Top `pool_size` negatives by descending score
    ///
    /// Ties keep corpus order. Unreadable crops are skipped; any other error,
    /// such as a crop with the wrong channel width, aborts mining.
    pub fn mine<S, C>(&self, scorer: &S, corpus: &C, epoch: usize) -> Result<MinedPool>
    where
        S: Scorer + ?Sized,
        C: CropSource + ?Sized,
    {
        let scored: Vec<Option<(usize, Float)>> = (0..corpus.len())
            .into_par_iter()
            .map(|index| -> Result<Option<(usize, Float)>> {
                match corpus.load(index).and_then(|grid| scorer.score(&grid)) {
                    Ok(score) => Ok(Some((index, score))),
                    Err(e) if e.is_skippable_crop() => {
                        warn!(crop = %corpus.describe(index), error = %e, "skipping negative crop");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .collect::<Result<_>>()?;

        let mut ranked: Vec<(usize, Float)> = scored.into_iter().flatten().collect();
        let skipped = corpus.len() - ranked.len();
        // Stable: equal scores stay in corpus order
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(self.pool_size);

        let pool = MinedPool {
            epoch,
            entries: ranked
                .into_iter()
                .map(|(index, score)| MinedNegative {
                    index,
                    crop: corpus.describe(index),
                    score: Some(score),
                })
                .collect(),
        };

        if let (Some(first), Some(last)) = (pool.entries.first(), pool.entries.last()) {
            info!(
                epoch,
                selected = pool.len(),
                corpus = corpus.len(),
                skipped,
                top = first.score.unwrap_or_default(),
                cutoff = last.score.unwrap_or_default(),
                "mined hard negatives"
            );
        } else {
            warn!(epoch, corpus = corpus.len(), "no negatives available, training on positives only");
        }
        Ok(pool)
    }
}

/// Seeded random subset of the corpus, used before the network has learned anything
pub fn random_pool<C>(corpus: &C, size: usize, seed: u64, epoch: usize) -> MinedPool
where
    C: CropSource + ?Sized,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let amount = size.min(corpus.len());
    let entries = sample(&mut rng, corpus.len(), amount)
        .into_iter()
        .map(|index| MinedNegative {
            index,
            crop: corpus.describe(index),
            score: None,
        })
        .collect();
    let pool = MinedPool { epoch, entries };
    debug!(epoch, selected = pool.len(), "random negative pool");
    pool
}
