//! Score-error log
//!
//! Plain text, one `epoch,loss,error` row per epoch under a `#` header. A fresh
//! run truncates the file; a resumed run appends. Every record is flushed as
//! soon as it is written.

use crate::error::{Result, Vote3DeepError};
use crate::Float;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const HEADER: &str = "# epoch,loss,error";

/// One epoch summary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreErrorRecord {
    pub epoch: usize,
    /// Mean per-sample loss (hinge + L1)
    pub loss: Float,
    /// Fraction of misclassified samples
    pub error: Float,
}

/// Append-only writer
#[derive(Debug)]
pub struct ScoreErrorLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScoreErrorLog {
    /// Truncate `path` and write the header
    pub fn create_fresh(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut log = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        };
        writeln!(log.writer, "{HEADER}")?;
        log.writer.flush()?;
        Ok(log)
    }

    /// Open for appending, creating the file with a header if it does not exist
    pub fn open_append(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::create_fresh(path);
        }
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: ScoreErrorRecord) -> Result<()> {
        writeln!(self.writer, "{},{},{}", record.epoch, record.loss, record.error)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Parse every record in `path`
    pub fn read(path: &Path) -> Result<Vec<ScoreErrorRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            records.push(parse_row(line).ok_or_else(|| {
                Vote3DeepError::invalid_config(format!("{}:{}: malformed log row '{line}'", path.display(), n + 1))
            })?);
        }
        Ok(records)
    }
}

fn parse_row(line: &str) -> Option<ScoreErrorRecord> {
    let mut fields = line.split(',').map(str::trim);
    let epoch = fields.next()?.parse().ok()?;
    let loss = fields.next()?.parse().ok()?;
    let error = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(ScoreErrorRecord { epoch, loss, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn record(epoch: usize) -> ScoreErrorRecord {
        ScoreErrorRecord {
            epoch,
            loss: 1.0 / (epoch + 1) as Float,
            error: 0.25,
        }
    }

    #[test]
    fn test_fresh_then_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scoreserror.txt");

        let mut log = ScoreErrorLog::create_fresh(&path).unwrap();
        log.append(record(0)).unwrap();
        log.append(record(1)).unwrap();
        drop(log);

        let mut log = ScoreErrorLog::open_append(&path).unwrap();
        log.append(record(2)).unwrap();

        let records = ScoreErrorLog::read(&path).unwrap();
        assert_eq!(records, vec![record(0), record(1), record(2)]);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches('#').count(), 1);
    }

    #[test]
    fn test_fresh_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scoreserror.txt");
        let mut log = ScoreErrorLog::create_fresh(&path).unwrap();
        log.append(record(0)).unwrap();
        drop(log);

        ScoreErrorLog::create_fresh(&path).unwrap();
        assert!(ScoreErrorLog::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_flushed_per_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scoreserror.txt");
        let mut log = ScoreErrorLog::create_fresh(&path).unwrap();
        log.append(record(3)).unwrap();
        // Still open: the row must already be on disk
        assert_eq!(ScoreErrorLog::read(&path).unwrap(), vec![record(3)]);
        assert_eq!(log.path(), path.as_path());
    }

    #[test]
    fn test_open_append_creates_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.txt");
        ScoreErrorLog::open_append(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with('#'));
    }

    #[test]
    fn test_malformed_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, "# epoch,loss,error\n0,0.5\n").unwrap();
        assert!(ScoreErrorLog::read(&path).is_err());
    }
}
