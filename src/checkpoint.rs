// src/checkpoint.rs - per-epoch parameter snapshots
use std::fs;
use std::path::{Path, PathBuf};

use tch::nn;

use crate::error::{NmtError, Result};

const EXT: &str = "ot";

/// Snapshots live in one directory as `<stem>_<epoch>.ot`, plus a final
/// `<stem>.ot`.
pub struct CheckpointStore {
    dir: PathBuf,
    stem: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self { dir: dir.into(), stem: stem.into() }
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}_{}.{}", self.stem, epoch, EXT))
    }

    pub fn final_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, EXT))
    }

    /// Highest epoch with a snapshot on disk, 0 when there is none.
    pub fn latest_epoch(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let prefix = format!("{}_", self.stem);
        let suffix = format!(".{}", EXT);
        let mut latest = 0;
        for entry in fs::read_dir(&self.dir).map_err(|e| NmtError::io(&self.dir, e))? {
            let entry = entry.map_err(|e| NmtError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let epoch = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .and_then(|n| n.parse::<usize>().ok());
            match epoch {
                Some(n) => latest = latest.max(n),
                None if name.starts_with(&prefix) => {
                    tracing::warn!(file = name, "not a valid epoch checkpoint, skipped")
                }
                None => {}
            }
        }
        Ok(latest)
    }

    fn save(&self, vs: &nn::VarStore, path: &Path) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| NmtError::io(&self.dir, e))?;
        vs.save(path)?;
        tracing::info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }

    pub fn save_epoch(&self, vs: &nn::VarStore, epoch: usize) -> Result<PathBuf> {
        let path = self.epoch_path(epoch);
        self.save(vs, &path)?;
        Ok(path)
    }

    pub fn save_final(&self, vs: &nn::VarStore) -> Result<PathBuf> {
        let path = self.final_path();
        self.save(vs, &path)?;
        Ok(path)
    }

    pub fn load(&self, vs: &mut nn::VarStore, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(NmtError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
            ));
        }
        vs.load(path)?;
        tracing::info!(path = %path.display(), "loaded checkpoint");
        Ok(())
    }

    /// Load the newest epoch snapshot, falling back to the final one.
    /// Returns the epoch number that was restored (0 for the final file).
    pub fn load_latest(&self, vs: &mut nn::VarStore) -> Result<usize> {
        let epoch = self.latest_epoch()?;
        let path = if epoch > 0 { self.epoch_path(epoch) } else { self.final_path() };
        self.load(vs, &path)?;
        Ok(epoch)
    }
}
