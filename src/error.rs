// src/error.rs
use std::path::PathBuf;

use thiserror::Error;

use crate::model::CyclePhase;

#[derive(Debug, Error)]
pub enum NmtError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid data: {0}")]
    Data(String),

    #[error("encode/decode cycle out of order: expected {expected:?}, model is in {found:?}")]
    Phase {
        expected: CyclePhase,
        found: CyclePhase,
    },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl NmtError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NmtError::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, NmtError>;
