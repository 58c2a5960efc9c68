// src/config.rs - explicit, immutable experiment configuration
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::error::{NmtError, Result};
use crate::vocab::NUM_RESERVED;

/// Convolutional segment front-end settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub segment_size: i64,
    pub num_filters: i64,
    pub highway_layers: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self { segment_size: 5, num_filters: 16, highway_layers: 2 }
    }
}

/// Shape of the encoder-decoder. The decoder runs at `2 * hidden_units`
/// so the concatenated forward/backward encoder state can seed it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub src_vocab_size: i64,
    pub tgt_vocab_size: i64,
    pub enc_layers: usize,
    pub dec_layers: usize,
    pub hidden_units: i64,
    pub attention: bool,
    pub dropout: f64,
    pub segment: Option<SegmentConfig>,
}

impl ModelConfig {
    pub fn new(src_vocab_size: i64, tgt_vocab_size: i64, hidden_units: i64) -> Self {
        Self {
            src_vocab_size,
            tgt_vocab_size,
            enc_layers: 1,
            dec_layers: 1,
            hidden_units,
            attention: true,
            dropout: 0.2,
            segment: None,
        }
    }

    pub fn decoder_units(&self) -> i64 {
        2 * self.hidden_units
    }

    pub fn validate(&self) -> Result<()> {
        let min_vocab = NUM_RESERVED as i64;
        if self.src_vocab_size < min_vocab || self.tgt_vocab_size < min_vocab {
            return Err(NmtError::Config(format!(
                "vocabulary sizes must cover the {} reserved ids (src={}, tgt={})",
                min_vocab, self.src_vocab_size, self.tgt_vocab_size
            )));
        }
        if self.hidden_units <= 0 {
            return Err(NmtError::Config(format!("hidden_units must be positive, got {}", self.hidden_units)));
        }
        if self.enc_layers == 0 || self.dec_layers == 0 {
            return Err(NmtError::Config(format!(
                "need at least one encoder and one decoder layer (enc={}, dec={})",
                self.enc_layers, self.dec_layers
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(NmtError::Config(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        if let Some(seg) = &self.segment {
            if seg.segment_size <= 0 || seg.num_filters <= 0 || seg.highway_layers == 0 {
                return Err(NmtError::Config(format!("segment encoder needs positive sizes, got {:?}", seg)));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub num_training: usize,
    pub num_dev: usize,
    pub bucket_width: usize,
    pub num_buckets: usize,
    pub learning_rate: f64,
    pub grad_clip: f64,
    pub log_every: usize,
    pub bleu_every: usize,
    pub max_predict_len: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 100,
            num_training: 10_000,
            num_dev: 1_000,
            bucket_width: 3,
            num_buckets: 14,
            learning_rate: 0.001,
            grad_clip: 5.0,
            log_every: 10,
            bleu_every: 2,
            max_predict_len: 20,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tokenization {
    /// Whitespace separated words.
    Words,
    /// Every character of the line, used with the segment encoder.
    Characters,
}

/// Backend placement, resolved once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    Auto,
    Cpu,
    Cuda(usize),
}

impl DeviceChoice {
    pub fn resolve(self) -> Device {
        match self {
            DeviceChoice::Auto => Device::cuda_if_available(),
            DeviceChoice::Cpu => Device::Cpu,
            DeviceChoice::Cuda(idx) => Device::Cuda(idx),
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = NmtError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(DeviceChoice::Auto),
            "cpu" => Ok(DeviceChoice::Cpu),
            "cuda" => Ok(DeviceChoice::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse().ok())
                .map(DeviceChoice::Cuda)
                .ok_or_else(|| NmtError::Config(format!("unknown device '{}'", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub source_text: PathBuf,
    pub target_text: PathBuf,
    pub vocab: PathBuf,
    pub bucket_dir: PathBuf,
    pub model_dir: PathBuf,
    pub model_stem: String,
    pub train_log: PathBuf,
    pub dev_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source_text: PathBuf::from("data/text.fr"),
            target_text: PathBuf::from("data/text.en"),
            vocab: PathBuf::from("data/vocab.json"),
            bucket_dir: PathBuf::from("data/buckets"),
            model_dir: PathBuf::from("model"),
            model_stem: "seq2seq".to_string(),
            train_log: PathBuf::from("model/train_loss.csv"),
            dev_log: PathBuf::from("model/dev_scores.csv"),
        }
    }
}

/// Architecture knobs that do not depend on the vocabulary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub max_src_vocab: usize,
    pub max_tgt_vocab: usize,
    pub enc_layers: usize,
    pub dec_layers: usize,
    pub hidden_units: i64,
    pub attention: bool,
    pub dropout: f64,
    pub segment: Option<SegmentConfig>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            max_src_vocab: 20_000,
            max_tgt_vocab: 20_000,
            enc_layers: 2,
            dec_layers: 2,
            hidden_units: 100,
            attention: true,
            dropout: 0.2,
            segment: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: ModelSettings,
    pub train: TrainConfig,
    pub paths: PathsConfig,
    pub tokenization: Tokenization,
    pub device: DeviceChoice,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            train: TrainConfig::default(),
            paths: PathsConfig::default(),
            tokenization: Tokenization::Words,
            device: DeviceChoice::Auto,
        }
    }
}

impl ExperimentConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| NmtError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Character mode always goes through the segment encoder.
    pub fn tokenization(&self) -> Tokenization {
        if self.model.segment.is_some() {
            Tokenization::Characters
        } else {
            self.tokenization
        }
    }

    /// Vocabulary sizes are capped by the configured maxima.
    pub fn model_config(&self, src_vocab_len: usize, tgt_vocab_len: usize) -> Result<ModelConfig> {
        let cfg = ModelConfig {
            src_vocab_size: src_vocab_len.min(self.model.max_src_vocab) as i64,
            tgt_vocab_size: tgt_vocab_len.min(self.model.max_tgt_vocab) as i64,
            enc_layers: self.model.enc_layers,
            dec_layers: self.model.dec_layers,
            hidden_units: self.model.hidden_units,
            attention: self.model.attention,
            dropout: self.model.dropout,
            segment: self.model.segment.clone(),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_vocab_smaller_than_reserved_ids() {
        let cfg = ModelConfig::new(3, 10, 8);
        assert!(matches!(cfg.validate(), Err(NmtError::Config(_))));
    }

    #[test]
    fn rejects_zero_layers_and_bad_segment() {
        let mut cfg = ModelConfig::new(10, 10, 8);
        cfg.dec_layers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ModelConfig::new(10, 10, 8);
        cfg.segment = Some(SegmentConfig { segment_size: 0, ..SegmentConfig::default() });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{ "train": { "epochs": 3 }, "device": "cpu" }"#;
        let cfg: ExperimentConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.train.epochs, 3);
        assert_eq!(cfg.train.batch_size, TrainConfig::default().batch_size);
        assert_eq!(cfg.device, DeviceChoice::Cpu);
        assert_eq!(cfg.tokenization, Tokenization::Words);
    }

    #[test]
    fn model_config_caps_vocab() {
        let mut cfg = ExperimentConfig::default();
        cfg.model.max_src_vocab = 50;
        let model = cfg.model_config(1_000, 30).unwrap();
        assert_eq!(model.src_vocab_size, 50);
        assert_eq!(model.tgt_vocab_size, 30);
        assert_eq!(model.decoder_units(), 2 * model.hidden_units);
    }

    #[test]
    fn parses_device_strings() {
        assert_eq!("cpu".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cpu);
        assert_eq!("cuda:1".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda(1));
        assert!("tpu".parse::<DeviceChoice>().is_err());
    }
}
