// src/training.rs - bucketed mini-batch training with per-epoch evaluation
use std::fs::{self, File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use tch::nn::{self, OptimizerConfig};

use crate::buckets::{bucket_pad_limit, BucketStore};
use crate::checkpoint::CheckpointStore;
use crate::config::{PathsConfig, TrainConfig};
use crate::evaluate::{dev_bleu, dev_perplexity, predict_sentence, show_predictions, DisplayFilter, SentenceSet};
use crate::model::EncoderDecoder;
use crate::vocab::Vocabularies;

/// Open `path` for appending CSV rows, writing `header` only when the file
/// is new or empty.
fn csv_appender(path: &Path, header: &[&str]) -> Result<csv::Writer<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let fresh = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if fresh {
        wtr.write_record(header)?;
        wtr.flush()?;
    }
    Ok(wtr)
}

pub struct Trainer {
    model: EncoderDecoder,
    vs: nn::VarStore,
    opt: nn::Optimizer,
    config: TrainConfig,
    buckets: BucketStore,
    checkpoints: CheckpointStore,
    train_log: csv::Writer<File>,
    dev_log: csv::Writer<File>,
    iteration: usize,
}

impl Trainer {
    pub fn new(model: EncoderDecoder, mut vs: nn::VarStore, config: TrainConfig, paths: &PathsConfig) -> Result<Self> {
        vs.unfreeze();
        let opt = nn::Adam::default().build(&vs, config.learning_rate)?;
        Ok(Self {
            model,
            vs,
            opt,
            config,
            buckets: BucketStore::new(&paths.bucket_dir),
            checkpoints: CheckpointStore::new(&paths.model_dir, paths.model_stem.clone()),
            train_log: csv_appender(&paths.train_log, &["iteration", "loss"])?,
            dev_log: csv_appender(&paths.dev_log, &["epoch", "perplexity", "bleu"])?,
            iteration: 0,
        })
    }

    /// Restore the newest epoch snapshot. Returns the epoch to continue from.
    pub fn resume(&mut self) -> Result<usize> {
        let epoch = self.checkpoints.latest_epoch()?;
        if epoch == 0 {
            tracing::info!(dir = %self.checkpoints_dir(), "no epoch checkpoint found, starting fresh");
            return Ok(0);
        }
        self.checkpoints.load(&mut self.vs, &self.checkpoints.epoch_path(epoch))?;
        tracing::info!(epoch, "resumed training");
        Ok(epoch)
    }

    fn checkpoints_dir(&self) -> String {
        self.checkpoints
            .final_path()
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    fn progress_bar(&self) -> ProgressBar {
        let pb = ProgressBar::new(self.config.num_training as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb
    }

    /// One pass over the buckets, `batch_size` pairs at a time, until
    /// `num_training` pairs were seen. Returns the mean batch loss.
    pub fn batch_train_loop(&mut self, epoch: usize) -> Result<f64> {
        let pb = self.progress_bar();
        let mut consumed = 0usize;
        let mut total_loss = 0.0f64;
        let mut batches = 0usize;

        'buckets: for idx in 0..self.config.num_buckets {
            let bucket = self
                .buckets
                .load(idx)
                .with_context(|| format!("loading bucket {} from {}", idx + 1, self.buckets.dir().display()))?;
            let pad_limit = bucket_pad_limit(idx, self.config.bucket_width);

            for chunk in bucket.chunks(self.config.batch_size.max(1)) {
                let remaining = self.config.num_training - consumed;
                if remaining == 0 {
                    break 'buckets;
                }
                let chunk = &chunk[..chunk.len().min(remaining)];

                self.opt.zero_grad();
                let loss = self.model.train_batch(chunk, pad_limit, pad_limit, true)?;
                self.opt.backward_step_clip_norm(&loss, self.config.grad_clip);

                let loss_val = f64::try_from(&loss)?;
                total_loss += loss_val;
                batches += 1;
                consumed += chunk.len();
                self.iteration += 1;

                if self.iteration % self.config.log_every.max(1) == 0 {
                    self.train_log
                        .write_record(&[self.iteration.to_string(), format!("{:.6}", loss_val)])?;
                    self.train_log.flush()?;
                }

                pb.set_message(format!(
                    "epoch={} iter={} loss={:.4} mean loss={:.4} bucket={}",
                    epoch,
                    self.iteration,
                    loss_val,
                    total_loss / batches as f64,
                    idx + 1
                ));
                pb.inc(chunk.len() as u64);
            }
        }
        pb.finish_and_clear();

        if batches == 0 {
            tracing::warn!(epoch, "no training batches found in the buckets");
            return Ok(0.0);
        }
        Ok(total_loss / batches as f64)
    }

    /// Run `epochs` epochs numbered after `start_epoch`, show predictions for
    /// `preview` (training lines) and the first dev lines, then write the
    /// final snapshot. Returns the closing dev BLEU.
    pub fn train(
        &mut self,
        preview: &SentenceSet,
        dev: &SentenceSet,
        vocabs: &Vocabularies,
        start_epoch: usize,
    ) -> Result<f64> {
        let trainable = self.vs.trainable_variables().len();
        if trainable == 0 {
            anyhow::bail!("no trainable variables, model initialization failed");
        }
        tracing::info!(
            trainable,
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            num_training = self.config.num_training,
            num_dev = dev.len(),
            "starting training"
        );

        for offset in 0..self.config.epochs {
            let epoch = start_epoch + offset + 1;
            let mean_loss = self.batch_train_loop(epoch)?;
            let pplx = dev_perplexity(&mut self.model, dev)?;
            self.checkpoints.save_epoch(&self.vs, epoch)?;

            let bleu = if self.config.bleu_every > 0 && (offset + 1) % self.config.bleu_every == 0 {
                let score = dev_bleu(&mut self.model, dev, vocabs, self.config.max_predict_len)?;
                self.sample_translations(dev, vocabs, 3)?;
                Some(score)
            } else {
                None
            };

            self.dev_log.write_record(&[
                epoch.to_string(),
                format!("{:.4}", pplx),
                bleu.map(|b| format!("{:.4}", b)).unwrap_or_default(),
            ])?;
            self.dev_log.flush()?;
            tracing::info!(epoch, mean_loss, perplexity = pplx, bleu = ?bleu, "finished epoch");
        }

        let max_len = self.config.max_predict_len;
        let none = DisplayFilter::default();
        show_predictions(&mut self.model, preview, vocabs, 0, preview.len(), none, None, max_len)?;
        show_predictions(&mut self.model, dev, vocabs, 0, 3, none, None, max_len)?;
        let bleu = dev_bleu(&mut self.model, dev, vocabs, max_len)?;
        println!("BLEU | {:.4}", bleu);

        self.checkpoints.save_final(&self.vs)?;
        Ok(bleu)
    }

    /// Log a few random dev translations.
    fn sample_translations(&mut self, dev: &SentenceSet, vocabs: &Vocabularies, n: usize) -> Result<()> {
        let indices: Vec<usize> = (0..dev.len()).collect();
        let mut rng = rand::thread_rng();
        for &i in indices.choose_multiple(&mut rng, n) {
            let (src, tgt) = &dev.ids[i];
            if src.is_empty() || tgt.is_empty() {
                continue;
            }
            let (counts, prediction) = predict_sentence(&mut self.model, src, tgt, self.config.max_predict_len)?;
            tracing::info!(
                line = dev.first_line + i,
                src = %dev.tokens[i].0.join(" "),
                reference = %dev.tokens[i].1.join(" "),
                hypothesis = %vocabs.tgt.decode(&prediction.tokens).join(" "),
                matches = counts.matches,
                "sample translation"
            );
        }
        Ok(())
    }
}
