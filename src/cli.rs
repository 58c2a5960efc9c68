// src/cli.rs - subcommands wiring corpus, vocabulary, buckets, model and evaluation
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tch::nn;

use crate::buckets::{create_buckets, BucketStore};
use crate::checkpoint::CheckpointStore;
use crate::config::{DeviceChoice, ExperimentConfig};
use crate::corpus::ParallelCorpus;
use crate::evaluate::{dev_bleu, dev_perplexity, precision_recall, show_predictions, DisplayFilter, SentenceSet};
use crate::model::EncoderDecoder;
use crate::training::Trainer;
use crate::vocab::Vocabularies;

#[derive(Parser, Debug)]
#[command(
    name = "nmt-attn",
    version,
    about = "Attention encoder-decoder translation: prepare data, train, evaluate, translate."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the source/target vocabulary file from the parallel corpus
    Vocab(CommonArgs),
    /// Encode the training pairs and write them into length buckets
    Buckets(CommonArgs),
    /// Train on the buckets, evaluating on the dev lines after every epoch
    Train(TrainArgs),
    /// Report dev perplexity, BLEU and precision/recall for the latest checkpoint
    Evaluate(CommonArgs),
    /// Print predictions for a range of corpus lines
    Translate(TranslateArgs),
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Experiment configuration (JSON); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the configured device: auto, cpu, cuda or cuda:N
    #[arg(long)]
    pub device: Option<DeviceChoice>,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Continue from the newest epoch checkpoint
    #[arg(long)]
    pub resume: bool,
}

#[derive(Args, Debug)]
pub struct TranslateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// First corpus line to translate; defaults to the first dev line
    #[arg(long)]
    pub start: Option<usize>,

    #[arg(long, default_value_t = 10)]
    pub count: usize,

    /// Only display sentences with at least this precision
    #[arg(long, default_value_t = 0.0)]
    pub min_precision: f64,

    /// Only display sentences with at least this recall
    #[arg(long, default_value_t = 0.0)]
    pub min_recall: f64,

    /// Write one attention CSV per sentence into this directory
    #[arg(long)]
    pub attention_dir: Option<PathBuf>,
}

impl TranslateArgs {
    fn filter(&self) -> DisplayFilter {
        DisplayFilter { min_precision: self.min_precision, min_recall: self.min_recall }
    }
}

impl CommonArgs {
    fn load(&self) -> Result<ExperimentConfig> {
        let mut cfg = match &self.config {
            Some(path) => ExperimentConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => ExperimentConfig::default(),
        };
        if let Some(device) = self.device {
            cfg.device = device;
        }
        Ok(cfg)
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Vocab(args) => build_vocab(&args.load()?),
            Commands::Buckets(args) => build_buckets(&args.load()?),
            Commands::Train(args) => train(&args.common.load()?, args.resume),
            Commands::Evaluate(args) => evaluate(&args.load()?),
            Commands::Translate(args) => translate(
                &args.common.load()?,
                args.start,
                args.count,
                args.filter(),
                args.attention_dir.as_deref(),
            ),
        }
    }
}

fn open_corpus(cfg: &ExperimentConfig) -> Result<ParallelCorpus> {
    let corpus = ParallelCorpus::open(&cfg.paths.source_text, &cfg.paths.target_text, cfg.tokenization())
        .with_context(|| {
            format!(
                "opening corpus {} / {}",
                cfg.paths.source_text.display(),
                cfg.paths.target_text.display()
            )
        })?;
    tracing::info!(lines = corpus.len(), tokenization = ?corpus.tokenization(), "loaded corpus");
    Ok(corpus)
}

fn load_vocab(cfg: &ExperimentConfig) -> Result<Vocabularies> {
    Vocabularies::load(&cfg.paths.vocab)
        .with_context(|| format!("loading vocabulary {} (run `vocab` first)", cfg.paths.vocab.display()))
}

/// Vocabularies see the training lines only.
fn fit_vocab(cfg: &ExperimentConfig, corpus: &ParallelCorpus) -> Vocabularies {
    let pairs = corpus.tokenized(0, cfg.train.num_training);
    Vocabularies::build(&pairs, cfg.model.max_src_vocab, cfg.model.max_tgt_vocab)
}

fn build_vocab(cfg: &ExperimentConfig) -> Result<()> {
    let corpus = open_corpus(cfg)?;
    let vocabs = fit_vocab(cfg, &corpus);
    vocabs.save(&cfg.paths.vocab)?;
    tracing::info!(
        src = vocabs.src.len(),
        tgt = vocabs.tgt.len(),
        path = %cfg.paths.vocab.display(),
        "saved vocabulary"
    );
    Ok(())
}

fn build_buckets(cfg: &ExperimentConfig) -> Result<()> {
    let corpus = open_corpus(cfg)?;
    let vocabs = load_vocab(cfg)?;
    let model_cfg = cfg.model_config(vocabs.src.len(), vocabs.tgt.len())?;

    let ids = corpus.pairs(&vocabs, 0, cfg.train.num_training, model_cfg.src_vocab_size, model_cfg.tgt_vocab_size);
    let buckets = create_buckets(ids, cfg.train.bucket_width, cfg.train.num_buckets);
    BucketStore::new(&cfg.paths.bucket_dir).save_all(&buckets)?;
    Ok(())
}

/// Pairs for corpus lines `start..start + count`. Dev lines follow the
/// training lines.
fn dev_set(cfg: &ExperimentConfig, corpus: &ParallelCorpus, vocabs: &Vocabularies, start: usize, count: usize) -> Result<SentenceSet> {
    let model_cfg = cfg.model_config(vocabs.src.len(), vocabs.tgt.len())?;
    let tokens = corpus.tokenized(start, count);
    let ids = vocabs.encode_pairs(&tokens, model_cfg.src_vocab_size, model_cfg.tgt_vocab_size);
    Ok(SentenceSet::new(tokens, ids, start))
}

fn build_model(cfg: &ExperimentConfig, vocabs: &Vocabularies) -> Result<(nn::VarStore, EncoderDecoder)> {
    let device = cfg.device.resolve();
    let vs = nn::VarStore::new(device);
    let model = EncoderDecoder::new(&vs.root(), cfg.model_config(vocabs.src.len(), vocabs.tgt.len())?)?;
    let params: i64 = vs.trainable_variables().iter().map(|t| t.size().iter().product::<i64>()).sum();
    tracing::info!(?device, params, "model initialized");
    Ok((vs, model))
}

fn restore(cfg: &ExperimentConfig, vs: &mut nn::VarStore) -> Result<()> {
    let store = CheckpointStore::new(&cfg.paths.model_dir, cfg.paths.model_stem.clone());
    let epoch = store.load_latest(vs).context("no trained model to restore (run `train` first)")?;
    tracing::info!(epoch, "restored model");
    Ok(())
}

fn train(cfg: &ExperimentConfig, resume: bool) -> Result<()> {
    let corpus = open_corpus(cfg)?;
    let vocabs = load_vocab(cfg)?;
    let preview = dev_set(cfg, &corpus, &vocabs, 0, 2)?;
    let dev = dev_set(cfg, &corpus, &vocabs, cfg.train.num_training, cfg.train.num_dev)?;
    let (vs, model) = build_model(cfg, &vocabs)?;

    let mut trainer = Trainer::new(model, vs, cfg.train.clone(), &cfg.paths)?;
    let start_epoch = if resume { trainer.resume()? } else { 0 };
    let bleu = trainer.train(&preview, &dev, &vocabs, start_epoch)?;
    tracing::info!(bleu, "training finished");
    Ok(())
}

fn evaluate(cfg: &ExperimentConfig) -> Result<()> {
    let corpus = open_corpus(cfg)?;
    let vocabs = load_vocab(cfg)?;
    let dev = dev_set(cfg, &corpus, &vocabs, cfg.train.num_training, cfg.train.num_dev)?;
    let (mut vs, mut model) = build_model(cfg, &vocabs)?;
    restore(cfg, &mut vs)?;

    let max_len = cfg.train.max_predict_len;
    let pplx = dev_perplexity(&mut model, &dev)?;
    let bleu = dev_bleu(&mut model, &dev, &vocabs, max_len)?;
    let pr = precision_recall(&mut model, &dev, max_len)?;

    println!("{}", "=".repeat(50));
    println!("dev sentences | {}", dev.len());
    println!("perplexity    | {:.4}", pplx);
    println!("BLEU          | {:.4}", bleu);
    println!("precision     | {:.4}", pr.precision);
    println!("recall        | {:.4}", pr.recall);
    println!("F1            | {:.4}", pr.f1);
    println!("{}", "=".repeat(50));
    Ok(())
}

fn translate(
    cfg: &ExperimentConfig,
    start: Option<usize>,
    count: usize,
    filter: DisplayFilter,
    attention_dir: Option<&Path>,
) -> Result<()> {
    let corpus = open_corpus(cfg)?;
    let vocabs = load_vocab(cfg)?;
    let start = start.unwrap_or(cfg.train.num_training);
    let samples = dev_set(cfg, &corpus, &vocabs, start, count)?;
    if samples.is_empty() {
        anyhow::bail!("no corpus lines in {}..{} (corpus has {})", start, start + count, corpus.len());
    }
    let (mut vs, mut model) = build_model(cfg, &vocabs)?;
    restore(cfg, &mut vs)?;

    let report = show_predictions(
        &mut model,
        &samples,
        &vocabs,
        0,
        samples.len(),
        filter,
        attention_dir,
        cfg.train.max_predict_len,
    )?;
    let pr = report.scores;
    println!("{}", "=".repeat(50));
    println!("precision | {:.4}", pr.precision);
    println!("recall    | {:.4}", pr.recall);
    println!("F1        | {:.4}", pr.f1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::UNK_ID;

    #[test]
    fn parses_train_with_resume_and_device() {
        let cli = Cli::try_parse_from(["nmt-attn", "train", "--config", "exp.json", "--resume", "--device", "cuda:1"])
            .unwrap();
        match cli.command {
            Commands::Train(args) => {
                assert!(args.resume);
                assert_eq!(args.common.config, Some(PathBuf::from("exp.json")));
                assert_eq!(args.common.device, Some(DeviceChoice::Cuda(1)));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_translate_range() {
        let cli = Cli::try_parse_from([
            "nmt-attn",
            "translate",
            "--start",
            "5",
            "--count",
            "2",
            "--min-recall",
            "0.5",
            "--attention-dir",
            "attn",
        ])
        .unwrap();
        match cli.command {
            Commands::Translate(args) => {
                assert_eq!(args.start, Some(5));
                assert_eq!(args.count, 2);
                assert_eq!(args.attention_dir, Some(PathBuf::from("attn")));
                assert_eq!(args.filter(), DisplayFilter { min_precision: 0.0, min_recall: 0.5 });
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn dev_only_words_map_to_unk() {
        let corpus = ParallelCorpus::from_lines(
            vec![
                ("le chat".to_string(), "the cat".to_string()),
                ("un chien".to_string(), "a dog".to_string()),
                ("le loup".to_string(), "the wolf".to_string()),
            ],
            crate::config::Tokenization::Words,
        );
        let mut cfg = ExperimentConfig::default();
        cfg.train.num_training = 2;

        let vocabs = fit_vocab(&cfg, &corpus);
        assert_eq!(vocabs.src.id("loup"), UNK_ID);
        assert_eq!(vocabs.tgt.id("wolf"), UNK_ID);

        let dev = dev_set(&cfg, &corpus, &vocabs, 2, 1).unwrap();
        assert_eq!(dev.ids[0].0, vec![vocabs.src.id("le"), UNK_ID]);
        assert_eq!(dev.ids[0].1, vec![vocabs.tgt.id("the"), UNK_ID]);
    }

    #[test]
    fn rejects_unknown_device() {
        assert!(Cli::try_parse_from(["nmt-attn", "evaluate", "--device", "tpu"]).is_err());
    }

    #[test]
    fn device_override_wins_over_default() {
        let args = CommonArgs { config: None, device: Some(DeviceChoice::Cpu) };
        assert_eq!(args.load().unwrap().device, DeviceChoice::Cpu);
    }
}
