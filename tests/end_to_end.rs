use std::fs;
use std::path::Path;

use nmt_attn::buckets::{create_buckets, BucketStore};
use nmt_attn::checkpoint::CheckpointStore;
use nmt_attn::config::{ModelConfig, PathsConfig, Tokenization, TrainConfig};
use nmt_attn::corpus::ParallelCorpus;
use nmt_attn::evaluate::SentenceSet;
use nmt_attn::training::Trainer;
use nmt_attn::vocab::{Vocabularies, Vocabulary, UNK_ID};
use nmt_attn::EncoderDecoder;
use tch::nn::{self, OptimizerConfig};
use tch::Device;

fn two_word_model(seed: i64) -> (nn::VarStore, EncoderDecoder) {
    tch::manual_seed(seed);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = EncoderDecoder::new(&vs.root(), ModelConfig::new(6, 6, 8)).unwrap();
    (vs, model)
}

#[test]
fn single_step_on_two_word_vocabulary() {
    let vocab = Vocabulary::from_words(vec!["a".to_string(), "b".to_string()]);
    let src = vocab.encode(&["a".to_string(), "b".to_string()], 6);
    let tgt = vocab.encode(&["b".to_string(), "a".to_string()], 6);
    assert_eq!(src, vec![4, 5]);
    assert_eq!(tgt, vec![5, 4]);

    let (_fresh_vs, mut fresh) = two_word_model(7);
    let expected = f64::try_from(&fresh.train_batch(&[(src.clone(), tgt.clone())], 2, 2, false).unwrap()).unwrap();

    // same parameters, but stale state from an unrelated cycle
    let (_vs, mut model) = two_word_model(7);
    model.encode_sequence(&[5, 5, 4, 4], false).unwrap();
    model.set_decoder_state().unwrap();

    let loss = f64::try_from(&model.train_batch(&[(src, tgt)], 2, 2, false).unwrap()).unwrap();
    assert!(loss.is_finite());
    assert!(loss >= 0.0);
    approx::assert_relative_eq!(loss, expected, max_relative = 1e-6);

    model.reset_state();
    assert!(model.is_reset());
}

#[test]
fn optimizer_steps_reduce_loss() {
    let (vs, mut model) = two_word_model(3);
    let mut opt = nn::Adam::default().build(&vs, 0.01).unwrap();
    let pairs = vec![(vec![4, 5], vec![5, 4]), (vec![5], vec![4, 4])];

    let initial = f64::try_from(&model.train_batch(&pairs, 2, 2, false).unwrap()).unwrap();
    for _ in 0..40 {
        let loss = model.train_batch(&pairs, 2, 2, true).unwrap();
        opt.backward_step_clip_norm(&loss, 5.0);
    }
    let trained = f64::try_from(&model.train_batch(&pairs, 2, 2, false).unwrap()).unwrap();
    assert!(trained < initial, "loss went from {} to {}", initial, trained);
}

fn write_lines(path: &Path, lines: &[&str]) {
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

#[test]
fn corpus_to_checkpoint_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_lines(
        &root.join("text.fr"),
        &["le chat", "un chien noir", "le chien", "un chat", "le chat gris", "un chien"],
    );
    write_lines(
        &root.join("text.en"),
        &["the cat", "a black dog", "the dog", "a cat", "the grey cat", "a dog"],
    );

    let paths = PathsConfig {
        source_text: root.join("text.fr"),
        target_text: root.join("text.en"),
        vocab: root.join("vocab.json"),
        bucket_dir: root.join("buckets"),
        model_dir: root.join("model"),
        model_stem: "seq2seq".to_string(),
        train_log: root.join("model/train_loss.csv"),
        dev_log: root.join("model/dev_scores.csv"),
    };
    let train_cfg = TrainConfig {
        epochs: 2,
        batch_size: 2,
        num_training: 4,
        num_dev: 2,
        bucket_width: 2,
        num_buckets: 2,
        log_every: 1,
        bleu_every: 1,
        max_predict_len: 5,
        ..TrainConfig::default()
    };

    let corpus = ParallelCorpus::open(&paths.source_text, &paths.target_text, Tokenization::Words).unwrap();
    let training = corpus.tokenized(0, train_cfg.num_training);
    let vocabs = Vocabularies::build(&training, 100, 100);
    vocabs.save(&paths.vocab).unwrap();
    let vocabs = Vocabularies::load(&paths.vocab).unwrap();

    let (src_len, tgt_len) = (vocabs.src.len() as i64, vocabs.tgt.len() as i64);
    let train_pairs = vocabs.encode_pairs(&training, src_len, tgt_len);
    let buckets = create_buckets(train_pairs, train_cfg.bucket_width, train_cfg.num_buckets);
    assert_eq!(buckets.iter().map(Vec::len).sum::<usize>(), 4);
    BucketStore::new(&paths.bucket_dir).save_all(&buckets).unwrap();

    let dev_tokens = corpus.tokenized(train_cfg.num_training, train_cfg.num_dev);
    let dev_ids = vocabs.encode_pairs(&dev_tokens, src_len, tgt_len);
    // "gris" and "grey" only occur in the dev lines
    assert_eq!(dev_ids[0].0[2], UNK_ID);
    assert_eq!(dev_ids[0].1[1], UNK_ID);
    let dev = SentenceSet::new(dev_tokens, dev_ids, train_cfg.num_training);
    let preview_tokens = corpus.tokenized(0, 2);
    let preview_ids = vocabs.encode_pairs(&preview_tokens, src_len, tgt_len);
    let preview = SentenceSet::new(preview_tokens, preview_ids, 0);

    tch::manual_seed(1);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = EncoderDecoder::new(&vs.root(), ModelConfig::new(src_len, tgt_len, 6)).unwrap();
    let mut trainer = Trainer::new(model, vs, train_cfg.clone(), &paths).unwrap();
    assert_eq!(trainer.resume().unwrap(), 0);
    let bleu = trainer.train(&preview, &dev, &vocabs, 0).unwrap();
    assert!((0.0..=100.0).contains(&bleu));

    let store = CheckpointStore::new(&paths.model_dir, "seq2seq");
    assert!(store.epoch_path(1).exists());
    assert!(store.epoch_path(2).exists());
    assert!(store.final_path().exists());
    assert_eq!(store.latest_epoch().unwrap(), 2);

    let dev_log = fs::read_to_string(&paths.dev_log).unwrap();
    assert_eq!(dev_log.lines().count(), 3);
    assert!(dev_log.starts_with("epoch,perplexity,bleu"));
    let train_log = fs::read_to_string(&paths.train_log).unwrap();
    assert!(train_log.lines().count() > 1);

    // a second run picks up the epoch numbering
    tch::manual_seed(1);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = EncoderDecoder::new(&vs.root(), ModelConfig::new(src_len, tgt_len, 6)).unwrap();
    let mut resumed = Trainer::new(model, vs, TrainConfig { epochs: 1, ..train_cfg }, &paths).unwrap();
    let start = resumed.resume().unwrap();
    assert_eq!(start, 2);
    resumed.train(&preview, &dev, &vocabs, start).unwrap();
    assert!(store.epoch_path(3).exists());
}
