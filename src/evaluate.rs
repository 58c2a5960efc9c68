// src/evaluate.rs - perplexity, BLEU, precision/recall and prediction display
use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::buckets::IdPair;
use crate::metrics::{accumulate, bleu, bleu_stats, count_match, perplexity, BleuStats, PrecisionRecall};
use crate::model::{EncoderDecoder, Prediction};
use crate::vocab::Vocabularies;

/// Corpus pairs as both raw tokens (for display and BLEU references) and ids.
pub struct SentenceSet {
    pub tokens: Vec<(Vec<String>, Vec<String>)>,
    pub ids: Vec<IdPair>,
    /// Corpus line of the first pair.
    pub first_line: usize,
}

impl SentenceSet {
    pub fn new(tokens: Vec<(Vec<String>, Vec<String>)>, ids: Vec<IdPair>, first_line: usize) -> Self {
        debug_assert_eq!(tokens.len(), ids.len());
        Self { tokens, ids, first_line }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Pairs the model can score; empty sides are skipped.
    fn usable(&self) -> impl Iterator<Item = (usize, &IdPair)> {
        self.ids
            .iter()
            .enumerate()
            .filter(|(_, (s, t))| !s.is_empty() && !t.is_empty())
    }
}

fn progress(len: usize, what: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message(what.to_string());
    pb
}

/// exp(total loss / number of reference words) with gradients disabled.
pub fn dev_perplexity(model: &mut EncoderDecoder, dev: &SentenceSet) -> Result<f64> {
    let pb = progress(dev.len(), "perplexity");
    let (total_loss, num_words) = tch::no_grad(|| -> Result<(f64, usize)> {
        let mut total_loss = 0.0f64;
        let mut num_words = 0usize;
        for (_, (src, tgt)) in dev.usable() {
            let loss = model.train_sequence(src, tgt, false)?;
            let loss_val = f64::try_from(&loss)?;
            total_loss += loss_val;
            num_words += tgt.len();
            pb.set_message(format!("loss={:.6}", loss_val));
            pb.inc(1);
        }
        Ok((total_loss, num_words))
    })?;
    pb.finish_and_clear();

    let pplx = perplexity(total_loss, num_words);
    tracing::info!(perplexity = pplx, words = num_words, "dev perplexity");
    Ok(pplx)
}

/// Corpus BLEU (0..100) of greedy predictions against the reference tokens.
pub fn dev_bleu(model: &mut EncoderDecoder, dev: &SentenceSet, vocabs: &Vocabularies, max_len: usize) -> Result<f64> {
    let pb = progress(dev.len(), "bleu");
    let mut stats: BleuStats = [0; 10];
    for (i, (src, _)) in dev.usable() {
        let prediction = model.predict(src, max_len)?;
        let hypothesis = vocabs.tgt.decode(&prediction.tokens);
        accumulate(&mut stats, &bleu_stats(&hypothesis, &dev.tokens[i].1));
        pb.inc(1);
    }
    pb.finish_and_clear();

    let score = 100.0 * bleu(&stats);
    tracing::info!(bleu = score, "dev bleu");
    Ok(score)
}

/// Token overlap counts for one sentence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SentenceMatch {
    pub matches: usize,
    pub predicted: usize,
    pub reference: usize,
}

pub fn predict_sentence(
    model: &mut EncoderDecoder,
    source: &[i64],
    reference: &[i64],
    max_len: usize,
) -> Result<(SentenceMatch, Prediction)> {
    let prediction = model.predict(source, max_len)?;
    let counts = SentenceMatch {
        matches: count_match(reference, &prediction.tokens),
        predicted: prediction.tokens.len(),
        reference: reference.len(),
    };
    Ok((counts, prediction))
}

pub fn precision_recall(model: &mut EncoderDecoder, dev: &SentenceSet, max_len: usize) -> Result<PrecisionRecall> {
    let mut total = SentenceMatch::default();
    for (_, (src, tgt)) in dev.usable() {
        let (counts, _) = predict_sentence(model, src, tgt, max_len)?;
        total.matches += counts.matches;
        total.predicted += counts.predicted;
        total.reference += counts.reference;
    }
    let pr = PrecisionRecall::from_counts(total.matches, total.predicted, total.reference);
    tracing::info!(precision = pr.precision, recall = pr.recall, f1 = pr.f1, "dev precision/recall");
    Ok(pr)
}

/// Attention weights of one prediction: rows are hypothesis steps, columns
/// are source positions (or segments).
#[derive(Clone, Debug, PartialEq)]
pub struct AttentionMap {
    pub source: Vec<String>,
    pub hypothesis: Vec<String>,
    pub weights: Vec<Vec<f32>>,
}

impl AttentionMap {
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
        let mut header = vec![String::new()];
        header.extend(self.source.iter().cloned());
        wtr.write_record(&header)?;
        for (word, row) in self.hypothesis.iter().zip(&self.weights) {
            let mut record = vec![word.clone()];
            record.extend(row.iter().map(|w| format!("{:.6}", w)));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Per-sentence thresholds a prediction must reach to be displayed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DisplayFilter {
    pub min_precision: f64,
    pub min_recall: f64,
}

impl DisplayFilter {
    pub fn accepts(&self, sentence: &PrecisionRecall) -> bool {
        sentence.precision >= self.min_precision && sentence.recall >= self.min_recall
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PredictionReport {
    /// Aggregate over every scored sentence, shown or not.
    pub scores: PrecisionRecall,
    pub shown: usize,
}

/// Print Src/Ref/Hyp with precision and recall for the `count` pairs starting
/// at `start` that pass `filter`, optionally dumping their attention maps.
#[allow(clippy::too_many_arguments)]
pub fn show_predictions(
    model: &mut EncoderDecoder,
    dev: &SentenceSet,
    vocabs: &Vocabularies,
    start: usize,
    count: usize,
    filter: DisplayFilter,
    attention_dir: Option<&Path>,
    max_len: usize,
) -> Result<PredictionReport> {
    if let Some(dir) = attention_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let segment_size = model.config().segment.as_ref().map(|s| s.segment_size as usize);
    let mut total = SentenceMatch::default();
    let mut shown = 0usize;

    for i in start..(start + count).min(dev.len()) {
        let (src, tgt) = &dev.ids[i];
        if src.is_empty() || tgt.is_empty() {
            continue;
        }
        let (counts, prediction) = predict_sentence(model, src, tgt, max_len)?;
        total.matches += counts.matches;
        total.predicted += counts.predicted;
        total.reference += counts.reference;

        let sentence = PrecisionRecall::from_counts(counts.matches, counts.predicted, counts.reference);
        if !filter.accepts(&sentence) {
            continue;
        }
        shown += 1;

        let (src_words, ref_words) = &dev.tokens[i];
        let hyp_words = vocabs.tgt.decode(&prediction.tokens);
        let joiner = if segment_size.is_some() { "" } else { " " };

        println!("{}", "-".repeat(50));
        println!("sentence: {}", dev.first_line + i);
        println!("Src | {}", src_words.join(joiner));
        println!("Ref | {}", ref_words.join(joiner));
        println!("Hyp | {}", hyp_words.join(joiner));
        println!("{}", "-".repeat(50));
        println!("precision | {:.4}", sentence.precision);
        println!("recall    | {:.4}", sentence.recall);

        if let (Some(dir), false) = (attention_dir, prediction.attention.is_empty()) {
            let source = match segment_size {
                Some(size) => src_words.chunks(size).map(|c| c.concat()).collect(),
                None => src_words.clone(),
            };
            let mut hypothesis = hyp_words;
            if let Some(stop) = prediction.stop {
                hypothesis.push(vocabs.tgt.word(stop).to_string());
            }
            let map = AttentionMap { source, hypothesis, weights: prediction.attention };
            map.write_csv(&dir.join(format!("sample_{}_attention.csv", dev.first_line + i + 1)))?;
        }
    }

    println!("sentences matching filter = {}", shown);
    Ok(PredictionReport {
        scores: PrecisionRecall::from_counts(total.matches, total.predicted, total.reference),
        shown,
    })
}
