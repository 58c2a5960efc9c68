// src/metrics.rs
use std::collections::HashMap;
use std::hash::Hash;

use crate::vocab::{EOS_ID, UNK_ID};

/// Sufficient statistics for corpus BLEU:
/// `[hyp_len, ref_len, match_1, total_1, .., match_4, total_4]`.
pub type BleuStats = [usize; 10];

fn ngrams<T: Eq + Hash + Clone>(tokens: &[T], n: usize) -> HashMap<Vec<T>, usize> {
    let mut map = HashMap::new();
    if n == 0 || tokens.len() < n {
        return map;
    }
    for window in tokens.windows(n) {
        *map.entry(window.to_vec()).or_insert(0) += 1;
    }
    map
}

/// Per-sentence statistics; sum them over a corpus before calling [`bleu`].
pub fn bleu_stats<T: Eq + Hash + Clone>(hypothesis: &[T], reference: &[T]) -> BleuStats {
    let mut stats = [0usize; 10];
    stats[0] = hypothesis.len();
    stats[1] = reference.len();
    for n in 1..=4 {
        let hyp = ngrams(hypothesis, n);
        let refs = ngrams(reference, n);
        let clipped: usize = hyp
            .iter()
            .map(|(ng, &count)| count.min(refs.get(ng).copied().unwrap_or(0)))
            .sum();
        stats[2 * n] = clipped;
        stats[2 * n + 1] = (hypothesis.len() + 1).saturating_sub(n);
    }
    stats
}

pub fn accumulate(total: &mut BleuStats, stats: &BleuStats) {
    total.iter_mut().zip(stats).for_each(|(t, s)| *t += s);
}

/// BLEU-4 with brevity penalty, in [0, 1]. Zero when any statistic is zero.
pub fn bleu(stats: &BleuStats) -> f64 {
    if stats.iter().any(|&x| x == 0) {
        return 0.0;
    }
    let (c, r) = (stats[0] as f64, stats[1] as f64);
    let log_prec: f64 = stats[2..]
        .chunks(2)
        .map(|pair| (pair[0] as f64 / pair[1] as f64).ln())
        .sum::<f64>()
        / 4.0;
    ((1.0 - r / c).min(0.0) + log_prec).exp()
}

/// Multiset overlap between reference and prediction, ignoring UNK and EOS
/// in the prediction.
pub fn count_match(reference: &[i64], predicted: &[i64]) -> usize {
    let refs = ngrams(reference, 1);
    let preds = ngrams(predicted, 1);
    preds
        .iter()
        .filter(|(w, _)| w[0] != UNK_ID && w[0] != EOS_ID)
        .map(|(w, &count)| count.min(refs.get(w).copied().unwrap_or(0)))
        .sum()
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PrecisionRecall {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl PrecisionRecall {
    /// From summed (matches, predicted length, reference length).
    pub fn from_counts(matches: usize, predicted: usize, reference: usize) -> Self {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(matches, predicted);
        let recall = ratio(matches, reference);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self { precision, recall, f1 }
    }
}

/// exp of the mean per-word loss; infinite when no words were scored.
pub fn perplexity(total_loss: f64, num_words: usize) -> f64 {
    if num_words == 0 {
        return f64::INFINITY;
    }
    (total_loss / num_words as f64).exp()
}
