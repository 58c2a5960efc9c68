// src/attention.rs
use tch::{Kind, Tensor};

/// Score given to padded encoder positions before the softmax.
pub const MASKED_SCORE: f64 = -1000.0;

/// Dot-product attention of the decoder's top hidden state over the
/// encoder states. Stateless; the orchestrator owns the tensors.
#[derive(Clone, Copy, Debug, Default)]
pub struct DotAttention;

impl DotAttention {
    /// Batched path.
    /// enc_states: [B, T, D], query: [B, D], mask: [B, T] (true = real token)
    /// returns (context [B, D], alphas [B, T])
    pub fn attend_batch(&self, enc_states: &Tensor, query: &Tensor, mask: Option<&Tensor>) -> (Tensor, Tensor) {
        let scores = enc_states.bmm(&query.unsqueeze(2)).squeeze_dim(2); // [B,T]
        let scores = match mask {
            Some(m) => scores.masked_fill(&m.logical_not(), MASKED_SCORE),
            None => scores,
        };
        let alphas = scores.softmax(-1, Kind::Float);
        let context = alphas.unsqueeze(1).bmm(enc_states).squeeze_dim(1);
        (context, alphas)
    }

    /// Single-example path with plain matrix products.
    /// enc_states: [T, D], query: [1, D], mask: [T]
    /// returns (context [1, D], alphas [1, T])
    pub fn attend_single(&self, enc_states: &Tensor, query: &Tensor, mask: Option<&Tensor>) -> (Tensor, Tensor) {
        let scores = query.matmul(&enc_states.tr()); // [1,T]
        let scores = match mask {
            Some(m) => scores.masked_fill(&m.logical_not().unsqueeze(0), MASKED_SCORE),
            None => scores,
        };
        let alphas = scores.softmax(-1, Kind::Float);
        let context = alphas.matmul(enc_states);
        (context, alphas)
    }
}
