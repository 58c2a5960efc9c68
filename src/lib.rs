//! Attention encoder-decoder for sentence translation: a bidirectional LSTM
//! encoder (optionally over convolutional character segments), an LSTM
//! decoder with dot-product attention, bucketed batch training and
//! BLEU/perplexity evaluation.

pub mod attention;
pub mod batch;
pub mod buckets;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod error;
pub mod evaluate;
pub mod metrics;
pub mod model;
pub mod recurrent;
pub mod segment;
pub mod training;
pub mod vocab;

pub use error::{NmtError, Result};
pub use model::{CyclePhase, EncoderDecoder, Prediction};
