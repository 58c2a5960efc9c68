// src/model.rs - bidirectional LSTM encoder, attention LSTM decoder
use tch::{nn, nn::Module, Device, Kind, Tensor};

use crate::attention::DotAttention;
use crate::batch::{attention_mask, decoder_row, segment_mask, Batch};
use crate::config::ModelConfig;
use crate::error::{NmtError, Result};
use crate::recurrent::RecurrentStack;
use crate::segment::SegmentEncoder;
use crate::vocab::{EOS_ID, GO_ID, PAD_ID};

/// Where the model is inside one encode-decode cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CyclePhase {
    Reset,
    Encoding,
    StateHandoff,
    Decoding,
    Done,
}

/// Greedy decoding result.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Predicted ids, without the stop token.
    pub tokens: Vec<i64>,
    /// EOS or PAD when decoding stopped on one, `None` when `max_len` was hit.
    pub stop: Option<i64>,
    /// One row of attention weights per decode step (empty without attention).
    pub attention: Vec<Vec<f32>>,
}

pub struct EncoderDecoder {
    config: ModelConfig,

    embed_enc: nn::Embedding,
    segment: Option<SegmentEncoder>,
    lstm_enc: RecurrentStack,
    lstm_rev_enc: RecurrentStack,

    embed_dec: nn::Embedding,
    lstm_dec: RecurrentStack,

    attention: DotAttention,
    context: Option<nn::Linear>, // [cv, h] 4H -> 2H
    output: nn::Linear,          // 2H -> V

    // weight 0 for PAD so padded targets add no loss
    class_weight: Tensor,

    // per-cycle state, dropped by reset_state
    enc_states: Option<Tensor>, // [B, T, 2H]
    mask: Option<Tensor>,       // [B, T]
    loss: Option<Tensor>,
    phase: CyclePhase,

    device: Device,
}

impl EncoderDecoder {
    pub fn new(vs: &nn::Path, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let h = config.hidden_units;
        let h2 = config.decoder_units();

        let embed_enc = nn::embedding(vs / "embed_enc", config.src_vocab_size, h, Default::default());
        let segment = config
            .segment
            .as_ref()
            .map(|seg| SegmentEncoder::new(&(vs / "segment"), h, seg));
        let enc_input = segment.as_ref().map_or(h, SegmentEncoder::output_dim);

        let lstm_enc = RecurrentStack::new(&(vs / "lstm_enc"), enc_input, h, config.enc_layers, config.dropout);
        let lstm_rev_enc = RecurrentStack::new(&(vs / "lstm_rev_enc"), enc_input, h, config.enc_layers, config.dropout);

        let embed_dec = nn::embedding(vs / "embed_dec", config.tgt_vocab_size, h2, Default::default());
        let lstm_dec = RecurrentStack::new(&(vs / "lstm_dec"), h2, h2, config.dec_layers, config.dropout);

        let context = config
            .attention
            .then(|| nn::linear(vs / "context", 2 * h2, h2, Default::default()));
        let output = nn::linear(vs / "out", h2, config.tgt_vocab_size, Default::default());

        let device = vs.device();
        let mut weights = vec![1.0f32; config.tgt_vocab_size as usize];
        weights[PAD_ID as usize] = 0.0;
        let class_weight = Tensor::from_slice(&weights).to(device);

        tracing::debug!(
            src_vocab = config.src_vocab_size,
            tgt_vocab = config.tgt_vocab_size,
            hidden = h,
            enc_layers = config.enc_layers,
            dec_layers = config.dec_layers,
            attention = config.attention,
            segment = config.segment.is_some(),
            "built encoder-decoder"
        );

        Ok(Self {
            config,
            embed_enc,
            segment,
            lstm_enc,
            lstm_rev_enc,
            embed_dec,
            lstm_dec,
            attention: DotAttention,
            context,
            output,
            class_weight,
            enc_states: None,
            mask: None,
            loss: None,
            phase: CyclePhase::Reset,
            device,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Encoder states of the current cycle, [B, T, 2H].
    pub fn enc_states(&self) -> Option<&Tensor> {
        self.enc_states.as_ref()
    }

    pub fn attention_mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }

    /// Loss accumulated by the last decode of this cycle.
    pub fn loss(&self) -> Option<&Tensor> {
        self.loss.as_ref()
    }

    /// True when no recurrent state, encoder output or loss survives.
    pub fn is_reset(&self) -> bool {
        self.phase == CyclePhase::Reset
            && self.lstm_enc.is_reset()
            && self.lstm_rev_enc.is_reset()
            && self.lstm_dec.is_reset()
            && self.enc_states.is_none()
            && self.loss.is_none()
    }

    fn expect_phase(&self, expected: CyclePhase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(NmtError::Phase { expected, found: self.phase })
        }
    }

    pub fn reset_state(&mut self) {
        self.lstm_enc.reset_state();
        self.lstm_rev_enc.reset_state();
        self.lstm_dec.reset_state();
        self.enc_states = None;
        self.mask = None;
        self.loss = None;
        self.phase = CyclePhase::Reset;
    }

    /// Encode one unpadded sequence (batch of one).
    pub fn encode_sequence(&mut self, tokens: &[i64], train: bool) -> Result<()> {
        if tokens.is_empty() {
            return Err(NmtError::Data("cannot encode an empty sequence".to_string()));
        }
        let t = tokens.len() as i64;
        let reversed: Vec<i64> = tokens.iter().rev().copied().collect();
        let fwd = Tensor::from_slice(tokens).view([1, t]).to(self.device);
        let rev = Tensor::from_slice(&reversed).view([1, t]).to(self.device);
        self.encode_batch(&fwd, &rev, train)
    }

    /// Feed both encoder stacks one timestep at a time.
    /// forward: [B, T] left padded; reverse: [B, T] reversed sources, left padded.
    pub fn encode_batch(&mut self, forward: &Tensor, reverse: &Tensor, train: bool) -> Result<()> {
        self.expect_phase(CyclePhase::Reset)?;
        let size = forward.size();
        if size.len() != 2 || size[0] == 0 || size[1] == 0 || reverse.size() != size {
            return Err(NmtError::Data(format!(
                "encoder batches must be matching non-empty [B, T], got {:?} and {:?}",
                size,
                reverse.size()
            )));
        }
        self.phase = CyclePhase::Encoding;

        let (fwd_inputs, rev_inputs, mask) = match &self.segment {
            Some(seg) => {
                let phrases = seg.forward(&self.embed_enc.forward(forward)); // [B,S,F]
                let reversed = phrases.flip([1]);
                (phrases, reversed, segment_mask(forward, seg.segment_size()))
            }
            None => (
                self.embed_enc.forward(forward),
                self.embed_enc.forward(reverse),
                attention_mask(forward),
            ),
        };

        let steps = fwd_inputs.size()[1];
        let mut forward_states = Vec::with_capacity(steps as usize);
        let mut backward_states = Vec::with_capacity(steps as usize);
        for t in 0..steps {
            forward_states.push(self.lstm_enc.feed(&fwd_inputs.select(1, t), train));
            backward_states.push(self.lstm_rev_enc.feed(&rev_inputs.select(1, t), train));
        }
        // backward step t describes source position T-1-t
        backward_states.reverse();

        let enc_states = Tensor::cat(
            &[Tensor::stack(&forward_states, 1), Tensor::stack(&backward_states, 1)],
            2,
        );
        self.enc_states = Some(enc_states);
        self.mask = Some(mask);
        Ok(())
    }

    /// Seed the first decoder layer with the concatenated final (h, c) of the
    /// forward and backward encoders.
    pub fn set_decoder_state(&mut self) -> Result<()> {
        self.expect_phase(CyclePhase::Encoding)?;
        let (fwd, rev) = match (self.lstm_enc.top_state(), self.lstm_rev_enc.top_state()) {
            (Some(f), Some(r)) => (f, r),
            _ => return Err(NmtError::Data("encoder produced no state".to_string())),
        };
        let h = Tensor::cat(&[fwd.h(), rev.h()], 2);
        let c = Tensor::cat(&[fwd.c(), rev.c()], 2);
        self.lstm_dec.set_state(0, h, c);
        self.phase = CyclePhase::StateHandoff;
        Ok(())
    }

    /// One decoder step: input ids [B] -> (logits [B, V], alphas).
    fn decode_step(&mut self, input: &Tensor, batched: bool, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        let embedded = self.embed_dec.forward(input);
        let hidden = self.lstm_dec.feed(&embedded, train); // [B,2H]

        let Some(context_layer) = &self.context else {
            return Ok((self.output.forward(&hidden), None));
        };
        let enc_states = self
            .enc_states
            .as_ref()
            .ok_or(NmtError::Phase { expected: CyclePhase::Decoding, found: self.phase })?;

        let (cv, alphas) = if batched {
            self.attention.attend_batch(enc_states, &hidden, self.mask.as_ref())
        } else {
            let mask = self.mask.as_ref().map(|m| m.select(0, 0));
            self.attention.attend_single(&enc_states.select(0, 0), &hidden, mask.as_ref())
        };
        let ht = context_layer.forward(&Tensor::cat(&[cv, hidden], 1)).tanh();
        Ok((self.output.forward(&ht), Some(alphas)))
    }

    /// Cross entropy with PAD weighted to zero, summed over the batch and
    /// divided by the batch size.
    fn masked_cross_entropy(&self, logits: &Tensor, targets: &Tensor) -> Tensor {
        let batch = targets.size()[0] as f64;
        let nll = logits
            .log_softmax(-1, Kind::Float)
            .gather(1, &targets.unsqueeze(1), false)
            .squeeze_dim(1)
            .neg();
        let weights = self.class_weight.index_select(0, targets);
        (nll * weights).sum(Kind::Float) / batch
    }

    /// Teacher-forced decode over `targets` [B, L] (column 0 is GO).
    fn decode_teacher_forced(&mut self, targets: &Tensor, batched: bool, train: bool) -> Result<Tensor> {
        self.expect_phase(CyclePhase::StateHandoff)?;
        let size = targets.size();
        let enc_batch = self.enc_states.as_ref().map(|e| e.size()[0]);
        if size.len() != 2 || size[1] < 2 || Some(size[0]) != enc_batch {
            return Err(NmtError::Data(format!(
                "decoder batch {:?} does not match encoder batch {:?}",
                size, enc_batch
            )));
        }
        self.phase = CyclePhase::Decoding;

        let mut loss = Tensor::zeros([], (Kind::Float, self.device));
        for i in 1..size[1] {
            let (logits, _) = self.decode_step(&targets.select(1, i - 1), batched, train)?;
            loss = loss + self.masked_cross_entropy(&logits, &targets.select(1, i));
        }

        self.loss = Some(loss.shallow_clone());
        self.phase = CyclePhase::Done;
        Ok(loss)
    }

    /// Single example decode against `GO targets EOS`; returns summed loss.
    pub fn decode_train(&mut self, targets: &[i64], train: bool) -> Result<Tensor> {
        let row = decoder_row(targets, targets.len());
        let dec = Tensor::from_slice(&row).view([1, row.len() as i64]).to(self.device);
        self.decode_teacher_forced(&dec, false, train)
    }

    /// Batched decode; `target_batch` is [B, L] from `Batch::decoder`.
    pub fn decode_batch(&mut self, target_batch: &Tensor, train: bool) -> Result<Tensor> {
        self.decode_teacher_forced(target_batch, true, train)
    }

    /// Full cycle for one pair.
    pub fn train_sequence(&mut self, source: &[i64], target: &[i64], train: bool) -> Result<Tensor> {
        self.reset_state();
        self.encode_sequence(source, train)?;
        self.set_decoder_state()?;
        self.decode_train(target, train)
    }

    /// Full cycle for a bucketed batch: pad, encode, hand off, decode.
    pub fn train_batch(
        &mut self,
        pairs: &[(Vec<i64>, Vec<i64>)],
        src_pad_len: usize,
        tgt_pad_len: usize,
        train: bool,
    ) -> Result<Tensor> {
        self.reset_state();
        let batch = Batch::from_pairs(pairs, src_pad_len, tgt_pad_len, self.device)?;
        self.encode_batch(&batch.forward, &batch.reverse, train)?;
        self.set_decoder_state()?;
        self.decode_batch(&batch.decoder, train)
    }

    /// Greedy decoding from GO until EOS, PAD or `max_len` steps.
    pub fn predict(&mut self, tokens: &[i64], max_len: usize) -> Result<Prediction> {
        tch::no_grad(|| -> Result<Prediction> {
            self.reset_state();
            self.encode_sequence(tokens, false)?;
            self.set_decoder_state()?;
            self.phase = CyclePhase::Decoding;

            let mut prediction = Prediction { tokens: Vec::new(), stop: None, attention: Vec::new() };
            let mut prev = GO_ID;
            for _ in 0..max_len {
                let input = Tensor::from_slice(&[prev]).to(self.device);
                let (logits, alphas) = self.decode_step(&input, false, false)?;
                if let Some(alphas) = alphas {
                    let row = Vec::<f32>::try_from(&alphas.view([-1]).to_kind(Kind::Float).to_device(Device::Cpu))?;
                    prediction.attention.push(row);
                }
                let pred = logits.softmax(-1, Kind::Float).argmax(-1, false).f_int64_value(&[0])?;
                if pred == EOS_ID || pred == PAD_ID {
                    prediction.stop = Some(pred);
                    break;
                }
                prediction.tokens.push(pred);
                prev = pred;
            }

            self.phase = CyclePhase::Done;
            Ok(prediction)
        })
    }
}
