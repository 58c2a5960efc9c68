// src/recurrent.rs - stepwise multi-layer LSTM stack
use tch::{nn, nn::LSTMState, nn::RNN, Tensor};

/// Ordered LSTM layers fed one timestep at a time. Each layer keeps its own
/// (h, c) between calls; `None` stands for the zero state, so the batch size
/// is picked up from the first input after a reset.
pub struct RecurrentStack {
    layers: Vec<nn::LSTM>,
    states: Vec<Option<LSTMState>>,
    dropout: f64,
}

impl RecurrentStack {
    pub fn new(vs: &nn::Path, input_dim: i64, hidden_dim: i64, num_layers: usize, dropout: f64) -> Self {
        let layers: Vec<nn::LSTM> = (0..num_layers)
            .map(|i| {
                let in_dim = if i == 0 { input_dim } else { hidden_dim };
                nn::lstm(vs / format!("layer_{}", i), in_dim, hidden_dim, Default::default())
            })
            .collect();
        let states = (0..num_layers).map(|_| None).collect();
        Self { layers, states, dropout }
    }

    pub fn reset_state(&mut self) {
        self.states.iter_mut().for_each(|s| *s = None);
    }

    pub fn is_reset(&self) -> bool {
        self.states.iter().all(Option::is_none)
    }

    /// Feed `input` [B, F] through every layer; returns the top hidden [B, H].
    pub fn feed(&mut self, input: &Tensor, train: bool) -> Tensor {
        let batch = input.size()[0];
        let mut x = input.shallow_clone();
        for (i, (layer, slot)) in self.layers.iter().zip(self.states.iter_mut()).enumerate() {
            if i > 0 {
                x = x.dropout(self.dropout, train);
            }
            let prev = slot.take().unwrap_or_else(|| layer.zero_state(batch));
            let next = layer.step(&x, &prev);
            x = next.h().squeeze_dim(0);
            *slot = Some(next);
        }
        x
    }

    /// Overwrite one layer's state; `h` and `c` are [1, B, H].
    pub fn set_state(&mut self, layer: usize, h: Tensor, c: Tensor) {
        self.states[layer] = Some(LSTMState((h, c)));
    }

    /// State of the last layer after the latest `feed`.
    pub fn top_state(&self) -> Option<&LSTMState> {
        self.states.last().and_then(Option::as_ref)
    }
}
