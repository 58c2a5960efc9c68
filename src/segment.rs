// src/segment.rs - convolutional phrase encoder with highway layers
use tch::{nn, nn::Module, Kind, Tensor};

use crate::config::SegmentConfig;

/// Gated residual: y = t * relu(W_h x) + (1 - t) * x, t = sigmoid(W_t x).
#[derive(Debug)]
pub struct Highway {
    plain: nn::Linear,
    transform: nn::Linear,
}

impl Highway {
    pub fn new(vs: &nn::Path, dim: i64) -> Self {
        let gate_cfg = nn::LinearConfig { bs_init: Some(nn::Init::Const(-1.0)), ..Default::default() };
        Self {
            plain: nn::linear(vs / "plain", dim, dim, Default::default()),
            transform: nn::linear(vs / "transform", dim, dim, gate_cfg),
        }
    }
}

impl Module for Highway {
    fn forward(&self, x: &Tensor) -> Tensor {
        let t = self.transform.forward(x).sigmoid();
        let h = self.plain.forward(x).relu();
        &t * h + (t.neg() + 1.0) * x
    }
}

/// Zero rows added before and after the time axis for filter `i`, so a
/// kernel of height `i + 1` yields exactly T outputs. Even filters lean on
/// the start, odd filters on the end.
pub fn filter_padding(i: i64) -> (i64, i64) {
    (i / 2, i - i / 2)
}

/// Pure zero padding of a [B, C, T, W] tensor along T.
fn pad_time(x: &Tensor, before: i64, after: i64) -> Tensor {
    if before == 0 && after == 0 {
        return x.shallow_clone();
    }
    let size = x.size();
    let opts = (x.kind(), x.device());
    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(Tensor::zeros([size[0], size[1], before, size[3]], opts));
    }
    parts.push(x.shallow_clone());
    if after > 0 {
        parts.push(Tensor::zeros([size[0], size[1], after, size[3]], opts));
    }
    Tensor::cat(&parts, 2)
}

/// Bank of filters of height 1..=N over embedded tokens, ReLU, max-pool over
/// non-overlapping windows of `segment_size`, then highway layers. Produces
/// one `num_filters`-wide vector per segment.
pub struct SegmentEncoder {
    filters: Vec<(Tensor, Tensor)>,
    highway: Vec<Highway>,
    segment_size: i64,
    num_filters: i64,
}

impl SegmentEncoder {
    pub fn new(vs: &nn::Path, embed_dim: i64, cfg: &SegmentConfig) -> Self {
        let filters = (0..cfg.num_filters)
            .map(|i| {
                let p = vs / format!("conv_{}", i);
                let fan_in = ((i + 1) * embed_dim) as f64;
                let weight = p.var(
                    "weight",
                    &[1, 1, i + 1, embed_dim],
                    nn::Init::Randn { mean: 0.0, stdev: 1.0 / fan_in.sqrt() },
                );
                let bias = p.var("bias", &[1], nn::Init::Const(0.0));
                (weight, bias)
            })
            .collect();
        let highway = (0..cfg.highway_layers)
            .map(|i| Highway::new(&(vs / format!("highway_{}", i)), cfg.num_filters))
            .collect();
        Self { filters, highway, segment_size: cfg.segment_size, num_filters: cfg.num_filters }
    }

    pub fn output_dim(&self) -> i64 {
        self.num_filters
    }

    pub fn segment_size(&self) -> i64 {
        self.segment_size
    }

    pub fn num_segments(&self, time: i64) -> i64 {
        (time + self.segment_size - 1) / self.segment_size
    }

    /// embedded: [B, T, E] -> rectified filter responses [B, N, T, 1]
    fn conv_features(&self, embedded: &Tensor) -> Tensor {
        let size = embedded.size();
        let x = embedded.view([size[0], 1, size[1], size[2]]);
        let maps: Vec<Tensor> = self
            .filters
            .iter()
            .enumerate()
            .map(|(i, (w, bias))| {
                let (before, after) = filter_padding(i as i64);
                pad_time(&x, before, after).conv2d(w, Some(bias), [1, 1], [0, 0], [1, 1], 1)
            })
            .collect();
        Tensor::cat(&maps, 1).relu()
    }

    /// embedded: [B, T, E] -> phrases [B, ceil(T / segment_size), num_filters]
    pub fn forward(&self, embedded: &Tensor) -> Tensor {
        let size = embedded.size();
        let (b, t) = (size[0], size[1]);
        let conv = self.conv_features(embedded);

        // pad-to-window: zeros never win a max over ReLU output
        let segments = self.num_segments(t);
        let conv = pad_time(&conv, 0, segments * self.segment_size - t);
        let pooled = conv.max_pool2d([self.segment_size, 1], [self.segment_size, 1], [0, 0], [1, 1], false);

        let phrases = pooled.view([b, self.num_filters, segments]).transpose(1, 2).contiguous();
        self.highway.iter().fold(phrases, |acc, hw| hw.forward(&acc))
    }
}
