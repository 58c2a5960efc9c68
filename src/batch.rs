// src/batch.rs - padding, batch tensors and attention masks
use rayon::prelude::*;
use tch::{Device, Kind, Tensor};

use crate::error::{NmtError, Result};
use crate::vocab::{EOS_ID, GO_ID, PAD_ID};

/// Pad `data` with PAD up to `lim`, in front when `at_start`, else behind.
/// Longer input comes back unchanged.
pub fn pad_list(data: &[i64], lim: usize, at_start: bool) -> Vec<i64> {
    let fill = lim.saturating_sub(data.len());
    let mut out = Vec::with_capacity(data.len() + fill);
    if at_start {
        out.resize(fill, PAD_ID);
        out.extend_from_slice(data);
    } else {
        out.extend_from_slice(data);
        out.resize(data.len() + fill, PAD_ID);
    }
    out
}

/// Decoder row: `GO target EOS`, right padded to `tgt_lim + 2`.
pub fn decoder_row(target: &[i64], tgt_lim: usize) -> Vec<i64> {
    let mut row = Vec::with_capacity(tgt_lim + 2);
    row.push(GO_ID);
    row.extend_from_slice(target);
    row.push(EOS_ID);
    pad_list(&row, tgt_lim + 2, false)
}

/// Tensors for one bucketed mini-batch.
pub struct Batch {
    /// [B, src_lim], left padded
    pub forward: Tensor,
    /// [B, src_lim], each source reversed then left padded
    pub reverse: Tensor,
    /// [B, tgt_lim + 2], GO .. EOS then right padded
    pub decoder: Tensor,
}

impl Batch {
    pub fn from_pairs(pairs: &[(Vec<i64>, Vec<i64>)], src_lim: usize, tgt_lim: usize, device: Device) -> Result<Self> {
        if pairs.is_empty() {
            return Err(NmtError::Data("empty batch".to_string()));
        }
        if let Some((s, t)) = pairs.iter().find(|(s, t)| s.len() > src_lim || t.len() > tgt_lim) {
            return Err(NmtError::Data(format!(
                "pair of lengths ({}, {}) does not fit pad limits ({}, {})",
                s.len(),
                t.len(),
                src_lim,
                tgt_lim
            )));
        }
        if let Some((s, t)) = pairs.iter().find(|(s, t)| s.is_empty() || t.is_empty()) {
            return Err(NmtError::Data(format!("empty sequence in batch (src={:?}, tgt={:?})", s, t)));
        }

        let rows: Vec<(Vec<i64>, Vec<i64>, Vec<i64>)> = pairs
            .par_iter()
            .map(|(src, tgt)| {
                let reversed: Vec<i64> = src.iter().rev().copied().collect();
                (pad_list(src, src_lim, true), pad_list(&reversed, src_lim, true), decoder_row(tgt, tgt_lim))
            })
            .collect();

        let b = pairs.len() as i64;
        let fwd: Vec<i64> = rows.iter().flat_map(|(f, _, _)| f.iter().copied()).collect();
        let rev: Vec<i64> = rows.iter().flat_map(|(_, r, _)| r.iter().copied()).collect();
        let dec: Vec<i64> = rows.iter().flat_map(|(_, _, d)| d.iter().copied()).collect();

        Ok(Self {
            forward: Tensor::from_slice(&fwd).view([b, src_lim as i64]).to(device),
            reverse: Tensor::from_slice(&rev).view([b, src_lim as i64]).to(device),
            decoder: Tensor::from_slice(&dec).view([b, tgt_lim as i64 + 2]).to(device),
        })
    }
}

/// [B, T] bool, true at real (non-PAD) positions.
pub fn attention_mask(forward: &Tensor) -> Tensor {
    forward.ne(PAD_ID)
}

/// [B, ceil(T / segment_size)] bool, true when any token of the segment is real.
pub fn segment_mask(forward: &Tensor, segment_size: i64) -> Tensor {
    let size = forward.size();
    let (b, t) = (size[0], size[1]);
    let segments = (t + segment_size - 1) / segment_size;
    let valid = forward.ne(PAD_ID).to_kind(Kind::Int64);
    let tail = segments * segment_size - t;
    let valid = if tail > 0 {
        let zeros = Tensor::zeros([b, tail], (Kind::Int64, forward.device()));
        Tensor::cat(&[valid, zeros], 1)
    } else {
        valid
    };
    valid.view([b, segments, segment_size]).amax([2], false).gt(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn to_vec(t: &Tensor) -> Vec<i64> {
        Vec::<i64>::try_from(&t.flatten(0, -1).to_kind(Kind::Int64)).unwrap()
    }

    #[test]
    fn pads_source_left_and_target_right() {
        assert_eq!(pad_list(&[4, 5], 4, true), vec![0, 0, 4, 5]);
        assert_eq!(pad_list(&[4, 5], 4, false), vec![4, 5, 0, 0]);
        assert_eq!(pad_list(&[4, 5, 6], 2, true), vec![4, 5, 6]);
        assert_eq!(decoder_row(&[5, 4], 3), vec![GO_ID, 5, 4, EOS_ID, PAD_ID]);
    }

    #[test]
    fn builds_forward_reverse_and_decoder_tensors() {
        let pairs = vec![(vec![4, 5, 6], vec![7]), (vec![8], vec![9, 10])];
        let batch = Batch::from_pairs(&pairs, 3, 2, Device::Cpu).unwrap();
        assert_eq!(batch.forward.size(), vec![2, 3]);
        assert_eq!(to_vec(&batch.forward), vec![4, 5, 6, 0, 0, 8]);
        assert_eq!(to_vec(&batch.reverse), vec![6, 5, 4, 0, 0, 8]);
        assert_eq!(
            to_vec(&batch.decoder),
            vec![GO_ID, 7, EOS_ID, 0, GO_ID, 9, 10, EOS_ID]
        );
    }

    #[test]
    fn rejects_oversized_and_empty_pairs() {
        let too_long = vec![(vec![4, 5, 6], vec![7])];
        assert!(matches!(Batch::from_pairs(&too_long, 2, 2, Device::Cpu), Err(NmtError::Data(_))));
        let empty = vec![(vec![], vec![7])];
        assert!(Batch::from_pairs(&empty, 2, 2, Device::Cpu).is_err());
    }

    #[test]
    fn masks_follow_padding() {
        let fwd = Tensor::from_slice(&[0i64, 0, 4, 5, 0, 0, 0, 6]).view([2, 4]);
        let mask = attention_mask(&fwd);
        assert_eq!(to_vec(&mask), vec![0, 0, 1, 1, 0, 0, 0, 1]);

        let fwd = Tensor::from_slice(&[0i64, 0, 0, 4, 5, 0, 0, 0, 0, 0]).view([2, 5]);
        let seg = segment_mask(&fwd, 2);
        assert_eq!(seg.size(), vec![2, 3]);
        assert_eq!(to_vec(&seg), vec![0, 1, 1, 0, 0, 0]);
    }

    proptest! {
        #[test]
        fn padding_round_trips(data in prop::collection::vec(1i64..50, 0..12), extra in 0usize..8) {
            let lim = data.len() + extra;
            let front = pad_list(&data, lim, true);
            prop_assert_eq!(front.len(), lim);
            prop_assert_eq!(&front[lim - data.len()..], data.as_slice());

            let back = pad_list(&data, lim, false);
            prop_assert_eq!(&back[..data.len()], data.as_slice());
            prop_assert!(back[data.len()..].iter().all(|&x| x == PAD_ID));
        }
    }
}
