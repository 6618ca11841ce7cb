use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::settings::PositionEncoding;

/// Merged temporal/height/width grid counts handed to the position tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionGrid {
    pub t: usize,
    pub h: usize,
    pub w: usize,
}

impl VisionGrid {
    pub fn new(t: usize, h: usize, w: usize) -> Self {
        Self { t, h, w }
    }

    pub fn cells(&self) -> usize {
        self.t * self.h * self.w
    }
}

/// Running 3-axis position table for one prompt compilation.
///
/// The tracker is threaded by value through the compiler and read once when the prefill
/// inputs are built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MropePositions {
    axes: [Vec<i64>; 3],
    current: i64,
}

impl MropePositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `n` text positions `(c, c, c)`, `(c+1, c+1, c+1)`, ...
    pub fn push_text(mut self, n: usize) -> Self {
        for offset in 0..n as i64 {
            self.push(self.current + offset, self.current + offset, self.current + offset);
        }
        self.current += n as i64;
        self
    }

    /// Appends a vision block: a start boundary, one coordinate per grid cell in
    /// `t`, `h`, `w` order and an end boundary one past the largest interior coordinate.
    pub fn push_vision(mut self, grid: VisionGrid) -> Self {
        let start = self.current;
        self.push(start, start, start);
        let base = start + 1;
        let mut max_interior = start;
        for t in 0..grid.t as i64 {
            for h in 0..grid.h as i64 {
                for w in 0..grid.w as i64 {
                    self.push(base + t, base + h, base + w);
                    max_interior = max_interior.max(base + t).max(base + h).max(base + w);
                }
            }
        }
        let end = max_interior + 1;
        self.push(end, end, end);
        self.current = end + 1;
        self
    }

    /// One past the largest coordinate assigned on any axis.
    pub fn current_index(&self) -> i64 {
        self.current
    }

    pub fn len(&self) -> usize {
        self.axes[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes[0].is_empty()
    }

    /// Coordinate triple of the token at `index`.
    pub fn get(&self, index: usize) -> Option<[i64; 3]> {
        Some([
            *self.axes[0].get(index)?,
            *self.axes[1].get(index)?,
            *self.axes[2].get(index)?,
        ])
    }

    /// Prefill position ids, every value shifted by the already consumed sequence length.
    pub fn into_position_ids(self, encoding: PositionEncoding, offset: usize) -> PositionIds {
        let offset = offset as i64;
        let [t, h, w] = self.axes;
        let shift = |axis: Vec<i64>| axis.into_iter().map(|v| v + offset).collect::<Vec<_>>();
        match encoding {
            PositionEncoding::Sequential => PositionIds::Sequential(shift(t)),
            PositionEncoding::Mrope => PositionIds::Mrope([shift(t), shift(h), shift(w)]),
        }
    }

    fn push(&mut self, t: i64, h: i64, w: i64) {
        self.axes[0].push(t);
        self.axes[1].push(h);
        self.axes[2].push(w);
    }
}

/// Decoder position ids for one forward step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionIds {
    /// `[seq]`
    Sequential(Vec<i64>),
    /// `[3, seq]`
    Mrope([Vec<i64>; 3]),
}

impl PositionIds {
    /// Positions for `seq_len` tokens after `all_seq_len` already processed ones. Every
    /// axis carries the absolute sequence index.
    pub fn decode_step(encoding: PositionEncoding, all_seq_len: usize, seq_len: usize) -> Self {
        let axis: Vec<i64> = (all_seq_len..all_seq_len + seq_len)
            .map(|v| v as i64)
            .collect();
        match encoding {
            PositionEncoding::Sequential => PositionIds::Sequential(axis),
            PositionEncoding::Mrope => PositionIds::Mrope([axis.clone(), axis.clone(), axis]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PositionIds::Sequential(axis) => axis.len(),
            PositionIds::Mrope(axes) => axes[0].len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialises the ids as an `i64` tensor of shape `[seq]` or `[3, seq]`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        match self {
            PositionIds::Sequential(axis) => {
                Tensor::from_vec(axis.clone(), axis.len(), device)
                    .context("failed to build position id tensor")
            }
            PositionIds::Mrope(axes) => {
                let seq = axes[0].len();
                let mut data = Vec::with_capacity(3 * seq);
                for axis in axes {
                    data.extend_from_slice(axis);
                }
                Tensor::from_vec(data, (3, seq), device)
                    .context("failed to build mrope position tensor")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_positions_are_diagonal() {
        let tracker = MropePositions::new().push_text(4);
        assert_eq!(tracker.len(), 4);
        for i in 0..4 {
            assert_eq!(tracker.get(i), Some([i as i64; 3]));
        }
        assert_eq!(tracker.current_index(), 4);
    }

    #[test]
    fn vision_block_after_text() {
        let tracker = MropePositions::new()
            .push_text(3)
            .push_vision(VisionGrid::new(1, 2, 2));
        assert_eq!(tracker.len(), 3 + 1 + 4 + 1);
        assert_eq!(tracker.get(3), Some([3, 3, 3]));
        assert_eq!(tracker.get(4), Some([4, 4, 4]));
        assert_eq!(tracker.get(5), Some([4, 4, 5]));
        assert_eq!(tracker.get(6), Some([4, 5, 4]));
        assert_eq!(tracker.get(7), Some([4, 5, 5]));
        assert_eq!(tracker.get(8), Some([6, 6, 6]));
        assert_eq!(tracker.current_index(), 7);

        let tracker = tracker.push_text(1);
        assert_eq!(tracker.get(9), Some([7, 7, 7]));
    }

    #[test]
    fn tall_grid_advances_past_height_axis() {
        let tracker = MropePositions::new().push_vision(VisionGrid::new(1, 3, 1));
        // interior h runs 1..=3, so the end boundary lands on 4
        assert_eq!(tracker.get(4), Some([4, 4, 4]));
        assert_eq!(tracker.current_index(), 5);
    }

    #[test]
    fn prefill_ids_apply_offset_per_encoding() {
        let tracker = MropePositions::new()
            .push_text(1)
            .push_vision(VisionGrid::new(1, 1, 2));
        let seq = tracker.clone().into_position_ids(PositionEncoding::Sequential, 10);
        assert_eq!(seq, PositionIds::Sequential(vec![10, 11, 12, 12, 14]));

        let mrope = tracker.into_position_ids(PositionEncoding::Mrope, 0);
        let PositionIds::Mrope(axes) = mrope else {
            panic!("expected mrope ids");
        };
        assert_eq!(axes[0], vec![0, 1, 2, 2, 4]);
        assert_eq!(axes[1], vec![0, 1, 2, 2, 4]);
        assert_eq!(axes[2], vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn decode_step_uses_running_length() -> Result<()> {
        let ids = PositionIds::decode_step(PositionEncoding::Mrope, 7, 2);
        assert_eq!(ids, PositionIds::Mrope([vec![7, 8], vec![7, 8], vec![7, 8]]));
        let tensor = ids.to_tensor(&Device::Cpu)?;
        assert_eq!(tensor.dims(), &[3, 2]);
        let tensor = PositionIds::decode_step(PositionEncoding::Sequential, 3, 1)
            .to_tensor(&Device::Cpu)?;
        assert_eq!(tensor.to_vec1::<i64>()?, vec![3]);
        Ok(())
    }
}
