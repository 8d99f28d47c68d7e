//! Rotary position encoding and the policies that assign rotary indices to fused
//! text/visual sequences.

use candle_core::{DType, Device, Result, Tensor};

use crate::error::VlmError;

/// Rotary indices for a run of tokens, one row per axis.
///
/// Sequential models use a single axis. Multimodal models use three axes
/// (temporal, height, width).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionIds {
    axes: Vec<Vec<u32>>,
}

impl PositionIds {
    pub fn sequential(start: u32, len: usize) -> Self {
        Self::uniform(1, start, len)
    }

    /// Every axis carries `start..start + len`.
    pub fn uniform(num_axes: usize, start: u32, len: usize) -> Self {
        let row: Vec<u32> = (start..start + len as u32).collect();
        Self {
            axes: vec![row; num_axes.max(1)],
        }
    }

    /// Build from explicit rows, which must all have the same length.
    pub fn from_axes(axes: Vec<Vec<u32>>) -> Option<Self> {
        let len = axes.first()?.len();
        axes.iter().all(|a| a.len() == len).then_some(Self { axes })
    }

    pub fn len(&self) -> usize {
        self.axes.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_axes(&self) -> usize {
        self.axes.len()
    }

    pub fn axis(&self, i: usize) -> &[u32] {
        &self.axes[i]
    }

    /// Columns `start..start + len` of every axis.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        Self {
            axes: self
                .axes
                .iter()
                .map(|a| a[start..start + len].to_vec())
                .collect(),
        }
    }
}

/// Inverse-frequency table of a rotary embedding, optionally split into per-axis sections.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Tensor,
    sections: Option<Vec<usize>>,
}

impl RotaryEmbedding {
    /// `sections` partitions the `head_dim / 2` rotary frequencies between position axes.
    pub fn new(
        head_dim: usize,
        theta: f64,
        sections: Option<Vec<usize>>,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / (theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let half = inv_freq.len();
        Ok(Self {
            inv_freq: Tensor::from_vec(inv_freq, (1, half), device)?,
            sections,
        })
    }

    /// Rotation angles of shape `(seq, head_dim / 2)` for one row of positions.
    pub fn angles(&self, positions: &[u32]) -> Result<Tensor> {
        let pos: Vec<f32> = positions.iter().map(|&p| p as f32).collect();
        Tensor::from_vec(pos, (positions.len(), 1), self.inv_freq.device())?
            .broadcast_mul(&self.inv_freq)
    }

    /// `(cos, sin)` tables of shape `(seq, head_dim / 2)` for the given positions.
    pub fn cos_sin(&self, positions: &PositionIds, dtype: DType) -> Result<(Tensor, Tensor)> {
        let freqs_for =
            |axis: usize| self.angles(positions.axis(axis.min(positions.num_axes() - 1)));

        let freqs = match &self.sections {
            Some(sections) => {
                let mut parts = Vec::with_capacity(sections.len());
                let mut offset = 0;
                for (axis, &width) in sections.iter().enumerate() {
                    parts.push(freqs_for(axis)?.narrow(1, offset, width)?);
                    offset += width;
                }
                Tensor::cat(&parts, 1)?
            }
            None => freqs_for(0)?,
        };

        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }
}

/// Size of one visual item in patches, before any spatial merge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaGrid {
    pub t: usize,
    pub h: usize,
    pub w: usize,
    /// Wall-clock span of one temporal grid step, zero for still images.
    pub seconds_per_grid: f64,
}

impl MediaGrid {
    pub fn image(h: usize, w: usize) -> Self {
        Self {
            t: 1,
            h,
            w,
            seconds_per_grid: 0.0,
        }
    }
}

/// How prompt positions are numbered when visual placeholders are interleaved with text.
#[derive(Debug, Clone, PartialEq)]
pub enum RopeIndexing {
    /// Every token, textual or visual, advances a single position counter.
    Sequential,
    /// Text tokens share one index on all three axes. A visual block starting at `base`
    /// gets `(base + t, base + row, base + col)` over its merged grid, and text resumes
    /// at one past the largest index used by the block.
    Multimodal {
        spatial_merge: usize,
        /// Scales the temporal index by wall-clock time when set.
        tokens_per_second: Option<f64>,
    },
}

impl RopeIndexing {
    pub fn num_axes(&self) -> usize {
        match self {
            RopeIndexing::Sequential => 1,
            RopeIndexing::Multimodal { .. } => 3,
        }
    }

    /// Number of placeholder tokens a visual item of `grid` occupies under this policy.
    pub fn tokens_for(&self, grid: &MediaGrid) -> usize {
        match self {
            RopeIndexing::Sequential => grid.t * grid.h * grid.w,
            RopeIndexing::Multimodal { spatial_merge, .. } => {
                let m = (*spatial_merge).max(1);
                grid.t * (grid.h / m) * (grid.w / m)
            }
        }
    }

    /// Positions of a prompt whose first token sits at `start`, plus the position the
    /// next decoded token takes.
    pub fn prompt_positions(
        &self,
        token_ids: &[u32],
        placeholder_ids: &[u32],
        grids: &[MediaGrid],
        start: u32,
    ) -> std::result::Result<(PositionIds, u32), VlmError> {
        match self {
            RopeIndexing::Sequential => Ok((
                PositionIds::sequential(start, token_ids.len()),
                start + token_ids.len() as u32,
            )),
            RopeIndexing::Multimodal {
                spatial_merge,
                tokens_per_second,
            } => multimodal_positions(
                token_ids,
                placeholder_ids,
                grids,
                start,
                (*spatial_merge).max(1),
                *tokens_per_second,
            ),
        }
    }

    pub fn decode_positions(&self, position: u32) -> PositionIds {
        PositionIds::uniform(self.num_axes(), position, 1)
    }
}

fn multimodal_positions(
    token_ids: &[u32],
    placeholder_ids: &[u32],
    grids: &[MediaGrid],
    start: u32,
    merge: usize,
    tokens_per_second: Option<f64>,
) -> std::result::Result<(PositionIds, u32), VlmError> {
    let is_placeholder = |id: &u32| placeholder_ids.contains(id);
    let mismatch = || VlmError::VisualTokenCountMismatch {
        placeholders: token_ids.iter().filter(|id| is_placeholder(id)).count(),
        features: grids
            .iter()
            .map(|g| g.t * (g.h / merge) * (g.w / merge))
            .sum(),
    };

    let n = token_ids.len();
    let mut axes = vec![Vec::with_capacity(n); 3];
    let mut next = start;
    let mut grids = grids.iter();
    let mut i = 0;

    while i < n {
        if !is_placeholder(&token_ids[i]) {
            for axis in axes.iter_mut() {
                axis.push(next);
            }
            next += 1;
            i += 1;
            continue;
        }

        let grid = grids.next().ok_or_else(mismatch)?;
        let (gh, gw) = (grid.h / merge, grid.w / merge);
        let count = grid.t * gh * gw;
        if i + count > n || !token_ids[i..i + count].iter().all(is_placeholder) {
            return Err(mismatch());
        }

        let base = next;
        let mut largest = base;
        for tt in 0..grid.t {
            let t_idx = match tokens_per_second {
                Some(tps) => (tt as f64 * grid.seconds_per_grid * tps) as u32,
                None => tt as u32,
            };
            for hh in 0..gh as u32 {
                for ww in 0..gw as u32 {
                    axes[0].push(base + t_idx);
                    axes[1].push(base + hh);
                    axes[2].push(base + ww);
                    largest = largest.max(base + t_idx.max(hh).max(ww));
                }
            }
        }
        next = largest + 1;
        i += count;
    }

    if grids.next().is_some() {
        return Err(mismatch());
    }
    Ok((PositionIds { axes }, next))
}
