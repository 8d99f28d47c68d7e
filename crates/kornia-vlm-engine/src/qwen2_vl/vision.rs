use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Linear, Module};

use crate::config::VisionConfig;
use crate::error::VlmError;
use crate::layers::{linear, Activation, FeedForward, Norm};
use crate::rotary::{MediaGrid, RotaryEmbedding};
use crate::vision_model::VisionAttention;
use crate::weights::WeightInjector;

const NORM_EPS: f64 = 1e-6;

/// Block layout of the vision tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionFlavor {
    /// LayerNorm blocks with a plain MLP, attention within each frame.
    Qwen2,
    /// RMSNorm blocks with a gated MLP and windowed attention outside the full-attention blocks.
    Qwen2_5,
}

struct VisionBlock {
    norm1: Norm,
    attn: VisionAttention,
    norm2: Norm,
    mlp: FeedForward,
}

impl VisionBlock {
    fn load(
        w: &mut WeightInjector,
        prefix: &str,
        cfg: &VisionConfig,
        flavor: VisionFlavor,
    ) -> std::result::Result<Self, VlmError> {
        let e = cfg.hidden_size;
        let norm = |w: &mut WeightInjector, name: &str| match flavor {
            VisionFlavor::Qwen2 => Norm::layer(w, &format!("{prefix}.{name}"), e, NORM_EPS),
            VisionFlavor::Qwen2_5 => Norm::rms(w, &format!("{prefix}.{name}"), e, NORM_EPS),
        };

        let norm1 = norm(w, "norm1")?;
        let attn = VisionAttention::load(
            w,
            &format!("{prefix}.attn"),
            e,
            cfg.num_attention_heads,
            "proj",
        )?;
        let norm2 = norm(w, "norm2")?;
        let mlp = match flavor {
            VisionFlavor::Qwen2 => FeedForward::plain(
                w,
                &format!("{prefix}.mlp"),
                e,
                cfg.intermediate_size,
                cfg.hidden_act,
            )?,
            VisionFlavor::Qwen2_5 => FeedForward::gated(
                w,
                &format!("{prefix}.mlp"),
                e,
                cfg.intermediate_size,
                cfg.hidden_act,
                true,
            )?,
        };
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let h = self.norm1.forward(x)?;
        let x = (x + self.attn.forward(&h, Some((cos, sin)), mask)?)?;
        let h = self.norm2.forward(&x)?;
        &x + self.mlp.forward(&h)?
    }
}

/// Groups of `merge x merge` patches projected to the language width.
struct PatchMerger {
    ln_q: Norm,
    fc1: Linear,
    fc2: Linear,
    merged_dim: usize,
}

impl PatchMerger {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.ln_q.forward(x)?.reshape(((), self.merged_dim))?;
        let x = Activation::Gelu.forward(&self.fc1.forward(&x)?)?;
        self.fc2.forward(&x)
    }
}

/// Vision transformer over flattened spatio-temporal patches of any grid size.
///
/// Patches arrive grouped by merge window: for every frame and every merged cell,
/// the `merge x merge` patches of that cell are consecutive.
pub struct QwenVisionTower {
    patch_embed: Linear,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    rotary: RotaryEmbedding,
    patch_dim: usize,
    merge: usize,
    /// Window edge in merged cells, 0 for unwindowed towers.
    window: usize,
    fullatt_blocks: Vec<usize>,
    dtype: DType,
}

impl QwenVisionTower {
    pub fn load(
        cfg: &VisionConfig,
        flavor: VisionFlavor,
        w: &mut WeightInjector,
        device: &Device,
    ) -> std::result::Result<Self, VlmError> {
        let e = cfg.hidden_size;
        let m = cfg.spatial_merge_size;
        let p = cfg.patch_size;
        let patch_dim = cfg.num_channels * cfg.temporal_patch_size * p * p;

        let patch_embed = w.take("visual.patch_embed.proj.weight", (e, patch_dim))?;
        let dtype = patch_embed.dtype();

        let blocks = (0..cfg.num_hidden_layers)
            .map(|i| VisionBlock::load(w, &format!("visual.blocks.{i}"), cfg, flavor))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let merged_dim = e * m * m;
        let ln_q = match flavor {
            VisionFlavor::Qwen2 => Norm::layer(w, "visual.merger.ln_q", e, NORM_EPS)?,
            VisionFlavor::Qwen2_5 => Norm::rms(w, "visual.merger.ln_q", e, NORM_EPS)?,
        };
        let merger = PatchMerger {
            ln_q,
            fc1: linear(w, "visual.merger.mlp.0", merged_dim, merged_dim, true)?,
            fc2: linear(w, "visual.merger.mlp.2", merged_dim, cfg.out_hidden_size, true)?,
            merged_dim,
        };

        let head_dim = e / cfg.num_attention_heads;
        let window = match flavor {
            VisionFlavor::Qwen2 => 0,
            VisionFlavor::Qwen2_5 => cfg.window_size / m / cfg.patch_size,
        };

        Ok(Self {
            patch_embed: Linear::new(patch_embed, None),
            blocks,
            merger,
            rotary: RotaryEmbedding::new(head_dim / 2, 10_000.0, None, device)?,
            patch_dim,
            merge: m,
            window,
            fullatt_blocks: cfg.fullatt_block_indexes.clone(),
            dtype,
        })
    }

    /// Encode `(t * h * w, patch_dim)` patches of `grid` into
    /// `(t * h/merge * w/merge, out_hidden)` features.
    pub fn forward(&self, pixels: &Tensor, grid: &MediaGrid) -> Result<Tensor> {
        let m = self.merge;
        let (n, dim) = pixels.dims2()?;
        let expected = grid.t * grid.h * grid.w;
        if dim != self.patch_dim || n != expected || grid.h % m != 0 || grid.w % m != 0 {
            candle_core::bail!(
                "vision tower expects {expected} patches of width {} for grid {}x{}x{}, \
                 got ({n}, {dim})",
                self.patch_dim,
                grid.t,
                grid.h,
                grid.w
            );
        }
        let device = pixels.device();
        let cells = patch_cells(grid, m);

        let (cos, sin) = {
            let rows: Vec<u32> = cells.iter().map(|c| c.row).collect();
            let cols: Vec<u32> = cells.iter().map(|c| c.col).collect();
            let freqs = Tensor::cat(&[self.rotary.angles(&rows)?, self.rotary.angles(&cols)?], 1)?;
            (freqs.cos()?.to_dtype(self.dtype)?, freqs.sin()?.to_dtype(self.dtype)?)
        };

        // frame masks only matter for videos, window masks only for windowed towers
        let frame_mask = if grid.t > 1 {
            Some(block_mask(&cells, |c| c.frame, device)?)
        } else {
            None
        };
        let window_mask = if self.window > 0 {
            let window = self.window;
            Some(block_mask(
                &cells,
                |c| (c.frame, c.cell_row / window, c.cell_col / window),
                device,
            )?)
        } else {
            None
        };

        let mut x = self
            .patch_embed
            .forward(&pixels.to_dtype(self.dtype)?)?
            .unsqueeze(0)?;
        for (i, block) in self.blocks.iter().enumerate() {
            let mask = if window_mask.is_some() && !self.fullatt_blocks.contains(&i) {
                window_mask.as_ref()
            } else {
                frame_mask.as_ref()
            };
            x = block.forward(&x, &cos, &sin, mask)?;
        }
        self.merger.forward(&x.squeeze(0)?)
    }
}

/// Where a patch sits in its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PatchCell {
    frame: usize,
    row: u32,
    col: u32,
    cell_row: usize,
    cell_col: usize,
}

/// Coordinates of every patch in merge-window order.
fn patch_cells(grid: &MediaGrid, merge: usize) -> Vec<PatchCell> {
    let (gh, gw) = (grid.h / merge, grid.w / merge);
    let mut cells = Vec::with_capacity(grid.t * grid.h * grid.w);
    for frame in 0..grid.t {
        for cell_row in 0..gh {
            for cell_col in 0..gw {
                for dy in 0..merge {
                    for dx in 0..merge {
                        cells.push(PatchCell {
                            frame,
                            row: (cell_row * merge + dy) as u32,
                            col: (cell_col * merge + dx) as u32,
                            cell_row,
                            cell_col,
                        });
                    }
                }
            }
        }
    }
    cells
}

/// Additive `(n, n)` mask letting patches attend only to patches with the same key.
fn block_mask<K: PartialEq>(
    cells: &[PatchCell],
    key: impl Fn(&PatchCell) -> K,
    device: &Device,
) -> Result<Tensor> {
    let keys: Vec<K> = cells.iter().map(key).collect();
    let n = keys.len();
    let mask: Vec<f32> = keys
        .iter()
        .flat_map(|a| keys.iter().map(move |b| if a == b { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Tensor::from_vec(mask, (n, n), device)
}
