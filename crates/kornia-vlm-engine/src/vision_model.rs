use candle_core::{DType, Result, Tensor};
use candle_nn::{rotary_emb::rope, Conv2d, Conv2dConfig, Linear, Module};

use crate::config::VisionConfig;
use crate::error::VlmError;
use crate::layers::{linear, FeedForward, Norm};
use crate::weights::WeightInjector;

/// Bidirectional multi-head attention used by the vision towers.
pub struct VisionAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    /// `out_name` is the output projection's name under `prefix`.
    pub fn load(
        w: &mut WeightInjector,
        prefix: &str,
        hidden: usize,
        num_heads: usize,
        out_name: &str,
    ) -> std::result::Result<Self, VlmError> {
        Ok(Self {
            q_proj: linear(w, &format!("{prefix}.q_proj"), hidden, hidden, true)?,
            k_proj: linear(w, &format!("{prefix}.k_proj"), hidden, hidden, true)?,
            v_proj: linear(w, &format!("{prefix}.v_proj"), hidden, hidden, true)?,
            out_proj: linear(w, &format!("{prefix}.{out_name}"), hidden, hidden, true)?,
            num_heads,
            head_dim: hidden / num_heads,
        })
    }

    /// Attend over `x` of shape `(batch, seq, hidden)`.
    ///
    /// `rotary` holds `(cos, sin)` tables of shape `(seq, head_dim / 2)`. `mask` is an
    /// additive `(seq, seq)` mask restricting which patches see each other.
    pub fn forward(
        &self,
        x: &Tensor,
        rotary: Option<(&Tensor, &Tensor)>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, seq_len, hidden) = x.dims3()?;
        let heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let mut q = heads(self.q_proj.forward(x)?)?;
        let mut k = heads(self.k_proj.forward(x)?)?;
        let v = heads(self.v_proj.forward(x)?)?;

        if let Some((cos, sin)) = rotary {
            q = rope(&q, cos, sin)?;
            k = rope(&k, cos, sin)?;
        }

        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;

        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = match mask {
            Some(mask) => att.broadcast_add(mask)?,
            None => att,
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att.matmul(&v)?.to_dtype(in_dtype)?;

        let y = y.transpose(1, 2)?.reshape((batch, seq_len, hidden))?;
        self.out_proj.forward(&y)
    }
}

struct EncoderLayer {
    layer_norm1: Norm,
    self_attn: VisionAttention,
    layer_norm2: Norm,
    mlp: FeedForward,
}

impl EncoderLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let h = self.layer_norm1.forward(x)?;
        let x = (residual + self.self_attn.forward(&h, None, None)?)?;

        let residual = &x;
        let h = self.layer_norm2.forward(&x)?;
        residual + self.mlp.forward(&h)?
    }
}

/// SigLIP vision encoder over fixed-size square views.
pub struct SiglipVisionTower {
    patch_embedding: Conv2d,
    position_embedding: Tensor,
    layers: Vec<EncoderLayer>,
    post_layernorm: Norm,
    num_channels: usize,
    image_size: usize,
}

impl SiglipVisionTower {
    pub fn load(
        cfg: &VisionConfig,
        prefix: &str,
        w: &mut WeightInjector,
    ) -> std::result::Result<Self, VlmError> {
        let e = cfg.hidden_size;
        let p = cfg.patch_size;
        let side = cfg.image_size / p;

        let patch_embedding = Conv2d::new(
            w.take(
                &format!("{prefix}.embeddings.patch_embedding.weight"),
                (e, cfg.num_channels, p, p),
            )?,
            Some(w.take(&format!("{prefix}.embeddings.patch_embedding.bias"), e)?),
            Conv2dConfig {
                stride: p,
                ..Default::default()
            },
        );
        let position_embedding = w.take(
            &format!("{prefix}.embeddings.position_embedding.weight"),
            (side * side, e),
        )?;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            let lp = format!("{prefix}.encoder.layers.{i}");
            layers.push(EncoderLayer {
                layer_norm1: Norm::layer(w, &format!("{lp}.layer_norm1"), e, cfg.layer_norm_eps)?,
                self_attn: VisionAttention::load(
                    w,
                    &format!("{lp}.self_attn"),
                    e,
                    cfg.num_attention_heads,
                    "out_proj",
                )?,
                layer_norm2: Norm::layer(w, &format!("{lp}.layer_norm2"), e, cfg.layer_norm_eps)?,
                mlp: FeedForward::plain(
                    w,
                    &format!("{lp}.mlp"),
                    e,
                    cfg.intermediate_size,
                    cfg.hidden_act,
                )?,
            });
        }

        Ok(Self {
            patch_embedding,
            position_embedding,
            layers,
            post_layernorm: Norm::layer(
                w,
                &format!("{prefix}.post_layernorm"),
                e,
                cfg.layer_norm_eps,
            )?,
            num_channels: cfg.num_channels,
            image_size: cfg.image_size,
        })
    }

    /// Encode `(views, channels, size, size)` pixels into `(views, patches, hidden)`.
    pub fn forward(&self, pixels: &Tensor) -> Result<Tensor> {
        let (_views, c, h, w) = pixels.dims4()?;
        if c != self.num_channels || h != self.image_size || w != self.image_size {
            candle_core::bail!(
                "vision tower expects ({}, {}, {}) views, got ({c}, {h}, {w})",
                self.num_channels,
                self.image_size,
                self.image_size
            );
        }

        let pixels = pixels.to_dtype(self.position_embedding.dtype())?;
        // B,E,H/P,W/P => B,P,E
        let x = self
            .patch_embedding
            .forward(&pixels)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let mut x = x.broadcast_add(&self.position_embedding)?;

        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        self.post_layernorm.forward(&x)
    }
}
