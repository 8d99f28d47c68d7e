use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{rotary_emb::rope, Embedding, Linear, Module};
use candle_transformers::utils::repeat_kv;

use crate::config::TextConfig;
use crate::error::VlmError;
use crate::kv_cache::KvCache;
use crate::layers::{linear, Activation, FeedForward, RmsNorm};
use crate::rotary::{PositionIds, RotaryEmbedding};
use crate::weights::WeightInjector;

/// Naming and layout details that differ between language stacks sharing this code.
#[derive(Debug, Clone)]
pub struct TextStackOptions {
    /// Parameter prefix of the decoder, e.g. `model.text_model`.
    pub prefix: String,
    pub qkv_bias: bool,
    pub mrope_section: Option<Vec<usize>>,
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(
        w: &mut WeightInjector,
        prefix: &str,
        cfg: &TextConfig,
        qkv_bias: bool,
    ) -> std::result::Result<Self, VlmError> {
        let (hidden, hd) = (cfg.hidden_size, cfg.head_dim);
        let q_dim = cfg.num_attention_heads * hd;
        let kv_dim = cfg.num_key_value_heads * hd;
        Ok(Self {
            q_proj: linear(w, &format!("{prefix}.q_proj"), hidden, q_dim, qkv_bias)?,
            k_proj: linear(w, &format!("{prefix}.k_proj"), hidden, kv_dim, qkv_bias)?,
            v_proj: linear(w, &format!("{prefix}.v_proj"), hidden, kv_dim, qkv_bias)?,
            o_proj: linear(w, &format!("{prefix}.o_proj"), q_dim, hidden, false)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim: hd,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        layer: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let (seq_len, _hidden) = x.dims2()?;
        let heads = |t: Tensor, n: usize| -> Result<Tensor> {
            t.reshape((1, seq_len, n, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let q = heads(self.q_proj.forward(x)?, self.num_heads)?;
        let k = heads(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = heads(self.v_proj.forward(x)?, self.num_kv_heads)?;

        let q = rope(&q, cos, sin)?;
        let k = rope(&k, cos, sin)?;

        // new tokens always extend the cached sequence
        let (k, v) = cache.append(layer, &k, &v)?;
        let total_len = k.dim(2)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = if seq_len == 1 {
                att
            } else {
                let mask = causal_mask(seq_len, total_len, x.device())?;
                att.broadcast_add(&mask)?
            };
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.to_dtype(in_dtype)?
        };

        let y = y
            .transpose(1, 2)?
            .reshape((seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&y)
    }
}

/// Additive mask for `seq_len` new queries whose keys end the `total_len` cached range.
fn causal_mask(seq_len: usize, total_len: usize, device: &Device) -> Result<Tensor> {
    let offset = total_len - seq_len;
    let mask: Vec<f32> = (offset..total_len)
        .flat_map(|i| (0..total_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, total_len), device)
}

struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: FeedForward,
}

impl DecoderLayer {
    fn load(
        w: &mut WeightInjector,
        prefix: &str,
        cfg: &TextConfig,
        qkv_bias: bool,
    ) -> std::result::Result<Self, VlmError> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            input_layernorm: RmsNorm::new(
                w.take(&format!("{prefix}.input_layernorm.weight"), hidden)?,
                cfg.rms_norm_eps,
            ),
            self_attn: Attention::load(w, &format!("{prefix}.self_attn"), cfg, qkv_bias)?,
            post_attention_layernorm: RmsNorm::new(
                w.take(&format!("{prefix}.post_attention_layernorm.weight"), hidden)?,
                cfg.rms_norm_eps,
            ),
            mlp: FeedForward::gated(
                w,
                &format!("{prefix}.mlp"),
                hidden,
                cfg.intermediate_size,
                Activation::Silu,
                false,
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        layer: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = (residual + self.self_attn.forward(&x, cos, sin, layer, cache)?)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        residual + self.mlp.forward(&h)?
    }
}

/// Decoder-only language stack with grouped-query attention and a KV cache per session.
pub struct LanguageModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    dtype: DType,
}

impl LanguageModel {
    pub fn load(
        cfg: &TextConfig,
        opts: &TextStackOptions,
        w: &mut WeightInjector,
        device: &Device,
    ) -> std::result::Result<Self, VlmError> {
        let prefix = &opts.prefix;
        let vocab_shape = (cfg.vocab_size, cfg.hidden_size);
        let embed_name = format!("{prefix}.embed_tokens.weight");

        // tied heads reuse the embedding matrix
        let lm_head = if cfg.tie_word_embeddings {
            w.share(&embed_name, vocab_shape)?
        } else {
            w.take("lm_head.weight", vocab_shape)?
        };
        let embed = w.take(&embed_name, vocab_shape)?;
        let dtype = embed.dtype();

        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::load(w, &format!("{prefix}.layers.{i}"), cfg, opts.qkv_bias))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            embed_tokens: Embedding::new(embed, cfg.hidden_size),
            layers,
            norm: RmsNorm::new(
                w.take(&format!("{prefix}.norm.weight"), cfg.hidden_size)?,
                cfg.rms_norm_eps,
            ),
            lm_head: Linear::new(lm_head, None),
            rotary: RotaryEmbedding::new(
                cfg.head_dim,
                cfg.rope_theta,
                opts.mrope_section.clone(),
                device,
            )?,
            dtype,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Token embeddings of shape `(seq, hidden)`.
    pub fn embed(&self, ids: &[u32], device: &Device) -> Result<Tensor> {
        let ids = Tensor::new(ids, device)?;
        self.embed_tokens.forward(&ids)
    }

    /// Run `embeds` (`(seq, hidden)`) through the stack and return f32 logits of the
    /// last position.
    pub fn forward(
        &self,
        embeds: &Tensor,
        positions: &PositionIds,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let (seq_len, _hidden) = embeds.dims2()?;
        let (cos, sin) = self.rotary.cos_sin(positions, self.dtype)?;

        let mut x = embeds.to_dtype(self.dtype)?;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, &cos, &sin, i, cache)?;
        }
        cache.commit(seq_len);

        let last = x.narrow(0, seq_len - 1, 1)?;
        let logits = self.lm_head.forward(&self.norm.forward(&last)?)?;
        logits.squeeze(0)?.to_dtype(DType::F32)
    }
}
