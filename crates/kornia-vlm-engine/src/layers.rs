use candle_core::{DType, Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, Module};
use serde::Deserialize;

use crate::error::VlmError;
use crate::weights::WeightInjector;

/// Nonlinearities found in the supported checkpoints, named as in their `hidden_act` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Activation {
    #[serde(rename = "gelu_pytorch_tanh", alias = "gelu_new")]
    GeluPytorchTanh,
    #[serde(rename = "gelu")]
    Gelu,
    #[serde(rename = "quick_gelu")]
    QuickGelu,
    #[serde(rename = "silu")]
    Silu,
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::GeluPytorchTanh => x.gelu(),
            Activation::Gelu => x.gelu_erf(),
            // x * sigmoid(1.702 * x)
            Activation::QuickGelu => x * candle_nn::ops::sigmoid(&(x * 1.702)?)?,
            Activation::Silu => x.silu(),
        }
    }
}

/// RMS normalization computed in f32 regardless of the parameter dtype.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        let variance = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt_var = (1.0 / (variance + self.eps)?.sqrt()?)?;
        let x_normed = x_f32.broadcast_mul(&rsqrt_var)?;

        self.weight.broadcast_mul(&x_normed.to_dtype(input_dtype)?)
    }
}

/// Either normalization flavour, chosen per architecture.
#[derive(Clone, Debug)]
pub enum Norm {
    Layer(LayerNorm),
    Rms(RmsNorm),
}

impl Norm {
    pub fn layer(
        w: &mut WeightInjector,
        prefix: &str,
        dim: usize,
        eps: f64,
    ) -> std::result::Result<Self, VlmError> {
        Ok(Norm::Layer(LayerNorm::new(
            w.take(&format!("{prefix}.weight"), dim)?,
            w.take(&format!("{prefix}.bias"), dim)?,
            eps,
        )))
    }

    pub fn rms(
        w: &mut WeightInjector,
        prefix: &str,
        dim: usize,
        eps: f64,
    ) -> std::result::Result<Self, VlmError> {
        Ok(Norm::Rms(RmsNorm::new(
            w.take(&format!("{prefix}.weight"), dim)?,
            eps,
        )))
    }
}

impl Module for Norm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Norm::Layer(norm) => norm.forward(x),
            Norm::Rms(norm) => norm.forward(x),
        }
    }
}

/// Take a `(out, in)` projection and its optional bias from the injector.
pub fn linear(
    w: &mut WeightInjector,
    prefix: &str,
    in_dim: usize,
    out_dim: usize,
    bias: bool,
) -> std::result::Result<Linear, VlmError> {
    let weight = w.take(&format!("{prefix}.weight"), (out_dim, in_dim))?;
    let bias = if bias {
        Some(w.take(&format!("{prefix}.bias"), out_dim)?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Feed-forward block.
///
/// The gated form computes `down(act(gate(x)) * up(x))`, the plain form `fc2(act(fc1(x)))`.
#[derive(Clone, Debug)]
pub enum FeedForward {
    Gated {
        gate_proj: Linear,
        up_proj: Linear,
        down_proj: Linear,
        act: Activation,
    },
    Plain {
        fc1: Linear,
        fc2: Linear,
        act: Activation,
    },
}

impl FeedForward {
    pub fn gated(
        w: &mut WeightInjector,
        prefix: &str,
        hidden: usize,
        intermediate: usize,
        act: Activation,
        bias: bool,
    ) -> std::result::Result<Self, VlmError> {
        Ok(FeedForward::Gated {
            gate_proj: linear(w, &format!("{prefix}.gate_proj"), hidden, intermediate, bias)?,
            up_proj: linear(w, &format!("{prefix}.up_proj"), hidden, intermediate, bias)?,
            down_proj: linear(w, &format!("{prefix}.down_proj"), intermediate, hidden, bias)?,
            act,
        })
    }

    pub fn plain(
        w: &mut WeightInjector,
        prefix: &str,
        hidden: usize,
        intermediate: usize,
        act: Activation,
    ) -> std::result::Result<Self, VlmError> {
        Ok(FeedForward::Plain {
            fc1: linear(w, &format!("{prefix}.fc1"), hidden, intermediate, true)?,
            fc2: linear(w, &format!("{prefix}.fc2"), intermediate, hidden, true)?,
            act,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            FeedForward::Gated {
                gate_proj,
                up_proj,
                down_proj,
                act,
            } => {
                let gate = act.forward(&gate_proj.forward(x)?)?;
                let up = up_proj.forward(x)?;
                down_proj.forward(&(gate * up)?)
            }
            FeedForward::Plain { fc1, fc2, act } => fc2.forward(&act.forward(&fc1.forward(x)?)?),
        }
    }
}
