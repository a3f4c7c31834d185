//! SnakeBeta activation: `x + 1/β · sin²(α · x)`
//!
//! `alpha` and `beta` are stored in log scale (α = exp(alpha), β = exp(beta)),
//! as in BigVGAN checkpoints. See "Neural Networks Fail to Learn Periodic
//! Functions and How to Fix It" (<https://arxiv.org/abs/2006.08195>).

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

const EPSILON: f64 = 1e-9;

pub struct SnakeBeta {
    /// Log-scale frequency, `[channels]`
    alpha: Tensor,
    /// Log-scale magnitude, `[channels]`
    beta: Tensor,
    /// `(exp(alpha), 1 / (exp(beta) + eps))` as `[1, channels, 1]`, computed by [`Self::freeze`]
    frozen: Option<(Tensor, Tensor)>,
}

impl SnakeBeta {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let alpha = vb.get_with_hints(channels, "alpha", Init::Const(0.0))?;
        let beta = vb.get_with_hints(channels, "beta", Init::Const(0.0))?;
        Ok(Self::from_weights(alpha, beta))
    }

    pub fn from_weights(alpha: Tensor, beta: Tensor) -> Self {
        Self {
            alpha,
            beta,
            frozen: None,
        }
    }

    fn coefficients(&self) -> Result<(Tensor, Tensor)> {
        let alpha = self.alpha.reshape((1, (), 1))?.exp()?;
        let inv_beta = (self.beta.reshape((1, (), 1))?.exp()? + EPSILON)?.recip()?;
        Ok((alpha, inv_beta))
    }

    /// Precompute the exponentiated coefficients, detached from the parameter store.
    pub fn freeze(&mut self) -> Result<()> {
        let (alpha, inv_beta) = self.coefficients()?;
        self.frozen = Some((alpha.detach(), inv_beta.detach()));
        Ok(())
    }

    /// Input/output `[batch, channels, T]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (alpha, inv_beta) = match &self.frozen {
            Some((alpha, inv_beta)) => (alpha.clone(), inv_beta.clone()),
            None => self.coefficients()?,
        };
        let periodic = x.broadcast_mul(&alpha)?.sin()?.sqr()?;
        Ok((x + periodic.broadcast_mul(&inv_beta)?)?)
    }
}
