//! Weight-normalized convolutions and small tensor helpers.
//!
//! Checkpoints trained with weight normalization store each convolution
//! kernel as a direction `weight_v` and a per-output-channel magnitude
//! `weight_g`, with `weight = weight_g * weight_v / ‖weight_v‖` (norm over all
//! dims except the first). Before folding the kernel is recomputed on every
//! forward pass; [`WeightNormConv1d::remove_weight_norm`] computes it once and
//! detaches it from the parameter store.

use anyhow::{ensure, Result};
use candle_core::{DType, Module, Tensor};
use candle_nn::{
    init, Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, Init, VarBuilder,
};

use crate::error::ModelError;

/// `weight_g * weight_v / ‖weight_v‖`, norm taken over dims 1 and 2.
pub fn fold_weight_norm(weight_g: &Tensor, weight_v: &Tensor) -> Result<Tensor> {
    let norm = weight_v
        .sqr()?
        .sum_keepdim(2)?
        .sum_keepdim(1)?
        .sqrt()?;
    Ok(weight_v.broadcast_mul(&weight_g.broadcast_div(&norm)?)?)
}

/// Copy of a plain convolution whose tensors no longer track the parameter store.
pub fn detach_conv1d(conv: &Conv1d) -> Conv1d {
    Conv1d::new(
        conv.weight().detach(),
        conv.bias().map(Tensor::detach),
        *conv.config(),
    )
}

/// `[B, 1, T]` mask with ones where `t < lengths[b]`.
pub fn sequence_mask(lengths: &Tensor, max_len: usize, dtype: DType) -> Result<Tensor> {
    let positions = Tensor::arange(0u32, max_len as u32, lengths.device())?.unsqueeze(0)?;
    let lengths = lengths.to_dtype(DType::U32)?.unsqueeze(1)?;
    Ok(positions
        .broadcast_lt(&lengths)?
        .to_dtype(dtype)?
        .unsqueeze(1)?)
}

/// Length-preserving Conv1d with weight normalization.
///
/// Padding is `dilation * (kernel_size - 1) / 2` on both sides, so odd kernels
/// keep the sequence length.
pub struct WeightNormConv1d {
    weight_g: Tensor,
    weight_v: Tensor,
    bias: Tensor,
    config: Conv1dConfig,
    /// Set once weight normalization has been removed
    folded: Option<Conv1d>,
}

impl WeightNormConv1d {
    /// Parameters: `weight_g [out, 1, 1]`, `weight_v [out, in, k]`, `bias [out]`.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight_v = vb.get_with_hints(
            (out_channels, in_channels, kernel_size),
            "weight_v",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_g = vb.get_with_hints((out_channels, 1, 1), "weight_g", Init::Const(1.0))?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;

        let config = Conv1dConfig {
            padding: dilation * (kernel_size - 1) / 2,
            stride: 1,
            dilation,
            groups: 1,
            ..Default::default()
        };

        Ok(Self {
            weight_g,
            weight_v,
            bias,
            config,
            folded: None,
        })
    }

    /// Fold `weight_g`/`weight_v` into a plain kernel. Only allowed once.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        ensure!(self.folded.is_none(), ModelError::AlreadyFinalized);
        let weight = fold_weight_norm(&self.weight_g, &self.weight_v)?.detach();
        self.folded = Some(Conv1d::new(weight, Some(self.bias.detach()), self.config));
        Ok(())
    }

    pub fn is_folded(&self) -> bool {
        self.folded.is_some()
    }

    /// Input `[batch, in, T]`, output `[batch, out, T]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.folded {
            Some(conv) => Ok(conv.forward(x)?),
            None => {
                let weight = fold_weight_norm(&self.weight_g, &self.weight_v)?;
                let conv = Conv1d::new(weight, Some(self.bias.clone()), self.config);
                Ok(conv.forward(x)?)
            }
        }
    }
}

/// Upsampling ConvTranspose1d with weight normalization.
///
/// Kernel size is `2 * stride` and padding `stride / 2`; the output is trimmed
/// to exactly `T * stride` samples.
pub struct WeightNormConvTranspose1d {
    weight_g: Tensor,
    weight_v: Tensor,
    bias: Tensor,
    config: ConvTranspose1dConfig,
    stride: usize,
    folded: Option<ConvTranspose1d>,
}

impl WeightNormConvTranspose1d {
    /// Parameters: `weight_g [in, 1, 1]`, `weight_v [in, out, 2 * stride]`, `bias [out]`.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kernel_size = 2 * stride;
        let weight_v = vb.get_with_hints(
            (in_channels, out_channels, kernel_size),
            "weight_v",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_g = vb.get_with_hints((in_channels, 1, 1), "weight_g", Init::Const(1.0))?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;

        let config = ConvTranspose1dConfig {
            padding: stride / 2,
            output_padding: 0,
            stride,
            dilation: 1,
            groups: 1,
        };

        Ok(Self {
            weight_g,
            weight_v,
            bias,
            config,
            stride,
            folded: None,
        })
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        ensure!(self.folded.is_none(), ModelError::AlreadyFinalized);
        let weight = fold_weight_norm(&self.weight_g, &self.weight_v)?.detach();
        self.folded = Some(ConvTranspose1d::new(
            weight,
            Some(self.bias.detach()),
            self.config,
        ));
        Ok(())
    }

    /// Input `[batch, in, T]`, output `[batch, out, T * stride]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let target_len = x.dim(2)? * self.stride;
        let output = match &self.folded {
            Some(conv) => conv.forward(x)?,
            None => {
                let weight = fold_weight_norm(&self.weight_g, &self.weight_v)?;
                ConvTranspose1d::new(weight, Some(self.bias.clone()), self.config).forward(x)?
            }
        };

        // Odd strides produce one extra sample on the right
        if output.dim(2)? > target_len {
            Ok(output.narrow(2, 0, target_len)?)
        } else {
            Ok(output)
        }
    }
}
