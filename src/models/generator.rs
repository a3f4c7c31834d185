//! BigVGAN-style waveform generator
//!
//! latent `[B, C_latent, T]` → input conv → (SnakeBeta → transposed-conv
//! upsample → residual units) per stage → SnakeBeta → output conv → tanh →
//! audio `[B, 1, T * prod(upsample_rates)]`.

use anyhow::{ensure, Result};
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, VarBuilder};

use super::config::GeneratorConfig;
use super::layers::{detach_conv1d, WeightNormConv1d, WeightNormConvTranspose1d};
use super::snake::SnakeBeta;

/// SnakeBeta → dilated conv → SnakeBeta → 1x1 conv, plus the input.
pub struct ResidualUnit {
    act1: SnakeBeta,
    conv1: WeightNormConv1d,
    act2: SnakeBeta,
    conv2: WeightNormConv1d,
}

impl ResidualUnit {
    pub fn new(channels: usize, kernel_size: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            act1: SnakeBeta::new(channels, vb.pp("act1"))?,
            conv1: WeightNormConv1d::new(channels, channels, kernel_size, dilation, vb.pp("conv1"))?,
            act2: SnakeBeta::new(channels, vb.pp("act2"))?,
            conv2: WeightNormConv1d::new(channels, channels, 1, 1, vb.pp("conv2"))?,
        })
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.act1.freeze()?;
        self.conv1.remove_weight_norm()?;
        self.act2.freeze()?;
        self.conv2.remove_weight_norm()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.act1.forward(x)?;
        let hidden = self.conv1.forward(&hidden)?;
        let hidden = self.act2.forward(&hidden)?;
        let hidden = self.conv2.forward(&hidden)?;
        Ok((hidden + x)?)
    }
}

/// One upsampling stage: activation, transposed conv, then residual units.
pub struct UpsampleBlock {
    act: SnakeBeta,
    upsample: WeightNormConvTranspose1d,
    residuals: Vec<ResidualUnit>,
}

impl UpsampleBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        rate: usize,
        config: &GeneratorConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let act = SnakeBeta::new(in_channels, vb.pp("act"))?;
        let upsample = WeightNormConvTranspose1d::new(in_channels, out_channels, rate, vb.pp("upsample"))?;
        let residuals = config
            .resblock_dilations
            .iter()
            .enumerate()
            .map(|(i, &dilation)| {
                ResidualUnit::new(
                    out_channels,
                    config.resblock_kernel_size,
                    dilation,
                    vb.pp(format!("res.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            act,
            upsample,
            residuals,
        })
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.act.freeze()?;
        self.upsample.remove_weight_norm()?;
        for unit in &mut self.residuals {
            unit.remove_weight_norm()?;
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.act.forward(x)?;
        let mut hidden = self.upsample.forward(&hidden)?;
        for unit in &self.residuals {
            hidden = unit.forward(&hidden)?;
        }
        Ok(hidden)
    }
}

pub struct Generator {
    conv_pre: Conv1d,
    blocks: Vec<UpsampleBlock>,
    act_post: SnakeBeta,
    conv_post: Conv1d,
    upsample_factor: usize,
}

impl Generator {
    pub fn new(latent_channels: usize, config: &GeneratorConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(
            !config.upsample_rates.is_empty(),
            "generator needs at least one upsampling stage"
        );
        ensure!(
            config.resblock_kernel_size % 2 == 1,
            "resblock_kernel_size must be odd, got {}",
            config.resblock_kernel_size
        );
        let stages = config.upsample_rates.len();
        ensure!(
            config.initial_channels >> stages > 0,
            "initial_channels {} too small for {stages} halving stages",
            config.initial_channels
        );

        let same = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };
        let conv_pre = conv1d(latent_channels, config.initial_channels, 7, same, vb.pp("conv_pre"))?;

        let mut blocks = Vec::with_capacity(stages);
        let mut channels = config.initial_channels;
        for (i, &rate) in config.upsample_rates.iter().enumerate() {
            ensure!(rate > 0, "upsample rate must be positive");
            blocks.push(UpsampleBlock::new(
                channels,
                channels / 2,
                rate,
                config,
                vb.pp(format!("blocks.{i}")),
            )?);
            channels /= 2;
        }

        let act_post = SnakeBeta::new(channels, vb.pp("act_post"))?;
        let conv_post = conv1d(channels, 1, 7, same, vb.pp("conv_post"))?;

        Ok(Self {
            conv_pre,
            blocks,
            act_post,
            conv_post,
            upsample_factor: config.upsample_factor(),
        })
    }

    /// Output samples per latent frame.
    pub fn upsample_factor(&self) -> usize {
        self.upsample_factor
    }

    /// Fold every weight-normalized layer and detach the remaining parameters.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.conv_pre = detach_conv1d(&self.conv_pre);
        for block in &mut self.blocks {
            block.remove_weight_norm()?;
        }
        self.act_post.freeze()?;
        self.conv_post = detach_conv1d(&self.conv_post);
        Ok(())
    }

    /// Latent `[B, C, T]` → audio `[B, 1, T * upsample_factor]` in (-1, 1).
    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut hidden = self.conv_pre.forward(z)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden)?;
        }
        let hidden = self.act_post.forward(&hidden)?;
        Ok(self.conv_post.forward(&hidden)?.tanh()?)
    }
}
