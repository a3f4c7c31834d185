//! Posterior encoder: spectrogram features → latent sequence
//!
//! ```text
//! feats [B, F, T] → pre (1x1) → WaveNet stack → proj (1x1) → (mean, log_std)
//! z = (mean + ε · exp(log_std)) · mask      while training
//! z = mean · mask                           in evaluation mode
//! ```

use anyhow::{ensure, Result};
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, Conv1d, Conv1dConfig, VarBuilder};

use super::config::PosteriorConfig;
use super::layers::{detach_conv1d, sequence_mask, WeightNormConv1d};

/// Stack of gated dilated convolutions with residual and skip outputs.
pub struct WaveNet {
    in_layers: Vec<WeightNormConv1d>,
    res_skip_layers: Vec<WeightNormConv1d>,
    hidden_channels: usize,
}

impl WaveNet {
    pub fn new(config: &PosteriorConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_channels;
        let max_dilation = u32::try_from(config.num_layers.saturating_sub(1))
            .ok()
            .and_then(|exp| config.dilation_rate.checked_pow(exp));
        ensure!(
            max_dilation.is_some(),
            "dilation_rate {} overflows over {} layers",
            config.dilation_rate,
            config.num_layers
        );

        let mut in_layers = Vec::with_capacity(config.num_layers);
        let mut res_skip_layers = Vec::with_capacity(config.num_layers);

        for i in 0..config.num_layers {
            let dilation = config.dilation_rate.pow(i as u32);
            in_layers.push(WeightNormConv1d::new(
                hidden,
                2 * hidden,
                config.kernel_size,
                dilation,
                vb.pp(format!("in_layers.{i}")),
            )?);

            // The last layer only feeds the skip path
            let res_skip_channels = if i + 1 < config.num_layers {
                2 * hidden
            } else {
                hidden
            };
            res_skip_layers.push(WeightNormConv1d::new(
                hidden,
                res_skip_channels,
                1,
                1,
                vb.pp(format!("res_skip_layers.{i}")),
            )?);
        }

        Ok(Self {
            in_layers,
            res_skip_layers,
            hidden_channels: hidden,
        })
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        for layer in self.in_layers.iter_mut().chain(self.res_skip_layers.iter_mut()) {
            layer.remove_weight_norm()?;
        }
        Ok(())
    }

    /// `x [B, H, T]`, `mask [B, 1, T]` → skip sum `[B, H, T]`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let h = self.hidden_channels;
        let last = self.in_layers.len().saturating_sub(1);
        let mut x = x.clone();
        let mut output = x.zeros_like()?;

        for (i, (in_layer, res_skip)) in self
            .in_layers
            .iter()
            .zip(&self.res_skip_layers)
            .enumerate()
        {
            let x_in = in_layer.forward(&x)?;
            let acts = (x_in.narrow(1, 0, h)?.tanh()?
                * candle_nn::ops::sigmoid(&x_in.narrow(1, h, h)?)?)?;
            let res_skip_acts = res_skip.forward(&acts)?;

            if i < last {
                x = (x + res_skip_acts.narrow(1, 0, h)?)?.broadcast_mul(mask)?;
                output = (output + res_skip_acts.narrow(1, h, h)?)?;
            } else {
                output = (output + res_skip_acts)?;
            }
        }

        Ok(output.broadcast_mul(mask)?)
    }
}

pub struct PosteriorEncoder {
    pre: Conv1d,
    enc: WaveNet,
    proj: Conv1d,
    latent_channels: usize,
}

impl PosteriorEncoder {
    pub fn new(in_channels: usize, config: &PosteriorConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(config.num_layers > 0, "posterior encoder needs at least one layer");
        ensure!(
            config.kernel_size % 2 == 1,
            "posterior kernel_size must be odd, got {}",
            config.kernel_size
        );
        ensure!(config.dilation_rate > 0, "dilation_rate must be positive");

        let pointwise = Conv1dConfig::default();
        let pre = conv1d(in_channels, config.hidden_channels, 1, pointwise, vb.pp("pre"))?;
        let enc = WaveNet::new(config, vb.pp("enc"))?;
        let proj = conv1d(
            config.hidden_channels,
            2 * config.latent_channels,
            1,
            pointwise,
            vb.pp("proj"),
        )?;

        Ok(Self {
            pre,
            enc,
            proj,
            latent_channels: config.latent_channels,
        })
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.pre = detach_conv1d(&self.pre);
        self.enc.remove_weight_norm()?;
        self.proj = detach_conv1d(&self.proj);
        Ok(())
    }

    /// Encode `feats [B, F, T]` with valid lengths `[B]`.
    ///
    /// Returns `(z [B, latent, T], mask [B, 1, T])`. With `sample == false`
    /// the posterior mean is returned.
    pub fn forward(&self, feats: &Tensor, lengths: &Tensor, sample: bool) -> Result<(Tensor, Tensor)> {
        let mask = sequence_mask(lengths, feats.dim(2)?, feats.dtype())?;

        let x = self.pre.forward(feats)?.broadcast_mul(&mask)?;
        let x = self.enc.forward(&x, &mask)?;
        let stats = self.proj.forward(&x)?.broadcast_mul(&mask)?;

        let mean = stats.narrow(1, 0, self.latent_channels)?;
        let z = if sample {
            let log_std = stats.narrow(1, self.latent_channels, self.latent_channels)?;
            let noise = mean.randn_like(0.0, 1.0)?;
            (mean + noise * log_std.exp()?)?
        } else {
            mean
        };

        Ok((z.broadcast_mul(&mask)?, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> PosteriorConfig {
        PosteriorConfig {
            hidden_channels: 8,
            latent_channels: 4,
            kernel_size: 5,
            dilation_rate: 2,
            num_layers: 3,
        }
    }

    fn build(varmap: &VarMap) -> PosteriorEncoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        PosteriorEncoder::new(6, &tiny_config(), vb.pp("enc_q")).unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let encoder = build(&varmap);

        let feats = Tensor::randn(0.0f32, 1.0, (2, 6, 12), &device).unwrap();
        let lengths = Tensor::new(&[12u32, 7], &device).unwrap();
        let (z, mask) = encoder.forward(&feats, &lengths, false).unwrap();
        assert_eq!(z.dims(), &[2, 4, 12]);
        assert_eq!(mask.dims(), &[2, 1, 12]);
    }

    #[test]
    fn test_padding_is_masked() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let encoder = build(&varmap);

        let feats = Tensor::randn(0.0f32, 1.0, (1, 6, 10), &device).unwrap();
        let lengths = Tensor::new(&[6u32], &device).unwrap();
        let (z, _) = encoder.forward(&feats, &lengths, true).unwrap();

        let tail: f32 = z
            .narrow(2, 6, 4)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn test_mean_is_deterministic() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let encoder = build(&varmap);

        let feats = Tensor::randn(0.0f32, 1.0, (1, 6, 9), &device).unwrap();
        let lengths = Tensor::new(&[9u32], &device).unwrap();
        let (a, _) = encoder.forward(&feats, &lengths, false).unwrap();
        let (b, _) = encoder.forward(&feats, &lengths, false).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dilation_overflow_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = PosteriorConfig {
            dilation_rate: 2,
            num_layers: 80,
            ..tiny_config()
        };
        let err = PosteriorEncoder::new(6, &config, vb).err().unwrap();
        assert!(err.to_string().contains("overflows"));
        assert!(varmap.all_vars().len() <= 2);
    }

    #[test]
    fn test_parameter_names() {
        let varmap = VarMap::new();
        build(&varmap);
        let data = varmap.data().lock().unwrap();
        for name in [
            "enc_q.pre.weight",
            "enc_q.enc.in_layers.0.weight_g",
            "enc_q.enc.in_layers.2.weight_v",
            "enc_q.enc.res_skip_layers.2.bias",
            "enc_q.proj.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        // last res/skip layer only has the skip half
        assert_eq!(data["enc_q.enc.res_skip_layers.2.weight_v"].dims(), &[8, 8, 1]);
        assert_eq!(data["enc_q.enc.res_skip_layers.0.weight_v"].dims(), &[16, 8, 1]);
    }
}
