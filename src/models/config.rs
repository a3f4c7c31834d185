//! Model and feature configuration.
//!
//! A configuration file must describe the whole record: fields are not
//! overlaid on top of the built-in defaults. Only `Option` fields (such as
//! `dataset.fmax`) may be left out.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration shared read-only by every pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VoiceConfig {
    /// Feature extraction parameters
    pub dataset: DatasetConfig,
    /// Posterior encoder (features → latent)
    pub posterior: PosteriorConfig,
    /// Waveform generator (latent → audio)
    pub generator: GeneratorConfig,
}

/// Which spectral representation the model consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Linear magnitude spectrogram, `n_fft / 2 + 1` channels
    #[default]
    Linear,
    /// Log-compressed mel spectrogram, `n_mels` channels
    Mel,
}

/// Feature extraction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Sample rate the features are designed for (used for the mel filterbank)
    pub sample_rate: u32,
    /// FFT size
    pub n_fft: usize,
    /// Hop between frames, in samples
    pub hop_length: usize,
    /// Analysis window length (`<= n_fft`)
    pub win_length: usize,
    /// Number of mel bands (only used for [`FeatureKind::Mel`])
    pub n_mels: usize,
    /// Lowest mel filter frequency in Hz
    pub fmin: f32,
    /// Highest mel filter frequency in Hz (defaults to Nyquist)
    #[serde(default)]
    pub fmax: Option<f32>,
    /// Feature representation
    pub feature: FeatureKind,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 1024,
            hop_length: 256,
            win_length: 1024,
            n_mels: 80,
            fmin: 0.0,
            fmax: None,
            feature: FeatureKind::Linear,
        }
    }
}

impl DatasetConfig {
    /// Number of feature channels produced by the extractor.
    pub fn feature_dim(&self) -> usize {
        match self.feature {
            FeatureKind::Linear => self.n_fft / 2 + 1,
            FeatureKind::Mel => self.n_mels,
        }
    }
}

/// WaveNet-style posterior encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorConfig {
    pub hidden_channels: usize,
    pub latent_channels: usize,
    pub kernel_size: usize,
    /// Dilation grows as `dilation_rate^layer`
    pub dilation_rate: usize,
    pub num_layers: usize,
}

impl Default for PosteriorConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 192,
            latent_channels: 192,
            kernel_size: 5,
            dilation_rate: 1,
            num_layers: 16,
        }
    }
}

/// Upsampling waveform generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Channels after the input convolution; halved at every upsampling stage
    pub initial_channels: usize,
    /// Per-stage upsampling factors; their product must equal `dataset.hop_length`
    pub upsample_rates: Vec<usize>,
    /// Kernel size of the dilated convolutions in the residual units
    pub resblock_kernel_size: usize,
    /// One residual unit per dilation, applied after every upsampling stage
    pub resblock_dilations: Vec<usize>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            initial_channels: 512,
            upsample_rates: vec![8, 8, 2, 2],
            resblock_kernel_size: 7,
            resblock_dilations: vec![1, 3, 9],
        }
    }
}

impl GeneratorConfig {
    /// Total upsampling factor (output samples per input frame).
    pub fn upsample_factor(&self) -> usize {
        self.upsample_rates.iter().product()
    }
}

impl VoiceConfig {
    /// Load configuration from a local JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Number of channels the model expects from the feature extractor.
    pub fn feature_dim(&self) -> usize {
        self.dataset.feature_dim()
    }
}

/// Resolve the run configuration.
///
/// Returns the parsed file when `path` names an existing file, otherwise the
/// built-in default. Parse errors are fatal.
pub fn resolve_config(path: Option<&Path>) -> Result<VoiceConfig> {
    match path {
        Some(path) if path.is_file() => {
            let config = VoiceConfig::from_file(path)?;
            tracing::info!("Loaded config from {}", path.display());
            Ok(config)
        }
        Some(path) => {
            tracing::warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            Ok(VoiceConfig::default())
        }
        None => {
            tracing::info!("No config given, using built-in defaults");
            Ok(VoiceConfig::default())
        }
    }
}
