//! Voice model used for analysis-synthesis
//!
//! This module contains:
//! - `config`: Model and feature configuration
//! - `layers`: Weight-normalized convolutions and masking helpers
//! - `snake`: SnakeBeta periodic activation
//! - `posterior`: WaveNet posterior encoder (features → latent)
//! - `generator`: Upsampling waveform generator (latent → audio)
//! - `voice`: [`VoiceModel`], the two halves wired together behind [`SynthesisModel`]

pub mod config;
pub mod generator;
pub mod layers;
pub mod posterior;
pub mod snake;
pub mod voice;

use std::path::Path;

use anyhow::Result;
use candle_core::Tensor;

pub use config::{
    resolve_config, DatasetConfig, FeatureKind, GeneratorConfig, PosteriorConfig, VoiceConfig,
};
pub use generator::Generator;
pub use posterior::PosteriorEncoder;
pub use voice::VoiceModel;

/// Named tensors deserialized from a checkpoint.
pub type StateDict = Vec<(String, Tensor)>;

/// Batch handed to [`SynthesisModel::analysis_synthesis`].
#[derive(Debug, Clone)]
pub struct SynthesisInputs {
    /// `[B, feature_dim, frames]`
    pub target_feats: Tensor,
    /// `[B]` valid frame counts (u32), on the same device as `target_feats`
    pub target_feats_len: Tensor,
}

#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    /// `[B, 1, samples]`
    pub predicted_audio: Tensor,
}

/// Capabilities the pipeline needs from a model.
///
/// Loading mutates parameters in place; once [`remove_weight_norm`] has run
/// the parameters are frozen and further loads or finalization fail.
///
/// [`remove_weight_norm`]: SynthesisModel::remove_weight_norm
pub trait SynthesisModel {
    /// Assign parameters from a memory-mapped safetensors file.
    fn load_safetensors(&mut self, path: &Path) -> Result<()>;

    /// Assign parameters from an already deserialized state dictionary.
    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()>;

    /// Fold weight normalization into plain kernels and freeze parameters.
    fn remove_weight_norm(&mut self) -> Result<()>;

    /// Switch to evaluation mode (deterministic posterior).
    fn eval(&mut self);

    /// Encode features to latents and decode them straight back to audio.
    fn analysis_synthesis(&self, inputs: &SynthesisInputs) -> Result<SynthesisOutput>;
}
