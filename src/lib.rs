//! # voice-resynth
//!
//! Offline analysis-synthesis for a VITS-style voice model: recorded speech is
//! turned into spectrogram features, encoded by the model's posterior encoder
//! and decoded straight back to a waveform by its generator. Comparing the
//! output with the input shows how much the vocoder path alone loses.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use voice_resynth::{auto_device, Pipeline, PipelineEvent, PipelineOptions};
//!
//! let mut options = PipelineOptions::new("checkpoint.safetensors", "wav.scp");
//! options.device = auto_device()?;
//!
//! let written = Pipeline::new(options).run(|event| {
//!     if let PipelineEvent::UtteranceDone { id, .. } = event {
//!         println!("{id} done");
//!     }
//! })?;
//! ```
//!
//! ## Pipeline
//!
//! 1. **Config**: a JSON [`VoiceConfig`] if one is given and exists,
//!    otherwise the built-in default.
//! 2. **Model**: a [`VoiceModel`] is built from the config and populated from
//!    a `.safetensors` file (memory-mapped, in place) or a PyTorch pickle
//!    (any other extension). Weight normalization is then folded away and the
//!    model switched to evaluation mode.
//! 3. **Catalog**: `<utterance_id> <wav path>` lines, iterated in id order.
//! 4. **Synthesis**: for every utterance, linear (or mel) spectrogram →
//!    posterior mean → generator → `<save_path>/<utterance_id>.wav` at the
//!    source sample rate.
//!
//! Any failure aborts the whole batch.
//!
//! ## Traits
//!
//! The pipeline only needs two capabilities, so either half can be swapped:
//! [`SynthesisModel`] (load, finalize, resynthesize) and
//! [`FeatureExtractor`] (waveform → features).

pub mod audio;
pub mod catalog;
pub mod checkpoint;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod profiling;

use anyhow::Result;
use candle_core::Device;

pub use audio::{AudioBuffer, FeatureExtractor, SpectrogramExtractor, WavEncoding};
pub use catalog::{Catalog, Utterance};
pub use checkpoint::{load_checkpoint, CheckpointFormat};
pub use error::{CatalogError, ModelError};
pub use models::{
    resolve_config, SynthesisInputs, SynthesisModel, SynthesisOutput, VoiceConfig, VoiceModel,
};
pub use pipeline::{
    load_model, synthesize_utterance, Pipeline, PipelineEvent, PipelineOptions, Stage,
};

/// Select the best available compute device.
///
/// Checks for available hardware in order: CUDA → Metal → CPU.
///
/// # Feature Flags
///
/// - `cuda`: Enables NVIDIA GPU support
/// - `metal`: Enables Apple Silicon GPU support
pub fn auto_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::cuda_if_available(0) {
            if device.is_cuda() {
                tracing::info!("Using CUDA device");
                return Ok(device);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device");
            return Ok(device);
        }
    }

    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string into a [`Device`].
///
/// Supported formats:
/// - `"auto"`: best available via [`auto_device`]
/// - `"cpu"`
/// - `"cuda"` / `"cuda:N"`
/// - `"metal"`
///
/// # Errors
///
/// Returns an error if the string is unrecognized, the requested backend
/// wasn't compiled in, or hardware initialization fails.
pub fn parse_device(device_str: &str) -> Result<Device> {
    match device_str.to_lowercase().as_str() {
        "auto" => auto_device(),
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            #[cfg(feature = "cuda")]
            {
                let ordinal: usize = match s.strip_prefix("cuda:") {
                    Some(idx) => idx
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid CUDA device index: {e}"))?,
                    None => 0,
                };
                Device::new_cuda(ordinal)
                    .map_err(|e| anyhow::anyhow!("failed to init CUDA device {ordinal}: {e}"))
            }
            #[cfg(not(feature = "cuda"))]
            anyhow::bail!("CUDA support not compiled in (device '{s}'). Rebuild with --features cuda")
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("failed to init Metal device: {e}"))
            }
            #[cfg(not(feature = "metal"))]
            anyhow::bail!("Metal support not compiled in. Rebuild with --features metal")
        }
        other => {
            anyhow::bail!("unknown device '{other}'. Supported: auto, cpu, cuda, cuda:N, metal")
        }
    }
}

/// Human-readable label for a [`Device`].
pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}
