//! Checkpoint loading.
//!
//! Two serialization formats are supported and chosen purely by file
//! extension: `.safetensors` files are memory-mapped and copied into the
//! model's parameters one tensor at a time; anything else is treated as a
//! PyTorch pickle which is deserialized into a state dictionary first.
//!
//! Loading always finishes by folding weight normalization and switching the
//! model into evaluation mode.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::models::{StateDict, SynthesisModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Loaded in place from a memory map
    Safetensors,
    /// PyTorch pickle, deserialized then applied
    StateDict,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => Self::Safetensors,
            _ => Self::StateDict,
        }
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safetensors => write!(f, "safetensors"),
            Self::StateDict => write!(f, "state dict"),
        }
    }
}

/// Deserialize a PyTorch checkpoint into named tensors.
pub fn read_state_dict(path: &Path) -> Result<StateDict> {
    candle_core::pickle::read_all(path)
        .with_context(|| format!("Failed to read state dict from {}", path.display()))
}

/// Populate `model` from `path`, then finalize it for inference.
pub fn load_checkpoint<M: SynthesisModel + ?Sized>(model: &mut M, path: &Path) -> Result<()> {
    let format = CheckpointFormat::from_path(path);
    info!(path = %path.display(), %format, "Loading checkpoint");

    let loaded = match format {
        CheckpointFormat::Safetensors => model.load_safetensors(path),
        CheckpointFormat::StateDict => {
            let state_dict = read_state_dict(path)?;
            model.load_state_dict(state_dict)
        }
    };
    loaded.with_context(|| format!("Failed to load {format} checkpoint {}", path.display()))?;

    model
        .remove_weight_norm()
        .context("Failed to remove weight normalization")?;
    model.eval();
    Ok(())
}
