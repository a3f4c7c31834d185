//! Audio processing for the analysis-synthesis pipeline
//!
//! This module provides:
//! - WAV decoding/encoding with mono mixdown
//! - Linear and mel spectrogram feature extraction

pub mod features;
mod io;

pub use features::{FeatureExtractor, Spectrogram, SpectrogramExtractor};
pub use io::{load_wav, save_wav, AudioBuffer, WavEncoding};
