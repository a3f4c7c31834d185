//! Spectrogram feature extraction.
//!
//! The STFT follows the usual VITS recipe: reflect-pad by
//! `(n_fft - hop_length) / 2` on both sides, then frame without centering
//! using a periodic Hann window of `win_length` samples centered in the FFT
//! frame. Linear features are magnitudes `sqrt(re² + im² + 1e-6)`; mel features
//! apply a Slaney filterbank to those magnitudes followed by
//! `ln(max(x, 1e-5))`.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::models::config::{DatasetConfig, FeatureKind};

/// Turns a waveform into the feature tensor the model consumes.
///
/// Implementations must be deterministic and free of side effects.
pub trait FeatureExtractor {
    /// `waveform` is `[samples]` or `[1, samples]`; the result is
    /// `[1, feature_dim, frames]` on the waveform's device.
    fn extract(&self, waveform: &Tensor, config: &DatasetConfig) -> Result<Tensor>;
}

/// Default extractor backed by [`Spectrogram`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpectrogramExtractor;

impl FeatureExtractor for SpectrogramExtractor {
    fn extract(&self, waveform: &Tensor, config: &DatasetConfig) -> Result<Tensor> {
        Spectrogram::new(config)?.compute_tensor(waveform)
    }
}

/// STFT-based linear or mel spectrogram.
pub struct Spectrogram {
    n_fft: usize,
    hop_length: usize,
    /// Hann window zero-padded to `n_fft`
    window: Vec<f32>,
    /// `[n_mels][n_fft / 2 + 1]`, present for mel features only
    mel_basis: Option<Vec<Vec<f32>>>,
    fft: Arc<dyn Fft<f32>>,
}

impl Spectrogram {
    pub fn new(config: &DatasetConfig) -> Result<Self> {
        let n_fft = config.n_fft;
        ensure!(n_fft >= 2, "n_fft must be at least 2, got {n_fft}");
        ensure!(
            config.hop_length > 0 && config.hop_length <= n_fft,
            "hop_length must be in 1..={n_fft}, got {}",
            config.hop_length
        );
        ensure!(
            config.win_length > 0 && config.win_length <= n_fft,
            "win_length must be in 1..={n_fft}, got {}",
            config.win_length
        );

        let mel_basis = match config.feature {
            FeatureKind::Linear => None,
            FeatureKind::Mel => {
                let fmax = config.fmax.unwrap_or(config.sample_rate as f32 / 2.0);
                ensure!(
                    config.fmin >= 0.0 && config.fmin < fmax,
                    "invalid mel frequency range {}..{fmax}",
                    config.fmin
                );
                Some(mel_filterbank(
                    config.sample_rate,
                    n_fft,
                    config.n_mels,
                    config.fmin,
                    fmax,
                ))
            }
        };

        let fft = FftPlanner::new().plan_fft_forward(n_fft);

        Ok(Self {
            n_fft,
            hop_length: config.hop_length,
            window: padded_hann_window(config.win_length, n_fft),
            mel_basis,
            fft,
        })
    }

    /// Number of feature channels per frame.
    pub fn feature_dim(&self) -> usize {
        match &self.mel_basis {
            Some(basis) => basis.len(),
            None => self.n_fft / 2 + 1,
        }
    }

    /// Number of frames produced for `num_samples` input samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        let padded = num_samples + 2 * self.pad_length();
        if padded < self.n_fft {
            0
        } else {
            (padded - self.n_fft) / self.hop_length + 1
        }
    }

    fn pad_length(&self) -> usize {
        (self.n_fft - self.hop_length) / 2
    }

    /// Compute features frame by frame, `[frames][feature_dim]`.
    pub fn compute(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        let magnitudes = self.stft_magnitude(samples)?;
        Ok(match &self.mel_basis {
            None => magnitudes,
            Some(basis) => magnitudes
                .iter()
                .map(|frame| {
                    basis
                        .iter()
                        .map(|filter| {
                            let energy: f32 =
                                filter.iter().zip(frame.iter()).map(|(f, m)| f * m).sum();
                            energy.max(1e-5).ln()
                        })
                        .collect()
                })
                .collect(),
        })
    }

    /// Compute features for a waveform tensor, returning `[1, feature_dim, frames]`.
    pub fn compute_tensor(&self, waveform: &Tensor) -> Result<Tensor> {
        let samples: Vec<f32> = waveform.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let frames = self.compute(&samples)?;
        let n_frames = frames.len();
        let dim = self.feature_dim();

        let flat: Vec<f32> = frames.into_iter().flatten().collect();
        let tensor = Tensor::from_vec(flat, (n_frames, dim), waveform.device())?
            .t()?
            .contiguous()?
            .unsqueeze(0)?;

        Ok(tensor)
    }

    fn stft_magnitude(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        let pad = self.pad_length();
        let min_samples = (pad + 1).max(self.n_fft - 2 * pad);
        ensure!(
            samples.len() >= min_samples,
            "utterance too short for feature extraction: {} samples, need at least {min_samples}",
            samples.len()
        );

        let padded = reflect_pad(samples, pad);
        let n_bins = self.n_fft / 2 + 1;
        let n_frames = self.num_frames(samples.len());

        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let mut result = Vec::with_capacity(n_frames);

        for frame in 0..n_frames {
            let start = frame * self.hop_length;
            for (j, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + j] * self.window[j], 0.0);
            }

            self.fft.process(&mut buffer);

            result.push(
                buffer
                    .iter()
                    .take(n_bins)
                    .map(|c| (c.re * c.re + c.im * c.im + 1e-6).sqrt())
                    .collect(),
            );
        }

        Ok(result)
    }
}

/// Mirror `pad` samples onto each end, excluding the edge sample itself.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let len = samples.len();
    let mut padded = Vec::with_capacity(len + 2 * pad);
    padded.extend((1..=pad).rev().map(|i| samples[i]));
    padded.extend_from_slice(samples);
    padded.extend((0..pad).map(|i| samples[len - 2 - i]));
    padded
}

/// Periodic Hann window of `win_length`, centered in a zero frame of `n_fft`.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
    let offset = (n_fft - win_length) / 2;
    let mut window = vec![0.0f32; n_fft];
    for i in 0..win_length {
        window[offset + i] = 0.5 * (1.0 - (2.0 * PI * i as f32 / win_length as f32).cos());
    }
    window
}

/// Hz → mel on the Slaney scale (linear below 1 kHz, logarithmic above).
fn hz_to_mel(f: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_74; // ln(6.4) / 27

    if f < MIN_LOG_HZ {
        f / F_SP
    } else {
        MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

fn mel_to_hz(m: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;
    const LOGSTEP: f32 = 0.068_751_74;

    if m < MIN_LOG_MEL {
        m * F_SP
    } else {
        MIN_LOG_HZ * ((m - MIN_LOG_MEL) * LOGSTEP).exp()
    }
}

/// Triangular mel filters with Slaney area normalization,
/// equivalent to `librosa.filters.mel(..., norm="slaney")`.
fn mel_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_bins = n_fft / 2 + 1;
    let (mel_min, mel_max) = (hz_to_mel(fmin), hz_to_mel(fmax));
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();
    let bin_hz = sample_rate as f32 / n_fft as f32;

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (edges[m], edges[m + 1], edges[m + 2]);
            let enorm = if upper > lower { 2.0 / (upper - lower) } else { 0.0 };
            (0..n_bins)
                .map(|bin| {
                    let freq = bin as f32 * bin_hz;
                    let rising = if center > lower {
                        (freq - lower) / (center - lower)
                    } else {
                        0.0
                    };
                    let falling = if upper > center {
                        (upper - freq) / (upper - center)
                    } else {
                        0.0
                    };
                    rising.min(falling).max(0.0) * enorm
                })
                .collect()
        })
        .collect()
}
