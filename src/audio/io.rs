//! WAV decoding and encoding.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Sample encoding used when writing WAV files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WavEncoding {
    /// IEEE 32-bit float samples, written unclamped.
    #[default]
    Float32,
    /// Signed 16-bit PCM, clamped to \[-1.0, 1.0\] before scaling.
    Pcm16,
}

impl fmt::Display for WavEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => write!(f, "float32"),
            Self::Pcm16 => write!(f, "pcm16"),
        }
    }
}

impl FromStr for WavEncoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "float32" | "f32" | "float" => Ok(Self::Float32),
            "pcm16" | "s16" | "i16" => Ok(Self::Pcm16),
            other => anyhow::bail!("unknown WAV encoding '{other}'. Supported: float32, pcm16"),
        }
    }
}

/// Mono waveform plus the sample rate it was recorded at.
///
/// Samples are 32-bit floats, nominally in \[-1.0, 1.0\].
///
/// ```rust,ignore
/// let audio = AudioBuffer::load("input.wav")?;
/// let waveform = audio.to_waveform(&device)?; // [1, samples]
/// ```
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Build from a tensor of any shape; all elements are taken in row-major order.
    pub fn from_tensor(tensor: &Tensor, sample_rate: u32) -> Result<Self> {
        let samples: Vec<f32> = tensor
            .flatten_all()?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?;
        Ok(Self::new(samples, sample_rate))
    }

    /// Waveform tensor of shape `[1, samples]` (one channel).
    pub fn to_waveform(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            self.samples.as_slice(),
            (1, self.samples.len()),
            device,
        )?)
    }

    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, encoding: WavEncoding) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate, encoding)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_wav(path)
    }
}

/// Decode a WAV file, averaging channels down to mono.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to decode WAV file: {}", path.display()))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to decode WAV file: {}", path.display()))?
        }
    };

    let mono = if channels > 1 {
        samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    Ok(AudioBuffer::new(mono, spec.sample_rate))
}

/// Write mono samples to a WAV file.
pub fn save_wav<P: AsRef<Path>>(
    path: P,
    samples: &[f32],
    sample_rate: u32,
    encoding: WavEncoding,
) -> Result<()> {
    let path = path.as_ref();
    let spec = match encoding {
        WavEncoding::Float32 => WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
        WavEncoding::Pcm16 => WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;

    match encoding {
        WavEncoding::Float32 => {
            for &sample in samples {
                writer.write_sample(sample)?;
            }
        }
        WavEncoding::Pcm16 => {
            for &sample in samples {
                writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
            }
        }
    }

    writer
        .finalize()
        .with_context(|| format!("Failed to finalize WAV file: {}", path.display()))?;
    Ok(())
}
