//! Batch analysis-synthesis driver.
//!
//! ```text
//! Init → ConfigReady → ModelReady → CatalogReady → Processing(0..n) → Done
//!                                  any error ↓
//!                                         Failed
//! ```
//!
//! Utterances are processed one at a time in catalog order. The first error
//! aborts the run; files already written stay on disk.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use candle_core::{Device, Tensor};
use tracing::{debug, error, info};

use crate::audio::{AudioBuffer, FeatureExtractor, SpectrogramExtractor, WavEncoding};
use crate::catalog::{Catalog, Utterance};
use crate::checkpoint::load_checkpoint;
use crate::models::{resolve_config, SynthesisInputs, SynthesisModel, VoiceConfig, VoiceModel};

/// Default output directory, relative to the working directory.
pub const DEFAULT_SAVE_PATH: &str = "analysis_synthesis";

/// Inputs of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub checkpoint_path: PathBuf,
    /// Manifest of `<utterance_id> <wav path>` lines
    pub wav_scp: PathBuf,
    /// JSON model config; the built-in default is used when absent or missing
    pub config_path: Option<PathBuf>,
    pub save_path: PathBuf,
    pub device: Device,
    pub encoding: WavEncoding,
}

impl PipelineOptions {
    pub fn new(checkpoint_path: impl Into<PathBuf>, wav_scp: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            wav_scp: wav_scp.into(),
            config_path: None,
            save_path: PathBuf::from(DEFAULT_SAVE_PATH),
            device: Device::Cpu,
            encoding: WavEncoding::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    ConfigReady,
    ModelReady,
    CatalogReady,
    /// Working on the utterance at this catalog position
    Processing(usize),
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::ConfigReady => write!(f, "config-ready"),
            Self::ModelReady => write!(f, "model-ready"),
            Self::CatalogReady => write!(f, "catalog-ready"),
            Self::Processing(index) => write!(f, "processing #{index}"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Progress notifications passed to the `run` callback.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ModelLoaded,
    CatalogLoaded { utterances: usize },
    UtteranceDone {
        index: usize,
        id: String,
        path: PathBuf,
    },
}

pub struct Pipeline {
    options: PipelineOptions,
    stage: Stage,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the whole batch, returning the written files in catalog order.
    ///
    /// A pipeline runs at most once; on error it ends in [`Stage::Failed`].
    pub fn run<F>(&mut self, mut on_event: F) -> Result<Vec<PathBuf>>
    where
        F: FnMut(&PipelineEvent),
    {
        ensure!(
            self.stage == Stage::Init,
            "pipeline already ran (stage: {})",
            self.stage
        );

        match self.execute(&mut on_event) {
            Ok(outputs) => {
                self.advance(Stage::Done);
                Ok(outputs)
            }
            Err(err) => {
                let stage = self.stage;
                self.stage = Stage::Failed;
                error!(%stage, "Pipeline failed: {err:#}");
                Err(err.context(format!("analysis-synthesis failed at stage {stage}")))
            }
        }
    }

    fn execute<F>(&mut self, on_event: &mut F) -> Result<Vec<PathBuf>>
    where
        F: FnMut(&PipelineEvent),
    {
        let config = resolve_config(self.options.config_path.as_deref())?;
        self.advance(Stage::ConfigReady);

        let model = load_model(&config, &self.options.checkpoint_path, &self.options.device)?;
        self.advance(Stage::ModelReady);
        on_event(&PipelineEvent::ModelLoaded);

        let catalog = Catalog::from_file(&self.options.wav_scp)?;
        self.advance(Stage::CatalogReady);
        on_event(&PipelineEvent::CatalogLoaded {
            utterances: catalog.len(),
        });

        let save_dir = self.options.save_path.clone();
        fs::create_dir_all(&save_dir).with_context(|| {
            format!("Failed to create output directory {}", save_dir.display())
        })?;

        let extractor = SpectrogramExtractor;
        let mut outputs = Vec::with_capacity(catalog.len());
        for (index, utterance) in catalog.iter().enumerate() {
            self.stage = Stage::Processing(index);
            let path = synthesize_utterance(
                &model,
                &extractor,
                &config,
                &utterance,
                &save_dir,
                self.options.encoding,
            )?;
            on_event(&PipelineEvent::UtteranceDone {
                index,
                id: utterance.id,
                path: path.clone(),
            });
            outputs.push(path);
        }

        Ok(outputs)
    }

    fn advance(&mut self, stage: Stage) {
        info!(from = %self.stage, to = %stage, "Pipeline stage");
        self.stage = stage;
    }
}

/// Build a [`VoiceModel`] for `config` and load `checkpoint_path` into it.
///
/// The returned model is finalized and in evaluation mode.
pub fn load_model(config: &VoiceConfig, checkpoint_path: &Path, device: &Device) -> Result<VoiceModel> {
    let mut model = VoiceModel::new(config, device)?;
    load_checkpoint(&mut model, checkpoint_path)?;
    info!("model loaded");
    Ok(model)
}

/// Resynthesize one utterance and write `<save_dir>/<id>.wav`.
///
/// The output keeps the source file's sample rate.
pub fn synthesize_utterance<M, E>(
    model: &M,
    extractor: &E,
    config: &VoiceConfig,
    utterance: &Utterance,
    save_dir: &Path,
    encoding: WavEncoding,
) -> Result<PathBuf>
where
    M: SynthesisModel + ?Sized,
    E: FeatureExtractor + ?Sized,
{
    let _span = tracing::debug_span!("utterance", id = %utterance.id).entered();

    let audio = AudioBuffer::load(&utterance.path).with_context(|| {
        format!(
            "Failed to load utterance `{}` from {}",
            utterance.id,
            utterance.path.display()
        )
    })?;
    let waveform = audio.to_waveform(&Device::Cpu)?;

    let target_feats = extractor
        .extract(&waveform, &config.dataset)
        .with_context(|| format!("Failed to extract features for `{}`", utterance.id))?;
    let frames = target_feats.dim(2)?;
    let target_feats_len = Tensor::new(&[frames as u32], target_feats.device())?;
    debug!(samples = audio.len(), frames, "Extracted features");

    let output = model
        .analysis_synthesis(&SynthesisInputs {
            target_feats,
            target_feats_len,
        })
        .with_context(|| format!("Failed to resynthesize `{}`", utterance.id))?;

    let predicted = output.predicted_audio.get(0)?;
    let resynthesized = AudioBuffer::from_tensor(&predicted, audio.sample_rate)?;

    let path = save_dir.join(format!("{}.wav", utterance.id));
    resynthesized.save(&path, encoding)?;
    debug!(
        path = %path.display(),
        duration = resynthesized.duration(),
        "Wrote utterance"
    );
    Ok(path)
}
