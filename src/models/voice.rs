//! Posterior encoder and generator wired together as one loadable model.
//!
//! Parameter names follow the training checkpoints: `enc_q.*` for the
//! posterior encoder and `dec.*` for the generator. Weight-normalized layers
//! store `weight_g`/`weight_v`; checkpoints exported with the newer
//! parametrization API (`*.parametrizations.weight.original0/1`) are mapped
//! onto the same names.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use super::config::VoiceConfig;
use super::generator::Generator;
use super::posterior::PosteriorEncoder;
use super::{StateDict, SynthesisInputs, SynthesisModel, SynthesisOutput};
use crate::error::ModelError;

pub struct VoiceModel {
    varmap: VarMap,
    posterior: PosteriorEncoder,
    generator: Generator,
    feature_dim: usize,
    device: Device,
    dtype: DType,
    training: bool,
    finalized: bool,
}

impl VoiceModel {
    /// Build a randomly initialized model for `config` on `device`.
    pub fn new(config: &VoiceConfig, device: &Device) -> Result<Self> {
        let hop_length = config.dataset.hop_length;
        let upsample_factor = config.generator.upsample_factor();
        ensure!(
            upsample_factor == hop_length,
            "generator upsamples by {upsample_factor} but features use hop_length {hop_length}"
        );

        let dtype = DType::F32;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let feature_dim = config.feature_dim();
        let posterior = PosteriorEncoder::new(feature_dim, &config.posterior, vb.pp("enc_q"))
            .context("Failed to build posterior encoder")?;
        let generator = Generator::new(
            config.posterior.latent_channels,
            &config.generator,
            vb.pp("dec"),
        )
        .context("Failed to build generator")?;

        let model = Self {
            varmap,
            posterior,
            generator,
            feature_dim,
            device: device.clone(),
            dtype,
            training: true,
            finalized: false,
        };
        info!(
            parameters = model.num_parameters(),
            feature_dim, upsample_factor, "Built voice model"
        );
        Ok(model)
    }

    /// Parameter store backing the model. Saving it produces a loadable checkpoint.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Sorted parameter names the model expects from a checkpoint.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.varmap.data().lock() {
            Ok(vars) => vars.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        names.sort();
        names
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Assign every model parameter from the checkpoint tensors named in
    /// `names`, fetched lazily through `fetch`.
    ///
    /// Nothing is assigned if the checkpoint has unexpected or missing keys.
    fn assign_parameters<F>(&self, names: Vec<String>, mut fetch: F) -> Result<usize>
    where
        F: FnMut(&str) -> Result<Tensor>,
    {
        ensure!(!self.finalized, ModelError::AlreadyFinalized);

        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter store lock poisoned"))?;

        let mut sources: HashMap<String, String> = HashMap::with_capacity(names.len());
        let mut unexpected = Vec::new();
        for name in names {
            let canonical = canonical_name(&name).into_owned();
            if !vars.contains_key(&canonical) || sources.contains_key(&canonical) {
                unexpected.push(name);
            } else {
                sources.insert(canonical, name);
            }
        }
        if !unexpected.is_empty() {
            unexpected.sort();
            bail!(ModelError::UnexpectedParameters(unexpected));
        }

        let mut expected: Vec<&String> = vars.keys().collect();
        expected.sort();
        if let Some(missing) = expected.iter().find(|name| !sources.contains_key(name.as_str())) {
            bail!(ModelError::MissingParameter((*missing).clone()));
        }

        for name in &expected {
            let var = &vars[name.as_str()];
            let source = &sources[name.as_str()];
            let tensor = fetch(source).with_context(|| format!("Failed to read `{source}`"))?;
            if tensor.dims() != var.dims() {
                bail!(ModelError::ShapeMismatch {
                    name: (*name).clone(),
                    expected: var.dims().to_vec(),
                    found: tensor.dims().to_vec(),
                });
            }
            let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&tensor)
                .with_context(|| format!("Failed to assign `{name}`"))?;
        }

        Ok(expected.len())
    }
}

/// Map parametrization-style weight-norm keys onto `weight_g`/`weight_v`.
fn canonical_name(name: &str) -> Cow<'_, str> {
    const MAGNITUDE: &str = ".parametrizations.weight.original0";
    const DIRECTION: &str = ".parametrizations.weight.original1";

    if let Some(prefix) = name.strip_suffix(MAGNITUDE) {
        Cow::Owned(format!("{prefix}.weight_g"))
    } else if let Some(prefix) = name.strip_suffix(DIRECTION) {
        Cow::Owned(format!("{prefix}.weight_v"))
    } else {
        Cow::Borrowed(name)
    }
}

impl SynthesisModel for VoiceModel {
    fn load_safetensors(&mut self, path: &Path) -> Result<()> {
        // SAFETY: the file is only read, and stays mapped while tensors are copied out
        let tensors = unsafe { MmapedSafetensors::new(path) }
            .with_context(|| format!("Failed to map safetensors file {}", path.display()))?;
        let names: Vec<String> = tensors.tensors().into_iter().map(|(name, _)| name).collect();

        let device = self.device.clone();
        let count = self.assign_parameters(names, |name| Ok(tensors.load(name, &device)?))?;
        debug!(count, path = %path.display(), "Assigned parameters from safetensors");
        Ok(())
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()> {
        let names = state_dict.iter().map(|(name, _)| name.clone()).collect();
        let mut tensors: HashMap<String, Tensor> = state_dict.into_iter().collect();

        let count = self.assign_parameters(names, |name| {
            tensors
                .remove(name)
                .ok_or_else(|| anyhow!("tensor `{name}` listed twice in state dict"))
        })?;
        debug!(count, "Assigned parameters from state dict");
        Ok(())
    }

    fn remove_weight_norm(&mut self) -> Result<()> {
        ensure!(!self.finalized, ModelError::AlreadyFinalized);
        self.posterior.remove_weight_norm()?;
        self.generator.remove_weight_norm()?;
        self.finalized = true;
        debug!("Removed weight normalization");
        Ok(())
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn analysis_synthesis(&self, inputs: &SynthesisInputs) -> Result<SynthesisOutput> {
        let feats = inputs
            .target_feats
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let found = feats.dim(1)?;
        ensure!(
            found == self.feature_dim,
            ModelError::FeatureDim {
                expected: self.feature_dim,
                found,
            }
        );
        let lengths = inputs.target_feats_len.to_device(&self.device)?;

        let (z, _mask) = self.posterior.forward(&feats, &lengths, self.training)?;
        let audio = self.generator.forward(&z)?;

        Ok(SynthesisOutput {
            predicted_audio: audio.detach(),
        })
    }
}
