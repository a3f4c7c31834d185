//! Integration tests for voice-resynth
//!
//! These run the whole pipeline on a tiny randomly initialized model saved
//! as a checkpoint, so no real weights are needed.

use std::path::{Path, PathBuf};

use candle_core::Device;
use voice_resynth::models::{DatasetConfig, FeatureKind, GeneratorConfig, PosteriorConfig};
use voice_resynth::{AudioBuffer, VoiceConfig, VoiceModel, WavEncoding};

/// 64-point FFT, hop 16, generator upsampling 4 x 4.
fn tiny_config() -> VoiceConfig {
    VoiceConfig {
        dataset: DatasetConfig {
            sample_rate: 16000,
            n_fft: 64,
            hop_length: 16,
            win_length: 64,
            n_mels: 12,
            fmin: 0.0,
            fmax: None,
            feature: FeatureKind::Linear,
        },
        posterior: PosteriorConfig {
            hidden_channels: 8,
            latent_channels: 4,
            kernel_size: 3,
            dilation_rate: 2,
            num_layers: 2,
        },
        generator: GeneratorConfig {
            initial_channels: 16,
            upsample_rates: vec![4, 4],
            resblock_kernel_size: 3,
            resblock_dilations: vec![1, 3],
        },
    }
}

fn write_config(dir: &Path, config: &VoiceConfig) -> PathBuf {
    let path = dir.join("config.json");
    std::fs::write(&path, serde_json::to_string_pretty(config).unwrap()).unwrap();
    path
}

/// Save a freshly initialized model as a safetensors checkpoint.
fn write_checkpoint(dir: &Path, config: &VoiceConfig) -> PathBuf {
    let path = dir.join("model.safetensors");
    let model = VoiceModel::new(config, &Device::Cpu).unwrap();
    model.varmap().save(&path).unwrap();
    path
}

/// PyTorch zip checkpoint holding weights for [`tiny_config`].
fn state_dict_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/tiny_voice.pt")
}

fn write_tone(path: &Path, sample_rate: u32, samples: usize, freq: f32) {
    let tone: Vec<f32> = (0..samples)
        .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin() * 0.5)
        .collect();
    AudioBuffer::new(tone, sample_rate)
        .save(path, WavEncoding::Pcm16)
        .unwrap();
}

mod pipeline_tests {
    use super::*;
    use voice_resynth::checkpoint::read_state_dict;
    use voice_resynth::{
        CatalogError, ModelError, Pipeline, PipelineEvent, PipelineOptions, Stage, SynthesisModel,
    };

    struct Fixture {
        dir: tempfile::TempDir,
        options: PipelineOptions,
    }

    /// Config, checkpoint, two utterances and a manifest in a scratch dir.
    fn fixture(config: &VoiceConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let config_path = write_config(root, config);
        let checkpoint = write_checkpoint(root, config);
        write_tone(&root.join("b.wav"), 16000, 1600, 220.0);
        write_tone(&root.join("a.wav"), 22050, 960, 440.0);

        let manifest = root.join("wav.scp");
        std::fs::write(
            &manifest,
            format!(
                "utt_b {}\n\nutt_a {} extra-column\n",
                root.join("b.wav").display(),
                root.join("a.wav").display()
            ),
        )
        .unwrap();

        let mut options = PipelineOptions::new(checkpoint, manifest);
        options.config_path = Some(config_path);
        options.save_path = root.join("out");
        Fixture { dir, options }
    }

    #[test]
    fn test_end_to_end() {
        let fixture = fixture(&tiny_config());
        let save_path = fixture.options.save_path.clone();
        let mut pipeline = Pipeline::new(fixture.options.clone());

        let mut events = Vec::new();
        let written = pipeline.run(|event| events.push(event.clone())).unwrap();
        assert_eq!(pipeline.stage(), Stage::Done);

        assert_eq!(
            written,
            vec![save_path.join("utt_a.wav"), save_path.join("utt_b.wav")]
        );
        assert_eq!(events[0], PipelineEvent::ModelLoaded);
        assert_eq!(events[1], PipelineEvent::CatalogLoaded { utterances: 2 });
        assert_eq!(
            events[2],
            PipelineEvent::UtteranceDone {
                index: 0,
                id: "utt_a".to_string(),
                path: save_path.join("utt_a.wav"),
            }
        );
        assert_eq!(events.len(), 4);

        // Source sample rate and length (multiples of the hop) are preserved
        let a = AudioBuffer::load(save_path.join("utt_a.wav")).unwrap();
        assert_eq!(a.sample_rate, 22050);
        assert_eq!(a.len(), 960);
        let b = AudioBuffer::load(save_path.join("utt_b.wav")).unwrap();
        assert_eq!(b.sample_rate, 16000);
        assert_eq!(b.len(), 1600);
        assert!(b.samples.iter().all(|s| s.is_finite() && s.abs() < 1.0));
    }

    #[test]
    fn test_float32_output_by_default() {
        let fixture = fixture(&tiny_config());
        Pipeline::new(fixture.options.clone()).run(|_| {}).unwrap();

        let reader = hound::WavReader::open(fixture.options.save_path.join("utt_a.wav")).unwrap();
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        assert_eq!(reader.spec().bits_per_sample, 32);
        assert_eq!(reader.spec().channels, 1);
    }

    #[test]
    fn test_pcm16_output() {
        let mut fixture = fixture(&tiny_config());
        fixture.options.encoding = WavEncoding::Pcm16;
        Pipeline::new(fixture.options.clone()).run(|_| {}).unwrap();

        let reader = hound::WavReader::open(fixture.options.save_path.join("utt_b.wav")).unwrap();
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Int);
        assert_eq!(reader.spec().bits_per_sample, 16);
    }

    #[test]
    fn test_rerun_reproduces_outputs() {
        let fixture = fixture(&tiny_config());
        let first = fixture.options.save_path.clone();
        let second = fixture.dir.path().join("out_again");

        Pipeline::new(fixture.options.clone()).run(|_| {}).unwrap();
        let mut options = fixture.options.clone();
        options.save_path = second.clone();
        Pipeline::new(options).run(|_| {}).unwrap();

        for name in ["utt_a.wav", "utt_b.wav"] {
            let x = AudioBuffer::load(first.join(name)).unwrap();
            let y = AudioBuffer::load(second.join(name)).unwrap();
            assert_eq!(x.len(), y.len());
            for (p, q) in x.samples.iter().zip(&y.samples) {
                assert!((p - q).abs() < 1e-6, "{name} differs");
            }
        }
    }

    #[test]
    fn test_existing_output_dir_is_reused() {
        let fixture = fixture(&tiny_config());
        std::fs::create_dir_all(&fixture.options.save_path).unwrap();
        std::fs::write(fixture.options.save_path.join("keep.txt"), "x").unwrap();

        Pipeline::new(fixture.options.clone()).run(|_| {}).unwrap();
        assert!(fixture.options.save_path.join("keep.txt").exists());
        assert!(fixture.options.save_path.join("utt_a.wav").exists());
    }

    #[test]
    fn test_mel_features() {
        let mut config = tiny_config();
        config.dataset.feature = FeatureKind::Mel;
        let fixture = fixture(&config);

        let written = Pipeline::new(fixture.options.clone()).run(|_| {}).unwrap();
        assert_eq!(written.len(), 2);
    }

    #[test]
    fn test_malformed_manifest_writes_nothing() {
        let fixture = fixture(&tiny_config());
        std::fs::write(&fixture.options.wav_scp, "utt_a a.wav\nutt_b\n").unwrap();

        let mut pipeline = Pipeline::new(fixture.options.clone());
        let mut events = Vec::new();
        let err = pipeline.run(|event| events.push(event.clone())).unwrap_err();

        assert_eq!(pipeline.stage(), Stage::Failed);
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<CatalogError>(),
            Some(CatalogError::MalformedLine { line: 2, .. })
        )));
        assert_eq!(events, vec![PipelineEvent::ModelLoaded]);
        assert!(!fixture.options.save_path.exists());
    }

    #[test]
    fn test_path_like_id_writes_nothing() {
        let fixture = fixture(&tiny_config());
        let root = fixture.dir.path();
        std::fs::write(
            &fixture.options.wav_scp,
            format!(
                "utt_a {}\n../escaped {}\n",
                root.join("a.wav").display(),
                root.join("b.wav").display()
            ),
        )
        .unwrap();

        let mut pipeline = Pipeline::new(fixture.options.clone());
        let err = pipeline.run(|_| {}).unwrap_err();

        assert_eq!(pipeline.stage(), Stage::Failed);
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<CatalogError>(),
            Some(CatalogError::InvalidId { line: 2, .. })
        )));
        assert!(!fixture.options.save_path.exists());
        assert!(!root.join("escaped.wav").exists());
    }

    #[test]
    fn test_missing_audio_aborts_batch() {
        let fixture = fixture(&tiny_config());
        let root = fixture.dir.path();
        std::fs::write(
            &fixture.options.wav_scp,
            format!(
                "a_ok {}\nb_missing {}\nc_never {}\n",
                root.join("a.wav").display(),
                root.join("missing.wav").display(),
                root.join("b.wav").display()
            ),
        )
        .unwrap();

        let mut pipeline = Pipeline::new(fixture.options.clone());
        let err = pipeline.run(|_| {}).unwrap_err();
        assert_eq!(pipeline.stage(), Stage::Failed);

        let message = format!("{err:#}");
        assert!(message.contains("processing #1"), "{message}");
        assert!(message.contains("`b_missing`"), "{message}");

        // Earlier output stays, later utterances never run
        let out = &fixture.options.save_path;
        assert!(out.join("a_ok.wav").exists());
        assert!(!out.join("b_missing.wav").exists());
        assert!(!out.join("c_never.wav").exists());
    }

    #[test]
    fn test_checkpoint_config_mismatch() {
        let fixture = fixture(&tiny_config());
        let mut wider = tiny_config();
        wider.posterior.hidden_channels = 12;
        write_config(fixture.dir.path(), &wider);

        let err = Pipeline::new(fixture.options.clone())
            .run(|_| {})
            .unwrap_err();
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<ModelError>(),
            Some(ModelError::ShapeMismatch { .. })
        )));
        assert!(!fixture.options.save_path.exists());
    }

    #[test]
    fn test_state_dict_checkpoint_matches_safetensors() {
        let fixture = fixture(&tiny_config());
        let root = fixture.dir.path();

        // Same weights exported as safetensors
        let mut model = VoiceModel::new(&tiny_config(), &Device::Cpu).unwrap();
        model
            .load_state_dict(read_state_dict(&state_dict_fixture()).unwrap())
            .unwrap();
        let exported = root.join("exported.safetensors");
        model.varmap().save(&exported).unwrap();

        let pt_out = root.join("out_pt");
        let mut options = fixture.options.clone();
        options.checkpoint_path = state_dict_fixture();
        options.save_path = pt_out.clone();
        let mut pipeline = Pipeline::new(options);
        let mut events = Vec::new();
        let written = pipeline.run(|event| events.push(event.clone())).unwrap();

        assert_eq!(pipeline.stage(), Stage::Done);
        assert_eq!(written, vec![pt_out.join("utt_a.wav"), pt_out.join("utt_b.wav")]);
        assert_eq!(events[0], PipelineEvent::ModelLoaded);
        assert_eq!(events[1], PipelineEvent::CatalogLoaded { utterances: 2 });
        assert_eq!(events.len(), 4);

        let st_out = root.join("out_st");
        let mut options = fixture.options.clone();
        options.checkpoint_path = exported;
        options.save_path = st_out.clone();
        Pipeline::new(options).run(|_| {}).unwrap();

        for (name, sample_rate, len) in [("utt_a.wav", 22050, 960), ("utt_b.wav", 16000, 1600)] {
            let x = AudioBuffer::load(pt_out.join(name)).unwrap();
            let y = AudioBuffer::load(st_out.join(name)).unwrap();
            assert_eq!(x.sample_rate, sample_rate);
            assert_eq!(x.len(), len);
            assert_eq!(y.len(), len);
            assert!(x.samples.iter().any(|s| *s != 0.0), "{name} is silent");
            for (p, q) in x.samples.iter().zip(&y.samples) {
                assert!((p - q).abs() < 1e-6, "{name} differs");
            }
        }
    }

    #[test]
    fn test_unreadable_state_dict() {
        let fixture = fixture(&tiny_config());
        let bogus = fixture.dir.path().join("model.pt");
        std::fs::write(&bogus, b"not a pickle").unwrap();

        let mut options = fixture.options.clone();
        options.checkpoint_path = bogus;
        let err = Pipeline::new(options).run(|_| {}).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read state dict"));
    }
}

mod config_tests {
    use super::*;
    use voice_resynth::resolve_config;

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let path = write_config(dir.path(), &config);
        assert_eq!(resolve_config(Some(path.as_path())).unwrap(), config);
    }

    #[test]
    fn test_missing_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.json");
        let config = resolve_config(Some(absent.as_path())).unwrap();
        assert_eq!(config, VoiceConfig::default());
    }

    #[test]
    fn test_default_config_builds_model() {
        let config = VoiceConfig::default();
        assert_eq!(config.generator.upsample_factor(), config.dataset.hop_length);
        let model = VoiceModel::new(&config, &Device::Cpu).unwrap();
        assert_eq!(model.feature_dim(), 513);
    }
}

mod checkpoint_tests {
    use super::*;
    use voice_resynth::checkpoint::read_state_dict;
    use voice_resynth::{load_checkpoint, SynthesisModel};

    #[test]
    fn test_state_dict_fixture_covers_model() {
        let state_dict = read_state_dict(&state_dict_fixture()).unwrap();
        let mut names: Vec<String> = state_dict.into_iter().map(|(name, _)| name).collect();
        names.sort();

        let model = VoiceModel::new(&tiny_config(), &Device::Cpu).unwrap();
        assert_eq!(names, model.parameter_names());
    }

    #[test]
    fn test_load_state_dict_checkpoint() {
        let mut model = VoiceModel::new(&tiny_config(), &Device::Cpu).unwrap();
        load_checkpoint(&mut model, &state_dict_fixture()).unwrap();
        assert!(model.is_finalized());
        assert!(!model.is_training());
    }

    #[test]
    fn test_load_checkpoint_finalizes_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let checkpoint = write_checkpoint(dir.path(), &config);

        let mut model = VoiceModel::new(&config, &Device::Cpu).unwrap();
        load_checkpoint(&mut model, &checkpoint).unwrap();
        assert!(model.is_finalized());
        assert!(!model.is_training());

        // Parameters are frozen after finalization
        assert!(model.load_safetensors(&checkpoint).is_err());
    }
}

mod feature_tests {
    use super::*;
    use voice_resynth::{FeatureExtractor, SpectrogramExtractor};

    #[test]
    fn test_extractor_matches_model_input() {
        let config = tiny_config();
        let audio = AudioBuffer::new(vec![0.1f32; 800], 16000);
        let waveform = audio.to_waveform(&Device::Cpu).unwrap();

        let feats = SpectrogramExtractor
            .extract(&waveform, &config.dataset)
            .unwrap();
        assert_eq!(feats.dims(), &[1, config.feature_dim(), 800 / 16]);
    }
}
