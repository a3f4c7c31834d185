//! Resynthesize every utterance in a `wav.scp` manifest through a trained model.
//!
//! Usage:
//!     cargo run --release --bin analysis_synthesis -- model.safetensors data/wav.scp
//!     cargo run --release --bin analysis_synthesis -- model.pt data/wav.scp \
//!         --config config.json --save-path out --encoding pcm16

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use voice_resynth::pipeline::DEFAULT_SAVE_PATH;
use voice_resynth::{
    device_info, parse_device, profiling, Pipeline, PipelineEvent, PipelineOptions, WavEncoding,
};

/// Extract spectrogram features from each utterance and resynthesize them
/// through the model's posterior encoder and generator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model checkpoint (`.safetensors`, or a PyTorch state dict for any other extension)
    checkpoint_path: PathBuf,

    /// Manifest with one `<utterance_id> <wav path>` per line
    wav_scp: PathBuf,

    /// Model config JSON (built-in default when omitted or missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for `<utterance_id>.wav`
    #[arg(short, long, default_value = DEFAULT_SAVE_PATH)]
    save_path: PathBuf,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "auto")]
    device: String,

    /// Output sample encoding (float32, pcm16)
    #[arg(long, default_value_t = WavEncoding::Float32)]
    encoding: WavEncoding,
}

fn main() -> Result<()> {
    let _profiling_guard = profiling::init();
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let args = Args::parse();

    let device = parse_device(&args.device)?;
    println!("Device: {}", device_info(&device));

    let mut options = PipelineOptions::new(args.checkpoint_path, args.wav_scp);
    options.config_path = args.config;
    options.save_path = args.save_path;
    options.device = device;
    options.encoding = args.encoding;

    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} utterances {msg}")?
        .progress_chars("#>-");
    let mut progress: Option<ProgressBar> = None;

    let mut pipeline = Pipeline::new(options);
    let written = pipeline.run(|event| match event {
        PipelineEvent::ModelLoaded => println!("model loaded"),
        PipelineEvent::CatalogLoaded { utterances } => {
            println!("loaded {utterances} utterances");
            let bar = ProgressBar::new(*utterances as u64);
            bar.set_style(style.clone());
            progress = Some(bar);
        }
        PipelineEvent::UtteranceDone { id, .. } => {
            if let Some(bar) = &progress {
                bar.set_message(id.clone());
                bar.inc(1);
            }
        }
    });

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    let written = written?;

    println!(
        "Wrote {} file(s) to {}",
        written.len(),
        pipeline.options().save_path.display()
    );
    Ok(())
}
