use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use slidecast_core::{
    estimate_reading_seconds, ArtifactSink, DirectorySink, FrameStatus, MusicConfig, NoVoiceInput,
    PipelineConfig, SessionController, SlideDeck, VoiceInput, WavMonitor, WavVoiceInput,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> slidecast_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record(args) => run_record(args).await,
        Commands::Preview(args) => run_preview(args).await,
    }
}

async fn run_record(args: RecordArgs) -> slidecast_core::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let script = std::fs::read_to_string(&args.script)?;
    let deck = SlideDeck::from_script(&script);
    let duration = args.duration.unwrap_or_else(|| estimate_reading_seconds(&script));
    let music = MusicConfig {
        enabled: !args.no_music,
        bpm: args.bpm,
        volume: args.volume,
    };
    tracing::info!(script = ?args.script, slides = deck.len(), duration, "recording");

    let voice: Arc<dyn VoiceInput> = match args.voice {
        Some(path) => Arc::new(WavVoiceInput::new(path)),
        None => Arc::new(NoVoiceInput),
    };
    let mut controller = SessionController::new(config, deck, duration, music)?.with_voice_input(voice);
    let progress = tokio::spawn(report_slides(controller.subscribe_frames()));

    controller.start_recording()?;
    let outcome = tokio::select! {
        outcome = controller.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; finalizing what was captured");
            controller.stop().await
        }
    };
    progress.abort();
    outcome?;

    let Some(artifact) = controller.take_artifact() else {
        return Err(slidecast_core::SlidecastError::msg("recording finished without an artifact"));
    };
    let mut sink = DirectorySink::new(&args.out_dir);
    sink.deliver(&artifact)?;
    println!(
        "{} ({} bytes)",
        sink.video_path(&artifact.mime_type).display(),
        artifact.video.len()
    );
    Ok(())
}

async fn run_preview(args: PreviewArgs) -> slidecast_core::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let script = std::fs::read_to_string(&args.script)?;
    let deck = SlideDeck::from_script(&script);
    let duration = estimate_reading_seconds(&script);
    let sample_rate = config.audio.sample_rate;

    let mut controller = SessionController::new(config, deck, duration, MusicConfig::default())?;
    if let Some(path) = &args.monitor {
        controller = controller.with_preview_monitor(Box::new(WavMonitor::create(path, sample_rate)?));
    }
    #[cfg(feature = "speaker")]
    if args.speaker {
        let speaker = slidecast_core::SpeakerMonitor::open(sample_rate)?;
        controller = controller.with_preview_monitor(Box::new(speaker));
    }
    let progress = tokio::spawn(report_slides(controller.subscribe_frames()));

    controller.start_preview()?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(args.seconds.max(0.0))) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
    controller.stop().await?;
    progress.abort();
    Ok(())
}

/// Prints a line whenever the visible slide changes.
async fn report_slides(mut frames: watch::Receiver<Option<FrameStatus>>) {
    let mut shown = None;
    while frames.changed().await.is_ok() {
        let Some(status) = *frames.borrow_and_update() else {
            continue;
        };
        if shown != Some(status.slide_index) {
            shown = Some(status.slide_index);
            println!("[{:>6.2}s] slide {}", status.elapsed_seconds, status.slide_index + 1);
        }
    }
}

fn load_config(path: Option<&Path>) -> slidecast_core::Result<PipelineConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            PipelineConfig::from_json_file(path)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Turn a script into a slide video with a music bed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record the script into a video and thumbnail.
    Record(RecordArgs),
    /// Play the slides and music without recording.
    Preview(PreviewArgs),
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Script text; non-blank lines are grouped into slides.
    script: PathBuf,
    /// Target length in seconds. Defaults to an estimate of the reading time.
    #[arg(short, long)]
    duration: Option<f64>,
    #[arg(long, default_value_t = 92.0)]
    bpm: f64,
    #[arg(long, default_value_t = 0.15)]
    volume: f32,
    /// Record without the music bed.
    #[arg(long)]
    no_music: bool,
    /// WAV file mixed in as the voice track.
    #[arg(long)]
    voice: Option<PathBuf>,
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,
    /// JSON pipeline configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    script: PathBuf,
    /// How long to preview for.
    #[arg(short, long, default_value_t = 10.0)]
    seconds: f64,
    /// Write the previewed audio to this WAV file.
    #[arg(short, long)]
    monitor: Option<PathBuf>,
    /// Play the preview through the default speaker instead.
    #[cfg(feature = "speaker")]
    #[arg(long, conflicts_with = "monitor")]
    speaker: bool,
    #[arg(short, long)]
    config: Option<PathBuf>,
}
