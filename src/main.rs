use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use clap::{Parser, Subcommand};
use fx_pipeline::{
    Effect, FeedConfig, FeedTask, FfmpegBackend, FrameFeeder, JobConfig, JobEvent,
    SoftwareEffectEngine, VideoProcessor, surface::Surface,
};
use tokio_util::sync::CancellationToken;

mod config;

use config::Settings;

#[derive(Parser, Debug)]
#[command(name = "fx-transcode", version)]
struct Cli {
    /// JSON file with backend settings.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log pipeline internals at debug level.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcode a video through an effect into an MP4 file.
    Process(ProcessArgs),
    /// Print container, stream and geometry info.
    Probe(ProbeArgs),
    /// Decode a video and feed its frames to the effect engine only.
    Feed(FeedArgs),
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    input: String,

    /// Output MP4 path.
    #[arg(short, long)]
    output: PathBuf,

    /// Effect asset path handed to the engine.
    #[arg(long)]
    effect: String,

    /// Engine slot the effect goes into.
    #[arg(long, default_value = Effect::MASK_SLOT)]
    slot: String,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    input: String,
}

#[derive(Parser, Debug)]
struct FeedArgs {
    input: String,

    #[arg(long)]
    effect: String,

    /// Clockwise rotation applied to every frame.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    rotation: i32,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_next", log::LevelFilter::Warn)
        .filter_module("fx_pipeline", level)
        .filter_module("fx_transcode", level)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    fx_pipeline::init()?;
    let settings = Settings::load(cli.settings.as_deref())?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    match cli.cmd {
        Command::Process(args) => cmd_process(args, &settings, cancel).await,
        Command::Probe(args) => cmd_probe(args),
        Command::Feed(args) => cmd_feed(args, &settings, cancel).await,
    }
}

async fn cmd_process(
    args: ProcessArgs,
    settings: &Settings,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let config = JobConfig::builder()
        .input(args.input)
        .output(args.output)
        .effect(Effect::new(args.slot, args.effect))
        .video_mime(settings.video_mime.clone())
        .build()?;
    let processor = VideoProcessor::new(Arc::new(FfmpegBackend::new(settings.backend())));
    let mut job = processor.process_video(config, Box::new(SoftwareEffectEngine::new()));

    loop {
        tokio::select! {
            event = job.next_event() => match event {
                Some(JobEvent::Progress(p)) => eprint!("\rprogress {:.1}%", p),
                Some(JobEvent::Completed { output }) => eprintln!("\nwrote {}", output.display()),
                None => break,
            },
            _ = cancel.cancelled() => {
                // A running transcode cannot be interrupted cleanly.
                eprintln!("\ninterrupted, output file is incomplete");
                std::process::exit(130);
            },
        }
    }

    let report = job.wait().await?;
    log::info!(
        "{} frames in, {} written, timestamps {}/{}",
        report.frames_in,
        report.frames_written,
        report.timestamps_pushed,
        report.timestamps_popped
    );
    Ok(())
}

fn cmd_probe(args: ProbeArgs) -> anyhow::Result<()> {
    let info = fx_pipeline::probe(&args.input)?;
    print!("{}", info);
    Ok(())
}

async fn cmd_feed(
    args: FeedArgs,
    settings: &Settings,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let rendered = Arc::new(AtomicU64::new(0));
    let seen = rendered.clone();
    let surface = Surface::new(move |frame| {
        let n = seen.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("rendered frame {} {}x{}", n, frame.width, frame.height);
        Ok(())
    });
    let feeder = FrameFeeder::new(
        Arc::new(FfmpegBackend::new(settings.backend())),
        FeedConfig {
            input: args.input,
            effect: Effect::mask(args.effect),
            rotation: args.rotation,
            video_mime: settings.video_mime.clone(),
        },
        Box::new(SoftwareEffectEngine::new()),
        surface,
    );

    let mut task = FeedTask::new();
    task.start(feeder).await;
    let result = tokio::select! {
        result = task.wait() => result,
        _ = cancel.cancelled() => task.stop().await,
    };
    if let Some(result) = result {
        let report = result?;
        eprintln!(
            "fed {} frames, {} rendered{}",
            report.frames,
            rendered.load(Ordering::Relaxed),
            if report.cancelled { " (stopped)" } else { "" }
        );
    }
    Ok(())
}
