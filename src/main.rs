use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scribe::config::{Backend, Config};
use scribe::history::{HistoryEntry, HistoryLog};
use scribe::pipeline::{Pipeline, PipelineEvent};
use scribe::session::Session;
use scribe::transcribe::{OpenAiTranscriber, TranscriptionCapability};
use scribe::transcript::{ExportFormat, TranscriptDocument, output_base_name};

/// Transcribe long recordings through a speech-to-text API.
#[derive(Parser)]
#[command(name = "scribe", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe an audio file (mp3, m4a, wav).
    Transcribe(TranscribeArgs),
    /// List past transcriptions, newest first.
    History {
        /// Print each transcript, not just its name.
        #[arg(long)]
        show: bool,
    },
    /// Print the effective configuration.
    Settings,
}

#[derive(Args)]
struct TranscribeArgs {
    /// Audio file to transcribe.
    file: PathBuf,

    /// Language hint such as "fr" ("auto" to detect).
    #[arg(long)]
    language: Option<String>,

    /// Model name sent to the API.
    #[arg(long)]
    model: Option<String>,

    /// Largest file sent in one request, in bytes.
    #[arg(long)]
    max_segment_bytes: Option<u64>,

    /// Output formats (comma-separated): txt, json, json-pretty, srt.
    #[arg(long, value_delimiter = ',', default_value = "txt")]
    format: Vec<ExportFormat>,

    /// Segments transcribed at once (1 = strictly in order).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Speech-to-text backend: openai or local.
    #[arg(long)]
    backend: Option<Backend>,

    /// Keep the segment files after transcription.
    #[arg(long)]
    keep_segments: bool,

    /// Do not record this run in the history.
    #[arg(long)]
    no_history: bool,

    /// Directory for transcripts and history.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Invalid configuration")?;

    match cli.command {
        Command::Transcribe(args) => transcribe(config, args).await,
        Command::History { show } => history(&config, show),
        Command::Settings => {
            settings(&config);
            Ok(())
        }
    }
}

async fn transcribe(mut config: Config, args: TranscribeArgs) -> anyhow::Result<()> {
    if let Some(language) = args.language {
        config.language = Some(language).filter(|l| !l.eq_ignore_ascii_case("auto"));
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(max) = args.max_segment_bytes {
        anyhow::ensure!(max > 0, "--max-segment-bytes must be greater than zero");
        config.max_segment_bytes = max;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency.max(1);
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;

    let capability = build_capability(&config).await?;
    let mut pipeline_config = config.pipeline_config();
    pipeline_config.keep_segments = args.keep_segments;
    let pipeline = Pipeline::new(pipeline_config, capability);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling transcription");
                cancel.cancel();
            }
        });
    }

    let mut session = Session::new();
    let asset = pipeline
        .probe(&args.file)
        .await
        .with_context(|| format!("Cannot read {}", args.file.display()))?;
    session.upload(asset)?;
    let asset = session.begin_transcription()?;

    let bar = ProgressBar::new(1);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let outcome = pipeline
        .transcribe_asset(asset, &cancel, |event| match event {
            PipelineEvent::Planned { segments } => {
                bar.set_length(segments as u64);
                bar.set_message("preparing");
            }
            PipelineEvent::Exported { index, total } => {
                bar.set_message(format!("exported segment {}/{}", index + 1, total));
            }
            PipelineEvent::Transcribed(progress) => {
                bar.set_position(progress.completed as u64);
                bar.set_message(format!("transcribed segment {}", progress.index + 1));
            }
        })
        .await;

    let outcome = match outcome {
        Ok(outcome) => {
            bar.finish_and_clear();
            outcome
        }
        Err(e) => {
            bar.abandon();
            session.fail_transcription()?;
            return Err(e).context("Transcription failed");
        }
    };
    session.complete_transcription(outcome.result.clone())?;

    let text = session.begin_export()?;
    let base_name = output_base_name(&outcome.asset.stem(), Local::now());
    let document = TranscriptDocument::new(
        outcome.asset.name(),
        outcome.asset.duration_ms(),
        &outcome.result,
    )
    .with_model(pipeline.model())
    .with_language(config.language.clone())
    .with_text(text.clone());

    let mut text_file = None;
    for format in &args.format {
        let path = document
            .save(&config.output_dir, &base_name, *format)
            .with_context(|| format!("Failed to write {} export", format.extension()))?;
        if *format == ExportFormat::Text {
            text_file = Some(path.clone());
        }
        eprintln!("Saved {}", path.display());
    }
    session.finish_export()?;

    if !args.no_history {
        let mut entry = HistoryEntry::new(outcome.asset.name(), text.clone(), Local::now());
        if let Some(path) = text_file {
            entry = entry.with_text_file(path);
        }
        HistoryLog::new(config.history_path())
            .append(entry)
            .context("Failed to update history")?;
    }

    for path in &outcome.kept_segments {
        info!("Segment kept at {}", path.display());
    }

    println!("{}", text);
    Ok(())
}

async fn build_capability(config: &Config) -> anyhow::Result<Arc<dyn TranscriptionCapability>> {
    match config.backend {
        Backend::OpenAi => {
            let api_key = config.require_api_key()?;
            let client = OpenAiTranscriber::new(
                &config.api_url,
                api_key,
                &config.model,
                config.call_timeout,
            )?;
            Ok(Arc::new(client))
        }
        Backend::Local => local_capability(config).await,
    }
}

#[cfg(feature = "whisper")]
async fn local_capability(config: &Config) -> anyhow::Result<Arc<dyn TranscriptionCapability>> {
    use scribe::transcribe::{LocalWhisper, WhisperModel};

    let model: WhisperModel = config.whisper_model.parse().map_err(anyhow::Error::msg)?;
    let whisper = LocalWhisper::load(model, &config.models_dir())
        .await
        .context("Failed to load local Whisper model")?;
    Ok(Arc::new(whisper))
}

#[cfg(not(feature = "whisper"))]
async fn local_capability(_config: &Config) -> anyhow::Result<Arc<dyn TranscriptionCapability>> {
    anyhow::bail!("The local backend needs a build with `--features whisper`")
}

fn history(config: &Config, show: bool) -> anyhow::Result<()> {
    let entries = HistoryLog::new(config.history_path())
        .entries_newest_first()
        .context("Failed to read history")?;

    if entries.is_empty() {
        println!("No transcriptions recorded yet.");
        return Ok(());
    }

    for entry in entries {
        println!("{} ({})", entry.name, entry.date);
        if show {
            println!("{}\n", entry.current_text());
        } else if let Some(path) = &entry.text_file {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

fn settings(config: &Config) {
    println!("Output directory:  {}", config.output_dir.display());
    println!("History file:      {}", config.history_path().display());
    println!("Backend:           {}", config.backend);
    println!("API URL:           {}", config.api_url);
    println!("API key:           {}", config.masked_api_key());
    println!("Model:             {}", config.model);
    println!("Language:          {}", config.language.as_deref().unwrap_or("auto"));
    println!("Max segment size:  {} bytes", config.max_segment_bytes);
    println!("Segment rate:      {} Hz", config.sample_rate);
    println!("Call timeout:      {}s", config.call_timeout.as_secs());
    println!("Concurrency:       {}", config.concurrency);
    if config.backend == Backend::Local {
        println!("Whisper model:     {} ({})", config.whisper_model, config.models_dir().display());
    }
}
