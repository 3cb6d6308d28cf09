mod assembler;
mod error;
mod illustration;
mod rate;
mod retry;
mod server;
mod speech;
mod story;
mod video;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use async_openai::Client;
use clap::{Parser, ValueEnum};
use ffmpeg_next as ffmpeg;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use assembler::StoryAssembler;
use illustration::{HuggingFaceClient, ImageGenerator, OpenAiImageClient, TextToImage};
use retry::Backoff;
use server::AppState;
use speech::{EspeakEngine, OpenAiSpeechEngine, SpeechEngine};
use story::{OpenAiStoryWriter, StoryParams};
use video::FfmpegEncoder;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ImageBackend {
    Huggingface,
    Openai,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SpeechBackend {
    Espeak,
    Openai,
}

#[derive(Parser, Debug)]
#[command(name = "storyreel")]
#[command(about = "Serve illustrated, narrated story videos generated with AI", long_about = None)]
struct Cli {
    /// Address the HTTP server listens on
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Directory finished videos are written to
    #[arg(long, env = "OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// Directory for per-request scratch files
    #[arg(long, env = "TEMP_DIR", default_value = "temp")]
    temp_dir: PathBuf,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    #[arg(long, default_value = "gpt-4")]
    story_model: String,

    #[arg(long, default_value_t = 500)]
    max_tokens: u32,

    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    #[arg(long, value_enum, default_value_t = ImageBackend::Huggingface)]
    image_backend: ImageBackend,

    /// Hugging Face model id used by the huggingface backend
    #[arg(long, default_value = "black-forest-labs/FLUX.1-dev")]
    image_model: String,

    /// Attempts per image while the model reports it is busy
    #[arg(long, default_value_t = 5)]
    image_retries: u32,

    #[arg(long, default_value_t = 10)]
    image_initial_delay_secs: u64,

    #[arg(long, value_enum, default_value_t = SpeechBackend::Espeak)]
    speech_engine: SpeechBackend,

    #[arg(long, default_value = "espeak-ng")]
    espeak_program: PathBuf,

    /// espeak-ng voice name, e.g. "en-us"
    #[arg(long)]
    voice: Option<String>,

    #[arg(long, default_value_t = 24)]
    fps: u32,

    #[arg(long, default_value_t = 720)]
    frame_height: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    ffmpeg::init().context("Failed to initialise FFmpeg")?;
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Warning);

    for dir in [&cli.output_dir, &cli.temp_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let state = build_state(&cli)?;
    let app = server::create_router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;
    info!(
        addr = %cli.bind,
        output_dir = %cli.output_dir.display(),
        temp_dir = %cli.temp_dir.display(),
        "Story video server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn build_state(cli: &Cli) -> anyhow::Result<AppState> {
    let openai_config = match &cli.openai_api_key {
        Some(key) => OpenAIConfig::new().with_api_key(key),
        None => OpenAIConfig::new(),
    };
    let openai = Client::with_config(openai_config);

    let story = OpenAiStoryWriter::new(
        openai.clone(),
        StoryParams {
            model: cli.story_model.clone(),
            max_tokens: cli.max_tokens,
            temperature: cli.temperature,
        },
    );

    let image_model: Arc<dyn TextToImage> = match cli.image_backend {
        ImageBackend::Huggingface => {
            if cli.hf_token.is_none() {
                warn!("HF_TOKEN is not set; anonymous inference requests are heavily rate limited");
            }
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .context("Failed to create HTTP client")?;
            Arc::new(HuggingFaceClient::new(
                http,
                &cli.image_model,
                cli.hf_token.clone(),
            ))
        }
        ImageBackend::Openai => Arc::new(OpenAiImageClient::new(openai.clone())),
    };
    let images = ImageGenerator::new(
        image_model,
        Backoff::new(
            cli.image_retries,
            Duration::from_secs(cli.image_initial_delay_secs),
        ),
    );

    let speech: Arc<dyn SpeechEngine> = match cli.speech_engine {
        SpeechBackend::Espeak => Arc::new(EspeakEngine::new(
            cli.espeak_program.clone(),
            cli.voice.clone(),
        )),
        SpeechBackend::Openai => Arc::new(OpenAiSpeechEngine::new(openai)),
    };

    let assembler = StoryAssembler::new(
        images,
        speech,
        Arc::new(FfmpegEncoder::new(cli.fps, cli.frame_height)),
        cli.output_dir.clone(),
        cli.temp_dir.clone(),
    );

    Ok(AppState::new(Arc::new(story), Arc::new(assembler)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
