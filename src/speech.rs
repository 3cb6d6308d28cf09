use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use async_openai::types::{CreateSpeechRequestArgs, SpeechModel, SpeechResponseFormat, Voice};
use async_openai::Client;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Result, StoryError};
use crate::rate::SpeechRate;

#[async_trait]
pub(crate) trait SpeechEngine: Send + Sync {
    async fn synthesize(&self, text: &str, output_path: &Path, rate: SpeechRate) -> Result<()>;
}

/// Exclusive use of the local audio engine. Dropping it hands the engine back.
struct EngineLease {
    _permit: OwnedSemaphorePermit,
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        debug!("Speech engine released");
    }
}

pub(crate) struct EspeakEngine {
    program: PathBuf,
    voice: Option<String>,
    device: Arc<Semaphore>,
}

impl EspeakEngine {
    pub(crate) fn new(program: impl Into<PathBuf>, voice: Option<String>) -> Self {
        Self {
            program: program.into(),
            voice,
            device: Arc::new(Semaphore::new(1)),
        }
    }

    async fn acquire(&self) -> anyhow::Result<EngineLease> {
        let permit = self
            .device
            .clone()
            .acquire_owned()
            .await
            .context("speech engine is shut down")?;
        debug!("Speech engine acquired");
        Ok(EngineLease { _permit: permit })
    }

    async fn render(&self, text: &str, output_path: &Path, rate: SpeechRate) -> anyhow::Result<()> {
        let mut command = Command::new(&self.program);
        command
            .arg("-s")
            .arg(rate.words_per_minute().to_string())
            .arg("-w")
            .arg(output_path);
        if let Some(voice) = &self.voice {
            command.arg("-v").arg(voice);
        }
        let mut child = command
            .arg("--stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        {
            let mut stdin = child.stdin.take().context("engine stdin unavailable")?;
            stdin.write_all(text.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechEngine for EspeakEngine {
    async fn synthesize(&self, text: &str, output_path: &Path, rate: SpeechRate) -> Result<()> {
        let lease = self.acquire().await.map_err(|e| StoryError::synthesis(text, e))?;
        let rendered = self.render(text, output_path, rate).await;
        drop(lease);
        rendered.map_err(|e| StoryError::synthesis(text, format!("{e:#}")))
    }
}

pub(crate) struct OpenAiSpeechEngine {
    client: Client<OpenAIConfig>,
}

impl OpenAiSpeechEngine {
    pub(crate) fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }

    async fn render(&self, text: &str, output_path: &Path, rate: SpeechRate) -> anyhow::Result<()> {
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .voice(Voice::Nova)
            .model(SpeechModel::Tts1)
            .response_format(SpeechResponseFormat::Wav)
            .speed(rate.words_per_minute() as f32 / 100.0)
            .build()?;

        let response = tokio::time::timeout(
            tokio::time::Duration::from_secs(120),
            self.client.audio().speech(request),
        )
        .await??;
        response.save(output_path).await?;
        Ok(())
    }
}

#[async_trait]
impl SpeechEngine for OpenAiSpeechEngine {
    async fn synthesize(&self, text: &str, output_path: &Path, rate: SpeechRate) -> Result<()> {
        self.render(text, output_path, rate)
            .await
            .map_err(|e| StoryError::synthesis(text, format!("{e:#}")))
    }
}
