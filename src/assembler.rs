use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoryError};
use crate::illustration::ImageGenerator;
use crate::rate::SpeechRate;
use crate::speech::SpeechEngine;
use crate::video::{Segment, VideoEncoder};

pub(crate) struct StoryAssembler {
    images: ImageGenerator,
    speech: Arc<dyn SpeechEngine>,
    encoder: Arc<dyn VideoEncoder>,
    output_dir: PathBuf,
    temp_dir: PathBuf,
}

impl StoryAssembler {
    pub(crate) fn new(
        images: ImageGenerator,
        speech: Arc<dyn SpeechEngine>,
        encoder: Arc<dyn VideoEncoder>,
        output_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            images,
            speech,
            encoder,
            output_dir: output_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    /// Intermediate files live in a per-call directory under the temp dir. Once
    /// encoding starts, the blocking task owns that directory and removes any
    /// partial output, even if this future is dropped.
    pub(crate) async fn create_story_video(
        &self,
        sentences: &[String],
        rate: SpeechRate,
    ) -> Result<PathBuf> {
        if sentences.is_empty() {
            return Err(StoryError::InvalidInput(
                "At least one sentence is required.".to_owned(),
            ));
        }

        let output_path = self.output_dir.join(format!("{}.mp4", Uuid::new_v4()));
        let workdir = tempfile::Builder::new()
            .prefix("story-")
            .tempdir_in(&self.temp_dir)?;

        let mut segments = Vec::with_capacity(sentences.len());
        for (index, sentence) in sentences.iter().enumerate() {
            info!(index, total = sentences.len(), "Preparing segment");
            let segment = self
                .build_segment(index, sentence, workdir.path(), rate)
                .await
                .map_err(|e| StoryError::for_sentence(sentence, e))?;
            segments.push(segment);
        }

        let encoder = Arc::clone(&self.encoder);
        let target = output_path.clone();
        let encoded = tokio::task::spawn_blocking(move || {
            let encoded = encoder.encode(&segments, &target);
            if encoded.is_err() {
                remove_partial(&target);
            }
            drop(workdir);
            encoded
        })
        .await;
        match encoded {
            Ok(result) => result.map_err(StoryError::Encoding)?,
            Err(e) => {
                remove_partial(&output_path);
                return Err(StoryError::Encoding(e.into()));
            }
        }

        info!(path = %output_path.display(), "Story video created");
        Ok(output_path)
    }

    async fn build_segment(
        &self,
        index: usize,
        sentence: &str,
        dir: &Path,
        rate: SpeechRate,
    ) -> Result<Segment> {
        let image = dir.join(format!("frame_{index}.png"));
        let audio = dir.join(format!("audio_{index}.wav"));

        self.images.generate(sentence, &image).await?;
        self.speech.synthesize(sentence, &audio, rate).await?;
        let duration = audio_duration(&audio).map_err(StoryError::Encoding)?;

        Ok(Segment {
            image,
            audio,
            duration,
        })
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial video");
        }
    }
}

/// Streamed WAVs are written before their length is known and carry a
/// placeholder data size. Shrinks it to the bytes actually on disk.
fn repair_streamed_wav(path: &Path) -> anyhow::Result<bool> {
    let mut bytes = std::fs::read(path)?;
    anyhow::ensure!(
        bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE",
        "{} is not a WAV file",
        path.display()
    );

    let mut block_align = 1;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let declared = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into()?) as usize;
        let body = offset + 8;
        if id == b"fmt " && body + 14 <= bytes.len() {
            block_align = usize::from(u16::from_le_bytes([bytes[body + 12], bytes[body + 13]])).max(1);
        }
        if id == b"data" {
            let available = bytes.len() - body;
            if declared <= available {
                return Ok(false);
            }
            let data_len = u32::try_from(available / block_align * block_align)?;
            let riff_len = u32::try_from(bytes.len() - 8)?;
            bytes[offset + 4..offset + 8].copy_from_slice(&data_len.to_le_bytes());
            bytes[4..8].copy_from_slice(&riff_len.to_le_bytes());
            std::fs::write(path, &bytes)?;
            return Ok(true);
        }
        // chunks are padded to an even length
        offset = body.saturating_add(declared).saturating_add(declared % 2);
    }
    anyhow::bail!("{} has no data chunk", path.display())
}

fn audio_duration(path: &Path) -> anyhow::Result<Duration> {
    if repair_streamed_wav(path)? {
        debug!(path = %path.display(), "Rewrote placeholder WAV sizes");
    }
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to read audio {}", path.display()))?;
    let sample_rate = reader.spec().sample_rate;
    anyhow::ensure!(sample_rate > 0, "audio {} has no sample rate", path.display());
    Ok(Duration::from_secs_f64(
        reader.duration() as f64 / sample_rate as f64,
    ))
}
