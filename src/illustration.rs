use std::path::Path;
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    CreateImageRequestArgs, Image, ImageModel, ImageResponseFormat, ImageSize,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{Result, StoryError};
use crate::retry::{retry_if, Backoff};

const HF_INFERENCE_API: &str = "https://api-inference.huggingface.co/models";

/// Upstream wording for an overloaded model; the only failure worth retrying.
pub(crate) const BUSY_SIGNAL: &str = "Model too busy";

#[derive(Error, Debug)]
pub(crate) enum ImageModelError {
    #[error("{0}")]
    Busy(String),

    #[error("image service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OpenAI error: {0}")]
    OpenAi(#[from] OpenAIError),

    #[error("invalid image payload: {0}")]
    Payload(String),
}

impl ImageModelError {
    pub(crate) fn from_service(status: u16, message: String) -> Self {
        if message.contains(BUSY_SIGNAL) {
            ImageModelError::Busy(message)
        } else {
            ImageModelError::Service { status, message }
        }
    }

    pub(crate) fn is_model_busy(&self) -> bool {
        match self {
            ImageModelError::Busy(_) => true,
            ImageModelError::OpenAi(OpenAIError::ApiError(api)) => api.message.contains(BUSY_SIGNAL),
            _ => false,
        }
    }
}

#[async_trait]
pub(crate) trait TextToImage: Send + Sync {
    async fn text_to_image(&self, prompt: &str) -> std::result::Result<Vec<u8>, ImageModelError>;
}

#[derive(Debug, Deserialize)]
struct InferenceError {
    error: String,
}

pub(crate) struct HuggingFaceClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HuggingFaceClient {
    pub(crate) fn new(http: reqwest::Client, model: &str, token: Option<String>) -> Self {
        Self::with_base_url(http, HF_INFERENCE_API, model, token)
    }

    pub(crate) fn with_base_url(
        http: reqwest::Client,
        base_url: &str,
        model: &str,
        token: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint: format!("{}/{model}", base_url.trim_end_matches('/')),
            token,
        }
    }
}

#[async_trait]
impl TextToImage for HuggingFaceClient {
    async fn text_to_image(&self, prompt: &str) -> std::result::Result<Vec<u8>, ImageModelError> {
        let mut request = self.http.post(&self.endpoint).json(&json!({ "inputs": prompt }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            let message = serde_json::from_str::<InferenceError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(ImageModelError::from_service(status.as_u16(), message));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

pub(crate) struct OpenAiImageClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiImageClient {
    pub(crate) fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TextToImage for OpenAiImageClient {
    async fn text_to_image(&self, prompt: &str) -> std::result::Result<Vec<u8>, ImageModelError> {
        let request = CreateImageRequestArgs::default()
            .prompt(prompt)
            .model(ImageModel::DallE3)
            .n(1)
            .size(ImageSize::S1024x1024)
            .response_format(ImageResponseFormat::B64Json)
            .build()?;

        let response = self.client.images().create(request).await?;
        let image = response
            .data
            .first()
            .ok_or_else(|| ImageModelError::Payload("no image in response".to_owned()))?;
        match image.as_ref() {
            Image::B64Json { b64_json, .. } => BASE64_STANDARD
                .decode(b64_json.as_bytes())
                .map_err(|e| ImageModelError::Payload(e.to_string())),
            Image::Url { .. } => Err(ImageModelError::Payload(
                "expected base64 image, got a URL".to_owned(),
            )),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ImageGenerator {
    model: Arc<dyn TextToImage>,
    backoff: Backoff,
}

impl ImageGenerator {
    pub(crate) fn new(model: Arc<dyn TextToImage>, backoff: Backoff) -> Self {
        Self { model, backoff }
    }

    pub(crate) async fn generate(&self, prompt: &str, output_path: &Path) -> Result<()> {
        let bytes = retry_if(
            self.backoff,
            |attempt| {
                info!(attempt, prompt, "Generating image");
                self.model.text_to_image(prompt)
            },
            ImageModelError::is_model_busy,
        )
        .await
        .map_err(|e| StoryError::generation("image", e))?;

        tokio::fs::write(output_path, &bytes).await?;
        debug!(path = %output_path.display(), bytes = bytes.len(), "Image saved");
        Ok(())
    }
}
