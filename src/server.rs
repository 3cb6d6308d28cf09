//! HTTP surface: `POST /generate_story` and a health probe.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{error, info, instrument, Level};

use crate::assembler::StoryAssembler;
use crate::error::StoryError;
use crate::rate::SpeechRate;
use crate::story::{split_into_sentences, StoryWriter};

const DEFAULT_SENTENCE_COUNT: usize = 5;
const MISSING_PROMPT: &str = "Prompt must be provided";
const INVALID_FORMAT: &str = "Invalid input data format";
const UNEXPECTED: &str = "An unexpected error occurred";

#[derive(Clone)]
pub(crate) struct AppState {
    story: Arc<dyn StoryWriter>,
    assembler: Arc<StoryAssembler>,
}

impl AppState {
    pub(crate) fn new(story: Arc<dyn StoryWriter>, assembler: Arc<StoryAssembler>) -> Self {
        Self { story, assembler }
    }
}

pub(crate) fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/generate_story", post(generate_story))
        .route("/health", get(health_check))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Everything in the request besides `prompt`, which is checked first.
#[derive(Debug, Deserialize)]
struct GenerateStoryOptions {
    rate: Option<String>,
    sentence_count: Option<usize>,
}

#[derive(Debug, Serialize)]
struct GenerateStoryResponse {
    prompt: String,
    story: String,
    sentences: Vec<String>,
    video_url: String,
}

/// Error body returned to callers. Internal detail stays in the logs.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: UNEXPECTED.to_owned(),
        }
    }
}

impl From<StoryError> for ApiError {
    fn from(err: StoryError) -> Self {
        if err.is_invalid_input() {
            error!(error = %err, "Rejected story input");
            ApiError::bad_request(INVALID_FORMAT)
        } else {
            error!(error = %err, "Story generation failed");
            ApiError::internal()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

#[instrument(skip_all)]
async fn generate_story(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<GenerateStoryResponse>, ApiError> {
    info!("Received request to generate animated story video");

    let Json(body) = payload.map_err(|rejection| {
        error!(%rejection, "Unreadable request body");
        ApiError::bad_request(INVALID_FORMAT)
    })?;
    let Value::Object(fields) = body else {
        error!("Request body is not a JSON object");
        return Err(ApiError::bad_request(INVALID_FORMAT));
    };

    let prompt = match fields.get("prompt") {
        None | Some(Value::Null) => None,
        Some(Value::String(prompt)) if prompt.trim().is_empty() => None,
        Some(Value::String(prompt)) => Some(prompt.clone()),
        Some(other) => {
            error!(prompt = %other, "Prompt is not a string");
            return Err(ApiError::bad_request(INVALID_FORMAT));
        }
    }
    .ok_or_else(|| {
        error!("Prompt must be provided");
        ApiError::bad_request(MISSING_PROMPT)
    })?;

    let options: GenerateStoryOptions =
        serde_json::from_value(Value::Object(fields)).map_err(|e| {
            error!(error = %e, "Malformed request body");
            ApiError::bad_request(INVALID_FORMAT)
        })?;
    let rate = options
        .rate
        .as_deref()
        .unwrap_or("normal")
        .parse::<SpeechRate>()
        .map_err(|e| {
            error!(rate = ?options.rate, "Invalid rate provided");
            ApiError::bad_request(e.to_string())
        })?;
    let sentence_count = options.sentence_count.unwrap_or(DEFAULT_SENTENCE_COUNT);
    if sentence_count == 0 {
        error!("sentence_count must be positive");
        return Err(ApiError::bad_request(INVALID_FORMAT));
    }

    let story = state.story.write_story(&prompt, sentence_count).await?;
    let sentences = split_into_sentences(&story, sentence_count)?;
    let video_path = state.assembler.create_story_video(&sentences, rate).await?;

    info!(
        sentences = sentences.len(),
        %rate,
        video = %video_path.display(),
        "Animated story video generated successfully"
    );
    Ok(Json(GenerateStoryResponse {
        prompt,
        story,
        sentences,
        video_url: video_path.display().to_string(),
    }))
}
