use std::sync::LazyLock;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{Result, StoryError};

const SYSTEM_ROLE: &str = "You are a creative storyteller for children.";

/// Whitespace that ends a sentence: the run right after `.`, `!` or `?`.
static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("sentence break pattern is valid"));

#[async_trait]
pub(crate) trait StoryWriter: Send + Sync {
    async fn write_story(&self, prompt: &str, sentence_count: usize) -> Result<String>;
}

#[derive(Debug, Clone)]
pub(crate) struct StoryParams {
    pub(crate) model: String,
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f32,
}

pub(crate) struct OpenAiStoryWriter {
    client: Client<OpenAIConfig>,
    params: StoryParams,
}

impl OpenAiStoryWriter {
    pub(crate) fn new(client: Client<OpenAIConfig>, params: StoryParams) -> Self {
        Self { client, params }
    }
}

#[async_trait]
impl StoryWriter for OpenAiStoryWriter {
    async fn write_story(&self, prompt: &str, sentence_count: usize) -> Result<String> {
        let detailed_prompt = format!(
            "{prompt} Please generate a story that is approximately {sentence_count} sentences long."
        );

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.params.model.as_str())
            .max_tokens(self.params.max_tokens)
            .temperature(self.params.temperature)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_ROLE)
                    .build()
                    .map_err(|e| StoryError::generation("story", e))?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(detailed_prompt)
                    .build()
                    .map_err(|e| StoryError::generation("story", e))?
                    .into(),
            ])
            .build()
            .map_err(|e| StoryError::generation("story", e))?;

        info!(model = %self.params.model, sentence_count, "Requesting story");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| StoryError::generation("story", e))?;

        let story = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .map(str::trim)
            .unwrap_or_default();
        if story.is_empty() {
            return Err(StoryError::InvalidResponse(
                "The API response did not contain a valid story.".to_owned(),
            ));
        }

        debug!(chars = story.len(), "Story received");
        Ok(story.to_owned())
    }
}

/// Sentences past `max_sentences` are dropped; punctuation stays attached.
pub(crate) fn split_into_sentences(story: &str, max_sentences: usize) -> Result<Vec<String>> {
    let story = story.trim();
    if story.is_empty() {
        return Err(StoryError::InvalidInput(
            "Story must be a non-empty string.".to_owned(),
        ));
    }

    let mut sentences = Vec::new();
    let mut start = 0;
    for separator in SENTENCE_BREAK.find_iter(story) {
        if sentences.len() == max_sentences {
            return Ok(sentences);
        }
        // Punctuation is a single ASCII byte.
        let end = separator.start() + 1;
        sentences.push(story[start..end].to_owned());
        start = separator.end();
    }
    if sentences.len() < max_sentences {
        sentences.push(story[start..].to_owned());
    }
    Ok(sentences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    const STORY: &str = "Once upon a time, a robot woke up. It wanted to paint!  \
        Could it learn? It tried every day.\n\nAt last it painted the sea.";

    /// Rebuilds the text covered by `sentences` using the separators found in `story`.
    fn rejoin(story: &str, sentences: &[String]) -> String {
        let story = story.trim();
        let mut offset = 0;
        let mut rebuilt = String::new();
        for sentence in sentences {
            let at = offset + story[offset..].find(sentence.as_str()).unwrap();
            rebuilt.push_str(&story[offset..at]);
            rebuilt.push_str(sentence);
            offset = at + sentence.len();
        }
        rebuilt
    }

    #[test]
    fn splits_after_terminal_punctuation() {
        let sentences = split_into_sentences(STORY, 10).unwrap();
        assert_eq!(
            sentences,
            vec![
                "Once upon a time, a robot woke up.",
                "It wanted to paint!",
                "Could it learn?",
                "It tried every day.",
                "At last it painted the sea.",
            ]
        );
    }

    #[test]
    fn truncates_to_requested_count() {
        let sentences = split_into_sentences(STORY, 2).unwrap();
        assert_eq!(sentences, vec!["Once upon a time, a robot woke up.", "It wanted to paint!"]);
    }

    #[test]
    fn does_not_pad_short_stories() {
        let sentences = split_into_sentences("Just one sentence here.", 5).unwrap();
        assert_eq!(sentences, vec!["Just one sentence here."]);
    }

    #[test]
    fn keeps_unterminated_tail() {
        let sentences = split_into_sentences("First. And then", 5).unwrap();
        assert_eq!(sentences, vec!["First.", "And then"]);
    }

    #[test]
    fn punctuation_without_whitespace_does_not_split() {
        let sentences = split_into_sentences("Version 2.5 shipped. Yay", 5).unwrap();
        assert_eq!(sentences, vec!["Version 2.5 shipped.", "Yay"]);
    }

    #[test]
    fn sentences_are_bounded_non_empty_prefixes() {
        for max in 1..=7 {
            let sentences = split_into_sentences(STORY, max).unwrap();
            assert!(sentences.len() <= max);
            assert!(sentences.iter().all(|s| !s.is_empty()));
            assert!(STORY.trim().starts_with(&rejoin(STORY, &sentences)));
        }
    }

    #[test]
    fn rejects_empty_story() {
        for story in ["", "   \n\t"] {
            let err = split_into_sentences(story, 3).unwrap_err();
            assert!(err.is_invalid_input());
        }
    }

    fn completion(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })
    }

    /// Serves one canned chat completion response and records each request body.
    async fn writer_against(
        status: StatusCode,
        reply: Value,
    ) -> (OpenAiStoryWriter, Arc<Mutex<Vec<Value>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let router = axum::Router::new().route(
            "/chat/completions",
            axum::routing::post({
                let requests = Arc::clone(&requests);
                move |axum::Json(body): axum::Json<Value>| async move {
                    requests.lock().unwrap().push(body);
                    (status, axum::Json(reply))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let config = OpenAIConfig::new()
            .with_api_base(format!("http://{addr}"))
            .with_api_key("sk-test");
        let params = StoryParams {
            model: "gpt-4".to_owned(),
            max_tokens: 500,
            temperature: 0.7,
        };
        (OpenAiStoryWriter::new(Client::with_config(config), params), requests)
    }

    #[tokio::test]
    async fn asks_for_a_childrens_story_of_the_requested_length() {
        let reply = completion("  Once upon a time, a robot painted.\n");
        let (writer, requests) = writer_against(StatusCode::OK, reply).await;

        let story = writer.write_story("A robot learns to paint", 3).await.unwrap();

        assert_eq!(story, "Once upon a time, a robot painted.");
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let body = &requests[0];
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], SYSTEM_ROLE);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(
            body["messages"][1]["content"],
            "A robot learns to paint Please generate a story that is approximately 3 sentences long."
        );
    }

    #[tokio::test]
    async fn blank_completion_is_an_invalid_response() {
        for reply in [completion(""), completion("   ")] {
            let (writer, _) = writer_against(StatusCode::OK, reply).await;

            let err = writer.write_story("Robots", 5).await.unwrap_err();

            assert!(matches!(err, StoryError::InvalidResponse(_)), "{err}");
            assert!(!err.is_invalid_input());
        }
    }

    #[tokio::test]
    async fn rejected_request_is_a_generation_failure() {
        let reply = json!({
            "error": {
                "message": "The model `gpt-5` does not exist",
                "type": "invalid_request_error",
                "param": null,
                "code": "model_not_found"
            }
        });
        let (writer, _) = writer_against(StatusCode::NOT_FOUND, reply).await;

        let err = writer.write_story("Robots", 5).await.unwrap_err();

        assert!(matches!(err, StoryError::Generation { stage: "story", .. }), "{err}");
        assert!(err.to_string().contains("does not exist"), "{err}");
    }
}
