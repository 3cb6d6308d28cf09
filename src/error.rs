use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum StoryError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InvalidResponse(String),

    #[error("Failed to generate {stage}: {message}")]
    Generation {
        stage: &'static str,
        message: String,
    },

    #[error("Audio synthesis failed for text: {text}. Error: {reason}")]
    Synthesis { text: String, reason: String },

    #[error("Error processing sentence '{sentence}': {source}")]
    Sentence {
        sentence: String,
        #[source]
        source: Box<StoryError>,
    },

    #[error("Failed to create story video: {0:#}")]
    Encoding(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoryError {
    pub(crate) fn generation(stage: &'static str, message: impl ToString) -> Self {
        StoryError::Generation {
            stage,
            message: message.to_string(),
        }
    }

    pub(crate) fn synthesis(text: &str, reason: impl ToString) -> Self {
        StoryError::Synthesis {
            text: text.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn for_sentence(sentence: &str, source: StoryError) -> Self {
        StoryError::Sentence {
            sentence: sentence.to_owned(),
            source: Box::new(source),
        }
    }

    pub(crate) fn is_invalid_input(&self) -> bool {
        matches!(self, StoryError::InvalidInput(_))
    }
}

pub(crate) type Result<T> = std::result::Result<T, StoryError>;
