use std::fmt;
use std::str::FromStr;

use crate::error::StoryError;

pub(crate) const INVALID_RATE: &str = "Invalid rate. Choose from 'slow', 'normal', or 'fast'.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpeechRate {
    Slow,
    Normal,
    Fast,
}

impl SpeechRate {
    pub(crate) fn words_per_minute(self) -> u32 {
        match self {
            SpeechRate::Slow => 50,
            SpeechRate::Normal => 100,
            SpeechRate::Fast => 150,
        }
    }
}

impl FromStr for SpeechRate {
    type Err = StoryError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label.to_lowercase().as_str() {
            "slow" => Ok(SpeechRate::Slow),
            "normal" => Ok(SpeechRate::Normal),
            "fast" => Ok(SpeechRate::Fast),
            _ => Err(StoryError::InvalidInput(INVALID_RATE.to_owned())),
        }
    }
}

impl fmt::Display for SpeechRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SpeechRate::Slow => "slow",
            SpeechRate::Normal => "normal",
            SpeechRate::Fast => "fast",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_labels_to_words_per_minute() {
        let mapped: Vec<u32> = ["slow", "normal", "fast"]
            .iter()
            .map(|label| label.parse::<SpeechRate>().unwrap().words_per_minute())
            .collect();
        assert_eq!(mapped, vec![50, 100, 150]);
    }

    #[test]
    fn labels_are_case_insensitive() {
        assert_eq!("FAST".parse::<SpeechRate>().unwrap(), SpeechRate::Fast);
        assert_eq!("Slow".parse::<SpeechRate>().unwrap(), SpeechRate::Slow);
    }

    #[test]
    fn rejects_unknown_label() {
        for label in ["medium", "", "normal "] {
            let err = label.parse::<SpeechRate>().unwrap_err();
            assert!(err.is_invalid_input());
            assert_eq!(err.to_string(), INVALID_RATE);
        }
    }
}
