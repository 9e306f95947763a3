use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// What the decoder is asked to do with the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Transcribe => "transcribe",
            Task::Translate  => "translate",
        }
    }

    /// The Whisper special token selecting this task.
    pub fn token(&self) -> String {
        format!("<|{}|>", self.as_str())
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" => Ok(Task::Transcribe),
            "translate"  => Ok(Task::Translate),
            other => Err(format!(
                "unknown task '{other}', expected 'transcribe' or 'translate'"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_token() {
        assert_eq!("translate".parse::<Task>().unwrap(), Task::Translate);
        assert_eq!(Task::Transcribe.token(), "<|transcribe|>");
        assert!("summarise".parse::<Task>().is_err());
    }
}
