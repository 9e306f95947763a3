// ============================================================
// Layer 3 — Dataset Record Types
// ============================================================
// One line of the dataset JSON looks like:
//
//   {"audio": {"path": "dataset/audio/0001.wav"}, "sentence": "hello world"}
//
// or, with the shorter form:
//
//   {"audio": "dataset/audio/0001.wav", "sentence": "hello world"}
//
// A record moves through three shapes on its way to the model:
//
//   TranscriptRecord  → as stored on disk (audio reference + text)
//   RawExample        → audio decoded to a 16 kHz waveform
//   PreparedExample   → log-mel features + label token ids
//
// Records are never mutated; each access derives a fresh value.

use serde::{Deserialize, Serialize};

/// Reference to the audio of one record.
///
/// `untagged` lets serde accept either a bare path string or an
/// object with a path and an optional time span in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioRef {
    Path(String),
    Segment {
        path: String,
        #[serde(default)]
        start_time: Option<f64>,
        #[serde(default)]
        end_time: Option<f64>,
    },
}

impl AudioRef {
    pub fn path(&self) -> &str {
        match self {
            AudioRef::Path(p) => p,
            AudioRef::Segment { path, .. } => path,
        }
    }

    /// (start, end) in seconds; `None` means "from the beginning" / "to the end".
    pub fn span(&self) -> (Option<f64>, Option<f64>) {
        match self {
            AudioRef::Path(_) => (None, None),
            AudioRef::Segment { start_time, end_time, .. } => (*start_time, *end_time),
        }
    }
}

/// One dataset row as stored in the JSON file.
/// Unknown fields (duration, language, ...) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub audio:    AudioRef,
    pub sentence: String,
}

/// A mono waveform with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioArray {
    pub samples:       Vec<f32>,
    pub sampling_rate: u32,
}

impl AudioArray {
    pub fn new(samples: Vec<f32>, sampling_rate: u32) -> Self {
        Self { samples, sampling_rate }
    }
}

/// A record whose audio has been decoded, ready for preprocessing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExample {
    pub audio:    AudioArray,
    pub sentence: String,
}

/// Model-ready pair produced by the preprocessing function.
///
/// `input_features` is a row-major `[n_mels, n_frames]` log-mel array.
/// `labels` is unpadded; padding happens in the collator.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExample {
    pub input_features: Vec<f32>,
    pub n_mels:         usize,
    pub n_frames:       usize,
    pub labels:         Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_accepts_plain_path() {
        let r: TranscriptRecord =
            serde_json::from_str(r#"{"audio": "a.wav", "sentence": "hi"}"#).unwrap();
        assert_eq!(r.audio.path(), "a.wav");
        assert_eq!(r.audio.span(), (None, None));
    }

    #[test]
    fn test_audio_accepts_object_with_span() {
        let r: TranscriptRecord = serde_json::from_str(
            r#"{"audio": {"path": "b.wav", "start_time": 1.5, "end_time": 3.0},
                "sentence": "there", "duration": 1.5}"#,
        )
        .unwrap();
        assert_eq!(r.audio.path(), "b.wav");
        assert_eq!(r.audio.span(), (Some(1.5), Some(3.0)));
    }

    #[test]
    fn test_missing_sentence_is_rejected() {
        let r = serde_json::from_str::<TranscriptRecord>(r#"{"audio": "a.wav"}"#);
        assert!(r.is_err());
    }
}
