//! Speaker conditioning checkpoints and the speech request built from them.
//!
//! A cloned voice is stored as a checkpoint holding `gpt_cond_latent` and, usually,
//! `speaker_embedding`. Both may be tensors or plain nested lists. The request body
//! forwards them unchanged together with the text to speak:
//!
//! ```json
//! {"text": "...", "gpt_cond_latent": [[...]], "speaker_embedding": [[...]],
//!  "language": "en", "add_wav_header": true}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::{Checkpoint, CheckpointEntry, NestedArray};

pub const GPT_COND_LATENT: &str = "gpt_cond_latent";
pub const SPEAKER_EMBEDDING: &str = "speaker_embedding";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum VoiceError {
    #[error("Checkpoint has no `{0}` entry")]
    MissingEntry(&'static str),

    #[error("Checkpoint entry `{name}` must be a tensor or a list of numbers, found {found}")]
    InvalidEntry { name: &'static str, found: &'static str },
}

/// Conditioning tensors of one speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerConditioning {
    pub gpt_cond_latent: NestedArray,
    pub speaker_embedding: Option<NestedArray>,
}

impl SpeakerConditioning {
    /// Extracts the conditioning entries; `gpt_cond_latent` is required.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self, VoiceError> {
        let gpt_cond_latent = entry_values(checkpoint, GPT_COND_LATENT)?
            .ok_or(VoiceError::MissingEntry(GPT_COND_LATENT))?;
        let speaker_embedding = entry_values(checkpoint, SPEAKER_EMBEDDING)?;

        log::debug!(
            "Speaker conditioning: gpt_cond_latent {:?}, speaker_embedding {:?}",
            gpt_cond_latent.shape(),
            speaker_embedding.as_ref().map(NestedArray::shape)
        );
        Ok(Self {
            gpt_cond_latent,
            speaker_embedding,
        })
    }
}

fn entry_values(
    checkpoint: &Checkpoint,
    name: &'static str,
) -> Result<Option<NestedArray>, VoiceError> {
    match checkpoint.get(name) {
        None | Some(CheckpointEntry::Value(Value::Null)) => Ok(None),
        Some(CheckpointEntry::Tensor(tensor)) => Ok(Some(tensor.data.clone())),
        Some(CheckpointEntry::Value(value)) => match NestedArray::from_json(value) {
            Some(values @ NestedArray::List(_)) => Ok(Some(values)),
            _ => Err(VoiceError::InvalidEntry {
                name,
                found: json_kind(value),
            }),
        },
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list of non-numbers",
        Value::Object(_) => "a mapping",
    }
}

/// Body of a text-to-speech request for a cloned voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub gpt_cond_latent: NestedArray,
    pub speaker_embedding: Option<NestedArray>,
    pub language: String,
    pub add_wav_header: bool,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>, conditioning: SpeakerConditioning) -> Self {
        Self {
            text: text.into(),
            gpt_cond_latent: conditioning.gpt_cond_latent,
            speaker_embedding: conditioning.speaker_embedding,
            language: "en".to_string(),
            add_wav_header: true,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_wav_header(mut self, add_wav_header: bool) -> Self {
        self.add_wav_header = add_wav_header;
        self
    }
}
