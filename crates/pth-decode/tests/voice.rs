mod common;

use common::*;
use pth_decode::{SpeakerConditioning, SpeechRequest, VoiceError, decode};
use serde_json::json;

#[test]
fn speech_request_from_speaker_checkpoint() {
    let pickle = state_dict(&[
        ("gpt_cond_latent", Value::Tensor(TensorSpec::float("0", &[1, 2, 2]))),
        ("speaker_embedding", Value::Tensor(TensorSpec::float("1", &[1, 3]))),
    ]);
    let latent = f32_bytes(&[0.5, -0.5, 1.0, -1.0]);
    let embedding = f32_bytes(&[0.25, 0.75, 2.0]);
    let buffer = zip_archive(&[
        ("speaker/data.pkl", &pickle),
        ("speaker/data/0", &latent),
        ("speaker/data/1", &embedding),
    ]);

    let checkpoint = decode(&buffer).unwrap();
    let conditioning = SpeakerConditioning::from_checkpoint(&checkpoint).unwrap();
    let request = SpeechRequest::new("Hello there", conditioning).with_language("fr");

    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({
            "text": "Hello there",
            "gpt_cond_latent": [[[0.5, -0.5], [1.0, -1.0]]],
            "speaker_embedding": [[0.25, 0.75, 2.0]],
            "language": "fr",
            "add_wav_header": true,
        })
    );
}

#[test]
fn checkpoint_without_latent_is_rejected() {
    let pickle = state_dict(&[("speaker_embedding", Value::Tensor(TensorSpec::float("0", &[2])))]);
    let checkpoint = decode(&pickle).unwrap();

    assert_eq!(
        SpeakerConditioning::from_checkpoint(&checkpoint).unwrap_err(),
        VoiceError::MissingEntry("gpt_cond_latent")
    );
}
