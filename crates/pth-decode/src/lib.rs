#![cfg_attr(docsrs, feature(doc_cfg))]

//! `pth-decode` reads PyTorch `.pth` checkpoints without a Python runtime.
//!
//! Both layouts written by `torch.save` are supported: the ZIP archive (PyTorch >= 1.6) and
//! the legacy pickle stream. Tensors are rebuilt from their raw storages and returned as
//! nested values with their shape and element type.
//!
//! ```no_run
//! let bytes = std::fs::read("speaker.pth")?;
//! let checkpoint = pth_decode::decode(&bytes)?;
//! if let Some(latent) = checkpoint.tensor("gpt_cond_latent") {
//!     println!("{:?} {}", latent.shape, latent.dtype);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// The decoded checkpoint model.
pub mod checkpoint;

/// Decoder configuration.
pub mod config;

/// Decode errors.
pub mod error;

/// Pickle replay and the PyTorch layouts.
pub mod pytorch;

/// Voice cloning payloads built from speaker checkpoints.
pub mod voice;

pub use checkpoint::{Checkpoint, CheckpointEntry, NestedArray, SerializedTensor};
pub use config::{ConfigError, DecoderConfig};
pub use error::{AttemptError, CheckpointDecodeError};
pub use pytorch::reader::decode;
pub use pytorch::{CheckpointReader, ElementType, StringEncoding};
pub use voice::{SpeakerConditioning, SpeechRequest, VoiceError};
