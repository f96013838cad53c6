use zip::result::ZipError;

use crate::pytorch::PickleError;

/// Why one decode strategy (or one pickle candidate within it) failed.
#[derive(thiserror::Error, Debug)]
pub enum AttemptError {
    #[error("Zip error: {0}")]
    Zip(#[from] ZipError),

    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),

    #[error("No pickle stream found in archive entries {0:?}")]
    MissingPickle(Vec<String>),

    #[error("Checkpoint root must be a mapping, found {0}")]
    NotAMapping(&'static str),
}

/// Every decode strategy failed.
#[derive(thiserror::Error, Debug)]
#[error("Failed to load .pth file with all strategies. Last error: {last}")]
pub struct CheckpointDecodeError {
    #[source]
    last: AttemptError,
}

impl CheckpointDecodeError {
    pub(crate) fn new(last: AttemptError) -> Self {
        Self { last }
    }

    /// The error of the last strategy tried.
    pub fn last_error(&self) -> &AttemptError {
        &self.last
    }

    pub fn into_last_error(self) -> AttemptError {
        self.last
    }
}
