use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pytorch::StringEncoding;
use crate::pytorch::storage::DEFAULT_FILL_LIMIT;

/// Configuration IO error.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Config error => Could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config error => Invalid format: {0}")]
    Json(#[from] serde_json::Error),
}

/// Knobs for the decode strategies.
///
/// Every field has a default, so a config file only needs the values it changes:
///
/// ```json
/// { "legacy_encodings": ["latin1"], "scan_archive": false }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Archive entries tried, in order, as the pickle stream.
    pub pickle_paths: Vec<String>,
    /// Also try any other `*/data.pkl` entry of the archive.
    pub scan_archive: bool,
    /// Archive directories searched for `<dir>/<key>` storage entries, before the ones
    /// next to the pickle.
    pub data_dirs: Vec<String>,
    /// Encodings tried, in order, for the legacy layout.
    pub legacy_encodings: Vec<StringEncoding>,
    /// Read the storage blobs that follow a legacy multi-pickle header.
    pub legacy_storages: bool,
    /// Most zeros (or empty rows) produced for one tensor whose bytes are missing.
    pub fill_limit: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            pickle_paths: vec![
                "data.pkl".to_string(),
                "archive/data.pkl".to_string(),
                "data/data.pkl".to_string(),
            ],
            scan_archive: true,
            data_dirs: vec!["archive/.data".to_string()],
            legacy_encodings: vec![
                StringEncoding::Latin1,
                StringEncoding::Ascii,
                StringEncoding::Bytes,
            ],
            legacy_storages: true,
            fill_limit: DEFAULT_FILL_LIMIT,
        }
    }
}

impl DecoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pickle_paths(mut self, pickle_paths: Vec<String>) -> Self {
        self.pickle_paths = pickle_paths;
        self
    }

    pub fn with_scan_archive(mut self, scan_archive: bool) -> Self {
        self.scan_archive = scan_archive;
        self
    }

    pub fn with_data_dirs(mut self, data_dirs: Vec<String>) -> Self {
        self.data_dirs = data_dirs;
        self
    }

    pub fn with_legacy_encodings(mut self, legacy_encodings: Vec<StringEncoding>) -> Self {
        self.legacy_encodings = legacy_encodings;
        self
    }

    pub fn with_legacy_storages(mut self, legacy_storages: bool) -> Self {
        self.legacy_storages = legacy_storages;
        self
    }

    pub fn with_fill_limit(mut self, fill_limit: usize) -> Self {
        self.fill_limit = fill_limit;
        self
    }

    /// Parses a JSON config. Missing fields take their default.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Loads the configuration from a file.
    ///
    /// # Arguments
    ///
    /// * `file` - JSON file to load the configuration from.
    ///
    /// # Returns
    ///
    /// The loaded configuration.
    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self, ConfigError> {
        let file = file.as_ref();
        let content = std::fs::read_to_string(file).map_err(|source| ConfigError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Saves the configuration to a file as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<(), ConfigError> {
        let file = file.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(file, content).map_err(|source| ConfigError::Io {
            path: file.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config = DecoderConfig::from_json(r#"{"legacy_encodings": ["bytes"]}"#).unwrap();

        assert_eq!(config.legacy_encodings, vec![StringEncoding::Bytes]);
        assert_eq!(config.pickle_paths, DecoderConfig::default().pickle_paths);
        assert!(config.legacy_storages);
        assert_eq!(config.fill_limit, DEFAULT_FILL_LIMIT);
    }

    #[test]
    fn rejects_unknown_encodings() {
        let err = DecoderConfig::from_json(r#"{"legacy_encodings": ["utf-16"]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decoder.json");
        let config = DecoderConfig::new()
            .with_scan_archive(false)
            .with_data_dirs(vec!["speaker/data".to_string()]);

        config.save(&path).unwrap();

        assert_eq!(DecoderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        match DecoderConfig::load(&path) {
            Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected an io error, got {other:?}"),
        }
    }
}
