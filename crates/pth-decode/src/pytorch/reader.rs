//! Decode strategies for `.pth` buffers.
//!
//! The buffer is first opened as a ZIP archive (PyTorch >= 1.6). When that fails the whole
//! buffer is replayed as a legacy pickle stream, once per configured string encoding. The
//! first strategy that yields a mapping wins.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use zip::result::ZipError;

use super::archive::{ArchiveSource, data_dirs_for};
use super::pickle_reader::{Object, StringEncoding, Unpickler};
use super::storage::{StorageBytes, StorageTable};
use crate::checkpoint::Checkpoint;
use crate::config::DecoderConfig;
use crate::error::{AttemptError, CheckpointDecodeError};

/// `0x1950a86a20f9469cfc6c` as pickled by `torch.save` before the ZIP format, little-endian.
const LEGACY_MAGIC_NUMBER: [u8; 10] =
    [0x6c, 0xfc, 0x9c, 0x46, 0xf9, 0x20, 0x6a, 0xa8, 0x50, 0x19];

/// Decodes `.pth` buffers into [`Checkpoint`]s.
///
/// A reader holds configuration only. Every call builds its own storage table, so one
/// reader can be shared between threads.
#[derive(Debug, Clone, Default)]
pub struct CheckpointReader {
    config: DecoderConfig,
}

impl CheckpointReader {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Runs the archive strategy, then the legacy strategy under each configured encoding.
    ///
    /// # Arguments
    ///
    /// * `buffer` - The full contents of a `.pth` file.
    ///
    /// # Returns
    ///
    /// The checkpoint of the first successful strategy, or the error of the last one tried.
    pub fn decode(&self, buffer: &[u8]) -> Result<Checkpoint, CheckpointDecodeError> {
        let mut last = match self.try_archive(buffer) {
            Ok(checkpoint) => {
                log::info!("Decoded archive checkpoint with {} entries", checkpoint.len());
                return Ok(checkpoint);
            }
            Err(err) => {
                log::info!("Archive loading failed: {err}, trying legacy pickle format");
                err
            }
        };

        for &encoding in &self.config.legacy_encodings {
            match self.try_legacy(buffer, encoding) {
                Ok(checkpoint) => {
                    log::info!(
                        "Decoded legacy checkpoint with {encoding} encoding, {} entries",
                        checkpoint.len()
                    );
                    return Ok(checkpoint);
                }
                Err(err) => {
                    log::debug!("Legacy loading with {encoding} encoding failed: {err}");
                    last = err;
                }
            }
        }

        log::warn!("Failed to decode checkpoint with all strategies: {last}");
        Err(CheckpointDecodeError::new(last))
    }

    /// Decodes `buffer` as a ZIP archive.
    ///
    /// Each pickle candidate must replay and convert end to end; the first that does wins.
    pub fn try_archive(&self, buffer: &[u8]) -> Result<Checkpoint, AttemptError> {
        let mut archive = ArchiveSource::new(buffer)?;
        log::debug!("Archive entries: {:?}", archive.names());

        let candidates =
            archive.pickle_candidates(&self.config.pickle_paths, self.config.scan_archive);
        let mut last = None;
        for path in candidates {
            log::debug!("Found pickle at {path}");
            match self.decode_archive_pickle(&mut archive, &path) {
                Ok(checkpoint) => return Ok(checkpoint),
                Err(err) => {
                    log::warn!("Failed to load {path}: {err}");
                    last = Some(err);
                }
            }
        }

        Err(last.unwrap_or_else(|| AttemptError::MissingPickle(archive.names().to_vec())))
    }

    fn decode_archive_pickle(
        &self,
        archive: &mut ArchiveSource<'_>,
        path: &str,
    ) -> Result<Checkpoint, AttemptError> {
        let data = archive.read(path).map_err(ZipError::Io)?;
        let data_dirs = data_dirs_for(path, &self.config.data_dirs);
        let mut storages =
            StorageTable::with_archive(archive, data_dirs).with_fill_limit(self.config.fill_limit);
        let root = Unpickler::new(&data, StringEncoding::Latin1, &mut storages).load()?;
        log::debug!("Resolved {} storages from {path}", storages.len());
        Checkpoint::from_object(&root)
    }

    /// Decodes `buffer` as a legacy pickle stream.
    ///
    /// A plain pickle is taken as the root object. A stream that opens with the legacy
    /// magic number is read as the multi-pickle layout instead, and its trailing storage
    /// blobs fill the storages the root references.
    pub fn try_legacy(
        &self,
        buffer: &[u8],
        encoding: StringEncoding,
    ) -> Result<Checkpoint, AttemptError> {
        let mut storages = StorageTable::detached().with_fill_limit(self.config.fill_limit);
        let mut unpickler = Unpickler::new(buffer, encoding, &mut storages);
        let first = unpickler.load()?;

        if !self.config.legacy_storages || !is_legacy_magic_number(&first) {
            return Checkpoint::from_object(&first);
        }

        log::debug!("Legacy magic number found, reading multi-pickle layout");
        let protocol = unpickler.load()?;
        log::debug!("Legacy protocol version: {:?}", protocol.as_int());
        let _sys_info = unpickler.load()?;
        let root = unpickler.load()?;
        let keys = storage_keys(&unpickler.load()?);
        let blobs = buffer.get(unpickler.position()..).unwrap_or_default();
        fill_legacy_storages(unpickler.loader(), &keys, blobs);

        Checkpoint::from_object(&root)
    }
}

/// Decodes `buffer` with the default configuration.
pub fn decode(buffer: &[u8]) -> Result<Checkpoint, CheckpointDecodeError> {
    CheckpointReader::default().decode(buffer)
}

fn is_legacy_magic_number(obj: &Object) -> bool {
    matches!(obj, Object::Long(bytes) if bytes.as_slice() == LEGACY_MAGIC_NUMBER)
}

fn storage_keys(obj: &Object) -> Vec<String> {
    match obj {
        Object::List(items) | Object::Tuple(items) => items
            .iter()
            .filter_map(|item| match item {
                Object::Int(key) => Some(key.to_string()),
                other => other.as_text().map(|key| key.into_owned()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Each blob is an `i64` element count followed by the raw elements of one storage.
fn fill_legacy_storages(storages: &StorageTable<'_, '_>, keys: &[String], blobs: &[u8]) {
    let mut reader = Cursor::new(blobs);
    for key in keys {
        let Some(storage) = storages.get(key) else {
            log::warn!("Legacy storage {key} is not referenced by the checkpoint, stopping");
            return;
        };
        let numel = match reader.read_i64::<LittleEndian>() {
            Ok(numel) => numel,
            Err(err) => {
                log::warn!("Could not read size of legacy storage {key}: {err}");
                return;
            }
        };

        let start = reader.position() as usize;
        let end = usize::try_from(numel)
            .ok()
            .and_then(|numel| numel.checked_mul(storage.element_type().size()))
            .and_then(|len| start.checked_add(len))
            .filter(|&end| end <= blobs.len());
        let Some(end) = end else {
            log::warn!("Legacy storage {key} of {numel} elements is truncated");
            return;
        };

        log::debug!("Loaded legacy storage {key}: {numel} elements");
        storage.resolve(StorageBytes::Loaded(blobs[start..end].to_vec()));
        reader.set_position(end as u64);
    }
}
