//! Storage stand-ins and the per-decode persistent-reference table.
//!
//! PyTorch pickles never inline tensor bytes. Each tensor points at a storage through a
//! persistent id, and the bytes live next to the pickle (archive entries) or after it
//! (legacy layout). A [`StorageTable`] is created for one decode call and owns every
//! [`StorageRecord`] it hands out, so tensors sharing a storage share one record.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::archive::ArchiveSource;
use super::pickle_reader::{Object, PersistentLoader, PickleError};

/// Element type of a storage, inferred from its PyTorch type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    #[default]
    Float32,
    Float64,
    Int64,
    Int32,
    Int16,
    Int8,
    UInt8,
}

impl ElementType {
    /// Maps a storage type tag such as `FloatStorage` or `torch.LongStorage`.
    ///
    /// Matching is by substring, so any tag naming one of the known families works.
    /// Unknown tags read as 4-byte floats.
    pub fn from_storage_tag(tag: &str) -> Self {
        if tag.contains("Float") {
            Self::Float32
        } else if tag.contains("Long") {
            Self::Int64
        } else if tag.contains("Double") {
            Self::Float64
        } else if tag.contains("Int") {
            Self::Int32
        } else if tag.contains("Short") {
            Self::Int16
        } else if tag.contains("Char") {
            Self::Int8
        } else if tag.contains("Byte") {
            Self::UInt8
        } else {
            Self::Float32
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Float64 | Self::Int64 => 8,
            Self::Float32 | Self::Int32 => 4,
            Self::Int16 => 2,
            Self::Int8 | Self::UInt8 => 1,
        }
    }

    /// The numpy-style label used in serialized output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int64 => "int64",
            Self::Int32 => "int32",
            Self::Int16 => "int16",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Decoded elements of a storage slice.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValues {
    Float(Vec<f64>),
    Int(Vec<i64>),
}

impl FlatValues {
    fn zeros(element_type: ElementType, count: usize) -> Self {
        if element_type.is_float() {
            Self::Float(vec![0.0; count])
        } else {
            Self::Int(vec![0; count])
        }
    }

    fn empty(element_type: ElementType) -> Self {
        Self::zeros(element_type, 0)
    }

    fn decode(element_type: ElementType, bytes: &[u8]) -> Self {
        let chunks = bytes.chunks_exact(element_type.size());
        match element_type {
            ElementType::Float32 => {
                Self::Float(chunks.map(|c| LittleEndian::read_f32(c) as f64).collect())
            }
            ElementType::Float64 => Self::Float(chunks.map(LittleEndian::read_f64).collect()),
            ElementType::Int64 => Self::Int(chunks.map(LittleEndian::read_i64).collect()),
            ElementType::Int32 => {
                Self::Int(chunks.map(|c| LittleEndian::read_i32(c) as i64).collect())
            }
            ElementType::Int16 => {
                Self::Int(chunks.map(|c| LittleEndian::read_i16(c) as i64).collect())
            }
            ElementType::Int8 => Self::Int(chunks.map(|c| c[0] as i8 as i64).collect()),
            ElementType::UInt8 => Self::Int(chunks.map(|c| c[0] as i64).collect()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float(values) => values.len(),
            Self::Int(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backing bytes of a resolved storage.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBytes {
    /// Raw little-endian bytes read from the checkpoint.
    Loaded(Vec<u8>),
    /// Placeholder of `n` zero elements; nothing is allocated until a tensor slices it.
    Zeros(usize),
}

/// Default for the largest number of zeros synthesized in place of missing bytes.
pub const DEFAULT_FILL_LIMIT: usize = 1 << 26;

/// Stand-in for a PyTorch storage object.
#[derive(Debug)]
pub struct StorageRecord {
    persistent_id: String,
    element_type: ElementType,
    bytes: RefCell<Option<StorageBytes>>,
    fill_limit: usize,
}

impl StorageRecord {
    /// A storage whose bytes are not known (yet).
    pub fn unresolved(persistent_id: impl Into<String>, element_type: ElementType) -> Self {
        Self {
            persistent_id: persistent_id.into(),
            element_type,
            bytes: RefCell::new(None),
            fill_limit: DEFAULT_FILL_LIMIT,
        }
    }

    pub fn loaded(
        persistent_id: impl Into<String>,
        element_type: ElementType,
        bytes: Vec<u8>,
    ) -> Self {
        let record = Self::unresolved(persistent_id, element_type);
        record.resolve(StorageBytes::Loaded(bytes));
        record
    }

    pub fn placeholder(
        persistent_id: impl Into<String>,
        element_type: ElementType,
        numel: usize,
    ) -> Self {
        let record = Self::unresolved(persistent_id, element_type);
        record.resolve(StorageBytes::Zeros(numel));
        record
    }

    /// Caps how many zeros a read may synthesize. Larger requests read as empty.
    pub fn with_fill_limit(mut self, fill_limit: usize) -> Self {
        self.fill_limit = fill_limit;
        self
    }

    pub fn fill_limit(&self) -> usize {
        self.fill_limit
    }

    pub fn persistent_id(&self) -> &str {
        &self.persistent_id
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Replaces the backing bytes; every tensor viewing this storage observes the change.
    pub fn resolve(&self, bytes: StorageBytes) {
        *self.bytes.borrow_mut() = Some(bytes);
    }

    pub fn is_resolved(&self) -> bool {
        self.bytes.borrow().is_some()
    }

    /// Number of whole elements available, or `None` while unresolved.
    pub fn element_count(&self) -> Option<usize> {
        self.bytes.borrow().as_ref().map(|bytes| match bytes {
            StorageBytes::Loaded(raw) => raw.len() / self.element_type.size(),
            StorageBytes::Zeros(n) => *n,
        })
    }

    /// Reads up to `count` elements starting at element `offset`.
    ///
    /// The range is clamped to the storage length, so the result may be shorter than
    /// requested. Returns `None` while the storage is unresolved.
    pub fn read(&self, offset: usize, count: usize) -> Option<FlatValues> {
        let bytes = self.bytes.borrow();
        let available = match bytes.as_ref()? {
            StorageBytes::Loaded(raw) => raw.len() / self.element_type.size(),
            StorageBytes::Zeros(n) => *n,
        };
        if offset >= available {
            return Some(FlatValues::empty(self.element_type));
        }
        let end = offset.saturating_add(count).min(available);

        Some(match bytes.as_ref()? {
            StorageBytes::Loaded(raw) => {
                let size = self.element_type.size();
                FlatValues::decode(self.element_type, &raw[offset * size..end * size])
            }
            StorageBytes::Zeros(_) => self.zeros(end - offset),
        })
    }

    /// Reads `count` elements, treating an unresolved storage as zeros.
    pub fn read_or_zeros(&self, offset: usize, count: usize) -> FlatValues {
        self.read(offset, count).unwrap_or_else(|| self.zeros(count))
    }

    fn zeros(&self, count: usize) -> FlatValues {
        if count > self.fill_limit {
            log::warn!(
                "Storage {} would need {count} zero elements, more than the limit of {}; \
                 leaving it empty",
                self.persistent_id,
                self.fill_limit
            );
            return FlatValues::empty(self.element_type);
        }
        FlatValues::zeros(self.element_type, count)
    }

    /// Every element of the storage, or nothing when unresolved.
    pub fn read_all(&self) -> FlatValues {
        self.read(0, usize::MAX)
            .unwrap_or_else(|| FlatValues::empty(self.element_type))
    }
}

/// Resolution table for persistent references, scoped to one decode call.
pub struct StorageTable<'s, 'a> {
    archive: Option<&'s mut ArchiveSource<'a>>,
    data_dirs: Vec<String>,
    storages: IndexMap<String, Rc<StorageRecord>>,
    fill_limit: usize,
}

impl<'s, 'a> StorageTable<'s, 'a> {
    /// A table with no side channel; every storage is a placeholder.
    pub fn detached() -> Self {
        Self {
            archive: None,
            data_dirs: Vec::new(),
            storages: IndexMap::new(),
            fill_limit: DEFAULT_FILL_LIMIT,
        }
    }

    /// A table that reads storage bytes from `<dir>/<key>` entries of `archive`.
    pub fn with_archive(archive: &'s mut ArchiveSource<'a>, data_dirs: Vec<String>) -> Self {
        Self {
            archive: Some(archive),
            data_dirs,
            storages: IndexMap::new(),
            fill_limit: DEFAULT_FILL_LIMIT,
        }
    }

    /// Fill limit handed to every storage this table creates.
    pub fn with_fill_limit(mut self, fill_limit: usize) -> Self {
        self.fill_limit = fill_limit;
        self
    }

    /// A previously resolved storage.
    pub fn get(&self, key: &str) -> Option<Rc<StorageRecord>> {
        self.storages.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    fn read_entry(&mut self, key: &str) -> Option<Vec<u8>> {
        let archive = self.archive.as_deref_mut()?;
        let path = archive.data_entry(&self.data_dirs, key)?;
        log::debug!("Loading storage from archive: {path}");
        match archive.read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                log::warn!("Error loading storage {key} from {path}: {err}");
                None
            }
        }
    }

    fn resolve_by_id(&mut self, id: &str) -> Rc<StorageRecord> {
        if let Some(storage) = self.storages.get(id) {
            return storage.clone();
        }
        let record = match self.read_entry(id) {
            Some(bytes) => StorageRecord::loaded(id, ElementType::Float32, bytes),
            None => StorageRecord::unresolved(id, ElementType::Float32),
        };
        let record = Rc::new(record.with_fill_limit(self.fill_limit));
        self.storages.insert(id.to_string(), record.clone());
        record
    }

    fn resolve_tagged(&mut self, items: &[Object]) -> Rc<StorageRecord> {
        let element_type = ElementType::from_storage_tag(&storage_tag(&items[1]));
        let key = items[2]
            .as_text()
            .map(|key| key.into_owned())
            .unwrap_or_else(|| match &items[2] {
                Object::Int(i) => i.to_string(),
                other => format!("{other:?}"),
            });

        if let Some(storage) = self.storages.get(&key) {
            return storage.clone();
        }

        let record = match self.read_entry(&key) {
            Some(bytes) => {
                log::debug!(
                    "Loaded storage {key}: {} elements of {element_type}",
                    bytes.len() / element_type.size()
                );
                StorageRecord::loaded(key.clone(), element_type, bytes)
            }
            None => {
                let numel = match &items[4] {
                    Object::Int(n) => usize::try_from(*n).unwrap_or(0),
                    _ => 0,
                };
                StorageRecord::placeholder(key.clone(), element_type, numel)
            }
        };
        let record = Rc::new(record.with_fill_limit(self.fill_limit));
        self.storages.insert(key, record.clone());
        record
    }
}

impl PersistentLoader for StorageTable<'_, '_> {
    fn persistent_load(&mut self, pid: Object) -> Result<Object, PickleError> {
        // Protocol 0 writes the id as a plain string.
        if let Some(id) = pid.as_text() {
            return Ok(Object::Storage(self.resolve_by_id(&id)));
        }

        // ('storage', storage_type, key, location, numel, [view_metadata])
        if let Object::Tuple(items) = &pid
            && items.len() >= 5
            && items[0].as_text().as_deref() == Some("storage")
        {
            return Ok(Object::Storage(self.resolve_tagged(items)));
        }

        Ok(pid)
    }
}

fn storage_tag(obj: &Object) -> String {
    match obj {
        Object::Global(global) => global.name.clone(),
        other => other.as_text().map(|s| s.into_owned()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pytorch::pickle_reader::Global;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn storage_tags_map_to_element_types() {
        let cases = [
            ("FloatStorage", ElementType::Float32),
            ("LongStorage", ElementType::Int64),
            ("DoubleStorage", ElementType::Float64),
            ("IntStorage", ElementType::Int32),
            ("ShortStorage", ElementType::Int16),
            ("CharStorage", ElementType::Int8),
            ("ByteStorage", ElementType::UInt8),
            ("torch.LongStorage", ElementType::Int64),
            ("HalfStorage", ElementType::Float32),
            ("", ElementType::Float32),
        ];
        for (tag, expected) in cases {
            assert_eq!(ElementType::from_storage_tag(tag), expected, "tag {tag}");
        }
    }

    #[test]
    fn element_type_labels_match_serde_names() {
        for ty in [
            ElementType::Float32,
            ElementType::Float64,
            ElementType::Int64,
            ElementType::Int32,
            ElementType::Int16,
            ElementType::Int8,
            ElementType::UInt8,
        ] {
            let json = serde_json::to_value(ty).unwrap();
            assert_eq!(json, serde_json::Value::String(ty.label().to_string()));
        }
    }

    #[test]
    fn read_clamps_to_available_elements() {
        let storage =
            StorageRecord::loaded("0", ElementType::Float32, f32_bytes(&[1.0, 2.0, 3.0]));

        assert_eq!(storage.element_count(), Some(3));
        assert_eq!(storage.read(1, 10), Some(FlatValues::Float(vec![2.0, 3.0])));
        assert_eq!(storage.read(5, 2), Some(FlatValues::Float(vec![])));
    }

    #[test]
    fn read_ignores_trailing_partial_element() {
        let mut bytes = f32_bytes(&[4.0]);
        bytes.push(0xff);
        let storage = StorageRecord::loaded("0", ElementType::Float32, bytes);

        assert_eq!(storage.read_all(), FlatValues::Float(vec![4.0]));
    }

    #[test]
    fn integer_storages_decode_little_endian() {
        let bytes: Vec<u8> = [-2i64, 7].iter().flat_map(|v| v.to_le_bytes()).collect();
        let storage = StorageRecord::loaded("0", ElementType::Int64, bytes);
        assert_eq!(storage.read_all(), FlatValues::Int(vec![-2, 7]));

        let storage = StorageRecord::loaded("1", ElementType::Int8, vec![0xff, 0x01]);
        assert_eq!(storage.read_all(), FlatValues::Int(vec![-1, 1]));

        let storage = StorageRecord::loaded("2", ElementType::UInt8, vec![0xff, 0x01]);
        assert_eq!(storage.read_all(), FlatValues::Int(vec![255, 1]));
    }

    #[test]
    fn placeholder_only_materializes_requested_slice() {
        let storage = StorageRecord::placeholder("0", ElementType::Int32, 1 << 40);
        assert_eq!(storage.read(10, 3), Some(FlatValues::Int(vec![0, 0, 0])));
    }

    #[test]
    fn zero_fill_above_the_limit_reads_empty() {
        let storage = StorageRecord::unresolved("x", ElementType::Int64).with_fill_limit(4);
        assert_eq!(storage.read_or_zeros(0, 4), FlatValues::Int(vec![0; 4]));
        assert_eq!(storage.read_or_zeros(0, 5), FlatValues::Int(vec![]));
        assert_eq!(storage.read_or_zeros(0, usize::MAX), FlatValues::Int(vec![]));

        let storage =
            StorageRecord::placeholder("y", ElementType::Float32, 1 << 62).with_fill_limit(4);
        assert_eq!(storage.read(1, 2), Some(FlatValues::Float(vec![0.0, 0.0])));
        assert_eq!(storage.read_all(), FlatValues::Float(vec![]));
    }

    #[test]
    fn table_passes_its_fill_limit_to_storages() {
        let mut table = StorageTable::detached().with_fill_limit(3);
        let Object::Storage(storage) = table.persistent_load(Object::String("0".into())).unwrap()
        else {
            panic!("expected a storage");
        };
        assert_eq!(storage.fill_limit(), 3);
    }

    #[test]
    fn unresolved_storage_reads_as_zeros_on_request() {
        let storage = StorageRecord::unresolved("x", ElementType::Float32);
        assert!(!storage.is_resolved());
        assert_eq!(storage.read(0, 2), None);
        assert_eq!(storage.read_or_zeros(0, 2), FlatValues::Float(vec![0.0, 0.0]));

        storage.resolve(StorageBytes::Loaded(f32_bytes(&[9.0])));
        assert_eq!(storage.read(0, 2), Some(FlatValues::Float(vec![9.0])));
    }

    #[test]
    fn tuple_references_are_memoized_by_key() {
        let mut table = StorageTable::detached();
        let pid = || {
            Object::Tuple(vec![
                Object::String("storage".into()),
                Object::Global(Global::new("torch", "LongStorage")),
                Object::String("7".into()),
                Object::String("cpu".into()),
                Object::Int(3),
            ])
        };

        let first = table.persistent_load(pid()).unwrap();
        let second = table.persistent_load(pid()).unwrap();

        match (first, second) {
            (Object::Storage(a), Object::Storage(b)) => {
                assert!(Rc::ptr_eq(&a, &b));
                assert_eq!(a.element_type(), ElementType::Int64);
                assert_eq!(a.read_all(), FlatValues::Int(vec![0, 0, 0]));
            }
            other => panic!("expected storages, got {other:?}"),
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unrecognized_references_pass_through() {
        let mut table = StorageTable::detached();
        let pid = Object::Tuple(vec![Object::String("module".into()), Object::Int(1)]);

        let resolved = table.persistent_load(pid).unwrap();

        assert!(matches!(resolved, Object::Tuple(items) if items.len() == 2));
        assert!(table.is_empty());
    }
}
