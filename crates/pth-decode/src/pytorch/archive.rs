//! In-memory ZIP access for the archive checkpoint layout.
//!
//! Newer `torch.save` output is a ZIP whose root directory is named after the file stem:
//!
//! ```text
//! archive/data.pkl        pickled object graph
//! archive/data/0          raw bytes of storage "0"
//! archive/.data/version   format metadata
//! ```

use std::io::{Cursor, Read};

use zip::ZipArchive;
use zip::result::ZipResult;

/// ZIP archive over a borrowed buffer.
pub struct ArchiveSource<'a> {
    archive: ZipArchive<Cursor<&'a [u8]>>,
    // Cache the entry names to avoid walking the central directory repeatedly
    names: Vec<String>,
}

impl<'a> ArchiveSource<'a> {
    /// Opens `buffer` as a ZIP archive.
    pub fn new(buffer: &'a [u8]) -> ZipResult<Self> {
        let archive = ZipArchive::new(Cursor::new(buffer))?;
        let names = archive.file_names().map(str::to_string).collect();
        Ok(Self { archive, names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Reads a whole entry.
    pub fn read(&mut self, name: &str) -> std::io::Result<Vec<u8>> {
        let mut file = self.archive.by_name(name)?;
        let mut contents = Vec::with_capacity(file.size().min(1 << 20) as usize);
        file.read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// Pickle entries to try, in order.
    ///
    /// The configured paths come first. With `scan`, any other entry named `*/data.pkl`
    /// follows in archive order.
    pub fn pickle_candidates(&self, known: &[String], scan: bool) -> Vec<String> {
        let mut candidates: Vec<String> = known
            .iter()
            .filter(|path| self.contains(path))
            .cloned()
            .collect();

        if scan {
            for name in &self.names {
                if name.ends_with("/data.pkl") && !candidates.contains(name) {
                    candidates.push(name.clone());
                }
            }
        }

        candidates
    }

    /// First `<dir>/<key>` entry present in the archive.
    pub fn data_entry(&self, dirs: &[String], key: &str) -> Option<String> {
        dirs.iter()
            .map(|dir| format!("{}/{}", dir.trim_end_matches('/'), key))
            .find(|path| self.contains(path))
    }
}

/// Data directories to search for the storages of the pickle at `pickle_path`.
///
/// `configured` directories come first, then `data` and `.data` next to the pickle.
pub fn data_dirs_for(pickle_path: &str, configured: &[String]) -> Vec<String> {
    let mut dirs = configured.to_vec();
    let prefix = match pickle_path.rsplit_once('/') {
        Some((prefix, _)) => format!("{prefix}/"),
        None => String::new(),
    };
    for dir in [format!("{prefix}data"), format!("{prefix}.data")] {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rejects_non_zip_buffers() {
        assert!(ArchiveSource::new(b"not a zip file").is_err());
    }

    #[test]
    fn lists_and_reads_entries() {
        let bytes = build_zip(&[("archive/data.pkl", b"pkl"), ("archive/.data/0", b"abcd")]);
        let mut archive = ArchiveSource::new(&bytes).unwrap();

        assert_eq!(archive.names().len(), 2);
        assert!(archive.contains("archive/.data/0"));
        assert_eq!(archive.read("archive/.data/0").unwrap(), b"abcd");
        assert!(archive.read("archive/.data/1").is_err());
    }

    #[test]
    fn known_pickle_paths_come_before_scanned_ones() {
        let bytes = build_zip(&[
            ("speaker/data.pkl", b""),
            ("archive/data.pkl", b""),
            ("data.pkl", b""),
        ]);
        let archive = ArchiveSource::new(&bytes).unwrap();
        let known = strings(&["data.pkl", "archive/data.pkl", "data/data.pkl"]);

        assert_eq!(
            archive.pickle_candidates(&known, true),
            strings(&["data.pkl", "archive/data.pkl", "speaker/data.pkl"])
        );
        assert_eq!(
            archive.pickle_candidates(&known, false),
            strings(&["data.pkl", "archive/data.pkl"])
        );
    }

    #[test]
    fn data_entry_uses_first_matching_directory() {
        let bytes = build_zip(&[("archive/data/3", b""), ("archive/.data/3", b"")]);
        let archive = ArchiveSource::new(&bytes).unwrap();

        let dirs = data_dirs_for("archive/data.pkl", &strings(&["archive/.data"]));
        assert_eq!(dirs, strings(&["archive/.data", "archive/data"]));
        assert_eq!(archive.data_entry(&dirs, "3").as_deref(), Some("archive/.data/3"));
        assert_eq!(archive.data_entry(&dirs, "4"), None);
    }

    #[test]
    fn root_pickle_searches_root_data_directories() {
        assert_eq!(
            data_dirs_for("data.pkl", &[]),
            strings(&["data", ".data"])
        );
    }
}
