//! Archive container access.
//!
//! The firmware archive is a zip file whose first entry is the serialized
//! configuration (`meta.json`); every other entry is a resource payload
//! holding the resource's data bytes with holes elided. Entries are read
//! linearly in stored order.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use zip::read::ZipFile;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::config::{FwConfig, MANIFEST_ENTRY};
use crate::error::{FwForgeError, Result};

pub struct ArchiveReader {
    zip: ZipArchive<BufReader<File>>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            FwForgeError::Archive(format!("cannot open '{}': {e}", path.display()))
        })?;
        let zip = ZipArchive::new(BufReader::new(file))
            .map_err(|e| FwForgeError::Archive(format!("'{}': {e}", path.display())))?;
        Ok(ArchiveReader { zip })
    }

    /// Parse the configuration entry. Conventionally first, but located by
    /// name so reordered archives still apply.
    pub fn manifest(&mut self) -> Result<FwConfig> {
        let mut entry = self
            .zip
            .by_name(MANIFEST_ENTRY)
            .map_err(|_| FwForgeError::Archive(format!("archive has no {MANIFEST_ENTRY} entry")))?;
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .map_err(|e| FwForgeError::Archive(format!("cannot read {MANIFEST_ENTRY}: {e}")))?;
        FwConfig::from_json(&text)
    }

    pub fn entry_count(&self) -> usize {
        self.zip.len()
    }

    /// Open entry `index` in stored order for streaming.
    pub fn entry(&mut self, index: usize) -> Result<ZipFile<'_>> {
        self.zip
            .by_index(index)
            .map_err(|e| FwForgeError::Archive(format!("cannot read entry {index}: {e}")))
    }

    /// Open the data entry named `name`, if present.
    pub fn entry_by_name(&mut self, name: &str) -> Result<ZipFile<'_>> {
        self.zip
            .by_name(name)
            .map_err(|_| FwForgeError::Archive(format!("archive has no entry '{name}'")))
    }

    pub fn has_entry(&mut self, name: &str) -> bool {
        self.zip.by_name(name).is_ok()
    }
}

pub struct ArchiveWriter {
    zip: ZipWriter<BufWriter<File>>,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            FwForgeError::Archive(format!("cannot create '{}': {e}", path.display()))
        })?;
        Ok(ArchiveWriter {
            zip: ZipWriter::new(BufWriter::new(file)),
        })
    }

    fn options() -> FileOptions {
        FileOptions::default().compression_method(zip::CompressionMethod::Deflated)
    }

    /// Write the configuration as the first entry.
    pub fn write_manifest(&mut self, config: &FwConfig) -> Result<()> {
        self.start_entry(MANIFEST_ENTRY)?;
        self.zip
            .write_all(config.to_json()?.as_bytes())
            .map_err(|e| FwForgeError::Archive(format!("cannot write {MANIFEST_ENTRY}: {e}")))?;
        Ok(())
    }

    /// Begin a data entry; subsequent `write` calls stream its payload.
    pub fn start_entry(&mut self, name: &str) -> Result<()> {
        self.zip
            .start_file(name, Self::options())
            .map_err(|e| FwForgeError::Archive(format!("cannot start entry '{name}': {e}")))
    }

    pub fn finish(mut self) -> Result<()> {
        self.zip
            .finish()
            .map_err(|e| FwForgeError::Archive(format!("cannot finalize archive: {e}")))?;
        Ok(())
    }
}

impl Write for ArchiveWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.zip.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.zip.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.zip");

        let cfg = FwConfig::from_json(r#"{"meta": {"product": "demo"}}"#).unwrap();
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.write_manifest(&cfg).unwrap();
        writer.start_entry("boot.img").unwrap();
        writer.write_all(b"payload bytes").unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.entry_count(), 2);
        assert_eq!(
            reader.manifest().unwrap().meta.product.as_deref(),
            Some("demo")
        );

        // Manifest first, payloads after, in stored order.
        assert_eq!(reader.entry(0).unwrap().name(), MANIFEST_ENTRY);
        let mut entry = reader.entry(1).unwrap();
        assert_eq!(entry.name(), "boot.img");
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"payload bytes");
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.zip");

        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.start_entry("stray").unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert!(reader.manifest().is_err());
        assert!(reader.has_entry("stray"));
        assert!(!reader.has_entry("other"));
    }
}
