//! Archive assembly: named byte buffers in, one zip buffer out.
//!
//! The optimizer repackages EPUBs and the CLI bundles batch outputs through
//! the [`Archiver`] trait; [`ZipArchiver`] is the bundled implementation.
//! Entries are written in the order given with a fixed timestamp, so the same
//! entries always yield the same bytes.

use crate::error::InkError;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCompression {
    Stored,
    Deflated,
}

/// One named file to place in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub compression: EntryCompression,
}

impl ArchiveEntry {
    pub fn stored(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            compression: EntryCompression::Stored,
        }
    }

    pub fn deflated(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            compression: EntryCompression::Deflated,
        }
    }
}

/// Packs named buffers into a single archive buffer.
pub trait Archiver: Send + Sync {
    fn assemble(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>, InkError>;
}

/// [`Archiver`] backed by the `zip` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipArchiver;

impl Archiver for ZipArchiver {
    fn assemble(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>, InkError> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        let base = SimpleFileOptions::default().last_modified_time(zip::DateTime::default());
        let stored = base.compression_method(CompressionMethod::Stored);
        let deflated = base.compression_method(CompressionMethod::Deflated);

        for entry in entries {
            let options = match entry.compression {
                EntryCompression::Stored => stored,
                EntryCompression::Deflated => deflated,
            };
            zip.start_file(entry.name.as_str(), options)
                .map_err(|e| InkError::Archive(format!("{}: {e}", entry.name)))?;
            zip.write_all(&entry.data)
                .map_err(|e| InkError::Archive(format!("{}: {e}", entry.name)))?;
        }

        let cursor = zip
            .finish()
            .map_err(|e| InkError::Archive(e.to_string()))?;
        Ok(cursor.into_inner())
    }
}

/// Upper bound on the bytes one archive may unpack to.
pub const MAX_UNPACKED_BYTES: u64 = 4 << 30;

/// Read every file entry of a zip buffer, in archive order. Directories are skipped.
pub(crate) fn read_zip_entries(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, String> {
    read_zip_entries_limited(bytes, MAX_UNPACKED_BYTES)
}

/// [`read_zip_entries`] with an explicit cap on the total unpacked size.
///
/// Declared entry sizes are never trusted for allocation; only bytes that
/// actually decompress count against `limit`.
pub(crate) fn read_zip_entries_limited(
    bytes: &[u8],
    limit: u64,
) -> Result<Vec<(String, Vec<u8>)>, String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let mut entries = Vec::with_capacity(archive.len());
    let mut remaining = limit;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| e.to_string())?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let hint = file.size().min(bytes.len() as u64).min(remaining);
        let mut data = Vec::with_capacity(hint as usize);
        let read = file
            .by_ref()
            .take(remaining.saturating_add(1))
            .read_to_end(&mut data)
            .map_err(|e| format!("{name}: {e}"))? as u64;
        if read > remaining {
            return Err(format!(
                "{name}: archive unpacks to more than {limit} bytes"
            ));
        }
        remaining -= read;
        entries.push((name, data));
    }
    Ok(entries)
}
