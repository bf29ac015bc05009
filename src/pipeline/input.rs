//! Input resolution: expand user-supplied paths into package files and load them.
//!
//! A path may name a file (taken as-is) or a directory (its entries with a
//! matching extension, optionally recursing). Loading checks the zip magic
//! (`PK\x03\x04`, or `PK\x05\x06` for an empty archive) so callers get a
//! meaningful error instead of a parser failure deep inside the pipeline.

use crate::batch::BatchInput;
use crate::error::InkError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const EMPTY_ZIP_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// Package extensions accepted by the container converter.
pub const CONVERT_EXTENSIONS: &[&str] = &["cbz", "zip"];

/// Package extensions accepted by the optimizer.
pub const OPTIMIZE_EXTENSIONS: &[&str] = &["epub"];

/// Expand files and directories into a sorted, deduplicated list of package paths.
pub fn resolve_inputs(
    paths: &[PathBuf],
    extensions: &[&str],
    recursive: bool,
) -> Result<Vec<PathBuf>, InkError> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            collect_dir(path, extensions, recursive, &mut found)?;
            found.sort();
            debug!("{}: {} matching files", path.display(), found.len());
            out.extend(found);
        } else if path.exists() {
            out.push(path.clone());
        } else {
            return Err(InkError::FileNotFound { path: path.clone() });
        }
    }
    let mut seen = std::collections::HashSet::new();
    out.retain(|p| seen.insert(p.clone()));
    Ok(out)
}

fn collect_dir(
    dir: &Path,
    extensions: &[&str],
    recursive: bool,
    out: &mut Vec<PathBuf>,
) -> Result<(), InkError> {
    let entries = std::fs::read_dir(dir).map_err(|e| read_error(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| read_error(dir, e))?.path();
        if path.is_dir() {
            if recursive {
                collect_dir(&path, extensions, recursive, out)?;
            }
        } else if has_extension(&path, extensions) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|x| ext.eq_ignore_ascii_case(x)))
}

fn read_error(path: &Path, e: std::io::Error) -> InkError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => InkError::PermissionDenied {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::NotFound => InkError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => InkError::InputReadFailed {
            path: path.to_path_buf(),
            source: e,
        },
    }
}

/// Read a package file and validate its zip magic.
pub async fn load_input(path: &Path) -> Result<BatchInput, InkError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| read_error(path, e))?;

    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    if magic != ZIP_MAGIC && magic != EMPTY_ZIP_MAGIC {
        return Err(InkError::NotAPackage {
            path: path.to_path_buf(),
            magic,
        });
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    debug!("Loaded {} ({} bytes)", path.display(), bytes.len());
    Ok(BatchInput::new(name, bytes))
}

/// `dir/book.epub` → `book`.
pub fn output_stem(input_name: &str) -> String {
    Path::new(input_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "output".to_string())
}

/// Output stems for a batch, in input order, with no two equal.
///
/// Comparison ignores ASCII case, since outputs often land on
/// case-insensitive filesystems. Later duplicates get `-2`, `-3`, ...
pub fn unique_stems<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut taken = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let base = output_stem(name);
            let mut stem = base.clone();
            let mut n = 2;
            while !taken.insert(stem.to_ascii_lowercase()) {
                stem = format!("{base}-{n}");
                n += 1;
            }
            if stem != base {
                debug!("{} collides with an earlier input; writing as {}", name, stem);
            }
            stem
        })
        .collect()
}
