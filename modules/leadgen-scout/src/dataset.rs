//! JSON list files: every dataset the pipeline persists is a top-level array.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use leadgen_common::LeadgenError;

pub fn ensure_dir(dir: &Path) -> Result<(), LeadgenError> {
    fs::create_dir_all(dir).map_err(|source| LeadgenError::Write {
        path: dir.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> Result<Option<String>, LeadgenError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LeadgenError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Load a list. A missing or blank file is an empty list; malformed JSON is an error.
pub fn load_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LeadgenError> {
    match read(path)? {
        Some(text) if !text.trim().is_empty() => {
            serde_json::from_str(&text).map_err(|source| LeadgenError::Json {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => Ok(Vec::new()),
    }
}

/// Load a list, skipping items that do not deserialize as `T`.
/// A file that is not a JSON array at all is still an error.
pub fn load_list_lenient<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LeadgenError> {
    let values: Vec<serde_json::Value> = load_list(path)?;
    let total = values.len();
    let items: Vec<T> = values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    if items.len() < total {
        warn!(
            path = %path.display(),
            skipped = total - items.len(),
            "Skipped malformed records"
        );
    }
    Ok(items)
}

/// Write a list atomically: a temp file in the same directory is persisted over `path`.
pub fn save_list<T: Serialize>(path: &Path, items: &[T]) -> Result<(), LeadgenError> {
    save_json(path, &items)
}

pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), LeadgenError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(dir)?;

    let write_err = |source| LeadgenError::Write {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(value).map_err(|source| LeadgenError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(&json).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// `*.json` files directly under `dir`, sorted by name. A missing dir has none.
pub fn partition_files(dir: &Path) -> Result<Vec<PathBuf>, LeadgenError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LeadgenError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}
