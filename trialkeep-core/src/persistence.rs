//! Crash-safe file writes used for checkpoint items, metrics records and
//! study state, plus write-once debug artifacts shared by all workers.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Hidden sibling that receives the bytes before the rename. The leading dot
/// keeps it out of checkpoint name parsing.
pub fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.partial"))
}

/// Replace `path` with `data` so readers see either the old file or the
/// complete new one.
///
/// The bytes are flushed to disk before the rename; a crash in between leaves
/// only the staging file behind.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let staging = staging_path(path);
    let mut file = File::create(&staging)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&staging, path)
}

/// [`atomic_write`] of `value` rendered as pretty JSON.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let mut buf = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    buf.push(b'\n');
    atomic_write(path, &buf)
}

/// Read a JSON record; a missing file is `Ok(None)` and malformed content is
/// `InvalidData`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a debug file only if it does not exist yet.
///
/// Every worker of a job may call this with identical content, so the first
/// successful writer wins. Losing the race (`AlreadyExists`) or having the
/// target directory disappear underneath us (`NotFound`) is logged and
/// reported as `Ok(false)`. Returns `Ok(true)` when this call wrote the file.
pub fn write_file_once(path: &Path, content: &str) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path);
    let mut file = match file {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %path.display(), "Debug file already written by another process");
            return Ok(false);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %path.display(),
                "Cannot write debug file as another process is writing to the same file; \
                 any successful write has the same content"
            );
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    file.write_all(content.as_bytes())?;
    Ok(true)
}
