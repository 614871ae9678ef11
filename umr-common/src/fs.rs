//! Durable file helpers
//!
//! Every store in the pipeline that must survive a crash writes through
//! [`atomic_write`]: bytes go to a hidden temp file in the same directory,
//! the temp file is fsynced, renamed over the target, and the directory entry
//! is fsynced. A reader therefore sees either the old file, no file, or the
//! complete new file.

use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix used for in-flight temp files
pub const TEMP_SUFFIX: &str = ".tmp";

/// Write `bytes` to `path` and fsync the file
pub fn write_and_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

/// Fsync a directory so that renames inside it are durable
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    let f = OpenOptions::new().read(true).open(dir)?;
    f.sync_all()
}

/// Directory fsync is not supported on this platform; renames are trusted
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Hidden temp path next to `path` (`dir/.name.tmp`)
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

/// True for files produced by [`temp_path_for`]
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with('.') && n.ends_with(TEMP_SUFFIX)
        })
        .unwrap_or(false)
}

/// Write `bytes` to `path` atomically and durably
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_path_for(path);
    if let Err(e) = write_and_sync(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("{:x}", hash)
}
