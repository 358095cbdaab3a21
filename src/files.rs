//! The versioned-file discipline and low-level file plumbing.
//!
//! Nothing in an election directory is ever modified in place: a new
//! version of a table is a new file `<prefix><label><suffix>` whose label
//! sorts after the old one (the empty label sorts before all others).
//! The *operative* file of a (prefix, suffix) pair is the one with the
//! lexicographically greatest label. Collection managers upload newer
//! audited-vote versions at any time; a stage freezes its view by hashing
//! the operative files it loads.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Context, ContextCompat, Result};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::AuditError;

/// Transient I/O errors are retried this many times before surfacing.
const IO_RETRIES: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Find the operative version of `<prefix><label><suffix>` in `dir`.
///
/// Returns the path and its label, or `None` when no version exists.
pub fn operative(dir: &Path, prefix: &str, suffix: &str) -> Result<Option<(PathBuf, String)>> {
    let pattern = format!(
        "{}/{}*{}",
        dir.display(),
        glob::Pattern::escape(prefix),
        glob::Pattern::escape(suffix)
    );
    let mut best: Option<(PathBuf, String)> = None;
    for entry in glob::glob(&pattern).with_context(|| format!("bad glob pattern {pattern}"))? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let label = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix));
        if let Some(label) = label {
            if best.as_ref().map_or(true, |(_, b)| label > b.as_str()) {
                best = Some((path.clone(), label.to_string()));
            }
        }
    }
    Ok(best)
}

/// Like [`operative`], but a missing file is a [`AuditError::MissingInput`].
pub fn require_operative(dir: &Path, prefix: &str, suffix: &str) -> Result<(PathBuf, String)> {
    operative(dir, prefix, suffix)?.ok_or_else(|| {
        AuditError::MissingInput {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
        .into()
    })
}

/// Open-and-read with bounded retries for transient failures.
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut last_err = None;
    for attempt in 1..=IO_RETRIES {
        match fs::read(path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                warn!(
                    "read of {} failed (attempt {attempt}/{IO_RETRIES}): {e}",
                    path.display()
                );
                last_err = Some(e);
                std::thread::sleep(RETRY_PAUSE);
            }
        }
    }
    Err(last_err.unwrap()).with_context(|| format!("could not read {}", path.display()))
}

/// Streaming SHA-256 of a file, as lowercase 64-hex. Retried like
/// [`read_bytes`].
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut last_err = None;
    for attempt in 1..=IO_RETRIES {
        match try_sha256_file(path) {
            Ok(hex) => return Ok(hex),
            Err(e) => {
                warn!(
                    "hashing {} failed (attempt {attempt}/{IO_RETRIES}): {e}",
                    path.display()
                );
                last_err = Some(e);
                std::thread::sleep(RETRY_PAUSE);
            }
        }
    }
    Err(last_err.unwrap()).with_context(|| format!("could not hash {}", path.display()))
}

fn try_sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a set of input files for a stage snapshot, reporting paths
/// relative to `root` and rejecting duplicate content
/// ([`AuditError::FileIntegrity`] — two identical uploads under different
/// names are a mistake worth stopping for).
pub fn snapshot_digests(root: &Path, paths: &[PathBuf]) -> Result<Vec<(String, String)>> {
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let digest = sha256_file(path)?;
        if let Some(prev) = seen.get(&digest) {
            if prev != path {
                return Err(AuditError::FileIntegrity {
                    a: prev.clone(),
                    b: path.clone(),
                }
                .into());
            }
        }
        seen.insert(digest.clone(), path.clone());
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        out.push((rel, digest));
    }
    out.sort();
    Ok(out)
}

/// Write a file atomically: stage the bytes beside the target and rename
/// into place, so a crashed stage leaves no half-written output behind.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("could not create {}", parent.display()))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).with_context(|| format!("could not write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("could not move {} into place", tmp.display()))?;
    Ok(())
}
