//! Storage Primitives
//!
//! Shared persistence helpers used by every durable component:
//! - Atomic JSON snapshots (write to temp file then rename)
//! - Append-only newline-delimited JSON logs via O_APPEND
//! - Bounded logs that keep only the newest records

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Write a value as pretty JSON atomically.
///
/// Writes to a temp file in the target directory then renames, preventing
/// corruption if the process crashes mid-write or another instance writes
/// concurrently.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let data = serde_json::to_vec_pretty(value).context("Failed to serialize snapshot")?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(&data).context("Failed to write temp file")?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Replace a file's contents atomically via temp + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Load a JSON snapshot, returning the default when the file does not exist.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Append one record as a single JSON line. O_APPEND makes concurrent
/// appenders safe at record granularity.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(value).context("Failed to serialize record")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read every parseable record from a JSONL file. Corrupt lines are skipped
/// with a warning so one bad record cannot poison the store.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut records = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    file = %path.display(),
                    line = n + 1,
                    "Skipping corrupt record: {}",
                    e
                );
            }
        }
    }
    Ok(records)
}

/// Append to a JSONL log that is trimmed back to `max_lines` once it grows
/// past twice that size. Trimming rewrites atomically.
pub fn append_jsonl_bounded<T: Serialize>(path: &Path, value: &T, max_lines: usize) -> Result<()> {
    append_jsonl(path, value)?;

    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() > max_lines * 2 {
        let keep: Vec<&str> = lines[lines.len() - max_lines..].to_vec();
        let parent = path
            .parent()
            .with_context(|| format!("No parent directory for {}", path.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        for line in keep {
            writeln!(tmp, "{}", line)?;
        }
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("Failed to trim {}", path.display()))?;
    }
    Ok(())
}
