//! Durable Event Queue
//!
//! Append-only newline-delimited record file with a sibling state file
//! tracking the committed read offset. Writers append with O_APPEND so
//! concurrent ingest workers are safe at record granularity; the pipeline
//! is the single reader and commits offsets via temp-file rename.
//!
//! Rotation: once the primary file passes the configured size it is renamed
//! aside, a fresh primary is started, and the rotated file is consumed to
//! completion before being deleted. A crash between batch processing and
//! offset commit replays the same records; processing is idempotent keyed
//! by event id.

use crate::config::DataPaths;
use crate::errors::{KaitError, QueueError, Result};
use crate::events::QueueEntry;
use crate::storage;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APPEND_RETRIES: u32 = 3;

/// Committed read position. `reading_rotated` means the offset refers to the
/// rotated file, which must be drained before the primary.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub reading_rotated: bool,
    #[serde(default)]
    pub offset: u64,
}

/// Uncommitted result of a batch read. Passing it to [`EventQueue::commit`]
/// advances the durable offset.
#[derive(Debug, Clone)]
pub struct ReadCursor {
    reading_rotated: bool,
    new_offset: u64,
    rotated_exhausted: bool,
}

pub struct EventQueue {
    primary: PathBuf,
    rotated: PathBuf,
    overflow: PathBuf,
    state_path: PathBuf,
    rotate_bytes: u64,
}

impl EventQueue {
    pub fn open(paths: &DataPaths, rotate_bytes: u64) -> Result<Self> {
        fs::create_dir_all(paths.queue_dir()).map_err(|e| {
            KaitError::Queue(QueueError::Io {
                path: paths.queue_dir(),
                message: e.to_string(),
            })
        })?;
        Ok(Self {
            primary: paths.queue_file(),
            rotated: paths.queue_rotated(),
            overflow: paths.queue_overflow(),
            state_path: paths.queue_state(),
            rotate_bytes,
        })
    }

    /// Append one entry. Retries with jitter, then falls back to the
    /// overflow sidecar so ingest never blocks on the primary.
    pub fn append(&self, entry: &QueueEntry) -> Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| KaitError::Queue(QueueError::AppendFailed(e.to_string())))?;

        for attempt in 0..APPEND_RETRIES {
            match append_line(&self.primary, &line) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, "Queue append failed: {}", e);
                    let jitter = 5 + rand::random_range(0..20u64) * (attempt as u64 + 1);
                    std::thread::sleep(Duration::from_millis(jitter));
                }
            }
        }

        append_line(&self.overflow, &line)
            .map_err(|e| KaitError::Queue(QueueError::AppendFailed(e.to_string())))
    }

    /// Read up to `max` entries past the committed offset without advancing
    /// it. Corrupt lines are skipped but still consume offset.
    pub fn read_batch(&self, max: usize) -> Result<(Vec<QueueEntry>, ReadCursor)> {
        let mut state = self.load_state()?;

        // A missing rotated file while the state points at it means it was
        // already drained and deleted; fall back to the primary.
        if state.reading_rotated && !self.rotated.exists() {
            tracing::warn!("Committed offset refers to a missing rotated file, resetting");
            state = QueueState::default();
        }

        let path = if state.reading_rotated {
            &self.rotated
        } else {
            &self.primary
        };

        if !path.exists() {
            return Ok((
                Vec::new(),
                ReadCursor {
                    reading_rotated: state.reading_rotated,
                    new_offset: state.offset,
                    rotated_exhausted: false,
                },
            ));
        }

        let file = fs::File::open(path).map_err(|e| {
            KaitError::Queue(QueueError::Io {
                path: path.clone(),
                message: e.to_string(),
            })
        })?;
        let file_len = file
            .metadata()
            .map(|m| m.len())
            .unwrap_or(state.offset);
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(state.offset))
            .map_err(|e| KaitError::Queue(QueueError::Io {
                path: path.clone(),
                message: e.to_string(),
            }))?;

        let mut entries = Vec::new();
        let mut offset = state.offset;
        let mut line = String::new();
        while entries.len() < max {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| KaitError::Queue(QueueError::Io {
                    path: path.clone(),
                    message: e.to_string(),
                }))?;
            if read == 0 {
                break;
            }
            // Only consume complete records; a partially flushed trailing
            // line is picked up on the next cycle.
            if !line.ends_with('\n') {
                break;
            }
            offset += read as u64;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<QueueEntry>(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("Skipping corrupt queue record: {}", e);
                }
            }
        }

        let rotated_exhausted = state.reading_rotated && offset >= file_len;
        Ok((
            entries,
            ReadCursor {
                reading_rotated: state.reading_rotated,
                new_offset: offset,
                rotated_exhausted,
            },
        ))
    }

    /// Durably commit a batch. Deletes the rotated file once drained and
    /// rewinds to the primary.
    pub fn commit(&self, cursor: &ReadCursor) -> Result<()> {
        let state = if cursor.rotated_exhausted {
            if self.rotated.exists() {
                fs::remove_file(&self.rotated).map_err(|e| {
                    KaitError::Queue(QueueError::Io {
                        path: self.rotated.clone(),
                        message: e.to_string(),
                    })
                })?;
            }
            QueueState::default()
        } else {
            QueueState {
                reading_rotated: cursor.reading_rotated,
                offset: cursor.new_offset,
            }
        };
        storage::write_json_atomic(&self.state_path, &state)
            .map_err(|e| KaitError::Queue(QueueError::StateCorrupted(e.to_string())))
    }

    /// Approximate number of uncommitted records.
    pub fn depth(&self) -> u64 {
        let state = self.load_state().unwrap_or_default();
        let mut depth = 0u64;
        if state.reading_rotated {
            depth += count_lines_from(&self.rotated, state.offset);
            depth += count_lines_from(&self.primary, 0);
        } else {
            depth += count_lines_from(&self.primary, state.offset);
        }
        depth + count_lines_from(&self.overflow, 0)
    }

    /// Fold the overflow sidecar back into the primary. Called by the
    /// pipeline during idle cycles.
    pub fn merge_overflow(&self) -> Result<usize> {
        if !self.overflow.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&self.overflow).map_err(|e| {
            KaitError::Queue(QueueError::Io {
                path: self.overflow.clone(),
                message: e.to_string(),
            })
        })?;
        let mut merged = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            append_line(&self.primary, line)
                .map_err(|e| KaitError::Queue(QueueError::AppendFailed(e.to_string())))?;
            merged += 1;
        }
        fs::remove_file(&self.overflow).map_err(|e| {
            KaitError::Queue(QueueError::Io {
                path: self.overflow.clone(),
                message: e.to_string(),
            })
        })?;
        Ok(merged)
    }

    /// Rotate the primary once it passes the size threshold. Only one
    /// rotated file exists at a time; rotation waits until the previous one
    /// is drained.
    pub fn rotate_if_needed(&self) -> Result<bool> {
        if self.rotated.exists() {
            return Ok(false);
        }
        let size = match fs::metadata(&self.primary) {
            Ok(m) => m.len(),
            Err(_) => return Ok(false),
        };
        if size < self.rotate_bytes {
            return Ok(false);
        }

        fs::rename(&self.primary, &self.rotated)
            .map_err(|e| KaitError::Queue(QueueError::RotationFailed(e.to_string())))?;

        // The committed offset referred to the primary's content, which now
        // lives in the rotated file.
        let old = self.load_state()?;
        let state = QueueState {
            reading_rotated: true,
            offset: old.offset,
        };
        storage::write_json_atomic(&self.state_path, &state)
            .map_err(|e| KaitError::Queue(QueueError::StateCorrupted(e.to_string())))?;
        tracing::info!(bytes = size, "Rotated queue file");
        Ok(true)
    }

    fn load_state(&self) -> Result<QueueState> {
        storage::read_json_or_default(&self.state_path)
            .map_err(|e| KaitError::Queue(QueueError::StateCorrupted(e.to_string())))
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

fn count_lines_from(path: &Path, offset: u64) -> u64 {
    let Ok(file) = fs::File::open(path) else {
        return 0;
    };
    let mut reader = BufReader::new(file);
    if reader.seek(SeekFrom::Start(offset)).is_err() {
        return 0;
    }
    let mut count = 0;
    let mut line = String::new();
    while let Ok(read) = reader.read_line(&mut line) {
        if read == 0 {
            break;
        }
        if !line.trim().is_empty() {
            count += 1;
        }
        line.clear();
    }
    count
}
