//! NDJSON audit store: one JSON object per line, appended and synced to disk
//! before the append returns.
//!
//! A failed append is rolled back to the previous line boundary. A partial
//! trailing line left by a crash is cut off when the log is opened, and
//! readers skip one they run into.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::warn;

use super::{AuditFilter, AuditRecord, AuditStore};
use crate::error::GateError;

const TAIL_CHUNK: usize = 4096;

struct Writer {
    file: File,
    next_seq: u64,
    /// Length of the log after the last complete record we know of.
    len: u64,
}

pub struct NdjsonAuditStore {
    path: PathBuf,
    writer: Arc<Mutex<Writer>>,
}

impl std::fmt::Debug for NdjsonAuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdjsonAuditStore")
            .field("path", &self.path)
            .finish()
    }
}

impl NdjsonAuditStore {
    /// Open (or create) the log at `path`, continuing its sequence numbering.
    pub fn open(path: &Path) -> Result<Self, GateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                GateError::Internal(format!(
                    "failed to create audit directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_error("open", path, e))?;
        let len = trim_partial_tail(&file, path).map_err(|e| io_error("repair", path, e))?;
        let last_seq = read_records(path)?.last().map_or(0, |r| r.seq);

        Ok(Self {
            path: path.to_path_buf(),
            writer: Arc::new(Mutex::new(Writer {
                file,
                next_seq: last_seq + 1,
                len,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditStore for NdjsonAuditStore {
    async fn append(&self, mut record: AuditRecord) -> Result<AuditRecord, GateError> {
        let writer = Arc::clone(&self.writer);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            let on_disk = writer
                .file
                .metadata()
                .map_err(|e| io_error("inspect", &path, e))?
                .len();
            if on_disk != writer.len {
                // Someone else wrote to the file, or an earlier rollback failed.
                writer.len = trim_partial_tail(&writer.file, &path)
                    .map_err(|e| io_error("repair", &path, e))?;
            }

            record.seq = writer.next_seq;
            let mut line = serde_json::to_string(&record).map_err(|e| {
                GateError::Internal(format!("failed to serialize audit record: {e}"))
            })?;
            line.push('\n');

            let written = writer
                .file
                .write_all(line.as_bytes())
                .and_then(|()| writer.file.sync_data());
            if let Err(e) = written {
                let keep = writer.len;
                if let Err(rollback) = writer.file.set_len(keep) {
                    warn!(path = %path.display(), error = %rollback, "audit rollback failed");
                    // The record may have reached the disk; never reuse its number.
                    writer.next_seq += 1;
                }
                return Err(io_error("write", &path, e));
            }
            writer.len += line.len() as u64;
            writer.next_seq += 1;
            Ok(record)
        })
        .await
        .map_err(|e| GateError::Internal(format!("audit writer task failed: {e}")))?
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, GateError> {
        let path = self.path.clone();
        let filter = filter.clone();
        // Hold the writer lock so a half-written line is never read.
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let _guard = writer.lock().unwrap_or_else(|e| e.into_inner());
            let records = read_records(&path)?;
            Ok(filter.apply(records.iter()))
        })
        .await
        .map_err(|e| GateError::Internal(format!("audit reader task failed: {e}")))?
    }
}

fn io_error(action: &str, path: &Path, e: io::Error) -> GateError {
    GateError::Internal(format!("failed to {action} audit log '{}': {e}", path.display()))
}

/// Cut the log back to its last newline and return the new length.
fn trim_partial_tail(file: &File, path: &Path) -> io::Result<u64> {
    let len = file.metadata()?.len();
    let keep = last_line_end(path, len)?;
    if keep < len {
        warn!(
            path = %path.display(),
            dropped_bytes = len - keep,
            "dropping partial trailing audit line"
        );
        file.set_len(keep)?;
    }
    Ok(keep)
}

/// Offset just past the last `\n` in the first `len` bytes, or 0.
fn last_line_end(path: &Path, len: u64) -> io::Result<u64> {
    let mut reader = File::open(path)?;
    let mut buf = [0u8; TAIL_CHUNK];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK as u64);
        let chunk = &mut buf[..(end - start) as usize];
        reader.seek(SeekFrom::Start(start))?;
        reader.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + i as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

fn read_records(path: &Path) -> Result<Vec<AuditRecord>, GateError> {
    let file = File::open(path).map_err(|e| io_error("open", path, e))?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut line = String::new();
    let mut number = 0;
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| io_error("read", path, e))?;
        if read == 0 {
            break;
        }
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            // Only the unterminated last line can be an interrupted write.
            Err(_) if !line.ends_with('\n') => {
                warn!(path = %path.display(), line = number, "skipping partial trailing audit line");
                break;
            }
            Err(e) => {
                return Err(GateError::Internal(format!(
                    "corrupt audit record at {}:{number}: {e}",
                    path.display()
                )));
            }
        }
    }
    Ok(records)
}
