//! File-backed reconciliation log.
//!
//! One JSON object per line, appended and `fsync`ed before `record` returns. Entries
//! are never rewritten; a status change is appended as a new line for the same id and
//! the last line wins when the file is read back.
//!
//! Each append runs to completion on the blocking pool even if the caller is dropped
//! mid-write. A line without its trailing newline is a torn write from a crash: readers
//! skip it and [`FileReconciliationLog::open`] cuts it off before appending again.

use boxoffice_core::reconciliation::{
    CompensationOutcome, ReconciliationEntry, ReconciliationId, ReconciliationSink, ReconciliationStatus,
};
use boxoffice_core::{BoxFuture, DateTime, StoreError, Utc};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

/// Append-only JSON-lines reconciliation log.
#[derive(Debug)]
pub struct FileReconciliationLog {
    path: PathBuf,
    state: Mutex<JournalState>,
}

#[derive(Debug)]
struct JournalState {
    file: Arc<std::sync::Mutex<File>>,
    next_id: ReconciliationId,
}

impl FileReconciliationLog {
    /// Open (or create) the journal at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened or an existing line is not
    /// a valid entry.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let existing = read_entries(&path).await?;
        let next_id = existing.keys().next_back().map_or(1, |id| id + 1);

        let opened = path.clone();
        let file = tokio::task::spawn_blocking(move || open_for_append(&opened))
            .await
            .map_err(|e| StoreError::Unavailable(format!("journal open task failed: {e}")))?
            .map_err(|e| io_error(&path, &e))?;

        tracing::info!(path = %path.display(), entries = existing.len(), "Reconciliation journal opened");
        Ok(Self {
            path,
            state: Mutex::new(JournalState {
                file: Arc::new(std::sync::Mutex::new(file)),
                next_id,
            }),
        })
    }

    /// Journal location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry, latest status per id, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read.
    pub async fn entries(&self) -> Result<Vec<ReconciliationEntry>, StoreError> {
        let _guard = self.state.lock().await;
        Ok(read_entries(&self.path).await?.into_values().collect())
    }

    /// Entries still awaiting an operator.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read.
    pub async fn list_pending(&self) -> Result<Vec<ReconciliationEntry>, StoreError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.status == ReconciliationStatus::Pending)
            .collect())
    }

    /// Close a pending entry as resolved or discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has this id.
    pub async fn close(
        &self,
        id: ReconciliationId,
        status: ReconciliationStatus,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationEntry, StoreError> {
        let mut state = self.state.lock().await;
        let mut entry = read_entries(&self.path)
            .await?
            .remove(&id)
            .filter(|entry| entry.status == ReconciliationStatus::Pending)
            .ok_or(StoreError::NotFound)?;

        entry.status = status;
        entry.resolved_at = Some(at);
        entry.resolved_by = Some(resolved_by.to_string());
        entry.resolution_notes = notes.map(str::to_string);
        append(&state.file, &self.path, &entry).await?;
        Ok(entry)
    }
}

impl ReconciliationSink for FileReconciliationLog {
    fn record(
        &self,
        outcome: CompensationOutcome,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<ReconciliationId, StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            // Taken up front so a write that outlives a dropped caller never shares its id
            let id = state.next_id;
            state.next_id += 1;
            let entry = ReconciliationEntry {
                id,
                severity: outcome.severity(),
                status: outcome.initial_status(),
                outcome,
                recorded_at: at,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            };
            append(&state.file, &self.path, &entry).await?;
            Ok(id)
        })
    }
}

async fn append(
    file: &Arc<std::sync::Mutex<File>>,
    path: &Path,
    entry: &ReconciliationEntry,
) -> Result<(), StoreError> {
    let mut line = serde_json::to_vec(entry).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    line.push(b'\n');

    let file = Arc::clone(file);
    tokio::task::spawn_blocking(move || {
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.sync_data()
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("journal write task failed: {e}")))?
    .map_err(|e| io_error(path, &e))
}

/// Open for appending, cutting off a torn last line first.
fn open_for_append(path: &Path) -> std::io::Result<File> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    let contents = std::fs::read(path)?;
    let complete = complete_len(&contents);
    if complete < contents.len() {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = contents.len() - complete,
            "Discarding torn last line of reconciliation journal"
        );
        file.set_len(complete as u64)?;
        file.sync_data()?;
    }
    Ok(file)
}

/// Length of the prefix made of newline-terminated lines.
fn complete_len(contents: &[u8]) -> usize {
    contents.iter().rposition(|&b| b == b'\n').map_or(0, |last| last + 1)
}

async fn read_entries(path: &Path) -> Result<BTreeMap<ReconciliationId, ReconciliationEntry>, StoreError> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(io_error(path, &e)),
    };

    let mut entries = BTreeMap::new();
    for line in contents[..complete_len(&contents)].split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let entry: ReconciliationEntry = serde_json::from_slice(line)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        entries.insert(entry.id, entry);
    }
    Ok(entries)
}

fn io_error(path: &Path, error: &std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {error}", path.display()))
}
