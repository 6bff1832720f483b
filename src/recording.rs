//! Recording sessions: buffer filtered samples, persist them, list and
//! delete them.
//!
//! [`RecordingStore`] owns the in-memory capture buffer; a
//! [`SessionStorage`] decides where finished sessions live. Two storages
//! ship with the crate:
//!
//! * [`MemoryStorage`]: a sorted map, for tests and throwaway sessions.
//! * [`JsonDirStorage`]: one pretty-printed `<id>.json` file per session.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BioAmpError, Result};
use crate::parse::now_ms;

// ── Data ──────────────────────────────────────────────────────────────────────

/// One captured frame after filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSample {
    /// Milliseconds since Unix epoch.
    pub timestamp: f64,
    pub channels: Vec<f64>,
}

/// A finished, persisted recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub id: String,
    pub name: String,
    pub channels: usize,
    pub sample_rate: f64,
    pub data: Vec<RecordedSample>,
    /// `(last.timestamp − first.timestamp) / 1000`.
    pub duration_seconds: f64,
    /// Milliseconds since Unix epoch.
    pub created_at: f64,
}

impl RecordingSession {
    /// Build a session from buffered samples with a fresh id.
    pub fn new(name: impl Into<String>, channels: usize, sample_rate: f64, data: Vec<RecordedSample>) -> Self {
        let duration_seconds = match (data.first(), data.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp) / 1000.0,
            _ => 0.0,
        };
        Self {
            id: format!("rec_{}", Uuid::new_v4().simple()),
            name: name.into(),
            channels,
            sample_rate,
            data,
            duration_seconds,
            created_at: now_ms(),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// Where finished sessions are kept.
pub trait SessionStorage {
    fn create(&mut self, session: &RecordingSession) -> Result<()>;

    /// Every stored session, in any order.
    fn list(&self) -> Result<Vec<RecordingSession>>;

    /// Remove one session. Unknown ids are not an error.
    fn delete(&mut self, id: &str) -> Result<()>;

    fn delete_all(&mut self) -> Result<()>;
}

/// Sessions held in memory only.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    sessions: BTreeMap<String, RecordingSession>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn create(&mut self, session: &RecordingSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<RecordingSession>> {
        Ok(self.sessions.values().cloned().collect())
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }

    fn delete_all(&mut self) -> Result<()> {
        self.sessions.clear();
        Ok(())
    }
}

/// Sessions stored as `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirStorage {
    dir: PathBuf,
}

impl JsonDirStorage {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| BioAmpError::Storage(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(BioAmpError::Storage(format!("invalid session id {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn session_files(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| BioAmpError::Storage(format!("cannot read {}: {e}", self.dir.display())))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl SessionStorage for JsonDirStorage {
    fn create(&mut self, session: &RecordingSession) -> Result<()> {
        let path = self.path_for(&session.id)?;
        let json = serde_json::to_string_pretty(session)?;
        fs::write(&path, json)
            .map_err(|e| BioAmpError::Storage(format!("cannot write {}: {e}", path.display())))?;
        debug!("saved {}", path.display());
        Ok(())
    }

    fn list(&self) -> Result<Vec<RecordingSession>> {
        let mut sessions = Vec::new();
        for path in self.session_files()? {
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                // Deleted between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_str(&text) {
                Ok(s) => sessions.push(s),
                Err(e) => warn!("skipping unreadable session {}: {e}", path.display()),
            }
        }
        Ok(sessions)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BioAmpError::Storage(format!("cannot delete {}: {e}", path.display()))),
        }
    }

    fn delete_all(&mut self) -> Result<()> {
        for path in self.session_files()? {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(BioAmpError::Storage(format!(
                        "cannot delete {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Ok(())
    }
}

// ── RecordingStore ────────────────────────────────────────────────────────────

/// Capture buffer plus the storage finished sessions go to.
#[derive(Debug)]
pub struct RecordingStore<S> {
    storage: S,
    recording: bool,
    buffer: Vec<RecordedSample>,
}

impl<S: SessionStorage> RecordingStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            recording: false,
            buffer: Vec::new(),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Samples captured so far in the current recording.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer and start capturing.
    pub fn start_recording(&mut self) {
        self.buffer.clear();
        self.recording = true;
        info!("Recording started");
    }

    /// Capture one sample. Ignored unless recording.
    pub fn append(&mut self, timestamp: f64, channels: &[f64]) {
        if self.recording {
            self.buffer.push(RecordedSample {
                timestamp,
                channels: channels.to_vec(),
            });
        }
    }

    /// Stop capturing and persist what was captured.
    ///
    /// Returns `Ok(None)` and stores nothing if no sample was captured. If
    /// the storage rejects the session the error is returned and the samples
    /// stay buffered, so calling this again retries the save.
    pub fn stop_recording(
        &mut self,
        name: &str,
        channel_count: usize,
        sample_rate: f64,
    ) -> Result<Option<RecordingSession>> {
        self.recording = false;
        if self.buffer.is_empty() {
            info!("Recording stopped with no samples; nothing saved");
            return Ok(None);
        }

        let data = std::mem::take(&mut self.buffer);
        let session = RecordingSession::new(name, channel_count, sample_rate, data);
        if let Err(e) = self.storage.create(&session) {
            self.buffer = session.data;
            return Err(e);
        }
        info!(
            "Saved recording {:?} ({} samples, {:.1} s)",
            session.name,
            session.data.len(),
            session.duration_seconds
        );
        Ok(Some(session))
    }

    /// Every stored session, oldest first. Ties are broken by id.
    pub fn list_recordings(&self) -> Result<Vec<RecordingSession>> {
        let mut sessions = self.storage.list()?;
        sessions.sort_by(|a, b| {
            a.created_at
                .total_cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(sessions)
    }

    pub fn delete_recording(&mut self, id: &str) -> Result<()> {
        self.storage.delete(id)
    }

    pub fn delete_all_recordings(&mut self) -> Result<()> {
        self.storage.delete_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Storage that refuses the first `failures` saves.
    #[derive(Default)]
    struct Flaky {
        failures: usize,
        inner: MemoryStorage,
    }

    impl SessionStorage for Flaky {
        fn create(&mut self, session: &RecordingSession) -> Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(BioAmpError::Storage("quota exceeded".into()));
            }
            self.inner.create(session)
        }
        fn list(&self) -> Result<Vec<RecordingSession>> {
            self.inner.list()
        }
        fn delete(&mut self, id: &str) -> Result<()> {
            self.inner.delete(id)
        }
        fn delete_all(&mut self) -> Result<()> {
            self.inner.delete_all()
        }
    }

    #[test]
    fn duration_spans_first_to_last() {
        let mut store = RecordingStore::new(MemoryStorage::new());
        store.start_recording();
        for ts in [1000.0, 1500.0, 2000.0] {
            store.append(ts, &[1.0, 2.0]);
        }
        let s = store.stop_recording("walk", 2, 500.0).unwrap().unwrap();
        assert!((s.duration_seconds - 1.0).abs() < 1e-9);
        assert_eq!(s.data.len(), 3);
        assert!(s.id.starts_with("rec_"));
        assert!(!store.is_recording());
    }

    #[test]
    fn empty_recording_is_not_saved() {
        let mut store = RecordingStore::new(MemoryStorage::new());
        store.start_recording();
        assert_eq!(store.stop_recording("empty", 6, 500.0).unwrap(), None);
        assert!(store.list_recordings().unwrap().is_empty());
    }

    #[test]
    fn samples_outside_recording_are_ignored() {
        let mut store = RecordingStore::new(MemoryStorage::new());
        store.append(1.0, &[0.0]);
        assert_eq!(store.buffered(), 0);
        store.start_recording();
        store.append(2.0, &[0.0]);
        assert_eq!(store.buffered(), 1);
    }

    #[test]
    fn storage_failure_keeps_samples_for_retry() {
        let mut store = RecordingStore::new(Flaky {
            failures: 1,
            ..Flaky::default()
        });
        store.start_recording();
        store.append(0.0, &[1.0]);
        store.append(4.0, &[2.0]);

        assert!(matches!(
            store.stop_recording("retry", 1, 250.0),
            Err(BioAmpError::Storage(_))
        ));
        assert_eq!(store.buffered(), 2);

        let saved = store.stop_recording("retry", 1, 250.0).unwrap().unwrap();
        assert_eq!(saved.data.len(), 2);
        assert_eq!(store.buffered(), 0);
        assert_eq!(store.list_recordings().unwrap().len(), 1);
    }

    #[test]
    fn list_is_sorted_by_creation_then_id() {
        let mut storage = MemoryStorage::new();
        for (id, created) in [("b", 20.0), ("c", 10.0), ("a", 20.0)] {
            let mut s = RecordingSession::new(id, 1, 250.0, Vec::new());
            s.id = id.to_owned();
            s.created_at = created;
            storage.create(&s).unwrap();
        }
        let store = RecordingStore::new(storage);
        let ids: Vec<String> = store.list_recordings().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut store = RecordingStore::new(MemoryStorage::new());
        store.start_recording();
        store.append(0.0, &[0.0]);
        let id = store.stop_recording("x", 1, 250.0).unwrap().unwrap().id;

        store.delete_recording(&id).unwrap();
        store.delete_recording(&id).unwrap();
        store.delete_all_recordings().unwrap();
        assert!(store.list_recordings().unwrap().is_empty());
    }

    #[test]
    fn session_json_uses_camel_case() {
        let s = RecordingSession::new("n", 2, 500.0, Vec::new());
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("sampleRate").is_some());
        assert!(json.get("durationSeconds").is_some());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn json_dir_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonDirStorage::open(dir.path()).unwrap();
        assert!(matches!(storage.delete("../etc"), Err(BioAmpError::Storage(_))));
    }
}
