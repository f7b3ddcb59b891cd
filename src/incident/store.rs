use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{DispatchError, Result};
use crate::incident::IncidentReport;

/// Durable, append-only incident storage.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Persist one report. Failures are reported as
    /// [`DispatchError::TransientStorageFailure`] and retried by the caller.
    async fn append(&self, report: &IncidentReport) -> Result<()>;

    /// Every stored report in write order.
    async fn load(&self) -> Result<Vec<IncidentReport>>;
}

/// Keeps incidents in process memory. Used in tests and when no log path is
/// configured.
#[derive(Default)]
pub struct MemoryIncidentStore {
    reports: Mutex<Vec<IncidentReport>>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn append(&self, report: &IncidentReport) -> Result<()> {
        self.reports.lock().await.push(report.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<IncidentReport>> {
        Ok(self.reports.lock().await.clone())
    }
}

/// One JSON document per line, opened in append mode for every write.
pub struct JsonlIncidentStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlIncidentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage_error(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::TransientStorageFailure(e.to_string())
}

#[async_trait]
impl IncidentStore for JsonlIncidentStore {
    async fn append(&self, report: &IncidentReport) -> Result<()> {
        let mut line =
            serde_json::to_vec(report).map_err(|e| DispatchError::Internal(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(storage_error)?;

        // A torn tail left by a crash is closed off so this record starts on
        // its own line.
        let len = file.metadata().await.map_err(storage_error)?.len();
        if len > 0 {
            file.seek(SeekFrom::End(-1)).await.map_err(storage_error)?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await.map_err(storage_error)?;
            if last[0] != b'\n' {
                tracing::warn!(path = %self.path.display(), "Closing torn incident record");
                line.insert(0, b'\n');
            }
        }

        file.write_all(&line).await.map_err(storage_error)?;
        file.flush().await.map_err(storage_error)?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<IncidentReport>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error(e)),
        };

        let mut reports = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IncidentReport>(line) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    // A torn final line from a crash mid-write is skipped.
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping unreadable incident record"
                    );
                }
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::IncidentKind;
    use crate::scheduler::JobId;
    use crate::worker::WorkerId;

    fn report(message: &str) -> IncidentReport {
        IncidentReport::new(
            JobId::from("bin-1"),
            WorkerId::from("w1"),
            IncidentKind::Rejected,
            message,
        )
    }

    #[tokio::test]
    async fn jsonl_store_appends_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlIncidentStore::new(dir.path().join("incidents.jsonl"));

        assert!(store.load().await.unwrap().is_empty());

        store.append(&report("first")).await.unwrap();
        store.append(&report("second")).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].message, "first");
        assert_eq!(loaded[1].message, "second");
    }

    #[tokio::test]
    async fn jsonl_store_skips_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.jsonl");
        let store = JsonlIncidentStore::new(&path);
        store.append(&report("ok")).await.unwrap();

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"id\":\"trunc").await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn jsonl_store_appends_after_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.jsonl");
        let store = JsonlIncidentStore::new(&path);
        store.append(&report("first")).await.unwrap();

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"id\":\"trunc").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        store.append(&report("after-crash")).await.unwrap();
        store.append(&report("later")).await.unwrap();

        let loaded = store.load().await.unwrap();
        let messages: Vec<&str> = loaded.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "after-crash", "later"]);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 4);
    }

        #[tokio::test]
    async fn jsonl_store_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlIncidentStore::new(dir.path().join("missing").join("incidents.jsonl"));
        let err = store.append(&report("x")).await.unwrap_err();
        assert!(matches!(err, DispatchError::TransientStorageFailure(_)));
    }
}
