//! JSON-file upstream.
//!
//! The file holds a JSON array of records. Its modification time and array
//! length form the version fingerprint; an empty file means upstream is
//! mid-import. Array lengths are memoized per (mtime, byte length), so
//! probing an unchanged file only costs a `stat`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tidewater_core::{DataSource, MemoCache, SourceError, SourceFuture, VersionInfo};

/// File metadata a record count is memoized under.
type FileKey = (DateTime<Utc>, u64);

const COUNT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const COUNT_CAPACITY: usize = 4;

pub struct JsonFileSource {
    path: PathBuf,
    name: String,
    counts: MemoCache<FileKey, u64>,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            name,
            counts: MemoCache::new(COUNT_TTL, COUNT_CAPACITY),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse a JSON array of records. `Ok(None)` for an empty (or blank) file.
fn parse_records(content: &str) -> Result<Option<Vec<Value>>, String> {
    if content.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(records)) => Ok(Some(records)),
        Ok(_) => Err("expected a JSON array of records".to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

impl DataSource<Value> for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> SourceFuture<'_, Vec<Value>> {
        Box::pin(async move {
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| SourceError::Fetch(format!("{}: {e}", self.path.display())))?;
            match parse_records(&content).map_err(SourceError::Fetch)? {
                Some(records) => Ok(records),
                None => Err(SourceError::Fetch(format!(
                    "{} is empty (import in progress?)",
                    self.path.display()
                ))),
            }
        })
    }

    fn probe(&self) -> SourceFuture<'_, Option<VersionInfo>> {
        Box::pin(async move {
            let probe_err = |e: std::io::Error| SourceError::Probe(format!("{}: {e}", self.path.display()));
            let meta = tokio::fs::metadata(&self.path).await.map_err(probe_err)?;
            if meta.len() == 0 {
                return Ok(None);
            }
            let last_modified = DateTime::<Utc>::from(meta.modified().map_err(probe_err)?);
            let key = (last_modified, meta.len());
            let record_count = match self.counts.get(&key) {
                Some(count) => count,
                None => {
                    let content = tokio::fs::read_to_string(&self.path)
                        .await
                        .map_err(probe_err)?;
                    let Some(records) = parse_records(&content).map_err(SourceError::Probe)?
                    else {
                        return Ok(None);
                    };
                    let count = records.len() as u64;
                    self.counts.insert(key, count);
                    count
                }
            };
            Ok(Some(VersionInfo {
                last_modified,
                record_count,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn fetch_parses_array() {
        let file = write_file(r#"[{"id": "a"}, {"id": "b"}]"#);
        let source = JsonFileSource::new(file.path());
        let records = source.fetch().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], "b");
    }

    #[tokio::test]
    async fn fetch_rejects_non_array() {
        let file = write_file(r#"{"id": "a"}"#);
        let source = JsonFileSource::new(file.path());
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, SourceError::Fetch(msg) if msg.contains("JSON array")));
    }

    #[tokio::test]
    async fn probe_reports_length() {
        let file = write_file("[1, 2, 3]");
        let source = JsonFileSource::new(file.path());
        let version = source.probe().await.unwrap().unwrap();
        assert_eq!(version.record_count, 3);
    }

    #[tokio::test]
    async fn unchanged_file_reuses_count() {
        let file = write_file("[1, 2, 3]");
        let source = JsonFileSource::new(file.path());
        assert_eq!(source.probe().await.unwrap().unwrap().record_count, 3);
        assert_eq!(source.probe().await.unwrap().unwrap().record_count, 3);
        assert_eq!(source.counts.hits(), 1);

        std::fs::write(file.path(), "[1, 2, 3, 4, 5]").unwrap();
        assert_eq!(source.probe().await.unwrap().unwrap().record_count, 5);
    }

    #[tokio::test]
    async fn empty_file_is_an_incomplete_probe() {
        let file = write_file("");
        let source = JsonFileSource::new(file.path());
        assert_eq!(source.probe().await.unwrap(), None);
        assert!(source.fetch().await.is_err());
    }

    #[tokio::test]
    async fn missing_file_fails_probe() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonFileSource::new(dir.path().join("absent.json"));
        assert!(matches!(
            source.probe().await.unwrap_err(),
            SourceError::Probe(_)
        ));
    }

    #[test]
    fn name_is_file_name() {
        let source = JsonFileSource::new("/data/records.json");
        assert_eq!(source.name(), "records.json");
    }
}
