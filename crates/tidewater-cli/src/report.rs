//! `report` subcommand: one derived JSON report per cached record, produced
//! through the task manager.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tidewater_core::{Cache, Config, TaskId, TaskManager, TaskStatus};
use tokio_util::sync::CancellationToken;

use crate::output::{self, ColorMode};
use crate::source::JsonFileSource;

pub struct ReportArgs {
    pub source: PathBuf,
    pub out_dir: PathBuf,
    pub id_field: String,
    pub concurrency: Option<usize>,
}

/// Per-record report written to `<out_dir>/<record id>.json`.
#[derive(Debug, Serialize)]
pub struct RecordReport {
    pub record_id: String,
    pub source: String,
    pub generated_at: DateTime<Utc>,
    pub field_count: usize,
    pub fields: Vec<String>,
    pub null_fields: Vec<String>,
    pub record: Value,
}

pub fn record_id(record: &Value, id_field: &str, index: usize) -> String {
    match record.get(id_field) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => format!("record-{index}"),
    }
}

/// Filesystem-safe file stem for a record id.
pub fn file_stem(record_id: &str) -> String {
    record_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<stem>.json`, suffixed with a counter when distinct ids share a stem.
fn unique_file_name(stems: &mut HashMap<String, usize>, record_id: &str) -> String {
    let stem = file_stem(record_id);
    let uses = stems.entry(stem.clone()).or_insert(0);
    *uses += 1;
    if *uses == 1 {
        format!("{stem}.json")
    } else {
        format!("{stem}-{uses}.json")
    }
}

pub fn build_report(record_id: String, source: String, record: Value) -> RecordReport {
    let (fields, null_fields) = match &record {
        Value::Object(map) => (
            map.keys().cloned().collect(),
            map.iter()
                .filter(|(_, v)| v.is_null())
                .map(|(k, _)| k.clone())
                .collect(),
        ),
        _ => (Vec::new(), Vec::new()),
    };
    RecordReport {
        record_id,
        source,
        generated_at: Utc::now(),
        field_count: fields.len(),
        fields,
        null_fields,
        record,
    }
}

async fn write_report(report: RecordReport, path: PathBuf) -> Result<PathBuf, String> {
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(path)
}

pub async fn run(
    config: Config,
    args: ReportArgs,
    color: ColorMode,
    w: &mut dyn Write,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};

    tokio::fs::create_dir_all(&args.out_dir).await?;

    let source = JsonFileSource::new(&args.source);
    let cache: Cache<Value> = Cache::new(config.clone());
    let refreshed = cache.refresh(&source).await;
    output::print_refresh_outcome(w, &source_name(&args.source), &refreshed, color)?;

    let view = cache.get_data().await?;
    if view.is_empty() {
        anyhow::bail!("No records available from {}", args.source.display());
    }

    let max_concurrent = args.concurrency.unwrap_or(config.max_concurrent_tasks);
    let manager: TaskManager<PathBuf> = TaskManager::new(max_concurrent);
    let cleanup = manager.spawn_cleanup(
        config.task_cleanup_interval,
        config.task_max_age(),
        cancel.clone(),
    );
    // Every id seen this run; never evicted, so no two tasks share a file.
    let mut seen: HashSet<String> = HashSet::new();
    let mut stems: HashMap<String, usize> = HashMap::new();
    let mut submitted: Vec<(String, TaskId)> = Vec::new();
    let mut duplicates = 0usize;
    for (index, record) in view.records().iter().enumerate() {
        let id = record_id(record, &args.id_field, index);
        if !seen.insert(id.clone()) {
            tracing::debug!(record_id = %id, "duplicate record id, reusing existing report");
            duplicates += 1;
            continue;
        }

        let path = args.out_dir.join(unique_file_name(&mut stems, &id));
        let report = build_report(id.clone(), source_name(&args.source), record.clone());
        let task_id = manager.submit(write_report(report, path));

        output::print_submitted(w, &id, task_id, manager.queue_position(task_id), color)?;
        submitted.push((id, task_id));
    }

    let bar = ProgressBar::new(submitted.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40.green/dim}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_message("Writing reports");
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut written = 0usize;
    let mut failures: Vec<(String, String)> = Vec::new();
    for (id, task_id) in &submitted {
        let info = tokio::select! {
            _ = cancel.cancelled() => {
                bar.abandon_with_message("Cancelled");
                break;
            }
            info = manager.wait(*task_id, config.task_max_age()) => info,
        };
        match info {
            Ok(info) if info.status == TaskStatus::Completed => written += 1,
            Ok(info) => failures.push((
                id.clone(),
                info.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            Err(e) => failures.push((id.clone(), e.to_string())),
        }
        bar.inc(1);
    }
    if !bar.is_finished() {
        bar.finish_and_clear();
    }

    cancel.cancel();
    let _ = cleanup.await;

    output::print_report_summary(w, written, duplicates, &failures, &args.out_dir, color)?;
    tracing::info!(
        written,
        failed = failures.len(),
        duplicates,
        "report run finished"
    );
    Ok(())
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_prefers_field() {
        assert_eq!(record_id(&json!({"id": "abc"}), "id", 4), "abc");
        assert_eq!(record_id(&json!({"id": 17}), "id", 4), "17");
        assert_eq!(record_id(&json!({"name": "x"}), "id", 4), "record-4");
        assert_eq!(record_id(&json!({"id": ""}), "id", 2), "record-2");
    }

    #[test]
    fn file_stem_is_safe() {
        assert_eq!(file_stem("NCT/0001 a.b"), "NCT_0001_a_b");
        assert_eq!(file_stem("plain-id_1"), "plain-id_1");
    }

    #[test]
    fn colliding_stems_get_distinct_files() {
        let mut stems = HashMap::new();
        assert_eq!(unique_file_name(&mut stems, "a/b"), "a_b.json");
        assert_eq!(unique_file_name(&mut stems, "a_b"), "a_b-2.json");
        assert_eq!(unique_file_name(&mut stems, "c"), "c.json");
    }

    #[test]
    fn report_lists_null_fields() {
        let report = build_report(
            "r1".into(),
            "records.json".into(),
            json!({"id": "r1", "phase": null, "sites": 3}),
        );
        assert_eq!(report.field_count, 3);
        assert_eq!(report.null_fields, vec!["phase".to_string()]);
    }

    #[tokio::test]
    async fn writes_one_report_per_unique_record() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("records.json");
        std::fs::write(
            &source,
            r#"[{"id": "a"}, {"id": "b"}, {"id": "a"}, {"id": "c", "x": null}]"#,
        )
        .unwrap();
        let out_dir = dir.path().join("reports");

        let mut out = Vec::new();
        run(
            Config::default(),
            ReportArgs {
                source,
                out_dir: out_dir.clone(),
                id_field: "id".into(),
                concurrency: Some(1),
            },
            ColorMode(false),
            &mut out,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("b queued at position 1"));
        assert!(text.contains("Done: 3 report(s)"));
        assert!(text.contains("Skipped 1 duplicate"));

        let c: Value =
            serde_json::from_str(&std::fs::read_to_string(out_dir.join("c.json")).unwrap())
                .unwrap();
        assert_eq!(c["record_id"], "c");
        assert_eq!(c["null_fields"][0], "x");
        assert!(out_dir.join("a.json").exists());
        assert!(out_dir.join("b.json").exists());
    }

    #[tokio::test]
    async fn duplicates_are_caught_beyond_memo_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("records.json");
        std::fs::write(&source, r#"[{"id": "a"}, {"id": "b"}, {"id": "c"}, {"id": "a"}]"#)
            .unwrap();

        let mut out = Vec::new();
        run(
            Config {
                memo_capacity: 2,
                ..Config::default()
            },
            ReportArgs {
                source,
                out_dir: dir.path().join("reports"),
                id_field: "id".into(),
                concurrency: Some(2),
            },
            ColorMode(false),
            &mut out,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("a queued").count() + text.matches("a started").count(), 1);
        assert!(text.contains("Done: 3 report(s)"));
        assert!(text.contains("Skipped 1 duplicate"));
    }

    #[tokio::test]
    async fn empty_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("records.json");
        std::fs::write(&source, "[]").unwrap();

        let mut out = Vec::new();
        let err = run(
            Config::default(),
            ReportArgs {
                source,
                out_dir: dir.path().join("reports"),
                id_field: "id".into(),
                concurrency: None,
            },
            ColorMode(false),
            &mut out,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("No records"));
    }
}
