use std::io::Write;
use std::path::Path;

use chrono::Utc;
use owo_colors::OwoColorize;
use tidewater_core::{CacheError, CacheStatus, RefreshOutcome, TaskId};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn format_secs(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

/// Print the outcome of a refresh the CLI triggered itself.
pub fn print_refresh_outcome(
    w: &mut dyn Write,
    source: &str,
    result: &Result<RefreshOutcome, CacheError>,
    color: ColorMode,
) -> std::io::Result<()> {
    let line = match result {
        Ok(RefreshOutcome::Fetched { records, attempts }) => {
            format!("Fetched {records} records from {source} ({attempts} attempt(s))")
        }
        Ok(RefreshOutcome::Unchanged) => format!("{source} unchanged since last fetch"),
        Ok(RefreshOutcome::Throttled) => format!("{source} probed recently, skipped"),
        Ok(RefreshOutcome::Incomplete) => format!("{source} is mid-import, keeping cached data"),
        Ok(RefreshOutcome::Joined) => format!("Joined in-flight refresh of {source}"),
        Ok(RefreshOutcome::TimedOut) => format!("Gave up waiting on refresh of {source}"),
        Err(e) => {
            if color.enabled() {
                return writeln!(w, "{} {}", "Refresh failed:".red().bold(), e);
            }
            return writeln!(w, "Refresh failed: {e}");
        }
    };
    if color.enabled() {
        writeln!(w, "{}", line.dimmed())
    } else {
        writeln!(w, "{line}")
    }
}

/// Print a full, multi-line status report.
pub fn print_status(
    w: &mut dyn Write,
    source: &str,
    status: &CacheStatus,
    color: ColorMode,
) -> std::io::Result<()> {
    let freshness = if !status.has_data {
        "EMPTY"
    } else if status.is_stale {
        "STALE"
    } else {
        "FRESH"
    };

    if color.enabled() {
        let badge = match freshness {
            "FRESH" => freshness.green().bold().to_string(),
            "STALE" => freshness.yellow().bold().to_string(),
            _ => freshness.red().bold().to_string(),
        };
        writeln!(w, "{} {}", source.bold(), badge)?;
    } else {
        writeln!(w, "{source} {freshness}")?;
    }

    writeln!(w, "  Records:          {}", status.record_count)?;
    if let Some(prev) = status.previous_record_count {
        writeln!(w, "  Previous:         {prev}")?;
    }
    writeln!(w, "  Confidence:       {:.0}%", status.confidence * 100.0)?;
    match status.seconds_since_refresh {
        Some(age) => writeln!(w, "  Last refresh:     {} ago", format_secs(age))?,
        None => writeln!(w, "  Last refresh:     never")?,
    }
    writeln!(
        w,
        "  Next update due:  in {}",
        format_secs(status.seconds_until_expected_update)
    )?;
    writeln!(
        w,
        "  Next check:       every {}",
        format_secs(status.next_check_interval_secs)
    )?;
    if let Some(version) = &status.last_version {
        writeln!(
            w,
            "  Upstream version: {} records, modified {}",
            version.record_count,
            version.last_modified.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
    }
    if status.import_window.detected {
        let msg = format!(
            "  Upstream import in progress ({} null probes)",
            status.import_window.consecutive_null_count
        );
        if color.enabled() {
            writeln!(w, "{}", msg.yellow())?;
        } else {
            writeln!(w, "{msg}")?;
        }
    }
    if status.needs_force_refresh && status.has_data {
        writeln!(w, "  Data is past its forced-refresh age")?;
    }
    if let Some(err) = &status.last_error {
        if color.enabled() {
            writeln!(w, "  {} {}", "Last error:".red(), err)?;
        } else {
            writeln!(w, "  Last error: {err}")?;
        }
    }
    writeln!(
        w,
        "  Refreshes:        {} ok, {} failed, avg {:.0} ms",
        status.counters.refreshes, status.counters.failures, status.avg_refresh_ms
    )?;
    Ok(())
}

/// One-line status for `watch`.
pub fn print_status_line(
    w: &mut dyn Write,
    status: &CacheStatus,
    color: ColorMode,
) -> std::io::Result<()> {
    let now = Utc::now().format("%H:%M:%S");
    let state = if status.refresh_in_progress {
        "refreshing"
    } else if status.import_window.detected {
        "importing"
    } else if status.is_stale {
        "stale"
    } else {
        "fresh"
    };
    let line = format!(
        "{now} {state:<10} records={} confidence={:.2} next_check={}",
        status.record_count,
        status.confidence,
        format_secs(status.next_check_interval_secs)
    );
    if !color.enabled() {
        return writeln!(w, "{line}");
    }
    match state {
        "fresh" => writeln!(w, "{}", line.green()),
        "stale" | "importing" => writeln!(w, "{}", line.yellow()),
        _ => writeln!(w, "{}", line.cyan()),
    }
}

/// Print where a newly submitted report task landed.
pub fn print_submitted(
    w: &mut dyn Write,
    record_id: &str,
    task_id: TaskId,
    queue_position: Option<usize>,
    color: ColorMode,
) -> std::io::Result<()> {
    let place = match queue_position {
        Some(pos) => format!("queued at position {pos}"),
        None => "started".to_string(),
    };
    if color.enabled() {
        writeln!(
            w,
            "{} {} {}",
            record_id.bold(),
            place,
            format!("(task {task_id})").dimmed()
        )
    } else {
        writeln!(w, "{record_id} {place} (task {task_id})")
    }
}

/// Final summary after a `report` run.
pub fn print_report_summary(
    w: &mut dyn Write,
    written: usize,
    duplicates: usize,
    failures: &[(String, String)],
    out_dir: &Path,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    if color.enabled() {
        writeln!(
            w,
            "{} {} report(s) written to {}",
            "Done:".bold().green(),
            written,
            out_dir.display()
        )?;
    } else {
        writeln!(w, "Done: {written} report(s) written to {}", out_dir.display())?;
    }
    if duplicates > 0 {
        writeln!(w, "Skipped {duplicates} duplicate record id(s)")?;
    }
    if !failures.is_empty() {
        if color.enabled() {
            writeln!(w, "{}", format!("{} report(s) failed:", failures.len()).red())?;
        } else {
            writeln!(w, "{} report(s) failed:", failures.len())?;
        }
        for (id, err) in failures {
            writeln!(w, "  {id}: {err}")?;
        }
    }
    Ok(())
}
