//! Per-item results of a run, progress display and CSV/JSON reports.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Success => "Success",
            ItemStatus::Failed => "Failed",
            ItemStatus::Skipped => "Skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one series, image or experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub name: String,
    pub status: ItemStatus,
    pub output: Option<PathBuf>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ItemResult {
    pub fn success(name: impl Into<String>, output: Option<PathBuf>, detail: impl Into<String>) -> Self {
        Self::new(name, ItemStatus::Success, output, detail)
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, ItemStatus::Failed, None, detail)
    }

    pub fn skipped(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, ItemStatus::Skipped, None, detail)
    }

    fn new(name: impl Into<String>, status: ItemStatus, output: Option<PathBuf>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            output,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Where to write reports, both optional.
#[derive(Debug, Clone, Default)]
pub struct ReportTargets {
    pub csv: Option<PathBuf>,
    pub json: Option<PathBuf>,
}

impl ReportTargets {
    pub fn write(&self, results: &[ItemResult]) -> Result<()> {
        if let Some(path) = &self.csv {
            write_csv_report(path, results)
                .with_context(|| format!("Failed to write CSV report {}", path.display()))?;
        }
        if let Some(path) = &self.json {
            write_json_report(path, results)
                .with_context(|| format!("Failed to write JSON report {}", path.display()))?;
        }
        Ok(())
    }
}

fn write_json_report(path: &Path, results: &[ItemResult]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

fn write_csv_report(path: &Path, results: &[ItemResult]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["Name", "Status", "Output", "Detail", "Timestamp"])?;
    for r in results {
        let output = r.output.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        wtr.write_record([
            r.name.as_str(),
            &r.status.to_string(),
            &output,
            &r.detail,
            &r.timestamp.to_rfc3339(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Bar over `len` items, hidden when `len` is zero.
pub fn progress_bar(len: usize, prefix: &str) -> ProgressBar {
    if len == 0 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb
}

/// Prints one line per item and a colored tally.
pub fn print_summary(title: &str, results: &[ItemResult]) {
    let count = |status| results.iter().filter(|r| r.status == status).count();
    let (ok, failed, skipped) = (
        count(ItemStatus::Success),
        count(ItemStatus::Failed),
        count(ItemStatus::Skipped),
    );

    println!("\n{}", format!("{} summary", title).bold());
    for r in results {
        let mark = match r.status {
            ItemStatus::Success => "✓".green(),
            ItemStatus::Failed => "✗".red(),
            ItemStatus::Skipped => "-".yellow(),
        };
        if r.detail.is_empty() {
            println!("  {} {}", mark, r.name);
        } else {
            println!("  {} {} ({})", mark, r.name, r.detail);
        }
    }
    println!(
        "  {} succeeded, {} failed, {} skipped",
        ok.to_string().green(),
        failed.to_string().red(),
        skipped.to_string().yellow()
    );
}
