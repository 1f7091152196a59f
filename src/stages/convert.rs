//! `dicom`: one output volume per DICOM series.

use anyhow::{bail, Result};
use colored::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ensure_output_dir;
use crate::dicom::{load_series, scan_series, DicomSeries, SeriesHeader, TagTable, TAGS_TO_PRINT};
use crate::io::{check_extension, write_volume};
use crate::report::{progress_bar, ItemResult};

#[derive(Debug, Clone)]
pub struct ConvertJob {
    pub dicom_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Output extension, with or without the leading dot.
    pub extension: String,
    /// Only print identifying tags, write nothing.
    pub info_only: bool,
}

impl ConvertJob {
    fn dotted_extension(&self) -> String {
        if self.extension.starts_with('.') {
            self.extension.clone()
        } else {
            format!(".{}", self.extension)
        }
    }
}

/// Converts every series under `job.dicom_dir`; the first failure aborts the run.
pub fn run(job: &ConvertJob, results: &mut Vec<ItemResult>) -> Result<()> {
    check_extension(&job.extension)?;
    let table = TagTable::standard()?;

    let series = scan_series(&job.dicom_dir)?;
    info!("Found {} series in {}", series.len(), job.dicom_dir.display());
    if series.is_empty() {
        warn!("{} does not contain a DICOM series, nothing to convert", job.dicom_dir.display());
        return Ok(());
    }

    if job.info_only {
        for (index, s) in series.iter().enumerate() {
            let header = read_header(s, table)?;
            print_info(index, s, &header);
            results.push(ItemResult::skipped(s.series_instance_uid.clone(), "info only"));
        }
        return Ok(());
    }

    ensure_output_dir(&job.output_dir)?;
    let extension = job.dotted_extension();
    let pb = progress_bar(series.len(), "dicom");

    for (index, s) in series.iter().enumerate() {
        pb.set_message(s.series_instance_uid.clone());
        match convert_one(index, s, table, &job.output_dir, &extension) {
            Ok(output) => {
                info!("Wrote {}", output.display());
                results.push(ItemResult::success(
                    s.series_instance_uid.clone(),
                    Some(output),
                    format!("{} files", s.files.len()),
                ));
            }
            Err(e) => {
                pb.abandon();
                results.push(ItemResult::failed(s.series_instance_uid.clone(), format!("{:#}", e)));
                return Err(e);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(())
}

fn read_header(series: &DicomSeries, table: &TagTable) -> Result<SeriesHeader> {
    let Some(first) = series.files.first() else {
        bail!("series {} has no files", series.series_instance_uid);
    };
    SeriesHeader::read(first, table)
}

fn convert_one(
    index: usize,
    series: &DicomSeries,
    table: &TagTable,
    output_dir: &Path,
    extension: &str,
) -> Result<PathBuf> {
    let header = read_header(series, table)?;
    let stem = header.output_stem(index)?;
    debug!("series {} -> {} ({} files)", series.series_instance_uid, stem, series.files.len());

    let volume = load_series(series)?;
    let output = output_dir.join(format!("{}{}", stem, extension));
    write_volume(&output, &volume)?;
    Ok(output)
}

fn print_info(index: usize, series: &DicomSeries, header: &SeriesHeader) {
    println!(
        "\n{} {} ({} files)",
        format!("Series {}", index).bold(),
        series.series_instance_uid,
        series.files.len()
    );
    for name in TAGS_TO_PRINT {
        let value = header.value(name).unwrap_or("-");
        println!("  {:<22} {}", name, value);
    }
}
