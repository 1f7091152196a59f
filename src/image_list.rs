//! Image lists shared by the register, normalize and t2map stages.
//!
//! The CSV has a mandatory header row that is skipped, then one row per
//! image with positional columns `filename, TE, mean_background`.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One data row of an image list.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRow {
    /// 1-based line in the CSV file, used in diagnostics.
    pub line: u64,
    pub filename: String,
    echo_time: Option<String>,
    background: Option<String>,
}

impl ImageRow {
    /// Echo time exactly as written in the list, surrounding whitespace removed.
    pub fn echo_time(&self) -> Result<&str> {
        self.echo_time
            .as_deref()
            .ok_or_else(|| anyhow!("line {}: missing echo time column", self.line))
    }

    /// Raw background column, surrounding whitespace removed.
    pub fn background(&self) -> Result<&str> {
        self.background
            .as_deref()
            .ok_or_else(|| anyhow!("line {}: missing background column", self.line))
    }

    /// Background mean parsed as a number.
    pub fn background_value(&self) -> Result<f64> {
        let raw = self.background()?;
        raw.parse::<f64>()
            .with_context(|| format!("line {}: background value {:?} is not a number", self.line, raw))
    }
}

/// Reads an image list from `path`.
pub fn read_image_list(path: &Path) -> Result<Vec<ImageRow>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open image list {}", path.display()))?;
    parse_image_list(file).with_context(|| format!("Failed to parse image list {}", path.display()))
}

/// Parses an image list from any reader; the first row is always treated as header.
pub fn parse_image_list<R: Read>(reader: R) -> Result<Vec<ImageRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let filename = record
            .get(0)
            .ok_or_else(|| anyhow!("line {}: missing filename column", line))?
            .to_string();
        rows.push(ImageRow {
            line,
            filename,
            echo_time: record.get(1).map(|s| s.trim().to_string()),
            background: record.get(2).map(|s| s.trim().to_string()),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "filename, TE, mean_background\n\
                        a.mha, 10, 50\n\
                        b.mha, 20 ,42.5\n\
                        c.mha,30,12\n";

    #[test]
    fn test_header_is_skipped_and_order_kept() {
        let rows = parse_image_list(LIST.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);
        let names: Vec<_> = rows.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, ["a.mha", "b.mha", "c.mha"]);
    }

    #[test]
    fn test_positional_columns() {
        let rows = parse_image_list(LIST.as_bytes()).unwrap();
        assert_eq!(rows[1].echo_time().unwrap(), "20");
        assert_eq!(rows[1].background_value().unwrap(), 42.5);
        assert_eq!(rows[0].line, 2);
    }

    #[test]
    fn test_header_only_gives_empty_list() {
        let rows = parse_image_list("filename,TE,mean_background\n".as_bytes()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_missing_and_bad_columns() {
        let rows = parse_image_list("h\nonly.mha\nx.mha,1,abc\n".as_bytes()).unwrap();
        assert!(rows[0].echo_time().is_err());
        assert!(rows[0].background_value().is_err());
        assert!(rows[1].background_value().is_err());
    }
}
