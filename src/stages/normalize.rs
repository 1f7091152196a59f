//! `normalize`: divide each image by its background mean.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use super::ensure_output_dir;
use crate::config::NormalizeConfig;
use crate::image_list::{read_image_list, ImageRow};
use crate::io::{read_volume, write_volume};
use crate::naming::{insert_ending, output_file_name};
use crate::report::{progress_bar, ItemResult};
use crate::volume::PixelType;

/// Reads `input`, casts it to float and writes `input / background` to `output`.
pub fn normalize_image(input: &Path, output: &Path, background: f64) -> Result<()> {
    if background == 0.0 || !background.is_finite() {
        bail!("background value {} cannot be used as a divisor", background);
    }
    let mut volume = read_volume(input)?.cast(PixelType::Float32);
    volume.divide_by(background as f32);
    write_volume(output, &volume)
}

fn normalize_row(config: &NormalizeConfig, row: &ImageRow) -> Result<PathBuf> {
    let background = row.background_value()?;
    let input_name = insert_ending(&row.filename, &config.input_filename_ending);
    let input = config.input_dir.join(&input_name);
    let output = config
        .output_dir
        .join(output_file_name(&input_name, &config.output_filename_ending));
    normalize_image(&input, &output, background)
        .with_context(|| format!("line {}: failed to normalize {}", row.line, input.display()))?;
    Ok(output)
}

/// Normalizes every listed image; the first failure aborts the remaining rows.
pub fn run(config: &NormalizeConfig, results: &mut Vec<ItemResult>) -> Result<()> {
    let rows = read_image_list(&config.image_list_csv)?;
    info!("Normalizing {} images from {}", rows.len(), config.image_list_csv.display());
    ensure_output_dir(&config.output_dir)?;

    let pb = progress_bar(rows.len(), "normalize");
    for row in &rows {
        pb.set_message(row.filename.clone());
        match normalize_row(config, row) {
            Ok(output) => {
                info!("Wrote {}", output.display());
                results.push(ItemResult::success(row.filename.clone(), Some(output), ""));
            }
            Err(e) => {
                pb.abandon();
                results.push(ItemResult::failed(row.filename.clone(), format!("{:#}", e)));
                return Err(e);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{Geometry, Volume};
    use std::fs;

    fn config(dir: &Path) -> NormalizeConfig {
        NormalizeConfig {
            input_dir: dir.join("in"),
            image_list_csv: dir.join("list.csv"),
            output_dir: dir.join("out"),
            input_filename_ending: "_reg".to_string(),
            output_filename_ending: "_norm".to_string(),
        }
    }

    fn write_constant(path: &Path, value: f32) {
        let volume = Volume::filled([4, 3, 2], value, Geometry::default(), PixelType::Int16).unwrap();
        write_volume(path, &volume).unwrap();
    }

    #[test]
    fn test_constant_image_divided_by_background() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        fs::create_dir_all(&cfg.input_dir).unwrap();
        write_constant(&cfg.input_dir.join("echo1_reg.mha"), 100.0);
        fs::write(&cfg.image_list_csv, "filename,te,background\necho1.mha,10,50\n").unwrap();

        let mut results = Vec::new();
        run(&cfg, &mut results).unwrap();

        let out = read_volume(&cfg.output_dir.join("echo1_reg_norm.mha")).unwrap();
        assert_eq!(out.pixel_type(), PixelType::Float32);
        assert!(out.data().iter().all(|&v| v == 2.0));
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_normalizing_twice_gives_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.mha");
        write_constant(&input, 37.0);
        let first = dir.path().join("first.mha");
        let second = dir.path().join("second.mha");
        normalize_image(&input, &first, 3.0).unwrap();
        normalize_image(&input, &second, 3.0).unwrap();
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_bad_background_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        fs::create_dir_all(&cfg.input_dir).unwrap();
        write_constant(&cfg.input_dir.join("a_reg.mha"), 1.0);
        write_constant(&cfg.input_dir.join("b_reg.mha"), 1.0);

        for background in ["0", "abc", "inf"] {
            let csv = format!("f,te,bg\na.mha,10,{}\nb.mha,20,5\n", background);
            fs::write(&cfg.image_list_csv, csv).unwrap();
            let mut results = Vec::new();
            assert!(run(&cfg, &mut results).is_err(), "background {}", background);
            assert_eq!(results.len(), 1);
            assert!(!cfg.output_dir.join("b_reg_norm.mha").exists());
        }
    }
}
