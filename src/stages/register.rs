//! `register`: rigidly align each listed image to the reference.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use super::ensure_output_dir;
use crate::config::RegisterConfig;
use crate::image_list::{read_image_list, ImageRow};
use crate::io::{read_volume, write_volume};
use crate::naming::output_file_name;
use crate::registration::{register, resample, RegistrationOutcome};
use crate::report::{progress_bar, ItemResult};
use crate::volume::{PixelType, Volume};

struct Reference {
    image: Volume,
    mask: Volume,
}

fn register_row(config: &RegisterConfig, reference: &Reference, row: &ImageRow) -> Result<(PathBuf, RegistrationOutcome)> {
    let input = config.input_dir.join(&row.filename);
    let moving = read_volume(&input)
        .with_context(|| format!("line {}: failed to read {}", row.line, input.display()))?
        .cast(PixelType::Float32);

    info!("Registering {}", input.display());
    let outcome = register(&reference.image, &moving, &reference.mask, &config.settings)
        .with_context(|| format!("Registration of {} failed", input.display()))?;

    let resampled = resample(&moving, &reference.image, &outcome.transform, 0.0)?;
    let output = config
        .output_dir
        .join(output_file_name(&row.filename, &config.output_filename_ending));
    write_volume(&output, &resampled)?;
    Ok((output, outcome))
}

/// Registers every listed image; the first failure aborts the remaining rows.
pub fn run(config: &RegisterConfig, results: &mut Vec<ItemResult>) -> Result<()> {
    let reference = Reference {
        image: read_volume(&config.reference_image)?.cast(PixelType::Float32),
        mask: read_volume(&config.reference_mask)?,
    };
    let rows = read_image_list(&config.images_to_register)?;
    info!(
        "Registering {} images to {}",
        rows.len(),
        config.reference_image.display()
    );
    ensure_output_dir(&config.output_dir)?;

    let pb = progress_bar(rows.len(), "register");
    for row in &rows {
        pb.set_message(row.filename.clone());
        match register_row(config, &reference, row) {
            Ok((output, outcome)) => {
                info!("Wrote {}", output.display());
                let detail = format!(
                    "{} iterations, metric {:.6}, parameters {:?}. {}",
                    outcome.iterations,
                    outcome.final_metric,
                    outcome.transform.parameters(),
                    outcome.stop_reason
                );
                results.push(ItemResult::success(row.filename.clone(), Some(output), detail));
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
    use crate::registration::RegistrationSettings;
    use crate::volume::Geometry;
    use nalgebra::Vector3;
    use ndarray::Array3;
    use std::fs;
    use std::path::Path;

    fn blob(center: Vector3<f64>, pixel_type: PixelType) -> Volume {
        let data = Array3::from_shape_fn((12, 12, 12), |(z, y, x)| {
            let d = Vector3::new(x as f64, y as f64, z as f64) - center;
            (1000.0 * (-d.norm_squared() / 18.0).exp()).round() as f32
        });
        Volume::new(data, Geometry::default(), pixel_type).unwrap()
    }

    fn config(dir: &Path) -> RegisterConfig {
        RegisterConfig {
            reference_image: dir.join("ref.mha"),
            reference_mask: dir.join("mask.mha"),
            input_dir: dir.join("in"),
            images_to_register: dir.join("list.csv"),
            output_dir: dir.join("out"),
            output_filename_ending: "_reg".to_string(),
            settings: RegistrationSettings { histogram_bins: 16, number_of_iterations: 5, ..Default::default() },
        }
    }

    #[test]
    fn test_registered_image_lands_on_reference_grid() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        fs::create_dir_all(&cfg.input_dir).unwrap();

        let center = Vector3::new(5.5, 5.5, 5.5);
        write_volume(&cfg.reference_image, &blob(center, PixelType::Int16)).unwrap();
        let mask = Volume::filled([12, 12, 12], 1.0, Geometry::default(), PixelType::UInt8).unwrap();
        write_volume(&cfg.reference_mask, &mask).unwrap();
        write_volume(
            &cfg.input_dir.join("echo1.mha"),
            &blob(center + Vector3::new(0.5, 0.0, 0.0), PixelType::Int16),
        )
        .unwrap();
        fs::write(&cfg.images_to_register, "filename\necho1.mha\n").unwrap();

        let mut results = Vec::new();
        run(&cfg, &mut results).unwrap();

        let out = read_volume(&cfg.output_dir.join("echo1_reg.mha")).unwrap();
        assert_eq!(out.size(), [12, 12, 12]);
        assert_eq!(out.pixel_type(), PixelType::Float32);
        assert_eq!(results.len(), 1);
        // five iterations never fill the ten-value convergence window
        let detail = &results[0].detail;
        assert!(detail.starts_with("5 iterations"), "{}", detail);
        assert!(detail.ends_with("Maximum number of iterations (5) exceeded."), "{}", detail);
    }

    #[test]
    fn test_missing_moving_image_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let center = Vector3::new(5.5, 5.5, 5.5);
        write_volume(&cfg.reference_image, &blob(center, PixelType::Int16)).unwrap();
        write_volume(&cfg.reference_mask, &blob(center, PixelType::UInt8)).unwrap();
        fs::write(&cfg.images_to_register, "filename\nmissing.mha\n").unwrap();

        let mut results = Vec::new();
        assert!(run(&cfg, &mut results).is_err());
        assert_eq!(results.len(), 1);
    }
}
