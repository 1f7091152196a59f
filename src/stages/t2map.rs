//! `t2map`: run the external T2 fitting program once per experiment.

use anyhow::{anyhow, bail, Context, Result};
use std::time::Duration;
use tracing::{error, info};

use super::ensure_output_dir;
use crate::config::{ExperimentConfig, T2MapConfig};
use crate::image_list::{read_image_list, ImageRow};
use crate::naming::insert_ending;
use crate::process::run_process;
use crate::report::ItemResult;

/// Arguments for one experiment, without the program itself:
/// `output_base method threshold image_1 te_1 image_2 te_2 ...`.
pub fn build_invocation(experiment: &ExperimentConfig, rows: &[ImageRow]) -> Result<Vec<String>> {
    let mut args = vec![
        experiment
            .output_dir
            .join(&experiment.output_basename)
            .display()
            .to_string(),
        experiment.method.clone(),
        experiment.threshold.clone(),
    ];
    for &index in &experiment.images_to_use {
        let row = rows.get(index).ok_or_else(|| {
            anyhow!(
                "[{}] images_to_use index {} is out of range, {} lists {} images",
                experiment.name,
                index,
                experiment.image_list_csv.display(),
                rows.len()
            )
        })?;
        let image = insert_ending(&row.filename, &experiment.input_filename_ending);
        args.push(experiment.input_dir.join(image).display().to_string());
        args.push(row.echo_time()?.to_string());
    }
    Ok(args)
}

async fn run_experiment(config: &T2MapConfig, experiment: &ExperimentConfig) -> Result<String> {
    let rows = read_image_list(&experiment.image_list_csv)?;
    let args = build_invocation(experiment, &rows)?;
    ensure_output_dir(&experiment.output_dir)?;

    info!("[{}] {} {}", experiment.name, config.executable, args.join(" "));
    let outcome = run_process(&config.executable, &args, Duration::from_secs(config.timeout_secs))
        .await
        .with_context(|| format!("[{}] could not run {}", experiment.name, config.executable))?;

    if !outcome.success() {
        bail!("[{}] {} failed: {}", experiment.name, config.executable, outcome.failure_message());
    }
    Ok(format!("finished in {} ms", outcome.elapsed_ms))
}

/// Runs the experiments in order.
///
/// Without `keep_going` the first failing experiment ends the run; with it,
/// every experiment is attempted and the run fails afterwards if any did.
pub async fn run(config: &T2MapConfig, keep_going: bool, results: &mut Vec<ItemResult>) -> Result<()> {
    info!("Running {} experiments with {}", config.experiments.len(), config.executable);

    let mut failures = 0;
    for experiment in &config.experiments {
        match run_experiment(config, experiment).await {
            Ok(detail) => {
                info!("[{}] {}", experiment.name, detail);
                let output = experiment.output_dir.join(&experiment.output_basename);
                results.push(ItemResult::success(experiment.name.clone(), Some(output), detail));
            }
            Err(e) if keep_going => {
                error!("{:#}", e);
                results.push(ItemResult::failed(experiment.name.clone(), format!("{:#}", e)));
                failures += 1;
            }
            Err(e) => {
                results.push(ItemResult::failed(experiment.name.clone(), format!("{:#}", e)));
                return Err(e);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} experiments failed", failures, config.experiments.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_list::parse_image_list;
    use crate::report::ItemStatus;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn experiment(dir: &Path, name: &str, images: Vec<usize>) -> ExperimentConfig {
        ExperimentConfig {
            name: name.to_string(),
            input_dir: PathBuf::from("/data/norm"),
            image_list_csv: dir.join("list.csv"),
            images_to_use: images,
            output_dir: dir.join(name),
            output_basename: "t2".to_string(),
            input_filename_ending: "_reg_norm".to_string(),
            method: "1".to_string(),
            threshold: "0.0".to_string(),
        }
    }

    fn rows() -> Vec<ImageRow> {
        parse_image_list("file,te,bg\ne1.mha,10,5\ne2.mha,20,5\ne3.mha,30,5\n".as_bytes()).unwrap()
    }

    #[test]
    fn test_invocation_for_selected_images() {
        let exp = experiment(Path::new("/out"), "exp1", vec![0, 2]);
        let args = build_invocation(&exp, &rows()).unwrap();
        assert_eq!(
            args,
            [
                "/out/exp1/t2",
                "1",
                "0.0",
                "/data/norm/e1_reg_norm.mha",
                "10",
                "/data/norm/e3_reg_norm.mha",
                "30",
            ]
        );
    }

    #[test]
    fn test_index_out_of_range() {
        let exp = experiment(Path::new("/out"), "exp1", vec![0, 3]);
        let err = build_invocation(&exp, &rows()).unwrap_err();
        assert!(err.to_string().contains("index 3 is out of range"), "{}", err);
    }

    #[test]
    fn test_missing_echo_time_column() {
        let exp = experiment(Path::new("/out"), "exp1", vec![0]);
        let rows = parse_image_list("file\ne1.mha\n".as_bytes()).unwrap();
        assert!(build_invocation(&exp, &rows).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_keep_going_runs_every_experiment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("list.csv"), "file,te\ne1.mha,10\n").unwrap();
        let config = T2MapConfig {
            executable: "false".to_string(),
            timeout_secs: 10,
            experiments: vec![
                experiment(dir.path(), "a", vec![0]),
                experiment(dir.path(), "b", vec![0]),
            ],
        };

        let mut results = Vec::new();
        assert!(run(&config, true, &mut results).await.is_err());
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ItemStatus::Failed));
        assert!(dir.path().join("a").is_dir() && dir.path().join("b").is_dir());

        let mut results = Vec::new();
        assert!(run(&config, false, &mut results).await.is_err());
        assert_eq!(results.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_experiment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("list.csv"), "file,te\ne1.mha,10\n").unwrap();
        let config = T2MapConfig {
            executable: "true".to_string(),
            timeout_secs: 10,
            experiments: vec![experiment(dir.path(), "a", vec![0])],
        };

        let mut results = Vec::new();
        run(&config, false, &mut results).await.unwrap();
        assert_eq!(results[0].status, ItemStatus::Success);
        assert_eq!(results[0].output, Some(dir.path().join("a").join("t2")));
    }
}
