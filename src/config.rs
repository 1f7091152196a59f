//! Configuration files for the register, normalize and t2map stages.
//!
//! Every stage reads a TOML file with one table per section. The keys each
//! section must or may carry are declared once in a [`SectionSchema`] and
//! checked by the same validator before any image is touched.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use toml::{Table, Value};

use crate::registration::RegistrationSettings;

/// Default ending appended by the register stage.
pub const DEFAULT_REGISTER_ENDING: &str = "_reg";
/// Default ending appended by the normalize stage.
pub const DEFAULT_NORMALIZE_ENDING: &str = "_norm";
/// Default ending of the images handed to the T2 mapping executable.
pub const DEFAULT_T2MAP_INPUT_ENDING: &str = "_reg_norm";
/// Default fitting method: 0 linear, 1 non-linear, 2 non-linear with constant.
pub const DEFAULT_T2MAP_METHOD: &str = "1";
/// Default signal threshold below which voxels are not fitted.
pub const DEFAULT_T2MAP_THRESHOLD: &str = "0.0";
/// T2 mapping executable looked up on `PATH` when none is configured.
pub const DEFAULT_T2MAP_EXECUTABLE: &str = "t2mapping";
/// Upper bound for one T2 mapping run.
pub const DEFAULT_T2MAP_TIMEOUT_SECS: u64 = 7200;

// ============================================================================
// Schema
// ============================================================================

/// One key of a section, with the default used when the key is optional.
#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub name: &'static str,
    pub default: Option<&'static str>,
}

impl KeySpec {
    pub const fn required(name: &'static str) -> Self {
        Self { name, default: None }
    }

    pub const fn optional(name: &'static str, default: &'static str) -> Self {
        Self { name, default: Some(default) }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Declares the keys of one configuration section.
#[derive(Debug)]
pub struct SectionSchema {
    pub keys: &'static [KeySpec],
}

impl SectionSchema {
    pub fn required_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.keys.iter().filter(|k| k.is_required()).map(|k| k.name)
    }

    fn default_for(&self, key: &str) -> Option<&'static str> {
        self.keys.iter().find(|k| k.name == key).and_then(|k| k.default)
    }
}

pub const NORMALIZE_SECTION: &str = "normalize";
pub const NORMALIZE_SCHEMA: SectionSchema = SectionSchema {
    keys: &[
        KeySpec::required("input_dir"),
        KeySpec::required("image_list_csv"),
        KeySpec::required("output_dir"),
        KeySpec::optional("input_filename_ending", DEFAULT_REGISTER_ENDING),
        KeySpec::optional("output_filename_ending", DEFAULT_NORMALIZE_ENDING),
    ],
};

pub const REGISTER_SECTION: &str = "register";
pub const REGISTER_SCHEMA: SectionSchema = SectionSchema {
    keys: &[
        KeySpec::required("reference_image"),
        KeySpec::required("reference_mask"),
        KeySpec::required("input_dir"),
        KeySpec::required("images_to_register"),
        KeySpec::required("output_dir"),
        KeySpec::optional("output_filename_ending", DEFAULT_REGISTER_ENDING),
    ],
};

pub const T2MAP_SECTION: &str = "t2map";
pub const T2MAP_SCHEMA: SectionSchema = SectionSchema {
    keys: &[KeySpec::required("experiments_to_run")],
};

pub const EXPERIMENT_SCHEMA: SectionSchema = SectionSchema {
    keys: &[
        KeySpec::required("input_dir"),
        KeySpec::required("image_list_csv"),
        KeySpec::required("images_to_use"),
        KeySpec::required("output_dir"),
        KeySpec::required("output_basename"),
        KeySpec::optional("input_filename_ending", DEFAULT_T2MAP_INPUT_ENDING),
        KeySpec::optional("method", DEFAULT_T2MAP_METHOD),
        KeySpec::optional("threshold", DEFAULT_T2MAP_THRESHOLD),
    ],
};

// ============================================================================
// Validation
// ============================================================================

/// A single problem found while validating a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigIssue {
    MissingSection(String),
    MissingOption { section: String, key: String },
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigIssue::MissingSection(section) => {
                write!(f, "Config section {} missing, please add.", section)
            }
            ConfigIssue::MissingOption { section, key } => {
                write!(f, "Option {}.{} missing, please add.", section, key)
            }
        }
    }
}

/// Raised when a configuration file lacks required sections or keys.
#[derive(Debug, thiserror::Error)]
#[error("configuration {} is incomplete ({} problem(s))", .path.display(), .issues.len())]
pub struct ConfigError {
    pub path: PathBuf,
    pub issues: Vec<ConfigIssue>,
}

/// A parsed configuration file.
#[derive(Debug)]
pub struct ConfigFile {
    pub path: PathBuf,
    table: Table,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let table: Table = content
            .parse()
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), table })
    }

    /// Appends one issue per missing section or required key of `name`.
    pub fn check_section(&self, name: &str, schema: &SectionSchema, issues: &mut Vec<ConfigIssue>) {
        match self.table.get(name).and_then(Value::as_table) {
            None => issues.push(ConfigIssue::MissingSection(name.to_string())),
            Some(table) => {
                for key in schema.required_keys() {
                    if !table.contains_key(key) {
                        issues.push(ConfigIssue::MissingOption {
                            section: name.to_string(),
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Validates one section and returns a typed view over it.
    pub fn section<'a>(&'a self, name: &'a str, schema: &'a SectionSchema) -> Result<Section<'a>> {
        let mut issues = Vec::new();
        self.check_section(name, schema, &mut issues);
        self.fail_on(issues)?;
        self.section_unchecked(name, schema)
    }

    fn section_unchecked<'a>(&'a self, name: &'a str, schema: &'a SectionSchema) -> Result<Section<'a>> {
        let table = self
            .table
            .get(name)
            .and_then(Value::as_table)
            .ok_or_else(|| anyhow!("section [{}] is not a table", name))?;
        Ok(Section { name, table, schema })
    }

    fn fail_on(&self, issues: Vec<ConfigIssue>) -> Result<()> {
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { path: self.path.clone(), issues }.into())
        }
    }
}

/// A validated section; lookups fall back to the schema defaults.
pub struct Section<'a> {
    pub name: &'a str,
    table: &'a Table,
    schema: &'a SectionSchema,
}

impl Section<'_> {
    fn raw(&self, key: &str) -> Option<&Value> {
        self.table.get(key)
    }

    /// A scalar value rendered as text, or the schema default.
    pub fn string(&self, key: &str) -> Result<String> {
        match self.raw(key) {
            Some(value) => scalar_to_string(value)
                .ok_or_else(|| anyhow!("{}.{} must be a string or a number", self.name, key)),
            None => self
                .schema
                .default_for(key)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("Option {}.{} missing, please add.", self.name, key)),
        }
    }

    pub fn path(&self, key: &str) -> Result<PathBuf> {
        self.string(key).map(PathBuf::from)
    }

    /// Items of an array value or of a comma separated string.
    pub fn list(&self, key: &str) -> Result<Vec<String>> {
        let value = self
            .raw(key)
            .ok_or_else(|| anyhow!("Option {}.{} missing, please add.", self.name, key))?;
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    scalar_to_string(item)
                        .ok_or_else(|| anyhow!("{}.{} items must be strings or numbers", self.name, key))
                })
                .collect(),
            other => {
                let text = scalar_to_string(other)
                    .ok_or_else(|| anyhow!("{}.{} must be a list", self.name, key))?;
                Ok(text.split(',').map(|s| s.trim().to_string()).collect())
            }
        }
    }

    pub fn index_list(&self, key: &str) -> Result<Vec<usize>> {
        self.list(key)?
            .iter()
            .map(|item| {
                item.parse::<usize>()
                    .with_context(|| format!("{}.{}: {:?} is not a valid index", self.name, key, item))
            })
            .collect()
    }

    pub fn optional_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::Float(f)) => Ok(Some(*f)),
            Some(Value::Integer(i)) => Ok(Some(*i as f64)),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .with_context(|| format!("{}.{} must be a number", self.name, key)),
            Some(_) => Err(anyhow!("{}.{} must be a number", self.name, key)),
        }
    }

    pub fn optional_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::Integer(i)) if *i >= 0 => Ok(Some(*i as u64)),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .with_context(|| format!("{}.{} must be a non-negative integer", self.name, key)),
            Some(_) => Err(anyhow!("{}.{} must be a non-negative integer", self.name, key)),
        }
    }

    pub fn optional_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::Boolean(b)) => Ok(Some(*b)),
            Some(_) => Err(anyhow!("{}.{} must be true or false", self.name, key)),
        }
    }
}

/// Renders a scalar TOML value the way it is passed on to other programs.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Integer(i) => Some(i.to_string()),
        // Debug keeps the fraction of whole numbers: 0.0 stays "0.0"
        Value::Float(f) => Some(format!("{:?}", f)),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// Stage configurations
// ============================================================================

/// `[normalize]` section.
#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    pub input_dir: PathBuf,
    pub image_list_csv: PathBuf,
    pub output_dir: PathBuf,
    pub input_filename_ending: String,
    pub output_filename_ending: String,
}

impl NormalizeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_file(&ConfigFile::read(path)?)
    }

    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        let s = file.section(NORMALIZE_SECTION, &NORMALIZE_SCHEMA)?;
        Ok(Self {
            input_dir: s.path("input_dir")?,
            image_list_csv: s.path("image_list_csv")?,
            output_dir: s.path("output_dir")?,
            input_filename_ending: s.string("input_filename_ending")?,
            output_filename_ending: s.string("output_filename_ending")?,
        })
    }
}

/// `[register]` section.
#[derive(Debug, Clone)]
pub struct RegisterConfig {
    pub reference_image: PathBuf,
    pub reference_mask: PathBuf,
    pub input_dir: PathBuf,
    pub images_to_register: PathBuf,
    pub output_dir: PathBuf,
    pub output_filename_ending: String,
    pub settings: RegistrationSettings,
}

impl RegisterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_file(&ConfigFile::read(path)?)
    }

    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        let s = file.section(REGISTER_SECTION, &REGISTER_SCHEMA)?;

        let mut settings = RegistrationSettings::default();
        if let Some(bins) = s.optional_u64("histogram_bins")? {
            settings.histogram_bins = bins as usize;
        }
        if let Some(pct) = s.optional_f64("sampling_percentage")? {
            settings.sampling_percentage = pct;
        }
        if let Some(rate) = s.optional_f64("learning_rate")? {
            settings.learning_rate = rate;
        }
        if let Some(iterations) = s.optional_u64("number_of_iterations")? {
            settings.number_of_iterations = iterations as usize;
        }
        if let Some(min) = s.optional_f64("convergence_minimum_value")? {
            settings.convergence_minimum_value = min;
        }
        if let Some(window) = s.optional_u64("convergence_window_size")? {
            settings.convergence_window_size = window as usize;
        }
        if let Some(estimate) = s.optional_bool("estimate_learning_rate")? {
            settings.estimate_learning_rate = estimate;
        }
        if let Some(seed) = s.optional_u64("random_seed")? {
            settings.random_seed = seed;
        }
        settings.validate()?;

        Ok(Self {
            reference_image: s.path("reference_image")?,
            reference_mask: s.path("reference_mask")?,
            input_dir: s.path("input_dir")?,
            images_to_register: s.path("images_to_register")?,
            output_dir: s.path("output_dir")?,
            output_filename_ending: s.string("output_filename_ending")?,
            settings,
        })
    }
}

/// One experiment section referenced from `[t2map]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub name: String,
    pub input_dir: PathBuf,
    pub image_list_csv: PathBuf,
    pub images_to_use: Vec<usize>,
    pub output_dir: PathBuf,
    pub output_basename: String,
    pub input_filename_ending: String,
    pub method: String,
    pub threshold: String,
}

/// `[t2map]` section together with all experiments it names.
#[derive(Debug, Clone)]
pub struct T2MapConfig {
    pub executable: String,
    pub timeout_secs: u64,
    pub experiments: Vec<ExperimentConfig>,
}

impl T2MapConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_file(&ConfigFile::read(path)?)
    }

    /// Validates `[t2map]` first, then every experiment section it lists.
    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        let main = file.section(T2MAP_SECTION, &T2MAP_SCHEMA)?;

        let names: Vec<String> = main
            .list("experiments_to_run")?
            .into_iter()
            .map(|name| name.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .collect();

        let mut issues = Vec::new();
        if names.is_empty() || names.iter().any(String::is_empty) {
            issues.push(ConfigIssue::MissingOption {
                section: T2MAP_SECTION.to_string(),
                key: "experiments_to_run".to_string(),
            });
        } else {
            for name in &names {
                file.check_section(name, &EXPERIMENT_SCHEMA, &mut issues);
            }
        }
        file.fail_on(issues)?;

        let experiments = names
            .iter()
            .map(|name| {
                let s = file.section_unchecked(name, &EXPERIMENT_SCHEMA)?;
                Ok(ExperimentConfig {
                    name: name.clone(),
                    input_dir: s.path("input_dir")?,
                    image_list_csv: s.path("image_list_csv")?,
                    images_to_use: s.index_list("images_to_use")?,
                    output_dir: s.path("output_dir")?,
                    output_basename: s.string("output_basename")?,
                    input_filename_ending: s.string("input_filename_ending")?,
                    method: s.string("method")?,
                    threshold: s.string("threshold")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            executable: main
                .raw("executable")
                .and_then(scalar_to_string)
                .unwrap_or_else(|| DEFAULT_T2MAP_EXECUTABLE.to_string()),
            timeout_secs: main
                .optional_u64("timeout_secs")?
                .unwrap_or(DEFAULT_T2MAP_TIMEOUT_SECS),
            experiments,
        })
    }
}
