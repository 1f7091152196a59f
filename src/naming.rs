//! Filename templating shared by every stage.
//!
//! The names produced here are consumed by the next stage of the pipeline,
//! so they have to stay stable byte for byte.

use std::path::Path;

/// Splits `name` into `(stem, extension)` where the extension keeps its dot.
///
/// Only the last extension is split off (`a.nii.gz` -> `("a.nii", ".gz")`),
/// and a leading dot does not start an extension (`.hidden` has none).
pub fn split_extension(name: &str) -> (&str, &str) {
    let file_start = name.rfind(|c: char| c == '/' || c == '\\').map(|i| i + 1).unwrap_or(0);
    let file = &name[file_start..];

    let Some(dot) = file.rfind('.') else {
        return (name, "");
    };
    // dots at the very start of the file name belong to the stem
    let leading_dots = file.len() - file.trim_start_matches('.').len();
    if dot < leading_dots {
        return (name, "");
    }

    let split = file_start + dot;
    (&name[..split], &name[split..])
}

/// Inserts `ending` between the stem and the extension of `name`.
pub fn insert_ending(name: &str, ending: &str) -> String {
    let (stem, ext) = split_extension(name);
    format!("{}{}{}", stem, ending, ext)
}

/// Returns the final component of `name`, or `name` itself if it has none.
pub fn base_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
}

/// Name of the file written by a stage: basename of `name` with `ending` inserted.
pub fn output_file_name(name: &str, ending: &str) -> String {
    insert_ending(base_name(name), ending)
}

/// Builds `{PatientID}_{index}_{SequenceName}_TR{RepetitionTime}_TE{EchoTime}`
/// with all whitespace removed.
pub fn series_file_name(
    patient_id: &str,
    index: usize,
    sequence_name: &str,
    repetition_time: &str,
    echo_time: &str,
) -> String {
    let name = format!(
        "{}_{}_{}_TR{}_TE{}",
        patient_id, index, sequence_name, repetition_time, echo_time
    );
    name.chars().filter(|c| !c.is_whitespace()).collect()
}
