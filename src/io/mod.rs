//! Volume file formats, selected by file extension.

pub mod metaimage;
pub mod nii;

use anyhow::{bail, Result};
use std::path::Path;
use tracing::debug;

use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// `.mha`, header and data in one file
    MetaImage,
    /// `.mhd` header with a separate `.raw`
    MetaHeader,
    /// `.nii` or `.nii.gz`
    Nifti,
}

impl VolumeFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".mha") {
            Ok(VolumeFormat::MetaImage)
        } else if name.ends_with(".mhd") {
            Ok(VolumeFormat::MetaHeader)
        } else if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Ok(VolumeFormat::Nifti)
        } else {
            bail!(
                "Unsupported image file {}. Use .mha, .mhd, .nii or .nii.gz",
                path.display()
            )
        }
    }
}

/// Checks that `extension` (with or without leading dot) names a writable format.
pub fn check_extension(extension: &str) -> Result<()> {
    let name = format!("image.{}", extension.trim_start_matches('.'));
    VolumeFormat::from_path(Path::new(&name)).map(|_| ())
}

pub fn read_volume(path: &Path) -> Result<Volume> {
    debug!("reading {}", path.display());
    match VolumeFormat::from_path(path)? {
        VolumeFormat::MetaImage | VolumeFormat::MetaHeader => metaimage::read(path),
        VolumeFormat::Nifti => nii::read(path),
    }
}

pub fn write_volume(path: &Path, volume: &Volume) -> Result<()> {
    debug!("writing {}", path.display());
    match VolumeFormat::from_path(path)? {
        VolumeFormat::MetaImage => metaimage::write_mha(path, volume),
        VolumeFormat::MetaHeader => metaimage::write_mhd(path, volume),
        VolumeFormat::Nifti => nii::write(path, volume),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(VolumeFormat::from_path(Path::new("a/b.mha")).unwrap(), VolumeFormat::MetaImage);
        assert_eq!(VolumeFormat::from_path(Path::new("b.MHD")).unwrap(), VolumeFormat::MetaHeader);
        assert_eq!(VolumeFormat::from_path(Path::new("b.nii.gz")).unwrap(), VolumeFormat::Nifti);
        assert!(VolumeFormat::from_path(Path::new("b.png")).is_err());
        assert!(check_extension(".mha").is_ok());
        assert!(check_extension("nii.gz").is_ok());
        assert!(check_extension(".dcm").is_err());
    }
}
