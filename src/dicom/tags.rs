//! Metadata tags read from the first file of every series.

use anyhow::{anyhow, bail, Result};
use dicom_core::Tag;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Tags known to the converter, keyed by their group/element pair.
pub const SERIES_TAGS: &[(Tag, &str)] = &[
    (Tag(0x0008, 0x0016), "SOPClassUID"),
    (Tag(0x0008, 0x0022), "AcquisitionDate"),
    (Tag(0x0008, 0x0031), "AcquisitionTime"),
    (Tag(0x0008, 0x0060), "Modality"),
    (Tag(0x0008, 0x0070), "Manufacturer"),
    (Tag(0x0008, 0x0080), "InstitutionName"),
    (Tag(0x0008, 0x0090), "ReferringPhysicianName"),
    (Tag(0x0008, 0x1030), "StudyDescription"),
    (Tag(0x0008, 0x103e), "SeriesDescription"),
    (Tag(0x0008, 0x1070), "OperatorsName"),
    (Tag(0x0008, 0x1090), "ManufacturersModelName"),
    (Tag(0x0010, 0x0010), "PatientName"),
    (Tag(0x0010, 0x0020), "PatientID"),
    (Tag(0x0010, 0x0030), "PatientBirthDate"),
    (Tag(0x0010, 0x0040), "PatientSex"),
    (Tag(0x0010, 0x1010), "PatientAge"),
    (Tag(0x0010, 0x1030), "PatientWeight"),
    (Tag(0x0018, 0x0015), "BodyPartExamined"),
    (Tag(0x0018, 0x0020), "ScanningSequence"),
    (Tag(0x0018, 0x0021), "SequenceVariant"),
    (Tag(0x0018, 0x0023), "MRAcquisitionType"),
    (Tag(0x0018, 0x0024), "SequenceName"),
    (Tag(0x0018, 0x0050), "SliceThickness"),
    (Tag(0x0018, 0x0080), "RepetitionTime"),
    (Tag(0x0018, 0x0081), "EchoTime"),
    (Tag(0x0018, 0x0083), "NumberOfAverages"),
    (Tag(0x0018, 0x0087), "MagneticFieldStrength"),
    (Tag(0x0018, 0x0088), "SpacingBetweenSlices"),
    (Tag(0x0018, 0x0089), "NumberOfPhaseEncodingSteps"),
    (Tag(0x0018, 0x0091), "EchoTrainLength"),
    (Tag(0x0018, 0x0095), "PixelBandwidth"),
    (Tag(0x0018, 0x1030), "ProtocolName"),
    (Tag(0x0018, 0x1100), "ReconstructionDiameter"),
    (Tag(0x0018, 0x1250), "ReceiveCoilName"),
    (Tag(0x0018, 0x1314), "FlipAngle"),
    (Tag(0x0020, 0x0010), "StudyID"),
    (Tag(0x0020, 0x0020), "PatientOrientation"),
    (Tag(0x0020, 0x1041), "SliceLocation"),
    (Tag(0x0028, 0x0010), "Rows"),
    (Tag(0x0028, 0x0011), "Columns"),
    (Tag(0x0028, 0x0030), "PixelSpacing"),
];

/// Tags shown by `dicom --info`.
pub const TAGS_TO_PRINT: &[&str] = &[
    "PatientID",
    "StudyID",
    "BodyPartExamined",
    "SequenceName",
    "SeriesDescription",
    "SliceThickness",
    "SpacingBetweenSlices",
    "RepetitionTime",
    "EchoTime",
];

/// `gggg|eeee`, the key style used by imaging toolkits for DICOM metadata.
pub fn tag_key(tag: Tag) -> String {
    format!("{:04x}|{:04x}", tag.0, tag.1)
}

/// Two-way lookup between tags and names.
#[derive(Debug)]
pub struct TagTable {
    entries: &'static [(Tag, &'static str)],
    by_tag: HashMap<Tag, &'static str>,
    by_name: HashMap<&'static str, Tag>,
}

impl TagTable {
    /// Builds the table, rejecting any tag or name listed twice.
    pub fn build(entries: &'static [(Tag, &'static str)]) -> Result<Self> {
        let mut by_tag = HashMap::with_capacity(entries.len());
        let mut by_name = HashMap::with_capacity(entries.len());
        for &(tag, name) in entries {
            if by_tag.insert(tag, name).is_some() {
                bail!("tag {} listed twice", tag_key(tag));
            }
            if by_name.insert(name, tag).is_some() {
                bail!("tag name {} listed twice", name);
            }
        }
        Ok(Self { entries, by_tag, by_name })
    }

    /// The process-wide table over [`SERIES_TAGS`].
    pub fn standard() -> Result<&'static TagTable> {
        static TABLE: OnceLock<std::result::Result<TagTable, String>> = OnceLock::new();
        TABLE
            .get_or_init(|| TagTable::build(SERIES_TAGS).map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| anyhow!("invalid tag table: {}", e))
    }

    pub fn name_of(&self, tag: Tag) -> Option<&'static str> {
        self.by_tag.get(&tag).copied()
    }

    pub fn tag_of(&self, name: &str) -> Option<Tag> {
        self.by_name.get(name).copied()
    }

    /// Entries in declaration order.
    pub fn entries(&self) -> &'static [(Tag, &'static str)] {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_is_bijective() {
        let table = TagTable::standard().unwrap();
        assert_eq!(table.entries().len(), 41);
        for &(tag, name) in table.entries() {
            assert_eq!(table.name_of(tag), Some(name));
            assert_eq!(table.tag_of(name), Some(tag));
        }
    }

    #[test]
    fn test_lookups() {
        let table = TagTable::standard().unwrap();
        assert_eq!(table.tag_of("PatientID"), Some(Tag(0x0010, 0x0020)));
        assert_eq!(table.name_of(Tag(0x0018, 0x0081)), Some("EchoTime"));
        assert_eq!(tag_key(Tag(0x0008, 0x103e)), "0008|103e");
        assert!(table.tag_of("NoSuchTag").is_none());
        for name in TAGS_TO_PRINT {
            assert!(table.tag_of(name).is_some(), "{} not in table", name);
        }
    }

    #[test]
    fn test_duplicates_are_rejected() {
        static DUP_TAG: &[(Tag, &str)] = &[(Tag(0x0010, 0x0020), "A"), (Tag(0x0010, 0x0020), "B")];
        static DUP_NAME: &[(Tag, &str)] = &[(Tag(0x0010, 0x0020), "A"), (Tag(0x0010, 0x0010), "A")];
        assert!(TagTable::build(DUP_TAG).is_err());
        assert!(TagTable::build(DUP_NAME).is_err());
    }
}
