//! DICOM input: series discovery, metadata and pixel loading.

pub mod series;
pub mod tags;

pub use series::{load_series, scan_series, DicomSeries, SeriesHeader};
pub use tags::{TagTable, TAGS_TO_PRINT};
