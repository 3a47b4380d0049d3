//! Catalog readers and writers.
//!
//! - [`sextractor`]: reference and per-exposure detection catalogs as written
//!   by the source extractor (`ASCII_HEAD` text or CSV).
//! - [`calibrated`]: the calibrated output catalog, as text or an rkyv snapshot.

pub mod calibrated;
pub mod sextractor;

pub use calibrated::{write_calibrated_catalog, CalibratedCatalog, NULL_TOKEN};
pub use sextractor::{
    load_sextractor_catalog_from_file, read_catalog_csv, read_catalog_csv_from_reader,
    read_sextractor_catalog, REQUIRED_COLUMNS,
};
