//! Readers for source-extractor catalogs.
//!
//! The extractor's `ASCII_HEAD` format starts with one comment line per output
//! parameter:
//!
//! ```text
//! #   1 NUMBER                 Running object number
//! #   2 MAG_AUTO               Kron-like elliptical aperture magnitude         [mag]
//! ...
//! ```
//!
//! followed by whitespace-separated data rows. Column positions are 1-based and
//! a vector parameter occupies several columns, so positions are taken from the
//! header rather than assumed.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use tracing::info;

use crate::detection::CatalogEntry;
use crate::error::{PhotocalError, Result};

pub const REQUIRED_COLUMNS: [&str; 7] = [
    "NUMBER",
    "MAG_AUTO",
    "MAGERR_AUTO",
    "ALPHA_J2000",
    "DELTA_J2000",
    "FWHM_WORLD",
    "FLAGS",
];

/// Zero-based field index of every catalog column this crate reads.
#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    number: usize,
    mag: usize,
    mag_err: usize,
    ra: usize,
    dec: usize,
    fwhm: usize,
    flags: usize,
    x: Option<usize>,
    y: Option<usize>,
}

impl ColumnMap {
    fn from_names(columns: &HashMap<String, usize>) -> Result<Self> {
        let get = |name: &str| {
            columns
                .get(name)
                .copied()
                .ok_or_else(|| PhotocalError::InvalidInput(format!("catalog has no {name} column")))
        };
        Ok(Self {
            number: get("NUMBER")?,
            mag: get("MAG_AUTO")?,
            mag_err: get("MAGERR_AUTO")?,
            ra: get("ALPHA_J2000")?,
            dec: get("DELTA_J2000")?,
            fwhm: get("FWHM_WORLD")?,
            flags: get("FLAGS")?,
            x: columns.get("X_IMAGE").copied(),
            y: columns.get("Y_IMAGE").copied(),
        })
    }

    fn parse_row<'a, F>(&self, line: usize, field: F) -> Result<CatalogEntry>
    where
        F: Fn(usize) -> Option<&'a str>,
    {
        let num = |idx: usize, name: &str| -> Result<f64> {
            let raw = field(idx).ok_or_else(|| PhotocalError::Parse {
                line,
                message: format!("missing {name} field"),
            })?;
            raw.trim().parse::<f64>().map_err(|_| PhotocalError::Parse {
                line,
                message: format!("{name} is not a number: {raw:?}"),
            })
        };
        let opt = |idx: Option<usize>, name: &str| -> Result<f64> {
            match idx {
                Some(i) => num(i, name),
                None => Ok(0.0),
            }
        };

        Ok(CatalogEntry {
            id: num(self.number, "NUMBER")? as u64,
            ra_deg: num(self.ra, "ALPHA_J2000")?,
            dec_deg: num(self.dec, "DELTA_J2000")?,
            mag: num(self.mag, "MAG_AUTO")?,
            mag_err: num(self.mag_err, "MAGERR_AUTO")?,
            fwhm_deg: num(self.fwhm, "FWHM_WORLD")?,
            x: opt(self.x, "X_IMAGE")?,
            y: opt(self.y, "Y_IMAGE")?,
            flags: num(self.flags, "FLAGS")? as i32,
            near_edge: false,
        })
    }
}

/// Parse a `#   N NAME ...` header line into its 1-based column number and name.
fn parse_header_line(line: &str) -> Option<(usize, String)> {
    let mut tokens = line.trim_start_matches('#').split_whitespace();
    let column: usize = tokens.next()?.parse().ok()?;
    let name = tokens.next()?;
    (column > 0).then(|| (column, name.to_string()))
}

/// Parse an `ASCII_HEAD` catalog held in memory.
///
/// Reference catalogs have no pixel columns; their `x`/`y` are zero.
pub fn read_sextractor_catalog(text: &str) -> Result<Vec<CatalogEntry>> {
    let mut columns: HashMap<String, usize> = HashMap::new();
    let mut column_map: Option<ColumnMap> = None;
    let mut entries = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            if let Some((column, name)) = parse_header_line(trimmed) {
                columns.entry(name).or_insert(column - 1);
            }
            continue;
        }

        let map = match column_map {
            Some(m) => m,
            None => *column_map.insert(ColumnMap::from_names(&columns)?),
        };
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        entries.push(map.parse_row(lineno + 1, |i| fields.get(i).copied())?);
    }

    if column_map.is_none() && !columns.is_empty() {
        // Header only: still validate it.
        ColumnMap::from_names(&columns)?;
    }
    Ok(entries)
}

pub fn load_sextractor_catalog_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<CatalogEntry>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)?;
    let entries = read_sextractor_catalog(&data)?;
    info!("Loaded {} catalog rows from {}", entries.len(), path.display());
    Ok(entries)
}

/// Read the same columns from a CSV file with a header row.
pub fn read_catalog_csv_from_reader<R: Read>(reader: R) -> Result<Vec<CatalogEntry>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let columns: HashMap<String, usize> = rdr
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_uppercase(), i))
        .collect();
    let map = ColumnMap::from_names(&columns)?;

    rdr.records()
        .enumerate()
        .map(|(row, result)| {
            let record = result?;
            // Header is line 1
            map.parse_row(row + 2, |i| record.get(i))
        })
        .collect()
}

pub fn read_catalog_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<CatalogEntry>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let entries = read_catalog_csv_from_reader(file)?;
    info!("Loaded {} catalog rows from {}", entries.len(), path.display());
    Ok(entries)
}
