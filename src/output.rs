//! Output formatting and persistence for station scores.
//!
//! Supports JSON logging of a cycle's results and CSV append for the
//! score history.

use anyhow::Result;
use tracing::{debug, info};

use crate::scoring::{ScoreRecord, StationScore};
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// Logs station scores as pretty-printed JSON.
pub fn print_json(scores: &[StationScore]) -> Result<()> {
    let records: Vec<ScoreRecord> = scores.iter().map(ScoreRecord::from).collect();
    info!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// Appends [`ScoreRecord`]s as rows to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_records(path: &str, records: &[ScoreRecord]) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, rows = records.len(), "Appending score history");

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}
