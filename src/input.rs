//! CSV loading for observed and simulated tables.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::analyzers::normalize::RawTable;

/// Reads a CSV file into a [`RawTable`]. Files ending in `.gz` are
/// decompressed on the fly.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or is not valid CSV.
/// Ragged rows are accepted; normalization treats absent cells as missing.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_table<P: AsRef<Path>>(path: P) -> Result<RawTable> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?;

    let reader: Box<dyn Read> = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let table =
        read_table(reader).with_context(|| format!("failed to read CSV '{}'", path.display()))?;
    debug!(rows = table.len(), columns = table.headers().len(), "Loaded table");
    Ok(table)
}

/// Reads CSV text with a header row from any reader.
pub fn read_table<R: Read>(reader: R) -> Result<RawTable> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    let mut table = RawTable::new(headers);

    for result in rdr.records() {
        let record = result?;
        table.push_row(record.iter());
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::env;
    use std::fs;
    use std::io::Write;

    const SAMPLE: &str = "gantry_id,start_time,flow\nG01,2025-06-03 07:00:00,100\nG02,2025-06-03 07:00:00\n";

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    #[test]
    fn test_read_table_accepts_ragged_rows() {
        let table = read_table(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.headers(), ["gantry_id", "start_time", "flow"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_read_table_strips_bom() {
        let table = read_table("\u{feff}gantry_id,flow\nG01,1\n".as_bytes()).unwrap();
        assert_eq!(table.headers()[0], "gantry_id");
    }

    #[test]
    fn test_load_plain_csv() {
        let path = temp_path("flow_accuracy_input_plain.csv");
        fs::write(&path, SAMPLE).unwrap();

        let table = load_table(&path).unwrap();
        assert_eq!(table.len(), 2);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_gzip_csv() {
        let path = temp_path("flow_accuracy_input_gz.csv.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();

        let table = load_table(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.headers().len(), 3);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_table("/nonexistent/flow_accuracy.csv").unwrap_err();
        assert!(err.to_string().contains("failed to open"));
    }
}
