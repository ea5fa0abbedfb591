//! Serializing fetched rows into the data file that gets archived

use crate::{OutputFormat, PackagerError, Row};
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write `rows` to `path` in `format`, returning the number of bytes written.
///
/// Delimited formats get a header made of every field seen in any row;
/// missing fields are left empty.
pub fn write_rows(path: &Path, rows: &[Row], format: OutputFormat) -> Result<u64, PackagerError> {
    let file = std::fs::File::create(path)?;
    let mut out = BufWriter::new(file);

    match format {
        OutputFormat::Json => {
            for row in rows {
                serde_json::to_writer(&mut out, row)
                    .map_err(|e| PackagerError::StorageFailure(e.to_string()))?;
                out.write_all(b"\n")?;
            }
        }
        OutputFormat::Csv | OutputFormat::Dwc => write_delimited(&mut out, rows, b',')?,
        OutputFormat::Tsv => write_delimited(&mut out, rows, b'\t')?,
    }

    let file = out
        .into_inner()
        .map_err(|e| PackagerError::StorageFailure(e.to_string()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn write_delimited(out: &mut impl Write, rows: &[Row], delimiter: u8) -> Result<(), PackagerError> {
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(out);
    writer.write_record(&columns).map_err(csv_error)?;

    for row in rows {
        let cells = columns.iter().map(|column| match row.get(*column) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        });
        writer.write_record(cells).map_err(csv_error)?;
    }

    writer.flush()?;
    Ok(())
}

fn csv_error(err: csv::Error) -> PackagerError {
    PackagerError::StorageFailure(format!("failed to write row: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Row> {
        vec![
            json!({"_id": 1, "name": "Apis mellifera", "note": "says \"buzz\""}),
            json!({"_id": 2, "name": "Bombus, terrestris", "count": 3}),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
    }

    #[test]
    fn test_csv_quotes_and_fills_missing_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let bytes = write_rows(&path, &rows(), OutputFormat::Csv).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        assert_eq!(bytes, text.len() as u64);
        assert_eq!(
            text,
            "_id,count,name,note\n1,,Apis mellifera,\"says \"\"buzz\"\"\"\n2,3,\"Bombus, terrestris\",\n"
        );
    }

    #[test]
    fn test_tsv_and_json_lines() {
        let dir = tempfile::tempdir().unwrap();

        let tsv = dir.path().join("out.tsv");
        write_rows(&tsv, &rows(), OutputFormat::Tsv).unwrap();
        let text = std::fs::read_to_string(&tsv).unwrap();
        assert!(text.starts_with("_id\tcount\tname\tnote\n"));
        assert!(text.contains("2\t3\tBombus, terrestris\t\n"));

        let jsonl = dir.path().join("out.jsonl");
        write_rows(&jsonl, &rows(), OutputFormat::Json).unwrap();
        let lines: Vec<Value> = std::fs::read_to_string(&jsonl)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["count"], json!(3));
    }
}
