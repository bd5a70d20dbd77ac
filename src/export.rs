//! Materialises a query result set into one of the four supported export
//! formats, all from the same in-memory `(columns, rows)` shape so the
//! format-specific code never has to know where the data came from.

use std::path::Path;

use anyhow::Context;
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{Field, Schema};
use serde_json::Value;
use std::sync::Arc;

use crate::models::ExportType;

/// A single result set, row-major, with every cell already rendered to its
/// display text. This mirrors what the original DataFrame-based pipeline
/// produced before handing off to a per-format writer, and keeps the writers
/// themselves free of any SQL-driver-specific value types.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

pub struct Exporter;

impl Exporter {
    pub fn new() -> Self {
        Self
    }

    /// Write `result` to `path` in `format`, creating parent directories as
    /// needed. Returns the file size in bytes once written.
    pub fn write(&self, result: &ResultSet, format: ExportType, path: &Path) -> anyhow::Result<u64> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create export directory {}", parent.display()))?;
        }

        match format {
            ExportType::Csv => write_csv(result, path)?,
            ExportType::Excel => write_xlsx(result, path)?,
            ExportType::Json => write_json(result, path)?,
            ExportType::Feather => write_feather(result, path)?,
        }

        let size = std::fs::metadata(path)
            .with_context(|| format!("failed to stat export file {}", path.display()))?
            .len();

        Ok(size)
    }
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_csv(result: &ResultSet, path: &Path) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open CSV writer for {}", path.display()))?;

    writer.write_record(&result.columns)?;
    for row in &result.rows {
        writer.write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))?;
    }
    writer.flush().context("failed to flush CSV writer")?;
    Ok(())
}

fn write_json(result: &ResultSet, path: &Path) -> anyhow::Result<()> {
    let records: Vec<Value> = result
        .rows
        .iter()
        .map(|row| {
            let map = result
                .columns
                .iter()
                .zip(row.iter())
                .map(|(col, cell)| {
                    let value = cell
                        .as_deref()
                        .map(|s| Value::String(s.to_string()))
                        .unwrap_or(Value::Null);
                    (col.clone(), value)
                })
                .collect();
            Value::Object(map)
        })
        .collect();

    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create JSON export file {}", path.display()))?;
    serde_json::to_writer(file, &records).context("failed to write JSON export")?;
    Ok(())
}

fn write_xlsx(result: &ResultSet, path: &Path) -> anyhow::Result<()> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();

    for (col_idx, name) in result.columns.iter().enumerate() {
        sheet.write_string(0, col_idx as u16, name)?;
    }

    for (row_idx, row) in result.rows.iter().enumerate() {
        for (col_idx, cell) in row.iter().enumerate() {
            if let Some(value) = cell {
                sheet.write_string((row_idx + 1) as u32, col_idx as u16, value)?;
            }
        }
    }

    workbook
        .save(path)
        .with_context(|| format!("failed to save XLSX export to {}", path.display()))?;
    Ok(())
}

/// Every column is written as an Arrow `Utf8` column; the processor only
/// ever sees already-rendered display text (see [`ResultSet`]), so there is
/// no native numeric/temporal type to preserve.
fn write_feather(result: &ResultSet, path: &Path) -> anyhow::Result<()> {
    let fields: Vec<Field> = result
        .columns
        .iter()
        .map(|name| Field::new(name, arrow_schema::DataType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let arrays: Vec<ArrayRef> = (0..result.column_count())
        .map(|col_idx| {
            let values: Vec<Option<&str>> = result
                .rows
                .iter()
                .map(|row| row.get(col_idx).and_then(|c| c.as_deref()))
                .collect();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect();

    let batch = RecordBatch::try_new(schema.clone(), arrays)
        .context("failed to build Arrow record batch")?;

    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create feather export file {}", path.display()))?;
    let mut writer = arrow_ipc::writer::FileWriter::try_new(file, schema.as_ref())
        .context("failed to open Arrow IPC file writer")?;
    writer.write(&batch).context("failed to write Arrow record batch")?;
    writer.finish().context("failed to finalize feather file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: vec![
                vec![Some("1".to_string()), Some("alice".to_string())],
                vec![Some("2".to_string()), None],
            ],
        }
    }

    #[test]
    fn csv_export_round_trips_headers_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let exporter = Exporter::new();

        let size = exporter.write(&sample(), ExportType::Csv, &path).unwrap();
        assert!(size > 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("id,name"));
        assert!(contents.contains("1,alice"));
        assert!(contents.contains("2,"));
    }

    #[test]
    fn json_export_uses_null_for_missing_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let exporter = Exporter::new();

        exporter.write(&sample(), ExportType::Json, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(&contents).unwrap();
        let rows = value.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], Value::Null);
    }

    #[test]
    fn feather_export_produces_a_nonempty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.feather");
        let exporter = Exporter::new();

        let size = exporter
            .write(&sample(), ExportType::Feather, &path)
            .unwrap();
        assert!(size > 0);
    }
}
