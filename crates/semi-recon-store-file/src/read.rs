use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use semi_recon_core::{Cell, Table};
use serde::{Deserialize, Serialize};

/// Where the header sits and which worksheet to read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReadOptions {
    /// Worksheet name; the first sheet when `None`. Ignored for CSV and JSON.
    #[serde(default)]
    pub sheet: Option<String>,
    /// Zero-based row holding the column names. Rows above it are discarded.
    #[serde(default)]
    pub header_row: usize,
}

impl ReadOptions {
    #[must_use]
    pub fn with_header_row(header_row: usize) -> Self {
        Self {
            sheet: None,
            header_row,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TableFormat {
    Csv,
    Workbook,
    Json,
}

impl TableFormat {
    /// Pick a reader from the file extension.
    ///
    /// # Errors
    /// Returns an error when the extension is missing or unsupported.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                anyhow!("cannot infer table format of {}: no extension", path.display())
            })?;
        match extension.as_str() {
            "csv" => Ok(Self::Csv),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(Self::Workbook),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unsupported table format `.{other}` for {}", path.display())),
        }
    }
}

/// Interpret one text field. Numeric-looking text becomes a number unless it
/// carries a leading zero, which marks an identifier such as `0012`.
#[must_use]
pub fn parse_cell(raw: &str) -> Cell {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Cell::Empty;
    }
    let unsigned = trimmed.strip_prefix(['-', '+']).unwrap_or(trimmed);
    let numeric_shape = unsigned.starts_with(|ch: char| ch.is_ascii_digit() || ch == '.')
        && unsigned
            .chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '-' | '+'));
    let leading_zero = unsigned.len() > 1
        && unsigned.starts_with('0')
        && !unsigned[1..].starts_with(['.', 'e', 'E']);
    if numeric_shape && !leading_zero {
        if let Ok(value) = trimmed.parse::<f64>() {
            if value.is_finite() {
                return Cell::Number(value);
            }
        }
    }
    Cell::text(raw)
}

#[allow(clippy::cast_precision_loss)]
fn workbook_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        // numbers typed into text-formatted cells
        Data::String(text) => parse_cell(text),
        Data::DateTimeIso(text) | Data::DurationIso(text) => Cell::text(text.clone()),
        Data::Float(value) => Cell::Number(*value),
        Data::Int(value) => Cell::Number(*value as f64),
        Data::Bool(value) => Cell::text(if *value { "TRUE" } else { "FALSE" }),
        // spreadsheet serial day number; the pivot builder converts it
        Data::DateTime(value) => Cell::Number(value.as_f64()),
        Data::Error(err) => {
            tracing::debug!(error = ?err, "spreadsheet error cell read as blank");
            Cell::Empty
        }
    }
}

/// Turn raw rows into a table: the row at `header_row` names the columns,
/// wholly blank rows are skipped, and short rows are padded with blanks.
fn assemble(name: &str, raw_rows: Vec<Vec<Cell>>, header_row: usize) -> Result<Table> {
    let mut rows = raw_rows.into_iter().skip(header_row);
    let header = rows.next().ok_or_else(|| {
        anyhow!("table `{name}` has no header at row {header_row}")
    })?;

    let mut columns: Vec<String> = Vec::with_capacity(header.len());
    for (position, cell) in header.iter().enumerate() {
        let mut column = cell.key_text().trim_start_matches('\u{feff}').to_string();
        if column.trim().is_empty() {
            column = format!("column_{}", position + 1);
        }
        let base = column.clone();
        let mut suffix = 1;
        while columns.contains(&column) {
            column = format!("{base}.{suffix}");
            suffix += 1;
        }
        columns.push(column);
    }

    let width = columns.len();
    let mut table = Table::new(name, columns);
    let mut truncated = 0_usize;
    for mut row in rows {
        if row.iter().all(Cell::is_empty) {
            continue;
        }
        if row.len() > width {
            if row[width..].iter().any(|cell| !cell.is_empty()) {
                truncated += 1;
            }
            row.truncate(width);
        }
        row.resize(width, Cell::Empty);
        table.push_row(row)?;
    }
    if truncated > 0 {
        tracing::warn!(
            table = name,
            rows = truncated,
            "values beyond the last named column were ignored"
        );
    }
    Ok(table)
}

fn read_csv(path: &Path, name: &str, options: &ReadOptions) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open CSV file {}", path.display()))?;

    let mut raw_rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("failed to read CSV record {} from {}", index + 1, path.display())
        })?;
        raw_rows.push(record.iter().map(parse_cell).collect());
    }
    assemble(name, raw_rows, options.header_row)
}

fn read_workbook(path: &Path, name: &str, options: &ReadOptions) -> Result<Table> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open workbook {}", path.display()))?;
    let sheet = match &options.sheet {
        Some(sheet) => sheet.clone(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("workbook {} has no worksheets", path.display()))?,
    };
    let range = workbook
        .worksheet_range(&sheet)
        .with_context(|| format!("failed to read worksheet `{sheet}` of {}", path.display()))?;

    let raw_rows = range.rows().map(|row| row.iter().map(workbook_cell).collect()).collect();
    assemble(name, raw_rows, options.header_row)
}

fn read_json(path: &Path, name: &str) -> Result<Table> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read JSON table {}", path.display()))?;
    let table: Table = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse JSON table {}", path.display()))?;
    if table.name().is_empty() {
        Ok(table.with_name(name))
    } else {
        Ok(table)
    }
}

/// Read one table from disk. The table is named after the file name so it can
/// be matched against configured sources.
///
/// # Errors
/// Returns an error when the format is unsupported, the file cannot be read,
/// or no header row exists at `options.header_row`.
pub fn read_table(path: &Path, options: &ReadOptions) -> Result<Table> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let table = match TableFormat::from_path(path)? {
        TableFormat::Csv => read_csv(path, &name, options)?,
        TableFormat::Workbook => read_workbook(path, &name, options)?,
        TableFormat::Json => read_json(path, &name)?,
    };
    tracing::debug!(
        path = %path.display(),
        rows = table.row_count(),
        columns = table.column_count(),
        "table read"
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_text_is_inferred_but_identifiers_stay_text() {
        assert_eq!(parse_cell("12"), Cell::Number(12.0));
        assert_eq!(parse_cell("-3.5"), Cell::Number(-3.5));
        assert_eq!(parse_cell("0.25"), Cell::Number(0.25));
        assert_eq!(parse_cell("0"), Cell::Number(0.0));
        assert_eq!(parse_cell("0012"), Cell::text("0012"));
        assert_eq!(parse_cell("2025-01-15"), Cell::text("2025-01-15"));
        assert_eq!(parse_cell("inf"), Cell::text("inf"));
        assert_eq!(parse_cell("  "), Cell::Empty);
    }

    #[test]
    fn workbook_text_cells_holding_numbers_are_numbers() {
        assert_eq!(workbook_cell(&Data::String("12".to_string())), Cell::Number(12.0));
        assert_eq!(workbook_cell(&Data::String("0012".to_string())), Cell::text("0012"));
        assert_eq!(workbook_cell(&Data::String(String::new())), Cell::Empty);
        assert_eq!(workbook_cell(&Data::Int(7)), Cell::Number(7.0));
    }

    #[test]
    fn header_offset_and_blank_names() {
        let rows = vec![
            vec![Cell::text("Forecast 2025"), Cell::Empty],
            vec![Cell::text("wafer"), Cell::Empty, Cell::text("wafer")],
            vec![Cell::text("W1"), Cell::Number(3.0)],
            vec![Cell::Empty, Cell::Empty, Cell::Empty],
        ];
        let table = assemble("forecast.csv", rows, 1).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(table.columns(), &["wafer", "column_2", "wafer.1"]);
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.cell(0, 2), &Cell::Empty);
    }

    #[test]
    fn missing_header_row_is_an_error() {
        let rows = vec![vec![Cell::text("only")]];
        assert!(assemble("t.csv", rows, 3).is_err());
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            TableFormat::from_path(Path::new("a/Orders.XLSX")).ok(),
            Some(TableFormat::Workbook)
        );
        assert_eq!(TableFormat::from_path(Path::new("a.csv")).ok(), Some(TableFormat::Csv));
        assert!(TableFormat::from_path(Path::new("a.parquet")).is_err());
        assert!(TableFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn missing_workbook_is_an_error() {
        assert!(read_table(Path::new("/nonexistent/stock.xlsx"), &ReadOptions::default()).is_err());
    }
}
