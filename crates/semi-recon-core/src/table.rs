use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::EngineError;

static EMPTY_CELL: Cell = Cell::Empty;

/// One cell of a raw or derived table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Empty,
    Number(f64),
    Text(String),
}

impl Cell {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Empty cells and zero-length text carry no value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.is_empty(),
            Self::Number(_) => false,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Text used for exact key comparison. Integral numbers render without a
    /// fractional part so `1234` and `"1234"` compare equal.
    #[must_use]
    pub fn key_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(text) => text.clone(),
            Self::Number(value) => format_number(*value),
        }
    }
}

impl Display for Cell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key_text())
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TableRepr {
    #[serde(default)]
    name: String,
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Cell>>,
}

/// Column-labelled, row-oriented table. Every row is exactly as wide as the
/// column list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "TableRepr")]
pub struct Table {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl TryFrom<TableRepr> for Table {
    type Error = EngineError;

    fn try_from(repr: TableRepr) -> Result<Self, Self::Error> {
        Self::from_rows(repr.name, repr.columns, repr.rows)
    }
}

impl Table {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from pre-collected rows.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when any row width differs from the
    /// column count.
    pub fn from_rows(
        name: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<Vec<Cell>>,
    ) -> Result<Self, EngineError> {
        let mut table = Self::new(name, columns);
        table.rows.reserve(rows.len());
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Append one row.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when the row width differs from the
    /// column count.
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), EngineError> {
        if row.len() != self.columns.len() {
            return Err(EngineError::Validation(format!(
                "table `{}` expects rows of width {}, got {}",
                self.name,
                self.columns.len(),
                row.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }

    /// Position of a required column.
    ///
    /// # Errors
    /// Returns [`EngineError::Schema`] when the column is absent.
    pub fn require_column(&self, column: &str) -> Result<usize, EngineError> {
        self.column_index(column).ok_or_else(|| EngineError::schema(&self.name, column))
    }

    /// Positions of several required columns, in the order given.
    ///
    /// # Errors
    /// Returns [`EngineError::Schema`] naming the first absent column.
    pub fn require_columns<S: AsRef<str>>(&self, columns: &[S]) -> Result<Vec<usize>, EngineError> {
        columns.iter().map(|column| self.require_column(column.as_ref())).collect()
    }

    #[must_use]
    pub fn cell(&self, row: usize, column: usize) -> &Cell {
        self.rows.get(row).and_then(|cells| cells.get(column)).unwrap_or(&EMPTY_CELL)
    }

    /// A column is numeric when it holds at least one number and every
    /// non-empty cell is a number.
    #[must_use]
    pub fn is_numeric_column(&self, column: usize) -> bool {
        let mut saw_number = false;
        for row in &self.rows {
            match row.get(column) {
                Some(Cell::Number(_)) => saw_number = true,
                Some(cell) if cell.is_empty() => {}
                Some(_) => return false,
                None => {}
            }
        }
        saw_number
    }

    /// Sum of the numeric cells of a column, or `None` when it is absent.
    #[must_use]
    pub fn column_sum(&self, column: &str) -> Option<f64> {
        let index = self.column_index(column)?;
        Some(self.rows.iter().filter_map(|row| row[index].as_number()).sum())
    }
}
