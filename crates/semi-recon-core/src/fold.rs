use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pivot::{PivotColumn, PivotRow, PivotTable, UNKNOWN_BUCKET};
use crate::EngineError;

/// First bucket still reported individually, in `YYYY-MM` form.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Cutoff(String);

impl Cutoff {
    /// Parse a `YYYY-MM` cutoff.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidCutoff`] for any other shape or a month
    /// outside 01..=12.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let trimmed = value.trim();
        let invalid = || EngineError::InvalidCutoff(value.to_string());
        let (year, month) = trimmed.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4
            || month.len() != 2
            || !year.chars().chain(month.chars()).all(|ch| ch.is_ascii_digit())
        {
            return Err(invalid());
        }
        let month_number = month.parse::<u8>().map_err(|_| invalid())?;
        if !(1..=12).contains(&month_number) {
            return Err(invalid());
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A bucket is historical when its last month falls before the cutoff:
    /// `2025-01-31` and `2025-01` are historical at `2025-02`, the year `2025`
    /// only from `2026-01` on. The unknown bucket never is.
    #[must_use]
    pub fn is_historical(&self, bucket: &str) -> bool {
        if bucket == UNKNOWN_BUCKET {
            return false;
        }
        match bucket.get(..7) {
            Some(month) => month < self.0.as_str(),
            None => format!("{bucket}-12").as_str() < self.0.as_str(),
        }
    }
}

impl FromStr for Cutoff {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Cutoff {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Cutoff> for String {
    fn from(cutoff: Cutoff) -> Self {
        cutoff.0
    }
}

impl Display for Cutoff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapse bucket columns older than `cutoff` into one
/// `historical_<measure>` column per measure.
///
/// Output columns are the index columns, then the rollups in measure order,
/// then the surviving bucket columns in their original order. Without a
/// cutoff, or for a categorical pivot, the table is returned unchanged.
/// Folding an already folded table with the same cutoff changes nothing.
#[must_use]
pub fn fold(table: &PivotTable, cutoff: Option<&Cutoff>) -> PivotTable {
    let Some(cutoff) = cutoff else {
        return table.clone();
    };
    if !table.time_axis {
        tracing::debug!(table = %table.name, "categorical pivot is not folded");
        return table.clone();
    }

    let mut measures: Vec<&str> = Vec::new();
    for column in &table.columns {
        if !measures.contains(&column.measure()) {
            measures.push(column.measure());
        }
    }

    // sources[i] lists the input positions summed into output column i
    let mut columns: Vec<PivotColumn> = Vec::new();
    let mut sources: Vec<Vec<usize>> = Vec::new();
    for measure in &measures {
        let folded: Vec<usize> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, column)| match column {
                PivotColumn::Rollup { measure: owner } => owner == measure,
                PivotColumn::Bucket { measure: owner, bucket } => {
                    owner == measure && cutoff.is_historical(bucket)
                }
            })
            .map(|(position, _)| position)
            .collect();
        if !folded.is_empty() {
            columns.push(PivotColumn::Rollup {
                measure: (*measure).to_string(),
            });
            sources.push(folded);
        }
    }
    for (position, column) in table.columns.iter().enumerate() {
        if let PivotColumn::Bucket { bucket, .. } = column {
            if !cutoff.is_historical(bucket) {
                columns.push(column.clone());
                sources.push(vec![position]);
            }
        }
    }

    let rows = table
        .rows
        .iter()
        .map(|row| PivotRow {
            index: row.index.clone(),
            values: sources
                .iter()
                .map(|positions| positions.iter().map(|&position| row.values[position]).sum())
                .collect(),
        })
        .collect();

    tracing::debug!(
        table = %table.name,
        cutoff = cutoff.as_str(),
        columns_before = table.columns.len(),
        columns_after = columns.len(),
        "historical buckets folded"
    );

    PivotTable {
        columns,
        rows,
        ..table.clone()
    }
}
