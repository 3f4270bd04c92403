use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::{CanonicalKey, IdentityColumns};
use crate::table::{Cell, Table};
use crate::EngineError;

/// Sheet row (1-based) holding the merged section titles.
pub const TITLE_ROW: usize = 1;
/// Sheet row (1-based) holding per-column labels.
pub const LABEL_ROW: usize = 2;
/// First sheet row (1-based) of data.
pub const DATA_START_ROW: usize = 3;

/// How a section value is aggregated and filled when absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Summed across duplicate source rows; zero when absent.
    #[default]
    Quantity,
    /// First non-blank value wins; blank when absent.
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SectionValue {
    pub column: String,
    pub label: String,
    #[serde(default)]
    pub kind: ValueKind,
}

impl SectionValue {
    #[must_use]
    pub fn quantity(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            label: label.into(),
            kind: ValueKind::Quantity,
        }
    }

    #[must_use]
    pub fn text(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            label: label.into(),
            kind: ValueKind::Text,
        }
    }
}

/// One contributing table for the summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionSource {
    pub title: String,
    pub table: Table,
    pub join_key: IdentityColumns,
    pub values: Vec<SectionValue>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SectionColumn {
    pub label: String,
    pub kind: ValueKind,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SummarySection {
    pub title: String,
    /// Zero-based position of the section's first column in the sheet.
    pub start_column: usize,
    pub columns: Vec<SectionColumn>,
    /// Per base row: whether the source had a row for that identity.
    pub filled: Vec<bool>,
}

impl SummarySection {
    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }
}

/// A contributing source's own rows, each flagged by whether its key exists
/// in the summary's identity set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceMatch {
    pub title: String,
    pub table: Table,
    pub matched: Vec<bool>,
}

impl SourceMatch {
    #[must_use]
    pub fn matched_count(&self) -> usize {
        self.matched.iter().filter(|matched| **matched).count()
    }

    /// Source rows with no home in the summary, for manual review.
    #[must_use]
    pub fn unmatched_rows(&self) -> Table {
        let mut table =
            Table::new(format!("{} unmatched", self.title), self.table.columns().to_vec());
        for (row, matched) in self.table.rows().iter().zip(&self.matched) {
            if !matched {
                if let Err(err) = table.push_row(row.clone()) {
                    tracing::error!(section = %self.title, %err, "unmatched row width mismatch");
                }
            }
        }
        table
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedSection {
    pub title: String,
    pub reason: String,
}

/// 1-based inclusive column span of a merged title cell.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergedRange {
    pub title: String,
    pub first_column: usize,
    pub last_column: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SummarySheet {
    identity: IdentityColumns,
    keys: Vec<CanonicalKey>,
    sections: Vec<SummarySection>,
    matches: Vec<SourceMatch>,
    skipped: Vec<SkippedSection>,
}

impl SummarySheet {
    #[must_use]
    pub fn identity(&self) -> &IdentityColumns {
        &self.identity
    }

    /// Master identity list in base order, one entry per distinct key.
    #[must_use]
    pub fn keys(&self) -> &[CanonicalKey] {
        &self.keys
    }

    #[must_use]
    pub fn sections(&self) -> &[SummarySection] {
        &self.sections
    }

    #[must_use]
    pub fn section(&self, title: &str) -> Option<&SummarySection> {
        self.sections.iter().find(|section| section.title == title)
    }

    #[must_use]
    pub fn source_matches(&self) -> &[SourceMatch] {
        &self.matches
    }

    #[must_use]
    pub fn skipped_sections(&self) -> &[SkippedSection] {
        &self.skipped
    }

    #[must_use]
    pub fn width(&self) -> usize {
        3 + self.sections.iter().map(SummarySection::width).sum::<usize>()
    }

    /// Title row and label row. Identity columns carry their name in the label
    /// row; a section's title sits in its first column.
    #[must_use]
    pub fn header_rows(&self) -> [Vec<String>; 2] {
        let mut titles = vec![String::new(); 3];
        let mut labels = self.identity.to_vec();
        for section in &self.sections {
            for (offset, column) in section.columns.iter().enumerate() {
                titles.push(if offset == 0 { section.title.clone() } else { String::new() });
                labels.push(column.label.clone());
            }
        }
        [titles, labels]
    }

    #[must_use]
    pub fn merged_ranges(&self) -> Vec<MergedRange> {
        self.sections
            .iter()
            .map(|section| MergedRange {
                title: section.title.clone(),
                first_column: section.start_column + 1,
                last_column: section.start_column + section.width(),
            })
            .collect()
    }

    #[must_use]
    pub fn data_rows(&self) -> Vec<Vec<Cell>> {
        self.keys
            .iter()
            .enumerate()
            .map(|(row, key)| {
                let mut cells = vec![
                    Cell::text(key.wafer.clone()),
                    Cell::text(key.spec.clone()),
                    Cell::text(key.product.clone()),
                ];
                for section in &self.sections {
                    cells.extend(section.columns.iter().map(|column| column.cells[row].clone()));
                }
                cells
            })
            .collect()
    }

    /// Value of one section column for one identity.
    #[must_use]
    pub fn value(&self, key: &CanonicalKey, section: &str, label: &str) -> Option<&Cell> {
        let row = self.keys.iter().position(|candidate| candidate == key)?;
        let section = self.section(section)?;
        let column = section.columns.iter().find(|column| column.label == label)?;
        column.cells.get(row)
    }
}

fn aggregate_source(
    table: &Table,
    keys: &[CanonicalKey],
    positions: &[(usize, ValueKind)],
) -> HashMap<CanonicalKey, Vec<Cell>> {
    let mut aggregated: HashMap<CanonicalKey, Vec<Cell>> = HashMap::new();
    for (row, key) in table.rows().iter().zip(keys) {
        let entry = aggregated.entry(key.clone()).or_insert_with(|| {
            positions
                .iter()
                .map(|(_, kind)| match kind {
                    ValueKind::Quantity => Cell::Number(0.0),
                    ValueKind::Text => Cell::Empty,
                })
                .collect()
        });
        for (slot, (position, kind)) in entry.iter_mut().zip(positions) {
            let cell = &row[*position];
            match kind {
                ValueKind::Quantity => {
                    let total = slot.as_number().unwrap_or(0.0) + cell.as_number().unwrap_or(0.0);
                    *slot = Cell::Number(total);
                }
                ValueKind::Text => {
                    if slot.is_empty() && !cell.is_empty() {
                        *slot = cell.clone();
                    }
                }
            }
        }
    }
    aggregated
}

/// Outer-join contributing sources onto the identity set of `base`.
///
/// The base fixes the row order (first occurrence, duplicates removed).
/// Each source is left-joined by exact key equality; base rows without a
/// counterpart get zero for quantities and blank for text. Duplicate source
/// rows for one key are aggregated so every identity stays on one row. Each
/// source row is independently flagged as matched when its key exists in the
/// base set. Sources missing their key columns, or all of their value
/// columns, are skipped and listed in [`SummarySheet::skipped_sections`].
///
/// # Errors
/// Returns [`EngineError::Schema`] when `base` lacks an identity column.
pub fn merge(
    base: &Table,
    identity: &IdentityColumns,
    sources: &[SectionSource],
) -> Result<SummarySheet, EngineError> {
    let base_index = identity.locate(base)?;

    let mut keys: Vec<CanonicalKey> = Vec::new();
    let mut key_rows: HashMap<CanonicalKey, usize> = HashMap::new();
    for row in base.rows() {
        let key = base_index.key(row);
        if !key_rows.contains_key(&key) {
            key_rows.insert(key.clone(), keys.len());
            keys.push(key);
        }
    }

    let mut sections: Vec<SummarySection> = Vec::new();
    let mut matches: Vec<SourceMatch> = Vec::new();
    let mut skipped: Vec<SkippedSection> = Vec::new();
    let mut next_column = 3;

    for source in sources {
        let join_index = match source.join_key.locate(&source.table) {
            Ok(index) => index,
            Err(err) => {
                tracing::warn!(section = %source.title, %err, "section skipped");
                skipped.push(SkippedSection {
                    title: source.title.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let mut present: Vec<(&SectionValue, usize)> = Vec::new();
        for value in &source.values {
            match source.table.column_index(&value.column) {
                Some(position) => present.push((value, position)),
                None => tracing::warn!(
                    section = %source.title,
                    column = %value.column,
                    "section value column absent"
                ),
            }
        }
        if present.is_empty() {
            let reason = format!(
                "table `{}` has none of the section's value columns",
                source.table.name()
            );
            tracing::warn!(section = %source.title, "{reason}");
            skipped.push(SkippedSection {
                title: source.title.clone(),
                reason,
            });
            continue;
        }

        let source_keys: Vec<CanonicalKey> =
            source.table.rows().iter().map(|row| join_index.key(row)).collect();
        let positions: Vec<(usize, ValueKind)> =
            present.iter().map(|(value, position)| (*position, value.kind)).collect();
        let aggregated = aggregate_source(&source.table, &source_keys, &positions);

        let mut columns: Vec<SectionColumn> = present
            .iter()
            .map(|(value, _)| SectionColumn {
                label: value.label.clone(),
                kind: value.kind,
                cells: Vec::with_capacity(keys.len()),
            })
            .collect();
        let mut filled = Vec::with_capacity(keys.len());
        for key in &keys {
            let found = aggregated.get(key);
            filled.push(found.is_some());
            for (slot, column) in columns.iter_mut().enumerate() {
                let cell = match (found, column.kind) {
                    (Some(cells), _) => cells[slot].clone(),
                    (None, ValueKind::Quantity) => Cell::Number(0.0),
                    (None, ValueKind::Text) => Cell::Empty,
                };
                column.cells.push(cell);
            }
        }

        let matched: Vec<bool> = source_keys.iter().map(|key| key_rows.contains_key(key)).collect();
        let unmatched = matched.iter().filter(|matched| !**matched).count();
        if unmatched > 0 {
            tracing::warn!(
                section = %source.title,
                rows = unmatched,
                "source rows have no matching identity in the summary"
            );
        }

        let width = columns.len();
        sections.push(SummarySection {
            title: source.title.clone(),
            start_column: next_column,
            columns,
            filled,
        });
        matches.push(SourceMatch {
            title: source.title.clone(),
            table: source.table.clone(),
            matched,
        });
        next_column += width;
    }

    Ok(SummarySheet {
        identity: identity.clone(),
        keys,
        sections,
        matches,
        skipped,
    })
}
