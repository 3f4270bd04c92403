use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::CanonicalKey;
use crate::table::{Cell, Table};
use crate::EngineError;

pub const MAPPING_COLUMN_COUNT: usize = 9;

/// Positional layout of a mapping table. Header text is ignored.
pub const MAPPING_COLUMNS: [&str; MAPPING_COLUMN_COUNT] = [
    "old_spec",
    "old_product",
    "old_wafer",
    "new_spec",
    "new_product",
    "new_wafer",
    "packaging_house",
    "process_code",
    "semi_finished",
];

/// Replacement side of a rule. A `None` field keeps the record's own value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct RuleTarget {
    pub wafer: Option<String>,
    pub spec: Option<String>,
    pub product: Option<String>,
}

impl RuleTarget {
    #[must_use]
    pub fn apply(&self, key: &CanonicalKey) -> CanonicalKey {
        CanonicalKey {
            wafer: self.wafer.clone().unwrap_or_else(|| key.wafer.clone()),
            spec: self.spec.clone().unwrap_or_else(|| key.spec.clone()),
            product: self.product.clone().unwrap_or_else(|| key.product.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MappingRule {
    pub old: CanonicalKey,
    pub new: RuleTarget,
    pub packaging_house: Option<String>,
    pub process_code: Option<String>,
    pub semi_finished: Option<String>,
    /// Zero-based data row in the source table.
    pub source_row: usize,
}

/// One old triple that two rules send to different targets. The later rule
/// wins; this records what was overridden.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AmbiguousMapping {
    pub old: CanonicalKey,
    pub overridden: RuleTarget,
    pub overridden_row: usize,
    pub winner: RuleTarget,
    pub winner_row: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MappingTable {
    rules: Vec<MappingRule>,
    #[serde(skip)]
    lookup: HashMap<CanonicalKey, usize>,
    dropped_rows: Vec<usize>,
    ambiguities: Vec<AmbiguousMapping>,
}

fn optional_text(cell: &Cell) -> Option<String> {
    if cell.is_empty() {
        None
    } else {
        Some(cell.key_text())
    }
}

impl MappingTable {
    /// A rule set that maps nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate and normalize a raw mapping table.
    ///
    /// Columns are read by position (see [`MAPPING_COLUMNS`]); extra columns
    /// are ignored. Rows with a blank old wafer, spec or product are dropped.
    /// When one old triple appears more than once the last rule wins, and a
    /// conflicting earlier target is recorded as an [`AmbiguousMapping`].
    ///
    /// # Errors
    /// Returns [`EngineError::MappingShape`] when fewer than nine columns are
    /// present.
    pub fn load(raw: &Table) -> Result<Self, EngineError> {
        if raw.column_count() < MAPPING_COLUMN_COUNT {
            return Err(EngineError::MappingShape {
                found: raw.column_count(),
                required: MAPPING_COLUMN_COUNT,
            });
        }

        let mut table = Self::empty();
        for (row_index, row) in raw.rows().iter().enumerate() {
            let (Some(old_spec), Some(old_product), Some(old_wafer)) =
                (optional_text(&row[0]), optional_text(&row[1]), optional_text(&row[2]))
            else {
                table.dropped_rows.push(row_index);
                continue;
            };

            table.insert(MappingRule {
                old: CanonicalKey::new(old_wafer, old_spec, old_product),
                new: RuleTarget {
                    spec: optional_text(&row[3]),
                    product: optional_text(&row[4]),
                    wafer: optional_text(&row[5]),
                },
                packaging_house: optional_text(&row[6]),
                process_code: optional_text(&row[7]),
                semi_finished: optional_text(&row[8]),
                source_row: row_index,
            });
        }

        if !table.dropped_rows.is_empty() {
            tracing::warn!(
                table = raw.name(),
                dropped = table.dropped_rows.len(),
                "mapping rows without a complete old identity were discarded"
            );
        }
        tracing::debug!(table = raw.name(), rules = table.rules.len(), "mapping table loaded");
        Ok(table)
    }

    fn insert(&mut self, rule: MappingRule) {
        let position = self.rules.len();
        if let Some(&previous) = self.lookup.get(&rule.old) {
            let earlier = &self.rules[previous];
            if earlier.new != rule.new {
                tracing::warn!(
                    old = %rule.old,
                    overridden_row = earlier.source_row,
                    winner_row = rule.source_row,
                    "ambiguous mapping: old identity maps to two different targets, last rule wins"
                );
                self.ambiguities.push(AmbiguousMapping {
                    old: rule.old.clone(),
                    overridden: earlier.new.clone(),
                    overridden_row: earlier.source_row,
                    winner: rule.new.clone(),
                    winner_row: rule.source_row,
                });
            }
        }
        self.lookup.insert(rule.old.clone(), position);
        self.rules.push(rule);
    }

    /// The effective rule for an old identity, matching all three fields jointly.
    #[must_use]
    pub fn lookup(&self, key: &CanonicalKey) -> Option<&MappingRule> {
        self.lookup.get(key).map(|&index| &self.rules[index])
    }

    /// All accepted rules in source order, including overridden duplicates.
    #[must_use]
    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[must_use]
    pub fn dropped_rows(&self) -> &[usize] {
        &self.dropped_rows
    }

    #[must_use]
    pub fn ambiguities(&self) -> &[AmbiguousMapping] {
        &self.ambiguities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping_table(rows: Vec<[&str; 9]>) -> Table {
        let columns = MAPPING_COLUMNS.iter().map(|name| (*name).to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|row| {
                row.iter()
                    .map(|value| if value.is_empty() { Cell::Empty } else { Cell::text(*value) })
                    .collect()
            })
            .collect();
        match Table::from_rows("mapping", columns, rows) {
            Ok(table) => table,
            Err(err) => panic!("mapping fixture should build: {err}"),
        }
    }

    fn load(raw: &Table) -> MappingTable {
        match MappingTable::load(raw) {
            Ok(table) => table,
            Err(err) => panic!("mapping should load: {err}"),
        }
    }

    #[test]
    fn fewer_than_nine_columns_is_a_shape_error() {
        let raw = Table::new("mapping", vec!["a".to_string(); 8]);
        assert_eq!(
            MappingTable::load(&raw),
            Err(EngineError::MappingShape {
                found: 8,
                required: 9,
            })
        );
    }

    #[test]
    fn columns_are_read_by_position_not_header() {
        let mut raw = Table::new(
            "mapping",
            (0..10).map(|index| format!("header {index}")).collect(),
        );
        let row = [
            "A1", "P1", "W1", "A2", "", "", "house", "PC7", "Y", "ignored",
        ];
        if let Err(err) = raw.push_row(row.iter().map(|value| Cell::from(*value)).collect()) {
            panic!("row should fit: {err}");
        }
        let table = load(&raw);

        let rule = table.lookup(&CanonicalKey::new("W1", "A1", "P1"));
        let Some(rule) = rule else {
            panic!("rule should be indexed by old triple")
        };
        assert_eq!(rule.new.spec.as_deref(), Some("A2"));
        assert_eq!(rule.new.product, None);
        assert_eq!(rule.process_code.as_deref(), Some("PC7"));
    }

    #[test]
    fn rows_missing_an_old_field_are_dropped() {
        let table = load(&mapping_table(vec![
            ["A1", "P1", "W1", "A2", "P1", "W1", "", "", ""],
            ["A1", "", "W1", "A3", "P1", "W1", "", "", ""],
            ["", "P9", "W9", "A3", "P9", "W9", "", "", ""],
        ]));

        assert_eq!(table.len(), 1);
        assert_eq!(table.dropped_rows(), &[1, 2]);
    }

    #[test]
    fn conflicting_duplicates_resolve_last_wins_and_are_reported() {
        let table = load(&mapping_table(vec![
            ["A1", "P1", "W1", "A2", "P1", "W1", "", "", ""],
            ["A1", "P1", "W1", "A3", "P1", "W1", "", "", ""],
        ]));

        let Some(rule) = table.lookup(&CanonicalKey::new("W1", "A1", "P1")) else {
            panic!("rule should exist");
        };
        assert_eq!(rule.new.spec.as_deref(), Some("A3"));
        assert_eq!(table.ambiguities().len(), 1);
        assert_eq!(table.ambiguities()[0].overridden.spec.as_deref(), Some("A2"));
        assert_eq!(table.ambiguities()[0].winner_row, 1);
    }

    #[test]
    fn identical_duplicates_are_not_ambiguous() {
        let table = load(&mapping_table(vec![
            ["A1", "P1", "W1", "A2", "P1", "W1", "", "", ""],
            ["A1", "P1", "W1", "A2", "P1", "W1", "", "", ""],
        ]));
        assert!(table.ambiguities().is_empty());
        assert_eq!(table.rules().len(), 2);
    }

    #[test]
    fn many_old_identities_may_share_one_target() {
        let table = load(&mapping_table(vec![
            ["A1", "P1", "W1", "A9", "P9", "W9", "", "", ""],
            ["B1", "Q1", "X1", "A9", "P9", "W9", "", "", ""],
        ]));
        assert!(table.ambiguities().is_empty());
        let first = table.lookup(&CanonicalKey::new("W1", "A1", "P1")).map(|rule| &rule.new);
        let second = table.lookup(&CanonicalKey::new("X1", "B1", "Q1")).map(|rule| &rule.new);
        assert_eq!(first, second);
    }

    #[test]
    fn blank_target_fields_keep_the_record_value() {
        let target = RuleTarget {
            wafer: None,
            spec: Some("A2".to_string()),
            product: None,
        };
        assert_eq!(
            target.apply(&CanonicalKey::new("W1", "A1", "P1")),
            CanonicalKey::new("W1", "A2", "P1")
        );
    }
}
