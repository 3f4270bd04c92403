use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::{CanonicalKey, IdentityColumns};
use crate::mapping::MappingTable;
use crate::table::{Cell, Table};
use crate::EngineError;

/// Columns that keep rows apart after resolution. The identity triple is
/// always part of the key; `extra_columns` adds caller-chosen columns such as
/// a delivery date that a later pivot still needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroupingKey {
    #[serde(default)]
    pub extra_columns: Vec<String>,
}

impl GroupingKey {
    #[must_use]
    pub fn identity_only() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra_columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which columns are summed during re-aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Measures {
    /// Every column outside the key whose non-empty cells are all numbers.
    #[default]
    Inferred,
    /// Exactly these columns. Non-numeric cells in them count as zero.
    Named(Vec<String>),
}

impl Measures {
    #[must_use]
    pub fn named<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Named(columns.into_iter().map(Into::into).collect())
    }
}

/// A record whose identity was rewritten by a mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentityChange {
    pub row: usize,
    pub from: CanonicalKey,
    pub to: CanonicalKey,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Resolution {
    pub table: Table,
    pub changes: Vec<IdentityChange>,
    pub measure_columns: Vec<String>,
    pub dropped_columns: Vec<String>,
    pub null_identity_rows: usize,
    /// Input rows absorbed into another row by re-aggregation.
    pub collapsed_rows: usize,
    /// Non-empty measure cells that were not numbers and were summed as zero.
    pub non_numeric_cells: usize,
}

struct Group {
    cells: Vec<Cell>,
    sums: Vec<f64>,
}

/// Rewrite legacy identities to canonical ones and re-aggregate.
///
/// Each record's (wafer, spec, product) is looked up jointly in `rules`; a hit
/// replaces the fields the rule names, a miss passes the record through.
/// Rows with a blank identity field never match. Rows are then grouped by the
/// resolved triple plus `grouping.extra_columns`, and every measure column is
/// summed within its group. Named measures are summed even when some cells are
/// text; those cells count as zero and are tallied in
/// [`Resolution::non_numeric_cells`]. Other columns outside the key are
/// dropped and listed in [`Resolution::dropped_columns`].
///
/// Output columns are the identity columns (wafer, spec, product), then the
/// extra grouping columns, then the measures (named order, or input order when
/// inferred). Groups appear in order of first occurrence.
///
/// # Errors
/// Returns [`EngineError::Schema`] when an identity, grouping or named measure
/// column is absent.
pub fn resolve(
    records: &Table,
    rules: &MappingTable,
    identity: &IdentityColumns,
    grouping: &GroupingKey,
    measures: &Measures,
) -> Result<Resolution, EngineError> {
    let identity_index = identity.locate(records)?;
    let identity_positions = identity_index.positions();

    let mut extra_columns: Vec<String> = Vec::new();
    for column in &grouping.extra_columns {
        if !identity.contains(column) && !extra_columns.contains(column) {
            extra_columns.push(column.clone());
        }
    }
    let extra_positions = records.require_columns(&extra_columns)?;

    let in_key = |position: usize| {
        identity_positions.contains(&position) || extra_positions.contains(&position)
    };
    let mut measure_positions = Vec::new();
    match measures {
        Measures::Inferred => {
            for position in 0..records.column_count() {
                if !in_key(position) && records.is_numeric_column(position) {
                    measure_positions.push(position);
                }
            }
        }
        Measures::Named(columns) => {
            for column in columns {
                let position = records.require_column(column)?;
                if !in_key(position) && !measure_positions.contains(&position) {
                    measure_positions.push(position);
                }
            }
        }
    }
    let measure_columns: Vec<String> = measure_positions
        .iter()
        .map(|&position| records.columns()[position].clone())
        .collect();
    let dropped_columns: Vec<String> = records
        .columns()
        .iter()
        .enumerate()
        .filter(|(position, _)| !in_key(*position) && !measure_positions.contains(position))
        .map(|(_, column)| column.clone())
        .collect();

    let mut changes = Vec::new();
    let mut null_identity_rows = 0_usize;
    let mut non_numeric_cells = 0_usize;
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();

    for (row_index, row) in records.rows().iter().enumerate() {
        let original = identity_index.key(row);
        let mut identity_cells: Vec<Cell> =
            identity_positions.iter().map(|&position| row[position].clone()).collect();

        if original.has_blank_field() {
            null_identity_rows += 1;
        } else if let Some(rule) = rules.lookup(&original) {
            let resolved = rule.new.apply(&original);
            if resolved != original {
                identity_cells = vec![
                    Cell::text(resolved.wafer.clone()),
                    Cell::text(resolved.spec.clone()),
                    Cell::text(resolved.product.clone()),
                ];
                changes.push(IdentityChange {
                    row: row_index,
                    from: original,
                    to: resolved,
                });
            }
        }

        let mut key_cells = identity_cells;
        key_cells.extend(extra_positions.iter().map(|&position| row[position].clone()));
        let group_key: Vec<String> = key_cells.iter().map(Cell::key_text).collect();

        let slot = match index.get(&group_key) {
            Some(&slot) => slot,
            None => {
                groups.push(Group {
                    cells: key_cells,
                    sums: vec![0.0; measure_positions.len()],
                });
                index.insert(group_key, groups.len() - 1);
                groups.len() - 1
            }
        };
        let group = &mut groups[slot];
        for (sum, &position) in group.sums.iter_mut().zip(&measure_positions) {
            let cell = &row[position];
            match cell.as_number() {
                Some(value) => *sum += value,
                None if cell.is_empty() => {}
                None => non_numeric_cells += 1,
            }
        }
    }

    if non_numeric_cells > 0 {
        tracing::warn!(
            table = records.name(),
            cells = non_numeric_cells,
            "non-numeric measure cells summed as zero"
        );
    }

    if null_identity_rows > 0 {
        tracing::warn!(
            table = records.name(),
            rows = null_identity_rows,
            "rows with blank identity fields passed through unresolved"
        );
    }

    let mut columns = identity.to_vec();
    columns.extend(extra_columns);
    columns.extend(measure_columns.iter().cloned());

    let collapsed_rows = records.row_count() - groups.len();
    let rows = groups
        .into_iter()
        .map(|group| {
            let mut cells = group.cells;
            cells.extend(group.sums.into_iter().map(Cell::Number));
            cells
        })
        .collect();
    let table = Table::from_rows(records.name(), columns, rows)?;

    tracing::debug!(
        table = records.name(),
        rows_in = records.row_count(),
        rows_out = table.row_count(),
        changed = changes.len(),
        "identity resolution complete"
    );

    Ok(Resolution {
        table,
        changes,
        measure_columns,
        dropped_columns,
        null_identity_rows,
        collapsed_rows,
        non_numeric_cells,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;
    use crate::mapping::MAPPING_COLUMNS;

    fn identity() -> IdentityColumns {
        IdentityColumns::new("wafer", "spec", "product")
    }

    fn mapping(rows: &[[&str; 6]]) -> MappingTable {
        let columns = MAPPING_COLUMNS.iter().map(|name| (*name).to_string()).collect();
        let rows = rows
            .iter()
            .map(|row| {
                let mut cells: Vec<Cell> = row
                    .iter()
                    .map(|value| if value.is_empty() { Cell::Empty } else { Cell::text(*value) })
                    .collect();
                cells.extend([Cell::Empty, Cell::Empty, Cell::Empty]);
                cells
            })
            .collect();
        let raw = match Table::from_rows("mapping", columns, rows) {
            Ok(raw) => raw,
            Err(err) => panic!("mapping fixture should build: {err}"),
        };
        match MappingTable::load(&raw) {
            Ok(table) => table,
            Err(err) => panic!("mapping fixture should load: {err}"),
        }
    }

    fn orders(rows: Vec<(&str, &str, &str, &str, f64)>) -> Table {
        let columns = ["wafer", "spec", "product", "due", "qty"]
            .iter()
            .map(|name| (*name).to_string())
            .collect();
        let rows = rows
            .into_iter()
            .map(|(wafer, spec, product, due, qty)| {
                vec![
                    Cell::from(wafer),
                    Cell::from(spec),
                    Cell::from(product),
                    Cell::from(due),
                    Cell::Number(qty),
                ]
            })
            .collect();
        match Table::from_rows("orders", columns, rows) {
            Ok(table) => table,
            Err(err) => panic!("orders fixture should build: {err}"),
        }
    }

    fn run(records: &Table, rules: &MappingTable, grouping: &GroupingKey) -> Resolution {
        match resolve(records, rules, &identity(), grouping, &Measures::Inferred) {
            Ok(resolution) => resolution,
            Err(err) => panic!("resolution should succeed: {err}"),
        }
    }

    #[test]
    fn legacy_and_canonical_rows_collapse_into_one() {
        // old (spec A1, product P1, wafer W1) -> new spec A2
        let rules = mapping(&[["A1", "P1", "W1", "A2", "P1", "W1"]]);
        let records = orders(vec![
            ("W1", "A2", "P1", "2025-01", 5.0),
            ("W1", "A1", "P1", "2025-01", 3.0),
        ]);

        let resolution = run(&records, &rules, &GroupingKey::identity_only());

        assert_eq!(resolution.table.row_count(), 1);
        assert_eq!(resolution.table.columns(), &["wafer", "spec", "product", "qty"]);
        assert_eq!(resolution.table.cell(0, 1), &Cell::text("A2"));
        assert_eq!(resolution.table.cell(0, 3), &Cell::Number(8.0));
        assert_eq!(resolution.changes.len(), 1);
        assert_eq!(resolution.changes[0].from, CanonicalKey::new("W1", "A1", "P1"));
        assert_eq!(resolution.collapsed_rows, 1);
        assert_eq!(resolution.dropped_columns, vec!["due".to_string()]);
    }

    #[test]
    fn lookup_requires_all_three_fields_to_match() {
        let rules = mapping(&[["A1", "P1", "W1", "A2", "P1", "W1"]]);
        let records = orders(vec![("W2", "A1", "P1", "2025-01", 4.0)]);

        let resolution = run(&records, &rules, &GroupingKey::identity_only());

        assert!(resolution.changes.is_empty());
        assert_eq!(resolution.table.cell(0, 1), &Cell::text("A1"));
    }

    #[test]
    fn partial_rules_only_rename_the_named_fields() {
        let rules = mapping(&[["A1", "P1", "W1", "A2", "", ""]]);
        let records = orders(vec![("W1", "A1", "P1", "2025-01", 4.0)]);

        let resolution = run(&records, &rules, &GroupingKey::identity_only());

        assert_eq!(resolution.changes[0].to, CanonicalKey::new("W1", "A2", "P1"));
    }

    #[test]
    fn extra_grouping_columns_keep_rows_apart_and_are_not_summed() {
        let rules = mapping(&[["A1", "P1", "W1", "A2", "P1", "W1"]]);
        let records = orders(vec![
            ("W1", "A2", "P1", "2025-01", 5.0),
            ("W1", "A1", "P1", "2025-02", 3.0),
            ("W1", "A1", "P1", "2025-01", 1.0),
        ]);

        let resolution = run(&records, &rules, &GroupingKey::with_columns(["due"]));

        assert_eq!(resolution.table.columns(), &["wafer", "spec", "product", "due", "qty"]);
        assert_eq!(resolution.table.row_count(), 2);
        assert_eq!(resolution.table.cell(0, 4), &Cell::Number(6.0));
        assert_eq!(resolution.table.cell(1, 3), &Cell::text("2025-02"));
    }

    #[test]
    fn blank_identity_rows_pass_through_unresolved() {
        let rules = mapping(&[["A1", "P1", "W1", "A2", "P1", "W1"]]);
        let records = orders(vec![("", "A1", "P1", "2025-01", 2.0)]);

        let resolution = run(&records, &rules, &GroupingKey::identity_only());

        assert_eq!(resolution.null_identity_rows, 1);
        assert!(resolution.changes.is_empty());
        assert_eq!(resolution.table.column_sum("qty"), Some(2.0));
    }

    #[test]
    fn missing_identity_column_is_reported() {
        let records = orders(vec![]);
        let err = resolve(
            &records,
            &MappingTable::empty(),
            &IdentityColumns::new("wafer", "spec", "part_no"),
            &GroupingKey::identity_only(),
            &Measures::Inferred,
        )
        .err();
        assert_eq!(
            err,
            Some(EngineError::Schema {
                table: "orders".to_string(),
                column: "part_no".to_string(),
            })
        );
    }

    #[test]
    fn missing_grouping_column_is_reported() {
        let records = orders(vec![]);
        let err = resolve(
            &records,
            &MappingTable::empty(),
            &identity(),
            &GroupingKey::with_columns(["warehouse"]),
            &Measures::Inferred,
        )
        .err();
        assert!(matches!(err, Some(EngineError::Schema { .. })));
    }

    #[test]
    fn named_measures_keep_quantity_next_to_stray_text() {
        let rules = mapping(&[["A1", "P1", "W1", "A2", "P1", "W1"]]);
        let mut records = orders(vec![
            ("W1", "A2", "P1", "2025-01", 5.0),
            ("W1", "A1", "P1", "2025-01", 3.0),
        ]);
        if let Err(err) = records.push_row(vec![
            Cell::from("W1"),
            Cell::from("A1"),
            Cell::from("P1"),
            Cell::from("2025-01"),
            Cell::text("-"),
        ]) {
            panic!("row should fit: {err}");
        }

        let inferred = run(&records, &rules, &GroupingKey::identity_only());
        assert_eq!(inferred.dropped_columns, vec!["due".to_string(), "qty".to_string()]);

        let resolution = match resolve(
            &records,
            &rules,
            &identity(),
            &GroupingKey::identity_only(),
            &Measures::named(["qty"]),
        ) {
            Ok(resolution) => resolution,
            Err(err) => panic!("resolution should succeed: {err}"),
        };
        assert_eq!(resolution.table.columns(), &["wafer", "spec", "product", "qty"]);
        assert_eq!(resolution.table.cell(0, 3), &Cell::Number(8.0));
        assert_eq!(resolution.non_numeric_cells, 1);
        assert_eq!(resolution.dropped_columns, vec!["due".to_string()]);
    }

    #[test]
    fn missing_named_measure_is_reported() {
        let records = orders(vec![]);
        let err = resolve(
            &records,
            &MappingTable::empty(),
            &identity(),
            &GroupingKey::identity_only(),
            &Measures::named(["amount"]),
        )
        .err();
        assert_eq!(
            err,
            Some(EngineError::Schema {
                table: "orders".to_string(),
                column: "amount".to_string(),
            })
        );
    }

    fn arbitrary_rows() -> impl Strategy<Value = Vec<(usize, usize, usize, f64)>> {
        prop::collection::vec((0_usize..3, 0_usize..3, 0_usize..2, 0.0_f64..1000.0), 0..40)
    }

    proptest! {
        #[test]
        fn property_resolution_conserves_quantity_and_dedupes_keys(rows in arbitrary_rows()) {
            let rules = mapping(&[
                ["S0", "P0", "W0", "S1", "", ""],
                ["S2", "P1", "W1", "S1", "P0", "W0"],
                ["S1", "P1", "W2", "", "P0", ""],
            ]);
            let wafers = ["W0", "W1", "W2"];
            let specs = ["S0", "S1", "S2"];
            let products = ["P0", "P1"];
            let records = orders(
                rows.iter()
                    .map(|&(w, s, p, qty)| (wafers[w], specs[s], products[p], "2025-01", qty))
                    .collect(),
            );

            let resolution = run(&records, &rules, &GroupingKey::identity_only());

            let before = records.column_sum("qty").unwrap_or(0.0);
            let after = resolution.table.column_sum("qty").unwrap_or(0.0);
            prop_assert!((before - after).abs() < 1e-6);

            let keys: BTreeSet<(String, String, String)> = resolution
                .table
                .rows()
                .iter()
                .map(|row| (row[0].key_text(), row[1].key_text(), row[2].key_text()))
                .collect();
            prop_assert_eq!(keys.len(), resolution.table.row_count());
        }
    }
}
