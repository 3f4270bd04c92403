use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month};

use crate::identity::IdentityColumns;
use crate::table::{Cell, Table};
use crate::EngineError;

/// Bucket label for time values that cannot be read as a date.
pub const UNKNOWN_BUCKET: &str = "unknown";
/// Bucket label for blank cells on a categorical axis. Kept apart from
/// [`UNKNOWN_BUCKET`] so a category literally named `unknown` stays its own
/// column.
pub const BLANK_CATEGORY: &str = "(blank)";
pub const HISTORICAL_PREFIX: &str = "historical_";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BucketFormat {
    #[default]
    YearMonth,
    YearMonthDay,
    Year,
}

impl BucketFormat {
    /// Accepts both the named forms and the strftime patterns used by
    /// spreadsheet tooling (`%Y-%m`, `%Y-%m-%d`, `%Y`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "year_month" | "%Y-%m" => Some(Self::YearMonth),
            "year_month_day" | "%Y-%m-%d" => Some(Self::YearMonthDay),
            "year" | "%Y" => Some(Self::Year),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self, date: Date) -> String {
        let month = u8::from(date.month());
        match self {
            Self::YearMonth => format!("{:04}-{month:02}", date.year()),
            Self::YearMonthDay => format!("{:04}-{month:02}-{:02}", date.year(), date.day()),
            Self::Year => format!("{:04}", date.year()),
        }
    }
}

/// What the pivot spreads across columns.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnAxis {
    /// Dates bucketed by calendar period.
    Time { column: String, format: BucketFormat },
    /// Verbatim cell text, e.g. a warehouse name.
    Category { column: String },
}

impl ColumnAxis {
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Time { column, .. } | Self::Category { column } => column,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PivotSpec {
    pub index: Vec<String>,
    pub axis: ColumnAxis,
    pub measures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PivotColumn {
    Bucket { measure: String, bucket: String },
    Rollup { measure: String },
}

impl PivotColumn {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Bucket { measure, bucket } => format!("{measure}_{bucket}"),
            Self::Rollup { measure } => format!("{HISTORICAL_PREFIX}{measure}"),
        }
    }

    #[must_use]
    pub fn measure(&self) -> &str {
        match self {
            Self::Bucket { measure, .. } | Self::Rollup { measure } => measure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PivotRow {
    pub index: Vec<Cell>,
    pub values: Vec<f64>,
}

/// Wide table: index columns followed by one summed column per
/// (measure, bucket) pair. Cells are never missing; absent combinations are 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PivotTable {
    pub(crate) name: String,
    pub(crate) index_columns: Vec<String>,
    pub(crate) time_axis: bool,
    pub(crate) columns: Vec<PivotColumn>,
    pub(crate) rows: Vec<PivotRow>,
    pub(crate) unknown_rows: usize,
}

impl PivotTable {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn index_columns(&self) -> &[String] {
        &self.index_columns
    }

    #[must_use]
    pub fn columns(&self) -> &[PivotColumn] {
        &self.columns
    }

    #[must_use]
    pub fn rows(&self) -> &[PivotRow] {
        &self.rows
    }

    /// Source rows whose time value could not be parsed.
    #[must_use]
    pub fn unknown_rows(&self) -> usize {
        self.unknown_rows
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        let mut names = self.index_columns.clone();
        names.extend(self.columns.iter().map(PivotColumn::name));
        names
    }

    #[must_use]
    pub fn value(&self, row: usize, name: &str) -> Option<f64> {
        let position = self.columns.iter().position(|column| column.name() == name)?;
        self.rows.get(row).map(|pivot_row| pivot_row.values[position])
    }

    /// Sum of every bucket and rollup column of `measure` in one row.
    #[must_use]
    pub fn measure_total(&self, row: usize, measure: &str) -> f64 {
        let Some(pivot_row) = self.rows.get(row) else {
            return 0.0;
        };
        self.columns
            .iter()
            .zip(&pivot_row.values)
            .filter(|(column, _)| column.measure() == measure)
            .map(|(_, value)| value)
            .sum()
    }

    /// Flatten into a labelled table ready for serialization.
    #[must_use]
    pub fn to_table(&self) -> Table {
        let mut table = Table::new(self.name.clone(), self.column_names());
        for row in &self.rows {
            let mut cells = row.index.clone();
            cells.extend(row.values.iter().copied().map(Cell::Number));
            // widths are consistent by construction
            if let Err(err) = table.push_row(cells) {
                tracing::error!(table = %self.name, %err, "pivot row width mismatch");
            }
        }
        table
    }

    /// Deduplicated identity tuples in row order, suitable as a merge base.
    ///
    /// # Errors
    /// Returns [`EngineError::Schema`] when an identity column is not one of
    /// the pivot's index columns.
    pub fn identity_table(&self, identity: &IdentityColumns) -> Result<Table, EngineError> {
        let mut positions = Vec::with_capacity(3);
        for column in identity.names() {
            let position = self
                .index_columns
                .iter()
                .position(|name| name == column)
                .ok_or_else(|| EngineError::schema(&self.name, column))?;
            positions.push(position);
        }

        let mut seen = std::collections::HashSet::new();
        let mut table = Table::new(self.name.clone(), identity.to_vec());
        for row in &self.rows {
            let cells: Vec<Cell> =
                positions.iter().map(|&position| row.index[position].clone()).collect();
            let key: Vec<String> = cells.iter().map(Cell::key_text).collect();
            if seen.insert(key) {
                table.push_row(cells)?;
            }
        }
        Ok(table)
    }
}

fn spreadsheet_epoch() -> Option<Date> {
    Date::from_calendar_date(1899, Month::December, 30).ok()
}

/// Day offsets from the 1899-12-30 spreadsheet epoch.
#[allow(clippy::cast_possible_truncation)]
fn serial_to_date(serial: f64) -> Option<Date> {
    if !serial.is_finite() || serial.abs() > 3_000_000.0 {
        return None;
    }
    spreadsheet_epoch()?.checked_add(Duration::days(serial.floor() as i64))
}

fn calendar_date(year: &str, month: &str, day: &str) -> Option<Date> {
    if year.len() != 4 {
        return None;
    }
    let year = year.parse::<i32>().ok()?;
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    let day = day.parse::<u8>().ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

fn parse_date_text(raw: &str) -> Option<Date> {
    let text = raw.trim();
    let date_part = text.split([' ', 'T']).next().unwrap_or(text);

    if date_part.chars().all(|ch| ch.is_ascii_digit()) {
        return match date_part.len() {
            8 => calendar_date(&date_part[..4], &date_part[4..6], &date_part[6..]),
            6 => calendar_date(&date_part[..4], &date_part[4..], "1"),
            1..=5 => serial_to_date(date_part.parse::<f64>().ok()?),
            _ => None,
        };
    }

    let parts: Vec<&str> = date_part.split(['-', '/', '.']).collect();
    let calendar = match parts.as_slice() {
        [year, month, day] => calendar_date(year, month, day),
        [year, month] => calendar_date(year, month, "1"),
        _ => None,
    };
    // fractional serials such as `45678.5` carry a time of day
    calendar.or_else(|| text.parse::<f64>().ok().and_then(serial_to_date))
}

/// Interpret a time cell: numbers are spreadsheet day serials, text is parsed
/// as a calendar date.
#[must_use]
pub(crate) fn cell_date(cell: &Cell) -> Option<Date> {
    match cell {
        Cell::Number(serial) => serial_to_date(*serial),
        Cell::Text(text) => parse_date_text(text),
        Cell::Empty => None,
    }
}

struct Accumulator {
    index: Vec<Cell>,
    sums: HashMap<(usize, usize), f64>,
}

/// Cross-tabulate `records` into a [`PivotTable`].
///
/// Rows appear in order of first occurrence of their index tuple. Value
/// columns are grouped by measure (in `spec.measures` order) and, within a
/// measure, ordered by first occurrence of the bucket. Time values that do
/// not parse land in the [`UNKNOWN_BUCKET`] rather than being dropped.
///
/// # Errors
/// Returns [`EngineError::Schema`] when an index, axis or measure column is absent.
pub fn pivot(records: &Table, spec: &PivotSpec) -> Result<PivotTable, EngineError> {
    let index_positions = records.require_columns(&spec.index)?;
    let axis_position = records.require_column(spec.axis.column())?;
    let measure_positions = records.require_columns(&spec.measures)?;

    let mut buckets: Vec<String> = Vec::new();
    let mut bucket_slots: HashMap<String, usize> = HashMap::new();
    let mut row_slots: HashMap<Vec<String>, usize> = HashMap::new();
    let mut accumulators: Vec<Accumulator> = Vec::new();
    let mut unknown_rows = 0_usize;

    for row in records.rows() {
        let axis_cell = &row[axis_position];
        let label = match &spec.axis {
            ColumnAxis::Time { format, .. } => match cell_date(axis_cell) {
                Some(date) => format.label(date),
                None => {
                    unknown_rows += 1;
                    UNKNOWN_BUCKET.to_string()
                }
            },
            ColumnAxis::Category { .. } => match axis_cell.key_text() {
                text if text.is_empty() => BLANK_CATEGORY.to_string(),
                text => text,
            },
        };

        let bucket = match bucket_slots.get(&label) {
            Some(&slot) => slot,
            None => {
                buckets.push(label.clone());
                bucket_slots.insert(label, buckets.len() - 1);
                buckets.len() - 1
            }
        };

        let index: Vec<Cell> =
            index_positions.iter().map(|&position| row[position].clone()).collect();
        let key: Vec<String> = index.iter().map(Cell::key_text).collect();
        let slot = match row_slots.get(&key) {
            Some(&slot) => slot,
            None => {
                accumulators.push(Accumulator {
                    index,
                    sums: HashMap::new(),
                });
                row_slots.insert(key, accumulators.len() - 1);
                accumulators.len() - 1
            }
        };

        for (measure, &position) in measure_positions.iter().enumerate() {
            let value = row[position].as_number().unwrap_or(0.0);
            *accumulators[slot].sums.entry((measure, bucket)).or_insert(0.0) += value;
        }
    }

    if unknown_rows > 0 {
        tracing::warn!(
            table = records.name(),
            column = spec.axis.column(),
            rows = unknown_rows,
            "unparseable time values bucketed as `{UNKNOWN_BUCKET}`"
        );
    }

    let mut columns = Vec::with_capacity(spec.measures.len() * buckets.len());
    for measure in &spec.measures {
        for bucket in &buckets {
            columns.push(PivotColumn::Bucket {
                measure: measure.clone(),
                bucket: bucket.clone(),
            });
        }
    }

    let rows = accumulators
        .into_iter()
        .map(|accumulator| {
            let mut values = Vec::with_capacity(columns.len());
            for measure in 0..spec.measures.len() {
                for bucket in 0..buckets.len() {
                    values.push(accumulator.sums.get(&(measure, bucket)).copied().unwrap_or(0.0));
                }
            }
            PivotRow {
                index: accumulator.index,
                values,
            }
        })
        .collect();

    Ok(PivotTable {
        name: records.name().to_string(),
        index_columns: spec.index.clone(),
        time_axis: matches!(spec.axis, ColumnAxis::Time { .. }),
        columns,
        rows,
        unknown_rows,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_string()).collect()
    }

    fn table(names: &[&str], rows: Vec<Vec<Cell>>) -> Table {
        match Table::from_rows("orders", columns(names), rows) {
            Ok(table) => table,
            Err(err) => panic!("fixture should build: {err}"),
        }
    }

    fn monthly(measures: &[&str]) -> PivotSpec {
        PivotSpec {
            index: columns(&["wafer", "spec", "product"]),
            axis: ColumnAxis::Time {
                column: "due".to_string(),
                format: BucketFormat::YearMonth,
            },
            measures: columns(measures),
        }
    }

    fn run(records: &Table, spec: &PivotSpec) -> PivotTable {
        match pivot(records, spec) {
            Ok(pivot) => pivot,
            Err(err) => panic!("pivot should build: {err}"),
        }
    }

    fn order(wafer: &str, due: Cell, qty: f64, pending: f64) -> Vec<Cell> {
        vec![
            Cell::from(wafer),
            Cell::text("S"),
            Cell::text("P"),
            due,
            Cell::Number(qty),
            Cell::Number(pending),
        ]
    }

    const ORDER_COLUMNS: [&str; 6] = ["wafer", "spec", "product", "due", "qty", "pending"];

    #[test]
    fn serial_dates_use_the_spreadsheet_epoch() {
        let day = |serial: f64| {
            cell_date(&Cell::Number(serial)).map(|date| BucketFormat::YearMonthDay.label(date))
        };
        assert_eq!(day(45_658.0).as_deref(), Some("2025-01-01"));
        assert_eq!(day(1.5).as_deref(), Some("1899-12-31"));
    }

    #[test]
    fn text_dates_accept_common_layouts() {
        for (raw, expected) in [
            ("2025-03-14", "2025-03"),
            ("2025/3/1", "2025-03"),
            ("2025-03-14 08:30:00", "2025-03"),
            ("2025-03-14T08:30:00Z", "2025-03"),
            ("2025-02", "2025-02"),
            ("20250704", "2025-07"),
            ("45658", "2025-01"),
        ] {
            let label = cell_date(&Cell::text(raw)).map(|date| BucketFormat::YearMonth.label(date));
            assert_eq!(label.as_deref(), Some(expected), "input {raw}");
        }
        assert_eq!(cell_date(&Cell::text("next week")), None);
        assert_eq!(cell_date(&Cell::text("2025-13-01")), None);
    }

    #[test]
    fn cross_tab_sums_and_zero_fills() {
        let records = table(
            &ORDER_COLUMNS,
            vec![
                order("W1", Cell::text("2025-01-05"), 10.0, 4.0),
                order("W1", Cell::text("2025-01-20"), 1.0, 1.0),
                order("W2", Cell::text("2025-02-01"), 7.0, 7.0),
            ],
        );

        let pivot = run(&records, &monthly(&["qty", "pending"]));

        assert_eq!(
            pivot.column_names(),
            columns(&[
                "wafer",
                "spec",
                "product",
                "qty_2025-01",
                "qty_2025-02",
                "pending_2025-01",
                "pending_2025-02",
            ])
        );
        assert_eq!(pivot.rows().len(), 2);
        assert_eq!(pivot.value(0, "qty_2025-01"), Some(11.0));
        assert_eq!(pivot.value(0, "qty_2025-02"), Some(0.0));
        assert_eq!(pivot.value(1, "pending_2025-02"), Some(7.0));
    }

    #[test]
    fn buckets_follow_first_occurrence() {
        let records = table(
            &ORDER_COLUMNS,
            vec![
                order("W1", Cell::text("2025-03-01"), 1.0, 0.0),
                order("W1", Cell::text("2025-01-01"), 1.0, 0.0),
            ],
        );
        let pivot = run(&records, &monthly(&["qty"]));
        assert_eq!(pivot.column_names()[3..], columns(&["qty_2025-03", "qty_2025-01"]));
    }

    #[test]
    fn unparseable_dates_go_to_the_unknown_bucket() {
        let records = table(
            &ORDER_COLUMNS,
            vec![
                order("W1", Cell::text("TBD"), 3.0, 3.0),
                order("W1", Cell::Empty, 2.0, 2.0),
                order("W1", Cell::text("2025-01-01"), 1.0, 1.0),
            ],
        );
        let pivot = run(&records, &monthly(&["qty"]));
        assert_eq!(pivot.unknown_rows(), 2);
        assert_eq!(pivot.value(0, "qty_unknown"), Some(5.0));
        assert_eq!(pivot.measure_total(0, "qty"), 6.0);
    }

    #[test]
    fn category_axis_uses_cell_text() {
        let records = table(
            &["wafer", "spec", "warehouse", "qty"],
            vec![
                vec![
                    Cell::text("W1"),
                    Cell::text("S"),
                    Cell::text("Main"),
                    Cell::Number(2.0),
                ],
                vec![
                    Cell::text("W1"),
                    Cell::text("S"),
                    Cell::text("Bonded"),
                    Cell::Number(3.0),
                ],
                vec![
                    Cell::text("W1"),
                    Cell::text("S"),
                    Cell::text("Main"),
                    Cell::Number(4.0),
                ],
            ],
        );
        let spec = PivotSpec {
            index: columns(&["wafer", "spec"]),
            axis: ColumnAxis::Category {
                column: "warehouse".to_string(),
            },
            measures: columns(&["qty"]),
        };
        let pivot = run(&records, &spec);
        assert!(!pivot.time_axis);
        assert_eq!(pivot.value(0, "qty_Main"), Some(6.0));
        assert_eq!(pivot.value(0, "qty_Bonded"), Some(3.0));
    }

    #[test]
    fn blank_categories_stay_apart_from_a_category_named_unknown() {
        let records = table(
            &["wafer", "spec", "warehouse", "qty"],
            vec![
                vec![
                    Cell::text("W1"),
                    Cell::text("S"),
                    Cell::text("unknown"),
                    Cell::Number(2.0),
                ],
                vec![
                    Cell::text("W1"),
                    Cell::text("S"),
                    Cell::Empty,
                    Cell::Number(3.0),
                ],
            ],
        );
        let spec = PivotSpec {
            index: columns(&["wafer", "spec"]),
            axis: ColumnAxis::Category {
                column: "warehouse".to_string(),
            },
            measures: columns(&["qty"]),
        };
        let pivot = run(&records, &spec);
        assert_eq!(pivot.value(0, "qty_unknown"), Some(2.0));
        assert_eq!(pivot.value(0, &format!("qty_{BLANK_CATEGORY}")), Some(3.0));
        assert_eq!(pivot.unknown_rows(), 0);
    }

    #[test]
    fn fractional_serial_text_is_a_day_serial() {
        let month = |cell: Cell| cell_date(&cell).map(|date| BucketFormat::YearMonth.label(date));
        assert!(cell_date(&Cell::text("45678.5")).is_some());
        assert_eq!(cell_date(&Cell::text("45678.5")), cell_date(&Cell::Number(45678.0)));
        assert_eq!(month(Cell::text("45678.5")).as_deref(), Some("2025-01"));
        assert_eq!(month(Cell::text("2025.03")).as_deref(), Some("2025-03"));
    }

    #[test]
    fn missing_measure_is_a_schema_error() {
        let records = table(&ORDER_COLUMNS, vec![]);
        let err = pivot(&records, &monthly(&["amount"])).err();
        assert_eq!(
            err,
            Some(EngineError::Schema {
                table: "orders".to_string(),
                column: "amount".to_string(),
            })
        );
    }

    #[test]
    fn identity_table_dedupes_in_row_order() {
        let row = |wafer: &str, center: &str| {
            vec![
                Cell::text(wafer),
                Cell::text("S"),
                Cell::text("P"),
                Cell::text(center),
                Cell::text("2025-01-01"),
                Cell::Number(1.0),
            ]
        };
        let records = table(
            &["wafer", "spec", "product", "center", "due", "qty"],
            vec![row("W2", "C1"), row("W1", "C1"), row("W2", "C2")],
        );
        let spec = PivotSpec {
            index: columns(&["center", "wafer", "spec", "product"]),
            axis: ColumnAxis::Time {
                column: "due".to_string(),
                format: BucketFormat::YearMonth,
            },
            measures: columns(&["qty"]),
        };
        let pivot = run(&records, &spec);
        let identity = IdentityColumns::new("wafer", "spec", "product");
        let base = match pivot.identity_table(&identity) {
            Ok(base) => base,
            Err(err) => panic!("identity table should build: {err}"),
        };
        assert_eq!(base.row_count(), 2);
        assert_eq!(base.cell(0, 0), &Cell::text("W2"));
        assert_eq!(base.cell(1, 0), &Cell::text("W1"));
    }

    proptest! {
        #[test]
        fn property_bucket_totals_match_source_totals(
            rows in prop::collection::vec((0_usize..3, 0_i64..400, 0.0_f64..500.0), 1..50)
        ) {
            let wafers = ["W0", "W1", "W2"];
            let records = table(
                &ORDER_COLUMNS,
                rows.iter()
                    .map(|&(wafer, day, qty)| {
                        #[allow(clippy::cast_precision_loss)]
                        let serial = 45_000.0 + day as f64;
                        order(wafers[wafer], Cell::Number(serial), qty, 0.0)
                    })
                    .collect(),
            );
            let pivot = run(&records, &monthly(&["qty"]));

            for (row_index, row) in pivot.rows().iter().enumerate() {
                let wafer = row.index[0].key_text();
                let expected: f64 = rows
                    .iter()
                    .filter(|(index, _, _)| wafers[*index] == wafer)
                    .map(|(_, _, qty)| qty)
                    .sum();
                prop_assert!((pivot.measure_total(row_index, "qty") - expected).abs() < 1e-6);
            }
        }
    }
}
