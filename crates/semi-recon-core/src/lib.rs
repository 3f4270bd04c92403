//! Identity resolution and tabular aggregation for semiconductor operations
//! records: legacy part identifiers are folded onto canonical ones, long-form
//! rows are pivoted into monthly buckets, and independently pivoted tables are
//! merged into one cross-referenced summary.

mod fold;
mod identity;
mod mapping;
mod merge;
mod pivot;
mod resolve;
mod table;

pub use fold::{fold, Cutoff};
pub use identity::{CanonicalKey, IdentityColumns};
pub use mapping::{
    AmbiguousMapping, MappingRule, MappingTable, RuleTarget, MAPPING_COLUMNS,
    MAPPING_COLUMN_COUNT,
};
pub use merge::{
    merge, MergedRange, SectionColumn, SectionSource, SectionValue, SkippedSection, SourceMatch,
    SummarySection, SummarySheet, ValueKind, DATA_START_ROW, LABEL_ROW, TITLE_ROW,
};
pub use pivot::{
    pivot, BucketFormat, ColumnAxis, PivotColumn, PivotRow, PivotSpec, PivotTable,
    BLANK_CATEGORY, HISTORICAL_PREFIX, UNKNOWN_BUCKET,
};
pub use resolve::{resolve, GroupingKey, IdentityChange, Measures, Resolution};
pub use table::{Cell, Table};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("schema error: table `{table}` has no column `{column}`")]
    Schema { table: String, column: String },
    #[error("mapping table has {found} columns, at least {required} are required")]
    MappingShape { found: usize, required: usize },
    #[error("invalid cutoff `{0}`: expected YYYY-MM")]
    InvalidCutoff(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl EngineError {
    pub(crate) fn schema(table: &str, column: &str) -> Self {
        Self::Schema {
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}
