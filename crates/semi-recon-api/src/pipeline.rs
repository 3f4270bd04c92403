use std::collections::HashMap;

use semi_recon_core::{
    fold, merge, pivot, resolve, AmbiguousMapping, Cell, Cutoff, EngineError, GroupingKey,
    IdentityChange, IdentityColumns, MappingTable, Measures, PivotColumn, PivotTable,
    SectionSource, SectionValue, SummarySheet, Table, ValueKind,
};
use serde::{Deserialize, Serialize};

use crate::config::{LookupSection, PendingSection, ReportConfig, SectionConfig, SourceConfig};

/// Where a source dropped out of the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Read,
    Mapping,
    Resolve,
    Pivot,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceFailure {
    pub file: String,
    pub stage: Stage,
    pub message: String,
}

impl SourceFailure {
    #[must_use]
    pub fn new(file: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            stage,
            message: message.into(),
        }
    }
}

/// The mapping table as handed to a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MappingInput {
    /// No mapping supplied: identities pass through, rows are still re-aggregated.
    #[default]
    Absent,
    Table(Table),
    /// The mapping file could not be read.
    Unreadable(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportInputs {
    /// Business tables, named by their file name.
    pub tables: Vec<Table>,
    pub mapping: MappingInput,
    /// Failures that happened before the run, e.g. unreadable files.
    pub failures: Vec<SourceFailure>,
    /// Files left unread because no source or section names them.
    pub unconfigured_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingSummary {
    pub rules: usize,
    pub dropped_rows: Vec<usize>,
    pub ambiguities: Vec<AmbiguousMapping>,
}

impl MappingSummary {
    #[must_use]
    pub fn of(table: &MappingTable) -> Self {
        Self {
            rules: table.len(),
            dropped_rows: table.dropped_rows().to_vec(),
            ambiguities: table.ambiguities().to_vec(),
        }
    }
}

/// Which rows a resolution rewrote and what it discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionAudit {
    pub rows_in: usize,
    pub rows_out: usize,
    pub changes: Vec<IdentityChange>,
    pub null_identity_rows: usize,
    pub collapsed_rows: usize,
    pub dropped_columns: Vec<String>,
    /// Text cells in measure columns that were summed as zero.
    #[serde(default)]
    pub non_numeric_cells: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceReport {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionAudit>,
    pub unknown_time_rows: usize,
    /// Pivot after folding at the run's cutoff.
    pub pivot: PivotTable,
}

/// A lookup table that fed a summary section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupReport {
    pub title: String,
    pub file: String,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionAudit>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportOutcome {
    pub cutoff: Option<Cutoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingSummary>,
    pub sources: Vec<SourceReport>,
    pub lookups: Vec<LookupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummarySheet>,
    pub failures: Vec<SourceFailure>,
    /// Input files that match no configured source or section.
    pub unconfigured_files: Vec<String>,
    /// Configured files that were not supplied.
    pub missing_files: Vec<String>,
}

impl ReportOutcome {
    /// At least one pivot or the summary was produced.
    #[must_use]
    pub fn has_data(&self) -> bool {
        !self.sources.is_empty() || self.summary.is_some()
    }

    #[must_use]
    pub fn source(&self, file: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|source| source.file == file)
    }
}

/// Outcome of loading the mapping table: usable rules, or the reason every
/// resolving source has to be skipped.
type LoadedMapping = Result<MappingTable, String>;

fn load_mapping(input: &MappingInput) -> (LoadedMapping, Option<MappingSummary>) {
    match input {
        MappingInput::Absent => (Ok(MappingTable::empty()), None),
        MappingInput::Unreadable(message) => {
            (Err(format!("mapping table unreadable: {message}")), None)
        }
        MappingInput::Table(raw) => match MappingTable::load(raw) {
            Ok(table) => {
                let summary = MappingSummary::of(&table);
                (Ok(table), Some(summary))
            }
            Err(err) => {
                tracing::error!(
                    %err,
                    "mapping table rejected; sources that need resolution are skipped"
                );
                (Err(err.to_string()), None)
            }
        },
    }
}

fn audit(rows_in: usize, resolution: semi_recon_core::Resolution) -> (Table, ResolutionAudit) {
    let audit = ResolutionAudit {
        rows_in,
        rows_out: resolution.table.row_count(),
        changes: resolution.changes,
        null_identity_rows: resolution.null_identity_rows,
        collapsed_rows: resolution.collapsed_rows,
        dropped_columns: resolution.dropped_columns,
        non_numeric_cells: resolution.non_numeric_cells,
    };
    (resolution.table, audit)
}

fn resolve_records(
    table: &Table,
    mapping: &LoadedMapping,
    identity: &IdentityColumns,
    grouping: &GroupingKey,
    measures: &Measures,
) -> Result<(Table, ResolutionAudit), SourceFailure> {
    let rules = mapping
        .as_ref()
        .map_err(|message| SourceFailure::new(table.name(), Stage::Mapping, message.clone()))?;
    let resolution = resolve(table, rules, identity, grouping, measures)
        .map_err(|err| SourceFailure::new(table.name(), Stage::Resolve, err.to_string()))?;
    if !resolution.changes.is_empty() {
        tracing::info!(
            file = table.name(),
            changed = resolution.changes.len(),
            collapsed = resolution.collapsed_rows,
            "legacy identities resolved"
        );
    }
    Ok(audit(table.row_count(), resolution))
}

fn process_source(
    source: &SourceConfig,
    table: &Table,
    mapping: &LoadedMapping,
    cutoff: Option<&Cutoff>,
) -> Result<SourceReport, SourceFailure> {
    let spec = source
        .pivot
        .to_spec()
        .map_err(|err| SourceFailure::new(&source.file, Stage::Pivot, err.to_string()))?;

    let (records, resolution) = match (&source.identity, source.resolve) {
        (Some(identity), true) => {
            let (records, audit) = resolve_records(
                table,
                mapping,
                identity,
                &source.grouping_key(),
                &Measures::Named(source.pivot.values.clone()),
            )?;
            (records, Some(audit))
        }
        _ => (table.clone(), None),
    };

    let pivoted = pivot(&records, &spec)
        .map_err(|err| SourceFailure::new(&source.file, Stage::Pivot, err.to_string()))?;
    let unknown_time_rows = pivoted.unknown_rows();
    Ok(SourceReport {
        file: source.file.clone(),
        resolution,
        unknown_time_rows,
        pivot: fold(&pivoted, cutoff),
    })
}

/// Pending section table: identity columns, the total, the rollup (if any),
/// then the remaining buckets of one measure.
fn pending_section(
    section: &PendingSection,
    source: &SourceConfig,
    identity: &IdentityColumns,
    report: &SourceReport,
) -> Result<SectionSource, EngineError> {
    let table = report.pivot.to_table();
    let positions = table.require_columns(&identity.names())?;

    let mut value_columns: Vec<(String, String)> = Vec::new();
    for column in report.pivot.columns() {
        if column.measure() != section.measure {
            continue;
        }
        let label = match (column, &section.historical_label) {
            (PivotColumn::Rollup { .. }, Some(label)) => label.clone(),
            _ => column.name(),
        };
        value_columns.push((column.name(), label));
    }
    let value_positions = table.require_columns(
        &value_columns.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
    )?;

    let mut columns = identity.to_vec();
    columns.push(section.total_label.clone());
    columns.extend(value_columns.iter().map(|(name, _)| name.clone()));

    let mut rows = Vec::with_capacity(table.row_count());
    for row in table.rows() {
        let mut cells: Vec<Cell> =
            positions.iter().map(|&position| row[position].clone()).collect();
        let values: Vec<f64> = value_positions
            .iter()
            .map(|&position| row[position].as_number().unwrap_or(0.0))
            .collect();
        cells.push(Cell::Number(values.iter().sum()));
        cells.extend(values.into_iter().map(Cell::Number));
        rows.push(cells);
    }

    let mut values = Vec::with_capacity(value_columns.len() + 1);
    if !value_columns.is_empty() {
        values.push(SectionValue::quantity(&section.total_label, &section.total_label));
    }
    values.extend(
        value_columns.into_iter().map(|(name, label)| SectionValue::quantity(name, label)),
    );

    Ok(SectionSource {
        title: section.title.clone(),
        table: Table::from_rows(source.file.clone(), columns, rows)?,
        join_key: identity.clone(),
        values,
    })
}

fn lookup_section(
    section: &LookupSection,
    table: &Table,
    mapping: &LoadedMapping,
) -> Result<(SectionSource, Option<ResolutionAudit>), SourceFailure> {
    let (table, audit) = if section.resolve {
        // absent value columns are left for the merger to report
        let present: Vec<&SectionValue> = section
            .values
            .iter()
            .filter(|value| table.column_index(&value.column).is_some())
            .collect();
        let columns_of = |kind: ValueKind| {
            present
                .iter()
                .filter(|value| value.kind == kind)
                .map(|value| value.column.clone())
                .collect::<Vec<_>>()
        };
        // text values survive resolution only as grouping columns
        let text_columns = columns_of(ValueKind::Text);
        let quantity_columns = columns_of(ValueKind::Quantity);
        let (resolved, audit) = resolve_records(
            table,
            mapping,
            &section.identity,
            &GroupingKey::with_columns(text_columns),
            &Measures::Named(quantity_columns),
        )?;
        (resolved, Some(audit))
    } else {
        (table.clone(), None)
    };
    Ok((
        SectionSource {
            title: section.title.clone(),
            table,
            join_key: section.identity.clone(),
            values: section.values.clone(),
        },
        audit,
    ))
}

/// Run every configured source through resolve, pivot and fold, then merge
/// the summary. A failing source is recorded and skipped; the run itself
/// never fails.
#[must_use]
pub fn run_report(
    config: &ReportConfig,
    inputs: &ReportInputs,
    cutoff: Option<&Cutoff>,
) -> ReportOutcome {
    let (mapping, mapping_summary) = load_mapping(&inputs.mapping);
    let mut failures = inputs.failures.clone();

    let by_name: HashMap<&str, &Table> =
        inputs.tables.iter().map(|table| (table.name(), table)).collect();
    let mut unconfigured_files = inputs.unconfigured_files.clone();
    for table in &inputs.tables {
        if config.source(table.name()).is_none() && config.lookup(table.name()).is_none() {
            tracing::warn!(file = table.name(), "skipping unconfigured file");
            unconfigured_files.push(table.name().to_string());
        }
    }
    let failed: Vec<String> = failures.iter().map(|failure| failure.file.clone()).collect();
    let mut missing_files = Vec::new();

    let mut sources = Vec::new();
    let mut lookups = Vec::new();
    for source in &config.sources {
        let Some(table) = by_name.get(source.file.as_str()) else {
            if !failed.contains(&source.file) {
                missing_files.push(source.file.clone());
            }
            continue;
        };
        match process_source(source, table, &mapping, cutoff) {
            Ok(report) => {
                tracing::debug!(
                    file = %source.file,
                    rows = report.pivot.rows().len(),
                    columns = report.pivot.columns().len(),
                    "source pivoted"
                );
                sources.push(report);
            }
            Err(failure) => {
                tracing::warn!(
                    file = %failure.file,
                    stage = ?failure.stage,
                    message = %failure.message,
                    "source skipped"
                );
                failures.push(failure);
            }
        }
    }

    let summary = config.summary.as_ref().and_then(|summary| {
        let base_config = config.source(&summary.base_source)?;
        let Some(base_report) =
            sources.iter().find(|report| report.file == summary.base_source)
        else {
            tracing::warn!(base = %summary.base_source, "no summary: base source did not pivot");
            failures.push(SourceFailure::new(
                &summary.base_source,
                Stage::Merge,
                "summary base source produced no pivot",
            ));
            return None;
        };
        let base_identity = base_config.identity.as_ref()?;
        let base = match base_report.pivot.identity_table(base_identity) {
            Ok(table) => Table::from_rows(
                base_report.file.clone(),
                summary.identity.to_vec(),
                table.rows().to_vec(),
            ),
            Err(err) => Err(err),
        };
        let base = match base {
            Ok(base) => base,
            Err(err) => {
                failures.push(SourceFailure::new(
                    &summary.base_source,
                    Stage::Merge,
                    err.to_string(),
                ));
                return None;
            }
        };

        let mut sections = Vec::with_capacity(summary.sections.len());
        for section in &summary.sections {
            match section {
                SectionConfig::Pending(pending) => {
                    let file = pending.source.as_deref().unwrap_or(&summary.base_source);
                    let (Some(source), Some(report)) =
                        (config.source(file), sources.iter().find(|report| report.file == file))
                    else {
                        tracing::warn!(
                            section = %pending.title,
                            file,
                            "section skipped: source did not pivot"
                        );
                        continue;
                    };
                    let Some(identity) = &source.identity else {
                        continue;
                    };
                    match pending_section(pending, source, identity, report) {
                        Ok(section) => sections.push(section),
                        Err(err) => {
                            failures.push(SourceFailure::new(file, Stage::Merge, err.to_string()));
                        }
                    }
                }
                SectionConfig::Lookup(lookup) => {
                    let Some(table) = by_name.get(lookup.file.as_str()) else {
                        if !failed.contains(&lookup.file) {
                            missing_files.push(lookup.file.clone());
                        }
                        tracing::warn!(
                            section = %lookup.title,
                            file = %lookup.file,
                            "section skipped: file not supplied"
                        );
                        continue;
                    };
                    match lookup_section(lookup, table, &mapping) {
                        Ok((section, resolution)) => {
                            lookups.push(LookupReport {
                                title: lookup.title.clone(),
                                file: lookup.file.clone(),
                                rows: section.table.row_count(),
                                resolution,
                            });
                            sections.push(section);
                        }
                        Err(failure) => {
                            tracing::warn!(
                                section = %lookup.title,
                                message = %failure.message,
                                "section skipped"
                            );
                            failures.push(failure);
                        }
                    }
                }
            }
        }

        match merge(&base, &summary.identity, &sections) {
            Ok(sheet) => Some(sheet),
            Err(err) => {
                failures.push(SourceFailure::new(
                    &summary.base_source,
                    Stage::Merge,
                    err.to_string(),
                ));
                None
            }
        }
    });

    let outcome = ReportOutcome {
        cutoff: cutoff.cloned(),
        mapping: mapping_summary,
        sources,
        lookups,
        summary,
        failures,
        unconfigured_files,
        missing_files,
    };
    tracing::info!(
        sources = outcome.sources.len(),
        failures = outcome.failures.len(),
        summary = outcome.summary.is_some(),
        "report run finished"
    );
    outcome
}

/// Resolve one table without pivoting, for audit runs.
///
/// # Errors
/// Returns a failure when the mapping is unusable or identity columns are absent.
pub fn resolve_only(
    table: &Table,
    mapping: &MappingInput,
    identity: &IdentityColumns,
    grouping: &GroupingKey,
    measures: &Measures,
) -> Result<(Table, ResolutionAudit, Option<MappingSummary>), SourceFailure> {
    let (loaded, summary) = load_mapping(mapping);
    let (table, audit) = resolve_records(table, &loaded, identity, grouping, measures)?;
    Ok((table, audit, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_mapping_only_blocks_resolving_sources() {
        let raw = Table::new("mapping.xlsx", vec!["a".to_string(); 4]);
        let (loaded, summary) = load_mapping(&MappingInput::Table(raw));
        assert!(summary.is_none());
        let records =
            Table::new("orders.csv", vec!["w".to_string(), "s".to_string(), "p".to_string()]);
        let result = resolve_records(
            &records,
            &loaded,
            &IdentityColumns::new("w", "s", "p"),
            &GroupingKey::identity_only(),
            &Measures::Inferred,
        );
        assert!(matches!(result, Err(SourceFailure { stage: Stage::Mapping, .. })));
    }

    #[test]
    fn absent_mapping_resolves_to_pass_through() {
        let (loaded, summary) = load_mapping(&MappingInput::Absent);
        assert!(summary.is_none());
        assert!(loaded.is_ok_and(|table| table.is_empty()));
    }
}
