//! Report configuration and the per-run reconciliation pipeline.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semi_recon_core::{Cutoff, GroupingKey, IdentityColumns, MappingTable, Measures, Table};
use semi_recon_store_file::{file_slug, read_table, ReadOptions, ReportManifest, ReportWriter};
use serde::{Deserialize, Serialize};

mod config;
mod pipeline;

pub use config::{
    LookupSection, PendingSection, PivotConfig, ReportConfig, SectionConfig, SourceConfig,
    SummaryConfig,
};
pub use pipeline::{
    resolve_only, run_report, LookupReport, MappingInput, MappingSummary, ReportInputs,
    ReportOutcome, ResolutionAudit, SourceFailure, SourceReport, Stage,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const RUN_RECORD_FILE: &str = "run.json";

/// Per-source digest of a run, written next to the report files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRecord {
    pub file: String,
    pub pivot_file: String,
    pub rows: usize,
    pub value_columns: usize,
    pub unknown_time_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionAudit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub contract_version: String,
    pub cutoff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingSummary>,
    pub sources: Vec<SourceRecord>,
    pub lookups: Vec<LookupReport>,
    pub summary_rows: Option<usize>,
    pub failures: Vec<SourceFailure>,
    pub unconfigured_files: Vec<String>,
    pub missing_files: Vec<String>,
}

/// Name of the CSV a source's pivot is written to.
#[must_use]
pub fn pivot_file_name(file: &str) -> String {
    format!("pivot_{}.csv", file_slug(file))
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ReconApi {
    config: ReportConfig,
}

impl ReconApi {
    /// # Errors
    /// Returns an error when the configuration fails validation.
    pub fn new(config: ReportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// # Errors
    /// Returns an error if the embedded configuration is invalid.
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            config: ReportConfig::builtin()?,
        })
    }

    /// Use `path` when given, the built-in configuration otherwise.
    ///
    /// # Errors
    /// Returns an error when the configuration cannot be loaded.
    pub fn from_config_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self {
                config: ReportConfig::load(path)?,
            }),
            None => Self::builtin(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Read every configured input file. Unreadable files become `read`
    /// failures and unconfigured files are listed without being opened.
    #[must_use]
    pub fn load_inputs(&self, files: &[PathBuf], mapping: Option<&Path>) -> ReportInputs {
        let mut inputs = ReportInputs::default();
        for path in files {
            let name = file_name(path);
            let Some(options) = self.config.read_options(&name) else {
                tracing::warn!(file = %name, "skipping unconfigured file");
                inputs.unconfigured_files.push(name);
                continue;
            };
            match read_table(path, &options) {
                Ok(table) => inputs.tables.push(table),
                Err(err) => {
                    let message = format!("{err:#}");
                    tracing::warn!(file = %name, error = %message, "input file unreadable");
                    inputs.failures.push(SourceFailure::new(name, Stage::Read, message));
                }
            }
        }
        inputs.mapping = match mapping {
            None => MappingInput::Absent,
            Some(path) => match read_table(path, &ReadOptions::default()) {
                Ok(table) => MappingInput::Table(table),
                Err(err) => MappingInput::Unreadable(format!("{err:#}")),
            },
        };
        inputs
    }

    #[must_use]
    pub fn run(&self, inputs: &ReportInputs, cutoff: Option<&Cutoff>) -> ReportOutcome {
        run_report(&self.config, inputs, cutoff)
    }

    /// Read, process, and report in one call.
    #[must_use]
    pub fn run_files(
        &self,
        files: &[PathBuf],
        mapping: Option<&Path>,
        cutoff: Option<&Cutoff>,
    ) -> ReportOutcome {
        self.run(&self.load_inputs(files, mapping), cutoff)
    }

    /// Write pivots, the summary, and a run record, then seal the directory
    /// with a manifest. A run with no pivots and no summary still gets a
    /// manifest, with status `no_data_written`.
    ///
    /// # Errors
    /// Returns an error when any report file cannot be written.
    pub fn write_report(&self, outcome: &ReportOutcome, out_dir: &Path) -> Result<ReportManifest> {
        let mut writer = ReportWriter::create(out_dir)?;
        let mut sources = Vec::with_capacity(outcome.sources.len());
        for source in &outcome.sources {
            let pivot_file = writer.write_pivot(&pivot_file_name(&source.file), &source.pivot)?;
            sources.push(SourceRecord {
                file: source.file.clone(),
                pivot_file,
                rows: source.pivot.rows().len(),
                value_columns: source.pivot.columns().len(),
                unknown_time_rows: source.unknown_time_rows,
                resolution: source.resolution.clone(),
            });
        }
        if let Some(summary) = &outcome.summary {
            writer.write_summary(summary)?;
        }
        for failure in &outcome.failures {
            writer.note(format!(
                "{} skipped at {:?}: {}",
                failure.file, failure.stage, failure.message
            ));
        }
        for file in &outcome.unconfigured_files {
            writer.note(format!("{file} skipped: not configured"));
        }

        let record = RunRecord {
            contract_version: API_CONTRACT_VERSION.to_string(),
            cutoff: outcome.cutoff.as_ref().map(ToString::to_string),
            mapping: outcome.mapping.clone(),
            sources,
            lookups: outcome.lookups.clone(),
            summary_rows: outcome.summary.as_ref().map(|summary| summary.keys().len()),
            failures: outcome.failures.clone(),
            unconfigured_files: outcome.unconfigured_files.clone(),
            missing_files: outcome.missing_files.clone(),
        };
        writer.write_json(RUN_RECORD_FILE, &record)?;
        let manifest = writer.finish()?;
        tracing::info!(
            dir = %out_dir.display(),
            files = manifest.files.len(),
            status = ?manifest.status,
            "report written"
        );
        Ok(manifest)
    }

    /// Validate a mapping file without running a report.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or has fewer than nine
    /// columns.
    pub fn check_mapping(path: &Path) -> Result<MappingSummary> {
        let raw = read_table(path, &ReadOptions::default())?;
        let table = MappingTable::load(&raw)
            .with_context(|| format!("invalid mapping table {}", path.display()))?;
        Ok(MappingSummary::of(&table))
    }

    /// Resolve and pivot one configured source file.
    ///
    /// # Errors
    /// Returns an error when the file is not configured, cannot be read, or
    /// fails resolution or pivoting.
    pub fn pivot_file(
        &self,
        path: &Path,
        mapping: Option<&Path>,
        cutoff: Option<&Cutoff>,
    ) -> Result<SourceReport> {
        let name = file_name(path);
        if self.config.source(&name).is_none() {
            return Err(anyhow!("no source is configured for file `{name}`"));
        }
        let outcome = self.run_files(&[path.to_path_buf()], mapping, cutoff);
        if let Some(failure) = outcome.failures.iter().find(|failure| failure.file == name) {
            return Err(anyhow!("{name} failed at {:?}: {}", failure.stage, failure.message));
        }
        outcome
            .sources
            .into_iter()
            .find(|source| source.file == name)
            .ok_or_else(|| anyhow!("{name} produced no pivot"))
    }

    /// Resolve one table against a mapping file, outside any configuration.
    ///
    /// # Errors
    /// Returns an error when either file cannot be read, the mapping is
    /// malformed, or identity columns are absent.
    pub fn resolve_file(
        path: &Path,
        options: &ReadOptions,
        mapping: &Path,
        identity: &IdentityColumns,
        grouping: &GroupingKey,
        measures: &Measures,
    ) -> Result<(Table, ResolutionAudit, MappingSummary)> {
        let table = read_table(path, options)?;
        let raw = read_table(mapping, &ReadOptions::default())?;
        let (resolved, audit, summary) =
            resolve_only(&table, &MappingInput::Table(raw), identity, grouping, measures).map_err(
                |failure| {
                    anyhow!("{} failed at {:?}: {}", failure.file, failure.stage, failure.message)
                },
            )?;
        let summary = summary
            .ok_or_else(|| anyhow!("mapping table {} was not loaded", mapping.display()))?;
        Ok((resolved, audit, summary))
    }
}
