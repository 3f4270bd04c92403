//! File-backed table input and report output for the reconciliation engine.
//!
//! Tables are read from CSV, spreadsheet workbooks (XLSX/XLSM/XLSB/XLS/ODS)
//! or the engine's own JSON table form. Reports are written as CSV tables and
//! grids plus a JSON layout document, and sealed with a manifest that records
//! a SHA-256 digest for every file.

mod read;
mod report;

pub use read::{parse_cell, read_table, ReadOptions, TableFormat};
pub use report::{
    file_slug, read_manifest, verify_report, ReportFileDigest, ReportFileKind, ReportManifest,
    ReportStatus, ReportWriter, SectionLayout, SourceLayout, SummaryLayout, MANIFEST_FILE,
    REPORT_FORMAT_VERSION, SUMMARY_FILE, SUMMARY_LAYOUT_FILE,
};
