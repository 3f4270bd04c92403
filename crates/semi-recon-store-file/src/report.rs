use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use semi_recon_core::{
    Cell, MergedRange, PivotTable, SkippedSection, SummarySheet, Table, DATA_START_ROW, LABEL_ROW,
    TITLE_ROW,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const REPORT_FORMAT_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SUMMARY_FILE: &str = "summary.csv";
pub const SUMMARY_LAYOUT_FILE: &str = "summary_layout.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Written,
    NoDataWritten,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportFileKind {
    Pivot,
    Summary,
    Layout,
    Unmatched,
    Metadata,
}

impl ReportFileKind {
    fn is_data(self) -> bool {
        matches!(self, Self::Pivot | Self::Summary)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportFileDigest {
    pub path: String,
    pub kind: ReportFileKind,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportManifest {
    pub format_version: u32,
    pub generated_at: String,
    pub status: ReportStatus,
    pub files: Vec<ReportFileDigest>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ReportManifest {
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&ReportFileDigest> {
        self.files.iter().find(|file| file.path == path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionLayout {
    pub title: String,
    /// 1-based inclusive span.
    pub first_column: usize,
    pub last_column: usize,
    pub labels: Vec<String>,
    /// Per data row: whether the source contributed a value.
    pub filled: Vec<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLayout {
    pub title: String,
    pub rows: usize,
    pub matched_rows: usize,
    pub matched: Vec<bool>,
    pub unmatched_file: String,
}

/// Everything a presentation layer needs to render the summary grid: header
/// row positions, merged title spans, fill flags, and per-source match flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryLayout {
    pub title_row: usize,
    pub label_row: usize,
    pub data_start_row: usize,
    pub identity_columns: Vec<String>,
    pub merged_ranges: Vec<MergedRange>,
    pub sections: Vec<SectionLayout>,
    pub sources: Vec<SourceLayout>,
    pub skipped: Vec<SkippedSection>,
}

/// File-name-safe form of a table or section title. Letters of any script and
/// digits are kept; every other run of characters becomes one underscore.
#[must_use]
pub fn file_slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "table".to_string()
    } else {
        slug.to_string()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

fn csv_bytes<I>(records: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::WriterBuilder::new().flexible(false).from_writer(Vec::new());
    for record in records {
        writer.write_record(&record).context("failed to encode CSV record")?;
    }
    writer.into_inner().map_err(|err| anyhow!("failed to flush CSV buffer: {}", err.error()))
}

fn row_text(row: &[Cell]) -> Vec<String> {
    row.iter().map(Cell::key_text).collect()
}

/// Writes report files into one directory and keeps a digest of each so the
/// run can be sealed with a manifest.
#[derive(Debug)]
pub struct ReportWriter {
    out_dir: PathBuf,
    files: Vec<ReportFileDigest>,
    notes: Vec<String>,
}

impl ReportWriter {
    /// # Errors
    /// Returns an error when the output directory cannot be created.
    pub fn create(out_dir: &Path) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create report directory {}", out_dir.display()))?;
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            files: Vec::new(),
            notes: Vec::new(),
        })
    }

    #[must_use]
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    #[must_use]
    pub fn files(&self) -> &[ReportFileDigest] {
        &self.files
    }

    /// Record a free-form line in the manifest, e.g. why a source was skipped.
    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }

    fn put(
        &mut self,
        file_name: &str,
        kind: ReportFileKind,
        bytes: &[u8],
        rows: usize,
    ) -> Result<()> {
        if self.files.iter().any(|file| file.path == file_name) {
            return Err(anyhow!("report file {file_name} written twice"));
        }
        let path = self.out_dir.join(file_name);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write report file {}", path.display()))?;
        self.files.push(ReportFileDigest {
            path: file_name.to_string(),
            kind,
            sha256: sha256_hex(bytes),
            rows,
        });
        tracing::debug!(path = %path.display(), rows, "report file written");
        Ok(())
    }

    /// `file_name`, or `<stem>_2.<ext>`, `<stem>_3.<ext>`, ... when an
    /// earlier file already took it. Distinct titles can share a slug.
    fn free_name(&self, file_name: &str) -> String {
        let taken = |name: &str| self.files.iter().any(|file| file.path == name);
        if !taken(file_name) {
            return file_name.to_string();
        }
        let (stem, extension) = match file_name.rsplit_once('.') {
            Some((stem, extension)) => (stem, format!(".{extension}")),
            None => (file_name, String::new()),
        };
        let mut counter = 2_usize;
        loop {
            let candidate = format!("{stem}_{counter}{extension}");
            if !taken(&candidate) {
                tracing::warn!(
                    requested = file_name,
                    written = %candidate,
                    "report file name already used"
                );
                return candidate;
            }
            counter += 1;
        }
    }

    fn put_table(&mut self, file_name: &str, kind: ReportFileKind, table: &Table) -> Result<()> {
        let records = std::iter::once(table.columns().to_vec())
            .chain(table.rows().iter().map(|row| row_text(row)));
        let bytes = csv_bytes(records)
            .with_context(|| format!("failed to encode table `{}`", table.name()))?;
        self.put(file_name, kind, &bytes, table.row_count())
    }

    /// Write a labelled table as CSV with a single header row. Returns the
    /// file name used, which gains a numeric suffix if `file_name` is taken.
    ///
    /// # Errors
    /// Returns an error when encoding or writing fails.
    pub fn write_table(&mut self, file_name: &str, table: &Table) -> Result<String> {
        let file_name = self.free_name(file_name);
        self.put_table(&file_name, ReportFileKind::Pivot, table)?;
        Ok(file_name)
    }

    /// Write a pivot (index columns then value columns) as CSV. Returns the
    /// file name used, as [`ReportWriter::write_table`] does.
    ///
    /// # Errors
    /// Returns an error when encoding or writing fails.
    pub fn write_pivot(&mut self, file_name: &str, pivot: &PivotTable) -> Result<String> {
        self.write_table(file_name, &pivot.to_table())
    }

    /// Write auxiliary JSON that is not report data, such as a run summary.
    ///
    /// # Errors
    /// Returns an error when serialization or writing fails.
    pub fn write_json<T: Serialize>(&mut self, file_name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to serialize {file_name}"))?;
        self.put(file_name, ReportFileKind::Metadata, &bytes, 0)
    }

    /// Write the summary grid, its layout document, and one CSV of unmatched
    /// rows per contributing source.
    ///
    /// The grid carries section titles on row 1, labels on row 2, and data from
    /// row 3; merged spans and match flags live in the layout document.
    ///
    /// # Errors
    /// Returns an error when encoding or writing any of the files fails.
    pub fn write_summary(&mut self, sheet: &SummarySheet) -> Result<SummaryLayout> {
        let [titles, labels] = sheet.header_rows();
        let data_rows = sheet.data_rows();
        let row_count = data_rows.len();
        let records = [titles, labels]
            .into_iter()
            .chain(data_rows.iter().map(|row| row_text(row)));
        let bytes = csv_bytes(records).context("failed to encode summary grid")?;
        self.put(SUMMARY_FILE, ReportFileKind::Summary, &bytes, row_count)?;

        let mut sources = Vec::with_capacity(sheet.source_matches().len());
        for source in sheet.source_matches() {
            let unmatched_file =
                self.free_name(&format!("unmatched_{}.csv", file_slug(&source.title)));
            let unmatched = source.unmatched_rows();
            self.put_table(&unmatched_file, ReportFileKind::Unmatched, &unmatched)?;
            sources.push(SourceLayout {
                title: source.title.clone(),
                rows: source.table.row_count(),
                matched_rows: source.matched_count(),
                matched: source.matched.clone(),
                unmatched_file,
            });
        }

        let layout = SummaryLayout {
            title_row: TITLE_ROW,
            label_row: LABEL_ROW,
            data_start_row: DATA_START_ROW,
            identity_columns: sheet.identity().to_vec(),
            merged_ranges: sheet.merged_ranges(),
            sections: sheet
                .sections()
                .iter()
                .map(|section| SectionLayout {
                    title: section.title.clone(),
                    first_column: section.start_column + 1,
                    last_column: section.start_column + section.width(),
                    labels: section.columns.iter().map(|column| column.label.clone()).collect(),
                    filled: section.filled.clone(),
                })
                .collect(),
            sources,
            skipped: sheet.skipped_sections().to_vec(),
        };
        let bytes =
            serde_json::to_vec_pretty(&layout).context("failed to serialize summary layout")?;
        self.put(SUMMARY_LAYOUT_FILE, ReportFileKind::Layout, &bytes, row_count)?;
        Ok(layout)
    }

    /// Seal the run with `manifest.json`. The status is `no_data_written`
    /// unless at least one pivot or summary file was written.
    ///
    /// # Errors
    /// Returns an error when the manifest cannot be serialized or written.
    pub fn finish(self) -> Result<ReportManifest> {
        let status = if self.files.iter().any(|file| file.kind.is_data()) {
            ReportStatus::Written
        } else {
            tracing::warn!(dir = %self.out_dir.display(), "no data written");
            ReportStatus::NoDataWritten
        };
        let manifest = ReportManifest {
            format_version: REPORT_FORMAT_VERSION,
            generated_at: now_rfc3339()?,
            status,
            files: self.files,
            notes: self.notes,
        };
        let manifest_path = self.out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize report manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write report manifest {}", manifest_path.display())
        })?;
        Ok(manifest)
    }
}

/// # Errors
/// Returns an error when the manifest is missing or malformed.
pub fn read_manifest(dir: &Path) -> Result<ReportManifest> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

/// Check every file listed in a report manifest against its recorded digest.
///
/// # Errors
/// Returns an error on an unsupported format version, a duplicate or missing
/// file, or a digest mismatch.
pub fn verify_report(dir: &Path) -> Result<ReportManifest> {
    let manifest = read_manifest(dir)?;
    if manifest.format_version == 0 || manifest.format_version > REPORT_FORMAT_VERSION {
        return Err(anyhow!(
            "unsupported report format version {}; supported range is 1..={}",
            manifest.format_version,
            REPORT_FORMAT_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ReportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for (name, expected) in by_path {
        let path = dir.join(name);
        let bytes = fs::read(&path)
            .with_context(|| format!("manifest references unreadable file {}", path.display()))?;
        let actual = sha256_hex(&bytes);
        if actual != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {name}: expected {}, got {actual}",
                expected.sha256
            ));
        }
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_keep_letters_of_any_script() {
        assert_eq!(file_slug("Safety stock"), "safety_stock");
        assert_eq!(file_slug("安全库存"), "安全库存");
        assert_eq!(file_slug("  --  "), "table");
        assert_eq!(file_slug("Orders (2025).xlsx"), "orders_2025_xlsx");
    }

    #[test]
    fn csv_encoding_quotes_separators() {
        let bytes = csv_bytes(vec![vec!["a,b".to_string(), "c".to_string()]])
            .unwrap_or_else(|err| panic!("csv should encode: {err}"));
        assert_eq!(String::from_utf8_lossy(&bytes), "\"a,b\",c\n");
    }

    #[test]
    fn digests_are_lowercase_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
