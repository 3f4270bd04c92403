use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use semi_recon_core::{
    BucketFormat, ColumnAxis, GroupingKey, IdentityColumns, PivotSpec, SectionValue,
};
use semi_recon_store_file::ReadOptions;
use serde::{Deserialize, Serialize};

const BUILTIN_CONFIG: &str = include_str!("../config/default.yaml");

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PivotConfig {
    pub index: Vec<String>,
    /// Column spread across the pivot's value columns.
    pub columns: String,
    pub values: Vec<String>,
    /// Present for a time axis (`%Y-%m`, `%Y-%m-%d`, `%Y` or the named forms);
    /// absent for a categorical axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
}

impl PivotConfig {
    /// # Errors
    /// Returns an error when `date_format` is not a supported pattern.
    pub fn to_spec(&self) -> Result<PivotSpec> {
        let axis = match &self.date_format {
            Some(pattern) => ColumnAxis::Time {
                column: self.columns.clone(),
                format: BucketFormat::parse(pattern)
                    .ok_or_else(|| anyhow!("unsupported date_format `{pattern}`"))?,
            },
            None => ColumnAxis::Category {
                column: self.columns.clone(),
            },
        };
        Ok(PivotSpec {
            index: self.index.clone(),
            axis,
            measures: self.values.clone(),
        })
    }
}

/// One business table that is resolved (optionally) and pivoted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Matched exactly against the input file name.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityColumns>,
    /// Rewrite legacy identities through the mapping table before pivoting.
    #[serde(default)]
    pub resolve: bool,
    /// Extra columns kept apart during resolution, beyond the pivot's own
    /// index and axis columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grouping: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    #[serde(default)]
    pub header_row: usize,
    pub pivot: PivotConfig,
}

impl SourceConfig {
    #[must_use]
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            sheet: self.sheet.clone(),
            header_row: self.header_row,
        }
    }

    /// Resolution keeps the pivot's non-identity index columns and its axis
    /// column distinct, so pivoting after resolution loses nothing.
    #[must_use]
    pub fn grouping_key(&self) -> GroupingKey {
        let mut extras: Vec<String> = self.grouping.clone();
        for column in self.pivot.index.iter().chain(std::iter::once(&self.pivot.columns)) {
            let is_identity =
                self.identity.as_ref().is_some_and(|identity| identity.contains(column));
            if !is_identity && !extras.contains(column) {
                extras.push(column.clone());
            }
        }
        GroupingKey::with_columns(extras)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PendingSection {
    pub title: String,
    /// Source whose pivot feeds the section; the base source when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub measure: String,
    pub total_label: String,
    /// Label for the historical rollup column; the pivot's own column name
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LookupSection {
    pub title: String,
    pub file: String,
    pub identity: IdentityColumns,
    #[serde(default)]
    pub resolve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    #[serde(default)]
    pub header_row: usize,
    pub values: Vec<SectionValue>,
}

impl LookupSection {
    #[must_use]
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            sheet: self.sheet.clone(),
            header_row: self.header_row,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionConfig {
    /// Bucket columns of one measure from a pivoted source, with a total.
    Pending(PendingSection),
    /// Value columns looked up in a separate table by identity.
    Lookup(LookupSection),
}

impl SectionConfig {
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Pending(section) => &section.title,
            Self::Lookup(section) => &section.title,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SummaryConfig {
    pub identity: IdentityColumns,
    /// Source whose pivot supplies the master identity list.
    pub base_source: String,
    #[serde(default)]
    pub sections: Vec<SectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    pub sources: Vec<SourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryConfig>,
}

impl ReportConfig {
    /// The production layout shipped with the crate.
    ///
    /// # Errors
    /// Returns an error if the embedded document fails to parse or validate.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CONFIG).context("built-in report configuration is invalid")
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).context("failed to parse report configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read report configuration {}", path.display()))?;
        Self::from_yaml_str(&yaml)
            .with_context(|| format!("invalid report configuration {}", path.display()))
    }

    /// # Errors
    /// Returns an error when serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize report configuration")
    }

    #[must_use]
    pub fn source(&self, file: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|source| source.file == file)
    }

    /// Lookup section reading `file`, if any.
    #[must_use]
    pub fn lookup(&self, file: &str) -> Option<&LookupSection> {
        self.summary.as_ref()?.sections.iter().find_map(|section| match section {
            SectionConfig::Lookup(lookup) if lookup.file == file => Some(lookup),
            _ => None,
        })
    }

    /// Read options for any configured input file.
    #[must_use]
    pub fn read_options(&self, file: &str) -> Option<ReadOptions> {
        self.source(file)
            .map(SourceConfig::read_options)
            .or_else(|| self.lookup(file).map(LookupSection::read_options))
    }

    /// Cross-field checks serde cannot express.
    ///
    /// # Errors
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut files = HashSet::new();
        for source in &self.sources {
            if !files.insert(source.file.as_str()) {
                return Err(anyhow!("source `{}` is configured twice", source.file));
            }
            if source.pivot.index.is_empty() || source.pivot.values.is_empty() {
                return Err(anyhow!("source `{}` needs pivot index and values", source.file));
            }
            source.pivot.to_spec().with_context(|| format!("source `{}`", source.file))?;
            if source.resolve && source.identity.is_none() {
                return Err(anyhow!(
                    "source `{}` resolves identities but names no identity columns",
                    source.file
                ));
            }
        }

        let Some(summary) = &self.summary else {
            return Ok(());
        };
        let Some(base) = self.source(&summary.base_source) else {
            return Err(anyhow!(
                "summary base source `{}` is not a configured source",
                summary.base_source
            ));
        };
        let Some(base_identity) = &base.identity else {
            return Err(anyhow!("summary base source `{}` names no identity columns", base.file));
        };
        for column in base_identity.names() {
            if !base.pivot.index.iter().any(|index| index == column) {
                return Err(anyhow!(
                    "summary base source `{}` does not pivot on identity column `{column}`",
                    base.file
                ));
            }
        }

        let mut titles = HashSet::new();
        for section in &summary.sections {
            if !titles.insert(section.title()) {
                return Err(anyhow!("summary section `{}` is configured twice", section.title()));
            }
            match section {
                SectionConfig::Pending(pending) => {
                    let file = pending.source.as_deref().unwrap_or(&summary.base_source);
                    let Some(source) = self.source(file) else {
                        return Err(anyhow!(
                            "section `{}` reads unknown source `{file}`",
                            pending.title
                        ));
                    };
                    if source.pivot.date_format.is_none() {
                        return Err(anyhow!(
                            "section `{}` needs a time-bucketed source",
                            pending.title
                        ));
                    }
                    if !source.pivot.values.contains(&pending.measure) {
                        return Err(anyhow!(
                            "section `{}` measure `{}` is not pivoted by `{file}`",
                            pending.title,
                            pending.measure
                        ));
                    }
                    if source.identity.is_none() {
                        return Err(anyhow!(
                            "section `{}` source `{file}` names no identity columns",
                            pending.title
                        ));
                    }
                }
                SectionConfig::Lookup(lookup) => {
                    if self.source(&lookup.file).is_some() {
                        return Err(anyhow!(
                            "file `{}` is both a source and a lookup section",
                            lookup.file
                        ));
                    }
                    if lookup.values.is_empty() {
                        return Err(anyhow!("section `{}` lists no value columns", lookup.title));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> ReportConfig {
        ReportConfig::builtin().unwrap_or_else(|err| panic!("built-in config should load: {err:#}"))
    }

    #[test]
    fn builtin_config_describes_five_sources_and_three_sections() {
        let config = builtin();
        assert_eq!(config.sources.len(), 5);
        let Some(summary) = &config.summary else {
            panic!("summary should be configured")
        };
        let titles: Vec<&str> = summary.sections.iter().map(SectionConfig::title).collect();
        assert_eq!(titles, vec!["安全库存", "未交订单", "预测"]);
        assert_eq!(
            config.read_options("pred_file.xlsx").map(|options| options.header_row),
            Some(1)
        );
    }

    #[test]
    fn value_columns_keep_leading_spaces() {
        let config = builtin();
        let Some(safety) = config.lookup("safety_file.xlsx") else {
            panic!("safety section")
        };
        assert_eq!(safety.values[0].column, " InvWaf");
    }

    #[test]
    fn inventory_pivots_use_a_category_axis() {
        let config = builtin();
        let Some(source) = config.source("赛卓-成品库存.xlsx") else {
            panic!("inventory source")
        };
        let spec = source.pivot.to_spec().unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(
            spec.axis,
            ColumnAxis::Category {
                column: "仓库名称".to_string(),
            }
        );
    }

    #[test]
    fn grouping_keeps_non_identity_index_and_axis_columns() {
        let config = builtin();
        let Some(source) = config.source("赛卓-成品在制.xlsx") else {
            panic!("wip source")
        };
        assert_eq!(
            source.grouping_key().extra_columns,
            vec![
                "工作中心".to_string(),
                "封装形式".to_string(),
                "预计完工日期".to_string(),
            ]
        );
    }

    #[test]
    fn yaml_round_trip_preserves_config() {
        let config = builtin();
        let yaml = config.to_yaml().unwrap_or_else(|err| panic!("{err}"));
        let reparsed = ReportConfig::from_yaml_str(&yaml).unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(reparsed, config);
    }

    #[test]
    fn validation_rejects_unknown_base_and_bad_formats() {
        let yaml = r"
sources:
  - file: orders.csv
    pivot: { index: [w], columns: due, values: [qty], date_format: '%d/%m' }
";
        assert!(ReportConfig::from_yaml_str(yaml).is_err());

        let yaml = r"
sources:
  - file: orders.csv
    identity: { wafer: w, spec: s, product: p }
    pivot: { index: [w, s, p], columns: due, values: [qty], date_format: '%Y-%m' }
summary:
  identity: { wafer: w, spec: s, product: p }
  base_source: missing.csv
";
        let err = ReportConfig::from_yaml_str(yaml).err().map(|err| err.to_string());
        assert!(err.is_some_and(|message| message.contains("missing.csv")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = r"
sources:
  - file: orders.csv
    pivots: { index: [w], columns: due, values: [qty] }
";
        assert!(ReportConfig::from_yaml_str(yaml).is_err());
    }
}
