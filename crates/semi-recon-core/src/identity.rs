use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::table::{Cell, Table};
use crate::EngineError;

/// Identity of one physical part: (wafer, specification, product code).
/// Comparison is exact, so case and whitespace are significant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CanonicalKey {
    pub wafer: String,
    pub spec: String,
    pub product: String,
}

impl CanonicalKey {
    #[must_use]
    pub fn new(
        wafer: impl Into<String>,
        spec: impl Into<String>,
        product: impl Into<String>,
    ) -> Self {
        Self {
            wafer: wafer.into(),
            spec: spec.into(),
            product: product.into(),
        }
    }

    #[must_use]
    pub fn has_blank_field(&self) -> bool {
        self.wafer.is_empty() || self.spec.is_empty() || self.product.is_empty()
    }
}

impl Display for CanonicalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.wafer, self.spec, self.product)
    }
}

/// Names of the wafer, specification and product columns in one table.
///
/// Every stage that reads or writes identity fields takes this value instead
/// of assuming column names, so resolver output and pivot input agree.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(deny_unknown_fields)]
pub struct IdentityColumns {
    pub wafer: String,
    pub spec: String,
    pub product: String,
}

impl IdentityColumns {
    #[must_use]
    pub fn new(
        wafer: impl Into<String>,
        spec: impl Into<String>,
        product: impl Into<String>,
    ) -> Self {
        Self {
            wafer: wafer.into(),
            spec: spec.into(),
            product: product.into(),
        }
    }

    /// Column names in output order: wafer, spec, product.
    #[must_use]
    pub fn names(&self) -> [&str; 3] {
        [&self.wafer, &self.spec, &self.product]
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.names().iter().map(|name| (*name).to_string()).collect()
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.names().contains(&column)
    }

    pub(crate) fn locate(&self, table: &Table) -> Result<IdentityIndex, EngineError> {
        Ok(IdentityIndex {
            wafer: table.require_column(&self.wafer)?,
            spec: table.require_column(&self.spec)?,
            product: table.require_column(&self.product)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct IdentityIndex {
    wafer: usize,
    spec: usize,
    product: usize,
}

impl IdentityIndex {
    pub(crate) fn positions(self) -> [usize; 3] {
        [self.wafer, self.spec, self.product]
    }

    pub(crate) fn key(self, row: &[Cell]) -> CanonicalKey {
        CanonicalKey {
            wafer: row[self.wafer].key_text(),
            spec: row[self.spec].key_text(),
            product: row[self.product].key_text(),
        }
    }
}
