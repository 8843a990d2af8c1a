//! Feed profiles - the per-feed configuration artifacts
//!
//! A feed profile declares everything that differs between the two
//! laboratory feeds (finished products vs raw materials): the source-header
//! rename map, the canonical column set with type classes, the sample date
//! column, and which domain dimension the feed carries (formula or vendor).
//! Profiles are consumed as JSON; the loader validates them at startup and
//! refuses to process any file with a broken profile.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Known plant codes and their display names. Used when a source row has a
/// plant code but no plant name; a mapping here always wins over the name
/// supplied in the file.
const MASTER_PLANTS: &[(&str, &str)] = &[
    ("1110", "Lopburi Feed Mill"),
    ("1120", "Pak Chong Feed Mill"),
    ("1130", "Chachoengsao Feed Mill"),
    ("1140", "Phitsanulok Feed Mill"),
    ("1150", "Songkhla Feed Mill"),
    ("1210", "Lamphun Feed Mill"),
    ("1220", "Khon Kaen Feed Mill"),
];

/// Look up the display name for a plant code in the master table.
pub fn plant_display_name(code: &str) -> Option<&'static str> {
    MASTER_PLANTS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnClass {
    Text,
    Numeric,
    Date,
    /// Time-of-day field combined with a companion date column into one
    /// timestamp (e.g. load_time + manufacturing_date).
    Timestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub class: ColumnClass,
    /// Companion date column, required for timestamp-class columns.
    #[serde(default)]
    pub date_column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedVariant {
    Formula,
    Vendor,
}

impl FeedVariant {
    /// Natural-key column of the feed's domain dimension.
    pub fn key_column(self) -> &'static str {
        match self {
            FeedVariant::Formula => "formula_name",
            FeedVariant::Vendor => "vendor_code",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSpec {
    /// Feed name used in logs and load-run rows.
    pub feed: String,
    /// Postgres schema the feed's tables live in.
    pub db_schema: String,
    /// Worksheet to read from Excel workbooks; first sheet when absent.
    #[serde(default)]
    pub sheet: Option<String>,
    /// Source header -> canonical column name.
    pub rename: HashMap<String, String>,
    /// Noise columns dropped by raw header name before renaming.
    #[serde(default)]
    pub drop: Vec<String>,
    /// Canonical columns in output order, with their type classes.
    pub columns: Vec<ColumnSpec>,
    /// Date component of the sample composite natural key.
    pub sample_date_column: String,
    pub variant: FeedVariant,
}

impl FeedSpec {
    pub fn load(path: &Path) -> Result<FeedSpec> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read feed profile {}", path.display()))?;
        let spec: FeedSpec = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse feed profile {}", path.display()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// A profile that cannot support the pipeline is a configuration
    /// defect: fatal before any file is touched.
    fn validate(&self) -> Result<()> {
        let mut required = vec![
            "sample_no",
            "material_code",
            "material_description",
            "plant",
            self.sample_date_column.as_str(),
            self.variant.key_column(),
        ];
        if self.variant == FeedVariant::Vendor {
            required.push("vendor_name");
        }
        for name in required {
            if self.column(name).is_none() {
                bail!(
                    "Feed profile '{}' is missing required canonical column '{}'",
                    self.feed,
                    name
                );
            }
        }
        match self.column(&self.sample_date_column) {
            Some(col) if col.class == ColumnClass::Date => {}
            _ => bail!(
                "Feed profile '{}': sample date column '{}' must be declared with class 'date'",
                self.feed,
                self.sample_date_column
            ),
        }
        for col in &self.columns {
            if col.class == ColumnClass::Timestamp {
                let date_col = col.date_column.as_deref().unwrap_or("");
                match self.column(date_col) {
                    Some(c) if c.class == ColumnClass::Date => {}
                    _ => bail!(
                        "Feed profile '{}': timestamp column '{}' needs a date_column of class 'date'",
                        self.feed,
                        col.name
                    ),
                }
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// All numeric-class columns are analysis parameters for the
    /// wide-to-long reshape.
    pub fn analysis_parameters(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.class == ColumnClass::Numeric)
            .map(|c| c.name.as_str())
            .collect()
    }
}
