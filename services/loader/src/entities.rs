//! Entity extraction
//!
//! Pulls the star-schema entities out of a normalized table as typed
//! structs: dimension rows first (materials, plants, formula or vendor),
//! then samples keyed by sample number plus sample date, then the
//! wide-to-long analysis results and, for the raw-material feed,
//! provenance rows. Rows that cannot be placed are skipped with a typed
//! reason and counted; a single bad row never fails a file.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

use crate::feed::{plant_display_name, FeedSpec, FeedVariant};
use crate::store::{Bind, ClaimGuard, ConflictAction, EntityDef, Key, KeyKind, Record};
use crate::table::{Table, Value};

// ============================================================
// Skip accounting
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SkipReason {
    MissingSampleNo,
    MissingSampleDate,
    MissingMaterialCode,
    MissingPlantCode,
    MissingFormula,
    MissingVendor,
    UnresolvedReference,
    UnresolvedSample,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::MissingSampleNo => "missing_sample_no",
            SkipReason::MissingSampleDate => "missing_sample_date",
            SkipReason::MissingMaterialCode => "missing_material_code",
            SkipReason::MissingPlantCode => "missing_plant_code",
            SkipReason::MissingFormula => "missing_formula",
            SkipReason::MissingVendor => "missing_vendor",
            SkipReason::UnresolvedReference => "unresolved_reference",
            SkipReason::UnresolvedSample => "unresolved_sample",
        };
        f.write_str(label)
    }
}

/// Per-file tally of skipped rows by reason.
#[derive(Debug, Default, Clone)]
pub struct SkipReport {
    counts: BTreeMap<SkipReason, usize>,
}

impl SkipReport {
    pub fn note(&mut self, reason: SkipReason) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: SkipReport) {
        for (reason, n) in other.counts {
            *self.counts.entry(reason).or_insert(0) += n;
        }
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn count(&self, reason: SkipReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .counts
            .iter()
            .map(|(reason, n)| (reason.to_string(), json!(n)))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for SkipReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(reason, n)| format!("{}={}", reason, n))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

// ============================================================
// Entity structs
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub material_code: String,
    pub material_description: String,
    /// Finished-product feed only; always empty for raw materials.
    pub material_old_code: String,
}

impl Material {
    pub fn into_record(self, variant: FeedVariant) -> Record {
        // description is NOT NULL in both schemas; a blank stays a blank
        let mut binds = vec![
            Bind::text(&self.material_code),
            Bind::Text(Some(self.material_description)),
        ];
        if variant == FeedVariant::Formula {
            binds.push(Bind::text(&self.material_old_code));
        }
        Record::new(binds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plant {
    pub plant: String,
    pub plant_name: String,
}

impl Plant {
    pub fn into_record(self) -> Record {
        Record::new(vec![
            Bind::text(&self.plant),
            Bind::Text(Some(self.plant_name)),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub formula_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vendor {
    pub vendor_code: String,
    pub vendor_name: String,
}

/// The feed's domain dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Formula(Formula),
    Vendor(Vendor),
}

impl Dimension {
    fn key(&self) -> &str {
        match self {
            Dimension::Formula(f) => &f.formula_name,
            Dimension::Vendor(v) => &v.vendor_code,
        }
    }

    pub fn into_record(self) -> Record {
        match self {
            Dimension::Formula(f) => Record::new(vec![Bind::text(&f.formula_name)]),
            Dimension::Vendor(v) => Record::new(vec![
                Bind::text(&v.vendor_code),
                Bind::Text(Some(v.vendor_name)),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub material_id: Uuid,
    pub plant_id: Uuid,
    pub dimension_id: Uuid,
    pub sample_no: String,
    pub sample_date: NaiveDate,
    pub details: SampleDetails,
}

/// Descriptive fields differ per feed; empty strings mean "no value".
#[derive(Debug, Clone, PartialEq)]
pub enum SampleDetails {
    FinishedProduct {
        inspection_lot: String,
        truck_no: String,
        pallet_no: String,
        batch_no: String,
        bin_no: String,
        load_time: Option<NaiveDateTime>,
        validation_code: String,
        validation_date: Option<NaiveDate>,
        remark: String,
    },
    RawMaterial {
        inspection_lot: String,
        batch_no: String,
        material_doc: String,
    },
}

impl Sample {
    pub fn into_record(self) -> Record {
        let mut binds = vec![
            Bind::Id(self.material_id),
            Bind::Id(self.plant_id),
            Bind::Id(self.dimension_id),
            Bind::Text(Some(self.sample_no)),
            Bind::Date(Some(self.sample_date)),
        ];
        match self.details {
            SampleDetails::FinishedProduct {
                inspection_lot,
                truck_no,
                pallet_no,
                batch_no,
                bin_no,
                load_time,
                validation_code,
                validation_date,
                remark,
            } => {
                binds.push(Bind::text(&inspection_lot));
                binds.push(Bind::text(&truck_no));
                binds.push(Bind::text(&pallet_no));
                binds.push(Bind::text(&batch_no));
                binds.push(Bind::text(&bin_no));
                binds.push(Bind::Timestamp(load_time));
                binds.push(Bind::text(&validation_code));
                binds.push(Bind::Date(validation_date));
                binds.push(Bind::text(&remark));
            }
            SampleDetails::RawMaterial {
                inspection_lot,
                batch_no,
                material_doc,
            } => {
                binds.push(Bind::text(&inspection_lot));
                binds.push(Bind::text(&batch_no));
                binds.push(Bind::text(&material_doc));
            }
        }
        Record::new(binds)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub sample_id: Uuid,
    pub sample_date: NaiveDate,
    pub analysis_parameter: String,
    pub analysis_value: f64,
}

impl AnalysisResult {
    pub fn into_record(self) -> Record {
        Record::new(vec![
            Bind::Id(self.sample_id),
            Bind::Date(Some(self.sample_date)),
            Bind::Text(Some(self.analysis_parameter)),
            Bind::Num(Some(self.analysis_value)),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialSource {
    pub sample_id: Uuid,
    pub valuation_date: NaiveDate,
    pub plant_origin: String,
    pub producer: String,
    pub country: String,
    pub original_batch: String,
}

impl MaterialSource {
    pub fn into_record(self) -> Record {
        Record::new(vec![
            Bind::Id(self.sample_id),
            Bind::Date(Some(self.valuation_date)),
            Bind::text(&self.plant_origin),
            Bind::text(&self.producer),
            Bind::text(&self.country),
            Bind::text(&self.original_batch),
        ])
    }
}

// ============================================================
// Entity definitions
// ============================================================

pub fn materials_def(spec: &FeedSpec) -> EntityDef {
    match spec.variant {
        FeedVariant::Formula => EntityDef {
            name: "materials",
            table: format!("{}.materials", spec.db_schema),
            id_column: "material_id",
            columns: vec!["material_code", "material_description", "material_old_code"],
            key: KeyKind::Code("material_code"),
            conflict_cols: vec!["material_code"],
            conflict_target: "(material_code)".to_string(),
            // the old code is claimed on first insert and never updated
            action: ConflictAction::Update(vec!["material_description"]),
            claim_guard: Some(ClaimGuard {
                column: "material_old_code",
                owner_column: "material_code",
            }),
            not_null: vec!["material_code", "material_description"],
        },
        FeedVariant::Vendor => EntityDef {
            name: "materials",
            table: format!("{}.materials", spec.db_schema),
            id_column: "material_id",
            columns: vec!["material_code", "material_description"],
            key: KeyKind::Code("material_code"),
            conflict_cols: vec!["material_code"],
            conflict_target: "(material_code)".to_string(),
            action: ConflictAction::Update(vec!["material_description"]),
            claim_guard: None,
            not_null: vec!["material_code", "material_description"],
        },
    }
}

pub fn plants_def(spec: &FeedSpec) -> EntityDef {
    EntityDef {
        name: "plants",
        table: format!("{}.plants", spec.db_schema),
        id_column: "plant_id",
        columns: vec!["plant", "plant_name"],
        key: KeyKind::Code("plant"),
        conflict_cols: vec!["plant"],
        conflict_target: "(plant)".to_string(),
        action: ConflictAction::Update(vec!["plant_name"]),
        claim_guard: None,
        not_null: vec!["plant", "plant_name"],
    }
}

pub fn dimension_def(spec: &FeedSpec) -> EntityDef {
    match spec.variant {
        FeedVariant::Formula => EntityDef {
            name: "formula",
            table: format!("{}.formula", spec.db_schema),
            id_column: "formula_id",
            columns: vec!["formula_name"],
            key: KeyKind::Code("formula_name"),
            conflict_cols: vec!["formula_name"],
            conflict_target: "(formula_name)".to_string(),
            action: ConflictAction::Nothing,
            claim_guard: None,
            not_null: vec!["formula_name"],
        },
        FeedVariant::Vendor => EntityDef {
            name: "vendors",
            table: format!("{}.vendors", spec.db_schema),
            id_column: "vendor_id",
            columns: vec!["vendor_code", "vendor_name"],
            key: KeyKind::Code("vendor_code"),
            conflict_cols: vec!["vendor_code"],
            conflict_target: "(vendor_code)".to_string(),
            action: ConflictAction::Update(vec!["vendor_name"]),
            claim_guard: None,
            not_null: vec!["vendor_code", "vendor_name"],
        },
    }
}

pub fn samples_def(spec: &FeedSpec) -> EntityDef {
    match spec.variant {
        FeedVariant::Formula => EntityDef {
            name: "samples",
            table: format!("{}.samples", spec.db_schema),
            id_column: "sample_id",
            columns: vec![
                "material_id",
                "plant_id",
                "formula_id",
                "sample_no",
                "manufacturing_date",
                "inspection_lot",
                "truck_no",
                "pallet_no",
                "batch_no",
                "bin_no",
                "load_time",
                "validation_code",
                "validation_date",
                "remark",
            ],
            key: KeyKind::Composite("sample_no", "manufacturing_date"),
            conflict_cols: vec!["sample_no", "manufacturing_date"],
            conflict_target: "(sample_no, manufacturing_date)".to_string(),
            action: ConflictAction::Update(vec![
                "material_id",
                "plant_id",
                "formula_id",
                "inspection_lot",
                "truck_no",
                "pallet_no",
                "batch_no",
                "bin_no",
                "load_time",
                "validation_code",
                "validation_date",
                "remark",
            ]),
            claim_guard: None,
            not_null: vec![
                "material_id",
                "plant_id",
                "formula_id",
                "sample_no",
                "manufacturing_date",
            ],
        },
        FeedVariant::Vendor => EntityDef {
            name: "samples",
            table: format!("{}.samples", spec.db_schema),
            id_column: "sample_id",
            columns: vec![
                "material_id",
                "plant_id",
                "vendor_id",
                "sample_no",
                "valuation_date",
                "inspection_lot",
                "batch_no",
                "material_doc",
            ],
            key: KeyKind::Composite("sample_no", "valuation_date"),
            conflict_cols: vec!["sample_no", "valuation_date"],
            conflict_target: "(sample_no, valuation_date)".to_string(),
            action: ConflictAction::Update(vec![
                "material_id",
                "plant_id",
                "vendor_id",
                "inspection_lot",
                "batch_no",
                "material_doc",
            ]),
            claim_guard: None,
            not_null: vec![
                "material_id",
                "plant_id",
                "vendor_id",
                "sample_no",
                "valuation_date",
            ],
        },
    }
}

pub fn analysis_results_def(spec: &FeedSpec) -> EntityDef {
    let date_col: &'static str = match spec.variant {
        FeedVariant::Formula => "manufacturing_date",
        FeedVariant::Vendor => "valuation_date",
    };
    EntityDef {
        name: "analysis_results",
        table: format!("{}.analysis_results", spec.db_schema),
        id_column: "result_id",
        columns: vec!["sample_id", date_col, "analysis_parameter", "analysis_value"],
        key: KeyKind::Code("analysis_parameter"),
        conflict_cols: vec!["sample_id", "analysis_parameter", date_col],
        conflict_target: format!("(sample_id, analysis_parameter, {})", date_col),
        action: ConflictAction::Update(vec!["analysis_value"]),
        claim_guard: None,
        not_null: vec!["sample_id", date_col, "analysis_parameter"],
    }
}

pub fn material_sources_def(spec: &FeedSpec) -> EntityDef {
    EntityDef {
        name: "material_sources",
        table: format!("{}.material_sources", spec.db_schema),
        id_column: "source_id",
        columns: vec![
            "sample_id",
            "valuation_date",
            "plant_origin",
            "producer",
            "country",
            "original_batch",
        ],
        key: KeyKind::Code("sample_id"),
        conflict_cols: vec![
            "sample_id",
            "plant_origin",
            "producer",
            "country",
            "original_batch",
        ],
        conflict_target: "(sample_id, coalesce(plant_origin, ''), coalesce(producer, ''), \
                          coalesce(country, ''), coalesce(original_batch, ''))"
            .to_string(),
        action: ConflictAction::Nothing,
        claim_guard: None,
        not_null: vec!["sample_id", "valuation_date"],
    }
}

// ============================================================
// Dimension builders
// ============================================================

fn field(table: &Table, row: &[Value], name: &str) -> String {
    table.text(row, name).unwrap_or("").to_string()
}

/// Distinct materials, last occurrence wins so a corrected description
/// later in the file replaces the earlier one.
pub fn build_materials(table: &Table, spec: &FeedSpec) -> Vec<Material> {
    let mut by_code: BTreeMap<String, Material> = BTreeMap::new();
    for row in &table.rows {
        let Some(code) = table.text(row, "material_code") else {
            continue;
        };
        let old_code = match spec.variant {
            FeedVariant::Formula => field(table, row, "material_old_code"),
            FeedVariant::Vendor => String::new(),
        };
        by_code.insert(
            code.to_string(),
            Material {
                material_code: code.to_string(),
                material_description: field(table, row, "material_description"),
                material_old_code: old_code,
            },
        );
    }
    by_code.into_values().collect()
}

/// Distinct plants. The master plant table wins over the name in the
/// file; the code itself is the fallback display name.
pub fn build_plants(table: &Table, _spec: &FeedSpec) -> Vec<Plant> {
    let mut by_code: BTreeMap<String, Plant> = BTreeMap::new();
    for row in &table.rows {
        let Some(code) = table.text(row, "plant") else {
            continue;
        };
        let name = plant_display_name(code)
            .map(|n| n.to_string())
            .or_else(|| table.text(row, "plant_name").map(|n| n.to_string()))
            .unwrap_or_else(|| code.to_string());
        by_code.insert(
            code.to_string(),
            Plant {
                plant: code.to_string(),
                plant_name: name,
            },
        );
    }
    by_code.into_values().collect()
}

pub fn build_dimension(table: &Table, spec: &FeedSpec) -> Vec<Dimension> {
    let mut by_key: BTreeMap<String, Dimension> = BTreeMap::new();
    for row in &table.rows {
        let Some(key) = table.text(row, spec.variant.key_column()) else {
            continue;
        };
        let dim = match spec.variant {
            FeedVariant::Formula => Dimension::Formula(Formula {
                formula_name: key.to_string(),
            }),
            FeedVariant::Vendor => Dimension::Vendor(Vendor {
                vendor_code: key.to_string(),
                vendor_name: field(table, row, "vendor_name"),
            }),
        };
        by_key.insert(dim.key().to_string(), dim);
    }
    by_key.into_values().collect()
}

// ============================================================
// Fact builders
// ============================================================

/// Dimension key maps used to resolve sample references.
pub struct DimMaps {
    pub materials: HashMap<Key, Uuid>,
    pub plants: HashMap<Key, Uuid>,
    pub dimension: HashMap<Key, Uuid>,
}

fn sample_key(
    table: &Table,
    row: &[Value],
    spec: &FeedSpec,
) -> Result<(String, NaiveDate), SkipReason> {
    let no = table
        .text(row, "sample_no")
        .ok_or(SkipReason::MissingSampleNo)?;
    let date = table
        .value(row, &spec.sample_date_column)
        .as_date()
        .ok_or(SkipReason::MissingSampleDate)?;
    Ok((no.to_string(), date))
}

/// Sample rows with all references resolved. A row missing any part of
/// its key or any reference is skipped and tallied; duplicates of one
/// composite key collapse to the last occurrence.
pub fn build_samples(
    table: &Table,
    spec: &FeedSpec,
    maps: &DimMaps,
) -> (Vec<Sample>, SkipReport) {
    let mut report = SkipReport::default();
    let mut by_key: BTreeMap<(String, NaiveDate), Sample> = BTreeMap::new();

    for row in &table.rows {
        let (sample_no, date) = match sample_key(table, row, spec) {
            Ok(key) => key,
            Err(reason) => {
                report.note(reason);
                continue;
            }
        };
        let (material_id, plant_id, dimension_id) =
            match resolve_refs(table, row, spec, maps) {
                Ok(ids) => ids,
                Err(reason) => {
                    report.note(reason);
                    continue;
                }
            };

        let details = match spec.variant {
            FeedVariant::Formula => SampleDetails::FinishedProduct {
                inspection_lot: field(table, row, "inspection_lot"),
                truck_no: field(table, row, "truck_no"),
                pallet_no: field(table, row, "pallet_no"),
                batch_no: field(table, row, "batch_no"),
                bin_no: field(table, row, "bin_no"),
                load_time: table.value(row, "load_time").as_timestamp(),
                validation_code: field(table, row, "validation_code"),
                validation_date: table.value(row, "validation_date").as_date(),
                remark: field(table, row, "remark"),
            },
            FeedVariant::Vendor => SampleDetails::RawMaterial {
                inspection_lot: field(table, row, "inspection_lot"),
                batch_no: field(table, row, "batch_no"),
                material_doc: field(table, row, "material_doc"),
            },
        };
        by_key.insert(
            (sample_no.clone(), date),
            Sample {
                material_id,
                plant_id,
                dimension_id,
                sample_no,
                sample_date: date,
                details,
            },
        );
    }
    (by_key.into_values().collect(), report)
}

fn resolve_refs(
    table: &Table,
    row: &[Value],
    spec: &FeedSpec,
    maps: &DimMaps,
) -> Result<(Uuid, Uuid, Uuid), SkipReason> {
    let material_code = table
        .text(row, "material_code")
        .ok_or(SkipReason::MissingMaterialCode)?;
    let plant_code = table
        .text(row, "plant")
        .ok_or(SkipReason::MissingPlantCode)?;
    let dim_key = table.text(row, spec.variant.key_column()).ok_or(match spec.variant {
        FeedVariant::Formula => SkipReason::MissingFormula,
        FeedVariant::Vendor => SkipReason::MissingVendor,
    })?;

    let material_id = maps
        .materials
        .get(&Key::Code(material_code.to_string()))
        .ok_or(SkipReason::UnresolvedReference)?;
    let plant_id = maps
        .plants
        .get(&Key::Code(plant_code.to_string()))
        .ok_or(SkipReason::UnresolvedReference)?;
    let dimension_id = maps
        .dimension
        .get(&Key::Code(dim_key.to_string()))
        .ok_or(SkipReason::UnresolvedReference)?;
    Ok((*material_id, *plant_id, *dimension_id))
}

/// Wide-to-long reshape: one result per sample per analysis parameter
/// that carries a value. Null measurements produce no row.
pub fn build_analysis_results(
    table: &Table,
    spec: &FeedSpec,
    samples: &HashMap<Key, Uuid>,
) -> (Vec<AnalysisResult>, SkipReport) {
    let mut report = SkipReport::default();
    let params = spec.analysis_parameters();
    let mut by_key: BTreeMap<(Uuid, String), AnalysisResult> = BTreeMap::new();

    for row in &table.rows {
        let Ok((sample_no, date)) = sample_key(table, row, spec) else {
            // already tallied by the sample builder
            continue;
        };
        let Some(sample_id) = samples.get(&Key::Composite(sample_no, date)) else {
            report.note(SkipReason::UnresolvedSample);
            continue;
        };
        for param in &params {
            let Some(value) = table.value(row, param).as_number() else {
                continue;
            };
            by_key.insert(
                (*sample_id, param.to_string()),
                AnalysisResult {
                    sample_id: *sample_id,
                    sample_date: date,
                    analysis_parameter: param.to_string(),
                    analysis_value: value,
                },
            );
        }
    }
    (by_key.into_values().collect(), report)
}

/// Provenance rows for the raw-material feed. Emitted only when the row
/// carries at least one provenance field; duplicates collapse.
pub fn build_material_sources(
    table: &Table,
    spec: &FeedSpec,
    samples: &HashMap<Key, Uuid>,
) -> (Vec<MaterialSource>, SkipReport) {
    let mut report = SkipReport::default();
    let mut by_key: BTreeMap<(Uuid, String, String, String, String), MaterialSource> =
        BTreeMap::new();

    for row in &table.rows {
        let Ok((sample_no, date)) = sample_key(table, row, spec) else {
            continue;
        };
        let plant_origin = field(table, row, "plant_origin");
        let producer = field(table, row, "producer");
        let country = field(table, row, "country");
        let original_batch = field(table, row, "original_batch");
        if [&plant_origin, &producer, &country, &original_batch]
            .iter()
            .all(|f| f.is_empty())
        {
            continue;
        }
        let Some(sample_id) = samples.get(&Key::Composite(sample_no, date)) else {
            report.note(SkipReason::UnresolvedSample);
            continue;
        };
        by_key.insert(
            (
                *sample_id,
                plant_origin.clone(),
                producer.clone(),
                country.clone(),
                original_batch.clone(),
            ),
            MaterialSource {
                sample_id: *sample_id,
                valuation_date: date,
                plant_origin,
                producer,
                country,
                original_batch,
            },
        );
    }
    (by_key.into_values().collect(), report)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ColumnClass, ColumnSpec};

    fn col(name: &str, class: ColumnClass) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            class,
            date_column: None,
        }
    }

    fn rm_spec() -> FeedSpec {
        FeedSpec {
            feed: "raw_material".to_string(),
            db_schema: "raw_material".to_string(),
            sheet: None,
            rename: HashMap::new(),
            drop: vec![],
            columns: vec![
                col("sample_no", ColumnClass::Text),
                col("material_code", ColumnClass::Text),
                col("material_description", ColumnClass::Text),
                col("plant", ColumnClass::Text),
                col("plant_name", ColumnClass::Text),
                col("vendor_code", ColumnClass::Text),
                col("vendor_name", ColumnClass::Text),
                col("inspection_lot", ColumnClass::Text),
                col("batch_no", ColumnClass::Text),
                col("material_doc", ColumnClass::Text),
                col("valuation_date", ColumnClass::Date),
                col("plant_origin", ColumnClass::Text),
                col("producer", ColumnClass::Text),
                col("country", ColumnClass::Text),
                col("original_batch", ColumnClass::Text),
                col("moisture", ColumnClass::Numeric),
                col("protein", ColumnClass::Numeric),
            ],
            sample_date_column: "valuation_date".to_string(),
            variant: FeedVariant::Vendor,
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    struct RowSpec<'a> {
        sample_no: &'a str,
        material: &'a str,
        plant: &'a str,
        vendor: &'a str,
        day: u32,
        moisture: Option<f64>,
        producer: &'a str,
    }

    fn rm_row(spec: &FeedSpec, r: RowSpec<'_>) -> Vec<Value> {
        spec.columns
            .iter()
            .map(|c| match c.name.as_str() {
                "sample_no" => Value::Text(r.sample_no.to_string()),
                "material_code" => Value::Text(r.material.to_string()),
                "material_description" => Value::Text(format!("desc {}", r.material)),
                "plant" => Value::Text(r.plant.to_string()),
                "plant_name" => Value::Text(format!("file name {}", r.plant)),
                "vendor_code" => Value::Text(r.vendor.to_string()),
                "vendor_name" => Value::Text(format!("vendor {}", r.vendor)),
                "valuation_date" => {
                    if r.day == 0 {
                        Value::Null
                    } else {
                        Value::Date(date(r.day))
                    }
                }
                "producer" => Value::Text(r.producer.to_string()),
                "moisture" => r.moisture.map(Value::Number).unwrap_or(Value::Null),
                "protein" => Value::Number(21.5),
                _ => Value::Text(String::new()),
            })
            .collect()
    }

    fn rm_table(spec: &FeedSpec, rows: Vec<RowSpec<'_>>) -> Table {
        let columns = spec.columns.iter().map(|c| c.name.clone()).collect();
        let rows = rows.into_iter().map(|r| rm_row(spec, r)).collect();
        Table::new(columns, rows)
    }

    fn default_row<'a>() -> RowSpec<'a> {
        RowSpec {
            sample_no: "S-1",
            material: "M1",
            plant: "1110",
            vendor: "V1",
            day: 5,
            moisture: Some(12.3),
            producer: "",
        }
    }

    fn maps_for(table: &Table, spec: &FeedSpec) -> DimMaps {
        DimMaps {
            materials: build_materials(table, spec)
                .into_iter()
                .map(|m| (Key::Code(m.material_code), Uuid::new_v4()))
                .collect(),
            plants: build_plants(table, spec)
                .into_iter()
                .map(|p| (Key::Code(p.plant), Uuid::new_v4()))
                .collect(),
            dimension: build_dimension(table, spec)
                .into_iter()
                .map(|d| (Key::Code(d.key().to_string()), Uuid::new_v4()))
                .collect(),
        }
    }

    // ---------- dimensions ----------

    #[test]
    fn test_build_materials_dedups_last_wins() {
        let spec = rm_spec();
        let table = rm_table(
            &spec,
            vec![
                default_row(),
                RowSpec {
                    sample_no: "S-2",
                    ..default_row()
                },
            ],
        );
        let materials = build_materials(&table, &spec);
        assert_eq!(materials.len(), 1);
        assert_eq!(materials[0].material_code, "M1");
        assert_eq!(materials[0].material_old_code, "");
    }

    #[test]
    fn test_build_plants_prefers_master_name() {
        let spec = rm_spec();
        let table = rm_table(&spec, vec![default_row()]);
        let plants = build_plants(&table, &spec);
        assert_eq!(plants.len(), 1);
        // 1110 is in the master table: its name wins over the file value
        assert_eq!(plants[0].plant_name, "Lopburi Feed Mill");
    }

    #[test]
    fn test_build_plants_falls_back_to_file_name() {
        let spec = rm_spec();
        let table = rm_table(
            &spec,
            vec![RowSpec {
                plant: "9999",
                ..default_row()
            }],
        );
        let plants = build_plants(&table, &spec);
        assert_eq!(plants[0].plant_name, "file name 9999");
    }

    #[test]
    fn test_build_dimension_vendor_carries_name() {
        let spec = rm_spec();
        let table = rm_table(&spec, vec![default_row()]);
        let dims = build_dimension(&table, &spec);
        assert_eq!(
            dims,
            vec![Dimension::Vendor(Vendor {
                vendor_code: "V1".to_string(),
                vendor_name: "vendor V1".to_string(),
            })]
        );
    }

    // ---------- samples ----------

    #[test]
    fn test_build_samples_skips_and_counts_missing_keys() {
        let spec = rm_spec();
        let table = rm_table(
            &spec,
            vec![
                default_row(),
                RowSpec {
                    sample_no: "",
                    ..default_row()
                },
                RowSpec {
                    sample_no: "S-3",
                    day: 0,
                    ..default_row()
                },
                RowSpec {
                    sample_no: "S-4",
                    vendor: "",
                    ..default_row()
                },
            ],
        );
        let maps = maps_for(&table, &spec);
        let (samples, report) = build_samples(&table, &spec, &maps);
        assert_eq!(samples.len(), 1);
        assert_eq!(report.total(), 3);
        assert_eq!(report.count(SkipReason::MissingSampleNo), 1);
        assert_eq!(report.count(SkipReason::MissingSampleDate), 1);
        assert_eq!(report.count(SkipReason::MissingVendor), 1);
    }

    #[test]
    fn test_build_samples_same_no_different_date_are_distinct() {
        let spec = rm_spec();
        let table = rm_table(
            &spec,
            vec![
                default_row(),
                RowSpec {
                    day: 6,
                    ..default_row()
                },
            ],
        );
        let maps = maps_for(&table, &spec);
        let (samples, report) = build_samples(&table, &spec, &maps);
        assert_eq!(samples.len(), 2);
        assert!(report.is_empty());
    }

    #[test]
    fn test_build_samples_duplicate_key_last_wins() {
        let spec = rm_spec();
        let table = rm_table(
            &spec,
            vec![
                RowSpec {
                    material: "M1",
                    ..default_row()
                },
                RowSpec {
                    material: "M2",
                    ..default_row()
                },
            ],
        );
        let maps = maps_for(&table, &spec);
        let (samples, _) = build_samples(&table, &spec, &maps);
        assert_eq!(samples.len(), 1);
        let m2 = maps.materials.get(&Key::Code("M2".to_string())).unwrap();
        assert_eq!(samples[0].material_id, *m2);
    }

    #[test]
    fn test_build_samples_unknown_reference_is_counted() {
        let spec = rm_spec();
        let table = rm_table(&spec, vec![default_row()]);
        let maps = DimMaps {
            materials: HashMap::new(),
            plants: HashMap::new(),
            dimension: HashMap::new(),
        };
        let (samples, report) = build_samples(&table, &spec, &maps);
        assert!(samples.is_empty());
        assert_eq!(report.count(SkipReason::UnresolvedReference), 1);
    }

    // ---------- analysis results ----------

    fn sample_map_for(no: &str, day: u32) -> HashMap<Key, Uuid> {
        [(Key::Composite(no.to_string(), date(day)), Uuid::new_v4())]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_build_analysis_results_one_row_per_valued_parameter() {
        let spec = rm_spec();
        let table = rm_table(&spec, vec![default_row()]);
        let (results, report) =
            build_analysis_results(&table, &spec, &sample_map_for("S-1", 5));
        // moisture and protein carry values
        assert_eq!(results.len(), 2);
        assert!(report.is_empty());
        assert!(results
            .iter()
            .any(|r| r.analysis_parameter == "moisture" && r.analysis_value == 12.3));
    }

    #[test]
    fn test_build_analysis_results_null_measurement_emits_no_row() {
        let spec = rm_spec();
        let table = rm_table(
            &spec,
            vec![RowSpec {
                moisture: None,
                ..default_row()
            }],
        );
        let (results, _) = build_analysis_results(&table, &spec, &sample_map_for("S-1", 5));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].analysis_parameter, "protein");
    }

    #[test]
    fn test_build_analysis_results_counts_unresolved_sample() {
        let spec = rm_spec();
        let table = rm_table(&spec, vec![default_row()]);
        let empty: HashMap<Key, Uuid> = HashMap::new();
        let (results, report) = build_analysis_results(&table, &spec, &empty);
        assert!(results.is_empty());
        assert_eq!(report.count(SkipReason::UnresolvedSample), 1);
    }

    // ---------- material sources ----------

    #[test]
    fn test_build_material_sources_requires_a_provenance_field() {
        let spec = rm_spec();
        let table = rm_table(
            &spec,
            vec![
                default_row(),
                RowSpec {
                    sample_no: "S-2",
                    producer: "Acme Fishmeal",
                    ..default_row()
                },
            ],
        );
        let samples: HashMap<Key, Uuid> = [
            (Key::Composite("S-1".to_string(), date(5)), Uuid::new_v4()),
            (Key::Composite("S-2".to_string(), date(5)), Uuid::new_v4()),
        ]
        .into_iter()
        .collect();
        let (sources, report) = build_material_sources(&table, &spec, &samples);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].producer, "Acme Fishmeal");
        assert!(report.is_empty());
    }

    #[test]
    fn test_build_material_sources_dedups_identical_provenance() {
        let spec = rm_spec();
        let row = || RowSpec {
            producer: "Acme Fishmeal",
            ..default_row()
        };
        let table = rm_table(&spec, vec![row(), row()]);
        let (sources, _) = build_material_sources(&table, &spec, &sample_map_for("S-1", 5));
        assert_eq!(sources.len(), 1);
    }

    // ---------- record conversion ----------

    #[test]
    fn test_material_record_shape_per_feed() {
        let material = Material {
            material_code: "M1".to_string(),
            material_description: "desc".to_string(),
            material_old_code: "OLD".to_string(),
        };
        let fp = material.clone().into_record(FeedVariant::Formula);
        assert_eq!(fp.binds.len(), 3);
        let rm = material.into_record(FeedVariant::Vendor);
        assert_eq!(rm.binds.len(), 2);
    }

    #[test]
    fn test_blank_description_stays_empty_string_not_null() {
        let material = Material {
            material_code: "M1".to_string(),
            material_description: String::new(),
            material_old_code: String::new(),
        };
        let record = material.into_record(FeedVariant::Formula);
        // description lands in a NOT NULL column, the old code does not
        assert_eq!(record.binds[1], Bind::Text(Some(String::new())));
        assert_eq!(record.binds[2], Bind::Text(None));

        let vendor = Dimension::Vendor(Vendor {
            vendor_code: "V1".to_string(),
            vendor_name: String::new(),
        });
        assert_eq!(vendor.into_record().binds[1], Bind::Text(Some(String::new())));
    }

    #[test]
    fn test_sample_record_matches_def_columns() {
        let spec = rm_spec();
        let sample = Sample {
            material_id: Uuid::new_v4(),
            plant_id: Uuid::new_v4(),
            dimension_id: Uuid::new_v4(),
            sample_no: "S-1".to_string(),
            sample_date: date(5),
            details: SampleDetails::RawMaterial {
                inspection_lot: String::new(),
                batch_no: "B-1".to_string(),
                material_doc: String::new(),
            },
        };
        let record = sample.into_record();
        assert_eq!(record.binds.len(), samples_def(&spec).columns.len());
        assert_eq!(record.binds[5], Bind::Text(None));
        assert_eq!(record.binds[6], Bind::text("B-1"));
    }

    // ---------- skip report ----------

    #[test]
    fn test_skip_report_merge_and_json() {
        let mut a = SkipReport::default();
        a.note(SkipReason::MissingSampleNo);
        let mut b = SkipReport::default();
        b.note(SkipReason::MissingSampleNo);
        b.note(SkipReason::UnresolvedSample);
        a.merge(b);
        assert_eq!(a.total(), 3);
        assert_eq!(a.to_json()["missing_sample_no"], json!(2));
    }
}
