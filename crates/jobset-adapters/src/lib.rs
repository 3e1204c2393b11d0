//! Tier adapters onto the canonical job schema, plus cell and payload decoding.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{new_null_array, ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use arrow_select::concat::concat_batches;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use jobset_core::{Employer, JobRecord, JobSource, Provenance, UnifyError};
use jobset_storage::Relation;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jobset-adapters";

pub const TIERS_FILE: &str = "tiers.yaml";
pub const JOBS_RELATION: &str = "jobs";
pub const PROVENANCE_COLUMN: &str = "source_table";
pub const ORIGINAL_ID: &str = "original_id";
pub const CATEGORIZED_DATA: &str = "CategorizedData";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Key,
    Text,
    Timestamp,
    Flag,
    Counter,
    Json,
}

/// What a field becomes when its cell is missing, blank, or unparseable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnAbsent {
    Null,
    False,
    Zero,
}

impl OnAbsent {
    fn cell(self) -> Cell {
        match self {
            OnAbsent::Null => Cell::Absent,
            OnAbsent::False => Cell::Flag(false),
            OnAbsent::Zero => Cell::Counter(0),
        }
    }
}

impl FieldKind {
    pub fn on_absent(self) -> OnAbsent {
        match self {
            FieldKind::Flag => OnAbsent::False,
            FieldKind::Counter => OnAbsent::Zero,
            _ => OnAbsent::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalField {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> CanonicalField {
    CanonicalField { name, kind }
}

/// Column shape every job tier is normalized onto, in relation order.
pub const JOB_FIELDS: &[CanonicalField] = &[
    field("id", FieldKind::Key),
    field("job_title", FieldKind::Text),
    field("url", FieldKind::Text),
    field("department", FieldKind::Text),
    field("level", FieldKind::Text),
    field("location", FieldKind::Text),
    field("schedule", FieldKind::Text),
    field("main", FieldKind::Flag),
    field("sync", FieldKind::Flag),
    field("ignore", FieldKind::Flag),
    field("removed", FieldKind::Flag),
    field("manual", FieldKind::Flag),
    field("Archived", FieldKind::Flag),
    field("ideal", FieldKind::Flag),
    field("created_at", FieldKind::Timestamp),
    field("updated_at", FieldKind::Timestamp),
    field(CATEGORIZED_DATA, FieldKind::Json),
    field("clicks", FieldKind::Counter),
    field("description", FieldKind::Text),
    field("job_embedding", FieldKind::Text),
    field(ORIGINAL_ID, FieldKind::Key),
    field("employer_id", FieldKind::Key),
    field("jobsource_id", FieldKind::Key),
];

pub const EMPLOYER_FIELDS: &[CanonicalField] = &[
    field("id", FieldKind::Key),
    field("name", FieldKind::Text),
    field("alt_name", FieldKind::Text),
    field("logo_url", FieldKind::Text),
    field("fh", FieldKind::Flag),
    field("jobscount", FieldKind::Counter),
    field("jobscount_online", FieldKind::Counter),
];

pub const JOBSOURCE_FIELDS: &[CanonicalField] = &[
    field("jobsource_id", FieldKind::Key),
    field("jobsource", FieldKind::Text),
    field("description", FieldKind::Text),
];

/// Arrow schema of a normalized job relation: every canonical field plus the provenance tag.
pub fn canonical_schema() -> SchemaRef {
    let mut fields = JOB_FIELDS
        .iter()
        .map(|f| ArrowField::new(f.name, DataType::Utf8, true))
        .collect::<Vec<_>>();
    fields.push(ArrowField::new(PROVENANCE_COLUMN, DataType::Utf8, false));
    Arc::new(Schema::new(fields))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Absent,
    Integer(i64),
    Text(String),
    Flag(bool),
    Counter(u64),
    Structured(JsonValue),
}

impl Cell {
    pub fn into_integer(self) -> Option<i64> {
        match self {
            Cell::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Cell::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> bool {
        matches!(self, Cell::Flag(true))
    }

    pub fn as_counter(&self) -> u64 {
        match self {
            Cell::Counter(value) => *value,
            _ => 0,
        }
    }

    pub fn into_json(self) -> Option<JsonValue> {
        match self {
            Cell::Structured(value) => Some(value),
            _ => None,
        }
    }
}

impl CanonicalField {
    /// Decodes a raw cell. Only JSON payloads can fail; every other kind falls back to its absence policy.
    pub fn decode(&self, raw: Option<&str>) -> Result<Cell, UnifyError> {
        let parsed = match self.kind {
            FieldKind::Key => parse_key(raw).map(Cell::Integer),
            FieldKind::Text => text_or_none(raw).map(Cell::Text),
            FieldKind::Timestamp => parse_timestamp(raw).map(Cell::Text),
            FieldKind::Flag => parse_flag(raw).map(Cell::Flag),
            FieldKind::Counter => parse_counter(raw).map(Cell::Counter),
            FieldKind::Json => match raw {
                Some(text) => parse_embedded_text(self.name, text)?.map(Cell::Structured),
                None => None,
            },
        };
        Ok(parsed.unwrap_or_else(|| self.kind.on_absent().cell()))
    }
}

pub fn text_or_none(raw: Option<&str>) -> Option<String> {
    raw.filter(|s| !s.trim().is_empty()).map(ToString::to_string)
}

/// Integer keys; tolerates the `10.0` spelling float-typed exports produce.
pub fn parse_key(raw: Option<&str>) -> Option<i64> {
    let text = raw?.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    let value = text.parse::<f64>().ok()?;
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Some(value as i64)
    } else {
        None
    }
}

pub fn parse_flag(raw: Option<&str>) -> Option<bool> {
    let text = raw?.trim().to_ascii_lowercase();
    match text.as_str() {
        "true" | "t" | "yes" | "y" => Some(true),
        "false" | "f" | "no" | "n" => Some(false),
        _ => parse_key(Some(&text)).map(|v| v != 0),
    }
}

pub fn parse_counter(raw: Option<&str>) -> Option<u64> {
    parse_key(raw).and_then(|v| u64::try_from(v).ok())
}

/// Keeps the source spelling of a timestamp once it is known to be ISO-8601 shaped.
pub fn parse_timestamp(raw: Option<&str>) -> Option<String> {
    let text = raw?.trim();
    if text.is_empty() {
        return None;
    }
    let valid = DateTime::parse_from_rfc3339(text).is_ok()
        || DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z").is_ok()
        || DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%#z").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok();
    valid.then(|| text.to_string())
}

fn parse_failure(field: &str, reason: impl ToString) -> UnifyError {
    UnifyError::FieldParseFailure {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn parse_embedded_text(field: &str, text: &str) -> Result<Option<JsonValue>, UnifyError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<JsonValue>(text) {
        Ok(JsonValue::Null) => Ok(None),
        Ok(parsed @ (JsonValue::Object(_) | JsonValue::Array(_))) => Ok(Some(parsed)),
        Ok(other) => Err(parse_failure(
            field,
            format!("expected an object or array, found {}", json_kind(&other)),
        )),
        Err(err) => Err(parse_failure(field, err)),
    }
}

/// Null in, absent out; structures pass through; serialized text must parse to a structure.
pub fn parse_embedded_json(field: &str, value: &JsonValue) -> Result<Option<JsonValue>, UnifyError> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Object(_) | JsonValue::Array(_) => Ok(Some(value.clone())),
        JsonValue::String(text) => parse_embedded_text(field, text),
        other => Err(parse_failure(
            field,
            format!("expected serialized JSON, found {}", json_kind(other)),
        )),
    }
}

/// Maps one source relation of job rows onto the canonical job schema.
pub trait TierAdapter: Send + Sync {
    fn tier_id(&self) -> &str;
    fn provenance(&self) -> Provenance;
    fn file_name(&self) -> &str;

    /// Source column feeding `canonical`, or `None` when this tier never carries the field.
    fn source_column<'a>(&'a self, canonical: &'a str) -> Option<&'a str>;
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub tier_id: String,
    pub file_name: String,
    pub provenance: Provenance,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Canonical field name -> column name used by this export.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Identity column mapping with optional per-field renames.
#[derive(Debug, Clone)]
pub struct ColumnMapTier {
    config: TierConfig,
}

impl ColumnMapTier {
    pub fn new(config: TierConfig) -> Self {
        Self { config }
    }
}

impl TierAdapter for ColumnMapTier {
    fn tier_id(&self) -> &str {
        &self.config.tier_id
    }

    fn provenance(&self) -> Provenance {
        self.config.provenance
    }

    fn file_name(&self) -> &str {
        &self.config.file_name
    }

    fn source_column<'a>(&'a self, canonical: &'a str) -> Option<&'a str> {
        if canonical == ORIGINAL_ID && self.config.provenance == Provenance::Active {
            return None;
        }
        Some(
            self.config
                .renames
                .get(canonical)
                .map(String::as_str)
                .unwrap_or(canonical),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRegistry {
    pub tiers: Vec<TierConfig>,
}

impl TierRegistry {
    /// The two exports every installation has: live listings and the archive table.
    pub fn builtin() -> Self {
        Self {
            tiers: vec![
                TierConfig {
                    tier_id: "jobs".to_string(),
                    file_name: "jobs_rows.csv".to_string(),
                    provenance: Provenance::Active,
                    enabled: true,
                    renames: BTreeMap::new(),
                    notes: None,
                },
                TierConfig {
                    tier_id: "jobs_archiviert".to_string(),
                    file_name: "jobs_archiviert_rows.csv".to_string(),
                    provenance: Provenance::Archived,
                    enabled: true,
                    renames: BTreeMap::new(),
                    notes: None,
                },
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: TierRegistry = serde_yaml::from_str(text).context("parsing tier registry")?;
        registry.validate()?;
        Ok(registry)
    }

    /// `<dir>/tiers.yaml` when present, the built-in registry otherwise.
    pub fn load_or_builtin(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(TIERS_FILE);
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let enabled = self.tiers.iter().filter(|t| t.enabled).count();
        if enabled == 0 {
            bail!("tier registry has no enabled tiers");
        }
        let mut seen = BTreeSet::new();
        for tier in &self.tiers {
            if tier.file_name.trim().is_empty() {
                bail!("tier `{}` has an empty file_name", tier.tier_id);
            }
            if !seen.insert(tier.tier_id.as_str()) {
                bail!("tier `{}` is declared twice", tier.tier_id);
            }
        }
        Ok(())
    }

    pub fn adapters(&self) -> Vec<Box<dyn TierAdapter>> {
        self.tiers
            .iter()
            .filter(|t| t.enabled)
            .map(|t| Box::new(ColumnMapTier::new(t.clone())) as Box<dyn TierAdapter>)
            .collect()
    }
}

pub struct TierInput<'a> {
    pub adapter: &'a dyn TierAdapter,
    pub relation: &'a Relation,
}

/// Unions any number of job tiers into one relation with the canonical column shape.
///
/// Active tiers come first, archived tiers after; declared order and row order
/// are kept within each group. Canonical fields a tier lacks are null.
pub fn normalize(inputs: &[TierInput<'_>]) -> Result<Relation, UnifyError> {
    let schema = canonical_schema();
    let mut ordered = inputs.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|input| input.adapter.provenance());

    let mut batches = Vec::with_capacity(ordered.len());
    let mut expected_rows = 0usize;
    for input in ordered {
        let adapter = input.adapter;
        let relation = input.relation;
        let rows = relation.num_rows();
        expected_rows += rows;

        if adapter.source_column(ORIGINAL_ID).is_none() && relation.has_values(ORIGINAL_ID) {
            warn!(
                tier = adapter.tier_id(),
                "ignoring original_id values on a tier of active listings"
            );
        }

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(JOB_FIELDS.len() + 1);
        for field in JOB_FIELDS {
            let column = adapter
                .source_column(field.name)
                .and_then(|source| relation.column(source));
            columns.push(
                column
                    .cloned()
                    .unwrap_or_else(|| new_null_array(&DataType::Utf8, rows)),
            );
        }
        columns.push(Arc::new(StringArray::from(vec![
            adapter.provenance().as_str();
            rows
        ])));

        let batch = RecordBatch::try_new(schema.clone(), columns)
            .map_err(|e| UnifyError::malformed(relation.name(), e))?;
        info!(
            tier = adapter.tier_id(),
            provenance = adapter.provenance().as_str(),
            rows,
            "normalized tier"
        );
        batches.push(batch);
    }

    let unified = concat_batches(&schema, &batches)
        .map_err(|e| UnifyError::malformed(JOBS_RELATION, e))?;
    if unified.num_rows() != expected_rows {
        return Err(UnifyError::malformed(
            JOBS_RELATION,
            format!(
                "normalized {} rows from {} input rows",
                unified.num_rows(),
                expected_rows
            ),
        ));
    }
    Ok(Relation::new(JOBS_RELATION, unified))
}

struct RowView<'a> {
    relation: &'a Relation,
    row: usize,
    fields: &'static [CanonicalField],
}

impl RowView<'_> {
    fn decode(&self, name: &str) -> Result<Cell, UnifyError> {
        let raw = self.relation.text(self.row, name);
        match self.fields.iter().find(|f| f.name == name) {
            Some(field) => field.decode(raw),
            None => Ok(text_or_none(raw).map(Cell::Text).unwrap_or(Cell::Absent)),
        }
    }

    fn cell(&self, name: &str) -> Cell {
        self.decode(name).unwrap_or(Cell::Absent)
    }
}

#[derive(Debug)]
pub struct DecodedJob {
    /// Record with both links unresolved and every optional field present.
    pub record: JobRecord,
    pub parse_failure: Option<UnifyError>,
}

/// Decodes one row of a normalized job relation.
pub fn decode_job(relation: &Relation, row: usize) -> Result<DecodedJob, UnifyError> {
    let provenance = relation
        .text(row, PROVENANCE_COLUMN)
        .and_then(Provenance::parse)
        .ok_or_else(|| {
            UnifyError::malformed(relation.name(), format!("row {row} carries no provenance tag"))
        })?;
    let view = RowView {
        relation,
        row,
        fields: JOB_FIELDS,
    };

    let (categorized_data, parse_failure) = match view.decode(CATEGORIZED_DATA) {
        Ok(cell) => (cell.into_json(), None),
        Err(err) => (None, Some(err)),
    };

    let record = JobRecord {
        id: view.cell("id").into_integer(),
        job_title: view.cell("job_title").into_text(),
        url: view.cell("url").into_text(),
        department: view.cell("department").into_text(),
        level: view.cell("level").into_text(),
        location: view.cell("location").into_text(),
        schedule: view.cell("schedule").into_text(),
        main: view.cell("main").as_flag(),
        sync: view.cell("sync").as_flag(),
        ignore: view.cell("ignore").as_flag(),
        removed: view.cell("removed").as_flag(),
        manual: view.cell("manual").as_flag(),
        archived: view.cell("Archived").as_flag(),
        ideal: view.cell("ideal").as_flag(),
        created_at: view.cell("created_at").into_text(),
        updated_at: view.cell("updated_at").into_text(),
        source_table: provenance,
        categorized_data: Some(categorized_data),
        clicks: view.cell("clicks").as_counter(),
        description: Some(view.cell("description").into_text()),
        job_embedding: Some(view.cell("job_embedding").into_text()),
        original_id: view.cell(ORIGINAL_ID).into_integer(),
        employer: None,
        employer_id: Some(view.cell("employer_id").into_integer()),
        jobsource: None,
        jobsource_id: Some(view.cell("jobsource_id").into_integer()),
    };

    Ok(DecodedJob {
        record,
        parse_failure,
    })
}

pub fn decode_employers(relation: &Relation) -> Vec<Employer> {
    (0..relation.num_rows())
        .filter_map(|row| {
            let view = RowView {
                relation,
                row,
                fields: EMPLOYER_FIELDS,
            };
            let Some(id) = view.cell("id").into_integer() else {
                warn!(source = relation.name(), row, "skipping employer row without a usable id");
                return None;
            };
            Some(Employer {
                id,
                name: view.cell("name").into_text(),
                alt_name: view.cell("alt_name").into_text(),
                logo_url: view.cell("logo_url").into_text(),
                fh: view.cell("fh").as_flag(),
                jobscount: view.cell("jobscount").as_counter(),
                jobscount_online: view.cell("jobscount_online").as_counter(),
            })
        })
        .collect()
}

pub fn decode_job_sources(relation: &Relation) -> Vec<JobSource> {
    (0..relation.num_rows())
        .filter_map(|row| {
            let view = RowView {
                relation,
                row,
                fields: JOBSOURCE_FIELDS,
            };
            let Some(jobsource_id) = view.cell("jobsource_id").into_integer() else {
                warn!(source = relation.name(), row, "skipping job source row without a usable id");
                return None;
            };
            Some(JobSource {
                jobsource_id,
                jobsource: view.cell("jobsource").into_text(),
                description: view.cell("description").into_text(),
            })
        })
        .collect()
}
