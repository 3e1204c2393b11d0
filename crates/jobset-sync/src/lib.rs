//! Reference resolution, document assembly, slim projection and run orchestration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobset_adapters::{
    decode_employers, decode_job, decode_job_sources, normalize, parse_embedded_json, DecodedJob,
    TierInput, TierRegistry, CATEGORIZED_DATA,
};
use jobset_core::{
    DocumentMetadata, Employer, EmployerRef, JobSource, Link, Provenance, SourceRef,
    UnifiedDocument, UnifyError,
};
use jobset_storage::{
    load_relation, read_json_document, write_json_document, Relation, StoredDocument,
    EMPLOYERS_FILE, JOBSOURCES_FILE,
};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobset-sync";

pub const UNIFIED_FILE: &str = "unified_jobs.json";
pub const SLIM_FILE: &str = "jobs_dataset.json";
pub const METADATA_BATCH_SIZE: usize = 10;
pub const UNKNOWN_EMPLOYER: &str = "Unknown";

const SLIM_COLLECTIONS: [&str; 3] = ["employers", "jobsources", "jobs"];

#[derive(Debug, Clone)]
pub struct UnifyConfig {
    pub data_dir: PathBuf,
    pub output: PathBuf,
    pub slim_output: PathBuf,
    pub include_embeddings: bool,
    pub include_descriptions: bool,
}

impl UnifyConfig {
    /// Defaults for a data directory: outputs land next to the sources.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let options = AssembleOptions::default();
        Self {
            output: data_dir.join(UNIFIED_FILE),
            slim_output: data_dir.join(SLIM_FILE),
            data_dir,
            include_embeddings: options.include_embeddings,
            include_descriptions: options.include_descriptions,
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("JOBSET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let mut config = Self::for_data_dir(data_dir);
        if let Ok(path) = std::env::var("JOBSET_OUTPUT") {
            config.output = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("JOBSET_SLIM_OUTPUT") {
            config.slim_output = PathBuf::from(path);
        }
        config.include_embeddings = env_flag("JOBSET_INCLUDE_EMBEDDINGS");
        config.include_descriptions = !env_flag("JOBSET_EXCLUDE_DESCRIPTIONS");
        config
    }

    pub fn options(&self) -> AssembleOptions {
        AssembleOptions {
            include_embeddings: self.include_embeddings,
            include_descriptions: self.include_descriptions,
        }
    }
}

pub fn truthy_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| truthy_flag(&v))
        .unwrap_or(false)
}

/// The four sources of one run, job tiers already normalized.
#[derive(Debug, Clone)]
pub struct SourceSet {
    pub jobs: Relation,
    pub employers: Relation,
    pub jobsources: Relation,
}

/// Loads every enabled tier plus both reference relations. Any missing or malformed source fails the set.
pub fn load_source_set(dir: &Path, registry: &TierRegistry) -> Result<SourceSet, UnifyError> {
    let adapters = registry.adapters();
    let tiers = adapters
        .iter()
        .map(|adapter| {
            let key = adapter.source_column("id").unwrap_or("id");
            load_relation(adapter.tier_id(), dir.join(adapter.file_name()), key)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let employers = load_relation("employers", dir.join(EMPLOYERS_FILE), "id")?;
    let jobsources = load_relation("jobsources", dir.join(JOBSOURCES_FILE), "jobsource_id")?;

    let inputs = adapters
        .iter()
        .zip(&tiers)
        .map(|(adapter, relation)| TierInput {
            adapter: adapter.as_ref(),
            relation,
        })
        .collect::<Vec<_>>();
    let jobs = normalize(&inputs)?;

    Ok(SourceSet {
        jobs,
        employers,
        jobsources,
    })
}

/// Lookup tables for foreign keys, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    employers: BTreeMap<i64, Employer>,
    jobsources: BTreeMap<i64, JobSource>,
}

impl ReferenceIndex {
    /// Duplicate ids keep the last row.
    pub fn build(
        employers: impl IntoIterator<Item = Employer>,
        jobsources: impl IntoIterator<Item = JobSource>,
    ) -> Self {
        let mut index = Self::default();
        for employer in employers {
            let id = employer.id;
            if index.employers.insert(id, employer).is_some() {
                warn!(employer_id = id, "duplicate employer id; keeping the last row");
            }
        }
        for source in jobsources {
            let id = source.jobsource_id;
            if index.jobsources.insert(id, source).is_some() {
                warn!(jobsource_id = id, "duplicate job source id; keeping the last row");
            }
        }
        index
    }

    pub fn resolve_employer(&self, raw: Option<i64>) -> Link<EmployerRef> {
        match raw.and_then(|key| self.employers.get(&key)) {
            Some(employer) => Link::Resolved(employer.to_ref()),
            None => Link::Unresolved { raw_key: raw },
        }
    }

    pub fn resolve_source(&self, raw: Option<i64>) -> Link<SourceRef> {
        match raw.and_then(|key| self.jobsources.get(&key)) {
            Some(source) => Link::Resolved(source.to_ref()),
            None => Link::Unresolved { raw_key: raw },
        }
    }

    pub fn employers(&self) -> impl Iterator<Item = &Employer> {
        self.employers.values()
    }

    pub fn jobsources(&self) -> impl Iterator<Item = &JobSource> {
        self.jobsources.values()
    }
}

/// Field inclusion switches. Records are never filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssembleOptions {
    pub include_embeddings: bool,
    pub include_descriptions: bool,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            include_embeddings: false,
            include_descriptions: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub document: UnifiedDocument,
    pub parse_failures: usize,
    pub unresolved_employers: usize,
    pub unresolved_sources: usize,
}

pub fn assemble(
    jobs: &Relation,
    index: &ReferenceIndex,
    options: AssembleOptions,
    generated_at: DateTime<Utc>,
) -> Result<AssemblyReport, UnifyError> {
    let _span = info_span!("assemble", rows = jobs.num_rows()).entered();

    let mut records = Vec::with_capacity(jobs.num_rows());
    let mut parse_failures = 0usize;
    let mut unresolved_employers = 0usize;
    let mut unresolved_sources = 0usize;
    let mut active_jobs = 0usize;
    let mut archived_jobs = 0usize;

    for row in 0..jobs.num_rows() {
        let DecodedJob {
            mut record,
            parse_failure,
        } = decode_job(jobs, row)?;
        if let Some(err) = parse_failure {
            parse_failures += 1;
            warn!(job_id = ?record.id, error = %err, "dropping unparseable categorized data");
        }

        let employer = index.resolve_employer(record.raw_employer_key());
        if !employer.is_resolved() {
            unresolved_employers += 1;
        }
        record.apply_employer_link(employer);

        let source = index.resolve_source(record.raw_source_key());
        if !source.is_resolved() {
            unresolved_sources += 1;
        }
        record.apply_source_link(source);

        if !options.include_embeddings {
            record.job_embedding = None;
        }
        if !options.include_descriptions {
            record.description = None;
        }

        match record.source_table {
            Provenance::Active => active_jobs += 1,
            Provenance::Archived => archived_jobs += 1,
        }
        records.push(record);
    }

    let employers = index.employers().cloned().collect::<Vec<_>>();
    let jobsources = index.jobsources().cloned().collect::<Vec<_>>();
    let metadata = DocumentMetadata {
        generated_at,
        total_jobs: records.len(),
        active_jobs,
        archived_jobs,
        total_employers: employers.len(),
        total_jobsources: jobsources.len(),
        include_embeddings: options.include_embeddings,
        include_descriptions: options.include_descriptions,
    };
    info!(
        jobs = metadata.total_jobs,
        active = active_jobs,
        archived = archived_jobs,
        parse_failures,
        unresolved_employers,
        unresolved_sources,
        "assembled unified document"
    );

    Ok(AssemblyReport {
        document: UnifiedDocument {
            metadata,
            employers,
            jobsources,
            jobs: records,
        },
        parse_failures,
        unresolved_employers,
        unresolved_sources,
    })
}

/// Slim projection of a serialized unified document. The input is left untouched.
pub fn project_slim(document: &JsonValue) -> Result<JsonValue, UnifyError> {
    let mut slim = Map::new();
    for key in SLIM_COLLECTIONS {
        let collection = document
            .get(key)
            .filter(|value| value.is_array())
            .ok_or_else(|| UnifyError::ProjectionSourceInvalid {
                missing: key.to_string(),
            })?;
        slim.insert(key.to_string(), collection.clone());
    }
    if let Some(JsonValue::Array(jobs)) = slim.get_mut("jobs") {
        for job in jobs.iter_mut().filter_map(JsonValue::as_object_mut) {
            job.shift_remove(CATEGORIZED_DATA);
        }
    }
    Ok(JsonValue::Object(slim))
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: String,
    pub total_jobs: usize,
    pub active_jobs: usize,
    pub archived_jobs: usize,
    pub total_employers: usize,
    pub total_jobsources: usize,
    pub parse_failures: usize,
    pub unresolved_employers: usize,
    pub unresolved_sources: usize,
    pub bytes: usize,
    pub sha256: String,
}

impl RunSummary {
    pub fn size_mb(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlimSummary {
    pub input: String,
    pub output: String,
    pub total_employers: usize,
    pub total_jobsources: usize,
    pub total_jobs: usize,
    pub bytes: usize,
    pub sha256: String,
}

impl SlimSummary {
    pub fn size_mb(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }
}

pub struct UnifyPipeline {
    config: UnifyConfig,
}

impl UnifyPipeline {
    pub fn new(config: UnifyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UnifyConfig {
        &self.config
    }

    pub fn run_once(&self) -> Result<RunSummary> {
        self.run_at(Utc::now())
    }

    /// Same as [`run_once`](Self::run_once) with the document timestamp pinned.
    pub fn run_at(&self, generated_at: DateTime<Utc>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let _span = info_span!("unify_run", %run_id).entered();

        let registry = TierRegistry::load_or_builtin(&self.config.data_dir)?;
        let sources = load_source_set(&self.config.data_dir, &registry)?;
        let index = ReferenceIndex::build(
            decode_employers(&sources.employers),
            decode_job_sources(&sources.jobsources),
        );
        let report = assemble(&sources.jobs, &index, self.config.options(), generated_at)?;

        let stored = write_json_document(&self.config.output, &report.document)
            .with_context(|| format!("writing {}", self.config.output.display()))?;
        info!(
            output = %stored.path.display(),
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            "wrote unified document"
        );

        let metadata = &report.document.metadata;
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            output: stored.path.display().to_string(),
            total_jobs: metadata.total_jobs,
            active_jobs: metadata.active_jobs,
            archived_jobs: metadata.archived_jobs,
            total_employers: metadata.total_employers,
            total_jobsources: metadata.total_jobsources,
            parse_failures: report.parse_failures,
            unresolved_employers: report.unresolved_employers,
            unresolved_sources: report.unresolved_sources,
            bytes: stored.byte_size,
            sha256: stored.content_hash,
        })
    }
}

pub fn run_unify_from_env() -> Result<RunSummary> {
    UnifyPipeline::new(UnifyConfig::from_env()).run_once()
}

/// Reads a unified document, projects it and writes the slim document.
pub fn run_slim(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<SlimSummary> {
    let input = input.as_ref();
    let output = output.as_ref();
    let _span = info_span!("slim_run", input = %input.display()).entered();

    let document = read_json_document("unified document", input)?;
    let slim = project_slim(&document)?;
    let count = |key: &str| slim.get(key).and_then(JsonValue::as_array).map_or(0, Vec::len);
    let stored = write_json_document(output, &slim)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(output = %stored.path.display(), bytes = stored.byte_size, "wrote slim document");

    Ok(SlimSummary {
        input: input.display().to_string(),
        output: stored.path.display().to_string(),
        total_employers: count("employers"),
        total_jobsources: count("jobsources"),
        total_jobs: count("jobs"),
        bytes: stored.byte_size,
        sha256: stored.content_hash,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataStatus {
    #[default]
    All,
    Has,
    Missing,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Display name of the resolved employer; jobs without one never match.
    pub employer: Option<String>,
    pub metadata: MetadataStatus,
}

impl JobFilter {
    pub fn matches(&self, job: &JsonValue) -> bool {
        if let Some(wanted) = &self.employer {
            if employer_name(job) != Some(wanted.as_str()) {
                return false;
            }
        }
        match self.metadata {
            MetadataStatus::All => true,
            MetadataStatus::Has => has_metadata(job),
            MetadataStatus::Missing => !has_metadata(job),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetadataStats {
    pub total_jobs: usize,
    pub with_metadata: usize,
    pub without_metadata: usize,
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(flag) => *flag,
        JsonValue::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        JsonValue::String(text) => !text.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

pub fn has_metadata(job: &JsonValue) -> bool {
    job.get(CATEGORIZED_DATA).is_some_and(is_truthy)
}

/// Display name of a job's employer; `Unknown` when the ref carries no name.
pub fn employer_name(job: &JsonValue) -> Option<&str> {
    let employer = job.get("employer").filter(|e| is_truthy(e))?;
    Some(
        employer
            .get("name")
            .and_then(JsonValue::as_str)
            .unwrap_or(UNKNOWN_EMPLOYER),
    )
}

fn job_id(job: &JsonValue) -> Option<i64> {
    job.get("id").and_then(JsonValue::as_i64)
}

/// A loaded full, slim, or bare-array job document open for metadata edits.
#[derive(Debug, Clone)]
pub struct DocumentState {
    root: JsonValue,
}

impl DocumentState {
    pub fn from_value(root: JsonValue) -> Result<Self, UnifyError> {
        let valid = match &root {
            JsonValue::Array(_) => true,
            JsonValue::Object(map) => map.get("jobs").is_some_and(JsonValue::is_array),
            _ => false,
        };
        if !valid {
            return Err(UnifyError::ProjectionSourceInvalid {
                missing: "jobs".to_string(),
            });
        }
        Ok(Self { root })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, UnifyError> {
        Self::from_value(read_json_document("job document", path)?)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.root
    }

    pub fn into_value(self) -> JsonValue {
        self.root
    }

    pub fn jobs(&self) -> &[JsonValue] {
        match &self.root {
            JsonValue::Array(jobs) => jobs,
            JsonValue::Object(map) => map
                .get("jobs")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    fn jobs_mut(&mut self) -> Option<&mut Vec<JsonValue>> {
        match &mut self.root {
            JsonValue::Array(jobs) => Some(jobs),
            JsonValue::Object(map) => map.get_mut("jobs").and_then(JsonValue::as_array_mut),
            _ => None,
        }
    }

    fn job_mut(&mut self, id: i64) -> Option<&mut Map<String, JsonValue>> {
        self.jobs_mut()?
            .iter_mut()
            .filter_map(JsonValue::as_object_mut)
            .find(|job| job.get("id").and_then(JsonValue::as_i64) == Some(id))
    }

    fn store_categorized_data(&mut self, id: i64, value: JsonValue) -> bool {
        match self.job_mut(id) {
            Some(job) => {
                job.insert(CATEGORIZED_DATA.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Replaces the categorized payload of the first job with `id`. Returns whether one matched.
    ///
    /// `value` goes through [`parse_embedded_json`]: serialized text is parsed, blank text or
    /// `null` clears the payload, and anything that is not an object or array is rejected
    /// without touching the document.
    pub fn set_categorized_data(&mut self, id: i64, value: JsonValue) -> Result<bool, UnifyError> {
        let parsed = parse_embedded_json(CATEGORIZED_DATA, &value)?;
        Ok(self.store_categorized_data(id, parsed.unwrap_or(JsonValue::Null)))
    }

    pub fn clear_categorized_data(&mut self, id: i64) -> bool {
        self.store_categorized_data(id, JsonValue::Null)
    }

    pub fn stats(&self) -> MetadataStats {
        let total_jobs = self.jobs().len();
        let with_metadata = self.jobs().iter().filter(|job| has_metadata(job)).count();
        MetadataStats {
            total_jobs,
            with_metadata,
            without_metadata: total_jobs - with_metadata,
        }
    }

    pub fn filtered(&self, filter: &JobFilter) -> Vec<&JsonValue> {
        self.jobs().iter().filter(|job| filter.matches(job)).collect()
    }

    pub fn employer_names(&self) -> Vec<String> {
        self.jobs()
            .iter()
            .filter_map(employer_name)
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Ids of the next `limit` filtered jobs that still lack metadata.
    pub fn pending_metadata(&self, filter: &JobFilter, limit: usize) -> Vec<i64> {
        self.filtered(filter)
            .into_iter()
            .filter(|job| !has_metadata(job))
            .filter_map(job_id)
            .take(limit)
            .collect()
    }

    pub fn export_with_metadata(&self) -> JsonValue {
        let jobs = self
            .jobs()
            .iter()
            .filter(|job| has_metadata(job))
            .cloned()
            .collect::<Vec<_>>();
        json!({ "jobs": jobs })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<StoredDocument> {
        let path = path.as_ref();
        write_json_document(path, &self.root).with_context(|| format!("saving {}", path.display()))
    }
}
