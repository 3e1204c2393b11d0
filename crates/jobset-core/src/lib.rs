//! Core domain model and error taxonomy for the job dataset unifier.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "jobset-core";

/// Which source relation a job record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Active,
    Archived,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Active => "active",
            Provenance::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "active" => Some(Provenance::Active),
            "archived" => Some(Provenance::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum UnifyError {
    #[error("required source `{source_name}` not found at {}", .path.display())]
    SourceNotFound { source_name: String, path: PathBuf },
    #[error("source `{source_name}` is malformed: {reason}")]
    SourceMalformed { source_name: String, reason: String },
    #[error("field `{field}` could not be parsed: {reason}")]
    FieldParseFailure { field: String, reason: String },
    #[error("projection input lacks top-level collection `{missing}`")]
    ProjectionSourceInvalid { missing: String },
}

impl UnifyError {
    pub fn malformed(source_name: impl Into<String>, reason: impl ToString) -> Self {
        UnifyError::SourceMalformed {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employer {
    pub id: i64,
    pub name: Option<String>,
    pub alt_name: Option<String>,
    pub logo_url: Option<String>,
    #[serde(default)]
    pub fh: bool,
    #[serde(default)]
    pub jobscount: u64,
    #[serde(default)]
    pub jobscount_online: u64,
}

impl Employer {
    pub fn to_ref(&self) -> EmployerRef {
        EmployerRef {
            id: self.id,
            name: self.name.clone(),
            alt_name: self.alt_name.clone(),
            logo_url: self.logo_url.clone(),
        }
    }
}

/// Display subset of an employer embedded into each job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployerRef {
    pub id: i64,
    pub name: Option<String>,
    pub alt_name: Option<String>,
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSource {
    pub jobsource_id: i64,
    pub jobsource: Option<String>,
    pub description: Option<String>,
}

impl JobSource {
    pub fn to_ref(&self) -> SourceRef {
        SourceRef {
            jobsource_id: self.jobsource_id,
            jobsource: self.jobsource.clone(),
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub jobsource_id: i64,
    pub jobsource: Option<String>,
    pub description: Option<String>,
}

/// Outcome of looking a foreign key up in a reference collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link<R> {
    Resolved(R),
    Unresolved { raw_key: Option<i64> },
}

impl<R> Link<R> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Link::Resolved(_))
    }
}

/// `None` means the key is omitted from the serialized record; `Some(None)` is an explicit null.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Unified job listing. Field order is the serialized order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Option<i64>,
    pub job_title: Option<String>,
    pub url: Option<String>,
    pub department: Option<String>,
    pub level: Option<String>,
    pub location: Option<String>,
    pub schedule: Option<String>,
    #[serde(default)]
    pub main: bool,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub manual: bool,
    #[serde(rename = "Archived", default)]
    pub archived: bool,
    #[serde(default)]
    pub ideal: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub source_table: Provenance,
    #[serde(
        rename = "CategorizedData",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub categorized_data: Option<Option<JsonValue>>,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub job_embedding: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<i64>,
    pub employer: Option<EmployerRef>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub employer_id: Option<Option<i64>>,
    pub jobsource: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "double_option")]
    pub jobsource_id: Option<Option<i64>>,
}

impl JobRecord {
    /// Embeds the resolved ref and drops the raw key, or keeps the raw key next to a null ref.
    pub fn apply_employer_link(&mut self, link: Link<EmployerRef>) {
        match link {
            Link::Resolved(employer) => {
                self.employer = Some(employer);
                self.employer_id = None;
            }
            Link::Unresolved { raw_key } => {
                self.employer = None;
                self.employer_id = Some(raw_key);
            }
        }
    }

    pub fn apply_source_link(&mut self, link: Link<SourceRef>) {
        match link {
            Link::Resolved(source) => {
                self.jobsource = Some(source);
                self.jobsource_id = None;
            }
            Link::Unresolved { raw_key } => {
                self.jobsource = None;
                self.jobsource_id = Some(raw_key);
            }
        }
    }

    pub fn raw_employer_key(&self) -> Option<i64> {
        match &self.employer {
            Some(employer) => Some(employer.id),
            None => self.employer_id.flatten(),
        }
    }

    pub fn raw_source_key(&self) -> Option<i64> {
        match &self.jobsource {
            Some(source) => Some(source.jobsource_id),
            None => self.jobsource_id.flatten(),
        }
    }

    pub fn categorized_data(&self) -> Option<&JsonValue> {
        self.categorized_data.as_ref().and_then(Option::as_ref)
    }

    pub fn without_categorized_data(&self) -> Self {
        Self {
            categorized_data: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub generated_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub active_jobs: usize,
    pub archived_jobs: usize,
    pub total_employers: usize,
    pub total_jobsources: usize,
    pub include_embeddings: bool,
    pub include_descriptions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedDocument {
    pub metadata: DocumentMetadata,
    pub employers: Vec<Employer>,
    pub jobsources: Vec<JobSource>,
    pub jobs: Vec<JobRecord>,
}

/// Lightweight view of a unified document: no run metadata, no categorized payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlimDocument {
    pub employers: Vec<Employer>,
    pub jobsources: Vec<JobSource>,
    pub jobs: Vec<JobRecord>,
}

impl From<&UnifiedDocument> for SlimDocument {
    fn from(document: &UnifiedDocument) -> Self {
        Self {
            employers: document.employers.clone(),
            jobsources: document.jobsources.clone(),
            jobs: document
                .jobs
                .iter()
                .map(JobRecord::without_categorized_data)
                .collect(),
        }
    }
}
