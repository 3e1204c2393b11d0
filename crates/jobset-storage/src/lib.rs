//! Tabular source loading + atomic document persistence for jobset.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::cast::AsArray;
use arrow_array::{Array, ArrayRef, RecordBatch, StringArray};
use arrow_csv::reader::{Format, ReaderBuilder};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use arrow_select::concat::concat_batches;
use jobset_core::UnifyError;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{info, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobset-storage";

pub const EMPLOYERS_FILE: &str = "employers_rows.csv";
pub const JOBSOURCES_FILE: &str = "jobsource_rows.csv";

const INFER_SAMPLE_ROWS: usize = 64;

/// In-memory table read from one source. Every column is nullable UTF-8.
#[derive(Debug, Clone)]
pub struct Relation {
    name: String,
    batch: RecordBatch,
}

impl Relation {
    pub fn new(name: impl Into<String>, batch: RecordBatch) -> Self {
        Self {
            name: name.into(),
            batch,
        }
    }

    /// Builds a relation from literal rows; short rows are padded with nulls.
    pub fn from_rows(
        name: &str,
        columns: &[&str],
        rows: &[Vec<Option<&str>>],
    ) -> Result<Self, UnifyError> {
        let schema = utf8_schema(columns.iter().copied());
        let arrays = (0..columns.len())
            .map(|i| {
                Arc::new(
                    rows.iter()
                        .map(|row| row.get(i).copied().flatten())
                        .collect::<StringArray>(),
                ) as ArrayRef
            })
            .collect::<Vec<_>>();
        let batch =
            RecordBatch::try_new(schema, arrays).map_err(|e| UnifyError::malformed(name, e))?;
        Ok(Self::new(name, batch))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn column(&self, column: &str) -> Option<&ArrayRef> {
        self.batch.column_by_name(column)
    }

    /// Cell text, with null and blank cells both reported as `None`.
    pub fn text(&self, row: usize, column: &str) -> Option<&str> {
        let array = self.batch.column_by_name(column)?.as_string_opt::<i32>()?;
        if row >= array.len() || array.is_null(row) {
            return None;
        }
        let value = array.value(row);
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    }

    pub fn has_values(&self, column: &str) -> bool {
        (0..self.num_rows()).any(|row| self.text(row, column).is_some())
    }
}

fn utf8_schema<'a>(names: impl Iterator<Item = &'a str>) -> SchemaRef {
    Arc::new(Schema::new(
        names
            .map(|name| ArrowField::new(name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ))
}

fn csv_format() -> Format {
    Format::default().with_header(true)
}

/// Reads a headered CSV file. `key_column` must be present in the header.
pub fn load_relation(
    name: &str,
    path: impl AsRef<Path>,
    key_column: &str,
) -> Result<Relation, UnifyError> {
    let path = path.as_ref();
    let _span = info_span!("load_relation", source = name).entered();

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(UnifyError::SourceNotFound {
                source_name: name.to_string(),
                path: path.to_path_buf(),
            })
        }
        Err(err) => {
            return Err(UnifyError::malformed(
                name,
                format!("opening {}: {err}", path.display()),
            ))
        }
    };

    let (inferred, _) = csv_format()
        .infer_schema(&mut file, Some(INFER_SAMPLE_ROWS))
        .map_err(|e| UnifyError::malformed(name, e))?;
    if inferred.fields().is_empty() {
        return Err(UnifyError::malformed(name, "missing header row"));
    }
    if inferred.index_of(key_column).is_err() {
        return Err(UnifyError::malformed(
            name,
            format!("missing key column `{key_column}`"),
        ));
    }

    // Type inference only discovers the header; every cell is decoded later as text.
    let schema = utf8_schema(inferred.fields().iter().map(|f| f.name().as_str()));
    file.rewind()
        .map_err(|e| UnifyError::malformed(name, format!("rewinding {}: {e}", path.display())))?;
    let reader = ReaderBuilder::new(schema.clone())
        .with_format(csv_format())
        .build(file)
        .map_err(|e| UnifyError::malformed(name, e))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| UnifyError::malformed(name, e))?;
    let batch = concat_batches(&schema, &batches).map_err(|e| UnifyError::malformed(name, e))?;

    info!(source = name, rows = batch.num_rows(), "loaded relation");
    Ok(Relation::new(name, batch))
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` through a sibling temp file and rename.
pub fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<StoredDocument> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = file
        .write_all(bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("writing temp file {}", temp_path.display()));
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(StoredDocument {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

/// Pretty-printed UTF-8 JSON, non-ASCII written literally.
pub fn write_json_document<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    document: &T,
) -> anyhow::Result<StoredDocument> {
    let bytes = serde_json::to_vec_pretty(document).context("serializing document")?;
    write_atomic(path, &bytes)
}

pub fn read_json_document(name: &str, path: impl AsRef<Path>) -> Result<JsonValue, UnifyError> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(UnifyError::SourceNotFound {
                source_name: name.to_string(),
                path: path.to_path_buf(),
            })
        }
        Err(err) => {
            return Err(UnifyError::malformed(
                name,
                format!("reading {}: {err}", path.display()),
            ))
        }
    };
    serde_json::from_str(&text).map_err(|e| UnifyError::malformed(name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, body: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write fixture");
        path
    }

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn atomic_write_replaces_previous_document_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out").join("unified_jobs.json");

        let first = write_atomic(&target, b"{\"jobs\": []}").expect("first write");
        let second = write_atomic(&target, b"{\"jobs\": [1]}").expect("second write");

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(second.byte_size, 13);
        assert_eq!(fs::read(&target).unwrap(), b"{\"jobs\": [1]}");
        let entries = fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1, "temp files must not survive a write");
    }

    #[test]
    fn json_documents_keep_non_ascii_literal() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("doc.json");
        write_json_document(&target, &serde_json::json!({"title": "Bürokauffrau"})).unwrap();
        let text = fs::read_to_string(&target).unwrap();
        assert!(text.contains("Bürokauffrau"));
        assert!(text.contains("\n  \"title\""));
    }

    #[test]
    fn loads_quoted_multiline_cells_and_blank_cells_as_absent() {
        let dir = tempdir().expect("tempdir");
        let path = write_file(
            dir.path(),
            "jobs_rows.csv",
            b"id,job_title,description,clicks\n1,Engineer,\"line one\nline two, with comma\",\n2,,   ,7\n",
        );

        let relation = load_relation("jobs", &path, "id").expect("load");
        assert_eq!(relation.num_rows(), 2);
        assert_eq!(relation.text(0, "description"), Some("line one\nline two, with comma"));
        assert_eq!(relation.text(0, "clicks"), None);
        assert_eq!(relation.text(1, "job_title"), None);
        assert_eq!(relation.text(1, "description"), None);
        assert_eq!(relation.text(1, "clicks"), Some("7"));
        assert_eq!(relation.text(0, "missing_column"), None);
    }

    #[test]
    fn missing_source_is_reported_by_name() {
        let dir = tempdir().expect("tempdir");
        let err = load_relation("employers", dir.path().join("employers_rows.csv"), "id")
            .expect_err("missing file");
        assert!(matches!(err, UnifyError::SourceNotFound { ref source_name, .. } if source_name == "employers"));
    }

    #[test]
    fn ragged_rows_are_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = write_file(dir.path(), "jobsource_rows.csv", b"jobsource_id,jobsource\n1,Web\n2,Feed,extra\n");
        let err = load_relation("jobsources", &path, "jobsource_id").expect_err("ragged");
        assert!(matches!(err, UnifyError::SourceMalformed { ref source_name, .. } if source_name == "jobsources"));
    }

    #[test]
    fn missing_key_column_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = write_file(dir.path(), "employers_rows.csv", b"name,logo_url\nAcme,\n");
        let err = load_relation("employers", &path, "id").expect_err("no key");
        assert!(err.to_string().contains("missing key column `id`"));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = write_file(dir.path(), "employers_rows.csv", b"id,name\n1,\xff\xfe\n");
        let err = load_relation("employers", &path, "id").expect_err("bad encoding");
        assert!(matches!(err, UnifyError::SourceMalformed { .. }));
    }

    #[test]
    fn literal_relations_pad_short_rows() {
        let relation = Relation::from_rows(
            "sources",
            &["jobsource_id", "jobsource"],
            &[vec![Some("1"), Some("Web")], vec![Some("2")]],
        )
        .unwrap();
        assert_eq!(relation.num_rows(), 2);
        assert_eq!(relation.text(1, "jobsource"), None);
        assert!(relation.has_values("jobsource"));
        assert!(relation.column("jobsource_id").is_some());
    }

    #[test]
    fn unreadable_json_documents_are_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = write_file(dir.path(), "unified_jobs.json", b"{\"jobs\": [");
        let err = read_json_document("unified document", &path).expect_err("truncated json");
        assert!(matches!(err, UnifyError::SourceMalformed { .. }));
    }
}
