use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jobset_sync::{
    run_slim, DocumentState, JobFilter, MetadataStatus, UnifyConfig, UnifyPipeline,
    METADATA_BATCH_SIZE,
};
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobset")]
#[command(about = "Job dataset unifier command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the CSV exports into the unified document.
    Unify(UnifyArgs),
    /// Project a unified document down to the slim dataset.
    Slim {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Metadata coverage of a job document.
    Stats {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Ids of the next jobs still lacking metadata.
    Pending {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        employer: Option<String>,
        #[arg(long, default_value_t = METADATA_BATCH_SIZE)]
        limit: usize,
    },
    /// Write `{"jobs": [...]}` of the jobs that carry metadata.
    ExportEnriched {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
    },
    /// Store categorized data on one job.
    SetMetadata {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        id: i64,
        /// Serialized JSON object or array; `@path` reads it from a file.
        #[arg(long)]
        value: String,
    },
    /// Reset one job's categorized data to null.
    ClearMetadata {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        id: i64,
    },
}

#[derive(Debug, Default, Args)]
struct UnifyArgs {
    #[arg(long)]
    input_dir: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    include_embeddings: bool,
    #[arg(long)]
    exclude_descriptions: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_for(args: &UnifyArgs) -> UnifyConfig {
    let env = UnifyConfig::from_env();
    let mut config = match &args.input_dir {
        Some(dir) => {
            let mut config = UnifyConfig::for_data_dir(dir);
            config.include_embeddings = env.include_embeddings;
            config.include_descriptions = env.include_descriptions;
            config
        }
        None => env,
    };
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if args.include_embeddings {
        config.include_embeddings = true;
    }
    if args.exclude_descriptions {
        config.include_descriptions = false;
    }
    config
}

fn document_path(input: Option<PathBuf>) -> PathBuf {
    input.unwrap_or_else(|| UnifyConfig::from_env().slim_output)
}

fn read_metadata_value(value: &str) -> Result<JsonValue> {
    let text = match value.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => value.to_string(),
    };
    Ok(JsonValue::String(text))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Unify(UnifyArgs::default())) {
        Commands::Unify(args) => {
            let config = config_for(&args);
            let summary = UnifyPipeline::new(config).run_once()?;
            println!(
                "unify complete: output={} size={:.2}MB sha256={}",
                summary.output,
                summary.size_mb(),
                summary.sha256
            );
            println!(
                "jobs={} (active={} archived={}) employers={} jobsources={}",
                summary.total_jobs,
                summary.active_jobs,
                summary.archived_jobs,
                summary.total_employers,
                summary.total_jobsources
            );
            println!(
                "parse_failures={} unresolved_employers={} unresolved_sources={}",
                summary.parse_failures, summary.unresolved_employers, summary.unresolved_sources
            );
        }
        Commands::Slim { input, output } => {
            let config = UnifyConfig::from_env();
            let input = input.unwrap_or(config.output);
            let output = output.unwrap_or(config.slim_output);
            let summary = run_slim(&input, &output)?;
            println!(
                "slim complete: output={} size={:.2}MB jobs={} employers={} jobsources={}",
                summary.output,
                summary.size_mb(),
                summary.total_jobs,
                summary.total_employers,
                summary.total_jobsources
            );
        }
        Commands::Stats { input } => {
            let state = DocumentState::load(document_path(input))?;
            let stats = state.stats();
            println!(
                "jobs={} with_metadata={} without_metadata={}",
                stats.total_jobs, stats.with_metadata, stats.without_metadata
            );
            for name in state.employer_names() {
                println!("employer: {name}");
            }
        }
        Commands::Pending {
            input,
            employer,
            limit,
        } => {
            let state = DocumentState::load(document_path(input))?;
            let filter = JobFilter {
                employer,
                metadata: MetadataStatus::Missing,
            };
            for id in state.pending_metadata(&filter, limit) {
                println!("{id}");
            }
        }
        Commands::ExportEnriched { input, output } => {
            let state = DocumentState::load(document_path(input))?;
            let export = state.export_with_metadata();
            let stored = jobset_storage::write_json_document(&output, &export)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("export complete: output={} bytes={}", stored.path.display(), stored.byte_size);
        }
        Commands::SetMetadata { input, id, value } => {
            let path = document_path(input);
            let value = read_metadata_value(&value)?;
            let mut state = DocumentState::load(&path)?;
            if !state.set_categorized_data(id, value)? {
                bail!("no job with id {id} in {}", path.display());
            }
            state.save(&path)?;
            info!(job_id = id, "stored metadata");
        }
        Commands::ClearMetadata { input, id } => {
            let path = document_path(input);
            let mut state = DocumentState::load(&path)?;
            if !state.clear_categorized_data(id) {
                bail!("no job with id {id} in {}", path.display());
            }
            state.save(&path)?;
            info!(job_id = id, "cleared metadata");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_defaults_to_unify() {
        let cli = Cli::try_parse_from(["jobset"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn unify_flags_override_the_environment() {
        let cli = Cli::try_parse_from([
            "jobset",
            "unify",
            "--input-dir",
            "/tmp/exports",
            "--output",
            "/tmp/out.json",
            "--include-embeddings",
            "--exclude-descriptions",
        ])
        .unwrap();
        let Some(Commands::Unify(args)) = cli.command else {
            panic!("expected unify");
        };
        let config = config_for(&args);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/exports"));
        assert_eq!(config.output, PathBuf::from("/tmp/out.json"));
        assert_eq!(config.slim_output, PathBuf::from("/tmp/exports/jobs_dataset.json"));
        assert!(config.include_embeddings);
        assert!(!config.include_descriptions);
    }

    #[test]
    fn pending_limit_defaults_to_the_viewer_batch() {
        let cli = Cli::try_parse_from(["jobset", "pending", "--input", "x.json"]).unwrap();
        match cli.command {
            Some(Commands::Pending { limit, .. }) => assert_eq!(limit, 10),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn metadata_values_are_validated_by_the_document() {
        let mut state = DocumentState::from_value(serde_json::json!([{"id": 1}])).unwrap();
        let value = read_metadata_value(r#"{"Kategorie": ["IT"]}"#).unwrap();
        assert!(state.set_categorized_data(1, value).unwrap());
        assert_eq!(state.stats().with_metadata, 1);

        let value = read_metadata_value("{oops").unwrap();
        assert!(state.set_categorized_data(1, value).is_err());
        let value = read_metadata_value("42").unwrap();
        assert!(state.set_categorized_data(1, value).is_err());
        assert_eq!(state.jobs()[0]["CategorizedData"], serde_json::json!({"Kategorie": ["IT"]}));
    }

    #[test]
    fn metadata_values_can_come_from_a_file() {
        let dir = std::env::temp_dir().join(format!("jobset-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("metadata.json");
        std::fs::write(&path, "[\"Verwaltung\"]").unwrap();

        let value = read_metadata_value(&format!("@{}", path.display())).unwrap();
        assert_eq!(value, JsonValue::String("[\"Verwaltung\"]".to_string()));
        assert!(read_metadata_value("@/nonexistent/jobset/metadata.json").is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
