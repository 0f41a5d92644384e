//! Fileguard CLI: validates local files or AJAX JSON payloads the way an
//! upload field would, and prints a JSON report.
//!
//! Limits come from FILEGUARD_* environment variables (a `.env` file is
//! honored); flags override the field constraints. Log filtering follows
//! `FILEGUARD_LOG`, then `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fileguard_core::{parse_ini_size, IniSettings, StaticMimeRegistry, UploadConstraints, UploadLimits};
use fileguard_cli::{init_tracing, run_with_deadline, stage_files};
use fileguard_processing::{AjaxUploadDecoder, AjaxUploads, UploadValidator};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "fileguard", about = "Upload validation and archive bomb detection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate local files as if they were uploaded through one field
    Validate {
        /// Files to validate
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        field: FieldArgs,
    },
    /// Validate a JSON payload of base64 data URI uploads
    Ajax {
        /// JSON file holding `{ "<field>": {"filename", "type", "content"} }`
        payload: PathBuf,
        #[command(flatten)]
        field: FieldArgs,
    },
}

#[derive(Args)]
struct FieldArgs {
    /// Form field name
    #[arg(long, default_value = "file")]
    field: String,
    /// Accept tokens such as `.png` or `image/*` (comma separated)
    #[arg(long, value_delimiter = ',')]
    accept: Vec<String>,
    /// Allow several files in the field
    #[arg(long)]
    multiple: bool,
    #[arg(long)]
    min_count: Option<usize>,
    #[arg(long)]
    max_count: Option<usize>,
    /// Minimum file size, e.g. `10K`
    #[arg(long)]
    min_size: Option<String>,
    /// Maximum file size, e.g. `2M`
    #[arg(long)]
    max_size: Option<String>,
    /// Abort validation and remove temp files after this many seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,
}

impl FieldArgs {
    fn constraints(&self) -> anyhow::Result<UploadConstraints> {
        let mut constraints = UploadConstraints::from_env().context("Failed to load constraints")?;
        if !self.accept.is_empty() {
            constraints.accept = self.accept.clone();
        }
        constraints.multiple = self.multiple || constraints.multiple;
        constraints.min_count = self.min_count.or(constraints.min_count);
        constraints.max_count = self.max_count.or(constraints.max_count);
        if let Some(size) = &self.min_size {
            constraints.min_size = Some(parse_size(size)?);
        }
        if let Some(size) = &self.max_size {
            constraints.max_size = Some(parse_size(size)?);
        }
        Ok(constraints)
    }
}

fn parse_size(value: &str) -> anyhow::Result<u64> {
    parse_ini_size(value).with_context(|| format!("Invalid size '{}'", value))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize report")?;
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut limits = IniSettings::from_env();

    let report = match cli.command {
        Commands::Validate { files, field } => {
            let upload_dir = tempfile::Builder::new()
                .prefix("fileguard-")
                .tempdir_in(limits.uploads_tmp_dir())
                .context("Failed to create uploads directory")?;
            limits.upload_tmp_dir = Some(upload_dir.path().to_path_buf());

            let source = stage_files(&field.field, &files, upload_dir.path())?;
            let validator = UploadValidator::new(field.field.clone(), field.constraints()?, Arc::new(limits))?;
            run_with_deadline(validator, Arc::new(source), Duration::from_secs(field.timeout_secs)).await?
        }
        Commands::Ajax { payload, field } => {
            let json = std::fs::read_to_string(&payload)
                .with_context(|| format!("Failed to read '{}'", payload.display()))?;
            let constraints = field.constraints()?;
            let decoder = AjaxUploadDecoder::from_limits(&limits)
                .with_write_buffer_size(constraints.write_buffer_size)
                .with_registry(Arc::new(StaticMimeRegistry::new()));
            let source = AjaxUploads::from_json(&json, constraints.multiple, &decoder)
                .context("Payload is not valid JSON")?;
            let created = source.created_paths();

            let validator = UploadValidator::new(field.field.clone(), constraints, Arc::new(limits))?;
            let report = run_with_deadline(validator, Arc::new(source), Duration::from_secs(field.timeout_secs)).await?;
            // Files decoded for other fields are never validated.
            for path in created {
                if report.files.iter().all(|f| f.temp_path != path) && path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove decoded upload");
                    }
                }
            }
            report
        }
    };

    print_json(&report)
}
