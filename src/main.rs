//! S3 Backup
//!
//! Command-line entry point: uploads one local file into a folder of the
//! configured bucket, or writes template settings files.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use s3_backup::backup::{BackupRunner, UploadRequest};
use s3_backup::loader::DataFormat;
use s3_backup::settings::{self, Settings, DEFAULT_ENV};

#[derive(Parser)]
#[command(name = "s3-backup")]
#[command(version, about = "Upload backup files into an S3 bucket folder", long_about = None)]
struct Cli {
    /// Directory holding {env}-config and {env}-secrets files
    #[arg(long, env = "S3_BACKUP_CONFIG_DIR", value_name = "DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Environment name selecting the settings files
    #[arg(long, env = "ENV", default_value = DEFAULT_ENV, global = true)]
    env: String,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload one file into a bucket folder
    Upload {
        /// Directory containing the file
        local_file_dir: PathBuf,

        /// File to upload
        file_name: String,

        /// Destination folder in the bucket
        s3_folder_name: String,

        /// Object name in the bucket (defaults to the file name)
        #[arg(long)]
        object_name: Option<String>,

        /// Abort the transfer after this many seconds
        #[arg(long, value_name = "SECS")]
        deadline_secs: Option<u64>,
    },

    /// Write template settings files for the environment
    InitConfig {
        #[arg(long, value_enum, default_value = "json")]
        format: TemplateFormat,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TemplateFormat {
    Json,
    Yaml,
}

impl From<TemplateFormat> for DataFormat {
    fn from(format: TemplateFormat) -> Self {
        match format {
            TemplateFormat::Json => DataFormat::Json,
            TemplateFormat::Yaml => DataFormat::Yaml,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Starting S3 Backup v{}", env!("CARGO_PKG_VERSION"));

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => settings::default_config_dir()?,
    };

    match cli.command {
        Command::InitConfig { format, force } => {
            let paths = settings::write_templates(&config_dir, &cli.env, format.into(), force)?;
            for path in paths {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Upload {
            local_file_dir,
            file_name,
            s3_folder_name,
            object_name,
            deadline_secs,
        } => {
            let settings = Settings::load(&config_dir, &cli.env)?;
            let runner = BackupRunner::connect(&settings)
                .await
                .context("Failed to open a session")?;

            let mut request = UploadRequest::new(local_file_dir, file_name, s3_folder_name);
            if let Some(name) = object_name {
                request = request.with_object_name(name);
            }
            if let Some(secs) = deadline_secs {
                request = request.with_deadline(Duration::from_secs(secs));
            }

            let outcome = runner.upload_file(&request).await;
            Ok(if outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
