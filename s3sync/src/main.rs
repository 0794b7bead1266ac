//! s3sync - Main entry point
//!
//! Manifest-based sync between a local directory and an S3 bucket.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use s3sync::config::Config;
use s3sync::fs::fingerprint::hash_file;
use s3sync::fs::walker::{walk_directory, WalkOptions};
use s3sync::inventory::{Destination, LocalTree, RelPath};
use s3sync::store::{build_client, list_buckets, RemoteStore, S3Store, Transfer};
use s3sync::sync::{ManifestStore, RunMode, SessionPlan, SyncOp, SyncSession};
use s3sync::utils::{self, format::format_bytes};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload local changes to the bucket
    Push {
        local: PathBuf,
        bucket: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Download remote changes into a local directory
    Pull {
        bucket: String,
        #[arg(default_value = ".")]
        local: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Apply changes in both directions
    Sync {
        local: PathBuf,
        bucket: Option<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show what a sync would do
    Status {
        local: PathBuf,
        bucket: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// List the files s3sync would consider under a directory
    Scan { local: PathBuf },
    /// Upload a single file
    Upload {
        file: PathBuf,
        bucket: String,
        /// Object key (defaults to the file name)
        key: Option<String>,
    },
    /// Download a single object
    Download {
        bucket: String,
        key: String,
        /// Target file or directory (defaults to the current directory)
        local: Option<PathBuf>,
    },
    /// List accessible buckets
    ListBuckets,
    /// Verify credentials and connectivity
    TestConnection,
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Key prefix inside the bucket
    #[arg(long)]
    prefix: Option<String>,

    /// Print the planned actions without transferring anything
    #[arg(long)]
    dry_run: bool,

    /// Treat an unreadable manifest as a first run
    #[arg(long)]
    recover_manifest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_path) = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("Starting s3sync v{}", env!("CARGO_PKG_VERSION"));

    dispatch(cli.command, &config, config_path.as_deref()).await
}

async fn dispatch(command: Command, config: &Config, config_path: Option<&Path>) -> Result<()> {
    match command {
        Command::Push { local, bucket, run } => run_session(config, RunMode::Push, &local, bucket.as_deref(), &run).await,
        Command::Pull { bucket, local, run } => {
            std::fs::create_dir_all(&local)
                .with_context(|| format!("Failed to create {}", local.display()))?;
            run_session(config, RunMode::Pull, &local, Some(&bucket), &run).await
        }
        Command::Sync { local, bucket, run } => run_session(config, RunMode::Sync, &local, bucket.as_deref(), &run).await,
        Command::Status { local, bucket, prefix } => {
            let run = RunArgs {
                prefix,
                dry_run: true,
                recover_manifest: false,
            };
            run_session(config, RunMode::Sync, &local, bucket.as_deref(), &run).await
        }
        Command::Scan { local } => scan(config, &local),
        Command::Upload { file, bucket, key } => upload(config, &file, &bucket, key).await,
        Command::Download { bucket, key, local } => download(config, &bucket, &key, local).await,
        Command::ListBuckets => {
            let client = build_client(&config.client_options()).await;
            let buckets = list_buckets(&client).await?;
            println!("buckets ({}):", buckets.len());
            for bucket in buckets {
                println!("  - {}", bucket);
            }
            Ok(())
        }
        Command::TestConnection => {
            let client = build_client(&config.client_options()).await;
            let buckets = list_buckets(&client)
                .await
                .context("Connection test failed")?;
            println!("connection ok: {} buckets visible in {}", buckets.len(), config.aws.region);
            Ok(())
        }
        Command::Config { command: ConfigCommand::Show } => {
            match config_path {
                Some(path) => println!("# configuration file: {}", path.display()),
                None => println!("# no configuration file, using defaults"),
            }
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}

async fn run_session(
    config: &Config,
    mode: RunMode,
    local: &Path,
    bucket: Option<&str>,
    run: &RunArgs,
) -> Result<()> {
    let destination = config.resolve_destination(bucket, run.prefix.as_deref())?;
    let store = Arc::new(S3Store::connect(config.store_config(destination.clone())?).await);
    store.ensure_accessible().await?;

    let session = SyncSession::new(
        local,
        LocalTree::new(local, config.path_filter()?),
        store,
        ManifestStore::for_root(local),
        config.session_options(run.recover_manifest),
    );

    let plan = session.plan(mode).await?;
    if run.dry_run {
        print_plan(&plan);
        println!("dry-run mode: nothing was transferred");
        return Ok(());
    }

    let outcome = session.execute(plan).await?;
    println!(
        "{} {} <-> {}: {} uploaded, {} downloaded, {} unchanged ({})",
        mode,
        local.display(),
        destination,
        outcome.report.uploaded,
        outcome.report.downloaded,
        outcome.report.skipped,
        format_bytes(outcome.report.bytes_transferred)
    );
    if outcome.deferred > 0 {
        println!("{} changes in the other direction were not applied", outcome.deferred);
    }
    Ok(())
}

fn print_plan(plan: &SessionPlan) {
    for action in plan.selected().filter(|a| a.op != SyncOp::Skip) {
        println!("{} {} ({})", action.op, action.relative_path, action.reason);
    }
    for action in plan.deferred() {
        println!("deferred {} {} ({})", action.op, action.relative_path, action.reason);
    }
    if plan.is_first_run() {
        println!("no manifest yet: first sync of this directory");
    }
    println!("{} summary: {}", plan.mode, plan.summary());
}

fn scan(config: &Config, local: &Path) -> Result<()> {
    let options = WalkOptions {
        filter: config.path_filter()?,
    };
    let files = walk_directory(local, options)?;

    println!("files in {} ({} files):", local.display(), files.len());
    for file in files {
        println!(
            "  {} ({} bytes, {})",
            file.relative_path,
            file.size,
            file.modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn upload(config: &Config, file: &Path, bucket: &str, key: Option<String>) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", file.display()))?,
    };
    let key = RelPath::new(key)?;
    let fingerprint = hash_file(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let store = S3Store::connect(config.store_config(Destination::new(bucket))?).await;
    println!("uploading {} to s3://{}/{}", file.display(), bucket, key);
    store.put(file, &key, &fingerprint).await?;
    println!("file uploaded successfully");
    Ok(())
}

async fn download(config: &Config, bucket: &str, key: &str, local: Option<PathBuf>) -> Result<()> {
    let key = RelPath::new(key)?;
    let target = match local {
        Some(path) if !path.is_dir() => path,
        Some(dir) => dir.join(key.file_name()),
        None => PathBuf::from(key.file_name()),
    };

    let store = S3Store::connect(config.store_config(Destination::new(bucket))?).await;
    println!("downloading s3://{}/{} to {}", bucket, key, target.display());
    store.get(&key, &target).await?;
    println!("file downloaded successfully");
    Ok(())
}
