use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use capstore_core::backend::{BackendSet, DirectoryBackend, JsonFileKeyValueStore, KeyValueBackend};
use capstore_core::database::value_to_json;
use capstore_core::query::{ExportFormat, ExportSpec, RequestFilter};
use capstore_core::{EngineConfig, EventBus, MigrationRegistry, StorageEngine};

/// Capstore - inspect and maintain a captured-request store
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the durable image
    #[arg(short, long, value_name = "DIR", default_value = ".capstore")]
    data_dir: PathBuf,

    /// Key-value backup file (default: <data-dir>/backup.json)
    #[arg(long, value_name = "FILE")]
    backup: Option<PathBuf>,

    /// Engine configuration in TOML
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show row counts, size and schema version
    Stats {
        /// Output in JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a read-only SQL query
    Query {
        sql: String,

        /// Output in JSON
        #[arg(long)]
        json: bool,
    },

    /// Export requests or the whole image
    Export {
        /// json, csv or sqlite
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// Only export requests for this domain
        #[arg(long)]
        domain: Option<String>,
    },

    /// Remove requests by age, count, size or domain
    Purge(PurgeArgs),

    /// Write the current image to every backend
    Checkpoint,

    /// List applied schema versions
    Versions,

    /// Delete every captured request
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct PurgeArgs {
    /// Drop requests older than this many days
    #[arg(long)]
    older_than_days: Option<u32>,

    /// Keep only the newest N requests
    #[arg(long)]
    max_rows: Option<u64>,

    /// Shrink the used image size below this many bytes
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Drop every request for this domain
    #[arg(long)]
    domain: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let backup = cli
        .backup
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("backup.json"));
    let backends = BackendSet::new()
        .with(DirectoryBackend::new(&cli.data_dir))
        .with(KeyValueBackend::new(JsonFileKeyValueStore::new(backup)));

    let events = EventBus::from(&config);
    let engine = StorageEngine::initialize(config, backends, MigrationRegistry::builtin(), events)
        .await
        .context("opening store")?;

    if engine.is_degraded() {
        eprintln!("warning: no backend is usable, changes will not be saved");
    }

    let outcome = run(&engine, cli.command).await;
    engine.close().await?;
    outcome
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(engine: &StorageEngine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Stats { json } => {
            let stats = engine.get_database_stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("REQUESTS: {}", stats.total_requests);
                println!("HEADERS:  {}", stats.total_headers);
                println!("METRICS:  {}", stats.total_metrics);
                println!("ERRORS:   {}", stats.engine_errors);
                println!(
                    "SIZE:     {} bytes ({} used)",
                    stats.size.image_bytes(),
                    stats.size.used_bytes()
                );
                println!("SCHEMA:   v{}", stats.schema_version);
                for (status, count) in &stats.by_status {
                    println!("  status {:<6} {}", status, count);
                }
            }
        }
        Commands::Query { sql, json } => {
            let rs = engine.query(sql, Vec::new()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rs.to_json())?);
            } else {
                println!("{}", rs.columns.join("\t"));
                for row in &rs.rows {
                    let cells: Vec<String> = row
                        .iter()
                        .map(|v| match value_to_json(v) {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .collect();
                    println!("{}", cells.join("\t"));
                }
            }
        }
        Commands::Export {
            format,
            out,
            domain,
        } => {
            let mut spec = ExportSpec::new(format);
            if let Some(domain) = domain {
                spec = spec.with_filter(RequestFilter::for_domain(domain));
            }
            let bytes = engine.export_database(spec).await?;
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            println!("Exported {} bytes to {}", bytes.len(), out.display());
        }
        Commands::Purge(args) => {
            let retention = engine.retention();
            let report = if let Some(days) = args.older_than_days {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
                retention.purge_old_data(cutoff.timestamp_millis()).await?
            } else if let Some(max_rows) = args.max_rows {
                retention.purge_by_count(max_rows).await?
            } else if let Some(max_bytes) = args.max_bytes {
                retention.purge_by_size(max_bytes).await?
            } else if let Some(domain) = args.domain {
                retention
                    .purge_by_custom_filter(&RequestFilter::for_domain(domain))
                    .await?
            } else {
                anyhow::bail!("no purge criterion given");
            };
            println!(
                "Purged {} of {} requests ({}){}",
                report.rows_deleted,
                report.rows_before,
                report.kind,
                if report.vacuumed { ", vacuumed" } else { "" }
            );
        }
        Commands::Checkpoint => {
            let report = engine.checkpoint().await?;
            println!("Checkpoint: {} bytes", report.bytes);
            for name in &report.persisted {
                println!("  ok     {}", name);
            }
            for (name, reason) in &report.failed {
                println!("  failed {}: {}", name, reason);
            }
            if !report.is_complete() {
                anyhow::bail!("checkpoint did not reach every backend");
            }
        }
        Commands::Versions => {
            for record in engine.version_history().await? {
                let applied = chrono::DateTime::from_timestamp_millis(record.applied_at)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| record.applied_at.to_string());
                println!(
                    "v{:<3} {:<8} {}  {}",
                    record.version, record.status, applied, record.description
                );
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear without --yes");
            }
            let deleted = engine.clear_database().await?;
            println!("Deleted {} requests", deleted);
        }
    }

    Ok(())
}
