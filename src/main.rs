//! Skypevault CLI - command-line interface for the Skype export ETL engine

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;

use skypevault::pipeline::EtlPipeline;
use skypevault::{DatabaseConfig, PipelineConfig, RunSummary};

#[derive(Parser, Debug)]
#[command(name = "skypevault", version, about = "Ingest Skype exports into PostgreSQL")]
struct Args {
    /// Path to the Skype export file (.tar or .json)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// User display name for the export
    #[arg(short, long)]
    user: Option<String>,

    /// Output directory for intermediate files and checkpoints
    #[arg(short, long)]
    output: Option<String>,

    /// Database name (overrides environment)
    #[arg(long)]
    db_name: Option<String>,

    /// Database user (overrides environment)
    #[arg(long)]
    db_user: Option<String>,

    /// Database password (overrides environment)
    #[arg(long)]
    db_password: Option<String>,

    /// Database host (overrides environment)
    #[arg(long)]
    db_host: Option<String>,

    /// Database port (overrides environment)
    #[arg(long)]
    db_port: Option<u16>,

    /// Memory limit in MB (advisory; streaming mode enforces budgets)
    #[arg(short, long, default_value_t = 1024)]
    memory: u64,

    /// Enable parallel conversation processing
    #[arg(short, long)]
    parallel: bool,

    /// Conversations per parallel work unit
    #[arg(short = 's', long, default_value_t = 1000)]
    chunk_size: usize,

    /// Rows per database round-trip
    #[arg(short, long, default_value_t = 100)]
    batch_size: usize,

    /// Maximum worker count for parallel processing
    #[arg(short, long)]
    workers: Option<usize>,

    /// Use the streaming (bounded-memory) pipeline
    #[arg(long)]
    streaming: bool,

    /// Messages between checkpoints in streaming mode
    #[arg(long, default_value_t = 10_000)]
    checkpoint_interval: u64,

    /// Resume from the latest checkpoint in the output directory
    #[arg(short, long)]
    resume: bool,

    /// Resume from a specific checkpoint file
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// List available checkpoints and exit
    #[arg(long)]
    list_checkpoints: bool,

    /// Validate input and configuration without running the pipeline
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    let _ = dotenv::dotenv();
    init_tracing();

    let args = Args::parse();

    let db_config = resolve_db_config(&args)?;
    let config = resolve_pipeline_config(&args);

    if args.list_checkpoints {
        list_checkpoints(&config);
        return Ok(());
    }

    let file = args
        .file
        .clone()
        .context("--file is required unless listing checkpoints")?;
    validate_input_file(&file)?;

    if args.dry_run {
        tracing::info!(file = %file.display(), "Dry run: input and configuration look valid");
        tracing::info!(?config, host = %db_config.host, dbname = %db_config.dbname, "Resolved configuration");
        return Ok(());
    }

    let mut pipeline = build_pipeline(&args, db_config, config)?;

    // Ctrl-C requests cancellation; the run checkpoints and stops
    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; cancelling run");
            cancel.cancel();
        }
    });

    let user = args.user.as_deref();
    let result = if args.streaming {
        pipeline.run_streaming(&file, user).await
    } else {
        pipeline.run(&file, user).await
    };

    match result {
        Ok(summary) => {
            report_summary(&summary);
            save_summary(&summary, pipeline.context().config.output_dir.as_deref());
            Ok(())
        }
        Err(e) => {
            let summary = pipeline.summary(false);
            report_summary(&summary);
            save_summary(&summary, pipeline.context().config.output_dir.as_deref());
            Err(e).context("pipeline failed; a checkpoint was written if an output directory is set")
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

fn resolve_db_config(args: &Args) -> anyhow::Result<DatabaseConfig> {
    let mut config = DatabaseConfig::from_env()?;
    if let Some(name) = &args.db_name {
        config.dbname = name.clone();
    }
    if let Some(user) = &args.db_user {
        config.user = user.clone();
    }
    if let Some(password) = &args.db_password {
        config.password = password.clone();
    }
    if let Some(host) = &args.db_host {
        config.host = host.clone();
    }
    if let Some(port) = args.db_port {
        config.port = port;
    }
    Ok(config)
}

fn resolve_pipeline_config(args: &Args) -> PipelineConfig {
    let mut config = PipelineConfig {
        output_dir: args.output.clone(),
        memory_limit_mb: args.memory,
        chunk_size: args.chunk_size,
        batch_size: args.batch_size,
        max_workers: args.workers,
        parallel_processing: args.parallel,
        checkpoint_interval: args.checkpoint_interval,
        ..Default::default()
    }
    .with_env_output_dir();

    if config.output_dir.is_none() {
        config.output_dir = Some("output".to_string());
    }
    config
}

fn build_pipeline(
    args: &Args,
    db_config: DatabaseConfig,
    config: PipelineConfig,
) -> anyhow::Result<EtlPipeline> {
    if let Some(checkpoint) = &args.checkpoint {
        tracing::info!(checkpoint = %checkpoint.display(), "Resuming from checkpoint");
        return Ok(EtlPipeline::load_from_checkpoint(checkpoint, Some(db_config))?);
    }

    if args.resume {
        let probe = EtlPipeline::new(db_config.clone(), config.clone(), None);
        match probe.available_checkpoints().into_iter().next() {
            Some(latest) => {
                tracing::info!(checkpoint = %latest.display(), "Resuming from latest checkpoint");
                return Ok(EtlPipeline::load_from_checkpoint(&latest, Some(db_config))?);
            }
            None => {
                tracing::warn!("No checkpoint found to resume from; starting from extract");
            }
        }
    }

    Ok(EtlPipeline::new(db_config, config, None))
}

fn list_checkpoints(config: &PipelineConfig) {
    let pipeline = EtlPipeline::new(DatabaseConfig::default(), config.clone(), None);
    let checkpoints = pipeline.available_checkpoints();
    if checkpoints.is_empty() {
        println!("No checkpoints available");
        return;
    }
    println!("Available checkpoints ({}):", checkpoints.len());
    for (i, path) in checkpoints.iter().enumerate() {
        println!("{}. {}", i + 1, path.display());
    }
}

fn validate_input_file(path: &Path) -> anyhow::Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("input file not found: {}", path.display()))?;

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if extension != "tar" && extension != "json" {
        tracing::warn!(
            extension = %extension,
            "Unexpected file extension; expected .tar or .json"
        );
    }

    tracing::info!(
        path = %path.display(),
        size_mb = format!("{:.2}", metadata.len() as f64 / (1024.0 * 1024.0)),
        "Input file validated"
    );
    Ok(())
}

fn report_summary(summary: &RunSummary) {
    if summary.success {
        tracing::info!(
            task_id = %summary.task_id,
            export_id = ?summary.export_id,
            duration_seconds = summary.total_duration_seconds,
            conversations = summary.conversation_count,
            messages = summary.message_count,
            errors = summary.error_count,
            "Run complete"
        );
    } else {
        tracing::error!(
            task_id = %summary.task_id,
            errors = summary.error_count,
            "Run failed"
        );
    }
    for (phase, stats) in &summary.phases {
        tracing::info!(
            phase = %phase,
            duration_seconds = stats.duration_seconds,
            conversations = stats.processed_conversations,
            messages = stats.processed_messages,
            rate = format!("{:.2}", stats.messages_per_second),
            "Phase stats"
        );
    }
}

fn save_summary(summary: &RunSummary, output_dir: Option<&str>) {
    let Some(dir) = output_dir else { return };
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    let path = Path::new(dir).join(format!(
        "etl_result_{}_{}.json",
        summary.task_id,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    match serde_json::to_vec_pretty(summary) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(&path, bytes) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to save run summary");
            } else {
                tracing::info!(path = %path.display(), "Run summary saved");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialize run summary"),
    }
}
