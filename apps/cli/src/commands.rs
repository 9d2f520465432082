//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use compliance_core::{
    BatchSummary, Collaborators, ItemOutcome, ItemStage, ItemStatus, Orchestrator,
    OrchestratorOptions, ProgressReporter, SilentProgress, read_submissions,
};
use compliance_embed::{ApiEmbedder, HashingEmbedder};
use compliance_extract::{ChatExtractor, OfflineExtractor};
use compliance_notify::{GraphNotifier, LogNotifier};
use compliance_research::{DisabledResearcher, DuckDuckGoResearcher};
use compliance_shared::{
    AppConfig, Embedder, EmbeddingProvider, Extractor, LlmProvider, Notifier, NotifyProvider,
    Researcher, SearchProvider, init_config, load_config, load_config_from,
    validate_embedding_credentials, validate_llm_credentials, validate_notify_credentials,
};
use compliance_storage::{KnowledgeBase, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

const DB_FILE_NAME: &str = "compliance.db";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Compliance Assistant: research, record, and route new compliance items.
#[derive(Parser)]
#[command(
    name = "compliance-assistant",
    version,
    about = "Research prerequisites for new compliance items, record them, and notify owners.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.compliance-assistant/compliance.toml).
    #[arg(long, global = true, env = "COMPLIANCE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process a batch of submissions.
    Run {
        /// Submissions file (.json array or .jsonl). Defaults to `defaults.submissions_file`.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Items processed at once (overrides `pipeline.concurrency`).
        #[arg(short, long)]
        concurrency: Option<u32>,

        /// Print the batch summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List master records, newest first.
    Records {
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the knowledge store.
    Search {
        query: String,

        #[arg(short, long, default_value = "5")]
        limit: u32,
    },

    /// Re-send notifications whose last attempt failed.
    Renotify,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "compliance=info",
        1 => "compliance=debug",
        _ => "compliance=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config {
        action: ConfigAction::Init,
    } = cli.command
    {
        return cmd_config_init();
    }

    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Run {
            input,
            concurrency,
            json,
        } => cmd_run(config, input, concurrency, json).await,
        Command::Records { limit, json } => cmd_records(&config, limit, json).await,
        Command::Search { query, limit } => cmd_search(&config, &query, limit).await,
        Command::Renotify => cmd_renotify(&config).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn db_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(config.defaults.resolved_data_dir()?.join(DB_FILE_NAME))
}

fn build_researcher(config: &AppConfig) -> Result<Arc<dyn Researcher>> {
    Ok(match config.search.provider {
        SearchProvider::DuckDuckGo => Arc::new(DuckDuckGoResearcher::new(config.search.clone())?),
        SearchProvider::Disabled => Arc::new(DisabledResearcher),
    })
}

fn build_extractor(config: &AppConfig) -> Result<Arc<dyn Extractor>> {
    Ok(match config.llm.provider {
        LlmProvider::OpenAi => Arc::new(ChatExtractor::from_env(config.llm.clone())?),
        LlmProvider::Offline => Arc::new(OfflineExtractor),
    })
}

fn build_embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    Ok(match config.embedding.provider {
        EmbeddingProvider::OpenAi => Arc::new(ApiEmbedder::from_env(config.embedding.clone())?),
        EmbeddingProvider::Onnx => onnx_embedder(config)?,
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new()),
    })
}

#[cfg(feature = "onnx")]
fn onnx_embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    let dir = config.embedding.resolved_model_dir()?;
    Ok(Arc::new(compliance_embed::OnnxEmbedder::load(&dir)?))
}

#[cfg(not(feature = "onnx"))]
fn onnx_embedder(_config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    Err(eyre!(
        "embedding.provider = \"onnx\" requires a build with `--features onnx`"
    ))
}

fn build_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>> {
    Ok(match config.notify.provider {
        NotifyProvider::Graph => Arc::new(GraphNotifier::from_env(config.notify.clone())?),
        NotifyProvider::Log => Arc::new(LogNotifier),
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    mut config: AppConfig,
    input: Option<PathBuf>,
    concurrency: Option<u32>,
    json: bool,
) -> Result<()> {
    validate_llm_credentials(&config)?;
    validate_embedding_credentials(&config)?;
    validate_notify_credentials(&config)?;

    if let Some(n) = concurrency {
        if n == 0 {
            return Err(eyre!("--concurrency must be at least 1"));
        }
        config.pipeline.concurrency = n;
    }

    let input = input.unwrap_or_else(|| PathBuf::from(&config.defaults.submissions_file));
    let submissions = read_submissions(&input)?;
    if submissions.is_empty() {
        println!("No submissions in {}", input.display());
        return Ok(());
    }

    let storage = Arc::new(Storage::open(&db_path(&config)?).await?);
    let knowledge = KnowledgeBase::new(storage.clone(), build_embedder(&config)?);
    let collaborators = Collaborators {
        researcher: build_researcher(&config)?,
        extractor: build_extractor(&config)?,
        knowledge: Arc::new(knowledge),
        records: storage.clone(),
        notifier: build_notifier(&config)?,
        notification_log: storage,
    };
    let orchestrator = Orchestrator::new(collaborators, OrchestratorOptions::from_config(&config)?);

    info!(
        input = %input.display(),
        items = submissions.len(),
        concurrency = config.pipeline.concurrency,
        "processing submissions"
    );

    let progress: Arc<dyn ProgressReporter> = if json {
        Arc::new(SilentProgress)
    } else {
        Arc::new(CliProgress::new())
    };
    let summary = orchestrator.process_batch(submissions, progress).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    println!();
    for outcome in &summary.outcomes {
        println!("  {}", outcome_line(outcome));
    }
    println!();
    println!("  Received:          {}", summary.received);
    println!(
        "  Processed:         {} ({} without prerequisites)",
        summary.processed, summary.processed_no_prerequisites
    );
    println!("  Skipped duplicate: {}", summary.skipped_duplicate);
    println!("  Failed:            {}", summary.failed);
    if summary.notify_failed > 0 {
        println!(
            "  Notify failed:     {} (run `compliance-assistant renotify` to retry)",
            summary.notify_failed
        );
    }
    println!();
}

fn outcome_line(outcome: &ItemOutcome) -> String {
    let label = match outcome.status {
        ItemStatus::Processed => "processed",
        ItemStatus::ProcessedNoPrerequisites => "processed (no prerequisites)",
        ItemStatus::SkippedDuplicate => "skipped duplicate",
        ItemStatus::Failed => "FAILED",
    };
    let mut line = format!("[{}] {}: {label}", outcome.index + 1, outcome.title);
    if outcome.prerequisites > 0 {
        line.push_str(&format!(", {} prerequisites", outcome.prerequisites));
    }
    if outcome.notified == Some(false) {
        line.push_str(", notification failed");
    }
    if let Some(error) = &outcome.error {
        line.push_str(&format!(" ({error})"));
    }
    line
}

async fn open_readonly(config: &AppConfig) -> Result<Storage> {
    let path = db_path(config)?;
    Ok(Storage::open_readonly(&path).await?)
}

async fn cmd_records(config: &AppConfig, limit: u32, json: bool) -> Result<()> {
    let storage = open_readonly(config).await?;
    let records = storage.list_records(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No records yet.");
        return Ok(());
    }

    for record in &records {
        println!(
            "{}  {:<28} {:<24} {:<10} {}",
            record.recorded_at.format("%Y-%m-%d %H:%M"),
            record.status.as_str(),
            record.responsible_email,
            record.due_date,
            record.title
        );
        if let Some(failure) = &record.failure {
            println!("    reason: {failure}");
        }
    }
    Ok(())
}

async fn cmd_search(config: &AppConfig, query: &str, limit: u32) -> Result<()> {
    let storage = Arc::new(open_readonly(config).await?);
    let hits = match build_embedder(config) {
        Ok(embedder) => KnowledgeBase::new(storage, embedder).search(query, limit).await?,
        Err(e) => {
            warn!(error = %e, "embedder unavailable, using keyword search");
            storage.search_keywords(query, limit).await?
        }
    };

    if hits.is_empty() {
        println!("No matches for '{query}'.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. {} (due {}, {}) [{} {:.3}]",
            i + 1,
            hit.title,
            hit.due_date,
            hit.responsible_email,
            hit.kind,
            hit.score
        );
        if let Some(source) = &hit.source {
            println!("   {source}");
        }
        println!("   {}", hit.excerpt.replace('\n', " "));
    }
    Ok(())
}

async fn cmd_renotify(config: &AppConfig) -> Result<()> {
    validate_notify_credentials(config)?;

    let storage = Arc::new(Storage::open(&db_path(config)?).await?);
    // Only the notifier and the log are used when re-sending.
    let collaborators = Collaborators {
        researcher: Arc::new(DisabledResearcher),
        extractor: Arc::new(OfflineExtractor),
        knowledge: Arc::new(KnowledgeBase::new(
            storage.clone(),
            Arc::new(HashingEmbedder::new()),
        )),
        records: storage.clone(),
        notifier: build_notifier(config)?,
        notification_log: storage,
    };
    let orchestrator = Orchestrator::new(collaborators, OrchestratorOptions::from_config(config)?);

    let summary = orchestrator.renotify().await?;
    if summary.attempted == 0 {
        println!("Nothing to re-send.");
    } else {
        println!(
            "Re-sent {} notification(s): {} delivered, {} failed.",
            summary.attempted, summary.delivered, summary.failed
        );
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn batch_started(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn stage(&self, index: usize, title: &str, stage: ItemStage) {
        self.bar
            .set_message(format!("#{} {title}: {stage}", index + 1));
    }

    fn item_finished(&self, outcome: &ItemOutcome) {
        self.bar.inc(1);
        if outcome.status == ItemStatus::Failed {
            self.bar.println(format!("  ✗ {}", outcome_line(outcome)));
        }
    }

    fn done(&self, _summary: &BatchSummary) {
        self.bar.finish_and_clear();
    }
}
