use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use episode_kernel_api::{EpisodeKernel, EpisodeOutcome, IngestError};
use episode_kernel_core::{EpisodeKind, KernelConfig, NewEpisode};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ek")]
#[command(about = "Episode Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./episode_kernel.sqlite3")]
    db: PathBuf,

    /// YAML file with kernel settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConfigOverrides {
    #[arg(long, global = true)]
    max_concurrent_episodes: Option<usize>,
    #[arg(long, global = true)]
    episode_batch_size: Option<usize>,
    #[arg(long, global = true)]
    max_retries: Option<u32>,
    #[arg(long, global = true)]
    transaction_timeout_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Episode {
        #[command(subcommand)]
        command: EpisodeCommand,
    },
    Search(SearchArgs),
    Fact {
        #[command(subcommand)]
        command: FactCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Setup,
    IntegrityCheck,
    Clear,
}

#[derive(Debug, Subcommand)]
enum EpisodeCommand {
    Add(EpisodeAddArgs),
    Bulk(EpisodeBulkArgs),
    Recent(EpisodeRecentArgs),
}

#[derive(Debug, Args)]
struct EpisodeAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, conflicts_with = "body_file")]
    body: Option<String>,
    #[arg(long)]
    body_file: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = KindArg::Text)]
    kind: KindArg,
    #[arg(long, default_value = "")]
    source_description: String,
    #[arg(long)]
    reference_time: Option<String>,
}

#[derive(Debug, Args)]
struct EpisodeBulkArgs {
    /// JSON array of episodes.
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct EpisodeRecentArgs {
    #[arg(long)]
    reference_time: Option<String>,
    #[arg(long, default_value_t = 10)]
    last_n: usize,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    text: String,
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long, default_value_t = 10)]
    limit: usize,
    /// List matching subjects with open facts instead of facts.
    #[arg(long, conflicts_with = "as_of")]
    subjects: bool,
}

#[derive(Debug, Subcommand)]
enum FactCommand {
    History(FactHistoryArgs),
}

#[derive(Debug, Args)]
struct FactHistoryArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    predicate: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Text,
    Json,
    Message,
}

impl KindArg {
    fn into_kind(self) -> EpisodeKind {
        match self {
            Self::Text => EpisodeKind::Text,
            Self::Json => EpisodeKind::Json,
            Self::Message => EpisodeKind::Message,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<KernelConfig> {
    let mut config = match path {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_yaml::from_str::<KernelConfig>(&body)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => KernelConfig::default(),
    };

    if let Some(value) = overrides.max_concurrent_episodes {
        config.max_concurrent_episodes = value;
    }
    if let Some(value) = overrides.episode_batch_size {
        config.episode_batch_size = value;
    }
    if let Some(value) = overrides.max_retries {
        config.max_retries = value;
    }
    if let Some(value) = overrides.transaction_timeout_ms {
        config.transaction_timeout_ms = value;
    }
    config.validate().map_err(|err| anyhow!("invalid kernel config: {err}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.overrides)?;
    let kernel = EpisodeKernel::open(&cli.db, config)?;

    let setup = kernel.build_indices_and_constraints().await?;
    let result = match cli.command {
        Command::Db { command } => match command {
            DbCommand::Setup => emit_json(serde_json::to_value(setup)?),
            DbCommand::IntegrityCheck => run_db_integrity_check(&kernel).await,
            DbCommand::Clear => emit_json(serde_json::to_value(kernel.clear_data().await?)?),
        },
        Command::Episode { command } => match command {
            EpisodeCommand::Add(args) => run_episode_add(&kernel, args).await,
            EpisodeCommand::Bulk(args) => run_episode_bulk(&kernel, &args).await,
            EpisodeCommand::Recent(args) => run_episode_recent(&kernel, &args).await,
        },
        Command::Search(args) => run_search(&kernel, &args).await,
        Command::Fact { command } => match command {
            FactCommand::History(args) => run_fact_history(&kernel, &args).await,
        },
    };
    let closed = kernel.close().await;
    result?;
    closed?;
    Ok(())
}

async fn run_db_integrity_check(kernel: &EpisodeKernel) -> Result<()> {
    let report = kernel.integrity_check().await?;
    let healthy = report.quick_check_ok
        && report.foreign_key_violations.is_empty()
        && report.open_key_violations.is_empty();
    let mut value = serde_json::to_value(report)?;
    if let Value::Object(object) = &mut value {
        object.insert("healthy".to_string(), Value::Bool(healthy));
    }
    emit_json(value)
}

async fn run_episode_add(kernel: &EpisodeKernel, args: EpisodeAddArgs) -> Result<()> {
    let body = match (args.body, args.body_file) {
        (Some(body), None) => body,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read episode body {}", path.display()))?,
        _ => return Err(anyhow!("exactly one of --body or --body-file is required")),
    };
    let submission = NewEpisode::new(
        args.name,
        body,
        args.kind.into_kind(),
        args.source_description,
        parse_optional_rfc3339(args.reference_time.as_deref())?,
    );
    let outcome = kernel.add_episode(submission).await?;
    emit_json(serde_json::to_value(outcome)?)
}

fn bulk_entry(result: Result<EpisodeOutcome, IngestError>) -> Result<Value> {
    Ok(match result {
        Ok(outcome) => json!({ "ok": true, "outcome": serde_json::to_value(outcome)? }),
        Err(err) => json!({ "ok": false, "error": serde_json::to_value(err.to_body())? }),
    })
}

async fn run_episode_bulk(kernel: &EpisodeKernel, args: &EpisodeBulkArgs) -> Result<()> {
    let body = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read bulk input {}", args.input.display()))?;
    let submissions: Vec<NewEpisode> = serde_json::from_str(&body)
        .with_context(|| format!("bulk input MUST be a JSON array of episodes: {}", args.input.display()))?;

    let results = kernel.add_episode_bulk(submissions).await;
    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    let failed = results.len() - succeeded;
    let entries = results.into_iter().map(bulk_entry).collect::<Result<Vec<_>>>()?;
    emit_json(json!({
        "succeeded": succeeded,
        "failed": failed,
        "results": entries,
    }))
}

async fn run_episode_recent(kernel: &EpisodeKernel, args: &EpisodeRecentArgs) -> Result<()> {
    let reference_time = parse_optional_rfc3339(args.reference_time.as_deref())?;
    let episodes = kernel.retrieve_episodes(reference_time, args.last_n).await?;
    emit_json(json!({
        "reference_time": format_rfc3339(reference_time)?,
        "episodes": serde_json::to_value(episodes)?,
    }))
}

async fn run_search(kernel: &EpisodeKernel, args: &SearchArgs) -> Result<()> {
    if args.subjects {
        let subjects = kernel.search_subjects(&args.text, args.limit).await?;
        return emit_json(json!({
            "query": args.text,
            "subjects": serde_json::to_value(subjects)?,
        }));
    }
    let as_of = parse_optional_rfc3339(args.as_of.as_deref())?;
    let results = kernel.search_as_of(&args.text, as_of, args.limit).await?;
    emit_json(json!({
        "query": args.text,
        "as_of": format_rfc3339(as_of)?,
        "results": serde_json::to_value(results)?,
    }))
}

async fn run_fact_history(kernel: &EpisodeKernel, args: &FactHistoryArgs) -> Result<()> {
    let records = kernel.fact_history(&args.subject, &args.predicate).await?;
    emit_json(json!({
        "subject": args.subject,
        "predicate": args.predicate,
        "records": serde_json::to_value(records)?,
    }))
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp")
}
