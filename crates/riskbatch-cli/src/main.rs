use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use riskbatch_core::{
    ActorRole, AssessmentId, BatchId, EmployeeId, ReportId, SecurityContext, TenantId,
};
use riskbatch_engine::{BatchEngine, EngineConfig};
use riskbatch_storage::LedgerStore;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "riskbatch")]
#[command(about = "Batch reconciliation and report emission", long_about = None)]
struct Cli {
    /// Ledger database file.
    #[arg(long, global = true, default_value = "riskbatch.db")]
    db: PathBuf,

    /// Overrides RISKBATCH_ARTIFACT_DIR.
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Overrides RISKBATCH_REQUIRED_ANSWERS.
    #[arg(long, global = true)]
    required_answers: Option<u32>,

    /// Queue finalized batches instead of emitting inline.
    #[arg(long, global = true)]
    skip_immediate_emission: bool,

    #[arg(long, global = true)]
    debug: bool,

    /// Act as this actor instead of the elevated `cli` job context.
    #[arg(long, global = true)]
    actor_cpf: Option<String>,

    /// Role of `--actor-cpf`, manager when omitted.
    #[arg(long, global = true, requires = "actor_cpf")]
    role: Option<ActorRole>,

    #[arg(long, global = true, requires = "actor_cpf")]
    tenant: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations and print the schema version
    Migrate,
    /// Conclude an assessment if it has enough answers
    Conclude { assessment: i64, employee: i64 },
    /// Recalculate a batch status, by batch or by one of its assessments
    Reconcile {
        #[arg(long, required_unless_present = "assessment", conflicts_with = "assessment")]
        batch: Option<i64>,
        #[arg(long)]
        assessment: Option<i64>,
    },
    /// Emit the report of a completed batch
    Emit { batch: i64 },
    /// Mark an issued report as delivered
    Deliver { report: i64 },
    /// Run one pass over the due emission queue items
    Drain {
        #[arg(long)]
        max_items: Option<u32>,
    },
    /// List queued emissions
    Queue,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let store = LedgerStore::open(&cli.db)
        .with_context(|| format!("failed to open ledger at {}", cli.db.display()))?;
    let config = engine_config(&cli)?;
    let ctx = security_context(&store, &cli)?;
    let now = Utc::now();
    info!(event = "cli_start", db = %cli.db.display(), ctx = %ctx);

    let engine = BatchEngine::new(store.clone(), config);
    let output = match cli.command {
        Commands::Migrate => json!({ "schema_version": store.schema_version()? }),
        Commands::Conclude {
            assessment,
            employee,
        } => serde_json::to_value(engine.conclude_assessment_if_complete(
            &ctx,
            AssessmentId(assessment),
            EmployeeId(employee),
            now,
        )?)?,
        Commands::Reconcile { batch, assessment } => {
            let outcome = match (batch, assessment) {
                (Some(batch), _) => engine.recalculate_batch_status(&ctx, BatchId(batch), now)?,
                (None, Some(assessment)) => engine.recalculate_batch_status_from_assessment(
                    &ctx,
                    AssessmentId(assessment),
                    now,
                )?,
                (None, None) => bail!("reconcile needs --batch or --assessment"),
            };
            serde_json::to_value(outcome)?
        }
        Commands::Emit { batch } => {
            serde_json::to_value(engine.emit_report_for_batch(&ctx, BatchId(batch), now)?)?
        }
        Commands::Deliver { report } => {
            serde_json::to_value(engine.mark_report_delivered(&ctx, ReportId(report), now)?)?
        }
        Commands::Drain { max_items } => {
            let max_items = max_items.unwrap_or(engine.config().drain_batch_size);
            serde_json::to_value(engine.drain_emission_queue(&ctx, max_items, now)?)?
        }
        Commands::Queue => {
            let items: Vec<_> = engine
                .pending_emissions(&ctx)?
                .into_iter()
                .map(|item| {
                    json!({
                        "batch_id": item.batch_id,
                        "attempt_count": item.attempt_count,
                        "last_error": item.last_error,
                        "next_eligible_at": item.next_eligible_at,
                        "updated_at": item.updated_at,
                    })
                })
                .collect();
            json!({ "items": items })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn engine_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("invalid RISKBATCH_* environment")?;
    if let Some(dir) = &cli.artifact_dir {
        config.artifact_dir = dir.clone();
    }
    if let Some(required) = cli.required_answers {
        if required == 0 {
            bail!("--required-answers must be positive");
        }
        config.required_answers = required;
    }
    if cli.skip_immediate_emission {
        config.skip_immediate_emission = true;
    }
    Ok(config)
}

fn security_context(store: &LedgerStore, cli: &Cli) -> Result<SecurityContext> {
    match &cli.actor_cpf {
        None => Ok(SecurityContext::system("cli")),
        Some(cpf) => store
            .resolve_context(
                cpf,
                cli.role.unwrap_or(ActorRole::Manager),
                cli.tenant.map(TenantId),
            )
            .with_context(|| format!("cannot act as {cpf}")),
    }
}

fn log_level(debug: bool, configured: Option<String>) -> String {
    match configured {
        Some(level) if !level.trim().is_empty() => level,
        _ if debug => "debug".to_string(),
        _ => "info".to_string(),
    }
}

fn init_logging(debug: bool) {
    let level = log_level(debug, std::env::var("RISKBATCH_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("log_init_error: subscriber already installed");
    }
}
