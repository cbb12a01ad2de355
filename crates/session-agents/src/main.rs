use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipeline::artifact::ArtifactKind;
use pipeline::store::{NewSession, SessionStore, SqliteStore};
use pipeline::techniques::TechniqueLibrary;

use session_agents::config::AnalysisConfig;
use session_agents::http::{self, AppState};
use session_agents::llm::HttpChatTransport;
use session_agents::orchestrator::{Orchestrator, RunReport};
use session_agents::trigger::WaveTrigger;

#[derive(Parser)]
#[command(
    name = "session-agents",
    about = "Therapy-session analysis worker: diarized transcript in, clinical artifacts out"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP surface and the analysis worker.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8085")]
        bind: String,
    },
    /// Load a transcribed session from a JSON file into the store.
    Ingest { file: PathBuf },
    /// Run the full analysis schedule for one session, in the foreground.
    Analyze { session_id: String },
    /// Print the per-kind status report for a session.
    Status { session_id: String },
    /// Re-attempt failed kinds (all failed kinds when none are named).
    Retry {
        session_id: String,
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AnalysisConfig::default();

    let store: Arc<dyn SessionStore> = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening store at {}", config.db_path.display()))?,
    );

    let techniques = Arc::new(TechniqueLibrary::builtin());
    if let Some(path) = &config.techniques_path {
        techniques
            .reload_from_path(path)
            .with_context(|| format!("loading technique catalog from {}", path.display()))?;
    }

    let transport = Arc::new(
        HttpChatTransport::new(&config.endpoint, config.attempt_timeout)
            .map_err(|e| anyhow::anyhow!("building LLM client: {e}"))?,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        transport.clone(),
        techniques.clone(),
        config.clone(),
    ));

    match cli.command {
        Command::Serve { bind } => {
            if !transport.preflight().await {
                warn!("LLM endpoint preflight failed; analysis calls may error");
            }
            let trigger = WaveTrigger::new(
                store.clone(),
                orchestrator.clone(),
                config.patient_rate_limit,
            );
            http::serve(
                AppState {
                    trigger,
                    store,
                    techniques,
                },
                &bind,
            )
            .await
        }
        Command::Ingest { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut session: NewSession =
                serde_json::from_str(&raw).context("parsing session JSON")?;
            if session.duration_secs <= 0.0 {
                session.duration_secs = session.transcript.duration_secs();
            }
            store.insert_session(&session).await?;
            info!(session_id = %session.id, "session ingested");
            println!("{}", session.id);
            Ok(())
        }
        Command::Analyze { session_id } => {
            if !transport.preflight().await {
                warn!("LLM endpoint preflight failed; analysis calls may error");
            }
            let report = orchestrator.run(&session_id).await?;
            print_report(&report);
            Ok(())
        }
        Command::Status { session_id } => {
            let trigger = WaveTrigger::new(
                store.clone(),
                orchestrator.clone(),
                config.patient_rate_limit,
            );
            let report = trigger.status(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Retry { session_id, kinds } => {
            let kinds = parse_kind_names(&kinds)?;
            let report = orchestrator.rerun(&session_id, kinds.as_deref()).await?;
            print_report(&report);
            Ok(())
        }
    }
}

fn parse_kind_names(names: &[String]) -> Result<Option<Vec<ArtifactKind>>> {
    if names.is_empty() {
        return Ok(None);
    }
    names
        .iter()
        .map(|name| {
            ArtifactKind::parse(name).with_context(|| format!("unknown artifact kind: {name}"))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn print_report(report: &RunReport) {
    if report.skipped {
        println!(
            "{}: skipped (status {})",
            report.session_id, report.final_status
        );
        return;
    }
    println!("{}: {}", report.session_id, report.final_status);
    let mut kinds: Vec<_> = report.kinds.iter().collect();
    kinds.sort_by_key(|(kind, _)| kind.as_str());
    for (kind, outcome) in kinds {
        println!("  {kind}: {outcome:?}");
    }
}
