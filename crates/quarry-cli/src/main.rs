mod config;

use clap::{Parser, Subcommand};
use config::QuarryConfig;
use quarry_agent::{build_backend, ReactAgent, ToolRegistry};
use quarry_core::{
    Event, EventBus, EventPayload, EventSubscriber, Mode, SessionId, SessionStatus,
};
use quarry_orchestrator::{ResearchOptions, ResearchOrchestrator};
use quarry_session::{
    FileSessionStore, MarkdownReportWriter, ReportWriter, SessionFilters, SessionRepository,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarry", about = "Quarry: multi-agent research engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "quarry.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Research a question and print the report
    Research {
        /// The research question
        query: String,
        /// fast or deep
        #[arg(short, long, default_value = "deep")]
        mode: Mode,
        /// Concurrent workers (0 uses the config value)
        #[arg(long, default_value_t = 0)]
        max_workers: usize,
        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List stored sessions, newest first
    List {
        #[arg(long)]
        status: Option<SessionStatus>,
        #[arg(long)]
        mode: Option<Mode>,
        /// Substring of the query
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print a stored session's report, or `latest`
    Show { id: String },
    /// Delete a stored session
    Delete { id: SessionId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }

    let mut config = QuarryConfig::load(&cli.config).await?;
    config.apply_env(|key| std::env::var(key).ok());

    let store = Arc::new(FileSessionStore::new(config.sessions_dir()).await?);

    match cli.command {
        Commands::Research {
            query,
            mode,
            max_workers,
            timeout,
        } => {
            let mut options = ResearchOptions::new(mode).with_max_workers(max_workers);
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            research(&config, store, &query, options).await?;
        }
        Commands::Sessions { action } => sessions(store, action).await?,
    }

    Ok(())
}

async fn research(
    config: &QuarryConfig,
    store: Arc<FileSessionStore>,
    query: &str,
    options: ResearchOptions,
) -> anyhow::Result<()> {
    if config.model.api_key.is_empty() {
        warn!("No model API key configured; set OPENROUTER_API_KEY or [model].api_key");
    }

    let llm = build_backend(&config.model)?;
    let tools = Arc::new(ToolRegistry::with_defaults(&config.tools)?);
    info!(tools = tools.tool_count(), model = %config.model.model_id, "Research tools ready");

    let events = Arc::new(EventBus::new(config.research.event_buffer));
    let agent = Arc::new(ReactAgent::new(
        llm.clone(),
        tools,
        events.clone(),
        config.agent.clone(),
    )?);
    let orchestrator = Arc::new(ResearchOrchestrator::new(
        llm,
        agent,
        store,
        events.clone(),
        config.research.clone(),
    )?);

    let mut subscription = events.subscribe(&[]);
    let progress = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if let Some(line) = describe(&event) {
                eprintln!("{line}");
            }
        }
    });

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                for id in orchestrator.active_sessions() {
                    let _ = orchestrator.cancel(&id);
                }
            }
        })
    };

    let outcome = orchestrator.research(query, options).await;
    interrupt.abort();
    events.close();
    let _ = progress.await;

    let result = outcome?;
    let writer = MarkdownReportWriter::new(config.reports_dir());
    match writer.write_session(&result.session).await {
        Ok(()) => info!(path = %writer.path_for(&result.session).display(), "Report saved"),
        Err(e) => warn!(error = %e, "Report could not be saved"),
    }

    println!("{}", result.report.full_content);
    let total = result.session.total_cost();
    eprintln!(
        "\nsession {}  tokens {}  cost {}",
        result.session.id, total.total_tokens, total.total_cost
    );
    Ok(())
}

async fn sessions(store: Arc<FileSessionStore>, action: SessionAction) -> anyhow::Result<()> {
    match action {
        SessionAction::List {
            status,
            mode,
            query,
            limit,
        } => {
            let filters = SessionFilters {
                status,
                mode,
                query,
                limit: Some(limit),
                ..SessionFilters::default()
            };
            let summaries = store.list(&filters).await?;
            if summaries.is_empty() {
                println!("No sessions stored.");
                return Ok(());
            }
            for s in &summaries {
                println!(
                    "{}  {:<9}  {:<4}  {:>3} workers  {:>10}  {}",
                    s.id,
                    s.status.to_string(),
                    s.mode.to_string(),
                    s.worker_count,
                    s.total_cost.to_string(),
                    s.query
                );
            }
        }
        SessionAction::Show { id } => {
            let session = if id == "latest" {
                store
                    .load_latest()
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("No sessions stored"))?
            } else {
                store.load(&id.parse()?).await?
            };
            match &session.report {
                Some(report) => println!("{}", report.full_content),
                None => {
                    println!("{} ({})", session.query, session.status);
                    if let Some(error) = &session.error {
                        println!("error: {error}");
                    }
                    for w in &session.workers {
                        println!("  {}. {} [{}]", w.sequence, w.objective, w.status);
                    }
                }
            }
        }
        SessionAction::Delete { id } => {
            store.delete(&id).await?;
            println!("Deleted {id}");
        }
    }
    Ok(())
}

/// One progress line per interesting event.
fn describe(event: &Event) -> Option<String> {
    let line = match &event.payload {
        EventPayload::ResearchStarted { query, mode } => format!("researching ({mode}): {query}"),
        EventPayload::PlanCreated {
            perspectives,
            complexity,
            ..
        } => {
            let names: Vec<&str> = perspectives.iter().map(|p| p.name.as_str()).collect();
            format!("plan: {} (complexity {complexity:.2})", names.join(", "))
        }
        EventPayload::WorkerStarted(w) => format!("  worker {} started: {}", w.sequence, w.objective),
        EventPayload::WorkerComplete(w) => format!("  worker {} complete", w.sequence),
        EventPayload::WorkerFailed(w) | EventPayload::WorkerSkipped(w) => format!(
            "  worker {} {}: {}",
            w.sequence,
            w.status,
            w.message.as_deref().unwrap_or("")
        ),
        EventPayload::AgentToolCall { tool, arguments, .. } => format!("    {tool} {arguments}"),
        EventPayload::AnalysisComplete { round, gaps, .. } => {
            format!("gap analysis round {round}: {gaps} new gaps")
        }
        EventPayload::SynthesisStarted { completed_workers } => {
            format!("synthesizing from {completed_workers} workers")
        }
        EventPayload::ResearchFailed { error } => format!("failed: {error}"),
        EventPayload::ResearchCancelled { reason } => format!("cancelled: {reason}"),
        _ => return None,
    };
    Some(line)
}
