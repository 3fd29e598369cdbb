//! smc-client - Schema-matching curator command line client
//!
//! Drives one session on a matching server: start matching / rematch /
//! matcher compilation jobs and follow their progress, ask the agent, and
//! print matcher evaluations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use smc_client::api::{AgentQuery, MatchingUpload, NewMatcherRequest, UploadFile};
use smc_client::services::{JobCallback, MatchingHooks, TurnState};
use smc_client::SmcClient;
use smc_common::config::{resolve_config, ConfigOverrides};
use smc_common::events::SmcEvent;
use smc_common::JobKind;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for smc-client
#[derive(Parser, Debug)]
#[command(name = "smc-client")]
#[command(about = "Schema-matching curator client")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Matching server base URL (env: SMC_SERVER_URL)
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Session name (env: SMC_SESSION)
    #[arg(long, global = true)]
    session: Option<String>,

    /// Status poll interval in milliseconds (env: SMC_POLL_INTERVAL_MS)
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    /// Per-request timeout in seconds (env: SMC_REQUEST_TIMEOUT_SECS)
    #[arg(long, global = true)]
    request_timeout_secs: Option<u64>,

    /// TOML config file (default: <config dir>/smc/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload datasets and run matching
    Match {
        /// Source CSV
        #[arg(long)]
        source: PathBuf,

        /// Target CSV (server default target when omitted)
        #[arg(long)]
        target: Option<PathBuf>,

        /// Extra matching parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,

        /// Also follow ontology inference jobs
        #[arg(long)]
        ontology: bool,
    },

    /// Re-run matching for a subset of target nodes
    Rematch {
        /// Target node names
        #[arg(required = true)]
        nodes: Vec<String>,
    },

    /// Compile a custom matcher
    Compile {
        /// Matcher name
        #[arg(long)]
        name: String,

        /// File containing the matcher code
        #[arg(long)]
        code: PathBuf,

        /// Matcher parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Ask the agent a question
    Chat {
        query: String,

        /// Focus on a source column (requires --target-column)
        #[arg(long, requires = "target_column")]
        source_column: Option<String>,

        #[arg(long, requires = "source_column")]
        target_column: Option<String>,
    },

    /// Evaluate matchers against the accepted candidates
    Evaluate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        server_url: cli.global.server_url.clone(),
        session_name: cli.global.session.clone(),
        poll_interval_ms: cli.global.poll_interval_ms,
        request_timeout_secs: cli.global.request_timeout_secs,
        config_path: cli.global.config.clone(),
    };
    let config = resolve_config(&overrides).context("Failed to resolve configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("smc_client={0},smc_common={0}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("smc-client {}", env!("CARGO_PKG_VERSION"));

    let client = SmcClient::connect(config).context("Failed to initialize client")?;

    match cli.command {
        Command::Match {
            source,
            target,
            params,
            ontology,
        } => run_match(&client, &source, target.as_deref(), &params, ontology).await,
        Command::Rematch { nodes } => run_rematch(&client, &nodes).await,
        Command::Compile { name, code, params } => run_compile(&client, name, &code, &params).await,
        Command::Chat {
            query,
            source_column,
            target_column,
        } => {
            let mut query = AgentQuery::new(query);
            if let (Some(source), Some(target)) = (source_column, target_column) {
                query = query.with_focus(source, target);
            }
            run_chat(&client, query).await
        }
        Command::Evaluate => run_evaluate(&client).await,
    }
}

// ============================================================================
// Subcommands
// ============================================================================

async fn run_match(
    client: &SmcClient,
    source: &Path,
    target: Option<&Path>,
    params: &str,
    ontology: bool,
) -> Result<()> {
    let mut upload = MatchingUpload::new(
        read_upload(source).await?,
        match target {
            Some(path) => Some(read_upload(path).await?),
            None => None,
        },
    );
    upload.params = serde_json::from_str(params).context("--params is not valid JSON")?;

    let events = client.events.subscribe();
    let hooks = MatchingHooks {
        on_complete: None,
        on_source_ontology: ontology.then(noop_callback),
        on_target_ontology: ontology.then(noop_callback),
    };
    let started = client
        .coordinator
        .start_matching(upload, hooks)
        .await
        .context("Failed to start matching")?;
    println!("Matching started: {}", started.task_id);

    let mut kinds = vec![JobKind::Matching];
    if started.source_ontology_task_id.is_some() {
        kinds.push(JobKind::SourceOntology);
    }
    if started.target_ontology_task_id.is_some() {
        kinds.push(JobKind::TargetOntology);
    }

    follow_jobs(events, kinds).await?;
    println!("Candidates: {}", client.state.aggregated_candidates().await.len());
    Ok(())
}

async fn run_rematch(client: &SmcClient, nodes: &[String]) -> Result<()> {
    let events = client.events.subscribe();
    let task_id = client
        .coordinator
        .start_rematch(nodes, None)
        .await
        .context("Failed to start rematch")?;
    println!("Rematch started: {}", task_id);
    follow_jobs(events, vec![JobKind::Rematch]).await
}

async fn run_compile(client: &SmcClient, name: String, code: &Path, params: &str) -> Result<()> {
    let code = tokio::fs::read_to_string(code)
        .await
        .with_context(|| format!("Failed to read {}", code.display()))?;
    let params = serde_json::from_str(params).context("--params is not valid JSON")?;

    let events = client.events.subscribe();
    let task_id = client
        .coordinator
        .start_matcher_compile(NewMatcherRequest { name, code, params }, None)
        .await
        .context("Failed to start matcher compilation")?;
    println!("Compilation started: {}", task_id);

    follow_jobs(events, vec![JobKind::MatcherCompile]).await?;
    for matcher in client.state.matchers().await {
        println!("  {} (weight {})", matcher.name, matcher.weight);
    }
    Ok(())
}

async fn run_chat(client: &SmcClient, query: AgentQuery) -> Result<()> {
    let mut events = client.events.subscribe();
    // Subscribed before the agent can start anything, so no terminal event is missed
    let job_events = client.events.subscribe();
    let handle = client.agent.ask(query).await.context("Failed to open agent stream")?;
    let stream_id = handle.stream_id().to_string();

    let printer = tokio::spawn(async move {
        let mut current_node = String::new();
        loop {
            match events.recv().await {
                Ok(SmcEvent::AgentDelta { stream_id: id, node, text }) if id == stream_id => {
                    if node != current_node {
                        println!();
                        println!("[{}]", node);
                        current_node = node;
                    }
                    print!("{}", text);
                }
                Ok(SmcEvent::AgentTool { stream_id: id, payload }) if id == stream_id => {
                    println!();
                    println!("[tool] {}", payload);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = handle.wait().await;
    printer.abort();
    println!();

    // Jobs started by the agent are followed to completion
    let jobs: Vec<JobKind> = client.coordinator.active_jobs().await;
    if !jobs.is_empty() {
        follow_jobs(job_events, jobs).await?;
    }

    match outcome {
        TurnState::Completed => Ok(()),
        other => {
            let transcript = client.agent.transcript().await;
            let reason = transcript
                .last()
                .and_then(|turn| turn.error.clone())
                .unwrap_or_else(|| format!("{:?}", other));
            bail!("Agent stream ended: {}", reason)
        }
    }
}

async fn run_evaluate(client: &SmcClient) -> Result<()> {
    client.coordinator.refresh_candidates_and_history().await;
    client
        .coordinator
        .refresh_matchers()
        .await
        .context("Failed to fetch matchers")?;

    client
        .evaluation
        .evaluate()
        .await
        .context("Evaluation failed")?;

    let ground_truth = client.state.ground_truth().await;
    println!(
        "Ground truth: {} pairs over {} source columns",
        ground_truth.len(),
        ground_truth.source_column_count()
    );
    println!("{:<24} {:>6} {:>6} {:>6} {:>8} {:>8}", "matcher", "mrr", "recall", "f1", "missed", "extra");
    for analysis in client.state.analyses().await {
        println!(
            "{:<24} {:>6.3} {:>6.3} {:>6.3} {:>8} {:>8}",
            analysis.name,
            analysis.mrr,
            analysis.recall_gt,
            analysis.f1_score,
            analysis.false_positives.len(),
            analysis.false_negatives.len()
        );
        if let Some(breakdown) = &analysis.explanation_breakdown {
            println!(
                "{:<24} covered {:.2} exact {:.2} explained {} missing {}",
                "",
                breakdown.covered_ground_truth_score,
                breakdown.exact_match_score,
                breakdown.explained_ground_truth_count,
                breakdown.missing_explanation_count
            );
        }
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn noop_callback() -> JobCallback {
    Box::new(|_| {})
}

async fn read_upload(path: &Path) -> Result<UploadFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.csv".to_string());
    Ok(UploadFile::new(file_name, bytes))
}

/// Print progress until every listed job kind reached a terminal event
async fn follow_jobs(mut events: broadcast::Receiver<SmcEvent>, kinds: Vec<JobKind>) -> Result<()> {
    let mut pending: BTreeSet<JobKind> = kinds.into_iter().collect();
    let mut failures = Vec::new();

    while !pending.is_empty() {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped = skipped, "Progress display lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            SmcEvent::TaskProgress { kind, state, .. } if pending.contains(&kind) => {
                println!(
                    "[{}] {:>5.1}% {}",
                    kind,
                    state.clamped_progress(),
                    state.current_step
                );
            }
            SmcEvent::TaskCompleted { kind, task_id } if pending.remove(&kind) => {
                println!("[{}] completed ({})", kind, task_id);
            }
            SmcEvent::TaskFailed { kind, message, .. } if pending.remove(&kind) => {
                println!("[{}] failed: {}", kind, message);
                failures.push(format!("{}: {}", kind, message));
            }
            _ => {}
        }
    }

    if !failures.is_empty() {
        bail!("{} job(s) failed: {}", failures.len(), failures.join("; "));
    }
    Ok(())
}
