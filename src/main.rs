//! Thin CLI adapter over the orchestrator library.
//!
//! The binary wires the transport-agnostic command surface to process exit
//! codes and constructs the default collaborators: an external-command LLM
//! provider, a provider-backed summarizer, and a presence-based artifact
//! scorer. Everything substantive lives in the library.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use foundry::budget::TokenMeter;
use foundry::config::Options;
use foundry::context::{ContentItem, Summarizer};
use foundry::errors::ProviderError;
use foundry::orchestrator::{Collaborators, ExitStatus, Orchestrator, RunOutcome};
use foundry::provider::{
    CompletionRequest, CompletionResponse, FlatPricing, LlmProvider, Message, PricingTable,
};
use foundry::task::{Plan, TaskId};
use foundry::validator::{RubricScorer, Scores};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing_subscriber::EnvFilter;

/// Fallback average price per 1k tokens, in minor units, when the pricing
/// table has no entry.
const FALLBACK_INPUT_PER_1K: f64 = 250.0;
const FALLBACK_OUTPUT_PER_1K: f64 = 1_250.0;

#[derive(Parser)]
#[command(name = "foundry")]
#[command(version, about = "Context-budgeted build orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace directory holding artifacts and .state/ metadata.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new build task from a description
    Start {
        description: String,
        /// Recognized options as key=value pairs
        #[arg(short, long)]
        option: Vec<String>,
        /// Command to invoke for LLM completions (prompt on stdin)
        #[arg(long, env = "FOUNDRY_PROVIDER_CMD")]
        provider_cmd: Option<String>,
        /// Model name passed to the provider
        #[arg(long, env = "FOUNDRY_MODEL", default_value = "foundry-default")]
        model: String,
    },
    /// Resume a task from its last checkpoint
    Resume {
        task_id: String,
        #[arg(long, env = "FOUNDRY_PROVIDER_CMD")]
        provider_cmd: Option<String>,
        #[arg(long, env = "FOUNDRY_MODEL", default_value = "foundry-default")]
        model: String,
    },
    /// Show a task's phase, ledger, and budget zone
    Status { task_id: String },
    /// Print a task's event stream
    Events {
        task_id: String,
        #[arg(long, default_value = "0")]
        from_seq: u64,
    },
    /// Request cancellation of a running task
    Cancel { task_id: String },
    /// List tasks with stored checkpoints
    List,
    /// Remove expired artifact cache entries
    Sweep,
}

/// LLM provider that shells out to an external command, writing the prompt
/// to stdin and reading the completion from stdout.
struct CommandProvider {
    command: String,
    id: String,
}

#[async_trait]
impl LlmProvider for CommandProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let prompt: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let started = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("FOUNDRY_MODEL", &request.model)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| ProviderError::Network(format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::Network(format!("stdin write failed: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProviderError::Network(format!("wait failed: {e}")))?;
        if !output.status.success() {
            return Err(ProviderError::ServerError {
                status: 500,
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(CompletionResponse {
            text: String::from_utf8_lossy(&output.stdout).into_owned(),
            input_tokens: None,
            output_tokens: None,
            latency_ms: started.elapsed().as_millis() as u64,
            provider_id: self.id.clone(),
        })
    }
}

/// Summarizer backed by the same provider.
struct ProviderSummarizer {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, items: &[ContentItem]) -> Result<String> {
        let body: String = items
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let request = CompletionRequest::new(
            &self.model,
            vec![
                Message::system(
                    "Summarize the following working notes. Keep decisions, errors, and \
                     requirements; compress everything else aggressively.",
                ),
                Message::user(&body),
            ],
            1_024,
        );
        let response = self.provider.complete(&request).await?;
        Ok(response.text)
    }
}

/// Deterministic scorer: full marks when every declared output exists,
/// zero correctness when any is missing.
struct PresenceScorer;

#[async_trait]
impl RubricScorer for PresenceScorer {
    async fn score(&self, artifact_text: &str, _plan: &Plan) -> Result<Scores> {
        if artifact_text.contains("(missing)") {
            let mut scores = Scores::uniform(0.7);
            scores.correctness = 0.0;
            Ok(scores)
        } else {
            Ok(Scores::uniform(1.0))
        }
    }
}

fn collaborators(provider_cmd: Option<String>, model: &str) -> Result<Collaborators> {
    let command = provider_cmd.context(
        "No provider command configured; pass --provider-cmd or set FOUNDRY_PROVIDER_CMD",
    )?;
    let provider: Arc<dyn LlmProvider> = Arc::new(CommandProvider {
        command,
        id: "command".to_string(),
    });
    Ok(Collaborators {
        summarizer: Arc::new(ProviderSummarizer {
            provider: Arc::clone(&provider),
            model: model.to_string(),
        }),
        provider,
        pricing: Arc::new(PricingTable::new()),
        fallback_pricing: Arc::new(FlatPricing::new(FALLBACK_INPUT_PER_1K, FALLBACK_OUTPUT_PER_1K)),
        scorer: Arc::new(PresenceScorer),
        test_runner: None,
        vcs: None,
        meter: TokenMeter::new(),
        model: model.to_string(),
    })
}

fn parse_options(pairs: &[String]) -> Result<Options> {
    let mut options = Options::default();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Option '{pair}' is not key=value"))?;
        options.apply_kv(key, value)?;
    }
    Ok(options)
}

fn exit_code_for(outcome: &RunOutcome) -> ExitCode {
    match &outcome.status {
        ExitStatus::Completed => ExitCode::SUCCESS,
        ExitStatus::Failed { .. } => ExitCode::from(1),
        ExitStatus::Cancelled => ExitCode::from(130),
        ExitStatus::DeadlineExceeded => ExitCode::from(124),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foundry=debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foundry=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Start {
            description,
            option,
            provider_cmd,
            model,
        } => {
            let options = parse_options(&option)?;
            let collab = collaborators(provider_cmd, &model)?;
            let orchestrator = Orchestrator::new(cli.workspace, options, collab)?;
            let outcome = orchestrator.start(&description).await?;
            println!("task {}: {:?}", outcome.task_id, outcome.status);
            Ok(exit_code_for(&outcome))
        }
        Commands::Resume {
            task_id,
            provider_cmd,
            model,
        } => {
            let collab = collaborators(provider_cmd, &model)?;
            let orchestrator = Orchestrator::new(cli.workspace, Options::default(), collab)?;
            let outcome = orchestrator.resume(&TaskId::from(task_id.as_str())).await?;
            println!("task {}: {:?}", outcome.task_id, outcome.status);
            Ok(exit_code_for(&outcome))
        }
        Commands::Status { task_id } => {
            let orchestrator = offline_orchestrator(cli.workspace)?;
            let status = orchestrator.status(&TaskId::from(task_id.as_str()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Events { task_id, from_seq } => {
            let orchestrator = offline_orchestrator(cli.workspace)?;
            for event in orchestrator.events(&TaskId::from(task_id.as_str()), from_seq)? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cancel { task_id } => {
            let orchestrator = offline_orchestrator(cli.workspace)?;
            orchestrator.cancel(&TaskId::from(task_id.as_str()))?;
            println!("cancellation requested for {task_id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            let orchestrator = offline_orchestrator(cli.workspace)?;
            for id in orchestrator.list() {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sweep => {
            let orchestrator = offline_orchestrator(cli.workspace)?;
            let report = orchestrator.sweep_cache();
            println!("removed {} expired entries ({} failures)", report.removed, report.failed);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Orchestrator for commands that never call the provider.
fn offline_orchestrator(workspace: PathBuf) -> Result<Orchestrator> {
    struct NoProvider;

    #[async_trait]
    impl LlmProvider for NoProvider {
        fn id(&self) -> &str {
            "none"
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            Err(ProviderError::InvalidRequest(
                "no provider configured for offline commands".into(),
            ))
        }
    }

    struct NoSummarizer;

    #[async_trait]
    impl Summarizer for NoSummarizer {
        async fn summarize(&self, _items: &[ContentItem]) -> Result<String> {
            anyhow::bail!("no summarizer configured for offline commands")
        }
    }

    let provider: Arc<dyn LlmProvider> = Arc::new(NoProvider);
    let collab = Collaborators {
        summarizer: Arc::new(NoSummarizer),
        provider,
        pricing: Arc::new(PricingTable::new()),
        fallback_pricing: Arc::new(FlatPricing::new(FALLBACK_INPUT_PER_1K, FALLBACK_OUTPUT_PER_1K)),
        scorer: Arc::new(PresenceScorer),
        test_runner: None,
        vcs: None,
        meter: TokenMeter::new(),
        model: "foundry-default".to_string(),
    };
    Ok(Orchestrator::new(workspace, Options::default(), collab)?)
}
