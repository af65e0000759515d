//! tether - run LLM agents under constraints
//!
//! ## Commands
//!
//! - `run`: execute an agent on an input and print the outcome
//! - `check`: validate an input against an agent's input constraints
//! - `health`: report configured backends and which one would be selected
//!
//! Exit codes: 0 accepted or healthy, 1 failed, 2 usage or config error.
//! Logs go to stderr (`RUST_LOG` overrides the level); stdout carries only
//! the result.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use tether_core::{AgentConfig, ExecutionOutcome};
use tether_runtime::{
    BackendDescriptor, BackendRegistry, RuntimeConfig, SelectionMode,
};

#[derive(Parser)]
#[command(name = "tether")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run LLM agents with constraint checks and quality-gated retries", long_about = None)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute an agent on one input
    Run {
        /// Agent definition (YAML or JSON)
        #[arg(short, long)]
        agent: PathBuf,

        /// Runtime configuration (default: local Ollama, cloud fallback)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Input text
        #[arg(short, long)]
        input: String,

        /// Parse the input as JSON instead of taking it as text
        #[arg(long)]
        input_json: bool,

        /// Override the backend mode (local, cloud, auto)
        #[arg(short, long)]
        mode: Option<SelectionMode>,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate an input without generating
    Check {
        #[arg(short, long)]
        agent: PathBuf,

        #[arg(short, long)]
        input: String,

        #[arg(long)]
        input_json: bool,
    },

    /// Show backend descriptors, health and selection
    Health {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long)]
        mode: Option<SelectionMode>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            agent,
            config,
            input,
            input_json,
            mode,
            json,
        } => cmd_run(&agent, config.as_deref(), &input, input_json, mode, json).await,
        Commands::Check {
            agent,
            input,
            input_json,
        } => cmd_check(&agent, &input, input_json),
        Commands::Health { config, mode, json } => {
            cmd_health(config.as_deref(), mode, json).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_agent(path: &Path) -> Result<AgentConfig> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let agent = if is_json {
        AgentConfig::from_json_file(path)
    } else {
        AgentConfig::from_yaml_file(path)
    };
    agent.with_context(|| format!("Failed to load agent from {}", path.display()))
}

fn load_runtime(path: Option<&Path>, mode: Option<SelectionMode>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load runtime config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    Ok(match mode {
        Some(mode) => config.with_mode(mode),
        None => config,
    })
}

fn parse_input(input: &str, as_json: bool) -> Result<Value> {
    if as_json {
        serde_json::from_str(input).context("Input is not valid JSON")
    } else {
        Ok(Value::String(input.to_string()))
    }
}

async fn cmd_run(
    agent_path: &Path,
    config_path: Option<&Path>,
    input: &str,
    input_json: bool,
    mode: Option<SelectionMode>,
    json: bool,
) -> Result<ExitCode> {
    let agent = load_agent(agent_path)?;
    let input = parse_input(input, input_json)?;
    let core = load_runtime(config_path, mode)?
        .build_core()
        .context("Failed to build backends")?;

    let outcome = core.execute(&agent, &input).await;
    core.selector().shutdown().await;

    if json {
        println!("{}", outcome.to_json_pretty()?);
    } else {
        print_outcome(&outcome);
    }

    Ok(if outcome.is_accepted() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_outcome(outcome: &ExecutionOutcome) {
    let history = &outcome.history;
    for attempt in history.attempts() {
        let status = match &attempt.failure {
            None => "accepted".to_string(),
            Some(failure) => failure.to_string(),
        };
        let score = attempt
            .verdict
            .as_ref()
            .map(|v| format!(" score={:.2}", v.overall_score))
            .unwrap_or_default();
        println!(
            "attempt {} ({}ms){}: {}",
            attempt.number, attempt.duration_ms, score, status
        );
    }

    let usage = history.usage();
    println!(
        "tokens: {} over {} call(s)",
        usage.total_tokens,
        usage.calls()
    );

    match (&outcome.output, outcome.failure_kind()) {
        (Some(output), None) => {
            println!("\n{}", output);
        }
        (_, Some(kind)) => {
            println!("failed: {}", kind);
            if let Some(detail) = &outcome.detail {
                println!("  {}", detail);
            }
        }
        (None, None) => {}
    }
}

fn cmd_check(agent_path: &Path, input: &str, input_json: bool) -> Result<ExitCode> {
    let agent = load_agent(agent_path)?;
    let input = parse_input(input, input_json)?;

    match agent.input_constraints().validate(&input) {
        Ok(()) => {
            println!("input accepted by {}", agent.name());
            Ok(ExitCode::SUCCESS)
        }
        Err(violations) => {
            println!("input rejected by {}:", agent.name());
            for violation in violations {
                println!("  - {}", violation);
            }
            Ok(ExitCode::from(1))
        }
    }
}

#[derive(Serialize)]
struct HealthReport {
    backends: Vec<BackendHealth>,
    selected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct BackendHealth {
    #[serde(flatten)]
    descriptor: BackendDescriptor,
    healthy: bool,
}

async fn cmd_health(
    config_path: Option<&Path>,
    mode: Option<SelectionMode>,
    json: bool,
) -> Result<ExitCode> {
    let selector = load_runtime(config_path, mode)?
        .build_selector(&BackendRegistry::with_defaults())
        .context("Failed to build backends")?;

    let (selected, error) = match selector.acquire().await {
        Ok(lease) => (Some(lease.kind().to_string()), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let backends = selector
        .health()
        .await
        .into_iter()
        .map(|(descriptor, healthy)| BackendHealth {
            descriptor,
            healthy,
        })
        .collect();
    selector.shutdown().await;

    let report = HealthReport {
        backends,
        selected,
        error,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for backend in &report.backends {
            let d = &backend.descriptor;
            println!(
                "{:<6} {:<18} {:<24} {:<40} {}",
                d.kind.to_string(),
                d.name,
                d.model,
                d.endpoint,
                if backend.healthy { "healthy" } else { "unreachable" }
            );
        }
        match (&report.selected, &report.error) {
            (Some(kind), _) => println!("selected: {}", kind),
            (None, Some(error)) => println!("selection failed: {}", error),
            (None, None) => {}
        }
    }

    Ok(if report.selected.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
