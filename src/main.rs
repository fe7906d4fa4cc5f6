mod command_agent;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conclave_core::config::AppConfig;
use conclave_core::types::DecisionValue;
use conclave_engine::graph::{WorkflowLoader, WorkflowResult, WorkflowSpec};
use conclave_engine::{run_log, AgentPool, ConditionEvaluator, LayeredFactory, Session};

use crate::command_agent::CommandAgentFactory;

#[derive(Parser)]
#[command(name = "conclave", version, about = "Multi-agent workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conclave.toml", env = "CONCLAVE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow to completion
    Run {
        /// Workflow name (looked up in the workflows dir) or path to a YAML file
        workflow: String,
        /// Initial message; defaults to the workflow's own
        #[arg(short, long)]
        message: Option<String>,
        /// Run variable visible to conditions, as key=value (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, DecisionValue)>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a workflow and check its conditions
    Validate {
        /// Workflow name or path to a YAML file
        workflow: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_var(s: &str) -> Result<(String, DecisionValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), DecisionValue::from_text(value)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conclave=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "conclave", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let loader = WorkflowLoader::new(config.workflows_dir())
        .with_default_max_turns(config.engine.default_max_turns);

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow } => {
            let spec = loader.find(&workflow)?;
            validate(&spec)?;
        }
        Commands::Run {
            workflow,
            message,
            vars,
            json,
        } => {
            let spec = loader.find(&workflow)?;
            let result = run(&config, spec, message, vars).await?;
            print_result(&result, json)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

async fn run(
    config: &AppConfig,
    spec: WorkflowSpec,
    message: Option<String>,
    vars: Vec<(String, DecisionValue)>,
) -> anyhow::Result<WorkflowResult> {
    let factory = LayeredFactory::new(Arc::new(CommandAgentFactory::new(
        config.agent.clone(),
        config.workspace.collab_dir.clone(),
    )))
    .with_retry(config.retry.clone())
    .with_tracing();
    let pool = Arc::new(AgentPool::new(Arc::new(factory)));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            ctrl_c.cancel();
        }
    });

    let session = Session::from_config(config, pool.clone()).with_cancel_token(cancel.clone());

    let log_cancel = CancellationToken::new();
    let logger = run_log::spawn_if_enabled(
        &config.log,
        config.log_dir(),
        &session.event_bus(),
        log_cancel.clone(),
    );

    let mut ctx = session.context(&spec, message.as_deref().unwrap_or(""));
    ctx.variables.extend(vars);
    let workflow = spec.name.clone();

    let result = session.execute_with(spec, ctx).await;
    if result.is_err() {
        log_cancel.cancel();
    }
    if let Some(handle) = logger {
        if let Ok(Some(path)) = handle.await {
            info!(path = %path.display(), "Run log written");
        }
    }
    pool.evict_workflow(&workflow);

    Ok(result?)
}

fn validate(spec: &WorkflowSpec) -> anyhow::Result<()> {
    let summary = spec.summary();
    println!("Workflow:        {}", summary.name);
    if let Some(description) = &spec.description {
        println!("Description:     {}", description);
    }
    println!("Agents:          {}", summary.agents);
    println!("States:          {}", summary.states);
    println!("Transitions:     {}", summary.transitions);
    println!("Exit conditions: {}", summary.exit_conditions);
    println!("Max turns:       {}", summary.max_turns);
    println!("Start state:     {}", summary.start_state);

    let mut warnings = 0;
    for (location, expr) in spec.conditions() {
        if let Err(e) = ConditionEvaluator::parse(expr) {
            warnings += 1;
            println!("warning: {}: '{}': {}", location, expr, e);
        }
    }
    if warnings == 0 {
        println!("All conditions parse.");
    } else {
        println!("{} condition(s) will fall back to a plain variable lookup.", warnings);
    }
    Ok(())
}

fn print_result(result: &WorkflowResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let status = if result.success { "succeeded" } else { "failed" };
    println!(
        "Workflow '{}' {} after {} turn(s) in {} ms",
        result.workflow_name, status, result.total_turns, result.elapsed_ms
    );
    println!("Path: {}", result.path().join(" -> "));
    if let Some(error) = &result.error_message {
        match &result.error_state {
            Some(state) => eprintln!("Error in state '{}': {}", state, error),
            None => eprintln!("Error: {}", error),
        }
    }
    if !result.final_output.is_empty() {
        println!("\n{}", result.final_output);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("strict=true").unwrap(),
            ("strict".to_string(), DecisionValue::Bool(true))
        );
        assert_eq!(
            parse_var("limit = 3").unwrap(),
            ("limit".to_string(), DecisionValue::Int(3))
        );
        assert_eq!(
            parse_var("tag=a=b").unwrap().1,
            DecisionValue::Str("a=b".into())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "conclave", "run", "review", "-m", "Fix it", "--var", "x=1", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                workflow, message, vars, json,
            } => {
                assert_eq!(workflow, "review");
                assert_eq!(message.as_deref(), Some("Fix it"));
                assert_eq!(vars.len(), 1);
                assert!(json);
            }
            _ => panic!("expected run"),
        }
    }
}
