//! Planflow CLI Entry Point
//!
//! Runs a plan file to completion with the in-memory services.
//!
//! # Usage
//!
//! ```bash
//! # Execute a plan
//! planflow plan.yaml
//!
//! # Dry run mode (command steps succeed without running)
//! planflow plan.yaml --dry-run
//!
//! # Engine configuration from YAML
//! planflow plan.yaml --config engine.yaml
//!
//! # Setup abstractions passed to every node
//! planflow plan.yaml --setup accountId=acc-1 --setup orgId=org-7
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};

use planflow::config::EngineConfig;
use planflow::execution::{CommandStepRunner, DryRunStepRunner, NodeExecution, StepRunner};
use planflow::services::EngineServices;
use planflow::{load_plan, ExecutionStatus, OrchestrationEngine, APP_NAME, VERSION};

/// Default plan file used when none is specified.
const DEFAULT_PLAN: &str = "plan.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    plan_path: String,
    config_path: Option<String>,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    max_concurrency: Option<usize>,
    timeout_secs: Option<u64>,
    setup: Vec<(String, String)>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plan_path: DEFAULT_PLAN.to_string(),
            config_path: None,
            dry_run: false,
            working_dir: None,
            max_concurrency: None,
            timeout_secs: None,
            setup: Vec::new(),
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Plan Orchestration Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: planflow [OPTIONS] <PLAN_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAN_FILE>            Path to plan YAML file");
    println!();
    println!("Options:");
    println!("  --config PATH          Engine configuration YAML");
    println!("  --dry-run              Succeed command steps without running them");
    println!("  --working-dir PATH     Working directory for command steps");
    println!("  --max-concurrency N    Fan-out width for forks that set none");
    println!("  --timeout SECS         Give up on the run after SECS seconds");
    println!("  --setup KEY=VALUE      Setup abstraction (repeatable)");
    println!("  --verbose              Enable debug logging");
    println!("  --help                 Show this help message");
    println!("  --version              Show version information");
    println!();
    println!("Examples:");
    println!("  planflow plan.yaml");
    println!("  planflow plan.yaml --dry-run --setup accountId=acc-1");
    println!("  planflow plan.yaml --config engine.yaml --max-concurrency 8");
}

/// Returns the value following option `name`.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut plan_seen = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                config.config_path = Some(option_value(args, &mut i, "--config")?.to_string());
            }
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(option_value(args, &mut i, "--working-dir")?));
            }
            "--max-concurrency" => {
                let value = option_value(args, &mut i, "--max-concurrency")?;
                config.max_concurrency = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid max concurrency: {}", value))?,
                );
            }
            "--timeout" => {
                let value = option_value(args, &mut i, "--timeout")?;
                config.timeout_secs = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid timeout: {}", value))?,
                );
            }
            "--setup" => {
                let value = option_value(args, &mut i, "--setup")?;
                let (key, val) = value
                    .split_once('=')
                    .ok_or_else(|| format!("Setup abstraction must be KEY=VALUE: {}", value))?;
                if key.trim().is_empty() {
                    return Err(format!("Setup abstraction has an empty key: {}", value));
                }
                config.setup.push((key.trim().to_string(), val.trim().to_string()));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if plan_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.plan_path = arg.clone();
                plan_seen = true;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Builds the engine configuration from the optional file and CLI overrides.
fn engine_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(max) = config.max_concurrency {
        engine_config.default_max_concurrency = max;
    }
    if let Some(secs) = config.timeout_secs {
        engine_config.run_timeout_secs = secs;
    }
    engine_config.validate()?;
    Ok(engine_config)
}

fn colored_status(status: ExecutionStatus) -> String {
    let label = status.to_string();
    match status {
        ExecutionStatus::Succeeded => label.green().to_string(),
        ExecutionStatus::Failed | ExecutionStatus::Errored => label.red().to_string(),
        ExecutionStatus::Aborted => label.magenta().to_string(),
        ExecutionStatus::Queued | ExecutionStatus::Running | ExecutionStatus::AsyncWaiting => {
            label.yellow().to_string()
        }
    }
}

/// Prints one line per node execution, indented by scope depth.
fn print_summary(records: &[NodeExecution]) {
    println!();
    println!("{}", "Node executions:".bold());
    for record in records {
        let depth = record.ambiance.levels().len().saturating_sub(1);
        let retry = if record.retry_ids.is_empty() {
            String::new()
        } else {
            format!(" (attempt {})", record.retry_ids.len() + 1)
        };
        println!(
            "  {}{:<24} {}{}",
            "  ".repeat(depth),
            record.identifier(),
            colored_status(record.status),
            retry
        );
        if let Some(message) = &record.failure_message {
            println!("  {}  {}", "  ".repeat(depth), message.dimmed());
        }
    }
}

/// Main application entry point.
fn run() -> Result<ExecutionStatus, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    let engine_config = engine_config(&config)?;

    info!("Loading plan: {}", config.plan_path);
    let plan = load_plan(&config.plan_path).map_err(|e| {
        error!("Failed to load plan: {}", e);
        format!("Could not load plan from '{}': {}", config.plan_path, e)
    })?;
    info!("Plan loaded: {} nodes", plan.len());

    let step_runner: Arc<dyn StepRunner> = if config.dry_run {
        Arc::new(DryRunStepRunner)
    } else {
        let mut runner = CommandStepRunner::new();
        if let Some(dir) = &config.working_dir {
            if !dir.is_dir() {
                return Err(format!("Working directory does not exist: {}", dir.display()).into());
            }
            info!("Working directory: {}", dir.display());
            runner = runner.with_working_dir(dir);
        }
        Arc::new(runner)
    };

    let timeout = engine_config.run_timeout();
    let engine = OrchestrationEngine::new(EngineServices::in_memory(), step_runner, engine_config);

    let plan_execution_id = engine.start_plan(plan, config.setup.clone())?;
    let status = engine.run_until_complete(&plan_execution_id, timeout)?;

    print_summary(&engine.node_executions(&plan_execution_id)?);
    println!("{}", engine.timeline().gantt_chart());
    println!("Plan execution {}: {}", plan_execution_id, colored_status(status));

    Ok(status)
}

fn main() -> ExitCode {
    match run() {
        Ok(ExecutionStatus::Succeeded) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
