//! Agentbox CLI - run untrusted agent code in the sandbox
//!
//! Usage:
//!   agentbox run <file>          - Execute a full-code agent
//!   agentbox low-code <config>   - Execute a low-code step graph
//!   agentbox no-code <prompt>    - Describe a no-code agent run
//!   agentbox self-test           - Run the 2 + 2 sandbox check
//!   agentbox tiers               - List resource tiers

use agentbox_core::{settings_from_json, CompletionConfig, ExecutionOptions, HttpCompletionService, SandboxRunner};
use agentbox_sandbox::completion::CompletionService;
use agentbox_sandbox::{tiers, BackendKind, ConfigOverrides, ExecutionResult, SandboxSettings};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Sandboxed execution for marketplace agents", long_about = None)]
struct Cli {
    /// JSON settings file (defaults come from AGENTBOX_* variables)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a full-code agent
    Run {
        /// Source file (script, or WAT for the metered backend)
        file: PathBuf,

        /// Input as JSON
        #[arg(long)]
        input: Option<String>,

        /// Resource tier
        #[arg(long)]
        tier: Option<String>,

        /// Backend override: interpreted or metered
        #[arg(long, value_parser = parse_backend)]
        backend: Option<BackendKind>,

        /// Fuel limit override
        #[arg(long)]
        fuel: Option<u64>,
    },

    /// Execute a low-code step graph
    LowCode {
        /// Configuration file ({steps, variables})
        config: PathBuf,

        /// Input as JSON
        #[arg(long)]
        input: Option<String>,
    },

    /// Describe a no-code agent run
    NoCode {
        prompt: String,

        /// Context as JSON
        #[arg(long)]
        context: Option<String>,
    },

    /// Run the sandbox self-test
    SelfTest {
        #[arg(long, value_parser = parse_backend)]
        backend: Option<BackendKind>,
    },

    /// List resource tiers
    Tiers,
}

fn parse_backend(raw: &str) -> Result<BackendKind, String> {
    raw.parse().map_err(|e: agentbox_sandbox::SandboxError| e.to_string())
}

fn parse_json(raw: Option<&str>, what: &str) -> anyhow::Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(text).with_context(|| format!("{} is not valid JSON", what)))
        .transpose()
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<SandboxSettings> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read settings from {}", path.display()))?;
            Ok(settings_from_json(&text)?)
        }
        None => Ok(SandboxSettings::from_env()),
    }
}

fn print_result(result: &ExecutionResult) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_tiers() {
    for name in tiers::names() {
        let tier = tiers::resolve_tier(name);
        println!(
            "{:<11} {:>5} MB  {:>4} s  {:>13} fuel",
            tier.name,
            tier.memory_limit_mb(),
            tier.cpu_time_limit_secs(),
            tier.fuel_limit
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let settings = load_settings(cli.settings.as_ref())?;
    let completion = CompletionConfig::from_env()
        .map(|config| Arc::new(HttpCompletionService::new(config)) as Arc<dyn CompletionService>);
    let runner = SandboxRunner::new(settings, completion)?;
    runner.start();

    let result = match cli.command {
        Commands::Run {
            file,
            input,
            tier,
            backend,
            fuel,
        } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let input = parse_json(input.as_deref(), "--input")?;
            let mut overrides = ConfigOverrides::default();
            overrides.fuel_limit = fuel;
            let options = ExecutionOptions {
                tier,
                overrides,
                backend,
            };
            runner.execute_code(&code, input.as_ref(), &options).await
        }

        Commands::LowCode { config, input } => {
            let text = std::fs::read_to_string(&config)
                .with_context(|| format!("failed to read {}", config.display()))?;
            let config: Value = serde_json::from_str(&text).context("low-code config is not valid JSON")?;
            let input = parse_json(input.as_deref(), "--input")?;
            runner.execute_low_code(&config, input.as_ref()).await
        }

        Commands::NoCode { prompt, context } => {
            let context = parse_json(context.as_deref(), "--context")?;
            runner.execute_no_code(&prompt, context.as_ref()).await
        }

        Commands::SelfTest { backend } => runner.test_sandbox(backend).await,

        Commands::Tiers => {
            print_tiers();
            runner.shutdown();
            return Ok(());
        }
    };

    runner.shutdown();
    print_result(&result)
}
