use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rulekit::audit::TracingAuditLog;
use rulekit::config::EngineConfig;
use rulekit::formatter::{describe_action, format_definitions};
use rulekit::store::InMemoryEntityStore;
use rulekit::{parse_file, Definition, ExecutionRequest, RulekitError, System, Value};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to engine config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a DSL file and list its definitions
    Check { file: PathBuf },
    /// Print a DSL file in canonical form
    Fmt { file: PathBuf },
    /// Describe the actions of a DSL file
    Describe {
        file: PathBuf,
        #[arg(long)]
        entity: Option<String>,
    },
    /// Check every precondition of an action without running it
    Validate(RequestArgs),
    /// Execute an action against seeded data
    Run(RequestArgs),
}

#[derive(clap::Args)]
struct RequestArgs {
    file: PathBuf,
    /// Entity seed data: { "<EntityType>": [ { "id": "...", ... } ] }
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    entity_type: String,
    #[arg(long)]
    action: String,
    #[arg(long)]
    id: String,
    /// Action parameter, `name=value`. Values are read as JSON when possible.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, RulekitError> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    debug!("config: {:?}", config);
    Ok(config)
}

async fn build_system(cli: &Cli, args: &RequestArgs) -> Result<System, RulekitError> {
    let config = load_config(cli.config.as_deref())?;

    let content = std::fs::read_to_string(&args.data)
        .map_err(|e| RulekitError::internal(format!("Failed to read data file: {}", e)))?;
    let data: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| RulekitError::internal(format!("Failed to parse data file: {}", e)))?;

    let store = InMemoryEntityStore::shared();
    let seeded = store.load_json(&data)?;
    info!("seeded {} entities", seeded);

    let system = System::new(config, store, Arc::new(TracingAuditLog)).await?;
    system.load_configured_sources()?;
    system.load_file(&args.file)?;
    Ok(system)
}

fn request_of(args: &RequestArgs) -> ExecutionRequest {
    args.params.iter().fold(
        ExecutionRequest::new(&args.entity_type, &args.action, &args.id),
        |request, (name, value)| request.with_param(name, value.clone()),
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RulekitError> {
    serde_json::to_string_pretty(value).map_err(|e| RulekitError::internal(e.to_string()))
}

async fn run(cli: &Cli) -> Result<bool, RulekitError> {
    match &cli.command {
        Command::Check { file } => {
            let definitions = parse_file(file)?;
            for definition in &definitions {
                match definition {
                    Definition::Action(action) => println!("ACTION {}", action.qualified_name()),
                    Definition::Rule(rule) => println!("RULE {} ON {}", rule.name, rule.trigger),
                }
            }
            println!("{} definitions OK", definitions.len());
            Ok(true)
        }
        Command::Fmt { file } => {
            print!("{}", format_definitions(&parse_file(file)?));
            Ok(true)
        }
        Command::Describe { file, entity } => {
            let descriptions: Vec<String> = parse_file(file)?
                .iter()
                .filter_map(Definition::as_action)
                .filter(|a| entity.as_deref().map_or(true, |e| a.entity_type == e))
                .map(describe_action)
                .collect();
            println!("{}", descriptions.join("\n\n"));
            Ok(true)
        }
        Command::Validate(args) => {
            let system = build_system(cli, args).await?;
            let report = system.validate(&request_of(args)).await?;
            println!("{}", to_json(&report)?);
            Ok(report.is_valid())
        }
        Command::Run(args) => {
            let system = build_system(cli, args).await?;
            let result = system.execute(&request_of(args), None).await;
            println!("{}", to_json(&result)?);
            Ok(result.success)
        }
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
