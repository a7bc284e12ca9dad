//! Deployment-execution agent CLI.
//!
//! `convey deploy` extracts a package, runs its scripts and deploys its stack;
//! `convey extract` only unpacks a package.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

use convey::conventions::{ScriptError, standard_conventions};
use convey::core::cancel::CancellationToken;
use convey::core::context::DeploymentContext;
use convey::core::variables::Variables;
use convey::exit_codes;
use convey::io::config::{load_config, write_atomic};
use convey::io::extractor::{ExtractorRegistry, PackageKind};
use convey::io::process::ProcessOptions;
use convey::logging;
use convey::pipeline::{PipelineError, run_conventions};
use convey::stack::StackError;

#[derive(Parser)]
#[command(name = "convey", version, about = "Package deployment agent")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a package, run its scripts and deploy its stack.
    Deploy {
        /// Package archive to deploy.
        #[arg(long)]
        package: PathBuf,
        /// JSON object of deployment variables.
        #[arg(long)]
        variables: Option<PathBuf>,
        /// Extra variable as NAME=VALUE; repeatable, wins over --variables.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Agent config file (defaults apply when missing).
        #[arg(long, default_value = "convey.toml")]
        config: PathBuf,
        /// Write the final variables here as JSON, also on failure.
        #[arg(long)]
        output_variables: Option<PathBuf>,
        /// Parent of derived staging directories [default: <package dir>/staging].
        #[arg(long)]
        staging_root: Option<PathBuf>,
    },
    /// Unpack a package into a directory.
    Extract {
        #[arg(long)]
        package: PathBuf,
        #[arg(long)]
        destination: PathBuf,
        #[arg(long, default_value = "convey.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli.command) {
        eprintln!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Deploy {
            package,
            variables,
            vars,
            config,
            output_variables,
            staging_root,
        } => cmd_deploy(DeployArgs {
            package,
            variables,
            vars,
            config,
            output_variables,
            staging_root,
        }),
        Command::Extract {
            package,
            destination,
            config,
        } => cmd_extract(&package, &destination, &config),
    }
}

struct DeployArgs {
    package: PathBuf,
    variables: Option<PathBuf>,
    vars: Vec<(String, String)>,
    config: PathBuf,
    output_variables: Option<PathBuf>,
    staging_root: Option<PathBuf>,
}

fn cmd_deploy(args: DeployArgs) -> Result<()> {
    let cfg = load_config(&args.config)?;
    let variables = initial_variables(args.variables.as_deref(), args.vars)?;
    let staging_root = args
        .staging_root
        .unwrap_or_else(|| default_staging_root(&args.package));

    let cancel = CancellationToken::new();
    let conventions = standard_conventions(&cfg, &staging_root, &cancel);
    let mut ctx = DeploymentContext::new(&args.package, variables);
    let result = run_conventions(&mut ctx, &conventions, &cancel);

    if let Some(path) = &args.output_variables {
        write_variables(path, &ctx.variables)?;
    }
    let outcome = result?;
    info!(steps = outcome.completed.len(), "deployment finished");
    Ok(())
}

fn cmd_extract(package: &Path, destination: &Path, config: &Path) -> Result<()> {
    let cfg = load_config(config)?;
    let options = ProcessOptions::new(cfg.process_timeout());
    let registry = ExtractorRegistry::from_config(&cfg, &options);
    let mut ctx = DeploymentContext::new(package, Variables::new());
    let kind = PackageKind::for_context(&ctx)?;
    let report = registry
        .create_extractor(&kind)?
        .extract(package, destination, &mut ctx)
        .with_context(|| format!("extract {}", package.display()))?;
    info!(
        extractor = %report.extractor,
        files = ?report.files,
        destination = %report.destination.display(),
        "package extracted"
    );
    Ok(())
}

/// Variables from the optional JSON file, then `--var` overrides in order.
fn initial_variables(file: Option<&Path>, overrides: Vec<(String, String)>) -> Result<Variables> {
    let mut variables = match file {
        Some(path) => {
            let raw =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
        }
        None => Variables::new(),
    };
    for (name, value) in overrides {
        variables.set(name, value);
    }
    Ok(variables)
}

fn default_staging_root(package: &Path) -> PathBuf {
    match package.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join("staging"),
        _ => PathBuf::from("staging"),
    }
}

/// Serialize variables to pretty-printed JSON with trailing newline.
fn write_variables(path: &Path, variables: &Variables) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(variables).context("serialize variables")?;
    payload.push('\n');
    write_atomic(path, &payload)
}

fn parse_var(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("variable name is empty in {raw:?}"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(stack) = err.downcast_ref::<StackError>() {
        return match stack {
            StackError::RolledBack { .. } => exit_codes::ROLLED_BACK,
            StackError::Permission { .. } => exit_codes::PERMISSION_DENIED,
            StackError::TimedOut { .. } | StackError::Cancelled { .. } => exit_codes::CANCELLED,
            _ => exit_codes::FAILED,
        };
    }
    if err.downcast_ref::<PipelineError>().is_some() {
        return exit_codes::CANCELLED;
    }
    match err.downcast_ref::<ScriptError>() {
        Some(ScriptError::TimedOut { .. } | ScriptError::Cancelled { .. }) => exit_codes::CANCELLED,
        _ => exit_codes::FAILED,
    }
}
