//! Launchpad CLI
//!
//! A command-line tool for running generated projects in throwaway workspaces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use launchpad::bundle::read_record;
use launchpad::runner::prepare_setup_command;
use launchpad::{Config, EXAMPLE_CONFIG, FsBundleSource, Orchestrator};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "launchpad")]
#[command(about = "A tool for building and running generated projects in ephemeral workspaces")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: launchpad.toml)
        #[arg(short, long, default_value = "launchpad.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Build and start a project, keeping it up until Ctrl-C or the retention window ends
    Run {
        /// Project identifier
        #[arg(value_name = "PROJECT_ID")]
        project_id: String,

        /// Directory holding `<project id>.json` bundle records
        #[arg(short, long, default_value = ".")]
        bundles: PathBuf,
    },

    /// Show the files and setup commands of a bundle record
    Inspect {
        /// Bundle record to inspect
        #[arg(value_name = "FILE")]
        bundle: PathBuf,
    },

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // Logs go to stderr, stdout is reserved for reports
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            project_id,
            bundles,
        } => run_project(config, &project_id, bundles).await,
        Commands::Inspect { bundle } => inspect_bundle(&config, &bundle).await,
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn run_project(config: Config, project_id: &str, bundles: PathBuf) -> Result<()> {
    let retention = config.retention();
    let source = Arc::new(FsBundleSource::new(bundles));
    let orchestrator = Orchestrator::new(config, source);

    let report = orchestrator.run(project_id).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize run report")?
    );

    if !report.success {
        std::process::exit(1);
    }

    let status = orchestrator.status(project_id).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("failed to serialize status report")?
    );

    info!(
        retention = format_args!("{}s", retention.as_secs()),
        "server is up, press Ctrl-C to stop"
    );
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("failed to listen for Ctrl-C: {e}");
            }
            info!("interrupted, stopping");
        }
        () = tokio::time::sleep(retention) => {
            info!("retention window elapsed");
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn inspect_bundle(config: &Config, path: &Path) -> Result<()> {
    let bundle = read_record(path)
        .await
        .with_context(|| format!("failed to load bundle record '{}'", path.display()))?;

    println!("Files ({}):", bundle.files.len());
    for (name, content) in &bundle.files {
        println!("  {:<40} {} bytes", name, content.len());
    }

    println!();
    println!("Setup commands (execution order):");
    for command in bundle.ordered_setup_commands() {
        let verdict = match prepare_setup_command(command, &config.commands.allowed_programs) {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("rejected: {e}"),
        };
        println!("  [{}] {} ({verdict})", command.order, command.command);
        if !command.description.is_empty() {
            println!("      {}", command.description);
        }
    }

    println!();
    println!(
        "Dependencies: {} main, {} dev",
        bundle.dependencies.main.len(),
        bundle.dependencies.dev.len()
    );
    println!("Environment variables: {}", bundle.env.len());
    Ok(())
}

fn show_config(config: &Config) {
    println!("Scratch root: {}", config.scratch_root().display());
    println!("Health check: {}", config.health_url(config.ports.min));
    println!(
        "Ports: {}-{} (bind check: {})",
        config.ports.min, config.ports.max, config.ports.check_available
    );
    println!();
    println!("Commands:");
    println!("  Install: {}", config.install_step_name());
    println!("  Build: {}", config.build_step_name());
    println!("  Start: {}", config.commands.start.join(" "));
    println!("  Allowed setup programs: {}", config.commands.allowed_programs.join(", "));
    println!();
    println!("Timeouts:");
    println!("  Install: {}s", config.timeouts.install);
    println!("  Setup command: {}s", config.timeouts.setup_command);
    println!("  Build: {}s", config.timeouts.build);
    println!("  Startup: {}s", config.timeouts.startup);
    println!("  Probe: {}s", config.timeouts.probe);
    println!("  Retention: {}s", config.timeouts.retention);
    println!();
    println!("Readiness phrases: {}", config.readiness.phrases.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
