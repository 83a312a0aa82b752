use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use deepresearch_cli::cli::{Cli, Commands, McpCommands, SkillCommands, TelemetryCommands, command_label};
use deepresearch_cli::config::{RuntimeConfig, load_profiles, print_runtime_summary, resolve_runtime_config};
use deepresearch_cli::error::{categorize_error, format_cli_error};
use deepresearch_cli::input::default_input;
use deepresearch_cli::mcp::{run_mcp_list, run_mcp_tools};
use deepresearch_cli::session::{build_session, run_ask, run_chat};
use deepresearch_cli::skills::run_skills_list;
use deepresearch_cli::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    init_tracing(cli.log_filter.as_deref().unwrap_or(default_filter))?;

    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let command = cli.command.unwrap_or(Commands::Chat);
    let telemetry = TelemetrySink::new(&cfg, command_label(&command));

    match command {
        Commands::Ask { prompt } => {
            let prompt = prompt.join(" ");
            let mut session = build_session(&cfg, default_input(), telemetry).await?;
            run_ask(&mut session, &prompt).await?;
        }
        Commands::Chat => {
            run_interactive(&cfg, telemetry).await?;
        }
        Commands::Skills { command } => match command {
            SkillCommands::List => run_skills_list(&cfg.skills_dir),
        },
        Commands::Mcp { command } => match command {
            McpCommands::List => run_mcp_list(&cfg.mcp_config_path)?,
            McpCommands::Tools => {
                run_mcp_tools(
                    &cfg.mcp_config_path,
                    Duration::from_secs(cfg.tool_timeout_secs),
                )
                .await?
            }
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                run_telemetry_report(&cfg, path, limit)?;
            }
        },
    }

    Ok(())
}

async fn run_interactive(cfg: &RuntimeConfig, telemetry: TelemetrySink) -> Result<()> {
    if cfg.verbose {
        print_runtime_summary(cfg);
    }
    tracing::info!(model = %cfg.model, search = cfg.search_provider.label(), "starting session");
    let mut session = build_session(cfg, default_input(), telemetry).await?;
    run_chat(&mut session, &cfg.model, cfg.search_provider.label()).await
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
