use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info};
use tokio::net::TcpListener;

use cellar::activity::ActivityRepository;
use cellar::agent::{AgentSessionRepository, LocalAgentRuntime};
use cellar::api::{AppState, create_router};
use cellar::cell::{CellOrchestrator, CellRepository};
use cellar::config::{ServerConfig, WorkspaceRegistry};
use cellar::db::Database;
use cellar::service::{PortAllocator, ServiceRepository, ServiceSupervisor};
use cellar::terminal::TerminalMultiplexer;
use cellar::worktree::GitWorktreeManager;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;

    let config = ServerConfig::load(cli.common.config.as_deref())?;

    match cli.command {
        Command::Serve(cmd) => async_serve(config, cmd),
    }
}

#[tokio::main]
async fn async_serve(config: ServerConfig, cmd: ServeCommand) -> Result<()> {
    handle_serve(config, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Cellar - cell runtime supervisor.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

fn effective_log_level(opts: &CommonOpts) -> LevelFilter {
    if opts.quiet {
        LevelFilter::Error
    } else if opts.debug || opts.verbose >= 2 {
        LevelFilter::Debug
    } else if opts.verbose == 1 {
        LevelFilter::Info
    } else {
        LevelFilter::Info
    }
}

fn init_logging(opts: &CommonOpts) -> Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match effective_log_level(opts) {
        LevelFilter::Error => "error",
        LevelFilter::Debug => "debug",
        _ => "info",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cellar={level},tower_http={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(io::stderr().is_terminal()),
        )
        .try_init()
        .ok();

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(effective_log_level(opts));
    builder.try_init().ok();

    Ok(())
}

async fn handle_serve(config: ServerConfig, cmd: ServeCommand) -> Result<()> {
    let database_path = config.resolve_database_path();
    let db = Database::new(&database_path).await?;
    info!("Database at {}", database_path.display());

    let cells = CellRepository::new(db.pool().clone());
    let services = ServiceRepository::new(db.pool().clone());
    let activity = ActivityRepository::new(db.pool().clone());
    let agent_sessions = AgentSessionRepository::new(db.pool().clone());

    let ports = PortAllocator::new(services.clone(), config.service_base_port);
    let supervisor = ServiceSupervisor::new(services, cells.clone(), activity.clone(), ports);

    let worktrees_dir = database_path
        .parent()
        .map(|p| p.join("worktrees"))
        .unwrap_or_else(|| PathBuf::from("worktrees"));
    let worktrees = Arc::new(GitWorktreeManager::new(worktrees_dir));
    let agents = Arc::new(LocalAgentRuntime::new(agent_sessions));

    let registry = WorkspaceRegistry::new(config.workspaces.clone());
    let terminals = TerminalMultiplexer::default();

    let orchestrator = CellOrchestrator::new(
        cells.clone(),
        registry.clone(),
        config.providers.clone(),
        supervisor.clone(),
        worktrees,
        agents,
        activity.clone(),
        terminals.clone(),
    );

    // Replay durable intent: re-drive every cell stranded in `spawning`.
    let resumed = orchestrator.resume_spawning_cells().await?;
    if resumed > 0 {
        info!("Resumed provisioning for {} stranded cell(s)", resumed);
    }

    let state = AppState::new(orchestrator, supervisor, terminals, activity, registry, cells)
        .with_allowed_origins(config.allowed_origins.clone());
    let router = create_router(state);

    let host = cmd.host.unwrap_or_else(|| config.host.clone());
    let port = cmd.port.unwrap_or(config.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("parsing bind address")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Cellar listening on http://{}", addr);

    axum::serve(listener, router)
        .await
        .context("serving HTTP")?;

    Ok(())
}
