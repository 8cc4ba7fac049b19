//! `relayd` CLI/daemon: serve the signed command relay, sign requests, and
//! inspect a persistent queue.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use relay_core::{
    open_queue, CommandQueue, DispatchMode, PersistentQueue, RelayConfig, RelayService,
    StorageLocation,
};
use relay_spec::{canonical_message, sign_message, unix_now, SharedSecret, SignedOperation};
use relayd::{build_router, AppState, RelayMetrics};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Relayd command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    log_level: Option<String>,
    /// Relay configuration flags.
    #[command(flatten)]
    relay: RelayArgs,
    /// Subcommand.
    #[command(subcommand)]
    command: Commands,
}

/// Process configuration shared by all subcommands.
#[derive(Args, Debug, Clone)]
struct RelayArgs {
    /// Shared secret for the agent protocol.
    #[arg(long, env = "RELAY_SHARED_SECRET", hide_env_values = true)]
    agent_secret: Option<String>,
    /// Shared secret for webhook ingestion.
    #[arg(long, env = "RELAY_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,
    /// Agents allowed to use the signed protocol.
    #[arg(
        long,
        env = "RELAY_AGENTS",
        value_delimiter = ',',
        default_value = "suna",
        help = "Comma separated allow-list of agent identifiers"
    )]
    agents: Vec<String>,
    /// Persistent queue directory; commands are kept in memory when absent.
    #[arg(long, env = "RELAY_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// FetchNext dispatch strategy.
    #[arg(long, value_enum, default_value_t = DispatchArg::Peek, env = "RELAY_DISPATCH")]
    dispatch: DispatchArg,
    /// Agent receiving webhook-derived commands.
    #[arg(long, env = "RELAY_WEBHOOK_AGENT", default_value = relay_core::config::DEFAULT_WEBHOOK_AGENT)]
    webhook_agent: String,
}

/// Dispatch strategies exposed via CLI.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum DispatchArg {
    Peek,
    Claim,
}

/// Commands for relayd.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP relay.
    Serve {
        /// Bind address.
        #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8080")]
        listen: String,
    },
    /// Print the canonical message and signature for a request.
    Sign {
        /// Signing agent.
        #[arg(long)]
        agent: String,
        /// Timestamp to sign; defaults to now.
        #[arg(long, allow_hyphen_values = true)]
        ts: Option<i64>,
        /// Operation to sign.
        #[command(subcommand)]
        op: SignOp,
    },
    /// List commands stored in the persistent queue. Read-only; safe while serving.
    List {
        /// Start offset.
        #[arg(short, long, default_value = "0")]
        offset: usize,
        /// Number of entries.
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

/// Operations that can be signed.
#[derive(Subcommand, Debug)]
enum SignOp {
    /// Submit a command.
    Submit {
        /// Action name.
        #[arg(long)]
        action: String,
        /// Action argument.
        #[arg(long, default_value = "")]
        payload: String,
    },
    /// Poll for the next command.
    Next,
    /// Report a result.
    Result {
        /// Command id.
        #[arg(long)]
        id: u64,
    },
}

#[derive(Serialize)]
struct SignedRequest {
    agent: String,
    ts: i64,
    message: String,
    sig: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .as_deref()
        .map(|lvl| lvl.to_ascii_uppercase())
        .map(|lvl| match lvl.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "WARN" => Level::WARN,
            "ERROR" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or_else(|| match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&cli.relay);
    match cli.command {
        Commands::Serve { listen } => serve(config, listen).await?,
        Commands::Sign { agent, ts, op } => sign(&config, agent, ts, op)?,
        Commands::List { offset, limit } => list(&config, offset, limit)?,
    }
    Ok(())
}

fn build_config(args: &RelayArgs) -> RelayConfig {
    let storage = match &args.data_dir {
        Some(dir) => StorageLocation::Directory(dir.clone()),
        None => StorageLocation::Memory,
    };
    RelayConfig {
        agent_secret: args.agent_secret.as_deref().and_then(SharedSecret::new),
        webhook_secret: args.webhook_secret.as_deref().and_then(SharedSecret::new),
        agents: args.agents.iter().map(String::as_str).collect(),
        storage,
        dispatch: match args.dispatch {
            DispatchArg::Peek => DispatchMode::Peek,
            DispatchArg::Claim => DispatchMode::Claim,
        },
        webhook_agent: args.webhook_agent.clone(),
    }
}

async fn serve(config: RelayConfig, listen: String) -> anyhow::Result<()> {
    for warning in config.warnings() {
        warn!("{warning}");
    }
    let queue = open_queue(&config.storage)?;
    let service = RelayService::new(&config, queue.clone());
    let metrics = RelayMetrics::new(service.webhook_configured())?;
    metrics.refresh_queue(&*queue);
    let state = Arc::new(AppState::new(service, metrics, config.dispatch));

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(
        addr = %listener.local_addr()?,
        agents = config.agents.len(),
        dispatch = ?config.dispatch,
        storage = ?config.storage,
        "relayd listening"
    );
    axum::serve(listener, build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;
    info!("relayd stopped");
    Ok(())
}

fn sign(config: &RelayConfig, agent: String, ts: Option<i64>, op: SignOp) -> anyhow::Result<()> {
    let secret = config
        .agent_secret
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--agent-secret is required to sign requests"))?;
    let ts = ts.unwrap_or_else(unix_now);
    let op = match &op {
        SignOp::Submit { action, payload } => SignedOperation::Submit { action, payload },
        SignOp::Next => SignedOperation::FetchNext,
        SignOp::Result { id } => SignedOperation::ReportResult { id: *id },
    };
    let message = canonical_message(&agent, &op, ts);
    let sig = sign_message(secret, &message);
    let out = SignedRequest {
        agent,
        ts,
        message,
        sig,
    };
    println!("{}", serde_json::to_string(&out)?);
    Ok(())
}

fn list(config: &RelayConfig, offset: usize, limit: usize) -> anyhow::Result<()> {
    let StorageLocation::Directory(dir) = &config.storage else {
        anyhow::bail!("--data-dir is required to list stored commands");
    };
    let queue = PersistentQueue::read_snapshot(dir)?;
    let span = tracing::info_span!(
        "cli_list",
        offset = offset as u64,
        limit = limit as u64,
        total = queue.len() as u64
    );
    let _guard = span.enter();
    for cmd in queue.read(offset, limit) {
        let state = match (cmd.is_pending(), cmd.claimed) {
            (true, false) => "pending",
            (true, true) => "claimed",
            (false, _) => "executed",
        };
        println!(
            "id={} agent={} state={} ts={} action={} payload={}",
            cmd.id, cmd.agent, state, cmd.submitted_at, cmd.action, cmd.payload
        );
        if let Some(result) = &cmd.result {
            println!("  result={result}");
        }
    }
    Ok(())
}
