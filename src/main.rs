use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_remote::{Config, ExecMode, NodeInfo, Session};

/// Beacon Remote - find script-capable nodes and run commands on them
#[derive(Parser)]
#[command(name = "beacon-remote", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List nodes discovered on the multicast group
    Nodes {
        /// Seconds to listen for heartbeats
        #[arg(short, long, default_value = "3")]
        wait: u64,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one command on a node
    Exec {
        /// Target node id (defaults to the first node discovered)
        #[arg(short, long, env = "BEACON_REMOTE_NODE")]
        node: Option<String>,
        /// How the remote should treat the command text (file, statement, eval)
        #[arg(short, long, default_value = "statement")]
        mode: ExecMode,
        /// Allow the remote to show interactive prompts
        #[arg(long)]
        attended: bool,
        /// Exit with an error if the remote reports failure
        #[arg(long)]
        strict: bool,
        /// Seconds to wait for the node to be discovered
        #[arg(short, long, default_value = "5")]
        wait: u64,
        /// Command text
        command: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,beacon_remote=info",
        1 => "info,beacon_remote=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    let session = Session::new(config);
    session.start().await?;

    let outcome = match cli.command {
        Command::Nodes { wait, json } => list_nodes(&session, wait, json).await,
        Command::Exec {
            node,
            mode,
            attended,
            strict,
            wait,
            command,
        } => {
            let options = ExecOptions {
                node,
                mode,
                unattended: !attended,
                strict,
                wait: Duration::from_secs(wait),
            };
            exec(&session, &options, &command).await
        }
    };

    session.stop().await;
    outcome
}

/// List discovered nodes
async fn list_nodes(session: &Session, wait: u64, json: bool) -> anyhow::Result<ExitCode> {
    tokio::time::sleep(Duration::from_secs(wait)).await;
    let nodes = session.remote_nodes().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(ExitCode::SUCCESS);
    }

    if nodes.is_empty() {
        println!("No nodes found");
        return Ok(ExitCode::SUCCESS);
    }

    for node in &nodes {
        println!("{}", describe(node));
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(node: &NodeInfo) -> String {
    let project = node.attribute("project_name").unwrap_or("-");
    let machine = node.attribute("machine").unwrap_or("-");
    let user = node.attribute("user").unwrap_or("-");
    format!(
        "{}  project={project}  machine={machine}  user={user}  last_seen={}",
        node.node_id,
        node.last_seen_at.format("%H:%M:%S")
    )
}

struct ExecOptions {
    node: Option<String>,
    mode: ExecMode,
    unattended: bool,
    strict: bool,
    wait: Duration,
}

/// Connect to a node and run a single command
async fn exec(session: &Session, options: &ExecOptions, command: &str) -> anyhow::Result<ExitCode> {
    let node = session
        .wait_for_node(options.node.as_deref(), options.wait)
        .await
        .ok_or_else(|| match &options.node {
            Some(id) => anyhow::anyhow!("node {id} not found"),
            None => anyhow::anyhow!("no nodes found"),
        })?;

    tracing::info!(node_id = %node.node_id, "connecting");
    session.open_command_connection(&node.node_id).await?;

    let result = session
        .run_command(command, options.unattended, options.mode, options.strict)
        .await?;

    for line in result.output.iter().flatten() {
        println!("{line}");
    }
    if !result.result.is_empty() {
        println!("{}", result.result);
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
