//! Collect Agent CLI
//!
//! Run the agent, or drive a running agent over its control port

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collect_agent::{
    AdaptorFactory, AddCommand, Agent, AgentConfig, CheckpointManager, FsCheckpointStore,
};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "cagent")]
#[command(about = "Collect Agent - runs data-source adaptors and delivers their data to collectors")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground until stopagent or Ctrl-C
    Run {
        /// Config file, defaults to ~/.config/collect-agent/agent.toml
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Send one control command to a running agent and print the reply
    Ctl {
        /// Control command, e.g. `list` or `shutdown adaptor_x`
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, short, default_value = "9093")]
        port: u16,
    },
    /// Print the authoritative checkpoint in a checkpoint directory
    Checkpoint {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "agent_checkpoint_")]
        base_name: String,
        /// Print the add commands as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log level comes from RUST_LOG, info by default
    // e.g. RUST_LOG=debug cagent run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("collect_agent=info,cagent=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_agent(config).await?,
        Commands::Ctl {
            command,
            host,
            port,
        } => {
            let reply = send_control(&host, port, &command.join(" ")).await?;
            print!("{}", reply);
        }
        Commands::Checkpoint {
            dir,
            base_name,
            json,
        } => {
            let manager = CheckpointManager::new(Box::new(FsCheckpointStore::new(dir, base_name)));
            match manager.authoritative()? {
                None => eprintln!("no checkpoint found"),
                Some((generation, lines)) => {
                    if json {
                        let commands: Vec<AddCommand> = lines
                            .iter()
                            .filter_map(|l| AddCommand::parse(l).ok())
                            .collect();
                        println!("{}", serde_json::to_string_pretty(&commands)?);
                    } else {
                        println!("# generation {}", generation);
                        for line in lines {
                            println!("{}", line);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_agent(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => AgentConfig::load(&path)?,
        None => AgentConfig::load_or_default(&AgentConfig::default_path())?,
    };

    let mut agent = Agent::new(config, AdaptorFactory::with_builtin());
    agent.start().await?;
    if let Some(addr) = agent.control_addr() {
        info!(%addr, "agent ready");
    }

    tokio::select! {
        _ = agent.stopped() => info!("stopagent received"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("interrupted");
        }
    }

    agent.shutdown().await;
    Ok(())
}

/// Send one command followed by `close`, then read until the agent hangs up
async fn send_control(host: &str, port: u16, command: &str) -> Result<String> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("failed to connect to agent at {}:{}", host, port))?;
    stream
        .write_all(format!("{}\nclose\n", command).as_bytes())
        .await?;
    stream.flush().await?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply)
}
