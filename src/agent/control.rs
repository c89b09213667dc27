//! Line-oriented control protocol
//!
//! [`ControlHandler`] turns one command line into reply lines and is
//! transport-free; [`ControlServer`] serves it over TCP, one task per
//! connection.

use super::command::ControlCommand;
use super::registry::AdaptorRegistry;
use crate::adaptor::naming::{sanitize_adaptor_id, ADAPTOR_ID_PREFIX};
use crate::adaptor::ShutdownPolicy;
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Idle control connections are dropped after this long
const READ_TIMEOUT: Duration = Duration::from_secs(60);

const HELP: &[&str] = &[
    "you're talking to the collect agent.  Commands available: ",
    "add [id=]<adaptorclass> <datatype> [params] <offset> -- start an adaptor",
    "shutdown <adaptorid>  -- graceful stop",
    "stop <adaptorid>  -- abrupt stop",
    "list -- list running adaptors",
    "close -- close this connection",
    "stopagent -- stop the whole agent process",
    "stopall -- stop all adaptors",
    "reloadCollectors -- reload the list of collectors",
    "help -- print this message",
    "\t Command names are case-blind.",
];

/// Agent-level actions reachable from the control protocol
pub trait AgentControl: Send + Sync {
    fn reload_collectors(&self) -> Result<()>;
    /// Ask the agent to shut down; returns immediately
    fn request_stop(&self);
}

/// What the connection does after writing the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    Continue,
    Close,
    StopAgent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub after: After,
}

impl Reply {
    fn lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            after: After::Continue,
        }
    }

    fn line(line: impl Into<String>) -> Self {
        Self::lines(vec![line.into()])
    }
}

pub struct ControlHandler {
    registry: Arc<AdaptorRegistry>,
    control: Arc<dyn AgentControl>,
    host: String,
}

impl ControlHandler {
    pub fn new(registry: Arc<AdaptorRegistry>, control: Arc<dyn AgentControl>, host: impl Into<String>) -> Self {
        Self {
            registry,
            control,
            host: host.into(),
        }
    }

    pub fn status_line(&self) -> String {
        format!(
            "{}: collect-agent running, version {}, with {} adaptors",
            self.host,
            VERSION,
            self.registry.count()
        )
    }

    /// Execute one command line. May block while adaptors start or stop.
    pub fn handle(&self, line: &str) -> Reply {
        match ControlCommand::parse(line) {
            Ok(command) => self.execute(command),
            Err(e) => Reply::line(format!("FAIL: {}", e)),
        }
    }

    pub fn execute(&self, command: ControlCommand) -> Reply {
        match command {
            ControlCommand::Add(cmd) => match self.registry.add_command(&cmd) {
                Ok(id) => Reply::line(format!("OK add completed; new ID is {}", id)),
                Err(e) => Reply::line(format!("FAIL: {}", e)),
            },
            ControlCommand::Stop { id, policy } => self.stop(&id, policy),
            ControlCommand::List => {
                let mut lines: Vec<String> = self
                    .registry
                    .list()
                    .into_iter()
                    .map(|(id, status)| format!("{})  {}", id, status))
                    .collect();
                lines.push(String::new());
                Reply::lines(lines)
            }
            ControlCommand::StopAll => {
                let stopped = self.registry.stop_all(ShutdownPolicy::HardStop);
                Reply::line(format!("stopped {} adaptors", stopped))
            }
            ControlCommand::StopAgent => Reply {
                lines: vec!["stopping agent process.".to_string()],
                after: After::StopAgent,
            },
            ControlCommand::ReloadCollectors => match self.control.reload_collectors() {
                Ok(()) => Reply::line("OK reloadCollectors done"),
                Err(e) => Reply::line(format!("FAIL: {}", e)),
            },
            ControlCommand::Help => Reply::lines(HELP.iter().map(|s| s.to_string()).collect()),
            ControlCommand::Close => Reply {
                lines: Vec::new(),
                after: After::Close,
            },
            ControlCommand::Status => Reply::line(self.status_line()),
            ControlCommand::Unknown(word) => {
                warn!(command = %word, "unknown control command");
                Reply::lines(vec![
                    format!("unknown command {}", word),
                    "say 'help' for a list of legal commands".to_string(),
                ])
            }
        }
    }

    fn stop(&self, id: &str, policy: ShutdownPolicy) -> Reply {
        let mut lines = Vec::new();
        let id = if id.starts_with(ADAPTOR_ID_PREFIX) {
            id.to_string()
        } else {
            let sanitized = sanitize_adaptor_id(id);
            lines.push(format!(
                "adaptor names should start with adaptor_; assuming you meant {}",
                sanitized
            ));
            sanitized
        };

        match (self.registry.remove(&id, policy), policy) {
            (Ok(offset), ShutdownPolicy::Gracefully) => {
                lines.push(format!("OK adaptor {} stopping gracefully at {}", id, offset))
            }
            (Ok(_), _) => lines.push(format!("OK adaptor {} stopped", id)),
            (Err(_), _) => lines.push(format!("FAIL: perhaps adaptor {} does not exist", id)),
        }
        Reply::lines(lines)
    }
}

/// TCP listener for the control protocol
pub struct ControlServer {
    listener: TcpListener,
    handler: Arc<ControlHandler>,
}

impl ControlServer {
    /// Bind the control port; loopback only unless `allow_remote`
    pub async fn bind(
        registry: Arc<AdaptorRegistry>,
        control: Arc<dyn AgentControl>,
        port: u16,
        allow_remote: bool,
    ) -> Result<Self> {
        let ip = if allow_remote {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let listener = TcpListener::bind(SocketAddr::new(ip, port))
            .await
            .with_context(|| format!("Failed to bind control port {}", port))?;
        let addr = listener.local_addr()?;
        info!(%addr, "control socket listening");

        let handler = Arc::new(ControlHandler::new(registry, control, addr.ip().to_string()));
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handler(&self) -> Arc<ControlHandler> {
        self.handler.clone()
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "new control connection");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    warn!(%peer, error = %e, "a control connection broke");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "control socket error"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("control socket closing");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<ControlHandler>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!("control connection idle, closing");
                return Ok(());
            }
        };
        if read == 0 {
            debug!("control connection closed");
            return Ok(());
        }

        let command = line.trim_end_matches(&['\r', '\n'][..]).to_string();
        debug!(command = %command, "control command");
        let worker = handler.clone();
        let line = command.clone();
        let reply = match tokio::task::spawn_blocking(move || worker.handle(&line)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(command = %command, error = %e, "control command panicked");
                Reply::line(format!("FAIL: {}", e))
            }
        };

        let mut out = String::new();
        for l in &reply.lines {
            out.push_str(l);
            out.push('\n');
        }
        write_half.write_all(out.as_bytes()).await?;
        write_half.flush().await?;

        match reply.after {
            After::Continue => {}
            After::Close => return Ok(()),
            After::StopAgent => {
                handler.control.request_stop();
                return Ok(());
            }
        }
    }
}
