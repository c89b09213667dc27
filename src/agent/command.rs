//! Control commands
//!
//! The line format is shared by the control socket, checkpoint files and the
//! initial-adaptors file. Lines are parsed into [`ControlCommand`] at the
//! boundary so nothing downstream re-parses strings.

use crate::adaptor::ShutdownPolicy;
use crate::error::{RegistryError, RegistryResult};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// `add [id=]<class> <datatype> [<params>] <offset>`, keyword case-blind
const ADD_PATTERN: &str =
    r"^[aA][dD][dD]\s+(?:([^\s=]+)\s*=\s*)?([^\s=]+)\s+(\S+)\s+(?:(.*?)\s+)?(\d+)\s*$";

fn add_regex() -> RegistryResult<&'static Regex> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ADD_PATTERN))
        .as_ref()
        .map_err(|e| RegistryError::BadSyntax(e.to_string()))
}

/// A parsed `add` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddCommand {
    pub id: Option<String>,
    pub class_name: String,
    pub data_type: String,
    pub params: String,
    pub offset: u64,
}

impl AddCommand {
    pub fn parse(line: &str) -> RegistryResult<Self> {
        let caps = add_regex()?
            .captures(line.trim_end())
            .ok_or_else(|| RegistryError::BadSyntax(line.to_string()))?;

        let offset = caps[5]
            .parse::<u64>()
            .map_err(|_| RegistryError::BadSyntax(line.to_string()))?;

        Ok(Self {
            id: caps.get(1).map(|m| m.as_str().to_string()),
            class_name: caps[2].to_string(),
            data_type: caps[3].to_string(),
            params: caps.get(4).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            offset,
        })
    }

    /// Render as a line that [`AddCommand::parse`] reads back identically
    pub fn to_line(&self) -> String {
        let mut line = String::from("ADD ");
        if let Some(id) = &self.id {
            line.push_str(id);
            line.push_str(" = ");
        }
        line.push_str(&self.class_name);
        line.push(' ');
        line.push_str(&self.data_type);
        line.push(' ');
        if !self.params.is_empty() {
            line.push_str(&self.params);
            line.push(' ');
        }
        line.push_str(&self.offset.to_string());
        line
    }
}

impl fmt::Display for AddCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// One line of the control protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Add(AddCommand),
    /// `shutdown <id>` is graceful, `stop <id>` is a hard stop
    Stop { id: String, policy: ShutdownPolicy },
    List,
    StopAll,
    StopAgent,
    ReloadCollectors,
    Help,
    Close,
    /// Blank line
    Status,
    Unknown(String),
}

impl ControlCommand {
    pub fn parse(line: &str) -> RegistryResult<Self> {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            return Ok(ControlCommand::Status);
        };

        let command = match keyword.to_ascii_lowercase().as_str() {
            "add" => ControlCommand::Add(AddCommand::parse(line.trim_start())?),
            "shutdown" | "stop" => {
                let id = words.next().ok_or_else(|| {
                    RegistryError::BadSyntax(
                        "need to specify an adaptor to shut down, by id".to_string(),
                    )
                })?;
                let policy = if keyword.eq_ignore_ascii_case("shutdown") {
                    ShutdownPolicy::Gracefully
                } else {
                    ShutdownPolicy::HardStop
                };
                ControlCommand::Stop {
                    id: id.to_string(),
                    policy,
                }
            }
            "list" => ControlCommand::List,
            "stopall" => ControlCommand::StopAll,
            "stopagent" => ControlCommand::StopAgent,
            "reloadcollectors" => ControlCommand::ReloadCollectors,
            "help" => ControlCommand::Help,
            "close" => ControlCommand::Close,
            _ => ControlCommand::Unknown(keyword.to_string()),
        };
        Ok(command)
    }
}
