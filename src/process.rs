//! Data structures for tracking supervised processes.
//!
//! This module defines what to launch (`ProcessSpec`), the supervisor's life
//! cycle (`ServiceState`) and the snapshot handed to callers
//! (`ServiceProcessHandle`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Specification for a process to be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// The command executable.
    pub cmd: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Environment variables added to the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Splits a shell-style command line into program and arguments.
    pub fn parse(command_line: &str) -> Result<Self, shell_words::ParseError> {
        let mut parts = shell_words::split(command_line)?.into_iter();
        let cmd = parts.next().unwrap_or_default();
        Ok(Self {
            cmd,
            args: parts.collect(),
            cwd: None,
            env: BTreeMap::new(),
        })
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.cmd.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// Life cycle of a supervised service.
///
/// `Stopped → Starting → Running → Stopping → Stopped`, with `Errored`
/// reachable from `Starting` and `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

impl ServiceState {
    /// Whether `start()` may be called from this state.
    pub fn can_start(self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Errored)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Snapshot of one logical service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProcessHandle {
    pub logical_name: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub state: ServiceState,
    /// Last failure, shown verbatim to the user.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_command_lines() {
        let spec = ProcessSpec::parse(r#"node "web app/server.js" --trace"#).unwrap();
        assert_eq!(spec.cmd, "node");
        assert_eq!(spec.args, vec!["web app/server.js", "--trace"]);
        assert_eq!(spec.display(), "node 'web app/server.js' --trace");
    }

    #[test]
    fn only_stopped_or_errored_can_start() {
        assert!(ServiceState::Stopped.can_start());
        assert!(ServiceState::Errored.can_start());
        assert!(!ServiceState::Starting.can_start());
        assert!(!ServiceState::Running.can_start());
        assert!(!ServiceState::Stopping.can_start());
    }
}
