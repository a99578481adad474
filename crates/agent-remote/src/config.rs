//! Tool server launch and supervision settings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RemoteError, Result};

/// How to launch and supervise one tool server process
#[derive(Clone, Debug)]
pub struct RemoteSessionConfig {
    /// Label used in logs
    pub name: String,

    /// Program to execute
    pub command: String,

    pub args: Vec<String>,

    /// Extra environment variables for the child
    pub env: HashMap<String, String>,

    /// Working directory for the child (inherits ours when unset)
    pub working_dir: Option<PathBuf>,

    /// Deadline for each `tools/call` and `tools/list`
    pub request_timeout: Duration,

    /// Deadline for the `initialize` handshake
    pub init_timeout: Duration,

    /// Grace period between closing stdin and killing the child
    pub shutdown_timeout: Duration,

    /// Timeouts in a row tolerated before the process is presumed wedged
    pub max_consecutive_timeouts: u32,

    /// Respawns allowed over the session's lifetime
    pub restart_budget: u32,
}

impl Default for RemoteSessionConfig {
    fn default() -> Self {
        Self {
            name: "tools".into(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            request_timeout: Duration::from_secs(60),
            init_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            max_consecutive_timeouts: 3,
            restart_budget: 3,
        }
    }
}

impl RemoteSessionConfig {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Split a shell-style command line into program and arguments
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut words = shell_words::split(line)
            .map_err(|e| RemoteError::Config(format!("cannot parse command line {line:?}: {e}")))?
            .into_iter();
        let command = words
            .next()
            .ok_or_else(|| RemoteError::Config("empty tool server command".into()))?;
        Ok(Self::new(command, words))
    }

    /// Read settings from `TOOL_SERVER_*` variables.
    ///
    /// Returns `Ok(None)` when `TOOL_SERVER_COMMAND` is unset or blank.
    pub fn from_env() -> Result<Option<Self>> {
        let line = match std::env::var("TOOL_SERVER_COMMAND") {
            Ok(line) if !line.trim().is_empty() => line,
            _ => return Ok(None),
        };
        let mut config = Self::from_command_line(&line)?;

        if let Ok(name) = std::env::var("TOOL_SERVER_NAME") {
            config.name = name;
        }
        if let Ok(dir) = std::env::var("TOOL_SERVER_CWD") {
            config.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = parse_env::<u64>("TOOL_SERVER_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("TOOL_SERVER_INIT_TIMEOUT_SECS")? {
            config.init_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse_env::<u32>("TOOL_SERVER_MAX_TIMEOUTS")? {
            config.max_consecutive_timeouts = max;
        }
        if let Some(budget) = parse_env::<u32>("TOOL_SERVER_RESTART_BUDGET")? {
            config.restart_budget = budget;
        }

        config.validate()?;
        Ok(Some(config))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub const fn with_restart_budget(mut self, budget: u32) -> Self {
        self.restart_budget = budget;
        self
    }

    pub const fn with_max_consecutive_timeouts(mut self, max: u32) -> Self {
        self.max_consecutive_timeouts = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(RemoteError::Config("empty tool server command".into()));
        }
        if self.request_timeout.is_zero() || self.init_timeout.is_zero() {
            return Err(RemoteError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RemoteError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
