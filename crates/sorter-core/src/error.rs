//! Error types for sorter-core

use std::fmt::Write;
use thiserror::Error;

use crate::flags::FlagKind;
use crate::queue::QueuedCommandId;
use crate::registry::PanelClass;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an operator
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sorter-core
#[derive(Error, Debug)]
pub enum Error {
    /// Command registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Internal state no longer satisfies a structural invariant
    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// Arbitration is halted until an operator intervenes
    #[error("Arbitration halted: {0}")]
    Halted(InvariantViolation),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Operator guidance for this error, if any
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Registry(err) => Some(err.remediation()),
            Self::Invariant(violation) | Self::Halted(violation) => Some(violation.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the scenario or config path exists and is readable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Each stdin line must be one complete JSON action object."),
            ),
        }
    }

    /// Whether this error leaves the controller unable to arbitrate
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Halted(_))
    }
}

/// Command registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown command token: {0}")]
    NotFound(String),

    #[error("command registry is empty")]
    Empty,

    #[error("duplicate command token: {0}")]
    DuplicateToken(String),

    #[error("command token must not be blank")]
    BlankToken,

    #[error("registry has no `{0}` command")]
    MissingSelfStop(String),

    #[error("`{token}` must map to panel class off in operational mode")]
    InvalidSelfStop { token: String },

    #[error("`{token}` must map to panel class {expected}, found {found}")]
    PanelClassMismatch {
        token: String,
        expected: PanelClass,
        found: PanelClass,
    },
}

impl RegistryError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound(token) => Remediation::new(format!(
                "Command `{token}` is not in the registry. Check the sender's token table."
            ))
            .command("List commands", "sorter registry"),
            Self::Empty | Self::BlankToken | Self::DuplicateToken(_) => {
                Remediation::new("Fix the [[commands]] table in the config file.")
                    .command("Validate config", "sorter check-config")
                    .alternative("Remove the [[commands]] table to use the built-in registry.")
            }
            Self::MissingSelfStop(_) | Self::InvalidSelfStop { .. } => Remediation::new(
                "The registry must define self_stop as an operational off command.",
            )
            .command("Validate config", "sorter check-config"),
            Self::PanelClassMismatch { token, expected, .. } => Remediation::new(format!(
                "Set panel_class = \"{expected}\" on `{token}` or drop the row to use the default."
            ))
            .command("Validate config", "sorter check-config"),
        }
    }
}

/// Structural invariants that arbitration refuses to continue past
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("{count} {kind} events are marked latest")]
    MultipleLatest { kind: FlagKind, count: usize },

    #[error("queue entry {0} was evaluated twice")]
    EvaluatedTwice(QueuedCommandId),

    #[error("queue entry {0} does not exist")]
    MissingEntry(QueuedCommandId),

    #[error("queue entry {0} is out of order with the arbitration cursor")]
    OutOfOrder(QueuedCommandId),
}

impl InvariantViolation {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        Remediation::new(
            "Arbitration is halted. Inspect flag and queue state before resuming.",
        )
        .command("Inspect state", "sorter replay <scenario.json>")
        .alternative("Resume only after the duplicate or missing record has been corrected.")
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Validate config", "sorter check-config"),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Correct the reported value.")
                    .command("Validate config", "sorter check-config")
            }
        }
    }
}
