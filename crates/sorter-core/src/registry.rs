//! Command registry: the static token table every queued command resolves through.
//!
//! A token names something a sender may ask for (`start_aa`, `panel_off`,
//! `self_stop`, ...). The registry maps it to the actuator command the executor
//! understands, the panel-state class the machine will be in once it applies,
//! the operating mode that governs who may issue it, and an optional timeout.
//!
//! The table is built once at startup, either from [`CommandRegistry::builtin`]
//! or from the `[[commands]]` config table, and never changes afterwards.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Token of the canonical stop the safety monitor issues.
pub const SELF_STOP_TOKEN: &str = "self_stop";

/// Prefix of the synthesized token a panel selection resolves through.
pub const PANEL_TOKEN_PREFIX: &str = "panel_";

// =============================================================================
// Panel classes and modes
// =============================================================================

/// Equivalent panel-state class of a command.
///
/// `aa`, `a` and `b` are the sorting grades; the machine is "running" while
/// its current command is in one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelClass {
    Aa,
    A,
    B,
    Color,
    Off,
    Service,
    Link,
}

impl PanelClass {
    pub const ALL: [Self; 7] = [
        Self::Aa,
        Self::A,
        Self::B,
        Self::Color,
        Self::Off,
        Self::Service,
        Self::Link,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aa => "aa",
            Self::A => "a",
            Self::B => "b",
            Self::Color => "color",
            Self::Off => "off",
            Self::Service => "service",
            Self::Link => "link",
        }
    }

    /// Whether the class is one of the running grades (`aa`, `a`, `b`).
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Aa | Self::A | Self::B)
    }
}

impl fmt::Display for PanelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PanelClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("unknown panel class: {s}. Expected one of: aa, a, b, color, off, service, link")
            })
    }
}

/// Operating mode a command requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Production sorting; authority follows registration, remote and disable flags.
    Operational,
    /// Maintenance; authority belongs to whoever holds the remote session, else the panel.
    Setup,
}

impl OperatingMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Setup => "setup",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Definitions
// =============================================================================

/// One immutable registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub token: String,
    /// Command string handed to the executor (`ALL_START`, `ALL_STOP`, ...).
    pub actuator_command: String,
    pub panel_class: PanelClass,
    pub mode: OperatingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CommandDefinition {
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        actuator_command: impl Into<String>,
        panel_class: PanelClass,
        mode: OperatingMode,
    ) -> Self {
        Self {
            token: token.into(),
            actuator_command: actuator_command.into(),
            panel_class,
            mode,
            timeout_secs: None,
        }
    }

    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Token a panel selection of `class` resolves through.
#[must_use]
pub fn panel_token(class: PanelClass) -> String {
    format!("{PANEL_TOKEN_PREFIX}{class}")
}

// =============================================================================
// Registry
// =============================================================================

/// Token → definition table. Cheap to clone; definitions are shared.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    by_token: HashMap<String, Arc<CommandDefinition>>,
}

impl CommandRegistry {
    /// Build a registry, validating the table.
    ///
    /// Every panel class gets a `panel_<class>` row if the table does not
    /// already supply one, so panel selections always resolve. A supplied
    /// `panel_<class>` row must carry that same class.
    pub fn new(definitions: Vec<CommandDefinition>) -> Result<Self, RegistryError> {
        if definitions.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut by_token = HashMap::with_capacity(definitions.len() + PanelClass::ALL.len());
        for def in definitions {
            if def.token.trim().is_empty() {
                return Err(RegistryError::BlankToken);
            }
            if by_token.contains_key(&def.token) {
                return Err(RegistryError::DuplicateToken(def.token));
            }
            by_token.insert(def.token.clone(), Arc::new(def));
        }

        match by_token.get(SELF_STOP_TOKEN) {
            None => return Err(RegistryError::MissingSelfStop(SELF_STOP_TOKEN.to_string())),
            Some(def)
                if def.panel_class != PanelClass::Off || def.mode != OperatingMode::Operational =>
            {
                return Err(RegistryError::InvalidSelfStop {
                    token: SELF_STOP_TOKEN.to_string(),
                });
            }
            Some(_) => {}
        }

        for class in PanelClass::ALL {
            let token = panel_token(class);
            match by_token.get(&token) {
                Some(def) if def.panel_class != class => {
                    return Err(RegistryError::PanelClassMismatch {
                        expected: class,
                        found: def.panel_class,
                        token,
                    });
                }
                Some(_) => {}
                None => {
                    by_token.insert(token, Arc::new(default_panel_definition(class)));
                }
            }
        }

        Ok(Self { by_token })
    }

    /// The factory command table.
    #[must_use]
    pub fn builtin() -> Self {
        let by_token = builtin_definitions()
            .into_iter()
            .map(|def| (def.token.clone(), Arc::new(def)))
            .collect();
        Self { by_token }
    }

    pub fn lookup(&self, token: &str) -> Result<Arc<CommandDefinition>, RegistryError> {
        self.by_token
            .get(token)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))
    }

    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.by_token.contains_key(token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Definitions sorted by token, for display.
    #[must_use]
    pub fn definitions(&self) -> Vec<Arc<CommandDefinition>> {
        let mut defs: Vec<_> = self.by_token.values().cloned().collect();
        defs.sort_by(|a, b| a.token.cmp(&b.token));
        defs
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

const START_STOP_TIMEOUT_SECS: u64 = 100;

fn default_panel_definition(class: PanelClass) -> CommandDefinition {
    let token = panel_token(class);
    match class {
        PanelClass::Aa | PanelClass::A | PanelClass::B | PanelClass::Color => {
            CommandDefinition::new(token, "ALL_START", class, OperatingMode::Operational)
                .with_timeout_secs(START_STOP_TIMEOUT_SECS)
        }
        PanelClass::Off => CommandDefinition::new(token, "ALL_STOP", class, OperatingMode::Operational)
            .with_timeout_secs(START_STOP_TIMEOUT_SECS),
        PanelClass::Service => {
            CommandDefinition::new(token, "SERVICE_MODE", class, OperatingMode::Setup)
        }
        PanelClass::Link => CommandDefinition::new(token, "LINK_MODE", class, OperatingMode::Setup),
    }
}

fn builtin_definitions() -> Vec<CommandDefinition> {
    use OperatingMode::{Operational, Setup};

    let mut defs: Vec<CommandDefinition> = PanelClass::ALL
        .into_iter()
        .map(default_panel_definition)
        .collect();

    for class in [PanelClass::Aa, PanelClass::A, PanelClass::B, PanelClass::Color] {
        defs.push(
            CommandDefinition::new(format!("start_{class}"), "ALL_START", class, Operational)
                .with_timeout_secs(START_STOP_TIMEOUT_SECS),
        );
    }
    defs.push(
        CommandDefinition::new("stop", "ALL_STOP", PanelClass::Off, Operational)
            .with_timeout_secs(START_STOP_TIMEOUT_SECS),
    );
    defs.push(
        CommandDefinition::new(SELF_STOP_TOKEN, "ALL_STOP", PanelClass::Off, Operational)
            .with_timeout_secs(START_STOP_TIMEOUT_SECS),
    );
    defs.push(CommandDefinition::new("service", "SERVICE_MODE", PanelClass::Service, Setup));
    defs.push(CommandDefinition::new("link", "LINK_MODE", PanelClass::Link, Setup));
    defs.push(CommandDefinition::new(
        "calibrate_camera",
        "CALIBRATE_CAMERA",
        PanelClass::Service,
        Setup,
    ));
    defs.push(CommandDefinition::new("eject_test", "EJECT_TEST", PanelClass::Service, Setup));
    defs
}
