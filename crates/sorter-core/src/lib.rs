//! sorter-core: Command arbitration for a produce sorting machine
//!
//! This crate decides which command drives the sorter at any moment, given
//! four competing command sources and three streams of control flags.
//!
//! # Architecture
//!
//! ```text
//! technician / call center / panel / safety monitor
//!                    ↓
//!             Command Intake ──→ Control Flag Tracker (session rollover)
//!                    ↓
//!              Command Queue
//!                    ↓
//!          Arbitration Engine ──→ Safety Stop Generator
//!                    ↓                     │
//!             Current Command  ←───────────┘ (via intake)
//! ```
//!
//! # Modules
//!
//! - `registry`: Command tokens, actuator commands and panel classes
//! - `flags`: Registration, disable/enable and remote-session streams
//! - `intake`: Single entry point for incoming commands, with dedup
//! - `queue`: Ordered, append-only command queue
//! - `arbitration`: Authority rules and the current command
//! - `safety`: Fault/disable/rejection driven self stops, warnings
//! - `controller`: Thread-safe façade tying the pipeline together
//! - `scenario`: Scripted action sequences for replay and the `run` loop
//! - `clock`: Injectable time source
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod arbitration;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod flags;
pub mod intake;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod safety;
pub mod scenario;

pub use controller::SorterController;
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
