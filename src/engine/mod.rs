/// The protocol-agnostic adapter contract.
pub mod adapter;
/// Engine configuration values and the configuration manager.
pub mod config;
/// Typed events parsed from engine output.
pub mod event;
/// Declared engine options and value validation.
pub mod options;
/// The subprocess host.
pub mod process;
/// The UCI adapter.
pub mod uci;
/// The engine worker: one process, one adapter, two threads.
pub mod worker;
/// The XBoard adapter.
pub mod xboard;

pub use adapter::Protocol;
pub use config::EngineConfig;
pub use event::{EngineEvent, EngineEventKind, SearchInfo};
pub use worker::EngineWorker;

/// Everything that can go wrong around an engine, by kind. Configuration
/// problems abort setup; the engine-side kinds never escape to the pool,
/// they end the affected operation and usually the game. `Internal` is
/// reserved for states the harness must never reach.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("engine '{engine}' terminated unexpectedly")]
    Disconnect { engine: String },
    #[error("engine '{engine}' didn't answer with '{expected}' in time")]
    HandshakeTimeout {
        engine: String,
        expected: &'static str,
    },
    #[error("engine '{engine}' violated the protocol: {what}")]
    ProtocolViolation { engine: String, what: String },
    #[error("engine '{engine}' exceeded its time allowance: {what}")]
    TimeViolation { engine: String, what: String },
    #[error("harness invariant violated: {0}")]
    Internal(String),
}
