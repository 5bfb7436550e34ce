//! `calipers` is a test harness for chess engines that speak UCI or XBoard.
//! It drives engine executables as child processes, plays games between them
//! under configurable time controls, validates protocol behaviour against a
//! checklist, and produces tournament results including SPRT verdicts.

use std::fmt::{Display, Formatter};

/// Command line argument handling.
pub mod cli;
/// Everything that talks to an engine process: the process host, the UCI and
/// XBoard adapters, and the worker that serializes commands to one engine.
pub mod engine;
/// EPD reading and the EPD suite task provider.
pub mod epd;
/// Board shadowing and game records.
pub mod game;
/// The process-wide logging service.
pub mod logger;
/// Opening books and rotation policies.
pub mod openings;
/// PGN writing and reading.
pub mod pgn;
/// Running games: player contexts, the game manager and the manager pool.
pub mod play;
/// The checklist: named check topics and per-engine reports.
pub mod report;
/// Time controls and per-move search limits.
pub mod time;
/// Pair and gauntlet tournaments and the SPRT evaluator.
pub mod tourney;
/// Small parsing helpers shared by everything else.
pub mod util;

pub use util::Res;

/// Process exit code, escalating with the severity of what the checklist
/// recorded. Later variants win when combining.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[must_use]
pub enum AppReturnCode {
    #[default]
    NoError = 0,
    /// At least one Notes-class check failed.
    EngineNote = 1,
    /// At least one Misbehaviour-class check failed.
    EngineMisbehaviour = 2,
    /// At least one Important-class check failed, or an engine was lost.
    EngineError = 3,
    /// Invalid command line or configuration; nothing was run.
    ConfigError = 4,
    /// A harness invariant was violated.
    InternalError = 5,
}

impl AppReturnCode {
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl Display for AppReturnCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AppReturnCode::NoError => "no error",
            AppReturnCode::EngineNote => "engine notes",
            AppReturnCode::EngineMisbehaviour => "engine misbehaviour",
            AppReturnCode::EngineError => "engine error",
            AppReturnCode::ConfigError => "configuration error",
            AppReturnCode::InternalError => "internal error",
        };
        write!(f, "{text}")
    }
}

/// Reports a state the harness must never reach and exits the process.
/// These checks stay active in release builds: continuing past a broken
/// invariant would corrupt results, so there is nothing to recover to.
pub fn fatal_invariant(message: &str) -> ! {
    let error = engine::EngineError::Internal(message.to_string());
    logger::log(logger::Message::Error, &error.to_string());
    std::process::exit(AppReturnCode::InternalError.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_escalate() {
        assert_eq!(
            AppReturnCode::NoError.combine(AppReturnCode::EngineNote),
            AppReturnCode::EngineNote
        );
        assert_eq!(
            AppReturnCode::EngineError.combine(AppReturnCode::EngineNote),
            AppReturnCode::EngineError
        );
        assert_eq!(AppReturnCode::EngineMisbehaviour.exit_code(), 2);
    }
}
