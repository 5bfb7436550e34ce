/// Gauntlet scheduling: one engine against a field of opponents.
pub mod gauntlet;
/// Pair tournaments with color swaps, opening rotation and persistence.
pub mod pair;
/// Duel and tournament result accounting.
pub mod result;
/// The sequential probability ratio test.
pub mod sprt;

pub use pair::{PairSettings, PairTournament};
pub use result::{EngineDuelResult, TournamentResult};
pub use sprt::{SprtConfig, SprtDecision, SprtEvaluator, SprtRun};
