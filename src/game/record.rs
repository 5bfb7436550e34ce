use std::collections::BTreeMap;

use shakmaty::Color;
use strum_macros::{Display, EnumString};

use crate::time::TimeControl;

/// Why a game ended. `Ongoing` pairs exactly with
/// [`GameOutcome::Unterminated`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
#[must_use]
pub enum GameEndCause {
    #[default]
    Ongoing,
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    FiftyMoveRule,
    Repetition,
    Timeout,
    IllegalMove,
    Disconnected,
    Adjudication,
    Aborted,
}

impl GameEndCause {
    /// Causes set by the player contexts override causes derived from the
    /// board when both fire on the same move.
    pub fn from_harness(self) -> bool {
        matches!(
            self,
            GameEndCause::Timeout | GameEndCause::IllegalMove | GameEndCause::Disconnected
        )
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Display, EnumString)]
#[must_use]
pub enum GameOutcome {
    #[default]
    Unterminated,
    WhiteWins,
    BlackWins,
    Draw,
}

impl GameOutcome {
    pub fn win_for(color: Color) -> Self {
        match color {
            Color::White => GameOutcome::WhiteWins,
            Color::Black => GameOutcome::BlackWins,
        }
    }

    pub fn loss_for(color: Color) -> Self {
        Self::win_for(!color)
    }

    /// The PGN `Result` tag value.
    pub fn as_pgn(self) -> &'static str {
        match self {
            GameOutcome::Unterminated => "*",
            GameOutcome::WhiteWins => "1-0",
            GameOutcome::BlackWins => "0-1",
            GameOutcome::Draw => "1/2-1/2",
        }
    }
}

/// One played half-move together with the last search snapshot the engine
/// reported before committing to it.
#[derive(Debug, Default, Clone, PartialEq)]
#[must_use]
pub struct MoveRecord {
    pub lan: String,
    pub san: String,
    pub comment: String,
    pub nag: Option<u8>,
    /// Measured from the instant the `go` line was handed to the OS to the
    /// instant the `bestmove` line was read.
    pub time_ms: u64,
    pub score_cp: Option<i32>,
    pub score_mate: Option<i32>,
    pub depth: u32,
    pub seldepth: u32,
    pub multipv: u32,
    pub nodes: u64,
    pub pv: Vec<String>,
}

impl MoveRecord {
    /// The PGN brace-comment annotation, e.g. `+0.21/12 0.53s`.
    pub fn annotation(&self) -> Option<String> {
        let score = match (self.score_mate, self.score_cp) {
            (Some(mate), _) => format!("{}M{}", if mate >= 0 { "+" } else { "-" }, mate.abs()),
            (None, Some(cp)) => format!("{}{:.2}", if cp >= 0 { "+" } else { "" }, cp as f64 / 100.0),
            (None, None) => return None,
        };
        Some(format!(
            "{score}/{depth} {time:.2}s",
            depth = self.depth,
            time = self.time_ms as f64 / 1000.0
        ))
    }
}

/// Everything there is to know about one game: where it started, who played,
/// what was played, and how it ended.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct GameRecord {
    pub startpos: bool,
    /// The FEN of the start position; ignored when `startpos` is set.
    pub fen: Option<String>,
    pub white_name: String,
    pub black_name: String,
    pub round: u32,
    pub tags: BTreeMap<String, String>,
    pub moves: Vec<MoveRecord>,
    /// Index into `moves` used when replaying a partially played record.
    pub current_ply: usize,
    pub white_tc: TimeControl,
    pub black_tc: TimeControl,
    cause: GameEndCause,
    outcome: GameOutcome,
}

impl GameRecord {
    pub fn new(startpos: bool, fen: Option<String>) -> Self {
        Self {
            startpos,
            fen,
            ..Self::default()
        }
    }

    pub fn cause(&self) -> GameEndCause {
        self.cause
    }

    pub fn outcome(&self) -> GameOutcome {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.cause != GameEndCause::Ongoing
    }

    /// Sets the result pair, keeping `cause == Ongoing ⟺ outcome ==
    /// Unterminated`. A harness-decided cause (timeout, illegal move,
    /// disconnect) is never downgraded to a board-derived one.
    pub fn set_result(&mut self, cause: GameEndCause, outcome: GameOutcome) {
        if (cause == GameEndCause::Ongoing) != (outcome == GameOutcome::Unterminated) {
            crate::fatal_invariant(&format!("mismatched game result pair {cause}/{outcome}"));
        }
        if self.cause.from_harness() && !cause.from_harness() {
            return;
        }
        self.cause = cause;
        self.outcome = outcome;
    }

    pub fn push_move(&mut self, record: MoveRecord) {
        self.moves.push(record);
        self.current_ply = self.moves.len();
    }

    pub fn name_of(&self, color: Color) -> &str {
        match color {
            Color::White => &self.white_name,
            Color::Black => &self.black_name,
        }
    }

    pub fn tc_of(&self, color: Color) -> &TimeControl {
        match color {
            Color::White => &self.white_tc,
            Color::Black => &self.black_tc,
        }
    }

    /// The `Termination` PGN tag value for this record.
    pub fn termination(&self) -> &'static str {
        match self.cause {
            GameEndCause::Ongoing => "unterminated",
            GameEndCause::Timeout => "time forfeit",
            GameEndCause::IllegalMove => "rules infraction",
            GameEndCause::Disconnected => "abandoned",
            GameEndCause::Adjudication => "adjudication",
            GameEndCause::Aborted => "abandoned",
            _ => "normal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_causes_win_conflicts() {
        let mut record = GameRecord::new(true, None);
        record.set_result(GameEndCause::Timeout, GameOutcome::BlackWins);
        // A board-derived cause arriving for the same move must not override.
        record.set_result(GameEndCause::Checkmate, GameOutcome::WhiteWins);
        assert_eq!(record.cause(), GameEndCause::Timeout);
        assert_eq!(record.outcome(), GameOutcome::BlackWins);
    }

    #[test]
    fn annotation_formats_score_and_depth() {
        let record = MoveRecord {
            score_cp: Some(21),
            depth: 12,
            time_ms: 530,
            ..MoveRecord::default()
        };
        assert_eq!(record.annotation().unwrap(), "+0.21/12 0.53s");
        let mate = MoveRecord {
            score_mate: Some(-3),
            depth: 20,
            time_ms: 1000,
            ..MoveRecord::default()
        };
        assert_eq!(mate.annotation().unwrap(), "-M3/20 1.00s");
    }
}
