use anyhow::{anyhow, bail};
use shakmaty::fen::Fen;
use shakmaty::san::{San, SanPlus};
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, Position};

use crate::game::record::{GameEndCause, GameOutcome};
use crate::util::Res;

/// The shadow board. Every player context keeps one, and the game manager
/// keeps the authoritative one. All rule questions (legality, SAN, game end)
/// are answered here; the harness itself never looks at squares.
#[derive(Debug, Clone)]
#[must_use]
pub struct GameState {
    start: Chess,
    startpos: bool,
    start_fen: String,
    pos: Chess,
    moves: Vec<Move>,
    lans: Vec<String>,
    /// Zobrist hash of every position so far, starting with the initial one.
    hashes: Vec<Zobrist64>,
}

impl Default for GameState {
    fn default() -> Self {
        Self::from_startpos()
    }
}

impl GameState {
    pub fn from_startpos() -> Self {
        Self::from_position(Chess::default(), true)
    }

    pub fn from_fen(fen: &str) -> Res<Self> {
        let parsed: Fen = fen
            .parse()
            .map_err(|err| anyhow!("Invalid FEN '{fen}': {err}"))?;
        let pos: Chess = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|err| anyhow!("Illegal position '{fen}': {err}"))?;
        Ok(Self::from_position(pos, false))
    }

    pub fn from_start(startpos: bool, fen: Option<&str>) -> Res<Self> {
        if startpos {
            Ok(Self::from_startpos())
        } else {
            let fen = fen.ok_or_else(|| anyhow!("A start position needs either 'startpos' or a FEN"))?;
            Self::from_fen(fen)
        }
    }

    fn from_position(pos: Chess, startpos: bool) -> Self {
        let start_fen = Fen::from_position(pos.clone(), EnPassantMode::Legal).to_string();
        let hash = pos.zobrist_hash(EnPassantMode::Legal);
        Self {
            start: pos.clone(),
            startpos,
            start_fen,
            pos,
            moves: vec![],
            lans: vec![],
            hashes: vec![hash],
        }
    }

    pub fn startpos(&self) -> bool {
        self.startpos
    }

    pub fn start_fen(&self) -> &str {
        &self.start_fen
    }

    pub fn current_fen(&self) -> String {
        Fen::from_position(self.pos.clone(), EnPassantMode::Legal).to_string()
    }

    pub fn side_to_move(&self) -> Color {
        self.pos.turn()
    }

    pub fn ply(&self) -> usize {
        self.moves.len()
    }

    pub fn move_lans(&self) -> &[String] {
        &self.lans
    }

    pub fn last_lan(&self) -> Option<&str> {
        self.lans.last().map(String::as_str)
    }

    /// Resolves a move string against the current position. With
    /// `require_lan` only long algebraic notation (`e2e4`, `e7e8q`) is
    /// accepted; otherwise SAN is tried as a fallback. The returned move is
    /// guaranteed legal.
    pub fn string_to_move(&self, text: &str, require_lan: bool) -> Res<Move> {
        let lan = text.parse::<UciMove>();
        match lan {
            Ok(uci) => uci
                .to_move(&self.pos)
                .map_err(|_err| anyhow!("Illegal move '{text}' in position {}", self.current_fen())),
            Err(_) if !require_lan => {
                let san: San = text
                    .parse()
                    .map_err(|_err| anyhow!("'{text}' is neither a LAN nor a SAN move"))?;
                san.to_move(&self.pos).map_err(|_err| {
                    anyhow!("The SAN move '{text}' doesn't match a legal move in {}", self.current_fen())
                })
            }
            Err(_) => bail!("'{text}' is not a move in long algebraic notation"),
        }
    }

    pub fn move_to_san(&self, mv: &Move) -> String {
        SanPlus::from_move(self.pos.clone(), mv).to_string()
    }

    pub fn move_to_lan(&self, mv: &Move) -> String {
        mv.to_uci(CastlingMode::Standard).to_string()
    }

    /// Applies a legal move. Callers obtain moves through
    /// [`Self::string_to_move`], which validates legality.
    pub fn do_move(&mut self, mv: &Move) {
        if !self.pos.is_legal(mv) {
            crate::fatal_invariant(&format!(
                "applying unvalidated move '{}' in '{}'",
                self.move_to_lan(mv),
                self.current_fen()
            ));
        }
        self.lans.push(self.move_to_lan(mv));
        self.moves.push(mv.clone());
        self.pos.play_unchecked(mv);
        self.hashes.push(self.pos.zobrist_hash(EnPassantMode::Legal));
    }

    /// Takes back the last move by replaying from the start position.
    /// Positions are immutable values, so this is the only way back; games
    /// are short enough that the replay cost never matters.
    pub fn undo_move(&mut self) {
        if self.moves.is_empty() {
            return;
        }
        _ = self.moves.pop();
        _ = self.lans.pop();
        _ = self.hashes.pop();
        let mut pos = self.start.clone();
        for mv in &self.moves {
            pos.play_unchecked(mv);
        }
        self.pos = pos;
    }

    fn repetition_count(&self) -> usize {
        let current = *self.hashes.last().unwrap();
        // Only positions inside the reversible window can repeat the current
        // one; anything before the last capture or pawn move differs.
        let window = self.pos.halfmoves() as usize;
        let from = self.hashes.len().saturating_sub(window + 1);
        self.hashes[from..].iter().filter(|&&h| h == current).count()
    }

    /// Board-derived game end detection. Timeout, illegal move and
    /// disconnect causes are decided by the player contexts, not here.
    pub fn game_result(&self) -> (GameEndCause, GameOutcome) {
        if self.pos.is_checkmate() {
            return (
                GameEndCause::Checkmate,
                GameOutcome::win_for(!self.pos.turn()),
            );
        }
        if self.pos.is_stalemate() {
            return (GameEndCause::Stalemate, GameOutcome::Draw);
        }
        if self.pos.is_insufficient_material() {
            return (GameEndCause::InsufficientMaterial, GameOutcome::Draw);
        }
        if self.pos.halfmoves() >= 100 {
            return (GameEndCause::FiftyMoveRule, GameOutcome::Draw);
        }
        if self.repetition_count() >= 3 {
            return (GameEndCause::Repetition, GameOutcome::Draw);
        }
        (GameEndCause::Ongoing, GameOutcome::Unterminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn play(state: &mut GameState, moves: &str) {
        for text in moves.split_whitespace() {
            let mv = state.string_to_move(text, false).unwrap();
            state.do_move(&mv);
        }
    }

    #[test]
    fn lan_and_san_resolve_to_the_same_move() {
        let state = GameState::from_startpos();
        let lan = state.string_to_move("g1f3", true).unwrap();
        let san = state.string_to_move("Nf3", false).unwrap();
        assert_eq!(lan, san);
        assert!(state.string_to_move("Nf3", true).is_err());
    }

    #[test]
    fn illegal_moves_are_rejected() {
        let state = GameState::from_startpos();
        assert!(state.string_to_move("e2e5", true).is_err());
        assert!(state.string_to_move("e7e5", true).is_err());
    }

    #[test]
    fn applying_a_legal_move_round_trips_through_fen() {
        let mut state = GameState::from_startpos();
        let mv = state.string_to_move("e2e4", true).unwrap();
        state.do_move(&mv);
        let reparsed = GameState::from_fen(&state.current_fen()).unwrap();
        assert_eq!(reparsed.current_fen(), state.current_fen());
    }

    #[test]
    fn undo_restores_the_previous_position() {
        let mut state = GameState::from_startpos();
        let before = state.current_fen();
        play(&mut state, "e4");
        state.undo_move();
        assert_eq!(state.current_fen(), before);
        assert_eq!(state.ply(), 0);
    }

    #[test]
    fn detects_checkmate() {
        let mut state = GameState::from_startpos();
        play(&mut state, "f3 e5 g4 Qh4");
        assert_eq!(
            state.game_result(),
            (GameEndCause::Checkmate, GameOutcome::BlackWins)
        );
    }

    #[test]
    fn detects_stalemate_and_insufficient_material() {
        let state = GameState::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        assert_eq!(
            state.game_result(),
            (GameEndCause::Stalemate, GameOutcome::Draw)
        );
        let state = GameState::from_fen("k7/8/8/8/8/8/8/KN6 w - - 0 1").unwrap();
        assert_eq!(
            state.game_result(),
            (GameEndCause::InsufficientMaterial, GameOutcome::Draw)
        );
    }

    #[test]
    fn detects_the_fifty_move_rule() {
        let mut state = GameState::from_fen("k7/8/8/8/8/8/8/K6R w - - 99 100").unwrap();
        play(&mut state, "h1h2");
        assert_eq!(
            state.game_result(),
            (GameEndCause::FiftyMoveRule, GameOutcome::Draw)
        );
    }

    #[test]
    fn detects_threefold_repetition_with_reversible_moves_only() {
        let mut state = GameState::from_startpos();
        play(&mut state, "Nf3 Nf6 Ng1 Ng8 Nf3 Nf6 Ng1 Ng8");
        assert_eq!(
            state.game_result(),
            (GameEndCause::Repetition, GameOutcome::Draw)
        );
    }

    #[test]
    fn a_pawn_move_resets_the_repetition_window() {
        let mut state = GameState::from_startpos();
        play(&mut state, "e4 e5 Nf3 Nf6 Ng1 Ng8 Nf3 Nf6 Ng1 Ng8");
        // The start position occurred once, the post-e4-e5 position counts
        // three times inside the window.
        assert_eq!(state.game_result().0, GameEndCause::Repetition);
        let mut state = GameState::from_startpos();
        play(&mut state, "Nf3 Nf6 Ng1 Ng8 e4");
        assert_eq!(state.game_result().0, GameEndCause::Ongoing);
    }
}
