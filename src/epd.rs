use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context};
use itertools::Itertools;

use crate::game::{GameRecord, GameState};
use crate::logger::{self, Message};
use crate::play::task::{GameTask, TaskProvider, TaskType};
use crate::time::TimeControl;
use crate::util::Res;

/// One EPD record: the position, its name, and the expected best moves
/// (kept in LAN, resolved at parse time).
#[derive(Debug, Clone)]
#[must_use]
pub struct EpdPosition {
    pub fen: String,
    pub id: String,
    pub best_moves_lan: Vec<String>,
    pub operations: Vec<(String, String)>,
}

/// Parses one EPD line: four FEN fields followed by `;`-terminated
/// opcode/operand pairs. `bm` operands are SAN and get resolved against the
/// position.
pub fn parse_epd_line(line: &str, fallback_id: usize) -> Res<EpdPosition> {
    let fen_fields: Vec<&str> = line.split_whitespace().take(4).collect();
    if fen_fields.len() < 4 {
        bail!("EPD line has fewer than four position fields: '{line}'")
    }
    let fen = format!("{} 0 1", fen_fields.iter().join(" "));
    let state =
        GameState::from_fen(&fen).with_context(|| format!("Invalid EPD position '{line}'"))?;

    let rest = line
        .split_whitespace()
        .skip(4)
        .join(" ");
    let mut operations = vec![];
    for op in rest.split(';') {
        let op = op.trim();
        if op.is_empty() {
            continue;
        }
        let (opcode, operand) = op.split_once(' ').unwrap_or((op, ""));
        operations.push((opcode.to_string(), operand.trim().trim_matches('"').to_string()));
    }
    let id = operations
        .iter()
        .find(|(op, _)| op == "id")
        .map(|(_, operand)| operand.clone())
        .unwrap_or_else(|| format!("position {fallback_id}"));
    let mut best_moves_lan = vec![];
    if let Some((_, bm)) = operations.iter().find(|(op, _)| op == "bm") {
        for san in bm.split_whitespace() {
            let mv = state
                .string_to_move(san, false)
                .map_err(|err| anyhow!("Bad bm operand in '{id}': {err}"))?;
            best_moves_lan.push(state.move_to_lan(&mv));
        }
    }
    Ok(EpdPosition {
        fen,
        id,
        best_moves_lan,
        operations,
    })
}

pub fn read_epd(text: &str) -> Res<Vec<EpdPosition>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(num, line)| parse_epd_line(line, num))
        .collect()
}

pub fn read_epd_file(path: &Path) -> Res<Vec<EpdPosition>> {
    read_epd(&fs::read_to_string(path)?)
        .with_context(|| format!("Couldn't read EPD suite '{}'", path.display()))
}

#[derive(Debug, Default)]
struct SuiteState {
    next: usize,
    /// One slot per position: solved or not, `None` while unplayed.
    results: Vec<Option<bool>>,
    /// The position each engine is currently analyzing, plus when its pv
    /// first matched an expected best move.
    in_flight: HashMap<String, (usize, Option<u64>)>,
}

/// Runs an engine over an EPD suite, one search per position. A position
/// counts as solved when the played move is among the `bm` operands; the
/// search is cut short once the engine's pv has held a best move for the
/// configured time.
#[derive(Debug)]
pub struct EpdSuite {
    name: String,
    positions: Vec<EpdPosition>,
    movetime_ms: u64,
    /// How long the pv must keep naming a best move before an early stop.
    early_stop_hold_ms: u64,
    state: Mutex<SuiteState>,
}

impl EpdSuite {
    pub fn new(name: &str, positions: Vec<EpdPosition>, movetime_ms: u64) -> Self {
        let results = vec![None; positions.len()];
        Self {
            name: name.to_string(),
            positions,
            movetime_ms,
            early_stop_hold_ms: 1000,
            state: Mutex::new(SuiteState {
                next: 0,
                results,
                in_flight: HashMap::new(),
            }),
        }
    }

    pub fn solved(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        let solved = state.results.iter().flatten().filter(|&&ok| ok).count();
        let played = state.results.iter().flatten().count();
        (solved, played)
    }

    pub fn summary(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        let mut solved = 0_usize;
        for (position, result) in self.positions.iter().zip(&state.results) {
            let verdict = match result {
                Some(true) => {
                    solved += 1;
                    "solved"
                }
                Some(false) => "missed",
                None => "not played",
            };
            _ = writeln!(out, "  {}: {verdict}", position.id);
        }
        _ = write!(
            out,
            "{}: {solved} of {} positions solved",
            self.name,
            self.positions.len()
        );
        out
    }
}

impl TaskProvider for EpdSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_task(&self, white_id: &str, _black_id: &str) -> Option<GameTask> {
        let mut state = self.state.lock().unwrap();
        let index = state.next;
        if index >= self.positions.len() {
            return None;
        }
        state.next += 1;
        _ = state.in_flight.insert(white_id.to_string(), (index, None));
        drop(state);

        let position = &self.positions[index];
        let mut record = GameRecord::new(false, Some(position.fen.clone()));
        record.white_tc = TimeControl::fixed_movetime(self.movetime_ms);
        record.black_tc = record.white_tc.clone();
        Some(GameTask {
            task_type: TaskType::ComputeMove,
            record,
            task_id: index,
            switch_side: false,
            round: index as u32 + 1,
        })
    }

    fn set_game_record(&self, task_id: usize, record: &GameRecord) {
        let position = &self.positions[task_id];
        let solved = record
            .moves
            .first()
            .is_some_and(|mv| position.best_moves_lan.contains(&mv.lan));
        let mut state = self.state.lock().unwrap();
        state.results[task_id] = Some(solved);
        drop(state);
        logger::log(
            Message::Info,
            &format!(
                "{}: {} ({})",
                position.id,
                if solved { "solved" } else { "missed" },
                record
                    .moves
                    .first()
                    .map_or("no move", |mv| mv.san.as_str())
            ),
        );
    }

    fn set_pv(
        &self,
        engine_id: &str,
        pv: &[String],
        elapsed_ms: u64,
        _depth: u32,
        _nodes: u64,
        multipv: u32,
    ) -> bool {
        if multipv > 1 {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        let Some((task_id, matched_since)) = state.in_flight.get_mut(engine_id) else {
            return false;
        };
        let position = &self.positions[*task_id];
        let head_matches = pv
            .first()
            .is_some_and(|lan| position.best_moves_lan.contains(lan));
        if !head_matches {
            *matched_since = None;
            return false;
        }
        match *matched_since {
            None => {
                *matched_since = Some(elapsed_ms);
                false
            }
            Some(since) => elapsed_ms.saturating_sub(since) >= self.early_stop_hold_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameOutcome, MoveRecord};
    use pretty_assertions::assert_eq;

    const WAC_LINE: &str =
        r#"2rr3k/pp3pp1/1nnqbN1p/3pN3/2pP4/2P3Q1/PPB4P/R4RK1 w - - bm Qg6; id "WAC.001";"#;

    #[test]
    fn parses_fen_bm_and_id() {
        let position = parse_epd_line(WAC_LINE, 0).unwrap();
        assert_eq!(position.id, "WAC.001");
        assert_eq!(position.best_moves_lan, vec!["g3g6"]);
        assert!(position.fen.starts_with("2rr3k/"));
        assert!(position.fen.ends_with(" 0 1"));
    }

    #[test]
    fn rejects_unresolvable_best_moves() {
        let line = "8/8/8/8/8/4k3/8/4K3 w - - bm Qg6; id \"bad\";";
        assert!(parse_epd_line(line, 0).is_err());
    }

    #[test]
    fn suite_counts_solved_positions() {
        let suite = EpdSuite::new("wac", vec![parse_epd_line(WAC_LINE, 0).unwrap()], 100);
        let task = suite.next_task("tester", "tester").unwrap();
        assert_eq!(task.task_type, TaskType::ComputeMove);
        assert!(suite.next_task("tester", "tester").is_none());

        let mut record = task.record;
        record.push_move(MoveRecord {
            lan: "g3g6".to_string(),
            san: "Qg6".to_string(),
            ..MoveRecord::default()
        });
        suite.set_game_record(0, &record);
        assert_eq!(suite.solved(), (1, 1));
        assert_eq!(record.outcome(), GameOutcome::Unterminated);
    }

    #[test]
    fn pv_early_stop_needs_a_held_match() {
        let suite = EpdSuite::new("wac", vec![parse_epd_line(WAC_LINE, 0).unwrap()], 5000);
        _ = suite.next_task("tester", "tester").unwrap();
        let pv = vec!["g3g6".to_string()];
        assert!(!suite.set_pv("tester", &pv, 100, 10, 1000, 1));
        assert!(!suite.set_pv("tester", &pv, 600, 11, 2000, 1));
        assert!(suite.set_pv("tester", &pv, 1200, 12, 3000, 1));
        // losing the match resets the hold
        let other = vec!["c2h7".to_string()];
        assert!(!suite.set_pv("tester", &other, 1300, 12, 3100, 1));
        assert!(!suite.set_pv("tester", &pv, 1400, 13, 3200, 1));
    }
}
