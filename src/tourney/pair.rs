use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use itertools::Itertools;

use crate::game::{GameEndCause, GameOutcome, GameRecord};
use crate::openings::{Openings, StartPosition};
use crate::play::task::{GameTask, TaskProvider, TaskType};
use crate::tourney::result::EngineDuelResult;
use crate::util::{parse_int_from_str, Res};

#[derive(Debug, Copy, Clone)]
pub struct PairSettings {
    /// Total number of games in this pairing.
    pub games: usize,
    /// Consecutive games per opening before rotating to the next one.
    pub repeat: usize,
    pub swap_colors: bool,
    pub round: u32,
}

impl Default for PairSettings {
    fn default() -> Self {
        Self {
            games: 2,
            repeat: 2,
            swap_colors: true,
            round: 1,
        }
    }
}

#[derive(Debug)]
struct PairState {
    /// Handed out to a manager and not finished yet.
    issued: Vec<bool>,
    /// `Unterminated` marks an unplayed slot; slots keep their index so a
    /// partially played tournament can resume.
    results: Vec<GameOutcome>,
    /// Opening chosen for each rotation step so far; games of the same
    /// rotation share their entry.
    chosen_openings: Vec<StartPosition>,
    duel: EngineDuelResult,
    stopped: bool,
}

/// One (engine A, engine B) match of N games with color swapping and
/// opening rotation. Shared by reference between the managers playing it.
#[derive(Debug)]
pub struct PairTournament {
    name: String,
    settings: PairSettings,
    openings: Arc<Openings>,
    state: Mutex<PairState>,
}

impl PairTournament {
    pub fn new(
        engine_a: &str,
        engine_b: &str,
        settings: PairSettings,
        openings: Arc<Openings>,
    ) -> Self {
        let state = PairState {
            issued: vec![false; settings.games],
            results: vec![GameOutcome::Unterminated; settings.games],
            chosen_openings: vec![],
            duel: EngineDuelResult::new(engine_a, engine_b),
            stopped: false,
        };
        Self {
            name: format!("{engine_a} vs {engine_b}"),
            settings,
            openings,
            state: Mutex::new(state),
        }
    }

    pub fn settings(&self) -> &PairSettings {
        &self.settings
    }

    pub fn engine_a(&self) -> String {
        self.state.lock().unwrap().duel.engine_a.clone()
    }

    pub fn engine_b(&self) -> String {
        self.state.lock().unwrap().duel.engine_b.clone()
    }

    fn switch_side(&self, game: usize) -> bool {
        self.settings.swap_colors && game % 2 == 1
    }

    fn a_had_white(&self, game: usize) -> bool {
        !self.switch_side(game)
    }

    /// A snapshot of the duel tally.
    pub fn duel(&self) -> EngineDuelResult {
        self.state.lock().unwrap().duel.clone()
    }

    /// (wins, draws, losses) relative to engine A.
    pub fn wdl(&self) -> (u32, u32, u32) {
        let duel = &self.state.lock().unwrap().duel;
        (duel.counts.wins, duel.counts.draws, duel.counts.losses)
    }

    pub fn finished_games(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .results
            .iter()
            .filter(|&&outcome| outcome != GameOutcome::Unterminated)
            .count()
    }

    pub fn is_finished(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.stopped
            || state
                .results
                .iter()
                .all(|&outcome| outcome != GameOutcome::Unterminated)
    }

    /// Stops scheduling further games; slots already issued still finish.
    pub fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
    }

    /// The compact per-game result line: one character per game slot,
    /// engine-A-relative and color-agnostic.
    pub fn result_string(&self) -> String {
        let state = self.state.lock().unwrap();
        let chars: String = state
            .results
            .iter()
            .enumerate()
            .map(|(game, outcome)| self.outcome_char(*outcome, game))
            .collect();
        format!("{} : {chars}", self.name)
    }

    fn outcome_char(&self, outcome: GameOutcome, game: usize) -> char {
        match outcome {
            GameOutcome::Unterminated => '?',
            GameOutcome::Draw => '=',
            GameOutcome::WhiteWins => {
                if self.a_had_white(game) {
                    '1'
                } else {
                    '0'
                }
            }
            GameOutcome::BlackWins => {
                if self.a_had_white(game) {
                    '0'
                } else {
                    '1'
                }
            }
        }
    }

    fn outcome_from_char(&self, c: char, game: usize) -> Res<GameOutcome> {
        Ok(match c {
            '?' => GameOutcome::Unterminated,
            '=' => GameOutcome::Draw,
            '1' => {
                if self.a_had_white(game) {
                    GameOutcome::WhiteWins
                } else {
                    GameOutcome::BlackWins
                }
            }
            '0' => {
                if self.a_had_white(game) {
                    GameOutcome::BlackWins
                } else {
                    GameOutcome::WhiteWins
                }
            }
            c => bail!("'{c}' is not a valid game result character"),
        })
    }

    /// The persisted form: a section header followed by the game results
    /// and the per-cause statistics.
    pub fn write_section(&self) -> String {
        let state = self.state.lock().unwrap();
        let cause_line = |pick: fn(&crate::tourney::result::WdlCounts) -> u32| {
            state
                .duel
                .cause_stats
                .iter()
                .filter(|(_, counts)| pick(counts) > 0)
                .map(|(cause, counts)| format!("{cause}:{}", pick(counts)))
                .join(",")
        };
        let chars: String = state
            .results
            .iter()
            .enumerate()
            .map(|(game, outcome)| self.outcome_char(*outcome, game))
            .collect();
        format!(
            "[round {} engines {}]\ngames: {chars}\nwincauses: {}\ndrawcauses: {}\nlosscauses: {}\n",
            self.settings.round,
            self.name,
            cause_line(|c| c.wins),
            cause_line(|c| c.draws),
            cause_line(|c| c.losses),
        )
    }

    /// Restores results and counters from a section written by
    /// [`Self::write_section`]. The header must match this tournament.
    pub fn restore_section(&self, section: &str) -> Res<()> {
        let mut lines = section.lines().map(str::trim).filter(|l| !l.is_empty());
        let header = lines
            .next()
            .ok_or_else(|| anyhow!("Empty tournament section"))?;
        if header != self.header() {
            bail!(
                "Section header '{header}' doesn't belong to this tournament ('{}')",
                self.header()
            )
        }
        let mut state = self.state.lock().unwrap();
        let (engine_a, engine_b) = (state.duel.engine_a.clone(), state.duel.engine_b.clone());
        state.duel = EngineDuelResult::new(&engine_a, &engine_b);
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("Expected 'key: value' in '{line}'"))?;
            let value = value.trim();
            match key.trim() {
                "games" => {
                    if value.chars().count() != self.settings.games {
                        bail!(
                            "The result string '{value}' doesn't match the configured {} games",
                            self.settings.games
                        )
                    }
                    for (game, c) in value.chars().enumerate() {
                        let outcome = self.outcome_from_char(c, game)?;
                        state.results[game] = outcome;
                        state.issued[game] = false;
                        match c {
                            '1' => state.duel.counts.wins += 1,
                            '0' => state.duel.counts.losses += 1,
                            '=' => state.duel.counts.draws += 1,
                            _ => {}
                        }
                    }
                }
                kind @ ("wincauses" | "drawcauses" | "losscauses") => {
                    for entry in value.split(',').filter(|e| !e.is_empty()) {
                        let (cause, count) = entry
                            .split_once(':')
                            .ok_or_else(|| anyhow!("Expected 'cause:count' in '{entry}'"))?;
                        let cause = GameEndCause::from_str(cause)
                            .map_err(|_| anyhow!("Unknown end cause '{cause}'"))?;
                        let count: u32 = parse_int_from_str(count, "cause count")?;
                        let bucket = state.duel.cause_stats.entry(cause).or_default();
                        match kind {
                            "wincauses" => bucket.wins += count,
                            "drawcauses" => bucket.draws += count,
                            _ => bucket.losses += count,
                        }
                    }
                }
                key => bail!("Unknown tournament section key '{key}'"),
            }
        }
        Ok(())
    }

    fn header(&self) -> String {
        format!("[round {} engines {}]", self.settings.round, self.name)
    }
}

impl TaskProvider for PairTournament {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_task(&self, _white_id: &str, _black_id: &str) -> Option<GameTask> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return None;
        }
        let game = (0..self.settings.games).find(|&game| {
            !state.issued[game] && state.results[game] == GameOutcome::Unterminated
        })?;
        state.issued[game] = true;
        let rotation = game / self.settings.repeat.max(1);
        while state.chosen_openings.len() <= rotation {
            let next = self.openings.position_for(state.chosen_openings.len());
            state.chosen_openings.push(next);
        }
        let opening = state.chosen_openings[rotation].clone();
        drop(state);

        let record = GameRecord::new(opening.startpos, opening.fen);
        Some(GameTask {
            task_type: TaskType::PlayGame,
            record,
            task_id: game,
            switch_side: self.switch_side(game),
            round: game as u32 + 1,
        })
    }

    fn set_game_record(&self, task_id: usize, record: &GameRecord) {
        let mut state = self.state.lock().unwrap();
        state.issued[task_id] = false;
        if record.outcome() == GameOutcome::Unterminated {
            // aborted without a result; the slot stays replayable
            return;
        }
        state.results[task_id] = record.outcome();
        let a_had_white = self.a_had_white(task_id);
        state
            .duel
            .count_game(record.outcome(), record.cause(), a_had_white);
    }
}

/// Writes the persistent state of several tournaments into one file.
pub fn save_tournaments(path: &Path, tournaments: &[Arc<PairTournament>]) -> Res<()> {
    let text = tournaments
        .iter()
        .map(|t| t.write_section())
        .join("\n");
    fs::write(path, text)?;
    Ok(())
}

/// Restores any tournament whose section appears in the file. Unmatched
/// sections are ignored, as are tournaments without a section.
pub fn load_tournaments(path: &Path, tournaments: &[Arc<PairTournament>]) -> Res<()> {
    let text = fs::read_to_string(path)?;
    let mut sections = vec![];
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_start().starts_with('[') && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    for tournament in tournaments {
        let header = tournament.header();
        if let Some(section) = sections.iter().find(|s| s.trim_start().starts_with(&header)) {
            tournament.restore_section(section)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::GameEndCause;
    use crate::openings::OpeningOrder;
    use pretty_assertions::assert_eq;

    fn two_opening_book() -> Arc<Openings> {
        Arc::new(Openings::new(
            vec![
                StartPosition::initial(),
                StartPosition::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 0 1"),
            ],
            OpeningOrder::Sequential,
            0,
            0,
        ))
    }

    fn finished_record(task: &GameTask, outcome: GameOutcome, cause: GameEndCause) -> GameRecord {
        let mut record = task.record.clone();
        record.set_result(cause, outcome);
        record
    }

    #[test]
    fn schedules_color_swaps_and_opening_rotation() {
        let pair = PairTournament::new(
            "alpha",
            "beta",
            PairSettings {
                games: 4,
                repeat: 2,
                swap_colors: true,
                round: 1,
            },
            two_opening_book(),
        );
        let tasks: Vec<GameTask> = std::iter::from_fn(|| pair.next_task("alpha", "beta"))
            .take(5)
            .collect();
        assert_eq!(tasks.len(), 4);
        assert_eq!(
            tasks.iter().map(|t| t.switch_side).collect::<Vec<_>>(),
            vec![false, true, false, true]
        );
        // games 0 and 1 share the first opening, 2 and 3 the second
        assert!(tasks[0].record.startpos && tasks[1].record.startpos);
        assert!(!tasks[2].record.startpos && !tasks[3].record.startpos);
        assert_eq!(tasks[2].record.fen, tasks[3].record.fen);
        assert_eq!(tasks[3].round, 4);
    }

    #[test]
    fn accounting_is_engine_a_relative() {
        let pair = PairTournament::new(
            "alpha",
            "beta",
            PairSettings {
                games: 2,
                repeat: 1,
                swap_colors: true,
                round: 1,
            },
            two_opening_book(),
        );
        let first = pair.next_task("alpha", "beta").unwrap();
        let second = pair.next_task("alpha", "beta").unwrap();
        // game 0: A is white and white wins; game 1: A is black and white
        // wins, so A loses
        pair.set_game_record(
            first.task_id,
            &finished_record(&first, GameOutcome::WhiteWins, GameEndCause::Checkmate),
        );
        pair.set_game_record(
            second.task_id,
            &finished_record(&second, GameOutcome::WhiteWins, GameEndCause::Timeout),
        );
        assert_eq!(pair.wdl(), (1, 0, 1));
        assert!(pair.is_finished());
        assert!(pair.result_string().ends_with(": 10"));
    }

    #[test]
    fn aborted_games_stay_replayable() {
        let pair = PairTournament::new(
            "alpha",
            "beta",
            PairSettings {
                games: 1,
                repeat: 1,
                swap_colors: false,
                round: 1,
            },
            two_opening_book(),
        );
        let task = pair.next_task("alpha", "beta").unwrap();
        assert!(pair.next_task("alpha", "beta").is_none());
        pair.set_game_record(task.task_id, &task.record.clone());
        let again = pair.next_task("alpha", "beta").unwrap();
        assert_eq!(again.task_id, task.task_id);
    }

    #[test]
    fn section_round_trips_results_and_causes() {
        let settings = PairSettings {
            games: 4,
            repeat: 2,
            swap_colors: true,
            round: 3,
        };
        let pair = PairTournament::new("alpha", "beta", settings, two_opening_book());
        for (outcome, cause) in [
            (GameOutcome::WhiteWins, GameEndCause::Checkmate),
            (GameOutcome::Draw, GameEndCause::Repetition),
            (GameOutcome::BlackWins, GameEndCause::Timeout),
        ] {
            let task = pair.next_task("alpha", "beta").unwrap();
            pair.set_game_record(task.task_id, &finished_record(&task, outcome, cause));
        }
        let section = pair.write_section();
        assert!(section.starts_with("[round 3 engines alpha vs beta]"));
        assert!(section.contains("games: 1=0?"));

        let restored = PairTournament::new("alpha", "beta", settings, two_opening_book());
        restored.restore_section(&section).unwrap();
        assert_eq!(restored.wdl(), pair.wdl());
        assert_eq!(restored.duel().cause_stats, pair.duel().cause_stats);
        assert_eq!(restored.result_string(), pair.result_string());
        // only the unplayed slot is handed out again
        let next = restored.next_task("alpha", "beta").unwrap();
        assert_eq!(next.task_id, 3);
        assert!(restored.next_task("alpha", "beta").is_none());
    }
}
