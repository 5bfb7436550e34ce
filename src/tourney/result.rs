use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use derive_more::{Add, AddAssign};

use crate::game::{GameEndCause, GameOutcome};

/// Win/draw/loss counts from one perspective.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Add, AddAssign)]
#[must_use]
pub struct WdlCounts {
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
}

impl WdlCounts {
    pub fn total(&self) -> u32 {
        self.wins + self.draws + self.losses
    }

    /// Score in game points, draws counting half.
    pub fn points(&self) -> f64 {
        f64::from(self.wins) + f64::from(self.draws) / 2.0
    }

    pub fn swapped(&self) -> Self {
        Self {
            wins: self.losses,
            draws: self.draws,
            losses: self.wins,
        }
    }
}

/// The outcome tally of one engine pairing, counted relative to engine A
/// regardless of which color A had in each game.
#[derive(Debug, Default, Clone, PartialEq)]
#[must_use]
pub struct EngineDuelResult {
    pub engine_a: String,
    pub engine_b: String,
    pub counts: WdlCounts,
    /// Per end cause: how many A-wins, draws and A-losses ended that way.
    pub cause_stats: BTreeMap<GameEndCause, WdlCounts>,
}

impl EngineDuelResult {
    pub fn new(engine_a: &str, engine_b: &str) -> Self {
        Self {
            engine_a: engine_a.to_string(),
            engine_b: engine_b.to_string(),
            ..Self::default()
        }
    }

    /// Books one finished game. `a_had_white` maps the color-based outcome
    /// to the A-relative tally.
    pub fn count_game(&mut self, outcome: GameOutcome, cause: GameEndCause, a_had_white: bool) {
        let bucket = self.cause_stats.entry(cause).or_default();
        match outcome {
            GameOutcome::Draw => {
                self.counts.draws += 1;
                bucket.draws += 1;
            }
            GameOutcome::WhiteWins if a_had_white => {
                self.counts.wins += 1;
                bucket.wins += 1;
            }
            GameOutcome::BlackWins if !a_had_white => {
                self.counts.wins += 1;
                bucket.wins += 1;
            }
            GameOutcome::WhiteWins | GameOutcome::BlackWins => {
                self.counts.losses += 1;
                bucket.losses += 1;
            }
            GameOutcome::Unterminated => {}
        }
    }

    /// The same duel seen from engine B's side.
    pub fn switched_sides(&self) -> Self {
        Self {
            engine_a: self.engine_b.clone(),
            engine_b: self.engine_a.clone(),
            counts: self.counts.swapped(),
            cause_stats: self
                .cause_stats
                .iter()
                .map(|(cause, counts)| (*cause, counts.swapped()))
                .collect(),
        }
    }
}

impl Display for EngineDuelResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} vs {}: +{} ={} -{}",
            self.engine_a, self.engine_b, self.counts.wins, self.counts.draws, self.counts.losses
        )
    }
}

/// All duels of a tournament, with per-engine aggregation.
#[derive(Debug, Default, Clone)]
#[must_use]
pub struct TournamentResult {
    pub duels: Vec<EngineDuelResult>,
}

impl TournamentResult {
    pub fn add(&mut self, duel: EngineDuelResult) {
        self.duels.push(duel);
    }

    /// Combined W/D/L of one engine over all its duels.
    pub fn aggregated(&self, engine: &str) -> WdlCounts {
        let mut counts = WdlCounts::default();
        for duel in &self.duels {
            if duel.engine_a == engine {
                counts += duel.counts;
            } else if duel.engine_b == engine {
                counts += duel.counts.swapped();
            }
        }
        counts
    }

    pub fn engines(&self) -> Vec<String> {
        let mut engines = vec![];
        for duel in &self.duels {
            for engine in [&duel.engine_a, &duel.engine_b] {
                if !engines.contains(engine) {
                    engines.push(engine.clone());
                }
            }
        }
        engines
    }
}

impl Display for TournamentResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for duel in &self.duels {
            writeln!(f, "{duel}")?;
        }
        let mut standings: Vec<_> = self
            .engines()
            .into_iter()
            .map(|engine| {
                let counts = self.aggregated(&engine);
                (engine, counts)
            })
            .collect();
        standings.sort_by(|a, b| b.1.points().total_cmp(&a.1.points()));
        for (engine, counts) in standings {
            writeln!(
                f,
                "{engine}: {:.1}/{} (+{} ={} -{})",
                counts.points(),
                counts.total(),
                counts.wins,
                counts.draws,
                counts.losses
            )?;
        }
        Ok(())
    }
}
