use std::sync::Arc;

use anyhow::bail;

use crate::engine::config::EngineConfig;
use crate::openings::Openings;
use crate::play::pool::GameManagerPool;
use crate::tourney::pair::{PairSettings, PairTournament};
use crate::tourney::result::TournamentResult;
use crate::util::Res;

/// One engine against a field of opponents: a pair tournament per opponent,
/// with the gauntlet engine always as engine A. Rounds number the pairings.
#[derive(Debug)]
pub struct GauntletTournament {
    gauntlet: EngineConfig,
    opponents: Vec<EngineConfig>,
    pairs: Vec<Arc<PairTournament>>,
}

impl GauntletTournament {
    pub fn new(
        gauntlet: EngineConfig,
        opponents: Vec<EngineConfig>,
        settings: PairSettings,
        openings: Arc<Openings>,
    ) -> Res<Self> {
        if opponents.is_empty() {
            bail!("A gauntlet needs at least one opponent")
        }
        let pairs = opponents
            .iter()
            .enumerate()
            .map(|(index, opponent)| {
                let settings = PairSettings {
                    round: index as u32 + 1,
                    ..settings
                };
                Arc::new(PairTournament::new(
                    &gauntlet.name,
                    &opponent.name,
                    settings,
                    openings.clone(),
                ))
            })
            .collect();
        Ok(Self {
            gauntlet,
            opponents,
            pairs,
        })
    }

    pub fn pairs(&self) -> &[Arc<PairTournament>] {
        &self.pairs
    }

    /// Registers every pairing with the pool, spreading the manager budget
    /// over the pairs.
    pub fn add_to_pool(&self, pool: &GameManagerPool, managers_per_pair: usize) -> Res<()> {
        for (pair, opponent) in self.pairs.iter().zip(&self.opponents) {
            pool.add_task_provider(
                pair.clone() as Arc<dyn crate::play::task::TaskProvider>,
                self.gauntlet.clone(),
                Some(opponent.clone()),
                managers_per_pair,
            )?;
        }
        Ok(())
    }

    pub fn results(&self) -> TournamentResult {
        let mut result = TournamentResult::default();
        for pair in &self.pairs {
            result.add(pair.duel());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameEndCause, GameOutcome};
    use crate::play::task::TaskProvider;

    fn config(name: &str) -> EngineConfig {
        EngineConfig {
            name: name.to_string(),
            executable: "/usr/bin/true".into(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn builds_one_pair_per_opponent_with_rounds() {
        let gauntlet = GauntletTournament::new(
            config("champion"),
            vec![config("first"), config("second")],
            PairSettings::default(),
            Arc::new(Openings::startpos_only()),
        )
        .unwrap();
        assert_eq!(gauntlet.pairs().len(), 2);
        assert_eq!(gauntlet.pairs()[0].settings().round, 1);
        assert_eq!(gauntlet.pairs()[1].settings().round, 2);
        assert_eq!(gauntlet.pairs()[1].engine_b(), "second");
    }

    #[test]
    fn results_aggregate_over_the_field() {
        let gauntlet = GauntletTournament::new(
            config("champion"),
            vec![config("first"), config("second")],
            PairSettings {
                games: 1,
                repeat: 1,
                swap_colors: false,
                round: 1,
            },
            Arc::new(Openings::startpos_only()),
        )
        .unwrap();
        for pair in gauntlet.pairs() {
            let task = pair.next_task("champion", "other").unwrap();
            let mut record = task.record.clone();
            record.set_result(GameEndCause::Checkmate, GameOutcome::WhiteWins);
            pair.set_game_record(task.task_id, &record);
        }
        let results = gauntlet.results();
        let counts = results.aggregated("champion");
        assert_eq!(counts.wins, 2);
        assert_eq!(results.aggregated("first").losses, 1);
    }
}
