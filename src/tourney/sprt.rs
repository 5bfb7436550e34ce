use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

use crate::game::GameRecord;
use crate::logger::{self, Message};
use crate::play::task::{GameTask, TaskProvider};
use crate::tourney::pair::PairTournament;

/// Configuration of one sequential probability ratio test.
#[derive(Debug, Copy, Clone)]
pub struct SprtConfig {
    /// H0: the true strength difference is at most this many Elo.
    pub elo_lower: f64,
    /// H1: the true strength difference is at least this many Elo.
    pub elo_upper: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for SprtConfig {
    fn default() -> Self {
        Self {
            elo_lower: 0.0,
            elo_upper: 5.0,
            alpha: 0.05,
            beta: 0.05,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub enum SprtDecision {
    AcceptH0,
    AcceptH1,
}

impl Display for SprtDecision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SprtDecision::AcceptH0 => write!(f, "H0 accepted"),
            SprtDecision::AcceptH1 => write!(f, "H1 accepted"),
        }
    }
}

/// The running state of the test after some number of games.
#[derive(Debug, Copy, Clone)]
#[must_use]
pub struct SprtStatus {
    pub llr: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub decision: Option<SprtDecision>,
}

/// Evaluates the log-likelihood ratio of a running match under the BayesElo
/// model and freezes the verdict once a bound is crossed. The evaluator
/// itself holds no durable state; W/D/L live in the pair tournament.
#[derive(Debug, Default)]
pub struct SprtEvaluator {
    config: SprtConfig,
    decision: Mutex<Option<SprtDecision>>,
}

impl SprtEvaluator {
    pub fn new(config: SprtConfig) -> Self {
        Self {
            config,
            decision: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SprtConfig {
        &self.config
    }

    /// The log-likelihood ratio of the observed (W, D, L) under H1 vs H0.
    /// Counts are regularized by half a game each, so the ratio is defined
    /// from the first game on.
    pub fn llr(&self, wins: u32, draws: u32, losses: u32) -> f64 {
        let w = f64::from(wins) + 0.5;
        let d = f64::from(draws) + 0.5;
        let l = f64::from(losses) + 0.5;
        let total = w + d + l;
        let p_win = w / total;
        let p_loss = l / total;

        let draw_elo = 200.0 * (((1.0 - p_loss) / p_loss) * ((1.0 - p_win) / p_win)).log10();
        let x = 10_f64.powf(-draw_elo / 400.0);
        let scale = 4.0 * x / ((1.0 + x) * (1.0 + x));

        let probabilities = |elo: f64| {
            let bayes_elo = elo / scale;
            let p_win = 1.0 / (1.0 + 10_f64.powf((draw_elo - bayes_elo) / 400.0));
            let p_loss = 1.0 / (1.0 + 10_f64.powf((draw_elo + bayes_elo) / 400.0));
            (p_win, p_loss, 1.0 - p_win - p_loss)
        };
        let (win0, loss0, draw0) = probabilities(self.config.elo_lower);
        let (win1, loss1, draw1) = probabilities(self.config.elo_upper);
        w * (win1 / win0).ln() + l * (loss1 / loss0).ln() + d * (draw1 / draw0).ln()
    }

    pub fn bounds(&self) -> (f64, f64) {
        (
            (self.config.beta / (1.0 - self.config.alpha)).ln(),
            ((1.0 - self.config.beta) / self.config.alpha).ln(),
        )
    }

    /// Updates the test with the current counts. A decision, once reached,
    /// never reverts.
    pub fn evaluate(&self, wins: u32, draws: u32, losses: u32) -> SprtStatus {
        let llr = self.llr(wins, draws, losses);
        let (lower, upper) = self.bounds();
        let mut decision = self.decision.lock().unwrap();
        if decision.is_none() {
            if llr >= upper {
                *decision = Some(SprtDecision::AcceptH1);
            } else if llr <= lower {
                *decision = Some(SprtDecision::AcceptH0);
            }
        }
        SprtStatus {
            llr,
            lower_bound: lower,
            upper_bound: upper,
            decision: *decision,
        }
    }

    pub fn decision(&self) -> Option<SprtDecision> {
        *self.decision.lock().unwrap()
    }
}

/// A task provider running one pair tournament under SPRT control: games
/// keep coming until the evaluator decides, then scheduling stops.
#[derive(Debug)]
pub struct SprtRun {
    pair: Arc<PairTournament>,
    evaluator: SprtEvaluator,
}

impl SprtRun {
    pub fn new(pair: Arc<PairTournament>, config: SprtConfig) -> Self {
        Self {
            pair,
            evaluator: SprtEvaluator::new(config),
        }
    }

    pub fn pair(&self) -> &Arc<PairTournament> {
        &self.pair
    }

    pub fn status(&self) -> SprtStatus {
        let (wins, draws, losses) = self.pair.wdl();
        SprtStatus {
            llr: self.evaluator.llr(wins, draws, losses),
            lower_bound: self.evaluator.bounds().0,
            upper_bound: self.evaluator.bounds().1,
            decision: self.evaluator.decision(),
        }
    }
}

impl TaskProvider for SprtRun {
    fn name(&self) -> &str {
        self.pair.name()
    }

    fn next_task(&self, white_id: &str, black_id: &str) -> Option<GameTask> {
        if self.evaluator.decision().is_some() {
            return None;
        }
        self.pair.next_task(white_id, black_id)
    }

    fn set_game_record(&self, task_id: usize, record: &GameRecord) {
        self.pair.set_game_record(task_id, record);
        let (wins, draws, losses) = self.pair.wdl();
        if wins + draws + losses == 0 {
            return;
        }
        let status = self.evaluator.evaluate(wins, draws, losses);
        match status.decision {
            Some(decision) => {
                self.pair.stop();
                logger::log(
                    Message::Info,
                    &format!(
                        "{}: {decision} after +{wins} ={draws} -{losses} (llr {:.2})",
                        self.pair.name(),
                        status.llr
                    ),
                );
            }
            None => logger::log(
                Message::Debug,
                &format!(
                    "{}: llr {:.3} in ({:.2}, {:.2}) after +{wins} ={draws} -{losses}",
                    self.pair.name(),
                    status.llr,
                    status.lower_bound,
                    status.upper_bound
                ),
            ),
        }
    }

    fn set_pv(
        &self,
        engine_id: &str,
        pv: &[String],
        elapsed_ms: u64,
        depth: u32,
        nodes: u64,
        multipv: u32,
    ) -> bool {
        self.pair
            .set_pv(engine_id, pv, elapsed_ms, depth, nodes, multipv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameEndCause, GameOutcome, GameRecord};
    use crate::openings::Openings;
    use crate::tourney::pair::PairSettings;

    fn evaluator(elo_lower: f64, elo_upper: f64) -> SprtEvaluator {
        SprtEvaluator::new(SprtConfig {
            elo_lower,
            elo_upper,
            alpha: 0.05,
            beta: 0.05,
        })
    }

    #[test]
    fn a_lopsided_score_accepts_h1_quickly() {
        let sprt = evaluator(0.0, 10.0);
        let status = sprt.evaluate(50, 5, 0);
        assert!(status.llr >= status.upper_bound, "llr = {}", status.llr);
        assert_eq!(status.decision, Some(SprtDecision::AcceptH1));
    }

    #[test]
    fn a_lopsided_deficit_accepts_h0() {
        let sprt = evaluator(0.0, 10.0);
        let status = sprt.evaluate(0, 5, 50);
        assert_eq!(status.decision, Some(SprtDecision::AcceptH0));
    }

    #[test]
    fn llr_is_monotonic_in_wins_and_losses() {
        let sprt = evaluator(0.0, 5.0);
        let mut last = f64::NEG_INFINITY;
        for wins in 1..50 {
            let llr = sprt.llr(wins, 20, 10);
            assert!(llr > last, "llr must grow with wins ({wins})");
            last = llr;
        }
        let mut last = f64::INFINITY;
        for losses in 1..50 {
            let llr = sprt.llr(10, 20, losses);
            assert!(llr < last, "llr must shrink with losses ({losses})");
            last = llr;
        }
    }

    #[test]
    fn a_decision_never_reverts() {
        let sprt = evaluator(0.0, 10.0);
        let first = sprt.evaluate(50, 5, 0);
        assert_eq!(first.decision, Some(SprtDecision::AcceptH1));
        // even a balanced continuation keeps the frozen verdict
        let later = sprt.evaluate(50, 5, 49);
        assert_eq!(later.decision, Some(SprtDecision::AcceptH1));
    }

    #[test]
    fn bounds_follow_the_error_rates() {
        let sprt = evaluator(0.0, 5.0);
        let (lower, upper) = sprt.bounds();
        assert!((lower - (0.05_f64 / 0.95).ln()).abs() < 1e-12);
        assert!((upper - (0.95_f64 / 0.05).ln()).abs() < 1e-12);
    }

    #[test]
    fn the_run_stops_scheduling_after_a_decision() {
        let pair = Arc::new(PairTournament::new(
            "new",
            "base",
            PairSettings {
                games: 1000,
                repeat: 2,
                swap_colors: true,
                round: 1,
            },
            Arc::new(Openings::startpos_only()),
        ));
        let run = SprtRun::new(pair.clone(), SprtConfig {
            elo_lower: 0.0,
            elo_upper: 10.0,
            alpha: 0.05,
            beta: 0.05,
        });
        // feed 55 decisive games; engine A wins whenever it has white
        for _ in 0..55 {
            let Some(task) = run.next_task("new", "base") else {
                break;
            };
            let mut record = task.record.clone();
            let outcome = if task.switch_side {
                GameOutcome::BlackWins
            } else {
                GameOutcome::WhiteWins
            };
            record.set_result(GameEndCause::Checkmate, outcome);
            run.set_game_record(task.task_id, &record);
        }
        assert_eq!(run.status().decision, Some(SprtDecision::AcceptH1));
        assert!(run.next_task("new", "base").is_none());
        assert!(pair.is_finished());
    }
}
