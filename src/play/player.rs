use std::sync::Arc;
use std::time::Duration;

use shakmaty::Color;

use crate::engine::adapter::PositionSpec;
use crate::engine::event::SearchInfo;
use crate::engine::EngineWorker;
use crate::game::{GameState, MoveRecord};
use crate::report::EngineReport;
use crate::time::{ClockState, GoLimits, TimeControl};
use crate::util::now_ms;

/// Engines may overshoot a fixed move time by this much before it counts as
/// an overrun; measuring includes pipe and scheduling latency.
const MOVETIME_GRACE_MS: u64 = 100;
/// Node limits are soft by convention; a search only checks them now and then.
const NODES_GRACE: u64 = 1000;
/// How far past its clock an engine may compute before the harness steps in.
const KEEPALIVE_GRACE_MS: u64 = 5000;
/// After asking for a move and getting nothing, give up at this point.
const STALL_LIMIT_MS: u64 = 15_000;

/// What the context concluded from a `bestmove`.
#[derive(Debug)]
#[must_use]
pub enum BestMoveVerdict {
    Legal(MoveRecord),
    /// The move doesn't exist in the position; the offender loses.
    Illegal,
    /// `bestmove (none)` or a bestmove nobody asked for.
    NoMove,
    /// The move was fine but came too late; the offender loses on time.
    TimeLoss,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub enum TimeoutAction {
    Fine,
    /// The engine overshot its budget; `?`/`stop` went out.
    MoveNowSent,
    /// The engine is unresponsive and needs to be replaced.
    RestartNeeded,
}

/// Binds one engine worker to one side of one game: tracks the side's clock,
/// the shadow board, the running move record, and the pondering state.
pub struct PlayerContext {
    worker: Arc<EngineWorker>,
    color: Color,
    state: GameState,
    tc: TimeControl,
    clock: ClockState,
    limits: Option<GoLimits>,
    compute_start_ms: Option<u64>,
    current: MoveRecord,
    /// The predicted opponent move we are pondering on; already applied to
    /// the shadow board while set.
    ponder_lan: Option<String>,
    ponder_enabled: bool,
    move_now_sent: bool,
    /// Bestmoves of flushed ponder searches that are still in flight to the
    /// manager and must be dropped, not played.
    discard_bestmoves: u32,
}

impl PlayerContext {
    pub fn new(worker: Arc<EngineWorker>, ponder_enabled: bool) -> Self {
        Self {
            worker,
            color: Color::White,
            state: GameState::from_startpos(),
            tc: TimeControl::default(),
            clock: ClockState::new(&TimeControl::default()),
            limits: None,
            compute_start_ms: None,
            current: MoveRecord::default(),
            ponder_lan: None,
            ponder_enabled,
            move_now_sent: false,
            discard_bestmoves: 0,
        }
    }

    /// Resets the context for a new game.
    pub fn begin_game(&mut self, color: Color, state: GameState, tc: TimeControl) {
        self.color = color;
        self.state = state;
        self.clock = ClockState::new(&tc);
        self.tc = tc;
        self.limits = None;
        self.compute_start_ms = None;
        self.current = MoveRecord::default();
        self.ponder_lan = None;
        self.move_now_sent = false;
        self.discard_bestmoves = 0;
    }

    pub fn worker(&self) -> &Arc<EngineWorker> {
        &self.worker
    }

    fn report(&self) -> &Arc<EngineReport> {
        self.worker.report()
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn tc(&self) -> &TimeControl {
        &self.tc
    }

    pub fn clock(&self) -> &ClockState {
        &self.clock
    }

    pub fn is_computing(&self) -> bool {
        self.compute_start_ms.is_some()
    }

    /// How long the current search had been running at `at_ms`.
    pub fn search_elapsed(&self, at_ms: u64) -> u64 {
        self.compute_start_ms
            .map_or(0, |start| at_ms.saturating_sub(start))
    }

    pub fn is_pondering(&self) -> bool {
        self.ponder_lan.is_some()
    }

    pub fn ponder_enabled(&self) -> bool {
        self.ponder_enabled
    }

    pub fn ponder_lan(&self) -> Option<&str> {
        self.ponder_lan.as_deref()
    }

    fn position_spec(&self) -> PositionSpec {
        PositionSpec {
            startpos: self.state.startpos(),
            fen: self.state.start_fen().to_string(),
            moves_lan: self.state.move_lans().to_vec(),
            white_to_move: self.state.side_to_move() == Color::White,
        }
    }

    /// Issues the search for this side's next move. With `ponder_hit` the
    /// shadow board already contains the predicted move and the running
    /// ponder search is converted instead of restarted.
    pub fn start_search(&mut self, limits: GoLimits, ponder_hit: bool) {
        if ponder_hit && self.ponder_lan.is_none() {
            crate::fatal_invariant("converting a ponder search that was never started");
        }
        self.ponder_lan = None;
        self.move_now_sent = false;
        self.current = MoveRecord::default();
        let spec = if ponder_hit {
            // only 'ponderhit' goes out; the position is ignored
            PositionSpec::default()
        } else {
            self.position_spec()
        };
        self.limits = Some(limits.clone());
        self.worker.compute_move(spec, limits, ponder_hit);
    }

    /// Called when the worker confirms the `go` went out; starts the move
    /// timer with the write timestamp.
    pub fn on_compute_sent(&mut self, timestamp_ms: u64) {
        self.compute_start_ms = Some(timestamp_ms);
    }

    /// Folds a search-progress snapshot into the running move record and
    /// validates the moves it mentions.
    pub fn on_info(&mut self, info: &SearchInfo) {
        // Secondary multipv lines don't describe the move the engine will
        // play; record only the main line.
        if info.multipv.unwrap_or(1) != 1 {
            return;
        }
        if let Some(depth) = info.depth {
            self.current.depth = depth;
        }
        if let Some(seldepth) = info.seldepth {
            self.current.seldepth = seldepth;
        }
        if let Some(nodes) = info.nodes {
            self.current.nodes = nodes;
        }
        if let Some(cp) = info.score_cp {
            self.current.score_cp = Some(cp);
            self.current.score_mate = None;
        }
        if let Some(mate) = info.score_mate {
            self.current.score_mate = Some(mate);
        }
        self.current.multipv = info.multipv.unwrap_or(1);
        if let Some(curr) = &info.curr_move {
            let legal = self.state.string_to_move(curr, true).is_ok();
            self.report()
                .log_report("currmove-legal", legal, (!legal).then_some(curr.as_str()));
        }
        if !info.pv.is_empty() {
            self.validate_pv(&info.pv);
            self.current.pv = info.pv.clone();
        }
    }

    /// Replays the PV against the shadow board; an illegal PV move is a
    /// note, not a game-ending offence.
    fn validate_pv(&self, pv: &[String]) {
        let mut probe = self.state.clone();
        for lan in pv {
            match probe.string_to_move(lan, true) {
                Ok(mv) => probe.do_move(&mv),
                Err(_) => {
                    self.report().log_report(
                        "pv-moves-legal",
                        false,
                        Some(&format!("'{lan}' in pv starting {}", pv.join(" "))),
                    );
                    return;
                }
            }
        }
        self.report().log_report("pv-moves-legal", true, None);
    }

    /// Handles the answer to our `go`. Applies the move to the shadow board,
    /// fills in the move record, books the elapsed time, and checks every
    /// configured limit.
    pub fn on_best_move(
        &mut self,
        best: &str,
        ponder: Option<&str>,
        timestamp_ms: u64,
    ) -> BestMoveVerdict {
        let Some(start) = self.compute_start_ms.take() else {
            self.report()
                .log_report("bestmove-only-when-searching", false, Some(best));
            return BestMoveVerdict::NoMove;
        };
        if best.is_empty() {
            self.report()
                .log_report("legalmove", false, Some("empty best move"));
            return BestMoveVerdict::NoMove;
        }
        let elapsed = timestamp_ms.saturating_sub(start);
        let within_clock = self.check_time(elapsed);
        let mv = match self.state.string_to_move(best, true) {
            Ok(mv) => mv,
            Err(err) => {
                self.report()
                    .log_report("legalmove", false, Some(&err.to_string()));
                return BestMoveVerdict::Illegal;
            }
        };
        self.report().log_report("legalmove", true, None);
        let mut record = std::mem::take(&mut self.current);
        record.lan = self.state.move_to_lan(&mv);
        record.san = self.state.move_to_san(&mv);
        record.time_ms = elapsed;
        self.state.do_move(&mv);
        self.clock.consume(&self.tc, elapsed);
        if !within_clock {
            return BestMoveVerdict::TimeLoss;
        }
        if let Some(hint) = ponder {
            let legal = self.state.string_to_move(hint, true).is_ok();
            self.report()
                .log_report("ponder-move-legal", legal, (!legal).then_some(hint));
        }
        BestMoveVerdict::Legal(record)
    }

    /// Checks the elapsed move time and the reported search effort against
    /// the limits of the issued `go`. Returns false exactly when the side's
    /// clock was exceeded, which loses the game.
    fn check_time(&self, elapsed_ms: u64) -> bool {
        let Some(limits) = self.limits.as_ref() else {
            return true;
        };
        let single_limit = self.tc.limit_count() == 1;
        let mut within_clock = true;
        if let Some(left) = limits.own_time_ms(self.color) {
            if left > 0 {
                let ok = elapsed_ms <= left;
                self.report().log_report(
                    "no-loss-on-time",
                    ok,
                    (!ok).then(|| format!("{elapsed_ms} ms used, {left} ms left")).as_deref(),
                );
                within_clock &= ok;
            }
        }
        if let Some(movetime) = limits.movetime_ms {
            let ok = elapsed_ms <= movetime + MOVETIME_GRACE_MS;
            self.report().log_report(
                "no-movetime-overrun",
                ok,
                (!ok).then(|| format!("{elapsed_ms} ms for movetime {movetime}")).as_deref(),
            );
            if single_limit {
                let ok = elapsed_ms * 100 >= movetime * 99;
                self.report().log_report(
                    "no-movetime-underrun",
                    ok,
                    (!ok).then(|| format!("{elapsed_ms} ms of movetime {movetime}")).as_deref(),
                );
            }
        }
        if let Some(depth) = limits.depth {
            let ok = self.current.depth <= depth;
            self.report().log_report(
                "depth-limit-respected",
                ok,
                (!ok).then(|| format!("reached depth {}", self.current.depth)).as_deref(),
            );
            if single_limit && self.current.depth > 0 {
                let ok = self.current.depth * 10 >= depth * 9;
                self.report().log_report(
                    "depth-limit-respected",
                    ok,
                    (!ok).then(|| format!("stopped at depth {} of {depth}", self.current.depth)).as_deref(),
                );
            }
        }
        if let Some(nodes) = limits.nodes {
            let ok = self.current.nodes <= nodes + NODES_GRACE;
            self.report().log_report(
                "nodes-limit-respected",
                ok,
                (!ok).then(|| format!("searched {} nodes", self.current.nodes)).as_deref(),
            );
            if single_limit && self.current.nodes > 0 {
                let ok = self.current.nodes * 10 >= nodes * 9;
                self.report().log_report(
                    "nodes-limit-respected",
                    ok,
                    (!ok).then(|| format!("stopped at {} of {nodes} nodes", self.current.nodes)).as_deref(),
                );
            }
        }
        within_clock
    }

    /// Polled once per second while this side is computing. Escalates from
    /// waiting, to demanding a move, to declaring the engine lost.
    pub fn check_engine_timeout(&mut self) -> TimeoutAction {
        let Some(start) = self.compute_start_ms else {
            return TimeoutAction::Fine;
        };
        let Some(limits) = self.limits.as_ref() else {
            return TimeoutAction::Fine;
        };
        let budget = match (limits.movetime_ms, limits.own_time_ms(self.color)) {
            (Some(movetime), Some(clock)) => movetime.min(clock),
            (Some(movetime), None) => movetime,
            (None, Some(clock)) => clock,
            // depth/nodes/infinite searches have no wall-clock bound
            (None, None) => return TimeoutAction::Fine,
        };
        let elapsed = now_ms().saturating_sub(start);
        if elapsed <= budget + KEEPALIVE_GRACE_MS {
            return TimeoutAction::Fine;
        }
        if !self.move_now_sent {
            self.move_now_sent = true;
            _ = self.worker.move_now(false, Duration::ZERO);
            return TimeoutAction::MoveNowSent;
        }
        if elapsed > budget + STALL_LIMIT_MS
            || !self.worker.request_ready(Duration::from_millis(1000))
        {
            self.report()
                .log_report("no-disconnect", false, Some("engine stopped responding"));
            return TimeoutAction::RestartNeeded;
        }
        TimeoutAction::MoveNowSent
    }

    /// Starts pondering on the opponent reply `lan` predicted by our last
    /// bestmove. The shadow board keeps the prediction applied while the
    /// ponder search runs.
    pub fn start_ponder(&mut self, lan: &str, limits: GoLimits) -> bool {
        let Ok(mv) = self.state.string_to_move(lan, true) else {
            // already reported via ponder-move-legal
            return false;
        };
        let spec = self.position_spec();
        self.worker.allow_ponder(spec, limits, lan.to_string());
        self.state.do_move(&mv);
        self.ponder_lan = Some(lan.to_string());
        true
    }

    /// The opponent played the predicted move: nothing to undo.
    pub fn take_ponder_hit(&mut self) {
        if self.ponder_lan.is_none() {
            crate::fatal_invariant("ponder hit without a pondered move");
        }
    }

    /// The opponent played something else: retract the prediction, flush the
    /// ponder search, and catch the shadow board up. Returns false when the
    /// engine didn't answer the stop, which calls for a restart.
    pub fn ponder_miss(&mut self, actual_lan: &str) -> bool {
        self.ponder_lan = None;
        self.state.undo_move();
        let flushed = self.worker.move_now(true, Duration::from_millis(1000));
        if flushed {
            // the flushed search's bestmove still travels the event queue
            self.discard_bestmoves += 1;
        }
        if let Ok(mv) = self.state.string_to_move(actual_lan, true) {
            self.state.do_move(&mv);
        }
        flushed
    }

    /// Whether the next incoming bestmove of this engine belongs to a
    /// flushed ponder search and must be dropped.
    pub fn take_bestmove_discard(&mut self) -> bool {
        if self.discard_bestmoves > 0 {
            self.discard_bestmoves -= 1;
            true
        } else {
            false
        }
    }

    /// Advances the shadow board by the opponent's move.
    pub fn apply_opponent_move(&mut self, lan: &str) {
        if let Ok(mv) = self.state.string_to_move(lan, true) {
            self.state.do_move(&mv);
        }
    }

    /// The shadow board's FEN, used by tests and end-of-game bookkeeping.
    pub fn current_fen(&self) -> String {
        self.state.current_fen()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;
    use crate::report::EngineReport;
    use std::path::PathBuf;

    /// A worker whose engine never gets asked anything; these tests only
    /// exercise the bookkeeping.
    fn idle_worker() -> Arc<EngineWorker> {
        let script = r#"
while read line; do
  case "$line" in
    uci) echo "uciok";;
    isready) echo "readyok";;
    quit) exit 0;;
  esac
done
"#;
        let config = EngineConfig {
            name: "context-test".to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ..EngineConfig::default()
        };
        let report = Arc::new(EngineReport::new(&config.name));
        Arc::new(EngineWorker::start(config, report).unwrap())
    }

    fn context_with_limits(limits: GoLimits, tc: TimeControl) -> PlayerContext {
        let mut ctx = PlayerContext::new(idle_worker(), false);
        ctx.begin_game(Color::White, GameState::from_startpos(), tc);
        ctx.limits = Some(limits);
        ctx.compute_start_ms = Some(1000);
        ctx
    }

    #[test]
    fn a_legal_bestmove_updates_record_and_shadow() {
        let mut ctx = context_with_limits(
            GoLimits {
                movetime_ms: Some(1000),
                ..GoLimits::default()
            },
            TimeControl::fixed_movetime(1000),
        );
        ctx.on_info(&SearchInfo {
            depth: Some(7),
            score_cp: Some(35),
            nodes: Some(4200),
            pv: vec!["e2e4".to_string(), "e7e5".to_string()],
            ..SearchInfo::default()
        });
        let verdict = ctx.on_best_move("e2e4", None, 1995);
        let BestMoveVerdict::Legal(record) = verdict else {
            panic!("expected a legal move, got {verdict:?}")
        };
        assert_eq!(record.lan, "e2e4");
        assert_eq!(record.san, "e4");
        assert_eq!(record.time_ms, 995);
        assert_eq!(record.depth, 7);
        assert_eq!(record.score_cp, Some(35));
        assert!(ctx.current_fen().contains(" b "));
        ctx.worker().stop(true);
    }

    #[test]
    fn an_illegal_bestmove_is_flagged() {
        let mut ctx = context_with_limits(GoLimits::default(), TimeControl::default());
        let verdict = ctx.on_best_move("e7e5", None, 1100);
        assert!(matches!(verdict, BestMoveVerdict::Illegal));
        assert_eq!(
            ctx.report().return_code(),
            crate::AppReturnCode::EngineError
        );
        ctx.worker().stop(true);
    }

    #[test]
    fn exceeding_the_clock_loses_on_time() {
        let tc = TimeControl::sudden_death(500, 0);
        let clock = ClockState::new(&tc);
        let limits = GoLimits {
            wtime_ms: Some(clock.remaining_ms() as u64),
            ..GoLimits::default()
        };
        let mut ctx = context_with_limits(limits, tc);
        let verdict = ctx.on_best_move("e2e4", None, 1000 + 700);
        assert!(matches!(verdict, BestMoveVerdict::TimeLoss));
        ctx.worker().stop(true);
    }

    #[test]
    fn movetime_overrun_within_grace_passes() {
        let mut ctx = context_with_limits(
            GoLimits {
                movetime_ms: Some(1000),
                ..GoLimits::default()
            },
            TimeControl::fixed_movetime(1000),
        );
        // 1020 ms used: inside the +100 ms grace, and above the 99%
        // underrun bar.
        let verdict = ctx.on_best_move("e2e4", None, 1000 + 1020);
        assert!(matches!(verdict, BestMoveVerdict::Legal(_)));
        assert_eq!(ctx.report().return_code(), crate::AppReturnCode::NoError);
        ctx.worker().stop(true);
    }

    #[test]
    fn an_unsolicited_bestmove_is_a_hard_violation() {
        let mut ctx = PlayerContext::new(idle_worker(), false);
        ctx.begin_game(Color::White, GameState::from_startpos(), TimeControl::default());
        let verdict = ctx.on_best_move("e2e4", None, 1000);
        assert!(matches!(verdict, BestMoveVerdict::NoMove));
        ctx.worker().stop(true);
    }

    #[test]
    fn illegal_pv_moves_are_notes() {
        let mut ctx = context_with_limits(GoLimits::default(), TimeControl::default());
        ctx.on_info(&SearchInfo {
            pv: vec!["e2e4".to_string(), "e2e4".to_string()],
            ..SearchInfo::default()
        });
        assert_eq!(ctx.report().return_code(), crate::AppReturnCode::EngineNote);
        ctx.worker().stop(true);
    }
}
