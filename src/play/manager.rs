use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use shakmaty::Color;

use crate::engine::event::{EngineEvent, EngineEventKind};
use crate::engine::{EngineError, EngineWorker};
use crate::game::{GameEndCause, GameOutcome, GameRecord, GameState, MoveRecord};
use crate::logger::{self, Message};
use crate::pgn::PgnWriter;
use crate::play::player::{BestMoveVerdict, PlayerContext, TimeoutAction};
use crate::play::task::{GameTask, TaskProvider, TaskType};
use crate::time::GoLimits;
use crate::util::Res;

/// The event queue wakes up at least this often for keep-alive checks.
const EVENT_POLL: Duration = Duration::from_millis(1000);
const GAME_READY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Settings every manager of a pool shares.
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    /// Adjudicate games longer than this many plies as drawn.
    pub max_plies: Option<usize>,
    pub pgn: Option<Arc<PgnWriter>>,
    pub event: String,
    pub site: String,
}

/// The two player contexts of one running game, in board orientation.
struct Sides {
    white: PlayerContext,
    black: PlayerContext,
}

impl Sides {
    fn get_mut(&mut self, color: Color) -> &mut PlayerContext {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }

    fn get(&self, color: Color) -> &PlayerContext {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }
}

/// Runs one game at a time against one or two engine workers. A manager is
/// bound to its engines for the lifetime of a task provider assignment; the
/// pool gives each manager its own thread.
pub struct GameManager {
    /// One entry for self-play, two for a pairing.
    engines: Vec<Arc<EngineWorker>>,
    settings: ManagerSettings,
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
}

impl GameManager {
    pub fn new(settings: ManagerSettings) -> Self {
        let (tx, rx) = unbounded();
        Self {
            engines: vec![],
            settings,
            tx,
            rx,
        }
    }

    /// Self-play: one engine occupies both sides. Pondering stays off.
    pub fn set_unique_engine(&mut self, worker: Arc<EngineWorker>) {
        self.engines = vec![worker];
        self.wire_sinks();
    }

    pub fn set_engines(&mut self, first: Arc<EngineWorker>, second: Arc<EngineWorker>) {
        self.engines = vec![first, second];
        self.wire_sinks();
    }

    fn unique(&self) -> bool {
        self.engines.len() == 1
    }

    /// Quits all bound engines and waits for their threads.
    pub fn stop_engines(&self) {
        for worker in &self.engines {
            if let Some(kb) = worker.guard().memory_usage_kb() {
                logger::log(
                    Message::Debug,
                    &format!("Engine '{}' is using {kb} kB resident", worker.name()),
                );
            }
            worker.stop(true);
        }
    }

    fn wire_sinks(&self) {
        for worker in &self.engines {
            let tx = self.tx.clone();
            worker.set_event_sink(Box::new(move |event| _ = tx.send(event)));
        }
    }

    fn drain_events(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// The engine indices playing white and black for this task.
    fn orientation(&self, switch_side: bool) -> (usize, usize) {
        if self.unique() {
            (0, 0)
        } else if switch_side {
            (1, 0)
        } else {
            (0, 1)
        }
    }

    fn respawn_engine(&mut self, index: usize) -> Res<Arc<EngineWorker>> {
        let fresh = Arc::new(self.engines[index].respawn()?);
        self.engines[index] = fresh.clone();
        self.wire_sinks();
        Ok(fresh)
    }

    /// Fetches tasks from the provider until it is exhausted, reporting each
    /// finished record back.
    pub fn compute_tasks(&mut self, provider: &Arc<dyn TaskProvider>) -> Res<()> {
        loop {
            let (first, second) = self.orientation(false);
            let white_id = self.engines[first].name().to_string();
            let black_id = self.engines[second].name().to_string();
            let Some(task) = provider.next_task(&white_id, &black_id) else {
                return Ok(());
            };
            let task_id = task.task_id;
            match task.task_type {
                TaskType::FetchNextTask => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                TaskType::PlayGame => {
                    let record = self.compute_game(task, Some(provider))?;
                    provider.set_game_record(task_id, &record);
                }
                TaskType::ComputeMove => {
                    let record = self.compute_move_task(task, Some(provider))?;
                    provider.set_game_record(task_id, &record);
                }
            }
        }
    }

    /// Plays one complete game and returns its record.
    pub fn compute_game(
        &mut self,
        task: GameTask,
        provider: Option<&Arc<dyn TaskProvider>>,
    ) -> Res<GameRecord> {
        let mut record = task.record;
        record.round = task.round;
        let (white_idx, black_idx) = self.orientation(task.switch_side);
        self.prepare_record(&mut record, white_idx, black_idx);

        let mut auth = GameState::from_start(record.startpos, record.fen.as_deref())?;
        for mv in &record.moves[..record.current_ply] {
            let mv = auth.string_to_move(&mv.lan, true)?;
            auth.do_move(&mv);
        }

        let mut sides = Sides {
            white: self.make_context(white_idx, Color::White, &auth, &record),
            black: self.make_context(black_idx, Color::Black, &auth, &record),
        };
        self.drain_events();
        if let Err(side) = self.greet_engines(white_idx, black_idx) {
            record.set_result(GameEndCause::Disconnected, GameOutcome::loss_for(side));
            self.finish_game(&mut record, &mut sides);
            return Ok(record);
        }

        'game: while !record.is_finished() {
            let (cause, outcome) = auth.game_result();
            if cause != GameEndCause::Ongoing {
                record.set_result(cause, outcome);
                break;
            }
            if self
                .settings
                .max_plies
                .is_some_and(|max| auth.ply() >= max)
            {
                record.set_result(GameEndCause::Adjudication, GameOutcome::Draw);
                break;
            }
            let side = auth.side_to_move();
            let limits = self.limits_for(side, &sides);
            let engine_idx = if side == Color::White { white_idx } else { black_idx };

            // Start (or convert) the search for the side to move.
            let active = sides.get_mut(side);
            if active.is_pondering() {
                if active.ponder_lan() == auth.last_lan() {
                    active.take_ponder_hit();
                    active.start_search(limits, true);
                } else {
                    let last = auth.last_lan().unwrap_or_default().to_string();
                    if !active.ponder_miss(&last) {
                        self.handle_lost_engine(&mut record, side, engine_idx)?;
                        break 'game;
                    }
                    active.start_search(limits, false);
                }
            } else {
                active.start_search(limits, false);
            }

            // Process events until this move is resolved.
            'event: loop {
                let event = match self.rx.recv_timeout(EVENT_POLL) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        if sides.get_mut(side).check_engine_timeout() == TimeoutAction::RestartNeeded
                        {
                            self.handle_lost_engine(&mut record, side, engine_idx)?;
                            break 'game;
                        }
                        continue 'event;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        bail!("The manager's event queue was closed unexpectedly")
                    }
                };
                let Some(event_color) = self.route_event(&event, side, &sides) else {
                    continue 'event;
                };
                match event.kind {
                    EngineEventKind::ComputeMoveSent if event_color == side => {
                        sides.get_mut(side).on_compute_sent(event.timestamp_ms);
                    }
                    EngineEventKind::Info(ref info) => {
                        let ctx = sides.get_mut(event_color);
                        ctx.on_info(info);
                        if let (Some(provider), false) = (provider, info.pv.is_empty()) {
                            let elapsed = sides.get(event_color).search_elapsed(event.timestamp_ms);
                            let stop = provider.set_pv(
                                &event.engine,
                                &info.pv,
                                elapsed,
                                info.depth.unwrap_or(0),
                                info.nodes.unwrap_or(0),
                                info.multipv.unwrap_or(1),
                            );
                            if stop && event_color == side {
                                _ = sides.get(side).worker().move_now(false, Duration::ZERO);
                            }
                        }
                    }
                    EngineEventKind::BestMove { ref best, ref ponder } => {
                        if sides.get_mut(event_color).take_bestmove_discard() {
                            // the answer to a flushed ponder search
                            continue 'event;
                        }
                        if event_color != side {
                            // An engine moved without being asked.
                            sides.get(event_color).worker().report().log_report(
                                "bestmove-only-when-searching",
                                false,
                                Some(best),
                            );
                            record.set_result(
                                GameEndCause::IllegalMove,
                                GameOutcome::loss_for(event_color),
                            );
                            break 'game;
                        }
                        let best = best.clone();
                        let ponder_hint = ponder.clone();
                        let verdict =
                            sides
                                .get_mut(side)
                                .on_best_move(&best, ponder_hint.as_deref(), event.timestamp_ms);
                        match verdict {
                            BestMoveVerdict::Legal(move_record) => {
                                self.apply_legal_move(
                                    &mut auth,
                                    &mut record,
                                    &mut sides,
                                    side,
                                    move_record,
                                    ponder_hint.as_deref(),
                                )?;
                                break 'event;
                            }
                            BestMoveVerdict::Illegal | BestMoveVerdict::NoMove => {
                                let fault = EngineError::ProtocolViolation {
                                    engine: sides.get(side).worker().name().to_string(),
                                    what: format!("unplayable best move '{best}'"),
                                };
                                logger::log(Message::Warning, &fault.to_string());
                                record.set_result(
                                    GameEndCause::IllegalMove,
                                    GameOutcome::loss_for(side),
                                );
                                break 'game;
                            }
                            BestMoveVerdict::TimeLoss => {
                                let fault = EngineError::TimeViolation {
                                    engine: sides.get(side).worker().name().to_string(),
                                    what: "the move arrived after the clock ran out".to_string(),
                                };
                                logger::log(Message::Warning, &fault.to_string());
                                record.set_result(
                                    GameEndCause::Timeout,
                                    GameOutcome::loss_for(side),
                                );
                                break 'game;
                            }
                        }
                    }
                    EngineEventKind::Disconnected => {
                        let idx = if event_color == Color::White { white_idx } else { black_idx };
                        self.handle_lost_engine(&mut record, event_color, idx)?;
                        break 'game;
                    }
                    _ => {}
                }
            }
        }
        self.finish_game(&mut record, &mut sides);
        Ok(record)
    }

    /// Searches the task's position once with the first engine and records
    /// the chosen move; used by analysis-style providers like EPD suites.
    pub fn compute_move_task(
        &mut self,
        task: GameTask,
        provider: Option<&Arc<dyn TaskProvider>>,
    ) -> Res<GameRecord> {
        let mut record = task.record;
        let auth = GameState::from_start(record.startpos, record.fen.as_deref())?;
        let side = auth.side_to_move();
        self.prepare_record(&mut record, 0, 0);
        let mut ctx = self.make_context(0, side, &auth, &record);
        self.drain_events();
        self.engines[0].new_game();
        if !self.engines[0].request_ready(GAME_READY_TIMEOUT) {
            record.set_result(GameEndCause::Disconnected, GameOutcome::loss_for(side));
            return Ok(record);
        }
        let limits = GoLimits::compute(
            side,
            (ctx.tc(), ctx.clock()),
            (ctx.tc(), ctx.clock()),
        );
        ctx.start_search(limits, false);
        loop {
            let event = match self.rx.recv_timeout(EVENT_POLL) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.check_engine_timeout() == TimeoutAction::RestartNeeded {
                        _ = self.respawn_engine(0)?;
                        record.set_result(GameEndCause::Disconnected, GameOutcome::loss_for(side));
                        return Ok(record);
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("The manager's event queue was closed unexpectedly")
                }
            };
            match event.kind {
                EngineEventKind::ComputeMoveSent => ctx.on_compute_sent(event.timestamp_ms),
                EngineEventKind::Info(ref info) => {
                    ctx.on_info(info);
                    if let (Some(provider), false) = (provider, info.pv.is_empty()) {
                        let elapsed = ctx.search_elapsed(event.timestamp_ms);
                        if provider.set_pv(
                            &event.engine,
                            &info.pv,
                            elapsed,
                            info.depth.unwrap_or(0),
                            info.nodes.unwrap_or(0),
                            info.multipv.unwrap_or(1),
                        ) {
                            _ = ctx.worker().move_now(false, Duration::ZERO);
                        }
                    }
                }
                EngineEventKind::BestMove { ref best, ref ponder } => {
                    match ctx.on_best_move(best, ponder.as_deref(), event.timestamp_ms) {
                        BestMoveVerdict::Legal(move_record) => {
                            record.push_move(move_record);
                        }
                        BestMoveVerdict::TimeLoss => {
                            record.set_result(GameEndCause::Timeout, GameOutcome::loss_for(side));
                        }
                        _ => {
                            record.set_result(
                                GameEndCause::IllegalMove,
                                GameOutcome::loss_for(side),
                            );
                        }
                    }
                    return Ok(record);
                }
                EngineEventKind::Disconnected => {
                    _ = self.respawn_engine(0)?;
                    record.set_result(GameEndCause::Disconnected, GameOutcome::loss_for(side));
                    return Ok(record);
                }
                _ => {}
            }
        }
    }

    fn prepare_record(&self, record: &mut GameRecord, white_idx: usize, black_idx: usize) {
        record.white_name = self.engines[white_idx].name().to_string();
        record.black_name = self.engines[black_idx].name().to_string();
        if record.white_tc.limit_count() == 0 {
            record.white_tc = self.engines[white_idx].config().tc.clone();
        }
        if record.black_tc.limit_count() == 0 {
            record.black_tc = self.engines[black_idx].config().tc.clone();
        }
        if !self.settings.event.is_empty() {
            _ = record
                .tags
                .entry("Event".to_string())
                .or_insert_with(|| self.settings.event.clone());
        }
        if !self.settings.site.is_empty() {
            _ = record
                .tags
                .entry("Site".to_string())
                .or_insert_with(|| self.settings.site.clone());
        }
    }

    fn make_context(
        &self,
        engine_idx: usize,
        color: Color,
        auth: &GameState,
        record: &GameRecord,
    ) -> PlayerContext {
        let worker = self.engines[engine_idx].clone();
        let ponder = worker.config().ponder && !self.unique();
        let mut ctx = PlayerContext::new(worker, ponder);
        ctx.begin_game(color, auth.clone(), record.tc_of(color).clone());
        ctx
    }

    /// Sends `ucinewgame` and a ready check to every engine of this game.
    /// An unresponsive engine loses before the first move.
    fn greet_engines(&self, white_idx: usize, black_idx: usize) -> Result<(), Color> {
        let indices = if self.unique() {
            vec![0]
        } else {
            vec![white_idx, black_idx]
        };
        for &idx in &indices {
            self.engines[idx].new_game();
            if !self.engines[idx].request_ready(GAME_READY_TIMEOUT) {
                let color = if idx == white_idx { Color::White } else { Color::Black };
                self.engines[idx]
                    .report()
                    .log_report("no-disconnect", false, Some("no answer before the game"));
                return Err(color);
            }
        }
        Ok(())
    }

    fn limits_for(&self, side: Color, sides: &Sides) -> GoLimits {
        GoLimits::compute(
            side,
            (sides.white.tc(), sides.white.clock()),
            (sides.black.tc(), sides.black.clock()),
        )
    }

    /// Decides which side an event belongs to. With a unique engine all
    /// events go to the side to move.
    fn route_event(&self, event: &EngineEvent, active: Color, sides: &Sides) -> Option<Color> {
        if self.unique() {
            return Some(active);
        }
        if sides.white.worker().name() == event.engine {
            Some(Color::White)
        } else if sides.black.worker().name() == event.engine {
            Some(Color::Black)
        } else {
            // an event from a worker that was already replaced
            None
        }
    }

    fn apply_legal_move(
        &mut self,
        auth: &mut GameState,
        record: &mut GameRecord,
        sides: &mut Sides,
        side: Color,
        move_record: MoveRecord,
        ponder_hint: Option<&str>,
    ) -> Res<()> {
        let lan = move_record.lan.clone();
        let mv = auth
            .string_to_move(&lan, true)
            .map_err(|err| anyhow!("Shadow and authoritative board diverged: {err}"))?;
        auth.do_move(&mv);
        let shadow = sides.get(side).current_fen();
        if shadow != auth.current_fen() {
            crate::fatal_invariant(&format!(
                "shadow board '{shadow}' diverged from the game board '{}' after '{lan}'",
                auth.current_fen()
            ));
        }
        record.push_move(move_record);

        // Catch a non-pondering opponent's shadow board up. A pondering
        // opponent resolves hit or miss when its own turn starts.
        if !sides.get(!side).is_pondering() {
            sides.get_mut(!side).apply_opponent_move(&lan);
        }

        // The mover may now ponder on its predicted reply.
        let (cause, _) = auth.game_result();
        if cause == GameEndCause::Ongoing && !self.unique() {
            if let Some(hint) = ponder_hint {
                if sides.get(side).ponder_enabled() {
                    let limits = self.limits_for(side, sides);
                    _ = sides.get_mut(side).start_ponder(hint, limits);
                }
            }
        }
        Ok(())
    }

    /// Ends the game against a crashed or hung engine and brings a fresh
    /// process up for the next one.
    fn handle_lost_engine(
        &mut self,
        record: &mut GameRecord,
        side: Color,
        engine_idx: usize,
    ) -> Res<()> {
        record.set_result(GameEndCause::Disconnected, GameOutcome::loss_for(side));
        let report = self.engines[engine_idx].report().clone();
        report.log_report("no-disconnect", false, Some("engine lost during a game"));
        let fault = EngineError::Disconnect {
            engine: self.engines[engine_idx].name().to_string(),
        };
        logger::log(Message::Warning, &format!("{fault}, starting a fresh one"));
        _ = self.respawn_engine(engine_idx)?;
        Ok(())
    }

    /// Cancels leftover ponder searches, stamps the result, writes the PGN.
    fn finish_game(&self, record: &mut GameRecord, sides: &mut Sides) {
        for color in [Color::White, Color::Black] {
            let ctx = sides.get_mut(color);
            if ctx.is_pondering() {
                _ = ctx.worker().move_now(false, Duration::ZERO);
            }
        }
        if !record.is_finished() {
            record.set_result(GameEndCause::Aborted, GameOutcome::Draw);
        }
        if let Some(pgn) = &self.settings.pgn {
            if let Err(err) = pgn.save_game(record) {
                logger::log(Message::Warning, &format!("Couldn't write the PGN: {err}"));
            }
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;
    use crate::report::EngineReport;
    use crate::time::TimeControl;
    use std::path::PathBuf;

    /// A scripted engine that answers each `go` with the next move from a
    /// fixed list, indexed by the ply count of the received position. The
    /// same list serves both colors.
    pub(crate) fn scripted_mover(moves: &str) -> String {
        format!(
            r#"
MOVES="{moves}"
pos=""
while read line; do
  set -- $line
  case "$1" in
    uci) echo "uciok";;
    isready) echo "readyok";;
    position) pos="$*";;
    go)
      n=0; past=0
      for w in $pos; do
        if [ "$past" = "1" ]; then n=$((n+1)); fi
        if [ "$w" = "moves" ]; then past=1; fi
      done
      i=0
      for m in $MOVES; do
        if [ "$i" = "$n" ]; then echo "bestmove $m"; break; fi
        i=$((i+1))
      done;;
    quit) exit 0;;
  esac
done
"#
        )
    }

    pub(crate) fn start_scripted(name: &str, script: &str) -> Arc<EngineWorker> {
        let config = EngineConfig {
            name: name.to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            tc: TimeControl::fixed_movetime(1000),
            ..EngineConfig::default()
        };
        let report = Arc::new(EngineReport::new(&config.name));
        Arc::new(EngineWorker::start(config, report).unwrap())
    }

    fn play_task() -> GameTask {
        GameTask {
            record: GameRecord::new(true, None),
            round: 1,
            ..GameTask::default()
        }
    }

    #[test]
    fn knight_shuffles_end_in_a_repetition_draw() {
        let script = scripted_mover("g1f3 g8f6 f3g1 f6g8 g1f3 g8f6 f3g1 f6g8");
        let mut manager = GameManager::new(ManagerSettings::default());
        manager.set_engines(
            start_scripted("shuffler-a", &script),
            start_scripted("shuffler-b", &script),
        );
        let record = manager.compute_game(play_task(), None).unwrap();
        assert_eq!(record.cause(), GameEndCause::Repetition);
        assert_eq!(record.outcome(), GameOutcome::Draw);
        assert_eq!(record.moves.len(), 8);
        assert_eq!(record.moves[0].lan, "g1f3");
        assert_eq!(record.moves[0].san, "Nf3");
        manager.stop_engines();
    }

    #[test]
    fn an_illegal_reply_loses_the_game() {
        // Black's scripted second ply repeats white's first move, which is
        // illegal with a knight already on f3.
        let script = scripted_mover("g1f3 g1f3");
        let mut manager = GameManager::new(ManagerSettings::default());
        manager.set_engines(
            start_scripted("illegal-a", &script),
            start_scripted("illegal-b", &script),
        );
        let record = manager.compute_game(play_task(), None).unwrap();
        assert_eq!(record.cause(), GameEndCause::IllegalMove);
        assert_eq!(record.outcome(), GameOutcome::WhiteWins);
        assert_eq!(record.moves.len(), 1);
        manager.stop_engines();
    }

    #[test]
    fn self_play_with_a_unique_engine() {
        let script = scripted_mover("e2e4 e7e5 d1h5 b8c6 f1c4 g8f6 h5f7");
        let mut manager = GameManager::new(ManagerSettings::default());
        manager.set_unique_engine(start_scripted("solo", &script));
        let record = manager.compute_game(play_task(), None).unwrap();
        assert_eq!(record.cause(), GameEndCause::Checkmate);
        assert_eq!(record.outcome(), GameOutcome::WhiteWins);
        assert_eq!(record.moves.len(), 7);
        manager.stop_engines();
    }

    #[test]
    fn a_crashing_engine_forfeits_and_is_replaced() {
        let crasher = r#"
while read line; do
  case "$line" in
    uci) echo "uciok";;
    isready) echo "readyok";;
    go*) exit 3;;
  esac
done
"#;
        let script = scripted_mover("e2e4");
        let mut manager = GameManager::new(ManagerSettings::default());
        manager.set_engines(
            start_scripted("survivor", &script),
            start_scripted("crasher", crasher),
        );
        let record = manager.compute_game(play_task(), None).unwrap();
        assert_eq!(record.cause(), GameEndCause::Disconnected);
        assert_eq!(record.outcome(), GameOutcome::WhiteWins);
        // the replacement engine is alive and answers
        assert!(manager.engines[1].is_ready());
        assert!(manager.engines[1].request_ready(Duration::from_millis(2000)));
        manager.stop_engines();
    }

    #[test]
    fn compute_move_records_a_single_search() {
        let script = scripted_mover("e2e4");
        let mut manager = GameManager::new(ManagerSettings::default());
        manager.set_unique_engine(start_scripted("analyst", &script));
        let mut record = GameRecord::new(true, None);
        record.white_tc = TimeControl::fixed_movetime(1000);
        record.black_tc = record.white_tc.clone();
        let task = GameTask {
            task_type: TaskType::ComputeMove,
            record,
            ..GameTask::default()
        };
        let record = manager.compute_move_task(task, None).unwrap();
        assert_eq!(record.moves.len(), 1);
        assert_eq!(record.moves[0].lan, "e2e4");
        assert!(!record.is_finished());
        manager.stop_engines();
    }
}
