use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::{unbounded, Sender};

use crate::engine::adapter::{make_adapter, AdapterShared, EngineAdapter, PositionSpec};
use crate::engine::config::EngineConfig;
use crate::engine::event::{EngineEvent, EngineEventKind};
use crate::engine::{EngineError, Protocol};
use crate::engine::process::{self, ProcessGuard};
use crate::logger::{self, Message};
use crate::report::EngineReport;
use crate::time::GoLimits;
use crate::util::Res;

const PROTOCOL_START_TIMEOUT: Duration = Duration::from_millis(10_000);
const STARTUP_READY_TIMEOUT: Duration = Duration::from_millis(2000);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(5000);

/// A command for the write thread. Commands execute in FIFO order; `None` is
/// the shutdown sentinel.
type Thunk = Box<dyn FnOnce(&mut dyn EngineAdapter) -> Res<()> + Send>;

/// Receives every typed event the read thread produces.
pub type EventSink = Box<dyn Fn(EngineEvent) + Send + Sync>;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum WorkerState {
    #[default]
    Starting,
    Ready,
    Failure,
    Stopped,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeKind {
    /// `uciok` / `feature done=1`
    ProtocolOk,
    /// `readyok` / matching `pong`
    ReadyOk,
    BestMove,
}

#[derive(Debug, Default)]
struct HandshakeSlot {
    expected: Option<HandshakeKind>,
    received: bool,
    /// Set when the engine is gone; wakes and fails all waiters, forever.
    dead: bool,
}

/// A single-slot rendezvous between the read thread and whoever is waiting
/// for a protocol acknowledgement.
#[derive(Debug, Default)]
struct Handshake {
    slot: Mutex<HandshakeSlot>,
    cond: Condvar,
}

impl Handshake {
    fn arm(&self, kind: HandshakeKind) {
        let mut slot = self.slot.lock().unwrap();
        slot.expected = Some(kind);
        slot.received = false;
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        while !slot.received && !slot.dead {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _timeout) = self.cond.wait_timeout(slot, remaining).unwrap();
            slot = guard;
        }
        let received = slot.received;
        slot.expected = None;
        slot.received = false;
        received
    }

    fn observe(&self, kind: HandshakeKind) {
        let mut slot = self.slot.lock().unwrap();
        if slot.expected == Some(kind) {
            slot.received = true;
            self.cond.notify_all();
        }
    }

    fn fail(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.dead = true;
        self.cond.notify_all();
    }
}

/// One engine process with its adapter and the two threads that own it: the
/// write thread executing queued command thunks, and the read thread turning
/// output lines into [`EngineEvent`]s.
pub struct EngineWorker {
    config: EngineConfig,
    guard: ProcessGuard,
    shared: Arc<AdapterShared>,
    report: Arc<EngineReport>,
    cmd_tx: Sender<Option<Thunk>>,
    state: Arc<Mutex<WorkerState>>,
    handshake: Arc<Handshake>,
    sink: Arc<Mutex<Option<EventSink>>>,
    write_handle: Mutex<Option<JoinHandle<()>>>,
    read_handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl EngineWorker {
    /// Spawns the process and walks it through protocol startup: protocol
    /// identification, option overrides, one ready round-trip. Blocks until
    /// the engine is ready or startup failed; failure leaves no process
    /// behind.
    pub fn start(config: EngineConfig, report: Arc<EngineReport>) -> Res<Self> {
        let name = config.name.clone();
        let (writer, mut reader, guard) = process::spawn(
            &config.executable,
            &config.args,
            config.working_dir.as_deref(),
            config.stderr_file.as_deref(),
        )?;
        let (adapter, mut parser, shared) = make_adapter(config.protocol, writer, &name);
        let (cmd_tx, cmd_rx) = unbounded::<Option<Thunk>>();
        let state = Arc::new(Mutex::new(WorkerState::Starting));
        let handshake = Arc::new(Handshake::default());
        let sink: Arc<Mutex<Option<EventSink>>> = Arc::new(Mutex::new(None));

        let write_handle = {
            let state = state.clone();
            let handshake = handshake.clone();
            let name = name.clone();
            let mut adapter = adapter;
            Builder::new()
                .name(format!("write to engine {name}"))
                .spawn(move || {
                    for cmd in cmd_rx {
                        let Some(thunk) = cmd else {
                            _ = adapter.terminate_engine();
                            break;
                        };
                        if let Err(err) = thunk(&mut *adapter) {
                            logger::log(
                                Message::Warning,
                                &format!("Couldn't send a command to engine '{name}': {err}"),
                            );
                            let mut state = state.lock().unwrap();
                            if *state != WorkerState::Stopped {
                                *state = WorkerState::Failure;
                            }
                            drop(state);
                            handshake.fail();
                            break;
                        }
                    }
                })?
        };
        let read_handle = {
            let state = state.clone();
            let handshake = handshake.clone();
            let sink = sink.clone();
            let report = report.clone();
            let name = name.clone();
            Builder::new()
                .name(format!("read from engine {name}"))
                .spawn(move || loop {
                    let line = reader.read_line_blocking();
                    let event = parser.parse_line(line);
                    for error in &event.errors {
                        let topic = match &event.kind {
                            EngineEventKind::Info(_) | EngineEventKind::KeepAlive => {
                                "wrong-token-in-info-line"
                            }
                            _ if event.raw.starts_with("pong") => "pong-matches-ping",
                            _ => "parseable-output",
                        };
                        report.log_report(topic, false, Some(error));
                    }
                    match &event.kind {
                        EngineEventKind::NoData => continue,
                        EngineEventKind::UciOk => handshake.observe(HandshakeKind::ProtocolOk),
                        EngineEventKind::ReadyOk => handshake.observe(HandshakeKind::ReadyOk),
                        EngineEventKind::BestMove { .. } => {
                            handshake.observe(HandshakeKind::BestMove);
                        }
                        EngineEventKind::Disconnected => {
                            let mut state = state.lock().unwrap();
                            let stopping = *state == WorkerState::Stopped;
                            if !stopping {
                                *state = WorkerState::Failure;
                            }
                            drop(state);
                            handshake.fail();
                            if !stopping {
                                if let Some(sink) = sink.lock().unwrap().as_ref() {
                                    sink(event);
                                }
                            }
                            return;
                        }
                        _ => {}
                    }
                    if let Some(sink) = sink.lock().unwrap().as_ref() {
                        sink(event);
                    }
                })?
        };

        let worker = Self {
            config,
            guard,
            shared,
            report,
            cmd_tx,
            state,
            handshake,
            sink,
            write_handle: Mutex::new(Some(write_handle)),
            read_handle: Mutex::new(Some(read_handle)),
            stopped: AtomicBool::new(false),
        };
        worker.run_startup().inspect_err(|_err| {
            *worker.state.lock().unwrap() = WorkerState::Failure;
            worker.shutdown_process(false);
        })?;
        *worker.state.lock().unwrap() = WorkerState::Ready;
        Ok(worker)
    }

    fn run_startup(&self) -> Res<()> {
        let (protocol_ack, ready_ack) = match self.config.protocol {
            Protocol::Uci => ("uciok", "readyok"),
            Protocol::Xboard => ("feature done=1", "pong"),
        };
        self.handshake.arm(HandshakeKind::ProtocolOk);
        self.post(Box::new(|adapter| adapter.start_protocol().map(|_ts| ())));
        if !self.handshake.wait(PROTOCOL_START_TIMEOUT) {
            return Err(EngineError::HandshakeTimeout {
                engine: self.name().to_string(),
                expected: protocol_ack,
            }
            .into());
        }
        for (option, value) in self.config.options.clone() {
            self.post_option(option, value);
        }
        if self.config.ponder || self.config.protocol == Protocol::Xboard {
            let enabled = self.config.ponder;
            self.post(Box::new(move |adapter| adapter.set_ponder(enabled)));
        }
        self.handshake.arm(HandshakeKind::ReadyOk);
        self.post(Box::new(|adapter| adapter.ask_for_ready()));
        if !self.handshake.wait(STARTUP_READY_TIMEOUT) {
            return Err(EngineError::HandshakeTimeout {
                engine: self.name().to_string(),
                expected: ready_ack,
            }
            .into());
        }
        Ok(())
    }

    /// Validates an option override against the declared table and posts it.
    /// Out-of-range values are skipped with a checklist note, exactly like
    /// values an engine would reject.
    fn post_option(&self, name: String, value: String) {
        if let Some(declared) = self.shared.options.lock().unwrap().find(&name) {
            if let Err(reason) = declared.validate(&value) {
                self.report.log_report(
                    "option-values-accepted",
                    false,
                    Some(&format!("{name}={value}: {reason}")),
                );
                return;
            }
        }
        self.post(Box::new(move |adapter| adapter.set_test_option(&name, &value)));
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn report(&self) -> &Arc<EngineReport> {
        &self.report
    }

    pub fn guard(&self) -> &ProcessGuard {
        &self.guard
    }

    pub fn shared(&self) -> &Arc<AdapterShared> {
        &self.shared
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    pub fn clear_event_sink(&self) {
        *self.sink.lock().unwrap() = None;
    }

    fn post(&self, thunk: Thunk) {
        // A send error means the write thread is gone; the caller notices
        // through the failed handshake or the worker state.
        _ = self.cmd_tx.send(Some(thunk));
    }

    /// Sends `isready`/`ping` and blocks for the answer.
    pub fn request_ready(&self, timeout: Duration) -> bool {
        self.handshake.arm(HandshakeKind::ReadyOk);
        self.post(Box::new(|adapter| adapter.ask_for_ready()));
        self.handshake.wait(timeout)
    }

    /// Sets one option with a ready round-trip, so the caller knows the
    /// engine saw it. Returns false when the engine didn't answer.
    pub fn set_option(&self, name: &str, value: &str, timeout: Duration) -> bool {
        self.post_option(name.to_string(), value.to_string());
        self.request_ready(timeout)
    }

    pub fn new_game(&self) {
        self.post(Box::new(|adapter| adapter.new_game()));
    }

    /// Starts a search. The `ComputeMoveSent` event carries the timestamp of
    /// the `go` write and reaches the sink before anything the engine sends
    /// back for this search.
    pub fn compute_move(&self, position: PositionSpec, limits: GoLimits, ponder_hit: bool) {
        let sink = self.sink.clone();
        let name = self.config.name.clone();
        self.post(Box::new(move |adapter| {
            let stamp = adapter.compute_move(&position, &limits, ponder_hit)?;
            if let Some(sink) = sink.lock().unwrap().as_ref() {
                sink(EngineEvent::new(
                    EngineEventKind::ComputeMoveSent,
                    &name,
                    stamp,
                    "",
                ));
            }
            Ok(())
        }));
    }

    pub fn allow_ponder(&self, position: PositionSpec, limits: GoLimits, ponder_move: String) {
        self.post(Box::new(move |adapter| {
            adapter.allow_ponder(&position, &limits, &ponder_move).map(|_ts| ())
        }));
    }

    /// Asks the engine to commit to a move now. With `wait_for_bestmove` the
    /// call blocks until the `bestmove` arrives; false means it didn't.
    pub fn move_now(&self, wait_for_bestmove: bool, timeout: Duration) -> bool {
        if wait_for_bestmove {
            self.handshake.arm(HandshakeKind::BestMove);
        }
        self.post(Box::new(|adapter| adapter.move_now()));
        if wait_for_bestmove {
            self.handshake.wait(timeout)
        } else {
            true
        }
    }

    fn shutdown_process(&self, wait_for_join: bool) {
        // The sentinel makes the write thread send 'quit' and exit.
        _ = self.cmd_tx.send(None);
        if !self.guard.wait_for_exit(SHUTDOWN_GRACE) {
            logger::log(
                Message::Warning,
                &format!("Engine '{}' ignored 'quit', killing it", self.name()),
            );
        }
        self.guard.terminate();
        if wait_for_join {
            if let Some(handle) = self.write_handle.lock().unwrap().take() {
                _ = handle.join();
            }
            if let Some(handle) = self.read_handle.lock().unwrap().take() {
                _ = handle.join();
            }
        }
    }

    /// Stops the worker: quits the engine, gives it 5 seconds, kills it if
    /// necessary. Idempotent.
    pub fn stop(&self, wait_for_join: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().unwrap() = WorkerState::Stopped;
        self.handshake.fail();
        self.shutdown_process(wait_for_join);
    }

    /// Spawns a fresh worker with the same configuration and report, for
    /// replacing a crashed or hung engine.
    pub fn respawn(&self) -> Res<Self> {
        self.stop(false);
        Self::start(self.config.clone(), self.report.clone())
            .map_err(|err| anyhow!("Couldn't restart engine '{}': {err}", self.name()))
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        self.stop(false);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded as channel;
    use std::path::PathBuf;

    /// A shell script that behaves like a minimal, well-behaved UCI engine.
    pub(crate) const SCRIPTED_UCI_ENGINE: &str = r#"
while read line; do
  set -- $line
  case "$1" in
    uci)
      echo "id name Scripted 1.0"
      echo "id author nobody"
      echo "option name Hash type spin default 16 min 1 max 128"
      echo "option name Ponder type check default false"
      echo "uciok";;
    isready) echo "readyok";;
    go)
      echo "info depth 1 seldepth 1 score cp 23 nodes 100 time 1 pv e2e4"
      echo "bestmove e2e4";;
    stop) echo "bestmove e2e4";;
    quit) exit 0;;
  esac
done
"#;

    pub(crate) fn scripted_config(script: &str) -> EngineConfig {
        EngineConfig {
            name: "scripted".to_string(),
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ..EngineConfig::default()
        }
    }

    #[test]
    fn startup_handshake_reaches_ready() {
        let config = scripted_config(SCRIPTED_UCI_ENGINE);
        let report = Arc::new(EngineReport::new(&config.name));
        let worker = EngineWorker::start(config, report).unwrap();
        assert!(worker.is_ready());
        assert!(worker.request_ready(Duration::from_millis(2000)));
        assert_eq!(*worker.shared().reported_name.lock().unwrap(), "Scripted 1.0");
        assert_eq!(worker.shared().options.lock().unwrap().len(), 2);
        worker.stop(true);
        assert!(!worker.guard().is_running());
    }

    #[test]
    fn compute_move_delivers_events_in_wire_order() {
        let config = scripted_config(SCRIPTED_UCI_ENGINE);
        let report = Arc::new(EngineReport::new(&config.name));
        let worker = EngineWorker::start(config, report).unwrap();
        let (tx, rx) = channel();
        worker.set_event_sink(Box::new(move |event| _ = tx.send(event)));
        worker.compute_move(
            PositionSpec {
                startpos: true,
                white_to_move: true,
                ..PositionSpec::default()
            },
            GoLimits {
                movetime_ms: Some(10),
                ..GoLimits::default()
            },
            false,
        );
        let first = rx.recv_timeout(Duration::from_millis(2000)).unwrap();
        assert_eq!(first.kind, EngineEventKind::ComputeMoveSent);
        let second = rx.recv_timeout(Duration::from_millis(2000)).unwrap();
        assert!(matches!(second.kind, EngineEventKind::Info(_)));
        let third = rx.recv_timeout(Duration::from_millis(2000)).unwrap();
        assert!(
            matches!(third.kind, EngineEventKind::BestMove { ref best, .. } if best == "e2e4")
        );
        assert!(third.timestamp_ms >= first.timestamp_ms);
        worker.stop(true);
    }

    #[test]
    fn out_of_range_option_overrides_are_skipped() {
        let mut config = scripted_config(SCRIPTED_UCI_ENGINE);
        _ = config
            .options
            .insert("Hash".to_string(), "4096".to_string());
        let report = Arc::new(EngineReport::new(&config.name));
        let worker = EngineWorker::start(config, report.clone()).unwrap();
        assert!(worker.is_ready());
        assert_eq!(report.return_code(), crate::AppReturnCode::EngineNote);
        worker.stop(true);
    }

    #[test]
    fn a_mute_engine_fails_startup() {
        let config = scripted_config("while read line; do :; done");
        let report = Arc::new(EngineReport::new(&config.name));
        let result = EngineWorker::start(config, report);
        assert!(result.is_err());
    }

    #[test]
    fn disconnect_reaches_the_sink() {
        let script = r#"
while read line; do
  case "$line" in
    uci) echo "uciok";;
    isready) echo "readyok";;
    go*) exit 7;;
  esac
done
"#;
        let config = scripted_config(script);
        let report = Arc::new(EngineReport::new(&config.name));
        let worker = EngineWorker::start(config, report).unwrap();
        let (tx, rx) = channel();
        worker.set_event_sink(Box::new(move |event| _ = tx.send(event)));
        worker.compute_move(PositionSpec::default(), GoLimits::default(), false);
        let mut saw_disconnect = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(3000)) {
            if event.kind == EngineEventKind::Disconnected {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect);
        assert_eq!(worker.state(), WorkerState::Failure);
        worker.stop(true);
    }
}
