use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use strum_macros::{Display, EnumString};

use crate::engine::event::EngineEvent;
use crate::engine::options::OptionTable;
use crate::engine::process::{EngineLine, ProcessWriter};
use crate::engine::uci::{UciAdapter, UciParser};
use crate::engine::xboard::{XboardAdapter, XboardParser};
use crate::time::GoLimits;
use crate::util::Res;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
#[must_use]
pub enum Protocol {
    #[default]
    Uci,
    Xboard,
}

/// The position a search should start from, spelled out so adapters don't
/// need to know about boards: start + the moves played since.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct PositionSpec {
    pub startpos: bool,
    pub fen: String,
    pub moves_lan: Vec<String>,
    /// Whether white is to move in the resulting position. XBoard needs this
    /// to know whose clock goes into `time` and `otim`.
    pub white_to_move: bool,
}

/// State shared between the command (write) half and the parsing (read)
/// half of an adapter pair.
#[derive(Debug, Default)]
pub struct AdapterShared {
    /// Options the engine declared during startup.
    pub options: Mutex<OptionTable>,
    /// `id name` (UCI) or `feature myname` (XBoard).
    pub reported_name: Mutex<String>,
    pub reported_author: Mutex<String>,
    /// XBoard features collected until `done=1`.
    pub features: Mutex<BTreeMap<String, String>>,
    /// The `ping` payload the writer sent last; `pong` must echo it.
    pub last_ping: AtomicU64,
}

/// The command side of a protocol adapter. Only the worker's write thread
/// calls these; each write-like method returns the timestamp of the final
/// line it put on the wire.
pub trait EngineAdapter: Send {
    fn protocol(&self) -> Protocol;

    /// Sends the protocol identification command; the engine answers with
    /// its option/feature list terminated by `uciok` / `feature done=1`.
    fn start_protocol(&mut self) -> Res<u64>;

    fn new_game(&mut self) -> Res<()>;

    fn ask_for_ready(&mut self) -> Res<()>;

    /// Asks the engine to commit to a move right now.
    fn move_now(&mut self) -> Res<()>;

    fn set_ponder(&mut self, enabled: bool) -> Res<()>;

    fn set_test_option(&mut self, name: &str, value: &str) -> Res<()>;

    /// Starts a real search on `position`. With `ponder_hit` the in-flight
    /// ponder search is converted instead of sending a new `go`.
    fn compute_move(
        &mut self,
        position: &PositionSpec,
        limits: &GoLimits,
        ponder_hit: bool,
    ) -> Res<u64>;

    /// Starts a ponder search on the position after `ponder_move`.
    fn allow_ponder(
        &mut self,
        position: &PositionSpec,
        limits: &GoLimits,
        ponder_move: &str,
    ) -> Res<u64>;

    /// Sends `quit`. Actually killing the process is the guard's job.
    fn terminate_engine(&mut self) -> Res<()>;
}

/// The parsing side. Only the worker's read thread calls this.
pub trait EventParser: Send {
    fn parse_line(&mut self, line: EngineLine) -> EngineEvent;
}

/// Builds the matched command/parser pair for a protocol.
pub fn make_adapter(
    protocol: Protocol,
    writer: ProcessWriter,
    engine: &str,
) -> (Box<dyn EngineAdapter>, Box<dyn EventParser>, Arc<AdapterShared>) {
    let shared = Arc::new(AdapterShared::default());
    match protocol {
        Protocol::Uci => (
            Box::new(UciAdapter::new(writer, engine)),
            Box::new(UciParser::new(engine, shared.clone())),
            shared,
        ),
        Protocol::Xboard => (
            Box::new(XboardAdapter::new(writer, engine, shared.clone())),
            Box::new(XboardParser::new(engine, shared.clone())),
            shared,
        ),
    }
}
