/// One search-progress snapshot from an `info` (UCI) or thinking (XBoard)
/// line. Every field is optional; engines report whatever they have.
#[derive(Debug, Default, Clone, PartialEq)]
#[must_use]
pub struct SearchInfo {
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    pub multipv: Option<u32>,
    pub score_cp: Option<i32>,
    pub score_mate: Option<i32>,
    pub score_lowerbound: bool,
    pub score_upperbound: bool,
    pub time_ms: Option<u64>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    pub hash_full: Option<u32>,
    pub tbhits: Option<u64>,
    pub cpuload: Option<u32>,
    pub curr_move: Option<String>,
    pub curr_move_number: Option<u32>,
    /// Move strings as sent on the wire; legality is checked upstream
    /// against the shadow board.
    pub pv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum EngineEventKind {
    /// Synthesized by the adapter the instant a `go` line went out.
    ComputeMoveSent,
    ReadyOk,
    UciOk,
    BestMove {
        /// Empty for `bestmove (none)` and friends.
        best: String,
        ponder: Option<String>,
    },
    Info(SearchInfo),
    PonderHit,
    Error(String),
    Disconnected,
    NoData,
    KeepAlive,
    Unknown,
}

/// A typed event from one engine, stamped with the harness clock at the time
/// the underlying line was read (or written, for [`EngineEventKind::ComputeMoveSent`]).
#[derive(Debug, Clone)]
#[must_use]
pub struct EngineEvent {
    pub kind: EngineEventKind,
    pub engine: String,
    pub timestamp_ms: u64,
    pub raw: String,
    /// Soft protocol problems found while parsing this line. They are
    /// reported to the checklist but don't invalidate the event.
    pub errors: Vec<String>,
}

impl EngineEvent {
    pub fn new(kind: EngineEventKind, engine: &str, timestamp_ms: u64, raw: &str) -> Self {
        Self {
            kind,
            engine: engine.to_string(),
            timestamp_ms,
            raw: raw.to_string(),
            errors: vec![],
        }
    }

    pub fn disconnected(engine: &str, timestamp_ms: u64) -> Self {
        Self::new(EngineEventKind::Disconnected, engine, timestamp_ms, "")
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self.kind, EngineEventKind::NoData)
    }
}
