use std::sync::Arc;

use itertools::Itertools;

use crate::engine::adapter::{AdapterShared, EngineAdapter, EventParser, PositionSpec, Protocol};
use crate::engine::event::{EngineEvent, EngineEventKind, SearchInfo};
use crate::engine::options::EngineOption;
use crate::engine::process::{EngineLine, LineError, ProcessWriter};
use crate::logger;
use crate::time::GoLimits;
use crate::util::{tokens, Res, Tokens};

/// Sanity bounds for `info` values. Anything outside is reported as a
/// protocol note and the value is dropped.
const SCORE_CP_BOUND: i32 = 110_000;
const MATE_BOUND: i32 = 10_000;
const SELDEPTH_MAX: u32 = 1000;
const PERMILLE_MAX: u32 = 1000;

/// The command half of the UCI adapter.
#[derive(Debug)]
pub struct UciAdapter {
    writer: ProcessWriter,
    engine: String,
}

impl UciAdapter {
    pub fn new(writer: ProcessWriter, engine: &str) -> Self {
        Self {
            writer,
            engine: engine.to_string(),
        }
    }

    fn send(&mut self, line: &str) -> Res<u64> {
        logger::engine_send(&self.engine, line);
        self.writer.write_line(line)
    }

    fn position_line(position: &PositionSpec) -> String {
        let mut line = if position.startpos {
            "position startpos".to_string()
        } else {
            format!("position fen {}", position.fen)
        };
        if !position.moves_lan.is_empty() {
            line.push_str(" moves ");
            line.push_str(&position.moves_lan.iter().join(" "));
        }
        line
    }

    fn go_line(limits: &GoLimits, ponder: bool) -> String {
        let mut line = "go".to_string();
        if ponder {
            line.push_str(" ponder");
        }
        if let Some(wtime) = limits.wtime_ms {
            line.push_str(&format!(" wtime {wtime}"));
            if limits.winc_ms > 0 {
                line.push_str(&format!(" winc {}", limits.winc_ms));
            }
        }
        if let Some(btime) = limits.btime_ms {
            line.push_str(&format!(" btime {btime}"));
            if limits.binc_ms > 0 {
                line.push_str(&format!(" binc {}", limits.binc_ms));
            }
        }
        if let Some(mtg) = limits.moves_to_go {
            line.push_str(&format!(" movestogo {mtg}"));
        }
        if let Some(movetime) = limits.movetime_ms {
            line.push_str(&format!(" movetime {movetime}"));
        }
        if let Some(depth) = limits.depth {
            line.push_str(&format!(" depth {depth}"));
        }
        if let Some(nodes) = limits.nodes {
            line.push_str(&format!(" nodes {nodes}"));
        }
        if let Some(mate) = limits.mate_in {
            line.push_str(&format!(" mate {mate}"));
        }
        if limits.infinite || line == "go" || (ponder && line == "go ponder") {
            line.push_str(" infinite");
        }
        line
    }
}

impl EngineAdapter for UciAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Uci
    }

    fn start_protocol(&mut self) -> Res<u64> {
        self.send("uci")
    }

    fn new_game(&mut self) -> Res<()> {
        _ = self.send("ucinewgame")?;
        Ok(())
    }

    fn ask_for_ready(&mut self) -> Res<()> {
        _ = self.send("isready")?;
        Ok(())
    }

    fn move_now(&mut self) -> Res<()> {
        _ = self.send("stop")?;
        Ok(())
    }

    fn set_ponder(&mut self, enabled: bool) -> Res<()> {
        _ = self.send(&format!("setoption name Ponder value {enabled}"))?;
        Ok(())
    }

    fn set_test_option(&mut self, name: &str, value: &str) -> Res<()> {
        let line = if value.is_empty() {
            format!("setoption name {name}")
        } else {
            format!("setoption name {name} value {value}")
        };
        _ = self.send(&line)?;
        Ok(())
    }

    fn compute_move(
        &mut self,
        position: &PositionSpec,
        limits: &GoLimits,
        ponder_hit: bool,
    ) -> Res<u64> {
        if ponder_hit {
            return self.send("ponderhit");
        }
        _ = self.send(&Self::position_line(position))?;
        self.send(&Self::go_line(limits, false))
    }

    fn allow_ponder(
        &mut self,
        position: &PositionSpec,
        limits: &GoLimits,
        ponder_move: &str,
    ) -> Res<u64> {
        let mut position = position.clone();
        position.moves_lan.push(ponder_move.to_string());
        _ = self.send(&Self::position_line(&position))?;
        self.send(&Self::go_line(limits, true))
    }

    fn terminate_engine(&mut self) -> Res<()> {
        // The pipe may already be gone; that's fine, the guard kills anyway.
        _ = self.send("quit");
        Ok(())
    }
}

/// The parsing half of the UCI adapter.
#[derive(Debug)]
pub struct UciParser {
    engine: String,
    shared: Arc<AdapterShared>,
    collecting_options: bool,
}

impl UciParser {
    pub fn new(engine: &str, shared: Arc<AdapterShared>) -> Self {
        Self {
            engine: engine.to_string(),
            shared,
            collecting_options: true,
        }
    }

    fn handle_id(&self, mut words: Tokens) {
        let Some(kind) = words.next() else { return };
        let rest = words.join(" ");
        match kind {
            "name" => *self.shared.reported_name.lock().unwrap() = rest,
            "author" => *self.shared.reported_author.lock().unwrap() = rest,
            _ => {}
        }
    }
}

impl EventParser for UciParser {
    fn parse_line(&mut self, line: EngineLine) -> EngineEvent {
        let stamp = line.timestamp_ms;
        let raw = line.content.as_str();
        match line.error {
            Some(LineError::Terminated) => {
                return EngineEvent::disconnected(&self.engine, stamp);
            }
            Some(LineError::IncompleteLine) => {
                let mut event = EngineEvent::new(
                    EngineEventKind::Error("incomplete line before EOF".to_string()),
                    &self.engine,
                    stamp,
                    raw,
                );
                event.errors.push("incomplete-line".to_string());
                return event;
            }
            None => {}
        }
        logger::engine_recv(&self.engine, raw);
        let mut words = tokens(raw);
        let Some(first) = words.next() else {
            return EngineEvent::new(EngineEventKind::NoData, &self.engine, stamp, raw);
        };
        match first {
            "id" => {
                self.handle_id(words);
                EngineEvent::new(EngineEventKind::NoData, &self.engine, stamp, raw)
            }
            "option" => {
                let mut event = EngineEvent::new(EngineEventKind::NoData, &self.engine, stamp, raw);
                match EngineOption::parse_declaration(words) {
                    Ok(option) => self.shared.options.lock().unwrap().add(option),
                    Err(err) => event.errors.push(format!("malformed option line: {err}")),
                }
                if !self.collecting_options {
                    event
                        .errors
                        .push("option declared outside the startup phase".to_string());
                }
                event
            }
            "uciok" => {
                self.collecting_options = false;
                let mut event = EngineEvent::new(EngineEventKind::UciOk, &self.engine, stamp, raw);
                if words.next().is_some() {
                    event.errors.push("trailing tokens after 'uciok'".to_string());
                }
                event
            }
            "readyok" => {
                let mut event = EngineEvent::new(EngineEventKind::ReadyOk, &self.engine, stamp, raw);
                if words.next().is_some() {
                    event
                        .errors
                        .push("trailing tokens after 'readyok'".to_string());
                }
                event
            }
            "bestmove" => {
                let (kind, errors) = parse_bestmove(words);
                let mut event = EngineEvent::new(kind, &self.engine, stamp, raw);
                event.errors = errors;
                event
            }
            "info" => {
                let mut peek = words.clone();
                if peek.next() == Some("string") {
                    return EngineEvent::new(EngineEventKind::KeepAlive, &self.engine, stamp, raw);
                }
                let (info, errors) = parse_info(words);
                let mut event =
                    EngineEvent::new(EngineEventKind::Info(info), &self.engine, stamp, raw);
                event.errors = errors;
                event
            }
            _ => EngineEvent::new(EngineEventKind::Unknown, &self.engine, stamp, raw),
        }
    }
}

fn parse_bestmove(mut words: Tokens) -> (EngineEventKind, Vec<String>) {
    let mut errors = vec![];
    let best = match words.next() {
        Some("(none)" | "none" | "null" | "0000") => String::new(),
        Some(text) => text.to_string(),
        None => {
            errors.push("missing move after 'bestmove'".to_string());
            String::new()
        }
    };
    let mut ponder = None;
    match words.next() {
        Some("ponder") => match words.next() {
            Some(text) => ponder = Some(text.to_string()),
            None => errors.push("missing move after 'ponder'".to_string()),
        },
        Some(other) => errors.push(format!("unexpected token '{other}' after the best move")),
        None => {}
    }
    if words.next().is_some() {
        errors.push("trailing tokens after the ponder move".to_string());
    }
    (EngineEventKind::BestMove { best, ponder }, errors)
}

/// Parses the tokens of an `info` line (without the leading `info`).
/// Unknown tokens and out-of-range values are collected as soft errors;
/// parsing never aborts.
pub fn parse_info(mut words: Tokens) -> (SearchInfo, Vec<String>) {
    let mut info = SearchInfo::default();
    let mut errors = vec![];

    fn set<T>(slot: &mut Option<T>, value: T, name: &str, errors: &mut Vec<String>) {
        if slot.is_some() {
            errors.push(format!("duplicate info field '{name}'"));
        }
        *slot = Some(value);
    }
    fn next_int<T: std::str::FromStr>(
        words: &mut Tokens,
        name: &str,
        errors: &mut Vec<String>,
    ) -> Option<T> {
        match words.next() {
            Some(text) => match text.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    errors.push(format!("'{text}' is not a valid value for '{name}'"));
                    None
                }
            },
            None => {
                errors.push(format!("info line ends after '{name}'"));
                None
            }
        }
    }

    while let Some(key) = words.next() {
        match key {
            "depth" => {
                if let Some(v) = next_int::<u32>(&mut words, key, &mut errors) {
                    set(&mut info.depth, v, key, &mut errors);
                }
            }
            "seldepth" => {
                if let Some(v) = next_int::<u32>(&mut words, key, &mut errors) {
                    if v > SELDEPTH_MAX {
                        errors.push(format!("seldepth {v} is beyond any plausible search"));
                    } else {
                        set(&mut info.seldepth, v, key, &mut errors);
                    }
                }
            }
            "multipv" => {
                if let Some(v) = next_int::<u32>(&mut words, key, &mut errors) {
                    set(&mut info.multipv, v, key, &mut errors);
                }
            }
            "time" => {
                if let Some(v) = next_int::<u64>(&mut words, key, &mut errors) {
                    set(&mut info.time_ms, v, key, &mut errors);
                }
            }
            "nodes" => {
                if let Some(v) = next_int::<u64>(&mut words, key, &mut errors) {
                    set(&mut info.nodes, v, key, &mut errors);
                }
            }
            "nps" => {
                if let Some(v) = next_int::<i64>(&mut words, key, &mut errors) {
                    if v < 0 {
                        errors.push(format!("negative nps {v}"));
                    } else {
                        set(&mut info.nps, v as u64, key, &mut errors);
                    }
                }
            }
            "tbhits" | "sbhits" => {
                if let Some(v) = next_int::<u64>(&mut words, key, &mut errors) {
                    set(&mut info.tbhits, v, key, &mut errors);
                }
            }
            "hashfull" => {
                if let Some(v) = next_int::<u32>(&mut words, key, &mut errors) {
                    if v > PERMILLE_MAX {
                        errors.push(format!("hashfull {v} is more than full"));
                    } else {
                        set(&mut info.hash_full, v, key, &mut errors);
                    }
                }
            }
            "cpuload" => {
                if let Some(v) = next_int::<u32>(&mut words, key, &mut errors) {
                    set(&mut info.cpuload, v, key, &mut errors);
                }
            }
            "currmove" => match words.next() {
                Some(text) => set(&mut info.curr_move, text.to_string(), key, &mut errors),
                None => errors.push("info line ends after 'currmove'".to_string()),
            },
            "currmovenumber" => {
                if let Some(v) = next_int::<u32>(&mut words, key, &mut errors) {
                    set(&mut info.curr_move_number, v, key, &mut errors);
                }
            }
            "score" => match words.next() {
                Some("cp") => {
                    if let Some(v) = next_int::<i32>(&mut words, "score cp", &mut errors) {
                        if v.abs() > SCORE_CP_BOUND {
                            errors.push(format!("score cp {v} is out of range"));
                        } else {
                            set(&mut info.score_cp, v, "score cp", &mut errors);
                        }
                    }
                }
                Some("mate") => {
                    if let Some(v) = next_int::<i32>(&mut words, "score mate", &mut errors) {
                        if v.abs() > MATE_BOUND {
                            errors.push(format!("score mate {v} is out of range"));
                        } else {
                            set(&mut info.score_mate, v, "score mate", &mut errors);
                        }
                    }
                }
                Some(other) => errors.push(format!("unrecognized score type '{other}'")),
                None => errors.push("info line ends after 'score'".to_string()),
            },
            "lowerbound" => info.score_lowerbound = true,
            "upperbound" => info.score_upperbound = true,
            "pv" => {
                // Everything after 'pv' is the line; legality is checked
                // upstream against the shadow board.
                info.pv = words.by_ref().map(str::to_string).collect();
            }
            "refutation" | "currline" => {
                // consume the rest, same token shape as a pv
                while words.next().is_some() {}
            }
            "wdl" => {
                _ = next_int::<i64>(&mut words, key, &mut errors);
                _ = next_int::<i64>(&mut words, key, &mut errors);
                _ = next_int::<i64>(&mut words, key, &mut errors);
            }
            _ => errors.push(format!("wrong token in info line: '{key}'")),
        }
    }
    (info, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_ms;
    use pretty_assertions::assert_eq;

    fn line(content: &str) -> EngineLine {
        EngineLine {
            content: content.to_string(),
            complete: true,
            timestamp_ms: now_ms(),
            error: None,
        }
    }

    fn parser() -> UciParser {
        UciParser::new("test", Arc::new(AdapterShared::default()))
    }

    #[test]
    fn parses_a_full_info_line() {
        let (info, errors) = parse_info(tokens(
            "depth 12 seldepth 20 multipv 1 score cp 35 time 500 nodes 1000000 nps 2000000 hashfull 120 pv e2e4 e7e5 g1f3",
        ));
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(info.depth, Some(12));
        assert_eq!(info.seldepth, Some(20));
        assert_eq!(info.score_cp, Some(35));
        assert_eq!(info.time_ms, Some(500));
        assert_eq!(info.nodes, Some(1_000_000));
        assert_eq!(info.pv, vec!["e2e4", "e7e5", "g1f3"]);
    }

    #[test]
    fn out_of_range_values_become_errors_not_fields() {
        let (info, errors) = parse_info(tokens("score cp 2000000 seldepth 5000 depth 10"));
        assert_eq!(info.score_cp, None);
        assert_eq!(info.seldepth, None);
        assert_eq!(info.depth, Some(10));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn mate_scores_have_their_own_bound() {
        let (info, errors) = parse_info(tokens("score mate 12"));
        assert_eq!(info.score_mate, Some(12));
        assert!(errors.is_empty());
        let (info, errors) = parse_info(tokens("score mate 32000"));
        assert_eq!(info.score_mate, None);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn unknown_tokens_are_soft_errors() {
        let (info, errors) = parse_info(tokens("depth 8 flavour vanilla pv d2d4"));
        assert_eq!(info.depth, Some(8));
        assert_eq!(info.pv, vec!["d2d4"]);
        assert!(errors.iter().any(|e| e.contains("wrong token")));
    }

    #[test]
    fn duplicate_fields_are_reported() {
        let (info, errors) = parse_info(tokens("depth 8 depth 9"));
        assert_eq!(info.depth, Some(9));
        assert!(errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn bestmove_variants() {
        let mut p = parser();
        let event = p.parse_line(line("bestmove e2e4 ponder e7e5"));
        assert_eq!(
            event.kind,
            EngineEventKind::BestMove {
                best: "e2e4".to_string(),
                ponder: Some("e7e5".to_string())
            }
        );
        let event = p.parse_line(line("bestmove (none)"));
        assert_eq!(
            event.kind,
            EngineEventKind::BestMove {
                best: String::new(),
                ponder: None
            }
        );
        let event = p.parse_line(line("bestmove 0000"));
        assert!(matches!(event.kind, EngineEventKind::BestMove { ref best, .. } if best.is_empty()));
    }

    #[test]
    fn collects_options_until_uciok() {
        let shared = Arc::new(AdapterShared::default());
        let mut p = UciParser::new("test", shared.clone());
        assert!(p.parse_line(line("id name Example 1.0")).is_no_data());
        assert!(p
            .parse_line(line("option name Hash type spin default 16 min 1 max 1024"))
            .is_no_data());
        assert!(p.parse_line(line("option name Ponder type check default false")).is_no_data());
        let event = p.parse_line(line("uciok"));
        assert_eq!(event.kind, EngineEventKind::UciOk);
        assert_eq!(shared.options.lock().unwrap().len(), 2);
        assert_eq!(*shared.reported_name.lock().unwrap(), "Example 1.0");
        // A late declaration still lands in the table, with a note.
        let event = p.parse_line(line("option name Threads type spin default 1 min 1 max 64"));
        assert_eq!(event.errors.len(), 1);
        assert_eq!(shared.options.lock().unwrap().len(), 3);
    }

    #[test]
    fn info_string_is_a_keepalive() {
        let mut p = parser();
        let event = p.parse_line(line("info string using 4 threads"));
        assert_eq!(event.kind, EngineEventKind::KeepAlive);
    }

    #[test]
    fn eof_becomes_disconnected() {
        let mut p = parser();
        let event = p.parse_line(EngineLine {
            content: String::new(),
            complete: false,
            timestamp_ms: 0,
            error: Some(LineError::Terminated),
        });
        assert_eq!(event.kind, EngineEventKind::Disconnected);
    }

    #[test]
    fn go_line_contains_exactly_the_set_limits() {
        let limits = GoLimits {
            wtime_ms: Some(60_000),
            btime_ms: Some(55_000),
            winc_ms: 1000,
            binc_ms: 1000,
            moves_to_go: Some(40),
            ..GoLimits::default()
        };
        assert_eq!(
            UciAdapter::go_line(&limits, false),
            "go wtime 60000 winc 1000 btime 55000 binc 1000 movestogo 40"
        );
        let movetime = GoLimits {
            movetime_ms: Some(1000),
            ..GoLimits::default()
        };
        assert_eq!(UciAdapter::go_line(&movetime, false), "go movetime 1000");
        assert_eq!(UciAdapter::go_line(&GoLimits::default(), false), "go infinite");
        assert_eq!(
            UciAdapter::go_line(&movetime, true),
            "go ponder movetime 1000"
        );
    }

    #[test]
    fn position_line_spells_out_start_and_moves() {
        let spec = PositionSpec {
            startpos: true,
            moves_lan: vec!["e2e4".to_string(), "c7c5".to_string()],
            ..PositionSpec::default()
        };
        assert_eq!(
            UciAdapter::position_line(&spec),
            "position startpos moves e2e4 c7c5"
        );
        let spec = PositionSpec {
            startpos: false,
            fen: "8/8/8/8/8/4k3/8/4K2R w K - 0 1".to_string(),
            ..PositionSpec::default()
        };
        assert_eq!(
            UciAdapter::position_line(&spec),
            "position fen 8/8/8/8/8/4k3/8/4K2R w K - 0 1"
        );
    }
}
