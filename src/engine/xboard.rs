use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::engine::adapter::{AdapterShared, EngineAdapter, EventParser, PositionSpec, Protocol};
use crate::engine::event::{EngineEvent, EngineEventKind, SearchInfo};
use crate::engine::process::{EngineLine, LineError, ProcessWriter};
use crate::logger;
use crate::time::GoLimits;
use crate::util::{now_ms, tokens, Res};

/// The command half of the XBoard adapter. Positions are transmitted by
/// replaying the whole game in `force` mode, which is how the protocol
/// wants it.
#[derive(Debug)]
pub struct XboardAdapter {
    writer: ProcessWriter,
    engine: String,
    shared: Arc<AdapterShared>,
}

impl XboardAdapter {
    pub fn new(writer: ProcessWriter, engine: &str, shared: Arc<AdapterShared>) -> Self {
        Self {
            writer,
            engine: engine.to_string(),
            shared,
        }
    }

    fn send(&mut self, line: &str) -> Res<u64> {
        logger::engine_send(&self.engine, line);
        self.writer.write_line(line)
    }
}

impl EngineAdapter for XboardAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Xboard
    }

    fn start_protocol(&mut self) -> Res<u64> {
        _ = self.send("xboard")?;
        self.send("protover 2")
    }

    fn new_game(&mut self) -> Res<()> {
        _ = self.send("new")?;
        _ = self.send("force")?;
        _ = self.send("post")?;
        Ok(())
    }

    fn ask_for_ready(&mut self) -> Res<()> {
        let n = self.shared.last_ping.fetch_add(1, Ordering::SeqCst) + 1;
        _ = self.send(&format!("ping {n}"))?;
        Ok(())
    }

    fn move_now(&mut self) -> Res<()> {
        _ = self.send("?")?;
        Ok(())
    }

    fn set_ponder(&mut self, enabled: bool) -> Res<()> {
        _ = self.send(if enabled { "hard" } else { "easy" })?;
        Ok(())
    }

    fn set_test_option(&mut self, name: &str, value: &str) -> Res<()> {
        let line = if value.is_empty() {
            format!("option {name}")
        } else {
            format!("option {name}={value}")
        };
        _ = self.send(&line)?;
        Ok(())
    }

    fn compute_move(
        &mut self,
        position: &PositionSpec,
        limits: &GoLimits,
        _ponder_hit: bool,
    ) -> Res<u64> {
        // There is no ponderhit in XBoard; a pondering engine in 'hard' mode
        // resolves hits on its own, so a hit still gets the full replay.
        _ = self.send("force")?;
        if !position.startpos {
            _ = self.send(&format!("setboard {}", position.fen))?;
        }
        for lan in &position.moves_lan {
            _ = self.send(&format!("usermove {lan}"))?;
        }
        let (own, other) = if position.white_to_move {
            (limits.wtime_ms, limits.btime_ms)
        } else {
            (limits.btime_ms, limits.wtime_ms)
        };
        if let Some(ms) = own {
            // XBoard clocks tick in centiseconds.
            _ = self.send(&format!("time {}", ms / 10))?;
        }
        if let Some(ms) = other {
            _ = self.send(&format!("otim {}", ms / 10))?;
        }
        if let Some(depth) = limits.depth {
            _ = self.send(&format!("sd {depth}"))?;
        }
        if let Some(movetime) = limits.movetime_ms {
            _ = self.send(&format!("st {}", (movetime as f64 / 1000.0).ceil() as u64))?;
        }
        self.send("go")
    }

    fn allow_ponder(
        &mut self,
        _position: &PositionSpec,
        _limits: &GoLimits,
        _ponder_move: &str,
    ) -> Res<u64> {
        // Pondering is engine-driven in XBoard ('hard'); nothing to send.
        Ok(now_ms())
    }

    fn terminate_engine(&mut self) -> Res<()> {
        _ = self.send("quit");
        Ok(())
    }
}

/// The parsing half of the XBoard adapter. Collects `feature` lines until
/// `done=1`, which is reported as the protocol acknowledgement.
#[derive(Debug)]
pub struct XboardParser {
    engine: String,
    shared: Arc<AdapterShared>,
}

impl XboardParser {
    pub fn new(engine: &str, shared: Arc<AdapterShared>) -> Self {
        Self {
            engine: engine.to_string(),
            shared,
        }
    }

    /// `feature` payloads are `NAME=VALUE` pairs where VALUE may be a quoted
    /// string containing spaces.
    fn handle_features(&self, rest: &str) -> (bool, Vec<String>) {
        let mut done = false;
        let mut errors = vec![];
        let mut remaining = rest.trim();
        while !remaining.is_empty() {
            let Some(eq) = remaining.find('=') else {
                errors.push(format!("feature without a value: '{remaining}'"));
                break;
            };
            let name = remaining[..eq].trim().to_string();
            let after = &remaining[eq + 1..];
            let (value, rest) = if let Some(stripped) = after.strip_prefix('"') {
                match stripped.find('"') {
                    Some(end) => (stripped[..end].to_string(), &stripped[end + 1..]),
                    None => {
                        errors.push(format!("unterminated quote in feature '{name}'"));
                        (stripped.to_string(), "")
                    }
                }
            } else {
                match after.find(char::is_whitespace) {
                    Some(end) => (after[..end].to_string(), &after[end..]),
                    None => (after.to_string(), ""),
                }
            };
            if name == "done" && value == "1" {
                done = true;
            }
            if name == "myname" {
                *self.shared.reported_name.lock().unwrap() = value.clone();
            }
            _ = self
                .shared
                .features
                .lock()
                .unwrap()
                .insert(name, value);
            remaining = rest.trim_start();
        }
        (done, errors)
    }
}

impl EventParser for XboardParser {
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
        let trimmed = raw.trim();
        let mut words = tokens(trimmed);
        let Some(first) = words.next() else {
            return EngineEvent::new(EngineEventKind::NoData, &self.engine, stamp, raw);
        };
        match first {
            "feature" => {
                let rest = trimmed.strip_prefix("feature").unwrap_or_default();
                let (done, errors) = self.handle_features(rest);
                let kind = if done {
                    // protocol acknowledgement, the counterpart of 'uciok'
                    EngineEventKind::UciOk
                } else {
                    EngineEventKind::NoData
                };
                let mut event = EngineEvent::new(kind, &self.engine, stamp, raw);
                event.errors = errors;
                event
            }
            "pong" => {
                let expected = self.shared.last_ping.load(Ordering::SeqCst);
                let answered = words.next().and_then(|n| n.parse::<u64>().ok());
                let mut event = EngineEvent::new(EngineEventKind::ReadyOk, &self.engine, stamp, raw);
                if answered != Some(expected) {
                    event.kind = EngineEventKind::Unknown;
                    event.errors.push(format!(
                        "pong {} doesn't answer ping {expected}",
                        answered.map_or("?".to_string(), |n| n.to_string())
                    ));
                }
                event
            }
            "move" => {
                let mut event = EngineEvent::new(
                    EngineEventKind::BestMove {
                        best: words.next().unwrap_or_default().to_string(),
                        ponder: None,
                    },
                    &self.engine,
                    stamp,
                    raw,
                );
                if matches!(&event.kind, EngineEventKind::BestMove { best, .. } if best.is_empty()) {
                    event.errors.push("missing move after 'move'".to_string());
                }
                event
            }
            "Illegal" | "Error" => EngineEvent::new(
                EngineEventKind::Error(trimmed.to_string()),
                &self.engine,
                stamp,
                raw,
            ),
            "#" => EngineEvent::new(EngineEventKind::NoData, &self.engine, stamp, raw),
            _ if first.parse::<i64>().is_ok() => {
                let (info, errors) = parse_thinking_line(trimmed);
                let kind = match info {
                    Some(info) => EngineEventKind::Info(info),
                    None => EngineEventKind::Unknown,
                };
                let mut event = EngineEvent::new(kind, &self.engine, stamp, raw);
                event.errors = errors;
                event
            }
            _ => EngineEvent::new(EngineEventKind::Unknown, &self.engine, stamp, raw),
        }
    }
}

/// Mate scores ride on the centipawn scale beyond this offset.
const XBOARD_MATE_OFFSET: i32 = 10_000;

/// Parses a post/thinking line: `depth score time nodes [seldepth nps
/// tbhits] pv...` with the score in centipawns and the time in centiseconds.
pub fn parse_thinking_line(line: &str) -> (Option<SearchInfo>, Vec<String>) {
    let mut errors = vec![];
    let words: Vec<&str> = tokens(line).collect();
    if words.len() < 4 {
        errors.push("thinking line has fewer than four fields".to_string());
        return (None, errors);
    }
    let mut ints = vec![];
    let mut idx = 0;
    while idx < words.len() && idx < 7 {
        match words[idx].parse::<i64>() {
            Ok(n) => ints.push(n),
            Err(_) => break,
        }
        idx += 1;
    }
    if ints.len() < 4 {
        errors.push("thinking line has malformed numeric fields".to_string());
        return (None, errors);
    }
    let mut info = SearchInfo {
        depth: Some(ints[0].max(0) as u32),
        time_ms: Some((ints[2].max(0) as u64) * 10),
        nodes: Some(ints[3].max(0) as u64),
        ..SearchInfo::default()
    };
    let score = ints[1] as i32;
    if score.abs() >= XBOARD_MATE_OFFSET {
        let plies = score.abs() - XBOARD_MATE_OFFSET;
        info.score_mate = Some(if score > 0 { plies } else { -plies });
    } else {
        info.score_cp = Some(score);
    }
    if ints.len() >= 7 {
        info.seldepth = Some(ints[4].max(0) as u32);
        info.nps = Some(ints[5].max(0) as u64);
        info.tbhits = Some(ints[6].max(0) as u64);
    } else if ints.len() > 4 {
        errors.push("thinking line has a partial extension field group".to_string());
    }
    info.pv = words[idx..].iter().map(|s| s.to_string()).collect();
    (Some(info), errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn line(content: &str) -> EngineLine {
        EngineLine {
            content: content.to_string(),
            complete: true,
            timestamp_ms: 0,
            error: None,
        }
    }

    fn parser() -> (XboardParser, Arc<AdapterShared>) {
        let shared = Arc::new(AdapterShared::default());
        (XboardParser::new("test", shared.clone()), shared)
    }

    #[test]
    fn feature_collection_ends_on_done() {
        let (mut p, shared) = parser();
        let event = p.parse_line(line(
            "feature ping=1 setboard=1 usermove=1 myname=\"Old Faithful 2.1\" done=0",
        ));
        assert_eq!(event.kind, EngineEventKind::NoData);
        let event = p.parse_line(line("feature done=1"));
        assert_eq!(event.kind, EngineEventKind::UciOk);
        assert_eq!(*shared.reported_name.lock().unwrap(), "Old Faithful 2.1");
        assert_eq!(
            shared.features.lock().unwrap().get("setboard"),
            Some(&"1".to_string())
        );
    }

    #[test]
    fn pong_must_echo_the_last_ping() {
        let (mut p, shared) = parser();
        shared.last_ping.store(3, Ordering::SeqCst);
        assert_eq!(p.parse_line(line("pong 3")).kind, EngineEventKind::ReadyOk);
        let stale = p.parse_line(line("pong 2"));
        assert_eq!(stale.kind, EngineEventKind::Unknown);
        assert!(!stale.errors.is_empty());
    }

    #[test]
    fn move_lines_become_bestmoves() {
        let (mut p, _) = parser();
        assert_eq!(
            p.parse_line(line("move e2e4")).kind,
            EngineEventKind::BestMove {
                best: "e2e4".to_string(),
                ponder: None
            }
        );
    }

    #[test]
    fn thinking_lines_parse_positionally() {
        let (info, errors) = parse_thinking_line("9 156 1084 48000 d2d4 d7d5 c2c4");
        let info = info.unwrap();
        assert!(errors.is_empty());
        assert_eq!(info.depth, Some(9));
        assert_eq!(info.score_cp, Some(156));
        assert_eq!(info.time_ms, Some(10_840));
        assert_eq!(info.nodes, Some(48_000));
        assert_eq!(info.pv, vec!["d2d4", "d7d5", "c2c4"]);
    }

    #[test]
    fn thinking_lines_with_extension_fields() {
        let (info, errors) = parse_thinking_line("12 -30 500 900000 18 1800000 0 e7e5 g1f3");
        let info = info.unwrap();
        assert!(errors.is_empty());
        assert_eq!(info.seldepth, Some(18));
        assert_eq!(info.nps, Some(1_800_000));
        assert_eq!(info.pv, vec!["e7e5", "g1f3"]);
    }

    #[test]
    fn mate_scores_use_the_offset() {
        let (info, _) = parse_thinking_line("20 10003 100 1000 g1f3");
        assert_eq!(info.unwrap().score_mate, Some(3));
        let (info, _) = parse_thinking_line("20 -10002 100 1000 g1f3");
        assert_eq!(info.unwrap().score_mate, Some(-2));
    }

    #[test]
    fn illegal_move_reports_become_errors() {
        let (mut p, _) = parser();
        let event = p.parse_line(line("Illegal move: e2e5"));
        assert!(matches!(event.kind, EngineEventKind::Error(_)));
    }
}
