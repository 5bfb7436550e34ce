use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::bail;
use shakmaty::Color;

use crate::util::{parse_fp_from_str, parse_int_from_str, Res};

/// One stage of a classical time control: play `moves_to_play` moves within
/// `base_ms` plus `increment_ms` per move. `moves_to_play == 0` means sudden
/// death and is only valid for the last segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub struct TimeSegment {
    pub moves_to_play: u32,
    pub base_ms: u64,
    pub increment_ms: u64,
}

impl TimeSegment {
    pub fn sudden_death(base_ms: u64, increment_ms: u64) -> Self {
        Self {
            moves_to_play: 0,
            base_ms,
            increment_ms,
        }
    }
}

/// A complete per-side time control: zero or more segments plus the non-time
/// caps that can be given instead of (or in addition to) a clock.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[must_use]
pub struct TimeControl {
    pub segments: Vec<TimeSegment>,
    pub movetime_ms: Option<u64>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub mate_in: Option<u32>,
    pub infinite: bool,
}

impl TimeControl {
    pub fn sudden_death(base_ms: u64, increment_ms: u64) -> Self {
        Self {
            segments: vec![TimeSegment::sudden_death(base_ms, increment_ms)],
            ..Self::default()
        }
    }

    pub fn fixed_movetime(movetime_ms: u64) -> Self {
        Self {
            movetime_ms: Some(movetime_ms),
            ..Self::default()
        }
    }

    pub fn infinite() -> Self {
        Self {
            infinite: true,
            ..Self::default()
        }
    }

    pub fn has_clock(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Number of active limits. Some conformance checks only make sense when
    /// exactly one limit constrains the search.
    pub fn limit_count(&self) -> usize {
        usize::from(self.has_clock())
            + usize::from(self.movetime_ms.is_some())
            + usize::from(self.depth.is_some())
            + usize::from(self.nodes.is_some())
            + usize::from(self.mate_in.is_some())
    }

    /// The PGN `TimeControl` tag form, e.g. `40/60+0.5:0+0.5`.
    pub fn to_pgn(&self) -> String {
        if self.segments.is_empty() {
            return "-".to_string();
        }
        let mut parts = vec![];
        for seg in &self.segments {
            let mut s = String::new();
            if seg.moves_to_play > 0 {
                s.push_str(&format!("{}/", seg.moves_to_play));
            }
            s.push_str(&format_seconds(seg.base_ms));
            if seg.increment_ms > 0 {
                s.push('+');
                s.push_str(&format_seconds(seg.increment_ms));
            }
            parts.push(s);
        }
        parts.join(":")
    }
}

fn format_seconds(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}", ms / 1000)
    } else {
        let s = format!("{:.3}", ms as f64 / 1000.0);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn parse_seconds(s: &str, name: &str) -> Res<u64> {
    let secs: f64 = parse_fp_from_str(s, name)?;
    if secs < 0.0 {
        bail!("{name} must not be negative ('{s}')")
    }
    Ok((secs * 1000.0).round() as u64)
}

impl FromStr for TimeControl {
    type Err = anyhow::Error;

    /// Parses the PGN/cutechess form: segments separated by `:`, each segment
    /// `moves/base+inc` with base and increment in (fractional) seconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "inf" || s == "infinite" {
            return Ok(Self::infinite());
        }
        if s == "-" || s.is_empty() {
            return Ok(Self::default());
        }
        let mut segments = vec![];
        for (i, part) in s.split(':').enumerate() {
            let (moves, rest) = match part.split_once('/') {
                Some((m, rest)) => (parse_int_from_str::<u32>(m, "moves of a time segment")?, rest),
                None => (0, part),
            };
            if i > 0 && segments.last().is_some_and(|s: &TimeSegment| s.moves_to_play == 0) {
                bail!("Sudden death ('{part}' without a move count) is only allowed in the last time control segment")
            }
            let (base, inc) = match rest.split_once('+') {
                Some((b, i)) => (
                    parse_seconds(b, "the base time")?,
                    parse_seconds(i, "the increment")?,
                ),
                None => (parse_seconds(rest, "the base time")?, 0),
            };
            segments.push(TimeSegment {
                moves_to_play: moves,
                base_ms: base,
                increment_ms: inc,
            });
        }
        Ok(Self {
            segments,
            ..Self::default()
        })
    }
}

impl Display for TimeControl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.infinite {
            return write!(f, "infinite");
        }
        write!(f, "{}", self.to_pgn())?;
        if let Some(mt) = self.movetime_ms {
            write!(f, " {mt}ms/move")?;
        }
        if let Some(d) = self.depth {
            write!(f, " depth {d}")?;
        }
        if let Some(n) = self.nodes {
            write!(f, " nodes {n}")?;
        }
        if let Some(m) = self.mate_in {
            write!(f, " mate {m}")?;
        }
        Ok(())
    }
}

/// The running clock of one side. Derived from a [`TimeControl`] at game
/// start and updated after every completed move.
#[derive(Debug, Copy, Clone)]
#[must_use]
pub struct ClockState {
    remaining_ms: i64,
    segment: usize,
    moves_left: u32,
}

impl ClockState {
    pub fn new(tc: &TimeControl) -> Self {
        match tc.segments.first() {
            Some(seg) => Self {
                remaining_ms: seg.base_ms as i64,
                segment: 0,
                moves_left: seg.moves_to_play,
            },
            None => Self {
                remaining_ms: 0,
                segment: 0,
                moves_left: 0,
            },
        }
    }

    pub fn remaining_ms(&self) -> i64 {
        self.remaining_ms
    }

    /// Moves until the next time refill, as sent with `go movestogo`.
    /// `None` in sudden death.
    pub fn moves_to_go(&self) -> Option<u32> {
        (self.moves_left > 0).then_some(self.moves_left)
    }

    /// Books `elapsed_ms` for one completed move: subtracts the elapsed time,
    /// adds the increment, and rolls over into the next segment when the
    /// current one is played out. The remaining time may go negative; whether
    /// that loses the game is the player context's decision.
    pub fn consume(&mut self, tc: &TimeControl, elapsed_ms: u64) {
        let Some(seg) = tc.segments.get(self.segment) else {
            return;
        };
        self.remaining_ms -= elapsed_ms as i64;
        self.remaining_ms += seg.increment_ms as i64;
        if self.moves_left > 0 {
            self.moves_left -= 1;
            if self.moves_left == 0 {
                let next = (self.segment + 1).min(tc.segments.len() - 1);
                let next_seg = &tc.segments[next];
                self.segment = next;
                self.remaining_ms += next_seg.base_ms as i64;
                self.moves_left = next_seg.moves_to_play;
            }
        }
    }
}

/// Everything that goes into one `go` command, computed from both sides'
/// time controls and clocks. Derived per move, never persisted.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct GoLimits {
    pub wtime_ms: Option<u64>,
    pub btime_ms: Option<u64>,
    pub winc_ms: u64,
    pub binc_ms: u64,
    pub moves_to_go: Option<u32>,
    pub movetime_ms: Option<u64>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub mate_in: Option<u32>,
    pub infinite: bool,
}

impl GoLimits {
    pub fn compute(
        side_to_move: Color,
        white: (&TimeControl, &ClockState),
        black: (&TimeControl, &ClockState),
    ) -> Self {
        let (own_tc, own_clock) = match side_to_move {
            Color::White => white,
            Color::Black => black,
        };
        let clock_ms = |tc: &TimeControl, clock: &ClockState| {
            tc.has_clock().then(|| clock.remaining_ms().max(0) as u64)
        };
        let inc = |tc: &TimeControl| {
            tc.segments
                .first()
                .map(|s| s.increment_ms)
                .unwrap_or_default()
        };
        Self {
            wtime_ms: clock_ms(white.0, white.1),
            btime_ms: clock_ms(black.0, black.1),
            winc_ms: inc(white.0),
            binc_ms: inc(black.0),
            moves_to_go: own_tc.has_clock().then(|| own_clock.moves_to_go()).flatten(),
            movetime_ms: own_tc.movetime_ms,
            depth: own_tc.depth,
            nodes: own_tc.nodes,
            mate_in: own_tc.mate_in,
            infinite: own_tc.infinite,
        }
    }

    /// The side to move's own remaining clock time, if it has a clock.
    pub fn own_time_ms(&self, side: Color) -> Option<u64> {
        match side {
            Color::White => self.wtime_ms,
            Color::Black => self.btime_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pgn_form_round_trips() {
        for s in ["40/60+0.5:0+0.5", "60+1", "300", "40/900:20/300:0+30"] {
            let tc = TimeControl::from_str(s).unwrap();
            assert_eq!(tc.to_pgn(), s, "round trip of '{s}'");
        }
    }

    #[test]
    fn sudden_death_must_be_last() {
        assert!(TimeControl::from_str("60+1:40/60").is_err());
        assert!(TimeControl::from_str("40/60:60+1").is_ok());
    }

    #[test]
    fn fractional_seconds_become_millis() {
        let tc = TimeControl::from_str("0.25+0.01").unwrap();
        assert_eq!(tc.segments[0].base_ms, 250);
        assert_eq!(tc.segments[0].increment_ms, 10);
    }

    #[test]
    fn clock_applies_increment_and_segment_rollover() {
        let tc = TimeControl::from_str("2/10+1:0+5").unwrap();
        let mut clock = ClockState::new(&tc);
        assert_eq!(clock.remaining_ms(), 10_000);
        assert_eq!(clock.moves_to_go(), Some(2));
        clock.consume(&tc, 3000);
        assert_eq!(clock.remaining_ms(), 8000);
        assert_eq!(clock.moves_to_go(), Some(1));
        // Playing out the segment refills with the next segment's base time.
        clock.consume(&tc, 1000);
        assert_eq!(clock.remaining_ms(), 8000);
        assert_eq!(clock.moves_to_go(), None);
        // Sudden death from here on.
        clock.consume(&tc, 2000);
        assert_eq!(clock.remaining_ms(), 11_000);
        assert_eq!(clock.moves_to_go(), None);
    }

    #[test]
    fn go_limits_take_caps_from_the_side_to_move() {
        let white = TimeControl::sudden_death(60_000, 1000);
        let mut black = TimeControl::fixed_movetime(500);
        black.depth = Some(12);
        let wc = ClockState::new(&white);
        let bc = ClockState::new(&black);
        let limits = GoLimits::compute(Color::Black, (&white, &wc), (&black, &bc));
        assert_eq!(limits.wtime_ms, Some(60_000));
        assert_eq!(limits.btime_ms, None);
        assert_eq!(limits.movetime_ms, Some(500));
        assert_eq!(limits.depth, Some(12));
        let limits = GoLimits::compute(Color::White, (&white, &wc), (&black, &bc));
        assert_eq!(limits.movetime_ms, None);
        assert_eq!(limits.winc_ms, 1000);
    }

    #[test]
    fn negative_remaining_time_is_reported_as_zero() {
        let tc = TimeControl::sudden_death(100, 0);
        let mut clock = ClockState::new(&tc);
        clock.consume(&tc, 250);
        assert_eq!(clock.remaining_ms(), -150);
        let limits = GoLimits::compute(Color::White, (&tc, &clock), (&tc, &ClockState::new(&tc)));
        assert_eq!(limits.wtime_ms, Some(0));
    }
}
