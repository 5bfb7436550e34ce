use std::str::{FromStr, SplitWhitespace};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use num::{Float, PrimInt};

pub use anyhow::Result as Res;

/// The token iterator used by all protocol and file parsers.
pub type Tokens<'a> = SplitWhitespace<'a>;

pub fn tokens(input: &str) -> Tokens<'_> {
    input.split_whitespace()
}

/// All the number parsers funnel through here, so a failure names the field
/// being read instead of echoing an unhelpful library error.
fn parse_or_explain<T>(text: &str, what: &str, parse: impl FnOnce(&str) -> Option<T>) -> Res<T> {
    parse(text).ok_or_else(|| anyhow!("Couldn't read {what} from '{text}'"))
}

pub fn parse_int_from_str<T: PrimInt + FromStr>(text: &str, what: &str) -> Res<T> {
    parse_or_explain(text, what, |t| t.parse().ok())
}

pub fn parse_fp_from_str<T: Float + FromStr>(text: &str, what: &str) -> Res<T> {
    parse_or_explain(text, what, |t| t.parse().ok())
}

pub fn parse_int<T: PrimInt + FromStr>(words: &mut Tokens, what: &str) -> Res<T> {
    match words.next() {
        Some(token) => parse_int_from_str(token, what),
        None => Err(anyhow!("Missing {what}")),
    }
}

/// Engines occasionally report negative clock values; those clamp to zero
/// instead of failing the whole line.
pub fn parse_duration_ms(words: &mut Tokens, what: &str) -> Res<Duration> {
    let ms: i64 = parse_int(words, what)?;
    Ok(Duration::from_millis(u64::try_from(ms).unwrap_or(0)))
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the harness started. All line and event timestamps use
/// this clock so that differences between them are meaningful across threads.
pub fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ints_and_rejects_junk() {
        assert_eq!(parse_int_from_str::<i32>("-42", "n").unwrap(), -42);
        assert!(parse_int_from_str::<u64>("12e4", "n").is_err());
        assert!(parse_int_from_str::<u8>("300", "n").is_err());
    }

    #[test]
    fn parse_failures_name_the_field() {
        let err = parse_int_from_str::<u32>("off", "concurrency").unwrap_err();
        assert!(err.to_string().contains("concurrency"));
        assert!(err.to_string().contains("off"));
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        let mut words = tokens("-100");
        assert_eq!(
            parse_duration_ms(&mut words, "time").unwrap(),
            Duration::ZERO
        );
    }

    #[test]
    fn harness_clock_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
