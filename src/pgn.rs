use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::str::Chars;
use std::sync::Mutex;

use anyhow::bail;

use crate::game::{GameOutcome, GameRecord};
use crate::util::Res;

/// What goes into the move-text comments.
#[derive(Debug, Copy, Clone)]
pub struct PgnOptions {
    /// Append `{+0.21/12 0.53s}` style annotations to each move.
    pub annotations: bool,
    /// Also include the pv in the annotation.
    pub include_pv: bool,
}

impl Default for PgnOptions {
    fn default() -> Self {
        Self {
            annotations: true,
            include_pv: false,
        }
    }
}

/// Renders one game as PGN: the seven-tag roster, the setup tags when the
/// game didn't start from the initial position, and annotated move text.
pub fn format_game(record: &GameRecord, options: PgnOptions) -> String {
    let mut out = String::new();
    let date = chrono::offset::Utc::now().format("%Y.%m.%d");
    let tag = |out: &mut String, name: &str, value: &str| {
        _ = writeln!(out, "[{name} \"{value}\"]");
    };
    tag(
        &mut out,
        "Event",
        record.tags.get("Event").map_or("?", String::as_str),
    );
    tag(
        &mut out,
        "Site",
        record.tags.get("Site").map_or("?", String::as_str),
    );
    tag(&mut out, "Date", &date.to_string());
    tag(&mut out, "Round", &record.round.to_string());
    tag(&mut out, "White", &record.white_name);
    tag(&mut out, "Black", &record.black_name);
    tag(&mut out, "Result", record.outcome().as_pgn());
    if let Some(fen) = &record.fen {
        if !record.startpos {
            tag(&mut out, "FEN", fen);
            tag(&mut out, "SetUp", "1");
        }
    }
    if record.white_tc.has_clock() || record.white_tc.movetime_ms.is_some() {
        tag(&mut out, "TimeControl", &record.white_tc.to_pgn());
    }
    tag(&mut out, "PlyCount", &record.moves.len().to_string());
    tag(&mut out, "Termination", record.termination());
    for (name, value) in &record.tags {
        // the roster tags above already cover these
        if !matches!(
            name.as_str(),
            "Event"
                | "Site"
                | "Date"
                | "Round"
                | "White"
                | "Black"
                | "Result"
                | "FEN"
                | "SetUp"
                | "TimeControl"
                | "PlyCount"
                | "Termination"
        ) {
            tag(&mut out, name, value);
        }
    }
    out.push('\n');

    let mut line = String::new();
    let push_token = |out: &mut String, line: &mut String, token: &str| {
        if line.len() + token.len() + 1 > 80 && !line.is_empty() {
            out.push_str(line.trim_end());
            out.push('\n');
            line.clear();
        }
        line.push_str(token);
        line.push(' ');
    };
    for (ply, mv) in record.moves.iter().enumerate() {
        if ply % 2 == 0 {
            push_token(&mut out, &mut line, &format!("{}.", ply / 2 + 1));
        }
        push_token(&mut out, &mut line, &mv.san);
        if options.annotations {
            if let Some(annotation) = mv.annotation() {
                let mut comment = annotation;
                if options.include_pv && !mv.pv.is_empty() {
                    comment.push_str(" pv ");
                    comment.push_str(&mv.pv.join(" "));
                }
                push_token(&mut out, &mut line, &format!("{{{comment}}}"));
            }
        }
    }
    push_token(&mut out, &mut line, record.outcome().as_pgn());
    out.push_str(line.trim_end());
    out.push('\n');
    out
}

/// Appends games to one PGN file. Multiple managers may save concurrently;
/// the mutex keeps each game one contiguous block.
#[derive(Debug)]
pub struct PgnWriter {
    path: PathBuf,
    options: PgnOptions,
    lock: Mutex<()>,
}

impl PgnWriter {
    pub fn new(path: PathBuf, options: PgnOptions) -> Self {
        Self {
            path,
            options,
            lock: Mutex::new(()),
        }
    }

    pub fn save_game(&self, record: &GameRecord) -> Res<()> {
        let text = format_game(record, self.options);
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{text}")?;
        Ok(())
    }
}

/// One parsed game: its tag pairs in order, the SAN move tokens, and the
/// result. The caller replays the moves against a board if it needs
/// positions.
#[derive(Debug, Default, Clone)]
#[must_use]
pub struct ParsedPgn {
    pub tags: Vec<(String, String)>,
    pub moves_san: Vec<String>,
    pub outcome: GameOutcome,
}

impl ParsedPgn {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(tag, _)| tag == name)
            .map(|(_, value)| value.as_str())
    }
}

struct PgnReader<'a> {
    unread: std::iter::Peekable<Chars<'a>>,
}

impl<'a> PgnReader<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            unread: input.chars().peekable(),
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Res<()> {
        loop {
            match self.unread.peek() {
                Some(c) if c.is_whitespace() => _ = self.unread.next(),
                Some('{') => {
                    _ = self.unread.next();
                    loop {
                        match self.unread.next() {
                            Some('}') => break,
                            Some(_) => {}
                            None => bail!("Unclosed brace comment"),
                        }
                    }
                }
                Some(';') => {
                    // rest-of-line comment
                    for c in self.unread.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('(') => {
                    // skip variations, they aren't part of the played game
                    _ = self.unread.next();
                    let mut depth = 1_usize;
                    for c in self.unread.by_ref() {
                        match c {
                            '(' => depth += 1,
                            ')' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_tag_pair(&mut self) -> Res<(String, String)> {
        assert_eq!(self.unread.peek(), Some(&'['), "caller checks for the tag opener");
        _ = self.unread.next();
        let mut name = String::new();
        while let Some(&c) = self.unread.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                _ = self.unread.next();
            } else {
                break;
            }
        }
        self.skip_whitespace_and_comments()?;
        if self.unread.next() != Some('"') {
            bail!("Expected a quoted value in the tag pair '{name}'")
        }
        let mut value = String::new();
        loop {
            match self.unread.next() {
                Some('\\') => match self.unread.next() {
                    Some(escaped) => value.push(escaped),
                    None => bail!("Input ends inside an escape in tag '{name}'"),
                },
                Some('"') => break,
                Some(c) => value.push(c),
                None => bail!("Unterminated string in tag '{name}'"),
            }
        }
        self.skip_whitespace_and_comments()?;
        if self.unread.next() != Some(']') {
            bail!("Tag pair '{name}' doesn't end with ']'")
        }
        Ok((name, value))
    }

    fn next_symbol(&mut self) -> String {
        let mut symbol = String::new();
        while let Some(&c) = self.unread.peek() {
            if c.is_whitespace() || matches!(c, '{' | '(' | '[' | ';') {
                break;
            }
            symbol.push(c);
            _ = self.unread.next();
        }
        symbol
    }

    fn parse_games(&mut self) -> Res<Vec<ParsedPgn>> {
        let mut games = vec![];
        let mut game = ParsedPgn::default();
        let mut in_movetext = false;
        loop {
            self.skip_whitespace_and_comments()?;
            match self.unread.peek() {
                None => break,
                Some('[') => {
                    if in_movetext {
                        games.push(std::mem::take(&mut game));
                        in_movetext = false;
                    }
                    game.tags.push(self.parse_tag_pair()?);
                }
                Some(_) => {
                    let symbol = self.next_symbol();
                    if symbol.is_empty() {
                        break;
                    }
                    in_movetext = true;
                    match symbol.as_str() {
                        "1-0" => {
                            game.outcome = GameOutcome::WhiteWins;
                            games.push(std::mem::take(&mut game));
                            in_movetext = false;
                        }
                        "0-1" => {
                            game.outcome = GameOutcome::BlackWins;
                            games.push(std::mem::take(&mut game));
                            in_movetext = false;
                        }
                        "1/2-1/2" => {
                            game.outcome = GameOutcome::Draw;
                            games.push(std::mem::take(&mut game));
                            in_movetext = false;
                        }
                        "*" => {
                            games.push(std::mem::take(&mut game));
                            in_movetext = false;
                        }
                        _ => {
                            if symbol.starts_with('$') {
                                continue; // NAG
                            }
                            // strip move numbers, glued or standalone
                            let trimmed = symbol
                                .trim_start_matches(|c: char| c.is_ascii_digit())
                                .trim_start_matches('.');
                            if trimmed.is_empty() {
                                continue;
                            }
                            let san = trimmed.trim_end_matches(['!', '?']);
                            game.moves_san.push(san.to_string());
                        }
                    }
                }
            }
        }
        if !game.tags.is_empty() || !game.moves_san.is_empty() {
            games.push(game);
        }
        Ok(games)
    }
}

/// Parses a PGN file into its games.
pub fn parse_games(input: &str) -> Res<Vec<ParsedPgn>> {
    PgnReader::new(input).parse_games()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameEndCause, MoveRecord};
    use crate::time::TimeControl;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    fn record_with_moves() -> GameRecord {
        let mut record = GameRecord::new(true, None);
        record.white_name = "Alpha".to_string();
        record.black_name = "Beta".to_string();
        record.round = 3;
        record.white_tc = TimeControl::from_str("40/60+0.5").unwrap();
        record.black_tc = record.white_tc.clone();
        _ = record
            .tags
            .insert("Event".to_string(), "test match".to_string());
        for (lan, san, cp) in [("e2e4", "e4", 20), ("e7e5", "e5", -15), ("g1f3", "Nf3", 25)] {
            record.push_move(MoveRecord {
                lan: lan.to_string(),
                san: san.to_string(),
                score_cp: Some(cp),
                depth: 10,
                time_ms: 500,
                ..MoveRecord::default()
            });
        }
        record.set_result(GameEndCause::Timeout, crate::game::GameOutcome::BlackWins);
        record
    }

    #[test]
    fn format_emits_the_seven_tag_roster() {
        let text = format_game(&record_with_moves(), PgnOptions::default());
        for needle in [
            "[Event \"test match\"]",
            "[Site \"?\"]",
            "[Round \"3\"]",
            "[White \"Alpha\"]",
            "[Black \"Beta\"]",
            "[Result \"0-1\"]",
            "[TimeControl \"40/60+0.5\"]",
            "[Termination \"time forfeit\"]",
            "1. e4 {+0.20/10 0.50s}",
        ] {
            assert!(text.contains(needle), "missing {needle} in:\n{text}");
        }
        assert!(text.trim_end().ends_with("0-1"));
    }

    #[test]
    fn parse_round_trips_moves_and_tags() {
        let record = record_with_moves();
        let text = format_game(&record, PgnOptions::default());
        let games = parse_games(&text).unwrap();
        assert_eq!(games.len(), 1);
        let game = &games[0];
        assert_eq!(game.tag("White"), Some("Alpha"));
        assert_eq!(game.tag("Round"), Some("3"));
        assert_eq!(
            game.moves_san,
            record.moves.iter().map(|m| m.san.clone()).collect::<Vec<_>>()
        );
        assert_eq!(game.outcome, crate::game::GameOutcome::BlackWins);
    }

    #[test]
    fn parses_multiple_games_and_skips_noise() {
        let text = r#"
[Event "one"]
[Result "1-0"]

1. e4 {best by test} e5 $1 2. Nf3 (2. f4 exf4) Nc6 1-0

[Event "two"]

1. d4 d5 *
"#;
        let games = parse_games(text).unwrap();
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].moves_san, vec!["e4", "e5", "Nf3", "Nc6"]);
        assert_eq!(games[0].outcome, crate::game::GameOutcome::WhiteWins);
        assert_eq!(games[1].moves_san, vec!["d4", "d5"]);
        assert_eq!(games[1].outcome, crate::game::GameOutcome::Unterminated);
    }

    #[test]
    fn writer_appends_contiguous_blocks() {
        let dir = std::env::temp_dir().join("calipers-pgn-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.pgn");
        _ = std::fs::remove_file(&path);
        let writer = PgnWriter::new(path.clone(), PgnOptions::default());
        writer.save_game(&record_with_moves()).unwrap();
        writer.save_game(&record_with_moves()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let games = parse_games(&text).unwrap();
        assert_eq!(games.len(), 2);
        std::fs::remove_file(path).unwrap();
    }
}
