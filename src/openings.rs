use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::bail;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strum_macros::{Display, EnumString};

use crate::game::GameState;
use crate::pgn;
use crate::util::Res;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum OpeningOrder {
    #[default]
    Sequential,
    Random,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum OpeningFormat {
    #[default]
    Epd,
    Raw,
    Pgn,
}

/// Where one game starts.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct StartPosition {
    pub startpos: bool,
    pub fen: Option<String>,
}

impl StartPosition {
    pub fn initial() -> Self {
        Self {
            startpos: true,
            fen: None,
        }
    }

    pub fn from_fen(fen: &str) -> Self {
        Self {
            startpos: false,
            fen: Some(fen.to_string()),
        }
    }
}

/// The opening set a tournament rotates through. Shared between managers;
/// the random order keeps its RNG behind a lock.
#[derive(Debug)]
pub struct Openings {
    positions: Vec<StartPosition>,
    order: OpeningOrder,
    start: usize,
    rng: Mutex<StdRng>,
}

impl Default for Openings {
    fn default() -> Self {
        Self::startpos_only()
    }
}

impl Openings {
    /// A book with only the initial position; every game starts there.
    pub fn startpos_only() -> Self {
        Self::new(vec![StartPosition::initial()], OpeningOrder::Sequential, 0, 0)
    }

    pub fn new(
        positions: Vec<StartPosition>,
        order: OpeningOrder,
        start: usize,
        seed: u64,
    ) -> Self {
        assert!(!positions.is_empty());
        Self {
            positions,
            order,
            start,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Loads a book. `plies` bounds how many moves of each PGN game are
    /// replayed to form the start position; it is ignored for FEN formats.
    pub fn from_file(
        path: &Path,
        format: OpeningFormat,
        order: OpeningOrder,
        start: usize,
        seed: u64,
        plies: usize,
    ) -> Res<Self> {
        let text = fs::read_to_string(path)?;
        let positions = match format {
            OpeningFormat::Epd => crate::epd::read_epd(&text)?
                .into_iter()
                .map(|pos| StartPosition::from_fen(&pos.fen))
                .collect(),
            OpeningFormat::Raw => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::parse)
                .collect::<Res<Vec<_>>>()?,
            OpeningFormat::Pgn => {
                let mut positions = vec![];
                for game in pgn::parse_games(&text)? {
                    let mut state = match game.tag("FEN") {
                        Some(fen) => GameState::from_fen(fen)?,
                        None => GameState::from_startpos(),
                    };
                    for san in game.moves_san.iter().take(plies) {
                        let mv = state.string_to_move(san, false)?;
                        state.do_move(&mv);
                    }
                    positions.push(StartPosition::from_fen(&state.current_fen()));
                }
                positions
            }
        };
        if positions.is_empty() {
            bail!("The opening file '{}' contains no positions", path.display())
        }
        Ok(Self::new(positions, order, start, seed))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The opening for the given rotation step. Sequential walks the book
    /// from the configured start; random draws uniformly.
    pub fn position_for(&self, rotation: usize) -> StartPosition {
        let index = match self.order {
            OpeningOrder::Sequential => (rotation + self.start) % self.positions.len(),
            OpeningOrder::Random => self.rng.lock().unwrap().gen_range(0..self.positions.len()),
        };
        self.positions[index].clone()
    }
}

impl FromStr for StartPosition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "startpos" {
            return Ok(Self::initial());
        }
        // validate early so a bad book entry fails at load time
        _ = GameState::from_fen(s)?;
        Ok(Self::from_fen(s))
    }
}
