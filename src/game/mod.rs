/// Game records: moves with search snapshots, tags, and results.
pub mod record;
/// The shadow board every player context and game manager keeps.
pub mod state;

pub use record::{GameEndCause, GameOutcome, GameRecord, MoveRecord};
pub use state::GameState;
