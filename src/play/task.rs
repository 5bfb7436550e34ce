use crate::game::GameRecord;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum TaskType {
    /// Search the task's position once and record the move.
    ComputeMove,
    /// Play the game out to its end.
    #[default]
    PlayGame,
    /// Nothing to do yet; ask again.
    FetchNextTask,
}

/// The unit of scheduling: one thing a game manager should do. The record
/// carries the start position and both time controls.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct GameTask {
    pub task_type: TaskType,
    pub record: GameRecord,
    pub task_id: usize,
    /// Swap which engine plays white, without touching engine identities.
    pub switch_side: bool,
    pub round: u32,
}

/// A source of game tasks: an EPD suite, a pair tournament, an SPRT run.
/// Providers are shared by reference between managers and keep their own
/// state behind locks; every method may be called from any manager thread.
pub trait TaskProvider: Send + Sync {
    fn name(&self) -> &str;

    /// The next unit of work, or `None` when the provider is exhausted.
    /// Must never block.
    fn next_task(&self, white_id: &str, black_id: &str) -> Option<GameTask>;

    /// Reports a finished (or aborted) task back.
    fn set_game_record(&self, task_id: usize, record: &GameRecord);

    /// Live PV feed during a search. Returning true asks the manager to stop
    /// the search early.
    fn set_pv(
        &self,
        _engine_id: &str,
        _pv: &[String],
        _elapsed_ms: u64,
        _depth: u32,
        _nodes: u64,
        _multipv: u32,
    ) -> bool {
        false
    }
}
