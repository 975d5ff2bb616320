//! The puzzle itself: configuration, the session state machine and the
//! controller that runs it against real timers.

mod controller;
pub mod leaderboard;
pub mod personal_best;
pub mod puzzle;
pub mod state;

pub use controller::{ControllerDeps, ControllerEvent, ControllerOptions, GameController};
pub use leaderboard::{LeaderboardRow, LeaderboardView};
pub use personal_best::PersonalBests;
pub use puzzle::{PuzzleConfig, Variant, TARGET};
pub use state::{CellMark, GameEvent, GameState, Outcome, Phase, SessionSnapshot};
