//! Turn orchestration.

mod turn;

pub use turn::{ExecutedDirective, TurnOrchestrator, TurnOutcome, TurnState, TurnStatus};
