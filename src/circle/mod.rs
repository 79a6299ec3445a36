//! Circle coordination: codes, membership, unit assignments and lifecycle

pub mod assignment;
pub mod code;
pub mod lifecycle;
pub mod membership;
pub mod progress;
pub mod saga;
pub mod sweeper;
pub mod validation;

pub use assignment::{
    AssignmentStateMachine, BatchOutcome, CompletionOutcome, PendingEdits, UnitFailure, UpdateMode,
};
pub use code::CodeGenerator;
pub use lifecycle::{CircleLifecycleManager, NewCircle};
pub use membership::{LeaveOutcome, MembershipManager};
pub use progress::ProgressAggregator;
pub use sweeper::ExpirationSweeper;
