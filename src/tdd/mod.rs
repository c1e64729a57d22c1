//! Per-feature TDD phase state machine and retry policy. Composite
//! `coding` tasks with `use_tdd=true` are orchestrated through this module
//! by the executor; everything else bypasses it entirely.

pub mod engine;
pub mod retry;

pub use engine::{RetryDecision, TddEngine};
pub use retry::{Failure, FailureCategory, FailureDetail};
