//! Pipeline orchestration engine.
//!
//! The `RunCoordinator` walks a run's resolved plan segment by segment:
//! single steps through the `StepExecutor` (retry, validation and quality
//! loops), parallel groups through a full-join fan-out, approval gates through
//! the `ApprovalGate` state machine, and phased steps through the image
//! sub-workflow transition function. Every transition is checkpointed before
//! the engine moves on, and committed outputs are write-once per revision.

pub mod approval;
pub mod checkpoint;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod executor;
pub mod group;
pub mod idempotency;
pub mod phase;
pub mod quality;
pub mod retry;
pub mod validate;
pub mod work;
