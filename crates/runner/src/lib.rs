//! Subprocess task runner — delegates long-form work to an external CLI.
//!
//! A [`TaskRunner`] wraps one configured command. Each run spawns the
//! command with the task text as its final argument, waits under a
//! wall-clock budget, and returns a [`TaskOutcome`] describing what
//! happened. The full captured output always lands in an artifact file
//! next to the run; the inline copy is truncated.

pub mod outcome;
pub mod task;

pub use outcome::{truncate_output, TaskOutcome, OUTPUT_TRUNCATE_CHARS};
pub use task::TaskRunner;
