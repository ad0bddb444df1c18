//! Conversation reconstruction for the Parley platform.
//!
//! Turns an ordered snapshot of the debug event log into human-readable
//! conversation timelines: events are grouped by correlation (or session)
//! key, folded into typed steps with at most one step open per kind family,
//! and summarized into per-conversation fields (first question, final answer,
//! success, services touched, total duration).
//!
//! Reconstruction is a pure function over a snapshot — it holds no state
//! between invocations and may run while the bus keeps writing, because the
//! snapshot it was handed never changes.

mod conversation;
mod reconstruct;
mod step;

pub use conversation::Conversation;
pub use reconstruct::reconstruct;
pub use step::{Step, StepKind};

#[cfg(test)]
mod tests;
