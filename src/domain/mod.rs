//! Domain layer - pure admission logic with no I/O.
//!
//! This layer contains the core concepts and invariants of the admission core:
//! - Per-key request windows and retry backoff
//! - Calendar-day quota accounting
//! - The staged job state machine
//! - Typed allow/deny decisions
//!
//! All types in this layer are pure and easily testable.

pub mod decision;
pub mod quota;
pub mod stage;
pub mod window;
