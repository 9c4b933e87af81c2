//! Gantry: declarative resource-graph reconciler.
//!
//! Loads a stack declaration, diffs it against recorded state, and converges
//! the provider side through a concurrent, dependency-ordered apply.
//! BLAKE3 state hashing. Secrets never reach disk in plaintext.

pub mod cli;
pub mod core;
pub mod journal;
pub mod provider;
pub mod secrets;
pub mod stack;
