//! Armazon — declarative stack provisioning engine.
//!
//! Templates in, dependency-ordered idempotent provider operations out.
//! BLAKE3 state hashing. JSONL provenance journal.

pub mod cli;
pub mod core;
pub mod provider;
