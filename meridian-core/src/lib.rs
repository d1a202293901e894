//! Meridian core utilities shared by the engine crates and tools.

pub mod cli;
pub mod collections;
pub mod log;
