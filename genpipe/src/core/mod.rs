//! Pure, deterministic pipeline logic: stage definitions, sequencing, types.
//!
//! Nothing in here touches the filesystem or spawns processes.

pub mod engine;
pub mod stages;
pub mod types;
