//! Build-and-publish pipeline for generated documents and translated code.
//!
//! A run checks out a native source tree and a generation toolchain, merges a
//! whitelist of source files into one artifact, runs the document and code
//! generation jobs, force-publishes the generated code and archives the
//! documents. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure stage sequencing (plan, gating, failure policy). No I/O.
//! - **[`io`]**: Side-effecting collaborators behind traits, so tests can swap
//!   in scripted fakes.
//!
//! [`pipeline`] wires the two together into [`pipeline::Orchestrator`].

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
