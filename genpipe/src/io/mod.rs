//! Side-effecting collaborators of the pipeline (filesystem, git, processes).

pub mod acquire;
pub mod archive;
pub mod assemble;
pub mod cancel;
pub mod config;
pub mod credentials;
pub mod generate;
pub mod git;
pub mod lock;
pub mod process;
pub mod publish;
pub mod run_report;
pub mod workspace;
