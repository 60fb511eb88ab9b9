//! `genpipe`: checkout, merge, generate, publish and archive in one run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use genpipe::core::types::{PublishResult, RunStatus, StageStatus};
use genpipe::error::PipelineError;
use genpipe::exit_codes;
use genpipe::io::cancel::CancelToken;
use genpipe::io::config::{DEFAULT_CONFIG_FILE, PipelineConfig, load_config, write_config};
use genpipe::logging;
use genpipe::pipeline::{Orchestrator, RunOutcome};

#[derive(Parser)]
#[command(
    name = "genpipe",
    version,
    about = "Build-and-publish pipeline for generated documents and code"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one pipeline run.
    Run {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Load and validate the configuration without running anything.
    Validate {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Write the default configuration file.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { config } => cmd_run(&config),
        Command::Validate { config } => cmd_validate(&config).map(|()| exit_codes::OK),
        Command::Init { config, force } => cmd_init(&config, force).map(|()| exit_codes::OK),
    };
    match code {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn cmd_run(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel("interrupted by signal"))
        .context("install signal handler")?;

    let orchestrator = Orchestrator::new(cfg, cancel);
    match orchestrator.trigger() {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(exit_code(&outcome.status))
        }
        Err(PipelineError::Busy { holder }) => {
            eprintln!("another run is active: {holder}");
            Ok(exit_codes::BUSY)
        }
        Err(err) => {
            eprintln!("run could not start: {err}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        bail!("config {} not found", config_path.display());
    }
    load_config(config_path)?;
    println!("{} is valid", config_path.display());
    Ok(())
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &PipelineConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(())
}

fn exit_code(status: &RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => exit_codes::OK,
        RunStatus::Failed { .. } => exit_codes::FAILED,
        RunStatus::Aborted { .. } => exit_codes::ABORTED,
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!("run {}", outcome.run_id);
    for result in &outcome.stages {
        let mark = match result.status {
            StageStatus::Succeeded => "ok",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "skipped",
        };
        println!("  {:<18} {mark}", result.stage.as_str());
    }
    match &outcome.status {
        RunStatus::Succeeded => {
            for doc in &outcome.documents {
                println!("archived {}", doc.display());
            }
            match &outcome.publish {
                Some(PublishResult::Pushed { commit }) => println!("pushed {commit}"),
                Some(PublishResult::NoChanges { commit }) => println!("no changes ({commit})"),
                None => {}
            }
        }
        RunStatus::Failed { stage, reason } => {
            println!("stage {stage} failed: {reason}");
            if let Some(diagnostic) = &outcome.diagnostic
                && diagnostic != reason
            {
                println!("{diagnostic}");
            }
        }
        RunStatus::Aborted { reason } => println!("aborted: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults_config_path() {
        let cli = Cli::parse_from(["genpipe", "run"]);
        match cli.command {
            Command::Run { config } => assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_FILE)),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_init_force_with_config() {
        let cli = Cli::parse_from(["genpipe", "init", "--config", "ci/genpipe.toml", "--force"]);
        match cli.command {
            Command::Init { config, force } => {
                assert_eq!(config, PathBuf::from("ci/genpipe.toml"));
                assert!(force);
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(exit_code(&RunStatus::Succeeded), exit_codes::OK);
        assert_eq!(
            exit_code(&RunStatus::Failed {
                stage: "generate".to_string(),
                reason: "boom".to_string()
            }),
            exit_codes::FAILED
        );
        assert_eq!(
            exit_code(&RunStatus::Aborted {
                reason: "interrupted".to_string()
            }),
            exit_codes::ABORTED
        );
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("genpipe.toml");
        cmd_init(&path, false).expect("first init");
        assert!(cmd_init(&path, false).is_err());
        cmd_init(&path, true).expect("forced init");
        cmd_validate(&path).expect("validate");
    }
}
