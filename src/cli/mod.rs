//! CLI module for the flow engine
//!
//! Subcommands:
//! - `run`: execute a flow file with the built-in runners
//! - `validate`: check a flow file and print its validation errors

pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::domain::flow::FlowDefinition;
use crate::infrastructure::logging;

/// Flow Engine - interprets workflow graphs for chat and AI agents
#[derive(Parser)]
#[command(name = "flow-engine")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a flow and print the execution result as JSON
    Run(run::RunArgs),

    /// Validate a flow file
    Validate(validate::ValidateArgs),
}

/// Load `.env`, read the configuration and install the subscriber
pub fn init() -> AppConfig {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().unwrap_or_default();
    logging::init_logging(&config.logging);
    config
}

/// Read a flow definition from a JSON file
pub fn load_flow(path: &Path) -> anyhow::Result<FlowDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flow file {}", path.display()))?;

    serde_json::from_str(&text).with_context(|| format!("Invalid flow file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_flow_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "code": "hello",
                "nodes": [
                    {{"id": "start", "type": "start"}},
                    {{"id": "end", "type": "end"}}
                ],
                "edges": [{{"source": "start", "target": "end"}}]
            }}"#
        )
        .unwrap();

        let flow = load_flow(file.path()).unwrap();
        assert_eq!(flow.code().as_str(), "hello");
        assert_eq!(flow.version(), 1);
        assert_eq!(flow.nodes().len(), 2);
    }

    #[test]
    fn test_load_flow_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.json");
        let err = load_flow(&missing).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read flow file"));

        let invalid = dir.path().join("invalid.json");
        std::fs::write(&invalid, r#"{"code": "has spaces", "nodes": []}"#).unwrap();
        let err = load_flow(&invalid).unwrap_err();
        assert!(err.to_string().starts_with("Invalid flow file"));
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "flow-engine",
            "run",
            "--file",
            "main.json",
            "--input",
            r#"{"q": "hi"}"#,
            "--conversation",
            "conv-1",
            "--with",
            "child.json",
            "--with",
            "other.json",
            "--event",
            r#"{"text": "yes"}"#,
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.with.len(), 2);
        assert_eq!(args.events.len(), 1);
        assert_eq!(args.conversation.as_deref(), Some("conv-1"));
    }
}
