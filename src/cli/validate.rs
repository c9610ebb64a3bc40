//! Validate command - checks a flow file against the built-in runners

use std::path::PathBuf;

use clap::Args;

use super::{init, load_flow};
use crate::create_engine;
use crate::domain::flow::FlowEngine;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Flow definition file (JSON)
    #[arg(short, long)]
    pub file: PathBuf,
}

pub async fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let config = init();
    let state = create_engine(&config.engine)?;

    let flow = load_flow(&args.file)?;
    let errors = state.engine.validate(&flow);

    if errors.is_empty() {
        println!("Flow '{}' (version {}) is valid", flow.code(), flow.version());
        return Ok(());
    }

    for error in &errors {
        println!("- {}", error);
    }
    anyhow::bail!("Flow '{}' has {} validation error(s)", flow.code(), errors.len())
}
