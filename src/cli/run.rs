//! Run command - executes a flow with the built-in runners

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use serde_json::Value;
use tracing::{info, warn};

use super::{init, load_flow};
use crate::create_engine;
use crate::domain::execution::ExecutionStatus;
use crate::domain::flow::{
    ExecutionContext, ExecutionMetadata, ExecutionOptions, FlowEngine, FlowRepository,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Flow definition file (JSON)
    #[arg(short, long)]
    pub file: PathBuf,

    /// Initial input as JSON
    #[arg(short, long, default_value = "{}")]
    pub input: String,

    /// Conversation id; required for flows with wait nodes
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// Extra flows that subprocess nodes may call
    #[arg(long = "with", value_name = "FILE")]
    pub with: Vec<PathBuf>,

    /// Conversation events (JSON) delivered in order while the execution is suspended
    #[arg(long = "event", value_name = "JSON")]
    pub events: Vec<String>,
}

fn parse_json(text: &str, what: &str) -> anyhow::Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid {} JSON", what))
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = init();
    let state = create_engine(&config.engine)?;

    for path in &args.with {
        let flow = load_flow(path)?;
        info!(flow_code = %flow.code(), version = flow.version(), "Registered subprocess flow");
        state.flows.save(flow).await?;
    }

    let flow = load_flow(&args.file)?;
    state.flows.save(flow.clone()).await?;

    let mut metadata = ExecutionMetadata::default();
    if let Some(conversation_id) = &args.conversation {
        metadata = metadata.with_conversation_id(conversation_id.as_str());
    }
    let ctx = ExecutionContext::new(parse_json(&args.input, "--input")?).with_metadata(metadata);

    let mut result = state
        .engine
        .execute(Arc::new(flow), ctx, ExecutionOptions::default())
        .await?;

    for event in &args.events {
        if result.status != ExecutionStatus::Suspended {
            warn!(status = %result.status, "Execution is not suspended, ignoring remaining events");
            break;
        }
        let Some(conversation_id) = args.conversation.as_deref() else {
            anyhow::bail!("--event requires --conversation");
        };

        let event = parse_json(event, "--event")?;
        match state
            .engine
            .resume(conversation_id, event, ExecutionOptions::default())
            .await?
        {
            Some(resumed) => result = resumed,
            None => warn!(conversation_id = %conversation_id, "Event did not resume the execution"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.status == ExecutionStatus::Failed {
        anyhow::bail!("Execution {} failed", result.execute_id);
    }
    Ok(())
}
