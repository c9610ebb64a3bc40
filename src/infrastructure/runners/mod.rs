//! Built-in node runners
//!
//! Every other node type (LLM, knowledge retrieval, code, ...) is supplied
//! by the host application through [`NodeRunnerRegistry::register`].

mod builtin;
mod http_request;

use std::sync::Arc;

pub use builtin::{EndRunner, ReplyRunner, StartRunner, VariableSaveRunner};
pub use http_request::HttpRequestRunner;

use crate::domain::DomainError;
use crate::domain::flow::NodeRunnerRegistry;

/// Register the built-in runners
pub fn register_builtin_runners(registry: &mut NodeRunnerRegistry) -> Result<(), DomainError> {
    registry.register(Arc::new(StartRunner))?;
    registry.register(Arc::new(EndRunner))?;
    registry.register(Arc::new(ReplyRunner))?;
    registry.register(Arc::new(VariableSaveRunner))?;
    registry.register(Arc::new(HttpRequestRunner::new()))?;
    Ok(())
}

/// A registry holding only the built-in runners
pub fn builtin_registry() -> Result<NodeRunnerRegistry, DomainError> {
    let mut registry = NodeRunnerRegistry::new();
    register_builtin_runners(&mut registry)?;
    Ok(registry)
}
