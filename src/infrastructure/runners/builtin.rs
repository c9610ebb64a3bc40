//! Start, End, Reply and Variable Save runners

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::domain::flow::{
    ExecutionContext, FlowError, NodeError, NodeInvocation, NodeRunner, NodeType, VertexResult,
};

/// Echoes the execution input as the start node output
#[derive(Debug, Default)]
pub struct StartRunner;

#[async_trait]
impl NodeRunner for StartRunner {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn execute(
        &self,
        _invocation: NodeInvocation<'_>,
        result: &mut VertexResult,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FlowError> {
        result.succeed(ctx.input().clone());
        Ok(())
    }
}

/// Outputs its resolved params; this becomes the execution output
#[derive(Debug, Default)]
pub struct EndRunner;

#[async_trait]
impl NodeRunner for EndRunner {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    async fn execute(
        &self,
        invocation: NodeInvocation<'_>,
        result: &mut VertexResult,
        _ctx: &mut ExecutionContext,
    ) -> Result<(), FlowError> {
        result.succeed(invocation.params_value());
        Ok(())
    }
}

/// Produces the reply payload sent back to the conversation
#[derive(Debug, Default)]
pub struct ReplyRunner;

#[async_trait]
impl NodeRunner for ReplyRunner {
    fn node_type(&self) -> NodeType {
        NodeType::Reply
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["content"]
    }

    async fn execute(
        &self,
        invocation: NodeInvocation<'_>,
        result: &mut VertexResult,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FlowError> {
        if let Some(conversation_id) = ctx.conversation_id() {
            result.log(format!("reply to conversation {}", conversation_id));
        }
        result.succeed(invocation.params_value());
        Ok(())
    }
}

/// How a Variable Save node combines the new value with the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveMode {
    Set,
    Add,
    Append,
}

impl SaveMode {
    fn parse(mode: Option<&str>) -> Result<Self, String> {
        match mode {
            None | Some("set") => Ok(SaveMode::Set),
            Some("add") => Ok(SaveMode::Add),
            Some("append") => Ok(SaveMode::Append),
            Some(other) => Err(format!("Unknown save mode '{}'", other)),
        }
    }

    fn combine(&self, current: Option<&Value>, value: &Value) -> Result<Value, String> {
        match self {
            SaveMode::Set => Ok(value.clone()),
            SaveMode::Add => add(current.unwrap_or(&Value::Null), value),
            SaveMode::Append => match current {
                None | Some(Value::Null) => Ok(json!([value])),
                Some(Value::Array(items)) => {
                    let mut items = items.clone();
                    items.push(value.clone());
                    Ok(Value::Array(items))
                }
                Some(_) => Err("Cannot append to a non-array variable".to_string()),
            },
        }
    }
}

fn add(current: &Value, value: &Value) -> Result<Value, String> {
    let zero = json!(0);
    let current = if current.is_null() { &zero } else { current };

    if let (Some(a), Some(b)) = (current.as_i64(), value.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| "Integer overflow".to_string());
    }

    match (current.as_f64(), value.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(format!("Cannot add {} to {}", value, current)),
    }
}

/// Writes a flow variable readable as `${variables.<name>}`
#[derive(Debug, Default)]
pub struct VariableSaveRunner;

#[async_trait]
impl NodeRunner for VariableSaveRunner {
    fn node_type(&self) -> NodeType {
        NodeType::VariableSave
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["name", "value"]
    }

    async fn execute(
        &self,
        invocation: NodeInvocation<'_>,
        result: &mut VertexResult,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FlowError> {
        let Some(name) = invocation.param_str("name") else {
            result.fail(NodeError::new("Param 'name' must be a string"));
            return Ok(());
        };
        let value = invocation.param("value").cloned().unwrap_or(Value::Null);

        let combined = SaveMode::parse(invocation.param_str("mode"))
            .and_then(|mode| mode.combine(ctx.variable(name), &value));

        match combined {
            Ok(saved) => {
                result.log(format!("{} = {}", name, saved));
                ctx.set_variable(name, saved.clone());
                result.succeed(json!({ "name": name, "value": saved }));
            }
            Err(message) => result.fail(NodeError::new(message)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::Node;
    use serde_json::Map;

    async fn run(
        runner: &dyn NodeRunner,
        params: Value,
        ctx: &mut ExecutionContext,
    ) -> VertexResult {
        let node = Node::new("node", runner.node_type());
        let params: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
        let mut result = VertexResult::new("node", runner.node_type());
        let invocation = NodeInvocation {
            execute_id: "exec-1",
            node: &node,
            params: &params,
            upstream: &[],
        };

        runner.execute(invocation, &mut result, ctx).await.unwrap();
        result
    }

    #[tokio::test]
    async fn test_start_echoes_input() {
        let mut ctx = ExecutionContext::new(json!({"question": "hi"}));
        let result = run(&StartRunner, json!({}), &mut ctx).await;

        assert!(result.success);
        assert_eq!(result.output, json!({"question": "hi"}));
    }

    #[tokio::test]
    async fn test_end_and_reply_output_params() {
        let mut ctx = ExecutionContext::new(json!({}));

        let end = run(&EndRunner, json!({"answer": 42}), &mut ctx).await;
        assert_eq!(end.output, json!({"answer": 42}));

        let reply = run(&ReplyRunner, json!({"content": "hello"}), &mut ctx).await;
        assert_eq!(reply.output["content"], "hello");
        assert!(reply.debug_log.is_empty());
    }

    #[tokio::test]
    async fn test_reply_logs_conversation() {
        let mut ctx = ExecutionContext::new(json!({})).with_metadata(
            crate::domain::flow::ExecutionMetadata::default().with_conversation_id("conv-1"),
        );

        let reply = run(&ReplyRunner, json!({"content": "hello"}), &mut ctx).await;
        assert_eq!(reply.debug_log, vec!["reply to conversation conv-1"]);
    }

    #[tokio::test]
    async fn test_variable_save_modes() {
        let mut ctx = ExecutionContext::new(json!({}));

        run(&VariableSaveRunner, json!({"name": "sum", "value": 1, "mode": "add"}), &mut ctx).await;
        run(&VariableSaveRunner, json!({"name": "sum", "value": 2, "mode": "add"}), &mut ctx).await;
        assert_eq!(ctx.variable("sum"), Some(&json!(3)));

        run(&VariableSaveRunner, json!({"name": "sum", "value": 0.5, "mode": "add"}), &mut ctx).await;
        assert_eq!(ctx.variable("sum"), Some(&json!(3.5)));

        run(&VariableSaveRunner, json!({"name": "seen", "value": "a", "mode": "append"}), &mut ctx).await;
        run(&VariableSaveRunner, json!({"name": "seen", "value": "b", "mode": "append"}), &mut ctx).await;
        assert_eq!(ctx.variable("seen"), Some(&json!(["a", "b"])));

        let result = run(&VariableSaveRunner, json!({"name": "seen", "value": "x"}), &mut ctx).await;
        assert_eq!(result.output, json!({"name": "seen", "value": "x"}));
        assert_eq!(ctx.variable("seen"), Some(&json!("x")));
    }

    #[tokio::test]
    async fn test_variable_save_failures() {
        let mut ctx = ExecutionContext::new(json!({}));
        ctx.set_variable("label", json!("text"));

        let result = run(&VariableSaveRunner, json!({"name": "label", "value": 1, "mode": "add"}), &mut ctx).await;
        assert!(!result.success);
        assert!(!result.is_retryable());

        let result = run(&VariableSaveRunner, json!({"name": "x", "value": 1, "mode": "merge"}), &mut ctx).await;
        assert_eq!(result.error_message(), Some("Unknown save mode 'merge'"));

        let result = run(&VariableSaveRunner, json!({"name": 5, "value": 1}), &mut ctx).await;
        assert_eq!(result.error_message(), Some("Param 'name' must be a string"));
    }
}
