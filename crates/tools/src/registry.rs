use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use lt_domain::tool::ToolDefinition;
use lt_providers::ToolExecutor;
use serde_json::Value;

use crate::builtin;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Handler,
}

/// Name-keyed set of tools with async handlers.
///
/// Handlers return `Err(message)` for tool-level failures; the session
/// reports the message back to the model as the tool result.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo` and `clock`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        builtin::register(&mut reg);
        reg
    }

    /// Register `handler` under `definition.name`, replacing any tool with
    /// the same name.
    pub fn register<F, Fut>(&mut self, definition: ToolDefinition, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(handler(args)));
        let name = definition.name.clone();
        if self
            .tools
            .insert(name.clone(), RegisteredTool { definition, handler })
            .is_some()
        {
            tracing::warn!(tool = %name, "tool re-registered, previous handler replaced");
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, tool_name: &str, arguments: &Value) -> Result<Value, String> {
        let handler = match self.tools.get(tool_name) {
            Some(t) => t.handler.clone(),
            None => {
                return Err(format!(
                    "unknown tool '{tool_name}' (available: {})",
                    self.names().join(", ")
                ));
            }
        };
        handler(arguments.clone()).await
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: format!("{name} tool"),
            parameters: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut reg = ToolRegistry::new();
        reg.register(def("add"), |args| async move {
            match (args["a"].as_i64(), args["b"].as_i64()) {
                (Some(a), Some(b)) => Ok(json!(a + b)),
                _ => Err("a and b must be integers".to_string()),
            }
        });
        assert_eq!(reg.execute("add", &json!({"a": 2, "b": 3})).await, Ok(json!(5)));
        assert_eq!(
            reg.execute("add", &json!({"a": 2})).await,
            Err("a and b must be integers".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_a_structured_error() {
        let reg = ToolRegistry::with_builtins();
        let err = reg.execute("weather", &json!({})).await.unwrap_err();
        assert!(err.contains("unknown tool 'weather'"));
        assert!(err.contains("clock, echo"));
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(def("zeta"), |_| async { Ok::<_, String>(Value::Null) });
        reg.register(def("alpha"), |_| async { Ok::<_, String>(Value::Null) });
        let names: Vec<String> = reg.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(reg.len(), 2);
    }
}
