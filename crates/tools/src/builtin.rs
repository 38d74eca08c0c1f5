//! Built-in tools.

use chrono::{SecondsFormat, Utc};
use lt_domain::tool::ToolDefinition;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::ToolRegistry;

pub fn register(reg: &mut ToolRegistry) {
    reg.register(
        ToolDefinition {
            name: "echo".into(),
            description: "Return the given text unchanged.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo back" }
                },
                "required": ["text"]
            }),
        },
        |args| async move { echo(args) },
    );

    reg.register(
        ToolDefinition {
            name: "clock".into(),
            description: "Current date and time in UTC.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        |_| async move { Ok::<_, String>(clock()) },
    );
}

#[derive(Debug, Deserialize)]
struct EchoRequest {
    text: String,
}

fn echo(arguments: Value) -> Result<Value, String> {
    let req = EchoRequest::deserialize(arguments).map_err(|e| format!("invalid echo arguments: {e}"))?;
    Ok(json!({ "text": req.text }))
}

fn clock() -> Value {
    let now = Utc::now();
    json!({
        "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "unix": now.timestamp(),
    })
}
