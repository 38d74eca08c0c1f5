//! Chat-template rendering for the supported model families.
//!
//! The renderer is pure: the same history always produces the same
//! prompt, so it can be called before every run and every continuation.

use std::fmt::Write as _;

use lt_domain::config::TemplateFamily;
use lt_domain::error::{Error, Result};
use lt_domain::tool::{Message, Role, ToolCall, ToolDefinition};
use serde_json::json;

use crate::traits::{PromptEntry, PromptRenderer, RenderedPrompt, TemplateMeta};

/// Renders ChatML, Llama 3, and Gemma prompts, flat or structured.
#[derive(Debug, Clone)]
pub struct ChatTemplateRenderer {
    system_prompt: String,
}

impl ChatTemplateRenderer {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    /// Flatten history into role/content entries, applying tool-role
    /// fallbacks and folding assistant tool calls into their entry.
    fn entries(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        meta: &TemplateMeta,
    ) -> Result<Vec<PromptEntry>> {
        let (system, rest) = match history.split_first() {
            Some((first, rest)) if first.role == Role::System => (first.content.as_str(), rest),
            _ => (self.system_prompt.as_str(), history),
        };

        let mut entries = Vec::with_capacity(rest.len() + 1);
        entries.push(PromptEntry {
            role: Role::System,
            content: system_with_tools(system, tools),
        });

        for msg in rest {
            match msg.role {
                Role::System => {
                    return Err(Error::Template(
                        "system message is only allowed at the start of history".into(),
                    ));
                }
                Role::Assistant => entries.push(PromptEntry {
                    role: Role::Assistant,
                    content: assistant_content(&msg.content, &msg.tool_calls),
                }),
                Role::Tool if !meta.native_tool_role => entries.push(PromptEntry {
                    role: Role::User,
                    content: format!("<tool_response>\n{}\n</tool_response>", msg.content),
                }),
                role => entries.push(PromptEntry {
                    role,
                    content: msg.content.clone(),
                }),
            }
        }

        if entries.len() == 1 {
            return Err(Error::Template("history has no user turn".into()));
        }
        Ok(entries)
    }
}

impl Default for ChatTemplateRenderer {
    fn default() -> Self {
        Self::new(lt_domain::config::TemplateConfig::default().system_prompt)
    }
}

impl PromptRenderer for ChatTemplateRenderer {
    fn render(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        meta: &TemplateMeta,
    ) -> Result<RenderedPrompt> {
        let entries = self.entries(history, tools, meta)?;
        if meta.structured {
            return Ok(RenderedPrompt::Structured(entries));
        }
        let flat = match meta.family {
            TemplateFamily::Chatml => render_chatml(&entries),
            TemplateFamily::Llama3 => render_llama3(&entries),
            TemplateFamily::Gemma => render_gemma(&entries),
        };
        Ok(RenderedPrompt::Flat(flat))
    }
}

fn system_with_tools(system: &str, tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return system.to_string();
    }
    let mut out = String::from(system);
    out.push_str("\n\nAvailable tools:");
    for tool in tools {
        let _ = write!(
            out,
            "\n- {}: {} parameters={}",
            tool.name, tool.description, tool.parameters
        );
    }
    out
}

fn assistant_content(text: &str, calls: &[ToolCall]) -> String {
    let mut out = text.trim_end().to_string();
    for call in calls {
        if !out.is_empty() {
            out.push('\n');
        }
        let payload = json!({ "name": call.tool_name, "arguments": call.arguments });
        let _ = write!(out, "<tool_call>\n{payload}\n</tool_call>");
    }
    out
}

fn render_chatml(entries: &[PromptEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let _ = write!(out, "<|im_start|>{}\n{}<|im_end|>\n", e.role.as_str(), e.content);
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn render_llama3(entries: &[PromptEntry]) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for e in entries {
        let role = match e.role {
            Role::Tool => "ipython",
            other => other.as_str(),
        };
        let _ = write!(
            out,
            "<|start_header_id|>{role}<|end_header_id|>\n\n{}<|eot_id|>",
            e.content
        );
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

/// Gemma has no system or tool role: the system text is prepended to the
/// first user turn and tool entries become user turns.
fn render_gemma(entries: &[PromptEntry]) -> String {
    let mut out = String::from("<bos>");
    let mut pending_system: Option<&str> = None;
    for e in entries {
        let (role, content) = match e.role {
            Role::System => {
                pending_system = Some(&e.content);
                continue;
            }
            Role::Assistant => ("model", e.content.clone()),
            Role::User | Role::Tool => match pending_system.take() {
                Some(sys) => ("user", format!("{sys}\n\n{}", e.content)),
                None => ("user", e.content.clone()),
            },
        };
        let _ = write!(out, "<start_of_turn>{role}\n{content}<end_of_turn>\n");
    }
    out.push_str("<start_of_turn>model\n");
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
