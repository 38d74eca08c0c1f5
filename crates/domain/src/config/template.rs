use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt template
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chat-template family of the loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateFamily {
    #[default]
    Chatml,
    Llama3,
    Gemma,
}

impl TemplateFamily {
    /// Whether the family's template has a dedicated tool role.
    pub fn native_tool_role(self) -> bool {
        match self {
            TemplateFamily::Chatml | TemplateFamily::Llama3 => true,
            TemplateFamily::Gemma => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub family: TemplateFamily,
    /// Override the family's tool-role support.
    #[serde(default)]
    pub native_tool_role: Option<bool>,
    /// Render role/content pairs instead of a flat prompt string.
    #[serde(default)]
    pub structured: bool,
    #[serde(default = "d_system_prompt")]
    pub system_prompt: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            family: TemplateFamily::default(),
            native_tool_role: None,
            structured: false,
            system_prompt: d_system_prompt(),
        }
    }
}

impl TemplateConfig {
    pub fn native_tool_role(&self) -> bool {
        self.native_tool_role
            .unwrap_or_else(|| self.family.native_tool_role())
    }
}

fn d_system_prompt() -> String {
    "You are a helpful assistant running on-device. To use a tool, emit a line \
     `TOOL_CALL: {\"name\": ..., \"arguments\": {...}}` and wait for the result."
        .into()
}
