//! Rendering chat messages into a prompt with the checkpoint's Jinja chat template.

use std::path::Path;

use minijinja::{context, AutoEscape, Environment};
use serde::Serialize;

use crate::error::VlmError;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One piece of a message; media lines become the processor's media markers.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Text { text: String },
    Image,
    Video,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Line>,
}

impl Message {
    pub fn new(role: Role, content: Vec<Line>) -> Self {
        Self { role, content }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Line::Text { text: text.into() }])
    }
}

const TEMPLATE_NAME: &str = "chat";

/// A compiled chat template plus the special tokens templates commonly reference.
pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(
        source: impl Into<String>,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Result<Self, VlmError> {
        let mut env = Environment::new();
        // plain-text prompt, not HTML
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_template_owned(TEMPLATE_NAME, source.into())
            .map_err(|e| VlmError::InvalidConfiguration(format!("chat template: {e}")))?;
        Ok(Self {
            env,
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        })
    }

    /// Read the template from `chat_template.json`, falling back to the `chat_template`
    /// field of `tokenizer_config.json`. Returns `None` when the checkpoint carries neither.
    pub fn from_checkpoint(dir: &Path) -> Result<Option<Self>, VlmError> {
        let read_json = |name: &str| -> Result<Option<serde_json::Value>, VlmError> {
            let path = dir.join(name);
            if !path.is_file() {
                return Ok(None);
            }
            let data = std::fs::read_to_string(&path).map_err(|e| {
                VlmError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| VlmError::InvalidConfiguration(format!("{name}: {e}")))
        };

        let tokenizer_config = read_json("tokenizer_config.json")?.unwrap_or_default();
        let special = |key: &str| match &tokenizer_config[key] {
            serde_json::Value::String(s) => s.clone(),
            // older configs store added tokens as objects
            serde_json::Value::Object(o) => o
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };

        let source = read_json("chat_template.json")?
            .and_then(|v| v["chat_template"].as_str().map(str::to_string))
            .or_else(|| tokenizer_config["chat_template"].as_str().map(str::to_string));

        source
            .map(|source| Self::new(source, special("bos_token"), special("eos_token")))
            .transpose()
    }

    pub fn apply(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, VlmError> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| VlmError::InvalidConfiguration(format!("chat template: {e}")))?;
        template
            .render(context! {
                messages => messages,
                add_generation_prompt => add_generation_prompt,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
            })
            .map_err(|e| VlmError::InvalidConfiguration(format!("chat template: {e}")))
    }
}
