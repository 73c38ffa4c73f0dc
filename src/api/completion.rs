//! Chat Completion API
//!
//! Request and response types for `chat/completions`, plus the per-call options
//! accepted by the generation methods.

use crate::error::{PoolError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_JSON: &str = "application/json";
pub const MIME_PDF: &str = "application/pdf";

/// A message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user" or "assistant"
    pub role: String,

    /// Message content (can be string or array of content parts)
    #[serde(default = "MessageContent::empty")]
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(parts),
        }
    }
}

/// Message content - can be a simple string or array of parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple string content
    Text(String),

    /// Array of content parts (for multimodal)
    Parts(Vec<ContentPart>),

    /// Providers answer `null` content on refusals and empty completions
    Null,
}

impl MessageContent {
    fn empty() -> Self {
        MessageContent::Null
    }

    /// Convert to string (concatenating text parts if needed)
    pub fn to_string_content(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Null => String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
            MessageContent::Null => true,
        }
    }
}

/// A content part in a message (for multimodal content)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },

    /// Inline document, e.g. a PDF
    #[serde(rename = "file")]
    File { file: FileData },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Image embedded as a base64 data URL
    pub fn image(data: &[u8], mime_type: &str) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: data_url(mime_type, data),
                detail: None,
            },
        }
    }

    /// PDF embedded as a base64 data URL
    pub fn pdf(data: &[u8], filename: impl Into<String>) -> Self {
        ContentPart::File {
            file: FileData {
                filename: filename.into(),
                file_data: data_url(MIME_PDF, data),
            },
        }
    }
}

/// `data:<mime>;base64,<payload>`
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(data))
}

/// Image URL content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// URL or base64 data URL
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// File content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,

    /// Base64 data URL
    pub file_data: String,
}

/// Structured output request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonObject,
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchemaFormat {
    pub name: String,
    pub strict: bool,
    pub schema: serde_json::Value,
}

/// Chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            response_format: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_response_format(mut self, format: Option<ResponseFormat>) -> Self {
        self.response_format = format;
        self
    }
}

/// Per-call options for the generation methods
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Prepended as a system message
    pub system_instructions: Option<String>,

    /// `text/plain` (default) or `application/json`
    pub response_mime_type: Option<String>,

    /// Request output conforming to this JSON schema
    pub json_schema: Option<serde_json::Value>,

    /// Per-attempt timeout override
    pub timeout: Option<Duration>,

    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a JSON object response
    pub fn json() -> Self {
        Self::default().with_response_mime_type(MIME_JSON)
    }

    pub fn with_system_instructions(mut self, system: impl Into<String>) -> Self {
        self.system_instructions = Some(system.into());
        self
    }

    pub fn with_response_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.response_mime_type = Some(mime.into());
        self
    }

    pub fn with_json_schema(mut self, schema: serde_json::Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// The `response_format` these options translate to
    pub fn response_format(&self) -> Result<Option<ResponseFormat>> {
        if let Some(schema) = &self.json_schema {
            return Ok(Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaFormat {
                    name: "response".to_string(),
                    strict: true,
                    schema: schema.clone(),
                },
            }));
        }

        match self.response_mime_type.as_deref() {
            None | Some(MIME_TEXT) => Ok(None),
            Some(MIME_JSON) => Ok(Some(ResponseFormat::JsonObject)),
            Some(other) => Err(PoolError::Config(format!(
                "Unsupported response_mime_type '{}'. Valid: {}, {}",
                other, MIME_TEXT, MIME_JSON
            ))),
        }
    }

    /// Messages for a prompt, with the system instructions first when present
    pub fn messages(&self, user: Message) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_instructions {
            messages.push(Message::system(system.clone()));
        }
        messages.push(user);
        messages
    }
}

/// Chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub choices: Vec<Choice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A choice in the completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,

    pub message: Message,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,

    #[serde(default)]
    pub completion_tokens: u32,

    #[serde(default)]
    pub total_tokens: u32,
}

impl CompletionResponse {
    /// Get the first message content
    pub fn content(&self) -> Option<String> {
        self.choices
            .first()
            .map(|c| c.message.content.to_string_content())
    }

    /// Parse the first message content as JSON, tolerating a markdown code fence
    pub fn json_content(&self) -> Result<serde_json::Value> {
        let content = self
            .content()
            .ok_or_else(|| PoolError::Response("Completion has no choices".to_string()))?;

        let trimmed = strip_code_fence(&content);
        serde_json::from_str(trimmed).map_err(|e| {
            PoolError::Response(format!("Completion content is not valid JSON: {}", e))
        })
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
