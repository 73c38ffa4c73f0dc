//! API Module
//!
//! Chat completion and embedding request/response types.

pub mod completion;
pub mod embedding;

pub use completion::{
    data_url, Choice, CompletionRequest, CompletionResponse, ContentPart, FileData,
    GenerateOptions, ImageUrl, JsonSchemaFormat, Message, MessageContent, ResponseFormat, Usage,
    MIME_JSON, MIME_PDF, MIME_TEXT,
};
pub use embedding::{EmbeddingData, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage};
