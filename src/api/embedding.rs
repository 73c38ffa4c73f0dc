//! Embeddings API
//!
//! Request and response types for `embeddings`.

use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
}

impl EmbeddingRequest {
    pub fn new(model: impl Into<String>, input: Vec<String>) -> Self {
        Self {
            model: model.into(),
            input,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub embedding: Vec<f32>,

    /// Position of the input this vector belongs to
    pub index: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    #[serde(default)]
    pub prompt_tokens: u32,

    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,

    #[serde(default)]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<EmbeddingUsage>,
}

impl EmbeddingResponse {
    /// Vectors in request order. Every input index must appear exactly once.
    pub fn into_ordered(self, expected: usize) -> Result<Vec<Vec<f32>>> {
        if self.data.len() != expected {
            return Err(PoolError::Response(format!(
                "Expected {} embeddings, got {}",
                expected,
                self.data.len()
            )));
        }

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
        for item in self.data {
            let slot = slots.get_mut(item.index).ok_or_else(|| {
                PoolError::Response(format!("Embedding index {} out of range", item.index))
            })?;
            if slot.replace(item.embedding).is_some() {
                return Err(PoolError::Response(format!(
                    "Duplicate embedding index {}",
                    item.index
                )));
            }
        }

        // Lengths match and no duplicates, so every slot is filled
        Ok(slots.into_iter().flatten().collect())
    }
}
