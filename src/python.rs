//! Python Bindings
//!
//! Exposes the pool client to the Python web and worker processes.

use crate::api::GenerateOptions;
use crate::config::{ConfigLoader, PoolConfig};
use crate::error::PoolError;
use crate::PoolClient;
use pyo3::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// Python wrapper for the pool client
#[pyclass(name = "PoolClient")]
struct PyPoolClient {
    inner: Arc<PoolClient>,
    runtime: tokio::runtime::Runtime,
}

fn options(
    system_instructions: Option<String>,
    response_mime_type: Option<String>,
    timeout: Option<f64>,
) -> GenerateOptions {
    GenerateOptions {
        system_instructions,
        response_mime_type,
        timeout: timeout
            .filter(|t| *t > 0.0)
            .and_then(|t| Duration::try_from_secs_f64(t).ok()),
        ..Default::default()
    }
}

#[pymethods]
impl PyPoolClient {
    /// Create a client from explicit keys, a config file, or the environment
    #[new]
    #[pyo3(signature = (api_keys=None, config_path=None))]
    fn new(api_keys: Option<Vec<String>>, config_path: Option<&str>) -> PyResult<Self> {
        let mut config = match config_path {
            Some(path) => ConfigLoader::from_path(path)?.into_config(),
            None => ConfigLoader::new()?.into_config(),
        };
        if let Some(keys) = api_keys {
            config.api_keys = keys;
        }

        let inner = PoolClient::new(config)?;
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| PoolError::Internal(format!("Failed to create runtime: {}", e)))?;

        Ok(Self {
            inner: Arc::new(inner),
            runtime,
        })
    }

    /// Generate text, returning the completion content
    #[pyo3(signature = (prompt, system_instructions=None, response_mime_type=None, timeout=None))]
    fn generate_text(
        &self,
        prompt: &str,
        system_instructions: Option<String>,
        response_mime_type: Option<String>,
        timeout: Option<f64>,
    ) -> PyResult<String> {
        let options = options(system_instructions, response_mime_type, timeout);
        let client = self.inner.clone();

        let response = self
            .runtime
            .block_on(async move { client.generate_text(prompt, &options).await })?;
        Ok(response.content().unwrap_or_default())
    }

    /// Generate from a PDF document, returning the completion content
    #[pyo3(signature = (prompt, pdf, system_instructions=None, response_mime_type=None, timeout=None))]
    fn generate_from_pdf(
        &self,
        prompt: &str,
        pdf: &[u8],
        system_instructions: Option<String>,
        response_mime_type: Option<String>,
        timeout: Option<f64>,
    ) -> PyResult<String> {
        let options = options(system_instructions, response_mime_type, timeout);
        let client = self.inner.clone();

        let response = self
            .runtime
            .block_on(async move { client.generate_from_pdf(prompt, pdf, &options).await })?;
        Ok(response.content().unwrap_or_default())
    }

    /// Embed texts, returning vectors in input order
    fn create_embedding(&self, texts: Vec<String>) -> PyResult<Vec<Vec<f32>>> {
        let client = self.inner.clone();
        let vectors = self
            .runtime
            .block_on(async move { client.create_embedding(&texts).await })?;
        Ok(vectors)
    }

    /// Pool statistics as a JSON string
    fn stats(&self) -> PyResult<String> {
        let stats = serde_json::to_string(&self.inner.stats()).map_err(PoolError::from)?;
        Ok(stats)
    }

    fn __len__(&self) -> usize {
        self.inner.pool().len()
    }
}

/// Validate a config without building a client
#[pyfunction]
fn validate_config(json: &str) -> PyResult<()> {
    let config: PoolConfig = serde_json::from_str(json).map_err(PoolError::from)?;
    config.validate()?;
    Ok(())
}

/// Python module definition
#[pymodule]
fn _llmpool(m: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::init_tracing();
    m.add_class::<PyPoolClient>()?;
    m.add_function(wrap_pyfunction!(validate_config, m)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
