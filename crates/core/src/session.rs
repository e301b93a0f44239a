//! Inference session bootstrap: execution-provider fallback chain and the
//! raw-bytes retry.
//!
//! Providers are tried in a fixed priority order (TensorRT → CUDA → CPU); each
//! attempt failure is logged and the next provider is tried. If the final CPU
//! attempt cannot create a session from the locator directly, the model's raw
//! bytes are fetched and creation is retried from the in-memory buffer before
//! giving up with [`StageError::SessionCreationFailed`].

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ndarray::{Array4, ArrayD};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PipelineConfig;
use crate::error::StageError;

/// Opaque per-model inference capability: one NCHW f32 tensor in, one out.
///
/// Implementations are not safe for concurrent `run` calls; each pipeline
/// instance owns its sessions exclusively.
pub trait InferenceSession: Send {
    fn run(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>>;
}

/// Where a model lives: a filesystem path or an HTTP(S) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocator {
    Path(PathBuf),
    Url(Url),
}

impl ModelLocator {
    /// Parse a locator string; anything that is not an http(s) URL is a path.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            if let Ok(url) = Url::parse(s) {
                return Self::Url(url);
            }
        }
        Self::Path(PathBuf::from(s))
    }

    /// Fetch the model's raw bytes (filesystem read or blocking HTTP GET).
    pub fn fetch_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Path(path) => std::fs::read(path)
                .with_context(|| format!("failed to read model file: {}", path.display())),
            Self::Url(url) => {
                let response = reqwest::blocking::get(url.clone())
                    .with_context(|| format!("model download failed: {url}"))?;
                let status = response.status();
                if !status.is_success() {
                    anyhow::bail!("model download returned {status}: {url}");
                }
                let bytes = response
                    .bytes()
                    .with_context(|| format!("failed to read model response body: {url}"))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

impl fmt::Display for ModelLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Execution backends in fallback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionBackend {
    Tensorrt,
    Cuda,
    Cpu,
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cuda => write!(f, "cuda"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Fastest / most capable first; CPU is the portable final fallback.
pub const BACKEND_PRIORITY: [ExecutionBackend; 3] = [
    ExecutionBackend::Tensorrt,
    ExecutionBackend::Cuda,
    ExecutionBackend::Cpu,
];

/// `ort`-backed [`InferenceSession`] with resolved binding names.
pub struct OrtSession {
    session: Session,
    input_name: String,
    output_name: String,
}

impl InferenceSession for OrtSession {
    fn run(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }
}

/// Create an inference session for `locator`, trying every backend in
/// [`BACKEND_PRIORITY`] with a raw-bytes retry on the last one.
pub fn bootstrap_session(locator: &ModelLocator, config: &PipelineConfig) -> Result<OrtSession> {
    let cuda = CUDAExecutionProvider::default();
    if !cuda.is_available().unwrap_or(false) {
        warn!(model = %locator, "CUDA EP is not available on this host");
    }

    // URL locators have no file to commit from; fetch once up front and reuse
    // the buffer across attempts.
    let mut model_bytes: Option<Vec<u8>> = match locator {
        ModelLocator::Url(_) => Some(
            locator
                .fetch_bytes()
                .context(StageError::SessionCreationFailed)?,
        ),
        ModelLocator::Path(_) => None,
    };
    if let Some(bytes) = &model_bytes {
        info!(
            model = %locator,
            kib = bytes.len() / 1024,
            "Downloaded model bytes"
        );
    }

    let mut last_error: Option<anyhow::Error> = None;
    for backend in BACKEND_PRIORITY {
        debug!(model = %locator, %backend, "Trying to create session");
        match create_with_backend(backend, locator, model_bytes.as_deref()) {
            Ok(session) => {
                info!(model = %locator, %backend, "Session created");
                return finish_session(session, config);
            }
            Err(error) => {
                warn!(model = %locator, %backend, error = %format!("{error:#}"), "Session attempt failed");
                last_error = Some(error);
            }
        }

        // Raw-bytes retry, only for the final fallback backend and only when
        // the direct attempt used the file path.
        if backend == ExecutionBackend::Cpu && model_bytes.is_none() {
            info!(model = %locator, "Attempting raw-bytes fallback for CPU session");
            match locator.fetch_bytes() {
                Ok(bytes) => {
                    model_bytes = Some(bytes);
                    match create_with_backend(backend, locator, model_bytes.as_deref()) {
                        Ok(session) => {
                            info!(model = %locator, %backend, "Session created from in-memory buffer");
                            return finish_session(session, config);
                        }
                        Err(error) => {
                            warn!(model = %locator, error = %format!("{error:#}"), "Raw-bytes fallback failed");
                            last_error = Some(error);
                        }
                    }
                }
                Err(error) => {
                    warn!(model = %locator, error = %format!("{error:#}"), "Model byte fetch failed");
                    last_error = Some(error);
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no execution backend attempted"))
        .context(format!("every execution backend failed for {locator}"))
        .context(StageError::SessionCreationFailed))
}

fn create_with_backend(
    backend: ExecutionBackend,
    locator: &ModelLocator,
    model_bytes: Option<&[u8]>,
) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let builder = match backend {
        ExecutionBackend::Tensorrt => builder.with_execution_providers([
            TensorRTExecutionProvider::default().build().error_on_failure(),
        ])?,
        ExecutionBackend::Cuda => builder.with_execution_providers([
            CUDAExecutionProvider::default().build().error_on_failure(),
        ])?,
        ExecutionBackend::Cpu => builder
            .with_execution_providers([CPUExecutionProvider::default().build()])?,
    };

    match (locator, model_bytes) {
        (_, Some(bytes)) => builder
            .commit_from_memory(bytes)
            .with_context(|| format!("failed to load ONNX model from buffer: {locator}")),
        (ModelLocator::Path(path), None) => builder
            .commit_from_file(path)
            .with_context(|| format!("failed to load ONNX model: {}", path.display())),
        (ModelLocator::Url(url), None) => {
            anyhow::bail!("URL locator requires prefetched bytes: {url}")
        }
    }
}

fn finish_session(session: Session, config: &PipelineConfig) -> Result<OrtSession> {
    let detected_input = session.inputs()[0].name().to_string();
    let detected_output = session.outputs()[0].name().to_string();

    let input_name = if config.input_name.is_empty() {
        detected_input.clone()
    } else {
        config.input_name.clone()
    };
    // output_name defaults to the first key of the engine's output map
    let output_name = config
        .output_name
        .clone()
        .unwrap_or_else(|| detected_output.clone());

    if input_name != detected_input {
        warn!(
            configured = %input_name,
            detected = %detected_input,
            "Configured input binding differs from the model's first input"
        );
    }
    debug!(%input_name, %output_name, "Resolved session IO bindings");

    Ok(OrtSession {
        session,
        input_name,
        output_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn locator_parse_distinguishes_urls_from_paths() {
        assert_eq!(
            ModelLocator::parse("https://example.com/m.onnx"),
            ModelLocator::Url(Url::parse("https://example.com/m.onnx").unwrap())
        );
        assert_eq!(
            ModelLocator::parse("models/realesrgan.onnx"),
            ModelLocator::Path(PathBuf::from("models/realesrgan.onnx"))
        );
        // scheme-less strings are paths even if they look host-like
        assert_eq!(
            ModelLocator::parse("example.com/m.onnx"),
            ModelLocator::Path(PathBuf::from("example.com/m.onnx"))
        );
    }

    #[test]
    fn locator_display_is_parse_input() {
        assert_eq!(
            ModelLocator::parse("models/face.onnx").to_string(),
            "models/face.onnx"
        );
        assert_eq!(
            ModelLocator::parse("https://example.com/m.onnx").to_string(),
            "https://example.com/m.onnx"
        );
    }

    #[test]
    fn fetch_bytes_reads_local_files() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"onnx-bytes").expect("write");
        let locator = ModelLocator::Path(file.path().to_path_buf());
        assert_eq!(locator.fetch_bytes().expect("fetch"), b"onnx-bytes");
    }

    #[test]
    fn fetch_bytes_fails_for_missing_files() {
        let locator = ModelLocator::parse("/nonexistent/model.onnx");
        assert!(locator.fetch_bytes().is_err());
    }

    #[test]
    fn backend_priority_ends_with_portable_fallback() {
        assert_eq!(BACKEND_PRIORITY.last(), Some(&ExecutionBackend::Cpu));
        assert_eq!(BACKEND_PRIORITY[0].to_string(), "tensorrt");
        assert_eq!(ExecutionBackend::Cuda.to_string(), "cuda");
    }
}
