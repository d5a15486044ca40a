//! Execution provider selection for ONNX Runtime sessions.
//!
//! [`build_session`] creates an `ort::Session` for the requested
//! [`InferenceBackend`], registering TensorRT (with engine caching) or CUDA
//! and letting ORT fall back to CPU when a provider cannot load.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` requires the TensorRT runtime libraries; without them the
/// session falls back to CUDA, then CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    pub fn uses_gpu(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

impl FromStr for InferenceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            other => Err(format!("unknown backend '{other}' (expected cpu, cuda or tensorrt)")),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Build an `ort::Session` with the requested backend and fallback chain.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = resolve_trt_cache_dir(config.trt_cache_dir);
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            debug!(
                backend = "tensorrt",
                cache_dir = %cache_dir.display(),
                "Building session with TensorRT EP (CUDA EP fallback)"
            );

            let started = Instant::now();
            let session = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

            info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                cache_dir = %cache_dir.display(),
                "TensorRT session ready"
            );
            session
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");

            builder
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
    };

    Ok(session)
}

pub fn resolve_trt_cache_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("trt_cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_is_strict() {
        assert_eq!("cpu".parse::<InferenceBackend>(), Ok(InferenceBackend::Cpu));
        assert!("metal".parse::<InferenceBackend>().is_err());
    }

    #[test]
    fn test_backend_display_and_serde() {
        assert_eq!(InferenceBackend::Tensorrt.to_string(), "tensorrt");
        let json = serde_json::to_string(&InferenceBackend::Cpu).expect("serialize");
        assert_eq!(json, "\"cpu\"");
        assert!(!InferenceBackend::Cpu.uses_gpu());
        assert!(InferenceBackend::default().uses_gpu());
    }

    #[test]
    fn test_resolve_trt_cache_dir() {
        assert_eq!(resolve_trt_cache_dir(None), PathBuf::from("trt_cache"));
        assert_eq!(
            resolve_trt_cache_dir(Some(Path::new("/data/trt"))),
            PathBuf::from("/data/trt")
        );
    }

    #[test]
    #[ignore = "requires a real ONNX model"]
    fn test_build_session_missing_model_fails() {
        let config = SessionConfig {
            model_path: Path::new("does-not-exist.onnx"),
            backend: InferenceBackend::Cpu,
            trt_cache_dir: None,
        };
        assert!(build_session(&config).is_err());
    }
}
