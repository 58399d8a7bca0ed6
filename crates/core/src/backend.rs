//! Execution device selection and `ort::Session` construction.
//!
//! [`build_session`] registers the execution providers for an
//! [`ExecutionDevice`]: CPU only, CUDA, or TensorRT with an engine cache and
//! CUDA as fallback.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const TRT_PROGRESS_TICK_SECS: u64 = 15;

/// Where inference runs. `Cuda` is the default; `Tensorrt` needs the TensorRT
/// runtime (`libnvinfer.so.10` / `nvinfer.dll`) and otherwise falls back to CUDA.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDevice {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl ExecutionDevice {
    /// Case-insensitive parse. Unknown values map to `Cuda`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub device: ExecutionDevice,
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    stats.file_count += 1;
                    stats.total_bytes += meta.len();
                }
            }
        }
    }

    stats
}

/// Default TensorRT engine cache location next to a model file.
pub fn default_trt_cache_dir(model_path: &Path) -> PathBuf {
    model_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("trt_cache")
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    match config.device {
        ExecutionDevice::Cpu => {
            debug!(device = "cpu", "Building session with CPU EP");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
        }
        ExecutionDevice::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(device = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
        }
        ExecutionDevice::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| default_trt_cache_dir(model_path));
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let before = cache_stats(&cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                cache_bytes = before.total_bytes,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let cache_dir_for_log = cache_dir.display().to_string();
            let progress = thread::spawn(move || {
                let tick = Duration::from_secs(TRT_PROGRESS_TICK_SECS);
                let mut elapsed = TRT_PROGRESS_TICK_SECS;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(
                                elapsed_secs = elapsed,
                                cache_dir = %cache_dir_for_log,
                                "TensorRT session initialization still in progress"
                            );
                            elapsed += TRT_PROGRESS_TICK_SECS;
                        }
                    }
                }
            });

            let cache_path = cache_dir.to_string_lossy().to_string();
            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));

            let _ = stop_tx.send(());
            let _ = progress.join();

            let elapsed_secs = started.elapsed().as_secs_f64();
            let after = cache_stats(&cache_dir);
            match &result {
                Ok(_) => info!(
                    elapsed_secs,
                    cache_dir = %cache_dir.display(),
                    cache_updated = after != before,
                    cache_files = after.file_count,
                    cache_bytes = after.total_bytes,
                    "TensorRT session ready"
                ),
                Err(e) => error!(
                    elapsed_secs,
                    cache_dir = %cache_dir.display(),
                    error = %e,
                    "TensorRT session initialization failed"
                ),
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_str_lossy() {
        assert_eq!(ExecutionDevice::from_str_lossy("cpu"), ExecutionDevice::Cpu);
        assert_eq!(ExecutionDevice::from_str_lossy(" CPU "), ExecutionDevice::Cpu);
        assert_eq!(ExecutionDevice::from_str_lossy("CUDA"), ExecutionDevice::Cuda);
        assert_eq!(
            ExecutionDevice::from_str_lossy("TensorRT"),
            ExecutionDevice::Tensorrt
        );
        assert_eq!(ExecutionDevice::from_str_lossy("trt"), ExecutionDevice::Tensorrt);
        assert_eq!(ExecutionDevice::from_str_lossy("vulkan"), ExecutionDevice::Cuda);
        assert_eq!(ExecutionDevice::from_str_lossy(""), ExecutionDevice::Cuda);
    }

    #[test]
    fn test_device_display_matches_serde() {
        for device in [
            ExecutionDevice::Cpu,
            ExecutionDevice::Cuda,
            ExecutionDevice::Tensorrt,
        ] {
            let json = serde_json::to_string(&device).expect("serialize");
            assert_eq!(json, format!("\"{device}\""));
            assert_eq!(ExecutionDevice::from_str_lossy(&device.to_string()), device);
        }
    }

    #[test]
    fn test_default_trt_cache_dir_sits_next_to_model() {
        assert_eq!(
            default_trt_cache_dir(Path::new("models/x4.onnx")),
            PathBuf::from("models/trt_cache")
        );
    }

    #[test]
    fn test_cache_stats_counts_nested_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("nested")).expect("mkdir");
        std::fs::write(dir.path().join("a.engine"), [0u8; 10]).expect("write");
        std::fs::write(dir.path().join("nested/b.profile"), [0u8; 5]).expect("write");

        let stats = cache_stats(dir.path());
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 15);
        assert_eq!(cache_stats(&dir.path().join("missing")), CacheStats::default());
    }
}
