//! Tile-based upscaling pipeline.
//!
//! [`UpscalePipeline`] owns one inference engine and drives it through three
//! calling shapes: a single image, a buffered video, and a lazily pulled
//! frame stream (see [`crate::stream`]). Tiles and frames are processed
//! strictly in order; each engine call runs on a blocking thread.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array4;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ExecutionDevice;
use crate::engine::{InferenceEngine, ModelMetadata, OrtEngine};
use crate::executor;
use crate::model::ModelDescriptor;
use crate::stream::{FrameSource, UpscaleStream};
use crate::tiling;
use crate::types::{Image, Video};

/// Returned when the caller's cancellation token fires mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upscale cancelled")
    }
}

impl std::error::Error for Cancelled {}

pub fn is_cancelled(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Cancelled>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStateError {
    NotLoaded,
    AlreadyLoaded,
}

impl std::fmt::Display for PipelineStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "model is not loaded; call load() first"),
            Self::AlreadyLoaded => write!(f, "model is already loaded"),
        }
    }
}

impl std::error::Error for PipelineStateError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unloaded,
    Loaded,
}

enum Lifecycle {
    Unloaded,
    Loaded(ModelMetadata),
}

pub struct UpscalePipeline<E: InferenceEngine> {
    descriptor: ModelDescriptor,
    engine: Arc<Mutex<E>>,
    lifecycle: Lifecycle,
}

pub type OrtPipeline = UpscalePipeline<OrtEngine>;

pub(crate) fn lock_engine<E>(engine: &Arc<Mutex<E>>) -> Result<MutexGuard<'_, E>> {
    engine
        .lock()
        .map_err(|_| anyhow!("inference engine lock poisoned by an earlier panic"))
}

/// Plan, infer and reassemble one image.
pub(crate) async fn upscale_image<E: InferenceEngine>(
    engine: &Arc<Mutex<E>>,
    metadata: &ModelMetadata,
    image: &Image,
    cancel: &CancellationToken,
) -> Result<Image> {
    let tile_size = metadata
        .sample_size
        .unwrap_or_else(|| image.width().max(image.height()));
    let plan = tiling::plan_for(image, tile_size, metadata.scale)?;
    debug!(
        tiles = plan.len(),
        tile_size,
        output_width = plan.output_width,
        output_height = plan.output_height,
        "Planned tiles"
    );

    let mut canvas = Array4::<f32>::zeros((
        1,
        metadata.channels,
        plan.output_height,
        plan.output_width,
    ));

    for tile in &plan.tiles {
        if cancel.is_cancelled() {
            debug!(tile = tile.index, tiles = plan.len(), "Cancelled before tile");
            return Err(Cancelled.into());
        }

        let input = executor::prepare_tile_input(tile, image, metadata)?;
        let engine = Arc::clone(engine);
        let task_tile = *tile;
        let task_meta = *metadata;
        let output = tokio::task::spawn_blocking(move || {
            let mut engine = lock_engine(&engine)?;
            executor::infer_tile(&mut *engine, input, &task_tile, &task_meta)
        })
        .await
        .context("tile inference task panicked")??;

        executor::write_tile(&mut canvas, tile, &output)?;
    }

    Image::from_tensor(canvas, metadata.normalization)
}

impl<E: InferenceEngine> UpscalePipeline<E> {
    pub fn from_descriptor(descriptor: ModelDescriptor, engine: E) -> Self {
        Self {
            descriptor,
            engine: Arc::new(Mutex::new(engine)),
            lifecycle: Lifecycle::Unloaded,
        }
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> PipelineState {
        match self.lifecycle {
            Lifecycle::Unloaded => PipelineState::Unloaded,
            Lifecycle::Loaded(_) => PipelineState::Loaded,
        }
    }

    /// Effective metadata while loaded.
    pub fn metadata(&self) -> Option<ModelMetadata> {
        match self.lifecycle {
            Lifecycle::Loaded(metadata) => Some(metadata),
            Lifecycle::Unloaded => None,
        }
    }

    fn loaded_metadata(&self) -> Result<ModelMetadata> {
        self.metadata()
            .ok_or_else(|| PipelineStateError::NotLoaded.into())
    }

    /// Merge what the engine reports with the descriptor.
    fn reconcile(&self, reported: ModelMetadata) -> Result<ModelMetadata> {
        let d = &self.descriptor;
        if reported.scale != d.scale as usize {
            bail!(
                "model {} reports scale {} but is configured for {}",
                d.name,
                reported.scale,
                d.scale
            );
        }
        if reported.channels != d.channels as usize {
            bail!(
                "model {} reports {} channels but is configured for {}",
                d.name,
                reported.channels,
                d.channels
            );
        }
        let configured = d.sample_size.map(|s| s as usize);
        let sample_size = match (reported.sample_size, configured) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if sample_size == Some(0) {
            bail!("model {} has a zero sample size", d.name);
        }
        Ok(ModelMetadata {
            sample_size,
            ..reported
        })
    }

    pub async fn load(&mut self) -> Result<()> {
        if matches!(self.lifecycle, Lifecycle::Loaded(_)) {
            return Err(PipelineStateError::AlreadyLoaded.into());
        }
        if self.descriptor.scale == 0 {
            bail!("model {} has scale 0", self.descriptor.name);
        }

        let started = Instant::now();
        let engine = Arc::clone(&self.engine);
        let reported = tokio::task::spawn_blocking(move || -> Result<ModelMetadata> {
            let mut engine = lock_engine(&engine)?;
            engine.load()?;
            engine.metadata()
        })
        .await
        .context("model load task panicked")?
        .with_context(|| format!("failed to load model {}", self.descriptor.name))?;

        let metadata = match self.reconcile(reported) {
            Ok(metadata) => metadata,
            Err(error) => {
                if let Err(unload_error) = self.release_engine().await {
                    warn!(error = %unload_error, "Failed to release engine after rejected load");
                }
                return Err(error);
            }
        };

        self.lifecycle = Lifecycle::Loaded(metadata);
        info!(
            model = %self.descriptor.name,
            device = %self.descriptor.device,
            scale = metadata.scale,
            sample_size = ?metadata.sample_size,
            normalization = %metadata.normalization,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model loaded"
        );
        Ok(())
    }

    async fn release_engine(&self) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            let mut engine = lock_engine(&engine)?;
            engine.unload()
        })
        .await
        .context("model unload task panicked")?
    }

    /// Release the model. No-op when already unloaded.
    ///
    /// If the engine fails to release, the pipeline stays loaded so a later
    /// `unload` (or drop) retries.
    pub async fn unload(&mut self) -> Result<()> {
        if matches!(self.lifecycle, Lifecycle::Unloaded) {
            return Ok(());
        }
        self.release_engine()
            .await
            .with_context(|| format!("failed to unload model {}", self.descriptor.name))?;
        self.lifecycle = Lifecycle::Unloaded;
        info!(model = %self.descriptor.name, "Model unloaded");
        Ok(())
    }

    pub async fn run_image(&mut self, image: &Image, cancel: &CancellationToken) -> Result<Image> {
        let metadata = self.loaded_metadata()?;
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        info!(
            model = %self.descriptor.name,
            width = image.width(),
            height = image.height(),
            started_at = %started_at.to_rfc3339(),
            "Image upscale started"
        );

        let output = upscale_image(&self.engine, &metadata, image, cancel).await?;

        info!(
            model = %self.descriptor.name,
            width = output.width(),
            height = output.height(),
            finished_at = %chrono::Utc::now().to_rfc3339(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image upscale finished"
        );
        Ok(output)
    }

    /// Upscale every frame in order. Any failure fails the whole video.
    pub async fn run_video(&mut self, video: &Video, cancel: &CancellationToken) -> Result<Video> {
        let metadata = self.loaded_metadata()?;
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        info!(
            model = %self.descriptor.name,
            frames = video.len(),
            width = video.info.width,
            height = video.info.height,
            frame_rate = video.info.frame_rate,
            started_at = %started_at.to_rfc3339(),
            "Video upscale started"
        );

        let mut frames = Vec::with_capacity(video.len());
        for (index, frame) in video.frames.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(frame = index, "Cancelled before frame");
                return Err(Cancelled.into());
            }
            let output = upscale_image(&self.engine, &metadata, frame, cancel)
                .await
                .with_context(|| format!("failed to upscale frame {index}"))?;
            frames.push(output);
        }

        let (width, height) = match frames.first() {
            Some(first) => (first.width(), first.height()),
            None => (
                (video.info.width as usize)
                    .checked_mul(metadata.scale)
                    .context("upscaled video width overflows")?,
                (video.info.height as usize)
                    .checked_mul(metadata.scale)
                    .context("upscaled video height overflows")?,
            ),
        };
        let info = video.info.with_dimensions(
            u32::try_from(width).context("upscaled video width exceeds u32")?,
            u32::try_from(height).context("upscaled video height exceeds u32")?,
        );

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            model = %self.descriptor.name,
            frames = frames.len(),
            width = info.width,
            height = info.height,
            finished_at = %chrono::Utc::now().to_rfc3339(),
            elapsed_ms,
            avg_ms = if frames.is_empty() { 0 } else { elapsed_ms / frames.len() as u64 },
            "Video upscale finished"
        );
        Ok(Video::new(info, frames))
    }

    /// Lazily upscale frames pulled from `source`. The pipeline stays borrowed
    /// until the stream is dropped.
    pub fn run_stream<S: FrameSource>(
        &mut self,
        source: S,
        cancel: CancellationToken,
    ) -> Result<UpscaleStream<'_, E, S>> {
        let metadata = self.loaded_metadata()?;
        info!(
            model = %self.descriptor.name,
            started_at = %chrono::Utc::now().to_rfc3339(),
            "Stream upscale started"
        );
        Ok(UpscaleStream::new(&self.engine, metadata, source, cancel))
    }
}

impl UpscalePipeline<OrtEngine> {
    /// ONNX-backed pipeline for a model file. Nothing is loaded until [`load`](Self::load).
    pub fn from_model_path(
        path: impl Into<PathBuf>,
        scale: u32,
        sample_size: Option<u32>,
        device: ExecutionDevice,
    ) -> Self {
        let descriptor = ModelDescriptor::from_path(path, scale, sample_size, device);
        let engine = OrtEngine::from_descriptor(descriptor.clone());
        Self::from_descriptor(descriptor, engine)
    }
}

impl<E: InferenceEngine> Drop for UpscalePipeline<E> {
    fn drop(&mut self) {
        if matches!(self.lifecycle, Lifecycle::Unloaded) {
            return;
        }
        self.lifecycle = Lifecycle::Unloaded;
        match lock_engine(&self.engine).and_then(|mut engine| engine.unload()) {
            Ok(()) => debug!(model = %self.descriptor.name, "Model released on drop"),
            Err(error) => warn!(
                model = %self.descriptor.name,
                error = %error,
                "Failed to release model on drop"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Normalization;

    struct Fixed {
        reported: ModelMetadata,
        loaded: bool,
        loads: usize,
        unloads: usize,
    }

    impl Fixed {
        fn new(scale: usize, sample_size: Option<usize>) -> Self {
            Self {
                reported: ModelMetadata {
                    sample_size,
                    channels: 3,
                    scale,
                    normalization: Normalization::ZeroTo255,
                },
                loaded: false,
                loads: 0,
                unloads: 0,
            }
        }
    }

    impl InferenceEngine for Fixed {
        fn load(&mut self) -> Result<()> {
            self.loaded = true;
            self.loads += 1;
            Ok(())
        }

        fn unload(&mut self) -> Result<()> {
            self.loaded = false;
            self.unloads += 1;
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            self.loaded
        }

        fn metadata(&self) -> Result<ModelMetadata> {
            Ok(self.reported)
        }

        fn run(&mut self, _input: Array4<f32>, output_shape: [usize; 4]) -> Result<Array4<f32>> {
            Ok(Array4::from_elem(output_shape, 255.0))
        }
    }

    fn descriptor(scale: u32, sample_size: Option<u32>) -> ModelDescriptor {
        ModelDescriptor::from_path("fixed.onnx", scale, sample_size, ExecutionDevice::Cpu)
    }

    #[test]
    fn test_cancelled_survives_context() {
        let err = anyhow::Error::from(Cancelled).context("frame 3");
        assert!(is_cancelled(&err));
        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert!(!is_cancelled(&anyhow!("boom")));
    }

    #[tokio::test]
    async fn test_load_takes_min_sample_size() {
        let mut pipeline =
            UpscalePipeline::from_descriptor(descriptor(2, Some(64)), Fixed::new(2, Some(128)));
        assert_eq!(pipeline.state(), PipelineState::Unloaded);
        assert!(pipeline.metadata().is_none());

        pipeline.load().await.expect("load");
        assert_eq!(pipeline.state(), PipelineState::Loaded);
        let meta = pipeline.metadata().expect("metadata");
        assert_eq!(meta.sample_size, Some(64));
        assert_eq!(meta.normalization, Normalization::ZeroTo255);
    }

    #[tokio::test]
    async fn test_load_uses_whichever_sample_size_is_set() {
        let mut pipeline =
            UpscalePipeline::from_descriptor(descriptor(2, None), Fixed::new(2, Some(32)));
        pipeline.load().await.expect("load");
        assert_eq!(pipeline.metadata().expect("meta").sample_size, Some(32));

        let mut pipeline =
            UpscalePipeline::from_descriptor(descriptor(2, None), Fixed::new(2, None));
        pipeline.load().await.expect("load");
        assert_eq!(pipeline.metadata().expect("meta").sample_size, None);
    }

    #[tokio::test]
    async fn test_load_rejects_scale_mismatch_and_releases_engine() {
        let mut pipeline =
            UpscalePipeline::from_descriptor(descriptor(4, None), Fixed::new(2, None));
        let err = pipeline.load().await.unwrap_err();
        assert!(err.to_string().contains("scale"));
        assert_eq!(pipeline.state(), PipelineState::Unloaded);

        let engine = lock_engine(&pipeline.engine).expect("lock");
        assert_eq!(engine.loads, 1);
        assert_eq!(engine.unloads, 1);
        assert!(!engine.loaded);
    }

    #[tokio::test]
    async fn test_image_without_sample_size_is_one_tile() {
        let mut pipeline =
            UpscalePipeline::from_descriptor(descriptor(3, None), Fixed::new(3, None));
        pipeline.load().await.expect("load");

        let image = Image::zeros(3, 5, 7, Normalization::ZeroToOne).expect("image");
        let out = pipeline
            .run_image(&image, &CancellationToken::new())
            .await
            .expect("upscale");
        assert_eq!((out.width(), out.height()), (21, 15));
        assert_eq!(out.normalization(), Normalization::ZeroTo255);
        assert!(out.tensor().iter().all(|v| *v == 255.0));
    }

    #[tokio::test]
    async fn test_drop_unloads_engine() {
        let mut pipeline =
            UpscalePipeline::from_descriptor(descriptor(2, None), Fixed::new(2, None));
        pipeline.load().await.expect("load");
        let engine = Arc::clone(&pipeline.engine);
        drop(pipeline);

        let engine = lock_engine(&engine).expect("lock");
        assert_eq!(engine.unloads, 1);
        assert!(!engine.loaded);
    }

    #[test]
    fn test_from_model_path_is_pure_construction() {
        let pipeline =
            OrtPipeline::from_model_path("/nowhere/x2.onnx", 2, Some(256), ExecutionDevice::Cpu);
        assert_eq!(pipeline.state(), PipelineState::Unloaded);
        assert_eq!(pipeline.descriptor().name, "x2");
        assert_eq!(pipeline.descriptor().sample_size, Some(256));
    }
}
