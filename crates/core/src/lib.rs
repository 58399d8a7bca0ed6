//! Core crate for tilescale: tile-based neural upscaling of images, videos and frame streams.

pub mod backend;
pub mod config;
pub mod engine;
pub mod executor;
pub mod img2img;
pub mod logging;
pub mod media;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod stream;
pub mod tiling;
pub mod types;

pub use engine::{InferenceEngine, ModelMetadata, OrtEngine};
pub use pipeline::{is_cancelled, Cancelled, PipelineState, PipelineStateError, UpscalePipeline};
pub use types::{Image, Normalization, Video, VideoInfo};
