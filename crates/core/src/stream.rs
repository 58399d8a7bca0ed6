//! Pull-based streaming upscale.
//!
//! Each call to [`UpscaleStream::next`] pulls exactly one frame from the
//! source and returns it upscaled, so at most one input frame is in flight.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{InferenceEngine, ModelMetadata};
use crate::pipeline::{upscale_image, Cancelled};
use crate::types::Image;

/// Asynchronous source of input frames. `None` means end of input.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Image>>> + Send;
}

impl FrameSource for mpsc::Receiver<Result<Image>> {
    async fn next_frame(&mut self) -> Option<Result<Image>> {
        self.recv().await
    }
}

/// Adapts an iterator of frames. The iterator is polled inline, so slow
/// blocking producers are better fed through a bounded channel.
pub struct IterSource<I>(pub I);

impl<I> FrameSource for IterSource<I>
where
    I: Iterator<Item = Result<Image>> + Send,
{
    async fn next_frame(&mut self) -> Option<Result<Image>> {
        self.0.next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    EndOfInput,
    Cancelled,
    Failed,
}

impl Finish {
    fn as_str(self) -> &'static str {
        match self {
            Self::EndOfInput => "end_of_input",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

pub struct UpscaleStream<'a, E, S> {
    engine: &'a Arc<Mutex<E>>,
    metadata: ModelMetadata,
    source: S,
    cancel: CancellationToken,
    finished: Option<Finish>,
    frames_produced: u64,
    started: Instant,
    total_pull_ms: f64,
    total_upscale_ms: f64,
}

impl<'a, E: InferenceEngine, S: FrameSource> UpscaleStream<'a, E, S> {
    pub(crate) fn new(
        engine: &'a Arc<Mutex<E>>,
        metadata: ModelMetadata,
        source: S,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            metadata,
            source,
            cancel,
            finished: None,
            frames_produced: 0,
            started: Instant::now(),
            total_pull_ms: 0.0,
            total_upscale_ms: 0.0,
        }
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Next upscaled frame, or `None` once the stream has finished.
    pub async fn next(&mut self) -> Option<Result<Image>> {
        if self.finished.is_some() {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finish(Finish::Cancelled);
            return Some(Err(Cancelled.into()));
        }

        let index = self.frames_produced;
        let t_pull = Instant::now();
        let pulled = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            frame = self.source.next_frame() => Some(frame),
        };
        self.total_pull_ms += t_pull.elapsed().as_secs_f64() * 1000.0;

        let frame = match pulled {
            None => {
                self.finish(Finish::Cancelled);
                return Some(Err(Cancelled.into()));
            }
            Some(None) => {
                self.finish(Finish::EndOfInput);
                return None;
            }
            Some(Some(Err(error))) => {
                self.finish(Finish::Failed);
                return Some(Err(error.context(format!("failed to read input frame {index}"))));
            }
            Some(Some(Ok(frame))) => frame,
        };

        let t_upscale = Instant::now();
        let result = upscale_image(self.engine, &self.metadata, &frame, &self.cancel)
            .await
            .with_context(|| format!("failed to upscale frame {index}"));
        self.total_upscale_ms += t_upscale.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(image) => {
                self.frames_produced += 1;
                debug!(frame = index, "Stream frame upscaled");
                Some(Ok(image))
            }
            Err(error) => {
                let reason = if crate::pipeline::is_cancelled(&error) {
                    Finish::Cancelled
                } else {
                    Finish::Failed
                };
                self.finish(reason);
                Some(Err(error))
            }
        }
    }

    fn finish(&mut self, reason: Finish) {
        self.finished = Some(reason);
        let frames = self.frames_produced;
        let avg = |total: f64| {
            if frames == 0 {
                0.0
            } else {
                total / frames as f64
            }
        };
        info!(
            frames,
            reason = reason.as_str(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            avg_pull_wait_ms = format!("{:.1}", avg(self.total_pull_ms)),
            avg_upscale_ms = format!("{:.1}", avg(self.total_upscale_ms)),
            total_upscale_ms = format!("{:.0}", self.total_upscale_ms),
            "Stream upscale summary"
        );
    }
}
