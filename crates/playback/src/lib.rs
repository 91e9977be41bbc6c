use anyhow::Result;
use async_trait::async_trait;

pub mod ogg;
pub mod pipeline;
pub mod transcoder;

pub use ogg::{DemuxError, OggPage, OggReader};
pub use pipeline::{AudioPipeline, PipelineConfig, PlaybackHandle, PlaybackOutcome, StopSignal};
pub use transcoder::{TranscodedStream, TranscoderConfig, TranscoderError};

/// One encoded audio unit on its way to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
    /// Sample-clock position reported by the container (Ogg granule position).
    pub timestamp: u64,
}

/// Where a pipeline delivers frames, plus the lifecycle hooks a voice
/// connection uses to drive its speaking indicator.
///
/// Exactly one of `on_finished`, `on_stopped` or `on_failed` is invoked per
/// playback, always after `on_begin`.
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn on_begin(&self);
    fn on_finished(&self);
    fn on_stopped(&self);
    fn on_failed(&self, reason: &str);
    async fn send_frame(&self, frame: AudioFrame) -> Result<()>;
}
