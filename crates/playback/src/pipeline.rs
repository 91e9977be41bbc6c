use std::{sync::Arc, time::Duration};

use tokio::{
    io::AsyncRead,
    process::Child,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    ogg::OggReader,
    transcoder::{TranscodedStream, TranscoderConfig, TranscoderError},
    AudioFrame, AudioSink,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Wire cadence; one frame is handed to the sink per tick.
    pub frame_interval: Duration,
    /// Frames buffered between demuxer and pacer. A full queue blocks the demuxer.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(20),
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Stopped,
    Failed(String),
}

enum QueueItem {
    Frame(AudioFrame),
    End,
    Failed(String),
}

/// Cloneable stop trigger for a running playback.
#[derive(Clone)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct AudioPipeline {
    sink: Arc<dyn AudioSink>,
    config: PipelineConfig,
}

impl AudioPipeline {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self::with_config(sink, PipelineConfig::default())
    }

    pub fn with_config(sink: Arc<dyn AudioSink>, config: PipelineConfig) -> Self {
        Self { sink, config }
    }

    /// Spawns the transcoder for `source_url` and starts playing its output.
    pub fn play(
        self,
        transcoder: &TranscoderConfig,
        source_url: &str,
    ) -> Result<PlaybackHandle, TranscoderError> {
        let input = TranscodedStream::spawn(transcoder, source_url)?;
        Ok(self.start(input))
    }

    /// Consumes the pipeline; a finished or stopped playback cannot be restarted.
    pub fn start(self, input: TranscodedStream) -> PlaybackHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = StopSignal(Arc::new(stop_tx));
        let (frame_tx, frame_rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (reader, child) = input.into_parts();

        info!(
            interval_ms = self.config.frame_interval.as_millis() as u64,
            "playback: starting"
        );
        let demux = tokio::spawn(demux_worker(
            OggReader::new(reader),
            child,
            frame_tx,
            stop_rx.clone(),
        ));
        let pace = tokio::spawn(pace_worker(
            self.sink,
            frame_rx,
            stop_rx,
            stop.clone(),
            self.config.frame_interval,
        ));

        PlaybackHandle { stop, demux, pace }
    }
}

/// Running playback. Dropping the handle does not stop it.
pub struct PlaybackHandle {
    stop: StopSignal,
    demux: JoinHandle<()>,
    pace: JoinHandle<PlaybackOutcome>,
}

impl PlaybackHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.pace.is_finished() && self.demux.is_finished()
    }

    /// Waits for both workers to exit.
    pub async fn wait(self) -> PlaybackOutcome {
        let outcome = match self.pace.await {
            Ok(outcome) => outcome,
            Err(err) => PlaybackOutcome::Failed(format!("pace worker aborted: {err}")),
        };
        self.stop.stop();
        if let Err(err) = self.demux.await {
            warn!(error = %err, "playback: demux worker aborted");
        }
        outcome
    }
}

/// Resolves once stop is signalled. Never resolves if the signal is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let signalled = stop.wait_for(|stopped| *stopped).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

async fn demux_worker(
    mut reader: OggReader<Box<dyn AsyncRead + Send + Unpin>>,
    child: Option<Child>,
    frames: mpsc::Sender<QueueItem>,
    mut stop: watch::Receiver<bool>,
) {
    let mut audio_started = false;
    let mut in_header = false;
    let mut pages = 0u64;

    let terminal = loop {
        let next = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break None,
            next = reader.next_page() => next,
        };

        match next {
            Ok(Some(page)) => {
                if !audio_started {
                    // A large comment header spills onto continued pages.
                    if page.is_stream_header() || (in_header && page.is_continuation()) {
                        in_header = true;
                        debug!(sequence = page.sequence, "playback: skipping stream header page");
                        continue;
                    }
                }
                audio_started = true;
                pages += 1;
                let frame = AudioFrame {
                    payload: page.payload,
                    timestamp: page.granule_position,
                };
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break None,
                    sent = frames.send(QueueItem::Frame(frame)) => {
                        if sent.is_err() {
                            break None;
                        }
                    }
                }
            }
            Ok(None) => break Some(QueueItem::End),
            Err(err) => {
                warn!(error = %err, pages, "playback: demux failed");
                break Some(QueueItem::Failed(format!("demux failed: {err}")));
            }
        }
    };

    if let Some(item) = terminal {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => {}
            _ = frames.send(item) => {}
        }
    }
    debug!(pages, "playback: demux worker exiting");
    drop(child);
}

async fn pace_worker(
    sink: Arc<dyn AudioSink>,
    mut frames: mpsc::Receiver<QueueItem>,
    mut stop: watch::Receiver<bool>,
    stop_signal: StopSignal,
    interval: Duration,
) -> PlaybackOutcome {
    sink.on_begin();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut delivered = 0u64;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break PlaybackOutcome::Stopped,
            _ = ticker.tick() => {}
        }

        let item = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break PlaybackOutcome::Stopped,
            item = frames.recv() => item,
        };

        match item {
            Some(QueueItem::Frame(frame)) => {
                if *stop.borrow() {
                    break PlaybackOutcome::Stopped;
                }
                if let Err(err) = sink.send_frame(frame).await {
                    break PlaybackOutcome::Failed(format!("{err:#}"));
                }
                delivered += 1;
            }
            Some(QueueItem::End) => break PlaybackOutcome::Finished,
            Some(QueueItem::Failed(reason)) => break PlaybackOutcome::Failed(reason),
            None => break PlaybackOutcome::Failed("frame queue closed without end of stream".into()),
        }
    };

    match &outcome {
        PlaybackOutcome::Finished => sink.on_finished(),
        PlaybackOutcome::Stopped => sink.on_stopped(),
        PlaybackOutcome::Failed(reason) => {
            warn!(reason = %reason, delivered, "playback: failed");
            sink.on_failed(reason);
        }
    }
    info!(outcome = ?outcome, delivered, "playback: finished");
    stop_signal.stop();
    outcome
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
