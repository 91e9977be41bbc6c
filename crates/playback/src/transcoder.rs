use std::process::Stdio;

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub executable: String,
    pub bitrate: String,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            executable: "ffmpeg".into(),
            bitrate: "48K".into(),
        }
    }
}

impl TranscoderConfig {
    pub fn args(&self, source_url: &str) -> Vec<String> {
        [
            "-loglevel",
            "error",
            "-i",
            source_url,
            "-vn",
            "-c:a",
            "libopus",
            "-b:a",
            self.bitrate.as_str(),
            "-ar",
            "48000",
            "-ac",
            "2",
            "-page_duration",
            "20000",
            "-f",
            "ogg",
            "pipe:1",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect()
    }
}

#[derive(Debug, Error)]
pub enum TranscoderError {
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        source: std::io::Error,
    },
    #[error("transcoder stdout was not captured")]
    MissingStdout,
}

/// Ogg/Opus byte stream, optionally backed by a child process that is killed
/// when the stream is dropped.
pub struct TranscodedStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
}

impl TranscodedStream {
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
        }
    }

    pub fn spawn(config: &TranscoderConfig, source_url: &str) -> Result<Self, TranscoderError> {
        let mut child = Command::new(&config.executable)
            .args(config.args(source_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscoderError::Spawn {
                executable: config.executable.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(TranscoderError::MissingStdout)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => warn!(line = %line, "playback: transcoder stderr"),
                        Ok(None) => break,
                        Err(err) => {
                            debug!(error = %err, "playback: transcoder stderr closed");
                            break;
                        }
                    }
                }
            });
        }
        debug!(executable = %config.executable, pid = ?child.id(), "playback: transcoder started");

        Ok(Self {
            reader: Box::new(stdout),
            child: Some(child),
        })
    }

    pub(crate) fn into_parts(self) -> (Box<dyn AsyncRead + Send + Unpin>, Option<Child>) {
        (self.reader, self.child)
    }
}
