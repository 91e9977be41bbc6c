use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

/// Turns a user supplied reference (page URL, search term) into a direct
/// media URL the transcoder can read.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> anyhow::Result<String>;
}

pub struct YtDlpResolver {
    executable: String,
}

impl YtDlpResolver {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl SourceResolver for YtDlpResolver {
    async fn resolve(&self, reference: &str) -> anyhow::Result<String> {
        debug!(executable = %self.executable, reference, "resolving stream url");
        let output = Command::new(&self.executable)
            .arg("-g")
            .arg(reference)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.executable))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.executable,
                output.status,
                stderr.trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        select_stream_url(&stdout).with_context(|| format!("could not resolve {reference}"))
    }
}

/// Picks the audio-only candidate from `yt-dlp -g` output, falling back to
/// the first URL.
pub fn select_stream_url(output: &str) -> Option<String> {
    let candidates: Vec<Url> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| Url::parse(line).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .collect();

    let first = candidates.first()?;
    if candidates.len() == 1 {
        return Some(first.to_string());
    }
    let audio = candidates.iter().find(|candidate| {
        candidate
            .query_pairs()
            .any(|(key, value)| key == "mime" && value.starts_with("audio"))
    });
    match audio {
        Some(candidate) => Some(candidate.to_string()),
        None => {
            warn!(
                candidates = candidates.len(),
                "no audio candidate in resolver output, using the first url"
            );
            Some(first.to_string())
        }
    }
}

#[cfg(test)]
#[path = "tests/resolver_tests.rs"]
mod tests;
