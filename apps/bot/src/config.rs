use std::{fs, io::ErrorKind, path::Path, time::Duration};

use anyhow::{bail, Context};
use client_core::{gateway::DEFAULT_GATEWAY_URL, GatewayConfig};
use playback::TranscoderConfig;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
pub struct Settings {
    pub token: String,
    pub command_prefix: String,
    pub ffmpeg_path: String,
    pub ytdlp_path: String,
    pub voice_join_timeout_secs: Option<u64>,
    pub log_filter: String,
    pub gateway_url: String,
    pub api_base: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token: String::new(),
            command_prefix: ".".into(),
            ffmpeg_path: "ffmpeg".into(),
            ytdlp_path: "yt-dlp".into(),
            voice_join_timeout_secs: None,
            log_filter: "info".into(),
            gateway_url: DEFAULT_GATEWAY_URL.into(),
            api_base: DEFAULT_API_BASE.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    token: Option<String>,
    command_prefix: Option<String>,
    ffmpeg_path: Option<String>,
    ytdlp_path: Option<String>,
    voice_join_timeout_secs: Option<u64>,
    log_filter: Option<String>,
    gateway_url: Option<String>,
    api_base: Option<String>,
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.trim().is_empty() {
            bail!("no bot token configured: set DISCORD_TOKEN or `token` in the config file");
        }
        if self.command_prefix.is_empty() {
            bail!("command prefix must not be empty");
        }
        Ok(())
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            command_prefix: self.command_prefix.clone(),
            gateway_url: self.gateway_url.clone(),
            voice_join_timeout: self.voice_join_timeout_secs.map(Duration::from_secs),
            ..GatewayConfig::new(self.token.trim())
        }
    }

    pub fn transcoder_config(&self) -> TranscoderConfig {
        TranscoderConfig {
            executable: self.ffmpeg_path.clone(),
            ..TranscoderConfig::default()
        }
    }
}

/// Defaults, then the config file if it exists, then the environment.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

fn load_settings_with(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
            apply_file(&mut settings, file_cfg);
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()));
        }
    }

    if let Some(v) = env("DISCORD_TOKEN") {
        settings.token = v;
    }
    if let Some(v) = env("APP__TOKEN") {
        settings.token = v;
    }

    if let Some(v) = env("COMMAND_PREFIX") {
        settings.command_prefix = v;
    }

    if let Some(v) = env("FFMPEG_PATH") {
        settings.ffmpeg_path = v;
    }

    if let Some(v) = env("YTDLP_PATH") {
        settings.ytdlp_path = v;
    }

    if let Some(v) = env("VOICE_JOIN_TIMEOUT_SECS") {
        match v.parse::<u64>() {
            Ok(0) => settings.voice_join_timeout_secs = None,
            Ok(parsed) => settings.voice_join_timeout_secs = Some(parsed),
            Err(err) => warn!(value = %v, error = %err, "ignoring invalid VOICE_JOIN_TIMEOUT_SECS"),
        }
    }

    if let Some(v) = env("LOG_FILTER") {
        settings.log_filter = v;
    }

    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.token {
        settings.token = v;
    }
    if let Some(v) = file_cfg.command_prefix {
        settings.command_prefix = v;
    }
    if let Some(v) = file_cfg.ffmpeg_path {
        settings.ffmpeg_path = v;
    }
    if let Some(v) = file_cfg.ytdlp_path {
        settings.ytdlp_path = v;
    }
    if let Some(v) = file_cfg.voice_join_timeout_secs {
        settings.voice_join_timeout_secs = (v > 0).then_some(v);
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
    if let Some(v) = file_cfg.gateway_url {
        settings.gateway_url = v;
    }
    if let Some(v) = file_cfg.api_base {
        settings.api_base = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
