use super::*;

use std::{
    collections::HashMap,
    env, fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_config(contents: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("rtc_voice_bot_config_{suffix}.toml"));
    fs::write(&path, contents).expect("write config");
    path
}

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn missing_file_keeps_defaults() {
    let settings =
        load_settings_with(Path::new("/nonexistent/bot.toml"), no_env).expect("settings");

    assert_eq!(settings.command_prefix, ".");
    assert_eq!(settings.ffmpeg_path, "ffmpeg");
    assert_eq!(settings.gateway_url, DEFAULT_GATEWAY_URL);
    assert_eq!(settings.voice_join_timeout_secs, None);
    assert!(settings.validate().is_err(), "missing token must be rejected");
}

#[test]
fn environment_overrides_file() {
    let path = temp_config(
        r#"
token = "from-file"
command_prefix = "!"
ytdlp_path = "/opt/yt-dlp"
voice_join_timeout_secs = 15
"#,
    );
    let vars: HashMap<&str, &str> = [
        ("DISCORD_TOKEN", "from-env"),
        ("APP__TOKEN", "from-app-env"),
        ("FFMPEG_PATH", "/usr/local/bin/ffmpeg"),
    ]
    .into_iter()
    .collect();

    let settings = load_settings_with(&path, |key| vars.get(key).map(|v| v.to_string()))
        .expect("settings");
    fs::remove_file(&path).expect("cleanup");

    assert_eq!(settings.token, "from-app-env");
    assert_eq!(settings.command_prefix, "!");
    assert_eq!(settings.ytdlp_path, "/opt/yt-dlp");
    assert_eq!(settings.ffmpeg_path, "/usr/local/bin/ffmpeg");
    assert_eq!(settings.voice_join_timeout_secs, Some(15));
    settings.validate().expect("valid");

    let gateway = settings.gateway_config();
    assert_eq!(gateway.token, "from-app-env");
    assert_eq!(gateway.command_prefix, "!");
    assert_eq!(gateway.voice_join_timeout, Some(Duration::from_secs(15)));
    assert_eq!(settings.transcoder_config().executable, "/usr/local/bin/ffmpeg");
}

#[test]
fn invalid_timeout_from_env_is_ignored() {
    let settings = load_settings_with(Path::new("/nonexistent/bot.toml"), |key| {
        (key == "VOICE_JOIN_TIMEOUT_SECS").then(|| "soon".to_owned())
    })
    .expect("settings");
    assert_eq!(settings.voice_join_timeout_secs, None);
}

#[test]
fn malformed_file_is_an_error() {
    let path = temp_config("token = [1, 2");
    let result = load_settings_with(&path, no_env);
    fs::remove_file(&path).expect("cleanup");
    assert!(result.is_err());
}

#[test]
fn unknown_keys_are_rejected() {
    let path = temp_config("tokn = \"typo\"");
    let result = load_settings_with(&path, no_env);
    fs::remove_file(&path).expect("cleanup");
    assert!(result.is_err());
}
