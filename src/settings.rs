use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const HOST_ENV_VAR: &str = "ASSISTANT_CHAT_HOST";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Host (and optional port) of the assistant service, without scheme.
    #[serde(default = "default_assistant_host")]
    pub assistant_host: String,
    /// `wss://` when true, `ws://` otherwise (local development only).
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Dictation locale. Empty means "use the host language".
    #[serde(default)]
    pub locale: String,
    #[serde(default = "default_fallback_reply_delay_ms")]
    pub fallback_reply_delay_ms: u64,
    /// Key under which the session token is kept in durable storage.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

impl Settings {
    /// Socket URL for a session token: `wss://<host>/ws/<token>`.
    pub fn socket_url(&self, token: &str) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!(
            "{}://{}/ws/{}",
            scheme,
            self.assistant_host.trim_end_matches('/'),
            token
        )
    }

    /// Locale to hand to the speech engine.
    pub fn resolved_locale(&self) -> String {
        if !self.locale.trim().is_empty() {
            return self.locale.clone();
        }
        host_locale()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            assistant_host: default_assistant_host(),
            use_tls: default_use_tls(),
            locale: String::new(),
            fallback_reply_delay_ms: default_fallback_reply_delay_ms(),
            storage_key: default_storage_key(),
        }
    }
}

fn default_assistant_host() -> String {
    "assistant.example.com".into()
}
fn default_use_tls() -> bool {
    true
}
fn default_fallback_reply_delay_ms() -> u64 {
    1000
}
fn default_storage_key() -> String {
    "chat_user_id".into()
}

/// Best-effort host language from `LANG`/`LC_ALL`, e.g. `en_US.UTF-8` -> `en-US`.
fn host_locale() -> String {
    let raw = std::env::var("LC_ALL")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var("LANG").ok())
        .unwrap_or_default();
    let tag = raw.split('.').next().unwrap_or("").replace('_', "-");
    if tag.is_empty() || tag == "C" || tag == "POSIX" {
        "en-US".into()
    } else {
        tag
    }
}

pub fn data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("AssistantChat"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".assistant-chat"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn settings_path() -> Result<PathBuf, String> {
    Ok(data_dir()?.join("settings.json"))
}

pub fn load() -> Settings {
    let mut settings = match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    };
    if let Ok(host) = std::env::var(HOST_ENV_VAR) {
        if !host.trim().is_empty() {
            settings.assistant_host = host.trim().to_string();
        }
    }
    settings
}

pub fn load_from(path: &PathBuf) -> Settings {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("[settings] ignoring unreadable {}: {}", path.display(), e);
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

/// Write default settings when no file exists yet. Returns whether it wrote.
pub fn create_if_missing(path: &PathBuf) -> Result<bool, String> {
    if path.exists() {
        return Ok(false);
    }
    save_to(path, &Settings::default())?;
    Ok(true)
}

pub fn save_to(path: &PathBuf, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}
