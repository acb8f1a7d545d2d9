//! Stable per-user session token.
//!
//! The token only routes the socket (`/ws/<token>`) so the assistant can
//! correlate a user with their conversation across reconnects. It is not a
//! credential.

use crate::error::{ChatError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Durable client-side key/value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ChatError::Storage("memory store poisoned".into()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Flat JSON object on disk, rewritten on every `set`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// `storage.json` next to the settings file.
    pub fn open_default() -> std::result::Result<Self, String> {
        Ok(Self::new(crate::settings::data_dir()?.join("storage.json")))
    }

    fn read_all(&self) -> HashMap<String, String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().ok()?;
        self.read_all().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ChatError::Storage("file store poisoned".into()))?;
        let mut entries = self.read_all();
        entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Return the stored token, or create, persist and return a new one.
///
/// Without a store every call yields a fresh token; that only costs
/// conversation continuity.
pub fn get_or_create_token(store: Option<&dyn KeyValueStore>, key: &str) -> String {
    if let Some(store) = store {
        if let Some(existing) = store.get(key).filter(|t| !t.is_empty()) {
            return existing;
        }
    }
    let token = generate_token();
    if let Some(store) = store {
        if let Err(e) = store.set(key, &token) {
            log::warn!("[session] failed to persist token: {}", e);
        }
    }
    log::info!("[session] created token {}", token);
    token
}

/// `user_<epoch-ms>_<random-base36>`.
pub fn generate_token() -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("user_{}_{}", now_ms, suffix)
}
