//! Dictation input.
//!
//! Wraps a host speech-to-text engine into a listening flag plus finalized
//! text. Continuous engines end their session on their own every so often;
//! the adapter restarts them as long as the caller still wants to listen.
//! That intent flag, not the engine's own state, decides restarts.

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionConfig {
    pub locale: String,
    pub continuous: bool,
    pub interim_results: bool,
}

/// One segment of a recognition result batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub is_final: bool,
}

impl Segment {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechErrorKind {
    NoSpeech,
    Aborted,
    NotAllowed,
    ServiceNotAllowed,
    AudioCapture,
    Network,
    Other,
}

impl SpeechErrorKind {
    /// Transient errors leave the session running.
    pub fn is_transient(self) -> bool {
        matches!(self, SpeechErrorKind::NoSpeech)
    }
}

/// Callbacks delivered by the host engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    Started,
    Result(Vec<Segment>),
    Error(SpeechErrorKind),
    /// The engine ended its session (naturally or after `stop`).
    End,
}

/// Host dictation capability.
pub trait SpeechEngine: Send {
    fn start(&mut self, config: &RecognitionConfig) -> Result<()>;
    fn stop(&mut self);
}

/// What an engine event changed, for the coordinator to render.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpeechUpdate {
    /// Final segments, in order, to append to the pending input.
    pub finalized: Vec<String>,
    /// Current interim preview, if it changed.
    pub interim: Option<String>,
    /// New listening state, if it changed.
    pub listening: Option<bool>,
}

pub struct SpeechCapture {
    engine: Option<Box<dyn SpeechEngine>>,
    locale: String,
    listening: bool,
    should_listen: bool,
    interim: String,
}

impl SpeechCapture {
    pub fn new(engine: Option<Box<dyn SpeechEngine>>, locale: impl Into<String>) -> Self {
        Self {
            engine,
            locale: locale.into(),
            listening: false,
            should_listen: false,
            interim: String::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn interim(&self) -> &str {
        &self.interim
    }

    fn config(&self) -> RecognitionConfig {
        RecognitionConfig {
            locale: self.locale.clone(),
            continuous: true,
            interim_results: true,
        }
    }

    /// Begin continuous listening. Without an engine nothing changes and the
    /// caller falls back to typed input.
    pub fn start(&mut self) -> Result<()> {
        let config = self.config();
        let engine = self.engine.as_mut().ok_or(ChatError::SpeechUnavailable)?;
        self.should_listen = true;
        if let Err(e) = engine.start(&config) {
            self.should_listen = false;
            self.listening = false;
            return Err(e);
        }
        log::info!("[speech] listening ({})", config.locale);
        self.listening = true;
        Ok(())
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        let was_active = self.should_listen || self.listening;
        self.should_listen = false;
        self.listening = false;
        self.interim.clear();
        if was_active {
            if let Some(engine) = self.engine.as_mut() {
                engine.stop();
            }
            log::info!("[speech] stopped");
        }
    }

    pub fn handle_event(&mut self, event: SpeechEvent) -> SpeechUpdate {
        let mut update = SpeechUpdate::default();
        match event {
            SpeechEvent::Started => {
                if !self.listening {
                    self.listening = true;
                    update.listening = Some(true);
                }
            }
            SpeechEvent::Result(segments) => {
                // Late results after stop() are dropped.
                if !self.should_listen {
                    return update;
                }
                let mut interim = String::new();
                for segment in segments {
                    let text = segment.text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if segment.is_final {
                        update.finalized.push(text.to_string());
                    } else {
                        if !interim.is_empty() {
                            interim.push(' ');
                        }
                        interim.push_str(text);
                    }
                }
                if interim != self.interim {
                    self.interim = interim.clone();
                    update.interim = Some(interim);
                }
            }
            SpeechEvent::Error(kind) if kind.is_transient() => {
                log::debug!("[speech] transient error {:?}, still listening", kind);
            }
            SpeechEvent::Error(kind) => {
                log::warn!("[speech] fatal error {:?}, stopping", kind);
                self.should_listen = false;
                self.set_stopped(&mut update);
            }
            SpeechEvent::End => {
                if self.should_listen {
                    let config = self.config();
                    let restarted = match self.engine.as_mut() {
                        Some(engine) => engine.start(&config),
                        None => Err(ChatError::SpeechUnavailable),
                    };
                    match restarted {
                        Ok(()) => log::debug!("[speech] engine ended, restarted"),
                        Err(e) => {
                            log::warn!("[speech] restart failed: {}", e);
                            self.should_listen = false;
                            self.set_stopped(&mut update);
                        }
                    }
                } else {
                    self.set_stopped(&mut update);
                }
            }
        }
        update
    }

    fn set_stopped(&mut self, update: &mut SpeechUpdate) {
        if self.listening {
            self.listening = false;
            update.listening = Some(false);
        }
        if !self.interim.is_empty() {
            self.interim.clear();
            update.interim = Some(String::new());
        }
    }
}

/// Append a finalized segment to pending input, single-space separated.
pub fn append_dictated(input: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !input.is_empty() && !input.ends_with(' ') {
        input.push(' ');
    }
    input.push_str(text);
}
