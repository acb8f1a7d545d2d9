//! Conversation log and chat panel lifecycle.
//!
//! `ChatWidget` is the single owner of the message log, the typing indicator
//! and the pending input. Every operation returns the side effects to run;
//! the widget itself never spawns anything.

use crate::connection::{
    ConnectionCommand, ConnectionEvent, ConnectionManager, ConnectionState, TimerId,
    REASON_CHAT_CLOSED, REASON_UNMOUNTING,
};
use crate::error::ChatError;
use crate::fallback;
use crate::session_id::{self, KeyValueStore};
use crate::settings::Settings;
use crate::speech::{self, SpeechCapture, SpeechEngine, SpeechEvent};
use crate::state::{ChatEvent, ChatMessage, Sender};
use crate::viewport::{HostLayout, ViewportTracker, FRAME_INTERVAL};
use chrono::Local;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const STATUS_ONLINE: &str = "Online";
pub const STATUS_CONNECTING: &str = "Please Wait We Connect";
pub const SPEECH_UNSUPPORTED: &str =
    "Speech recognition is not supported on this device. Please type your message instead.";

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Channel and reconnect-timer work for the transport.
    Transport(ConnectionCommand),
    ScheduleFallback { timer_id: TimerId, delay: Duration },
    CancelFallback { timer_id: TimerId },
    /// Call `flush_layout` after this delay.
    ScheduleLayoutFlush(Duration),
    Emit(ChatEvent),
}

pub struct ChatWidget {
    settings: Settings,
    store: Option<Arc<dyn KeyValueStore>>,
    connection: ConnectionManager,
    speech: SpeechCapture,
    viewport: ViewportTracker,
    messages: Vec<ChatMessage>,
    input: String,
    typing: bool,
    open: bool,
    next_message_id: u64,
    next_timer_id: TimerId,
    /// Synthetic replies waiting on their latency timer, oldest first.
    pending_fallbacks: Vec<(TimerId, &'static str)>,
}

impl ChatWidget {
    pub fn new(
        settings: Settings,
        store: Option<Arc<dyn KeyValueStore>>,
        speech_engine: Option<Box<dyn SpeechEngine>>,
    ) -> Self {
        let speech = SpeechCapture::new(speech_engine, settings.resolved_locale());
        Self {
            connection: ConnectionManager::new(settings.clone()),
            settings,
            store,
            speech,
            viewport: ViewportTracker::new(),
            messages: Vec::new(),
            input: String::new(),
            typing: false,
            open: false,
            next_message_id: 0,
            next_timer_id: 0,
            pending_fallbacks: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_listening(&self) -> bool {
        self.speech.is_listening()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn status_label(&self) -> &'static str {
        if self.connection.is_open() {
            STATUS_ONLINE
        } else {
            STATUS_CONNECTING
        }
    }

    /// The floating launcher is hidden on mobile while the panel is open.
    pub fn launcher_visible(&self) -> bool {
        !(self.open && self.viewport.snapshot().is_mobile)
    }

    pub fn open(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let token = session_id::get_or_create_token(self.store.as_deref(), &self.settings.storage_key);
        let was_open = self.open;
        self.open = true;
        if !was_open {
            effects.push(Effect::Emit(ChatEvent::Opened));
            effects.push(Effect::Emit(ChatEvent::LauncherVisible(self.launcher_visible())));
            effects.push(Effect::Emit(ChatEvent::PanelResized(
                self.viewport.snapshot().panel_bounds(),
            )));
            effects.push(self.status_event());
        }
        let commands = self.connection.handle(ConnectionEvent::UiOpen { token });
        self.absorb(commands, &mut effects);
        effects
    }

    pub fn close(&mut self) -> Vec<Effect> {
        self.shut_down(REASON_CHAT_CLOSED)
    }

    /// Component destroyed: same cancellation as `close`, then the log goes.
    pub fn teardown(&mut self) -> Vec<Effect> {
        let effects = self.shut_down(REASON_UNMOUNTING);
        self.messages.clear();
        self.input.clear();
        effects
    }

    /// Cancels the reconnect timer, fallback timers, dictation and the
    /// channel, in that order.
    fn shut_down(&mut self, reason: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        let commands = self.connection.handle(ConnectionEvent::UiClose {
            reason: reason.to_string(),
        });
        let (timer_cancels, rest): (Vec<_>, Vec<_>) = commands
            .into_iter()
            .partition(|c| matches!(c, ConnectionCommand::CancelReconnect { .. }));
        effects.extend(timer_cancels.into_iter().map(Effect::Transport));

        for (timer_id, _) in self.pending_fallbacks.drain(..) {
            effects.push(Effect::CancelFallback { timer_id });
        }

        let was_listening = self.speech.is_listening();
        self.speech.stop();
        if was_listening {
            effects.push(Effect::Emit(ChatEvent::ListeningChanged(false)));
            effects.push(Effect::Emit(ChatEvent::InterimTranscript(String::new())));
        }

        self.absorb(rest, &mut effects);
        self.set_typing(false, &mut effects);

        if self.open {
            self.open = false;
            effects.push(Effect::Emit(ChatEvent::LauncherVisible(true)));
            effects.push(Effect::Emit(ChatEvent::Closed));
        }
        effects
    }

    pub fn set_input(&mut self, text: &str) -> Vec<Effect> {
        self.input = text.to_string();
        Vec::new()
    }

    /// Append the user message right away, then send or fall back.
    pub fn send(&mut self, text: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        let text = text.trim();
        if text.is_empty() {
            return effects;
        }
        self.push_message(text.to_string(), Sender::User, &mut effects);
        if !self.input.is_empty() {
            self.input.clear();
            effects.push(Effect::Emit(ChatEvent::InputChanged(String::new())));
        }
        self.set_typing(true, &mut effects);

        match self.connection.send(text) {
            Ok(command) => effects.push(Effect::Transport(command)),
            Err(ChatError::NotConnected) => {
                log::info!("[chat] not connected, using local reply");
                self.schedule_fallback(text, &mut effects);
            }
            Err(e) => {
                log::warn!("[chat] send failed: {}", e);
                self.schedule_fallback(text, &mut effects);
            }
        }
        effects
    }

    /// The transport could not write a frame.
    pub fn send_failed(&mut self, text: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        log::warn!("[chat] frame not delivered, using local reply");
        self.schedule_fallback(text, &mut effects);
        effects
    }

    pub fn fallback_due(&mut self, timer_id: TimerId) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(index) = self.pending_fallbacks.iter().position(|(id, _)| *id == timer_id) else {
            return effects;
        };
        let (_, reply) = self.pending_fallbacks.remove(index);
        self.push_message(reply.to_string(), Sender::Assistant, &mut effects);
        if self.pending_fallbacks.is_empty() {
            self.set_typing(false, &mut effects);
        }
        effects.push(Effect::Emit(ChatEvent::ScrollToBottom));
        effects
    }

    pub fn handle_connection(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        let commands = self.connection.handle(event);
        self.absorb(commands, &mut effects);
        effects
    }

    pub fn toggle_dictation(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.speech.is_listening() {
            self.speech.stop();
            effects.push(Effect::Emit(ChatEvent::ListeningChanged(false)));
            effects.push(Effect::Emit(ChatEvent::InterimTranscript(String::new())));
            return effects;
        }
        match self.speech.start() {
            Ok(()) => effects.push(Effect::Emit(ChatEvent::ListeningChanged(true))),
            Err(ChatError::SpeechUnavailable) => {
                effects.push(Effect::Emit(ChatEvent::Alert(SPEECH_UNSUPPORTED.into())));
            }
            Err(e) => {
                log::warn!("[chat] dictation failed to start: {}", e);
                effects.push(Effect::Emit(ChatEvent::ListeningChanged(false)));
            }
        }
        effects
    }

    pub fn handle_speech(&mut self, event: SpeechEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        let update = self.speech.handle_event(event);
        if !update.finalized.is_empty() {
            for text in &update.finalized {
                speech::append_dictated(&mut self.input, text);
            }
            effects.push(Effect::Emit(ChatEvent::InputChanged(self.input.clone())));
        }
        if let Some(interim) = update.interim {
            effects.push(Effect::Emit(ChatEvent::InterimTranscript(interim)));
        }
        if let Some(listening) = update.listening {
            effects.push(Effect::Emit(ChatEvent::ListeningChanged(listening)));
        }
        effects
    }

    pub fn on_layout(&mut self, layout: HostLayout, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let launcher_before = self.launcher_visible();
        if let Some(snapshot) = self.viewport.on_layout(layout, now) {
            effects.push(Effect::Emit(ChatEvent::PanelResized(snapshot.panel_bounds())));
        }
        if self.viewport.has_pending() {
            effects.push(Effect::ScheduleLayoutFlush(FRAME_INTERVAL));
        }
        self.launcher_changed(launcher_before, &mut effects);
        effects
    }

    pub fn flush_layout(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let launcher_before = self.launcher_visible();
        if let Some(snapshot) = self.viewport.flush(now) {
            effects.push(Effect::Emit(ChatEvent::PanelResized(snapshot.panel_bounds())));
        }
        if self.viewport.has_pending() {
            effects.push(Effect::ScheduleLayoutFlush(FRAME_INTERVAL));
        }
        self.launcher_changed(launcher_before, &mut effects);
        effects
    }

    fn launcher_changed(&self, before: bool, effects: &mut Vec<Effect>) {
        let now = self.launcher_visible();
        if now != before {
            effects.push(Effect::Emit(ChatEvent::LauncherVisible(now)));
        }
    }

    fn absorb(&mut self, commands: Vec<ConnectionCommand>, effects: &mut Vec<Effect>) {
        for command in commands {
            match command {
                ConnectionCommand::Deliver(text) => {
                    self.push_message(text, Sender::Assistant, effects);
                    effects.push(Effect::Emit(ChatEvent::ScrollToBottom));
                }
                // A pending local reply clears typing itself when it lands.
                ConnectionCommand::ClearTyping if !self.pending_fallbacks.is_empty() => {}
                ConnectionCommand::ClearTyping => self.set_typing(false, effects),
                ConnectionCommand::StatusChanged { .. } => effects.push(self.status_event()),
                other => effects.push(Effect::Transport(other)),
            }
        }
    }

    fn status_event(&self) -> Effect {
        Effect::Emit(ChatEvent::StatusChanged {
            connected: self.connection.is_open(),
            label: self.status_label().to_string(),
        })
    }

    fn schedule_fallback(&mut self, text: &str, effects: &mut Vec<Effect>) {
        self.next_timer_id += 1;
        let timer_id = self.next_timer_id;
        self.pending_fallbacks.push((timer_id, fallback::canned_reply(text)));
        effects.push(Effect::ScheduleFallback {
            timer_id,
            delay: Duration::from_millis(self.settings.fallback_reply_delay_ms),
        });
    }

    fn push_message(&mut self, text: String, sender: Sender, effects: &mut Vec<Effect>) {
        self.next_message_id += 1;
        let message = ChatMessage {
            id: format!("msg-{}", self.next_message_id),
            text,
            sender,
            timestamp: Local::now(),
        };
        self.messages.push(message.clone());
        effects.push(Effect::Emit(ChatEvent::MessageAppended(message)));
    }

    fn set_typing(&mut self, typing: bool, effects: &mut Vec<Effect>) {
        if self.typing != typing {
            self.typing = typing;
            effects.push(Effect::Emit(ChatEvent::TypingChanged(typing)));
        }
    }
}
