use crate::viewport::PanelBounds;
use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Assistant,
}

/// One entry of the conversation log. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Unique within one widget lifetime only.
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Local>,
}

/// Events sent from the chat runtime to the front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageAppended(ChatMessage),
    TypingChanged(bool),
    StatusChanged { connected: bool, label: String },
    /// Pending input changed (dictation appended text or a send cleared it).
    InputChanged(String),
    /// Interim dictation preview; empty when nothing is pending.
    InterimTranscript(String),
    ListeningChanged(bool),
    LauncherVisible(bool),
    PanelResized(PanelBounds),
    ScrollToBottom,
    /// Blocking notice, e.g. dictation unsupported on this host.
    Alert(String),
    Opened,
    Closed,
}
