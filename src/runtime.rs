//! Event loop driving a [`ChatWidget`].
//!
//! Channel events, timer firings, user input, dictation callbacks and layout
//! signals all arrive on one queue and are applied one at a time, so the
//! widget never sees two events at once. The runtime owns the channel task
//! and every timer task; cancelling aborts the task and forgets its id.

use crate::connection::session::{self, ChannelHandle, TransportEvent};
use crate::connection::{ConnectionCommand, ConnectionEvent, TimerId};
use crate::conversation::{ChatWidget, Effect};
use crate::speech::SpeechEvent;
use crate::state::ChatEvent;
use crate::viewport::HostLayout;
use std::collections::VecDeque;
use std::sync::mpsc::Sender as EventSender;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum UiCommand {
    Open,
    Close,
    Send(String),
    SetInput(String),
    ToggleDictation,
    Speech(SpeechEvent),
    Layout(HostLayout),
    /// Component teardown; the loop exits afterwards.
    Shutdown,
}

#[derive(Debug)]
pub enum RuntimeEvent {
    Transport(TransportEvent),
    ReconnectDue(TimerId),
    FallbackDue(TimerId),
    LayoutFlushDue,
    Ui(UiCommand),
}

impl From<TransportEvent> for RuntimeEvent {
    fn from(event: TransportEvent) -> Self {
        RuntimeEvent::Transport(event)
    }
}

/// Cloneable input side of a running chat. Also handed to speech engines so
/// they can post their callbacks.
#[derive(Debug, Clone)]
pub struct ChatHandle {
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl ChatHandle {
    fn command(&self, command: UiCommand) {
        let _ = self.tx.send(RuntimeEvent::Ui(command));
    }

    pub fn open(&self) {
        self.command(UiCommand::Open);
    }

    pub fn close(&self) {
        self.command(UiCommand::Close);
    }

    pub fn send(&self, text: impl Into<String>) {
        self.command(UiCommand::Send(text.into()));
    }

    pub fn set_input(&self, text: impl Into<String>) {
        self.command(UiCommand::SetInput(text.into()));
    }

    pub fn toggle_dictation(&self) {
        self.command(UiCommand::ToggleDictation);
    }

    pub fn speech_event(&self, event: SpeechEvent) {
        self.command(UiCommand::Speech(event));
    }

    pub fn layout(&self, layout: HostLayout) {
        self.command(UiCommand::Layout(layout));
    }

    pub fn shutdown(&self) {
        self.command(UiCommand::Shutdown);
    }
}

struct Timer {
    id: TimerId,
    task: JoinHandle<()>,
}

pub struct ChatRuntime {
    widget: ChatWidget,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    events_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    ui_tx: EventSender<ChatEvent>,
    channel: Option<ChannelHandle>,
    reconnect_timer: Option<Timer>,
    fallback_timers: Vec<Timer>,
    layout_flush: Option<JoinHandle<()>>,
}

impl ChatRuntime {
    pub fn new(widget: ChatWidget, ui_tx: EventSender<ChatEvent>) -> (Self, ChatHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ChatHandle {
            tx: events_tx.clone(),
        };
        let runtime = Self {
            widget,
            events_tx,
            events_rx,
            ui_tx,
            channel: None,
            reconnect_timer: None,
            fallback_timers: Vec::new(),
            layout_flush: None,
        };
        (runtime, handle)
    }

    /// Create and spawn on the current tokio runtime.
    pub fn spawn(widget: ChatWidget, ui_tx: EventSender<ChatEvent>) -> (ChatHandle, JoinHandle<()>) {
        let (runtime, handle) = Self::new(widget, ui_tx);
        let task = tokio::spawn(runtime.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            let shutdown = matches!(event, RuntimeEvent::Ui(UiCommand::Shutdown));
            let effects = self.dispatch(event);
            self.apply(effects);
            if shutdown {
                log::info!("[runtime] shut down");
                break;
            }
        }
        self.abort_all();
    }

    fn dispatch(&mut self, event: RuntimeEvent) -> Vec<Effect> {
        match event {
            RuntimeEvent::Transport(TransportEvent::Connection(event)) => {
                self.widget.handle_connection(event)
            }
            RuntimeEvent::Transport(TransportEvent::SendFailed { channel_id, text }) => {
                log::warn!("[runtime] channel {} dropped a frame", channel_id);
                self.widget.send_failed(&text)
            }
            RuntimeEvent::ReconnectDue(timer_id) => {
                if self.reconnect_timer.as_ref().map(|t| t.id) == Some(timer_id) {
                    self.reconnect_timer = None;
                }
                self.widget
                    .handle_connection(ConnectionEvent::ReconnectDue { timer_id })
            }
            RuntimeEvent::FallbackDue(timer_id) => {
                self.fallback_timers.retain(|t| t.id != timer_id);
                self.widget.fallback_due(timer_id)
            }
            RuntimeEvent::LayoutFlushDue => {
                self.layout_flush = None;
                self.widget.flush_layout(Instant::now())
            }
            RuntimeEvent::Ui(command) => match command {
                UiCommand::Open => self.widget.open(),
                UiCommand::Close => self.widget.close(),
                UiCommand::Send(text) => self.widget.send(&text),
                UiCommand::SetInput(text) => self.widget.set_input(&text),
                UiCommand::ToggleDictation => self.widget.toggle_dictation(),
                UiCommand::Speech(event) => self.widget.handle_speech(event),
                UiCommand::Layout(layout) => self.widget.on_layout(layout, Instant::now()),
                UiCommand::Shutdown => self.widget.teardown(),
            },
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Transport(command) => {
                    let follow_up = self.run_command(command);
                    queue.extend(follow_up);
                }
                Effect::ScheduleFallback { timer_id, delay } => {
                    let task = self.schedule(delay, RuntimeEvent::FallbackDue(timer_id));
                    self.fallback_timers.push(Timer { id: timer_id, task });
                }
                Effect::CancelFallback { timer_id } => {
                    self.fallback_timers.retain(|t| {
                        if t.id == timer_id {
                            t.task.abort();
                            false
                        } else {
                            true
                        }
                    });
                }
                Effect::ScheduleLayoutFlush(delay) => {
                    if self.layout_flush.is_none() {
                        self.layout_flush = Some(self.schedule(delay, RuntimeEvent::LayoutFlushDue));
                    }
                }
                Effect::Emit(event) => {
                    let _ = self.ui_tx.send(event);
                }
            }
        }
    }

    /// Execute one transport command; may hand back effects to run next.
    fn run_command(&mut self, command: ConnectionCommand) -> Vec<Effect> {
        match command {
            ConnectionCommand::OpenChannel { channel_id, url } => {
                if let Some(previous) = self.channel.take() {
                    log::warn!(
                        "[runtime] replacing channel {} with {}",
                        previous.channel_id(),
                        channel_id
                    );
                    previous.abort();
                }
                self.channel = Some(session::spawn_channel(
                    channel_id,
                    url,
                    self.events_tx.clone(),
                ));
                Vec::new()
            }
            ConnectionCommand::SendFrame {
                channel_id,
                frame,
                text,
            } => {
                let sent = match &self.channel {
                    Some(handle) if handle.channel_id() == channel_id => handle.send(frame, text.clone()),
                    _ => false,
                };
                if sent {
                    Vec::new()
                } else {
                    self.widget.send_failed(&text)
                }
            }
            ConnectionCommand::CloseChannel {
                channel_id,
                code,
                reason,
            } => {
                match self.channel.take() {
                    Some(handle) if handle.channel_id() == channel_id => handle.close(code, reason),
                    other => self.channel = other,
                }
                Vec::new()
            }
            ConnectionCommand::ScheduleReconnect { timer_id, delay } => {
                if let Some(previous) = self.reconnect_timer.take() {
                    previous.task.abort();
                }
                let task = self.schedule(delay, RuntimeEvent::ReconnectDue(timer_id));
                self.reconnect_timer = Some(Timer { id: timer_id, task });
                Vec::new()
            }
            ConnectionCommand::CancelReconnect { timer_id } => {
                if self.reconnect_timer.as_ref().map(|t| t.id) == Some(timer_id) {
                    if let Some(timer) = self.reconnect_timer.take() {
                        timer.task.abort();
                    }
                }
                Vec::new()
            }
            // The widget consumes these before they reach the runtime.
            ConnectionCommand::Deliver(_)
            | ConnectionCommand::ClearTyping
            | ConnectionCommand::StatusChanged { .. } => Vec::new(),
        }
    }

    fn schedule(&self, delay: Duration, event: RuntimeEvent) -> JoinHandle<()> {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        })
    }

    fn abort_all(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.task.abort();
        }
        for timer in self.fallback_timers.drain(..) {
            timer.task.abort();
        }
        if let Some(task) = self.layout_flush.take() {
            task.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback;
    use crate::session_id::MemoryStore;
    use crate::settings::Settings;
    use crate::state::Sender;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::mpsc::Receiver;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn widget_for(host: String) -> ChatWidget {
        let settings = Settings {
            assistant_host: host,
            use_tls: false,
            locale: "en-US".into(),
            ..Settings::default()
        };
        ChatWidget::new(settings, Some(Arc::new(MemoryStore::new())), None)
    }

    /// Blocks the test thread; the runtime runs on the worker threads.
    fn wait_for<F>(rx: &Receiver<ChatEvent>, within: Duration, mut pred: F) -> Vec<ChatEvent>
    where
        F: FnMut(&ChatEvent) -> bool,
    {
        let deadline = std::time::Instant::now() + within;
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            match rx.recv_timeout(left) {
                Ok(event) => {
                    let hit = pred(&event);
                    seen.push(event);
                    if hit {
                        return seen;
                    }
                }
                Err(_) => panic!("timed out; saw {:?}", seen),
            }
        }
    }

    fn is_assistant_message(event: &ChatEvent) -> bool {
        matches!(event, ChatEvent::MessageAppended(m) if m.sender == Sender::Assistant)
    }

    /// Server that answers every user message with a typed envelope.
    async fn assistant_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let value: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let content = value["data"]["content"].as_str().unwrap_or("").to_string();
                        let reply = serde_json::json!({
                            "type": "message",
                            "data": { "content": format!("echo: {}", content) },
                        });
                        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr.to_string()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_reply_is_appended() {
        let host = assistant_server().await;
        let (ui_tx, ui_rx) = std::sync::mpsc::channel();
        let (handle, task) = ChatRuntime::spawn(widget_for(host), ui_tx);

        handle.open();
        wait_for(&ui_rx, Duration::from_secs(5), |e| {
            matches!(e, ChatEvent::StatusChanged { connected: true, .. })
        });
        handle.send("hello");
        let seen = wait_for(&ui_rx, Duration::from_secs(5), is_assistant_message);
        match seen.last() {
            Some(ChatEvent::MessageAppended(m)) => assert_eq!(m.text, "echo: hello"),
            other => panic!("unexpected {:?}", other),
        }

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offline_send_gets_fallback_within_two_seconds() {
        // Nobody listens on this port.
        let host = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (ui_tx, ui_rx) = std::sync::mpsc::channel();
        let (handle, task) = ChatRuntime::spawn(widget_for(host), ui_tx);

        handle.open();
        handle.send("what is your price");
        let seen = wait_for(&ui_rx, Duration::from_secs(2), is_assistant_message);
        let replies: Vec<&ChatEvent> = seen.iter().filter(|e| is_assistant_message(e)).collect();
        assert_eq!(replies.len(), 1);
        match replies[0] {
            ChatEvent::MessageAppended(m) => assert_eq!(m.text, fallback::PRICING_REPLY),
            _ => unreachable!(),
        }

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn close_during_backoff_stops_all_attempts() {
        let (ui_tx, _ui_rx) = std::sync::mpsc::channel();
        let (mut runtime, _handle) = ChatRuntime::new(widget_for("127.0.0.1:9".into()), ui_tx);

        let effects = runtime.widget.open();
        runtime.apply(effects);
        let channel = runtime.channel.as_ref().map(|c| c.channel_id()).unwrap();
        // Drop the real channel task; feed the close by hand.
        runtime.channel.take().unwrap().abort();
        let effects = runtime.widget.handle_connection(ConnectionEvent::ChannelClosed {
            channel_id: channel,
            code: 1006,
            reason: String::new(),
        });
        runtime.apply(effects);
        assert!(runtime.reconnect_timer.is_some());

        let effects = runtime.widget.close();
        runtime.apply(effects);
        assert!(runtime.reconnect_timer.is_none());
        assert!(runtime.channel.is_none());

        // Past the first backoff step.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(runtime.events_rx.try_recv().is_err());
        assert!(runtime.channel.is_none());
    }
}
