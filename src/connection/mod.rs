//! Connection manager for the assistant socket.
//!
//! The manager is a plain state machine: [`ConnectionManager::handle`] takes
//! one event and returns the commands to execute. It never touches the
//! network or a clock itself; [`session`] runs the actual channel and the
//! runtime owns timers.

pub mod session;

use crate::error::{ChatError, Result};
use crate::protocol;
use crate::settings::Settings;
use std::time::Duration;

pub type ChannelId = u64;
pub type TimerId = u64;

pub const RECONNECT_BASE_MS: u64 = 1000;
pub const RECONNECT_MAX_MS: u64 = 30_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const STEADY_RETRY_MS: u64 = 5000;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const REASON_CHAT_CLOSED: &str = "Chat closed";
pub const REASON_UNMOUNTING: &str = "Component unmounting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Two-phase backoff: an exponential ramp of `RECONNECT_MAX_ATTEMPTS`
/// retries, then a flat `STEADY_RETRY_MS` for as long as the UI stays open.
/// Only a successful open or an explicit close returns to the ramp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempts: u32,
    base_delay_ms: u64,
    steady: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            base_delay_ms: RECONNECT_BASE_MS,
            steady: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_steady(&self) -> bool {
        self.steady
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn next_delay(&mut self) -> Duration {
        if !self.steady && self.attempts < RECONNECT_MAX_ATTEMPTS {
            self.attempts += 1;
            let exp = (self.attempts - 1).min(16);
            let delay = self
                .base_delay_ms
                .saturating_mul(1u64 << exp)
                .min(RECONNECT_MAX_MS);
            return Duration::from_millis(delay);
        }
        self.steady = true;
        self.attempts = 0;
        Duration::from_millis(STEADY_RETRY_MS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    UiOpen { token: String },
    UiClose { reason: String },
    ChannelOpened { channel_id: ChannelId },
    ChannelMessage { channel_id: ChannelId, payload: String },
    ChannelError { channel_id: ChannelId, error: String },
    ChannelClosed { channel_id: ChannelId, code: u16, reason: String },
    ReconnectDue { timer_id: TimerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    OpenChannel { channel_id: ChannelId, url: String },
    SendFrame { channel_id: ChannelId, frame: String, text: String },
    CloseChannel { channel_id: ChannelId, code: u16, reason: String },
    ScheduleReconnect { timer_id: TimerId, delay: Duration },
    CancelReconnect { timer_id: TimerId },
    /// Decoded assistant text.
    Deliver(String),
    ClearTyping,
    StatusChanged { connected: bool },
}

pub struct ConnectionManager {
    settings: Settings,
    state: ConnectionState,
    policy: ReconnectPolicy,
    token: Option<String>,
    wants_open: bool,
    channel: Option<ChannelId>,
    pending_timer: Option<TimerId>,
    next_id: u64,
}

impl ConnectionManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            state: ConnectionState::Disconnected,
            policy: ReconnectPolicy::default(),
            token: None,
            wants_open: false,
            channel: None,
            pending_timer: None,
            next_id: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn live_channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn pending_timer(&self) -> Option<TimerId> {
        self.pending_timer
    }

    /// Encode and address a user message. Only valid while `Open`.
    pub fn send(&self, text: &str) -> Result<ConnectionCommand> {
        match (self.state, self.channel) {
            (ConnectionState::Open, Some(channel_id)) => Ok(ConnectionCommand::SendFrame {
                channel_id,
                frame: protocol::encode_user_message(text),
                text: text.to_string(),
            }),
            _ => Err(ChatError::NotConnected),
        }
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionCommand> {
        let mut out = Vec::new();
        match (self.state, event) {
            (_, ConnectionEvent::UiOpen { token }) => {
                self.wants_open = true;
                self.token = Some(token);
                if self.channel.is_some() {
                    log::debug!("[connection] open requested with a live channel, ignoring");
                    return out;
                }
                self.cancel_timer(&mut out);
                self.policy.reset();
                self.open_channel(&mut out);
            }
            (_, ConnectionEvent::UiClose { reason }) => {
                self.wants_open = false;
                self.cancel_timer(&mut out);
                self.policy.reset();
                if let Some(channel_id) = self.channel.take() {
                    log::info!("[connection] closing channel {}: {}", channel_id, reason);
                    out.push(ConnectionCommand::CloseChannel {
                        channel_id,
                        code: CLOSE_NORMAL,
                        reason,
                    });
                }
                self.set_state(ConnectionState::Disconnected, &mut out);
            }
            (ConnectionState::Connecting, ConnectionEvent::ChannelOpened { channel_id })
                if self.is_live(channel_id) =>
            {
                log::info!("[connection] channel {} open", channel_id);
                self.policy.reset();
                self.set_state(ConnectionState::Open, &mut out);
            }
            (ConnectionState::Open, ConnectionEvent::ChannelMessage { channel_id, payload })
                if self.is_live(channel_id) =>
            {
                match protocol::decode_inbound(&payload) {
                    Some(text) => {
                        out.push(ConnectionCommand::Deliver(text));
                        out.push(ConnectionCommand::ClearTyping);
                    }
                    None => log::debug!("[connection] ignoring frame: {}", payload),
                }
            }
            (
                ConnectionState::Open | ConnectionState::Connecting,
                ConnectionEvent::ChannelError { channel_id, error },
            ) if self.is_live(channel_id) => {
                log::warn!("[connection] channel {} error: {}", channel_id, error);
                self.set_state(ConnectionState::Closing, &mut out);
                out.push(ConnectionCommand::ClearTyping);
            }
            (
                _,
                ConnectionEvent::ChannelClosed {
                    channel_id,
                    code,
                    reason,
                },
            ) if self.is_live(channel_id) => {
                log::info!(
                    "[connection] channel {} closed: {} {}",
                    channel_id,
                    code,
                    reason
                );
                self.channel = None;
                self.set_state(ConnectionState::Disconnected, &mut out);
                out.push(ConnectionCommand::ClearTyping);
                if self.wants_open {
                    self.schedule_reconnect(&mut out);
                } else {
                    self.cancel_timer(&mut out);
                }
            }
            (ConnectionState::Disconnected, ConnectionEvent::ReconnectDue { timer_id })
                if self.pending_timer == Some(timer_id) =>
            {
                self.pending_timer = None;
                // Intent is checked when the timer fires, not when it was set.
                if self.wants_open && self.channel.is_none() {
                    self.open_channel(&mut out);
                }
            }
            (state, event) => {
                log::debug!("[connection] ignoring {:?} in {:?}", event, state);
            }
        }
        out
    }

    fn is_live(&self, channel_id: ChannelId) -> bool {
        self.channel == Some(channel_id)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn set_state(&mut self, next: ConnectionState, out: &mut Vec<ConnectionCommand>) {
        let was_open = self.is_open();
        self.state = next;
        if was_open != self.is_open() {
            out.push(ConnectionCommand::StatusChanged {
                connected: self.is_open(),
            });
        }
    }

    fn cancel_timer(&mut self, out: &mut Vec<ConnectionCommand>) {
        if let Some(timer_id) = self.pending_timer.take() {
            out.push(ConnectionCommand::CancelReconnect { timer_id });
        }
    }

    fn open_channel(&mut self, out: &mut Vec<ConnectionCommand>) {
        let Some(token) = self.token.clone() else {
            log::warn!("[connection] no session token, not connecting");
            return;
        };
        let channel_id = self.next_id();
        let url = self.settings.socket_url(&token);
        log::info!("[connection] opening channel {} to {}", channel_id, url);
        self.channel = Some(channel_id);
        out.push(ConnectionCommand::OpenChannel { channel_id, url });
        self.set_state(ConnectionState::Connecting, out);
    }

    fn schedule_reconnect(&mut self, out: &mut Vec<ConnectionCommand>) {
        self.cancel_timer(out);
        let delay = self.policy.next_delay();
        let timer_id = self.next_id();
        if self.policy.is_steady() {
            log::info!("[connection] retrying in {}ms", delay.as_millis());
        } else {
            log::info!(
                "[connection] reconnecting in {}ms (attempt {}/{})",
                delay.as_millis(),
                self.policy.attempts(),
                RECONNECT_MAX_ATTEMPTS
            );
        }
        self.pending_timer = Some(timer_id);
        out.push(ConnectionCommand::ScheduleReconnect { timer_id, delay });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Settings {
            assistant_host: "chat.test".into(),
            ..Settings::default()
        })
    }

    fn opened_channel(commands: &[ConnectionCommand]) -> Option<ChannelId> {
        commands.iter().find_map(|c| match c {
            ConnectionCommand::OpenChannel { channel_id, .. } => Some(*channel_id),
            _ => None,
        })
    }

    fn scheduled(commands: &[ConnectionCommand]) -> Option<(TimerId, Duration)> {
        commands.iter().find_map(|c| match c {
            ConnectionCommand::ScheduleReconnect { timer_id, delay } => Some((*timer_id, *delay)),
            _ => None,
        })
    }

    fn open(m: &mut ConnectionManager) -> ChannelId {
        let out = m.handle(ConnectionEvent::UiOpen {
            token: "user_1_abc".into(),
        });
        opened_channel(&out).expect("channel opened")
    }

    fn drop_channel(m: &mut ConnectionManager, channel_id: ChannelId) -> (TimerId, Duration) {
        let out = m.handle(ConnectionEvent::ChannelClosed {
            channel_id,
            code: CLOSE_ABNORMAL,
            reason: String::new(),
        });
        scheduled(&out).expect("reconnect scheduled")
    }

    fn fire(m: &mut ConnectionManager, timer_id: TimerId) -> ChannelId {
        let out = m.handle(ConnectionEvent::ReconnectDue { timer_id });
        opened_channel(&out).expect("reconnect opened a channel")
    }

    #[test]
    fn policy_ramps_then_stays_flat() {
        let mut policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..9)
            .map(|_| policy.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 5000, 5000, 5000, 5000]
        );
        assert_eq!(policy.attempts(), 0);
    }

    #[test]
    fn open_builds_socket_url_from_token() {
        let mut m = manager();
        let out = m.handle(ConnectionEvent::UiOpen {
            token: "user_1_abc".into(),
        });
        assert!(out.contains(&ConnectionCommand::OpenChannel {
            channel_id: 1,
            url: "wss://chat.test/ws/user_1_abc".into(),
        }));
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn backoff_sequence_through_manager() {
        let mut m = manager();
        let mut channel = open(&mut m);
        let mut delays = Vec::new();
        for _ in 0..8 {
            let (timer, delay) = drop_channel(&mut m, channel);
            delays.push(delay.as_millis() as u64);
            assert_eq!(m.state(), ConnectionState::Disconnected);
            channel = fire(&mut m, timer);
            assert_eq!(m.state(), ConnectionState::Connecting);
        }
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 5000, 5000, 5000]
        );
    }

    #[test]
    fn successful_open_resets_backoff() {
        let mut m = manager();
        let mut channel = open(&mut m);
        for _ in 0..3 {
            let (timer, _) = drop_channel(&mut m, channel);
            channel = fire(&mut m, timer);
        }
        let out = m.handle(ConnectionEvent::ChannelOpened { channel_id: channel });
        assert!(out.contains(&ConnectionCommand::StatusChanged { connected: true }));
        assert!(m.is_open());
        assert_eq!(m.policy().attempts(), 0);

        let (_, delay) = drop_channel(&mut m, channel);
        assert_eq!(delay, Duration::from_millis(1000));
        assert_eq!(m.policy().attempts(), 1);
    }

    #[test]
    fn steady_phase_also_resets_on_open() {
        let mut m = manager();
        let mut channel = open(&mut m);
        for _ in 0..6 {
            let (timer, _) = drop_channel(&mut m, channel);
            channel = fire(&mut m, timer);
        }
        assert!(m.policy().is_steady());
        m.handle(ConnectionEvent::ChannelOpened { channel_id: channel });
        let (_, delay) = drop_channel(&mut m, channel);
        assert_eq!(delay, Duration::from_millis(1000));
    }

    #[test]
    fn double_open_keeps_one_channel() {
        let mut m = manager();
        let first = open(&mut m);
        let out = m.handle(ConnectionEvent::UiOpen {
            token: "user_1_abc".into(),
        });
        assert!(out.is_empty());
        assert_eq!(m.live_channel(), Some(first));
    }

    #[test]
    fn open_while_waiting_cancels_timer_and_connects_now() {
        let mut m = manager();
        let channel = open(&mut m);
        let (timer, _) = drop_channel(&mut m, channel);
        let out = m.handle(ConnectionEvent::UiOpen {
            token: "user_1_abc".into(),
        });
        assert!(out.contains(&ConnectionCommand::CancelReconnect { timer_id: timer }));
        assert!(opened_channel(&out).is_some());
        assert_eq!(m.pending_timer(), None);
        // The cancelled timer firing late must not open a second channel.
        assert!(m.handle(ConnectionEvent::ReconnectDue { timer_id: timer }).is_empty());
    }

    #[test]
    fn close_with_pending_timer_tears_down() {
        let mut m = manager();
        let channel = open(&mut m);
        let (timer, _) = drop_channel(&mut m, channel);
        let out = m.handle(ConnectionEvent::UiClose {
            reason: REASON_CHAT_CLOSED.into(),
        });
        assert_eq!(out, vec![ConnectionCommand::CancelReconnect { timer_id: timer }]);
        assert!(m.handle(ConnectionEvent::ReconnectDue { timer_id: timer }).is_empty());
        assert_eq!(m.live_channel(), None);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn close_while_open_sends_normal_closure() {
        let mut m = manager();
        let channel = open(&mut m);
        m.handle(ConnectionEvent::ChannelOpened { channel_id: channel });
        let out = m.handle(ConnectionEvent::UiClose {
            reason: REASON_UNMOUNTING.into(),
        });
        assert!(out.contains(&ConnectionCommand::CloseChannel {
            channel_id: channel,
            code: CLOSE_NORMAL,
            reason: REASON_UNMOUNTING.into(),
        }));
        assert!(out.contains(&ConnectionCommand::StatusChanged { connected: false }));
        // The close echo from the old channel schedules nothing.
        let echo = m.handle(ConnectionEvent::ChannelClosed {
            channel_id: channel,
            code: CLOSE_NORMAL,
            reason: REASON_UNMOUNTING.into(),
        });
        assert!(scheduled(&echo).is_none());
    }

    #[test]
    fn error_marks_not_open_and_close_decides() {
        let mut m = manager();
        let channel = open(&mut m);
        m.handle(ConnectionEvent::ChannelOpened { channel_id: channel });
        let out = m.handle(ConnectionEvent::ChannelError {
            channel_id: channel,
            error: "reset by peer".into(),
        });
        assert_eq!(m.state(), ConnectionState::Closing);
        assert!(out.contains(&ConnectionCommand::ClearTyping));
        assert!(out.contains(&ConnectionCommand::StatusChanged { connected: false }));
        assert!(scheduled(&out).is_none());
        assert!(matches!(m.send("hi"), Err(ChatError::NotConnected)));
        drop_channel(&mut m, channel);
    }

    #[test]
    fn messages_decode_only_while_open() {
        let mut m = manager();
        let channel = open(&mut m);
        let early = m.handle(ConnectionEvent::ChannelMessage {
            channel_id: channel,
            payload: "too early".into(),
        });
        assert!(early.is_empty());

        m.handle(ConnectionEvent::ChannelOpened { channel_id: channel });
        let out = m.handle(ConnectionEvent::ChannelMessage {
            channel_id: channel,
            payload: r#"{"type":"message","data":{"content":"hi there"}}"#.into(),
        });
        assert_eq!(
            out,
            vec![
                ConnectionCommand::Deliver("hi there".into()),
                ConnectionCommand::ClearTyping,
            ]
        );
        let ping = m.handle(ConnectionEvent::ChannelMessage {
            channel_id: channel,
            payload: r#"{"type":"ping"}"#.into(),
        });
        assert!(ping.is_empty());
    }

    #[test]
    fn stale_channel_events_are_ignored() {
        let mut m = manager();
        let old = open(&mut m);
        m.handle(ConnectionEvent::UiClose {
            reason: REASON_CHAT_CLOSED.into(),
        });
        let new = open(&mut m);
        assert_ne!(old, new);
        let out = m.handle(ConnectionEvent::ChannelClosed {
            channel_id: old,
            code: CLOSE_NORMAL,
            reason: REASON_CHAT_CLOSED.into(),
        });
        assert!(out.is_empty());
        assert_eq!(m.live_channel(), Some(new));
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn send_requires_open() {
        let mut m = manager();
        assert!(matches!(m.send("hello"), Err(ChatError::NotConnected)));
        let channel = open(&mut m);
        assert!(m.send("hello").is_err());
        m.handle(ConnectionEvent::ChannelOpened { channel_id: channel });
        match m.send("hello").unwrap() {
            ConnectionCommand::SendFrame { channel_id, frame, text } => {
                assert_eq!(channel_id, channel);
                assert_eq!(frame, r#"{"type":"message","data":{"content":"hello"}}"#);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
