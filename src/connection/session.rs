//! One live socket to the assistant.
//!
//! Each channel runs as its own task and reports back through an event
//! sender. Browser-style lifecycle: a failed connect or read error is
//! reported as an error followed by a close (1006), so the manager always
//! makes its reconnect decision on the close.

use super::{ChannelId, ConnectionEvent, CLOSE_ABNORMAL};
use crate::error::ChatError;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a channel task reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connection(ConnectionEvent),
    /// A frame could not be written; `text` is the original user text.
    SendFailed { channel_id: ChannelId, text: String },
}

#[derive(Debug)]
enum Outbound {
    Message { frame: String, text: String },
    Close { code: u16, reason: String },
}

pub struct ChannelHandle {
    channel_id: ChannelId,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Queue a frame. Returns false when the channel task is already gone.
    pub fn send(&self, frame: String, text: String) -> bool {
        self.outbound.send(Outbound::Message { frame, text }).is_ok()
    }

    /// Ask the task to send a close frame and exit.
    pub fn close(self, code: u16, reason: String) {
        if self.outbound.send(Outbound::Close { code, reason }).is_err() {
            self.task.abort();
        }
    }

    pub fn abort(self) {
        self.task.abort();
    }
}

fn emit<E: From<TransportEvent>>(tx: &mpsc::UnboundedSender<E>, event: ConnectionEvent) {
    let _ = tx.send(TransportEvent::Connection(event).into());
}

fn emit_dropped<E: From<TransportEvent>>(
    tx: &mpsc::UnboundedSender<E>,
    channel_id: ChannelId,
    error: ChatError,
) {
    emit(
        tx,
        ConnectionEvent::ChannelError {
            channel_id,
            error: error.to_string(),
        },
    );
    emit(
        tx,
        ConnectionEvent::ChannelClosed {
            channel_id,
            code: CLOSE_ABNORMAL,
            reason: String::new(),
        },
    );
}

pub fn spawn_channel<E>(
    channel_id: ChannelId,
    url: String,
    events: mpsc::UnboundedSender<E>,
) -> ChannelHandle
where
    E: From<TransportEvent> + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_channel(channel_id, url, outbound_rx, events));
    ChannelHandle {
        channel_id,
        outbound,
        task,
    }
}

async fn run_channel<E>(
    channel_id: ChannelId,
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<TransportEvent> + Send + 'static,
{
    log::info!("[session] channel {} connecting: url={}", channel_id, url);

    let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()));
    tokio::pin!(connect);
    let connected = loop {
        tokio::select! {
            result = &mut connect => break result,
            out = outbound_rx.recv() => match out {
                Some(Outbound::Message { text, .. }) => {
                    let _ = events.send(TransportEvent::SendFailed { channel_id, text }.into());
                }
                Some(Outbound::Close { .. }) | None => {
                    log::info!("[session] channel {} closed while connecting", channel_id);
                    return;
                }
            },
        }
    };

    let ws_stream = match connected {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            log::warn!("[session] channel {} connect failed: {}", channel_id, e);
            emit_dropped(&events, channel_id, ChatError::WebSocket(e.to_string()));
            return;
        }
        Err(_) => {
            log::warn!(
                "[session] channel {} connect timed out after {:?}",
                channel_id,
                CONNECT_TIMEOUT
            );
            emit_dropped(&events, channel_id, ChatError::WebSocket("connect timeout".into()));
            return;
        }
    };
    log::info!("[session] channel {} websocket connected", channel_id);
    emit(&events, ConnectionEvent::ChannelOpened { channel_id });

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(Outbound::Message { frame, text }) => {
                    if let Err(e) = ws_tx.send(tungstenite::Message::Text(frame.into())).await {
                        log::warn!("[session] channel {} send failed: {}", channel_id, e);
                        let _ = events.send(TransportEvent::SendFailed { channel_id, text }.into());
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    log::info!("[session] channel {} sending close {} {}", channel_id, code, reason);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(tungstenite::Message::Close(Some(frame))).await;
                    let _ = ws_tx.close().await;
                    return;
                }
                None => {
                    let _ = ws_tx.close().await;
                    return;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    emit(&events, ConnectionEvent::ChannelMessage {
                        channel_id,
                        payload: text.to_string(),
                    });
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (CLOSE_ABNORMAL, String::new()),
                    };
                    log::info!("[session] channel {} closed by server: {} {}", channel_id, code, reason);
                    // Flush the queued close reply so the handshake completes.
                    let _ = ws_tx.close().await;
                    emit(&events, ConnectionEvent::ChannelClosed { channel_id, code, reason });
                    return;
                }
                Some(Ok(tungstenite::Message::Binary(bytes))) => {
                    log::debug!("[session] channel {} ignoring {} binary bytes", channel_id, bytes.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("[session] channel {} websocket error: {}", channel_id, e);
                    emit_dropped(&events, channel_id, ChatError::WebSocket(e.to_string()));
                    return;
                }
                None => {
                    log::info!("[session] channel {} stream ended", channel_id);
                    emit(&events, ConnectionEvent::ChannelClosed {
                        channel_id,
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    });
                    return;
                }
            },
        }
    }
}
