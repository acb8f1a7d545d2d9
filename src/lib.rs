//! Embedded live-chat client: a persistent socket to a remote assistant,
//! canned replies while offline, dictation and panel sizing.

pub mod connection;
pub mod conversation;
pub mod error;
pub mod fallback;
pub mod protocol;
pub mod runtime;
pub mod session_id;
pub mod settings;
pub mod speech;
pub mod state;
pub mod viewport;
