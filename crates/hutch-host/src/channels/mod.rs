//! Chat transport abstraction.
//!
//! The router and scheduler talk to group chats through [`ChatTransport`];
//! the Telegram adapter is the one concrete implementation.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

/// An inbound chat message as delivered by a transport, before storage.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub chat_id: String,
    pub sender: String,
    pub text: String,
    /// RFC 3339, transport-reported time.
    pub timestamp: String,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Show or clear a typing indicator. Best effort; callers ignore
    /// failures.
    async fn set_typing(&self, chat_id: &str, on: bool) -> Result<()>;
}
