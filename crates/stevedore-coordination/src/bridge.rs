//! Message delivery between tools.
//!
//! The coordinator never calls a tool directly. It hands a [`ToolMessage`] to
//! a [`CommunicationBridge`] and waits for the target to report completion
//! through [`ToolCoordinator::complete_coordination`](crate::ToolCoordinator::complete_coordination).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use stevedore_types::ToolMessage;
use tracing::debug;

use crate::error::{CoordinationError, Result};

/// Receives messages addressed to one tool.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ToolMessage) -> Result<()>;
}

/// Delivers messages between tools.
#[async_trait]
pub trait CommunicationBridge: Send + Sync {
    /// Deliver a message from `from` to `to`.
    async fn send(&self, from: &str, to: &str, message: ToolMessage) -> Result<()>;

    /// Route future messages for `tool_name` to a handler.
    fn register_handler(&self, tool_name: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Take the messages queued for a tool that has no handler.
    fn pending_messages(&self, tool_name: &str) -> Result<Vec<ToolMessage>>;
}

/// In-process bridge.
///
/// Messages for a tool with a registered handler are passed to it; all
/// others are queued until drained with
/// [`pending_messages`](CommunicationBridge::pending_messages).
#[derive(Default)]
pub struct InMemoryBridge {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    pending: RwLock<HashMap<String, Vec<ToolMessage>>>,
}

impl std::fmt::Debug for InMemoryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBridge")
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("pending", &self.pending.read().len())
            .finish()
    }
}

impl InMemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued messages for a tool.
    pub fn pending_count(&self, tool_name: &str) -> usize {
        self.pending.read().get(tool_name).map_or(0, Vec::len)
    }
}

#[async_trait]
impl CommunicationBridge for InMemoryBridge {
    async fn send(&self, from: &str, to: &str, message: ToolMessage) -> Result<()> {
        let handler = self.handlers.read().get(to).cloned();
        match handler {
            Some(handler) => {
                debug!(from, to, message_id = %message.id, "Delivering message to handler");
                handler
                    .handle(message)
                    .await
                    .map_err(|e| CoordinationError::Dispatch {
                        from: from.to_string(),
                        to: to.to_string(),
                        reason: e.to_string(),
                    })
            }
            None => {
                debug!(from, to, message_id = %message.id, "Queued message for tool");
                self.pending
                    .write()
                    .entry(to.to_string())
                    .or_default()
                    .push(message);
                Ok(())
            }
        }
    }

    fn register_handler(&self, tool_name: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.handlers.write().insert(tool_name.to_string(), handler);
        Ok(())
    }

    fn pending_messages(&self, tool_name: &str) -> Result<Vec<ToolMessage>> {
        Ok(self.pending.write().remove(tool_name).unwrap_or_default())
    }
}
