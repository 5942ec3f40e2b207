use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::message::{Category, ControlMessage, MessageKind, SystemPingResponse};
use crate::correlator::Correlator;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Unknown {category} action: {action}")]
    UnknownAction { category: Category, action: String },
    #[error("{0}")]
    Failed(String),
}

/// Handles every request and event for one category.
#[async_trait]
pub trait CategoryHandler: Send + Sync {
    async fn handle(&self, message: &ControlMessage) -> Result<Option<ControlMessage>, HandlerError>;
}

#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<Category, Arc<dyn CategoryHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: Category, handler: Arc<dyn CategoryHandler>) {
        self.handlers.insert(category, handler);
    }

    /// Route one inbound envelope. The returned message, if any, goes back to
    /// the same peer.
    pub async fn dispatch(
        &self,
        message: ControlMessage,
        pending: &Correlator<String, ControlMessage>,
    ) -> Option<ControlMessage> {
        // Keep-alive, answered before any lookup.
        if message.is_request() && message.is(&Category::System, "ping") {
            let pong = serde_json::to_value(SystemPingResponse::ok()).ok();
            return Some(ControlMessage::response_to(&message, pong, None));
        }

        if message.kind == MessageKind::Response {
            let id = message.id.clone();
            if let Err(stale) = pending.resolve(&id, message) {
                // Never answered, so error responses cannot bounce back and forth.
                debug!(
                    id = %stale.id,
                    category = %stale.category,
                    action = %stale.action,
                    "ignoring response with no pending request"
                );
            }
            return None;
        }

        let Some(handler) = self.handlers.get(&message.category) else {
            warn!(category = %message.category, action = %message.action, "no handler for category");
            if message.is_request() {
                let text = format!("Unknown category: {}", message.category);
                return Some(ControlMessage::response_to(&message, None, Some(text)));
            }
            return None;
        };

        match handler.handle(&message).await {
            Ok(response) => response,
            Err(err) => {
                error!(
                    category = %message.category,
                    action = %message.action,
                    error = %err,
                    "control handler failed"
                );
                message
                    .is_request()
                    .then(|| ControlMessage::response_to(&message, None, Some(err.to_string())))
            }
        }
    }
}
