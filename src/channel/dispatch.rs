//! Command routing.

use super::audit::format_text;
use crate::protocol::{CommandRequest, CommandResponse, FailureKind, Fields, ProtocolError};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Business failure reported by a handler. Sent back as `HANDLER_ERROR`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type HandlerResult = Result<Fields, HandlerError>;

/// Executes one command.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, fields: Fields) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Fields) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, fields: Fields) -> HandlerResult {
        (self)(fields).await
    }
}

/// Command name to handler table.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same command.
    pub fn register_handler(&mut self, command: impl Into<String>, handler: impl Handler + 'static) {
        let command = command.into();
        if self.is_registered(&command) {
            debug!("replacing handler for {}", command);
        }
        self.handlers.insert(command, Arc::new(handler));
    }

    pub fn is_registered(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Run a request through its handler.
    ///
    /// Unknown commands yield a `PROTOCOL_ERROR` response; handler errors and
    /// panics yield `HANDLER_ERROR`. The connection is never affected.
    pub async fn dispatch(&self, request: CommandRequest) -> CommandResponse {
        let Some(handler) = self.handlers.get(&request.command).cloned() else {
            warn!("no handler for {}", format_text(&request.command));
            return CommandResponse::failure(
                FailureKind::Protocol,
                ProtocolError::UnknownCommand(request.command).to_string(),
            );
        };

        let outcome = AssertUnwindSafe(handler.handle(request.fields))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(fields)) => CommandResponse::success(fields),
            Ok(Err(e)) => {
                warn!("{} failed: {}", request.command, format_text(e.message()));
                CommandResponse::failure(FailureKind::Handler, e.message())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{} handler panicked: {}", request.command, message);
                CommandResponse::failure(
                    FailureKind::Handler,
                    format!("handler panicked: {}", message),
                )
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
