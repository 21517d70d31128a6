//! Audit logging around command dispatch.
//!
//! Every request and every response produces one single-line entry. Entries
//! are built and recorded behind a panic guard: whatever goes wrong while
//! logging, the exchange itself is untouched.

use super::dispatch::{Dispatcher, Handler};
use crate::protocol::{CommandRequest, CommandResponse, FailureKind, Fields, INTERNAL_MARKER};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Target of audit events.
pub const AUDIT_TARGET: &str = "gatewayctl::audit";

/// Longest value logged verbatim, in characters.
pub const MAX_VALUE_CHARS: usize = 256;

/// Logged in place of values that are not UTF-8.
pub const CONVERSION_FAILED: &str = "<??? conversion failed ???>";

/// An audit sink could not record an entry.
#[derive(Debug, Error)]
#[error("audit logging failed: {0}")]
pub struct LoggingFailure(pub String);

/// One audit log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEntry {
    Request {
        command: String,
        ask: Option<String>,
        fields: String,
    },
    Success {
        command: String,
        ask: Option<String>,
        fields: String,
    },
    Failure {
        command: String,
        ask: Option<String>,
        kind: FailureKind,
        description: String,
    },
}

impl AuditEntry {
    pub fn command(&self) -> &str {
        match self {
            AuditEntry::Request { command, .. }
            | AuditEntry::Success { command, .. }
            | AuditEntry::Failure { command, .. } => command,
        }
    }

    pub fn ask(&self) -> Option<&str> {
        match self {
            AuditEntry::Request { ask, .. }
            | AuditEntry::Success { ask, .. }
            | AuditEntry::Failure { ask, .. } => ask.as_deref(),
        }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let command = format_text(self.command());
        let tag = self
            .ask()
            .map(|a| format!(" [{}]", format_text(a)))
            .unwrap_or_default();
        match self {
            AuditEntry::Request { fields, .. } => {
                write!(f, "request {}{}: {}", command, tag, fields)
            }
            AuditEntry::Success { fields, .. } => {
                write!(f, "response {}{}: {}", command, tag, fields)
            }
            AuditEntry::Failure { kind, description, .. } => write!(
                f,
                "failure {}{}: {}: {}",
                command,
                tag,
                kind,
                escape(description)
            ),
        }
    }
}

/// Destination of audit entries.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), LoggingFailure>;
}

/// Emits entries as `tracing` events at INFO on [`AUDIT_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), LoggingFailure> {
        info!(target: AUDIT_TARGET, command = %format_text(entry.command()), "{}", entry);
        Ok(())
    }
}

/// Render one value for the log: UTF-8 or a placeholder, at most
/// [`MAX_VALUE_CHARS`] characters plus `...`, escaped onto one line.
pub fn format_value(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) => format_text(text),
        Err(_) => CONVERSION_FAILED.to_string(),
    }
}

/// Render peer-supplied text for the log: at most [`MAX_VALUE_CHARS`]
/// characters plus `...`, escaped onto one line.
pub fn format_text(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(MAX_VALUE_CHARS).collect();
    let mut out = escape(&head);
    if chars.next().is_some() {
        out.push_str("...");
    }
    out
}

/// `key=value` pairs of the non-internal fields, in order, joined by `, `.
pub fn format_fields(fields: &Fields) -> String {
    fields
        .iter()
        .filter(|(key, _)| !key.starts_with(INTERNAL_MARKER))
        .map(|(key, value)| format!("{}={}", key, format_value(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:04x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// A [`Dispatcher`] that audits every exchange.
pub struct AuditedDispatcher {
    inner: Dispatcher,
    sink: Arc<dyn AuditSink>,
}

impl AuditedDispatcher {
    pub fn new(inner: Dispatcher, sink: Arc<dyn AuditSink>) -> Self {
        Self { inner, sink }
    }

    pub fn register_handler(&mut self, command: impl Into<String>, handler: impl Handler + 'static) {
        self.inner.register_handler(command, handler);
    }

    pub async fn dispatch(&self, request: CommandRequest) -> CommandResponse {
        let command = request.command.clone();
        let ask = request.ask.clone();

        self.record(|| AuditEntry::Request {
            command: command.clone(),
            ask: ask.clone(),
            fields: format_fields(&request.fields),
        });

        let response = self.inner.dispatch(request).await;

        self.record(|| match &response {
            CommandResponse::Success(fields) => AuditEntry::Success {
                command: command.clone(),
                ask: ask.clone(),
                fields: format_fields(fields),
            },
            CommandResponse::Failure(failure) => AuditEntry::Failure {
                command: command.clone(),
                ask: ask.clone(),
                kind: failure.kind,
                description: failure.description.clone(),
            },
        });

        response
    }

    fn record(&self, build: impl FnOnce() -> AuditEntry) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.sink.record(&build())));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}", e),
            Err(_) => debug!("audit logging panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::dispatch::{HandlerError, HandlerResult};
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<AuditEntry>>,
    }

    impl AuditSink for RecordingSink {
        fn record(&self, entry: &AuditEntry) -> Result<(), LoggingFailure> {
            self.entries.lock().push(entry.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn record(&self, _entry: &AuditEntry) -> Result<(), LoggingFailure> {
            Err(LoggingFailure("disk full".to_string()))
        }
    }

    struct PanickingSink;

    impl AuditSink for PanickingSink {
        fn record(&self, _entry: &AuditEntry) -> Result<(), LoggingFailure> {
            panic!("sink exploded")
        }
    }

    async fn echo(fields: Fields) -> HandlerResult {
        Ok(fields)
    }

    async fn refuse(_fields: Fields) -> HandlerResult {
        Err(HandlerError::new("no such lease\n"))
    }

    fn audited(sink: Arc<dyn AuditSink>) -> AuditedDispatcher {
        let mut dispatcher = AuditedDispatcher::new(Dispatcher::new(), sink);
        dispatcher.register_handler("echo", echo);
        dispatcher.register_handler("refuse", refuse);
        dispatcher
    }

    #[tokio::test]
    async fn test_echo_produces_two_entries() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = audited(sink.clone());

        let request =
            CommandRequest::new("echo", Fields::new().with("x", "hello")).with_ask("17");
        let response = dispatcher.dispatch(request).await;
        assert_eq!(response, CommandResponse::success(Fields::new().with("x", "hello")));

        let entries = sink.entries.lock();
        assert_eq!(
            *entries,
            vec![
                AuditEntry::Request {
                    command: "echo".to_string(),
                    ask: Some("17".to_string()),
                    fields: "x=hello".to_string(),
                },
                AuditEntry::Success {
                    command: "echo".to_string(),
                    ask: Some("17".to_string()),
                    fields: "x=hello".to_string(),
                },
            ]
        );
        assert_eq!(entries[0].to_string(), "request echo [17]: x=hello");
    }

    #[tokio::test]
    async fn test_failure_entry_carries_kind_and_description() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = audited(sink.clone());

        dispatcher
            .dispatch(CommandRequest::new("refuse", Fields::new()))
            .await;
        let entries = sink.entries.lock();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            &entries[1],
            AuditEntry::Failure { kind: FailureKind::Handler, description, .. }
                if description == "no such lease\n"
        ));
        assert_eq!(
            entries[1].to_string(),
            "failure refuse: HANDLER_ERROR: no such lease\\n"
        );
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_change_response() {
        for sink in [
            Arc::new(FailingSink) as Arc<dyn AuditSink>,
            Arc::new(PanickingSink) as Arc<dyn AuditSink>,
        ] {
            let dispatcher = audited(sink);
            let response = dispatcher
                .dispatch(CommandRequest::new("echo", Fields::new().with("x", "hello")))
                .await;
            assert_eq!(response, CommandResponse::success(Fields::new().with("x", "hello")));
        }
    }

    #[test]
    fn test_long_values_are_truncated() {
        let value = "a".repeat(300);
        let logged = format_value(value.as_bytes());
        assert_eq!(logged.len(), MAX_VALUE_CHARS + 3);
        assert!(logged.ends_with("..."));

        let exact = "b".repeat(MAX_VALUE_CHARS);
        assert_eq!(format_value(exact.as_bytes()), exact);
    }

    #[test]
    fn test_truncation_counts_characters() {
        let value = "é".repeat(300);
        let logged = format_value(value.as_bytes());
        assert_eq!(logged.chars().count(), MAX_VALUE_CHARS + 3);
    }

    #[test]
    fn test_undecodable_value_placeholder() {
        assert_eq!(format_value(&[0xff, 0xfe, 0x00]), CONVERSION_FAILED);
    }

    #[test]
    fn test_values_are_escaped_onto_one_line() {
        assert_eq!(format_value(b"a\nb\\c\x07"), "a\\nb\\\\c\\u{0007}");
    }

    #[test]
    fn test_command_and_tag_cannot_break_the_line() {
        let entry = AuditEntry::Request {
            command: "Fake\nINFO forged entry".to_string(),
            ask: Some("1\r\nx".to_string()),
            fields: String::new(),
        };
        let line = entry.to_string();
        assert!(!line.contains('\n') && !line.contains('\r'));
        assert_eq!(line, "request Fake\\nINFO forged entry [1\\r\\nx]: ");

        let long = AuditEntry::Success {
            command: "c".repeat(1000),
            ask: None,
            fields: String::new(),
        };
        assert!(long.to_string().contains(&format!("{}...", "c".repeat(MAX_VALUE_CHARS))));
    }

    #[tokio::test]
    async fn test_forged_command_is_escaped_in_recorded_entries() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = audited(sink.clone());
        dispatcher
            .dispatch(CommandRequest::new("echo\nresponse echo [2]: ok", Fields::new()))
            .await;
        for entry in sink.entries.lock().iter() {
            assert_eq!(entry.to_string().lines().count(), 1);
        }
    }

    #[test]
    fn test_internal_fields_excluded_in_order() {
        let fields = Fields::new()
            .with("zeta", "1")
            .with("_secret", "hunter2")
            .with("alpha", Bytes::from_static(&[0xc3]));
        assert_eq!(
            format_fields(&fields),
            format!("zeta=1, alpha={}", CONVERSION_FAILED)
        );
    }
}
