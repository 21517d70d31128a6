//! One client connection.

use super::audit::AuditedDispatcher;
use crate::protocol::{ask_tag, framing, CommandRequest, CommandResponse, FailureKind, ProtocolError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Serve requests on `stream` one at a time until the peer closes it or it
/// stays idle for `idle_timeout`.
///
/// A request without a usable command gets a `PROTOCOL_ERROR` response and
/// the connection stays open. A malformed frame is returned as an error and
/// ends the connection.
pub async fn serve_connection<S>(
    mut stream: S,
    dispatcher: &AuditedDispatcher,
    idle_timeout: Duration,
    peer: &str,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let fields = match tokio::time::timeout(idle_timeout, framing::read_box(&mut stream)).await {
            Err(_) => {
                debug!("{} idle for {:?}, closing", peer, idle_timeout);
                return Ok(());
            }
            Ok(Ok(None)) => {
                debug!("{} closed the connection", peer);
                return Ok(());
            }
            Ok(Ok(Some(fields))) => fields,
            Ok(Err(e)) => return Err(e),
        };

        let ask = ask_tag(&fields);
        let response = match CommandRequest::from_box(fields) {
            Ok(request) => dispatcher.dispatch(request).await,
            Err(e) => {
                warn!("{}: {}", peer, e);
                CommandResponse::failure(FailureKind::Protocol, e.to_string())
            }
        };

        framing::write_box(&mut stream, &response.into_box(ask.as_deref())).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::audit::TracingSink;
    use crate::channel::dispatch::{Dispatcher, HandlerResult};
    use crate::protocol::{Fields, ANSWER, ASK, COMMAND, ERROR, ERROR_CODE};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn echo(fields: Fields) -> HandlerResult {
        Ok(fields)
    }

    fn dispatcher() -> Arc<AuditedDispatcher> {
        let mut dispatcher = AuditedDispatcher::new(Dispatcher::new(), Arc::new(TracingSink));
        dispatcher.register_handler("echo", echo);
        Arc::new(dispatcher)
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_usable() {
        let (mut client, server) = duplex(64 * 1024);
        let dispatcher = dispatcher();
        let task = tokio::spawn(async move {
            serve_connection(server, &dispatcher, Duration::from_secs(30), "test").await
        });

        let unknown = Fields::new().with(COMMAND, "Reboot").with(ASK, "1");
        framing::write_box(&mut client, &unknown).await.unwrap();
        let reply = framing::read_box(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.get_str(ERROR), Some("1"));
        assert_eq!(reply.get_str(ERROR_CODE), Some("PROTOCOL_ERROR"));

        let echo = Fields::new().with(COMMAND, "echo").with(ASK, "2").with("x", "hello");
        framing::write_box(&mut client, &echo).await.unwrap();
        let reply = framing::read_box(&mut client).await.unwrap().unwrap();
        let (tag, response) = CommandResponse::from_box(reply).unwrap();
        assert_eq!(tag.as_deref(), Some("2"));
        assert_eq!(response, CommandResponse::success(Fields::new().with("x", "hello")));

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_command_is_protocol_error() {
        let (mut client, server) = duplex(64 * 1024);
        let dispatcher = dispatcher();
        let task = tokio::spawn(async move {
            serve_connection(server, &dispatcher, Duration::from_secs(30), "test").await
        });

        framing::write_box(&mut client, &Fields::new().with("x", "1").with(ASK, "9"))
            .await
            .unwrap();
        let reply = framing::read_box(&mut client).await.unwrap().unwrap();
        let (tag, response) = CommandResponse::from_box(reply).unwrap();
        assert_eq!(tag.as_deref(), Some("9"));
        assert!(!response.is_success());

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_non_utf8_tag_is_echoed() {
        let (mut client, server) = duplex(64 * 1024);
        let dispatcher = dispatcher();
        let task = tokio::spawn(async move {
            serve_connection(server, &dispatcher, Duration::from_secs(30), "test").await
        });

        let request = Fields::new()
            .with(COMMAND, "echo")
            .with(ASK, Bytes::from_static(&[0xff, b'7']));
        framing::write_box(&mut client, &request).await.unwrap();
        let reply = framing::read_box(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.get_str(ANSWER), Some("\u{fffd}7"));

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (mut client, server) = duplex(64 * 1024);
        let dispatcher = dispatcher();
        let task = tokio::spawn(async move {
            serve_connection(server, &dispatcher, Duration::from_secs(30), "test").await
        });

        // frame of 3 bytes: a key length with no key behind it
        client.write_all(&[0, 0, 0, 3, 0, 9, b'a']).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
        assert!(framing::read_box(&mut client).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_closed() {
        let (_client, server) = duplex(1024);
        let dispatcher = dispatcher();
        let result = serve_connection(server, &dispatcher, Duration::from_secs(300), "idle").await;
        assert!(result.is_ok());
    }
}
