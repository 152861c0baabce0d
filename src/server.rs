//! TCP intake for relayed listener events.
//!
//! Each connection streams a JSON array of event objects. Values are
//! decoded incrementally as bytes arrive (tolerating the `[`, `,`, `]`
//! framing and whitespace between values) and forwarded in arrival order
//! into the processor's channel. Unknown event kinds are skipped with a
//! warning; malformed JSON drops the connection.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::ListenerEvent;
use crate::health::HealthMetrics;

const READ_CHUNK: usize = 64 * 1024;

/// Accepts relay connections until cancellation.
pub async fn serve(
    listen: &str,
    tx: mpsc::Sender<ListenerEvent>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding event intake on {listen}"))?;
    info!(addr = listen, "listening for listener event streams");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("accepting relay connection")?;
                info!(%peer, "relay connected");
                let tx = tx.clone();
                let cancel = cancel.clone();
                let health = health.clone();
                tokio::spawn(async move {
                    if let Some(h) = &health {
                        h.connections.inc();
                    }
                    handle_connection(socket, tx, cancel, health.clone()).await;
                    if let Some(h) = &health {
                        h.connections.dec();
                    }
                    info!(%peer, "relay disconnected");
                });
            }
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    tx: mpsc::Sender<ListenerEvent>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);

    loop {
        let mut chunk = [0u8; READ_CHUNK];
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = socket.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "relay read failed");
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        let values = match drain_values(&mut buf) {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "malformed event stream, dropping connection");
                return;
            }
        };

        for value in values {
            match serde_json::from_value::<ListenerEvent>(value) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!("processor stopped, closing relay connection");
                        return;
                    }
                }
                Err(e) => {
                    if let Some(h) = &health {
                        h.events_ignored.inc();
                    }
                    warn!(error = %e, "skipping undecodable event");
                }
            }
        }
    }
}

/// Pulls every complete JSON value out of the buffer, leaving any trailing
/// partial value (or nothing) behind for the next read.
fn drain_values(buf: &mut Vec<u8>) -> Result<Vec<Value>, serde_json::Error> {
    let mut values = Vec::new();
    let mut pos = 0;

    loop {
        while pos < buf.len() && matches!(buf[pos], b' ' | b'\t' | b'\r' | b'\n' | b'[' | b',' | b']') {
            pos += 1;
        }
        if pos >= buf.len() {
            break;
        }

        let mut stream = serde_json::Deserializer::from_slice(&buf[pos..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                pos += stream.byte_offset();
                values.push(value);
            }
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    buf.drain(..pos);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_drain_values_with_array_framing() {
        let mut buf = br#"[{"a":1},{"b":2}"#.to_vec();
        let values = drain_values(&mut buf).expect("drains");
        assert_eq!(values, vec![json!({"a":1}), json!({"b":2})]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_values_keeps_partial_tail() {
        let mut buf = br#"{"a":1}{"b":"#.to_vec();
        let values = drain_values(&mut buf).expect("drains");
        assert_eq!(values, vec![json!({"a":1})]);
        assert_eq!(buf, br#"{"b":"#.to_vec());

        buf.extend_from_slice(br#"2}]"#);
        let values = drain_values(&mut buf).expect("drains rest");
        assert_eq!(values, vec![json!({"b":2})]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_values_rejects_garbage() {
        let mut buf = b"not json".to_vec();
        assert!(drain_values(&mut buf).is_err());
    }

    #[test]
    fn test_drain_values_split_mid_chunk() {
        let whole = br#"[{"Event":"SparkListenerLogStart","appId":"a"},{"x":1}]"#;
        for split in 1..whole.len() {
            let mut buf = whole[..split].to_vec();
            let mut values = drain_values(&mut buf).expect("first half drains");
            buf.extend_from_slice(&whole[split..]);
            values.extend(drain_values(&mut buf).expect("second half drains"));
            assert_eq!(values.len(), 2, "split at {split}");
        }
    }
}
