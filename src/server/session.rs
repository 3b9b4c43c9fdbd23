//! The per-client session task.
//!
//! Each accepted connection runs one task that alternates between decoding
//! inbound requests and draining the session's outbound queue. The queue is
//! the wake mechanism: any thread that enqueues a response (a handler, the
//! subscription fan-out, the log sink) wakes this task through the channel.
//! Per-session response order is the channel's FIFO order.
//!
//! State machine: reading -> dispatching -> writing -> reading, with any
//! state dropping to closing on EOF, socket error, decode error, or
//! shutdown. Deregistration runs on every exit path.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::codec::{encode_pdu, Decoder, PduFormat};
use crate::daemon_log::daemon_log;
use crate::protocol::make_response;

use super::{commands, ServerContext};

/// Per-session request context handed to command handlers.
pub struct Session {
    pub id: u64,
    /// Ephemeral query-only sessions resolve roots read-only and may not
    /// create new watches.
    pub client_mode: bool,
}

pub async fn run_session(
    ctx: Arc<ServerContext>,
    stream: UnixStream,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<Value>,
) {
    let session = Session { id, client_mode: false };
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = Decoder::new();
    let mut format: Option<PduFormat> = None;
    let mut buf = vec![0u8; 16 * 1024];

    let mut shutdown_rx = ctx.subscribe_shutdown();

    'session: loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break 'session,
                    Ok(n) => n,
                };
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next_pdu() {
                        Ok(Some((pdu_format, request))) => {
                            // The first decoded request fixes the encoding
                            // every reply on this session uses.
                            format.get_or_insert(pdu_format);
                            commands::dispatch_command(&ctx, &session, request).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            daemon_log("session", &format!("client {}: {}", id, e));
                            let mut resp = make_response();
                            resp["error"] = Value::String(e.to_string());
                            ctx.enqueue(id, resp);
                            flush_pending(&mut rx, &mut writer, format).await;
                            break 'session;
                        }
                    }
                }
            }
            queued = rx.recv() => match queued {
                Some(value) => {
                    let reply_format = format.unwrap_or(PduFormat::Json);
                    if write_pdu(&mut writer, reply_format, &value).await.is_err() {
                        break 'session;
                    }
                }
                None => break 'session,
            },
            _ = shutdown_rx.recv() => {
                // Let an already-enqueued reply (e.g. the shutdown-server
                // ack) reach the wire before the connection drops.
                flush_pending(&mut rx, &mut writer, format).await;
                break 'session;
            }
        }
    }

    ctx.remove_client(id);
    daemon_log("session", &format!("client {} disconnected", id));
}

async fn write_pdu(
    writer: &mut OwnedWriteHalf,
    format: PduFormat,
    value: &Value,
) -> std::io::Result<()> {
    writer.write_all(&encode_pdu(format, value)).await
}

/// Writes out whatever is already queued, without waiting for more.
async fn flush_pending(
    rx: &mut mpsc::UnboundedReceiver<Value>,
    writer: &mut OwnedWriteHalf,
    format: Option<PduFormat>,
) {
    while let Ok(value) = rx.try_recv() {
        if write_pdu(writer, format.unwrap_or(PduFormat::Json), &value)
            .await
            .is_err()
        {
            break;
        }
    }
}
