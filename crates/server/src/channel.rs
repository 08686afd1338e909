//! Persistent observer channel
//!
//! Accepts raw TCP connections, performs the upgrade handshake and then
//! speaks the frame protocol from `frame.rs`. Each connection gets a bounded
//! outbound queue drained by its own writer task; broadcasts reach it through
//! the dispatcher's registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use colony_protocol::ClientMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::DispatcherHandle;
use crate::frame::{encode_close, encode_pong, FrameDecoder, FrameError, Inbound};
use crate::handshake::{self, BAD_REQUEST_RESPONSE};
use crate::registry::ConnectionId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 8 * 1024;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Close status sent when a frame exceeds the size limit
const CLOSE_TOO_BIG: u16 = 1009;
/// Close status sent for any other protocol violation
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub max_frame_bytes: usize,
    pub outbound_buffer: usize,
}

/// Accept channel connections until the listener fails permanently.
pub async fn serve(listener: TcpListener, dispatcher: DispatcherHandle, settings: ChannelSettings) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                let dispatcher = dispatcher.clone();
                let settings = settings.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, conn_id, dispatcher, settings).await;
                });
            }
            Err(e) => {
                warn!(
                    component = "channel",
                    event = "channel.accept.failed",
                    error = %e,
                    "Failed to accept channel connection"
                );
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnectionId,
    dispatcher: DispatcherHandle,
    settings: ChannelSettings,
) {
    let (request, leftover) = match handshake::read_request(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                component = "channel",
                event = "channel.handshake.refused",
                connection_id = conn_id,
                peer = %peer,
                error = %e,
                "Upgrade refused"
            );
            if e.should_respond() {
                let _ = stream.write_all(BAD_REQUEST_RESPONSE).await;
            }
            let _ = stream.shutdown().await;
            return;
        }
    };

    let response = handshake::switching_protocols_response(&request.accept_key());
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(
            component = "channel",
            event = "channel.handshake.write_failed",
            connection_id = conn_id,
            error = %e,
            "Peer left during handshake"
        );
        return;
    }
    info!(
        component = "channel",
        event = "channel.connection.opened",
        connection_id = conn_id,
        peer = %peer,
        path = %request.path,
        user_agent = request.header("user-agent").unwrap_or("-"),
        "Channel connection opened"
    );

    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(settings.outbound_buffer);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(
                    component = "channel",
                    event = "channel.send.disconnected",
                    connection_id = conn_id,
                    error = %e,
                    "Channel write failed, peer disconnected"
                );
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    let writer_abort = writer_task.abort_handle();

    if dispatcher.connect(conn_id, outbound_tx.clone()).await.is_err() {
        warn!(
            component = "channel",
            event = "channel.connect.dispatcher_closed",
            connection_id = conn_id,
            "Dispatcher stopped, dropping connection"
        );
        writer_abort.abort();
        return;
    }

    let reason = read_loop(&mut reader, &leftover, conn_id, &dispatcher, &outbound_tx, &settings).await;

    // Both senders must go for the writer to drain and exit
    dispatcher.disconnect(conn_id).await;
    drop(outbound_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await.is_err() {
        writer_abort.abort();
    }

    info!(
        component = "channel",
        event = "channel.connection.closed",
        connection_id = conn_id,
        reason,
        "Channel connection closed"
    );
}

/// Feed socket reads through the decoder until the connection ends.
/// Returns why it ended.
async fn read_loop(
    reader: &mut OwnedReadHalf,
    leftover: &[u8],
    conn_id: ConnectionId,
    dispatcher: &DispatcherHandle,
    outbound: &mpsc::Sender<Bytes>,
    settings: &ChannelSettings,
) -> &'static str {
    let mut decoder = FrameDecoder::new(settings.max_frame_bytes);
    decoder.extend(leftover);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        loop {
            match decoder.next_message() {
                Ok(Some(Inbound::Text(text))) => {
                    handle_text(&text, conn_id, dispatcher).await;
                }
                Ok(Some(Inbound::Ping(payload))) => {
                    queue_control(outbound, encode_pong(&payload), conn_id, "pong");
                }
                Ok(Some(Inbound::Close(payload))) => {
                    queue_control(outbound, encode_close(&payload), conn_id, "close");
                    return "close_frame";
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        component = "channel",
                        event = "channel.protocol.violation",
                        connection_id = conn_id,
                        buffered_bytes = decoder.buffered(),
                        error = %e,
                        "Closing channel after protocol error"
                    );
                    let code = match e {
                        FrameError::TooLarge { .. } => CLOSE_TOO_BIG,
                        _ => CLOSE_PROTOCOL_ERROR,
                    };
                    queue_control(outbound, encode_close(&code.to_be_bytes()), conn_id, "close");
                    return "protocol_error";
                }
            }
        }

        match reader.read(&mut chunk).await {
            Ok(0) => return "eof",
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e) => {
                debug!(
                    component = "channel",
                    event = "channel.read.failed",
                    connection_id = conn_id,
                    error = %e,
                    "Channel read failed"
                );
                return "io_error";
            }
        }
    }
}

async fn handle_text(text: &str, conn_id: ConnectionId, dispatcher: &DispatcherHandle) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(
                component = "channel",
                event = "channel.message.parse_failed",
                connection_id = conn_id,
                error = %e,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, 240),
                "Failed to parse channel message"
            );
            return;
        }
    };

    match msg {
        ClientMessage::Command(request) => {
            if let Err(e) = dispatcher.enqueue(request).await {
                warn!(
                    component = "channel",
                    event = "channel.command.rejected",
                    connection_id = conn_id,
                    error = %e,
                    "Could not queue command"
                );
            }
        }
        ClientMessage::Unknown => {
            debug!(
                component = "channel",
                event = "channel.message.ignored",
                connection_id = conn_id,
                "Ignoring channel message with unhandled type"
            );
        }
    }
}

/// Queue a pong or close reply without waiting on the writer. A peer that
/// stops reading fills its queue and loses the reply rather than stalling
/// its own read loop.
fn queue_control(outbound: &mpsc::Sender<Bytes>, frame: Bytes, conn_id: ConnectionId, kind: &'static str) {
    if let Err(e) = outbound.try_send(frame) {
        debug!(
            component = "channel",
            event = "channel.control.dropped",
            connection_id = conn_id,
            kind,
            error = %e,
            "Dropped control reply"
        );
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
