//! Per-connection session handler
//!
//! Each accepted connection runs two tasks:
//! - the read loop (this task): reads up to `buff_size` bytes at a time,
//!   splits lines, decodes frames and hands them to the dispatcher in
//!   arrival order
//! - the write task: drains the session's outbound queue to the socket and
//!   writes a final `BYE` once the session is closed
//!
//! Closing goes through `Connection::close`, which wakes both tasks. That is
//! how `KICK`, `BAN` and `KILL` interrupt a read blocked on an idle peer, or
//! a write blocked on a peer that stopped reading.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{take_lines, Codec};
use crate::dispatcher::{Dispatcher, Flow};
use crate::error::ProtocolError;
use crate::message::ServerMessage;
use crate::session::{Connection, ConnectionEndpoints};
use crate::types::ClientId;

/// How long a closing session may take to flush its queue and `BYE`
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// State of one session visible to the dispatcher
#[derive(Debug)]
pub struct SessionContext {
    pub id: ClientId,
    pub addr: SocketAddr,
    pub connection: Connection,
    /// Current codec; the write task watches it so replies follow overrides
    pub codec: watch::Sender<Codec>,
}

impl SessionContext {
    pub fn new(
        id: ClientId,
        addr: SocketAddr,
        connection: Connection,
        codec: Codec,
    ) -> (Self, watch::Receiver<Codec>) {
        let (codec, codec_rx) = watch::channel(codec);
        let ctx = Self {
            id,
            addr,
            connection,
            codec,
        };
        (ctx, codec_rx)
    }
}

/// Run a registered session until it disconnects or is closed
///
/// On return the session is unregistered and its socket is closed.
pub async fn handle_connection(
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    id: ClientId,
    addr: SocketAddr,
    connection: Connection,
    endpoints: ConnectionEndpoints,
) {
    let (mut reader, writer) = stream.into_split();
    let (ctx, codec_rx) = SessionContext::new(id, addr, connection, dispatcher.config().codec());
    let ConnectionEndpoints { outbound, closed } = endpoints;
    let mut read_closed = closed.clone();

    // Spawn write task (ServerMessage -> socket)
    let write_task = tokio::spawn(write_loop(writer, outbound, closed, codec_rx, id));

    info!("Client {} connected from {}", id, addr);
    let _ = ctx
        .connection
        .send(ServerMessage::Welcome { client_id: id })
        .await;

    let reason = read_loop(&dispatcher, &ctx, &mut reader, &mut read_closed).await;

    dispatcher.registry().unregister(id);
    ctx.connection.close(reason);

    if let Err(e) = write_task.await {
        warn!("Write task for client {} failed: {}", id, e);
    }

    let reason = read_closed.borrow().clone().unwrap_or_default();
    info!("Client {} disconnected: {}", id, reason);
}

/// Read and dispatch frames until the session should end
///
/// Returns the close reason.
async fn read_loop(
    dispatcher: &Dispatcher,
    ctx: &SessionContext,
    reader: &mut OwnedReadHalf,
    closed: &mut watch::Receiver<Option<String>>,
) -> String {
    let buff_size = dispatcher.config().buff_size;
    let mut buf = vec![0u8; buff_size];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = closed.changed() => return close_reason(closed),
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                // a last frame without its terminator still counts
                if !pending.is_empty() {
                    let mut line = std::mem::take(&mut pending);
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if let Flow::Close(reason) = process_line(dispatcher, ctx, &line).await {
                        return reason;
                    }
                }
                return "peer closed connection".to_string();
            }
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(e) if is_disconnect(&e) => {
                info!("Client {} connection lost: {}", ctx.id, e);
                return "connection lost".to_string();
            }
            Err(e) => {
                warn!("Read error from client {}: {}", ctx.id, e);
                return "read error".to_string();
            }
        }

        for line in take_lines(&mut pending) {
            if ctx.connection.is_closed() {
                return close_reason(closed);
            }
            if let Flow::Close(reason) = process_line(dispatcher, ctx, &line).await {
                return reason;
            }
        }

        if pending.len() > buff_size {
            let err = ProtocolError::FrameTooLong(buff_size);
            warn!("Protocol error from client {}: {}", ctx.id, err);
            let _ = ctx.connection.send(err.into()).await;
            return "protocol error".to_string();
        }
    }
}

async fn process_line(dispatcher: &Dispatcher, ctx: &SessionContext, line: &[u8]) -> Flow {
    if line.is_empty() {
        return Flow::Continue;
    }
    let codec = *ctx.codec.borrow();
    let frame = codec.decode_frame(line);
    dispatcher.dispatch(ctx, frame).await
}

/// Drain the outbound queue to the socket until the session closes
///
/// A close interrupts a write blocked on a peer that stopped reading; that
/// peer gets no `BYE`.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut closed: watch::Receiver<Option<String>>,
    codec: watch::Receiver<Codec>,
    id: ClientId,
) {
    loop {
        tokio::select! {
            biased;
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    let written = tokio::select! {
                        biased;
                        written = write_message(&mut writer, &codec, &msg) => written,
                        _ = closed.changed() => {
                            debug!("Client {} closed while a write was pending", id);
                            return;
                        }
                    };
                    if let Err(e) = written {
                        debug!("Write to client {} failed: {}", id, e);
                        return;
                    }
                }
                None => break,
            },
            _ = closed.changed() => break,
        }
    }

    // flush what was queued before the close, then say why
    let reason = closed.borrow().clone();
    let flushed = timeout(
        CLOSE_FLUSH_TIMEOUT,
        flush_and_close(&mut writer, &mut outbound, &codec, reason),
    )
    .await;
    if !matches!(flushed, Ok(Ok(()))) {
        debug!("Final flush to client {} did not complete", id);
    }
    debug!("Write task ended for client {}", id);
}

async fn flush_and_close(
    writer: &mut OwnedWriteHalf,
    outbound: &mut mpsc::Receiver<ServerMessage>,
    codec: &watch::Receiver<Codec>,
    reason: Option<String>,
) -> std::io::Result<()> {
    while let Ok(msg) = outbound.try_recv() {
        write_message(writer, codec, &msg).await?;
    }
    if let Some(reason) = reason {
        write_message(writer, codec, &ServerMessage::Bye(reason)).await?;
    }
    writer.shutdown().await
}

async fn write_message(
    writer: &mut OwnedWriteHalf,
    codec: &watch::Receiver<Codec>,
    msg: &ServerMessage,
) -> std::io::Result<()> {
    let bytes = codec.borrow().encode_message(msg);
    writer.write_all(&bytes).await
}

fn close_reason(closed: &watch::Receiver<Option<String>>) -> String {
    closed
        .borrow()
        .clone()
        .unwrap_or_else(|| "closed".to_string())
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
