//! WebSocket endpoints facing editor clients.
//!
//! Two listeners exist: the shell endpoint (shell, iopub and stdin traffic)
//! and the control endpoint. Each connection has one writer task that is the
//! only sender on its socket; the broadcaster reaches it through the
//! client's outbox. The connection task itself reads client frames and
//! forwards them to the kernel.

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use jupyter_wire::{Channel, Message};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{ClientGroups, ClientHandle, ClientId, Outgoing};
use crate::channels::KernelSender;
use crate::queue::Group;
use crate::shutdown::StopSignal;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);
const WRITER_GRACE: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// One of the two listening endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Shell,
    Control,
}

impl Endpoint {
    /// Broadcast group that connections on this endpoint join.
    pub fn group(self) -> Group {
        match self {
            Endpoint::Shell => Group::Shell,
            Endpoint::Control => Group::Control,
        }
    }

    /// Kernel channel for a client frame of type `msg_type`.
    ///
    /// Input replies on the shell endpoint go to stdin. The control endpoint
    /// sends everything to control, whatever its type.
    pub fn route(self, msg_type: &str) -> Channel {
        match self {
            Endpoint::Shell if msg_type == "input_reply" => Channel::Stdin,
            Endpoint::Shell => Channel::Shell,
            Endpoint::Control => Channel::Control,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Shell => "shell",
            Endpoint::Control => "control",
        }
    }
}

/// Everything a connection needs, cloned into each connection task.
#[derive(Clone)]
pub struct ConnectionContext {
    pub groups: ClientGroups,
    pub kernel: KernelSender,
    pub websocket_config: WebSocketConfig,
    pub queue_depth: usize,
    pub stop: StopSignal,
}

/// Accept connections until `ctx.stop` fires, then wait for every
/// connection task to finish.
pub async fn serve(listener: TcpListener, endpoint: Endpoint, ctx: ConnectionContext) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = ctx.stop.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(stream, peer, endpoint, ctx.clone()));
                }
                Err(e) => {
                    warn!("[ws:{}] Accept failed: {}", endpoint.as_str(), e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    info!("[ws:{}] Endpoint closed", endpoint.as_str());
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Endpoint,
    ctx: ConnectionContext,
) {
    let name = endpoint.as_str();
    let handshake =
        tokio_tungstenite::accept_async_with_config(stream, Some(ctx.websocket_config.clone()));
    let socket = tokio::select! {
        _ = ctx.stop.wait() => return,
        socket = handshake => match socket {
            Ok(socket) => socket,
            Err(e) => {
                debug!("[ws:{}] Handshake with {} failed: {}", name, peer, e);
                return;
            }
        },
    };

    let id = ctx.groups.next_id();
    let (sink, mut source) = socket.split();
    let (outbox, outbox_rx) = mpsc::channel(ctx.queue_depth.max(1));
    let group = ctx.groups.get(endpoint.group());
    group.register(ClientHandle::new(id, peer, outbox));
    info!("[ws:{}] Client {} connected from {}", name, id, peer);

    let mut writer = Some(tokio::spawn(write_loop(
        sink,
        outbox_rx,
        ctx.stop.clone(),
        name,
        id,
    )));

    loop {
        let Some(running) = writer.as_mut() else {
            break;
        };
        tokio::select! {
            _ = ctx.stop.wait() => break,
            _ = running => {
                // outbox closed (dropped as a slow consumer) or the socket failed
                writer = None;
                break;
            }
            frame = source.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    debug!("[ws:{}] Client {} read failed: {}", name, id, e);
                    break;
                }
                Some(Ok(frame)) => {
                    if !forward_frame(frame, endpoint, id, &ctx.kernel) {
                        break;
                    }
                }
            },
        }
    }

    group.unregister(id);
    if let Some(mut writer) = writer {
        if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    }
    info!("[ws:{}] Client {} ({}) disconnected", name, id, peer);
}

/// Forward one client frame to the kernel. Returns false when the
/// connection should be closed.
fn forward_frame(frame: WsMessage, endpoint: Endpoint, id: ClientId, kernel: &KernelSender) -> bool {
    let name = endpoint.as_str();
    let text = match frame {
        WsMessage::Text(text) => text,
        WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!("[ws:{}] Client {} sent non UTF-8 binary frame, closing", name, id);
                return false;
            }
        },
        WsMessage::Close(_) => return false,
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => return true,
    };

    let message = match Message::from_json(&text) {
        Ok(message) => message,
        Err(e) => {
            warn!("[ws:{}] Client {} sent an invalid message, closing: {}", name, id, e);
            return false;
        }
    };

    let channel = endpoint.route(message.msg_type());
    debug!(
        "[ws:{}] Client {} -> {} {} msg_id={}",
        name,
        id,
        channel,
        message.msg_type(),
        message.msg_id()
    );
    let msg_id = message.msg_id().to_string();
    if let Err(e) = kernel.send(channel, message) {
        warn!(
            "[ws:{}] Dropping msg_id={} from client {}: {}",
            name, msg_id, id, e
        );
    }
    true
}

/// Sole sender on a client socket.
async fn write_loop(
    mut sink: WsSink,
    mut outbox: mpsc::Receiver<Outgoing>,
    stop: StopSignal,
    name: &'static str,
    id: ClientId,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.wait() => break,
            next = outbox.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.to_string())).await {
                        debug!("[ws:{}] Client {} write failed: {}", name, id, e);
                        return;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}
