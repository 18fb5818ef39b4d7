//! A scripted stand-in for a Jupyter kernel, plus WebSocket client helpers.
//!
//! The fake binds real ZeroMQ sockets and writes a connection file, so the
//! gateway attaches to it exactly like it would to ipykernel. Behaviour is
//! driven by the `code` of execute requests:
//!
//! - `sleep <ms>`: reply after `ms` milliseconds unless interrupted first
//! - `burst <n>`: publish `n` numbered stream messages, then reply
//! - `input`: ask for input on stdin and echo the answer on iopub
//! - anything else: reply immediately
//!
//! Every message the kernel receives is reported on `received`.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use jupyter_wire::{wire, Channel, Message, Signer};
use kernel_gateway::{GatewayConfig, KernelSource};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use zeromq::{PubSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

pub const KEY: &str = "fake-kernel-key";

/// Code the gateway is configured to send for service registration.
pub const REGISTER_CODE: &str = "configure_kernel(session_mode='console')";

const TIMEOUT: Duration = Duration::from_secs(5);

/// How the fake kernel answers the service registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Ok,
    Error,
    Silent,
}

#[derive(Debug, Clone, Copy)]
pub struct Behavior {
    pub answer_kernel_info: bool,
    pub registration: Registration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            answer_kernel_info: true,
            registration: Registration::Ok,
        }
    }
}

pub struct FakeKernel {
    pub connection_file: PathBuf,
    pub received: mpsc::UnboundedReceiver<(Channel, Message)>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl FakeKernel {
    pub async fn start() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    pub async fn with_behavior(behavior: Behavior) -> Self {
        let (shell, shell_port) = bind_router().await;
        let (control, control_port) = bind_router().await;
        let (stdin, stdin_port) = bind_router().await;
        let mut iopub = PubSocket::new();
        let iopub_port = bound_port(iopub.bind("tcp://127.0.0.1:0").await.unwrap());

        let dir = tempfile::tempdir().unwrap();
        let connection_file = dir.path().join("kernel-fake.json");
        let info = json!({
            "transport": "tcp",
            "ip": "127.0.0.1",
            "shell_port": shell_port,
            "iopub_port": iopub_port,
            "stdin_port": stdin_port,
            "control_port": control_port,
            "hb_port": 0,
            "signature_scheme": "hmac-sha256",
            "key": KEY,
            "kernel_name": "fake",
        });
        std::fs::write(&connection_file, info.to_string()).unwrap();

        let (tx, received) = mpsc::unbounded_channel();
        let sockets = Sockets {
            shell,
            control,
            stdin,
            iopub,
            signer: Signer::new("hmac-sha256", KEY).unwrap(),
        };
        let task = tokio::spawn(sockets.run(behavior, tx));

        Self {
            connection_file,
            received,
            task,
            _dir: dir,
        }
    }

    /// Gateway configuration attached to this kernel on ephemeral ports.
    pub fn gateway_config(&self) -> GatewayConfig {
        let mut config = GatewayConfig {
            shell_port: 0,
            control_port: Some(0),
            ready_timeout: TIMEOUT,
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        };
        config.kernel.source = KernelSource::ConnectionFile {
            path: self.connection_file.clone(),
        };
        config.registration.enabled = true;
        config.registration.code = Some(REGISTER_CODE.to_string());
        config.registration.timeout = Duration::from_secs(2);
        config
    }

    /// Next message the kernel received with type `msg_type`.
    pub async fn expect(&mut self, msg_type: &str) -> (Channel, Message) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let next = tokio::time::timeout_at(deadline, self.received.recv())
                .await
                .unwrap_or_else(|_| panic!("kernel never received {msg_type}"))
                .expect("fake kernel stopped");
            if next.1.msg_type() == msg_type {
                return next;
            }
        }
    }
}

impl FakeKernel {
    /// The kernel's copy of the message with id `msg_id`.
    ///
    /// Skips everything else, including the gateway's own startup traffic.
    pub async fn expect_id(&mut self, msg_id: &str) -> (Channel, Message) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let next = tokio::time::timeout_at(deadline, self.received.recv())
                .await
                .unwrap_or_else(|_| panic!("kernel never received message {msg_id}"))
                .expect("fake kernel stopped");
            if next.1.msg_id() == msg_id {
                return next;
            }
        }
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Routed {
    identities: Vec<Bytes>,
    message: Message,
}

struct Pending {
    request: Routed,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Shell,
    Control,
    Stdin,
}

struct Sockets {
    shell: RouterSocket,
    control: RouterSocket,
    stdin: RouterSocket,
    iopub: PubSocket,
    signer: Signer,
}

impl Sockets {
    async fn run(mut self, behavior: Behavior, tx: mpsc::UnboundedSender<(Channel, Message)>) {
        let mut pending: Vec<Pending> = Vec::new();
        let mut awaiting_input: Option<Routed> = None;

        loop {
            let next_deadline = pending.iter().map(|p| p.deadline).min();
            tokio::select! {
                received = self.shell.recv() => {
                    let Some(request) = self.decode(received, Channel::Shell) else { continue };
                    let _ = tx.send((Channel::Shell, request.message.clone()));
                    self.on_shell(&behavior, request, &mut pending, &mut awaiting_input).await;
                }
                received = self.control.recv() => {
                    let Some(request) = self.decode(received, Channel::Control) else { continue };
                    let _ = tx.send((Channel::Control, request.message.clone()));
                    self.on_control(request, &mut pending).await;
                }
                received = self.stdin.recv() => {
                    let Some(reply) = self.decode(received, Channel::Stdin) else { continue };
                    let _ = tx.send((Channel::Stdin, reply.message.clone()));
                    if let Some(request) = awaiting_input.take() {
                        let value = reply.message.content["value"].clone();
                        self.publish(&request.message, "stream", json!({"name": "stdout", "text": value}))
                            .await;
                        self.finish(&request, json!({"status": "ok", "execution_count": 1}))
                            .await;
                    }
                }
                _ = sleep_until(next_deadline) => {
                    let now = Instant::now();
                    let (due, rest): (Vec<_>, Vec<_>) =
                        pending.drain(..).partition(|p| p.deadline <= now);
                    pending = rest;
                    for p in due {
                        self.finish(&p.request, json!({"status": "ok", "execution_count": 1}))
                            .await;
                    }
                }
            }
        }
    }

    fn decode(
        &self,
        received: Result<ZmqMessage, zeromq::ZmqError>,
        channel: Channel,
    ) -> Option<Routed> {
        let frames = received.ok()?.into_vec();
        let routed = wire::decode(frames, channel, &self.signer).ok()?;
        Some(Routed {
            identities: routed.identities,
            message: routed.message,
        })
    }

    async fn on_shell(
        &mut self,
        behavior: &Behavior,
        request: Routed,
        pending: &mut Vec<Pending>,
        awaiting_input: &mut Option<Routed>,
    ) {
        let message = &request.message;
        match message.msg_type() {
            "kernel_info_request" => {
                if !behavior.answer_kernel_info {
                    return;
                }
                self.publish(message, "status", json!({"execution_state": "busy"}))
                    .await;
                let reply = message.reply(
                    "kernel_info_reply",
                    json!({"status": "ok", "protocol_version": "5.3", "implementation": "fake"}),
                );
                self.send_routed(Target::Shell, &request.identities, reply)
                    .await;
                self.publish(message, "status", json!({"execution_state": "idle"}))
                    .await;
            }
            "execute_request" => {
                let code = message.content["code"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.publish(message, "status", json!({"execution_state": "busy"}))
                    .await;
                if code == REGISTER_CODE {
                    match behavior.registration {
                        Registration::Ok => {
                            self.finish(&request, json!({"status": "ok", "execution_count": 0}))
                                .await
                        }
                        Registration::Error => {
                            let error = json!({
                                "status": "error",
                                "ename": "ModuleNotFoundError",
                                "evalue": "No module named 'gateway_services'",
                                "traceback": [],
                            });
                            self.publish(message, "error", error.clone()).await;
                            self.finish(&request, error).await;
                        }
                        Registration::Silent => {}
                    }
                } else if let Some(ms) = code.strip_prefix("sleep ") {
                    let ms: u64 = ms.trim().parse().unwrap_or(0);
                    pending.push(Pending {
                        request,
                        deadline: Instant::now() + Duration::from_millis(ms),
                    });
                } else if let Some(n) = code.strip_prefix("burst ") {
                    let n: usize = n.trim().parse().unwrap_or(0);
                    for i in 0..n {
                        self.publish(
                            message,
                            "stream",
                            json!({"name": "stdout", "text": i.to_string()}),
                        )
                        .await;
                    }
                    self.finish(&request, json!({"status": "ok", "execution_count": 1}))
                        .await;
                } else if code == "input" {
                    // stdin shares the shell identity, so the prompt reaches the same client
                    let prompt =
                        message.reply("input_request", json!({"prompt": "name? ", "password": false}));
                    self.send_routed(Target::Stdin, &request.identities, prompt)
                        .await;
                    *awaiting_input = Some(request);
                } else {
                    self.finish(&request, json!({"status": "ok", "execution_count": 1}))
                        .await;
                }
            }
            "comm_open" | "comm_msg" | "comm_close" => {
                let echo = message.content.clone();
                self.publish(message, message.msg_type(), echo).await;
            }
            other => {
                let reply = message.reply(&other.replace("_request", "_reply"), json!({"status": "ok"}));
                self.send_routed(Target::Shell, &request.identities, reply)
                    .await;
            }
        }
    }

    async fn on_control(&mut self, request: Routed, pending: &mut Vec<Pending>) {
        let message = &request.message;
        let content = match message.msg_type() {
            "shutdown_request" => json!({"status": "ok", "restart": false}),
            _ => json!({"status": "ok"}),
        };
        let reply = message.reply(&message.msg_type().replace("_request", "_reply"), content);
        self.send_routed(Target::Control, &request.identities, reply)
            .await;

        if message.msg_type() == "interrupt_request" {
            for p in pending.drain(..) {
                let error = json!({
                    "status": "error",
                    "ename": "KeyboardInterrupt",
                    "evalue": "",
                    "traceback": [],
                });
                self.publish(&p.request.message, "error", error.clone())
                    .await;
                self.finish(&p.request, error).await;
            }
        }
    }

    /// Send the execute reply and return to idle.
    async fn finish(&mut self, request: &Routed, content: Value) {
        let reply = request.message.reply("execute_reply", content);
        self.send_routed(Target::Shell, &request.identities, reply)
            .await;
        self.publish(&request.message, "status", json!({"execution_state": "idle"}))
            .await;
    }

    async fn send_routed(&mut self, target: Target, identities: &[Bytes], message: Message) {
        let frames = wire::encode_routed(identities, &message, &self.signer).unwrap();
        let socket = match target {
            Target::Shell => &mut self.shell,
            Target::Control => &mut self.control,
            Target::Stdin => &mut self.stdin,
        };
        let _ = socket.send(to_zmq(frames)).await;
    }

    async fn publish(&mut self, parent: &Message, msg_type: &str, content: Value) {
        let message = parent.reply(msg_type, content);
        let frames = wire::encode(&message, &self.signer).unwrap();
        let _ = self.iopub.send(to_zmq(frames)).await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn bound_port(endpoint: zeromq::Endpoint) -> u16 {
    match endpoint {
        zeromq::Endpoint::Tcp(_, port) => port,
        other => panic!("unexpected endpoint {other}"),
    }
}

async fn bind_router() -> (RouterSocket, u16) {
    let mut socket = RouterSocket::new();
    let port = bound_port(socket.bind("tcp://127.0.0.1:0").await.unwrap());
    (socket, port)
}

fn to_zmq(frames: Vec<Bytes>) -> ZmqMessage {
    let mut frames = frames.into_iter();
    let mut message = ZmqMessage::from(frames.next().unwrap_or_default());
    for frame in frames {
        message.push_back(frame);
    }
    message
}

// WebSocket clients

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    client
}

pub async fn send(client: &mut Client, message: &Message) {
    client
        .send(WsMessage::Text(message.to_json().unwrap()))
        .await
        .unwrap();
}

pub fn request(msg_type: &str, content: Value) -> Message {
    Message::request(msg_type, "client-session", content)
}

/// Next message of type `msg_type`, skipping everything else.
pub async fn recv_type(client: &mut Client, msg_type: &str) -> Message {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let message = recv_within(client, deadline)
            .await
            .unwrap_or_else(|| panic!("client never received {msg_type}"));
        if message.msg_type() == msg_type {
            return message;
        }
    }
}

/// Collect messages up to and including the kernel going idle.
///
/// Replies travel on shell and output on iopub, so only the iopub `idle`
/// status is guaranteed to follow all output of a request.
pub async fn collect_until_idle(client: &mut Client) -> Vec<Message> {
    let deadline = Instant::now() + TIMEOUT;
    let mut messages = Vec::new();
    loop {
        let message = recv_within(client, deadline)
            .await
            .expect("kernel never went idle");
        let idle = message.msg_type() == "status" && message.content["execution_state"] == "idle";
        messages.push(message);
        if idle {
            return messages;
        }
    }
}

async fn recv_within(client: &mut Client, deadline: Instant) -> Option<Message> {
    loop {
        let frame = tokio::time::timeout_at(deadline, client.next())
            .await
            .ok()??
            .ok()?;
        match frame {
            WsMessage::Text(text) => return Some(Message::from_json(&text).unwrap()),
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Whether the server closes `client` within `timeout`.
pub async fn closed_within(client: &mut Client, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            match client.next().await {
                None | Some(Err(_)) => return,
                Some(Ok(frame)) if frame.is_close() => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .is_ok()
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
