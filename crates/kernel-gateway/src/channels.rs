//! Kernel channel sockets and their workers.
//!
//! Each channel gets one task that exclusively owns its socket. The task
//! waits on three things at once: the socket, outbound messages for that
//! channel, and the worker stop signal. Nothing is polled on a timer, so an
//! idle channel costs nothing and a stop is observed immediately.

use std::time::Duration;

use bytes::Bytes;
use jupyter_protocol::ConnectionInfo;
use jupyter_wire::{wire, Channel, Message, Signer};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zeromq::util::PeerIdentity;
use zeromq::{
    DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, SubSocket, ZmqError, ZmqMessage,
};

use crate::error::ChannelError;
use crate::queue::QueueSender;
use crate::shutdown::StopSignal;

const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// The four client-side sockets of one kernel connection.
pub struct KernelChannels {
    pub(crate) shell: DealerSocket,
    pub(crate) control: DealerSocket,
    pub(crate) stdin: DealerSocket,
    pub(crate) iopub: SubSocket,
    pub(crate) signer: Signer,
    session: String,
}

impl KernelChannels {
    /// Connect to every channel of a running kernel.
    ///
    /// Shell and stdin share a routing identity: the kernel addresses
    /// `input_request` to the identity of the shell request that asked.
    pub async fn connect(info: &ConnectionInfo, session: &str) -> Result<Self, ChannelError> {
        let signer = Signer::new(&info.signature_scheme, &info.key)?;
        let identity = PeerIdentity::try_from(session.as_bytes().to_vec())?;

        let mut options = SocketOptions::default();
        options.peer_identity(identity.clone());
        let mut shell = DealerSocket::with_options(options);
        shell.connect(&endpoint(info, info.shell_port)).await?;

        let mut options = SocketOptions::default();
        options.peer_identity(identity);
        let mut stdin = DealerSocket::with_options(options);
        stdin.connect(&endpoint(info, info.stdin_port)).await?;

        let mut control = DealerSocket::new();
        control.connect(&endpoint(info, info.control_port)).await?;

        let mut iopub = SubSocket::new();
        iopub.connect(&endpoint(info, info.iopub_port)).await?;
        iopub.subscribe("").await?;

        debug!(
            "[channels] Connected to kernel at {} (session {})",
            info.ip, session
        );

        Ok(Self {
            shell,
            control,
            stdin,
            iopub,
            signer,
            session: session.to_string(),
        })
    }

    /// Keep trying to connect until the kernel is listening.
    ///
    /// Returns `None` if `stop` fires first, including while a connect
    /// attempt is still pending. zeromq keeps retrying a refused TCP connect
    /// internally, so an attempt may never finish on its own. Callers bound
    /// this with a timeout.
    pub async fn connect_with_retry(
        info: &ConnectionInfo,
        session: &str,
        stop: &StopSignal,
    ) -> Option<Self> {
        loop {
            tokio::select! {
                biased;
                _ = stop.wait() => return None,
                connected = Self::connect(info, session) => match connected {
                    Ok(channels) => return Some(channels),
                    Err(e) => debug!("[channels] Kernel not reachable yet: {}", e),
                },
            }
            tokio::select! {
                biased;
                _ = stop.wait() => return None,
                _ = tokio::time::sleep(CONNECT_RETRY) => {}
            }
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Build a request stamped with this connection's session id.
    pub fn request(&self, msg_type: &str, content: serde_json::Value) -> Message {
        Message::request(msg_type, &self.session, content)
    }

    /// Send directly on a socket. Only used before workers own the sockets.
    pub async fn send(&mut self, channel: Channel, message: &Message) -> Result<(), ChannelError> {
        let frames = wire::encode(message, &self.signer)?;
        let socket = match channel {
            Channel::Shell => &mut self.shell,
            Channel::Control => &mut self.control,
            Channel::Stdin => &mut self.stdin,
            Channel::IOPub => return Err(ChannelError::ReceiveOnly(channel)),
        };
        socket.send(to_zmq(frames)).await?;
        Ok(())
    }

    /// Hand each socket to its own worker task.
    pub fn spawn_workers(
        self,
        queues: QueueSender,
        stop: StopSignal,
        backoff: Duration,
    ) -> (KernelSender, Vec<JoinHandle<()>>) {
        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();

        let worker = |channel| Worker {
            channel,
            signer: self.signer.clone(),
            queues: queues.clone(),
            stop: stop.clone(),
            backoff,
        };

        let handles = vec![
            tokio::spawn(worker(Channel::Shell).run_dealer(self.shell, shell_rx)),
            tokio::spawn(worker(Channel::Control).run_dealer(self.control, control_rx)),
            tokio::spawn(worker(Channel::Stdin).run_dealer(self.stdin, stdin_rx)),
            tokio::spawn(worker(Channel::IOPub).run_subscriber(self.iopub)),
        ];

        let sender = KernelSender {
            shell: shell_tx,
            control: control_tx,
            stdin: stdin_tx,
        };
        (sender, handles)
    }
}

/// Cloneable handle for sending to the kernel once workers own the sockets.
#[derive(Debug, Clone)]
pub struct KernelSender {
    shell: mpsc::UnboundedSender<Message>,
    control: mpsc::UnboundedSender<Message>,
    stdin: mpsc::UnboundedSender<Message>,
}

impl KernelSender {
    pub fn send(&self, channel: Channel, message: Message) -> Result<(), ChannelError> {
        let outbound = match channel {
            Channel::Shell => &self.shell,
            Channel::Control => &self.control,
            Channel::Stdin => &self.stdin,
            Channel::IOPub => return Err(ChannelError::ReceiveOnly(channel)),
        };
        outbound
            .send(message)
            .map_err(|_| ChannelError::Closed(channel))
    }

    /// A sender whose shell, control and stdin traffic lands in the returned
    /// receivers instead of sockets.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, [mpsc::UnboundedReceiver<Message>; 3]) {
        let (shell, shell_rx) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let (stdin, stdin_rx) = mpsc::unbounded_channel();
        (
            Self {
                shell,
                control,
                stdin,
            },
            [shell_rx, control_rx, stdin_rx],
        )
    }
}

struct Worker {
    channel: Channel,
    signer: Signer,
    queues: QueueSender,
    stop: StopSignal,
    backoff: Duration,
}

impl Worker {
    async fn run_dealer(
        self,
        mut socket: DealerSocket,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        let mut outbound_open = true;
        loop {
            tokio::select! {
                biased;
                _ = self.stop.wait() => break,
                message = outbound.recv(), if outbound_open => match message {
                    Some(message) => self.send(&mut socket, &message).await,
                    None => outbound_open = false,
                },
                received = socket.recv() => {
                    if !self.accept(received) {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        let _ = socket.close().await;
        info!("[channels] {} worker stopped", self.channel);
    }

    async fn run_subscriber(self, mut socket: SubSocket) {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.wait() => break,
                received = socket.recv() => {
                    if !self.accept(received) {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        let _ = socket.close().await;
        info!("[channels] {} worker stopped", self.channel);
    }

    async fn send(&self, socket: &mut DealerSocket, message: &Message) {
        let frames = match wire::encode(message, &self.signer) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(
                    "[channels] Failed to encode {} msg_id={}: {}",
                    self.channel,
                    message.msg_id(),
                    e
                );
                return;
            }
        };
        if let Err(e) = socket.send(to_zmq(frames)).await {
            warn!(
                "[channels] Failed to send {} {} msg_id={}: {}",
                self.channel,
                message.msg_type(),
                message.msg_id(),
                e
            );
        }
    }

    /// Decode and enqueue one received frame set. Returns false on failure.
    fn accept(&self, received: Result<ZmqMessage, ZmqError>) -> bool {
        let decoded = received
            .map_err(ChannelError::from)
            .and_then(|frames| {
                wire::decode(frames.into_vec(), self.channel, &self.signer)
                    .map_err(ChannelError::from)
            });

        match decoded {
            Ok(routed) => {
                let mut message = routed.message;
                message.normalize_timestamps();
                debug!(
                    "[channels] {} <- {} msg_id={} parent={:?}",
                    self.channel,
                    message.msg_type(),
                    message.msg_id(),
                    message.parent_msg_id()
                );
                if !self.queues.push(self.channel, message) {
                    debug!("[channels] {} queue closed, dropping message", self.channel);
                }
                true
            }
            Err(e) => {
                warn!("[channels] {} read failed: {}", self.channel, e);
                false
            }
        }
    }
}

/// Receive and decode one message from `socket`.
pub(crate) async fn recv_from<S: SocketRecv>(
    socket: &mut S,
    channel: Channel,
    signer: &Signer,
) -> Result<Message, ChannelError> {
    let frames = socket.recv().await?;
    let routed = wire::decode(frames.into_vec(), channel, signer)?;
    let mut message = routed.message;
    message.normalize_timestamps();
    Ok(message)
}

fn endpoint(info: &ConnectionInfo, port: u16) -> String {
    format!("tcp://{}:{}", info.ip, port)
}

pub(crate) fn to_zmq(frames: Vec<Bytes>) -> ZmqMessage {
    let mut frames = frames.into_iter();
    let mut message = ZmqMessage::from(frames.next().unwrap_or_default());
    for frame in frames {
        message.push_back(frame);
    }
    message
}
