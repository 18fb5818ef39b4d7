//! Fan-out from the group queues to connected WebSocket clients.
//!
//! A single task drains both queues and hands each message to every client
//! registered in the matching group. Clients are reached through bounded
//! per-client outboxes, so delivery never awaits a socket: a full outbox
//! marks a slow consumer, a closed one a client that already went away, and
//! either way only that client is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use jupyter_wire::Message;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::queue::{Group, QueueReceiver};
use crate::shutdown::StopSignal;

/// Messages handed out between yields to the scheduler.
const DRAIN_BUDGET: usize = 256;

pub type ClientId = u64;

/// Serialized JSON text shared by every recipient of one message.
pub type Outgoing = Arc<str>;

/// A registered connection as seen by the broadcaster.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub peer: SocketAddr,
    outbox: mpsc::Sender<Outgoing>,
}

impl ClientHandle {
    pub fn new(id: ClientId, peer: SocketAddr, outbox: mpsc::Sender<Outgoing>) -> Self {
        Self { id, peer, outbox }
    }
}

/// The set of clients entitled to one group's traffic.
#[derive(Debug)]
pub struct ClientGroup {
    group: Group,
    clients: DashMap<ClientId, ClientHandle>,
}

impl ClientGroup {
    fn new(group: Group) -> Self {
        Self {
            group,
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, client: ClientHandle) {
        debug!(
            "[broadcast] {} client {} ({}) registered",
            self.group, client.id, client.peer
        );
        self.clients.insert(client.id, client);
    }

    /// Remove a client. Dropping its handle closes the outbox, which ends the
    /// connection's writer once queued messages are flushed.
    pub fn unregister(&self, id: ClientId) -> bool {
        match self.clients.remove(&id) {
            Some((_, client)) => {
                debug!(
                    "[broadcast] {} client {} ({}) unregistered",
                    self.group, id, client.peer
                );
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the membership. No lock is held afterwards.
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn clear(&self) {
        self.clients.clear();
    }
}

/// Both client groups of one gateway.
#[derive(Debug, Clone)]
pub struct ClientGroups {
    shell: Arc<ClientGroup>,
    control: Arc<ClientGroup>,
    next_id: Arc<AtomicU64>,
}

impl Default for ClientGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientGroups {
    pub fn new() -> Self {
        Self {
            shell: Arc::new(ClientGroup::new(Group::Shell)),
            control: Arc::new(ClientGroup::new(Group::Control)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn get(&self, group: Group) -> &ClientGroup {
        match group {
            Group::Shell => &self.shell,
            Group::Control => &self.control,
        }
    }

    pub fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop every client, closing all outboxes.
    pub fn clear(&self) {
        self.shell.clear();
        self.control.clear();
    }
}

/// Result of handing one message to a group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Hand `message` to every client in `group`, unregistering those that fail.
pub fn deliver(groups: &ClientGroups, group: Group, message: &Message) -> Delivery {
    let text: Outgoing = match message.to_json() {
        Ok(text) => text.into(),
        Err(e) => {
            warn!(
                "[broadcast] Failed to serialize {} msg_id={}: {}",
                message.msg_type(),
                message.msg_id(),
                e
            );
            return Delivery::default();
        }
    };

    let clients = groups.get(group);
    let mut delivery = Delivery::default();
    let mut failed = Vec::new();
    for client in clients.snapshot() {
        match client.outbox.try_send(Arc::clone(&text)) {
            Ok(()) => delivery.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[broadcast] {} client {} ({}) is not keeping up, dropping it at msg_id={}",
                    group,
                    client.id,
                    client.peer,
                    message.msg_id()
                );
                failed.push(client.id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "[broadcast] {} client {} ({}) is gone",
                    group, client.id, client.peer
                );
                failed.push(client.id);
            }
        }
    }

    for id in failed {
        clients.unregister(id);
        delivery.dropped += 1;
    }
    delivery
}

/// The single task that drains the group queues.
pub struct Broadcaster {
    queues: QueueReceiver,
    groups: ClientGroups,
}

impl Broadcaster {
    pub fn new(queues: QueueReceiver, groups: ClientGroups) -> Self {
        Self { queues, groups }
    }

    /// Deliver until `stop` fires or every producer is gone.
    pub async fn run(mut self, stop: StopSignal) {
        let mut shell_open = true;
        let mut control_open = true;

        while shell_open || control_open {
            tokio::select! {
                biased;
                _ = stop.wait() => break,
                message = self.queues.control.recv(), if control_open => match message {
                    Some(message) => {
                        deliver(&self.groups, Group::Control, &message);
                    }
                    None => control_open = false,
                },
                message = self.queues.shell.recv(), if shell_open => match message {
                    Some(message) => {
                        deliver(&self.groups, Group::Shell, &message);
                    }
                    None => shell_open = false,
                },
            }
            self.drain(&stop).await;
        }
        info!("[broadcast] Broadcaster stopped");
    }

    /// Deliver whatever is queued without waiting. Control messages are
    /// taken before each shell message, so a shell backlog never delays them.
    async fn drain(&mut self, stop: &StopSignal) {
        let mut budget = DRAIN_BUDGET;
        while !stop.is_set() {
            while let Ok(message) = self.queues.control.try_recv() {
                deliver(&self.groups, Group::Control, &message);
            }
            match self.queues.shell.try_recv() {
                Ok(message) => {
                    deliver(&self.groups, Group::Shell, &message);
                }
                Err(_) => break,
            }
            budget -= 1;
            if budget == 0 {
                tokio::task::yield_now().await;
                budget = DRAIN_BUDGET;
            }
        }
    }
}
