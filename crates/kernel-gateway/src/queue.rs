//! Group queues between channel workers and the broadcaster.
//!
//! Shell, iopub and stdin feed the shell group; control has a queue of its
//! own so interrupts never wait behind shell output. Each queue is an
//! unbounded FIFO, so per-channel arrival order is kept.

use jupyter_wire::{Channel, Message};
use tokio::sync::mpsc;

/// Broadcast group a message is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Shell,
    Control,
}

impl Group {
    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Control => Group::Control,
            Channel::Shell | Channel::IOPub | Channel::Stdin => Group::Shell,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Shell => "shell",
            Group::Control => "control",
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer side, cloned into every channel worker.
#[derive(Debug, Clone)]
pub struct QueueSender {
    shell: mpsc::UnboundedSender<Message>,
    control: mpsc::UnboundedSender<Message>,
}

impl QueueSender {
    /// Enqueue a message received on `channel`.
    ///
    /// Returns false once the broadcaster has gone away.
    pub fn push(&self, channel: Channel, message: Message) -> bool {
        let queue = match Group::for_channel(channel) {
            Group::Shell => &self.shell,
            Group::Control => &self.control,
        };
        queue.send(message.with_channel(channel)).is_ok()
    }
}

/// Consumer side, owned by the broadcaster.
#[derive(Debug)]
pub struct QueueReceiver {
    pub shell: mpsc::UnboundedReceiver<Message>,
    pub control: mpsc::UnboundedReceiver<Message>,
}

pub fn group_queues() -> (QueueSender, QueueReceiver) {
    let (shell_tx, shell_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        QueueSender {
            shell: shell_tx,
            control: control_tx,
        },
        QueueReceiver {
            shell: shell_rx,
            control: control_rx,
        },
    )
}
