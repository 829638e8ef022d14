//! In-process message port pair.

use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};

/// Client end of a port pair.
pub struct ClientPort {
    /// Sender for client messages.
    pub(crate) tx: mpsc::UnboundedSender<ClientMessage>,
    /// Receiver for worker messages.
    pub(crate) rx: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Worker end of a port pair.
pub struct WorkerPort {
    /// Receiver for client messages.
    pub(crate) rx: mpsc::UnboundedReceiver<ClientMessage>,
    /// Sender for worker messages.
    pub(crate) tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Create a connected port pair.
///
/// Each direction is an ordered queue; messages are received in the order
/// they were sent.
#[must_use]
pub fn channel() -> (ClientPort, WorkerPort) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();

    let client = ClientPort {
        tx: client_tx,
        rx: server_rx,
    };

    let worker = WorkerPort {
        rx: client_rx,
        tx: server_tx,
    };

    (client, worker)
}

impl WorkerPort {
    /// Split into receiver and sender halves.
    #[must_use]
    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedReceiver<ClientMessage>,
        mpsc::UnboundedSender<ServerMessage>,
    ) {
        (self.rx, self.tx)
    }
}

impl ClientPort {
    /// Split into sender and receiver halves.
    #[must_use]
    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.tx, self.rx)
    }
}
