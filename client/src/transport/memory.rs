use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;

use super::{Connection, Connector};
use crate::error::TransportError;
use crate::sync::protocol::ServerMessage;

/// In-process connector whose server side is driven by the caller.
///
/// Every successful `connect` hands a [`ServerEnd`] to the paired [`MemoryServer`].
/// Useful for exercising a channel without a network.
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

struct MemoryShared {
    attempts: AtomicUsize,
    refuse: AtomicBool,
}

/// Server half of a [`MemoryConnector`].
pub struct MemoryServer {
    shared: Arc<MemoryShared>,
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

/// The server's view of one accepted connection. Dropping it disconnects the client.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

pub struct MemoryConnection {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryServer) {
        let shared = Arc::new(MemoryShared {
            attempts: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: shared.clone(),
                accepted: tx,
            },
            MemoryServer {
                shared,
                accepted: rx,
            },
        )
    }
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, _endpoint: &str) -> Result<MemoryConnection, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerEnd {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Connect("server is gone".into()))?;

        Ok(MemoryConnection { incoming, outgoing })
    }
}

impl MemoryServer {
    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accepted.recv().await
    }

    pub fn try_accept(&mut self) -> Option<ServerEnd> {
        self.accepted.try_recv().ok()
    }

    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl ServerEnd {
    /// Push a message to the client. Returns false if the client is gone.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        match msg.to_json() {
            Ok(json) => self.send_raw(json),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    /// Next frame written by the client; `None` once it has released the connection.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub fn disconnect(self) {}
}

impl Connection for MemoryConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(text)
            .map_err(|_| TransportError::Send("peer disconnected".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(self) {}
}
