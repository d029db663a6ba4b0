use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::net::{Channel, Connection, ConnectionId, Role, Transport, TransportError};

#[derive(Debug, Clone)]
pub enum Route {
    /// The authority: the server connection on a client, the loopback on a host.
    Server,
    Player(Arc<Connection>),
    Broadcast { include_local: bool },
    /// Every remote peer but one.
    BroadcastExcept(ConnectionId),
}

#[derive(Debug)]
pub struct Outbound {
    pub route: Route,
    pub bytes: Vec<u8>,
    pub channel: Channel,
}

/// Synchronous handle onto the session's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the pump has gone away.
    pub fn push(&self, outbound: Outbound) -> bool {
        self.tx.send(outbound).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drains the outbound queue in order. On cancellation whatever is already
/// queued is flushed before returning.
pub(crate) async fn pump(
    transport: Arc<Transport>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            queued = rx.recv() => match queued {
                Some(outbound) => deliver(&transport, outbound).await,
                None => return,
            },
            _ = cancel.cancelled() => break,
        }
    }

    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        deliver(&transport, outbound).await;
    }
}

async fn deliver(transport: &Transport, outbound: Outbound) {
    let Outbound {
        route,
        bytes,
        channel,
    } = outbound;

    let result = match route {
        Route::Server => match authority_link(transport) {
            Some(connection) => transport.send_to(&connection, &bytes, channel).await,
            None => Err(TransportError::NotRunning),
        },
        Route::Player(connection) => transport.send_to(&connection, &bytes, channel).await,
        Route::Broadcast { include_local } => {
            transport.broadcast(&bytes, channel, include_local).await
        }
        Route::BroadcastExcept(excluded) => {
            transport.broadcast_except(&bytes, channel, excluded).await
        }
    };

    if let Err(e) = result {
        log::warn!("Outbound send failed: {}", e);
    }
}

fn authority_link(transport: &Transport) -> Option<Arc<Connection>> {
    match transport.role() {
        Role::Client => transport.server_connection(),
        Role::Server => transport.loopback(),
    }
}
