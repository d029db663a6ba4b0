use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::net::{Connection, Endpoint, NetworkStats};

/// Application-facing handle for one peer's connection.
#[derive(Clone)]
pub struct Player {
    connection: Arc<Connection>,
    local: bool,
}

impl Player {
    pub(crate) fn new(connection: Arc<Connection>, local: bool) -> Self {
        Self { connection, local }
    }

    /// The connection id. On a client this is the id the server assigned.
    pub fn id(&self) -> u32 {
        self.connection.id().0
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn endpoint(&self) -> Endpoint {
        self.connection.endpoint()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.connection.addr()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_live()
    }

    pub fn stats(&self) -> NetworkStats {
        self.connection.stats()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl PartialEq for Player {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }
}

impl Eq for Player {}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .field("local", &self.local)
            .finish()
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player {} ({})", self.id(), self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{ConnectionId, ConnectionState, TransportConfig};

    #[test]
    fn test_identity_is_the_connection() {
        let config = TransportConfig::default();
        let connection = Arc::new(Connection::new(
            ConnectionId(3),
            Endpoint::Remote(SocketAddr::from(([127, 0, 0, 1], 4000))),
            ConnectionState::Connected,
            &config,
        ));
        let other = Arc::new(Connection::new(
            ConnectionId(3),
            Endpoint::Loopback,
            ConnectionState::Connected,
            &config,
        ));

        let player = Player::new(Arc::clone(&connection), false);
        assert_eq!(player, Player::new(connection, true));
        assert_ne!(player, Player::new(other, false));
        assert_eq!(player.id(), 3);
        assert!(player.is_connected());
        assert!(!player.is_local());
    }
}
