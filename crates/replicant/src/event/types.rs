use crate::net::DisconnectReason;
use crate::session::Player;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    PlayerJoined(Player),
    PlayerLeft {
        player: Player,
        reason: DisconnectReason,
    },
    /// Client side: the handshake with the server completed.
    Connected,
    Disconnected(DisconnectReason),
    Error(String),
}

impl SessionEvent {
    pub fn player(&self) -> Option<&Player> {
        match self {
            SessionEvent::PlayerJoined(player) => Some(player),
            SessionEvent::PlayerLeft { player, .. } => Some(player),
            _ => None,
        }
    }
}
