use crate::net::TransportConfig;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    /// The authority despawns a departing player's objects.
    pub despawn_on_leave: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            despawn_on_leave: true,
        }
    }
}
