use std::time::Duration;

use super::stats::PacketLossSimulation;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_connections: usize,
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub resend_min: Duration,
    pub send_window: usize,
    pub connect_retry_interval: Duration,
    pub connect_attempts: u32,
    pub packet_loss: PacketLossSimulation,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            tick_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(1),
            max_missed_heartbeats: 5,
            resend_min: Duration::from_millis(100),
            send_window: 256,
            connect_retry_interval: Duration::from_millis(500),
            connect_attempts: 10,
            packet_loss: PacketLossSimulation::default(),
        }
    }
}

impl TransportConfig {
    /// A peer silent for this long is considered gone.
    pub fn peer_timeout(&self) -> Duration {
        self.heartbeat_interval * self.max_missed_heartbeats.max(1)
    }
}
