use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use replicant::{DEFAULT_PORT, PacketLossSimulation, SessionConfig, TransportConfig};

#[derive(Parser)]
#[command(name = "replicant-node")]
#[command(about = "Replicated session node: host, dedicated server or client")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, global = true, default_value_t = 32)]
    pub max_connections: usize,

    #[arg(long, global = true, default_value_t = 1000, help = "Heartbeat interval in ms")]
    pub heartbeat_ms: u64,

    #[arg(long, global = true, default_value_t = 5)]
    pub max_missed_heartbeats: u32,

    #[arg(long, global = true, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    pub loss_percent: f32,

    #[arg(long, global = true, help = "Keep a leaving player's objects alive")]
    pub keep_orphans: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve remote players and play locally in the same process.
    Host {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Serve remote players only.
    Server {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    Client {
        #[arg(short, long, default_value = "127.0.0.1:11000")]
        addr: SocketAddr,
    },
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        let packet_loss = if self.loss_percent > 0.0 {
            PacketLossSimulation::with_loss(self.loss_percent / 100.0)
        } else {
            PacketLossSimulation::default()
        };

        SessionConfig {
            transport: TransportConfig {
                max_connections: self.max_connections,
                heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
                max_missed_heartbeats: self.max_missed_heartbeats,
                packet_loss,
                ..Default::default()
            },
            despawn_on_leave: !self.keep_orphans,
        }
    }
}
