#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Fraction of outgoing datagrams to drop, 0.0..=1.0.
    pub loss_fraction: f32,
}

impl PacketLossSimulation {
    pub fn with_loss(loss_fraction: f32) -> Self {
        Self {
            enabled: true,
            loss_fraction: loss_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_fraction <= 0.0 {
            return false;
        }
        rand_fraction() < self.loss_fraction
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub retransmissions: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

pub fn rand_fraction() -> f32 {
    (rand_u64() % 10_000) as f32 / 10_000.0
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut hasher = RandomState::new().build_hasher();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    hasher.write_u64(nanos);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_drops() {
        let sim = PacketLossSimulation::default();
        assert!((0..100).all(|_| !sim.should_drop()));
    }

    #[test]
    fn test_full_loss_always_drops() {
        let sim = PacketLossSimulation::with_loss(1.0);
        assert!((0..100).all(|_| sim.should_drop()));
    }

    #[test]
    fn test_rand_fraction_in_range() {
        for _ in 0..100 {
            let value = rand_fraction();
            assert!((0.0..1.0).contains(&value));
        }
    }
}
