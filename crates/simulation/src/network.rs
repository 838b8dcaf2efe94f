//! Simulated network with deterministic latency, packet loss, and partitions.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the simulated replica group.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of replicas.
    pub num_replicas: u64,
    /// Base message latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this probability.
    pub packet_loss_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_replicas: 4,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports:
/// - Configurable latency with jitter
/// - Packet loss (probabilistic message drops)
/// - Partitions (blocking communication between replica pairs)
///
/// Loopback delivery (a replica's broadcast copy to itself) is never subject
/// to partitions or loss.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: SimulationConfig,
    /// Partitioned pairs. If (a, b) is in this set, messages from a to b are
    /// dropped. Directional - add both (a, b) and (b, a) for a full cut.
    partitions: HashSet<(u64, u64)>,
}

impl SimulatedNetwork {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    // ─── Partition Management ───

    /// Check if messages from `from` to `to` would be dropped.
    pub fn is_partitioned(&self, from: u64, to: u64) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Drop messages from `from` to `to`.
    pub fn partition_unidirectional(&mut self, from: u64, to: u64) {
        self.partitions.insert((from, to));
    }

    /// Drop messages in both directions between two replicas.
    pub fn partition_bidirectional(&mut self, a: u64, b: u64) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Cut a replica off from every peer.
    pub fn isolate(&mut self, replica: u64) {
        for other in 0..self.config.num_replicas {
            if other != replica {
                self.partitions.insert((replica, other));
                self.partitions.insert((other, replica));
            }
        }
    }

    /// Reconnect a replica to every peer.
    pub fn heal(&mut self, replica: u64) {
        self.partitions
            .retain(|(a, b)| *a != replica && *b != replica);
    }

    /// Restore full connectivity.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Message Delivery Decision ───

    /// Decide whether a message is delivered and with what latency.
    ///
    /// Returns `None` when the message is dropped (partition or loss).
    pub fn should_deliver(&self, from: u64, to: u64, rng: &mut ChaCha8Rng) -> Option<Duration> {
        if from == to {
            // Loopback is reliable and fast.
            return Some(Duration::from_millis(1));
        }
        if self.is_partitioned(from, to) {
            return None;
        }
        if self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate {
            return None;
        }
        Some(self.sample_latency(rng))
    }

    /// Sample a delivery latency with jitter.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.001))
    }

    pub fn num_replicas(&self) -> u64 {
        self.config.num_replicas
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn partitions_are_directional() {
        let mut network = SimulatedNetwork::new(SimulationConfig::default());
        assert!(!network.is_partitioned(0, 1));

        network.partition_unidirectional(0, 1);
        assert!(network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(1, 0));

        network.partition_bidirectional(2, 3);
        assert!(network.is_partitioned(2, 3));
        assert!(network.is_partitioned(3, 2));

        network.heal_all();
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn isolation_cuts_all_peers_but_not_loopback() {
        let mut network = SimulatedNetwork::new(SimulationConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        network.isolate(3);
        for other in 0..3 {
            assert!(network.should_deliver(3, other, &mut rng).is_none());
            assert!(network.should_deliver(other, 3, &mut rng).is_none());
        }
        assert!(network.should_deliver(3, 3, &mut rng).is_some());
        assert!(network.should_deliver(0, 1, &mut rng).is_some());

        network.heal(3);
        assert!(network.should_deliver(0, 3, &mut rng).is_some());
    }

    #[test]
    fn latency_is_deterministic_per_seed() {
        let network = SimulatedNetwork::new(SimulationConfig::default());
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..32 {
            assert_eq!(
                network.sample_latency(&mut rng1),
                network.sample_latency(&mut rng2)
            );
        }
    }

    #[test]
    fn full_packet_loss_drops_everything_but_loopback() {
        let network = SimulatedNetwork::new(SimulationConfig {
            packet_loss_rate: 1.0,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..10 {
            assert!(network.should_deliver(0, 1, &mut rng).is_none());
        }
        assert!(network.should_deliver(2, 2, &mut rng).is_some());
    }
}
