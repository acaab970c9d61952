//! Process-wide configuration, collecting every default named in §5 and
//! §4.6–§4.9 into one place. A library, not a CLI, so this is a plain
//! struct with a `Default` impl rather than a `clap` parser (`clap`
//! stays a dependency only for the teacher's own binaries, none of
//! which this crate carries).

use std::time::Duration;

use crate::mesh::MeshConfig;
use crate::relay::RelayPoolConfig;
use crate::transport::TransportConfig;

#[derive(Debug, Clone)]
pub struct GunConfig {
    pub transport: TransportConfig,
    pub mesh: MeshConfig,
    pub relay_pool: RelayPoolConfig,
    pub tracker_max_history: usize,
    pub handshake_timeout: Duration,
    pub tracker_ack_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for GunConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            mesh: MeshConfig::default(),
            relay_pool: RelayPoolConfig::default(),
            tracker_max_history: 1000,
            handshake_timeout: Duration::from_secs(5),
            tracker_ack_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GunConfig::default();
        assert_eq!(config.mesh.target, 8);
        assert_eq!(config.tracker_max_history, 1000);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.query_timeout, Duration::from_secs(30));
    }
}
