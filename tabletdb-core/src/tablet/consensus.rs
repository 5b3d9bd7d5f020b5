//! Local, single-replica consensus configuration

use crate::{Result, TabletError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Leader,
    Follower,
    Learner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPeer {
    pub permanent_uuid: String,
    pub role: PeerRole,
}

/// Quorum membership with a sequence number that only moves forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// -1 until the tablet is first started
    pub seqno: i64,
    pub local: bool,
    pub peers: Vec<QuorumPeer>,
}

impl QuorumConfig {
    /// Config of a freshly created tablet
    pub fn initial(local_uuid: &str) -> Self {
        Self {
            seqno: -1,
            local: true,
            peers: vec![QuorumPeer {
                permanent_uuid: local_uuid.to_string(),
                role: PeerRole::Leader,
            }],
        }
    }
}

/// Consensus for a tablet with a single local replica
///
/// Starting bumps the sequence number; config changes must carry a strictly
/// larger one. The caller persists the returned config.
pub struct LocalConsensus {
    config: Mutex<QuorumConfig>,
}

impl LocalConsensus {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    /// Mark a new start of the tablet
    pub fn start(&self) -> QuorumConfig {
        let mut config = self.config.lock();
        config.seqno += 1;
        info!("Starting local consensus with config seqno {}", config.seqno);
        config.clone()
    }

    pub fn committed_config(&self) -> QuorumConfig {
        self.config.lock().clone()
    }

    /// Install `new_config` if its seqno is newer
    pub fn change_config(&self, new_config: QuorumConfig) -> Result<QuorumConfig> {
        let mut config = self.config.lock();
        if new_config.seqno <= config.seqno {
            return Err(TabletError::InvalidConfig(format!(
                "Invalid config. Current seqno: {}, new seqno: {}",
                config.seqno, new_config.seqno
            )));
        }
        info!(
            "Changing quorum config seqno from {} to {}",
            config.seqno, new_config.seqno
        );
        *config = new_config;
        Ok(config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seqno_rules() {
        let consensus = LocalConsensus::new(QuorumConfig::initial("ts-1"));
        assert_eq!(consensus.start().seqno, 0);

        let mut stale = consensus.committed_config();
        assert!(matches!(
            consensus.change_config(stale.clone()),
            Err(TabletError::InvalidConfig(_))
        ));

        stale.seqno = 5;
        assert_eq!(consensus.change_config(stale).unwrap().seqno, 5);
        assert_eq!(consensus.start().seqno, 6);
    }
}
