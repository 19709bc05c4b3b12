//! Hybrid ulysses x ring group construction

use crate::group::{LocalProcessGroup, ProcessGroup};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uniseq_types::{HybridParallelConfig, Result};

/// Group handles of one global rank
#[derive(Clone)]
pub struct HybridGroups {
    /// Rank in the whole world
    pub global_rank: usize,
    /// Head-sharding (all-to-all) group
    pub ulysses: Arc<dyn ProcessGroup>,
    /// Ring-sharding group
    pub ring: Arc<dyn ProcessGroup>,
}

impl HybridGroups {
    /// Groups for an unsharded single process
    pub fn single() -> Self {
        Self {
            global_rank: 0,
            ulysses: Arc::new(LocalProcessGroup::solo()),
            ring: Arc::new(LocalProcessGroup::solo()),
        }
    }

    /// Head-sharding group size
    pub fn ulysses_size(&self) -> usize {
        self.ulysses.world_size()
    }

    /// Ring group size
    pub fn ring_size(&self) -> usize {
        self.ring.world_size()
    }
}

/// Builder of in-process hybrid topologies
pub struct HybridTopology;

impl HybridTopology {
    /// Create the group handles of every global rank, indexed by global rank
    pub fn build(config: HybridParallelConfig) -> Result<Vec<HybridGroups>> {
        Self::build_with_timeout(config, None)
    }

    /// Same as [`build`](Self::build), failing receives after `timeout`
    pub fn build_with_timeout(
        config: HybridParallelConfig,
        timeout: Option<Duration>,
    ) -> Result<Vec<HybridGroups>> {
        let config = HybridParallelConfig::new(config.ulysses_degree, config.ring_degree)?;
        let with_timeout = |g: LocalProcessGroup| match timeout {
            Some(t) => g.with_recv_timeout(t),
            None => g,
        };

        // One ulysses group per ring position, one ring group per ulysses position
        let ulysses_sets = (0..config.ring_degree)
            .map(|_| LocalProcessGroup::new_group(config.ulysses_degree))
            .collect::<Result<Vec<_>>>()?;
        let ring_sets = (0..config.ulysses_degree)
            .map(|_| LocalProcessGroup::new_group(config.ring_degree))
            .collect::<Result<Vec<_>>>()?;

        let mut groups = Vec::with_capacity(config.world_size());
        for global_rank in 0..config.world_size() {
            let u = config.ulysses_rank(global_rank);
            let r = config.ring_rank(global_rank);
            let ulysses = with_timeout(ulysses_sets[r][u].clone());
            let ring = with_timeout(ring_sets[u][r].clone());
            groups.push(HybridGroups {
                global_rank,
                ulysses: Arc::new(ulysses),
                ring: Arc::new(ring),
            });
        }

        info!(
            "Built hybrid topology: ulysses {} x ring {} = {} ranks",
            config.ulysses_degree,
            config.ring_degree,
            config.world_size()
        );
        Ok(groups)
    }
}
