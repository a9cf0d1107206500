//! Slot routing table
//!
//! `TopologyCache` is the single source of truth for which node serves
//! which slot. Four maps (master/replica nodes, master/replica slots) live
//! together in one `SlotTable` behind one reader/writer lock; they are only
//! ever replaced or edited as a consistent set while the write lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::node::{check_slot_coverage, parse_cluster_slots, NodeAddress, NodeRole, SlotRange};
use super::slot::SLOT_COUNT;
use crate::client::{Connector, NodeConnection, NodeConnectionExt, NodePool};
use crate::config::{PoolConfig, ReadPreference};
use crate::utils::{ClusterError, Result};

/// The routing maps guarded by the cache lock
pub struct SlotTable {
    master_nodes: HashMap<String, Arc<NodePool>>,
    master_slots: Vec<Option<Arc<NodePool>>>,
    replica_nodes: HashMap<String, Arc<NodePool>>,
    replica_slots: Vec<Vec<Arc<NodePool>>>,
    discovering: bool,
}

impl SlotTable {
    fn new() -> Self {
        Self {
            master_nodes: HashMap::new(),
            master_slots: vec![None; SLOT_COUNT],
            replica_nodes: HashMap::new(),
            replica_slots: vec![Vec::new(); SLOT_COUNT],
            discovering: false,
        }
    }

    fn nodes(&self, role: NodeRole) -> &HashMap<String, Arc<NodePool>> {
        match role {
            NodeRole::Master => &self.master_nodes,
            NodeRole::Replica => &self.replica_nodes,
        }
    }

    fn nodes_mut(&mut self, role: NodeRole) -> &mut HashMap<String, Arc<NodePool>> {
        match role {
            NodeRole::Master => &mut self.master_nodes,
            NodeRole::Replica => &mut self.replica_nodes,
        }
    }

    /// Remove every slot reference to `pool`
    fn purge_slots(&mut self, pool: &Arc<NodePool>) {
        for entry in self.master_slots.iter_mut() {
            if entry.as_ref().map_or(false, |p| Arc::ptr_eq(p, pool)) {
                *entry = None;
            }
        }
        for replicas in self.replica_slots.iter_mut() {
            replicas.retain(|p| !Arc::ptr_eq(p, pool));
        }
    }

    fn all_pools(&self) -> impl Iterator<Item = &Arc<NodePool>> {
        self.master_nodes.values().chain(self.replica_nodes.values())
    }
}

/// Clears the discovery flag when dropped
struct DiscoveryGuard<'a> {
    cache: &'a TopologyCache,
}

impl Drop for DiscoveryGuard<'_> {
    fn drop(&mut self) {
        self.cache.state.write().discovering = false;
    }
}

/// Thread-safe slot → node routing table
pub struct TopologyCache {
    state: RwLock<SlotTable>,
    connector: Arc<dyn Connector>,
    seeds: Vec<NodeAddress>,
    pool_config: PoolConfig,
    allow_partial_coverage: bool,
    version: AtomicU64,
    shut_down: AtomicBool,
}

impl TopologyCache {
    /// Create an empty cache; call `initialize` or `discover` to populate it
    pub fn new(seeds: Vec<NodeAddress>, connector: Arc<dyn Connector>, pool_config: PoolConfig) -> Self {
        Self {
            state: RwLock::new(SlotTable::new()),
            connector,
            seeds,
            pool_config,
            allow_partial_coverage: false,
            version: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Accept slot maps that leave some slots unassigned
    pub fn allow_partial_coverage(mut self, allow: bool) -> Self {
        self.allow_partial_coverage = allow;
        self
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Bumped on every full replacement and every single-slot repair
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Populate the cache through the first seed (in random order) that answers
    pub fn initialize(&self) -> Result<()> {
        let Some(_guard) = self.begin_discovery()? else {
            return Ok(());
        };
        let ranges = self.fetch_from_seeds()?;
        self.apply(ranges);
        Ok(())
    }

    /// Rebuild the routing table from CLUSTER SLOTS on `seed`
    ///
    /// Falls back to every known pool in random order when `seed` fails.
    /// Returns `Ok(false)` when another discovery was already running and
    /// this call coalesced into it.
    pub fn discover(&self, seed: &mut dyn NodeConnection) -> Result<bool> {
        let Some(_guard) = self.begin_discovery()? else {
            return Ok(false);
        };

        let ranges = match self.fetch_ranges(seed) {
            Ok(ranges) => ranges,
            Err(e) => {
                warn!("Failed to fetch cluster slots from {}: {}", seed.address(), e);
                self.fetch_from_known_pools()?
            }
        };
        self.apply(ranges);
        Ok(true)
    }

    /// Rebuild from known pools, then from the configured seeds
    pub fn refresh(&self) -> Result<bool> {
        let Some(_guard) = self.begin_discovery()? else {
            return Ok(false);
        };

        warn!("Cluster topology changed, refreshing slot configuration...");
        let ranges = match self.fetch_from_known_pools() {
            Ok(ranges) => ranges,
            Err(_) => self.fetch_from_seeds()?,
        };
        self.apply(ranges);
        Ok(true)
    }

    /// Point one slot at `address` without touching any other slot
    pub fn assign_slot(&self, slot: u16, address: &NodeAddress, role: NodeRole) {
        if self.is_shut_down() || slot as usize >= SLOT_COUNT {
            return;
        }
        let mut table = self.state.write();
        let pool = self.setup_node(&mut table, None, address, role);
        match role {
            NodeRole::Master => table.master_slots[slot as usize] = Some(pool),
            NodeRole::Replica => {
                let replicas = &mut table.replica_slots[slot as usize];
                if !replicas.iter().any(|p| Arc::ptr_eq(p, &pool)) {
                    replicas.push(pool);
                }
            }
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        debug!("Slot {} assigned to {} ({:?})", slot, address, role);
    }

    /// Pool serving `slot` under the given read preference
    ///
    /// Replica preferences fall back to the master when the slot has no
    /// replicas. `None` means the slot has no owner yet.
    pub fn pool_for_slot(&self, slot: u16, preference: ReadPreference) -> Option<Arc<NodePool>> {
        let table = self.state.read();
        let master = table.master_slots.get(slot as usize)?.clone();
        let replicas = &table.replica_slots[slot as usize];

        match preference {
            ReadPreference::Master => master,
            ReadPreference::Replica if !replicas.is_empty() => {
                Some(Arc::clone(&replicas[fastrand::usize(..replicas.len())]))
            }
            ReadPreference::Replica => master,
            ReadPreference::Either => {
                let candidates = replicas.len() + usize::from(master.is_some());
                if candidates == 0 {
                    return None;
                }
                let pick = fastrand::usize(..candidates);
                if pick < replicas.len() {
                    Some(Arc::clone(&replicas[pick]))
                } else {
                    master
                }
            }
        }
    }

    /// Master address for a slot, if known
    pub fn slot_owner(&self, slot: u16) -> Option<NodeAddress> {
        self.pool_for_slot(slot, ReadPreference::Master)
            .map(|pool| pool.address().clone())
    }

    /// Pool for a specific node, created (as a master) if unknown
    ///
    /// Only the node maps may gain an entry; no slot is re-pointed.
    pub fn node_pool(&self, address: &NodeAddress) -> Result<Arc<NodePool>> {
        if self.is_shut_down() {
            return Err(ClusterError::Shutdown.into());
        }
        let key = address.key();
        {
            let table = self.state.read();
            if let Some(pool) = table
                .master_nodes
                .get(&key)
                .or_else(|| table.replica_nodes.get(&key))
            {
                return Ok(Arc::clone(pool));
            }
        }
        let mut table = self.state.write();
        Ok(self.setup_node(&mut table, None, address, NodeRole::Master))
    }

    /// Forget a node: slots pointing at it are cleared before its pools are destroyed
    pub fn remove_node(&self, address: &NodeAddress) -> bool {
        let key = address.key();
        let removed: Vec<Arc<NodePool>> = {
            let mut table = self.state.write();
            let removed: Vec<_> = [NodeRole::Master, NodeRole::Replica]
                .into_iter()
                .filter_map(|role| table.nodes_mut(role).remove(&key))
                .collect();
            for pool in &removed {
                table.purge_slots(pool);
            }
            if !removed.is_empty() {
                self.version.fetch_add(1, Ordering::AcqRel);
            }
            removed
        };

        for pool in &removed {
            pool.destroy();
        }
        if !removed.is_empty() {
            info!("Removed node {} from cluster topology", address);
        }
        !removed.is_empty()
    }

    /// Addresses of known nodes serving the given preference
    pub fn nodes(&self, preference: ReadPreference) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = self
            .pools(preference)
            .iter()
            .map(|p| p.address().clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    /// Known pools in random order
    pub fn shuffled_pools(&self, preference: ReadPreference) -> Vec<Arc<NodePool>> {
        let mut pools = self.pools(preference);
        fastrand::shuffle(&mut pools);
        pools
    }

    /// Contiguous runs of slots with the same master, in slot order
    pub fn slot_ranges(&self) -> Vec<SlotRange> {
        let table = self.state.read();
        let mut ranges: Vec<SlotRange> = Vec::new();
        for (slot, entry) in table.master_slots.iter().enumerate() {
            let Some(pool) = entry else { continue };
            let slot = slot as u16;
            match ranges.last_mut() {
                Some(last) if last.end + 1 == slot && &last.master == pool.address() => {
                    last.end = slot;
                }
                _ => {
                    let mut replicas: Vec<NodeAddress> = table.replica_slots[slot as usize]
                        .iter()
                        .map(|p| p.address().clone())
                        .collect();
                    replicas.sort();
                    ranges.push(SlotRange {
                        start: slot,
                        end: slot,
                        master: pool.address().clone(),
                        replicas,
                    });
                }
            }
        }
        ranges
    }

    /// Destroy every pool; lookups return nothing afterwards
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let old = {
            let mut table = self.state.write();
            let discovering = table.discovering;
            let mut old = std::mem::replace(&mut *table, SlotTable::new());
            table.discovering = discovering;
            old.master_slots.clear();
            old.replica_slots.clear();
            old
        };
        for pool in old.all_pools() {
            pool.destroy();
        }
        info!("Cluster topology cache shut down");
    }

    fn pools(&self, preference: ReadPreference) -> Vec<Arc<NodePool>> {
        let table = self.state.read();
        match preference {
            ReadPreference::Master => table.master_nodes.values().cloned().collect(),
            ReadPreference::Replica => table.replica_nodes.values().cloned().collect(),
            ReadPreference::Either => table.all_pools().cloned().collect(),
        }
    }

    /// Set the discovery flag under the write lock
    ///
    /// `None` when a discovery is already in flight.
    fn begin_discovery(&self) -> Result<Option<DiscoveryGuard<'_>>> {
        if self.is_shut_down() {
            return Err(ClusterError::Shutdown.into());
        }
        let mut table = self.state.write();
        if table.discovering {
            debug!("Topology discovery already in progress, coalescing");
            return Ok(None);
        }
        table.discovering = true;
        Ok(Some(DiscoveryGuard { cache: self }))
    }

    fn fetch_ranges(&self, conn: &mut dyn NodeConnection) -> Result<Vec<SlotRange>> {
        let reply = conn.cluster_slots()?;
        let ranges = parse_cluster_slots(&reply, conn.address())?;
        if self.allow_partial_coverage {
            if ranges.is_empty() {
                return Err(ClusterError::EmptySlots.into());
            }
        } else {
            check_slot_coverage(&ranges)?;
        }
        Ok(ranges)
    }

    fn fetch_from_known_pools(&self) -> Result<Vec<SlotRange>> {
        for pool in self.shuffled_pools(ReadPreference::Either) {
            let attempt = pool.get().and_then(|mut conn| self.fetch_ranges(&mut *conn));
            match attempt {
                Ok(ranges) => return Ok(ranges),
                Err(e) => warn!("Failed to fetch cluster slots from {}: {}", pool.address(), e),
            }
        }
        Err(ClusterError::NoReachableNode.into())
    }

    fn fetch_from_seeds(&self) -> Result<Vec<SlotRange>> {
        let mut seeds = self.seeds.clone();
        fastrand::shuffle(&mut seeds);

        for seed in &seeds {
            let attempt = self
                .connector
                .connect(seed)
                .and_then(|mut conn| self.fetch_ranges(&mut *conn));
            match attempt {
                Ok(ranges) => return Ok(ranges),
                Err(e) => warn!("Failed to fetch cluster slots from seed {}: {}", seed, e),
            }
        }
        Err(ClusterError::NoReachableNode.into())
    }

    /// Get-or-create the pool for `address` in `table`'s node map for `role`
    ///
    /// Takes the already-held write guard's table so callers never
    /// re-acquire the lock. `previous` lets a rebuild reuse live pools.
    fn setup_node(
        &self,
        table: &mut SlotTable,
        previous: Option<&SlotTable>,
        address: &NodeAddress,
        role: NodeRole,
    ) -> Arc<NodePool> {
        let key = address.key();
        if let Some(pool) = table.nodes(role).get(&key) {
            return Arc::clone(pool);
        }

        let reused = previous
            .and_then(|prev| prev.nodes(role).get(&key))
            .filter(|pool| !pool.is_destroyed())
            .cloned();
        let pool = reused.unwrap_or_else(|| {
            Arc::new(NodePool::new(
                address.clone(),
                role,
                Arc::clone(&self.connector),
                self.pool_config.max_idle,
            ))
        });
        table.nodes_mut(role).insert(key, Arc::clone(&pool));
        pool
    }

    /// Swap in a table built from `ranges`, then destroy pools nobody references
    fn apply(&self, ranges: Vec<SlotRange>) {
        let dead: Vec<Arc<NodePool>> = {
            let mut table = self.state.write();
            let mut next = SlotTable::new();
            next.discovering = table.discovering;

            for range in &ranges {
                let master = self.setup_node(&mut next, Some(&*table), &range.master, NodeRole::Master);
                let replicas: Vec<Arc<NodePool>> = range
                    .replicas
                    .iter()
                    .map(|addr| self.setup_node(&mut next, Some(&*table), addr, NodeRole::Replica))
                    .collect();
                for slot in range.slots() {
                    next.master_slots[slot as usize] = Some(Arc::clone(&master));
                    next.replica_slots[slot as usize] = replicas.clone();
                }
            }

            let old = std::mem::replace(&mut *table, next);
            self.version.fetch_add(1, Ordering::AcqRel);
            info!(
                "Cluster topology refreshed: {} masters, {} replicas, {} slot ranges",
                table.master_nodes.len(),
                table.replica_nodes.len(),
                ranges.len()
            );

            // Anything in the old maps that the new maps did not adopt
            let adopted = |pool: &Arc<NodePool>| {
                table.all_pools().any(|live| Arc::ptr_eq(live, pool))
            };
            old.all_pools().filter(|p| !adopted(p)).cloned().collect()
        };

        for pool in dead {
            debug!("Pruning {:?} pool for {}", pool.role(), pool.address());
            pool.destroy();
        }
    }
}

impl Drop for TopologyCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
