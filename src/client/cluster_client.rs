//! Cluster client facade
//!
//! Owns the topology cache, the shared command table and the optional
//! background watcher. Commands either run one at a time through
//! `execute` (and the command-family traits) or in batches through
//! `pipeline()`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::connection::NodeConnectionExt;
use super::pool::{Connector, NodePool, PooledConnection};
use crate::cluster::{
    is_cluster_down, slot_for_key, NodeRole, Redirect, RedirectKind, TopologyCache, TopologyEvent,
    TopologyWatcher, SLOT_COUNT,
};
use crate::config::{ClientConfig, ReadPreference};
use crate::pipeline::response::PendingReply;
use crate::pipeline::{Builder, ClusterPipeline, CommandTable, Queue, Reply, Response};
use crate::utils::{encode, ClientError, ClusterError, RespValue, Result};

/// Connected cluster client
pub struct ClusterClient {
    config: ClientConfig,
    topology: Arc<TopologyCache>,
    commands: Arc<CommandTable>,
    watcher: Option<TopologyWatcher>,
}

impl ClusterClient {
    /// Connect over TCP (or TLS) and discover the cluster from the seeds
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let factory = config.connection_factory();
        Self::with_connector(config, Arc::new(factory))
    }

    /// Connect through a custom connector
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        if config.seeds.is_empty() {
            return Err(ClientError::Config("at least one seed node is required".to_string()));
        }

        let topology = TopologyCache::new(config.seeds.clone(), connector, config.pool)
            .allow_partial_coverage(config.allow_partial_coverage);
        topology.initialize()?;
        let topology = Arc::new(topology);

        let watcher = match config.refresh_interval {
            Some(period) => Some(TopologyWatcher::spawn(Arc::clone(&topology), Some(period))?),
            None => None,
        };

        info!(
            "Connected to cluster: {} masters, {} replicas",
            topology.nodes(ReadPreference::Master).len(),
            topology.nodes(ReadPreference::Replica).len()
        );

        Ok(Self {
            config,
            topology,
            commands: Arc::new(CommandTable::standard()),
            watcher,
        })
    }

    /// Replace the command table shared with every pipeline
    pub fn with_command_table(mut self, commands: CommandTable) -> Self {
        self.commands = Arc::new(commands);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        &self.topology
    }

    pub fn command_table(&self) -> &Arc<CommandTable> {
        &self.commands
    }

    /// New empty pipeline configured like this client
    pub fn pipeline(&self) -> ClusterPipeline {
        ClusterPipeline::new(Arc::clone(&self.topology), Arc::clone(&self.commands))
            .read_preference(self.config.read_preference)
            .max_redirect_passes(self.config.max_redirect_passes)
            .blocking_timeout(self.config.blocking_timeout)
    }

    /// Hand an event to the background watcher; false when none is running
    pub fn publish(&self, event: TopologyEvent) -> bool {
        self.watcher.as_ref().is_some_and(|w| w.publish(event))
    }

    /// Run one command (name first) and return its raw reply
    ///
    /// Error replies come back as `RespValue::Error`; MOVED and ASK are
    /// followed up to the redirect budget.
    pub fn execute<A: AsRef<[u8]>>(&self, args: &[A]) -> Result<RespValue> {
        let (name, rest) = args
            .split_first()
            .ok_or_else(|| ClientError::PipelineState("empty command".to_string()))?;
        let name = name.as_ref();
        let rest: Vec<&[u8]> = rest.iter().map(|a| a.as_ref()).collect();
        let key = self.commands.key_of(name, &rest);
        self.execute_routed(name, key, &rest)
    }

    /// Stop the watcher and close every pooled connection
    pub fn close(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.topology.shutdown();
    }

    fn execute_routed(&self, name: &[u8], key: Option<&[u8]>, args: &[&[u8]]) -> Result<RespValue> {
        let spec = self.commands.spec(name);
        let slot = match key {
            Some(key) => slot_for_key(key),
            None => fastrand::u16(..SLOT_COUNT as u16),
        };
        let preference = if spec.read_only {
            self.config.read_preference
        } else {
            ReadPreference::Master
        };
        let blocking = self.commands.blocks(name, args);
        let encoded = encode(name, args);
        let passes = self.config.max_redirect_passes.max(1);

        let mut redirect: Option<Redirect> = None;
        for pass in 1..=passes {
            let pool = match &redirect {
                Some(r) => self.topology.node_pool(&r.target)?,
                None => self.pool_for_slot(slot, preference)?,
            };
            let asking = redirect.as_ref().is_some_and(Redirect::is_ask);

            let mut conn = pool.get()?;
            let reply = self.round_trip(&mut conn, &encoded, asking, blocking)?;
            drop(conn);

            // The last pass hands CLUSTERDOWN back to the caller as a reply
            if let RespValue::Error(message) = &reply {
                if is_cluster_down(message) && pass < passes {
                    warn!("Cluster down serving slot {}, refreshing topology", slot);
                    if let Err(e) = self.topology.refresh() {
                        warn!("Topology refresh failed: {}", e);
                    }
                    redirect = None;
                    continue;
                }
            }

            let Some(next) = Redirect::from_reply(&reply) else {
                return Ok(reply);
            };
            match next.kind {
                RedirectKind::Moved => {
                    debug!("Slot {} moved to {}", next.slot, next.target);
                    self.topology
                        .assign_slot(next.slot, &next.target, NodeRole::Master);
                }
                RedirectKind::Ask => debug!("Slot {} asked to {}", next.slot, next.target),
            }
            redirect = Some(next);
        }

        warn!("Giving up on slot {} after {} redirects", slot, passes);
        Err(ClusterError::TooManyRedirects { passes }.into())
    }

    fn pool_for_slot(&self, slot: u16, preference: ReadPreference) -> Result<Arc<NodePool>> {
        if let Some(pool) = self.topology.pool_for_slot(slot, preference) {
            return Ok(pool);
        }
        debug!("Slot {} has no owner, refreshing topology", slot);
        self.topology.refresh()?;
        self.topology
            .pool_for_slot(slot, preference)
            .ok_or_else(|| ClusterError::UnassignedSlot(slot).into())
    }

    fn round_trip(
        &self,
        conn: &mut PooledConnection,
        encoded: &[u8],
        asking: bool,
        blocking: bool,
    ) -> Result<RespValue> {
        if asking {
            conn.send_asking()?;
        }
        conn.send(encoded)?;
        if asking {
            conn.read_reply()?;
        }
        if blocking {
            conn.with_temporary_timeout(self.config.blocking_timeout, |c| c.read_reply())
        } else {
            conn.read_reply()
        }
    }
}

impl Queue for ClusterClient {
    fn queue<T>(&mut self, name: &[u8], key: &[u8], args: &[&[u8]], builder: Builder<T>) -> Result<Response<T>>
    where
        T: Clone + Into<Reply> + Send + 'static,
    {
        let raw = self.execute_routed(name, Some(key), args)?;
        let response = Response::new(builder);
        response.resolve(raw)?;
        Ok(response)
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        self.close();
    }
}
