//! Cluster-aware pipeline executor
//!
//! Commands are recorded against the topology cache: each one is routed by
//! its key, written to a per-batch connection for the owning node without
//! flushing, and handed back as a deferred `Response`. `sync()` then reads
//! replies in recording order (one read per command on its connection),
//! follows MOVED and ASK redirects by resending only the redirected
//! commands, and gives up after a bounded number of read passes.
//!
//! Failure handling within a batch:
//! - error replies (WRONGTYPE, ...) are data and reading continues
//! - an I/O failure marks that node failed for the rest of the batch
//! - a malformed frame aborts the whole batch

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::command_table::CommandTable;
use super::commands::Queue;
use super::builders;
use super::response::{Builder, PendingReply, Reply, Response};
use crate::client::{NodeConnectionExt, NodePool, PooledConnection};
use crate::cluster::{slot_for_key, NodeAddress, NodeRole, Redirect, RedirectKind, TopologyCache, SLOT_COUNT};
use crate::config::ReadPreference;
use crate::utils::{encode, ClientError, ClusterError, CommandError, RespValue, Result};

/// Read passes allowed per `sync()` before giving up on redirects
pub const DEFAULT_MAX_REDIRECT_PASSES: u32 = 20;

/// A connection opened for this batch plus the replies still owed on it
struct BatchConnection {
    conn: PooledConnection,
    unread: usize,
}

/// Routing decision waiting for its command
struct Route {
    slot: u16,
    pool: Arc<NodePool>,
}

struct PipelinedCommand {
    /// Node the command was (re)sent to
    address: NodeAddress,
    slot: u16,
    encoded: Vec<u8>,
    blocking: bool,
    /// Resend must be preceded by ASKING
    asking: bool,
    response: Box<dyn PendingReply>,
}

/// Batch of commands routed across a cluster
pub struct ClusterPipeline {
    topology: Arc<TopologyCache>,
    commands: Arc<CommandTable>,
    read_preference: ReadPreference,
    max_redirect_passes: u32,
    blocking_timeout: Option<Duration>,
    connections: HashMap<NodeAddress, BatchConnection>,
    failed: HashMap<NodeAddress, String>,
    records: Vec<PipelinedCommand>,
    route: Option<Route>,
    moved: u32,
    asked: u32,
}

impl ClusterPipeline {
    pub fn new(topology: Arc<TopologyCache>, commands: Arc<CommandTable>) -> Self {
        Self {
            topology,
            commands,
            read_preference: ReadPreference::Master,
            max_redirect_passes: DEFAULT_MAX_REDIRECT_PASSES,
            blocking_timeout: None,
            connections: HashMap::new(),
            failed: HashMap::new(),
            records: Vec::new(),
            route: None,
            moved: 0,
            asked: 0,
        }
    }

    /// Where read-only commands may be served from (writes always go to masters)
    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.read_preference = preference;
        self
    }

    pub fn max_redirect_passes(mut self, passes: u32) -> Self {
        self.max_redirect_passes = passes.max(1);
        self
    }

    /// Read timeout while waiting on blocking commands (`None` = forever)
    pub fn blocking_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    /// Commands recorded since the last sync
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// MOVED replies seen during the last `sync()`
    pub fn moved_count(&self) -> u32 {
        self.moved
    }

    /// ASK replies seen during the last `sync()`
    pub fn asked_count(&self) -> u32 {
        self.asked
    }

    /// Open the routing context for the command about to be queued
    ///
    /// Exactly one context may be open; it is consumed by `command`.
    pub fn route(&mut self, key: &[u8], read_only: bool) -> Result<u16> {
        let slot = slot_for_key(key);
        self.route_slot(slot, read_only)?;
        Ok(slot)
    }

    /// Queue a command on the open routing context
    pub fn command<T>(&mut self, name: &[u8], args: &[&[u8]], builder: Builder<T>) -> Result<Response<T>>
    where
        T: Clone + Into<Reply> + Send + 'static,
    {
        let route = self.route.take().ok_or_else(|| {
            ClientError::PipelineState("command queued without an open routing context".to_string())
        })?;

        let address = route.pool.address().clone();
        self.ensure_connection(&address, Some(route.pool))?;

        let response = Response::new(builder);
        self.records.push(PipelinedCommand {
            address,
            slot: route.slot,
            encoded: encode(name, args),
            blocking: self.commands.blocks(name, args),
            asking: false,
            response: Box::new(response.clone()),
        });
        self.deliver(self.records.len() - 1)?;
        Ok(response)
    }

    /// Queue an arbitrary command, locating its key through the command table
    ///
    /// Keyless commands go to the owner of a random slot.
    pub fn send_command(&mut self, name: &[u8], args: &[&[u8]]) -> Result<Response<RespValue>> {
        let read_only = self.commands.is_read_only(name);
        match self.commands.key_of(name, args) {
            Some(key) => {
                self.route(key, read_only)?;
            }
            None => {
                let slot = fastrand::u16(..SLOT_COUNT as u16);
                self.route_slot(slot, read_only)?;
            }
        }
        self.command(name, args, builders::raw)
    }

    /// Execute the batch; results are read from the returned `Response`s
    pub fn sync(&mut self) -> Result<()> {
        self.run().map(|_| ())
    }

    /// Execute the batch and collect every result in recording order
    ///
    /// Error replies occupy their position as `Err` values.
    pub fn sync_and_return_all(
        &mut self,
    ) -> Result<Vec<std::result::Result<Reply, CommandError>>> {
        let responses = self.run()?;
        Ok(responses.iter().map(|r| r.reply()).collect())
    }

    /// Drop everything recorded so far; pending responses resolve as aborted
    pub fn clear(&mut self) {
        for record in &self.records {
            record
                .response
                .fail(CommandError::Aborted("pipeline cleared before sync()".to_string()));
        }
        self.reset();
    }

    fn route_slot(&mut self, slot: u16, read_only: bool) -> Result<()> {
        if self.route.is_some() {
            return Err(ClientError::PipelineState(
                "routing context already open; queue its command first".to_string(),
            ));
        }

        let preference = if read_only {
            self.read_preference
        } else {
            ReadPreference::Master
        };

        let pool = match self.topology.pool_for_slot(slot, preference) {
            Some(pool) => pool,
            None => {
                debug!("Slot {} has no owner, refreshing topology", slot);
                self.topology.refresh()?;
                self.topology
                    .pool_for_slot(slot, preference)
                    .ok_or(ClusterError::UnassignedSlot(slot))?
            }
        };

        self.route = Some(Route { slot, pool });
        Ok(())
    }

    fn run(&mut self) -> Result<Vec<Box<dyn PendingReply>>> {
        self.moved = 0;
        self.asked = 0;

        let result = if self.route.is_some() {
            Err(ClientError::PipelineState(
                "sync() called with an open routing context".to_string(),
            ))
        } else {
            self.execute()
        };

        let records = std::mem::take(&mut self.records);
        if let Err(e) = &result {
            for record in &records {
                record.response.fail(CommandError::Aborted(e.to_string()));
            }
        }
        self.reset();

        result.map(|()| records.into_iter().map(|r| r.response).collect())
    }

    fn execute(&mut self) -> Result<()> {
        let mut pending: Vec<usize> = (0..self.records.len())
            .filter(|&i| !self.records[i].response.is_resolved())
            .collect();

        let mut passes = 0;
        while !pending.is_empty() {
            passes += 1;
            let retry = self.read_pass(&pending)?;
            debug!(
                "Pipeline pass {}: {} replies read, {} redirected",
                passes,
                pending.len(),
                retry.len()
            );
            if retry.is_empty() {
                break;
            }
            if passes >= self.max_redirect_passes {
                warn!(
                    "Giving up after {} passes with {} commands still redirected",
                    passes,
                    retry.len()
                );
                return Err(ClusterError::TooManyRedirects { passes }.into());
            }

            for &i in &retry {
                self.deliver(i)?;
            }
            pending = retry
                .into_iter()
                .filter(|&i| !self.records[i].response.is_resolved())
                .collect();
        }
        Ok(())
    }

    /// Read one reply for each pending command, in order
    ///
    /// Returns the commands that were redirected.
    fn read_pass(&mut self, pending: &[usize]) -> Result<Vec<usize>> {
        self.flush_all();

        let mut retry = Vec::new();
        for &i in pending {
            let address = self.records[i].address.clone();
            let reply = match self.connections.get_mut(&address) {
                Some(batch) => read_reply_for(batch, &self.records[i], self.blocking_timeout),
                None => {
                    self.fail_on_node(i, &address);
                    continue;
                }
            };

            match reply {
                Ok(value) => {
                    if self.interpret(i, value)? {
                        retry.push(i);
                    }
                }
                Err(ClientError::Protocol(e)) => {
                    error!("Aborting pipeline: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    self.mark_failed(&address, &e);
                    self.fail_on_node(i, &address);
                }
            }
        }
        Ok(retry)
    }

    /// Resolve a reply or turn it into a redirect; true when redirected
    fn interpret(&mut self, index: usize, value: RespValue) -> Result<bool> {
        let Some(redirect) = Redirect::from_reply(&value) else {
            let record = &mut self.records[index];
            record.asking = false;
            record.response.resolve(value)?;
            return Ok(false);
        };

        let record = &self.records[index];
        match redirect.kind {
            RedirectKind::Moved => {
                self.moved += 1;
                debug!(
                    "Slot {} moved from {} to {}",
                    record.slot, record.address, redirect.target
                );
                self.topology
                    .assign_slot(redirect.slot, &redirect.target, NodeRole::Master);
            }
            RedirectKind::Ask => {
                self.asked += 1;
                debug!(
                    "Slot {} asked from {} to {}",
                    record.slot, record.address, redirect.target
                );
            }
        }

        let record = &mut self.records[index];
        record.asking = redirect.is_ask();
        record.address = redirect.target;
        Ok(true)
    }

    /// Send (or resend) one recorded command to its current target
    fn deliver(&mut self, index: usize) -> Result<()> {
        let address = self.records[index].address.clone();
        if !self.ensure_connection(&address, None)? {
            self.fail_on_node(index, &address);
            return Ok(());
        }

        let sent = match self.connections.get_mut(&address) {
            Some(batch) => send_record(batch, &self.records[index]),
            None => Ok(()),
        };
        if let Err(e) = sent {
            self.mark_failed(&address, &e);
            self.fail_on_node(index, &address);
        }
        Ok(())
    }

    /// Open (or reuse) this batch's connection to `address`
    ///
    /// `Ok(false)` when the node has failed in this batch.
    fn ensure_connection(&mut self, address: &NodeAddress, pool: Option<Arc<NodePool>>) -> Result<bool> {
        if self.failed.contains_key(address) {
            return Ok(false);
        }
        if self.connections.contains_key(address) {
            return Ok(true);
        }

        let pool = match pool {
            Some(pool) => pool,
            None => self.topology.node_pool(address)?,
        };
        match pool.get() {
            Ok(conn) => {
                self.connections
                    .insert(address.clone(), BatchConnection { conn, unread: 0 });
                Ok(true)
            }
            Err(e) => {
                self.mark_failed(address, &e);
                Ok(false)
            }
        }
    }

    fn flush_all(&mut self) {
        let broken: Vec<(NodeAddress, ClientError)> = self
            .connections
            .iter_mut()
            .filter(|(_, batch)| batch.unread > 0)
            .filter_map(|(address, batch)| batch.conn.flush().err().map(|e| (address.clone(), e)))
            .collect();
        for (address, e) in broken {
            self.mark_failed(&address, &e);
        }
    }

    /// The node stays failed until the batch ends; its connection is discarded
    fn mark_failed(&mut self, address: &NodeAddress, err: &ClientError) {
        warn!("Node {} failed during pipeline: {}", address, err);
        self.failed
            .entry(address.clone())
            .or_insert_with(|| err.to_string());
        if let Some(batch) = self.connections.remove(address) {
            batch.conn.discard();
        }
    }

    fn fail_on_node(&self, index: usize, address: &NodeAddress) {
        let reason = self
            .failed
            .get(address)
            .cloned()
            .unwrap_or_else(|| format!("no connection to {}", address));
        self.records[index]
            .response
            .fail(CommandError::Connection(reason));
    }

    /// Release every batch connection; ones still owing replies are closed
    fn reset(&mut self) {
        self.records.clear();
        self.route = None;
        self.failed.clear();
        for (_, batch) in self.connections.drain() {
            if batch.unread > 0 {
                batch.conn.discard();
            }
        }
    }
}

impl Queue for ClusterPipeline {
    fn queue<T>(&mut self, name: &[u8], key: &[u8], args: &[&[u8]], builder: Builder<T>) -> Result<Response<T>>
    where
        T: Clone + Into<Reply> + Send + 'static,
    {
        let read_only = self.commands.is_read_only(name);
        self.route(key, read_only)?;
        self.command(name, args, builder)
    }
}

impl Drop for ClusterPipeline {
    fn drop(&mut self) {
        for record in &self.records {
            record
                .response
                .fail(CommandError::Aborted("pipeline dropped before sync()".to_string()));
        }
        self.reset();
    }
}

fn send_record(batch: &mut BatchConnection, record: &PipelinedCommand) -> Result<()> {
    if record.asking {
        batch.conn.send_asking()?;
        batch.unread += 1;
    }
    batch.conn.send(&record.encoded)?;
    batch.unread += 1;
    Ok(())
}

fn read_reply_for(
    batch: &mut BatchConnection,
    record: &PipelinedCommand,
    blocking_timeout: Option<Duration>,
) -> Result<RespValue> {
    if record.asking {
        // ASKING's own +OK; anything else shows up on the command itself
        batch.conn.read_reply()?;
        batch.unread = batch.unread.saturating_sub(1);
    }
    let reply = if record.blocking {
        batch
            .conn
            .with_temporary_timeout(blocking_timeout, |conn| conn.read_reply())?
    } else {
        batch.conn.read_reply()?
    };
    batch.unread = batch.unread.saturating_sub(1);
    Ok(reply)
}
