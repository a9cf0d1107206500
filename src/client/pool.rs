//! Per-node connection pools
//!
//! Each known node gets one `NodePool`, tagged with the role it serves.
//! Borrowed connections come back automatically when the
//! `PooledConnection` guard drops, unless they broke while in use.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::connection::{NodeConnection, NodeConnectionExt};
use crate::cluster::{NodeAddress, NodeRole};
use crate::utils::{ConnectionError, Result};

/// Opens new connections to a node
///
/// `ConnectionFactory` is the production implementation.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &NodeAddress) -> Result<Box<dyn NodeConnection>>;
}

/// Pool of idle connections to one node
pub struct NodePool {
    address: NodeAddress,
    role: NodeRole,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn NodeConnection>>>,
    max_idle: usize,
    destroyed: AtomicBool,
}

impl NodePool {
    pub fn new(
        address: NodeAddress,
        role: NodeRole,
        connector: Arc<dyn Connector>,
        max_idle: usize,
    ) -> Self {
        Self {
            address,
            role,
            connector,
            idle: Mutex::new(Vec::new()),
            max_idle,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Borrow a connection, reusing an idle one when available
    pub fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_destroyed() {
            return Err(ConnectionError::Closed(self.address.key()).into());
        }

        let reused = {
            let mut idle = self.idle.lock();
            // Drop anything that broke while idle
            idle.retain(|c| !c.is_broken());
            idle.pop()
        };

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let mut conn = self.connector.connect(&self.address)?;
                // Replicas only serve reads once told to
                if !self.role.is_master() {
                    conn.execute(b"READONLY", &[])?;
                }
                conn
            }
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
        })
    }

    fn release(&self, mut conn: Box<dyn NodeConnection>) {
        if conn.is_broken() || self.is_destroyed() {
            conn.close();
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        } else {
            drop(idle);
            conn.close();
        }
    }

    /// Close every idle connection and refuse further borrows
    ///
    /// Connections currently borrowed are closed when returned.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for mut conn in drained {
            conn.close();
        }
        debug!("Destroyed {:?} pool for {}", self.role, self.address);
    }
}

impl fmt::Debug for NodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("address", &self.address)
            .field("role", &self.role)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Connection borrowed from a `NodePool`
///
/// Returned to the pool on drop; a broken connection is closed instead.
pub struct PooledConnection {
    pool: Arc<NodePool>,
    conn: Option<Box<dyn NodeConnection>>,
}

impl PooledConnection {
    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Close the connection instead of returning it
    pub fn discard(mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn NodeConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
