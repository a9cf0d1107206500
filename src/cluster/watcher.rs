//! Background topology watcher
//!
//! A named worker thread that owns the receiving end of a channel of
//! `TopologyEvent`s and applies them to a shared `TopologyCache`. With a
//! refresh period set it also rediscovers the topology on every tick
//! without events. Stopping sends `Shutdown` and joins the thread.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::node::{NodeAddress, NodeRole};
use super::topology::TopologyCache;
use crate::utils::{ClientError, Result};

/// Change published to the watcher
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    /// Rediscover the whole topology
    Refresh,
    /// Drop a node and every slot pointing at it
    RemoveNode(NodeAddress),
    /// Repair a single slot
    AssignSlot {
        slot: u16,
        address: NodeAddress,
        role: NodeRole,
    },
    /// Stop the watcher
    Shutdown,
}

/// Handle to the watcher thread
pub struct TopologyWatcher {
    sender: Sender<TopologyEvent>,
    handle: Option<JoinHandle<()>>,
}

impl TopologyWatcher {
    /// Start watching; `period` of `None` means events only
    pub fn spawn(cache: Arc<TopologyCache>, period: Option<Duration>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("topology-watcher".to_string())
            .spawn(move || {
                debug!("Topology watcher started (period: {:?})", period);
                loop {
                    let event = match period {
                        Some(period) => match receiver.recv_timeout(period) {
                            Ok(event) => event,
                            Err(RecvTimeoutError::Timeout) => TopologyEvent::Refresh,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match receiver.recv() {
                            Ok(event) => event,
                            Err(_) => break,
                        },
                    };
                    if !apply_event(&cache, event) {
                        break;
                    }
                }
                debug!("Topology watcher stopped");
            })
            .map_err(|e| ClientError::Config(format!("Failed to spawn topology watcher: {}", e)))?;

        info!("Topology watcher running");
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Channel for publishing events to the watcher
    pub fn sender(&self) -> Sender<TopologyEvent> {
        self.sender.clone()
    }

    /// Publish one event; false if the watcher has already stopped
    pub fn publish(&self, event: TopologyEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.sender.send(TopologyEvent::Shutdown);
        if handle.join().is_err() {
            warn!("Topology watcher thread panicked");
        }
    }
}

impl Drop for TopologyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns false when the watcher should exit
fn apply_event(cache: &TopologyCache, event: TopologyEvent) -> bool {
    if cache.is_shut_down() {
        return false;
    }
    match event {
        TopologyEvent::Refresh => {
            if let Err(e) = cache.refresh() {
                warn!("Periodic topology refresh failed: {}", e);
            }
        }
        TopologyEvent::RemoveNode(address) => {
            cache.remove_node(&address);
        }
        TopologyEvent::AssignSlot {
            slot,
            address,
            role,
        } => cache.assign_slot(slot, &address, role),
        TopologyEvent::Shutdown => return false,
    }
    true
}
