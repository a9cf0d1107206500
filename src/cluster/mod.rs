//! Cluster topology and node management
//!
//! This module provides cluster support including:
//! - Slot mapping and CRC16 calculation
//! - Topology discovery via CLUSTER SLOTS
//! - MOVED/ASK redirect parsing
//! - Read-preference aware node selection
//! - Background topology refresh

pub mod node;
pub mod redirect;
pub mod slot;
pub mod topology;
pub mod watcher;

pub use node::{NodeAddress, NodeRole, SlotRange};
pub use redirect::{is_cluster_down, Redirect, RedirectKind};
pub use slot::{crc16, slot_for_key, SLOT_COUNT};
pub use topology::TopologyCache;
pub use watcher::{TopologyEvent, TopologyWatcher};
