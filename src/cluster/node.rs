//! Cluster node identity and CLUSTER SLOTS parsing

use std::fmt;
use std::str::FromStr;

use super::slot::SLOT_COUNT;
use crate::utils::{ClusterError, RespValue};

/// Node identity: host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Map key used by the topology cache ("host:port")
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    /// Parse "host:port"; the port is taken after the last colon so
    /// bare IPv6 hosts survive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in address '{}'", s))?;
        if host.is_empty() {
            return Err(format!("missing host in address '{}'", s));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in address '{}'", s))?;
        Ok(Self::new(host, port))
    }
}

/// Role a node pool serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Replica,
}

impl NodeRole {
    pub fn is_master(self) -> bool {
        self == NodeRole::Master
    }
}

impl From<bool> for NodeRole {
    fn from(is_master: bool) -> Self {
        if is_master {
            NodeRole::Master
        } else {
            NodeRole::Replica
        }
    }
}

/// One entry of a CLUSTER SLOTS reply
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub master: NodeAddress,
    pub replicas: Vec<NodeAddress>,
}

impl SlotRange {
    /// Iterate every slot in the (inclusive) range
    pub fn slots(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parse a CLUSTER SLOTS reply
///
/// Format per entry: `[start, end, [host, port, id?, ...], [replica...]...]`.
/// A host reported as `""` or `"?"` means "the node you asked", so
/// `queried` is substituted.
pub fn parse_cluster_slots(
    reply: &RespValue,
    queried: &NodeAddress,
) -> Result<Vec<SlotRange>, ClusterError> {
    let entries = reply.as_array().ok_or_else(|| {
        ClusterError::ParseFailed(format!("expected array, got {}", reply.type_name()))
    })?;

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let items = entry.as_array().ok_or_else(|| {
            ClusterError::ParseFailed(format!("expected slot entry array, got {}", entry.type_name()))
        })?;

        // Entries without any node are skipped
        if items.len() < 3 {
            continue;
        }

        let start = parse_slot(&items[0])?;
        let end = parse_slot(&items[1])?;
        if start > end {
            return Err(ClusterError::ParseFailed(format!(
                "slot range {}-{} is inverted",
                start, end
            )));
        }

        let master = parse_node(&items[2], queried)?;
        let mut replicas = Vec::new();
        for node in &items[3..] {
            // Empty node arrays are placeholders
            if node.as_array().map_or(false, |a| a.is_empty()) {
                continue;
            }
            replicas.push(parse_node(node, queried)?);
        }

        ranges.push(SlotRange {
            start,
            end,
            master,
            replicas,
        });
    }

    ranges.sort_by_key(|r| r.start);
    Ok(ranges)
}

/// Verify the ranges cover every slot exactly once
pub fn check_slot_coverage(ranges: &[SlotRange]) -> Result<(), ClusterError> {
    if ranges.is_empty() {
        return Err(ClusterError::EmptySlots);
    }

    let mut seen = vec![false; SLOT_COUNT];
    let mut covered = 0usize;
    let mut total = 0usize;
    for range in ranges {
        for slot in range.slots() {
            total += 1;
            if !seen[slot as usize] {
                seen[slot as usize] = true;
                covered += 1;
            }
        }
    }

    if covered != SLOT_COUNT || total != SLOT_COUNT {
        return Err(ClusterError::SlotHoles { covered });
    }
    Ok(())
}

fn parse_slot(value: &RespValue) -> Result<u16, ClusterError> {
    let slot = value
        .as_i64()
        .ok_or_else(|| ClusterError::ParseFailed(format!("invalid slot: {:?}", value)))?;
    if slot < 0 || slot as usize >= SLOT_COUNT {
        return Err(ClusterError::ParseFailed(format!("slot {} out of range", slot)));
    }
    Ok(slot as u16)
}

fn parse_node(value: &RespValue, queried: &NodeAddress) -> Result<NodeAddress, ClusterError> {
    let items = value
        .as_array()
        .filter(|items| items.len() >= 2)
        .ok_or_else(|| ClusterError::ParseFailed(format!("invalid node entry: {:?}", value)))?;

    let host = items[0]
        .as_str()
        .ok_or_else(|| ClusterError::ParseFailed(format!("invalid host: {:?}", items[0])))?;
    let port = items[1]
        .as_i64()
        .filter(|p| (0..=u16::MAX as i64).contains(p))
        .ok_or_else(|| ClusterError::ParseFailed(format!("invalid port: {:?}", items[1])))?;

    let host = if host.is_empty() || host == "?" {
        queried.host.clone()
    } else {
        host.to_string()
    };
    Ok(NodeAddress::new(host, port as u16))
}
