//! MOVED / ASK redirect replies

use super::node::NodeAddress;
use crate::utils::RespValue;

/// Kind of cluster redirection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// MOVED: the slot has a new owner, routing must be repaired
    Moved,
    /// ASK: slot is migrating, retry once on the target after ASKING
    Ask,
}

/// Redirect information parsed from MOVED/ASK error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    /// Target slot
    pub slot: u16,
    /// Node that now serves the slot
    pub target: NodeAddress,
}

impl Redirect {
    /// Parse from error message like "MOVED 3999 127.0.0.1:7001" or "ASK 3999 127.0.0.1:7001"
    pub fn parse(error_msg: &str) -> Option<Self> {
        let mut parts = error_msg.split_whitespace();

        let kind = match parts.next()? {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };

        let slot: u16 = parts.next()?.parse().ok()?;
        if slot as usize >= super::slot::SLOT_COUNT {
            return None;
        }
        let target: NodeAddress = parts.next()?.parse().ok()?;

        Some(Self { kind, slot, target })
    }

    /// Redirect carried by a reply, if any
    pub fn from_reply(reply: &RespValue) -> Option<Self> {
        match reply {
            RespValue::Error(msg) => Self::parse(msg),
            _ => None,
        }
    }

    pub fn is_ask(&self) -> bool {
        self.kind == RedirectKind::Ask
    }
}

/// Check if CLUSTERDOWN error
pub fn is_cluster_down(error_msg: &str) -> bool {
    error_msg.starts_with("CLUSTERDOWN")
}
