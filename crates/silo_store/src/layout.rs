//! Coord-store namespace layout and the transition-node wire format.
//!
//! Layout, relative to the store root:
//! - `/rs/<server>`: ephemeral, one per live region server
//! - `/unassigned/<encoded>`: transient, present iff the region is in transition
//! - `/master`: ephemeral, held by the active master
//! - `/table/<name>`: persistent table state

use anyhow::Context;
use silo_coord::{CoordError, CoordSession};

use crate::region::{RegionState, ServerName};

pub const RS_BASE: &str = "/rs";
pub const UNASSIGNED_BASE: &str = "/unassigned";
pub const TABLE_BASE: &str = "/table";
pub const MASTER_NODE: &str = "/master";

pub fn rs_node(server: &ServerName) -> String {
    format!("{RS_BASE}/{server}")
}

pub fn unassigned_node(encoded_name: &str) -> String {
    format!("{UNASSIGNED_BASE}/{encoded_name}")
}

pub fn table_node(table: &str) -> String {
    format!("{TABLE_BASE}/{table}")
}

/// Create the persistent base nodes if absent. Both the master and region
/// servers call this at startup; whoever connects first wins the creates.
pub fn ensure_base_paths(session: &CoordSession) -> anyhow::Result<()> {
    for base in [RS_BASE, UNASSIGNED_BASE, TABLE_BASE] {
        match session.create(base, Vec::new(), false) {
            Ok(()) | Err(CoordError::NodeExists(_)) => {}
            Err(err) => return Err(err).with_context(|| format!("create base node {base}")),
        }
    }
    Ok(())
}

/// Payload of an `/unassigned/<encoded>` node: one state byte, the event
/// timestamp, and the named server (the destination for master-written
/// states, the relinquishing owner for server-written ones).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionNode {
    pub state: RegionState,
    pub server: ServerName,
    pub timestamp_ms: u64,
}

impl TransitionNode {
    pub fn new(state: RegionState, server: ServerName, timestamp_ms: u64) -> Self {
        Self {
            state,
            server,
            timestamp_ms,
        }
    }

    /// `[state u8][timestamp u64 BE][server utf8]`.
    pub fn encode(&self) -> Vec<u8> {
        let server = self.server.to_string();
        let mut out = Vec::with_capacity(9 + server.len());
        out.push(self.state.as_byte());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(server.as_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 9 {
            anyhow::bail!("transition node too short: {} bytes", data.len());
        }
        let state = RegionState::from_byte(data[0])?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[1..9]);
        let server = std::str::from_utf8(&data[9..])
            .context("transition node server name is not utf8")?
            .parse::<ServerName>()
            .context("transition node server name")?;
        Ok(Self {
            state,
            server,
            timestamp_ms: u64::from_be_bytes(ts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_node_codec_round_trips() {
        let node = TransitionNode::new(
            RegionState::Opening,
            ServerName::new("rs1", 8120, 42),
            1_690_000_000_000,
        );
        let decoded = TransitionNode::decode(&node.encode()).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(TransitionNode::decode(&[]).is_err());
        assert!(TransitionNode::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // Valid header, junk server name.
        let mut data = vec![0u8];
        data.extend_from_slice(&0u64.to_be_bytes());
        data.extend_from_slice(b"not-a-server");
        assert!(TransitionNode::decode(&data).is_err());
    }
}
