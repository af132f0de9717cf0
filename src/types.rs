//! Core type definitions shared across the warden.
//!
//! # Key Types
//!
//! - [`NodeId`] = `u64`: cluster node identifier, stable across restarts
//! - [`NodeAddr`]: where a node's administrative agent listens
//! - [`Endpoint`]: the engine's published data-access connection string
//!
//! The engine-facing enums ([`crate::admin::DatabaseState`], monitor states)
//! live in the [`crate::admin`] module next to the client traits that
//! produce them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a cluster node.
pub type NodeId = u64;

/// Address of a node's administrative agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    /// Node identity.
    pub id: NodeId,
    /// Host the agent listens on.
    pub host: String,
    /// Agent port.
    pub port: u16,
    /// Index of the data disk the engine process uses on this node.
    #[serde(default)]
    pub disk_index: u32,
}

impl NodeAddr {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            disk_index: 0,
        }
    }

    /// The agent's dial string.
    pub fn agent_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}@{}:{}", self.id, self.host, self.port)
    }
}

/// The data-access connection string of a running database.
///
/// Published only once the lifecycle machine reaches its terminal running
/// phase; a partially bootstrapped database never has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint(pub String);

impl Endpoint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Endpoint(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_addr_display() {
        let addr = NodeAddr::new(3, "10.0.0.7", 1862);
        assert_eq!(addr.agent_addr(), "10.0.0.7:1862");
        assert_eq!(addr.to_string(), "node3@10.0.0.7:1862");
    }

    #[test]
    fn test_endpoint() {
        let ep = Endpoint::from("10.0.0.7:3306,10.0.0.8:3306".to_string());
        assert!(!ep.is_empty());
        assert_eq!(ep.as_str(), "10.0.0.7:3306,10.0.0.8:3306");
    }
}
