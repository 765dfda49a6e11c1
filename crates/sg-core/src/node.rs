//! Node descriptors
//!
//! A node is an opaque connection target supplied by the caller's topology
//! source. Identity comparison is by value, so repeated discovery passes
//! that return the same node map to the same pooled client.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection-target descriptor for one physical node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDef {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// User to connect as
    #[serde(default)]
    pub user: String,
    /// Database name
    #[serde(default)]
    pub database: String,
}

impl NodeDef {
    /// Create a descriptor with just an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: String::new(),
            database: String::new(),
        }
    }

    /// Endpoint in `host:port` form, used for logging and identity display
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
