//! Move destination resolution

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::association::{Association, AssociationOptions};
use crate::config::RemoteNode;
use crate::error::{DimseError, Result};
use crate::negotiation;
use crate::services::scu;
use crate::uids;

/// Read-mostly lookup of AE titles to network addresses
#[async_trait]
pub trait AeDirectory: Send + Sync {
    async fn lookup(&self, ae_title: &str) -> Option<RemoteNode>;
}

/// Directory backed by a fixed map, built once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    nodes: HashMap<String, RemoteNode>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = RemoteNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.ae_title.clone(), n)).collect(),
        }
    }

    pub fn with_node(mut self, node: RemoteNode) -> Self {
        self.nodes.insert(node.ae_title.clone(), node);
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl AeDirectory for StaticDirectory {
    async fn lookup(&self, ae_title: &str) -> Option<RemoteNode> {
        self.nodes.get(ae_title).cloned()
    }
}

/// Resolves C-MOVE destinations.
///
/// A destination missing from the directory that names the requester
/// itself is looked for on the requester's host, trying each fallback port
/// and trusting the first one that answers a C-ECHO.
#[derive(Clone)]
pub struct DestinationResolver {
    directory: Arc<dyn AeDirectory>,
    local_aet: String,
    local_node: Option<RemoteNode>,
    fallback_ports: Vec<u16>,
    echo_timeout: Duration,
}

impl std::fmt::Debug for DestinationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationResolver")
            .field("local_aet", &self.local_aet)
            .field("fallback_ports", &self.fallback_ports)
            .finish_non_exhaustive()
    }
}

impl DestinationResolver {
    pub fn new(directory: Arc<dyn AeDirectory>, local_aet: impl Into<String>) -> Self {
        Self {
            directory,
            local_aet: local_aet.into(),
            local_node: None,
            fallback_ports: Vec::new(),
            echo_timeout: Duration::from_secs(3),
        }
    }

    /// Our own listening address, so a C-MOVE to ourselves resolves
    pub fn with_local_node(mut self, node: RemoteNode) -> Self {
        self.local_node = Some(node);
        self
    }

    pub fn with_fallback_ports(mut self, ports: Vec<u16>) -> Self {
        self.fallback_ports = ports;
        self
    }

    pub fn with_echo_timeout(mut self, timeout: Duration) -> Self {
        self.echo_timeout = timeout;
        self
    }

    pub async fn resolve(
        &self,
        destination: &str,
        requester_ae_title: &str,
        requester_addr: Option<SocketAddr>,
    ) -> Result<RemoteNode> {
        if let Some(node) = self.directory.lookup(destination).await {
            debug!(destination, address = %node.address(), "move destination found in directory");
            return Ok(node);
        }

        if let Some(node) = self.local_node.as_ref().filter(|n| n.ae_title == destination) {
            return Ok(node.clone());
        }

        if destination == requester_ae_title {
            if let Some(addr) = requester_addr {
                for &port in &self.fallback_ports {
                    let candidate = RemoteNode::new(destination, addr.ip().to_string(), port);
                    if self.answers_echo(&candidate).await {
                        info!(destination, address = %candidate.address(), "move destination found on requester host");
                        return Ok(candidate);
                    }
                }
            }
        }

        Err(DimseError::MoveDestinationUnknown(destination.to_string()))
    }

    /// Whether `node` answers a C-ECHO under its AE title.
    async fn answers_echo(&self, node: &RemoteNode) -> bool {
        let mut options = AssociationOptions::new(&self.local_aet, &node.ae_title);
        options.connect_timeout = Some(self.echo_timeout);
        options.handshake_timeout = Some(self.echo_timeout);
        let proposed = match negotiation::propose([(uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let mut assoc = match Association::open(&node.address(), &options, proposed).await {
            Ok(assoc) => assoc,
            Err(e) => {
                debug!(address = %node.address(), "C-ECHO check failed: {}", e);
                return false;
            }
        };
        let answered = matches!(
            tokio::time::timeout(self.echo_timeout, scu::echo(&mut assoc)).await,
            Ok(Ok(outcome)) if outcome.success
        );
        if assoc.is_established() {
            if answered {
                let _ = assoc.release().await;
            } else {
                assoc.abort().await;
            }
        }
        answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_lookup_wins() {
        let directory = StaticDirectory::new().with_node(RemoteNode::new("ARCHIVE", "10.0.0.7", 104));
        let resolver = DestinationResolver::new(Arc::new(directory), "NODE");
        let node = resolver.resolve("ARCHIVE", "VIEWER", None).await.unwrap();
        assert_eq!(node.address(), "10.0.0.7:104");
    }

    #[tokio::test]
    async fn test_local_node_resolves_self() {
        let resolver = DestinationResolver::new(Arc::new(StaticDirectory::new()), "NODE")
            .with_local_node(RemoteNode::new("NODE", "127.0.0.1", 11112));
        let node = resolver.resolve("NODE", "VIEWER", None).await.unwrap();
        assert_eq!(node.port, 11112);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let resolver = DestinationResolver::new(Arc::new(StaticDirectory::new()), "NODE");
        let err = resolver.resolve("NOWHERE", "VIEWER", None).await.unwrap_err();
        assert!(matches!(err, DimseError::MoveDestinationUnknown(ae) if ae == "NOWHERE"));
    }

    #[tokio::test]
    async fn test_fallback_needs_a_live_echo() {
        // Reserve a port, then free it so nothing listens there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let resolver = DestinationResolver::new(Arc::new(StaticDirectory::new()), "NODE")
            .with_fallback_ports(vec![port])
            .with_echo_timeout(Duration::from_millis(500));
        let requester: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let err = resolver.resolve("VIEWER", "VIEWER", Some(requester)).await.unwrap_err();
        assert!(matches!(err, DimseError::MoveDestinationUnknown(_)));
    }
}
