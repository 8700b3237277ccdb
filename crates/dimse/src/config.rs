//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::association::AcceptOptions;
use crate::error::{DimseError, Result};
use crate::negotiation::SelectionPolicy;
use crate::pdu::{DEFAULT_MAX_PDU_LENGTH, MINIMUM_MAX_PDU_LENGTH};
use crate::tls::TlsSettings;
use crate::DEFAULT_DIMSE_PORT;

/// Configuration for DIMSE services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU length we receive, 0 for unbounded
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Socket receive buffer in bytes
    #[serde(default = "default_receive_buffer")]
    pub receive_buffer_size: usize,

    /// Socket send buffer in bytes, OS default when unset
    #[serde(default)]
    pub send_buffer_size: Option<usize>,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How often the listener wakes up to check for shutdown
    #[serde(default = "default_accept_poll")]
    pub accept_poll_ms: u64,

    /// Bound on association negotiation. Unset waits until the transport
    /// closes.
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Reject associations addressed to another called AE title
    #[serde(default)]
    pub require_called_ae_title: bool,

    /// Presentation context selection
    #[serde(default)]
    pub policy: SelectionPolicy,

    /// Ports tried on the requester's host when a C-MOVE names the
    /// requester itself and it is not in the AE directory
    #[serde(default = "default_fallback_ports")]
    pub move_fallback_ports: Vec<u16>,

    /// Consecutive non-decreasing pending C-MOVE/C-GET responses before
    /// the requester gives up on a retrieve
    #[serde(default = "default_stall_limit")]
    pub retrieve_stall_limit: u32,

    #[serde(default = "default_true")]
    pub enable_echo: bool,

    #[serde(default = "default_true")]
    pub enable_store: bool,

    #[serde(default = "default_true")]
    pub enable_find: bool,

    #[serde(default = "default_true")]
    pub enable_move: bool,

    #[serde(default = "default_true")]
    pub enable_get: bool,

    /// TLS configuration (optional)
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Use TLS for this connection
    #[serde(default)]
    pub use_tls: bool,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    #[serde(default)]
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "DICOM_NODE".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            receive_buffer_size: default_receive_buffer(),
            send_buffer_size: None,
            connect_timeout_ms: default_connect_timeout(),
            accept_poll_ms: default_accept_poll(),
            handshake_timeout_ms: None,
            max_associations: default_max_associations(),
            require_called_ae_title: false,
            policy: SelectionPolicy::default(),
            move_fallback_ports: default_fallback_ports(),
            retrieve_stall_limit: default_stall_limit(),
            enable_echo: true,
            enable_store: true,
            enable_find: true,
            enable_move: true,
            enable_get: true,
            tls: None,
        }
    }
}

fn validate_ae_title(ae_title: &str, what: &str) -> Result<()> {
    let trimmed = ae_title.trim();
    if trimmed.is_empty() || ae_title.len() > 16 {
        return Err(DimseError::config(format!("{} AE title must be 1-16 characters", what)));
    }
    if !ae_title.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != '\\') {
        return Err(DimseError::config(format!("{} AE title '{}' contains invalid characters", what, ae_title)));
    }
    Ok(())
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Check if TLS is enabled
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }

    /// Parameters the listener accepts associations with
    pub fn accept_options(&self) -> AcceptOptions {
        let mut options = AcceptOptions::new(&self.local_aet, self.policy.clone());
        options.max_pdu_length = self.max_pdu;
        options.require_called_ae_title = self.require_called_ae_title;
        options.handshake_timeout = self.handshake_timeout();
        options
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.local_aet, "Local")?;

        if self.port == 0 {
            return Err(DimseError::config("Port must be greater than 0"));
        }

        if self.max_pdu != 0 && self.max_pdu < MINIMUM_MAX_PDU_LENGTH {
            return Err(DimseError::config(format!(
                "Max PDU size must be 0 (unbounded) or at least {} bytes",
                MINIMUM_MAX_PDU_LENGTH
            )));
        }

        if self.max_associations == 0 {
            return Err(DimseError::config("At least one association must be allowed"));
        }

        if self.retrieve_stall_limit == 0 {
            return Err(DimseError::config("Retrieve stall limit must be greater than 0"));
        }

        if self.accept_poll_ms == 0 {
            return Err(DimseError::config("Accept poll interval must be greater than 0"));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            use_tls: false,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Enable TLS for this node
    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_pdu(mut self, max_pdu: u32) -> Self {
        self.max_pdu = Some(max_pdu);
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => SocketAddr::new(IpAddr::V6(ip), self.port).to_string(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title, "Remote")?;

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        if let Some(max_pdu) = self.max_pdu {
            if max_pdu != 0 && max_pdu < MINIMUM_MAX_PDU_LENGTH {
                return Err(DimseError::config(format!(
                    "Max PDU size for {} is below {} bytes",
                    self.ae_title, MINIMUM_MAX_PDU_LENGTH
                )));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    DEFAULT_MAX_PDU_LENGTH
}

fn default_receive_buffer() -> usize {
    64 * 1024
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_accept_poll() -> u64 {
    1_000
}

fn default_fallback_ports() -> Vec<u16> {
    vec![104, DEFAULT_DIMSE_PORT]
}

fn default_max_associations() -> u32 {
    10
}

fn default_stall_limit() -> u32 {
    crate::status::STALL_LIMIT
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{AbstractSyntaxPolicy, TransferSyntaxPolicy};

    #[test]
    fn test_default_config() {
        let config = DimseConfig::default();
        assert_eq!(config.port, DEFAULT_DIMSE_PORT);
        assert_eq!(config.max_pdu, 16384);
        assert_eq!(config.receive_buffer_size, 65536);
        assert!(config.handshake_timeout().is_none());
        assert!(config.enable_echo && config.enable_store && config.enable_get);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("TEST_AET", "localhost", 11112)
            .with_tls()
            .with_timeout(10_000);

        assert_eq!(node.ae_title, "TEST_AET");
        assert_eq!(node.address(), "localhost:11112");
        assert!(node.use_tls);
        assert_eq!(node.connect_timeout_ms, Some(10_000));
        assert_eq!(RemoteNode::new("V6", "::1", 104).address(), "[::1]:104");
    }

    #[test]
    fn test_config_validation() {
        let mut config = DimseConfig::default();
        assert!(config.validate().is_ok());

        config.local_aet = "".to_string();
        assert!(config.validate().is_err());

        config.local_aet = "A".repeat(17);
        assert!(config.validate().is_err());

        config.local_aet = "NODE".to_string();
        config.max_pdu = 4;
        assert!(config.validate().is_err());

        config.max_pdu = 0;
        assert!(config.validate().is_ok());

        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: DimseConfig = toml::from_str(
            r#"
            local_aet = "ARCHIVE"
            port = 4242
            max_pdu = 0
            handshake_timeout_ms = 5000
            enable_get = false

            [policy]
            abstract_syntax = "storage_verification"
            transfer_syntax = "unencapsulated_explicit"
            "#,
        )
        .unwrap();
        assert_eq!(config.local_aet, "ARCHIVE");
        assert_eq!(config.port, 4242);
        assert_eq!(config.max_pdu, 0);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(5)));
        assert!(!config.enable_get);
        assert!(config.enable_move);
        assert_eq!(config.policy.abstract_syntax, AbstractSyntaxPolicy::StorageVerification);
        assert_eq!(config.policy.transfer_syntax, TransferSyntaxPolicy::UnencapsulatedExplicit);
        assert_eq!(config.move_fallback_ports, vec![104, 11112]);

        let options = config.accept_options();
        assert_eq!(options.ae_title, "ARCHIVE");
        assert_eq!(options.max_pdu_length, 0);
    }
}
