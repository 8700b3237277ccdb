//! SCP connection dispatcher
//!
//! Accepts connections, negotiates an association on each and serves it in
//! its own task until release. The accept loop wakes up at the configured
//! poll interval and stops once its cancellation token fires.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::association::{self, AcceptOptions, Association, Transport};
use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::pdu::AssociateRj;
use crate::provider::Providers;
use crate::services::destination::{AeDirectory, DestinationResolver, StaticDirectory};
use crate::services::scp::RequestDispatcher;

/// State shared by every connection task
struct Shared {
    config: Arc<DimseConfig>,
    accept_options: AcceptOptions,
    dispatcher: RequestDispatcher,
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::ServerTls>,
}

/// DIMSE Service Class Provider
pub struct DimseScp {
    config: Arc<DimseConfig>,
    providers: Providers,
    directory: Arc<dyn AeDirectory>,
    active_associations: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl DimseScp {
    /// Create a new SCP with the given configuration and providers
    pub fn new(config: DimseConfig, providers: Providers) -> Result<Self> {
        config.validate()?;
        let permits = config.max_associations as usize;
        Ok(Self {
            config: Arc::new(config),
            providers,
            directory: Arc::new(StaticDirectory::new()),
            active_associations: Arc::new(Semaphore::new(permits)),
            shutdown: CancellationToken::new(),
        })
    }

    /// AE title directory used to resolve C-MOVE destinations
    pub fn with_directory(mut self, directory: Arc<dyn AeDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Token that stops the accept loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of associations being served right now
    pub fn active_associations(&self) -> usize {
        (self.config.max_associations as usize).saturating_sub(self.active_associations.available_permits())
    }

    /// Start the SCP listener on the configured address
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("Starting DIMSE SCP on {} (AET: {})", local_addr, self.config.local_aet);

        let shared = Arc::new(self.shared(local_addr)?);
        let poll = self.config.accept_poll_interval();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = tokio::time::timeout(poll, listener.accept()) => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Err(_) => continue,
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", peer_addr);
            association::apply_socket_buffers(
                &stream,
                Some(self.config.receive_buffer_size),
                self.config.send_buffer_size,
            );

            let span = info_span!("association", peer = %peer_addr);
            match self.active_associations.clone().try_acquire_owned() {
                Ok(permit) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_connection(&shared, stream, peer_addr).await {
                                match e {
                                    DimseError::AssociationRejected { .. } => info!("association rejected: {}", e),
                                    _ => error!("Error handling association from {}: {}", peer_addr, e),
                                }
                            }
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(_) => {
                    warn!(
                        "Maximum associations ({}) reached, rejecting connection from {}",
                        self.config.max_associations, peer_addr
                    );
                    let timeout = self.config.handshake_timeout();
                    tokio::spawn(
                        async move {
                            if let Err(e) =
                                Association::refuse(stream, peer_addr, AssociateRj::local_limit_exceeded(), timeout).await
                            {
                                debug!("refusing {}: {}", peer_addr, e);
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }

        info!("DIMSE SCP on {} stopped", local_addr);
        Ok(())
    }

    fn shared(&self, local_addr: SocketAddr) -> Result<Shared> {
        let host = match local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let mut local_node = RemoteNode::new(&self.config.local_aet, host.to_string(), local_addr.port());
        local_node.use_tls = self.config.tls_enabled();
        let resolver = DestinationResolver::new(Arc::clone(&self.directory), &self.config.local_aet)
            .with_local_node(local_node)
            .with_fallback_ports(self.config.move_fallback_ports.clone());

        #[cfg(feature = "tls")]
        let tls = match &self.config.tls {
            Some(settings) if settings.enabled => Some(crate::tls::ServerTls::from_settings(settings)?),
            _ => None,
        };
        #[cfg(not(feature = "tls"))]
        if self.config.tls_enabled() {
            return Err(DimseError::NotSupported("TLS listeners require feature 'tls'".into()));
        }

        Ok(Shared {
            config: Arc::clone(&self.config),
            accept_options: self.config.accept_options(),
            dispatcher: RequestDispatcher::new(Arc::clone(&self.config), self.providers.clone(), resolver),
            #[cfg(feature = "tls")]
            tls,
        })
    }
}

async fn handle_connection(shared: &Shared, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    #[cfg(feature = "tls")]
    if let Some(tls) = &shared.tls {
        let stream = tls.accept(stream).await?;
        return serve_association(shared, stream, peer_addr).await;
    }
    serve_association(shared, stream, peer_addr).await
}

async fn serve_association<S>(shared: &Shared, stream: S, peer_addr: SocketAddr) -> Result<()>
where
    S: Transport + 'static,
{
    let mut assoc = Association::accept(stream, peer_addr, &shared.accept_options).await?;
    debug!(
        local_aet = %shared.config.local_aet,
        calling = %assoc.calling_ae_title(),
        "serving association"
    );
    shared.dispatcher.serve(&mut assoc).await
}
