//! DICOM associations
//!
//! An [`Association`] owns its transport for its whole life. The requesting
//! side is created with [`Association::open`], the accepting side with
//! [`Association::accept`]. Once established, command and data set bytes are
//! written with [`Association::send`] and responses are consumed through a
//! [`ResponseHandler`] by [`Association::wait_for_pdata_until_done`].

pub mod state;

use std::net::SocketAddr;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::command::CommandMessage;
use crate::error::{DimseError, Result};
use crate::fragment::PdvWriter;
use crate::negotiation::{self, PresentationContext, SelectionPolicy};
use crate::pdu::{
    self, max_length_of, Abort, AssociateAc, AssociateRj, AssociateRq, Pdu, PresentationContextProposed,
    RoleSelection, UserIdentity, UserVariable, HARD_PDU_LENGTH_LIMIT, MINIMUM_MAX_PDU_LENGTH, PDV_HEADER_LENGTH,
    PROTOCOL_VERSION,
};
use crate::services::handler::ResponseHandler;
use crate::status;
use crate::uids;

pub use state::{Event, Role, State, StateMachine};

/// Byte stream an association runs over: plain TCP, TLS, or an in-memory pipe
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// How [`Association::wait_for_pdata_until_done`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The handler reported completion
    Done,
    /// The peer released the association; it is closed now
    PeerReleased,
}

/// One inbound unit while in data transfer
#[derive(Debug)]
pub enum Received {
    PData(Vec<pdu::Pdv>),
    /// The peer released; A-RELEASE-RP has already been sent
    PeerReleased,
}

/// Parameters for requesting an association
#[derive(Debug, Clone)]
pub struct AssociationOptions {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// Maximum PDU length we are willing to receive, 0 for unbounded
    pub max_pdu_length: u32,
    pub user_identity: Option<UserIdentity>,
    pub roles: Vec<RoleSelection>,
    pub connect_timeout: Option<Duration>,
    /// Bound on the wait for A-ASSOCIATE-AC. `None` keeps the lenient
    /// behaviour of waiting until the transport closes.
    pub handshake_timeout: Option<Duration>,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    /// Consecutive non-decreasing C-MOVE/C-GET pending responses tolerated
    pub stall_limit: u32,
    /// Release once the first exchange on this association completes
    pub release_when_done: bool,
    #[cfg(feature = "tls")]
    pub tls: Option<crate::tls::ClientTls>,
}

impl AssociationOptions {
    pub fn new(calling_ae_title: impl Into<String>, called_ae_title: impl Into<String>) -> Self {
        Self {
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
            max_pdu_length: pdu::DEFAULT_MAX_PDU_LENGTH,
            user_identity: None,
            roles: Vec::new(),
            connect_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: None,
            receive_buffer_size: Some(64 * 1024),
            send_buffer_size: None,
            stall_limit: status::STALL_LIMIT,
            release_when_done: false,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn with_max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    pub fn with_user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    pub fn with_role(mut self, role: RoleSelection) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_stall_limit(mut self, limit: u32) -> Self {
        self.stall_limit = limit;
        self
    }

    pub fn release_when_done(mut self, release: bool) -> Self {
        self.release_when_done = release;
        self
    }
}

/// Parameters for accepting an association
#[derive(Debug, Clone)]
pub struct AcceptOptions {
    pub ae_title: String,
    pub policy: SelectionPolicy,
    pub max_pdu_length: u32,
    /// Reject requests whose called AE title is not ours
    pub require_called_ae_title: bool,
    /// Bound on the wait for A-ASSOCIATE-RQ, `None` to wait indefinitely
    pub handshake_timeout: Option<Duration>,
}

impl AcceptOptions {
    pub fn new(ae_title: impl Into<String>, policy: SelectionPolicy) -> Self {
        Self {
            ae_title: ae_title.into(),
            policy,
            max_pdu_length: pdu::DEFAULT_MAX_PDU_LENGTH,
            require_called_ae_title: false,
            handshake_timeout: None,
        }
    }
}

/// An association with a remote application entity
pub struct Association {
    stream: Box<dyn Transport>,
    machine: StateMachine,
    peer: String,
    peer_addr: Option<SocketAddr>,
    calling_ae_title: String,
    called_ae_title: String,
    contexts: Vec<PresentationContext>,
    max_pdu_receive: u32,
    max_pdu_send: u32,
    peer_implementation_class_uid: Option<String>,
    peer_implementation_version_name: Option<String>,
    user_identity: Option<UserIdentity>,
    roles: Vec<RoleSelection>,
    stall_limit: u32,
    release_when_done: bool,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("peer", &self.peer)
            .field("role", &self.machine.role())
            .field("state", &self.machine.state())
            .field("calling_ae_title", &self.calling_ae_title)
            .field("called_ae_title", &self.called_ae_title)
            .field("contexts", &self.contexts)
            .field("max_pdu_send", &self.max_pdu_send)
            .finish()
    }
}

/// Length we may send given both sides' maximums. 0 means unbounded.
pub fn negotiated_max_pdu(ours: u32, peer: u32) -> u32 {
    let bound = |v: u32| if v == 0 { HARD_PDU_LENGTH_LIMIT } else { v.min(HARD_PDU_LENGTH_LIMIT) };
    bound(ours).min(bound(peer))
}

fn check_max_pdu(max_pdu_length: u32) -> Result<()> {
    if max_pdu_length != 0 && max_pdu_length < MINIMUM_MAX_PDU_LENGTH {
        return Err(DimseError::config(format!(
            "maximum PDU length {} is below the minimum of {}",
            max_pdu_length, MINIMUM_MAX_PDU_LENGTH
        )));
    }
    Ok(())
}

async fn with_handshake_timeout<T>(
    timeout: Option<Duration>,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DimseError::Timeout(format!("no {} within {:?}", what, limit)))?,
        None => fut.await,
    }
}

pub(crate) fn apply_socket_buffers(stream: &TcpStream, receive: Option<usize>, send: Option<usize>) {
    let sock = SockRef::from(stream);
    if let Some(size) = receive {
        if let Err(e) = sock.set_recv_buffer_size(size) {
            warn!("could not set receive buffer size to {}: {}", size, e);
        }
    }
    if let Some(size) = send {
        if let Err(e) = sock.set_send_buffer_size(size) {
            warn!("could not set send buffer size to {}: {}", size, e);
        }
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not disable Nagle: {}", e);
    }
}

impl Association {
    /// Connects to `peer` (`host:port`) and negotiates an association.
    ///
    /// Transport failures before the association is established surface as
    /// [`DimseError::ProviderAbort`] naming the peer.
    pub async fn open(
        peer: &str,
        options: &AssociationOptions,
        proposed: Vec<PresentationContextProposed>,
    ) -> Result<Self> {
        check_max_pdu(options.max_pdu_length)?;
        let provider_abort = |reason: String| DimseError::ProviderAbort { peer: peer.to_string(), reason };

        debug!("connecting to {}", peer);
        let connect = TcpStream::connect(peer);
        let tcp = match options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| provider_abort(format!("connect timed out after {:?}", limit)))?,
            None => connect.await,
        }
        .map_err(|e| provider_abort(e.to_string()))?;
        apply_socket_buffers(&tcp, options.receive_buffer_size, options.send_buffer_size);
        let peer_addr = tcp.peer_addr().ok();

        #[cfg(feature = "tls")]
        if let Some(tls) = &options.tls {
            let stream = tls.connect(tcp).await.map_err(|e| provider_abort(e.to_string()))?;
            return Self::request(Box::new(stream), peer, peer_addr, options, proposed).await;
        }

        Self::request(Box::new(tcp), peer, peer_addr, options, proposed).await
    }

    /// Runs the requesting side of the handshake over an already connected
    /// transport.
    pub async fn request(
        stream: Box<dyn Transport>,
        peer: &str,
        peer_addr: Option<SocketAddr>,
        options: &AssociationOptions,
        proposed: Vec<PresentationContextProposed>,
    ) -> Result<Self> {
        check_max_pdu(options.max_pdu_length)?;
        let mut machine = StateMachine::new(Role::Requestor);
        machine.apply(Event::ConnectRequested)?;
        machine.apply(Event::TransportConnected)?;

        let mut assoc = Association {
            stream,
            machine,
            peer: peer.to_string(),
            peer_addr,
            calling_ae_title: options.calling_ae_title.clone(),
            called_ae_title: options.called_ae_title.clone(),
            contexts: Vec::new(),
            max_pdu_receive: options.max_pdu_length,
            max_pdu_send: negotiated_max_pdu(options.max_pdu_length, 0),
            peer_implementation_class_uid: None,
            peer_implementation_version_name: None,
            user_identity: options.user_identity.clone(),
            roles: options.roles.clone(),
            stall_limit: options.stall_limit,
            release_when_done: options.release_when_done,
        };

        let mut user_variables = vec![
            UserVariable::MaxLength(options.max_pdu_length),
            UserVariable::ImplementationClassUid(uids::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariable::ImplementationVersionName(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(options.roles.iter().cloned().map(UserVariable::RoleSelection));
        if let Some(identity) = &options.user_identity {
            user_variables.push(UserVariable::UserIdentity(identity.clone()));
        }

        let rq = Pdu::AssociateRq(AssociateRq {
            protocol_version: PROTOCOL_VERSION,
            called_ae_title: options.called_ae_title.clone(),
            calling_ae_title: options.calling_ae_title.clone(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables,
        });

        let provider_abort = |e: DimseError| match e {
            DimseError::Network(io) => DimseError::ProviderAbort { peer: peer.to_string(), reason: io.to_string() },
            other => other,
        };

        pdu::write_pdu(&mut assoc.stream, &rq).await.map_err(provider_abort)?;
        let response = match with_handshake_timeout(
            options.handshake_timeout,
            "A-ASSOCIATE response",
            pdu::read_pdu(&mut assoc.stream, HARD_PDU_LENGTH_LIMIT),
        )
        .await
        {
            Ok(pdu) => pdu,
            Err(e @ DimseError::Protocol(_)) => {
                assoc.abort_with(Abort::unexpected_pdu()).await;
                return Err(e);
            }
            Err(e) => return Err(provider_abort(e)),
        };

        match response {
            Pdu::AssociateAc(ac) => {
                assoc.machine.apply(Event::AssociateAcReceived)?;
                assoc.contexts = negotiation::apply_results(&proposed, &ac.presentation_contexts)?;
                let peer_max = max_length_of(&ac.user_variables).unwrap_or(0);
                assoc.max_pdu_send = negotiated_max_pdu(options.max_pdu_length, peer_max);
                assoc.absorb_peer_variables(&ac.user_variables);
                assoc.roles = ac
                    .user_variables
                    .iter()
                    .filter_map(|v| match v {
                        UserVariable::RoleSelection(role) => Some(role.clone()),
                        _ => None,
                    })
                    .collect();

                let accepted = assoc.contexts.iter().filter(|pc| pc.is_accepted()).count();
                info!(
                    peer = %assoc.peer,
                    called = %assoc.called_ae_title,
                    accepted,
                    proposed = proposed.len(),
                    max_pdu_send = assoc.max_pdu_send,
                    "association established"
                );
                if accepted == 0 {
                    warn!(peer = %assoc.peer, "peer accepted none of the proposed presentation contexts");
                }
                Ok(assoc)
            }
            Pdu::AssociateRj(rj) => {
                assoc.machine.apply(Event::AssociateRjReceived)?;
                assoc.close().await;
                Err(DimseError::AssociationRejected {
                    result: rj.result,
                    source_id: rj.source,
                    reason: rj.reason,
                })
            }
            Pdu::Abort(abort) => {
                assoc.machine.apply(Event::AbortReceived)?;
                assoc.close().await;
                Err(DimseError::Aborted { source_id: abort.source, reason: abort.reason })
            }
            other => {
                let description = other.short_description();
                assoc.abort_with(Abort::unexpected_pdu()).await;
                Err(DimseError::protocol(format!(
                    "unexpected {} while awaiting association response",
                    description
                )))
            }
        }
    }

    /// Reads an A-ASSOCIATE-RQ from a freshly accepted transport, negotiates
    /// and answers it.
    pub async fn accept<S>(stream: S, peer_addr: SocketAddr, options: &AcceptOptions) -> Result<Self>
    where
        S: Transport + 'static,
    {
        check_max_pdu(options.max_pdu_length)?;
        let mut machine = StateMachine::new(Role::Acceptor);
        machine.apply(Event::TransportAccepted)?;

        let mut assoc = Association {
            stream: Box::new(stream),
            machine,
            peer: peer_addr.to_string(),
            peer_addr: Some(peer_addr),
            calling_ae_title: String::new(),
            called_ae_title: options.ae_title.clone(),
            contexts: Vec::new(),
            max_pdu_receive: options.max_pdu_length,
            max_pdu_send: negotiated_max_pdu(options.max_pdu_length, 0),
            peer_implementation_class_uid: None,
            peer_implementation_version_name: None,
            user_identity: None,
            roles: Vec::new(),
            stall_limit: status::STALL_LIMIT,
            release_when_done: false,
        };

        let rq = match assoc.read_associate_request(options.handshake_timeout).await? {
            Some(rq) => rq,
            None => {
                return Err(DimseError::protocol(format!(
                    "{} did not open with A-ASSOCIATE-RQ",
                    assoc.peer
                )))
            }
        };
        assoc.calling_ae_title = rq.calling_ae_title.clone();
        assoc.called_ae_title = rq.called_ae_title.clone();
        debug!(
            peer = %assoc.peer,
            calling = %rq.calling_ae_title,
            called = %rq.called_ae_title,
            contexts = rq.presentation_contexts.len(),
            "A-ASSOCIATE-RQ received"
        );

        if let Some(rj) = Self::screen_request(&rq, options) {
            return Err(assoc.send_reject(rj).await);
        }

        let contexts = options.policy.select(&rq.presentation_contexts);
        if !contexts.iter().any(|pc| pc.is_accepted()) {
            info!(peer = %assoc.peer, "no acceptable presentation context, rejecting");
            return Err(assoc.send_reject(AssociateRj::no_reason()).await);
        }

        let peer_max = max_length_of(&rq.user_variables).unwrap_or(0);
        assoc.max_pdu_send = negotiated_max_pdu(options.max_pdu_length, peer_max);
        assoc.absorb_peer_variables(&rq.user_variables);
        let requested_roles: Vec<RoleSelection> = rq
            .user_variables
            .iter()
            .filter_map(|v| match v {
                UserVariable::RoleSelection(role) => Some(role.clone()),
                _ => None,
            })
            .collect();
        assoc.roles = negotiation::negotiate_roles(&requested_roles, &contexts);

        let mut user_variables = vec![
            UserVariable::MaxLength(options.max_pdu_length),
            UserVariable::ImplementationClassUid(uids::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariable::ImplementationVersionName(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(assoc.roles.iter().cloned().map(UserVariable::RoleSelection));

        let ac = Pdu::AssociateAc(AssociateAc {
            protocol_version: PROTOCOL_VERSION,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: contexts.iter().map(PresentationContext::to_result).collect(),
            user_variables,
        });
        assoc.contexts = contexts;
        if let Err(e) = pdu::write_pdu(&mut assoc.stream, &ac).await {
            assoc.machine.apply(Event::TransportClosed)?;
            return Err(e);
        }
        assoc.machine.apply(Event::AssociateAcSent)?;

        info!(
            peer = %assoc.peer,
            calling = %assoc.calling_ae_title,
            accepted = assoc.contexts.iter().filter(|pc| pc.is_accepted()).count(),
            max_pdu_send = assoc.max_pdu_send,
            "association accepted"
        );
        Ok(assoc)
    }

    /// Reads the A-ASSOCIATE-RQ from a transport we will not serve and
    /// answers with the given rejection.
    pub async fn refuse<S>(stream: S, peer_addr: SocketAddr, rj: AssociateRj, timeout: Option<Duration>) -> Result<()>
    where
        S: Transport + 'static,
    {
        let mut machine = StateMachine::new(Role::Acceptor);
        machine.apply(Event::TransportAccepted)?;
        let mut assoc = Association {
            stream: Box::new(stream),
            machine,
            peer: peer_addr.to_string(),
            peer_addr: Some(peer_addr),
            calling_ae_title: String::new(),
            called_ae_title: String::new(),
            contexts: Vec::new(),
            max_pdu_receive: 0,
            max_pdu_send: HARD_PDU_LENGTH_LIMIT,
            peer_implementation_class_uid: None,
            peer_implementation_version_name: None,
            user_identity: None,
            roles: Vec::new(),
            stall_limit: status::STALL_LIMIT,
            release_when_done: false,
        };
        if assoc.read_associate_request(timeout).await?.is_some() {
            assoc.send_reject(rj).await;
        }
        Ok(())
    }

    async fn read_associate_request(&mut self, timeout: Option<Duration>) -> Result<Option<AssociateRq>> {
        let first = match with_handshake_timeout(
            timeout,
            "A-ASSOCIATE-RQ",
            pdu::read_pdu(&mut self.stream, HARD_PDU_LENGTH_LIMIT),
        )
        .await
        {
            Ok(pdu) => pdu,
            Err(e) => {
                if matches!(e, DimseError::Protocol(_) | DimseError::Timeout(_)) {
                    self.abort_with(Abort::unexpected_pdu()).await;
                } else {
                    let _ = self.machine.apply(Event::TransportClosed);
                }
                return Err(e);
            }
        };
        match first {
            Pdu::AssociateRq(rq) => {
                self.machine.apply(Event::AssociateRqReceived)?;
                Ok(Some(rq))
            }
            Pdu::Abort(_) => {
                self.machine.apply(Event::AbortReceived)?;
                self.close().await;
                Ok(None)
            }
            _ => {
                self.abort_with(Abort::unexpected_pdu()).await;
                Ok(None)
            }
        }
    }

    fn screen_request(rq: &AssociateRq, options: &AcceptOptions) -> Option<AssociateRj> {
        if rq.protocol_version & PROTOCOL_VERSION == 0 {
            // rejected-permanent, service-provider (ACSE), protocol version not supported
            return Some(AssociateRj { result: 1, source: 2, reason: 2 });
        }
        if rq.application_context != uids::APPLICATION_CONTEXT {
            // rejected-permanent, service-user, application context name not supported
            return Some(AssociateRj { result: 1, source: 1, reason: 2 });
        }
        if options.require_called_ae_title && rq.called_ae_title != options.ae_title {
            warn!(
                called = %rq.called_ae_title,
                expected = %options.ae_title,
                "called AE title not recognized"
            );
            return Some(AssociateRj::called_ae_not_recognized());
        }
        None
    }

    async fn send_reject(&mut self, rj: AssociateRj) -> DimseError {
        let written = pdu::write_pdu(&mut self.stream, &Pdu::AssociateRj(rj)).await;
        if let Err(e) = written {
            debug!("could not send A-ASSOCIATE-RJ: {}", e);
        }
        let _ = self.machine.apply(Event::AssociateRjSent);
        self.close().await;
        DimseError::AssociationRejected { result: rj.result, source_id: rj.source, reason: rj.reason }
    }

    fn absorb_peer_variables(&mut self, variables: &[UserVariable]) {
        for variable in variables {
            match variable {
                UserVariable::ImplementationClassUid(uid) => self.peer_implementation_class_uid = Some(uid.clone()),
                UserVariable::ImplementationVersionName(name) => {
                    self.peer_implementation_version_name = Some(name.clone())
                }
                UserVariable::UserIdentity(identity) if self.machine.role() == Role::Acceptor => {
                    debug!(user = ?identity.username_str(), kind = ?identity.identity_type, "user identity offered");
                    self.user_identity = Some(identity.clone());
                }
                _ => {}
            }
        }
    }

    /// Writes a command and/or data set on a presentation context.
    ///
    /// The command goes out as command PDVs, the data set as data PDVs,
    /// each fragmented to the negotiated maximum PDU length.
    pub async fn send(&mut self, context_id: u8, command: Option<&[u8]>, data: Option<&[u8]>) -> Result<()> {
        if !matches!(self.state(), State::DataTransfer | State::AwaitingLocalReleaseResponse) {
            return Err(DimseError::InvalidState(format!("cannot send P-DATA in {}", self.state())));
        }
        if !self.contexts.iter().any(|pc| pc.id == context_id && pc.is_accepted()) {
            return Err(DimseError::protocol(format!(
                "presentation context {} was not accepted",
                context_id
            )));
        }

        let result = self.write_fragments(context_id, command, data).await;
        if let Err(e) = result {
            return Err(self.escalate(e).await);
        }
        Ok(())
    }

    async fn write_fragments(&mut self, context_id: u8, command: Option<&[u8]>, data: Option<&[u8]>) -> Result<()> {
        let max = self.max_pdu_send;
        if let Some(bytes) = command {
            let mut writer = PdvWriter::new(&mut self.stream, context_id, true, max);
            writer.write(bytes).await?;
            let fragments = writer.close().await?;
            for _ in 0..fragments {
                self.machine.apply(Event::PDataSent)?;
            }
        }
        if let Some(bytes) = data {
            let mut writer = PdvWriter::new(&mut self.stream, context_id, false, max);
            writer.write(bytes).await?;
            let fragments = writer.close().await?;
            for _ in 0..fragments {
                self.machine.apply(Event::PDataSent)?;
            }
        }
        Ok(())
    }

    /// Encodes a command message and sends it with an optional data set.
    pub async fn send_message(&mut self, context_id: u8, command: &CommandMessage, data: Option<&[u8]>) -> Result<()> {
        let encoded = command.encode()?;
        debug!(
            context_id,
            command = command.command_field.name(),
            message_id = command.id(),
            status = ?command.status,
            data_len = ?data.map(<[u8]>::len),
            "sending DIMSE message"
        );
        self.send(context_id, Some(&encoded), data).await
    }

    /// Reads the next P-DATA-TF or handles a peer release.
    ///
    /// An A-ABORT from the peer ends the association with
    /// [`DimseError::Aborted`]; anything unexpected is answered with an
    /// A-ABORT before failing.
    pub async fn receive(&mut self) -> Result<Received> {
        loop {
            if !matches!(self.state(), State::DataTransfer | State::AwaitingReleaseResponse) {
                return Err(DimseError::InvalidState(format!("cannot receive P-DATA in {}", self.state())));
            }
            let pdu = match pdu::read_pdu(&mut self.stream, HARD_PDU_LENGTH_LIMIT).await {
                Ok(pdu) => pdu,
                Err(e) => return Err(self.escalate(e).await),
            };
            match pdu {
                Pdu::PData(values) => {
                    self.machine.apply(Event::PDataReceived)?;
                    let length: usize = values.iter().map(|v| v.data.len() + PDV_HEADER_LENGTH).sum();
                    if self.max_pdu_receive != 0 && length > self.max_pdu_receive as usize {
                        warn!(
                            peer = %self.peer,
                            length,
                            limit = self.max_pdu_receive,
                            "peer exceeded our maximum PDU length"
                        );
                    }
                    if let Some(pdv) = values
                        .iter()
                        .find(|v| !self.contexts.iter().any(|pc| pc.id == v.context_id && pc.is_accepted()))
                    {
                        let id = pdv.context_id;
                        self.abort_with(Abort::unexpected_pdu()).await;
                        return Err(DimseError::protocol(format!(
                            "P-DATA on presentation context {} that was not accepted",
                            id
                        )));
                    }
                    return Ok(Received::PData(values));
                }
                Pdu::ReleaseRq => {
                    self.machine.apply(Event::ReleaseRqReceived)?;
                    if let Err(e) = pdu::write_pdu(&mut self.stream, &Pdu::ReleaseRp).await {
                        return Err(self.escalate(e).await);
                    }
                    self.machine.apply(Event::ReleaseRpSent)?;
                    if self.state() == State::Idle {
                        info!(peer = %self.peer, "association released by peer");
                        self.close().await;
                        return Ok(Received::PeerReleased);
                    }
                }
                Pdu::Abort(abort) => {
                    self.machine.apply(Event::AbortReceived)?;
                    warn!(peer = %self.peer, source = abort.source, reason = abort.reason, "association aborted by peer");
                    self.close().await;
                    return Err(DimseError::Aborted { source_id: abort.source, reason: abort.reason });
                }
                other => {
                    let description = other.short_description();
                    self.abort_with(Abort::unexpected_pdu()).await;
                    return Err(DimseError::protocol(format!("unexpected {} in {}", description, self.state())));
                }
            }
        }
    }

    /// Feeds P-DATA to `handler` until it reports done or the peer releases.
    pub async fn wait_for_pdata_until_done(&mut self, handler: &mut dyn ResponseHandler) -> Result<WaitOutcome> {
        while !handler.is_done() {
            match self.receive().await? {
                Received::PData(values) => {
                    if let Err(e) = handler.on_pdata(values, &mut *self).await {
                        if matches!(e, DimseError::Protocol(_)) && self.is_established() {
                            self.abort_with(Abort::unexpected_pdu()).await;
                        }
                        return Err(e);
                    }
                }
                Received::PeerReleased => return Ok(WaitOutcome::PeerReleased),
            }
        }
        if handler.is_to_be_released() && self.is_established() {
            if let Err(e) = self.release().await {
                warn!(peer = %self.peer, "release after final response failed: {}", e);
            }
        }
        Ok(WaitOutcome::Done)
    }

    /// Orderly release: A-RELEASE-RQ, then wait for A-RELEASE-RP.
    pub async fn release(&mut self) -> Result<()> {
        self.machine.apply(Event::ReleaseRqSent)?;
        if let Err(e) = pdu::write_pdu(&mut self.stream, &Pdu::ReleaseRq).await {
            return Err(self.escalate(e).await);
        }
        loop {
            let pdu = match pdu::read_pdu(&mut self.stream, HARD_PDU_LENGTH_LIMIT).await {
                Ok(pdu) => pdu,
                Err(e) => return Err(self.escalate(e).await),
            };
            match pdu {
                Pdu::ReleaseRp => {
                    self.machine.apply(Event::ReleaseRpReceived)?;
                    info!(peer = %self.peer, "association released");
                    self.close().await;
                    return Ok(());
                }
                Pdu::PData(values) => {
                    self.machine.apply(Event::PDataReceived)?;
                    warn!(peer = %self.peer, pdvs = values.len(), "discarding P-DATA received while releasing");
                }
                Pdu::ReleaseRq => {
                    self.machine.apply(Event::ReleaseRqReceived)?;
                    if let Err(e) = pdu::write_pdu(&mut self.stream, &Pdu::ReleaseRp).await {
                        return Err(self.escalate(e).await);
                    }
                    self.machine.apply(Event::ReleaseRpSent)?;
                }
                Pdu::Abort(abort) => {
                    self.machine.apply(Event::AbortReceived)?;
                    self.close().await;
                    return Err(DimseError::Aborted { source_id: abort.source, reason: abort.reason });
                }
                other => {
                    let description = other.short_description();
                    self.abort_with(Abort::unexpected_pdu()).await;
                    return Err(DimseError::protocol(format!("unexpected {} while releasing", description)));
                }
            }
        }
    }

    /// Aborts as service user and closes the transport.
    pub async fn abort(&mut self) {
        self.abort_with(Abort::user()).await;
    }

    async fn abort_with(&mut self, abort: Abort) {
        if self.state() != State::Idle {
            if let Err(e) = pdu::write_pdu(&mut self.stream, &Pdu::Abort(abort)).await {
                debug!("could not send A-ABORT: {}", e);
            }
            let _ = self.machine.apply(Event::AbortSent);
            info!(peer = %self.peer, source = abort.source, reason = abort.reason, "association aborted");
        }
        self.close().await;
    }

    /// Transport failures and protocol errors end the association at once.
    async fn escalate(&mut self, error: DimseError) -> DimseError {
        match &error {
            DimseError::Network(_) => {
                let _ = self.machine.apply(Event::TransportClosed);
                warn!(peer = %self.peer, "transport failure: {}", error);
                self.close().await;
            }
            DimseError::Protocol(_) => self.abort_with(Abort::unexpected_pdu()).await,
            _ => {}
        }
        error
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("transport shutdown: {}", e);
        }
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn role(&self) -> Role {
        self.machine.role()
    }

    pub fn is_established(&self) -> bool {
        self.machine.is_established()
    }

    /// `host:port` of the remote end
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    /// AE title of the remote application entity
    pub fn peer_ae_title(&self) -> &str {
        match self.role() {
            Role::Requestor => &self.called_ae_title,
            Role::Acceptor => &self.calling_ae_title,
        }
    }

    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        &self.contexts
    }

    pub fn context(&self, id: u8) -> Option<&PresentationContext> {
        self.contexts.iter().find(|pc| pc.id == id)
    }

    /// First accepted context for an abstract syntax, preferring one whose
    /// transfer syntax equals `preferred`.
    pub fn context_for(&self, abstract_syntax: &str, preferred: Option<&str>) -> Option<&PresentationContext> {
        let mut candidates = self
            .contexts
            .iter()
            .filter(|pc| pc.is_accepted() && pc.abstract_syntax == abstract_syntax);
        match preferred {
            Some(ts) => {
                let all: Vec<&PresentationContext> = candidates.collect();
                all.iter()
                    .find(|pc| pc.transfer_syntax() == Some(ts))
                    .or_else(|| all.first())
                    .copied()
            }
            None => candidates.next(),
        }
    }

    pub fn max_pdu_send(&self) -> u32 {
        self.max_pdu_send
    }

    pub fn max_pdu_receive(&self) -> u32 {
        self.max_pdu_receive
    }

    pub fn peer_implementation_class_uid(&self) -> Option<&str> {
        self.peer_implementation_class_uid.as_deref()
    }

    pub fn peer_implementation_version_name(&self) -> Option<&str> {
        self.peer_implementation_version_name.as_deref()
    }

    /// User identity offered by the requestor, on the accepting side
    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.user_identity.as_ref()
    }

    /// Role selections in effect for this association
    pub fn roles(&self) -> &[RoleSelection] {
        &self.roles
    }

    pub fn stall_limit(&self) -> u32 {
        self.stall_limit
    }

    /// Whether response handlers should release once their exchange is done
    pub fn releases_when_done(&self) -> bool {
        self.release_when_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{propose, AbstractSyntaxPolicy, TransferSyntaxPolicy};
    use crate::pdu::ResultReason;

    fn local_addr() -> SocketAddr {
        "127.0.0.1:11112".parse().unwrap()
    }

    #[test]
    fn test_negotiated_max_pdu() {
        assert_eq!(negotiated_max_pdu(16384, 0), 16384);
        assert_eq!(negotiated_max_pdu(16384, 4096), 4096);
        assert_eq!(negotiated_max_pdu(4096, 65536), 4096);
        assert_eq!(negotiated_max_pdu(0, 0), HARD_PDU_LENGTH_LIMIT);
    }

    #[tokio::test]
    async fn test_handshake_over_pipe() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let accept_options = AcceptOptions::new("ARCHIVE", SelectionPolicy::default());
        let acceptor = tokio::spawn(async move { Association::accept(server, local_addr(), &accept_options).await });

        let options = AssociationOptions::new("MODALITY", "ARCHIVE")
            .with_max_pdu_length(4096)
            .with_user_identity(UserIdentity::username("tech"));
        let proposed = propose(vec![
            (uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN, uids::EXPLICIT_VR_LITTLE_ENDIAN]),
            ("1.2.3.4", vec![uids::IMPLICIT_VR_LITTLE_ENDIAN]),
        ])
        .unwrap();
        let requestor = Association::request(Box::new(client), "pipe", None, &options, proposed)
            .await
            .unwrap();
        let acceptor = acceptor.await.unwrap().unwrap();

        assert!(requestor.is_established());
        assert!(acceptor.is_established());
        assert_eq!(acceptor.calling_ae_title(), "MODALITY");
        assert_eq!(acceptor.user_identity().and_then(UserIdentity::username_str), Some("tech"));
        assert_eq!(requestor.max_pdu_send(), 4096);
        assert_eq!(acceptor.max_pdu_send(), 4096);
        assert_eq!(
            requestor.context(1).and_then(PresentationContext::transfer_syntax),
            Some(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        );
        assert_eq!(requestor.context(3).map(|pc| pc.result), Some(ResultReason::AbstractSyntaxNotSupported));
        assert_eq!(requestor.peer_implementation_class_uid(), Some(uids::IMPLEMENTATION_CLASS_UID));
    }

    #[tokio::test]
    async fn test_reject_when_nothing_acceptable() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let policy = SelectionPolicy::new(AbstractSyntaxPolicy::StorageVerification, TransferSyntaxPolicy::AnyExplicit);
        let accept_options = AcceptOptions::new("ARCHIVE", policy);
        let acceptor = tokio::spawn(async move { Association::accept(server, local_addr(), &accept_options).await });

        let options = AssociationOptions::new("MODALITY", "ARCHIVE");
        let proposed = propose(vec![(uids::STUDY_ROOT_QR_FIND, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
        let err = Association::request(Box::new(client), "pipe", None, &options, proposed)
            .await
            .unwrap_err();
        assert!(matches!(err, DimseError::AssociationRejected { result: 1, source_id: 1, reason: 1 }));
        assert!(acceptor.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_called_ae_check() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut accept_options = AcceptOptions::new("ARCHIVE", SelectionPolicy::default());
        accept_options.require_called_ae_title = true;
        tokio::spawn(async move { Association::accept(server, local_addr(), &accept_options).await });

        let options = AssociationOptions::new("MODALITY", "SOMEONE_ELSE");
        let proposed = propose(vec![(uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
        let err = Association::request(Box::new(client), "pipe", None, &options, proposed)
            .await
            .unwrap_err();
        assert!(matches!(err, DimseError::AssociationRejected { result: 1, source_id: 1, reason: 7 }));
    }

    #[tokio::test]
    async fn test_unexpected_first_pdu_is_aborted() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let accept_options = AcceptOptions::new("ARCHIVE", SelectionPolicy::default());
        let acceptor = tokio::spawn(async move { Association::accept(server, local_addr(), &accept_options).await });

        pdu::write_pdu(&mut client, &Pdu::ReleaseRq).await.unwrap();
        let answer = pdu::read_pdu(&mut client, 1024).await.unwrap();
        assert_eq!(answer, Pdu::Abort(Abort::unexpected_pdu()));
        assert!(acceptor.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unknown_pdu_type_in_answer_is_aborted() {
        use tokio::io::AsyncWriteExt;

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(async move {
            let rq = pdu::read_pdu(&mut server, HARD_PDU_LENGTH_LIMIT).await.unwrap();
            assert!(matches!(rq, Pdu::AssociateRq(_)));
            server.write_all(&[0x09, 0, 0, 0, 0, 0]).await.unwrap();
            pdu::read_pdu(&mut server, 1024).await
        });

        let options = AssociationOptions::new("MODALITY", "ARCHIVE");
        let proposed = propose(vec![(uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
        let err = Association::request(Box::new(client), "pipe", None, &options, proposed)
            .await
            .unwrap_err();
        assert!(matches!(err, DimseError::Protocol(_)), "{:?}", err);
        assert_eq!(peer.await.unwrap().unwrap(), Pdu::Abort(Abort::unexpected_pdu()));
    }

    #[tokio::test]
    async fn test_failed_release_answer_closes_the_association() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let accept_options = AcceptOptions::new("ARCHIVE", SelectionPolicy::default());
        let acceptor = tokio::spawn(async move { Association::accept(server, local_addr(), &accept_options).await });
        let options = AssociationOptions::new("MODALITY", "ARCHIVE");
        let proposed = propose(vec![(uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
        let mut requestor = Association::request(Box::new(client), "pipe", None, &options, proposed)
            .await
            .unwrap();
        let mut acceptor = acceptor.await.unwrap().unwrap();

        // The peer asks for release and vanishes before the answer
        pdu::write_pdu(&mut requestor.stream, &Pdu::ReleaseRq).await.unwrap();
        drop(requestor);

        let err = match acceptor.receive().await {
            Ok(_) => panic!("A-RELEASE-RP should not be deliverable"),
            Err(e) => e,
        };
        assert!(matches!(err, DimseError::Network(_)), "{:?}", err);
        assert_eq!(acceptor.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_open_unreachable_is_provider_abort() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = AssociationOptions::new("MODALITY", "ARCHIVE");
        let proposed = propose(vec![(uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
        let err = Association::open(&addr.to_string(), &options, proposed).await.unwrap_err();
        match err {
            DimseError::ProviderAbort { peer, .. } => assert_eq!(peer, addr.to_string()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_round_trip() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let accept_options = AcceptOptions::new("ARCHIVE", SelectionPolicy::default());
        let acceptor = tokio::spawn(async move {
            let mut assoc = Association::accept(server, local_addr(), &accept_options).await.unwrap();
            assoc.receive().await.unwrap()
        });

        let options = AssociationOptions::new("MODALITY", "ARCHIVE");
        let proposed = propose(vec![(uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN])]).unwrap();
        let mut requestor = Association::request(Box::new(client), "pipe", None, &options, proposed)
            .await
            .unwrap();
        requestor.release().await.unwrap();
        assert_eq!(requestor.state(), State::Idle);
        assert!(matches!(acceptor.await.unwrap(), Received::PeerReleased));
    }

    #[test]
    fn test_rejects_tiny_max_pdu() {
        assert!(matches!(check_max_pdu(7), Err(DimseError::Config(_))));
        assert!(check_max_pdu(0).is_ok());
        assert!(check_max_pdu(8).is_ok());
    }
}
