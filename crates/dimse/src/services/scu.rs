//! Requesting side of the composite services
//!
//! The free functions run one exchange on an association that is already
//! established. [`DimseScu`] wraps them for the common "open, run one
//! operation, release" pattern against a configured [`RemoteNode`].

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use dicom_object::InMemDicomObject;
use tracing::{debug, info, warn};

use crate::association::{Association, AssociationOptions, WaitOutcome};
use crate::command::{next_message_id, CommandMessage, Priority, SubOperations};
use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::negotiation::{self, PresentationContext};
use crate::pdu::{PresentationContextProposed, RoleSelection};
use crate::provider::StorageSink;
use crate::services::handler::{CompositeResponseHandler, IdentifierCallback, ProgressCallback};
use crate::status::{self, EchoOutcome, FindOutcome, RetrieveOutcome, ServiceKind, StoreOutcome};
use crate::transcode;
use crate::uids;

/// One instance to send with C-STORE
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax `data` is encoded in
    pub transfer_syntax: String,
    pub data: Bytes,
    pub priority: Priority,
    /// AE title and message ID of the C-MOVE this store serves
    pub move_originator: Option<(String, u16)>,
}

impl StoreRequest {
    pub fn new(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        transfer_syntax: impl Into<String>,
        data: Bytes,
    ) -> Self {
        Self {
            sop_class_uid: sop_class_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
            transfer_syntax: transfer_syntax.into(),
            data,
            priority: Priority::Medium,
            move_originator: None,
        }
    }

    pub fn with_move_originator(mut self, ae_title: impl Into<String>, message_id: u16) -> Self {
        self.move_originator = Some((ae_title.into(), message_id));
        self
    }
}

/// Transfer syntaxes offered for a data set encoded in `source`.
pub fn offered_transfer_syntaxes(source: &str) -> Vec<String> {
    let mut offered = vec![source.to_string()];
    if uids::is_native(source) {
        for ts in [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN] {
            if ts != source {
                offered.push(ts.to_string());
            }
        }
    }
    offered
}

/// Presentation contexts covering the given (SOP class, transfer syntax)
/// pairs, one context per distinct pair.
pub fn storage_proposals<'a>(
    instances: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<Vec<PresentationContextProposed>> {
    let grouped: BTreeSet<(&str, &str)> = instances.into_iter().collect();
    negotiation::propose(
        grouped
            .into_iter()
            .map(|(class, ts)| (class.to_string(), offered_transfer_syntaxes(ts))),
    )
}

fn request_pairs(requests: &[StoreRequest]) -> impl Iterator<Item = (&str, &str)> {
    requests
        .iter()
        .map(|r| (r.sop_class_uid.as_str(), r.transfer_syntax.as_str()))
}

fn default_transfer_syntaxes() -> Vec<&'static str> {
    vec![uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN]
}

fn require_context<'a>(assoc: &'a Association, abstract_syntax: &str) -> Result<&'a PresentationContext> {
    assoc.context_for(abstract_syntax, None).ok_or_else(|| {
        DimseError::NotSupported(format!("no accepted presentation context for {}", abstract_syntax))
    })
}

/// Picks the context to send a data set on: one accepting the source
/// transfer syntax, else any the data set can be converted to.
fn storage_context<'a>(assoc: &'a Association, request: &StoreRequest) -> Result<&'a PresentationContext> {
    if let Some(pc) = assoc.context_for(&request.sop_class_uid, Some(&request.transfer_syntax)) {
        if pc.transfer_syntax() == Some(request.transfer_syntax.as_str()) {
            return Ok(pc);
        }
    }
    assoc
        .presentation_contexts()
        .iter()
        .filter(|pc| pc.is_accepted() && pc.abstract_syntax == request.sop_class_uid)
        .find(|pc| {
            pc.transfer_syntax()
                .is_some_and(|ts| transcode::can_transcode(&request.transfer_syntax, ts))
        })
        .ok_or_else(|| {
            DimseError::NotSupported(format!(
                "no accepted presentation context for {} in {} or a compatible transfer syntax",
                request.sop_class_uid, request.transfer_syntax
            ))
        })
}

fn released_comment(outcome: WaitOutcome) -> Option<String> {
    match outcome {
        WaitOutcome::Done => None,
        WaitOutcome::PeerReleased => Some("association released by peer".to_string()),
    }
}

/// Sends C-ECHO-RQ and waits for the response.
pub async fn echo(assoc: &mut Association) -> Result<EchoOutcome> {
    let context_id = require_context(assoc, uids::VERIFICATION)?.id;
    let message_id = next_message_id();
    let request = CommandMessage::echo_rq(message_id, uids::VERIFICATION);
    let mut handler =
        CompositeResponseHandler::new(ServiceKind::Echo, message_id).release_after(assoc.releases_when_done());

    assoc.send_message(context_id, &request, None).await?;
    let outcome = assoc.wait_for_pdata_until_done(&mut handler).await?;

    let response = handler.final_response();
    Ok(EchoOutcome {
        status: response.and_then(|r| r.status).unwrap_or(status::UNABLE_TO_PROCESS),
        success: handler.success(),
        error_comment: response
            .and_then(|r| r.error_comment.clone())
            .or_else(|| released_comment(outcome)),
    })
}

/// Sends one instance with C-STORE.
///
/// The data set goes out unchanged when the accepted transfer syntax equals
/// its own, otherwise it is re-encoded first.
pub async fn store(assoc: &mut Association, request: &StoreRequest) -> Result<StoreOutcome> {
    let (context_id, target_ts) = {
        let pc = storage_context(assoc, request)?;
        (pc.id, pc.transfer_syntax().unwrap_or_default().to_string())
    };
    let data = transcode::transcode(request.data.clone(), &request.transfer_syntax, &target_ts)?;

    let message_id = next_message_id();
    let mut command = CommandMessage::store_rq(
        message_id,
        &request.sop_class_uid,
        &request.sop_instance_uid,
        request.priority,
    );
    if let Some((ae_title, originator_id)) = &request.move_originator {
        command = command.with_move_originator(ae_title, *originator_id);
    }
    debug!(
        sop_instance_uid = %request.sop_instance_uid,
        transfer_syntax = %target_ts,
        reencoded = matches!(data, transcode::Transcoded::Reencoded(_)),
        "sending C-STORE"
    );

    let mut handler =
        CompositeResponseHandler::new(ServiceKind::Store, message_id).release_after(assoc.releases_when_done());
    assoc.send_message(context_id, &command, Some(data.bytes())).await?;
    let outcome = assoc.wait_for_pdata_until_done(&mut handler).await?;

    let response = handler.final_response();
    Ok(StoreOutcome {
        sop_instance_uid: request.sop_instance_uid.clone(),
        status: response.and_then(|r| r.status).unwrap_or(status::UNABLE_TO_PROCESS),
        success: handler.success(),
        error_comment: response
            .and_then(|r| r.error_comment.clone())
            .or_else(|| released_comment(outcome)),
    })
}

/// Issues C-FIND and hands every matched identifier to `on_identifier`.
pub async fn find<'a>(
    assoc: &mut Association,
    sop_class_uid: &str,
    identifier: &InMemDicomObject,
    on_identifier: IdentifierCallback<'a>,
) -> Result<FindOutcome> {
    let pc = require_context(assoc, sop_class_uid)?;
    let context_id = pc.id;
    let data = transcode::write_data_set(identifier, pc.transfer_syntax().unwrap_or_default())?;

    let message_id = next_message_id();
    let request = CommandMessage::find_rq(message_id, sop_class_uid, Priority::Medium);
    let mut handler = CompositeResponseHandler::new(ServiceKind::Find, message_id)
        .on_identifier(on_identifier)
        .release_after(assoc.releases_when_done());

    assoc.send_message(context_id, &request, Some(&data)).await?;
    let outcome = assoc.wait_for_pdata_until_done(&mut handler).await?;

    let response = handler.final_response();
    Ok(FindOutcome {
        status: response.and_then(|r| r.status).unwrap_or(status::UNABLE_TO_PROCESS),
        success: handler.success(),
        matches: handler.identifiers(),
        error_comment: response
            .and_then(|r| r.error_comment.clone())
            .or_else(|| released_comment(outcome)),
    })
}

fn retrieve_outcome(handler: &CompositeResponseHandler<'_>, outcome: WaitOutcome) -> RetrieveOutcome {
    let response = handler.final_response();
    let mut counts = handler.evaluator().counts();
    let stored = handler.stored();
    if counts == SubOperations::default() && stored != SubOperations::default() {
        counts = stored;
    }
    RetrieveOutcome {
        status: response.and_then(|r| r.status).unwrap_or(status::UNABLE_TO_PROCESS),
        success: handler.success(),
        counts,
        pending_responses: handler.evaluator().pending_responses(),
        stalled: handler.stalled(),
        error_comment: response
            .and_then(|r| r.error_comment.clone())
            .or_else(|| released_comment(outcome)),
    }
}

/// A stalled peer may still be sending; the association cannot be reused.
async fn abort_if_stalled(assoc: &mut Association, outcome: &RetrieveOutcome) {
    if outcome.stalled && assoc.is_established() {
        assoc.abort().await;
    }
}

/// Issues C-MOVE asking the peer to send matching instances to `destination`.
pub async fn move_instances<'a>(
    assoc: &mut Association,
    sop_class_uid: &str,
    destination: &str,
    identifier: &InMemDicomObject,
    on_progress: Option<ProgressCallback<'a>>,
) -> Result<RetrieveOutcome> {
    let pc = require_context(assoc, sop_class_uid)?;
    let context_id = pc.id;
    let data = transcode::write_data_set(identifier, pc.transfer_syntax().unwrap_or_default())?;

    let message_id = next_message_id();
    let request = CommandMessage::move_rq(message_id, sop_class_uid, destination, Priority::Medium);
    let mut handler = CompositeResponseHandler::new(ServiceKind::Move, message_id)
        .with_stall_limit(assoc.stall_limit())
        .release_after(assoc.releases_when_done());
    if let Some(callback) = on_progress {
        handler = handler.on_progress(callback);
    }

    assoc.send_message(context_id, &request, Some(&data)).await?;
    let outcome = assoc.wait_for_pdata_until_done(&mut handler).await?;
    let outcome = retrieve_outcome(&handler, outcome);
    abort_if_stalled(assoc, &outcome).await;
    Ok(outcome)
}

/// Issues C-GET and stores the instances the peer sends back on this
/// association through `sink`.
pub async fn get<'a>(
    assoc: &mut Association,
    sop_class_uid: &str,
    identifier: &InMemDicomObject,
    sink: Arc<dyn StorageSink>,
    on_progress: Option<ProgressCallback<'a>>,
) -> Result<RetrieveOutcome> {
    let pc = require_context(assoc, sop_class_uid)?;
    let context_id = pc.id;
    let data = transcode::write_data_set(identifier, pc.transfer_syntax().unwrap_or_default())?;

    let message_id = next_message_id();
    let request = CommandMessage::get_rq(message_id, sop_class_uid, Priority::Medium);
    let mut handler = CompositeResponseHandler::new(ServiceKind::Get, message_id)
        .with_incoming_store(sink)
        .with_stall_limit(assoc.stall_limit())
        .release_after(assoc.releases_when_done());
    if let Some(callback) = on_progress {
        handler = handler.on_progress(callback);
    }

    assoc.send_message(context_id, &request, Some(&data)).await?;
    let outcome = assoc.wait_for_pdata_until_done(&mut handler).await?;
    let outcome = retrieve_outcome(&handler, outcome);
    abort_if_stalled(assoc, &outcome).await;
    Ok(outcome)
}

/// Presentation contexts and roles a C-GET requester proposes: the
/// retrieve class plus every storage class with the SCP role.
pub fn get_proposals(sop_class_uid: &str) -> Result<(Vec<PresentationContextProposed>, Vec<RoleSelection>)> {
    let proposals = std::iter::once((sop_class_uid.to_string(), default_transfer_syntaxes()))
        .chain(
            uids::STORAGE_SOP_CLASSES
                .iter()
                .map(|class| (class.to_string(), default_transfer_syntaxes())),
        );
    let roles = uids::STORAGE_SOP_CLASSES
        .iter()
        .map(|class| RoleSelection {
            sop_class_uid: class.to_string(),
            scu_role: false,
            scp_role: true,
        })
        .collect();
    Ok((negotiation::propose(proposals)?, roles))
}

/// Association parameters for talking to `node` as `config.local_aet`.
pub fn association_options(config: &DimseConfig, node: &RemoteNode) -> Result<AssociationOptions> {
    node.validate()?;
    let mut options = AssociationOptions::new(&config.local_aet, &node.ae_title)
        .with_max_pdu_length(node.max_pdu.unwrap_or(config.max_pdu));
    options.connect_timeout = Some(
        node.connect_timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or_else(|| config.connect_timeout()),
    );
    options.handshake_timeout = config.handshake_timeout();
    options.stall_limit = config.retrieve_stall_limit;
    options.receive_buffer_size = Some(config.receive_buffer_size);
    options.send_buffer_size = config.send_buffer_size;
    if node.use_tls {
        #[cfg(feature = "tls")]
        {
            let settings = config.tls.as_ref().filter(|t| t.enabled).ok_or_else(|| {
                DimseError::config(format!("{} requires TLS but no TLS settings are enabled", node.ae_title))
            })?;
            options.tls = Some(crate::tls::ClientTls::from_settings(settings, &node.host)?);
        }
        #[cfg(not(feature = "tls"))]
        return Err(DimseError::NotSupported("TLS connections require feature 'tls'".into()));
    }
    Ok(options)
}

/// DIMSE Service Class User
///
/// Each operation opens an association to the node, runs one exchange and
/// releases it again.
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    fn options(&self, node: &RemoteNode) -> Result<AssociationOptions> {
        association_options(&self.config, node)
    }

    /// Options for an association that carries exactly one exchange
    fn single_exchange_options(&self, node: &RemoteNode) -> Result<AssociationOptions> {
        Ok(self.options(node)?.release_when_done(true))
    }

    async fn open(
        &self,
        node: &RemoteNode,
        options: &AssociationOptions,
        proposed: Vec<PresentationContextProposed>,
    ) -> Result<Association> {
        info!("Opening association to {}@{}:{}", node.ae_title, node.host, node.port);
        Association::open(&node.address(), options, proposed).await
    }

    /// Releases whatever the exchange left established.
    async fn finish(assoc: &mut Association) {
        if assoc.is_established() {
            if let Err(e) = assoc.release().await {
                warn!(peer = %assoc.peer(), "release failed: {}", e);
            }
        }
    }

    /// Send a C-ECHO request to a remote node
    pub async fn echo(&self, node: &RemoteNode) -> Result<EchoOutcome> {
        let options = self.single_exchange_options(node)?;
        let proposed = negotiation::propose([(uids::VERIFICATION, default_transfer_syntaxes())])?;
        let mut assoc = self.open(node, &options, proposed).await?;
        let result = echo(&mut assoc).await;
        Self::finish(&mut assoc).await;
        result
    }

    /// Send instances with C-STORE over one association.
    ///
    /// Every instance gets its own outcome; a failed instance does not stop
    /// the others.
    pub async fn store(&self, node: &RemoteNode, requests: &[StoreRequest]) -> Result<Vec<StoreOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let options = self.options(node)?;
        let mut assoc = self.open(node, &options, storage_proposals(request_pairs(requests))?).await?;
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            match store(&mut assoc, request).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if !e.is_terminal() => {
                    warn!(sop_instance_uid = %request.sop_instance_uid, "C-STORE not attempted: {}", e);
                    outcomes.push(StoreOutcome {
                        sop_instance_uid: request.sop_instance_uid.clone(),
                        status: status::SOP_CLASS_NOT_SUPPORTED,
                        success: false,
                        error_comment: Some(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            }
            if !assoc.is_established() {
                break;
            }
        }
        Self::finish(&mut assoc).await;
        Ok(outcomes)
    }

    /// Send a C-FIND request to a remote node
    pub async fn find<'a>(
        &self,
        node: &RemoteNode,
        sop_class_uid: &str,
        identifier: &InMemDicomObject,
        on_identifier: IdentifierCallback<'a>,
    ) -> Result<FindOutcome> {
        let options = self.single_exchange_options(node)?;
        let proposed = negotiation::propose([(sop_class_uid, default_transfer_syntaxes())])?;
        let mut assoc = self.open(node, &options, proposed).await?;
        let result = find(&mut assoc, sop_class_uid, identifier, on_identifier).await;
        Self::finish(&mut assoc).await;
        result
    }

    /// Send a C-MOVE request to a remote node
    pub async fn move_request<'a>(
        &self,
        node: &RemoteNode,
        sop_class_uid: &str,
        destination: &str,
        identifier: &InMemDicomObject,
        on_progress: Option<ProgressCallback<'a>>,
    ) -> Result<RetrieveOutcome> {
        let options = self.single_exchange_options(node)?;
        let proposed = negotiation::propose([(sop_class_uid, default_transfer_syntaxes())])?;
        let mut assoc = self.open(node, &options, proposed).await?;
        let result = move_instances(&mut assoc, sop_class_uid, destination, identifier, on_progress).await;
        Self::finish(&mut assoc).await;
        result
    }

    /// Send a C-GET request to a remote node
    pub async fn get<'a>(
        &self,
        node: &RemoteNode,
        sop_class_uid: &str,
        identifier: &InMemDicomObject,
        sink: Arc<dyn StorageSink>,
        on_progress: Option<ProgressCallback<'a>>,
    ) -> Result<RetrieveOutcome> {
        let mut options = self.single_exchange_options(node)?;
        let (proposed, roles) = get_proposals(sop_class_uid)?;
        options.roles.extend(roles);
        let mut assoc = self.open(node, &options, proposed).await?;
        let result = get(&mut assoc, sop_class_uid, identifier, sink, on_progress).await;
        Self::finish(&mut assoc).await;
        result
    }
}
