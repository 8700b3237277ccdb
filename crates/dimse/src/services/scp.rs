//! Accepting side of the composite services
//!
//! [`RequestDispatcher`] serves one established association: it reads
//! requests until the peer releases, answers each from the configured
//! providers and performs the C-STORE sub-operations of C-MOVE (on a nested
//! association to the destination) and C-GET (on the same association).

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::association::Association;
use crate::command::{CommandField, CommandMessage, SubOperations};
use crate::config::{DimseConfig, RemoteNode};
use crate::error::{DimseError, Result};
use crate::provider::{InstanceMetadata, InstanceRef, Providers, Query};
use crate::services::destination::DestinationResolver;
use crate::services::handler::{Message, MessageReader};
use crate::services::scu::{self, StoreRequest};
use crate::status;
use crate::transcode;

/// Running counters of the sub-operations of one retrieve
///
/// Counted in full; the u16 command fields are clamped only when encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    total: usize,
    completed: usize,
    failed: usize,
    warning: usize,
}

fn clamp(count: usize) -> u16 {
    u16::try_from(count).unwrap_or(u16::MAX)
}

impl Tally {
    fn new(total: usize) -> Self {
        if total > usize::from(u16::MAX) {
            warn!(total, "retrieve exceeds 65535 sub-operations, reported counters saturate");
        }
        Self { total, ..Default::default() }
    }

    fn remaining(&self) -> usize {
        self.total
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
            .saturating_sub(self.warning)
    }

    fn record(&mut self, status: Option<u16>) {
        match status {
            Some(status::SUCCESS) => self.completed += 1,
            Some(s) if status::is_store_success(s) => self.warning += 1,
            _ => self.failed += 1,
        }
    }

    fn pending(&self) -> SubOperations {
        SubOperations {
            remaining: Some(clamp(self.remaining())),
            completed: clamp(self.completed),
            failed: clamp(self.failed),
            warning: clamp(self.warning),
        }
    }

    fn last(&self) -> SubOperations {
        SubOperations { remaining: None, ..self.pending() }
    }

    /// Status of the final response once every sub-operation ran
    fn final_status(&self) -> u16 {
        if self.failed == 0 && self.warning == 0 {
            status::SUCCESS
        } else if self.completed == 0 && self.warning == 0 {
            status::OUT_OF_RESOURCES_UNABLE_TO_PERFORM_SUB_OPERATIONS
        } else {
            status::WARNING_SUB_OPERATIONS_FAILED
        }
    }
}

/// Serves composite requests on accepted associations.
#[derive(Clone)]
pub struct RequestDispatcher {
    config: Arc<DimseConfig>,
    providers: Providers,
    resolver: DestinationResolver,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("local_aet", &self.config.local_aet)
            .field("providers", &self.providers)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl RequestDispatcher {
    pub fn new(config: Arc<DimseConfig>, providers: Providers, resolver: DestinationResolver) -> Self {
        Self { config, providers, resolver }
    }

    /// Serves requests until the peer releases or the association fails.
    ///
    /// Errors that leave the association unusable abort it before they are
    /// returned.
    pub async fn serve(&self, assoc: &mut Association) -> Result<()> {
        let mut reader = MessageReader::new();
        loop {
            let message = match reader.next(assoc).await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) => {
                    if assoc.is_established() {
                        assoc.abort().await;
                    }
                    return Err(e);
                }
            };
            if let Err(e) = self.dispatch(assoc, message).await {
                if e.is_terminal() || !assoc.is_established() {
                    if assoc.is_established() {
                        assoc.abort().await;
                    }
                    return Err(e);
                }
                warn!(peer = %assoc.peer(), "request failed: {}", e);
            }
        }
    }

    async fn dispatch(&self, assoc: &mut Association, message: Message) -> Result<()> {
        let field = message.command.command_field;
        debug!(
            command = field.name(),
            message_id = message.command.id(),
            context_id = message.context_id,
            "request received"
        );
        match field {
            CommandField::CEchoRq => self.handle_echo(assoc, message).await,
            CommandField::CStoreRq => self.handle_store(assoc, message).await,
            CommandField::CFindRq => self.handle_find(assoc, message).await,
            CommandField::CMoveRq => self.handle_move(assoc, message).await,
            CommandField::CGetRq => self.handle_get(assoc, message).await,
            CommandField::CCancelRq => {
                debug!(
                    message_id = ?message.command.message_id_being_responded_to,
                    "C-CANCEL for a request that is no longer outstanding"
                );
                Ok(())
            }
            other => {
                warn!(command = other.name(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    async fn respond(
        assoc: &mut Association,
        context_id: u8,
        request: &CommandMessage,
        status: u16,
        comment: Option<String>,
    ) -> Result<()> {
        let mut response = request.response(status)?;
        if let Some(comment) = comment {
            response = response.with_error_comment(comment);
        }
        assoc.send_message(context_id, &response, None).await
    }

    async fn handle_echo(&self, assoc: &mut Association, message: Message) -> Result<()> {
        let status = if self.config.enable_echo {
            status::SUCCESS
        } else {
            status::SOP_CLASS_NOT_SUPPORTED
        };
        Self::respond(assoc, message.context_id, &message.command, status, None).await
    }

    async fn handle_store(&self, assoc: &mut Association, message: Message) -> Result<()> {
        let request = &message.command;
        let sink = match (&self.providers.storage, self.config.enable_store) {
            (Some(sink), true) => sink.clone(),
            _ => {
                return Self::respond(assoc, message.context_id, request, status::SOP_CLASS_NOT_SUPPORTED, None)
                    .await
            }
        };
        let Some(data) = message.data.clone() else {
            return Self::respond(
                assoc,
                message.context_id,
                request,
                status::UNABLE_TO_PROCESS,
                Some("C-STORE-RQ without data set".into()),
            )
            .await;
        };

        let metadata = InstanceMetadata {
            id: Uuid::new_v4(),
            sop_class_uid: request.affected_sop_class_uid.clone().unwrap_or_default(),
            sop_instance_uid: request.affected_sop_instance_uid.clone().unwrap_or_default(),
            transfer_syntax: context_transfer_syntax(assoc, message.context_id)?,
            calling_ae_title: assoc.peer_ae_title().to_string(),
            move_originator_ae_title: request.move_originator_ae_title.clone(),
            received_at: Utc::now(),
            size_bytes: data.len() as u64,
        };

        let (status, comment) = match sink.store(&metadata, data).await {
            Ok(status) => {
                info!(
                    sop_instance_uid = %metadata.sop_instance_uid,
                    sop_class_uid = %metadata.sop_class_uid,
                    calling_ae_title = %metadata.calling_ae_title,
                    bytes = metadata.size_bytes,
                    "stored instance"
                );
                (status, None)
            }
            Err(e) => {
                warn!(sop_instance_uid = %metadata.sop_instance_uid, "failed to store instance: {}", e);
                (status::OUT_OF_RESOURCES, Some(e.to_string()))
            }
        };
        Self::respond(assoc, message.context_id, request, status, comment).await
    }

    /// Decodes the identifier of a query request.
    fn query(&self, assoc: &Association, message: &Message) -> std::result::Result<Query, (u16, String)> {
        let Some(data) = &message.data else {
            return Err((status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS, "missing identifier".into()));
        };
        let ts = context_transfer_syntax(assoc, message.context_id)
            .map_err(|e| (status::UNABLE_TO_PROCESS, e.to_string()))?;
        let identifier = transcode::read_data_set(data, &ts)
            .map_err(|e| (status::IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS, e.to_string()))?;
        Ok(Query {
            sop_class_uid: message.command.affected_sop_class_uid.clone().unwrap_or_default(),
            identifier,
            calling_ae_title: assoc.peer_ae_title().to_string(),
        })
    }

    async fn handle_find(&self, assoc: &mut Association, message: Message) -> Result<()> {
        let request = &message.command;
        let context_id = message.context_id;
        let provider = match (&self.providers.find, self.config.enable_find) {
            (Some(provider), true) => provider.clone(),
            _ => return Self::respond(assoc, context_id, request, status::SOP_CLASS_NOT_SUPPORTED, None).await,
        };
        let query = match self.query(assoc, &message) {
            Ok(query) => query,
            Err((status, comment)) => return Self::respond(assoc, context_id, request, status, Some(comment)).await,
        };
        let matches = match provider.find(&query).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!("C-FIND provider failed: {}", e);
                return Self::respond(assoc, context_id, request, status::UNABLE_TO_PROCESS, Some(e.to_string()))
                    .await;
            }
        };

        let ts = context_transfer_syntax(assoc, context_id)?;
        let mut sent = 0usize;
        for item in matches {
            let identifier = match item.and_then(|obj| transcode::write_data_set(&obj, &ts)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(sent, "C-FIND matching stopped: {}", e);
                    return Self::respond(assoc, context_id, request, status::UNABLE_TO_PROCESS, Some(e.to_string()))
                        .await;
                }
            };
            let pending = request.response(status::PENDING)?.with_data_set(true);
            assoc.send_message(context_id, &pending, Some(&identifier)).await?;
            sent += 1;
        }
        debug!(matches = sent, "C-FIND complete");
        Self::respond(assoc, context_id, request, status::SUCCESS, None).await
    }

    async fn handle_move(&self, assoc: &mut Association, message: Message) -> Result<()> {
        let request = &message.command;
        let context_id = message.context_id;
        let provider = match (&self.providers.retrieve, self.config.enable_move) {
            (Some(provider), true) => provider.clone(),
            _ => return Self::respond(assoc, context_id, request, status::SOP_CLASS_NOT_SUPPORTED, None).await,
        };
        let Some(destination) = request.move_destination.clone() else {
            return Self::respond(
                assoc,
                context_id,
                request,
                status::MOVE_DESTINATION_UNKNOWN,
                Some("no move destination".into()),
            )
            .await;
        };
        let query = match self.query(assoc, &message) {
            Ok(query) => query,
            Err((status, comment)) => return Self::respond(assoc, context_id, request, status, Some(comment)).await,
        };
        let requester = assoc.peer_ae_title().to_string();
        let node = match self.resolver.resolve(&destination, &requester, assoc.peer_addr()).await {
            Ok(node) => node,
            Err(e) => {
                warn!(destination = %destination, "C-MOVE refused: {}", e);
                return Self::respond(assoc, context_id, request, status::MOVE_DESTINATION_UNKNOWN, Some(e.to_string()))
                    .await;
            }
        };
        let instances = match provider.retrieve(&query).await {
            Ok(instances) => instances,
            Err(e) => {
                return Self::respond(assoc, context_id, request, status::UNABLE_TO_PROCESS, Some(e.to_string()))
                    .await
            }
        };
        info!(destination = %destination, address = %node.address(), instances = instances.len(), "C-MOVE started");

        let mut tally = Tally::new(instances.len());
        if instances.is_empty() {
            let response = request.response(status::SUCCESS)?.with_sub_operations(tally.last());
            return assoc.send_message(context_id, &response, None).await;
        }

        let mut nested = match self.open_nested(&node, &instances).await {
            Ok(nested) => nested,
            Err(e) => {
                warn!(destination = %destination, "could not reach move destination: {}", e);
                tally.failed = tally.total;
                let response = request
                    .response(status::OUT_OF_RESOURCES_UNABLE_TO_PERFORM_SUB_OPERATIONS)?
                    .with_sub_operations(tally.last())
                    .with_error_comment(e.to_string());
                return assoc.send_message(context_id, &response, None).await;
            }
        };

        let originator = (requester, request.id());
        let result = self
            .forward(assoc, Some(&mut nested), context_id, request, &instances, &mut tally, Some(originator))
            .await;
        if nested.is_established() {
            if let Err(e) = nested.release().await {
                debug!("releasing move destination association: {}", e);
            }
        }
        result?;
        self.finish_retrieve(assoc, context_id, request, &tally).await
    }

    async fn handle_get(&self, assoc: &mut Association, message: Message) -> Result<()> {
        let request = &message.command;
        let context_id = message.context_id;
        let provider = match (&self.providers.retrieve, self.config.enable_get) {
            (Some(provider), true) => provider.clone(),
            _ => return Self::respond(assoc, context_id, request, status::SOP_CLASS_NOT_SUPPORTED, None).await,
        };
        let query = match self.query(assoc, &message) {
            Ok(query) => query,
            Err((status, comment)) => return Self::respond(assoc, context_id, request, status, Some(comment)).await,
        };
        let instances = match provider.retrieve(&query).await {
            Ok(instances) => instances,
            Err(e) => {
                return Self::respond(assoc, context_id, request, status::UNABLE_TO_PROCESS, Some(e.to_string()))
                    .await
            }
        };
        info!(instances = instances.len(), "C-GET started");

        let mut tally = Tally::new(instances.len());
        self.forward(assoc, None, context_id, request, &instances, &mut tally, None)
            .await?;
        self.finish_retrieve(assoc, context_id, request, &tally).await
    }

    async fn open_nested(&self, node: &RemoteNode, instances: &[InstanceRef]) -> Result<Association> {
        let options = scu::association_options(&self.config, node)?;
        let proposed = scu::storage_proposals(
            instances
                .iter()
                .map(|i| (i.sop_class_uid.as_str(), i.transfer_syntax.as_str())),
        )?;
        Association::open(&node.address(), &options, proposed).await
    }

    /// Runs the C-STORE sub-operations, on `nested` when given and on
    /// `assoc` otherwise, reporting a pending response after each one that
    /// leaves work remaining.
    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        assoc: &mut Association,
        mut nested: Option<&mut Association>,
        context_id: u8,
        request: &CommandMessage,
        instances: &[InstanceRef],
        tally: &mut Tally,
        originator: Option<(String, u16)>,
    ) -> Result<()> {
        let provider = match &self.providers.retrieve {
            Some(provider) => provider.clone(),
            None => return Ok(()),
        };
        for instance in instances {
            let target: &mut Association = match nested.as_deref_mut() {
                Some(nested) => nested,
                None => &mut *assoc,
            };
            if !target.is_established() {
                tally.failed += 1;
                continue;
            }

            let outcome = match provider.load(instance).await {
                Ok(data) => {
                    let mut store = StoreRequest::new(
                        &instance.sop_class_uid,
                        &instance.sop_instance_uid,
                        &instance.transfer_syntax,
                        data,
                    );
                    if let Some((ae_title, message_id)) = &originator {
                        store = store.with_move_originator(ae_title, *message_id);
                    }
                    scu::store(target, &store).await
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(outcome) => tally.record(Some(outcome.status)),
                Err(e) => {
                    warn!(sop_instance_uid = %instance.sop_instance_uid, "sub-operation failed: {}", e);
                    tally.record(None);
                    if nested.is_none() && e.is_terminal() {
                        return Err(e);
                    }
                }
            }

            if tally.remaining() > 0 {
                let pending = request.response(status::PENDING)?.with_sub_operations(tally.pending());
                assoc.send_message(context_id, &pending, None).await?;
            }
        }
        Ok(())
    }

    async fn finish_retrieve(
        &self,
        assoc: &mut Association,
        context_id: u8,
        request: &CommandMessage,
        tally: &Tally,
    ) -> Result<()> {
        let status = tally.final_status();
        info!(
            command = request.command_field.name(),
            completed = tally.completed,
            failed = tally.failed,
            warning = tally.warning,
            status = format_args!("{:#06x}", status),
            "retrieve finished"
        );
        let response = request.response(status)?.with_sub_operations(tally.last());
        assoc.send_message(context_id, &response, None).await
    }
}

fn context_transfer_syntax(assoc: &Association, context_id: u8) -> Result<String> {
    assoc
        .context(context_id)
        .and_then(|pc| pc.transfer_syntax())
        .map(str::to_string)
        .ok_or_else(|| DimseError::protocol(format!("no transfer syntax for presentation context {}", context_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_counts_down() {
        let mut tally = Tally::new(3);
        assert_eq!(tally.remaining(), 3);
        tally.record(Some(status::SUCCESS));
        tally.record(Some(status::WARNING_ELEMENTS_DISCARDED));
        assert_eq!(tally.pending(), SubOperations { remaining: Some(1), completed: 1, failed: 0, warning: 1 });
        tally.record(Some(status::OUT_OF_RESOURCES));
        assert_eq!(tally.remaining(), 0);
        assert_eq!(tally.final_status(), status::WARNING_SUB_OPERATIONS_FAILED);
        assert_eq!(tally.last().remaining, None);
    }

    #[test]
    fn test_tally_final_status() {
        let mut ok = Tally::new(2);
        ok.record(Some(status::SUCCESS));
        ok.record(Some(status::SUCCESS));
        assert_eq!(ok.final_status(), status::SUCCESS);

        let mut failed = Tally::new(2);
        failed.record(None);
        failed.record(Some(status::UNABLE_TO_PROCESS));
        assert_eq!(failed.final_status(), status::OUT_OF_RESOURCES_UNABLE_TO_PERFORM_SUB_OPERATIONS);

        assert_eq!(Tally::new(0).final_status(), status::SUCCESS);
    }

    #[test]
    fn test_tally_counts_past_u16_and_clamps_on_encode() {
        let mut tally = Tally::new(70_000);
        for _ in 0..66_000 {
            tally.record(Some(status::SUCCESS));
        }
        assert_eq!(tally.remaining(), 4_000);
        assert_eq!(
            tally.pending(),
            SubOperations { remaining: Some(4_000), completed: u16::MAX, failed: 0, warning: 0 }
        );
        assert_eq!(tally.final_status(), status::SUCCESS);
    }
}
