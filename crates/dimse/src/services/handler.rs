//! Response handlers and DIMSE message assembly

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dicom_object::InMemDicomObject;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::association::{Association, Received};
use crate::command::{CommandField, CommandMessage, SubOperations};
use crate::error::{DimseError, Result};
use crate::fragment::Reassembler;
use crate::pdu::Pdv;
use crate::provider::{InstanceMetadata, StorageSink};
use crate::status::{self, Evaluation, ServiceKind, StatusEvaluator};
use crate::transcode;

/// Consumes P-DATA on behalf of one outstanding DIMSE exchange.
#[async_trait]
pub trait ResponseHandler: Send {
    async fn on_pdata(&mut self, values: Vec<Pdv>, assoc: &mut Association) -> Result<()>;

    fn is_done(&self) -> bool;

    /// Whether the association should be released once the handler is done
    fn is_to_be_released(&self) -> bool {
        false
    }
}

/// A complete DIMSE message: command set plus optional data set
#[derive(Debug, Clone)]
pub struct Message {
    pub context_id: u8,
    pub command: CommandMessage,
    pub data: Option<Bytes>,
}

/// Turns PDVs into complete messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    reassembler: Reassembler,
    command: Option<CommandMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one PDV, returning the message it completed, if any.
    pub fn push(&mut self, pdv: Pdv) -> Result<Option<Message>> {
        self.reassembler.push(pdv)?;
        if self.command.is_none() {
            if let Some(bytes) = self.reassembler.command() {
                self.command = Some(CommandMessage::decode(bytes)?);
            }
        }
        let complete = match &self.command {
            Some(command) => !command.has_data_set || self.reassembler.data_complete(),
            None => false,
        };
        if !complete {
            return Ok(None);
        }
        let (context_id, _, data) = self.reassembler.take();
        Ok(self.command.take().map(|command| Message { context_id, command, data }))
    }
}

/// Reads whole messages off an association.
#[derive(Debug, Default)]
pub struct MessageReader {
    assembler: MessageAssembler,
    backlog: VecDeque<Pdv>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next complete message, or `None` once the peer released.
    pub async fn next(&mut self, assoc: &mut Association) -> Result<Option<Message>> {
        loop {
            while let Some(pdv) = self.backlog.pop_front() {
                if let Some(message) = self.assembler.push(pdv)? {
                    return Ok(Some(message));
                }
            }
            match assoc.receive().await? {
                Received::PData(values) => self.backlog.extend(values),
                Received::PeerReleased => return Ok(None),
            }
        }
    }
}

/// Receives matched identifiers of a C-FIND
pub type IdentifierCallback<'a> = Box<dyn FnMut(InMemDicomObject) -> Result<()> + Send + 'a>;

/// Receives running sub-operation counters of a C-MOVE or C-GET
pub type ProgressCallback<'a> = Box<dyn FnMut(&SubOperations) + Send + 'a>;

/// Generic handler for the responses to one request.
///
/// Reassembles fragments, decodes the command, lets the per-service
/// [`StatusEvaluator`] decide whether more responses follow and hands any
/// identifiers to the caller. When given a storage sink it also serves the
/// C-STORE sub-operations a C-GET peer sends back on the same association.
pub struct CompositeResponseHandler<'a> {
    message_id: u16,
    evaluator: StatusEvaluator,
    assembler: MessageAssembler,
    on_identifier: Option<IdentifierCallback<'a>>,
    on_progress: Option<ProgressCallback<'a>>,
    incoming_store: Option<Arc<dyn StorageSink>>,
    release_after: bool,
    done: bool,
    success: bool,
    stalled: bool,
    identifiers: usize,
    stored: SubOperations,
    final_response: Option<CommandMessage>,
}

impl<'a> CompositeResponseHandler<'a> {
    pub fn new(kind: ServiceKind, message_id: u16) -> Self {
        Self {
            message_id,
            evaluator: StatusEvaluator::new(kind),
            assembler: MessageAssembler::new(),
            on_identifier: None,
            on_progress: None,
            incoming_store: None,
            release_after: false,
            done: false,
            success: false,
            stalled: false,
            identifiers: 0,
            stored: SubOperations::default(),
            final_response: None,
        }
    }

    pub fn with_stall_limit(mut self, limit: u32) -> Self {
        self.evaluator = StatusEvaluator::with_stall_limit(self.evaluator.kind(), limit);
        self
    }

    pub fn on_identifier(mut self, callback: IdentifierCallback<'a>) -> Self {
        self.on_identifier = Some(callback);
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback<'a>) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_incoming_store(mut self, sink: Arc<dyn StorageSink>) -> Self {
        self.incoming_store = Some(sink);
        self
    }

    /// Ask for the association to be released after the final response
    pub fn release_after(mut self, release: bool) -> Self {
        self.release_after = release;
        self
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }

    pub fn identifiers(&self) -> usize {
        self.identifiers
    }

    pub fn evaluator(&self) -> &StatusEvaluator {
        &self.evaluator
    }

    /// Counters of C-STORE sub-operations served during a C-GET
    pub fn stored(&self) -> SubOperations {
        self.stored
    }

    pub fn final_response(&self) -> Option<&CommandMessage> {
        self.final_response.as_ref()
    }

    async fn handle_message(&mut self, message: Message, assoc: &mut Association) -> Result<()> {
        let field = message.command.command_field;
        if field == CommandField::CStoreRq && self.incoming_store.is_some() {
            return self.serve_store(message, assoc).await;
        }

        let expected = self.evaluator.kind().response_field();
        if field != expected {
            return Err(DimseError::protocol(format!(
                "received {} while waiting for {}",
                field.name(),
                expected.name()
            )));
        }
        let response = message.command;
        if response.message_id_being_responded_to != Some(self.message_id) {
            warn!(
                expected = self.message_id,
                got = ?response.message_id_being_responded_to,
                "response does not answer the outstanding request"
            );
        }

        let evaluation = self.evaluator.evaluate(&response);
        debug!(
            command = field.name(),
            status = ?response.status,
            ?evaluation,
            "response received"
        );

        if let Some(data) = message.data {
            if evaluation == Evaluation::Pending && self.evaluator.kind() == ServiceKind::Find {
                let ts = assoc
                    .context(message.context_id)
                    .and_then(|pc| pc.transfer_syntax())
                    .ok_or_else(|| DimseError::protocol("identifier on unknown presentation context"))?
                    .to_string();
                let identifier = transcode::read_data_set(&data, &ts)?;
                self.identifiers += 1;
                if let Some(callback) = self.on_identifier.as_mut() {
                    callback(identifier)?;
                }
            } else {
                debug!(len = data.len(), "ignoring data set attached to {}", field.name());
            }
        }

        if let Some(counts) = response.sub_operations {
            if let Some(callback) = self.on_progress.as_mut() {
                callback(&counts);
            }
        }

        match evaluation {
            Evaluation::Pending => {}
            Evaluation::Final { success } => {
                self.done = true;
                self.success = success;
                self.final_response = Some(response);
            }
            Evaluation::Stalled => {
                self.done = true;
                self.stalled = true;
                self.success = false;
                self.final_response = Some(response);
            }
        }
        Ok(())
    }

    async fn serve_store(&mut self, message: Message, assoc: &mut Association) -> Result<()> {
        let request = message.command;
        let Some(sink) = self.incoming_store.clone() else {
            return Ok(());
        };
        let Some(data) = message.data else {
            return Err(DimseError::protocol("C-STORE-RQ without data set"));
        };
        let transfer_syntax = assoc
            .context(message.context_id)
            .and_then(|pc| pc.transfer_syntax())
            .unwrap_or_default()
            .to_string();
        let metadata = InstanceMetadata {
            id: Uuid::new_v4(),
            sop_class_uid: request.affected_sop_class_uid.clone().unwrap_or_default(),
            sop_instance_uid: request.affected_sop_instance_uid.clone().unwrap_or_default(),
            transfer_syntax,
            calling_ae_title: assoc.peer_ae_title().to_string(),
            move_originator_ae_title: request.move_originator_ae_title.clone(),
            received_at: Utc::now(),
            size_bytes: data.len() as u64,
        };

        let status = match sink.store(&metadata, data).await {
            Ok(status) => status,
            Err(e) => {
                warn!(sop_instance_uid = %metadata.sop_instance_uid, "storing C-GET sub-operation failed: {}", e);
                status::OUT_OF_RESOURCES
            }
        };
        if status::is_store_success(status) {
            self.stored.completed += 1;
        } else {
            self.stored.failed += 1;
        }
        let response = request.response(status)?;
        assoc.send_message(message.context_id, &response, None).await
    }
}

#[async_trait]
impl<'a> ResponseHandler for CompositeResponseHandler<'a> {
    async fn on_pdata(&mut self, values: Vec<Pdv>, assoc: &mut Association) -> Result<()> {
        for pdv in values {
            if self.done {
                warn!(context_id = pdv.context_id, "discarding PDV after final response");
                continue;
            }
            if let Some(message) = self.assembler.push(pdv)? {
                self.handle_message(message, assoc).await?;
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    /// A stalled peer is aborted by the caller, never released.
    fn is_to_be_released(&self) -> bool {
        self.done && self.release_after && !self.stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Priority;
    use crate::uids;

    fn pdvs(context_id: u8, is_command: bool, bytes: &[u8], chunk: usize) -> Vec<Pdv> {
        let chunks: Vec<&[u8]> = bytes.chunks(chunk).collect();
        let count = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| Pdv {
                context_id,
                is_command,
                is_last: i + 1 == count,
                data: Bytes::copy_from_slice(c),
            })
            .collect()
    }

    #[test]
    fn test_assembler_waits_for_data_set() {
        let command = CommandMessage::find_rq(4, uids::STUDY_ROOT_QR_FIND, Priority::Medium);
        let mut assembler = MessageAssembler::new();
        for pdv in pdvs(1, true, &command.encode().unwrap(), 10) {
            assert!(assembler.push(pdv).unwrap().is_none());
        }
        let mut data = pdvs(1, false, b"0123456789", 4);
        let last = data.pop().unwrap();
        for pdv in data {
            assert!(assembler.push(pdv).unwrap().is_none());
        }
        let message = assembler.push(last).unwrap().unwrap();
        assert_eq!(message.command, command);
        assert_eq!(message.data.as_deref(), Some(&b"0123456789"[..]));
    }

    #[test]
    fn test_assembler_completes_without_data_set() {
        let command = CommandMessage::echo_rq(2, uids::VERIFICATION);
        let mut assembler = MessageAssembler::new();
        let mut result = None;
        for pdv in pdvs(3, true, &command.encode().unwrap(), 16) {
            result = assembler.push(pdv).unwrap();
        }
        let message = result.unwrap();
        assert_eq!(message.context_id, 3);
        assert!(message.data.is_none());
    }
}
