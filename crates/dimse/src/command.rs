//! DIMSE command messages
//!
//! Command sets are always encoded in Implicit VR Little Endian regardless of
//! the transfer syntax negotiated for the presentation context.

use std::sync::atomic::{AtomicU16, Ordering};

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;

use crate::error::{DimseError, Result};

/// Command Data Set Type value meaning no data set follows
pub const DATA_SET_MISSING: u16 = 0x0101;
/// Command Data Set Type value used when a data set follows
pub const DATA_SET_PRESENT: u16 = 0x0000;

static MESSAGE_ID: AtomicU16 = AtomicU16::new(1);

/// Next outgoing message ID. Shared by every association in the process,
/// never returns 0.
pub fn next_message_id() -> u16 {
    loop {
        let id = MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    pub fn is_response(self) -> bool {
        (self as u16) & 0x8000 != 0
    }

    /// Response command field matching a request
    pub fn response(self) -> Option<CommandField> {
        match self {
            CommandField::CStoreRq => Some(CommandField::CStoreRsp),
            CommandField::CGetRq => Some(CommandField::CGetRsp),
            CommandField::CFindRq => Some(CommandField::CFindRsp),
            CommandField::CMoveRq => Some(CommandField::CMoveRsp),
            CommandField::CEchoRq => Some(CommandField::CEchoRsp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CGetRq => "C-GET-RQ",
            CommandField::CGetRsp => "C-GET-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
        }
    }
}

impl TryFrom<u16> for CommandField {
    type Error = DimseError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            other => return Err(DimseError::NotSupported(format!("command field {:#06x}", other))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Priority {
    #[default]
    Medium = 0x0000,
    High = 0x0001,
    Low = 0x0002,
}

/// Sub-operation counters carried by C-MOVE and C-GET responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubOperations {
    pub remaining: Option<u16>,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// A decoded or to-be-encoded DIMSE command set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub priority: Option<Priority>,
    pub has_data_set: bool,
    pub status: Option<u16>,
    pub error_comment: Option<String>,
    pub move_destination: Option<String>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub sub_operations: Option<SubOperations>,
}

impl CommandMessage {
    fn bare(command_field: CommandField) -> Self {
        Self {
            command_field,
            message_id: None,
            message_id_being_responded_to: None,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            priority: None,
            has_data_set: false,
            status: None,
            error_comment: None,
            move_destination: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            sub_operations: None,
        }
    }

    fn request(command_field: CommandField, message_id: u16, sop_class_uid: &str) -> Self {
        Self {
            message_id: Some(message_id),
            affected_sop_class_uid: Some(sop_class_uid.to_string()),
            ..Self::bare(command_field)
        }
    }

    pub fn echo_rq(message_id: u16, sop_class_uid: &str) -> Self {
        Self::request(CommandField::CEchoRq, message_id, sop_class_uid)
    }

    pub fn store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str, priority: Priority) -> Self {
        Self {
            affected_sop_instance_uid: Some(sop_instance_uid.to_string()),
            priority: Some(priority),
            has_data_set: true,
            ..Self::request(CommandField::CStoreRq, message_id, sop_class_uid)
        }
    }

    /// Marks a C-STORE-RQ as a sub-operation of a C-MOVE.
    pub fn with_move_originator(mut self, ae_title: &str, message_id: u16) -> Self {
        self.move_originator_ae_title = Some(ae_title.to_string());
        self.move_originator_message_id = Some(message_id);
        self
    }

    pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            has_data_set: true,
            ..Self::request(CommandField::CFindRq, message_id, sop_class_uid)
        }
    }

    pub fn move_rq(message_id: u16, sop_class_uid: &str, destination: &str, priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            has_data_set: true,
            move_destination: Some(destination.to_string()),
            ..Self::request(CommandField::CMoveRq, message_id, sop_class_uid)
        }
    }

    pub fn get_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            has_data_set: true,
            ..Self::request(CommandField::CGetRq, message_id, sop_class_uid)
        }
    }

    pub fn cancel_rq(message_id_being_responded_to: u16) -> Self {
        Self {
            message_id_being_responded_to: Some(message_id_being_responded_to),
            ..Self::bare(CommandField::CCancelRq)
        }
    }

    /// Builds the response to this request with the given status.
    pub fn response(&self, status: u16) -> Result<Self> {
        let command_field = self.command_field.response().ok_or_else(|| {
            DimseError::protocol(format!("{} has no response", self.command_field.name()))
        })?;
        Ok(Self {
            message_id_being_responded_to: self.message_id,
            affected_sop_class_uid: self.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: match command_field {
                CommandField::CStoreRsp => self.affected_sop_instance_uid.clone(),
                _ => None,
            },
            status: Some(status),
            ..Self::bare(command_field)
        })
    }

    pub fn with_data_set(mut self, has_data_set: bool) -> Self {
        self.has_data_set = has_data_set;
        self
    }

    pub fn with_sub_operations(mut self, counts: SubOperations) -> Self {
        self.sub_operations = Some(counts);
        self
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        let comment = comment.into();
        // (0000,0902) is LO, 64 characters at most
        self.error_comment = Some(comment.chars().take(64).collect());
        self
    }

    /// Message ID of a request or the ID a response answers
    pub fn id(&self) -> u16 {
        self.message_id
            .or(self.message_id_being_responded_to)
            .unwrap_or_default()
    }

    pub fn to_object(&self) -> InMemDicomObject {
        let mut elements: Vec<InMemElement> = Vec::with_capacity(12);
        if let Some(uid) = &self.affected_sop_class_uid {
            elements.push(DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uid.as_str())));
        }
        elements.push(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.command_field as u16]),
        ));
        if let Some(id) = self.message_id {
            elements.push(DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [id])));
        }
        if let Some(id) = self.message_id_being_responded_to {
            elements.push(DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [id])));
        }
        if let Some(destination) = &self.move_destination {
            elements.push(DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, destination.as_str())));
        }
        if let Some(priority) = self.priority {
            elements.push(DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])));
        }
        let data_set_type = if self.has_data_set { DATA_SET_PRESENT } else { DATA_SET_MISSING };
        elements.push(DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])));
        if let Some(status) = self.status {
            elements.push(DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])));
        }
        if let Some(comment) = &self.error_comment {
            elements.push(DataElement::new(tags::ERROR_COMMENT, VR::LO, dicom_value!(Str, comment.as_str())));
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            elements.push(DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, uid.as_str())));
        }
        if let Some(counts) = self.sub_operations {
            if let Some(remaining) = counts.remaining {
                elements.push(DataElement::new(
                    tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                    VR::US,
                    dicom_value!(U16, [remaining]),
                ));
            }
            elements.push(DataElement::new(
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [counts.completed]),
            ));
            elements.push(DataElement::new(
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [counts.failed]),
            ));
            elements.push(DataElement::new(
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [counts.warning]),
            ));
        }
        if let Some(ae) = &self.move_originator_ae_title {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, ae.as_str()),
            ));
        }
        if let Some(id) = self.move_originator_message_id {
            elements.push(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [id])));
        }
        // Group length is computed from the other elements
        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Encodes the command set in Implicit VR Little Endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.to_object()
            .write_dataset_with_ts(&mut out, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| DimseError::DicomObject(format!("could not encode {}: {}", self.command_field.name(), e)))?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| DimseError::protocol(format!("failed to read incoming DICOM command: {}", e)))?;

        let field = read_u16(&obj, tags::COMMAND_FIELD)?
            .ok_or_else(|| DimseError::protocol("command set without Command Field"))?;
        let command_field = CommandField::try_from(field)?;

        let sub_operations = match command_field {
            CommandField::CMoveRsp | CommandField::CGetRsp => Some(SubOperations {
                remaining: read_u16(&obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS)?,
                completed: read_u16(&obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?.unwrap_or_default(),
                failed: read_u16(&obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS)?.unwrap_or_default(),
                warning: read_u16(&obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS)?.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Self {
            command_field,
            message_id: read_u16(&obj, tags::MESSAGE_ID)?,
            message_id_being_responded_to: read_u16(&obj, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            affected_sop_class_uid: read_str(&obj, tags::AFFECTED_SOP_CLASS_UID)?,
            affected_sop_instance_uid: read_str(&obj, tags::AFFECTED_SOP_INSTANCE_UID)?,
            priority: read_u16(&obj, tags::PRIORITY)?.map(|p| match p {
                0x0001 => Priority::High,
                0x0002 => Priority::Low,
                _ => Priority::Medium,
            }),
            has_data_set: read_u16(&obj, tags::COMMAND_DATA_SET_TYPE)?.unwrap_or(DATA_SET_MISSING) != DATA_SET_MISSING,
            status: read_u16(&obj, tags::STATUS)?,
            error_comment: read_str(&obj, tags::ERROR_COMMENT)?,
            move_destination: read_str(&obj, tags::MOVE_DESTINATION)?,
            move_originator_ae_title: read_str(&obj, tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)?,
            move_originator_message_id: read_u16(&obj, tags::MOVE_ORIGINATOR_MESSAGE_ID)?,
            sub_operations,
        })
    }
}

fn read_u16(obj: &InMemDicomObject, tag: Tag) -> Result<Option<u16>> {
    obj.get(tag)
        .map(|e| {
            e.to_int::<u16>()
                .map_err(|err| DimseError::protocol(format!("command element {} is not US: {}", tag, err)))
        })
        .transpose()
}

fn read_str(obj: &InMemDicomObject, tag: Tag) -> Result<Option<String>> {
    obj.get(tag)
        .map(|e| {
            e.to_str()
                .map(|s| s.trim_end_matches(|c: char| c == '\0' || c == ' ').trim_start().to_string())
                .map_err(|err| DimseError::protocol(format!("command element {} is not text: {}", tag, err)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uids;

    #[test]
    fn test_message_ids_are_nonzero_and_distinct() {
        let a = next_message_id();
        let b = next_message_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_store_request_round_trip() {
        let rq = CommandMessage::store_rq(7, uids::CT_IMAGE_STORAGE, "1.2.3.4.5", Priority::High)
            .with_move_originator("ARCHIVE", 3);
        let decoded = CommandMessage::decode(&rq.encode().unwrap()).unwrap();
        assert_eq!(decoded, rq);
        assert!(decoded.has_data_set);
    }

    #[test]
    fn test_echo_response_fields() {
        let rq = CommandMessage::echo_rq(12, uids::VERIFICATION);
        let rsp = rq.response(0x0000).unwrap();
        assert_eq!(rsp.command_field, CommandField::CEchoRsp);
        assert_eq!(rsp.message_id_being_responded_to, Some(12));
        assert!(!rsp.has_data_set);

        let decoded = CommandMessage::decode(&rsp.encode().unwrap()).unwrap();
        assert_eq!(decoded.status, Some(0x0000));
        assert_eq!(decoded.id(), 12);
    }

    #[test]
    fn test_move_response_counters() {
        let rq = CommandMessage::move_rq(9, uids::STUDY_ROOT_QR_MOVE, "DEST", Priority::Medium);
        let rsp = rq
            .response(0xFF00)
            .unwrap()
            .with_sub_operations(SubOperations { remaining: Some(4), completed: 2, failed: 1, warning: 0 })
            .with_error_comment("x".repeat(80));
        let decoded = CommandMessage::decode(&rsp.encode().unwrap()).unwrap();
        let counts = decoded.sub_operations.unwrap();
        assert_eq!(counts.remaining, Some(4));
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(decoded.error_comment.as_deref().map(str::len), Some(64));
    }

    #[test]
    fn test_error_comment_cut_on_char_boundary() {
        let rq = CommandMessage::store_rq(4, uids::CT_IMAGE_STORAGE, "1.2.3.4.6", Priority::Medium);
        let rsp = rq.response(0xC000).unwrap().with_error_comment(format!("a{}", "é".repeat(40)));
        let comment = rsp.error_comment.unwrap();
        assert_eq!(comment.chars().count(), 64);
        assert!(comment.starts_with("aé"));
    }

    #[test]
    fn test_command_starts_with_group_length() {
        let bytes = CommandMessage::echo_rq(1, uids::VERIFICATION).encode().unwrap();
        // (0000,0000) UL, implicit VR: tag, 4-byte length, 4-byte value
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let group_length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        assert_eq!(group_length, bytes.len() - 12);
    }

    #[test]
    fn test_unknown_command_field() {
        assert!(CommandField::try_from(0x0100).is_err());
        assert!(CommandField::CFindRsp.is_response());
        assert_eq!(CommandField::CCancelRq.response(), None);
    }
}
