//! DICOM Upper Layer protocol data units
//!
//! Every PDU is framed as `type:u8, reserved:u8, length:u32-be` followed by
//! `length` bytes of payload. Variable items nested inside the association
//! PDUs use `type:u8, reserved:u8, length:u16-be`, presentation data value
//! items inside P-DATA-TF use a 4-byte length. All lengths count only the
//! bytes that follow the length field.

pub mod codec;
pub mod io;

use bytes::Bytes;

use crate::error::{DimseError, Result};

pub use codec::{decode_pdu, decode_pdu_frame, encode_pdu};
pub use io::{read_pdu, write_pdu};

/// Size of the fixed PDU header (type, reserved, 4-byte length)
pub const PDU_HEADER_LENGTH: usize = 6;

/// Bytes a PDV item adds around its payload (4-byte length, context ID, control header)
pub const PDV_HEADER_LENGTH: usize = 6;

/// Default maximum PDU length we advertise
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16_384;

/// Smallest maximum PDU length that still carries a 2-byte PDV payload
pub const MINIMUM_MAX_PDU_LENGTH: u32 = 8;

/// Upper bound applied to incoming PDUs when neither side limits the length
pub const HARD_PDU_LENGTH_LIMIT: u32 = 64 * 1024 * 1024;

/// Protocol version bit advertised in association PDUs
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// PDU type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    AssociateRq = 0x01,
    AssociateAc = 0x02,
    AssociateRj = 0x03,
    PData = 0x04,
    ReleaseRq = 0x05,
    ReleaseRp = 0x06,
    Abort = 0x07,
}

impl TryFrom<u8> for PduType {
    type Error = DimseError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x01 => PduType::AssociateRq,
            0x02 => PduType::AssociateAc,
            0x03 => PduType::AssociateRj,
            0x04 => PduType::PData,
            0x05 => PduType::ReleaseRq,
            0x06 => PduType::ReleaseRp,
            0x07 => PduType::Abort,
            other => return Err(DimseError::protocol(format!("unrecognized PDU type {:#04x}", other))),
        })
    }
}

/// A protocol data unit of the DICOM Upper Layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj(AssociateRj),
    PData(Vec<Pdv>),
    ReleaseRq,
    ReleaseRp,
    Abort(Abort),
}

impl Pdu {
    pub fn pdu_type(&self) -> PduType {
        match self {
            Pdu::AssociateRq(_) => PduType::AssociateRq,
            Pdu::AssociateAc(_) => PduType::AssociateAc,
            Pdu::AssociateRj(_) => PduType::AssociateRj,
            Pdu::PData(_) => PduType::PData,
            Pdu::ReleaseRq => PduType::ReleaseRq,
            Pdu::ReleaseRp => PduType::ReleaseRp,
            Pdu::Abort(_) => PduType::Abort,
        }
    }

    /// One-line description for trace logging
    pub fn short_description(&self) -> String {
        match self {
            Pdu::AssociateRq(rq) => format!(
                "A-ASSOCIATE-RQ {} -> {} ({} contexts)",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociateAc(ac) => format!("A-ASSOCIATE-AC ({} contexts)", ac.presentation_contexts.len()),
            Pdu::AssociateRj(rj) => format!(
                "A-ASSOCIATE-RJ result={} source={} reason={}",
                rj.result, rj.source, rj.reason
            ),
            Pdu::PData(values) => {
                let bytes: usize = values.iter().map(|v| v.data.len()).sum();
                format!("P-DATA-TF ({} PDVs, {} bytes)", values.len(), bytes)
            }
            Pdu::ReleaseRq => "A-RELEASE-RQ".to_string(),
            Pdu::ReleaseRp => "A-RELEASE-RP".to_string(),
            Pdu::Abort(a) => format!("A-ABORT source={} reason={}", a.source, a.reason),
        }
    }
}

/// A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRq {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariable>,
}

/// A-ASSOCIATE-AC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateAc {
    pub protocol_version: u16,
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariable>,
}

/// A-ASSOCIATE-RJ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociateRj {
    pub result: u8,
    pub source: u8,
    pub reason: u8,
}

impl AssociateRj {
    /// Rejected-permanent by the service user: called AE title not recognized
    pub fn called_ae_not_recognized() -> Self {
        Self { result: 1, source: 1, reason: 7 }
    }

    /// Rejected-permanent by the service user, no reason given
    pub fn no_reason() -> Self {
        Self { result: 1, source: 1, reason: 1 }
    }

    /// Rejected-transient by the presentation-related provider: local limit exceeded
    pub fn local_limit_exceeded() -> Self {
        Self { result: 2, source: 3, reason: 2 }
    }
}

/// A-ABORT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    pub source: u8,
    pub reason: u8,
}

/// A-ABORT source: DICOM UL service-user
pub const ABORT_SOURCE_SERVICE_USER: u8 = 0;
/// A-ABORT source: DICOM UL service-provider
pub const ABORT_SOURCE_SERVICE_PROVIDER: u8 = 2;

pub const ABORT_REASON_NOT_SPECIFIED: u8 = 0;
pub const ABORT_REASON_UNRECOGNIZED_PDU: u8 = 1;
pub const ABORT_REASON_UNEXPECTED_PDU: u8 = 2;
pub const ABORT_REASON_INVALID_PARAMETER_VALUE: u8 = 6;

impl Abort {
    pub fn user() -> Self {
        Self { source: ABORT_SOURCE_SERVICE_USER, reason: ABORT_REASON_NOT_SPECIFIED }
    }

    pub fn unexpected_pdu() -> Self {
        Self { source: ABORT_SOURCE_SERVICE_PROVIDER, reason: ABORT_REASON_UNEXPECTED_PDU }
    }
}

/// Presentation context item as proposed in an A-ASSOCIATE-RQ (item type 0x20)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// Presentation context item as answered in an A-ASSOCIATE-AC (item type 0x21)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: ResultReason,
    pub transfer_syntax: String,
}

/// Result/reason byte of an accepted or rejected presentation context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxNotSupported = 4,
}

impl TryFrom<u8> for ResultReason {
    type Error = DimseError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ResultReason::Acceptance,
            1 => ResultReason::UserRejection,
            2 => ResultReason::NoReason,
            3 => ResultReason::AbstractSyntaxNotSupported,
            4 => ResultReason::TransferSyntaxNotSupported,
            other => {
                return Err(DimseError::protocol(format!(
                    "invalid presentation context result/reason {}",
                    other
                )))
            }
        })
    }
}

/// Sub-items of the User Information item (type 0x50)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserVariable {
    /// 0x51
    MaxLength(u32),
    /// 0x52
    ImplementationClassUid(String),
    /// 0x53
    AsynchronousOperationsWindow { invoked: u16, performed: u16 },
    /// 0x54
    RoleSelection(RoleSelection),
    /// 0x55
    ImplementationVersionName(String),
    /// 0x58
    UserIdentity(UserIdentity),
    /// 0x59
    UserIdentityResponse(Vec<u8>),
    /// Any other sub-item, carried through untouched
    Unknown { item_type: u8, data: Vec<u8> },
}

/// SCU/SCP Role Selection sub-item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

/// Kind of credentials carried by a User Identity sub-item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserIdentityType {
    Username = 1,
    UsernamePasscode = 2,
    Kerberos = 3,
    Saml = 4,
    Jwt = 5,
}

impl TryFrom<u8> for UserIdentityType {
    type Error = DimseError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => UserIdentityType::Username,
            2 => UserIdentityType::UsernamePasscode,
            3 => UserIdentityType::Kerberos,
            4 => UserIdentityType::Saml,
            5 => UserIdentityType::Jwt,
            other => return Err(DimseError::protocol(format!("invalid user identity type {}", other))),
        })
    }
}

/// User Identity negotiation sub-item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub identity_type: UserIdentityType,
    pub positive_response_requested: bool,
    pub primary_field: Vec<u8>,
    pub secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn username(username: impl Into<String>) -> Self {
        Self {
            identity_type: UserIdentityType::Username,
            positive_response_requested: false,
            primary_field: username.into().into_bytes(),
            secondary_field: Vec::new(),
        }
    }

    pub fn username_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            identity_type: UserIdentityType::UsernamePasscode,
            positive_response_requested: false,
            primary_field: username.into().into_bytes(),
            secondary_field: password.into().into_bytes(),
        }
    }

    /// Primary field decoded as a user name, if it is valid UTF-8
    pub fn username_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.primary_field).ok()
    }
}

/// Presentation data value item of a P-DATA-TF PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdv {
    pub context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Bytes,
}

impl Pdv {
    /// Message control header: bit 0 command, bit 1 last fragment
    pub fn control_header(&self) -> u8 {
        (self.is_command as u8) | ((self.is_last as u8) << 1)
    }
}

/// Finds the maximum length sub-item among user variables.
pub fn max_length_of(variables: &[UserVariable]) -> Option<u32> {
    variables.iter().find_map(|v| match v {
        UserVariable::MaxLength(len) => Some(*len),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_type_codes() {
        assert_eq!(PduType::try_from(0x04).unwrap(), PduType::PData);
        assert!(PduType::try_from(0x08).is_err());
        assert!(PduType::try_from(0x00).is_err());
    }

    #[test]
    fn test_control_header_bits() {
        let pdv = Pdv { context_id: 1, is_command: true, is_last: true, data: Bytes::new() };
        assert_eq!(pdv.control_header(), 0x03);
        let pdv = Pdv { context_id: 1, is_command: false, is_last: true, data: Bytes::new() };
        assert_eq!(pdv.control_header(), 0x02);
    }
}
