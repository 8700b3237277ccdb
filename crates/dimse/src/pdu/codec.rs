//! Binary encoding and decoding of PDUs and their nested items

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};

use crate::error::{DimseError, Result};
use crate::pdu::{
    Abort, AssociateAc, AssociateRj, AssociateRq, Pdu, PduType, Pdv, PresentationContextProposed,
    PresentationContextResult, ResultReason, RoleSelection, UserIdentity, UserIdentityType, UserVariable,
    PDU_HEADER_LENGTH,
};

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;

const SUB_MAX_LENGTH: u8 = 0x51;
const SUB_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const SUB_ASYNC_OPERATIONS_WINDOW: u8 = 0x53;
const SUB_ROLE_SELECTION: u8 = 0x54;
const SUB_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;
const SUB_USER_IDENTITY: u8 = 0x58;
const SUB_USER_IDENTITY_RESPONSE: u8 = 0x59;

const AE_TITLE_LENGTH: usize = 16;

/// Encodes a PDU including its 6-byte header.
pub fn encode_pdu(pdu: &Pdu) -> Result<BytesMut> {
    let mut body = BytesMut::new();
    match pdu {
        Pdu::AssociateRq(rq) => {
            put_association_header(&mut body, rq.protocol_version, &rq.called_ae_title, &rq.calling_ae_title)?;
            put_item(&mut body, ITEM_APPLICATION_CONTEXT, &encode_text(&rq.application_context, "application context")?)?;
            for pc in &rq.presentation_contexts {
                put_item(&mut body, ITEM_PRESENTATION_CONTEXT_RQ, &encode_context_proposed(pc)?)?;
            }
            put_item(&mut body, ITEM_USER_INFORMATION, &encode_user_variables(&rq.user_variables)?)?;
        }
        Pdu::AssociateAc(ac) => {
            put_association_header(&mut body, ac.protocol_version, &ac.called_ae_title, &ac.calling_ae_title)?;
            put_item(&mut body, ITEM_APPLICATION_CONTEXT, &encode_text(&ac.application_context, "application context")?)?;
            for pc in &ac.presentation_contexts {
                put_item(&mut body, ITEM_PRESENTATION_CONTEXT_AC, &encode_context_result(pc)?)?;
            }
            put_item(&mut body, ITEM_USER_INFORMATION, &encode_user_variables(&ac.user_variables)?)?;
        }
        Pdu::AssociateRj(rj) => {
            body.put_u8(0);
            body.put_u8(rj.result);
            body.put_u8(rj.source);
            body.put_u8(rj.reason);
        }
        Pdu::PData(values) => {
            for pdv in values {
                let item_length = u32::try_from(pdv.data.len() + 2)
                    .map_err(|_| DimseError::protocol("PDV payload exceeds 32-bit length"))?;
                body.put_u32(item_length);
                body.put_u8(pdv.context_id);
                body.put_u8(pdv.control_header());
                body.extend_from_slice(&pdv.data);
            }
        }
        Pdu::ReleaseRq | Pdu::ReleaseRp => body.put_u32(0),
        Pdu::Abort(abort) => {
            body.put_u16(0);
            body.put_u8(abort.source);
            body.put_u8(abort.reason);
        }
    }

    let length = u32::try_from(body.len()).map_err(|_| DimseError::protocol("PDU exceeds 32-bit length"))?;
    let mut out = BytesMut::with_capacity(PDU_HEADER_LENGTH + body.len());
    out.put_u8(pdu.pdu_type() as u8);
    out.put_u8(0);
    out.put_u32(length);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a complete PDU frame, header included.
///
/// The declared length must match the bytes that follow the header exactly.
pub fn decode_pdu_frame(frame: &[u8]) -> Result<Pdu> {
    if frame.len() < PDU_HEADER_LENGTH {
        return Err(DimseError::protocol(format!(
            "PDU header needs {} bytes but only {} available",
            PDU_HEADER_LENGTH,
            frame.len()
        )));
    }
    let mut header = &frame[..PDU_HEADER_LENGTH];
    let pdu_type = header.get_u8();
    header.advance(1);
    let declared = header.get_u32() as usize;
    let body = &frame[PDU_HEADER_LENGTH..];
    if body.len() < declared {
        return Err(DimseError::protocol(format!(
            "PDU declares {} bytes but only {} available",
            declared,
            body.len()
        )));
    }
    if body.len() > declared {
        return Err(DimseError::protocol(format!(
            "{} trailing bytes after PDU of declared length {}",
            body.len() - declared,
            declared
        )));
    }
    decode_pdu(pdu_type, body)
}

/// Decodes the payload of a PDU whose header has already been consumed.
///
/// `body` must be exactly the declared PDU length; anything left over after
/// the last field is a protocol violation.
pub fn decode_pdu(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    let mut buf = body;
    let pdu = match PduType::try_from(pdu_type)? {
        PduType::AssociateRq => {
            let (protocol_version, called_ae_title, calling_ae_title) = get_association_header(&mut buf)?;
            let mut application_context = None;
            let mut presentation_contexts = Vec::new();
            let mut user_variables = None;
            while buf.has_remaining() {
                let (item_type, value) = next_item(&mut buf, "A-ASSOCIATE-RQ item")?;
                match item_type {
                    ITEM_APPLICATION_CONTEXT => application_context = Some(decode_text(value, "application context")?),
                    ITEM_PRESENTATION_CONTEXT_RQ => presentation_contexts.push(decode_context_proposed(value)?),
                    ITEM_USER_INFORMATION => user_variables = Some(decode_user_variables(value)?),
                    other => {
                        return Err(DimseError::protocol(format!(
                            "unexpected item {:#04x} in A-ASSOCIATE-RQ",
                            other
                        )))
                    }
                }
            }
            Pdu::AssociateRq(AssociateRq {
                protocol_version,
                called_ae_title,
                calling_ae_title,
                application_context: application_context
                    .ok_or_else(|| DimseError::protocol("A-ASSOCIATE-RQ without application context"))?,
                presentation_contexts,
                user_variables: user_variables.unwrap_or_default(),
            })
        }
        PduType::AssociateAc => {
            let (protocol_version, called_ae_title, calling_ae_title) = get_association_header(&mut buf)?;
            let mut application_context = None;
            let mut presentation_contexts = Vec::new();
            let mut user_variables = None;
            while buf.has_remaining() {
                let (item_type, value) = next_item(&mut buf, "A-ASSOCIATE-AC item")?;
                match item_type {
                    ITEM_APPLICATION_CONTEXT => application_context = Some(decode_text(value, "application context")?),
                    ITEM_PRESENTATION_CONTEXT_AC => presentation_contexts.push(decode_context_result(value)?),
                    ITEM_USER_INFORMATION => user_variables = Some(decode_user_variables(value)?),
                    other => {
                        return Err(DimseError::protocol(format!(
                            "unexpected item {:#04x} in A-ASSOCIATE-AC",
                            other
                        )))
                    }
                }
            }
            Pdu::AssociateAc(AssociateAc {
                protocol_version,
                called_ae_title,
                calling_ae_title,
                application_context: application_context
                    .ok_or_else(|| DimseError::protocol("A-ASSOCIATE-AC without application context"))?,
                presentation_contexts,
                user_variables: user_variables.unwrap_or_default(),
            })
        }
        PduType::AssociateRj => {
            need(buf, 4, "A-ASSOCIATE-RJ")?;
            buf.advance(1);
            Pdu::AssociateRj(AssociateRj {
                result: buf.get_u8(),
                source: buf.get_u8(),
                reason: buf.get_u8(),
            })
        }
        PduType::PData => {
            let mut values = Vec::new();
            while buf.has_remaining() {
                need(buf, 4, "PDV item length")?;
                let item_length = buf.get_u32() as usize;
                if item_length < 2 {
                    return Err(DimseError::protocol(format!("invalid PDV item length {} (must be >= 2)", item_length)));
                }
                need(buf, item_length, "PDV item")?;
                let context_id = buf.get_u8();
                let control = buf.get_u8();
                let data = Bytes::copy_from_slice(&buf[..item_length - 2]);
                buf.advance(item_length - 2);
                values.push(Pdv {
                    context_id,
                    is_command: control & 0x01 != 0,
                    is_last: control & 0x02 != 0,
                    data,
                });
            }
            Pdu::PData(values)
        }
        PduType::ReleaseRq => {
            need(buf, 4, "A-RELEASE-RQ")?;
            buf.advance(4);
            Pdu::ReleaseRq
        }
        PduType::ReleaseRp => {
            need(buf, 4, "A-RELEASE-RP")?;
            buf.advance(4);
            Pdu::ReleaseRp
        }
        PduType::Abort => {
            need(buf, 4, "A-ABORT")?;
            buf.advance(2);
            Pdu::Abort(Abort {
                source: buf.get_u8(),
                reason: buf.get_u8(),
            })
        }
    };
    finish(buf, "PDU")?;
    Ok(pdu)
}

fn put_association_header(buf: &mut BytesMut, protocol_version: u16, called: &str, calling: &str) -> Result<()> {
    buf.put_u16(protocol_version);
    buf.put_u16(0);
    buf.extend_from_slice(&encode_ae_title(called, "called AE title")?);
    buf.extend_from_slice(&encode_ae_title(calling, "calling AE title")?);
    buf.put_bytes(0, 32);
    Ok(())
}

fn get_association_header(buf: &mut &[u8]) -> Result<(u16, String, String)> {
    need(buf, 2 + 2 + AE_TITLE_LENGTH * 2 + 32, "association PDU header")?;
    let protocol_version = buf.get_u16();
    buf.advance(2);
    let called = decode_ae_title(&buf[..AE_TITLE_LENGTH], "called AE title")?;
    buf.advance(AE_TITLE_LENGTH);
    let calling = decode_ae_title(&buf[..AE_TITLE_LENGTH], "calling AE title")?;
    buf.advance(AE_TITLE_LENGTH);
    buf.advance(32);
    Ok((protocol_version, called, calling))
}

fn encode_context_proposed(pc: &PresentationContextProposed) -> Result<BytesMut> {
    let mut value = BytesMut::new();
    value.put_u8(pc.id);
    value.put_bytes(0, 3);
    put_item(&mut value, ITEM_ABSTRACT_SYNTAX, &encode_text(&pc.abstract_syntax, "abstract syntax")?)?;
    for ts in &pc.transfer_syntaxes {
        put_item(&mut value, ITEM_TRANSFER_SYNTAX, &encode_text(ts, "transfer syntax")?)?;
    }
    Ok(value)
}

fn decode_context_proposed(mut value: &[u8]) -> Result<PresentationContextProposed> {
    need(value, 4, "presentation context item")?;
    let id = value.get_u8();
    value.advance(3);
    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();
    while value.has_remaining() {
        let (item_type, sub) = next_item(&mut value, "presentation context sub-item")?;
        match item_type {
            ITEM_ABSTRACT_SYNTAX => abstract_syntax = Some(decode_text(sub, "abstract syntax")?),
            ITEM_TRANSFER_SYNTAX => transfer_syntaxes.push(decode_text(sub, "transfer syntax")?),
            other => {
                return Err(DimseError::protocol(format!(
                    "unexpected sub-item {:#04x} in presentation context {}",
                    other, id
                )))
            }
        }
    }
    Ok(PresentationContextProposed {
        id,
        abstract_syntax: abstract_syntax
            .ok_or_else(|| DimseError::protocol(format!("presentation context {} without abstract syntax", id)))?,
        transfer_syntaxes,
    })
}

fn encode_context_result(pc: &PresentationContextResult) -> Result<BytesMut> {
    let mut value = BytesMut::new();
    value.put_u8(pc.id);
    value.put_u8(0);
    value.put_u8(pc.reason as u8);
    value.put_u8(0);
    put_item(&mut value, ITEM_TRANSFER_SYNTAX, &encode_text(&pc.transfer_syntax, "transfer syntax")?)?;
    Ok(value)
}

fn decode_context_result(mut value: &[u8]) -> Result<PresentationContextResult> {
    need(value, 4, "presentation context item")?;
    let id = value.get_u8();
    value.advance(1);
    let reason = ResultReason::try_from(value.get_u8())?;
    value.advance(1);
    let mut transfer_syntax = None;
    while value.has_remaining() {
        let (item_type, sub) = next_item(&mut value, "presentation context sub-item")?;
        match item_type {
            ITEM_TRANSFER_SYNTAX if transfer_syntax.is_none() => {
                transfer_syntax = Some(decode_text(sub, "transfer syntax")?)
            }
            ITEM_TRANSFER_SYNTAX => {
                return Err(DimseError::protocol(format!(
                    "presentation context {} accepted more than one transfer syntax",
                    id
                )))
            }
            other => {
                return Err(DimseError::protocol(format!(
                    "unexpected sub-item {:#04x} in presentation context {}",
                    other, id
                )))
            }
        }
    }
    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax: transfer_syntax.unwrap_or_default(),
    })
}

fn encode_user_variables(variables: &[UserVariable]) -> Result<BytesMut> {
    let mut value = BytesMut::new();
    for variable in variables {
        match variable {
            UserVariable::MaxLength(len) => put_item(&mut value, SUB_MAX_LENGTH, &len.to_be_bytes())?,
            UserVariable::ImplementationClassUid(uid) => {
                put_item(&mut value, SUB_IMPLEMENTATION_CLASS_UID, &encode_text(uid, "implementation class UID")?)?
            }
            UserVariable::AsynchronousOperationsWindow { invoked, performed } => {
                let mut sub = BytesMut::with_capacity(4);
                sub.put_u16(*invoked);
                sub.put_u16(*performed);
                put_item(&mut value, SUB_ASYNC_OPERATIONS_WINDOW, &sub)?
            }
            UserVariable::RoleSelection(role) => {
                let uid = encode_text(&role.sop_class_uid, "role selection SOP class")?;
                let mut sub = BytesMut::with_capacity(uid.len() + 4);
                put_u16_prefixed(&mut sub, &uid, "role selection SOP class")?;
                sub.put_u8(role.scu_role as u8);
                sub.put_u8(role.scp_role as u8);
                put_item(&mut value, SUB_ROLE_SELECTION, &sub)?
            }
            UserVariable::ImplementationVersionName(name) => put_item(
                &mut value,
                SUB_IMPLEMENTATION_VERSION_NAME,
                &encode_text(name, "implementation version name")?,
            )?,
            UserVariable::UserIdentity(identity) => {
                let mut sub = BytesMut::new();
                sub.put_u8(identity.identity_type as u8);
                sub.put_u8(identity.positive_response_requested as u8);
                put_u16_prefixed(&mut sub, &identity.primary_field, "user identity primary field")?;
                put_u16_prefixed(&mut sub, &identity.secondary_field, "user identity secondary field")?;
                put_item(&mut value, SUB_USER_IDENTITY, &sub)?
            }
            UserVariable::UserIdentityResponse(response) => {
                let mut sub = BytesMut::new();
                put_u16_prefixed(&mut sub, response, "user identity server response")?;
                put_item(&mut value, SUB_USER_IDENTITY_RESPONSE, &sub)?
            }
            UserVariable::Unknown { item_type, data } => put_item(&mut value, *item_type, data)?,
        }
    }
    Ok(value)
}

fn decode_user_variables(mut value: &[u8]) -> Result<Vec<UserVariable>> {
    let mut variables = Vec::new();
    while value.has_remaining() {
        let (item_type, mut sub) = next_item(&mut value, "user information sub-item")?;
        let variable = match item_type {
            SUB_MAX_LENGTH => {
                need(sub, 4, "maximum length sub-item")?;
                UserVariable::MaxLength(sub.get_u32())
            }
            SUB_IMPLEMENTATION_CLASS_UID => {
                let uid = decode_text(sub, "implementation class UID")?;
                sub = &[];
                UserVariable::ImplementationClassUid(uid)
            }
            SUB_ASYNC_OPERATIONS_WINDOW => {
                need(sub, 4, "asynchronous operations window sub-item")?;
                UserVariable::AsynchronousOperationsWindow {
                    invoked: sub.get_u16(),
                    performed: sub.get_u16(),
                }
            }
            SUB_ROLE_SELECTION => {
                let uid = get_u16_prefixed(&mut sub, "role selection SOP class")?;
                need(sub, 2, "role selection flags")?;
                UserVariable::RoleSelection(RoleSelection {
                    sop_class_uid: decode_text(uid, "role selection SOP class")?,
                    scu_role: sub.get_u8() != 0,
                    scp_role: sub.get_u8() != 0,
                })
            }
            SUB_IMPLEMENTATION_VERSION_NAME => {
                let name = decode_text(sub, "implementation version name")?;
                sub = &[];
                UserVariable::ImplementationVersionName(name)
            }
            SUB_USER_IDENTITY => {
                need(sub, 2, "user identity sub-item")?;
                let identity_type = UserIdentityType::try_from(sub.get_u8())?;
                let positive_response_requested = sub.get_u8() != 0;
                let primary_field = get_u16_prefixed(&mut sub, "user identity primary field")?.to_vec();
                let secondary_field = get_u16_prefixed(&mut sub, "user identity secondary field")?.to_vec();
                UserVariable::UserIdentity(UserIdentity {
                    identity_type,
                    positive_response_requested,
                    primary_field,
                    secondary_field,
                })
            }
            SUB_USER_IDENTITY_RESPONSE => {
                UserVariable::UserIdentityResponse(get_u16_prefixed(&mut sub, "user identity server response")?.to_vec())
            }
            other => {
                let data = sub.to_vec();
                sub = &[];
                UserVariable::Unknown { item_type: other, data }
            }
        };
        finish(sub, "user information sub-item")?;
        variables.push(variable);
    }
    Ok(variables)
}

fn put_item(buf: &mut BytesMut, item_type: u8, value: &[u8]) -> Result<()> {
    let length = u16::try_from(value.len())
        .map_err(|_| DimseError::protocol(format!("item {:#04x} exceeds 16-bit length", item_type)))?;
    buf.put_u8(item_type);
    buf.put_u8(0);
    buf.put_u16(length);
    buf.extend_from_slice(value);
    Ok(())
}

fn next_item<'a>(buf: &mut &'a [u8], what: &str) -> Result<(u8, &'a [u8])> {
    need(buf, 4, what)?;
    let item_type = buf.get_u8();
    buf.advance(1);
    let length = buf.get_u16() as usize;
    need(buf, length, what)?;
    let (value, rest) = buf.split_at(length);
    *buf = rest;
    Ok((item_type, value))
}

fn put_u16_prefixed(buf: &mut BytesMut, value: &[u8], what: &str) -> Result<()> {
    let length = u16::try_from(value.len()).map_err(|_| DimseError::protocol(format!("{} exceeds 16-bit length", what)))?;
    buf.put_u16(length);
    buf.extend_from_slice(value);
    Ok(())
}

fn get_u16_prefixed<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    need(buf, 2, what)?;
    let length = buf.get_u16() as usize;
    need(buf, length, what)?;
    let (value, rest) = buf.split_at(length);
    *buf = rest;
    Ok(value)
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(DimseError::protocol(format!(
            "{} needs {} bytes but only {} remain",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn finish(buf: &[u8], what: &str) -> Result<()> {
    if buf.has_remaining() {
        return Err(DimseError::protocol(format!("{} trailing bytes inside {}", buf.remaining(), what)));
    }
    Ok(())
}

fn encode_text(text: &str, field: &str) -> Result<Vec<u8>> {
    DefaultCharacterSetCodec
        .encode(text)
        .map_err(|e| DimseError::protocol(format!("could not encode {}: {}", field, e)))
}

fn decode_text(bytes: &[u8], field: &str) -> Result<String> {
    let text = DefaultCharacterSetCodec
        .decode(bytes)
        .map_err(|e| DimseError::protocol(format!("could not decode {}: {}", field, e)))?;
    Ok(text.trim_end_matches(|c: char| c == '\0' || c == ' ').to_string())
}

fn encode_ae_title(title: &str, field: &str) -> Result<[u8; AE_TITLE_LENGTH]> {
    let encoded = encode_text(title, field)?;
    if encoded.len() > AE_TITLE_LENGTH {
        return Err(DimseError::config(format!(
            "{} '{}' is longer than {} characters",
            field, title, AE_TITLE_LENGTH
        )));
    }
    let mut padded = [b' '; AE_TITLE_LENGTH];
    padded[..encoded.len()].copy_from_slice(&encoded);
    Ok(padded)
}

fn decode_ae_title(bytes: &[u8], field: &str) -> Result<String> {
    Ok(decode_text(bytes, field)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uids;

    fn sample_rq() -> AssociateRq {
        AssociateRq {
            protocol_version: 1,
            called_ae_title: "STORE_SCP".to_string(),
            calling_ae_title: "MODALITY".to_string(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: uids::VERIFICATION.to_string(),
                    transfer_syntaxes: vec![
                        uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                        uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    ],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: uids::CT_IMAGE_STORAGE.to_string(),
                    transfer_syntaxes: vec![uids::JPEG_BASELINE.to_string()],
                },
            ],
            user_variables: vec![
                UserVariable::MaxLength(16384),
                UserVariable::ImplementationClassUid(uids::IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariable::AsynchronousOperationsWindow { invoked: 1, performed: 1 },
                UserVariable::RoleSelection(RoleSelection {
                    sop_class_uid: uids::CT_IMAGE_STORAGE.to_string(),
                    scu_role: false,
                    scp_role: true,
                }),
                UserVariable::ImplementationVersionName(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
                UserVariable::UserIdentity(UserIdentity::username_password("radiology", "s3cret")),
                UserVariable::Unknown { item_type: 0x57, data: vec![0, 2, 0x31, 0x32] },
            ],
        }
    }

    fn round_trip(pdu: Pdu) {
        let encoded = encode_pdu(&pdu).unwrap();
        let decoded = decode_pdu_frame(&encoded).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_associate_rq_round_trip() {
        round_trip(Pdu::AssociateRq(sample_rq()));
    }

    #[test]
    fn test_associate_ac_round_trip() {
        round_trip(Pdu::AssociateAc(AssociateAc {
            protocol_version: 1,
            called_ae_title: "STORE_SCP".to_string(),
            calling_ae_title: "MODALITY".to_string(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: vec![
                PresentationContextResult {
                    id: 1,
                    reason: ResultReason::Acceptance,
                    transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                },
                PresentationContextResult {
                    id: 3,
                    reason: ResultReason::TransferSyntaxNotSupported,
                    transfer_syntax: String::new(),
                },
            ],
            user_variables: vec![
                UserVariable::MaxLength(0),
                UserVariable::UserIdentityResponse(b"token".to_vec()),
            ],
        }));
    }

    #[test]
    fn test_fixed_size_pdus_round_trip() {
        round_trip(Pdu::AssociateRj(AssociateRj::called_ae_not_recognized()));
        round_trip(Pdu::ReleaseRq);
        round_trip(Pdu::ReleaseRp);
        round_trip(Pdu::Abort(Abort::unexpected_pdu()));
    }

    #[test]
    fn test_pdata_round_trip_with_empty_pdv() {
        round_trip(Pdu::PData(vec![
            Pdv { context_id: 1, is_command: true, is_last: true, data: Bytes::from_static(&[1, 2, 3, 4]) },
            Pdv { context_id: 1, is_command: false, is_last: false, data: Bytes::new() },
            Pdv { context_id: 255, is_command: false, is_last: true, data: Bytes::from(vec![0xAB; 1000]) },
        ]));
    }

    #[test]
    fn test_header_layout() {
        let encoded = encode_pdu(&Pdu::Abort(Abort::unexpected_pdu())).unwrap();
        assert_eq!(&encoded[..], &[0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x02]);

        let encoded = encode_pdu(&Pdu::ReleaseRq).unwrap();
        assert_eq!(&encoded[..], &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_ae_titles_are_space_padded() {
        let encoded = encode_pdu(&Pdu::AssociateRq(sample_rq())).unwrap();
        // header(6) + version(2) + reserved(2)
        assert_eq!(&encoded[10..26], b"STORE_SCP       ");
        assert_eq!(&encoded[26..42], b"MODALITY        ");
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut encoded = encode_pdu(&Pdu::ReleaseRp).unwrap().to_vec();
        encoded.push(0);
        assert!(matches!(decode_pdu_frame(&encoded), Err(DimseError::Protocol(_))));

        let truncated = &encoded[..8];
        assert!(matches!(decode_pdu_frame(truncated), Err(DimseError::Protocol(_))));

        let huge = [0x04, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00];
        assert!(decode_pdu_frame(&huge).is_err());
    }

    #[test]
    fn test_rejects_trailing_garbage_inside_item() {
        // Maximum length sub-item declaring 5 bytes instead of 4
        let mut body = BytesMut::new();
        put_association_header(&mut body, 1, "A", "B").unwrap();
        put_item(&mut body, ITEM_APPLICATION_CONTEXT, uids::APPLICATION_CONTEXT.as_bytes()).unwrap();
        let mut user = BytesMut::new();
        put_item(&mut user, SUB_MAX_LENGTH, &[0, 0, 0x40, 0, 0]).unwrap();
        put_item(&mut body, ITEM_USER_INFORMATION, &user).unwrap();
        let err = decode_pdu(0x01, &body).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_rejects_truncated_pdv() {
        let body = [0x00, 0x00, 0x00, 0x10, 0x01, 0x03, 0xAA];
        assert!(decode_pdu(0x04, &body).is_err());
        let body = [0x00, 0x00, 0x00, 0x01, 0x01];
        assert!(decode_pdu(0x04, &body).is_err());
    }

    #[test]
    fn test_rejects_oversized_ae_title() {
        let mut rq = sample_rq();
        rq.calling_ae_title = "A".repeat(17);
        assert!(matches!(encode_pdu(&Pdu::AssociateRq(rq)), Err(DimseError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_pdu_type() {
        assert!(decode_pdu(0x09, &[0, 0, 0, 0]).is_err());
    }
}
