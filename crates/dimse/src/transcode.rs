//! Re-encoding data sets for the transfer syntax a peer accepted

use bytes::Bytes;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::debug;

use crate::error::{DimseError, Result};
use crate::uids;

/// How a data set was prepared for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transcoded {
    /// Source and target transfer syntax match; bytes are passed through
    Unchanged(Bytes),
    /// Decoded and written again in the target transfer syntax
    Reencoded(Bytes),
}

impl Transcoded {
    pub fn bytes(&self) -> &Bytes {
        match self {
            Transcoded::Unchanged(b) | Transcoded::Reencoded(b) => b,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Transcoded::Unchanged(b) | Transcoded::Reencoded(b) => b,
        }
    }
}

fn lookup(uid: &str) -> Result<&'static TransferSyntax> {
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| DimseError::Transcode(format!("unknown transfer syntax {}", uid)))
}

/// Whether a data set in `from` can be sent on a context that accepted `to`.
pub fn can_transcode(from: &str, to: &str) -> bool {
    from == to || (uids::is_native(from) && uids::is_native(to))
}

/// Prepares data set bytes encoded in `from` for a context that accepted `to`.
///
/// Identical transfer syntaxes copy the bytes as they are. Conversions
/// between native encodings go through a full decode and encode; anything
/// involving encapsulated pixel data is refused.
pub fn transcode(data: Bytes, from: &str, to: &str) -> Result<Transcoded> {
    if from == to {
        return Ok(Transcoded::Unchanged(data));
    }
    if !can_transcode(from, to) {
        return Err(DimseError::Transcode(format!(
            "cannot convert data set from {} to {}",
            from, to
        )));
    }

    let source = lookup(from)?;
    let target = lookup(to)?;
    let object = InMemDicomObject::read_dataset_with_ts(&data[..], source)
        .map_err(|e| DimseError::Transcode(format!("failed to read data set as {}: {}", from, e)))?;
    let mut out = Vec::with_capacity(data.len());
    object
        .write_dataset_with_ts(&mut out, target)
        .map_err(|e| DimseError::Transcode(format!("failed to write data set as {}: {}", to, e)))?;
    debug!(from, to, before = data.len(), after = out.len(), "data set re-encoded");
    Ok(Transcoded::Reencoded(Bytes::from(out)))
}

/// Decodes a data set received on a context.
pub fn read_data_set(data: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, lookup(transfer_syntax)?)
        .map_err(|e| DimseError::DicomObject(format!("failed to read data set: {}", e)))
}

/// Encodes a data set for a context.
pub fn write_data_set(object: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    object
        .write_dataset_with_ts(&mut out, lookup(transfer_syntax)?)
        .map_err(|e| DimseError::DicomObject(format!("failed to write data set: {}", e)))?;
    Ok(out)
}
