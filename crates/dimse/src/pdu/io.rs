//! Async PDU framing over any byte stream

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{DimseError, Result};
use crate::pdu::{decode_pdu, encode_pdu, Pdu, PDU_HEADER_LENGTH};

/// Reads one complete PDU from the stream.
///
/// A PDU whose declared length exceeds `max_length` is refused before its
/// body is read, so a hostile length field cannot force a huge allocation.
pub async fn read_pdu<R>(reader: &mut R, max_length: u32) -> Result<Pdu>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; PDU_HEADER_LENGTH];
    reader.read_exact(&mut header).await?;

    let pdu_type = header[0];
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    if length > max_length {
        return Err(DimseError::protocol(format!(
            "PDU type {:#04x} declares {} bytes, limit is {}",
            pdu_type, length, max_length
        )));
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;

    let pdu = decode_pdu(pdu_type, &body)?;
    trace!("<- {}", pdu.short_description());
    Ok(pdu)
}

/// Encodes and writes one PDU, flushing the stream afterwards.
pub async fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_pdu(pdu)?;
    trace!("-> {}", pdu.short_description());
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
