//! Splitting outbound messages into PDVs and joining inbound ones

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;

use crate::error::{DimseError, Result};
use crate::pdu::{write_pdu, Pdu, Pdv, PDV_HEADER_LENGTH};

/// Payload bytes available per PDV for a given maximum PDU length.
///
/// Rounded down to an even number since every PDV payload must be even.
pub fn fragment_capacity(max_pdu_length: u32) -> usize {
    let usable = (max_pdu_length as usize).saturating_sub(PDV_HEADER_LENGTH);
    (usable & !1).max(2)
}

/// Buffers a command or data set and emits one P-DATA-TF per full buffer.
///
/// A writer is bound to a single presentation context and is either a
/// command stream or a data stream for its whole life. [`PdvWriter::close`]
/// must be called to emit the final fragment.
pub struct PdvWriter<'a, W: ?Sized> {
    writer: &'a mut W,
    context_id: u8,
    is_command: bool,
    capacity: usize,
    buffer: BytesMut,
    fragments: usize,
}

impl<'a, W> PdvWriter<'a, W>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    pub fn new(writer: &'a mut W, context_id: u8, is_command: bool, max_pdu_length: u32) -> Self {
        let capacity = fragment_capacity(max_pdu_length);
        Self {
            writer,
            context_id,
            is_command,
            capacity,
            buffer: BytesMut::with_capacity(capacity.min(64 * 1024)),
            fragments: 0,
        }
    }

    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = self.capacity - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.capacity {
                self.flush(false).await?;
            }
        }
        Ok(())
    }

    /// Emits the last fragment, padding an odd payload with one zero byte.
    ///
    /// Returns the number of PDVs written by this stream.
    pub async fn close(mut self) -> Result<usize> {
        if self.buffer.len() % 2 == 1 {
            self.buffer.extend_from_slice(&[0]);
        }
        self.flush(true).await?;
        Ok(self.fragments)
    }

    async fn flush(&mut self, is_last: bool) -> Result<()> {
        let data = self.buffer.split().freeze();
        let pdu = Pdu::PData(vec![Pdv {
            context_id: self.context_id,
            is_command: self.is_command,
            is_last,
            data,
        }]);
        write_pdu(&mut *self.writer, &pdu).await?;
        self.fragments += 1;
        Ok(())
    }
}

/// Collects PDV fragments of one DIMSE message in arrival order.
#[derive(Debug, Default)]
pub struct Reassembler {
    context_id: Option<u8>,
    command: BytesMut,
    data: BytesMut,
    command_complete: bool,
    data_complete: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presentation context the current message arrived on
    pub fn context_id(&self) -> Option<u8> {
        self.context_id
    }

    pub fn push(&mut self, pdv: Pdv) -> Result<()> {
        match self.context_id {
            None => self.context_id = Some(pdv.context_id),
            Some(id) if id != pdv.context_id => {
                return Err(DimseError::protocol(format!(
                    "PDV on presentation context {} interleaved with message on context {}",
                    pdv.context_id, id
                )))
            }
            Some(_) => {}
        }

        if pdv.is_command {
            if self.command_complete {
                return Err(DimseError::protocol("command fragment after last command fragment"));
            }
            self.command.extend_from_slice(&pdv.data);
            self.command_complete = pdv.is_last;
        } else {
            if !self.command_complete {
                return Err(DimseError::protocol("data set fragment before complete command"));
            }
            if self.data_complete {
                return Err(DimseError::protocol("data set fragment after last data set fragment"));
            }
            self.data.extend_from_slice(&pdv.data);
            self.data_complete = pdv.is_last;
        }
        Ok(())
    }

    pub fn command_complete(&self) -> bool {
        self.command_complete
    }

    pub fn data_complete(&self) -> bool {
        self.data_complete
    }

    /// Assembled command bytes, once the last command fragment arrived
    pub fn command(&self) -> Option<&[u8]> {
        self.command_complete.then_some(&self.command[..])
    }

    /// Takes the assembled message and resets for the next one.
    pub fn take(&mut self) -> (u8, Bytes, Option<Bytes>) {
        let context_id = self.context_id.take().unwrap_or_default();
        let command = self.command.split().freeze();
        let data = self.data_complete.then(|| self.data.split().freeze());
        self.data.clear();
        self.command_complete = false;
        self.data_complete = false;
        (context_id, command, data)
    }
}
