use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
};
use crate::error::{Error, ErrorKind, Result};

const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Represents an OP_MSG wire protocol operation carrying a single command document.
#[derive(Debug)]
pub(crate) struct Message {
    /// OP_MSG payload type 0.
    pub(crate) document_payload: Document,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Creates a `Message` that runs `command` against the database `db`. Note that the
    /// `response_to` field must be set manually.
    pub(crate) fn from_command(mut command: Document, db: &str, request_id: Option<i32>) -> Self {
        command.insert("$db", db);
        Self {
            document_payload: command,
            response_to: 0,
            flags: MessageFlags::empty(),
            request_id,
        }
    }

    /// Creates a reply to the message with id `response_to`.
    #[cfg(test)]
    pub(crate) fn reply(document: Document, response_to: i32) -> Self {
        Self {
            document_payload: document,
            response_to,
            flags: MessageFlags::empty(),
            request_id: None,
        }
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<T: AsyncRead + Unpin + Send>(
        reader: &mut T,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len {
            return Err(ErrorKind::InvalidResponse {
                message: format!("Message length {} over maximum {}", header.length, max_len),
            }
            .into());
        }

        if header.op_code != OpCode::Message {
            return Err(Error::invalid_response(format!(
                "Invalid op code, expected {} and got {}",
                OpCode::Message as i32,
                header.op_code as i32
            )));
        }

        let length_remaining = usize::try_from(header.length)
            .ok()
            .and_then(|len| len.checked_sub(Header::LENGTH))
            .ok_or_else(|| {
                Error::invalid_response(format!("Invalid message length: {}", header.length))
            })?;
        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        Self::read_op_common(&buf, &header)
    }

    fn read_op_common(mut bytes: &[u8], header: &Header) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(read_u32(&mut bytes)?);
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            let end = bytes.len().checked_sub(4).ok_or_else(|| {
                Error::invalid_response("message flagged a checksum but was too short to hold one")
            })?;
            bytes = &bytes[..end];
        }

        let mut document_payload = None;
        while !bytes.is_empty() {
            match MessageSection::read(&mut bytes)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence => {}
            }
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| {
                Error::invalid_response(
                    "an OP_MSG response must contain exactly one payload type 0 section",
                )
            })?,
            request_id: Some(header.request_id),
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`. Returns the request id used.
    pub(crate) async fn write_to<T: AsyncWrite + Send + Unpin>(&self, writer: &mut T) -> Result<i32> {
        let mut sections = vec![0u8];
        self.document_payload.to_writer(&mut sections)?;

        let total_length = Header::LENGTH + std::mem::size_of::<u32>() + sections.len();
        let request_id = self.request_id.unwrap_or_else(next_request_id);
        let header = Header {
            length: i32::try_from(total_length)
                .map_err(|_| Error::invalid_argument("command document is too large"))?,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&sections).await?;
        writer.flush().await?;

        Ok(request_id)
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A section of an OP_MSG. Document sequences (payload type 1) are skipped.
#[derive(Debug)]
enum MessageSection {
    Document(Document),
    Sequence,
}

impl MessageSection {
    fn read(bytes: &mut &[u8]) -> Result<Self> {
        let (&payload_type, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::invalid_response("truncated OP_MSG section"))?;
        *bytes = rest;

        let size = peek_i32(bytes)?;
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size >= 4 && *size <= bytes.len())
            .ok_or_else(|| Error::invalid_response(format!("invalid section size {size}")))?;
        let (section, rest) = bytes.split_at(size);
        *bytes = rest;

        match payload_type {
            0 => {
                let mut section = section;
                Ok(MessageSection::Document(Document::from_reader(&mut section)?))
            }
            1 => Ok(MessageSection::Sequence),
            other => Err(Error::invalid_response(format!(
                "invalid OP_MSG payload type {other}"
            ))),
        }
    }
}

fn peek_i32(bytes: &[u8]) -> Result<i32> {
    bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_le_bytes)
        .ok_or_else(|| Error::invalid_response("truncated OP_MSG"))
}

fn read_u32(bytes: &mut &[u8]) -> Result<u32> {
    let value = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::invalid_response("truncated OP_MSG"))?;
    *bytes = &bytes[4..];
    Ok(value)
}
