/// OP_MSG framing
///
/// Every command and reply travels as one OP_MSG: a 16 byte header, a flag
/// word, and a single kind-0 body section holding the command document.
/// Kind-1 document sequences in replies are skipped.
use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RutaError, RutaResult};

pub const OP_MSG: i32 = 2013;
pub const HEADER_LEN: usize = 16;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

pub const CHECKSUM_PRESENT: u32 = 1;
pub const MORE_TO_COME: u32 = 1 << 1;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Process-wide monotonically increasing request id
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    fn parse(mut buf: &[u8]) -> Self {
        Self {
            length: buf.get_i32_le(),
            request_id: buf.get_i32_le(),
            response_to: buf.get_i32_le(),
            op_code: buf.get_i32_le(),
        }
    }
}

/// A decoded OP_MSG
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: u32,
    pub document: Document,
}

impl Message {
    pub fn new(request_id: i32, document: Document) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: 0,
            document,
        }
    }

    pub fn reply_to(request_id: i32, response_to: i32, document: Document) -> Self {
        Self {
            request_id,
            response_to,
            flags: 0,
            document,
        }
    }

    pub fn encode(&self) -> RutaResult<Bytes> {
        let body = bson::to_vec(&self.document)?;

        // flags and checksum are never written by this side
        let length = HEADER_LEN + 4 + 1 + body.len();
        let length = i32::try_from(length)
            .map_err(|_| RutaError::protocol(format!("message of {} bytes is too large", length)))?;

        let mut buf = BytesMut::with_capacity(length as usize);
        buf.put_i32_le(length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(OP_MSG);
        buf.put_u32_le(self.flags & !CHECKSUM_PRESENT);
        buf.put_u8(0);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a complete message, header included
    pub fn decode(bytes: &[u8]) -> RutaResult<Self> {
        if bytes.len() < HEADER_LEN + 4 {
            return Err(RutaError::protocol("message shorter than OP_MSG header"));
        }
        let header = MessageHeader::parse(&bytes[..HEADER_LEN]);
        if header.length as usize != bytes.len() {
            return Err(RutaError::protocol(format!(
                "header declares {} bytes but message has {}",
                header.length,
                bytes.len()
            )));
        }
        if header.op_code != OP_MSG {
            return Err(RutaError::protocol(format!(
                "unsupported opcode {}",
                header.op_code
            )));
        }

        let mut rest = &bytes[HEADER_LEN..];
        let flags = rest.get_u32_le();
        if flags & MORE_TO_COME != 0 {
            return Err(RutaError::protocol("streamed replies are not requested by this client"));
        }
        if flags & CHECKSUM_PRESENT != 0 {
            if rest.len() < 4 {
                return Err(RutaError::protocol("missing checksum"));
            }
            rest = &rest[..rest.len() - 4];
        }

        let mut document = None;
        while rest.has_remaining() {
            let kind = rest.get_u8();
            match kind {
                0 => {
                    let len = section_len(rest)?;
                    if document.is_some() {
                        return Err(RutaError::protocol("more than one body section"));
                    }
                    document = Some(bson::from_slice::<Document>(&rest[..len])?);
                    rest.advance(len);
                }
                1 => {
                    let len = section_len(rest)?;
                    rest.advance(len);
                }
                other => {
                    return Err(RutaError::protocol(format!("unknown section kind {}", other)));
                }
            }
        }

        let document = document.ok_or_else(|| RutaError::protocol("message has no body section"))?;
        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> RutaResult<()> {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(
        reader: &mut R,
        max_message_size: usize,
    ) -> RutaResult<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let length = MessageHeader::parse(&header).length;
        if length < (HEADER_LEN + 4) as i32 || length as usize > max_message_size {
            return Err(RutaError::protocol(format!("invalid message length {}", length)));
        }

        let mut bytes = vec![0u8; length as usize];
        bytes[..HEADER_LEN].copy_from_slice(&header);
        reader.read_exact(&mut bytes[HEADER_LEN..]).await?;
        Self::decode(&bytes)
    }
}

/// Length of the section starting at `buf`, which begins with an i32 size
fn section_len(buf: &[u8]) -> RutaResult<usize> {
    if buf.len() < 4 {
        return Err(RutaError::protocol("truncated section"));
    }
    let len = (&buf[..4]).get_i32_le();
    if len < 5 || len as usize > buf.len() {
        return Err(RutaError::protocol(format!("invalid section length {}", len)));
    }
    Ok(len as usize)
}
