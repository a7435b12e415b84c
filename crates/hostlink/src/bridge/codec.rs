//! Framed codec for host-worker communication.
//!
//! Each frame is a fixed 13-byte big-endian header followed by `content_length`
//! bytes of postcard-encoded content:
//!
//! ```text
//! | kind: u8 | request_id: u32 | request_kind: u16 | result_code: u16 | content_length: u32 |
//! ```
//!
//! The decoder is incremental: it holds on to a parsed header until the whole
//! content has accumulated, so arbitrary chunk boundaries never yield a partial
//! message. Works over any AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    ErrorPayload, Message, MessageKind, Payload, RequestBody, RequestId, RequestKind,
    ResponseBody, ResultCode,
};

pub const HEADER_LEN: usize = 13;

/// Upper bound on announced content length. Larger frames are treated as malformed.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    pub request_id: RequestId,
    pub request_kind: RequestKind,
    pub result_code: ResultCode,
    pub content_length: u32,
}

impl FrameHeader {
    fn parse(mut buf: &[u8]) -> io::Result<Self> {
        let raw_kind = buf.get_u8();
        let request_id = buf.get_u32();
        let raw_request_kind = buf.get_u16();
        let raw_code = buf.get_u16();
        let content_length = buf.get_u32();

        let kind = MessageKind::from_u8(raw_kind)
            .ok_or_else(|| invalid(format!("unknown message kind {raw_kind}")))?;
        let request_kind = RequestKind::from_u16(raw_request_kind)
            .ok_or_else(|| invalid(format!("unknown request kind {raw_request_kind}")))?;
        let result_code = ResultCode::from_u16(raw_code)
            .ok_or_else(|| invalid(format!("unknown result code {raw_code}")))?;
        if content_length as usize > MAX_CONTENT_LENGTH {
            return Err(invalid(format!(
                "frame content length {content_length} exceeds limit {MAX_CONTENT_LENGTH}"
            )));
        }

        Ok(Self {
            kind,
            request_id,
            request_kind,
            result_code,
            content_length,
        })
    }

    fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.request_id);
        dst.put_u16(self.request_kind as u16);
        dst.put_u16(self.result_code as u16);
        dst.put_u32(self.content_length);
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn decode_content(header: FrameHeader, content: &[u8]) -> io::Result<Message> {
    let payload = match (header.kind, header.result_code) {
        (MessageKind::Request, _) => {
            Payload::Request(RequestBody::decode(header.request_kind, content).map_err(|e| {
                invalid(format!("bad {} request content: {e}", header.request_kind))
            })?)
        }
        (MessageKind::Response, ResultCode::Ok) => {
            Payload::Response(ResponseBody::decode(header.request_kind, content).map_err(|e| {
                invalid(format!("bad {} response content: {e}", header.request_kind))
            })?)
        }
        (MessageKind::Response, code) => {
            let error: ErrorPayload = postcard::from_bytes(content)
                .map_err(|e| invalid(format!("bad error payload: {e}")))?;
            Payload::Error {
                kind: header.request_kind,
                code,
                error,
            }
        }
    };
    Ok(Message {
        request_id: header.request_id,
        payload,
    })
}

/// Codec framing [`Message`]s with a fixed header and postcard content.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header of the frame whose content is still accumulating.
    pending: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let header = FrameHeader::parse(&src[..HEADER_LEN])?;
                src.advance(HEADER_LEN);
                self.pending = Some(header);
                header
            }
        };

        let len = header.content_length as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let content = src.split_to(len);
        self.pending = None;
        decode_content(header, &content).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let content = match &item.payload {
            Payload::Request(body) => body.encode(),
            Payload::Response(body) => body.encode(),
            Payload::Error { error, .. } => postcard::to_allocvec(error),
        }
        .map_err(|e| invalid(format!("failed to encode {}: {e}", item.request_kind())))?;

        if content.len() > MAX_CONTENT_LENGTH {
            return Err(invalid(format!(
                "frame content length {} exceeds limit {MAX_CONTENT_LENGTH}",
                content.len()
            )));
        }

        let header = FrameHeader {
            kind: item.kind(),
            request_id: item.request_id,
            request_kind: item.request_kind(),
            result_code: item.result_code(),
            content_length: content.len() as u32,
        };
        // These events stay at trace: stream chunks make framing very chatty.
        tracing::trace!(
            request_id = header.request_id,
            request_kind = %header.request_kind,
            content_length = header.content_length,
            "Encoding frame"
        );

        dst.reserve(HEADER_LEN + content.len());
        header.write(dst);
        dst.extend_from_slice(&content);
        Ok(())
    }
}
