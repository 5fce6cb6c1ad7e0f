//! Framing for update queue connections.
//!
//! All integers are big-endian. A connection opens with the node id (u64), answered by a
//! response. After that the client sends requests, each a request number (u16) followed
//! by a u32-length-prefixed JSON body, and the server answers every request in order.
//! A response is a single `1` byte for success, or a `0` byte followed by the kind and
//! message of the error, each a u32-length-prefixed UTF-8 string.

use crate::sequence::RequestNumber;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use cachestore_api::{Error as ApiError, UpdateRequest};
use cachestore_id::NodeId;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the limit of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("request number {0} is out of range")]
    BadRequestNumber(u16),

    #[error("response flag {0} is neither 0 nor 1")]
    BadFlag(u8),

    #[error("error string is not UTF-8")]
    BadUtf8,
}

impl From<CodecError> for ApiError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => Self::Network(e.to_string()),
            e => Self::IllegalState(e.to_string()),
        }
    }
}

/// What a client writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Hello(NodeId),
    Request {
        number: RequestNumber,
        request: UpdateRequest,
    },
}

/// What a server writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Failed { kind: String, message: String },
}

impl Response {
    pub fn from_result(result: &Result<(), ApiError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => Self::Failed {
                kind: e.kind_name().to_string(),
                message: e.remote_message(),
            },
        }
    }

    pub fn into_result(self) -> Result<(), ApiError> {
        match self {
            Self::Ok => Ok(()),
            Self::Failed { kind, message } => Err(ApiError::from_remote(&kind, message)),
        }
    }
}

/// Decodes [`ClientFrame`]s and encodes [`Response`]s.
#[derive(Debug, Default)]
#[allow(missing_copy_implementations)]
pub struct ServerCodec {
    greeted: bool,
}

/// Encodes [`ClientFrame`]s and decodes [`Response`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientCodec;

fn check_len(len: usize) -> Result<usize, CodecError> {
    if len > MAX_FRAME_LEN {
        Err(CodecError::FrameTooLarge(len))
    } else {
        Ok(len)
    }
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    let len = check_len(s.len())?;
    let mut prefix = [0u8; 4];
    BigEndian::write_u32(&mut prefix, len as u32);
    dst.extend_from_slice(&prefix);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Length of a u32-prefixed item starting at `offset`, if its prefix is available.
fn prefixed_len(src: &[u8], offset: usize) -> Result<Option<usize>, CodecError> {
    if src.len() < offset + 4 {
        return Ok(None);
    }
    let len = BigEndian::read_u32(&src[offset..offset + 4]) as usize;
    check_len(len).map(Some)
}

impl Decoder for ServerCodec {
    type Item = ClientFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.greeted {
            if src.len() < 8 {
                return Ok(None);
            }
            let node_id = NodeId::new(BigEndian::read_u64(&src[..8]));
            src.advance(8);
            self.greeted = true;
            return Ok(Some(ClientFrame::Hello(node_id)));
        }

        if src.len() < 2 {
            return Ok(None);
        }
        let Some(len) = prefixed_len(src, 2)? else {
            return Ok(None);
        };
        if src.len() < 6 + len {
            src.reserve(6 + len - src.len());
            return Ok(None);
        }
        let raw_number = BigEndian::read_u16(&src[..2]);
        let number = RequestNumber::new(raw_number).ok_or(CodecError::BadRequestNumber(raw_number))?;
        let request = serde_json::from_slice(&src[6..6 + len])?;
        src.advance(6 + len);
        Ok(Some(ClientFrame::Request { number, request }))
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Response::Ok => dst.extend_from_slice(&[1]),
            Response::Failed { kind, message } => {
                dst.extend_from_slice(&[0]);
                put_string(dst, &kind)?;
                put_string(dst, &message)?;
            }
        }
        Ok(())
    }
}

impl Encoder<ClientFrame> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ClientFrame::Hello(node_id) => {
                let mut buf = [0u8; 8];
                BigEndian::write_u64(&mut buf, node_id.as_u64());
                dst.extend_from_slice(&buf);
            }
            ClientFrame::Request { number, request } => {
                let body = serde_json::to_vec(&request)?;
                let len = check_len(body.len())?;
                let mut header = [0u8; 6];
                BigEndian::write_u16(&mut header[..2], number.get());
                BigEndian::write_u32(&mut header[2..], len as u32);
                dst.extend_from_slice(&header);
                dst.extend_from_slice(&body);
            }
        }
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&flag) = src.first() else {
            return Ok(None);
        };
        match flag {
            1 => {
                src.advance(1);
                Ok(Some(Response::Ok))
            }
            0 => {
                let Some(kind_len) = prefixed_len(src, 1)? else {
                    return Ok(None);
                };
                let message_at = 5 + kind_len;
                let Some(message_len) = prefixed_len(src, message_at)? else {
                    return Ok(None);
                };
                let end = message_at + 4 + message_len;
                if src.len() < end {
                    return Ok(None);
                }
                let kind = std::str::from_utf8(&src[5..message_at])
                    .map_err(|_| CodecError::BadUtf8)?
                    .to_string();
                let message = std::str::from_utf8(&src[message_at + 4..end])
                    .map_err(|_| CodecError::BadUtf8)?
                    .to_string();
                src.advance(end);
                Ok(Some(Response::Failed { kind, message }))
            }
            flag => Err(CodecError::BadFlag(flag)),
        }
    }
}
