//! Frame encoding and decoding.
//!
//! Every packet starts with a fixed 12-byte header:
//!
//! ```text
//! ┌────────────┬─────────────┬────────────┐
//! │ Message    │ Body length │ Id         │
//! │ u32 LE     │ u32 LE      │ u32 LE     │
//! └────────────┴─────────────┴────────────┘
//! ```
//!
//! The next `length` bytes are the body. A response body begins with a
//! return code whose wire width is configured by [`RcType`]; requests carry
//! no return code. Pings (`msg = 0xFF00`, empty body, id `0xFFFF_FFFF` on
//! the request side) carry no return code in either direction.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{IprotoError, Result};
use crate::request::{PING, PING_REQUEST_ID};
use crate::response::{rc, RequestType, Response, RetCode};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Maximum accepted body length (1 GB).
pub const MAX_BODY_SIZE: u32 = 1_073_741_824;

/// Accumulated writes are pushed to the socket beyond this size even
/// without an explicit flush.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Wire width of the return code at the head of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcType {
    /// Single byte (low 8 bits of the code).
    U8,
    /// Little-endian 32-bit word.
    #[default]
    U32,
    /// Big-endian base-128 varint.
    Ber,
}

impl RcType {
    /// Split the return code off the front of a response body.
    pub fn decode(self, body: &mut Bytes) -> Result<RetCode> {
        match self {
            RcType::U8 => {
                if body.is_empty() {
                    return Err(short_body());
                }
                Ok(body.get_u8() as RetCode)
            }
            RcType::U32 => {
                if body.len() < 4 {
                    return Err(short_body());
                }
                Ok(body.get_u32_le())
            }
            RcType::Ber => {
                let mut code: u64 = 0;
                loop {
                    if body.is_empty() {
                        return Err(short_body());
                    }
                    let b = body.get_u8();
                    code = (code << 7) | u64::from(b & 0x7F);
                    if code > u64::from(u32::MAX) {
                        return Err(IprotoError::Protocol(
                            "ber-encoded return code overflows 32 bits".into(),
                        ));
                    }
                    if b & 0x80 == 0 {
                        return Ok(code as RetCode);
                    }
                }
            }
        }
    }

    /// Append the return code in wire form.
    pub fn encode(self, code: RetCode, buf: &mut BytesMut) {
        match self {
            RcType::U8 => buf.put_u8(code as u8),
            RcType::U32 => buf.put_u32_le(code),
            RcType::Ber => {
                let mut groups = [0u8; 5];
                let mut n = 0;
                let mut rest = code;
                loop {
                    groups[n] = (rest & 0x7F) as u8;
                    n += 1;
                    rest >>= 7;
                    if rest == 0 {
                        break;
                    }
                }
                for i in (0..n).rev() {
                    let cont = if i == 0 { 0 } else { 0x80 };
                    buf.put_u8(groups[i] | cont);
                }
            }
        }
    }
}

fn short_body() -> IprotoError {
    IprotoError::Protocol("response body shorter than the return code".into())
}

/// An inbound request frame.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub msg: RequestType,
    pub id: u32,
    pub body: Bytes,
}

impl RequestFrame {
    #[inline]
    pub fn is_ping(&self) -> bool {
        self.msg == PING
    }
}

/// Buffered frame writer over an async byte sink.
pub struct HeaderWriter<W> {
    w: W,
    rc_type: RcType,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> HeaderWriter<W> {
    pub fn new(w: W, rc_type: RcType) -> Self {
        HeaderWriter {
            w,
            rc_type,
            buf: BytesMut::with_capacity(FLUSH_THRESHOLD),
        }
    }

    fn put_header(&mut self, msg: RequestType, len: u32, id: u32) {
        self.buf.put_u32_le(msg);
        self.buf.put_u32_le(len);
        self.buf.put_u32_le(id);
    }

    /// Queue a request frame.
    pub async fn write_request(&mut self, msg: RequestType, id: u32, body: &[u8]) -> Result<()> {
        self.put_header(msg, body.len() as u32, id);
        self.buf.extend_from_slice(body);
        self.maybe_flush().await
    }

    /// Queue a response frame, prefixing the body with the return code in
    /// the configured width. Ping responses carry neither code nor body.
    pub async fn write_response(&mut self, res: &Response) -> Result<()> {
        if res.msg == PING {
            self.put_header(PING, 0, res.id);
            return self.maybe_flush().await;
        }
        let mut rc_buf = BytesMut::with_capacity(5);
        self.rc_type.encode(res.code, &mut rc_buf);
        let len = (rc_buf.len() + res.body.len()) as u32;
        self.put_header(res.msg, len, res.id);
        self.buf.extend_from_slice(&rc_buf);
        self.buf.extend_from_slice(&res.body);
        self.maybe_flush().await
    }

    /// Queue a ping request frame.
    pub async fn ping(&mut self) -> Result<()> {
        self.put_header(PING, 0, PING_REQUEST_ID);
        self.maybe_flush().await
    }

    async fn maybe_flush(&mut self) -> Result<()> {
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }

    /// Push everything queued to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let chunk = self.buf.split();
            self.w.write_all(&chunk).await?;
        }
        self.w.flush().await?;
        Ok(())
    }

    /// Flush and close the write side (half-close).
    pub async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.w.shutdown().await?;
        Ok(())
    }
}

/// Buffered frame reader over an async byte source.
pub struct HeaderReader<R> {
    r: BufReader<R>,
    rc_type: RcType,
}

impl<R: AsyncRead + Unpin> HeaderReader<R> {
    pub fn new(r: R, rc_type: RcType) -> Self {
        HeaderReader {
            r: BufReader::new(r),
            rc_type,
        }
    }

    async fn read_frame(&mut self) -> Result<(RequestType, u32, Bytes)> {
        let mut head = [0u8; HEADER_SIZE];
        self.r.read_exact(&mut head).await?;
        let msg = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        let id = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);
        if len > MAX_BODY_SIZE {
            return Err(IprotoError::Protocol(format!(
                "body length {len} exceeds maximum {MAX_BODY_SIZE}"
            )));
        }
        let body = if len == 0 {
            Bytes::new()
        } else {
            let mut body = vec![0u8; len as usize];
            self.r.read_exact(&mut body).await?;
            Bytes::from(body)
        };
        Ok((msg, id, body))
    }

    /// Read one inbound request frame.
    pub async fn read_request(&mut self) -> Result<RequestFrame> {
        let (msg, id, body) = self.read_frame().await?;
        Ok(RequestFrame { msg, id, body })
    }

    /// Read one response frame, splitting the return code off the body.
    pub async fn read_response(&mut self) -> Result<Response> {
        let (msg, id, mut body) = self.read_frame().await?;
        if msg == PING {
            return Ok(Response {
                msg,
                id,
                code: rc::OK,
                body: Bytes::new(),
            });
        }
        let code = self.rc_type.decode(&mut body)?;
        Ok(Response {
            msg,
            id,
            code,
            body,
        })
    }

    /// Read one frame and require it to be a ping (handshake).
    pub async fn read_ping(&mut self) -> Result<()> {
        let (msg, _, _) = self.read_frame().await?;
        if msg != PING {
            return Err(IprotoError::Protocol(format!(
                "expected ping during handshake, got msg {msg:#x}"
            )));
        }
        Ok(())
    }
}
