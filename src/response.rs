//! Responses, return codes and the terminal [`Responder`] callback.
//!
//! A return code is a plain `u32` partitioned into bands (see [`rc`]):
//!
//! ```text
//! 0                               OK
//! [1, rc::RESTARTABLE)            application codes, opaque to the runtime
//! [rc::RESTARTABLE, rc::FATAL_ERROR)   restartable transport codes
//! [rc::FATAL_ERROR, u32::MAX]     fatal transport codes
//! ```
//!
//! `rc::INVALID == rc::RESTARTABLE` is the validity floor: a response whose
//! code is at or above it carries no usable body.

use bytes::Bytes;

/// Message tag which goes first in a packet.
pub type RequestType = u32;

/// Return code which lays in the first bytes of a response body.
pub type RetCode = u32;

/// Return code bands and reserved codes.
pub mod rc {
    use super::RetCode;

    /// Good answer.
    pub const OK: RetCode = 0;

    /// Service is shutting down; the request was never sent.
    pub const SHUTDOWN: RetCode = 0xFFFF_FFFE;
    /// Peer violated the wire protocol.
    pub const PROTOCOL_ERROR: RetCode = 0xFFFF_FFFD;
    /// Request could not be performed.
    pub const FAILED: RetCode = 0xFFFF_FFFC;

    /// Floor of the fatal-transport band.
    pub const FATAL_ERROR: RetCode = 0xFFFF_FEFB;
    /// Write side timed out before the request hit the wire.
    pub const SEND_TIMEOUT: RetCode = 0xFFFF_FEFD;
    /// Read side timed out waiting for the response.
    pub const RECV_TIMEOUT: RetCode = 0xFFFF_FEFC;
    /// Socket disconnected before the answer arrived; safe to resend.
    pub const IO_ERROR: RetCode = 0xFFFF_FEF8;

    /// Floor of the restartable-transport band.
    pub const RESTARTABLE: RetCode = 0xFFFF_FDFE;
    /// Request expired on a timer (request, wait-group or context).
    pub const TIMEOUT: RetCode = 0xFFFF_FDFF;
    /// Request was cancelled by the caller side.
    pub const CANCELED: RetCode = 0xFFFF_FE00;

    /// Validity floor: codes at or above carry no usable body.
    pub const INVALID: RetCode = RESTARTABLE;
}

/// A terminal response to a [`Request`](crate::Request).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Message tag, copied from the request.
    pub msg: RequestType,
    /// Caller-assigned logical id, copied from the request.
    pub id: u32,
    /// Outcome category.
    pub code: RetCode,
    /// Opaque body bytes (empty for failure codes).
    pub body: Bytes,
}

impl Response {
    /// Whether the body is usable (code below the validity floor).
    #[inline]
    pub fn valid(&self) -> bool {
        self.code < rc::INVALID
    }

    /// Whether the request may be resent after this outcome.
    #[inline]
    pub fn restartable(&self) -> bool {
        self.code < rc::FATAL_ERROR
    }
}

/// The terminal callback of a request.
///
/// Invoked exactly once over a request's lifetime, after the middleware
/// chain has been walked to completion.
pub trait Responder: Send + Sync {
    fn respond(&self, res: Response);
}

/// Responder calling a plain function.
pub struct Callback<F: Fn(Response) + Send + Sync>(pub F);

impl<F: Fn(Response) + Send + Sync> Responder for Callback<F> {
    fn respond(&self, res: Response) {
        (self.0)(res)
    }
}
