//! Per-call request state machine.
//!
//! A [`Request`] atomically tracks its lifecycle and drives the attached
//! middleware chain when a terminal event (response, cancellation, expiry)
//! arrives:
//!
//! ```text
//! New ──► Pending ──► InFly ──► Prepared ──► Performed
//!              ▲                    │
//!              └────────────────────┘  reset_to_pending (resend hijack)
//! ```
//!
//! The state word advances monotonically; the terminal transition to
//! `Performed` happens exactly once. `Prepared` is the cooperative window in
//! which a middleware may hijack the response and recycle the request for a
//! resend (see [`Request::reset_to_pending`]).
//!
//! Fast-path transitions (`set_pending`, `set_in_fly(None)`) are plain CAS;
//! everything touching the chain or the responder runs under the request
//! mutex. Critical sections never await, so the type is safe to drive from
//! async tasks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::middleware::Middleware;
use crate::response::{rc, RequestType, Responder, Response};

/// Message tag of a ping packet.
pub const PING: RequestType = 0xFF00;

/// Wire id reserved for ping requests.
pub const PING_REQUEST_ID: u32 = u32::MAX;

/// Freshly created, not yet handed to a service.
pub const RS_NEW: u32 = 0;
/// Accepted for scheduling, waiting for a dispatch slot.
pub const RS_PENDING: u32 = 1;
/// Dispatched; awaiting a terminal response.
pub const RS_IN_FLY: u32 = 2;
/// Chain traversal has begun; middlewares may hijack.
pub const RS_PREPARED: u32 = 4;
/// Terminal; the responder has been invoked exactly once.
pub const RS_PERFORMED: u32 = 8;
/// Mask testing "response has begun or finished".
pub const RS_PERFORMING: u32 = RS_PREPARED | RS_PERFORMED;

struct Inner {
    body: Bytes,
    responder: Option<Box<dyn Responder>>,
    /// Middleware chain; the head (outermost) lives at the back.
    chain: Vec<Arc<dyn Middleware>>,
    timer: Option<JoinHandle<()>>,
}

/// A single logical call travelling through services and connections.
///
/// Requests are always shared as `Arc<Request>`; every field mutation is
/// internally synchronized.
pub struct Request {
    /// Message tag which goes first in a packet.
    pub msg: RequestType,
    /// Caller-assigned logical id, preserved across the responder boundary.
    pub id: u32,
    state: AtomicU32,
    inner: Mutex<Inner>,
}

impl Request {
    /// Create a new request in the `New` state.
    pub fn new(
        msg: RequestType,
        id: u32,
        body: Bytes,
        responder: impl Responder + 'static,
    ) -> Arc<Request> {
        Arc::new(Request {
            msg,
            id,
            state: AtomicU32::new(RS_NEW),
            inner: Mutex::new(Inner {
                body,
                responder: Some(Box::new(responder)),
                chain: Vec::new(),
                timer: None,
            }),
        })
    }

    /// Current state word (racy snapshot; terminal states are stable).
    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    fn cas(&self, old: u32, new: u32) -> bool {
        self.state
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomic New → Pending.
    pub fn set_pending(&self) -> bool {
        self.cas(RS_NEW, RS_PENDING)
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state() == RS_PENDING
    }

    /// Whether the response has begun or finished.
    #[inline]
    pub fn performed(&self) -> bool {
        self.state() & RS_PERFORMING != 0
    }

    /// Pending → InFly.
    ///
    /// With `mid == None` this is a plain CAS. With a middleware it runs
    /// under the request lock so that the transition and the chain push are
    /// one atomic step, the contract a connection relies on when it
    /// attaches its wire wrapper while claiming a wire id. A request that a
    /// scheduler already moved in-fly keeps its state and only gains the
    /// middleware.
    pub fn set_in_fly(&self, mid: Option<Arc<dyn Middleware>>) -> bool {
        match mid {
            None => self.cas(RS_PENDING, RS_IN_FLY),
            Some(mid) => {
                let mut inner = self.inner.lock().unwrap();
                let st = self.state();
                if st == RS_PENDING || st == RS_IN_FLY {
                    self.state.store(RS_IN_FLY, Ordering::Release);
                    inner.chain.push(mid);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Push `mid` on the front of the chain. Legal only while the request
    /// is still `New` or `Pending`.
    pub fn chain_middleware(&self, mid: Arc<dyn Middleware>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let st = self.state();
        if st == RS_NEW || st == RS_PENDING {
            inner.chain.push(mid);
            true
        } else {
            false
        }
    }

    /// Pop `mid` if it is the current chain head.
    pub fn unchain_middleware(&self, mid: &Arc<dyn Middleware>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(head) = inner.chain.last() {
            if Arc::ptr_eq(head, mid) {
                inner.chain.pop();
                return true;
            }
        }
        false
    }

    /// Deliver a terminal response. Only effective while `InFly`.
    pub fn respond(&self, code: u32, body: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        if self.state() == RS_IN_FLY {
            let res = Response {
                msg: self.msg,
                id: self.id,
                code,
                body,
            };
            self.chain_response(&mut inner, res);
        }
    }

    /// Deliver a failure outcome from any non-performing state.
    ///
    /// Returns whether this call performed the terminal transition.
    pub fn respond_fail(&self, code: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if self.state() & RS_PERFORMING != 0 {
            return false;
        }
        let res = Response {
            msg: self.msg,
            id: self.id,
            code,
            body: Bytes::new(),
        };
        self.chain_response(&mut inner, res);
        true
    }

    /// Cancel the request, delivering [`rc::CANCELED`].
    pub fn cancel(&self) -> bool {
        self.respond_fail(rc::CANCELED)
    }

    /// Expire the request, delivering [`rc::TIMEOUT`].
    pub fn expire(&self) -> bool {
        self.respond_fail(rc::TIMEOUT)
    }

    /// Flip a `Prepared` request back to `Pending` for a resend.
    ///
    /// May only be called from inside a middleware's `respond` callback
    /// (i.e. while the request is `Prepared`); anywhere else is a
    /// programmer error and panics.
    pub fn reset_to_pending(&self) {
        if !self.cas(RS_PREPARED, RS_PENDING) {
            panic!("reset_to_pending called outside of a middleware respond callback");
        }
    }

    /// Flip a `Prepared` request back to `New`. Same contract as
    /// [`Request::reset_to_pending`].
    pub fn reset_to_new(&self) {
        if !self.cas(RS_PREPARED, RS_NEW) {
            panic!("reset_to_new called outside of a middleware respond callback");
        }
    }

    /// Arm the per-request timer; only the first call has effect. The timer
    /// task calls [`Request::expire`] when it fires and is stopped by any
    /// terminal transition.
    pub fn set_timeout(self: &Arc<Self>, timeout: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if inner.timer.is_some() || self.state() & RS_PERFORMING != 0 {
            return;
        }
        let req = Arc::downgrade(self);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(req) = req.upgrade() {
                req.expire();
            }
        }));
    }

    /// Clone of the body, available only while `InFly` (used by connection
    /// write loops after a successful `set_in_fly`).
    pub fn wire_body(&self) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        if self.state() == RS_IN_FLY {
            Some(inner.body.clone())
        } else {
            None
        }
    }

    /// Clone of the body for endpoint handlers.
    pub fn body(&self) -> Bytes {
        self.inner.lock().unwrap().body.clone()
    }

    /// Two-phase terminal delivery. Runs under the request lock.
    ///
    /// Sets `Prepared`, walks the chain head → tail re-checking the state
    /// after every callback (a middleware may have reset the request, in
    /// which case the remaining chain stays attached and the request is back
    /// in the scheduler's hands), then invokes the terminal responder and
    /// seals the request.
    fn chain_response(&self, inner: &mut Inner, mut res: Response) {
        self.state.store(RS_PREPARED, Ordering::Release);
        loop {
            let Some(mid) = inner.chain.last().cloned() else {
                break;
            };
            res = mid.respond(res);
            if self.state() != RS_PREPARED {
                return;
            }
            inner.chain.pop();
        }
        if let Some(responder) = inner.responder.take() {
            responder.respond(res);
        }
        self.state.store(RS_PERFORMED, Ordering::Release);
        inner.body = Bytes::new();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("msg", &self.msg)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
