//! Request middlewares.
//!
//! A middleware is an interceptor chained onto a [`Request`]. The chain is
//! walked outermost-first when a terminal event fires, and every attached
//! node observes exactly one of `respond` / `cancel` unless the request is
//! reset for a resend.
//!
//! `respond` runs under the request mutex. Implementations must therefore
//! only call the lock-free request operations from inside it
//! ([`Request::reset_to_pending`], [`Request::reset_to_new`],
//! `set_in_fly(None)`); handing the request back to a scheduler has to
//! happen from a separate task.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::request::Request;
use crate::response::Response;

/// Chainable interceptor observing a request's terminal events.
pub trait Middleware: Send + Sync {
    /// Observe and possibly transform the response travelling down the
    /// chain toward the terminal responder.
    fn respond(&self, res: Response) -> Response;

    /// Observe cancellation delivered from outside the chain (e.g. a
    /// context tearing down its subtree).
    fn cancel(&self);
}

/// Pass-through middleware; useful as a chain placeholder.
pub struct BasicMiddleware;

impl Middleware for BasicMiddleware {
    fn respond(&self, res: Response) -> Response {
        res
    }

    fn cancel(&self) {}
}

/// Expires a request at an absolute point in time.
///
/// On attach the deadline arms its own timer task; a passing response
/// disarms it. When the timer fires first, the request is expired and the
/// chain delivers [`rc::TIMEOUT`](crate::rc::TIMEOUT).
pub struct Deadline {
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Deadline {
    /// Wrap `req` with a deadline at `at`. Returns false if the request has
    /// already left the chainable states.
    pub fn wrap(req: &Arc<Request>, at: Instant) -> bool {
        let mid = Arc::new(Deadline {
            timer: Mutex::new(None),
        });
        if !req.chain_middleware(mid.clone()) {
            return false;
        }
        let target: Weak<Request> = Arc::downgrade(req);
        *mid.timer.lock().unwrap() = Some(tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(req) = target.upgrade() {
                req.expire();
            }
        }));
        true
    }

    /// Wrap `req` with a deadline `timeout` from now.
    pub fn wrap_timeout(req: &Arc<Request>, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return false;
        }
        Self::wrap(req, Instant::now() + timeout)
    }

    fn disarm(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}

impl Middleware for Deadline {
    fn respond(&self, res: Response) -> Response {
        self.disarm();
        res
    }

    fn cancel(&self) {
        self.disarm();
    }
}
