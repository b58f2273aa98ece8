//! The service seam: anything that accepts requests.
//!
//! [`Service::send`] is a one-way hand-off; the outcome always comes back
//! through the request's responder, never through a return value. Services
//! that merely enqueue return an immediately-ready future; services that
//! perform work inline (handlers) resolve when the work is done, which is
//! what lets [`ParallelService`](crate::parallel::ParallelService) hold a
//! dispatch slot for the duration of a call.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::request::Request;
use crate::response::rc;

/// Boxed future returned by [`Service::send`].
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Anything requests can be handed to.
pub trait Service: Send + Sync {
    /// Accept a request. The returned future resolves when the hand-off
    /// (or inline processing) is complete, not when the response arrives.
    fn send(&self, req: Arc<Request>) -> BoxFuture<()>;

    /// Whether the service still accepts requests.
    fn runned(&self) -> bool {
        true
    }
}

/// Service calling an async closure per request.
pub struct FuncService<F>(pub F);

impl<F, Fut> Service for FuncService<F>
where
    F: Fn(Arc<Request>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn send(&self, req: Arc<Request>) -> BoxFuture<()> {
        Box::pin((self.0)(req))
    }
}

/// Buffered intake of a connection: requests queue here until a write loop
/// draws them.
///
/// A point owns the sending side permanently; the single consumer (the
/// write loop) takes the receiver once. Stopping the point fails further
/// sends with [`rc::SHUTDOWN`] and wakes the consumer through the exit
/// notification.
pub struct Point {
    tx: mpsc::UnboundedSender<Arc<Request>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Request>>>>,
    stopped: AtomicBool,
    exit: Notify,
}

impl Point {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Point {
            tx,
            rx: Mutex::new(Some(rx)),
            stopped: AtomicBool::new(false),
            exit: Notify::new(),
        }
    }

    /// Take the consuming side. Panics if taken twice.
    pub fn take_receiver(&self) -> mpsc::UnboundedReceiver<Arc<Request>> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .expect("point receiver already taken")
    }

    /// Stop intake: subsequent sends fail with `SHUTDOWN` and the consumer
    /// is woken for a graceful drain.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // notify_one keeps a permit when the consumer is not parked yet.
        self.exit.notify_one();
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Notification fired by [`Point::stop`].
    pub fn exit(&self) -> &Notify {
        &self.exit
    }
}

impl Default for Point {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for Point {
    fn send(&self, req: Arc<Request>) -> BoxFuture<()> {
        if self.stopped() {
            req.respond_fail(rc::SHUTDOWN);
        } else {
            req.set_pending();
            if self.tx.send(req.clone()).is_err() {
                req.respond_fail(rc::SHUTDOWN);
            }
        }
        Box::pin(async {})
    }

    fn runned(&self) -> bool {
        !self.stopped()
    }
}
