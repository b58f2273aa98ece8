//! Hierarchical cancellation contexts.
//!
//! Contexts form a tree rooted at a top-level call. Each node tracks a set
//! of cancellers (child contexts, spawned tasks, request adapters), and
//! terminating a node (cancel or expire) synchronously cancels every
//! registered member, including ones racing to register: once a context is
//! terminal, [`Context::add_canceler`] cancels the candidate on the spot.
//!
//! The canceller set keeps two inline slots before spilling into a map, so
//! the common small-fanout case allocates nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::middleware::Middleware;
use crate::request::Request;
use crate::response::{rc, RequestType, Responder, Response, RetCode};
use crate::service::Service;

/// Any entity a context will synchronously cancel on termination.
pub trait Canceler: Send + Sync {
    fn cancel(&self);
}

/// Identity key of a canceller: the address of its allocation.
fn canceler_key(cn: &dyn Canceler) -> usize {
    cn as *const dyn Canceler as *const () as usize
}

struct CxInner {
    cancels: [Option<Arc<dyn Canceler>>; 2],
    cancelsn: usize,
    overflow: HashMap<usize, Arc<dyn Canceler>>,
}

impl CxInner {
    fn is_empty(&self) -> bool {
        self.cancelsn == 0 && self.overflow.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Canceler>> {
        self.cancels
            .iter()
            .flatten()
            .cloned()
            .chain(self.overflow.values().cloned())
            .collect()
    }
}

/// A node in the cancellation tree.
pub struct Context {
    self_ref: Weak<Context>,
    parent: Option<Arc<Context>>,
    /// 0 while alive, else the terminal code (`CANCELED` or `TIMEOUT`).
    ret_code: AtomicU32,
    inner: Mutex<CxInner>,
    child_done: Notify,
    req_id: AtomicU32,
    bound: Mutex<Option<Arc<RequestBinding>>>,
}

impl Context {
    /// Root context for a new call tree.
    pub fn new() -> Arc<Context> {
        Self::build(None)
    }

    fn build(parent: Option<Arc<Context>>) -> Arc<Context> {
        Arc::new_cyclic(|self_ref| Context {
            self_ref: self_ref.clone(),
            parent,
            ret_code: AtomicU32::new(0),
            inner: Mutex::new(CxInner {
                cancels: [None, None],
                cancelsn: 0,
                overflow: HashMap::new(),
            }),
            child_done: Notify::new(),
            req_id: AtomicU32::new(0),
            bound: Mutex::new(None),
        })
    }

    /// Terminal code, or 0 while alive.
    #[inline]
    pub fn ret_code(&self) -> RetCode {
        self.ret_code.load(Ordering::Acquire)
    }

    #[inline]
    pub fn alive(&self) -> bool {
        self.ret_code() == 0
    }

    #[inline]
    pub fn timed_out(&self) -> bool {
        self.ret_code() == rc::TIMEOUT
    }

    /// Register a canceller. On a terminal context the candidate is
    /// cancelled immediately instead.
    pub fn add_canceler(&self, cn: Arc<dyn Canceler>) {
        let ok = {
            let mut inner = self.inner.lock().unwrap();
            let ok = self.alive();
            if ok {
                if let Some(slot) = inner.cancels.iter_mut().find(|slot| slot.is_none()) {
                    *slot = Some(cn.clone());
                    inner.cancelsn += 1;
                } else {
                    inner.overflow.insert(canceler_key(&*cn), cn.clone());
                }
            }
            ok
        };
        if !ok {
            cn.cancel();
        }
    }

    /// Drop a canceller from the set; signals `wait_all` waiters when the
    /// set drains.
    pub fn remove_canceler(&self, cn: &dyn Canceler) {
        let key = canceler_key(cn);
        let mut inner = self.inner.lock().unwrap();
        let mut removed = false;
        for slot in inner.cancels.iter_mut() {
            if let Some(existing) = slot {
                if canceler_key(&**existing) == key {
                    *slot = None;
                    inner.cancelsn -= 1;
                    removed = true;
                    break;
                }
            }
        }
        if !removed {
            inner.overflow.remove(&key);
        }
        if inner.is_empty() {
            self.child_done.notify_waiters();
        }
    }

    /// Cancel the subtree.
    pub fn cancel(&self) {
        self.terminate(rc::CANCELED);
    }

    /// Expire the subtree.
    pub fn expire(&self) {
        self.terminate(rc::TIMEOUT);
    }

    fn terminate(&self, code: RetCode) {
        if self
            .ret_code
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.cancel_all();
        }
    }

    /// Cancel every registered canceller, including ones that appear while
    /// the drain is running. Each member is cancelled once; late
    /// registrations are caught by the terminal check in `add_canceler`.
    fn cancel_all(&self) {
        let mut cancelled: HashMap<usize, ()> = HashMap::new();
        loop {
            let fresh: Vec<Arc<dyn Canceler>> = {
                let inner = self.inner.lock().unwrap();
                inner
                    .snapshot()
                    .into_iter()
                    .filter(|cn| !cancelled.contains_key(&canceler_key(&**cn)))
                    .collect()
            };
            if fresh.is_empty() {
                break;
            }
            for cn in fresh {
                cancelled.insert(canceler_key(&*cn), ());
                cn.cancel();
            }
        }
    }

    /// Spawn `f` in a child context registered as a canceller of this one;
    /// the child is removed when the task returns.
    pub fn go<F, Fut>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(Arc<Context>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let child = Self::build(Some(self.clone()));
        self.add_canceler(child.clone());
        let parent = self.clone();
        tokio::spawn(async move {
            f(child.clone()).await;
            parent.remove_canceler(&*child);
        });
    }

    /// Like [`Context::go`], but the child stays registered after the task
    /// returns; the spawned code calls [`Context::done`] itself when its
    /// asynchronous work is really over.
    pub fn go_async<F, Fut>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(Arc<Context>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let child = Self::build(Some(self.clone()));
        self.add_canceler(child.clone());
        tokio::spawn(f(child));
    }

    /// Deregister this child from its parent (pairs with
    /// [`Context::go_async`]).
    pub fn done(self: &Arc<Self>) {
        if let Some(parent) = &self.parent {
            parent.remove_canceler(&**self as &dyn Canceler);
        }
    }

    /// Wait until the canceller set is empty.
    pub async fn wait_all(&self) {
        loop {
            let notified = self.child_done.notified();
            tokio::pin!(notified);
            // Register interest before the check so a concurrent removal
            // cannot slip between the two.
            notified.as_mut().enable();
            if self.inner.lock().unwrap().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Create a request tied to this context with a single-buffered
    /// response channel. If the context is already terminal the request
    /// comes back cancelled.
    pub fn new_request(
        self: &Arc<Self>,
        msg: RequestType,
        body: Bytes,
    ) -> (Arc<Request>, mpsc::Receiver<Response>) {
        let id = self.req_id.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::channel(1);
        let req = Request::new(msg, id, body, ChanResponder(tx));
        if !self.alive() {
            req.cancel();
        } else {
            let cm = Arc::new(ContextMiddleware {
                cx: self.self_ref.clone(),
                req: Mutex::new(Arc::downgrade(&req)),
            });
            if req.chain_middleware(cm.clone()) {
                self.add_canceler(cm);
            }
        }
        (req, rx)
    }

    /// Create a request and hand it to `serv`; responses arrive on the
    /// returned channel.
    pub async fn send(
        self: &Arc<Self>,
        serv: &dyn Service,
        msg: RequestType,
        body: Bytes,
    ) -> mpsc::Receiver<Response> {
        let (req, rx) = self.new_request(msg, body);
        serv.send(req).await;
        rx
    }

    /// Create a request, hand it to `serv` and await the response.
    pub async fn call(
        self: &Arc<Self>,
        serv: &dyn Service,
        msg: RequestType,
        body: Bytes,
    ) -> Option<Response> {
        let mut rx = self.send(serv, msg, body).await;
        rx.recv().await
    }

    /// Bind an inbound request to this context: the request's terminal
    /// events steer the context (cancellation fans out, expiry rearms), and
    /// [`Context::respond`] answers it.
    pub fn bind_request(self: &Arc<Self>, req: &Arc<Request>) -> bool {
        let binding = Arc::new(RequestBinding {
            cx: self.self_ref.clone(),
            req: Mutex::new(Arc::downgrade(req)),
        });
        if !req.chain_middleware(binding.clone()) {
            return false;
        }
        *self.bound.lock().unwrap() = Some(binding);
        true
    }

    /// Answer the request bound via [`Context::bind_request`].
    pub fn respond(&self, code: RetCode, body: Bytes) {
        let req = {
            let bound = self.bound.lock().unwrap();
            bound
                .as_ref()
                .and_then(|binding| binding.req.lock().unwrap().upgrade())
        };
        if let Some(req) = req {
            req.respond(code, body);
        }
    }
}

impl Canceler for Context {
    fn cancel(&self) {
        self.terminate(rc::CANCELED);
    }
}

/// Responder delivering into a single-buffered channel.
struct ChanResponder(mpsc::Sender<Response>);

impl Responder for ChanResponder {
    fn respond(&self, res: Response) {
        let _ = self.0.try_send(res);
    }
}

/// Chain adapter: deregisters the request from its context once a response
/// goes through, and cancels the request when the context tears down.
struct ContextMiddleware {
    cx: Weak<Context>,
    req: Mutex<Weak<Request>>,
}

impl Middleware for ContextMiddleware {
    fn respond(&self, res: Response) -> Response {
        if let Some(cx) = self.cx.upgrade() {
            cx.remove_canceler(self);
        }
        res
    }

    fn cancel(&self) {}
}

impl Canceler for ContextMiddleware {
    fn cancel(&self) {
        if let Some(req) = self.req.lock().unwrap().upgrade() {
            req.cancel();
        }
    }
}

/// Chain adapter for a request the context serves: translates the
/// request's terminal codes into context-wide termination.
struct RequestBinding {
    cx: Weak<Context>,
    req: Mutex<Weak<Request>>,
}

impl Middleware for RequestBinding {
    fn respond(&self, res: Response) -> Response {
        if let Some(cx) = self.cx.upgrade() {
            if res.code == rc::CANCELED {
                cx.cancel();
            } else if res.code == rc::TIMEOUT {
                cx.expire();
                // Rearm so the bound request can still be answered after the
                // subtree is torn down.
                if let Some(req) = self.req.lock().unwrap().upgrade() {
                    req.reset_to_pending();
                    req.set_in_fly(None);
                }
            }
        }
        res
    }

    fn cancel(&self) {}
}
