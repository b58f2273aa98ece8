//! Semaphore-bounded FIFO scheduler.
//!
//! [`ParallelService`] queues incoming requests and dispatches at most `n`
//! of them concurrently to a downstream [`Service`]. Each queued request
//! carries a [`ParallelEntry`] middleware; cancelling the request while it
//! waits removes it from the queue so a slot is never spent on it.
//!
//! A single dispatcher task drives the queue:
//!
//! ```text
//! send ──► queue ──► dispatcher ──(permit)──► downstream task
//!             ▲                                     │
//!             └── appended signal                   └── permit returned
//!                                                      when send completes
//! ```
//!
//! Dispatch order is strictly the order of successful enqueue. A request
//! that cannot be moved Pending → InFly (already cancelled or expired) is
//! skipped without consuming a slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Notify, Semaphore};

use crate::middleware::Middleware;
use crate::request::Request;
use crate::response::{rc, Response};
use crate::service::{BoxFuture, Service};

/// Queue node chained onto a waiting request.
///
/// `respond`/`cancel` mark the node performed and drop it from the queue,
/// so the dispatcher never spends a slot on a request that already reached
/// a terminal state.
pub struct ParallelEntry {
    serv: Weak<ParallelService>,
    req: Arc<Request>,
    performed: AtomicBool,
}

impl ParallelEntry {
    fn leave_queue(&self) {
        self.performed.store(true, Ordering::Release);
        if let Some(serv) = self.serv.upgrade() {
            let mut q = serv.inner.lock().unwrap();
            q.queue
                .retain(|e| !std::ptr::eq(Arc::as_ptr(e), self as *const _));
        }
    }
}

impl Middleware for ParallelEntry {
    fn respond(&self, res: Response) -> Response {
        self.leave_queue();
        res
    }

    fn cancel(&self) {
        self.leave_queue();
    }
}

struct ParQueue {
    queue: VecDeque<Arc<ParallelEntry>>,
    closed: bool,
}

/// Dispatches at most `n` concurrent requests to a downstream service, in
/// FIFO order of enqueue.
pub struct ParallelService {
    self_ref: Weak<ParallelService>,
    inner: Mutex<ParQueue>,
    appended: Notify,
    sema: Arc<Semaphore>,
    work: Arc<dyn Service>,
}

impl ParallelService {
    /// Create the scheduler and spawn its dispatcher task. A capacity of 0
    /// is treated as 1.
    pub fn new(n: usize, work: Arc<dyn Service>) -> Arc<ParallelService> {
        let n = n.max(1);
        let serv = Arc::new_cyclic(|self_ref| ParallelService {
            self_ref: self_ref.clone(),
            inner: Mutex::new(ParQueue {
                queue: VecDeque::new(),
                closed: false,
            }),
            appended: Notify::new(),
            sema: Arc::new(Semaphore::new(n)),
            work,
        });
        tokio::spawn(serv.clone().dispatch_loop());
        serv
    }

    /// Close intake. Future sends fail with `SHUTDOWN`; requests already
    /// queued or dispatched still run to completion, after which the
    /// dispatcher exits.
    pub fn stop(&self) {
        self.inner.lock().unwrap().closed = true;
        self.appended.notify_one();
    }

    fn enqueue(&self, req: Arc<Request>) {
        req.set_pending();
        let entry = Arc::new(ParallelEntry {
            serv: self.self_ref.clone(),
            req: req.clone(),
            performed: AtomicBool::new(false),
        });
        {
            let mut q = self.inner.lock().unwrap();
            if q.closed {
                drop(q);
                req.respond_fail(rc::SHUTDOWN);
                return;
            }
            q.queue.push_back(entry.clone());
        }
        if !req.chain_middleware(entry.clone()) {
            // Lost the race with a terminal event; the entry must not be
            // dispatched.
            entry.leave_queue();
            return;
        }
        self.appended.notify_one();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let notified = self.appended.notified();
            let (empty, closed) = {
                let q = self.inner.lock().unwrap();
                (q.queue.is_empty(), q.closed)
            };
            if empty {
                if closed {
                    break;
                }
                notified.await;
                continue;
            }
            let permit = match self.sema.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            match self.run_one() {
                Some(req) => {
                    let work = self.work.clone();
                    tokio::spawn(async move {
                        work.send(req).await;
                        drop(permit);
                    });
                }
                None => drop(permit),
            }
        }
    }

    /// Detach the first live queue entry and move its request in-fly.
    fn run_one(&self) -> Option<Arc<Request>> {
        loop {
            let entry = self.inner.lock().unwrap().queue.pop_front()?;
            if entry.performed.load(Ordering::Acquire) {
                continue;
            }
            let req = entry.req.clone();
            let mid: Arc<dyn Middleware> = entry;
            req.unchain_middleware(&mid);
            if req.set_in_fly(None) {
                return Some(req);
            }
            // Cancelled between the queue pop and the CAS; skip it.
        }
    }

}

impl Service for ParallelService {
    fn send(&self, req: Arc<Request>) -> BoxFuture<()> {
        self.enqueue(req);
        Box::pin(async {})
    }

    fn runned(&self) -> bool {
        !self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Callback;
    use crate::service::FuncService;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn request_to(tx: mpsc::UnboundedSender<Response>, msg: u32, id: u32, body: &'static [u8]) -> Arc<Request> {
        Request::new(
            msg,
            id,
            Bytes::from_static(body),
            Callback(move |res: Response| {
                let _ = tx.send(res);
            }),
        )
    }

    fn echo_service() -> Arc<dyn Service> {
        Arc::new(FuncService(|req: Arc<Request>| async move {
            let body = req.wire_body().unwrap_or_default();
            req.respond(rc::OK, body);
        }))
    }

    #[tokio::test]
    async fn test_single_call_roundtrip() {
        let serv = ParallelService::new(1, echo_service());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = request_to(tx, 7, 3, &[0xDE, 0xAD]);
        serv.send(req).await;
        let res = rx.recv().await.unwrap();
        assert_eq!(res.msg, 7);
        assert_eq!(res.id, 3);
        assert_eq!(res.code, rc::OK);
        assert_eq!(&res.body[..], &[0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn test_fifo_order_with_capacity_one() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let work = Arc::new(FuncService(move |req: Arc<Request>| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(req.id);
                req.respond(rc::OK, Bytes::new());
            }
        }));
        let serv = ParallelService::new(1, work);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for id in 0..16 {
            serv.send(request_to(tx.clone(), 1, id, b"")).await;
        }
        for _ in 0..16 {
            rx.recv().await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parallelism_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let work = Arc::new(FuncService(move |req: Arc<Request>| {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                req.respond(rc::OK, Bytes::new());
            }
        }));
        let serv = ParallelService::new(2, work);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for id in 0..4 {
            serv.send(request_to(tx.clone(), 1, id, b"")).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(active.load(Ordering::SeqCst), 2);
        for _ in 0..4 {
            rx.recv().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_request_skipped_without_slot() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let d = dispatched.clone();
        // A downstream that parks forever so the first request pins the
        // only slot while the others wait in the queue.
        let (unblock_tx, unblock_rx) = mpsc::unbounded_channel::<()>();
        let unblock_rx = Arc::new(tokio::sync::Mutex::new(unblock_rx));
        let work = Arc::new(FuncService(move |req: Arc<Request>| {
            let d = d.clone();
            let unblock_rx = unblock_rx.clone();
            async move {
                d.fetch_add(1, Ordering::SeqCst);
                unblock_rx.lock().await.recv().await;
                req.respond(rc::OK, Bytes::new());
            }
        }));
        let serv = ParallelService::new(1, work);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = request_to(tx.clone(), 1, 1, b"");
        let second = request_to(tx.clone(), 1, 2, b"");
        let third = request_to(tx.clone(), 1, 3, b"");
        serv.send(first).await;
        serv.send(second.clone()).await;
        serv.send(third).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Cancel the queued second request, then release the slot.
        assert!(second.cancel());
        let res = rx.recv().await.unwrap();
        assert_eq!(res.id, 2);
        assert_eq!(res.code, rc::CANCELED);

        unblock_tx.send(()).unwrap();
        unblock_tx.send(()).unwrap();
        let mut ids: Vec<_> = vec![rx.recv().await.unwrap().id, rx.recv().await.unwrap().id];
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(dispatched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_sends_but_drains_queue() {
        let serv = ParallelService::new(1, echo_service());
        let (tx, mut rx) = mpsc::unbounded_channel();
        serv.send(request_to(tx.clone(), 1, 1, b"")).await;
        serv.send(request_to(tx.clone(), 1, 2, b"")).await;
        serv.stop();
        assert!(!serv.runned());

        let code = Arc::new(AtomicU32::new(0));
        let c = code.clone();
        let late = Request::new(
            1,
            3,
            Bytes::new(),
            Callback(move |res: Response| c.store(res.code, Ordering::SeqCst)),
        );
        serv.send(late).await;
        assert_eq!(code.load(Ordering::SeqCst), rc::SHUTDOWN);

        // Requests accepted before the stop still complete.
        let mut ids = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        ids.sort_by_key(|res| res.id);
        assert!(ids.iter().all(|res| res.code == rc::OK));
        assert_eq!(ids[0].id, 1);
        assert_eq!(ids[1].id, 2);
    }
}
