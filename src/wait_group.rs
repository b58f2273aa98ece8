//! Multi-response collector.
//!
//! A [`WaitGroup`] owns a batch of requests whose responder is the group
//! itself. After creating all requests the caller picks exactly one
//! consumption mode:
//!
//! - [`WaitGroup::each`]: a bounded channel yielding responses as they
//!   arrive, closed once every request has answered;
//! - [`WaitGroup::results`]: await the complete batch.
//!
//! The first mode selection wins; the collective timer (if armed) expires
//! every member that has not answered yet.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::request::{Request, RS_IN_FLY, RS_NEW, RS_PENDING};
use crate::response::{RequestType, Responder, Response};

#[derive(Clone, Copy, PartialEq, Eq)]
enum WgKind {
    InFly,
    Chan,
    Wait,
}

struct WgInner {
    reqn: u32,
    requests: Vec<Arc<Request>>,
    responses: Vec<Response>,
    ch: Option<mpsc::Sender<Response>>,
    kind: WgKind,
    timer: Option<JoinHandle<()>>,
}

/// Aggregates many requests into a channel of responses or a blocking
/// batch.
pub struct WaitGroup {
    self_ref: Weak<WaitGroup>,
    inner: Mutex<WgInner>,
    /// Arrival counter; completion is `count == reqn`.
    count: AtomicU32,
    done: Notify,
}

struct WgResponder(Weak<WaitGroup>);

impl Responder for WgResponder {
    fn respond(&self, res: Response) {
        if let Some(wg) = self.0.upgrade() {
            wg.arrived(res);
        }
    }
}

impl WaitGroup {
    pub fn new() -> Arc<WaitGroup> {
        Arc::new_cyclic(|self_ref| WaitGroup {
            self_ref: self_ref.clone(),
            inner: Mutex::new(WgInner {
                reqn: 0,
                requests: Vec::new(),
                responses: Vec::new(),
                ch: None,
                kind: WgKind::InFly,
                timer: None,
            }),
            count: AtomicU32::new(0),
            done: Notify::new(),
        })
    }

    /// Append a new request to the group. Its id is the position in the
    /// batch; its responder is the group.
    pub fn request(&self, msg: RequestType, body: Bytes) -> Arc<Request> {
        let mut inner = self.inner.lock().unwrap();
        let req = Request::new(msg, inner.reqn, body, WgResponder(self.self_ref.clone()));
        inner.reqn += 1;
        inner.requests.push(req.clone());
        req
    }

    /// Arm the collective timer; only the first call has effect.
    pub fn set_timeout(self: &Arc<Self>, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.timer.is_some() {
            return;
        }
        let wg = Arc::downgrade(self);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(wg) = wg.upgrade() {
                wg.expire();
            }
        }));
    }

    /// Consume responses one by one. Early arrivals are pre-drained into
    /// the channel; it closes once all members have answered.
    pub fn each(&self) -> mpsc::Receiver<Response> {
        let mut inner = self.inner.lock().unwrap();
        inner.kind = WgKind::Chan;
        let cap = (inner.reqn as usize).max(1);
        let (tx, rx) = mpsc::channel(cap);
        for res in inner.responses.drain(..) {
            let _ = tx.try_send(res);
        }
        if self.count.load(Ordering::Acquire) == inner.reqn {
            Self::stop_timer(&mut inner);
            // Dropping the sender closes the channel after the pre-drained
            // responses are consumed.
        } else {
            inner.ch = Some(tx);
        }
        rx
    }

    /// Await all responses and return them as a batch, in arrival order.
    pub async fn results(&self) -> Vec<Response> {
        let reqn = {
            let mut inner = self.inner.lock().unwrap();
            inner.kind = WgKind::Wait;
            inner.reqn
        };
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            // Register interest before the check so a concurrent completion
            // cannot slip between the two.
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) >= reqn {
                break;
            }
            notified.await;
        }
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.responses)
    }

    /// Cancel every member that has already been handed to a service.
    pub fn cancel(&self) {
        let requests = {
            let mut inner = self.inner.lock().unwrap();
            if self.count.load(Ordering::Acquire) == inner.reqn {
                return;
            }
            Self::stop_timer(&mut inner);
            inner.requests.clone()
        };
        for req in requests {
            if req.state() != RS_NEW {
                req.cancel();
            }
        }
    }

    /// Collective timer fire: expire every member still waiting for an
    /// answer (including ones never handed to a service, so the group can
    /// complete).
    pub fn expire(&self) {
        let requests = {
            let mut inner = self.inner.lock().unwrap();
            Self::stop_timer(&mut inner);
            inner
                .requests
                .iter()
                .filter(|req| {
                    let st = req.state();
                    st == RS_NEW || st & (RS_PENDING | RS_IN_FLY) != 0
                })
                .cloned()
                .collect::<Vec<_>>()
        };
        for req in requests {
            req.expire();
        }
    }

    fn stop_timer(inner: &mut WgInner) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }

    fn arrived(&self, res: Response) {
        let mut inner = self.inner.lock().unwrap();
        match inner.kind {
            WgKind::InFly | WgKind::Wait => inner.responses.push(res),
            WgKind::Chan => {
                if let Some(ch) = &inner.ch {
                    // Capacity equals the batch size, so this never fails
                    // with Full.
                    let _ = ch.try_send(res);
                }
            }
        }
        let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == inner.reqn {
            Self::stop_timer(&mut inner);
            match inner.kind {
                WgKind::Chan => {
                    inner.ch = None;
                }
                WgKind::Wait => {
                    self.done.notify_waiters();
                }
                WgKind::InFly => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::rc;
    use crate::service::{FuncService, Service};

    fn echo() -> Arc<dyn Service> {
        Arc::new(FuncService(|req: Arc<Request>| async move {
            req.set_pending();
            req.set_in_fly(None);
            let body = req.wire_body().unwrap_or_default();
            req.respond(rc::OK, body);
        }))
    }

    #[tokio::test]
    async fn test_each_emits_all_then_closes() {
        let wg = WaitGroup::new();
        let serv = echo();
        for i in 0..5u32 {
            let req = wg.request(10 + i, Bytes::from(vec![i as u8]));
            serv.send(req).await;
        }
        let mut rx = wg.each();
        let mut got = 0;
        while let Some(res) = rx.recv().await {
            assert_eq!(res.code, rc::OK);
            assert_eq!(res.body[0] as u32, res.id);
            got += 1;
        }
        assert_eq!(got, 5);
    }

    #[tokio::test]
    async fn test_each_with_late_arrivals() {
        let wg = WaitGroup::new();
        let serv = echo();
        let reqs: Vec<_> = (0..4u32).map(|i| wg.request(1, Bytes::from(vec![i as u8]))).collect();
        // Two answer early, two after the mode is chosen.
        serv.send(reqs[0].clone()).await;
        serv.send(reqs[1].clone()).await;
        let mut rx = wg.each();
        serv.send(reqs[2].clone()).await;
        serv.send(reqs[3].clone()).await;
        let mut got = 0;
        while rx.recv().await.is_some() {
            got += 1;
        }
        assert_eq!(got, 4);
    }

    #[tokio::test]
    async fn test_results_returns_complete_batch() {
        let wg = WaitGroup::new();
        let serv = echo();
        for i in 0..8u32 {
            serv.send(wg.request(1, Bytes::from(vec![i as u8]))).await;
        }
        let results = wg.results().await;
        assert_eq!(results.len(), 8);
        let mut ids: Vec<_> = results.iter().map(|res| res.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancel_skips_new_requests() {
        let wg = WaitGroup::new();
        // Handed to nothing: stays New and must not be cancelled.
        let fresh = wg.request(1, Bytes::new());
        // In a service's hands: Pending, cancellable.
        let pending = wg.request(1, Bytes::new());
        pending.set_pending();
        wg.cancel();
        assert_eq!(fresh.state(), RS_NEW);
        assert!(pending.performed());
    }

    #[tokio::test]
    async fn test_collective_timeout_expires_stragglers() {
        let wg = WaitGroup::new();
        let serv = echo();
        serv.send(wg.request(1, Bytes::from_static(b"a"))).await;
        let straggler = wg.request(1, Bytes::new());
        straggler.set_pending();
        let never_sent = wg.request(1, Bytes::new());
        wg.set_timeout(Duration::from_millis(10));
        let results = wg.results().await;
        assert_eq!(results.len(), 3);
        let mut codes: Vec<_> = results.iter().map(|res| res.code).collect();
        codes.sort_unstable();
        assert_eq!(codes, vec![rc::OK, rc::TIMEOUT, rc::TIMEOUT]);
        drop(never_sent);
    }
}
