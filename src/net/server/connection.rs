//! Inbound connection: frames become requests forwarded to the endpoint
//! service; responses flow back through a bounded out-queue with a spill
//! buffer for bursts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};

use crate::net::wire::{HeaderReader, HeaderWriter, RcType};
use crate::request::{Request, PING};
use crate::response::{rc, Responder, Response};
use crate::service::Service;

const CS_READ_CLOSED: u32 = 1;
const CS_WRITE_CLOSED: u32 = 2;
const CS_CLOSED: u32 = CS_READ_CLOSED | CS_WRITE_CLOSED;

/// Bounded out-queue size; responses beyond it land in the spill buffer.
const OUT_CAPACITY: usize = 128;

enum OutMsg {
    Res(Response),
    Close,
}

enum LoopNotify {
    ReadClosed,
    WriteClosed,
    InFlyEmpty,
}

struct SrvInner {
    in_fly: HashMap<u32, Arc<Request>>,
    spill: Vec<Response>,
}

/// Responder handed to every inbound request.
struct ConnResponder(Weak<ServerConnection>);

impl Responder for ConnResponder {
    fn respond(&self, res: Response) {
        if let Some(conn) = self.0.upgrade() {
            conn.deliver(res);
        }
    }
}

/// One accepted connection serving inbound requests.
pub struct ServerConnection {
    pub id: u64,
    self_ref: Weak<ServerConnection>,
    endpoint: Arc<dyn Service>,
    inner: Mutex<SrvInner>,
    out_tx: mpsc::Sender<OutMsg>,
    notify_tx: mpsc::Sender<LoopNotify>,
    read_abort: Notify,
    state: AtomicU32,
}

impl ServerConnection {
    /// Start the connection loops over the given duplex halves.
    pub fn run<R, W>(
        rc_type: RcType,
        endpoint: Arc<dyn Service>,
        id: u64,
        r: R,
        w: W,
    ) -> Arc<ServerConnection>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(OUT_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::channel(4);
        let conn = Arc::new_cyclic(|self_ref| ServerConnection {
            id,
            self_ref: self_ref.clone(),
            endpoint,
            inner: Mutex::new(SrvInner {
                in_fly: HashMap::new(),
                spill: Vec::new(),
            }),
            out_tx,
            notify_tx,
            read_abort: Notify::new(),
            state: AtomicU32::new(0),
        });
        tokio::spawn(Self::read_loop(conn.clone(), HeaderReader::new(r, rc_type)));
        tokio::spawn(Self::write_loop(conn.clone(), HeaderWriter::new(w, rc_type), out_rx));
        tokio::spawn(Self::control_loop(conn.clone(), notify_rx));
        conn
    }

    /// Stop reading; in-flight requests still drain before the connection
    /// winds down.
    pub fn stop(&self) {
        self.read_abort.notify_one();
    }

    pub fn closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CS_CLOSED == CS_CLOSED
    }

    pub fn in_fly(&self) -> usize {
        self.inner.lock().unwrap().in_fly.len()
    }

    /// Route a response from the endpoint toward the write loop. Responses
    /// for ids no longer in flight (duplicate answers, cancelled and
    /// already removed) are dropped.
    fn deliver(&self, res: Response) {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_fly.remove(&res.id).is_none() {
            return;
        }
        match self.out_tx.try_send(OutMsg::Res(res)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(OutMsg::Res(res))) => inner.spill.push(res),
            Err(_) => {}
        }
    }

    /// Move spilled responses into the out-queue. Returns whether any were
    /// moved.
    fn drain_spill(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut moved = 0;
        while moved < inner.spill.len() {
            let res = inner.spill[moved].clone();
            match self.out_tx.try_send(OutMsg::Res(res)) {
                Ok(()) => moved += 1,
                Err(_) => break,
            }
        }
        if moved > 0 {
            inner.spill.drain(..moved);
        }
        moved > 0
    }

    async fn read_loop<R>(conn: Arc<ServerConnection>, mut reader: HeaderReader<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            let next = tokio::select! {
                _ = conn.read_abort.notified() => break,
                next = reader.read_request() => next,
            };
            match next {
                Ok(frame) => {
                    if frame.is_ping() {
                        let pong = Response {
                            msg: PING,
                            id: frame.id,
                            code: rc::OK,
                            body: Bytes::new(),
                        };
                        if conn.out_tx.send(OutMsg::Res(pong)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    let req = Request::new(
                        frame.msg,
                        frame.id,
                        frame.body,
                        ConnResponder(conn.self_ref.clone()),
                    );
                    conn.inner.lock().unwrap().in_fly.insert(frame.id, req.clone());
                    let dispatch = conn.endpoint.send(req);
                    tokio::spawn(dispatch);
                }
                Err(err) => {
                    tracing::debug!(conn = conn.id, error = %err, "read loop closed");
                    break;
                }
            }
        }
        let _ = conn.notify_tx.send(LoopNotify::ReadClosed).await;
    }

    async fn write_loop<W>(
        conn: Arc<ServerConnection>,
        mut writer: HeaderWriter<W>,
        mut rx: mpsc::Receiver<OutMsg>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut write_err = false;
        'outer: loop {
            let msg = match rx.try_recv() {
                Ok(msg) => Some(msg),
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if conn.drain_spill() {
                        continue;
                    }
                    {
                        let should_close = {
                            let inner = conn.inner.lock().unwrap();
                            let read_closed =
                                conn.state.load(Ordering::Acquire) & CS_READ_CLOSED != 0;
                            read_closed && inner.in_fly.is_empty() && inner.spill.is_empty()
                        };
                        if should_close {
                            let _ = conn.notify_tx.send(LoopNotify::InFlyEmpty).await;
                            break 'outer;
                        }
                    }
                    if writer.flush().await.is_err() {
                        write_err = true;
                        break;
                    }
                    match rx.recv().await {
                        Some(msg) => Some(msg),
                        None => break,
                    }
                }
            };
            match msg {
                Some(OutMsg::Res(res)) => {
                    if writer.write_response(&res).await.is_err() {
                        write_err = true;
                        break;
                    }
                }
                Some(OutMsg::Close) | None => break,
            }
        }
        if !write_err {
            let _ = writer.close().await;
        }
        let _ = conn.notify_tx.send(LoopNotify::WriteClosed).await;
    }

    async fn control_loop(conn: Arc<ServerConnection>, mut notify_rx: mpsc::Receiver<LoopNotify>) {
        while let Some(action) = notify_rx.recv().await {
            match action {
                LoopNotify::ReadClosed => {
                    conn.state.fetch_or(CS_READ_CLOSED, Ordering::AcqRel);
                    let empty = {
                        let inner = conn.inner.lock().unwrap();
                        inner.in_fly.is_empty() && inner.spill.is_empty()
                    };
                    if empty {
                        let _ = conn.out_tx.try_send(OutMsg::Close);
                    }
                }
                LoopNotify::WriteClosed => {
                    conn.state.fetch_or(CS_WRITE_CLOSED, Ordering::AcqRel);
                    conn.cancel_in_fly();
                    conn.read_abort.notify_one();
                }
                LoopNotify::InFlyEmpty => {
                    let _ = conn.out_tx.try_send(OutMsg::Close);
                }
            }
            if conn.state.load(Ordering::Acquire) & CS_CLOSED == CS_CLOSED {
                break;
            }
        }
        let mut inner = conn.inner.lock().unwrap();
        inner.spill.clear();
        inner.in_fly.clear();
        tracing::debug!(conn = conn.id, "connection closed");
    }

    /// The write side is gone; nobody will ever see these answers.
    fn cancel_in_fly(&self) {
        let reqs: Vec<_> = {
            let inner = self.inner.lock().unwrap();
            inner.in_fly.values().cloned().collect()
        };
        if reqs.is_empty() {
            return;
        }
        tracing::debug!(conn = self.id, count = reqs.len(), "cancelling in-fly requests");
        for req in reqs {
            req.cancel();
        }
    }
}
