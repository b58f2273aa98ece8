//! Outbound connection: three cooperating loops translating between wire
//! frames and the in-memory request graph.
//!
//! - the **write loop** draws requests from the connection's intake point,
//!   assigns wire ids, attaches the connection's wrapper middleware and
//!   writes frames (flushing when idle, pinging on a ticker);
//! - the **read loop** resolves wire ids back to requests and delivers
//!   their responses;
//! - the **control loop** sequences the half-close dance and flushes
//!   whatever is still in flight once both halves are down:
//!   [`rc::SHUTDOWN`] on a graceful stop, [`rc::IO_ERROR`] (or
//!   [`rc::PROTOCOL_ERROR`]) on an unexpected one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::error::{IprotoError, Result};
use crate::middleware::Middleware;
use crate::net::client::holder::RequestHolder;
use crate::net::wire::{HeaderReader, HeaderWriter, RcType};
use crate::request::{Request, PING, PING_REQUEST_ID};
use crate::response::{rc, Response};
use crate::service::{BoxFuture, Point, Service};

const CS_CONNECTED: u32 = 1;
const CS_READ_CLOSED: u32 = 2;
const CS_WRITE_CLOSED: u32 = 4;
const CS_CLOSED: u32 = CS_READ_CLOSED | CS_WRITE_CLOSED;

/// Ticker period standing in when pings are disabled.
const FAKE_PING_INTERVAL: Duration = Duration::from_secs(3600);

/// Default dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConf {
    pub address: String,
    /// Ping period on an idle write side; `None` disables pings.
    #[serde(with = "crate::net::duration_ms::opt")]
    pub ping_interval: Option<Duration>,
    #[serde(with = "crate::net::duration_ms")]
    pub dial_timeout: Duration,
    pub rc_type: RcType,
}

impl Default for ClientConf {
    fn default() -> Self {
        ClientConf {
            address: "127.0.0.1:33013".to_string(),
            ping_interval: None,
            dial_timeout: DIAL_TIMEOUT,
            rc_type: RcType::default(),
        }
    }
}

enum LoopNotify {
    WriteClosed,
    ReadClosed,
    ReadEmpty,
}

/// Wrapper middleware attached while a request flies on this connection.
/// A terminal event drops the holder's reference so the slot only waits
/// for its wire response.
struct ConnMiddleware {
    holder: Weak<RequestHolder>,
    wire_id: u32,
}

impl Middleware for ConnMiddleware {
    fn respond(&self, res: Response) -> Response {
        if let Some(holder) = self.holder.upgrade() {
            holder.clear(self.wire_id);
        }
        res
    }

    fn cancel(&self) {
        if let Some(holder) = self.holder.upgrade() {
            holder.clear(self.wire_id);
        }
    }
}

/// An established caller-side connection.
pub struct Connection {
    pub id: u64,
    conf: ClientConf,
    point: Point,
    holder: Arc<RequestHolder>,
    state: AtomicU32,
    shutdown: AtomicBool,
    flush_code: AtomicU32,
    notify_tx: mpsc::Sender<LoopNotify>,
    read_abort: Notify,
    write_abort: Notify,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Dial the configured address, run the ping handshake and start the
    /// connection loops.
    pub async fn dial(conf: ClientConf, id: u64) -> Result<Arc<Connection>> {
        let stream = tokio::time::timeout(conf.dial_timeout, TcpStream::connect(&conf.address))
            .await
            .map_err(|_| IprotoError::Dial(format!("dial {} timed out", conf.address)))?
            .map_err(|err| IprotoError::Dial(format!("dial {}: {err}", conf.address)))?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (r, w) = stream.into_split();
        Self::start(conf, id, r, w, local_addr, peer_addr).await
    }

    /// Run the connection over arbitrary duplex halves (testing).
    pub async fn run_with_io<R, W>(conf: ClientConf, id: u64, r: R, w: W) -> Result<Arc<Connection>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(conf, id, r, w, None, None).await
    }

    async fn start<R, W>(
        conf: ClientConf,
        id: u64,
        r: R,
        w: W,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Arc<Connection>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = HeaderReader::new(r, conf.rc_type);
        let mut writer = HeaderWriter::new(w, conf.rc_type);
        writer.ping().await?;
        writer.flush().await?;
        reader.read_ping().await?;
        tracing::debug!(conn = id, "connection established");

        let (notify_tx, notify_rx) = mpsc::channel(4);
        let conn = Arc::new(Connection {
            id,
            conf,
            point: Point::new(),
            holder: Arc::new(RequestHolder::new()),
            state: AtomicU32::new(CS_CONNECTED),
            shutdown: AtomicBool::new(false),
            flush_code: AtomicU32::new(rc::IO_ERROR),
            notify_tx,
            read_abort: Notify::new(),
            write_abort: Notify::new(),
            local_addr,
            peer_addr,
        });
        let rx = conn.point.take_receiver();
        tokio::spawn(Self::read_loop(conn.clone(), reader));
        tokio::spawn(Self::write_loop(conn.clone(), writer, rx));
        tokio::spawn(Self::control_loop(conn.clone(), notify_rx));
        Ok(conn)
    }

    /// Begin a graceful shutdown: stop intake, flush, half-close, wait for
    /// outstanding responses.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.point.stop();
    }

    pub fn closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CS_CLOSED == CS_CLOSED
    }

    /// Requests currently awaiting a wire response.
    pub fn in_fly(&self) -> u32 {
        self.holder.count()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn close_code(&self) -> u32 {
        if self.shutdown.load(Ordering::Acquire) {
            rc::SHUTDOWN
        } else {
            self.flush_code.load(Ordering::Acquire)
        }
    }

    async fn read_loop<R>(conn: Arc<Connection>, mut reader: HeaderReader<R>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            let next = tokio::select! {
                _ = conn.read_abort.notified() => break,
                next = reader.read_response() => next,
            };
            match next {
                Ok(res) => {
                    if res.id == PING_REQUEST_ID && res.msg == PING {
                        continue;
                    }
                    if let Some(req) = conn.holder.remove(res.id) {
                        req.respond(res.code, res.body);
                    }
                    if conn.state.load(Ordering::Acquire) & CS_WRITE_CLOSED != 0
                        && conn.holder.count() == 0
                    {
                        let _ = conn.notify_tx.send(LoopNotify::ReadEmpty).await;
                    }
                }
                Err(err) => {
                    if matches!(err, IprotoError::Protocol(_)) {
                        conn.flush_code.store(rc::PROTOCOL_ERROR, Ordering::Release);
                    }
                    tracing::debug!(conn = conn.id, error = %err, "read loop closed");
                    break;
                }
            }
        }
        let _ = conn.notify_tx.send(LoopNotify::ReadClosed).await;
    }

    async fn write_loop<W>(
        conn: Arc<Connection>,
        mut writer: HeaderWriter<W>,
        mut rx: mpsc::UnboundedReceiver<Arc<Request>>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let period = conn.conf.ping_interval.unwrap_or(FAKE_PING_INTERVAL);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut write_err = false;

        'outer: loop {
            if conn.point.stopped() {
                break;
            }
            let mut ping = false;
            let request = match rx.try_recv() {
                Ok(req) => Some(req),
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {
                    // Idle: push buffered frames out before blocking.
                    if writer.flush().await.is_err() {
                        write_err = true;
                        break;
                    }
                    tokio::select! {
                        _ = conn.point.exit().notified() => break 'outer,
                        _ = conn.write_abort.notified() => break 'outer,
                        _ = ticker.tick() => {
                            ping = conn.conf.ping_interval.is_some();
                            None
                        }
                        req = rx.recv() => match req {
                            Some(req) => Some(req),
                            None => break 'outer,
                        },
                    }
                }
            };
            match request {
                Some(request) => {
                    let wire_id = conn.holder.get_next();
                    let mid: Arc<dyn Middleware> = Arc::new(ConnMiddleware {
                        holder: Arc::downgrade(&conn.holder),
                        wire_id,
                    });
                    if !request.set_in_fly(Some(mid)) {
                        conn.holder.remove(wire_id);
                        continue;
                    }
                    let Some(body) = request.wire_body() else {
                        conn.holder.remove(wire_id);
                        continue;
                    };
                    conn.holder.bind(wire_id, request.clone());
                    if writer
                        .write_request(request.msg, wire_id, &body)
                        .await
                        .is_err()
                    {
                        write_err = true;
                        break;
                    }
                }
                None if ping => {
                    if writer.ping().await.is_err() {
                        write_err = true;
                        break;
                    }
                }
                None => {}
            }
        }
        if !write_err {
            let _ = writer.close().await;
        }
        // Whatever is still queued was never written.
        while let Ok(req) = rx.try_recv() {
            req.respond_fail(conn.close_code());
        }
        let _ = conn.notify_tx.send(LoopNotify::WriteClosed).await;
    }

    async fn control_loop(conn: Arc<Connection>, mut notify_rx: mpsc::Receiver<LoopNotify>) {
        let mut read_abort_sent = false;
        while let Some(action) = notify_rx.recv().await {
            match action {
                LoopNotify::WriteClosed => {
                    conn.state.fetch_or(CS_WRITE_CLOSED, Ordering::AcqRel);
                }
                LoopNotify::ReadClosed => {
                    let prev = conn.state.fetch_or(CS_READ_CLOSED, Ordering::AcqRel);
                    if prev & CS_WRITE_CLOSED == 0 {
                        conn.write_abort.notify_one();
                    }
                }
                LoopNotify::ReadEmpty => {}
            }
            let st = conn.state.load(Ordering::Acquire);
            if st & CS_WRITE_CLOSED != 0 {
                if !read_abort_sent && conn.holder.count() == 0 {
                    conn.read_abort.notify_one();
                    read_abort_sent = true;
                }
                if st & CS_READ_CLOSED != 0 {
                    break;
                }
            }
        }
        conn.flush_in_fly();
        tracing::debug!(conn = conn.id, "connection closed");
    }

    fn flush_in_fly(&self) {
        let reqs = self.holder.drain();
        if reqs.is_empty() {
            return;
        }
        let code = self.close_code();
        tracing::debug!(conn = self.id, count = reqs.len(), code, "flushing in-fly requests");
        for req in reqs {
            req.respond_fail(code);
        }
    }
}

impl Service for Connection {
    fn send(&self, req: Arc<Request>) -> BoxFuture<()> {
        self.point.send(req)
    }

    fn runned(&self) -> bool {
        self.point.runned()
    }
}
