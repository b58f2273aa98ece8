//! End-to-end tests: a caller-side connection talking to a server-side
//! connection over in-memory duplex pipes.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use iproto::net::wire::{HeaderReader, HeaderWriter, RcType};
use iproto::net::{ClientConf, Connection, ServerConnection};
use iproto::{
    rc, Callback, Context, Deadline, FuncService, Middleware, ParallelService, Request, Response,
    Service,
};

type Duplex = tokio::io::DuplexStream;

fn echo_endpoint() -> Arc<dyn Service> {
    Arc::new(FuncService(|req: Arc<Request>| async move {
        req.set_pending();
        req.set_in_fly(None);
        let body = req.wire_body().unwrap_or_default();
        req.respond(rc::OK, body);
    }))
}

fn black_hole_endpoint() -> Arc<dyn Service> {
    Arc::new(FuncService(|req: Arc<Request>| async move {
        req.set_pending();
        req.set_in_fly(None);
    }))
}

fn delayed_echo_endpoint(delay: Duration) -> Arc<dyn Service> {
    Arc::new(FuncService(move |req: Arc<Request>| async move {
        req.set_pending();
        req.set_in_fly(None);
        tokio::time::sleep(delay).await;
        let body = req.wire_body().unwrap_or_default();
        req.respond(rc::OK, body);
    }))
}

/// Wire a client connection to a server connection over an in-memory pipe.
async fn pair(endpoint: Arc<dyn Service>) -> (Arc<Connection>, Arc<ServerConnection>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (sr, sw) = tokio::io::split(server_io);
    let server = ServerConnection::run(RcType::U32, endpoint, 1, sr, sw);
    let (cr, cw) = tokio::io::split(client_io);
    let client = Connection::run_with_io(ClientConf::default(), 1, cr, cw)
        .await
        .expect("handshake");
    (client, server)
}

fn request_to(
    tx: mpsc::UnboundedSender<Response>,
    msg: u32,
    id: u32,
    body: &'static [u8],
) -> Arc<Request> {
    Request::new(
        msg,
        id,
        Bytes::from_static(body),
        Callback(move |res: Response| {
            let _ = tx.send(res);
        }),
    )
}

#[tokio::test]
async fn test_single_call_success() {
    let (client, _server) = pair(echo_endpoint()).await;
    let serv = ParallelService::new(1, client.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    serv.send(request_to(tx, 7, 99, &[0xDE, 0xAD])).await;

    let res = rx.recv().await.unwrap();
    assert_eq!(res.msg, 7);
    assert_eq!(res.id, 99, "logical id must survive wire-id translation");
    assert_eq!(res.code, rc::OK);
    assert_eq!(&res.body[..], &[0xDE, 0xAD]);
}

#[tokio::test]
async fn test_deadline_expiry() {
    let (client, _server) = pair(black_hole_endpoint()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let req = request_to(tx, 3, 1, b"never answered");
    assert!(Deadline::wrap_timeout(&req, Duration::from_millis(10)));

    client.send(req.clone()).await;

    let res = tokio::time::timeout(Duration::from_millis(50), rx.recv())
        .await
        .expect("deadline must fire within 50ms")
        .unwrap();
    assert_eq!(res.code, rc::TIMEOUT);
    assert!(req.performed());
}

#[tokio::test]
async fn test_concurrent_requests_multiplexed() {
    let (client, _server) = pair(delayed_echo_endpoint(Duration::from_millis(50))).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let start = tokio::time::Instant::now();
    for id in 0..4 {
        client.send(request_to(tx.clone(), 1, id, b"work")).await;
    }
    let mut ids = Vec::new();
    for _ in 0..4 {
        let res = rx.recv().await.unwrap();
        assert_eq!(res.code, rc::OK);
        ids.push(res.id);
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    // All four overlap on one connection instead of running back to back.
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(180), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_context_fan_out_cancel() {
    let (client, _server) = pair(black_hole_endpoint()).await;
    let cx = Context::new();
    let mut receivers = Vec::new();
    for _ in 0..5 {
        receivers.push(cx.send(&*client, 1, Bytes::from_static(b"x")).await);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    cx.cancel();
    for mut rx in receivers {
        let res = rx.recv().await.unwrap();
        assert_eq!(res.code, rc::CANCELED);
    }
    cx.wait_all().await;
}

/// Resends a request on the next connection when the first one dies
/// underneath it.
struct Resender {
    req: Mutex<std::sync::Weak<Request>>,
    next: Arc<dyn Service>,
    resent: AtomicUsize,
}

impl Middleware for Resender {
    fn respond(&self, res: Response) -> Response {
        if res.code == rc::IO_ERROR && res.restartable() {
            if let Some(req) = self.req.lock().unwrap().upgrade() {
                if self.resent.fetch_add(1, Ordering::SeqCst) == 0 {
                    req.reset_to_pending();
                    let next = self.next.clone();
                    tokio::spawn(async move {
                        next.send(req).await;
                    });
                }
            }
        }
        res
    }

    fn cancel(&self) {}
}

/// A hand-driven peer: completes the handshake, swallows one request, then
/// drops the socket.
async fn vanishing_peer(io: Duplex) {
    let (r, w) = tokio::io::split(io);
    let mut reader = HeaderReader::new(r, RcType::U32);
    let mut writer = HeaderWriter::new(w, RcType::U32);
    reader.read_ping().await.unwrap();
    writer.ping().await.unwrap();
    writer.flush().await.unwrap();
    let _ = reader.read_request().await;
    // Dropping both halves severs the connection mid-request.
}

#[tokio::test]
async fn test_resend_after_io_error() {
    // First connection dies right after swallowing the request.
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let peer = tokio::spawn(vanishing_peer(peer_io));
    let (cr, cw) = tokio::io::split(client_io);
    let conn1 = Connection::run_with_io(ClientConf::default(), 1, cr, cw)
        .await
        .unwrap();

    // Second connection is healthy.
    let (conn2, _server) = pair(echo_endpoint()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let req = request_to(tx, 11, 4, b"try again");
    let resender = Arc::new(Resender {
        req: Mutex::new(Arc::downgrade(&req)),
        next: conn2.clone(),
        resent: AtomicUsize::new(0),
    });
    assert!(req.chain_middleware(resender.clone()));

    conn1.send(req.clone()).await;
    peer.await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("resent request must complete")
        .unwrap();
    assert_eq!(res.code, rc::OK);
    assert_eq!(&res.body[..], b"try again");
    assert_eq!(resender.resent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unexpected_close_flushes_io_error() {
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let peer = tokio::spawn(vanishing_peer(peer_io));
    let (cr, cw) = tokio::io::split(client_io);
    let conn = Connection::run_with_io(ClientConf::default(), 1, cr, cw)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.send(request_to(tx, 1, 1, b"doomed")).await;
    peer.await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("in-fly request must be flushed")
        .unwrap();
    assert_eq!(res.code, rc::IO_ERROR);
}

#[tokio::test]
async fn test_graceful_stop_drains_responses() {
    let (client, _server) = pair(delayed_echo_endpoint(Duration::from_millis(30))).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..3 {
        client.send(request_to(tx.clone(), 1, id, b"slow")).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Stop intake; responses already owed must still arrive.
    client.stop();
    for _ in 0..3 {
        let res = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("owed response must be drained")
            .unwrap();
        assert_eq!(res.code, rc::OK);
    }

    // New sends are rejected with SHUTDOWN.
    let code = Arc::new(AtomicU32::new(0));
    let c = code.clone();
    let late = Request::new(
        1,
        9,
        Bytes::new(),
        Callback(move |res: Response| c.store(res.code, Ordering::SeqCst)),
    );
    client.send(late).await;
    assert_eq!(code.load(Ordering::SeqCst), rc::SHUTDOWN);

    tokio::time::timeout(Duration::from_secs(2), async {
        while !client.closed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection must close after the drain");
}

/// Like [`vanishing_peer`], but holds the socket open until released.
async fn gated_peer(io: Duplex, mut gate: mpsc::Receiver<()>) {
    let (r, w) = tokio::io::split(io);
    let mut reader = HeaderReader::new(r, RcType::U32);
    let mut writer = HeaderWriter::new(w, RcType::U32);
    reader.read_ping().await.unwrap();
    writer.ping().await.unwrap();
    writer.flush().await.unwrap();
    let _ = reader.read_request().await;
    let _ = gate.recv().await;
}

#[tokio::test]
async fn test_shutdown_flushes_in_fly_with_shutdown_code() {
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (gate_tx, gate_rx) = mpsc::channel(1);
    let peer = tokio::spawn(gated_peer(peer_io, gate_rx));
    let (cr, cw) = tokio::io::split(client_io);
    let conn = Connection::run_with_io(ClientConf::default(), 1, cr, cw)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.send(request_to(tx, 1, 1, b"never answered")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Graceful stop first, then the peer goes away without answering.
    conn.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate_tx.send(()).await.unwrap();
    peer.await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("in-fly request must be flushed on shutdown")
        .unwrap();
    assert_eq!(res.code, rc::SHUTDOWN);
}

#[tokio::test]
async fn test_wait_group_over_connection() {
    let (client, _server) = pair(echo_endpoint()).await;
    let wg = iproto::WaitGroup::new();
    for i in 0..6u32 {
        let req = wg.request(2, Bytes::from(vec![i as u8]));
        client.send(req).await;
    }
    let results = wg.results().await;
    assert_eq!(results.len(), 6);
    for res in &results {
        assert_eq!(res.code, rc::OK);
        assert_eq!(res.body[0] as u32, res.id);
    }
}

#[tokio::test]
async fn test_sequential_calls_reuse_connection() {
    let (client, _server) = pair(echo_endpoint()).await;
    let cx = Context::new();
    for i in 0..200u32 {
        let body = Bytes::from(i.to_le_bytes().to_vec());
        let res = cx.call(&*client, 5, body.clone()).await.unwrap();
        assert_eq!(res.code, rc::OK);
        assert_eq!(res.body, body);
    }
    assert_eq!(client.in_fly(), 0);
}

#[tokio::test]
async fn test_idle_pings_keep_connection_alive() {
    let conf = ClientConf {
        ping_interval: Some(Duration::from_millis(20)),
        ..ClientConf::default()
    };
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (sr, sw) = tokio::io::split(server_io);
    let _server = ServerConnection::run(RcType::U32, echo_endpoint(), 1, sr, sw);
    let (cr, cw) = tokio::io::split(client_io);
    let client = Connection::run_with_io(conf, 1, cr, cw).await.unwrap();

    // Sit idle across several ping periods, then verify the link works.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cx = Context::new();
    let res = cx.call(&*client, 1, Bytes::from_static(b"ping me")).await.unwrap();
    assert_eq!(res.code, rc::OK);
    assert!(!client.closed());
}
