//! TCP accept loop fanning inbound requests to an endpoint service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::net::server::ServerConnection;
use crate::net::wire::RcType;
use crate::service::Service;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConf {
    pub address: String,
    pub rc_type: RcType,
}

impl Default for ServerConf {
    fn default() -> Self {
        ServerConf {
            address: "0.0.0.0:33013".to_string(),
            rc_type: RcType::default(),
        }
    }
}

/// Accepts connections and hands each inbound request to the endpoint.
pub struct Server {
    conf: ServerConf,
    endpoint: Arc<dyn Service>,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(conf: ServerConf, endpoint: Arc<dyn Service>) -> Arc<Server> {
        Arc::new(Server {
            conf,
            endpoint,
            next_id: AtomicU64::new(0),
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.conf.address).await?;
        tracing::debug!(address = %self.conf.address, "listening");
        self.serve(listener).await
    }

    /// Serve connections from an existing listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(conn = id, %addr, "accepted connection");
            let (r, w) = stream.into_split();
            ServerConnection::run(self.conf.rc_type, self.endpoint.clone(), id, r, w);
        }
    }
}
