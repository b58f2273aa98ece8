//! Inbound (server-side) connections and the accept loop.

mod connection;
mod server;

pub use connection::ServerConnection;
pub use server::{Server, ServerConf};
