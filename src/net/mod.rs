//! Wire layer: frame codecs and TCP connections.
//!
//! The protocol frames both requests and responses as three little-endian
//! 32-bit words (message tag, body length, id) followed by the body; see
//! [`wire`] for the codec and [`client`] / [`server`] for the connection
//! state machines built on top of it.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{ClientConf, Connection};
pub use server::{Server, ServerConf, ServerConnection};
pub use wire::{HeaderReader, HeaderWriter, RcType, RequestFrame, HEADER_SIZE};

/// Serde helper: durations configured as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod opt {
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
