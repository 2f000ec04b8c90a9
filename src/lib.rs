//! Busmux - connection-oriented sockets over pub/sub message buses
//!
//! Many logical request/reply conversations share one subscription per
//! listening address. Inbound messages are demultiplexed by correlation key
//! into per-conversation sockets, each served by its own handler task.

pub mod config;
pub mod message;
pub mod substrate;
pub mod transport;
pub mod utils;

pub use message::{Headers, Message};
pub use substrate::{ChannelSubstrate, Substrate, SubstrateError};
pub use transport::{
    BusTransport, Client, DialOptions, ListenOptions, Listener, ReplyMode, Socket,
    SocketHandler, Transport, TransportConfig, TransportError,
};
