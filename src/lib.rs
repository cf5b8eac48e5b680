//! # ubus-client
//!
//! A client library for the ubus IPC bus used by OpenWrt and related
//! embedded Linux systems. Two transports share one [`Transport`] trait:
//! a native unix-socket blob/blobmsg codec ([`SocketTransport`]) and an
//! HTTP JSON-RPC dialect ([`HttpTransport`]). Callers issue [`Transport::call`]
//! against either one and decode the result with [`UbusResult::unmarshal`].

pub mod bool;
pub mod codec;
pub mod error;
pub mod logging;
pub mod result;
pub mod transport;
pub mod uci;
pub mod value;

pub use error::ErrorKind;
pub use result::UbusResult;
pub use transport::{Args, HttpTransport, SocketTransport, Transport, TransportConfig};
pub use value::Value;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
