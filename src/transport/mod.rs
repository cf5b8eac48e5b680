//! # Transport Interface & Shared Types
//!
//! One `Transport` trait both the socket and HTTP transports implement, so
//! callers can swap dialects without touching call sites.

pub mod http;
pub mod socket;

use std::time::Duration;

use async_trait::async_trait;

use crate::result::UbusResult;
use crate::value::Value;

pub use http::HttpTransport;
pub use socket::SocketTransport;

/// A caller-provided argument object: a native JSON-shaped tree, or
/// pre-serialised JSON bytes/text for callers with a hand-rolled request
/// body.
#[derive(Debug, Clone)]
pub enum Args {
    Value(serde_json::Value),
    Json(String),
    Empty,
}

impl Args {
    pub fn into_json(self) -> anyhow::Result<serde_json::Value> {
        match self {
            Args::Value(v) => Ok(v),
            Args::Json(s) => Ok(serde_json::from_str(&s)?),
            Args::Empty => Ok(serde_json::Value::Null),
        }
    }
}

impl Default for Args {
    fn default() -> Self {
        Args::Empty
    }
}

impl From<serde_json::Value> for Args {
    fn from(v: serde_json::Value) -> Self {
        Args::Value(v)
    }
}

impl From<&str> for Args {
    fn from(s: &str) -> Self {
        Args::Json(s.to_string())
    }
}

impl From<String> for Args {
    fn from(s: String) -> Self {
        Args::Json(s)
    }
}

impl From<Vec<u8>> for Args {
    fn from(bytes: Vec<u8>) -> Self {
        Args::Json(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<T> From<Option<T>> for Args
where
    Args: From<T>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Args::from(v),
            None => Args::Empty,
        }
    }
}

/// Configuration shared by both transport constructors. Not every
/// field applies to every transport; unused fields are simply ignored.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Unix socket path (socket transport). Empty selects the default.
    pub socket_path: String,
    /// HTTP endpoint host, e.g. `"192.168.1.1"` (HTTP transport).
    pub host: String,
    pub username: String,
    pub password: String,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// When set, both transports emit `tracing` trace/debug spans for
    /// every request and response.
    pub debug: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: String::new(),
            host: String::new(),
            username: String::new(),
            password: String::new(),
            dial_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(3),
            debug: false,
        }
    }
}

/// Default socket path used when `TransportConfig::socket_path` is empty.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/run/ubus/ubus.sock";

/// Uniform client interface over a ubus connection. A
/// transport is created already connected and authenticated; `Call` may be
/// issued concurrently by many callers, and `Close` is final.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, service: &str, method: &str, args: Args) -> anyhow::Result<UbusResult>;

    async fn close(&self) -> anyhow::Result<()>;
}

pub(crate) fn args_to_value(args: Args) -> anyhow::Result<Value> {
    let json = args.into_json()?;
    Value::from_json(&json).map_err(|kind| kind.wrap("encoding call arguments"))
}
