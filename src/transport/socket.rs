//! # Unix-Domain-Socket Transport
//!
//! Speaks the native ubus blob/blobmsg wire format: a HELLO
//! handshake on connect, lazy object-ID resolution via `LOOKUP`, and one
//! invoke critical section per call since `ubusd` does not reliably
//! multiplex responses across concurrent invocations on a single
//! connection.

use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::PoisonError;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::codec::blob::{self, MsgHeader, RawAttrs};
use crate::error::ErrorKind;
use crate::result::UbusResult;
use crate::value::Value;

use super::{args_to_value, Args, Transport, TransportConfig, DEFAULT_SOCKET_PATH};

const STATUS_NOT_FOUND: u32 = 4;

/// A connected, HELLO-authenticated ubus socket client.
pub struct SocketTransport {
    stream: Mutex<Option<UnixStream>>,
    /// A `dup()`-ed handle to the same socket, kept outside the invoke
    /// critical section so `close` can shut the connection down without
    /// waiting for a call blocked in a long read to finish on its own.
    shutdown_handle: std::sync::Mutex<Option<StdUnixStream>>,
    object_cache: RwLock<HashMap<String, u32>>,
    seq: AtomicU32,
    peer: u32,
    closed: AtomicBool,
    read_timeout: std::time::Duration,
    write_timeout: std::time::Duration,
    debug: bool,
}

impl SocketTransport {
    /// Connect and perform the HELLO handshake.
    pub async fn connect(config: &TransportConfig) -> anyhow::Result<Self> {
        let path = if config.socket_path.is_empty() {
            DEFAULT_SOCKET_PATH
        } else {
            config.socket_path.as_str()
        };

        let metadata = std::fs::symlink_metadata(path)
            .map_err(|e| ErrorKind::NotUnixSocket.wrap(format!("stat {path}: {e}")))?;
        if !metadata.file_type().is_socket() {
            return Err(ErrorKind::NotUnixSocket.wrap(format!("{path} is not a unix socket")));
        }

        let stream = timeout(config.dial_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ErrorKind::ConnectionFailed.wrap(format!("dial {path} timed out")))?
            .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("dial {path}: {e}")))?;

        let std_stream = stream
            .into_std()
            .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("converting socket for {path}: {e}")))?;
        let shutdown_handle = std_stream
            .try_clone()
            .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("cloning socket for {path}: {e}")))?;
        let mut stream = UnixStream::from_std(std_stream)
            .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("re-wrapping socket for {path}: {e}")))?;

        let (header, _attrs) = read_message(&mut stream, config.read_timeout).await?;
        if header.version != 0 || header.msg_type != blob::MSG_HELLO {
            return Err(ErrorKind::InvalidResponse.wrap(format!(
                "expected HELLO (version 0, type {}), got version {} type {}",
                blob::MSG_HELLO, header.version, header.msg_type
            )));
        }

        debug!(peer = header.peer, "ubus socket transport connected");

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            shutdown_handle: std::sync::Mutex::new(Some(shutdown_handle)),
            object_cache: RwLock::new(HashMap::new()),
            seq: AtomicU32::new(1),
            peer: header.peer,
            closed: AtomicBool::new(false),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            debug: config.debug,
        })
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::Closed.wrap("socket transport is closed"));
        }
        Ok(())
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed) as u16
    }

    async fn resolve_object_id(&self, service: &str) -> anyhow::Result<u32> {
        if let Some(id) = self.object_cache.read().await.get(service).copied() {
            return Ok(id);
        }
        self.lookup(service).await
    }

    /// Issue a `LOOKUP` for `service`, populate the cache with every
    /// observed `(path, id)` pair, and return the id for `service` or
    /// `NotFound`.
    async fn lookup(&self, service: &str) -> anyhow::Result<u32> {
        self.ensure_open()?;
        let mut guard = InvokeGuard::acquire(self).await;

        let mut req_attrs = RawAttrs::new();
        req_attrs.insert_cstr(blob::ATTR_OBJPATH, service);
        let header = MsgHeader { version: 0, msg_type: blob::MSG_LOOKUP, seq: self.next_seq(), peer: self.peer };
        guard.send(header, &req_attrs).await?;

        loop {
            let (msg_header, attrs) = guard.recv().await?;
            match msg_header.msg_type {
                blob::MSG_DATA => {
                    if let (Some(path), Some(id)) =
                        (attrs.get_cstr(blob::ATTR_OBJPATH), attrs.get_u32(blob::ATTR_OBJID))
                    {
                        self.object_cache.write().await.insert(path, id);
                    }
                }
                blob::MSG_STATUS => break,
                other => trace!(msg_type = other, "ignoring unexpected message during LOOKUP"),
            }
        }

        guard.finish();
        self.object_cache
            .read()
            .await
            .get(service)
            .copied()
            .ok_or_else(|| ErrorKind::NotFound.wrap(format!("service {service} not found")))
    }

    async fn invoke_once(&self, objid: u32, method: &str, value: &Value) -> anyhow::Result<(u32, Value)> {
        self.ensure_open()?;
        let mut guard = InvokeGuard::acquire(self).await;

        let mut req_attrs = RawAttrs::new();
        req_attrs.insert_u32(blob::ATTR_OBJID, objid);
        req_attrs.insert_cstr(blob::ATTR_METHOD, method);
        if !value.is_empty_container() {
            if let Value::Table(map) = value {
                req_attrs.insert_raw(blob::ATTR_DATA, crate::codec::blobmsg::encode_table_body(map));
            } else {
                return Err(ErrorKind::UnsupportedAttributeType.wrap("call arguments must encode as a table"));
            }
        }

        let header = MsgHeader { version: 0, msg_type: blob::MSG_INVOKE, seq: self.next_seq(), peer: self.peer };
        guard.send(header, &req_attrs).await?;

        let mut merged = Value::empty_table();
        let status = loop {
            let (msg_header, attrs) = guard.recv().await?;
            match msg_header.msg_type {
                blob::MSG_DATA => {
                    if let Some(data) = attrs.get_raw(blob::ATTR_DATA) {
                        let table = crate::codec::blobmsg::decode_table_body(data)
                            .map_err(|k| k.wrap("decoding INVOKE response data"))?;
                        merged.merge_table(Value::Table(table));
                    }
                }
                blob::MSG_STATUS => break attrs.get_u32(blob::ATTR_STATUS).unwrap_or(0),
                other => trace!(msg_type = other, "ignoring unexpected message during INVOKE"),
            }
        };

        guard.finish();
        Ok((status, merged))
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn call(&self, service: &str, method: &str, args: Args) -> anyhow::Result<UbusResult> {
        self.ensure_open()?;
        let value = args_to_value(args)?;

        let objid = self.resolve_object_id(service).await?;
        if self.debug {
            debug!(service, method, objid, "ubus socket call");
        }

        let (status, payload) = match self.invoke_once(objid, method, &value).await {
            Ok(r) => r,
            Err(e) if self.closed.load(Ordering::SeqCst) => {
                return Err(ErrorKind::ConnectionFailed.wrap(format!("call interrupted by close: {e}")));
            }
            Err(e) => return Err(e),
        };

        if status == STATUS_NOT_FOUND {
            // The cached object id might be stale (the service was
            // restarted and reassigned). Evict and re-resolve once.
            self.object_cache.write().await.remove(service);
            let fresh_objid = self.resolve_object_id(service).await?;
            let (status, payload) = self.invoke_once(fresh_objid, method, &value).await?;
            return Ok(UbusResult::new(status, payload));
        }

        Ok(UbusResult::new(status, payload))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Shut the socket down through the dup()-ed handle first. This
        // unblocks any call currently parked in a blocking read/write on
        // the tokio-guarded stream, so the lock below is acquired promptly
        // instead of waiting out the in-flight call's full read timeout.
        let handle = self
            .shutdown_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown(std::net::Shutdown::Both);
        }

        let mut guard = self.stream.lock().await;
        guard.take();
        Ok(())
    }
}

/// One send+receive critical section on the shared stream. Dropping the
/// guard before calling [`InvokeGuard::finish`] (e.g. because the
/// enclosing future was cancelled mid-message) poisons the transport: the
/// wire cannot be resynchronised partway through a message, so the
/// connection is closed rather than left half-read.
struct InvokeGuard<'a> {
    transport: &'a SocketTransport,
    stream: MutexGuard<'a, Option<UnixStream>>,
    done: bool,
}

impl<'a> InvokeGuard<'a> {
    async fn acquire(transport: &'a SocketTransport) -> Self {
        let stream = transport.stream.lock().await;
        Self { transport, stream, done: false }
    }

    async fn send(&mut self, header: MsgHeader, attrs: &RawAttrs) -> anyhow::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ErrorKind::Closed.wrap("socket transport is closed"))?;
        let bytes = blob::encode_message(header, attrs);
        timeout(self.transport.write_timeout, stream.write_all(&bytes))
            .await
            .map_err(|_| ErrorKind::Timeout.wrap("socket write timed out"))?
            .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("socket write failed: {e}")))?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<(MsgHeader, RawAttrs)> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ErrorKind::Closed.wrap("socket transport is closed"))?;
        read_message(stream, self.transport.read_timeout).await
    }

    /// Mark this critical section as cleanly completed, disarming the
    /// close-on-drop behaviour.
    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for InvokeGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!("invoke critical section dropped mid-message; closing socket transport");
            self.transport.closed.store(true, Ordering::SeqCst);
            *self.stream = None;
        }
    }
}

async fn read_message(stream: &mut UnixStream, read_timeout: std::time::Duration) -> anyhow::Result<(MsgHeader, RawAttrs)> {
    let mut header_bytes = [0u8; MsgHeader::LEN];
    timeout(read_timeout, stream.read_exact(&mut header_bytes))
        .await
        .map_err(|_| ErrorKind::Timeout.wrap("socket read timed out (message header)"))?
        .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("socket read failed: {e}")))?;
    let header = MsgHeader::from_bytes(header_bytes);

    let mut outer_header = [0u8; 4];
    timeout(read_timeout, stream.read_exact(&mut outer_header))
        .await
        .map_err(|_| ErrorKind::Timeout.wrap("socket read timed out (record header)"))?
        .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("socket read failed: {e}")))?;
    let remaining = blob::outer_record_remaining_len(outer_header).map_err(|k| k.wrap("decoding record header"))?;

    let mut rest = vec![0u8; remaining];
    timeout(read_timeout, stream.read_exact(&mut rest))
        .await
        .map_err(|_| ErrorKind::Timeout.wrap("socket read timed out (record body)"))?
        .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("socket read failed: {e}")))?;

    let mut body = Vec::with_capacity(4 + rest.len());
    body.extend_from_slice(&outer_header);
    body.extend(rest);
    let attrs = blob::decode_message_body(&body).map_err(|k| k.wrap("decoding message body"))?;
    Ok((header, attrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{UnixListener, UnixStream as TokioUnixStream};

    async fn write_message(stream: &mut TokioUnixStream, header: MsgHeader, attrs: &RawAttrs) {
        let bytes = blob::encode_message(header, attrs);
        stream.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn connect_rejects_non_socket_path() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let config = TransportConfig { socket_path: tmp.path().to_string_lossy().into_owned(), ..Default::default() };
        let err = SocketTransport::connect(&config).await.unwrap_err();
        assert!(crate::error::is_not_unix_socket(&err));
    }

    #[tokio::test]
    async fn connect_performs_hello_handshake_and_caches_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ubus.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_HELLO, seq: 0, peer: 0xAABB }, &RawAttrs::new()).await;

            // LOOKUP
            let (_h, _a) = read_message(&mut stream, std::time::Duration::from_secs(5)).await.unwrap();
            let mut data = RawAttrs::new();
            data.insert_cstr(blob::ATTR_OBJPATH, "system");
            data.insert_u32(blob::ATTR_OBJID, 7);
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_DATA, seq: 0, peer: 0xAABB }, &data).await;
            let mut status = RawAttrs::new();
            status.insert_u32(blob::ATTR_STATUS, 0);
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_STATUS, seq: 0, peer: 0xAABB }, &status).await;

            // INVOKE
            let (_h, _a) = read_message(&mut stream, std::time::Duration::from_secs(5)).await.unwrap();
            let mut data = RawAttrs::new();
            data.insert_raw(blob::ATTR_DATA, crate::codec::blobmsg::encode_table_body(&{
                let mut m = std::collections::BTreeMap::new();
                m.insert("uptime".to_string(), Value::Int32(42));
                m
            }));
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_DATA, seq: 0, peer: 0xAABB }, &data).await;
            let mut status = RawAttrs::new();
            status.insert_u32(blob::ATTR_STATUS, 0);
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_STATUS, seq: 0, peer: 0xAABB }, &status).await;
        });

        let config = TransportConfig { socket_path: path.to_string_lossy().into_owned(), ..Default::default() };
        let transport = SocketTransport::connect(&config).await.unwrap();
        assert_eq!(transport.peer, 0xAABB);

        let result = transport.call("system", "info", Args::Empty).await.unwrap();
        assert_eq!(result.status(), 0);
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Info { uptime: u64 }
        let info: Info = result.unmarshal().unwrap();
        assert_eq!(info, Info { uptime: 42 });
        assert_eq!(transport.object_cache.read().await.get("system"), Some(&7));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_transport_rejects_further_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ubus.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_HELLO, seq: 0, peer: 1 }, &RawAttrs::new()).await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let config = TransportConfig { socket_path: path.to_string_lossy().into_owned(), ..Default::default() };
        let transport = SocketTransport::connect(&config).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap(); // idempotent

        let err = transport.call("system", "info", Args::Empty).await.unwrap_err();
        assert!(crate::error::is_closed(&err));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_rejects_hello_with_wrong_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ubus.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_message(&mut stream, MsgHeader { version: 1, msg_type: blob::MSG_HELLO, seq: 0, peer: 1 }, &RawAttrs::new()).await;
        });

        let config = TransportConfig { socket_path: path.to_string_lossy().into_owned(), ..Default::default() };
        let err = SocketTransport::connect(&config).await.unwrap_err();
        assert!(crate::error::is_invalid_response(&err));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_a_call_parked_in_a_blocking_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ubus.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_HELLO, seq: 0, peer: 1 }, &RawAttrs::new()).await;

            // LOOKUP
            let (_h, _a) = read_message(&mut stream, std::time::Duration::from_secs(5)).await.unwrap();
            let mut data = RawAttrs::new();
            data.insert_cstr(blob::ATTR_OBJPATH, "system");
            data.insert_u32(blob::ATTR_OBJID, 7);
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_DATA, seq: 0, peer: 1 }, &data).await;
            let mut status = RawAttrs::new();
            status.insert_u32(blob::ATTR_STATUS, 0);
            write_message(&mut stream, MsgHeader { version: 0, msg_type: blob::MSG_STATUS, seq: 0, peer: 1 }, &status).await;

            // INVOKE: read it, then never respond, simulating a wedged
            // ubusd. The client call should park in `recv` until close()
            // shuts the socket down from underneath it.
            let (_h, _a) = read_message(&mut stream, std::time::Duration::from_secs(5)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });

        let mut config = TransportConfig { socket_path: path.to_string_lossy().into_owned(), ..Default::default() };
        config.read_timeout = std::time::Duration::from_secs(30);
        let transport = std::sync::Arc::new(SocketTransport::connect(&config).await.unwrap());

        let call_transport = transport.clone();
        let call = tokio::spawn(async move { call_transport.call("system", "info", Args::Empty).await });

        // Give the call a moment to land in the blocking recv.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let closed_at = std::time::Instant::now();
        transport.close().await.unwrap();
        assert!(closed_at.elapsed() < std::time::Duration::from_secs(5), "close() should not wait out the read timeout");

        let err = call.await.unwrap().unwrap_err();
        assert!(crate::error::is_connection_failed(&err));

        server.abort();
    }
}
