//! # HTTP JSON-RPC Transport
//!
//! Speaks the `uhttpd-mod-ubus` dialect: plain JSON-RPC 2.0 over a single
//! POST endpoint, with ubus's own session layer (login, session id,
//! expiry) riding inside the `params` array rather than in any HTTP-level
//! auth header.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ErrorKind;
use crate::result::UbusResult;
use crate::value::Value;

use super::{args_to_value, Args, Transport, TransportConfig};

/// The all-zero session id ubus uses to mean "not yet logged in": a
/// 32-hex-character token.
const SENTINEL_SESSION: &str = "00000000000000000000000000000000";

const SESSION_OBJECT: &str = "session";
const LOGIN_METHOD: &str = "login";

struct Session {
    id: String,
    expires_at: Instant,
}

/// A ubus connection carried over HTTP JSON-RPC.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    session: RwLock<Option<Session>>,
    next_id: AtomicU64,
    debug: bool,
    closed: std::sync::atomic::AtomicBool,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Json>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl HttpTransport {
    /// Build the client and log in against the sentinel session id.
    /// No connection is pooled ahead of time; `reqwest` dials lazily on
    /// first request.
    pub async fn connect(config: &TransportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.read_timeout)
            .connect_timeout(config.dial_timeout)
            .build()
            .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("building http client: {e}")))?;

        let endpoint = format!("http://{}/ubus", config.host);
        let transport = Self {
            client,
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
            session: RwLock::new(None),
            next_id: AtomicU64::new(1),
            debug: config.debug,
            closed: std::sync::atomic::AtomicBool::new(false),
        };
        transport.login().await?;
        Ok(transport)
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::Closed.wrap("http transport is closed"));
        }
        Ok(())
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// POST one JSON-RPC `call` request and translate transport-level
    /// failures (connect error, non-2xx, malformed JSON-RPC envelope) into
    /// the shared error taxonomy. Caller is responsible for mapping the
    /// ubus status embedded in `result[0]`.
    async fn post_call(&self, session: &str, service: &str, method: &str, args: &Value) -> anyhow::Result<(u32, Value)> {
        let id = self.next_request_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "call",
            "params": [session, service, method, args.to_json()],
        });

        if self.debug {
            debug!(service, method, id, "ubus http call");
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ErrorKind::ConnectionFailed.wrap(format!("POST {}: {e}", self.endpoint)))?;

        if !response.status().is_success() {
            return Err(ErrorKind::ConnectionFailed.wrap(format!("http status {}", response.status())));
        }

        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| ErrorKind::InvalidResponse.wrap(format!("decoding JSON-RPC envelope: {e}")))?;

        if let Some(error) = rpc.error {
            return Err(map_rpc_error(&error));
        }

        let result = rpc.result.ok_or_else(|| ErrorKind::InvalidResponse.wrap("JSON-RPC response has neither result nor error"))?;
        parse_call_result(result)
    }

    /// Perform the login POST and build the resulting session, without
    /// touching the cached slot. Callers decide under what lock discipline
    /// to install the result.
    async fn perform_login(&self) -> anyhow::Result<Session> {
        let args = Value::Table(
            [
                ("username".to_string(), Value::String(self.username.clone())),
                ("password".to_string(), Value::String(self.password.clone())),
            ]
            .into_iter()
            .collect(),
        );

        let (status, payload) = self.post_call(SENTINEL_SESSION, SESSION_OBJECT, LOGIN_METHOD, &args).await?;
        if let Some(kind) = crate::error::status_to_kind(status) {
            if kind != ErrorKind::NoData {
                return Err(kind.wrap(format!("login failed with status {status}")));
            }
        }

        let table = payload.as_table().ok_or_else(|| ErrorKind::InvalidResponse.wrap("login response is not a table"))?;
        let session_id = match table.get("ubus_rpc_session") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(ErrorKind::InvalidResponse.wrap("login response missing ubus_rpc_session")),
        };
        let timeout_secs = match table.get("timeout") {
            Some(Value::Int32(n)) => *n as u64,
            Some(Value::Int64(n)) => *n as u64,
            _ => 300,
        };

        Ok(Session { id: session_id, expires_at: Instant::now() + Duration::from_secs(timeout_secs) })
    }

    /// Log in fresh, replacing whatever session is currently cached. Used
    /// by `connect`, where there is no concurrent traffic to single-flight
    /// against.
    async fn login(&self) -> anyhow::Result<()> {
        let session = self.perform_login().await?;
        let mut slot = self.session.write().await;
        *slot = Some(session);
        Ok(())
    }

    /// Return the cached session id, refreshing it first if it has (or is
    /// about to) expire. Double-checked locking: a cheap read-lock peek
    /// handles the common case, then the write lock is held across the
    /// re-check *and* the login POST itself, so a waiter that queued behind
    /// an in-flight login re-checks against the now-fresh session instead of
    /// performing its own.
    async fn current_session(&self) -> anyhow::Result<String> {
        {
            let slot = self.session.read().await;
            if let Some(session) = slot.as_ref() {
                if session.expires_at > Instant::now() {
                    return Ok(session.id.clone());
                }
            }
        }

        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            if session.expires_at > Instant::now() {
                return Ok(session.id.clone());
            }
        }
        let session = self.perform_login().await?;
        let id = session.id.clone();
        *slot = Some(session);
        Ok(id)
    }
}

fn map_rpc_error(error: &RpcError) -> anyhow::Error {
    let kind = crate::error::status_to_kind(error.code as u32).unwrap_or(ErrorKind::Unknown);
    kind.wrap(format!("JSON-RPC error {}: {}", error.code, error.message))
}

/// `result` is `[status]` or `[status, payload]` on the wire; parse either
/// shape into `(status, Value)`.
fn parse_call_result(result: Json) -> anyhow::Result<(u32, Value)> {
    let items = match result {
        Json::Array(items) => items,
        _ => return Err(ErrorKind::InvalidResponse.wrap("result is not an array")),
    };
    let mut iter = items.into_iter();
    let status = match iter.next() {
        Some(Json::Number(n)) => n.as_u64().ok_or_else(|| ErrorKind::InvalidResponse.wrap("status is not a non-negative integer"))? as u32,
        _ => return Err(ErrorKind::InvalidResponse.wrap("result[0] is not a status code")),
    };
    let payload = match iter.next() {
        Some(json) => Value::from_json(&json).map_err(|k| k.wrap("decoding call result payload"))?,
        None => Value::empty_table(),
    };
    Ok((status, payload))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, service: &str, method: &str, args: Args) -> anyhow::Result<UbusResult> {
        self.ensure_open()?;
        let value = args_to_value(args)?;
        let session = self.current_session().await?;

        // PermissionDenied is not auto-retried: the expiry check is the
        // sole re-login trigger.
        let (status, payload) = self.post_call(&session, service, method, &value).await?;
        Ok(UbusResult::new(status, payload))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session_id = { self.session.read().await.as_ref().map(|s| s.id.clone()) };
        if let Some(session_id) = session_id {
            let args = Value::Table([("session".to_string(), Value::String(session_id.clone()))].into_iter().collect());
            // Best-effort: a failed "session destroy" doesn't prevent close.
            let _ = self.post_call(&session_id, SESSION_OBJECT, "destroy", &args).await;
        }
        *self.session.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn login_response(session: &str, timeout: u64) -> serde_json::Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": [0, {"ubus_rpc_session": session, "timeout": timeout}],
        })
    }

    async fn config_for(server: &MockServer) -> TransportConfig {
        TransportConfig {
            host: server.address().to_string(),
            username: "root".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_logs_in_and_caches_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(login_response("cafebabe", 300)))
            .mount(&server)
            .await;

        let config = config_for(&server).await;
        let transport = HttpTransport::connect(&config).await.unwrap();
        let session = transport.session.read().await;
        assert_eq!(session.as_ref().unwrap().id, "cafebabe");
    }

    #[tokio::test]
    async fn expired_session_triggers_relogin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(login_response("first-session", 300)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(login_response("second-session", 300)))
            .mount(&server)
            .await;

        let config = config_for(&server).await;
        let transport = HttpTransport::connect(&config).await.unwrap();
        {
            let mut slot = transport.session.write().await;
            slot.as_mut().unwrap().expires_at = Instant::now() - Duration::from_secs(1);
        }
        let session = transport.current_session().await.unwrap();
        assert_eq!(session, "second-session");
    }

    #[tokio::test]
    async fn error_code_maps_to_taxonomy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(login_response("sess", 300)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": {"code": 6, "message": "Permission denied"},
            })))
            .mount(&server)
            .await;

        let config = config_for(&server).await;
        let transport = HttpTransport::connect(&config).await.unwrap();
        let err = transport.call("network.interface", "up", Args::Empty).await.unwrap_err();
        assert!(crate::error::is_permission_denied(&err));
    }

    #[tokio::test]
    async fn call_result_without_payload_decodes_to_empty_table() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(login_response("sess", 300)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": [0],
            })))
            .mount(&server)
            .await;

        let config = config_for(&server).await;
        let transport = HttpTransport::connect(&config).await.unwrap();
        let result = transport.call("network.interface", "up", Args::Empty).await.unwrap();
        assert_eq!(result.status(), 0);
        let err = result.unmarshal::<serde_json::Value>().unwrap_err();
        assert!(crate::error::is_no_data(&err));
    }

    #[tokio::test]
    async fn close_issues_session_destroy_and_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(login_response("sess", 300)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ubus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": [0],
            })))
            .mount(&server)
            .await;

        let config = config_for(&server).await;
        let transport = HttpTransport::connect(&config).await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.session.read().await.is_none());

        let err = transport.call("system", "info", Args::Empty).await.unwrap_err();
        assert!(crate::error::is_closed(&err));
    }
}
