//! Black-box test of [`ubus_client::HttpTransport`] against a fake
//! uhttpd-mod-ubus endpoint.

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ubus_client::{Args, HttpTransport, Transport, TransportConfig};

#[tokio::test]
async fn login_then_call_decodes_through_the_public_api() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ubus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": [0, {"ubus_rpc_session": "0123456789abcdef0123456789abcdef", "timeout": 300}],
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/ubus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": [0, {"uptime": 12345}],
        })))
        .mount(&server)
        .await;

    let config = TransportConfig {
        host: server.address().to_string(),
        username: "root".to_string(),
        password: "toor".to_string(),
        ..Default::default()
    };
    let transport = HttpTransport::connect(&config).await.unwrap();

    let result = transport.call("system", "info", Args::Empty).await.unwrap();
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Info {
        uptime: u64,
    }
    let info: Info = result.unmarshal().unwrap();
    assert_eq!(info, Info { uptime: 12345 });
}

#[tokio::test]
async fn wrong_password_surfaces_permission_denied() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ubus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": [6],
        })))
        .mount(&server)
        .await;

    let config = TransportConfig {
        host: server.address().to_string(),
        username: "root".to_string(),
        password: "wrong".to_string(),
        ..Default::default()
    };
    let err = HttpTransport::connect(&config).await.unwrap_err();
    assert!(ubus_client::error::is_permission_denied(&err));
}
