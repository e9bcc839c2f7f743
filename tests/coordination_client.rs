//! Integration coverage for the Coordination Client (spec.md §4.B) over a
//! real HTTP transport via `wiremock`, complementing the in-crate unit
//! tests with the reserve/deny/unavailable paths.

use ntm::config::CoordinationConfig;
use ntm::coordination::{Coordination, CoordinationError, HttpCoordinationClient};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(url: String) -> CoordinationConfig {
    CoordinationConfig {
        url: Some(url),
        token: None,
        enabled: true,
        timeout_secs: 2,
    }
}

#[tokio::test]
async fn reserve_files_parses_the_reservation_list() {
    let server = MockServer::start().await;
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": [
            {
                "id": "r1",
                "agent_name": "pane-0",
                "path_pattern": "src/**",
                "exclusive": true,
                "reason": "bd-1",
                "created_ts": 0,
                "expires_ts": null
            }
        ]
    });
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
    let reservations = client
        .reserve_files("pane-0", &["src/**".to_string()], "bd-1", std::time::Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].agent_name, "pane-0");
}

#[tokio::test]
async fn denied_rpc_error_maps_to_coordination_denied() {
    let server = MockServer::start().await;
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": -32010, "message": "reservation denied: already held" }
    });
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
    let err = client.call_tool("reserve_files", json!({})).await.unwrap_err();
    assert!(matches!(err, CoordinationError::Denied(_)));
}

#[tokio::test]
async fn http_5xx_is_classified_unavailable_not_a_hard_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
    let available = client.is_available().await;
    assert!(!available);
}

#[tokio::test]
async fn transfer_reservations_swallows_a_failure_and_reports_false() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = HttpCoordinationClient::new(&config_for(server.uri())).unwrap();
    let ok = client.transfer_reservations("pane-0", "pane-1", "bd-1").await;
    assert!(!ok);
}

#[tokio::test]
async fn missing_url_reports_unavailable_without_making_a_request() {
    let cfg = CoordinationConfig {
        url: None,
        token: None,
        enabled: true,
        timeout_secs: 2,
    };
    std::env::remove_var("AGENT_MAIL_URL");
    let err = HttpCoordinationClient::new(&cfg).unwrap_err();
    assert!(matches!(err, CoordinationError::Unavailable(_)));
}
