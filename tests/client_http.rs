//! End-to-end coverage through the real reqwest transport against a local
//! mock server.

use std::sync::Arc;
use std::time::Duration;

use chatrest::{InstantSleeper, RestClient, Route};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> RestClient {
    RestClient::builder(server.uri()).bot_token("tok").build().unwrap()
}

#[tokio::test]
async fn get_roundtrip_with_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .and(header("Authorization", "Bot tok"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Bucket", "abcd")
                .insert_header("X-RateLimit-Remaining", "4")
                .set_body_json(serde_json::json!({ "id": "42", "username": "someone" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let resp = client
        .request(Route::get_self().compile(&[]).unwrap())
        .complete()
        .await
        .unwrap();
    let user = resp.object().unwrap();
    assert_eq!(user.get("id").unwrap(), "42");
    client.shutdown().await;
}

#[tokio::test]
async fn post_sends_the_json_body() {
    let server = MockServer::start().await;
    let body = serde_json::json!({ "content": "hello" });
    Mock::given(method("POST"))
        .and(path("/channels/9/messages"))
        .and(header("Content-Type", "application/json"))
        .and(body_json(&body))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let resp = client
        .request_json(Route::create_message().compile(&["9"]).unwrap(), &body)
        .complete()
        .await
        .unwrap();
    assert_eq!(resp.object().unwrap().get("id").unwrap(), "1");
}

#[tokio::test]
async fn remote_error_carries_the_platform_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/7"))
        .respond_with(ResponseTemplate::new(404).set_body_json(
            serde_json::json!({ "code": 10013, "message": "Unknown User" }),
        ))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .request(Route::get_user().compile(&["7"]).unwrap())
        .complete()
        .await
        .unwrap_err();
    assert_eq!(err.remote_status(), Some(404));
    assert_eq!(err.remote_code(), Some(10013));
}

#[tokio::test]
async fn real_429_is_waited_out_and_retried() {
    let server = MockServer::start().await;
    // First call is throttled; the retry (same connection, one second later)
    // succeeds. Expired mocks stop matching, so ordering is deterministic.
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "1")
                .insert_header("X-RateLimit-Bucket", "wxyz")
                .insert_header("X-RateLimit-Scope", "user")
                .insert_header("via", "1.1 wiremock"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let start = std::time::Instant::now();
    let resp = client
        .request(Route::get_self().compile(&[]).unwrap())
        .complete()
        .await
        .unwrap();
    assert!(resp.is_ok());
    assert!(start.elapsed() >= Duration::from_millis(900), "the Retry-After wait was skipped");
}

#[tokio::test]
async fn transport_failures_are_retried_then_surfaced() {
    // Bind a port, then free it: connections to it are refused outright.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = RestClient::builder(format!("http://127.0.0.1:{port}"))
        .sleeper(Arc::new(InstantSleeper))
        .build()
        .unwrap();
    let err = client
        .request(Route::get_self().compile(&[]).unwrap())
        .complete()
        .await
        .unwrap_err();
    assert!(err.is_transport(), "got {err:?}");
}
