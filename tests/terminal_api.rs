//! REST lifecycle tests against a running server.
#![cfg(unix)]

mod common;

use common::*;
use deckterm::api::auth::Credentials;
use deckterm::config::EngineConfig;

#[tokio::test(flavor = "multi_thread")]
async fn create_list_and_stop() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let first = server.create_terminal().await;
    let resp = client
        .post(server.url("/api/terminals"))
        .json(&serde_json::json!({ "deckId": DECK, "title": "logs" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let second: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(second["title"], "logs");

    let list = server.list_terminals().await;
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], first);
    assert_eq!(list[0]["title"], "Terminal 1");
    assert_eq!(list[1]["id"], second["id"]);
    assert!(list[0]["createdAt"].as_str().is_some());

    let resp = client
        .delete(server.url(&format!("/api/terminals/{first}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let list = server.list_terminals().await;
    assert_eq!(list.len(), 1);

    let resp = client
        .delete(server.url(&format!("/api/terminals/{first}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_and_list_validation() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/api/terminals"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_request");

    let resp = client
        .post(server.url("/api/terminals"))
        .json(&serde_json::json!({ "deckId": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client.get(server.url("/api/terminals")).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    assert!(server.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_failure_is_500_and_shown_in_deck_status() {
    let server = TestServer::start_with(
        EngineConfig {
            shell: Some("/definitely/not/a/shell".into()),
            ..Default::default()
        },
        None,
    )
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/api/terminals"))
        .json(&serde_json::json!({ "deckId": DECK }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "spawn_failed");
    assert!(server.registry.is_empty());

    let status: serde_json::Value = client
        .get(server.url(&format!("/api/decks/{DECK}/status")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["terminals"], 0);
    assert!(
        status["lastError"].as_str().unwrap().contains("/definitely/not/a/shell"),
        "status was {status}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_terminal_has_no_last_error() {
    let server = TestServer::start().await;
    server.create_terminal().await;
    let list = server.list_terminals().await;
    assert!(list[0]["lastError"].is_null());

    let status: serde_json::Value = reqwest::get(server.url(&format!("/api/decks/{DECK}/status")))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["terminals"], 1);
    assert!(status["lastError"].is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_is_503() {
    let server = TestServer::start_with(
        EngineConfig {
            max_sessions: 1,
            ..Default::default()
        },
        None,
    )
    .await;
    server.create_terminal().await;
    let resp = reqwest::Client::new()
        .post(server.url("/api/terminals"))
        .json(&serde_json::json!({ "deckId": DECK }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_deck_terminals() {
    let server = TestServer::start().await;
    server.create_terminal().await;
    server.create_terminal().await;

    let resp = reqwest::Client::new()
        .delete(server.url(&format!("/api/decks/{DECK}/terminals")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["stopped"], 2);
    assert!(server.list_terminals().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_auth_guards_rest() {
    let server = TestServer::start_with(
        EngineConfig::default(),
        Some(Credentials::new("admin", "pw")),
    )
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url(&format!("/api/terminals?deckId={DECK}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(
        resp.headers().get("www-authenticate").unwrap(),
        "Basic realm=\"deckterm\""
    );

    let resp = client
        .get(server.url(&format!("/api/terminals?deckId={DECK}")))
        .basic_auth("admin", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "auth_invalid");

    // Helper sends the configured credentials.
    server.create_terminal().await;
    assert_eq!(server.list_terminals().await.len(), 1);

    let resp = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}
