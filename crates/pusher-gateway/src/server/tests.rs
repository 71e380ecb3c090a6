use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use super::*;
use crate::apns::TransportFactory;
use crate::registry::CredentialSnapshot;
use crate::registry::credential::testing::{push_certificate, token_key};
use crate::storage::TokenDatabase;
use crate::test_helpers::MockFactory;

const TOPIC: &str = "com.example.app";

struct TestApp {
    state: AppState,
    factory: Arc<MockFactory>,
    _dir: tempfile::TempDir,
}

async fn app() -> TestApp {
    let factory = MockFactory::new();
    let registry = Arc::new(CertificateRegistry::new(
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
        1,
        None,
    ));
    let store = TokenDatabase::open_in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(
        Arc::new(DeliveryCoordinator::new(registry, store)),
        Some(dir.path().join("credentials.json")),
    );
    TestApp {
        state,
        factory,
        _dir: dir,
    }
}

impl TestApp {
    /// Send a request and return (status, JSON body or `Null`).
    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = build_router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn add_certificate(&self, bundle_id: &str, topics: &[&str]) -> (StatusCode, Value) {
        let (cert, key) = push_certificate(bundle_id, topics);
        self.send(
            "POST",
            "/certificates",
            Some(json!({ "cert": cert, "key": key })),
        )
        .await
    }

    fn snapshot(&self) -> CredentialSnapshot {
        CredentialSnapshot::load(self.state.snapshot_path.as_deref().unwrap()).unwrap()
    }
}

fn token(n: u8) -> String {
    format!("{n:02x}").repeat(32)
}

#[tokio::test]
async fn add_certificate_then_replace() {
    let app = app().await;

    let (status, body) = app.add_certificate(TOPIC, &[TOPIC]).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["bundleId"], TOPIC);
    assert_eq!(body["sandbox"], false);

    let (status, _) = app.add_certificate(TOPIC, &[TOPIC]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.send("GET", "/certificates", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["certificates"].as_array().unwrap().len(), 1);
    assert_eq!(app.snapshot().certificates.len(), 1);
}

#[tokio::test]
async fn add_provider_token() {
    let app = app().await;
    let (status, body) = app
        .send(
            "POST",
            "/certificates",
            Some(json!({
                "teamId": "TEAM123456",
                "keyId": "KEY1234567",
                "privateKey": token_key(),
                "bundleId": TOPIC,
                "topics": [TOPIC, "com.example.app.voip"],
                "sandbox": true,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["kind"], "providerToken");
    assert_eq!(body["sandbox"], true);
    assert_eq!(app.snapshot().provider_tokens[0].bundle_id, TOPIC);

    let (_, body) = app.send("GET", "/apns", None).await;
    assert_eq!(body["topics"], json!([TOPIC, "com.example.app.voip"]));
}

#[tokio::test]
async fn bad_certificate_is_400() {
    let app = app().await;
    let (status, body) = app
        .send(
            "POST",
            "/certificates",
            Some(json!({ "cert": "nope", "key": "nope" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid"));
}

#[tokio::test]
async fn remove_and_sandbox_routes() {
    let app = app().await;
    app.add_certificate(TOPIC, &[]).await;

    let (status, body) = app
        .send(
            "PUT",
            &format!("/certificates/{TOPIC}/sandbox"),
            Some(json!({ "sandbox": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sandbox"], true);
    assert!(app.snapshot().certificates[0].sandbox);

    let (status, _) = app.send("DELETE", &format!("/certificates/{TOPIC}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = app.send("GET", &format!("/certificates/{TOPIC}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
    assert!(app.snapshot().is_empty());
}

#[tokio::test]
async fn token_lifecycle() {
    let app = app().await;
    app.add_certificate(TOPIC, &[TOPIC]).await;
    let uri = format!("/apns/{TOPIC}/users/alice");

    let (status, _) = app
        .send("POST", &uri, Some(json!({ "token": token(1) })))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app.send("GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokens"], json!([token(1)]));

    let (_, body) = app.send("GET", &format!("/apns/{TOPIC}/users"), None).await;
    assert_eq!(body["users"], json!(["alice"]));

    let (status, _) = app.send("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.send("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_token_is_400_unknown_topic_404() {
    let app = app().await;
    app.add_certificate(TOPIC, &[TOPIC]).await;

    let (status, _) = app
        .send(
            "POST",
            &format!("/apns/{TOPIC}/users/alice"),
            Some(json!({ "token": "xyz" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send(
            "POST",
            "/apns/com.example.none/users/alice",
            Some(json!({ "token": token(1) })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn push_reports_per_user_counts() {
    let app = app().await;
    app.add_certificate(TOPIC, &[TOPIC]).await;
    for (user, n) in [("alice", 1), ("alice", 2), ("bob", 3)] {
        app.send(
            "POST",
            &format!("/apns/{TOPIC}/users/{user}"),
            Some(json!({ "token": token(n) })),
        )
        .await;
    }

    let (status, body) = app
        .send(
            "POST",
            &format!("/apns/{TOPIC}/push"),
            Some(json!({ "payload": { "aps": { "alert": "hi" } } })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["push"], json!({ "alice": 2, "bob": 1 }));
    assert_eq!(body["outcomes"][0]["status"], "delivered");

    let (status, body) = app
        .send(
            "POST",
            &format!("/apns/{TOPIC}/users/bob/push"),
            Some(json!({ "payload": "{\"aps\":{}}", "lowPriority": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["push"], 1);
}

#[tokio::test]
async fn failed_push_is_502_with_outcomes() {
    let app = app().await;
    app.add_certificate(TOPIC, &[TOPIC]).await;
    app.send(
        "POST",
        &format!("/apns/{TOPIC}/users/alice"),
        Some(json!({ "token": token(1) })),
    )
    .await;
    app.factory.transport.fail(&token(1), 403, "BadCertificate");

    let (status, body) = app
        .send(
            "POST",
            &format!("/apns/{TOPIC}/push"),
            Some(json!({ "payload": {}, "users": ["alice"] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].is_string());
    assert_eq!(body["outcomes"][0]["status"], "failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_all_reach_the_snapshot() {
    let app = Arc::new(app().await);
    let bundles: Vec<String> = (0..16).map(|i| format!("com.example.app{i}")).collect();

    let handles: Vec<_> = bundles
        .iter()
        .cloned()
        .map(|bundle| {
            let app = Arc::clone(&app);
            tokio::spawn(async move {
                let (status, _) = app.add_certificate(&bundle, &[bundle.as_str()]).await;
                status
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::CREATED);
    }

    let snapshot = app.snapshot();
    assert_eq!(snapshot.certificates.len(), bundles.len());
    let dir = app.state.snapshot_path.as_deref().unwrap().parent().unwrap();
    assert_eq!(std::fs::read_dir(dir).unwrap().count(), 1);
}
