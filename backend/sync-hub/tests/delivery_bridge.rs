//! Delivery bridge against a mocked progress API
use std::time::Duration;

use serde_json::json;
use sync_events::ProgressUpdate;
use sync_hub::config::{DeliveryConfig, TcpConfig};
use sync_hub::{DeliveryBridge, HttpProgressStore, ProgressEmitter, ProgressStore, ProgressSyncServer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_for_requests(server: &MockServer, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let seen = server.received_requests().await.unwrap_or_default().len();
            if seen >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("progress API was not called");
}

#[actix_rt::test]
async fn test_http_store_posts_progress() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users/progress"))
        .and(body_json(json!({
            "user_id": "u1",
            "manga_id": "naruto",
            "chapter": 700
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&api)
        .await;

    let store = HttpProgressStore::new(
        format!("{}/users/progress", api.uri()),
        Duration::from_secs(1),
    )
    .unwrap();

    store
        .save_progress(&ProgressUpdate::new("u1", "naruto", 700).stamped(123))
        .await
        .unwrap();
}

#[actix_rt::test]
async fn test_http_store_reports_error_status() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&api)
        .await;

    let store = HttpProgressStore::new(api.uri(), Duration::from_secs(1)).unwrap();
    let result = store
        .save_progress(&ProgressUpdate::new("u1", "naruto", 1))
        .await;

    assert!(matches!(
        result,
        Err(sync_hub::AppError::DeliveryStatus(503))
    ));
}

#[actix_rt::test]
async fn test_ingested_progress_is_forwarded_and_still_fanned_out_on_api_failure() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users/progress"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&api)
        .await;

    let delivery = DeliveryBridge::from_config(&DeliveryConfig {
        api_url: Some(format!("{}/users/progress", api.uri())),
        request_timeout: Duration::from_secs(1),
    })
    .unwrap();
    assert!(delivery.is_enabled());

    let server = ProgressSyncServer::bind(
        &TcpConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..TcpConfig::default()
        },
        delivery,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let (_shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));

    let mut watcher = BufReader::new(TcpStream::connect(addr).await.unwrap());
    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let emitter = ProgressEmitter::connect(addr.to_string()).await.unwrap();
    emitter
        .emit(&ProgressUpdate::new("u2", "vagabond", 327))
        .await
        .unwrap();

    wait_for_requests(&api, 1).await;
    let requests = api.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        body,
        json!({"user_id": "u2", "manga_id": "vagabond", "chapter": 327})
    );

    // The failed API write does not hold back fan-out
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(2), watcher.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    let received = ProgressUpdate::from_json(line.trim()).unwrap();
    assert_eq!(received.chapter, 327);
}
