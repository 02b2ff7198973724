/// Integration tests for the asset HTTP bridge on a real loopback listener
///
/// Scenarios:
/// 1. Upload, idempotent re-upload and download with cache headers
/// 2. A blob deleted out of band is reported missing and its record dropped
/// 3. Oversized uploads are refused and leave nothing behind
/// 4. The index survives a restart of the store
use design_relay_lib::assets::{start_asset_server, AssetServerState, AssetStore};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-bytes";

async fn start(dir: &TempDir, max_asset_bytes: u64) -> (Arc<AssetStore>, String, CancellationToken) {
    let store = Arc::new(AssetStore::open(dir.path()).unwrap());
    let token = CancellationToken::new();
    let server = start_asset_server(
        AssetServerState {
            store: store.clone(),
            max_asset_bytes,
        },
        token.clone(),
    )
    .await
    .unwrap();
    (store, server.url(), token)
}

#[tokio::test]
async fn test_upload_is_idempotent_and_downloadable() {
    let dir = TempDir::new().unwrap();
    let (store, url, token) = start(&dir, 1024 * 1024).await;
    let client = reqwest::Client::new();
    let asset = format!("{}/assets/cafebabe0001", url);

    let first = client
        .post(&asset)
        .header("Content-Type", "image/png")
        .header("X-Asset-Width", "120")
        .header("X-Asset-Height", "80")
        .body(PNG)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);

    let second = client
        .post(&asset)
        .header("Content-Type", "image/png")
        .body(PNG)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["stored"], serde_json::json!(false));
    assert_eq!(store.len(), 1);

    let response = client.get(&asset).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "image/png");
    assert_eq!(headers["etag"], "\"cafebabe0001\"");
    assert!(headers["cache-control"]
        .to_str()
        .unwrap()
        .contains("immutable"));
    assert_eq!(response.bytes().await.unwrap().as_ref(), PNG);

    let record = store.get("cafebabe0001").unwrap();
    assert_eq!(record.width, Some(120));
    assert_eq!(record.height, Some(80));

    token.cancel();
}

#[tokio::test]
async fn test_missing_blob_self_heals() {
    let dir = TempDir::new().unwrap();
    let (store, url, token) = start(&dir, 1024 * 1024).await;
    let client = reqwest::Client::new();
    let asset = format!("{}/assets/deadbeef0002", url);

    client.post(&asset).body(PNG).send().await.unwrap();
    std::fs::remove_file(store.path_for("deadbeef0002")).unwrap();

    let response = client.get(&asset).send().await.unwrap();

    assert_eq!(response.status(), 404);
    assert!(store.list().is_empty());
    token.cancel();
}

#[tokio::test]
async fn test_oversized_upload_is_refused() {
    let dir = TempDir::new().unwrap();
    let (store, url, token) = start(&dir, 8).await;

    let response = reqwest::Client::new()
        .post(format!("{}/assets/0123456789ab", url))
        .body(PNG)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
    assert!(!store.has("0123456789ab"));
    assert!(!store.path_for("0123456789ab").exists());
    token.cancel();
}

#[tokio::test]
async fn test_index_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let (store, url, token) = start(&dir, 1024 * 1024).await;
        reqwest::Client::new()
            .post(format!("{}/assets/feedface0003", url))
            .header("Content-Type", "image/jpeg")
            .body(PNG)
            .send()
            .await
            .unwrap();
        store.flush().unwrap();
        token.cancel();
    }

    let reopened = AssetStore::open(dir.path()).unwrap();
    let record = reopened.get("feedface0003").unwrap();
    assert_eq!(record.mime_type, "image/jpeg");
    assert_eq!(record.size, PNG.len() as u64);
}
