//! Tool invocation pipeline
//!
//! Validates a named call against the catalog and runs it either in-process
//! or on the active extension. Every path ends in a [`ToolResponse`]; handler
//! errors and panics never escape to the consumer session.

use super::catalog::{
    parse_args, AssetEntry, AssetsOutput, GetAssetsParams, LocalTool, RelayStatusOutput,
    ToolCatalog, ToolDefinition, ToolTarget,
};
use super::format::{asset_url, format_payload, raw_payload};
use crate::assets::{AssetRecord, AssetStore, RemoveOptions};
use crate::error::{error_codes, CallError};
use crate::hub::registry::ExtensionRegistry;
use crate::pending::PendingCalls;
use crate::protocol::{HubMessage, ToolCallPayload};
use futures_util::FutureExt;
use rmcp::model::{JsonObject, Tool};
use serde::Serialize;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// Text content blocks, in order
    pub blocks: Vec<String>,
    /// Structured content for tools that declare an output shape
    pub structured: Option<Value>,
    pub is_error: bool,
}

impl ToolResponse {
    fn text(blocks: Vec<String>) -> Self {
        Self {
            blocks,
            structured: None,
            is_error: false,
        }
    }

    fn structured<T: Serialize>(summary: String, output: &T) -> Self {
        match serde_json::to_value(output) {
            Ok(value) => Self {
                blocks: vec![summary, value.to_string()],
                structured: Some(value),
                is_error: false,
            },
            Err(e) => Self::failure(error_codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    /// Error response carrying a code, message and optional hint.
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut body = json!({ "error": { "code": code, "message": message } });
        if let Some(hint) = hint_for(code) {
            body["hint"] = Value::String(hint.to_string());
        }
        Self {
            blocks: vec![body.to_string()],
            structured: None,
            is_error: true,
        }
    }

    fn from_call_error(error: &CallError) -> Self {
        Self::failure(error.code(), error.to_string())
    }
}

fn hint_for(code: &str) -> Option<&'static str> {
    match code {
        error_codes::NO_ACTIVE_EXTENSION => {
            Some("Open the design file, run the relay plugin and click Activate.")
        }
        error_codes::CALL_TIMEOUT => {
            Some("The extension did not answer in time. Large documents may need a longer timeout.")
        }
        error_codes::EXTENSION_DISCONNECTED => {
            Some("The plugin window was closed or reloaded. Retry once it reconnects.")
        }
        _ => None,
    }
}

/// Shared dispatcher for every consumer session.
pub struct ToolPipeline {
    catalog: ToolCatalog,
    registry: Arc<ExtensionRegistry>,
    pending: PendingCalls,
    store: Arc<AssetStore>,
    asset_base_url: String,
    timeout: Duration,
}

impl ToolPipeline {
    pub fn new(
        catalog: ToolCatalog,
        registry: Arc<ExtensionRegistry>,
        pending: PendingCalls,
        store: Arc<AssetStore>,
        asset_base_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            registry,
            pending,
            store,
            asset_base_url,
            timeout,
        }
    }

    /// Descriptors of every exposed tool.
    pub fn list_tools(&self) -> Vec<Tool> {
        self.catalog.exposed().map(ToolDefinition::to_tool).collect()
    }

    /// Run one tool call to completion.
    pub async fn invoke(&self, name: &str, args: Option<JsonObject>) -> ToolResponse {
        let Some(tool) = self.catalog.get(name) else {
            return ToolResponse::failure(error_codes::UNKNOWN_TOOL, format!("Unknown tool: {}", name));
        };

        let args = args.unwrap_or_default();
        if let Err(e) = tool.validate(&args) {
            return ToolResponse::failure(error_codes::INVALID_ARGUMENTS, e);
        }

        log::debug!("Invoking tool {}", name);
        let outcome = AssertUnwindSafe(self.dispatch(tool, args))
            .catch_unwind()
            .await;

        match outcome {
            Ok(response) => response,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Tool {} panicked: {}", name, detail);
                ToolResponse::failure(
                    error_codes::INTERNAL_ERROR,
                    format!("Tool {} failed: {}", name, detail),
                )
            }
        }
    }

    async fn dispatch(&self, tool: &ToolDefinition, args: JsonObject) -> ToolResponse {
        match tool.target {
            ToolTarget::Local(local) => self.run_local(local, &args),
            ToolTarget::Proxied => match self.forward(tool.name, args).await {
                Ok(payload) => self.shape(tool.name, &payload),
                Err(e) => {
                    log::warn!("Tool {} failed: {}", tool.name, e);
                    ToolResponse::from_call_error(&e)
                }
            },
        }
    }

    /// Send the call to the active extension and wait for its reply.
    async fn forward(&self, name: &str, args: JsonObject) -> Result<Value, CallError> {
        let (peer_id, sender) = self
            .registry
            .active_peer()
            .ok_or(CallError::NoActiveExtension)?;

        let (reply, id) = self.pending.register(&peer_id, self.timeout);
        let message = HubMessage::ToolCall {
            id: id.clone(),
            payload: ToolCallPayload {
                name: name.to_string(),
                args: Value::Object(args),
            },
        };

        if sender.send(message).is_err() {
            self.pending.reject(&id, CallError::SendFailed);
        }

        reply.wait().await
    }

    fn shape(&self, name: &str, payload: &Value) -> ToolResponse {
        let formatted = match format_payload(name, payload, &self.store, &self.asset_base_url) {
            Ok(formatted) => formatted,
            Err(e) => {
                log::warn!("Formatter for {} failed, returning raw payload: {}", name, e);
                raw_payload(payload)
            }
        };
        ToolResponse::text(formatted.into_blocks())
    }

    fn run_local(&self, tool: LocalTool, args: &JsonObject) -> ToolResponse {
        match tool {
            LocalTool::GetAssets => match parse_args::<GetAssetsParams>(args) {
                Ok(params) => self.get_assets(&params.hashes),
                Err(e) => ToolResponse::failure(error_codes::INVALID_ARGUMENTS, e),
            },
            LocalTool::ListAssets => self.list_assets(),
            LocalTool::RelayStatus => self.relay_status(),
        }
    }

    fn get_assets(&self, hashes: &[String]) -> ToolResponse {
        let assets: Vec<AssetEntry> = self
            .store
            .get_many(hashes)
            .into_iter()
            .map(|(hash, record)| match record {
                Some(record) if record.file_path.is_file() => self.entry(&record),
                Some(_) => {
                    self.store.remove(&hash, RemoveOptions { remove_file: false });
                    missing(hash)
                }
                None => missing(hash),
            })
            .collect();

        let found = assets.iter().filter(|a| !a.missing).count();
        let summary = format!("Resolved {} of {} asset(s)", found, assets.len());
        ToolResponse::structured(summary, &AssetsOutput { assets })
    }

    fn list_assets(&self) -> ToolResponse {
        let assets: Vec<AssetEntry> = self.store.list().iter().map(|r| self.entry(r)).collect();
        let summary = format!("{} cached asset(s)", assets.len());
        ToolResponse::structured(summary, &AssetsOutput { assets })
    }

    fn relay_status(&self) -> ToolResponse {
        let HubMessage::State {
            active_id,
            count,
            extensions,
            port,
            asset_server_url,
        } = self.registry.snapshot()
        else {
            return ToolResponse::failure(error_codes::INTERNAL_ERROR, "Unexpected state snapshot");
        };

        let status = RelayStatusOutput {
            active_id,
            extensions,
            consumers: count,
            port,
            asset_server_url,
            pending_calls: self.pending.len(),
        };
        let summary = match &status.active_id {
            Some(id) => format!("Active extension {} of {}", id, status.extensions),
            None => format!("No active extension ({} connected)", status.extensions),
        };
        ToolResponse::structured(summary, &status)
    }

    fn entry(&self, record: &AssetRecord) -> AssetEntry {
        AssetEntry {
            hash: record.hash.clone(),
            url: Some(asset_url(&self.asset_base_url, &record.hash)),
            mime_type: Some(record.mime_type.clone()),
            size: Some(record.size),
            width: record.width,
            height: record.height,
            missing: false,
        }
    }
}

fn missing(hash: String) -> AssetEntry {
    AssetEntry {
        hash,
        url: None,
        mime_type: None,
        size: None,
        width: None,
        height: None,
        missing: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExtensionMessage;
    use crate::tools::catalog::build_catalog;
    use chrono::Utc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        store: Arc<AssetStore>,
        registry: Arc<ExtensionRegistry>,
        pending: PendingCalls,
        pipeline: ToolPipeline,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AssetStore::open(dir.path()).unwrap());
        let pending = PendingCalls::new();
        let registry = ExtensionRegistry::new(pending.clone(), Duration::from_secs(60));
        let pipeline = ToolPipeline::new(
            build_catalog(true),
            registry.clone(),
            pending.clone(),
            store.clone(),
            "http://127.0.0.1:9000".to_string(),
            timeout,
        );
        Fixture {
            _dir: dir,
            store,
            registry,
            pending,
            pipeline,
        }
    }

    fn args(value: Value) -> Option<JsonObject> {
        match value {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    fn put_asset(store: &AssetStore, hash: &str) {
        let path = store.path_for(hash);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"png").unwrap();
        store.upsert(AssetRecord {
            hash: hash.to_string(),
            file_path: path,
            mime_type: "image/png".to_string(),
            size: 3,
            last_touched: Utc::now(),
            width: Some(10),
            height: Some(20),
        });
    }

    /// Connect a fake extension that answers every call with `reply`.
    fn spawn_extension(registry: &Arc<ExtensionRegistry>, reply: Value) -> String {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.connect(tx);
        registry.activate(&id);

        let registry = registry.clone();
        let peer_id = id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let HubMessage::ToolCall { id, .. } = message {
                    registry.on_message(
                        &peer_id,
                        ExtensionMessage::ToolResult {
                            id,
                            payload: Some(reply.clone()),
                            error: None,
                        },
                    );
                }
            }
        });
        id
    }

    #[tokio::test]
    async fn test_unknown_and_hidden_tools() {
        let f = fixture(Duration::from_secs(1));
        let response = f.pipeline.invoke("no_such_tool", None).await;
        assert!(response.is_error);
        assert!(response.blocks[0].contains(error_codes::UNKNOWN_TOOL));
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_dispatch() {
        let f = fixture(Duration::from_secs(1));
        let response = f.pipeline.invoke("get_node", args(json!({}))).await;
        assert!(response.is_error);
        assert!(response.blocks[0].contains(error_codes::INVALID_ARGUMENTS));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_proxied_without_active_extension() {
        let f = fixture(Duration::from_secs(1));
        let response = f.pipeline.invoke("get_selection", None).await;
        assert!(response.is_error);
        assert!(response.blocks[0].contains(error_codes::NO_ACTIVE_EXTENSION));
        assert!(response.blocks[0].contains("hint"));
    }

    #[tokio::test]
    async fn test_proxied_round_trip() {
        let f = fixture(Duration::from_secs(5));
        spawn_extension(&f.registry, json!({ "id": "1:2", "name": "Frame" }));

        let response = f
            .pipeline
            .invoke("get_node", args(json!({ "nodeId": "1:2" })))
            .await;

        assert!(!response.is_error);
        assert!(response.blocks[0].contains("Frame"));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_export_attaches_resource_link() {
        let f = fixture(Duration::from_secs(5));
        put_asset(&f.store, "cafebabe01");
        spawn_extension(&f.registry, json!({ "hash": "cafebabe01" }));

        let response = f
            .pipeline
            .invoke("export_node_image", args(json!({ "nodeId": "1:2" })))
            .await;

        assert!(!response.is_error);
        assert_eq!(response.blocks.len(), 2);
        assert!(response.blocks[1].contains("http://127.0.0.1:9000/assets/cafebabe01"));
    }

    #[tokio::test]
    async fn test_proxied_timeout() {
        let f = fixture(Duration::from_millis(30));
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = f.registry.connect(tx);
        f.registry.activate(&id);

        let response = f.pipeline.invoke("get_styles", None).await;

        assert!(response.is_error);
        assert!(response.blocks[0].contains(error_codes::CALL_TIMEOUT));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_extension_leaving_mid_call() {
        let f = fixture(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = f.registry.connect(tx);
        f.registry.activate(&id);

        let registry = f.registry.clone();
        tokio::spawn(async move {
            if let Some(HubMessage::ToolCall { .. }) = rx.recv().await {
                registry.disconnect(&id);
            }
        });

        let response = f.pipeline.invoke("get_selection", None).await;

        assert!(response.is_error);
        assert!(response.blocks[0].contains(error_codes::EXTENSION_DISCONNECTED));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_extension_error_is_surfaced() {
        let f = fixture(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = f.registry.connect(tx);
        f.registry.activate(&id);

        let registry = f.registry.clone();
        let peer_id = id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let HubMessage::ToolCall { id, .. } = message {
                    registry.on_message(
                        &peer_id,
                        ExtensionMessage::ToolResult {
                            id,
                            payload: None,
                            error: Some(json!({ "message": "Node not found" })),
                        },
                    );
                }
            }
        });

        let response = f
            .pipeline
            .invoke("get_node", args(json!({ "nodeId": "9:9" })))
            .await;

        assert!(response.is_error);
        assert!(response.blocks[0].contains("Node not found"));
        assert!(response.blocks[0].contains(error_codes::EXTENSION_ERROR));
    }

    #[tokio::test]
    async fn test_get_assets_reports_missing_and_heals() {
        let f = fixture(Duration::from_secs(1));
        put_asset(&f.store, "cafebabe01");
        put_asset(&f.store, "deadbeef02");
        std::fs::remove_file(f.store.path_for("deadbeef02")).unwrap();

        let response = f
            .pipeline
            .invoke(
                "get_assets",
                args(json!({ "hashes": ["cafebabe01", "deadbeef02", "unknown999"] })),
            )
            .await;

        assert!(!response.is_error);
        let structured = response.structured.unwrap();
        let assets = structured["assets"].as_array().unwrap();
        assert_eq!(assets.len(), 3);
        assert_eq!(assets[0]["missing"], json!(false));
        assert_eq!(assets[0]["width"], json!(10));
        assert_eq!(assets[1]["missing"], json!(true));
        assert_eq!(assets[2]["missing"], json!(true));
        assert!(!f.store.has("deadbeef02"));
    }

    #[tokio::test]
    async fn test_relay_status() {
        let f = fixture(Duration::from_secs(1));
        f.registry.consumer_connected();

        let response = f.pipeline.invoke("relay_status", None).await;

        let structured = response.structured.unwrap();
        assert_eq!(structured["consumers"], json!(1));
        assert_eq!(structured["activeId"], Value::Null);
        assert_eq!(structured["pendingCalls"], json!(0));
    }

    #[tokio::test]
    async fn test_list_tools_hides_debug_when_disabled() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AssetStore::open(dir.path()).unwrap());
        let pending = PendingCalls::new();
        let registry = ExtensionRegistry::new(pending.clone(), Duration::from_secs(60));
        let pipeline = ToolPipeline::new(
            build_catalog(false),
            registry,
            pending,
            store,
            String::new(),
            Duration::from_secs(1),
        );

        let names: Vec<String> = pipeline
            .list_tools()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        assert!(names.contains(&"get_assets".to_string()));
        assert!(!names.contains(&"relay_status".to_string()));
        assert!(pipeline.invoke("relay_status", None).await.is_error);
    }
}
