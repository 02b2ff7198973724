//! Tool catalog
//!
//! Static definitions of every tool the relay offers to consumers. Argument
//! shapes are JSON Schemas generated from the typed parameter structs below;
//! the same structs validate incoming arguments before any handler runs.

use rmcp::model::{JsonObject, Tool};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Upper bound on hashes resolved by one `get_assets` call
pub const MAX_HASHES_PER_CALL: usize = 256;

/// Tools the relay serves itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTool {
    GetAssets,
    ListAssets,
    RelayStatus,
}

/// Where a tool call is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTarget {
    Local(LocalTool),
    /// Forwarded to the active extension
    Proxied,
}

type Validator = fn(&JsonObject) -> Result<(), String>;

/// One catalog entry.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Arc<JsonObject>,
    pub output: Option<Arc<JsonObject>>,
    pub target: ToolTarget,
    /// Hidden tools are neither listed nor callable
    pub exposed: bool,
    validator: Validator,
}

impl ToolDefinition {
    /// Check `args` against the tool's parameter shape.
    pub fn validate(&self, args: &JsonObject) -> Result<(), String> {
        (self.validator)(args)
    }

    /// MCP tool descriptor.
    pub fn to_tool(&self) -> Tool {
        let mut tool = Tool::new(self.name, self.description, self.parameters.clone());
        tool.output_schema = self.output.clone();
        tool
    }
}

/// Range and enumeration checks that serde cannot express.
pub trait CheckArgs {
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Deserialize `args` into `P` and run its checks.
pub fn parse_args<P>(args: &JsonObject) -> Result<P, String>
where
    P: DeserializeOwned + CheckArgs,
{
    let params: P = serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| format!("Invalid arguments: {}", e))?;
    params.check()?;
    Ok(params)
}

fn validate_as<P>(args: &JsonObject) -> Result<(), String>
where
    P: DeserializeOwned + CheckArgs,
{
    parse_args::<P>(args).map(|_| ())
}

fn schema_of<T: JsonSchema>() -> Arc<JsonObject> {
    let schema = schemars::schema_for!(T);
    match serde_json::to_value(&schema) {
        Ok(Value::Object(mut map)) => {
            map.remove("$schema");
            map.remove("title");
            Arc::new(map)
        }
        _ => {
            let mut map = JsonObject::new();
            map.insert("type".to_string(), Value::String("object".to_string()));
            Arc::new(map)
        }
    }
}

// ============================================================================
// Parameter shapes
// ============================================================================

/// Tools without arguments
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoParams {}

impl CheckArgs for NoParams {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetAssetsParams {
    /// Content hashes previously returned by other tools
    pub hashes: Vec<String>,
}

impl CheckArgs for GetAssetsParams {
    fn check(&self) -> Result<(), String> {
        if self.hashes.is_empty() {
            return Err("hashes must not be empty".to_string());
        }
        if self.hashes.len() > MAX_HASHES_PER_CALL {
            return Err(format!(
                "at most {} hashes per call, got {}",
                MAX_HASHES_PER_CALL,
                self.hashes.len()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetNodeParams {
    /// Node id as shown in the design editor, e.g. `12:345`
    pub node_id: String,
    /// How many levels of children to include
    #[serde(default)]
    pub depth: Option<u32>,
}

impl CheckArgs for GetNodeParams {
    fn check(&self) -> Result<(), String> {
        if self.node_id.trim().is_empty() {
            return Err("nodeId must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpg,
    Svg,
    Pdf,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportNodeImageParams {
    pub node_id: String,
    /// Defaults to png
    #[serde(default)]
    pub format: Option<ImageFormat>,
    /// Export scale between 0.01 and 4
    #[serde(default)]
    pub scale: Option<f64>,
}

impl CheckArgs for ExportNodeImageParams {
    fn check(&self) -> Result<(), String> {
        if self.node_id.trim().is_empty() {
            return Err("nodeId must not be empty".to_string());
        }
        if let Some(scale) = self.scale {
            if !(0.01..=4.0).contains(&scale) {
                return Err(format!("scale must be between 0.01 and 4, got {}", scale));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Output shapes of local tools
// ============================================================================

/// One resolved (or missing) asset.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssetEntry {
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub missing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct AssetsOutput {
    pub assets: Vec<AssetEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatusOutput {
    pub active_id: Option<String>,
    pub extensions: usize,
    pub consumers: usize,
    pub port: u16,
    pub asset_server_url: String,
    pub pending_calls: usize,
}

// ============================================================================
// Catalog
// ============================================================================

/// All tool definitions, built once at startup.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
}

impl ToolCatalog {
    /// Look up an exposed tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name && t.exposed)
    }

    /// Exposed tools in declaration order.
    pub fn exposed(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter().filter(|t| t.exposed)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn proxied<P: DeserializeOwned + CheckArgs + JsonSchema>(
    name: &'static str,
    description: &'static str,
) -> ToolDefinition {
    ToolDefinition {
        name,
        description,
        parameters: schema_of::<P>(),
        output: None,
        target: ToolTarget::Proxied,
        exposed: true,
        validator: validate_as::<P>,
    }
}

/// Build the catalog. `relay_status` is only exposed with `expose_debug_tools`.
pub fn build_catalog(expose_debug_tools: bool) -> ToolCatalog {
    let tools = vec![
        proxied::<NoParams>(
            "get_document",
            "Get the node tree of the current page in the open design file.",
        ),
        proxied::<NoParams>(
            "get_selection",
            "Get the nodes currently selected in the design editor.",
        ),
        proxied::<GetNodeParams>(
            "get_node",
            "Get one node by id, optionally with children down to `depth` levels.",
        ),
        proxied::<NoParams>(
            "get_styles",
            "List the local paint, text, effect and grid styles of the design file.",
        ),
        proxied::<NoParams>(
            "get_components",
            "List components and component sets defined in the design file.",
        ),
        proxied::<NoParams>(
            "get_variables",
            "List variable collections, modes and values of the design file.",
        ),
        proxied::<ExportNodeImageParams>(
            "export_node_image",
            "Render a node to an image. The image is uploaded to the relay asset cache \
             and returned as a link.",
        ),
        ToolDefinition {
            name: "get_assets",
            description: "Resolve asset hashes to download URLs, MIME types and sizes.",
            parameters: schema_of::<GetAssetsParams>(),
            output: Some(schema_of::<AssetsOutput>()),
            target: ToolTarget::Local(LocalTool::GetAssets),
            exposed: true,
            validator: validate_as::<GetAssetsParams>,
        },
        ToolDefinition {
            name: "list_assets",
            description: "List every cached asset, most recently used first.",
            parameters: schema_of::<NoParams>(),
            output: Some(schema_of::<AssetsOutput>()),
            target: ToolTarget::Local(LocalTool::ListAssets),
            exposed: true,
            validator: validate_as::<NoParams>,
        },
        ToolDefinition {
            name: "relay_status",
            description: "Report relay connections, ports and pending calls.",
            parameters: schema_of::<NoParams>(),
            output: Some(schema_of::<RelayStatusOutput>()),
            target: ToolTarget::Local(LocalTool::RelayStatus),
            exposed: expose_debug_tools,
            validator: validate_as::<NoParams>,
        },
    ];

    ToolCatalog { tools }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_debug_tool_hidden_by_default() {
        let catalog = build_catalog(false);
        assert!(catalog.get("relay_status").is_none());
        assert!(catalog.exposed().all(|t| t.name != "relay_status"));

        let catalog = build_catalog(true);
        assert!(catalog.get("relay_status").is_some());
    }

    #[test]
    fn test_targets() {
        let catalog = build_catalog(true);
        assert_eq!(
            catalog.get("get_assets").map(|t| t.target),
            Some(ToolTarget::Local(LocalTool::GetAssets))
        );
        assert_eq!(
            catalog.get("get_node").map(|t| t.target),
            Some(ToolTarget::Proxied)
        );
    }

    #[test]
    fn test_get_node_validation() {
        let catalog = build_catalog(false);
        let tool = catalog.get("get_node").unwrap();

        assert!(tool.validate(&args(json!({ "nodeId": "1:2" }))).is_ok());
        assert!(tool
            .validate(&args(json!({ "nodeId": "1:2", "depth": 2 })))
            .is_ok());
        assert!(tool.validate(&args(json!({}))).is_err());
        assert!(tool.validate(&args(json!({ "nodeId": "  " }))).is_err());
        assert!(tool
            .validate(&args(json!({ "nodeId": "1:2", "depth": -1 })))
            .is_err());
    }

    #[test]
    fn test_export_validation() {
        let catalog = build_catalog(false);
        let tool = catalog.get("export_node_image").unwrap();

        assert!(tool
            .validate(&args(json!({ "nodeId": "1:2", "format": "svg", "scale": 2.0 })))
            .is_ok());
        assert!(tool
            .validate(&args(json!({ "nodeId": "1:2", "format": "gif" })))
            .is_err());
        assert!(tool
            .validate(&args(json!({ "nodeId": "1:2", "scale": 8 })))
            .is_err());
    }

    #[test]
    fn test_get_assets_requires_hashes() {
        let catalog = build_catalog(false);
        let tool = catalog.get("get_assets").unwrap();

        assert!(tool.validate(&args(json!({ "hashes": ["abcdef12"] }))).is_ok());
        assert!(tool.validate(&args(json!({ "hashes": [] }))).is_err());
    }

    #[test]
    fn test_schemas_are_objects() {
        let catalog = build_catalog(true);
        for tool in catalog.exposed() {
            assert_eq!(
                tool.parameters.get("type"),
                Some(&json!("object")),
                "{} schema",
                tool.name
            );
            let descriptor = tool.to_tool();
            assert_eq!(descriptor.name, tool.name);
        }
    }
}
