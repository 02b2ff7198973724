//! Response formatters for proxied tools
//!
//! Turn the raw payload an extension returns into text blocks for the
//! consumer. Formatters may attach links to cached assets; when one fails the
//! pipeline falls back to [`raw_payload`].

use crate::assets::AssetStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

const IMAGE_HASH_KEY: &str = "imageHash";

/// Link to an asset served by the relay's HTTP bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLink {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A formatted proxied result.
#[derive(Debug, Clone, PartialEq)]
pub struct Formatted {
    pub text: String,
    pub links: Vec<ResourceLink>,
}

impl Formatted {
    /// Text blocks for the consumer: the payload, then the links if any.
    pub fn into_blocks(self) -> Vec<String> {
        let mut blocks = vec![self.text];
        if !self.links.is_empty() {
            let links = serde_json::json!({ "resourceLinks": self.links });
            blocks.push(links.to_string());
        }
        blocks
    }
}

/// URL of `hash` under `base_url`.
pub fn asset_url(base_url: &str, hash: &str) -> String {
    format!("{}/assets/{}", base_url.trim_end_matches('/'), hash)
}

/// Format `payload` returned by `tool`.
pub fn format_payload(
    tool: &str,
    payload: &Value,
    store: &AssetStore,
    base_url: &str,
) -> Result<Formatted, String> {
    match tool {
        "export_node_image" => {
            let hash = payload
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| "export_node_image reply has no hash".to_string())?;
            let record = store
                .get(hash)
                .ok_or_else(|| format!("Asset {} was not uploaded", hash))?;
            let link = ResourceLink {
                uri: asset_url(base_url, hash),
                name: hash.to_string(),
                mime_type: Some(record.mime_type),
                size: Some(record.size),
            };
            Ok(Formatted {
                text: pretty(payload)?,
                links: vec![link],
            })
        }
        "get_document" | "get_selection" | "get_node" => {
            let links = collect_image_hashes(payload)
                .into_iter()
                .filter_map(|hash| {
                    store.get(&hash).map(|record| ResourceLink {
                        uri: asset_url(base_url, &hash),
                        name: hash,
                        mime_type: Some(record.mime_type),
                        size: Some(record.size),
                    })
                })
                .collect();
            Ok(Formatted {
                text: pretty(payload)?,
                links,
            })
        }
        _ => Ok(Formatted {
            text: pretty(payload)?,
            links: Vec::new(),
        }),
    }
}

/// Generic wrapper used when a formatter fails.
pub fn raw_payload(payload: &Value) -> Formatted {
    let text = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Formatted {
        text,
        links: Vec::new(),
    }
}

fn pretty(payload: &Value) -> Result<String, String> {
    match payload {
        Value::String(s) => Ok(s.clone()),
        other => serde_json::to_string_pretty(other)
            .map_err(|e| format!("Failed to render payload: {}", e)),
    }
}

/// Every distinct `imageHash` string in `value`, in document order.
pub fn collect_image_hashes(value: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hashes = Vec::new();
    let mut stack = vec![value];

    while let Some(current) = stack.pop() {
        match current {
            Value::Object(map) => {
                if let Some(Value::String(hash)) = map.get(IMAGE_HASH_KEY) {
                    if seen.insert(hash.clone()) {
                        hashes.push(hash.clone());
                    }
                }
                // Reverse so the stack pops children in document order
                stack.extend(map.values().rev());
            }
            Value::Array(items) => stack.extend(items.iter().rev()),
            _ => {}
        }
    }

    hashes
}
