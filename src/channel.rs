//! Channel configuration: a named upstream provider endpoint plus its
//! credentials, model list, tunables, and override rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Sentinel string meaning "delete this key/header" in override maps.
pub const CLEAR_SENTINEL: &str = "__AXONHUB_CLEAR__";

/// Header names that override rules may never touch, regardless of the
/// channel's configured `override_headers`.
pub const HOP_BY_HOP_DENY_LIST: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    Bearer {
        token: String,
    },
    OAuth {
        access_token: String,
        refresh_token: String,
    },
    AwsKeys {
        access_key_id: String,
        secret_access_key: String,
    },
}

/// An ordered override-header entry: a single-key map so duplicate
/// header names can be applied in sequence, mirroring the config shape
/// in the design doc (`override_headers: [{name: value}, ...]`).
pub type OverrideHeaderEntry = (String, String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    pub credential: Credential,
    pub supported_models: BTreeSet<String>,
    #[serde(default)]
    pub model_mappings: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub model_prefix: Option<String>,
    /// Ordering weight, 0-100, administrator controlled.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub status: ChannelStatus,
    /// JSON-patch-like override map: dotted-path keys, literal JSON
    /// values, or the `CLEAR_SENTINEL` string meaning "delete".
    #[serde(default)]
    pub override_parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub override_headers: Vec<OverrideHeaderEntry>,
}

fn default_weight() -> u32 {
    100
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.contains(model)
    }

    /// Applies `override_parameters` to a JSON request body. The
    /// reserved key `stream` is always ignored (logged, not applied);
    /// `CLEAR_SENTINEL` values delete the key at that dotted path;
    /// other values set it. Dotted paths address nested objects,
    /// creating intermediate objects as needed.
    pub fn apply_override_parameters(&self, body: &mut serde_json::Value) {
        for (key, value) in &self.override_parameters {
            if key == "stream" {
                tracing::warn!("override_parameters: key 'stream' is reserved, ignoring");
                continue;
            }
            match value {
                serde_json::Value::String(s) if s == CLEAR_SENTINEL => {
                    delete_dotted_path(body, key);
                }
                other => {
                    set_dotted_path(body, key, other.clone());
                }
            }
        }
    }

    /// Applies `override_headers` to a header list, skipping the
    /// hop-by-hop deny-list and honoring `CLEAR_SENTINEL` as deletion.
    pub fn apply_override_headers(&self, headers: &mut Vec<(String, String)>) {
        for (name, value) in &self.override_headers {
            let lower = name.to_ascii_lowercase();
            if HOP_BY_HOP_DENY_LIST.contains(&lower.as_str()) {
                continue;
            }
            if value == CLEAR_SENTINEL {
                headers.retain(|(n, _)| n.to_ascii_lowercase() != lower);
            } else {
                headers.retain(|(n, _)| n.to_ascii_lowercase() != lower);
                headers.push((name.clone(), value.clone()));
            }
        }
    }
}

fn set_dotted_path(root: &mut serde_json::Value, path: &str, value: serde_json::Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (i, part) in parts.iter().enumerate() {
        if !current.is_object() {
            *current = serde_json::Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().expect("just ensured object");
        if i == parts.len() - 1 {
            map.insert((*part).to_string(), value);
            return;
        }
        current = map
            .entry((*part).to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }
}

fn delete_dotted_path(root: &mut serde_json::Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for (i, part) in parts.iter().enumerate() {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if i == parts.len() - 1 {
            map.remove(*part);
            return;
        }
        let Some(next) = map.get_mut(*part) else {
            return;
        };
        current = next;
    }
}
