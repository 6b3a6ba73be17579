//! Aggregation of outbound server capabilities.
//!
//! The proxy advertises the union of its *connected* servers' capabilities.
//! Each category is merged with a shallow key-level union; iteration happens
//! in catalog (name) order and the first-seen value for a key wins, which
//! keeps the aggregate deterministic across runs.

use mcp_types::ServerCapabilities;
use serde_json::Map;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityCategory {
    Completions,
    Experimental,
    Logging,
    Prompts,
    Resources,
    Tools,
}

impl CapabilityCategory {
    const ALL: [CapabilityCategory; 6] = [
        CapabilityCategory::Completions,
        CapabilityCategory::Experimental,
        CapabilityCategory::Logging,
        CapabilityCategory::Prompts,
        CapabilityCategory::Resources,
        CapabilityCategory::Tools,
    ];

    pub fn key(self) -> &'static str {
        match self {
            CapabilityCategory::Completions => "completions",
            CapabilityCategory::Experimental => "experimental",
            CapabilityCategory::Logging => "logging",
            CapabilityCategory::Prompts => "prompts",
            CapabilityCategory::Resources => "resources",
            CapabilityCategory::Tools => "tools",
        }
    }

    /// The `listChanged` notification method for this category, when the
    /// protocol defines one.
    pub fn list_changed_method(self) -> Option<&'static str> {
        use mcp_types::ModelContextProtocolNotification;
        match self {
            CapabilityCategory::Tools => Some(mcp_types::ToolListChangedNotification::METHOD),
            CapabilityCategory::Resources => {
                Some(mcp_types::ResourceListChangedNotification::METHOD)
            }
            CapabilityCategory::Prompts => Some(mcp_types::PromptListChangedNotification::METHOD),
            _ => None,
        }
    }
}

/// Union the capabilities of connected servers, in the iteration order of
/// `caps` (callers pass catalog order).
pub fn aggregate<'a>(caps: impl IntoIterator<Item = &'a ServerCapabilities>) -> ServerCapabilities {
    let mut merged: Map<String, Value> = Map::new();
    for server_caps in caps {
        let value = match serde_json::to_value(server_caps) {
            Ok(Value::Object(map)) => map,
            _ => continue,
        };
        for (category, contents) in value {
            match merged.get_mut(&category) {
                None => {
                    merged.insert(category, contents);
                }
                Some(Value::Object(existing)) => {
                    if let Value::Object(incoming) = contents {
                        for (key, inner) in incoming {
                            // Shallow union: the first-seen key wins.
                            existing.entry(key).or_insert(inner);
                        }
                    }
                }
                Some(_) => {
                    // First-seen non-object value wins outright.
                }
            }
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or_default()
}

/// The categories whose aggregated value differs between two aggregates.
pub fn changed_categories(
    old: &ServerCapabilities,
    new: &ServerCapabilities,
) -> Vec<CapabilityCategory> {
    let old_value = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_value = serde_json::to_value(new).unwrap_or(Value::Null);
    CapabilityCategory::ALL
        .into_iter()
        .filter(|category| {
            old_value.get(category.key()) != new_value.get(category.key())
        })
        .collect()
}
