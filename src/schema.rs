//! Capability descriptors.
//!
//! A capability is one named operation a server exposes. Its input shape is
//! a small recursive schema parsed from the JSON-schema map MCP tools carry.
//! The subset is deliberate: strings (plain or enumerated), integers,
//! numbers, booleans, lists, and objects with named fields. Anything the
//! subset cannot express degrades to `Any` rather than rejecting the tool.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named operation exposed by a server. Names are unique per server, not
/// globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: SchemaNode,
}

impl Capability {
    pub fn from_tool(tool: &rmcp::model::Tool) -> Self {
        let schema = Value::Object((*tool.input_schema).clone());
        Self {
            name: tool.name.to_string(),
            description: tool.description.as_ref().map(|d| d.to_string()),
            input_schema: SchemaNode::from_json_schema(&schema),
        }
    }
}

/// Recursive input-shape descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaNode {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enum_values: Option<Vec<String>>,
    },
    Integer,
    Number,
    Boolean,
    List {
        item: Box<SchemaNode>,
    },
    Object {
        #[serde(default)]
        fields: BTreeMap<String, SchemaNode>,
        /// Names of mandatory fields.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        required: Vec<String>,
    },
    /// Fallback for shapes outside the supported subset.
    Any,
}

impl SchemaNode {
    /// Parse a JSON-schema fragment into the descriptor subset.
    pub fn from_json_schema(value: &Value) -> SchemaNode {
        let Some(obj) = value.as_object() else {
            return SchemaNode::Any;
        };

        // An enum without an explicit type is still an enumerated string.
        let enum_values = obj.get("enum").and_then(string_array);

        match obj.get("type").and_then(Value::as_str) {
            Some("string") => SchemaNode::String { enum_values },
            Some("integer") => SchemaNode::Integer,
            Some("number") => SchemaNode::Number,
            Some("boolean") => SchemaNode::Boolean,
            Some("array") => {
                let item = obj
                    .get("items")
                    .map(SchemaNode::from_json_schema)
                    .unwrap_or(SchemaNode::Any);
                SchemaNode::List { item: Box::new(item) }
            }
            Some("object") => {
                let fields = obj
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(k, v)| (k.clone(), SchemaNode::from_json_schema(v)))
                            .collect()
                    })
                    .unwrap_or_default();
                let required = obj
                    .get("required")
                    .and_then(string_array)
                    .unwrap_or_default();
                SchemaNode::Object { fields, required }
            }
            _ if enum_values.is_some() => SchemaNode::String { enum_values },
            _ => SchemaNode::Any,
        }
    }
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let strings: Vec<String> = items
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if strings.len() == items.len() {
        Some(strings)
    } else {
        None
    }
}
