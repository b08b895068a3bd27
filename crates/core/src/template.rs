//! Parameterized workflow templates.
//!
//! A template is a backend API-format node map plus a list of editable
//! slots. Each slot names a `(node, field)` position in the graph, the
//! feature key that feeds it, its value kind, and whether a binding is
//! required. Templates are validated once at load time and shared
//! read-only across every user in a run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum template document size in bytes (10 MB).
pub const MAX_TEMPLATE_JSON_SIZE: usize = 10_000_000;

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Text,
    Integer,
    Float,
    /// Image file name on the backend; bound from a local path or a name.
    Image,
}

impl SlotKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Whether a JSON literal is an acceptable value for this kind.
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            Self::Text | Self::Image => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
        }
    }
}

/// Position of an editable value in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRef {
    pub node: String,
    pub field: String,
}

impl std::fmt::Display for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.field)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSpec {
    pub node: String,
    pub field: String,
    /// FeatureSet key bound into this slot.
    pub key: String,
    pub kind: SlotKind,
    #[serde(default)]
    pub required: bool,
    /// Literal used when no binding exists. Falls back to the graph's own value.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl SlotSpec {
    pub fn slot_ref(&self) -> SlotRef {
        SlotRef {
            node: self.node.clone(),
            field: self.field.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TemplateDocument {
    name: String,
    graph: serde_json::Value,
    #[serde(default)]
    slots: Vec<SlotSpec>,
}

/// A validated, immutable workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    name: String,
    graph: serde_json::Map<String, serde_json::Value>,
    slots: Vec<SlotSpec>,
}

impl WorkflowTemplate {
    /// Parse and validate a template document.
    pub fn parse(json: &str) -> Result<Self, CoreError> {
        if json.len() > MAX_TEMPLATE_JSON_SIZE {
            return Err(CoreError::InvalidTemplate(format!(
                "Template JSON exceeds maximum size of {MAX_TEMPLATE_JSON_SIZE} bytes"
            )));
        }
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| CoreError::InvalidTemplate(format!("Template is not valid JSON: {e}")))?;
        Self::from_json(value)
    }

    /// Validate an already-parsed template document.
    pub fn from_json(value: serde_json::Value) -> Result<Self, CoreError> {
        let doc: TemplateDocument = serde_json::from_value(value)
            .map_err(|e| CoreError::InvalidTemplate(format!("Invalid template document: {e}")))?;

        if doc.name.trim().is_empty() {
            return Err(CoreError::InvalidTemplate(
                "Template name must not be empty".to_string(),
            ));
        }

        let graph = validate_graph(doc.graph)?;
        validate_slots(&graph, &doc.slots)?;

        Ok(Self {
            name: doc.name,
            graph,
            slots: doc.slots,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.graph
    }

    pub fn slots(&self) -> &[SlotSpec] {
        &self.slots
    }

    /// The literal an unbound optional slot keeps.
    pub fn default_for<'a>(&'a self, slot: &'a SlotSpec) -> Option<&'a serde_json::Value> {
        slot.default
            .as_ref()
            .or_else(|| graph_literal(&self.graph, &slot.node, &slot.field))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_graph(
    graph: serde_json::Value,
) -> Result<serde_json::Map<String, serde_json::Value>, CoreError> {
    let serde_json::Value::Object(obj) = graph else {
        return Err(CoreError::InvalidTemplate(
            "Template graph must be an object".to_string(),
        ));
    };

    if obj.is_empty() {
        return Err(CoreError::InvalidTemplate(
            "Template graph must contain at least one node".to_string(),
        ));
    }

    for (node_id, node) in &obj {
        if node.get("class_type").and_then(|v| v.as_str()).is_none() {
            return Err(CoreError::InvalidTemplate(format!(
                "Node '{node_id}' is missing required 'class_type' field"
            )));
        }
        if let Some(inputs) = node.get("inputs") {
            if !inputs.is_object() {
                return Err(CoreError::InvalidTemplate(format!(
                    "Node '{node_id}' has non-object 'inputs'"
                )));
            }
        }
    }

    Ok(obj)
}

fn validate_slots(
    graph: &serde_json::Map<String, serde_json::Value>,
    slots: &[SlotSpec],
) -> Result<(), CoreError> {
    let mut seen = HashSet::with_capacity(slots.len());

    for slot in slots {
        let slot_ref = slot.slot_ref();

        if slot.field.is_empty() || slot.key.is_empty() {
            return Err(CoreError::InvalidTemplate(format!(
                "Slot '{slot_ref}' must name a field and a feature key"
            )));
        }
        if !graph.contains_key(&slot.node) {
            return Err(CoreError::InvalidTemplate(format!(
                "Slot '{slot_ref}' references unknown node '{}'",
                slot.node
            )));
        }
        if !seen.insert(slot_ref.clone()) {
            return Err(CoreError::InvalidTemplate(format!(
                "Slot '{slot_ref}' is declared more than once"
            )));
        }

        if (slot.min.is_some() || slot.max.is_some()) && !slot.kind.is_numeric() {
            return Err(CoreError::InvalidTemplate(format!(
                "Slot '{slot_ref}' declares bounds but is not numeric"
            )));
        }
        if let (Some(min), Some(max)) = (slot.min, slot.max) {
            if min > max {
                return Err(CoreError::InvalidTemplate(format!(
                    "Slot '{slot_ref}' has min {min} greater than max {max}"
                )));
            }
            if slot.kind == SlotKind::Integer && min.ceil() > max.floor() {
                return Err(CoreError::InvalidTemplate(format!(
                    "Integer slot '{slot_ref}' has no integer between min {min} and max {max}"
                )));
            }
        }

        if let Some(default) = &slot.default {
            if !slot.kind.accepts(default) {
                return Err(CoreError::InvalidTemplate(format!(
                    "Slot '{slot_ref}' default {default} does not match kind {:?}",
                    slot.kind
                )));
            }
        } else if !slot.required {
            // Arrays in API-format inputs are links to other nodes, not literals.
            let literal = graph_literal(graph, &slot.node, &slot.field).filter(|v| !v.is_array());
            if literal.is_none() {
                return Err(CoreError::InvalidTemplate(format!(
                    "Optional slot '{slot_ref}' has no default and no literal in the graph"
                )));
            }
        }
    }

    Ok(())
}

fn graph_literal<'a>(
    graph: &'a serde_json::Map<String, serde_json::Value>,
    node: &str,
    field: &str,
) -> Option<&'a serde_json::Value> {
    graph.get(node)?.get("inputs")?.get(field)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
