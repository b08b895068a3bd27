//! Job builder: binds a [`FeatureSet`] into a [`WorkflowTemplate`].
//!
//! Required slots without a binding and values of the wrong kind are
//! construction errors, so a partially bound graph never reaches the
//! backend. Out-of-range numeric values are clamped and reported as
//! warnings instead.

use std::path::PathBuf;

use serde::Serialize;

use crate::features::{FeatureSet, FeatureValue};
use crate::template::{SlotKind, SlotRef, SlotSpec, WorkflowTemplate};
use crate::types::UserId;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConstructionError {
    #[error("missing required slot binding(s): {}", join_slots(.slots))]
    MissingRequired { slots: Vec<SlotRef> },

    #[error("slot {slot} expects {expected:?} but feature '{key}' is {found}")]
    TypeMismatch {
        slot: SlotRef,
        key: String,
        expected: SlotKind,
        found: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    Feature,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotBinding {
    pub slot: SlotRef,
    pub value: serde_json::Value,
    pub source: BindingSource,
}

/// A numeric value that was pulled into the slot's declared range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveWarning {
    pub slot: SlotRef,
    pub requested: f64,
    pub applied: f64,
}

impl std::fmt::Display for ResolveWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "slot {} clamped from {} to {}",
            self.slot, self.requested, self.applied
        )
    }
}

/// A template with every slot bound, ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedJob {
    pub user_id: UserId,
    /// Batch key, see [`FeatureSet::key`].
    pub key: String,
    pub graph: serde_json::Value,
    pub bindings: Vec<SlotBinding>,
    pub warnings: Vec<ResolveWarning>,
    /// Local files the backend needs before the graph can run.
    pub uploads: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Bind every template slot from `features`.
///
/// All missing required slots are reported together. Optional slots
/// without a binding keep the template default.
pub fn resolve(
    template: &WorkflowTemplate,
    features: &FeatureSet,
) -> Result<ResolvedJob, ConstructionError> {
    let mut graph = template.graph().clone();
    let mut bindings = Vec::with_capacity(template.slots().len());
    let mut warnings = Vec::new();
    let mut uploads = Vec::new();
    let mut missing = Vec::new();
    let mut mismatch = None;

    for slot in template.slots() {
        let slot_ref = slot.slot_ref();

        let (value, source) = match features.get(&slot.key) {
            Some(feature) => match bind_feature(slot, &slot_ref, feature) {
                Ok(bound) => {
                    if let Some(warning) = bound.warning {
                        warnings.push(warning);
                    }
                    if let Some(path) = bound.upload {
                        if !uploads.contains(&path) {
                            uploads.push(path);
                        }
                    }
                    (bound.value, BindingSource::Feature)
                }
                Err(err) => {
                    mismatch.get_or_insert(err);
                    continue;
                }
            },
            None if slot.required => {
                missing.push(slot_ref);
                continue;
            }
            None => match template.default_for(slot) {
                Some(default) => (default.clone(), BindingSource::Default),
                // Unreachable for validated templates.
                None => {
                    missing.push(slot_ref);
                    continue;
                }
            },
        };

        set_input(&mut graph, slot, value.clone());
        bindings.push(SlotBinding {
            slot: slot_ref,
            value,
            source,
        });
    }

    if !missing.is_empty() {
        return Err(ConstructionError::MissingRequired { slots: missing });
    }
    if let Some(err) = mismatch {
        return Err(err);
    }

    Ok(ResolvedJob {
        user_id: features.user_id().to_string(),
        key: features.key().to_string(),
        graph: serde_json::Value::Object(graph),
        bindings,
        warnings,
        uploads,
    })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

struct Bound {
    value: serde_json::Value,
    warning: Option<ResolveWarning>,
    upload: Option<PathBuf>,
}

impl Bound {
    fn plain(value: serde_json::Value) -> Self {
        Self {
            value,
            warning: None,
            upload: None,
        }
    }
}

fn bind_feature(
    slot: &SlotSpec,
    slot_ref: &SlotRef,
    feature: &FeatureValue,
) -> Result<Bound, ConstructionError> {
    let mismatch = |found: &str| ConstructionError::TypeMismatch {
        slot: slot_ref.clone(),
        key: slot.key.clone(),
        expected: slot.kind,
        found: found.to_string(),
    };

    match (slot.kind, feature) {
        (SlotKind::Text, FeatureValue::Text(text)) => Ok(Bound::plain(text.clone().into())),

        (SlotKind::Integer, FeatureValue::Integer(n)) => Ok(clamp_integer(slot, slot_ref, *n)),
        (SlotKind::Integer, FeatureValue::Float(f)) if f.is_finite() && f.fract() == 0.0 => {
            Ok(clamp_integer(slot, slot_ref, *f as i64))
        }
        (SlotKind::Integer, FeatureValue::Float(f)) => Err(mismatch(&format!("non-integral {f}"))),

        (SlotKind::Float, FeatureValue::Float(f)) if f.is_finite() => {
            Ok(clamp_float(slot, slot_ref, *f))
        }
        (SlotKind::Float, FeatureValue::Integer(n)) => Ok(clamp_float(slot, slot_ref, *n as f64)),
        (SlotKind::Float, FeatureValue::Float(f)) => Err(mismatch(&format!("non-finite {f}"))),

        (SlotKind::Image, FeatureValue::Path(path)) => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| mismatch(&format!("path without file name {}", path.display())))?;
            Ok(Bound {
                value: name.into(),
                warning: None,
                upload: Some(path.clone()),
            })
        }
        // A bare name refers to an image already present on the backend.
        (SlotKind::Image, FeatureValue::Text(name)) => Ok(Bound::plain(name.clone().into())),

        (_, other) => Err(mismatch(describe(other))),
    }
}

fn clamp_integer(slot: &SlotSpec, slot_ref: &SlotRef, requested: i64) -> Bound {
    let mut applied = requested;
    if let Some(min) = slot.min {
        applied = applied.max(min.ceil() as i64);
    }
    if let Some(max) = slot.max {
        applied = applied.min(max.floor() as i64);
    }

    Bound {
        value: applied.into(),
        warning: (applied != requested).then(|| ResolveWarning {
            slot: slot_ref.clone(),
            requested: requested as f64,
            applied: applied as f64,
        }),
        upload: None,
    }
}

fn clamp_float(slot: &SlotSpec, slot_ref: &SlotRef, requested: f64) -> Bound {
    let mut applied = requested;
    if let Some(min) = slot.min {
        applied = applied.max(min);
    }
    if let Some(max) = slot.max {
        applied = applied.min(max);
    }

    Bound {
        value: applied.into(),
        warning: (applied != requested).then(|| ResolveWarning {
            slot: slot_ref.clone(),
            requested,
            applied,
        }),
        upload: None,
    }
}

fn set_input(
    graph: &mut serde_json::Map<String, serde_json::Value>,
    slot: &SlotSpec,
    value: serde_json::Value,
) {
    let Some(node) = graph.get_mut(&slot.node).and_then(|n| n.as_object_mut()) else {
        return;
    };
    let inputs = node
        .entry("inputs")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let Some(inputs) = inputs.as_object_mut() {
        inputs.insert(slot.field.clone(), value);
    }
}

fn describe(value: &FeatureValue) -> &'static str {
    match value {
        FeatureValue::Text(_) => "text",
        FeatureValue::Integer(_) => "an integer",
        FeatureValue::Float(_) => "a float",
        FeatureValue::Path(_) => "a file path",
    }
}

fn join_slots(slots: &[SlotRef]) -> String {
    slots
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
