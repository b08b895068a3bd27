//! Typed views of the ComfyUI `/history` and `/queue` payloads.
//!
//! `/history/{prompt_id}` returns `{"<prompt_id>": {...}}` once a prompt
//! has finished executing (successfully or not) and `{}` before that.
//! `/queue` lists running and pending prompts as positional arrays
//! `[number, prompt_id, prompt, extra_data, outputs_to_execute]`.

use std::collections::BTreeMap;

use serde::Deserialize;

use cardsmith_core::job::ResultReference;

/// Storage area ComfyUI uses for final (non-preview) images.
pub const OUTPUT_IMAGE_TYPE: &str = "output";

const EXECUTION_ERROR_MESSAGE: &str = "execution_error";
const STATUS_ERROR: &str = "error";

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One prompt's entry in the execution history.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, payload]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

/// Payload of an `execution_error` history message.
#[derive(Debug, Clone, Deserialize)]
struct ExecutionError {
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    node_type: Option<String>,
    #[serde(default)]
    exception_type: Option<String>,
    #[serde(default)]
    exception_message: Option<String>,
}

fn default_image_type() -> String {
    OUTPUT_IMAGE_TYPE.to_string()
}

impl HistoryEntry {
    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .is_some_and(|s| s == STATUS_ERROR)
    }

    pub fn is_completed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.completed) && !self.is_error()
    }

    /// Human-readable execution error, taken from the `execution_error` message.
    pub fn error_message(&self) -> String {
        let detail = self
            .status
            .as_ref()
            .into_iter()
            .flat_map(|s| s.messages.iter())
            .find(|(name, _)| name == EXECUTION_ERROR_MESSAGE)
            .and_then(|(_, payload)| serde_json::from_value::<ExecutionError>(payload.clone()).ok());

        let Some(err) = detail else {
            return "execution failed without error detail".to_string();
        };

        let mut message = match (err.exception_type, err.exception_message) {
            (Some(kind), Some(msg)) => format!("{kind}: {}", msg.trim()),
            (None, Some(msg)) => msg.trim().to_string(),
            (Some(kind), None) => kind,
            (None, None) => "execution failed".to_string(),
        };
        if let Some(node) = err.node_id {
            match err.node_type {
                Some(node_type) => message.push_str(&format!(" (node {node} {node_type})")),
                None => message.push_str(&format!(" (node {node})")),
            }
        }
        message
    }

    /// First final image in node order (numeric ids sort numerically).
    pub fn first_output_image(&self) -> Option<ResultReference> {
        let mut nodes: Vec<_> = self.outputs.iter().collect();
        nodes.sort_by(|(a, _), (b, _)| {
            let order = |id: &str| id.parse::<u64>().unwrap_or(u64::MAX);
            order(a).cmp(&order(b)).then_with(|| a.cmp(b))
        });

        nodes.into_iter().find_map(|(node_id, output)| {
            output
                .images
                .iter()
                .find(|img| img.kind == OUTPUT_IMAGE_TYPE)
                .map(|img| ResultReference {
                    node_id: node_id.clone(),
                    filename: img.filename.clone(),
                    subfolder: img.subfolder.clone(),
                    kind: img.kind.clone(),
                })
        })
    }
}

/// Extract one prompt's entry from a `/history/{id}` response.
///
/// Returns `Ok(None)` when the prompt has no history yet.
pub fn parse_history_entry(
    prompt_id: &str,
    body: &serde_json::Value,
) -> Result<Option<HistoryEntry>, serde_json::Error> {
    match body.get(prompt_id) {
        Some(entry) => serde_json::from_value(entry.clone()).map(Some),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub queue_pending: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Running,
    Pending,
    Absent,
}

impl QueueSnapshot {
    pub fn position(&self, prompt_id: &str) -> QueuePosition {
        let contains = |items: &[Vec<serde_json::Value>]| {
            items
                .iter()
                .any(|item| item.get(1).and_then(|v| v.as_str()) == Some(prompt_id))
        };

        if contains(&self.queue_running) {
            QueuePosition::Running
        } else if contains(&self.queue_pending) {
            QueuePosition::Pending
        } else {
            QueuePosition::Absent
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(value: serde_json::Value) -> HistoryEntry {
        serde_json::from_value(value).unwrap()
    }

    // -- history --

    #[test]
    fn missing_prompt_has_no_entry() {
        assert!(parse_history_entry("abc", &json!({})).unwrap().is_none());
    }

    #[test]
    fn completed_entry_yields_first_output_image() {
        let body = json!({
            "abc": {
                "outputs": {
                    "12": { "images": [{ "filename": "late.png", "subfolder": "", "type": "output" }] },
                    "9": { "images": [
                        { "filename": "preview.png", "subfolder": "", "type": "temp" },
                        { "filename": "monster_1_00001_.png", "subfolder": "cards", "type": "output" }
                    ] }
                },
                "status": { "status_str": "success", "completed": true, "messages": [] }
            }
        });
        let entry = parse_history_entry("abc", &body).unwrap().unwrap();
        assert!(entry.is_completed());
        assert!(!entry.is_error());
        assert_eq!(
            entry.first_output_image(),
            Some(ResultReference {
                node_id: "9".into(),
                filename: "monster_1_00001_.png".into(),
                subfolder: "cards".into(),
                kind: "output".into(),
            })
        );
    }

    #[test]
    fn preview_only_outputs_have_no_result() {
        let e = entry(json!({
            "outputs": { "9": { "images": [{ "filename": "p.png", "type": "temp" }] } },
            "status": { "status_str": "success", "completed": true }
        }));
        assert!(e.first_output_image().is_none());
    }

    #[test]
    fn error_entry_reports_execution_error() {
        let e = entry(json!({
            "outputs": {},
            "status": {
                "status_str": "error",
                "completed": false,
                "messages": [
                    ["execution_start", { "prompt_id": "abc" }],
                    ["execution_error", {
                        "prompt_id": "abc",
                        "node_id": "3",
                        "node_type": "KSampler",
                        "exception_type": "torch.cuda.OutOfMemoryError",
                        "exception_message": "CUDA out of memory\n"
                    }]
                ]
            }
        }));
        assert!(e.is_error());
        assert!(!e.is_completed());
        assert_eq!(
            e.error_message(),
            "torch.cuda.OutOfMemoryError: CUDA out of memory (node 3 KSampler)"
        );
    }

    #[test]
    fn error_without_detail_has_fallback_message() {
        let e = entry(json!({ "status": { "status_str": "error", "completed": false } }));
        assert_eq!(e.error_message(), "execution failed without error detail");
    }

    #[test]
    fn malformed_entry_is_an_error() {
        let body = json!({ "abc": { "outputs": "nope" } });
        assert!(parse_history_entry("abc", &body).is_err());
    }

    // -- queue --

    #[test]
    fn queue_position_is_found_by_prompt_id() {
        let queue: QueueSnapshot = serde_json::from_value(json!({
            "queue_running": [[4, "run-1", {}, {}, ["9"]]],
            "queue_pending": [[5, "wait-1", {}, {}, ["9"]], [6, "wait-2", {}, {}, ["9"]]]
        }))
        .unwrap();
        assert_eq!(queue.position("run-1"), QueuePosition::Running);
        assert_eq!(queue.position("wait-2"), QueuePosition::Pending);
        assert_eq!(queue.position("gone"), QueuePosition::Absent);
    }

    #[test]
    fn empty_queue_payload_parses() {
        let queue: QueueSnapshot = serde_json::from_value(json!({})).unwrap();
        assert_eq!(queue.position("x"), QueuePosition::Absent);
    }
}
