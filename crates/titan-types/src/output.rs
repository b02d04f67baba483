//! Output events produced by an execution.
//!
//! The content payload is shaped by `output_type` and follows the usual
//! notebook conventions:
//!
//! | type             | content                                        |
//! |------------------|------------------------------------------------|
//! | `stream`         | `{"name": "stdout"\|"stderr", "text": ...}`    |
//! | `execute_result` | MIME bundle, e.g. `{"text/plain": ...}`        |
//! | `display_data`   | MIME bundle, e.g. `{"image/png": ...}`         |
//! | `error`          | `{"ename", "evalue", "traceback": [...]}`      |
//!
//! Other types carry whatever JSON the environment sends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::ids::OutputId;

/// Kind of output event.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputType {
    Stream,
    DisplayData,
    ExecuteResult,
    Error,
    Status,
    ClearOutput,
    UpdateDisplayData,
    Log,
    Metric,
    Trace,
}

/// One event in an execution's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    #[serde(rename = "type")]
    pub output_type: OutputType,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Unix millis; non-decreasing within one execution.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<OutputId>,
    /// An event already emitted by the same execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OutputId>,
}

impl OutputMessage {
    /// A bare message with no correlation fields.
    pub fn new(output_type: OutputType, content: Value, timestamp: u64) -> Self {
        Self {
            output_type,
            content,
            metadata: None,
            timestamp,
            cell_id: None,
            output_id: None,
            parent_id: None,
        }
    }

    /// Plain text from a `stream` event, or the `text/plain` entry of a MIME
    /// bundle.
    pub fn text(&self) -> Option<&str> {
        match self.output_type {
            OutputType::Stream => self.content.get("text").and_then(Value::as_str),
            _ => self.content.get("text/plain").and_then(Value::as_str),
        }
    }
}

/// Content for a `stream` event.
pub fn stream_content(name: &str, text: &str) -> Value {
    json!({ "name": name, "text": text })
}

/// Content for an `error` event.
pub fn error_content(ename: &str, evalue: &str, traceback: &[String]) -> Value {
    json!({ "ename": ename, "evalue": evalue, "traceback": traceback })
}

/// A single-entry MIME bundle.
pub fn mime_bundle(mime: &str, data: impl Into<Value>) -> Value {
    let mut bundle = Map::new();
    bundle.insert(mime.to_string(), data.into());
    Value::Object(bundle)
}
