//! Output sink handed to dispatchers.
//!
//! Every event is stamped here, in one place: timestamp from the injected
//! clock (clamped so it never goes backwards), a fresh output id, and the
//! cell id of the submission. Stamping and enqueueing happen under the same
//! lock, so channel order, timestamp order, and emission order agree even if
//! a dispatcher clones the sink across tasks.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use titan_types::{OutputId, OutputMessage, OutputType, mime_bundle, stream_content};

use crate::sources::Sources;

/// An event before stamping.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDraft {
    pub output_type: OutputType,
    pub content: Value,
    pub metadata: Option<Map<String, Value>>,
    pub parent_id: Option<OutputId>,
}

impl OutputDraft {
    pub fn new(output_type: OutputType, content: Value) -> Self {
        Self {
            output_type,
            content,
            metadata: None,
            parent_id: None,
        }
    }

    /// Correlate with an event emitted earlier by the same execution.
    pub fn with_parent(mut self, parent: OutputId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

struct Stamper {
    sources: Sources,
    cell_id: Option<String>,
    last_timestamp: Mutex<u64>,
}

/// Cloneable handle for emitting output events from a dispatch.
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OutputMessage>,
    stamper: Arc<Stamper>,
}

/// Engine side of the sink.
pub(crate) type OutputReceiver = mpsc::UnboundedReceiver<OutputMessage>;

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("cell_id", &self.stamper.cell_id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl OutputSink {
    pub(crate) fn channel(
        sources: Sources,
        cell_id: Option<String>,
        started_at: u64,
    ) -> (Self, OutputReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stamper = Stamper {
            sources,
            cell_id,
            last_timestamp: Mutex::new(started_at),
        };
        (
            Self {
                tx,
                stamper: Arc::new(stamper),
            },
            rx,
        )
    }

    /// Stamp and enqueue an event, returning its id.
    ///
    /// After the execution has finished the event is dropped; the id is still
    /// returned so callers need not special-case a late emit.
    pub fn emit(&self, draft: OutputDraft) -> OutputId {
        let stamper = &self.stamper;
        let output_id = stamper.sources.output_id();

        let mut last = stamper.last_timestamp.lock();
        let timestamp = (*last).max(stamper.sources.now());
        *last = timestamp;

        let message = OutputMessage {
            output_type: draft.output_type,
            content: draft.content,
            metadata: draft.metadata,
            timestamp,
            cell_id: stamper.cell_id.clone(),
            output_id: Some(output_id),
            parent_id: draft.parent_id,
        };
        if self.tx.send(message).is_err() {
            tracing::trace!(%output_id, "output emitted after execution finished, dropped");
        }
        output_id
    }

    /// `stream` event on stdout.
    pub fn stdout(&self, text: &str) -> OutputId {
        self.emit(OutputDraft::new(OutputType::Stream, stream_content("stdout", text)))
    }

    /// `stream` event on stderr.
    pub fn stderr(&self, text: &str) -> OutputId {
        self.emit(OutputDraft::new(OutputType::Stream, stream_content("stderr", text)))
    }

    /// `execute_result` with a `text/plain` bundle.
    pub fn execute_result(&self, text: &str) -> OutputId {
        self.emit(OutputDraft::new(
            OutputType::ExecuteResult,
            mime_bundle("text/plain", text),
        ))
    }

    /// `display_data` with a single-entry bundle.
    pub fn display(&self, mime: &str, data: impl Into<Value>) -> OutputId {
        self.emit(OutputDraft::new(OutputType::DisplayData, mime_bundle(mime, data)))
    }

    /// True once the engine has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
