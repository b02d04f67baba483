//! In-process compute host that fakes an execution.
//!
//! Behaviour per submission:
//!
//! 1. Wait `latency_base_ms + entropy * latency_jitter_ms` (cancellable).
//! 2. Emit a stdout banner.
//! 3. If the code starts with `raise <Name>`, fault with that name.
//! 4. If the code mentions `plot` in any case and the spec allows
//!    `image/png`, emit a `display_data` image correlated to the banner.
//! 5. Emit an `execute_result` of `len(code) * 42`, where the length is in
//!    UTF-16 code units.
//!
//! Metrics are derived from the same entropy source, so pinned sources give
//! byte-identical results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use titan_types::{ErrorDetails, ExecutionMetrics, OutputType, mime_bundle};

use super::{
    Completion, ComputeDispatcher, DispatchError, DispatchOutcome, DispatchRequest, OutputDraft,
    OutputSink,
};
use crate::config::SimulatorConfig;
use crate::sources::Entropy;

const BANNER: &str = "Executing Titan command...\n";
const PLOT_URL: &str = "https://picsum.photos/400/300";

/// Simulated compute host.
pub struct SimulatedDispatcher {
    config: SimulatorConfig,
    entropy: Arc<dyn Entropy>,
}

impl SimulatedDispatcher {
    pub fn new(config: SimulatorConfig, entropy: Arc<dyn Entropy>) -> Self {
        Self { config, entropy }
    }

    fn latency(&self) -> Duration {
        let jitter = (self.entropy.next_unit() * self.config.latency_jitter_ms as f64) as u64;
        Duration::from_millis(self.config.latency_base_ms + jitter)
    }

    fn metrics(&self) -> ExecutionMetrics {
        let sample = self.entropy.next_unit();
        ExecutionMetrics {
            cpu_time_ms: 100 + (sample * 100.0) as u64,
            memory_peak_mb: 200 + (sample * 80.0) as u64,
        }
    }
}

impl std::fmt::Debug for SimulatedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `raise Boom` / `raise ValueError("bad input")` → (name, message).
fn parse_raise(code: &str) -> Option<(String, Option<String>)> {
    let rest = code.trim_start().strip_prefix("raise")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim();
    let name_end = rest
        .find(|c: char| c == '(' || c.is_whitespace())
        .unwrap_or(rest.len());
    let name = &rest[..name_end];
    if name.is_empty() {
        return None;
    }
    let message = rest[name_end..]
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.split(')').next())
        .map(|m| m.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|m| !m.is_empty());
    Some((name.to_string(), message))
}

#[async_trait]
impl ComputeDispatcher for SimulatedDispatcher {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn dispatch(
        &self,
        request: DispatchRequest,
        sink: OutputSink,
    ) -> Result<DispatchOutcome, DispatchError> {
        let latency = self.latency();
        tokio::select! {
            _ = request.cancel.cancelled() => return Ok(DispatchOutcome::Aborted),
            _ = tokio::time::sleep(latency) => {}
        }

        let banner = sink.stdout(BANNER);

        if let Some((name, message)) = parse_raise(&request.code) {
            let message = message
                .unwrap_or_else(|| format!("{name} raised in {} kernel", request.spec_name));
            let details = ErrorDetails::new(name, message).with_stacktrace([
                "Traceback (most recent call last):",
                "  File \"<cell>\", line 1, in <module>",
            ]);
            return Ok(DispatchOutcome::Faulted(details));
        }

        if request.code.to_lowercase().contains("plot") && request.allows_mime("image/png") {
            sink.emit(
                OutputDraft::new(OutputType::DisplayData, mime_bundle("image/png", PLOT_URL))
                    .with_parent(banner),
            );
        }

        let value = request.code.encode_utf16().count() * 42;
        sink.execute_result(&format!("Titan Result: {value}"));

        Ok(DispatchOutcome::Completed(Completion {
            stdout: Some("Titan Engine active.\nTask completed.".to_string()),
            stderr: None,
            return_value: Some(json!(value)),
            metrics: Some(self.metrics()),
        }))
    }
}
