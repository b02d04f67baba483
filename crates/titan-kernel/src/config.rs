//! Kernel host configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! yields a working host:
//!
//! ```toml
//! [host]
//! cpu_cores = 16.0
//! memory_gb = 64.0
//!
//! [execution]
//! default_timeout_ms = 300000
//! interrupt_grace_ms = 2000
//! history_limit = 100
//!
//! [telemetry]
//! retention = 50
//!
//! [flows]
//! capacity = 1024
//!
//! [simulator]
//! latency_base_ms = 800
//! latency_jitter_ms = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use titan_types::ResourceEnvelope;

use crate::error::{KernelError, KernelResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub host: HostCapacity,
    pub execution: ExecutionConfig,
    pub telemetry: TelemetryConfig,
    pub flows: FlowConfig,
    pub simulator: SimulatorConfig,
}

impl KernelConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> KernelResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| KernelError::Config(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> KernelResult<()> {
        if self.telemetry.retention == 0 {
            return Err(KernelError::Config("telemetry.retention must be > 0".into()));
        }
        if self.flows.capacity == 0 {
            return Err(KernelError::Config("flows.capacity must be > 0".into()));
        }
        if self.execution.default_timeout_ms == Some(0) {
            return Err(KernelError::Config(
                "execution.default_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Host capacity. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCapacity {
    pub cpu_cores: Option<f64>,
    pub memory_gb: Option<f64>,
    pub gpu_count: Option<u32>,
    pub tpu_count: Option<u32>,
}

impl HostCapacity {
    /// First dimension in which `reserved + request` exceeds capacity.
    pub fn shortfall(
        &self,
        reserved: &ResourceEnvelope,
        request: &ResourceEnvelope,
    ) -> Option<String> {
        if let Some(limit) = self.cpu_cores
            && reserved.cpu_cores + request.cpu_cores > limit
        {
            return Some(format!(
                "cpu: {} reserved + {} requested > {limit} cores",
                reserved.cpu_cores, request.cpu_cores
            ));
        }
        if let Some(limit) = self.memory_gb
            && reserved.memory_gb + request.memory_gb > limit
        {
            return Some(format!(
                "memory: {} reserved + {} requested > {limit} GB",
                reserved.memory_gb, request.memory_gb
            ));
        }
        let gpus = reserved.gpu_count.unwrap_or(0) + request.gpu_count.unwrap_or(0);
        if let Some(limit) = self.gpu_count
            && gpus > limit
        {
            return Some(format!("gpu: {gpus} needed > {limit} available"));
        }
        let tpus = reserved.tpu_count.unwrap_or(0) + request.tpu_count.unwrap_or(0);
        if let Some(limit) = self.tpu_count
            && tpus > limit
        {
            return Some(format!("tpu: {tpus} needed > {limit} available"));
        }
        None
    }
}

/// Execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Applied when a request carries no timeout. `None` (programmatic
    /// only) disables it.
    pub default_timeout_ms: Option<u64>,
    /// How long a cancelled dispatch may take to wind down before the
    /// session is marked `error`.
    pub interrupt_grace_ms: u64,
    /// Results kept per session.
    pub history_limit: usize,
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Some(300_000),
            interrupt_grace_ms: 2_000,
            history_limit: 100,
        }
    }
}

/// Telemetry sink retention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub retention: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { retention: 50 }
    }
}

/// Flow bus sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Latency of the simulated compute host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub latency_base_ms: u64,
    pub latency_jitter_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency_base_ms: 800,
            latency_jitter_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.telemetry.retention, 50);
        assert_eq!(config.execution.default_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_partial_sections() {
        let config = KernelConfig::from_toml_str(
            r#"
            [host]
            cpu_cores = 4.0

            [execution]
            interrupt_grace_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.host.cpu_cores, Some(4.0));
        assert_eq!(config.host.memory_gb, None);
        assert_eq!(config.execution.interrupt_grace(), Duration::from_millis(50));
        assert_eq!(config.execution.history_limit, 100);
    }

    #[test]
    fn test_rejects_zero_retention() {
        let err = KernelConfig::from_toml_str("[telemetry]\nretention = 0").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = KernelConfig::from_toml_str("[host\ncpu_cores = ").unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[simulator]\nlatency_base_ms = 0\nlatency_jitter_ms = 0").unwrap();
        let config = KernelConfig::load(file.path()).unwrap();
        assert_eq!(config.simulator.latency_base_ms, 0);
    }

    #[test]
    fn test_load_missing_file() {
        let err = KernelConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn test_capacity_shortfall() {
        let cap = HostCapacity {
            cpu_cores: Some(4.0),
            gpu_count: Some(1),
            ..Default::default()
        };
        let reserved = ResourceEnvelope::new(3.0, 8.0);
        assert!(cap.shortfall(&reserved, &ResourceEnvelope::new(1.0, 100.0)).is_none());
        let msg = cap.shortfall(&reserved, &ResourceEnvelope::new(2.0, 1.0)).unwrap();
        assert!(msg.starts_with("cpu"));
        let msg = cap
            .shortfall(&ResourceEnvelope::default(), &ResourceEnvelope::new(0.0, 0.0).with_gpus(2))
            .unwrap();
        assert!(msg.starts_with("gpu"));
    }
}
