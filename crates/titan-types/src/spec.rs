//! Kernel spec types.
//!
//! A `KernelSpec` names an executable environment: what language it speaks,
//! how it is launched, what resources it needs, and which rich output types
//! it may emit. Specs are immutable once registered; sessions carry a copy.

use serde::{Deserialize, Serialize};

/// The family of compute environment a spec launches.
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
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EnvironmentType {
    Python3,
    R,
    Julia,
    #[serde(rename = "nodejs")]
    #[strum(serialize = "nodejs")]
    NodeJs,
    Go,
    Java,
    Sql,
    Bash,
    #[serde(rename = "aimodel")]
    #[strum(serialize = "aimodel")]
    AiModel,
    Custom,
    Quantum,
    #[serde(rename = "gpucompute")]
    #[strum(serialize = "gpucompute")]
    GpuCompute,
    #[serde(rename = "tpucompute")]
    #[strum(serialize = "tpucompute")]
    TpuCompute,
    Wasm,
}

/// Declared resource envelope for a spec.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    /// CPU cores requested.
    pub cpu_cores: f64,
    /// Memory requested, in GB.
    pub memory_gb: f64,
    /// GPUs requested, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    /// TPUs requested, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpu_count: Option<u32>,
}

impl ResourceEnvelope {
    /// Envelope with only CPU and memory.
    pub fn new(cpu_cores: f64, memory_gb: f64) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            gpu_count: None,
            tpu_count: None,
        }
    }

    /// Request GPUs.
    pub fn with_gpus(mut self, count: u32) -> Self {
        self.gpu_count = Some(count);
        self
    }

    /// Request TPUs.
    pub fn with_tpus(mut self, count: u32) -> Self {
        self.tpu_count = Some(count);
        self
    }

    /// Whether every quantity is finite and non-negative.
    pub fn is_valid(&self) -> bool {
        self.cpu_cores.is_finite()
            && self.cpu_cores >= 0.0
            && self.memory_gb.is_finite()
            && self.memory_gb >= 0.0
    }
}

/// Immutable descriptor of an executable environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Registry key; unique.
    pub name: String,
    /// Human-facing name ("Python 3 (Global)").
    pub display_name: String,
    /// Language tag ("python", "sql").
    pub language: String,
    pub environment_type: EnvironmentType,
    /// Launch arguments for the host process.
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub resources: ResourceEnvelope,
    #[serde(default)]
    pub supports_debugging: bool,
    #[serde(default)]
    pub supports_interrupt: bool,
    /// MIME types this environment may emit in rich outputs.
    #[serde(default)]
    pub rich_output_mime_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl KernelSpec {
    /// Create a spec with no resources, capabilities, or mime types declared.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        language: impl Into<String>,
        environment_type: EnvironmentType,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            language: language.into(),
            environment_type,
            argv: Vec::new(),
            resources: ResourceEnvelope::default(),
            supports_debugging: false,
            supports_interrupt: false,
            rich_output_mime_types: Vec::new(),
            description: None,
            tags: Vec::new(),
            version: None,
        }
    }

    pub fn with_argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources(mut self, resources: ResourceEnvelope) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_debugging(mut self, supported: bool) -> Self {
        self.supports_debugging = supported;
        self
    }

    pub fn with_interrupt(mut self, supported: bool) -> Self {
        self.supports_interrupt = supported;
        self
    }

    pub fn with_mime_types<I, S>(mut self, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rich_output_mime_types = mime_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whether this environment may emit the given MIME type.
    pub fn allows_mime(&self, mime: &str) -> bool {
        self.rich_output_mime_types.iter().any(|m| m == mime)
    }

    /// The stock Python 3 environment.
    pub fn python3() -> Self {
        Self::new("python3", "Python 3 (Global)", "python", EnvironmentType::Python3)
            .with_argv(["python", "-m", "ipykernel_launcher"])
            .with_resources(ResourceEnvelope::new(2.0, 4.0))
            .with_debugging(true)
            .with_interrupt(true)
            .with_mime_types(["text/plain", "text/html", "image/png"])
            .with_description("Standard Python 3 kernel for data science.")
            .with_tags(["python", "ml"])
            .with_version("3.9.7")
    }

    /// The stock SQL environment.
    pub fn sql() -> Self {
        Self::new("sql", "PostgreSQL (Main)", "sql", EnvironmentType::Sql)
            .with_resources(ResourceEnvelope::new(1.0, 2.0))
            .with_interrupt(true)
            .with_mime_types(["text/plain", "text/html", "application/json"])
            .with_description("SQL kernel for local and remote DB queries.")
            .with_tags(["sql", "database"])
            .with_version("13.0")
    }
}
