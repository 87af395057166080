//! Sandboxed execution of built function artifacts.

pub mod container;
pub mod mock;
pub mod process;
pub mod provider;
pub mod registry;
pub mod subprocess;
pub mod teardown;
pub mod wrapper;

pub use provider::{
    Artifact, CapturedLogs, OutputDocument, SandboxError, SandboxInput, SandboxOutput,
    SandboxProvider,
};
pub use registry::SandboxRegistry;
pub use teardown::Teardown;

/// How functions are isolated (`SANDBOX_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    /// Host processes ([`process::ProcessSandbox`]).
    Process,
    /// Containers ([`container::ContainerSandbox`]).
    Container,
    /// Containers when a `docker` CLI is available, processes otherwise.
    Auto,
}

impl SandboxMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "process" | "native" => Some(Self::Process),
            "container" | "docker" => Some(Self::Container),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    /// Resolve `Auto` by probing for the container CLI.
    pub async fn resolve(self) -> Self {
        match self {
            Self::Auto if container::docker_available().await => Self::Container,
            Self::Auto => Self::Process,
            other => other,
        }
    }
}
