//! The `CloudProvider` collaborator boundary.
//!
//! Everything in this module is the *interface* the core calls into to
//! provision and tear down sandbox VMs. The actual cloud integration (Azure,
//! AWS, a local hypervisor, ...) is an external collaborator and out of
//! scope for this crate — we only define the contract, plus an in-memory
//! fake used by the orchestrator's own test suite and as a local dev
//! stand-in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Opaque, caller-supplied configuration for a sandbox VM. The core never
/// interprets these fields; it only stores and returns them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfiguration {
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: std::collections::HashMap<String, String>,
}

/// Result of provisioning one sandbox VM.
pub struct ProvisionedSandbox {
    pub vm_handle: String,
    pub public_ip: Option<String>,
}

/// The interface the orchestrator core calls into to manage sandbox VMs.
///
/// Implementors own all cloud-specific concerns: authentication, image
/// selection, retries. The core only needs `create_sandbox`,
/// `build_default_image`, and `delete_sandbox`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provisions a VM for `sandbox_id`, baking `orchestrator_endpoint` into
    /// its boot metadata so the agent that boots inside it knows where to
    /// phone home.
    async fn create_sandbox(
        &self,
        sandbox_id: &str,
        configuration: &SandboxConfiguration,
        orchestrator_endpoint: &str,
    ) -> anyhow::Result<ProvisionedSandbox>;

    /// Builds (or fetches) the default base image, called at most once per
    /// orchestrator process and memoized by the caller.
    async fn build_default_image(&self, orchestrator_endpoint: &str) -> anyhow::Result<String>;

    /// Tears down a previously provisioned VM.
    async fn delete_sandbox(&self, vm_handle: &str) -> anyhow::Result<()>;
}

/// An in-memory `CloudProvider` used for tests and local development. It
/// never touches real infrastructure: "creating" a VM just mints a handle.
pub struct FakeCloudProvider {
    next_handle: AtomicU64,
    deleted: Mutex<Vec<String>>,
}

impl FakeCloudProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            deleted: Mutex::new(Vec::new()),
        })
    }

    pub async fn deleted_handles(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn create_sandbox(
        &self,
        sandbox_id: &str,
        _configuration: &SandboxConfiguration,
        _orchestrator_endpoint: &str,
    ) -> anyhow::Result<ProvisionedSandbox> {
        let n = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(ProvisionedSandbox {
            vm_handle: format!("fake-vm-{n}-{sandbox_id}"),
            public_ip: Some(format!("10.0.{n}.1")),
        })
    }

    async fn build_default_image(&self, _orchestrator_endpoint: &str) -> anyhow::Result<String> {
        Ok("fake-default-image".to_string())
    }

    async fn delete_sandbox(&self, vm_handle: &str) -> anyhow::Result<()> {
        self.deleted.lock().await.push(vm_handle.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_provider_create_then_delete() {
        let provider = FakeCloudProvider::new();
        let provisioned = provider
            .create_sandbox("s1", &SandboxConfiguration::default(), "http://127.0.0.1:50051")
            .await
            .unwrap();
        assert!(provisioned.vm_handle.contains('s'));

        provider.delete_sandbox(&provisioned.vm_handle).await.unwrap();
        assert_eq!(provider.deleted_handles().await, vec![provisioned.vm_handle]);
    }

    #[tokio::test]
    async fn build_default_image_is_memoizable_by_caller() {
        let provider = FakeCloudProvider::new();
        let a = provider.build_default_image("http://x").await.unwrap();
        let b = provider.build_default_image("http://x").await.unwrap();
        assert_eq!(a, b);
    }
}
