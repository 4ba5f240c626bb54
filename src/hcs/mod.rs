//! Host Compute Service abstractions
//!
//! The creation pipeline talks to HCS only through [`HostComputeService`] and
//! [`ComputeSystem`]. On Windows these are backed by the `HcsXxx` APIs; tests
//! use in-memory fakes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::Result;

pub mod schema;

#[cfg(windows)]
pub mod compute;
#[cfg(windows)]
pub mod operation;
#[cfg(windows)]
pub mod service;

#[cfg(windows)]
pub use compute::HcsSystem;
#[cfg(windows)]
pub use service::HcsService;

use schema::ModifySettingRequest;

/// Host processor topology as reported by HCS service properties
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessorTopology {
    pub logical_processor_count: u32,
}

/// The host virtualization service
#[async_trait]
pub trait HostComputeService: Send + Sync {
    /// Submit `document` and return a handle to the created compute system.
    async fn create_compute_system(&self, id: &str, document: &str) -> Result<Arc<dyn ComputeSystem>>;

    /// Query the host processor topology.
    async fn processor_topology(&self) -> Result<ProcessorTopology>;

    /// Grant the VM identified by `vm_id` access to a file on the host.
    async fn grant_vm_access(&self, vm_id: &str, path: &Path) -> Result<()>;
}

/// A created compute system
#[async_trait]
pub trait ComputeSystem: Send + Sync {
    fn id(&self) -> &str;

    /// Runtime VM id, used to address hypervisor sockets.
    fn runtime_id(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn save(&self, options: &serde_json::Value) -> Result<()>;

    async fn terminate(&self) -> Result<()>;

    async fn modify(&self, request: &ModifySettingRequest) -> Result<()>;

    /// Close the handle. Must be idempotent.
    fn close(&self);
}
