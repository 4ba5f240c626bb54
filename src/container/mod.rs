//! Container-side provisioning on top of a utility VM
//!
//! Network namespaces are created when a container is created and attached
//! into the hosting VM when it starts. Clones receive their mounts after
//! creation through the running container's modify call.

use async_trait::async_trait;

use crate::hcs::schema::ModifySettingRequest;
use crate::Result;

pub mod clone;
pub mod network;
pub mod resources;

pub use clone::{add_mounts_to_clone, MountsConfig};
pub use network::{create_network_namespace, get_namespace_endpoints, setup_network_namespace, NetworkSpec};
pub use resources::{ContainerResource, NetworkEndpoints, Resources};

/// A running container that accepts modify requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerModifier: Send + Sync {
    async fn modify(&self, request: &ModifySettingRequest) -> Result<()>;
}
