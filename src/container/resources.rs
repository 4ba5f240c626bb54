//! Resources recorded while creating a container, released on teardown

use std::path::PathBuf;

use async_trait::async_trait;

use crate::hcn::NetworkControlPlane;
use crate::uvm::{CloneData, Cloneable, NamespaceInfo, UtilityVm};
use crate::Result;

/// A namespace created for a container and the endpoints bound into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEndpoints {
    pub namespace_id: String,
    pub endpoint_ids: Vec<String>,
}

impl NetworkEndpoints {
    pub fn new(namespace_id: impl Into<String>, endpoint_ids: Vec<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            endpoint_ids,
        }
    }

    /// Unbind every endpoint, then delete the namespace. Anything already
    /// gone is ignored.
    pub async fn release(&self, net: &dyn NetworkControlPlane) -> Result<()> {
        for endpoint_id in &self.endpoint_ids {
            if let Err(e) = net.remove_namespace_endpoint(&self.namespace_id, endpoint_id).await {
                if !e.is_not_found() {
                    return Err(e);
                }
                tracing::debug!(netns_id = %self.namespace_id, endpoint_id = %endpoint_id, "Endpoint already removed");
            }
        }

        if let Err(e) = net.remove_namespace(&self.namespace_id).await {
            if !e.is_not_found() {
                return Err(e);
            }
        }
        tracing::info!(netns_id = %self.namespace_id, "Released network namespace");
        Ok(())
    }
}

#[async_trait]
impl Cloneable for NetworkEndpoints {
    fn describe(&self) -> String {
        format!("network namespace {}", self.namespace_id)
    }

    /// The guest side of the namespace comes back with the saved state, so
    /// only the bookkeeping entry is recreated.
    async fn replay(&self, vm: &mut UtilityVm, _data: &mut CloneData<'_>) -> Result<()> {
        vm.namespaces_mut()
            .entry(self.namespace_id.clone())
            .or_insert_with(NamespaceInfo::default);
        Ok(())
    }
}

/// Something a container holds that must be given back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerResource {
    NetworkEndpoints(NetworkEndpoints),
    ScsiMount(PathBuf),
    VsmbShare(PathBuf),
}

/// Resources acquired for one container, released in reverse order
#[derive(Debug, Default)]
pub struct Resources {
    pub container_id: String,
    /// Namespace the container runs in
    pub net_ns: Option<String>,
    /// `net_ns` was created for this container and must be deleted with it
    pub created_net_ns: bool,
    /// `net_ns` was attached into the hosting VM
    pub added_net_ns_to_vm: bool,
    resources: Vec<ContainerResource>,
}

impl Resources {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            ..Default::default()
        }
    }

    pub fn add(&mut self, resource: ContainerResource) {
        self.resources.push(resource);
    }

    pub fn resources(&self) -> &[ContainerResource] {
        &self.resources
    }

    /// Release everything this container holds.
    ///
    /// The namespace is detached from `vm` first, then resources go in
    /// reverse order of acquisition. A namespace is deleted only when
    /// `created_net_ns` is set. A resource is forgotten only once
    /// released, so a failed release can be retried.
    pub async fn release(&mut self, net: &dyn NetworkControlPlane, vm: Option<&UtilityVm>) -> Result<()> {
        if let (Some(vm), Some(net_ns)) = (vm, self.net_ns.as_deref()) {
            if self.added_net_ns_to_vm {
                vm.remove_net_ns(net_ns).await?;
                self.added_net_ns_to_vm = false;
            }
        }

        while let Some(resource) = self.resources.last() {
            match resource {
                ContainerResource::NetworkEndpoints(endpoints) => {
                    if self.created_net_ns {
                        endpoints.release(net).await?;
                        self.created_net_ns = false;
                    } else {
                        tracing::debug!(
                            container_id = %self.container_id,
                            netns_id = %endpoints.namespace_id,
                            "Namespace not owned by container, leaving it in place"
                        );
                    }
                }
                ContainerResource::ScsiMount(path) => {
                    if let Some(vm) = vm {
                        vm.remove_scsi(path).await?;
                    }
                }
                ContainerResource::VsmbShare(path) => {
                    if let Some(vm) = vm {
                        vm.remove_vsmb(path).await?;
                    }
                }
            }
            self.resources.pop();
        }

        tracing::debug!(container_id = %self.container_id, "Released container resources");
        Ok(())
    }
}
