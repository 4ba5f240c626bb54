//! Templates and clones
//!
//! A template VM is saved with [`UtilityVm::save_as_template`] and described by
//! a [`TemplateConfig`]. Creating a clone replays each recorded resource into
//! the new VM's document and bookkeeping, in recorded order.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{NamespaceInfo, UtilityVm};
use crate::container::NetworkEndpoints;
use crate::hcn::CLONING_DEFAULT_NETWORK_NAMESPACE_ID;
use crate::hcs::schema::{ComputeSystemDoc, RestoreState, SaveOptions};
use crate::{Error, Result};

/// Target of a replay
pub struct CloneData<'a> {
    pub doc: &'a mut ComputeSystemDoc,
    pub scratch_folder: &'a Path,
    pub uvm_id: &'a str,
}

/// A resource of a template VM that can be recreated on a clone
#[async_trait]
pub trait Cloneable: Send + Sync + fmt::Debug {
    /// Short description used in errors
    fn describe(&self) -> String;

    /// Describe the resource in `data.doc` and register it on `vm`.
    async fn replay(&self, vm: &mut UtilityVm, data: &mut CloneData<'_>) -> Result<()>;
}

/// Everything needed to create clones of a saved template
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    pub uvm_id: String,
    pub resources: Vec<Arc<dyn Cloneable>>,
}

impl TemplateConfig {
    pub fn new(uvm_id: impl Into<String>, resources: Vec<Arc<dyn Cloneable>>) -> Self {
        Self {
            uvm_id: uvm_id.into(),
            resources,
        }
    }
}

/// Replay `template` into a VM under construction.
///
/// The first resource that fails aborts the clone. On success the default
/// clone namespace is registered and the VM is marked as a clone.
pub async fn clone_from_template(
    vm: &mut UtilityVm,
    doc: &mut ComputeSystemDoc,
    template: &TemplateConfig,
    scratch_folder: &Path,
) -> Result<()> {
    doc.virtual_machine_mut().restore_state = Some(RestoreState {
        template_system_id: template.uvm_id.clone(),
    });

    let uvm_id = vm.id().to_string();
    let mut data = CloneData {
        doc,
        scratch_folder,
        uvm_id: &uvm_id,
    };
    for resource in &template.resources {
        resource
            .replay(vm, &mut data)
            .await
            .map_err(|e| Error::CloneReplay {
                resource: resource.describe(),
                source: Box::new(e),
            })?;
        tracing::debug!(uvm_id = %uvm_id, resource = %resource.describe(), "Replayed template resource");
    }

    vm.namespaces_mut()
        .insert(CLONING_DEFAULT_NETWORK_NAMESPACE_ID.to_string(), NamespaceInfo::default());
    vm.is_clone = true;

    tracing::info!(
        uvm_id = %uvm_id,
        template_id = %template.uvm_id,
        resources = template.resources.len(),
        "Cloned template"
    );
    Ok(())
}

impl UtilityVm {
    /// Pause the VM and save it so it can be cloned.
    pub async fn save_as_template(&self) -> Result<()> {
        let system = self.compute_system()?;
        system.pause().await?;
        system.save(&serde_json::to_value(SaveOptions::as_template())?).await?;
        tracing::info!(uvm_id = %self.id, "Saved utility VM as template");
        Ok(())
    }

    /// Snapshot the resources attached to this template VM.
    ///
    /// SCSI mounts come first in slot order, then directory shares, file
    /// shares, assigned devices and network namespaces.
    pub async fn generate_template_config(&self) -> Result<TemplateConfig> {
        if !self.is_template {
            return Err(Error::InvalidOptions(format!(
                "utility VM {} was not created as a template",
                self.id
            )));
        }

        let mut resources: Vec<Arc<dyn Cloneable>> = Vec::new();
        for mount in self.scsi.lock().await.mounts() {
            resources.push(Arc::new(mount.clone()));
        }
        for share in self.vsmb.lock().await.shares() {
            resources.push(Arc::new(share.clone()));
        }
        for device in self.vpci.lock().await.values() {
            resources.push(Arc::new(device.clone()));
        }
        for (namespace_id, info) in self.namespaces.lock().await.iter() {
            resources.push(Arc::new(NetworkEndpoints::new(
                namespace_id.clone(),
                info.nics.keys().cloned().collect(),
            )));
        }

        Ok(TemplateConfig::new(self.id.clone(), resources))
    }
}
