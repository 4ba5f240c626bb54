//! SCSI attachments on a utility VM

use std::path::Path;

use async_trait::async_trait;

use super::clone::{CloneData, Cloneable};
use super::UtilityVm;
use crate::hcs::schema::{
    resource_paths, Attachment, GuestRequest, GuestResourceType, ModifySettingRequest, RequestType,
};
use crate::{Error, Result, ResultExt};

/// A virtual disk attached at a (controller, lun) slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiMount {
    pub controller: usize,
    pub lun: usize,
    pub host_path: String,
    /// Path the disk is mounted at in the guest. Empty when not mounted.
    pub uvm_path: String,
    pub read_only: bool,
    ref_count: u32,
}

impl ScsiMount {
    pub fn new(
        controller: usize,
        lun: usize,
        host_path: impl Into<String>,
        uvm_path: impl Into<String>,
        read_only: bool,
    ) -> Self {
        Self {
            controller,
            lun,
            host_path: host_path.into(),
            uvm_path: uvm_path.into(),
            read_only,
            ref_count: 1,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn guest_request(&self, request_type: RequestType) -> Option<GuestRequest> {
        if self.uvm_path.is_empty() {
            return None;
        }
        Some(GuestRequest {
            resource_type: GuestResourceType::MappedVirtualDisk,
            request_type,
            settings: Some(serde_json::json!({
                "ContainerPath": self.uvm_path,
                "Lun": self.lun,
            })),
        })
    }
}

/// Fixed grid of SCSI slots, controller by lun
#[derive(Debug)]
pub(crate) struct ScsiSlots {
    slots: Vec<Vec<Option<ScsiMount>>>,
}

impl ScsiSlots {
    pub(crate) fn new(controllers: usize, luns: usize) -> Self {
        Self {
            slots: vec![vec![None; luns]; controllers],
        }
    }

    pub(crate) fn get(&self, controller: usize, lun: usize) -> Option<&ScsiMount> {
        self.slots.get(controller)?.get(lun)?.as_ref()
    }

    fn find_mut(&mut self, host_path: &str) -> Option<&mut ScsiMount> {
        self.slots
            .iter_mut()
            .flatten()
            .flatten()
            .find(|m| m.host_path == host_path)
    }

    fn first_free(&self) -> Option<(usize, usize)> {
        for (controller, luns) in self.slots.iter().enumerate() {
            if let Some(lun) = luns.iter().position(Option::is_none) {
                return Some((controller, lun));
            }
        }
        None
    }

    /// Place `mount` at its slot, failing if the slot is taken or out of range.
    pub(crate) fn insert(&mut self, mount: ScsiMount) -> Result<()> {
        let slot = self
            .slots
            .get_mut(mount.controller)
            .and_then(|luns| luns.get_mut(mount.lun))
            .ok_or_else(|| {
                Error::ResourceAcquisition(format!(
                    "SCSI location {}:{} does not exist",
                    mount.controller, mount.lun
                ))
            })?;
        if let Some(existing) = slot {
            return Err(Error::ResourceAcquisition(format!(
                "SCSI location {}:{} is already used by {}",
                mount.controller, mount.lun, existing.host_path
            )));
        }
        *slot = Some(mount);
        Ok(())
    }

    fn clear(&mut self, controller: usize, lun: usize) {
        if let Some(slot) = self.slots.get_mut(controller).and_then(|luns| luns.get_mut(lun)) {
            *slot = None;
        }
    }

    /// Mounts in (controller, lun) order
    pub(crate) fn mounts(&self) -> impl Iterator<Item = &ScsiMount> {
        self.slots.iter().flatten().flatten()
    }
}

impl UtilityVm {
    /// Attach a virtual disk, or take another reference if it is already attached.
    ///
    /// When `uvm_path` is non-empty the disk is also mounted in the guest.
    pub async fn add_scsi(&self, host_path: &Path, uvm_path: &str, read_only: bool) -> Result<ScsiMount> {
        let host_path_str = host_path.to_string_lossy().into_owned();
        let mut slots = self.scsi.lock().await;

        if let Some(existing) = slots.find_mut(&host_path_str) {
            existing.ref_count += 1;
            tracing::debug!(
                uvm_id = %self.id,
                path = %host_path_str,
                ref_count = existing.ref_count,
                "SCSI disk already attached"
            );
            return Ok(existing.clone());
        }

        let (controller, lun) = slots.first_free().ok_or_else(|| {
            Error::ResourceAcquisition(format!("no free SCSI locations on utility VM {}", self.id))
        })?;

        self.host
            .compute
            .grant_vm_access(&self.id, host_path)
            .await
            .with_context(|| format!("failed to grant VM access for SCSI mount {}", host_path_str))?;

        let mount = ScsiMount::new(controller, lun, host_path_str, uvm_path, read_only);
        let mut request = ModifySettingRequest::host(
            RequestType::Add,
            resource_paths::scsi_attachment(controller, lun),
            Some(serde_json::to_value(Attachment::virtual_disk(&mount.host_path, read_only))?),
        );
        if let Some(guest) = mount.guest_request(RequestType::Add) {
            request = request.with_guest_request(guest);
        }
        self.modify(&request)
            .await
            .with_context(|| format!("failed to add SCSI disk {}", mount.host_path))?;

        tracing::info!(
            uvm_id = %self.id,
            path = %mount.host_path,
            controller,
            lun,
            "Attached SCSI disk"
        );
        slots.insert(mount.clone())?;
        Ok(mount)
    }

    /// Drop a reference to an attached disk, detaching it on the last one.
    pub async fn remove_scsi(&self, host_path: &Path) -> Result<()> {
        let host_path_str = host_path.to_string_lossy();
        let mut slots = self.scsi.lock().await;

        let mount = slots.find_mut(&host_path_str).ok_or_else(|| {
            Error::NotFound(format!("SCSI disk {} is not attached to {}", host_path_str, self.id))
        })?;
        if mount.ref_count > 1 {
            mount.ref_count -= 1;
            return Ok(());
        }

        let mount = mount.clone();
        let mut request = ModifySettingRequest::host(
            RequestType::Remove,
            resource_paths::scsi_attachment(mount.controller, mount.lun),
            None,
        );
        if let Some(guest) = mount.guest_request(RequestType::Remove) {
            request = request.with_guest_request(guest);
        }
        self.modify(&request)
            .await
            .with_context(|| format!("failed to remove SCSI disk {}", mount.host_path))?;

        slots.clear(mount.controller, mount.lun);
        tracing::info!(uvm_id = %self.id, path = %mount.host_path, "Detached SCSI disk");
        Ok(())
    }

    pub async fn scsi_mount(&self, controller: usize, lun: usize) -> Option<ScsiMount> {
        self.scsi.lock().await.get(controller, lun).cloned()
    }

    pub(crate) fn scsi_mut(&mut self) -> &mut ScsiSlots {
        self.scsi.get_mut()
    }
}

#[async_trait]
impl Cloneable for ScsiMount {
    fn describe(&self) -> String {
        format!("SCSI mount {}:{} ({})", self.controller, self.lun, self.host_path)
    }

    /// Writable disks are copied into the clone's scratch folder; read-only
    /// disks are shared with the template.
    async fn replay(&self, vm: &mut UtilityVm, data: &mut CloneData<'_>) -> Result<()> {
        let host_path = if self.read_only {
            self.host_path.clone()
        } else {
            let source = Path::new(&self.host_path);
            let file_name = source.file_name().ok_or_else(|| {
                Error::ResourceAcquisition(format!("SCSI mount path {} has no file name", self.host_path))
            })?;
            let dir = data
                .scratch_folder
                .join(format!("clone-mount-{}-{}", self.controller, self.lun));
            tokio::fs::create_dir_all(&dir).await?;
            let destination = dir.join(file_name);
            tokio::fs::copy(source, &destination).await?;
            vm.host().compute.grant_vm_access(data.uvm_id, &destination).await?;
            destination.to_string_lossy().into_owned()
        };

        data.doc
            .virtual_machine_mut()
            .devices
            .scsi
            .entry(self.controller.to_string())
            .or_default()
            .attachments
            .insert(self.lun.to_string(), Attachment::virtual_disk(&host_path, self.read_only));

        vm.scsi_mut().insert(ScsiMount::new(
            self.controller,
            self.lun,
            host_path,
            self.uvm_path.clone(),
            self.read_only,
        ))
    }
}
