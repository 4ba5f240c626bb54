//! Scratch storage for utility VMs built from scratch

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::hcs::HostComputeService;
use crate::{Error, Result};

/// File name of the scratch disk inside the scratch folder
pub const SCRATCH_DISK_NAME: &str = "sandbox.vhdx";

/// Base disk shipped with the image the scratch disk is created from
pub const SCRATCH_TEMPLATE_NAME: &str = "SystemTemplate.vhdx";

/// Find the image folder holding the `UtilityVM` directory.
///
/// Searches the read-only layers from top-most to base; the last entry is
/// the scratch folder and is never considered.
pub async fn locate_uvm_folder(layer_folders: &[PathBuf]) -> Result<PathBuf> {
    let read_only = layer_folders.split_last().map(|(_, rest)| rest).unwrap_or_default();
    for folder in read_only {
        if tokio::fs::metadata(folder.join("UtilityVM"))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            tracing::debug!(folder = %folder.display(), "Located utility VM folder");
            return Ok(folder.clone());
        }
    }
    Err(Error::ResourceAcquisition(
        "utility VM folder could not be found in layers".into(),
    ))
}

/// Create the scratch folder and its parents if missing.
pub async fn ensure_scratch_folder(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        Error::ResourceAcquisition(format!(
            "failed to create utility VM scratch folder {}: {}",
            path.display(),
            e
        ))
    })
}

/// Creates the writable scratch disk a fresh utility VM boots with
pub struct ScratchProvisioner {
    compute: Arc<dyn HostComputeService>,
}

impl ScratchProvisioner {
    pub fn new(compute: Arc<dyn HostComputeService>) -> Self {
        Self { compute }
    }

    /// Ensure `<scratch_folder>/sandbox.vhdx` exists and `vm_id` can open it.
    ///
    /// An existing disk is left untouched. Returns the disk path.
    pub async fn provision(&self, uvm_folder: &Path, scratch_folder: &Path, vm_id: &str) -> Result<PathBuf> {
        ensure_scratch_folder(scratch_folder).await?;

        let disk = scratch_folder.join(SCRATCH_DISK_NAME);
        if tokio::fs::try_exists(&disk).await.unwrap_or(false) {
            tracing::debug!(path = %disk.display(), "Reusing existing scratch disk");
            return Ok(disk);
        }

        let template = uvm_folder.join("UtilityVM").join(SCRATCH_TEMPLATE_NAME);
        tokio::fs::copy(&template, &disk).await.map_err(|e| {
            Error::ResourceAcquisition(format!(
                "failed to copy {} to {}: {}",
                template.display(),
                disk.display(),
                e
            ))
        })?;

        if let Err(e) = self.compute.grant_vm_access(vm_id, &disk).await {
            let _ = tokio::fs::remove_file(&disk).await;
            return Err(Error::ResourceAcquisition(format!(
                "failed to grant {} access to {}: {}",
                vm_id,
                disk.display(),
                e
            )));
        }

        tracing::info!(uvm_id = %vm_id, path = %disk.display(), "Created scratch disk");
        Ok(disk)
    }
}
