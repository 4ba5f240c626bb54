//! Virtual SMB shares on a utility VM

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use super::clone::{CloneData, Cloneable};
use super::UtilityVm;
use crate::hcs::schema::{resource_paths, ModifySettingRequest, RequestType, VirtualSmbShare, VirtualSmbShareOptions};
use crate::{Error, Result, ResultExt};

/// Guest path under which every VSMB share appears
pub const VSMB_GUEST_ROOT: &str = r"\\?\VMSMB\VSMB-{dcc079ae-60ba-4d07-847c-3493609c0870}";

/// Share options for a share on a VM with the given backing.
///
/// Read-only shares are cached and use pseudo oplocks. Direct mapping is
/// disabled for physically backed devices or when requested.
pub fn default_vsmb_options(
    read_only: bool,
    devices_physically_backed: bool,
    no_direct_map: bool,
) -> VirtualSmbShareOptions {
    let mut options = VirtualSmbShareOptions {
        no_directmap: devices_physically_backed || no_direct_map,
        ..Default::default()
    };
    if read_only {
        options.share_read = true;
        options.cache_io = true;
        options.read_only = true;
        options.pseudo_oplocks = true;
    }
    options
}

/// Adjust share options so the VM can be saved as a template.
pub fn set_saveable_vsmb_options(options: &mut VirtualSmbShareOptions, read_only: bool) {
    if read_only {
        options.share_read = true;
        options.cache_io = true;
        options.read_only = true;
        options.pseudo_oplocks = true;
        options.no_oplocks = false;
    } else {
        // oplocks cannot survive a save
        options.share_read = false;
        options.cache_io = false;
        options.read_only = false;
        options.pseudo_oplocks = false;
        options.no_oplocks = true;
    }
    options.no_locks = true;
    options.pseudo_dirnotify = true;
    options.no_directmap = true;
}

/// A host directory, or a single file, shared into the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsmbShare {
    /// Directory or file shared, as requested by the caller
    pub host_path: String,
    pub name: String,
    pub guest_path: String,
    pub options: VirtualSmbShareOptions,
    pub allowed_files: Vec<String>,
    pub is_file: bool,
    ref_count: u32,
}

impl VsmbShare {
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Directory actually shared. A file share exposes its parent directory.
    fn share_path(&self) -> String {
        if self.is_file {
            Path::new(&self.host_path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            self.host_path.clone()
        }
    }

    fn to_schema(&self) -> VirtualSmbShare {
        VirtualSmbShare {
            name: self.name.clone(),
            path: self.share_path(),
            options: self.options.clone(),
            allowed_files: self.allowed_files.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct VsmbShares {
    dirs: BTreeMap<String, VsmbShare>,
    files: BTreeMap<String, VsmbShare>,
    counter: u64,
}

impl VsmbShares {
    fn next_name(&mut self) -> String {
        let name = format!("s{:x}", self.counter);
        self.counter += 1;
        name
    }

    fn map_mut(&mut self, is_file: bool) -> &mut BTreeMap<String, VsmbShare> {
        if is_file {
            &mut self.files
        } else {
            &mut self.dirs
        }
    }

    pub(crate) fn register(&mut self, share: VsmbShare) {
        self.counter += 1;
        self.map_mut(share.is_file).insert(share.host_path.clone(), share);
    }

    /// Directory shares then file shares, each ordered by host path
    pub(crate) fn shares(&self) -> impl Iterator<Item = &VsmbShare> {
        self.dirs.values().chain(self.files.values())
    }
}

impl UtilityVm {
    /// Share a host directory or file into the guest, or take another
    /// reference if it is already shared.
    pub async fn add_vsmb(&self, host_path: &Path, mut options: VirtualSmbShareOptions) -> Result<VsmbShare> {
        let metadata = tokio::fs::metadata(host_path)
            .await
            .with_context(|| format!("failed to stat VSMB share {}", host_path.display()))?;
        let is_file = !metadata.is_dir();
        let key = host_path.to_string_lossy().into_owned();

        let mut shares = self.vsmb.lock().await;
        if let Some(existing) = shares.map_mut(is_file).get_mut(&key) {
            existing.ref_count += 1;
            return Ok(existing.clone());
        }

        let name = shares.next_name();
        let mut guest_path = format!(r"{}\{}", VSMB_GUEST_ROOT, name);
        let mut allowed_files = Vec::new();
        if is_file {
            let file_name = host_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::ResourceAcquisition(format!("{} has no file name", key)))?;
            guest_path = format!(r"{}\{}", guest_path, file_name);
            allowed_files.push(file_name);
            options.single_file_mapping = true;
            options.restrict_file_access = true;
        }

        let share = VsmbShare {
            host_path: key,
            name,
            guest_path,
            options,
            allowed_files,
            is_file,
            ref_count: 1,
        };
        let request = ModifySettingRequest::host(
            RequestType::Add,
            resource_paths::VSMB_SHARES,
            Some(serde_json::to_value(share.to_schema())?),
        );
        self.modify(&request)
            .await
            .with_context(|| format!("failed to add VSMB share {}", share.host_path))?;

        tracing::info!(
            uvm_id = %self.id,
            path = %share.host_path,
            name = %share.name,
            "Added VSMB share"
        );
        shares.map_mut(is_file).insert(share.host_path.clone(), share.clone());
        Ok(share)
    }

    /// Drop a reference to a share, removing it on the last one.
    pub async fn remove_vsmb(&self, host_path: &Path) -> Result<()> {
        let key = host_path.to_string_lossy().into_owned();
        let mut shares = self.vsmb.lock().await;

        let is_file = if shares.dirs.contains_key(&key) {
            false
        } else if shares.files.contains_key(&key) {
            true
        } else {
            return Err(Error::NotFound(format!("VSMB share {} is not attached to {}", key, self.id)));
        };

        let map = shares.map_mut(is_file);
        let Some(share) = map.get_mut(&key) else {
            return Err(Error::NotFound(key));
        };
        if share.ref_count > 1 {
            share.ref_count -= 1;
            return Ok(());
        }

        let request = ModifySettingRequest::host(
            RequestType::Remove,
            resource_paths::VSMB_SHARES,
            Some(serde_json::json!({ "Name": share.name, "Path": share.share_path() })),
        );
        self.modify(&request)
            .await
            .with_context(|| format!("failed to remove VSMB share {}", key))?;

        map.remove(&key);
        tracing::info!(uvm_id = %self.id, path = %key, "Removed VSMB share");
        Ok(())
    }

    pub async fn vsmb_share(&self, host_path: &Path) -> Option<VsmbShare> {
        let key = host_path.to_string_lossy();
        let shares = self.vsmb.lock().await;
        shares.dirs.get(&*key).or_else(|| shares.files.get(&*key)).cloned()
    }
}

#[async_trait]
impl Cloneable for VsmbShare {
    fn describe(&self) -> String {
        format!("VSMB share {} ({})", self.name, self.host_path)
    }

    async fn replay(&self, vm: &mut UtilityVm, data: &mut CloneData<'_>) -> Result<()> {
        data.doc
            .virtual_machine_mut()
            .devices
            .virtual_smb
            .get_or_insert_with(Default::default)
            .shares
            .push(self.to_schema());

        vm.vsmb.get_mut().register(VsmbShare {
            ref_count: 1,
            ..self.clone()
        });
        Ok(())
    }
}
