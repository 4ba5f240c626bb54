//! Utility VM handle
//!
//! A [`UtilityVm`] is built by [`create_wcow`] with exclusive access, then
//! shared. Each resource class (SCSI, VSMB, VPCI, network namespaces) has its
//! own lock, held across the HCS modify call for that class, so operations on
//! one class are linearizable without waiting on another.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::hcs::schema::{ModifySettingRequest, VirtualSmbShareOptions};
use crate::hcs::ComputeSystem;
use crate::host::Host;
use crate::hvsocket::{GuestChannelListener, HvSocketAddr};
use crate::{Error, Result};

pub mod clone;
pub mod create;
pub mod document;
pub mod guest_channel;
pub mod network;
pub mod options;
pub mod scratch;
pub mod scsi;
pub mod vpci;
pub mod vsmb;

pub use clone::{clone_from_template, CloneData, Cloneable, TemplateConfig};
pub use create::create_wcow;
pub use network::{NamespaceInfo, NicInfo};
pub use options::{HostCapacity, ResolvedResources, UvmOptions, UvmOptionsBuilder};
pub use scsi::ScsiMount;
pub use vpci::VpciDevice;
pub use vsmb::{default_vsmb_options, set_saveable_vsmb_options, VsmbShare};

use scsi::ScsiSlots;
use vsmb::VsmbShares;

/// SCSI controllers attached to a Windows utility VM
pub const WCOW_SCSI_CONTROLLERS: usize = 1;

pub const SCSI_LUNS_PER_CONTROLLER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Windows,
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsType::Windows => write!(f, "windows"),
        }
    }
}

/// A utility VM and the resources attached to it
pub struct UtilityVm {
    id: String,
    owner: String,
    os_type: OsType,
    runtime_id: String,
    processor_count: u32,
    memory_size_in_mb: u64,
    physically_backed: bool,
    devices_physically_backed: bool,
    vsmb_no_direct_map: bool,
    is_clone: bool,
    is_template: bool,
    host: Host,

    scsi: Mutex<ScsiSlots>,
    vsmb: Mutex<VsmbShares>,
    vpci: Mutex<BTreeMap<String, VpciDevice>>,
    namespaces: Mutex<BTreeMap<String, NamespaceInfo>>,

    system: SyncMutex<Option<Arc<dyn ComputeSystem>>>,
    guest_listener: SyncMutex<Option<GuestChannelListener>>,
}

impl UtilityVm {
    pub(crate) fn new(host: Host, opts: &UvmOptions) -> Self {
        Self {
            id: opts.id.clone(),
            owner: opts.owner.clone(),
            os_type: OsType::Windows,
            runtime_id: String::new(),
            processor_count: opts.processor_count,
            memory_size_in_mb: opts.memory_size_in_mb,
            physically_backed: !opts.allow_overcommit,
            devices_physically_backed: opts.fully_physically_backed,
            vsmb_no_direct_map: opts.vsmb_no_direct_map,
            is_clone: false,
            is_template: opts.is_template,
            host,
            scsi: Mutex::new(ScsiSlots::new(WCOW_SCSI_CONTROLLERS, SCSI_LUNS_PER_CONTROLLER)),
            vsmb: Mutex::new(VsmbShares::default()),
            vpci: Mutex::new(BTreeMap::new()),
            namespaces: Mutex::new(BTreeMap::new()),
            system: SyncMutex::new(None),
            guest_listener: SyncMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn os_type(&self) -> OsType {
        self.os_type
    }

    /// Runtime VM id assigned by HCS. Empty until the compute system exists.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn processor_count(&self) -> u32 {
        self.processor_count
    }

    pub fn memory_size_in_mb(&self) -> u64 {
        self.memory_size_in_mb
    }

    /// Memory is not overcommitted.
    pub fn physically_backed(&self) -> bool {
        self.physically_backed
    }

    pub fn devices_physically_backed(&self) -> bool {
        self.devices_physically_backed
    }

    pub fn is_clone(&self) -> bool {
        self.is_clone
    }

    pub fn is_template(&self) -> bool {
        self.is_template
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Default share options for this VM. See [`default_vsmb_options`].
    pub fn default_vsmb_options(&self, read_only: bool) -> VirtualSmbShareOptions {
        default_vsmb_options(read_only, self.devices_physically_backed, self.vsmb_no_direct_map)
    }

    pub fn compute_system(&self) -> Result<Arc<dyn ComputeSystem>> {
        self.system
            .lock()
            .clone()
            .ok_or_else(|| Error::Hcs(format!("utility VM {} has no compute system", self.id)))
    }

    /// Address of the external guest channel listener, if one is running.
    pub fn guest_listener_addr(&self) -> Option<HvSocketAddr> {
        self.guest_listener.lock().as_ref().map(|l| l.addr().clone())
    }

    /// Hand the guest channel listener to whoever serves the guest connection.
    pub fn take_guest_listener(&self) -> Option<GuestChannelListener> {
        self.guest_listener.lock().take()
    }

    pub async fn start(&self) -> Result<()> {
        let system = self.compute_system()?;
        system.start().await?;
        tracing::info!(uvm_id = %self.id, "Started utility VM");
        Ok(())
    }

    pub async fn terminate(&self) -> Result<()> {
        let system = self.compute_system()?;
        system.terminate().await?;
        tracing::info!(uvm_id = %self.id, "Terminated utility VM");
        Ok(())
    }

    /// Release the guest listener and the compute system handle.
    ///
    /// Safe to call on a partially built VM and more than once.
    pub fn close(&self) {
        if let Some(mut listener) = self.guest_listener.lock().take() {
            listener.close();
        }
        if let Some(system) = self.system.lock().take() {
            system.close();
            tracing::debug!(uvm_id = %self.id, "Closed compute system");
        }
    }

    /// Submit the final document and keep the created compute system.
    pub(crate) async fn create(&mut self, document: &str) -> Result<()> {
        let system = self.host.compute.create_compute_system(&self.id, document).await?;
        self.runtime_id = system.runtime_id().to_string();
        *self.system.get_mut() = Some(system);
        Ok(())
    }

    pub(crate) async fn modify(&self, request: &ModifySettingRequest) -> Result<()> {
        self.compute_system()?.modify(request).await
    }

    pub(crate) fn apply_resolved(&mut self, resolved: &ResolvedResources) {
        self.processor_count = resolved.processor_count;
        self.memory_size_in_mb = resolved.memory_size_in_mb;
    }

    pub(crate) fn namespaces_mut(&mut self) -> &mut BTreeMap<String, NamespaceInfo> {
        self.namespaces.get_mut()
    }
}

impl Drop for UtilityVm {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for UtilityVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtilityVm")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("runtime_id", &self.runtime_id)
            .field("processor_count", &self.processor_count)
            .field("memory_size_in_mb", &self.memory_size_in_mb)
            .field("is_clone", &self.is_clone)
            .field("is_template", &self.is_template)
            .finish_non_exhaustive()
    }
}
