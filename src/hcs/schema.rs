//! HCS schema v2 types populated by this crate
//! Based on: https://learn.microsoft.com/en-us/virtualization/api/hcs/schemareference

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_u32(n: &u32) -> bool {
    *n == 0
}

fn is_zero_u64(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self { major: 2, minor: 1 }
    }
}

/// Root compute system document submitted to HCS
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeSystemDoc {
    pub owner: String,
    pub schema_version: SchemaVersion,
    pub should_terminate_on_last_handle_closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VirtualMachine>,
}

impl ComputeSystemDoc {
    pub fn virtual_machine_mut(&mut self) -> &mut VirtualMachine {
        self.virtual_machine.get_or_insert_with(VirtualMachine::default)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualMachine {
    #[serde(default, skip_serializing_if = "is_false")]
    pub stop_on_reset: bool,
    pub chipset: Chipset,
    pub compute_topology: Topology,
    pub devices: Devices,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_connection: Option<GuestConnection>,
    #[serde(rename = "StorageQoS", skip_serializing_if = "Option::is_none")]
    pub storage_qos: Option<StorageQoS>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_state: Option<RestoreState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Chipset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uefi: Option<Uefi>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Uefi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_this: Option<UefiBootEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UefiBootEntry {
    pub device_path: String,
    pub device_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    pub memory: Memory,
    pub processor: Processor,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Memory {
    #[serde(rename = "SizeInMB")]
    pub size_in_mb: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_overcommit: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_hot_hint: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_deferred_commit: bool,
    #[serde(rename = "LowMMIOGapInMB", default, skip_serializing_if = "is_zero_u64")]
    pub low_mmio_gap_in_mb: u64,
    #[serde(rename = "HighMMIOBaseInMB", default, skip_serializing_if = "is_zero_u64")]
    pub high_mmio_base_in_mb: u64,
    #[serde(rename = "HighMMIOGapInMB", default, skip_serializing_if = "is_zero_u64")]
    pub high_mmio_gap_in_mb: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Processor {
    pub count: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub weight: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Devices {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scsi: BTreeMap<String, Scsi>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hv_socket: Option<HvSocket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_smb: Option<VirtualSmb>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub network_adapters: BTreeMap<String, NetworkAdapter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub virtual_pci: BTreeMap<String, VirtualPciDevice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Scsi {
    #[serde(default)]
    pub attachments: BTreeMap<String, Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    pub path: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

impl Attachment {
    pub fn virtual_disk(path: impl Into<String>, read_only: bool) -> Self {
        Self {
            path: path.into(),
            kind: "VirtualDisk".to_string(),
            read_only,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvSocket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hv_socket_config: Option<HvSocketSystemConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvSocketSystemConfig {
    pub default_bind_security_descriptor: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmb {
    #[serde(default)]
    pub shares: Vec<VirtualSmbShare>,
    #[serde(rename = "DirectFileMappingInMB", default, skip_serializing_if = "is_zero_u64")]
    pub direct_file_mapping_in_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbShare {
    pub name: String,
    pub path: String,
    pub options: VirtualSmbShareOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbShareOptions {
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub share_read: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cache_io: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_oplocks: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub take_backup_privilege: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_directmap: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_locks: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pseudo_oplocks: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pseudo_dirnotify: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub single_file_mapping: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub restrict_file_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageQoS {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub iops_maximum: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub bandwidth_maximum: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestoreState {
    pub template_system_id: String,
}

/// Marker asking HCS to establish the in-process guest connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestConnection {
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_connected_suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkAdapter {
    pub endpoint_id: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPciDevice {
    pub functions: Vec<VirtualPciFunction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPciFunction {
    pub device_instance_path: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub virtual_function: u16,
}

fn is_zero_u16(n: &u16) -> bool {
    *n == 0
}

/// Virtual SMB share mapped into a running container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedDirectory {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Named pipe mapped into a running container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedPipe {
    pub container_pipe_name: String,
    pub host_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Add,
    Remove,
    PreAdd,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestResourceType {
    MappedDirectory,
    MappedVirtualDisk,
    Network,
    NetworkNamespace,
}

/// Request forwarded by HCS to the guest agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestRequest {
    pub resource_type: GuestResourceType,
    pub request_type: RequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
}

/// Modify request for a running compute system or container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_type: Option<RequestType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_request: Option<GuestRequest>,
}

impl ModifySettingRequest {
    /// Host-side request against `resource_path`.
    pub fn host(
        request_type: RequestType,
        resource_path: impl Into<String>,
        settings: Option<serde_json::Value>,
    ) -> Self {
        Self {
            resource_path: Some(resource_path.into()),
            request_type: Some(request_type),
            settings,
            guest_request: None,
        }
    }

    /// Guest-only request.
    pub fn guest(request: GuestRequest) -> Self {
        Self {
            guest_request: Some(request),
            ..Default::default()
        }
    }

    pub fn with_guest_request(mut self, request: GuestRequest) -> Self {
        self.guest_request = Some(request);
        self
    }
}

/// Options passed to a save operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SaveOptions {
    pub save_type: String,
}

impl SaveOptions {
    pub fn as_template() -> Self {
        Self {
            save_type: "AsTemplate".to_string(),
        }
    }
}

pub mod resource_paths {
    pub const VSMB_SHARES: &str = "VirtualMachine/Devices/VirtualSmb/Shares";
    pub const MAPPED_DIRECTORIES: &str = "Container/MappedDirectories";
    pub const MAPPED_PIPES: &str = "Container/MappedPipes";

    pub fn scsi_attachment(controller: usize, lun: usize) -> String {
        format!("VirtualMachine/Devices/Scsi/{}/Attachments/{}", controller, lun)
    }

    pub fn network_adapter(nic_id: &str) -> String {
        format!("VirtualMachine/Devices/NetworkAdapters/{}", nic_id)
    }

    pub fn virtual_pci(vmbus_guid: &str) -> String {
        format!("VirtualMachine/Devices/VirtualPci/{}", vmbus_guid)
    }
}
