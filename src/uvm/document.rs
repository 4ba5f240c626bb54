//! Building the compute system document for a Windows utility VM

use std::path::Path;

use super::options::{ResolvedResources, UvmOptions};
use super::vsmb::default_vsmb_options;
use crate::hcs::schema::*;

pub const UEFI_BOOT_DEVICE_PATH: &str = r"\EFI\Microsoft\Boot\bootmgfw.efi";
pub const UEFI_BOOT_DEVICE_TYPE: &str = "VmbFs";

/// Only administrators and SYSTEM may bind hypervisor sockets in the VM.
pub const DEFAULT_BIND_SECURITY_DESCRIPTOR: &str = "D:P(A;;FA;;;SY)(A;;FA;;;BA)";

pub const VSMB_DIRECT_FILE_MAPPING_MB: u64 = 1024;

/// Name of the share exposing the OS root filesystem
pub const OS_SHARE_NAME: &str = "os";

/// Directory inside the image folder holding the guest OS files
pub fn os_files_path(uvm_folder: &Path) -> std::path::PathBuf {
    uvm_folder.join("UtilityVM").join("Files")
}

/// Build the compute system document from resolved options.
///
/// No I/O happens here; scratch and clone attachments are added afterwards.
pub fn prepare_config_doc(opts: &UvmOptions, resolved: &ResolvedResources, uvm_folder: &Path) -> ComputeSystemDoc {
    let mut os_share_options = default_vsmb_options(true, opts.fully_physically_backed, opts.vsmb_no_direct_map);
    os_share_options.take_backup_privilege = true;

    let virtual_smb = VirtualSmb {
        direct_file_mapping_in_mb: VSMB_DIRECT_FILE_MAPPING_MB,
        shares: vec![VirtualSmbShare {
            name: OS_SHARE_NAME.to_string(),
            path: os_files_path(uvm_folder).to_string_lossy().into_owned(),
            options: os_share_options,
            allowed_files: Vec::new(),
        }],
    };

    let storage_qos = (opts.storage_qos_iops_maximum > 0 || opts.storage_qos_bandwidth_maximum > 0).then(|| {
        StorageQoS {
            iops_maximum: opts.storage_qos_iops_maximum,
            bandwidth_maximum: opts.storage_qos_bandwidth_maximum,
        }
    });

    ComputeSystemDoc {
        owner: opts.owner.clone(),
        schema_version: SchemaVersion::default(),
        should_terminate_on_last_handle_closed: true,
        virtual_machine: Some(VirtualMachine {
            stop_on_reset: true,
            chipset: Chipset {
                uefi: Some(Uefi {
                    boot_this: Some(UefiBootEntry {
                        device_path: UEFI_BOOT_DEVICE_PATH.to_string(),
                        device_type: UEFI_BOOT_DEVICE_TYPE.to_string(),
                    }),
                }),
            },
            compute_topology: Topology {
                memory: Memory {
                    size_in_mb: resolved.memory_size_in_mb,
                    allow_overcommit: opts.allow_overcommit,
                    // hot hint is not compatible with physically backed memory
                    enable_hot_hint: opts.allow_overcommit,
                    enable_deferred_commit: opts.enable_deferred_commit,
                    low_mmio_gap_in_mb: opts.low_mmio_gap_in_mb,
                    high_mmio_base_in_mb: opts.high_mmio_base_in_mb,
                    high_mmio_gap_in_mb: opts.high_mmio_gap_in_mb,
                },
                processor: Processor {
                    count: resolved.processor_count,
                    limit: opts.processor_limit,
                    weight: opts.processor_weight,
                },
            },
            devices: Devices {
                hv_socket: Some(HvSocket {
                    hv_socket_config: Some(HvSocketSystemConfig {
                        default_bind_security_descriptor: DEFAULT_BIND_SECURITY_DESCRIPTOR.to_string(),
                    }),
                }),
                virtual_smb: Some(virtual_smb),
                ..Default::default()
            },
            // follows the resolved flag, not the requested one: clones always
            // serve the guest connection themselves and must not carry the marker
            guest_connection: (!resolved.external_guest_connection).then(GuestConnection::default),
            storage_qos,
            restore_state: None,
        }),
    }
}
