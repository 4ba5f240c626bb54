//! Windows utility VM creation pipeline

use std::collections::BTreeMap;

use super::clone::clone_from_template;
use super::document::prepare_config_doc;
use super::options::{HostCapacity, UvmOptions};
use super::scratch::{ensure_scratch_folder, locate_uvm_folder, ScratchProvisioner};
use super::scsi::ScsiMount;
use super::vsmb::set_saveable_vsmb_options;
use super::UtilityVm;
use crate::hcs::schema::{Attachment, Scsi};
use crate::host::Host;
use crate::merge::merge_json;
use crate::{Error, Result, ResultExt};

/// Create a Windows utility VM, from scratch or as a clone of a template.
///
/// The scratch disk is always attached at SCSI 0:0. On any failure, or if the
/// returned future is dropped, everything created so far is closed.
#[tracing::instrument(skip_all, fields(uvm_id = tracing::field::Empty))]
pub async fn create_wcow(host: &Host, opts: UvmOptions) -> Result<UtilityVm> {
    let opts = opts.with_identity();
    tracing::Span::current().record("uvm_id", opts.id.as_str());
    tracing::debug!(options = ?opts, "Creating utility VM");

    let mut vm = UtilityVm::new(host.clone(), &opts);

    opts.validate().context("the utility VM options are invalid")?;

    let uvm_folder = locate_uvm_folder(&opts.layer_folders)
        .await
        .context("failed to locate utility VM folder from layer folders")?;

    let scratch_folder = opts
        .scratch_folder()
        .ok_or_else(|| Error::InvalidOptions("no scratch folder in layer folders".into()))?;
    ensure_scratch_folder(scratch_folder).await?;

    let topology = host
        .compute
        .processor_topology()
        .await
        .context("failed to get host processor information")?;
    let resolved = opts.resolve(&HostCapacity {
        logical_processor_count: topology.logical_processor_count,
    });
    vm.apply_resolved(&resolved);

    let mut doc = prepare_config_doc(&opts, &resolved, &uvm_folder);

    match (&opts.template_config, opts.is_clone) {
        (Some(template), true) => {
            clone_from_template(&mut vm, &mut doc, template, scratch_folder)
                .await
                .context("failed while cloning")?;
        }
        _ => {
            let disk = ScratchProvisioner::new(host.compute.clone())
                .provision(&uvm_folder, scratch_folder, &opts.id)
                .await
                .context("failed to create scratch")?;
            let disk = disk.to_string_lossy().into_owned();

            doc.virtual_machine_mut().devices.scsi = BTreeMap::from([(
                "0".to_string(),
                Scsi {
                    attachments: BTreeMap::from([("0".to_string(), Attachment::virtual_disk(&disk, false))]),
                },
            )]);
            vm.scsi_mut().insert(ScsiMount::new(0, 0, disk, "", false))?;
        }
    }

    if opts.is_template {
        if let Some(vsmb) = doc.virtual_machine_mut().devices.virtual_smb.as_mut() {
            for share in &mut vsmb.shares {
                let read_only = share.options.read_only;
                set_saveable_vsmb_options(&mut share.options, read_only);
            }
        }
    }

    let document = merge_json(serde_json::to_value(&doc)?, &opts.additional_hcs_document_json).with_context(|| {
        format!(
            "failed to merge additional JSON '{}'",
            opts.additional_hcs_document_json
        )
    })?;

    vm.create(&document.to_string())
        .await
        .context("error while creating the compute system")?;

    if resolved.external_guest_connection {
        vm.start_external_gcs_listener()
            .await
            .context("failed to start the external guest connection listener")?;
    }

    tracing::info!(
        runtime_id = %vm.runtime_id(),
        processors = vm.processor_count(),
        memory_mb = vm.memory_size_in_mb(),
        clone = vm.is_clone(),
        "Created utility VM"
    );
    Ok(vm)
}
