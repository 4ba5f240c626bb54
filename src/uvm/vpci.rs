//! Virtual PCI device assignment

use async_trait::async_trait;

use super::clone::{CloneData, Cloneable};
use super::UtilityVm;
use crate::hcs::schema::{resource_paths, ModifySettingRequest, RequestType, VirtualPciDevice, VirtualPciFunction};
use crate::{Error, Result, ResultExt};

/// A host device assigned to the VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpciDevice {
    /// VMBus channel the device is exposed on
    pub vmbus_guid: String,
    pub device_instance_path: String,
    pub virtual_function_index: u16,
    ref_count: u32,
}

impl VpciDevice {
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn to_schema(&self) -> VirtualPciDevice {
        VirtualPciDevice {
            functions: vec![VirtualPciFunction {
                device_instance_path: self.device_instance_path.clone(),
                virtual_function: self.virtual_function_index,
            }],
        }
    }
}

impl UtilityVm {
    /// Assign a host device, or take another reference if already assigned.
    pub async fn assign_device(&self, device_instance_path: &str, virtual_function_index: u16) -> Result<VpciDevice> {
        let mut devices = self.vpci.lock().await;
        if let Some(existing) = devices.get_mut(device_instance_path) {
            existing.ref_count += 1;
            return Ok(existing.clone());
        }

        let device = VpciDevice {
            vmbus_guid: uuid::Uuid::new_v4().to_string(),
            device_instance_path: device_instance_path.to_string(),
            virtual_function_index,
            ref_count: 1,
        };
        let request = ModifySettingRequest::host(
            RequestType::Add,
            resource_paths::virtual_pci(&device.vmbus_guid),
            Some(serde_json::to_value(device.to_schema())?),
        );
        self.modify(&request)
            .await
            .with_context(|| format!("failed to assign device {}", device_instance_path))?;

        tracing::info!(
            uvm_id = %self.id,
            device = %device_instance_path,
            vmbus_guid = %device.vmbus_guid,
            "Assigned device"
        );
        devices.insert(device_instance_path.to_string(), device.clone());
        Ok(device)
    }

    pub async fn remove_device(&self, device_instance_path: &str) -> Result<()> {
        let mut devices = self.vpci.lock().await;
        let Some(device) = devices.get_mut(device_instance_path) else {
            return Err(Error::NotFound(format!(
                "device {} is not assigned to {}",
                device_instance_path, self.id
            )));
        };
        if device.ref_count > 1 {
            device.ref_count -= 1;
            return Ok(());
        }

        let request = ModifySettingRequest::host(
            RequestType::Remove,
            resource_paths::virtual_pci(&device.vmbus_guid),
            None,
        );
        self.modify(&request)
            .await
            .with_context(|| format!("failed to remove device {}", device_instance_path))?;

        devices.remove(device_instance_path);
        Ok(())
    }

    pub async fn vpci_device(&self, device_instance_path: &str) -> Option<VpciDevice> {
        self.vpci.lock().await.get(device_instance_path).cloned()
    }
}

#[async_trait]
impl Cloneable for VpciDevice {
    fn describe(&self) -> String {
        format!("VPCI device {}", self.device_instance_path)
    }

    async fn replay(&self, vm: &mut UtilityVm, data: &mut CloneData<'_>) -> Result<()> {
        data.doc
            .virtual_machine_mut()
            .devices
            .virtual_pci
            .insert(self.vmbus_guid.clone(), self.to_schema());

        vm.vpci.get_mut().insert(
            self.device_instance_path.clone(),
            VpciDevice {
                ref_count: 1,
                ..self.clone()
            },
        );
        Ok(())
    }
}
