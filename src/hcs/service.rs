//! HostComputeService backed by the local HCS

use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::System::HostComputeSystem::*;

use super::compute::HcsSystem;
use super::{ComputeSystem, HostComputeService, ProcessorTopology};
use crate::{Error, Result};

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceProperties {
    #[serde(default)]
    properties: Vec<serde_json::Value>,
}

/// The HCS instance on this machine
#[derive(Debug, Default, Clone)]
pub struct HcsService;

impl HcsService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostComputeService for HcsService {
    async fn create_compute_system(&self, id: &str, document: &str) -> Result<Arc<dyn ComputeSystem>> {
        let id = id.to_string();
        let document = document.to_string();
        let system = tokio::task::spawn_blocking(move || HcsSystem::create(&id, &document))
            .await
            .map_err(|e| Error::Hcs(format!("HcsCreateComputeSystem did not complete: {}", e)))??;
        Ok(Arc::new(system))
    }

    async fn processor_topology(&self) -> Result<ProcessorTopology> {
        let result = tokio::task::spawn_blocking(|| unsafe {
            let query = HSTRING::from(r#"{"PropertyTypes":["ProcessorTopology"]}"#);
            let result = HcsGetServiceProperties(PCWSTR(query.as_ptr()))?;
            let result_str = result.to_string().unwrap_or_default();
            windows::Win32::System::Com::CoTaskMemFree(Some(result.as_ptr() as *const c_void));
            Ok::<_, Error>(result_str)
        })
        .await
        .map_err(|e| Error::Hcs(format!("HcsGetServiceProperties did not complete: {}", e)))??;

        let props: ServiceProperties = serde_json::from_str(&result)?;
        let topology = props
            .properties
            .into_iter()
            .next()
            .ok_or_else(|| Error::Hcs("service properties contained no processor topology".into()))?;
        Ok(serde_json::from_value(topology)?)
    }

    async fn grant_vm_access(&self, vm_id: &str, path: &Path) -> Result<()> {
        let vm_id = HSTRING::from(vm_id);
        let path = HSTRING::from(path.as_os_str());
        tokio::task::spawn_blocking(move || unsafe {
            HcsGrantVmAccess(PCWSTR(vm_id.as_ptr()), PCWSTR(path.as_ptr()))?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Hcs(format!("HcsGrantVmAccess did not complete: {}", e)))?
    }
}
