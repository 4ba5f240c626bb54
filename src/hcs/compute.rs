//! HCS compute system handle

use async_trait::async_trait;
use parking_lot::Mutex;
use windows::{
    core::{HSTRING, PCWSTR},
    Win32::System::HostComputeSystem::*,
};

use super::operation::Operation;
use super::schema::ModifySettingRequest;
use super::ComputeSystem;
use crate::{Error, Result};

#[derive(Clone, Copy)]
struct RawSystem(HCS_SYSTEM);

// SAFETY: HCS system handles are not bound to the creating thread.
unsafe impl Send for RawSystem {}
unsafe impl Sync for RawSystem {}

/// Basic properties returned for a compute system
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SystemProperties {
    #[serde(rename = "RuntimeId")]
    runtime_id: Option<String>,
}

/// Wrapper around an HCS_SYSTEM handle
pub struct HcsSystem {
    handle: Mutex<Option<RawSystem>>,
    id: String,
    runtime_id: String,
}

impl HcsSystem {
    /// Create a compute system with the given JSON document and wait for completion
    pub(crate) fn create(id: &str, document: &str) -> Result<Self> {
        let handle = unsafe {
            let id_hstring = HSTRING::from(id);
            let config_hstring = HSTRING::from(document);
            let operation = Operation::new();

            let handle = HcsCreateComputeSystem(
                PCWSTR(id_hstring.as_ptr()),
                PCWSTR(config_hstring.as_ptr()),
                operation.handle(),
                None,
            )?;

            if let Err(e) = operation.wait("HcsCreateComputeSystem") {
                HcsCloseComputeSystem(handle);
                return Err(e);
            }
            RawSystem(handle)
        };

        let properties = match query_properties(handle) {
            Ok(p) => p,
            Err(e) => {
                unsafe { HcsCloseComputeSystem(handle.0) };
                return Err(e);
            }
        };

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            id: id.to_string(),
            runtime_id: properties.runtime_id.unwrap_or_default(),
        })
    }

    fn raw(&self) -> Result<RawSystem> {
        (*self.handle.lock()).ok_or_else(|| Error::Hcs(format!("compute system {} is closed", self.id)))
    }
}

fn query_properties(handle: RawSystem) -> Result<SystemProperties> {
    unsafe {
        let operation = Operation::new();
        let query = HSTRING::from("{}");
        HcsGetComputeSystemProperties(handle.0, operation.handle(), PCWSTR(query.as_ptr()))?;
        let result = operation.wait("HcsGetComputeSystemProperties")?;
        Ok(serde_json::from_str(&result)?)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Hcs(format!("HCS call did not complete: {}", e)))?
}

#[async_trait]
impl ComputeSystem for HcsSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    async fn start(&self) -> Result<()> {
        let raw = self.raw()?;
        blocking(move || unsafe {
            let operation = Operation::new();
            HcsStartComputeSystem(raw.0, operation.handle(), PCWSTR::null())?;
            operation.wait("HcsStartComputeSystem").map(|_| ())
        })
        .await
    }

    async fn pause(&self) -> Result<()> {
        let raw = self.raw()?;
        blocking(move || unsafe {
            let operation = Operation::new();
            HcsPauseComputeSystem(raw.0, operation.handle(), PCWSTR::null())?;
            operation.wait("HcsPauseComputeSystem").map(|_| ())
        })
        .await
    }

    async fn save(&self, options: &serde_json::Value) -> Result<()> {
        let raw = self.raw()?;
        let options = options.to_string();
        blocking(move || unsafe {
            let operation = Operation::new();
            let options_hstring = HSTRING::from(options.as_str());
            HcsSaveComputeSystem(raw.0, operation.handle(), PCWSTR(options_hstring.as_ptr()))?;
            operation.wait("HcsSaveComputeSystem").map(|_| ())
        })
        .await
    }

    async fn terminate(&self) -> Result<()> {
        let raw = self.raw()?;
        blocking(move || unsafe {
            let operation = Operation::new();
            HcsTerminateComputeSystem(raw.0, operation.handle(), PCWSTR::null())?;
            operation.wait("HcsTerminateComputeSystem").map(|_| ())
        })
        .await
    }

    async fn modify(&self, request: &ModifySettingRequest) -> Result<()> {
        let raw = self.raw()?;
        let config = serde_json::to_string(request)?;
        blocking(move || unsafe {
            let operation = Operation::new();
            let config_hstring = HSTRING::from(config.as_str());
            HcsModifyComputeSystem(
                raw.0,
                operation.handle(),
                PCWSTR(config_hstring.as_ptr()),
                windows::Win32::Foundation::HANDLE::default(),
            )?;
            operation.wait("HcsModifyComputeSystem").map(|_| ())
        })
        .await
    }

    fn close(&self) {
        if let Some(raw) = self.handle.lock().take() {
            unsafe {
                HcsCloseComputeSystem(raw.0);
            }
        }
    }
}

impl Drop for HcsSystem {
    fn drop(&mut self) {
        self.close();
    }
}
