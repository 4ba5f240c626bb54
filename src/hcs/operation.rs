//! HCS operation wrapper for synchronous calls

use std::ffi::c_void;
use windows::{core::PWSTR, Win32::System::HostComputeSystem::*};

use crate::{Error, Result};

/// Wrapper around HCS_OPERATION, closed on drop
pub struct Operation {
    handle: HCS_OPERATION,
}

impl Operation {
    /// Create a new synchronous operation (no completion callback)
    pub fn new() -> Self {
        unsafe {
            let handle = HcsCreateOperation(None, None);
            Self { handle }
        }
    }

    pub fn handle(&self) -> HCS_OPERATION {
        self.handle
    }

    /// Wait for completion. A failed operation is reported with its result document.
    pub fn wait(&self, context: &str) -> Result<String> {
        unsafe {
            let mut result_doc: PWSTR = PWSTR::null();
            let waited = HcsWaitForOperationResult(self.handle, u32::MAX, Some(&mut result_doc));
            let result = take_pwstr(&mut result_doc);

            match waited {
                Ok(()) => Ok(result),
                Err(e) => {
                    tracing::debug!(context, result = %result, "HCS operation failed");
                    if result.is_empty() {
                        Err(Error::from_hresult(e.code().0, context))
                    } else {
                        Err(Error::Hcs(format!("{}: {} ({})", context, e.message(), result)))
                    }
                }
            }
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        unsafe {
            HcsCloseOperation(self.handle);
        }
    }
}

/// Copy out and free a string allocated by HCS or HCN.
pub(crate) fn take_pwstr(p: &mut PWSTR) -> String {
    unsafe {
        if p.is_null() {
            return String::new();
        }
        let s = p.to_string().unwrap_or_default();
        windows::Win32::System::Com::CoTaskMemFree(Some(p.as_ptr() as *const c_void));
        *p = PWSTR::null();
        s
    }
}
