//! Host services a utility VM is created against

use std::fmt;
use std::sync::Arc;

use crate::hcs::HostComputeService;
use crate::hvsocket::HvSocketBinder;

/// The host virtualization service and hypervisor-socket transport
#[derive(Clone)]
pub struct Host {
    pub compute: Arc<dyn HostComputeService>,
    pub hvsock: Arc<dyn HvSocketBinder>,
}

impl Host {
    pub fn new(compute: Arc<dyn HostComputeService>, hvsock: Arc<dyn HvSocketBinder>) -> Self {
        Self { compute, hvsock }
    }

    /// HCS and AF_HYPERV sockets on this machine
    #[cfg(windows)]
    pub fn local() -> Self {
        Self::new(
            Arc::new(crate::hcs::HcsService::new()),
            Arc::new(crate::hvsocket::WinHvSocketBinder),
        )
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}
