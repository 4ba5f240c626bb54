//! External guest compute service connection

use super::UtilityVm;
use crate::hvsocket::{GuestChannelListener, HvSocketAddr};
use crate::{Error, Result};

impl UtilityVm {
    /// Listen for the guest compute service on the VM's hypervisor socket.
    ///
    /// Used instead of the in-process guest connection when one was not
    /// requested, and always for clones.
    pub(crate) async fn start_external_gcs_listener(&self) -> Result<()> {
        if self.guest_listener.lock().is_some() {
            return Err(Error::GuestChannel(format!(
                "utility VM {} already has a guest channel listener",
                self.id
            )));
        }

        let addr = HvSocketAddr::gcs(self.runtime_id.clone());
        tracing::debug!(uvm_id = %self.id, addr = %addr, "Using external GCS bridge");

        let acceptor = self.host.hvsock.bind(&addr).await?;
        let listener = GuestChannelListener::spawn(addr, acceptor);
        *self.guest_listener.lock() = Some(listener);
        Ok(())
    }
}
