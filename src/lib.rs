//! HCS Utility VM provisioning
//!
//! Creates Windows utility VMs through the Host Compute Service (HCS), either
//! from scratch or as clones of a saved template, and attaches host network
//! namespaces into them.
//!
//! # Key Features
//!
//! - **Document generation** - builds the HCS schema v2 compute system document
//! - **Templates and clones** - save a VM as a template, replay its resources into clones
//! - **Ref-counted resources** - SCSI disks, VSMB shares and assigned devices
//! - **Network namespaces** - create, bind and attach HCN namespaces and endpoints
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(windows)]
//! # async fn run() -> hcs_uvm::Result<()> {
//! use hcs_uvm::{create_wcow, Host, UvmOptions};
//!
//! let host = Host::local();
//! let opts = UvmOptions::builder()
//!     .id("uvm-1")
//!     .memory_mb(2048)
//!     .processors(2)
//!     .layer_folders([r"C:\layers\base", r"C:\scratch\uvm-1"])
//!     .build();
//!
//! let vm = create_wcow(&host, opts).await?;
//! vm.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod error;
pub mod hcn;
pub mod hcs;
pub mod host;
pub mod hvsocket;
pub mod merge;
pub mod uvm;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result, ResultExt};
pub use host::Host;
pub use uvm::{
    clone_from_template, create_wcow, CloneData, Cloneable, TemplateConfig, UtilityVm, UvmOptions,
    UvmOptionsBuilder,
};
