//! Utility VM creation options with builder pattern

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::clone::TemplateConfig;
use crate::{Error, Result};

/// Memory sizes are aligned to this many MB before submission.
pub const MEMORY_ALIGNMENT_MB: u64 = 2;

pub const DEFAULT_MEMORY_SIZE_MB: u64 = 1024;

fn default_processor_count() -> u32 {
    match std::thread::available_parallelism() {
        Ok(n) if n.get() == 1 => 1,
        _ => 2,
    }
}

fn default_owner() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

fn default_memory() -> u64 {
    DEFAULT_MEMORY_SIZE_MB
}

fn default_true() -> bool {
    true
}

/// Options for creating a Windows utility VM
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UvmOptions {
    /// Compute system id; generated if empty.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Owner recorded on the compute system; the executable name if empty.
    #[serde(default)]
    pub owner: String,
    #[serde(rename = "MemorySizeInMB", default = "default_memory")]
    pub memory_size_in_mb: u64,
    #[serde(default = "default_true")]
    pub allow_overcommit: bool,
    #[serde(default)]
    pub enable_deferred_commit: bool,
    #[serde(rename = "LowMMIOGapInMB", default)]
    pub low_mmio_gap_in_mb: u64,
    #[serde(rename = "HighMMIOBaseInMB", default)]
    pub high_mmio_base_in_mb: u64,
    #[serde(rename = "HighMMIOGapInMB", default)]
    pub high_mmio_gap_in_mb: u64,
    #[serde(default = "default_processor_count")]
    pub processor_count: u32,
    #[serde(default)]
    pub processor_limit: u32,
    #[serde(default)]
    pub processor_weight: u32,
    #[serde(rename = "StorageQoSIopsMaximum", default)]
    pub storage_qos_iops_maximum: u32,
    #[serde(rename = "StorageQoSBandwidthMaximum", default)]
    pub storage_qos_bandwidth_maximum: u32,
    /// Back every device with physical memory. Incompatible with templating.
    #[serde(default)]
    pub fully_physically_backed: bool,
    /// Skip the in-process guest connection and listen on an HvSocket instead.
    #[serde(default)]
    pub external_guest_connection: bool,
    #[serde(rename = "VSMBNoDirectMap", default)]
    pub vsmb_no_direct_map: bool,
    /// Read-only layers from top-most to base, followed by the scratch folder.
    #[serde(default)]
    pub layer_folders: Vec<PathBuf>,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub is_clone: bool,
    #[serde(skip)]
    pub template_config: Option<Arc<TemplateConfig>>,
    /// JSON merged over the built document before submission.
    #[serde(rename = "AdditionalHCSDocumentJSON", default)]
    pub additional_hcs_document_json: String,
}

impl Default for UvmOptions {
    fn default() -> Self {
        Self {
            id: String::new(),
            owner: String::new(),
            memory_size_in_mb: DEFAULT_MEMORY_SIZE_MB,
            allow_overcommit: true,
            enable_deferred_commit: false,
            low_mmio_gap_in_mb: 0,
            high_mmio_base_in_mb: 0,
            high_mmio_gap_in_mb: 0,
            processor_count: default_processor_count(),
            processor_limit: 0,
            processor_weight: 0,
            storage_qos_iops_maximum: 0,
            storage_qos_bandwidth_maximum: 0,
            fully_physically_backed: false,
            external_guest_connection: false,
            vsmb_no_direct_map: false,
            layer_folders: Vec::new(),
            is_template: false,
            is_clone: false,
            template_config: None,
            additional_hcs_document_json: String::new(),
        }
    }
}

/// Host capacity the options are normalized against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub logical_processor_count: u32,
}

/// Values actually submitted after normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedResources {
    pub processor_count: u32,
    pub memory_size_in_mb: u64,
    pub external_guest_connection: bool,
}

impl UvmOptions {
    pub fn builder() -> UvmOptionsBuilder {
        UvmOptionsBuilder::default()
    }

    /// Fill in the generated id and owner if they were left empty.
    pub fn with_identity(mut self) -> Self {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.owner.is_empty() {
            self.owner = default_owner();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.layer_folders.len() < 2 {
            return Err(Error::InvalidOptions(
                "at least 2 layer folders must be supplied".into(),
            ));
        }
        if self.processor_count < 1 {
            return Err(Error::InvalidOptions("processor count must be at least 1".into()));
        }
        if self.memory_size_in_mb < 1 {
            return Err(Error::InvalidOptions("memory size must be at least 1MB".into()));
        }
        if self.memory_size_in_mb.checked_next_multiple_of(MEMORY_ALIGNMENT_MB).is_none() {
            return Err(Error::InvalidOptions(format!(
                "memory size {}MB cannot be aligned to {}MB",
                self.memory_size_in_mb, MEMORY_ALIGNMENT_MB
            )));
        }
        if self.enable_deferred_commit && !self.allow_overcommit {
            return Err(Error::InvalidOptions(
                "deferred commit requires memory overcommit".into(),
            ));
        }
        if self.is_clone {
            match &self.template_config {
                None => {
                    return Err(Error::InvalidOptions(
                        "template config must be supplied when creating a clone".into(),
                    ))
                }
                Some(template) if template.uvm_id.is_empty() => {
                    return Err(Error::InvalidOptions(
                        "template config has no utility VM id".into(),
                    ))
                }
                Some(_) => {}
            }
        }
        if self.is_template && self.is_clone {
            return Err(Error::InvalidOptions(
                "a utility VM cannot be both a template and a clone".into(),
            ));
        }
        if self.is_template && self.fully_physically_backed {
            return Err(Error::InvalidOptions(
                "a template cannot be fully physically backed".into(),
            ));
        }
        Ok(())
    }

    /// Normalize processor and memory requests against the host.
    ///
    /// Requests above the host's logical processor count are clamped rather
    /// than rejected. Clones always use the external guest connection.
    pub fn resolve(&self, host: &HostCapacity) -> ResolvedResources {
        let mut processor_count = self.processor_count;
        let host_processors = host.logical_processor_count.max(1);
        if processor_count > host_processors {
            tracing::warn!(
                requested = processor_count,
                assigned = host_processors,
                "Requested processor count exceeds host logical processors, clamping"
            );
            processor_count = host_processors;
        }

        // rounds down only when rounding up would overflow, which validate rejects
        let memory_size_in_mb = self
            .memory_size_in_mb
            .checked_next_multiple_of(MEMORY_ALIGNMENT_MB)
            .unwrap_or(self.memory_size_in_mb - self.memory_size_in_mb % MEMORY_ALIGNMENT_MB);
        if memory_size_in_mb != self.memory_size_in_mb {
            tracing::info!(
                requested = self.memory_size_in_mb,
                assigned = memory_size_in_mb,
                "Aligned memory size"
            );
        }

        ResolvedResources {
            processor_count,
            memory_size_in_mb,
            external_guest_connection: self.external_guest_connection || self.is_clone,
        }
    }

    /// Scratch folder, the last layer folder.
    pub fn scratch_folder(&self) -> Option<&PathBuf> {
        self.layer_folders.last()
    }
}

#[derive(Default)]
pub struct UvmOptionsBuilder {
    options: UvmOptions,
}

impl UvmOptionsBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.options.id = id.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.options.owner = owner.into();
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.options.memory_size_in_mb = mb;
        self
    }

    pub fn allow_overcommit(mut self, enabled: bool) -> Self {
        self.options.allow_overcommit = enabled;
        self
    }

    pub fn deferred_commit(mut self, enabled: bool) -> Self {
        self.options.enable_deferred_commit = enabled;
        self
    }

    pub fn mmio(mut self, low_gap_mb: u64, high_base_mb: u64, high_gap_mb: u64) -> Self {
        self.options.low_mmio_gap_in_mb = low_gap_mb;
        self.options.high_mmio_base_in_mb = high_base_mb;
        self.options.high_mmio_gap_in_mb = high_gap_mb;
        self
    }

    pub fn processors(mut self, count: u32) -> Self {
        self.options.processor_count = count;
        self
    }

    pub fn processor_limit(mut self, limit: u32) -> Self {
        self.options.processor_limit = limit;
        self
    }

    pub fn processor_weight(mut self, weight: u32) -> Self {
        self.options.processor_weight = weight;
        self
    }

    pub fn storage_qos(mut self, iops_maximum: u32, bandwidth_maximum: u32) -> Self {
        self.options.storage_qos_iops_maximum = iops_maximum;
        self.options.storage_qos_bandwidth_maximum = bandwidth_maximum;
        self
    }

    pub fn fully_physically_backed(mut self, enabled: bool) -> Self {
        self.options.fully_physically_backed = enabled;
        self
    }

    pub fn external_guest_connection(mut self, enabled: bool) -> Self {
        self.options.external_guest_connection = enabled;
        self
    }

    pub fn vsmb_no_direct_map(mut self, enabled: bool) -> Self {
        self.options.vsmb_no_direct_map = enabled;
        self
    }

    pub fn layer_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.layer_folders.push(path.into());
        self
    }

    pub fn layer_folders<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.options.layer_folders = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn template(mut self) -> Self {
        self.options.is_template = true;
        self
    }

    /// Create the VM by cloning `template`.
    pub fn clone_of(mut self, template: Arc<TemplateConfig>) -> Self {
        self.options.is_clone = true;
        self.options.template_config = Some(template);
        self
    }

    pub fn additional_json(mut self, json: impl Into<String>) -> Self {
        self.options.additional_hcs_document_json = json.into();
        self
    }

    pub fn build(self) -> UvmOptions {
        self.options.with_identity()
    }
}
