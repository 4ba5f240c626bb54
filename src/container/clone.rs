//! Mounts for containers created in a cloned utility VM

use serde::{Deserialize, Serialize};

use super::ContainerModifier;
use crate::hcs::schema::{resource_paths, MappedDirectory, MappedPipe, ModifySettingRequest, RequestType};
use crate::{Result, ResultExt};

/// Mounts a container would normally have been created with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountsConfig {
    #[serde(default)]
    pub mapped_directories: Vec<MappedDirectory>,
    #[serde(default)]
    pub mapped_pipes: Vec<MappedPipe>,
}

/// Add each mount to a running container, directories before pipes.
///
/// Every mount is a separate request. If one fails the error is returned and
/// the mounts already added stay in place.
pub async fn add_mounts_to_clone(container: &dyn ContainerModifier, mounts: &MountsConfig) -> Result<()> {
    for dir in &mounts.mapped_directories {
        let request = ModifySettingRequest::host(
            RequestType::Add,
            resource_paths::MAPPED_DIRECTORIES,
            Some(serde_json::to_value(dir)?),
        );
        container
            .modify(&request)
            .await
            .with_context(|| format!("failed to add mapped directory {}", dir.host_path))?;
    }

    for pipe in &mounts.mapped_pipes {
        let request = ModifySettingRequest::host(
            RequestType::Add,
            resource_paths::MAPPED_PIPES,
            Some(serde_json::to_value(pipe)?),
        );
        container
            .modify(&request)
            .await
            .with_context(|| format!("failed to add mapped pipe {}", pipe.host_path))?;
    }
    Ok(())
}
