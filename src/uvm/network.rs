//! Network namespaces and adapters inside a utility VM

use std::collections::BTreeMap;

use crate::hcn::{EndpointDescriptor, NamespaceDescriptor};
use crate::hcs::schema::{
    resource_paths, GuestRequest, GuestResourceType, ModifySettingRequest, NetworkAdapter, RequestType,
};
use crate::{Error, Result, ResultExt};

use super::UtilityVm;

/// A network adapter backing one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    /// Adapter id inside the VM
    pub id: String,
    pub endpoint: EndpointDescriptor,
}

/// A namespace attached to the VM, with its adapters keyed by endpoint id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub nics: BTreeMap<String, NicInfo>,
}

fn network_request(request_type: RequestType, nic_id: &str, endpoint: &EndpointDescriptor) -> Result<GuestRequest> {
    Ok(GuestRequest {
        resource_type: GuestResourceType::Network,
        request_type,
        settings: Some(serde_json::json!({
            "AdapterId": nic_id,
            "RequestType": request_type,
            "Settings": serde_json::to_value(endpoint)?,
        })),
    })
}

fn namespace_request(request_type: RequestType, namespace: &NamespaceDescriptor) -> Result<ModifySettingRequest> {
    Ok(ModifySettingRequest::guest(GuestRequest {
        resource_type: GuestResourceType::NetworkNamespace,
        request_type,
        settings: Some(serde_json::to_value(namespace)?),
    }))
}

impl UtilityVm {
    /// Create `namespace` inside the guest.
    pub async fn add_net_ns(&self, namespace: &NamespaceDescriptor) -> Result<()> {
        let mut namespaces = self.namespaces.lock().await;
        if namespaces.contains_key(&namespace.id) {
            return Err(Error::NetNsAlreadyAttached(namespace.id.clone()));
        }

        self.modify(&namespace_request(RequestType::Add, namespace)?)
            .await
            .with_context(|| format!("failed to add network namespace {}", namespace.id))?;

        namespaces.insert(namespace.id.clone(), NamespaceInfo::default());
        tracing::info!(uvm_id = %self.id, netns_id = %namespace.id, "Added network namespace");
        Ok(())
    }

    /// Add an adapter for each endpoint to an attached namespace.
    ///
    /// Endpoints that already have an adapter are skipped.
    pub async fn add_endpoints_to_ns(&self, namespace_id: &str, endpoints: &[EndpointDescriptor]) -> Result<()> {
        let mut namespaces = self.namespaces.lock().await;
        let ns = namespaces
            .get_mut(namespace_id)
            .ok_or_else(|| Error::NetNsNotFound(namespace_id.to_string()))?;

        for endpoint in endpoints {
            if ns.nics.contains_key(&endpoint.id) {
                continue;
            }
            let nic_id = uuid::Uuid::new_v4().to_string();
            self.add_nic(&nic_id, endpoint).await.with_context(|| {
                format!("failed to add endpoint {} to namespace {}", endpoint.id, namespace_id)
            })?;
            ns.nics.insert(
                endpoint.id.clone(),
                NicInfo {
                    id: nic_id,
                    endpoint: endpoint.clone(),
                },
            );
        }
        Ok(())
    }

    /// Remove the adapters for `endpoints` from a namespace.
    pub async fn remove_endpoints_from_ns(&self, namespace_id: &str, endpoints: &[EndpointDescriptor]) -> Result<()> {
        let mut namespaces = self.namespaces.lock().await;
        let ns = namespaces
            .get_mut(namespace_id)
            .ok_or_else(|| Error::NetNsNotFound(namespace_id.to_string()))?;

        for endpoint in endpoints {
            if let Some(nic) = ns.nics.get(&endpoint.id) {
                self.remove_nic(&nic.id, &nic.endpoint).await?;
                ns.nics.remove(&endpoint.id);
            }
        }
        Ok(())
    }

    /// Remove a namespace and all of its adapters. A namespace that is not
    /// attached is ignored.
    pub async fn remove_net_ns(&self, namespace_id: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock().await;
        let Some(ns) = namespaces.get_mut(namespace_id) else {
            return Ok(());
        };

        while let Some((endpoint_id, nic)) = ns.nics.pop_first() {
            if let Err(e) = self.remove_nic(&nic.id, &nic.endpoint).await {
                ns.nics.insert(endpoint_id, nic);
                return Err(e);
            }
        }

        let descriptor = NamespaceDescriptor::new(namespace_id, &[]);
        self.modify(&namespace_request(RequestType::Remove, &descriptor)?)
            .await
            .with_context(|| format!("failed to remove network namespace {}", namespace_id))?;

        namespaces.remove(namespace_id);
        tracing::info!(uvm_id = %self.id, netns_id = %namespace_id, "Removed network namespace");
        Ok(())
    }

    /// Ids of attached namespaces
    pub async fn network_namespaces(&self) -> Vec<String> {
        self.namespaces.lock().await.keys().cloned().collect()
    }

    pub async fn namespace_info(&self, namespace_id: &str) -> Option<NamespaceInfo> {
        self.namespaces.lock().await.get(namespace_id).cloned()
    }

    async fn add_nic(&self, nic_id: &str, endpoint: &EndpointDescriptor) -> Result<()> {
        // the guest prepares the adapter before the host hot-adds it
        self.modify(&ModifySettingRequest::guest(network_request(
            RequestType::PreAdd,
            nic_id,
            endpoint,
        )?))
        .await?;

        let adapter = NetworkAdapter {
            endpoint_id: endpoint.id.clone(),
            mac_address: endpoint.mac_address.clone(),
        };
        let request = ModifySettingRequest::host(
            RequestType::Add,
            resource_paths::network_adapter(nic_id),
            Some(serde_json::to_value(adapter)?),
        )
        .with_guest_request(network_request(RequestType::Add, nic_id, endpoint)?);
        self.modify(&request).await?;

        tracing::debug!(uvm_id = %self.id, endpoint_id = %endpoint.id, nic_id, "Added network adapter");
        Ok(())
    }

    async fn remove_nic(&self, nic_id: &str, endpoint: &EndpointDescriptor) -> Result<()> {
        let request = ModifySettingRequest::host(RequestType::Remove, resource_paths::network_adapter(nic_id), None)
            .with_guest_request(network_request(RequestType::Remove, nic_id, endpoint)?);
        self.modify(&request)
            .await
            .with_context(|| format!("failed to remove network adapter for endpoint {}", endpoint.id))
    }
}
