//! Host Compute Network control plane
//!
//! Namespaces and endpoints are owned by HCN. This module only describes the
//! operations the provisioning code needs from it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Namespace every clone is seeded with. Per-container attach calls extend it.
pub const CLONING_DEFAULT_NETWORK_NAMESPACE_ID: &str = "89EB8A86-E253-41FD-9800-E6D88EB2E18A";

/// An HCN endpoint as returned by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    #[serde(rename = "ID", alias = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "VirtualNetwork", alias = "HostComputeNetwork", default)]
    pub network_id: String,
    #[serde(rename = "MacAddress", default)]
    pub mac_address: String,
    #[serde(rename = "IPAddress", default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Namespace description handed to the guest when the namespace is attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NamespaceDescriptor {
    pub id: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub resources: Vec<NamespaceResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NamespaceResource {
    #[serde(rename = "Type")]
    pub kind: String,
    pub data: NamespaceResourceEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NamespaceResourceEndpoint {
    pub id: String,
}

impl NamespaceDescriptor {
    pub fn new(id: impl Into<String>, endpoint_ids: &[String]) -> Self {
        Self {
            id: id.into(),
            kind: "HostDefault".to_string(),
            resources: endpoint_ids
                .iter()
                .map(|ep| NamespaceResource {
                    kind: "Endpoint".to_string(),
                    data: NamespaceResourceEndpoint { id: ep.clone() },
                })
                .collect(),
        }
    }
}

/// Operations on namespaces and endpoints owned by the network control plane
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkControlPlane: Send + Sync {
    /// Create a namespace and return its id.
    async fn create_namespace(&self) -> Result<String>;

    async fn remove_namespace(&self, namespace_id: &str) -> Result<()>;

    /// Bind an endpoint into a namespace.
    async fn add_namespace_endpoint(&self, namespace_id: &str, endpoint_id: &str) -> Result<()>;

    async fn remove_namespace_endpoint(&self, namespace_id: &str, endpoint_id: &str) -> Result<()>;

    /// Ids of all endpoints currently bound to a namespace, in control-plane order.
    async fn namespace_endpoints(&self, namespace_id: &str) -> Result<Vec<String>>;

    async fn endpoint_by_id(&self, endpoint_id: &str) -> Result<EndpointDescriptor>;
}

#[cfg(windows)]
pub use self::windows_impl::HcnControlPlane;

#[cfg(windows)]
mod windows_impl {
    use std::ffi::c_void;

    use async_trait::async_trait;
    use serde::Deserialize;
    use windows::core::{GUID, HSTRING, PCWSTR, PWSTR};
    use windows::Win32::System::HostComputeNetwork::*;

    use super::{EndpointDescriptor, NetworkControlPlane};
    use crate::hcs::operation::take_pwstr;
    use crate::{Error, Result};

    fn parse_guid(s: &str) -> Result<GUID> {
        let id = uuid::Uuid::parse_str(s).map_err(|e| Error::Network(format!("invalid GUID '{}': {}", s, e)))?;
        Ok(GUID::from_u128(id.as_u128()))
    }

    fn hcn_error(e: windows::core::Error, record: &mut PWSTR, context: &str) -> Error {
        let detail = take_pwstr(record);
        let err = Error::from_hresult(e.code().0, context);
        if detail.is_empty() {
            err
        } else {
            err.context(detail)
        }
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Error::Network(format!("HCN call did not complete: {}", e)))?
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct NamespaceProperties {
        #[serde(default)]
        resources: Vec<NamespaceResourceRaw>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct NamespaceResourceRaw {
        #[serde(rename = "Type")]
        kind: String,
        data: serde_json::Value,
    }

    fn modify_namespace_endpoint(namespace_id: &str, endpoint_id: &str, request_type: &str) -> Result<()> {
        let id = parse_guid(namespace_id)?;
        let settings = serde_json::json!({
            "ResourceType": "Endpoint",
            "RequestType": request_type,
            "Settings": { "EndpointId": endpoint_id },
        })
        .to_string();

        unsafe {
            let mut namespace: *mut c_void = std::ptr::null_mut();
            let mut record = PWSTR::null();
            HcnOpenNamespace(&id, &mut namespace, Some(&mut record))
                .map_err(|e| hcn_error(e, &mut record, "HcnOpenNamespace"))?;

            let settings = HSTRING::from(settings.as_str());
            let result = HcnModifyNamespace(namespace, PCWSTR(settings.as_ptr()), Some(&mut record))
                .map_err(|e| hcn_error(e, &mut record, "HcnModifyNamespace"));
            let _ = HcnCloseNamespace(namespace);
            result
        }
    }

    /// Network control plane backed by the local HCN service
    #[derive(Debug, Default, Clone)]
    pub struct HcnControlPlane;

    #[async_trait]
    impl NetworkControlPlane for HcnControlPlane {
        async fn create_namespace(&self) -> Result<String> {
            blocking(|| unsafe {
                let id = uuid::Uuid::new_v4();
                let guid = GUID::from_u128(id.as_u128());
                let settings = HSTRING::from(
                    r#"{"SchemaVersion":{"Major":2,"Minor":0},"Type":"HostDefault"}"#,
                );
                let mut namespace: *mut c_void = std::ptr::null_mut();
                let mut record = PWSTR::null();
                HcnCreateNamespace(&guid, PCWSTR(settings.as_ptr()), &mut namespace, Some(&mut record))
                    .map_err(|e| hcn_error(e, &mut record, "HcnCreateNamespace"))?;
                let _ = HcnCloseNamespace(namespace);
                Ok(id.to_string())
            })
            .await
        }

        async fn remove_namespace(&self, namespace_id: &str) -> Result<()> {
            let id = parse_guid(namespace_id)?;
            blocking(move || unsafe {
                let mut record = PWSTR::null();
                HcnDeleteNamespace(&id, Some(&mut record))
                    .map_err(|e| hcn_error(e, &mut record, "HcnDeleteNamespace"))
            })
            .await
        }

        async fn add_namespace_endpoint(&self, namespace_id: &str, endpoint_id: &str) -> Result<()> {
            let (ns, ep) = (namespace_id.to_string(), endpoint_id.to_string());
            blocking(move || modify_namespace_endpoint(&ns, &ep, "Add")).await
        }

        async fn remove_namespace_endpoint(&self, namespace_id: &str, endpoint_id: &str) -> Result<()> {
            let (ns, ep) = (namespace_id.to_string(), endpoint_id.to_string());
            blocking(move || modify_namespace_endpoint(&ns, &ep, "Remove")).await
        }

        async fn namespace_endpoints(&self, namespace_id: &str) -> Result<Vec<String>> {
            let id = parse_guid(namespace_id)?;
            let properties = blocking(move || unsafe {
                let mut namespace: *mut c_void = std::ptr::null_mut();
                let mut record = PWSTR::null();
                HcnOpenNamespace(&id, &mut namespace, Some(&mut record))
                    .map_err(|e| hcn_error(e, &mut record, "HcnOpenNamespace"))?;

                let query = HSTRING::from("{}");
                let mut properties = PWSTR::null();
                let result = HcnQueryNamespaceProperties(
                    namespace,
                    PCWSTR(query.as_ptr()),
                    &mut properties,
                    Some(&mut record),
                )
                .map_err(|e| hcn_error(e, &mut record, "HcnQueryNamespaceProperties"));
                let _ = HcnCloseNamespace(namespace);
                result?;
                Ok(take_pwstr(&mut properties))
            })
            .await?;

            let properties: NamespaceProperties = serde_json::from_str(&properties)?;
            let mut ids = Vec::new();
            for resource in properties.resources.into_iter().filter(|r| r.kind == "Endpoint") {
                let id = resource
                    .data
                    .get("Id")
                    .or_else(|| resource.data.get("ID"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::Network("namespace endpoint resource has no id".into()))?;
                ids.push(id.to_string());
            }
            Ok(ids)
        }

        async fn endpoint_by_id(&self, endpoint_id: &str) -> Result<EndpointDescriptor> {
            let id = parse_guid(endpoint_id)?;
            let properties = blocking(move || unsafe {
                let mut endpoint: *mut c_void = std::ptr::null_mut();
                let mut record = PWSTR::null();
                HcnOpenEndpoint(&id, &mut endpoint, Some(&mut record))
                    .map_err(|e| hcn_error(e, &mut record, "HcnOpenEndpoint"))?;

                let query = HSTRING::from("{}");
                let mut properties = PWSTR::null();
                let result = HcnQueryEndpointProperties(
                    endpoint,
                    PCWSTR(query.as_ptr()),
                    &mut properties,
                    Some(&mut record),
                )
                .map_err(|e| hcn_error(e, &mut record, "HcnQueryEndpointProperties"));
                let _ = HcnCloseEndpoint(endpoint);
                result?;
                Ok(take_pwstr(&mut properties))
            })
            .await?;

            Ok(serde_json::from_str(&properties)?)
        }
    }
}
