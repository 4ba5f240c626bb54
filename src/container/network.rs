//! Network namespaces for containers

use serde::{Deserialize, Serialize};

use super::resources::{ContainerResource, NetworkEndpoints, Resources};
use crate::hcn::{EndpointDescriptor, NamespaceDescriptor, NetworkControlPlane};
use crate::uvm::UtilityVm;
use crate::{Result, ResultExt};

/// Network section of a container's configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSpec {
    /// Endpoints to bind, in order
    #[serde(default)]
    pub endpoint_list: Vec<String>,
}

/// Create a namespace for a container and bind its endpoints into it.
///
/// The namespace is recorded on `resources` as soon as it exists. If a bind
/// fails the error is returned as is; endpoints already bound are not
/// unbound here and the endpoint record is not added.
#[tracing::instrument(skip_all, fields(container_id = %container_id))]
pub async fn create_network_namespace(
    net: &dyn NetworkControlPlane,
    container_id: &str,
    spec: &NetworkSpec,
    resources: &mut Resources,
) -> Result<()> {
    let namespace_id = net.create_namespace().await?;
    tracing::info!(netns_id = %namespace_id, "Created network namespace for container");
    resources.net_ns = Some(namespace_id.clone());
    resources.created_net_ns = true;

    let mut endpoints = Vec::with_capacity(spec.endpoint_list.len());
    for endpoint_id in &spec.endpoint_list {
        net.add_namespace_endpoint(&namespace_id, endpoint_id).await?;
        tracing::info!(netns_id = %namespace_id, endpoint_id = %endpoint_id, "Added network endpoint to namespace");
        endpoints.push(endpoint_id.clone());
    }

    resources.add(ContainerResource::NetworkEndpoints(NetworkEndpoints::new(
        namespace_id,
        endpoints,
    )));
    Ok(())
}

/// Resolve every endpoint currently bound to a namespace.
pub async fn get_namespace_endpoints(
    net: &dyn NetworkControlPlane,
    namespace_id: &str,
) -> Result<Vec<EndpointDescriptor>> {
    let ids = net
        .namespace_endpoints(namespace_id)
        .await
        .with_context(|| format!("failed to list endpoints of namespace {}", namespace_id))?;

    let mut endpoints = Vec::with_capacity(ids.len());
    for id in ids {
        let endpoint = net
            .endpoint_by_id(&id)
            .await
            .with_context(|| format!("failed to get endpoint {}", id))?;
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}

/// Attach a namespace and all of its endpoints into a running VM.
///
/// If the endpoints cannot be attached the namespace is removed from the VM
/// again. A failure to remove it is only logged; the endpoint error is what
/// the caller gets.
#[tracing::instrument(skip_all, fields(uvm_id = %vm.id(), netns_id = %namespace_id))]
pub async fn setup_network_namespace(net: &dyn NetworkControlPlane, vm: &UtilityVm, namespace_id: &str) -> Result<()> {
    let endpoints = get_namespace_endpoints(net, namespace_id).await?;
    let endpoint_ids: Vec<String> = endpoints.iter().map(|e| e.id.clone()).collect();

    vm.add_net_ns(&NamespaceDescriptor::new(namespace_id, &endpoint_ids))
        .await
        .context("unable to add network namespace inside UVM")?;
    tracing::debug!("Network namespace attached");

    if let Err(e) = vm.add_endpoints_to_ns(namespace_id, &endpoints).await {
        if let Err(remove_err) = vm.remove_net_ns(namespace_id).await {
            tracing::warn!(error = %remove_err, "Failed to remove network namespace after endpoint failure");
        } else {
            tracing::debug!("Network namespace removed after endpoint failure");
        }
        return Err(e.context("unable to add endpoints inside UVM"));
    }

    tracing::debug!(endpoints = endpoints.len(), "Network namespace endpoints attached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcn::MockNetworkControlPlane;
    use crate::testutil::{created_vm, endpoint, test_host};
    use crate::Error;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn spec(endpoints: &[&str]) -> NetworkSpec {
        NetworkSpec {
            endpoint_list: endpoints.iter().map(|e| e.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_create_records_namespace_and_endpoints() {
        let mut net = MockNetworkControlPlane::new();
        let mut seq = Sequence::new();
        net.expect_create_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok("ns1".to_string()));
        for ep in ["A", "B"] {
            net.expect_add_namespace_endpoint()
                .with(eq("ns1"), eq(ep))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let mut resources = Resources::new("c1");
        create_network_namespace(&net, "c1", &spec(&["A", "B"]), &mut resources)
            .await
            .unwrap();

        assert_eq!(resources.net_ns.as_deref(), Some("ns1"));
        assert!(resources.created_net_ns);
        assert_eq!(
            resources.resources(),
            &[ContainerResource::NetworkEndpoints(NetworkEndpoints::new(
                "ns1",
                vec!["A".to_string(), "B".to_string()]
            ))]
        );
    }

    #[tokio::test]
    async fn test_create_failure_does_not_unbind() {
        let mut net = MockNetworkControlPlane::new();
        net.expect_create_namespace().returning(|| Ok("ns1".to_string()));
        net.expect_add_namespace_endpoint()
            .with(eq("ns1"), eq("A"))
            .times(1)
            .returning(|_, _| Ok(()));
        net.expect_add_namespace_endpoint()
            .with(eq("ns1"), eq("B"))
            .times(1)
            .returning(|_, _| Err(Error::Network("endpoint B is in use".into())));
        net.expect_remove_namespace_endpoint().times(0);
        net.expect_remove_namespace().times(0);

        let mut resources = Resources::new("c1");
        let err = create_network_namespace(&net, "c1", &spec(&["A", "B"]), &mut resources)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("endpoint B is in use"));
        assert_eq!(resources.net_ns.as_deref(), Some("ns1"));
        assert!(resources.created_net_ns);
        assert!(resources.resources().is_empty());
    }

    #[tokio::test]
    async fn test_get_namespace_endpoints_resolves_in_order() {
        let mut net = MockNetworkControlPlane::new();
        net.expect_namespace_endpoints()
            .with(eq("ns1"))
            .returning(|_| Ok(vec!["ep2".to_string(), "ep1".to_string()]));
        net.expect_endpoint_by_id().returning(|id| Ok(endpoint(id)));

        let endpoints = get_namespace_endpoints(&net, "ns1").await.unwrap();
        let ids: Vec<_> = endpoints.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["ep2", "ep1"]);
    }

    #[tokio::test]
    async fn test_setup_attaches_namespace_and_endpoints() {
        let (host, _, _) = test_host(4);
        let vm = created_vm(host, "uvm").await;

        let mut net = MockNetworkControlPlane::new();
        net.expect_namespace_endpoints()
            .returning(|_| Ok(vec!["ep1".to_string(), "ep2".to_string()]));
        net.expect_endpoint_by_id().returning(|id| Ok(endpoint(id)));

        setup_network_namespace(&net, &vm, "ns1").await.unwrap();

        let info = vm.namespace_info("ns1").await.unwrap();
        assert_eq!(info.nics.len(), 2);
        assert!(info.nics.contains_key("ep1"));
    }

    #[tokio::test]
    async fn test_setup_rolls_back_namespace_on_endpoint_failure() {
        let (host, fake, _) = test_host(4);
        let vm = created_vm(host, "uvm").await;
        let system = fake.system("uvm").unwrap();
        system.fail_path("VirtualMachine/Devices/NetworkAdapters");

        let mut net = MockNetworkControlPlane::new();
        net.expect_namespace_endpoints().returning(|_| Ok(vec!["ep1".to_string()]));
        net.expect_endpoint_by_id().returning(|id| Ok(endpoint(id)));

        let err = setup_network_namespace(&net, &vm, "ns1").await.unwrap_err();
        assert!(err.to_string().starts_with("unable to add endpoints inside UVM"));
        assert!(vm.network_namespaces().await.is_empty());

        let last = system.modify_requests().pop().unwrap();
        let guest = last.guest_request.unwrap();
        assert_eq!(guest.resource_type, crate::hcs::schema::GuestResourceType::NetworkNamespace);
        assert_eq!(guest.request_type, crate::hcs::schema::RequestType::Remove);
    }

    #[tokio::test]
    async fn test_setup_returns_endpoint_error_when_rollback_fails() {
        let (host, fake, _) = test_host(4);
        let vm = created_vm(host, "uvm").await;
        let system = fake.system("uvm").unwrap();
        system.fail_path("VirtualMachine/Devices/NetworkAdapters");
        system.fail_guest_request(
            crate::hcs::schema::GuestResourceType::NetworkNamespace,
            crate::hcs::schema::RequestType::Remove,
        );

        let mut net = MockNetworkControlPlane::new();
        net.expect_namespace_endpoints().returning(|_| Ok(vec!["ep1".to_string()]));
        net.expect_endpoint_by_id().returning(|id| Ok(endpoint(id)));

        let err = setup_network_namespace(&net, &vm, "ns1").await.unwrap_err();
        assert!(err.to_string().starts_with("unable to add endpoints inside UVM"));
        assert!(err.to_string().contains("endpoint ep1"));
        assert!(!err.to_string().contains("remove network namespace"));
        assert_eq!(vm.network_namespaces().await, vec!["ns1".to_string()]);
    }

    #[tokio::test]
    async fn test_setup_fails_before_attach_when_lookup_fails() {
        let (host, fake, _) = test_host(4);
        let vm = created_vm(host, "uvm").await;

        let mut net = MockNetworkControlPlane::new();
        net.expect_namespace_endpoints()
            .returning(|_| Err(Error::NotFound("namespace ns1".into())));

        assert!(setup_network_namespace(&net, &vm, "ns1").await.is_err());
        assert!(fake.system("uvm").unwrap().modify_requests().is_empty());
    }
}
