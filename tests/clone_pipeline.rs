//! Template and clone lifecycle against an in-memory host

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use hcs_uvm::container::{self, ContainerResource, NetworkSpec, Resources};
use hcs_uvm::hcn::{EndpointDescriptor, NetworkControlPlane, CLONING_DEFAULT_NETWORK_NAMESPACE_ID};
use hcs_uvm::hcs::schema::ModifySettingRequest;
use hcs_uvm::hcs::{ComputeSystem, HostComputeService, ProcessorTopology};
use hcs_uvm::hvsocket::{HvSocketAcceptor, HvSocketAddr, HvSocketBinder, GuestStream};
use hcs_uvm::{create_wcow, Error, Host, Result, UvmOptions};

#[derive(Default)]
struct MemoryHost {
    documents: Mutex<HashMap<String, serde_json::Value>>,
    systems: Mutex<HashMap<String, Arc<MemorySystem>>>,
}

#[async_trait]
impl HostComputeService for MemoryHost {
    async fn create_compute_system(&self, id: &str, document: &str) -> Result<Arc<dyn ComputeSystem>> {
        self.documents
            .lock()
            .insert(id.to_string(), serde_json::from_str(document)?);
        let system = Arc::new(MemorySystem {
            id: id.to_string(),
            runtime_id: uuid::Uuid::new_v4().to_string(),
            log: Mutex::new(Vec::new()),
        });
        self.systems.lock().insert(id.to_string(), system.clone());
        Ok(system)
    }

    async fn processor_topology(&self) -> Result<ProcessorTopology> {
        Ok(ProcessorTopology {
            logical_processor_count: 8,
        })
    }

    async fn grant_vm_access(&self, _vm_id: &str, _path: &Path) -> Result<()> {
        Ok(())
    }
}

struct MemorySystem {
    id: String,
    runtime_id: String,
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl ComputeSystem for MemorySystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    async fn start(&self) -> Result<()> {
        self.log.lock().push("start".into());
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.log.lock().push("pause".into());
        Ok(())
    }

    async fn save(&self, _options: &serde_json::Value) -> Result<()> {
        self.log.lock().push("save".into());
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.log.lock().push("terminate".into());
        Ok(())
    }

    async fn modify(&self, request: &ModifySettingRequest) -> Result<()> {
        self.log.lock().push(serde_json::to_string(request)?);
        Ok(())
    }

    fn close(&self) {}
}

#[derive(Default)]
struct MemoryBinder {
    bound: Mutex<Vec<HvSocketAddr>>,
}

struct IdleAcceptor;

#[async_trait]
impl HvSocketAcceptor for IdleAcceptor {
    async fn accept(&mut self) -> Result<Box<dyn GuestStream>> {
        std::future::pending().await
    }
}

#[async_trait]
impl HvSocketBinder for MemoryBinder {
    async fn bind(&self, addr: &HvSocketAddr) -> Result<Box<dyn HvSocketAcceptor>> {
        self.bound.lock().push(addr.clone());
        Ok(Box::new(IdleAcceptor))
    }
}

/// Namespaces and endpoints kept in maps
#[derive(Default)]
struct MemoryNetwork {
    namespaces: Mutex<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl NetworkControlPlane for MemoryNetwork {
    async fn create_namespace(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.namespaces.lock().insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn remove_namespace(&self, namespace_id: &str) -> Result<()> {
        self.namespaces
            .lock()
            .remove(namespace_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(namespace_id.to_string()))
    }

    async fn add_namespace_endpoint(&self, namespace_id: &str, endpoint_id: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock();
        let endpoints = namespaces
            .get_mut(namespace_id)
            .ok_or_else(|| Error::NotFound(namespace_id.to_string()))?;
        endpoints.push(endpoint_id.to_string());
        Ok(())
    }

    async fn remove_namespace_endpoint(&self, namespace_id: &str, endpoint_id: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock();
        let endpoints = namespaces
            .get_mut(namespace_id)
            .ok_or_else(|| Error::NotFound(namespace_id.to_string()))?;
        endpoints.retain(|e| e != endpoint_id);
        Ok(())
    }

    async fn namespace_endpoints(&self, namespace_id: &str) -> Result<Vec<String>> {
        self.namespaces
            .lock()
            .get(namespace_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(namespace_id.to_string()))
    }

    async fn endpoint_by_id(&self, endpoint_id: &str) -> Result<EndpointDescriptor> {
        Ok(EndpointDescriptor {
            id: endpoint_id.to_string(),
            name: endpoint_id.to_string(),
            network_id: "nat".to_string(),
            mac_address: "00-15-5D-AA-BB-CC".to_string(),
            ip_address: None,
        })
    }
}

fn image(dir: &Path) -> PathBuf {
    let image = dir.join("image");
    std::fs::create_dir_all(image.join("UtilityVM").join("Files")).unwrap();
    std::fs::write(image.join("UtilityVM").join("SystemTemplate.vhdx"), b"base").unwrap();
    image
}

#[tokio::test]
async fn test_template_to_clone() {
    let tmp = tempfile::tempdir().unwrap();
    let image = image(tmp.path());
    let shared = tmp.path().join("shared");
    std::fs::create_dir_all(&shared).unwrap();

    let compute = Arc::new(MemoryHost::default());
    let binder = Arc::new(MemoryBinder::default());
    let host = Host::new(compute.clone(), binder.clone());
    let net = MemoryNetwork::default();

    // template with a share, a device and a container namespace
    let template_opts = UvmOptions::builder()
        .id("tmpl")
        .template()
        .layer_folders([image.clone(), tmp.path().join("tmpl-scratch")])
        .build();
    let template = create_wcow(&host, template_opts).await.unwrap();
    let share = template
        .add_vsmb(&shared, template.default_vsmb_options(true))
        .await
        .unwrap();
    template.assign_device(r"PCI\VEN_1414&DEV_008E", 0).await.unwrap();

    let mut resources = Resources::new("c1");
    let spec = NetworkSpec {
        endpoint_list: vec!["ep1".to_string()],
    };
    container::create_network_namespace(&net, "c1", &spec, &mut resources)
        .await
        .unwrap();
    let namespace_id = resources.net_ns.clone().unwrap();
    container::setup_network_namespace(&net, &template, &namespace_id)
        .await
        .unwrap();
    resources.added_net_ns_to_vm = true;

    template.save_as_template().await.unwrap();
    let config = Arc::new(template.generate_template_config().await.unwrap());
    assert_eq!(config.uvm_id, "tmpl");
    assert_eq!(config.resources.len(), 4);

    // clone
    let clone_scratch = tmp.path().join("clone-scratch");
    let clone_opts = UvmOptions::builder()
        .id("clone")
        .layer_folders([image, clone_scratch.clone()])
        .clone_of(config)
        .build();
    let clone = create_wcow(&host, clone_opts).await.unwrap();
    assert!(clone.is_clone());

    let doc = compute.documents.lock().get("clone").cloned().unwrap();
    let vm = &doc["VirtualMachine"];
    assert_eq!(vm["RestoreState"]["TemplateSystemId"], "tmpl");
    assert!(vm.get("GuestConnection").is_none());
    let shares = vm["Devices"]["VirtualSmb"]["Shares"].as_array().unwrap();
    assert!(shares.iter().any(|s| s["Name"] == share.name.as_str()));
    assert_eq!(vm["Devices"]["VirtualPci"].as_object().unwrap().len(), 1);
    assert!(clone_scratch.join("clone-mount-0-0").join("sandbox.vhdx").is_file());

    let mut namespaces = clone.network_namespaces().await;
    namespaces.sort();
    let mut expected = vec![CLONING_DEFAULT_NETWORK_NAMESPACE_ID.to_string(), namespace_id.clone()];
    expected.sort();
    assert_eq!(namespaces, expected);

    assert_eq!(binder.bound.lock().len(), 1);
    assert_eq!(clone.guest_listener_addr().unwrap().vm_id, clone.runtime_id());

    // tear the container down on the template
    resources.release(&net, Some(&template)).await.unwrap();
    assert!(resources.resources().is_empty());
    assert!(template.network_namespaces().await.is_empty());
    assert!(net.namespaces.lock().is_empty());

    let log = compute.systems.lock().get("tmpl").unwrap().log.lock().clone();
    assert!(log.iter().position(|l| l == "pause") < log.iter().position(|l| l == "save"));
}

#[tokio::test]
async fn test_release_tolerates_vanished_namespace() {
    let net = MemoryNetwork::default();
    let mut resources = Resources::new("c2");
    container::create_network_namespace(&net, "c2", &NetworkSpec::default(), &mut resources)
        .await
        .unwrap();
    assert!(resources.created_net_ns);
    assert!(matches!(
        resources.resources(),
        [ContainerResource::NetworkEndpoints(_)]
    ));

    // already gone on the control plane side
    net.namespaces.lock().clear();
    resources.release(&net, None).await.unwrap();
    assert!(resources.resources().is_empty());
}
