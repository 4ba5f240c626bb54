//! In-memory hosts, systems and sockets for unit tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Notify};

use crate::hcn::EndpointDescriptor;
use crate::hcs::schema::{GuestResourceType, ModifySettingRequest, RequestType};
use crate::hcs::{ComputeSystem, HostComputeService, ProcessorTopology};
use crate::host::Host;
use crate::hvsocket::{GuestStream, HvSocketAcceptor, HvSocketAddr, HvSocketBinder};
use crate::uvm::{CloneData, Cloneable, UtilityVm, UvmOptions};
use crate::{Error, Result};

/// A host with `processors` logical processors and a fake socket binder.
pub fn test_host(processors: u32) -> (Host, Arc<FakeHost>, Arc<FakeBinder>) {
    let compute = Arc::new(FakeHost::new(processors));
    let binder = Arc::new(FakeBinder::default());
    (Host::new(compute.clone(), binder.clone()), compute, binder)
}

/// A VM whose compute system already exists, with no resources attached.
pub async fn created_vm(host: Host, id: &str) -> UtilityVm {
    let mut vm = UtilityVm::new(host, &UvmOptions::builder().id(id).build());
    vm.create("{}").await.unwrap();
    vm
}

/// An image folder with a utility VM and its scratch template disk.
pub fn image_folder(dir: &Path) -> PathBuf {
    let image = dir.join("image");
    std::fs::create_dir_all(image.join("UtilityVM").join("Files")).unwrap();
    std::fs::write(image.join("UtilityVM").join("SystemTemplate.vhdx"), b"template disk").unwrap();
    image
}

pub fn endpoint(id: &str) -> EndpointDescriptor {
    EndpointDescriptor {
        id: id.to_string(),
        name: format!("{}-name", id),
        network_id: "nat".to_string(),
        mac_address: format!("00-15-5D-00-00-{:02X}", id.len()),
        ip_address: Some("172.20.0.2".to_string()),
    }
}

#[derive(Default)]
pub struct FakeHost {
    processors: u32,
    grants: Mutex<Vec<(String, PathBuf)>>,
    fail_grants: AtomicBool,
    fail_creates: AtomicBool,
    systems: Mutex<HashMap<String, Arc<FakeSystem>>>,
    documents: Mutex<HashMap<String, serde_json::Value>>,
}

impl FakeHost {
    pub fn new(processors: u32) -> Self {
        Self {
            processors,
            ..Default::default()
        }
    }

    pub fn grants(&self) -> Vec<(String, PathBuf)> {
        self.grants.lock().clone()
    }

    pub fn fail_grants(&self) {
        self.fail_grants.store(true, Ordering::SeqCst);
    }

    pub fn fail_creates(&self) {
        self.fail_creates.store(true, Ordering::SeqCst);
    }

    pub fn system(&self, id: &str) -> Option<Arc<FakeSystem>> {
        self.systems.lock().get(id).cloned()
    }

    /// Document a system was successfully created with.
    pub fn document(&self, id: &str) -> Option<serde_json::Value> {
        self.documents.lock().get(id).cloned()
    }
}

#[async_trait]
impl HostComputeService for FakeHost {
    async fn create_compute_system(&self, id: &str, document: &str) -> Result<Arc<dyn ComputeSystem>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::Hcs("the virtual machine could not be started".into()));
        }
        let document: serde_json::Value = serde_json::from_str(document)?;
        let system = Arc::new(FakeSystem::new(id));
        self.documents.lock().insert(id.to_string(), document);
        self.systems.lock().insert(id.to_string(), system.clone());
        Ok(system)
    }

    async fn processor_topology(&self) -> Result<ProcessorTopology> {
        Ok(ProcessorTopology {
            logical_processor_count: self.processors,
        })
    }

    async fn grant_vm_access(&self, vm_id: &str, path: &Path) -> Result<()> {
        if self.fail_grants.load(Ordering::SeqCst) {
            return Err(Error::Hcs("access denied".into()));
        }
        self.grants.lock().push((vm_id.to_string(), path.to_path_buf()));
        Ok(())
    }
}

pub struct FakeSystem {
    id: String,
    runtime_id: String,
    calls: Mutex<Vec<&'static str>>,
    requests: Mutex<Vec<ModifySettingRequest>>,
    saved: Mutex<Vec<serde_json::Value>>,
    failing_paths: Mutex<Vec<String>>,
    failing_guest: Mutex<Vec<(GuestResourceType, RequestType)>>,
    held_guest: Mutex<Vec<(GuestResourceType, Arc<Notify>)>>,
    closes: AtomicUsize,
}

impl FakeSystem {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            runtime_id: Self::runtime_id_for(id),
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            saved: Mutex::new(Vec::new()),
            failing_paths: Mutex::new(Vec::new()),
            failing_guest: Mutex::new(Vec::new()),
            held_guest: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn runtime_id_for(id: &str) -> String {
        format!("runtime-{}", id)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Lifecycle calls in order, modify excluded
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// Every modify request received, including rejected ones
    pub fn modify_requests(&self) -> Vec<ModifySettingRequest> {
        self.requests.lock().clone()
    }

    pub fn saved_options(&self) -> Vec<serde_json::Value> {
        self.saved.lock().clone()
    }

    /// Reject modify requests whose resource path starts with `prefix`.
    pub fn fail_path(&self, prefix: &str) {
        self.failing_paths.lock().push(prefix.to_string());
    }

    /// Reject modify requests carrying this guest request.
    pub fn fail_guest_request(&self, resource_type: GuestResourceType, request_type: RequestType) {
        self.failing_guest.lock().push((resource_type, request_type));
    }

    /// Park modify requests carrying a guest request of `resource_type`
    /// until the returned handle is notified. The request is recorded first.
    pub fn hold_guest_request(&self, resource_type: GuestResourceType) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.held_guest.lock().push((resource_type, gate.clone()));
        gate
    }

    fn gate_for(&self, request: &ModifySettingRequest) -> Option<Arc<Notify>> {
        let guest = request.guest_request.as_ref()?;
        self.held_guest
            .lock()
            .iter()
            .find(|(t, _)| *t == guest.resource_type)
            .map(|(_, gate)| gate.clone())
    }

    fn rejects(&self, request: &ModifySettingRequest) -> bool {
        let path_fails = request
            .resource_path
            .as_deref()
            .map(|path| self.failing_paths.lock().iter().any(|p| path.starts_with(p.as_str())))
            .unwrap_or(false);
        let guest_fails = request
            .guest_request
            .as_ref()
            .map(|g| self.failing_guest.lock().contains(&(g.resource_type, g.request_type)))
            .unwrap_or(false);
        path_fails || guest_fails
    }
}

#[async_trait]
impl ComputeSystem for FakeSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    async fn start(&self) -> Result<()> {
        self.calls.lock().push("start");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.calls.lock().push("pause");
        Ok(())
    }

    async fn save(&self, options: &serde_json::Value) -> Result<()> {
        self.calls.lock().push("save");
        self.saved.lock().push(options.clone());
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.calls.lock().push("terminate");
        Ok(())
    }

    async fn modify(&self, request: &ModifySettingRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        if let Some(gate) = self.gate_for(request) {
            gate.notified().await;
        }
        if self.rejects(request) {
            return Err(Error::Hcs(format!(
                "modify rejected for {}",
                request.resource_path.as_deref().unwrap_or("guest request")
            )));
        }
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records bound addresses. Bound sockets never see a guest unless a test dials them.
#[derive(Default)]
pub struct FakeBinder {
    bound: Mutex<Vec<HvSocketAddr>>,
    dialers: Mutex<Vec<FakeDialer>>,
    fail: AtomicBool,
    hang: AtomicBool,
}

impl FakeBinder {
    pub fn bound(&self) -> Vec<HvSocketAddr> {
        self.bound.lock().clone()
    }

    pub fn fail_binds(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Binds never complete.
    pub fn hang_binds(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HvSocketBinder for FakeBinder {
    async fn bind(&self, addr: &HvSocketAddr) -> Result<Box<dyn HvSocketAcceptor>> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::GuestChannel(format!("bind {} failed", addr)));
        }
        let (acceptor, dialer) = FakeAcceptor::new();
        self.bound.lock().push(addr.clone());
        self.dialers.lock().push(dialer);
        Ok(Box::new(acceptor))
    }
}

/// Listening side of an in-memory socket pair
pub struct FakeAcceptor {
    incoming: mpsc::Receiver<DuplexStream>,
}

/// Guest side; each `connect` hands one end of a new pipe to the acceptor
pub struct FakeDialer {
    tx: mpsc::Sender<DuplexStream>,
}

impl FakeAcceptor {
    pub fn new() -> (Self, FakeDialer) {
        let (tx, incoming) = mpsc::channel(4);
        (Self { incoming }, FakeDialer { tx })
    }
}

impl FakeDialer {
    pub async fn connect(&self) -> DuplexStream {
        let (host_side, guest_side) = tokio::io::duplex(4096);
        self.tx.send(host_side).await.unwrap();
        guest_side
    }
}

#[async_trait]
impl HvSocketAcceptor for FakeAcceptor {
    async fn accept(&mut self) -> Result<Box<dyn GuestStream>> {
        match self.incoming.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(Error::GuestChannel("listener closed".into())),
        }
    }
}

/// A template resource that records when it was replayed
#[derive(Debug)]
pub struct FakeResource {
    name: String,
    fail: bool,
    order: Arc<AtomicUsize>,
    replayed_at: Mutex<Option<usize>>,
}

impl FakeResource {
    pub fn new(name: &str, order: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            order,
            replayed_at: Mutex::new(None),
        }
    }

    pub fn failing(name: &str, order: Arc<AtomicUsize>) -> Self {
        Self {
            fail: true,
            ..Self::new(name, order)
        }
    }

    pub fn replayed_at(&self) -> Option<usize> {
        *self.replayed_at.lock()
    }
}

#[async_trait]
impl Cloneable for FakeResource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn replay(&self, _vm: &mut UtilityVm, _data: &mut CloneData<'_>) -> Result<()> {
        if self.fail {
            return Err(Error::ResourceAcquisition(format!("{} is unavailable", self.name)));
        }
        *self.replayed_at.lock() = Some(self.order.fetch_add(1, Ordering::SeqCst));
        Ok(())
    }
}
