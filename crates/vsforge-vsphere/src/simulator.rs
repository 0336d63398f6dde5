//! In-memory [`Platform`] used by tests and dry runs.
//!
//! Mutating calls return a task whose effect is applied to the inventory
//! when the task completes (after the configured delay, measured on the
//! tokio clock). Cancelling a task drops its effect. Every call is recorded
//! in a journal, and the next call of an operation can be made to fail.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::customize::CustomizationSpec;
use crate::error::{VsphereError, VsphereResult};
use crate::platform::Platform;
use crate::types::*;

type Effect = Box<dyn FnOnce(&mut SimState) -> Result<Option<String>, String> + Send>;

struct SimTask {
    info: TaskInfo,
    ready_at: Instant,
    effect: Option<Effect>,
    failure: Option<String>,
}

struct SimVm {
    folder: String,
    datastore: String,
    props: VmProperties,
    off_at: Option<Instant>,
    guest: VecDeque<Vec<String>>,
}

#[derive(Default)]
struct SimState {
    datacenters: Vec<DatacenterSummary>,
    hosts: Vec<HostSummary>,
    networks: Vec<NetworkSummary>,
    datastores: Vec<DatastoreSummary>,
    pools: Vec<ResourcePoolSummary>,
    folders: Vec<FolderSummary>,
    clusters: Vec<ClusterSummary>,
    libraries: Vec<ContentLibrary>,
    items: Vec<LibraryItem>,
    vms: BTreeMap<String, SimVm>,
    tasks: HashMap<String, SimTask>,
    task_delay: Duration,
    shutdown_delay: Duration,
    failures: HashMap<String, VecDeque<String>>,
    calls: Vec<String>,
    files: BTreeSet<String>,
    /// Guest address sequences for VMs that do not exist yet, by name.
    pending_guest: HashMap<String, VecDeque<Vec<String>>>,
    next_id: u64,
    next_key: i32,
    clones: Vec<CloneSpec>,
    creates: Vec<CreateSpec>,
    reconfigs: Vec<(String, VmConfigSpec)>,
    customizations: Vec<(String, CustomizationSpec)>,
    ovf_imports: Vec<OvfLibraryItemSpec>,
    template_imports: Vec<VmTemplateLibrarySpec>,
}

impl SimState {
    fn record(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }

    fn take_failure(&mut self, op: &str) -> Option<String> {
        self.failures.get_mut(op).and_then(|q| q.pop_front())
    }

    fn check(&mut self, op: &str, target: &str) -> VsphereResult<()> {
        self.record(format!("{op} {target}").trim_end().to_string());
        match self.take_failure(op) {
            Some(msg) => Err(VsphereError::api(500, msg)),
            None => Ok(()),
        }
    }

    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn settle_power(&mut self) {
        let now = Instant::now();
        for vm in self.vms.values_mut() {
            if vm.off_at.is_some_and(|at| at <= now) {
                vm.off_at = None;
                vm.props.power_state = VmPowerState::PoweredOff;
            }
        }
    }

    fn vm(&self, id: &str) -> VsphereResult<&SimVm> {
        self.vms
            .get(id)
            .ok_or_else(|| VsphereError::not_found(format!("vm '{id}' not found")))
    }

    fn vm_mut(&mut self, id: &str) -> Result<&mut SimVm, String> {
        self.vms.get_mut(id).ok_or_else(|| format!("vm '{id}' not found"))
    }

    fn folder_path(&self, folder: &str) -> Result<String, String> {
        self.folders
            .iter()
            .find(|f| f.folder == folder)
            .map(|f| f.path.clone())
            .ok_or_else(|| format!("folder '{folder}' not found"))
    }

    fn datastore_name(&self, id: &str) -> Result<String, String> {
        self.datastores
            .iter()
            .find(|d| d.datastore == id)
            .map(|d| d.name.clone())
            .ok_or_else(|| format!("datastore '{id}' not found"))
    }

    fn ensure_unique(&self, name: &str, folder: &str) -> Result<(), String> {
        if self.vms.values().any(|vm| vm.props.name == name && vm.folder == folder) {
            return Err(format!("The name '{name}' already exists."));
        }
        Ok(())
    }

    fn insert_vm(&mut self, folder: String, datastore: String, mut props: VmProperties) -> String {
        props.layout_files = vec![
            format!("[{datastore}] {0}/{0}.vmx", props.name),
            format!("[{datastore}] {0}/{0}.nvram", props.name),
        ];
        let id = self.new_id("vm");
        let guest = self.pending_guest.get(&props.name).cloned().unwrap_or_default();
        self.vms.insert(
            id.clone(),
            SimVm {
                folder,
                datastore,
                props,
                off_at: None,
                guest,
            },
        );
        id
    }
}

fn apply_config(
    props: &mut VmProperties,
    spec: &VmConfigSpec,
    next_key: &mut i32,
    datastore: &str,
) -> Result<(), String> {
    if let Some(name) = &spec.name {
        props.name = name.clone();
    }
    if let Some(a) = &spec.annotation {
        props.annotation = Some(a.clone());
    }
    if let Some(g) = &spec.guest_id {
        props.guest_id = Some(g.clone());
    }
    if let Some(n) = spec.num_cpus {
        props.num_cpus = n;
    }
    if let Some(m) = spec.memory_mb {
        props.memory_mb = m;
    }
    if let Some(f) = &spec.firmware {
        props.firmware = Some(f.clone());
    }
    if let Some(order) = spec.boot_options.as_ref().and_then(|b| b.boot_order.clone()) {
        props.boot_order = order;
    }
    for opt in &spec.extra_config {
        match props.extra_config.iter_mut().find(|o| o.key == opt.key) {
            Some(existing) => existing.value = opt.value.clone(),
            None => props.extra_config.push(opt.clone()),
        }
    }

    if let Some(vapp) = &spec.vapp_config {
        let schema = props
            .vapp_properties
            .as_mut()
            .ok_or_else(|| "VM has no vApp configuration".to_string())?;
        for p in &vapp.properties {
            match p.operation {
                ArrayOperation::Add => schema.push(p.info.clone()),
                ArrayOperation::Edit => {
                    let target = schema
                        .iter_mut()
                        .find(|s| s.key == p.info.key)
                        .ok_or_else(|| format!("vApp property {} not found", p.info.key))?;
                    target.value = p.info.value.clone();
                }
                ArrayOperation::Remove => schema.retain(|s| s.key != p.info.key),
            }
        }
    }

    let mut remap: HashMap<i32, i32> = HashMap::new();
    for change in &spec.device_change {
        if change.operation == DeviceOperation::Add {
            remap.insert(change.device.key, *next_key);
            *next_key += 1;
        }
    }

    for change in &spec.device_change {
        let mut dev = change.device.clone();
        match change.operation {
            DeviceOperation::Add => {
                dev.key = remap[&dev.key];
                if let Some(ck) = dev.controller_key {
                    let ck = *remap.get(&ck).unwrap_or(&ck);
                    if !props.devices.iter().any(|d| d.key == ck) {
                        return Err(format!("controller {ck} not found"));
                    }
                    dev.controller_key = Some(ck);
                }
                if let DeviceKind::Disk { file_name: file_name @ None, .. } = &mut dev.kind {
                    let n = props.devices.iter().filter(|d| d.is_disk()).count();
                    *file_name = Some(format!("[{datastore}] {0}/{0}_{n}.vmdk", props.name));
                }
                props.devices.push(dev);
            }
            DeviceOperation::Edit => {
                let target = props
                    .devices
                    .iter_mut()
                    .find(|d| d.key == dev.key)
                    .ok_or_else(|| format!("device {} not found", dev.key))?;
                if dev.controller_key.is_none() {
                    dev.controller_key = target.controller_key;
                    dev.unit_number = target.unit_number;
                }
                *target = dev;
            }
            DeviceOperation::Remove => props.devices.retain(|d| d.key != dev.key),
        }
    }
    Ok(())
}

pub struct SimulatedPlatform {
    state: Mutex<SimState>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_id: 100,
                next_key: 10_000,
                ..Default::default()
            }),
        }
    }
}

fn device(key: i32, controller: Option<i32>, unit: Option<i32>, label: &str, kind: DeviceKind) -> VirtualDevice {
    VirtualDevice {
        key,
        controller_key: controller,
        unit_number: unit,
        label: label.into(),
        kind,
    }
}

/// Controllers the platform adds to every new VM.
fn default_devices() -> Vec<VirtualDevice> {
    vec![
        device(200, None, None, "IDE 0", DeviceKind::IdeController { bus_number: 0 }),
        device(201, None, None, "IDE 1", DeviceKind::IdeController { bus_number: 1 }),
    ]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// One datacenter with a two-host cluster, a standalone host, two
    /// templates and two content libraries.
    pub fn lab() -> Self {
        let sim = Self::new();
        {
            let mut s = sim.state();
            s.datacenters = vec![DatacenterSummary { datacenter: "datacenter-1".into(), name: "dc1".into() }];
            s.clusters = vec![ClusterSummary { cluster: "domain-c1".into(), name: "cluster1".into() }];
            s.hosts = vec![
                HostSummary {
                    host: "host-1".into(),
                    name: "esxi-01".into(),
                    cluster: Some("domain-c1".into()),
                    networks: strings(&["network-1", "dvportgroup-11"]),
                    datastores: strings(&["datastore-1"]),
                },
                HostSummary {
                    host: "host-2".into(),
                    name: "esxi-02".into(),
                    cluster: Some("domain-c1".into()),
                    networks: strings(&["network-1", "dvportgroup-12"]),
                    datastores: strings(&["datastore-1"]),
                },
                HostSummary {
                    host: "host-3".into(),
                    name: "esxi-solo".into(),
                    cluster: None,
                    networks: strings(&["network-3"]),
                    datastores: strings(&["datastore-2"]),
                },
            ];
            s.networks = vec![
                NetworkSummary {
                    network: "network-1".into(),
                    name: "VM Network".into(),
                    path: Some("VM Network".into()),
                    network_type: Some("STANDARD_PORTGROUP".into()),
                    hosts: strings(&["host-1", "host-2"]),
                },
                NetworkSummary {
                    network: "dvportgroup-11".into(),
                    name: "dvs-prod".into(),
                    path: Some("dvs-a/dvs-prod".into()),
                    network_type: Some("DISTRIBUTED_PORTGROUP".into()),
                    hosts: strings(&["host-1"]),
                },
                NetworkSummary {
                    network: "dvportgroup-12".into(),
                    name: "dvs-prod".into(),
                    path: Some("dvs-b/dvs-prod".into()),
                    network_type: Some("DISTRIBUTED_PORTGROUP".into()),
                    hosts: strings(&["host-2"]),
                },
                NetworkSummary {
                    network: "network-3".into(),
                    name: "solo-net".into(),
                    path: Some("solo-net".into()),
                    network_type: Some("STANDARD_PORTGROUP".into()),
                    hosts: strings(&["host-3"]),
                },
            ];
            s.datastores = vec![
                DatastoreSummary { datastore: "datastore-1".into(), name: "datastore1".into(), free_space: None, capacity: None },
                DatastoreSummary { datastore: "datastore-2".into(), name: "solo-ds".into(), free_space: None, capacity: None },
            ];
            s.pools = vec![
                ResourcePoolSummary { resource_pool: "resgroup-1".into(), name: "Resources".into(), owner: Some("domain-c1".into()), root: true },
                ResourcePoolSummary { resource_pool: "resgroup-2".into(), name: "pool-a".into(), owner: Some("domain-c1".into()), root: false },
                ResourcePoolSummary { resource_pool: "resgroup-3".into(), name: "Resources".into(), owner: Some("host-3".into()), root: true },
            ];
            s.folders = vec![
                FolderSummary { folder: "group-v1".into(), name: "vm".into(), path: String::new() },
                FolderSummary { folder: "group-v2".into(), name: "templates".into(), path: "templates".into() },
            ];
            s.libraries = vec![
                ContentLibrary { id: "lib-1".into(), name: "lib-local".into(), lib_type: Some("LOCAL".into()), datastore: Some("datastore-1".into()) },
                ContentLibrary { id: "lib-2".into(), name: "lib-sub".into(), lib_type: Some("SUBSCRIBED".into()), datastore: Some("datastore-1".into()) },
            ];
            s.items = vec![LibraryItem {
                id: "item-1".into(),
                name: "ubuntu-iso".into(),
                library_id: Some("lib-1".into()),
                item_type: Some("iso".into()),
                files: strings(&["ubuntu.iso"]),
            }];

            let ide = default_devices();

            let mut ubuntu = vec![
                device(
                    1000,
                    None,
                    None,
                    "SCSI controller 0",
                    DeviceKind::ScsiController { bus_number: 0, controller_type: ScsiControllerType::Pvscsi },
                ),
                device(
                    2000,
                    Some(1000),
                    Some(0),
                    "Hard disk 1",
                    DeviceKind::Disk {
                        capacity_kb: 2 * 1024 * 1024,
                        thin_provisioned: true,
                        eagerly_scrub: false,
                        file_name: Some("[datastore1] ubuntu-template/ubuntu-template.vmdk".into()),
                    },
                ),
                device(
                    4000,
                    None,
                    None,
                    "Network adapter 1",
                    DeviceKind::Ethernet {
                        adapter_type: AdapterType::Vmxnet3,
                        network: "network-1".into(),
                        mac_address: Some("00:50:56:11:22:33".into()),
                        address_type: MacAddressType::Assigned,
                        upt_compatibility_enabled: None,
                    },
                ),
                device(500, None, None, "Video card", DeviceKind::VideoCard { video_ram_kb: 4096 }),
            ];
            ubuntu.extend(ide.iter().cloned());
            let ubuntu_props = VmProperties {
                name: "ubuntu-template".into(),
                power_state: VmPowerState::PoweredOff,
                guest_id: Some("ubuntu64Guest".into()),
                num_cpus: 2,
                memory_mb: 2048,
                firmware: Some("bios".into()),
                devices: ubuntu,
                current_snapshot: Some("snapshot-1".into()),
                vapp_properties: Some(vec![
                    VAppProperty {
                        key: 0,
                        id: "hostname".into(),
                        value: String::new(),
                        default_value: "ubuntuguest".into(),
                        user_configurable: true,
                    },
                    VAppProperty {
                        key: 1,
                        id: "password".into(),
                        value: String::new(),
                        default_value: String::new(),
                        user_configurable: false,
                    },
                ]),
                ..Default::default()
            };

            let mut bare = vec![
                device(
                    1000,
                    None,
                    None,
                    "SCSI controller 0",
                    DeviceKind::ScsiController { bus_number: 0, controller_type: ScsiControllerType::LsiLogic },
                ),
                device(
                    2000,
                    Some(1000),
                    Some(0),
                    "Hard disk 1",
                    DeviceKind::Disk {
                        capacity_kb: 1024 * 1024,
                        thin_provisioned: false,
                        eagerly_scrub: false,
                        file_name: Some("[datastore1] bare-template/bare-template.vmdk".into()),
                    },
                ),
                device(500, None, None, "Video card", DeviceKind::VideoCard { video_ram_kb: 4096 }),
            ];
            bare.extend(ide.iter().cloned());
            let bare_props = VmProperties {
                name: "bare-template".into(),
                power_state: VmPowerState::PoweredOff,
                guest_id: Some("otherGuest64".into()),
                num_cpus: 1,
                memory_mb: 1024,
                devices: bare,
                ..Default::default()
            };

            for (id, props) in [("vm-1", ubuntu_props), ("vm-2", bare_props)] {
                let name = props.name.clone();
                s.vms.insert(
                    id.into(),
                    SimVm {
                        folder: "templates".into(),
                        datastore: "datastore1".into(),
                        props: VmProperties {
                            layout_files: vec![
                                format!("[datastore1] {name}/{name}.vmx"),
                                format!("[datastore1] {name}/{name}.vmdk"),
                            ],
                            ..props
                        },
                        off_at: None,
                        guest: VecDeque::new(),
                    },
                );
            }
        }
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Test controls ───────────────────────────────────────────────

    /// Tasks complete this long after they are started.
    pub fn set_task_delay(&self, delay: Duration) {
        self.state().task_delay = delay;
    }

    /// A guest shutdown powers the VM off after this delay.
    pub fn set_shutdown_delay(&self, delay: Duration) {
        self.state().shutdown_delay = delay;
    }

    /// Make the next call of `op` fail with `message`. Task operations return
    /// a task that fails; other operations return an API error.
    pub fn fail_next(&self, op: &str, message: &str) {
        self.state()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn vm_id(&self, name: &str) -> Option<String> {
        self.state()
            .vms
            .iter()
            .find(|(_, vm)| vm.props.name == name)
            .map(|(id, _)| id.clone())
    }

    pub fn set_power_state(&self, name: &str, state: VmPowerState) {
        let mut s = self.state();
        if let Some(vm) = s.vms.values_mut().find(|vm| vm.props.name == name) {
            vm.props.power_state = state;
        }
    }

    pub fn mount_datastore(&self, host: &str, datastore: &str) {
        let mut s = self.state();
        if let Some(h) = s.hosts.iter_mut().find(|h| h.name == host) {
            h.datastores.push(datastore.to_string());
        }
    }

    /// Addresses returned by successive guest polls; the last entry repeats.
    /// VMs created later under the same name start from the same sequence.
    pub fn set_guest_addresses(&self, name: &str, sequence: Vec<Vec<&str>>) {
        let mut s = self.state();
        let guest: VecDeque<Vec<String>> = sequence.into_iter().map(|a| strings(&a)).collect();
        if let Some(vm) = s.vms.values_mut().find(|vm| vm.props.name == name) {
            vm.guest = guest.clone();
        }
        s.pending_guest.insert(name.to_string(), guest);
    }

    pub fn last_clone(&self) -> Option<CloneSpec> {
        self.state().clones.last().cloned()
    }

    pub fn creates(&self) -> Vec<CreateSpec> {
        self.state().creates.clone()
    }

    pub fn reconfigurations(&self, vm: &str) -> Vec<VmConfigSpec> {
        self.state()
            .reconfigs
            .iter()
            .filter(|(id, _)| id == vm)
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn customizations(&self, vm: &str) -> Vec<CustomizationSpec> {
        self.state()
            .customizations
            .iter()
            .filter(|(id, _)| id == vm)
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn ovf_imports(&self) -> Vec<OvfLibraryItemSpec> {
        self.state().ovf_imports.clone()
    }

    pub fn template_imports(&self) -> Vec<VmTemplateLibrarySpec> {
        self.state().template_imports.clone()
    }

    /// Datastore files as `[datastore] path`.
    pub fn files(&self) -> Vec<String> {
        self.state().files.iter().cloned().collect()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn start_task(&self, op: &str, target: &str, effect: Effect) -> VsphereResult<TaskRef> {
        let mut s = self.state();
        s.record(format!("{op} {target}"));
        let failure = s.take_failure(op);
        let id = s.new_id("task");
        let ready_at = Instant::now() + s.task_delay;
        let task = TaskRef(id.clone());
        s.tasks.insert(
            id,
            SimTask {
                info: TaskInfo {
                    task: task.clone(),
                    status: TaskStatus::Running,
                    description: Some(op.to_string()),
                    result: None,
                    error: None,
                    progress: Some(0),
                    cancelable: true,
                },
                ready_at,
                effect: Some(effect),
                failure,
            },
        );
        Ok(task)
    }

    fn list<T: Clone>(&self, op: &str, target: &str, pick: impl FnOnce(&SimState) -> Vec<T>) -> VsphereResult<Vec<T>> {
        let mut s = self.state();
        s.check(op, target)?;
        Ok(pick(&*s))
    }
}

#[async_trait]
impl Platform for SimulatedPlatform {
    async fn list_datacenters(&self) -> VsphereResult<Vec<DatacenterSummary>> {
        self.list("list_datacenters", "", |s| s.datacenters.clone())
    }

    async fn list_vms(&self, datacenter: &str) -> VsphereResult<Vec<VmSummary>> {
        self.list("list_vms", datacenter, |s| {
            s.vms
                .iter()
                .map(|(id, vm)| VmSummary {
                    vm: id.clone(),
                    name: vm.props.name.clone(),
                    power_state: vm.props.power_state,
                    folder: Some(vm.folder.clone()),
                })
                .collect()
        })
    }

    async fn list_hosts(&self, datacenter: &str) -> VsphereResult<Vec<HostSummary>> {
        self.list("list_hosts", datacenter, |s| s.hosts.clone())
    }

    async fn list_networks(&self, datacenter: &str) -> VsphereResult<Vec<NetworkSummary>> {
        self.list("list_networks", datacenter, |s| s.networks.clone())
    }

    async fn list_datastores(&self, datacenter: &str) -> VsphereResult<Vec<DatastoreSummary>> {
        self.list("list_datastores", datacenter, |s| s.datastores.clone())
    }

    async fn list_resource_pools(&self, datacenter: &str) -> VsphereResult<Vec<ResourcePoolSummary>> {
        self.list("list_resource_pools", datacenter, |s| s.pools.clone())
    }

    async fn list_folders(&self, datacenter: &str) -> VsphereResult<Vec<FolderSummary>> {
        self.list("list_folders", datacenter, |s| s.folders.clone())
    }

    async fn list_clusters(&self, datacenter: &str) -> VsphereResult<Vec<ClusterSummary>> {
        self.list("list_clusters", datacenter, |s| s.clusters.clone())
    }

    async fn list_libraries(&self) -> VsphereResult<Vec<ContentLibrary>> {
        self.list("list_libraries", "", |s| s.libraries.clone())
    }

    async fn list_library_items(&self, library_id: &str) -> VsphereResult<Vec<LibraryItem>> {
        self.list("list_library_items", library_id, |s| {
            s.items
                .iter()
                .filter(|i| i.library_id.as_deref() == Some(library_id))
                .cloned()
                .collect()
        })
    }

    async fn vm_properties(&self, vm: &str) -> VsphereResult<VmProperties> {
        let mut s = self.state();
        s.settle_power();
        Ok(s.vm(vm)?.props.clone())
    }

    async fn guest_ip_addresses(&self, vm: &str) -> VsphereResult<Vec<String>> {
        let mut s = self.state();
        s.settle_power();
        let sim_vm = s
            .vms
            .get_mut(vm)
            .ok_or_else(|| VsphereError::not_found(format!("vm '{vm}' not found")))?;
        if sim_vm.props.power_state != VmPowerState::PoweredOn {
            return Ok(Vec::new());
        }
        if sim_vm.guest.len() > 1 {
            return Ok(sim_vm.guest.pop_front().unwrap_or_default());
        }
        Ok(sim_vm.guest.front().cloned().unwrap_or_default())
    }

    async fn clone_vm(&self, spec: &CloneSpec) -> VsphereResult<TaskRef> {
        self.state().clones.push(spec.clone());
        let spec = spec.clone();
        let target = spec.name.clone();
        self.start_task(
            "clone_vm",
            &target,
            Box::new(move |s: &mut SimState| {
                let folder = s.folder_path(&spec.folder)?;
                s.ensure_unique(&spec.name, &folder)?;
                let source = s.vms.get(&spec.source).ok_or_else(|| format!("vm '{}' not found", spec.source))?;
                let datastore = match &spec.location.datastore {
                    Some(id) => s.datastore_name(id)?,
                    None => source.datastore.clone(),
                };
                let mut props = VmProperties {
                    name: spec.name.clone(),
                    power_state: if spec.power_on { VmPowerState::PoweredOn } else { VmPowerState::PoweredOff },
                    template: false,
                    current_snapshot: None,
                    ..source.props.clone()
                };
                let mut next_key = s.next_key;
                apply_config(&mut props, &spec.config, &mut next_key, &datastore)?;
                s.next_key = next_key;
                Ok(Some(s.insert_vm(folder, datastore, props)))
            }),
        )
    }

    async fn create_vm(&self, spec: &CreateSpec) -> VsphereResult<TaskRef> {
        self.state().creates.push(spec.clone());
        let spec = spec.clone();
        let target = spec.config.name.clone().unwrap_or_default();
        self.start_task(
            "create_vm",
            &target,
            Box::new(move |s: &mut SimState| {
                let folder = s.folder_path(&spec.folder)?;
                let name = spec.config.name.clone().ok_or("create spec has no name")?;
                s.ensure_unique(&name, &folder)?;
                let datastore = spec
                    .config
                    .vm_path_name
                    .as_deref()
                    .map(|p| p.trim_matches(|c| c == '[' || c == ']' || c == ' ').to_string())
                    .ok_or("create spec has no VM path")?;
                let mut props = VmProperties {
                    power_state: VmPowerState::PoweredOff,
                    devices: default_devices(),
                    ..Default::default()
                };
                let mut next_key = s.next_key;
                apply_config(&mut props, &spec.config, &mut next_key, &datastore)?;
                s.next_key = next_key;
                Ok(Some(s.insert_vm(folder, datastore, props)))
            }),
        )
    }

    async fn reconfigure_vm(&self, vm: &str, spec: &VmConfigSpec) -> VsphereResult<TaskRef> {
        self.state().reconfigs.push((vm.to_string(), spec.clone()));
        let spec = spec.clone();
        let id = vm.to_string();
        self.start_task(
            "reconfigure_vm",
            vm,
            Box::new(move |s: &mut SimState| {
                let mut next_key = s.next_key;
                let sim_vm = s.vm_mut(&id)?;
                let datastore = sim_vm.datastore.clone();
                apply_config(&mut sim_vm.props, &spec, &mut next_key, &datastore)?;
                s.next_key = next_key;
                Ok(None)
            }),
        )
    }

    async fn customize_vm(&self, vm: &str, spec: &CustomizationSpec) -> VsphereResult<TaskRef> {
        self.state().customizations.push((vm.to_string(), spec.clone()));
        let id = vm.to_string();
        self.start_task(
            "customize_vm",
            vm,
            Box::new(move |s: &mut SimState| {
                if s.vm_mut(&id)?.props.power_state != VmPowerState::PoweredOff {
                    return Err("The operation is not allowed in the current state.".into());
                }
                Ok(None)
            }),
        )
    }

    async fn power_on_vm(&self, vm: &str) -> VsphereResult<TaskRef> {
        let id = vm.to_string();
        self.start_task(
            "power_on_vm",
            vm,
            Box::new(move |s: &mut SimState| {
                let sim_vm = s.vm_mut(&id)?;
                if sim_vm.props.template {
                    return Err("The attempted operation cannot be performed in the current state (template).".into());
                }
                sim_vm.props.power_state = VmPowerState::PoweredOn;
                sim_vm.off_at = None;
                Ok(None)
            }),
        )
    }

    async fn power_off_vm(&self, vm: &str) -> VsphereResult<TaskRef> {
        let id = vm.to_string();
        self.start_task(
            "power_off_vm",
            vm,
            Box::new(move |s: &mut SimState| {
                let sim_vm = s.vm_mut(&id)?;
                sim_vm.props.power_state = VmPowerState::PoweredOff;
                sim_vm.off_at = None;
                Ok(None)
            }),
        )
    }

    async fn destroy_vm(&self, vm: &str) -> VsphereResult<TaskRef> {
        let id = vm.to_string();
        self.start_task(
            "destroy_vm",
            vm,
            Box::new(move |s: &mut SimState| {
                if s.vm_mut(&id)?.props.power_state == VmPowerState::PoweredOn {
                    return Err("The attempted operation cannot be performed in the current state (Powered on).".into());
                }
                s.vms.remove(&id);
                Ok(None)
            }),
        )
    }

    async fn create_snapshot(&self, vm: &str, spec: &SnapshotSpec) -> VsphereResult<TaskRef> {
        let id = vm.to_string();
        let name = spec.name.clone();
        self.start_task(
            "create_snapshot",
            vm,
            Box::new(move |s: &mut SimState| {
                s.vm_mut(&id)?;
                let snapshot = s.new_id("snapshot");
                s.vm_mut(&id)?.props.current_snapshot = Some(snapshot.clone());
                log::debug!("simulated snapshot '{name}' as {snapshot}");
                Ok(Some(snapshot))
            }),
        )
    }

    async fn shutdown_guest(&self, vm: &str) -> VsphereResult<()> {
        let mut s = self.state();
        s.check("shutdown_guest", vm)?;
        let at = Instant::now() + s.shutdown_delay;
        let sim_vm = s
            .vms
            .get_mut(vm)
            .ok_or_else(|| VsphereError::not_found(format!("vm '{vm}' not found")))?;
        if sim_vm.props.power_state != VmPowerState::PoweredOn {
            return Err(VsphereError::api(
                400,
                "The attempted operation cannot be performed in the current state (Powered off).",
            ));
        }
        sim_vm.off_at = Some(at);
        Ok(())
    }

    async fn mark_as_template(&self, vm: &str) -> VsphereResult<()> {
        let mut s = self.state();
        s.check("mark_as_template", vm)?;
        s.settle_power();
        let sim_vm = s
            .vms
            .get_mut(vm)
            .ok_or_else(|| VsphereError::not_found(format!("vm '{vm}' not found")))?;
        if sim_vm.props.power_state != VmPowerState::PoweredOff {
            return Err(VsphereError::api(400, "The VM must be powered off to be marked as a template."));
        }
        sim_vm.props.template = true;
        Ok(())
    }

    async fn create_ovf_library_item(&self, spec: &OvfLibraryItemSpec) -> VsphereResult<String> {
        let mut s = self.state();
        s.check("create_ovf_library_item", &spec.name)?;
        s.ovf_imports.push(spec.clone());
        if let Some(id) = &spec.library_item_id {
            let item = s
                .items
                .iter_mut()
                .find(|i| &i.id == id)
                .ok_or_else(|| VsphereError::not_found(format!("library item '{id}' not found")))?;
            item.files = vec![format!("{}.ovf", spec.name)];
            return Ok(id.clone());
        }
        let id = s.new_id("item");
        s.items.push(LibraryItem {
            id: id.clone(),
            name: spec.name.clone(),
            library_id: Some(spec.library_id.clone()),
            item_type: Some("ovf".into()),
            files: vec![format!("{}.ovf", spec.name)],
        });
        Ok(id)
    }

    async fn create_template_library_item(&self, spec: &VmTemplateLibrarySpec) -> VsphereResult<String> {
        let mut s = self.state();
        s.check("create_template_library_item", &spec.name)?;
        s.template_imports.push(spec.clone());
        let id = s.new_id("item");
        s.items.push(LibraryItem {
            id: id.clone(),
            name: spec.name.clone(),
            library_id: Some(spec.library_id.clone()),
            item_type: Some("vm-template".into()),
            files: Vec::new(),
        });
        Ok(id)
    }

    async fn task_info(&self, task: &TaskRef) -> VsphereResult<TaskInfo> {
        let mut s = self.state();
        s.settle_power();
        let mut entry = s
            .tasks
            .remove(&task.0)
            .ok_or_else(|| VsphereError::not_found(format!("task '{task}' not found")))?;

        if entry.info.status == TaskStatus::Running && Instant::now() >= entry.ready_at {
            let outcome = match (entry.failure.take(), entry.effect.take()) {
                (Some(msg), _) => Err(msg),
                (None, Some(effect)) => effect(&mut *s),
                (None, None) => Ok(None),
            };
            match outcome {
                Ok(result) => {
                    entry.info.status = TaskStatus::Succeeded;
                    entry.info.progress = Some(100);
                    entry.info.result = result.map(serde_json::Value::String);
                }
                Err(msg) => {
                    entry.info.status = TaskStatus::Failed;
                    entry.info.error = Some(serde_json::Value::String(msg));
                }
            }
        }

        let info = entry.info.clone();
        s.tasks.insert(task.0.clone(), entry);
        Ok(info)
    }

    async fn cancel_task(&self, task: &TaskRef) -> VsphereResult<()> {
        let mut s = self.state();
        s.check("cancel_task", &task.0)?;
        if let Some(entry) = s.tasks.get_mut(&task.0) {
            if entry.info.status == TaskStatus::Running {
                entry.effect = None;
                entry.info.status = TaskStatus::Failed;
                entry.info.error = Some(serde_json::Value::String("The task was canceled by a user.".into()));
            }
        }
        Ok(())
    }

    async fn upload_file(&self, dst: &DatastoreFile, src: &Path, host: Option<&str>) -> VsphereResult<()> {
        let target = match host {
            Some(h) => format!("{dst} via {h}"),
            None => dst.to_string(),
        };
        self.state().check("upload_file", &target)?;
        tokio::fs::metadata(src).await?;
        self.state().files.insert(dst.to_string());
        Ok(())
    }

    async fn delete_file(&self, file: &DatastoreFile) -> VsphereResult<()> {
        let mut s = self.state();
        s.check("delete_file", &file.to_string())?;
        if !s.files.remove(&file.to_string()) {
            return Err(VsphereError::not_found(format!("File {file} was not found")));
        }
        Ok(())
    }

    async fn file_exists(&self, file: &DatastoreFile) -> VsphereResult<bool> {
        Ok(self.state().files.contains(&file.to_string()))
    }

    async fn make_directory(&self, dir: &DatastoreFile) -> VsphereResult<()> {
        let mut s = self.state();
        s.check("make_directory", &dir.to_string())?;
        s.files.insert(format!("{}/", dir));
        Ok(())
    }

    async fn logout(&self) -> VsphereResult<()> {
        self.state().record("logout");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_delay_tasks_finish_on_first_poll() {
        let sim = SimulatedPlatform::lab();
        let task = sim.power_on_vm("vm-2").await.unwrap();
        let info = sim.task_info(&task).await.unwrap();
        assert_eq!(info.status, TaskStatus::Succeeded);
        assert_eq!(sim.vm_properties("vm-2").await.unwrap().power_state, VmPowerState::PoweredOn);
    }

    #[tokio::test]
    async fn cancelled_task_has_no_effect() {
        let sim = SimulatedPlatform::lab();
        sim.set_task_delay(Duration::from_secs(3600));
        let task = sim.destroy_vm("vm-2").await.unwrap();
        sim.cancel_task(&task).await.unwrap();
        assert_eq!(sim.task_info(&task).await.unwrap().status, TaskStatus::Failed);
        assert!(sim.vm_id("bare-template").is_some());
    }

    #[tokio::test]
    async fn injected_failure_on_list() {
        let sim = SimulatedPlatform::lab();
        sim.fail_next("list_hosts", "boom");
        assert!(sim.list_hosts("datacenter-1").await.is_err());
        assert!(sim.list_hosts("datacenter-1").await.is_ok());
    }

    #[tokio::test]
    async fn reconfigure_remaps_pending_keys() {
        let sim = SimulatedPlatform::lab();
        let spec = VmConfigSpec {
            device_change: vec![
                DeviceChange {
                    operation: DeviceOperation::Add,
                    file_operation: None,
                    device: device(-200, None, None, "", DeviceKind::SataController { bus_number: 0 }),
                },
                DeviceChange {
                    operation: DeviceOperation::Add,
                    file_operation: None,
                    device: device(-201, Some(-200), Some(0), "", DeviceKind::Cdrom { iso_file: None, connected: false }),
                },
            ],
            ..Default::default()
        };
        let task = sim.reconfigure_vm("vm-2", &spec).await.unwrap();
        assert_eq!(sim.task_info(&task).await.unwrap().status, TaskStatus::Succeeded);
        let devices = sim.vm_properties("vm-2").await.unwrap().devices;
        let sata = devices.iter().find(|d| matches!(d.kind, DeviceKind::SataController { .. })).unwrap();
        let cdrom = devices.iter().find(|d| d.is_cdrom()).unwrap();
        assert!(sata.key > 0);
        assert_eq!(cdrom.controller_key, Some(sata.key));
    }
}
