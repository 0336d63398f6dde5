//! VM lifecycle driver.
//!
//! [`VirtualMachine`] is a capability-scoped accessor: it holds the session
//! and the platform ID and re-reads every property on demand. Mutations are
//! submitted as one platform task each and awaited before returning.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::customize::CustomizationSpec;
use crate::devices::{
    assign_storage, boot_order, find_disk, find_network_adapter, usb_controller, DeviceChangeSet, DiskSpec, NicSpec,
};
use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::ipwait::{self, AddressSource, IpWaitOutcome, IpWaitPolicy};
use crate::platform::Platform;
use crate::session::Session;
use crate::task::wait_for_task;
use crate::types::*;
use crate::vapp::merge_properties;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ── Requests ────────────────────────────────────────────────────────

/// Where and how to clone a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneRequest {
    pub name: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub resource_pool: String,
    #[serde(default)]
    pub datastore: String,
    #[serde(default)]
    pub linked_clone: bool,
    /// Rebinds the first network adapter when set.
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub annotation: String,
    #[serde(default)]
    pub vapp_properties: HashMap<String, String>,
    /// Extra controllers and disks added on top of the template's.
    #[serde(default)]
    pub disk_controller_types: Vec<String>,
    #[serde(default)]
    pub storage: Vec<DiskSpec>,
}

/// A VM built from scratch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub resource_pool: String,
    #[serde(default)]
    pub datastore: String,
    #[serde(default)]
    pub guest_os_type: String,
    /// Virtual hardware version; 0 leaves the platform default.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub annotation: String,
    #[serde(default)]
    pub disk_controller_types: Vec<String>,
    #[serde(default)]
    pub storage: Vec<DiskSpec>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub usb_controllers: Vec<String>,
}

/// CPU / memory / firmware / display settings applied by [`VirtualMachine::configure`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HardwareSpec {
    #[serde(default, rename = "CPUs")]
    pub cpus: i32,
    #[serde(default)]
    pub cpu_cores: i32,
    #[serde(default, rename = "CPU_reservation")]
    pub cpu_reservation: i64,
    #[serde(default, rename = "CPU_limit")]
    pub cpu_limit: i64,
    #[serde(default, rename = "RAM")]
    pub ram: i64,
    #[serde(default, rename = "RAM_reservation")]
    pub ram_reservation: i64,
    #[serde(default, rename = "RAM_reserve_all")]
    pub ram_reserve_all: bool,
    #[serde(default, rename = "NestedHV")]
    pub nested_hv: bool,
    #[serde(default, rename = "CPU_hot_plug")]
    pub cpu_hot_add: bool,
    #[serde(default, rename = "RAM_hot_plug")]
    pub memory_hot_add: bool,
    #[serde(default)]
    pub video_ram: i64,
    #[serde(default)]
    pub vgpu_profile: String,
    /// "", "bios", "efi" or "efi-secure"
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub force_bios_setup: bool,
}

impl HardwareSpec {
    pub fn validate(&self) -> Vec<VsphereError> {
        let mut errs = Vec::new();
        if self.ram_reservation > 0 && self.ram_reserve_all {
            errs.push(VsphereError::config(
                "'RAM_reservation' and 'RAM_reserve_all' cannot be used together",
            ));
        }
        if !matches!(self.firmware.as_str(), "" | "bios" | "efi" | "efi-secure") {
            errs.push(VsphereError::config(
                "'firmware' must be '', 'bios', 'efi' or 'efi-secure'",
            ));
        }
        errs
    }
}

// ── VirtualMachine ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct VirtualMachine {
    session: Arc<Session>,
    id: String,
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine").field("id", &self.id).finish()
    }
}

#[async_trait::async_trait]
impl AddressSource for VirtualMachine {
    async fn guest_addresses(&self) -> VsphereResult<Vec<String>> {
        self.session.platform().guest_ip_addresses(&self.id).await
    }
}

impl VirtualMachine {
    pub(crate) fn new(session: Arc<Session>, id: &str) -> Self {
        Self {
            session,
            id: id.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn properties(&self) -> VsphereResult<VmProperties> {
        self.session.platform().vm_properties(&self.id).await
    }

    pub async fn name(&self) -> VsphereResult<String> {
        Ok(self.properties().await?.name)
    }

    pub async fn devices(&self) -> VsphereResult<Vec<VirtualDevice>> {
        Ok(self.properties().await?.devices)
    }

    pub async fn floppy_devices(&self) -> VsphereResult<Vec<VirtualDevice>> {
        Ok(self.devices().await?.into_iter().filter(|d| d.is_floppy()).collect())
    }

    pub async fn is_template(&self) -> VsphereResult<bool> {
        Ok(self.properties().await?.template)
    }

    pub async fn is_powered_off(&self) -> VsphereResult<bool> {
        Ok(self.properties().await?.power_state == VmPowerState::PoweredOff)
    }

    /// VM home directory relative to its datastore.
    pub async fn get_dir(&self) -> VsphereResult<String> {
        let props = self.properties().await?;
        let vmx = format!("/{}.vmx", props.name);
        props
            .layout_files
            .iter()
            .find(|f| f.ends_with(&vmx))
            .map(|f| {
                let dir = f.trim_end_matches(&vmx);
                crate::cdrom::remove_datastore_prefix(dir)
            })
            .ok_or_else(|| {
                VsphereError::not_found(format!("cannot find the directory of VM '{}'", props.name))
            })
    }

    // ── Task plumbing ───────────────────────────────────────────────

    async fn await_task(&self, op: &str, task: VsphereResult<TaskRef>, cancel: &CancellationToken) -> VsphereResult<TaskInfo> {
        let result = match task {
            Ok(task) => wait_for_task(self.session.platform(), &task, cancel).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| e.context(op, &self.id))
    }

    pub(crate) async fn reconfigure(&self, op: &str, spec: &VmConfigSpec) -> VsphereResult<()> {
        log::debug!("reconfiguring {} ({op})", self.id);
        let task = self.session.platform().reconfigure_vm(&self.id, spec).await;
        self.await_task(op, task, self.session.cancel_token()).await?;
        Ok(())
    }

    // ── Clone / configure ───────────────────────────────────────────

    /// Clone this template into a new VM.
    pub async fn clone_vm(&self, req: &CloneRequest) -> VsphereResult<VirtualMachine> {
        let session = &self.session;
        let folder = session
            .find_folder(&req.folder)
            .await
            .map_err(|e| e.context("clone", &req.name))?;
        let pool = session
            .find_resource_pool(&req.cluster, &req.host, &req.resource_pool)
            .await
            .map_err(|e| e.context("clone", &req.name))?;
        let datastore = if req.datastore.is_empty() {
            None
        } else {
            Some(
                session
                    .find_datastore(&req.datastore, &req.host)
                    .await
                    .map_err(|e| e.context("clone", &req.name))?
                    .datastore,
            )
        };
        let host = if req.host.is_empty() {
            None
        } else {
            Some(
                session
                    .find_host(&req.host)
                    .await
                    .map_err(|e| e.context("clone", &req.name))?
                    .host,
            )
        };

        let props = self.properties().await.map_err(|e| e.context("clone", &req.name))?;

        let mut location = RelocateSpec {
            pool: pool.resource_pool,
            datastore,
            host,
            disk_move_type: None,
        };
        let mut snapshot = None;
        if req.linked_clone {
            let current = props.current_snapshot.clone().ok_or_else(|| {
                VsphereError::new(
                    VsphereErrorKind::NoSnapshot,
                    "`linked_clone=true`, but template has no snapshots",
                )
                .context("clone", &req.name)
            })?;
            location.disk_move_type = Some(DiskMoveType::CreateNewChildDiskBacking);
            snapshot = Some(current);
        }

        let mut devices = DeviceChangeSet::new();
        if !req.network.is_empty() {
            let network = session
                .find_network(&req.network, &req.host)
                .await
                .map_err(|e| e.context("clone", &req.name))?;
            let mut adapter = find_network_adapter(&props.devices).map_err(|e| e.context("clone", &req.name))?;
            if let DeviceKind::Ethernet {
                network: backing,
                mac_address,
                address_type,
                ..
            } = &mut adapter.kind
            {
                *backing = network.network.clone();
                if !req.mac_address.is_empty() {
                    *mac_address = Some(req.mac_address.clone());
                    *address_type = MacAddressType::Manual;
                }
            }
            devices.edit(adapter);
        }
        if !req.storage.is_empty() {
            devices.append(
                assign_storage(&req.disk_controller_types, &req.storage)
                    .map_err(|e| e.context("clone", &req.name))?,
            );
        }

        let vapp_config = merge_properties(props.vapp_properties.as_deref(), &req.vapp_properties)
            .map_err(|e| e.context("clone", &req.name))?;

        let config = VmConfigSpec {
            annotation: (!req.annotation.is_empty()).then(|| req.annotation.clone()),
            device_change: devices
                .resolve(&props.devices)
                .map_err(|e| e.context("clone", &req.name))?,
            vapp_config,
            ..Default::default()
        };

        let spec = CloneSpec {
            source: self.id.clone(),
            name: req.name.clone(),
            folder: folder.folder,
            location,
            snapshot,
            power_on: false,
            config,
        };

        log::info!("cloning {} into '{}'", props.name, req.name);
        let task = session.platform().clone_vm(&spec).await;
        let info = self.await_task("clone", task, session.cancel_token()).await?;
        let id = info
            .result_id()
            .ok_or_else(|| VsphereError::parse(format!("clone of '{}' returned no VM reference", req.name)))?;
        Ok(session.vm(&id))
    }

    pub async fn configure(&self, hw: &HardwareSpec) -> VsphereResult<()> {
        if let Some(err) = hw.validate().into_iter().next() {
            return Err(err);
        }

        let mut spec = VmConfigSpec {
            num_cpus: (hw.cpus > 0).then_some(hw.cpus),
            num_cores_per_socket: (hw.cpu_cores > 0).then_some(hw.cpu_cores),
            memory_mb: (hw.ram > 0).then_some(hw.ram),
            cpu_allocation: Some(ResourceAllocation {
                reservation: Some(hw.cpu_reservation),
                limit: (hw.cpu_limit != 0).then_some(hw.cpu_limit),
            }),
            memory_allocation: Some(ResourceAllocation {
                reservation: Some(hw.ram_reservation),
                limit: None,
            }),
            memory_reservation_locked_to_max: Some(hw.ram_reserve_all),
            nested_hv_enabled: Some(hw.nested_hv),
            cpu_hot_add_enabled: Some(hw.cpu_hot_add),
            memory_hot_add_enabled: Some(hw.memory_hot_add),
            ..Default::default()
        };

        // Sent for every firmware value, never left to the template.
        let secure_boot = hw.firmware == "efi-secure";
        match hw.firmware.as_str() {
            "" => {}
            "efi-secure" => spec.firmware = Some("efi".into()),
            other => spec.firmware = Some(other.to_string()),
        }
        spec.boot_options = Some(BootOptions {
            enter_bios_setup: Some(hw.force_bios_setup),
            efi_secure_boot_enabled: Some(secure_boot),
            ..Default::default()
        });

        if hw.video_ram > 0 || !hw.vgpu_profile.is_empty() {
            let devices = self.devices().await?;
            let mut set = DeviceChangeSet::new();

            if hw.video_ram > 0 {
                let cards: Vec<&VirtualDevice> = devices
                    .iter()
                    .filter(|d| matches!(d.kind, DeviceKind::VideoCard { .. }))
                    .collect();
                let [card] = cards.as_slice() else {
                    return Err(VsphereError::new(
                        VsphereErrorKind::DeviceState,
                        format!("expected exactly one video card, found {}", cards.len()),
                    )
                    .context("configure", &self.id));
                };
                let mut card = (*card).clone();
                card.kind = DeviceKind::VideoCard { video_ram_kb: hw.video_ram };
                set.edit(card);
            }

            if !hw.vgpu_profile.is_empty() {
                let vgpus: Vec<&VirtualDevice> = devices.iter().filter(|d| d.is_vgpu()).collect();
                let profile = Some(hw.vgpu_profile.clone());
                match vgpus.as_slice() {
                    [] => {
                        set.add(VirtualDevice::new(DeviceKind::PciPassthrough { vgpu_profile: profile }));
                    }
                    [existing] => {
                        let mut dev = (*existing).clone();
                        dev.kind = DeviceKind::PciPassthrough { vgpu_profile: profile };
                        set.edit(dev);
                    }
                    _ => {
                        return Err(VsphereError::ambiguous(format!(
                            "VM has {} vGPU devices; unable to pick one to edit",
                            vgpus.len()
                        ))
                        .context("configure", &self.id))
                    }
                }
            }
            spec.device_change = set.resolve(&devices)?;
        }

        self.reconfigure("configure", &spec).await
    }

    pub async fn resize_disk(&self, capacity_kb: i64) -> VsphereResult<()> {
        let mut disk = find_disk(&self.devices().await?).map_err(|e| e.context("resize disk", &self.id))?;
        if let DeviceKind::Disk { capacity_kb: cap, .. } = &mut disk.kind {
            *cap = capacity_kb;
        }
        let mut set = DeviceChangeSet::new();
        set.edit(disk);
        let spec = VmConfigSpec {
            device_change: set.resolve(&[])?,
            ..Default::default()
        };
        self.reconfigure("resize disk", &spec).await
    }

    pub async fn customize(&self, spec: &CustomizationSpec) -> VsphereResult<()> {
        log::info!("customizing guest of {}", self.id);
        let task = self.session.platform().customize_vm(&self.id, spec).await;
        self.await_task("customize", task, self.session.cancel_token()).await?;
        Ok(())
    }

    /// Write extraConfig entries and tools settings. Skipped when both are empty.
    pub async fn add_config_params(
        &self,
        params: &BTreeMap<String, String>,
        tools: Option<&ToolsConfig>,
    ) -> VsphereResult<()> {
        if params.is_empty() && tools.is_none() {
            return Ok(());
        }
        let spec = VmConfigSpec {
            extra_config: params
                .iter()
                .map(|(k, v)| OptionValue {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect(),
            tools: tools.cloned(),
            ..Default::default()
        };
        self.reconfigure("add configuration parameters", &spec).await
    }

    pub async fn set_boot_order(&self, order: &[String]) -> VsphereResult<()> {
        let devices = self.devices().await?;
        let spec = VmConfigSpec {
            boot_options: Some(BootOptions {
                boot_order: Some(boot_order(&devices, order)),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.reconfigure("set boot order", &spec).await
    }

    /// Publish SSH public keys through the `public-keys` vApp property.
    pub async fn add_public_keys(&self, keys: &str) -> VsphereResult<()> {
        let props = self.properties().await?;
        let overrides = HashMap::from([("public-keys".to_string(), keys.to_string())]);
        let vapp_config = merge_properties(props.vapp_properties.as_deref(), &overrides)
            .map_err(|e| e.context("add public keys", &props.name))?;
        let spec = VmConfigSpec {
            vapp_config,
            ..Default::default()
        };
        self.reconfigure("add public keys", &spec).await
    }

    // ── Power ───────────────────────────────────────────────────────

    pub async fn power_on(&self) -> VsphereResult<()> {
        log::info!("powering on {}", self.id);
        let task = self.session.platform().power_on_vm(&self.id).await;
        self.await_task("power on", task, self.session.cancel_token()).await?;
        Ok(())
    }

    /// Hard power-off. A VM that is already off is left alone.
    /// Not cancellable: this runs during teardown.
    pub async fn power_off(&self) -> VsphereResult<()> {
        if self.is_powered_off().await? {
            return Ok(());
        }
        log::info!("powering off {}", self.id);
        let task = self.session.platform().power_off_vm(&self.id).await;
        self.await_task("power off", task, &CancellationToken::new()).await?;
        Ok(())
    }

    /// Ask guest tools for a clean shutdown.
    pub async fn start_shutdown(&self) -> VsphereResult<()> {
        log::info!("requesting guest shutdown of {}", self.id);
        self.session
            .platform()
            .shutdown_guest(&self.id)
            .await
            .map_err(|e| e.context("shutdown", &self.id))
    }

    pub async fn wait_for_shutdown(&self, timeout: Duration) -> VsphereResult<()> {
        let start = Instant::now();
        let cancel = self.session.cancel_token();
        loop {
            if self.is_powered_off().await? {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(VsphereError::timeout("Timeout while waiting for machine to shut down."));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VsphereError::cancelled("waiting for shutdown cancelled")),
                _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {}
            }
        }
    }

    // ── Snapshot / template / destroy ───────────────────────────────

    pub async fn create_snapshot(&self, name: &str) -> VsphereResult<()> {
        let spec = SnapshotSpec {
            name: name.to_string(),
            description: String::new(),
            memory: false,
            quiesce: false,
        };
        log::info!("creating snapshot '{name}' of {}", self.id);
        let task = self.session.platform().create_snapshot(&self.id, &spec).await;
        self.await_task("create snapshot", task, self.session.cancel_token()).await?;
        Ok(())
    }

    pub async fn convert_to_template(&self) -> VsphereResult<()> {
        log::info!("converting {} to a template", self.id);
        self.session
            .platform()
            .mark_as_template(&self.id)
            .await
            .map_err(|e| e.context("convert to template", &self.id))
    }

    /// Delete the VM and its files. Not cancellable.
    pub async fn destroy(&self) -> VsphereResult<()> {
        log::info!("destroying {}", self.id);
        let task = self.session.platform().destroy_vm(&self.id).await;
        self.await_task("destroy", task, &CancellationToken::new()).await?;
        Ok(())
    }

    // ── Guest IP ────────────────────────────────────────────────────

    pub async fn wait_for_ip(&self, policy: &IpWaitPolicy) -> VsphereResult<IpWaitOutcome> {
        ipwait::wait_for_ip(Arc::new(self.clone()), policy, self.session.cancel_token())
            .await
            .map_err(|e| e.context("wait for IP", &self.id))
    }
}

// ── Create ──────────────────────────────────────────────────────────

impl Session {
    /// Create a VM from scratch with its controllers, disks, adapters and
    /// USB controllers in one create task.
    pub async fn create_vm(self: &Arc<Self>, req: &CreateRequest) -> VsphereResult<VirtualMachine> {
        let folder = self.find_folder(&req.folder).await.map_err(|e| e.context("create", &req.name))?;
        let pool = self
            .find_resource_pool(&req.cluster, &req.host, &req.resource_pool)
            .await
            .map_err(|e| e.context("create", &req.name))?;
        let datastore = self
            .find_datastore(&req.datastore, &req.host)
            .await
            .map_err(|e| e.context("create", &req.name))?;
        let host = if !req.cluster.is_empty() && !req.host.is_empty() {
            Some(
                self.find_host(&req.host)
                    .await
                    .map_err(|e| e.context("create", &req.name))?
                    .host,
            )
        } else {
            None
        };

        let mut devices = assign_storage(&req.disk_controller_types, &req.storage)
            .map_err(|e| e.context("create", &req.name))?;
        devices.append(
            self.assign_networks(&req.nics, &req.host)
                .await
                .map_err(|e| e.context("create", &req.name))?,
        );
        for kind in &req.usb_controllers {
            match usb_controller(kind) {
                Some(dev) => {
                    devices.add(dev);
                }
                None => log::debug!("ignoring usb controller value '{kind}'"),
            }
        }

        let config = VmConfigSpec {
            name: Some(req.name.clone()),
            annotation: (!req.annotation.is_empty()).then(|| req.annotation.clone()),
            guest_id: (!req.guest_os_type.is_empty()).then(|| req.guest_os_type.clone()),
            version: (req.version > 0).then(|| format!("vmx-{}", req.version)),
            vm_path_name: Some(format!("[{}]", datastore.name)),
            device_change: devices.resolve(&[]).map_err(|e| e.context("create", &req.name))?,
            ..Default::default()
        };
        let spec = CreateSpec {
            folder: folder.folder,
            pool: pool.resource_pool,
            host,
            config,
        };

        log::info!("creating VM '{}'", req.name);
        let task = self.platform().create_vm(&spec).await;
        let info = match task {
            Ok(task) => wait_for_task(self.platform(), &task, self.cancel_token()).await,
            Err(e) => Err(e),
        }
        .map_err(|e| e.context("create", &req.name))?;
        let id = info
            .result_id()
            .ok_or_else(|| VsphereError::parse(format!("create of '{}' returned no VM reference", req.name)))?;
        Ok(self.vm(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{decode_layout, DeviceLayout};
    use crate::simulator::SimulatedPlatform;

    async fn lab() -> (Arc<SimulatedPlatform>, Arc<Session>) {
        let sim = Arc::new(SimulatedPlatform::lab());
        let session = Session::open(sim.clone(), "dc1", CancellationToken::new()).await.unwrap();
        (sim, session)
    }

    fn clone_req(name: &str) -> CloneRequest {
        CloneRequest {
            name: name.into(),
            cluster: "cluster1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_clone() {
        let (sim, session) = lab().await;
        let template = session.find_vm("ubuntu-template").await.unwrap();
        let vm = template.clone_vm(&clone_req("web-01")).await.unwrap();
        let props = vm.properties().await.unwrap();
        assert_eq!(props.name, "web-01");
        assert_eq!(props.power_state, VmPowerState::PoweredOff);

        let spec = sim.last_clone().unwrap();
        assert_eq!(spec.location.disk_move_type, None);
        assert_eq!(spec.snapshot, None);
        assert_eq!(spec.location.pool, "resgroup-1");
    }

    #[tokio::test]
    async fn linked_clone_uses_current_snapshot() {
        let (sim, session) = lab().await;
        let template = session.find_vm("ubuntu-template").await.unwrap();
        let mut req = clone_req("linked-01");
        req.linked_clone = true;
        template.clone_vm(&req).await.unwrap();
        let spec = sim.last_clone().unwrap();
        assert_eq!(spec.location.disk_move_type, Some(DiskMoveType::CreateNewChildDiskBacking));
        assert_eq!(spec.snapshot.as_deref(), Some("snapshot-1"));
    }

    #[tokio::test]
    async fn linked_clone_without_snapshot() {
        let (sim, session) = lab().await;
        let template = session.find_vm("bare-template").await.unwrap();
        let mut req = clone_req("linked-02");
        req.linked_clone = true;
        let err = template.clone_vm(&req).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::NoSnapshot);
        assert!(sim.last_clone().is_none());
    }

    #[tokio::test]
    async fn clone_rebinds_first_adapter_with_vapp_and_annotation() {
        let (sim, session) = lab().await;
        let template = session.find_vm("ubuntu-template").await.unwrap();
        let mut req = clone_req("web-02");
        req.network = "dvs-prod".into();
        req.host = "esxi-02".into();
        req.mac_address = "00:50:56:00:00:01".into();
        req.annotation = "built by vsforge".into();
        req.vapp_properties.insert("hostname".into(), "web-02".into());
        template.clone_vm(&req).await.unwrap();

        let spec = sim.last_clone().unwrap();
        assert_eq!(spec.config.annotation.as_deref(), Some("built by vsforge"));
        assert_eq!(spec.config.device_change.len(), 1);
        let change = &spec.config.device_change[0];
        assert_eq!(change.operation, DeviceOperation::Edit);
        assert_eq!(change.device.key, 4000);
        match &change.device.kind {
            DeviceKind::Ethernet { network, mac_address, address_type, .. } => {
                assert_eq!(network, "dvportgroup-12");
                assert_eq!(mac_address.as_deref(), Some("00:50:56:00:00:01"));
                assert_eq!(*address_type, MacAddressType::Manual);
            }
            other => panic!("unexpected device {other:?}"),
        }
        assert_eq!(spec.config.vapp_config.unwrap().properties[0].info.value, "web-02");
    }

    #[tokio::test]
    async fn clone_without_adapter() {
        let (_, session) = lab().await;
        let template = session.find_vm("bare-template").await.unwrap();
        let mut req = clone_req("x");
        req.network = "VM Network".into();
        let err = template.clone_vm(&req).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::NoAdapter);
    }

    #[tokio::test]
    async fn clone_rejects_unknown_vapp_property() {
        let (sim, session) = lab().await;
        let template = session.find_vm("ubuntu-template").await.unwrap();
        let mut req = clone_req("x");
        req.vapp_properties.insert("user-data".into(), "abc".into());
        let err = template.clone_vm(&req).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::InvalidVAppProperty);
        assert!(err.message.contains("user-data"));
        assert!(sim.last_clone().is_none());
    }

    #[tokio::test]
    async fn clone_adds_extra_storage() {
        let (_, session) = lab().await;
        let template = session.find_vm("ubuntu-template").await.unwrap();
        let mut req = clone_req("data-01");
        req.disk_controller_types = vec!["pvscsi".into()];
        req.storage = vec![DiskSpec { disk_size: 10240, controller_index: 0, ..Default::default() }];
        let vm = template.clone_vm(&req).await.unwrap();
        let layout = decode_layout(&vm.devices().await.unwrap());
        assert_eq!(layout.controllers.len(), 2);
        assert_eq!(layout.disks.len(), 2);
        assert_eq!(layout.disks[1].disk_size, 10240);
        assert_eq!(layout.disks[1].controller_index, 1);
    }

    #[tokio::test]
    async fn clone_task_failure_is_wrapped() {
        let (sim, session) = lab().await;
        sim.fail_next("clone_vm", "insufficient disk space");
        let template = session.find_vm("ubuntu-template").await.unwrap();
        let err = template.clone_vm(&clone_req("web-03")).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::TaskError);
        assert!(err.message.starts_with("clone '"));
        assert!(err.message.contains("insufficient disk space"));
    }

    #[tokio::test]
    async fn clone_lookup_errors_name_the_target() {
        let (sim, session) = lab().await;
        let template = session.find_vm("ubuntu-template").await.unwrap();

        let mut req = clone_req("web-04");
        req.datastore = "no-such-ds".into();
        let err = template.clone_vm(&req).await.unwrap_err();
        assert!(err.message.starts_with("clone 'web-04': "), "{}", err.message);

        let mut req = clone_req("web-04");
        req.network = "no-such-net".into();
        let err = template.clone_vm(&req).await.unwrap_err();
        assert!(err.message.starts_with("clone 'web-04': "), "{}", err.message);

        let mut req = clone_req("web-04");
        req.disk_controller_types = vec!["pvscsi".into()];
        req.storage = vec![DiskSpec { disk_size: 1024, controller_index: 2, ..Default::default() }];
        let err = template.clone_vm(&req).await.unwrap_err();
        assert!(err.message.starts_with("clone 'web-04': "), "{}", err.message);
        assert!(sim.last_clone().is_none());
    }

    #[tokio::test]
    async fn create_lookup_errors_name_the_target() {
        let (sim, session) = lab().await;
        let req = CreateRequest {
            name: "scratch-02".into(),
            cluster: "cluster1".into(),
            datastore: "datastore1".into(),
            disk_controller_types: vec!["pvscsi".into()],
            storage: vec![DiskSpec { disk_size: 1024, controller_index: 0, ..Default::default() }],
            nics: vec![NicSpec {
                network: "no-such-net".into(),
                network_card: "vmxnet3".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = session.create_vm(&req).await.unwrap_err();
        assert!(err.message.starts_with("create 'scratch-02': "), "{}", err.message);
        assert!(sim.creates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clone_cancellation_cancels_task() {
        let sim = Arc::new(SimulatedPlatform::lab());
        sim.set_task_delay(Duration::from_secs(120));
        let cancel = CancellationToken::new();
        let session = Session::open(sim.clone(), "dc1", cancel.clone()).await.unwrap();
        let template = session.find_vm("ubuntu-template").await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let err = template.clone_vm(&clone_req("web-04")).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(sim.calls().iter().any(|c| c.starts_with("cancel_task")));
        assert!(sim.vm_id("web-04").is_none());
    }

    #[tokio::test]
    async fn configure_hardware() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("ubuntu-template").await.unwrap();
        let hw = HardwareSpec {
            cpus: 4,
            ram: 8192,
            cpu_reservation: 1000,
            video_ram: 16384,
            vgpu_profile: "grid_t4-2q".into(),
            firmware: "efi-secure".into(),
            ..Default::default()
        };
        vm.configure(&hw).await.unwrap();

        let spec = sim.reconfigurations(vm.id()).pop().unwrap();
        assert_eq!(spec.num_cpus, Some(4));
        assert_eq!(spec.memory_mb, Some(8192));
        assert_eq!(spec.firmware.as_deref(), Some("efi"));
        let cpu = spec.cpu_allocation.unwrap();
        assert_eq!(cpu.reservation, Some(1000));
        assert_eq!(cpu.limit, None);
        assert_eq!(spec.boot_options.unwrap().efi_secure_boot_enabled, Some(true));
        assert_eq!(spec.device_change.len(), 2);
        assert_eq!(spec.device_change[0].operation, DeviceOperation::Edit);
        assert_eq!(spec.device_change[1].operation, DeviceOperation::Add);

        // second run edits the vGPU that now exists
        vm.configure(&hw).await.unwrap();
        let spec = sim.reconfigurations(vm.id()).pop().unwrap();
        assert!(spec.device_change.iter().all(|c| c.operation == DeviceOperation::Edit));
    }

    #[tokio::test]
    async fn configure_turns_secure_boot_off_for_plain_firmware() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("ubuntu-template").await.unwrap();
        for firmware in ["efi", "bios", ""] {
            let hw = HardwareSpec {
                firmware: firmware.into(),
                ..Default::default()
            };
            vm.configure(&hw).await.unwrap();
            let spec = sim.reconfigurations(vm.id()).pop().unwrap();
            assert_eq!(
                spec.boot_options.unwrap().efi_secure_boot_enabled,
                Some(false),
                "firmware '{firmware}'"
            );
        }
        let spec = sim.reconfigurations(vm.id()).pop().unwrap();
        assert_eq!(spec.firmware, None);
    }

    #[tokio::test]
    async fn configure_rejects_reservation_with_reserve_all() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("ubuntu-template").await.unwrap();
        for cpus in [0, 1, 16] {
            let hw = HardwareSpec {
                cpus,
                ram_reservation: 1,
                ram_reserve_all: true,
                ..Default::default()
            };
            let err = vm.configure(&hw).await.unwrap_err();
            assert_eq!(err.kind, VsphereErrorKind::Configuration);
        }
        assert!(sim.reconfigurations(vm.id()).is_empty());
    }

    #[tokio::test]
    async fn resize_requires_single_disk() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("ubuntu-template").await.unwrap();
        vm.resize_disk(40 * 1024 * 1024).await.unwrap();
        let layout: DeviceLayout = decode_layout(&vm.devices().await.unwrap());
        assert_eq!(layout.disks[0].disk_size, 40 * 1024);

        let template = session.find_vm("ubuntu-template").await.unwrap();
        let mut req = clone_req("two-disks");
        req.disk_controller_types = vec!["pvscsi".into()];
        req.storage = vec![DiskSpec { disk_size: 1024, ..Default::default() }];
        let two = template.clone_vm(&req).await.unwrap();
        let before = sim.reconfigurations(two.id()).len();
        let err = two.resize_disk(1).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::MultipleDisks);
        assert_eq!(sim.reconfigurations(two.id()).len(), before);
    }

    #[tokio::test]
    async fn create_from_scratch_round_trips_layout() {
        let (_, session) = lab().await;
        let req = CreateRequest {
            name: "scratch-01".into(),
            host: "esxi-01".into(),
            cluster: "cluster1".into(),
            datastore: "datastore1".into(),
            guest_os_type: "otherGuest64".into(),
            version: 19,
            disk_controller_types: vec!["lsilogic-sas".into(), "nvme".into()],
            storage: vec![
                DiskSpec { disk_size: 20480, thin_provisioned: true, controller_index: 0, ..Default::default() },
                DiskSpec { disk_size: 4096, eagerly_scrub: true, controller_index: 1, ..Default::default() },
            ],
            nics: vec![NicSpec {
                network: "dvs-prod".into(),
                network_card: "vmxnet3".into(),
                ..Default::default()
            }],
            usb_controllers: vec!["xhci".into(), "nope".into()],
            ..Default::default()
        };
        let vm = session.create_vm(&req).await.unwrap();
        let devices = vm.devices().await.unwrap();
        let layout = decode_layout(&devices);
        assert_eq!(layout.controllers.len(), 2);
        assert_eq!(layout.disks, req.storage);
        assert_eq!(layout.adapters, vec![AdapterType::Vmxnet3]);
        assert_eq!(
            devices.iter().filter(|d| matches!(d.kind, DeviceKind::UsbXhciController)).count(),
            1
        );
        assert_eq!(vm.get_dir().await.unwrap(), "scratch-01");
    }

    #[tokio::test]
    async fn power_and_shutdown() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("bare-template").await.unwrap();
        vm.power_off().await.unwrap();
        assert!(!sim.calls().iter().any(|c| c.starts_with("power_off_vm")));

        vm.power_on().await.unwrap();
        assert!(!vm.is_powered_off().await.unwrap());
        vm.start_shutdown().await.unwrap();
        vm.wait_for_shutdown(Duration::from_secs(10)).await.unwrap();
        assert!(vm.is_powered_off().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_timeout() {
        let (sim, session) = lab().await;
        sim.set_shutdown_delay(Duration::from_secs(600));
        let vm = session.find_vm("bare-template").await.unwrap();
        vm.power_on().await.unwrap();
        vm.start_shutdown().await.unwrap();
        let err = vm.wait_for_shutdown(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.message, "Timeout while waiting for machine to shut down.");
    }

    #[tokio::test]
    async fn snapshot_template_and_destroy() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("bare-template").await.unwrap();
        vm.create_snapshot("base").await.unwrap();
        assert!(vm.properties().await.unwrap().current_snapshot.is_some());
        vm.convert_to_template().await.unwrap();
        assert!(vm.is_template().await.unwrap());
        vm.destroy().await.unwrap();
        assert!(sim.vm_id("bare-template").is_none());
    }

    #[tokio::test]
    async fn config_params_and_public_keys() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("ubuntu-template").await.unwrap();
        vm.add_config_params(&BTreeMap::new(), None).await.unwrap();
        assert!(sim.reconfigurations(vm.id()).is_empty());

        let params = BTreeMap::from([("svga.autodetect".to_string(), "TRUE".to_string())]);
        let tools = ToolsConfig { sync_time_with_host: Some(true), tools_upgrade_policy: None };
        vm.add_config_params(&params, Some(&tools)).await.unwrap();
        let props = vm.properties().await.unwrap();
        assert!(props.extra_config.iter().any(|o| o.key == "svga.autodetect" && o.value == "TRUE"));

        let err = vm.add_public_keys("ssh-ed25519 AAAA").await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::InvalidVAppProperty);
    }

    #[tokio::test]
    async fn boot_order_applied() {
        let (_, session) = lab().await;
        let vm = session.find_vm("ubuntu-template").await.unwrap();
        vm.set_boot_order(&["disk".to_string(), "ethernet".to_string()]).await.unwrap();
        let props = vm.properties().await.unwrap();
        assert_eq!(
            props.boot_order,
            vec![BootDevice::Disk { device_key: 2000 }, BootDevice::Ethernet { device_key: 4000 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_ip_through_vm() {
        let (sim, session) = lab().await;
        let vm = session.find_vm("ubuntu-template").await.unwrap();
        sim.set_guest_addresses("ubuntu-template", vec![vec![], vec!["10.0.0.50"]]);
        vm.power_on().await.unwrap();
        let policy = IpWaitPolicy {
            settle_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(60),
            allowed: None,
        };
        let outcome = vm.wait_for_ip(&policy).await.unwrap();
        assert_eq!(outcome, IpWaitOutcome::Stable("10.0.0.50".parse().unwrap()));
    }
}
