//! Device change-set construction.
//!
//! New devices are collected into a [`DeviceChangeSet`] and addressed by a
//! local [`Slot`]. Disks reference their controller through a slot (or the key
//! of a controller the VM already owns). Platform keys, bus numbers and unit
//! numbers are handed out only by [`DeviceChangeSet::resolve`], right before
//! the set is submitted as one create/reconfigure call.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::types::*;

/// First key handed to a pending device; later ones count downwards.
pub const FIRST_PENDING_KEY: i32 = -200;

/// Local index of a device inside one change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(usize);

impl Slot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Controller a new device should hang off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRef {
    /// A controller added earlier in the same change set.
    Pending(Slot),
    /// A controller the VM already has, by platform key.
    Existing(i32),
}

#[derive(Debug, Clone)]
struct Entry {
    operation: DeviceOperation,
    file_operation: Option<FileOperation>,
    device: VirtualDevice,
    controller: Option<ControllerRef>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceChangeSet {
    entries: Vec<Entry>,
}

impl DeviceChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a new device that does not sit on a storage controller.
    pub fn add(&mut self, device: VirtualDevice) -> Slot {
        self.push(DeviceOperation::Add, device, None)
    }

    /// Queue a new device attached to `controller`.
    pub fn attach(&mut self, device: VirtualDevice, controller: ControllerRef) -> Slot {
        self.push(DeviceOperation::Add, device, Some(controller))
    }

    /// Queue an in-place edit of an existing device (key preserved).
    pub fn edit(&mut self, device: VirtualDevice) {
        self.push(DeviceOperation::Edit, device, None);
    }

    pub fn remove(&mut self, device: VirtualDevice, destroy_files: bool) {
        let slot = self.push(DeviceOperation::Remove, device, None);
        if destroy_files {
            self.entries[slot.0].file_operation = Some(FileOperation::Destroy);
        }
    }

    /// Move all entries of `other` behind ours, keeping its pending references valid.
    pub fn append(&mut self, other: DeviceChangeSet) {
        let offset = self.entries.len();
        self.entries.extend(other.entries.into_iter().map(|mut e| {
            if let Some(ControllerRef::Pending(slot)) = e.controller {
                e.controller = Some(ControllerRef::Pending(Slot(slot.0 + offset)));
            }
            e
        }));
    }

    fn push(
        &mut self,
        operation: DeviceOperation,
        device: VirtualDevice,
        controller: Option<ControllerRef>,
    ) -> Slot {
        let file_operation = match (&operation, &device.kind) {
            (DeviceOperation::Add, DeviceKind::Disk { file_name: None, .. }) => {
                Some(FileOperation::Create)
            }
            _ => None,
        };
        self.entries.push(Entry {
            operation,
            file_operation,
            device,
            controller,
        });
        Slot(self.entries.len() - 1)
    }

    /// Assign platform keys, controller bus numbers and unit numbers.
    /// `existing` is the VM's current device list (empty for a new VM).
    pub fn resolve(self, existing: &[VirtualDevice]) -> VsphereResult<Vec<DeviceChange>> {
        let mut used_buses: HashMap<BusFamily, BTreeSet<i32>> = HashMap::new();
        let mut families: HashMap<i32, BusFamily> = HashMap::new();
        let mut used_units: HashMap<i32, BTreeSet<i32>> = HashMap::new();

        for dev in existing {
            if let Some((family, bus)) = dev.controller_bus() {
                used_buses.entry(family).or_default().insert(bus);
                families.insert(dev.key, family);
            }
            if let (Some(ck), Some(unit)) = (dev.controller_key, dev.unit_number) {
                used_units.entry(ck).or_default().insert(unit);
            }
        }

        let keys: Vec<i32> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| match e.operation {
                DeviceOperation::Add => FIRST_PENDING_KEY - i as i32,
                _ => e.device.key,
            })
            .collect();

        let mut entries = self.entries;

        for (i, entry) in entries.iter_mut().enumerate() {
            if entry.operation != DeviceOperation::Add {
                continue;
            }
            let Some((family, _)) = entry.device.controller_bus() else {
                continue;
            };
            let taken = used_buses.entry(family).or_default();
            let bus = (0..family.max_buses())
                .find(|b| !taken.contains(b))
                .ok_or_else(|| {
                    VsphereError::new(
                        VsphereErrorKind::DeviceState,
                        format!("no free bus number for another {family:?} controller"),
                    )
                })?;
            taken.insert(bus);
            set_bus(&mut entry.device.kind, bus);
            families.insert(keys[i], family);
        }

        let mut changes = Vec::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            let mut device = entry.device;
            device.key = keys[i];

            if let Some(controller) = entry.controller {
                let controller_key = match controller {
                    ControllerRef::Pending(slot) => *keys.get(slot.0).ok_or_else(|| {
                        VsphereError::new(
                            VsphereErrorKind::DeviceState,
                            format!("device slot {} does not exist", slot.0),
                        )
                    })?,
                    ControllerRef::Existing(key) => key,
                };
                let family = *families.get(&controller_key).ok_or_else(|| {
                    VsphereError::new(
                        VsphereErrorKind::DeviceState,
                        format!("controller {controller_key} not found"),
                    )
                })?;
                let taken = used_units.entry(controller_key).or_default();
                let unit = (0..family.max_units())
                    .filter(|u| Some(*u) != family.reserved_unit())
                    .find(|u| !taken.contains(u))
                    .ok_or_else(|| {
                        VsphereError::new(
                            VsphereErrorKind::DeviceState,
                            format!("controller {controller_key} has no free unit"),
                        )
                    })?;
                taken.insert(unit);
                device.controller_key = Some(controller_key);
                device.unit_number = Some(unit);
            }

            changes.push(DeviceChange {
                operation: entry.operation,
                file_operation: entry.file_operation,
                device,
            });
        }
        Ok(changes)
    }
}

fn set_bus(kind: &mut DeviceKind, bus: i32) {
    match kind {
        DeviceKind::ScsiController { bus_number, .. }
        | DeviceKind::NvmeController { bus_number }
        | DeviceKind::SataController { bus_number }
        | DeviceKind::IdeController { bus_number } => *bus_number = bus,
        _ => {}
    }
}

// ── Storage ─────────────────────────────────────────────────────────

/// One disk to create. `disk_size` is in MiB.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskSpec {
    #[serde(default)]
    pub disk_size: i64,
    #[serde(default, rename = "disk_thin_provisioned")]
    pub thin_provisioned: bool,
    #[serde(default, rename = "disk_eagerly_scrub")]
    pub eagerly_scrub: bool,
    #[serde(default, rename = "disk_controller_index")]
    pub controller_index: usize,
}

impl DiskSpec {
    pub fn capacity_kb(&self) -> i64 {
        self.disk_size * 1024
    }
}

/// Every per-disk problem in `disks`, in input order.
pub fn validate_disks(controller_count: usize, disks: &[DiskSpec]) -> Vec<VsphereError> {
    let mut errs = Vec::new();
    for (i, disk) in disks.iter().enumerate() {
        if disk.disk_size <= 0 {
            errs.push(VsphereError::config(format!("storage[{i}].'disk_size' is required")));
        }
        if disk.controller_index >= controller_count {
            errs.push(VsphereError::config(format!(
                "storage[{i}].'disk_controller_index' references an unknown disk controller: {}",
                disk.controller_index
            )));
        }
    }
    errs
}

pub fn controller_device(controller_type: DiskControllerType) -> VirtualDevice {
    let kind = match controller_type {
        DiskControllerType::Nvme => DeviceKind::NvmeController { bus_number: 0 },
        DiskControllerType::Scsi(t) => DeviceKind::ScsiController {
            bus_number: 0,
            controller_type: t,
        },
    };
    VirtualDevice::new(kind)
}

pub fn disk_device(disk: &DiskSpec) -> VirtualDevice {
    VirtualDevice::new(DeviceKind::Disk {
        capacity_kb: disk.capacity_kb(),
        thin_provisioned: disk.thin_provisioned,
        eagerly_scrub: disk.eagerly_scrub,
        file_name: None,
    })
}

/// Controllers in list order, then each disk on the controller at its index.
pub fn assign_storage(controller_types: &[String], disks: &[DiskSpec]) -> VsphereResult<DeviceChangeSet> {
    if disks.is_empty() {
        return Err(VsphereError::config("no storage devices have been defined"));
    }
    if controller_types.is_empty() {
        return Err(VsphereError::config("no controllers have been defined"));
    }
    if let Some(err) = validate_disks(controller_types.len(), disks).into_iter().next() {
        return Err(err);
    }

    let mut set = DeviceChangeSet::new();
    let mut controllers = Vec::with_capacity(controller_types.len());
    for name in controller_types {
        let controller_type: DiskControllerType = name.parse()?;
        controllers.push(set.add(controller_device(controller_type)));
    }
    for disk in disks {
        set.attach(disk_device(disk), ControllerRef::Pending(controllers[disk.controller_index]));
    }
    Ok(set)
}

// ── Network adapters ────────────────────────────────────────────────

/// One network adapter to create.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NicSpec {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub network_card: String,
    #[serde(default)]
    pub mac_address: String,
    /// Unset leaves the platform default in place.
    #[serde(default)]
    pub passthrough: Option<bool>,
}

pub fn network_adapter(nic: &NicSpec, network: &NetworkSummary) -> VsphereResult<VirtualDevice> {
    let adapter_type: AdapterType = nic.network_card.parse()?;
    let (mac_address, address_type) = if nic.mac_address.is_empty() {
        (None, MacAddressType::Generated)
    } else {
        (Some(nic.mac_address.clone()), MacAddressType::Manual)
    };
    Ok(VirtualDevice::new(DeviceKind::Ethernet {
        adapter_type,
        network: network.network.clone(),
        mac_address,
        address_type,
        upt_compatibility_enabled: nic.passthrough,
    }))
}

/// First ethernet card in the device list.
pub fn find_network_adapter(devices: &[VirtualDevice]) -> VsphereResult<VirtualDevice> {
    devices
        .iter()
        .find(|d| d.is_ethernet())
        .cloned()
        .ok_or_else(|| VsphereError::new(VsphereErrorKind::NoAdapter, "no network adapter device found"))
}

// ── Other devices ───────────────────────────────────────────────────

/// USB controller for a config value; unknown values yield `None`.
pub fn usb_controller(kind: &str) -> Option<VirtualDevice> {
    match kind {
        "usb" | "true" | "1" => Some(VirtualDevice::new(DeviceKind::UsbController { ehci_enabled: true })),
        "xhci" => Some(VirtualDevice::new(DeviceKind::UsbXhciController)),
        _ => None,
    }
}

/// The single disk of a VM, for resizing.
pub fn find_disk(devices: &[VirtualDevice]) -> VsphereResult<VirtualDevice> {
    let disks: Vec<&VirtualDevice> = devices.iter().filter(|d| d.is_disk()).collect();
    match disks.as_slice() {
        [] => Err(VsphereError::new(VsphereErrorKind::NoDisks, "VM has no disks")),
        [disk] => Ok((*disk).clone()),
        _ => Err(VsphereError::new(VsphereErrorKind::MultipleDisks, "VM has multiple disks")),
    }
}

/// Boot order entries for the given device class names.
pub fn boot_order(devices: &[VirtualDevice], order: &[String]) -> Vec<BootDevice> {
    let mut out = Vec::new();
    for name in order {
        match name.as_str() {
            "disk" => out.extend(
                devices
                    .iter()
                    .filter(|d| d.is_disk())
                    .map(|d| BootDevice::Disk { device_key: d.key }),
            ),
            "cdrom" if devices.iter().any(|d| d.is_cdrom()) => out.push(BootDevice::Cdrom),
            "floppy" if devices.iter().any(|d| d.is_floppy()) => out.push(BootDevice::Floppy),
            "ethernet" => out.extend(
                devices
                    .iter()
                    .filter(|d| d.is_ethernet())
                    .map(|d| BootDevice::Ethernet { device_key: d.key }),
            ),
            other => log::debug!("skipping boot device class '{other}'"),
        }
    }
    out
}

// ── Decoding ────────────────────────────────────────────────────────

/// Storage and network layout read back from a device list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceLayout {
    pub controllers: Vec<DiskControllerType>,
    pub disks: Vec<DiskSpec>,
    pub adapters: Vec<AdapterType>,
}

pub fn decode_layout(devices: &[VirtualDevice]) -> DeviceLayout {
    let mut layout = DeviceLayout::default();
    let mut controller_keys = Vec::new();

    for dev in devices {
        let controller_type = match dev.kind {
            DeviceKind::ScsiController { controller_type, .. } => DiskControllerType::Scsi(controller_type),
            DeviceKind::NvmeController { .. } => DiskControllerType::Nvme,
            _ => continue,
        };
        layout.controllers.push(controller_type);
        controller_keys.push(dev.key);
    }

    for dev in devices {
        match &dev.kind {
            DeviceKind::Disk {
                capacity_kb,
                thin_provisioned,
                eagerly_scrub,
                ..
            } => {
                let Some(index) = dev
                    .controller_key
                    .and_then(|ck| controller_keys.iter().position(|k| *k == ck))
                else {
                    continue;
                };
                layout.disks.push(DiskSpec {
                    disk_size: capacity_kb / 1024,
                    thin_provisioned: *thin_provisioned,
                    eagerly_scrub: *eagerly_scrub,
                    controller_index: index,
                });
            }
            DeviceKind::Ethernet { adapter_type, .. } => layout.adapters.push(*adapter_type),
            _ => {}
        }
    }
    layout
}

/// Devices a change list adds, as they will appear on the VM.
pub fn added_devices(changes: &[DeviceChange]) -> Vec<VirtualDevice> {
    changes
        .iter()
        .filter(|c| c.operation == DeviceOperation::Add)
        .map(|c| c.device.clone())
        .collect()
}
