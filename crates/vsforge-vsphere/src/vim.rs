//! VI/JSON wire codec.
//!
//! The VI/JSON API speaks the vim25 data objects as JSON, discriminated by a
//! `_typeName` field. This module maps the driver's typed specs onto those
//! objects and decodes the few property shapes the driver reads back.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::customize::{CustomizationSpec, Identity, IpGenerator};
use crate::error::{VsphereError, VsphereResult};
use crate::types::*;

pub fn moref(kind: &str, value: &str) -> Value {
    json!({ "_typeName": "ManagedObjectReference", "type": kind, "value": value })
}

/// The `value` of a ManagedObjectReference.
pub fn moref_value(v: &Value) -> Option<String> {
    v.get("value").and_then(Value::as_str).map(str::to_string)
}

/// Managed object type for a platform id, judged from its prefix.
pub fn network_kind(id: &str) -> &'static str {
    if id.starts_with("dvportgroup-") {
        "DistributedVirtualPortgroup"
    } else if id.starts_with("opaque") {
        "OpaqueNetwork"
    } else {
        "Network"
    }
}

/// Builds an object with `_typeName` first and `None` members left out.
struct Obj(Map<String, Value>);

impl Obj {
    fn new(type_name: &str) -> Self {
        let mut map = Map::new();
        map.insert("_typeName".into(), Value::String(type_name.into()));
        Self(map)
    }

    fn untyped() -> Self {
        Self(Map::new())
    }

    fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    fn opt<T: Into<Value>>(mut self, key: &str, value: Option<T>) -> Self {
        if let Some(v) = value {
            self.0.insert(key.into(), v.into());
        }
        self
    }

    fn done(self) -> Value {
        Value::Object(self.0)
    }
}

// ── Devices ─────────────────────────────────────────────────────────

fn scsi_type_name(t: ScsiControllerType) -> &'static str {
    match t {
        ScsiControllerType::LsiLogic => "VirtualLsiLogicController",
        ScsiControllerType::LsiLogicSas => "VirtualLsiLogicSASController",
        ScsiControllerType::BusLogic => "VirtualBusLogicController",
        ScsiControllerType::Pvscsi => "ParaVirtualSCSIController",
    }
}

fn adapter_type_name(t: AdapterType) -> &'static str {
    match t {
        AdapterType::E1000 => "VirtualE1000",
        AdapterType::E1000e => "VirtualE1000e",
        AdapterType::Pcnet32 => "VirtualPCNet32",
        AdapterType::Vmxnet => "VirtualVmxnet",
        AdapterType::Vmxnet2 => "VirtualVmxnet2",
        AdapterType::Vmxnet3 => "VirtualVmxnet3",
        AdapterType::Vmxnet3vrdma => "VirtualVmxnet3Vrdma",
        AdapterType::Sriov => "VirtualSriovEthernetCard",
    }
}

fn connectable(connected: bool) -> Value {
    Obj::new("VirtualDeviceConnectInfo")
        .set("startConnected", connected)
        .set("connected", connected)
        .set("allowGuestControl", true)
        .done()
}

/// Encode one device. `switch_uuids` maps distributed portgroup ids to the
/// UUID of their switch, needed for distributed port backings.
pub fn encode_device(dev: &VirtualDevice, switch_uuids: &HashMap<String, String>) -> Value {
    let type_name = match &dev.kind {
        DeviceKind::ScsiController { controller_type, .. } => scsi_type_name(*controller_type),
        DeviceKind::NvmeController { .. } => "VirtualNVMEController",
        DeviceKind::SataController { .. } => "VirtualAHCIController",
        DeviceKind::IdeController { .. } => "VirtualIDEController",
        DeviceKind::UsbController { .. } => "VirtualUSBController",
        DeviceKind::UsbXhciController => "VirtualUSBXHCIController",
        DeviceKind::Disk { .. } => "VirtualDisk",
        DeviceKind::Ethernet { adapter_type, .. } => adapter_type_name(*adapter_type),
        DeviceKind::Cdrom { .. } => "VirtualCdrom",
        DeviceKind::Floppy { .. } => "VirtualFloppy",
        DeviceKind::VideoCard { .. } => "VirtualMachineVideoCard",
        DeviceKind::PciPassthrough { .. } => "VirtualPCIPassthrough",
    };

    let mut obj = Obj::new(type_name)
        .set("key", dev.key)
        .opt("controllerKey", dev.controller_key)
        .opt("unitNumber", dev.unit_number);
    if !dev.label.is_empty() {
        obj = obj.set(
            "deviceInfo",
            Obj::new("Description").set("label", dev.label.as_str()).set("summary", dev.label.as_str()).done(),
        );
    }

    let obj = match &dev.kind {
        DeviceKind::ScsiController { bus_number, .. } => obj.set("busNumber", *bus_number).set("sharedBus", "noSharing"),
        DeviceKind::NvmeController { bus_number }
        | DeviceKind::SataController { bus_number }
        | DeviceKind::IdeController { bus_number } => obj.set("busNumber", *bus_number),
        DeviceKind::UsbController { ehci_enabled } => obj.set("ehciEnabled", *ehci_enabled).set("autoConnectDevices", true),
        DeviceKind::UsbXhciController => obj.set("autoConnectDevices", true),
        DeviceKind::Disk {
            capacity_kb,
            thin_provisioned,
            eagerly_scrub,
            file_name,
        } => obj.set("capacityInKB", *capacity_kb).set(
            "backing",
            Obj::new("VirtualDiskFlatVer2BackingInfo")
                .set("diskMode", "persistent")
                .set("thinProvisioned", *thin_provisioned)
                .set("eagerlyScrub", *eagerly_scrub)
                .set("fileName", file_name.clone().unwrap_or_default())
                .done(),
        ),
        DeviceKind::Ethernet {
            network,
            mac_address,
            address_type,
            upt_compatibility_enabled,
            ..
        } => {
            let backing = match switch_uuids.get(network) {
                Some(uuid) => Obj::new("VirtualEthernetCardDistributedVirtualPortBackingInfo")
                    .set(
                        "port",
                        Obj::new("DistributedVirtualSwitchPortConnection")
                            .set("switchUuid", uuid.as_str())
                            .set("portgroupKey", network.as_str())
                            .done(),
                    )
                    .done(),
                None => Obj::new("VirtualEthernetCardNetworkBackingInfo")
                    .set("network", moref(network_kind(network), network))
                    .done(),
            };
            let address_type = match address_type {
                MacAddressType::Generated => "generated",
                MacAddressType::Manual => "manual",
                MacAddressType::Assigned => "assigned",
            };
            obj.set("backing", backing)
                .set("addressType", address_type)
                .opt("macAddress", mac_address.clone())
                .opt("uptCompatibilityEnabled", *upt_compatibility_enabled)
                .set("connectable", connectable(true))
        }
        DeviceKind::Cdrom { iso_file, connected } => {
            let backing = match iso_file {
                Some(f) => Obj::new("VirtualCdromIsoBackingInfo").set("fileName", f.as_str()).done(),
                None => Obj::new("VirtualCdromRemotePassthroughBackingInfo")
                    .set("deviceName", "")
                    .set("exclusive", false)
                    .done(),
            };
            obj.set("backing", backing).set("connectable", connectable(*connected))
        }
        DeviceKind::Floppy { image_file } => {
            let backing = match image_file {
                Some(f) => Obj::new("VirtualFloppyImageBackingInfo").set("fileName", f.as_str()).done(),
                None => Obj::new("VirtualFloppyRemoteDeviceBackingInfo").set("deviceName", "").done(),
            };
            obj.set("backing", backing).set("connectable", connectable(image_file.is_some()))
        }
        DeviceKind::VideoCard { video_ram_kb } => obj.set("videoRamSizeInKB", *video_ram_kb),
        DeviceKind::PciPassthrough { vgpu_profile } => obj.set(
            "backing",
            Obj::new("VirtualPCIPassthroughVmiopBackingInfo")
                .set("vgpu", vgpu_profile.clone().unwrap_or_default())
                .done(),
        ),
    };
    obj.done()
}

fn str_of(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn i32_of(v: &Value, key: &str) -> Option<i32> {
    v.get(key).and_then(Value::as_i64).and_then(|n| i32::try_from(n).ok())
}

fn bool_of(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Decode one device from `config.hardware.device`. Device types the driver
/// does not model are skipped.
pub fn decode_device(v: &Value) -> Option<VirtualDevice> {
    let type_name = v.get("_typeName")?.as_str()?;
    let bus_number = i32_of(v, "busNumber").unwrap_or(0);
    let backing = v.get("backing").cloned().unwrap_or(Value::Null);
    let connected = v
        .get("connectable")
        .map(|c| bool_of(c, "connected"))
        .unwrap_or(false);

    let kind = match type_name {
        "VirtualLsiLogicController" => DeviceKind::ScsiController { bus_number, controller_type: ScsiControllerType::LsiLogic },
        "VirtualLsiLogicSASController" => DeviceKind::ScsiController { bus_number, controller_type: ScsiControllerType::LsiLogicSas },
        "VirtualBusLogicController" => DeviceKind::ScsiController { bus_number, controller_type: ScsiControllerType::BusLogic },
        "ParaVirtualSCSIController" => DeviceKind::ScsiController { bus_number, controller_type: ScsiControllerType::Pvscsi },
        "VirtualNVMEController" => DeviceKind::NvmeController { bus_number },
        "VirtualAHCIController" => DeviceKind::SataController { bus_number },
        "VirtualIDEController" => DeviceKind::IdeController { bus_number },
        "VirtualUSBController" => DeviceKind::UsbController { ehci_enabled: bool_of(v, "ehciEnabled") },
        "VirtualUSBXHCIController" => DeviceKind::UsbXhciController,
        "VirtualDisk" => DeviceKind::Disk {
            capacity_kb: v.get("capacityInKB").and_then(Value::as_i64).unwrap_or(0),
            thin_provisioned: bool_of(&backing, "thinProvisioned"),
            eagerly_scrub: bool_of(&backing, "eagerlyScrub"),
            file_name: str_of(&backing, "fileName"),
        },
        "VirtualCdrom" => DeviceKind::Cdrom {
            iso_file: (backing.get("_typeName").and_then(Value::as_str) == Some("VirtualCdromIsoBackingInfo"))
                .then(|| str_of(&backing, "fileName"))
                .flatten(),
            connected,
        },
        "VirtualFloppy" => DeviceKind::Floppy {
            image_file: (backing.get("_typeName").and_then(Value::as_str) == Some("VirtualFloppyImageBackingInfo"))
                .then(|| str_of(&backing, "fileName"))
                .flatten(),
        },
        "VirtualMachineVideoCard" => DeviceKind::VideoCard {
            video_ram_kb: v.get("videoRamSizeInKB").and_then(Value::as_i64).unwrap_or(0),
        },
        "VirtualPCIPassthrough" => DeviceKind::PciPassthrough { vgpu_profile: str_of(&backing, "vgpu") },
        other => {
            let adapter_type = match other {
                "VirtualE1000" => AdapterType::E1000,
                "VirtualE1000e" => AdapterType::E1000e,
                "VirtualPCNet32" => AdapterType::Pcnet32,
                "VirtualVmxnet" => AdapterType::Vmxnet,
                "VirtualVmxnet2" => AdapterType::Vmxnet2,
                "VirtualVmxnet3" => AdapterType::Vmxnet3,
                "VirtualVmxnet3Vrdma" => AdapterType::Vmxnet3vrdma,
                "VirtualSriovEthernetCard" => AdapterType::Sriov,
                _ => return None,
            };
            let network = backing
                .get("network")
                .and_then(moref_value)
                .or_else(|| backing.get("port").and_then(|p| str_of(p, "portgroupKey")))
                .unwrap_or_default();
            let address_type = match v.get("addressType").and_then(Value::as_str) {
                Some("manual") => MacAddressType::Manual,
                Some("assigned") => MacAddressType::Assigned,
                _ => MacAddressType::Generated,
            };
            DeviceKind::Ethernet {
                adapter_type,
                network,
                mac_address: str_of(v, "macAddress"),
                address_type,
                upt_compatibility_enabled: v.get("uptCompatibilityEnabled").and_then(Value::as_bool),
            }
        }
    };

    Some(VirtualDevice {
        key: i32_of(v, "key")?,
        controller_key: i32_of(v, "controllerKey"),
        unit_number: i32_of(v, "unitNumber"),
        label: v
            .get("deviceInfo")
            .and_then(|d| str_of(d, "label"))
            .unwrap_or_default(),
        kind,
    })
}

// ── Config specs ────────────────────────────────────────────────────

fn allocation(a: &ResourceAllocation) -> Value {
    Obj::new("ResourceAllocationInfo")
        .opt("reservation", a.reservation)
        .opt("limit", a.limit)
        .done()
}

fn boot_device(d: &BootDevice) -> Value {
    match d {
        BootDevice::Disk { device_key } => Obj::new("VirtualMachineBootOptionsBootableDiskDevice")
            .set("deviceKey", *device_key)
            .done(),
        BootDevice::Cdrom => Obj::new("VirtualMachineBootOptionsBootableCdromDevice").done(),
        BootDevice::Floppy => Obj::new("VirtualMachineBootOptionsBootableFloppyDevice").done(),
        BootDevice::Ethernet { device_key } => Obj::new("VirtualMachineBootOptionsBootableEthernetDevice")
            .set("deviceKey", *device_key)
            .done(),
    }
}

fn decode_boot_device(v: &Value) -> Option<BootDevice> {
    match v.get("_typeName")?.as_str()? {
        "VirtualMachineBootOptionsBootableDiskDevice" => Some(BootDevice::Disk { device_key: i32_of(v, "deviceKey")? }),
        "VirtualMachineBootOptionsBootableCdromDevice" => Some(BootDevice::Cdrom),
        "VirtualMachineBootOptionsBootableFloppyDevice" => Some(BootDevice::Floppy),
        "VirtualMachineBootOptionsBootableEthernetDevice" => {
            Some(BootDevice::Ethernet { device_key: i32_of(v, "deviceKey")? })
        }
        _ => None,
    }
}

fn lower<T: serde::Serialize>(value: &T) -> VsphereResult<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(VsphereError::parse(format!("expected a string enum, got {other}"))),
    }
}

pub fn encode_config_spec(spec: &VmConfigSpec, switch_uuids: &HashMap<String, String>) -> VsphereResult<Value> {
    let mut obj = Obj::new("VirtualMachineConfigSpec")
        .opt("name", spec.name.clone())
        .opt("annotation", spec.annotation.clone())
        .opt("guestId", spec.guest_id.clone())
        .opt("version", spec.version.clone())
        .opt("numCPUs", spec.num_cpus)
        .opt("numCoresPerSocket", spec.num_cores_per_socket)
        .opt("memoryMB", spec.memory_mb)
        .opt("cpuAllocation", spec.cpu_allocation.as_ref().map(allocation))
        .opt("memoryAllocation", spec.memory_allocation.as_ref().map(allocation))
        .opt("memoryReservationLockedToMax", spec.memory_reservation_locked_to_max)
        .opt("nestedHVEnabled", spec.nested_hv_enabled)
        .opt("cpuHotAddEnabled", spec.cpu_hot_add_enabled)
        .opt("memoryHotAddEnabled", spec.memory_hot_add_enabled)
        .opt("firmware", spec.firmware.clone());

    if let Some(path) = &spec.vm_path_name {
        obj = obj.set("files", Obj::new("VirtualMachineFileInfo").set("vmPathName", path.as_str()).done());
    }

    if let Some(boot) = &spec.boot_options {
        obj = obj.set(
            "bootOptions",
            Obj::new("VirtualMachineBootOptions")
                .opt("enterBIOSSetup", boot.enter_bios_setup)
                .opt("efiSecureBootEnabled", boot.efi_secure_boot_enabled)
                .opt(
                    "bootOrder",
                    boot.boot_order.as_ref().map(|o| o.iter().map(boot_device).collect::<Vec<_>>()),
                )
                .done(),
        );
    }

    if !spec.device_change.is_empty() {
        let mut changes = Vec::with_capacity(spec.device_change.len());
        for change in &spec.device_change {
            changes.push(
                Obj::new("VirtualDeviceConfigSpec")
                    .set("operation", lower(&change.operation)?)
                    .opt("fileOperation", change.file_operation.as_ref().map(lower).transpose()?)
                    .set("device", encode_device(&change.device, switch_uuids))
                    .done(),
            );
        }
        obj = obj.set("deviceChange", changes);
    }

    if let Some(vapp) = &spec.vapp_config {
        let mut props = Vec::with_capacity(vapp.properties.len());
        for p in &vapp.properties {
            props.push(
                Obj::new("VAppPropertySpec")
                    .set("operation", lower(&p.operation)?)
                    .set(
                        "info",
                        Obj::new("VAppPropertyInfo")
                            .set("key", p.info.key)
                            .set("id", p.info.id.as_str())
                            .set("value", p.info.value.as_str())
                            .done(),
                    )
                    .done(),
            );
        }
        obj = obj.set("vAppConfig", Obj::new("VmConfigSpec").set("property", props).done());
    }

    if !spec.extra_config.is_empty() {
        let options: Vec<Value> = spec
            .extra_config
            .iter()
            .map(|o| {
                Obj::new("OptionValue")
                    .set("key", o.key.as_str())
                    .set("value", json!({ "_typeName": "string", "_value": o.value }))
                    .done()
            })
            .collect();
        obj = obj.set("extraConfig", options);
    }

    if let Some(tools) = &spec.tools {
        obj = obj.set(
            "tools",
            Obj::new("ToolsConfigInfo")
                .opt("syncTimeWithHost", tools.sync_time_with_host)
                .opt("toolsUpgradePolicy", tools.tools_upgrade_policy.clone())
                .done(),
        );
    }

    Ok(obj.done())
}

pub fn encode_relocate_spec(spec: &RelocateSpec) -> VsphereResult<Value> {
    Ok(Obj::new("VirtualMachineRelocateSpec")
        .set("pool", moref("ResourcePool", &spec.pool))
        .opt("datastore", spec.datastore.as_deref().map(|d| moref("Datastore", d)))
        .opt("host", spec.host.as_deref().map(|h| moref("HostSystem", h)))
        .opt("diskMoveType", spec.disk_move_type.as_ref().map(lower).transpose()?)
        .done())
}

/// Body of `CloneVM_Task`.
pub fn encode_clone(spec: &CloneSpec, switch_uuids: &HashMap<String, String>) -> VsphereResult<Value> {
    let clone_spec = Obj::new("VirtualMachineCloneSpec")
        .set("location", encode_relocate_spec(&spec.location)?)
        .set("template", false)
        .set("powerOn", spec.power_on)
        .opt("snapshot", spec.snapshot.as_deref().map(|s| moref("VirtualMachineSnapshot", s)))
        .set("config", encode_config_spec(&spec.config, switch_uuids)?)
        .done();
    Ok(json!({
        "folder": moref("Folder", &spec.folder),
        "name": spec.name,
        "spec": clone_spec,
    }))
}

/// Body of `CreateVM_Task`.
pub fn encode_create(spec: &CreateSpec, switch_uuids: &HashMap<String, String>) -> VsphereResult<Value> {
    Ok(Obj::untyped()
        .set("config", encode_config_spec(&spec.config, switch_uuids)?)
        .set("pool", moref("ResourcePool", &spec.pool))
        .opt("host", spec.host.as_deref().map(|h| moref("HostSystem", h)))
        .done())
}

// ── Customization ───────────────────────────────────────────────────

pub fn encode_customization(spec: &CustomizationSpec) -> Value {
    let identity = match &spec.identity {
        Identity::LinuxPrep(prep) => Obj::new("CustomizationLinuxPrep")
            .set("hostName", Obj::new("CustomizationFixedName").set("name", prep.host_name.as_str()).done())
            .set("domain", prep.domain.as_str())
            .set("timeZone", prep.time_zone.as_str())
            .set("hwClockUTC", prep.hw_clock_utc)
            .done(),
        Identity::SysprepText { value } => Obj::new("CustomizationSysprepText").set("value", value.as_str()).done(),
    };

    let nics: Vec<Value> = spec
        .nic_setting_map
        .iter()
        .map(|m| {
            let a = &m.adapter;
            let ip = match &a.ip {
                IpGenerator::FixedIp { ip_address } => {
                    Obj::new("CustomizationFixedIp").set("ipAddress", ip_address.as_str()).done()
                }
                IpGenerator::Dhcp => Obj::new("CustomizationDhcpIpGenerator").done(),
            };
            let ipv6 = a.ipv6.as_ref().map(|v6| {
                let ips: Vec<Value> = v6
                    .ip
                    .iter()
                    .map(|f| {
                        Obj::new("CustomizationFixedIpV6")
                            .set("ipAddress", f.ip_address.as_str())
                            .set("subnetMask", f.subnet_mask)
                            .done()
                    })
                    .collect();
                Obj::new("CustomizationIPSettingsIpV6AddressSpec")
                    .set("ip", ips)
                    .set("gateway", v6.gateway.clone())
                    .done()
            });
            let settings = Obj::new("CustomizationIPSettings")
                .set("ip", ip)
                .opt("subnetMask", a.subnet_mask.clone())
                .set("gateway", a.gateway.clone())
                .opt("ipV6Spec", ipv6)
                .set("dnsServerList", a.dns_server_list.clone())
                .opt("dnsDomain", a.dns_domain.clone())
                .done();
            Obj::new("CustomizationAdapterMapping").set("adapter", settings).done()
        })
        .collect();

    Obj::new("CustomizationSpec")
        .set("identity", identity)
        .set(
            "globalIPSettings",
            Obj::new("CustomizationGlobalIPSettings")
                .set("dnsServerList", spec.global_ip_settings.dns_server_list.clone())
                .set("dnsSuffixList", spec.global_ip_settings.dns_suffix_list.clone())
                .done(),
        )
        .set("nicSettingMap", nics)
        .done()
}

// ── Properties and tasks ────────────────────────────────────────────

/// Assemble [`VmProperties`] from the `config`, `runtime`, `snapshot` and
/// `layoutEx` properties of a VirtualMachine.
pub fn decode_vm_properties(config: &Value, runtime: &Value, snapshot: &Value, layout: &Value) -> VmProperties {
    let hardware = config.get("hardware").cloned().unwrap_or(Value::Null);
    let devices = hardware
        .get("device")
        .and_then(Value::as_array)
        .map(|d| d.iter().filter_map(decode_device).collect())
        .unwrap_or_default();

    let vapp_properties = config.get("vAppConfig").filter(|v| !v.is_null()).map(|vapp| {
        vapp.get("property")
            .and_then(Value::as_array)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|p| {
                        Some(VAppProperty {
                            key: i32_of(p, "key")?,
                            id: str_of(p, "id")?,
                            value: str_of(p, "value").unwrap_or_default(),
                            default_value: str_of(p, "defaultValue").unwrap_or_default(),
                            user_configurable: bool_of(p, "userConfigurable"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    });

    let extra_config = config
        .get("extraConfig")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    let value = o.get("value")?;
                    let value = value
                        .get("_value")
                        .unwrap_or(value)
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_string());
                    Some(OptionValue { key: str_of(o, "key")?, value })
                })
                .collect()
        })
        .unwrap_or_default();

    let boot_order = config
        .get("bootOptions")
        .and_then(|b| b.get("bootOrder"))
        .and_then(Value::as_array)
        .map(|o| o.iter().filter_map(decode_boot_device).collect())
        .unwrap_or_default();

    let power_state = match runtime.get("powerState").and_then(Value::as_str) {
        Some("poweredOn") => VmPowerState::PoweredOn,
        Some("poweredOff") => VmPowerState::PoweredOff,
        Some("suspended") => VmPowerState::Suspended,
        _ => VmPowerState::Unknown,
    };

    let layout_files = layout
        .get("file")
        .and_then(Value::as_array)
        .map(|files| files.iter().filter_map(|f| str_of(f, "name")).collect())
        .unwrap_or_default();

    VmProperties {
        name: str_of(config, "name").unwrap_or_default(),
        power_state,
        template: bool_of(config, "template"),
        annotation: str_of(config, "annotation"),
        guest_id: str_of(config, "guestId"),
        num_cpus: i32_of(&hardware, "numCPU").unwrap_or(0),
        memory_mb: hardware.get("memoryMB").and_then(Value::as_i64).unwrap_or(0),
        firmware: str_of(config, "firmware"),
        devices,
        current_snapshot: snapshot.get("currentSnapshot").and_then(moref_value),
        vapp_properties,
        layout_files,
        extra_config,
        boot_order,
    }
}

/// Decode a vim25 `TaskInfo`. Managed-object results are reduced to their id.
pub fn decode_task_info(task: &TaskRef, v: &Value) -> TaskInfo {
    let status = match v.get("state").and_then(Value::as_str) {
        Some("queued") => TaskStatus::Pending,
        Some("success") => TaskStatus::Succeeded,
        Some("error") => TaskStatus::Failed,
        _ => TaskStatus::Running,
    };
    let result = v.get("result").filter(|r| !r.is_null()).map(|r| match moref_value(r) {
        Some(id) => Value::String(id),
        None => r.clone(),
    });
    let error = v.get("error").filter(|e| !e.is_null()).map(|e| match str_of(e, "localizedMessage") {
        Some(msg) if !msg.is_empty() => Value::String(msg),
        _ => e.clone(),
    });
    TaskInfo {
        task: task.clone(),
        status,
        description: str_of(v, "descriptionId"),
        result,
        error,
        progress: v.get("progress").and_then(Value::as_u64).map(|p| p as u32),
        cancelable: bool_of(v, "cancelable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customize::{AdapterMapping, GlobalIpSettings, IpSettings, LinuxPrep};

    fn disk() -> VirtualDevice {
        VirtualDevice {
            key: -201,
            controller_key: Some(-200),
            unit_number: Some(0),
            label: String::new(),
            kind: DeviceKind::Disk {
                capacity_kb: 1024,
                thin_provisioned: true,
                eagerly_scrub: false,
                file_name: None,
            },
        }
    }

    #[test]
    fn device_wire_shape() {
        let v = encode_device(&disk(), &HashMap::new());
        assert_eq!(v["_typeName"], "VirtualDisk");
        assert_eq!(v["controllerKey"], -200);
        assert_eq!(v["backing"]["thinProvisioned"], true);
        assert_eq!(v["backing"]["diskMode"], "persistent");
        assert!(v.get("deviceInfo").is_none());
    }

    #[test]
    fn devices_decode_back() {
        let scsi = VirtualDevice {
            key: 1000,
            controller_key: None,
            unit_number: None,
            label: "SCSI controller 0".into(),
            kind: DeviceKind::ScsiController { bus_number: 0, controller_type: ScsiControllerType::Pvscsi },
        };
        let nic = VirtualDevice {
            key: 4000,
            controller_key: Some(100),
            unit_number: Some(7),
            label: "Network adapter 1".into(),
            kind: DeviceKind::Ethernet {
                adapter_type: AdapterType::Vmxnet3,
                network: "network-1".into(),
                mac_address: Some("00:50:56:aa:bb:cc".into()),
                address_type: MacAddressType::Manual,
                upt_compatibility_enabled: None,
            },
        };
        for dev in [scsi, nic] {
            let decoded = decode_device(&encode_device(&dev, &HashMap::new())).unwrap();
            assert_eq!(decoded, dev);
        }
    }

    #[test]
    fn distributed_portgroup_backing() {
        let nic = VirtualDevice::new(DeviceKind::Ethernet {
            adapter_type: AdapterType::E1000,
            network: "dvportgroup-12".into(),
            mac_address: None,
            address_type: MacAddressType::Generated,
            upt_compatibility_enabled: None,
        });
        let uuids = HashMap::from([("dvportgroup-12".to_string(), "50 2a".to_string())]);
        let v = encode_device(&nic, &uuids);
        assert_eq!(v["backing"]["_typeName"], "VirtualEthernetCardDistributedVirtualPortBackingInfo");
        assert_eq!(v["backing"]["port"]["portgroupKey"], "dvportgroup-12");
        assert_eq!(decode_device(&v).unwrap().kind, nic.kind);
    }

    #[test]
    fn unknown_devices_are_skipped() {
        assert!(decode_device(&json!({"_typeName": "VirtualKeyboard", "key": 600})).is_none());
    }

    #[test]
    fn config_spec_wire_shape() {
        let spec = VmConfigSpec {
            num_cpus: Some(2),
            firmware: Some("efi".into()),
            device_change: vec![DeviceChange {
                operation: DeviceOperation::Add,
                file_operation: Some(FileOperation::Create),
                device: disk(),
            }],
            extra_config: vec![OptionValue { key: "a".into(), value: "b".into() }],
            ..Default::default()
        };
        let v = encode_config_spec(&spec, &HashMap::new()).unwrap();
        assert_eq!(v["numCPUs"], 2);
        assert_eq!(v["deviceChange"][0]["operation"], "add");
        assert_eq!(v["deviceChange"][0]["fileOperation"], "create");
        assert_eq!(v["extraConfig"][0]["value"]["_value"], "b");
        assert!(v.get("memoryMB").is_none());
    }

    #[test]
    fn linked_clone_wire_shape() {
        let spec = CloneSpec {
            source: "vm-1".into(),
            name: "web".into(),
            folder: "group-v1".into(),
            location: RelocateSpec {
                pool: "resgroup-1".into(),
                datastore: None,
                host: None,
                disk_move_type: Some(DiskMoveType::CreateNewChildDiskBacking),
            },
            snapshot: Some("snapshot-1".into()),
            power_on: false,
            config: VmConfigSpec::default(),
        };
        let v = encode_clone(&spec, &HashMap::new()).unwrap();
        assert_eq!(v["spec"]["location"]["diskMoveType"], "createNewChildDiskBacking");
        assert_eq!(v["spec"]["snapshot"]["value"], "snapshot-1");
        assert_eq!(v["folder"]["type"], "Folder");
    }

    #[test]
    fn customization_wire_shape() {
        let spec = CustomizationSpec {
            identity: Identity::LinuxPrep(LinuxPrep::new("web", "lab.local")),
            global_ip_settings: GlobalIpSettings::default(),
            nic_setting_map: vec![AdapterMapping {
                adapter: IpSettings {
                    ip: IpGenerator::Dhcp,
                    subnet_mask: None,
                    gateway: vec![],
                    ipv6: None,
                    dns_server_list: vec![],
                    dns_domain: None,
                },
            }],
        };
        let v = encode_customization(&spec);
        assert_eq!(v["identity"]["hostName"]["name"], "web");
        assert_eq!(v["identity"]["timeZone"], "UTC");
        assert_eq!(v["nicSettingMap"][0]["adapter"]["ip"]["_typeName"], "CustomizationDhcpIpGenerator");
    }

    #[test]
    fn vm_properties_from_wire() {
        let config = json!({
            "name": "web",
            "template": false,
            "guestId": "ubuntu64Guest",
            "hardware": {"numCPU": 2, "memoryMB": 2048, "device": [
                {"_typeName": "VirtualIDEController", "key": 200, "busNumber": 0},
                {"_typeName": "VirtualKeyboard", "key": 600}
            ]},
            "vAppConfig": {"property": [{"key": 0, "id": "hostname", "userConfigurable": true}]},
            "extraConfig": [{"key": "svga.present", "value": {"_typeName": "string", "_value": "TRUE"}}],
            "bootOptions": {"bootOrder": [{"_typeName": "VirtualMachineBootOptionsBootableCdromDevice"}]}
        });
        let runtime = json!({"powerState": "poweredOn"});
        let snapshot = json!({"currentSnapshot": {"type": "VirtualMachineSnapshot", "value": "snapshot-3"}});
        let layout = json!({"file": [{"name": "[ds1] web/web.vmx"}]});
        let props = decode_vm_properties(&config, &runtime, &snapshot, &layout);
        assert_eq!(props.power_state, VmPowerState::PoweredOn);
        assert_eq!(props.devices.len(), 1);
        assert_eq!(props.current_snapshot.as_deref(), Some("snapshot-3"));
        assert_eq!(props.vapp_properties.unwrap()[0].id, "hostname");
        assert_eq!(props.extra_config[0].value, "TRUE");
        assert_eq!(props.boot_order, vec![BootDevice::Cdrom]);
        assert_eq!(props.layout_files, vec!["[ds1] web/web.vmx"]);
    }

    #[test]
    fn task_info_from_wire() {
        let task = TaskRef("task-9".into());
        let ok = decode_task_info(&task, &json!({"state": "success", "result": {"type": "VirtualMachine", "value": "vm-7"}}));
        assert_eq!(ok.status, TaskStatus::Succeeded);
        assert_eq!(ok.result_id().as_deref(), Some("vm-7"));

        let failed = decode_task_info(&task, &json!({"state": "error", "error": {"localizedMessage": "disk locked"}}));
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message(), "disk locked");
    }
}
