//! Shared types exchanged with the vSphere platform.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::VsphereError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level configuration for connecting to a vCenter / ESXi host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VsphereConfig {
    /// vCenter or ESXi hostname / IP (e.g. "vcenter.lab.local")
    #[serde(rename = "vcenter_server")]
    pub host: String,
    /// Port (default 443)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username (e.g. "administrator@vsphere.local")
    pub username: String,
    /// Password
    pub password: String,
    /// Skip TLS certificate verification (self-signed labs)
    #[serde(default, rename = "insecure_connection")]
    pub insecure: bool,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Datacenter name; may be omitted when the endpoint has exactly one
    #[serde(default)]
    pub datacenter: Option<String>,
}

fn default_port() -> u16 { 443 }
fn default_timeout() -> u64 { 30 }

impl Default for VsphereConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            port: 443,
            insecure: false,
            timeout_secs: 30,
            datacenter: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM Power State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmPowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    #[default]
    #[serde(other)]
    Unknown,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Inventory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatacenterSummary {
    pub datacenter: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmSummary {
    /// Managed-object ID (e.g. "vm-42")
    pub vm: String,
    pub name: String,
    #[serde(default)]
    pub power_state: VmPowerState,
    /// Inventory path of the parent folder, relative to the datacenter VM folder
    #[serde(default)]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSummary {
    pub host: String,
    pub name: String,
    #[serde(default)]
    pub cluster: Option<String>,
    /// Network IDs visible from this host
    #[serde(default)]
    pub networks: Vec<String>,
    /// Datastore IDs mounted on this host
    #[serde(default)]
    pub datastores: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSummary {
    pub network: String,
    pub name: String,
    /// Full inventory path, when the platform reports one
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "type")]
    pub network_type: Option<String>,
    /// Host IDs this network is attached to
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatastoreSummary {
    pub datastore: String,
    pub name: String,
    #[serde(default)]
    pub free_space: Option<u64>,
    #[serde(default)]
    pub capacity: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePoolSummary {
    pub resource_pool: String,
    pub name: String,
    /// Cluster or standalone host ID owning the pool hierarchy
    #[serde(default)]
    pub owner: Option<String>,
    /// Whether this is the owner's root pool ("Resources")
    #[serde(default)]
    pub root: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderSummary {
    pub folder: String,
    pub name: String,
    /// Path relative to the datacenter VM folder; empty for the root
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSummary {
    pub cluster: String,
    pub name: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Content Library
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentLibrary {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub lib_type: Option<String>,
    /// Datastore ID backing the library storage
    #[serde(default)]
    pub datastore: Option<String>,
}

impl ContentLibrary {
    pub fn is_local(&self) -> bool {
        self.lib_type.as_deref() == Some("LOCAL")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub library_id: Option<String>,
    #[serde(default, rename = "type")]
    pub item_type: Option<String>,
    /// Storage file names of the item
    #[serde(default)]
    pub files: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reference to an asynchronous platform task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(pub String);

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Blocked,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task: TaskRef,
    pub status: TaskStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub progress: Option<u32>,
    #[serde(default)]
    pub cancelable: bool,
}

impl TaskInfo {
    /// Managed-object ID returned by create/clone tasks.
    pub fn result_id(&self) -> Option<String> {
        match self.result.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(map) => map
                .get("value")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Object(map)) => map
                .get("message")
                .or_else(|| map.get("localizedMessage"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| serde_json::Value::Object(map.clone()).to_string()),
            Some(other) => other.to_string(),
            None => "task failed without a fault".into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Virtual devices
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScsiControllerType {
    #[serde(rename = "lsilogic")]
    LsiLogic,
    #[serde(rename = "lsilogic-sas")]
    LsiLogicSas,
    #[serde(rename = "buslogic")]
    BusLogic,
    #[serde(rename = "pvscsi")]
    Pvscsi,
}

/// Controller kinds that can be requested for new disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskControllerType {
    Scsi(ScsiControllerType),
    Nvme,
}

impl FromStr for DiskControllerType {
    type Err = VsphereError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nvme" => Ok(Self::Nvme),
            "scsi" | "lsilogic" => Ok(Self::Scsi(ScsiControllerType::LsiLogic)),
            "lsilogic-sas" => Ok(Self::Scsi(ScsiControllerType::LsiLogicSas)),
            "buslogic" => Ok(Self::Scsi(ScsiControllerType::BusLogic)),
            "pvscsi" => Ok(Self::Scsi(ScsiControllerType::Pvscsi)),
            other => Err(VsphereError::config(format!("unknown disk controller type '{other}'"))),
        }
    }
}

impl fmt::Display for DiskControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nvme => "nvme",
            Self::Scsi(ScsiControllerType::LsiLogic) => "lsilogic",
            Self::Scsi(ScsiControllerType::LsiLogicSas) => "lsilogic-sas",
            Self::Scsi(ScsiControllerType::BusLogic) => "buslogic",
            Self::Scsi(ScsiControllerType::Pvscsi) => "pvscsi",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    E1000,
    E1000e,
    Pcnet32,
    Vmxnet,
    Vmxnet2,
    Vmxnet3,
    Vmxnet3vrdma,
    Sriov,
}

impl FromStr for AdapterType {
    type Err = VsphereError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "e1000" => Ok(Self::E1000),
            "e1000e" => Ok(Self::E1000e),
            "pcnet32" => Ok(Self::Pcnet32),
            "vmxnet" => Ok(Self::Vmxnet),
            "vmxnet2" => Ok(Self::Vmxnet2),
            "vmxnet3" => Ok(Self::Vmxnet3),
            "vmxnet3vrdma" => Ok(Self::Vmxnet3vrdma),
            "sriov" => Ok(Self::Sriov),
            other => Err(VsphereError::config(format!("unknown network card type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MacAddressType {
    #[default]
    Generated,
    Manual,
    Assigned,
}

/// Concrete device payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    ScsiController {
        bus_number: i32,
        controller_type: ScsiControllerType,
    },
    NvmeController {
        bus_number: i32,
    },
    SataController {
        bus_number: i32,
    },
    IdeController {
        bus_number: i32,
    },
    UsbController {
        ehci_enabled: bool,
    },
    UsbXhciController,
    Disk {
        capacity_kb: i64,
        thin_provisioned: bool,
        eagerly_scrub: bool,
        #[serde(default)]
        file_name: Option<String>,
    },
    Ethernet {
        adapter_type: AdapterType,
        network: String,
        #[serde(default)]
        mac_address: Option<String>,
        #[serde(default)]
        address_type: MacAddressType,
        #[serde(default)]
        upt_compatibility_enabled: Option<bool>,
    },
    Cdrom {
        #[serde(default)]
        iso_file: Option<String>,
        #[serde(default)]
        connected: bool,
    },
    Floppy {
        #[serde(default)]
        image_file: Option<String>,
    },
    VideoCard {
        video_ram_kb: i64,
    },
    PciPassthrough {
        #[serde(default)]
        vgpu_profile: Option<String>,
    },
}

/// Bus families that hand out bus numbers to controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusFamily {
    Scsi,
    Nvme,
    Sata,
    Ide,
}

impl BusFamily {
    pub fn max_buses(self) -> i32 {
        match self {
            Self::Ide => 2,
            Self::Scsi | Self::Nvme | Self::Sata => 4,
        }
    }

    /// Number of unit slots per controller of this family.
    pub fn max_units(self) -> i32 {
        match self {
            Self::Scsi => 16,
            Self::Nvme => 15,
            Self::Sata => 30,
            Self::Ide => 2,
        }
    }

    /// Unit number held by the controller itself.
    pub fn reserved_unit(self) -> Option<i32> {
        match self {
            Self::Scsi => Some(7),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualDevice {
    pub key: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl VirtualDevice {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            key: 0,
            controller_key: None,
            unit_number: None,
            label: String::new(),
            kind,
        }
    }

    /// Bus family and bus number when this device is a storage controller.
    pub fn controller_bus(&self) -> Option<(BusFamily, i32)> {
        match self.kind {
            DeviceKind::ScsiController { bus_number, .. } => Some((BusFamily::Scsi, bus_number)),
            DeviceKind::NvmeController { bus_number } => Some((BusFamily::Nvme, bus_number)),
            DeviceKind::SataController { bus_number } => Some((BusFamily::Sata, bus_number)),
            DeviceKind::IdeController { bus_number } => Some((BusFamily::Ide, bus_number)),
            _ => None,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk { .. })
    }

    pub fn is_ethernet(&self) -> bool {
        matches!(self.kind, DeviceKind::Ethernet { .. })
    }

    pub fn is_cdrom(&self) -> bool {
        matches!(self.kind, DeviceKind::Cdrom { .. })
    }

    pub fn is_floppy(&self) -> bool {
        matches!(self.kind, DeviceKind::Floppy { .. })
    }

    pub fn is_vgpu(&self) -> bool {
        matches!(self.kind, DeviceKind::PciPassthrough { vgpu_profile: Some(_) })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceOperation {
    Add,
    Edit,
    Remove,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Destroy,
}

/// One entry of a reconfigure / create device change list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VAppProperty {
    pub key: i32,
    pub id: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub default_value: String,
    #[serde(default)]
    pub user_configurable: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArrayOperation {
    Add,
    Edit,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VAppPropertySpec {
    pub operation: ArrayOperation,
    pub info: VAppProperty,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VAppConfigSpec {
    pub properties: Vec<VAppPropertySpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceAllocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootDevice {
    Disk { device_key: i32 },
    Cdrom,
    Floppy,
    Ethernet { device_key: i32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BootOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enter_bios_setup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi_secure_boot_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<Vec<BootDevice>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_time_with_host: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_upgrade_policy: Option<String>,
}

/// Reconfigure payload. Unset fields are left untouched by the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VmConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// VM home path, e.g. "[datastore1]"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_path_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cores_per_socket: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_allocation: Option<ResourceAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_allocation: Option<ResourceAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reservation_locked_to_max: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_hv_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_hot_add_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_hot_add_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_options: Option<BootOptions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_change: Vec<DeviceChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vapp_config: Option<VAppConfigSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_config: Vec<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,
}

/// Live VM properties, always fetched on demand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VmProperties {
    pub name: String,
    #[serde(default)]
    pub power_state: VmPowerState,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub guest_id: Option<String>,
    #[serde(default)]
    pub num_cpus: i32,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub devices: Vec<VirtualDevice>,
    /// Current snapshot ID, if any
    #[serde(default)]
    pub current_snapshot: Option<String>,
    /// vApp property schema; `None` when the VM has no vApp configuration
    #[serde(default)]
    pub vapp_properties: Option<Vec<VAppProperty>>,
    /// Datastore paths of the VM files ("[ds] dir/name.vmx", ...)
    #[serde(default)]
    pub layout_files: Vec<String>,
    #[serde(default)]
    pub extra_config: Vec<OptionValue>,
    #[serde(default)]
    pub boot_order: Vec<BootDevice>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Clone / Create
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DiskMoveType {
    CreateNewChildDiskBacking,
    MoveAllDiskBackingsAndDisallowSharing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelocateSpec {
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<DiskMoveType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloneSpec {
    pub source: String,
    pub name: String,
    pub folder: String,
    pub location: RelocateSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub power_on: bool,
    pub config: VmConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateSpec {
    pub folder: String,
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub config: VmConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub memory: bool,
    pub quiesce: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Content library imports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OvfLibraryItemSpec {
    pub source_vm: String,
    pub library_id: String,
    /// Existing item to update instead of creating a new one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_item_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplatePlacement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmTemplateLibrarySpec {
    pub source_vm: String,
    pub library_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub placement: TemplatePlacement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_home_datastore: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Datastore files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A file addressed by datacenter + datastore name + relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreFile {
    pub datacenter: String,
    pub datastore: String,
    pub path: String,
}

impl fmt::Display for DatastoreFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_type_names() {
        assert_eq!(
            "scsi".parse::<DiskControllerType>().unwrap(),
            DiskControllerType::Scsi(ScsiControllerType::LsiLogic)
        );
        assert_eq!("PVSCSI".parse::<DiskControllerType>().unwrap().to_string(), "pvscsi");
        assert_eq!("nvme".parse::<DiskControllerType>().unwrap(), DiskControllerType::Nvme);
        assert!("floppy".parse::<DiskControllerType>().is_err());
    }

    #[test]
    fn device_json_shape() {
        let dev = VirtualDevice {
            key: -200,
            controller_key: Some(1000),
            unit_number: Some(0),
            label: String::new(),
            kind: DeviceKind::Disk {
                capacity_kb: 1024,
                thin_provisioned: true,
                eagerly_scrub: false,
                file_name: None,
            },
        };
        let v = serde_json::to_value(&dev).unwrap();
        assert_eq!(v["type"], "disk");
        assert_eq!(v["controller_key"], 1000);
        let back: VirtualDevice = serde_json::from_value(v).unwrap();
        assert_eq!(back, dev);
    }

    #[test]
    fn task_result_id() {
        let info = TaskInfo {
            task: TaskRef("task-1".into()),
            status: TaskStatus::Succeeded,
            description: None,
            result: Some(serde_json::json!({"type": "VirtualMachine", "value": "vm-7"})),
            error: None,
            progress: None,
            cancelable: false,
        };
        assert_eq!(info.result_id().as_deref(), Some("vm-7"));
    }

    #[test]
    fn power_state_unknown_fallback() {
        let s: VmPowerState = serde_json::from_str("\"WEIRD\"").unwrap();
        assert_eq!(s, VmPowerState::Unknown);
    }
}
